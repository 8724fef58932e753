use crate::fetch::{ArtifactMetadata, FolderLister, MetadataFetcher};
use crate::InventoryError;
use reqwest::blocking::Client;
use reqwest::StatusCode;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct ArtifactRepoConfig {
    /// Server root, e.g. `https://artifacts.example.com/artifactory`.
    pub base_url: String,
    pub token: Option<String>,
    pub timeout: Duration,
}

impl ArtifactRepoConfig {
    /// `None` when `PEF_INVENTORY_ARTIFACT_REPO_URL` is unset.
    pub fn from_env() -> Option<Self> {
        let base_url = match std::env::var("PEF_INVENTORY_ARTIFACT_REPO_URL") {
            Ok(u) if !u.is_empty() => u,
            _ => return None,
        };
        let token = std::env::var("PEF_INVENTORY_ARTIFACT_REPO_TOKEN").ok().filter(|t| !t.is_empty());
        Some(Self {
            base_url,
            token,
            timeout: Duration::from_secs(60),
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Debug, Deserialize)]
struct FolderInfo {
    #[serde(default)]
    children: Vec<FolderChild>,
}

#[derive(Debug, Deserialize)]
struct FolderChild {
    uri: String,
    #[serde(default)]
    folder: bool,
}

#[derive(Debug, Deserialize)]
struct Checksums {
    md5: String,
}

#[derive(Debug, Deserialize)]
struct FileInfo {
    repo: String,
    path: String,
    created: String,
    checksums: Checksums,
}

/// Reads PEF metadata through the repository's storage API. Paths look like
/// `<repo>/<folder>/...`, the same form the studio inventory uses.
pub struct ArtifactRepoFetcher {
    http: Client,
    base_url: String,
    token: Option<String>,
    timeout: Duration,
}

impl ArtifactRepoFetcher {
    pub fn new(config: ArtifactRepoConfig) -> Result<Self, InventoryError> {
        let http = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| InventoryError::Config(format!("artifact repository client: {}", e)))?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.token,
            timeout: config.timeout,
        })
    }

    fn storage_url(&self, path: &str) -> String {
        format!("{}/api/storage/{}", self.base_url, path.trim_matches('/'))
    }

    fn get<T: for<'de> Deserialize<'de>>(&self, path: &str) -> Result<T, InventoryError> {
        let url = self.storage_url(path);
        debug!("[artifact-repo] GET {}", url);
        let mut request = self.http.get(&url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request.send().map_err(|e| self.request_error(path, e))?;
        let status = response.status();
        if !status.is_success() {
            let retryable = status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS;
            return Err(InventoryError::fetch(path, format!("HTTP {}", status), retryable));
        }
        response.json::<T>().map_err(|e| self.request_error(path, e))
    }

    fn request_error(&self, path: &str, err: reqwest::Error) -> InventoryError {
        if err.is_timeout() {
            InventoryError::Timeout {
                path: path.to_string(),
                after: self.timeout,
            }
        } else {
            InventoryError::fetch(path, err.to_string(), err.is_connect() || err.is_request())
        }
    }

    fn files(&self, folder: &str) -> Result<Vec<String>, InventoryError> {
        let info: FolderInfo = self.get(folder)?;
        Ok(info
            .children
            .into_iter()
            .filter(|c| !c.folder)
            .map(|c| c.uri.trim_start_matches('/').to_string())
            .collect())
    }

    fn file_info(&self, folder: &str, name: &str) -> Result<FileInfo, InventoryError> {
        self.get(&format!("{}/{}", folder.trim_end_matches('/'), name))
    }
}

impl MetadataFetcher for ArtifactRepoFetcher {
    /// `path` is a folder; the metadata is that of its first `.pef` file.
    fn fetch_metadata(&self, path: &str) -> Result<ArtifactMetadata, InventoryError> {
        let pef = self
            .files(path)?
            .into_iter()
            .find(|name| name.ends_with(".pef"))
            .ok_or_else(|| InventoryError::MissingPefFile { path: path.to_string() })?;
        let info = self.file_info(path, &pef)?;
        Ok(ArtifactMetadata::new(
            info.checksums.md5.to_ascii_lowercase(),
            info.created,
            format!("{}/{}", info.repo, info.path.trim_start_matches('/')),
        ))
    }
}

impl FolderLister for ArtifactRepoFetcher {
    fn list_hashes(&self, folder: &str) -> Result<BTreeMap<String, String>, InventoryError> {
        let mut hashes = BTreeMap::new();
        for name in self.files(folder)? {
            let info = self.file_info(folder, &name)?;
            hashes.insert(name, info.checksums.md5.to_ascii_lowercase());
        }
        Ok(hashes)
    }
}
