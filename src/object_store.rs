use crate::fetch::{ArtifactMetadata, FolderLister, MetadataFetcher};
use crate::InventoryError;
use aws_config::Region;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::primitives::DateTimeFormat;
use aws_sdk_s3::types::Object;
use aws_sdk_s3::Client;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;
use tracing::debug;

/// Google Cloud Storage's S3-interoperable XML endpoint.
pub const GCS_INTEROP_ENDPOINT: &str = "https://storage.googleapis.com";

#[derive(Debug, Clone)]
pub struct ObjectStoreConfig {
    pub region: String,
    pub endpoint: Option<String>,
    pub timeout: Duration,
}

impl ObjectStoreConfig {
    /// `PEF_INVENTORY_S3_ENDPOINT=` (empty) talks to AWS itself.
    pub fn from_env() -> Self {
        let region = std::env::var("PEF_INVENTORY_S3_REGION").unwrap_or_else(|_| "us-east-1".to_string());
        let endpoint = match std::env::var("PEF_INVENTORY_S3_ENDPOINT") {
            Ok(e) if e.is_empty() => None,
            Ok(e) => Some(e),
            Err(_) => Some(GCS_INTEROP_ENDPOINT.to_string()),
        };
        Self {
            region,
            endpoint,
            timeout: Duration::from_secs(60),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Splits `gs://bucket/key` or `s3://bucket/key`.
pub fn parse_object_url(url: &str) -> Result<(&str, &str), InventoryError> {
    let rest = url
        .strip_prefix("gs://")
        .or_else(|| url.strip_prefix("s3://"))
        .ok_or_else(|| InventoryError::invalid_field("path", url, "expected a gs:// or s3:// URL"))?;
    match rest.split_once('/') {
        Some((bucket, key)) if !bucket.is_empty() => Ok((bucket, key)),
        _ => Err(InventoryError::invalid_field("path", url, "missing bucket or object key")),
    }
}

/// Lowercase hex md5 from an ETag, which is either hex already or base64. Multipart
/// ETags carry no whole-object digest.
pub fn md5_hex_from_etag(etag: &str) -> Option<String> {
    let etag = etag.trim().trim_matches('"');
    if etag.len() == 32 && etag.chars().all(|c| c.is_ascii_hexdigit()) {
        return Some(etag.to_ascii_lowercase());
    }
    let bytes = STANDARD.decode(etag).ok()?;
    if bytes.len() != 16 {
        return None;
    }
    Some(bytes.iter().map(|b| format!("{:02x}", b)).collect())
}

fn transport_error<E>(path: &str, err: SdkError<E, HttpResponse>) -> InventoryError
where
    E: std::error::Error + Send + Sync + 'static,
{
    let retryable = match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => true,
        SdkError::ServiceError(ctx) => ctx.raw().status().is_server_error(),
        _ => false,
    };
    InventoryError::fetch(path, DisplayErrorContext(&err).to_string(), retryable)
}

/// Object metadata via `HeadObject`, for `gs://` and `s3://` PEF paths.
#[derive(Clone)]
pub struct ObjectStoreFetcher {
    client: Client,
    runtime: Arc<Runtime>,
    timeout: Duration,
}

impl ObjectStoreFetcher {
    pub fn new(config: ObjectStoreConfig) -> Result<Self, InventoryError> {
        let runtime = Runtime::new().map_err(|e| InventoryError::Other(format!("tokio runtime error: {}", e)))?;
        let region = Region::new(config.region.clone());
        let base_config = runtime.block_on(aws_config::from_env().region(region.clone()).load());

        let mut s3_builder = aws_sdk_s3::config::Builder::from(&base_config).region(region);
        if let Some(endpoint) = &config.endpoint {
            s3_builder = s3_builder.endpoint_url(endpoint);
            s3_builder = s3_builder.force_path_style(true);
        }

        Ok(Self {
            client: Client::from_conf(s3_builder.build()),
            runtime: Arc::new(runtime),
            timeout: config.timeout,
        })
    }

    fn block_on<T, E, F>(&self, path: &str, request: F) -> Result<T, InventoryError>
    where
        F: Future<Output = Result<T, SdkError<E, HttpResponse>>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        self.runtime
            .block_on(tokio::time::timeout(self.timeout, request))
            .map_err(|_| InventoryError::Timeout {
                path: path.to_string(),
                after: self.timeout,
            })?
            .map_err(|e| transport_error(path, e))
    }

    fn list_objects(&self, url: &str) -> Result<Vec<Object>, InventoryError> {
        let (bucket, prefix) = parse_object_url(url)?;
        let mut token: Option<String> = None;
        let mut objects = Vec::new();

        loop {
            let mut request = self.client.list_objects_v2().bucket(bucket).prefix(prefix);
            if let Some(ref cont) = token {
                request = request.continuation_token(cont);
            }

            let resp = self.block_on(url, request.send())?;
            objects.extend(resp.contents().iter().cloned());

            if resp.is_truncated().unwrap_or(false) {
                token = resp.next_continuation_token().map(|s| s.to_string());
            } else {
                break;
            }
        }

        Ok(objects)
    }
}

impl MetadataFetcher for ObjectStoreFetcher {
    fn fetch_metadata(&self, path: &str) -> Result<ArtifactMetadata, InventoryError> {
        let (bucket, key) = parse_object_url(path)?;
        debug!("[object-store] HEAD {}", path);
        let head = self.block_on(path, self.client.head_object().bucket(bucket).key(key).send())?;

        let content_hash = head
            .e_tag()
            .and_then(md5_hex_from_etag)
            .ok_or_else(|| InventoryError::fetch(path, "object has no md5 ETag", false))?;
        let created_at = head
            .last_modified()
            .ok_or_else(|| InventoryError::fetch(path, "object has no modification time", false))?
            .fmt(DateTimeFormat::DateTime)
            .map_err(|e| InventoryError::fetch(path, e.to_string(), false))?;

        Ok(ArtifactMetadata::new(content_hash, created_at, path))
    }
}

impl FolderLister for ObjectStoreFetcher {
    fn list_hashes(&self, folder: &str) -> Result<BTreeMap<String, String>, InventoryError> {
        let mut hashes = BTreeMap::new();
        for object in self.list_objects(folder)? {
            let Some(key) = object.key() else { continue };
            let name = key.rsplit('/').next().unwrap_or(key);
            if name.is_empty() {
                continue;
            }
            if let Some(md5) = object.e_tag().and_then(md5_hex_from_etag) {
                hashes.insert(name.to_string(), md5);
            }
        }
        Ok(hashes)
    }
}
