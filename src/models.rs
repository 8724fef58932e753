use crate::diff::ARTIFACTS_REPO_PLACEHOLDER;
use crate::fetch::FolderLister;
use crate::record::InventoryRow;
use crate::table::TableRow;
use crate::InventoryError;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use tracing::info;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileHashDiff {
    /// Basenames present on both sides with different digests.
    pub differing: BTreeSet<String>,
    pub cloud_only: BTreeSet<String>,
    pub studio_only: BTreeSet<String>,
}

impl FileHashDiff {
    pub fn is_same(&self) -> bool {
        self.differing.is_empty() && self.cloud_only.is_empty() && self.studio_only.is_empty()
    }
}

pub fn compare_file_hashes(cloud: &BTreeMap<String, String>, studio: &BTreeMap<String, String>) -> FileHashDiff {
    let differing = cloud
        .iter()
        .filter(|(name, hash)| studio.get(*name).is_some_and(|other| other != *hash))
        .map(|(name, _)| name.clone())
        .collect();
    FileHashDiff {
        differing,
        cloud_only: cloud.keys().filter(|k| !studio.contains_key(*k)).cloned().collect(),
        studio_only: studio.keys().filter(|k| !cloud.contains_key(*k)).cloned().collect(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelComparisonRow {
    pub cloud_model_name: String,
    pub studio_model_name: String,
    pub cloud_path: String,
    pub studio_path: String,
    pub is_same: bool,
    pub differing_files: Vec<String>,
    pub cloud_only_files: Vec<String>,
    pub studio_only_files: Vec<String>,
}

/// Cloud checkpoint name -> studio checkpoint name, for models renamed between systems.
pub fn load_model_mappings(path: &Path) -> Result<BTreeMap<String, String>, InventoryError> {
    let text = fs::read_to_string(path)?;
    if text.trim().is_empty() {
        return Ok(BTreeMap::new());
    }
    let mappings: Option<BTreeMap<String, String>> = serde_yaml::from_str(&text)?;
    Ok(mappings.unwrap_or_default())
}

pub fn cloud_model_paths(rows: &[InventoryRow]) -> BTreeMap<String, BTreeSet<String>> {
    let mut models: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for (name, paths) in rows.iter().flat_map(|row| row.cloud_models.iter()) {
        models.entry(name.clone()).or_default().extend(paths.iter().cloned());
    }
    models
}

/// Rows without `model_checkpoint_name` or `model_path` are skipped.
pub fn studio_model_paths(rows: &[TableRow], artifacts_repo: &str) -> BTreeMap<String, String> {
    rows.iter()
        .filter_map(|row| {
            let name = row.text("model_checkpoint_name")?;
            let path = row.model_path()?;
            Some((name.into_owned(), path.replace(ARTIFACTS_REPO_PLACEHOLDER, artifacts_repo)))
        })
        .collect()
}

/// Compares each mapped pair of model folders, plus every model present under the same
/// name on both sides. A cloud name with several paths yields one row per path.
/// `studio_lister` handles non-`gs://` studio paths.
pub fn compare_models(
    cloud_models: &BTreeMap<String, BTreeSet<String>>,
    studio_models: &BTreeMap<String, String>,
    mappings: &BTreeMap<String, String>,
    cloud_lister: &dyn FolderLister,
    studio_lister: &dyn FolderLister,
) -> Result<Vec<ModelComparisonRow>, InventoryError> {
    let mut pairs = mappings.clone();
    for name in cloud_models.keys().filter(|n| studio_models.contains_key(*n)) {
        pairs.insert(name.clone(), name.clone());
    }

    let mut rows = Vec::with_capacity(pairs.len());
    for (cloud_name, studio_name) in &pairs {
        let cloud_paths = cloud_models
            .get(cloud_name)
            .filter(|paths| !paths.is_empty())
            .ok_or_else(|| InventoryError::invalid_field("cloud_model_name", cloud_name, "not found in cloud models"))?;
        let studio_path = studio_models
            .get(studio_name)
            .ok_or_else(|| InventoryError::invalid_field("studio_model_name", studio_name, "not found in studio models"))?;

        let studio_hashes = if studio_path.starts_with("gs://") {
            cloud_lister.list_hashes(studio_path)?
        } else {
            studio_lister.list_hashes(studio_path)?
        };
        for cloud_path in cloud_paths {
            let cloud_hashes = cloud_lister.list_hashes(cloud_path)?;
            let diff = compare_file_hashes(&cloud_hashes, &studio_hashes);
            info!(
                "[models] {} ({}) vs {}: {}",
                cloud_name,
                cloud_path,
                studio_name,
                if diff.is_same() { "same" } else { "different" }
            );
            rows.push(ModelComparisonRow {
                cloud_model_name: cloud_name.clone(),
                studio_model_name: studio_name.clone(),
                cloud_path: cloud_path.clone(),
                studio_path: studio_path.clone(),
                is_same: diff.is_same(),
                differing_files: diff.differing.into_iter().collect(),
                cloud_only_files: diff.cloud_only.into_iter().collect(),
                studio_only_files: diff.studio_only.into_iter().collect(),
            });
        }
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn hashes(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    /// One `(name, path)` pair per entry; repeated names collect several paths.
    fn models(entries: &[(&str, &str)]) -> BTreeMap<String, BTreeSet<String>> {
        let mut models: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for (name, path) in entries {
            models.entry(name.to_string()).or_default().insert(path.to_string());
        }
        models
    }

    struct Folders {
        folders: BTreeMap<String, BTreeMap<String, String>>,
        listed: Mutex<Vec<String>>,
    }

    impl FolderLister for Folders {
        fn list_hashes(&self, folder: &str) -> Result<BTreeMap<String, String>, InventoryError> {
            self.listed.lock().unwrap().push(folder.to_string());
            self.folders
                .get(folder)
                .cloned()
                .ok_or_else(|| InventoryError::fetch(folder, "no such folder", false))
        }
    }

    #[test]
    fn test_compare_file_hashes_splits_by_side() {
        let cloud = hashes(&[("config.json", "a"), ("model.safetensors", "b"), ("README.md", "c")]);
        let studio = hashes(&[("config.json", "a"), ("model.safetensors", "x"), ("tokenizer.json", "t")]);
        let diff = compare_file_hashes(&cloud, &studio);
        assert_eq!(diff.differing, BTreeSet::from(["model.safetensors".to_string()]));
        assert_eq!(diff.cloud_only, BTreeSet::from(["README.md".to_string()]));
        assert_eq!(diff.studio_only, BTreeSet::from(["tokenizer.json".to_string()]));
        assert!(!diff.is_same());
        assert!(compare_file_hashes(&cloud, &cloud).is_same());
    }

    #[test]
    fn test_compare_models_uses_mappings_and_shared_names() {
        let cloud_models = models(&[("llama-70b", "gs://ckpts/llama-70b/"), ("mistral", "gs://ckpts/mistral/")]);
        let studio_models = hashes(&[("Meta-Llama-70B", "repo/models/llama/"), ("mistral", "gs://studio/mistral/")]);
        let mappings = hashes(&[("llama-70b", "Meta-Llama-70B")]);

        let gcs = Folders {
            folders: BTreeMap::from([
                ("gs://ckpts/llama-70b/".to_string(), hashes(&[("w.bin", "1")])),
                ("gs://ckpts/mistral/".to_string(), hashes(&[("w.bin", "2")])),
                ("gs://studio/mistral/".to_string(), hashes(&[("w.bin", "2")])),
            ]),
            listed: Mutex::new(Vec::new()),
        };
        let repo = Folders {
            folders: BTreeMap::from([("repo/models/llama/".to_string(), hashes(&[("w.bin", "9")]))]),
            listed: Mutex::new(Vec::new()),
        };

        let rows = compare_models(&cloud_models, &studio_models, &mappings, &gcs, &repo).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].cloud_model_name, "llama-70b");
        assert!(!rows[0].is_same);
        assert_eq!(rows[0].differing_files, vec!["w.bin".to_string()]);
        assert_eq!(rows[1].cloud_model_name, "mistral");
        assert!(rows[1].is_same);
        assert_eq!(*repo.listed.lock().unwrap(), vec!["repo/models/llama/".to_string()]);
    }

    #[test]
    fn test_each_cloud_path_of_a_model_gets_a_row() {
        let cloud_models = models(&[("mistral", "gs://ckpts/mistral-v1/"), ("mistral", "gs://ckpts/mistral-v2/")]);
        let studio_models = hashes(&[("mistral", "gs://studio/mistral/")]);
        let gcs = Folders {
            folders: BTreeMap::from([
                ("gs://ckpts/mistral-v1/".to_string(), hashes(&[("w.bin", "1")])),
                ("gs://ckpts/mistral-v2/".to_string(), hashes(&[("w.bin", "2")])),
                ("gs://studio/mistral/".to_string(), hashes(&[("w.bin", "2")])),
            ]),
            listed: Mutex::new(Vec::new()),
        };
        let rows = compare_models(&cloud_models, &studio_models, &BTreeMap::new(), &gcs, &gcs).unwrap();
        let outcome: Vec<(&str, bool)> = rows.iter().map(|r| (r.cloud_path.as_str(), r.is_same)).collect();
        assert_eq!(outcome, vec![("gs://ckpts/mistral-v1/", false), ("gs://ckpts/mistral-v2/", true)]);
    }

    #[test]
    fn test_unknown_mapped_model_is_an_error() {
        let empty = Folders {
            folders: BTreeMap::new(),
            listed: Mutex::new(Vec::new()),
        };
        let mappings = hashes(&[("ghost", "Ghost")]);
        let result = compare_models(&BTreeMap::new(), &BTreeMap::new(), &mappings, &empty, &empty);
        assert!(matches!(result, Err(InventoryError::InvalidField { .. })));
    }

    #[test]
    fn test_studio_model_paths_resolve_repo() {
        let rows: Vec<TableRow> = serde_json::from_value(serde_json::json!([
            {"model_checkpoint_name": "Meta-Llama-70B", "model_path": "{{ARTIFACTS_REPO}}/models/llama/"},
            {"model_checkpoint_name": "no-path"},
        ]))
        .unwrap();
        assert_eq!(
            studio_model_paths(&rows, "repo"),
            hashes(&[("Meta-Llama-70B", "repo/models/llama/")])
        );
    }

    #[test]
    fn test_load_model_mappings_accepts_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mappings.yaml");
        fs::write(&path, "").unwrap();
        assert!(load_model_mappings(&path).unwrap().is_empty());
        fs::write(&path, "llama-70b: Meta-Llama-70B\n").unwrap();
        assert_eq!(load_model_mappings(&path).unwrap().len(), 1);
    }
}
