use pef_inventory::cache::MetadataCache;
use pef_inventory::compare::InventoryComparer;
use pef_inventory::diff::ArtifactDiffEngine;
use pef_inventory::fetch::{ArtifactMetadata, MetadataFetcher};
use pef_inventory::record::{InventoryRow, PefEntry};
use pef_inventory::report::{CLOUD_ONLY_OUTPUT, COMMON_OUTPUT, ONBOARDING_OUTPUT, STUDIO_ONLY_OUTPUT};
use pef_inventory::table::{read_studio_table, read_table, write_table, StudioFilter, TableRow};
use pef_inventory::{InventoryError, InventoryKey};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

/// Serves fixed metadata and records every path it is asked for.
struct RecordingFetcher {
    entries: BTreeMap<String, ArtifactMetadata>,
    requested: Mutex<Vec<String>>,
}

impl RecordingFetcher {
    fn new(entries: &[(&str, &str, &str)]) -> Self {
        Self {
            entries: entries
                .iter()
                .map(|(path, hash, created)| (path.to_string(), ArtifactMetadata::new(*hash, *created, *path)))
                .collect(),
            requested: Mutex::new(Vec::new()),
        }
    }

    fn requests(&self) -> usize {
        self.requested.lock().unwrap().len()
    }
}

impl MetadataFetcher for RecordingFetcher {
    fn fetch_metadata(&self, path: &str) -> Result<ArtifactMetadata, InventoryError> {
        self.requested.lock().unwrap().push(path.to_string());
        self.entries
            .get(path)
            .cloned()
            .ok_or_else(|| InventoryError::fetch(path, "exit status 1", false))
    }
}

fn cloud_row(app: &str, seq: u32, batch_sizes: &[u32]) -> InventoryRow {
    let key = InventoryKey::new(app, "70B", false, seq);
    InventoryRow {
        id: key.to_string(),
        group_id: key.group_id(),
        model_app_name: app.to_string(),
        experts: vec!["Llama-3-70B".to_string()],
        deployments: vec!["east".to_string()],
        param_count: "70B".to_string(),
        max_seq_length: seq,
        max_seq_length_cloud: format!("{}k", seq / 1024),
        spec_decoding: false,
        batch_sizes: batch_sizes.to_vec(),
        cloud_pefs_json: batch_sizes
            .iter()
            .map(|bs| {
                let entry = PefEntry {
                    pef_path: format!("gs://pefs/{}/bs{}.pef", seq, bs),
                    copy_pef: None,
                    jira_ticket: None,
                };
                (*bs, entry)
            })
            .collect(),
        pefs: Vec::new(),
        copy_pefs: Vec::new(),
        draft_experts: Vec::new(),
        checkpoints: Vec::new(),
        cloud_models: BTreeMap::new(),
    }
}

fn studio_rows() -> Vec<TableRow> {
    serde_json::from_value(json!([
        {
            "model_app_name": "Llama 3 Experts", "param_count": "70B", "spec_decoding": "False",
            "max_seq_length": "8192", "batch_sizes": "[1, 4]", "vocab_size": "128256",
            "pef_path": "{{ARTIFACTS_REPO}}/pefs/llama-8k", "model_path": "{{ARTIFACTS_REPO}}/models/llama",
            "mode": "infer", "rdu_arch": "sn40-16", "model_parallel_rdus": "16"
        },
        {
            "model_app_name": "Llama 3 Experts", "param_count": "70B", "spec_decoding": "False",
            "max_seq_length": "4096", "batch_sizes": "[1]",
            "pef_path": "{{ARTIFACTS_REPO}}/pefs/llama-4k", "model_path": "{{ARTIFACTS_REPO}}/models/llama",
            "mode": "infer", "rdu_arch": "sn40-16", "model_parallel_rdus": "16"
        },
        {
            "model_app_name": "Llama 3 Experts", "param_count": "70B", "spec_decoding": "False",
            "max_seq_length": "8192", "batch_sizes": "[1]",
            "pef_path": "{{ARTIFACTS_REPO}}/pefs/train", "model_path": null,
            "mode": "train", "rdu_arch": "sn40-16", "model_parallel_rdus": "16"
        }
    ]))
    .unwrap()
}

fn fetchers() -> (RecordingFetcher, RecordingFetcher) {
    let cloud = RecordingFetcher::new(&[
        ("gs://pefs/8192/bs1.pef", "aaa", "2025-03-04T10:00:00Z"),
        ("gs://pefs/8192/bs4.pef", "bbb", "Tue, 04 Mar 2025 23:00:00 GMT"),
    ]);
    let studio = RecordingFetcher::new(&[
        ("repo/pefs/llama-8k/bs1/coe_pef/", "aaa", "2025-02-01T00:00:00Z"),
        ("repo/pefs/llama-8k/bs4/coe_pef/", "old", "2025-03-01T12:00:00-08:00"),
    ]);
    (cloud, studio)
}

fn run(cache_path: &Path, cloud: &RecordingFetcher, studio: &RecordingFetcher) -> pef_inventory::report::Reconciliation {
    let comparer = InventoryComparer::from_rows(
        vec![cloud_row("Llama 3 Experts", 8192, &[1, 4, 8]), cloud_row("Llama 3 Experts", 16384, &[1])],
        studio_rows(),
        &StudioFilter::default(),
        "repo",
    )
    .unwrap();
    MetadataCache::scoped(cache_path, |cache| {
        let engine = ArtifactDiffEngine::new(cache, cloud, studio, "repo").with_workers(3);
        comparer.reconcile(&engine)
    })
    .unwrap()
}

#[test]
fn test_full_reconciliation_writes_every_report() {
    let dir = tempfile::tempdir().unwrap();
    let cache_path = dir.path().join(".md5sum_cache.yaml");
    let (cloud, studio) = fetchers();
    let report = run(&cache_path, &cloud, &studio);

    assert_eq!(report.common.len(), 1);
    let common = &report.common[0];
    assert_eq!(common.id, "Llama_3_Experts-70B-False-8192");
    assert_eq!(common.common_bs, vec![1, 4]);
    assert_eq!(common.cloud_only_bs, vec![8]);
    assert!(common.studio_only_bs.is_empty());
    assert_eq!(common.common_bs_matching_pefs, vec![1]);
    assert_eq!(common.common_bs_different_pefs, vec![4]);
    // 2025-03-01T12:00-08:00 is 2025-03-01T20:00Z; cloud upload is 2025-03-04.
    assert_eq!(common.date_difference_for_nonmatching_pefs, BTreeMap::from([(4, 3)]));
    assert_eq!(common.vocab_size, Some(json!("128256")));

    // The 16k config is new, but studio has its 4k and 8k siblings.
    assert_eq!(report.cloud_only.len(), 1);
    let siblings = report.cloud_only[0].sibling_studio_pefs.clone().unwrap();
    assert_eq!(siblings.get("4k").map(String::as_str), Some("repo/pefs/llama-4k"));
    assert_eq!(siblings.get("8k").map(String::as_str), Some("repo/pefs/llama-8k"));
    assert_eq!(report.cloud_only[0].studio_model.as_deref(), Some("repo/models/llama"));

    assert_eq!(report.studio_only.len(), 1);
    assert_eq!(report.studio_only[0].max_seq_length, Some(json!("4096")));

    let onboarding: Vec<(bool, Vec<u32>)> = report.onboarding.iter().map(|r| (r.is_new_config, r.onboard_bs.clone())).collect();
    assert_eq!(onboarding, vec![(true, vec![1]), (false, vec![4, 8])]);

    let out = dir.path().join("output");
    report.write_to(&out).unwrap();
    for file in [COMMON_OUTPUT, CLOUD_ONLY_OUTPUT, STUDIO_ONLY_OUTPUT, ONBOARDING_OUTPUT] {
        assert!(out.join(file).exists(), "missing {}", file);
    }
    let common_rows: Vec<Value> = read_table(&out.join(COMMON_OUTPUT)).unwrap();
    assert_eq!(common_rows[0]["common_bs_different_pefs_json"][0]["upload_date_difference_in_days"], json!(3));
    assert_eq!(common_rows[0]["comparison_error"], Value::Null);
    let onboarding_rows: Vec<Value> = read_table(&out.join(ONBOARDING_OUTPUT)).unwrap();
    assert_eq!(onboarding_rows[0]["id"], json!("Llama_3_Experts-70B-False-16384"));
}

#[test]
fn test_second_run_is_served_from_the_cache_file() {
    let dir = tempfile::tempdir().unwrap();
    let cache_path = dir.path().join(".md5sum_cache.yaml");

    let (cloud, studio) = fetchers();
    let first = run(&cache_path, &cloud, &studio);
    assert_eq!(cloud.requests(), 2);
    assert_eq!(studio.requests(), 2);
    assert!(cache_path.exists());

    let (cloud_again, studio_again) = fetchers();
    let second = run(&cache_path, &cloud_again, &studio_again);
    assert_eq!(cloud_again.requests(), 0);
    assert_eq!(studio_again.requests(), 0);
    assert_eq!(first, second);
}

#[test]
fn test_malformed_cache_file_starts_empty() {
    let dir = tempfile::tempdir().unwrap();
    let cache_path = dir.path().join(".md5sum_cache.yaml");
    std::fs::write(&cache_path, ": : not yaml [").unwrap();

    let (cloud, studio) = fetchers();
    let report = run(&cache_path, &cloud, &studio);
    assert_eq!(report.common[0].common_bs_matching_pefs, vec![1]);
    assert_eq!(cloud.requests(), 2);

    let reopened = MetadataCache::open(&cache_path);
    assert_eq!(reopened.len(), 4);
}

#[test]
fn test_studio_table_with_unparseable_boolean_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("studio.json");
    let mut rows = studio_rows();
    let mut bad = rows[0].fields().clone();
    bad.insert("spec_decoding".to_string(), json!("maybe"));
    rows[0] = TableRow::new(bad);
    write_table(&path, &rows).unwrap();

    let loaded: Vec<TableRow> = read_table(&path).unwrap();
    let result = InventoryComparer::from_rows(Vec::new(), loaded, &StudioFilter::default(), "repo");
    assert!(matches!(result, Err(InventoryError::InvalidBooleanLiteral { .. })));
}

const STUDIO_CSV: &str = "\
model_app_name,param_count,spec_decoding,max_seq_length,batch_sizes,vocab_size,pef_path,model_path,mode,rdu_arch,model_parallel_rdus
Llama 3 Experts,70B,False,8192,\"[1, 4]\",128256,{{ARTIFACTS_REPO}}/pefs/llama-8k,{{ARTIFACTS_REPO}}/models/llama,infer,sn40-16,16
Llama 3 Experts,70B,False,4096,[1],,{{ARTIFACTS_REPO}}/pefs/llama-4k,,infer,sn40-16,16
Llama 3 Experts,70B,False,8192,[1],,{{ARTIFACTS_REPO}}/pefs/train,,train,sn40-16,16
";

#[test]
fn test_csv_studio_export_reconciles_like_json() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("models_and_pefs.csv");
    std::fs::write(&path, STUDIO_CSV).unwrap();

    let rows = read_studio_table(&path).unwrap();
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[0].batch_sizes().unwrap(), vec![1, 4]);
    assert_eq!(rows[1].model_path(), None);
    assert_eq!(rows[1].vocab_size(), None);

    let comparer = InventoryComparer::from_rows(
        vec![cloud_row("Llama 3 Experts", 8192, &[1, 4, 8])],
        rows,
        &StudioFilter::default(),
        "repo",
    )
    .unwrap();
    let keys: Vec<String> = comparer.studio().keys().map(|k| k.to_string()).collect();
    assert_eq!(keys, vec!["Llama_3_Experts-70B-False-4096", "Llama_3_Experts-70B-False-8192"]);

    let split = comparer.partition();
    assert_eq!(split.common.len(), 1);
    assert_eq!(split.studio_only.len(), 1);
}

#[test]
fn test_json_studio_export_is_read_by_extension() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("studio.json");
    write_table(&path, &studio_rows()).unwrap();
    assert_eq!(read_studio_table(&path).unwrap(), studio_rows());
}
