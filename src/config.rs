use crate::fetch::RetryPolicy;
use crate::table::StudioFilter;
use crate::InventoryError;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_ARTIFACTS_REPO: &str = "sw-generic-daas-artifacts-dev";

/// Everything a reconciliation run reads, writes and talks to.
#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    pub deployments_dir: PathBuf,
    pub model_mappings: PathBuf,
    /// Without it, sequence lengths fall back to name suffixes and the default.
    pub model_capabilities: Option<PathBuf>,
    pub studio_inventory: PathBuf,
    pub cloud_inventory: PathBuf,
    pub cloud_studio_model_mappings: PathBuf,
    pub output_dir: PathBuf,
    pub cache_file: PathBuf,
    pub artifacts_repo: String,
    pub studio_filter: StudioFilter,
    pub fetch_workers: usize,
    pub fetch_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            deployments_dir: PathBuf::from("deployments"),
            model_mappings: PathBuf::from("model_mappings.yaml"),
            model_capabilities: None,
            studio_inventory: PathBuf::from("output/studio_inventory.json"),
            cloud_inventory: PathBuf::from("output/cloud_inventory.json"),
            cloud_studio_model_mappings: PathBuf::from("cloud_studio_model_mappings.yaml"),
            output_dir: PathBuf::from("output"),
            cache_file: PathBuf::from(".md5sum_cache.yaml"),
            artifacts_repo: DEFAULT_ARTIFACTS_REPO.to_string(),
            studio_filter: StudioFilter::default(),
            fetch_workers: 4,
            fetch_timeout: Duration::from_secs(60),
            retry: RetryPolicy::default(),
        }
    }
}

fn var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parsed<T: FromStr>(name: &str) -> Result<Option<T>, InventoryError>
where
    T::Err: std::fmt::Display,
{
    match var(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| InventoryError::Config(format!("{}={:?}: {}", name, raw, e))),
    }
}

impl ReconcileConfig {
    /// Defaults overridden by `PEF_INVENTORY_*` variables. Call `dotenv()` first to pick
    /// up a `.env` file.
    pub fn from_env() -> Result<Self, InventoryError> {
        let mut config = Self::default();

        if let Some(v) = var("PEF_INVENTORY_DEPLOYMENTS_DIR") {
            config.deployments_dir = v.into();
        }
        if let Some(v) = var("PEF_INVENTORY_MODEL_MAPPINGS") {
            config.model_mappings = v.into();
        }
        if let Some(v) = var("PEF_INVENTORY_MODEL_CAPABILITIES") {
            config.model_capabilities = Some(v.into());
        }
        if let Some(v) = var("PEF_INVENTORY_STUDIO_INVENTORY") {
            config.studio_inventory = v.into();
        }
        if let Some(v) = var("PEF_INVENTORY_CLOUD_INVENTORY") {
            config.cloud_inventory = v.into();
        }
        if let Some(v) = var("PEF_INVENTORY_MODEL_NAME_MAPPINGS") {
            config.cloud_studio_model_mappings = v.into();
        }
        if let Some(v) = var("PEF_INVENTORY_OUTPUT_DIR") {
            config.output_dir = v.into();
        }
        if let Some(v) = var("PEF_INVENTORY_CACHE_FILE") {
            config.cache_file = v.into();
        }
        if let Some(v) = var("PEF_INVENTORY_ARTIFACTS_REPO") {
            config.artifacts_repo = v;
        }

        if let Some(v) = var("PEF_INVENTORY_STUDIO_MODE") {
            config.studio_filter.mode = v;
        }
        if let Some(v) = var("PEF_INVENTORY_STUDIO_RDU_ARCH") {
            config.studio_filter.rdu_arch = v;
        }
        if let Some(v) = parsed::<u32>("PEF_INVENTORY_STUDIO_MODEL_PARALLEL_RDUS")? {
            config.studio_filter.model_parallel_rdus = v;
        }
        if let Some(v) = var("PEF_INVENTORY_STUDIO_APP_SUFFIX") {
            config.studio_filter.app_name_suffix = v;
        }

        if let Some(v) = parsed::<usize>("PEF_INVENTORY_FETCH_WORKERS")? {
            config.fetch_workers = v.max(1);
        }
        if let Some(v) = parsed::<u64>("PEF_INVENTORY_FETCH_TIMEOUT_SECS")? {
            config.fetch_timeout = Duration::from_secs(v);
        }
        if let Some(v) = parsed::<u32>("PEF_INVENTORY_RETRY_ATTEMPTS")? {
            config.retry.max_attempts = v;
        }
        if let Some(v) = parsed::<u64>("PEF_INVENTORY_RETRY_BACKOFF_MS")? {
            config.retry.base_backoff = Duration::from_millis(v);
        }

        Ok(config)
    }
}
