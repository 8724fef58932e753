use crate::diff::DifferingArtifact;
use crate::record::{InventoryRow, PefEntry};
use crate::table::write_table;
use crate::InventoryError;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

pub const COMMON_OUTPUT: &str = "common_inventory.json";
pub const CLOUD_ONLY_OUTPUT: &str = "cloud_only_inventory.json";
pub const STUDIO_ONLY_OUTPUT: &str = "studio_only_inventory.json";
pub const ONBOARDING_OUTPUT: &str = "onboarding.json";

/// A configuration present on both sides, with its batch-size and PEF differences.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommonRow {
    pub id: String,
    pub app_name: String,
    pub param_count: String,
    pub max_seq_length: u32,
    pub max_seq_length_cloud: String,
    pub spec_decoding: bool,
    pub vocab_size: Option<Value>,
    pub cloud_pefs_json: BTreeMap<u32, PefEntry>,
    pub studio_pef: Option<String>,
    pub studio_model: Option<String>,
    pub studio_only_bs: Vec<u32>,
    pub cloud_only_bs: Vec<u32>,
    pub common_bs: Vec<u32>,
    pub common_bs_matching_pefs: Vec<u32>,
    pub common_bs_different_pefs: Vec<u32>,
    pub common_bs_different_pefs_json: Vec<DifferingArtifact>,
    pub date_difference_for_nonmatching_pefs: BTreeMap<u32, i64>,
    /// Set when the PEF comparison for this row could not complete.
    pub comparison_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CloudOnlyRow {
    #[serde(flatten)]
    pub cloud: InventoryRow,
    /// Sequence-length label -> studio PEF folder of each sibling configuration.
    pub sibling_studio_pefs: Option<BTreeMap<String, String>>,
    pub studio_model: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StudioOnlyRow {
    pub model_app_name: Option<Value>,
    pub param_count: Option<Value>,
    pub max_seq_length: Option<Value>,
    pub spec_decoding: Option<Value>,
    pub batch_sizes: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OnboardingRow {
    #[serde(flatten)]
    pub cloud: InventoryRow,
    pub is_new_config: bool,
    pub onboard_bs: Vec<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Reconciliation {
    pub common: Vec<CommonRow>,
    pub cloud_only: Vec<CloudOnlyRow>,
    pub studio_only: Vec<StudioOnlyRow>,
    pub onboarding: Vec<OnboardingRow>,
}

impl Reconciliation {
    pub fn failed_comparisons(&self) -> usize {
        self.common.iter().filter(|r| r.comparison_error.is_some()).count()
    }

    pub fn write_to(&self, output_dir: &Path) -> Result<(), InventoryError> {
        write_table(&output_dir.join(COMMON_OUTPUT), &self.common)?;
        write_table(&output_dir.join(CLOUD_ONLY_OUTPUT), &self.cloud_only)?;
        write_table(&output_dir.join(STUDIO_ONLY_OUTPUT), &self.studio_only)?;
        write_table(&output_dir.join(ONBOARDING_OUTPUT), &self.onboarding)?;
        info!(
            "[report] Wrote {} common, {} cloud-only, {} studio-only, {} onboarding rows to {}",
            self.common.len(),
            self.cloud_only.len(),
            self.studio_only.len(),
            self.onboarding.len(),
            output_dir.display()
        );
        Ok(())
    }
}
