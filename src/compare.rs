use crate::diff::{ArtifactComparison, ArtifactDiffEngine, ARTIFACTS_REPO_PLACEHOLDER};
use crate::key::{derive_key, InventoryKey};
use crate::record::InventoryRow;
use crate::report::{CloudOnlyRow, CommonRow, OnboardingRow, Reconciliation, StudioOnlyRow};
use crate::seq_len::seq_len_display;
use crate::table::{StudioFilter, TableRow};
use crate::InventoryError;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

/// Key sets split by which side carries them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Partition {
    pub common: BTreeSet<InventoryKey>,
    pub cloud_only: BTreeSet<InventoryKey>,
    pub studio_only: BTreeSet<InventoryKey>,
}

pub fn partition<A, B>(cloud: &BTreeMap<InventoryKey, A>, studio: &BTreeMap<InventoryKey, B>) -> Partition {
    let mut result = Partition::default();
    for key in cloud.keys() {
        if studio.contains_key(key) {
            result.common.insert(key.clone());
        } else {
            result.cloud_only.insert(key.clone());
        }
    }
    result.studio_only = studio
        .keys()
        .filter(|k| !cloud.contains_key(*k))
        .cloned()
        .collect();
    result
}

/// Studio configurations that share a key's group but not its sequence length.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SiblingArtifacts {
    /// Sequence-length label -> PEF folder; `None` when no sibling exists.
    pub pefs: Option<BTreeMap<String, String>>,
    /// Model path of the first sibling in key order.
    pub studio_model: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchSizeDiff {
    pub common: Vec<u32>,
    pub cloud_only: Vec<u32>,
    pub studio_only: Vec<u32>,
}

impl BatchSizeDiff {
    pub fn between(cloud: &[u32], studio: &[u32]) -> Self {
        let cloud: BTreeSet<u32> = cloud.iter().copied().collect();
        let studio: BTreeSet<u32> = studio.iter().copied().collect();
        Self {
            common: cloud.intersection(&studio).copied().collect(),
            cloud_only: cloud.difference(&studio).copied().collect(),
            studio_only: studio.difference(&cloud).copied().collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ArtifactOutcome {
    Compared(ArtifactComparison),
    /// The comparison for this row was abandoned; the message says why.
    Failed(String),
}

impl ArtifactOutcome {
    pub fn comparison(&self) -> Option<&ArtifactComparison> {
        match self {
            ArtifactOutcome::Compared(c) => Some(c),
            ArtifactOutcome::Failed(_) => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            ArtifactOutcome::Compared(_) => None,
            ArtifactOutcome::Failed(message) => Some(message.as_str()),
        }
    }

    pub fn differing_batch_sizes(&self) -> Vec<u32> {
        self.comparison()
            .map(ArtifactComparison::differing_batch_sizes)
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RowDiff {
    pub batch_sizes: BatchSizeDiff,
    pub artifacts: ArtifactOutcome,
}

impl RowDiff {
    /// Cloud-only batch sizes plus those whose PEFs differ, ascending.
    pub fn onboard_batch_sizes(&self) -> Vec<u32> {
        let mut sizes: BTreeSet<u32> = self.batch_sizes.cloud_only.iter().copied().collect();
        sizes.extend(self.artifacts.differing_batch_sizes());
        sizes.into_iter().collect()
    }

    pub fn needs_onboarding(&self) -> bool {
        !self.onboard_batch_sizes().is_empty()
    }
}

/// Joins the cloud inventory against the (filtered) studio inventory.
pub struct InventoryComparer {
    cloud: BTreeMap<InventoryKey, InventoryRow>,
    studio: BTreeMap<InventoryKey, TableRow>,
    artifacts_repo: String,
}

impl InventoryComparer {
    pub fn new(
        cloud: BTreeMap<InventoryKey, InventoryRow>,
        studio: BTreeMap<InventoryKey, TableRow>,
        artifacts_repo: impl Into<String>,
    ) -> Self {
        Self {
            cloud,
            studio,
            artifacts_repo: artifacts_repo.into(),
        }
    }

    /// Keys every row, dropping studio rows outside `filter`. A later row replaces an
    /// earlier one with the same key.
    pub fn from_rows(
        cloud_rows: Vec<InventoryRow>,
        studio_rows: Vec<TableRow>,
        filter: &StudioFilter,
        artifacts_repo: impl Into<String>,
    ) -> Result<Self, InventoryError> {
        let mut cloud = BTreeMap::new();
        for row in cloud_rows {
            let key = row.key()?;
            if cloud.insert(key.clone(), row).is_some() {
                warn!("[compare] Duplicate cloud row for {}", key);
            }
        }

        let total = studio_rows.len();
        let mut studio = BTreeMap::new();
        for row in studio_rows.into_iter().filter(|r| filter.matches(r)) {
            let key = derive_key(&row)?;
            if studio.insert(key.clone(), row).is_some() {
                debug!("[compare] Duplicate studio row for {}", key);
            }
        }
        info!(
            "[compare] {} cloud configs, {} of {} studio rows kept by filter",
            cloud.len(),
            studio.len(),
            total
        );
        Ok(Self::new(cloud, studio, artifacts_repo))
    }

    pub fn cloud(&self) -> &BTreeMap<InventoryKey, InventoryRow> {
        &self.cloud
    }

    pub fn studio(&self) -> &BTreeMap<InventoryKey, TableRow> {
        &self.studio
    }

    pub fn partition(&self) -> Partition {
        partition(&self.cloud, &self.studio)
    }

    fn resolve_repo(&self, path: &str) -> String {
        path.replace(ARTIFACTS_REPO_PLACEHOLDER, &self.artifacts_repo)
    }

    pub fn find_siblings(&self, key: &InventoryKey) -> SiblingArtifacts {
        let group = key.group_id();
        let mut pefs = BTreeMap::new();
        let mut studio_model = None;
        // BTreeMap iteration is key order, so the first model seen is the representative.
        for (other, row) in self.studio.iter().filter(|(k, _)| k.group_id() == group) {
            if let Some(pef) = row.pef_path() {
                pefs.insert(seq_len_display(other.max_seq_length()), self.resolve_repo(&pef));
            }
            if studio_model.is_none() {
                studio_model = row.model_path().map(|m| self.resolve_repo(&m));
            }
        }
        SiblingArtifacts {
            pefs: if pefs.is_empty() { None } else { Some(pefs) },
            studio_model,
        }
    }

    /// Batch-size split for one common key, plus the PEF comparison of the shared batch
    /// sizes. A failed PEF comparison is recorded in the result, not returned.
    pub fn row_diff(
        &self,
        cloud_row: &InventoryRow,
        studio_row: &TableRow,
        engine: &ArtifactDiffEngine<'_>,
    ) -> Result<RowDiff, InventoryError> {
        let batch_sizes = BatchSizeDiff::between(&cloud_row.batch_sizes, &studio_row.batch_sizes()?);
        let artifacts = if batch_sizes.common.is_empty() {
            ArtifactOutcome::Compared(ArtifactComparison::default())
        } else {
            match studio_row.pef_path() {
                None => ArtifactOutcome::Failed("studio row has no pef_path".to_string()),
                Some(studio_base) => match engine.compare_artifacts(
                    &cloud_row.pef_paths_by_batch_size(),
                    &studio_base,
                    &batch_sizes.common,
                ) {
                    Ok(comparison) => ArtifactOutcome::Compared(comparison),
                    Err(e) => {
                        warn!("[compare] PEF comparison failed for {}: {}", cloud_row.id, e);
                        ArtifactOutcome::Failed(e.to_string())
                    }
                },
            }
        };
        Ok(RowDiff {
            batch_sizes,
            artifacts,
        })
    }

    /// Common keys with something to onboard, then every cloud-only key, in key order.
    pub fn build_onboarding_list<'k>(
        &self,
        common: impl IntoIterator<Item = (&'k InventoryKey, &'k RowDiff)>,
        cloud_only: &BTreeSet<InventoryKey>,
    ) -> Vec<OnboardingRow> {
        let mut rows: BTreeMap<&InventoryKey, OnboardingRow> = BTreeMap::new();
        for (key, diff) in common {
            let Some(cloud) = self.cloud.get(key) else { continue };
            if diff.needs_onboarding() {
                rows.insert(
                    key,
                    OnboardingRow {
                        cloud: cloud.clone(),
                        is_new_config: false,
                        onboard_bs: diff.onboard_batch_sizes(),
                    },
                );
            }
        }
        for key in cloud_only {
            let Some(cloud) = self.cloud.get(key) else { continue };
            rows.insert(
                key,
                OnboardingRow {
                    cloud: cloud.clone(),
                    is_new_config: true,
                    onboard_bs: cloud.batch_sizes.clone(),
                },
            );
        }
        rows.into_values().collect()
    }

    fn common_row(key: &InventoryKey, cloud: &InventoryRow, studio: &TableRow, diff: &RowDiff) -> CommonRow {
        let comparison = diff.artifacts.comparison();
        CommonRow {
            id: key.to_string(),
            app_name: key.app_name().to_string(),
            param_count: key.param_count().to_string(),
            max_seq_length: key.max_seq_length(),
            max_seq_length_cloud: cloud.max_seq_length_cloud.clone(),
            spec_decoding: key.sd(),
            vocab_size: studio.vocab_size(),
            cloud_pefs_json: cloud.cloud_pefs_json.clone(),
            studio_pef: studio.pef_path().map(|p| p.into_owned()),
            studio_model: studio.model_path().map(|m| m.into_owned()),
            studio_only_bs: diff.batch_sizes.studio_only.clone(),
            cloud_only_bs: diff.batch_sizes.cloud_only.clone(),
            common_bs: diff.batch_sizes.common.clone(),
            common_bs_matching_pefs: comparison.map(|c| c.matching.clone()).unwrap_or_default(),
            common_bs_different_pefs: diff.artifacts.differing_batch_sizes(),
            common_bs_different_pefs_json: comparison.map(|c| c.differing.clone()).unwrap_or_default(),
            date_difference_for_nonmatching_pefs: comparison
                .map(|c| c.day_skew_by_batch_size.clone())
                .unwrap_or_default(),
            comparison_error: diff.artifacts.error().map(str::to_string),
        }
    }

    fn studio_only_row(studio: &TableRow) -> StudioOnlyRow {
        let field = |name: &str| studio.get(name).cloned();
        StudioOnlyRow {
            model_app_name: field("model_app_name"),
            param_count: field("param_count"),
            max_seq_length: field("max_seq_length"),
            spec_decoding: field("spec_decoding"),
            batch_sizes: field("batch_sizes"),
        }
    }

    fn warm_cache(&self, engine: &ArtifactDiffEngine<'_>, common: &BTreeSet<InventoryKey>) {
        let mut requests = Vec::new();
        for key in common {
            let (Some(cloud), Some(studio)) = (self.cloud.get(key), self.studio.get(key)) else { continue };
            let (Some(base), Ok(studio_bs)) = (studio.pef_path(), studio.batch_sizes()) else { continue };
            let shared = BatchSizeDiff::between(&cloud.batch_sizes, &studio_bs).common;
            requests.push((cloud.pef_paths_by_batch_size(), base.into_owned(), shared));
        }
        let (cloud_report, studio_report) = engine.prefetch(
            requests
                .iter()
                .map(|(paths, base, sizes)| (paths, base.as_str(), sizes.as_slice())),
        );
        info!(
            "[compare] Prefetched {} cloud and {} studio PEFs ({} cached, {} failed)",
            cloud_report.fetched,
            studio_report.fetched,
            cloud_report.already_cached + studio_report.already_cached,
            cloud_report.failed.len() + studio_report.failed.len()
        );
    }

    /// Runs the full reconciliation. Only malformed inventory rows abort it.
    pub fn reconcile(&self, engine: &ArtifactDiffEngine<'_>) -> Result<Reconciliation, InventoryError> {
        let split = self.partition();
        info!(
            "[compare] {} common, {} cloud-only, {} studio-only",
            split.common.len(),
            split.cloud_only.len(),
            split.studio_only.len()
        );
        self.warm_cache(engine, &split.common);

        let mut report = Reconciliation::default();
        let mut diffs = Vec::with_capacity(split.common.len());
        for key in &split.common {
            let (Some(cloud), Some(studio)) = (self.cloud.get(key), self.studio.get(key)) else { continue };
            let diff = self.row_diff(cloud, studio, engine)?;
            report.common.push(Self::common_row(key, cloud, studio, &diff));
            diffs.push((key, diff));
        }

        for key in &split.cloud_only {
            let Some(cloud) = self.cloud.get(key) else { continue };
            let siblings = self.find_siblings(key);
            report.cloud_only.push(CloudOnlyRow {
                cloud: cloud.clone(),
                sibling_studio_pefs: siblings.pefs,
                studio_model: siblings.studio_model,
            });
        }

        report.studio_only = split
            .studio_only
            .iter()
            .filter_map(|key| self.studio.get(key))
            .map(Self::studio_only_row)
            .collect();

        report.onboarding = self.build_onboarding_list(diffs.iter().map(|(k, d)| (*k, d)), &split.cloud_only);
        Ok(report)
    }
}
