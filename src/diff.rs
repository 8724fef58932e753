use crate::cache::{MetadataCache, PrefetchReport};
use crate::fetch::{ArtifactMetadata, MetadataFetcher};
use crate::InventoryError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Placeholder the studio inventory writes in place of its artifact repository name.
pub const ARTIFACTS_REPO_PLACEHOLDER: &str = "{{ARTIFACTS_REPO}}";

/// Calendar-day difference `a - b`, both taken in UTC.
pub fn day_skew_between(a: DateTime<Utc>, b: DateTime<Utc>) -> i64 {
    (a.date_naive() - b.date_naive()).num_days()
}

pub fn day_skew(cloud: &ArtifactMetadata, studio: &ArtifactMetadata) -> Result<i64, InventoryError> {
    Ok(day_skew_between(cloud.created_at_utc()?, studio.created_at_utc()?))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DifferingArtifact {
    pub batch_size: u32,
    #[serde(rename = "cloud_pef")]
    pub cloud: ArtifactMetadata,
    #[serde(rename = "studio_pef")]
    pub studio: ArtifactMetadata,
    #[serde(rename = "upload_date_difference_in_days")]
    pub day_skew: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArtifactComparison {
    pub matching: Vec<u32>,
    pub differing: Vec<DifferingArtifact>,
    pub day_skew_by_batch_size: BTreeMap<u32, i64>,
}

impl ArtifactComparison {
    pub fn differing_batch_sizes(&self) -> Vec<u32> {
        self.day_skew_by_batch_size.keys().copied().collect()
    }
}

/// Compares cloud PEFs against the studio PEF folder, batch size by batch size.
pub struct ArtifactDiffEngine<'a> {
    cache: &'a MetadataCache,
    cloud: &'a dyn MetadataFetcher,
    studio: &'a dyn MetadataFetcher,
    artifacts_repo: String,
    workers: usize,
}

impl<'a> ArtifactDiffEngine<'a> {
    pub fn new(
        cache: &'a MetadataCache,
        cloud: &'a dyn MetadataFetcher,
        studio: &'a dyn MetadataFetcher,
        artifacts_repo: impl Into<String>,
    ) -> Self {
        Self {
            cache,
            cloud,
            studio,
            artifacts_repo: artifacts_repo.into(),
            workers: 1,
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Substitutes the configured repository for the placeholder.
    pub fn resolve_repo(&self, path: &str) -> String {
        path.replace(ARTIFACTS_REPO_PLACEHOLDER, &self.artifacts_repo)
    }

    /// The studio folder holds every batch size; this is the one for `batch_size`.
    pub fn studio_artifact_path(&self, studio_base_path: &str, batch_size: u32) -> String {
        let base = self.resolve_repo(studio_base_path);
        if base.ends_with('/') {
            format!("{}bs{}/coe_pef/", base, batch_size)
        } else {
            format!("{}/bs{}/coe_pef/", base, batch_size)
        }
    }

    fn cloud_path<'p>(cloud_paths: &'p BTreeMap<u32, String>, batch_size: u32) -> Result<&'p str, InventoryError> {
        cloud_paths
            .get(&batch_size)
            .map(String::as_str)
            .ok_or_else(|| InventoryError::invalid_field("cloud_pefs_json", batch_size, "no cloud PEF for batch size"))
    }

    /// Warms the cache for a batch of upcoming comparisons.
    pub fn prefetch<'r, I>(&self, requests: I) -> (PrefetchReport, PrefetchReport)
    where
        I: IntoIterator<Item = (&'r BTreeMap<u32, String>, &'r str, &'r [u32])>,
    {
        let mut cloud_paths = Vec::new();
        let mut studio_paths = Vec::new();
        for (cloud, studio_base, batch_sizes) in requests {
            for &bs in batch_sizes {
                if let Some(path) = cloud.get(&bs) {
                    cloud_paths.push(path.clone());
                }
                studio_paths.push(self.studio_artifact_path(studio_base, bs));
            }
        }
        let cloud_report = self.cache.prefetch(cloud_paths, self.cloud, self.workers);
        let studio_report = self.cache.prefetch(studio_paths, self.studio, self.workers);
        (cloud_report, studio_report)
    }

    pub fn compare_artifacts(
        &self,
        cloud_paths_by_batch_size: &BTreeMap<u32, String>,
        studio_base_path: &str,
        batch_sizes: &[u32],
    ) -> Result<ArtifactComparison, InventoryError> {
        let mut comparison = ArtifactComparison::default();
        for &bs in batch_sizes {
            let cloud_path = Self::cloud_path(cloud_paths_by_batch_size, bs)?;
            let studio_path = self.studio_artifact_path(studio_base_path, bs);
            debug!("[diff] Comparing bs{}\n  {}\n  {}", bs, cloud_path, studio_path);

            let studio = self.cache.get_or_fetch(&studio_path, self.studio)?;
            let cloud = self.cache.get_or_fetch(cloud_path, self.cloud)?;

            if cloud.content_hash == studio.content_hash {
                debug!("[diff] bs{} MATCH", bs);
                comparison.matching.push(bs);
            } else {
                let skew = day_skew(&cloud, &studio)?;
                info!("[diff] bs{} NOT A MATCH ({} days apart)", bs, skew);
                comparison.day_skew_by_batch_size.insert(bs, skew);
                comparison.differing.push(DifferingArtifact {
                    batch_size: bs,
                    cloud,
                    studio,
                    day_skew: skew,
                });
            }
        }
        Ok(comparison)
    }
}
