use crate::InventoryError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::sleep;
use std::time::Duration;
use tracing::warn;

/// What the core needs to know about one remote artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    /// Lowercase hex digest.
    #[serde(alias = "md5")]
    pub content_hash: String,
    #[serde(alias = "upload_date")]
    pub created_at: String,
    #[serde(alias = "path")]
    pub resolved_path: String,
}

impl ArtifactMetadata {
    pub fn new(content_hash: impl Into<String>, created_at: impl Into<String>, resolved_path: impl Into<String>) -> Self {
        Self {
            content_hash: content_hash.into(),
            created_at: created_at.into(),
            resolved_path: resolved_path.into(),
        }
    }

    pub fn created_at_utc(&self) -> Result<DateTime<Utc>, InventoryError> {
        parse_timestamp(&self.created_at)
    }
}

/// Accepts RFC 3339 (`2025-03-26T13:53:39.342-07:00`) and RFC 2822
/// (`Thu, 20 Feb 2025 18:27:17 GMT`) timestamps.
pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, InventoryError> {
    let value = value.trim();
    DateTime::parse_from_rfc3339(value)
        .or_else(|_| DateTime::parse_from_rfc2822(value))
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| InventoryError::invalid_field("created_at", value, e.to_string()))
}

/// Remote metadata lookup. Failures are fatal for the path unless retried.
pub trait MetadataFetcher: Send + Sync {
    fn fetch_metadata(&self, path: &str) -> Result<ArtifactMetadata, InventoryError>;
}

impl<F: MetadataFetcher + ?Sized> MetadataFetcher for &F {
    fn fetch_metadata(&self, path: &str) -> Result<ArtifactMetadata, InventoryError> {
        (**self).fetch_metadata(path)
    }
}

impl<F: MetadataFetcher + ?Sized> MetadataFetcher for Box<F> {
    fn fetch_metadata(&self, path: &str) -> Result<ArtifactMetadata, InventoryError> {
        (**self).fetch_metadata(path)
    }
}

impl<F: MetadataFetcher + ?Sized> MetadataFetcher for Arc<F> {
    fn fetch_metadata(&self, path: &str) -> Result<ArtifactMetadata, InventoryError> {
        (**self).fetch_metadata(path)
    }
}

/// Lists every file under a folder as basename -> md5 hex.
pub trait FolderLister: Send + Sync {
    fn list_hashes(&self, folder: &str) -> Result<BTreeMap<String, String>, InventoryError>;
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    fn backoff(&self, attempt: u32) -> Duration {
        self.base_backoff
            .checked_mul(1u32 << attempt.min(16))
            .unwrap_or(Duration::MAX)
    }
}

/// Retries retryable failures with exponential backoff.
pub struct RetryingFetcher<F> {
    inner: F,
    policy: RetryPolicy,
}

impl<F> RetryingFetcher<F> {
    pub fn new(inner: F, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

impl<F: MetadataFetcher> MetadataFetcher for RetryingFetcher<F> {
    fn fetch_metadata(&self, path: &str) -> Result<ArtifactMetadata, InventoryError> {
        let mut attempt = 0;
        loop {
            match self.inner.fetch_metadata(path) {
                Ok(metadata) => return Ok(metadata),
                Err(e) if e.is_retryable() && attempt + 1 < self.policy.max_attempts => {
                    let delay = self.policy.backoff(attempt);
                    warn!("[fetch] attempt {} for {} failed ({}), retrying in {:?}", attempt + 1, path, e, delay);
                    attempt += 1;
                    sleep(delay);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Flaky {
        failures: Mutex<Vec<InventoryError>>,
        calls: Mutex<u32>,
    }

    impl MetadataFetcher for Flaky {
        fn fetch_metadata(&self, path: &str) -> Result<ArtifactMetadata, InventoryError> {
            *self.calls.lock().unwrap() += 1;
            match self.failures.lock().unwrap().pop() {
                Some(e) => Err(e),
                None => Ok(ArtifactMetadata::new("abc", "2025-01-01T00:00:00Z", path)),
            }
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy { max_attempts: 3, base_backoff: Duration::ZERO }
    }

    #[test]
    fn test_backoff_saturates_instead_of_overflowing() {
        let policy = RetryPolicy {
            max_attempts: 20,
            base_backoff: Duration::from_millis(u64::MAX),
        };
        assert_eq!(policy.backoff(0), Duration::from_millis(u64::MAX));
        assert_eq!(policy.backoff(16), Duration::MAX);
        let small = RetryPolicy::default();
        assert_eq!(small.backoff(2), Duration::from_millis(2000));
    }

    #[test]
    fn test_retries_transient_failures() {
        let flaky = Flaky {
            failures: Mutex::new(vec![
                InventoryError::fetch("p", "reset", true),
                InventoryError::Timeout { path: "p".into(), after: Duration::from_secs(1) },
            ]),
            calls: Mutex::new(0),
        };
        let fetcher = RetryingFetcher::new(&flaky, policy());
        assert!(fetcher.fetch_metadata("p").is_ok());
        assert_eq!(*flaky.calls.lock().unwrap(), 3);
    }

    #[test]
    fn test_gives_up_after_max_attempts() {
        let flaky = Flaky {
            failures: Mutex::new((0..5).map(|_| InventoryError::fetch("p", "reset", true)).collect()),
            calls: Mutex::new(0),
        };
        let fetcher = RetryingFetcher::new(&flaky, policy());
        assert!(fetcher.fetch_metadata("p").is_err());
        assert_eq!(*flaky.calls.lock().unwrap(), 3);
    }

    #[test]
    fn test_fatal_failures_are_not_retried() {
        let flaky = Flaky {
            failures: Mutex::new(vec![InventoryError::fetch("p", "exit status 1", false)]),
            calls: Mutex::new(0),
        };
        let fetcher = RetryingFetcher::new(&flaky, policy());
        assert!(fetcher.fetch_metadata("p").is_err());
        assert_eq!(*flaky.calls.lock().unwrap(), 1);
    }

    #[test]
    fn test_parses_both_timestamp_styles() {
        let a = parse_timestamp("Thu, 20 Feb 2025 18:27:17 GMT").unwrap();
        let b = parse_timestamp("2025-02-20T10:27:17-08:00").unwrap();
        assert_eq!(a, b);
        assert!(parse_timestamp("yesterday").is_err());
    }

    #[test]
    fn test_metadata_reads_legacy_field_names() {
        let legacy = "md5: a2334cef\nupload_date: '2025-03-26T13:53:39.342-07:00'\npath: repo/x.pef\n";
        let metadata: ArtifactMetadata = serde_yaml::from_str(legacy).unwrap();
        assert_eq!(metadata.content_hash, "a2334cef");
        assert_eq!(metadata.resolved_path, "repo/x.pef");
    }
}
