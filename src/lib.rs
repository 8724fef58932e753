pub mod cache;
pub mod compare;
pub mod config;
pub mod deployment;
pub mod diff;
pub mod error;
pub mod fetch;
pub mod key;
pub mod logging;
pub mod models;
pub mod names;
pub mod record;
pub mod report;
pub mod seq_len;
pub mod table;

#[cfg(feature = "remote")]
pub mod artifact_repo;
#[cfg(feature = "remote")]
pub mod object_store;

pub use error::*;
pub use key::{derive_key, InventoryKey, KeySource};
pub use logging::init_tracing;
