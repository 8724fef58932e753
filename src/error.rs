use std::fmt;
use std::time::Duration;

#[derive(Debug)]
pub enum InventoryError {
    /// No alias resolved for at least one required key field.
    InvalidKeySource {
        required: Vec<String>,
        found: Vec<String>,
    },
    InvalidBooleanLiteral {
        field: String,
        value: String,
    },
    InvalidField {
        field: String,
        value: String,
        reason: String,
    },
    UnknownExpert {
        name: String,
        source: String,
    },
    MissingArtifact {
        kind: &'static str,
        name: String,
        expert: String,
        deployment: String,
    },
    UnknownDraftModel {
        draft: String,
        target: String,
        deployment: String,
    },
    NonUniqueCheckpoint {
        expert: String,
        deployment: String,
        checkpoints: Vec<String>,
    },
    NonUniquePefs {
        expert: String,
        deployment: String,
        pef: String,
    },
    ConflictingCheckpointSharing {
        config: String,
        uuids: Vec<String>,
    },
    Fetch {
        path: String,
        message: String,
        retryable: bool,
    },
    Timeout {
        path: String,
        after: Duration,
    },
    MissingPefFile {
        path: String,
    },
    Io(std::io::Error),
    Json(serde_json::Error),
    Yaml(serde_yaml::Error),
    Config(String),
    Other(String),
}

impl InventoryError {
    /// Transport failures and timeouts may succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            InventoryError::Fetch { retryable, .. } => *retryable,
            InventoryError::Timeout { .. } => true,
            _ => false,
        }
    }

    pub fn fetch(path: &str, message: impl Into<String>, retryable: bool) -> Self {
        InventoryError::Fetch {
            path: path.to_string(),
            message: message.into(),
            retryable,
        }
    }

    pub fn invalid_field(field: &str, value: impl fmt::Display, reason: impl Into<String>) -> Self {
        InventoryError::InvalidField {
            field: field.to_string(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for InventoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InventoryError::InvalidKeySource { required, found } => write!(
                f,
                "Invalid key source: required fields {:?}, found {:?}",
                required, found
            ),
            InventoryError::InvalidBooleanLiteral { field, value } => write!(
                f,
                "Invalid boolean literal {:?} for field {} (expected \"true\" or \"false\")",
                value, field
            ),
            InventoryError::InvalidField { field, value, reason } => {
                write!(f, "Invalid value {:?} for field {}: {}", value, field, reason)
            }
            InventoryError::UnknownExpert { name, source } => write!(
                f,
                "Could not find normalized expert name {} in mappings {}",
                name, source
            ),
            InventoryError::MissingArtifact { kind, name, expert, deployment } => write!(
                f,
                "Expert {} in deployment {} references undefined {} {}",
                expert, deployment, kind, name
            ),
            InventoryError::UnknownDraftModel { draft, target, deployment } => write!(
                f,
                "Speculative decoding target {} in deployment {} names unknown draft model {}",
                target, deployment, draft
            ),
            InventoryError::NonUniqueCheckpoint { expert, deployment, checkpoints } => write!(
                f,
                "Expert {} in deployment {} references more than one checkpoint: {:?}",
                expert, deployment, checkpoints
            ),
            InventoryError::NonUniquePefs { expert, deployment, pef } => write!(
                f,
                "Expert {} in deployment {} references PEF {} more than once",
                expert, deployment, pef
            ),
            InventoryError::ConflictingCheckpointSharing { config, uuids } => write!(
                f,
                "Got multiple ckpt sharing UUIDs for PEFs in config {}: {:?}",
                config, uuids
            ),
            InventoryError::Fetch { path, message, .. } => {
                write!(f, "Metadata fetch failed for {}: {}", path, message)
            }
            InventoryError::Timeout { path, after } => {
                write!(f, "Metadata fetch for {} timed out after {:?}", path, after)
            }
            InventoryError::MissingPefFile { path } => {
                write!(f, "No .pef file found under {}", path)
            }
            InventoryError::Io(e) => write!(f, "IO error: {}", e),
            InventoryError::Json(e) => write!(f, "JSON error: {}", e),
            InventoryError::Yaml(e) => write!(f, "YAML error: {}", e),
            InventoryError::Config(e) => write!(f, "Config error: {}", e),
            InventoryError::Other(e) => write!(f, "Error: {}", e),
        }
    }
}

impl std::error::Error for InventoryError {}

impl From<std::io::Error> for InventoryError {
    fn from(err: std::io::Error) -> Self {
        InventoryError::Io(err)
    }
}

impl From<serde_json::Error> for InventoryError {
    fn from(err: serde_json::Error) -> Self {
        InventoryError::Json(err)
    }
}

impl From<serde_yaml::Error> for InventoryError {
    fn from(err: serde_yaml::Error) -> Self {
        InventoryError::Yaml(err)
    }
}

impl From<String> for InventoryError {
    fn from(err: String) -> Self {
        InventoryError::Other(err)
    }
}

impl From<&str> for InventoryError {
    fn from(err: &str) -> Self {
        InventoryError::Other(err.to_string())
    }
}
