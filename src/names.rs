use crate::seq_len::seq_len_suffix;
use crate::InventoryError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Strips a trailing `-<digits>k` sequence-length suffix.
pub fn normalize_expert_name(expert_name: &str) -> &str {
    match seq_len_suffix(expert_name) {
        Some(suffix) => &expert_name[..expert_name.len() - suffix.len() - 1],
        None => expert_name,
    }
}

static PEF_JIRA: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)pef[-_]+(\d+)").unwrap());

/// Extracts a `PEF-<digits>` ticket from an artifact path, if one is embedded.
pub fn pef_jira(pef_path: &str) -> Option<String> {
    let digits = PEF_JIRA.captures(pef_path)?.get(1)?;
    Some(format!("PEF-{}", digits.as_str()))
}

#[derive(Debug, Clone, Deserialize)]
pub struct NameMapping {
    #[serde(default)]
    pub app_name: Option<String>,
    pub model_parameter_count: serde_yaml::Value,
}

/// Normalized expert name -> app name / parameter count.
#[derive(Debug, Clone, Default)]
pub struct NameMappings {
    source: String,
    entries: BTreeMap<String, NameMapping>,
}

impl NameMappings {
    pub fn load(path: &Path) -> Result<Self, InventoryError> {
        let text = fs::read_to_string(path)?;
        let mut mappings = Self::from_yaml_str(&text)?;
        mappings.source = path.display().to_string();
        Ok(mappings)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, InventoryError> {
        let entries: Option<BTreeMap<String, NameMapping>> = serde_yaml::from_str(text)?;
        Ok(Self {
            source: "<inline>".to_string(),
            entries: entries.unwrap_or_default(),
        })
    }

    pub fn from_entries(entries: BTreeMap<String, NameMapping>) -> Self {
        Self {
            source: "<inline>".to_string(),
            entries,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn mapping(&self, expert_name: &str) -> Result<&NameMapping, InventoryError> {
        let normalized = normalize_expert_name(expert_name);
        self.entries
            .get(normalized)
            .ok_or_else(|| InventoryError::UnknownExpert {
                name: normalized.to_string(),
                source: self.source.clone(),
            })
    }

    pub fn app_name(&self, expert_name: &str) -> Result<String, InventoryError> {
        let mapping = self.mapping(expert_name)?;
        Ok(match &mapping.app_name {
            Some(app_name) => app_name.clone(),
            None => normalize_expert_name(expert_name).to_string(),
        })
    }

    pub fn parameter_count(&self, expert_name: &str) -> Result<String, InventoryError> {
        let mapping = self.mapping(expert_name)?;
        match &mapping.model_parameter_count {
            serde_yaml::Value::String(s) => Ok(s.clone()),
            serde_yaml::Value::Number(n) => Ok(n.to_string()),
            other => Err(InventoryError::invalid_field(
                "model_parameter_count",
                format!("{:?}", other),
                format!("expected a string or number for {}", normalize_expert_name(expert_name)),
            )),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendModel {
    pub name: String,
    pub max_sequence_length: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayTokenizer {
    #[serde(default)]
    pub backend_models: Vec<BackendModel>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelCapability {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub gateway_tokenizer: GatewayTokenizer,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelCapabilities {
    #[serde(default)]
    pub models: Vec<ModelCapability>,
}

impl ModelCapabilities {
    pub fn load(path: &Path) -> Result<Self, InventoryError> {
        let text = fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, InventoryError> {
        let parsed: Option<Self> = serde_yaml::from_str(text)?;
        Ok(parsed.unwrap_or_default())
    }

    /// Max sequence length of the backend model named `expert_name`, looked up in
    /// every model that declares the expert by name or alias.
    pub fn max_seq_len(&self, expert_name: &str) -> Option<u32> {
        self.models
            .iter()
            .filter(|m| {
                m.name.as_deref() == Some(expert_name) || m.aliases.iter().any(|a| a == expert_name)
            })
            .flat_map(|m| m.gateway_tokenizer.backend_models.iter())
            .find(|b| b.name == expert_name)
            .map(|b| b.max_sequence_length)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_strips_only_seq_len_suffix() {
        assert_eq!(normalize_expert_name("Llama-3-70B-16k"), "Llama-3-70B");
        assert_eq!(normalize_expert_name("Llama-3-70B"), "Llama-3-70B");
        assert_eq!(normalize_expert_name("Qwen-2.5-7B-kk"), "Qwen-2.5-7B-kk");
    }

    #[test]
    fn test_pef_jira_extraction() {
        let path = "gs://bucket/version/deepseek-0.0.4/pefs/PEF_1663_multi_prefill/x_BS1.pef";
        assert_eq!(pef_jira(path), Some("PEF-1663".to_string()));
        assert_eq!(pef_jira("gs://bucket/pef--42/a.pef"), Some("PEF-42".to_string()));
        assert_eq!(pef_jira("gs://bucket/pefs/coe_pef/a.pef"), None);
        assert_eq!(pef_jira("gs://bucket/Pef_0099_bs1.pef"), Some("PEF-0099".to_string()));
    }

    #[test]
    fn test_mappings_fall_back_to_normalized_name() {
        let mappings = NameMappings::from_yaml_str(
            "Llama-3-70B:\n  app_name: null\n  model_parameter_count: 70B\nQwen-7B:\n  app_name: Qwen 2.5\n  model_parameter_count: 7\n",
        )
        .unwrap();
        assert_eq!(mappings.app_name("Llama-3-70B-16k").unwrap(), "Llama-3-70B");
        assert_eq!(mappings.parameter_count("Llama-3-70B-16k").unwrap(), "70B");
        assert_eq!(mappings.app_name("Qwen-7B").unwrap(), "Qwen 2.5");
        assert_eq!(mappings.parameter_count("Qwen-7B").unwrap(), "7");
    }

    #[test]
    fn test_unmapped_expert_is_fatal() {
        let mappings = NameMappings::default();
        match mappings.app_name("Mystery-8B-8k") {
            Err(InventoryError::UnknownExpert { name, .. }) => assert_eq!(name, "Mystery-8B"),
            other => panic!("expected UnknownExpert, got {:?}", other),
        }
    }

    #[test]
    fn test_capabilities_match_name_through_aliases() {
        let caps = ModelCapabilities::from_yaml_str(
            r#"
models:
  - name: llama-70b
    aliases: [Llama-3-70B]
    gatewayTokenizer:
      backendModels:
        - name: Llama-3-70B
          maxSequenceLength: 8192
        - name: Other
          maxSequenceLength: 4096
"#,
        )
        .unwrap();
        assert_eq!(caps.max_seq_len("Llama-3-70B"), Some(8192));
        assert_eq!(caps.max_seq_len("Other"), None);
        assert_eq!(caps.max_seq_len("Unknown"), None);
    }
}
