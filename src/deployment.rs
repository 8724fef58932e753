use crate::key::InventoryKey;
use crate::names::{ModelCapabilities, NameMappings, normalize_expert_name};
use crate::record::{CloudConfig, Expert, InventoryRow, Pef, ResolvedExpert};
use crate::seq_len::{DEFAULT_MAX_SEQ_LEN, seq_len_from_label, seq_len_suffix};
use crate::table::write_table;
use crate::InventoryError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use tracing::{debug, info};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Metadata {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArtifactSource {
    pub source: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpeculativeDecodingLink {
    pub batch_size: u32,
    pub k: u32,
    pub draft_model: String,
    pub target_model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeploymentSpec {
    #[serde(rename = "environmentSecretNames", default)]
    pub environment_secret_names: Vec<String>,
    #[serde(default)]
    pub pefs: BTreeMap<String, ArtifactSource>,
    #[serde(default)]
    pub checkpoints: BTreeMap<String, ArtifactSource>,
    #[serde(default)]
    pub experts: BTreeMap<String, Vec<Expert>>,
    #[serde(default)]
    pub speculative_decoding: Option<Vec<SpeculativeDecodingLink>>,
}

impl DeploymentSpec {
    pub fn links(&self) -> &[SpeculativeDecodingLink] {
        self.speculative_decoding.as_deref().unwrap_or(&[])
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InferenceDeployment {
    pub api_version: String,
    pub kind: String,
    pub metadata: Metadata,
    pub spec: DeploymentSpec,
}

impl InferenceDeployment {
    pub fn from_yaml_str(text: &str) -> Result<Self, InventoryError> {
        Ok(serde_yaml::from_str(text)?)
    }
}

/// Every `*.yaml`/`*.yml` file in `dir`, named by file stem, in file-name order.
pub fn load_deployments(dir: &Path) -> Result<Vec<(String, InferenceDeployment)>, InventoryError> {
    let mut paths = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let is_yaml = path
            .extension()
            .map_or(false, |ext| ext == "yaml" || ext == "yml");
        if path.is_file() && is_yaml {
            paths.push(path);
        }
    }
    paths.sort();

    let mut deployments = Vec::with_capacity(paths.len());
    for path in paths {
        info!("[aggregate] Processing {}", path.display());
        let text = fs::read_to_string(&path)?;
        let deployment = InferenceDeployment::from_yaml_str(&text).map_err(|e| {
            InventoryError::Config(format!("failed to parse {}: {}", path.display(), e))
        })?;
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| deployment.metadata.name.clone());
        deployments.push((name, deployment));
    }
    Ok(deployments)
}

/// Builds keyed [`CloudConfig`]s out of deployment specs.
pub struct Aggregator<'a> {
    mappings: &'a NameMappings,
    capabilities: &'a ModelCapabilities,
}

impl<'a> Aggregator<'a> {
    pub fn new(mappings: &'a NameMappings, capabilities: &'a ModelCapabilities) -> Self {
        Self { mappings, capabilities }
    }

    /// Suffix first, then the capability table, then the default.
    pub fn resolve_seq_len(&self, expert_name: &str) -> Result<u32, InventoryError> {
        if let Some(label) = seq_len_suffix(expert_name) {
            return seq_len_from_label(label).ok_or_else(|| {
                InventoryError::invalid_field(
                    "expert_name",
                    expert_name,
                    format!("sequence length suffix {} is not a known length", label),
                )
            });
        }
        Ok(self
            .capabilities
            .max_seq_len(expert_name)
            .unwrap_or(DEFAULT_MAX_SEQ_LEN))
    }

    /// Resolves one expert-name group into fully populated experts.
    pub fn resolve_group(
        &self,
        deployment: &str,
        spec: &DeploymentSpec,
        expert_name: &str,
        experts: &[Expert],
    ) -> Result<Vec<ResolvedExpert>, InventoryError> {
        let mut sd = false;
        let mut draft_experts = BTreeSet::new();
        let mut draft_checkpoints = BTreeMap::new();
        for link in spec.links().iter().filter(|l| l.target_model == expert_name) {
            sd = true;
            draft_experts.insert(normalize_expert_name(&link.draft_model).to_string());
            let drafts = spec.experts.get(&link.draft_model).ok_or_else(|| {
                InventoryError::UnknownDraftModel {
                    draft: link.draft_model.clone(),
                    target: expert_name.to_string(),
                    deployment: deployment.to_string(),
                }
            })?;
            for draft in drafts {
                let path = checkpoint_path(spec, &draft.checkpoint, &link.draft_model, deployment)?;
                draft_checkpoints.insert(draft.checkpoint.clone(), path);
            }
        }

        let max_seq_length = self.resolve_seq_len(expert_name)?;
        let app_name = self.mappings.app_name(expert_name)?;
        let param_count = self.mappings.parameter_count(expert_name)?;

        let checkpoint_names: BTreeSet<&str> = experts.iter().map(|e| e.checkpoint.as_str()).collect();
        if checkpoint_names.len() > 1 {
            return Err(InventoryError::NonUniqueCheckpoint {
                expert: expert_name.to_string(),
                deployment: deployment.to_string(),
                checkpoints: checkpoint_names.into_iter().map(str::to_string).collect(),
            });
        }

        let mut seen_pefs = BTreeSet::new();
        let mut resolved = Vec::with_capacity(experts.len());
        for expert in experts {
            if !seen_pefs.insert(expert.pef.as_str()) {
                return Err(InventoryError::NonUniquePefs {
                    expert: expert_name.to_string(),
                    deployment: deployment.to_string(),
                    pef: expert.pef.clone(),
                });
            }
            let pef_path = artifact_path(spec, "pef", &expert.pef, expert_name, deployment)?;
            let copy_pef_path = match &expert.copy_pef {
                Some(copy) => Some(artifact_path(spec, "pef", copy, expert_name, deployment)?),
                None => None,
            };
            let pef = Pef::new(expert.pef.clone(), expert.batch_size, pef_path, sd)
                .with_copy_pef(copy_pef_path)
                .with_ckpt_sharing_uuid(expert.ckpt_sharing_uuid.clone());

            resolved.push(ResolvedExpert {
                expert_name: expert_name.to_string(),
                normalized_name: normalize_expert_name(expert_name).to_string(),
                app_name: app_name.clone(),
                param_count: param_count.clone(),
                sd,
                max_seq_length,
                batch_size: expert.batch_size,
                pef,
                checkpoint_name: expert.checkpoint.clone(),
                checkpoint_path: checkpoint_path(spec, &expert.checkpoint, expert_name, deployment)?,
                draft_experts: draft_experts.clone(),
                draft_checkpoints: draft_checkpoints.clone(),
                private: expert.private,
            });
        }
        Ok(resolved)
    }

    /// One config per key for a single deployment.
    pub fn aggregate(
        &self,
        deployment: &str,
        spec: &DeploymentSpec,
    ) -> Result<BTreeMap<InventoryKey, CloudConfig>, InventoryError> {
        let mut configs: BTreeMap<InventoryKey, CloudConfig> = BTreeMap::new();
        for (expert_name, experts) in &spec.experts {
            let resolved = self.resolve_group(deployment, spec, expert_name, experts)?;
            debug!(
                "[aggregate] {} / {}: {} experts resolved",
                deployment,
                expert_name,
                resolved.len()
            );
            for expert in &resolved {
                let key = expert.key();
                match configs.get_mut(&key) {
                    Some(config) => config.add_expert(expert)?,
                    None => {
                        configs.insert(key, CloudConfig::from_expert(expert, deployment));
                    }
                }
            }
        }
        for config in configs.values() {
            config.validate_checkpoint_sharing()?;
        }
        info!("[aggregate] {}: {} configs", deployment, configs.len());
        Ok(configs)
    }
}

fn artifact_path(
    spec: &DeploymentSpec,
    kind: &'static str,
    name: &str,
    expert: &str,
    deployment: &str,
) -> Result<String, InventoryError> {
    spec.pefs
        .get(name)
        .map(|a| a.source.clone())
        .ok_or_else(|| InventoryError::MissingArtifact {
            kind,
            name: name.to_string(),
            expert: expert.to_string(),
            deployment: deployment.to_string(),
        })
}

fn checkpoint_path(
    spec: &DeploymentSpec,
    name: &str,
    expert: &str,
    deployment: &str,
) -> Result<String, InventoryError> {
    spec.checkpoints
        .get(name)
        .map(|a| a.source.clone())
        .ok_or_else(|| InventoryError::MissingArtifact {
            kind: "checkpoint",
            name: name.to_string(),
            expert: expert.to_string(),
            deployment: deployment.to_string(),
        })
}

/// Folds `from` into `into`, merging configs that share a key.
pub fn merge_configs(
    into: &mut BTreeMap<InventoryKey, CloudConfig>,
    from: BTreeMap<InventoryKey, CloudConfig>,
) -> Result<(), InventoryError> {
    for (key, config) in from {
        match into.get_mut(&key) {
            Some(existing) => {
                existing.merge(&config)?;
                existing.validate_checkpoint_sharing()?;
            }
            None => {
                into.insert(key, config);
            }
        }
    }
    Ok(())
}

/// Aggregates every deployment and merges the results by key.
pub fn build_cloud_inventory(
    aggregator: &Aggregator<'_>,
    deployments: &[(String, InferenceDeployment)],
) -> Result<BTreeMap<InventoryKey, CloudConfig>, InventoryError> {
    let mut inventory = BTreeMap::new();
    for (name, deployment) in deployments {
        let configs = aggregator.aggregate(name, &deployment.spec)?;
        merge_configs(&mut inventory, configs)?;
    }
    info!("[aggregate] Cloud inventory: {} configs from {} deployments", inventory.len(), deployments.len());
    Ok(inventory)
}

/// Writes one row per config, in key order.
pub fn write_cloud_inventory(
    path: &Path,
    inventory: &BTreeMap<InventoryKey, CloudConfig>,
) -> Result<Vec<InventoryRow>, InventoryError> {
    let rows: Vec<InventoryRow> = inventory.values().map(CloudConfig::to_row).collect();
    write_table(path, &rows)?;
    info!("[aggregate] Wrote {} rows to {}", rows.len(), path.display());
    Ok(rows)
}
