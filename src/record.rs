use crate::key::{FieldValue, InventoryKey, KeySource, derive_key};
use crate::names::pef_jira;
use crate::seq_len::seq_len_display;
use crate::InventoryError;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::hash::{Hash, Hasher};

/// One configured serving unit, exactly as written in a deployment spec.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Expert {
    pub batch_size: u32,
    pub pef: String,
    #[serde(default)]
    pub copy_pef: Option<String>,
    pub checkpoint: String,
    #[serde(default)]
    pub num_tokens_at_a_time: Option<u32>,
    #[serde(default)]
    pub ckpt_sharing: bool,
    #[serde(default)]
    pub ckpt_sharing_uuid: Option<String>,
    #[serde(default)]
    pub private: Option<bool>,
}

/// Compiled artifact descriptor. Identity is the remote path alone.
#[derive(Debug, Clone)]
pub struct Pef {
    pub name: String,
    pub batch_size: u32,
    pub path: String,
    pub jira_ticket: Option<String>,
    pub copy_pef_path: Option<String>,
    pub sd: bool,
    pub ckpt_sharing_uuid: Option<String>,
}

impl Pef {
    pub fn new(name: impl Into<String>, batch_size: u32, path: impl Into<String>, sd: bool) -> Self {
        let path = path.into();
        Self {
            name: name.into(),
            batch_size,
            jira_ticket: pef_jira(&path),
            path,
            copy_pef_path: None,
            sd,
            ckpt_sharing_uuid: None,
        }
    }

    pub fn with_copy_pef(mut self, copy_pef_path: Option<String>) -> Self {
        self.copy_pef_path = copy_pef_path;
        self
    }

    pub fn with_ckpt_sharing_uuid(mut self, uuid: Option<String>) -> Self {
        self.ckpt_sharing_uuid = uuid;
        self
    }
}

impl PartialEq for Pef {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path
    }
}

impl Eq for Pef {}

impl Hash for Pef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.path.hash(state);
    }
}

impl Ord for Pef {
    fn cmp(&self, other: &Self) -> Ordering {
        self.path.cmp(&other.path)
    }
}

impl PartialOrd for Pef {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// An expert with every derived field resolved against its deployment spec.
#[derive(Debug, Clone)]
pub struct ResolvedExpert {
    pub expert_name: String,
    pub normalized_name: String,
    pub app_name: String,
    pub param_count: String,
    pub sd: bool,
    pub max_seq_length: u32,
    pub batch_size: u32,
    pub pef: Pef,
    pub checkpoint_name: String,
    pub checkpoint_path: String,
    pub draft_experts: BTreeSet<String>,
    pub draft_checkpoints: BTreeMap<String, String>,
    pub private: Option<bool>,
}

impl ResolvedExpert {
    pub fn key(&self) -> InventoryKey {
        InventoryKey::new(self.app_name.clone(), self.param_count.clone(), self.sd, self.max_seq_length)
    }
}

/// Everything one inventory row describes: all artifacts for a single key.
#[derive(Debug, Clone, PartialEq)]
pub struct CloudConfig {
    app_name: String,
    param_count: String,
    sd: bool,
    max_seq_length: u32,
    experts: BTreeSet<String>,
    pefs: BTreeSet<Pef>,
    /// Checkpoint name -> every path seen for it across deployments.
    checkpoints: BTreeMap<String, BTreeSet<String>>,
    draft_experts: BTreeSet<String>,
    draft_checkpoints: BTreeMap<String, BTreeSet<String>>,
    deployments: BTreeSet<String>,
}

fn union_paths(into: &mut BTreeMap<String, BTreeSet<String>>, name: &str, paths: impl IntoIterator<Item = String>) {
    into.entry(name.to_string()).or_default().extend(paths);
}

impl CloudConfig {
    pub fn from_expert(expert: &ResolvedExpert, deployment: &str) -> Self {
        let mut config = Self {
            app_name: expert.app_name.clone(),
            param_count: expert.param_count.clone(),
            sd: expert.sd,
            max_seq_length: expert.max_seq_length,
            experts: BTreeSet::new(),
            pefs: BTreeSet::new(),
            checkpoints: BTreeMap::new(),
            draft_experts: BTreeSet::new(),
            draft_checkpoints: BTreeMap::new(),
            deployments: BTreeSet::from([deployment.to_string()]),
        };
        config.absorb_expert(expert);
        config
    }

    /// Adds an expert that resolves to this config's key.
    pub fn add_expert(&mut self, expert: &ResolvedExpert) -> Result<(), InventoryError> {
        let key = expert.key();
        if key != self.key() {
            return Err(InventoryError::Other(format!(
                "expert {} resolves to {}, cannot join config {}",
                expert.expert_name,
                key,
                self.key()
            )));
        }
        self.absorb_expert(expert);
        Ok(())
    }

    fn absorb_expert(&mut self, expert: &ResolvedExpert) {
        self.experts.insert(expert.normalized_name.clone());
        self.pefs.insert(expert.pef.clone());
        union_paths(&mut self.checkpoints, &expert.checkpoint_name, [expert.checkpoint_path.clone()]);
        self.draft_experts.extend(expert.draft_experts.iter().cloned());
        for (name, path) in &expert.draft_checkpoints {
            union_paths(&mut self.draft_checkpoints, name, [path.clone()]);
        }
    }

    /// Unions another config with the same key into this one.
    pub fn merge(&mut self, other: &CloudConfig) -> Result<(), InventoryError> {
        if other.key() != self.key() {
            return Err(InventoryError::Other(format!(
                "cannot merge config {} into {}",
                other.key(),
                self.key()
            )));
        }
        for pef in &other.pefs {
            if !self.pefs.contains(pef) {
                self.pefs.insert(pef.clone());
            }
        }
        for (name, paths) in &other.checkpoints {
            union_paths(&mut self.checkpoints, name, paths.iter().cloned());
        }
        for (name, paths) in &other.draft_checkpoints {
            union_paths(&mut self.draft_checkpoints, name, paths.iter().cloned());
        }
        self.experts.extend(other.experts.iter().cloned());
        self.draft_experts.extend(other.draft_experts.iter().cloned());
        self.deployments.extend(other.deployments.iter().cloned());
        Ok(())
    }

    pub fn key(&self) -> InventoryKey {
        InventoryKey::new(self.app_name.clone(), self.param_count.clone(), self.sd, self.max_seq_length)
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    pub fn param_count(&self) -> &str {
        &self.param_count
    }

    pub fn sd(&self) -> bool {
        self.sd
    }

    pub fn max_seq_length(&self) -> u32 {
        self.max_seq_length
    }

    pub fn experts(&self) -> &BTreeSet<String> {
        &self.experts
    }

    pub fn pefs(&self) -> &BTreeSet<Pef> {
        &self.pefs
    }

    pub fn checkpoints(&self) -> &BTreeMap<String, BTreeSet<String>> {
        &self.checkpoints
    }

    pub fn draft_experts(&self) -> &BTreeSet<String> {
        &self.draft_experts
    }

    pub fn deployments(&self) -> &BTreeSet<String> {
        &self.deployments
    }

    pub fn batch_sizes(&self) -> Vec<u32> {
        let sizes: BTreeSet<u32> = self.pefs.iter().map(|p| p.batch_size).collect();
        sizes.into_iter().collect()
    }

    /// All PEFs of one config must agree on their checkpoint sharing UUID.
    pub fn validate_checkpoint_sharing(&self) -> Result<(), InventoryError> {
        let uuids: BTreeSet<&str> = self
            .pefs
            .iter()
            .filter_map(|p| p.ckpt_sharing_uuid.as_deref())
            .collect();
        if uuids.len() > 1 {
            return Err(InventoryError::ConflictingCheckpointSharing {
                config: self.key().to_string(),
                uuids: uuids.into_iter().map(str::to_string).collect(),
            });
        }
        Ok(())
    }

    fn models(&self) -> BTreeMap<String, BTreeSet<String>> {
        let mut models = self.checkpoints.clone();
        for (name, paths) in &self.draft_checkpoints {
            union_paths(&mut models, name, paths.iter().cloned());
        }
        models
    }

    pub fn to_row(&self) -> InventoryRow {
        let key = self.key();
        let cloud_pefs_json = self
            .pefs
            .iter()
            .map(|p| {
                (
                    p.batch_size,
                    PefEntry {
                        pef_path: p.path.clone(),
                        copy_pef: p.copy_pef_path.clone(),
                        jira_ticket: p.jira_ticket.clone(),
                    },
                )
            })
            .collect();
        InventoryRow {
            id: key.to_string(),
            group_id: key.group_id(),
            model_app_name: self.app_name.clone(),
            experts: self.experts.iter().cloned().collect(),
            deployments: self.deployments.iter().cloned().collect(),
            param_count: self.param_count.clone(),
            max_seq_length: self.max_seq_length,
            max_seq_length_cloud: seq_len_display(self.max_seq_length),
            spec_decoding: self.sd,
            batch_sizes: self.batch_sizes(),
            cloud_pefs_json,
            pefs: self.pefs.iter().map(|p| p.path.clone()).collect(),
            copy_pefs: self.pefs.iter().filter_map(|p| p.copy_pef_path.clone()).collect(),
            draft_experts: self.draft_experts.iter().cloned().collect(),
            checkpoints: self
                .checkpoints
                .values()
                .flatten()
                .cloned()
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect(),
            cloud_models: self.models(),
        }
    }
}

impl KeySource for CloudConfig {
    fn get_field(&self, name: &str) -> Option<FieldValue<'_>> {
        match name {
            "app_name" => Some(FieldValue::Str(Cow::Borrowed(&self.app_name))),
            "param_count" => Some(FieldValue::Str(Cow::Borrowed(&self.param_count))),
            "sd" => Some(FieldValue::Bool(self.sd)),
            "max_seq_length" => Some(FieldValue::Int(i64::from(self.max_seq_length))),
            _ => None,
        }
    }

    fn field_names(&self) -> Vec<String> {
        ["app_name", "param_count", "sd", "max_seq_length"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PefEntry {
    pub pef_path: String,
    #[serde(default)]
    pub copy_pef: Option<String>,
    #[serde(default)]
    pub jira_ticket: Option<String>,
}

/// One row of the cloud inventory table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryRow {
    pub id: String,
    pub group_id: String,
    pub model_app_name: String,
    #[serde(default)]
    pub experts: Vec<String>,
    #[serde(default)]
    pub deployments: Vec<String>,
    pub param_count: String,
    pub max_seq_length: u32,
    pub max_seq_length_cloud: String,
    pub spec_decoding: bool,
    pub batch_sizes: Vec<u32>,
    pub cloud_pefs_json: BTreeMap<u32, PefEntry>,
    #[serde(default)]
    pub pefs: Vec<String>,
    #[serde(default)]
    pub copy_pefs: Vec<String>,
    #[serde(default)]
    pub draft_experts: Vec<String>,
    #[serde(default)]
    pub checkpoints: Vec<String>,
    /// Checkpoint name -> paths (drafts included), for model folder comparison.
    #[serde(default)]
    pub cloud_models: BTreeMap<String, BTreeSet<String>>,
}

impl InventoryRow {
    pub fn key(&self) -> Result<InventoryKey, InventoryError> {
        derive_key(self)
    }

    pub fn pef_paths_by_batch_size(&self) -> BTreeMap<u32, String> {
        self.cloud_pefs_json
            .iter()
            .map(|(bs, entry)| (*bs, entry.pef_path.clone()))
            .collect()
    }
}

impl KeySource for InventoryRow {
    fn get_field(&self, name: &str) -> Option<FieldValue<'_>> {
        match name {
            "model_app_name" => Some(FieldValue::Str(Cow::Borrowed(&self.model_app_name))),
            "param_count" => Some(FieldValue::Str(Cow::Borrowed(&self.param_count))),
            "spec_decoding" => Some(FieldValue::Bool(self.spec_decoding)),
            "max_seq_length" => Some(FieldValue::Int(i64::from(self.max_seq_length))),
            _ => None,
        }
    }

    fn field_names(&self) -> Vec<String> {
        ["model_app_name", "param_count", "spec_decoding", "max_seq_length"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }
}
