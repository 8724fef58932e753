use crate::key::{FieldValue, KeySource};
use crate::InventoryError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::borrow::Cow;
use std::fs;
use std::path::Path;

/// A loosely-typed inventory table row, as exported by the studio side.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TableRow(Map<String, Value>);

impl TableRow {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self(fields)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name).filter(|v| !v.is_null())
    }

    /// Field rendered as text: strings verbatim, numbers and booleans via `to_string`.
    pub fn text(&self, name: &str) -> Option<Cow<'_, str>> {
        match self.get(name)? {
            Value::String(s) => Some(Cow::Borrowed(s.as_str())),
            Value::Number(n) => Some(Cow::Owned(n.to_string())),
            Value::Bool(b) => Some(Cow::Owned(b.to_string())),
            other => Some(Cow::Owned(other.to_string())),
        }
    }

    pub fn pef_path(&self) -> Option<Cow<'_, str>> {
        self.text("pef_path")
    }

    pub fn model_path(&self) -> Option<Cow<'_, str>> {
        self.text("model_path")
    }

    pub fn vocab_size(&self) -> Option<Value> {
        self.get("vocab_size").cloned()
    }

    /// Batch sizes stored either as a JSON array or a JSON-encoded string (`"[1, 4]"`).
    /// Missing means none.
    pub fn batch_sizes(&self) -> Result<Vec<u32>, InventoryError> {
        let value = match self.get("batch_sizes") {
            None => return Ok(Vec::new()),
            Some(Value::String(s)) if s.trim().is_empty() => return Ok(Vec::new()),
            Some(Value::String(s)) => serde_json::from_str::<Value>(s)
                .map_err(|e| InventoryError::invalid_field("batch_sizes", s, e.to_string()))?,
            Some(v) => v.clone(),
        };
        let sizes: Vec<u32> = serde_json::from_value(value.clone())
            .map_err(|e| InventoryError::invalid_field("batch_sizes", &value, e.to_string()))?;
        Ok(sizes)
    }
}

impl From<Map<String, Value>> for TableRow {
    fn from(fields: Map<String, Value>) -> Self {
        Self(fields)
    }
}

impl KeySource for TableRow {
    fn get_field(&self, name: &str) -> Option<FieldValue<'_>> {
        match self.get(name)? {
            Value::String(s) => Some(FieldValue::Str(Cow::Borrowed(s.as_str()))),
            Value::Bool(b) => Some(FieldValue::Bool(*b)),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Some(FieldValue::Int(i)),
                None => Some(FieldValue::Str(Cow::Owned(n.to_string()))),
            },
            other => Some(FieldValue::Str(Cow::Owned(other.to_string()))),
        }
    }

    fn field_names(&self) -> Vec<String> {
        self.0.keys().cloned().collect()
    }
}

/// Which studio rows describe the inference-serving subset worth reconciling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudioFilter {
    pub mode: String,
    pub rdu_arch: String,
    pub model_parallel_rdus: u32,
    pub app_name_suffix: String,
}

impl Default for StudioFilter {
    fn default() -> Self {
        Self {
            mode: "infer".to_string(),
            rdu_arch: "sn40-16".to_string(),
            model_parallel_rdus: 16,
            app_name_suffix: "Experts".to_string(),
        }
    }
}

impl StudioFilter {
    pub fn matches(&self, row: &TableRow) -> bool {
        let rdus = row
            .text("model_parallel_rdus")
            .and_then(|s| s.trim().parse::<u32>().ok());
        row.text("mode").as_deref() == Some(self.mode.as_str())
            && row.text("rdu_arch").as_deref() == Some(self.rdu_arch.as_str())
            && rdus == Some(self.model_parallel_rdus)
            && row
                .text("model_app_name")
                .is_some_and(|name| name.ends_with(self.app_name_suffix.as_str()))
    }
}

pub fn read_table<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, InventoryError> {
    let text = fs::read_to_string(path)?;
    serde_json::from_str(&text).map_err(|e| {
        InventoryError::Other(format!("Failed to parse table {}: {}", path.display(), e))
    })
}

/// Reads a studio export: CSV with a header row when the extension is `.csv`, otherwise a
/// JSON array. Empty CSV cells are treated as absent.
pub fn read_studio_table(path: &Path) -> Result<Vec<TableRow>, InventoryError> {
    let is_csv = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("csv"));
    if !is_csv {
        return read_table(path);
    }

    let parse_error =
        |e: csv::Error| InventoryError::Other(format!("Failed to parse table {}: {}", path.display(), e));
    let mut reader = csv::Reader::from_path(path).map_err(parse_error)?;
    let headers = reader.headers().map_err(parse_error)?.clone();
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(parse_error)?;
        let fields: Map<String, Value> = headers
            .iter()
            .zip(record.iter())
            .map(|(name, cell)| {
                let value = if cell.is_empty() { Value::Null } else { Value::String(cell.to_string()) };
                (name.to_string(), value)
            })
            .collect();
        rows.push(TableRow::new(fields));
    }
    Ok(rows)
}

/// Writes rows as a pretty-printed JSON array, creating parent directories.
pub fn write_table<T: Serialize>(path: &Path, rows: &[T]) -> Result<(), InventoryError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let text = serde_json::to_string_pretty(rows)?;
    let temp_path = path.with_extension("tmp");
    fs::write(&temp_path, text)?;
    fs::rename(&temp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::derive_key;
    use serde_json::json;

    fn row(value: Value) -> TableRow {
        serde_json::from_value(value).unwrap()
    }

    fn studio_row() -> TableRow {
        row(json!({
            "model_app_name": "Llama 3.1 Experts",
            "param_count": "70B",
            "spec_decoding": "False",
            "max_seq_length": "8192",
            "mode": "infer",
            "rdu_arch": "sn40-16",
            "model_parallel_rdus": "16",
            "batch_sizes": "[1, 4, 8]",
            "pef_path": "{{ARTIFACTS_REPO}}/pefs/llama",
            "vocab_size": 128256,
            "notes": null
        }))
    }

    #[test]
    fn test_studio_row_derives_key() {
        let key = derive_key(&studio_row()).unwrap();
        assert_eq!(key.to_string(), "Llama_3d1_Experts-70B-False-8192");
    }

    #[test]
    fn test_batch_sizes_accepts_string_and_array() {
        assert_eq!(studio_row().batch_sizes().unwrap(), vec![1, 4, 8]);
        assert_eq!(row(json!({"batch_sizes": [2, 16]})).batch_sizes().unwrap(), vec![2, 16]);
        assert!(row(json!({})).batch_sizes().unwrap().is_empty());
        assert!(row(json!({"batch_sizes": "[1, x]"})).batch_sizes().is_err());
    }

    #[test]
    fn test_null_fields_are_absent() {
        let r = studio_row();
        assert!(r.get("notes").is_none());
        assert!(r.get_field("notes").is_none());
        assert!(r.model_path().is_none());
        assert_eq!(r.vocab_size(), Some(json!(128256)));
    }

    #[test]
    fn test_filter_keeps_only_inference_experts() {
        let filter = StudioFilter::default();
        assert!(filter.matches(&studio_row()));

        let mut fields = studio_row().fields().clone();
        fields.insert("mode".into(), json!("train"));
        assert!(!filter.matches(&TableRow::new(fields)));

        let mut fields = studio_row().fields().clone();
        fields.insert("model_parallel_rdus".into(), json!(16));
        assert!(filter.matches(&TableRow::new(fields)));

        let mut fields = studio_row().fields().clone();
        fields.insert("model_app_name".into(), json!("Llama 3.1"));
        assert!(!filter.matches(&TableRow::new(fields)));
    }

    #[test]
    fn test_table_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("studio.json");
        write_table(&path, &[studio_row()]).unwrap();
        let rows: Vec<TableRow> = read_table(&path).unwrap();
        assert_eq!(rows, vec![studio_row()]);
    }
}
