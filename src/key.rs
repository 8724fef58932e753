use crate::seq_len::seq_len_from_label;
use crate::InventoryError;
use itertools::Itertools;
use std::borrow::Cow;
use std::cmp::Ordering;
use std::fmt;

/// A raw field value as it appears in some input shape.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue<'a> {
    Str(Cow<'a, str>),
    Bool(bool),
    Int(i64),
}

impl fmt::Display for FieldValue<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Str(s) => write!(f, "{}", s),
            FieldValue::Bool(b) => write!(f, "{}", b),
            FieldValue::Int(i) => write!(f, "{}", i),
        }
    }
}

/// Anything an [`InventoryKey`] can be derived from. Implemented once per input shape.
pub trait KeySource {
    /// Value stored under `name`, or `None` when absent (or null).
    fn get_field(&self, name: &str) -> Option<FieldValue<'_>>;

    /// Every field name the source carries, for error reporting.
    fn field_names(&self) -> Vec<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyField {
    AppName,
    ParamCount,
    SpeculativeDecoding,
    MaxSeqLength,
}

impl KeyField {
    pub const ALL: [KeyField; 4] = [
        KeyField::AppName,
        KeyField::ParamCount,
        KeyField::SpeculativeDecoding,
        KeyField::MaxSeqLength,
    ];

    pub fn name(self) -> &'static str {
        self.aliases()[0]
    }

    /// Accepted field names, canonical first.
    pub fn aliases(self) -> &'static [&'static str] {
        match self {
            KeyField::AppName => &["app_name", "model_app_name"],
            KeyField::ParamCount => &["param_count", "model_parameter_count", "parameter_count"],
            KeyField::SpeculativeDecoding => &["sd", "spec_decoding", "speculative_decoding"],
            KeyField::MaxSeqLength => &["max_seq_length", "max_seq_len"],
        }
    }
}

/// Cross-system join key for one logical model configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InventoryKey {
    app_name: String,
    param_count: String,
    sd: bool,
    max_seq_length: u32,
}

impl InventoryKey {
    pub fn new(app_name: impl Into<String>, param_count: impl Into<String>, sd: bool, max_seq_length: u32) -> Self {
        Self {
            app_name: app_name.into(),
            param_count: param_count.into(),
            sd,
            max_seq_length,
        }
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

    /// Canonical form minus the trailing sequence-length segment.
    pub fn group_id(&self) -> String {
        let id = self.to_string();
        match id.rsplit_once('-') {
            Some((group, _)) => group.to_string(),
            None => id,
        }
    }

    /// Keys that differ at most in sequence length.
    pub fn is_sibling(&self, other: &InventoryKey) -> bool {
        self.group_id() == other.group_id()
    }
}

impl fmt::Display for InventoryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let raw = format!(
            "{}-{}-{}-{}",
            self.app_name,
            self.param_count,
            if self.sd { "True" } else { "False" },
            self.max_seq_length
        );
        write!(f, "{}", raw.split_whitespace().join("_").replace('.', "d"))
    }
}

impl Ord for InventoryKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.to_string()
            .cmp(&other.to_string())
            .then_with(|| self.app_name.cmp(&other.app_name))
            .then_with(|| self.param_count.cmp(&other.param_count))
            .then_with(|| self.sd.cmp(&other.sd))
            .then_with(|| self.max_seq_length.cmp(&other.max_seq_length))
    }
}

impl PartialOrd for InventoryKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

pub fn derive_key<S: KeySource + ?Sized>(source: &S) -> Result<InventoryKey, InventoryError> {
    let mut resolved: [Option<(&'static str, FieldValue<'_>)>; 4] = [None, None, None, None];
    for (slot, field) in resolved.iter_mut().zip(KeyField::ALL) {
        *slot = field
            .aliases()
            .iter()
            .find_map(|alias| source.get_field(alias).map(|v| (*alias, v)));
    }

    let [Some(app), Some(params), Some(sd), Some(seq)] = resolved else {
        return Err(InventoryError::InvalidKeySource {
            required: KeyField::ALL.iter().map(|f| f.name().to_string()).collect(),
            found: source.field_names(),
        });
    };

    Ok(InventoryKey {
        app_name: parse_text(app.0, app.1)?,
        param_count: parse_text(params.0, params.1)?,
        sd: parse_bool(sd.0, &sd.1)?,
        max_seq_length: parse_seq_len(seq.0, &seq.1)?,
    })
}

fn parse_text(field: &str, value: FieldValue<'_>) -> Result<String, InventoryError> {
    match value {
        FieldValue::Str(s) => Ok(s.into_owned()),
        FieldValue::Int(i) => Ok(i.to_string()),
        FieldValue::Bool(b) => Err(InventoryError::invalid_field(field, b, "expected text")),
    }
}

/// Native booleans, or the literals `true`/`false` in any case.
pub fn parse_bool(field: &str, value: &FieldValue<'_>) -> Result<bool, InventoryError> {
    match value {
        FieldValue::Bool(b) => Ok(*b),
        FieldValue::Str(s) if s.trim().eq_ignore_ascii_case("true") => Ok(true),
        FieldValue::Str(s) if s.trim().eq_ignore_ascii_case("false") => Ok(false),
        other => Err(InventoryError::InvalidBooleanLiteral {
            field: field.to_string(),
            value: other.to_string(),
        }),
    }
}

fn parse_seq_len(field: &str, value: &FieldValue<'_>) -> Result<u32, InventoryError> {
    match value {
        FieldValue::Int(i) => u32::try_from(*i)
            .map_err(|_| InventoryError::invalid_field(field, i, "sequence length out of range")),
        FieldValue::Str(s) => {
            let s = s.trim();
            s.parse::<u32>()
                .ok()
                .or_else(|| seq_len_from_label(s))
                .ok_or_else(|| InventoryError::invalid_field(field, s, "expected an integer sequence length"))
        }
        FieldValue::Bool(b) => Err(InventoryError::invalid_field(field, b, "expected an integer sequence length")),
    }
}
