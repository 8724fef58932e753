use once_cell::sync::Lazy;
use regex::Regex;

/// Sequence lengths the cloud system labels, and the label it uses for each.
pub const MAX_SEQ_LEN_TABLE: [(u32, &str); 6] = [
    (4096, "4k"),
    (8192, "8k"),
    (16384, "16k"),
    (32768, "32k"),
    (65536, "64k"),
    (131072, "128k"),
];

pub const DEFAULT_MAX_SEQ_LEN: u32 = 4096;

pub fn seq_len_label(max_seq_len: u32) -> Option<&'static str> {
    MAX_SEQ_LEN_TABLE
        .iter()
        .find(|(len, _)| *len == max_seq_len)
        .map(|(_, label)| *label)
}

pub fn seq_len_from_label(label: &str) -> Option<u32> {
    MAX_SEQ_LEN_TABLE
        .iter()
        .find(|(_, l)| l.eq_ignore_ascii_case(label))
        .map(|(len, _)| *len)
}

/// Display label, falling back to the decimal value for lengths outside the table.
pub fn seq_len_display(max_seq_len: u32) -> String {
    seq_len_label(max_seq_len)
        .map(str::to_string)
        .unwrap_or_else(|| max_seq_len.to_string())
}

static SEQ_LEN_SUFFIX: Lazy<Regex> = Lazy::new(|| Regex::new(r"-(\d+k)$").unwrap());

/// Returns the `<digits>k` part of a trailing `-<digits>k` suffix.
pub fn seq_len_suffix(expert_name: &str) -> Option<&str> {
    SEQ_LEN_SUFFIX
        .captures(expert_name)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels_round_trip_through_table() {
        for (len, label) in MAX_SEQ_LEN_TABLE {
            assert_eq!(seq_len_label(len), Some(label));
            assert_eq!(seq_len_from_label(label), Some(len));
        }
        assert_eq!(seq_len_label(2048), None);
        assert_eq!(seq_len_display(2048), "2048");
    }

    #[test]
    fn test_suffix_requires_dash_digits_k() {
        assert_eq!(seq_len_suffix("Llama-3-70B-16k"), Some("16k"));
        assert_eq!(seq_len_suffix("Meta-Llama-3.1-8B-Instruct-128k"), Some("128k"));
        assert_eq!(seq_len_suffix("Llama-3-70B"), None);
        assert_eq!(seq_len_suffix("Llama-3-70B-k"), None);
        assert_eq!(seq_len_suffix("Llama16k"), None);
        assert_eq!(seq_len_suffix("Llama-3-16k-Instruct"), None);
    }
}
