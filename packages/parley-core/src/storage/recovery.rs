//! Recovery ladder for damaged collection files.
//!
//! ```text
//!   strict parse ──ok──► records
//!        │ fail
//!        ▼
//!   (a) slice first '[' .. last ']' ──ok──► records
//!        │ fail
//!        ▼
//!   (b) "}{" → "},{" and wrap in [...] ──ok──► records
//!        │ fail
//!        ▼
//!   (c) parse each line on its own, drop the bad ones ──≥1──► records
//!        │ none
//!        ▼
//!   Unrecoverable (caller quarantines the file)
//! ```
//!
//! Everything here is pure: no I/O, no panics.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use super::StoredRecord;

/// Adjacent object literals with only whitespace between them.
static BACK_TO_BACK: Lazy<Regex> = Lazy::new(|| Regex::new(r"\}\s*\{").expect("static regex"));

/// Which rung of the ladder produced the records
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// File parsed as-is
    Strict,
    /// Outermost array slice parsed
    ArraySlice,
    /// Concatenated objects were re-joined
    JoinedObjects,
    /// Line-by-line salvage
    LineSalvage,
}

/// Outcome of parsing a collection file
#[derive(Debug, Clone, PartialEq)]
pub enum Parsed {
    /// Records recovered (possibly partially)
    Records(Vec<StoredRecord>, Recovery),
    /// Nothing usable; quarantine the file
    Unrecoverable,
}

/// Parse the contents of a collection file.
///
/// Blank input is a valid empty collection.
pub fn parse_collection(raw: &str) -> Parsed {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Parsed::Records(Vec::new(), Recovery::Strict);
    }

    if let Ok(values) = serde_json::from_str::<Vec<Value>>(trimmed) {
        return Parsed::Records(into_records(values), Recovery::Strict);
    }

    if let Some(values) = array_slice(trimmed) {
        return Parsed::Records(into_records(values), Recovery::ArraySlice);
    }

    if let Some(values) = joined_objects(trimmed) {
        return Parsed::Records(into_records(values), Recovery::JoinedObjects);
    }

    let salvaged = line_salvage(trimmed);
    if !salvaged.is_empty() {
        return Parsed::Records(into_records(salvaged), Recovery::LineSalvage);
    }

    Parsed::Unrecoverable
}

/// (a) Substring between the first `[` and the last `]`.
fn array_slice(raw: &str) -> Option<Vec<Value>> {
    let start = raw.find('[')?;
    let end = raw.rfind(']')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&raw[start..=end]).ok()
}

/// (b) Back-to-back object literals re-joined into an array.
fn joined_objects(raw: &str) -> Option<Vec<Value>> {
    if !raw.starts_with('{') {
        return None;
    }
    let joined = BACK_TO_BACK.replace_all(raw, "},{");
    serde_json::from_str(&format!("[{}]", joined)).ok()
}

/// (c) Newline-delimited records, each parsed independently.
fn line_salvage(raw: &str) -> Vec<Value> {
    raw.lines()
        .map(|line| line.trim().trim_end_matches(','))
        .map(|line| line.trim_start_matches('[').trim_end_matches(']'))
        .filter(|line| !line.is_empty())
        .filter_map(|line| serde_json::from_str::<Value>(line).ok())
        .filter(Value::is_object)
        .collect()
}

/// Keep only values shaped like `{id: string, value: any}`.
fn into_records(values: Vec<Value>) -> Vec<StoredRecord> {
    let total = values.len();
    let records: Vec<StoredRecord> = values
        .into_iter()
        .filter_map(|v| serde_json::from_value::<StoredRecord>(v).ok())
        .collect();

    if records.len() < total {
        tracing::warn!(
            dropped = total - records.len(),
            kept = records.len(),
            "Dropped entries without an id/value shape"
        );
    }
    records
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ids(parsed: &Parsed) -> Vec<String> {
        match parsed {
            Parsed::Records(records, _) => records.iter().map(|r| r.id.clone()).collect(),
            Parsed::Unrecoverable => panic!("expected records"),
        }
    }

    #[test]
    fn test_strict_parse() {
        let raw = r#"[{"id":"a","value":1},{"id":"b","value":{"x":[1,2]}}]"#;
        let parsed = parse_collection(raw);
        assert_eq!(ids(&parsed), vec!["a", "b"]);
        assert!(matches!(parsed, Parsed::Records(_, Recovery::Strict)));
    }

    #[test]
    fn test_blank_file_is_empty_collection() {
        assert_eq!(parse_collection("  \n"), Parsed::Records(vec![], Recovery::Strict));
    }

    #[test]
    fn test_trailing_garbage_recovered_by_array_slice() {
        let raw = r#"[{"id":"a","value":1}]\u0000\u0000garbage"#;
        let parsed = parse_collection(raw);
        assert_eq!(ids(&parsed), vec!["a"]);
        assert!(matches!(parsed, Parsed::Records(_, Recovery::ArraySlice)));
    }

    #[test]
    fn test_concatenated_objects_become_two_records() {
        let raw = r#"{"id":"a","value":[1]}{"id":"b","value":[2]}"#;
        let parsed = parse_collection(raw);
        assert_eq!(ids(&parsed), vec!["a", "b"]);
        assert!(matches!(parsed, Parsed::Records(_, Recovery::JoinedObjects)));
    }

    #[test]
    fn test_concatenated_objects_with_newline() {
        let raw = "{\"id\":\"a\",\"value\":1}\n{\"id\":\"b\",\"value\":2}";
        assert_eq!(ids(&parse_collection(raw)), vec!["a", "b"]);
    }

    #[test]
    fn test_line_salvage_drops_broken_lines() {
        let raw = "[\n{\"id\":\"a\",\"value\":1},\n{\"id\":\"b\",\"val\n{\"id\":\"c\",\"value\":3}\n";
        let parsed = parse_collection(raw);
        assert_eq!(ids(&parsed), vec!["a", "c"]);
        assert!(matches!(parsed, Parsed::Records(_, Recovery::LineSalvage)));
    }

    #[test]
    fn test_garbage_is_unrecoverable() {
        assert_eq!(parse_collection("not json at all {{{"), Parsed::Unrecoverable);
    }

    #[test]
    fn test_entries_without_id_are_dropped() {
        let raw = json!([{"id": "a", "value": 1}, {"value": 2}, 7]).to_string();
        assert_eq!(ids(&parse_collection(&raw)), vec!["a"]);
    }
}
