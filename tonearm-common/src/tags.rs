//! Stream tag maps
//!
//! Tags arrive from the media pipeline already converted to plain values:
//! every key maps to the ordered list of values reported for it.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Tag key to ordered values
pub type Tags = BTreeMap<String, Vec<TagValue>>;

/// Longest value shown by [`describe`] before truncation
const DESCRIBE_MAX_LEN: usize = 64;

/// A single converted tag value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TagValue {
    Bool(bool),
    UInt(u64),
    Int(i64),
    Double(f64),
    Date(NaiveDate),
    Str(String),
    Bytes(Vec<u8>),
}

impl From<&str> for TagValue {
    fn from(value: &str) -> Self {
        TagValue::Str(value.to_string())
    }
}

impl From<String> for TagValue {
    fn from(value: String) -> Self {
        TagValue::Str(value)
    }
}

impl From<u64> for TagValue {
    fn from(value: u64) -> Self {
        TagValue::UInt(value)
    }
}

impl From<i64> for TagValue {
    fn from(value: i64) -> Self {
        TagValue::Int(value)
    }
}

impl From<f64> for TagValue {
    fn from(value: f64) -> Self {
        TagValue::Double(value)
    }
}

impl From<bool> for TagValue {
    fn from(value: bool) -> Self {
        TagValue::Bool(value)
    }
}

impl From<NaiveDate> for TagValue {
    fn from(value: NaiveDate) -> Self {
        TagValue::Date(value)
    }
}

impl fmt::Display for TagValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TagValue::Bool(v) => write!(f, "{}", v),
            TagValue::UInt(v) => write!(f, "{}", v),
            TagValue::Int(v) => write!(f, "{}", v),
            TagValue::Double(v) => write!(f, "{}", v),
            TagValue::Date(v) => write!(f, "{}", v.format("%Y-%m-%d")),
            TagValue::Str(v) => write!(f, "{:?}", v),
            TagValue::Bytes(v) => write!(f, "<{} bytes>", v.len()),
        }
    }
}

/// Merge `incoming` into `current`, returning the keys whose values changed
///
/// A key counts as changed when it is new or its value sequence differs
/// from the stored one. Unchanged keys are left alone.
pub fn merge_changed(current: &mut Tags, incoming: Tags) -> BTreeSet<String> {
    let mut changed = BTreeSet::new();
    for (key, values) in incoming {
        if current.get(&key) != Some(&values) {
            changed.insert(key.clone());
            current.insert(key, values);
        }
    }
    changed
}

/// Compact, log-friendly rendering of a tag map
///
/// Long values (embedded images, lyrics) are truncated.
pub fn describe(tags: &Tags) -> String {
    let parts: Vec<String> = tags
        .iter()
        .map(|(key, values)| {
            let rendered: Vec<String> = values
                .iter()
                .map(|v| {
                    let text = v.to_string();
                    if text.chars().count() > DESCRIBE_MAX_LEN {
                        let head: String = text.chars().take(DESCRIBE_MAX_LEN).collect();
                        format!("{}...", head)
                    } else {
                        text
                    }
                })
                .collect();
            format!("{}=[{}]", key, rendered.join(", "))
        })
        .collect();
    format!("{{{}}}", parts.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(pairs: &[(&str, &str)]) -> Tags {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), vec![TagValue::from(*v)]))
            .collect()
    }

    #[test]
    fn test_merge_reports_new_keys() {
        let mut current = Tags::new();
        let changed = merge_changed(&mut current, tags(&[("artist", "A"), ("title", "T")]));

        assert_eq!(changed.len(), 2);
        assert!(changed.contains("artist"));
        assert_eq!(current["title"], vec![TagValue::from("T")]);
    }

    #[test]
    fn test_merge_identical_set_reports_nothing() {
        let mut current = tags(&[("artist", "A"), ("title", "T")]);
        let changed = merge_changed(&mut current, tags(&[("artist", "A"), ("title", "T")]));
        assert!(changed.is_empty());
    }

    #[test]
    fn test_merge_only_differing_keys() {
        let mut current = tags(&[("artist", "A"), ("title", "T")]);
        let changed = merge_changed(&mut current, tags(&[("artist", "A"), ("title", "U")]));

        assert_eq!(changed.into_iter().collect::<Vec<_>>(), vec!["title".to_string()]);
        assert_eq!(current["title"], vec![TagValue::from("U")]);
        assert_eq!(current["artist"], vec![TagValue::from("A")]);
    }

    #[test]
    fn test_merge_value_order_matters() {
        let mut current = Tags::new();
        current.insert("artist".into(), vec!["A".into(), "B".into()]);

        let mut incoming = Tags::new();
        incoming.insert("artist".into(), vec!["B".into(), "A".into()]);

        assert!(merge_changed(&mut current, incoming).contains("artist"));
    }

    #[test]
    fn test_describe_truncates_long_values() {
        let mut t = Tags::new();
        t.insert("lyrics".into(), vec![TagValue::from("x".repeat(200))]);
        t.insert("image".into(), vec![TagValue::Bytes(vec![0; 4096])]);
        t.insert(
            "date".into(),
            vec![TagValue::Date(NaiveDate::from_ymd_opt(1999, 12, 31).unwrap())],
        );

        let text = describe(&t);
        assert!(text.contains("<4096 bytes>"));
        assert!(text.contains("1999-12-31"));
        assert!(text.contains("..."));
        assert!(text.len() < 200);
    }
}
