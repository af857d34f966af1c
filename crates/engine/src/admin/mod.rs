//! Staff-only operations. Every mutation is recorded in the action log.

pub mod audit;
pub mod billing;
pub mod broadcast;
pub mod projects;
pub mod users;
pub mod work;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value, json};
use uuid::Uuid;

pub use audit::{ActionLogFilters, AuditLog};

/// Target of a bulk action: an explicit id list or `"all"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    All,
    Ids(Vec<Uuid>),
}

impl Selection {
    /// Ids to bind as a nullable `uuid[]`; `None` matches every row.
    pub fn as_filter(&self) -> Option<&[Uuid]> {
        match self {
            Selection::All => None,
            Selection::Ids(ids) => Some(ids),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Selection::Ids(ids) if ids.is_empty())
    }
}

impl<'de> Deserialize<'de> for Selection {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Word(String),
            Ids(Vec<Uuid>),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Word(word) if word.eq_ignore_ascii_case("all") => Ok(Selection::All),
            Raw::Word(word) => Err(D::Error::custom(format!(
                "expected \"all\" or a list of ids, got {:?}",
                word
            ))),
            Raw::Ids(ids) => Ok(Selection::Ids(ids)),
        }
    }
}

/// Outcome of a bulk action.
#[derive(Debug, Clone, Serialize)]
pub struct BulkResult {
    pub affected: u64,
}

/// Field-level `{field: {old, new}}` diff between two serialised records.
pub fn diff(before: &Value, after: &Value) -> Value {
    let empty = Map::new();
    let old = before.as_object().unwrap_or(&empty);
    let new = after.as_object().unwrap_or(&empty);

    new.iter()
        .filter(|(field, value)| old.get(*field) != Some(*value))
        .map(|(field, value)| {
            (
                field.clone(),
                json!({"old": old.get(field).cloned().unwrap_or(Value::Null), "new": value}),
            )
        })
        .collect::<Map<String, Value>>()
        .into()
}

/// Diff two versions of a record for the action log.
pub fn changes<T: Serialize>(before: &T, after: &T) -> Value {
    match (serde_json::to_value(before), serde_json::to_value(after)) {
        (Ok(before), Ok(after)) => diff(&before, &after),
        _ => Value::Object(Map::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selection_all() {
        let all: Selection = serde_json::from_str(r#""all""#).unwrap();
        assert_eq!(all, Selection::All);
        assert!(all.as_filter().is_none());
    }

    #[test]
    fn test_selection_ids() {
        let id = Uuid::new_v4();
        let picked: Selection = serde_json::from_value(json!([id])).unwrap();
        assert_eq!(picked.as_filter(), Some(&[id][..]));
        assert!(!picked.is_empty());
        assert!(serde_json::from_str::<Selection>(r#""some""#).is_err());
    }

    #[test]
    fn test_diff_reports_changed_fields_only() {
        let before = json!({"name": "Old", "status": "in_progress", "total_tasks": 3});
        let after = json!({"name": "New", "status": "in_progress", "total_tasks": 3});
        assert_eq!(diff(&before, &after), json!({"name": {"old": "Old", "new": "New"}}));
    }

    #[test]
    fn test_diff_of_identical_records_is_empty() {
        let record = json!({"a": 1});
        assert_eq!(diff(&record, &record), json!({}));
    }
}
