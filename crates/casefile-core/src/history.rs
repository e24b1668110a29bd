//! History logs: diffing a mutation into a `HistoryEntry`, and checking that a
//! log replays to the entity's current state.

use crate::entity::{Entity, FieldChange, HistoryEntry, HISTORY_FIELD};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Display, Formatter};

/// Payload fields that never get history entries.
pub const UNTRACKED_FIELDS: [&str; 2] = [HISTORY_FIELD, "documents"];

pub fn is_tracked(field: &str) -> bool {
    !UNTRACKED_FIELDS.contains(&field)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum IssueKind {
    /// An entry's `oldValue` differs from the value replayed up to it
    OldValueMismatch,
    /// An entry's `newValue` differs from the value it supposedly produced
    NewValueMismatch,
    /// The fully replayed value differs from the entity's current value
    FinalStateMismatch,
}

/// A place where a history log contradicts the state it should describe.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrityIssue {
    pub entity_id: String,
    pub field: String,
    pub kind: IssueKind,
    /// Date of the offending entry (None for final-state mismatches)
    pub at: Option<DateTime<Utc>>,
    /// What the log says
    pub recorded: Value,
    /// What replay computed
    pub computed: Value,
}

impl Display for IntegrityIssue {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} on {}.{}: log has {}, replay has {}",
            self.kind, self.entity_id, self.field, self.recorded, self.computed
        )?;
        if let Some(at) = self.at {
            write!(f, " (entry of {})", at.to_rfc3339())?;
        }
        Ok(())
    }
}

/// The history entry describing `before -> after`, or None if no tracked field changed.
pub fn diff(
    before: &Entity,
    after: &Entity,
    user: &str,
    date: DateTime<Utc>,
) -> Option<HistoryEntry> {
    let names: BTreeSet<&String> = before.fields.keys().chain(after.fields.keys()).collect();
    let data: BTreeMap<String, FieldChange> = names
        .into_iter()
        .filter(|name| is_tracked(name))
        .filter(|name| before.field(name) != after.field(name))
        .map(|name| {
            (
                name.clone(),
                FieldChange {
                    old_value: before.field(name).clone(),
                    new_value: after.field(name).clone(),
                },
            )
        })
        .collect();

    if data.is_empty() {
        return None;
    }
    Some(HistoryEntry {
        date,
        user: user.to_string(),
        data,
    })
}

/// Write a value into a field map; `null` removes the field.
pub(crate) fn assign(fields: &mut Map<String, Value>, name: &str, value: &Value) {
    if value.is_null() {
        fields.remove(name);
    } else {
        fields.insert(name.to_string(), value.clone());
    }
}

pub(crate) fn read<'a>(fields: &'a Map<String, Value>, name: &str) -> &'a Value {
    fields.get(name).unwrap_or(&Value::Null)
}

/// Replay an entity's whole log and report every contradiction.
///
/// The earliest state is rebuilt by undoing every entry from the current state;
/// replaying forward from there must then agree with each entry's `oldValue`
/// and end on the current values.
pub fn verify(entity: &Entity) -> Vec<IntegrityIssue> {
    let entries = entity.sorted_history();
    let mut state = entity.fields.clone();

    for entry in entries.iter().rev() {
        for (name, change) in &entry.data {
            assign(&mut state, name, &change.old_value);
        }
    }

    let mut issues = Vec::new();
    let mut touched = BTreeSet::new();
    for entry in &entries {
        for (name, change) in &entry.data {
            let computed = read(&state, name);
            if *computed != change.old_value {
                issues.push(IntegrityIssue {
                    entity_id: entity.id.clone(),
                    field: name.clone(),
                    kind: IssueKind::OldValueMismatch,
                    at: Some(entry.date),
                    recorded: change.old_value.clone(),
                    computed: computed.clone(),
                });
            }
            assign(&mut state, name, &change.new_value);
            touched.insert(name.as_str());
        }
    }

    for name in touched {
        let replayed = read(&state, name);
        let current = entity.field(name);
        if replayed != current {
            issues.push(IntegrityIssue {
                entity_id: entity.id.clone(),
                field: name.to_string(),
                kind: IssueKind::FinalStateMismatch,
                at: None,
                recorded: replayed.clone(),
                computed: current.clone(),
            });
        }
    }
    issues
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::parse_date;
    use serde_json::json;

    fn person(fields: Value) -> Entity {
        let Value::Object(map) = fields else {
            return Entity::new("org", Map::new());
        };
        Entity::new("org", map)
    }

    fn day(raw: &str) -> DateTime<Utc> {
        parse_date(raw).unwrap()
    }

    fn change(field: &str, old: Value, new: Value, date: &str) -> HistoryEntry {
        HistoryEntry {
            date: day(date),
            user: "u1".into(),
            data: BTreeMap::from([(
                field.to_string(),
                FieldChange {
                    old_value: old,
                    new_value: new,
                },
            )]),
        }
    }

    #[test]
    fn test_diff_tracks_changed_fields_only() {
        let before = person(json!({ "status": "A", "name": "x", "documents": [] }));
        let mut after = before.clone();
        after.set_field("status", json!("B"));
        after.set_field("documents", json!([{ "_id": "d1" }]));
        after.set_field("phone", json!("0600"));

        let entry = diff(&before, &after, "u1", day("2024-03-01")).unwrap();

        assert_eq!(entry.user, "u1");
        assert_eq!(entry.data.len(), 2);
        assert_eq!(entry.data["status"].old_value, json!("A"));
        assert_eq!(entry.data["status"].new_value, json!("B"));
        assert_eq!(entry.data["phone"].old_value, Value::Null);
        assert!(!entry.data.contains_key("documents"));
    }

    #[test]
    fn test_diff_without_changes_is_none() {
        let before = person(json!({ "status": "A" }));
        let mut after = before.clone();
        after.set_field("documents", json!([1]));
        assert!(diff(&before, &after, "u1", day("2024-03-01")).is_none());
    }

    #[test]
    fn test_consistent_log_verifies() {
        let mut entity = person(json!({ "status": "C", "name": "x" }));
        entity.history = vec![
            change("status", json!("B"), json!("C"), "2024-02-01"),
            change("status", json!("A"), json!("B"), "2024-01-01"),
        ];
        assert!(verify(&entity).is_empty());
    }

    #[test]
    fn test_broken_chain_is_reported() {
        let mut entity = person(json!({ "status": "C" }));
        entity.history = vec![
            change("status", json!("A"), json!("B"), "2024-01-01"),
            change("status", json!("X"), json!("C"), "2024-02-01"),
        ];

        let issues = verify(&entity);

        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].kind, IssueKind::OldValueMismatch);
        assert_eq!(issues[0].recorded, json!("X"));
        assert_eq!(issues[0].computed, json!("B"));
    }

    #[test]
    fn test_current_value_disagreeing_with_log_is_reported() {
        let mut entity = person(json!({ "status": "Z" }));
        entity.history = vec![
            change("status", json!("A"), json!("B"), "2024-01-01"),
            change("status", json!("B"), json!("C"), "2024-02-01"),
        ];

        let issues = verify(&entity);

        // Undo rebuilds A from Z; replay lands on C, which is not Z.
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].kind, IssueKind::FinalStateMismatch);
        assert_eq!(issues[0].recorded, json!("C"));
        assert_eq!(issues[0].computed, json!("Z"));
    }
}
