//! Temporal reconstruction: an entity's state as of a past date, and cohort
//! transitions between two dates, both derived from history logs.
//!
//! Dates are calendar days (UTC). A snapshot at day `d` reflects the state at
//! the end of `d`: entries dated on `d` are kept, later ones undone.
//!
//! Nothing here mutates its input. Integrity problems found while replaying are
//! logged and returned; reconstruction carries on with the log's values.

use crate::entity::{Entity, HistoryEntry};
use crate::history::{assign, read, IntegrityIssue, IssueKind};
use chrono::NaiveDate;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

/// The entity as it stood at the end of `date`, or None if it was not tracked yet.
pub fn snapshot_at(entity: &Entity, date: NaiveDate) -> Option<Entity> {
    let mut issues = Vec::new();
    let snapshot = reconstruct(entity, date, &mut issues);
    report(&issues);
    snapshot
}

fn reconstruct(entity: &Entity, date: NaiveDate, issues: &mut Vec<IntegrityIssue>) -> Option<Entity> {
    if entity.tracked_since().date_naive() > date {
        return None;
    }

    let entries = entity.sorted_history();
    let mut snapshot = entity.clone();
    let mut kept = entries.len();

    for (index, entry) in entries.iter().enumerate().rev() {
        if entry.date.date_naive() <= date {
            break;
        }
        for (name, change) in &entry.data {
            let current = read(&snapshot.fields, name);
            if *current != change.new_value {
                issues.push(IntegrityIssue {
                    entity_id: entity.id.clone(),
                    field: name.clone(),
                    kind: IssueKind::NewValueMismatch,
                    at: Some(entry.date),
                    recorded: change.new_value.clone(),
                    computed: current.clone(),
                });
            }
            assign(&mut snapshot.fields, name, &change.old_value);
        }
        kept = index;
    }

    snapshot.history = entries[..kept].iter().map(|e| (*e).clone()).collect();
    Some(snapshot)
}

/// Outcome of replaying history forward onto a snapshot.
#[derive(Debug, Clone)]
pub struct Replay {
    pub entity: Entity,
    pub issues: Vec<IntegrityIssue>,
}

/// Re-apply every entry of `entity`'s log dated after `date` onto `snapshot`,
/// in chronological order, checking each `oldValue` on the way.
pub fn replay_forward(snapshot: &Entity, entity: &Entity, date: NaiveDate) -> Replay {
    let mut replayed = snapshot.clone();
    let mut issues = Vec::new();

    for entry in entity
        .sorted_history()
        .into_iter()
        .filter(|e| e.date.date_naive() > date)
    {
        apply_entry(&mut replayed, entry, &mut issues);
        replayed.history.push(entry.clone());
    }

    report(&issues);
    Replay {
        entity: replayed,
        issues,
    }
}

fn apply_entry(target: &mut Entity, entry: &HistoryEntry, issues: &mut Vec<IntegrityIssue>) {
    for (name, change) in &entry.data {
        let current = read(&target.fields, name);
        if *current != change.old_value {
            issues.push(IntegrityIssue {
                entity_id: target.id.clone(),
                field: name.clone(),
                kind: IssueKind::OldValueMismatch,
                at: Some(entry.date),
                recorded: change.old_value.clone(),
                computed: current.clone(),
            });
        }
        assign(&mut target.fields, name, &change.new_value);
    }
}

/// Parameters of a cohort transition query.
#[derive(Debug, Clone, PartialEq)]
pub struct CohortQuery {
    pub field: String,
    pub from_value: Value,
    pub to_value: Value,
    pub start: NaiveDate,
    pub end: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CohortTransition {
    /// Ids holding `from_value` at `start`
    pub initial: Vec<String>,
    /// Ids of the initial cohort whose first move went to `to_value`
    pub switched: Vec<String>,
    /// `switched` as a percentage of `initial`; 0 for an empty cohort
    pub percent: f64,
    pub issues: Vec<IntegrityIssue>,
}

/// Whether a field value counts as `target`: equality, or membership when the
/// field holds an array and the target does not.
pub fn value_matches(value: &Value, target: &Value) -> bool {
    match (value, target) {
        (Value::Array(items), target) if !target.is_array() => items.contains(target),
        _ => value == target,
    }
}

/// Measure how much of the `from_value` cohort at `start` had moved to
/// `to_value` by `end`.
///
/// Returns None when the window is empty (`start >= end`).
pub fn cohort_transition(query: &CohortQuery, population: &[Entity]) -> Option<CohortTransition> {
    if query.start >= query.end {
        return None;
    }

    let mut initial = Vec::new();
    let mut switched = Vec::new();
    let mut issues = Vec::new();

    for entity in population {
        let Some(snapshot) = reconstruct(entity, query.start, &mut issues) else {
            continue;
        };
        let mut current = read(&snapshot.fields, &query.field).clone();
        if !value_matches(&current, &query.from_value) {
            continue;
        }
        initial.push(entity.id.clone());

        // An entity that never moves in the window "switched to" from_value.
        let mut landed = query.from_value.clone();
        for entry in entity.sorted_history() {
            let day = entry.date.date_naive();
            if day <= query.start || day > query.end {
                continue;
            }
            let Some(change) = entry.data.get(&query.field) else {
                continue;
            };
            if change.old_value != current {
                issues.push(IntegrityIssue {
                    entity_id: entity.id.clone(),
                    field: query.field.clone(),
                    kind: IssueKind::OldValueMismatch,
                    at: Some(entry.date),
                    recorded: change.old_value.clone(),
                    computed: current.clone(),
                });
            }
            current = change.new_value.clone();
            if !value_matches(&current, &query.from_value) {
                landed = current.clone();
                break;
            }
        }

        if value_matches(&landed, &query.to_value) {
            switched.push(entity.id.clone());
        }
    }

    report(&issues);
    let percent = if initial.is_empty() {
        0.0
    } else {
        switched.len() as f64 * 100.0 / initial.len() as f64
    };
    Some(CohortTransition {
        initial,
        switched,
        percent,
        issues,
    })
}

fn report(issues: &[IntegrityIssue]) {
    for issue in issues {
        warn!("History integrity: {}", issue);
    }
}
