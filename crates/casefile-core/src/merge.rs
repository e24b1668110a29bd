//! Merge engine: reconcile a cached collection with an incoming delta.
//!
//! `merge(old, new)` yields `[untouched old items] ++ [kept, reshaped new items]`:
//! - an old item survives only if its id is absent from the delta
//! - a tombstoned item (old or new) never survives; it is represented by its absence
//! - incoming items are filtered by `keep`, then transformed by `reshape`
//!
//! Within one delta the same id may appear more than once. The tombstone wins if
//! any copy is tombstoned; otherwise the copy with the latest `updatedAt` wins.
//!
//! Merging the same delta twice is a no-op, which is what makes re-requesting a
//! window after a failed sync pass safe.

use crate::entity::{Entity, Record};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Anything the merge engine can reconcile.
pub trait Mergeable {
    fn id(&self) -> &str;
    fn updated_at(&self) -> DateTime<Utc>;
    fn deleted_at(&self) -> Option<DateTime<Utc>>;

    fn is_tombstoned(&self) -> bool {
        self.deleted_at().is_some()
    }
}

impl Mergeable for Entity {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    fn deleted_at(&self) -> Option<DateTime<Utc>> {
        self.deleted_at
    }
}

impl Mergeable for Record {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    fn deleted_at(&self) -> Option<DateTime<Utc>> {
        self.deleted_at
    }
}

/// Optional per-item shaping of incoming items.
pub struct MergeOptions<'a, T> {
    /// Applied to every kept incoming item
    pub reshape: Option<&'a (dyn Fn(T) -> T + Send + Sync)>,
    /// Incoming items failing this predicate are rejected
    pub keep: Option<&'a (dyn Fn(&T) -> bool + Send + Sync)>,
}

impl<T> MergeOptions<'_, T> {
    pub fn none() -> Self {
        Self {
            reshape: None,
            keep: None,
        }
    }
}

impl<T> Default for MergeOptions<'_, T> {
    fn default() -> Self {
        Self::none()
    }
}

/// Merge a delta into a cached collection.
pub fn merge<T: Mergeable>(old: Vec<T>, new: Vec<T>, options: &MergeOptions<'_, T>) -> Vec<T> {
    let new = collapse_delta(new);
    let new_ids: HashSet<String> = new.iter().map(|item| item.id().to_string()).collect();

    let mut merged: Vec<T> = dedupe_cache(old)
        .into_iter()
        .filter(|item| !item.is_tombstoned() && !new_ids.contains(item.id()))
        .collect();

    for item in new {
        if item.is_tombstoned() {
            continue;
        }
        if let Some(keep) = options.keep {
            if !keep(&item) {
                continue;
            }
        }
        merged.push(match options.reshape {
            Some(reshape) => reshape(item),
            None => item,
        });
    }

    merged
}

/// One item per id, keeping first-appearance order.
fn collapse_delta<T: Mergeable>(items: Vec<T>) -> Vec<T> {
    let mut slots: Vec<Option<T>> = Vec::with_capacity(items.len());
    let mut index: HashMap<String, usize> = HashMap::new();

    for item in items {
        match index.get(item.id()) {
            Some(&slot) => {
                let current = slots[slot].as_ref();
                if current.is_some_and(|current| supersedes(&item, current)) {
                    slots[slot] = Some(item);
                }
            }
            None => {
                index.insert(item.id().to_string(), slots.len());
                slots.push(Some(item));
            }
        }
    }

    slots.into_iter().flatten().collect()
}

/// Whether `candidate` replaces `current` for the same id within one delta.
fn supersedes<T: Mergeable>(candidate: &T, current: &T) -> bool {
    match (candidate.is_tombstoned(), current.is_tombstoned()) {
        (true, false) => true,
        (false, true) => false,
        _ => candidate.updated_at() >= current.updated_at(),
    }
}

/// A cache should never hold duplicates; if it does, the last copy wins.
fn dedupe_cache<T: Mergeable>(items: Vec<T>) -> Vec<T> {
    let mut last: HashMap<String, usize> = HashMap::new();
    for (position, item) in items.iter().enumerate() {
        last.insert(item.id().to_string(), position);
    }
    if last.len() == items.len() {
        return items;
    }
    items
        .into_iter()
        .enumerate()
        .filter(|(position, item)| last.get(item.id()) == Some(position))
        .map(|(_, item)| item)
        .collect()
}

/// Remembers tombstones across sync passes.
///
/// A tombstoned entity disappears from the working set, but its id and deletion
/// time stay here so that an update racing the deletion is judged by time:
/// an update not newer than the tombstone is stale and dropped, a newer one
/// brings the entity back and clears the entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TombstoneLedger {
    entries: BTreeMap<String, DateTime<Utc>>,
}

impl TombstoneLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a deletion. Keeps the latest time seen for an id.
    pub fn record(&mut self, id: &str, deleted_at: DateTime<Utc>) {
        let entry = self.entries.entry(id.to_string()).or_insert(deleted_at);
        if deleted_at > *entry {
            *entry = deleted_at;
        }
    }

    pub fn deleted_at(&self, id: &str) -> Option<DateTime<Utc>> {
        self.entries.get(id).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop incoming updates that lost the race against a recorded tombstone.
    ///
    /// Returns the surviving items and the ids of the dropped ones.
    pub fn screen<T: Mergeable>(&mut self, incoming: Vec<T>) -> (Vec<T>, Vec<String>) {
        let mut kept = Vec::with_capacity(incoming.len());
        let mut stale = Vec::new();

        for item in incoming {
            if item.is_tombstoned() {
                kept.push(item);
                continue;
            }
            match self.entries.get(item.id()).copied() {
                Some(deleted_at) if item.updated_at() <= deleted_at => {
                    stale.push(item.id().to_string());
                }
                Some(_) => {
                    self.entries.remove(item.id());
                    kept.push(item);
                }
                None => kept.push(item),
            }
        }

        (kept, stale)
    }

    /// Record every tombstone present in a delta.
    pub fn absorb<T: Mergeable>(&mut self, delta: &[T]) {
        for item in delta {
            if let Some(deleted_at) = item.deleted_at() {
                self.record(item.id(), deleted_at);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::parse_date;
    use serde_json::{json, Map, Value};

    fn item(id: &str, v: i64, updated: &str) -> Entity {
        let mut fields = Map::new();
        fields.insert("v".into(), json!(v));
        let mut entity = Entity::new("org", fields);
        entity.id = id.into();
        entity.updated_at = parse_date(updated).unwrap();
        entity
    }

    fn tombstone(id: &str, deleted: &str) -> Entity {
        let mut entity = item(id, 0, deleted);
        entity.deleted_at = Some(parse_date(deleted).unwrap());
        entity
    }

    fn ids(items: &[Entity]) -> Vec<&str> {
        items.iter().map(|e| e.id.as_str()).collect()
    }

    #[test]
    fn test_update_replaces_and_tombstone_is_dropped() {
        let old = vec![item("1", 1, "2024-01-01")];
        let delta = vec![item("1", 2, "2024-01-02"), tombstone("2", "2024-01-01")];

        let merged = merge(old, delta, &MergeOptions::none());

        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].id, "1");
        assert_eq!(merged[0].field("v"), &json!(2));
    }

    #[test]
    fn test_untouched_old_items_come_first() {
        let old = vec![item("a", 1, "2024-01-01"), item("b", 1, "2024-01-01")];
        let delta = vec![item("a", 2, "2024-01-02"), item("c", 1, "2024-01-02")];

        let merged = merge(old, delta, &MergeOptions::none());

        assert_eq!(ids(&merged), vec!["b", "a", "c"]);
    }

    #[test]
    fn test_tombstone_dominates_cached_item() {
        let old = vec![item("1", 1, "2024-01-01"), item("2", 1, "2024-01-01")];
        let delta = vec![tombstone("1", "2024-01-05")];

        let merged = merge(old, delta, &MergeOptions::none());

        assert_eq!(ids(&merged), vec!["2"]);
    }

    #[test]
    fn test_merge_is_idempotent() {
        let old = vec![
            item("1", 1, "2024-01-01"),
            item("2", 1, "2024-01-01"),
            item("3", 1, "2024-01-01"),
        ];
        let delta = vec![
            item("2", 5, "2024-01-03"),
            tombstone("3", "2024-01-03"),
            item("4", 1, "2024-01-03"),
        ];

        let once = merge(old, delta.clone(), &MergeOptions::none());
        let twice = merge(once.clone(), delta, &MergeOptions::none());

        assert_eq!(once, twice);
    }

    #[test]
    fn test_merge_laws_hold_across_delta_shapes() {
        let cases: Vec<(&str, Vec<Entity>, Vec<Entity>)> = vec![
            ("empty delta", vec![item("1", 1, "2024-01-01")], vec![]),
            ("empty cache", vec![], vec![item("1", 1, "2024-01-01"), item("2", 1, "2024-01-01")]),
            (
                "duplicates mixed with tombstones",
                vec![item("1", 1, "2024-01-01"), item("2", 1, "2024-01-01")],
                vec![
                    item("1", 2, "2024-01-02"),
                    tombstone("1", "2024-01-01"),
                    item("1", 3, "2024-01-03"),
                    item("2", 2, "2024-01-02"),
                    item("2", 4, "2024-01-04"),
                    tombstone("3", "2024-01-02"),
                    item("3", 1, "2024-01-05"),
                ],
            ),
            (
                "tombstoned items already in the cache",
                vec![tombstone("1", "2024-01-01"), item("2", 1, "2024-01-01"), tombstone("2", "2024-01-02")],
                vec![item("4", 1, "2024-01-03")],
            ),
            (
                "duplicated cache",
                vec![item("1", 1, "2024-01-01"), item("1", 2, "2024-01-02"), item("5", 1, "2024-01-01")],
                vec![tombstone("5", "2024-01-03"), item("6", 1, "2024-01-03")],
            ),
            (
                "tombstones only",
                vec![item("1", 1, "2024-01-01"), item("2", 1, "2024-01-01")],
                vec![tombstone("1", "2024-01-02"), tombstone("2", "2024-01-02"), tombstone("9", "2024-01-02")],
            ),
        ];

        for (name, old, delta) in cases {
            let tombstoned: HashSet<&str> = delta
                .iter()
                .filter(|e| e.is_tombstoned())
                .map(|e| e.id.as_str())
                .collect();
            let updated: HashSet<&str> = delta
                .iter()
                .map(|e| e.id.as_str())
                .filter(|id| !tombstoned.contains(id))
                .collect();

            let once = merge(old, delta.clone(), &MergeOptions::none());
            let twice = merge(once.clone(), delta.clone(), &MergeOptions::none());

            assert_eq!(once, twice, "{}: not idempotent", name);
            let merged_ids = ids(&once);
            let unique: HashSet<&str> = merged_ids.iter().copied().collect();
            assert_eq!(unique.len(), merged_ids.len(), "{}: duplicate ids", name);
            assert!(once.iter().all(|e| !e.is_tombstoned()), "{}: tombstone kept", name);
            assert!(
                tombstoned.iter().all(|id| !unique.contains(id)),
                "{}: tombstoned id survived",
                name
            );
            assert!(updated.iter().all(|id| unique.contains(id)), "{}: update lost", name);
        }
    }

    #[test]
    fn test_tombstone_wins_within_one_delta() {
        let delta = vec![
            tombstone("1", "2024-01-01"),
            item("1", 9, "2024-02-01"),
        ];

        let merged = merge(vec![item("1", 1, "2023-12-01")], delta, &MergeOptions::none());

        assert!(merged.is_empty());
    }

    #[test]
    fn test_no_duplicate_ids() {
        let old = vec![item("1", 1, "2024-01-01"), item("1", 2, "2024-01-02")];
        let delta = vec![
            item("2", 1, "2024-01-01"),
            item("2", 3, "2024-01-03"),
            item("2", 2, "2024-01-02"),
        ];

        let merged = merge(old, delta, &MergeOptions::none());

        assert_eq!(ids(&merged), vec!["1", "2"]);
        assert_eq!(merged[0].field("v"), &json!(2));
        assert_eq!(merged[1].field("v"), &json!(3));
    }

    #[test]
    fn test_keep_and_reshape_apply_to_new_items_only() {
        let old = vec![item("odd-old", 1, "2024-01-01")];
        let delta = vec![item("a", 2, "2024-01-02"), item("b", 3, "2024-01-02")];

        let keep = |e: &Entity| e.field("v").as_i64().is_some_and(|v| v % 2 == 0);
        let reshape = |mut e: Entity| {
            e.set_field("shaped", Value::Bool(true));
            e
        };
        let options = MergeOptions {
            reshape: Some(&reshape),
            keep: Some(&keep),
        };

        let merged = merge(old, delta, &options);

        assert_eq!(ids(&merged), vec!["odd-old", "a"]);
        assert!(merged[0].field("shaped").is_null());
        assert_eq!(merged[1].field("shaped"), &json!(true));
    }

    #[test]
    fn test_rejected_item_still_evicts_cached_copy() {
        // An item that no longer passes `keep` must not linger in its old form.
        let old = vec![item("1", 2, "2024-01-01")];
        let delta = vec![item("1", 3, "2024-01-02")];
        let keep = |e: &Entity| e.field("v") == &json!(2);
        let options = MergeOptions {
            reshape: None,
            keep: Some(&keep),
        };

        assert!(merge(old, delta, &options).is_empty());
    }

    #[test]
    fn test_ledger_drops_stale_update_after_tombstone() {
        let mut ledger = TombstoneLedger::new();
        ledger.absorb(&[tombstone("1", "2024-01-05")]);

        let (kept, stale) = ledger.screen(vec![item("1", 1, "2024-01-04"), item("2", 1, "2024-01-04")]);

        assert_eq!(ids(&kept), vec!["2"]);
        assert_eq!(stale, vec!["1".to_string()]);
        assert!(ledger.deleted_at("1").is_some());
    }

    #[test]
    fn test_ledger_lets_later_update_win() {
        let mut ledger = TombstoneLedger::new();
        ledger.absorb(&[tombstone("1", "2024-01-05")]);

        let (kept, stale) = ledger.screen(vec![item("1", 1, "2024-01-06")]);

        assert_eq!(ids(&kept), vec!["1"]);
        assert!(stale.is_empty());
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_ledger_tie_goes_to_tombstone() {
        let mut ledger = TombstoneLedger::new();
        ledger.record("1", parse_date("2024-01-05").unwrap());

        let (kept, _) = ledger.screen(vec![item("1", 1, "2024-01-05")]);
        assert!(kept.is_empty());
    }

    #[test]
    fn test_ledger_keeps_latest_deletion() {
        let mut ledger = TombstoneLedger::new();
        ledger.record("1", parse_date("2024-01-05").unwrap());
        ledger.record("1", parse_date("2024-01-03").unwrap());
        assert_eq!(ledger.deleted_at("1"), parse_date("2024-01-05"));
    }
}
