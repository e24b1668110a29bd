//! Collection: the static table of synced collections and their merge strategies.
//!
//! Each collection resolves at compile time to a `CollectionStrategy`: where it
//! lives on the server, whether its plaintext may touch disk, and the optional
//! `reshape`/`keep` functions the merge engine applies to incoming items.

use crate::entity::Entity;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("Unknown collection: {0}")]
pub struct UnknownCollection(pub String);

/// Every collection the engine synchronizes, in merge order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Collection {
    Person,
    Group,
    Report,
    Action,
    Territory,
    Place,
    RelPersonPlace,
    TerritoryObservation,
    Comment,
    Passage,
    Rencontre,
    Consultation,
    Treatment,
    MedicalFile,
}

/// Context handed to `keep` predicates.
#[derive(Debug, Clone, Default)]
pub struct MergeContext {
    /// Id of the user the working set is built for
    pub user_id: String,
}

/// How one collection is fetched, stored, and shaped.
#[derive(Clone, Copy)]
pub struct CollectionStrategy {
    /// Server route, without leading slash
    pub path: &'static str,
    /// Key in the `/organisation/stats` answer
    pub stats_key: &'static str,
    /// Sensitive collections only ever persist ciphertext
    pub sensitive: bool,
    /// Applied to every kept incoming item
    pub reshape: Option<fn(Entity) -> Entity>,
    /// Incoming items failing this are dropped from the working set
    pub keep: Option<fn(&Entity, &MergeContext) -> bool>,
}

impl CollectionStrategy {
    pub fn apply_reshape(&self, entity: Entity) -> Entity {
        match self.reshape {
            Some(reshape) => reshape(entity),
            None => entity,
        }
    }

    pub fn keeps(&self, entity: &Entity, ctx: &MergeContext) -> bool {
        self.keep.is_none_or(|keep| keep(entity, ctx))
    }
}

impl Collection {
    /// Fixed merge order of a sync pass.
    pub const ALL: [Collection; 14] = [
        Collection::Person,
        Collection::Group,
        Collection::Report,
        Collection::Action,
        Collection::Territory,
        Collection::Place,
        Collection::RelPersonPlace,
        Collection::TerritoryObservation,
        Collection::Comment,
        Collection::Passage,
        Collection::Rencontre,
        Collection::Consultation,
        Collection::Treatment,
        Collection::MedicalFile,
    ];

    pub const fn strategy(self) -> CollectionStrategy {
        match self {
            Collection::Person => CollectionStrategy {
                path: "person",
                stats_key: "persons",
                sensitive: false,
                reshape: Some(reshape_person),
                keep: None,
            },
            Collection::Group => plain("group", "groups"),
            Collection::Report => plain("report", "reports"),
            Collection::Action => CollectionStrategy {
                path: "action",
                stats_key: "actions",
                sensitive: false,
                reshape: Some(reshape_action),
                keep: None,
            },
            Collection::Territory => plain("territory", "territories"),
            Collection::Place => plain("place", "places"),
            Collection::RelPersonPlace => plain("relPersonPlace", "relsPersonPlace"),
            Collection::TerritoryObservation => {
                plain("territory-observation", "territoryObservations")
            }
            Collection::Comment => plain("comment", "comments"),
            Collection::Passage => plain("passage", "passages"),
            Collection::Rencontre => plain("rencontre", "rencontres"),
            Collection::Consultation => CollectionStrategy {
                path: "consultation",
                stats_key: "consultations",
                sensitive: true,
                reshape: Some(reshape_medical),
                keep: Some(keep_visible_consultation),
            },
            Collection::Treatment => CollectionStrategy {
                path: "treatment",
                stats_key: "treatments",
                sensitive: true,
                reshape: Some(reshape_medical),
                keep: None,
            },
            Collection::MedicalFile => CollectionStrategy {
                path: "medical-file",
                stats_key: "medicalFiles",
                sensitive: true,
                reshape: Some(reshape_medical),
                keep: None,
            },
        }
    }

    pub fn path(self) -> &'static str {
        self.strategy().path
    }

    pub fn is_sensitive(self) -> bool {
        self.strategy().sensitive
    }

    /// Key of this collection's slot in the local store.
    pub fn slot(self) -> &'static str {
        self.strategy().path
    }
}

impl Display for Collection {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.path())
    }
}

impl FromStr for Collection {
    type Err = UnknownCollection;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Collection::ALL
            .into_iter()
            .find(|c| c.path() == s || c.strategy().stats_key == s)
            .ok_or_else(|| UnknownCollection(s.to_string()))
    }
}

const fn plain(path: &'static str, stats_key: &'static str) -> CollectionStrategy {
    CollectionStrategy {
        path,
        stats_key,
        sensitive: false,
        reshape: None,
        keep: None,
    }
}

/// Make sure a payload field holds an array.
fn ensure_array(entity: &mut Entity, field: &str) {
    match entity.fields.get(field) {
        Some(Value::Array(_)) => {}
        _ => {
            entity.fields.insert(field.to_string(), Value::Array(Vec::new()));
        }
    }
}

fn reshape_person(mut person: Entity) -> Entity {
    ensure_array(&mut person, "documents");
    person.history.sort_by_key(|entry| entry.date);
    person
}

fn reshape_action(mut action: Entity) -> Entity {
    ensure_array(&mut action, "categories");
    ensure_array(&mut action, "documents");
    action
}

fn reshape_medical(mut item: Entity) -> Entity {
    ensure_array(&mut item, "documents");
    item
}

/// Consultations restricted with `onlyVisibleBy` stay out of other users' working sets.
fn keep_visible_consultation(consultation: &Entity, ctx: &MergeContext) -> bool {
    match consultation.field("onlyVisibleBy") {
        Value::Array(users) if !users.is_empty() => users
            .iter()
            .any(|user| user.as_str() == Some(ctx.user_id.as_str())),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};

    fn entity(fields: Value) -> Entity {
        let Value::Object(map) = fields else {
            return Entity::new("org", Map::new());
        };
        Entity::new("org", map)
    }

    #[test]
    fn test_paths_are_unique() {
        let mut paths: Vec<_> = Collection::ALL.iter().map(|c| c.path()).collect();
        paths.sort();
        paths.dedup();
        assert_eq!(paths.len(), Collection::ALL.len());
    }

    #[test]
    fn test_medical_collections_are_sensitive() {
        let sensitive: Vec<_> = Collection::ALL
            .into_iter()
            .filter(|c| c.is_sensitive())
            .collect();
        assert_eq!(
            sensitive,
            vec![Collection::Consultation, Collection::Treatment, Collection::MedicalFile]
        );
    }

    #[test]
    fn test_parse_by_path_or_stats_key() {
        assert_eq!("person".parse::<Collection>().unwrap(), Collection::Person);
        assert_eq!("medicalFiles".parse::<Collection>().unwrap(), Collection::MedicalFile);
        assert!("nope".parse::<Collection>().is_err());
    }

    #[test]
    fn test_person_reshape_defaults_documents() {
        let reshape = Collection::Person.strategy().reshape.unwrap();
        let person = reshape(entity(json!({ "name": "A", "documents": "garbage" })));
        assert_eq!(person.field("documents"), &json!([]));
    }

    #[test]
    fn test_consultation_visibility() {
        let keep = Collection::Consultation.strategy().keep.unwrap();
        let ctx = MergeContext { user_id: "u1".into() };

        assert!(keep(&entity(json!({})), &ctx));
        assert!(keep(&entity(json!({ "onlyVisibleBy": [] })), &ctx));
        assert!(keep(&entity(json!({ "onlyVisibleBy": ["u1", "u2"] })), &ctx));
        assert!(!keep(&entity(json!({ "onlyVisibleBy": ["u2"] })), &ctx));
    }
}
