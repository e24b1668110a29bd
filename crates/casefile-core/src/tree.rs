//! DocumentTree: a person's documents and folders as an arena indexed by id.
//!
//! Nodes only store their `parentId`; child lists are always derived, so there
//! is no second copy of the structure to fall out of sync. Every parent chain
//! ends at `"root"`: nodes pointing at a missing parent or sitting on a cycle are
//! re-attached to the root when the tree is built.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use thiserror::Error;

/// Parent id of top-level nodes.
pub const ROOT_ID: &str = "root";

#[derive(Debug, Error)]
pub enum TreeError {
    #[error("Node not found: {0}")]
    NotFound(String),

    #[error("Node already exists: {0}")]
    DuplicateId(String),

    #[error("Parent not found: {0}")]
    ParentNotFound(String),

    #[error("Parent is not a folder: {0}")]
    NotAFolder(String),

    #[error("Node is managed by the system and cannot be moved or removed: {0}")]
    Immovable(String),

    #[error("Moving {id} under {parent} would create a cycle")]
    Cycle { id: String, parent: String },

    #[error("Invalid documents array: {0}")]
    InvalidDocuments(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, TreeError>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NodeKind {
    #[default]
    Document,
    Folder,
}

fn root_id() -> String {
    ROOT_ID.to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeNode {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "type", default)]
    pub kind: NodeKind,
    #[serde(default = "root_id")]
    pub parent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<i64>,
    /// `Some(false)` marks system-managed nodes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub movable: Option<bool>,
    /// Name, file metadata and anything else the node carries
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TreeNode {
    pub fn document(id: &str, parent_id: &str) -> Self {
        Self::new(id, NodeKind::Document, parent_id)
    }

    pub fn folder(id: &str, parent_id: &str) -> Self {
        Self::new(id, NodeKind::Folder, parent_id)
    }

    fn new(id: &str, kind: NodeKind, parent_id: &str) -> Self {
        Self {
            id: id.to_string(),
            kind,
            parent_id: parent_id.to_string(),
            position: None,
            movable: None,
            extra: Map::new(),
        }
    }

    pub fn is_movable(&self) -> bool {
        self.movable != Some(false)
    }

    pub fn is_folder(&self) -> bool {
        self.kind == NodeKind::Folder
    }
}

/// A structural fix applied while building a tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeRepair {
    /// The node's parent did not exist
    Dangling { id: String, missing_parent: String },
    /// The node closed a parent cycle
    Cycle { id: String },
}

#[derive(Debug, Clone, Default)]
pub struct DocumentTree {
    nodes: BTreeMap<String, TreeNode>,
}

impl DocumentTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a tree, re-attaching dangling and cyclic nodes to the root.
    ///
    /// On duplicate ids the last node wins.
    pub fn from_nodes(nodes: impl IntoIterator<Item = TreeNode>) -> (Self, Vec<TreeRepair>) {
        let mut tree = Self {
            nodes: nodes.into_iter().map(|n| (n.id.clone(), n)).collect(),
        };
        let mut repairs = Vec::new();

        let dangling: Vec<String> = tree
            .nodes
            .values()
            .filter(|n| n.parent_id != ROOT_ID && !tree.nodes.contains_key(&n.parent_id))
            .map(|n| n.id.clone())
            .collect();
        for id in dangling {
            if let Some(node) = tree.nodes.get_mut(&id) {
                repairs.push(TreeRepair::Dangling {
                    id: id.clone(),
                    missing_parent: std::mem::replace(&mut node.parent_id, root_id()),
                });
            }
        }

        let ids: Vec<String> = tree.nodes.keys().cloned().collect();
        for id in ids {
            while let Some(closing) = tree.cycle_from(&id) {
                if let Some(node) = tree.nodes.get_mut(&closing) {
                    node.parent_id = root_id();
                }
                repairs.push(TreeRepair::Cycle { id: closing });
            }
        }

        (tree, repairs)
    }

    /// Parse a person's `documents` array. Non-array values give an empty tree.
    pub fn from_documents(documents: &Value) -> Result<(Self, Vec<TreeRepair>)> {
        let nodes: Vec<TreeNode> = match documents {
            Value::Array(_) => serde_json::from_value(documents.clone())?,
            _ => Vec::new(),
        };
        Ok(Self::from_nodes(nodes))
    }

    /// The `documents` array, in depth-first order.
    pub fn to_documents(&self) -> Result<Value> {
        let mut ordered = Vec::with_capacity(self.nodes.len());
        self.walk(ROOT_ID, &mut ordered);
        Ok(serde_json::to_value(ordered)?)
    }

    fn walk<'a>(&'a self, parent: &str, out: &mut Vec<&'a TreeNode>) {
        for child in self.children(parent) {
            out.push(child);
            self.walk(&child.id, out);
        }
    }

    /// Follow parents from `start`; if the walk loops, the id whose parent
    /// closes the loop.
    fn cycle_from(&self, start: &str) -> Option<String> {
        let mut seen = HashSet::new();
        let mut current = start;
        loop {
            if current == ROOT_ID {
                return None;
            }
            let node = self.nodes.get(current)?;
            seen.insert(current);
            if seen.contains(node.parent_id.as_str()) {
                return Some(node.id.clone());
            }
            current = &node.parent_id;
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&TreeNode> {
        self.nodes.get(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &TreeNode> {
        self.nodes.values()
    }

    /// Direct children of `parent`, by position then id. Unpositioned nodes go last.
    pub fn children(&self, parent: &str) -> Vec<&TreeNode> {
        let mut children: Vec<&TreeNode> = self
            .nodes
            .values()
            .filter(|n| n.parent_id == parent)
            .collect();
        children.sort_by(|a, b| {
            (a.position.is_none(), a.position, &a.id).cmp(&(b.position.is_none(), b.position, &b.id))
        });
        children
    }

    pub fn roots(&self) -> Vec<&TreeNode> {
        self.children(ROOT_ID)
    }

    /// Parents of `id`, nearest first, excluding the root.
    pub fn ancestors(&self, id: &str) -> Result<Vec<&TreeNode>> {
        let node = self.require(id)?;
        let mut ancestors = Vec::new();
        let mut parent = node.parent_id.as_str();
        while let Some(ancestor) = self.nodes.get(parent) {
            if ancestors.len() > self.nodes.len() {
                break;
            }
            ancestors.push(ancestor);
            parent = &ancestor.parent_id;
        }
        Ok(ancestors)
    }

    /// Add a node under an existing folder (or the root), appended when it has
    /// no position.
    pub fn insert(&mut self, mut node: TreeNode) -> Result<()> {
        if self.nodes.contains_key(&node.id) {
            return Err(TreeError::DuplicateId(node.id));
        }
        self.check_parent(&node.parent_id)?;
        if node.position.is_none() {
            node.position = Some(self.next_position(&node.parent_id));
        }
        self.nodes.insert(node.id.clone(), node);
        Ok(())
    }

    /// Reparent a node. Without a position it goes last among its new siblings.
    pub fn move_node(&mut self, id: &str, new_parent: &str, position: Option<i64>) -> Result<()> {
        let node = self.require(id)?;
        if !node.is_movable() {
            return Err(TreeError::Immovable(id.to_string()));
        }
        self.check_parent(new_parent)?;
        if new_parent == id || self.is_descendant(new_parent, id) {
            return Err(TreeError::Cycle {
                id: id.to_string(),
                parent: new_parent.to_string(),
            });
        }

        let position = position.unwrap_or_else(|| self.next_position(new_parent));
        if let Some(node) = self.nodes.get_mut(id) {
            node.parent_id = new_parent.to_string();
            node.position = Some(position);
        }
        Ok(())
    }

    /// Remove a node. A removed folder's children move up to its parent, so a
    /// folder holding a system-managed child cannot be removed.
    pub fn remove(&mut self, id: &str) -> Result<TreeNode> {
        if !self.require(id)?.is_movable() {
            return Err(TreeError::Immovable(id.to_string()));
        }
        if let Some(pinned) = self.children(id).into_iter().find(|n| !n.is_movable()) {
            return Err(TreeError::Immovable(pinned.id.clone()));
        }
        let removed = self
            .nodes
            .remove(id)
            .ok_or_else(|| TreeError::NotFound(id.to_string()))?;

        let mut next = self.next_position(&removed.parent_id);
        let orphans: Vec<String> = self.children(id).iter().map(|n| n.id.clone()).collect();
        for orphan in orphans {
            if let Some(node) = self.nodes.get_mut(&orphan) {
                node.parent_id = removed.parent_id.clone();
                node.position = Some(next);
                next += 1;
            }
        }
        Ok(removed)
    }

    /// Renumber every sibling group 0..n, keeping the current order.
    pub fn normalize_positions(&mut self) {
        let mut parents: Vec<String> = self.nodes.values().map(|n| n.parent_id.clone()).collect();
        parents.sort();
        parents.dedup();

        for parent in parents {
            let order: Vec<String> = self.children(&parent).iter().map(|n| n.id.clone()).collect();
            for (position, id) in order.into_iter().enumerate() {
                if let Some(node) = self.nodes.get_mut(&id) {
                    node.position = Some(position as i64);
                }
            }
        }
    }

    fn require(&self, id: &str) -> Result<&TreeNode> {
        self.nodes
            .get(id)
            .ok_or_else(|| TreeError::NotFound(id.to_string()))
    }

    fn check_parent(&self, parent: &str) -> Result<()> {
        if parent == ROOT_ID {
            return Ok(());
        }
        let node = self
            .nodes
            .get(parent)
            .ok_or_else(|| TreeError::ParentNotFound(parent.to_string()))?;
        if !node.is_folder() {
            return Err(TreeError::NotAFolder(parent.to_string()));
        }
        Ok(())
    }

    /// Whether `candidate` sits somewhere below `ancestor`.
    fn is_descendant(&self, candidate: &str, ancestor: &str) -> bool {
        self.ancestors(candidate)
            .map(|chain| chain.iter().any(|n| n.id == ancestor))
            .unwrap_or(false)
    }

    fn next_position(&self, parent: &str) -> i64 {
        self.nodes
            .values()
            .filter(|n| n.parent_id == parent)
            .filter_map(|n| n.position)
            .max()
            .map_or(0, |max| max + 1)
    }
}
