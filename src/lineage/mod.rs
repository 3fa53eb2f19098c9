//! Lineage forest over cell states.
//!
//! The store only records `parent_id` links and does not enforce acyclicity,
//! so traversal works on an explicit adjacency index with iterative walks and
//! visited sets. Every walk is capped at a configured number of states.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{LineageError, LineageResult};

/// A single parent link as stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateLink {
    pub id: i64,
    pub parent_id: Option<i64>,
}

impl StateLink {
    pub fn new(id: i64, parent_id: Option<i64>) -> Self {
        Self { id, parent_id }
    }
}

/// Which relatives a lineage query returns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineageDirection {
    Ancestors,
    Descendants,
    #[default]
    Both,
}

impl std::fmt::Display for LineageDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LineageDirection::Ancestors => write!(f, "ancestors"),
            LineageDirection::Descendants => write!(f, "descendants"),
            LineageDirection::Both => write!(f, "both"),
        }
    }
}

impl FromStr for LineageDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ancestors" => Ok(LineageDirection::Ancestors),
            "descendants" => Ok(LineageDirection::Descendants),
            "both" => Ok(LineageDirection::Both),
            _ => Err(format!("Unknown lineage direction: {}", s)),
        }
    }
}

/// Adjacency index: id to parent, id to children (ascending).
#[derive(Debug, Clone, Default)]
pub struct LineageIndex {
    parents: HashMap<i64, Option<i64>>,
    children: HashMap<i64, Vec<i64>>,
}

impl LineageIndex {
    /// Build the index from stored links.
    pub fn new(links: impl IntoIterator<Item = StateLink>) -> Self {
        let mut parents = HashMap::new();
        let mut children: HashMap<i64, Vec<i64>> = HashMap::new();

        for link in links {
            parents.insert(link.id, link.parent_id);
            if let Some(parent) = link.parent_id {
                children.entry(parent).or_default().push(link.id);
            }
        }
        for kids in children.values_mut() {
            kids.sort_unstable();
            kids.dedup();
        }

        Self { parents, children }
    }

    /// Number of indexed states.
    pub fn len(&self) -> usize {
        self.parents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parents.is_empty()
    }

    pub fn contains(&self, id: i64) -> bool {
        self.parents.contains_key(&id)
    }

    /// Direct children of `id`, ascending.
    pub fn children_of(&self, id: i64) -> &[i64] {
        self.children.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Ancestors of `id`, nearest first.
    ///
    /// Stops at a root, at a parent missing from the index, or at a state
    /// already seen.
    pub fn ancestors(&self, id: i64, limit: usize) -> LineageResult<Vec<i64>> {
        self.require(id)?;

        let mut visited = HashSet::from([id]);
        let mut result = Vec::new();
        let mut current = self.parents.get(&id).copied().flatten();

        while let Some(parent) = current {
            if !self.contains(parent) || !visited.insert(parent) {
                break;
            }
            push_capped(&mut result, parent, limit)?;
            current = self.parents.get(&parent).copied().flatten();
        }

        Ok(result)
    }

    /// Descendants of `id` in depth-first pre-order, children visited ascending.
    pub fn descendants(&self, id: i64, limit: usize) -> LineageResult<Vec<i64>> {
        self.require(id)?;

        let mut visited = HashSet::from([id]);
        let mut result = Vec::new();
        let mut stack: Vec<i64> = self.children_of(id).iter().rev().copied().collect();

        while let Some(node) = stack.pop() {
            if !visited.insert(node) {
                continue;
            }
            push_capped(&mut result, node, limit)?;
            stack.extend(self.children_of(node).iter().rev().copied());
        }

        Ok(result)
    }

    /// Relatives of `id` in the given direction, never including `id` itself.
    pub fn lineage(
        &self,
        id: i64,
        direction: LineageDirection,
        limit: usize,
    ) -> LineageResult<Vec<i64>> {
        match direction {
            LineageDirection::Ancestors => self.ancestors(id, limit),
            LineageDirection::Descendants => self.descendants(id, limit),
            LineageDirection::Both => {
                let mut result = self.ancestors(id, limit)?;
                let mut seen: HashSet<i64> = result.iter().copied().collect();
                for node in self.descendants(id, limit)? {
                    if seen.insert(node) {
                        push_capped(&mut result, node, limit)?;
                    }
                }
                Ok(result)
            }
        }
    }

    fn require(&self, id: i64) -> LineageResult<()> {
        if self.contains(id) {
            Ok(())
        } else {
            Err(LineageError::NodeNotFound { id })
        }
    }
}

fn push_capped(result: &mut Vec<i64>, id: i64, limit: usize) -> LineageResult<()> {
    if result.len() >= limit {
        return Err(LineageError::LimitExceeded { limit });
    }
    result.push(id);
    Ok(())
}

/// What happens to a state that still has children when it is deleted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletePolicy {
    /// Refuse to delete while children exist.
    #[default]
    Reject,
    /// Detach the children (their `parent_id` becomes null), then delete.
    Orphan,
}

impl std::fmt::Display for DeletePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeletePolicy::Reject => write!(f, "reject"),
            DeletePolicy::Orphan => write!(f, "orphan"),
        }
    }
}

impl FromStr for DeletePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "reject" => Ok(DeletePolicy::Reject),
            "orphan" => Ok(DeletePolicy::Orphan),
            _ => Err(format!("Unknown delete policy: {}", s)),
        }
    }
}

/// Validated delete: the state to remove and the children to detach first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeletePlan {
    pub id: i64,
    pub orphaned: Vec<i64>,
}

impl DeletePolicy {
    /// Decide how deleting `id` with the given children proceeds.
    pub fn plan(&self, id: i64, children: &[i64]) -> LineageResult<DeletePlan> {
        match self {
            DeletePolicy::Reject if !children.is_empty() => Err(LineageError::HasChildren {
                id,
                child_count: children.len(),
            }),
            DeletePolicy::Reject => Ok(DeletePlan {
                id,
                orphaned: Vec::new(),
            }),
            DeletePolicy::Orphan => Ok(DeletePlan {
                id,
                orphaned: children.to_vec(),
            }),
        }
    }
}
