//! Ordered, id-keyed collections used by mission state.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use super::work_item::WorkItem;

/// Work items keyed by id, iterated in first-insertion order.
///
/// Writing an item whose id already exists replaces the stored value in place,
/// so repeated planner output or re-applied updates never duplicate an item.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<WorkItem>", into = "Vec<WorkItem>")]
pub struct WorkItemLedger {
    order: Vec<String>,
    items: HashMap<String, WorkItem>,
}

impl WorkItemLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace by id. Returns true if the id was new.
    pub fn upsert(&mut self, item: WorkItem) -> bool {
        let is_new = !self.items.contains_key(&item.id);
        if is_new {
            self.order.push(item.id.clone());
        }
        self.items.insert(item.id.clone(), item);
        is_new
    }

    pub fn get(&self, id: &str) -> Option<&WorkItem> {
        self.items.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut WorkItem> {
        self.items.get_mut(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.items.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Items in insertion order
    pub fn iter(&self) -> impl Iterator<Item = &WorkItem> {
        self.order.iter().filter_map(|id| self.items.get(id))
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(|s| s.as_str())
    }
}

impl From<Vec<WorkItem>> for WorkItemLedger {
    fn from(items: Vec<WorkItem>) -> Self {
        let mut ledger = Self::new();
        for item in items {
            ledger.upsert(item);
        }
        ledger
    }
}

impl From<WorkItemLedger> for Vec<WorkItem> {
    fn from(mut ledger: WorkItemLedger) -> Self {
        ledger
            .order
            .iter()
            .filter_map(|id| ledger.items.remove(id))
            .collect()
    }
}

impl FromIterator<WorkItem> for WorkItemLedger {
    fn from_iter<T: IntoIterator<Item = WorkItem>>(iter: T) -> Self {
        let mut ledger = Self::new();
        for item in iter {
            ledger.upsert(item);
        }
        ledger
    }
}

/// Insertion-ordered set of completed work item ids. Never shrinks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct CompletedSet {
    order: Vec<String>,
    members: HashSet<String>,
}

impl CompletedSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the id was not already present.
    pub fn insert(&mut self, id: impl Into<String>) -> bool {
        let id = id.into();
        if self.members.insert(id.clone()) {
            self.order.push(id);
            true
        } else {
            false
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.members.contains(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(|s| s.as_str())
    }
}

impl From<Vec<String>> for CompletedSet {
    fn from(ids: Vec<String>) -> Self {
        let mut set = Self::new();
        for id in ids {
            set.insert(id);
        }
        set
    }
}

impl From<CompletedSet> for Vec<String> {
    fn from(set: CompletedSet) -> Self {
        set.order
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::WorkerType;

    #[test]
    fn test_ledger_last_write_wins_keeps_first_position() {
        let mut ledger = WorkItemLedger::new();
        ledger.upsert(WorkItem::new("A", WorkerType::Implementer, "first"));
        ledger.upsert(WorkItem::new("B", WorkerType::Tester, "second"));
        assert!(!ledger.upsert(WorkItem::new("A", WorkerType::Implementer, "replanned")));

        let ids: Vec<&str> = ledger.ids().collect();
        assert_eq!(ids, vec!["A", "B"]);
        assert_eq!(ledger.get("A").map(|i| i.description.as_str()), Some("replanned"));
    }

    #[test]
    fn test_ledger_deserialize_collapses_duplicates() {
        let json = r#"[
            {"id": "A", "worker_type": "implementer", "description": "one"},
            {"id": "A", "worker_type": "implementer", "description": "two"}
        ]"#;
        let ledger: WorkItemLedger = serde_json::from_str(json).unwrap();
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger.get("A").unwrap().description, "two");
    }

    #[test]
    fn test_completed_set_ignores_duplicates() {
        let mut set = CompletedSet::new();
        assert!(set.insert("A"));
        assert!(set.insert("B"));
        assert!(!set.insert("A"));
        assert_eq!(set.iter().collect::<Vec<_>>(), vec!["A", "B"]);
    }
}
