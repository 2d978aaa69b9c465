//! Device group hierarchy.
//!
//! Groups form a forest via their parent pointer. Every write is checked
//! against the cached hierarchy before it reaches storage so a cycle can
//! never be persisted.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::RwLock;
use tracing::info;

use crate::model::Group;
use crate::storage::GroupStore;

#[derive(Debug, Error)]
pub enum GroupError {
    /// The write would make a group its own ancestor.
    #[error("cycle in group hierarchy")]
    Cycle,

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

pub struct GroupManager {
    store: Arc<dyn GroupStore>,
    items: RwLock<HashMap<i64, Group>>,
    refreshed: AtomicBool,
}

impl GroupManager {
    pub fn new(store: Arc<dyn GroupStore>) -> Self {
        Self {
            store,
            items: RwLock::new(HashMap::new()),
            refreshed: AtomicBool::new(false),
        }
    }

    /// All known groups.
    ///
    /// An empty cache is only ambiguous at cold start: the first empty read
    /// triggers a one-shot refresh from storage; later empty reads are
    /// returned as-is.
    pub async fn all(&self) -> Result<Vec<Group>, GroupError> {
        if self.items.read().await.is_empty() && !self.refreshed.swap(true, Ordering::SeqCst) {
            self.refresh().await?;
        }
        Ok(self.items.read().await.values().cloned().collect())
    }

    pub async fn get(&self, id: i64) -> Option<Group> {
        self.items.read().await.get(&id).cloned()
    }

    /// Insert a new group. Fails with [`GroupError::Cycle`] before anything
    /// is persisted if the parent chain would revisit a node.
    pub async fn add(&self, mut group: Group) -> Result<Group, GroupError> {
        self.check_cycle(&group).await?;
        group.id = self.store.insert_group(&group).await?;
        self.items.write().await.insert(group.id, group.clone());
        Ok(group)
    }

    /// Update an existing group, subject to the same cycle check.
    pub async fn update(&self, group: Group) -> Result<Group, GroupError> {
        self.check_cycle(&group).await?;
        self.store.update_group(&group).await?;
        self.items.write().await.insert(group.id, group.clone());
        Ok(group)
    }

    async fn refresh(&self) -> Result<(), GroupError> {
        let groups = self.store.fetch_groups().await?;
        info!(count = groups.len(), "Group cache refreshed");
        let mut items = self.items.write().await;
        items.clear();
        items.extend(groups.into_iter().map(|g| (g.id, g)));
        Ok(())
    }

    /// Walk the candidate's parent chain through the cache; reject when a
    /// node repeats. The walk ends at a missing or parentless group.
    async fn check_cycle(&self, candidate: &Group) -> Result<(), GroupError> {
        let items = self.items.read().await;
        let mut visited = HashSet::from([candidate.id]);
        let mut parent = candidate.group_id;
        while let Some(parent_id) = parent {
            if !visited.insert(parent_id) {
                return Err(GroupError::Cycle);
            }
            parent = items.get(&parent_id).and_then(|g| g.group_id);
        }
        Ok(())
    }
}
