use crate::connection::{Connection, ConnectionId};
use crate::history::HistoryEntry;
use crate::message::Topic;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Snapshot of who is listening, for monitoring.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BrokerStats {
    pub total_connections: usize,
    pub topics: BTreeMap<Topic, usize>,
}

/// Outcome of an admission attempt.
pub(crate) enum Admission {
    /// Registered. `replay` is the history snapshot taken under the same lock;
    /// `replaced` is the older instance that was registered under the same id.
    Admitted {
        replay: Vec<HistoryEntry>,
        replaced: Option<Arc<Connection>>,
    },
    AtCapacity,
}

#[derive(Default)]
struct Index {
    /// Primary storage: lookup by connection id
    connections: HashMap<ConnectionId, Arc<Connection>>,
    /// Secondary index: connection ids per topic for fan-out
    topic_index: HashMap<Topic, HashSet<ConnectionId>>,
}

impl Index {
    /// Drops `id` from both maps, forgetting its topic once nobody follows it.
    fn detach(&mut self, id: &ConnectionId) -> Option<Arc<Connection>> {
        let connection = self.connections.remove(id)?;
        let topic = connection.topic();

        let topic_now_empty = match self.topic_index.get_mut(topic) {
            Some(ids) => {
                ids.remove(id);
                ids.is_empty()
            }
            None => false,
        };
        if topic_now_empty {
            self.topic_index.remove(topic);
        }

        Some(connection)
    }
}

/// Connection registry with a topic index.
///
/// Only the broker's control loop calls the mutating methods; everything else
/// takes read snapshots.
#[derive(Default)]
pub(crate) struct ConnectionRegistry {
    index: RwLock<Index>,
}

impl ConnectionRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Admits `connection` unless the registry is full. An instance already
    /// registered under the same id is evicted and handed back, so the newest
    /// stream wins. `snapshot` runs under the write lock so the replay set and
    /// live membership are fixed in one step.
    pub(crate) fn admit<F>(
        &self,
        connection: &Arc<Connection>,
        max_connections: usize,
        snapshot: F,
    ) -> Admission
    where
        F: FnOnce() -> Vec<HistoryEntry>,
    {
        let mut index = self.write();

        let reuses_id = index.connections.contains_key(connection.id());
        if !reuses_id && index.connections.len() >= max_connections {
            return Admission::AtCapacity;
        }

        let replay = snapshot();
        let replaced = index.detach(connection.id());

        index
            .connections
            .insert(connection.id().clone(), Arc::clone(connection));
        index
            .topic_index
            .entry(connection.topic().clone())
            .or_default()
            .insert(connection.id().clone());

        Admission::Admitted { replay, replaced }
    }

    /// Removes the connection registered under `id`, provided it is the same
    /// instance (`serial`) that asked.
    pub(crate) fn remove(&self, id: &ConnectionId, serial: u64) -> Option<Arc<Connection>> {
        let mut index = self.write();

        let same_instance = index
            .connections
            .get(id)
            .is_some_and(|connection| connection.serial() == serial);
        if !same_instance {
            return None;
        }

        index.detach(id)
    }

    /// Empties the registry, handing back everything that was registered.
    pub(crate) fn drain(&self) -> Vec<Arc<Connection>> {
        let mut index = self.write();
        index.topic_index.clear();
        index
            .connections
            .drain()
            .map(|(_, connection)| connection)
            .collect()
    }

    pub(crate) fn get(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.read().connections.get(id).cloned()
    }

    pub(crate) fn topic_members(&self, topic: &Topic) -> Vec<Arc<Connection>> {
        let index = self.read();
        index
            .topic_index
            .get(topic)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| index.connections.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub(crate) fn all(&self) -> Vec<Arc<Connection>> {
        self.read().connections.values().cloned().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.read().connections.len()
    }

    pub(crate) fn topic_len(&self, topic: &Topic) -> usize {
        self.read().topic_index.get(topic).map_or(0, HashSet::len)
    }

    pub(crate) fn stats(&self) -> BrokerStats {
        let index = self.read();
        BrokerStats {
            total_connections: index.connections.len(),
            topics: index
                .topic_index
                .iter()
                .map(|(topic, ids)| (topic.clone(), ids.len()))
                .collect(),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Index> {
        self.index.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Index> {
        self.index.write().unwrap_or_else(PoisonError::into_inner)
    }
}
