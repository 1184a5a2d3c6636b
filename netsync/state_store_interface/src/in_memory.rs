use async_trait::async_trait;
use dashmap::DashMap;
use netsync_shared_types::{NodeId, Result};
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::{
    ConsistentMap, ListenerId, MapEvent, MapEventKind, MapEventListener, MapKey, MapValue,
    StateStoreError, Versioned,
};

/// In-memory stand-in for the replicated storage service.
///
/// One `InMemoryStorage` plays the role of the whole cluster: every node
/// opens maps through its own [`NodeStorage`], and maps opened under the same
/// name share one backing table. Writes made through one node's handle are
/// seen by the others' listeners as remote events. Suitable for testing and
/// single-process deployments where persistence is not required.
#[derive(Default)]
pub struct InMemoryStorage {
    maps: DashMap<String, Arc<dyn Any + Send + Sync>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Storage as seen from `node`.
    pub fn for_node(self: &Arc<Self>, node: NodeId) -> NodeStorage {
        NodeStorage {
            node,
            storage: Arc::clone(self),
        }
    }

    fn shared<K: MapKey, V: MapValue>(&self, name: &str) -> Result<Arc<SharedMap<K, V>>> {
        let table = self
            .maps
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(map = name, "Creating in-memory map");
                Arc::new(SharedMap::<K, V>::new()) as Arc<dyn Any + Send + Sync>
            })
            .clone();
        table
            .downcast::<SharedMap<K, V>>()
            .map_err(|_| StateStoreError::TypeMismatch(name.to_string()).into())
    }
}

/// Per-node view of an [`InMemoryStorage`].
#[derive(Clone)]
pub struct NodeStorage {
    node: NodeId,
    storage: Arc<InMemoryStorage>,
}

impl NodeStorage {
    pub fn local_node(&self) -> &NodeId {
        &self.node
    }

    /// Opens (creating if needed) the map called `name`.
    pub fn consistent_map<K: MapKey, V: MapValue>(
        &self,
        name: &str,
    ) -> Result<Arc<dyn ConsistentMap<K, V>>> {
        let shared = self.storage.shared::<K, V>(name)?;
        Ok(Arc::new(InMemoryConsistentMap {
            name: name.to_string(),
            node: self.node.clone(),
            shared,
        }))
    }
}

struct SharedMap<K, V> {
    entries: RwLock<HashMap<K, Versioned<V>>>,
    next_version: AtomicU64,
    next_listener: AtomicU64,
    listeners: DashMap<u64, Arc<dyn MapEventListener<K, V>>>,
}

impl<K: MapKey, V: MapValue> SharedMap<K, V> {
    fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            next_version: AtomicU64::new(1),
            next_listener: AtomicU64::new(1),
            listeners: DashMap::new(),
        }
    }

    fn version(&self) -> u64 {
        self.next_version.fetch_add(1, Ordering::SeqCst)
    }

    /// Callers hold the write lock, so events for a key reach listeners in
    /// version order.
    fn notify(&self, event: MapEvent<K, V>) {
        // Snapshot first so listeners may (un)register without deadlocking.
        let listeners: Vec<_> = self
            .listeners
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for listener in listeners {
            listener.event(&event);
        }
    }
}

/// Handle on a shared in-memory map, writing as one node.
pub struct InMemoryConsistentMap<K, V> {
    name: String,
    node: NodeId,
    shared: Arc<SharedMap<K, V>>,
}

impl<K: MapKey, V: MapValue> InMemoryConsistentMap<K, V> {
    fn event(
        &self,
        kind: MapEventKind,
        key: K,
        new_value: Option<Versioned<V>>,
        old_value: Option<Versioned<V>>,
    ) -> MapEvent<K, V> {
        MapEvent {
            kind,
            key,
            new_value,
            old_value,
            origin: self.node.clone(),
        }
    }
}

#[async_trait]
impl<K: MapKey, V: MapValue> ConsistentMap<K, V> for InMemoryConsistentMap<K, V> {
    fn name(&self) -> &str {
        &self.name
    }

    fn local_node(&self) -> &NodeId {
        &self.node
    }

    async fn get(&self, key: &K) -> Result<Option<Versioned<V>>> {
        let entries = self.shared.entries.read().await;
        Ok(entries.get(key).cloned())
    }

    async fn put(&self, key: K, value: V) -> Result<Option<Versioned<V>>> {
        let mut entries = self.shared.entries.write().await;
        let new_value = Versioned::new(value, self.shared.version());
        let previous = entries.insert(key.clone(), new_value.clone());
        let kind = if previous.is_some() {
            MapEventKind::Update
        } else {
            MapEventKind::Insert
        };
        self.shared
            .notify(self.event(kind, key, Some(new_value), previous.clone()));
        Ok(previous)
    }

    async fn put_if_absent(&self, key: K, value: V) -> Result<Option<Versioned<V>>> {
        let mut entries = self.shared.entries.write().await;
        if let Some(existing) = entries.get(&key) {
            return Ok(Some(existing.clone()));
        }
        let inserted = Versioned::new(value, self.shared.version());
        entries.insert(key.clone(), inserted.clone());
        self.shared
            .notify(self.event(MapEventKind::Insert, key, Some(inserted), None));
        Ok(None)
    }

    async fn replace(&self, key: &K, value: V) -> Result<Option<Versioned<V>>> {
        let mut entries = self.shared.entries.write().await;
        let Some(slot) = entries.get_mut(key) else {
            return Ok(None);
        };
        let new_value = Versioned::new(value, self.shared.version());
        let previous = std::mem::replace(slot, new_value.clone());
        self.shared.notify(self.event(
            MapEventKind::Update,
            key.clone(),
            Some(new_value),
            Some(previous.clone()),
        ));
        Ok(Some(previous))
    }

    async fn replace_version(&self, key: &K, version: u64, value: V) -> Result<bool> {
        let mut entries = self.shared.entries.write().await;
        let (previous, new_value) = match entries.get_mut(key) {
            Some(slot) if slot.version == version => {
                let new_value = Versioned::new(value, self.shared.version());
                (std::mem::replace(slot, new_value.clone()), new_value)
            }
            _ => return Ok(false),
        };
        self.shared.notify(self.event(
            MapEventKind::Update,
            key.clone(),
            Some(new_value),
            Some(previous),
        ));
        Ok(true)
    }

    async fn remove(&self, key: &K) -> Result<Option<Versioned<V>>> {
        let mut entries = self.shared.entries.write().await;
        let previous = entries.remove(key);
        if let Some(old) = &previous {
            self.shared.notify(self.event(
                MapEventKind::Remove,
                key.clone(),
                None,
                Some(old.clone()),
            ));
        }
        Ok(previous)
    }

    async fn remove_version(&self, key: &K, version: u64) -> Result<bool> {
        let mut entries = self.shared.entries.write().await;
        let previous = match entries.get(key) {
            Some(current) if current.version == version => entries.remove(key),
            _ => return Ok(false),
        };
        if let Some(old) = previous {
            self.shared
                .notify(self.event(MapEventKind::Remove, key.clone(), None, Some(old)));
        }
        Ok(true)
    }

    async fn entries(&self) -> Result<Vec<(K, Versioned<V>)>> {
        let entries = self.shared.entries.read().await;
        Ok(entries
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn size(&self) -> Result<usize> {
        Ok(self.shared.entries.read().await.len())
    }

    fn add_listener(&self, listener: Arc<dyn MapEventListener<K, V>>) -> ListenerId {
        let id = self.shared.next_listener.fetch_add(1, Ordering::SeqCst);
        self.shared.listeners.insert(id, listener);
        ListenerId(id)
    }

    fn remove_listener(&self, id: ListenerId) {
        self.shared.listeners.remove(&id.0);
    }
}
