use async_trait::async_trait;
use netsync_shared_types::{NodeId, Result, SyncError};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use thiserror::Error;

#[cfg(feature = "in-memory")]
pub mod in_memory;

#[cfg(feature = "in-memory")]
pub use in_memory::{InMemoryConsistentMap, InMemoryStorage, NodeStorage};

/// Errors specific to state store operations
#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("Map {0} already exists with a different key/value type")]
    TypeMismatch(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<StateStoreError> for SyncError {
    fn from(err: StateStoreError) -> Self {
        SyncError::StoreError(err.to_string())
    }
}

/// Bounds every map key satisfies.
pub trait MapKey: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

impl<T> MapKey for T where T: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

/// Bounds every map value satisfies.
pub trait MapValue: Clone + Debug + Send + Sync + 'static {}

impl<T> MapValue for T where T: Clone + Debug + Send + Sync + 'static {}

/// A value together with the map-wide version it was written at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned<V> {
    pub value: V,
    pub version: u64,
}

impl<V> Versioned<V> {
    pub fn new(value: V, version: u64) -> Self {
        Self { value, version }
    }

    pub fn into_value(self) -> V {
        self.value
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapEventKind {
    Insert,
    Update,
    Remove,
}

/// A change to a map entry, tagged with the node whose write caused it.
#[derive(Debug, Clone)]
pub struct MapEvent<K, V> {
    pub kind: MapEventKind,
    pub key: K,
    pub new_value: Option<Versioned<V>>,
    pub old_value: Option<Versioned<V>>,
    pub origin: NodeId,
}

impl<K, V> MapEvent<K, V> {
    /// True when the write came from a node other than `local`.
    pub fn is_remote(&self, local: &NodeId) -> bool {
        &self.origin != local
    }
}

/// Receives map changes. Called synchronously once the write is visible,
/// in version order for any one key. Must not block on the map itself.
pub trait MapEventListener<K, V>: Send + Sync {
    fn event(&self, event: &MapEvent<K, V>);
}

/// Handle returned by `add_listener`, used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

/// Receives events a store generates on its own, e.g. in reaction to writes
/// made by other cluster members.
pub trait StoreDelegate<E>: Send + Sync {
    fn notify(&self, event: E);
}

/// Strongly consistent, replicated key/value map.
///
/// Every operation is linearizable per key. Conditional operations
/// (`put_if_absent`, `replace_version`, `remove_version`) are the only
/// primitives callers should use to mutate shared state they have read.
#[async_trait]
pub trait ConsistentMap<K: MapKey, V: MapValue>: Send + Sync {
    /// Name the map was opened under.
    fn name(&self) -> &str;

    /// The cluster member this handle writes as.
    fn local_node(&self) -> &NodeId;

    async fn get(&self, key: &K) -> Result<Option<Versioned<V>>>;

    /// Unconditional write. Returns the previous value.
    async fn put(&self, key: K, value: V) -> Result<Option<Versioned<V>>>;

    /// Writes only if no value is present. Returns the existing value when
    /// the write did not happen.
    async fn put_if_absent(&self, key: K, value: V) -> Result<Option<Versioned<V>>>;

    /// Writes only if a value is present. Returns the replaced value.
    async fn replace(&self, key: &K, value: V) -> Result<Option<Versioned<V>>>;

    /// Writes only if the current version equals `version`.
    async fn replace_version(&self, key: &K, version: u64, value: V) -> Result<bool>;

    /// Removes the value. Returns it if there was one.
    async fn remove(&self, key: &K) -> Result<Option<Versioned<V>>>;

    /// Removes the value only if the current version equals `version`.
    async fn remove_version(&self, key: &K, version: u64) -> Result<bool>;

    async fn entries(&self) -> Result<Vec<(K, Versioned<V>)>>;

    async fn size(&self) -> Result<usize> {
        Ok(self.entries().await?.len())
    }

    async fn contains_key(&self, key: &K) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    fn add_listener(&self, listener: Arc<dyn MapEventListener<K, V>>) -> ListenerId;

    fn remove_listener(&self, id: ListenerId);
}

/// Configuration for storage backends
#[derive(Debug, Clone)]
pub enum StorageConfig {
    #[cfg(feature = "in-memory")]
    InMemory,
}

/// Helper function to create the storage backend for a configuration.
#[cfg(feature = "in-memory")]
pub fn create_storage(config: StorageConfig) -> Result<Arc<InMemoryStorage>> {
    match config {
        StorageConfig::InMemory => Ok(Arc::new(InMemoryStorage::new())),
    }
}
