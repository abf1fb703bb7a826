use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use thiserror::Error;

use crate::core::{BlockId, INodeId};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
/// A failure produced by a local block or inode store.
pub enum StorageError {
    #[error("The key does not exist in the local store.")]
    NotFound,

    #[error("The local store has no space left for the write.")]
    OutOfSpace,

    #[error("The local store has been closed.")]
    Closed,

    #[error("Local store IO failure: {0}")]
    Io(String),
}

#[async_trait]
/// The local engine storing fixed size blocks.
///
/// Implementations must be safe to call concurrently from many tasks at once.
pub trait BlockStore: Send + Sync + 'static {
    /// Retrieves a block, returning [StorageError::NotFound] if it does not exist.
    async fn get(&self, id: BlockId) -> Result<Bytes, StorageError>;

    /// Inserts or replaces a block.
    async fn put(&self, id: BlockId, data: Bytes) -> Result<(), StorageError>;

    /// Inserts a block only if it does not already exist.
    ///
    /// Returns `true` if the block was inserted.
    ///
    /// The default implementation is not atomic with respect to concurrent
    /// writers, stores which can should override it.
    async fn put_if_absent(&self, id: BlockId, data: Bytes) -> Result<bool, StorageError> {
        match self.get(id).await {
            Ok(_) => Ok(false),
            Err(StorageError::NotFound) => self.put(id, data).await.map(|_| true),
            Err(e) => Err(e),
        }
    }

    /// Removes a block, this is a no-op if the block does not exist.
    async fn delete(&self, id: BlockId) -> Result<(), StorageError>;

    /// Lists every block held by the store.
    async fn keys(&self) -> Result<Vec<BlockId>, StorageError>;

    /// Closes the store, any operation after this returns [StorageError::Closed].
    async fn close(&self) -> Result<(), StorageError>;
}

#[async_trait]
/// The local engine storing inode records.
///
/// Implementations must be safe to call concurrently from many tasks at once.
pub trait INodeStore: Send + Sync + 'static {
    /// Retrieves a record, returning [StorageError::NotFound] if it does not exist.
    async fn get(&self, id: INodeId) -> Result<Bytes, StorageError>;

    /// Inserts or replaces a record.
    async fn put(&self, id: INodeId, record: Bytes) -> Result<(), StorageError>;

    /// Inserts a record only if it does not already exist.
    ///
    /// Returns `true` if the record was inserted.
    async fn put_if_absent(&self, id: INodeId, record: Bytes) -> Result<bool, StorageError> {
        match self.get(id).await {
            Ok(_) => Ok(false),
            Err(StorageError::NotFound) => self.put(id, record).await.map(|_| true),
            Err(e) => Err(e),
        }
    }

    /// Removes a record, this is a no-op if the record does not exist.
    async fn delete(&self, id: INodeId) -> Result<(), StorageError>;

    /// Lists every record held by the store.
    async fn keys(&self) -> Result<Vec<INodeId>, StorageError>;

    /// Closes the store, any operation after this returns [StorageError::Closed].
    async fn close(&self) -> Result<(), StorageError>;
}

/// A simple in memory table with an optional entry limit.
struct MemoryTable<K> {
    entries: RwLock<HashMap<K, Bytes>>,
    capacity: Option<usize>,
    closed: AtomicBool,
}

impl<K: Hash + Eq + Copy> MemoryTable<K> {
    fn new(capacity: Option<usize>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            capacity,
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<(), StorageError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed);
        }
        Ok(())
    }

    fn get(&self, key: &K) -> Result<Bytes, StorageError> {
        self.ensure_open()?;
        self.entries
            .read()
            .get(key)
            .cloned()
            .ok_or(StorageError::NotFound)
    }

    fn put(&self, key: K, value: Bytes, overwrite: bool) -> Result<bool, StorageError> {
        self.ensure_open()?;
        let mut entries = self.entries.write();

        if entries.contains_key(&key) {
            if overwrite {
                entries.insert(key, value);
            }
            return Ok(overwrite);
        }

        if let Some(capacity) = self.capacity {
            if entries.len() >= capacity {
                return Err(StorageError::OutOfSpace);
            }
        }

        entries.insert(key, value);
        Ok(true)
    }

    fn delete(&self, key: &K) -> Result<(), StorageError> {
        self.ensure_open()?;
        self.entries.write().remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<K>, StorageError> {
        self.ensure_open()?;
        Ok(self.entries.read().keys().copied().collect())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// An in memory [BlockStore].
pub struct MemoryBlockStore(MemoryTable<BlockId>);

impl Default for MemoryBlockStore {
    fn default() -> Self {
        Self(MemoryTable::new(None))
    }
}

impl MemoryBlockStore {
    /// Creates a store which rejects writes with [StorageError::OutOfSpace]
    /// once it holds `capacity` blocks.
    pub fn with_capacity(capacity: usize) -> Self {
        Self(MemoryTable::new(Some(capacity)))
    }
}

#[async_trait]
impl BlockStore for MemoryBlockStore {
    async fn get(&self, id: BlockId) -> Result<Bytes, StorageError> {
        self.0.get(&id)
    }

    async fn put(&self, id: BlockId, data: Bytes) -> Result<(), StorageError> {
        self.0.put(id, data, true).map(|_| ())
    }

    async fn put_if_absent(&self, id: BlockId, data: Bytes) -> Result<bool, StorageError> {
        self.0.put(id, data, false)
    }

    async fn delete(&self, id: BlockId) -> Result<(), StorageError> {
        self.0.delete(&id)
    }

    async fn keys(&self) -> Result<Vec<BlockId>, StorageError> {
        self.0.keys()
    }

    async fn close(&self) -> Result<(), StorageError> {
        self.0.close();
        Ok(())
    }
}

/// An in memory [INodeStore].
pub struct MemoryINodeStore(MemoryTable<INodeId>);

impl Default for MemoryINodeStore {
    fn default() -> Self {
        Self(MemoryTable::new(None))
    }
}

impl MemoryINodeStore {
    /// Creates a store which rejects writes with [StorageError::OutOfSpace]
    /// once it holds `capacity` records.
    pub fn with_capacity(capacity: usize) -> Self {
        Self(MemoryTable::new(Some(capacity)))
    }
}

#[async_trait]
impl INodeStore for MemoryINodeStore {
    async fn get(&self, id: INodeId) -> Result<Bytes, StorageError> {
        self.0.get(&id)
    }

    async fn put(&self, id: INodeId, record: Bytes) -> Result<(), StorageError> {
        self.0.put(id, record, true).map(|_| ())
    }

    async fn put_if_absent(&self, id: INodeId, record: Bytes) -> Result<bool, StorageError> {
        self.0.put(id, record, false)
    }

    async fn delete(&self, id: INodeId) -> Result<(), StorageError> {
        self.0.delete(&id)
    }

    async fn keys(&self) -> Result<Vec<INodeId>, StorageError> {
        self.0.keys()
    }

    async fn close(&self) -> Result<(), StorageError> {
        self.0.close();
        Ok(())
    }
}

#[cfg(any(test, feature = "test-utils"))]
/// A conformance suite every store backend is expected to pass.
pub mod test_suite {
    use std::any::type_name;
    use std::collections::HashSet;

    use bytes::Bytes;

    use super::{BlockStore, INodeStore, StorageError};
    use crate::core::{BlockId, INodeId};

    /// Runs the block store suite against a fresh, empty store.
    pub async fn run_block_store_suite<S: BlockStore>(store: S) {
        info!("Starting block store suite for: {}", type_name::<S>());

        let first = BlockId::new(1, 1, 0);
        let second = BlockId::new(1, 1, 1);
        let other_volume = BlockId::new(2, 1, 0);

        assert_eq!(store.get(first).await, Err(StorageError::NotFound));
        assert!(store.keys().await.expect("List keys").is_empty());

        store
            .put(first, Bytes::from_static(b"first"))
            .await
            .expect("Put block");
        store
            .put(second, Bytes::from_static(b"second"))
            .await
            .expect("Put block");
        store
            .put(other_volume, Bytes::from_static(b"other"))
            .await
            .expect("Put block");

        assert_eq!(store.get(first).await, Ok(Bytes::from_static(b"first")));
        assert_eq!(store.get(other_volume).await, Ok(Bytes::from_static(b"other")));
        info!("Put and get semantics OK");

        store
            .put(first, Bytes::from_static(b"replaced"))
            .await
            .expect("Overwrite block");
        assert_eq!(store.get(first).await, Ok(Bytes::from_static(b"replaced")));

        let inserted = store
            .put_if_absent(first, Bytes::from_static(b"ignored"))
            .await
            .expect("Put if absent");
        assert!(!inserted, "Existing block should not be replaced");
        assert_eq!(store.get(first).await, Ok(Bytes::from_static(b"replaced")));

        let fresh = BlockId::new(3, 3, 3);
        let inserted = store
            .put_if_absent(fresh, Bytes::from_static(b"fresh"))
            .await
            .expect("Put if absent");
        assert!(inserted, "Missing block should be inserted");
        info!("Overwrite semantics OK");

        let keys = store
            .keys()
            .await
            .expect("List keys")
            .into_iter()
            .collect::<HashSet<_>>();
        assert_eq!(keys, HashSet::from_iter([first, second, other_volume, fresh]));

        store.delete(second).await.expect("Delete block");
        store.delete(second).await.expect("Delete missing block");
        assert_eq!(store.get(second).await, Err(StorageError::NotFound));
        assert_eq!(store.keys().await.expect("List keys").len(), 3);
        info!("Delete semantics OK");

        store.close().await.expect("Close store");
        assert_eq!(store.get(first).await, Err(StorageError::Closed));
        assert_eq!(
            store.put(first, Bytes::from_static(b"late")).await,
            Err(StorageError::Closed)
        );
        assert_eq!(store.keys().await, Err(StorageError::Closed));
        info!("Close semantics OK");
    }

    /// Runs the inode store suite against a fresh, empty store.
    pub async fn run_inode_store_suite<S: INodeStore>(store: S) {
        info!("Starting inode store suite for: {}", type_name::<S>());

        let first = INodeId::new(1, 1);
        let second = INodeId::new(1, 2);

        assert_eq!(store.get(first).await, Err(StorageError::NotFound));

        store
            .put(first, Bytes::from_static(b"record-1"))
            .await
            .expect("Put record");
        store
            .put(second, Bytes::from_static(b"record-2"))
            .await
            .expect("Put record");
        assert_eq!(store.get(first).await, Ok(Bytes::from_static(b"record-1")));

        store
            .put(first, Bytes::from_static(b"record-1b"))
            .await
            .expect("Overwrite record");
        assert_eq!(store.get(first).await, Ok(Bytes::from_static(b"record-1b")));

        let inserted = store
            .put_if_absent(second, Bytes::from_static(b"ignored"))
            .await
            .expect("Put if absent");
        assert!(!inserted);

        let keys = store
            .keys()
            .await
            .expect("List keys")
            .into_iter()
            .collect::<HashSet<_>>();
        assert_eq!(keys, HashSet::from_iter([first, second]));

        store.delete(first).await.expect("Delete record");
        assert_eq!(store.get(first).await, Err(StorageError::NotFound));
        info!("Record semantics OK");

        store.close().await.expect("Close store");
        assert_eq!(store.get(second).await, Err(StorageError::Closed));
        assert_eq!(store.delete(second).await, Err(StorageError::Closed));
        info!("Close semantics OK");
    }
}
