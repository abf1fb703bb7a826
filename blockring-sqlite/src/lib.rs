//! # Blockring SQLite
//! [BlockStore] and [INodeStore] implementations persisting a node's share
//! of the cluster's data in a single SQLite database.
//!
//! ```rust
//! use std::sync::Arc;
//! use blockring_sqlite::SqliteStore;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let store = SqliteStore::open_in_memory().await.expect("Create database");
//! let blocks = Arc::new(store.block_store());
//! let inodes = Arc::new(store.inode_store());
//! # drop((blocks, inodes));
//! # }
//! ```

#[macro_use]
extern crate tracing;

mod db;

use std::path::Path;

use async_trait::async_trait;
use blockring_distributor::{BlockId, BlockStore, INodeId, INodeStore, StorageError};
use bytes::Bytes;
use parking_lot::RwLock;
use rusqlite::{ErrorCode, Row};

use crate::db::{FromRow, StorageHandle};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS blocks (
    volume  INTEGER NOT NULL,
    inode   INTEGER NOT NULL,
    idx     INTEGER NOT NULL,
    data    BLOB NOT NULL,
    PRIMARY KEY (volume, inode, idx)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS inodes (
    volume  INTEGER NOT NULL,
    inode   INTEGER NOT NULL,
    record  BLOB NOT NULL,
    PRIMARY KEY (volume, inode)
) WITHOUT ROWID;
"#;

const GET_BLOCK: &str =
    "SELECT data FROM blocks WHERE volume = ?1 AND inode = ?2 AND idx = ?3;";
const PUT_BLOCK: &str = r#"
    INSERT INTO blocks (volume, inode, idx, data) VALUES (?1, ?2, ?3, ?4)
    ON CONFLICT (volume, inode, idx) DO UPDATE SET data = excluded.data;"#;
const PUT_BLOCK_IF_ABSENT: &str =
    "INSERT OR IGNORE INTO blocks (volume, inode, idx, data) VALUES (?1, ?2, ?3, ?4);";
const DELETE_BLOCK: &str =
    "DELETE FROM blocks WHERE volume = ?1 AND inode = ?2 AND idx = ?3;";
const BLOCK_KEYS: &str = "SELECT volume, inode, idx FROM blocks;";

const GET_INODE: &str = "SELECT record FROM inodes WHERE volume = ?1 AND inode = ?2;";
const PUT_INODE: &str = r#"
    INSERT INTO inodes (volume, inode, record) VALUES (?1, ?2, ?3)
    ON CONFLICT (volume, inode) DO UPDATE SET record = excluded.record;"#;
const PUT_INODE_IF_ABSENT: &str =
    "INSERT OR IGNORE INTO inodes (volume, inode, record) VALUES (?1, ?2, ?3);";
const DELETE_INODE: &str = "DELETE FROM inodes WHERE volume = ?1 AND inode = ?2;";
const INODE_KEYS: &str = "SELECT volume, inode FROM inodes;";

#[derive(Debug, thiserror::Error)]
pub enum SqliteStoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("The database connection has been closed.")]
    Closed,

    #[error("Failed to start the database thread: {0}")]
    Runtime(String),
}

impl From<SqliteStoreError> for StorageError {
    fn from(error: SqliteStoreError) -> Self {
        match error {
            SqliteStoreError::Closed => StorageError::Closed,
            SqliteStoreError::Sqlite(rusqlite::Error::SqliteFailure(e, _))
                if e.code == ErrorCode::DiskFull =>
            {
                StorageError::OutOfSpace
            },
            other => StorageError::Io(other.to_string()),
        }
    }
}

// Keys are stored as their two's complement bit pattern so the full
// unsigned range fits in SQLite's signed integers.
#[inline]
fn to_sql(v: u64) -> i64 {
    v as i64
}

#[inline]
fn from_sql(v: i64) -> u64 {
    v as u64
}

struct Blob(Vec<u8>);

impl FromRow for Blob {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self(row.get(0)?))
    }
}

struct BlockKey(BlockId);

impl FromRow for BlockKey {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self(BlockId::new(
            from_sql(row.get(0)?),
            from_sql(row.get(1)?),
            from_sql(row.get(2)?),
        )))
    }
}

struct INodeKey(INodeId);

impl FromRow for INodeKey {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self(INodeId::new(from_sql(row.get(0)?), from_sql(row.get(1)?))))
    }
}

/// A SQLite database holding both the blocks and the inode records of a node.
pub struct SqliteStore {
    handle: StorageHandle,
}

impl SqliteStore {
    /// Opens a new SQLite database in the given path.
    ///
    /// If the database does not already exist it will be created.
    ///
    /// ```rust
    /// use blockring_sqlite::SqliteStore;
    ///
    /// # #[tokio::main]
    /// # async fn main() {
    /// let path = std::env::temp_dir().join("blockring-doc.db");
    /// let store = SqliteStore::open(path).await.expect("Create database");
    /// # drop(store);
    /// # }
    /// ```
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self, SqliteStoreError> {
        let handle = StorageHandle::open(path.as_ref()).await?;
        Self::setup(handle).await
    }

    /// Opens a new SQLite database in memory.
    pub async fn open_in_memory() -> Result<Self, SqliteStoreError> {
        let handle = StorageHandle::open_in_memory().await?;
        Self::setup(handle).await
    }

    async fn setup(handle: StorageHandle) -> Result<Self, SqliteStoreError> {
        handle.execute_batch(SCHEMA).await?;
        Ok(Self { handle })
    }

    /// Creates a [BlockStore] backed by this database.
    pub fn block_store(&self) -> SqliteBlockStore {
        SqliteBlockStore {
            handle: RwLock::new(Some(self.handle.clone())),
        }
    }

    /// Creates an [INodeStore] backed by this database.
    pub fn inode_store(&self) -> SqliteINodeStore {
        SqliteINodeStore {
            handle: RwLock::new(Some(self.handle.clone())),
        }
    }
}

fn open_handle(handle: &RwLock<Option<StorageHandle>>) -> Result<StorageHandle, StorageError> {
    handle.read().clone().ok_or(StorageError::Closed)
}

/// A [BlockStore] implementation based on an SQLite database.
pub struct SqliteBlockStore {
    handle: RwLock<Option<StorageHandle>>,
}

#[async_trait]
impl BlockStore for SqliteBlockStore {
    async fn get(&self, id: BlockId) -> Result<Bytes, StorageError> {
        let row = open_handle(&self.handle)?
            .fetch_one::<_, Blob>(
                GET_BLOCK,
                (to_sql(id.volume), to_sql(id.inode), to_sql(id.index)),
            )
            .await?;

        row.map(|blob| Bytes::from(blob.0))
            .ok_or(StorageError::NotFound)
    }

    async fn put(&self, id: BlockId, data: Bytes) -> Result<(), StorageError> {
        open_handle(&self.handle)?
            .execute(
                PUT_BLOCK,
                (to_sql(id.volume), to_sql(id.inode), to_sql(id.index), data.to_vec()),
            )
            .await?;
        Ok(())
    }

    async fn put_if_absent(&self, id: BlockId, data: Bytes) -> Result<bool, StorageError> {
        let changed = open_handle(&self.handle)?
            .execute(
                PUT_BLOCK_IF_ABSENT,
                (to_sql(id.volume), to_sql(id.inode), to_sql(id.index), data.to_vec()),
            )
            .await?;
        Ok(changed > 0)
    }

    async fn delete(&self, id: BlockId) -> Result<(), StorageError> {
        open_handle(&self.handle)?
            .execute(
                DELETE_BLOCK,
                (to_sql(id.volume), to_sql(id.inode), to_sql(id.index)),
            )
            .await?;
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<BlockId>, StorageError> {
        let rows = open_handle(&self.handle)?
            .fetch_all::<_, BlockKey>(BLOCK_KEYS, ())
            .await?;
        Ok(rows.into_iter().map(|key| key.0).collect())
    }

    async fn close(&self) -> Result<(), StorageError> {
        if self.handle.write().take().is_some() {
            debug!("Block store closed.");
        }
        Ok(())
    }
}

/// An [INodeStore] implementation based on an SQLite database.
pub struct SqliteINodeStore {
    handle: RwLock<Option<StorageHandle>>,
}

#[async_trait]
impl INodeStore for SqliteINodeStore {
    async fn get(&self, id: INodeId) -> Result<Bytes, StorageError> {
        let row = open_handle(&self.handle)?
            .fetch_one::<_, Blob>(GET_INODE, (to_sql(id.volume), to_sql(id.inode)))
            .await?;

        row.map(|blob| Bytes::from(blob.0))
            .ok_or(StorageError::NotFound)
    }

    async fn put(&self, id: INodeId, record: Bytes) -> Result<(), StorageError> {
        open_handle(&self.handle)?
            .execute(PUT_INODE, (to_sql(id.volume), to_sql(id.inode), record.to_vec()))
            .await?;
        Ok(())
    }

    async fn put_if_absent(&self, id: INodeId, record: Bytes) -> Result<bool, StorageError> {
        let changed = open_handle(&self.handle)?
            .execute(
                PUT_INODE_IF_ABSENT,
                (to_sql(id.volume), to_sql(id.inode), record.to_vec()),
            )
            .await?;
        Ok(changed > 0)
    }

    async fn delete(&self, id: INodeId) -> Result<(), StorageError> {
        open_handle(&self.handle)?
            .execute(DELETE_INODE, (to_sql(id.volume), to_sql(id.inode)))
            .await?;
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<INodeId>, StorageError> {
        let rows = open_handle(&self.handle)?
            .fetch_all::<_, INodeKey>(INODE_KEYS, ())
            .await?;
        Ok(rows.into_iter().map(|key| key.0).collect())
    }

    async fn close(&self) -> Result<(), StorageError> {
        if self.handle.write().take().is_some() {
            debug!("Inode store closed.");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::env::temp_dir;

    use blockring_distributor::test_suite;

    use super::*;

    #[tokio::test]
    async fn test_block_store_suite() {
        let _ = tracing_subscriber::fmt::try_init();
        let store = SqliteStore::open_in_memory().await.expect("Open database");
        test_suite::run_block_store_suite(store.block_store()).await;
    }

    #[tokio::test]
    async fn test_inode_store_suite() {
        let _ = tracing_subscriber::fmt::try_init();
        let store = SqliteStore::open_in_memory().await.expect("Open database");
        test_suite::run_inode_store_suite(store.inode_store()).await;
    }

    #[tokio::test]
    async fn test_data_survives_reopen() {
        let path = temp_dir().join(uuid::Uuid::new_v4().to_string());
        let id = BlockId::new(u64::MAX, 2, 3);

        {
            let store = SqliteStore::open(&path).await.expect("Open database");
            let blocks = store.block_store();
            blocks
                .put(id, Bytes::from_static(b"persisted"))
                .await
                .expect("Put block");
            blocks.close().await.expect("Close store");
        }

        let store = SqliteStore::open(&path).await.expect("Reopen database");
        let blocks = store.block_store();
        assert_eq!(
            blocks.get(id).await.expect("Get block"),
            Bytes::from_static(b"persisted")
        );
        assert_eq!(blocks.keys().await.expect("List keys"), vec![id]);
    }

    #[tokio::test]
    async fn test_stores_close_independently() {
        let store = SqliteStore::open_in_memory().await.expect("Open database");
        let blocks = store.block_store();
        let inodes = store.inode_store();

        blocks.close().await.expect("Close block store");
        assert_eq!(
            blocks.get(BlockId::new(1, 1, 0)).await,
            Err(StorageError::Closed)
        );

        inodes
            .put(INodeId::new(1, 1), Bytes::from_static(b"record"))
            .await
            .expect("Inode store is still open");
    }
}
