use std::path::Path;

use flume::{self, Receiver, Sender};
use futures::channel::oneshot;
use rusqlite::{Connection, OptionalExtension, Params, Row};

use crate::SqliteStoreError;

type Task = Box<dyn FnOnce(&mut Connection) + Send + 'static>;

const CAPACITY: usize = 32;

#[derive(Debug, Clone)]
/// A asynchronous wrapper around a SQLite database.
///
/// Statements are ran on a dedicated background thread so blocking IO
/// never stalls the async runtime. The thread exits once every clone of
/// the handle has been dropped.
pub(crate) struct StorageHandle {
    tx: Sender<Task>,
}

impl StorageHandle {
    /// Connects to the SQLite database, creating it if it does not exist.
    pub(crate) async fn open(path: impl AsRef<Path>) -> Result<Self, SqliteStoreError> {
        let tx = setup_database(path).await?;
        Ok(Self { tx })
    }

    /// Connects to a new in-memory SQLite database.
    pub(crate) async fn open_in_memory() -> Result<Self, SqliteStoreError> {
        Self::open(":memory:").await
    }

    /// Execute a SQL statement with some provided parameters.
    ///
    /// Returns the number of rows changed.
    pub(crate) async fn execute<P>(
        &self,
        sql: &'static str,
        params: P,
    ) -> Result<usize, SqliteStoreError>
    where
        P: Params + Send + 'static,
    {
        self.submit_task(move |conn| {
            let mut prepared = conn.prepare_cached(sql)?;
            prepared.execute(params)
        })
        .await
    }

    /// Execute a batch of SQL statements without parameters.
    pub(crate) async fn execute_batch(
        &self,
        sql: &'static str,
    ) -> Result<(), SqliteStoreError> {
        self.submit_task(move |conn| conn.execute_batch(sql)).await
    }

    /// Fetch a single row from a given SQL statement with some provided parameters.
    pub(crate) async fn fetch_one<P, T>(
        &self,
        sql: &'static str,
        params: P,
    ) -> Result<Option<T>, SqliteStoreError>
    where
        P: Params + Send + 'static,
        T: FromRow + Send + 'static,
    {
        self.submit_task(move |conn| {
            let mut prepared = conn.prepare_cached(sql)?;
            prepared.query_row(params, T::from_row).optional()
        })
        .await
    }

    /// Fetch all rows from a given SQL statement with some provided parameters.
    pub(crate) async fn fetch_all<P, T>(
        &self,
        sql: &'static str,
        params: P,
    ) -> Result<Vec<T>, SqliteStoreError>
    where
        P: Params + Send + 'static,
        T: FromRow + Send + 'static,
    {
        self.submit_task(move |conn| {
            let mut prepared = conn.prepare_cached(sql)?;
            let mut iter = prepared.query(params)?;

            let mut rows = Vec::new();
            while let Some(row) = iter.next()? {
                rows.push(T::from_row(row)?);
            }

            Ok(rows)
        })
        .await
    }

    async fn submit_task<CB, T>(&self, inner: CB) -> Result<T, SqliteStoreError>
    where
        T: Send + 'static,
        CB: FnOnce(&mut Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();

        let cb = move |conn: &mut Connection| {
            let res = inner(conn);
            let _ = tx.send(res);
        };

        self.tx
            .send_async(Box::new(cb))
            .await
            .map_err(|_| SqliteStoreError::Closed)?;

        let result = rx.await.map_err(|_| SqliteStoreError::Closed)?;
        Ok(result?)
    }
}

/// A helper trait for converting between a Row reference and the given type.
///
/// Rows are tied to the connection's thread so they are converted before
/// being sent back to the caller.
pub(crate) trait FromRow: Sized {
    fn from_row(row: &Row) -> rusqlite::Result<Self>;
}

async fn setup_database(path: impl AsRef<Path>) -> Result<Sender<Task>, SqliteStoreError> {
    let path = path.as_ref().to_path_buf();
    let (tx, rx) = flume::bounded(CAPACITY);

    tokio::task::spawn_blocking(move || setup_disk_handle(&path, rx))
        .await
        .map_err(|e| SqliteStoreError::Runtime(e.to_string()))??;

    Ok(tx)
}

fn setup_disk_handle(path: &Path, tasks: Receiver<Task>) -> Result<(), SqliteStoreError> {
    let disk = Connection::open(path)?;

    disk.query_row("pragma journal_mode = WAL;", (), |_r| Ok(()))?;
    disk.execute("pragma synchronous = normal;", ())?;
    disk.execute("pragma temp_store = memory;", ())?;

    std::thread::Builder::new()
        .name("blockring-sqlite".to_string())
        .spawn(move || run_tasks(disk, tasks))
        .map_err(|e| SqliteStoreError::Runtime(e.to_string()))?;

    Ok(())
}

/// Runs all tasks received with a mutable reference to the given connection.
fn run_tasks(mut conn: Connection, tasks: Receiver<Task>) {
    while let Ok(task) = tasks.recv() {
        (task)(&mut conn);
    }
    debug!("All storage handles dropped, closing connection.");
}

#[cfg(test)]
mod tests {
    use std::env::temp_dir;

    use super::*;

    #[derive(Debug, Eq, PartialEq)]
    struct Extent {
        id: i64,
        data: Vec<u8>,
    }

    impl FromRow for Extent {
        fn from_row(row: &Row) -> rusqlite::Result<Self> {
            Ok(Self {
                id: row.get(0)?,
                data: row.get(1)?,
            })
        }
    }

    #[tokio::test]
    async fn test_memory_storage_handle() {
        let handle = StorageHandle::open_in_memory().await.expect("open DB");
        run_storage_handle_suite(handle).await;
    }

    #[tokio::test]
    async fn test_disk_storage_handle() {
        let path = temp_dir().join(uuid::Uuid::new_v4().to_string());
        let handle = StorageHandle::open(path).await.expect("open DB");
        run_storage_handle_suite(handle).await;
    }

    async fn run_storage_handle_suite(handle: StorageHandle) {
        handle
            .execute_batch(
                "CREATE TABLE extent (
                    id    INTEGER PRIMARY KEY,
                    data  BLOB NOT NULL
                );",
            )
            .await
            .expect("create table");

        let res = handle
            .fetch_one::<_, Extent>("SELECT id, data FROM extent;", ())
            .await
            .expect("execute statement");
        assert!(res.is_none(), "Expected no rows to be returned.");

        let changed = handle
            .execute(
                "INSERT INTO extent (id, data) VALUES (?1, ?2);",
                (1i64, b"first".to_vec()),
            )
            .await
            .expect("Insert row");
        assert_eq!(changed, 1);

        handle
            .execute(
                "INSERT INTO extent (id, data) VALUES (?1, ?2);",
                (2i64, b"second".to_vec()),
            )
            .await
            .expect("Insert row");

        let res = handle
            .fetch_all::<_, Extent>("SELECT id, data FROM extent ORDER BY id ASC;", ())
            .await
            .expect("execute statement");
        assert_eq!(
            res,
            vec![
                Extent {
                    id: 1,
                    data: b"first".to_vec(),
                },
                Extent {
                    id: 2,
                    data: b"second".to_vec(),
                },
            ],
        );

        let err = handle
            .execute("INSERT INTO extent (id, data) VALUES (1, x'00');", ())
            .await
            .expect_err("Primary key should be unique");
        assert!(matches!(err, SqliteStoreError::Sqlite(_)));
    }
}
