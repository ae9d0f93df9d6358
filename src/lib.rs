/*!
 * SQLite Sidecar - a non-blocking facade over the blocking SQLite engine
 *
 * The embedded engine stalls its calling thread for the duration of every
 * statement, so this crate never calls it in-process. Each connection owns
 * a dedicated child worker that links the engine and speaks a small
 * newline-delimited JSON-RPC dialect over pipes (or a loopback socket
 * where pipes cannot be read without blocking). The parent side stays a
 * plain async API: submit a statement, await the buffered result.
 *
 * # Features
 *
 * - Asynchronous `exec`/`query` with positional or named parameters
 * - SQLite's full type domain across the wire, blobs included
 * - Eager connections bound one-to-one to a worker process
 * - Lazy connections that launch the worker on first use and retire it
 *   after an idle period
 * - Worker processes spawned with a sanitised descriptor table
 *
 * # Example
 *
 * ```rust,no_run
 * use sqlite_sidecar::prelude::*;
 *
 * async fn example() -> Result<(), SidecarError> {
 *     let connector = Connector::new();
 *     let conn = connector.open("my_database.db", None).await?;
 *
 *     conn.exec("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT)")
 *         .await?;
 *     let inserted = conn
 *         .query(
 *             "INSERT INTO users (name) VALUES (?)",
 *             [RowValues::Text("alice".into())],
 *         )
 *         .await?;
 *     assert_eq!(inserted.insert_id, 1);
 *
 *     let result = conn
 *         .query("SELECT name FROM users WHERE id = ?", [RowValues::Int(1)])
 *         .await?;
 *     for row in &result.rows {
 *         println!("user: {}", row.get("name").unwrap().as_text().unwrap());
 *     }
 *
 *     conn.quit().await?;
 *     Ok(())
 * }
 *
 * async fn lazy_example() -> Result<(), SidecarError> {
 *     // No worker yet; one is launched by the first operation and
 *     // retired after ten idle seconds.
 *     let conn = Connector::new().open_lazy(
 *         "my_database.db",
 *         None,
 *         LazyOptions::idle_secs(10.0),
 *     );
 *     conn.exec("CREATE TABLE IF NOT EXISTS t (x)").await?;
 *     conn.quit().await?;
 *     Ok(())
 * }
 * ```
 */

// Re-export everything that should be part of the public API
pub mod prelude {
    //! Convenient imports for common functionality.

    pub use crate::connection::{Connection, LazyConnection};
    pub use crate::error::SidecarError;
    pub use crate::executor::SqliteExecutor;
    pub use crate::factory::{Connector, ConnectorBuilder, LazyOptions};
    pub use crate::results::{ResultSet, Row};
    pub use crate::transport::TransportMode;
    pub use crate::types::{ParamValues, RowValues};
    pub use crate::OpenFlags;
}

// Core modules
pub mod connection;
pub mod error;
pub mod executor;
pub mod factory;
pub mod protocol;
pub mod results;
pub mod transport;
pub mod types;
pub mod worker;

// Direct exports of frequently used types for simplicity
pub use connection::{Connection, LazyConnection};
pub use error::SidecarError;
pub use executor::SqliteExecutor;
pub use factory::{Connector, ConnectorBuilder, LazyOptions, DEFAULT_IDLE_PERIOD};
pub use results::{ResultSet, Row};
pub use transport::TransportMode;
pub use types::{ParamValues, RowValues};

/// Open flags forwarded to the engine, re-exported so callers do not need
/// a direct driver dependency.
pub use rusqlite::OpenFlags;

/// Open a database with a default [`Connector`].
///
/// # Errors
///
/// See [`Connector::open`].
pub async fn open(filename: &str) -> Result<Connection, SidecarError> {
    Connector::new().open(filename, None).await
}

/// Build a lazy connection with a default [`Connector`].
#[must_use]
pub fn open_lazy(filename: &str, options: LazyOptions) -> LazyConnection {
    Connector::new().open_lazy(filename, None, options)
}
