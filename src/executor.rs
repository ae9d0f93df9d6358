use async_trait::async_trait;

use crate::connection::{Connection, LazyConnection};
use crate::error::SidecarError;
use crate::results::ResultSet;
use crate::types::ParamValues;

/// The operation surface shared by both connection flavours, for callers
/// that want to hold either behind one seam.
#[async_trait]
pub trait SqliteExecutor: Send + Sync {
    /// Run a statement without result materialisation.
    async fn exec(&self, sql: &str) -> Result<ResultSet, SidecarError>;

    /// Run a query and buffer the whole result set.
    async fn query(&self, sql: &str, params: ParamValues) -> Result<ResultSet, SidecarError>;

    /// Orderly shutdown, ordered after previously submitted operations.
    async fn quit(&self) -> Result<(), SidecarError>;

    /// Unconditional synchronous teardown.
    fn close(&self);

    fn is_closed(&self) -> bool;
}

#[async_trait]
impl SqliteExecutor for Connection {
    async fn exec(&self, sql: &str) -> Result<ResultSet, SidecarError> {
        Connection::exec(self, sql).await
    }

    async fn query(&self, sql: &str, params: ParamValues) -> Result<ResultSet, SidecarError> {
        Connection::query(self, sql, params).await
    }

    async fn quit(&self) -> Result<(), SidecarError> {
        Connection::quit(self).await
    }

    fn close(&self) {
        Connection::close(self);
    }

    fn is_closed(&self) -> bool {
        Connection::is_closed(self)
    }
}

#[async_trait]
impl SqliteExecutor for LazyConnection {
    async fn exec(&self, sql: &str) -> Result<ResultSet, SidecarError> {
        LazyConnection::exec(self, sql).await
    }

    async fn query(&self, sql: &str, params: ParamValues) -> Result<ResultSet, SidecarError> {
        LazyConnection::query(self, sql, params).await
    }

    async fn quit(&self) -> Result<(), SidecarError> {
        LazyConnection::quit(self).await
    }

    fn close(&self) {
        LazyConnection::close(self);
    }

    fn is_closed(&self) -> bool {
        LazyConnection::is_closed(self)
    }
}
