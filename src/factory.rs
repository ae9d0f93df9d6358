use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rusqlite::OpenFlags;

use crate::connection::{Connection, LazyConnection};
use crate::error::SidecarError;
use crate::transport::{self, LaunchSpec, TransportMode};

/// How long an idle lazy connection keeps its worker alive by default.
pub const DEFAULT_IDLE_PERIOD: Duration = Duration::from_secs(60);

/// Assembles connections: launches a worker per eager open, and builds
/// lazy connections that delegate their deferred opens back here.
///
/// ```rust,no_run
/// use sqlite_sidecar::{Connector, SidecarError};
///
/// # async fn demo() -> Result<(), SidecarError> {
/// let connector = Connector::new();
/// let conn = connector.open(":memory:", None).await?;
/// let rows = conn.query("SELECT 1 AS value", ()).await?;
/// assert_eq!(rows.rows[0].get("value").unwrap().as_int(), Some(&1));
/// conn.quit().await?;
/// # Ok(()) }
/// ```
#[derive(Debug, Clone, Default)]
pub struct Connector {
    spec: Arc<LaunchSpec>,
}

impl Connector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn builder() -> ConnectorBuilder {
        ConnectorBuilder::new()
    }

    /// Launch a worker, open the database, and return the live connection.
    ///
    /// `flags` defaults to read-write with automatic creation.
    ///
    /// # Errors
    ///
    /// Spawn and handshake failures, and any error the engine reports for
    /// the open itself; in every case the worker is torn down and no
    /// connection is returned.
    pub async fn open(
        &self,
        filename: &str,
        flags: Option<OpenFlags>,
    ) -> Result<Connection, SidecarError> {
        let filename = resolve_filename(filename)?;
        self.open_resolved(&filename, flags).await
    }

    pub(crate) async fn open_resolved(
        &self,
        filename: &str,
        flags: Option<OpenFlags>,
    ) -> Result<Connection, SidecarError> {
        let link = transport::launch(&self.spec).await?;
        Connection::establish(link, filename, flags).await
    }

    /// Build a connection that launches its worker on first use.
    ///
    /// The filename is resolved against the current working directory
    /// now, so a later directory change does not move the database.
    #[must_use]
    pub fn open_lazy(
        &self,
        filename: &str,
        flags: Option<OpenFlags>,
        options: LazyOptions,
    ) -> LazyConnection {
        LazyConnection::new(self.clone(), resolve_filename(filename), flags, options.idle)
    }
}

/// Fluent configuration for a [`Connector`].
#[derive(Debug, Clone, Default)]
pub struct ConnectorBuilder {
    spec: LaunchSpec,
}

impl ConnectorBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Explicit worker binary location, overriding the environment
    /// variable and the executable-sibling lookup.
    #[must_use]
    pub fn worker_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.spec.worker_path = Some(path.into());
        self
    }

    #[must_use]
    pub fn transport(mut self, mode: TransportMode) -> Self {
        self.spec.mode = mode;
        self
    }

    /// Socket-mode handshake window; ignored in pipe mode.
    #[must_use]
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.spec.handshake_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn finish(self) -> Connector {
        Connector {
            spec: Arc::new(self.spec),
        }
    }
}

/// Options for [`Connector::open_lazy`].
#[derive(Debug, Clone)]
pub struct LazyOptions {
    /// Window after the last in-flight request before the worker is
    /// retired. `None` disables the timer; zero retires the worker as
    /// soon as it goes idle.
    pub idle: Option<Duration>,
}

impl Default for LazyOptions {
    fn default() -> Self {
        Self {
            idle: Some(DEFAULT_IDLE_PERIOD),
        }
    }
}

impl LazyOptions {
    /// Scalar-seconds form: negative (or non-finite) disables the timer.
    #[must_use]
    pub fn idle_secs(seconds: f64) -> Self {
        let idle = if seconds.is_finite() && seconds >= 0.0 {
            Some(Duration::from_secs_f64(seconds))
        } else {
            None
        };
        Self { idle }
    }

    #[must_use]
    pub fn no_idle_timer() -> Self {
        Self { idle: None }
    }
}

// `:memory:`, the empty string, and URI filenames pass through verbatim;
// anything else is pinned to the current working directory immediately.
fn resolve_filename(filename: &str) -> Result<String, SidecarError> {
    if filename.is_empty() || filename == ":memory:" || filename.starts_with("file:") {
        return Ok(filename.to_string());
    }
    let path = Path::new(filename);
    if path.is_absolute() {
        return Ok(filename.to_string());
    }
    let cwd = std::env::current_dir().map_err(|err| {
        SidecarError::Config(format!("cannot resolve relative database path: {err}"))
    })?;
    Ok(cwd.join(path).to_string_lossy().into_owned())
}
