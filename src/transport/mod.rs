//! Launches the worker child process and hands back its byte stream.
//!
//! Two transports: inherited pipes (default where process pipes support
//! non-blocking reads, i.e. Unix) and a loopback TCP socket the child
//! connects back to (default elsewhere, selectable everywhere). In both
//! modes the child's stderr stays attached to the parent's.

#[cfg(unix)]
mod fd;

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::process::{Child, Command};
use tracing::debug;

use crate::error::SidecarError;

/// Environment variable overriding the worker binary location.
pub const WORKER_ENV: &str = "SQLITE_SIDECAR_WORKER";

const WORKER_BIN_NAME: &str = "sqlite-sidecar-worker";

/// How long socket mode waits for the worker to connect back.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Transport selection for the worker stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportMode {
    /// Pipes on Unix, loopback socket elsewhere.
    #[default]
    Auto,
    Pipe,
    Socket,
}

/// The transport actually in use; the connection needs to know because
/// half-close works differently on a shared socket than on a dedicated
/// input pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamMode {
    Pipe,
    Socket,
}

/// A spawned worker with its full-duplex stream.
pub(crate) struct WorkerLink {
    pub child: Child,
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
    pub mode: StreamMode,
}

/// Everything the bootstrap needs to know, owned by the connector.
#[derive(Debug, Clone, Default)]
pub(crate) struct LaunchSpec {
    pub worker_path: Option<PathBuf>,
    pub mode: TransportMode,
    pub handshake_timeout: Option<Duration>,
}

fn resolve_mode(mode: TransportMode) -> StreamMode {
    match mode {
        TransportMode::Pipe => StreamMode::Pipe,
        TransportMode::Socket => StreamMode::Socket,
        TransportMode::Auto => {
            if cfg!(unix) {
                StreamMode::Pipe
            } else {
                StreamMode::Socket
            }
        }
    }
}

/// Spawn the worker and establish its stream.
///
/// # Errors
///
/// Fails when the worker binary cannot be located or spawned, or when the
/// socket-mode handshake does not complete in time. Every failure path
/// tears the child down.
pub(crate) async fn launch(spec: &LaunchSpec) -> Result<WorkerLink, SidecarError> {
    let binary = worker_binary(spec.worker_path.as_deref())?;
    match resolve_mode(spec.mode) {
        StreamMode::Pipe => launch_pipe(&binary),
        StreamMode::Socket => {
            let timeout = spec.handshake_timeout.unwrap_or(DEFAULT_HANDSHAKE_TIMEOUT);
            launch_socket(&binary, timeout).await
        }
    }
}

fn base_command(binary: &Path) -> Command {
    let mut cmd = Command::new(binary);
    cmd.stderr(Stdio::inherit()).kill_on_drop(true);
    #[cfg(unix)]
    fd::close_inherited_descriptors(&mut cmd);
    cmd
}

fn launch_pipe(binary: &Path) -> Result<WorkerLink, SidecarError> {
    let mut cmd = base_command(binary);
    cmd.stdin(Stdio::piped()).stdout(Stdio::piped());

    let mut child = spawn(cmd, binary)?;
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| SidecarError::Spawn("worker stdin unavailable".to_string()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| SidecarError::Spawn("worker stdout unavailable".to_string()))?;

    debug!(binary = %binary.display(), "worker launched on pipes");
    Ok(WorkerLink {
        child,
        reader: Box::new(stdout),
        writer: Box::new(stdin),
        mode: StreamMode::Pipe,
    })
}

async fn launch_socket(binary: &Path, timeout: Duration) -> Result<WorkerLink, SidecarError> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    let mut cmd = base_command(binary);
    cmd.arg(addr.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::null());

    let mut child = spawn(cmd, binary)?;

    match tokio::time::timeout(timeout, listener.accept()).await {
        Ok(Ok((stream, peer))) => {
            debug!(binary = %binary.display(), %peer, "worker connected back");
            let _ = stream.set_nodelay(true);
            let (reader, writer) = stream.into_split();
            Ok(WorkerLink {
                child,
                reader: Box::new(reader),
                writer: Box::new(writer),
                mode: StreamMode::Socket,
            })
        }
        Ok(Err(err)) => {
            let _ = child.start_kill();
            Err(err.into())
        }
        Err(_) => {
            let _ = child.start_kill();
            Err(SidecarError::HandshakeTimeout)
        }
    }
}

fn spawn(mut cmd: Command, binary: &Path) -> Result<Child, SidecarError> {
    cmd.spawn()
        .map_err(|err| SidecarError::Spawn(format!("{}: {err}", binary.display())))
}

fn worker_binary(explicit: Option<&Path>) -> Result<PathBuf, SidecarError> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }
    if let Some(path) = std::env::var_os(WORKER_ENV) {
        return Ok(PathBuf::from(path));
    }

    let exe = std::env::current_exe()
        .map_err(|err| SidecarError::Config(format!("cannot locate current executable: {err}")))?;
    let name = format!("{WORKER_BIN_NAME}{}", std::env::consts::EXE_SUFFIX);

    let mut candidates = Vec::new();
    if let Some(dir) = exe.parent() {
        candidates.push(dir.join(&name));
        // Harness binaries live one level below the main binary output.
        if let Some(parent) = dir.parent() {
            candidates.push(parent.join(&name));
        }
    }
    candidates
        .iter()
        .find(|candidate| candidate.is_file())
        .cloned()
        .ok_or_else(|| {
            SidecarError::Config(format!(
                "worker binary {name} not found near {}; set {WORKER_ENV} or configure a path",
                exe.display()
            ))
        })
}
