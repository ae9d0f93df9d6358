use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use futures_util::{SinkExt, StreamExt};
use rusqlite::OpenFlags;
use serde_json::{json, Value as JsonValue};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, warn};

use crate::connection::Lifecycle;
use crate::error::SidecarError;
use crate::protocol::codec::FrameCodec;
use crate::protocol::envelope::{self, Method, ResponseFrame};
use crate::results::ResultSet;
use crate::transport::{StreamMode, WorkerLink};
use crate::types::ParamValues;

pub(crate) type ReplyRx = oneshot::Receiver<Result<JsonValue, SidecarError>>;
type ReplyTx = oneshot::Sender<Result<JsonValue, SidecarError>>;

type FrameSink = FramedWrite<Box<dyn AsyncWrite + Send + Unpin>, FrameCodec>;
type FrameStream = FramedRead<Box<dyn AsyncRead + Send + Unpin>, FrameCodec>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    Open,
    Closing,
    Closed,
}

enum WriteOp {
    Frame(JsonValue),
    // Drop the sink so the worker sees EOF after draining earlier frames.
    HalfClose,
    Shutdown,
}

/// A connection bound one-to-one to a live worker process.
///
/// Requests are correlated by a strictly monotonic id; the worker answers
/// serially, so settlements arrive in submission order. Cloning is cheap
/// and clones share the same worker.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    shared: Mutex<Shared>,
    lifecycle: watch::Sender<Lifecycle>,
    write_tx: mpsc::UnboundedSender<WriteOp>,
    mode: StreamMode,
}

struct Shared {
    state: ConnState,
    next_id: u64,
    outstanding: HashMap<u64, ReplyTx>,
    child: Option<Child>,
}

impl Connection {
    /// Wire up a freshly launched worker and issue the `open` handshake.
    ///
    /// On any failure the transport is torn down and the worker's error
    /// surfaces unchanged.
    pub(crate) async fn establish(
        link: WorkerLink,
        filename: &str,
        flags: Option<OpenFlags>,
    ) -> Result<Connection, SidecarError> {
        let conn = Connection::start(link);

        let mut params = vec![JsonValue::String(filename.to_string())];
        if let Some(flags) = flags {
            params.push(json!(flags.bits()));
        }

        let reply = match conn.submit(Method::Open, params) {
            Ok(reply) => reply,
            Err(err) => {
                conn.close();
                return Err(err);
            }
        };
        match reply.await {
            Ok(Ok(_)) => Ok(conn),
            Ok(Err(err)) => {
                // A rejection caused by stream death carries the fatal
                // error the reader saw, when there is one.
                let err = match err {
                    SidecarError::Closed => conn.fatal_error().unwrap_or(SidecarError::Closed),
                    other => other,
                };
                conn.close();
                Err(err)
            }
            Err(_) => {
                let err = conn.fatal_error().unwrap_or(SidecarError::Closed);
                conn.close();
                Err(err)
            }
        }
    }

    fn fatal_error(&self) -> Option<SidecarError> {
        self.inner
            .lifecycle
            .borrow()
            .closed_error()
            .flatten()
            .map(|err| (*err).clone())
    }

    fn start(link: WorkerLink) -> Connection {
        let WorkerLink {
            child,
            reader,
            writer,
            mode,
        } = link;

        let (write_tx, write_rx) = mpsc::unbounded_channel();
        let (lifecycle, _) = watch::channel(Lifecycle::Open);
        let inner = Arc::new(ConnectionInner {
            shared: Mutex::new(Shared {
                state: ConnState::Open,
                next_id: 1,
                outstanding: HashMap::new(),
                child: Some(child),
            }),
            lifecycle,
            write_tx,
            mode,
        });

        let sink = FramedWrite::new(writer, FrameCodec::new());
        let stream = FramedRead::new(reader, FrameCodec::new());
        tokio::spawn(write_loop(Arc::downgrade(&inner), sink, write_rx));
        tokio::spawn(read_loop(Arc::downgrade(&inner), stream));

        Connection { inner }
    }

    /// Run a statement without result materialisation.
    ///
    /// # Errors
    ///
    /// Soft engine errors reject only this operation; the connection stays
    /// usable. "Database closed" means the connection is gone.
    pub async fn exec(&self, sql: &str) -> Result<ResultSet, SidecarError> {
        let reply = self.submit_exec(sql)?;
        settle(reply).await
    }

    /// Run a query and buffer the whole result set.
    ///
    /// # Errors
    ///
    /// As [`Connection::exec`].
    pub async fn query(
        &self,
        sql: &str,
        params: impl Into<ParamValues>,
    ) -> Result<ResultSet, SidecarError> {
        let reply = self.submit_query(sql, &params.into())?;
        settle(reply).await
    }

    /// Orderly shutdown: the engine-side close runs after every previously
    /// submitted operation, and this resolves once it has.
    ///
    /// # Errors
    ///
    /// Rejects if the connection is already closed or closing, or if the
    /// stream dies before the close is acknowledged.
    pub async fn quit(&self) -> Result<(), SidecarError> {
        let reply = {
            let mut shared = self.lock_shared();
            if shared.state != ConnState::Open {
                return Err(SidecarError::Closed);
            }
            shared.state = ConnState::Closing;
            let reply = enqueue(&mut shared, &self.inner.write_tx, Method::Close, Vec::new())?;
            if self.inner.mode == StreamMode::Pipe {
                // Half-close our side; queued frames drain first.
                let _ = self.inner.write_tx.send(WriteOp::HalfClose);
            }
            reply
        };

        match reply.await {
            Ok(Ok(_)) => {
                shutdown(&self.inner, None, true);
                Ok(())
            }
            Ok(Err(err)) => {
                shutdown(&self.inner, None, false);
                Err(err)
            }
            Err(_) => Err(SidecarError::Closed),
        }
    }

    /// Unconditional teardown: terminates the worker, rejects every
    /// outstanding operation with "Database closed", fires the close
    /// signal. Safe to call repeatedly.
    pub fn close(&self) {
        shutdown(&self.inner, None, false);
    }

    /// Resolves once the connection is gone. Carries the fatal error for
    /// protocol failures; plain closes (including [`Connection::close`])
    /// carry none.
    pub async fn closed(&self) -> Option<Arc<SidecarError>> {
        let mut rx = self.inner.lifecycle.subscribe();
        loop {
            if let Some(error) = rx.borrow_and_update().closed_error() {
                return error;
            }
            if rx.changed().await.is_err() {
                return None;
            }
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.lifecycle.borrow().closed_error().is_some()
    }

    pub(crate) fn submit_exec(&self, sql: &str) -> Result<ReplyRx, SidecarError> {
        self.submit(Method::Exec, vec![JsonValue::String(sql.to_string())])
    }

    pub(crate) fn submit_query(
        &self,
        sql: &str,
        params: &ParamValues,
    ) -> Result<ReplyRx, SidecarError> {
        self.submit(
            Method::Query,
            vec![JsonValue::String(sql.to_string()), params.to_wire()],
        )
    }

    // The request joins the ordered write queue before the pending reply
    // is handed back, so wire order always matches submission order.
    fn submit(&self, method: Method, params: Vec<JsonValue>) -> Result<ReplyRx, SidecarError> {
        let mut shared = self.lock_shared();
        if shared.state != ConnState::Open {
            return Err(SidecarError::Closed);
        }
        enqueue(&mut shared, &self.inner.write_tx, method, params)
    }

    fn lock_shared(&self) -> std::sync::MutexGuard<'_, Shared> {
        self.inner
            .shared
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn settle(reply: ReplyRx) -> Result<ResultSet, SidecarError> {
    let payload = reply.await.map_err(|_| SidecarError::Closed)??;
    ResultSet::from_wire(&payload)
}

fn enqueue(
    shared: &mut Shared,
    write_tx: &mpsc::UnboundedSender<WriteOp>,
    method: Method,
    params: Vec<JsonValue>,
) -> Result<ReplyRx, SidecarError> {
    let id = shared.next_id;
    shared.next_id += 1;

    let (tx, rx) = oneshot::channel();
    shared.outstanding.insert(id, tx);

    let frame = envelope::request(id, method, params);
    if write_tx.send(WriteOp::Frame(frame)).is_err() {
        shared.outstanding.remove(&id);
        return Err(SidecarError::Closed);
    }
    Ok(rx)
}

fn lock_inner(inner: &ConnectionInner) -> std::sync::MutexGuard<'_, Shared> {
    inner.shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One-shot teardown shared by every exit path.
fn shutdown(inner: &Arc<ConnectionInner>, error: Option<Arc<SidecarError>>, graceful: bool) {
    let (outstanding, child) = {
        let mut shared = lock_inner(inner);
        if shared.state == ConnState::Closed {
            return;
        }
        shared.state = ConnState::Closed;
        (std::mem::take(&mut shared.outstanding), shared.child.take())
    };

    // The terminal signal is visible before any rejection wakes a caller.
    inner.lifecycle.send_replace(Lifecycle::Closed(error));

    for (_, reply) in outstanding {
        let _ = reply.send(Err(SidecarError::Closed));
    }
    let _ = inner.write_tx.send(WriteOp::Shutdown);

    if let Some(mut child) = child {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if !graceful {
                        let _ = child.start_kill();
                    }
                    let _ = child.wait().await;
                });
            }
            // No runtime to reap on; the kill-on-drop guard still fires.
            Err(_) => drop(child),
        }
    }
}

async fn write_loop(
    conn: Weak<ConnectionInner>,
    sink: FrameSink,
    mut rx: mpsc::UnboundedReceiver<WriteOp>,
) {
    let mut sink = Some(sink);
    while let Some(op) = rx.recv().await {
        match op {
            WriteOp::Frame(frame) => {
                let Some(active) = sink.as_mut() else { continue };
                if let Err(err) = active.send(frame).await {
                    warn!("request write failed: {err}");
                    if let Some(inner) = conn.upgrade() {
                        shutdown(&inner, None, false);
                    }
                    break;
                }
            }
            WriteOp::HalfClose => {
                if let Some(mut closing) = sink.take() {
                    let _ = SinkExt::<JsonValue>::close(&mut closing).await;
                }
            }
            WriteOp::Shutdown => break,
        }
    }
}

async fn read_loop(conn: Weak<ConnectionInner>, mut stream: FrameStream) {
    loop {
        let item = stream.next().await;
        let Some(inner) = conn.upgrade() else { return };

        match item {
            Some(Ok(frame)) => match envelope::parse_response(frame) {
                Ok(ResponseFrame::Result { id, result }) => {
                    if !deliver(&inner, id, Ok(result)) {
                        warn!(id, "response for unknown correlation id");
                        shutdown(&inner, Some(Arc::new(SidecarError::InvalidMessage)), false);
                        return;
                    }
                }
                Ok(ResponseFrame::Error { id, error }) => {
                    let err = SidecarError::Sqlite {
                        message: error.message,
                        code: error.code,
                    };
                    if !deliver(&inner, id, Err(err)) {
                        warn!(id, "error response for unknown correlation id");
                        shutdown(&inner, Some(Arc::new(SidecarError::InvalidMessage)), false);
                        return;
                    }
                }
                Ok(ResponseFrame::Terminal { error }) => {
                    warn!(code = ?error.code, "worker reported stream failure: {}", error.message);
                    shutdown(&inner, Some(Arc::new(SidecarError::InvalidMessage)), false);
                    return;
                }
                Err(reason) => {
                    warn!("unparseable response frame: {reason}");
                    shutdown(&inner, Some(Arc::new(SidecarError::InvalidMessage)), false);
                    return;
                }
            },
            Some(Err(err)) => {
                warn!("response decode failed: {err}");
                shutdown(&inner, Some(Arc::new(err)), false);
                return;
            }
            None => {
                debug!("worker stream closed");
                shutdown(&inner, None, false);
                return;
            }
        }
    }
}

fn deliver(
    inner: &Arc<ConnectionInner>,
    id: u64,
    outcome: Result<JsonValue, SidecarError>,
) -> bool {
    let reply = lock_inner(inner).outstanding.remove(&id);
    match reply {
        Some(reply) => {
            let _ = reply.send(outcome);
            true
        }
        None => false,
    }
}
