use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use rusqlite::OpenFlags;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::connection::{Connection, Lifecycle};
use crate::error::SidecarError;
use crate::factory::Connector;
use crate::results::ResultSet;
use crate::types::ParamValues;

type OpReply = oneshot::Sender<Result<ResultSet, SidecarError>>;
type QuitReply = oneshot::Sender<Result<(), SidecarError>>;

enum OpKind {
    Exec { sql: String },
    Query { sql: String, params: ParamValues },
}

struct Operation {
    kind: OpKind,
    respond_to: OpReply,
    // An operation is requeued at most once when the worker dies between
    // open and dispatch.
    retried: bool,
}

enum QueuedItem {
    Op(Operation),
    Quit(QuitReply),
}

enum LazyMsg {
    Op(Operation),
    Quit(QuitReply),
    Close,
    OpenFinished {
        token: u64,
        result: Result<Connection, SidecarError>,
    },
    Settled,
    IdleFired {
        token: u64,
    },
    SoftCloseDone {
        token: u64,
    },
    EagerGone {
        token: u64,
    },
    QuitDone,
}

/// A virtual connection that defers the worker launch until first use,
/// reaps it after an idle period, and transparently relaunches it for
/// later operations.
///
/// The underlying churn is never exposed: worker death and idle expiry do
/// not fire the close signal, only [`LazyConnection::close`] and
/// [`LazyConnection::quit`] do.
#[derive(Clone)]
pub struct LazyConnection {
    cmd_tx: mpsc::UnboundedSender<LazyMsg>,
    lifecycle: Arc<watch::Sender<Lifecycle>>,
}

impl LazyConnection {
    pub(crate) fn new(
        connector: Connector,
        filename: Result<String, SidecarError>,
        flags: Option<OpenFlags>,
        idle: Option<Duration>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let lifecycle = Arc::new(watch::channel(Lifecycle::Open).0);

        let manager = LazyManager {
            connector,
            filename,
            flags,
            idle,
            events: cmd_tx.downgrade(),
            lifecycle: lifecycle.clone(),
            eager: None,
            opening: None,
            wait_queue: VecDeque::new(),
            pending: 0,
            idle_timer: None,
            soft_closing: None,
            open_token: 0,
            eager_token: 0,
            idle_token: 0,
            soft_token: 0,
            closing: false,
            closed: false,
        };
        tokio::spawn(manager.run(cmd_rx));

        Self { cmd_tx, lifecycle }
    }

    /// Run a statement without result materialisation, launching a worker
    /// first if none is alive.
    ///
    /// # Errors
    ///
    /// Open failures and soft engine errors propagate to this caller.
    pub async fn exec(&self, sql: &str) -> Result<ResultSet, SidecarError> {
        self.run_op(OpKind::Exec {
            sql: sql.to_string(),
        })
        .await
    }

    /// Run a query and buffer the whole result set, launching a worker
    /// first if none is alive.
    ///
    /// # Errors
    ///
    /// As [`LazyConnection::exec`].
    pub async fn query(
        &self,
        sql: &str,
        params: impl Into<ParamValues>,
    ) -> Result<ResultSet, SidecarError> {
        self.run_op(OpKind::Query {
            sql: sql.to_string(),
            params: params.into(),
        })
        .await
    }

    async fn run_op(&self, kind: OpKind) -> Result<ResultSet, SidecarError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(LazyMsg::Op(Operation {
                kind,
                respond_to: tx,
                retried: false,
            }))
            .map_err(|_| SidecarError::Closed)?;
        rx.await.map_err(|_| SidecarError::Closed)?
    }

    /// Orderly shutdown. Resolves immediately when no worker is alive;
    /// otherwise delegates to the underlying connection and completes when
    /// it does.
    ///
    /// # Errors
    ///
    /// Rejects when already closed, or when the delegated shutdown fails.
    pub async fn quit(&self) -> Result<(), SidecarError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(LazyMsg::Quit(tx))
            .map_err(|_| SidecarError::Closed)?;
        rx.await.map_err(|_| SidecarError::Closed)?
    }

    /// Unconditional teardown: cancels any pending worker launch,
    /// force-closes the current worker, fires the close signal once.
    pub fn close(&self) {
        let _ = self.cmd_tx.send(LazyMsg::Close);
    }

    /// Resolves once [`LazyConnection::close`] or [`LazyConnection::quit`]
    /// has completed. Idle expiry and worker death do not resolve this.
    pub async fn closed(&self) -> Option<Arc<SidecarError>> {
        let mut rx = self.lifecycle.subscribe();
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
        self.lifecycle.borrow().closed_error().is_some()
    }
}

struct Opening {
    token: u64,
    task: JoinHandle<()>,
}

/// Owns every piece of lazy state; commands and internal events arrive on
/// one ordered channel, so operations reach the worker in submission
/// order.
struct LazyManager {
    connector: Connector,
    filename: Result<String, SidecarError>,
    flags: Option<OpenFlags>,
    idle: Option<Duration>,
    events: mpsc::WeakUnboundedSender<LazyMsg>,
    lifecycle: Arc<watch::Sender<Lifecycle>>,

    eager: Option<Connection>,
    opening: Option<Opening>,
    wait_queue: VecDeque<QueuedItem>,
    pending: usize,
    idle_timer: Option<JoinHandle<()>>,
    soft_closing: Option<Connection>,

    open_token: u64,
    eager_token: u64,
    idle_token: u64,
    soft_token: u64,

    closing: bool,
    closed: bool,
}

impl LazyManager {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<LazyMsg>) {
        while let Some(msg) = rx.recv().await {
            match msg {
                LazyMsg::Op(op) => self.handle_op(op),
                LazyMsg::Quit(reply) => self.handle_quit(reply),
                LazyMsg::Close => self.handle_close(),
                LazyMsg::OpenFinished { token, result } => {
                    self.handle_open_finished(token, result);
                }
                LazyMsg::Settled => self.handle_settled(),
                LazyMsg::IdleFired { token } => self.handle_idle_fired(token),
                LazyMsg::SoftCloseDone { token } => {
                    if token == self.soft_token {
                        self.soft_closing = None;
                    }
                }
                LazyMsg::EagerGone { token } => self.handle_eager_gone(token),
                LazyMsg::QuitDone => self.finish_close(),
            }
        }
        // Every handle is gone; release whatever is still running.
        self.handle_close();
    }

    fn handle_op(&mut self, op: Operation) {
        if self.closed || self.closing {
            let _ = op.respond_to.send(Err(SidecarError::Closed));
            return;
        }
        self.cancel_idle_timer();

        // Work arriving during a soft-close forces the disconnecting
        // worker out of the way; a fresh one is launched below.
        if let Some(conn) = self.soft_closing.take() {
            debug!("force-closing worker mid soft-close");
            conn.close();
        }

        if self.opening.is_some() {
            self.wait_queue.push_back(QueuedItem::Op(op));
            return;
        }
        if self.eager.is_none() {
            self.wait_queue.push_back(QueuedItem::Op(op));
            self.begin_open();
            return;
        }
        self.dispatch(op);
    }

    fn dispatch(&mut self, op: Operation) {
        let Some(conn) = self.eager.clone() else {
            self.wait_queue.push_back(QueuedItem::Op(op));
            self.begin_open();
            return;
        };

        let submitted = match &op.kind {
            OpKind::Exec { sql } => conn.submit_exec(sql),
            OpKind::Query { sql, params } => conn.submit_query(sql, params),
        };

        match submitted {
            Ok(reply) => {
                self.pending += 1;
                let Some(events) = self.events.upgrade() else {
                    return;
                };
                tokio::spawn(async move {
                    let outcome = match reply.await {
                        Ok(Ok(payload)) => ResultSet::from_wire(&payload),
                        Ok(Err(err)) => Err(err),
                        Err(_) => Err(SidecarError::Closed),
                    };
                    let _ = op.respond_to.send(outcome);
                    let _ = events.send(LazyMsg::Settled);
                });
            }
            Err(_) if !op.retried => {
                // The worker died underneath us before the request went
                // out; relaunch and replay this one operation.
                debug!("worker gone at dispatch, relaunching");
                self.drop_eager();
                self.wait_queue.push_back(QueuedItem::Op(Operation {
                    retried: true,
                    ..op
                }));
                self.begin_open();
            }
            Err(err) => {
                let _ = op.respond_to.send(Err(err));
            }
        }
    }

    fn begin_open(&mut self) {
        if self.opening.is_some() || self.closed {
            return;
        }
        self.open_token += 1;
        let token = self.open_token;

        let connector = self.connector.clone();
        let filename = self.filename.clone();
        let flags = self.flags;
        let Some(events) = self.events.upgrade() else {
            return;
        };
        let task = tokio::spawn(async move {
            let result = match filename {
                Ok(filename) => connector.open_resolved(&filename, flags).await,
                Err(err) => Err(err),
            };
            let _ = events.send(LazyMsg::OpenFinished { token, result });
        });
        self.opening = Some(Opening { token, task });
    }

    fn handle_open_finished(&mut self, token: u64, result: Result<Connection, SidecarError>) {
        if self.opening.as_ref().map(|o| o.token) != Some(token) {
            // A close() cancelled this launch while it was in flight.
            if let Ok(conn) = result {
                conn.close();
            }
            return;
        }
        self.opening = None;

        match result {
            Ok(conn) => {
                self.watch_eager(&conn);
                self.eager = Some(conn);
                let queued: Vec<_> = self.wait_queue.drain(..).collect();
                for item in queued {
                    match item {
                        QueuedItem::Op(op) => self.dispatch(op),
                        QueuedItem::Quit(reply) => self.delegate_quit(reply),
                    }
                }
                if self.pending == 0 {
                    self.maybe_arm_idle();
                }
            }
            Err(err) => {
                warn!("deferred open failed: {err}");
                for item in self.wait_queue.drain(..) {
                    match item {
                        QueuedItem::Op(op) => {
                            let _ = op.respond_to.send(Err(err.clone()));
                        }
                        QueuedItem::Quit(reply) => {
                            let _ = reply.send(Ok(()));
                        }
                    }
                }
                if self.closing {
                    self.finish_close();
                }
            }
        }
    }

    fn watch_eager(&mut self, conn: &Connection) {
        self.eager_token += 1;
        let token = self.eager_token;
        let Some(events) = self.events.upgrade() else {
            return;
        };
        let conn = conn.clone();
        tokio::spawn(async move {
            let _ = conn.closed().await;
            let _ = events.send(LazyMsg::EagerGone { token });
        });
    }

    fn handle_eager_gone(&mut self, token: u64) {
        if token != self.eager_token {
            return;
        }
        // Spontaneous worker death: drop the reference silently; the next
        // operation launches a fresh worker.
        if self.eager.take().is_some() {
            debug!("worker exited; will relaunch on next use");
            self.cancel_idle_timer();
        }
    }

    fn handle_settled(&mut self) {
        self.pending = self.pending.saturating_sub(1);
        if self.pending == 0 {
            self.maybe_arm_idle();
        }
    }

    fn maybe_arm_idle(&mut self) {
        if self.closed || self.closing || self.pending != 0 {
            return;
        }
        if self.eager.is_none() || self.opening.is_some() {
            return;
        }
        let Some(idle) = self.idle else {
            return;
        };

        self.cancel_idle_timer();
        self.idle_token += 1;
        let token = self.idle_token;
        let Some(events) = self.events.upgrade() else {
            return;
        };
        let task = tokio::spawn(async move {
            tokio::time::sleep(idle).await;
            let _ = events.send(LazyMsg::IdleFired { token });
        });
        self.idle_timer = Some(task);
    }

    fn cancel_idle_timer(&mut self) {
        self.idle_token += 1;
        if let Some(task) = self.idle_timer.take() {
            task.abort();
        }
    }

    fn handle_idle_fired(&mut self, token: u64) {
        if token != self.idle_token {
            return;
        }
        self.idle_timer = None;
        let Some(conn) = self.eager.take() else {
            return;
        };
        debug!("idle period elapsed; retiring worker");

        self.soft_token += 1;
        let soft_token = self.soft_token;
        self.soft_closing = Some(conn.clone());
        let Some(events) = self.events.upgrade() else {
            conn.close();
            return;
        };
        tokio::spawn(async move {
            if conn.quit().await.is_err() {
                conn.close();
            }
            let _ = events.send(LazyMsg::SoftCloseDone { token: soft_token });
        });
    }

    fn handle_quit(&mut self, reply: QuitReply) {
        if self.closed || self.closing {
            let _ = reply.send(Err(SidecarError::Closed));
            return;
        }
        self.closing = true;
        self.cancel_idle_timer();

        if self.opening.is_some() {
            // Runs after the queued operations, like any other submission.
            self.wait_queue.push_back(QueuedItem::Quit(reply));
            return;
        }
        self.delegate_quit(reply);
    }

    fn delegate_quit(&mut self, reply: QuitReply) {
        self.closing = true;
        match self.eager.take() {
            None => {
                let _ = reply.send(Ok(()));
                self.finish_close();
            }
            Some(conn) => {
                let events = self.events.upgrade();
                tokio::spawn(async move {
                    let result = conn.quit().await;
                    let _ = reply.send(result);
                    if let Some(events) = events {
                        let _ = events.send(LazyMsg::QuitDone);
                    }
                });
            }
        }
    }

    fn handle_close(&mut self) {
        if self.closed {
            return;
        }
        if let Some(opening) = self.opening.take() {
            opening.task.abort();
        }
        for item in self.wait_queue.drain(..) {
            match item {
                QueuedItem::Op(op) => {
                    let _ = op.respond_to.send(Err(SidecarError::Closed));
                }
                QueuedItem::Quit(reply) => {
                    let _ = reply.send(Ok(()));
                }
            }
        }
        if let Some(conn) = self.soft_closing.take() {
            conn.close();
        }
        if let Some(conn) = self.eager.take() {
            conn.close();
        }
        self.cancel_idle_timer();
        self.finish_close();
    }

    fn drop_eager(&mut self) {
        if let Some(conn) = self.eager.take() {
            conn.close();
        }
    }

    fn finish_close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.closing = false;
        self.lifecycle.send_replace(Lifecycle::Closed(None));
    }
}
