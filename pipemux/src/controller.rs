//! Controller - drives a worker over one duplex stream.
//!
//! Flow:
//! 1. Start the multiplexer, send `hello`, wait for `ready`
//! 2. Spawn the request writer and the event loop
//! 3. Each operation registers a pending entry, then sends its request
//! 4. The event loop claims referenced channels and routes events to the
//!    pending entry
//! 5. On connection loss: fail every pending operation once, refuse new ones

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::JsonCodec;
use crate::bridge::frame::ChannelRole;
use crate::bridge::protocol::{ControlEvent, ControlRequest, PROTOCOL_VERSION, RequestId};
use crate::env::EnvDiff;
use crate::mux::{ChannelReader, ChannelWriter, Multiplexer, MuxError, Side};
use crate::operation::{
    ExecEvent, ExecStreams, Operation, PushConfirmation, PushEvent, SocketEvent, SocketTunnel,
};
use crate::version::VersionInfo;

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("failed to spawn worker: {0}")]
    Spawn(String),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    #[error("{0}")]
    Operation(String),
    #[error("push to {path} failed after {written} bytes: {error}")]
    PushFailed {
        path: String,
        error: String,
        written: u64,
    },
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Diagnostic name for this connection.
    pub label: String,
    pub handshake_timeout: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self::new("controller")
    }
}

impl ControllerConfig {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            handshake_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }
}

/// What the worker reported in `ready`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerInfo {
    pub protocol_version: u32,
    pub version: String,
    pub pid: u32,
}

impl WorkerInfo {
    pub fn versions(&self) -> VersionInfo {
        VersionInfo::new()
            .with_pipemux(self.version.clone())
            .with_protocol(self.protocol_version)
    }
}

enum Pending {
    Exec {
        tx: mpsc::UnboundedSender<ExecEvent>,
        started: bool,
    },
    Push {
        tx: mpsc::UnboundedSender<PushEvent>,
        /// Template as requested, reported if the worker never resolved it.
        template: String,
        accepted: bool,
    },
    Socket {
        tx: mpsc::UnboundedSender<SocketEvent>,
        bound: bool,
    },
}

impl Pending {
    /// Deliver the one failure event this operation will ever see.
    fn fail(self, error: String) {
        match self {
            Pending::Exec { tx, .. } => {
                let _ = tx.send(ExecEvent::Failed { error });
            }
            Pending::Push { tx, template, .. } => {
                let _ = tx.send(PushEvent::Failed {
                    path: template,
                    error,
                    written: 0,
                });
            }
            Pending::Socket { tx, .. } => {
                let _ = tx.send(SocketEvent::Failed { error });
            }
        }
    }
}

#[derive(Default)]
struct PendingTable {
    ops: HashMap<RequestId, Pending>,
    /// Set once no further operation can complete.
    closed: Option<String>,
}

impl PendingTable {
    fn insert(&mut self, request: RequestId, pending: Pending) -> Result<(), ControllerError> {
        if let Some(reason) = &self.closed {
            return Err(ControllerError::ConnectionLost(reason.clone()));
        }
        self.ops.insert(request, pending);
        Ok(())
    }

    fn close(&mut self, reason: &str, error: &str) {
        if self.closed.is_some() {
            return;
        }
        self.closed = Some(reason.to_string());
        let count = self.ops.len();
        for (_, pending) in self.ops.drain() {
            pending.fail(error.to_string());
        }
        if count > 0 {
            tracing::warn!(count, %reason, "Failed pending operations");
        }
    }
}

type SharedPending = Arc<StdMutex<PendingTable>>;

fn lock(pending: &SharedPending) -> MutexGuard<'_, PendingTable> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Connected controller. Dropping it tears the connection down.
pub struct Controller {
    label: String,
    mux: Multiplexer,
    requests: mpsc::UnboundedSender<ControlRequest>,
    pending: SharedPending,
    worker: WorkerInfo,
    child: Option<Child>,
}

impl Controller {
    /// Connect over an established duplex stream and perform the handshake.
    pub async fn connect<R, W>(
        reader: R,
        writer: W,
        config: ControllerConfig,
    ) -> Result<Self, ControllerError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (mux, control) = Multiplexer::start(reader, writer, Side::Controller, config.label.clone());
        let (control_reader, control_writer) = control.split();
        let mut events = FramedRead::new(control_reader, JsonCodec::<ControlEvent>::new());
        let mut sink = FramedWrite::new(control_writer, JsonCodec::<ControlRequest>::new());

        tracing::debug!(label = %config.label, "Sending hello to worker");
        let handshake = async {
            let hello = ControlRequest::Hello {
                protocol_version: PROTOCOL_VERSION,
                label: config.label.clone(),
            };
            if let Err(e) = sink.send(hello).await {
                return Err(ControllerError::Handshake(format!("failed to send hello: {e}")));
            }

            loop {
                match events.next().await {
                    Some(Ok(ControlEvent::Ready {
                        protocol_version,
                        version,
                        pid,
                    })) => {
                        return Ok(WorkerInfo {
                            protocol_version,
                            version,
                            pid,
                        });
                    }
                    Some(Ok(other)) => {
                        tracing::warn!(?other, "Unexpected event during handshake");
                    }
                    Some(Err(e)) => {
                        return Err(ControllerError::Handshake(format!(
                            "control channel error: {e}"
                        )));
                    }
                    None => {
                        return Err(ControllerError::Handshake(
                            "worker closed the control channel".to_string(),
                        ));
                    }
                }
            }
        };

        let worker = match tokio::time::timeout(config.handshake_timeout, handshake).await {
            Ok(Ok(worker)) => worker,
            Ok(Err(e)) => {
                mux.shutdown();
                return Err(e);
            }
            Err(_) => {
                mux.shutdown();
                return Err(ControllerError::HandshakeTimeout(config.handshake_timeout));
            }
        };

        let ours = VersionInfo::new();
        if !ours.is_compatible_with(&worker.versions()) {
            mux.shutdown();
            return Err(ControllerError::Handshake(format!(
                "protocol version mismatch: worker speaks {}, controller speaks {}",
                worker.protocol_version, PROTOCOL_VERSION
            )));
        }

        tracing::info!(
            label = %config.label,
            worker_version = %worker.version,
            worker_pid = worker.pid,
            "Worker ready"
        );

        let (requests, request_rx) = mpsc::unbounded_channel();
        tokio::spawn(write_requests(sink, request_rx));

        let pending: SharedPending = Arc::default();
        tokio::spawn(run_event_loop(events, mux.clone(), pending.clone()));

        Ok(Self {
            label: config.label,
            mux,
            requests,
            pending,
            worker,
            child: None,
        })
    }

    /// Launch `command` as a worker child speaking the protocol on its stdio.
    pub async fn spawn_worker(
        mut command: Command,
        config: ControllerConfig,
    ) -> Result<Self, ControllerError> {
        tracing::info!(label = %config.label, "Spawning worker subprocess");
        let mut child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ControllerError::Spawn(e.to_string()))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ControllerError::Spawn("stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ControllerError::Spawn("stdout not captured".to_string()))?;

        let mut controller = Self::connect(stdout, stdin, config).await?;
        controller.child = Some(child);
        Ok(controller)
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn worker(&self) -> &WorkerInfo {
        &self.worker
    }

    pub fn multiplexer(&self) -> &Multiplexer {
        &self.mux
    }

    pub fn is_closed(&self) -> bool {
        self.mux.is_closed()
    }

    fn register<E>(
        &self,
        request: ControlRequest,
        id: RequestId,
        make_pending: impl FnOnce(mpsc::UnboundedSender<E>) -> Pending,
    ) -> Result<Operation<E>, ControllerError> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.pending).insert(id, make_pending(tx))?;
        if self.requests.send(request).is_err() {
            lock(&self.pending).ops.remove(&id);
            return Err(ControllerError::ConnectionLost(
                "request writer stopped".to_string(),
            ));
        }
        Ok(Operation::new(id, rx))
    }

    /// Run `argv` on the worker in `cwd`. `env: None` inherits the worker's
    /// environment; see [`crate::env`] for the rules.
    pub fn exec<I, S>(
        &self,
        cwd: impl Into<String>,
        argv: I,
        env: Option<EnvDiff>,
    ) -> Result<Operation<ExecEvent>, ControllerError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let request = RequestId::new();
        let argv: Vec<String> = argv.into_iter().map(Into::into).collect();
        tracing::debug!(%request, ?argv, "Issuing exec");
        self.register(
            ControlRequest::Exec {
                request,
                cwd: cwd.into(),
                argv,
                env,
            },
            request,
            |tx| Pending::Exec { tx, started: false },
        )
    }

    /// Start pushing a file to the worker path template `path`.
    pub fn push_file(&self, path: impl Into<String>) -> Result<Operation<PushEvent>, ControllerError> {
        let request = RequestId::new();
        let path = path.into();
        tracing::debug!(%request, %path, "Issuing push");
        let template = path.clone();
        self.register(ControlRequest::PushFile { request, path }, request, |tx| {
            Pending::Push {
                tx,
                template,
                accepted: false,
            }
        })
    }

    /// Push `data` to `path` and wait for the outcome.
    pub async fn push_bytes(
        &self,
        path: impl Into<String>,
        data: impl AsRef<[u8]>,
    ) -> Result<PushConfirmation, ControllerError> {
        self.push_file(path)?.send_all(data.as_ref()).await
    }

    /// Open a listening socket on the worker.
    pub fn new_socket(&self) -> Result<SocketTunnel, ControllerError> {
        let request = RequestId::new();
        tracing::debug!(%request, "Issuing open_socket");
        let operation = self.register(ControlRequest::OpenSocket { request }, request, |tx| {
            Pending::Socket { tx, bound: false }
        })?;
        Ok(SocketTunnel::new(operation, self.requests.clone()))
    }

    /// Ask the worker to stop. Pending operations fail with "worker shut down".
    pub fn shutdown(&self) -> Result<(), ControllerError> {
        self.requests
            .send(ControlRequest::Shutdown)
            .map_err(|_| ControllerError::ConnectionLost("request writer stopped".to_string()))
    }

    /// Resolves once the connection is gone.
    pub async fn closed(&self) {
        self.mux.closed().await
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.mux.shutdown();
    }
}

async fn write_requests(
    mut sink: FramedWrite<ChannelWriter, JsonCodec<ControlRequest>>,
    mut requests: mpsc::UnboundedReceiver<ControlRequest>,
) {
    while let Some(request) = requests.recv().await {
        if let Err(e) = sink.send(request).await {
            tracing::warn!(error = %e, "Failed to send control request");
            break;
        }
    }
}

async fn run_event_loop(
    mut events: FramedRead<ChannelReader, JsonCodec<ControlEvent>>,
    mux: Multiplexer,
    pending: SharedPending,
) {
    let reason = loop {
        match events.next().await {
            Some(Ok(ControlEvent::ShuttingDown)) => {
                tracing::info!(label = %mux.label(), "Worker is shutting down");
                lock(&pending).close("worker shut down", "worker shut down");
            }
            Some(Ok(event)) => route_event(&mux, &pending, event),
            Some(Err(e)) => break mux.close_reason().unwrap_or_else(|| e.to_string()),
            None => {
                break mux
                    .close_reason()
                    .unwrap_or_else(|| "control channel closed".to_string());
            }
        }
    };
    lock(&pending).close(&reason, &format!("connection lost: {reason}"));
    // An unreadable control channel leaves nothing to coordinate with.
    if !mux.is_closed() {
        tracing::warn!(label = %mux.label(), %reason, "Control channel failed, closing connection");
        mux.shutdown();
    }
}

fn route_event(mux: &Multiplexer, pending: &SharedPending, event: ControlEvent) {
    let Some(request) = event.request() else {
        tracing::warn!(?event, "Unexpected control event");
        return;
    };
    tracing::trace!(%request, channels = ?event.channels(), "Routing control event");

    // Channels are claimed before looking at the request so that an id handed
    // over for a forgotten request is still closed and released.
    match event {
        ControlEvent::ExecStarted {
            stdin,
            stdout,
            stderr,
            ..
        } => {
            let streams = (|| {
                let stdin = mux.claim(stdin, ChannelRole::ExecStdin)?;
                let stdout = mux.claim(stdout, ChannelRole::ExecStdout)?;
                let stderr = mux.claim(stderr, ChannelRole::ExecStderr)?;
                Ok::<_, MuxError>(ExecStreams {
                    stdin: stdin.split().1,
                    stdout: stdout.split().0,
                    stderr: stderr.split().0,
                })
            })();

            let mut table = lock(pending);
            if !matches!(table.ops.get(&request), Some(Pending::Exec { started: false, .. })) {
                tracing::warn!(%request, "exec_started for unknown or started request");
                return;
            }
            match streams {
                Ok(streams) => {
                    if let Some(Pending::Exec { tx, started }) = table.ops.get_mut(&request) {
                        *started = true;
                        let _ = tx.send(ExecEvent::Started(streams));
                    }
                }
                Err(e) => {
                    if let Some(op) = table.ops.remove(&request) {
                        op.fail(e.to_string());
                    }
                }
            }
        }
        ControlEvent::ExecFinished { exit_code, .. } => {
            let mut table = lock(pending);
            match table.ops.remove(&request) {
                Some(Pending::Exec { tx, started: true }) => {
                    let _ = tx.send(ExecEvent::Finished { exit_code });
                }
                Some(op @ Pending::Exec { started: false, .. }) => {
                    op.fail(format!("process finished with {exit_code} before it started"));
                }
                Some(other) => {
                    table.ops.insert(request, other);
                    tracing::warn!(%request, "exec_finished for a non-exec request");
                }
                None => tracing::debug!(%request, "exec_finished for unknown request"),
            }
        }
        ControlEvent::ExecFailed { error, .. } => {
            let mut table = lock(pending);
            match table.ops.remove(&request) {
                Some(Pending::Exec { tx, .. }) => {
                    let _ = tx.send(ExecEvent::Failed { error });
                }
                Some(other) => {
                    table.ops.insert(request, other);
                }
                None => tracing::debug!(%request, "exec_failed for unknown request"),
            }
        }
        ControlEvent::PushAccepted { channel, .. } => {
            let channel = mux.claim(channel, ChannelRole::FileData);
            let mut table = lock(pending);
            if !matches!(table.ops.get(&request), Some(Pending::Push { accepted: false, .. })) {
                tracing::warn!(%request, "push_accepted for unknown or accepted request");
                return;
            }
            match channel {
                Ok(channel) => {
                    if let Some(Pending::Push { tx, accepted, .. }) = table.ops.get_mut(&request) {
                        *accepted = true;
                        let _ = tx.send(PushEvent::Accepted(channel.split().1));
                    }
                }
                Err(e) => {
                    if let Some(op) = table.ops.remove(&request) {
                        op.fail(e.to_string());
                    }
                }
            }
        }
        ControlEvent::PushConfirmed { path, size, .. } => {
            let mut table = lock(pending);
            match table.ops.remove(&request) {
                Some(Pending::Push { tx, .. }) => {
                    let _ = tx.send(PushEvent::Confirmed { path, size });
                }
                Some(other) => {
                    table.ops.insert(request, other);
                }
                None => tracing::debug!(%request, "push_confirmed for unknown request"),
            }
        }
        ControlEvent::PushFailed {
            path,
            error,
            written,
            ..
        } => {
            let mut table = lock(pending);
            match table.ops.remove(&request) {
                Some(Pending::Push { tx, .. }) => {
                    let _ = tx.send(PushEvent::Failed {
                        path,
                        error,
                        written,
                    });
                }
                Some(other) => {
                    table.ops.insert(request, other);
                }
                None => tracing::debug!(%request, "push_failed for unknown request"),
            }
        }
        ControlEvent::SocketBound { host, port, .. } => {
            let mut table = lock(pending);
            match table.ops.get_mut(&request) {
                Some(Pending::Socket { tx, bound }) if !*bound => {
                    *bound = true;
                    let _ = tx.send(SocketEvent::Bound { host, port });
                }
                _ => tracing::warn!(%request, "socket_bound for unknown or bound request"),
            }
        }
        ControlEvent::SocketAccepted {
            remote_host,
            remote_port,
            channel,
            ..
        } => {
            let channel = match mux.claim(channel, ChannelRole::SocketData) {
                Ok(channel) => channel,
                Err(e) => {
                    tracing::warn!(%request, error = %e, "Failed to claim socket channel");
                    return;
                }
            };
            let table = lock(pending);
            match table.ops.get(&request) {
                Some(Pending::Socket { tx, bound: true }) => {
                    let _ = tx.send(SocketEvent::Accepted {
                        remote_host,
                        remote_port,
                        channel,
                    });
                }
                _ => tracing::debug!(%request, "Dropping connection for closed tunnel"),
            }
        }
        ControlEvent::SocketFailed { error, .. } => {
            let mut table = lock(pending);
            match table.ops.remove(&request) {
                Some(Pending::Socket { tx, .. }) => {
                    let _ = tx.send(SocketEvent::Failed { error });
                }
                Some(other) => {
                    table.ops.insert(request, other);
                }
                None => tracing::debug!(%request, "socket_failed for unknown request"),
            }
        }
        ControlEvent::SocketClosed { .. } => {
            let mut table = lock(pending);
            match table.ops.remove(&request) {
                // Dropping the sender ends the tunnel's event stream.
                Some(Pending::Socket { .. }) => {}
                Some(other) => {
                    table.ops.insert(request, other);
                }
                None => {}
            }
        }
        ControlEvent::Ready { .. } | ControlEvent::ShuttingDown => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_close_fails_each_operation_once() {
        let mut table = PendingTable::default();
        let (exec_tx, mut exec_rx) = mpsc::unbounded_channel();
        let (push_tx, mut push_rx) = mpsc::unbounded_channel();
        table
            .insert(RequestId::new(), Pending::Exec { tx: exec_tx, started: true })
            .unwrap();
        table
            .insert(
                RequestId::new(),
                Pending::Push {
                    tx: push_tx,
                    template: "~/f".to_string(),
                    accepted: false,
                },
            )
            .unwrap();

        table.close("peer closed the connection", "connection lost: peer closed the connection");
        table.close("again", "again");

        match exec_rx.try_recv().unwrap() {
            ExecEvent::Failed { error } => {
                assert_eq!(error, "connection lost: peer closed the connection")
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(exec_rx.try_recv().is_err());
        match push_rx.try_recv().unwrap() {
            PushEvent::Failed { path, written, .. } => {
                assert_eq!(path, "~/f");
                assert_eq!(written, 0);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(push_rx.try_recv().is_err());

        let (tx, _rx) = mpsc::unbounded_channel();
        let err = table
            .insert(RequestId::new(), Pending::Socket { tx, bound: false })
            .unwrap_err();
        assert!(matches!(err, ControllerError::ConnectionLost(reason) if reason == "peer closed the connection"));
    }

    #[test]
    fn config_builder() {
        let config = ControllerConfig::new("node-a").with_handshake_timeout(Duration::from_millis(250));
        assert_eq!(config.label, "node-a");
        assert_eq!(config.handshake_timeout, Duration::from_millis(250));
        assert_eq!(ControllerConfig::default().handshake_timeout, Duration::from_secs(10));
    }

    #[tokio::test]
    async fn handshake_times_out_against_silent_peer() {
        let (ours, _theirs) = tokio::io::duplex(4096);
        let (r, w) = tokio::io::split(ours);
        let config = ControllerConfig::new("silent").with_handshake_timeout(Duration::from_millis(100));

        let err = Controller::connect(r, w, config).await.err().unwrap();
        assert!(matches!(err, ControllerError::HandshakeTimeout(_)));
    }

    #[tokio::test]
    async fn handshake_fails_when_peer_hangs_up() {
        let (ours, theirs) = tokio::io::duplex(4096);
        drop(theirs);
        let (r, w) = tokio::io::split(ours);

        let err = Controller::connect(r, w, ControllerConfig::new("gone")).await.err().unwrap();
        assert!(matches!(err, ControllerError::Handshake(_)), "{err}");
    }

    #[tokio::test]
    async fn version_mismatch_is_rejected() {
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        let (r, w) = tokio::io::split(ours);
        let (tr, tw) = tokio::io::split(theirs);

        let fake_worker = tokio::spawn(async move {
            let (_mux, control) = Multiplexer::start(tr, tw, Side::Worker, "fake");
            let (cr, cw) = control.split();
            let mut requests = FramedRead::new(cr, JsonCodec::<ControlRequest>::new());
            let mut events = FramedWrite::new(cw, JsonCodec::<ControlEvent>::new());
            let _hello = requests.next().await;
            events
                .send(ControlEvent::Ready {
                    protocol_version: PROTOCOL_VERSION + 1,
                    version: "9.9.9".to_string(),
                    pid: 1,
                })
                .await
                .unwrap();
            // Keep the connection up until the controller gives up.
            let _ = requests.next().await;
        });

        let err = Controller::connect(r, w, ControllerConfig::new("mismatch"))
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("protocol version mismatch"), "{err}");
        fake_worker.await.unwrap();
    }

    #[tokio::test]
    async fn corrupt_control_event_closes_connection() {
        use tokio_util::bytes::Bytes;
        use tokio_util::codec::LengthDelimitedCodec;

        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        let (r, w) = tokio::io::split(ours);
        let (tr, tw) = tokio::io::split(theirs);
        let (garbage_tx, garbage_rx) = tokio::sync::oneshot::channel::<()>();

        let fake_worker = tokio::spawn(async move {
            let (mux, control) = Multiplexer::start(tr, tw, Side::Worker, "fake");
            let (cr, cw) = control.split();
            let mut requests = FramedRead::new(cr, JsonCodec::<ControlRequest>::new());
            let mut events = FramedWrite::new(cw, JsonCodec::<ControlEvent>::new());
            let _hello = requests.next().await;
            events
                .send(ControlEvent::Ready {
                    protocol_version: PROTOCOL_VERSION,
                    version: "0.0.0".to_string(),
                    pid: 1,
                })
                .await
                .unwrap();

            let _ = garbage_rx.await;
            let mut raw = FramedWrite::new(events.into_inner(), LengthDelimitedCodec::new());
            raw.send(Bytes::from_static(b"{garbage")).await.unwrap();

            tokio::time::timeout(Duration::from_secs(5), mux.closed())
                .await
                .expect("controller kept the connection open");
        });

        let controller = Controller::connect(r, w, ControllerConfig::new("corrupt"))
            .await
            .unwrap();
        let mut op = controller.exec(".", ["sleep", "30"], None).unwrap();
        garbage_tx.send(()).unwrap();

        match tokio::time::timeout(Duration::from_secs(5), op.next()).await.unwrap() {
            Some(ExecEvent::Failed { error }) => assert!(error.starts_with("connection lost"), "{error}"),
            other => panic!("unexpected {other:?}"),
        }
        tokio::time::timeout(Duration::from_secs(5), controller.closed())
            .await
            .expect("connection still open");
        assert!(controller.is_closed());
        fake_worker.await.unwrap();
    }
}
