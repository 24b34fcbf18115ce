//! Worker side of the protocol.
//!
//! Architecture:
//! - Control channel (channel 0): requests in, events out
//! - One task per request; exec and push tasks are bounded by
//!   `max_concurrent_operations`
//! - Events go through a single writer task so handlers never contend for
//!   the control channel
//!
//! Handlers open their own channels on the multiplexer. Because `Open` frames
//! are queued directly while events pass through the writer task, the
//! controller always registers a channel before it sees the event naming it.

mod exec;
mod file;
mod socket;

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Semaphore, mpsc};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::bridge::codec::JsonCodec;
use crate::bridge::protocol::{ControlEvent, ControlRequest, PROTOCOL_VERSION, RequestId};
use crate::mux::{Multiplexer, Side};
use crate::path::PathResolver;
use crate::version::PIPEMUX_VERSION;

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("control channel error: {0}")]
    Control(#[source] io::Error),
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Diagnostic name for this connection.
    pub label: String,
    /// Roots for path templates and relative exec directories.
    pub paths: PathResolver,
    /// Address tunnels listen on.
    pub bind_host: String,
    /// Upper bound on exec and push handlers running at once.
    pub max_concurrent_operations: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            label: "worker".to_string(),
            paths: PathResolver::from_env(),
            bind_host: "127.0.0.1".to_string(),
            max_concurrent_operations: 512,
        }
    }
}

impl WorkerConfig {
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_paths(mut self, paths: PathResolver) -> Self {
        self.paths = paths;
        self
    }

    pub fn with_bind_host(mut self, host: impl Into<String>) -> Self {
        self.bind_host = host.into();
        self
    }

    pub fn with_max_concurrent_operations(mut self, n: usize) -> Self {
        self.max_concurrent_operations = n.max(1);
        self
    }
}

/// Shared by every request handler.
#[derive(Clone)]
pub(crate) struct WorkerContext {
    mux: Multiplexer,
    events: mpsc::UnboundedSender<ControlEvent>,
    paths: Arc<PathResolver>,
    bind_host: Arc<str>,
}

impl WorkerContext {
    fn emit(&self, event: ControlEvent) {
        tracing::trace!(?event, "Queueing control event");
        // The writer only goes away with the connection.
        let _ = self.events.send(event);
    }
}

/// Serve the protocol over `reader`/`writer` until the controller disconnects
/// or asks the worker to shut down.
pub async fn run_worker<R, W>(reader: R, writer: W, config: WorkerConfig) -> Result<(), WorkerError>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (mux, control) = Multiplexer::start(reader, writer, Side::Worker, config.label.clone());
    let (control_reader, control_writer) = control.split();
    let mut requests = FramedRead::new(control_reader, JsonCodec::<ControlRequest>::new());
    let mut sink = FramedWrite::new(control_writer, JsonCodec::<ControlEvent>::new());

    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<ControlEvent>();
    let event_writer = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            let last = matches!(event, ControlEvent::ShuttingDown);
            if let Err(e) = sink.send(event).await {
                tracing::warn!(error = %e, "Failed to send control event");
                break;
            }
            if last {
                break;
            }
        }
    });

    let ctx = WorkerContext {
        mux: mux.clone(),
        events: event_tx,
        paths: Arc::new(config.paths),
        bind_host: Arc::from(config.bind_host.as_str()),
    };
    let limiter = Arc::new(Semaphore::new(config.max_concurrent_operations.max(1)));
    let mut tunnels: HashMap<RequestId, CancellationToken> = HashMap::new();

    tracing::info!(label = %config.label, "Worker serving");

    let result = loop {
        let request = match requests.next().await {
            Some(Ok(request)) => request,
            Some(Err(e)) => {
                if mux.is_closed() {
                    tracing::info!(reason = ?mux.close_reason(), "Connection closed, exiting");
                    break Ok(());
                }
                tracing::error!(error = %e, "Control channel error");
                break Err(WorkerError::Control(e));
            }
            None => {
                tracing::info!("Controller closed the control channel, exiting");
                break Ok(());
            }
        };

        match request {
            ControlRequest::Hello {
                protocol_version,
                label,
            } => {
                if protocol_version != PROTOCOL_VERSION {
                    tracing::warn!(
                        controller_version = protocol_version,
                        worker_version = PROTOCOL_VERSION,
                        "Controller speaks a different protocol version"
                    );
                }
                tracing::info!(controller = %label, "Controller connected");
                ctx.emit(ControlEvent::Ready {
                    protocol_version: PROTOCOL_VERSION,
                    version: PIPEMUX_VERSION.to_string(),
                    pid: std::process::id(),
                });
            }
            ControlRequest::Exec {
                request,
                cwd,
                argv,
                env,
            } => {
                tracing::debug!(%request, ?argv, %cwd, "Exec requested");
                let ctx = ctx.clone();
                let limiter = Arc::clone(&limiter);
                tokio::spawn(async move {
                    let Ok(_permit) = limiter.acquire_owned().await else {
                        return;
                    };
                    exec::run(ctx, request, cwd, argv, env).await;
                });
            }
            ControlRequest::PushFile { request, path } => {
                tracing::debug!(%request, %path, "Push requested");
                let ctx = ctx.clone();
                let limiter = Arc::clone(&limiter);
                tokio::spawn(async move {
                    let Ok(_permit) = limiter.acquire_owned().await else {
                        return;
                    };
                    file::run(ctx, request, path).await;
                });
            }
            ControlRequest::OpenSocket { request } => {
                tracing::debug!(%request, "Socket requested");
                tunnels.retain(|_, token| !token.is_cancelled());
                let token = CancellationToken::new();
                tunnels.insert(request, token.clone());
                tokio::spawn(socket::run(ctx.clone(), request, token));
            }
            ControlRequest::CloseSocket { request } => match tunnels.remove(&request) {
                Some(token) => token.cancel(),
                None => tracing::debug!(%request, "Close for unknown or finished tunnel"),
            },
            ControlRequest::Shutdown => {
                tracing::info!("Shutdown requested");
                ctx.emit(ControlEvent::ShuttingDown);
                // Flush ShuttingDown before tearing the connection down.
                let _ = event_writer.await;
                break Ok(());
            }
        }
    };

    for token in tunnels.values() {
        token.cancel();
    }
    mux.shutdown();
    tracing::info!("Worker exiting");
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_config_default() {
        let config = WorkerConfig::default();
        assert_eq!(config.bind_host, "127.0.0.1");
        assert_eq!(config.max_concurrent_operations, 512);
        assert_eq!(config.label, "worker");
    }

    #[test]
    fn worker_config_builder() {
        let config = WorkerConfig::default()
            .with_label("node-b")
            .with_bind_host("0.0.0.0")
            .with_max_concurrent_operations(0)
            .with_paths(PathResolver::from_env().with_working_dir("/srv"));
        assert_eq!(config.label, "node-b");
        assert_eq!(config.bind_host, "0.0.0.0");
        assert_eq!(config.max_concurrent_operations, 1);
        assert_eq!(config.paths.working_dir(), std::path::Path::new("/srv"));
    }

    #[tokio::test]
    async fn answers_hello_and_exits_on_shutdown() {
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        let (wr, ww) = tokio::io::split(theirs);
        let worker = tokio::spawn(run_worker(wr, ww, WorkerConfig::default()));

        let (cr, cw) = tokio::io::split(ours);
        let (_mux, control) = Multiplexer::start(cr, cw, Side::Controller, "test");
        let (control_reader, control_writer) = control.split();
        let mut events = FramedRead::new(control_reader, JsonCodec::<ControlEvent>::new());
        let mut requests = FramedWrite::new(control_writer, JsonCodec::<ControlRequest>::new());

        requests
            .send(ControlRequest::Hello {
                protocol_version: PROTOCOL_VERSION,
                label: "test".to_string(),
            })
            .await
            .unwrap();
        match events.next().await.unwrap().unwrap() {
            ControlEvent::Ready {
                protocol_version,
                version,
                pid,
            } => {
                assert_eq!(protocol_version, PROTOCOL_VERSION);
                assert_eq!(version, PIPEMUX_VERSION);
                assert_eq!(pid, std::process::id());
            }
            other => panic!("unexpected {other:?}"),
        }

        requests.send(ControlRequest::Shutdown).await.unwrap();
        assert!(matches!(
            events.next().await.unwrap().unwrap(),
            ControlEvent::ShuttingDown
        ));
        worker.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn exits_cleanly_when_controller_disappears() {
        let (ours, theirs) = tokio::io::duplex(1024);
        let (wr, ww) = tokio::io::split(theirs);
        let worker = tokio::spawn(run_worker(wr, ww, WorkerConfig::default()));
        drop(ours);
        worker.await.unwrap().unwrap();
    }
}
