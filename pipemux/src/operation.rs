//! Controller-side operation handles.
//!
//! Each request issued by the [`Controller`](crate::controller::Controller)
//! returns a handle that yields the request's events in order. The terminal
//! event (`Finished`/`Failed`, `Confirmed`/`Failed`, or the end of a socket
//! tunnel) is delivered exactly once, after which `next()` returns `None`.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::bridge::protocol::{ControlRequest, RequestId};
use crate::controller::ControllerError;
use crate::mux::{Channel, ChannelReader, ChannelWriter};

/// Event stream for one request.
pub struct Operation<E> {
    request: RequestId,
    events: mpsc::UnboundedReceiver<E>,
    peeked: Option<E>,
}

impl<E> std::fmt::Debug for Operation<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Operation")
            .field("request", &self.request)
            .finish()
    }
}

impl<E> Operation<E> {
    pub(crate) fn new(request: RequestId, events: mpsc::UnboundedReceiver<E>) -> Self {
        Self {
            request,
            events,
            peeked: None,
        }
    }

    pub fn request(&self) -> RequestId {
        self.request
    }

    /// Next event, or `None` once the terminal event has been consumed.
    pub async fn next(&mut self) -> Option<E> {
        match self.peeked.take() {
            Some(event) => Some(event),
            None => self.events.recv().await,
        }
    }

    fn push_back(&mut self, event: E) {
        self.peeked = Some(event);
    }
}

fn ended_early() -> ControllerError {
    ControllerError::Protocol("operation ended without a terminal event".to_string())
}

/// Stdio of a running process.
#[derive(Debug)]
pub struct ExecStreams {
    pub stdin: ChannelWriter,
    pub stdout: ChannelReader,
    pub stderr: ChannelReader,
}

#[derive(Debug)]
pub enum ExecEvent {
    /// Stdio channels are open.
    Started(ExecStreams),
    Finished { exit_code: i32 },
    /// The process could not be started, or the connection went away.
    Failed { error: String },
}

/// Collected result of [`Operation::<ExecEvent>::wait`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

async fn read_all(mut reader: ChannelReader) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf).await?;
    Ok(buf)
}

impl Operation<ExecEvent> {
    /// Wait for the process to start and take its stdio.
    pub async fn started(&mut self) -> Result<ExecStreams, ControllerError> {
        match self.next().await {
            Some(ExecEvent::Started(streams)) => Ok(streams),
            Some(ExecEvent::Failed { error }) => Err(ControllerError::Operation(error)),
            Some(ExecEvent::Finished { exit_code }) => Err(ControllerError::Protocol(format!(
                "process finished with {exit_code} before it started"
            ))),
            None => Err(ended_early()),
        }
    }

    /// Wait for the exit code after [`started`](Self::started).
    pub async fn finished(&mut self) -> Result<i32, ControllerError> {
        loop {
            match self.next().await {
                Some(ExecEvent::Finished { exit_code }) => return Ok(exit_code),
                Some(ExecEvent::Failed { error }) => return Err(ControllerError::Operation(error)),
                Some(ExecEvent::Started(_)) => continue,
                None => return Err(ended_early()),
            }
        }
    }

    /// Close stdin, collect stdout and stderr, and wait for the exit code.
    pub async fn wait(mut self) -> Result<ExecOutput, ControllerError> {
        let mut readers = None;
        loop {
            match self.next().await {
                Some(ExecEvent::Started(ExecStreams {
                    stdin,
                    stdout,
                    stderr,
                })) => {
                    drop(stdin);
                    readers = Some((tokio::spawn(read_all(stdout)), tokio::spawn(read_all(stderr))));
                }
                Some(ExecEvent::Finished { exit_code }) => {
                    let (stdout, stderr) = match readers {
                        Some((stdout, stderr)) => (
                            stdout.await.map_err(std::io::Error::other)??,
                            stderr.await.map_err(std::io::Error::other)??,
                        ),
                        None => (Vec::new(), Vec::new()),
                    };
                    return Ok(ExecOutput {
                        exit_code,
                        stdout,
                        stderr,
                    });
                }
                Some(ExecEvent::Failed { error }) => return Err(ControllerError::Operation(error)),
                None => return Err(ended_early()),
            }
        }
    }
}

#[derive(Debug)]
pub enum PushEvent {
    /// The worker is ready for the file body; shut the writer down when done.
    Accepted(ChannelWriter),
    /// File committed, or an existing file left in place.
    Confirmed { path: String, size: u64 },
    Failed {
        path: String,
        error: String,
        written: u64,
    },
}

/// Successful push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushConfirmation {
    pub path: String,
    pub size: u64,
}

impl Operation<PushEvent> {
    /// Wait for the data channel. `None` means the worker settled the push
    /// without wanting data (existing file, or an early failure); call
    /// [`outcome`](Self::outcome) for the result.
    pub async fn accepted(&mut self) -> Result<Option<ChannelWriter>, ControllerError> {
        match self.next().await {
            Some(PushEvent::Accepted(writer)) => Ok(Some(writer)),
            Some(terminal) => {
                self.push_back(terminal);
                Ok(None)
            }
            None => Err(ended_early()),
        }
    }

    pub async fn outcome(&mut self) -> Result<PushConfirmation, ControllerError> {
        loop {
            match self.next().await {
                Some(PushEvent::Accepted(_)) => continue,
                Some(PushEvent::Confirmed { path, size }) => {
                    return Ok(PushConfirmation { path, size });
                }
                Some(PushEvent::Failed {
                    path,
                    error,
                    written,
                }) => {
                    return Err(ControllerError::PushFailed {
                        path,
                        error,
                        written,
                    });
                }
                None => return Err(ended_early()),
            }
        }
    }

    /// Stream `data` as the file body (if accepted) and wait for the outcome.
    ///
    /// A failed write still waits for the terminal event, which carries the
    /// worker's reason or the connection loss; the write error is returned
    /// only if none arrives.
    pub async fn send_all(mut self, data: &[u8]) -> Result<PushConfirmation, ControllerError> {
        let Some(mut writer) = self.accepted().await? else {
            return self.outcome().await;
        };
        let written = match writer.write_all(data).await {
            Ok(()) => writer.shutdown().await,
            Err(e) => Err(e),
        };
        drop(writer);
        match (written, self.outcome().await) {
            (Err(io), Err(ControllerError::Protocol(_))) => Err(ControllerError::Io(io)),
            (_, outcome) => outcome,
        }
    }
}

#[derive(Debug)]
pub enum SocketEvent {
    Bound {
        host: String,
        port: u16,
    },
    Accepted {
        remote_host: String,
        remote_port: u16,
        channel: Channel,
    },
    Failed {
        error: String,
    },
}

/// One relayed connection accepted by a tunnel.
#[derive(Debug)]
pub struct SocketConnection {
    pub remote_host: String,
    pub remote_port: u16,
    pub channel: Channel,
}

/// Listening socket on the worker. Dropping it stops the listener; relays
/// already accepted keep running until their channels close.
pub struct SocketTunnel {
    operation: Operation<SocketEvent>,
    requests: mpsc::UnboundedSender<ControlRequest>,
    close_sent: bool,
}

impl SocketTunnel {
    pub(crate) fn new(
        operation: Operation<SocketEvent>,
        requests: mpsc::UnboundedSender<ControlRequest>,
    ) -> Self {
        Self {
            operation,
            requests,
            close_sent: false,
        }
    }

    pub fn request(&self) -> RequestId {
        self.operation.request()
    }

    pub async fn next(&mut self) -> Option<SocketEvent> {
        self.operation.next().await
    }

    /// Wait for the listener address.
    pub async fn bound(&mut self) -> Result<(String, u16), ControllerError> {
        match self.next().await {
            Some(SocketEvent::Bound { host, port }) => Ok((host, port)),
            Some(SocketEvent::Failed { error }) => Err(ControllerError::Operation(error)),
            Some(SocketEvent::Accepted { .. }) => Err(ControllerError::Protocol(
                "socket accepted a connection before it was bound".to_string(),
            )),
            None => Err(ended_early()),
        }
    }

    /// Next relayed connection; `None` once the listener is closed.
    pub async fn accept(&mut self) -> Result<Option<SocketConnection>, ControllerError> {
        loop {
            match self.next().await {
                Some(SocketEvent::Accepted {
                    remote_host,
                    remote_port,
                    channel,
                }) => {
                    return Ok(Some(SocketConnection {
                        remote_host,
                        remote_port,
                        channel,
                    }));
                }
                Some(SocketEvent::Bound { .. }) => continue,
                Some(SocketEvent::Failed { error }) => return Err(ControllerError::Operation(error)),
                None => return Ok(None),
            }
        }
    }

    /// Ask the worker to stop listening.
    pub fn close(&mut self) {
        if !self.close_sent {
            self.close_sent = true;
            let _ = self.requests.send(ControlRequest::CloseSocket {
                request: self.operation.request(),
            });
        }
    }
}

impl Drop for SocketTunnel {
    fn drop(&mut self) {
        self.close();
    }
}
