//! Socket tunnel handler: listen locally and relay each accepted connection
//! over its own channel.

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use super::WorkerContext;
use crate::bridge::frame::ChannelRole;
use crate::bridge::protocol::{ControlEvent, RequestId};
use crate::mux::Channel;

pub(super) async fn run(ctx: WorkerContext, request: RequestId, cancel: CancellationToken) {
    let listener = match TcpListener::bind((&*ctx.bind_host, 0)).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::info!(%request, error = %e, "Failed to bind tunnel");
            cancel.cancel();
            ctx.emit(ControlEvent::SocketFailed {
                request,
                error: e.to_string(),
            });
            return;
        }
    };
    let local = match listener.local_addr() {
        Ok(addr) => addr,
        Err(e) => {
            cancel.cancel();
            ctx.emit(ControlEvent::SocketFailed {
                request,
                error: e.to_string(),
            });
            return;
        }
    };
    tracing::debug!(%request, %local, "Tunnel bound");
    ctx.emit(ControlEvent::SocketBound {
        request,
        host: local.ip().to_string(),
        port: local.port(),
    });

    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ctx.mux.closed() => break,
            accepted = listener.accept() => accepted,
        };
        let (stream, remote) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(%request, error = %e, "Tunnel accept failed");
                cancel.cancel();
                ctx.emit(ControlEvent::SocketFailed {
                    request,
                    error: e.to_string(),
                });
                return;
            }
        };
        let channel = match ctx.mux.open(ChannelRole::SocketData) {
            Ok(channel) => channel,
            Err(e) => {
                tracing::warn!(%request, error = %e, "No channel for accepted connection");
                continue;
            }
        };
        tracing::debug!(%request, %remote, channel = %channel.id(), "Tunnel accepted connection");
        ctx.emit(ControlEvent::SocketAccepted {
            request,
            remote_host: remote.ip().to_string(),
            remote_port: remote.port(),
            channel: channel.id(),
        });
        tokio::spawn(relay(stream, channel));
    }

    cancel.cancel();
    tracing::debug!(%request, "Tunnel closed");
    ctx.emit(ControlEvent::SocketClosed { request });
}

async fn relay(mut stream: TcpStream, mut channel: Channel) {
    let id = channel.id();
    match tokio::io::copy_bidirectional(&mut stream, &mut channel).await {
        Ok((up, down)) => tracing::trace!(channel = %id, up, down, "Relay finished"),
        Err(e) => tracing::debug!(channel = %id, error = %e, "Relay stopped"),
    }
}
