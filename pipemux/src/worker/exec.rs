//! Exec handler: spawn a process and pump its stdio over three channels.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};

use super::WorkerContext;
use crate::bridge::frame::ChannelRole;
use crate::bridge::protocol::{ControlEvent, RequestId};
use crate::env::{EnvDiff, apply_environment};
use crate::mux::Channel;

pub(super) async fn run(
    ctx: WorkerContext,
    request: RequestId,
    cwd: String,
    argv: Vec<String>,
    env: Option<EnvDiff>,
) {
    let child = match spawn(&ctx, &cwd, &argv, env.as_ref()) {
        Ok(child) => child,
        Err(error) => {
            tracing::info!(%request, %error, "Exec failed to start");
            ctx.emit(ControlEvent::ExecFailed { request, error });
            return;
        }
    };
    supervise(ctx, request, child).await;
}

fn spawn(
    ctx: &WorkerContext,
    cwd: &str,
    argv: &[String],
    env: Option<&EnvDiff>,
) -> Result<Child, String> {
    let Some((program, args)) = argv.split_first() else {
        return Err("empty argument vector".to_string());
    };
    let dir = ctx.paths.resolve(cwd).map_err(|e| e.to_string())?;
    let program = program_path(program, &dir);

    let mut command = Command::new(&program);
    command
        .args(args)
        .current_dir(&dir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    apply_environment(&mut command, env);

    command
        .spawn()
        .map_err(|e| format!("failed to start {}: {e}", program.display()))
}

/// Relative paths with a separator are taken from `cwd`; bare names are left
/// for `PATH` lookup.
fn program_path(program: &str, cwd: &Path) -> PathBuf {
    let path = Path::new(program);
    let has_separator = path.components().count() > 1;
    if path.is_relative() && has_separator {
        cwd.join(path)
    } else {
        path.to_path_buf()
    }
}

async fn supervise(ctx: WorkerContext, request: RequestId, mut child: Child) {
    let pid = child.id();
    let channels = (
        ctx.mux.open(ChannelRole::ExecStdin),
        ctx.mux.open(ChannelRole::ExecStdout),
        ctx.mux.open(ChannelRole::ExecStderr),
    );
    let (stdin_ch, stdout_ch, stderr_ch) = match channels {
        (Ok(a), Ok(b), Ok(c)) => (a, b, c),
        (a, b, c) => {
            let error = [a.err(), b.err(), c.err()]
                .into_iter()
                .flatten()
                .next()
                .map(|e| e.to_string())
                .unwrap_or_default();
            tracing::warn!(%request, %error, "Could not open stdio channels");
            let _ = child.start_kill();
            ctx.emit(ControlEvent::ExecFailed { request, error });
            return;
        }
    };

    ctx.emit(ControlEvent::ExecStarted {
        request,
        stdin: stdin_ch.id(),
        stdout: stdout_ch.id(),
        stderr: stderr_ch.id(),
    });
    tracing::debug!(%request, ?pid, "Process started");

    let stdin_pump = child.stdin.take().map(|pipe| tokio::spawn(pump_stdin(stdin_ch, pipe)));
    let stdout_pump = child.stdout.take().map(|pipe| tokio::spawn(pump_output(pipe, stdout_ch)));
    let stderr_pump = child.stderr.take().map(|pipe| tokio::spawn(pump_output(pipe, stderr_ch)));

    let status = tokio::select! {
        status = child.wait() => status,
        _ = ctx.mux.closed() => {
            tracing::info!(%request, ?pid, "Connection lost, killing process");
            let _ = child.kill().await;
            if let Some(pump) = stdin_pump {
                pump.abort();
            }
            return;
        }
    };

    for pump in [stdout_pump, stderr_pump].into_iter().flatten() {
        let _ = pump.await;
    }

    let exit_code = match status {
        Ok(status) => exit_code(status),
        Err(e) => {
            tracing::warn!(%request, error = %e, "Failed to wait for process");
            -1
        }
    };
    tracing::debug!(%request, ?pid, exit_code, "Process finished");
    ctx.emit(ControlEvent::ExecFinished { request, exit_code });

    if let Some(pump) = stdin_pump {
        pump.abort();
    }
}

async fn pump_stdin(channel: Channel, mut pipe: tokio::process::ChildStdin) {
    let (mut reader, _writer) = channel.split();
    match tokio::io::copy(&mut reader, &mut pipe).await {
        Ok(n) => tracing::trace!(bytes = n, "stdin closed by controller"),
        Err(e) => tracing::debug!(error = %e, "stdin pump stopped"),
    }
    let _ = pipe.shutdown().await;
}

async fn pump_output<R>(mut pipe: R, channel: Channel)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let (_reader, mut writer) = channel.split();
    if let Err(e) = tokio::io::copy(&mut pipe, &mut writer).await {
        tracing::debug!(channel = %writer.id(), error = %e, "output pump stopped");
    }
    let _ = writer.shutdown().await;
}

fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}
