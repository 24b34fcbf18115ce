//! Push handler: receive a file body and commit it without clobbering.
//!
//! The body is written to a hidden temp file next to the target and linked
//! into place only if the target is still free. An occupant that appears
//! mid-transfer is never touched.

use std::io;
use std::path::{Path, PathBuf};

use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::WorkerContext;
use crate::bridge::frame::ChannelRole;
use crate::bridge::protocol::{ControlEvent, RequestId};

const RENAME_FAILED: &str = "Failed to rename target file";
const TARGET_IS_DIRECTORY: &str = "Target path is directory";

#[derive(Debug)]
struct Failure {
    path: String,
    error: String,
    written: u64,
}

impl Failure {
    fn new(path: &Path, error: impl ToString) -> Self {
        Self {
            path: path.display().to_string(),
            error: error.to_string(),
            written: 0,
        }
    }

    fn written(mut self, written: u64) -> Self {
        self.written = written;
        self
    }
}

pub(super) async fn run(ctx: WorkerContext, request: RequestId, template: String) {
    let event = match receive(&ctx, request, &template).await {
        Ok((path, size)) => ControlEvent::PushConfirmed {
            request,
            path: path.display().to_string(),
            size,
        },
        Err(Failure {
            path,
            error,
            written,
        }) => {
            tracing::info!(%request, %path, %error, written, "Push failed");
            ControlEvent::PushFailed {
                request,
                path,
                error,
                written,
            }
        }
    };
    ctx.emit(event);
}

async fn receive(
    ctx: &WorkerContext,
    request: RequestId,
    template: &str,
) -> Result<(PathBuf, u64), Failure> {
    let target = ctx.paths.resolve(template).map_err(|e| Failure {
        path: template.to_string(),
        error: e.to_string(),
        written: 0,
    })?;

    match fs::metadata(&target).await {
        Ok(meta) if meta.is_dir() => return Err(Failure::new(&target, TARGET_IS_DIRECTORY)),
        Ok(meta) => {
            tracing::debug!(%request, path = %target.display(), "Target exists, leaving it in place");
            return Ok((target, meta.len()));
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(Failure::new(&target, e)),
    }

    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| Failure::new(&target, e))?;
    }

    let temp = temp_path(&target);
    let file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&temp)
        .await
        .map_err(|e| Failure::new(&target, e))?;

    let result = transfer_and_commit(ctx, request, &target, &temp, file).await;
    match fs::remove_file(&temp).await {
        Err(e) if e.kind() != io::ErrorKind::NotFound => {
            tracing::warn!(path = %temp.display(), error = %e, "Failed to remove temp file");
        }
        _ => {}
    }
    result
}

async fn transfer_and_commit(
    ctx: &WorkerContext,
    request: RequestId,
    target: &Path,
    temp: &Path,
    mut file: File,
) -> Result<(PathBuf, u64), Failure> {
    let channel = ctx
        .mux
        .open(ChannelRole::FileData)
        .map_err(|e| Failure::new(target, e))?;
    ctx.emit(ControlEvent::PushAccepted {
        request,
        channel: channel.id(),
    });
    let (mut reader, _writer) = channel.split();

    let mut written = 0u64;
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => return Err(Failure::new(target, e).written(written)),
        };
        file.write_all(&buf[..n])
            .await
            .map_err(|e| Failure::new(target, e).written(written))?;
        written += n as u64;
    }
    file.flush()
        .await
        .map_err(|e| Failure::new(target, e).written(written))?;
    file.sync_all()
        .await
        .map_err(|e| Failure::new(target, e).written(written))?;
    drop(file);

    if let Err(e) = commit(temp, target).await {
        tracing::debug!(%request, path = %target.display(), error = %e, "Commit failed");
        return Err(Failure::new(target, RENAME_FAILED).written(written));
    }
    tracing::debug!(%request, path = %target.display(), size = written, "File committed");
    Ok((target.to_path_buf(), written))
}

/// `.<name>.<uuid>.part` in the target's directory.
fn temp_path(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp = format!(".{name}.{}.part", uuid::Uuid::new_v4());
    target.with_file_name(temp)
}

/// Link `temp` to `target`, failing if `target` exists. Filesystems without
/// hard links fall back to a checked rename.
async fn commit(temp: &Path, target: &Path) -> io::Result<()> {
    match fs::hard_link(temp, target).await {
        Ok(()) => Ok(()),
        Err(e)
            if matches!(
                e.kind(),
                io::ErrorKind::Unsupported | io::ErrorKind::PermissionDenied
            ) =>
        {
            if fs::try_exists(target).await? {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    "target appeared during transfer",
                ));
            }
            fs::rename(temp, target).await
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temp_path_is_hidden_sibling() {
        let temp = temp_path(Path::new("/data/out/report.csv"));
        assert_eq!(temp.parent(), Some(Path::new("/data/out")));
        let name = temp.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with(".report.csv."));
        assert!(name.ends_with(".part"));
    }

    #[test]
    fn temp_paths_are_unique() {
        let target = Path::new("/data/file");
        assert_ne!(temp_path(target), temp_path(target));
    }

    #[tokio::test]
    async fn commit_links_into_free_target() {
        let dir = tempfile::tempdir().unwrap();
        let temp = dir.path().join(".f.part");
        let target = dir.path().join("f");
        std::fs::write(&temp, b"payload").unwrap();

        commit(&temp, &target).await.unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"payload");
    }

    #[tokio::test]
    async fn commit_refuses_occupied_target() {
        let dir = tempfile::tempdir().unwrap();
        let temp = dir.path().join(".f.part");
        let target = dir.path().join("f");
        std::fs::write(&temp, b"new").unwrap();
        std::fs::write(&target, b"occupant").unwrap();

        assert!(commit(&temp, &target).await.is_err());
        assert_eq!(std::fs::read(&target).unwrap(), b"occupant");
    }
}
