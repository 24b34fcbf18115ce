//! Path template resolution on the worker side.
//!
//! Templates are matched by literal prefix:
//! - `~/rest` resolves under the home directory
//! - `{tmp}/rest` resolves under the temp directory
//! - anything else resolves against the working directory (absolute paths
//!   pass through)
//!
//! Results are canonical even when the target does not exist yet: the longest
//! existing ancestor is canonicalized and the remainder is appended after
//! lexical normalization.

use std::io;
use std::path::{Component, Path, PathBuf};

const HOME_PREFIX: &str = "~/";
const TMP_PREFIX: &str = "{tmp}/";

#[derive(Debug, thiserror::Error)]
pub enum PathError {
    #[error("No home directory available to resolve {template}")]
    NoHomeDirectory { template: String },

    #[error("Failed to resolve {path}: {source}")]
    Resolve {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Roots used to expand path templates.
#[derive(Debug, Clone)]
pub struct PathResolver {
    home: Option<PathBuf>,
    temp_dir: PathBuf,
    working_dir: PathBuf,
}

impl Default for PathResolver {
    fn default() -> Self {
        Self::from_env()
    }
}

impl PathResolver {
    /// Roots of the current process: home from the environment, platform
    /// temp dir, and the current directory.
    pub fn from_env() -> Self {
        Self {
            home: home_dir(),
            temp_dir: std::env::temp_dir(),
            working_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    pub fn with_home(mut self, home: impl Into<PathBuf>) -> Self {
        self.home = Some(home.into());
        self
    }

    pub fn without_home(mut self) -> Self {
        self.home = None;
        self
    }

    pub fn with_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = dir.into();
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = dir.into();
        self
    }

    pub fn home(&self) -> Option<&Path> {
        self.home.as_deref()
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    /// Expand `template` to a canonical absolute path.
    pub fn resolve(&self, template: &str) -> Result<PathBuf, PathError> {
        let joined = if let Some(rest) = template.strip_prefix(HOME_PREFIX) {
            let home = self.home.as_ref().ok_or_else(|| PathError::NoHomeDirectory {
                template: template.to_string(),
            })?;
            home.join(rest)
        } else if let Some(rest) = template.strip_prefix(TMP_PREFIX) {
            self.temp_dir.join(rest)
        } else {
            self.working_dir.join(template)
        };

        let absolute = std::path::absolute(&joined).map_err(|source| PathError::Resolve {
            path: joined.clone(),
            source,
        })?;
        canonicalize_lenient(&absolute).map_err(|source| PathError::Resolve {
            path: absolute,
            source,
        })
    }
}

#[cfg(unix)]
fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

#[cfg(windows)]
fn home_dir() -> Option<PathBuf> {
    std::env::var_os("USERPROFILE").map(PathBuf::from)
}

/// Canonicalize the longest existing prefix of `path`, then append the rest.
fn canonicalize_lenient(path: &Path) -> io::Result<PathBuf> {
    let mut existing = path.to_path_buf();
    let mut missing = Vec::new();

    let base = loop {
        match std::fs::canonicalize(&existing) {
            Ok(base) => break base,
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::NotFound | io::ErrorKind::NotADirectory
                ) =>
            {
                let Some(last) = existing.components().next_back() else {
                    return Err(e);
                };
                missing.push(last.as_os_str().to_owned());
                if !existing.pop() {
                    return Err(e);
                }
            }
            Err(e) => return Err(e),
        }
    };

    let mut out = base;
    for part in missing.iter().rev() {
        match Path::new(part).components().next() {
            Some(Component::ParentDir) => {
                out.pop();
            }
            Some(Component::CurDir) | None => {}
            Some(_) => out.push(part),
        }
    }
    Ok(out)
}
