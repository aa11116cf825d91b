use std::ffi::OsString;
use std::path::{Path, PathBuf};

use deblur_fingerprint::fingerprint_file;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum CommitError {
    #[error("{op} {path}")]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("refusing to commit empty artifact {0}")]
    Empty(PathBuf),

    #[error("size mismatch after rename for {path}: wrote {expected} bytes, found {actual}")]
    SizeMismatch { path: PathBuf, expected: u64, actual: u64 },
}

/// Identity of an output file that is known to be complete.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CommittedArtifact {
    pub path: PathBuf,
    pub size: u64,
    pub fingerprint: String,
}

pub trait ResultCommitter: Send + Sync {
    /// After this returns, `final_path` either does not exist or holds the
    /// complete bytes. The temporary sibling never outlives the call.
    fn commit_atomic(&self, bytes: &[u8], final_path: &Path) -> Result<CommittedArtifact, CommitError>;
}

/// Write-to-temp then rename, on the local filesystem.
#[derive(Clone, Debug, Default)]
pub struct FsResultCommitter;

impl FsResultCommitter {
    pub fn new() -> Self {
        Self
    }

    pub fn temp_path(final_path: &Path) -> PathBuf {
        let mut name: OsString = final_path.as_os_str().to_owned();
        name.push(".tmp");
        PathBuf::from(name)
    }

    fn write_verified(bytes: &[u8], temp: &Path, final_path: &Path) -> Result<CommittedArtifact, CommitError> {
        let io = |op: &'static str, path: &Path| {
            let path = path.to_path_buf();
            move |source: std::io::Error| CommitError::Io { op, path, source }
        };

        std::fs::write(temp, bytes).map_err(io("write", temp))?;
        let size = std::fs::metadata(temp).map_err(io("stat", temp))?.len();
        if size == 0 {
            return Err(CommitError::Empty(final_path.to_path_buf()));
        }
        let fingerprint = fingerprint_file(temp).map_err(io("fingerprint", temp))?;

        std::fs::rename(temp, final_path).map_err(io("rename", temp))?;

        let actual = std::fs::metadata(final_path).map_err(io("stat", final_path))?.len();
        if actual != size {
            return Err(CommitError::SizeMismatch {
                path: final_path.to_path_buf(),
                expected: size,
                actual,
            });
        }
        Ok(CommittedArtifact {
            path: final_path.to_path_buf(),
            size,
            fingerprint,
        })
    }
}

impl ResultCommitter for FsResultCommitter {
    fn commit_atomic(&self, bytes: &[u8], final_path: &Path) -> Result<CommittedArtifact, CommitError> {
        if let Some(parent) = final_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| CommitError::Io {
                op: "create dir",
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let temp = Self::temp_path(final_path);
        match Self::write_verified(bytes, &temp, final_path) {
            Ok(artifact) => {
                debug!(path = %artifact.path.display(), size = artifact.size, "committed artifact");
                Ok(artifact)
            }
            Err(err) => {
                if temp.exists() {
                    if let Err(e) = std::fs::remove_file(&temp) {
                        warn!(path = %temp.display(), error = %e, "could not remove temp file");
                    }
                }
                if matches!(err, CommitError::SizeMismatch { .. }) {
                    // the final file is known to be wrong
                    std::fs::remove_file(final_path).ok();
                }
                Err(err)
            }
        }
    }
}
