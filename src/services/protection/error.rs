//! Error type for the log protection core

use super::lock::LockInfo;
use super::types::IntegrityStatus;
use crate::config::ConfigError;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

pub type Result<T> = std::result::Result<T, ProtectionError>;

#[derive(Debug)]
pub enum ProtectionError {
    /// The log disappeared after having content
    FileMissing { path: PathBuf },
    /// The log was emptied
    FileCleared { path: PathBuf, previous_size: u64 },
    /// The log lost most of its content
    FileTruncated {
        path: PathBuf,
        previous_size: u64,
        current_size: u64,
    },
    /// A segment or ledger could not be written; the ledger is unchanged
    BackupWriteFailed { stream: String, source: io::Error },
    /// Recovery found neither a stream image nor a legacy snapshot
    NoBackupAvailable { project: String },
    /// The project is bound by another live instance
    LockConflict { project: String, holder: LockInfo },
    /// A lock left by a dead owner could not be reclaimed
    LockStale { project: String, pid: u32 },
    /// An append was expected to grow the log but it shrank
    WriteVerificationFailed {
        path: PathBuf,
        size_before: u64,
        size_after: u64,
    },
    Io {
        op: &'static str,
        path: PathBuf,
        source: io::Error,
    },
    InvalidProject(String),
    InvalidStream(String),
    /// No project is bound to the service
    NotBound,
    Config(ConfigError),
}

impl ProtectionError {
    /// Build a `map_err` adapter for an I/O failure on `path`
    pub fn io(op: &'static str, path: impl Into<PathBuf>) -> impl FnOnce(io::Error) -> Self {
        let path = path.into();
        move |source| ProtectionError::Io { op, path, source }
    }

    /// Error describing detected damage, `None` for an intact log
    pub fn from_damage(path: &Path, status: IntegrityStatus) -> Option<Self> {
        let path = path.to_path_buf();
        match status {
            IntegrityStatus::Ok => None,
            IntegrityStatus::Missing { .. } => Some(ProtectionError::FileMissing { path }),
            IntegrityStatus::Cleared { previous_size } => Some(ProtectionError::FileCleared {
                path,
                previous_size,
            }),
            IntegrityStatus::Truncated {
                previous_size,
                current_size,
            } => Some(ProtectionError::FileTruncated {
                path,
                previous_size,
                current_size,
            }),
        }
    }

    /// Diagnostic event name for this error
    pub fn event_name(&self) -> &'static str {
        match self {
            ProtectionError::FileMissing { .. } => "LOG_FILE_MISSING",
            ProtectionError::FileCleared { .. } => "LOG_FILE_CLEARED",
            ProtectionError::FileTruncated { .. } => "LOG_FILE_TRUNCATED",
            ProtectionError::BackupWriteFailed { .. } => "INCREMENTAL_BACKUP_FAILED",
            ProtectionError::NoBackupAvailable { .. } => "LOG_RECOVERY_FAILED",
            ProtectionError::LockConflict { .. } => "PROJECT_LOCK_CONFLICT",
            ProtectionError::LockStale { .. } => "PROJECT_LOCK_STALE",
            ProtectionError::WriteVerificationFailed { .. } => "LOG_WRITE_VERIFICATION_FAILED",
            ProtectionError::Io { .. } => "IO_ERROR",
            ProtectionError::InvalidProject(_) => "INVALID_PROJECT",
            ProtectionError::InvalidStream(_) => "INVALID_STREAM",
            ProtectionError::NotBound => "PROJECT_NOT_BOUND",
            ProtectionError::Config(_) => "CONFIG_ERROR",
        }
    }
}

impl fmt::Display for ProtectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtectionError::FileMissing { path } => {
                write!(f, "log file {} is missing", path.display())
            }
            ProtectionError::FileCleared {
                path,
                previous_size,
            } => write!(
                f,
                "log file {} was cleared (previously {} bytes)",
                path.display(),
                previous_size
            ),
            ProtectionError::FileTruncated {
                path,
                previous_size,
                current_size,
            } => write!(
                f,
                "log file {} was truncated from {} to {} bytes",
                path.display(),
                previous_size,
                current_size
            ),
            ProtectionError::BackupWriteFailed { stream, source } => {
                write!(f, "backup of stream '{stream}' failed: {source}")
            }
            ProtectionError::NoBackupAvailable { project } => {
                write!(f, "no backup available to restore project '{project}'")
            }
            ProtectionError::LockConflict { project, holder } => write!(
                f,
                "project '{}' is in use by instance {} (pid {}) since {}",
                project, holder.instance_id, holder.pid, holder.lock_time
            ),
            ProtectionError::LockStale { project, pid } => write!(
                f,
                "stale lock on project '{project}' left by pid {pid} could not be removed"
            ),
            ProtectionError::WriteVerificationFailed {
                path,
                size_before,
                size_after,
            } => write!(
                f,
                "write to {} not verified: size went from {} to {} bytes",
                path.display(),
                size_before,
                size_after
            ),
            ProtectionError::Io { op, path, source } => {
                write!(f, "failed to {} {}: {}", op, path.display(), source)
            }
            ProtectionError::InvalidProject(msg) => write!(f, "invalid project: {msg}"),
            ProtectionError::InvalidStream(name) => write!(
                f,
                "invalid stream name '{name}' (use letters, digits, '-' or '_')"
            ),
            ProtectionError::NotBound => write!(f, "no project is bound"),
            ProtectionError::Config(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for ProtectionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProtectionError::BackupWriteFailed { source, .. } => Some(source),
            ProtectionError::Io { source, .. } => Some(source),
            ProtectionError::Config(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ConfigError> for ProtectionError {
    fn from(e: ConfigError) -> Self {
        ProtectionError::Config(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_io_adapter_keeps_source() {
        let err = Err::<(), _>(io::Error::new(io::ErrorKind::PermissionDenied, "denied"))
            .map_err(ProtectionError::io("read", "/tmp/demo-log.md"))
            .unwrap_err();
        assert_eq!(err.to_string(), "failed to read /tmp/demo-log.md: denied");
        assert!(err.source().is_some());
        assert_eq!(err.event_name(), "IO_ERROR");
    }

    #[test]
    fn test_damage_maps_to_matching_event() {
        let path = Path::new("demo-log.md");
        assert!(ProtectionError::from_damage(path, IntegrityStatus::Ok).is_none());

        for status in [
            IntegrityStatus::Missing { previous_size: 4 },
            IntegrityStatus::Cleared { previous_size: 4 },
            IntegrityStatus::Truncated {
                previous_size: 4000,
                current_size: 4,
            },
        ] {
            let err = ProtectionError::from_damage(path, status).unwrap();
            assert_eq!(err.event_name(), status.event_name());
        }
    }

    #[test]
    fn test_display_mentions_sizes() {
        let err = ProtectionError::WriteVerificationFailed {
            path: PathBuf::from("log.md"),
            size_before: 20,
            size_after: 3,
        };
        let msg = err.to_string();
        assert!(msg.contains("20") && msg.contains("3"));
    }
}
