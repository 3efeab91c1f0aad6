//! Per-binding context shared by every protection component
//!
//! Built once in `bind_project` and passed down explicitly; nothing in the
//! protection core reads project paths or the instance id from globals.

use super::error::{ProtectionError, Result};
use crate::config::{is_valid_stream_name, ProtectionConfig};
use crate::services::time_source::SharedTimeSource;
use std::path::{Path, PathBuf};

/// Name of the per-project directory holding segments and ledgers
pub const BACKUP_DIR_NAME: &str = "backups";

#[derive(Debug, Clone)]
pub struct LogProtectionContext {
    pub project_name: String,
    pub project_dir: PathBuf,
    /// `<project>/<project>-log.md`
    pub log_path: PathBuf,
    /// `<project>/backups`
    pub backup_dir: PathBuf,
    /// Directory outside the project holding the external streams
    pub external_root: PathBuf,
    /// Directory holding project locks and instance artifacts
    pub app_root: PathBuf,
    pub instance_id: String,
    pub pid: u32,
    pub config: ProtectionConfig,
    pub time: SharedTimeSource,
}

impl LogProtectionContext {
    pub fn new(
        project_dir: &Path,
        app_root: &Path,
        external_root: &Path,
        instance_id: impl Into<String>,
        pid: u32,
        config: ProtectionConfig,
        time: SharedTimeSource,
    ) -> Result<Self> {
        let project_name = project_name_from_dir(project_dir)?;
        Ok(Self {
            log_path: project_dir.join(format!("{project_name}-log.md")),
            backup_dir: project_dir.join(BACKUP_DIR_NAME),
            project_dir: project_dir.to_path_buf(),
            project_name,
            external_root: external_root.to_path_buf(),
            app_root: app_root.to_path_buf(),
            instance_id: instance_id.into(),
            pid,
            config,
            time,
        })
    }

    /// Directory holding the segments of `stream`
    pub fn stream_dir(&self, stream: &str) -> &Path {
        if self.config.is_external(stream) {
            &self.external_root
        } else {
            &self.backup_dir
        }
    }

    /// Common file name prefix of every segment of `stream`
    pub fn stream_prefix(&self, stream: &str) -> String {
        format!("{}-log-incremental-{}", self.project_name, stream)
    }
}

/// Reject stream names that cannot be used in file names
pub fn validate_stream(stream: &str) -> Result<()> {
    if is_valid_stream_name(stream) {
        Ok(())
    } else {
        Err(ProtectionError::InvalidStream(stream.to_string()))
    }
}

/// The project name is the last component of the project directory
pub fn project_name_from_dir(project_dir: &Path) -> Result<String> {
    let name = project_dir
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| {
            ProtectionError::InvalidProject(format!(
                "cannot derive a project name from {}",
                project_dir.display()
            ))
        })?;
    validate_project_name(name)?;
    Ok(name.to_string())
}

pub fn validate_project_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." {
        return Err(ProtectionError::InvalidProject(format!(
            "'{name}' is not a usable project name"
        )));
    }
    if name
        .chars()
        .any(|c| c == '/' || c == '\\' || c.is_control())
    {
        return Err(ProtectionError::InvalidProject(format!(
            "project name '{}' contains path separators or control characters",
            name.escape_debug()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::time_source::TestTimeSource;
    use std::sync::Arc;

    fn context(project_dir: &Path) -> Result<LogProtectionContext> {
        LogProtectionContext::new(
            project_dir,
            Path::new("/app"),
            Path::new("/secondary"),
            "12345678",
            1,
            ProtectionConfig::default(),
            Arc::new(TestTimeSource::new()),
        )
    }

    #[test]
    fn test_layout_follows_project_name() {
        let ctx = context(Path::new("/work/demo")).unwrap();
        assert_eq!(ctx.project_name, "demo");
        assert_eq!(ctx.log_path, PathBuf::from("/work/demo/demo-log.md"));
        assert_eq!(ctx.backup_dir, PathBuf::from("/work/demo/backups"));
        assert_eq!(ctx.stream_prefix("primary"), "demo-log-incremental-primary");
    }

    #[test]
    fn test_external_streams_use_secondary_root() {
        let ctx = context(Path::new("/work/demo")).unwrap();
        assert_eq!(ctx.stream_dir("secondary"), Path::new("/secondary"));
        assert_eq!(ctx.stream_dir("primary"), Path::new("/work/demo/backups"));
    }

    #[test]
    fn test_rejects_unnamed_project_dir() {
        assert!(matches!(
            context(Path::new("/")),
            Err(ProtectionError::InvalidProject(_))
        ));
        assert!(validate_project_name("a\nb").is_err());
        assert!(validate_project_name("my project").is_ok());
    }

    #[test]
    fn test_validate_stream() {
        assert!(validate_stream("backup-1").is_ok());
        assert!(matches!(
            validate_stream("a/b"),
            Err(ProtectionError::InvalidStream(_))
        ));
    }
}
