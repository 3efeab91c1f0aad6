// Project fixtures

use injectlog::config::Config;
use injectlog::services::instance::InstanceIdentity;
use injectlog::services::protection::{LogProtectionService, ServiceSettings};
use injectlog::services::time_source::TestTimeSource;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

/// A temporary app root with one empty project directory
pub struct ProjectFixture {
    _temp_dir: TempDir,
    pub root: PathBuf,
    pub project_dir: PathBuf,
    pub time: Arc<TestTimeSource>,
}

impl ProjectFixture {
    pub fn new(project: &str) -> anyhow::Result<Self> {
        super::tracing::init_tracing_from_env();
        let temp_dir = tempfile::tempdir()?;
        let root = temp_dir.path().to_path_buf();
        let project_dir = root.join(project);
        fs::create_dir_all(&project_dir)?;

        Ok(Self {
            _temp_dir: temp_dir,
            root,
            project_dir,
            time: TestTimeSource::shared(),
        })
    }

    pub fn app_root(&self) -> PathBuf {
        self.root.join("app")
    }

    pub fn secondary_dir(&self) -> PathBuf {
        self.root.join("secondary")
    }

    /// Started service for `instance_id` running as this process
    pub fn service(&self, instance_id: &str, config: Config) -> anyhow::Result<LogProtectionService> {
        let settings = ServiceSettings {
            config,
            app_root: self.app_root(),
            secondary_dir: self.secondary_dir(),
            instance: InstanceIdentity::with_id(instance_id, self.time.as_ref()),
            pid: std::process::id(),
            time: self.time.clone(),
        };
        let mut service = LogProtectionService::new(settings)?;
        service.start()?;
        Ok(service)
    }

    pub fn log_path(&self) -> PathBuf {
        let name = self
            .project_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.project_dir.join(format!("{name}-log.md"))
    }

    /// Append raw text to the log, bypassing the service
    pub fn append_raw(&self, text: &str) -> anyhow::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path())?;
        file.write_all(text.as_bytes())?;
        Ok(())
    }

    pub fn read_log(&self) -> anyhow::Result<String> {
        Ok(fs::read_to_string(self.log_path())?)
    }
}
