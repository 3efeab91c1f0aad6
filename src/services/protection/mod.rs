//! Log protection service
//!
//! Guards a project's append-only markdown log against loss. Every append is
//! wrapped by the write verifier, which checks integrity first and captures the
//! configured backup streams after a verified write. A poll loop runs the same
//! integrity check on a timer, and a per-project lock keeps a second instance
//! from binding the same project.
//!
//! ## Layout
//!
//! - `<project>/<project>-log.md` - the log
//! - `<project>/backups/` - segments, latest copies, ledgers, exports
//! - `<secondary-dir>/` - segments of the external streams
//! - `<app-root>/.project_lock_<project>` - project locks

pub mod backup;
pub mod context;
pub mod error;
pub mod integrity;
pub mod ledger;
pub mod lock;
pub mod log_file;
pub mod recovery;
pub mod storage;
pub mod types;
pub mod verifier;

pub use context::LogProtectionContext;
pub use error::{ProtectionError, Result};
pub use lock::{AcquireOutcome, LivenessProbe, LockInfo, LockRecord, ProcessLiveness, ProjectLockManager};
pub use types::{
    AppendReport, BackupFileInfo, BackupFileKind, CaptureMode, CaptureResult, CleanupReport,
    Entry, EntryKind, IntegrityStatus, LedgerInfo, PollReport, RecoveryOutcome, RecoveryReport,
    RecoverySource, StatusReport,
};

use crate::config::{Config, MaintenanceConfig, ProtectionConfig, EMERGENCY_STREAM};
use crate::services::instance::InstanceIdentity;
use crate::services::time_source::SharedTimeSource;
use backup::IncrementalBackupWriter;
use integrity::IntegrityMonitor;
use ledger::PositionLedger;
use log_file::{format_entry, LogFile};
use recovery::RecoveryCoordinator;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use storage::BackupStorage;
use verifier::WriteVerifier;

/// Everything the service needs that is decided outside the library
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub config: Config,
    /// Directory holding project locks and instance files
    pub app_root: PathBuf,
    /// Directory holding the external backup streams
    pub secondary_dir: PathBuf,
    pub instance: InstanceIdentity,
    pub pid: u32,
    pub time: SharedTimeSource,
}

/// Result of binding a project
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindReport {
    pub project: String,
    pub log_path: PathBuf,
    pub lock: LockInfo,
    /// Size the integrity monitor starts from
    pub baseline: u64,
    pub startup_capture: CaptureResult,
}

/// Components wired to one bound project
#[derive(Debug)]
struct BoundProject {
    ctx: Arc<LogProtectionContext>,
    storage: BackupStorage,
    ledger: PositionLedger,
    writer: IncrementalBackupWriter,
    coordinator: RecoveryCoordinator,
    verifier: WriteVerifier,
    monitor: IntegrityMonitor,
    log: LogFile,
}

#[derive(Debug)]
pub struct LogProtectionService {
    protection: ProtectionConfig,
    maintenance: MaintenanceConfig,
    app_root: PathBuf,
    secondary_dir: PathBuf,
    instance: InstanceIdentity,
    pid: u32,
    time: SharedTimeSource,
    locks: ProjectLockManager,
    bound: Option<BoundProject>,
}

impl LogProtectionService {
    /// Create a service whose lock liveness checks use the OS process table
    pub fn new(settings: ServiceSettings) -> Result<Self> {
        let probe = Arc::new(ProcessLiveness::new(settings.app_root.clone()));
        Self::with_liveness(settings, probe)
    }

    pub fn with_liveness(settings: ServiceSettings, probe: Arc<dyn LivenessProbe>) -> Result<Self> {
        settings.config.validate()?;
        let locks = ProjectLockManager::new(settings.app_root.clone(), probe, settings.time.clone());
        Ok(Self {
            protection: settings.config.protection,
            maintenance: settings.config.maintenance,
            app_root: settings.app_root,
            secondary_dir: settings.secondary_dir,
            instance: settings.instance,
            pid: settings.pid,
            time: settings.time,
            locks,
            bound: None,
        })
    }

    /// Announce this instance and clear locks left by dead ones.
    ///
    /// Returns the projects whose stale locks were removed.
    pub fn start(&mut self) -> Result<Vec<String>> {
        let artifact = self
            .instance
            .register(&self.app_root, self.pid, self.time.as_ref())
            .map_err(ProtectionError::io("register instance in", &self.app_root))?;
        tracing::info!(
            "Instance {} (pid {}) registered at {:?}",
            self.instance.instance_id,
            self.pid,
            artifact
        );
        self.locks.sweep_stale()
    }

    pub fn instance_id(&self) -> &str {
        &self.instance.instance_id
    }

    pub fn locks(&self) -> &ProjectLockManager {
        &self.locks
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.protection.poll_interval_ms)
    }

    fn bound(&self) -> Result<&BoundProject> {
        self.bound.as_ref().ok_or(ProtectionError::NotBound)
    }

    fn bound_mut(&mut self) -> Result<&mut BoundProject> {
        self.bound.as_mut().ok_or(ProtectionError::NotBound)
    }

    // ========================================================================
    // Binding
    // ========================================================================

    /// Lock `project_dir`, seed the integrity baseline and take the startup capture.
    ///
    /// A project already bound to this service is unbound first.
    pub fn bind_project(&mut self, project_dir: &Path) -> Result<BindReport> {
        if !project_dir.is_dir() {
            return Err(ProtectionError::InvalidProject(format!(
                "{} is not a directory",
                project_dir.display()
            )));
        }
        if self.bound.is_some() {
            self.unbind_project()?;
        }

        let ctx = Arc::new(LogProtectionContext::new(
            project_dir,
            &self.app_root,
            &self.secondary_dir,
            self.instance.instance_id.clone(),
            self.pid,
            self.protection.clone(),
            self.time.clone(),
        )?);

        let lock = match self.locks.acquire(
            &ctx.project_name,
            &ctx.instance_id,
            ctx.pid,
            &ctx.project_dir,
        )? {
            AcquireOutcome::Locked(info) => info,
            AcquireOutcome::Conflict(holder) => {
                return Err(ProtectionError::LockConflict {
                    project: ctx.project_name.clone(),
                    holder,
                })
            }
        };

        match self.wire(ctx.clone()) {
            Ok((bound, baseline, startup_capture)) => {
                tracing::info!(
                    event = "PROJECT_BOUND",
                    "Bound project {} (baseline {} bytes)",
                    ctx.project_name,
                    baseline
                );
                self.bound = Some(bound);
                Ok(BindReport {
                    project: ctx.project_name.clone(),
                    log_path: ctx.log_path.clone(),
                    lock,
                    baseline,
                    startup_capture,
                })
            }
            Err(e) => {
                if let Err(release_err) =
                    self.locks
                        .release(&ctx.project_name, &ctx.instance_id, ctx.pid)
                {
                    tracing::warn!("Failed to release lock after bind error: {}", release_err);
                }
                Err(e)
            }
        }
    }

    fn wire(&self, ctx: Arc<LogProtectionContext>) -> Result<(BoundProject, u64, CaptureResult)> {
        let storage = BackupStorage::new(ctx.clone());
        storage
            .ensure_dirs()
            .map_err(ProtectionError::io("create", &ctx.backup_dir))?;
        let ledger = PositionLedger::new(ctx.backup_dir.clone());
        let writer = IncrementalBackupWriter::new(ctx.clone(), storage.clone(), ledger.clone());
        let coordinator = RecoveryCoordinator::new(ctx.clone(), storage.clone(), writer.clone());
        let verifier = WriteVerifier::new(ctx.clone(), writer.clone(), coordinator.clone());
        let log = LogFile::new(ctx.log_path.clone());

        // Damage that happened while nobody watched must still look like damage
        let current = log
            .size()
            .map_err(ProtectionError::io("inspect", &ctx.log_path))?
            .unwrap_or(0);
        let captured = ctx
            .config
            .write_streams
            .iter()
            .map(|stream| ledger.get(stream))
            .max()
            .unwrap_or(0);
        let baseline = current.max(captured);
        let monitor = IntegrityMonitor::new(
            ctx.log_path.clone(),
            ctx.config.truncation_ratio,
            ctx.config.truncation_min_size,
            baseline,
        );

        let startup_capture = match writer.capture(&ctx.config.startup_stream) {
            Ok(capture) => capture,
            Err(e @ ProtectionError::BackupWriteFailed { .. }) => {
                tracing::warn!("Startup capture failed: {}", e);
                CaptureResult::NoOp
            }
            Err(e) => return Err(e),
        };

        Ok((
            BoundProject {
                ctx,
                storage,
                ledger,
                writer,
                coordinator,
                verifier,
                monitor,
                log,
            },
            baseline,
            startup_capture,
        ))
    }

    /// Release the project lock and forget the bound project
    pub fn unbind_project(&mut self) -> Result<()> {
        let Some(bound) = self.bound.take() else {
            return Ok(());
        };
        self.locks.release(
            &bound.ctx.project_name,
            &bound.ctx.instance_id,
            bound.ctx.pid,
        )?;
        tracing::info!(event = "PROJECT_UNBOUND", "Unbound project {}", bound.ctx.project_name);
        Ok(())
    }

    // ========================================================================
    // Log operations
    // ========================================================================

    /// Append one entry with integrity checks before and backups after
    pub fn append_entry(&mut self, entry: &Entry) -> Result<AppendReport> {
        let now = self.time.wall_clock();
        let bound = self.bound_mut()?;

        let attempt = bound
            .verifier
            .before_write(&mut bound.monitor, entry.kind.as_str())?;

        let text = format_entry(entry, &bound.ctx.project_name, now);
        let bytes_written = bound
            .log
            .append(&text)
            .map_err(ProtectionError::io("append to", &bound.ctx.log_path))?;

        let captured = bound
            .verifier
            .after_write(&mut bound.monitor, &attempt, true)?;

        tracing::info!(
            event = "LOG_ENTRY_APPENDED",
            kind = entry.kind.as_str(),
            "Appended {} bytes to {:?}",
            bytes_written,
            bound.ctx.log_path
        );
        Ok(AppendReport {
            bytes_written,
            log_size: captured.size_after,
            recovery: attempt.recovery,
            captures: captured.captures,
            failed_streams: captured.failed_streams,
        })
    }

    /// One monitor cycle: detect damage and recover, otherwise catch the write
    /// streams up with the log
    pub fn poll(&mut self) -> Result<PollReport> {
        let bound = self.bound_mut()?;
        let status = bound
            .monitor
            .check()
            .map_err(ProtectionError::io("inspect", &bound.ctx.log_path))?;

        if status.is_damaged() {
            let outcome = bound.verifier.handle_damage(&mut bound.monitor, status)?;
            return Ok(PollReport {
                status,
                recovery: Some(outcome),
                captures: Vec::new(),
                failed_streams: Vec::new(),
            });
        }

        let captured = bound.verifier.capture_write_streams();
        Ok(PollReport {
            status,
            recovery: None,
            captures: captured.captures,
            failed_streams: captured.failed_streams,
        })
    }

    /// Restore the bound project's log from the best backup, regardless of its state
    pub fn recover(&mut self) -> Result<RecoveryReport> {
        let bound = self.bound_mut()?;
        let report = bound.coordinator.recover()?;
        bound.monitor.resync(report.restored_size);
        Ok(report)
    }

    /// Capture one stream now
    pub fn capture(&self, stream: &str) -> Result<CaptureResult> {
        self.bound()?.writer.capture(stream)
    }

    /// Forced FULL segment on `stream` without moving its ledger
    pub fn snapshot(&self, stream: &str) -> Result<CaptureResult> {
        self.bound()?.writer.snapshot(stream)
    }

    /// Full snapshot on the emergency stream
    pub fn emergency_backup(&self) -> Result<CaptureResult> {
        self.snapshot(EMERGENCY_STREAM)
    }

    pub fn reconstruct(&self, stream: &str) -> Result<String> {
        self.bound()?.coordinator.reconstruct(stream)
    }

    pub fn export_reconstruction(&self, stream: &str) -> Result<PathBuf> {
        self.bound()?.coordinator.export_reconstruction(stream)
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Inventory of every backup artifact of the bound project
    pub fn status(&self) -> Result<StatusReport> {
        let bound = self.bound()?;
        let ctx = &bound.ctx;

        let backups = bound
            .storage
            .describe_dir(&ctx.backup_dir)
            .map_err(ProtectionError::io("list", &ctx.backup_dir))?;
        let secondary = bound
            .storage
            .describe_dir(&ctx.external_root)
            .map_err(ProtectionError::io("list", &ctx.external_root))?
            .into_iter()
            .filter(|info| info.kind != BackupFileKind::Other)
            .collect();
        let ledgers = bound
            .ledger
            .entries()
            .map_err(ProtectionError::io("list", &ctx.backup_dir))?
            .into_iter()
            .map(|(stream, offset)| {
                let latest = bound.storage.latest_path(&stream);
                LedgerInfo {
                    latest: latest.exists().then_some(latest),
                    stream,
                    offset,
                }
            })
            .collect();
        let log_size = bound
            .log
            .size()
            .map_err(ProtectionError::io("inspect", &ctx.log_path))?;

        Ok(StatusReport {
            project: ctx.project_name.clone(),
            log_size,
            backups,
            ledgers,
            secondary,
        })
    }

    /// Find (and with `execute`, delete) outdated legacy backups.
    ///
    /// Candidates are legacy snapshots older than `legacy_cleanup_days` and all
    /// but the two newest `<project>-log-backup-*` copies in the project
    /// directory. Incremental segments are never touched.
    pub fn cleanup_legacy(&self, execute: bool) -> Result<CleanupReport> {
        let bound = self.bound()?;
        let ctx = &bound.ctx;
        let now = self.time.wall_clock();
        let max_age = chrono::Duration::days(self.maintenance.legacy_cleanup_days as i64);

        let mut candidates = Vec::new();
        let mut reclaimable_bytes = 0;

        for info in bound
            .storage
            .describe_dir(&ctx.backup_dir)
            .map_err(ProtectionError::io("list", &ctx.backup_dir))?
        {
            if info.kind != BackupFileKind::Legacy {
                continue;
            }
            let Some(modified) = info.modified else {
                continue;
            };
            let age = now.signed_duration_since(modified);
            if age > max_age {
                reclaimable_bytes += info.size;
                candidates.push((
                    info.path,
                    format!("legacy snapshot not updated for {} days", age.num_days()),
                ));
            }
        }

        let root_prefix = format!("{}-log-backup-", ctx.project_name);
        let root_copies: Vec<_> = bound
            .storage
            .describe_dir(&ctx.project_dir)
            .map_err(ProtectionError::io("list", &ctx.project_dir))?
            .into_iter()
            .filter(|info| {
                info.path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with(&root_prefix) && n.ends_with(".md"))
            })
            .collect();
        // describe_dir lists newest first
        for info in root_copies.into_iter().skip(2) {
            reclaimable_bytes += info.size;
            candidates.push((info.path, "duplicate backup in project root".to_string()));
        }

        let mut deleted = Vec::new();
        if execute {
            for (path, reason) in &candidates {
                match fs::remove_file(path) {
                    Ok(()) => {
                        tracing::info!("Deleted {:?} ({})", path, reason);
                        deleted.push(path.clone());
                    }
                    Err(e) => tracing::warn!("Failed to delete {:?}: {}", path, e),
                }
            }
        }

        Ok(CleanupReport {
            candidates,
            reclaimable_bytes,
            deleted,
        })
    }
}

impl Drop for LogProtectionService {
    fn drop(&mut self) {
        if let Err(e) = self.unbind_project() {
            tracing::warn!("Failed to unbind on shutdown: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::time_source::TestTimeSource;
    use tempfile::TempDir;

    fn settings(temp: &TempDir, instance_id: &str) -> ServiceSettings {
        let time: SharedTimeSource = Arc::new(TestTimeSource::new());
        ServiceSettings {
            config: Config::default(),
            app_root: temp.path().join("app"),
            secondary_dir: temp.path().join("secondary"),
            instance: InstanceIdentity::with_id(instance_id, time.as_ref()),
            pid: std::process::id(),
            time,
        }
    }

    fn project(temp: &TempDir) -> PathBuf {
        let dir = temp.path().join("demo");
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_operations_require_binding() {
        let temp = TempDir::new().unwrap();
        let mut service = LogProtectionService::new(settings(&temp, "inst-a")).unwrap();
        assert!(matches!(
            service.append_entry(&Entry::note("x")),
            Err(ProtectionError::NotBound)
        ));
        assert!(matches!(service.poll(), Err(ProtectionError::NotBound)));
    }

    #[test]
    fn test_bind_requires_directory() {
        let temp = TempDir::new().unwrap();
        let mut service = LogProtectionService::new(settings(&temp, "inst-a")).unwrap();
        assert!(matches!(
            service.bind_project(&temp.path().join("missing")),
            Err(ProtectionError::InvalidProject(_))
        ));
    }

    #[test]
    fn test_append_then_unbind_releases_lock() {
        let temp = TempDir::new().unwrap();
        let dir = project(&temp);
        let mut service = LogProtectionService::new(settings(&temp, "inst-a")).unwrap();
        service.start().unwrap();

        let report = service.bind_project(&dir).unwrap();
        assert_eq!(report.project, "demo");
        assert_eq!(report.startup_capture, CaptureResult::NoOp);
        assert!(service.locks().lock_path("demo").exists());

        let appended = service.append_entry(&Entry::note("hello")).unwrap();
        assert_eq!(appended.log_size, appended.bytes_written);
        assert!(appended.failed_streams.is_empty());

        service.unbind_project().unwrap();
        assert!(!service.locks().lock_path("demo").exists());
    }

    #[test]
    fn test_second_instance_gets_conflict() {
        let temp = TempDir::new().unwrap();
        let dir = project(&temp);

        let mut first = LogProtectionService::new(settings(&temp, "inst-a")).unwrap();
        first.start().unwrap();
        first.bind_project(&dir).unwrap();

        let mut second = LogProtectionService::new(settings(&temp, "inst-b")).unwrap();
        second.start().unwrap();
        let err = second.bind_project(&dir).unwrap_err();
        assert!(matches!(err, ProtectionError::LockConflict { ref holder, .. } if holder.instance_id == "inst-a"));
    }

    #[test]
    fn test_baseline_seeded_from_ledgers() {
        let temp = TempDir::new().unwrap();
        let dir = project(&temp);
        {
            let mut service = LogProtectionService::new(settings(&temp, "inst-a")).unwrap();
            service.start().unwrap();
            service.bind_project(&dir).unwrap();
            service.append_entry(&Entry::note("hello")).unwrap();
        }

        // Cleared while no instance was running
        fs::write(dir.join("demo-log.md"), "").unwrap();

        let mut service = LogProtectionService::new(settings(&temp, "inst-a")).unwrap();
        service.start().unwrap();
        let report = service.bind_project(&dir).unwrap();
        assert!(report.baseline > 0);

        let poll = service.poll().unwrap();
        assert!(matches!(poll.status, IntegrityStatus::Cleared { .. }));
        assert!(matches!(poll.recovery, Some(RecoveryOutcome::Restored(_))));
        assert_eq!(
            fs::metadata(dir.join("demo-log.md")).unwrap().len(),
            report.baseline
        );
    }

    #[test]
    fn test_poll_captures_external_growth() {
        let temp = TempDir::new().unwrap();
        let dir = project(&temp);
        let mut service = LogProtectionService::new(settings(&temp, "inst-a")).unwrap();
        service.start().unwrap();
        service.bind_project(&dir).unwrap();
        service.append_entry(&Entry::note("hello")).unwrap();

        use std::io::Write;
        let mut file = fs::OpenOptions::new()
            .append(true)
            .open(dir.join("demo-log.md"))
            .unwrap();
        file.write_all(b"\nwritten elsewhere\n").unwrap();

        let poll = service.poll().unwrap();
        assert_eq!(poll.status, IntegrityStatus::Ok);
        assert!(poll
            .captures
            .iter()
            .all(|(_, c)| c.mode() == Some(CaptureMode::Incremental)));

        let again = service.poll().unwrap();
        assert!(again.captures.iter().all(|(_, c)| *c == CaptureResult::NoOp));
    }

    #[test]
    fn test_cleanup_is_dry_run_by_default() {
        let temp = TempDir::new().unwrap();
        let dir = project(&temp);
        let mut s = settings(&temp, "inst-a");
        // Files written now are judged by a clock running 8 days ahead
        s.time = Arc::new(TestTimeSource::starting_at(
            chrono::Utc::now() + chrono::Duration::days(8),
        ));
        let mut service = LogProtectionService::new(s).unwrap();
        service.start().unwrap();
        service.bind_project(&dir).unwrap();

        let legacy = dir.join("backups").join("demo-log-bak-old.md");
        fs::write(&legacy, "old").unwrap();
        for i in 0..3 {
            fs::write(dir.join(format!("demo-log-backup-{i}.md")), "copy").unwrap();
        }
        fs::write(dir.join("backups").join("demo-log-incremental-primary-000001-full.md"), "x")
            .unwrap();

        let report = service.cleanup_legacy(false).unwrap();
        assert_eq!(report.candidates.len(), 2);
        assert!(report.deleted.is_empty());
        assert!(legacy.exists());

        let report = service.cleanup_legacy(true).unwrap();
        assert_eq!(report.deleted.len(), 2);
        assert!(!legacy.exists());
        assert!(dir
            .join("backups")
            .join("demo-log-incremental-primary-000001-full.md")
            .exists());
    }
}
