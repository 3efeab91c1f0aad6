//! Project lock manager
//!
//! One lock file per project, `<app-root>/.project_lock_<project>`, holding a
//! JSON `LockInfo`. Acquisition creates the file with create-if-absent
//! semantics; a lock whose owner is no longer live is deleted and the create is
//! retried a bounded number of times.

use super::error::{ProtectionError, Result};
use super::storage::atomic_write;
use crate::services::instance::artifact_path;
use crate::services::process::is_process_running;
use crate::services::time_source::SharedTimeSource;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const LOCK_PREFIX: &str = ".project_lock_";
const MAX_ACQUIRE_ATTEMPTS: usize = 3;

/// Contents of a project lock file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub instance_id: String,
    pub pid: u32,
    pub project_name: String,
    pub lock_time: DateTime<Utc>,
    pub project_folder: PathBuf,
}

/// Decides whether the owner recorded in a lock is still running
pub trait LivenessProbe: Send + Sync + std::fmt::Debug {
    fn is_live(&self, pid: u32, instance_id: &str) -> bool;
}

/// Owner is live when its PID runs and its instance artifact still exists
#[derive(Debug, Clone)]
pub struct ProcessLiveness {
    app_root: PathBuf,
}

impl ProcessLiveness {
    pub fn new(app_root: impl Into<PathBuf>) -> Self {
        Self {
            app_root: app_root.into(),
        }
    }
}

impl LivenessProbe for ProcessLiveness {
    fn is_live(&self, pid: u32, instance_id: &str) -> bool {
        is_process_running(pid) && artifact_path(&self.app_root, instance_id).exists()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    Locked(LockInfo),
    /// Another live instance holds the lock; nothing was changed
    Conflict(LockInfo),
}

/// A lock file found in the app root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRecord {
    pub project: String,
    pub path: PathBuf,
    /// `None` when the file cannot be parsed
    pub info: Option<LockInfo>,
    pub live: bool,
}

#[derive(Debug, Clone)]
pub struct ProjectLockManager {
    app_root: PathBuf,
    probe: Arc<dyn LivenessProbe>,
    time: SharedTimeSource,
}

impl ProjectLockManager {
    pub fn new(app_root: impl Into<PathBuf>, probe: Arc<dyn LivenessProbe>, time: SharedTimeSource) -> Self {
        Self {
            app_root: app_root.into(),
            probe,
            time,
        }
    }

    pub fn with_process_liveness(app_root: impl Into<PathBuf>, time: SharedTimeSource) -> Self {
        let app_root = app_root.into();
        let probe = Arc::new(ProcessLiveness::new(app_root.clone()));
        Self::new(app_root, probe, time)
    }

    pub fn lock_path(&self, project: &str) -> PathBuf {
        self.app_root.join(format!("{LOCK_PREFIX}{project}"))
    }

    /// Read the lock of `project`; a garbled file is an `InvalidData` error
    pub fn read(&self, project: &str) -> io::Result<Option<LockInfo>> {
        read_lock_file(&self.lock_path(project))
    }

    /// Try to become the owner of `project`.
    ///
    /// Re-acquiring with the same instance id refreshes the lock. A different
    /// live owner yields `Conflict` without touching its file.
    pub fn acquire(
        &self,
        project: &str,
        instance_id: &str,
        pid: u32,
        project_folder: &Path,
    ) -> Result<AcquireOutcome> {
        let path = self.lock_path(project);
        fs::create_dir_all(&self.app_root).map_err(ProtectionError::io("create", &self.app_root))?;

        let mut stale_pid = 0;
        for attempt in 0..MAX_ACQUIRE_ATTEMPTS {
            let info = LockInfo {
                instance_id: instance_id.to_string(),
                pid,
                project_name: project.to_string(),
                lock_time: self.time.wall_clock(),
                project_folder: project_folder.to_path_buf(),
            };

            match self.create_exclusive(&path, &info) {
                Ok(()) => {
                    tracing::info!(
                        event = "PROJECT_LOCK_ACQUIRED",
                        "Locked project {} for instance {} (pid {})",
                        project,
                        instance_id,
                        pid
                    );
                    return Ok(AcquireOutcome::Locked(info));
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(ProtectionError::io("create", &path)(e)),
            }

            match read_lock_file(&path) {
                Ok(Some(existing)) if existing.instance_id == instance_id => {
                    // Another process of this same instance may hold it; keep its pid
                    let holder_pid = if existing.pid != pid && is_process_running(existing.pid) {
                        existing.pid
                    } else {
                        pid
                    };
                    let refreshed = LockInfo {
                        pid: holder_pid,
                        ..info
                    };
                    write_lock_file(&path, &refreshed)
                        .map_err(ProtectionError::io("refresh", &path))?;
                    tracing::debug!("Refreshed lock on project {}", project);
                    return Ok(AcquireOutcome::Locked(refreshed));
                }
                Ok(Some(existing)) => {
                    if self.probe.is_live(existing.pid, &existing.instance_id) {
                        tracing::warn!(
                            event = "PROJECT_LOCK_CONFLICT",
                            "Project {} is locked by instance {} (pid {})",
                            project,
                            existing.instance_id,
                            existing.pid
                        );
                        return Ok(AcquireOutcome::Conflict(existing));
                    }
                    stale_pid = existing.pid;
                    tracing::info!(
                        event = "PROJECT_LOCK_STALE",
                        "Removing stale lock on {} left by instance {} (pid {})",
                        project,
                        existing.instance_id,
                        existing.pid
                    );
                }
                // Released between our create and read
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!("Unreadable lock {:?} treated as stale: {}", path, e);
                }
            }

            if let Err(e) = remove_if_present(&path) {
                tracing::warn!(
                    "Failed to remove stale lock {:?} (attempt {}): {}",
                    path,
                    attempt + 1,
                    e
                );
            }
        }

        Err(ProtectionError::LockStale {
            project: project.to_string(),
            pid: stale_pid,
        })
    }

    /// Delete the lock of `project` if `instance_id` owns it.
    ///
    /// A lock refreshed by another running process of the same instance is kept.
    /// Returns whether a lock file was removed.
    pub fn release(&self, project: &str, instance_id: &str, pid: u32) -> Result<bool> {
        let path = self.lock_path(project);
        let existing = match read_lock_file(&path) {
            Ok(Some(existing)) => existing,
            Ok(None) => return Ok(false),
            Err(e) => {
                tracing::warn!("Not releasing unreadable lock {:?}: {}", path, e);
                return Ok(false);
            }
        };

        if existing.instance_id != instance_id {
            tracing::warn!(
                "Not releasing lock on {} held by instance {}",
                project,
                existing.instance_id
            );
            return Ok(false);
        }
        if existing.pid != pid && is_process_running(existing.pid) {
            tracing::debug!(
                "Lock on {} still used by pid {} of this instance",
                project,
                existing.pid
            );
            return Ok(false);
        }

        remove_if_present(&path).map_err(ProtectionError::io("remove", &path))?;
        tracing::info!(event = "PROJECT_LOCK_RELEASED", "Released lock on {}", project);
        Ok(true)
    }

    /// Every lock file in the app root with its liveness
    pub fn list(&self) -> Result<Vec<LockRecord>> {
        let read_dir = match fs::read_dir(&self.app_root) {
            Ok(rd) => rd,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(ProtectionError::io("list", &self.app_root)(e)),
        };

        let mut records = Vec::new();
        for entry in read_dir {
            let entry = entry.map_err(ProtectionError::io("list", &self.app_root))?;
            let name = entry.file_name();
            let Some(project) = name.to_str().and_then(|n| n.strip_prefix(LOCK_PREFIX)) else {
                continue;
            };
            if project.ends_with(".tmp") {
                continue;
            }
            let path = entry.path();
            let info = read_lock_file(&path).ok().flatten();
            let live = info
                .as_ref()
                .is_some_and(|i| self.probe.is_live(i.pid, &i.instance_id));
            records.push(LockRecord {
                project: project.to_string(),
                path,
                info,
                live,
            });
        }
        records.sort_by(|a, b| a.project.cmp(&b.project));
        Ok(records)
    }

    /// Remove every lock whose owner is not live; returns the affected projects
    pub fn sweep_stale(&self) -> Result<Vec<String>> {
        let mut removed = Vec::new();
        for record in self.list()? {
            if record.live {
                continue;
            }
            match remove_if_present(&record.path) {
                Ok(()) => {
                    tracing::info!(
                        event = "PROJECT_LOCK_STALE",
                        "Swept stale lock on {}",
                        record.project
                    );
                    removed.push(record.project);
                }
                Err(e) => tracing::warn!("Failed to sweep {:?}: {}", record.path, e),
            }
        }
        Ok(removed)
    }

    fn create_exclusive(&self, path: &Path, info: &LockInfo) -> io::Result<()> {
        let json = serde_json::to_string_pretty(info).map_err(io::Error::other)?;
        let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
        if let Err(e) = file.write_all(json.as_bytes()).and_then(|()| file.sync_all()) {
            drop(file);
            let _ = fs::remove_file(path);
            return Err(e);
        }
        Ok(())
    }
}

fn read_lock_file(path: &Path) -> io::Result<Option<LockInfo>> {
    match fs::read_to_string(path) {
        Ok(json) => serde_json::from_str(&json)
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

fn write_lock_file(path: &Path, info: &LockInfo) -> io::Result<()> {
    let json = serde_json::to_string_pretty(info).map_err(io::Error::other)?;
    atomic_write(path, json.as_bytes())
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
