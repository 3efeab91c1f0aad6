//! XDG-compliant log directory management
//!
//! The tool's own diagnostics go to `$XDG_STATE_HOME/injectlog/logs/`
//! (typically `~/.local/state/injectlog/logs/`). These are tracing output files,
//! not the protected project logs.
//!
//! Each run writes PID-named files so a `watch` loop and one-shot commands can
//! run side by side. Files left behind by dead processes are removed on startup.

use super::process::is_process_running;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::{Duration, SystemTime};

/// Minimum age for log files to be cleaned up (24 hours)
const CLEANUP_AGE: Duration = Duration::from_secs(24 * 60 * 60);

const APP_DIR: &str = "injectlog";

static LOG_DIR: OnceLock<PathBuf> = OnceLock::new();

/// Base diagnostics directory, created on first use.
///
/// Falls back to the system temp directory when the state directory cannot be
/// created.
pub fn log_dir() -> &'static PathBuf {
    LOG_DIR.get_or_init(|| {
        let fallback = std::env::temp_dir().join("injectlog-logs");
        let dir = state_log_dir().unwrap_or_else(|| fallback.clone());

        if let Err(e) = fs::create_dir_all(&dir) {
            tracing::warn!("Failed to create log directory {:?}: {}", dir, e);
            return fallback;
        }
        dir
    })
}

fn state_log_dir() -> Option<PathBuf> {
    if let Ok(state_home) = std::env::var("XDG_STATE_HOME") {
        let path = PathBuf::from(state_home);
        if path.is_absolute() {
            return Some(path.join(APP_DIR).join("logs"));
        }
    }

    dirs::state_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join(".local").join("state")))
        .map(|state| state.join(APP_DIR).join("logs"))
}

/// `{log_dir}/injectlog-{PID}.log`
pub fn main_log_path() -> PathBuf {
    log_dir().join(format!("injectlog-{}.log", std::process::id()))
}

/// `{log_dir}/incidents-{PID}.log`, the WARN+ copy of the main log
pub fn incidents_log_path() -> PathBuf {
    log_dir().join(format!("incidents-{}.log", std::process::id()))
}

/// Remove diagnostics left by processes that are no longer running
pub fn cleanup_stale_logs() {
    let removed = cleanup_stale_logs_in_dir(log_dir(), std::process::id(), CLEANUP_AGE);
    if removed > 0 {
        tracing::debug!("Cleaned up {} stale log files", removed);
    }
}

fn cleanup_stale_logs_in_dir(dir: &Path, current_pid: u32, min_age: Duration) -> usize {
    let Ok(entries) = fs::read_dir(dir) else {
        return 0;
    };

    let mut removed = 0;
    for entry in entries.flatten() {
        let file_name = entry.file_name();
        let name = file_name.to_string_lossy();

        let Some(pid) = extract_pid_from_filename(&name) else {
            continue;
        };
        if pid == current_pid || is_process_running(pid) {
            continue;
        }
        if !entry.file_type().map(|t| t.is_file()).unwrap_or(false)
            || !is_file_older_than(&entry.path(), min_age)
        {
            continue;
        }

        match fs::remove_file(entry.path()) {
            Ok(()) => removed += 1,
            Err(e) => tracing::debug!("Failed to clean up stale log {:?}: {}", entry.path(), e),
        }
    }
    removed
}

fn is_file_older_than(path: &Path, age: Duration) -> bool {
    let Ok(modified) = fs::metadata(path).and_then(|m| m.modified()) else {
        return false;
    };

    SystemTime::now()
        .duration_since(modified)
        .map(|elapsed| elapsed >= age)
        .unwrap_or(false)
}

/// PID from a name like `injectlog-12345.log`
fn extract_pid_from_filename(name: &str) -> Option<u32> {
    let without_ext = name.strip_suffix(".log")?;
    let (_, pid) = without_ext.rsplit_once('-')?;
    pid.parse().ok()
}

/// Print every directory the tool reads or writes
pub fn print_all_paths(config_path: &Path, app_root: &Path, secondary_dir: &Path) {
    use std::io::Write;

    let stdout = std::io::stdout();
    let mut handle = stdout.lock();

    writeln!(handle, "injectlog directories:").ok();
    writeln!(handle).ok();
    writeln!(handle, "Config:       {}", config_path.display()).ok();
    writeln!(handle, "App root:     {}", app_root.display()).ok();
    writeln!(
        handle,
        "  instance:     {}",
        app_root.join("persistent_instance.json").display()
    )
    .ok();
    writeln!(
        handle,
        "  locks:        {}",
        app_root.join(".project_lock_<project>").display()
    )
    .ok();
    writeln!(handle, "Secondary:    {}", secondary_dir.display()).ok();
    writeln!(handle, "Logs:         {}", log_dir().display()).ok();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::process::find_unused_pid;
    use tempfile::TempDir;

    #[test]
    fn test_log_dir_is_absolute() {
        assert!(log_dir().is_absolute());
    }

    #[test]
    fn test_log_paths_contain_pid() {
        let pid = std::process::id().to_string();

        let main = main_log_path();
        let name = main.file_name().unwrap().to_string_lossy();
        assert!(name.starts_with("injectlog-"));
        assert!(name.contains(&pid));

        let incidents = incidents_log_path();
        let name = incidents.file_name().unwrap().to_string_lossy();
        assert!(name.starts_with("incidents-"));
        assert!(name.ends_with(".log"));
    }

    #[test]
    fn test_extract_pid_from_filename() {
        assert_eq!(extract_pid_from_filename("injectlog-12345.log"), Some(12345));
        assert_eq!(extract_pid_from_filename("incidents-1.log"), Some(1));
        assert_eq!(extract_pid_from_filename("no-pid.txt"), None);
        assert_eq!(extract_pid_from_filename("invalid"), None);
    }

    #[test]
    fn test_cleanup_removes_only_dead_process_logs() {
        let temp = TempDir::new().unwrap();
        let me = std::process::id();
        let dead = find_unused_pid().unwrap();

        let own = temp.path().join(format!("injectlog-{me}.log"));
        let stale = temp.path().join(format!("injectlog-{dead}.log"));
        let unrelated = temp.path().join("notes.txt");
        for path in [&own, &stale, &unrelated] {
            fs::write(path, "x").unwrap();
        }

        let removed = cleanup_stale_logs_in_dir(temp.path(), me, Duration::ZERO);

        assert_eq!(removed, 1);
        assert!(own.exists());
        assert!(!stale.exists());
        assert!(unrelated.exists());
    }

    #[test]
    fn test_cleanup_keeps_recent_files() {
        let temp = TempDir::new().unwrap();
        let stale = temp.path().join(format!("incidents-{}.log", find_unused_pid().unwrap()));
        fs::write(&stale, "x").unwrap();

        assert_eq!(
            cleanup_stale_logs_in_dir(temp.path(), std::process::id(), CLEANUP_AGE),
            0
        );
        assert!(stale.exists());
    }
}
