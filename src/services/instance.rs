//! Persistent instance identity
//!
//! Every installation keeps one instance id across restarts in
//! `<app-root>/persistent_instance.json`. Each run also writes
//! `<app-root>/config_instance_<id>.json`; the lock manager treats a lock whose
//! owner has no such artifact as stale even if the PID was recycled.

use super::protection::storage::atomic_write;
use super::time_source::TimeSource;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

const PERSISTENT_INSTANCE_FILE: &str = "persistent_instance.json";

/// Identity of one tool installation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceIdentity {
    pub instance_id: String,
    pub created_time: DateTime<Utc>,
}

/// Per-run artifact proving that an instance is alive
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceArtifact {
    pub instance_id: String,
    pub pid: u32,
    pub registered_at: DateTime<Utc>,
}

impl InstanceIdentity {
    /// New identity whose id is the last 8 digits of the current time in milliseconds
    pub fn generate(time: &dyn TimeSource) -> Self {
        let millis = time.unix_millis().rem_euclid(100_000_000);
        Self {
            instance_id: format!("{millis:08}"),
            created_time: time.wall_clock(),
        }
    }

    /// Identity with an explicitly chosen id (command-line override)
    pub fn with_id(instance_id: impl Into<String>, time: &dyn TimeSource) -> Self {
        Self {
            instance_id: instance_id.into(),
            created_time: time.wall_clock(),
        }
    }

    /// Load the persisted identity, creating it on first use.
    ///
    /// An unreadable file is replaced with a fresh identity.
    pub fn load_or_create(app_root: &Path, time: &dyn TimeSource) -> io::Result<Self> {
        let path = app_root.join(PERSISTENT_INSTANCE_FILE);
        match fs::read_to_string(&path) {
            Ok(json) => match serde_json::from_str::<InstanceIdentity>(&json) {
                Ok(identity) if is_valid_instance_id(&identity.instance_id) => {
                    return Ok(identity)
                }
                Ok(identity) => {
                    tracing::warn!(
                        "Ignoring invalid instance id '{}' in {:?}",
                        identity.instance_id,
                        path
                    );
                }
                Err(e) => {
                    tracing::warn!("Failed to parse {:?}: {}, regenerating", path, e);
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        let identity = Self::generate(time);
        fs::create_dir_all(app_root)?;
        let json = serde_json::to_string_pretty(&identity).map_err(io::Error::other)?;
        atomic_write(&path, json.as_bytes())?;
        tracing::info!("Created persistent instance id {}", identity.instance_id);
        Ok(identity)
    }

    /// Write the liveness artifact for this run
    pub fn register(&self, app_root: &Path, pid: u32, time: &dyn TimeSource) -> io::Result<PathBuf> {
        fs::create_dir_all(app_root)?;
        let artifact = InstanceArtifact {
            instance_id: self.instance_id.clone(),
            pid,
            registered_at: time.wall_clock(),
        };
        let path = artifact_path(app_root, &self.instance_id);
        let json = serde_json::to_string_pretty(&artifact).map_err(io::Error::other)?;
        atomic_write(&path, json.as_bytes())?;
        Ok(path)
    }
}

/// Path of the liveness artifact for `instance_id`
pub fn artifact_path(app_root: &Path, instance_id: &str) -> PathBuf {
    app_root.join(format!("config_instance_{instance_id}.json"))
}

/// Instance ids end up in file names
pub fn is_valid_instance_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 64
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::time_source::TestTimeSource;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_generated_id_is_eight_digits() {
        let time = TestTimeSource::new();
        time.advance(Duration::from_millis(1234));
        let identity = InstanceIdentity::generate(&time);
        assert_eq!(identity.instance_id.len(), 8);
        assert!(identity.instance_id.chars().all(|c| c.is_ascii_digit()));
        assert!(identity.instance_id.ends_with("1234"));
    }

    #[test]
    fn test_load_or_create_is_persistent() {
        let temp = TempDir::new().unwrap();
        let time = TestTimeSource::new();

        let first = InstanceIdentity::load_or_create(temp.path(), &time).unwrap();
        time.advance(Duration::from_secs(60));
        let second = InstanceIdentity::load_or_create(temp.path(), &time).unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn test_garbled_identity_is_regenerated() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join(PERSISTENT_INSTANCE_FILE), "not json").unwrap();

        let time = TestTimeSource::new();
        let identity = InstanceIdentity::load_or_create(temp.path(), &time).unwrap();
        assert!(is_valid_instance_id(&identity.instance_id));
    }

    #[test]
    fn test_register_writes_artifact() {
        let temp = TempDir::new().unwrap();
        let time = TestTimeSource::new();
        let identity = InstanceIdentity::with_id("abc123", &time);

        let path = identity.register(temp.path(), 42, &time).unwrap();
        assert_eq!(path, artifact_path(temp.path(), "abc123"));

        let artifact: InstanceArtifact =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(artifact.pid, 42);
        assert_eq!(artifact.instance_id, "abc123");
    }

    #[test]
    fn test_instance_id_validation() {
        assert!(is_valid_instance_id("12345678"));
        assert!(is_valid_instance_id("ci-runner_2"));
        assert!(!is_valid_instance_id(""));
        assert!(!is_valid_instance_id("../x"));
    }
}
