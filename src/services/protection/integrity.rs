//! Log integrity monitor
//!
//! Samples the log size and compares it with the last size that was known to
//! be good. Damage is reported but never resynced here; the caller resyncs after
//! recovery has run.

use super::error::ProtectionError;
use super::types::IntegrityStatus;
use std::fs;
use std::io;
use std::path::PathBuf;

/// Classify a size transition.
///
/// `current` is `None` when the log does not exist.
pub fn classify(last_size: u64, current: Option<u64>, ratio: f64, min_size: u64) -> IntegrityStatus {
    match current {
        None if last_size > 0 => IntegrityStatus::Missing {
            previous_size: last_size,
        },
        None => IntegrityStatus::Ok,
        Some(0) if last_size > 0 => IntegrityStatus::Cleared {
            previous_size: last_size,
        },
        Some(size)
            if size < last_size
                && (size as f64) < last_size as f64 * ratio
                && last_size > min_size =>
        {
            IntegrityStatus::Truncated {
                previous_size: last_size,
                current_size: size,
            }
        }
        Some(_) => IntegrityStatus::Ok,
    }
}

#[derive(Debug, Clone)]
pub struct IntegrityMonitor {
    log_path: PathBuf,
    ratio: f64,
    min_size: u64,
    last_size: u64,
}

impl IntegrityMonitor {
    pub fn new(log_path: PathBuf, ratio: f64, min_size: u64, baseline: u64) -> Self {
        Self {
            log_path,
            ratio,
            min_size,
            last_size: baseline,
        }
    }

    /// Current size of the log, `None` if it does not exist
    pub fn measure(&self) -> io::Result<Option<u64>> {
        match fs::metadata(&self.log_path) {
            Ok(metadata) => Ok(Some(metadata.len())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Sample the log once.
    ///
    /// `Ok` results move the baseline to the measured size; a shrink too small
    /// to count as truncation is accepted with a warning.
    pub fn check(&mut self) -> io::Result<IntegrityStatus> {
        let current = self.measure()?;
        let status = classify(self.last_size, current, self.ratio, self.min_size);

        match status {
            IntegrityStatus::Ok => {
                if let Some(size) = current {
                    if size < self.last_size {
                        tracing::warn!(
                            event = "LOG_SIZE_DECREASED",
                            "Log {:?} shrank from {} to {} bytes, below the truncation threshold",
                            self.log_path,
                            self.last_size,
                            size
                        );
                    }
                    self.last_size = size;
                }
            }
            damaged => {
                if let Some(damage) = ProtectionError::from_damage(&self.log_path, damaged) {
                    tracing::warn!(event = damage.event_name(), "{}", damage);
                }
            }
        }

        Ok(status)
    }

    pub fn last_size(&self) -> u64 {
        self.last_size
    }

    /// Accept `size` as the new known-good size
    pub fn resync(&mut self, size: u64) {
        self.last_size = size;
    }

    /// Accept whatever is on disk now as known-good
    pub fn resync_from_disk(&mut self) -> io::Result<u64> {
        let size = self.measure()?.unwrap_or(0);
        self.last_size = size;
        Ok(size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const RATIO: f64 = 0.1;
    const MIN: u64 = 1000;

    #[test]
    fn test_classify_rules() {
        assert_eq!(classify(0, None, RATIO, MIN), IntegrityStatus::Ok);
        assert_eq!(
            classify(11, None, RATIO, MIN),
            IntegrityStatus::Missing { previous_size: 11 }
        );
        assert_eq!(
            classify(11, Some(0), RATIO, MIN),
            IntegrityStatus::Cleared { previous_size: 11 }
        );
        assert_eq!(classify(0, Some(0), RATIO, MIN), IntegrityStatus::Ok);
        assert_eq!(
            classify(5000, Some(400), RATIO, MIN),
            IntegrityStatus::Truncated {
                previous_size: 5000,
                current_size: 400
            }
        );
        // Small logs never count as truncated
        assert_eq!(classify(900, Some(10), RATIO, MIN), IntegrityStatus::Ok);
        // Shrinking by less than the ratio is tolerated
        assert_eq!(classify(5000, Some(600), RATIO, MIN), IntegrityStatus::Ok);
        assert_eq!(classify(5000, Some(6000), RATIO, MIN), IntegrityStatus::Ok);
    }

    #[test]
    fn test_check_detects_clear_and_keeps_baseline() {
        let temp = TempDir::new().unwrap();
        let log = temp.path().join("demo-log.md");
        std::fs::write(&log, "hello\nworld").unwrap();

        let mut monitor = IntegrityMonitor::new(log.clone(), RATIO, MIN, 0);
        assert_eq!(monitor.check().unwrap(), IntegrityStatus::Ok);
        assert_eq!(monitor.last_size(), 11);

        std::fs::write(&log, "").unwrap();
        assert_eq!(
            monitor.check().unwrap(),
            IntegrityStatus::Cleared { previous_size: 11 }
        );
        // Damage is reported again until someone resyncs
        assert_eq!(monitor.last_size(), 11);
        assert!(monitor.check().unwrap().is_damaged());

        monitor.resync_from_disk().unwrap();
        assert_eq!(monitor.check().unwrap(), IntegrityStatus::Ok);
    }

    #[test]
    fn test_check_detects_missing_file() {
        let temp = TempDir::new().unwrap();
        let log = temp.path().join("demo-log.md");

        let mut monitor = IntegrityMonitor::new(log.clone(), RATIO, MIN, 0);
        assert_eq!(monitor.check().unwrap(), IntegrityStatus::Ok);

        std::fs::write(&log, "abc").unwrap();
        monitor.check().unwrap();
        std::fs::remove_file(&log).unwrap();
        assert_eq!(
            monitor.check().unwrap(),
            IntegrityStatus::Missing { previous_size: 3 }
        );
    }

    #[test]
    fn test_small_shrink_resyncs() {
        let temp = TempDir::new().unwrap();
        let log = temp.path().join("demo-log.md");
        std::fs::write(&log, "x".repeat(2000)).unwrap();

        let mut monitor = IntegrityMonitor::new(log.clone(), RATIO, MIN, 0);
        monitor.check().unwrap();
        std::fs::write(&log, "x".repeat(1500)).unwrap();

        assert_eq!(monitor.check().unwrap(), IntegrityStatus::Ok);
        assert_eq!(monitor.last_size(), 1500);
    }

    #[test]
    fn test_seeded_baseline_detects_offline_damage() {
        let temp = TempDir::new().unwrap();
        let log = temp.path().join("demo-log.md");
        std::fs::write(&log, "").unwrap();

        let mut monitor = IntegrityMonitor::new(log, RATIO, MIN, 11);
        assert!(matches!(
            monitor.check().unwrap(),
            IntegrityStatus::Cleared { .. }
        ));
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_growth_is_always_ok(last in 0u64..1_000_000, grow in 0u64..1_000_000) {
                prop_assert_eq!(classify(last, Some(last + grow), RATIO, MIN), IntegrityStatus::Ok);
            }

            #[test]
            fn prop_damage_requires_prior_content(current in proptest::option::of(0u64..1_000_000)) {
                prop_assert_eq!(classify(0, current, RATIO, MIN), IntegrityStatus::Ok);
            }
        }
    }
}
