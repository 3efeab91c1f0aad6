//! Recovery and reconstruction
//!
//! `RecoveryCoordinator::recover` restores a damaged log from the best backup:
//! for every candidate stream it rebuilds the image ending at the stream's most
//! recent usable segment, walking back through INCREMENTAL segments to the
//! nearest FULL or TRUNCATION_DETECTED base. The image whose last segment was
//! captured most recently wins; legacy snapshots are only a fallback.
//!
//! Reconstruction is the manual counterpart: it concatenates every segment body
//! of one stream in capture order.

use super::backup::IncrementalBackupWriter;
use super::context::{validate_stream, LogProtectionContext};
use super::error::{ProtectionError, Result};
use super::storage::{atomic_write, BackupStorage, Segment, SegmentFile};
use super::types::{CaptureMode, CaptureResult, RecoveryReport, RecoverySource};
use crate::config::BEFORE_RECOVERY_STREAM;
use chrono::{DateTime, Utc};
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

/// Content chosen to replace the damaged log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreCandidate {
    pub source: RecoverySource,
    pub content: Vec<u8>,
}

/// Image of one stream ending at a given segment
#[derive(Debug, Clone)]
struct StreamImage {
    terminal: PathBuf,
    captured_at: DateTime<Utc>,
    segments: usize,
    content: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct RecoveryCoordinator {
    ctx: Arc<LogProtectionContext>,
    storage: BackupStorage,
    writer: IncrementalBackupWriter,
}

impl RecoveryCoordinator {
    pub fn new(
        ctx: Arc<LogProtectionContext>,
        storage: BackupStorage,
        writer: IncrementalBackupWriter,
    ) -> Self {
        Self {
            ctx,
            storage,
            writer,
        }
    }

    /// Preserve the damaged log, then overwrite it with the best backup.
    ///
    /// Backup artifacts are only ever added, never removed. Ledgers pointing
    /// past the restored size are rewound to 0.
    pub fn recover(&self) -> Result<RecoveryReport> {
        tracing::info!(
            event = "LOG_RECOVERY_STARTED",
            "Recovering {:?}",
            self.ctx.log_path
        );

        let preserved = match self.writer.snapshot(BEFORE_RECOVERY_STREAM)? {
            CaptureResult::Captured(segment) => Some(segment.path),
            CaptureResult::NoOp => None,
        };

        let Some(candidate) = self.select_candidate()? else {
            tracing::error!(
                event = "LOG_RECOVERY_FAILED",
                error = "no_backup_available",
                "No backup available for project {}",
                self.ctx.project_name
            );
            return Err(ProtectionError::NoBackupAvailable {
                project: self.ctx.project_name.clone(),
            });
        };

        fs::create_dir_all(&self.ctx.project_dir)
            .map_err(ProtectionError::io("create", &self.ctx.project_dir))?;
        atomic_write(&self.ctx.log_path, &candidate.content)
            .map_err(ProtectionError::io("restore", &self.ctx.log_path))?;

        let restored_size = candidate.content.len() as u64;
        self.writer.reset_ledgers_beyond(restored_size)?;
        tracing::info!(
            event = "LOG_RECOVERY_SUCCESS",
            "Restored {} bytes from {:?}",
            restored_size,
            candidate.source
        );

        Ok(RecoveryReport {
            source: candidate.source,
            restored_size,
            preserved,
        })
    }

    /// Best restore content without touching the log
    pub fn select_candidate(&self) -> Result<Option<RestoreCandidate>> {
        let mut best: Option<(String, StreamImage)> = None;

        for stream in self.ctx.config.candidate_streams() {
            let Some(image) = self.stream_image(&stream)? else {
                continue;
            };
            let newer = match &best {
                Some((_, current)) => image.captured_at > current.captured_at,
                None => true,
            };
            if newer {
                best = Some((stream, image));
            }
        }

        if let Some((stream, image)) = best {
            return Ok(Some(RestoreCandidate {
                source: RecoverySource::Stream {
                    stream,
                    terminal: image.terminal,
                    segments: image.segments,
                },
                content: image.content,
            }));
        }

        let legacy = self
            .storage
            .legacy_snapshots()
            .map_err(ProtectionError::io("list", &self.ctx.backup_dir))?;
        for path in legacy {
            match fs::read(&path) {
                Ok(content) => {
                    tracing::info!("Falling back to legacy snapshot {:?}", path);
                    return Ok(Some(RestoreCandidate {
                        source: RecoverySource::Legacy { path },
                        content,
                    }));
                }
                Err(e) => tracing::warn!("Skipping unreadable legacy snapshot {:?}: {}", path, e),
            }
        }

        Ok(None)
    }

    /// Newest restorable image of `stream`.
    ///
    /// Terminal segments are tried newest first; a terminal whose chain is broken
    /// (unreadable segment, offset gap) is skipped in favour of an older one.
    fn stream_image(&self, stream: &str) -> Result<Option<StreamImage>> {
        let files = self
            .storage
            .list_segments(stream)
            .map_err(ProtectionError::io("list", self.ctx.stream_dir(stream)))?;

        for terminal_idx in (0..files.len()).rev() {
            if files[terminal_idx].mode == CaptureMode::TruncationDetected {
                continue;
            }
            match self.resolve_chain(&files, terminal_idx) {
                Some(image) => return Ok(Some(image)),
                None => tracing::warn!(
                    "Segment chain ending at {:?} is broken, trying an older one",
                    files[terminal_idx].path
                ),
            }
        }
        Ok(None)
    }

    fn resolve_chain(&self, files: &[SegmentFile], terminal_idx: usize) -> Option<StreamImage> {
        let terminal = self.read_usable(&files[terminal_idx])?;
        if terminal.header.mode == CaptureMode::TruncationDetected {
            return None;
        }

        let mut bodies = vec![terminal.body];
        let mut start = terminal.header.start_offset;
        let mut mode = terminal.header.mode;
        let mut idx = terminal_idx;

        while !mode.is_base() {
            let prev_idx = idx.checked_sub(1)?;
            let prev = self.read_usable(&files[prev_idx])?;
            if prev.header.end_offset != start {
                return None;
            }
            start = prev.header.start_offset;
            mode = prev.header.mode;
            bodies.push(prev.body);
            idx = prev_idx;
        }

        let segments = bodies.len();
        let content = bodies.into_iter().rev().flatten().collect();
        Some(StreamImage {
            terminal: files[terminal_idx].path.clone(),
            captured_at: terminal.header.captured_at,
            segments,
            content,
        })
    }

    fn read_usable(&self, file: &SegmentFile) -> Option<Segment> {
        match self.storage.read_segment(&file.path) {
            Ok(segment) if segment.is_consistent() => Some(segment),
            Ok(_) => {
                tracing::warn!("Segment {:?} has inconsistent offsets", file.path);
                None
            }
            Err(e) => {
                tracing::warn!("Failed to read segment {:?}: {}", file.path, e);
                None
            }
        }
    }

    // ========================================================================
    // Reconstruction
    // ========================================================================

    /// Concatenate every segment body of `stream` in capture order.
    pub fn reconstruct(&self, stream: &str) -> Result<String> {
        let bytes = self.reconstruct_bytes(stream)?;
        String::from_utf8(bytes).map_err(|e| ProtectionError::Io {
            op: "decode reconstruction of",
            path: self.ctx.stream_dir(stream).to_path_buf(),
            source: io::Error::new(io::ErrorKind::InvalidData, e),
        })
    }

    fn reconstruct_bytes(&self, stream: &str) -> Result<Vec<u8>> {
        validate_stream(stream)?;
        let files = self
            .storage
            .list_segments(stream)
            .map_err(ProtectionError::io("list", self.ctx.stream_dir(stream)))?;
        if files.is_empty() {
            return Err(ProtectionError::NoBackupAvailable {
                project: self.ctx.project_name.clone(),
            });
        }

        let mut content = Vec::new();
        for file in &files {
            let segment = self
                .storage
                .read_segment(&file.path)
                .map_err(ProtectionError::io("read", &file.path))?;
            content.extend_from_slice(&segment.body);
        }
        tracing::info!(
            "Reconstructed {} bytes from {} segments of stream {}",
            content.len(),
            files.len(),
            stream
        );
        Ok(content)
    }

    /// Reconstruct `stream` into a `<project>-log-recovered-<timestamp>.md` export
    pub fn export_reconstruction(&self, stream: &str) -> Result<PathBuf> {
        let content = self.reconstruct(stream)?;
        let path = self
            .storage
            .write_recovered(content.as_bytes())
            .map_err(ProtectionError::io("write", &self.ctx.backup_dir))?;
        tracing::info!(
            event = "LOG_RECONSTRUCTION_EXPORTED",
            "Reconstruction of {} written to {:?}",
            stream,
            path
        );
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProtectionConfig;
    use crate::services::protection::ledger::PositionLedger;
    use crate::services::time_source::TestTimeSource;
    use std::io::Write;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        _temp: TempDir,
        ctx: Arc<LogProtectionContext>,
        time: Arc<TestTimeSource>,
        writer: IncrementalBackupWriter,
        ledger: PositionLedger,
        storage: BackupStorage,
        coordinator: RecoveryCoordinator,
    }

    fn fixture() -> Fixture {
        let temp = TempDir::new().unwrap();
        let project_dir = temp.path().join("demo");
        fs::create_dir_all(&project_dir).unwrap();
        let time = Arc::new(TestTimeSource::new());
        let ctx = Arc::new(
            LogProtectionContext::new(
                &project_dir,
                &temp.path().join("app"),
                &temp.path().join("secondary"),
                "12345678",
                std::process::id(),
                ProtectionConfig::default(),
                time.clone(),
            )
            .unwrap(),
        );
        let storage = BackupStorage::new(ctx.clone());
        let ledger = PositionLedger::new(ctx.backup_dir.clone());
        let writer = IncrementalBackupWriter::new(ctx.clone(), storage.clone(), ledger.clone());
        let coordinator = RecoveryCoordinator::new(ctx.clone(), storage.clone(), writer.clone());
        Fixture {
            _temp: temp,
            ctx,
            time,
            writer,
            ledger,
            storage,
            coordinator,
        }
    }

    impl Fixture {
        fn append(&self, text: &str) {
            let mut file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.ctx.log_path)
                .unwrap();
            file.write_all(text.as_bytes()).unwrap();
        }

        fn capture(&self, stream: &str) {
            self.time.advance(Duration::from_secs(1));
            self.writer.capture(stream).unwrap();
        }

        fn log(&self) -> String {
            fs::read_to_string(&self.ctx.log_path).unwrap()
        }
    }

    #[test]
    fn test_recover_rebuilds_chain_after_clear() {
        let f = fixture();
        f.append("hello");
        f.capture("primary");
        f.append("\nworld");
        f.capture("primary");

        fs::write(&f.ctx.log_path, "").unwrap();
        let report = f.coordinator.recover().unwrap();

        assert_eq!(f.log(), "hello\nworld");
        assert_eq!(report.restored_size, 11);
        assert_eq!(report.preserved, None);
        assert!(matches!(
            report.source,
            RecoverySource::Stream { ref stream, segments: 2, .. } if stream == "primary"
        ));
    }

    #[test]
    fn test_truncation_segment_is_never_restored() {
        let f = fixture();
        f.append("hello");
        f.capture("primary");
        f.append("\nworld");
        f.capture("primary");

        fs::write(&f.ctx.log_path, "").unwrap();
        f.capture("primary");
        let last = f.storage.list_segments("primary").unwrap();
        assert_eq!(last.last().unwrap().mode, CaptureMode::TruncationDetected);

        f.coordinator.recover().unwrap();
        assert_eq!(f.log(), "hello\nworld");
    }

    #[test]
    fn test_recover_preserves_damaged_state_first() {
        let f = fixture();
        f.append(&"x".repeat(2000));
        f.capture("primary");
        fs::write(&f.ctx.log_path, "xx").unwrap();

        let report = f.coordinator.recover().unwrap();
        let preserved = report.preserved.expect("damaged log should be preserved");
        let segment = f.storage.read_segment(&preserved).unwrap();
        assert_eq!(segment.header.stream, BEFORE_RECOVERY_STREAM);
        assert_eq!(segment.body, b"xx");
        assert_eq!(f.log().len(), 2000);
    }

    #[test]
    fn test_most_recent_stream_wins() {
        let f = fixture();
        f.append("one");
        f.capture("primary");
        f.append(" two");
        f.capture("secondary");

        fs::write(&f.ctx.log_path, "").unwrap();
        let report = f.coordinator.recover().unwrap();

        assert_eq!(f.log(), "one two");
        assert!(matches!(
            report.source,
            RecoverySource::Stream { ref stream, .. } if stream == "secondary"
        ));
    }

    #[test]
    fn test_broken_chain_falls_back_to_older_terminal() {
        let f = fixture();
        f.append("hello");
        f.capture("primary");
        f.append(" world");
        f.capture("primary");
        f.append("!");
        f.capture("primary");

        // Lose the middle segment: the newest INCREMENTAL no longer links up
        let files = f.storage.list_segments("primary").unwrap();
        fs::remove_file(&files[1].path).unwrap();

        fs::write(&f.ctx.log_path, "").unwrap();
        f.coordinator.recover().unwrap();
        assert_eq!(f.log(), "hello");
        assert_eq!(f.ledger.get("primary"), 0);
    }

    #[test]
    fn test_legacy_restore_rewinds_larger_ledgers() {
        let f = fixture();
        f.append(&"a".repeat(40));
        f.capture("primary");
        for file in f.storage.list_segments("primary").unwrap() {
            fs::remove_file(&file.path).unwrap();
        }
        fs::create_dir_all(&f.ctx.backup_dir).unwrap();
        fs::write(f.ctx.backup_dir.join("demo-log-bak-20240101.md"), "old entries").unwrap();

        fs::write(&f.ctx.log_path, "").unwrap();
        let report = f.coordinator.recover().unwrap();
        assert!(matches!(report.source, RecoverySource::Legacy { .. }));
        assert_eq!(report.restored_size, 11);
        assert_eq!(f.ledger.get("primary"), 0);

        f.append(&"b".repeat(60));
        f.capture("primary");
        let files = f.storage.list_segments("primary").unwrap();
        let newest = f.storage.read_segment(&files.last().unwrap().path).unwrap();
        assert_eq!(newest.header.mode, CaptureMode::Full);
        assert_eq!(newest.body, f.log().as_bytes());
    }

    #[test]
    fn test_legacy_snapshot_is_fallback_only() {
        let f = fixture();
        fs::create_dir_all(&f.ctx.backup_dir).unwrap();
        fs::write(f.ctx.backup_dir.join("demo-log-bak-20240101.md"), "legacy").unwrap();

        fs::write(&f.ctx.log_path, "").unwrap();
        let report = f.coordinator.recover().unwrap();
        assert_eq!(f.log(), "legacy");
        assert!(matches!(report.source, RecoverySource::Legacy { .. }));

        f.append(" and more");
        f.capture("primary");
        fs::write(&f.ctx.log_path, "").unwrap();
        let report = f.coordinator.recover().unwrap();
        assert!(matches!(report.source, RecoverySource::Stream { .. }));
    }

    #[test]
    fn test_no_backup_available() {
        let f = fixture();
        let err = f.coordinator.recover().unwrap_err();
        assert!(matches!(err, ProtectionError::NoBackupAvailable { .. }));
    }

    #[test]
    fn test_recovery_never_deletes_backups() {
        let f = fixture();
        f.append("hello");
        f.capture("primary");
        let before = f.storage.list_segments("primary").unwrap();

        fs::write(&f.ctx.log_path, "h").unwrap();
        f.coordinator.recover().unwrap();

        assert_eq!(f.storage.list_segments("primary").unwrap(), before);
        assert_eq!(f.storage.list_segments(BEFORE_RECOVERY_STREAM).unwrap().len(), 1);
    }

    #[test]
    fn test_reconstruct_concatenates_history() {
        let f = fixture();
        f.append("a");
        f.capture("primary");
        f.append("b");
        f.capture("primary");
        f.append("c");
        f.capture("primary");

        assert_eq!(f.coordinator.reconstruct("primary").unwrap(), "abc");

        let path = f.coordinator.export_reconstruction("primary").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "abc");
        assert!(path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("demo-log-recovered-"));
    }

    #[test]
    fn test_reconstruct_empty_stream_fails() {
        let f = fixture();
        assert!(matches!(
            f.coordinator.reconstruct("primary"),
            Err(ProtectionError::NoBackupAvailable { .. })
        ));
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(32))]

            /// Reconstruction after every append reproduces the log byte for byte
            #[test]
            fn prop_reconstruct_matches_log(
                chunks in prop::collection::vec("[a-z \\n]{1,16}", 1..8)
            ) {
                let f = fixture();
                for chunk in &chunks {
                    f.append(chunk);
                    f.capture("primary");
                }
                prop_assert_eq!(f.coordinator.reconstruct("primary").unwrap(), f.log());
            }

            /// A cleared log always comes back as it was at the last capture
            #[test]
            fn prop_recover_restores_last_capture(
                chunks in prop::collection::vec("[a-z]{1,16}", 1..6)
            ) {
                let f = fixture();
                for chunk in &chunks {
                    f.append(chunk);
                    f.capture("primary");
                }
                let expected = f.log();
                fs::write(&f.ctx.log_path, "").unwrap();
                f.coordinator.recover().unwrap();
                prop_assert_eq!(f.log(), expected);
            }
        }
    }
}
