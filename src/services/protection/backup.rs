//! Incremental backup writer
//!
//! Compares the log against each stream's ledger offset and stores only the
//! bytes the stream has not seen yet. A capture writes its segment before it
//! moves the ledger, so a failed write is retried in full on the next cycle.

use super::context::{validate_stream, LogProtectionContext};
use super::error::{ProtectionError, Result};
use super::ledger::PositionLedger;
use super::storage::BackupStorage;
use super::types::{CaptureMode, CaptureResult, CapturedSegment, SegmentHeader};
use std::fs;
use std::io;
use std::sync::Arc;

/// Decide how a stream at ledger offset `pos` captures a log of `size` bytes.
///
/// Returns the mode and the offset the segment body starts at, or `None` when
/// there is nothing new.
pub fn plan_capture(pos: u64, size: u64) -> Option<(CaptureMode, u64)> {
    if size == pos {
        None
    } else if pos == 0 {
        Some((CaptureMode::Full, 0))
    } else if size > pos {
        Some((CaptureMode::Incremental, pos))
    } else {
        Some((CaptureMode::TruncationDetected, 0))
    }
}

#[derive(Debug, Clone)]
pub struct IncrementalBackupWriter {
    ctx: Arc<LogProtectionContext>,
    storage: BackupStorage,
    ledger: PositionLedger,
}

impl IncrementalBackupWriter {
    pub fn new(
        ctx: Arc<LogProtectionContext>,
        storage: BackupStorage,
        ledger: PositionLedger,
    ) -> Self {
        Self {
            ctx,
            storage,
            ledger,
        }
    }

    /// Capture the bytes `stream` has not stored yet.
    pub fn capture(&self, stream: &str) -> Result<CaptureResult> {
        validate_stream(stream)?;

        let Some(content) = self.read_log()? else {
            tracing::debug!("Log {:?} missing, nothing to capture", self.ctx.log_path);
            return Ok(CaptureResult::NoOp);
        };
        let size = content.len() as u64;
        let pos = self.ledger.get(stream);

        let Some((mode, start)) = plan_capture(pos, size) else {
            tracing::debug!("Stream {} up to date at offset {}", stream, pos);
            return Ok(CaptureResult::NoOp);
        };

        if mode == CaptureMode::TruncationDetected {
            tracing::warn!(
                event = "TRUNCATION_DETECTED",
                stream,
                "Log shrank below stream offset ({} < {}), capturing remaining content",
                size,
                pos
            );
        }

        let segment = self.write(stream, mode, start, &content)?;
        if let Err(source) = self.ledger.set(stream, size) {
            // The unmoved ledger re-captures these bytes next cycle
            if let Err(e) = fs::remove_file(&segment.path) {
                tracing::warn!(
                    "Failed to remove segment {:?} after ledger error: {}",
                    segment.path,
                    e
                );
            }
            return Err(backup_failed(stream, source));
        }

        tracing::debug!(
            event = "INCREMENTAL_BACKUP_SUCCESS",
            stream,
            "Captured {} segment #{} ({}..{})",
            mode,
            segment.sequence,
            start,
            size
        );
        Ok(CaptureResult::Captured(segment))
    }

    /// Write a FULL segment of the current log without touching any ledger.
    ///
    /// A missing or empty log yields `NoOp`.
    pub fn snapshot(&self, stream: &str) -> Result<CaptureResult> {
        validate_stream(stream)?;

        let content = match self.read_log()? {
            Some(content) if !content.is_empty() => content,
            _ => return Ok(CaptureResult::NoOp),
        };

        let segment = self.write(stream, CaptureMode::Full, 0, &content)?;
        tracing::info!(
            event = "LOG_SNAPSHOT_CREATED",
            stream,
            "Snapshot of {} bytes written to {:?}",
            content.len(),
            segment.path
        );
        Ok(CaptureResult::Captured(segment))
    }

    /// Rewind every ledger that points past a log of `size` bytes, so those
    /// streams restart with a FULL capture instead of splicing onto content
    /// their history never held.
    pub fn reset_ledgers_beyond(&self, size: u64) -> Result<Vec<String>> {
        self.ledger
            .reset_beyond(size)
            .map_err(ProtectionError::io("reset ledgers in", &self.ctx.backup_dir))
    }

    fn read_log(&self) -> Result<Option<Vec<u8>>> {
        match fs::read(&self.ctx.log_path) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ProtectionError::Io {
                op: "read",
                path: self.ctx.log_path.clone(),
                source: e,
            }),
        }
    }

    fn write(
        &self,
        stream: &str,
        mode: CaptureMode,
        start: u64,
        content: &[u8],
    ) -> Result<CapturedSegment> {
        let header = SegmentHeader {
            captured_at: self.ctx.time.wall_clock(),
            stream: stream.to_string(),
            mode,
            start_offset: start,
            end_offset: content.len() as u64,
            project: self.ctx.project_name.clone(),
        };
        // `start` never exceeds the content length by construction of plan_capture
        let body = &content[start as usize..];

        let (sequence, path) = self
            .storage
            .write_segment(&header, body)
            .map_err(|source| backup_failed(stream, source))?;

        Ok(CapturedSegment {
            header,
            sequence,
            path,
        })
    }
}

fn backup_failed(stream: &str, source: io::Error) -> ProtectionError {
    tracing::warn!(
        event = "INCREMENTAL_BACKUP_FAILED",
        stream,
        "Backup write failed: {}",
        source
    );
    ProtectionError::BackupWriteFailed {
        stream: stream.to_string(),
        source,
    }
}
