//! Write verification around every log append
//!
//! `before_write` runs the integrity check (recovering first if the log is
//! damaged) and records the size; `after_write` confirms the append did not
//! shrink the log and only then captures the write streams.

use super::backup::IncrementalBackupWriter;
use super::context::LogProtectionContext;
use super::error::{ProtectionError, Result};
use super::integrity::IntegrityMonitor;
use super::recovery::RecoveryCoordinator;
use super::types::{CaptureResult, IntegrityStatus, RecoveryOutcome};
use std::sync::Arc;

/// State recorded by `before_write`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteAttempt {
    pub op: String,
    pub size_before: u64,
    pub recovery: Option<RecoveryOutcome>,
}

/// Captures made after a verified write
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamCaptures {
    pub size_after: u64,
    pub captures: Vec<(String, CaptureResult)>,
    pub failed_streams: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct WriteVerifier {
    ctx: Arc<LogProtectionContext>,
    writer: IncrementalBackupWriter,
    coordinator: RecoveryCoordinator,
}

impl WriteVerifier {
    pub fn new(
        ctx: Arc<LogProtectionContext>,
        writer: IncrementalBackupWriter,
        coordinator: RecoveryCoordinator,
    ) -> Self {
        Self {
            ctx,
            writer,
            coordinator,
        }
    }

    pub fn before_write(&self, monitor: &mut IntegrityMonitor, op: &str) -> Result<WriteAttempt> {
        let status = monitor
            .check()
            .map_err(ProtectionError::io("inspect", &self.ctx.log_path))?;
        let recovery = if status.is_damaged() {
            Some(self.handle_damage(monitor, status)?)
        } else {
            None
        };

        let size_before = monitor
            .measure()
            .map_err(ProtectionError::io("inspect", &self.ctx.log_path))?
            .unwrap_or(0);

        tracing::debug!(
            event = "LOG_WRITE_ATTEMPT",
            op,
            size_before,
            "Preparing {} write",
            op
        );
        Ok(WriteAttempt {
            op: op.to_string(),
            size_before,
            recovery,
        })
    }

    pub fn after_write(
        &self,
        monitor: &mut IntegrityMonitor,
        attempt: &WriteAttempt,
        expect_append: bool,
    ) -> Result<StreamCaptures> {
        let size_after = monitor
            .measure()
            .map_err(ProtectionError::io("inspect", &self.ctx.log_path))?
            .unwrap_or(0);

        if expect_append && size_after < attempt.size_before {
            tracing::warn!(
                event = "LOG_WRITE_VERIFICATION_FAILED",
                op = attempt.op.as_str(),
                "Log shrank during {} write: {} -> {} bytes",
                attempt.op,
                attempt.size_before,
                size_after
            );
            return Err(ProtectionError::WriteVerificationFailed {
                path: self.ctx.log_path.clone(),
                size_before: attempt.size_before,
                size_after,
            });
        }

        monitor.resync(size_after);
        tracing::debug!(
            event = "LOG_WRITE_SUCCESS",
            op = attempt.op.as_str(),
            "Verified {} write: {} -> {} bytes",
            attempt.op,
            attempt.size_before,
            size_after
        );

        let mut result = self.capture_write_streams();
        result.size_after = size_after;
        Ok(result)
    }

    /// Capture every configured write stream; failures are logged, not returned
    pub fn capture_write_streams(&self) -> StreamCaptures {
        let mut result = StreamCaptures::default();
        for stream in &self.ctx.config.write_streams {
            match self.writer.capture(stream) {
                Ok(capture) => result.captures.push((stream.clone(), capture)),
                Err(e) => {
                    tracing::warn!("Capture of stream {} failed, will retry: {}", stream, e);
                    result.failed_streams.push(stream.clone());
                }
            }
        }
        result
    }

    /// Run recovery for detected damage and move the baseline to whatever the
    /// log holds afterwards.
    ///
    /// A failed recovery is reported in the outcome; the log as found becomes the
    /// new baseline so later appends keep extending it, and ledgers past it are
    /// rewound.
    pub fn handle_damage(
        &self,
        monitor: &mut IntegrityMonitor,
        status: IntegrityStatus,
    ) -> Result<RecoveryOutcome> {
        match self.coordinator.recover() {
            Ok(report) => {
                monitor.resync(report.restored_size);
                Ok(RecoveryOutcome::Restored(report))
            }
            Err(e) => {
                tracing::error!(
                    event = e.event_name(),
                    trigger = status.event_name(),
                    "Automatic recovery failed: {}",
                    e
                );
                let size = monitor
                    .resync_from_disk()
                    .map_err(ProtectionError::io("inspect", &self.ctx.log_path))?;
                self.writer.reset_ledgers_beyond(size)?;
                Ok(RecoveryOutcome::Failed {
                    event: e.event_name(),
                    reason: e.to_string(),
                })
            }
        }
    }
}
