//! Protection data types
//!
//! ## Segment format
//!
//! Every capture is stored as a markdown header followed by the raw log bytes:
//!
//! ```text
//! # Incremental Log Backup
//! ## Capture Info
//! - Captured At: 2024-01-01T00:00:00.000+00:00
//! - Stream: primary
//! - Mode: INCREMENTAL
//! - Start Offset: 5
//! - End Offset: 11
//! - Project: demo
//!
//! ---
//!
//! <body>
//! ```
//!
//! The body always covers `start_offset..end_offset` of the log at capture time.
//! FULL and TRUNCATION_DETECTED segments start at 0.

use chrono::{DateTime, SecondsFormat, Utc};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Separator between the segment header and its body
pub const SEGMENT_SEPARATOR: &[u8] = b"\n---\n\n";

const HEADER_TITLE: &str = "# Incremental Log Backup";
const HEADER_SECTION: &str = "## Capture Info";

/// How a segment relates to the previous capture of its stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CaptureMode {
    /// First capture of a stream: the whole log
    Full,
    /// Only the bytes appended since the last capture
    Incremental,
    /// The log shrank below the recorded offset: the whole remaining log
    TruncationDetected,
}

impl CaptureMode {
    /// Name used in segment headers
    pub fn as_str(&self) -> &'static str {
        match self {
            CaptureMode::Full => "FULL",
            CaptureMode::Incremental => "INCREMENTAL",
            CaptureMode::TruncationDetected => "TRUNCATION_DETECTED",
        }
    }

    /// Short tag used in segment file names
    pub fn file_tag(&self) -> &'static str {
        match self {
            CaptureMode::Full => "full",
            CaptureMode::Incremental => "incremental",
            CaptureMode::TruncationDetected => "truncation",
        }
    }

    pub fn from_file_tag(tag: &str) -> Option<Self> {
        match tag {
            "full" => Some(CaptureMode::Full),
            "incremental" => Some(CaptureMode::Incremental),
            "truncation" => Some(CaptureMode::TruncationDetected),
            _ => None,
        }
    }

    /// Whether a segment of this mode holds the whole log rather than a delta
    pub fn is_base(&self) -> bool {
        !matches!(self, CaptureMode::Incremental)
    }
}

impl fmt::Display for CaptureMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CaptureMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "FULL" => Ok(CaptureMode::Full),
            "INCREMENTAL" => Ok(CaptureMode::Incremental),
            "TRUNCATION_DETECTED" => Ok(CaptureMode::TruncationDetected),
            other => Err(format!("unknown capture mode '{other}'")),
        }
    }
}

/// Provenance header written in front of every segment body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentHeader {
    pub captured_at: DateTime<Utc>,
    pub stream: String,
    pub mode: CaptureMode,
    pub start_offset: u64,
    pub end_offset: u64,
    pub project: String,
}

impl SegmentHeader {
    /// Serialize the header including the trailing separator
    pub fn to_markdown(&self) -> String {
        format!(
            "{HEADER_TITLE}\n{HEADER_SECTION}\n\
             - Captured At: {}\n\
             - Stream: {}\n\
             - Mode: {}\n\
             - Start Offset: {}\n\
             - End Offset: {}\n\
             - Project: {}\n\
             \n---\n\n",
            self.captured_at
                .to_rfc3339_opts(SecondsFormat::Millis, false),
            self.stream,
            self.mode,
            self.start_offset,
            self.end_offset,
            self.project,
        )
    }

    /// Parse a complete segment file into its header and body.
    pub fn split_segment(bytes: &[u8]) -> Result<(SegmentHeader, &[u8]), String> {
        let separator_at = bytes
            .windows(SEGMENT_SEPARATOR.len())
            .position(|w| w == SEGMENT_SEPARATOR)
            .ok_or_else(|| "segment separator not found".to_string())?;
        let header_text = std::str::from_utf8(&bytes[..separator_at])
            .map_err(|_| "segment header is not valid UTF-8".to_string())?;
        let header = Self::parse_header(header_text)?;
        Ok((header, &bytes[separator_at + SEGMENT_SEPARATOR.len()..]))
    }

    fn parse_header(text: &str) -> Result<SegmentHeader, String> {
        let mut lines = text.lines();
        if lines.next() != Some(HEADER_TITLE) {
            return Err("missing segment title".to_string());
        }

        let mut captured_at = None;
        let mut stream = None;
        let mut mode = None;
        let mut start_offset = None;
        let mut end_offset = None;
        let mut project = None;

        for line in lines {
            let Some(field) = line.strip_prefix("- ") else {
                continue;
            };
            let Some((key, value)) = field.split_once(": ") else {
                continue;
            };
            match key {
                "Captured At" => {
                    captured_at = Some(
                        DateTime::parse_from_rfc3339(value)
                            .map_err(|e| format!("bad capture time: {e}"))?
                            .with_timezone(&Utc),
                    )
                }
                "Stream" => stream = Some(value.to_string()),
                "Mode" => mode = Some(value.parse::<CaptureMode>()?),
                "Start Offset" => {
                    start_offset = Some(
                        value
                            .parse::<u64>()
                            .map_err(|e| format!("bad start offset: {e}"))?,
                    )
                }
                "End Offset" => {
                    end_offset = Some(
                        value
                            .parse::<u64>()
                            .map_err(|e| format!("bad end offset: {e}"))?,
                    )
                }
                "Project" => project = Some(value.to_string()),
                _ => {}
            }
        }

        Ok(SegmentHeader {
            captured_at: captured_at.ok_or("missing capture time")?,
            stream: stream.ok_or("missing stream")?,
            mode: mode.ok_or("missing mode")?,
            start_offset: start_offset.ok_or("missing start offset")?,
            end_offset: end_offset.ok_or("missing end offset")?,
            project: project.ok_or("missing project")?,
        })
    }
}

/// A segment that was written by a capture
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedSegment {
    pub header: SegmentHeader,
    pub sequence: u64,
    pub path: PathBuf,
}

/// Outcome of a single capture call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureResult {
    /// No new bytes since the last capture; nothing written
    NoOp,
    Captured(CapturedSegment),
}

impl CaptureResult {
    pub fn mode(&self) -> Option<CaptureMode> {
        match self {
            CaptureResult::NoOp => None,
            CaptureResult::Captured(segment) => Some(segment.header.mode),
        }
    }

    pub fn segment(&self) -> Option<&CapturedSegment> {
        match self {
            CaptureResult::NoOp => None,
            CaptureResult::Captured(segment) => Some(segment),
        }
    }
}

/// Classification of one integrity check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrityStatus {
    Ok,
    /// The log disappeared after having content
    Missing { previous_size: u64 },
    /// The log became empty
    Cleared { previous_size: u64 },
    /// The log lost most of its content
    Truncated { previous_size: u64, current_size: u64 },
}

impl IntegrityStatus {
    pub fn is_damaged(&self) -> bool {
        !matches!(self, IntegrityStatus::Ok)
    }

    /// Diagnostic event name for this status
    pub fn event_name(&self) -> &'static str {
        match self {
            IntegrityStatus::Ok => "LOG_INTEGRITY_OK",
            IntegrityStatus::Missing { .. } => "LOG_FILE_MISSING",
            IntegrityStatus::Cleared { .. } => "LOG_FILE_CLEARED",
            IntegrityStatus::Truncated { .. } => "LOG_FILE_TRUNCATED",
        }
    }
}

/// Kind of log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// Text delivered into another application
    Injection,
    /// Free-form note written by the user
    Note,
    /// Text captured from the screen or another source
    Capture,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::Injection => "injection",
            EntryKind::Note => "note",
            EntryKind::Capture => "capture",
        }
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "injection" => Ok(EntryKind::Injection),
            "note" => Ok(EntryKind::Note),
            "capture" => Ok(EntryKind::Capture),
            other => Err(format!(
                "unknown entry kind '{other}' (expected injection, note or capture)"
            )),
        }
    }
}

/// One block to append to the log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub kind: EntryKind,
    /// Application or tool that produced the entry
    pub source: String,
    pub body: String,
}

impl Entry {
    pub fn injection(source: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            kind: EntryKind::Injection,
            source: source.into(),
            body: command.into(),
        }
    }

    pub fn note(body: impl Into<String>) -> Self {
        Self {
            kind: EntryKind::Note,
            source: "note".to_string(),
            body: body.into(),
        }
    }

    pub fn capture(source: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            kind: EntryKind::Capture,
            source: source.into(),
            body: text.into(),
        }
    }
}

/// Where a restore image came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoverySource {
    /// Image rebuilt from a stream's segments, ending at `terminal`
    Stream {
        stream: String,
        terminal: PathBuf,
        segments: usize,
    },
    /// Old-style whole-file snapshot
    Legacy { path: PathBuf },
}

/// Result of a successful recovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    pub source: RecoverySource,
    pub restored_size: u64,
    /// Snapshot of the damaged log taken before it was overwritten
    pub preserved: Option<PathBuf>,
}

/// What automatic recovery did about detected damage
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    Restored(RecoveryReport),
    /// Recovery failed; the log is left as found and accepted as the new baseline
    Failed { event: &'static str, reason: String },
}

/// Result of one verified append
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendReport {
    pub bytes_written: u64,
    pub log_size: u64,
    /// Recovery triggered by the pre-write check, if the log was damaged
    pub recovery: Option<RecoveryOutcome>,
    pub captures: Vec<(String, CaptureResult)>,
    /// Streams whose capture failed; retried on the next append or poll
    pub failed_streams: Vec<String>,
}

/// Result of a poll cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollReport {
    pub status: IntegrityStatus,
    pub recovery: Option<RecoveryOutcome>,
    /// Write-stream captures of an intact log; picks up external growth and retries
    pub captures: Vec<(String, CaptureResult)>,
    pub failed_streams: Vec<String>,
}

/// Classification of a file found in a backup directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupFileKind {
    Segment {
        stream: String,
        sequence: u64,
        mode: CaptureMode,
    },
    Latest {
        stream: String,
    },
    Legacy,
    Recovered,
    Other,
}

impl BackupFileKind {
    pub fn label(&self) -> String {
        match self {
            BackupFileKind::Segment { stream, mode, .. } => format!("segment {stream} {mode}"),
            BackupFileKind::Latest { stream } => format!("latest {stream}"),
            BackupFileKind::Legacy => "legacy snapshot".to_string(),
            BackupFileKind::Recovered => "recovered export".to_string(),
            BackupFileKind::Other => "other".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupFileInfo {
    pub path: PathBuf,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
    pub kind: BackupFileKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerInfo {
    pub stream: String,
    pub offset: u64,
    /// Latest-copy file of the stream, when present
    pub latest: Option<PathBuf>,
}

/// Snapshot of every backup artifact of a project
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub project: String,
    pub log_size: Option<u64>,
    /// Files in the project backup directory, newest first
    pub backups: Vec<BackupFileInfo>,
    pub ledgers: Vec<LedgerInfo>,
    /// Files of this project in the secondary directory, newest first
    pub secondary: Vec<BackupFileInfo>,
}

/// Files selected by legacy cleanup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupReport {
    pub candidates: Vec<(PathBuf, String)>,
    pub reclaimable_bytes: u64,
    /// Files actually removed (empty on a dry run)
    pub deleted: Vec<PathBuf>,
}
