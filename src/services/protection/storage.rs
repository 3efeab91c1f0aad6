//! Backup file storage
//!
//! Owns the on-disk layout of a project's backups:
//! - `<stream-dir>/<project>-log-incremental-<stream>-<seq>-<mode>.md` - one file per capture
//! - `<stream-dir>/<project>-log-incremental-<stream>.md` - copy of the latest capture
//! - `<backups>/<project>-log-bak-*.md`, `<backups>/my-log-backup-*.md` - legacy snapshots
//! - `<backups>/<project>-log-recovered-<timestamp>.md` - reconstruction exports
//!
//! Every file is written through `atomic_write`, so a crash never leaves a
//! half-written segment behind under its final name.

use super::context::LogProtectionContext;
use super::types::{BackupFileInfo, BackupFileKind, CaptureMode, SegmentHeader};
use chrono::{DateTime, Utc};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Write `content` to a temp file next to `target`, then rename it into place
pub fn atomic_write(target: &Path, content: &[u8]) -> io::Result<()> {
    let file_name = target
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "target has no file name"))?;
    let mut temp_name = file_name.to_os_string();
    temp_name.push(".tmp");
    let temp_path = target.with_file_name(temp_name);

    let mut file = File::create(&temp_path)?;
    file.write_all(content)?;
    file.sync_all()?;
    drop(file);

    if let Err(e) = fs::rename(&temp_path, target) {
        let _ = fs::remove_file(&temp_path);
        return Err(e);
    }
    Ok(())
}

/// A segment file located on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentFile {
    pub path: PathBuf,
    pub sequence: u64,
    pub mode: CaptureMode,
}

/// A segment read back from disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub header: SegmentHeader,
    pub body: Vec<u8>,
}

impl Segment {
    /// Whether the body length agrees with the recorded offsets
    pub fn is_consistent(&self) -> bool {
        self.header.start_offset <= self.header.end_offset
            && self.header.end_offset - self.header.start_offset == self.body.len() as u64
    }
}

#[derive(Debug, Clone)]
pub struct BackupStorage {
    ctx: Arc<LogProtectionContext>,
}

impl BackupStorage {
    pub fn new(ctx: Arc<LogProtectionContext>) -> Self {
        Self { ctx }
    }

    /// Ensure the project backup directory and every external stream directory exist
    pub fn ensure_dirs(&self) -> io::Result<()> {
        fs::create_dir_all(&self.ctx.backup_dir)?;
        if !self.ctx.config.external_streams.is_empty() {
            fs::create_dir_all(&self.ctx.external_root)?;
        }
        Ok(())
    }

    pub fn segment_path(&self, stream: &str, sequence: u64, mode: CaptureMode) -> PathBuf {
        self.ctx.stream_dir(stream).join(format!(
            "{}-{:06}-{}.md",
            self.ctx.stream_prefix(stream),
            sequence,
            mode.file_tag()
        ))
    }

    pub fn latest_path(&self, stream: &str) -> PathBuf {
        self.ctx
            .stream_dir(stream)
            .join(format!("{}.md", self.ctx.stream_prefix(stream)))
    }

    // ========================================================================
    // Segments
    // ========================================================================

    /// All segments of `stream` in capture order
    pub fn list_segments(&self, stream: &str) -> io::Result<Vec<SegmentFile>> {
        let dir = self.ctx.stream_dir(stream);
        let prefix = format!("{}-", self.ctx.stream_prefix(stream));

        let read_dir = match fs::read_dir(dir) {
            Ok(rd) => rd,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut segments = Vec::new();
        for entry in read_dir {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let Some(rest) = name.strip_prefix(&prefix) else {
                continue;
            };
            if let Some((sequence, mode)) = parse_sequence_and_mode(rest) {
                segments.push(SegmentFile {
                    path: entry.path(),
                    sequence,
                    mode,
                });
            }
        }

        segments.sort_by_key(|s| s.sequence);
        Ok(segments)
    }

    pub fn next_sequence(&self, stream: &str) -> io::Result<u64> {
        Ok(self
            .list_segments(stream)?
            .last()
            .map(|s| s.sequence + 1)
            .unwrap_or(1))
    }

    pub fn read_segment(&self, path: &Path) -> io::Result<Segment> {
        let bytes = fs::read(path)?;
        let (header, body) = SegmentHeader::split_segment(&bytes)
            .map_err(|msg| io::Error::new(io::ErrorKind::InvalidData, msg))?;
        Ok(Segment {
            header,
            body: body.to_vec(),
        })
    }

    /// Write a new segment file and refresh the stream's latest copy.
    ///
    /// Returns the sequence number and path of the new segment.
    pub fn write_segment(&self, header: &SegmentHeader, body: &[u8]) -> io::Result<(u64, PathBuf)> {
        fs::create_dir_all(self.ctx.stream_dir(&header.stream))?;

        let sequence = self.next_sequence(&header.stream)?;
        let path = self.segment_path(&header.stream, sequence, header.mode);

        let mut bytes = header.to_markdown().into_bytes();
        bytes.extend_from_slice(body);

        atomic_write(&path, &bytes)?;
        atomic_write(&self.latest_path(&header.stream), &bytes)?;
        Ok((sequence, path))
    }

    // ========================================================================
    // Legacy snapshots and exports
    // ========================================================================

    fn is_legacy_name(&self, name: &str) -> bool {
        name.ends_with(".md")
            && (name.starts_with(&format!("{}-log-bak-", self.ctx.project_name))
                || name.starts_with("my-log-backup-"))
    }

    /// Legacy whole-file snapshots in the backup directory, newest first
    pub fn legacy_snapshots(&self) -> io::Result<Vec<PathBuf>> {
        let mut found: Vec<(PathBuf, std::time::SystemTime)> = Vec::new();
        for info in self.describe_dir(&self.ctx.backup_dir)? {
            if info.kind == BackupFileKind::Legacy {
                let modified = fs::metadata(&info.path)?.modified()?;
                found.push((info.path, modified));
            }
        }
        found.sort_by(|a, b| b.1.cmp(&a.1));
        Ok(found.into_iter().map(|(path, _)| path).collect())
    }

    /// Write a reconstruction export and return its path
    pub fn write_recovered(&self, content: &[u8]) -> io::Result<PathBuf> {
        fs::create_dir_all(&self.ctx.backup_dir)?;
        let stamp = self.ctx.time.wall_clock().format("%Y%m%d_%H%M%S").to_string();
        let base = format!("{}-log-recovered-{}", self.ctx.project_name, stamp);

        let mut path = self.ctx.backup_dir.join(format!("{base}.md"));
        let mut counter = 2;
        while path.exists() {
            path = self.ctx.backup_dir.join(format!("{base}-{counter}.md"));
            counter += 1;
        }

        atomic_write(&path, content)?;
        Ok(path)
    }

    // ========================================================================
    // Inventory
    // ========================================================================

    /// Classify a file name found in one of this project's backup directories
    pub fn classify(&self, name: &str) -> BackupFileKind {
        let project = &self.ctx.project_name;
        if let Some(middle) = name
            .strip_prefix(&format!("{project}-log-incremental-"))
            .and_then(|rest| rest.strip_suffix(".md"))
        {
            // <stream>-<seq>-<mode> or just <stream> for the latest copy
            let mut parts = middle.rsplitn(3, '-');
            let tag = parts.next();
            let seq = parts.next();
            let stream = parts.next();
            if let (Some(tag), Some(seq), Some(stream)) = (tag, seq, stream) {
                if let (Some(mode), Some(sequence)) =
                    (CaptureMode::from_file_tag(tag), parse_digits(seq))
                {
                    return BackupFileKind::Segment {
                        stream: stream.to_string(),
                        sequence,
                        mode,
                    };
                }
            }
            return BackupFileKind::Latest {
                stream: middle.to_string(),
            };
        }
        if self.is_legacy_name(name) {
            return BackupFileKind::Legacy;
        }
        if name.starts_with(&format!("{project}-log-recovered-")) && name.ends_with(".md") {
            return BackupFileKind::Recovered;
        }
        BackupFileKind::Other
    }

    /// Describe the files of `dir`, newest first. A missing directory is empty.
    pub fn describe_dir(&self, dir: &Path) -> io::Result<Vec<BackupFileInfo>> {
        let read_dir = match fs::read_dir(dir) {
            Ok(rd) => rd,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut files = Vec::new();
        for entry in read_dir {
            let entry = entry?;
            let metadata = entry.metadata()?;
            if !metadata.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(".tmp") {
                continue;
            }
            files.push(BackupFileInfo {
                kind: self.classify(&name),
                path: entry.path(),
                size: metadata.len(),
                modified: metadata.modified().ok().map(DateTime::<Utc>::from),
            });
        }

        files.sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| a.path.cmp(&b.path)));
        Ok(files)
    }
}

fn parse_digits(s: &str) -> Option<u64> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

/// Parse the `<seq>-<mode>.md` tail of a segment file name
fn parse_sequence_and_mode(rest: &str) -> Option<(u64, CaptureMode)> {
    let rest = rest.strip_suffix(".md")?;
    let (seq, tag) = rest.split_once('-')?;
    Some((parse_digits(seq)?, CaptureMode::from_file_tag(tag)?))
}
