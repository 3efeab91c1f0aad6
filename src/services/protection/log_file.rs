//! The protected markdown log and its entry format

use super::types::{Entry, EntryKind};
use chrono::{DateTime, Local, Utc};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Render `entry` as the markdown block appended to the log
pub fn format_entry(entry: &Entry, project: &str, at: DateTime<Utc>) -> String {
    let stamp = at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S");
    let title = format!(
        "\n# {} [{}] ({} - project: {})\n\n",
        stamp, entry.kind, entry.source, project
    );
    match entry.kind {
        EntryKind::Injection => format!(
            "{title}## Input\n\n{}\n\n## Output\n\nDelivered to {}\n",
            entry.body, entry.source
        ),
        EntryKind::Note | EntryKind::Capture => format!("{title}{}\n", entry.body),
    }
}

#[derive(Debug, Clone)]
pub struct LogFile {
    path: PathBuf,
}

impl LogFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append `text`, creating the file if needed; returns the bytes written
    pub fn append(&self, text: &str) -> io::Result<u64> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(text.as_bytes())?;
        file.sync_data()?;
        Ok(text.len() as u64)
    }

    /// Current size, `None` if the file does not exist
    pub fn size(&self) -> io::Result<Option<u64>> {
        match fs::metadata(&self.path) {
            Ok(metadata) => Ok(Some(metadata.len())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }
}
