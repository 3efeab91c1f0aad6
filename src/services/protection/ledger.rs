//! Per-stream position ledger
//!
//! Each stream remembers the log offset it last captured in
//! `backup_meta_<stream>.txt`, a single decimal integer.

use super::storage::atomic_write;
use std::fs;
use std::io;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct PositionLedger {
    dir: PathBuf,
}

impl PositionLedger {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path(&self, stream: &str) -> PathBuf {
        self.dir.join(format!("backup_meta_{stream}.txt"))
    }

    /// Last captured offset of `stream`; 0 when never captured.
    ///
    /// A side-car that cannot be read or parsed also reads as 0, which makes the
    /// next capture a FULL one.
    pub fn get(&self, stream: &str) -> u64 {
        let path = self.path(stream);
        match fs::read_to_string(&path) {
            Ok(text) => match text.trim().parse::<u64>() {
                Ok(offset) => offset,
                Err(e) => {
                    tracing::warn!(
                        event = "LEDGER_CORRUPTED",
                        "Ignoring unparseable ledger {:?}: {}",
                        path,
                        e
                    );
                    0
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
            Err(e) => {
                tracing::warn!(
                    event = "LEDGER_UNREADABLE",
                    "Failed to read ledger {:?}: {}",
                    path,
                    e
                );
                0
            }
        }
    }

    /// Persist `offset` for `stream` (temp file + rename)
    pub fn set(&self, stream: &str, offset: u64) -> io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        atomic_write(&self.path(stream), offset.to_string().as_bytes())
    }

    /// Every stream with a ledger side-car, sorted by name
    pub fn entries(&self) -> io::Result<Vec<(String, u64)>> {
        let read_dir = match fs::read_dir(&self.dir) {
            Ok(rd) => rd,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut entries = Vec::new();
        for entry in read_dir {
            let entry = entry?;
            let name = entry.file_name();
            let Some(stream) = name
                .to_str()
                .and_then(|n| n.strip_prefix("backup_meta_"))
                .and_then(|n| n.strip_suffix(".txt"))
            else {
                continue;
            };
            entries.push((stream.to_string(), self.get(stream)));
        }
        entries.sort();
        Ok(entries)
    }

    /// Set every offset greater than `size` back to 0; returns the affected streams
    pub fn reset_beyond(&self, size: u64) -> io::Result<Vec<String>> {
        let mut reset = Vec::new();
        for (stream, offset) in self.entries()? {
            if offset <= size {
                continue;
            }
            self.set(&stream, 0)?;
            tracing::info!(
                event = "LEDGER_RESET",
                stream = stream.as_str(),
                "Ledger offset {} is past the {} byte log, next capture is FULL",
                offset,
                size
            );
            reset.push(stream);
        }
        Ok(reset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_ledger_reads_zero() {
        let temp = TempDir::new().unwrap();
        let ledger = PositionLedger::new(temp.path().join("backups"));
        assert_eq!(ledger.get("primary"), 0);
    }

    #[test]
    fn test_set_then_get_survives_reopen() {
        let temp = TempDir::new().unwrap();
        PositionLedger::new(temp.path()).set("primary", 11).unwrap();

        let reopened = PositionLedger::new(temp.path());
        assert_eq!(reopened.get("primary"), 11);
        assert_eq!(
            fs::read_to_string(reopened.path("primary")).unwrap(),
            "11"
        );
    }

    #[test]
    fn test_streams_are_independent() {
        let temp = TempDir::new().unwrap();
        let ledger = PositionLedger::new(temp.path());
        ledger.set("primary", 5).unwrap();
        ledger.set("secondary", 11).unwrap();
        ledger.set("primary", 20).unwrap();

        assert_eq!(ledger.get("secondary"), 11);
        assert_eq!(
            ledger.entries().unwrap(),
            vec![("primary".to_string(), 20), ("secondary".to_string(), 11)]
        );
    }

    #[test]
    fn test_garbled_ledger_reads_zero() {
        let temp = TempDir::new().unwrap();
        let ledger = PositionLedger::new(temp.path());
        fs::write(ledger.path("primary"), "eleven").unwrap();
        assert_eq!(ledger.get("primary"), 0);
    }

    #[test]
    fn test_reset_beyond_only_touches_larger_offsets() {
        let temp = TempDir::new().unwrap();
        let ledger = PositionLedger::new(temp.path());
        ledger.set("primary", 40).unwrap();
        ledger.set("startup", 6).unwrap();
        ledger.set("secondary", 11).unwrap();

        assert_eq!(ledger.reset_beyond(11).unwrap(), vec!["primary".to_string()]);
        assert_eq!(ledger.get("primary"), 0);
        assert_eq!(ledger.get("secondary"), 11);
        assert_eq!(ledger.get("startup"), 6);
    }

    #[test]
    fn test_tolerates_trailing_newline() {
        let temp = TempDir::new().unwrap();
        let ledger = PositionLedger::new(temp.path());
        fs::write(ledger.path("primary"), "42\n").unwrap();
        assert_eq!(ledger.get("primary"), 42);
    }
}
