// ABOUTME: Append-only JSONL log files holding the authoritative exchange records.
// ABOUTME: Provides durable single-line append, id lookup, and a tolerant line scanner for rebuilds.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use parley_core::record::DERIVED_ID_PREFIX;
use parley_core::{LineOrigin, LogRecord, RecordRef};
use thiserror::Error;

/// Errors that can occur during log file operations.
#[derive(Debug, Error)]
pub enum LogError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("record error: {0}")]
    Record(#[from] parley_core::RecordError),
}

/// An append-only JSONL file. Each line is one self-describing record.
pub struct AppendLog {
    file: File,
}

impl AppendLog {
    /// Open (or create) a log file in append mode, creating parent directories.
    pub fn open(path: &Path) -> Result<Self, LogError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;

        Ok(Self { file })
    }

    /// Append one record as a single line and flush it to disk. The line and
    /// its newline go out in one write so a reader never sees half a record.
    pub fn append(&mut self, record: &RecordRef<'_>) -> Result<(), LogError> {
        let mut line = record.to_line()?;
        line.push('\n');
        self.file.write_all(line.as_bytes())?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Scan a log file for the record with the given id. Lines without an id
    /// answer to the id derived from their position, the same one rebuild
    /// indexes them under. Lines that fail to parse are logged and skipped.
    /// Returns the first match.
    pub fn find(path: &Path, id: &str) -> Result<Option<LogRecord>, LogError> {
        let derived = id.starts_with(DERIVED_ID_PREFIX);
        let mut found = None;
        Self::scan(path, |line_no, line| {
            // Cheap pre-filter before a full parse.
            if !derived && !line.contains(id) {
                return true;
            }
            match LogRecord::parse_at(line, &LineOrigin::new(path, line_no)) {
                Ok(record) if record.id() == id => {
                    found = Some(record);
                    false
                }
                Ok(_) => true,
                Err(e) => {
                    tracing::warn!(
                        file = %path.display(),
                        line = line_no,
                        error = %e,
                        "skipping unparseable log line"
                    );
                    true
                }
            }
        })?;
        Ok(found)
    }

    /// Visit every non-empty line with its 1-based line number until the
    /// visitor returns `false`. Invalid UTF-8 is replaced rather than aborting
    /// the scan. Returns the number of lines visited.
    pub fn scan(path: &Path, mut visit: impl FnMut(usize, &str) -> bool) -> Result<usize, LogError> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        let mut buf = Vec::new();
        let mut line_no = 0;
        let mut visited = 0;

        loop {
            buf.clear();
            let read = reader.read_until(b'\n', &mut buf)?;
            if read == 0 {
                break;
            }
            line_no += 1;

            let text = String::from_utf8_lossy(&buf);
            let line = text.trim();
            if line.is_empty() {
                continue;
            }
            visited += 1;
            if !visit(line_no, line) {
                break;
            }
        }

        Ok(visited)
    }
}
