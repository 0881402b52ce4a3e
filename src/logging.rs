use crate::status::{EngineStatus, StatusSink, SyncPhase};
use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::fmt;
use std::fs::{self, File};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Severity levels accepted by the journal and the `log.level` setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Returns the canonical uppercase representation.
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }

    /// Directive understood by `tracing_subscriber::EnvFilter`.
    pub fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = LoggingError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            _ => Err(LoggingError::UnknownLevel(value.to_string())),
        }
    }
}

/// Retention of the status journal: at most `files` files of `file_bytes`
/// each, 16 MiB x 4 by default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalLimits {
    pub file_bytes: usize,
    pub files: usize,
}

impl Default for JournalLimits {
    fn default() -> Self {
        Self {
            file_bytes: 16 << 20,
            files: 4,
        }
    }
}

impl JournalLimits {
    /// Bytes kept in memory, newline included, before the oldest record is evicted.
    pub fn retained_bytes(&self) -> usize {
        self.file_bytes.saturating_mul(self.files.max(1))
    }
}

/// In-memory JSON-line journal of status records.
///
/// Records are kept newest-last within [`JournalLimits::retained_bytes`];
/// older ones are evicted as new ones arrive. The newest record is always
/// kept, even when it alone exceeds the budget. [`write_to`](Self::write_to)
/// lays the retained records out as numbered files (`journal.log`,
/// `journal.log.1`, ...) with the newest records in the unnumbered file.
#[derive(Debug, Clone)]
pub struct StatusJournal {
    limits: JournalLimits,
    level: LogLevel,
    records: VecDeque<String>,
    retained: usize,
    evicted: u64,
}

impl StatusJournal {
    pub fn new(limits: JournalLimits) -> Self {
        Self {
            limits,
            level: LogLevel::Info,
            records: VecDeque::new(),
            retained: 0,
            evicted: 0,
        }
    }

    pub fn level(&self) -> LogLevel {
        self.level
    }

    pub fn set_level(&mut self, level: LogLevel) {
        self.level = level;
    }

    /// Appends one record; records below the journal level are dropped.
    pub fn record(
        &mut self,
        ts_ms: u64,
        level: LogLevel,
        target: &str,
        message: &str,
        fields: &Value,
    ) -> Result<(), LoggingError> {
        if level < self.level {
            return Ok(());
        }
        let line = serde_json::to_string(&JournalRecord {
            ts: ts_ms,
            level: level.as_str(),
            target,
            message,
            fields,
        })?;
        self.retained += line.len() + 1;
        self.records.push_back(line);
        while self.retained > self.limits.retained_bytes() && self.records.len() > 1 {
            if let Some(oldest) = self.records.pop_front() {
                self.retained -= oldest.len() + 1;
                self.evicted += 1;
            }
        }
        Ok(())
    }

    /// Retained records, oldest first.
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.records.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records dropped to stay within the retention budget.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    /// Writes the retained records to `path` and its numbered siblings,
    /// returning how many files were written.
    ///
    /// Numbered files left over from a longer earlier journal are removed.
    pub fn write_to(&self, path: &Path) -> Result<usize, LoggingError> {
        let chunks = self.file_chunks();
        for (index, chunk) in chunks.iter().enumerate() {
            let mut writer = BufWriter::new(File::create(rotated_path(path, index))?);
            for line in chunk.iter().rev() {
                writeln!(writer, "{line}")?;
            }
            writer.flush()?;
        }
        for index in chunks.len()..self.limits.files {
            match fs::remove_file(rotated_path(path, index)) {
                Err(err) if err.kind() != ErrorKind::NotFound => return Err(err.into()),
                _ => {}
            }
        }
        Ok(chunks.len())
    }

    /// Groups records newest first into files of at most `file_bytes`.
    fn file_chunks(&self) -> Vec<Vec<&str>> {
        let mut chunks: Vec<Vec<&str>> = vec![Vec::new()];
        let mut bytes = 0;
        for line in self.records.iter().rev() {
            let size = line.len() + 1;
            let full = chunks.last().is_some_and(|chunk| !chunk.is_empty())
                && bytes + size > self.limits.file_bytes;
            if full {
                if chunks.len() == self.limits.files.max(1) {
                    break;
                }
                chunks.push(Vec::new());
                bytes = 0;
            }
            bytes += size;
            if let Some(chunk) = chunks.last_mut() {
                chunk.push(line);
            }
        }
        chunks
    }
}

fn rotated_path(path: &Path, index: usize) -> PathBuf {
    if index == 0 {
        return path.to_path_buf();
    }
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".{index}"));
    PathBuf::from(name)
}

const STATUS_TARGET: &str = "release_sync::status";

/// Status sink journaling every snapshot as a JSON line.
///
/// Progress snapshots are logged at `DEBUG`, phase changes at `INFO`, and
/// failed or cancelled syncs at `WARN`.
#[derive(Debug)]
pub struct JournalStatusSink {
    journal: Mutex<StatusJournal>,
    last_phase: Mutex<Option<SyncPhase>>,
}

impl JournalStatusSink {
    pub fn new(journal: StatusJournal) -> Self {
        Self {
            journal: Mutex::new(journal),
            last_phase: Mutex::new(None),
        }
    }

    /// Returns a copy of the journal as recorded so far.
    pub fn snapshot(&self) -> StatusJournal {
        self.journal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn write_to(&self, path: &Path) -> Result<usize, LoggingError> {
        self.journal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .write_to(path)
    }
}

impl StatusSink for JournalStatusSink {
    fn report(&self, status: &EngineStatus) {
        let phase_changed = {
            let mut last = self
                .last_phase
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let changed = *last != Some(status.phase);
            *last = Some(status.phase);
            changed
        };
        let level = match status.phase {
            SyncPhase::Failed | SyncPhase::Cancelled => LogLevel::Warn,
            _ if phase_changed => LogLevel::Info,
            _ => LogLevel::Debug,
        };
        let fields = serde_json::to_value(status).unwrap_or(Value::Null);
        let mut journal = self.journal.lock().unwrap_or_else(PoisonError::into_inner);
        let recorded = journal.record(now_ms(), level, STATUS_TARGET, "sync status", &fields);
        if let Err(err) = recorded {
            tracing::warn!(error = %err, "failed to journal sync status");
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis().min(u128::from(u64::MAX)) as u64)
        .unwrap_or(0)
}

/// Errors surfaced by the journal.
#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("failed to serialize journal record: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("failed to write journal: {0}")]
    Io(#[from] std::io::Error),
    #[error("unknown log level {0:?}")]
    UnknownLevel(String),
}

#[derive(Debug, Serialize)]
struct JournalRecord<'a> {
    ts: u64,
    level: &'a str,
    target: &'a str,
    message: &'a str,
    fields: &'a Value,
}
