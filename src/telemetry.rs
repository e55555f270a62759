use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::config::AppConfig;
use crate::errors::AppResult;

const JOURNAL_FILE: &str = "sync-events.jsonl";
const PREVIOUS_JOURNAL_FILE: &str = "sync-events.1.jsonl";

/// Events the sync engine journals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncEvent {
    PushMessageDropped,
    RealtimeClosed,
    BatchSubmitted,
    BatchSettled,
}

#[derive(Debug, Serialize)]
struct JournalEntry {
    event: SyncEvent,
    at: DateTime<Utc>,
    payload: serde_json::Value,
}

/// Append-only JSONL journal of sync events. Entries are held in memory
/// until a batch fills or `flush` is called; the live file keeps one
/// previous generation beside it.
#[derive(Clone)]
pub struct TelemetryClient {
    enabled: Arc<AtomicBool>,
    pending: Arc<Mutex<Vec<JournalEntry>>>,
    journal: Option<Arc<JournalFile>>,
    batch_size: usize,
}

struct JournalFile {
    live: PathBuf,
    previous: PathBuf,
    max_bytes: u64,
}

impl TelemetryClient {
    pub fn new<P: AsRef<Path>>(dir: P, config: &AppConfig) -> AppResult<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let journal = JournalFile {
            live: dir.join(JOURNAL_FILE),
            previous: dir.join(PREVIOUS_JOURNAL_FILE),
            max_bytes: config.telemetry_buffer_max_bytes,
        };
        journal.open()?;

        Ok(Self {
            enabled: Arc::new(AtomicBool::new(config.telemetry_enabled_by_default)),
            pending: Arc::new(Mutex::new(Vec::new())),
            journal: Some(Arc::new(journal)),
            batch_size: config.telemetry_batch_size.max(1),
        })
    }

    /// A journal with no backing file that drops everything.
    pub fn disabled() -> Self {
        Self {
            enabled: Arc::new(AtomicBool::new(false)),
            pending: Arc::new(Mutex::new(Vec::new())),
            journal: None,
            batch_size: 1,
        }
    }

    pub fn record(&self, event: SyncEvent, payload: serde_json::Value) -> AppResult<()> {
        if !self.is_enabled() {
            return Ok(());
        }

        let mut pending = self.pending.lock();
        pending.push(JournalEntry {
            event,
            at: Utc::now(),
            payload,
        });
        if pending.len() >= self.batch_size {
            self.write_pending(&mut pending)?;
        }
        Ok(())
    }

    pub fn flush(&self) -> AppResult<()> {
        let mut pending = self.pending.lock();
        self.write_pending(&mut pending)
    }

    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn journal_path(&self) -> Option<&Path> {
        self.journal.as_deref().map(|journal| journal.live.as_path())
    }

    pub fn is_enabled(&self) -> bool {
        self.journal.is_some() && self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    // Entries stay queued when the write fails so the next flush retries them.
    fn write_pending(&self, pending: &mut Vec<JournalEntry>) -> AppResult<()> {
        let Some(journal) = self.journal.as_deref() else {
            pending.clear();
            return Ok(());
        };
        if pending.is_empty() {
            return Ok(());
        }

        let mut lines = Vec::new();
        for entry in pending.iter() {
            serde_json::to_writer(&mut lines, entry)?;
            lines.push(b'\n');
        }
        journal.append(&lines)?;
        pending.clear();
        Ok(())
    }
}

impl JournalFile {
    fn open(&self) -> AppResult<File> {
        Ok(OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.live)?)
    }

    fn append(&self, lines: &[u8]) -> AppResult<()> {
        let size = fs::metadata(&self.live).map(|meta| meta.len()).unwrap_or(0);
        if size > 0 && size + lines.len() as u64 > self.max_bytes {
            fs::rename(&self.live, &self.previous)?;
        }

        let mut writer = BufWriter::new(self.open()?);
        writer.write_all(lines)?;
        writer.flush()?;
        Ok(())
    }
}
