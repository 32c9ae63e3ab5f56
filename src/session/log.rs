//! Append-only task log
//!
//! One JSON record per line, tagged by `kind`:
//!
//! ```text
//! {"kind":"begin","identity":"3f2a...","version":1}
//! {"kind":"task","seq":0,"task":{...}}
//! {"kind":"task","seq":1,"task":{...}}
//! {"kind":"end","count":2}
//! ```
//!
//! The log is written by a single writer during enumeration and read back
//! with a forward-only [`TaskCursor`]. A log without its `end` record was
//! never finished and cannot be replayed.

use super::SessionError;
use crate::task::TransferTask;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Lines, Write};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;

/// Entries the cursor stream reads ahead of its consumer
const READ_AHEAD: usize = 64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum LogRecord {
    Begin { identity: String, version: u32 },
    Task { seq: u64, task: TransferTask },
    End { count: u64 },
}

/// Writer half of the log
#[derive(Debug)]
pub(crate) struct TaskLog {
    path: PathBuf,
    writer: BufWriter<File>,
    count: u64,
    ended: bool,
    dirty: bool,
}

impl TaskLog {
    /// Start a fresh log, replacing any previous content
    pub(crate) fn create(path: &Path, identity: &str, version: u32) -> Result<Self, SessionError> {
        let file = File::create(path).map_err(|e| SessionError::io(path, e))?;
        let mut log = Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
            count: 0,
            ended: false,
            dirty: false,
        };
        log.write(&LogRecord::Begin {
            identity: identity.to_string(),
            version,
        })?;
        Ok(log)
    }

    fn write(&mut self, record: &LogRecord) -> Result<(), SessionError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        self.writer
            .write_all(&line)
            .map_err(|e| SessionError::io(&self.path, e))?;
        self.dirty = true;
        Ok(())
    }

    /// Append a task and return its sequence number
    pub(crate) fn append(&mut self, task: &TransferTask) -> Result<u64, SessionError> {
        if self.ended {
            return Err(SessionError::Corrupt {
                path: self.path.clone(),
                line: 0,
                reason: "task appended after end record".into(),
            });
        }
        let seq = self.count;
        self.write(&LogRecord::Task {
            seq,
            task: task.clone(),
        })?;
        self.count += 1;
        Ok(seq)
    }

    /// Seal the log; no tasks can follow
    pub(crate) fn end(&mut self) -> Result<(), SessionError> {
        if !self.ended {
            self.write(&LogRecord::End { count: self.count })?;
            self.ended = true;
        }
        Ok(())
    }

    pub(crate) fn count(&self) -> u64 {
        self.count
    }

    /// Flush and fsync pending records
    pub(crate) fn sync(&mut self) -> Result<(), SessionError> {
        if !self.dirty {
            return Ok(());
        }
        self.writer
            .flush()
            .map_err(|e| SessionError::io(&self.path, e))?;
        self.writer
            .get_ref()
            .sync_all()
            .map_err(|e| SessionError::io(&self.path, e))?;
        self.dirty = false;
        Ok(())
    }
}

/// Forward-only reader yielding `(seq, task)` pairs
///
/// Any malformed line, out-of-order sequence number or a log that stops
/// before its `end` record is reported as [`SessionError::Corrupt`], after
/// which the cursor yields nothing more.
pub struct TaskCursor {
    path: PathBuf,
    lines: Lines<BufReader<File>>,
    identity: String,
    line: usize,
    started: bool,
    next_seq: u64,
    done: bool,
}

impl TaskCursor {
    pub(crate) fn open(path: &Path, identity: &str) -> Result<Self, SessionError> {
        let file = File::open(path).map_err(|e| SessionError::io(path, e))?;
        Ok(Self {
            path: path.to_path_buf(),
            lines: BufReader::new(file).lines(),
            identity: identity.to_string(),
            line: 0,
            started: false,
            next_seq: 0,
            done: false,
        })
    }

    /// Read the log on the blocking pool and yield its entries as a stream
    ///
    /// Must be called within a tokio runtime. Reading stops once the stream
    /// is dropped.
    pub fn into_stream(
        self,
    ) -> impl Stream<Item = Result<(u64, TransferTask), SessionError>> + Send + 'static {
        let (tx, rx) = mpsc::channel(READ_AHEAD);
        tokio::task::spawn_blocking(move || {
            for entry in self {
                if tx.blocking_send(entry).is_err() {
                    break;
                }
            }
        });
        futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|entry| (entry, rx))
        })
    }

    fn corrupt(&mut self, reason: impl Into<String>) -> SessionError {
        self.done = true;
        SessionError::Corrupt {
            path: self.path.clone(),
            line: self.line,
            reason: reason.into(),
        }
    }

    fn read_record(&mut self) -> Option<Result<LogRecord, SessionError>> {
        loop {
            let line = match self.lines.next() {
                Some(Ok(line)) => line,
                Some(Err(e)) => {
                    self.done = true;
                    return Some(Err(SessionError::io(&self.path, e)));
                }
                None => return None,
            };
            self.line += 1;
            if line.trim().is_empty() {
                continue;
            }
            return Some(serde_json::from_str(&line).map_err(|e| self.corrupt(e.to_string())));
        }
    }
}

impl Iterator for TaskCursor {
    type Item = Result<(u64, TransferTask), SessionError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let record = match self.read_record() {
            Some(Ok(record)) => record,
            Some(Err(e)) => return Some(Err(e)),
            None => return Some(Err(self.corrupt("log ends without an end record"))),
        };

        if !self.started {
            self.started = true;
            return match record {
                LogRecord::Begin { identity, .. } if identity == self.identity => self.next(),
                LogRecord::Begin { identity, .. } => Some(Err(self.corrupt(format!(
                    "log belongs to session {}",
                    identity
                )))),
                _ => Some(Err(self.corrupt("log does not start with a begin record"))),
            };
        }

        match record {
            LogRecord::Task { seq, task } if seq == self.next_seq => {
                self.next_seq += 1;
                Some(Ok((seq, task)))
            }
            LogRecord::Task { seq, .. } => Some(Err(self.corrupt(format!(
                "expected task {}, found {}",
                self.next_seq, seq
            )))),
            LogRecord::End { count } if count == self.next_seq => {
                self.done = true;
                None
            }
            LogRecord::End { count } => Some(Err(self.corrupt(format!(
                "end record counts {} tasks, log has {}",
                count, self.next_seq
            )))),
            LogRecord::Begin { .. } => Some(Err(self.corrupt("unexpected begin record"))),
        }
    }
}
