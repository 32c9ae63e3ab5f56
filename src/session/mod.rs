/*!
 * Session store: durable checkpoints for resumable batches
 *
 * A session lives in two files under the session directory:
 *
 * - `<identity>.json`: the [`SessionHeader`], rewritten atomically (temp file
 *   plus rename) on every [`Session::save`]
 * - `<identity>.data`: the append-only task log (see [`log`])
 *
 * The identity is derived from the command and its arguments, so running the
 * same command again finds the same session.
 */

pub mod log;

pub use log::{LogRecord, TaskCursor};

use crate::options::CommandType;
use crate::task::TransferTask;
use chrono::{DateTime, Utc};
use log::TaskLog;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// On-disk format version
pub const SESSION_VERSION: u32 = 1;

const HEADER_EXTENSION: &str = "json";
const DATA_EXTENSION: &str = "data";
const TEMP_EXTENSION: &str = "json.tmp";

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("corrupt session file {path} (line {line}): {reason}")]
    Corrupt {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("session format version {found} is not supported (expected {expected})")]
    VersionMismatch { found: u32, expected: u32 },

    #[error("session {identity} not found")]
    NotFound { identity: String },

    #[error("failed to encode session data: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl SessionError {
    pub(crate) fn io(path: &Path, source: io::Error) -> Self {
        SessionError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Identity of a command invocation: 16 hex chars of SHA-256 over the command
/// type and every argument, NUL separated
pub fn session_identity(
    command: CommandType,
    args: &[String],
    bool_flags: &BTreeMap<String, bool>,
    string_flags: &BTreeMap<String, String>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(command.as_str().as_bytes());
    for arg in args {
        hasher.update([0u8]);
        hasher.update(arg.as_bytes());
    }
    for (name, _) in bool_flags.iter().filter(|(_, set)| **set) {
        hasher.update([0u8]);
        hasher.update(format!("--{}", name).as_bytes());
    }
    for (name, value) in string_flags {
        hasher.update([0u8]);
        hasher.update(format!("--{}={}", name, value).as_bytes());
    }
    let digest = hex::encode(hasher.finalize());
    digest[..16].to_string()
}

/// Persistent description of a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionHeader {
    pub version: u32,
    pub identity: String,
    pub created: DateTime<Utc>,
    pub working_dir: PathBuf,

    pub command_type: CommandType,
    /// Sources followed by the target
    pub command_args: Vec<String>,
    pub bool_flags: BTreeMap<String, bool>,
    pub string_flags: BTreeMap<String, String>,

    pub total_bytes: u64,
    pub total_objects: u64,
    /// Set once enumeration finished and the totals are final
    pub totals_written: bool,

    /// Target URL of the latest success in the completed prefix
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_completed: Option<String>,

    /// Sequence number that ends the completed prefix
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_through: Option<u64>,
}

/// Locates and manages sessions in one directory
#[derive(Debug, Clone)]
pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn header_path(&self, identity: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", identity, HEADER_EXTENSION))
    }

    fn data_path(&self, identity: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", identity, DATA_EXTENSION))
    }

    pub fn exists(&self, identity: &str) -> bool {
        self.header_path(identity).is_file()
    }

    /// Start a new session, replacing any previous one with the same identity
    pub fn create(
        &self,
        identity: &str,
        command_type: CommandType,
        command_args: Vec<String>,
        bool_flags: BTreeMap<String, bool>,
        string_flags: BTreeMap<String, String>,
    ) -> Result<Session, SessionError> {
        fs::create_dir_all(&self.dir).map_err(|e| SessionError::io(&self.dir, e))?;

        let header = SessionHeader {
            version: SESSION_VERSION,
            identity: identity.to_string(),
            created: Utc::now(),
            working_dir: std::env::current_dir().unwrap_or_default(),
            command_type,
            command_args,
            bool_flags,
            string_flags,
            total_bytes: 0,
            total_objects: 0,
            totals_written: false,
            last_completed: None,
            completed_through: None,
        };

        let data_path = self.data_path(identity);
        let log = TaskLog::create(&data_path, identity, SESSION_VERSION)?;
        let mut session = Session {
            header_path: self.header_path(identity),
            data_path,
            header,
            log: Some(log),
        };
        session.save()?;
        tracing::debug!("Created session {} in {}", identity, self.dir.display());
        Ok(session)
    }

    fn read_header(&self, path: &Path) -> Result<SessionHeader, SessionError> {
        let content = fs::read_to_string(path).map_err(|e| SessionError::io(path, e))?;
        let header: SessionHeader =
            serde_json::from_str(&content).map_err(|e| SessionError::Corrupt {
                path: path.to_path_buf(),
                line: e.line(),
                reason: e.to_string(),
            })?;
        if header.version != SESSION_VERSION {
            return Err(SessionError::VersionMismatch {
                found: header.version,
                expected: SESSION_VERSION,
            });
        }
        Ok(header)
    }

    /// Open an existing session
    pub fn load(&self, identity: &str) -> Result<Session, SessionError> {
        let header_path = self.header_path(identity);
        if !header_path.is_file() {
            return Err(SessionError::NotFound {
                identity: identity.to_string(),
            });
        }
        let header = self.read_header(&header_path)?;
        Ok(Session {
            header_path,
            data_path: self.data_path(identity),
            header,
            log: None,
        })
    }

    /// Headers of every readable session, oldest first
    pub fn list(&self) -> Result<Vec<SessionHeader>, SessionError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(SessionError::io(&self.dir, e)),
        };

        let mut headers = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| SessionError::io(&self.dir, e))?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(HEADER_EXTENSION) {
                continue;
            }
            match self.read_header(&path) {
                Ok(header) => headers.push(header),
                Err(e) => tracing::warn!("Skipping unreadable session {}: {}", path.display(), e),
            }
        }
        headers.sort_by(|a, b| a.created.cmp(&b.created).then_with(|| a.identity.cmp(&b.identity)));
        Ok(headers)
    }

    /// Remove one session
    pub fn clear(&self, identity: &str) -> Result<(), SessionError> {
        if !self.exists(identity) {
            return Err(SessionError::NotFound {
                identity: identity.to_string(),
            });
        }
        remove_session_files(&self.header_path(identity), &self.data_path(identity))
    }

    /// Remove every session, returning how many were removed
    pub fn clear_all(&self) -> Result<usize, SessionError> {
        let headers = self.list()?;
        for header in &headers {
            self.clear(&header.identity)?;
        }
        Ok(headers.len())
    }
}

fn remove_session_files(header_path: &Path, data_path: &Path) -> Result<(), SessionError> {
    for path in [data_path, header_path] {
        match fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(SessionError::io(path, e)),
        }
    }
    Ok(())
}

/// An open session
///
/// Only one owner writes to a session at a time: the enumerator while
/// building the log, then the result collector while the batch runs.
#[derive(Debug)]
pub struct Session {
    header_path: PathBuf,
    data_path: PathBuf,
    header: SessionHeader,
    log: Option<TaskLog>,
}

impl Session {
    pub fn header(&self) -> &SessionHeader {
        &self.header
    }

    pub fn identity(&self) -> &str {
        &self.header.identity
    }

    /// Append a task to the log, returning its sequence number
    pub fn append_task(&mut self, task: &TransferTask) -> Result<u64, SessionError> {
        match self.log.as_mut() {
            Some(log) => log.append(task),
            None => Err(SessionError::Corrupt {
                path: self.data_path.clone(),
                line: 0,
                reason: "task log is sealed".into(),
            }),
        }
    }

    /// Number of tasks appended so far in this process
    pub fn logged_tasks(&self) -> u64 {
        self.log.as_ref().map_or(0, TaskLog::count)
    }

    /// Record final totals and seal the log
    pub fn set_totals(&mut self, bytes: u64, objects: u64) -> Result<(), SessionError> {
        if let Some(log) = self.log.as_mut() {
            log.end()?;
        }
        self.header.total_bytes = bytes;
        self.header.total_objects = objects;
        self.header.totals_written = true;
        Ok(())
    }

    /// Move the resume marker
    pub fn set_last_completed(&mut self, target: Option<String>, through: u64) {
        if target.is_some() {
            self.header.last_completed = target;
        }
        self.header.completed_through = Some(through);
    }

    /// Flush the log and atomically rewrite the header
    pub fn save(&mut self) -> Result<(), SessionError> {
        if let Some(log) = self.log.as_mut() {
            log.sync()?;
        }
        let content = serde_json::to_vec_pretty(&self.header)?;
        write_header(&self.header_path, &content)
    }

    /// [`Session::save`] on the blocking pool
    pub async fn save_async(&mut self) -> Result<(), SessionError> {
        let content = serde_json::to_vec_pretty(&self.header)?;
        let header_path = self.header_path.clone();
        let mut log = self.log.take();
        let (log, result) = tokio::task::spawn_blocking(move || {
            let synced = match log.as_mut() {
                Some(log) => log.sync(),
                None => Ok(()),
            };
            let result = synced.and_then(|()| write_header(&header_path, &content));
            (log, result)
        })
        .await
        .map_err(|e| SessionError::io(&self.header_path, io::Error::other(e)))?;
        self.log = log;
        result
    }

    /// Forward-only reader over the logged tasks
    pub fn cursor(&mut self) -> Result<TaskCursor, SessionError> {
        if let Some(log) = self.log.as_mut() {
            log.sync()?;
        }
        TaskCursor::open(&self.data_path, &self.header.identity)
    }

    /// Remove the session from disk
    pub fn delete(self) -> Result<(), SessionError> {
        let Session {
            header_path,
            data_path,
            header,
            log,
        } = self;
        drop(log);
        remove_session_files(&header_path, &data_path)?;
        tracing::debug!("Deleted session {}", header.identity);
        Ok(())
    }
}

/// Replace `path` with `content` via a synced temp file and a rename
fn write_header(path: &Path, content: &[u8]) -> Result<(), SessionError> {
    let temp_path = path.with_extension(TEMP_EXTENSION);
    let mut file = fs::File::create(&temp_path).map_err(|e| SessionError::io(&temp_path, e))?;
    file.write_all(content)
        .map_err(|e| SessionError::io(&temp_path, e))?;
    file.sync_all()
        .map_err(|e| SessionError::io(&temp_path, e))?;
    fs::rename(&temp_path, path).map_err(|e| SessionError::io(path, e))
}
