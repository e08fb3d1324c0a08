//! Session ledger file read/write operations
//!
//! The ledger is a single JSON file holding every finished session in the
//! order it was recorded. Each append rewrites the whole file: the new
//! contents go to a temporary file next to it, which then replaces the old
//! file in one rename.

use super::schema::RecordingSession;
use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Ledger-related errors
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Failed to replace ledger file: {0}")]
    Persist(#[from] tempfile::PersistError),

    #[error("Session {0} is already in the ledger")]
    DuplicateId(String),
}

pub type LedgerResult<T> = Result<T, LedgerError>;

/// Read every session from a ledger file; a missing file is an empty ledger.
///
/// Records written without an id get a fresh one. Two records sharing an
/// id make the file invalid.
pub fn load_all(path: &Path) -> LedgerResult<Vec<RecordingSession>> {
    Ok(load_keyed(path)?.0)
}

/// Like `load_all`, also counting the ids that had to be assigned
fn load_keyed(path: &Path) -> LedgerResult<(Vec<RecordingSession>, usize)> {
    if !path.exists() {
        return Ok((Vec::new(), 0));
    }

    let content = fs::read_to_string(path)?;
    if content.trim().is_empty() {
        return Ok((Vec::new(), 0));
    }
    let mut sessions: Vec<RecordingSession> = serde_json::from_str(&content)?;

    let mut assigned = 0;
    let mut seen = HashSet::new();
    for session in &mut sessions {
        if session.id().is_empty() {
            session.set_id(Uuid::new_v4().to_string());
            assigned += 1;
        }
        if !seen.insert(session.id().to_string()) {
            return Err(LedgerError::DuplicateId(session.id().to_string()));
        }
    }

    tracing::debug!("Loaded {} sessions from {:?}", sessions.len(), path);
    Ok((sessions, assigned))
}

/// Write every session to a ledger file, replacing it atomically
pub fn write_all(sessions: &[RecordingSession], path: &Path) -> LedgerResult<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    if !dir.exists() {
        fs::create_dir_all(&dir)?;
    }

    let content = serde_json::to_string_pretty(sessions)?;
    let mut file = tempfile::NamedTempFile::new_in(&dir)?;
    file.write_all(content.as_bytes())?;
    file.as_file().sync_all()?;
    file.persist(path)?;

    Ok(())
}

/// Durable, ordered store of finished sessions
pub struct SessionLedger {
    path: PathBuf,
    sessions: Vec<RecordingSession>,
}

impl SessionLedger {
    /// Open the ledger at `path`, loading whatever it already holds
    pub fn open(path: impl Into<PathBuf>) -> LedgerResult<Self> {
        let path = path.into();
        let (sessions, assigned) = load_keyed(&path)?;
        tracing::info!("Session ledger {:?} holds {} sessions", path, sessions.len());

        if assigned > 0 {
            tracing::info!("Assigned ids to {} sessions without one", assigned);
            if let Err(e) = write_all(&sessions, &path) {
                tracing::warn!("Failed to store assigned session ids: {}", e);
            }
        }
        Ok(Self { path, sessions })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Add a session and rewrite the file.
    ///
    /// A session without an id gets a fresh one. If the rewrite fails the
    /// session stays in memory, so a later append or `flush` can still
    /// persist it.
    pub fn append(&mut self, mut session: RecordingSession) -> LedgerResult<&RecordingSession> {
        if session.id().is_empty() {
            session.set_id(Uuid::new_v4().to_string());
        }
        if self.get(session.id()).is_some() {
            return Err(LedgerError::DuplicateId(session.id().to_string()));
        }

        let index = self.sessions.len();
        self.sessions.push(session);
        self.flush()?;

        let stored = &self.sessions[index];
        tracing::info!(
            "Saved session {} ({:.1}s) to {:?}",
            stored.id(),
            stored.duration_secs(),
            self.path
        );
        Ok(stored)
    }

    /// Rewrite the backing file from memory
    pub fn flush(&self) -> LedgerResult<()> {
        write_all(&self.sessions, &self.path)
    }

    pub fn sessions(&self) -> &[RecordingSession] {
        &self.sessions
    }

    pub fn get(&self, id: &str) -> Option<&RecordingSession> {
        self.sessions.iter().find(|s| s.id() == id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn total_practice_time(&self) -> Duration {
        self.sessions.iter().map(RecordingSession::duration).sum()
    }
}
