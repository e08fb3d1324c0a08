//! Recording state management
//!
//! Defines the recorder state machine and the in-progress session.

use crate::ledger::RecordingSession;
use chrono::{DateTime, Local, Utc};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Current state of the recorder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecordingState {
    /// No capture process
    #[default]
    Idle,
    /// Resolving the capture port
    Starting,
    /// Capture process running
    Recording,
    /// Interrupt sent, waiting for the capture process to exit
    Stopping,
}

/// A session that has started but not yet stopped
#[derive(Debug, Clone, PartialEq)]
pub struct OpenSession {
    pub id: String,
    pub start_time: DateTime<Utc>,
    pub output_path: PathBuf,
}

impl OpenSession {
    /// Open a session starting at `start_time`
    pub fn new(start_time: DateTime<Utc>, output_path: PathBuf) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            start_time,
            output_path,
        }
    }

    /// Close the session. A stop time earlier than the start (clock stepped
    /// backwards) is clamped to the start time.
    pub fn close(self, stop_time: DateTime<Utc>) -> RecordingSession {
        let path = self.output_path.to_string_lossy().into_owned();
        RecordingSession::clamped(self.id, self.start_time, stop_time, path)
    }
}

/// Pick an output file named after the local start time, e.g.
/// `20240501_180000.mid`. A numeric suffix keeps it unique when a file with
/// that name already exists. The current directory yields a bare file name.
pub fn output_path_for(output_dir: &Path, start_time: DateTime<Utc>) -> PathBuf {
    let in_output_dir = |name: String| {
        if output_dir.as_os_str().is_empty() || output_dir == Path::new(".") {
            PathBuf::from(name)
        } else {
            output_dir.join(name)
        }
    };

    let stem = start_time.with_timezone(&Local).format("%Y%m%d_%H%M%S").to_string();
    let mut candidate = in_output_dir(format!("{}.mid", stem));
    let mut suffix = 1;
    while candidate.exists() {
        candidate = in_output_dir(format!("{}-{}.mid", stem, suffix));
        suffix += 1;
    }
    candidate
}
