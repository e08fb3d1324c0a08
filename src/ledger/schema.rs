//! Practice session records
//!
//! A closed session as stored in the ledger file:
//!
//! ```json
//! {
//!   "id": "0b9d6c1e-...",
//!   "start_time": "2024-05-01T18:00:00Z",
//!   "stop_time": "2024-05-01T18:25:30Z",
//!   "duration": 1530.0,
//!   "midi_file_path": "20240501_180000.mid"
//! }
//! ```

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Session stops at {stop_time} before it starts at {start_time}")]
pub struct InvalidSession {
    pub start_time: DateTime<Utc>,
    pub stop_time: DateTime<Utc>,
}

/// A finished practice session. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "SessionRecord", try_from = "SessionRecord")]
pub struct RecordingSession {
    id: String,
    start_time: DateTime<Utc>,
    stop_time: DateTime<Utc>,
    midi_file_path: String,
    degraded: bool,
}

impl RecordingSession {
    pub fn new(
        id: impl Into<String>,
        start_time: DateTime<Utc>,
        stop_time: DateTime<Utc>,
        midi_file_path: impl Into<String>,
    ) -> Result<Self, InvalidSession> {
        if stop_time < start_time {
            return Err(InvalidSession {
                start_time,
                stop_time,
            });
        }
        Ok(Self {
            id: id.into(),
            start_time,
            stop_time,
            midi_file_path: midi_file_path.into(),
            degraded: false,
        })
    }

    /// Like `new`, but a stop time before the start is pulled up to the start
    pub(crate) fn clamped(
        id: String,
        start_time: DateTime<Utc>,
        stop_time: DateTime<Utc>,
        midi_file_path: String,
    ) -> Self {
        Self {
            id,
            start_time,
            stop_time: stop_time.max(start_time),
            midi_file_path,
            degraded: false,
        }
    }

    /// Mark the capture as incomplete (the recorder exited abnormally)
    pub fn into_degraded(mut self) -> Self {
        self.degraded = true;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn set_id(&mut self, id: String) {
        self.id = id;
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn stop_time(&self) -> DateTime<Utc> {
        self.stop_time
    }

    pub fn midi_file_path(&self) -> &str {
        &self.midi_file_path
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    pub fn duration(&self) -> Duration {
        (self.stop_time - self.start_time).to_std().unwrap_or_default()
    }

    pub fn duration_secs(&self) -> f64 {
        self.duration().as_secs_f64()
    }
}

/// On-disk shape. `duration` is written for readers of the file but always
/// recomputed from the timestamps when loading.
#[derive(Debug, Serialize, Deserialize)]
struct SessionRecord {
    #[serde(default)]
    id: String,
    #[serde(deserialize_with = "deserialize_timestamp")]
    start_time: DateTime<Utc>,
    #[serde(deserialize_with = "deserialize_timestamp")]
    stop_time: DateTime<Utc>,
    #[serde(default)]
    duration: f64,
    midi_file_path: String,
    #[serde(default, skip_serializing_if = "is_false")]
    degraded: bool,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl From<RecordingSession> for SessionRecord {
    fn from(session: RecordingSession) -> Self {
        let duration = session.duration_secs();
        Self {
            id: session.id,
            start_time: session.start_time,
            stop_time: session.stop_time,
            duration,
            midi_file_path: session.midi_file_path,
            degraded: session.degraded,
        }
    }
}

impl TryFrom<SessionRecord> for RecordingSession {
    type Error = InvalidSession;

    fn try_from(record: SessionRecord) -> Result<Self, Self::Error> {
        let session = RecordingSession::new(
            record.id,
            record.start_time,
            record.stop_time,
            record.midi_file_path,
        )?;
        Ok(if record.degraded {
            session.into_degraded()
        } else {
            session
        })
    }
}

/// RFC 3339, or a bare ISO-8601 local time without offset (read as UTC)
fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    if let Ok(ts) = DateTime::parse_from_rfc3339(&raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|e| serde::de::Error::custom(format!("invalid timestamp '{}': {}", raw, e)))
}
