//! Capture port resolution
//!
//! Finds the ALSA sequencer port of the instrument by running the port
//! listing command (`arecordmidi -l` by default) and searching its output
//! for the configured port name.

use crate::config::CommandSpec;
use async_trait::async_trait;
use regex::Regex;
use std::fmt;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;

/// Port resolution errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PortError {
    #[error("Port enumeration failed: {0}")]
    Resolution(String),

    #[error("Target device '{0}' not found in port listing")]
    NotFound(String),
}

pub type PortResult<T> = Result<T, PortError>;

/// A resolved `<client>:<port>` sequencer address, e.g. `28:0`
///
/// Only valid while the device stays connected.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CapturePort(String);

impl CapturePort {
    pub fn new(port: impl Into<String>) -> Self {
        Self(port.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CapturePort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How often and how patiently to retry resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub attempts: u32,
    /// Delay between consecutive attempts
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_secs(2),
        }
    }
}

/// Produces the raw port listing text
#[async_trait]
pub trait PortLister: Send + Sync {
    async fn list_ports(&self) -> PortResult<String>;
}

/// Runs an external command and returns its stdout
#[derive(Debug, Clone)]
pub struct CommandPortLister {
    command: CommandSpec,
}

impl CommandPortLister {
    pub fn new(command: CommandSpec) -> Self {
        Self { command }
    }
}

#[async_trait]
impl PortLister for CommandPortLister {
    async fn list_ports(&self) -> PortResult<String> {
        let output = Command::new(&self.command.program)
            .args(&self.command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| PortError::Resolution(format!("Failed to run {}: {}", self.command, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PortError::Resolution(format!(
                "Error running {}: {}",
                self.command,
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Find the first line of `listing` that names `target` and return its port
pub fn find_port(listing: &str, target: &str) -> PortResult<CapturePort> {
    let pattern = format!(r"^\s*(\d+:\d+)\s+.*\b{}\b", regex::escape(target));
    let re = Regex::new(&pattern).map_err(|e| PortError::Resolution(e.to_string()))?;

    listing
        .lines()
        .find_map(|line| re.captures(line))
        .and_then(|caps| caps.get(1))
        .map(|port| CapturePort::new(port.as_str()))
        .ok_or_else(|| PortError::NotFound(target.to_string()))
}

/// Resolves the instrument's capture port, retrying while it is still
/// registering with the sequencer
pub struct PortResolver<L> {
    lister: L,
    retry: RetryPolicy,
}

impl<L: PortLister> PortResolver<L> {
    pub fn new(lister: L, retry: RetryPolicy) -> Self {
        Self { lister, retry }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    async fn attempt(&self, target: &str) -> PortResult<CapturePort> {
        let listing = self.lister.list_ports().await?;
        find_port(&listing, target)
    }

    pub async fn resolve(&self, target: &str) -> PortResult<CapturePort> {
        let attempts = self.retry.attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.attempt(target).await {
                Ok(port) => {
                    tracing::info!("Resolved '{}' to port {}", target, port);
                    return Ok(port);
                }
                Err(e) if attempt < attempts => {
                    tracing::warn!("Attempt {} of {} failed: {}", attempt, attempts, e);
                    tokio::time::sleep(self.retry.delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    tracing::error!("Attempt {} of {} failed: {}", attempt, attempts, e);
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::Arc;
    use tokio::time::Instant;

    const LISTING: &str = "\
 Port    Client name                      Port name
 14:0    Midi Through                     Midi Through Port-0
 28:0    ARIUS                            ARIUS MIDI 1
";

    /// Replays scripted listings; the last one repeats once the script runs out
    #[derive(Clone)]
    pub struct ScriptedLister {
        script: Arc<Mutex<VecDeque<PortResult<String>>>>,
        pub calls: Arc<Mutex<Vec<Instant>>>,
    }

    impl ScriptedLister {
        pub fn new(script: Vec<PortResult<String>>) -> Self {
            Self {
                script: Arc::new(Mutex::new(script.into())),
                calls: Arc::new(Mutex::new(Vec::new())),
            }
        }

        pub fn always(output: &str) -> Self {
            Self::new(vec![Ok(output.to_string())])
        }
    }

    #[async_trait]
    impl PortLister for ScriptedLister {
        async fn list_ports(&self) -> PortResult<String> {
            self.calls.lock().push(Instant::now());
            let mut script = self.script.lock();
            if script.len() > 1 {
                script.pop_front().unwrap_or_else(|| Ok(String::new()))
            } else {
                script.front().cloned().unwrap_or_else(|| Ok(String::new()))
            }
        }
    }

    #[test]
    fn test_find_port_first_match_wins() {
        let listing = "20:0 Some Other Device\n28:0 ARIUS\n";
        assert_eq!(find_port(listing, "ARIUS").unwrap().as_str(), "28:0");

        let twice = " 28:0 ARIUS one\n 32:0 ARIUS two\n";
        assert_eq!(find_port(twice, "ARIUS").unwrap().as_str(), "28:0");
    }

    #[test]
    fn test_find_port_needs_whole_word() {
        let listing = " 28:0    ARIUSX      ARIUSX MIDI 1\n";
        assert_eq!(
            find_port(listing, "ARIUS"),
            Err(PortError::NotFound("ARIUS".to_string()))
        );
        // The header line has no port token
        assert!(find_port(LISTING, "Port").is_err());
    }

    #[test]
    fn test_find_port_escapes_target() {
        let listing = " 24:0    Digital Piano (USB)    MIDI 1\n";
        assert_eq!(find_port(listing, "Digital Piano").unwrap().as_str(), "24:0");
        assert!(find_port(listing, "P.ano").is_err());
    }

    #[tokio::test]
    async fn test_resolve_is_idempotent() {
        let lister = ScriptedLister::always(LISTING);
        let resolver = PortResolver::new(lister, RetryPolicy::default());
        let first = resolver.resolve("ARIUS").await.unwrap();
        let second = resolver.resolve("ARIUS").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.as_str(), "28:0");
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_found_after_three_spaced_attempts() {
        let lister = ScriptedLister::always(" 14:0    Midi Through    Midi Through Port-0\n");
        let calls = lister.calls.clone();
        let resolver = PortResolver::new(lister, RetryPolicy::default());

        let result = resolver.resolve("ARIUS").await;
        assert_eq!(result, Err(PortError::NotFound("ARIUS".to_string())));

        let calls = calls.lock();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[1] - calls[0], Duration::from_secs(2));
        assert_eq!(calls[2] - calls[1], Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_command_failure_is_retried() {
        let lister = ScriptedLister::new(vec![
            Err(PortError::Resolution("sequencer busy".to_string())),
            Ok(String::new()),
            Ok(LISTING.to_string()),
        ]);
        let calls = lister.calls.clone();
        let resolver = PortResolver::new(lister, RetryPolicy::default());

        assert_eq!(resolver.resolve("ARIUS").await.unwrap().as_str(), "28:0");
        assert_eq!(calls.lock().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_failure_is_propagated() {
        let lister = ScriptedLister::new(vec![
            Ok(String::new()),
            Err(PortError::Resolution("exit status 1".to_string())),
        ]);
        let resolver = PortResolver::new(
            lister,
            RetryPolicy {
                attempts: 2,
                delay: Duration::from_millis(10),
            },
        );
        assert_eq!(
            resolver.resolve("ARIUS").await,
            Err(PortError::Resolution("exit status 1".to_string()))
        );
    }

    #[tokio::test]
    async fn test_missing_command_is_resolution_error() {
        let lister = CommandPortLister::new(CommandSpec::new("/nonexistent/arecordmidi", ["-l"]));
        assert!(matches!(lister.list_ports().await, Err(PortError::Resolution(_))));
    }
}
