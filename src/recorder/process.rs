//! Capture process control
//!
//! The capture command (`arecordmidi` by default) runs until it receives
//! SIGINT, at which point it finalizes the MIDI file and exits.

use crate::config::CaptureCommandSpec;
use crate::ledger::LedgerError;
use crate::port::{CapturePort, PortError};
use async_trait::async_trait;
use std::fmt;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use thiserror::Error;
use tokio::process::{Child, Command};

/// Recording errors
#[derive(Error, Debug)]
pub enum RecordingError {
    #[error("Port resolution failed: {0}")]
    Port(#[from] PortError),

    #[error("Failed to start capture process: {0}")]
    ProcessSpawn(String),

    #[error("Capture process exited right after starting: {0}")]
    ExitedOnStartup(String),

    #[error("Capture process exited abnormally: {0}")]
    ProcessExit(String),

    #[error("Failed to control capture process: {0}")]
    ProcessControl(String),

    #[error("Failed to persist session: {0}")]
    Persistence(#[from] LedgerError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type RecordingResult<T> = Result<T, RecordingError>;

/// How a capture process ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureExit {
    /// Exited successfully, or was ended by our interrupt
    Clean,
    /// Anything else, with a description of the exit status
    Abnormal(String),
}

impl fmt::Display for CaptureExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureExit::Clean => f.write_str("clean exit"),
            CaptureExit::Abnormal(reason) => f.write_str(reason),
        }
    }
}

/// A running capture process
#[async_trait]
pub trait CaptureProcess: Send {
    fn id(&self) -> Option<u32>;

    /// How the process ended, if it already has
    fn try_exit(&mut self) -> RecordingResult<Option<CaptureExit>>;

    /// Send a graceful interrupt and wait for the process to exit
    async fn interrupt(&mut self) -> RecordingResult<CaptureExit>;
}

/// Starts capture processes
pub trait CaptureLauncher: Send + Sync {
    fn launch(&self, port: &CapturePort, output: &Path) -> RecordingResult<Box<dyn CaptureProcess>>;
}

/// Launches the configured capture command
#[derive(Debug, Clone, Default)]
pub struct CommandLauncher {
    command: CaptureCommandSpec,
}

impl CommandLauncher {
    pub fn new(command: CaptureCommandSpec) -> Self {
        Self { command }
    }
}

impl CaptureLauncher for CommandLauncher {
    fn launch(&self, port: &CapturePort, output: &Path) -> RecordingResult<Box<dyn CaptureProcess>> {
        let mut command = Command::new(&self.command.program);
        command
            .args(&self.command.extra_args)
            .arg(&self.command.port_flag)
            .arg(port.as_str())
            .arg(output)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        // Own process group: a Ctrl+C on the terminal must not reach the
        // recorder before we have interrupted it ourselves.
        #[cfg(unix)]
        command.process_group(0);

        let child = command.spawn().map_err(|e| {
            RecordingError::ProcessSpawn(format!("Failed to start {}: {}", self.command.program, e))
        })?;

        tracing::info!(
            "Started {} (pid {:?}) on port {}, output: {:?}",
            self.command.program,
            child.id(),
            port,
            output
        );

        Ok(Box::new(ChildCapture { child }))
    }
}

/// A capture process spawned as a child of this process
pub struct ChildCapture {
    child: Child,
}

impl ChildCapture {
    fn send_interrupt(&mut self) -> RecordingResult<()> {
        #[cfg(unix)]
        {
            let pid = self
                .child
                .id()
                .ok_or_else(|| RecordingError::ProcessControl("capture process already reaped".to_string()))?;
            let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGINT) };
            if rc != 0 {
                return Err(RecordingError::ProcessControl(format!(
                    "Failed to interrupt pid {}: {}",
                    pid,
                    std::io::Error::last_os_error()
                )));
            }
            Ok(())
        }

        #[cfg(not(unix))]
        {
            self.child
                .start_kill()
                .map_err(|e| RecordingError::ProcessControl(format!("Failed to stop capture process: {}", e)))
        }
    }
}

#[async_trait]
impl CaptureProcess for ChildCapture {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    fn try_exit(&mut self) -> RecordingResult<Option<CaptureExit>> {
        let status = self.child.try_wait()?;
        Ok(status.map(classify_exit))
    }

    async fn interrupt(&mut self) -> RecordingResult<CaptureExit> {
        if let Some(exit) = self.try_exit()? {
            return Ok(exit);
        }
        self.send_interrupt()?;
        let status = self.child.wait().await?;
        tracing::debug!("Capture process exited with {}", status);
        Ok(classify_exit(status))
    }
}

/// Success, or death by the SIGINT we sent, is a clean stop
pub fn classify_exit(status: ExitStatus) -> CaptureExit {
    if status.success() {
        return CaptureExit::Clean;
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if status.signal() == Some(libc::SIGINT) {
            return CaptureExit::Clean;
        }
    }

    CaptureExit::Abnormal(format!("capture process exited with {}", status))
}
