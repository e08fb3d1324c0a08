//! Error types and handling
//!
//! Common error type used across the application.

use crate::config::ConfigError;
use crate::device::MonitorError;
use crate::ledger::LedgerError;
use crate::port::PortError;
use crate::recorder::RecordingError;
use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Monitor error: {0}")]
    Monitor(#[from] MonitorError),

    #[error("Port error: {0}")]
    Port(#[from] PortError),

    #[error("Recording error: {0}")]
    Recording(#[from] RecordingError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl AppError {
    /// Short machine-readable code for log fields
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Io(_) => "IO_ERROR",
            AppError::Serialization(_) => "SERIALIZATION_ERROR",
            AppError::Config(_) => "CONFIG_ERROR",
            AppError::Monitor(_) => "MONITOR_ERROR",
            AppError::Port(_) => "PORT_ERROR",
            AppError::Recording(_) => "RECORDING_ERROR",
            AppError::Ledger(_) => "LEDGER_ERROR",
            AppError::Task(_) => "TASK_ERROR",
        }
    }
}

/// Result type alias using AppError
pub type AppResult<T> = Result<T, AppError>;
