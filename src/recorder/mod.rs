//! Recording system module
//!
//! This module drives the external capture process:
//! - CaptureLauncher/CaptureProcess traits around the capture command
//! - RecordingController, the connect/disconnect state machine
//! - The in-progress session and its output file naming

pub mod controller;
pub mod process;
pub mod state;

pub use controller::{RecordingController, RecordingEvent, DEFAULT_STARTUP_GRACE};
pub use process::{
    CaptureExit, CaptureLauncher, CaptureProcess, CommandLauncher, RecordingError, RecordingResult,
};
pub use state::{OpenSession, RecordingState};
