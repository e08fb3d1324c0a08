//! Capture port lookup
//!
//! Maps the configured port name to the sequencer address the capture
//! command binds to.

pub mod resolver;

pub use resolver::{
    find_port, CapturePort, CommandPortLister, PortError, PortLister, PortResolver, PortResult,
    RetryPolicy,
};
