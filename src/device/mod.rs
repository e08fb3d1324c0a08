//! USB device detection
//!
//! This module provides the hotplug side of the recorder:
//! - Typed device attributes and the criteria used to pick the instrument
//! - The monitor that filters hotplug events
//! - A `udevadm`-backed event source

pub mod criteria;
pub mod monitor;
pub mod udev;

pub use criteria::{CriteriaSet, DeviceAttribute, DeviceCriterion, DeviceSnapshot};
pub use monitor::{
    DeviceAction, DeviceEvent, DeviceMonitor, HotplugSource, HotplugSubscription, MonitorError,
    MonitorResult,
};
pub use udev::UdevadmSource;
