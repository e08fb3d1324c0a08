//! udev hotplug source backed by the `udevadm` tool
//!
//! Enumeration reads `udevadm info --export-db`, live events come from
//! `udevadm monitor --udev --property`. Both print one property block per
//! device, separated by blank lines.

use super::criteria::{DeviceAttribute, DeviceSnapshot};
use super::monitor::{DeviceEvent, HotplugSource, HotplugSubscription, MonitorError, MonitorResult};
use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};

const USB_SUBSYSTEM: &str = "usb";
const USB_DEVICE_TYPE: &str = "usb_device";

/// Hotplug source for USB devices using `udevadm`
#[derive(Debug, Clone)]
pub struct UdevadmSource {
    program: String,
}

impl UdevadmSource {
    pub fn new() -> Self {
        Self {
            program: "udevadm".to_string(),
        }
    }

    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for UdevadmSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HotplugSource for UdevadmSource {
    async fn enumerate(&self) -> MonitorResult<Vec<DeviceSnapshot>> {
        let output = Command::new(&self.program)
            .args(["info", "--export-db"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| MonitorError::Enumeration(format!("Failed to run {}: {}", self.program, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(MonitorError::Enumeration(format!(
                "{} info failed: {}",
                self.program,
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let devices: Vec<DeviceSnapshot> = parse_export_db(&stdout)
            .into_iter()
            .filter(is_usb_device)
            .collect();

        tracing::debug!("Enumerated {} USB devices", devices.len());
        Ok(devices)
    }

    async fn subscribe(&self) -> MonitorResult<Box<dyn HotplugSubscription>> {
        let subsystem_match = format!("--subsystem-match={}/{}", USB_SUBSYSTEM, USB_DEVICE_TYPE);
        let mut child = Command::new(&self.program)
            .args(["monitor", "--udev", "--property", subsystem_match.as_str()])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                MonitorError::SubscriptionSetup(format!("Failed to start {} monitor: {}", self.program, e))
            })?;

        let stdout = child.stdout.take().ok_or_else(|| {
            MonitorError::SubscriptionSetup("Failed to capture udevadm stdout".to_string())
        })?;

        tracing::debug!("udevadm monitor started (pid {:?})", child.id());

        Ok(Box::new(UdevadmSubscription {
            child,
            reader: BufReader::new(stdout),
            line: Vec::new(),
            block: PropertyBlock::default(),
        }))
    }
}

/// A running `udevadm monitor` process
struct UdevadmSubscription {
    child: Child,
    reader: BufReader<ChildStdout>,
    line: Vec<u8>,
    block: PropertyBlock,
}

#[async_trait]
impl HotplugSubscription for UdevadmSubscription {
    async fn next_event(&mut self) -> MonitorResult<Option<DeviceEvent>> {
        loop {
            self.line.clear();
            let read = self
                .reader
                .read_until(b'\n', &mut self.line)
                .await
                .map_err(|e| MonitorError::Stream(e.to_string()))?;

            // Property values are not guaranteed to be UTF-8
            let snapshot = if read > 0 {
                match self.block.feed(&String::from_utf8_lossy(&self.line)) {
                    Some(snapshot) => snapshot,
                    None => continue,
                }
            } else {
                match self.block.finish() {
                    Some(snapshot) => snapshot,
                    None => return Ok(None),
                }
            };

            if !is_usb_device(&snapshot) {
                continue;
            }
            if let Some(event) = DeviceEvent::from_snapshot(snapshot) {
                return Ok(Some(event));
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.child.kill().await {
            tracing::warn!("Failed to stop udevadm monitor: {}", e);
        }
    }
}

/// Accumulates `KEY=VALUE` lines until a blank line ends the block
#[derive(Debug, Default)]
struct PropertyBlock {
    properties: Vec<(String, String)>,
}

impl PropertyBlock {
    /// Feed one output line; returns a snapshot when a block is complete
    fn feed(&mut self, line: &str) -> Option<DeviceSnapshot> {
        let line = line.trim_end();
        if line.is_empty() {
            return self.finish();
        }
        // `udevadm info` prefixes properties with "E: "; other record types are skipped
        let property = match line.split_once(": ") {
            Some(("E", rest)) => rest,
            Some((prefix, _)) if prefix.len() == 1 => return None,
            _ => line,
        };
        if let Some((key, value)) = property.split_once('=') {
            self.properties.push((key.to_string(), value.to_string()));
        }
        None
    }

    fn finish(&mut self) -> Option<DeviceSnapshot> {
        if self.properties.is_empty() {
            return None;
        }
        let properties = std::mem::take(&mut self.properties);
        Some(DeviceSnapshot::from_properties(
            properties.iter().map(|(k, v)| (k.as_str(), v.as_str())),
        ))
    }
}

/// Parse the full output of `udevadm info --export-db`
pub fn parse_export_db(output: &str) -> Vec<DeviceSnapshot> {
    let mut block = PropertyBlock::default();
    let mut devices: Vec<DeviceSnapshot> = output.lines().filter_map(|line| block.feed(line)).collect();
    devices.extend(block.finish());
    devices
}

fn is_usb_device(device: &DeviceSnapshot) -> bool {
    device.get(DeviceAttribute::Subsystem) == Some(USB_SUBSYSTEM)
        && device.get(DeviceAttribute::DevType) == Some(USB_DEVICE_TYPE)
}
