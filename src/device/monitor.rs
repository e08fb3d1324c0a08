//! Hotplug monitoring
//!
//! Watches USB add/remove notifications and forwards the ones that match the
//! configured criteria. Devices that are already attached when monitoring
//! starts are reported as synthetic `add` events before any live event.

use super::criteria::{CriteriaSet, DeviceAttribute, DeviceSnapshot};
use async_trait::async_trait;
use std::fmt;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Monitor errors
#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("Failed to enumerate attached devices: {0}")]
    Enumeration(String),

    #[error("Failed to set up hotplug subscription: {0}")]
    SubscriptionSetup(String),

    #[error("Hotplug event stream closed unexpectedly")]
    StreamClosed,

    #[error("Hotplug event stream error: {0}")]
    Stream(String),
}

pub type MonitorResult<T> = Result<T, MonitorError>;

/// What happened to a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceAction {
    Add,
    Remove,
}

impl DeviceAction {
    /// Parse a udev ACTION value; actions other than add/remove are not tracked
    pub fn from_udev(action: &str) -> Option<Self> {
        match action {
            "add" => Some(DeviceAction::Add),
            "remove" => Some(DeviceAction::Remove),
            _ => None,
        }
    }
}

impl fmt::Display for DeviceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceAction::Add => f.write_str("add"),
            DeviceAction::Remove => f.write_str("remove"),
        }
    }
}

/// A single hotplug notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEvent {
    pub action: DeviceAction,
    pub device: DeviceSnapshot,
}

impl DeviceEvent {
    pub fn new(action: DeviceAction, device: DeviceSnapshot) -> Self {
        Self { action, device }
    }

    /// Build an event from a snapshot carrying an ACTION attribute
    pub fn from_snapshot(device: DeviceSnapshot) -> Option<Self> {
        let action = DeviceAction::from_udev(device.get(DeviceAttribute::Action)?)?;
        Some(Self { action, device })
    }
}

/// Platform facility that reports USB devices and their hotplug events
#[async_trait]
pub trait HotplugSource: Send + Sync {
    /// List the USB devices attached right now
    async fn enumerate(&self) -> MonitorResult<Vec<DeviceSnapshot>>;

    /// Open a live event subscription
    async fn subscribe(&self) -> MonitorResult<Box<dyn HotplugSubscription>>;
}

/// A live stream of hotplug events
#[async_trait]
pub trait HotplugSubscription: Send {
    /// Wait for the next event; `None` means the stream ended
    async fn next_event(&mut self) -> MonitorResult<Option<DeviceEvent>>;

    /// Tear the subscription down
    async fn close(&mut self);
}

/// Filters hotplug events down to the devices we care about
pub struct DeviceMonitor<S> {
    source: S,
    criteria: CriteriaSet,
}

impl<S: HotplugSource> DeviceMonitor<S> {
    pub fn new(source: S, criteria: CriteriaSet) -> Self {
        Self { source, criteria }
    }

    pub fn criteria(&self) -> &CriteriaSet {
        &self.criteria
    }

    /// Currently attached devices that satisfy the criteria
    pub async fn attached_matches(&self) -> MonitorResult<Vec<DeviceSnapshot>> {
        let devices = self.source.enumerate().await?;
        Ok(devices
            .into_iter()
            .filter(|device| self.criteria.matches(device))
            .collect())
    }

    /// Deliver matching events to `on_match` until `shutdown` fires.
    ///
    /// The subscription is opened before the attached devices are listed so
    /// a device plugged in between the two steps is not lost. It may then be
    /// reported twice, which the controller tolerates.
    pub async fn start<F>(&self, mut on_match: F, shutdown: CancellationToken) -> MonitorResult<()>
    where
        F: FnMut(DeviceEvent) + Send,
    {
        let mut subscription = self.source.subscribe().await?;

        let attached = match self.attached_matches().await {
            Ok(devices) => devices,
            Err(e) => {
                subscription.close().await;
                return Err(e);
            }
        };
        for device in attached {
            tracing::info!("Device already connected: {}", device.label());
            on_match(DeviceEvent::new(DeviceAction::Add, device));
        }

        tracing::info!("Monitoring USB events for devices matching {}", self.criteria);

        let result = loop {
            let event = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    tracing::info!("Stopping monitor");
                    break Ok(());
                }
                event = subscription.next_event() => event,
            };

            match event {
                Ok(Some(event)) => {
                    if self.criteria.matches(&event.device) {
                        tracing::debug!("Matched {} event for {}", event.action, event.device.label());
                        on_match(event);
                    } else {
                        tracing::trace!("Ignoring {} event for {}", event.action, event.device.label());
                    }
                }
                Ok(None) => break Err(MonitorError::StreamClosed),
                Err(e) => break Err(e),
            }
        };

        subscription.close().await;
        result
    }
}
