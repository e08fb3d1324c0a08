//! Device attributes and matching criteria
//!
//! Devices are described by the udev properties they advertise. Only a closed
//! set of properties is tracked; everything else a device reports is dropped
//! when the snapshot is built.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// udev properties that can be observed on a USB device
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DeviceAttribute {
    #[serde(rename = "ACTION")]
    Action,
    #[serde(rename = "DEVPATH")]
    DevPath,
    #[serde(rename = "DEVNAME")]
    DevName,
    #[serde(rename = "SUBSYSTEM")]
    Subsystem,
    #[serde(rename = "DEVTYPE")]
    DevType,
    #[serde(rename = "DRIVER")]
    Driver,
    #[serde(rename = "PRODUCT")]
    Product,
    #[serde(rename = "TYPE")]
    Type,
    #[serde(rename = "BUSNUM")]
    BusNum,
    #[serde(rename = "DEVNUM")]
    DevNum,
    #[serde(rename = "ID_VENDOR")]
    Vendor,
    #[serde(rename = "ID_VENDOR_ID")]
    VendorId,
    #[serde(rename = "ID_VENDOR_FROM_DATABASE")]
    VendorFromDatabase,
    #[serde(rename = "ID_MODEL")]
    Model,
    #[serde(rename = "ID_MODEL_ID")]
    ModelId,
    #[serde(rename = "ID_MODEL_FROM_DATABASE")]
    ModelFromDatabase,
    #[serde(rename = "ID_USB_MODEL_ID")]
    UsbModelId,
    #[serde(rename = "ID_SERIAL")]
    Serial,
    #[serde(rename = "ID_SERIAL_SHORT")]
    SerialShort,
    #[serde(rename = "ID_REVISION")]
    Revision,
    #[serde(rename = "ID_USB_INTERFACES")]
    UsbInterfaces,
}

impl DeviceAttribute {
    pub const ALL: [DeviceAttribute; 21] = [
        DeviceAttribute::Action,
        DeviceAttribute::DevPath,
        DeviceAttribute::DevName,
        DeviceAttribute::Subsystem,
        DeviceAttribute::DevType,
        DeviceAttribute::Driver,
        DeviceAttribute::Product,
        DeviceAttribute::Type,
        DeviceAttribute::BusNum,
        DeviceAttribute::DevNum,
        DeviceAttribute::Vendor,
        DeviceAttribute::VendorId,
        DeviceAttribute::VendorFromDatabase,
        DeviceAttribute::Model,
        DeviceAttribute::ModelId,
        DeviceAttribute::ModelFromDatabase,
        DeviceAttribute::UsbModelId,
        DeviceAttribute::Serial,
        DeviceAttribute::SerialShort,
        DeviceAttribute::Revision,
        DeviceAttribute::UsbInterfaces,
    ];

    /// The udev property key for this attribute
    pub fn property_name(&self) -> &'static str {
        match self {
            DeviceAttribute::Action => "ACTION",
            DeviceAttribute::DevPath => "DEVPATH",
            DeviceAttribute::DevName => "DEVNAME",
            DeviceAttribute::Subsystem => "SUBSYSTEM",
            DeviceAttribute::DevType => "DEVTYPE",
            DeviceAttribute::Driver => "DRIVER",
            DeviceAttribute::Product => "PRODUCT",
            DeviceAttribute::Type => "TYPE",
            DeviceAttribute::BusNum => "BUSNUM",
            DeviceAttribute::DevNum => "DEVNUM",
            DeviceAttribute::Vendor => "ID_VENDOR",
            DeviceAttribute::VendorId => "ID_VENDOR_ID",
            DeviceAttribute::VendorFromDatabase => "ID_VENDOR_FROM_DATABASE",
            DeviceAttribute::Model => "ID_MODEL",
            DeviceAttribute::ModelId => "ID_MODEL_ID",
            DeviceAttribute::ModelFromDatabase => "ID_MODEL_FROM_DATABASE",
            DeviceAttribute::UsbModelId => "ID_USB_MODEL_ID",
            DeviceAttribute::Serial => "ID_SERIAL",
            DeviceAttribute::SerialShort => "ID_SERIAL_SHORT",
            DeviceAttribute::Revision => "ID_REVISION",
            DeviceAttribute::UsbInterfaces => "ID_USB_INTERFACES",
        }
    }
}

impl fmt::Display for DeviceAttribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.property_name())
    }
}

/// Returned when a property name is outside the tracked set
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown device attribute: {0}")]
pub struct UnknownAttribute(pub String);

impl FromStr for DeviceAttribute {
    type Err = UnknownAttribute;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DeviceAttribute::ALL
            .iter()
            .copied()
            .find(|attr| attr.property_name() == s)
            .ok_or_else(|| UnknownAttribute(s.to_string()))
    }
}

/// Attribute values observed on one device at one point in time
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceSnapshot {
    attributes: BTreeMap<DeviceAttribute, String>,
}

impl DeviceSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a snapshot from raw `KEY=VALUE` properties, keeping only known keys
    pub fn from_properties<'a, I>(properties: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let attributes = properties
            .into_iter()
            .filter_map(|(key, value)| {
                key.parse::<DeviceAttribute>()
                    .ok()
                    .map(|attr| (attr, value.to_string()))
            })
            .collect();
        Self { attributes }
    }

    pub fn with(mut self, attribute: DeviceAttribute, value: impl Into<String>) -> Self {
        self.attributes.insert(attribute, value.into());
        self
    }

    pub fn get(&self, attribute: DeviceAttribute) -> Option<&str> {
        self.attributes.get(&attribute).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }

    /// Short human-readable label for logs
    pub fn label(&self) -> String {
        let model = self
            .get(DeviceAttribute::Model)
            .or_else(|| self.get(DeviceAttribute::ModelFromDatabase))
            .unwrap_or("unknown");
        match (
            self.get(DeviceAttribute::VendorId),
            self.get(DeviceAttribute::ModelId),
        ) {
            (Some(vendor), Some(product)) => format!("{} ({}:{})", model, vendor, product),
            _ => model.to_string(),
        }
    }
}

/// Attribute values a device must all carry to be considered the target
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceCriterion {
    expected: BTreeMap<DeviceAttribute, String>,
}

impl DeviceCriterion {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, attribute: DeviceAttribute, value: impl Into<String>) -> Self {
        self.expected.insert(attribute, value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.expected.is_empty()
    }

    /// Every expected attribute must be present on the device with the same value
    pub fn matches(&self, device: &DeviceSnapshot) -> bool {
        self.expected
            .iter()
            .all(|(attr, value)| device.get(*attr) == Some(value.as_str()))
    }
}

impl fmt::Display for DeviceCriterion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (attr, value)) in self.expected.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}={}", attr, value)?;
        }
        f.write_str("}")
    }
}

/// A device is wanted if it satisfies any one criterion in the set
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CriteriaSet {
    criteria: Vec<DeviceCriterion>,
}

impl CriteriaSet {
    pub fn new(criteria: Vec<DeviceCriterion>) -> Self {
        Self { criteria }
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeviceCriterion> {
        self.criteria.iter()
    }

    pub fn len(&self) -> usize {
        self.criteria.len()
    }

    pub fn is_empty(&self) -> bool {
        self.criteria.is_empty()
    }

    pub fn matches(&self, device: &DeviceSnapshot) -> bool {
        self.criteria.iter().any(|criterion| criterion.matches(device))
    }
}

impl fmt::Display for CriteriaSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, criterion) in self.criteria.iter().enumerate() {
            if i > 0 {
                f.write_str(" | ")?;
            }
            write!(f, "{}", criterion)?;
        }
        f.write_str("]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn piano() -> DeviceSnapshot {
        DeviceSnapshot::new()
            .with(DeviceAttribute::Subsystem, "usb")
            .with(DeviceAttribute::VendorId, "0582")
            .with(DeviceAttribute::ModelId, "01b6")
            .with(DeviceAttribute::Model, "ARIUS")
    }

    #[test]
    fn test_criterion_is_subset_match() {
        let criterion = DeviceCriterion::new()
            .with(DeviceAttribute::VendorId, "0582")
            .with(DeviceAttribute::ModelId, "01b6");
        assert!(criterion.matches(&piano()));

        let wrong_model = DeviceCriterion::new()
            .with(DeviceAttribute::VendorId, "0582")
            .with(DeviceAttribute::ModelId, "ffff");
        assert!(!wrong_model.matches(&piano()));
    }

    #[test]
    fn test_missing_attribute_never_matches() {
        let criterion = DeviceCriterion::new().with(DeviceAttribute::Serial, "ABC123");
        assert!(!criterion.matches(&piano()));
    }

    #[test]
    fn test_set_is_or_across_criteria() {
        let set = CriteriaSet::new(vec![
            DeviceCriterion::new().with(DeviceAttribute::VendorId, "dead"),
            DeviceCriterion::new().with(DeviceAttribute::Model, "ARIUS"),
        ]);
        assert!(set.matches(&piano()));

        let other = DeviceSnapshot::new().with(DeviceAttribute::Model, "Keyboard");
        assert!(!set.matches(&other));
    }

    #[test]
    fn test_empty_set_never_matches() {
        assert!(!CriteriaSet::default().matches(&piano()));
        assert!(!CriteriaSet::default().matches(&DeviceSnapshot::new()));
    }

    #[test]
    fn test_snapshot_drops_unknown_properties() {
        let snapshot = DeviceSnapshot::from_properties([
            ("ID_VENDOR_ID", "0582"),
            ("USEC_INITIALIZED", "12345"),
            ("MAJOR", "189"),
        ]);
        assert_eq!(snapshot.get(DeviceAttribute::VendorId), Some("0582"));
        assert_eq!(snapshot.label(), "unknown");
    }

    #[test]
    fn test_criteria_deserialize_from_property_names() {
        let json = r#"[{"ID_VENDOR_ID": "0582", "ID_MODEL_ID": "01b6"}]"#;
        let set: CriteriaSet = serde_json::from_str(json).unwrap();
        assert_eq!(set.len(), 1);
        assert!(set.matches(&piano()));

        let unknown = r#"[{"NOT_A_PROPERTY": "x"}]"#;
        assert!(serde_json::from_str::<CriteriaSet>(unknown).is_err());
    }

    #[test]
    fn test_attribute_names_round_trip() {
        for attr in DeviceAttribute::ALL {
            assert_eq!(attr.property_name().parse::<DeviceAttribute>(), Ok(attr));
        }
        assert!("BOGUS".parse::<DeviceAttribute>().is_err());
    }
}
