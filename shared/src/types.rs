use std::fmt;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};
use crate::protocol::DEFAULT_SERVICE_NAME;

/// Which backend a sighting came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryKind {
    Lan,
    Cloud,
}

impl fmt::Display for DiscoveryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiscoveryKind::Lan => f.write_str("lan"),
            DiscoveryKind::Cloud => f.write_str("cloud"),
        }
    }
}

/// A raw sighting reported by a provider, before resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRef {
    pub service_id: String,
    pub endpoint_uri: String,
    pub kind: DiscoveryKind,
}

/// Normalizes an endpoint URI for use as a dedup key.
pub fn canonical_uri(uri: &str) -> String {
    uri.trim().to_lowercase()
}

/// Device section of a service descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    #[serde(rename = "type")]
    pub device_type: String,
}

/// The JSON document a service returns from its endpoint URI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    pub id: String,
    pub uri: String,
    pub version: String,
    #[serde(default)]
    pub name: Option<String>,
    pub device: DeviceInfo,
}

/// A resolved service as held in the search cache.
///
/// Two records are the same service when both `id` and `kind` match;
/// the remaining fields do not take part in equality.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub id: String,

    /// Canonical endpoint URI the record was resolved from
    pub uri: String,

    pub name: String,
    pub version: String,
    pub device_type: String,
    pub kind: DiscoveryKind,

    /// When the record was resolved
    pub discovered_at: DateTime<Utc>,
}

impl ServiceRecord {
    pub fn from_descriptor(uri: &str, kind: DiscoveryKind, descriptor: Descriptor) -> Self {
        Self {
            id: descriptor.id,
            uri: canonical_uri(uri),
            name: descriptor
                .name
                .unwrap_or_else(|| DEFAULT_SERVICE_NAME.to_string()),
            version: descriptor.version,
            device_type: descriptor.device.device_type,
            kind,
            discovered_at: Utc::now(),
        }
    }

    pub fn same_service(&self, id: &str, kind: DiscoveryKind) -> bool {
        self.id == id && self.kind == kind
    }
}

impl PartialEq for ServiceRecord {
    fn eq(&self, other: &Self) -> bool {
        self.same_service(&other.id, other.kind)
    }
}

impl Eq for ServiceRecord {}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(name: Option<&str>) -> Descriptor {
        Descriptor {
            id: "tv-42".to_string(),
            uri: "http://10.0.0.5:8001/api/v2/".to_string(),
            version: "2.0".to_string(),
            name: name.map(str::to_string),
            device: DeviceInfo { device_type: "TV".to_string() },
        }
    }

    #[test]
    fn test_canonical_uri() {
        assert_eq!(
            canonical_uri("  HTTP://10.0.0.5:8001/API/v2/ "),
            "http://10.0.0.5:8001/api/v2/"
        );
    }

    #[test]
    fn test_missing_name_defaults() {
        let record = ServiceRecord::from_descriptor("http://a/", DiscoveryKind::Lan, descriptor(None));
        assert_eq!(record.name, DEFAULT_SERVICE_NAME);
        assert_eq!(record.device_type, "TV");
    }

    #[test]
    fn test_identity_is_id_and_kind() {
        let lan = ServiceRecord::from_descriptor("http://a/", DiscoveryKind::Lan, descriptor(Some("A")));
        let other_uri = ServiceRecord::from_descriptor("http://b/", DiscoveryKind::Lan, descriptor(Some("B")));
        let cloud = ServiceRecord::from_descriptor("http://a/", DiscoveryKind::Cloud, descriptor(Some("A")));

        assert_eq!(lan, other_uri);
        assert_ne!(lan, cloud);
    }

    #[test]
    fn test_descriptor_parses_without_name() {
        let json = r#"{"id":"x","uri":"http://x/","version":"2.0","device":{"type":"TV"}}"#;
        let parsed: Descriptor = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.name, None);
        assert_eq!(parsed.device.device_type, "TV");
    }
}
