//! Paired device identity and per-connection state.

pub mod battery;
pub mod session;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Vendor {
    Compass,
    Friend,
    Bubble,
}

impl std::fmt::Display for Vendor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Vendor::Compass => write!(f, "compass"),
            Vendor::Friend => write!(f, "friend"),
            Vendor::Bubble => write!(f, "bubble"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceFeatures {
    pub has_mute_switch: bool,
    pub has_off_switch: bool,
}

/// Persisted identity of the single paired wearable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceProfile {
    pub id: String,
    pub vendor: Vendor,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub features: Option<DeviceFeatures>,
}

impl DeviceProfile {
    /// Build a profile from what the radio reports at pairing time.
    pub fn from_advertised(id: &str, name: Option<&str>) -> Self {
        let name = name.unwrap_or_default().trim().to_string();
        let vendor = infer_vendor(&name);
        Self {
            id: id.to_string(),
            vendor,
            name,
            features: Some(features_for(vendor)),
        }
    }
}

/// Vendor from the advertised name. Unknown names are treated as the
/// reference "friend" hardware.
pub fn infer_vendor(name: &str) -> Vendor {
    let lower = name.to_lowercase();
    if lower.contains("compass") {
        Vendor::Compass
    } else if lower.contains("bubble") {
        Vendor::Bubble
    } else {
        Vendor::Friend
    }
}

pub fn features_for(vendor: Vendor) -> DeviceFeatures {
    match vendor {
        Vendor::Bubble => DeviceFeatures {
            has_mute_switch: true,
            has_off_switch: true,
        },
        Vendor::Compass => DeviceFeatures {
            has_mute_switch: false,
            has_off_switch: true,
        },
        Vendor::Friend => DeviceFeatures::default(),
    }
}

/// Connection state owned by `DeviceSession`. `battery`/`muted` stay `None`
/// when the device does not expose the characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum DeviceConnectionState {
    Disconnected,
    Connecting,
    Connected {
        battery: Option<u8>,
        muted: Option<bool>,
    },
    Subscribed {
        battery: Option<u8>,
        muted: Option<bool>,
    },
}

impl DeviceConnectionState {
    pub fn battery(&self) -> Option<u8> {
        match self {
            DeviceConnectionState::Connected { battery, .. }
            | DeviceConnectionState::Subscribed { battery, .. } => *battery,
            _ => None,
        }
    }

    pub fn muted(&self) -> Option<bool> {
        match self {
            DeviceConnectionState::Connected { muted, .. }
            | DeviceConnectionState::Subscribed { muted, .. } => *muted,
            _ => None,
        }
    }

    pub fn is_linked(&self) -> bool {
        matches!(
            self,
            DeviceConnectionState::Connected { .. } | DeviceConnectionState::Subscribed { .. }
        )
    }
}

impl std::fmt::Display for DeviceConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceConnectionState::Disconnected => write!(f, "disconnected"),
            DeviceConnectionState::Connecting => write!(f, "connecting"),
            DeviceConnectionState::Connected { .. } => write!(f, "connected"),
            DeviceConnectionState::Subscribed { .. } => write!(f, "subscribed"),
        }
    }
}
