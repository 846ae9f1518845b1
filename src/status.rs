//! User-facing wearable status, derived by one pure function from the
//! radio, pairing, connection and mute inputs.

use serde::Serialize;

use crate::ble::radio::RadioStatus;
use crate::device::DeviceConnectionState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PairingStatus {
    /// Stored profile not read yet.
    Loading,
    Unpaired,
    Pairing,
    Ready,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AudioStatus {
    /// Linked but no audio flowing (streaming off, stalled, or unsupported).
    Idle,
    Streaming,
    MutedLocally,
    MutedOnDevice,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum WearableStatus {
    Loading,
    /// Needs user action in system settings.
    BluetoothDenied,
    BluetoothUnavailable,
    Unpaired,
    Pairing,
    Connecting,
    Connected {
        battery: Option<u8>,
        audio: AudioStatus,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct StatusInputs {
    pub radio: RadioStatus,
    pub pairing: PairingStatus,
    pub device: DeviceConnectionState,
    pub local_muted: bool,
    /// Decoded audio is currently being delivered.
    pub audio_flowing: bool,
}

pub fn derive(inputs: &StatusInputs) -> WearableStatus {
    match inputs.radio {
        RadioStatus::Denied => return WearableStatus::BluetoothDenied,
        RadioStatus::Unavailable => return WearableStatus::BluetoothUnavailable,
        RadioStatus::Uninitialized => return WearableStatus::Loading,
        RadioStatus::Ready => {}
    }
    match inputs.pairing {
        PairingStatus::Loading => WearableStatus::Loading,
        PairingStatus::Unpaired => WearableStatus::Unpaired,
        PairingStatus::Pairing => WearableStatus::Pairing,
        PairingStatus::Ready => {
            if !inputs.device.is_linked() {
                return WearableStatus::Connecting;
            }
            // local mute wins: it is the user's explicit choice
            let audio = if inputs.local_muted {
                AudioStatus::MutedLocally
            } else if inputs.device.muted() == Some(true) {
                AudioStatus::MutedOnDevice
            } else if inputs.audio_flowing {
                AudioStatus::Streaming
            } else {
                AudioStatus::Idle
            };
            WearableStatus::Connected {
                battery: inputs.device.battery(),
                audio,
            }
        }
    }
}

impl std::fmt::Display for WearableStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WearableStatus::Loading => write!(f, "loading"),
            WearableStatus::BluetoothDenied => write!(f, "bluetooth-denied"),
            WearableStatus::BluetoothUnavailable => write!(f, "bluetooth-unavailable"),
            WearableStatus::Unpaired => write!(f, "unpaired"),
            WearableStatus::Pairing => write!(f, "pairing"),
            WearableStatus::Connecting => write!(f, "connecting"),
            WearableStatus::Connected { battery, audio } => {
                write!(f, "connected ({audio:?}")?;
                if let Some(b) = battery {
                    write!(f, ", {b}%")?;
                }
                write!(f, ")")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs() -> StatusInputs {
        StatusInputs {
            radio: RadioStatus::Ready,
            pairing: PairingStatus::Ready,
            device: DeviceConnectionState::Subscribed {
                battery: Some(50),
                muted: Some(false),
            },
            local_muted: false,
            audio_flowing: true,
        }
    }

    #[test]
    fn radio_problems_dominate() {
        let mut i = inputs();
        i.radio = RadioStatus::Denied;
        assert_eq!(derive(&i), WearableStatus::BluetoothDenied);
        i.radio = RadioStatus::Unavailable;
        assert_eq!(derive(&i), WearableStatus::BluetoothUnavailable);
    }

    #[test]
    fn paired_but_unlinked_is_connecting() {
        let mut i = inputs();
        i.device = DeviceConnectionState::Connecting;
        assert_eq!(derive(&i), WearableStatus::Connecting);
        i.pairing = PairingStatus::Unpaired;
        assert_eq!(derive(&i), WearableStatus::Unpaired);
    }

    #[test]
    fn mute_precedence() {
        let mut i = inputs();
        assert_eq!(
            derive(&i),
            WearableStatus::Connected {
                battery: Some(50),
                audio: AudioStatus::Streaming
            }
        );
        i.device = DeviceConnectionState::Subscribed {
            battery: None,
            muted: Some(true),
        };
        assert_eq!(
            derive(&i),
            WearableStatus::Connected {
                battery: None,
                audio: AudioStatus::MutedOnDevice
            }
        );
        i.local_muted = true;
        assert_eq!(
            derive(&i),
            WearableStatus::Connected {
                battery: None,
                audio: AudioStatus::MutedLocally
            }
        );
    }

    #[test]
    fn display_is_compact() {
        let s = WearableStatus::Connected {
            battery: Some(80),
            audio: AudioStatus::Idle,
        };
        assert_eq!(s.to_string(), "connected (Idle, 80%)");
    }
}
