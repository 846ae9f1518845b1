//! Protocol resolution: which hardware variant a connected device speaks.
//! Resolvers run in fixed priority order ("super" before "compass"); the
//! first match wins. Recomputed on every connection, never persisted.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::uuids::*;
use super::{find_characteristic, BleDevice, GattCharacteristic};
use crate::error::BleError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolKind {
    Super,
    Compass,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Codec {
    #[serde(rename = "pcm-16")]
    Pcm16,
    #[serde(rename = "pcm-8")]
    Pcm8,
    #[serde(rename = "mulaw-16")]
    MuLaw16,
    #[serde(rename = "mulaw-8")]
    MuLaw8,
    #[serde(rename = "opus-16")]
    Opus16,
}

impl Codec {
    /// Codec-selector byte → codec. `None` for bytes outside the table.
    pub fn from_selector(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Codec::Pcm16),
            1 => Some(Codec::Pcm8),
            10 => Some(Codec::MuLaw16),
            11 => Some(Codec::MuLaw8),
            20 => Some(Codec::Opus16),
            _ => None,
        }
    }

    pub fn sample_rate(self) -> u32 {
        match self {
            Codec::Pcm8 | Codec::MuLaw8 => 8000,
            Codec::Pcm16 | Codec::MuLaw16 | Codec::Opus16 => 16000,
        }
    }
}

impl std::fmt::Display for Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Codec::Pcm16 => "pcm-16",
            Codec::Pcm8 => "pcm-8",
            Codec::MuLaw16 => "mulaw-16",
            Codec::MuLaw8 => "mulaw-8",
            Codec::Opus16 => "opus-16",
        };
        f.write_str(s)
    }
}

/// Resolved contract without the characteristic handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProtocolInfo {
    pub kind: ProtocolKind,
    pub codec: Codec,
    pub sample_rate: u32,
}

#[derive(Clone)]
pub struct ProtocolDefinition {
    pub kind: ProtocolKind,
    pub codec: Codec,
    pub sample_rate: u32,
    pub source: Arc<dyn GattCharacteristic>,
}

impl ProtocolDefinition {
    pub fn info(&self) -> ProtocolInfo {
        ProtocolInfo {
            kind: self.kind,
            codec: self.codec,
            sample_rate: self.sample_rate,
        }
    }
}

impl std::fmt::Debug for ProtocolDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolDefinition")
            .field("kind", &self.kind)
            .field("codec", &self.codec)
            .field("sample_rate", &self.sample_rate)
            .field("source", &self.source.uuid())
            .finish()
    }
}

#[async_trait]
trait Resolver: Sync {
    fn kind(&self) -> ProtocolKind;
    /// `Ok(None)` = not this variant, try the next one. `Err` = the device
    /// stopped answering.
    async fn resolve(&self, device: &dyn BleDevice) -> Result<Option<ProtocolDefinition>, BleError>;
}

struct SuperResolver;

#[async_trait]
impl Resolver for SuperResolver {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Super
    }

    async fn resolve(&self, device: &dyn BleDevice) -> Result<Option<ProtocolDefinition>, BleError> {
        let Some(audio) = find_characteristic(device, SUPER_SERVICE, SUPER_AUDIO) else {
            return Ok(None);
        };
        let Some(codec_char) = find_characteristic(device, SUPER_SERVICE, SUPER_CODEC) else {
            return Ok(None);
        };
        let raw = codec_char.read().await?;
        let Some(&selector) = raw.first() else {
            warn!("empty codec selector read");
            return Ok(None);
        };
        let Some(codec) = Codec::from_selector(selector) else {
            warn!(selector, "unknown codec selector");
            return Ok(None);
        };
        Ok(Some(ProtocolDefinition {
            kind: ProtocolKind::Super,
            codec,
            sample_rate: codec.sample_rate(),
            source: audio,
        }))
    }
}

struct CompassResolver;

#[async_trait]
impl Resolver for CompassResolver {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Compass
    }

    async fn resolve(&self, device: &dyn BleDevice) -> Result<Option<ProtocolDefinition>, BleError> {
        let Some(audio) = find_characteristic(device, COMPASS_SERVICE, COMPASS_AUDIO) else {
            return Ok(None);
        };
        // Both auxiliaries must be present; the service UUID alone collides
        // with unrelated UART bridges.
        if find_characteristic(device, COMPASS_SERVICE, COMPASS_CONTROL).is_none()
            || find_characteristic(device, COMPASS_SERVICE, COMPASS_VOLTAGE).is_none()
        {
            debug!("compass service without auxiliary characteristics");
            return Ok(None);
        }
        Ok(Some(ProtocolDefinition {
            kind: ProtocolKind::Compass,
            codec: Codec::Pcm8,
            sample_rate: 8000,
            source: audio,
        }))
    }
}

static RESOLVERS: &[&dyn Resolver] = &[&SuperResolver, &CompassResolver];

/// Resolve the protocol of a connected device. `Ok(None)` means unsupported;
/// callers must not retry with a different strategy.
pub async fn resolve_protocol(device: &dyn BleDevice) -> Result<Option<ProtocolDefinition>, BleError> {
    for resolver in RESOLVERS {
        if let Some(def) = resolver.resolve(device).await? {
            info!(
                device_id = %device.id(),
                kind = ?resolver.kind(),
                codec = %def.codec,
                sample_rate = def.sample_rate,
                "protocol_resolved"
            );
            return Ok(Some(def));
        }
    }
    info!(device_id = %device.id(), "no protocol resolver matched");
    Ok(None)
}
