//! Audio path: BLE notifications → frames → PCM → speech segments.
//!
//! `FrameDecoder` owns reassembly and the codec for one streaming session;
//! the controller feeds it raw notifications only while audio is unmuted.

pub mod codec;
pub mod endpointing;
pub mod packet;
pub mod vad;
pub mod wav;

use tracing::debug;

use codec::AudioCodec;
use packet::{FrameAssembler, Framing};

use crate::ble::protocol::ProtocolInfo;

pub struct FrameDecoder {
    info: ProtocolInfo,
    assembler: FrameAssembler,
    codec: Box<dyn AudioCodec>,
    running: bool,
}

impl FrameDecoder {
    pub fn new(info: ProtocolInfo, codec: Box<dyn AudioCodec>) -> Self {
        Self {
            info,
            assembler: FrameAssembler::new(Framing::from(info.kind)),
            codec,
            running: false,
        }
    }

    pub fn info(&self) -> ProtocolInfo {
        self.info
    }

    pub fn sample_rate(&self) -> u32 {
        self.codec.sample_rate()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn start(&mut self) {
        if self.running {
            return;
        }
        self.codec.start();
        self.running = true;
        debug!(codec = %self.info.codec, "decoder_started");
    }

    /// Decode any remaining partial frame, then release the codec.
    pub fn stop(&mut self) -> Vec<i16> {
        if !self.running {
            return Vec::new();
        }
        let tail = self
            .assembler
            .flush()
            .map(|frame| self.codec.decode(&frame))
            .unwrap_or_default();
        self.codec.stop();
        self.running = false;
        debug!(codec = %self.info.codec, dropped = self.assembler.dropped(), "decoder_stopped");
        tail
    }

    /// Feed one notification; returns decoded PCM for any frame it completed.
    pub fn push(&mut self, notification: &[u8]) -> Vec<i16> {
        if !self.running {
            return Vec::new();
        }
        match self.assembler.push(notification) {
            Some(frame) => self.codec.decode(&frame),
            None => Vec::new(),
        }
    }
}
