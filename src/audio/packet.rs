//! BLE notification reassembly.
//!
//! "super" devices split each codec frame across notifications, each with a
//! 3-byte header: `u16` LE packet counter, `u8` fragment index. Fragment 0
//! opens a frame; the next fragment 0 closes it. A skipped fragment or a
//! foreign counter drops the partial frame. "compass" notifications are
//! headerless, one frame each.

use tracing::debug;

use crate::ble::protocol::ProtocolKind;

const HEADER_LEN: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    Fragmented,
    Whole,
}

impl From<ProtocolKind> for Framing {
    fn from(kind: ProtocolKind) -> Self {
        match kind {
            ProtocolKind::Super => Framing::Fragmented,
            ProtocolKind::Compass => Framing::Whole,
        }
    }
}

struct Partial {
    counter: u16,
    next_index: u8,
    data: Vec<u8>,
}

pub struct FrameAssembler {
    framing: Framing,
    partial: Option<Partial>,
    dropped: u64,
}

impl FrameAssembler {
    pub fn new(framing: Framing) -> Self {
        Self {
            framing,
            partial: None,
            dropped: 0,
        }
    }

    /// Feed one notification. Returns the frame it completed, if any.
    pub fn push(&mut self, notification: &[u8]) -> Option<Vec<u8>> {
        if self.framing == Framing::Whole {
            return (!notification.is_empty()).then(|| notification.to_vec());
        }
        if notification.len() < HEADER_LEN {
            debug!(len = notification.len(), "runt notification dropped");
            return None;
        }
        let counter = u16::from_le_bytes([notification[0], notification[1]]);
        let index = notification[2];
        let payload = &notification[HEADER_LEN..];

        if index == 0 {
            let done = self.partial.take().map(|p| p.data);
            self.partial = Some(Partial {
                counter,
                next_index: 1,
                data: payload.to_vec(),
            });
            return done;
        }

        match self.partial.as_mut() {
            Some(p) if p.counter == counter && p.next_index == index => {
                p.data.extend_from_slice(payload);
                p.next_index = p.next_index.wrapping_add(1);
            }
            Some(p) => {
                debug!(
                    expected_counter = p.counter,
                    expected_index = p.next_index,
                    counter,
                    index,
                    "fragment gap, dropping partial frame"
                );
                self.partial = None;
                self.dropped += 1;
            }
            None => {
                debug!(counter, index, "orphan fragment dropped");
                self.dropped += 1;
            }
        }
        None
    }

    /// Emit the pending frame (stream stop).
    pub fn flush(&mut self) -> Option<Vec<u8>> {
        self.partial.take().map(|p| p.data)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
