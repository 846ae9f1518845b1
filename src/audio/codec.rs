//! Audio payload decoders: PCM passthrough, G.711 mu-law, Opus.
//! `decode` never fails outward; malformed input degrades to zero-fill.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::ble::protocol::Codec;
use crate::error::CodecError;

pub trait AudioCodec: Send {
    /// Allocate decoder state. Must be called before `decode`.
    fn start(&mut self);
    /// Release decoder state. `decode` returns nothing until restarted.
    fn stop(&mut self);
    fn decode(&mut self, data: &[u8]) -> Vec<i16>;
    fn sample_rate(&self) -> u32;
}

/// Little-endian 16-bit PCM.
pub struct PcmCodec {
    sample_rate: u32,
}

impl PcmCodec {
    pub fn new(sample_rate: u32) -> Self {
        Self { sample_rate }
    }
}

impl AudioCodec for PcmCodec {
    fn start(&mut self) {}

    fn stop(&mut self) {}

    fn decode(&mut self, data: &[u8]) -> Vec<i16> {
        let mut out: Vec<i16> = data
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();
        if data.len() % 2 == 1 {
            debug!(len = data.len(), "odd pcm payload, zero-filling last sample");
            out.push(0);
        }
        out
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

/// Inverse of `PcmCodec::decode`.
pub fn pcm_encode(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

const MULAW_EXP_BASE: [i16; 8] = [0, 132, 396, 924, 1980, 4092, 8316, 16764];

const fn mulaw_expand(byte: u8) -> i16 {
    let u = !byte;
    let exponent = ((u >> 4) & 0x07) as usize;
    let mantissa = (u & 0x0f) as i16;
    let magnitude = MULAW_EXP_BASE[exponent] + (mantissa << (exponent + 3));
    if u & 0x80 != 0 {
        -magnitude
    } else {
        magnitude
    }
}

const fn build_mulaw_table() -> [i16; 256] {
    let mut table = [0i16; 256];
    let mut i = 0;
    while i < 256 {
        table[i] = mulaw_expand(i as u8);
        i += 1;
    }
    table
}

static MULAW_TABLE: [i16; 256] = build_mulaw_table();

/// G.711 mu-law, one byte per sample. Stateless.
pub struct MuLawCodec {
    sample_rate: u32,
}

impl MuLawCodec {
    pub fn new(sample_rate: u32) -> Self {
        Self { sample_rate }
    }
}

impl AudioCodec for MuLawCodec {
    fn start(&mut self) {}

    fn stop(&mut self) {}

    fn decode(&mut self, data: &[u8]) -> Vec<i16> {
        data.iter().map(|&b| MULAW_TABLE[b as usize]).collect()
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

/// One live Opus decoder instance.
pub trait OpusDecoder: Send {
    /// Decode one packet into `out`, returning the number of samples written.
    fn decode(&mut self, packet: &[u8], out: &mut [i16]) -> Result<usize, CodecError>;
}

pub type PendingDecoder = oneshot::Receiver<Result<Box<dyn OpusDecoder>, CodecError>>;

/// Platform Opus backend. Creation is asynchronous; the receiver resolves
/// once the decoder is usable.
pub trait OpusDecoderFactory: Send + Sync {
    fn create(&self, sample_rate: u32) -> PendingDecoder;
}

/// Largest Opus frame (120 ms) at 16 kHz.
const OPUS_MAX_FRAME: usize = 1920;

pub struct OpusCodec {
    sample_rate: u32,
    factory: Arc<dyn OpusDecoderFactory>,
    pending: Option<PendingDecoder>,
    decoder: Option<Box<dyn OpusDecoder>>,
    scratch: Vec<i16>,
}

impl OpusCodec {
    pub fn new(sample_rate: u32, factory: Arc<dyn OpusDecoderFactory>) -> Self {
        Self {
            sample_rate,
            factory,
            pending: None,
            decoder: None,
            scratch: vec![0; OPUS_MAX_FRAME],
        }
    }

    fn poll_ready(&mut self) {
        let Some(pending) = self.pending.as_mut() else {
            return;
        };
        match pending.try_recv() {
            Ok(Ok(decoder)) => {
                debug!(sample_rate = self.sample_rate, "opus decoder ready");
                self.decoder = Some(decoder);
                self.pending = None;
            }
            Ok(Err(e)) => {
                warn!(error = %e, "opus decoder failed to initialise");
                self.pending = None;
            }
            Err(oneshot::error::TryRecvError::Empty) => {}
            Err(oneshot::error::TryRecvError::Closed) => {
                warn!("opus decoder factory dropped the request");
                self.pending = None;
            }
        }
    }

    fn silence(&self) -> Vec<i16> {
        // one 20 ms frame
        vec![0; (self.sample_rate / 50) as usize]
    }
}

impl AudioCodec for OpusCodec {
    fn start(&mut self) {
        if self.decoder.is_some() || self.pending.is_some() {
            return;
        }
        self.pending = Some(self.factory.create(self.sample_rate));
    }

    fn stop(&mut self) {
        // drops a late-arriving decoder too
        self.pending = None;
        self.decoder = None;
    }

    fn decode(&mut self, data: &[u8]) -> Vec<i16> {
        self.poll_ready();
        let Some(decoder) = self.decoder.as_mut() else {
            return Vec::new();
        };
        match decoder.decode(data, &mut self.scratch) {
            Ok(n) => self.scratch[..n.min(self.scratch.len())].to_vec(),
            Err(e) => {
                debug!(error = %e, len = data.len(), "opus packet dropped");
                self.silence()
            }
        }
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

/// Discards the first `skip` decoded samples after every `start`.
pub struct SkipSamples<C> {
    inner: C,
    skip: usize,
    remaining: usize,
}

impl<C: AudioCodec> SkipSamples<C> {
    pub fn new(inner: C, skip: usize) -> Self {
        Self {
            inner,
            skip,
            remaining: skip,
        }
    }

    pub fn for_duration(inner: C, warmup: Duration) -> Self {
        let skip = (inner.sample_rate() as u128 * warmup.as_millis() / 1000) as usize;
        Self::new(inner, skip)
    }
}

impl<C: AudioCodec> AudioCodec for SkipSamples<C> {
    fn start(&mut self) {
        self.remaining = self.skip;
        self.inner.start();
    }

    fn stop(&mut self) {
        self.inner.stop();
    }

    fn decode(&mut self, data: &[u8]) -> Vec<i16> {
        let mut out = self.inner.decode(data);
        if self.remaining > 0 {
            let n = self.remaining.min(out.len());
            out.drain(..n);
            self.remaining -= n;
        }
        out
    }

    fn sample_rate(&self) -> u32 {
        self.inner.sample_rate()
    }
}

/// Decoder for a resolved codec, wrapped with warm-up discard.
pub fn create_codec(
    codec: Codec,
    opus: Option<&Arc<dyn OpusDecoderFactory>>,
    warmup: Duration,
) -> Result<Box<dyn AudioCodec>, CodecError> {
    let rate = codec.sample_rate();
    Ok(match codec {
        Codec::Pcm16 | Codec::Pcm8 => Box::new(SkipSamples::for_duration(PcmCodec::new(rate), warmup)),
        Codec::MuLaw16 | Codec::MuLaw8 => {
            Box::new(SkipSamples::for_duration(MuLawCodec::new(rate), warmup))
        }
        Codec::Opus16 => {
            let factory = opus.ok_or_else(|| CodecError::Unavailable(codec.to_string()))?;
            Box::new(SkipSamples::for_duration(
                OpusCodec::new(rate, Arc::clone(factory)),
                warmup,
            ))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Reference expansion from the G.711 appendix: bias-and-shift form.
    fn reference_ulaw(byte: u8) -> i16 {
        let u = !byte as i32;
        let mut t = ((u & 0x0f) << 3) + 0x84;
        t <<= (u & 0x70) >> 4;
        (if u & 0x80 != 0 { 0x84 - t } else { t - 0x84 }) as i16
    }

    #[test]
    fn pcm_round_trip() {
        let samples = [0i16, 1, -1, i16::MAX, i16::MIN, 1234, -4321];
        let mut codec = PcmCodec::new(16000);
        assert_eq!(codec.decode(&pcm_encode(&samples)), samples);
    }

    #[test]
    fn pcm_odd_length_zero_fills() {
        let mut codec = PcmCodec::new(8000);
        assert_eq!(codec.decode(&[0x01, 0x02, 0xff]), vec![0x0201, 0]);
    }

    #[test]
    fn mulaw_matches_reference_for_every_byte() {
        let mut codec = MuLawCodec::new(8000);
        let all: Vec<u8> = (0..=255).collect();
        let decoded = codec.decode(&all);
        for (b, s) in all.iter().zip(decoded) {
            assert_eq!(s, reference_ulaw(*b), "byte {b:#04x}");
        }
        assert_eq!(MULAW_TABLE[0x00], -32124);
        assert_eq!(MULAW_TABLE[0x80], 32124);
        assert_eq!(MULAW_TABLE[0xff], 0);
        assert_eq!(MULAW_TABLE[0x7f], 0);
    }

    #[test]
    fn skip_discards_across_packets_and_rearms_on_start() {
        let mut codec = SkipSamples::new(PcmCodec::new(16000), 3);
        codec.start();
        assert!(codec.decode(&pcm_encode(&[1, 2])).is_empty());
        assert_eq!(codec.decode(&pcm_encode(&[3, 4, 5])), vec![4, 5]);
        codec.stop();
        codec.start();
        assert_eq!(codec.decode(&pcm_encode(&[6, 7, 8, 9])), vec![9]);
    }

    #[test]
    fn warmup_scales_with_rate() {
        let c = SkipSamples::for_duration(MuLawCodec::new(8000), Duration::from_millis(200));
        assert_eq!(c.skip, 1600);
        let c = SkipSamples::for_duration(PcmCodec::new(16000), Duration::from_millis(200));
        assert_eq!(c.skip, 3200);
    }

    struct Doubling;

    impl OpusDecoder for Doubling {
        fn decode(&mut self, packet: &[u8], out: &mut [i16]) -> Result<usize, CodecError> {
            if packet.is_empty() {
                return Err(CodecError::Malformed("empty".into()));
            }
            for (i, b) in packet.iter().enumerate() {
                out[i] = *b as i16 * 2;
            }
            Ok(packet.len())
        }
    }

    struct ManualFactory {
        tx: parking_lot::Mutex<Option<oneshot::Sender<Result<Box<dyn OpusDecoder>, CodecError>>>>,
    }

    impl OpusDecoderFactory for ManualFactory {
        fn create(&self, _sample_rate: u32) -> PendingDecoder {
            let (tx, rx) = oneshot::channel();
            *self.tx.lock() = Some(tx);
            rx
        }
    }

    #[test]
    fn opus_returns_nothing_until_ready() {
        let factory = Arc::new(ManualFactory {
            tx: parking_lot::Mutex::new(None),
        });
        let mut codec = OpusCodec::new(16000, factory.clone());
        assert!(codec.decode(&[1, 2]).is_empty());
        codec.start();
        assert!(codec.decode(&[1, 2]).is_empty());

        let tx = factory.tx.lock().take().unwrap();
        assert!(tx.send(Ok(Box::new(Doubling))).is_ok());
        assert_eq!(codec.decode(&[1, 2]), vec![2, 4]);
        // malformed packet → 20 ms of silence
        assert_eq!(codec.decode(&[]), vec![0; 320]);

        codec.stop();
        assert!(codec.decode(&[1]).is_empty());
    }

    #[test]
    fn opus_without_backend_is_unavailable() {
        assert!(matches!(
            create_codec(Codec::Opus16, None, Duration::ZERO),
            Err(CodecError::Unavailable(_))
        ));
        assert!(create_codec(Codec::MuLaw8, None, Duration::ZERO).is_ok());
    }
}
