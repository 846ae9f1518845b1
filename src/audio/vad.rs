//! Voice activity scoring.
//! The endpointing engine treats the scorer as opaque: one probability in
//! [0, 1] per fixed-width frame of normalized samples.

use async_trait::async_trait;

/// Frame width expected by the scorer at each supported sample rate.
pub fn frame_size(sample_rate: u32) -> Option<usize> {
    match sample_rate {
        16000 => Some(1536),
        8000 => Some(768),
        _ => None,
    }
}

#[async_trait]
pub trait VadScorer: Send {
    async fn start(&mut self, sample_rate: u32);
    /// Voice probability for one frame of samples in [-1, 1].
    async fn process(&mut self, frame: &[f32]) -> f32;
    async fn stop(&mut self);
}

/// RMS of a frame of normalized samples.
#[inline]
pub fn compute_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples
        .iter()
        .map(|&s| {
            let f = s as f64;
            f * f
        })
        .sum();
    (sum / samples.len() as f64).sqrt() as f32
}

#[inline]
pub fn to_f32(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&s| s as f32 / 32768.0).collect()
}

/// Energy-gated fallback scorer for hosts without a neural model. Maps RMS
/// linearly from `floor` (probability 0) to `ceiling` (probability 1).
pub struct EnergyScorer {
    floor: f32,
    ceiling: f32,
}

impl Default for EnergyScorer {
    fn default() -> Self {
        // ~ -50 dBFS .. -26 dBFS
        Self {
            floor: 0.003,
            ceiling: 0.05,
        }
    }
}

impl EnergyScorer {
    pub fn new(floor: f32, ceiling: f32) -> Self {
        Self { floor, ceiling }
    }
}

#[async_trait]
impl VadScorer for EnergyScorer {
    async fn start(&mut self, _sample_rate: u32) {}

    async fn process(&mut self, frame: &[f32]) -> f32 {
        let rms = compute_rms(frame);
        ((rms - self.floor) / (self.ceiling - self.floor)).clamp(0.0, 1.0)
    }

    async fn stop(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn energy_scorer_separates_tone_from_silence() {
        let mut s = EnergyScorer::default();
        s.start(16000).await;
        let silence = vec![0.0f32; 1536];
        let tone: Vec<f32> = (0..1536).map(|i| if i % 2 == 0 { 0.3 } else { -0.3 }).collect();
        assert_eq!(s.process(&silence).await, 0.0);
        assert_eq!(s.process(&tone).await, 1.0);
    }

    #[test]
    fn rms_and_frame_sizes() {
        assert!((compute_rms(&[0.5, -0.5]) - 0.5).abs() < 1e-6);
        assert_eq!(frame_size(16000), Some(1536));
        assert_eq!(frame_size(8000), Some(768));
        assert_eq!(frame_size(44100), None);
        assert_eq!(to_f32(&[-32768]), vec![-1.0]);
    }
}
