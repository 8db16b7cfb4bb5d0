//! Energy-based VAD using an RMS threshold plus a hangover counter.
//!
//! 1. Compute the normalised RMS of the frame.
//! 2. At or above `threshold`: `Speech`, hangover re-armed.
//! 3. Below threshold with hangover left: `Speech`, counter decremented.
//! 4. Otherwise `Silence`.

use super::{VadDecision, VoiceActivityDetector};

#[derive(Debug, Clone)]
pub struct EnergyVad {
    /// Normalised RMS (0..1) above which a frame counts as speech.
    threshold: f32,
    hangover_frames: u32,
    hangover_counter: u32,
}

impl EnergyVad {
    pub fn new(threshold: f32, hangover_frames: u32) -> Self {
        Self {
            threshold,
            hangover_frames,
            hangover_counter: 0,
        }
    }

    fn rms(samples: &[i16]) -> f32 {
        if samples.is_empty() {
            return 0.0;
        }
        let sum_sq: f32 = samples
            .iter()
            .map(|&s| {
                let v = s as f32 / 32768.0;
                v * v
            })
            .sum();
        (sum_sq / samples.len() as f32).sqrt()
    }
}

impl Default for EnergyVad {
    fn default() -> Self {
        Self::new(0.02, 2)
    }
}

impl VoiceActivityDetector for EnergyVad {
    fn classify(&mut self, samples: &[i16]) -> VadDecision {
        if Self::rms(samples) >= self.threshold {
            self.hangover_counter = self.hangover_frames;
            VadDecision::Speech
        } else if self.hangover_counter > 0 {
            self.hangover_counter -= 1;
            VadDecision::Speech
        } else {
            VadDecision::Silence
        }
    }

    fn reset(&mut self) {
        self.hangover_counter = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn loud(len: usize) -> Vec<i16> {
        vec![16384; len]
    }

    #[test]
    fn silence_and_speech() {
        let mut vad = EnergyVad::new(0.02, 0);
        assert_eq!(vad.classify(&[0; 160]), VadDecision::Silence);
        assert_eq!(vad.classify(&loud(160)), VadDecision::Speech);
    }

    #[test]
    fn hangover_extends_speech() {
        let mut vad = EnergyVad::new(0.02, 2);
        assert!(vad.classify(&loud(160)).is_speech());
        assert!(vad.classify(&[0; 160]).is_speech());
        assert!(vad.classify(&[0; 160]).is_speech());
        assert_eq!(vad.classify(&[0; 160]), VadDecision::Silence);
    }

    #[test]
    fn reset_clears_hangover() {
        let mut vad = EnergyVad::new(0.02, 5);
        vad.classify(&loud(160));
        vad.reset();
        assert_eq!(vad.classify(&[0; 160]), VadDecision::Silence);
    }

    #[test]
    fn rms_of_square_wave() {
        let samples: Vec<i16> = (0..256)
            .map(|i| if i % 2 == 0 { 16384 } else { -16384 })
            .collect();
        assert_relative_eq!(EnergyVad::rms(&samples), 0.5, epsilon = 1e-5);
        assert_eq!(EnergyVad::rms(&[]), 0.0);
    }

    #[test]
    fn pcm16_decoding_ignores_trailing_byte() {
        assert_eq!(super::super::pcm16_samples(&[0x01, 0x00, 0xff, 0xff, 0x7f]), vec![1, -1]);
    }
}
