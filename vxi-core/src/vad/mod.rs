//! Voice activity detection for recordings.
//!
//! Used to end a `<record>` after `finalsilence` of quiet audio. The
//! [`VoiceActivityDetector`] trait lets hosts plug in a smarter detector
//! without touching the channel.

pub mod energy;

pub use energy::EnergyVad;

/// Whether a given audio frame contains speech or silence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadDecision {
    Speech,
    /// Below threshold and past the hangover window.
    Silence,
}

impl VadDecision {
    pub fn is_speech(self) -> bool {
        self == VadDecision::Speech
    }
}

/// Implementors may be stateful (hangover counters and the like).
pub trait VoiceActivityDetector: Send + 'static {
    /// Classify one frame of 16-bit linear PCM.
    fn classify(&mut self, samples: &[i16]) -> VadDecision;

    fn reset(&mut self);
}

/// Decode little-endian 16-bit PCM bytes. A trailing odd byte is ignored.
pub fn pcm16_samples(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect()
}
