//! `<record>` capture: writes inbound frames to a file until a stop condition.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::codec::Codec;
use crate::error::{Result, VxiError};
use crate::vad::{pcm16_samples, EnergyVad, VoiceActivityDetector};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopReason {
    MaxTime,
    FinalSilence,
    Dtmf,
    Hangup,
    Explicit,
    Error,
}

#[derive(Debug, Clone)]
pub struct RecordSettings {
    pub path: PathBuf,
    pub max_time: Option<Duration>,
    /// Quiet time after speech that ends the recording. Linear16 only.
    pub final_silence: Option<Duration>,
    /// Any DTMF key stops the recording.
    pub dtmf_term: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingSummary {
    pub path: PathBuf,
    pub duration_ms: u64,
    pub bytes: u64,
    pub reason: StopReason,
    pub terminator: Option<char>,
}

enum Sink {
    Wav(hound::WavWriter<BufWriter<File>>),
    Raw(BufWriter<File>),
}

pub struct Recording {
    settings: RecordSettings,
    sink: Sink,
    interval: Duration,
    frames: u64,
    bytes: u64,
    vad: Option<Box<dyn VoiceActivityDetector>>,
    heard_speech: bool,
    quiet: Duration,
    pending: Option<StopReason>,
    terminator: Option<char>,
}

impl std::fmt::Debug for Recording {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Recording")
            .field("path", &self.settings.path)
            .field("frames", &self.frames)
            .field("pending", &self.pending)
            .finish_non_exhaustive()
    }
}

impl Recording {
    pub fn start(settings: RecordSettings, codec: Codec, interval: Duration) -> Result<Self> {
        let sink = if codec.is_linear() {
            let spec = hound::WavSpec {
                channels: 1,
                sample_rate: codec.sample_rate(),
                bits_per_sample: 16,
                sample_format: hound::SampleFormat::Int,
            };
            let writer = hound::WavWriter::create(&settings.path, spec)
                .map_err(|e| VxiError::Media(format!("create {}: {e}", settings.path.display())))?;
            Sink::Wav(writer)
        } else {
            Sink::Raw(BufWriter::new(File::create(&settings.path)?))
        };
        let vad = (codec.is_linear() && settings.final_silence.is_some())
            .then(|| Box::new(EnergyVad::default()) as Box<dyn VoiceActivityDetector>);
        info!(path = %settings.path.display(), codec = codec.name(), "recording started");
        Ok(Self {
            settings,
            sink,
            interval,
            frames: 0,
            bytes: 0,
            vad,
            heard_speech: false,
            quiet: Duration::ZERO,
            pending: None,
            terminator: None,
        })
    }

    pub fn elapsed(&self) -> Duration {
        self.interval * self.frames as u32
    }

    pub fn pending_stop(&self) -> Option<StopReason> {
        self.pending
    }

    /// Append one inbound frame and re-evaluate stop conditions.
    pub fn write(&mut self, frame: &[u8]) -> Result<()> {
        if self.pending.is_some() {
            return Ok(());
        }
        match &mut self.sink {
            Sink::Wav(writer) => {
                for s in pcm16_samples(frame) {
                    writer
                        .write_sample(s)
                        .map_err(|e| VxiError::Media(format!("wav write: {e}")))?;
                }
            }
            Sink::Raw(out) => out.write_all(frame)?,
        }
        self.frames += 1;
        self.bytes += frame.len() as u64;

        if let Some(vad) = self.vad.as_mut() {
            if vad.classify(&pcm16_samples(frame)).is_speech() {
                self.heard_speech = true;
                self.quiet = Duration::ZERO;
            } else if self.heard_speech {
                self.quiet += self.interval;
            }
        }
        if self
            .settings
            .max_time
            .map_or(false, |max| self.elapsed() >= max)
        {
            self.pending = Some(StopReason::MaxTime);
        } else if self
            .settings
            .final_silence
            .map_or(false, |fs| self.heard_speech && self.quiet >= fs)
        {
            self.pending = Some(StopReason::FinalSilence);
        }
        Ok(())
    }

    /// Returns true when the key terminates the recording.
    pub fn on_dtmf(&mut self, key: char) -> bool {
        if !self.settings.dtmf_term || self.pending.is_some() {
            return false;
        }
        self.pending = Some(StopReason::Dtmf);
        self.terminator = Some(key);
        true
    }

    /// Close the file. `reason` is used when no stop condition fired.
    pub fn finish(self, reason: StopReason) -> Result<RecordingSummary> {
        let reason = self.pending.unwrap_or(reason);
        let duration_ms = self.elapsed().as_millis() as u64;
        match self.sink {
            Sink::Wav(writer) => writer
                .finalize()
                .map_err(|e| VxiError::Media(format!("wav finalize: {e}")))?,
            Sink::Raw(mut out) => out.flush()?,
        }
        debug!(path = %self.settings.path.display(), ?reason, duration_ms, "recording finished");
        Ok(RecordingSummary {
            path: self.settings.path,
            duration_ms,
            bytes: self.bytes,
            reason,
            terminator: self.terminator,
        })
    }
}
