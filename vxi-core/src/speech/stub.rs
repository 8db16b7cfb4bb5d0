//! Stub speech backends for development and tests.
//!
//! `StubSynthesizer` renders each word as a short tone so prompt timing is
//! realistic without a real TTS engine. `StubRecognizer` never listens to the
//! audio it is handed; results are injected by the host or a test.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use super::{
    Gender, Recognition, RecognitionSession, Recognizer, ResultCallback, SayAs, Synthesizer,
    VoiceInfo,
};
use crate::audio::{Codec, PlayableItem, PlayableSource};
use crate::buffering::FrameConsumer;
use crate::error::Result;

const WORD_MS: u64 = 120;
const FRAME_INTERVAL: Duration = Duration::from_millis(20);

/// Tone-per-word synthesizer with a single `en-US` voice.
#[derive(Debug, Default)]
pub struct StubSynthesizer {
    calls: AtomicUsize,
}

impl StubSynthesizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

impl Synthesizer for StubSynthesizer {
    fn voices(&self) -> Vec<VoiceInfo> {
        vec![VoiceInfo {
            name: "stub".into(),
            language: "en-US".into(),
            gender: Gender::Neutral,
        }]
    }

    fn synthesize(&self, voice: &VoiceInfo, text: &str, say_as: SayAs, codec: Codec) -> Result<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        // Digits and characters are spoken one symbol at a time.
        let units = match say_as {
            SayAs::Digits | SayAs::Characters => text.chars().filter(|c| !c.is_whitespace()).count(),
            _ => text.split_whitespace().count(),
        };
        let duration = Duration::from_millis(WORD_MS * units as u64);
        let source = if codec.is_linear() {
            PlayableSource::Tone {
                frequencies: vec![440.0],
                duration,
                amplitude: 0.1,
            }
        } else {
            PlayableSource::silence(duration)
        };
        let mut item = PlayableItem::new(source);
        item.on_start(codec, FRAME_INTERVAL)?;
        let mut out = Vec::new();
        let mut frame = Vec::new();
        while item.next_frame(&mut frame)? {
            out.extend_from_slice(&frame);
        }
        item.on_stop();
        debug!(voice = %voice.name, say_as = say_as.as_str(), units, bytes = out.len(), "stub synthesis");
        Ok(out)
    }
}

#[derive(Default)]
struct RecognizerShared {
    callback: Mutex<Option<ResultCallback>>,
    hints: Mutex<Vec<String>>,
    opens: AtomicUsize,
    closes: AtomicUsize,
}

/// Recognizer whose results come from [`StubRecognizer::inject`].
#[derive(Clone, Default)]
pub struct StubRecognizer {
    shared: Arc<RecognizerShared>,
}

impl std::fmt::Debug for StubRecognizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StubRecognizer")
            .field("opens", &self.opens())
            .finish_non_exhaustive()
    }
}

impl StubRecognizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver a result to the open session. Returns false when none is open.
    pub fn inject(&self, result: Recognition) -> bool {
        let callback = self.shared.callback.lock().clone();
        match callback {
            Some(cb) => {
                cb(result);
                true
            }
            None => false,
        }
    }

    pub fn is_open(&self) -> bool {
        self.shared.callback.lock().is_some()
    }

    pub fn opens(&self) -> usize {
        self.shared.opens.load(Ordering::Relaxed)
    }

    pub fn closes(&self) -> usize {
        self.shared.closes.load(Ordering::Relaxed)
    }

    pub fn hints(&self) -> Vec<String> {
        self.shared.hints.lock().clone()
    }
}

impl Recognizer for StubRecognizer {
    fn open(
        &self,
        language: &str,
        _audio: FrameConsumer,
        on_result: ResultCallback,
    ) -> Result<Box<dyn RecognitionSession>> {
        debug!(language, "stub recognizer opened");
        self.shared.opens.fetch_add(1, Ordering::Relaxed);
        *self.shared.callback.lock() = Some(on_result);
        Ok(Box::new(StubSession {
            shared: Arc::clone(&self.shared),
        }))
    }
}

struct StubSession {
    shared: Arc<RecognizerShared>,
}

impl RecognitionSession for StubSession {
    fn hint_vocabulary(&mut self, words: &[String]) {
        *self.shared.hints.lock() = words.to_vec();
    }

    fn close(&mut self) {
        self.shared.closes.fetch_add(1, Ordering::Relaxed);
        *self.shared.callback.lock() = None;
    }
}
