//! Speech collaborators: recognizer and synthesizer contracts.
//!
//! Recognition and synthesis engines are external. The grammar engine opens
//! a [`Recognizer`] when voice input is allowed; the session renders prompt
//! text through a [`Synthesizer`]. Both are optional. A missing recognizer
//! degrades fields to DTMF-only, a missing synthesizer drops prompt text with
//! a warning.

pub mod stub;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::audio::codec::Codec;
use crate::buffering::FrameConsumer;
use crate::error::Result;

/// One recognition result delivered by a recognizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recognition {
    pub text: String,
    /// `false` for streaming hypotheses that may still change.
    pub is_final: bool,
    pub confidence: Option<f32>,
}

impl Recognition {
    pub fn final_text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: true,
            confidence: None,
        }
    }

    pub fn partial(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: false,
            confidence: None,
        }
    }
}

/// Invoked from the recognizer's own context; must return quickly.
pub type ResultCallback = Arc<dyn Fn(Recognition) + Send + Sync>;

pub trait Recognizer: Send + Sync {
    /// Start recognising `audio` (raw frames in the channel's codec).
    fn open(
        &self,
        language: &str,
        audio: FrameConsumer,
        on_result: ResultCallback,
    ) -> Result<Box<dyn RecognitionSession>>;
}

pub trait RecognitionSession: Send {
    /// Optional vocabulary hint; engines may ignore it.
    fn hint_vocabulary(&mut self, _words: &[String]) {}

    fn close(&mut self);
}

/// Semantic type of text handed to the synthesizer (`<say-as interpret-as>`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SayAs {
    Text,
    Digits,
    Characters,
    Number,
    Date,
    Time,
    Currency,
    Phone,
}

impl SayAs {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "digits" => Self::Digits,
            "characters" | "letters" | "spell-out" => Self::Characters,
            "number" | "cardinal" | "ordinal" => Self::Number,
            "date" => Self::Date,
            "time" => Self::Time,
            "currency" => Self::Currency,
            "phone" | "telephone" => Self::Phone,
            _ => Self::Text,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Digits => "digits",
            Self::Characters => "characters",
            Self::Number => "number",
            Self::Date => "date",
            Self::Time => "time",
            Self::Currency => "currency",
            Self::Phone => "phone",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Male,
    Female,
    Neutral,
}

impl Gender {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "male" => Some(Self::Male),
            "female" => Some(Self::Female),
            "neutral" => Some(Self::Neutral),
            _ => None,
        }
    }
}

/// What a document asked for via `<voice>` and `xml:lang`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VoiceSelector {
    pub name: Option<String>,
    pub language: String,
    pub gender: Option<Gender>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceInfo {
    pub name: String,
    pub language: String,
    pub gender: Gender,
}

pub trait Synthesizer: Send + Sync {
    fn voices(&self) -> Vec<VoiceInfo>;

    /// Render `text` as raw frames in `codec`.
    fn synthesize(
        &self,
        voice: &VoiceInfo,
        text: &str,
        say_as: SayAs,
        codec: Codec,
    ) -> Result<Vec<u8>>;
}

/// Pick a voice with fallback precedence: exact name, then language and
/// gender, then language, then primary language subtag, then any voice.
pub fn select_voice<'a>(voices: &'a [VoiceInfo], sel: &VoiceSelector) -> Option<&'a VoiceInfo> {
    let lang_eq = |v: &VoiceInfo| v.language.eq_ignore_ascii_case(&sel.language);
    let primary = |lang: &str| lang.split(['-', '_']).next().unwrap_or("").to_ascii_lowercase();

    sel.name
        .as_deref()
        .and_then(|name| voices.iter().find(|v| v.name.eq_ignore_ascii_case(name)))
        .or_else(|| {
            sel.gender
                .and_then(|g| voices.iter().find(|v| lang_eq(*v) && v.gender == g))
        })
        .or_else(|| voices.iter().find(|v| lang_eq(*v)))
        .or_else(|| {
            voices
                .iter()
                .find(|v| primary(&v.language) == primary(&sel.language))
        })
        .or_else(|| voices.first())
}
