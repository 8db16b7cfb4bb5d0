//! Input grammar state machines.
//!
//! ## Lifecycle
//!
//! ```text
//! Idle ──start()──► Started ──┬──► PartFill ──┬──► Filled
//!                             │               └──► NoMatch
//!                             ├──► Filled
//!                             ├──► NoInput
//!                             └──► NoMatch
//! ```
//!
//! State only moves forward. The single exception is [`Grammar::restart`],
//! issued by the session, which returns the grammar to `Idle`.
//!
//! Input is routed only while `Started`/`PartFill`. Terminal states are
//! consumed by the session (`Process()`), which writes the value, marks the
//! field filled and dispatches `filled`/`noinput`/`nomatch` handlers.

pub mod builtin;
pub mod rule;

use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::buffering::FrameConsumer;
use crate::document::NodeId;
use crate::error::Result;
use crate::speech::{Recognition, RecognitionSession, Recognizer, ResultCallback};

pub use builtin::parse_builtin;
pub use rule::{RuleCursor, RuleGrammar};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GrammarState {
    Idle,
    Started,
    PartFill,
    Filled,
    NoInput,
    NoMatch,
    BadFetch,
    Illegal,
}

impl GrammarState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Filled | Self::NoInput | Self::NoMatch | Self::BadFetch | Self::Illegal
        )
    }

    pub fn is_active(self) -> bool {
        matches!(self, Self::Started | Self::PartFill)
    }

    /// Forward-only transition table.
    pub fn can_advance_to(self, next: GrammarState) -> bool {
        use GrammarState::*;
        match self {
            Idle => matches!(next, Started | BadFetch | Illegal),
            Started => matches!(next, Started | PartFill | Filled | NoInput | NoMatch),
            PartFill => matches!(next, PartFill | Filled | NoMatch),
            Filled | NoInput | NoMatch | BadFetch | Illegal => false,
        }
    }
}

/// One unit of caller input.
#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    Dtmf(char),
    Speech(Recognition),
}

/// Allowed input modalities (`inputmodes` property).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputModes {
    pub dtmf: bool,
    pub voice: bool,
}

impl InputModes {
    pub const DTMF_ONLY: Self = Self {
        dtmf: true,
        voice: false,
    };
    pub const BOTH: Self = Self {
        dtmf: true,
        voice: true,
    };

    /// Parse a whitespace-separated list such as `"dtmf voice"`.
    pub fn parse(raw: &str) -> Self {
        let mut modes = Self {
            dtmf: false,
            voice: false,
        };
        for word in raw.split_whitespace() {
            match word.to_ascii_lowercase().as_str() {
                "dtmf" => modes.dtmf = true,
                "voice" => modes.voice = true,
                _ => {}
            }
        }
        modes
    }
}

impl Default for InputModes {
    fn default() -> Self {
        Self::BOTH
    }
}

impl fmt::Display for InputModes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.dtmf, self.voice) {
            (true, true) => f.write_str("dtmf voice"),
            (true, false) => f.write_str("dtmf"),
            (false, true) => f.write_str("voice"),
            (false, false) => f.write_str("none"),
        }
    }
}

/// The grammar variants.
#[derive(Debug, Clone, PartialEq)]
pub enum GrammarKind {
    Digits { min: usize, max: Option<usize> },
    Boolean { yes: Vec<char>, no: Vec<char> },
    /// Choice resolution happens when the session processes the result.
    Menu { phrases: Vec<String> },
    Text,
    Rule(RuleGrammar),
}

impl GrammarKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Digits { .. } => "digits",
            Self::Boolean { .. } => "boolean",
            Self::Menu { .. } => "menu",
            Self::Text => "text",
            Self::Rule(_) => "rule",
        }
    }

    fn accepts_dtmf(&self) -> bool {
        !matches!(self, Self::Text)
    }

    fn vocabulary(&self) -> Vec<String> {
        match self {
            Self::Boolean { .. } => ["yes", "no", "true", "false"].map(String::from).to_vec(),
            Self::Menu { phrases } => phrases.clone(),
            Self::Rule(rule) => rule.vocabulary(),
            Self::Digits { .. } | Self::Text => Vec::new(),
        }
    }
}

/// What a grammar needs to open a recognizer on start.
pub struct VoiceInput<'a> {
    pub recognizer: &'a dyn Recognizer,
    pub language: &'a str,
    pub audio: FrameConsumer,
    pub on_result: ResultCallback,
}

/// One live grammar, identified by the field node that owns it.
pub struct Grammar {
    field: NodeId,
    kind: GrammarKind,
    state: GrammarState,
    value: String,
    terminators: Vec<char>,
    timeout: Duration,
    deadline: Option<Instant>,
    modes: InputModes,
    cursor: Option<RuleCursor>,
    recognition: Option<Box<dyn RecognitionSession>>,
}

impl fmt::Debug for Grammar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Grammar")
            .field("field", &self.field)
            .field("kind", &self.kind.name())
            .field("state", &self.state)
            .field("value", &self.value)
            .finish_non_exhaustive()
    }
}

impl Grammar {
    pub fn new(field: NodeId, kind: GrammarKind, terminators: Vec<char>, timeout: Duration) -> Self {
        Self {
            field,
            kind,
            state: GrammarState::Idle,
            value: String::new(),
            terminators,
            timeout,
            deadline: None,
            modes: InputModes::DTMF_ONLY,
            cursor: None,
            recognition: None,
        }
    }

    /// A grammar whose source could not be fetched or parsed.
    pub fn failed(field: NodeId, state: GrammarState) -> Self {
        let mut g = Self::new(field, GrammarKind::Text, Vec::new(), Duration::ZERO);
        if g.state.can_advance_to(state) && state.is_terminal() {
            g.state = state;
        }
        g
    }

    pub fn field(&self) -> NodeId {
        self.field
    }

    pub fn kind(&self) -> &GrammarKind {
        &self.kind
    }

    pub fn state(&self) -> GrammarState {
        self.state
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn modes(&self) -> InputModes {
        self.modes
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn uses_voice(&self) -> bool {
        self.recognition.is_some()
    }

    /// `Idle → Started`; a no-op in any other state.
    ///
    /// Voice is used only if requested and a recognizer opens; otherwise the
    /// grammar falls back to DTMF-only. A grammar left with no usable
    /// modality becomes `Illegal`.
    pub fn start(
        &mut self,
        now: Instant,
        requested: InputModes,
        voice: Option<VoiceInput<'_>>,
    ) -> GrammarState {
        if self.state != GrammarState::Idle {
            return self.state;
        }
        let mut modes = requested;
        modes.dtmf &= self.kind.accepts_dtmf();
        if modes.voice {
            match voice.map(|v| self.open_recognizer(v)) {
                Some(Ok(session)) => self.recognition = Some(session),
                Some(Err(e)) => {
                    warn!(error = %e, grammar = self.kind.name(), "recognizer failed to open; dtmf only");
                    modes.voice = false;
                }
                None => {
                    debug!(grammar = self.kind.name(), "no recognizer available; dtmf only");
                    modes.voice = false;
                }
            }
            if !modes.voice && self.kind.accepts_dtmf() {
                modes.dtmf = true;
            }
        }
        if !modes.dtmf && !modes.voice {
            self.advance(GrammarState::Illegal);
            return self.state;
        }
        self.modes = modes;
        self.cursor = match &self.kind {
            GrammarKind::Rule(rule) => Some(rule.cursor()),
            _ => None,
        };
        self.deadline = Some(now + self.timeout);
        self.advance(GrammarState::Started);
        debug!(grammar = self.kind.name(), modes = %self.modes, "grammar started");
        self.state
    }

    fn open_recognizer(&self, voice: VoiceInput<'_>) -> Result<Box<dyn RecognitionSession>> {
        let mut session = voice
            .recognizer
            .open(voice.language, voice.audio, voice.on_result)?;
        let words = self.kind.vocabulary();
        if !words.is_empty() {
            session.hint_vocabulary(&words);
        }
        Ok(session)
    }

    /// Push the no-input deadline out to `now + timeout` (prompts finished,
    /// or more input arrived).
    pub fn arm(&mut self, now: Instant) {
        if self.state.is_active() {
            self.deadline = Some(now + self.timeout);
        }
    }

    /// Feed one input. Returns the state after the input.
    pub fn on_input(&mut self, input: &Input, now: Instant) -> GrammarState {
        if !self.state.is_active() {
            return self.state;
        }
        let next = match input {
            Input::Dtmf(_) if !self.modes.dtmf => None,
            Input::Speech(_) if !self.modes.voice => None,
            Input::Dtmf(symbol) => self.on_symbol(*symbol),
            Input::Speech(rec) => self.on_recognition(rec),
        };
        if let Some(next) = next {
            self.deadline = Some(now + self.timeout);
            self.advance(next);
        }
        self.state
    }

    fn on_symbol(&mut self, symbol: char) -> Option<GrammarState> {
        match &self.kind {
            GrammarKind::Digits { min, max } => {
                let (min, max) = (*min, *max);
                Some(self.digit(symbol, min, max))
            }
            GrammarKind::Boolean { yes, no } => {
                let answer = if yes.contains(&symbol) {
                    Some(true)
                } else if no.contains(&symbol) {
                    Some(false)
                } else {
                    None
                };
                answer.map(|a| self.fill(a.to_string()))
            }
            GrammarKind::Menu { .. } => symbol
                .is_ascii_digit()
                .then(|| self.fill(symbol.to_string())),
            GrammarKind::Rule(_) if self.terminators.contains(&symbol) => {
                Some(if self.rule_complete() {
                    GrammarState::Filled
                } else {
                    GrammarState::NoMatch
                })
            }
            GrammarKind::Rule(_) => self.rule_tokens(&[symbol.to_string()], ""),
            GrammarKind::Text => None,
        }
    }

    fn digit(&mut self, symbol: char, min: usize, max: Option<usize>) -> GrammarState {
        if self.terminators.contains(&symbol) {
            return if !self.value.is_empty() && self.value.len() >= min {
                GrammarState::Filled
            } else {
                GrammarState::NoMatch
            };
        }
        if !symbol.is_ascii_digit() {
            return GrammarState::NoMatch;
        }
        self.value.push(symbol);
        if max.map_or(false, |m| self.value.len() >= m) {
            GrammarState::Filled
        } else if self.value.len() >= min {
            GrammarState::PartFill
        } else {
            self.state
        }
    }

    fn on_recognition(&mut self, rec: &Recognition) -> Option<GrammarState> {
        let text = rec.text.trim();
        match &self.kind {
            GrammarKind::Text => {
                self.value = text.to_string();
                Some(if rec.is_final {
                    GrammarState::Filled
                } else {
                    GrammarState::PartFill
                })
            }
            GrammarKind::Boolean { yes, no } => {
                let lower = text.to_lowercase();
                let single = |set: &[char]| {
                    let mut chars = lower.chars();
                    matches!((chars.next(), chars.next()), (Some(c), None) if set.contains(&c))
                };
                let answer = match lower.as_str() {
                    "yes" | "true" => Some(true),
                    "no" | "false" => Some(false),
                    _ if single(yes) => Some(true),
                    _ if single(no) => Some(false),
                    _ => None,
                };
                answer.map(|a| self.fill(a.to_string()))
            }
            GrammarKind::Menu { .. } => {
                (rec.is_final && !text.is_empty()).then(|| self.fill(text.to_string()))
            }
            GrammarKind::Digits { min, max } => {
                if !rec.is_final {
                    return None;
                }
                let (min, max) = (*min, *max);
                let mut state = self.state;
                for c in text.chars().filter(char::is_ascii_digit) {
                    state = self.digit(c, min, max);
                    if state.is_terminal() {
                        return Some(state);
                    }
                }
                // End of utterance acts as the terminator.
                Some(if !self.value.is_empty() && self.value.len() >= min {
                    GrammarState::Filled
                } else {
                    state.max_with(GrammarState::NoMatch)
                })
            }
            GrammarKind::Rule(_) => {
                if !rec.is_final {
                    return None;
                }
                let words: Vec<String> = text.split_whitespace().map(str::to_string).collect();
                if words.is_empty() {
                    return None;
                }
                self.rule_tokens(&words, " ")
            }
        }
    }

    /// Feed tokens to the rule cursor; all-or-nothing.
    fn rule_tokens(&mut self, tokens: &[String], sep: &str) -> Option<GrammarState> {
        let GrammarKind::Rule(rule) = &self.kind else {
            return None;
        };
        let mut cursor = self.cursor.clone().unwrap_or_else(|| rule.cursor());
        if !tokens.iter().all(|t| rule.feed(&mut cursor, t)) {
            return None;
        }
        let complete = rule.is_complete(&cursor);
        let more = rule.can_continue(&cursor);
        self.cursor = Some(cursor);
        for token in tokens {
            if !self.value.is_empty() && !sep.is_empty() {
                self.value.push_str(sep);
            }
            self.value.push_str(token);
        }
        Some(if complete && !more {
            GrammarState::Filled
        } else {
            GrammarState::PartFill
        })
    }

    fn rule_complete(&self) -> bool {
        match (&self.kind, &self.cursor) {
            (GrammarKind::Rule(rule), Some(cursor)) => rule.is_complete(cursor),
            _ => false,
        }
    }

    fn fill(&mut self, value: String) -> GrammarState {
        self.value = value;
        GrammarState::Filled
    }

    /// Evaluate the no-input timer.
    ///
    /// While `Started`, an empty value becomes `NoInput` and a non-empty one
    /// `Filled`. While `PartFill`, a non-empty value becomes `Filled` and an
    /// empty one `NoMatch`. A rule grammar whose walk is incomplete becomes
    /// `NoMatch`.
    pub fn on_timeout(&mut self, now: Instant) -> GrammarState {
        let expired = self.deadline.map_or(false, |d| now >= d);
        if !expired || !self.state.is_active() {
            return self.state;
        }
        let next = match (self.state, self.value.is_empty()) {
            (GrammarState::Started, true) => GrammarState::NoInput,
            (_, false) if matches!(self.kind, GrammarKind::Rule(_)) && !self.rule_complete() => {
                GrammarState::NoMatch
            }
            (_, false) => GrammarState::Filled,
            (_, true) => GrammarState::NoMatch,
        };
        self.advance(next);
        self.state
    }

    fn advance(&mut self, next: GrammarState) {
        if next == self.state {
            return;
        }
        if !self.state.can_advance_to(next) {
            warn!(from = ?self.state, to = ?next, "rejected backward grammar transition");
            return;
        }
        debug!(grammar = self.kind.name(), from = ?self.state, to = ?next, "grammar transition");
        self.state = next;
        if next.is_terminal() {
            self.deadline = None;
            self.close_recognizer();
        }
    }

    /// Session-issued restart: back to `Idle` with an empty value.
    pub fn restart(&mut self) {
        self.close_recognizer();
        self.state = GrammarState::Idle;
        self.value.clear();
        self.deadline = None;
        self.cursor = None;
        self.modes = InputModes::DTMF_ONLY;
    }

    fn close_recognizer(&mut self) {
        if let Some(mut session) = self.recognition.take() {
            session.close();
        }
    }
}

impl Drop for Grammar {
    fn drop(&mut self) {
        self.close_recognizer();
    }
}

impl GrammarState {
    fn max_with(self, other: GrammarState) -> GrammarState {
        if self.is_terminal() {
            self
        } else {
            other
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{Document, NodeSpec};

    fn field() -> NodeId {
        Document::from_spec("mem:g", &NodeSpec::element("vxml", &[], vec![]))
            .unwrap()
            .root()
    }

    fn started(kind: GrammarKind) -> (Grammar, Instant) {
        let now = Instant::now();
        let mut g = Grammar::new(field(), kind, vec!['#'], Duration::from_secs(5));
        assert_eq!(g.start(now, InputModes::DTMF_ONLY, None), GrammarState::Started);
        (g, now)
    }

    fn feed(g: &mut Grammar, keys: &str, now: Instant) -> GrammarState {
        let mut state = g.state();
        for c in keys.chars() {
            state = g.on_input(&Input::Dtmf(c), now);
        }
        state
    }

    fn digits() -> GrammarKind {
        GrammarKind::Digits { min: 1, max: Some(4) }
    }

    #[test]
    fn digits_terminator_fills() {
        let (mut g, now) = started(digits());
        assert_eq!(feed(&mut g, "12#", now), GrammarState::Filled);
        assert_eq!(g.value(), "12");
    }

    #[test]
    fn digits_bare_terminator_is_nomatch() {
        let (mut g, now) = started(digits());
        assert_eq!(feed(&mut g, "#", now), GrammarState::NoMatch);
    }

    #[test]
    fn digits_max_length_fills_without_terminator() {
        let (mut g, now) = started(digits());
        assert_eq!(feed(&mut g, "123", now), GrammarState::PartFill);
        assert_eq!(feed(&mut g, "4", now), GrammarState::Filled);
        assert_eq!(g.value(), "1234");
        // Terminal: further input is ignored.
        assert_eq!(feed(&mut g, "5", now), GrammarState::Filled);
        assert_eq!(g.value(), "1234");
    }

    #[test]
    fn digits_below_minimum_stays_started() {
        let (mut g, now) = started(GrammarKind::Digits { min: 3, max: None });
        assert_eq!(feed(&mut g, "12", now), GrammarState::Started);
        assert_eq!(feed(&mut g, "#", now), GrammarState::NoMatch);
    }

    #[test]
    fn boolean_symbols_and_words() {
        let kind = GrammarKind::Boolean { yes: vec!['1'], no: vec!['2'] };
        let (mut g, now) = started(kind.clone());
        assert_eq!(feed(&mut g, "1", now), GrammarState::Filled);
        assert_eq!(g.value(), "true");

        let (mut g, now) = started(kind.clone());
        assert_eq!(feed(&mut g, "3", now), GrammarState::Started);
        assert_eq!(feed(&mut g, "2", now), GrammarState::Filled);
        assert_eq!(g.value(), "false");

        let mut g = Grammar::new(field(), kind, vec![], Duration::from_secs(5));
        g.start(now, InputModes::BOTH, None);
        // No recognizer: voice is dropped, dtmf only.
        assert_eq!(g.modes(), InputModes::DTMF_ONLY);
        g.modes.voice = true;
        let state = g.on_input(&Input::Speech(Recognition::final_text("Yes")), now);
        assert_eq!(state, GrammarState::Filled);
        assert_eq!(g.value(), "true");
    }

    #[test]
    fn menu_fills_on_any_digit() {
        let (mut g, now) = started(GrammarKind::Menu { phrases: vec![] });
        assert_eq!(feed(&mut g, "*", now), GrammarState::Started);
        assert_eq!(feed(&mut g, "7", now), GrammarState::Filled);
        assert_eq!(g.value(), "7");
    }

    #[test]
    fn rule_grammar_walks_partially_then_fills() {
        let rule = RuleGrammar::parse("1 (2 | 3) 4").unwrap();
        let (mut g, now) = started(GrammarKind::Rule(rule));
        assert_eq!(feed(&mut g, "1", now), GrammarState::PartFill);
        assert_eq!(feed(&mut g, "9", now), GrammarState::PartFill);
        assert_eq!(feed(&mut g, "34", now), GrammarState::Filled);
        assert_eq!(g.value(), "134");
    }

    #[test]
    fn rule_terminator_on_incomplete_walk_is_nomatch() {
        let rule = RuleGrammar::parse("1 2").unwrap();
        let (mut g, now) = started(GrammarKind::Rule(rule));
        assert_eq!(feed(&mut g, "1#", now), GrammarState::NoMatch);
    }

    #[test]
    fn timeout_with_no_input() {
        let (mut g, now) = started(digits());
        assert_eq!(g.on_timeout(now), GrammarState::Started);
        assert_eq!(g.on_timeout(now + Duration::from_secs(6)), GrammarState::NoInput);
    }

    #[test]
    fn timeout_after_partial_input_fills() {
        let (mut g, now) = started(digits());
        feed(&mut g, "12", now);
        assert_eq!(g.on_timeout(now + Duration::from_secs(6)), GrammarState::Filled);
        assert_eq!(g.value(), "12");
    }

    #[test]
    fn timeout_in_partfill_with_empty_value_is_nomatch() {
        let mut g = Grammar::new(field(), GrammarKind::Text, vec![], Duration::from_secs(1));
        let now = Instant::now();
        g.start(now, InputModes::BOTH, None);
        // Voice-only grammar without a recognizer has no usable modality.
        assert_eq!(g.state(), GrammarState::Illegal);

        let mut g = Grammar::new(field(), GrammarKind::Text, vec![], Duration::from_secs(1));
        g.state = GrammarState::Started;
        g.modes = InputModes { dtmf: false, voice: true };
        g.deadline = Some(now + Duration::from_secs(1));
        g.on_input(&Input::Speech(Recognition::partial("")), now);
        assert_eq!(g.state(), GrammarState::PartFill);
        assert_eq!(g.on_timeout(now + Duration::from_secs(2)), GrammarState::NoMatch);
    }

    #[test]
    fn text_grammar_partial_then_final() {
        let mut g = Grammar::new(field(), GrammarKind::Text, vec![], Duration::from_secs(5));
        let now = Instant::now();
        g.state = GrammarState::Started;
        g.modes = InputModes { dtmf: false, voice: true };
        assert_eq!(
            g.on_input(&Input::Speech(Recognition::partial("hello")), now),
            GrammarState::PartFill
        );
        assert_eq!(
            g.on_input(&Input::Speech(Recognition::final_text("hello world")), now),
            GrammarState::Filled
        );
        assert_eq!(g.value(), "hello world");
    }

    #[test]
    fn start_is_idempotent_and_restart_returns_to_idle() {
        let (mut g, now) = started(digits());
        feed(&mut g, "1", now);
        assert_eq!(g.start(now, InputModes::DTMF_ONLY, None), GrammarState::PartFill);
        g.restart();
        assert_eq!(g.state(), GrammarState::Idle);
        assert_eq!(g.value(), "");
        assert_eq!(feed(&mut g, "1", now), GrammarState::Idle);
    }

    #[test]
    fn transition_table_is_forward_only() {
        use GrammarState::*;
        let all = [Idle, Started, PartFill, Filled, NoInput, NoMatch, BadFetch, Illegal];
        for from in all {
            for to in all {
                if from.is_terminal() {
                    assert!(!from.can_advance_to(to), "{from:?} -> {to:?}");
                }
                if from.can_advance_to(to) && to != from {
                    assert_ne!(to, Idle, "{from:?} must never return to Idle");
                }
            }
        }
        assert!(!PartFill.can_advance_to(Started));
        assert!(!PartFill.can_advance_to(NoInput));
    }

    #[test]
    fn failed_grammar_is_terminal() {
        let g = Grammar::failed(field(), GrammarState::BadFetch);
        assert_eq!(g.state(), GrammarState::BadFetch);
    }
}
