//! # vxi-core
//!
//! Voice dialog interpreter SDK.
//!
//! ## Architecture
//!
//! ```text
//! host ──dtmf/speech/hangup──► DialogSession ──triggers──► worker thread
//!                                                            │
//!                                      document traversal + grammars + events
//!                                                            │
//!        AudioChannel ◄──PlayableItem queue──  prompts (Synthesizer / ResourceCache / Fetcher)
//!            │
//!   read()/write() frames ──tap──► SPSC RingBuffer ──► Recognizer
//!                                                            │
//!                                  broadcast::Sender<SessionEvent>
//! ```
//!
//! Documents are immutable and shared; every per-node flag a session needs
//! lives in its own side table, so a document can be swapped between steps.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod buffering;
pub mod cache;
pub mod document;
pub mod error;
pub mod events;
pub mod fetch;
pub mod grammar;
pub mod script;
pub mod session;
pub mod speech;
pub mod vad;

// Convenience re-exports for downstream crates
pub use audio::{AudioChannel, ChannelConfig, Codec, PlayableItem, PlayableSource};
pub use cache::{FreshnessPolicy, ResourceCache};
pub use document::{Document, NodeId, NodeSpec};
pub use error::{Result, VxiError};
pub use events::{EndReason, SessionEvent, SessionEventKind, SessionStatus};
pub use fetch::{FileFetcher, Fetcher};
pub use grammar::Input;
pub use script::{ScriptContext, SimpleScript};
pub use session::{Collaborators, DiagnosticsSnapshot, DialogSession, SessionConfig};
pub use speech::{Recognition, Recognizer, Synthesizer};

#[cfg(feature = "http")]
pub use fetch::HttpFetcher;
