//! Events a dialog session publishes to its host.
//!
//! Every event carries a per-session sequence number; the payload is
//! flattened next to it with a `type` tag:
//!
//! ```json
//! { "seq": 4, "type": "fieldFilled", "name": "pin", "value": "1234" }
//! ```

use serde::{Deserialize, Serialize};

use crate::audio::RecordingSummary;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEvent {
    pub seq: u64,
    #[serde(flatten)]
    pub kind: SessionEventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum SessionEventKind {
    Status {
        status: SessionStatus,
        detail: Option<String>,
    },
    DocumentLoaded {
        uri: String,
    },
    PromptQueued {
        label: String,
    },
    /// A dialog event was thrown; `handled` is false when no catch matched.
    EventRaised {
        name: String,
        handled: bool,
    },
    FieldFilled {
        name: String,
        value: String,
    },
    RecordingFinished {
        name: String,
        summary: RecordingSummary,
    },
    /// The host should bridge the call and report back with
    /// `transfer_completed`.
    TransferRequested {
        name: String,
        dest: String,
        bridge: bool,
    },
    Log {
        label: Option<String>,
        message: String,
    },
    Ended {
        reason: EndReason,
        detail: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Created, `start()` not yet called.
    Idle,
    Running,
    /// Abort requested; disconnect handling is draining.
    Stopping,
    Ended,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndReason {
    /// `<exit>`.
    Exit,
    /// `<disconnect>` or hangup.
    Disconnect,
    /// Traversal ran off the end of the document.
    Completed,
    /// An event had no handler at any generalisation level.
    Unhandled,
    /// A logic error such as a redirection cycle.
    Logic,
    /// Stopped by the host.
    Aborted,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    #[default]
    Idle,
    Pending,
    Completed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordingStatus {
    #[default]
    Idle,
    Recording,
    Finished,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::StopReason;

    #[test]
    fn field_filled_flattens_with_camel_case_type() {
        let event = SessionEvent {
            seq: 4,
            kind: SessionEventKind::FieldFilled {
                name: "pin".into(),
                value: "1234".into(),
            },
        };
        let json = serde_json::to_value(&event).expect("serialize session event");
        assert_eq!(json["seq"], 4);
        assert_eq!(json["type"], "fieldFilled");
        assert_eq!(json["name"], "pin");
        assert_eq!(json["value"], "1234");

        let round_trip: SessionEvent = serde_json::from_value(json).expect("deserialize");
        assert_eq!(round_trip, event);
    }

    #[test]
    fn status_and_end_reason_are_lowercase() {
        let event = SessionEvent {
            seq: 0,
            kind: SessionEventKind::Ended {
                reason: EndReason::Unhandled,
                detail: Some("error.badfetch.http.404".into()),
            },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "ended");
        assert_eq!(json["reason"], "unhandled");

        let status = serde_json::to_value(SessionStatus::Stopping).unwrap();
        assert_eq!(status, "stopping");
        assert!(serde_json::from_str::<SessionStatus>(r#""Running""#).is_err());
    }

    #[test]
    fn recording_summary_fields_are_camel_case() {
        let event = SessionEvent {
            seq: 9,
            kind: SessionEventKind::RecordingFinished {
                name: "msg".into(),
                summary: RecordingSummary {
                    path: "msg.wav".into(),
                    duration_ms: 1200,
                    bytes: 19200,
                    reason: StopReason::FinalSilence,
                    terminator: None,
                },
            },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["summary"]["durationMs"], 1200);
        assert_eq!(json["summary"]["reason"], "finalsilence");
    }
}
