use std::time::Duration;

use thiserror::Error;

/// All errors produced by vxi-core.
///
/// Apart from the session lifecycle variants, every error maps onto a dialog
/// event name (see [`VxiError::event_name`]) so documents can catch it.
#[derive(Debug, Error)]
pub enum VxiError {
    /// Bad attribute or expression usage inside a document.
    #[error("semantic error: {0}")]
    Semantic(String),

    /// A resource could not be obtained. `transport`/`status` end up in the
    /// event name, e.g. `error.badfetch.http.404`.
    #[error("could not fetch {uri}: {transport} {status}")]
    BadFetch {
        uri: String,
        transport: String,
        status: String,
    },

    /// A grammar, codec, input mode or other feature has no collaborator.
    #[error("unsupported {what}: {detail}")]
    Unsupported { what: &'static str, detail: String },

    #[error("no resource available: {0}")]
    NoResource(String),

    /// Invariant violation. Terminates the current document.
    #[error("logic error: {0}")]
    Logic(String),

    #[error("grammar error: {0}")]
    Grammar(String),

    /// Short/misaligned frames or incompatible media parameters.
    #[error("media error: {0}")]
    Media(String),

    #[error("cache error: {0}")]
    Cache(String),

    #[error("session is already running")]
    AlreadyRunning,

    #[error("session is not running")]
    NotRunning,

    #[error("session worker did not exit within {0:?}")]
    JoinTimeout(Duration),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl VxiError {
    pub fn bad_fetch(
        uri: impl Into<String>,
        transport: impl Into<String>,
        status: impl Into<String>,
    ) -> Self {
        Self::BadFetch {
            uri: uri.into(),
            transport: transport.into(),
            status: status.into(),
        }
    }

    pub fn unsupported(what: &'static str, detail: impl Into<String>) -> Self {
        Self::Unsupported {
            what,
            detail: detail.into(),
        }
    }

    /// Dialog event name raised when this error surfaces inside a document.
    pub fn event_name(&self) -> String {
        match self {
            Self::Semantic(_) => "error.semantic".into(),
            Self::BadFetch {
                transport, status, ..
            } => format!("error.badfetch.{transport}.{status}"),
            Self::Unsupported { what, .. } => format!("error.unsupported.{what}"),
            Self::NoResource(_) | Self::Cache(_) | Self::Other(_) => "error.noresource".into(),
            Self::Logic(_) => "error.logic".into(),
            Self::Grammar(_) => "error.badfetch.grammar".into(),
            Self::Media(_) => "error.badfetch.media".into(),
            Self::Io(_) => "error.badfetch".into(),
            Self::Json(_) => "error.badfetch.document".into(),
            Self::AlreadyRunning | Self::NotRunning | Self::JoinTimeout(_) => "error".into(),
        }
    }

    /// Fatal errors end the current document instead of being thrown.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Logic(_))
    }
}

pub type Result<T> = std::result::Result<T, VxiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_fetch_embeds_transport_and_status() {
        let err = VxiError::bad_fetch("http://x/a.json", "http", "404");
        assert_eq!(err.event_name(), "error.badfetch.http.404");
        assert!(!err.is_fatal());
    }

    #[test]
    fn unsupported_names_the_missing_feature() {
        let err = VxiError::unsupported("format", "application/srgs+xml");
        assert_eq!(err.event_name(), "error.unsupported.format");
    }

    #[test]
    fn only_logic_errors_are_fatal() {
        assert!(VxiError::Logic("cycle".into()).is_fatal());
        assert!(!VxiError::Semantic("x".into()).is_fatal());
        assert!(!VxiError::Media("short".into()).is_fatal());
    }
}
