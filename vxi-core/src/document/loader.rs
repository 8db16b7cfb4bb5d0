//! Document loading contract.

use super::Document;
use crate::error::Result;

/// Turns fetched bytes into a [`Document`].
///
/// The markup parser lives outside this crate; hosts plug theirs in here.
pub trait DocumentLoader: Send + Sync {
    fn load(&self, uri: &str, bytes: &[u8]) -> Result<Document>;
}

/// Loads the JSON node-tree interchange form ([`super::NodeSpec`]).
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonDocumentLoader;

impl DocumentLoader for JsonDocumentLoader {
    fn load(&self, uri: &str, bytes: &[u8]) -> Result<Document> {
        Document::from_json(uri, bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_json_maps_to_document_badfetch() {
        let err = JsonDocumentLoader.load("mem:bad", b"{ not json").unwrap_err();
        assert_eq!(err.event_name(), "error.badfetch.document");
    }
}
