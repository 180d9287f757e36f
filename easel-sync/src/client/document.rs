//! Editor-facing JSON view of a document payload.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The editor's document: scene elements, view state, optional library.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentState {
    #[serde(default)]
    pub elements: Vec<Value>,
    #[serde(default)]
    pub app_state: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub library_items: Option<Vec<Value>>,
}

impl DocumentState {
    pub fn new(elements: Vec<Value>) -> Self {
        Self {
            elements,
            ..Self::default()
        }
    }

    pub fn to_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }

    /// Downstream consumers require `appState.collaborators` to exist.
    pub fn ensure_collaborators(&mut self) {
        self.app_state
            .entry("collaborators")
            .or_insert_with(|| Value::Object(Map::new()));
    }
}

/// A document as received from the server.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteDocument {
    pub document_id: String,
    pub state: DocumentState,
    pub server_timestamp: i64,
    /// `false` when the server had no snapshot and `state` is the default
    pub found: bool,
}

impl RemoteDocument {
    /// Decode a payload received for `document_id`. An empty payload is the
    /// default document.
    pub(crate) fn decode(
        document_id: String,
        payload: &[u8],
        server_timestamp: i64,
        found: bool,
    ) -> Result<Self, serde_json::Error> {
        let mut state = if payload.is_empty() {
            DocumentState::default()
        } else {
            DocumentState::from_payload(payload)?
        };
        state.ensure_collaborators();
        Ok(Self {
            document_id,
            state,
            server_timestamp,
            found,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_field_names() {
        let mut doc = DocumentState::new(vec![json!({ "id": "1", "type": "rectangle" })]);
        doc.app_state.insert("viewBackgroundColor".into(), json!("#fff"));
        let value: Value = serde_json::from_slice(&doc.to_payload().unwrap()).unwrap();
        assert_eq!(value["elements"][0]["type"], "rectangle");
        assert_eq!(value["appState"]["viewBackgroundColor"], "#fff");
        assert!(value.get("libraryItems").is_none());
    }

    #[test]
    fn test_missing_collaborators_is_inserted() {
        let remote = RemoteDocument::decode(
            "singleton".into(),
            br#"{"elements":[],"appState":{"zoom":1}}"#,
            5,
            true,
        )
        .unwrap();
        assert_eq!(remote.state.app_state["collaborators"], json!({}));
        assert_eq!(remote.state.app_state["zoom"], 1);
    }

    #[test]
    fn test_existing_collaborators_kept() {
        let mut doc = DocumentState::default();
        doc.app_state.insert("collaborators".into(), json!({ "a": 1 }));
        doc.ensure_collaborators();
        assert_eq!(doc.app_state["collaborators"], json!({ "a": 1 }));
    }

    #[test]
    fn test_empty_payload_is_default_document() {
        let remote = RemoteDocument::decode("other".into(), &[], 9, false).unwrap();
        assert!(!remote.found);
        assert!(remote.state.elements.is_empty());
        assert!(remote.state.app_state.contains_key("collaborators"));
    }

    #[test]
    fn test_non_json_payload_is_error() {
        assert!(RemoteDocument::decode("d".into(), b"\x00\x01", 1, true).is_err());
    }
}
