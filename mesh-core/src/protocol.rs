//! Mesh wire protocol: session message types carried in frames (see wire module).

use serde::{Deserialize, Serialize};

use crate::document::{Document, VersionVector};
use crate::value::Fields;

/// All session message types. Encoding is JSON with a `type` tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// Initiator's identity claim; `auth_hash` is HMAC-SHA256 over `"{peer_id}:{timestamp}"`.
    Hello {
        peer_id: String,
        app_id: String,
        mesh_id: String,
        auth_hash: String,
        timestamp: u64,
    },
    /// Acceptor's reply once the hello verified.
    HelloAck { peer_id: String, app_id: String },
    /// One document snapshot.
    SyncDiff {
        collection: String,
        doc_id: String,
        data: Fields,
        version: VersionVector,
    },
    /// End of the sender's push.
    SyncDone,
}

impl Message {
    pub fn sync_diff(doc: &Document) -> Self {
        Message::SyncDiff {
            collection: doc.collection.clone(),
            doc_id: doc.doc_id.clone(),
            data: doc.fields.clone(),
            version: doc.version.clone(),
        }
    }

    /// The document carried by a `sync_diff`, if this is one.
    pub fn into_document(self) -> Option<Document> {
        match self {
            Message::SyncDiff {
                collection,
                doc_id,
                data,
                version,
            } => Some(Document {
                collection,
                doc_id,
                fields: data,
                version,
            }),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Message::Hello { .. } => "hello",
            Message::HelloAck { .. } => "hello_ack",
            Message::SyncDiff { .. } => "sync_diff",
            Message::SyncDone => "sync_done",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    #[test]
    fn tags_match_wire_names() {
        let done = serde_json::to_value(Message::SyncDone).unwrap();
        assert_eq!(done, serde_json::json!({"type": "sync_done"}));

        let ack = serde_json::to_value(Message::HelloAck {
            peer_id: "aaaa".into(),
            app_id: "atmo".into(),
        })
        .unwrap();
        assert_eq!(
            ack,
            serde_json::json!({"type": "hello_ack", "peer_id": "aaaa", "app_id": "atmo"})
        );
    }

    #[test]
    fn sync_diff_carries_document() {
        let mut doc = Document::empty("notes", "d1");
        doc.fields.insert("t".into(), Value::from("hi"));
        doc.version.increment("aaaa");
        let msg = Message::sync_diff(&doc);
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"sync_diff""#));
        assert!(json.contains(r#""version":{"aaaa":1}"#));
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kind(), "sync_diff");
        assert_eq!(back.into_document(), Some(doc));
    }

    #[test]
    fn parses_foreign_hello() {
        let raw = r#"{"type":"hello","peer_id":"aaaa","app_id":"atmo","mesh_id":"home",
                      "auth_hash":"00","timestamp":1700000000}"#;
        let msg: Message = serde_json::from_str(raw).unwrap();
        assert!(matches!(msg, Message::Hello { timestamp: 1_700_000_000, .. }));
        assert!(msg.into_document().is_none());
    }
}
