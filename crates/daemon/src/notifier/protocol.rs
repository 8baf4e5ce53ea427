//! SignalR JSON hub protocol (version 1) framing

use serde_json::{json, Value};

/// Terminates every JSON record on the wire
pub const RECORD_SEPARATOR: char = '\u{1e}';

const INVOCATION: u64 = 1;
const STREAM_ITEM: u64 = 2;
const COMPLETION: u64 = 3;
const PING: u64 = 6;
const CLOSE: u64 = 7;

/// First record a client sends after the socket opens
pub fn handshake_request() -> String {
    format!(r#"{{"protocol":"json","version":1}}{}"#, RECORD_SEPARATOR)
}

/// Check the server's handshake reply: `{}` on success, `{"error": ..}` otherwise
pub fn parse_handshake_response(record: &str) -> Result<(), String> {
    let value: Value = serde_json::from_str(record).map_err(|e| e.to_string())?;
    match value.get("error").and_then(Value::as_str) {
        Some(error) => Err(error.to_string()),
        None => Ok(()),
    }
}

/// A hub protocol message
#[derive(Debug, Clone, PartialEq)]
pub enum HubMessage {
    Invocation {
        invocation_id: Option<String>,
        target: String,
        arguments: Vec<Value>,
    },
    StreamItem {
        invocation_id: String,
        item: Value,
    },
    Completion {
        invocation_id: String,
        result: Option<Value>,
        error: Option<String>,
    },
    Ping,
    Close {
        error: Option<String>,
        allow_reconnect: bool,
    },
    /// Message types this client does not act on
    Other(u64),
}

impl HubMessage {
    pub fn invocation(invocation_id: impl Into<String>, target: impl Into<String>, arguments: Vec<Value>) -> Self {
        HubMessage::Invocation {
            invocation_id: Some(invocation_id.into()),
            target: target.into(),
            arguments,
        }
    }

    /// Serialize as one record, separator included
    pub fn encode(&self) -> String {
        let value = match self {
            HubMessage::Invocation {
                invocation_id,
                target,
                arguments,
            } => {
                let mut v = json!({ "type": INVOCATION, "target": target, "arguments": arguments });
                if let Some(id) = invocation_id {
                    v["invocationId"] = json!(id);
                }
                v
            }
            HubMessage::StreamItem { invocation_id, item } => {
                json!({ "type": STREAM_ITEM, "invocationId": invocation_id, "item": item })
            }
            HubMessage::Completion {
                invocation_id,
                result,
                error,
            } => {
                let mut v = json!({ "type": COMPLETION, "invocationId": invocation_id });
                if let Some(error) = error {
                    v["error"] = json!(error);
                } else if let Some(result) = result {
                    v["result"] = result.clone();
                }
                v
            }
            HubMessage::Ping => json!({ "type": PING }),
            HubMessage::Close {
                error,
                allow_reconnect,
            } => {
                let mut v = json!({ "type": CLOSE, "allowReconnect": allow_reconnect });
                if let Some(error) = error {
                    v["error"] = json!(error);
                }
                v
            }
            HubMessage::Other(kind) => json!({ "type": kind }),
        };
        format!("{}{}", value, RECORD_SEPARATOR)
    }

    /// Parse one record (without its separator)
    pub fn parse(record: &str) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_str(record)?;
        let text = |key: &str| value.get(key).and_then(Value::as_str).map(String::from);

        let kind = value.get("type").and_then(Value::as_u64).unwrap_or(0);
        Ok(match kind {
            INVOCATION => HubMessage::Invocation {
                invocation_id: text("invocationId"),
                target: text("target").unwrap_or_default(),
                arguments: value
                    .get("arguments")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default(),
            },
            STREAM_ITEM => HubMessage::StreamItem {
                invocation_id: text("invocationId").unwrap_or_default(),
                item: value.get("item").cloned().unwrap_or(Value::Null),
            },
            COMPLETION => HubMessage::Completion {
                invocation_id: text("invocationId").unwrap_or_default(),
                result: value.get("result").cloned(),
                error: text("error"),
            },
            PING => HubMessage::Ping,
            CLOSE => HubMessage::Close {
                error: text("error"),
                allow_reconnect: value
                    .get("allowReconnect")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            },
            other => HubMessage::Other(other),
        })
    }
}

/// Reassembles records that may span or share WebSocket frames
#[derive(Debug, Default)]
pub struct RecordBuffer {
    pending: String,
}

impl RecordBuffer {
    /// Append `text` and return every record it completed
    pub fn push(&mut self, text: &str) -> Vec<String> {
        self.pending.push_str(text);

        let mut records = Vec::new();
        while let Some(idx) = self.pending.find(RECORD_SEPARATOR) {
            let record: String = self.pending.drain(..idx).collect();
            self.pending.drain(..RECORD_SEPARATOR.len_utf8());
            if !record.trim().is_empty() {
                records.push(record);
            }
        }
        records
    }
}
