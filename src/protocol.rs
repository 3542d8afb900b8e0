//! Wire protocol for the synchronization server
//!
//! This module defines the shared record type, the classifier that turns raw
//! client text into a typed request, and the typed server-to-client events
//! with their exact JSON shapes.
//!
//! Classification walks a `serde_json::Value` instead of deriving a
//! deserializer: the protocol rules are priority-ordered field checks (a
//! string `userName` wins over `rqtType`, `getData` ignores `rqtData`
//! entirely) that an untagged derive cannot express faithfully.

use serde::{ Serialize, Deserialize };
use serde_json::Value;

use crate::errors::Result;

/// One persisted entry of the shared record set.
///
/// The storage collaborator owns these; `id == 0` is the sentinel for a
/// record that was never persisted and is always treated as failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Storage-assigned identifier, non-zero once persisted
    pub id: i64,
    /// Free-form description
    pub description: String,
    /// Integer payload
    pub number: i64,
}

impl Record {
    /// Whether the storage collaborator actually persisted this record
    pub fn is_persisted(&self) -> bool {
        self.id != 0
    }
}

/// A classified inbound message
///
/// Every raw text frame maps to exactly one of these; anything that fails
/// the shape checks maps to `Invalid`, never to a panic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientRequest {
    /// `{"userName": "<name>"}` — associate a display name with the sender
    UserName(String),
    /// `{"rqtType":"getData", ...}` — full record set, reply to sender only
    AllData,
    /// `{"rqtType":"insert","rqtData":{"description":..,"number":..}}`
    Insert { description: String, number: i64 },
    /// `{"rqtType":"update","rqtData":{"id":..,"description":..,"number":..}}`
    Update { id: i64, description: String, number: i64 },
    /// `{"rqtType":"delete","rqtData":<id>}`
    Delete(i64),
    /// Anything that failed parsing or shape validation
    Invalid,
}

/// Classify one raw text frame.
///
/// Pure and total: the same input always yields the same classification and
/// malformed input yields `Invalid`.
pub fn classify(text: &str) -> ClientRequest {
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(_) => {
            return ClientRequest::Invalid;
        }
    };
    let Some(object) = value.as_object() else {
        return ClientRequest::Invalid;
    };

    // A string userName field takes precedence over rqtType: the rename
    // message legally carries nothing else.
    if let Some(name) = object.get("userName").and_then(Value::as_str) {
        return ClientRequest::UserName(name.to_string());
    }

    let Some(rqt_type) = object.get("rqtType").and_then(Value::as_str) else {
        return ClientRequest::Invalid;
    };
    let Some(rqt_data) = object.get("rqtData") else {
        return ClientRequest::Invalid;
    };

    match rqt_type {
        // rqtData is present but its value is irrelevant here
        "getData" => ClientRequest::AllData,
        "insert" => {
            let Some(data) = rqt_data.as_object() else {
                return ClientRequest::Invalid;
            };
            let description = data.get("description").and_then(Value::as_str);
            let number = data.get("number").and_then(as_integer);
            match (description, number) {
                (Some(description), Some(number)) =>
                    ClientRequest::Insert { description: description.to_string(), number },
                _ => ClientRequest::Invalid,
            }
        }
        "update" => {
            let Some(data) = rqt_data.as_object() else {
                return ClientRequest::Invalid;
            };
            let id = data.get("id").and_then(as_integer);
            let description = data.get("description").and_then(Value::as_str);
            let number = data.get("number").and_then(as_integer);
            match (id, description, number) {
                (Some(id), Some(description), Some(number)) =>
                    ClientRequest::Update { id, description: description.to_string(), number },
                _ => ClientRequest::Invalid,
            }
        }
        "delete" => match as_integer(rqt_data) {
            Some(id) => ClientRequest::Delete(id),
            None => ClientRequest::Invalid,
        },
        _ => ClientRequest::Invalid,
    }
}

/// Any JSON number qualifies; fractional values truncate toward zero.
fn as_integer(value: &Value) -> Option<i64> {
    value.as_i64().or_else(|| value.as_f64().map(|f| f as i64))
}

/// A state-change notification broadcast to every connection
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ChangeNotification {
    /// `{"type":"insert","entry":{...}}`
    Insert { entry: Record },
    /// `{"type":"update","entry":{...}}`
    Update { entry: Record },
    /// `{"type":"delete","id":<id>}`
    Delete { id: i64 },
}

/// A failure reply sent to the originating connection only
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorEnvelope {
    /// The raw text the client sent, echoed back for correlation
    #[serde(rename = "originalMsg")]
    pub original_msg: String,
    /// Human-readable reason, may be empty when storage reported none
    #[serde(rename = "errorMsg")]
    pub error_msg: String,
}

/// Everything the server sends to clients
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum OutboundEvent {
    /// Full record set, serialized as a bare JSON array
    Snapshot(Vec<Record>),
    /// Insert/update/delete notification
    Change(ChangeNotification),
    /// Error envelope
    Error(ErrorEnvelope),
}

impl OutboundEvent {
    /// Serialize to the exact text frame put on the wire
    pub fn to_text(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
