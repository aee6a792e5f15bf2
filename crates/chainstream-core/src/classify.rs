//! Turns decoded `(event, payload)` pairs into typed outcomes.
//!
//! Parsing is discriminant-first: the event name picks the branch, then the
//! inner `type` field picks the record type. Unknown discriminants and
//! incomplete payloads are [`Classified::Ignored`], never errors. Only a
//! record body that fails to decode is reported.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::StreamError;
use crate::response::{ActionTrace, ChainHead, Mode, Response, TableDelta};

/// Event carrying head-of-chain updates.
pub const LIB_UPDATE: &str = "lib_update";
/// Event carrying stream records.
pub const MESSAGE: &str = "message";

/// Values of the inner `type` field that select a record type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TraceKinds {
    pub action: String,
    pub delta: String,
}

impl Default for TraceKinds {
    fn default() -> Self {
        Self {
            action: "action_trace".into(),
            delta: "delta_trace".into(),
        }
    }
}

/// Why a frame produced nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ignored {
    UnknownEvent(String),
    IncompleteHead,
    NotAnObject,
    MissingField(&'static str),
    UnknownType(String),
}

impl std::fmt::Display for Ignored {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownEvent(name) => write!(f, "unhandled event '{name}'"),
            Self::IncompleteHead => write!(f, "lib_update without chain_id/block_num/block_id"),
            Self::NotAnObject => write!(f, "payload is not an object"),
            Self::MissingField(field) => write!(f, "payload missing '{field}'"),
            Self::UnknownType(kind) => write!(f, "unknown message type '{kind}'"),
        }
    }
}

/// Outcome of classifying one event.
#[derive(Debug, Clone, PartialEq)]
pub enum Classified {
    /// Updates the connection's cached head; never delivered.
    Head(ChainHead),
    Record(Response),
    Ignored(Ignored),
}

#[derive(Debug, Clone, Default)]
pub struct Classifier {
    kinds: TraceKinds,
}

impl Classifier {
    pub fn new(kinds: TraceKinds) -> Self {
        Self { kinds }
    }

    pub fn kinds(&self) -> &TraceKinds {
        &self.kinds
    }

    pub fn classify(&self, event: &str, payload: Value) -> Result<Classified, StreamError> {
        match event {
            LIB_UPDATE => Ok(head_update(payload)),
            MESSAGE => self.message(payload),
            other => Ok(Classified::Ignored(Ignored::UnknownEvent(other.to_string()))),
        }
    }

    fn message(&self, payload: Value) -> Result<Classified, StreamError> {
        let Value::Object(mut body) = payload else {
            return Ok(Classified::Ignored(Ignored::NotAnObject));
        };
        let Some(kind) = take_string(&mut body, "type") else {
            return Ok(Classified::Ignored(Ignored::MissingField("type")));
        };
        let Some(message) = take_string(&mut body, "message") else {
            return Ok(Classified::Ignored(Ignored::MissingField("message")));
        };
        let mode = body
            .get("mode")
            .and_then(Value::as_str)
            .map(Mode::parse)
            .unwrap_or_default();

        if kind == self.kinds.action {
            let trace: ActionTrace = serde_json::from_str(&message)?;
            Ok(Classified::Record(Response::Action {
                mode,
                trace: Box::new(trace),
            }))
        } else if kind == self.kinds.delta {
            let delta: TableDelta = serde_json::from_str(&message)?;
            Ok(Classified::Record(Response::Delta {
                mode,
                delta: Box::new(delta),
            }))
        } else {
            Ok(Classified::Ignored(Ignored::UnknownType(kind)))
        }
    }
}

fn take_string(body: &mut Map<String, Value>, key: &str) -> Option<String> {
    match body.remove(key) {
        Some(Value::String(s)) => Some(s),
        _ => None,
    }
}

fn head_update(payload: Value) -> Classified {
    if !payload.is_object() {
        return Classified::Ignored(Ignored::NotAnObject);
    }
    match serde_json::from_value::<ChainHead>(payload) {
        Ok(head) => Classified::Head(head),
        Err(_) => Classified::Ignored(Ignored::IncompleteHead),
    }
}
