//! Typed records delivered to the caller.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::de::{lenient_bool, lenient_u32, lenient_u64};
use crate::error::StreamError;
use crate::query::parse_time;

/// How the peer is delivering a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Produced as the chain advances.
    #[default]
    Live,
    /// Replayed from the peer's history index.
    History,
}

impl Mode {
    /// Anything other than `"history"` is treated as live.
    pub fn parse(s: &str) -> Self {
        if s.eq_ignore_ascii_case("history") {
            Self::History
        } else {
            Self::Live
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Live => write!(f, "live"),
            Self::History => write!(f, "history"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Action,
    Delta,
}

// ─── Head of chain ───────────────────────────────────────────────────────────

/// Last irreversible block as reported by the peer's `lib_update` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainHead {
    pub chain_id: String,
    #[serde(deserialize_with = "lenient_u64")]
    pub block_num: u64,
    pub block_id: String,
}

// ─── Action trace ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Authorization {
    #[serde(default)]
    pub actor: String,
    #[serde(default)]
    pub permission: String,
}

/// The executed action itself.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Act {
    pub account: String,
    pub name: String,
    pub authorization: Vec<Authorization>,
    /// ABI-decoded arguments, or a hex string when the peer has no ABI.
    pub data: Value,
}

impl Act {
    /// Look up a top-level field of the action data.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.data.as_object().and_then(|m| m.get(name))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthSequence {
    #[serde(default)]
    pub account: String,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub sequence: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActionReceipt {
    pub receiver: String,
    #[serde(deserialize_with = "lenient_u64")]
    pub global_sequence: u64,
    #[serde(deserialize_with = "lenient_u64")]
    pub recv_sequence: u64,
    pub auth_sequence: Vec<AuthSequence>,
}

/// One executed action within a block.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActionTrace {
    #[serde(deserialize_with = "lenient_u32")]
    pub action_ordinal: u32,
    #[serde(deserialize_with = "lenient_u32")]
    pub creator_action_ordinal: u32,
    pub act: Act,
    #[serde(deserialize_with = "lenient_bool")]
    pub context_free: bool,
    /// Execution time in microseconds.
    #[serde(deserialize_with = "lenient_u64")]
    pub elapsed: u64,
    #[serde(rename = "@timestamp")]
    pub timestamp: String,
    #[serde(deserialize_with = "lenient_u64")]
    pub block_num: u64,
    pub producer: String,
    pub trx_id: String,
    #[serde(deserialize_with = "lenient_u64")]
    pub global_sequence: u64,
    pub receipts: Vec<ActionReceipt>,
    #[serde(deserialize_with = "lenient_u64")]
    pub code_sequence: u64,
    #[serde(deserialize_with = "lenient_u64")]
    pub abi_sequence: u64,
    pub notified: Vec<String>,
    /// Fields this struct does not model.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ActionTrace {
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        parse_time(&self.timestamp)
    }
}

// ─── Table delta ─────────────────────────────────────────────────────────────

/// A contract table row changed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TableDelta {
    pub code: String,
    pub scope: String,
    pub table: String,
    pub primary_key: String,
    pub payer: String,
    #[serde(rename = "@timestamp")]
    pub timestamp: String,
    /// `false` when the row was removed.
    #[serde(deserialize_with = "lenient_bool")]
    pub present: bool,
    #[serde(deserialize_with = "lenient_u64")]
    pub block_num: u64,
    pub block_id: String,
    /// Row contents; ABI-decoded object or hex string.
    pub data: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TableDelta {
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        parse_time(&self.timestamp)
    }
}

// ─── Response ────────────────────────────────────────────────────────────────

/// A record delivered on the response channel.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Action { mode: Mode, trace: Box<ActionTrace> },
    Delta { mode: Mode, delta: Box<TableDelta> },
}

impl Response {
    pub fn kind(&self) -> RecordKind {
        match self {
            Self::Action { .. } => RecordKind::Action,
            Self::Delta { .. } => RecordKind::Delta,
        }
    }

    /// Delivery mode, taken from the envelope rather than the record body.
    pub fn mode(&self) -> Mode {
        match self {
            Self::Action { mode, .. } | Self::Delta { mode, .. } => *mode,
        }
    }

    pub fn block_num(&self) -> u64 {
        match self {
            Self::Action { trace, .. } => trace.block_num,
            Self::Delta { delta, .. } => delta.block_num,
        }
    }

    /// Action view; fails with [`StreamError::NotAction`] on a delta.
    pub fn action(&self) -> Result<&ActionTrace, StreamError> {
        match self {
            Self::Action { trace, .. } => Ok(&**trace),
            Self::Delta { .. } => Err(StreamError::NotAction),
        }
    }

    /// Delta view; fails with [`StreamError::NotDelta`] on an action.
    pub fn delta(&self) -> Result<&TableDelta, StreamError> {
        match self {
            Self::Delta { delta, .. } => Ok(&**delta),
            Self::Action { .. } => Err(StreamError::NotDelta),
        }
    }

    pub fn into_action(self) -> Result<ActionTrace, StreamError> {
        match self {
            Self::Action { trace, .. } => Ok(*trace),
            Self::Delta { .. } => Err(StreamError::NotAction),
        }
    }

    pub fn into_delta(self) -> Result<TableDelta, StreamError> {
        match self {
            Self::Delta { delta, .. } => Ok(*delta),
            Self::Action { .. } => Err(StreamError::NotDelta),
        }
    }

    /// The record body as JSON.
    pub fn to_json(&self) -> Result<String, StreamError> {
        match self {
            Self::Action { trace, .. } => serde_json::to_string(trace),
            Self::Delta { delta, .. } => serde_json::to_string(delta),
        }
        .map_err(StreamError::Encode)
    }
}
