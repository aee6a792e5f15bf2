//! Subscription queries and their wire encoding.
//!
//! A connection carries exactly one [`Query`]: either an action stream
//! request or a table-delta stream request. Both share the polymorphic
//! `start_from` / `read_until` [`Bound`].

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

use crate::error::StreamError;

/// Event name used to request an action stream.
pub const ACTION_STREAM_REQUEST: &str = "action_stream_request";
/// Event name used to request a table-delta stream.
pub const DELTA_STREAM_REQUEST: &str = "delta_stream_request";

// ─── Bound ───────────────────────────────────────────────────────────────────

/// Start or end of a stream window.
///
/// On the wire this is `0` for [`Bound::Head`], the block number for
/// [`Bound::Block`] and an RFC3339 string for [`Bound::Time`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Bound {
    /// From (or through) the current head of the chain.
    #[default]
    Head,
    /// A block number.
    Block(u64),
    /// A point in time.
    Time(DateTime<Utc>),
}

impl Bound {
    pub fn is_head(&self) -> bool {
        matches!(self, Self::Head)
    }

    /// `0` means head, like on the wire.
    pub fn block(n: u64) -> Self {
        if n == 0 {
            Self::Head
        } else {
            Self::Block(n)
        }
    }
}

impl From<u64> for Bound {
    fn from(n: u64) -> Self {
        Self::block(n)
    }
}

impl From<DateTime<Utc>> for Bound {
    fn from(t: DateTime<Utc>) -> Self {
        Self::Time(t)
    }
}

impl<T: Into<Bound>> From<Option<T>> for Bound {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Head, Into::into)
    }
}

impl fmt::Display for Bound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Head => write!(f, "head"),
            Self::Block(n) => write!(f, "{n}"),
            Self::Time(t) => write!(f, "{}", t.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
        }
    }
}

impl FromStr for Bound {
    type Err = StreamError;

    /// Parses `head`, `0`, a block number, or a timestamp.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() || s.eq_ignore_ascii_case("head") {
            return Ok(Self::Head);
        }
        if let Ok(n) = s.parse::<u64>() {
            return Ok(Self::block(n));
        }
        parse_time(s)
            .map(Self::Time)
            .ok_or_else(|| StreamError::InvalidQuery(format!("'{s}' is neither a block number nor a timestamp")))
    }
}

/// Parses RFC3339, or the peer's zone-less `YYYY-MM-DDTHH:MM:SS[.fff]` as UTC.
pub fn parse_time(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Some(t.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

impl Serialize for Bound {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Head => s.serialize_u64(0),
            Self::Block(n) => s.serialize_u64(*n),
            Self::Time(t) => s.serialize_str(&t.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
        }
    }
}

struct BoundVisitor;

impl<'de> Visitor<'de> for BoundVisitor {
    type Value = Bound;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a block number, a timestamp string, 0 or null")
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Bound, E> {
        Ok(Bound::block(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Bound, E> {
        u64::try_from(v)
            .map(Bound::block)
            .map_err(|_| E::invalid_value(de::Unexpected::Signed(v), &self))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Bound, E> {
        v.parse().map_err(|_| E::invalid_value(de::Unexpected::Str(v), &self))
    }

    fn visit_unit<E: de::Error>(self) -> Result<Bound, E> {
        Ok(Bound::Head)
    }

    fn visit_none<E: de::Error>(self) -> Result<Bound, E> {
        Ok(Bound::Head)
    }
}

impl<'de> Deserialize<'de> for Bound {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        d.deserialize_any(BoundVisitor)
    }
}

fn check_window(start: &Bound, end: &Bound) -> Result<(), StreamError> {
    match (start, end) {
        (Bound::Block(_), Bound::Time(_)) | (Bound::Time(_), Bound::Block(_)) => Err(
            StreamError::InvalidQuery("start_from and read_until mix block and time bounds".into()),
        ),
        (Bound::Block(s), Bound::Block(e)) if e < s => Err(StreamError::InvalidQuery(format!(
            "read_until block {e} precedes start_from block {s}"
        ))),
        (Bound::Time(s), Bound::Time(e)) if e < s => Err(StreamError::InvalidQuery(format!(
            "read_until {e} precedes start_from {s}"
        ))),
        _ => Ok(()),
    }
}

// ─── Action query ────────────────────────────────────────────────────────────

/// Match on a field of the action data, e.g. `act.data.miner = foo.wam`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReqFilter {
    pub field: String,
    pub value: String,
}

/// Request for a stream of action traces.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActionQuery {
    pub contract: String,
    pub account: String,
    pub action: String,
    pub filters: Vec<ReqFilter>,
    pub start_from: Bound,
    pub read_until: Bound,
}

impl ActionQuery {
    /// Live stream of `contract::action`, optionally narrowed to `account`
    /// (empty = any account).
    pub fn new(
        contract: impl Into<String>,
        account: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            contract: contract.into(),
            account: account.into(),
            action: action.into(),
            ..Default::default()
        }
    }

    /// Replay from block `start` through `end` (0 = head).
    pub fn by_block(mut self, start: u64, end: u64) -> Self {
        self.start_from = Bound::block(start);
        self.read_until = Bound::block(end);
        self
    }

    /// Replay from `start` through `end` (`None` = head).
    pub fn by_time(mut self, start: DateTime<Utc>, end: Option<DateTime<Utc>>) -> Self {
        self.start_from = Bound::Time(start);
        self.read_until = end.into();
        self
    }

    /// Set arbitrary bounds.
    pub fn window(mut self, start: impl Into<Bound>, end: impl Into<Bound>) -> Self {
        self.start_from = start.into();
        self.read_until = end.into();
        self
    }

    /// Add a data filter (can be called multiple times).
    pub fn with_filter(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.filters.push(ReqFilter {
            field: field.into(),
            value: value.into(),
        });
        self
    }

    pub fn validate(&self) -> Result<(), StreamError> {
        if self.contract.is_empty() {
            return Err(StreamError::InvalidQuery("contract is required".into()));
        }
        check_window(&self.start_from, &self.read_until)
    }
}

// ─── Delta query ─────────────────────────────────────────────────────────────

/// Request for a stream of contract table deltas.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeltaQuery {
    pub code: String,
    pub table: String,
    pub scope: String,
    pub payer: String,
    pub start_from: Bound,
    pub read_until: Bound,
}

impl DeltaQuery {
    /// Live stream of `code::table`; empty `scope`/`payer` match anything.
    pub fn new(
        code: impl Into<String>,
        table: impl Into<String>,
        scope: impl Into<String>,
        payer: impl Into<String>,
    ) -> Self {
        Self {
            code: code.into(),
            table: table.into(),
            scope: scope.into(),
            payer: payer.into(),
            ..Default::default()
        }
    }

    /// Replay from block `start` through `end` (0 = head).
    pub fn by_block(mut self, start: u64, end: u64) -> Self {
        self.start_from = Bound::block(start);
        self.read_until = Bound::block(end);
        self
    }

    /// Replay from `start` through `end` (`None` = head).
    pub fn by_time(mut self, start: DateTime<Utc>, end: Option<DateTime<Utc>>) -> Self {
        self.start_from = Bound::Time(start);
        self.read_until = end.into();
        self
    }

    pub fn window(mut self, start: impl Into<Bound>, end: impl Into<Bound>) -> Self {
        self.start_from = start.into();
        self.read_until = end.into();
        self
    }

    pub fn validate(&self) -> Result<(), StreamError> {
        if self.code.is_empty() {
            return Err(StreamError::InvalidQuery("code is required".into()));
        }
        check_window(&self.start_from, &self.read_until)
    }
}

// ─── Query ───────────────────────────────────────────────────────────────────

/// The single subscription a connection carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Query {
    Actions(ActionQuery),
    Deltas(DeltaQuery),
}

impl Query {
    /// Event name the request is emitted under.
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Actions(_) => ACTION_STREAM_REQUEST,
            Self::Deltas(_) => DELTA_STREAM_REQUEST,
        }
    }

    pub fn validate(&self) -> Result<(), StreamError> {
        match self {
            Self::Actions(q) => q.validate(),
            Self::Deltas(q) => q.validate(),
        }
    }

    /// JSON body of the request.
    pub fn to_json(&self) -> Result<String, StreamError> {
        serde_json::to_string(self).map_err(StreamError::Encode)
    }

    pub fn to_value(&self) -> Result<Value, StreamError> {
        serde_json::to_value(self).map_err(StreamError::Encode)
    }
}

impl From<ActionQuery> for Query {
    fn from(q: ActionQuery) -> Self {
        Self::Actions(q)
    }
}

impl From<DeltaQuery> for Query {
    fn from(q: DeltaQuery) -> Self {
        Self::Deltas(q)
    }
}
