//! chainstream-core: wire types for Hyperion-style blockchain streams.
//!
//! # Overview
//!
//! The peer speaks socket.io v2 over Engine.IO protocol 3. This crate holds
//! everything that does not need a runtime:
//!
//! - [`envelope`]: inbound frame classification and outbound emissions
//! - [`query`]: [`ActionQuery`] / [`DeltaQuery`] and the polymorphic [`Bound`]
//! - [`classify`]: turns `(event, payload)` into a [`Classified`] outcome
//! - [`response`]: [`Response`], [`ActionTrace`], [`TableDelta`], [`ChainHead`]
//! - [`StreamError`]: the error taxonomy shared with `chainstream-ws`

pub mod classify;
pub mod de;
pub mod envelope;
pub mod error;
pub mod query;
pub mod response;

pub use classify::{Classified, Classifier, Ignored, TraceKinds};
pub use envelope::{Envelope, Handshake};
pub use error::StreamError;
pub use query::{ActionQuery, Bound, DeltaQuery, Query, ReqFilter};
pub use response::{ActionTrace, ChainHead, Mode, RecordKind, Response, TableDelta};
