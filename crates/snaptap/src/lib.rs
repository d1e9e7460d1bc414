//! snaptap: request/response capture for RPC services.
//!
//! This crate holds the transport-independent half of the intercept
//! pipeline: the [`LogRecord`] model describing one observed request or
//! response, and the [`LogSink`] that appends encoded records to a
//! newline-delimited JSON log.
//!
//! Each entry has the shape
//!
//! ```text
//! {"method":"/pkg.Service/Method","type":"request","message":{...}}
//! ```
//!
//! where `message` is the payload rendered through its own `Serialize`
//! implementation. The transport layer (see `snaptap-grpc`) decides which
//! messages to record and when.

mod record;
mod sink;

pub use record::{FailureRecord, LogRecord, RecordError, RecordKind};
pub use sink::{LogSink, SinkError};
