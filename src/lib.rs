#![forbid(unsafe_code)]

//! Client driver for the OrientDB binary network protocol (version >= 28).
//!
//! A [`Client`] owns a persistent TCP session against either the server
//! (administrative scope) or a single database (record CRUD, commands,
//! transactions). Requests are pipelined FIFO over one socket; responses
//! are decoded incrementally as bytes arrive, so replies can span or
//! share TCP segments.

pub mod client;
pub mod config;
pub mod error;
pub mod protocol;
pub mod record;
pub mod session;
pub mod wire;

pub use client::Client;
pub use config::{BackoffPolicy, Config, DatabaseKind, Limits, SocketOptions, Target};
pub use error::{DriverError, ErrorEntry};
pub use protocol::{
    Arg, ClusterInfo, CommandRecord, CommandResult, FetchedRecord, Op, Reply, TxOperation,
    TxOutcome,
};
pub use record::{Decimal, Document, Rid, Value};

pub type Result<T> = std::result::Result<T, DriverError>;
