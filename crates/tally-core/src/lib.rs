//! Core types and trait definitions for the Tally subscription meter.
//!
//! This crate holds the subscription lifecycle state machine and the traffic
//! metering kernel. It is deliberately free of database, logging and async
//! runtime dependencies: every operation is a synchronous mutation of
//! in-memory state, and persistence is reached only through the
//! [`store::MeteringStore`] trait implemented by backend crates.

pub mod error;
pub mod period;
pub mod plan;
pub mod quota;
pub mod status;
pub mod store;
pub mod subscription;
pub mod usage;

pub use error::{Error, ErrorKind, Operation, Result};
