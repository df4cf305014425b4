//! The calling side of the Tally kernel: configuration, retry-on-conflict
//! persistence, traffic accrual and quota enforcement over any
//! [`tally_core::store::MeteringStore`].

pub mod config;
pub mod error;
pub mod service;

pub use config::MeterConfig;
pub use error::{Error, Result};
pub use service::{Enforcement, MeteringService, TrafficOutcome};
