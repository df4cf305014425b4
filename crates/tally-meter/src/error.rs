//! Error type for `tally-meter`.

use tally_core::store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error(transparent)]
  Core(#[from] tally_core::Error),

  #[error("store error: {0}")]
  Store(#[source] Box<dyn std::error::Error + Send + Sync>),

  #[error("subscription not found: {0}")]
  SubscriptionNotFound(i64),

  #[error("plan not found: {0}")]
  PlanNotFound(i64),

  #[error("subscription {id} still conflicting after {attempts} attempts")]
  RetriesExhausted { id: i64, attempts: u32 },

  #[error("invalid configuration: {0}")]
  Config(String),
}

impl Error {
  pub(crate) fn store(e: impl StoreError) -> Self { Self::Store(Box::new(e)) }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
