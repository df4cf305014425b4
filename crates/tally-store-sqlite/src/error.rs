//! Error type for `tally-store-sqlite`.

use tally_core::{ErrorKind, store::StoreError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  /// Domain errors, including version conflicts and integrity violations
  /// detected while decoding rows.
  #[error(transparent)]
  Core(#[from] tally_core::Error),

  #[error("database error: {0}")]
  Database(#[from] tokio_rusqlite::Error),

  #[error("json error: {0}")]
  Json(#[from] serde_json::Error),

  #[error("uuid parse error: {0}")]
  Uuid(#[from] uuid::Error),

  #[error("date/time parse error: {0}")]
  DateParse(String),

  #[error("{field} value {value} does not fit in a 64-bit signed column")]
  OutOfRange { field: &'static str, value: u64 },

  #[error("subscription not found: {0}")]
  SubscriptionNotFound(i64),

  #[error("subscription {0} is already persisted")]
  AlreadyPersisted(i64),

  #[error("subscription has not been persisted yet")]
  NotPersisted,
}

impl Error {
  /// The domain error kind, if this wraps one.
  pub fn core_kind(&self) -> Option<ErrorKind> {
    match self {
      Self::Core(e) => Some(e.kind()),
      _ => None,
    }
  }
}

impl StoreError for Error {
  fn is_version_conflict(&self) -> bool {
    self.core_kind() == Some(ErrorKind::Conflict)
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
