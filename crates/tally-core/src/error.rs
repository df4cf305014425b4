//! Error types for `tally-core`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::status::SubscriptionStatus;

/// A lifecycle operation on a subscription, named in transition errors.
#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Serialize,
  Deserialize,
  strum::Display,
  strum::IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Operation {
  Activate,
  Cancel,
  Suspend,
  Unsuspend,
  Renew,
  ChangePlan,
  MarkAsExpired,
  ResetUsage,
}

/// Coarse classification of an [`Error`], for callers deciding between
/// retrying, reporting, and giving up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
  /// Malformed input; nothing was mutated.
  Validation,
  /// The operation is not permitted from the current status.
  Transition,
  /// The stored version advanced since it was read. Re-read and retry.
  Conflict,
  /// A loaded record violates an entity invariant. Not retryable.
  Integrity,
}

#[derive(Debug, Error)]
pub enum Error {
  #[error("invalid {field}: {reason}")]
  Validation {
    field:  &'static str,
    reason: String,
  },

  #[error("cannot {operation} a subscription in status {status}")]
  InvalidTransition {
    operation: Operation,
    status:    SubscriptionStatus,
  },

  #[error("subscription {id} was modified concurrently (expected version {expected})")]
  VersionConflict { id: i64, expected: i64 },

  #[error("integrity violation: {0}")]
  Integrity(String),

  #[error("unknown {kind} value: {value:?}")]
  UnknownVariant { kind: &'static str, value: String },
}

impl Error {
  pub(crate) fn validation(field: &'static str, reason: impl Into<String>) -> Self {
    Self::Validation { field, reason: reason.into() }
  }

  pub(crate) fn required(field: &'static str) -> Self {
    Self::validation(field, "is required")
  }

  pub fn kind(&self) -> ErrorKind {
    match self {
      Self::Validation { .. } | Self::UnknownVariant { .. } => ErrorKind::Validation,
      Self::InvalidTransition { .. } => ErrorKind::Transition,
      Self::VersionConflict { .. } => ErrorKind::Conflict,
      Self::Integrity(_) => ErrorKind::Integrity,
    }
  }

  /// Only concurrency conflicts are worth retrying; everything else fails
  /// the same way on a second attempt.
  pub fn is_retryable(&self) -> bool { self.kind() == ErrorKind::Conflict }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
