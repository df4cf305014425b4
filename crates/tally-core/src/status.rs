//! Subscription status values and the transition table.
//!
//! The table in [`SubscriptionStatus::allowed_transitions`] is the single
//! source of truth for which status changes are legal. The lifecycle
//! operations on [`crate::subscription::Subscription`] narrow it further
//! (e.g. `activate` never leaves `suspended`), but never widen it.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Hash,
  Default,
  Serialize,
  Deserialize,
  strum::Display,
  strum::EnumString,
  strum::EnumIter,
  strum::IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SubscriptionStatus {
  /// Created but never activated.
  #[default]
  Inactive,
  PendingPayment,
  Trialing,
  Active,
  /// A renewal payment failed; still usable until it expires or is fixed.
  PastDue,
  /// Usable again only through `unsuspend` or `reset_usage`.
  Suspended,
  /// Terminal.
  Cancelled,
  /// Past its end date; only a renewal brings it back.
  Expired,
}

impl SubscriptionStatus {
  /// Every status reachable in one step from `self`.
  pub fn allowed_transitions(self) -> &'static [SubscriptionStatus] {
    use SubscriptionStatus::*;
    match self {
      Inactive => &[PendingPayment, Active, Trialing],
      PendingPayment => &[Active, Inactive, Expired],
      Trialing => &[Active, Cancelled, Expired, Suspended],
      Active => &[PastDue, Cancelled, Expired, Suspended],
      PastDue => &[Active, Cancelled, Expired, Suspended],
      Suspended => &[Active],
      Cancelled => &[],
      Expired => &[Active],
    }
  }

  pub fn can_transition_to(self, target: SubscriptionStatus) -> bool {
    self.allowed_transitions().contains(&target)
  }

  pub fn is_terminal(self) -> bool { self.allowed_transitions().is_empty() }

  /// Statuses from which `renew` is accepted.
  pub fn can_renew(self) -> bool {
    matches!(self, Self::Active | Self::PastDue | Self::Expired)
  }

  /// Statuses that grant use of the provisioned resources, before the end
  /// date is taken into account.
  pub fn grants_access(self) -> bool {
    matches!(self, Self::Active | Self::Trialing)
  }

  pub fn as_str(self) -> &'static str { self.into() }

  /// Parse the snake_case name used on the wire and in storage.
  pub fn parse(s: &str) -> Result<Self> {
    Self::from_str(s).map_err(|_| Error::UnknownVariant {
      kind:  "subscription status",
      value: s.to_owned(),
    })
  }
}
