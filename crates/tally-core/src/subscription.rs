//! The subscription aggregate.
//!
//! A [`Subscription`] is a single consistency boundary. Every accepted
//! state-mutating operation bumps `version` by exactly one; idempotent calls
//! (activating an already-active subscription, setting a flag to its current
//! value) succeed without touching `version` or `updated_at`. Failed calls
//! leave the aggregate untouched.
//!
//! Concurrency is not handled here. The store compares
//! [`Subscription::persisted_version`] against the stored row when writing
//! and rejects the write if another writer got there first.

use std::{collections::BTreeMap, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Error, Operation, Result, status::SubscriptionStatus};

/// Caller-defined key/value bag. Never interpreted by the kernel.
pub type Metadata = BTreeMap<String, serde_json::Value>;

// ─── Owner ───────────────────────────────────────────────────────────────────

/// The kind of principal that owns a subscription.
#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Hash,
  Serialize,
  Deserialize,
  strum::Display,
  strum::EnumString,
  strum::EnumIter,
  strum::IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SubjectKind {
  User,
  Organization,
  ServiceAccount,
}

impl SubjectKind {
  pub fn as_str(self) -> &'static str { self.into() }

  pub fn parse(s: &str) -> Result<Self> {
    Self::from_str(s).map_err(|_| Error::UnknownVariant {
      kind:  "subject kind",
      value: s.to_owned(),
    })
  }
}

// ─── Input ───────────────────────────────────────────────────────────────────

/// Input to [`Subscription::new`]. Identity, status and version are assigned
/// by the aggregate and the store, not accepted from callers.
#[derive(Debug, Clone)]
pub struct NewSubscription {
  pub subject_kind: SubjectKind,
  pub subject_id:   i64,
  pub plan_id:      i64,
  pub start_date:   DateTime<Utc>,
  pub end_date:     DateTime<Utc>,
  pub auto_renew:   bool,
  pub metadata:     Metadata,
}

// ─── Persistence shape ───────────────────────────────────────────────────────

/// The flat, fully public form a store reads and writes.
///
/// Converting back into a [`Subscription`] re-checks every invariant, so a
/// corrupted row surfaces as [`Error::Integrity`] rather than as an
/// aggregate in an impossible state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionRecord {
  pub id:                   i64,
  pub link_token:           Uuid,
  pub subject_kind:         SubjectKind,
  pub subject_id:           i64,
  pub plan_id:              i64,
  pub status:               SubscriptionStatus,
  pub start_date:           DateTime<Utc>,
  pub end_date:             DateTime<Utc>,
  pub current_period_start: DateTime<Utc>,
  pub current_period_end:   DateTime<Utc>,
  pub auto_renew:           bool,
  pub cancelled_at:         Option<DateTime<Utc>>,
  pub cancel_reason:        Option<String>,
  pub suspended_at:         Option<DateTime<Utc>>,
  pub suspension_reason:    Option<String>,
  pub usage_reset_at:       Option<DateTime<Utc>>,
  pub metadata:             Metadata,
  pub version:              i64,
  pub created_at:           DateTime<Utc>,
  pub updated_at:           DateTime<Utc>,
}

// ─── Aggregate ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct Subscription {
  id:                   Option<i64>,
  link_token:           Uuid,
  subject_kind:         SubjectKind,
  subject_id:           i64,
  plan_id:              i64,
  status:               SubscriptionStatus,
  start_date:           DateTime<Utc>,
  end_date:             DateTime<Utc>,
  current_period_start: DateTime<Utc>,
  current_period_end:   DateTime<Utc>,
  auto_renew:           bool,
  cancelled_at:         Option<DateTime<Utc>>,
  cancel_reason:        Option<String>,
  suspended_at:         Option<DateTime<Utc>>,
  suspension_reason:    Option<String>,
  usage_reset_at:       Option<DateTime<Utc>>,
  metadata:             Metadata,
  version:              i64,
  /// The version last read from or written to storage; `0` if never stored.
  persisted_version:    i64,
  created_at:           DateTime<Utc>,
  updated_at:           DateTime<Utc>,
}

impl Subscription {
  /// Build a fresh, unsaved subscription in status `inactive` at version 1.
  /// The first billing period spans the whole validity window.
  pub fn new(input: NewSubscription) -> Result<Self> {
    if input.subject_id <= 0 {
      return Err(Error::required("subject_id"));
    }
    if input.plan_id <= 0 {
      return Err(Error::required("plan_id"));
    }
    if input.end_date < input.start_date {
      return Err(Error::validation("end_date", "precedes start_date"));
    }

    let now = Utc::now();
    Ok(Self {
      id:                   None,
      link_token:           Uuid::new_v4(),
      subject_kind:         input.subject_kind,
      subject_id:           input.subject_id,
      plan_id:              input.plan_id,
      status:               SubscriptionStatus::Inactive,
      start_date:           input.start_date,
      end_date:             input.end_date,
      current_period_start: input.start_date,
      current_period_end:   input.end_date,
      auto_renew:           input.auto_renew,
      cancelled_at:         None,
      cancel_reason:        None,
      suspended_at:         None,
      suspension_reason:    None,
      usage_reset_at:       None,
      metadata:             input.metadata,
      version:              1,
      persisted_version:    0,
      created_at:           now,
      updated_at:           now,
    })
  }

  /// Rehydrate a stored subscription, checking every invariant.
  pub fn from_record(r: SubscriptionRecord) -> Result<Self> {
    let fail = |what: &str| {
      Err(Error::Integrity(format!("subscription {}: {what}", r.id)))
    };
    if r.id <= 0 {
      return fail("id is not positive");
    }
    if r.subject_id <= 0 {
      return fail("subject_id is not positive");
    }
    if r.plan_id <= 0 {
      return fail("plan_id is not positive");
    }
    if r.end_date < r.start_date {
      return fail("end_date precedes start_date");
    }
    if r.current_period_end < r.current_period_start {
      return fail("current_period_end precedes current_period_start");
    }
    if r.current_period_end > r.end_date {
      return fail("current_period_end is after end_date");
    }
    if r.version < 1 {
      return fail("version is not positive");
    }

    Ok(Self {
      id:                   Some(r.id),
      link_token:           r.link_token,
      subject_kind:         r.subject_kind,
      subject_id:           r.subject_id,
      plan_id:              r.plan_id,
      status:               r.status,
      start_date:           r.start_date,
      end_date:             r.end_date,
      current_period_start: r.current_period_start,
      current_period_end:   r.current_period_end,
      auto_renew:           r.auto_renew,
      cancelled_at:         r.cancelled_at,
      cancel_reason:        r.cancel_reason,
      suspended_at:         r.suspended_at,
      suspension_reason:    r.suspension_reason,
      usage_reset_at:       r.usage_reset_at,
      metadata:             r.metadata,
      version:              r.version,
      persisted_version:    r.version,
      created_at:           r.created_at,
      updated_at:           r.updated_at,
    })
  }

  /// Flatten into the persistence shape. Unsaved subscriptions carry id `0`.
  pub fn to_record(&self) -> SubscriptionRecord {
    SubscriptionRecord {
      id:                   self.id.unwrap_or(0),
      link_token:           self.link_token,
      subject_kind:         self.subject_kind,
      subject_id:           self.subject_id,
      plan_id:              self.plan_id,
      status:               self.status,
      start_date:           self.start_date,
      end_date:             self.end_date,
      current_period_start: self.current_period_start,
      current_period_end:   self.current_period_end,
      auto_renew:           self.auto_renew,
      cancelled_at:         self.cancelled_at,
      cancel_reason:        self.cancel_reason.clone(),
      suspended_at:         self.suspended_at,
      suspension_reason:    self.suspension_reason.clone(),
      usage_reset_at:       self.usage_reset_at,
      metadata:             self.metadata.clone(),
      version:              self.version,
      created_at:           self.created_at,
      updated_at:           self.updated_at,
    }
  }

  // ── Accessors ─────────────────────────────────────────────────────────────

  pub fn id(&self) -> Option<i64> { self.id }
  pub fn link_token(&self) -> Uuid { self.link_token }
  pub fn subject_kind(&self) -> SubjectKind { self.subject_kind }
  pub fn subject_id(&self) -> i64 { self.subject_id }
  pub fn plan_id(&self) -> i64 { self.plan_id }
  pub fn status(&self) -> SubscriptionStatus { self.status }
  pub fn start_date(&self) -> DateTime<Utc> { self.start_date }
  pub fn end_date(&self) -> DateTime<Utc> { self.end_date }
  pub fn current_period_start(&self) -> DateTime<Utc> { self.current_period_start }
  pub fn current_period_end(&self) -> DateTime<Utc> { self.current_period_end }
  pub fn auto_renew(&self) -> bool { self.auto_renew }
  pub fn cancelled_at(&self) -> Option<DateTime<Utc>> { self.cancelled_at }
  pub fn cancel_reason(&self) -> Option<&str> { self.cancel_reason.as_deref() }
  pub fn suspended_at(&self) -> Option<DateTime<Utc>> { self.suspended_at }
  pub fn suspension_reason(&self) -> Option<&str> { self.suspension_reason.as_deref() }
  pub fn usage_reset_at(&self) -> Option<DateTime<Utc>> { self.usage_reset_at }
  pub fn metadata(&self) -> &Metadata { &self.metadata }
  pub fn version(&self) -> i64 { self.version }
  pub fn persisted_version(&self) -> i64 { self.persisted_version }
  pub fn created_at(&self) -> DateTime<Utc> { self.created_at }
  pub fn updated_at(&self) -> DateTime<Utc> { self.updated_at }

  /// Whether there are mutations not yet written to storage.
  pub fn is_dirty(&self) -> bool { self.version != self.persisted_version }

  // ── Derived queries ───────────────────────────────────────────────────────

  pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool { now > self.end_date }

  pub fn is_expired(&self) -> bool { self.is_expired_at(Utc::now()) }

  pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
    self.status.grants_access() && !self.is_expired_at(now)
  }

  pub fn is_active(&self) -> bool { self.is_active_at(Utc::now()) }

  /// The status as callers should see it: `expired` once the end date has
  /// passed, if the stored status could legally become `expired`.
  pub fn effective_status_at(&self, now: DateTime<Utc>) -> SubscriptionStatus {
    if self.is_expired_at(now)
      && self.status.can_transition_to(SubscriptionStatus::Expired)
    {
      SubscriptionStatus::Expired
    } else {
      self.status
    }
  }

  pub fn effective_status(&self) -> SubscriptionStatus {
    self.effective_status_at(Utc::now())
  }

  // ── Lifecycle operations ──────────────────────────────────────────────────

  pub fn activate(&mut self) -> Result<()> {
    use SubscriptionStatus::*;
    if self.status == Active {
      return Ok(());
    }
    self.require(
      Operation::Activate,
      matches!(self.status, Inactive | PendingPayment | Trialing),
    )?;
    self.status = Active;
    self.touch();
    Ok(())
  }

  /// Cancel permanently. Besides the table's `-> cancelled` edges,
  /// cancellation is allowed before activation (`inactive`,
  /// `pending_payment`).
  pub fn cancel(&mut self, reason: &str) -> Result<()> {
    use SubscriptionStatus::*;
    let reason = required_text("reason", reason)?;
    if self.status == Cancelled {
      return Ok(());
    }
    self.require(
      Operation::Cancel,
      self.status.can_transition_to(Cancelled)
        || matches!(self.status, Inactive | PendingPayment),
    )?;
    let now = Utc::now();
    self.status = Cancelled;
    self.cancelled_at = Some(now);
    self.cancel_reason = Some(reason);
    self.touch_at(now);
    Ok(())
  }

  pub fn suspend(&mut self, reason: &str) -> Result<()> {
    use SubscriptionStatus::*;
    let reason = required_text("reason", reason)?;
    if self.status == Suspended {
      return Ok(());
    }
    self.require(Operation::Suspend, self.status == Active)?;
    let now = Utc::now();
    self.status = Suspended;
    self.suspended_at = Some(now);
    self.suspension_reason = Some(reason);
    self.touch_at(now);
    Ok(())
  }

  pub fn unsuspend(&mut self) -> Result<()> {
    self.require(
      Operation::Unsuspend,
      self.status == SubscriptionStatus::Suspended,
    )?;
    self.lift_suspension();
    self.touch();
    Ok(())
  }

  /// Extend the subscription to `new_end_date`.
  ///
  /// The current billing period rolls forward to
  /// `[old current_period_end, new_end_date)`, and an `expired` subscription
  /// becomes `active` again.
  pub fn renew(&mut self, new_end_date: DateTime<Utc>) -> Result<()> {
    self.require(Operation::Renew, self.status.can_renew())?;
    if new_end_date <= self.end_date {
      return Err(Error::validation(
        "new_end_date",
        format!("must be after the current end date {}", self.end_date),
      ));
    }
    self.current_period_start = self.current_period_end;
    self.current_period_end = new_end_date;
    self.end_date = new_end_date;
    if self.status == SubscriptionStatus::Expired {
      self.status = SubscriptionStatus::Active;
    }
    self.touch();
    Ok(())
  }

  pub fn change_plan(&mut self, new_plan_id: i64) -> Result<()> {
    use SubscriptionStatus::*;
    if new_plan_id <= 0 {
      return Err(Error::required("plan_id"));
    }
    if new_plan_id == self.plan_id {
      return Ok(());
    }
    self.require(Operation::ChangePlan, matches!(self.status, Active | Trialing))?;
    self.plan_id = new_plan_id;
    self.touch();
    Ok(())
  }

  pub fn mark_as_expired(&mut self) -> Result<()> {
    use SubscriptionStatus::*;
    if self.status == Expired {
      return Ok(());
    }
    self.require(Operation::MarkAsExpired, self.status.can_transition_to(Expired))?;
    self.status = Expired;
    self.touch();
    Ok(())
  }

  /// Mark the start of a new metering period. A suspended subscription is
  /// returned to `active`. Usage counters are the caller's to reset.
  pub fn reset_usage(&mut self) -> Result<()> {
    use SubscriptionStatus::*;
    self.require(Operation::ResetUsage, matches!(self.status, Active | Suspended))?;
    if self.status == Suspended {
      self.lift_suspension();
    }
    let now = Utc::now();
    self.usage_reset_at = Some(now);
    self.touch_at(now);
    Ok(())
  }

  // ── Unconditional mutators ────────────────────────────────────────────────

  /// Returns whether the value changed.
  pub fn set_auto_renew(&mut self, auto_renew: bool) -> bool {
    if self.auto_renew == auto_renew {
      return false;
    }
    self.auto_renew = auto_renew;
    self.touch();
    true
  }

  /// Returns whether the bag changed.
  pub fn set_metadata(
    &mut self,
    key: impl Into<String>,
    value: serde_json::Value,
  ) -> bool {
    let key = key.into();
    if self.metadata.get(&key) == Some(&value) {
      return false;
    }
    self.metadata.insert(key, value);
    self.touch();
    true
  }

  pub fn remove_metadata(&mut self, key: &str) -> Option<serde_json::Value> {
    let removed = self.metadata.remove(key);
    if removed.is_some() {
      self.touch();
    }
    removed
  }

  /// Returns whether the bag changed.
  pub fn replace_metadata(&mut self, metadata: Metadata) -> bool {
    if self.metadata == metadata {
      return false;
    }
    self.metadata = metadata;
    self.touch();
    true
  }

  /// Issue a fresh public link token, invalidating the old one.
  pub fn regenerate_link_token(&mut self) -> Uuid {
    self.link_token = Uuid::new_v4();
    self.touch();
    self.link_token
  }

  // ── Internals ─────────────────────────────────────────────────────────────

  fn require(&self, operation: Operation, allowed: bool) -> Result<()> {
    if allowed {
      Ok(())
    } else {
      Err(Error::InvalidTransition { operation, status: self.status })
    }
  }

  fn lift_suspension(&mut self) {
    self.status = SubscriptionStatus::Active;
    self.suspended_at = None;
    self.suspension_reason = None;
  }

  fn touch(&mut self) { self.touch_at(Utc::now()); }

  fn touch_at(&mut self, now: DateTime<Utc>) {
    self.version += 1;
    self.updated_at = now;
  }
}

fn required_text(field: &'static str, value: &str) -> Result<String> {
  let trimmed = value.trim();
  if trimmed.is_empty() {
    return Err(Error::required(field));
  }
  Ok(trimmed.to_owned())
}
