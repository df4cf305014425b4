//! The `MeteringStore` trait and supporting query types.
//!
//! The trait is implemented by storage backends (e.g. `tally-store-sqlite`).
//! The metering service depends on this abstraction, not on any concrete
//! backend. The kernel types never call it themselves.

use std::future::Future;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
  plan::PlanFeatures,
  status::SubscriptionStatus,
  subscription::{SubjectKind, Subscription},
  usage::{Granularity, ResourceKind, ResourceRef, UsageKey, UsageStats, UsageTotals},
};

// ─── Query types ─────────────────────────────────────────────────────────────

/// Parameters for [`MeteringStore::list_subscriptions`]. Empty filters match
/// everything.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionQuery {
  pub subject:     Option<(SubjectKind, i64)>,
  pub plan_id:     Option<i64>,
  /// Match any of these statuses.
  pub statuses:    Vec<SubscriptionStatus>,
  /// `end_date >= ends_after`
  pub ends_after:  Option<DateTime<Utc>>,
  /// `end_date < ends_before`
  pub ends_before: Option<DateTime<Utc>>,
  pub limit:       Option<usize>,
  pub offset:      Option<usize>,
}

/// Parameters for the usage reads. Empty filters match everything.
#[derive(Debug, Clone, Default)]
pub struct UsageQuery {
  /// Match any of these exact resources.
  pub resources:       Vec<ResourceRef>,
  /// Match any resource of these kinds.
  pub resource_kinds:  Vec<ResourceKind>,
  pub subscription_id: Option<i64>,
  pub granularity:     Option<Granularity>,
  /// Inclusive lower bound on `period`.
  pub from:            Option<NaiveDate>,
  /// Exclusive upper bound on `period`.
  pub until:           Option<NaiveDate>,
  pub limit:           Option<usize>,
  pub offset:          Option<usize>,
}

/// One page of usage rows plus the unpaginated match count.
#[derive(Debug, Clone, Default)]
pub struct UsagePage {
  pub items:       Vec<UsageStats>,
  pub total_count: u64,
}

/// Usage summed per period, for trend reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageTrendPoint {
  pub period: NaiveDate,
  pub totals: UsageTotals,
}

// ─── Errors ──────────────────────────────────────────────────────────────────

/// What callers need to know about a backend error to pick a retry policy.
pub trait StoreError: std::error::Error + Send + Sync + 'static {
  /// The write was rejected because the stored version moved on.
  fn is_version_conflict(&self) -> bool;
}

// ─── Trait ───────────────────────────────────────────────────────────────────

/// Abstraction over a Tally storage backend.
///
/// Subscription updates are optimistic: a write succeeds only if the stored
/// version still equals [`Subscription::persisted_version`]. Usage increments
/// are atomic upserts at the storage layer.
///
/// All methods return `Send` futures so the trait can be used in
/// multi-threaded async runtimes.
pub trait MeteringStore: Send + Sync {
  type Error: StoreError;

  // ── Subscriptions ─────────────────────────────────────────────────────

  /// Persist a new subscription and return it with its assigned id.
  fn insert_subscription(
    &self,
    subscription: Subscription,
  ) -> impl Future<Output = Result<Subscription, Self::Error>> + Send + '_;

  /// Write back a loaded subscription.
  ///
  /// Fails with a version conflict if the stored row is no longer at
  /// `subscription.persisted_version()`. Writing an unchanged subscription is
  /// a no-op.
  fn update_subscription(
    &self,
    subscription: Subscription,
  ) -> impl Future<Output = Result<Subscription, Self::Error>> + Send + '_;

  /// Returns whether a row was deleted.
  fn delete_subscription(
    &self,
    id: i64,
  ) -> impl Future<Output = Result<bool, Self::Error>> + Send + '_;

  fn get_subscription(
    &self,
    id: i64,
  ) -> impl Future<Output = Result<Option<Subscription>, Self::Error>> + Send + '_;

  fn get_subscription_by_link_token(
    &self,
    token: Uuid,
  ) -> impl Future<Output = Result<Option<Subscription>, Self::Error>> + Send + '_;

  fn list_subscriptions<'a>(
    &'a self,
    query: &'a SubscriptionQuery,
  ) -> impl Future<Output = Result<Vec<Subscription>, Self::Error>> + Send + 'a;

  // ── Plans ─────────────────────────────────────────────────────────────

  /// Insert or replace the quota-relevant fields of a plan.
  fn put_plan(
    &self,
    plan: PlanFeatures,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  fn get_plan(
    &self,
    plan_id: i64,
  ) -> impl Future<Output = Result<Option<PlanFeatures>, Self::Error>> + Send + '_;

  // ── Usage writes ──────────────────────────────────────────────────────

  /// Atomically add `delta` to the row for `key`, creating it on first use.
  /// A zero delta writes nothing and returns the current row, if any.
  fn record_usage(
    &self,
    key: UsageKey,
    delta: UsageTotals,
  ) -> impl Future<Output = Result<Option<UsageStats>, Self::Error>> + Send + '_;

  /// Upsert `stats` with absolute counter values (reconciliation).
  fn put_usage(
    &self,
    stats: UsageStats,
  ) -> impl Future<Output = Result<UsageStats, Self::Error>> + Send + '_;

  /// Rebuild the monthly row for `resource` and the month containing
  /// `month` from that month's daily rows with the same owner
  /// (`subscription_id`, or unattributed when `None`).
  fn rollup_monthly(
    &self,
    resource: ResourceRef,
    subscription_id: Option<i64>,
    month: NaiveDate,
  ) -> impl Future<Output = Result<UsageStats, Self::Error>> + Send + '_;

  // ── Usage reads ───────────────────────────────────────────────────────

  fn get_usage(
    &self,
    key: UsageKey,
  ) -> impl Future<Output = Result<Option<UsageStats>, Self::Error>> + Send + '_;

  fn list_usage<'a>(
    &'a self,
    query: &'a UsageQuery,
  ) -> impl Future<Output = Result<UsagePage, Self::Error>> + Send + 'a;

  /// Sum all rows matching `query`, ignoring `limit`/`offset`.
  fn sum_usage<'a>(
    &'a self,
    query: &'a UsageQuery,
  ) -> impl Future<Output = Result<UsageTotals, Self::Error>> + Send + 'a;

  /// Sum matching rows per period, oldest first.
  fn usage_trend<'a>(
    &'a self,
    query: &'a UsageQuery,
  ) -> impl Future<Output = Result<Vec<UsageTrendPoint>, Self::Error>> + Send + 'a;
}
