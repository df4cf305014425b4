//! [`MeteringService`] drives the kernel against a [`MeteringStore`].
//!
//! The kernel types never do I/O and never retry. This layer loads
//! aggregates, applies a lifecycle operation, and writes them back under the
//! optimistic version check, re-reading and re-applying when another writer
//! got there first.

use std::collections::HashSet;

use chrono::{DateTime, FixedOffset, Utc};
use serde::Serialize;
use tally_core::{
  plan::PlanFeatures,
  period::resolve_traffic_period,
  quota::{QuotaEvaluation, TRAFFIC_LIMIT_EXCEEDED, evaluate_quota},
  status::SubscriptionStatus,
  store::{MeteringStore, StoreError as _, SubscriptionQuery, UsageQuery},
  subscription::Subscription,
  usage::{Granularity, ResourceRef, UsageKey, UsageStats, UsageTotals},
};

use crate::{Error, MeterConfig, Result};

// ─── Outcomes ────────────────────────────────────────────────────────────────

/// What quota enforcement decided for one subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "evaluation", rename_all = "snake_case")]
pub enum Enforcement {
  /// The plan sets no traffic limit.
  NotApplicable,
  /// Usage is below the limit.
  Within(QuotaEvaluation),
  /// Usage reached the limit and the subscription was suspended now.
  Suspended(QuotaEvaluation),
  /// Usage reached the limit; the subscription was already suspended.
  AlreadySuspended(QuotaEvaluation),
  /// Usage reached the limit but the subscription is in a status that
  /// cannot be suspended (e.g. trialing, cancelled).
  Exceeded(QuotaEvaluation),
}

/// The rows touched by [`MeteringService::record_traffic`] and the
/// enforcement decision that followed.
#[derive(Debug, Clone)]
pub struct TrafficOutcome {
  /// `None` only when the delta was zero and no row existed yet.
  pub daily:       Option<UsageStats>,
  pub monthly:     Option<UsageStats>,
  pub enforcement: Enforcement,
}

// ─── Service ─────────────────────────────────────────────────────────────────

pub struct MeteringService<S> {
  store:                S,
  tz:                   FixedOffset,
  max_conflict_retries: u32,
}

impl<S: MeteringStore> MeteringService<S> {
  pub fn new(store: S, tz: FixedOffset) -> Self {
    Self { store, tz, max_conflict_retries: 3 }
  }

  pub fn from_config(store: S, config: &MeterConfig) -> Result<Self> {
    Ok(
      Self::new(store, config.timezone()?)
        .with_max_conflict_retries(config.max_conflict_retries),
    )
  }

  pub fn with_max_conflict_retries(mut self, retries: u32) -> Self {
    self.max_conflict_retries = retries;
    self
  }

  pub fn store(&self) -> &S { &self.store }

  pub fn timezone(&self) -> FixedOffset { self.tz }

  // ── Loading ───────────────────────────────────────────────────────────────

  pub async fn subscription(&self, id: i64) -> Result<Subscription> {
    self
      .store
      .get_subscription(id)
      .await
      .map_err(Error::store)?
      .ok_or(Error::SubscriptionNotFound(id))
  }

  async fn plan(&self, plan_id: i64) -> Result<PlanFeatures> {
    self
      .store
      .get_plan(plan_id)
      .await
      .map_err(Error::store)?
      .ok_or(Error::PlanNotFound(plan_id))
  }

  /// Load subscription `id`, apply `op`, and write it back.
  ///
  /// A lost version race re-reads the row and re-applies `op` from scratch,
  /// at most `max_conflict_retries` times. An `op` that leaves the
  /// subscription unchanged writes nothing.
  pub async fn with_retry<T, F>(&self, id: i64, mut op: F) -> Result<(Subscription, T)>
  where
    F: FnMut(&mut Subscription) -> tally_core::Result<T> + Send,
    T: Send,
  {
    let mut attempts = 0;
    loop {
      attempts += 1;
      let mut sub = self.subscription(id).await?;
      let out = op(&mut sub)?;
      if !sub.is_dirty() {
        return Ok((sub, out));
      }

      match self.store.update_subscription(sub).await {
        Ok(saved) => return Ok((saved, out)),
        Err(e) if e.is_version_conflict() && attempts <= self.max_conflict_retries => {
          tracing::warn!(subscription_id = id, attempt = attempts, "version conflict, retrying");
        }
        Err(e) if e.is_version_conflict() => {
          tracing::warn!(subscription_id = id, attempts, "version conflict, giving up");
          return Err(Error::RetriesExhausted { id, attempts });
        }
        Err(e) => return Err(Error::store(e)),
      }
    }
  }

  // ── Metering ──────────────────────────────────────────────────────────────

  /// Accrue `upload`/`download` bytes observed at `at` for `resource` into
  /// its daily and monthly rows, then enforce the quota as of `at`.
  pub async fn record_traffic(
    &self,
    subscription_id: i64,
    resource: ResourceRef,
    upload: u64,
    download: u64,
    at: DateTime<Utc>,
  ) -> Result<TrafficOutcome> {
    let sub = self.subscription(subscription_id).await?;
    if !sub.effective_status_at(at).grants_access() {
      tracing::warn!(
        subscription_id,
        status = %sub.status(),
        "recording traffic for a subscription without access"
      );
    }

    let day = at.with_timezone(&self.tz).date_naive();
    let delta = UsageTotals::new(upload, download);
    let mut rows = Vec::with_capacity(2);
    for granularity in [Granularity::Daily, Granularity::Monthly] {
      let key =
        UsageKey::for_date(resource, granularity, day).for_subscription(subscription_id);
      let row = self
        .store
        .record_usage(key, delta)
        .await
        .map_err(Error::store)?;
      rows.push(row);
    }
    let monthly = rows.pop().flatten();
    let daily = rows.pop().flatten();

    tracing::debug!(
      subscription_id,
      resource_kind = %resource.kind,
      resource_id = resource.id,
      upload,
      download,
      %day,
      "traffic recorded"
    );

    let enforcement = self.enforce_quota_at(subscription_id, at).await?;
    Ok(TrafficOutcome { daily, monthly, enforcement })
  }

  /// Usage against the plan limit for the traffic period containing `now`.
  /// Returns `None` when the plan sets no limit.
  pub async fn evaluate_at(
    &self,
    sub: &Subscription,
    now: DateTime<Utc>,
  ) -> Result<Option<QuotaEvaluation>> {
    let plan = self.plan(sub.plan_id()).await?;
    if plan.is_unlimited_traffic() {
      return Ok(None);
    }

    // Resolved fresh on every check: plan and billing period may have moved.
    let period = resolve_traffic_period(plan.traffic_reset_mode, Some(sub), now, &self.tz);
    let (from, until) = period.day_range(&self.tz);
    let query = UsageQuery {
      resource_kinds:  plan.plan_type.resource_kinds().to_vec(),
      subscription_id: sub.id(),
      granularity:     Some(Granularity::Daily),
      from:            Some(from),
      until:           Some(until),
      ..Default::default()
    };
    let used = self.store.sum_usage(&query).await.map_err(Error::store)?;

    Ok(Some(evaluate_quota(&plan, period, used.total())))
  }

  pub async fn enforce_quota(&self, subscription_id: i64) -> Result<Enforcement> {
    self.enforce_quota_at(subscription_id, Utc::now()).await
  }

  /// Suspend the subscription if its usage in the period containing `now`
  /// has reached the plan limit.
  pub async fn enforce_quota_at(
    &self,
    subscription_id: i64,
    now: DateTime<Utc>,
  ) -> Result<Enforcement> {
    let sub = self.subscription(subscription_id).await?;
    let Some(evaluation) = self.evaluate_at(&sub, now).await? else {
      return Ok(Enforcement::NotApplicable);
    };

    if !evaluation.is_exhausted() {
      return Ok(Enforcement::Within(evaluation));
    }
    match sub.status() {
      SubscriptionStatus::Suspended => return Ok(Enforcement::AlreadySuspended(evaluation)),
      s if !evaluation.should_suspend(s) => return Ok(Enforcement::Exceeded(evaluation)),
      _ => {}
    }

    // The status may move between our read and the write; re-check on retry.
    let (_, suspended) = self
      .with_retry(subscription_id, |s| {
        if !evaluation.should_suspend(s.status()) {
          return Ok(false);
        }
        s.suspend(TRAFFIC_LIMIT_EXCEEDED)?;
        Ok(true)
      })
      .await?;

    if suspended {
      tracing::warn!(
        subscription_id,
        used_bytes = evaluation.used_bytes,
        limit_bytes = evaluation.limit_bytes,
        "traffic limit exceeded, subscription suspended"
      );
      Ok(Enforcement::Suspended(evaluation))
    } else {
      Ok(Enforcement::AlreadySuspended(evaluation))
    }
  }

  // ── Lifecycle ─────────────────────────────────────────────────────────────

  pub async fn reset_usage(&self, subscription_id: i64) -> Result<Subscription> {
    self.reset_usage_at(subscription_id, Utc::now()).await
  }

  /// Begin a new metering period as of `now`: lift a quota suspension if
  /// present and zero the subscription's usage in the traffic period
  /// containing `now`, so the next enforcement starts from nothing.
  ///
  /// Daily rows are zeroed and the monthly rows they feed are rebuilt from
  /// them. Other subscriptions' rows are never touched.
  pub async fn reset_usage_at(
    &self,
    subscription_id: i64,
    now: DateTime<Utc>,
  ) -> Result<Subscription> {
    let (sub, _) = self.with_retry(subscription_id, Subscription::reset_usage).await?;

    let plan = self.plan(sub.plan_id()).await?;
    let period = resolve_traffic_period(plan.traffic_reset_mode, Some(&sub), now, &self.tz);
    let (from, until) = period.day_range(&self.tz);
    let query = UsageQuery {
      subscription_id: Some(subscription_id),
      granularity: Some(Granularity::Daily),
      from: Some(from),
      until: Some(until),
      ..Default::default()
    };
    let rows = self.store.list_usage(&query).await.map_err(Error::store)?.items;

    let mut months = HashSet::new();
    let mut zeroed = 0;
    for mut row in rows {
      let key = *row.key();
      months.insert((key.resource, Granularity::Monthly.period_for(key.period)));
      if row.totals().is_zero() {
        continue;
      }
      row.set_usage(0, 0)?;
      self.store.put_usage(row).await.map_err(Error::store)?;
      zeroed += 1;
    }
    for (resource, month) in months {
      self
        .store
        .rollup_monthly(resource, Some(subscription_id), month)
        .await
        .map_err(Error::store)?;
    }

    tracing::info!(
      subscription_id,
      status = %sub.status(),
      zeroed,
      %from,
      %until,
      "usage reset"
    );
    Ok(sub)
  }

  pub async fn renew(
    &self,
    subscription_id: i64,
    new_end_date: DateTime<Utc>,
  ) -> Result<Subscription> {
    let (sub, _) = self
      .with_retry(subscription_id, |s| s.renew(new_end_date))
      .await?;
    tracing::info!(
      subscription_id,
      status = %sub.status(),
      end_date = %sub.end_date(),
      "subscription renewed"
    );
    Ok(sub)
  }

  /// Mark every subscription whose end date has passed as expired. Returns
  /// the subscriptions that changed.
  ///
  /// One subscription failing (e.g. losing every version race) is logged and
  /// skipped; the sweep carries on with the rest.
  pub async fn expire_due(&self, now: DateTime<Utc>) -> Result<Vec<Subscription>> {
    let query = SubscriptionQuery {
      statuses: vec![
        SubscriptionStatus::Trialing,
        SubscriptionStatus::Active,
        SubscriptionStatus::PastDue,
      ],
      ends_before: Some(now),
      ..Default::default()
    };
    let due = self.store.list_subscriptions(&query).await.map_err(Error::store)?;

    let mut expired = Vec::with_capacity(due.len());
    for candidate in due {
      let Some(id) = candidate.id() else { continue };
      let outcome = self
        .with_retry(id, |s| {
          if !s.is_expired_at(now) || !s.status().can_transition_to(SubscriptionStatus::Expired) {
            return Ok(false);
          }
          s.mark_as_expired()?;
          Ok(true)
        })
        .await;
      let (sub, changed) = match outcome {
        Ok(v) => v,
        Err(e) => {
          tracing::warn!(subscription_id = id, error = %e, "failed to expire, skipping");
          continue;
        }
      };
      if changed {
        tracing::info!(subscription_id = id, end_date = %sub.end_date(), "subscription expired");
        expired.push(sub);
      }
    }
    Ok(expired)
  }
}
