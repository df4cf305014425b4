//! Quota evaluation.
//!
//! Pure decision logic: given a plan's traffic limit and the bytes used in
//! the resolved [`TrafficPeriod`], decide whether quota remains and whether
//! the caller should suspend the subscription.

use serde::{Deserialize, Serialize};

use crate::{
  period::TrafficPeriod,
  plan::PlanFeatures,
  status::SubscriptionStatus,
};

/// Reason recorded on a subscription suspended for exhausting its quota.
pub const TRAFFIC_LIMIT_EXCEEDED: &str = "traffic limit exceeded";

/// A limit of `None` or `Some(0)` means unlimited.
pub fn is_unlimited_traffic(limit_bytes: Option<u64>) -> bool {
  matches!(limit_bytes, None | Some(0))
}

/// Reaching the limit exactly counts as exhausted.
pub fn has_traffic_remaining(limit_bytes: Option<u64>, used_bytes: u64) -> bool {
  match limit_bytes {
    None | Some(0) => true,
    Some(limit) => used_bytes < limit,
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum QuotaStatus {
  Unlimited,
  Within { remaining: u64 },
  /// `overage` is how far past the limit usage went; zero when usage sits
  /// exactly on the limit.
  Exhausted { overage: u64 },
}

/// The outcome of checking one subscription's usage against its plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaEvaluation {
  pub plan_id:     i64,
  pub period:      TrafficPeriod,
  pub used_bytes:  u64,
  pub limit_bytes: Option<u64>,
  pub status:      QuotaStatus,
}

impl QuotaEvaluation {
  pub fn is_exhausted(&self) -> bool {
    matches!(self.status, QuotaStatus::Exhausted { .. })
  }

  /// Whether enforcement should suspend a subscription currently in
  /// `current`. Only active subscriptions are suspended; anything else is
  /// either already restricted or cannot legally be suspended.
  pub fn should_suspend(&self, current: SubscriptionStatus) -> bool {
    self.is_exhausted() && current == SubscriptionStatus::Active
  }
}

pub fn evaluate_quota(
  plan: &PlanFeatures,
  period: TrafficPeriod,
  used_bytes: u64,
) -> QuotaEvaluation {
  let limit = plan.traffic_limit_bytes.filter(|l| *l > 0);
  let status = match limit {
    None => QuotaStatus::Unlimited,
    Some(limit) if has_traffic_remaining(Some(limit), used_bytes) => {
      QuotaStatus::Within { remaining: limit - used_bytes }
    }
    Some(limit) => QuotaStatus::Exhausted { overage: used_bytes - limit },
  };
  QuotaEvaluation {
    plan_id: plan.plan_id,
    period,
    used_bytes,
    limit_bytes: limit,
    status,
  }
}

#[cfg(test)]
mod tests {
  use chrono::{TimeZone, Utc};
  use proptest::prelude::*;

  use super::*;
  use crate::{period::TrafficResetMode, plan::PlanType};

  fn plan(limit: Option<u64>) -> PlanFeatures {
    PlanFeatures {
      plan_id:             1,
      plan_type:           PlanType::Node,
      traffic_limit_bytes: limit,
      traffic_reset_mode:  TrafficResetMode::CalendarMonth,
    }
  }

  fn period() -> TrafficPeriod {
    TrafficPeriod::new(
      Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
      Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap(),
    )
    .unwrap()
  }

  #[test]
  fn zero_and_unset_limits_are_unlimited() {
    assert!(is_unlimited_traffic(None));
    assert!(is_unlimited_traffic(Some(0)));
    assert!(!is_unlimited_traffic(Some(1)));
  }

  #[test]
  fn limit_boundary_counts_as_exhausted() {
    assert!(has_traffic_remaining(Some(100), 99));
    assert!(!has_traffic_remaining(Some(100), 100));
    assert!(!has_traffic_remaining(Some(100), 101));
  }

  #[test]
  fn evaluation_reports_remaining_and_overage() {
    let e = evaluate_quota(&plan(Some(1_000)), period(), 400);
    assert_eq!(e.status, QuotaStatus::Within { remaining: 600 });

    let e = evaluate_quota(&plan(Some(1_000)), period(), 1_000);
    assert_eq!(e.status, QuotaStatus::Exhausted { overage: 0 });

    let e = evaluate_quota(&plan(Some(1_000)), period(), 1_250);
    assert_eq!(e.status, QuotaStatus::Exhausted { overage: 250 });
  }

  #[test]
  fn zero_limit_evaluates_unlimited() {
    let e = evaluate_quota(&plan(Some(0)), period(), u64::MAX);
    assert_eq!(e.status, QuotaStatus::Unlimited);
    assert_eq!(e.limit_bytes, None);
  }

  #[test]
  fn only_active_subscriptions_are_suspended() {
    let e = evaluate_quota(&plan(Some(10)), period(), 10);
    assert!(e.should_suspend(SubscriptionStatus::Active));
    assert!(!e.should_suspend(SubscriptionStatus::Suspended));
    assert!(!e.should_suspend(SubscriptionStatus::Trialing));

    let e = evaluate_quota(&plan(Some(10)), period(), 9);
    assert!(!e.should_suspend(SubscriptionStatus::Active));
  }

  proptest! {
    #[test]
    fn unlimited_always_has_remaining(used in any::<u64>()) {
      prop_assert!(has_traffic_remaining(None, used));
      prop_assert!(has_traffic_remaining(Some(0), used));
    }

    #[test]
    fn limited_remaining_is_strictly_less(limit in 1u64.., used in any::<u64>()) {
      prop_assert_eq!(has_traffic_remaining(Some(limit), used), used < limit);
    }
  }
}
