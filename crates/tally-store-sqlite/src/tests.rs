//! Integration tests for `SqliteStore` against an in-memory database.

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use tally_core::{
  ErrorKind,
  period::TrafficResetMode,
  plan::{PlanFeatures, PlanType},
  status::SubscriptionStatus,
  store::{MeteringStore, SubscriptionQuery, UsageQuery},
  subscription::{Metadata, NewSubscription, SubjectKind, Subscription},
  usage::{Granularity, ResourceKind, ResourceRef, UsageKey, UsageStats, UsageTotals},
};
use uuid::Uuid;

use crate::{Error, SqliteStore};

async fn store() -> SqliteStore {
  SqliteStore::open_in_memory()
    .await
    .expect("in-memory store")
}

fn t(y: i32, m: u32, d: u32) -> DateTime<Utc> {
  Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
}

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
  NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn node(id: i64) -> ResourceRef { ResourceRef::new(ResourceKind::Node, id).unwrap() }

fn new_subscription(subject_id: i64, plan_id: i64, end: DateTime<Utc>) -> Subscription {
  Subscription::new(NewSubscription {
    subject_kind: SubjectKind::User,
    subject_id,
    plan_id,
    start_date: t(2024, 1, 1),
    end_date: end,
    auto_renew: false,
    metadata: Metadata::new(),
  })
  .unwrap()
}

async fn stored(s: &SqliteStore, subject_id: i64) -> Subscription {
  s.insert_subscription(new_subscription(subject_id, 7, t(2024, 2, 1)))
    .await
    .unwrap()
}

// ─── Subscriptions ───────────────────────────────────────────────────────────

#[tokio::test]
async fn insert_assigns_id_and_round_trips() {
  let s = store().await;
  let mut metadata = Metadata::new();
  metadata.insert("source".to_owned(), serde_json::json!("import"));
  let sub = Subscription::new(NewSubscription {
    subject_kind: SubjectKind::User,
    subject_id: 42,
    plan_id: 7,
    start_date: t(2024, 1, 1),
    end_date: t(2024, 2, 1),
    auto_renew: false,
    metadata,
  })
  .unwrap();
  assert_eq!(sub.version(), 1);
  let token = sub.link_token();

  let saved = s.insert_subscription(sub).await.unwrap();
  let id = saved.id().expect("assigned id");
  assert_eq!(saved.version(), 1);
  assert_eq!(saved.persisted_version(), 1);
  assert!(!saved.is_dirty());

  let fetched = s.get_subscription(id).await.unwrap().unwrap();
  assert_eq!(fetched.subject_id(), 42);
  assert_eq!(fetched.status(), SubscriptionStatus::Inactive);
  assert_eq!(fetched.end_date(), t(2024, 2, 1));
  assert_eq!(fetched.metadata()["source"], "import");

  let by_token = s.get_subscription_by_link_token(token).await.unwrap().unwrap();
  assert_eq!(by_token.id(), Some(id));
}

#[tokio::test]
async fn writes_return_exactly_what_a_read_returns() {
  let s = store().await;
  let inserted = stored(&s, 1).await;
  let id = inserted.id().unwrap();
  assert_eq!(s.get_subscription(id).await.unwrap().unwrap(), inserted);

  let mut sub = inserted;
  sub.activate().unwrap();
  sub.set_metadata("note", serde_json::json!("welcome"));
  let updated = s.update_subscription(sub).await.unwrap();
  let fetched = s.get_subscription(id).await.unwrap().unwrap();
  assert_eq!(fetched, updated);
  assert_eq!(updated.updated_at().timestamp_subsec_nanos() % 1_000, 0);
}

#[tokio::test]
async fn insert_rejects_already_persisted() {
  let s = store().await;
  let saved = stored(&s, 1).await;
  let err = s.insert_subscription(saved).await.unwrap_err();
  assert!(matches!(err, Error::AlreadyPersisted(_)));
}

#[tokio::test]
async fn get_missing_returns_none() {
  let s = store().await;
  assert!(s.get_subscription(999).await.unwrap().is_none());
  assert!(s.get_subscription_by_link_token(Uuid::new_v4()).await.unwrap().is_none());
}

#[tokio::test]
async fn update_persists_transition_and_version() {
  let s = store().await;
  let mut sub = stored(&s, 1).await;
  sub.activate().unwrap();
  sub.suspend("limit").unwrap();

  let saved = s.update_subscription(sub).await.unwrap();
  assert_eq!(saved.version(), 3);
  assert!(!saved.is_dirty());

  let fetched = s.get_subscription(saved.id().unwrap()).await.unwrap().unwrap();
  assert_eq!(fetched.status(), SubscriptionStatus::Suspended);
  assert_eq!(fetched.suspension_reason(), Some("limit"));
  assert_eq!(fetched.version(), 3);
}

#[tokio::test]
async fn stale_update_is_a_version_conflict() {
  let s = store().await;
  let original = stored(&s, 1).await;
  let id = original.id().unwrap();

  let mut first = s.get_subscription(id).await.unwrap().unwrap();
  let mut second = s.get_subscription(id).await.unwrap().unwrap();

  first.activate().unwrap();
  s.update_subscription(first).await.unwrap();

  second.cancel("changed my mind").unwrap();
  let err = s.update_subscription(second).await.unwrap_err();
  assert!(tally_core::store::StoreError::is_version_conflict(&err));
  assert_eq!(err.core_kind(), Some(ErrorKind::Conflict));

  let fetched = s.get_subscription(id).await.unwrap().unwrap();
  assert_eq!(fetched.status(), SubscriptionStatus::Active);
  assert_eq!(fetched.version(), 2);
}

#[tokio::test]
async fn unchanged_update_is_a_noop() {
  let s = store().await;
  let sub = stored(&s, 1).await;
  let id = sub.id().unwrap();

  // Bump the row behind our back; an unchanged write must not notice.
  let mut other = s.get_subscription(id).await.unwrap().unwrap();
  other.activate().unwrap();
  s.update_subscription(other).await.unwrap();

  let same = s.update_subscription(sub).await.unwrap();
  assert_eq!(same.version(), 1);
}

#[tokio::test]
async fn update_of_deleted_row_reports_not_found() {
  let s = store().await;
  let mut sub = stored(&s, 1).await;
  let id = sub.id().unwrap();
  assert!(s.delete_subscription(id).await.unwrap());
  assert!(!s.delete_subscription(id).await.unwrap());

  sub.activate().unwrap();
  let err = s.update_subscription(sub).await.unwrap_err();
  assert!(matches!(err, Error::SubscriptionNotFound(i) if i == id));
}

#[tokio::test]
async fn update_requires_a_stored_subscription() {
  let s = store().await;
  let err = s
    .update_subscription(new_subscription(1, 7, t(2024, 2, 1)))
    .await
    .unwrap_err();
  assert!(matches!(err, Error::NotPersisted));
}

#[tokio::test]
async fn list_filters_by_subject_status_and_expiry() {
  let s = store().await;
  let a = s.insert_subscription(new_subscription(1, 7, t(2024, 2, 1))).await.unwrap();
  s.insert_subscription(new_subscription(1, 8, t(2024, 6, 1))).await.unwrap();
  s.insert_subscription(new_subscription(2, 7, t(2024, 3, 1))).await.unwrap();

  let mut active = a;
  active.activate().unwrap();
  s.update_subscription(active).await.unwrap();

  let by_subject = s
    .list_subscriptions(&SubscriptionQuery {
      subject: Some((SubjectKind::User, 1)),
      ..Default::default()
    })
    .await
    .unwrap();
  assert_eq!(by_subject.len(), 2);

  let actives = s
    .list_subscriptions(&SubscriptionQuery {
      statuses: vec![SubscriptionStatus::Active, SubscriptionStatus::Trialing],
      ..Default::default()
    })
    .await
    .unwrap();
  assert_eq!(actives.len(), 1);
  assert_eq!(actives[0].subject_id(), 1);

  let ending_soon = s
    .list_subscriptions(&SubscriptionQuery {
      ends_after: Some(t(2024, 2, 1)),
      ends_before: Some(t(2024, 4, 1)),
      ..Default::default()
    })
    .await
    .unwrap();
  let ends: Vec<_> = ending_soon.iter().map(Subscription::end_date).collect();
  assert_eq!(ends, vec![t(2024, 2, 1), t(2024, 3, 1)]);

  let page = s
    .list_subscriptions(&SubscriptionQuery {
      plan_id: Some(7),
      limit: Some(1),
      offset: Some(1),
      ..Default::default()
    })
    .await
    .unwrap();
  assert_eq!(page.len(), 1);
  assert_eq!(page[0].subject_id(), 2);
}

#[tokio::test]
async fn corrupt_subscription_row_is_an_integrity_error() {
  let s = store().await;
  let sub = stored(&s, 1).await;
  s.execute_raw("UPDATE subscriptions SET version = 0").await.unwrap();

  let err = s.get_subscription(sub.id().unwrap()).await.unwrap_err();
  assert_eq!(err.core_kind(), Some(ErrorKind::Integrity));
}

// ─── Plans ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn put_and_get_plan() {
  let s = store().await;
  assert!(s.get_plan(7).await.unwrap().is_none());

  let plan = PlanFeatures {
    plan_id:             7,
    plan_type:           PlanType::Node,
    traffic_limit_bytes: Some(1_000),
    traffic_reset_mode:  TrafficResetMode::BillingCycle,
  };
  s.put_plan(plan.clone()).await.unwrap();
  assert_eq!(s.get_plan(7).await.unwrap(), Some(plan.clone()));

  let unlimited = PlanFeatures { traffic_limit_bytes: None, ..plan };
  s.put_plan(unlimited.clone()).await.unwrap();
  assert_eq!(s.get_plan(7).await.unwrap(), Some(unlimited));
}

// ─── Usage writes ────────────────────────────────────────────────────────────

#[tokio::test]
async fn record_usage_accumulates_in_place() {
  let s = store().await;
  let key =
    UsageKey::for_date(node(1), Granularity::Daily, date(2024, 1, 15)).for_subscription(5);

  let first = s
    .record_usage(key, UsageTotals::new(100, 200))
    .await
    .unwrap()
    .unwrap();
  assert_eq!((first.upload(), first.download(), first.total()), (100, 200, 300));

  let second = s
    .record_usage(key, UsageTotals::new(50, 0))
    .await
    .unwrap()
    .unwrap();
  assert_eq!((second.upload(), second.download(), second.total()), (150, 200, 350));
  assert_eq!(second.id(), first.id());
  assert_eq!(second.subscription_id(), Some(5));
}

#[tokio::test]
async fn subscriptions_sharing_a_resource_keep_separate_rows() {
  let s = store().await;
  let shared = UsageKey::for_date(node(1), Granularity::Daily, date(2024, 1, 15));

  let a = s
    .record_usage(shared.for_subscription(1), UsageTotals::new(900, 0))
    .await
    .unwrap()
    .unwrap();
  let b = s
    .record_usage(shared.for_subscription(2), UsageTotals::new(200, 0))
    .await
    .unwrap()
    .unwrap();
  assert_ne!(a.id(), b.id());

  let a = s.get_usage(shared.for_subscription(1)).await.unwrap().unwrap();
  assert_eq!((a.total(), a.subscription_id()), (900, Some(1)));
  let b = s.get_usage(shared.for_subscription(2)).await.unwrap().unwrap();
  assert_eq!((b.total(), b.subscription_id()), (200, Some(2)));
  assert!(s.get_usage(shared).await.unwrap().is_none());

  let for_a = UsageQuery { subscription_id: Some(1), ..Default::default() };
  assert_eq!(s.sum_usage(&for_a).await.unwrap().total(), 900);
  let whole_node = UsageQuery { resources: vec![node(1)], ..Default::default() };
  assert_eq!(s.sum_usage(&whole_node).await.unwrap().total(), 1_100);
}

#[tokio::test]
async fn repeated_small_increments_sum_exactly() {
  let s = store().await;
  let key = UsageKey::for_date(node(3), Granularity::Monthly, date(2024, 1, 20));
  for _ in 0..3 {
    s.record_usage(key, UsageTotals::new(100, 50)).await.unwrap();
  }
  let row = s.get_usage(key).await.unwrap().unwrap();
  assert_eq!(row.key().period, date(2024, 1, 1));
  assert_eq!(row.totals(), UsageTotals::new(300, 150));
  assert_eq!(row.total(), 450);
}

#[tokio::test]
async fn zero_delta_writes_nothing() {
  let s = store().await;
  let key = UsageKey::for_date(node(1), Granularity::Daily, date(2024, 1, 15));

  assert!(s.record_usage(key, UsageTotals::default()).await.unwrap().is_none());
  assert!(s.get_usage(key).await.unwrap().is_none());

  s.record_usage(key, UsageTotals::new(1, 1)).await.unwrap();
  let unchanged = s
    .record_usage(key, UsageTotals::default())
    .await
    .unwrap()
    .unwrap();
  assert_eq!(unchanged.total(), 2);
}

#[tokio::test]
async fn record_usage_rejects_unnormalised_period() {
  let s = store().await;
  let key = UsageKey {
    resource:        node(1),
    subscription_id: None,
    granularity:     Granularity::Monthly,
    period:          date(2024, 1, 15),
  };
  let err = s.record_usage(key, UsageTotals::new(1, 1)).await.unwrap_err();
  assert_eq!(err.core_kind(), Some(ErrorKind::Validation));
}

#[tokio::test]
async fn oversized_delta_is_out_of_range() {
  let s = store().await;
  let key = UsageKey::for_date(node(1), Granularity::Daily, date(2024, 1, 15));
  let err = s
    .record_usage(key, UsageTotals::new(u64::MAX, 0))
    .await
    .unwrap_err();
  assert!(matches!(err, Error::OutOfRange { field: "upload", .. }));
}

#[tokio::test]
async fn put_usage_overwrites_counters() {
  let s = store().await;
  let key = UsageKey::for_date(node(1), Granularity::Daily, date(2024, 1, 15));
  s.record_usage(key, UsageTotals::new(10, 10)).await.unwrap();

  let mut authoritative = UsageStats::new(key).unwrap();
  authoritative.set_usage(4, 6).unwrap();
  let saved = s.put_usage(authoritative).await.unwrap();

  assert_eq!(saved.totals(), UsageTotals::new(4, 6));
  assert_eq!(saved.subscription_id(), None);
  assert_eq!(s.get_usage(key).await.unwrap().unwrap().total(), 10);
  assert_eq!(s.list_usage(&UsageQuery::default()).await.unwrap().total_count, 1);
}

#[tokio::test]
async fn rollup_monthly_sums_daily_rows_of_that_month() {
  let s = store().await;
  let r = node(1);
  for (day, up, down) in [(date(2024, 1, 1), 10, 1), (date(2024, 1, 31), 20, 2), (date(2024, 2, 1), 99, 99)] {
    let key = UsageKey::for_date(r, Granularity::Daily, day).for_subscription(4);
    s.record_usage(key, UsageTotals::new(up, down)).await.unwrap();
  }
  // Another subscription's traffic on the same node stays out of the rollup.
  let other = UsageKey::for_date(r, Granularity::Daily, date(2024, 1, 9)).for_subscription(8);
  s.record_usage(other, UsageTotals::new(500, 500)).await.unwrap();

  let monthly = s.rollup_monthly(r, Some(4), date(2024, 1, 17)).await.unwrap();
  assert_eq!(monthly.key().granularity, Granularity::Monthly);
  assert_eq!(monthly.key().period, date(2024, 1, 1));
  assert_eq!(monthly.totals(), UsageTotals::new(30, 3));
  assert_eq!(monthly.subscription_id(), Some(4));

  // Re-running replaces rather than adds.
  let again = s.rollup_monthly(r, Some(4), date(2024, 1, 1)).await.unwrap();
  assert_eq!(again.total(), 33);
  assert_eq!(again.id(), monthly.id());

  let unattributed = s.rollup_monthly(r, None, date(2024, 1, 1)).await.unwrap();
  assert_eq!(unattributed.total(), 0);
}

#[tokio::test]
async fn corrupt_total_is_an_integrity_error() {
  let s = store().await;
  let key = UsageKey::for_date(node(1), Granularity::Daily, date(2024, 1, 15));
  s.record_usage(key, UsageTotals::new(1, 2)).await.unwrap();
  s.execute_raw("UPDATE usage_stats SET total = 99").await.unwrap();

  let err = s.get_usage(key).await.unwrap_err();
  assert_eq!(err.core_kind(), Some(ErrorKind::Integrity));
}

// ─── Usage reads ─────────────────────────────────────────────────────────────

async fn seed_usage(s: &SqliteStore) {
  let rows = [
    (node(1), date(2024, 1, 1), 10, 0),
    (node(1), date(2024, 1, 2), 20, 5),
    (node(2), date(2024, 1, 2), 30, 5),
    (ResourceRef::new(ResourceKind::ForwardRule, 1).unwrap(), date(2024, 1, 2), 1, 1),
    (node(1), date(2024, 1, 3), 40, 0),
  ];
  for (resource, day, up, down) in rows {
    let key = UsageKey::for_date(resource, Granularity::Daily, day).for_subscription(1);
    s.record_usage(key, UsageTotals::new(up, down)).await.unwrap();
  }
}

#[tokio::test]
async fn sum_usage_respects_filters_and_range() {
  let s = store().await;
  seed_usage(&s).await;

  let nodes_jan_1_2 = UsageQuery {
    resource_kinds: vec![ResourceKind::Node],
    granularity: Some(Granularity::Daily),
    from: Some(date(2024, 1, 1)),
    until: Some(date(2024, 1, 3)),
    ..Default::default()
  };
  assert_eq!(s.sum_usage(&nodes_jan_1_2).await.unwrap(), UsageTotals::new(60, 10));

  let only_node_1 = UsageQuery { resources: vec![node(1)], ..Default::default() };
  assert_eq!(s.sum_usage(&only_node_1).await.unwrap(), UsageTotals::new(70, 5));

  let nothing = UsageQuery { subscription_id: Some(404), ..Default::default() };
  assert_eq!(s.sum_usage(&nothing).await.unwrap(), UsageTotals::default());
}

#[tokio::test]
async fn list_usage_paginates_with_total_count() {
  let s = store().await;
  seed_usage(&s).await;

  let query = UsageQuery { limit: Some(2), offset: Some(1), ..Default::default() };
  let page = s.list_usage(&query).await.unwrap();
  assert_eq!(page.total_count, 5);
  assert_eq!(page.items.len(), 2);
  assert!(page.items.iter().all(|u| u.key().period == date(2024, 1, 2)));
}

#[tokio::test]
async fn usage_trend_groups_by_period() {
  let s = store().await;
  seed_usage(&s).await;

  let trend = s.usage_trend(&UsageQuery::default()).await.unwrap();
  let periods: Vec<_> = trend.iter().map(|p| p.period).collect();
  assert_eq!(periods, vec![date(2024, 1, 1), date(2024, 1, 2), date(2024, 1, 3)]);
  assert_eq!(trend[1].totals, UsageTotals::new(51, 11));
}
