//! Encoding and decoding helpers between Rust domain types and the plain
//! representations stored in SQLite columns.
//!
//! Timestamps are stored as fixed-width RFC 3339 UTC strings (microsecond
//! precision, `Z` suffix) so that lexical order matches chronological order.
//! Dates are `YYYY-MM-DD`. Enums are stored by their snake_case names, the
//! metadata bag as compact JSON, and byte counters as signed 64-bit integers.

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use tally_core::{
  period::TrafficResetMode,
  plan::{PlanFeatures, PlanType},
  status::SubscriptionStatus,
  subscription::{Metadata, SubjectKind, Subscription, SubscriptionRecord},
  usage::{Granularity, ResourceKind, ResourceRef, UsageRecord, UsageStats},
};
use uuid::Uuid;

use crate::{Error, Result};

// ─── Scalars ─────────────────────────────────────────────────────────────────

pub fn encode_uuid(id: Uuid) -> String { id.hyphenated().to_string() }

pub fn decode_uuid(s: &str) -> Result<Uuid> { Ok(Uuid::parse_str(s)?) }

pub fn encode_dt(dt: DateTime<Utc>) -> String {
  dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn decode_dt(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| Error::DateParse(e.to_string()))
}

pub fn decode_opt_dt(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
  s.as_deref().map(decode_dt).transpose()
}

pub fn encode_date(d: NaiveDate) -> String { d.format("%Y-%m-%d").to_string() }

pub fn decode_date(s: &str) -> Result<NaiveDate> {
  NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|e| Error::DateParse(e.to_string()))
}

pub fn encode_bytes(field: &'static str, value: u64) -> Result<i64> {
  i64::try_from(value).map_err(|_| Error::OutOfRange { field, value })
}

pub fn decode_bytes(field: &'static str, value: i64) -> Result<u64> {
  u64::try_from(value).map_err(|_| {
    tally_core::Error::Integrity(format!("{field} is negative: {value}")).into()
  })
}

pub fn encode_metadata(m: &Metadata) -> Result<String> { Ok(serde_json::to_string(m)?) }

pub fn decode_metadata(s: &str) -> Result<Metadata> { Ok(serde_json::from_str(s)?) }

/// Usage rows store `0` for "no owning subscription".
pub fn encode_owner(subscription_id: Option<i64>) -> i64 { subscription_id.unwrap_or(0) }

pub fn decode_owner(v: i64) -> Option<i64> { (v != 0).then_some(v) }

// ─── Row types ───────────────────────────────────────────────────────────────

pub const SUBSCRIPTION_COLUMNS: &str = "
  id, link_token, subject_kind, subject_id, plan_id, status,
  start_date, end_date, current_period_start, current_period_end,
  auto_renew, cancelled_at, cancel_reason, suspended_at, suspension_reason,
  usage_reset_at, metadata, version, created_at, updated_at";

/// Raw values read directly from a `subscriptions` row.
pub struct RawSubscription {
  pub id:                   i64,
  pub link_token:           String,
  pub subject_kind:         String,
  pub subject_id:           i64,
  pub plan_id:              i64,
  pub status:               String,
  pub start_date:           String,
  pub end_date:             String,
  pub current_period_start: String,
  pub current_period_end:   String,
  pub auto_renew:           bool,
  pub cancelled_at:         Option<String>,
  pub cancel_reason:        Option<String>,
  pub suspended_at:         Option<String>,
  pub suspension_reason:    Option<String>,
  pub usage_reset_at:       Option<String>,
  pub metadata:             String,
  pub version:              i64,
  pub created_at:           String,
  pub updated_at:           String,
}

impl RawSubscription {
  /// Map a row selected with [`SUBSCRIPTION_COLUMNS`].
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      id:                   row.get(0)?,
      link_token:           row.get(1)?,
      subject_kind:         row.get(2)?,
      subject_id:           row.get(3)?,
      plan_id:              row.get(4)?,
      status:               row.get(5)?,
      start_date:           row.get(6)?,
      end_date:             row.get(7)?,
      current_period_start: row.get(8)?,
      current_period_end:   row.get(9)?,
      auto_renew:           row.get(10)?,
      cancelled_at:         row.get(11)?,
      cancel_reason:        row.get(12)?,
      suspended_at:         row.get(13)?,
      suspension_reason:    row.get(14)?,
      usage_reset_at:       row.get(15)?,
      metadata:             row.get(16)?,
      version:              row.get(17)?,
      created_at:           row.get(18)?,
      updated_at:           row.get(19)?,
    })
  }

  pub fn into_subscription(self) -> Result<Subscription> {
    let record = SubscriptionRecord {
      id:                   self.id,
      link_token:           decode_uuid(&self.link_token)?,
      subject_kind:         SubjectKind::parse(&self.subject_kind)?,
      subject_id:           self.subject_id,
      plan_id:              self.plan_id,
      status:               SubscriptionStatus::parse(&self.status)?,
      start_date:           decode_dt(&self.start_date)?,
      end_date:             decode_dt(&self.end_date)?,
      current_period_start: decode_dt(&self.current_period_start)?,
      current_period_end:   decode_dt(&self.current_period_end)?,
      auto_renew:           self.auto_renew,
      cancelled_at:         decode_opt_dt(self.cancelled_at)?,
      cancel_reason:        self.cancel_reason,
      suspended_at:         decode_opt_dt(self.suspended_at)?,
      suspension_reason:    self.suspension_reason,
      usage_reset_at:       decode_opt_dt(self.usage_reset_at)?,
      metadata:             decode_metadata(&self.metadata)?,
      version:              self.version,
      created_at:           decode_dt(&self.created_at)?,
      updated_at:           decode_dt(&self.updated_at)?,
    };
    Ok(Subscription::from_record(record)?)
  }
}

/// A subscription flattened into column values, ready to bind.
#[derive(Clone)]
pub struct SubscriptionParams {
  pub link_token:           String,
  pub subject_kind:         &'static str,
  pub subject_id:           i64,
  pub plan_id:              i64,
  pub status:               &'static str,
  pub start_date:           String,
  pub end_date:             String,
  pub current_period_start: String,
  pub current_period_end:   String,
  pub auto_renew:           bool,
  pub cancelled_at:         Option<String>,
  pub cancel_reason:        Option<String>,
  pub suspended_at:         Option<String>,
  pub suspension_reason:    Option<String>,
  pub usage_reset_at:       Option<String>,
  pub metadata:             String,
  pub version:              i64,
  pub created_at:           String,
  pub updated_at:           String,
}

impl SubscriptionParams {
  pub fn from_record(r: &SubscriptionRecord) -> Result<Self> {
    Ok(Self {
      link_token:           encode_uuid(r.link_token),
      subject_kind:         r.subject_kind.as_str(),
      subject_id:           r.subject_id,
      plan_id:              r.plan_id,
      status:               r.status.as_str(),
      start_date:           encode_dt(r.start_date),
      end_date:             encode_dt(r.end_date),
      current_period_start: encode_dt(r.current_period_start),
      current_period_end:   encode_dt(r.current_period_end),
      auto_renew:           r.auto_renew,
      cancelled_at:         r.cancelled_at.map(encode_dt),
      cancel_reason:        r.cancel_reason.clone(),
      suspended_at:         r.suspended_at.map(encode_dt),
      suspension_reason:    r.suspension_reason.clone(),
      usage_reset_at:       r.usage_reset_at.map(encode_dt),
      metadata:             encode_metadata(&r.metadata)?,
      version:              r.version,
      created_at:           encode_dt(r.created_at),
      updated_at:           encode_dt(r.updated_at),
    })
  }

  /// The row these values produce once written under `id`. Decoding it
  /// yields exactly what a later read returns.
  pub fn into_raw(self, id: i64) -> RawSubscription {
    RawSubscription {
      id,
      link_token: self.link_token,
      subject_kind: self.subject_kind.to_owned(),
      subject_id: self.subject_id,
      plan_id: self.plan_id,
      status: self.status.to_owned(),
      start_date: self.start_date,
      end_date: self.end_date,
      current_period_start: self.current_period_start,
      current_period_end: self.current_period_end,
      auto_renew: self.auto_renew,
      cancelled_at: self.cancelled_at,
      cancel_reason: self.cancel_reason,
      suspended_at: self.suspended_at,
      suspension_reason: self.suspension_reason,
      usage_reset_at: self.usage_reset_at,
      metadata: self.metadata,
      version: self.version,
      created_at: self.created_at,
      updated_at: self.updated_at,
    }
  }
}

pub const USAGE_COLUMNS: &str = "
  id, resource_type, resource_id, subscription_id, granularity, period,
  upload, download, total, created_at, updated_at";

/// Raw values read directly from a `usage_stats` row.
pub struct RawUsage {
  pub id:              i64,
  pub resource_type:   String,
  pub resource_id:     i64,
  pub subscription_id: i64,
  pub granularity:     String,
  pub period:          String,
  pub upload:          i64,
  pub download:        i64,
  pub total:           i64,
  pub created_at:      String,
  pub updated_at:      String,
}

impl RawUsage {
  /// Map a row selected with [`USAGE_COLUMNS`].
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      id:              row.get(0)?,
      resource_type:   row.get(1)?,
      resource_id:     row.get(2)?,
      subscription_id: row.get(3)?,
      granularity:     row.get(4)?,
      period:          row.get(5)?,
      upload:          row.get(6)?,
      download:        row.get(7)?,
      total:           row.get(8)?,
      created_at:      row.get(9)?,
      updated_at:      row.get(10)?,
    })
  }

  pub fn into_stats(self) -> Result<UsageStats> {
    let record = UsageRecord {
      id:              self.id,
      resource:        ResourceRef {
        kind: ResourceKind::parse(&self.resource_type)?,
        id:   self.resource_id,
      },
      subscription_id: decode_owner(self.subscription_id),
      granularity:     Granularity::parse(&self.granularity)?,
      period:          decode_date(&self.period)?,
      upload:          decode_bytes("upload", self.upload)?,
      download:        decode_bytes("download", self.download)?,
      total:           decode_bytes("total", self.total)?,
      created_at:      decode_dt(&self.created_at)?,
      updated_at:      decode_dt(&self.updated_at)?,
    };
    Ok(UsageStats::from_record(record)?)
  }
}

/// Raw values read directly from a `plans` row.
pub struct RawPlan {
  pub plan_id:             i64,
  pub plan_type:           String,
  pub traffic_limit_bytes: Option<i64>,
  pub traffic_reset_mode:  String,
}

impl RawPlan {
  pub fn into_plan(self) -> Result<PlanFeatures> {
    Ok(PlanFeatures {
      plan_id:             self.plan_id,
      plan_type:           PlanType::parse(&self.plan_type)?,
      traffic_limit_bytes: self
        .traffic_limit_bytes
        .map(|v| decode_bytes("traffic_limit_bytes", v))
        .transpose()?,
      traffic_reset_mode:  TrafficResetMode::parse(&self.traffic_reset_mode)?,
    })
  }
}

#[cfg(test)]
mod tests {
  use chrono::TimeZone;

  use super::*;

  #[test]
  fn timestamps_are_fixed_width_and_sortable() {
    let a = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    let b = a + chrono::Duration::microseconds(1_500);
    let (ea, eb) = (encode_dt(a), encode_dt(b));
    assert_eq!(ea, "2024-01-01T00:00:00.000000Z");
    assert_eq!(ea.len(), eb.len());
    assert!(ea < eb);
    assert_eq!(decode_dt(&eb).unwrap(), b);
  }

  #[test]
  fn negative_counters_are_integrity_errors() {
    let err = decode_bytes("upload", -1).unwrap_err();
    assert_eq!(err.core_kind(), Some(tally_core::ErrorKind::Integrity));
  }

  #[test]
  fn oversized_counters_are_rejected_on_encode() {
    assert!(matches!(
      encode_bytes("upload", u64::MAX),
      Err(Error::OutOfRange { field: "upload", .. })
    ));
  }

  #[test]
  fn dates_round_trip() {
    let d = NaiveDate::from_ymd_opt(2024, 2, 29).unwrap();
    assert_eq!(encode_date(d), "2024-02-29");
    assert_eq!(decode_date("2024-02-29").unwrap(), d);
  }
}
