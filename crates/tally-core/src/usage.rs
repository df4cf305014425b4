//! Usage aggregation.
//!
//! One [`UsageStats`] row exists per `(resource, granularity, period)` tuple.
//! `total` is never set independently: it is always recomputed as
//! `upload + download`, and a row that violates that on load is an
//! integrity error.

use std::{iter::Sum, ops::Add, str::FromStr};

use chrono::{DateTime, Datelike, Days, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

// ─── Enumerations ────────────────────────────────────────────────────────────

/// The time bucket a usage row aggregates over.
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
pub enum Granularity {
  /// `period` is a calendar date.
  Daily,
  /// `period` is the first day of a calendar month.
  Monthly,
}

impl Granularity {
  /// The period identifier that `date` falls in.
  pub fn period_for(self, date: NaiveDate) -> NaiveDate {
    match self {
      Self::Daily => date,
      Self::Monthly => date - Days::new(u64::from(date.day0())),
    }
  }

  pub fn as_str(self) -> &'static str { self.into() }

  pub fn parse(s: &str) -> Result<Self> {
    Self::from_str(s).map_err(|_| Error::UnknownVariant {
      kind:  "granularity",
      value: s.to_owned(),
    })
  }
}

/// The kind of thing being metered.
#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Hash,
  PartialOrd,
  Ord,
  Serialize,
  Deserialize,
  strum::Display,
  strum::EnumString,
  strum::EnumIter,
  strum::IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ResourceKind {
  Node,
  ForwardRule,
}

impl ResourceKind {
  pub fn as_str(self) -> &'static str { self.into() }

  pub fn parse(s: &str) -> Result<Self> {
    Self::from_str(s).map_err(|_| Error::UnknownVariant {
      kind:  "resource kind",
      value: s.to_owned(),
    })
  }
}

// ─── Keys ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceRef {
  pub kind: ResourceKind,
  pub id:   i64,
}

impl ResourceRef {
  pub fn new(kind: ResourceKind, id: i64) -> Result<Self> {
    if id <= 0 {
      return Err(Error::required("resource_id"));
    }
    Ok(Self { kind, id })
  }
}

/// Identifies exactly one usage row.
///
/// Rows recorded for a subscription belong to it alone: two subscriptions
/// metering the same resource accrue into separate rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UsageKey {
  pub resource:        ResourceRef,
  pub subscription_id: Option<i64>,
  pub granularity:     Granularity,
  pub period:          NaiveDate,
}

impl UsageKey {
  /// Build the key for the unattributed row that `date` accrues to,
  /// normalising monthly periods to the first of the month.
  pub fn for_date(
    resource: ResourceRef,
    granularity: Granularity,
    date: NaiveDate,
  ) -> Self {
    Self {
      resource,
      subscription_id: None,
      granularity,
      period: granularity.period_for(date),
    }
  }

  /// The same row, owned by `subscription_id`.
  pub fn for_subscription(self, subscription_id: i64) -> Self {
    Self { subscription_id: Some(subscription_id), ..self }
  }

  pub fn validate(&self) -> Result<()> {
    if self.resource.id <= 0 {
      return Err(Error::required("resource_id"));
    }
    if self.subscription_id.is_some_and(|id| id <= 0) {
      return Err(Error::validation("subscription_id", "must be positive"));
    }
    if self.granularity.period_for(self.period) != self.period {
      return Err(Error::validation(
        "period",
        format!("{} is not the start of a {} period", self.period, self.granularity),
      ));
    }
    Ok(())
  }
}

// ─── Totals ──────────────────────────────────────────────────────────────────

/// Summed usage across any number of rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageTotals {
  pub upload:   u64,
  pub download: u64,
}

impl UsageTotals {
  pub fn new(upload: u64, download: u64) -> Self { Self { upload, download } }

  pub fn total(&self) -> u64 { self.upload.saturating_add(self.download) }

  pub fn is_zero(&self) -> bool { self.upload == 0 && self.download == 0 }
}

impl Add for UsageTotals {
  type Output = Self;

  fn add(self, rhs: Self) -> Self {
    Self {
      upload:   self.upload.saturating_add(rhs.upload),
      download: self.download.saturating_add(rhs.download),
    }
  }
}

impl Sum for UsageTotals {
  fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
    iter.fold(Self::default(), Add::add)
  }
}

// ─── Persistence shape ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
  pub id:              i64,
  pub resource:        ResourceRef,
  pub subscription_id: Option<i64>,
  pub granularity:     Granularity,
  pub period:          NaiveDate,
  pub upload:          u64,
  pub download:        u64,
  pub total:           u64,
  pub created_at:      DateTime<Utc>,
  pub updated_at:      DateTime<Utc>,
}

// ─── Entity ──────────────────────────────────────────────────────────────────

/// Running byte counters for one resource over one period.
///
/// Not safe to share between concurrent writers in memory: concurrent
/// metering for the same row goes through the store's atomic
/// upsert-and-increment instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageStats {
  id:         Option<i64>,
  key:        UsageKey,
  upload:     u64,
  download:   u64,
  total:      u64,
  created_at: DateTime<Utc>,
  updated_at: DateTime<Utc>,
}

impl UsageStats {
  /// An empty, unsaved row.
  pub fn new(key: UsageKey) -> Result<Self> {
    key.validate()?;
    let now = Utc::now();
    Ok(Self {
      id: None,
      key,
      upload: 0,
      download: 0,
      total: 0,
      created_at: now,
      updated_at: now,
    })
  }

  pub fn from_record(r: UsageRecord) -> Result<Self> {
    let key = UsageKey {
      resource:        r.resource,
      subscription_id: r.subscription_id,
      granularity:     r.granularity,
      period:          r.period,
    };
    key
      .validate()
      .map_err(|e| Error::Integrity(format!("usage row {}: {e}", r.id)))?;
    let stats = Self {
      id: Some(r.id),
      key,
      upload: r.upload,
      download: r.download,
      total: r.total,
      created_at: r.created_at,
      updated_at: r.updated_at,
    };
    stats.validate()?;
    Ok(stats)
  }

  pub fn to_record(&self) -> UsageRecord {
    UsageRecord {
      id:              self.id.unwrap_or(0),
      resource:        self.key.resource,
      subscription_id: self.key.subscription_id,
      granularity:     self.key.granularity,
      period:          self.key.period,
      upload:          self.upload,
      download:        self.download,
      total:           self.total,
      created_at:      self.created_at,
      updated_at:      self.updated_at,
    }
  }

  pub fn id(&self) -> Option<i64> { self.id }
  pub fn key(&self) -> &UsageKey { &self.key }
  pub fn subscription_id(&self) -> Option<i64> { self.key.subscription_id }
  pub fn upload(&self) -> u64 { self.upload }
  pub fn download(&self) -> u64 { self.download }
  pub fn total(&self) -> u64 { self.total }
  pub fn created_at(&self) -> DateTime<Utc> { self.created_at }
  pub fn updated_at(&self) -> DateTime<Utc> { self.updated_at }

  pub fn totals(&self) -> UsageTotals { UsageTotals::new(self.upload, self.download) }

  /// Add both deltas to the running counters. Returns `false` (and touches
  /// nothing) when both deltas are zero.
  pub fn accumulate(&mut self, upload: u64, download: u64) -> Result<bool> {
    if upload == 0 && download == 0 {
      return Ok(false);
    }
    let new_upload = self
      .upload
      .checked_add(upload)
      .ok_or_else(|| Error::validation("upload", "counter overflow"))?;
    let new_download = self
      .download
      .checked_add(download)
      .ok_or_else(|| Error::validation("download", "counter overflow"))?;
    self.set_counters(new_upload, new_download)?;
    Ok(true)
  }

  /// Overwrite the counters with authoritative absolute values.
  pub fn set_usage(&mut self, upload: u64, download: u64) -> Result<()> {
    self.set_counters(upload, download)
  }

  /// Check `total == upload + download`.
  pub fn validate(&self) -> Result<()> {
    match self.upload.checked_add(self.download) {
      Some(sum) if sum == self.total => Ok(()),
      _ => Err(Error::Integrity(format!(
        "usage row {}: total {} != upload {} + download {}",
        self.id.unwrap_or(0),
        self.total,
        self.upload,
        self.download,
      ))),
    }
  }

  fn set_counters(&mut self, upload: u64, download: u64) -> Result<()> {
    let total = upload
      .checked_add(download)
      .ok_or_else(|| Error::validation("total", "counter overflow"))?;
    self.upload = upload;
    self.download = download;
    self.total = total;
    self.updated_at = Utc::now();
    Ok(())
  }
}
