//! Traffic period resolution.
//!
//! A [`TrafficPeriod`] is the window whose usage counts against a plan's
//! traffic limit. It is computed fresh on every quota check and never cached:
//! a plan's reset mode or a subscription's billing period can change between
//! calls, and a stale window would silently misattribute usage.

use std::str::FromStr;

use chrono::{
  DateTime, Datelike, Days, LocalResult, Months, NaiveDate, TimeZone, Utc,
};
use serde::{Deserialize, Serialize};

use crate::{Error, Result, subscription::Subscription};

// ─── Reset mode ──────────────────────────────────────────────────────────────

/// How a plan's traffic quota window is aligned.
#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
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
pub enum TrafficResetMode {
  /// The calendar month in the business timezone.
  #[default]
  CalendarMonth,
  /// The subscription's own current billing period.
  BillingCycle,
}

impl TrafficResetMode {
  pub fn as_str(self) -> &'static str { self.into() }

  pub fn parse(s: &str) -> Result<Self> {
    Self::from_str(s).map_err(|_| Error::UnknownVariant {
      kind:  "traffic reset mode",
      value: s.to_owned(),
    })
  }
}

// ─── Period ──────────────────────────────────────────────────────────────────

/// A half-open `[start, end)` window in UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficPeriod {
  pub start: DateTime<Utc>,
  pub end:   DateTime<Utc>,
}

impl TrafficPeriod {
  pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
    if end < start {
      return Err(Error::validation("period", "end precedes start"));
    }
    Ok(Self { start, end })
  }

  pub fn contains(&self, at: DateTime<Utc>) -> bool {
    self.start <= at && at < self.end
  }

  pub fn duration(&self) -> chrono::TimeDelta { self.end - self.start }

  /// The calendar dates (in `tz`) whose daily usage rows fall inside this
  /// period, as `[first, last_exclusive)`.
  ///
  /// A period that starts or ends mid-day includes that whole day, since
  /// daily rows cannot be split.
  pub fn day_range<Tz: TimeZone>(&self, tz: &Tz) -> (NaiveDate, NaiveDate) {
    let first = self.start.with_timezone(tz).date_naive();
    let end_local = self.end.with_timezone(tz);
    let end_date = end_local.date_naive();
    let at_midnight = local_midnight_utc(end_date, tz) == self.end;
    let last_exclusive = if at_midnight {
      end_date
    } else {
      end_date + Days::new(1)
    };
    (first, last_exclusive.max(first))
  }
}

// ─── Resolution ──────────────────────────────────────────────────────────────

/// The calendar month containing `now` in `tz`, expressed as UTC bounds.
pub fn calendar_month_period<Tz: TimeZone>(
  now: DateTime<Utc>,
  tz: &Tz,
) -> TrafficPeriod {
  let local = now.with_timezone(tz).date_naive();
  let first = local - Days::new(u64::from(local.day0()));
  let next = first + Months::new(1);
  TrafficPeriod {
    start: local_midnight_utc(first, tz),
    end:   local_midnight_utc(next, tz),
  }
}

/// Decide which window counts against the quota.
///
/// `BillingCycle` with a subscription yields the subscription's current
/// billing period. Anything else falls back to the calendar month of `now`.
pub fn resolve_traffic_period<Tz: TimeZone>(
  mode: TrafficResetMode,
  subscription: Option<&Subscription>,
  now: DateTime<Utc>,
  tz: &Tz,
) -> TrafficPeriod {
  match (mode, subscription) {
    (TrafficResetMode::BillingCycle, Some(sub)) => TrafficPeriod {
      start: sub.current_period_start(),
      end:   sub.current_period_end(),
    },
    _ => calendar_month_period(now, tz),
  }
}

/// Midnight at the start of `date` in `tz`, converted to UTC.
///
/// Falls back to reading the wall-clock time as UTC when midnight does not
/// exist locally (a DST gap), which only shifts the boundary by the gap.
fn local_midnight_utc<Tz: TimeZone>(date: NaiveDate, tz: &Tz) -> DateTime<Utc> {
  let naive = date.and_time(chrono::NaiveTime::MIN);
  match tz.from_local_datetime(&naive) {
    LocalResult::Single(dt) | LocalResult::Ambiguous(dt, _) => dt.with_timezone(&Utc),
    LocalResult::None => Utc.from_utc_datetime(&naive),
  }
}
