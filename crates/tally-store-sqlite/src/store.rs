//! [`MeteringStore`] over a single SQLite file.
//!
//! Every subscription write is a compare-and-set on `version`; usage
//! increments are single `INSERT .. ON CONFLICT DO UPDATE` statements so
//! concurrent meters never lose an update.

use std::path::Path;

use chrono::{Months, NaiveDate, Utc};
use rusqlite::{OptionalExtension as _, types::Value};
use uuid::Uuid;

use tally_core::{
  plan::PlanFeatures,
  store::{
    MeteringStore, SubscriptionQuery, UsagePage, UsageQuery, UsageTrendPoint,
  },
  subscription::Subscription,
  usage::{Granularity, ResourceRef, UsageKey, UsageStats, UsageTotals},
};

use crate::{
  Error, Result,
  encode::{
    RawPlan, RawSubscription, RawUsage, SUBSCRIPTION_COLUMNS,
    SubscriptionParams, USAGE_COLUMNS, decode_bytes, decode_date, encode_bytes,
    encode_date, encode_dt, encode_owner, encode_uuid,
  },
  schema::SCHEMA,
};

// ─── Store ───────────────────────────────────────────────────────────────────

/// A Tally store backed by a single SQLite file. Clones share one
/// connection thread.
#[derive(Clone)]
pub struct SqliteStore {
  conn: tokio_rusqlite::Connection,
}

impl SqliteStore {
  /// Open (or create) a store at `path` and run schema initialisation.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open(path).await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  /// Open a throwaway in-memory store.
  pub async fn open_in_memory() -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open_in_memory().await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  async fn init_schema(&self) -> Result<()> {
    self
      .conn
      .call(|conn| {
        conn.execute_batch(SCHEMA)?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  /// Run raw SQL; lets tests corrupt rows on purpose.
  #[cfg(test)]
  pub(crate) async fn execute_raw(&self, sql: &'static str) -> Result<usize> {
    Ok(self.conn.call(move |conn| Ok(conn.execute(sql, [])?)).await?)
  }

  async fn query_usage_rows(
    &self,
    sql: String,
    params: Vec<Value>,
  ) -> Result<Vec<UsageStats>> {
    let raws: Vec<RawUsage> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
          .query_map(rusqlite::params_from_iter(params), RawUsage::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawUsage::into_stats).collect()
  }

  async fn query_one_subscription(
    &self,
    where_clause: &'static str,
    param: Value,
  ) -> Result<Option<Subscription>> {
    let raw: Option<RawSubscription> = self
      .conn
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              &format!("SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE {where_clause}"),
              rusqlite::params![param],
              RawSubscription::from_row,
            )
            .optional()?,
        )
      })
      .await?;

    raw.map(RawSubscription::into_subscription).transpose()
  }
}

// ─── Query builders ──────────────────────────────────────────────────────────

fn where_sql(conds: &[String]) -> String {
  if conds.is_empty() {
    String::new()
  } else {
    format!("WHERE {}", conds.join(" AND "))
  }
}

/// `LIMIT -1` is SQLite for "no limit".
fn page_params(limit: Option<usize>, offset: Option<usize>) -> [Value; 2] {
  let limit = limit.map_or(-1, |l| i64::try_from(l).unwrap_or(i64::MAX));
  let offset = offset.map_or(0, |o| i64::try_from(o).unwrap_or(i64::MAX));
  [Value::Integer(limit), Value::Integer(offset)]
}

fn placeholders(n: usize) -> String { vec!["?"; n].join(", ") }

fn subscription_filter(q: &SubscriptionQuery) -> (String, Vec<Value>) {
  let mut conds = Vec::new();
  let mut params = Vec::new();

  if let Some((kind, id)) = q.subject {
    conds.push("subject_kind = ? AND subject_id = ?".to_owned());
    params.push(Value::Text(kind.as_str().to_owned()));
    params.push(Value::Integer(id));
  }
  if let Some(plan_id) = q.plan_id {
    conds.push("plan_id = ?".to_owned());
    params.push(Value::Integer(plan_id));
  }
  if !q.statuses.is_empty() {
    conds.push(format!("status IN ({})", placeholders(q.statuses.len())));
    params.extend(q.statuses.iter().map(|s| Value::Text(s.as_str().to_owned())));
  }
  if let Some(after) = q.ends_after {
    conds.push("end_date >= ?".to_owned());
    params.push(Value::Text(encode_dt(after)));
  }
  if let Some(before) = q.ends_before {
    conds.push("end_date < ?".to_owned());
    params.push(Value::Text(encode_dt(before)));
  }

  (where_sql(&conds), params)
}

fn usage_filter(q: &UsageQuery) -> (String, Vec<Value>) {
  let mut conds = Vec::new();
  let mut params = Vec::new();

  if !q.resources.is_empty() {
    let any = vec!["(resource_type = ? AND resource_id = ?)"; q.resources.len()];
    conds.push(format!("({})", any.join(" OR ")));
    for r in &q.resources {
      params.push(Value::Text(r.kind.as_str().to_owned()));
      params.push(Value::Integer(r.id));
    }
  }
  if !q.resource_kinds.is_empty() {
    conds.push(format!("resource_type IN ({})", placeholders(q.resource_kinds.len())));
    params.extend(
      q.resource_kinds
        .iter()
        .map(|k| Value::Text(k.as_str().to_owned())),
    );
  }
  if let Some(id) = q.subscription_id {
    conds.push("subscription_id = ?".to_owned());
    params.push(Value::Integer(id));
  }
  if let Some(g) = q.granularity {
    conds.push("granularity = ?".to_owned());
    params.push(Value::Text(g.as_str().to_owned()));
  }
  if let Some(from) = q.from {
    conds.push("period >= ?".to_owned());
    params.push(Value::Text(encode_date(from)));
  }
  if let Some(until) = q.until {
    conds.push("period < ?".to_owned());
    params.push(Value::Text(encode_date(until)));
  }

  (where_sql(&conds), params)
}

fn sums_to_totals(upload: i64, download: i64) -> Result<UsageTotals> {
  Ok(UsageTotals::new(
    decode_bytes("upload", upload)?,
    decode_bytes("download", download)?,
  ))
}

// ─── MeteringStore impl ──────────────────────────────────────────────────────

impl MeteringStore for SqliteStore {
  type Error = Error;

  // ── Subscriptions ─────────────────────────────────────────────────────────

  async fn insert_subscription(&self, subscription: Subscription) -> Result<Subscription> {
    if let Some(id) = subscription.id() {
      return Err(Error::AlreadyPersisted(id));
    }
    let p = SubscriptionParams::from_record(&subscription.to_record())?;
    let written = p.clone();

    let id: i64 = self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT INTO subscriptions (
             link_token, subject_kind, subject_id, plan_id, status,
             start_date, end_date, current_period_start, current_period_end,
             auto_renew, cancelled_at, cancel_reason, suspended_at,
             suspension_reason, usage_reset_at, metadata, version,
             created_at, updated_at
           ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                     ?15, ?16, ?17, ?18, ?19)",
          rusqlite::params![
            p.link_token,
            p.subject_kind,
            p.subject_id,
            p.plan_id,
            p.status,
            p.start_date,
            p.end_date,
            p.current_period_start,
            p.current_period_end,
            p.auto_renew,
            p.cancelled_at,
            p.cancel_reason,
            p.suspended_at,
            p.suspension_reason,
            p.usage_reset_at,
            p.metadata,
            p.version,
            p.created_at,
            p.updated_at,
          ],
        )?;
        Ok(conn.last_insert_rowid())
      })
      .await?;

    written.into_raw(id).into_subscription()
  }

  async fn update_subscription(&self, subscription: Subscription) -> Result<Subscription> {
    let id = subscription.id().ok_or(Error::NotPersisted)?;
    if !subscription.is_dirty() {
      return Ok(subscription);
    }
    let expected = subscription.persisted_version();
    let p = SubscriptionParams::from_record(&subscription.to_record())?;
    let written = p.clone();

    // (rows updated, version currently stored)
    let (updated, stored): (usize, Option<i64>) = self
      .conn
      .call(move |conn| {
        let updated = conn.execute(
          "UPDATE subscriptions SET
             link_token = ?1, subject_kind = ?2, subject_id = ?3, plan_id = ?4,
             status = ?5, start_date = ?6, end_date = ?7,
             current_period_start = ?8, current_period_end = ?9,
             auto_renew = ?10, cancelled_at = ?11, cancel_reason = ?12,
             suspended_at = ?13, suspension_reason = ?14, usage_reset_at = ?15,
             metadata = ?16, version = ?17, created_at = ?18, updated_at = ?19
           WHERE id = ?20 AND version = ?21",
          rusqlite::params![
            p.link_token,
            p.subject_kind,
            p.subject_id,
            p.plan_id,
            p.status,
            p.start_date,
            p.end_date,
            p.current_period_start,
            p.current_period_end,
            p.auto_renew,
            p.cancelled_at,
            p.cancel_reason,
            p.suspended_at,
            p.suspension_reason,
            p.usage_reset_at,
            p.metadata,
            p.version,
            p.created_at,
            p.updated_at,
            id,
            expected,
          ],
        )?;
        if updated > 0 {
          return Ok((updated, None));
        }
        let stored: Option<i64> = conn
          .query_row(
            "SELECT version FROM subscriptions WHERE id = ?1",
            rusqlite::params![id],
            |r| r.get(0),
          )
          .optional()?;
        Ok((0, stored))
      })
      .await?;

    if updated == 0 {
      return Err(match stored {
        Some(_) => tally_core::Error::VersionConflict { id, expected }.into(),
        None => Error::SubscriptionNotFound(id),
      });
    }
    written.into_raw(id).into_subscription()
  }

  async fn delete_subscription(&self, id: i64) -> Result<bool> {
    let deleted = self
      .conn
      .call(move |conn| {
        Ok(conn.execute("DELETE FROM subscriptions WHERE id = ?1", rusqlite::params![id])?)
      })
      .await?;
    Ok(deleted > 0)
  }

  async fn get_subscription(&self, id: i64) -> Result<Option<Subscription>> {
    self.query_one_subscription("id = ?1", Value::Integer(id)).await
  }

  async fn get_subscription_by_link_token(
    &self,
    token: Uuid,
  ) -> Result<Option<Subscription>> {
    self
      .query_one_subscription("link_token = ?1", Value::Text(encode_uuid(token)))
      .await
  }

  async fn list_subscriptions(&self, query: &SubscriptionQuery) -> Result<Vec<Subscription>> {
    let (where_clause, mut params) = subscription_filter(query);
    params.extend(page_params(query.limit, query.offset));
    let sql = format!(
      "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions {where_clause}
       ORDER BY id LIMIT ? OFFSET ?"
    );

    let raws: Vec<RawSubscription> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
          .query_map(rusqlite::params_from_iter(params), RawSubscription::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawSubscription::into_subscription).collect()
  }

  // ── Plans ─────────────────────────────────────────────────────────────────

  async fn put_plan(&self, plan: PlanFeatures) -> Result<()> {
    plan.validate()?;
    let limit = plan
      .traffic_limit_bytes
      .map(|v| encode_bytes("traffic_limit_bytes", v))
      .transpose()?;
    let plan_type = plan.plan_type.as_str();
    let reset_mode = plan.traffic_reset_mode.as_str();
    let plan_id = plan.plan_id;

    self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT INTO plans (plan_id, plan_type, traffic_limit_bytes, traffic_reset_mode)
           VALUES (?1, ?2, ?3, ?4)
           ON CONFLICT (plan_id) DO UPDATE SET
             plan_type           = excluded.plan_type,
             traffic_limit_bytes = excluded.traffic_limit_bytes,
             traffic_reset_mode  = excluded.traffic_reset_mode",
          rusqlite::params![plan_id, plan_type, limit, reset_mode],
        )?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  async fn get_plan(&self, plan_id: i64) -> Result<Option<PlanFeatures>> {
    let raw: Option<RawPlan> = self
      .conn
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              "SELECT plan_id, plan_type, traffic_limit_bytes, traffic_reset_mode
               FROM plans WHERE plan_id = ?1",
              rusqlite::params![plan_id],
              |row| {
                Ok(RawPlan {
                  plan_id:             row.get(0)?,
                  plan_type:           row.get(1)?,
                  traffic_limit_bytes: row.get(2)?,
                  traffic_reset_mode:  row.get(3)?,
                })
              },
            )
            .optional()?,
        )
      })
      .await?;

    raw.map(RawPlan::into_plan).transpose()
  }

  // ── Usage writes ──────────────────────────────────────────────────────────

  async fn record_usage(
    &self,
    key: UsageKey,
    delta: UsageTotals,
  ) -> Result<Option<UsageStats>> {
    key.validate()?;
    if delta.is_zero() {
      return self.get_usage(key).await;
    }

    let upload = encode_bytes("upload", delta.upload)?;
    let download = encode_bytes("download", delta.download)?;
    encode_bytes("total", delta.total())?;
    let resource_type = key.resource.kind.as_str();
    let resource_id = key.resource.id;
    let subscription_id = encode_owner(key.subscription_id);
    let granularity = key.granularity.as_str();
    let period = encode_date(key.period);
    let now = encode_dt(Utc::now());

    let raw: RawUsage = self
      .conn
      .call(move |conn| {
        Ok(conn.query_row(
          &format!(
            "INSERT INTO usage_stats (
               resource_type, resource_id, subscription_id, granularity, period,
               upload, download, total, created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?6 + ?7, ?8, ?8)
             ON CONFLICT (resource_type, resource_id, subscription_id, granularity, period)
             DO UPDATE SET
               upload     = upload + excluded.upload,
               download   = download + excluded.download,
               total      = (upload + excluded.upload) + (download + excluded.download),
               updated_at = excluded.updated_at
             RETURNING {USAGE_COLUMNS}"
          ),
          rusqlite::params![
            resource_type,
            resource_id,
            subscription_id,
            granularity,
            period,
            upload,
            download,
            now,
          ],
          RawUsage::from_row,
        )?)
      })
      .await?;

    raw.into_stats().map(Some)
  }

  async fn put_usage(&self, stats: UsageStats) -> Result<UsageStats> {
    stats.validate()?;
    let key = *stats.key();
    key.validate()?;

    let resource_type = key.resource.kind.as_str();
    let resource_id = key.resource.id;
    let granularity = key.granularity.as_str();
    let period = encode_date(key.period);
    let subscription_id = encode_owner(key.subscription_id);
    let upload = encode_bytes("upload", stats.upload())?;
    let download = encode_bytes("download", stats.download())?;
    let total = encode_bytes("total", stats.total())?;
    let created_at = encode_dt(stats.created_at());
    let updated_at = encode_dt(stats.updated_at());

    let raw: RawUsage = self
      .conn
      .call(move |conn| {
        Ok(conn.query_row(
          &format!(
            "INSERT INTO usage_stats (
               resource_type, resource_id, subscription_id, granularity, period,
               upload, download, total, created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT (resource_type, resource_id, subscription_id, granularity, period)
             DO UPDATE SET
               upload     = excluded.upload,
               download   = excluded.download,
               total      = excluded.total,
               updated_at = excluded.updated_at
             RETURNING {USAGE_COLUMNS}"
          ),
          rusqlite::params![
            resource_type,
            resource_id,
            subscription_id,
            granularity,
            period,
            upload,
            download,
            total,
            created_at,
            updated_at,
          ],
          RawUsage::from_row,
        )?)
      })
      .await?;

    raw.into_stats()
  }

  async fn rollup_monthly(
    &self,
    resource: ResourceRef,
    subscription_id: Option<i64>,
    month: NaiveDate,
  ) -> Result<UsageStats> {
    let key = UsageKey {
      subscription_id,
      ..UsageKey::for_date(resource, Granularity::Monthly, month)
    };
    key.validate()?;
    let next_month = key
      .period
      .checked_add_months(Months::new(1))
      .ok_or_else(|| tally_core::Error::Integrity(format!("no month after {}", key.period)))?;

    let params = vec![
      Value::Text(resource.kind.as_str().to_owned()),
      Value::Integer(resource.id),
      Value::Integer(encode_owner(subscription_id)),
      Value::Text(Granularity::Daily.as_str().to_owned()),
      Value::Text(encode_date(key.period)),
      Value::Text(encode_date(next_month)),
    ];
    let (upload, download): (i64, i64) = self
      .conn
      .call(move |conn| {
        Ok(conn.query_row(
          "SELECT COALESCE(SUM(upload), 0), COALESCE(SUM(download), 0)
           FROM usage_stats
           WHERE resource_type = ?1 AND resource_id = ?2 AND subscription_id = ?3
             AND granularity = ?4 AND period >= ?5 AND period < ?6",
          rusqlite::params_from_iter(params),
          |r| Ok((r.get(0)?, r.get(1)?)),
        )?)
      })
      .await?;
    let totals = sums_to_totals(upload, download)?;

    let mut stats = UsageStats::new(key)?;
    stats.set_usage(totals.upload, totals.download)?;
    self.put_usage(stats).await
  }

  // ── Usage reads ───────────────────────────────────────────────────────────

  async fn get_usage(&self, key: UsageKey) -> Result<Option<UsageStats>> {
    let sql = format!(
      "SELECT {USAGE_COLUMNS} FROM usage_stats
       WHERE resource_type = ?1 AND resource_id = ?2 AND subscription_id = ?3
         AND granularity = ?4 AND period = ?5"
    );
    let params = vec![
      Value::Text(key.resource.kind.as_str().to_owned()),
      Value::Integer(key.resource.id),
      Value::Integer(encode_owner(key.subscription_id)),
      Value::Text(key.granularity.as_str().to_owned()),
      Value::Text(encode_date(key.period)),
    ];
    Ok(self.query_usage_rows(sql, params).await?.into_iter().next())
  }

  async fn list_usage(&self, query: &UsageQuery) -> Result<UsagePage> {
    let (where_clause, params) = usage_filter(query);

    let count_sql = format!("SELECT COUNT(*) FROM usage_stats {where_clause}");
    let count_params = params.clone();
    let total_count: i64 = self
      .conn
      .call(move |conn| {
        Ok(conn.query_row(
          &count_sql,
          rusqlite::params_from_iter(count_params),
          |r| r.get(0),
        )?)
      })
      .await?;

    let mut page_params_vec = params;
    page_params_vec.extend(page_params(query.limit, query.offset));
    let sql = format!(
      "SELECT {USAGE_COLUMNS} FROM usage_stats {where_clause}
       ORDER BY period, resource_type, resource_id, subscription_id LIMIT ? OFFSET ?"
    );
    let items = self.query_usage_rows(sql, page_params_vec).await?;

    Ok(UsagePage {
      items,
      total_count: u64::try_from(total_count).unwrap_or_default(),
    })
  }

  async fn sum_usage(&self, query: &UsageQuery) -> Result<UsageTotals> {
    let (where_clause, params) = usage_filter(query);
    let sql = format!(
      "SELECT COALESCE(SUM(upload), 0), COALESCE(SUM(download), 0)
       FROM usage_stats {where_clause}"
    );

    let (upload, download): (i64, i64) = self
      .conn
      .call(move |conn| {
        Ok(conn.query_row(&sql, rusqlite::params_from_iter(params), |r| {
          Ok((r.get(0)?, r.get(1)?))
        })?)
      })
      .await?;

    sums_to_totals(upload, download)
  }

  async fn usage_trend(&self, query: &UsageQuery) -> Result<Vec<UsageTrendPoint>> {
    let (where_clause, params) = usage_filter(query);
    let sql = format!(
      "SELECT period, SUM(upload), SUM(download)
       FROM usage_stats {where_clause}
       GROUP BY period ORDER BY period"
    );

    let rows: Vec<(String, i64, i64)> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
          .query_map(rusqlite::params_from_iter(params), |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?))
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    rows
      .into_iter()
      .map(|(period, upload, download)| {
        Ok(UsageTrendPoint {
          period: decode_date(&period)?,
          totals: sums_to_totals(upload, download)?,
        })
      })
      .collect()
  }
}
