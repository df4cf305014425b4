//! SQL schema for the Tally SQLite store.
//!
//! Executed once at connection startup via `PRAGMA user_version`. Future
//! migrations will be gated on that version number.

/// Full schema DDL; idempotent thanks to `CREATE TABLE IF NOT EXISTS`.
pub const SCHEMA: &str = "
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

-- Quota-relevant projection of the external plan catalog.
CREATE TABLE IF NOT EXISTS plans (
    plan_id             INTEGER PRIMARY KEY,
    plan_type           TEXT NOT NULL,     -- 'node' | 'forward' | 'hybrid'
    traffic_limit_bytes INTEGER,           -- NULL or 0 = unlimited
    traffic_reset_mode  TEXT NOT NULL DEFAULT 'calendar_month'
);

-- One row per subscription aggregate. `version` guards every UPDATE.
CREATE TABLE IF NOT EXISTS subscriptions (
    id                   INTEGER PRIMARY KEY AUTOINCREMENT,
    link_token           TEXT NOT NULL UNIQUE,
    subject_kind         TEXT NOT NULL,
    subject_id           INTEGER NOT NULL,
    plan_id              INTEGER NOT NULL,
    status               TEXT NOT NULL,
    start_date           TEXT NOT NULL,  -- RFC 3339 UTC, fixed width
    end_date             TEXT NOT NULL,
    current_period_start TEXT NOT NULL,
    current_period_end   TEXT NOT NULL,
    auto_renew           INTEGER NOT NULL,
    cancelled_at         TEXT,
    cancel_reason        TEXT,
    suspended_at         TEXT,
    suspension_reason    TEXT,
    usage_reset_at       TEXT,
    metadata             TEXT NOT NULL DEFAULT '{}',
    version              INTEGER NOT NULL,
    created_at           TEXT NOT NULL,
    updated_at           TEXT NOT NULL
);

-- One row per (resource, owning subscription, granularity, period).
-- Incremented in place. `subscription_id` is 0 for unattributed rows so the
-- UNIQUE constraint (which treats NULLs as distinct) still applies.
CREATE TABLE IF NOT EXISTS usage_stats (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    resource_type   TEXT NOT NULL,     -- 'node' | 'forward_rule'
    resource_id     INTEGER NOT NULL,
    subscription_id INTEGER NOT NULL DEFAULT 0,
    granularity     TEXT NOT NULL,     -- 'daily' | 'monthly'
    period          TEXT NOT NULL,     -- YYYY-MM-DD
    upload          INTEGER NOT NULL DEFAULT 0,
    download        INTEGER NOT NULL DEFAULT 0,
    total           INTEGER NOT NULL DEFAULT 0,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL,
    UNIQUE (resource_type, resource_id, subscription_id, granularity, period)
);

CREATE INDEX IF NOT EXISTS subscriptions_subject_idx ON subscriptions(subject_kind, subject_id);
CREATE INDEX IF NOT EXISTS subscriptions_plan_idx    ON subscriptions(plan_id);
CREATE INDEX IF NOT EXISTS subscriptions_end_idx     ON subscriptions(end_date);
CREATE INDEX IF NOT EXISTS usage_subscription_idx    ON usage_stats(subscription_id, granularity, period);
CREATE INDEX IF NOT EXISTS usage_period_idx          ON usage_stats(granularity, period);

PRAGMA user_version = 2;
";
