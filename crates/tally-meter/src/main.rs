//! `tally`: operate a Tally metering store from the command line.
//!
//! Reads `tally.toml` (or the path given with `--config`), overlays `TALLY_*`
//! environment variables, opens the SQLite store and runs one subcommand.
//! Results are printed as JSON.
//!
//! ```
//! tally plan --id 7 --plan-type node --limit 1073741824
//! tally create --subject 42 --plan 7 --start 2024-01-01T00:00:00Z --end 2024-02-01T00:00:00Z --activate
//! tally record --subscription 1 --resource 3 --upload 1000 --download 5000
//! ```

use std::path::{Path, PathBuf};

use anyhow::Context as _;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tally_core::{
  period::TrafficResetMode,
  plan::{PlanFeatures, PlanType},
  store::MeteringStore,
  subscription::{Metadata, NewSubscription, SubjectKind, Subscription},
  usage::{ResourceKind, ResourceRef},
};
use tally_meter::{MeterConfig, MeteringService};
use tally_store_sqlite::SqliteStore;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about = "Tally subscription meter")]
struct Cli {
  /// Path to the TOML configuration file.
  #[arg(short, long, default_value = "tally.toml")]
  config: PathBuf,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand)]
enum Command {
  /// Create or replace a plan's quota settings.
  Plan {
    #[arg(long)]
    id:         i64,
    #[arg(long, default_value = "node")]
    plan_type:  PlanType,
    /// Traffic limit in bytes; omit or pass 0 for unlimited.
    #[arg(long)]
    limit:      Option<u64>,
    #[arg(long, default_value = "calendar_month")]
    reset_mode: TrafficResetMode,
  },
  /// Create a subscription.
  Create {
    #[arg(long, default_value = "user")]
    subject_kind: SubjectKind,
    #[arg(long)]
    subject:      i64,
    #[arg(long)]
    plan:         i64,
    #[arg(long)]
    start:        DateTime<Utc>,
    #[arg(long)]
    end:          DateTime<Utc>,
    #[arg(long)]
    auto_renew:   bool,
    /// Activate immediately instead of leaving it inactive.
    #[arg(long)]
    activate:     bool,
  },
  /// Record observed traffic and enforce the quota.
  Record {
    #[arg(long)]
    subscription:  i64,
    #[arg(long, default_value = "node")]
    resource_kind: ResourceKind,
    #[arg(long)]
    resource:      i64,
    #[arg(long, default_value_t = 0)]
    upload:        u64,
    #[arg(long, default_value_t = 0)]
    download:      u64,
    /// When the traffic was observed; defaults to now.
    #[arg(long)]
    at:            Option<DateTime<Utc>>,
  },
  /// Check a subscription's quota, suspending it if exhausted.
  Enforce {
    #[arg(long)]
    subscription: i64,
  },
  /// Start a new metering period, lifting any suspension.
  Reset {
    #[arg(long)]
    subscription: i64,
  },
  /// Extend a subscription to a new end date.
  Renew {
    #[arg(long)]
    subscription: i64,
    #[arg(long)]
    until:        DateTime<Utc>,
  },
  /// Expire every subscription whose end date has passed.
  Expire {
    /// Reference time; defaults to now.
    #[arg(long)]
    now: Option<DateTime<Utc>>,
  },
  /// Print a subscription and its current quota evaluation.
  Show {
    #[arg(long)]
    subscription: i64,
  },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  // Initialise tracing.
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy(),
    )
    .with_writer(std::io::stderr)
    .init();

  let cli = Cli::parse();

  // Load configuration.
  let cfg = MeterConfig::load(&cli.config).context("failed to load configuration")?;
  let store_path = expand_tilde(&cfg.store_path);

  let store = SqliteStore::open(&store_path)
    .await
    .with_context(|| format!("failed to open store at {store_path:?}"))?;
  let service = MeteringService::from_config(store, &cfg).context("invalid configuration")?;

  run(&service, cli.command).await
}

async fn run(service: &MeteringService<SqliteStore>, command: Command) -> anyhow::Result<()> {
  match command {
    Command::Plan { id, plan_type, limit, reset_mode } => {
      let plan = PlanFeatures {
        plan_id:             id,
        plan_type,
        traffic_limit_bytes: limit,
        traffic_reset_mode:  reset_mode,
      };
      service.store().put_plan(plan.clone()).await.context("failed to save plan")?;
      print_json(&plan)
    }

    Command::Create { subject_kind, subject, plan, start, end, auto_renew, activate } => {
      let mut sub = Subscription::new(NewSubscription {
        subject_kind,
        subject_id: subject,
        plan_id: plan,
        start_date: start,
        end_date: end,
        auto_renew,
        metadata: Metadata::new(),
      })?;
      if activate {
        sub.activate()?;
      }
      let sub = service
        .store()
        .insert_subscription(sub)
        .await
        .context("failed to create subscription")?;
      tracing::info!(subscription_id = sub.id(), status = %sub.status(), "subscription created");
      print_json(&sub.to_record())
    }

    Command::Record { subscription, resource_kind, resource, upload, download, at } => {
      let resource = ResourceRef::new(resource_kind, resource)?;
      let outcome = service
        .record_traffic(subscription, resource, upload, download, at.unwrap_or_else(Utc::now))
        .await
        .with_context(|| format!("failed to record traffic for subscription {subscription}"))?;
      print_json(&serde_json::json!({
        "daily":       outcome.daily.map(|u| u.to_record()),
        "monthly":     outcome.monthly.map(|u| u.to_record()),
        "enforcement": outcome.enforcement,
      }))
    }

    Command::Enforce { subscription } => {
      let enforcement = service
        .enforce_quota(subscription)
        .await
        .with_context(|| format!("failed to enforce quota for subscription {subscription}"))?;
      print_json(&enforcement)
    }

    Command::Reset { subscription } => {
      let sub = service.reset_usage(subscription).await?;
      print_json(&sub.to_record())
    }

    Command::Renew { subscription, until } => {
      let sub = service.renew(subscription, until).await?;
      print_json(&sub.to_record())
    }

    Command::Expire { now } => {
      let expired = service.expire_due(now.unwrap_or_else(Utc::now)).await?;
      let ids: Vec<_> = expired.iter().filter_map(Subscription::id).collect();
      print_json(&ids)
    }

    Command::Show { subscription } => {
      let sub = service.subscription(subscription).await?;
      let evaluation = service.evaluate_at(&sub, Utc::now()).await?;
      print_json(&serde_json::json!({
        "subscription":     sub.to_record(),
        "effective_status": sub.effective_status(),
        "quota":            evaluation,
      }))
    }
  }
}

fn print_json(value: &impl Serialize) -> anyhow::Result<()> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
  let s = path.to_string_lossy();
  if let Some(rest) = s.strip_prefix("~/")
    && let Ok(home) = std::env::var("HOME")
  {
    return PathBuf::from(home).join(rest);
  }
  path.to_path_buf()
}
