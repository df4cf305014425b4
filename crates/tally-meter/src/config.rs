//! Runtime configuration, layered from an optional TOML file and `TALLY_*`
//! environment variables.

use std::path::{Path, PathBuf};

use chrono::FixedOffset;
use serde::Deserialize;

use crate::{Error, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct MeterConfig {
  /// SQLite database file.
  #[serde(default = "default_store_path")]
  pub store_path:           PathBuf,
  /// Offset of the business timezone from UTC. Daily buckets and calendar
  /// months are cut at local midnight in this zone.
  #[serde(default)]
  pub utc_offset_minutes:   i32,
  /// How many times a read-modify-write is retried after losing a version
  /// race.
  #[serde(default = "default_max_conflict_retries")]
  pub max_conflict_retries: u32,
}

fn default_store_path() -> PathBuf { PathBuf::from("tally.db") }

fn default_max_conflict_retries() -> u32 { 3 }

impl Default for MeterConfig {
  fn default() -> Self {
    Self {
      store_path:           default_store_path(),
      utc_offset_minutes:   0,
      max_conflict_retries: default_max_conflict_retries(),
    }
  }
}

impl MeterConfig {
  /// Read `path` (if it exists) and overlay `TALLY_*` environment variables.
  pub fn load(path: &Path) -> Result<Self, config::ConfigError> {
    config::Config::builder()
      .add_source(config::File::from(path).required(false))
      .add_source(config::Environment::with_prefix("TALLY"))
      .build()?
      .try_deserialize()
  }

  pub fn timezone(&self) -> Result<FixedOffset> {
    self
      .utc_offset_minutes
      .checked_mul(60)
      .and_then(FixedOffset::east_opt)
      .ok_or_else(|| {
        Error::Config(format!(
          "utc_offset_minutes {} is out of range",
          self.utc_offset_minutes
        ))
      })
  }
}
