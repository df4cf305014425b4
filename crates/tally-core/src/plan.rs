//! The Plan collaborator contract.
//!
//! Plans are owned by an external catalog. The kernel only needs the fields
//! that drive metering: which resources count, how much traffic is allowed,
//! and how the quota window resets.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{
  Error, Result,
  period::TrafficResetMode,
  quota,
  usage::ResourceKind,
};

/// What a plan provisions; selects which resource usage counts against it.
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
pub enum PlanType {
  Node,
  Forward,
  Hybrid,
}

impl PlanType {
  pub fn resource_kinds(self) -> &'static [ResourceKind] {
    match self {
      Self::Node => &[ResourceKind::Node],
      Self::Forward => &[ResourceKind::ForwardRule],
      Self::Hybrid => &[ResourceKind::Node, ResourceKind::ForwardRule],
    }
  }

  pub fn as_str(self) -> &'static str { self.into() }

  pub fn parse(s: &str) -> Result<Self> {
    Self::from_str(s).map_err(|_| Error::UnknownVariant {
      kind:  "plan type",
      value: s.to_owned(),
    })
  }
}

/// The quota-relevant projection of a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanFeatures {
  pub plan_id:             i64,
  pub plan_type:           PlanType,
  /// Bytes per traffic period. `None` or `Some(0)` means unlimited.
  pub traffic_limit_bytes: Option<u64>,
  #[serde(default)]
  pub traffic_reset_mode:  TrafficResetMode,
}

impl PlanFeatures {
  pub fn validate(&self) -> Result<()> {
    if self.plan_id <= 0 {
      return Err(Error::required("plan_id"));
    }
    Ok(())
  }

  pub fn is_unlimited_traffic(&self) -> bool {
    quota::is_unlimited_traffic(self.traffic_limit_bytes)
  }

  pub fn has_traffic_remaining(&self, used_bytes: u64) -> bool {
    quota::has_traffic_remaining(self.traffic_limit_bytes, used_bytes)
  }
}
