// kube-endpoints - health-checked service endpoints for Kubernetes
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./config_test.rs"]
mod config_test;

use crate::store::ConflictRetryPolicy;
use anyhow::{Context, bail};
use serde::Deserialize;
use std::time::Duration;

pub const DEFAULT_HEALTH_BIND: &str = "0.0.0.0:8080";
pub const DEFAULT_METRICS_BIND: &str = "0.0.0.0:9090";
pub const DEFAULT_MAX_CONCURRENT_RECONCILES: i32 = 1;
pub const DEFAULT_MAX_RETRY: i32 = 1;
pub const DEFAULT_PERIOD: Duration = Duration::from_secs(10);

//
// RateLimiterConfig
//

/// Requeue delay for failed passes, doubling per consecutive failure of the same object.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimiterConfig {
  #[serde(with = "humantime_serde")]
  pub base_delay: Duration,
  #[serde(with = "humantime_serde")]
  pub max_delay: Duration,
}

impl Default for RateLimiterConfig {
  fn default() -> Self {
    Self {
      base_delay: Duration::from_millis(5),
      max_delay: Duration::from_secs(1000),
    }
  }
}

//
// Config
//

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
  pub health_bind: String,
  pub metrics_bind: String,
  /// Resources reconciled in parallel. Values below 1 are treated as 1.
  pub max_concurrent_reconciles: i32,
  /// Probe attempts per host and pass. Values below 1 are treated as 1.
  pub max_retry: i32,
  /// Cap on probes in flight within one pass. Unset is unbounded.
  pub max_concurrent_probes: Option<usize>,
  /// Re-probe interval for resources that do not set `periodSeconds`.
  #[serde(with = "humantime_serde")]
  pub default_period: Duration,
  pub rate_limiter: RateLimiterConfig,
  pub conflict_retry: ConflictRetryPolicy,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      health_bind: DEFAULT_HEALTH_BIND.to_string(),
      metrics_bind: DEFAULT_METRICS_BIND.to_string(),
      max_concurrent_reconciles: DEFAULT_MAX_CONCURRENT_RECONCILES,
      max_retry: DEFAULT_MAX_RETRY,
      max_concurrent_probes: None,
      default_period: DEFAULT_PERIOD,
      rate_limiter: RateLimiterConfig::default(),
      conflict_retry: ConflictRetryPolicy::default(),
    }
  }
}

impl Config {
  pub fn validate(&self) -> anyhow::Result<()> {
    if self.rate_limiter.base_delay > self.rate_limiter.max_delay {
      bail!(
        "rate_limiter.base_delay ({:?}) must not exceed rate_limiter.max_delay ({:?})",
        self.rate_limiter.base_delay,
        self.rate_limiter.max_delay
      );
    }
    if self.default_period.is_zero() {
      bail!("default_period must be greater than zero");
    }
    if self.max_concurrent_probes == Some(0) {
      bail!("max_concurrent_probes must be greater than zero when set");
    }
    if self.conflict_retry.steps == 0 {
      bail!("conflict_retry.steps must be greater than zero");
    }
    Ok(())
  }

  #[must_use]
  pub fn concurrency(&self) -> u16 {
    u16::try_from(self.max_concurrent_reconciles.max(1)).unwrap_or(u16::MAX)
  }

  #[must_use]
  pub fn retry_budget(&self) -> u32 {
    self.max_retry.max(1).unsigned_abs()
  }
}

pub fn load_from_str(contents: &str) -> anyhow::Result<Config> {
  // An empty document means all defaults.
  if contents.trim().is_empty() {
    return Ok(Config::default());
  }
  Ok(serde_yaml::from_str(contents)?)
}

pub fn load_from_file(path: &str) -> anyhow::Result<Config> {
  let file_contents =
    std::fs::read_to_string(path).with_context(|| format!("can't read config file {path}"))?;
  load_from_str(&file_contents).with_context(|| format!("can't parse config file {path}"))
}
