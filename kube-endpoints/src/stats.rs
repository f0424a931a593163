// kube-endpoints - health-checked service endpoints for Kubernetes
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./stats_test.rs"]
mod stats_test;

use bd_server_stats::stats::Scope;
use mockall::automock;
use prometheus::IntCounter;
use std::collections::HashMap;

//
// ProbeLabels
//

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ProbeLabels {
  pub name: String,
  pub namespace: String,
  pub target: String,
  pub probe_type: &'static str,
}

impl ProbeLabels {
  fn to_labels(&self) -> HashMap<String, String> {
    HashMap::from([
      ("name".to_string(), self.name.clone()),
      ("namespace".to_string(), self.namespace.clone()),
      ("target".to_string(), self.target.clone()),
      ("probe_type".to_string(), self.probe_type.to_string()),
    ])
  }
}

//
// MetricsSink
//

/// Probe observations. Implementations must be safe to call concurrently and must never fail.
#[automock]
pub trait MetricsSink: Send + Sync {
  fn record_attempt(&self, labels: &ProbeLabels);
  fn record_success(&self, labels: &ProbeLabels);
  fn record_failure(&self, labels: &ProbeLabels);
}

//
// ProbeStats
//

pub struct ProbeStats {
  scope: Scope,
}

impl ProbeStats {
  #[must_use]
  pub fn new(scope: &Scope) -> Self {
    Self {
      scope: scope.scope("probe"),
    }
  }

  fn counter(&self, name: &str, labels: &ProbeLabels) -> IntCounter {
    self.scope.counter_with_labels(name, labels.to_labels())
  }
}

impl MetricsSink for ProbeStats {
  fn record_attempt(&self, labels: &ProbeLabels) {
    self.counter("attempt", labels).inc();
  }

  fn record_success(&self, labels: &ProbeLabels) {
    self.counter("success", labels).inc();
  }

  fn record_failure(&self, labels: &ProbeLabels) {
    self.counter("failure", labels).inc();
  }
}

//
// ReconcileStats
//

pub struct ReconcileStats {
  pub passes: IntCounter,
  pub ready: IntCounter,
  pub degraded: IntCounter,
  pub service_sync_failed: IntCounter,
  pub endpoint_sync_failed: IntCounter,
  pub condition_write_failed: IntCounter,
  pub condition_writes: IntCounter,
  pub condition_writes_suppressed: IntCounter,
}

impl ReconcileStats {
  #[must_use]
  pub fn new(scope: &Scope) -> Self {
    let scope = scope.scope("reconcile");
    Self {
      passes: scope.counter("passes"),
      ready: scope.counter("ready"),
      degraded: scope.counter("degraded"),
      service_sync_failed: scope.counter("service_sync_failed"),
      endpoint_sync_failed: scope.counter("endpoint_sync_failed"),
      condition_write_failed: scope.counter("condition_write_failed"),
      condition_writes: scope.counter("condition_writes"),
      condition_writes_suppressed: scope.counter("condition_writes_suppressed"),
    }
  }
}
