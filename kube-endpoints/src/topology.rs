// kube-endpoints - health-checked service endpoints for Kubernetes
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./topology_test.rs"]
mod topology_test;

use crate::crd::ClusterEndpoint;
use crate::probe::{ProbeCheck, ProbeError, ProbePolicy, ProbeType, make_target};
use crate::stats::{MetricsSink, ProbeLabels};
use k8s_openapi::api::core::v1::EndpointSubset;
use kube::ResourceExt;
use kube_endpoints_common::k8s::object_namespace;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Renders a list of errors as one message: a single error verbatim, several as `[e1, e2]`.
#[must_use]
pub fn aggregate_message<E: fmt::Display>(errors: &[E]) -> String {
  match errors {
    [] => String::new(),
    [error] => error.to_string(),
    errors => format!(
      "[{}]",
      errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
    ),
  }
}

//
// ProbeFailure
//

#[derive(Debug)]
pub struct ProbeFailure {
  pub port: String,
  pub target: String,
  pub probe_type: Option<ProbeType>,
  pub error: ProbeError,
}

impl fmt::Display for ProbeFailure {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "{} probe of {} (port {}) failed: {}",
      ProbeType::label(self.probe_type),
      self.target,
      self.port,
      self.error
    )
  }
}

//
// Topology
//

/// Result of one probe round: a subset per healthy (port, host) pair and a failure per unhealthy
/// one.
#[derive(Debug, Default)]
pub struct Topology {
  pub subsets: Vec<EndpointSubset>,
  pub failures: Vec<ProbeFailure>,
}

impl Topology {
  #[must_use]
  pub fn is_degraded(&self) -> bool {
    !self.failures.is_empty()
  }

  #[must_use]
  pub fn error_message(&self) -> Option<String> {
    self
      .is_degraded()
      .then(|| aggregate_message(&self.failures))
  }
}

//
// TopologyAggregator
//

pub struct TopologyAggregator {
  policy: Arc<ProbePolicy>,
  metrics: Arc<dyn MetricsSink>,
  limiter: Option<Arc<Semaphore>>,
}

impl TopologyAggregator {
  /// `max_concurrent_probes` caps the probes in flight within one aggregation. None leaves the
  /// fan-out unbounded.
  #[must_use]
  pub fn new(
    policy: ProbePolicy,
    metrics: Arc<dyn MetricsSink>,
    max_concurrent_probes: Option<usize>,
  ) -> Self {
    Self {
      policy: Arc::new(policy),
      metrics,
      limiter: max_concurrent_probes.map(|permits| Arc::new(Semaphore::new(permits.max(1)))),
    }
  }

  /// Probes every (port, host) pair of `cep` concurrently and waits for all of them. Dropping the
  /// returned future aborts the probes still in flight.
  pub async fn aggregate(&self, cep: &ClusterEndpoint) -> Topology {
    let name = cep.name_any();
    let namespace = object_namespace(&cep.metadata).to_string();
    let accumulator = Arc::new(Mutex::new(Topology::default()));

    let mut tasks = JoinSet::new();
    let mut in_flight = HashMap::new();
    let mut attempted = Vec::new();
    for port in &cep.spec.ports {
      let probe_type = ProbeCheck::resolve(port).map(|check| check.probe_type());
      for host in port.unique_hosts() {
        let labels = ProbeLabels {
          name: name.clone(),
          namespace: namespace.clone(),
          target: make_target(host, port.target_port),
          probe_type: ProbeType::label(probe_type),
        };
        attempted.push(labels.clone());

        let policy = self.policy.clone();
        let metrics = self.metrics.clone();
        let limiter = self.limiter.clone();
        let accumulator = accumulator.clone();
        let task_port = port.clone();
        let host = host.to_string();
        let task_labels = labels.clone();
        let handle = tasks.spawn(async move {
          let _permit = match limiter {
            Some(limiter) => limiter.acquire_owned().await.ok(),
            None => None,
          };
          let outcome = policy.evaluate(&task_port, &host).await;

          let mut accumulator = accumulator.lock();
          match outcome.error {
            None => {
              metrics.record_success(&task_labels);
              accumulator.subsets.push(task_port.to_endpoint_subset(&host));
            },
            Some(error) => {
              metrics.record_failure(&task_labels);
              accumulator.failures.push(ProbeFailure {
                port: outcome.port,
                target: outcome.target,
                probe_type: outcome.probe_type,
                error,
              });
            },
          }
        });
        in_flight.insert(handle.id(), (port.name.clone(), probe_type, labels));
      }
    }

    while let Some(result) = tasks.join_next_with_id().await {
      match result {
        Ok((id, ())) => {
          in_flight.remove(&id);
        },
        Err(e) => {
          // A probe task that panicked still has to show up as a failure.
          let Some((port, probe_type, labels)) = in_flight.remove(&e.id()) else {
            continue;
          };
          log::warn!("probe task for {} did not complete: {e}", labels.target);
          self.metrics.record_failure(&labels);
          accumulator.lock().failures.push(ProbeFailure {
            port,
            target: labels.target,
            probe_type,
            error: ProbeError::Aborted(e.to_string()),
          });
        },
      }
    }

    for labels in &attempted {
      self.metrics.record_attempt(labels);
    }

    let mut topology = std::mem::take(&mut *accumulator.lock());
    topology
      .failures
      .sort_by(|a, b| (&a.target, &a.port).cmp(&(&b.target, &b.port)));
    log::debug!(
      "{namespace}/{name}: {} healthy, {} unhealthy",
      topology.subsets.len(),
      topology.failures.len()
    );
    topology
  }
}
