// kube-endpoints - health-checked service endpoints for Kubernetes
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./reconciler_test.rs"]
mod reconciler_test;

use crate::conditions::ConditionTracker;
use crate::crd::{ClusterEndpoint, Condition, ConditionType};
use crate::stats::ReconcileStats;
use crate::store::StoreError;
use crate::sync::ObjectSynchronizer;
use crate::topology::TopologyAggregator;
use crate::trigger::TriggerFilter;
use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use bd_shutdown::ComponentShutdown;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Endpoints, Service};
use kube::runtime::controller::{self, Action, Controller};
use kube::runtime::{WatchStreamExt, reflector, watcher};
use kube::{Api, Client};
use kube_endpoints_common::k8s::ObjectKey;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

const SERVICE_SYNC_ERROR: &str = "ServiceSyncError";
const ENDPOINT_SYNC_ERROR: &str = "EndpointSyncError";
const ENDPOINT_SYNC_PORT_ERROR: &str = "EndpointSyncPortError";
const SERVICE_SYNC_SUCCESS: &str = "sync service successfully";
const ENDPOINT_SYNC_SUCCESS: &str = "sync endpoint successfully";

//
// PassReport
//

/// How a reconciliation pass ended. Every outcome has already been recorded in the resource's
/// status conditions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PassReport {
  ServiceSyncFailed,
  EndpointSyncFailed,
  /// Endpoints were written but some hosts failed their health check.
  Degraded {
    unhealthy: usize,
  },
  Ready,
}

//
// ReconcileError
//

#[derive(thiserror::Error, Debug)]
pub enum ReconcileError {
  #[error("{key}: pass ended with {report:?}")]
  SyncFailed { key: String, report: PassReport },
  #[error("condition update failed: {0}")]
  Condition(#[from] StoreError),
}

//
// Reconciler
//

pub struct Reconciler {
  synchronizer: ObjectSynchronizer,
  aggregator: TopologyAggregator,
  conditions: ConditionTracker,
  stats: ReconcileStats,
}

impl Reconciler {
  #[must_use]
  pub const fn new(
    synchronizer: ObjectSynchronizer,
    aggregator: TopologyAggregator,
    conditions: ConditionTracker,
    stats: ReconcileStats,
  ) -> Self {
    Self {
      synchronizer,
      aggregator,
      conditions,
      stats,
    }
  }

  async fn write_condition(
    &self,
    cep: &mut ClusterEndpoint,
    condition: Condition,
  ) -> Result<(), StoreError> {
    match self.conditions.update_condition(cep, condition).await {
      Ok(true) => self.stats.condition_writes.inc(),
      Ok(false) => self.stats.condition_writes_suppressed.inc(),
      Err(e) => {
        self.stats.condition_write_failed.inc();
        return Err(e);
      },
    }
    Ok(())
  }

  /// Runs one pass: Service first, then probes and Endpoints. A Service failure skips the
  /// Endpoints. Sync and probe failures end up in the status conditions; only a failure to write
  /// a condition is returned as an error.
  pub async fn reconcile_pass(&self, cep: &mut ClusterEndpoint) -> Result<PassReport, StoreError> {
    let key = ObjectKey::from_meta(&cep.metadata);
    self.stats.passes.inc();

    if let Err(e) = self.synchronizer.sync_service(cep).await {
      log::warn!("{key}: error syncing service: {e}");
      self.stats.service_sync_failed.inc();
      self
        .write_condition(
          cep,
          Condition::failed(
            ConditionType::SyncServiceReady,
            SERVICE_SYNC_ERROR,
            e.to_string(),
          ),
        )
        .await?;
      return Ok(PassReport::ServiceSyncFailed);
    }
    if !cep.is_condition_true(ConditionType::SyncServiceReady) {
      self
        .write_condition(
          cep,
          Condition::ready(ConditionType::SyncServiceReady, SERVICE_SYNC_SUCCESS),
        )
        .await?;
    }

    let topology = self.aggregator.aggregate(cep).await;
    let unhealthy = topology.failures.len();
    let probe_errors = topology.error_message();
    if let Err(e) = self
      .synchronizer
      .sync_endpoints(cep, topology.subsets)
      .await
    {
      log::warn!("{key}: error syncing endpoints: {e}");
      self.stats.endpoint_sync_failed.inc();
      self
        .write_condition(
          cep,
          Condition::failed(
            ConditionType::SyncEndpointReady,
            ENDPOINT_SYNC_ERROR,
            e.to_string(),
          ),
        )
        .await?;
      return Ok(PassReport::EndpointSyncFailed);
    }

    if let Some(message) = probe_errors {
      log::info!("{key}: {unhealthy} unhealthy endpoint(s): {message}");
      self.stats.degraded.inc();
      self
        .write_condition(
          cep,
          Condition::failed(
            ConditionType::SyncEndpointReady,
            ENDPOINT_SYNC_PORT_ERROR,
            message,
          ),
        )
        .await?;
      return Ok(PassReport::Degraded { unhealthy });
    }
    if !cep.is_condition_true(ConditionType::SyncEndpointReady) {
      self
        .write_condition(
          cep,
          Condition::ready(ConditionType::SyncEndpointReady, ENDPOINT_SYNC_SUCCESS),
        )
        .await?;
    }

    self.stats.ready.inc();
    Ok(PassReport::Ready)
  }
}

//
// RequeueBackoff
//

/// Per-object exponential requeue delay for failed passes, reset by a successful one.
pub struct RequeueBackoff {
  base_delay: Duration,
  max_delay: Duration,
  backoffs: Mutex<HashMap<ObjectKey, ExponentialBackoff>>,
}

impl RequeueBackoff {
  #[must_use]
  pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
    Self {
      base_delay,
      max_delay,
      backoffs: Mutex::default(),
    }
  }

  pub fn next_delay(&self, key: &ObjectKey) -> Duration {
    self
      .backoffs
      .lock()
      .entry(key.clone())
      .or_insert_with(|| {
        ExponentialBackoffBuilder::new()
          .with_initial_interval(self.base_delay)
          .with_multiplier(2.0)
          .with_randomization_factor(0.0)
          .with_max_interval(self.max_delay)
          .with_max_elapsed_time(None)
          .build()
      })
      .next_backoff()
      .unwrap_or(self.max_delay)
  }

  pub fn reset(&self, key: &ObjectKey) {
    self.backoffs.lock().remove(key);
  }
}

//
// Controller wiring
//

pub struct Context {
  pub reconciler: Reconciler,
  pub default_period: Duration,
  pub backoff: RequeueBackoff,
}

pub async fn reconcile(
  cep: Arc<ClusterEndpoint>,
  ctx: Arc<Context>,
) -> Result<Action, ReconcileError> {
  let key = ObjectKey::from_meta(&cep.metadata);
  if cep.metadata.deletion_timestamp.is_some() {
    // Owned objects are garbage collected with the resource.
    log::debug!("{key}: being deleted, skipping");
    ctx.backoff.reset(&key);
    return Ok(Action::await_change());
  }

  let mut cep = (*cep).clone();
  let report = ctx.reconciler.reconcile_pass(&mut cep).await?;
  match report {
    PassReport::ServiceSyncFailed | PassReport::EndpointSyncFailed => {
      Err(ReconcileError::SyncFailed {
        key: key.to_string(),
        report,
      })
    },
    PassReport::Degraded { .. } | PassReport::Ready => {
      ctx.backoff.reset(&key);
      Ok(Action::requeue(cep.period(ctx.default_period)))
    },
  }
}

pub fn error_policy(
  cep: Arc<ClusterEndpoint>,
  error: &ReconcileError,
  ctx: Arc<Context>,
) -> Action {
  let key = ObjectKey::from_meta(&cep.metadata);
  let delay = ctx.backoff.next_delay(&key);
  log::warn!("{key}: reconciliation failed, retrying in {delay:?}: {error}");
  Action::requeue(delay)
}

/// Runs the ClusterEndpoint controller until `shutdown` fires. Changes to owned Services and
/// Endpoints trigger a pass of their ClusterEndpoint.
pub async fn run_controller(
  client: Client,
  ctx: Arc<Context>,
  max_concurrent_reconciles: u16,
  mut shutdown: ComponentShutdown,
) {
  let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
  tokio::spawn(async move {
    shutdown.cancelled().await;
    let _ignored = shutdown_tx.send(());
  });

  log::info!("starting ClusterEndpoint controller (concurrency {max_concurrent_reconciles})");
  let (reader, writer) = reflector::store();
  let events = watcher(
    Api::<ClusterEndpoint>::all(client.clone()),
    watcher::Config::default(),
  )
  .default_backoff()
  .reflect(writer);
  let trigger = Arc::new(TriggerFilter::default()).filter_events(events);

  Controller::for_stream(trigger, reader)
    .owns(Api::<Service>::all(client.clone()), watcher::Config::default())
    .owns(Api::<Endpoints>::all(client), watcher::Config::default())
    .with_config(controller::Config::default().concurrency(max_concurrent_reconciles.max(1)))
    .graceful_shutdown_on(async move {
      let _ignored = shutdown_rx.await;
    })
    .run(reconcile, error_policy, ctx)
    .for_each(|result| async move {
      match result {
        Ok((object, _)) => log::trace!(
          "reconciled {}/{}",
          object.namespace.unwrap_or_default(),
          object.name
        ),
        Err(e) => log::debug!("controller error: {e}"),
      }
    })
    .await;
  log::info!("ClusterEndpoint controller terminated");
}
