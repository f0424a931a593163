// kube-endpoints - health-checked service endpoints for Kubernetes
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

pub mod admin;
pub mod conditions;
pub mod config;
pub mod crd;
pub mod probe;
pub mod reconciler;
pub mod stats;
pub mod store;
pub mod sync;
pub mod time;
pub mod topology;
pub mod trigger;

#[cfg(test)]
mod test;

use crate::admin::AdminState;
use crate::conditions::ConditionTracker;
use crate::config::Config;
use crate::probe::ProbePolicy;
use crate::probe::network::NetworkProber;
use crate::reconciler::{Context, Reconciler, RequeueBackoff};
use crate::stats::{ProbeStats, ReconcileStats};
use crate::store::KubeObjectApi;
use crate::sync::ObjectSynchronizer;
use crate::time::RealTimeProvider;
use crate::topology::TopologyAggregator;
use bd_server_stats::stats::Collector;
use bd_shutdown::ComponentShutdownTrigger;
use futures::Future;
use kube_endpoints_common::bind_resolver::BindResolver;
use log::info;
use std::sync::Arc;

#[cfg(test)]
#[ctor::ctor]
fn test_global_init() {
  kube_endpoints_common::global_initialize();
}

fn make_context(client: &kube::Client, config: &Config, collector: &Collector) -> Arc<Context> {
  let scope = collector.scope("kube_endpoints");
  let api = Arc::new(KubeObjectApi::new(client.clone()));
  let retry_policy = config.conflict_retry.clone();

  let reconciler = Reconciler::new(
    ObjectSynchronizer::new(api.clone(), api.clone(), retry_policy.clone()),
    TopologyAggregator::new(
      ProbePolicy::new(Arc::new(NetworkProber::new()), config.retry_budget()),
      Arc::new(ProbeStats::new(&scope)),
      config.max_concurrent_probes,
    ),
    ConditionTracker::new(api, Arc::new(RealTimeProvider {}), retry_policy),
    ReconcileStats::new(&scope),
  );
  Arc::new(Context {
    reconciler,
    default_period: config.default_period,
    backoff: RequeueBackoff::new(
      config.rate_limiter.base_delay,
      config.rate_limiter.max_delay,
    ),
  })
}

/// Runs the admin servers and the ClusterEndpoint controller until `shutdown` resolves.
pub async fn run_server<ShutdownFuture: Future<Output = ()>>(
  config: Config,
  config_check_only: bool,
  shutdown: impl FnOnce() -> ShutdownFuture,
  bind_resolver: Arc<dyn BindResolver>,
) -> anyhow::Result<()> {
  config.validate()?;
  if config_check_only {
    info!("--config-check-and-exit set, exiting");
    return Ok(());
  }

  let client = kube::Client::try_default().await?;
  let collector = Collector::default();
  let ctx = make_context(&client, &config, &collector);
  let shutdown_trigger = ComponentShutdownTrigger::default();

  let health_shutdown = shutdown_trigger.make_shutdown();
  let health_resolver = bind_resolver.clone();
  let health_bind = config.health_bind.clone();
  tokio::spawn(async move {
    if let Err(e) =
      AdminState::spawn_health_server(health_resolver, &health_bind, health_shutdown).await
    {
      log::error!("health server failed: {e}");
    }
  });

  let admin_state = AdminState::new(collector);
  let metrics_shutdown = shutdown_trigger.make_shutdown();
  let metrics_bind = config.metrics_bind.clone();
  tokio::spawn(async move {
    if let Err(e) = admin_state
      .spawn_metrics_server(bind_resolver, &metrics_bind, metrics_shutdown)
      .await
    {
      log::error!("metrics server failed: {e}");
    }
  });

  let controller = tokio::spawn(reconciler::run_controller(
    client,
    ctx,
    config.concurrency(),
    shutdown_trigger.make_shutdown(),
  ));

  shutdown().await;
  shutdown_trigger.shutdown().await;
  controller.await?;
  info!("runtime terminated");
  Ok(())
}
