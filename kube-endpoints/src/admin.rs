// kube-endpoints - health-checked service endpoints for Kubernetes
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./admin_test.rs"]
mod admin_test;

use axum::Router;
use axum::extract::{Query, State};
use axum::http::header::CONTENT_TYPE;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use bd_log::SwapLogger;
use bd_server_stats::stats::Collector;
use bd_shutdown::ComponentShutdown;
use kube_endpoints_common::bind_resolver::BindResolver;
use log::info;
use std::collections::HashMap;
use std::sync::Arc;

//
// AdminState
//

// Health probes for the controller pod itself, plus the metrics scrape endpoint.
pub struct AdminState {
  collector: Collector,
}

impl AdminState {
  #[must_use]
  pub fn new(collector: Collector) -> Arc<Self> {
    Arc::new(Self { collector })
  }

  #[allow(clippy::unused_async)]
  async fn healthcheck() -> String {
    "OK".to_string()
  }

  #[allow(clippy::unused_async)]
  async fn metrics(State(state): State<Arc<Self>>) -> impl IntoResponse {
    (
      [(CONTENT_TYPE, prometheus::TEXT_FORMAT)],
      state.collector.prometheus_output(),
    )
  }

  #[allow(clippy::unused_async)]
  async fn log_filter(Query(mut params): Query<HashMap<String, String>>) -> String {
    let Some(filter) = params.remove("filter") else {
      return "usage: /log_filter?filter=RUST_LOG".to_string();
    };
    info!("updating log filter: {filter}");
    if let Err(e) = SwapLogger::swap(&filter) {
      log::warn!("error updating log filter: {e}");
    }

    "OK".to_string()
  }

  fn make_health_router() -> Router {
    Router::new()
      .route("/healthz", get(Self::healthcheck))
      .route("/readyz", get(Self::healthcheck))
  }

  fn make_metrics_router(self: Arc<Self>) -> Router {
    Router::new()
      .route("/metrics", get(Self::metrics))
      .route("/log_filter", post(Self::log_filter))
      .with_state(self)
  }

  pub async fn spawn_health_server(
    bind_resolver: Arc<dyn BindResolver>,
    bind: &str,
    shutdown: ComponentShutdown,
  ) -> anyhow::Result<()> {
    serve("health", Self::make_health_router(), bind_resolver, bind, shutdown).await
  }

  pub async fn spawn_metrics_server(
    self: Arc<Self>,
    bind_resolver: Arc<dyn BindResolver>,
    bind: &str,
    shutdown: ComponentShutdown,
  ) -> anyhow::Result<()> {
    serve("metrics", self.make_metrics_router(), bind_resolver, bind, shutdown).await
  }
}

async fn serve(
  name: &str,
  router: Router,
  bind_resolver: Arc<dyn BindResolver>,
  bind: &str,
  mut shutdown: ComponentShutdown,
) -> anyhow::Result<()> {
  let socket = bind_resolver.resolve_tcp(bind).await?;
  info!("{name} server starting on: {}", socket.local_addr()?);
  axum::serve(socket.listen()?, router)
    .with_graceful_shutdown(async move { shutdown.cancelled().await })
    .await?;
  info!("{name} server terminated");
  Ok(())
}
