// kube-endpoints - health-checked service endpoints for Kubernetes
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use anyhow::Context;
use clap::Parser;
use kube::CustomResourceExt;
use kube_endpoints::config::{self, Config};
use kube_endpoints::crd::ClusterEndpoint;
use kube_endpoints::run_server;
use kube_endpoints_common::bind_resolver::RealBindResolver;
use kube_endpoints_common::global_initialize;
use log::info;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tokio::select;
use tokio::signal::unix::{SignalKind, signal};

#[derive(Parser, Debug, Clone)]
struct Options {
  /// Optional YAML configuration file. Every setting has a default.
  #[arg(short = 'c', long = "config", env = "KUBE_ENDPOINTS_CONFIG")]
  pub config: Option<String>,

  /// Overrides `max_concurrent_reconciles`.
  #[arg(long = "max-concurrent")]
  pub max_concurrent: Option<i32>,

  /// Overrides `max_retry`, the probe attempts per host and pass.
  #[arg(long = "max-retry")]
  pub max_retry: Option<i32>,

  #[arg(long = "config-check-and-exit")]
  pub config_check: bool,

  /// Prints the ClusterEndpoint CustomResourceDefinition as YAML and exits.
  #[arg(long = "print-crd")]
  pub print_crd: bool,
}

fn load_config(opts: &Options) -> anyhow::Result<Config> {
  let mut config = match &opts.config {
    Some(path) => {
      let config = config::load_from_file(path)
        .with_context(|| format!("can't load config file from {path}"))?;
      info!("loaded config file {path}");
      config
    },
    None => Config::default(),
  };
  if let Some(max_concurrent) = opts.max_concurrent {
    config.max_concurrent_reconciles = max_concurrent;
  }
  if let Some(max_retry) = opts.max_retry {
    config.max_retry = max_retry;
  }
  info!(
    "max concurrent reconciles: {}, max retry: {}",
    config.concurrency(),
    config.retry_budget()
  );
  Ok(config)
}

fn main() -> anyhow::Result<()> {
  global_initialize();
  let opts = Options::parse();
  if opts.print_crd {
    print!("{}", serde_yaml::to_string(&ClusterEndpoint::crd())?);
    return Ok(());
  }
  let config = load_config(&opts)?;

  let num_threads = std::thread::available_parallelism().unwrap_or_else(|_| {
    log::warn!("could not determine number of CPUs. Defaulting to 1");
    NonZeroUsize::MIN
  });
  log::info!("running server with {num_threads} workers");
  let runtime = tokio::runtime::Builder::new_multi_thread()
    .worker_threads(num_threads.into())
    .enable_all()
    .build()?;

  runtime.block_on(async {
    run_server(
      config,
      opts.config_check,
      || async {
        // Trap ctrl+c and sigterm messages and perform a clean shutdown
        let (Ok(mut sigint), Ok(mut sigterm)) = (
          signal(SignalKind::interrupt()),
          signal(SignalKind::terminate()),
        ) else {
          log::error!("could not install signal handlers, shutting down");
          return;
        };
        select! {
          _ = sigint.recv() => info!("received sigint"),
          _ = sigterm.recv() => info!("received sigterm"),
        }
      },
      Arc::new(RealBindResolver {}),
    )
    .await
  })
}
