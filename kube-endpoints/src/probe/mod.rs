// kube-endpoints - health-checked service endpoints for Kubernetes
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt


pub mod network;

use crate::crd::{HttpHeader, ServicePort, UriScheme};
use async_trait::async_trait;
use mockall::automock;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_TIMEOUT_SECONDS: u64 = 1;
const DEFAULT_SUCCESS_THRESHOLD: u32 = 1;
const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

//
// ProbeError
//

#[derive(thiserror::Error, Debug)]
pub enum ProbeError {
  #[error("missing probe handler")]
  MissingHandler,
  #[error("invalid probe target: {0}")]
  InvalidTarget(String),
  #[error("timed out after {0:?}")]
  Timeout(Duration),
  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),
  #[error("http client error: {0}")]
  HttpClient(#[from] hyper_util::client::legacy::Error),
  #[error("unhealthy http status: {0}")]
  HttpStatus(http::StatusCode),
  #[error("grpc transport error: {0}")]
  GrpcTransport(#[from] tonic::transport::Error),
  #[error("grpc health check failed: {0}")]
  GrpcStatus(#[from] tonic::Status),
  #[error("grpc service is not serving: {0}")]
  NotServing(&'static str),
  #[error("no response received")]
  NoResponse,
  #[error("probe task did not complete: {0}")]
  Aborted(String),
}

//
// ProbeType
//

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProbeType {
  Http,
  Tcp,
  Udp,
  Grpc,
}

impl ProbeType {
  #[must_use]
  pub const fn as_str(self) -> &'static str {
    match self {
      Self::Http => "http",
      Self::Tcp => "tcp",
      Self::Udp => "udp",
      Self::Grpc => "grpc",
    }
  }

  /// Metric/log label for an optional probe type. Ports without any enabled check report "none".
  #[must_use]
  pub fn label(probe_type: Option<Self>) -> &'static str {
    probe_type.map_or("none", Self::as_str)
  }
}

impl fmt::Display for ProbeType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

//
// ProbeCheck
//

/// The single health check that applies to a port.
#[derive(Clone, Debug, PartialEq)]
pub enum ProbeCheck {
  Http {
    scheme: UriScheme,
    path: String,
    headers: Vec<HttpHeader>,
  },
  Tcp,
  Udp {
    data: Vec<u8>,
  },
  Grpc {
    service: Option<String>,
  },
}

impl ProbeCheck {
  /// Picks the check for a port. If several are enabled the first one in the order HTTP, TCP,
  /// UDP, gRPC wins. Returns None if nothing is enabled.
  #[must_use]
  pub fn resolve(port: &ServicePort) -> Option<Self> {
    if let Some(http_get) = &port.http_get {
      return Some(Self::Http {
        scheme: http_get.scheme,
        path: http_get.path.clone(),
        headers: http_get.http_headers.clone(),
      });
    }
    if port.tcp_socket.as_ref().is_some_and(|tcp| tcp.enable) {
      return Some(Self::Tcp);
    }
    if let Some(udp) = port.udp_socket.as_ref().filter(|udp| udp.enable) {
      return Some(Self::Udp {
        data: udp.payload(),
      });
    }
    if let Some(grpc) = port.grpc.as_ref().filter(|grpc| grpc.enable) {
      return Some(Self::Grpc {
        service: grpc.service.clone(),
      });
    }
    None
  }

  #[must_use]
  pub const fn probe_type(&self) -> ProbeType {
    match self {
      Self::Http { .. } => ProbeType::Http,
      Self::Tcp => ProbeType::Tcp,
      Self::Udp { .. } => ProbeType::Udp,
      Self::Grpc { .. } => ProbeType::Grpc,
    }
  }
}

//
// Thresholds
//

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Thresholds {
  pub timeout: Duration,
  pub success_threshold: u32,
  pub failure_threshold: u32,
}

impl Thresholds {
  /// Declared thresholds with zero (or negative) values replaced by the defaults 1s/1/3.
  #[must_use]
  pub fn effective(port: &ServicePort) -> Self {
    let positive = |value: i32| u32::try_from(value).ok().filter(|v| *v > 0);
    Self {
      timeout: Duration::from_secs(
        positive(port.timeout_seconds).map_or(DEFAULT_TIMEOUT_SECONDS, u64::from),
      ),
      success_threshold: positive(port.success_threshold).unwrap_or(DEFAULT_SUCCESS_THRESHOLD),
      failure_threshold: positive(port.failure_threshold).unwrap_or(DEFAULT_FAILURE_THRESHOLD),
    }
  }
}

//
// ProbeDescriptor
//

#[derive(Clone, Debug, PartialEq)]
pub struct ProbeDescriptor {
  pub check: ProbeCheck,
  pub host: String,
  pub port: i32,
  pub thresholds: Thresholds,
}

impl ProbeDescriptor {
  #[must_use]
  pub fn target(&self) -> String {
    make_target(&self.host, self.port)
  }
}

#[must_use]
pub fn make_target(host: &str, port: i32) -> String {
  format!("{host}:{port}")
}

//
// Prober
//

#[derive(Debug)]
pub enum AttemptResult {
  Success,
  /// The host did not pass the check this time. Another attempt may succeed.
  Retryable(ProbeError),
  /// The check can never pass as declared, e.g. the target cannot be parsed.
  Terminal(ProbeError),
}

/// Executes a single health check attempt, bounded by the descriptor's timeout.
#[automock]
#[async_trait]
pub trait Prober: Send + Sync {
  async fn attempt(&self, descriptor: &ProbeDescriptor) -> AttemptResult;
}

//
// ProbeOutcome
//

#[derive(Debug)]
pub struct ProbeOutcome {
  pub port: String,
  pub target: String,
  pub probe_type: Option<ProbeType>,
  pub attempts: u32,
  pub error: Option<ProbeError>,
}

impl ProbeOutcome {
  #[must_use]
  pub const fn success(&self) -> bool {
    self.error.is_none()
  }
}

//
// ProbePolicy
//

/// Drives the retry loop for one (port, host) pair. Nothing is kept between evaluations, so every
/// reconciliation pass starts with a full retry budget.
pub struct ProbePolicy {
  prober: Arc<dyn Prober>,
  retry_budget: u32,
}

impl ProbePolicy {
  #[must_use]
  pub fn new(prober: Arc<dyn Prober>, retry_budget: u32) -> Self {
    Self {
      prober,
      retry_budget: retry_budget.max(1),
    }
  }

  #[must_use]
  pub fn descriptor(port: &ServicePort, host: &str) -> Option<ProbeDescriptor> {
    ProbeCheck::resolve(port).map(|check| ProbeDescriptor {
      check,
      host: host.to_string(),
      port: port.target_port,
      thresholds: Thresholds::effective(port),
    })
  }

  pub async fn evaluate(&self, port: &ServicePort, host: &str) -> ProbeOutcome {
    let target = make_target(host, port.target_port);
    let Some(descriptor) = Self::descriptor(port, host) else {
      log::debug!("port {} has no enabled health check, {target} is unhealthy", port.name);
      return ProbeOutcome {
        port: port.name.clone(),
        target,
        probe_type: None,
        attempts: 0,
        error: Some(ProbeError::MissingHandler),
      };
    };

    let probe_type = descriptor.check.probe_type();
    let mut attempts = 0;
    let mut error = None;
    while attempts < self.retry_budget {
      attempts += 1;
      match self.prober.attempt(&descriptor).await {
        AttemptResult::Success => {
          error = None;
          break;
        },
        AttemptResult::Retryable(e) => {
          log::debug!(
            "{probe_type} probe of {target} failed (attempt {attempts}/{}): {e}",
            self.retry_budget
          );
          error = Some(e);
        },
        AttemptResult::Terminal(e) => {
          log::debug!("{probe_type} probe of {target} failed permanently: {e}");
          error = Some(e);
          break;
        },
      }
    }

    ProbeOutcome {
      port: port.name.clone(),
      target,
      probe_type: Some(probe_type),
      attempts,
      error,
    }
  }
}
