// kube-endpoints - health-checked service endpoints for Kubernetes
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./network_test.rs"]
mod network_test;

use super::{AttemptResult, ProbeCheck, ProbeDescriptor, ProbeError, Prober};
use crate::crd::{HttpHeader, UriScheme};
use async_trait::async_trait;
use bytes::Bytes;
use http::header::USER_AGENT;
use http::{Request, Uri};
use http_body_util::Empty;
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpStream, UdpSocket, lookup_host};
use tonic::transport::Endpoint;
use tonic_health::pb::HealthCheckRequest;
use tonic_health::pb::health_check_response::ServingStatus;
use tonic_health::pb::health_client::HealthClient;

const PROBE_USER_AGENT: &str = "kube-endpoints-probe/1.0";
const UDP_RECV_BUFFER: usize = 1024;

/// Formats host and port for use in a URI, bracketing IPv6 literals.
fn authority(host: &str, port: u16) -> String {
  if host.contains(':') && !host.starts_with('[') {
    format!("[{host}]:{port}")
  } else {
    format!("{host}:{port}")
  }
}

async fn with_timeout<T>(
  timeout: Duration,
  future: impl Future<Output = Result<T, ProbeError>>,
) -> Result<T, ProbeError> {
  tokio::time::timeout(timeout, future)
    .await
    .unwrap_or(Err(ProbeError::Timeout(timeout)))
}

//
// NetworkProber
//

/// Probes hosts over the network. Probes never reuse connections so that every attempt
/// exercises connection setup the way a kubelet probe does.
pub struct NetworkProber {
  http: Client<HttpsConnector<HttpConnector>, Empty<Bytes>>,
}

impl Default for NetworkProber {
  fn default() -> Self {
    Self::new()
  }
}

impl NetworkProber {
  #[must_use]
  pub fn new() -> Self {
    let mut connector = HttpConnector::new();
    connector.enforce_http(false);
    let https = HttpsConnectorBuilder::new()
      .with_webpki_roots()
      .https_or_http()
      .enable_http1()
      .wrap_connector(connector);

    Self {
      http: Client::builder(TokioExecutor::new())
        .pool_max_idle_per_host(0)
        .build(https),
    }
  }

  async fn http_attempt(
    &self,
    descriptor: &ProbeDescriptor,
    port: u16,
    scheme: UriScheme,
    path: &str,
    headers: &[HttpHeader],
  ) -> AttemptResult {
    let path = if path.starts_with('/') {
      path.to_string()
    } else {
      format!("/{path}")
    };
    let uri = match format!(
      "{}://{}{path}",
      scheme.as_str(),
      authority(&descriptor.host, port)
    )
    .parse::<Uri>()
    {
      Ok(uri) => uri,
      Err(e) => return AttemptResult::Terminal(ProbeError::InvalidTarget(e.to_string())),
    };

    let mut builder = Request::get(uri).header(USER_AGENT, PROBE_USER_AGENT);
    for header in headers {
      builder = builder.header(&header.name, &header.value);
    }
    let request = match builder.body(Empty::new()) {
      Ok(request) => request,
      Err(e) => return AttemptResult::Terminal(ProbeError::InvalidTarget(e.to_string())),
    };

    let result = with_timeout(descriptor.thresholds.timeout, async {
      Ok(self.http.request(request).await?.status())
    })
    .await;
    match result {
      // Same success range as a kubelet HTTP probe. Redirects are not followed.
      Ok(status) if (200 .. 400).contains(&status.as_u16()) => AttemptResult::Success,
      Ok(status) => AttemptResult::Retryable(ProbeError::HttpStatus(status)),
      Err(e) => AttemptResult::Retryable(e),
    }
  }

  async fn tcp_attempt(descriptor: &ProbeDescriptor, port: u16) -> AttemptResult {
    let result = with_timeout(descriptor.thresholds.timeout, async {
      TcpStream::connect((descriptor.host.as_str(), port)).await?;
      Ok(())
    })
    .await;
    match result {
      Ok(()) => AttemptResult::Success,
      Err(e) => AttemptResult::Retryable(e),
    }
  }

  async fn udp_attempt(descriptor: &ProbeDescriptor, port: u16, data: &[u8]) -> AttemptResult {
    let result = with_timeout(descriptor.thresholds.timeout, async {
      let addr = lookup_host((descriptor.host.as_str(), port))
        .await?
        .next()
        .ok_or_else(|| ProbeError::InvalidTarget(descriptor.target()))?;
      let local: SocketAddr = if addr.is_ipv4() {
        ([0, 0, 0, 0], 0).into()
      } else {
        ([0_u16; 8], 0).into()
      };
      let socket = UdpSocket::bind(local).await?;
      socket.connect(addr).await?;
      socket.send(data).await?;

      let mut buf = [0_u8; UDP_RECV_BUFFER];
      socket.recv(&mut buf).await?;
      Ok(())
    })
    .await;
    match result {
      Ok(()) => AttemptResult::Success,
      Err(e) => AttemptResult::Retryable(e),
    }
  }

  async fn grpc_attempt(
    descriptor: &ProbeDescriptor,
    port: u16,
    service: Option<&str>,
  ) -> AttemptResult {
    let timeout = descriptor.thresholds.timeout;
    let endpoint = Endpoint::from_shared(format!("http://{}", authority(&descriptor.host, port)))
      .map_err(|e| e.to_string())
      .and_then(|endpoint| {
        endpoint
          .user_agent(PROBE_USER_AGENT)
          .map_err(|e| e.to_string())
      });
    let endpoint = match endpoint {
      Ok(endpoint) => endpoint.connect_timeout(timeout).timeout(timeout),
      Err(e) => return AttemptResult::Terminal(ProbeError::InvalidTarget(e)),
    };
    let request = HealthCheckRequest {
      service: service.unwrap_or_default().to_string(),
    };

    let result = with_timeout(timeout, async {
      let channel = endpoint.connect().await?;
      let response = HealthClient::new(channel).check(request).await?;
      Ok(response.into_inner().status())
    })
    .await;
    match result {
      Ok(ServingStatus::Serving) => AttemptResult::Success,
      Ok(status) => AttemptResult::Retryable(ProbeError::NotServing(status.as_str_name())),
      Err(e) => AttemptResult::Retryable(e),
    }
  }
}

#[async_trait]
impl Prober for NetworkProber {
  async fn attempt(&self, descriptor: &ProbeDescriptor) -> AttemptResult {
    let Ok(port) = u16::try_from(descriptor.port) else {
      return AttemptResult::Terminal(ProbeError::InvalidTarget(descriptor.target()));
    };

    match &descriptor.check {
      ProbeCheck::Http {
        scheme,
        path,
        headers,
      } => {
        self
          .http_attempt(descriptor, port, *scheme, path, headers)
          .await
      },
      ProbeCheck::Tcp => Self::tcp_attempt(descriptor, port).await,
      ProbeCheck::Udp { data } => Self::udp_attempt(descriptor, port, data).await,
      ProbeCheck::Grpc { service } => {
        Self::grpc_attempt(descriptor, port, service.as_deref()).await
      },
    }
  }
}
