// kube-endpoints - health-checked service endpoints for Kubernetes
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./crd_test.rs"]
mod crd_test;

use k8s_openapi::api::core::v1::{
  EndpointAddress,
  EndpointPort,
  EndpointSubset,
  ServicePort as CoreServicePort,
};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

pub const CLUSTER_IP_NONE: &str = "None";
const DEFAULT_PROTOCOL: &str = "TCP";

fn default_protocol() -> String {
  DEFAULT_PROTOCOL.to_string()
}

fn default_http_path() -> String {
  "/".to_string()
}

//
// ClusterEndpointSpec
//

/// Declares a logical service whose endpoints are a set of hosts outside the pod network. Only the
/// hosts that pass their health check are published in the generated Endpoints object.
#[derive(CustomResource, Clone, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
  group = "sealos.io",
  version = "v1beta1",
  kind = "ClusterEndpoint",
  plural = "clusterendpoints",
  shortname = "cep",
  namespaced,
  status = "ClusterEndpointStatus",
  derive = "PartialEq",
  printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterEndpointSpec {
  /// Set to "None" to request a headless service.
  #[serde(default, rename = "clusterIP", skip_serializing_if = "Option::is_none")]
  pub cluster_ip: Option<String>,
  #[serde(default)]
  pub ports: Vec<ServicePort>,
  /// How often the hosts are re-probed while the resource is otherwise unchanged.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub period_seconds: Option<i32>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterEndpointStatus {
  #[serde(default)]
  pub conditions: Vec<Condition>,
}

impl ClusterEndpoint {
  #[must_use]
  pub fn condition(&self, type_: ConditionType) -> Option<&Condition> {
    self
      .status
      .as_ref()
      .and_then(|status| status.conditions.iter().find(|c| c.type_ == type_))
  }

  #[must_use]
  pub fn is_condition_true(&self, type_: ConditionType) -> bool {
    self
      .condition(type_)
      .is_some_and(|c| c.status == ConditionStatus::True)
  }

  #[must_use]
  pub fn is_headless(&self) -> bool {
    self.spec.cluster_ip.as_deref() == Some(CLUSTER_IP_NONE)
  }

  /// The re-probe period, falling back to `default` when unset or not positive.
  #[must_use]
  pub fn period(&self, default: Duration) -> Duration {
    match self.spec.period_seconds {
      Some(seconds) if seconds > 0 => Duration::from_secs(seconds.unsigned_abs().into()),
      _ => default,
    }
  }
}

//
// ServicePort
//

#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServicePort {
  pub name: String,
  #[serde(default = "default_protocol")]
  pub protocol: String,
  /// Port exposed by the generated Service.
  pub port: i32,
  /// Port the hosts listen on. Health checks and published endpoints use this port.
  pub target_port: i32,
  #[serde(default)]
  pub hosts: Vec<String>,

  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub http_get: Option<HttpGetAction>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub tcp_socket: Option<TcpSocketAction>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub udp_socket: Option<UdpSocketAction>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub grpc: Option<GrpcAction>,

  #[serde(default)]
  pub timeout_seconds: i32,
  #[serde(default)]
  pub success_threshold: i32,
  #[serde(default)]
  pub failure_threshold: i32,
}

impl ServicePort {
  /// Declared hosts with duplicates removed, in declaration order.
  pub fn unique_hosts(&self) -> impl Iterator<Item = &str> {
    let mut seen = HashSet::new();
    self
      .hosts
      .iter()
      .map(String::as_str)
      .filter(move |host| seen.insert(*host))
  }

  #[must_use]
  pub fn to_service_port(&self) -> CoreServicePort {
    CoreServicePort {
      name: Some(self.name.clone()),
      protocol: Some(self.protocol.clone()),
      port: self.port,
      target_port: Some(IntOrString::Int(self.target_port)),
      ..Default::default()
    }
  }

  #[must_use]
  pub fn to_endpoint_subset(&self, host: &str) -> EndpointSubset {
    EndpointSubset {
      addresses: Some(vec![EndpointAddress {
        ip: host.to_string(),
        ..Default::default()
      }]),
      ports: Some(vec![EndpointPort {
        name: Some(self.name.clone()),
        port: self.target_port,
        protocol: Some(self.protocol.clone()),
        ..Default::default()
      }]),
      ..Default::default()
    }
  }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum UriScheme {
  #[default]
  #[serde(rename = "HTTP")]
  Http,
  #[serde(rename = "HTTPS")]
  Https,
}

impl UriScheme {
  #[must_use]
  pub const fn as_str(self) -> &'static str {
    match self {
      Self::Http => "http",
      Self::Https => "https",
    }
  }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HttpHeader {
  pub name: String,
  pub value: String,
}

/// Enabled by presence.
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HttpGetAction {
  #[serde(default = "default_http_path")]
  pub path: String,
  #[serde(default)]
  pub scheme: UriScheme,
  #[serde(default)]
  pub http_headers: Vec<HttpHeader>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TcpSocketAction {
  #[serde(default)]
  pub enable: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UdpSocketAction {
  #[serde(default)]
  pub enable: bool,
  /// Payload sent to the host. Kept as signed bytes for compatibility with existing manifests.
  #[serde(default)]
  pub data: Vec<i8>,
}

impl UdpSocketAction {
  #[must_use]
  pub fn payload(&self) -> Vec<u8> {
    self.data.iter().map(|b| b.to_ne_bytes()[0]).collect()
  }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GrpcAction {
  #[serde(default)]
  pub enable: bool,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub service: Option<String>,
}

//
// Condition
//

#[derive(Clone, Copy, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum ConditionType {
  SyncServiceReady,
  SyncEndpointReady,
}

impl ConditionType {
  #[must_use]
  pub const fn as_str(self) -> &'static str {
    match self {
      Self::SyncServiceReady => "SyncServiceReady",
      Self::SyncEndpointReady => "SyncEndpointReady",
    }
  }
}

impl fmt::Display for ConditionType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
  True,
  False,
  #[default]
  Unknown,
}

#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
  #[serde(rename = "type")]
  pub type_: ConditionType,
  pub status: ConditionStatus,
  #[serde(default)]
  pub reason: String,
  #[serde(default)]
  pub message: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub last_heartbeat_time: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub last_transition_time: Option<String>,
}

impl Condition {
  /// A healthy condition. The reason is the condition type itself.
  #[must_use]
  pub fn ready(type_: ConditionType, message: &str) -> Self {
    Self {
      type_,
      status: ConditionStatus::True,
      reason: type_.as_str().to_string(),
      message: message.to_string(),
      last_heartbeat_time: None,
      last_transition_time: None,
    }
  }

  #[must_use]
  pub fn failed(type_: ConditionType, reason: &str, message: String) -> Self {
    Self {
      type_,
      status: ConditionStatus::False,
      reason: reason.to_string(),
      message,
      last_heartbeat_time: None,
      last_transition_time: None,
    }
  }

  #[must_use]
  pub fn is_true(&self) -> bool {
    self.status == ConditionStatus::True
  }
}
