// kube-endpoints - health-checked service endpoints for Kubernetes
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./sync_test.rs"]
mod sync_test;

use crate::crd::{CLUSTER_IP_NONE, ClusterEndpoint, ServicePort};
use crate::store::{ConflictRetryPolicy, ObjectApi, OperationResult, StoreError, create_or_update};
use k8s_openapi::api::core::v1::{EndpointSubset, Endpoints, Service};
use kube::ResourceExt;
use kube_endpoints_common::k8s::{object_namespace, set_controller_reference};
use std::sync::Arc;

const SERVICE_TYPE_CLUSTER_IP: &str = "ClusterIP";
const SESSION_AFFINITY_NONE: &str = "None";

// Ports sharing a target port are told apart by name.
fn subset_key(subset: &EndpointSubset) -> (Option<&str>, Option<i32>, Option<&str>) {
  let port = subset.ports.as_ref().and_then(|ports| ports.first());
  (
    subset
      .addresses
      .as_ref()
      .and_then(|addresses| addresses.first())
      .map(|address| address.ip.as_str()),
    port.map(|port| port.port),
    port.and_then(|port| port.name.as_deref()),
  )
}

//
// ObjectSynchronizer
//

/// Writes the Service and Endpoints objects derived from a ClusterEndpoint. Both are named after
/// the ClusterEndpoint and controlled by it.
pub struct ObjectSynchronizer {
  services: Arc<dyn ObjectApi<Service>>,
  endpoints: Arc<dyn ObjectApi<Endpoints>>,
  retry_policy: ConflictRetryPolicy,
}

impl ObjectSynchronizer {
  #[must_use]
  pub fn new(
    services: Arc<dyn ObjectApi<Service>>,
    endpoints: Arc<dyn ObjectApi<Endpoints>>,
    retry_policy: ConflictRetryPolicy,
  ) -> Self {
    Self {
      services,
      endpoints,
      retry_policy,
    }
  }

  pub async fn sync_service(&self, cep: &ClusterEndpoint) -> Result<OperationResult, StoreError> {
    let name = cep.name_any();
    create_or_update(
      self.services.as_ref(),
      object_namespace(&cep.metadata),
      &name,
      &self.retry_policy,
      |service: &mut Service| {
        service.metadata.labels.clone_from(&cep.metadata.labels);
        service
          .metadata
          .annotations
          .clone_from(&cep.metadata.annotations);
        set_controller_reference(cep, &mut service.metadata)?;

        let spec = service.spec.get_or_insert_with(Default::default);
        // Otherwise the cluster IP is left to the API server to allocate.
        if cep.is_headless() {
          spec.cluster_ip = Some(CLUSTER_IP_NONE.to_string());
        }
        spec.type_ = Some(SERVICE_TYPE_CLUSTER_IP.to_string());
        spec.session_affinity = Some(SESSION_AFFINITY_NONE.to_string());
        spec.ports = Some(
          cep
            .spec
            .ports
            .iter()
            .map(ServicePort::to_service_port)
            .collect(),
        );
        Ok(())
      },
    )
    .await
  }

  /// Publishes `subsets` as the Endpoints body. Subsets are sorted by address, port and port name
  /// so that the same healthy set always produces the same object.
  pub async fn sync_endpoints(
    &self,
    cep: &ClusterEndpoint,
    mut subsets: Vec<EndpointSubset>,
  ) -> Result<OperationResult, StoreError> {
    subsets.sort_by(|a, b| subset_key(a).cmp(&subset_key(b)));
    // The API server drops empty lists, so an empty topology is written as no subsets at all.
    let subsets = (!subsets.is_empty()).then_some(subsets);

    let name = cep.name_any();
    create_or_update(
      self.endpoints.as_ref(),
      object_namespace(&cep.metadata),
      &name,
      &self.retry_policy,
      |endpoints: &mut Endpoints| {
        // Labels are cleared rather than copied from the ClusterEndpoint.
        endpoints.metadata.labels = None;
        set_controller_reference(cep, &mut endpoints.metadata)?;
        endpoints.subsets.clone_from(&subsets);
        Ok(())
      },
    )
    .await
  }
}
