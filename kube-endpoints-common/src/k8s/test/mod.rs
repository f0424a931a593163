// kube-endpoints - health-checked service endpoints for Kubernetes
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use kube::api::ObjectMeta;
use kube::core::ErrorResponse;
use std::collections::BTreeMap;

#[must_use]
pub fn make_object_meta(
  namespace: &str,
  name: &str,
  labels: BTreeMap<String, String>,
  annotations: BTreeMap<String, String>,
) -> ObjectMeta {
  ObjectMeta {
    namespace: Some(namespace.to_string()),
    name: Some(name.to_string()),
    labels: Some(labels),
    annotations: Some(annotations),
    ..Default::default()
  }
}

/// Object metadata for a resource that has already been persisted, i.e. one that can own other
/// objects.
#[must_use]
pub fn make_persisted_meta(namespace: &str, name: &str, uid: &str) -> ObjectMeta {
  ObjectMeta {
    namespace: Some(namespace.to_string()),
    name: Some(name.to_string()),
    uid: Some(uid.to_string()),
    resource_version: Some("1".to_string()),
    ..Default::default()
  }
}

#[must_use]
pub fn make_api_error(code: u16, reason: &str, message: &str) -> kube::Error {
  kube::Error::Api(ErrorResponse {
    status: "Failure".to_string(),
    message: message.to_string(),
    reason: reason.to_string(),
    code,
  })
}
