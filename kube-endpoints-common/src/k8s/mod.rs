// kube-endpoints - health-checked service endpoints for Kubernetes
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt


pub mod test;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::Resource;
use kube::api::ObjectMeta;
use std::fmt;

const HTTP_CONFLICT: u16 = 409;
const HTTP_NOT_FOUND: u16 = 404;

/// Returns the namespace for the provided object.
#[must_use]
pub fn object_namespace(meta: &ObjectMeta) -> &str {
  meta.namespace.as_deref().unwrap_or("default")
}

#[must_use]
pub fn make_namespace_and_name(namespace: &str, name: &str) -> String {
  format!("{namespace}/{name}")
}

/// True if the API server rejected a write because the submitted resource version is stale, or
/// because a create raced with another writer.
#[must_use]
pub fn is_conflict(error: &kube::Error) -> bool {
  matches!(error, kube::Error::Api(response) if response.code == HTTP_CONFLICT)
}

#[must_use]
pub fn is_not_found(error: &kube::Error) -> bool {
  matches!(error, kube::Error::Api(response) if response.code == HTTP_NOT_FOUND)
}

//
// ObjectKey
//

/// Namespace + name of a namespaced object. Used for log lines and per-object bookkeeping.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ObjectKey {
  pub namespace: String,
  pub name: String,
}

impl ObjectKey {
  #[must_use]
  pub fn from_meta(meta: &ObjectMeta) -> Self {
    Self {
      namespace: object_namespace(meta).to_string(),
      name: meta.name.clone().unwrap_or_default(),
    }
  }
}

impl fmt::Display for ObjectKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}/{}", self.namespace, self.name)
  }
}

//
// OwnerReferenceError
//

#[derive(thiserror::Error, Debug)]
pub enum OwnerReferenceError {
  #[error("owner {0} has no name or uid yet")]
  MissingIdentity(String),
  #[error("object {object} is already controlled by {kind} {owner}")]
  AlreadyOwned {
    object: String,
    kind: String,
    owner: String,
  },
}

fn same_owner(a: &OwnerReference, b: &OwnerReference) -> bool {
  let group: fn(&str) -> &str = |api_version| api_version.split_once('/').map_or("", |(group, _)| group);
  group(&a.api_version) == group(&b.api_version) && a.kind == b.kind && a.name == b.name
}

/// Marks `owner` as the controller of the object described by `meta` so that deleting the owner
/// cascades. Fails if a different controller already owns the object. An existing reference to
/// the same owner is replaced in place.
pub fn set_controller_reference<K: Resource<DynamicType = ()>>(
  owner: &K,
  meta: &mut ObjectMeta,
) -> Result<(), OwnerReferenceError> {
  let owner_ref = owner.controller_owner_ref(&()).ok_or_else(|| {
    OwnerReferenceError::MissingIdentity(make_namespace_and_name(
      owner.meta().namespace.as_deref().unwrap_or_default(),
      owner.meta().name.as_deref().unwrap_or_default(),
    ))
  })?;

  let references = meta.owner_references.get_or_insert_with(Vec::new);
  if let Some(existing) = references
    .iter()
    .find(|r| r.controller == Some(true) && !same_owner(r, &owner_ref))
  {
    return Err(OwnerReferenceError::AlreadyOwned {
      object: meta.name.clone().unwrap_or_default(),
      kind: existing.kind.clone(),
      owner: existing.name.clone(),
    });
  }

  if let Some(existing) = references.iter_mut().find(|r| same_owner(r, &owner_ref)) {
    *existing = owner_ref;
  } else {
    references.push(owner_ref);
  }
  Ok(())
}
