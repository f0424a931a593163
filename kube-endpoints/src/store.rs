// kube-endpoints - health-checked service endpoints for Kubernetes
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./store_test.rs"]
mod store_test;

use async_trait::async_trait;
use backoff::ExponentialBackoffBuilder;
use backoff::backoff::Backoff;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Patch, PatchParams, PostParams};
use kube::{Api, Client, Resource};
use kube_endpoints_common::k8s::{
  OwnerReferenceError,
  is_conflict,
  is_not_found,
  make_namespace_and_name,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::future::Future;
use std::time::Duration;

//
// StoreError
//

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
  /// The write was based on a stale resource version, or a create raced with another writer.
  #[error("version conflict: {0}")]
  Conflict(String),
  #[error("not found: {0}")]
  NotFound(String),
  #[error("object is missing {0}")]
  InvalidObject(&'static str),
  #[error(transparent)]
  OwnerReference(#[from] OwnerReferenceError),
  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
  #[error("kubernetes API error: {0}")]
  Kube(kube::Error),
}

impl From<kube::Error> for StoreError {
  fn from(error: kube::Error) -> Self {
    if is_conflict(&error) {
      Self::Conflict(error.to_string())
    } else if is_not_found(&error) {
      Self::NotFound(error.to_string())
    } else {
      Self::Kube(error)
    }
  }
}

impl StoreError {
  #[must_use]
  pub const fn is_conflict(&self) -> bool {
    matches!(self, Self::Conflict(_))
  }
}

//
// ObjectApi
//

/// Namespaced object access. Writes carry the resource version of the object they were derived
/// from and fail with `StoreError::Conflict` when it is stale.
#[async_trait]
pub trait ObjectApi<K: Send + Sync>: Send + Sync {
  async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>, StoreError>;
  async fn create(&self, object: &K) -> Result<K, StoreError>;
  async fn replace(&self, object: &K) -> Result<K, StoreError>;
  /// Writes only the status of the object.
  async fn replace_status(&self, object: &K) -> Result<K, StoreError>;
}

fn object_location<K: Resource>(object: &K) -> Result<(&str, &str), StoreError> {
  let meta = object.meta();
  Ok((
    meta
      .namespace
      .as_deref()
      .ok_or(StoreError::InvalidObject("namespace"))?,
    meta.name.as_deref().ok_or(StoreError::InvalidObject("name"))?,
  ))
}

//
// KubeObjectApi
//

/// `ObjectApi` backed by the API server.
#[derive(Clone)]
pub struct KubeObjectApi {
  client: Client,
}

impl KubeObjectApi {
  #[must_use]
  pub const fn new(client: Client) -> Self {
    Self { client }
  }

  fn api<K>(&self, namespace: &str) -> Api<K>
  where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
  {
    Api::namespaced(self.client.clone(), namespace)
  }
}

#[async_trait]
impl<K> ObjectApi<K> for KubeObjectApi
where
  K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
    + Clone
    + Debug
    + DeserializeOwned
    + Serialize
    + Send
    + Sync
    + 'static,
{
  async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>, StoreError> {
    Ok(self.api::<K>(namespace).get_opt(name).await?)
  }

  async fn create(&self, object: &K) -> Result<K, StoreError> {
    let (namespace, _) = object_location(object)?;
    Ok(
      self
        .api::<K>(namespace)
        .create(&PostParams::default(), object)
        .await?,
    )
  }

  async fn replace(&self, object: &K) -> Result<K, StoreError> {
    let (namespace, name) = object_location(object)?;
    Ok(
      self
        .api::<K>(namespace)
        .replace(name, &PostParams::default(), object)
        .await?,
    )
  }

  async fn replace_status(&self, object: &K) -> Result<K, StoreError> {
    let (namespace, name) = object_location(object)?;
    let mut value = serde_json::to_value(object)?;
    let status = value
      .get_mut("status")
      .map(serde_json::Value::take)
      .unwrap_or_default();
    // The resource version turns the merge patch into a conditional write.
    let patch = serde_json::json!({
      "metadata": { "resourceVersion": object.meta().resource_version },
      "status": status,
    });
    Ok(
      self
        .api::<K>(namespace)
        .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?,
    )
  }
}

//
// ConflictRetryPolicy
//

/// Bounded retry for optimistic-concurrency conflicts. The defaults match the Kubernetes client
/// default retry: 5 steps starting at 10ms, factor 1.0, jitter 0.1.
#[derive(Clone, Debug, PartialEq, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConflictRetryPolicy {
  pub steps: u32,
  #[serde(with = "humantime_serde")]
  pub interval: Duration,
  pub factor: f64,
  pub jitter: f64,
}

impl Default for ConflictRetryPolicy {
  fn default() -> Self {
    Self {
      steps: 5,
      interval: Duration::from_millis(10),
      factor: 1.0,
      jitter: 0.1,
    }
  }
}

impl ConflictRetryPolicy {
  fn backoff(&self) -> impl Backoff {
    ExponentialBackoffBuilder::new()
      .with_initial_interval(self.interval)
      .with_multiplier(self.factor)
      .with_randomization_factor(self.jitter)
      .with_max_elapsed_time(None)
      .build()
  }
}

/// Runs `operation` until it succeeds, fails with anything other than a conflict, or the policy's
/// steps are used up. In the last case the final conflict is returned. The operation has to
/// re-read whatever it writes, since each attempt starts from scratch.
pub async fn retry_on_conflict<T, F, Fut>(
  policy: &ConflictRetryPolicy,
  mut operation: F,
) -> Result<T, StoreError>
where
  F: FnMut() -> Fut,
  Fut: Future<Output = Result<T, StoreError>>,
{
  let steps = policy.steps.max(1);
  let mut attempt = 0;
  backoff::future::retry(policy.backoff(), || {
    attempt += 1;
    let attempt = attempt;
    let result = operation();
    async move {
      match result.await {
        Ok(value) => Ok(value),
        Err(e) if e.is_conflict() && attempt < steps => {
          log::debug!("conflict on attempt {attempt}/{steps}, retrying: {e}");
          Err(backoff::Error::transient(e))
        },
        Err(e) => Err(backoff::Error::permanent(e)),
      }
    }
  })
  .await
}

//
// create_or_update
//

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperationResult {
  Created,
  Updated,
  Unchanged,
}

/// Fetches `namespace/name` (or starts from an empty object when it does not exist yet), applies
/// `mutate` and writes the result back if anything changed. Conflicts restart the whole sequence
/// per `policy`.
pub async fn create_or_update<K, F>(
  api: &dyn ObjectApi<K>,
  namespace: &str,
  name: &str,
  policy: &ConflictRetryPolicy,
  mutate: F,
) -> Result<OperationResult, StoreError>
where
  K: Resource<DynamicType = ()> + Clone + Default + PartialEq + Send + Sync,
  F: Fn(&mut K) -> Result<(), StoreError> + Sync,
{
  let mutate = &mutate;
  let result = retry_on_conflict(policy, || async move {
    match api.get(namespace, name).await? {
      None => {
        let mut object = K::default();
        object.meta_mut().namespace = Some(namespace.to_string());
        object.meta_mut().name = Some(name.to_string());
        mutate(&mut object)?;
        api.create(&object).await?;
        Ok(OperationResult::Created)
      },
      Some(existing) => {
        let mut object = existing.clone();
        mutate(&mut object)?;
        if object == existing {
          return Ok(OperationResult::Unchanged);
        }
        api.replace(&object).await?;
        Ok(OperationResult::Updated)
      },
    }
  })
  .await?;

  log::debug!(
    "{} {}: {result:?}",
    K::kind(&()),
    make_namespace_and_name(namespace, name)
  );
  Ok(result)
}
