// kube-endpoints - health-checked service endpoints for Kubernetes
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use crate::crd::{
  ClusterEndpoint,
  ClusterEndpointSpec,
  HttpGetAction,
  ServicePort,
  TcpSocketAction,
};
use crate::store::{ObjectApi, StoreError};
use async_trait::async_trait;
use kube::Resource;
use kube_endpoints_common::k8s::ObjectKey;
use kube_endpoints_common::k8s::test::{make_api_error, make_persisted_meta};
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::{BTreeMap, HashMap};

//
// FakeObjectApi
//

struct FakeState<K> {
  objects: HashMap<ObjectKey, K>,
  next_version: u64,
  conflicts: usize,
  failures: usize,
  gets: usize,
  creates: usize,
  replaces: usize,
  status_writes: usize,
}

/// In-memory object store with resource version checking. Every accepted write bumps the
/// object's resource version. Conflicts and hard failures can be injected for the next N writes.
pub struct FakeObjectApi<K> {
  state: Mutex<FakeState<K>>,
}

impl<K> Default for FakeObjectApi<K> {
  fn default() -> Self {
    Self {
      state: Mutex::new(FakeState {
        objects: HashMap::new(),
        next_version: 1,
        conflicts: 0,
        failures: 0,
        gets: 0,
        creates: 0,
        replaces: 0,
        status_writes: 0,
      }),
    }
  }
}

impl<K: Resource + Clone + Serialize + DeserializeOwned> FakeObjectApi<K> {
  /// Stores `object` as if it had been created by someone else.
  pub fn insert(&self, mut object: K) -> K {
    let mut state = self.state.lock();
    Self::bump(&mut state, &mut object);
    state
      .objects
      .insert(ObjectKey::from_meta(object.meta()), object.clone());
    object
  }

  pub fn object(&self, namespace: &str, name: &str) -> Option<K> {
    self.state.lock().objects.get(&make_key(namespace, name)).cloned()
  }

  pub fn remove(&self, namespace: &str, name: &str) {
    self.state.lock().objects.remove(&make_key(namespace, name));
  }

  /// Simulates an unrelated write by another client, making any copy read so far stale.
  pub fn touch(&self, namespace: &str, name: &str) {
    let mut state = self.state.lock();
    let Some(mut object) = state.objects.get(&make_key(namespace, name)).cloned() else {
      return;
    };
    Self::bump(&mut state, &mut object);
    state.objects.insert(make_key(namespace, name), object);
  }

  pub fn inject_conflicts(&self, count: usize) {
    self.state.lock().conflicts = count;
  }

  pub fn inject_failures(&self, count: usize) {
    self.state.lock().failures = count;
  }

  pub fn gets(&self) -> usize {
    self.state.lock().gets
  }

  pub fn creates(&self) -> usize {
    self.state.lock().creates
  }

  pub fn replaces(&self) -> usize {
    self.state.lock().replaces
  }

  pub fn status_writes(&self) -> usize {
    self.state.lock().status_writes
  }

  fn bump(state: &mut FakeState<K>, object: &mut K) {
    object.meta_mut().resource_version = Some(state.next_version.to_string());
    state.next_version += 1;
  }

  fn check_injected(state: &mut FakeState<K>) -> Result<(), StoreError> {
    if state.failures > 0 {
      state.failures -= 1;
      return Err(make_api_error(500, "InternalError", "injected failure").into());
    }
    if state.conflicts > 0 {
      state.conflicts -= 1;
      return Err(make_api_error(409, "Conflict", "injected conflict").into());
    }
    Ok(())
  }

  fn check_version(state: &FakeState<K>, key: &ObjectKey, object: &K) -> Result<K, StoreError> {
    let stored = state
      .objects
      .get(key)
      .ok_or_else(|| StoreError::from(make_api_error(404, "NotFound", &key.to_string())))?;
    if stored.meta().resource_version != object.meta().resource_version {
      return Err(make_api_error(409, "Conflict", "the object has been modified").into());
    }
    Ok(stored.clone())
  }

  // Copies the status field of `from` into `into`, the way the API server splits spec and status
  // writes for resources with a status subresource.
  fn with_status(into: &K, from: &K) -> Result<K, StoreError> {
    let mut value = serde_json::to_value(into)?;
    let status = serde_json::to_value(from)?
      .get_mut("status")
      .map(serde_json::Value::take);
    if let (Some(object), Some(status)) = (value.as_object_mut(), status) {
      object.insert("status".to_string(), status);
    }
    Ok(serde_json::from_value(value)?)
  }
}

fn make_key(namespace: &str, name: &str) -> ObjectKey {
  ObjectKey {
    namespace: namespace.to_string(),
    name: name.to_string(),
  }
}

#[async_trait]
impl<K> ObjectApi<K> for FakeObjectApi<K>
where
  K: Resource + Clone + Serialize + DeserializeOwned + Send + Sync,
{
  async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>, StoreError> {
    let mut state = self.state.lock();
    state.gets += 1;
    Ok(state.objects.get(&make_key(namespace, name)).cloned())
  }

  async fn create(&self, object: &K) -> Result<K, StoreError> {
    let mut state = self.state.lock();
    Self::check_injected(&mut state)?;
    let key = ObjectKey::from_meta(object.meta());
    if state.objects.contains_key(&key) {
      return Err(make_api_error(409, "AlreadyExists", &key.to_string()).into());
    }

    let mut object = object.clone();
    object.meta_mut().uid = Some(format!("uid-{}", state.next_version));
    Self::bump(&mut state, &mut object);
    state.creates += 1;
    state.objects.insert(key, object.clone());
    Ok(object)
  }

  async fn replace(&self, object: &K) -> Result<K, StoreError> {
    let mut state = self.state.lock();
    Self::check_injected(&mut state)?;
    let key = ObjectKey::from_meta(object.meta());
    let stored = Self::check_version(&state, &key, object)?;

    let mut object = Self::with_status(object, &stored)?;
    Self::bump(&mut state, &mut object);
    state.replaces += 1;
    state.objects.insert(key, object.clone());
    Ok(object)
  }

  async fn replace_status(&self, object: &K) -> Result<K, StoreError> {
    let mut state = self.state.lock();
    Self::check_injected(&mut state)?;
    let key = ObjectKey::from_meta(object.meta());
    let stored = Self::check_version(&state, &key, object)?;

    let mut object = Self::with_status(&stored, object)?;
    Self::bump(&mut state, &mut object);
    state.status_writes += 1;
    state.objects.insert(key, object.clone());
    Ok(object)
  }
}

//
// ClusterEndpoint builders
//

pub fn make_cluster_endpoint(
  namespace: &str,
  name: &str,
  ports: Vec<ServicePort>,
) -> ClusterEndpoint {
  let mut cep = ClusterEndpoint::new(
    name,
    ClusterEndpointSpec {
      ports,
      ..Default::default()
    },
  );
  cep.metadata = make_persisted_meta(namespace, name, &format!("{name}-uid"));
  cep.metadata.labels = Some(BTreeMap::from([("app".to_string(), name.to_string())]));
  cep.metadata.annotations = Some(BTreeMap::from([(
    "sealos.io/owner".to_string(),
    "platform".to_string(),
  )]));
  cep
}

pub fn make_http_port(name: &str, target_port: i32, hosts: &[&str], path: &str) -> ServicePort {
  ServicePort {
    name: name.to_string(),
    protocol: "TCP".to_string(),
    port: target_port,
    target_port,
    hosts: hosts.iter().map(ToString::to_string).collect(),
    http_get: Some(HttpGetAction {
      path: path.to_string(),
      ..Default::default()
    }),
    ..Default::default()
  }
}

pub fn make_tcp_port(name: &str, target_port: i32, hosts: &[&str]) -> ServicePort {
  ServicePort {
    name: name.to_string(),
    protocol: "TCP".to_string(),
    port: target_port,
    target_port,
    hosts: hosts.iter().map(ToString::to_string).collect(),
    tcp_socket: Some(TcpSocketAction { enable: true }),
    ..Default::default()
  }
}
