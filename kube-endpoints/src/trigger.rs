// kube-endpoints - health-checked service endpoints for Kubernetes
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./trigger_test.rs"]
mod trigger_test;

use crate::crd::ClusterEndpoint;
use futures::{Stream, StreamExt};
use kube::runtime::watcher;
use kube_endpoints_common::k8s::ObjectKey;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

// The parts of a ClusterEndpoint a pass depends on. Status writes leave all of them untouched.
#[derive(Debug, PartialEq, Eq)]
struct Fingerprint {
  uid: Option<String>,
  generation: Option<i64>,
  deleting: bool,
  labels: Option<BTreeMap<String, String>>,
  annotations: Option<BTreeMap<String, String>>,
}

impl Fingerprint {
  fn new(cep: &ClusterEndpoint) -> Self {
    Self {
      uid: cep.metadata.uid.clone(),
      generation: cep.metadata.generation,
      deleting: cep.metadata.deletion_timestamp.is_some(),
      labels: cep.metadata.labels.clone(),
      annotations: cep.metadata.annotations.clone(),
    }
  }
}

//
// TriggerFilter
//

/// Decides which ClusterEndpoint watch events start a pass. Events that only carry a status
/// change are dropped so the controller does not re-trigger itself on its own condition writes.
/// Periodic passes come from the controller's requeue schedule instead.
#[derive(Default)]
pub struct TriggerFilter {
  seen: Mutex<HashMap<ObjectKey, Fingerprint>>,
}

impl TriggerFilter {
  /// Records the object and returns whether it differs from the last version seen.
  pub fn observe(&self, cep: &ClusterEndpoint) -> bool {
    let fingerprint = Fingerprint::new(cep);
    let mut seen = self.seen.lock();
    let key = ObjectKey::from_meta(&cep.metadata);
    if seen.get(&key) == Some(&fingerprint) {
      log::trace!("{key}: no spec or metadata change, ignoring event");
      return false;
    }
    seen.insert(key, fingerprint);
    true
  }

  pub fn forget(&self, cep: &ClusterEndpoint) {
    self.seen.lock().remove(&ObjectKey::from_meta(&cep.metadata));
  }

  /// Turns a reflected watch stream into the controller's trigger stream.
  pub fn filter_events<S>(
    self: Arc<Self>,
    events: S,
  ) -> impl Stream<Item = Result<ClusterEndpoint, watcher::Error>> + Send + 'static
  where
    S: Stream<Item = Result<watcher::Event<ClusterEndpoint>, watcher::Error>> + Send + 'static,
  {
    events.filter_map(move |event| {
      let filter = self.clone();
      async move {
        match event {
          Ok(watcher::Event::Apply(cep) | watcher::Event::InitApply(cep)) => {
            filter.observe(&cep).then_some(Ok(cep))
          },
          Ok(watcher::Event::Delete(cep)) => {
            filter.forget(&cep);
            None
          },
          Ok(watcher::Event::Init | watcher::Event::InitDone) => None,
          Err(e) => Some(Err(e)),
        }
      }
    })
  }
}
