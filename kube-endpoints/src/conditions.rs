// kube-endpoints - health-checked service endpoints for Kubernetes
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./conditions_test.rs"]
mod conditions_test;

use crate::crd::{ClusterEndpoint, Condition};
use crate::store::{ConflictRetryPolicy, ObjectApi, StoreError, retry_on_conflict};
use crate::time::TimeProvider;
use kube::ResourceExt;
use kube_endpoints_common::k8s::object_namespace;
use std::sync::Arc;

// Replaces the condition of the same type, keeping its transition time if the status did not
// change.
fn merge_condition(cep: &mut ClusterEndpoint, mut condition: Condition, now: &str) {
  let conditions = &mut cep.status.get_or_insert_with(Default::default).conditions;
  match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
    Some(existing) => {
      condition.last_transition_time = if existing.status == condition.status {
        existing
          .last_transition_time
          .clone()
          .or_else(|| Some(now.to_string()))
      } else {
        Some(now.to_string())
      };
      *existing = condition;
    },
    None => {
      condition.last_transition_time = Some(now.to_string());
      conditions.push(condition);
    },
  }
}

//
// ConditionTracker
//

/// Persists ClusterEndpoint status conditions. A true condition is never written over a persisted
/// true condition of the same type; everything else is written.
pub struct ConditionTracker {
  api: Arc<dyn ObjectApi<ClusterEndpoint>>,
  time_provider: Arc<dyn TimeProvider>,
  retry_policy: ConflictRetryPolicy,
}

impl ConditionTracker {
  #[must_use]
  pub fn new(
    api: Arc<dyn ObjectApi<ClusterEndpoint>>,
    time_provider: Arc<dyn TimeProvider>,
    retry_policy: ConflictRetryPolicy,
  ) -> Self {
    Self {
      api,
      time_provider,
      retry_policy,
    }
  }

  /// Returns true if the condition was written. On a write `cep` is replaced with the persisted
  /// object, otherwise only the heartbeat of its in-memory condition is refreshed. A resource that
  /// no longer exists is never written.
  pub async fn update_condition(
    &self,
    cep: &mut ClusterEndpoint,
    mut condition: Condition,
  ) -> Result<bool, StoreError> {
    let now = self.time_provider.now_rfc3339();
    condition.last_heartbeat_time = Some(now.clone());

    let namespace = object_namespace(&cep.metadata).to_string();
    let name = cep.name_any();
    let (namespace, name, now, condition) =
      (namespace.as_str(), name.as_str(), now.as_str(), &condition);
    let persisted = retry_on_conflict(&self.retry_policy, || async move {
      // The copy handed to the reconciler may be stale, so the decision is made against the
      // latest persisted object.
      let Some(mut latest) = self.api.get(namespace, name).await? else {
        return Ok(None);
      };
      if condition.is_true() && latest.is_condition_true(condition.type_) {
        return Ok(None);
      }

      merge_condition(&mut latest, condition.clone(), now);
      match self.api.replace_status(&latest).await {
        Ok(updated) => Ok(Some(updated)),
        Err(StoreError::NotFound(_)) => Ok(None),
        Err(e) => Err(e),
      }
    })
    .await?;

    if let Some(updated) = persisted {
      log::debug!(
        "{namespace}/{name}: {} is now {:?} ({})",
        condition.type_,
        condition.status,
        condition.reason
      );
      *cep = updated;
      return Ok(true);
    }

    if let Some(existing) = cep
      .status
      .as_mut()
      .and_then(|status| status.conditions.iter_mut().find(|c| c.type_ == condition.type_))
    {
      existing.last_heartbeat_time = Some(now.to_string());
    }
    Ok(false)
  }
}
