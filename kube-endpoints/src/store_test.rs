// kube-endpoints - health-checked service endpoints for Kubernetes
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::*;
use crate::test::FakeObjectApi;
use assert_matches::assert_matches;
use k8s_openapi::api::core::v1::ConfigMap;
use kube_endpoints_common::k8s::test::make_api_error;
use pretty_assertions::assert_eq;
use std::collections::BTreeMap;

fn set_data(value: &str) -> impl Fn(&mut ConfigMap) -> Result<(), StoreError> + Sync + '_ {
  move |config_map| {
    config_map.data = Some(BTreeMap::from([("key".to_string(), value.to_string())]));
    Ok(())
  }
}

#[test]
fn kube_error_classification() {
  assert_matches!(
    StoreError::from(make_api_error(409, "Conflict", "stale")),
    StoreError::Conflict(_)
  );
  assert_matches!(
    StoreError::from(make_api_error(404, "NotFound", "gone")),
    StoreError::NotFound(_)
  );
  assert_matches!(
    StoreError::from(make_api_error(500, "InternalError", "boom")),
    StoreError::Kube(_)
  );
}

#[tokio::test(start_paused = true)]
async fn retry_on_conflict_converges() {
  let mut attempts = 0;
  let result = retry_on_conflict(&ConflictRetryPolicy::default(), || {
    attempts += 1;
    let attempt = attempts;
    async move {
      if attempt < 4 {
        Err(StoreError::from(make_api_error(409, "Conflict", "stale")))
      } else {
        Ok(attempt)
      }
    }
  })
  .await;
  assert_eq!(4, result.unwrap());
  assert_eq!(4, attempts);
}

#[tokio::test(start_paused = true)]
async fn retry_on_conflict_exhaustion() {
  let mut attempts = 0;
  let result: Result<(), _> = retry_on_conflict(&ConflictRetryPolicy::default(), || {
    attempts += 1;
    async { Err(StoreError::Conflict("stale".to_string())) }
  })
  .await;
  assert_matches!(result, Err(StoreError::Conflict(_)));
  assert_eq!(5, attempts);
}

#[tokio::test(start_paused = true)]
async fn retry_on_conflict_aborts_on_other_errors() {
  let mut attempts = 0;
  let result: Result<(), _> = retry_on_conflict(&ConflictRetryPolicy::default(), || {
    attempts += 1;
    async { Err(StoreError::from(make_api_error(500, "InternalError", "boom"))) }
  })
  .await;
  assert_matches!(result, Err(StoreError::Kube(_)));
  assert_eq!(1, attempts);
}

#[tokio::test(start_paused = true)]
async fn create_update_unchanged() {
  let api = FakeObjectApi::<ConfigMap>::default();
  let policy = ConflictRetryPolicy::default();

  assert_eq!(
    OperationResult::Created,
    create_or_update(&api, "default", "demo", &policy, set_data("a"))
      .await
      .unwrap()
  );
  assert_eq!(
    OperationResult::Unchanged,
    create_or_update(&api, "default", "demo", &policy, set_data("a"))
      .await
      .unwrap()
  );
  assert_eq!(
    OperationResult::Updated,
    create_or_update(&api, "default", "demo", &policy, set_data("b"))
      .await
      .unwrap()
  );

  assert_eq!(1, api.creates());
  assert_eq!(1, api.replaces());
  let stored = api.object("default", "demo").unwrap();
  assert_eq!("b", stored.data.unwrap()["key"]);
  assert_eq!(Some("demo".to_string()), stored.metadata.name);
}

#[tokio::test(start_paused = true)]
async fn create_or_update_retries_conflicts() {
  let api = FakeObjectApi::<ConfigMap>::default();
  let policy = ConflictRetryPolicy::default();
  create_or_update(&api, "default", "demo", &policy, set_data("a"))
    .await
    .unwrap();

  api.inject_conflicts(2);
  assert_eq!(
    OperationResult::Updated,
    create_or_update(&api, "default", "demo", &policy, set_data("b"))
      .await
      .unwrap()
  );
  // One read for the create plus one per update attempt.
  assert_eq!(4, api.gets());
  assert_eq!("b", api.object("default", "demo").unwrap().data.unwrap()["key"]);
}

#[tokio::test(start_paused = true)]
async fn create_or_update_gives_up_after_policy_steps() {
  let api = FakeObjectApi::<ConfigMap>::default();
  let policy = ConflictRetryPolicy {
    steps: 2,
    ..Default::default()
  };

  api.inject_conflicts(2);
  assert_matches!(
    create_or_update(&api, "default", "demo", &policy, set_data("a")).await,
    Err(StoreError::Conflict(_))
  );
  assert_eq!(0, api.creates());
}

#[tokio::test(start_paused = true)]
async fn create_or_update_mutation_errors_are_not_retried() {
  let api = FakeObjectApi::<ConfigMap>::default();
  let result = create_or_update(
    &api,
    "default",
    "demo",
    &ConflictRetryPolicy::default(),
    |_: &mut ConfigMap| Err(StoreError::InvalidObject("uid")),
  )
  .await;
  assert_matches!(result, Err(StoreError::InvalidObject("uid")));
  assert_eq!(1, api.gets());
}
