// kube-endpoints - health-checked service endpoints for Kubernetes
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::*;
use crate::crd::{ClusterEndpointStatus, ConditionStatus, ConditionType};
use crate::test::{FakeObjectApi, make_cluster_endpoint, make_tcp_port};
use crate::time::TestTimeProvider;
use pretty_assertions::assert_eq;

const T0: &str = "1970-01-01T00:00:00Z";
const T10: &str = "1970-01-01T00:00:10Z";
const T20: &str = "1970-01-01T00:00:20Z";

struct Helper {
  api: Arc<FakeObjectApi<ClusterEndpoint>>,
  time_provider: Arc<TestTimeProvider>,
  tracker: ConditionTracker,
  cep: ClusterEndpoint,
}

impl Helper {
  fn new(status: Option<ClusterEndpointStatus>) -> Self {
    let api = Arc::new(FakeObjectApi::default());
    let time_provider = Arc::new(TestTimeProvider::default());
    let tracker = ConditionTracker::new(
      api.clone(),
      time_provider.clone(),
      ConflictRetryPolicy::default(),
    );
    let mut cep = make_cluster_endpoint("default", "demo", vec![make_tcp_port("db", 5432, &[])]);
    cep.status = status;
    let cep = api.insert(cep);
    Self {
      api,
      time_provider,
      tracker,
      cep,
    }
  }

  fn stored(&self) -> ClusterEndpoint {
    self.api.object("default", "demo").unwrap()
  }

  async fn update(&mut self, condition: Condition) -> bool {
    self
      .tracker
      .update_condition(&mut self.cep, condition)
      .await
      .unwrap()
  }
}

fn service_ready() -> Condition {
  Condition::ready(ConditionType::SyncServiceReady, "sync service successfully")
}

fn service_failed(message: &str) -> Condition {
  Condition::failed(
    ConditionType::SyncServiceReady,
    "ServiceSyncError",
    message.to_string(),
  )
}

#[tokio::test(start_paused = true)]
async fn repeated_true_is_written_once() {
  let mut helper = Helper::new(None);

  assert!(helper.update(service_ready()).await);
  helper.time_provider.advance(10);
  assert!(!helper.update(service_ready()).await);
  assert_eq!(1, helper.api.status_writes());

  let stored = helper.stored();
  let condition = stored.condition(ConditionType::SyncServiceReady).unwrap();
  assert_eq!(ConditionStatus::True, condition.status);
  assert_eq!("SyncServiceReady", condition.reason);
  assert_eq!(Some(T0.to_string()), condition.last_heartbeat_time);
  assert_eq!(Some(T0.to_string()), condition.last_transition_time);

  // The in-memory copy still gets a fresh heartbeat.
  let in_memory = helper.cep.condition(ConditionType::SyncServiceReady).unwrap();
  assert_eq!(Some(T10.to_string()), in_memory.last_heartbeat_time);
}

#[tokio::test(start_paused = true)]
async fn true_over_persisted_true_is_suppressed() {
  let mut ready = service_ready();
  ready.last_transition_time = Some(T0.to_string());
  let mut helper = Helper::new(Some(ClusterEndpointStatus {
    conditions: vec![ready],
  }));

  assert!(!helper.update(service_ready()).await);
  assert!(!helper.update(service_ready()).await);
  assert_eq!(0, helper.api.status_writes());
}

#[tokio::test(start_paused = true)]
async fn false_is_always_written() {
  let mut helper = Helper::new(None);

  assert!(helper.update(service_failed("boom")).await);
  helper.time_provider.advance(10);
  assert!(helper.update(service_failed("boom again")).await);
  assert_eq!(2, helper.api.status_writes());

  let stored = helper.stored();
  let condition = stored.condition(ConditionType::SyncServiceReady).unwrap();
  assert_eq!(ConditionStatus::False, condition.status);
  assert_eq!("ServiceSyncError", condition.reason);
  assert_eq!("boom again", condition.message);
  assert_eq!(Some(T10.to_string()), condition.last_heartbeat_time);
  // Status did not change between the two writes.
  assert_eq!(Some(T0.to_string()), condition.last_transition_time);
}

#[tokio::test(start_paused = true)]
async fn transitions_move_transition_time() {
  let mut helper = Helper::new(None);

  helper.update(service_failed("boom")).await;
  helper.time_provider.advance(10);
  assert!(helper.update(service_ready()).await);
  helper.time_provider.advance(10);
  assert!(helper.update(service_failed("boom")).await);

  let stored = helper.stored();
  let condition = stored.condition(ConditionType::SyncServiceReady).unwrap();
  assert_eq!(Some(T20.to_string()), condition.last_transition_time);
  assert_eq!(3, helper.api.status_writes());
}

#[tokio::test(start_paused = true)]
async fn other_conditions_are_kept() {
  let mut helper = Helper::new(None);

  helper
    .update(Condition::ready(
      ConditionType::SyncEndpointReady,
      "sync endpoint successfully",
    ))
    .await;
  helper.update(service_failed("boom")).await;

  let stored = helper.stored();
  let conditions = &stored.status.as_ref().unwrap().conditions;
  assert_eq!(2, conditions.len());
  assert!(stored.is_condition_true(ConditionType::SyncEndpointReady));
  assert!(!stored.is_condition_true(ConditionType::SyncServiceReady));
}

#[tokio::test(start_paused = true)]
async fn stale_copy_and_conflicts() {
  let mut helper = Helper::new(None);

  // Someone else wrote the object after the reconciler read it.
  helper.api.touch("default", "demo");
  helper.api.inject_conflicts(2);
  assert!(helper.update(service_failed("boom")).await);
  assert_eq!(1, helper.api.status_writes());
  assert_eq!(helper.stored(), helper.cep);
}

#[tokio::test(start_paused = true)]
async fn spec_is_not_touched_by_status_writes() {
  let mut helper = Helper::new(None);
  helper.cep.spec.ports.clear();

  helper.update(service_failed("boom")).await;
  assert_eq!(1, helper.stored().spec.ports.len());
}

#[tokio::test(start_paused = true)]
async fn deleted_resource_is_not_persisted() {
  let mut helper = Helper::new(None);
  helper.api.remove("default", "demo");

  assert!(!helper.update(service_failed("boom")).await);
  assert_eq!(0, helper.api.status_writes());
}
