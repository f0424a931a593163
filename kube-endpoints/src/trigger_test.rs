// kube-endpoints - health-checked service endpoints for Kubernetes
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::*;
use crate::crd::{ClusterEndpointStatus, Condition, ConditionStatus, ConditionType};
use crate::test::{make_cluster_endpoint, make_tcp_port};
use pretty_assertions::assert_eq;

fn make_cep() -> ClusterEndpoint {
  let mut cep = make_cluster_endpoint("default", "demo", vec![make_tcp_port("db", 5432, &[])]);
  cep.metadata.generation = Some(1);
  cep
}

fn with_status_write(cep: &ClusterEndpoint, heartbeat: &str) -> ClusterEndpoint {
  let mut cep = cep.clone();
  cep.metadata.resource_version = Some(heartbeat.to_string());
  cep.status = Some(ClusterEndpointStatus {
    conditions: vec![Condition {
      type_: ConditionType::SyncEndpointReady,
      status: ConditionStatus::False,
      reason: "EndpointSyncPortError".to_string(),
      message: "1 unhealthy host".to_string(),
      last_heartbeat_time: Some(heartbeat.to_string()),
      last_transition_time: None,
    }],
  });
  cep
}

#[test]
fn status_writes_do_not_trigger() {
  let filter = TriggerFilter::default();
  let cep = make_cep();
  assert!(filter.observe(&cep));

  // Every failing pass rewrites the conditions with a fresh heartbeat.
  assert!(!filter.observe(&with_status_write(&cep, "2")));
  assert!(!filter.observe(&with_status_write(&cep, "3")));
}

#[test]
fn spec_and_metadata_changes_trigger() {
  let filter = TriggerFilter::default();
  let mut cep = make_cep();
  assert!(filter.observe(&cep));

  cep.metadata.generation = Some(2);
  assert!(filter.observe(&cep));
  assert!(!filter.observe(&cep));

  cep
    .metadata
    .labels
    .get_or_insert_default()
    .insert("tier".to_string(), "db".to_string());
  assert!(filter.observe(&cep));

  cep.metadata.annotations = None;
  assert!(filter.observe(&cep));

  cep.metadata.deletion_timestamp =
    Some(serde_json::from_value(serde_json::json!("2026-01-01T00:00:00Z")).unwrap());
  assert!(filter.observe(&cep));
}

#[test]
fn recreated_object_triggers() {
  let filter = TriggerFilter::default();
  let cep = make_cep();
  assert!(filter.observe(&cep));

  let mut recreated = cep.clone();
  recreated.metadata.uid = Some("demo-uid-2".to_string());
  assert!(filter.observe(&recreated));

  filter.forget(&recreated);
  assert!(filter.observe(&recreated));
}

#[tokio::test]
async fn filter_events() {
  let filter = Arc::new(TriggerFilter::default());
  let cep = make_cep();
  let mut other = make_cep();
  other.metadata.name = Some("other".to_string());

  let events = futures::stream::iter(vec![
    Ok(watcher::Event::Init),
    Ok(watcher::Event::InitApply(cep.clone())),
    Ok(watcher::Event::InitDone),
    Ok(watcher::Event::Apply(with_status_write(&cep, "2"))),
    Ok(watcher::Event::Apply(other.clone())),
    Ok(watcher::Event::Delete(cep.clone())),
    Ok(watcher::Event::Apply(cep.clone())),
  ]);
  let triggered: Vec<_> = filter
    .filter_events(events)
    .map(|result| result.unwrap().metadata.name.unwrap_or_default())
    .collect()
    .await;
  assert_eq!(vec!["demo", "other", "demo"], triggered);
}
