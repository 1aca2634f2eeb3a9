/*
 * Copyright (C) 2024 The Stratum Operator Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! End-to-end member-manager scenarios on the in-memory store: creation,
//! scaling, rolling upgrades and their force bypass, unjoined tracking,
//! and the failover handoff.

use crate::stratum::support::{member_health, new_cluster, placement_pod, Harness};

use chrono::Utc;
use stratum_operator::stratum::api::types::{
    FailureMember, Member, MemberPhase, ServiceOverride, ANN_FORCE_UPGRADE,
};
use stratum_operator::stratum::k8s::store::ObjectStore;

#[test]
fn first_sync_creates_endpoints_and_pod_group_then_requeues() {
    let h = Harness::new();
    h.client.set_cluster_id(1);
    let mut tc = new_cluster("test", 3);

    let err = h.manager.sync(&mut tc).unwrap_err();
    assert!(err.is_requeue(), "expected the deliberate requeue: {err}");

    let svc = h.store.get_service(Some("default"), "test-placement").unwrap();
    assert_eq!(svc.spec.type_name.as_deref(), Some("ClusterIP"));
    let peer = h
        .store
        .get_service(Some("default"), "test-placement-peer")
        .unwrap();
    assert_eq!(peer.spec.cluster_ip.as_deref(), Some("None"));
    assert!(peer.spec.publish_not_ready_addresses);

    let set = h
        .store
        .get_stateful_set(Some("default"), "test-placement")
        .unwrap();
    assert_eq!(set.spec.replicas, 3);
    assert_eq!(set.partition(), 3);
    // The specification must come through the cycle unmodified.
    assert_eq!(tc.spec.placement.replicas, 3);
}

#[test]
fn suspended_cluster_performs_no_writes() {
    let h = Harness::new();
    h.suspender.set_suspended(true);
    let mut tc = new_cluster("test", 3);

    h.manager.sync(&mut tc).expect("suspended cycle succeeds");
    assert_eq!(h.store.write_count(), 0);
}

#[test]
fn client_service_create_failure_aborts_the_cycle_early() {
    let h = Harness::new();
    h.store.fail_call("create_service", 0, "API server failed");
    let mut tc = new_cluster("test", 3);

    let err = h.manager.sync(&mut tc).unwrap_err();
    assert!(!err.is_requeue());
    assert!(err.to_string().contains("API server failed"));
    assert!(h
        .store
        .get_service(Some("default"), "test-placement")
        .unwrap_err()
        .is_not_found());
    assert!(h
        .store
        .get_stateful_set(Some("default"), "test-placement")
        .unwrap_err()
        .is_not_found());
}

#[test]
fn peer_service_create_failure_leaves_the_pod_group_uncreated() {
    let h = Harness::new();
    h.store.fail_call("create_service", 1, "API server failed");
    let mut tc = new_cluster("test", 3);

    let err = h.manager.sync(&mut tc).unwrap_err();
    assert!(err.to_string().contains("API server failed"));
    assert!(h.store.get_service(Some("default"), "test-placement").is_ok());
    assert!(h
        .store
        .get_service(Some("default"), "test-placement-peer")
        .unwrap_err()
        .is_not_found());
    assert!(h
        .store
        .get_stateful_set(Some("default"), "test-placement")
        .unwrap_err()
        .is_not_found());
}

#[test]
fn pod_group_create_failure_surfaces_after_the_services() {
    let h = Harness::new();
    h.store
        .fail_call("create_stateful_set", 0, "API server failed");
    let mut tc = new_cluster("test", 3);

    let err = h.manager.sync(&mut tc).unwrap_err();
    assert!(!err.is_requeue());
    assert!(err.to_string().contains("API server failed"));
    assert!(h.store.get_service(Some("default"), "test-placement").is_ok());
    assert!(h
        .store
        .get_service(Some("default"), "test-placement-peer")
        .is_ok());
    assert!(h
        .store
        .get_stateful_set(Some("default"), "test-placement")
        .unwrap_err()
        .is_not_found());
}

#[test]
fn scale_out_with_service_override_updates_status_and_objects() {
    let h = Harness::new();
    h.client.set_cluster_id(1);
    h.client.set_health(vec![
        member_health("test-placement-0", 1, true),
        member_health("test-placement-1", 2, true),
        member_health("test-placement-2", 3, false),
    ]);

    let mut tc = new_cluster("test", 3);
    assert!(h.manager.sync(&mut tc).unwrap_err().is_requeue());

    tc.spec.placement.replicas = 5;
    tc.spec.placement.service = Some(ServiceOverride {
        type_name: Some("NodePort".to_string()),
        ..Default::default()
    });
    h.manager.sync(&mut tc).expect("scale cycle");

    assert_eq!(tc.status.cluster_id, "1");
    assert_eq!(tc.status.placement.phase, MemberPhase::Scale);
    assert!(tc.status.placement.synced);
    assert_eq!(tc.status.placement.members.len(), 3);
    assert!(tc.status.placement.members["test-placement-0"].health);
    assert!(tc.status.placement.members["test-placement-1"].health);
    assert!(!tc.status.placement.members["test-placement-2"].health);
    assert_eq!(
        tc.status
            .placement
            .stateful_set
            .as_ref()
            .and_then(|s| s.observed_generation),
        Some(1)
    );

    let svc = h.store.get_service(Some("default"), "test-placement").unwrap();
    assert_eq!(svc.spec.type_name.as_deref(), Some("NodePort"));
    let set = h
        .store
        .get_stateful_set(Some("default"), "test-placement")
        .unwrap();
    assert_eq!(set.spec.replicas, 5);

    // One in-range member is unhealthy and status is fresh, so the cycle
    // hands the case to failover.
    assert_eq!(h.failover.mark_count(), 1);
}

#[test]
fn image_change_rolls_out_gated_and_reports_the_upgrade_phase() {
    let h = Harness::new();
    h.client.set_cluster_id(1);
    h.client.set_health(vec![
        member_health("test-placement-0", 1, true),
        member_health("test-placement-1", 2, true),
        member_health("test-placement-2", 3, true),
    ]);

    let mut tc = new_cluster("test", 3);
    assert!(h.manager.sync(&mut tc).unwrap_err().is_requeue());
    h.manager.sync(&mut tc).expect("steady cycle");
    assert_eq!(tc.status.placement.phase, MemberPhase::Normal);

    tc.spec.placement.image = "stratum/placement:v4.3.0".to_string();
    h.manager.sync(&mut tc).expect("template patch cycle");

    let set = h
        .store
        .get_stateful_set(Some("default"), "test-placement")
        .unwrap();
    assert_eq!(
        set.spec.template.spec.containers[0].image.as_deref(),
        Some("stratum/placement:v4.3.0")
    );
    // The fresh template is fully partition-protected until the gated
    // walk observes healthy members on the new revision.
    assert_eq!(set.partition(), 3);

    // The platform has now recorded diverging revisions; the next cycle
    // reports the rollout.
    h.manager.sync(&mut tc).expect("upgrade cycle");
    assert_eq!(tc.status.placement.phase, MemberPhase::Upgrade);
}

#[test]
fn isolated_single_node_force_upgrades_despite_unhealthy_members() {
    let h = Harness::new();
    h.client.set_cluster_id(1);
    h.client
        .set_health(vec![member_health("test-placement-0", 1, false)]);

    let mut tc = new_cluster("test", 1);
    tc.metadata
        .annotations
        .insert(ANN_FORCE_UPGRADE.to_string(), "true".to_string());
    assert!(h.manager.sync(&mut tc).unwrap_err().is_requeue());

    tc.spec.placement.image = "stratum/placement:v4.3.0".to_string();
    h.manager.sync(&mut tc).expect("force upgrade cycle");

    let set = h
        .store
        .get_stateful_set(Some("default"), "test-placement")
        .unwrap();
    assert_eq!(
        set.spec.template.spec.containers[0].image.as_deref(),
        Some("stratum/placement:v4.3.0")
    );
    assert_eq!(set.partition(), 0, "all ordinals upgrade immediately");
}

#[test]
fn peer_members_veto_the_force_bypass() {
    let h = Harness::new();
    h.client.set_cluster_id(1);
    h.client
        .set_health(vec![member_health("test-placement-0", 1, false)]);

    let mut tc = new_cluster("test", 1);
    tc.metadata
        .annotations
        .insert(ANN_FORCE_UPGRADE.to_string(), "true".to_string());
    tc.status.placement.peer_members.insert(
        "peer-0".to_string(),
        Member {
            name: "peer-0".to_string(),
            id: "peer-0".to_string(),
            client_url: "http://peer-0:2379".to_string(),
            health: true,
        },
    );
    assert!(h.manager.sync(&mut tc).unwrap_err().is_requeue());

    tc.spec.placement.image = "stratum/placement:v4.3.0".to_string();
    h.manager.sync(&mut tc).expect("gated cycle");

    let set = h
        .store
        .get_stateful_set(Some("default"), "test-placement")
        .unwrap();
    // The annotation alone is insufficient when consensus partners exist:
    // the gated boundary still protects the only ordinal.
    assert_eq!(set.partition(), 1);
    assert_eq!(tc.status.placement.phase, MemberPhase::Normal);
}

#[test]
fn pods_outside_the_health_report_are_tracked_as_unjoined() {
    let h = Harness::new();
    h.client.set_cluster_id(1);
    h.client.set_health(vec![
        member_health("test-placement-0", 1, false),
        member_health("test-placement-1", 2, false),
    ]);

    let mut tc = new_cluster("test", 3);
    assert!(h.manager.sync(&mut tc).unwrap_err().is_requeue());
    for ordinal in 0..3 {
        h.store.add_pod(placement_pod(&tc, ordinal, false));
    }

    h.manager.sync(&mut tc).expect("sync with straggler");
    assert_eq!(tc.status.placement.unjoined_members.len(), 1);
    let entry = &tc.status.placement.unjoined_members["test-placement-2"];
    assert_eq!(entry.pod_name, "test-placement-2");
    let first_seen = entry.created_at;

    // Still unjoined on the next cycle: the first-seen stamp persists.
    h.manager.sync(&mut tc).expect("sync while still unjoined");
    assert_eq!(
        tc.status.placement.unjoined_members["test-placement-2"].created_at,
        first_seen
    );

    // The member joins (health does not matter) and the entry clears.
    h.client.set_health(vec![
        member_health("test-placement-0", 1, false),
        member_health("test-placement-1", 2, false),
        member_health("test-placement-2", 3, false),
    ]);
    h.manager.sync(&mut tc).expect("sync after join");
    assert!(tc.status.placement.unjoined_members.is_empty());
    assert_eq!(tc.status.placement.members.len(), 3);
}

#[test]
fn recovered_clusters_hand_the_failure_records_to_failover() {
    let h = Harness::new();
    h.client.set_cluster_id(1);
    h.client.set_health(vec![
        member_health("test-placement-0", 1, true),
        member_health("test-placement-1", 2, true),
    ]);

    let mut tc = new_cluster("test", 2);
    assert!(h.manager.sync(&mut tc).unwrap_err().is_requeue());
    for ordinal in 0..2 {
        h.store.add_pod(placement_pod(&tc, ordinal, true));
    }
    tc.status.placement.failure_members.insert(
        "test-placement-0".to_string(),
        FailureMember {
            pod_name: "test-placement-0".to_string(),
            created_at: Utc::now(),
            member_deleted: true,
        },
    );

    h.manager.sync(&mut tc).expect("recovery cycle");
    assert_eq!(h.failover.clear_count(), 1);
    assert!(tc.status.placement.failure_members.is_empty());
    assert_eq!(h.failover.mark_count(), 0);
}

#[test]
fn unrecovered_failures_are_not_cleared() {
    let h = Harness::new();
    h.client.set_cluster_id(1);
    h.client.set_health(vec![
        member_health("test-placement-0", 1, false),
        member_health("test-placement-1", 2, true),
    ]);

    let mut tc = new_cluster("test", 2);
    assert!(h.manager.sync(&mut tc).unwrap_err().is_requeue());
    for ordinal in 0..2 {
        h.store.add_pod(placement_pod(&tc, ordinal, true));
    }
    tc.status.placement.failure_members.insert(
        "test-placement-0".to_string(),
        FailureMember {
            pod_name: "test-placement-0".to_string(),
            created_at: Utc::now(),
            member_deleted: true,
        },
    );

    h.manager.sync(&mut tc).expect("degraded cycle");
    assert_eq!(h.failover.clear_count(), 0);
    assert!(!tc.status.placement.failure_members.is_empty());
    assert_eq!(h.failover.mark_count(), 1);
}

#[test]
fn steady_state_cycles_issue_no_additional_writes() {
    let h = Harness::new();
    h.client.set_cluster_id(1);
    h.client.set_health(vec![
        member_health("test-placement-0", 1, true),
        member_health("test-placement-1", 2, true),
        member_health("test-placement-2", 3, true),
    ]);

    let mut tc = new_cluster("test", 3);
    assert!(h.manager.sync(&mut tc).unwrap_err().is_requeue());
    h.manager.sync(&mut tc).expect("first full cycle");
    let writes = h.store.write_count();

    h.manager.sync(&mut tc).expect("second full cycle");
    h.manager.sync(&mut tc).expect("third full cycle");
    assert_eq!(h.store.write_count(), writes, "cycles are idempotent");
}

#[test]
fn pod_group_update_failure_propagates() {
    let h = Harness::new();
    h.client.set_cluster_id(1);

    let mut tc = new_cluster("test", 3);
    assert!(h.manager.sync(&mut tc).unwrap_err().is_requeue());

    h.store
        .fail_call("update_stateful_set", 0, "API server failed");
    tc.spec.placement.replicas = 5;
    let err = h.manager.sync(&mut tc).unwrap_err();
    assert!(!err.is_requeue());
    assert!(err.to_string().contains("API server failed"));

    let set = h
        .store
        .get_stateful_set(Some("default"), "test-placement")
        .unwrap();
    assert_eq!(set.spec.replicas, 3, "failed patch left the group alone");
}
