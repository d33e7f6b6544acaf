//! Tablet-report processing: convergence, tombstoning, and replica repair.

mod common;

use common::*;
use trellis_master::metadata::{MemberKind, PeerHealth, RaftPeer};
use trellis_master::rpc::{DeleteTableRequest, ReportedTablet, TableIdent, TabletReport};
use trellis_master::ts_admin::{ConfigChange, TabletDataState};
use trellis_master::MasterConfig;

/// Create a single-tablet table and drive it to running; returns the tablet
/// id.
async fn running_tablet(cluster: &TestCluster) -> String {
    cluster
        .catalog
        .create_table(create_request("t", vec![]))
        .await
        .unwrap();
    wait_until(
        || cluster.all_create_requests().len() >= 3,
        "create fan-out",
    )
    .await;
    let tablet_id = cluster.created_tablet_ids().remove(0);
    cluster
        .report_running("ts-0", &tablet_id, &["ts-0", "ts-1", "ts-2"], "ts-0", 1, 1)
        .await;
    tablet_id
}

#[tokio::test]
async fn unknown_tablets_are_ignored() {
    let cluster = TestCluster::start(3).await;
    let updates = cluster
        .catalog
        .process_tablet_report(
            "ts-0",
            TabletReport {
                updated_tablets: vec![running_report("no-such-tablet", &["ts-0"], "ts-0", 1, 1)],
            },
        )
        .await
        .unwrap();
    assert!(updates.tablets.is_empty());
    // No deletion may be issued for a tablet this master cannot account for.
    assert!(cluster.server("ts-0").delete_requests().is_empty());
}

#[tokio::test]
async fn report_for_deleted_table_requests_deletion() {
    let cluster = TestCluster::start(3).await;
    let tablet_id = running_tablet(&cluster).await;
    cluster
        .catalog
        .delete_table(DeleteTableRequest {
            table: TableIdent::by_name("t"),
        })
        .await
        .unwrap();
    wait_until(
        || !cluster.server("ts-1").delete_requests().is_empty(),
        "delete fan-out from table deletion",
    )
    .await;
    let before = cluster.server("ts-2").delete_requests().len();

    cluster
        .report_running("ts-2", &tablet_id, &["ts-0", "ts-1", "ts-2"], "ts-0", 1, 1)
        .await;
    wait_until(
        || cluster.server("ts-2").delete_requests().len() > before,
        "deletion requested for reported dead tablet",
    )
    .await;
    let req = cluster.server("ts-2").delete_requests().pop().unwrap();
    assert_eq!(req.mode, TabletDataState::Deleted);
    assert_eq!(req.cas_config_opid_index, None);
}

#[tokio::test]
async fn stale_evicted_replica_is_tombstoned() {
    let cluster = TestCluster::start(4).await;
    let tablet_id = running_tablet(&cluster).await;

    // The config moves on without ts-3 ever being part of it; ts-3 then
    // reports with an old config index.
    cluster
        .report_running("ts-0", &tablet_id, &["ts-0", "ts-1", "ts-2"], "ts-0", 1, 5)
        .await;
    cluster
        .report_running("ts-3", &tablet_id, &["ts-0", "ts-1", "ts-3"], "ts-0", 1, 2)
        .await;

    wait_until(
        || !cluster.server("ts-3").delete_requests().is_empty(),
        "tombstone of stale replica",
    )
    .await;
    let req = cluster.server("ts-3").delete_requests().remove(0);
    assert_eq!(req.mode, TabletDataState::Tombstoned);
    // CAS against the previous committed index, not the reported one.
    assert_eq!(req.cas_config_opid_index, Some(5));
}

#[tokio::test]
async fn peers_dropped_from_config_are_tombstoned() {
    let cluster = TestCluster::start(3).await;
    let tablet_id = running_tablet(&cluster).await;

    // ts-2 disappears from the committed config.
    cluster
        .report_running("ts-0", &tablet_id, &["ts-0", "ts-1"], "ts-0", 1, 7)
        .await;
    wait_until(
        || !cluster.server("ts-2").delete_requests().is_empty(),
        "tombstone of evicted peer",
    )
    .await;
    let req = cluster.server("ts-2").delete_requests().remove(0);
    assert_eq!(req.mode, TabletDataState::Tombstoned);
    assert_eq!(req.cas_config_opid_index, Some(7));
}

#[tokio::test]
async fn legacy_mode_adds_voter_when_under_replicated() {
    let cluster = TestCluster::start(4).await;
    let tablet_id = running_tablet(&cluster).await;

    // Two voters left in the committed config; replication factor is three.
    cluster
        .report_running("ts-0", &tablet_id, &["ts-0", "ts-1"], "ts-0", 2, 9)
        .await;
    wait_until(
        || !cluster.server("ts-0").change_config_requests().is_empty(),
        "add-replica config change",
    )
    .await;
    let req = cluster.server("ts-0").change_config_requests().remove(0);
    assert_eq!(req.cas_config_opid_index, 9);
    match req.change {
        ConfigChange::AddPeer(peer) => {
            assert_eq!(peer.member_type, MemberKind::Voter);
            // Only ts-2 and ts-3 are outside the config.
            assert!(peer.uuid == "ts-2" || peer.uuid == "ts-3");
        }
        other => panic!("unexpected config change: {other:?}"),
    }

    // Once the third voter is committed, no further changes are requested.
    let before = cluster.server("ts-0").change_config_requests().len();
    cluster
        .report_running("ts-0", &tablet_id, &["ts-0", "ts-1", "ts-2"], "ts-0", 2, 10)
        .await;
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert_eq!(cluster.server("ts-0").change_config_requests().len(), before);
}

#[tokio::test]
async fn replaying_an_accepted_report_is_a_no_op() {
    let cluster = TestCluster::start(3).await;
    let tablet_id = running_tablet(&cluster).await;

    let calls_before: usize = cluster.servers.iter().map(|s| s.calls().len()).sum();
    // Same term, same opid index, same members as already accepted.
    cluster
        .report_running("ts-0", &tablet_id, &["ts-0", "ts-1", "ts-2"], "ts-0", 1, 1)
        .await;
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    let calls_after: usize = cluster.servers.iter().map(|s| s.calls().len()).sum();
    assert_eq!(calls_before, calls_after);
}

#[tokio::test]
async fn replacement_mode_stages_non_voter_then_evicts() {
    let cfg = MasterConfig {
        prepare_replacement_before_eviction: true,
        ..test_config()
    };
    let cluster = TestCluster::start_with_config(cfg, 4).await;
    let tablet_id = running_tablet(&cluster).await;

    // The leader reports ts-2 as failed.
    let mut cstate = consensus_state(&["ts-0", "ts-1", "ts-2"], "ts-0", 3, 12);
    for peer in &mut cstate.committed_config.peers {
        peer.health = Some(if peer.uuid == "ts-2" {
            PeerHealth::Failed
        } else {
            PeerHealth::Healthy
        });
    }
    cluster
        .catalog
        .process_tablet_report(
            "ts-0",
            TabletReport {
                updated_tablets: vec![ReportedTablet {
                    tablet_id: tablet_id.clone(),
                    data_state: TabletDataState::Ready,
                    error: None,
                    consensus_state: Some(cstate),
                    schema_version: Some(0),
                }],
            },
        )
        .await
        .unwrap();

    wait_until(
        || !cluster.server("ts-0").change_config_requests().is_empty(),
        "staged replacement add",
    )
    .await;
    let req = cluster.server("ts-0").change_config_requests().remove(0);
    match req.change {
        ConfigChange::AddPeer(peer) => {
            assert_eq!(peer.member_type, MemberKind::NonVoter);
            assert!(peer.promote);
            assert_eq!(peer.uuid, "ts-3");
        }
        other => panic!("unexpected config change: {other:?}"),
    }

    // The replacement has been promoted to voter; now the failed peer goes.
    let mut cstate = consensus_state(&["ts-0", "ts-1", "ts-2", "ts-3"], "ts-0", 3, 13);
    for peer in &mut cstate.committed_config.peers {
        peer.health = Some(if peer.uuid == "ts-2" {
            PeerHealth::Failed
        } else {
            PeerHealth::Healthy
        });
    }
    cluster
        .catalog
        .process_tablet_report(
            "ts-0",
            TabletReport {
                updated_tablets: vec![ReportedTablet {
                    tablet_id: tablet_id.clone(),
                    data_state: TabletDataState::Ready,
                    error: None,
                    consensus_state: Some(cstate),
                    schema_version: Some(0),
                }],
            },
        )
        .await
        .unwrap();

    wait_until(
        || {
            cluster
                .server("ts-0")
                .change_config_requests()
                .iter()
                .any(|r| matches!(&r.change, ConfigChange::RemovePeer(uuid) if uuid == "ts-2"))
        },
        "eviction of failed peer",
    )
    .await;
}

#[tokio::test]
async fn persisted_consensus_state_has_no_health() {
    let cluster = TestCluster::start(3).await;
    let tablet_id = running_tablet(&cluster).await;

    let mut cstate = consensus_state(&["ts-0", "ts-1", "ts-2"], "ts-0", 2, 4);
    for peer in &mut cstate.committed_config.peers {
        peer.health = Some(PeerHealth::Healthy);
    }
    cluster
        .catalog
        .process_tablet_report(
            "ts-0",
            TabletReport {
                updated_tablets: vec![ReportedTablet {
                    tablet_id: tablet_id.clone(),
                    data_state: TabletDataState::Ready,
                    error: None,
                    consensus_state: Some(cstate),
                    schema_version: Some(0),
                }],
            },
        )
        .await
        .unwrap();

    let tablets = cluster
        .catalog
        .sys_catalog()
        .visit_tablets()
        .unwrap();
    let (_, record) = tablets
        .into_iter()
        .find(|(id, _)| *id == tablet_id)
        .unwrap();
    let persisted = record.consensus_state.unwrap();
    assert!(persisted
        .committed_config
        .peers
        .iter()
        .all(|p| p.health.is_none()));
}

#[tokio::test]
async fn same_term_leader_disagreement_is_abandoned() {
    let cluster = TestCluster::start(3).await;
    let tablet_id = running_tablet(&cluster).await;

    // ts-1 claims a different leader for the already-known term but with a
    // higher opid index; the entry must be dropped, not accepted.
    cluster
        .report_running("ts-1", &tablet_id, &["ts-0", "ts-1", "ts-2"], "ts-1", 1, 3)
        .await;

    let tablets = cluster.catalog.sys_catalog().visit_tablets().unwrap();
    let (_, record) = tablets
        .into_iter()
        .find(|(id, _)| *id == tablet_id)
        .unwrap();
    let persisted = record.consensus_state.unwrap();
    assert_eq!(persisted.leader_uuid.as_deref(), Some("ts-0"));
    assert_eq!(persisted.committed_config.opid_index, 1);
}

#[tokio::test]
async fn follower_report_without_leader_keeps_known_leader() {
    let cluster = TestCluster::start(3).await;
    let tablet_id = running_tablet(&cluster).await;

    // A follower reports a newer config but does not know the leader yet.
    let mut report = running_report(&tablet_id, &["ts-0", "ts-1", "ts-2"], "ts-0", 1, 6);
    if let Some(cstate) = &mut report.consensus_state {
        cstate.leader_uuid = None;
    }
    cluster
        .catalog
        .process_tablet_report("ts-1", TabletReport { updated_tablets: vec![report] })
        .await
        .unwrap();

    let tablets = cluster.catalog.sys_catalog().visit_tablets().unwrap();
    let (_, record) = tablets
        .into_iter()
        .find(|(id, _)| *id == tablet_id)
        .unwrap();
    let persisted = record.consensus_state.unwrap();
    assert_eq!(persisted.leader_uuid.as_deref(), Some("ts-0"));
    assert_eq!(persisted.committed_config.opid_index, 6);
}

#[tokio::test]
async fn non_voter_reported_leader_is_disregarded() {
    let cluster = TestCluster::start(3).await;
    let tablet_id = running_tablet(&cluster).await;

    // A report naming a non-member as leader: the leader claim is dropped,
    // and with a higher term the config still lands.
    let mut report = running_report(&tablet_id, &["ts-0", "ts-1", "ts-2"], "ts-9", 5, 8);
    if let Some(cstate) = &mut report.consensus_state {
        cstate.committed_config.peers = vec![
            RaftPeer::voter("ts-0"),
            RaftPeer::voter("ts-1"),
            RaftPeer::voter("ts-2"),
        ];
    }
    cluster
        .catalog
        .process_tablet_report("ts-0", TabletReport { updated_tablets: vec![report] })
        .await
        .unwrap();

    let tablets = cluster.catalog.sys_catalog().visit_tablets().unwrap();
    let (_, record) = tablets
        .into_iter()
        .find(|(id, _)| *id == tablet_id)
        .unwrap();
    let persisted = record.consensus_state.unwrap();
    assert_eq!(persisted.leader_uuid, None);
    assert_eq!(persisted.committed_config.opid_index, 8);
}
