//! Background assignment: creation timeout replacement and delete races.

mod common;

use std::time::Duration;

use common::*;
use trellis_master::rpc::{DeleteTableRequest, TableIdent};
use trellis_master::ts_admin::TabletDataState;
use trellis_master::MasterConfig;

#[tokio::test]
async fn unacknowledged_create_is_replaced_after_timeout() {
    let cfg = MasterConfig {
        tablet_creation_timeout: Duration::from_millis(100),
        ..test_config()
    };
    let cluster = TestCluster::start_with_config(cfg, 3).await;

    cluster
        .catalog
        .create_table(create_request("t", vec![]))
        .await
        .unwrap();
    wait_until(
        || cluster.all_create_requests().len() >= 3,
        "initial create fan-out",
    )
    .await;
    let first_id = cluster.created_tablet_ids().remove(0);
    let partition = cluster.all_create_requests().remove(0).partition;

    // No tablet server ever acknowledges with a report; the reconciler
    // mints a replacement covering the same partition.
    wait_until(
        || cluster.created_tablet_ids().len() >= 2,
        "replacement create fan-out",
    )
    .await;
    let replacement = cluster
        .all_create_requests()
        .into_iter()
        .find(|r| r.tablet_id != first_id)
        .unwrap();
    assert_eq!(replacement.partition, partition);
    assert_eq!(replacement.config.peers.len(), 3);

    // The replaced tablet's replicas are told to go away.
    wait_until(
        || {
            cluster
                .servers
                .iter()
                .flat_map(|s| s.delete_requests())
                .any(|r| r.tablet_id == first_id && r.mode == TabletDataState::Deleted)
        },
        "delete fan-out for replaced tablet",
    )
    .await;
}

#[tokio::test]
async fn delete_while_creating_leaves_nothing_behind() {
    let cluster = TestCluster::start(3).await;
    cluster
        .catalog
        .create_table(create_request("t", vec![]))
        .await
        .unwrap();
    // Delete before any tablet server acknowledges.
    cluster
        .catalog
        .delete_table(DeleteTableRequest {
            table: TableIdent::by_name("t"),
        })
        .await
        .unwrap();

    let err = cluster
        .catalog
        .get_table_schema(&TableIdent::by_name("t"))
        .await
        .unwrap_err();
    assert_eq!(err.code, trellis_master::MasterErrorCode::TableNotFound);
    assert!(cluster.catalog.list_tables(None).await.unwrap().is_empty());

    // Any replica that did get created gets a deletion request; tablets
    // whose create was still pending may never have had replicas selected.
    let tablets = cluster.catalog.sys_catalog().visit_tablets().unwrap();
    assert!(tablets
        .iter()
        .all(|(_, t)| t.state == trellis_master::metadata::TabletState::Deleted));
    if let Some((id, record)) = tablets
        .iter()
        .find(|(_, t)| t.consensus_state.is_some())
    {
        let peers = &record.consensus_state.as_ref().unwrap().committed_config.peers;
        for peer in peers {
            wait_until(
                || {
                    cluster
                        .server(&peer.uuid)
                        .delete_requests()
                        .iter()
                        .any(|r| r.tablet_id == *id && r.mode == TabletDataState::Deleted)
                },
                "delete fan-out after delete-while-creating",
            )
            .await;
        }
    }
}

#[tokio::test]
async fn repeated_delete_stops_on_tablet_not_found() {
    let cluster = TestCluster::start(3).await;
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

    // ts-1 answers the delete with "tablet not found": the task finishes
    // without retrying.
    cluster
        .server("ts-1")
        .push_error("delete_tablet", trellis_master::ts_admin::TsErrorCode::TabletNotFound);
    cluster
        .catalog
        .delete_table(DeleteTableRequest {
            table: TableIdent::by_name("t"),
        })
        .await
        .unwrap();

    wait_until(
        || !cluster.server("ts-1").delete_requests().is_empty(),
        "delete attempt against ts-1",
    )
    .await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(cluster.server("ts-1").delete_requests().len(), 1);
}
