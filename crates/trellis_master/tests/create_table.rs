//! Table creation: the full happy path plus validation boundaries.

mod common;

use common::*;
use trellis_master::error::MasterErrorCode;
use trellis_master::rpc::{
    DeleteTableRequest, GetTableLocationsRequest, ReplicaTypeFilter, TableIdent,
};
use trellis_master::MasterConfig;

#[tokio::test]
async fn fresh_create_reaches_running() {
    let cluster = TestCluster::start(3).await;

    let resp = cluster
        .catalog
        .create_table(create_request("t", vec![b"m".to_vec()]))
        .await
        .unwrap();

    // Two partitions, three replicas each: every server hosts both tablets.
    wait_until(
        || cluster.all_create_requests().len() >= 6,
        "create fan-out to all replicas",
    )
    .await;
    let tablet_ids = cluster.created_tablet_ids();
    assert_eq!(tablet_ids.len(), 2);
    for req in cluster.all_create_requests() {
        assert_eq!(req.table_id, resp.table_id);
        assert_eq!(req.config.peers.len(), 3);
    }

    let ident = TableIdent::by_name("t");
    assert!(!cluster.catalog.is_create_table_done(&ident).await.unwrap());

    // Leaders report; both tablets come online.
    for tablet_id in &tablet_ids {
        cluster
            .report_running("ts-0", tablet_id, &["ts-0", "ts-1", "ts-2"], "ts-0", 1, 1)
            .await;
    }
    assert!(cluster.catalog.is_create_table_done(&ident).await.unwrap());

    let locations = cluster
        .catalog
        .get_table_locations(GetTableLocationsRequest {
            table: ident,
            partition_key_start: Vec::new(),
            max_returned_locations: 100,
            replica_type_filter: ReplicaTypeFilter::Voters,
        })
        .await
        .unwrap();
    assert_eq!(locations.tablet_locations.len(), 2);
    for tablet in &locations.tablet_locations {
        assert_eq!(tablet.replicas.len(), 3);
        assert!(tablet.replicas.iter().any(|r| r.rpc_addr.is_some()));
    }
    assert!(locations.ttl_millis > 0);
}

#[tokio::test]
async fn replication_factor_must_fit_live_servers() {
    let cluster = TestCluster::start(2).await;
    let err = cluster
        .catalog
        .create_table(create_request("t", vec![]))
        .await
        .unwrap_err();
    assert_eq!(err.code, MasterErrorCode::ReplicationFactorTooHigh);
}

#[tokio::test]
async fn even_replication_factor_rejected_without_override() {
    let cluster = TestCluster::start(4).await;
    let mut req = create_request("t", vec![]);
    req.num_replicas = Some(4);
    let err = cluster.catalog.create_table(req).await.unwrap_err();
    assert_eq!(err.code, MasterErrorCode::EvenReplicationFactor);

    let cfg = MasterConfig {
        allow_unsafe_replication_factor: true,
        ..test_config()
    };
    let cluster = TestCluster::start_with_config(cfg, 4).await;
    let mut req = create_request("t", vec![]);
    req.num_replicas = Some(4);
    cluster.catalog.create_table(req).await.unwrap();
}

#[tokio::test]
async fn replication_factor_bounds() {
    let cluster = TestCluster::start(8).await;

    let mut req = create_request("t", vec![]);
    req.num_replicas = Some(0);
    let err = cluster.catalog.create_table(req).await.unwrap_err();
    assert_eq!(err.code, MasterErrorCode::IllegalReplicationFactor);

    let mut req = create_request("t", vec![]);
    req.num_replicas = Some(9);
    let err = cluster.catalog.create_table(req).await.unwrap_err();
    assert_eq!(err.code, MasterErrorCode::IllegalReplicationFactor);
}

#[tokio::test]
async fn too_many_tablets_rejected() {
    let cfg = MasterConfig {
        max_create_tablets_per_ts: 1,
        ..test_config()
    };
    let cluster = TestCluster::start_with_config(cfg, 3).await;
    // Four partitions over three servers with a one-per-server cap.
    let err = cluster
        .catalog
        .create_table(create_request(
            "t",
            vec![b"b".to_vec(), b"c".to_vec(), b"d".to_vec()],
        ))
        .await
        .unwrap_err();
    assert_eq!(err.code, MasterErrorCode::TooManyTablets);
}

#[tokio::test]
async fn overlapping_range_bounds_rejected() {
    let cluster = TestCluster::start(3).await;
    let mut req = create_request("t", vec![]);
    req.range_bounds = vec![
        (b"a".to_vec(), b"c".to_vec()),
        (b"b".to_vec(), b"d".to_vec()),
    ];
    let err = cluster.catalog.create_table(req).await.unwrap_err();
    assert_eq!(err.code, MasterErrorCode::InvalidSchema);
}

#[tokio::test]
async fn duplicate_table_name_rejected() {
    let cluster = TestCluster::start(3).await;
    cluster
        .catalog
        .create_table(create_request("t", vec![]))
        .await
        .unwrap();
    let err = cluster
        .catalog
        .create_table(create_request("t", vec![]))
        .await
        .unwrap_err();
    assert_eq!(err.code, MasterErrorCode::TableAlreadyPresent);
}

#[tokio::test]
async fn recreate_after_delete_gets_fresh_id() {
    let cluster = TestCluster::start(3).await;
    let first = cluster
        .catalog
        .create_table(create_request("t", vec![]))
        .await
        .unwrap();
    cluster
        .catalog
        .delete_table(DeleteTableRequest {
            table: TableIdent::by_name("t"),
        })
        .await
        .unwrap();
    let second = cluster
        .catalog
        .create_table(create_request("t", vec![]))
        .await
        .unwrap();
    assert_ne!(first.table_id, second.table_id);

    let tables = cluster.catalog.list_tables(None).await.unwrap();
    assert_eq!(tables.len(), 1);
    assert_eq!(tables[0].table_id, second.table_id);
}

#[tokio::test]
async fn list_tables_filters_by_substring() {
    let cluster = TestCluster::start(3).await;
    for name in ["orders", "order_items", "users"] {
        cluster
            .catalog
            .create_table(create_request(name, vec![]))
            .await
            .unwrap();
    }
    let mut names: Vec<String> = cluster
        .catalog
        .list_tables(Some("order"))
        .await
        .unwrap()
        .into_iter()
        .map(|t| t.name)
        .collect();
    names.sort();
    assert_eq!(names, vec!["order_items".to_string(), "orders".to_string()]);
}

#[tokio::test]
async fn invalid_schemas_rejected() {
    let cluster = TestCluster::start(3).await;

    // Key column of a forbidden type.
    let mut req = create_request("t", vec![]);
    req.schema.columns[0].data_type = trellis_master::schema::DataType::Double;
    let err = cluster.catalog.create_table(req).await.unwrap_err();
    assert_eq!(err.code, MasterErrorCode::InvalidSchema);

    // Empty table name.
    let req = create_request("", vec![]);
    let err = cluster.catalog.create_table(req).await.unwrap_err();
    assert_eq!(err.code, MasterErrorCode::InvalidSchema);
}
