//! Client-facing catalog RPC request/response types and tablet reports.

use serde::{Deserialize, Serialize};

use crate::metadata::{ConsensusState, TableId, TabletId, TsId};
use crate::partition::PartitionSchema;
use crate::schema::{ColumnSchema, Schema};
use crate::ts_admin::TabletDataState;

/// Identifies a table by id or by name. Id wins when both are present.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableIdent {
    pub table_id: Option<TableId>,
    pub table_name: Option<String>,
}

impl TableIdent {
    pub fn by_id(id: impl Into<TableId>) -> Self {
        Self {
            table_id: Some(id.into()),
            table_name: None,
        }
    }

    pub fn by_name(name: impl Into<String>) -> Self {
        Self {
            table_id: None,
            table_name: Some(name.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateTableRequest {
    pub name: String,
    pub schema: Schema,
    pub partition_schema: PartitionSchema,
    /// Encoded range keys the table is pre-split on.
    pub split_points: Vec<Vec<u8>>,
    /// Explicit `[lower, upper)` range bounds; empty keys are unbounded.
    pub range_bounds: Vec<(Vec<u8>, Vec<u8>)>,
    pub num_replicas: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateTableResponse {
    pub table_id: TableId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteTableRequest {
    pub table: TableIdent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AlterTableStep {
    AddColumn {
        column: ColumnSchema,
    },
    DropColumn {
        name: String,
    },
    RenameColumn {
        old_name: String,
        new_name: String,
    },
    AddRangePartition {
        lower: Vec<u8>,
        upper: Vec<u8>,
    },
    DropRangePartition {
        lower: Vec<u8>,
        upper: Vec<u8>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlterTableRequest {
    pub table: TableIdent,
    pub steps: Vec<AlterTableStep>,
    pub new_table_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlterTableResponse {
    pub table_id: TableId,
    pub schema_version: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetTableSchemaResponse {
    pub table_id: TableId,
    pub name: String,
    pub schema: Schema,
    pub partition_schema: PartitionSchema,
    pub num_replicas: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListedTable {
    pub table_id: TableId,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicaTypeFilter {
    /// Voters only.
    Voters,
    /// Voters and non-voters.
    Any,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicaRole {
    Leader,
    Follower,
    Learner,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaLocation {
    pub ts_uuid: TsId,
    pub rpc_addr: Option<String>,
    pub role: ReplicaRole,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabletLocations {
    pub tablet_id: TabletId,
    pub partition_begin: Vec<u8>,
    pub partition_end: Vec<u8>,
    pub replicas: Vec<ReplicaLocation>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetTableLocationsRequest {
    pub table: TableIdent,
    /// Encoded partition key to start from.
    pub partition_key_start: Vec<u8>,
    pub max_returned_locations: usize,
    pub replica_type_filter: ReplicaTypeFilter,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetTableLocationsResponse {
    pub tablet_locations: Vec<TabletLocations>,
    /// How long the client may cache these locations.
    pub ttl_millis: u64,
}

/// Signed-token and CA material handed to connecting clients and servers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectToMasterResponse {
    pub leader: bool,
    pub ca_cert_der: Option<Vec<u8>>,
    pub tsk_public_keys: Vec<TskPublicKey>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TskPublicKey {
    pub seq_num: i64,
    pub public_key_der: Vec<u8>,
}

/// One tablet's entry in a tablet server's report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportedTablet {
    pub tablet_id: TabletId,
    pub data_state: TabletDataState,
    /// Set when the replica failed on the server.
    pub error: Option<String>,
    pub consensus_state: Option<ConsensusState>,
    pub schema_version: Option<u64>,
}

impl ReportedTablet {
    /// Committed config opid index carried by the report, if any.
    pub fn committed_opid_index(&self) -> Option<i64> {
        self.consensus_state
            .as_ref()
            .map(|c| c.committed_config.opid_index)
    }
}

/// A batch of reported tablets from one tablet server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TabletReport {
    pub updated_tablets: Vec<ReportedTablet>,
}

/// Master acknowledgement per reported tablet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportedTabletUpdate {
    pub tablet_id: TabletId,
    pub state_msg: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabletReportUpdates {
    pub tablets: Vec<ReportedTabletUpdate>,
}
