//! Admin protocol the master speaks to tablet servers.
//!
//! The wire transport is owned by the host process; the catalog only needs
//! the request shapes and an async seam it can fan out on. Test harnesses
//! and embedders provide [`TabletServerAdmin`] implementations.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::metadata::{RaftConfig, RaftPeer, TableId, TabletId, TsId};
use crate::partition::{Partition, PartitionSchema};
use crate::schema::Schema;

/// On-disk disposition of a tablet replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TabletDataState {
    Ready,
    /// Data removed, marker retained to prevent resurrection.
    Tombstoned,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateTabletRequest {
    pub tablet_id: TabletId,
    pub table_id: TableId,
    pub table_name: String,
    pub schema: Schema,
    pub partition_schema: PartitionSchema,
    pub partition: Partition,
    pub config: RaftConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteTabletRequest {
    pub tablet_id: TabletId,
    /// `Deleted` for permanent removal, `Tombstoned` for evicted replicas.
    pub mode: TabletDataState,
    /// When set, the server must reject the delete unless its committed
    /// config opid index is at most this value.
    pub cas_config_opid_index: Option<i64>,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlterSchemaRequest {
    pub tablet_id: TabletId,
    pub schema: Schema,
    pub schema_version: u64,
    pub new_table_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigChange {
    AddPeer(RaftPeer),
    RemovePeer(TsId),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeConfigRequest {
    pub tablet_id: TabletId,
    pub change: ConfigChange,
    /// Committed config opid index this change was planned against.
    pub cas_config_opid_index: i64,
}

/// Error codes a tablet server can answer an admin RPC with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TsErrorCode {
    TabletNotFound,
    CasFailed,
    MismatchedSchema,
    TabletHasANewerSchema,
    NotTheLeader,
    Unavailable,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code:?}: {message}")]
pub struct TsAdminError {
    pub code: TsErrorCode,
    pub message: String,
}

impl TsAdminError {
    pub fn new(code: TsErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Admin endpoints of one tablet server.
#[async_trait]
pub trait TabletServerAdmin: Send + Sync {
    async fn create_tablet(&self, req: CreateTabletRequest) -> Result<(), TsAdminError>;

    async fn delete_tablet(&self, req: DeleteTabletRequest) -> Result<(), TsAdminError>;

    async fn alter_schema(&self, req: AlterSchemaRequest) -> Result<(), TsAdminError>;

    /// Sent to the tablet leader; proposes a config change through the
    /// tablet's own consensus.
    async fn change_config(&self, req: ChangeConfigRequest) -> Result<(), TsAdminError>;
}
