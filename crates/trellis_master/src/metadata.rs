//! Persistent table and tablet records, and the cached consensus state.
//!
//! These are the copy-on-write payloads behind every `TableInfo` and
//! `TabletInfo`. They serialize with serde and are stored as system-tablet
//! entries; nothing in here is mutated outside a metadata write lock.

use serde::{Deserialize, Serialize};

use crate::partition::{Partition, PartitionSchema};
use crate::schema::{ColumnId, Schema};

pub type TableId = String;
pub type TabletId = String;
/// Permanent uuid of a tablet server.
pub type TsId = String;

/// Sentinel for a committed config whose log index is not known.
pub const INVALID_OPID_INDEX: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TableState {
    Preparing,
    Running,
    Altering,
    Removed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TabletState {
    Preparing,
    Creating,
    Running,
    Replaced,
    Deleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberKind {
    Voter,
    NonVoter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerHealth {
    Unknown,
    Healthy,
    Failed,
}

/// One peer in a tablet's Raft configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftPeer {
    pub uuid: TsId,
    pub member_type: MemberKind,
    /// Last address the peer was reachable at, used when the fleet tracker
    /// has no registration for it yet.
    pub last_known_addr: Option<String>,
    /// Promote this non-voter to voter once it has caught up.
    pub promote: bool,
    /// This peer is marked for replacement.
    pub replace: bool,
    /// Health as reported by the tablet leader. Never persisted.
    pub health: Option<PeerHealth>,
}

impl RaftPeer {
    pub fn voter(uuid: impl Into<TsId>) -> Self {
        Self {
            uuid: uuid.into(),
            member_type: MemberKind::Voter,
            last_known_addr: None,
            promote: false,
            replace: false,
            health: None,
        }
    }

    pub fn non_voter(uuid: impl Into<TsId>) -> Self {
        Self {
            member_type: MemberKind::NonVoter,
            ..Self::voter(uuid)
        }
    }
}

/// A committed or pending Raft configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftConfig {
    /// Log index of the config-change operation that committed this config,
    /// or [`INVALID_OPID_INDEX`] when unknown.
    pub opid_index: i64,
    pub peers: Vec<RaftPeer>,
}

impl RaftConfig {
    pub fn empty() -> Self {
        Self {
            opid_index: INVALID_OPID_INDEX,
            peers: Vec::new(),
        }
    }

    pub fn is_member(&self, uuid: &str) -> bool {
        self.peers.iter().any(|p| p.uuid == uuid)
    }

    pub fn is_voter(&self, uuid: &str) -> bool {
        self.peers
            .iter()
            .any(|p| p.uuid == uuid && p.member_type == MemberKind::Voter)
    }

    pub fn count_voters(&self) -> usize {
        self.peers
            .iter()
            .filter(|p| p.member_type == MemberKind::Voter)
            .count()
    }

    pub fn peer(&self, uuid: &str) -> Option<&RaftPeer> {
        self.peers.iter().find(|p| p.uuid == uuid)
    }
}

/// The master's cached view of one tablet's consensus state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusState {
    pub current_term: u64,
    pub leader_uuid: Option<TsId>,
    pub committed_config: RaftConfig,
    pub pending_config: Option<RaftConfig>,
}

impl ConsensusState {
    pub fn new(term: u64, config: RaftConfig) -> Self {
        Self {
            current_term: term,
            leader_uuid: None,
            committed_config: config,
            pending_config: None,
        }
    }

    /// Drop leader knowledge that is not backed by membership in the
    /// committed config.
    pub fn clear_unknown_leader(&mut self) {
        if let Some(leader) = &self.leader_uuid {
            if !self.committed_config.is_member(leader) {
                self.leader_uuid = None;
            }
        }
    }

    /// Whether the leader is known and is a voter in the committed config.
    pub fn has_voter_leader(&self) -> bool {
        self.leader_uuid
            .as_deref()
            .map(|l| self.committed_config.is_voter(l))
            .unwrap_or(false)
    }

    /// Strip per-peer health before persistence.
    pub fn strip_health(&mut self) {
        for peer in &mut self.committed_config.peers {
            peer.health = None;
        }
        if let Some(pending) = &mut self.pending_config {
            for peer in &mut pending.peers {
                peer.health = None;
            }
        }
    }
}

/// Persistent state of one table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistentTable {
    pub state: TableState,
    pub name: String,
    /// Monotonically increasing schema version.
    pub version: u64,
    pub next_column_id: ColumnId,
    pub num_replicas: u32,
    pub schema: Schema,
    /// During an alter, the last schema known to have reached every tablet
    /// server; `schema` is the target.
    pub fully_applied_schema: Option<Schema>,
    pub partition_schema: PartitionSchema,
    pub state_msg: String,
}

impl PersistentTable {
    pub fn is_deleted(&self) -> bool {
        self.state == TableState::Removed
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, TableState::Running | TableState::Altering)
    }

    pub fn set_state(&mut self, state: TableState, msg: impl Into<String>) {
        self.state = state;
        self.state_msg = msg.into();
    }
}

/// Persistent state of one tablet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistentTablet {
    pub state: TabletState,
    pub table_id: TableId,
    pub partition: Partition,
    /// Last known consensus state, absent until replicas are selected.
    pub consensus_state: Option<ConsensusState>,
    pub state_msg: String,
}

impl PersistentTablet {
    pub fn is_deleted(&self) -> bool {
        matches!(self.state, TabletState::Deleted | TabletState::Replaced)
    }

    pub fn is_running(&self) -> bool {
        self.state == TabletState::Running
    }

    pub fn set_state(&mut self, state: TabletState, msg: impl Into<String>) {
        self.state = state;
        self.state_msg = msg.into();
    }
}
