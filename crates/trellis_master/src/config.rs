//! Catalog manager tunables.
//!
//! All knobs live in one record passed at construction; sub-workers receive
//! narrow copies of what they need. Nothing here is process-global.

use std::time::Duration;

/// Tunables for the catalog manager and its background machinery.
#[derive(Clone, Debug)]
pub struct MasterConfig {
    /// Per-attempt timeout for master-to-tablet-server admin RPCs.
    pub ts_rpc_timeout: Duration,
    /// How long a tablet may sit in `Creating` before it is replaced.
    pub tablet_creation_timeout: Duration,
    /// Overall deadline for a retrying admin task against one tablet server.
    pub unresponsive_ts_rpc_timeout: Duration,
    /// Replication factor used when a create request does not specify one.
    pub default_num_replicas: u32,
    /// Upper bound on the per-table replication factor.
    pub max_num_replicas: u32,
    /// Upper bound on the number of columns in a table schema.
    pub max_num_columns: usize,
    /// Upper bound on table and column identifier byte length.
    pub max_identifier_length: usize,
    /// Allow even (and otherwise unsafe) replication factors.
    pub allow_unsafe_replication_factor: bool,
    /// Reconciler wait between iterations when nothing wakes it earlier.
    pub bg_task_wait: Duration,
    /// Per-live-tablet-server cap on tablets created by one table.
    pub max_create_tablets_per_ts: usize,
    /// How long the post-election prepare waits for in-flight system-tablet
    /// transactions before crashing.
    pub failover_catchup_timeout: Duration,
    /// Tombstone replicas evicted from a tablet's committed config.
    pub tombstone_evicted_replicas: bool,
    /// Add a replica when a tablet is under-replicated.
    pub add_replica_when_underreplicated: bool,
    /// Reject create-table requests needing more replicas than live servers.
    pub check_ts_count_for_create_table: bool,
    /// TTL clients may cache tablet locations for.
    pub table_locations_ttl: Duration,
    /// Require an elected leader before transitioning a new tablet to
    /// `Running`.
    pub wait_for_new_tablets_to_elect_leader: bool,
    /// Evict replicas beyond the replication factor.
    pub evict_excess_replicas: bool,
    /// Use the replacement-before-eviction placement mode driven by leader
    /// health reports instead of the legacy count-based mode.
    pub prepare_replacement_before_eviction: bool,
    /// Ignore majority-health restrictions when planning replacements.
    pub replace_replica_without_majority: bool,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            ts_rpc_timeout: Duration::from_secs(30),
            tablet_creation_timeout: Duration::from_secs(30),
            unresponsive_ts_rpc_timeout: Duration::from_secs(60 * 60),
            default_num_replicas: 3,
            max_num_replicas: 7,
            max_num_columns: 300,
            max_identifier_length: 256,
            allow_unsafe_replication_factor: false,
            bg_task_wait: Duration::from_secs(1),
            max_create_tablets_per_ts: 20,
            failover_catchup_timeout: Duration::from_secs(30),
            tombstone_evicted_replicas: true,
            add_replica_when_underreplicated: true,
            check_ts_count_for_create_table: true,
            table_locations_ttl: Duration::from_secs(5 * 60),
            wait_for_new_tablets_to_elect_leader: true,
            evict_excess_replicas: true,
            prepare_replacement_before_eviction: false,
            replace_replica_without_majority: false,
        }
    }
}
