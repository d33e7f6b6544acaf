//! Background assignment reconciler.
//!
//! One dedicated worker advances tablets through their creation state
//! machine: fresh tablets get replicas selected and create RPCs dispatched,
//! and tablets whose creation stalled past the timeout are replaced with a
//! freshly minted tablet over the same partition. The same worker drives
//! periodic token-signing-key generation and rotation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use crate::catalog::CatalogManager;
use crate::directory::{commit_group, lock_tablet_group, sort_tablets_by_id, TabletInfo};
use crate::metadata::{
    ConsensusState, PersistentTablet, RaftConfig, RaftPeer, TabletState, INVALID_OPID_INDEX,
};
use crate::new_object_id;
use crate::placement::select_replicas;
use crate::sys_catalog::CatalogActions;
use crate::tasks::TaskSpec;
use crate::ts_admin::CreateTabletRequest;

/// Launch the reconciler for a catalog manager. The worker parks on the
/// wake notifier with the configured wait and exits when the catalog
/// closes.
pub(crate) fn spawn(catalog: Arc<CatalogManager>) {
    tokio::spawn(run(catalog));
}

async fn run(catalog: Arc<CatalogManager>) {
    let wake = catalog.reconciler_wake();
    let wait = catalog.config().bg_task_wait;
    loop {
        tokio::select! {
            _ = wake.notified() => {}
            _ = tokio::time::sleep(wait) => {}
        }
        if catalog.is_closing() {
            break;
        }
        let Ok(guard) = catalog.leader_shared_lock().await else {
            continue;
        };

        let to_process = catalog.extract_tablets_to_process();
        if !to_process.is_empty() {
            if let Err(err) = catalog.process_pending_assignments(to_process).await {
                // Likely a leadership change mid-write; the next cycle (or
                // the next leader) picks the work back up.
                tracing::error!(error = ?err, "error processing pending assignments");
            }
        }

        if let Err(err) = catalog.try_generate_new_tsk().await {
            if catalog.has_term_changed(&guard) {
                tracing::info!(
                    error = ?err,
                    "failed to refresh token signing key; ignoring since no longer the leader"
                );
            } else if catalog.token_signer().is_current_key_valid() {
                tracing::warn!(
                    error = ?err,
                    "failed to refresh token signing key; will retry next cycle"
                );
            } else {
                // No valid signing key and no term change to explain it: a
                // leader that cannot sign tokens must make way for one that
                // can.
                tracing::error!(error = ?err, "token signer has no valid key");
                panic!("shutting down: failed to refresh token signing key: {err:#}");
            }
        }
    }
    tracing::info!("assignment reconciler exiting");
}

impl CatalogManager {
    /// Drive every non-running, non-deleted tablet one step forward:
    /// `Preparing` tablets move to `Creating` and get create RPCs;
    /// `Creating` tablets past the creation timeout are replaced.
    pub(crate) async fn process_pending_assignments(
        &self,
        mut tablets: Vec<Arc<TabletInfo>>,
    ) -> anyhow::Result<()> {
        sort_tablets_by_id(&mut tablets);
        let mut guards = lock_tablet_group(&tablets).await;

        let now = Instant::now();
        let timeout = self.config().tablet_creation_timeout;
        let mut to_update: Vec<usize> = Vec::new();
        let mut needs_create: Vec<usize> = Vec::new();
        let mut replacements: Vec<Arc<TabletInfo>> = Vec::new();

        for (i, tablet) in tablets.iter().enumerate() {
            match guards[i].data().state {
                TabletState::Preparing => {
                    guards[i]
                        .mutate()
                        .set_state(TabletState::Creating, "sending initial creation of tablet");
                    to_update.push(i);
                    needs_create.push(i);
                }
                TabletState::Creating => {
                    // A tablet with no recorded create time was loaded by a
                    // fresh leader; its creation round is long lost.
                    let expired = tablet
                        .last_create_time()
                        .map(|at| now.saturating_duration_since(at) >= timeout)
                        .unwrap_or(true);
                    if !expired {
                        continue;
                    }
                    let replacement_id = new_object_id();
                    tracing::warn!(
                        tablet = %tablet.id(),
                        replacement = %replacement_id,
                        "tablet was not created within the allowed timeout; replacing"
                    );
                    let record = PersistentTablet {
                        state: TabletState::Creating,
                        table_id: guards[i].data().table_id.clone(),
                        partition: guards[i].data().partition.clone(),
                        consensus_state: None,
                        state_msg: format!("replacement for tablet {}", tablet.id()),
                    };
                    let replacement =
                        TabletInfo::new(replacement_id.clone(), tablet.table().clone(), record);
                    guards[i].mutate().set_state(
                        TabletState::Replaced,
                        format!("replaced by tablet {replacement_id}"),
                    );
                    to_update.push(i);
                    replacements.push(replacement);
                }
                _ => {}
            }
        }

        if to_update.is_empty() && replacements.is_empty() {
            return Ok(());
        }

        // Select replicas for every tablet that needs a create round.
        let ts_descs = self.fleet().live_descriptors();
        let mut num_replicas_by_table: HashMap<String, u32> = HashMap::new();
        for tablet in needs_create
            .iter()
            .map(|&i| &tablets[i])
            .chain(replacements.iter())
        {
            let table = tablet.table();
            let n = *num_replicas_by_table
                .entry(table.id().clone())
                .or_insert_with(|| table.read().num_replicas);
            if ts_descs.len() < n as usize {
                anyhow::bail!(
                    "not enough live tablet servers to place {n} replicas of tablet {}; \
                     {} are alive",
                    tablet.id(),
                    ts_descs.len()
                );
            }
        }

        let mut replacement_guards = lock_tablet_group(&replacements).await;
        {
            let mut rng = rand::thread_rng();
            for &i in &needs_create {
                let n = num_replicas_by_table[&guards[i].data().table_id];
                let config = build_initial_config(&select_replicas(&ts_descs, n as usize, &mut rng));
                guards[i].mutate().consensus_state = Some(ConsensusState::new(0, config));
            }
            for (guard, tablet) in replacement_guards.iter_mut().zip(&replacements) {
                let n = num_replicas_by_table[tablet.table().id()];
                let config = build_initial_config(&select_replicas(&ts_descs, n as usize, &mut rng));
                guard.mutate().consensus_state = Some(ConsensusState::new(0, config));
            }
        }

        let actions = CatalogActions {
            tablets_to_add: replacements
                .iter()
                .zip(&replacement_guards)
                .map(|(t, g)| (t.id().clone(), g.dirty().clone()))
                .collect(),
            tablets_to_update: to_update
                .iter()
                .map(|&i| (tablets[i].id().clone(), guards[i].dirty().clone()))
                .collect(),
            ..Default::default()
        };
        self.sys_write(actions).await.map_err(anyhow::Error::from)?;

        // Expose the replacements before the tablets they supersede.
        commit_group(replacement_guards);
        commit_group(guards);

        for replacement in &replacements {
            replacement
                .table()
                .add_remove_tablets(std::slice::from_ref(replacement), &[]);
        }
        self.publish_tablets(&replacements);

        // Replaced tablets get their replicas deleted; new and promoted
        // tablets get their create fan-out.
        for &i in &to_update {
            let record = tablets[i].read().clone();
            if record.state == TabletState::Replaced {
                self.send_delete_replica_rpcs(
                    &tablets[i],
                    &record,
                    "tablet replaced after creation timeout",
                );
            }
        }
        for tablet in needs_create.iter().map(|&i| &tablets[i]).chain(&replacements) {
            self.send_create_tablet_rpcs(tablet);
        }
        Ok(())
    }

    fn send_create_tablet_rpcs(&self, tablet: &Arc<TabletInfo>) {
        let table = tablet.table().clone();
        let (table_name, schema, partition_schema) = {
            let record = table.read();
            (
                record.name.clone(),
                record.schema.clone(),
                record.partition_schema.clone(),
            )
        };
        let (partition, config) = {
            let record = tablet.read();
            let Some(cstate) = record.consensus_state.clone() else {
                return;
            };
            (record.partition.clone(), cstate.committed_config)
        };
        tablet.set_last_create_time(Instant::now());

        let ctx = self.task_context();
        for peer in &config.peers {
            ctx.spawn(
                TaskSpec::CreateReplica {
                    target: peer.uuid.clone(),
                    request: CreateTabletRequest {
                        tablet_id: tablet.id().clone(),
                        table_id: table.id().clone(),
                        table_name: table_name.clone(),
                        schema: schema.clone(),
                        partition_schema: partition_schema.clone(),
                        partition: partition.clone(),
                        config: config.clone(),
                    },
                },
                tablet.clone(),
                Some(table.clone()),
            );
        }
    }
}

fn build_initial_config(selected: &[Arc<crate::fleet::TsDescriptor>]) -> RaftConfig {
    RaftConfig {
        opid_index: INVALID_OPID_INDEX,
        peers: selected
            .iter()
            .map(|d| {
                let mut peer = RaftPeer::voter(d.uuid());
                peer.last_known_addr = Some(d.rpc_addr().to_string());
                peer
            })
            .collect(),
    }
}
