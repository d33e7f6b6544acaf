//! Tablet-report processing: reconciling reported state with desired state.
//!
//! Reports flow from tablet servers through the heartbeat path. Each report
//! entry may mutate the tablet's cached consensus state, transition a
//! creating tablet to running, queue deletions for stale or evicted
//! replicas, and trigger placement repair. All tablet mutations from one
//! report batch are persisted in a single system-tablet write and committed
//! together.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::catalog::CatalogManager;
use crate::directory::{commit_group, lock_tablet_group, TabletInfo};
use crate::error::MasterResult;
use crate::metadata::{MemberKind, TableState, TabletState, INVALID_OPID_INDEX};
use crate::placement::{should_add_replica, should_evict_replica, MajorityHealthPolicy};
use crate::rpc::{ReportedTablet, ReportedTabletUpdate, TabletReport, TabletReportUpdates};
use crate::sys_catalog::CatalogActions;
use crate::tasks::TaskSpec;
use crate::ts_admin::TabletDataState;

impl CatalogManager {
    /// Process one tablet server's report batch.
    pub async fn process_tablet_report(
        &self,
        ts_uuid: &str,
        report: TabletReport,
    ) -> MasterResult<TabletReportUpdates> {
        let _guard = self.leader_shared_lock().await?;

        tracing::debug!(
            ts = %ts_uuid,
            tablets = report.updated_tablets.len(),
            "processing tablet report"
        );

        // Resolve reported tablets; when the same tablet appears twice the
        // last entry wins. Unknown ids are ignored: a rogue master must not
        // initiate deletions it cannot justify.
        let mut by_id: BTreeMap<String, (Arc<TabletInfo>, ReportedTablet)> = BTreeMap::new();
        for reported in report.updated_tablets {
            match self.find_tablet(&reported.tablet_id) {
                Some(tablet) => {
                    by_id.insert(reported.tablet_id.clone(), (tablet, reported));
                }
                None => {
                    tracing::warn!(
                        tablet = %reported.tablet_id,
                        ts = %ts_uuid,
                        "ignoring report from unknown tablet"
                    );
                }
            }
        }

        // Lock the whole batch in id order (BTreeMap iteration order).
        let tablets: Vec<Arc<TabletInfo>> = by_id.values().map(|(t, _)| t.clone()).collect();
        let reports: Vec<&ReportedTablet> = by_id.values().map(|(_, r)| r).collect();
        let mut guards = lock_tablet_group(&tablets).await;

        let mut mutated: BTreeSet<usize> = BTreeSet::new();
        let mut rpcs: Vec<(TaskSpec, Arc<TabletInfo>)> = Vec::new();
        let mut state_msgs: Vec<Option<String>> = vec![None; tablets.len()];
        let mut schema_reports: Vec<(Arc<TabletInfo>, u64)> = Vec::new();

        for i in 0..tablets.len() {
            let tablet = &tablets[i];
            let reported = reports[i];
            let table = tablet.table().clone();
            let (table_deleted, table_state_msg, replication_factor, table_version) = {
                let record = table.read();
                (
                    record.is_deleted(),
                    record.state_msg.clone(),
                    record.num_replicas,
                    record.version,
                )
            };
            let guard = &mut guards[i];

            // A reported tablet whose tablet or table is gone gets deleted
            // on the reporting server.
            if guard.data().is_deleted() || table_deleted {
                let msg = if guard.data().is_deleted() {
                    guard.data().state_msg.clone()
                } else {
                    table_state_msg
                };
                tracing::info!(
                    tablet = %tablet.id(),
                    ts = %ts_uuid,
                    msg = %msg,
                    "deleted tablet reported; requesting deletion"
                );
                state_msgs[i] = Some(msg.clone());
                rpcs.push((
                    TaskSpec::DeleteReplica {
                        target: ts_uuid.to_string(),
                        mode: TabletDataState::Deleted,
                        cas_config_opid_index: None,
                        reason: msg,
                    },
                    tablet.clone(),
                ));
                continue;
            }

            let prev_cstate = guard.data().consensus_state.clone();
            let prev_opid = prev_cstate
                .as_ref()
                .map(|c| c.committed_config.opid_index)
                .unwrap_or(INVALID_OPID_INDEX);
            let report_opid = reported.committed_opid_index().unwrap_or(INVALID_OPID_INDEX);

            // Tombstone a replica that is no longer in the committed config.
            // Only when the report's config is strictly older than ours: a
            // replica that was just added may still be copying, and the CAS
            // on the previous opid index keeps the delete from racing a
            // newer config.
            if self.config().tombstone_evicted_replicas
                && reported.data_state == TabletDataState::Ready
                && prev_cstate
                    .as_ref()
                    .map(|c| !c.committed_config.is_member(ts_uuid))
                    .unwrap_or(false)
                && report_opid < prev_opid
            {
                let reason = if report_opid == INVALID_OPID_INDEX {
                    "replica has no consensus available".to_string()
                } else {
                    format!("replica with old config index {report_opid}")
                };
                rpcs.push((
                    TaskSpec::DeleteReplica {
                        target: ts_uuid.to_string(),
                        mode: TabletDataState::Tombstoned,
                        cas_config_opid_index: Some(prev_opid),
                        reason: format!(
                            "{reason} (current committed config index is {prev_opid})"
                        ),
                    },
                    tablet.clone(),
                ));
                continue;
            }

            // A replica that failed on the server: log and move on.
            if let Some(error) = &reported.error {
                tracing::warn!(
                    tablet = %tablet.id(),
                    ts = %ts_uuid,
                    error = %error,
                    "tablet failed on tablet server"
                );
                continue;
            }

            let mut consensus_state_updated = false;
            let mut effective_cstate = None;
            if let Some(reported_cstate) = &reported.consensus_state {
                // Replicas without a committed config (e.g. tombstoned ones
                // with no consensus metadata) carry nothing cacheable.
                if reported_cstate.committed_config.peers.is_empty() {
                    continue;
                }

                let mut cstate = reported_cstate.clone();
                cstate.clear_unknown_leader();

                let accept = match &prev_cstate {
                    None => true,
                    Some(prev) => {
                        cstate.committed_config.opid_index > prev.committed_config.opid_index
                            || (cstate.leader_uuid.is_some()
                                && (prev.leader_uuid.is_none()
                                    || cstate.current_term > prev.current_term))
                    }
                };

                // Same-term leader disagreement is consensus divergence;
                // abandon the entry.
                if let Some(prev) = &prev_cstate {
                    if accept
                        && cstate.current_term == prev.current_term
                        && cstate.leader_uuid.is_some()
                        && prev.leader_uuid.is_some()
                        && cstate.leader_uuid != prev.leader_uuid
                    {
                        tracing::error!(
                            tablet = %tablet.id(),
                            term = cstate.current_term,
                            prev_leader = ?prev.leader_uuid,
                            new_leader = ?cstate.leader_uuid,
                            "two leaders reported for the same term; abandoning report entry"
                        );
                        continue;
                    }
                }

                // Wait for a leader before declaring a creating tablet
                // running, or a minority-successful create could look done
                // forever.
                if guard.data().state == TabletState::Creating {
                    let leader_elected = cstate.leader_uuid.is_some()
                        && cstate.has_voter_leader();
                    if !self.config().wait_for_new_tablets_to_elect_leader || leader_elected {
                        guard.mutate().set_state(
                            TabletState::Running,
                            "tablet reported with an active leader",
                        );
                        mutated.insert(i);
                    }
                }

                if accept {
                    // Keep leader knowledge across a same-term report from a
                    // follower that does not know the leader yet.
                    if let Some(prev) = &prev_cstate {
                        if cstate.current_term == prev.current_term
                            && cstate.leader_uuid.is_none()
                            && prev.leader_uuid.is_some()
                        {
                            cstate.leader_uuid = prev.leader_uuid.clone();
                        }
                    }

                    tracing::info!(
                        tablet = %tablet.id(),
                        ts = %ts_uuid,
                        term = cstate.current_term,
                        opid_index = cstate.committed_config.opid_index,
                        leader = ?cstate.leader_uuid,
                        "accepted consensus state change"
                    );

                    let mut persisted = cstate.clone();
                    persisted.strip_health();
                    guard.mutate().consensus_state = Some(persisted);
                    mutated.insert(i);
                    consensus_state_updated = true;

                    // Peers dropped from the config get tombstoned, CAS'd on
                    // the new committed index.
                    if self.config().tombstone_evicted_replicas {
                        if let Some(prev) = &prev_cstate {
                            for peer in &prev.committed_config.peers {
                                if !cstate.committed_config.is_member(&peer.uuid) {
                                    rpcs.push((
                                        TaskSpec::DeleteReplica {
                                            target: peer.uuid.clone(),
                                            mode: TabletDataState::Tombstoned,
                                            cas_config_opid_index: Some(
                                                cstate.committed_config.opid_index,
                                            ),
                                            reason: format!(
                                                "server not in new config with opid index {}",
                                                cstate.committed_config.opid_index
                                            ),
                                        },
                                        tablet.clone(),
                                    ));
                                }
                            }
                        }
                    }
                }
                effective_cstate = Some(cstate);
            }

            // Placement adjustments, in whichever mode is configured.
            if let Some(cstate) = &effective_cstate {
                if !self.config().prepare_replacement_before_eviction {
                    if consensus_state_updated
                        && self.config().add_replica_when_underreplicated
                        && cstate.committed_config.count_voters()
                            < replication_factor as usize
                    {
                        rpcs.push((
                            TaskSpec::AddReplica {
                                member_type: MemberKind::Voter,
                                cas_config_opid_index: cstate.committed_config.opid_index,
                            },
                            tablet.clone(),
                        ));
                    }
                } else if cstate.pending_config.is_none()
                    && cstate.leader_uuid.as_deref() == Some(ts_uuid)
                {
                    // Replacement decisions ride on the health the leader
                    // reports; non-leader reports carry none.
                    let policy = if self.config().replace_replica_without_majority {
                        MajorityHealthPolicy::Ignore
                    } else {
                        MajorityHealthPolicy::Honor
                    };
                    let to_evict = self.config().evict_excess_replicas.then(|| {
                        should_evict_replica(
                            &cstate.committed_config,
                            ts_uuid,
                            replication_factor,
                            policy,
                        )
                    });
                    if let Some(Some(uuid)) = to_evict {
                        rpcs.push((
                            TaskSpec::EvictReplica {
                                uuid,
                                cas_config_opid_index: cstate.committed_config.opid_index,
                            },
                            tablet.clone(),
                        ));
                    } else if self.config().add_replica_when_underreplicated
                        && should_add_replica(
                            &cstate.committed_config,
                            replication_factor,
                            policy,
                        )
                    {
                        rpcs.push((
                            TaskSpec::AddReplica {
                                member_type: MemberKind::NonVoter,
                                cas_config_opid_index: cstate.committed_config.opid_index,
                            },
                            tablet.clone(),
                        ));
                    }
                }
            }

            // Stale schema versions get an AlterSchema; newer-than-ours is
            // corruption.
            if let Some(version) = reported.schema_version {
                if version != table_version {
                    if version > table_version {
                        tracing::error!(
                            tablet = %tablet.id(),
                            ts = %ts_uuid,
                            reported = version,
                            current = table_version,
                            "tablet reported a schema version newer than the table's (corruption)"
                        );
                    } else {
                        tracing::info!(
                            tablet = %tablet.id(),
                            ts = %ts_uuid,
                            reported = version,
                            current = table_version,
                            "tablet is behind on schema; requesting alter"
                        );
                        rpcs.push((TaskSpec::AlterSchema, tablet.clone()));
                    }
                }
                schema_reports.push((tablet.clone(), version));
            }
        }

        // Persist every mutated tablet in one batch; only then commit the
        // in-memory state.
        let actions = CatalogActions {
            tablets_to_update: mutated
                .iter()
                .map(|&i| (tablets[i].id().clone(), guards[i].dirty().clone()))
                .collect(),
            ..Default::default()
        };
        if !actions.is_empty() {
            if let Err(err) = self.sys_write(actions).await {
                tracing::error!(
                    ts = %ts_uuid,
                    error = %err,
                    "failed to persist tablet report mutations"
                );
                return Err(err);
            }
        }
        commit_group(guards);

        // Feed reported schema versions into the tables' multisets, flipping
        // finished alters back to running.
        for (tablet, version) in schema_reports {
            self.handle_tablet_schema_version_report(&tablet, version).await;
        }

        // Fire the queued RPCs now that all state is committed.
        let ctx = self.task_context();
        for (spec, tablet) in rpcs {
            let table = tablet.table().clone();
            ctx.spawn(spec, tablet, Some(table));
        }

        let tablet_ids: Vec<String> = by_id.keys().cloned().collect();
        Ok(TabletReportUpdates {
            tablets: tablet_ids
                .into_iter()
                .enumerate()
                .map(|(i, tablet_id)| ReportedTabletUpdate {
                    tablet_id,
                    state_msg: state_msgs[i].clone().unwrap_or_default(),
                })
                .collect(),
        })
    }

    /// Record a tablet's reported schema version; when the last straggler
    /// catches up to an in-progress alter, flip the table back to running
    /// and drop the fully-applied schema.
    pub(crate) async fn handle_tablet_schema_version_report(
        &self,
        tablet: &Arc<TabletInfo>,
        version: u64,
    ) {
        tablet.set_reported_schema_version(version);

        let table = tablet.table().clone();
        let mut guard = table.write().await;
        if guard.data().is_deleted() || guard.data().state != TableState::Altering {
            return;
        }
        let current = guard.data().version;
        if table.is_alter_in_progress(current) {
            return;
        }

        guard.mutate().fully_applied_schema = None;
        guard.mutate().set_state(
            TableState::Running,
            format!("current schema version={current}"),
        );

        let actions = CatalogActions {
            tables_to_update: vec![(table.id().clone(), guard.dirty().clone())],
            ..Default::default()
        };
        if let Err(err) = self.sys_write(actions).await {
            tracing::warn!(
                table = %table.id(),
                error = %err,
                "failed to persist alter completion"
            );
            return;
        }
        guard.commit();
        tracing::info!(table = %table.id(), version = current, "alter complete");
    }
}
