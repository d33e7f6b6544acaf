//! Retrying master-to-tablet-server admin tasks.
//!
//! One task struct covers every outgoing admin call, parameterized by a
//! request kind and a replica picker. Each attempt re-resolves its target
//! from the fleet, so a re-registered server is picked up transparently.
//! Retries use exponential backoff with jitter against both a per-attempt
//! RPC timeout and an overall task deadline. Completion detaches the task
//! from its owning table; completions that change catalog state are posted
//! onto the manager's event queue instead of mutating shared state from the
//! callback path.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::mpsc;

use crate::directory::{PendingTask, TableInfo, TabletInfo};
use crate::fleet::Fleet;
use crate::metadata::{MemberKind, RaftPeer, TsId, INVALID_OPID_INDEX};
use crate::ts_admin::{
    AlterSchemaRequest, ChangeConfigRequest, ConfigChange, CreateTabletRequest,
    DeleteTabletRequest, TabletDataState, TsAdminError, TsErrorCode,
};

/// Deadline granted to tasks that must not expire (config changes).
const EFFECTIVELY_FOREVER: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    Running = 0,
    Complete = 1,
    Failed = 2,
    Aborted = 3,
}

impl TaskState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => TaskState::Running,
            1 => TaskState::Complete,
            2 => TaskState::Failed,
            _ => TaskState::Aborted,
        }
    }
}

/// What a task sends, and to whom.
#[derive(Debug, Clone)]
pub enum TaskSpec {
    /// `CreateTablet` to one specific server; the payload is snapshotted at
    /// task creation so a concurrent alter cannot tear it.
    CreateReplica {
        target: TsId,
        request: CreateTabletRequest,
    },
    /// `DeleteTablet` to one specific server.
    DeleteReplica {
        target: TsId,
        mode: TabletDataState,
        cas_config_opid_index: Option<i64>,
        reason: String,
    },
    /// `AlterSchema` to the tablet's current leader; the schema is read
    /// fresh from the table on every attempt.
    AlterSchema,
    /// `ChangeConfig(ADD_PEER)` to the leader. The target server is chosen
    /// at send time from the live fleet.
    AddReplica {
        member_type: MemberKind,
        cas_config_opid_index: i64,
    },
    /// `ChangeConfig(REMOVE_PEER)` to the leader.
    EvictReplica {
        uuid: TsId,
        cas_config_opid_index: i64,
    },
}

impl TaskSpec {
    fn name(&self) -> &'static str {
        match self {
            TaskSpec::CreateReplica { .. } => "CreateTablet",
            TaskSpec::DeleteReplica { .. } => "DeleteTablet",
            TaskSpec::AlterSchema => "AlterSchema",
            TaskSpec::AddReplica { .. } => "ChangeConfig(AddPeer)",
            TaskSpec::EvictReplica { .. } => "ChangeConfig(RemovePeer)",
        }
    }

    /// Config changes carry their CAS index and wait out leader churn
    /// rather than expiring.
    fn never_times_out(&self) -> bool {
        matches!(
            self,
            TaskSpec::AddReplica { .. } | TaskSpec::EvictReplica { .. }
        )
    }

    fn cas_opid_index(&self) -> Option<i64> {
        match self {
            TaskSpec::AddReplica {
                cas_config_opid_index,
                ..
            }
            | TaskSpec::EvictReplica {
                cas_config_opid_index,
                ..
            } => Some(*cas_config_opid_index),
            _ => None,
        }
    }
}

/// Completions that change catalog state, drained by the catalog manager.
pub enum TaskEvent {
    /// A tablet acknowledged running at `schema_version`.
    SchemaVersionAccepted {
        tablet: Arc<TabletInfo>,
        schema_version: u64,
    },
    /// A replica was deleted from (or was already gone from) a server.
    ReplicaDeleted {
        tablet: Arc<TabletInfo>,
        ts_uuid: TsId,
    },
}

/// Shared task plumbing handed out by the catalog manager.
#[derive(Clone)]
pub struct TaskContext {
    pub fleet: Arc<dyn Fleet>,
    pub events: mpsc::UnboundedSender<TaskEvent>,
    pub rpc_timeout: Duration,
    pub task_timeout: Duration,
    pub next_task_id: Arc<AtomicU64>,
}

impl TaskContext {
    /// Build and launch one retrying task. The task registers with `table`'s
    /// pending set unless it is floating (its table has been dropped).
    pub fn spawn(
        &self,
        spec: TaskSpec,
        tablet: Arc<TabletInfo>,
        table: Option<Arc<TableInfo>>,
    ) -> Arc<TsTask> {
        let timeout = if spec.never_times_out() {
            EFFECTIVELY_FOREVER
        } else {
            self.task_timeout
        };
        let task = Arc::new(TsTask {
            id: self.next_task_id.fetch_add(1, Ordering::Relaxed),
            spec,
            tablet,
            table,
            fleet: self.fleet.clone(),
            events: self.events.clone(),
            state: AtomicU8::new(TaskState::Running as u8),
            attempt: AtomicU32::new(0),
            deadline: Instant::now() + timeout,
            rpc_timeout: self.rpc_timeout,
        });
        if let Some(table) = &task.table {
            table.add_task(task.clone());
        }
        tokio::spawn(run_task(task.clone()));
        task
    }
}

pub struct TsTask {
    id: u64,
    spec: TaskSpec,
    tablet: Arc<TabletInfo>,
    table: Option<Arc<TableInfo>>,
    fleet: Arc<dyn Fleet>,
    events: mpsc::UnboundedSender<TaskEvent>,
    state: AtomicU8,
    attempt: AtomicU32,
    deadline: Instant,
    rpc_timeout: Duration,
}

enum AttemptOutcome {
    Success,
    /// Terminal response; retrying would never help.
    Fatal(String),
    Retry(String),
    /// The task's premise no longer holds.
    Obsolete(String),
}

impl TsTask {
    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt.load(Ordering::SeqCst)
    }

    fn transition(&self, to: TaskState) -> bool {
        self.state
            .compare_exchange(
                TaskState::Running as u8,
                to as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    fn detach(&self) {
        if let Some(table) = &self.table {
            table.remove_task(self.id);
        }
    }

    /// Target uuid for the next attempt.
    fn pick_target(&self) -> Result<TsId, String> {
        match &self.spec {
            TaskSpec::CreateReplica { target, .. } => Ok(target.clone()),
            TaskSpec::DeleteReplica { target, .. } => Ok(target.clone()),
            TaskSpec::AlterSchema
            | TaskSpec::AddReplica { .. }
            | TaskSpec::EvictReplica { .. } => {
                let meta = self.tablet.read();
                meta.consensus_state
                    .as_ref()
                    .and_then(|c| c.leader_uuid.clone())
                    .ok_or_else(|| "tablet has no known leader".to_string())
            }
        }
    }

    async fn send_attempt(&self) -> AttemptOutcome {
        // A config change planned against a stale committed config is dead
        // on arrival; stop before sending.
        if let Some(cas) = self.spec.cas_opid_index() {
            let current = self
                .tablet
                .read()
                .consensus_state
                .as_ref()
                .map(|c| c.committed_config.opid_index)
                .unwrap_or(INVALID_OPID_INDEX);
            if current > cas {
                return AttemptOutcome::Obsolete(format!(
                    "committed config advanced to index {current} past {cas}"
                ));
            }
        }

        let target = match self.pick_target() {
            Ok(target) => target,
            Err(reason) => return AttemptOutcome::Retry(reason),
        };
        let Some(descriptor) = self.fleet.lookup(&target) else {
            return AttemptOutcome::Retry(format!("tablet server {target} is not registered"));
        };
        let proxy = descriptor.admin();

        let rpc_timeout = self
            .rpc_timeout
            .min(self.deadline.saturating_duration_since(Instant::now()));
        let mut sent_schema_version = None;
        let call = async {
            match &self.spec {
                TaskSpec::CreateReplica { request, .. } => {
                    proxy.create_tablet(request.clone()).await
                }
                TaskSpec::DeleteReplica {
                    mode,
                    cas_config_opid_index,
                    reason,
                    ..
                } => {
                    proxy
                        .delete_tablet(DeleteTabletRequest {
                            tablet_id: self.tablet.id().clone(),
                            mode: *mode,
                            cas_config_opid_index: *cas_config_opid_index,
                            reason: reason.clone(),
                        })
                        .await
                }
                TaskSpec::AlterSchema => {
                    let (schema, version, name) = {
                        let table = self
                            .table
                            .as_ref()
                            .expect("alter tasks always have a table");
                        let meta = table.read();
                        (meta.schema.clone(), meta.version, meta.name.clone())
                    };
                    sent_schema_version = Some(version);
                    proxy
                        .alter_schema(AlterSchemaRequest {
                            tablet_id: self.tablet.id().clone(),
                            schema,
                            schema_version: version,
                            new_table_name: name,
                        })
                        .await
                }
                TaskSpec::AddReplica {
                    member_type,
                    cas_config_opid_index,
                } => {
                    let peer = match self.pick_new_peer(*member_type) {
                        Some(peer) => peer,
                        None => {
                            return Err(TsAdminError::new(
                                TsErrorCode::Unavailable,
                                "no live tablet server outside the config",
                            ))
                        }
                    };
                    proxy
                        .change_config(ChangeConfigRequest {
                            tablet_id: self.tablet.id().clone(),
                            change: ConfigChange::AddPeer(peer),
                            cas_config_opid_index: *cas_config_opid_index,
                        })
                        .await
                }
                TaskSpec::EvictReplica {
                    uuid,
                    cas_config_opid_index,
                } => {
                    proxy
                        .change_config(ChangeConfigRequest {
                            tablet_id: self.tablet.id().clone(),
                            change: ConfigChange::RemovePeer(uuid.clone()),
                            cas_config_opid_index: *cas_config_opid_index,
                        })
                        .await
                }
            }
        };

        let result = match tokio::time::timeout(rpc_timeout, call).await {
            Ok(result) => result,
            Err(_) => return AttemptOutcome::Retry("rpc timed out".to_string()),
        };

        match result {
            Ok(()) => {
                self.emit_success_event(&target, sent_schema_version);
                AttemptOutcome::Success
            }
            Err(err) => self.classify_error(err, &target),
        }
    }

    fn emit_success_event(&self, target: &str, sent_schema_version: Option<u64>) {
        match &self.spec {
            TaskSpec::AlterSchema => {
                if let Some(schema_version) = sent_schema_version {
                    let _ = self.events.send(TaskEvent::SchemaVersionAccepted {
                        tablet: self.tablet.clone(),
                        schema_version,
                    });
                }
            }
            TaskSpec::DeleteReplica { .. } => {
                let _ = self.events.send(TaskEvent::ReplicaDeleted {
                    tablet: self.tablet.clone(),
                    ts_uuid: target.to_string(),
                });
            }
            _ => {}
        }
    }

    fn classify_error(&self, err: TsAdminError, target: &str) -> AttemptOutcome {
        match (&self.spec, err.code) {
            // The replica is already gone; nothing left to do.
            (TaskSpec::DeleteReplica { .. }, TsErrorCode::TabletNotFound) => {
                let _ = self.events.send(TaskEvent::ReplicaDeleted {
                    tablet: self.tablet.clone(),
                    ts_uuid: target.to_string(),
                });
                AttemptOutcome::Fatal(format!("replica already deleted: {err}"))
            }
            (TaskSpec::DeleteReplica { .. }, TsErrorCode::CasFailed) => {
                AttemptOutcome::Fatal(format!("cas failed: {err}"))
            }
            (
                TaskSpec::AlterSchema,
                TsErrorCode::TabletNotFound
                | TsErrorCode::MismatchedSchema
                | TsErrorCode::TabletHasANewerSchema,
            ) => AttemptOutcome::Fatal(err.to_string()),
            (
                TaskSpec::AddReplica { .. } | TaskSpec::EvictReplica { .. },
                TsErrorCode::CasFailed,
            ) => AttemptOutcome::Obsolete(format!("config change lost the race: {err}")),
            _ => AttemptOutcome::Retry(err.to_string()),
        }
    }

    /// Choose a server for a new replica: live, not already in the config,
    /// picked power-of-two-choices style.
    fn pick_new_peer(&self, member_type: MemberKind) -> Option<RaftPeer> {
        let existing: std::collections::HashSet<TsId> = {
            let meta = self.tablet.read();
            meta.consensus_state
                .as_ref()
                .map(|c| {
                    c.committed_config
                        .peers
                        .iter()
                        .map(|p| p.uuid.clone())
                        .collect()
                })
                .unwrap_or_default()
        };
        let candidates = self.fleet.live_descriptors();
        let mut rng = rand::thread_rng();
        let pick = crate::placement::select_replica(&candidates, &existing, &mut rng)?;
        let mut peer = match member_type {
            MemberKind::Voter => RaftPeer::voter(pick.uuid()),
            MemberKind::NonVoter => RaftPeer::non_voter(pick.uuid()),
        };
        peer.last_known_addr = Some(pick.rpc_addr().to_string());
        // New non-voters are staged replacements and get promoted on
        // catch-up.
        peer.promote = member_type == MemberKind::NonVoter;
        Some(peer)
    }
}

impl PendingTask for TsTask {
    fn task_id(&self) -> u64 {
        self.id
    }

    fn description(&self) -> String {
        format!("{} for tablet {}", self.spec.name(), self.tablet.id())
    }

    fn abort(&self) {
        self.transition(TaskState::Aborted);
    }
}

/// Exponential backoff with jitter, bounded by the task deadline.
///
/// Returns `None` when there is no room for another attempt: the base delay
/// doubles from 16ms, capped at one minute, plus up to 49ms of jitter, and
/// the whole thing is clamped to the remaining budget minus the ~10ms we
/// assume the next attempt needs.
fn backoff_delay<R: Rng>(attempt: u32, remaining: Duration, rng: &mut R) -> Option<Duration> {
    let base_ms: u64 = if attempt <= 12 {
        1u64 << (attempt + 3)
    } else {
        60_000
    };
    let jitter_ms: u64 = rng.gen_range(0..50);
    let millis_remaining = remaining.as_millis() as i64 - 10;
    let delay_ms = ((base_ms + jitter_ms) as i64).min(millis_remaining);
    if delay_ms <= 0 {
        return None;
    }
    Some(Duration::from_millis(delay_ms as u64))
}

async fn run_task(task: Arc<TsTask>) {
    loop {
        if task.state() != TaskState::Running {
            break;
        }
        let attempt = task.attempt.fetch_add(1, Ordering::SeqCst) + 1;
        match task.send_attempt().await {
            AttemptOutcome::Success => {
                tracing::debug!(
                    task = %task.description(),
                    attempt,
                    "admin task complete"
                );
                task.transition(TaskState::Complete);
                break;
            }
            AttemptOutcome::Fatal(reason) => {
                // Terminal server responses end the task; retrying cannot
                // change the answer.
                tracing::info!(task = %task.description(), attempt, reason = %reason, "admin task finished on terminal response");
                task.transition(TaskState::Complete);
                break;
            }
            AttemptOutcome::Obsolete(reason) => {
                tracing::info!(task = %task.description(), attempt, reason = %reason, "admin task aborted");
                task.transition(TaskState::Aborted);
                break;
            }
            AttemptOutcome::Retry(reason) => {
                let remaining = task.deadline.saturating_duration_since(Instant::now());
                let delay = {
                    let mut rng = rand::thread_rng();
                    backoff_delay(attempt, remaining, &mut rng)
                };
                match delay {
                    Some(delay) => {
                        tracing::debug!(
                            task = %task.description(),
                            attempt,
                            reason = %reason,
                            delay_ms = delay.as_millis() as u64,
                            "retrying admin task"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        tracing::warn!(task = %task.description(), attempt, reason = %reason, "admin task deadline exhausted");
                        task.transition(TaskState::Failed);
                        break;
                    }
                }
            }
        }
    }
    task.detach();
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    #[test]
    fn backoff_doubles_then_caps() {
        let mut rng = SmallRng::seed_from_u64(1);
        let budget = Duration::from_secs(3600);
        let d1 = backoff_delay(1, budget, &mut rng).unwrap();
        assert!(d1 >= Duration::from_millis(16) && d1 < Duration::from_millis(66));
        let d5 = backoff_delay(5, budget, &mut rng).unwrap();
        assert!(d5 >= Duration::from_millis(256) && d5 < Duration::from_millis(306));
        let d20 = backoff_delay(20, budget, &mut rng).unwrap();
        assert!(d20 >= Duration::from_millis(60_000) && d20 < Duration::from_millis(60_050));
    }

    #[test]
    fn backoff_fails_when_budget_exhausted() {
        let mut rng = SmallRng::seed_from_u64(1);
        assert!(backoff_delay(1, Duration::from_millis(5), &mut rng).is_none());
        assert!(backoff_delay(1, Duration::ZERO, &mut rng).is_none());
    }

    #[test]
    fn backoff_clamps_to_remaining_budget() {
        let mut rng = SmallRng::seed_from_u64(1);
        let delay = backoff_delay(12, Duration::from_millis(100), &mut rng).unwrap();
        assert_eq!(delay, Duration::from_millis(90));
    }
}
