//! The catalog manager: leader-side directory of tables and tablets.
//!
//! Handler protocol: every request first acquires the leadership gate for
//! reading and verifies `(initialized, is_leader, leader_ready_term)`. The
//! gate is held for the whole handler body so the post-election prepare task
//! (which takes it for writing) cannot interleave. Mutations stage dirty
//! copies under metadata locks, persist through the system-catalog proxy,
//! and only then commit in memory; a failed durable write leaves no trace.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::SystemTime;

use tokio::sync::{mpsc, Notify};

use crate::config::MasterConfig;
use crate::directory::{
    commit_group, lock_tablet_group, sort_tablets_by_id, Directory, TableInfo, TabletInfo,
};
use crate::error::{MasterError, MasterErrorCode, MasterResult};
use crate::fleet::Fleet;
use crate::metadata::{PersistentTable, PersistentTablet, TableState, TabletState};
use crate::partition::{ranges_overlap, Partition};
use crate::rpc::{
    AlterTableRequest, AlterTableResponse, AlterTableStep, ConnectToMasterResponse,
    CreateTableRequest, CreateTableResponse, DeleteTableRequest, GetTableLocationsRequest,
    GetTableLocationsResponse, GetTableSchemaResponse, ListedTable, ReplicaLocation, ReplicaRole,
    ReplicaTypeFilter, TableIdent, TabletLocations, TskPublicKey,
};
use crate::schema::{
    validate_client_schema, validate_identifier, validate_replication_factor, SchemaBuilder,
};
use crate::security::{CertAuthority, TokenSigner};
use crate::sys_catalog::{ApplyError, CatalogActions, SysCatalog, SysTabletBackend};
use crate::tasks::{TaskContext, TaskEvent, TaskSpec};
use crate::ts_admin::TabletDataState;
use crate::{new_object_id, unix_time_secs};

/// Sentinel: no term has completed the leadership-prepare pipeline yet.
const NO_READY_TERM: i64 = -1;

pub struct CatalogManager {
    cfg: MasterConfig,
    sys: SysCatalog,
    fleet: Arc<dyn Fleet>,
    cert_authority: Arc<dyn CertAuthority>,
    token_signer: Arc<dyn TokenSigner>,

    directory: RwLock<Directory>,

    /// The leadership gate. Handlers read; the prepare task writes.
    leader_lock: tokio::sync::RwLock<()>,
    leader_ready_term: AtomicI64,
    /// Serializes prepare tasks (the single-threaded leader-init executor).
    prepare_serializer: tokio::sync::Mutex<()>,

    initialized: AtomicBool,
    closing: AtomicBool,
    shutdown: Notify,

    reconciler_wake: Arc<Notify>,
    events_tx: mpsc::UnboundedSender<TaskEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<TaskEvent>>>,
    next_task_id: Arc<AtomicU64>,
    /// Back-reference for handing owned clones to spawned workers.
    self_ref: Weak<CatalogManager>,
}

/// Proof that the holder went through the handler protocol; keeps the gate
/// read-held and remembers the term it was acquired in.
pub struct LeaderGuard<'a> {
    _gate: tokio::sync::RwLockReadGuard<'a, ()>,
    term: u64,
}

impl LeaderGuard<'_> {
    pub fn term(&self) -> u64 {
        self.term
    }
}

/// Releases a reserved table name when the reserving operation ends, whether
/// it published the name or failed.
struct NameReservation<'a> {
    catalog: &'a CatalogManager,
    name: String,
}

impl Drop for NameReservation<'_> {
    fn drop(&mut self) {
        self.catalog
            .directory
            .write()
            .unwrap()
            .release_name(&self.name);
    }
}

impl CatalogManager {
    pub fn new(
        cfg: MasterConfig,
        backend: Arc<dyn SysTabletBackend>,
        fleet: Arc<dyn Fleet>,
        cert_authority: Arc<dyn CertAuthority>,
        token_signer: Arc<dyn TokenSigner>,
    ) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Arc::new_cyclic(|self_ref| Self {
            cfg,
            sys: SysCatalog::new(backend),
            fleet,
            cert_authority,
            token_signer,
            directory: RwLock::new(Directory::default()),
            leader_lock: tokio::sync::RwLock::new(()),
            leader_ready_term: AtomicI64::new(NO_READY_TERM),
            prepare_serializer: tokio::sync::Mutex::new(()),
            initialized: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            shutdown: Notify::new(),
            reconciler_wake: Arc::new(Notify::new()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            next_task_id: Arc::new(AtomicU64::new(1)),
            self_ref: self_ref.clone(),
        })
    }

    fn owned(&self) -> Arc<Self> {
        self.self_ref
            .upgrade()
            .expect("catalog manager dropped while in use")
    }

    /// Launch the background machinery (task-event pump and reconciler) and
    /// open the catalog for requests.
    pub fn start(&self) {
        let rx = self
            .events_rx
            .lock()
            .unwrap()
            .take()
            .expect("catalog manager started twice");
        tokio::spawn(Self::run_event_pump(self.owned(), rx));
        crate::reconciler::spawn(self.owned());
        self.initialized.store(true, Ordering::SeqCst);
    }

    /// Flip the closing flag and wake everything that loops on it.
    pub fn close(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.notify_waiters();
        self.reconciler_wake.notify_one();
        for table in self.directory.read().unwrap().all_tables() {
            table.abort_tasks();
        }
        tracing::info!("catalog manager closing");
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &MasterConfig {
        &self.cfg
    }

    pub fn sys_catalog(&self) -> &SysCatalog {
        &self.sys
    }

    pub fn fleet(&self) -> &Arc<dyn Fleet> {
        &self.fleet
    }

    pub(crate) fn reconciler_wake(&self) -> Arc<Notify> {
        self.reconciler_wake.clone()
    }

    pub fn wake_reconciler(&self) {
        self.reconciler_wake.notify_one();
    }

    pub(crate) fn task_context(&self) -> TaskContext {
        TaskContext {
            fleet: self.fleet.clone(),
            events: self.events_tx.clone(),
            rpc_timeout: self.cfg.ts_rpc_timeout,
            task_timeout: self.cfg.unresponsive_ts_rpc_timeout,
            next_task_id: self.next_task_id.clone(),
        }
    }

    // ---------------------------------------------------------------------
    // Leadership gate

    /// Acquire the gate for reading and verify this master can serve.
    pub async fn leader_shared_lock(&self) -> MasterResult<LeaderGuard<'_>> {
        let gate = self.leader_lock.read().await;
        if self.is_closing() || !self.initialized.load(Ordering::SeqCst) {
            return Err(MasterError::not_initialized(
                "catalog manager has not started",
            ));
        }
        let backend = self.sys.backend();
        let term = backend.current_term();
        if !backend.is_leader() {
            return Err(MasterError::not_the_leader(
                "this master is not the current leader",
            ));
        }
        if self.leader_ready_term.load(Ordering::SeqCst) != term as i64 {
            return Err(MasterError::not_the_leader(format!(
                "leader is not yet ready to serve term {term}"
            )));
        }
        Ok(LeaderGuard { _gate: gate, term })
    }

    /// Whether the consensus term moved past the one a guard was taken in.
    pub fn has_term_changed(&self, guard: &LeaderGuard<'_>) -> bool {
        self.sys.backend().current_term() != guard.term()
    }

    pub fn leader_ready_term(&self) -> i64 {
        self.leader_ready_term.load(Ordering::SeqCst)
    }

    // ---------------------------------------------------------------------
    // Post-election prepare

    /// Consensus callback: this master may have become leader. The actual
    /// work runs serialized on the prepare executor.
    pub fn elected_as_leader(&self) {
        let catalog = self.owned();
        tokio::spawn(async move {
            catalog.prepare_for_leadership().await;
        });
    }

    /// One-time per-term prepare: reload the directory from the system
    /// tablet, initialize the certificate authority and the token signer,
    /// then publish the ready term.
    pub async fn prepare_for_leadership(&self) {
        let _serial = self.prepare_serializer.lock().await;
        let backend = self.sys.backend().clone();

        let term_before_wait = backend.current_term();
        if self.leader_ready_term.load(Ordering::SeqCst) == term_before_wait as i64 {
            // No actual leadership change: no other master can have led this
            // term.
            return;
        }

        if let Err(err) = backend
            .wait_until_caught_up(self.cfg.failover_catchup_timeout)
            .await
        {
            // Serving without seeing every committed catalog mutation would
            // hand out stale metadata; crash and let a peer take over.
            tracing::error!(error = ?err, "failed to catch up on the system tablet after election");
            panic!("shutting down: master failed to catch up after election: {err:#}");
        }

        let term = backend.current_term();
        if term != term_before_wait {
            tracing::info!(
                term_before_wait,
                term,
                "term changed while catching up; aborting leadership prepare"
            );
            return;
        }

        let _gate = self.leader_lock.write().await;

        if !self
            .prepare_step(term, "loading tables and tablets", self.load_directory())
            .await
        {
            return;
        }
        if !self
            .prepare_step(term, "initializing certificate authority", self.init_cert_authority())
            .await
        {
            return;
        }
        if !self
            .prepare_step(term, "loading token signing keys", self.init_token_signer())
            .await
        {
            return;
        }

        self.leader_ready_term.store(term as i64, Ordering::SeqCst);
        tracing::info!(term, "leadership prepare complete; serving requests");
        self.wake_reconciler();
    }

    /// Run one prepare step. A failure is tolerated only when the catalog is
    /// closing or the term has moved on; anything else is fatal.
    async fn prepare_step(
        &self,
        start_term: u64,
        description: &str,
        step: impl std::future::Future<Output = anyhow::Result<()>>,
    ) -> bool {
        tracing::info!("{description}...");
        let result = step.await;
        let Err(err) = result else {
            return true;
        };
        if self.is_closing() {
            tracing::info!(error = ?err, "{description} failed during shutdown");
            return false;
        }
        let term = self.sys.backend().current_term();
        if term != start_term {
            tracing::info!(
                start_term,
                term,
                error = ?err,
                "{description} failed after a term change; the new leader will redo it"
            );
            return false;
        }
        tracing::error!(error = ?err, "{description} failed");
        panic!("shutting down: {description} failed: {err:#}");
    }

    /// Rebuild the in-memory directory from the system tablet, aborting any
    /// tasks that belonged to the previous view.
    async fn load_directory(&self) -> anyhow::Result<()> {
        let previous = self.directory.read().unwrap().all_tables();
        for table in previous {
            table.abort_tasks();
        }

        let tables = self.sys.visit_tables()?;
        let tablets = self.sys.visit_tablets()?;

        let mut dir = self.directory.write().unwrap();
        dir.clear();
        for (id, record) in tables {
            let live_name = (!record.is_deleted()).then(|| record.name.clone());
            let table = TableInfo::new(id, record);
            match live_name {
                Some(name) => dir.insert_table(table, &name),
                None => dir.insert_table_by_id_only(table),
            }
        }
        for (id, record) in tablets {
            let table = dir.table_by_id(&record.table_id).ok_or_else(|| {
                anyhow::anyhow!(
                    "tablet {id} references missing table {}",
                    record.table_id
                )
            })?;
            let live = !record.is_deleted();
            let tablet = TabletInfo::new(id, table.clone(), record);
            dir.insert_tablet(tablet.clone());
            if live {
                table.add_remove_tablets(&[tablet], &[]);
            }
        }
        tracing::info!(
            tables = dir.num_tables(),
            tablets = dir.all_tablets().len(),
            "loaded catalog metadata"
        );
        Ok(())
    }

    /// Load the persisted CA, or generate-persist-install a fresh one. The
    /// insert-once persistence step doubles as a leadership check: a record
    /// written by a concurrent leader wins and fails this write.
    async fn init_cert_authority(&self) -> anyhow::Result<()> {
        if let Some(creds) = self.sys.get_cert_authority_entry()? {
            return self.cert_authority.init(creds);
        }
        let creds = self.cert_authority.generate()?;
        self.sys
            .add_cert_authority_entry(&creds)
            .await
            .map_err(|err| anyhow::anyhow!("persisting certificate authority: {err}"))?;
        tracing::info!("generated new certificate authority record");
        self.cert_authority.init(creds)
    }

    async fn init_token_signer(&self) -> anyhow::Result<()> {
        let entries = self.sys.visit_tsk_entries()?;
        let now = unix_time_secs();
        let expired: Vec<i64> = entries
            .iter()
            .filter(|k| k.expire_at_unix_secs <= now)
            .map(|k| k.seq_num)
            .collect();
        for key in &entries {
            tracing::info!(seq = key.seq_num, "loaded token signing key");
        }
        self.token_signer.import_keys(entries)?;
        self.try_generate_new_tsk().await?;
        self.sys
            .remove_tsk_entries(&expired)
            .await
            .map_err(|err| anyhow::anyhow!("removing expired token signing keys: {err}"))?;
        Ok(())
    }

    /// Ask the signer whether it wants a new key; persist before handing it
    /// over, then attempt rotation.
    pub(crate) async fn try_generate_new_tsk(&self) -> anyhow::Result<()> {
        if let Some(key) = self.token_signer.check_need_key()? {
            self.sys
                .add_tsk_entry(&key)
                .await
                .map_err(|err| anyhow::anyhow!("persisting token signing key: {err}"))?;
            tracing::info!(seq = key.seq_num, "generated new token signing key");
            self.token_signer.add_key(key)?;
        }
        self.token_signer.try_rotate_key()
    }

    pub(crate) fn token_signer(&self) -> &Arc<dyn TokenSigner> {
        &self.token_signer
    }

    async fn run_event_pump(catalog: Arc<Self>, mut rx: mpsc::UnboundedReceiver<TaskEvent>) {
        loop {
            let event = tokio::select! {
                event = rx.recv() => event,
                _ = catalog.shutdown.notified() => None,
            };
            let Some(event) = event else {
                break;
            };
            match event {
                TaskEvent::SchemaVersionAccepted {
                    tablet,
                    schema_version,
                } => {
                    if let Ok(_guard) = catalog.leader_shared_lock().await {
                        catalog
                            .handle_tablet_schema_version_report(&tablet, schema_version)
                            .await;
                    }
                }
                TaskEvent::ReplicaDeleted { tablet, ts_uuid } => {
                    tracing::debug!(
                        tablet = %tablet.id(),
                        ts = %ts_uuid,
                        "replica removed from tablet server"
                    );
                }
            }
            if catalog.is_closing() {
                break;
            }
        }
    }

    // ---------------------------------------------------------------------
    // Shared helpers

    /// Write through the proxy, rewriting leadership-shaped failures so the
    /// client retries against the new leader.
    pub(crate) async fn sys_write(&self, actions: CatalogActions) -> MasterResult<()> {
        match self.sys.write(actions).await {
            Ok(()) => Ok(()),
            Err(err @ (ApplyError::NotLeader | ApplyError::Aborted(_))) => {
                Err(MasterError::not_the_leader(format!(
                    "system tablet write failed: {err}"
                )))
            }
            Err(err) => Err(MasterError::unknown(format!(
                "system tablet write failed: {err}"
            ))),
        }
    }

    fn find_table(&self, ident: &TableIdent) -> MasterResult<Arc<TableInfo>> {
        let dir = self.directory.read().unwrap();
        let found = match (&ident.table_id, &ident.table_name) {
            (Some(id), _) => dir.table_by_id(id),
            (None, Some(name)) => dir.table_by_name(name),
            (None, None) => None,
        };
        found.ok_or_else(|| MasterError::table_not_found("the table does not exist"))
    }

    /// Re-validate a locked table against the identifier that resolved it. A
    /// concurrent rename or delete makes the lookup behave as if the table
    /// never existed.
    fn check_locked_table(record: &PersistentTable, ident: &TableIdent) -> MasterResult<()> {
        if record.is_deleted() {
            return Err(MasterError::table_not_found("the table was deleted"));
        }
        if ident.table_id.is_none() {
            if let Some(name) = &ident.table_name {
                if &record.name != name {
                    return Err(MasterError::table_not_found("the table was renamed"));
                }
            }
        }
        Ok(())
    }

    pub(crate) fn find_tablet(&self, tablet_id: &str) -> Option<Arc<TabletInfo>> {
        self.directory.read().unwrap().tablet(tablet_id)
    }

    /// Make freshly committed tablets reachable by id.
    pub(crate) fn publish_tablets(&self, tablets: &[Arc<TabletInfo>]) {
        let mut dir = self.directory.write().unwrap();
        for tablet in tablets {
            dir.insert_tablet(tablet.clone());
        }
    }

    /// Queue `DeleteTablet` tasks to every peer in a tablet's last known
    /// committed config.
    pub(crate) fn send_delete_replica_rpcs(
        &self,
        tablet: &Arc<TabletInfo>,
        record: &PersistentTablet,
        reason: &str,
    ) {
        let Some(cstate) = &record.consensus_state else {
            return;
        };
        let ctx = self.task_context();
        let table = tablet.table().clone();
        for peer in &cstate.committed_config.peers {
            ctx.spawn(
                TaskSpec::DeleteReplica {
                    target: peer.uuid.clone(),
                    mode: TabletDataState::Deleted,
                    cas_config_opid_index: None,
                    reason: reason.to_string(),
                },
                tablet.clone(),
                Some(table.clone()),
            );
        }
    }

    // ---------------------------------------------------------------------
    // CreateTable

    pub async fn create_table(&self, req: CreateTableRequest) -> MasterResult<CreateTableResponse> {
        let guard = self.leader_shared_lock().await?;

        let mut req = req;
        validate_identifier("table", &req.name, &self.cfg)?;
        validate_client_schema(&mut req.schema, &self.cfg)?;
        req.partition_schema.validate(&req.schema)?;
        let num_replicas = req.num_replicas.unwrap_or(self.cfg.default_num_replicas);
        validate_replication_factor(num_replicas, &self.cfg)?;

        let partitions = req
            .partition_schema
            .create_partitions(&req.split_points, &req.range_bounds)?;

        let live_ts = self.fleet.live_descriptors().len();
        if self.cfg.check_ts_count_for_create_table && num_replicas as usize > live_ts {
            return Err(MasterError::new(
                MasterErrorCode::ReplicationFactorTooHigh,
                format!(
                    "not enough live tablet servers to create a table with replication factor \
                     {num_replicas}; {live_ts} are alive"
                ),
            ));
        }
        if num_replicas > 1
            && partitions.len() > self.cfg.max_create_tablets_per_ts * live_ts.max(1)
        {
            return Err(MasterError::new(
                MasterErrorCode::TooManyTablets,
                format!(
                    "the requested number of tablets ({}) is over the permitted maximum ({})",
                    partitions.len(),
                    self.cfg.max_create_tablets_per_ts * live_ts.max(1)
                ),
            ));
        }

        // Claim the name so concurrent creates of the same table collide
        // here rather than at publish.
        let _reservation = {
            let mut dir = self.directory.write().unwrap();
            if dir.is_name_unavailable(&req.name) || !dir.reserve_name(&req.name) {
                return Err(MasterError::new(
                    MasterErrorCode::TableAlreadyPresent,
                    format!("table '{}' already exists", req.name),
                ));
            }
            NameReservation {
                catalog: self,
                name: req.name.clone(),
            }
        };

        let builder = SchemaBuilder::from_client_schema(&req.schema);
        let next_column_id = builder.next_column_id();
        let schema = builder.build();
        let table_id = new_object_id();
        let table = TableInfo::new(
            table_id.clone(),
            PersistentTable {
                state: TableState::Preparing,
                name: req.name.clone(),
                version: 0,
                next_column_id,
                num_replicas,
                schema,
                fully_applied_schema: None,
                partition_schema: req.partition_schema.clone(),
                state_msg: "table creation in progress".to_string(),
            },
        );

        let mut tablets: Vec<Arc<TabletInfo>> = partitions
            .into_iter()
            .map(|partition| self.new_tablet(&table, partition))
            .collect();
        sort_tablets_by_id(&mut tablets);

        let table_guard = table.write().await;
        let tablet_guards = lock_tablet_group(&tablets).await;

        let actions = CatalogActions {
            tables_to_add: vec![(table_id.clone(), table_guard.dirty().clone())],
            tablets_to_add: tablets
                .iter()
                .zip(&tablet_guards)
                .map(|(t, g)| (t.id().clone(), g.dirty().clone()))
                .collect(),
            ..Default::default()
        };
        if let Err(err) = self.sys_write(actions).await {
            tracing::warn!(table = %req.name, error = %err, "create table failed to persist");
            return Err(err);
        }

        commit_group(tablet_guards);
        table_guard.commit();
        table.add_remove_tablets(&tablets, &[]);
        {
            let mut dir = self.directory.write().unwrap();
            dir.insert_table(table.clone(), &req.name);
            for tablet in &tablets {
                dir.insert_tablet(tablet.clone());
            }
        }

        tracing::info!(
            table = %req.name,
            table_id = %table_id,
            tablets = tablets.len(),
            num_replicas,
            term = guard.term(),
            "created table"
        );
        self.wake_reconciler();
        Ok(CreateTableResponse { table_id })
    }

    fn new_tablet(&self, table: &Arc<TableInfo>, partition: Partition) -> Arc<TabletInfo> {
        TabletInfo::new(
            new_object_id(),
            table.clone(),
            PersistentTablet {
                state: TabletState::Preparing,
                table_id: table.id().clone(),
                partition,
                consensus_state: None,
                state_msg: "tablet preparing".to_string(),
            },
        )
    }

    // ---------------------------------------------------------------------
    // DeleteTable

    pub async fn delete_table(&self, req: DeleteTableRequest) -> MasterResult<()> {
        let _guard = self.leader_shared_lock().await?;

        let table = self.find_table(&req.table)?;
        let mut table_guard = table.write().await;
        Self::check_locked_table(table_guard.data(), &req.table)?;
        let old_name = table_guard.data().name.clone();

        let deleted_at = format!("deleted at {}", wall_clock_string(SystemTime::now()));
        table_guard
            .mutate()
            .set_state(TableState::Removed, deleted_at.clone());

        let mut tablets = table.all_tablets();
        sort_tablets_by_id(&mut tablets);
        let mut tablet_guards = lock_tablet_group(&tablets).await;
        for guard in &mut tablet_guards {
            if !guard.data().is_deleted() {
                guard
                    .mutate()
                    .set_state(TabletState::Deleted, deleted_at.clone());
            }
        }

        let actions = CatalogActions {
            tables_to_update: vec![(table.id().clone(), table_guard.dirty().clone())],
            tablets_to_update: tablets
                .iter()
                .zip(&tablet_guards)
                .map(|(t, g)| (t.id().clone(), g.dirty().clone()))
                .collect(),
            ..Default::default()
        };
        self.sys_write(actions).await?;

        // The name frees up as soon as the delete is durable.
        self.directory.write().unwrap().remove_table_name(&old_name);
        commit_group(tablet_guards);
        table_guard.commit();

        // Stop whatever was in flight for the old incarnation before fanning
        // out deletions.
        table.abort_tasks();
        for tablet in &tablets {
            let record = tablet.read().clone();
            self.send_delete_replica_rpcs(tablet, &record, &format!("table {old_name} deleted"));
        }

        tracing::info!(table = %old_name, table_id = %table.id(), "deleted table");
        self.wake_reconciler();
        Ok(())
    }

    // ---------------------------------------------------------------------
    // AlterTable

    pub async fn alter_table(&self, req: AlterTableRequest) -> MasterResult<AlterTableResponse> {
        let _guard = self.leader_shared_lock().await?;

        let table = self.find_table(&req.table)?;
        let mut table_guard = table.write().await;
        Self::check_locked_table(table_guard.data(), &req.table)?;
        let current = table_guard.data().clone();

        // Split the steps: schema edits run through the builder, partition
        // edits against the live tablet map.
        let mut builder = SchemaBuilder::from_schema(&current.schema, current.next_column_id);
        let mut has_schema_changes = false;
        let mut range_adds: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
        let mut range_drops: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
        for step in &req.steps {
            match step {
                AlterTableStep::AddColumn { column } => {
                    validate_identifier("column", &column.name, &self.cfg)?;
                    builder.add_column(column.clone())?;
                    has_schema_changes = true;
                }
                AlterTableStep::DropColumn { name } => {
                    builder.drop_column(name)?;
                    has_schema_changes = true;
                }
                AlterTableStep::RenameColumn { old_name, new_name } => {
                    validate_identifier("column", new_name, &self.cfg)?;
                    builder.rename_column(old_name, new_name)?;
                    has_schema_changes = true;
                }
                AlterTableStep::AddRangePartition { lower, upper } => {
                    range_adds.push((lower.clone(), upper.clone()));
                }
                AlterTableStep::DropRangePartition { lower, upper } => {
                    range_drops.push((lower.clone(), upper.clone()));
                }
            }
        }
        let next_column_id = builder.next_column_id();
        let new_schema = builder.build();
        if new_schema.columns.len() > self.cfg.max_num_columns {
            return Err(MasterError::invalid_schema(format!(
                "schema has {} columns, maximum is {}",
                new_schema.columns.len(),
                self.cfg.max_num_columns
            )));
        }

        // Resolve partition edits against the current tablet map.
        let live_tablets = table.all_tablets();
        let mut existing_ranges: BTreeSet<(Vec<u8>, Vec<u8>)> = BTreeSet::new();
        for tablet in &live_tablets {
            let record = tablet.read();
            existing_ranges
                .insert((record.partition.range_start.clone(), record.partition.range_end.clone()));
        }

        let mut dropped_ranges: BTreeSet<(Vec<u8>, Vec<u8>)> = BTreeSet::new();
        for (lower, upper) in &range_drops {
            let key = (lower.clone(), upper.clone());
            if !existing_ranges.contains(&key) || dropped_ranges.contains(&key) {
                return Err(MasterError::invalid_schema(
                    "no range partition exists with the specified bounds",
                ));
            }
            dropped_ranges.insert(key);
        }

        let mut added_ranges: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
        for (lower, upper) in &range_adds {
            if !lower.is_empty() && !upper.is_empty() && lower >= upper {
                return Err(MasterError::invalid_schema(
                    "range partition lower bound must be less than the upper bound",
                ));
            }
            let clash = existing_ranges
                .iter()
                .filter(|r| !dropped_ranges.contains(*r))
                .chain(added_ranges.iter())
                .any(|(s, e)| ranges_overlap(lower, upper, s, e));
            if clash {
                return Err(MasterError::invalid_schema(
                    "new range partition overlaps an existing range partition",
                ));
            }
            added_ranges.push((lower.clone(), upper.clone()));
        }

        // Rename, if requested, reserves the new name until publish.
        let mut reservation = None;
        let renaming = match &req.new_table_name {
            Some(new_name) if *new_name != current.name => {
                validate_identifier("table", new_name, &self.cfg)?;
                let mut dir = self.directory.write().unwrap();
                if dir.is_name_unavailable(new_name) || !dir.reserve_name(new_name) {
                    return Err(MasterError::new(
                        MasterErrorCode::TableAlreadyPresent,
                        format!("table '{new_name}' already exists"),
                    ));
                }
                reservation = Some(NameReservation {
                    catalog: self,
                    name: new_name.clone(),
                });
                Some(new_name.clone())
            }
            _ => None,
        };
        let _reservation = reservation;

        // Stage the table mutation.
        {
            let dirty = table_guard.mutate();
            if let Some(new_name) = &renaming {
                dirty.name = new_name.clone();
            }
            if has_schema_changes {
                if dirty.fully_applied_schema.is_none() {
                    dirty.fully_applied_schema = Some(current.schema.clone());
                }
                dirty.schema = new_schema.clone();
                dirty.next_column_id = next_column_id;
                dirty.version = current.version + 1;
                dirty.set_state(
                    TableState::Altering,
                    format!("alter table version={}", current.version + 1),
                );
            }
        }
        let new_version = table_guard.dirty().version;

        // Stage tablet mutations: drops plus freshly minted tablets for the
        // added ranges.
        let mut to_drop: Vec<Arc<TabletInfo>> = live_tablets
            .iter()
            .filter(|t| {
                let record = t.read();
                dropped_ranges.contains(&(
                    record.partition.range_start.clone(),
                    record.partition.range_end.clone(),
                ))
            })
            .cloned()
            .collect();
        sort_tablets_by_id(&mut to_drop);

        let mut new_tablets: Vec<Arc<TabletInfo>> = Vec::new();
        for (lower, upper) in &added_ranges {
            for partition in current
                .partition_schema
                .partitions_for_range(lower.clone(), upper.clone())
            {
                new_tablets.push(self.new_tablet(&table, partition));
            }
        }
        sort_tablets_by_id(&mut new_tablets);

        let mut drop_guards = lock_tablet_group(&to_drop).await;
        for guard in &mut drop_guards {
            guard
                .mutate()
                .set_state(TabletState::Deleted, "range partition dropped".to_string());
        }
        let new_guards = lock_tablet_group(&new_tablets).await;

        let actions = CatalogActions {
            tables_to_update: vec![(table.id().clone(), table_guard.dirty().clone())],
            tablets_to_add: new_tablets
                .iter()
                .zip(&new_guards)
                .map(|(t, g)| (t.id().clone(), g.dirty().clone()))
                .collect(),
            tablets_to_update: to_drop
                .iter()
                .zip(&drop_guards)
                .map(|(t, g)| (t.id().clone(), g.dirty().clone()))
                .collect(),
            ..Default::default()
        };
        self.sys_write(actions).await?;

        // Publish: name map first, then tablet and table commits, then the
        // table's tablet map and the directory.
        if let Some(new_name) = &renaming {
            self.directory
                .write()
                .unwrap()
                .rename_table(&current.name, new_name, table.clone());
        }
        commit_group(new_guards);
        commit_group(drop_guards);
        table_guard.commit();
        table.add_remove_tablets(&new_tablets, &to_drop);
        {
            let mut dir = self.directory.write().unwrap();
            for tablet in &new_tablets {
                dir.insert_tablet(tablet.clone());
            }
        }

        // Fan out: alters to surviving tablets, deletes to dropped ones.
        if has_schema_changes || renaming.is_some() {
            let ctx = self.task_context();
            for tablet in table.all_tablets() {
                if new_tablets.iter().any(|t| Arc::ptr_eq(t, &tablet)) {
                    continue;
                }
                ctx.spawn(TaskSpec::AlterSchema, tablet, Some(table.clone()));
            }
        }
        for tablet in &to_drop {
            let record = tablet.read().clone();
            self.send_delete_replica_rpcs(tablet, &record, "range partition dropped");
        }

        tracing::info!(
            table_id = %table.id(),
            version = new_version,
            renamed = renaming.is_some(),
            added_ranges = added_ranges.len(),
            dropped_ranges = dropped_ranges.len(),
            "altered table"
        );
        self.wake_reconciler();
        Ok(AlterTableResponse {
            table_id: table.id().clone(),
            schema_version: new_version,
        })
    }

    // ---------------------------------------------------------------------
    // Read-only handlers

    pub async fn is_create_table_done(&self, ident: &TableIdent) -> MasterResult<bool> {
        let _guard = self.leader_shared_lock().await?;
        let table = self.find_table(ident)?;
        {
            let record = table.read();
            Self::check_locked_table(&record, ident)?;
        }
        let all_running = table
            .all_tablets()
            .iter()
            .all(|t| t.read().is_running());
        Ok(all_running)
    }

    pub async fn is_alter_table_done(&self, ident: &TableIdent) -> MasterResult<bool> {
        let _guard = self.leader_shared_lock().await?;
        let table = self.find_table(ident)?;
        let record = table.read();
        Self::check_locked_table(&record, ident)?;
        Ok(record.state != TableState::Altering)
    }

    pub async fn get_table_schema(&self, ident: &TableIdent) -> MasterResult<GetTableSchemaResponse> {
        let _guard = self.leader_shared_lock().await?;
        let table = self.find_table(ident)?;
        let record = table.read();
        Self::check_locked_table(&record, ident)?;
        let schema = record
            .fully_applied_schema
            .clone()
            .unwrap_or_else(|| record.schema.clone());
        Ok(GetTableSchemaResponse {
            table_id: table.id().clone(),
            name: record.name.clone(),
            schema,
            partition_schema: record.partition_schema.clone(),
            num_replicas: record.num_replicas,
        })
    }

    pub async fn list_tables(&self, name_filter: Option<&str>) -> MasterResult<Vec<ListedTable>> {
        let _guard = self.leader_shared_lock().await?;
        let tables = self.directory.read().unwrap().all_tables();
        let mut out = Vec::new();
        for table in tables {
            let record = table.read();
            if record.is_deleted() {
                continue;
            }
            if let Some(filter) = name_filter {
                if !record.name.contains(filter) {
                    continue;
                }
            }
            out.push(ListedTable {
                table_id: table.id().clone(),
                name: record.name.clone(),
            });
        }
        Ok(out)
    }

    /// Replica list for one tablet, filtered by role; falls back to the
    /// address embedded in the Raft peer when the fleet has no registration.
    pub(crate) fn build_locations_for_tablet(
        &self,
        tablet: &Arc<TabletInfo>,
        filter: ReplicaTypeFilter,
    ) -> MasterResult<TabletLocations> {
        let record = tablet.read();
        if !record.is_running() {
            return Err(MasterError::new(
                MasterErrorCode::TabletNotRunning,
                format!("tablet {} is {:?}", tablet.id(), record.state),
            ));
        }
        let Some(cstate) = &record.consensus_state else {
            return Err(MasterError::new(
                MasterErrorCode::TabletNotRunning,
                format!("tablet {} has no consensus state", tablet.id()),
            ));
        };
        let mut replicas = Vec::new();
        for peer in &cstate.committed_config.peers {
            let is_voter = cstate.committed_config.is_voter(&peer.uuid);
            if filter == ReplicaTypeFilter::Voters && !is_voter {
                continue;
            }
            let role = if cstate.leader_uuid.as_deref() == Some(peer.uuid.as_str()) && is_voter {
                ReplicaRole::Leader
            } else if is_voter {
                ReplicaRole::Follower
            } else {
                ReplicaRole::Learner
            };
            let rpc_addr = self
                .fleet
                .lookup(&peer.uuid)
                .map(|d| d.rpc_addr().to_string())
                .or_else(|| peer.last_known_addr.clone());
            replicas.push(ReplicaLocation {
                ts_uuid: peer.uuid.clone(),
                rpc_addr,
                role,
            });
        }
        Ok(TabletLocations {
            tablet_id: tablet.id().clone(),
            partition_begin: record.partition.begin.clone(),
            partition_end: record.partition.end.clone(),
            replicas,
        })
    }

    pub async fn get_tablet_locations(
        &self,
        tablet_id: &str,
        filter: ReplicaTypeFilter,
    ) -> MasterResult<TabletLocations> {
        let _guard = self.leader_shared_lock().await?;
        let tablet = self
            .find_tablet(tablet_id)
            .ok_or_else(|| MasterError::table_not_found("unknown tablet"))?;
        self.build_locations_for_tablet(&tablet, filter)
    }

    pub async fn get_table_locations(
        &self,
        req: GetTableLocationsRequest,
    ) -> MasterResult<GetTableLocationsResponse> {
        let _guard = self.leader_shared_lock().await?;
        let table = self.find_table(&req.table)?;
        {
            let record = table.read();
            Self::check_locked_table(&record, &req.table)?;
        }
        let max = if req.max_returned_locations == 0 {
            10
        } else {
            req.max_returned_locations
        };
        let mut tablet_locations = Vec::new();
        for tablet in table.tablets_in_range(&req.partition_key_start, max) {
            // Tablets that are not serving yet are simply not listed.
            match self.build_locations_for_tablet(&tablet, req.replica_type_filter) {
                Ok(locations) => tablet_locations.push(locations),
                Err(err) if err.code == MasterErrorCode::TabletNotRunning => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(GetTableLocationsResponse {
            tablet_locations,
            ttl_millis: self.cfg.table_locations_ttl.as_millis() as u64,
        })
    }

    pub async fn connect_to_master(&self) -> MasterResult<ConnectToMasterResponse> {
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(MasterError::not_initialized(
                "catalog manager has not started",
            ));
        }
        let backend = self.sys.backend();
        let ready = self.leader_ready_term.load(Ordering::SeqCst)
            == backend.current_term() as i64;
        let leader = backend.is_leader() && ready;
        let (ca_cert_der, tsk_public_keys) = if leader {
            (
                self.cert_authority.ca_cert_der(),
                self.token_signer
                    .public_keys()
                    .into_iter()
                    .map(|(seq_num, public_key_der)| TskPublicKey {
                        seq_num,
                        public_key_der,
                    })
                    .collect(),
            )
        } else {
            (None, Vec::new())
        };
        Ok(ConnectToMasterResponse {
            leader,
            ca_cert_der,
            tsk_public_keys,
        })
    }

    /// Debug rendering of every table and its tablets.
    pub fn dump_state(&self) -> String {
        use std::fmt::Write as _;

        let mut out = String::new();
        for table in self.directory.read().unwrap().all_tables() {
            let record = table.read();
            let _ = writeln!(
                out,
                "table {} '{}' state={:?} version={}",
                table.id(),
                record.name,
                record.state,
                record.version
            );
            for tablet in table.all_tablets() {
                let t = tablet.read();
                let _ = writeln!(
                    out,
                    "  tablet {} state={:?} partition=[{:?}, {:?})",
                    tablet.id(),
                    t.state,
                    t.partition.begin,
                    t.partition.end
                );
            }
        }
        out
    }

    /// Tablets the reconciler should look at: everything not yet running
    /// and not already on its way out.
    pub(crate) fn extract_tablets_to_process(&self) -> Vec<Arc<TabletInfo>> {
        let tables = self.directory.read().unwrap().all_tables();
        let mut out = Vec::new();
        for table in tables {
            if table.read().is_deleted() {
                continue;
            }
            for tablet in table.all_tablets() {
                let record = tablet.read();
                if record.is_deleted() || record.is_running() {
                    continue;
                }
                out.push(tablet.clone());
            }
        }
        out
    }
}

/// Wall-clock rendering for state messages.
fn wall_clock_string(now: SystemTime) -> String {
    let secs = now
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    format!("unix time {secs}")
}
