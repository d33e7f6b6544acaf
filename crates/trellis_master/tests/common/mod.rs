#![allow(dead_code)]
//! Shared harness for catalog manager integration tests.
//!
//! Builds a single-master "cluster" out of the in-memory system-tablet
//! backend, a fleet of scripted tablet servers, and deterministic security
//! fakes, then drives it the way a host process would: prepare on election,
//! push tablet reports, observe admin RPC fan-out.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use trellis_master::config::MasterConfig;
use trellis_master::fleet::FleetRegistry;
use trellis_master::metadata::{ConsensusState, RaftConfig, RaftPeer, TsId};
use trellis_master::rpc::{
    CreateTableRequest, ReportedTablet, TabletReport,
};
use trellis_master::schema::{ColumnSchema, DataType, Schema};
use trellis_master::security::{CaCredentials, CertAuthority, TokenSigner, TokenSigningKey};
use trellis_master::sys_catalog::MemoryBackend;
use trellis_master::ts_admin::{
    AlterSchemaRequest, ChangeConfigRequest, CreateTabletRequest, DeleteTabletRequest,
    TabletDataState, TabletServerAdmin, TsAdminError, TsErrorCode,
};
use trellis_master::CatalogManager;

pub const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Install a fmt subscriber honoring `RUST_LOG`; safe to call repeatedly.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// One admin RPC as received by a scripted tablet server.
#[derive(Debug, Clone)]
pub enum AdminCall {
    Create(CreateTabletRequest),
    Delete(DeleteTabletRequest),
    Alter(AlterSchemaRequest),
    ChangeConfig(ChangeConfigRequest),
}

/// Records every admin call and answers Ok unless an error was scripted for
/// the method.
pub struct ScriptedTabletServer {
    pub uuid: TsId,
    calls: Mutex<Vec<AdminCall>>,
    errors: Mutex<HashMap<&'static str, VecDeque<TsErrorCode>>>,
}

impl ScriptedTabletServer {
    pub fn new(uuid: impl Into<TsId>) -> Arc<Self> {
        Arc::new(Self {
            uuid: uuid.into(),
            calls: Mutex::new(Vec::new()),
            errors: Mutex::new(HashMap::new()),
        })
    }

    /// Queue an error response for the next call of `method`
    /// (`"create_tablet"`, `"delete_tablet"`, `"alter_schema"`,
    /// `"change_config"`).
    pub fn push_error(&self, method: &'static str, code: TsErrorCode) {
        self.errors
            .lock()
            .unwrap()
            .entry(method)
            .or_default()
            .push_back(code);
    }

    fn next_error(&self, method: &'static str) -> Option<TsAdminError> {
        self.errors
            .lock()
            .unwrap()
            .get_mut(method)
            .and_then(|q| q.pop_front())
            .map(|code| TsAdminError::new(code, "scripted"))
    }

    pub fn calls(&self) -> Vec<AdminCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn create_requests(&self) -> Vec<CreateTabletRequest> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                AdminCall::Create(req) => Some(req),
                _ => None,
            })
            .collect()
    }

    pub fn delete_requests(&self) -> Vec<DeleteTabletRequest> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                AdminCall::Delete(req) => Some(req),
                _ => None,
            })
            .collect()
    }

    pub fn alter_requests(&self) -> Vec<AlterSchemaRequest> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                AdminCall::Alter(req) => Some(req),
                _ => None,
            })
            .collect()
    }

    pub fn change_config_requests(&self) -> Vec<ChangeConfigRequest> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                AdminCall::ChangeConfig(req) => Some(req),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl TabletServerAdmin for ScriptedTabletServer {
    async fn create_tablet(&self, req: CreateTabletRequest) -> Result<(), TsAdminError> {
        self.calls.lock().unwrap().push(AdminCall::Create(req));
        match self.next_error("create_tablet") {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn delete_tablet(&self, req: DeleteTabletRequest) -> Result<(), TsAdminError> {
        self.calls.lock().unwrap().push(AdminCall::Delete(req));
        match self.next_error("delete_tablet") {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn alter_schema(&self, req: AlterSchemaRequest) -> Result<(), TsAdminError> {
        self.calls.lock().unwrap().push(AdminCall::Alter(req));
        match self.next_error("alter_schema") {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn change_config(&self, req: ChangeConfigRequest) -> Result<(), TsAdminError> {
        self.calls
            .lock()
            .unwrap()
            .push(AdminCall::ChangeConfig(req));
        match self.next_error("change_config") {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Deterministic CA fake: fixed DER blobs, install-on-init.
pub struct FakeCertAuthority {
    installed: Mutex<Option<CaCredentials>>,
    generated: Mutex<u32>,
}

impl FakeCertAuthority {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            installed: Mutex::new(None),
            generated: Mutex::new(0),
        })
    }

    pub fn generated_count(&self) -> u32 {
        *self.generated.lock().unwrap()
    }
}

impl CertAuthority for FakeCertAuthority {
    fn generate(&self) -> anyhow::Result<CaCredentials> {
        let mut generated = self.generated.lock().unwrap();
        *generated += 1;
        Ok(CaCredentials {
            private_key_der: vec![0xca, *generated as u8],
            certificate_der: vec![0xce, *generated as u8],
        })
    }

    fn init(&self, creds: CaCredentials) -> anyhow::Result<()> {
        *self.installed.lock().unwrap() = Some(creds);
        Ok(())
    }

    fn ca_cert_der(&self) -> Option<Vec<u8>> {
        self.installed
            .lock()
            .unwrap()
            .as_ref()
            .map(|c| c.certificate_der.clone())
    }
}

/// Token signer fake: wants one key whenever it holds none.
pub struct FakeTokenSigner {
    keys: Mutex<Vec<TokenSigningKey>>,
    next_seq: Mutex<i64>,
}

impl FakeTokenSigner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            keys: Mutex::new(Vec::new()),
            next_seq: Mutex::new(1),
        })
    }

    pub fn key_count(&self) -> usize {
        self.keys.lock().unwrap().len()
    }
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

impl TokenSigner for FakeTokenSigner {
    fn check_need_key(&self) -> anyhow::Result<Option<TokenSigningKey>> {
        if !self.keys.lock().unwrap().is_empty() {
            return Ok(None);
        }
        let mut next_seq = self.next_seq.lock().unwrap();
        let seq = *next_seq;
        *next_seq += 1;
        Ok(Some(TokenSigningKey {
            seq_num: seq,
            expire_at_unix_secs: unix_now() + 3600,
            private_key_der: vec![0x75, seq as u8],
            public_key_der: vec![0x70, seq as u8],
        }))
    }

    fn add_key(&self, key: TokenSigningKey) -> anyhow::Result<()> {
        self.keys.lock().unwrap().push(key);
        Ok(())
    }

    fn try_rotate_key(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn import_keys(&self, keys: Vec<TokenSigningKey>) -> anyhow::Result<()> {
        let mut held = self.keys.lock().unwrap();
        for key in keys {
            if !held.iter().any(|k| k.seq_num == key.seq_num) {
                held.push(key);
            }
        }
        Ok(())
    }

    fn is_current_key_valid(&self) -> bool {
        let now = unix_now();
        self.keys
            .lock()
            .unwrap()
            .iter()
            .any(|k| k.expire_at_unix_secs > now)
    }

    fn public_keys(&self) -> Vec<(i64, Vec<u8>)> {
        self.keys
            .lock()
            .unwrap()
            .iter()
            .map(|k| (k.seq_num, k.public_key_der.clone()))
            .collect()
    }
}

pub struct TestCluster {
    pub catalog: Arc<CatalogManager>,
    pub backend: Arc<MemoryBackend>,
    pub fleet: Arc<FleetRegistry>,
    pub servers: Vec<Arc<ScriptedTabletServer>>,
    pub cert_authority: Arc<FakeCertAuthority>,
    pub token_signer: Arc<FakeTokenSigner>,
}

impl TestCluster {
    pub async fn start(num_tablet_servers: usize) -> Self {
        Self::start_with_config(test_config(), num_tablet_servers).await
    }

    pub async fn start_with_config(cfg: MasterConfig, num_tablet_servers: usize) -> Self {
        init_test_logging();
        let backend = Arc::new(MemoryBackend::new());
        let fleet = Arc::new(FleetRegistry::new(Duration::from_secs(60)));
        let mut servers = Vec::new();
        for i in 0..num_tablet_servers {
            let server = ScriptedTabletServer::new(format!("ts-{i}"));
            fleet.register(
                server.uuid.clone(),
                format!("127.0.0.1:{}", 7050 + i),
                server.clone(),
            );
            servers.push(server);
        }
        let cert_authority = FakeCertAuthority::new();
        let token_signer = FakeTokenSigner::new();
        let catalog = CatalogManager::new(
            cfg,
            backend.clone(),
            fleet.clone(),
            cert_authority.clone(),
            token_signer.clone(),
        );
        catalog.start();
        catalog.prepare_for_leadership().await;
        Self {
            catalog,
            backend,
            fleet,
            servers,
            cert_authority,
            token_signer,
        }
    }

    pub fn server(&self, uuid: &str) -> &Arc<ScriptedTabletServer> {
        self.servers
            .iter()
            .find(|s| s.uuid == uuid)
            .unwrap_or_else(|| panic!("no scripted server {uuid}"))
    }

    /// All create requests seen so far, across every server.
    pub fn all_create_requests(&self) -> Vec<CreateTabletRequest> {
        self.servers
            .iter()
            .flat_map(|s| s.create_requests())
            .collect()
    }

    /// Distinct tablet ids that have received create RPCs.
    pub fn created_tablet_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .all_create_requests()
            .into_iter()
            .map(|r| r.tablet_id)
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    /// Report one tablet as serving with the given voters and leader.
    pub async fn report_running(
        &self,
        from_ts: &str,
        tablet_id: &str,
        voters: &[&str],
        leader: &str,
        term: u64,
        opid_index: i64,
    ) {
        let report = TabletReport {
            updated_tablets: vec![running_report(tablet_id, voters, leader, term, opid_index)],
        };
        self.catalog
            .process_tablet_report(from_ts, report)
            .await
            .expect("tablet report failed");
    }
}

/// A `MasterConfig` tuned for fast tests.
pub fn test_config() -> MasterConfig {
    MasterConfig {
        bg_task_wait: Duration::from_millis(10),
        ts_rpc_timeout: Duration::from_secs(5),
        ..MasterConfig::default()
    }
}

/// Minimal two-column client schema.
pub fn simple_schema() -> Schema {
    Schema::new(vec![
        ColumnSchema::new_key("id", DataType::Int64),
        ColumnSchema::new("value", DataType::String, true),
    ])
}

pub fn create_request(name: &str, split_points: Vec<Vec<u8>>) -> CreateTableRequest {
    CreateTableRequest {
        name: name.to_string(),
        schema: simple_schema(),
        partition_schema: Default::default(),
        split_points,
        range_bounds: Vec::new(),
        num_replicas: Some(3),
    }
}

/// A healthy running-tablet report entry.
pub fn running_report(
    tablet_id: &str,
    voters: &[&str],
    leader: &str,
    term: u64,
    opid_index: i64,
) -> ReportedTablet {
    ReportedTablet {
        tablet_id: tablet_id.to_string(),
        data_state: TabletDataState::Ready,
        error: None,
        consensus_state: Some(consensus_state(voters, leader, term, opid_index)),
        schema_version: Some(0),
    }
}

pub fn consensus_state(
    voters: &[&str],
    leader: &str,
    term: u64,
    opid_index: i64,
) -> ConsensusState {
    let mut cstate = ConsensusState::new(
        term,
        RaftConfig {
            opid_index,
            peers: voters.iter().map(|v| RaftPeer::voter(*v)).collect(),
        },
    );
    cstate.leader_uuid = Some(leader.to_string());
    cstate
}

/// Poll until `check` passes or the shared timeout elapses.
pub async fn wait_until<F: Fn() -> bool>(check: F, what: &str) {
    let deadline = std::time::Instant::now() + WAIT_TIMEOUT;
    loop {
        if check() {
            return;
        }
        if std::time::Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
