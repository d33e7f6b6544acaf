//! The system-catalog proxy: durable catalog state behind one replicated
//! tablet.
//!
//! The proxy turns typed catalog records into entry writes against a
//! [`SysTabletBackend`], which hides the consensus layer and the storage
//! engine. All entries written in one [`SysCatalog::write`] call commit
//! atomically. Two backends ship in-tree: an in-memory simulated backend
//! whose term and leadership are script-controlled (tests, embedding), and a
//! fjall-backed single-node backend.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use fjall::PartitionCreateOptions;
use serde::{Deserialize, Serialize};

use crate::metadata::{PersistentTable, PersistentTablet, TableId, TabletId};
use crate::security::{CaCredentials, TokenSigningKey};

/// Entry families stored in the system tablet, keyed by family + id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum EntryFamily {
    Table,
    Tablet,
    CertAuthority,
    Tsk,
}

impl EntryFamily {
    pub fn prefix(self) -> &'static str {
        match self {
            EntryFamily::Table => "table",
            EntryFamily::Tablet => "tablet",
            EntryFamily::CertAuthority => "ca",
            EntryFamily::Tsk => "tsk",
        }
    }
}

/// Why a system-tablet write did not commit.
#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    #[error("not the leader of the system tablet")]
    NotLeader,
    #[error("system tablet write aborted: {0}")]
    Aborted(String),
    #[error("entry already present: {0}")]
    AlreadyPresent(String),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// One entry mutation in an atomic batch.
#[derive(Debug, Clone)]
pub enum BackendOp {
    /// Insert or overwrite.
    Upsert {
        family: EntryFamily,
        id: String,
        value: Vec<u8>,
    },
    /// Insert; fails the whole batch if the id is already present.
    Insert {
        family: EntryFamily,
        id: String,
        value: Vec<u8>,
    },
    Delete { family: EntryFamily, id: String },
}

/// The replicated tablet the catalog persists into.
///
/// `apply` linearizes through the consensus layer; `scan` is the sequential
/// visitor over committed entries of one family.
#[async_trait]
pub trait SysTabletBackend: Send + Sync {
    fn current_term(&self) -> u64;

    fn is_leader(&self) -> bool;

    async fn apply(&self, ops: Vec<BackendOp>) -> Result<(), ApplyError>;

    fn scan(&self, family: EntryFamily) -> anyhow::Result<Vec<(String, Vec<u8>)>>;

    /// Wait until every transaction committed in an earlier term is visible.
    async fn wait_until_caught_up(&self, timeout: Duration) -> anyhow::Result<()>;
}

const CA_ENTRY_ID: &str = "root";

/// A batch of table/tablet record changes committed atomically.
#[derive(Debug, Default)]
pub struct CatalogActions {
    pub tables_to_add: Vec<(TableId, PersistentTable)>,
    pub tables_to_update: Vec<(TableId, PersistentTable)>,
    pub tablets_to_add: Vec<(TabletId, PersistentTablet)>,
    pub tablets_to_update: Vec<(TabletId, PersistentTablet)>,
}

impl CatalogActions {
    pub fn is_empty(&self) -> bool {
        self.tables_to_add.is_empty()
            && self.tables_to_update.is_empty()
            && self.tablets_to_add.is_empty()
            && self.tablets_to_update.is_empty()
    }
}

/// Thin adapter between typed catalog records and system-tablet entries.
#[derive(Clone)]
pub struct SysCatalog {
    backend: std::sync::Arc<dyn SysTabletBackend>,
}

impl SysCatalog {
    pub fn new(backend: std::sync::Arc<dyn SysTabletBackend>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &std::sync::Arc<dyn SysTabletBackend> {
        &self.backend
    }

    pub async fn write(&self, actions: CatalogActions) -> Result<(), ApplyError> {
        if actions.is_empty() {
            return Ok(());
        }
        let mut ops = Vec::new();
        for (id, table) in actions.tables_to_add.iter().chain(&actions.tables_to_update) {
            ops.push(BackendOp::Upsert {
                family: EntryFamily::Table,
                id: id.clone(),
                value: encode(table)?,
            });
        }
        for (id, tablet) in actions
            .tablets_to_add
            .iter()
            .chain(&actions.tablets_to_update)
        {
            ops.push(BackendOp::Upsert {
                family: EntryFamily::Tablet,
                id: id.clone(),
                value: encode(tablet)?,
            });
        }
        self.backend.apply(ops).await
    }

    pub fn visit_tables(&self) -> anyhow::Result<Vec<(TableId, PersistentTable)>> {
        self.visit(EntryFamily::Table)
    }

    pub fn visit_tablets(&self) -> anyhow::Result<Vec<(TabletId, PersistentTablet)>> {
        self.visit(EntryFamily::Tablet)
    }

    fn visit<T: serde::de::DeserializeOwned>(
        &self,
        family: EntryFamily,
    ) -> anyhow::Result<Vec<(String, T)>> {
        let mut out = Vec::new();
        for (id, value) in self.backend.scan(family)? {
            let record = serde_json::from_slice(&value)
                .with_context(|| format!("corrupt {} entry '{id}'", family.prefix()))?;
            out.push((id, record));
        }
        Ok(out)
    }

    pub fn get_cert_authority_entry(&self) -> anyhow::Result<Option<CaCredentials>> {
        let entries = self.visit::<CaCredentials>(EntryFamily::CertAuthority)?;
        Ok(entries.into_iter().next().map(|(_, creds)| creds))
    }

    /// Persist freshly generated CA credentials. Uses insert semantics so a
    /// concurrent leader's record cannot be clobbered; the write doubles as
    /// an "am I still leader" check.
    pub async fn add_cert_authority_entry(
        &self,
        creds: &CaCredentials,
    ) -> Result<(), ApplyError> {
        self.backend
            .apply(vec![BackendOp::Insert {
                family: EntryFamily::CertAuthority,
                id: CA_ENTRY_ID.to_string(),
                value: encode(creds)?,
            }])
            .await
    }

    /// All token-signing-key entries, expired ones included.
    pub fn visit_tsk_entries(&self) -> anyhow::Result<Vec<TokenSigningKey>> {
        let entries = self.visit::<TokenSigningKey>(EntryFamily::Tsk)?;
        Ok(entries.into_iter().map(|(_, key)| key).collect())
    }

    pub async fn add_tsk_entry(&self, key: &TokenSigningKey) -> Result<(), ApplyError> {
        self.backend
            .apply(vec![BackendOp::Insert {
                family: EntryFamily::Tsk,
                id: tsk_entry_id(key.seq_num),
                value: encode(key)?,
            }])
            .await
    }

    pub async fn remove_tsk_entries(&self, seq_nums: &[i64]) -> Result<(), ApplyError> {
        if seq_nums.is_empty() {
            return Ok(());
        }
        let ops = seq_nums
            .iter()
            .map(|seq| BackendOp::Delete {
                family: EntryFamily::Tsk,
                id: tsk_entry_id(*seq),
            })
            .collect();
        self.backend.apply(ops).await
    }
}

pub fn tsk_entry_id(seq_num: i64) -> String {
    format!("{seq_num:020}")
}

fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, ApplyError> {
    serde_json::to_vec(value)
        .context("serialize system-tablet entry")
        .map_err(ApplyError::Storage)
}

/// In-memory backend with script-controlled term and leadership.
pub struct MemoryBackend {
    entries: Mutex<BTreeMap<(EntryFamily, String), Vec<u8>>>,
    term: AtomicU64,
    leader: AtomicBool,
    fail_next: Mutex<Option<ScriptedFailure>>,
}

/// Failure the next `apply` call should report.
#[derive(Debug, Clone, Copy)]
pub enum ScriptedFailure {
    NotLeader,
    Aborted,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            term: AtomicU64::new(1),
            leader: AtomicBool::new(true),
            fail_next: Mutex::new(None),
        }
    }

    pub fn set_leader(&self, leader: bool) {
        self.leader.store(leader, Ordering::SeqCst);
    }

    /// Lose leadership; the term moves on to some other master.
    pub fn step_down(&self) {
        self.term.fetch_add(1, Ordering::SeqCst);
        self.leader.store(false, Ordering::SeqCst);
    }

    /// Win an election in a fresh term.
    pub fn become_leader(&self) -> u64 {
        let term = self.term.fetch_add(1, Ordering::SeqCst) + 1;
        self.leader.store(true, Ordering::SeqCst);
        term
    }

    pub fn fail_next_apply(&self, failure: ScriptedFailure) {
        *self.fail_next.lock().unwrap() = Some(failure);
    }

    pub fn entry_count(&self, family: EntryFamily) -> usize {
        self.entries
            .lock()
            .unwrap()
            .keys()
            .filter(|(f, _)| *f == family)
            .count()
    }
}

#[async_trait]
impl SysTabletBackend for MemoryBackend {
    fn current_term(&self) -> u64 {
        self.term.load(Ordering::SeqCst)
    }

    fn is_leader(&self) -> bool {
        self.leader.load(Ordering::SeqCst)
    }

    async fn apply(&self, ops: Vec<BackendOp>) -> Result<(), ApplyError> {
        if let Some(failure) = self.fail_next.lock().unwrap().take() {
            return Err(match failure {
                ScriptedFailure::NotLeader => ApplyError::NotLeader,
                ScriptedFailure::Aborted => ApplyError::Aborted("scripted".into()),
            });
        }
        if !self.is_leader() {
            return Err(ApplyError::NotLeader);
        }
        let mut entries = self.entries.lock().unwrap();
        // Validate inserts up front so the batch stays all-or-nothing.
        for op in &ops {
            if let BackendOp::Insert { family, id, .. } = op {
                if entries.contains_key(&(*family, id.clone())) {
                    return Err(ApplyError::AlreadyPresent(format!(
                        "{}/{id}",
                        family.prefix()
                    )));
                }
            }
        }
        for op in ops {
            match op {
                BackendOp::Upsert { family, id, value }
                | BackendOp::Insert { family, id, value } => {
                    entries.insert((family, id), value);
                }
                BackendOp::Delete { family, id } => {
                    entries.remove(&(family, id));
                }
            }
        }
        Ok(())
    }

    fn scan(&self, family: EntryFamily) -> anyhow::Result<Vec<(String, Vec<u8>)>> {
        Ok(self
            .entries
            .lock()
            .unwrap()
            .iter()
            .filter(|((f, _), _)| *f == family)
            .map(|((_, id), value)| (id.clone(), value.clone()))
            .collect())
    }

    async fn wait_until_caught_up(&self, _timeout: Duration) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Fjall-backed single-node backend: one partition per entry family, one
/// keyspace batch per catalog write.
pub struct FjallBackend {
    keyspace: fjall::Keyspace,
    partitions: BTreeMap<&'static str, fjall::PartitionHandle>,
}

impl FjallBackend {
    pub fn open(path: impl AsRef<std::path::Path>) -> anyhow::Result<Self> {
        let keyspace = fjall::Config::new(path).open().context("open sys catalog keyspace")?;
        let mut partitions = BTreeMap::new();
        for family in [
            EntryFamily::Table,
            EntryFamily::Tablet,
            EntryFamily::CertAuthority,
            EntryFamily::Tsk,
        ] {
            let name = format!("sys_{}", family.prefix());
            let partition = keyspace
                .open_partition(&name, PartitionCreateOptions::default())
                .with_context(|| format!("open partition {name}"))?;
            partitions.insert(family.prefix(), partition);
        }
        Ok(Self {
            keyspace,
            partitions,
        })
    }

    fn partition(&self, family: EntryFamily) -> &fjall::PartitionHandle {
        &self.partitions[family.prefix()]
    }
}

#[async_trait]
impl SysTabletBackend for FjallBackend {
    fn current_term(&self) -> u64 {
        1
    }

    fn is_leader(&self) -> bool {
        true
    }

    async fn apply(&self, ops: Vec<BackendOp>) -> Result<(), ApplyError> {
        let mut batch = self.keyspace.batch();
        for op in &ops {
            if let BackendOp::Insert { family, id, .. } = op {
                let existing = self
                    .partition(*family)
                    .get(id.as_bytes())
                    .context("read existing entry")?;
                if existing.is_some() {
                    return Err(ApplyError::AlreadyPresent(format!(
                        "{}/{id}",
                        family.prefix()
                    )));
                }
            }
        }
        for op in ops {
            match op {
                BackendOp::Upsert { family, id, value }
                | BackendOp::Insert { family, id, value } => {
                    batch.insert(self.partition(family), id.into_bytes(), value);
                }
                BackendOp::Delete { family, id } => {
                    batch.remove(self.partition(family), id.into_bytes());
                }
            }
        }
        batch.commit().context("commit sys catalog batch")?;
        Ok(())
    }

    fn scan(&self, family: EntryFamily) -> anyhow::Result<Vec<(String, Vec<u8>)>> {
        let mut out = Vec::new();
        for item in self.partition(family).iter() {
            let (key, value) = item.context("scan sys catalog partition")?;
            let id = String::from_utf8(key.to_vec()).context("non-utf8 entry id")?;
            out.push((id, value.to_vec()));
        }
        Ok(out)
    }

    async fn wait_until_caught_up(&self, _timeout: Duration) -> anyhow::Result<()> {
        Ok(())
    }
}
