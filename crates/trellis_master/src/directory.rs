//! Live table/tablet objects and the in-memory directory.
//!
//! Lock order, respected on every write path:
//! 1. leadership gate (read or write)
//! 2. global directory lock (by-id and by-name maps)
//! 3. table metadata lock
//! 4. tablet metadata locks, in ascending tablet-id order
//! 5. per-entity volatile locks (table first, then tablet)
//!
//! Commits run in reverse: tablet metadata first, then table metadata.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use crate::cow::{CowCell, CowReadGuard, CowWriteGuard};
use crate::metadata::{PersistentTable, PersistentTablet, TableId, TabletId};

/// A task currently in flight on behalf of a table, abortable when the table
/// goes away or leadership is lost.
pub trait PendingTask: Send + Sync {
    fn task_id(&self) -> u64;

    fn description(&self) -> String;

    fn abort(&self);
}

/// A table's live object: the copy-on-write persistent record plus volatile
/// bookkeeping that never hits the system tablet.
pub struct TableInfo {
    id: TableId,
    metadata: CowCell<PersistentTable>,
    tablets: RwLock<TableTablets>,
    tasks: Mutex<HashMap<u64, Arc<dyn PendingTask>>>,
}

#[derive(Default)]
struct TableTablets {
    /// Partition begin key -> tablet, for all live (non-dropped) tablets.
    by_key: BTreeMap<Vec<u8>, Arc<TabletInfo>>,
    /// Multiset of reported schema versions across live tablets; `None` is
    /// the not-yet-reported sentinel.
    version_counts: BTreeMap<Option<u64>, usize>,
}

impl TableInfo {
    pub fn new(id: impl Into<TableId>, record: PersistentTable) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            metadata: CowCell::new(record),
            tablets: RwLock::new(TableTablets::default()),
            tasks: Mutex::new(HashMap::new()),
        })
    }

    pub fn id(&self) -> &TableId {
        &self.id
    }

    pub fn metadata(&self) -> &CowCell<PersistentTable> {
        &self.metadata
    }

    pub fn read(&self) -> CowReadGuard<'_, PersistentTable> {
        self.metadata.read()
    }

    pub async fn write(&self) -> CowWriteGuard<'_, PersistentTable> {
        self.metadata.write().await
    }

    /// Swap tablets in and out of the ordered map, keeping the
    /// schema-version multiset in step. New tablets enter with the
    /// not-yet-reported sentinel.
    pub fn add_remove_tablets(&self, add: &[Arc<TabletInfo>], remove: &[Arc<TabletInfo>]) {
        let mut tablets = self.tablets.write().unwrap();
        for tablet in remove {
            let key = tablet.partition_key_start();
            if tablets.by_key.remove(&key).is_some() {
                let version = tablet.reported_schema_version();
                decrement(&mut tablets.version_counts, version);
            }
        }
        for tablet in add {
            let key = tablet.partition_key_start();
            let version = tablet.reported_schema_version();
            // A replacement tablet displaces its predecessor at the same
            // partition start.
            if let Some(old) = tablets.by_key.insert(key, tablet.clone()) {
                decrement(&mut tablets.version_counts, old.reported_schema_version());
            }
            *tablets.version_counts.entry(version).or_insert(0) += 1;
        }
    }

    /// All live tablets in partition-key order.
    pub fn all_tablets(&self) -> Vec<Arc<TabletInfo>> {
        self.tablets
            .read()
            .unwrap()
            .by_key
            .values()
            .cloned()
            .collect()
    }

    pub fn num_tablets(&self) -> usize {
        self.tablets.read().unwrap().by_key.len()
    }

    /// Live tablets from the one covering `start` onward, up to `max`
    /// (0 means no limit).
    pub fn tablets_in_range(&self, start: &[u8], max: usize) -> Vec<Arc<TabletInfo>> {
        use std::ops::Bound;

        let tablets = self.tablets.read().unwrap();
        let mut out = Vec::new();
        // The tablet covering `start` may begin before it.
        if let Some((_, tablet)) = tablets
            .by_key
            .range::<[u8], _>((Bound::Unbounded, Bound::Included(start)))
            .next_back()
        {
            let end = tablet.partition_key_end();
            if end.is_empty() || start < end.as_slice() {
                out.push(tablet.clone());
            }
        }
        for (_, tablet) in tablets
            .by_key
            .range::<[u8], _>((Bound::Excluded(start), Bound::Unbounded))
        {
            if max != 0 && out.len() >= max {
                break;
            }
            out.push(tablet.clone());
        }
        if max != 0 {
            out.truncate(max);
        }
        out
    }

    /// Move one live tablet's reported schema version in the multiset.
    pub(crate) fn note_reported_schema_version(
        &self,
        old_version: Option<u64>,
        new_version: Option<u64>,
    ) {
        if old_version == new_version {
            return;
        }
        let mut tablets = self.tablets.write().unwrap();
        decrement(&mut tablets.version_counts, old_version);
        *tablets.version_counts.entry(new_version).or_insert(0) += 1;
    }

    /// Whether any live tablet still runs a schema older than `version`.
    pub fn is_alter_in_progress(&self, version: u64) -> bool {
        let tablets = self.tablets.read().unwrap();
        tablets
            .version_counts
            .iter()
            .any(|(reported, count)| *count > 0 && reported.map_or(true, |v| v < version))
    }

    /// Copy of the schema-version multiset, for diagnostics and tests.
    pub fn schema_version_counts(&self) -> BTreeMap<Option<u64>, usize> {
        self.tablets.read().unwrap().version_counts.clone()
    }

    pub fn add_task(&self, task: Arc<dyn PendingTask>) {
        self.tasks.lock().unwrap().insert(task.task_id(), task);
    }

    pub fn remove_task(&self, task_id: u64) {
        self.tasks.lock().unwrap().remove(&task_id);
    }

    pub fn pending_task_count(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }

    /// Abort every pending task and drop the table's references to them.
    pub fn abort_tasks(&self) {
        let tasks: Vec<Arc<dyn PendingTask>> =
            self.tasks.lock().unwrap().drain().map(|(_, t)| t).collect();
        for task in tasks {
            task.abort();
        }
    }
}

impl std::fmt::Debug for TableInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableInfo").field("id", &self.id).finish()
    }
}

fn decrement(counts: &mut BTreeMap<Option<u64>, usize>, key: Option<u64>) {
    if let Some(count) = counts.get_mut(&key) {
        *count -= 1;
        if *count == 0 {
            counts.remove(&key);
        }
    }
}

/// A tablet's live object. Holds a strong reference to its table; the table
/// holds one back through its ordered map, and `DeleteTable` breaks the pair
/// by clearing the map entries last.
pub struct TabletInfo {
    id: TabletId,
    table: Arc<TableInfo>,
    metadata: CowCell<PersistentTablet>,
    volatile: Mutex<TabletVolatile>,
}

#[derive(Default)]
struct TabletVolatile {
    last_create_time: Option<Instant>,
    reported_schema_version: Option<u64>,
}

impl TabletInfo {
    pub fn new(id: impl Into<TabletId>, table: Arc<TableInfo>, record: PersistentTablet) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            table,
            metadata: CowCell::new(record),
            volatile: Mutex::new(TabletVolatile::default()),
        })
    }

    pub fn id(&self) -> &TabletId {
        &self.id
    }

    pub fn table(&self) -> &Arc<TableInfo> {
        &self.table
    }

    pub fn metadata(&self) -> &CowCell<PersistentTablet> {
        &self.metadata
    }

    pub fn read(&self) -> CowReadGuard<'_, PersistentTablet> {
        self.metadata.read()
    }

    pub async fn write(&self) -> CowWriteGuard<'_, PersistentTablet> {
        self.metadata.write().await
    }

    pub fn partition_key_start(&self) -> Vec<u8> {
        self.metadata.read().partition.begin.clone()
    }

    pub fn partition_key_end(&self) -> Vec<u8> {
        self.metadata.read().partition.end.clone()
    }

    pub fn set_last_create_time(&self, when: Instant) {
        self.volatile.lock().unwrap().last_create_time = Some(when);
    }

    pub fn last_create_time(&self) -> Option<Instant> {
        self.volatile.lock().unwrap().last_create_time
    }

    /// Record the schema version this tablet last reported, updating the
    /// owning table's multiset.
    pub fn set_reported_schema_version(&self, version: u64) {
        let old = {
            let mut volatile = self.volatile.lock().unwrap();
            std::mem::replace(&mut volatile.reported_schema_version, Some(version))
        };
        self.table.note_reported_schema_version(old, Some(version));
    }

    pub fn reported_schema_version(&self) -> Option<u64> {
        self.volatile.lock().unwrap().reported_schema_version
    }
}

impl std::fmt::Debug for TabletInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TabletInfo")
            .field("id", &self.id)
            .field("table", self.table.id())
            .finish()
    }
}

/// Acquire metadata write locks over a group of tablets. The slice must
/// already be in ascending tablet-id order; group acquisition in a fixed
/// order is what keeps concurrent batch writers deadlock-free.
pub async fn lock_tablet_group<'a>(
    tablets: &'a [Arc<TabletInfo>],
) -> Vec<CowWriteGuard<'a, PersistentTablet>> {
    debug_assert!(tablets.windows(2).all(|w| w[0].id() <= w[1].id()));
    let mut guards = Vec::with_capacity(tablets.len());
    for tablet in tablets {
        guards.push(tablet.metadata.write().await);
    }
    guards
}

pub fn sort_tablets_by_id(tablets: &mut [Arc<TabletInfo>]) {
    tablets.sort_by(|a, b| a.id().cmp(b.id()));
}

/// Commit a group of tablet guards, newest acquisition first.
pub fn commit_group(guards: Vec<CowWriteGuard<'_, PersistentTablet>>) {
    for guard in guards.into_iter().rev() {
        guard.commit();
    }
}

/// The in-memory directory: all tables and tablets the master knows about,
/// indexed by id and (for live tables) by name. Guarded by one
/// readers/writer lock in the catalog manager.
#[derive(Default)]
pub struct Directory {
    tables_by_id: HashMap<TableId, Arc<TableInfo>>,
    tables_by_name: HashMap<String, Arc<TableInfo>>,
    tablets: HashMap<TabletId, Arc<TabletInfo>>,
    /// Names claimed by in-flight create/rename operations.
    reserved_names: HashSet<String>,
}

impl Directory {
    pub fn clear(&mut self) {
        self.tables_by_id.clear();
        self.tables_by_name.clear();
        self.tablets.clear();
        self.reserved_names.clear();
    }

    pub fn table_by_id(&self, id: &str) -> Option<Arc<TableInfo>> {
        self.tables_by_id.get(id).cloned()
    }

    pub fn table_by_name(&self, name: &str) -> Option<Arc<TableInfo>> {
        self.tables_by_name.get(name).cloned()
    }

    pub fn tablet(&self, id: &str) -> Option<Arc<TabletInfo>> {
        self.tablets.get(id).cloned()
    }

    pub fn all_tables(&self) -> Vec<Arc<TableInfo>> {
        let mut tables: Vec<_> = self.tables_by_id.values().cloned().collect();
        tables.sort_by(|a, b| a.id().cmp(b.id()));
        tables
    }

    pub fn all_tablets(&self) -> Vec<Arc<TabletInfo>> {
        self.tablets.values().cloned().collect()
    }

    pub fn num_tables(&self) -> usize {
        self.tables_by_id.len()
    }

    /// Whether `name` is taken by a live table or reserved by an in-flight
    /// operation.
    pub fn is_name_unavailable(&self, name: &str) -> bool {
        self.tables_by_name.contains_key(name) || self.reserved_names.contains(name)
    }

    pub fn reserve_name(&mut self, name: &str) -> bool {
        self.reserved_names.insert(name.to_string())
    }

    pub fn release_name(&mut self, name: &str) {
        self.reserved_names.remove(name);
    }

    /// Publish a table under both indexes.
    pub fn insert_table(&mut self, table: Arc<TableInfo>, name: &str) {
        self.tables_by_id.insert(table.id().clone(), table.clone());
        self.tables_by_name.insert(name.to_string(), table);
    }

    /// Publish a deleted table: reachable by id, invisible by name.
    pub fn insert_table_by_id_only(&mut self, table: Arc<TableInfo>) {
        self.tables_by_id.insert(table.id().clone(), table);
    }

    /// Drop a deleted table's name mapping; the id mapping stays forever.
    pub fn remove_table_name(&mut self, name: &str) {
        self.tables_by_name.remove(name);
    }

    /// Move a live table's name mapping during a rename.
    pub fn rename_table(&mut self, old_name: &str, new_name: &str, table: Arc<TableInfo>) {
        self.tables_by_name.remove(old_name);
        self.tables_by_name.insert(new_name.to_string(), table);
    }

    pub fn insert_tablet(&mut self, tablet: Arc<TabletInfo>) {
        self.tablets.insert(tablet.id().clone(), tablet);
    }
}
