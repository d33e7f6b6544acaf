//! Tablet-server fleet tracking.
//!
//! The registry records which tablet servers are alive (via heartbeats) and
//! hands out descriptors that carry the load signals the placement policy
//! consults. The decaying `recent_replica_creations` counter biases the
//! power-of-two-choices picker away from servers that just received a burst
//! of new replicas.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use crate::metadata::TsId;
use crate::ts_admin::TabletServerAdmin;

/// Halve the recent-creations counter this often.
const CREATIONS_HALF_LIFE: Duration = Duration::from_secs(60);

/// A live tablet server as seen by the master.
pub struct TsDescriptor {
    uuid: TsId,
    rpc_addr: String,
    admin: Arc<dyn TabletServerAdmin>,
    last_heartbeat: Mutex<Instant>,
    /// Replicas currently hosted, from the last heartbeat.
    num_live_replicas: AtomicU64,
    recent_creations: Mutex<DecayingCount>,
}

struct DecayingCount {
    value: f64,
    updated: Instant,
}

impl DecayingCount {
    fn decayed(&self, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.updated);
        self.value * 0.5f64.powf(elapsed.as_secs_f64() / CREATIONS_HALF_LIFE.as_secs_f64())
    }
}

impl TsDescriptor {
    pub fn new(uuid: impl Into<TsId>, rpc_addr: impl Into<String>, admin: Arc<dyn TabletServerAdmin>) -> Self {
        Self {
            uuid: uuid.into(),
            rpc_addr: rpc_addr.into(),
            admin,
            last_heartbeat: Mutex::new(Instant::now()),
            num_live_replicas: AtomicU64::new(0),
            recent_creations: Mutex::new(DecayingCount {
                value: 0.0,
                updated: Instant::now(),
            }),
        }
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn rpc_addr(&self) -> &str {
        &self.rpc_addr
    }

    pub fn admin(&self) -> Arc<dyn TabletServerAdmin> {
        self.admin.clone()
    }

    pub fn mark_heartbeat(&self) {
        *self.last_heartbeat.lock().unwrap() = Instant::now();
    }

    pub fn time_since_heartbeat(&self) -> Duration {
        self.last_heartbeat.lock().unwrap().elapsed()
    }

    pub fn set_num_live_replicas(&self, count: u64) {
        self.num_live_replicas.store(count, Ordering::Relaxed);
    }

    pub fn num_live_replicas(&self) -> u64 {
        self.num_live_replicas.load(Ordering::Relaxed)
    }

    /// Bump the decaying counter after this server is chosen for a new
    /// replica, so concurrent placement rounds spread their picks.
    pub fn increment_recent_replica_creations(&self) {
        let mut count = self.recent_creations.lock().unwrap();
        let now = Instant::now();
        count.value = count.decayed(now) + 1.0;
        count.updated = now;
    }

    pub fn recent_replica_creations(&self) -> f64 {
        let count = self.recent_creations.lock().unwrap();
        count.decayed(Instant::now())
    }

    /// Load estimate used by the replica picker.
    pub fn replica_load(&self) -> f64 {
        self.recent_replica_creations() + self.num_live_replicas() as f64
    }
}

impl std::fmt::Debug for TsDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TsDescriptor")
            .field("uuid", &self.uuid)
            .field("rpc_addr", &self.rpc_addr)
            .finish()
    }
}

/// Read-side view of the fleet consumed by the catalog.
pub trait Fleet: Send + Sync {
    /// Descriptors of all live tablet servers.
    fn live_descriptors(&self) -> Vec<Arc<TsDescriptor>>;

    fn lookup(&self, uuid: &str) -> Option<Arc<TsDescriptor>>;
}

/// Registry of registered tablet servers, keyed by permanent uuid.
///
/// A server is live while its last heartbeat is within the liveness window.
pub struct FleetRegistry {
    liveness_window: Duration,
    servers: RwLock<HashMap<TsId, Arc<TsDescriptor>>>,
}

impl FleetRegistry {
    pub fn new(liveness_window: Duration) -> Self {
        Self {
            liveness_window,
            servers: RwLock::new(HashMap::new()),
        }
    }

    /// Register (or re-register) a tablet server. Replaces any previous
    /// registration for the same uuid.
    pub fn register(
        &self,
        uuid: impl Into<TsId>,
        rpc_addr: impl Into<String>,
        admin: Arc<dyn TabletServerAdmin>,
    ) -> Arc<TsDescriptor> {
        let descriptor = Arc::new(TsDescriptor::new(uuid, rpc_addr, admin));
        self.servers
            .write()
            .unwrap()
            .insert(descriptor.uuid.clone(), descriptor.clone());
        descriptor
    }

    pub fn heartbeat(&self, uuid: &str, num_live_replicas: u64) -> bool {
        match self.lookup(uuid) {
            Some(descriptor) => {
                descriptor.mark_heartbeat();
                descriptor.set_num_live_replicas(num_live_replicas);
                true
            }
            None => false,
        }
    }

    pub fn descriptor_count(&self) -> usize {
        self.servers.read().unwrap().len()
    }
}

impl Fleet for FleetRegistry {
    fn live_descriptors(&self) -> Vec<Arc<TsDescriptor>> {
        let mut live: Vec<Arc<TsDescriptor>> = self
            .servers
            .read()
            .unwrap()
            .values()
            .filter(|d| d.time_since_heartbeat() <= self.liveness_window)
            .cloned()
            .collect();
        live.sort_by(|a, b| a.uuid.cmp(&b.uuid));
        live
    }

    fn lookup(&self, uuid: &str) -> Option<Arc<TsDescriptor>> {
        self.servers.read().unwrap().get(uuid).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::ts_admin::{
        AlterSchemaRequest, ChangeConfigRequest, CreateTabletRequest, DeleteTabletRequest,
        TsAdminError,
    };

    struct NullAdmin;

    #[async_trait]
    impl TabletServerAdmin for NullAdmin {
        async fn create_tablet(&self, _req: CreateTabletRequest) -> Result<(), TsAdminError> {
            Ok(())
        }
        async fn delete_tablet(&self, _req: DeleteTabletRequest) -> Result<(), TsAdminError> {
            Ok(())
        }
        async fn alter_schema(&self, _req: AlterSchemaRequest) -> Result<(), TsAdminError> {
            Ok(())
        }
        async fn change_config(&self, _req: ChangeConfigRequest) -> Result<(), TsAdminError> {
            Ok(())
        }
    }

    #[test]
    fn liveness_follows_heartbeats() {
        let registry = FleetRegistry::new(Duration::from_millis(50));
        registry.register("ts-a", "127.0.0.1:7050", Arc::new(NullAdmin));
        assert_eq!(registry.live_descriptors().len(), 1);

        std::thread::sleep(Duration::from_millis(80));
        assert!(registry.live_descriptors().is_empty());

        assert!(registry.heartbeat("ts-a", 4));
        let live = registry.live_descriptors();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].num_live_replicas(), 4);
    }

    #[test]
    fn recent_creations_decay() {
        let registry = FleetRegistry::new(Duration::from_secs(10));
        let desc = registry.register("ts-a", "127.0.0.1:7050", Arc::new(NullAdmin));
        desc.increment_recent_replica_creations();
        desc.increment_recent_replica_creations();
        let now = desc.recent_replica_creations();
        assert!(now > 1.9 && now <= 2.0, "got {now}");

        // Manually age the counter a half-life.
        {
            let mut count = desc.recent_creations.lock().unwrap();
            count.updated = Instant::now() - CREATIONS_HALF_LIFE;
        }
        let aged = desc.recent_replica_creations();
        assert!(aged > 0.9 && aged < 1.1, "got {aged}");
    }

    #[test]
    fn unknown_heartbeat_requires_registration() {
        let registry = FleetRegistry::new(Duration::from_secs(10));
        assert!(!registry.heartbeat("ts-z", 0));
    }
}
