//! Leader-side catalog manager for a Trellis cluster.
//!
//! A small set of masters maintains the authoritative directory of tables,
//! their schemas and partitioning, and the placement of every tablet's
//! replicas across the tablet-server fleet. Exactly one master leads at a
//! time; the others shadow it through the replicated system tablet. This
//! crate is that leader-only subsystem: the in-memory directory and its
//! copy-on-write metadata, the request handlers, the tablet-report
//! reconciliation path, and the background machinery that drives tablets
//! toward their desired configuration.
//!
//! Consensus, tablet-server I/O, and cryptography live behind trait seams
//! ([`sys_catalog::SysTabletBackend`], [`ts_admin::TabletServerAdmin`],
//! [`fleet::Fleet`], [`security::CertAuthority`], [`security::TokenSigner`]);
//! the host process wires them up and feeds heartbeats and tablet reports
//! in.

pub mod catalog;
pub mod config;
pub mod cow;
pub mod directory;
pub mod error;
pub mod fleet;
pub mod metadata;
pub mod partition;
pub mod placement;
pub mod reconciler;
pub mod report;
pub mod rpc;
pub mod schema;
pub mod security;
pub mod sys_catalog;
pub mod tasks;
pub mod ts_admin;

pub use catalog::CatalogManager;
pub use config::MasterConfig;
pub use error::{MasterError, MasterErrorCode, MasterResult};

/// Generate an opaque object id (tables, tablets). Stable across renames,
/// unique across time.
pub(crate) fn new_object_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Seconds since the unix epoch.
pub(crate) fn unix_time_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
