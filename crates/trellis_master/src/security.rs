//! Certificate-authority and token-signing collaborator seams.
//!
//! The cryptography itself lives outside the catalog; these traits cover
//! exactly what the post-election prepare pipeline and the background key
//! rotation need. Entry payloads are DER blobs the catalog never inspects.

use serde::{Deserialize, Serialize};

/// Private key and self-signed certificate of the cluster's internal CA.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaCredentials {
    pub private_key_der: Vec<u8>,
    pub certificate_der: Vec<u8>,
}

/// The cluster certificate authority.
///
/// `generate` produces fresh credentials without installing them; `init`
/// installs credentials that have already been persisted. The catalog never
/// initializes the CA with non-persisted material.
pub trait CertAuthority: Send + Sync {
    fn generate(&self) -> anyhow::Result<CaCredentials>;

    fn init(&self, creds: CaCredentials) -> anyhow::Result<()>;

    /// The installed CA certificate, if `init` has run.
    fn ca_cert_der(&self) -> Option<Vec<u8>>;
}

/// One token-signing key. `expire_at_unix_secs` bounds the validity of
/// tokens signed with it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSigningKey {
    pub seq_num: i64,
    pub expire_at_unix_secs: u64,
    pub private_key_der: Vec<u8>,
    pub public_key_der: Vec<u8>,
}

/// The authn-token signer.
///
/// Key-rotation protocol: the catalog asks `check_need_key`; if a fresh key
/// comes back it is persisted to the system tablet first and only then
/// handed to `add_key`, after which `try_rotate_key` may switch signing to
/// it.
pub trait TokenSigner: Send + Sync {
    /// Returns a newly generated key if the signer wants one persisted.
    fn check_need_key(&self) -> anyhow::Result<Option<TokenSigningKey>>;

    /// Install a key that has been durably persisted.
    fn add_key(&self, key: TokenSigningKey) -> anyhow::Result<()>;

    /// Switch to the next key if its activation time has arrived.
    fn try_rotate_key(&self) -> anyhow::Result<()>;

    /// Bulk-install keys loaded from the system tablet.
    fn import_keys(&self, keys: Vec<TokenSigningKey>) -> anyhow::Result<()>;

    /// Whether the signer currently holds a non-expired signing key.
    fn is_current_key_valid(&self) -> bool;

    /// Public halves of all held keys, for connect-to-master responses.
    fn public_keys(&self) -> Vec<(i64, Vec<u8>)>;
}
