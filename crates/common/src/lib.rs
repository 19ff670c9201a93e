/**
 * Append-only, signed record of security
 *  relevant daemon activity.
 */
pub mod audit;
/**
 * Request signing and verification for the
 *  daemon's HTTP api.
 */
pub mod auth;
pub mod clock;
/**
 * Cryptographic types and operations.
 *  - Symmetric secrets, AEAD and key derivation
 *  - Agreement and signing key pairs
 */
pub mod crypto;
/**
 * The daemon's long-term keys: generation,
 *  endorsed rotation and bounded retention.
 */
pub mod daemon_keys;
/**
 * Signed, encrypted operator-to-daemon
 *  messages and replay protection.
 */
pub mod envelope;
pub mod error;
/**
 * Whole-file encryption to a sibling
 *  `.enc` file.
 */
pub mod file_envelope;
pub mod fs;
/**
 * Per-application master keys held in the
 *  OS credential vault, with derived keys
 *  per purpose.
 */
pub mod master_key;
/**
 * Local encrypted secret storage with
 *  pluggable remote providers.
 */
pub mod secrets;
/**
 * Trusted identities, roles and first-use
 *  pinning of daemon keys.
 */
pub mod trust;
/**
 * Helper for setting build version information
 *  at compile time.
 */
pub mod version;

pub mod prelude {
    pub use crate::audit::{AuditEvent, AuditLog, Outcome};
    pub use crate::clock::{Clock, ManualClock, SystemClock};
    pub use crate::crypto::{AgreementPublic, Secret, SigningKey, VerifyingKey};
    pub use crate::daemon_keys::{DaemonKeyManager, KeyManagerOptions, KeyQueryResponse, PublicKeyInfo};
    pub use crate::envelope::{Envelope, ReplayGuard, SecretBundle};
    pub use crate::error::{Classify, ErrorKind};
    pub use crate::master_key::{AppIdentity, MasterKey, MasterKeyStore, Purpose};
    pub use crate::secrets::{SecretStore, SecretStoreError};
    pub use crate::trust::{OperatorIdentity, Operation, Role, TrustStore, TrustedKey};
    pub use crate::version::build_info;
}
