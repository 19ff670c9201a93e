use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::role::{Operation, Role};
use super::TrustError;
use crate::clock::Clock;
use crate::crypto::{fingerprints_match, AgreementPublic, VerifyingKey};
use crate::daemon_keys::PublicKeyInfo;
use crate::fs::write_atomic_private;

const STORE_FORMAT: u32 = 1;
const SELF_SIGNED: &str = "self";

/// A known identity: an operator registered with a daemon, or a daemon
/// pinned by a CLI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustedKey {
    pub key_id: String,
    /// X25519 agreement key
    pub public_key: AgreementPublic,
    /// Ed25519 signing key
    pub sign_public: VerifyingKey,
    /// Always computed locally from `public_key`
    pub fingerprint: String,
    pub role: Role,
    pub added_by: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

impl TrustedKey {
    /// View a pinned daemon entry as key query output, for chain checks
    pub fn to_public_info(&self) -> PublicKeyInfo {
        PublicKeyInfo {
            key_id: self.key_id.clone(),
            public_key: self.public_key,
            sign_public: self.sign_public,
            fingerprint: self.fingerprint.clone(),
            created_at: self.created_at,
            endorsement: None,
        }
    }
}

/// Registration of a new operator identity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddIdentityRequest {
    pub public_key: AgreementPublic,
    pub sign_public: VerifyingKey,
    pub role: Role,
    #[serde(default)]
    pub email: Option<String>,
    /// Fingerprint the caller believes the key has. Only compared.
    #[serde(default)]
    pub fingerprint: Option<String>,
}

#[derive(Default, Serialize, Deserialize)]
struct StoreFile {
    format: u32,
    #[serde(default)]
    identities: Vec<TrustedKey>,
    #[serde(default)]
    pins: Vec<TrustedKey>,
}

#[derive(Clone, Default)]
struct Entries {
    /// by fingerprint
    identities: BTreeMap<String, TrustedKey>,
    /// by daemon address
    pins: BTreeMap<String, TrustedKey>,
}

/// File-backed registry of trusted identities.
///
/// Every mutation is persisted (atomic rename) before the in-memory view
/// changes.
pub struct TrustStore {
    path: Option<PathBuf>,
    clock: Arc<dyn Clock>,
    entries: RwLock<Entries>,
}

impl std::fmt::Debug for TrustStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let entries = self.entries.read();
        f.debug_struct("TrustStore")
            .field("path", &self.path)
            .field("identities", &entries.identities.len())
            .field("pins", &entries.pins.len())
            .finish()
    }
}

impl TrustStore {
    pub fn in_memory(clock: Arc<dyn Clock>) -> Self {
        Self {
            path: None,
            clock,
            entries: RwLock::new(Entries::default()),
        }
    }

    pub fn open(path: impl AsRef<Path>, clock: Arc<dyn Clock>) -> Result<Self, TrustError> {
        let path = path.as_ref().to_path_buf();
        let mut entries = Entries::default();
        if path.exists() {
            let file: StoreFile = serde_json::from_slice(&std::fs::read(&path)?)?;
            for identity in file.identities {
                // never trust a fingerprint read back from disk either
                let fingerprint = identity.public_key.fingerprint();
                if !fingerprints_match(&fingerprint, &identity.fingerprint) {
                    return Err(TrustError::FingerprintMismatch {
                        claimed: identity.fingerprint,
                        computed: fingerprint,
                    });
                }
                entries.identities.insert(fingerprint, identity);
            }
            for pin in file.pins {
                if let Some(address) = pin.address.clone() {
                    entries.pins.insert(address, pin);
                }
            }
            tracing::debug!(
                path = %path.display(),
                identities = entries.identities.len(),
                pins = entries.pins.len(),
                "trust store loaded"
            );
        }
        Ok(Self {
            path: Some(path),
            clock,
            entries: RwLock::new(entries),
        })
    }

    fn persist(&self, entries: &Entries) -> Result<(), TrustError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let file = StoreFile {
            format: STORE_FORMAT,
            identities: entries.identities.values().cloned().collect(),
            pins: entries.pins.values().cloned().collect(),
        };
        write_atomic_private(path, &serde_json::to_vec_pretty(&file)?)?;
        Ok(())
    }

    pub fn get(&self, fingerprint: &str) -> Option<TrustedKey> {
        self.entries.read().identities.get(fingerprint).cloned()
    }

    pub fn list(&self) -> Vec<TrustedKey> {
        self.entries.read().identities.values().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().identities.is_empty()
    }

    /// Resolve a caller and check it may perform `operation`
    pub fn authorize(&self, fingerprint: &str, operation: Operation) -> Result<TrustedKey, TrustError> {
        let caller = self
            .get(fingerprint)
            .ok_or_else(|| TrustError::UnknownCaller(fingerprint.to_string()))?;
        check(&caller, operation)?;
        Ok(caller)
    }

    /// Register an identity.
    ///
    /// The first identity ever registered becomes `Owner` and needs no
    /// authorizer. After that the authorizer must hold `Admin` or above
    /// and cannot grant a role above its own.
    pub fn add_identity(
        &self,
        request: AddIdentityRequest,
        authorizer: Option<&str>,
    ) -> Result<TrustedKey, TrustError> {
        let fingerprint = request.public_key.fingerprint();
        if let Some(claimed) = &request.fingerprint {
            if !fingerprints_match(claimed, &fingerprint) {
                return Err(TrustError::FingerprintMismatch {
                    claimed: claimed.clone(),
                    computed: fingerprint,
                });
            }
        }

        let mut entries = self.entries.write();
        if entries.identities.contains_key(&fingerprint) {
            return Err(TrustError::AlreadyExists(fingerprint));
        }

        let (role, added_by) = if entries.identities.is_empty() {
            if request.role != Role::Owner {
                tracing::info!(
                    requested = %request.role,
                    "first identity is always registered as owner"
                );
            }
            let added_by = authorizer.unwrap_or(SELF_SIGNED).to_string();
            (Role::Owner, added_by)
        } else {
            let authorizer = authorizer.ok_or(TrustError::Forbidden {
                caller: None,
                operation: Operation::AddIdentity,
                reason: "registration requires an authorizing identity",
            })?;
            let caller = lookup(&entries, authorizer)?;
            check(caller, Operation::AddIdentity)?;
            if request.role > caller.role {
                return Err(TrustError::Forbidden {
                    caller: Some(caller.fingerprint.clone()),
                    operation: Operation::AddIdentity,
                    reason: "cannot grant a role above the caller's own",
                });
            }
            (request.role, caller.fingerprint.clone())
        };

        let identity = TrustedKey {
            key_id: fingerprint.clone(),
            public_key: request.public_key,
            sign_public: request.sign_public,
            fingerprint: fingerprint.clone(),
            role,
            added_by,
            created_at: self.clock.now(),
            email: request.email,
            address: None,
        };

        let mut next = entries.clone();
        next.identities.insert(fingerprint.clone(), identity.clone());
        self.persist(&next)?;
        *entries = next;

        tracing::info!(
            fingerprint = %identity.fingerprint,
            role = %identity.role,
            added_by = %identity.added_by,
            "identity added"
        );
        Ok(identity)
    }

    /// Remove an identity. Only an owner may revoke an owner, and the last
    /// owner cannot be revoked.
    pub fn revoke_identity(&self, fingerprint: &str, authorizer: &str) -> Result<TrustedKey, TrustError> {
        let mut entries = self.entries.write();
        let caller = lookup(&entries, authorizer)?.clone();
        check(&caller, Operation::RevokeIdentity)?;

        let target = entries
            .identities
            .get(fingerprint)
            .cloned()
            .ok_or_else(|| TrustError::NotFound(fingerprint.to_string()))?;
        guard_owner_change(&entries, &caller, &target, Operation::RevokeIdentity)?;

        let mut next = entries.clone();
        next.identities.remove(fingerprint);
        self.persist(&next)?;
        *entries = next;

        tracing::warn!(
            fingerprint = %target.fingerprint,
            role = %target.role,
            revoked_by = %caller.fingerprint,
            "identity revoked"
        );
        Ok(target)
    }

    /// Change the role of an existing identity
    pub fn change_role(&self, fingerprint: &str, role: Role, authorizer: &str) -> Result<TrustedKey, TrustError> {
        let mut entries = self.entries.write();
        let caller = lookup(&entries, authorizer)?.clone();
        check(&caller, Operation::ChangeRole)?;
        if role > caller.role {
            return Err(TrustError::Forbidden {
                caller: Some(caller.fingerprint.clone()),
                operation: Operation::ChangeRole,
                reason: "cannot grant a role above the caller's own",
            });
        }

        let target = entries
            .identities
            .get(fingerprint)
            .cloned()
            .ok_or_else(|| TrustError::NotFound(fingerprint.to_string()))?;
        if target.role == Role::Owner && role != Role::Owner {
            guard_owner_change(&entries, &caller, &target, Operation::ChangeRole)?;
        }

        let mut updated = target.clone();
        updated.role = role;
        let mut next = entries.clone();
        next.identities.insert(fingerprint.to_string(), updated.clone());
        self.persist(&next)?;
        *entries = next;

        tracing::warn!(
            fingerprint = %updated.fingerprint,
            from = %target.role,
            to = %role,
            changed_by = %caller.fingerprint,
            "identity role changed"
        );
        Ok(updated)
    }

    /// Pin a daemon's keys under `address` (CLI side). Replaces any
    /// existing pin for the address.
    pub fn pin(&self, address: &str, info: &PublicKeyInfo, role: Role) -> Result<TrustedKey, TrustError> {
        let pinned = TrustedKey {
            key_id: info.key_id.clone(),
            public_key: info.public_key,
            sign_public: info.sign_public,
            fingerprint: info.computed_fingerprint(),
            role,
            added_by: SELF_SIGNED.to_string(),
            created_at: self.clock.now(),
            email: None,
            address: Some(address.to_string()),
        };

        let mut entries = self.entries.write();
        let mut next = entries.clone();
        next.pins.insert(address.to_string(), pinned.clone());
        self.persist(&next)?;
        *entries = next;

        tracing::info!(address, fingerprint = %pinned.fingerprint, "daemon pinned");
        Ok(pinned)
    }

    pub fn pinned(&self, address: &str) -> Option<TrustedKey> {
        self.entries.read().pins.get(address).cloned()
    }

    pub fn pins(&self) -> Vec<TrustedKey> {
        self.entries.read().pins.values().cloned().collect()
    }

    /// Drop the pin for `address`; returns whether one existed
    pub fn forget(&self, address: &str) -> Result<bool, TrustError> {
        let mut entries = self.entries.write();
        if !entries.pins.contains_key(address) {
            return Ok(false);
        }
        let mut next = entries.clone();
        next.pins.remove(address);
        self.persist(&next)?;
        *entries = next;
        tracing::warn!(address, "daemon pin removed");
        Ok(true)
    }
}

fn lookup<'a>(entries: &'a Entries, fingerprint: &str) -> Result<&'a TrustedKey, TrustError> {
    entries
        .identities
        .get(fingerprint)
        .ok_or_else(|| TrustError::UnknownCaller(fingerprint.to_string()))
}

fn check(caller: &TrustedKey, operation: Operation) -> Result<(), TrustError> {
    if caller.role.allows(operation.required_role()) {
        Ok(())
    } else {
        tracing::warn!(
            caller = %caller.fingerprint,
            role = %caller.role,
            operation = %operation,
            "operation denied"
        );
        Err(TrustError::Forbidden {
            caller: Some(caller.fingerprint.clone()),
            operation,
            reason: "insufficient role",
        })
    }
}

fn guard_owner_change(
    entries: &Entries,
    caller: &TrustedKey,
    target: &TrustedKey,
    operation: Operation,
) -> Result<(), TrustError> {
    if target.role != Role::Owner {
        return Ok(());
    }
    if caller.role != Role::Owner {
        return Err(TrustError::Forbidden {
            caller: Some(caller.fingerprint.clone()),
            operation,
            reason: "only an owner may demote or revoke an owner",
        });
    }
    let owners = entries
        .identities
        .values()
        .filter(|identity| identity.role == Role::Owner)
        .count();
    if owners <= 1 {
        return Err(TrustError::LastOwner);
    }
    Ok(())
}
