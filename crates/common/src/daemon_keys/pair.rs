use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::crypto::{
    bytes_match, random_bytes, AgreementPublic, AgreementSecret, KeyError, SigningKey,
    VerifyingKey,
};

use super::DaemonKeyError;

/// Size of a key id before hex encoding
pub const KEY_ID_BYTES: usize = 16;

const ENDORSEMENT_CONTEXT: &[u8] = b"berth daemon key endorsement v1";

/// Signature by the previous current key over a newer key's public
/// material. Lets a client that pinned the older key accept the newer one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endorsement {
    pub previous_key_id: String,
    /// base64 Ed25519 signature
    pub signature: String,
}

/// Bytes an endorsement signs
fn endorsement_message(
    key_id: &str,
    public_key: &AgreementPublic,
    sign_public: &VerifyingKey,
    previous_key_id: &str,
) -> Vec<u8> {
    let mut msg = Vec::with_capacity(ENDORSEMENT_CONTEXT.len() + 128);
    msg.extend_from_slice(ENDORSEMENT_CONTEXT);
    msg.push(b'\n');
    msg.extend_from_slice(key_id.as_bytes());
    msg.push(b'\n');
    msg.extend_from_slice(previous_key_id.as_bytes());
    msg.push(b'\n');
    msg.extend_from_slice(public_key.as_bytes());
    msg.extend_from_slice(&sign_public.to_bytes());
    msg
}

fn new_key_id() -> Result<String, KeyError> {
    Ok(hex::encode(random_bytes::<KEY_ID_BYTES>()?))
}

/// One generation of the daemon's long-term keys
pub struct DaemonKeyPair {
    key_id: String,
    agreement: AgreementSecret,
    signing: SigningKey,
    created_at: DateTime<Utc>,
    endorsement: Option<Endorsement>,
}

impl std::fmt::Debug for DaemonKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DaemonKeyPair")
            .field("key_id", &self.key_id)
            .field("fingerprint", &self.fingerprint())
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

impl DaemonKeyPair {
    /// A fresh, unendorsed pair
    pub fn generate(created_at: DateTime<Utc>) -> Result<Self, DaemonKeyError> {
        Ok(Self {
            key_id: new_key_id()?,
            agreement: AgreementSecret::generate()?,
            signing: SigningKey::generate()?,
            created_at,
            endorsement: None,
        })
    }

    /// A fresh pair endorsed by `previous`
    pub fn successor(previous: &DaemonKeyPair, created_at: DateTime<Utc>) -> Result<Self, DaemonKeyError> {
        let mut next = Self::generate(created_at)?;
        let msg = endorsement_message(
            &next.key_id,
            &next.agreement.public(),
            &next.signing.verifying_key(),
            &previous.key_id,
        );
        next.endorsement = Some(Endorsement {
            previous_key_id: previous.key_id.clone(),
            signature: previous.signing.sign_base64(&msg),
        });
        Ok(next)
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn endorsement(&self) -> Option<&Endorsement> {
        self.endorsement.as_ref()
    }

    pub fn agreement(&self) -> &AgreementSecret {
        &self.agreement
    }

    pub fn signing(&self) -> &SigningKey {
        &self.signing
    }

    pub fn public_key(&self) -> AgreementPublic {
        self.agreement.public()
    }

    pub fn sign_public(&self) -> VerifyingKey {
        self.signing.verifying_key()
    }

    pub fn fingerprint(&self) -> String {
        self.public_key().fingerprint()
    }

    pub fn public_info(&self) -> PublicKeyInfo {
        PublicKeyInfo {
            key_id: self.key_id.clone(),
            public_key: self.public_key(),
            sign_public: self.sign_public(),
            fingerprint: self.fingerprint(),
            created_at: self.created_at,
            endorsement: self.endorsement.clone(),
        }
    }

    pub(super) fn to_stored(&self) -> StoredKeyPair {
        StoredKeyPair {
            key_id: self.key_id.clone(),
            agreement_private: STANDARD.encode(&self.agreement.to_bytes()[..]),
            signing_private: STANDARD.encode(&self.signing.to_bytes()[..]),
            created_at: self.created_at,
            endorsement: self.endorsement.clone(),
        }
    }

    pub(super) fn from_stored(stored: &StoredKeyPair) -> Result<Self, DaemonKeyError> {
        let decode = |value: &str| {
            STANDARD
                .decode(value)
                .map(zeroize::Zeroizing::new)
                .map_err(|_| DaemonKeyError::Corrupt(format!("bad key encoding for {}", stored.key_id)))
        };
        let agreement = AgreementSecret::from_bytes(&decode(&stored.agreement_private)?)?;
        let signing = SigningKey::from_bytes(&decode(&stored.signing_private)?)?;
        Ok(Self {
            key_id: stored.key_id.clone(),
            agreement,
            signing,
            created_at: stored.created_at,
            endorsement: stored.endorsement.clone(),
        })
    }
}

/// On-disk form of a key pair. Private halves are base64.
#[derive(Serialize, Deserialize)]
pub(super) struct StoredKeyPair {
    pub key_id: String,
    pub agreement_private: String,
    pub signing_private: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endorsement: Option<Endorsement>,
}

impl Drop for StoredKeyPair {
    fn drop(&mut self) {
        use zeroize::Zeroize;
        self.agreement_private.zeroize();
        self.signing_private.zeroize();
    }
}

/// Public half of a [`DaemonKeyPair`], as served by the key query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKeyInfo {
    pub key_id: String,
    /// X25519 agreement key, base64
    pub public_key: AgreementPublic,
    /// Ed25519 signing key, base64
    pub sign_public: VerifyingKey,
    /// As reported by the daemon. Never trusted; recompute with
    /// [`PublicKeyInfo::computed_fingerprint`].
    pub fingerprint: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endorsement: Option<Endorsement>,
}

impl PublicKeyInfo {
    pub fn computed_fingerprint(&self) -> String {
        self.public_key.fingerprint()
    }

    /// Constant-time comparison of both public keys and the key id
    pub fn same_keys(&self, other: &PublicKeyInfo) -> bool {
        let agreement = bytes_match(self.public_key.as_bytes(), other.public_key.as_bytes());
        let signing = bytes_match(&self.sign_public.to_bytes(), &other.sign_public.to_bytes());
        let id = bytes_match(self.key_id.as_bytes(), other.key_id.as_bytes());
        agreement & signing & id
    }

    /// Check that `previous` endorsed this key
    pub fn verify_endorsed_by(&self, previous: &PublicKeyInfo) -> Result<(), DaemonKeyError> {
        let endorsement = self
            .endorsement
            .as_ref()
            .ok_or_else(|| DaemonKeyError::BrokenChain(format!("{} carries no endorsement", self.key_id)))?;
        if endorsement.previous_key_id != previous.key_id {
            return Err(DaemonKeyError::BrokenChain(format!(
                "{} is endorsed by {}, not {}",
                self.key_id, endorsement.previous_key_id, previous.key_id
            )));
        }
        let msg = endorsement_message(
            &self.key_id,
            &self.public_key,
            &self.sign_public,
            &endorsement.previous_key_id,
        );
        previous
            .sign_public
            .verify_base64(&msg, &endorsement.signature)
            .map_err(|_| DaemonKeyError::BrokenChain(format!("bad endorsement on {}", self.key_id)))
    }
}

/// Response of the unauthenticated key query: the current key plus the
/// retained keys, newest first
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyQueryResponse {
    #[serde(flatten)]
    pub current: PublicKeyInfo,
    #[serde(default)]
    pub chain: Vec<PublicKeyInfo>,
}

impl KeyQueryResponse {
    /// Confirm `presented` descends from `pinned` through valid
    /// endorsements. `pinned` must appear in the chain with identical keys.
    pub fn verify_descends_from(&self, pinned: &PublicKeyInfo) -> Result<(), DaemonKeyError> {
        let lineage: Vec<&PublicKeyInfo> =
            std::iter::once(&self.current).chain(self.chain.iter()).collect();

        let position = lineage
            .iter()
            .position(|info| info.key_id == pinned.key_id)
            .ok_or_else(|| {
                DaemonKeyError::BrokenChain(format!("pinned key {} not in chain", pinned.key_id))
            })?;
        if !lineage[position].same_keys(pinned) {
            return Err(DaemonKeyError::BrokenChain(format!(
                "chain entry {} does not match the pinned keys",
                pinned.key_id
            )));
        }

        for window in lineage[..=position].windows(2) {
            window[0].verify_endorsed_by(window[1])?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_key_id_is_16_bytes_hex() {
        let pair = DaemonKeyPair::generate(Utc::now()).unwrap();
        assert_eq!(pair.key_id().len(), KEY_ID_BYTES * 2);
        assert!(hex::decode(pair.key_id()).is_ok());
    }

    #[test]
    fn test_stored_roundtrip_keeps_keys() {
        let pair = DaemonKeyPair::generate(Utc::now()).unwrap();
        let restored = DaemonKeyPair::from_stored(&pair.to_stored()).unwrap();
        assert!(restored.public_info().same_keys(&pair.public_info()));
    }

    #[test]
    fn test_successor_is_endorsed() {
        let first = DaemonKeyPair::generate(Utc::now()).unwrap();
        let second = DaemonKeyPair::successor(&first, Utc::now()).unwrap();
        second
            .public_info()
            .verify_endorsed_by(&first.public_info())
            .unwrap();

        let stranger = DaemonKeyPair::generate(Utc::now()).unwrap();
        assert!(second
            .public_info()
            .verify_endorsed_by(&stranger.public_info())
            .is_err());
    }

    #[test]
    fn test_forged_endorsement_rejected() {
        let first = DaemonKeyPair::generate(Utc::now()).unwrap();
        let attacker = DaemonKeyPair::generate(Utc::now()).unwrap();
        let mut forged = DaemonKeyPair::successor(&attacker, Utc::now()).unwrap().public_info();
        // claim the endorsement came from the pinned key
        if let Some(e) = forged.endorsement.as_mut() {
            e.previous_key_id = first.key_id().to_string();
        }
        assert!(forged.verify_endorsed_by(&first.public_info()).is_err());
    }

    #[test]
    fn test_query_response_json_shape() {
        let pair = DaemonKeyPair::generate(Utc::now()).unwrap();
        let response = KeyQueryResponse {
            current: pair.public_info(),
            chain: vec![],
        };
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["key_id"], pair.key_id());
        assert_eq!(json["public_key"], pair.public_key().to_base64());
        assert_eq!(json["sign_public"], pair.sign_public().to_base64());
        assert!(json["chain"].as_array().unwrap().is_empty());

        let back: KeyQueryResponse = serde_json::from_value(json).unwrap();
        assert_eq!(back, response);
    }
}
