use std::path::Path;

use zeroize::Zeroizing;

use super::role::Role;
use super::store::AddIdentityRequest;
use crate::crypto::{AgreementPublic, AgreementSecret, KeyError, Secret, SecretError, SigningKey, VerifyingKey};
use crate::error::{Classify, ErrorKind};
use crate::fs::{ensure_private_dir, write_atomic_private};

const AGREEMENT_TAG: &str = "BERTH AGREEMENT PRIVATE KEY";
const SIGNING_TAG: &str = "BERTH SIGNING PRIVATE KEY";

#[derive(Debug, thiserror::Error)]
pub enum OperatorIdentityError {
    #[error("identity file is not valid PEM: {0}")]
    Pem(#[from] pem::PemError),
    #[error("identity file has no {0} block")]
    MissingBlock(&'static str),
    #[error("identity file failed authentication")]
    Unseal,
    #[error("key error: {0}")]
    Key(#[from] KeyError),
    #[error("secret error: {0}")]
    Secret(#[from] SecretError),
    #[error("identity io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Classify for OperatorIdentityError {
    fn kind(&self) -> ErrorKind {
        match self {
            OperatorIdentityError::Pem(_) | OperatorIdentityError::MissingBlock(_) => {
                ErrorKind::InvalidInput
            }
            OperatorIdentityError::Unseal => ErrorKind::AuthFailure,
            OperatorIdentityError::Key(e) => e.kind(),
            OperatorIdentityError::Secret(e) => e.kind(),
            OperatorIdentityError::Io(_) => ErrorKind::StorageFailure,
        }
    }
}

/// The operator's long-term keys, as held by the CLI.
///
/// On disk this is a pair of PEM blocks, encrypted as a whole with a key
/// derived from the master key (`Purpose::OperatorIdentity`).
#[derive(Clone)]
pub struct OperatorIdentity {
    agreement: AgreementSecret,
    signing: SigningKey,
}

impl std::fmt::Debug for OperatorIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperatorIdentity")
            .field("fingerprint", &self.fingerprint())
            .finish_non_exhaustive()
    }
}

impl OperatorIdentity {
    pub fn generate() -> Result<Self, OperatorIdentityError> {
        Ok(Self {
            agreement: AgreementSecret::generate()?,
            signing: SigningKey::generate()?,
        })
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

    /// Registration request for this identity
    pub fn add_identity_request(&self, role: Role, email: Option<String>) -> AddIdentityRequest {
        AddIdentityRequest {
            public_key: self.public_key(),
            sign_public: self.sign_public(),
            role,
            email,
            fingerprint: Some(self.fingerprint()),
        }
    }

    pub fn to_pem(&self) -> Zeroizing<String> {
        let blocks = [
            pem::Pem::new(AGREEMENT_TAG, self.agreement.to_bytes().to_vec()),
            pem::Pem::new(SIGNING_TAG, self.signing.to_bytes().to_vec()),
        ];
        Zeroizing::new(pem::encode_many(&blocks))
    }

    pub fn from_pem(input: &str) -> Result<Self, OperatorIdentityError> {
        let blocks = pem::parse_many(input)?;
        let block = |tag: &'static str| {
            blocks
                .iter()
                .find(|block| block.tag() == tag)
                .map(|block| Zeroizing::new(block.contents().to_vec()))
                .ok_or(OperatorIdentityError::MissingBlock(tag))
        };
        Ok(Self {
            agreement: AgreementSecret::from_bytes(&block(AGREEMENT_TAG)?)?,
            signing: SigningKey::from_bytes(&block(SIGNING_TAG)?)?,
        })
    }

    /// Encrypt with `key` and write atomically (0600)
    pub fn save(&self, path: &Path, key: &Secret) -> Result<(), OperatorIdentityError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            ensure_private_dir(parent)?;
        }
        let sealed = key.encrypt(self.to_pem().as_bytes())?;
        write_atomic_private(path, &sealed)?;
        Ok(())
    }

    pub fn load(path: &Path, key: &Secret) -> Result<Self, OperatorIdentityError> {
        let sealed = std::fs::read(path)?;
        let plain = Zeroizing::new(key.decrypt(&sealed).map_err(|_| OperatorIdentityError::Unseal)?);
        let text = std::str::from_utf8(&plain).map_err(|_| OperatorIdentityError::MissingBlock(AGREEMENT_TAG))?;
        Self::from_pem(text)
    }

    /// Load the identity at `path`, generating and saving one if absent
    pub fn load_or_generate(path: &Path, key: &Secret) -> Result<Self, OperatorIdentityError> {
        if path.exists() {
            return Self::load(path, key);
        }
        let identity = Self::generate()?;
        identity.save(path, key)?;
        tracing::info!(
            path = %path.display(),
            fingerprint = %identity.fingerprint(),
            "generated operator identity"
        );
        Ok(identity)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_pem_roundtrip() {
        let identity = OperatorIdentity::generate().unwrap();
        let pem = identity.to_pem();
        assert!(pem.contains("BEGIN BERTH SIGNING PRIVATE KEY"));
        let parsed = OperatorIdentity::from_pem(&pem).unwrap();
        assert_eq!(parsed.fingerprint(), identity.fingerprint());
        assert_eq!(parsed.sign_public(), identity.sign_public());
    }

    #[test]
    fn test_missing_block() {
        let only_one = pem::encode(&pem::Pem::new(AGREEMENT_TAG, vec![7u8; 32]));
        assert!(matches!(
            OperatorIdentity::from_pem(&only_one),
            Err(OperatorIdentityError::MissingBlock(SIGNING_TAG))
        ));
    }

    #[test]
    fn test_saved_file_is_encrypted() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("operator").join("identity.pem.enc");
        let key = Secret::generate().unwrap();

        let identity = OperatorIdentity::load_or_generate(&path, &key).unwrap();
        let on_disk = std::fs::read(&path).unwrap();
        assert!(!String::from_utf8_lossy(&on_disk).contains("BEGIN"));

        let again = OperatorIdentity::load_or_generate(&path, &key).unwrap();
        assert_eq!(again.fingerprint(), identity.fingerprint());

        let wrong = Secret::generate().unwrap();
        assert!(matches!(
            OperatorIdentity::load(&path, &wrong),
            Err(OperatorIdentityError::Unseal)
        ));
    }

    #[test]
    fn test_request_carries_fingerprint() {
        let identity = OperatorIdentity::generate().unwrap();
        let request = identity.add_identity_request(Role::Deployer, Some("ops@example.com".into()));
        assert_eq!(request.fingerprint.as_deref(), Some(identity.fingerprint().as_str()));
        assert_eq!(request.role, Role::Deployer);
    }
}
