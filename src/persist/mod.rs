//! Storage of challenge records, account keys and certificate archives.
//!
//! Backends implement the small [`Persist`] trait over opaque bytes; the orchestrator talks to it
//! through the typed [`CertStore`] wrapper.

use std::{fmt, sync::Arc};

use eyre::WrapErr as _;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

mod disk;
mod memory;

pub use self::{disk::DiskPersist, memory::MemoryPersist};

/// Namespace of a persisted value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PersistKind {
    /// Challenge records, keyed by challenge token.
    Authorization,

    /// Account private keys (PEM), keyed by contact email.
    AccountKey,

    /// Certificate archives, keyed by common name.
    Archive,

    /// Archive passphrases, keyed by common name.
    Passphrase,
}

impl PersistKind {
    /// Stable name of the namespace, used by backends as a folder name.
    pub fn name(self) -> &'static str {
        match self {
            PersistKind::Authorization => "authz",
            PersistKind::AccountKey => "account",
            PersistKind::Archive => "archive",
            PersistKind::Passphrase => "passphrase",
        }
    }

    /// Whether values of this kind must be kept private.
    pub fn is_secret(self) -> bool {
        matches!(
            self,
            PersistKind::AccountKey | PersistKind::Archive | PersistKind::Passphrase
        )
    }
}

impl fmt::Display for PersistKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Key of a persisted value: a namespace plus a logical name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PersistKey {
    pub kind: PersistKind,
    pub name: String,
}

impl PersistKey {
    pub fn new(kind: PersistKind, name: impl Into<String>) -> Self {
        PersistKey {
            kind,
            name: name.into(),
        }
    }
}

impl fmt::Display for PersistKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

/// Key/value storage backend.
///
/// Must be safe for concurrent use. Writing a key overwrites any previous value.
#[async_trait::async_trait]
pub trait Persist: Send + Sync {
    async fn put(&self, key: &PersistKey, value: &[u8]) -> eyre::Result<()>;

    async fn get(&self, key: &PersistKey) -> eyre::Result<Option<Vec<u8>>>;
}

/// A pending HTTP-01 challenge, as served to the authority's validator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeRecord {
    pub token: String,
    pub key_authorization: String,
    pub location: String,
}

/// Typed access to the four persisted namespaces.
///
/// Empty and whitespace-only values are treated the same as absent ones.
#[derive(Clone)]
pub struct CertStore {
    backend: Arc<dyn Persist>,
}

impl CertStore {
    pub fn new(backend: Arc<dyn Persist>) -> Self {
        CertStore { backend }
    }

    async fn read(&self, kind: PersistKind, name: &str) -> eyre::Result<Option<Vec<u8>>> {
        let key = PersistKey::new(kind, name);
        let value = self
            .backend
            .get(&key)
            .await
            .wrap_err_with(|| format!("failed to read {key}"))?;

        Ok(value.filter(|value| !value.iter().all(u8::is_ascii_whitespace)))
    }

    async fn write(&self, kind: PersistKind, name: &str, value: &[u8]) -> eyre::Result<()> {
        let key = PersistKey::new(kind, name);
        self.backend
            .put(&key, value)
            .await
            .wrap_err_with(|| format!("failed to write {key}"))
    }

    pub async fn challenge(&self, token: &str) -> eyre::Result<Option<ChallengeRecord>> {
        let Some(bytes) = self.read(PersistKind::Authorization, token).await? else {
            return Ok(None);
        };

        let record = serde_json::from_slice(&bytes).wrap_err("malformed challenge record")?;
        Ok(Some(record))
    }

    pub async fn store_challenge(&self, record: &ChallengeRecord) -> eyre::Result<()> {
        let bytes = serde_json::to_vec(record)?;
        self.write(PersistKind::Authorization, &record.token, &bytes)
            .await
    }

    pub async fn account_key(&self, email: &str) -> eyre::Result<Option<Zeroizing<String>>> {
        let Some(bytes) = self.read(PersistKind::AccountKey, email).await? else {
            return Ok(None);
        };

        let pem = Zeroizing::new(String::from_utf8(bytes).wrap_err("account key is not UTF-8")?);
        Ok(Some(Zeroizing::new(pem.trim().to_owned())))
    }

    pub async fn store_account_key(&self, email: &str, pem: &str) -> eyre::Result<()> {
        self.write(PersistKind::AccountKey, email, pem.as_bytes())
            .await
    }

    pub async fn archive(&self, common_name: &str) -> eyre::Result<Option<Vec<u8>>> {
        self.read(PersistKind::Archive, common_name).await
    }

    pub async fn store_archive(&self, common_name: &str, archive: &[u8]) -> eyre::Result<()> {
        self.write(PersistKind::Archive, common_name, archive).await
    }

    pub async fn passphrase(&self, common_name: &str) -> eyre::Result<Option<Zeroizing<String>>> {
        let Some(bytes) = self.read(PersistKind::Passphrase, common_name).await? else {
            return Ok(None);
        };

        let passphrase =
            Zeroizing::new(String::from_utf8(bytes).wrap_err("passphrase is not UTF-8")?);
        Ok(Some(Zeroizing::new(passphrase.trim().to_owned())))
    }

    pub async fn store_passphrase(&self, common_name: &str, passphrase: &str) -> eyre::Result<()> {
        self.write(PersistKind::Passphrase, common_name, passphrase.as_bytes())
            .await
    }
}

impl fmt::Debug for CertStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertStore").finish_non_exhaustive()
    }
}
