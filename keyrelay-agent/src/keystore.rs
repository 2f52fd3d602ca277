//! In-memory key store.
//!
//! The [`KeyStore`] holds the keys the daemon loaded at startup.
//! [`KeyStoreProvider`] exposes it to the request handlers as an
//! [`IdentityProvider`].
//!
//! Thread safety: all mutations go through `Arc<RwLock<KeyStore>>`.

use std::sync::{Arc, RwLock};

use anyhow::{Context as _, anyhow};
use keyrelay_core::{Identity, IdentityProvider, ProviderError, SignAlgorithm};
use rand::rngs::OsRng;
use rsa::{Pkcs1v15Sign, RsaPrivateKey};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};
use signature::Signer as _;
use ssh_key::HashAlg;
use tracing::debug;
use zeroize::Zeroize;

use crate::pem::KeyMaterial;

/// An individual key in the store.
#[derive(Clone)]
pub struct KeyEntry {
    /// Comment reported with the identity.
    pub comment: String,

    /// Where the key came from (a file path).
    pub source: String,

    /// SSH wire encoding of the public key.
    pub key_blob: Vec<u8>,

    /// SHA-256 fingerprint string (e.g. `"SHA256:abc123…"`).
    pub fingerprint: String,

    /// Zeroized on drop by the `rsa` and `ssh-key` crates.
    private_key: KeyMaterial,
}

impl std::fmt::Debug for KeyEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyEntry")
            .field("comment", &self.comment)
            .field("source", &self.source)
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

impl Drop for KeyEntry {
    fn drop(&mut self) {
        self.comment.zeroize();
    }
}

impl KeyEntry {
    pub fn identity(&self) -> Identity {
        Identity::new(self.key_blob.clone(), self.comment.clone())
    }
}

/// Build a [`KeyEntry`] from a parsed key.
pub fn build_entry(
    private_key: KeyMaterial,
    comment: String,
    source: String,
) -> anyhow::Result<KeyEntry> {
    let key_blob = private_key.public_blob()?;
    let fingerprint = ssh_key::PublicKey::from_bytes(&key_blob)
        .context("re-parse public key blob")?
        .fingerprint(HashAlg::Sha256)
        .to_string();

    Ok(KeyEntry {
        comment,
        source,
        key_blob,
        fingerprint,
        private_key,
    })
}

/// Keys in insertion order, one per fingerprint.
#[derive(Debug, Default)]
pub struct KeyStore {
    entries: Vec<KeyEntry>,
}

impl KeyStore {
    /// Create an empty, shareable key store.
    pub fn new() -> Arc<RwLock<Self>> {
        Arc::new(RwLock::new(Self::default()))
    }

    /// Insert a key unless one with the same fingerprint is already held.
    /// Returns whether the key was added.
    pub fn insert(&mut self, entry: KeyEntry) -> bool {
        if self.entries.iter().any(|e| e.fingerprint == entry.fingerprint) {
            debug!(
                fingerprint = %entry.fingerprint,
                source = %entry.source,
                "keystore: duplicate key ignored"
            );
            return false;
        }
        debug!(
            fingerprint = %entry.fingerprint,
            comment = %entry.comment,
            "keystore: adding key"
        );
        self.entries.push(entry);
        true
    }

    /// Exact byte match on the public key blob.
    pub fn get_by_blob(&self, key_blob: &[u8]) -> Option<&KeyEntry> {
        self.entries.iter().find(|e| e.key_blob == key_blob)
    }

    pub fn iter(&self) -> impl Iterator<Item = &KeyEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// [`IdentityProvider`] over a shared [`KeyStore`].
///
/// Never interactive: every listing reports the store as it is.
#[derive(Clone, Debug)]
pub struct KeyStoreProvider {
    store: Arc<RwLock<KeyStore>>,
}

impl KeyStoreProvider {
    pub fn new(store: Arc<RwLock<KeyStore>>) -> Self {
        Self { store }
    }
}

fn poisoned() -> ProviderError {
    ProviderError::Unavailable("key store lock poisoned".into())
}

fn mismatch(key: &KeyMaterial, algorithm: SignAlgorithm) -> ProviderError {
    ProviderError::Declined(format!(
        "{} key cannot produce {algorithm} signatures",
        key.algorithm()
    ))
}

/// PKCS#1 v1.5 with blinding.
fn pkcs1v15_sign(
    key: &RsaPrivateKey,
    data: &[u8],
    algorithm: SignAlgorithm,
) -> Result<Vec<u8>, ProviderError> {
    let (padding, digest) = match algorithm {
        SignAlgorithm::RsaSha1 => (Pkcs1v15Sign::new::<Sha1>(), Sha1::digest(data).to_vec()),
        SignAlgorithm::RsaSha256 => (Pkcs1v15Sign::new::<Sha256>(), Sha256::digest(data).to_vec()),
        SignAlgorithm::RsaSha512 => (Pkcs1v15Sign::new::<Sha512>(), Sha512::digest(data).to_vec()),
        SignAlgorithm::Native => {
            return Err(ProviderError::Declined(
                "RSA keys need an RSA signature scheme".into(),
            ));
        }
    };
    key.sign_with_rng(&mut OsRng, padding, &digest)
        .map_err(|e| ProviderError::Other(anyhow!("RSA signing failed: {e}")))
}

fn sign_with(
    key: &KeyMaterial,
    data: &[u8],
    algorithm: SignAlgorithm,
) -> Result<Vec<u8>, ProviderError> {
    match (key, algorithm) {
        (KeyMaterial::Rsa(rsa), _) => pkcs1v15_sign(rsa, data, algorithm),
        (KeyMaterial::Native(native), SignAlgorithm::Native) => {
            let signature = native
                .try_sign(data)
                .map_err(|e| ProviderError::Other(anyhow!("signing failed: {e}")))?;
            Ok(signature.as_bytes().to_vec())
        }
        (KeyMaterial::Native(_), _) => Err(mismatch(key, algorithm)),
    }
}

#[async_trait::async_trait]
impl IdentityProvider for KeyStoreProvider {
    async fn list_identities(&self, _interactive: bool) -> Result<Vec<Identity>, ProviderError> {
        let store = self.store.read().map_err(|_| poisoned())?;
        Ok(store.iter().map(KeyEntry::identity).collect())
    }

    async fn sign(
        &self,
        key_blob: &[u8],
        data: &[u8],
        algorithm: SignAlgorithm,
    ) -> Result<Vec<u8>, ProviderError> {
        let (private_key, fingerprint) = {
            let store = self.store.read().map_err(|_| poisoned())?;
            let entry = store.get_by_blob(key_blob).ok_or(ProviderError::NotFound)?;
            (entry.private_key.clone(), entry.fingerprint.clone())
        };
        debug!(fingerprint = %fingerprint, algorithm = %algorithm, "keystore: signing");

        let data = data.to_vec();
        tokio::task::spawn_blocking(move || sign_with(&private_key, &data, algorithm))
            .await
            .map_err(|e| ProviderError::Other(anyhow!("signing task failed: {e}")))?
    }
}
