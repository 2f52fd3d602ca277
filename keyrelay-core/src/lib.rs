//! Shared types for keyrelay.
//!
//! This crate holds the boundary between the agent protocol engine
//! (`keyrelay-agent`) and whatever actually owns private keys: the
//! [`IdentityProvider`] trait, the [`Identity`] values it reports, and the
//! [`SignAlgorithm`] it is asked to sign with.  The TOML configuration model
//! lives in [`config`].

use std::fmt;

pub mod config;

/// A public identity available for signing.
///
/// `key_blob` is the self-describing SSH wire encoding of the public key
/// (`string algorithm ++ algorithm-specific fields`).  The engine relays
/// blobs and comments exactly as the provider reports them.
#[derive(Clone, PartialEq, Eq)]
pub struct Identity {
    pub key_blob: Vec<u8>,
    pub comment: String,
}

impl Identity {
    pub fn new(key_blob: Vec<u8>, comment: impl Into<String>) -> Self {
        Self {
            key_blob,
            comment: comment.into(),
        }
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("key_blob_len", &self.key_blob.len())
            .field("comment", &self.comment)
            .finish()
    }
}

/// Signature scheme requested for a sign operation.
///
/// RSA keys support several digests, all with PKCS#1 v1.5 padding.  Every
/// other key type has exactly one scheme, named after the key algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SignAlgorithm {
    /// `ssh-rsa`: SHA-1 digest.  Used unless the request flags ask otherwise.
    #[default]
    RsaSha1,
    /// `rsa-sha2-256` (RFC 8332).
    RsaSha256,
    /// `rsa-sha2-512` (RFC 8332).
    RsaSha512,
    /// The only scheme of a non-RSA key (`ssh-ed25519`, `ecdsa-sha2-*`).
    Native,
}

impl SignAlgorithm {
    /// The algorithm name written in front of the signature value, for a
    /// key whose blob names `key_algorithm`.
    pub fn signature_name(self, key_algorithm: &str) -> &str {
        match self {
            Self::RsaSha1 => "ssh-rsa",
            Self::RsaSha256 => "rsa-sha2-256",
            Self::RsaSha512 => "rsa-sha2-512",
            Self::Native => key_algorithm,
        }
    }
}

impl fmt::Display for SignAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.signature_name("native"))
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ProviderError {
    /// The provider did not answer within the configured bound.
    #[error("provider timed out")]
    Timeout,
    #[error("key not held by provider")]
    NotFound,
    /// The provider refused the operation (user declined, policy, locked store).
    #[error("provider declined: {0}")]
    Declined(String),
    #[error("provider unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// The key store capability the agent brokers to.
///
/// Implementations may block or wait on I/O; the engine only ever suspends
/// the session that issued the call.
#[async_trait::async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Enumerate the identities currently available.
    ///
    /// With `interactive == false` the provider must not wait on user
    /// interaction (certificate pickers, unlock prompts); it reports whatever
    /// is available right now, possibly nothing.
    async fn list_identities(&self, interactive: bool) -> Result<Vec<Identity>, ProviderError>;

    /// Produce a raw signature over `data` with the private half of
    /// `key_blob`.
    ///
    /// The returned bytes are the bare signature value (for RSA, the PKCS#1
    /// v1.5 signature padded to the modulus size; for Ed25519 the 64 byte
    /// signature; for ECDSA the `mpint r ++ mpint s` blob).  The caller
    /// wraps it in the SSH signature encoding.
    async fn sign(
        &self,
        key_blob: &[u8],
        data: &[u8],
        algorithm: SignAlgorithm,
    ) -> Result<Vec<u8>, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_debug_hides_blob_bytes() {
        let id = Identity::new(vec![0xde, 0xad, 0xbe, 0xef], "laptop");
        let debug = format!("{id:?}");
        assert!(debug.contains("key_blob_len: 4"));
        assert!(debug.contains("laptop"));
        assert!(!debug.contains("222"));
    }

    #[test]
    fn sign_algorithm_names() {
        assert_eq!(SignAlgorithm::default(), SignAlgorithm::RsaSha1);
        assert_eq!(SignAlgorithm::RsaSha1.signature_name("ssh-rsa"), "ssh-rsa");
        assert_eq!(SignAlgorithm::RsaSha256.to_string(), "rsa-sha2-256");
        assert_eq!(SignAlgorithm::RsaSha512.to_string(), "rsa-sha2-512");
        assert_eq!(SignAlgorithm::Native.signature_name("ssh-ed25519"), "ssh-ed25519");
        assert_eq!(
            SignAlgorithm::Native.signature_name("ecdsa-sha2-nistp256"),
            "ecdsa-sha2-nistp256"
        );
    }

    #[test]
    fn provider_error_wraps_anyhow() {
        let err: ProviderError = anyhow::anyhow!("socket gone").into();
        assert_eq!(err.to_string(), "socket gone");
    }
}
