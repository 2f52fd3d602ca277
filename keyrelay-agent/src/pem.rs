//! PEM private key detection.
//!
//! Scans text for private key blocks and returns the signable keys among
//! them, in the order they appear.  OpenSSH, PKCS#1 and PKCS#8 containers are
//! recognised; anything else is skipped.

use std::fmt;
use std::path::Path;

use anyhow::Context as _;
use rsa::pkcs1::DecodeRsaPrivateKey as _;
use rsa::pkcs8::DecodePrivateKey as _;
use rsa::traits::PublicKeyParts as _;
use rsa::{BigUint, RsaPrivateKey};
use ssh_key::{Algorithm, EcdsaCurve};
use ssh_key::private::RsaKeypair;
use tracing::debug;
use zeroize::Zeroizing;

use crate::wire::{KeyBlob, Mpint};

const BEGIN: &str = "-----BEGIN ";
const DASHES: &str = "-----";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Container {
    OpenSsh,
    Pkcs1,
    Pkcs8,
}

/// A private key recovered from a PEM block.
#[derive(Clone)]
pub enum KeyMaterial {
    /// Signed with the `rsa` crate, which covers every `ssh-rsa` and
    /// `rsa-sha2-*` scheme.
    Rsa(RsaPrivateKey),
    /// Ed25519 and ECDSA keys, signed through `ssh-key`.
    Native(ssh_key::PrivateKey),
}

impl KeyMaterial {
    /// SSH wire encoding of the public half.
    pub fn public_blob(&self) -> anyhow::Result<Vec<u8>> {
        match self {
            Self::Rsa(key) => Ok(KeyBlob::rsa(
                Mpint::from_unsigned_be(&key.e().to_bytes_be()),
                Mpint::from_unsigned_be(&key.n().to_bytes_be()),
            )
            .encode()),
            Self::Native(key) => key
                .public_key()
                .to_bytes()
                .context("encode public key blob"),
        }
    }

    pub fn algorithm(&self) -> Algorithm {
        match self {
            Self::Rsa(_) => Algorithm::Rsa { hash: None },
            Self::Native(key) => key.algorithm(),
        }
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("KeyMaterial").field(&self.algorithm().as_str()).finish()
    }
}

impl Container {
    fn from_label(label: &str) -> Option<Self> {
        match label {
            "OPENSSH PRIVATE KEY" => Some(Self::OpenSsh),
            "RSA PRIVATE KEY" => Some(Self::Pkcs1),
            "PRIVATE KEY" => Some(Self::Pkcs8),
            _ => None,
        }
    }
}

/// Extract every usable private key found in `text`.
///
/// Unparseable and encrypted keys, and key types we cannot sign with, are
/// logged at debug level and skipped.
pub fn extract_keys(text: &str) -> Vec<KeyMaterial> {
    let mut keys = Vec::new();
    let mut remaining = text;

    while let Some((label, block, rest)) = next_block(remaining) {
        remaining = rest;
        let Some(container) = Container::from_label(label) else {
            debug!(label, "skipping unsupported PEM block");
            continue;
        };
        match parse_block(container, block) {
            Ok(Some(key)) => keys.push(key),
            Ok(None) => {}
            Err(e) => debug!(label, error = %e, "skipping unreadable private key"),
        }
    }

    keys
}

/// Read a key file and extract its keys.
pub fn load_file(path: &Path) -> anyhow::Result<Vec<KeyMaterial>> {
    let text = Zeroizing::new(
        std::fs::read_to_string(path).with_context(|| format!("read key file {path:?}"))?,
    );
    Ok(extract_keys(&text))
}

/// Locate the next `BEGIN`/`END` pair.  Returns the label, the full block
/// including its armour lines, and the text after the block.
fn next_block(text: &str) -> Option<(&str, &str, &str)> {
    let start = text.find(BEGIN)?;
    let after_begin = &text[start + BEGIN.len()..];
    let label_len = after_begin.find(DASHES)?;
    let label = &after_begin[..label_len];

    let footer = format!("-----END {label}-----");
    let block_text = &text[start..];
    let Some(footer_at) = block_text.find(&footer) else {
        // No footer: nothing further in this text can be a complete block
        // starting here, but a later BEGIN might be.
        return next_block(&after_begin[label_len..]);
    };
    let end = footer_at + footer.len();
    Some((label, &block_text[..end], &block_text[end..]))
}

fn parse_block(container: Container, block: &str) -> anyhow::Result<Option<KeyMaterial>> {
    match container {
        Container::OpenSsh => {
            let key = ssh_key::PrivateKey::from_openssh(block)?;
            if key.is_encrypted() {
                debug!("skipping encrypted OpenSSH key");
                return Ok(None);
            }
            if let Some(keypair) = key.key_data().rsa() {
                return Ok(Some(KeyMaterial::Rsa(rsa_from_openssh(keypair)?)));
            }
            match key.algorithm() {
                Algorithm::Ed25519
                | Algorithm::Ecdsa {
                    curve: EcdsaCurve::NistP256 | EcdsaCurve::NistP384,
                } => Ok(Some(KeyMaterial::Native(key))),
                algorithm => {
                    debug!(algorithm = %algorithm, "skipping unsupported OpenSSH key type");
                    Ok(None)
                }
            }
        }
        Container::Pkcs1 => Ok(Some(KeyMaterial::Rsa(RsaPrivateKey::from_pkcs1_pem(block)?))),
        // Non-RSA PKCS#8 keys fail here on the algorithm identifier.
        Container::Pkcs8 => Ok(Some(KeyMaterial::Rsa(RsaPrivateKey::from_pkcs8_pem(block)?))),
    }
}

/// Rebuild the key from its OpenSSH components.  `ssh-key`'s own conversion
/// passes `p` for both primes and always fails.
fn rsa_from_openssh(keypair: &RsaKeypair) -> anyhow::Result<RsaPrivateKey> {
    let uint = |name: &str, value: &ssh_key::Mpint| {
        value
            .as_positive_bytes()
            .map(BigUint::from_bytes_be)
            .with_context(|| format!("RSA {name} is not a positive integer"))
    };
    let mut key = RsaPrivateKey::from_components(
        uint("n", &keypair.public.n)?,
        uint("e", &keypair.public.e)?,
        uint("d", &keypair.private.d)?,
        vec![uint("p", &keypair.private.p)?, uint("q", &keypair.private.q)?],
    )?;
    key.validate()?;
    key.precompute()?;
    Ok(key)
}
