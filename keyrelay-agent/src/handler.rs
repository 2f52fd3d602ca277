//! Request handlers.
//!
//! [`RequestHandlers::dispatch`] maps one request body to one response body.
//! Every failure, whatever its cause, is answered with the same single
//! `SSH_AGENT_FAILURE` byte.

use std::sync::Arc;
use std::time::Duration;

use keyrelay_core::config::{AgentConfig, SignatureEncoding};
use keyrelay_core::{Identity, IdentityProvider, ProviderError, SignAlgorithm};
use tracing::{debug, warn};

use crate::error::RequestError;
use crate::proto::{
    Request, SSH_AGENT_RSA_SHA2_256, SSH_AGENT_RSA_SHA2_512, failure, identities_answer,
    sign_response,
};
use crate::wire::{
    KeyBlob, Mpint, RSA_ALGORITHM, encode_signature, encode_signature_blob, key_algorithm,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerOptions {
    /// Honour the RSA SHA-2 sign request flags.
    pub rsa_sha2_flags: bool,
    pub signature_encoding: SignatureEncoding,
    /// Bound on identity listing.  `None` waits for the provider.
    pub list_timeout: Option<Duration>,
}

impl Default for HandlerOptions {
    fn default() -> Self {
        Self {
            rsa_sha2_flags: true,
            signature_encoding: SignatureEncoding::default(),
            list_timeout: None,
        }
    }
}

impl From<&AgentConfig> for HandlerOptions {
    fn from(config: &AgentConfig) -> Self {
        Self {
            rsa_sha2_flags: config.rsa_sha2_flags,
            signature_encoding: config.signature_encoding,
            list_timeout: config.list_timeout(),
        }
    }
}

/// Choose the signature scheme for a sign request.
///
/// SHA-256 takes precedence when both SHA-2 flags are set.
pub fn algorithm_for_flags(flags: u32, honour_rsa_sha2: bool) -> SignAlgorithm {
    if !honour_rsa_sha2 {
        SignAlgorithm::RsaSha1
    } else if flags & SSH_AGENT_RSA_SHA2_256 != 0 {
        SignAlgorithm::RsaSha256
    } else if flags & SSH_AGENT_RSA_SHA2_512 != 0 {
        SignAlgorithm::RsaSha512
    } else {
        SignAlgorithm::RsaSha1
    }
}

/// Stateless dispatcher shared by every session.
pub struct RequestHandlers {
    provider: Arc<dyn IdentityProvider>,
    options: HandlerOptions,
}

impl std::fmt::Debug for RequestHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestHandlers")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl RequestHandlers {
    pub fn new(provider: Arc<dyn IdentityProvider>, options: HandlerOptions) -> Self {
        Self { provider, options }
    }

    /// Handle one request message (opcode plus body) and produce the
    /// response message.  Never fails.
    pub async fn dispatch(&self, message: &[u8]) -> Vec<u8> {
        match self.try_dispatch(message).await {
            Ok(response) => response,
            Err(RequestError::Provider(e)) => {
                warn!(error = %e, "identity provider failed request");
                failure()
            }
            Err(e) => {
                debug!(error = %e, "rejecting request");
                failure()
            }
        }
    }

    async fn try_dispatch(&self, message: &[u8]) -> Result<Vec<u8>, RequestError> {
        match Request::decode(message)? {
            Request::RequestIdentities => Ok(self.request_identities().await),
            Request::Sign {
                key_blob,
                data,
                flags,
            } => self.sign(key_blob, data, flags).await,
            Request::Unsupported(opcode) => Err(RequestError::Unsupported(opcode)),
        }
    }

    async fn request_identities(&self) -> Vec<u8> {
        let identities = match self.current_identities().await {
            Ok(identities) => identities,
            Err(e) => {
                warn!(error = %e, "identity listing failed, reporting no identities");
                Vec::new()
            }
        };
        debug!(count = identities.len(), "request_identities");
        identities_answer(
            identities
                .iter()
                .map(|id| (id.key_blob.as_slice(), id.comment.as_str())),
        )
    }

    async fn sign(&self, key_blob: &[u8], data: &[u8], flags: u32) -> Result<Vec<u8>, RequestError> {
        let key_algorithm = key_algorithm(key_blob)?;
        let algorithm = if key_algorithm == RSA_ALGORITHM {
            KeyBlob::decode(key_blob)?;
            algorithm_for_flags(flags, self.options.rsa_sha2_flags)
        } else {
            SignAlgorithm::Native
        };

        let identities = self.current_identities().await?;
        let identity = identities
            .iter()
            .find(|id| id.key_blob == key_blob)
            .ok_or(RequestError::IdentityNotFound)?;

        debug!(
            comment = %identity.comment,
            key_algorithm,
            algorithm = %algorithm,
            data_len = data.len(),
            flags,
            "sign"
        );

        let raw = self.provider.sign(key_blob, data, algorithm).await?;
        let name = algorithm.signature_name(key_algorithm);
        let signature = match (algorithm, self.options.signature_encoding) {
            (SignAlgorithm::Native, _) | (_, SignatureEncoding::String) => {
                encode_signature_blob(name, &raw)
            }
            (_, SignatureEncoding::Mpint) => encode_signature(name, &Mpint::from_unsigned_be(&raw)),
        };
        Ok(sign_response(&signature))
    }

    async fn current_identities(&self) -> Result<Vec<Identity>, ProviderError> {
        let listing = self.provider.list_identities(false);
        match self.options.list_timeout {
            Some(limit) => tokio::time::timeout(limit, listing)
                .await
                .map_err(|_| ProviderError::Timeout)?,
            None => listing.await,
        }
    }
}
