//! OpenSSH agent protocol engine for keyrelay.
//!
//! Answers `REQUEST_IDENTITIES` and `SIGN_REQUEST` on behalf of an
//! [`IdentityProvider`][keyrelay_core::IdentityProvider], over any ordered
//! message [`Channel`].  Every other request, and every failure, is answered
//! with the bare `SSH_AGENT_FAILURE` byte.
//!
//! # Architecture
//!
//! ```text
//! keyrelayd transport ──► MessageChannel ──► AgentService::spawn
//!                                                  │
//!                                           ConnectionSession
//!                                        (AccessControl gate, once)
//!                                                  │
//!                                          RequestHandlers::dispatch
//!                                                  │
//!                               IdentityProvider (e.g. KeyStoreProvider)
//! ```
//!
//! Sessions share only the allow-list and the provider.  Each session
//! handles its requests one at a time, in arrival order.

pub mod access;
pub mod channel;
pub mod error;
pub mod handler;
pub mod keystore;
pub mod pem;
pub mod proto;
pub mod session;
pub mod wire;

pub use access::AccessControl;
pub use channel::{Channel, MessageChannel, PeerEnd};
pub use error::{ChannelError, RequestError, SessionError, WireError};
pub use handler::{HandlerOptions, RequestHandlers};
pub use keystore::{KeyEntry, KeyStore, KeyStoreProvider};
pub use proto::{AGENT_MSG_TYPE, Message, Opcode};
pub use session::{AgentService, ConnectionSession, SessionState};
