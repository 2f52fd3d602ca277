//! Connection sessions and the multi-session service.
//!
//! ```text
//!   transport ──► Channel ──► ConnectionSession::run
//!                               │ authorize (once)
//!                               │ loop: recv ─► envelope check ─► dispatch ─► send
//!                               ▼
//!                             Closed
//! ```
//!
//! A session owns its channel outright.  Requests are answered strictly one
//! at a time; the next message is not read until the previous response has
//! been written.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::access::AccessControl;
use crate::channel::Channel;
use crate::error::{ChannelError, SessionError};
use crate::handler::RequestHandlers;
use crate::proto::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unauthorized,
    Authorized,
    Closed,
}

pub struct ConnectionSession<C> {
    channel: C,
    state: SessionState,
    access: Arc<AccessControl>,
    handlers: Arc<RequestHandlers>,
}

impl<C: Channel> ConnectionSession<C> {
    pub fn new(channel: C, access: Arc<AccessControl>, handlers: Arc<RequestHandlers>) -> Self {
        Self {
            channel,
            state: SessionState::Unauthorized,
            access,
            handlers,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Consult access control.  Only the first call on a fresh session does
    /// anything; a rejected session is closed for good.
    pub fn authorize(&mut self) -> Result<(), SessionError> {
        match self.state {
            SessionState::Unauthorized => {
                if self.access.is_allowed(self.channel.peer_id()) {
                    self.state = SessionState::Authorized;
                    Ok(())
                } else {
                    self.state = SessionState::Closed;
                    Err(SessionError::UnauthorizedPeer(self.channel.peer_id().to_string()))
                }
            }
            SessionState::Authorized => Ok(()),
            SessionState::Closed => Err(ChannelError::Closed.into()),
        }
    }

    /// Process one inbound message without writing to the channel.
    ///
    /// A wrong envelope tag closes the session.
    pub async fn handle_message(&mut self, message: Message) -> Result<Message, SessionError> {
        let request = self.accept(message)?;
        Ok(Message::agent(self.handlers.dispatch(&request).await))
    }

    fn accept(&mut self, message: Message) -> Result<Vec<u8>, SessionError> {
        match self.state {
            SessionState::Authorized => {}
            SessionState::Unauthorized => {
                return Err(SessionError::UnauthorizedPeer(self.channel.peer_id().to_string()));
            }
            SessionState::Closed => return Err(ChannelError::Closed.into()),
        }
        if !message.is_agent() {
            self.state = SessionState::Closed;
            return Err(SessionError::MalformedEnvelope(message.kind));
        }
        Ok(message.data)
    }

    /// Authorize, then serve requests until the peer disconnects or a
    /// session-level error occurs.
    pub async fn run(mut self) -> Result<(), SessionError> {
        self.authorize()?;
        debug!(peer = %self.channel.peer_id(), "session authorized");
        let outcome = self.serve_requests().await;
        self.state = SessionState::Closed;
        outcome
    }

    async fn serve_requests(&mut self) -> Result<(), SessionError> {
        while let Some(message) = self.channel.recv().await {
            let request = self.accept(message)?;
            let response = tokio::select! {
                response = self.handlers.dispatch(&request) => response,
                () = self.channel.closed() => {
                    debug!(peer = %self.channel.peer_id(), "peer went away mid-request, discarding result");
                    return Ok(());
                }
            };
            self.channel.send(Message::agent(response)).await?;
        }
        Ok(())
    }
}

/// Shared state for every session the process runs.
#[derive(Debug, Clone)]
pub struct AgentService {
    access: Arc<AccessControl>,
    handlers: Arc<RequestHandlers>,
}

impl AgentService {
    pub fn new(access: AccessControl, handlers: RequestHandlers) -> Self {
        Self {
            access: Arc::new(access),
            handlers: Arc::new(handlers),
        }
    }

    pub fn session<C: Channel>(&self, channel: C) -> ConnectionSession<C> {
        ConnectionSession::new(channel, Arc::clone(&self.access), Arc::clone(&self.handlers))
    }

    /// Run one session to completion, logging how it ended.
    pub async fn serve<C: Channel>(&self, channel: C) -> Result<(), SessionError> {
        let peer = channel.peer_id().to_string();
        let outcome = self.session(channel).run().await;
        match &outcome {
            Ok(()) => debug!(peer = %peer, "session closed"),
            // Already reported by access control.
            Err(SessionError::UnauthorizedPeer(_)) => {}
            Err(e @ SessionError::MalformedEnvelope(_)) => {
                warn!(peer = %peer, error = %e, "disconnecting peer");
            }
            Err(e @ SessionError::Channel(_)) => debug!(peer = %peer, error = %e, "session ended"),
        }
        outcome
    }

    pub fn spawn<C: Channel + 'static>(&self, channel: C) -> JoinHandle<Result<(), SessionError>> {
        let service = self.clone();
        tokio::spawn(async move { service.serve(channel).await })
    }

    /// Accept channels until `incoming` is closed, one task per session.
    pub async fn listen<C: Channel + 'static>(&self, mut incoming: mpsc::Receiver<C>) {
        while let Some(channel) = incoming.recv().await {
            debug!(peer = %channel.peer_id(), "new channel");
            self.spawn(channel);
        }
        info!("channel source closed, no longer accepting sessions");
    }
}
