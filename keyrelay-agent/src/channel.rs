//! Message channels.
//!
//! A [`Channel`] is an ordered, reliable, bidirectional conduit of
//! [`Message`]s tied to one named peer.  Transports adapt their byte streams
//! to [`MessageChannel`], an in-process pair of bounded queues; the session
//! owns one end and the transport (or a test) holds the [`PeerEnd`].

use tokio::sync::mpsc;

use crate::error::ChannelError;
use crate::proto::Message;

/// Queue depth per direction.  The agent answers requests one at a time, so
/// a handful of slots only absorbs pipelined requests.
const QUEUE_DEPTH: usize = 16;

#[async_trait::async_trait]
pub trait Channel: Send + Sync {
    /// Identifier of the remote endpoint (extension id, `uid:<n>`, ...).
    fn peer_id(&self) -> &str;

    /// Next inbound message, or `None` once the peer has disconnected.
    async fn recv(&mut self) -> Option<Message>;

    async fn send(&mut self, message: Message) -> Result<(), ChannelError>;

    /// Resolves when the peer can no longer receive.  Must be cancel-safe.
    async fn closed(&self);
}

/// Session side of an in-process channel.
#[derive(Debug)]
pub struct MessageChannel {
    peer_id: String,
    inbound: mpsc::Receiver<Message>,
    outbound: mpsc::Sender<Message>,
}

/// Transport side of a [`MessageChannel`].
///
/// Dropping `receiver` is how the remote end signals disconnect; dropping
/// `sender` ends the inbound stream.
#[derive(Debug)]
pub struct PeerEnd {
    pub sender: mpsc::Sender<Message>,
    pub receiver: mpsc::Receiver<Message>,
}

impl MessageChannel {
    pub fn pair(peer_id: impl Into<String>) -> (Self, PeerEnd) {
        let (to_session, inbound) = mpsc::channel(QUEUE_DEPTH);
        let (outbound, from_session) = mpsc::channel(QUEUE_DEPTH);
        let channel = Self {
            peer_id: peer_id.into(),
            inbound,
            outbound,
        };
        let peer = PeerEnd {
            sender: to_session,
            receiver: from_session,
        };
        (channel, peer)
    }
}

#[async_trait::async_trait]
impl Channel for MessageChannel {
    fn peer_id(&self) -> &str {
        &self.peer_id
    }

    async fn recv(&mut self) -> Option<Message> {
        self.inbound.recv().await
    }

    async fn send(&mut self, message: Message) -> Result<(), ChannelError> {
        self.outbound
            .send(message)
            .await
            .map_err(|_| ChannelError::Closed)
    }

    async fn closed(&self) {
        self.outbound.closed().await;
    }
}

impl PeerEnd {
    pub async fn send(&self, message: Message) -> Result<(), ChannelError> {
        self.sender.send(message).await.map_err(|_| ChannelError::Closed)
    }

    pub async fn recv(&mut self) -> Option<Message> {
        self.receiver.recv().await
    }
}
