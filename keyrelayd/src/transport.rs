//! Byte-stream bridging for agent channels.
//!
//! A transport supplies a [`FrameReader`] and a [`FrameWriter`] for one
//! connection; [`bridge`] pumps frames between them and the transport side
//! of a [`MessageChannel`][keyrelay_agent::MessageChannel].

use keyrelay_agent::{Message, PeerEnd};
use tokio::sync::oneshot;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame of {len} bytes exceeds limit {limit}")]
    TooLarge { len: usize, limit: usize },

    #[error("malformed frame body: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame I/O: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait::async_trait]
pub trait FrameReader: Send {
    /// Next frame, or `None` on a clean end of stream.
    async fn read_frame(&mut self) -> Result<Option<Message>, FrameError>;
}

#[async_trait::async_trait]
pub trait FrameWriter: Send {
    async fn write_frame(&mut self, message: &Message) -> Result<(), FrameError>;
}

/// Pump frames until the connection ends.
///
/// End of input also stops the writer: a response still being computed when
/// the remote side goes away is dropped rather than written.
pub async fn bridge<R, W>(mut reader: R, mut writer: W, peer: PeerEnd)
where
    R: FrameReader,
    W: FrameWriter,
{
    let PeerEnd { sender, mut receiver } = peer;
    let (eof_tx, mut eof_rx) = oneshot::channel::<()>();

    let inbound = async move {
        loop {
            let frame = tokio::select! {
                frame = reader.read_frame() => frame,
                () = sender.closed() => {
                    debug!("session gone, stopping reader");
                    break;
                }
            };
            match frame {
                Ok(Some(message)) => {
                    if sender.send(message).await.is_err() {
                        debug!("session gone, stopping reader");
                        break;
                    }
                }
                Ok(None) => {
                    debug!("end of input");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "dropping connection on bad frame");
                    break;
                }
            }
        }
        // Dropping `sender` ends the session's inbound stream.
        drop(sender);
        let _ = eof_tx.send(());
    };

    let outbound = async move {
        loop {
            tokio::select! {
                biased;
                _ = &mut eof_rx => break,
                message = receiver.recv() => {
                    let Some(message) = message else { break };
                    if let Err(e) = writer.write_frame(&message).await {
                        debug!(error = %e, "write failed, stopping writer");
                        break;
                    }
                }
            }
        }
    };

    tokio::join!(inbound, outbound);
}
