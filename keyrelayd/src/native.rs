//! Browser native messaging transport.
//!
//! The browser starts the daemon with the calling extension's origin as an
//! argument and talks to it over stdin/stdout.  Each frame is a
//! native-endian `u32` length followed by a UTF-8 JSON document:
//!
//! ```json
//! {"type": "auth-agent@openssh.com", "data": [11]}
//! ```

use keyrelay_agent::Message;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::transport::{FrameError, FrameReader, FrameWriter};

/// Largest inbound frame accepted.  Browsers cap host-bound messages far
/// higher; agent requests never come close.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

const ORIGIN_SCHEME: &str = "chrome-extension://";

#[derive(Debug, Serialize, Deserialize)]
struct JsonMessage {
    #[serde(rename = "type")]
    kind: String,
    data: Vec<u8>,
}

/// Extension id from a `chrome-extension://<id>/` origin.
pub fn extension_id(origin: &str) -> Option<&str> {
    let rest = origin.strip_prefix(ORIGIN_SCHEME)?;
    let id = rest.strip_suffix('/').unwrap_or(rest);
    let valid = !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric());
    valid.then_some(id)
}

pub struct NativeReader<R> {
    inner: R,
}

impl<R> NativeReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }
}

#[async_trait::async_trait]
impl<R: AsyncRead + Unpin + Send> FrameReader for NativeReader<R> {
    async fn read_frame(&mut self) -> Result<Option<Message>, FrameError> {
        let mut header = [0u8; 4];
        match self.inner.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_ne_bytes(header) as usize;
        if len > MAX_FRAME_LEN {
            return Err(FrameError::TooLarge {
                len,
                limit: MAX_FRAME_LEN,
            });
        }
        let mut body = vec![0u8; len];
        self.inner.read_exact(&mut body).await?;
        let JsonMessage { kind, data } = serde_json::from_slice(&body)?;
        Ok(Some(Message::new(kind, data)))
    }
}

pub struct NativeWriter<W> {
    inner: W,
}

impl<W> NativeWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

#[async_trait::async_trait]
impl<W: AsyncWrite + Unpin + Send> FrameWriter for NativeWriter<W> {
    async fn write_frame(&mut self, message: &Message) -> Result<(), FrameError> {
        let body = serde_json::to_vec(&JsonMessage {
            kind: message.kind.clone(),
            data: message.data.clone(),
        })?;
        let len = u32::try_from(body.len()).map_err(|_| FrameError::TooLarge {
            len: body.len(),
            limit: u32::MAX as usize,
        })?;
        self.inner.write_all(&len.to_ne_bytes()).await?;
        self.inner.write_all(&body).await?;
        self.inner.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use keyrelay_agent::{AccessControl, AgentService, HandlerOptions, MessageChannel, RequestHandlers};
    use keyrelay_core::{Identity, IdentityProvider, ProviderError, SignAlgorithm};
    use tokio::io::duplex;

    use super::*;
    use crate::transport::bridge;

    const EXT: &str = "pnhechapfaindjhompbnflcldabbghjo";

    fn frame(json: &str) -> Vec<u8> {
        let mut out = (json.len() as u32).to_ne_bytes().to_vec();
        out.extend_from_slice(json.as_bytes());
        out
    }

    async fn read_json<R: AsyncRead + Unpin>(r: &mut R) -> serde_json::Value {
        let mut header = [0u8; 4];
        r.read_exact(&mut header).await.unwrap();
        let mut body = vec![0u8; u32::from_ne_bytes(header) as usize];
        r.read_exact(&mut body).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    struct NoKeys;

    #[async_trait::async_trait]
    impl IdentityProvider for NoKeys {
        async fn list_identities(&self, _: bool) -> Result<Vec<Identity>, ProviderError> {
            Ok(Vec::new())
        }

        async fn sign(&self, _: &[u8], _: &[u8], _: SignAlgorithm) -> Result<Vec<u8>, ProviderError> {
            Err(ProviderError::NotFound)
        }
    }

    #[test]
    fn parse_extension_origin() {
        assert_eq!(extension_id("chrome-extension://pnhechapfaindjhompbnflcldabbghjo/"), Some(EXT));
        assert_eq!(extension_id("chrome-extension://abc"), Some("abc"));
        assert_eq!(extension_id("chrome-extension:///"), None);
        assert_eq!(extension_id("https://example.com/"), None);
        assert_eq!(extension_id("chrome-extension://abc/def"), None);
    }

    #[tokio::test]
    async fn reads_json_frames() {
        let (mut tx, rx) = duplex(1024);
        tx.write_all(&frame(r#"{"type":"auth-agent@openssh.com","data":[11]}"#))
            .await
            .unwrap();
        drop(tx);

        let mut reader = NativeReader::new(rx);
        assert_eq!(reader.read_frame().await.unwrap(), Some(Message::agent(vec![11])));
        assert_eq!(reader.read_frame().await.unwrap(), None);
    }

    #[tokio::test]
    async fn non_byte_data_is_an_error() {
        let (mut tx, rx) = duplex(1024);
        tx.write_all(&frame(r#"{"type":"auth-agent@openssh.com","data":"AAsA"}"#))
            .await
            .unwrap();
        let mut reader = NativeReader::new(rx);
        assert!(matches!(reader.read_frame().await, Err(FrameError::Json(_))));

        let (mut tx, rx) = duplex(1024);
        tx.write_all(&frame(r#"{"type":"auth-agent@openssh.com","data":[256]}"#))
            .await
            .unwrap();
        let mut reader = NativeReader::new(rx);
        assert!(matches!(reader.read_frame().await, Err(FrameError::Json(_))));
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let (mut tx, rx) = duplex(64);
        tx.write_all(&((MAX_FRAME_LEN as u32) + 1).to_ne_bytes()).await.unwrap();
        let mut reader = NativeReader::new(rx);
        assert!(matches!(
            reader.read_frame().await,
            Err(FrameError::TooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn writes_json_frames() {
        let (tx, mut rx) = duplex(1024);
        let mut writer = NativeWriter::new(tx);
        writer.write_frame(&Message::agent(vec![12, 0, 0, 0, 0])).await.unwrap();
        let value = read_json(&mut rx).await;
        assert_eq!(value["type"], "auth-agent@openssh.com");
        assert_eq!(value["data"], serde_json::json!([12, 0, 0, 0, 0]));
    }

    #[tokio::test]
    async fn agent_over_native_messaging() {
        let (mut browser_out, host_in) = duplex(4096);
        let (host_out, mut browser_in) = duplex(4096);

        let service = AgentService::new(
            AccessControl::new([EXT]),
            RequestHandlers::new(Arc::new(NoKeys), HandlerOptions::default()),
        );
        let (channel, peer) = MessageChannel::pair(EXT);
        let session = service.spawn(channel);
        let pump = tokio::spawn(bridge(NativeReader::new(host_in), NativeWriter::new(host_out), peer));

        browser_out
            .write_all(&frame(r#"{"type":"auth-agent@openssh.com","data":[11]}"#))
            .await
            .unwrap();
        let reply = read_json(&mut browser_in).await;
        assert_eq!(reply["data"], serde_json::json!([12, 0, 0, 0, 0]));

        browser_out
            .write_all(&frame(r#"{"type":"auth-agent@openssh.com","data":[99]}"#))
            .await
            .unwrap();
        let reply = read_json(&mut browser_in).await;
        assert_eq!(reply["data"], serde_json::json!([5]));

        drop(browser_out);
        pump.await.unwrap();
        assert!(session.await.unwrap().is_ok());
    }
}
