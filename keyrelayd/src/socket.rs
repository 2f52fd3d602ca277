//! `SSH_AUTH_SOCK` style Unix socket transport.
//!
//! Frames use the standard agent framing: a big-endian `u32` length and then
//! the message body.  Each connection becomes one session whose peer id is
//! `uid:<n>` of the connecting process.

use std::future::Future;
use std::os::unix::fs::PermissionsExt as _;
use std::path::Path;
use std::time::Duration;

use anyhow::Context as _;
use keyrelay_agent::wire::MAX_FIELD_LEN;
use keyrelay_agent::{AgentService, Message, MessageChannel};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

use crate::transport::{FrameError, FrameReader, FrameWriter, bridge};

/// Peer id prefix for socket connections.
pub const UID_PREFIX: &str = "uid:";

/// Pause after a failed `accept` (e.g. `EMFILE`) before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

pub struct AgentFrameReader<R> {
    inner: R,
}

impl<R> AgentFrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }
}

#[async_trait::async_trait]
impl<R: AsyncRead + Unpin + Send> FrameReader for AgentFrameReader<R> {
    async fn read_frame(&mut self) -> Result<Option<Message>, FrameError> {
        let len = match self.inner.read_u32().await {
            Ok(len) => len as usize,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if len > MAX_FIELD_LEN {
            return Err(FrameError::TooLarge {
                len,
                limit: MAX_FIELD_LEN,
            });
        }
        let mut body = vec![0u8; len];
        self.inner.read_exact(&mut body).await?;
        Ok(Some(Message::agent(body)))
    }
}

pub struct AgentFrameWriter<W> {
    inner: W,
}

impl<W> AgentFrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

#[async_trait::async_trait]
impl<W: AsyncWrite + Unpin + Send> FrameWriter for AgentFrameWriter<W> {
    async fn write_frame(&mut self, message: &Message) -> Result<(), FrameError> {
        // Sessions only ever reply with agent envelopes; the tag has no place
        // in this framing.
        let len = u32::try_from(message.data.len()).map_err(|_| FrameError::TooLarge {
            len: message.data.len(),
            limit: u32::MAX as usize,
        })?;
        self.inner.write_u32(len).await?;
        self.inner.write_all(&message.data).await?;
        self.inner.flush().await?;
        Ok(())
    }
}

/// Bind the agent socket with mode 0600, replacing a stale one.
pub fn bind(path: &Path) -> anyhow::Result<UnixListener> {
    if path.exists() {
        std::fs::remove_file(path).with_context(|| format!("remove stale socket {path:?}"))?;
    }
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create socket directory {parent:?}"))?;
    }
    let listener =
        UnixListener::bind(path).with_context(|| format!("bind agent socket {path:?}"))?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .with_context(|| format!("chmod 0600 {path:?}"))?;
    info!(path = %path.display(), "agent socket listening");
    Ok(listener)
}

/// Accept connections forever, one session per connection.
pub async fn serve(listener: UnixListener, service: AgentService) {
    let listener = &listener;
    loop {
        let (stream, _) = next_connection(move || listener.accept()).await;
        connect(stream, &service);
    }
}

/// Retry `accept` until it yields a connection, sleeping after each error.
async fn next_connection<T, F, Fut>(mut accept: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::io::Result<T>>,
{
    loop {
        match accept().await {
            Ok(conn) => return conn,
            Err(e) => {
                warn!(error = %e, "accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

fn connect(stream: UnixStream, service: &AgentService) {
    let peer_id = match stream.peer_cred() {
        Ok(cred) => format!("{UID_PREFIX}{}", cred.uid()),
        Err(e) => {
            warn!(error = %e, "cannot read peer credentials, dropping connection");
            return;
        }
    };
    debug!(peer = %peer_id, "socket connection");

    let (channel, peer) = MessageChannel::pair(peer_id);
    let (read_half, write_half) = stream.into_split();
    tokio::spawn(bridge(
        AgentFrameReader::new(read_half),
        AgentFrameWriter::new(write_half),
        peer,
    ));
    service.spawn(channel);
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::MetadataExt as _;
    use std::sync::Arc;

    use keyrelay_agent::keystore::{KeyStore, KeyStoreProvider, build_entry};
    use keyrelay_agent::pem::extract_keys;
    use keyrelay_agent::proto::decode_identities_answer;
    use keyrelay_agent::{AccessControl, HandlerOptions, RequestHandlers};
    use tokio::io::duplex;

    use super::*;

    const PKCS1: &str = include_str!("../../keyrelay-agent/testdata/rsa_pkcs1.pem");

    async fn request(stream: &mut UnixStream, body: &[u8]) -> Vec<u8> {
        stream.write_u32(body.len() as u32).await.unwrap();
        stream.write_all(body).await.unwrap();
        let len = stream.read_u32().await.unwrap();
        let mut reply = vec![0u8; len as usize];
        stream.read_exact(&mut reply).await.unwrap();
        reply
    }

    fn service_for(peer: String) -> AgentService {
        let store = KeyStore::new();
        let key = extract_keys(PKCS1).remove(0);
        store
            .write()
            .unwrap()
            .insert(build_entry(key, "fixture".into(), "test".into()).unwrap());
        AgentService::new(
            AccessControl::new([peer]),
            RequestHandlers::new(Arc::new(KeyStoreProvider::new(store)), HandlerOptions::default()),
        )
    }

    #[tokio::test]
    async fn frame_codec() {
        let (mut tx, rx) = duplex(64);
        tx.write_all(&[0, 0, 0, 1, 11, 0, 0, 0, 0]).await.unwrap();
        drop(tx);
        let mut reader = AgentFrameReader::new(rx);
        assert_eq!(reader.read_frame().await.unwrap(), Some(Message::agent(vec![11])));
        assert_eq!(reader.read_frame().await.unwrap(), Some(Message::agent(Vec::new())));
        assert_eq!(reader.read_frame().await.unwrap(), None);

        let (tx, mut rx) = duplex(64);
        AgentFrameWriter::new(tx)
            .write_frame(&Message::agent(vec![5]))
            .await
            .unwrap();
        let mut out = [0u8; 5];
        rx.read_exact(&mut out).await.unwrap();
        assert_eq!(out, [0, 0, 0, 1, 5]);
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let (mut tx, rx) = duplex(64);
        tx.write_u32(MAX_FIELD_LEN as u32 + 1).await.unwrap();
        let mut reader = AgentFrameReader::new(rx);
        assert!(matches!(
            reader.read_frame().await,
            Err(FrameError::TooLarge { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn accept_errors_back_off() {
        let mut failures = 3;
        let started = tokio::time::Instant::now();
        let conn = next_connection(|| {
            let result = if failures > 0 {
                failures -= 1;
                Err(std::io::Error::other("too many open files"))
            } else {
                Ok(7)
            };
            async move { result }
        })
        .await;
        assert_eq!(conn, 7);
        assert_eq!(failures, 0);
        assert!(started.elapsed() >= ACCEPT_BACKOFF * 3);
    }

    #[tokio::test]
    async fn socket_is_private_and_replaces_stale_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.sock");
        std::fs::write(&path, b"stale").unwrap();

        let _listener = bind(&path).unwrap();
        let mode = std::fs::metadata(&path).unwrap().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn serves_allowed_uid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.sock");
        let own_uid = std::fs::metadata(dir.path()).unwrap().uid();

        let listener = bind(&path).unwrap();
        tokio::spawn(serve(listener, service_for(format!("uid:{own_uid}"))));

        let mut client = UnixStream::connect(&path).await.unwrap();
        let answer = decode_identities_answer(&request(&mut client, &[11]).await).unwrap();
        assert_eq!(answer.len(), 1);
        assert_eq!(answer[0].1, "fixture");

        assert_eq!(request(&mut client, &[99]).await, vec![5]);
        assert_eq!(request(&mut client, &[]).await, vec![5]);
    }

    #[tokio::test]
    async fn rejects_other_uids() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.sock");
        let listener = bind(&path).unwrap();
        tokio::spawn(serve(listener, service_for("uid:4294967294".to_string())));

        let mut client = UnixStream::connect(&path).await.unwrap();
        client.write_all(&[0, 0, 0, 1, 11]).await.unwrap();
        let mut buf = Vec::new();
        // The agent closes without answering.
        let n = client.read_to_end(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0);
    }
}
