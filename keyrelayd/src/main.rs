mod bootstrap;
mod keys;
mod native;
mod socket;
mod transport;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::Parser;
use keyrelay_agent::keystore::{KeyStore, KeyStoreProvider};
use keyrelay_agent::{AccessControl, AgentService, HandlerOptions, MessageChannel, RequestHandlers};
use keyrelay_core::config::Config;
use tracing_subscriber::EnvFilter;

/// SSH agent that signs with locally held keys on behalf of a browser
/// extension or local SSH clients.
#[derive(Debug, Parser)]
#[command(name = "keyrelayd", version)]
struct Args {
    /// Path to config file (default: $XDG_CONFIG_HOME/keyrelay/config.toml).
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Serve an SSH_AUTH_SOCK style Unix socket at PATH.
    #[arg(long, value_name = "PATH")]
    socket: Option<PathBuf>,

    /// Calling extension origin, passed by the browser when it starts a
    /// native messaging host (`chrome-extension://<id>/`).
    origin: Option<String>,

    /// Passed by some browsers on Windows; unused.
    #[arg(long = "parent-window", hide = true)]
    _parent_window: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Stdout carries protocol frames in native messaging mode.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    // Before any key file is read.
    bootstrap::harden_process();

    let args = Args::parse();
    let config_path = args.config.clone().unwrap_or_else(default_config_path);
    let config = load_config(&config_path)?;
    tracing::info!("loaded config from {}", config_path.display());

    let store = KeyStore::new();
    {
        let mut guard = store
            .write()
            .map_err(|_| anyhow::anyhow!("key store lock poisoned"))?;
        keys::load_keys(&config.keys, &mut guard);
    }

    let handlers = RequestHandlers::new(
        Arc::new(KeyStoreProvider::new(store)),
        HandlerOptions::from(&config.agent),
    );
    if config.agent.allowed_peers.is_empty() {
        tracing::warn!("allowed_peers is empty; every session will be rejected");
    }
    tracing::info!(peers = config.agent.allowed_peers.len(), "allow-list configured");
    let access = AccessControl::new(config.agent.allowed_peers.iter().cloned());
    let service = AgentService::new(access, handlers);

    if let Some(origin) = args.origin.as_deref() {
        run_native(service, origin).await
    } else if let Some(path) = args.socket.as_deref().or(config.socket.path.as_deref()) {
        if !config.agent.allowed_peers.iter().any(|p| p.starts_with(socket::UID_PREFIX)) {
            tracing::warn!("allowed_peers has no uid:<n> entry; every socket connection will be rejected");
        }
        run_socket(service, path).await
    } else {
        anyhow::bail!("nothing to serve: pass a chrome-extension:// origin or --socket <path>")
    }
}

/// One session over stdin/stdout for the extension that launched us.
async fn run_native(service: AgentService, origin: &str) -> Result<()> {
    let peer_id = native::extension_id(origin)
        .with_context(|| format!("unrecognised caller origin {origin:?}"))?;
    tracing::info!(peer = %peer_id, "native messaging session");

    let (channel, peer) = MessageChannel::pair(peer_id);
    let pump = transport::bridge(
        native::NativeReader::new(tokio::io::stdin()),
        native::NativeWriter::new(tokio::io::stdout()),
        peer,
    );

    tokio::select! {
        (outcome, ()) = async { tokio::join!(service.serve(channel), pump) } => {
            // The peer only ever sees a closed pipe; the reason is logged by
            // the service.
            if let Err(e) = outcome {
                tracing::debug!(error = %e, "native session ended");
            }
        }
        () = shutdown_signal() => tracing::info!("received shutdown signal, exiting"),
    }
    Ok(())
}

async fn run_socket(service: AgentService, path: &Path) -> Result<()> {
    let listener = socket::bind(path)?;
    tokio::select! {
        () = socket::serve(listener, service) => {}
        () = shutdown_signal() => tracing::info!("received shutdown signal, exiting"),
    }
    if let Err(e) = std::fs::remove_file(path) {
        tracing::warn!(path = %path.display(), "failed to remove agent socket: {e}");
    }
    Ok(())
}

/// Wait for ctrl-c (SIGINT) or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!("failed to register SIGTERM handler: {e}, falling back to SIGINT only");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}

fn default_config_path() -> PathBuf {
    let base = std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))
        .unwrap_or_else(|| {
            tracing::warn!("neither XDG_CONFIG_HOME nor HOME are set; using current directory for config");
            PathBuf::from(".")
        });
    base.join("keyrelay").join("config.toml")
}

fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        tracing::info!("no config file at {}, using defaults", path.display());
        return Ok(Config::default());
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        match std::fs::metadata(path) {
            Ok(meta) => {
                let mode = meta.mode();
                if mode & 0o077 != 0 {
                    tracing::warn!(
                        path = %path.display(),
                        mode = format!("{:o}", mode & 0o777),
                        "config file is accessible by group or others, recommend chmod 600"
                    );
                }
            }
            Err(e) => tracing::warn!("could not check config file permissions: {e}"),
        }
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("read config {}", path.display()))?;
    let config: Config =
        toml::from_str(&content).with_context(|| format!("parse config {}", path.display()))?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;
    use std::os::unix::fs::PermissionsExt as _;

    use keyrelay_core::config::SignatureEncoding;

    use super::*;

    #[test]
    fn missing_config_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("config.toml")).unwrap();
        assert_eq!(config.agent.allowed_peers.len(), 2);
        assert!(config.keys.is_empty());
    }

    #[test]
    fn config_file_is_parsed() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[agent]\nallowed_peers = [\"uid:1000\"]\nsignature_encoding = \"mpint\"\n\n[[key]]\npath = \"~/.ssh/id_rsa\""
        )
        .unwrap();
        std::fs::set_permissions(file.path(), std::fs::Permissions::from_mode(0o600)).unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.agent.allowed_peers, ["uid:1000"]);
        assert_eq!(config.agent.signature_encoding, SignatureEncoding::Mpint);
        assert_eq!(config.keys.len(), 1);
    }

    #[test]
    fn invalid_config_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[agent]\nrsa_sha2_flags = \"yes\"").unwrap();
        assert!(load_config(file.path()).is_err());
    }

    #[test]
    fn cli_accepts_browser_arguments() {
        let args = Args::try_parse_from([
            "keyrelayd",
            "chrome-extension://pnhechapfaindjhompbnflcldabbghjo/",
            "--parent-window=0",
        ])
        .unwrap();
        assert_eq!(
            args.origin.as_deref(),
            Some("chrome-extension://pnhechapfaindjhompbnflcldabbghjo/")
        );
        assert!(args.socket.is_none());

        let args = Args::try_parse_from(["keyrelayd", "-c", "/tmp/c.toml", "--socket", "/tmp/a.sock"])
            .unwrap();
        assert_eq!(args.config.as_deref(), Some(Path::new("/tmp/c.toml")));
        assert_eq!(args.socket.as_deref(), Some(Path::new("/tmp/a.sock")));
    }
}
