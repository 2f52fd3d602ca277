use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub socket: SocketConfig,
    #[serde(default, rename = "key")]
    pub keys: Vec<KeyEntryConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Peer identifiers permitted to open a session.  For the native
    /// messaging transport these are browser extension ids; for the Unix
    /// socket transport they take the form `uid:<n>`.
    #[serde(default = "default_allowed_peers")]
    pub allowed_peers: Vec<String>,

    /// Honour the `SSH_AGENT_RSA_SHA2_256` / `SSH_AGENT_RSA_SHA2_512` sign
    /// request flags.  When `false` every signature is `ssh-rsa` (SHA-1).
    #[serde(default = "default_true")]
    pub rsa_sha2_flags: bool,

    #[serde(default)]
    pub signature_encoding: SignatureEncoding,

    /// Upper bound on non-interactive identity listing.  Unset means the
    /// engine waits for the provider indefinitely.
    #[serde(default)]
    pub list_timeout_ms: Option<u64>,
}

impl AgentConfig {
    pub fn list_timeout(&self) -> Option<Duration> {
        self.list_timeout_ms.map(Duration::from_millis)
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            allowed_peers: default_allowed_peers(),
            rsa_sha2_flags: true,
            signature_encoding: SignatureEncoding::default(),
            list_timeout_ms: None,
        }
    }
}

/// How an RSA signature value is framed inside a sign response.  Non-RSA
/// signatures always use the string form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignatureEncoding {
    /// `string(algorithm) ++ mpint(value)`.  Leading zero bytes of the value
    /// are lost, so OpenSSH rejects signatures shorter than the modulus.
    Mpint,
    /// `string(algorithm) ++ string(value)`, the RFC 8332 signature blob.
    #[default]
    String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SocketConfig {
    /// Where to bind the `SSH_AUTH_SOCK` style listener.  Unset disables it
    /// unless `--socket` is given on the command line.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// A private key file to load into the in-memory key store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyEntryConfig {
    pub path: PathBuf,
    /// Comment reported alongside the key.  Defaults to the file name.
    #[serde(default)]
    pub comment: Option<String>,
}

impl KeyEntryConfig {
    pub fn comment_or_file_name(&self) -> String {
        if let Some(comment) = &self.comment {
            return comment.clone();
        }
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

fn default_allowed_peers() -> Vec<String> {
    vec![
        // Secure Shell
        "pnhechapfaindjhompbnflcldabbghjo".to_string(),
        // Secure Shell (dev)
        "okddffdblfhhnmhodogpojmfkjmhinfp".to_string(),
    ]
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_gives_defaults() {
        let cfg: Config = toml::from_str("").unwrap();
        assert_eq!(cfg.agent.allowed_peers.len(), 2);
        assert!(
            cfg.agent
                .allowed_peers
                .contains(&"pnhechapfaindjhompbnflcldabbghjo".to_string())
        );
        assert!(cfg.agent.rsa_sha2_flags);
        assert_eq!(cfg.agent.signature_encoding, SignatureEncoding::String);
        assert!(cfg.agent.list_timeout().is_none());
        assert!(cfg.socket.path.is_none());
        assert!(cfg.keys.is_empty());
    }

    #[test]
    fn parse_agent_section() {
        let toml_str = r#"
            [agent]
            allowed_peers = ["uid:1000"]
            rsa_sha2_flags = false
            signature_encoding = "mpint"
            list_timeout_ms = 1500
        "#;
        let cfg: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.agent.allowed_peers, vec!["uid:1000".to_string()]);
        assert!(!cfg.agent.rsa_sha2_flags);
        assert_eq!(cfg.agent.signature_encoding, SignatureEncoding::Mpint);
        assert_eq!(cfg.agent.list_timeout(), Some(Duration::from_millis(1500)));
    }

    #[test]
    fn empty_allow_list_is_kept() {
        let cfg: Config = toml::from_str("[agent]\nallowed_peers = []\n").unwrap();
        assert!(cfg.agent.allowed_peers.is_empty());
    }

    #[test]
    fn unknown_signature_encoding_is_rejected() {
        let result: Result<Config, _> = toml::from_str("[agent]\nsignature_encoding = \"base64\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn parse_key_entries() {
        let toml_str = r#"
            [socket]
            path = "/run/user/1000/keyrelay/agent.sock"

            [[key]]
            path = "/home/me/.ssh/id_rsa"
            comment = "work"

            [[key]]
            path = "/home/me/.ssh/deploy_key"
        "#;
        let cfg: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(
            cfg.socket.path.as_deref(),
            Some(std::path::Path::new("/run/user/1000/keyrelay/agent.sock"))
        );
        assert_eq!(cfg.keys.len(), 2);
        assert_eq!(cfg.keys[0].comment_or_file_name(), "work");
        assert_eq!(cfg.keys[1].comment_or_file_name(), "deploy_key");
    }

    #[test]
    fn config_roundtrip_serialize() {
        let cfg = Config::default();
        let serialized = toml::to_string(&cfg).unwrap();
        let deserialized: Config = toml::from_str(&serialized).unwrap();
        assert_eq!(deserialized.agent.allowed_peers, cfg.agent.allowed_peers);
        assert_eq!(
            deserialized.agent.signature_encoding,
            cfg.agent.signature_encoding
        );
    }
}
