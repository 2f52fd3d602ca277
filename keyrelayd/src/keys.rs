//! Populate the key store from `[[key]]` config entries.

use std::path::{Path, PathBuf};

use keyrelay_agent::keystore::{KeyStore, build_entry};
use keyrelay_agent::pem;
use keyrelay_core::config::KeyEntryConfig;
use tracing::{info, warn};

/// Expand a leading `~/` against `$HOME`.
pub fn expand_home(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~")
        && let Some(home) = std::env::var_os("HOME")
    {
        return PathBuf::from(home).join(rest);
    }
    path.to_path_buf()
}

/// Load every configured key file.  Files that cannot be read are logged and
/// skipped.  Returns the number of keys added.
pub fn load_keys(entries: &[KeyEntryConfig], store: &mut KeyStore) -> usize {
    let mut added = 0;
    for entry in entries {
        let path = expand_home(&entry.path);
        let keys = match pem::load_file(&path) {
            Ok(keys) => keys,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping key file");
                continue;
            }
        };
        if keys.is_empty() {
            warn!(path = %path.display(), "no usable private key in file");
            continue;
        }

        let comment = entry.comment_or_file_name();
        let source = path.display().to_string();
        for key in keys {
            match build_entry(key, comment.clone(), source.clone()) {
                Ok(key_entry) => {
                    if store.insert(key_entry) {
                        added += 1;
                    }
                }
                Err(e) => warn!(path = %path.display(), error = %e, "skipping key"),
            }
        }
    }
    if store.is_empty() {
        warn!("no keys loaded; identity listings will be empty");
    }
    info!(added, total = store.len(), "keys loaded");
    added
}
