//! Per-connection peer gate.

use std::collections::HashSet;

use tracing::warn;

/// Fixed allow-list of peer identifiers, consulted once per channel.
#[derive(Debug, Clone, Default)]
pub struct AccessControl {
    allowed: HashSet<String>,
}

impl AccessControl {
    pub fn new<I, S>(allowed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed: allowed.into_iter().map(Into::into).collect(),
        }
    }

    /// Whether `peer` may use the agent.  Rejections are logged.
    pub fn is_allowed(&self, peer: &str) -> bool {
        let allowed = self.allowed.contains(peer);
        if !allowed {
            warn!(peer = %peer, "rejected connection from disallowed peer");
        }
        allowed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_only_listed_peers() {
        let access = AccessControl::new(["pnhechapfaindjhompbnflcldabbghjo", "uid:1000"]);
        assert!(access.is_allowed("pnhechapfaindjhompbnflcldabbghjo"));
        assert!(access.is_allowed("uid:1000"));
        assert!(!access.is_allowed("uid:0"));
        assert!(!access.is_allowed(""));
    }

    #[test]
    fn matching_is_exact() {
        let access = AccessControl::new(vec!["abc".to_string()]);
        assert!(!access.is_allowed("ABC"));
        assert!(!access.is_allowed("abc "));
        assert!(!access.is_allowed("ab"));
    }

    #[test]
    fn empty_list_rejects_everyone() {
        let access = AccessControl::default();
        assert!(!access.is_allowed("anyone"));
        assert!(!access.is_allowed(""));
    }
}
