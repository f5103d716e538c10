//! Miner identity as discovered from the chain metagraph.

use serde::{Deserialize, Serialize};

/// Miner table index. Non-negative for on-chain miners; negative values are
/// reserved for local-test synthetic targets that exist outside the
/// metagraph.
pub type Uid = i64;

/// One row of the metagraph: where a miner serves and who it claims to be.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MinerIdentity {
    pub uid: Uid,
    pub ip: String,
    pub port: u16,
    /// Opaque cryptographic identifier from the chain registry.
    pub hotkey: String,
}

impl MinerIdentity {
    /// Network address in `ip:port` form.
    pub fn address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    /// Validators and unregistered slots publish a zero endpoint; only
    /// miners with a real address are worth probing.
    pub fn has_served_endpoint(&self) -> bool {
        !self.ip.is_empty() && self.ip != "0.0.0.0" && self.port != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_endpoint_is_not_probed() {
        let mut m = MinerIdentity {
            uid: 3,
            ip: "0.0.0.0".to_string(),
            port: 8091,
            hotkey: "hk-3".to_string(),
        };
        assert!(!m.has_served_endpoint());
        m.ip = "10.0.0.7".to_string();
        assert!(m.has_served_endpoint());
        m.port = 0;
        assert!(!m.has_served_endpoint());
    }

    #[test]
    fn test_address_format() {
        let m = MinerIdentity {
            uid: 0,
            ip: "127.0.0.1".to_string(),
            port: 9000,
            hotkey: "hk".to_string(),
        };
        assert_eq!(m.address(), "127.0.0.1:9000");
    }
}
