use std::env;

/// Public STUN servers used when nothing else is configured.
pub const DEFAULT_ICE_SERVERS: [&str; 2] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

/// Label given to the data channel when the caller does not pick one.
pub const DEFAULT_LABEL: &str = "data";

const ICE_SERVERS_VAR: &str = "DATACHANNEL_ICE_SERVERS";
const DISABLE_STUN_VAR: &str = "DATACHANNEL_DISABLE_STUN";

/// Configuration handed to the engine when a connection is created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
    /// Address-discovery server URIs (`stun:` / `turn:`).
    pub ice_servers: Vec<String>,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            ice_servers: DEFAULT_ICE_SERVERS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl PeerConfig {
    /// No address-discovery servers; host candidates only.
    pub fn localhost() -> Self {
        Self {
            ice_servers: Vec::new(),
        }
    }

    /// Defaults, overridden by `DATACHANNEL_ICE_SERVERS` (comma separated)
    /// and cleared entirely when `DATACHANNEL_DISABLE_STUN` is truthy.
    pub fn from_env() -> Self {
        if env_truthy(DISABLE_STUN_VAR) {
            return Self::localhost();
        }
        match env::var(ICE_SERVERS_VAR) {
            Ok(value) if !value.trim().is_empty() => Self {
                ice_servers: parse_server_list(&value),
            },
            _ => Self::default(),
        }
    }

    pub fn with_ice_server(mut self, url: impl Into<String>) -> Self {
        self.ice_servers.push(url.into());
        self
    }
}

fn env_truthy(var: &str) -> bool {
    env::var(var)
        .map(|v| !v.is_empty() && v != "0" && !v.eq_ignore_ascii_case("false"))
        .unwrap_or(false)
}

fn parse_server_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(str::to_string)
        .collect()
}
