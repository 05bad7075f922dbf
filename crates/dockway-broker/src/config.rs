//! Broker configuration

use std::time::Duration;

use dockway_auth::SigningKey;
use dockway_transport::DialTarget;

/// Process-wide broker configuration, loaded once at startup.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Address the HTTP listener binds to.
    pub bind_addr: String,
    /// Port the HTTP listener binds to.
    pub port: u16,
    /// Domain suffix stripped from the Host header when deriving the
    /// routing key; empty means the full host is the agent id.
    pub domain_suffix: String,
    /// Shared key agents must prove knowledge of.
    pub signing_key: SigningKey,
    /// Overall bound on one proxied request, dial included.
    pub request_timeout: Duration,
    /// Fixed agent-side resource every proxied request lands on.
    pub upstream: DialTarget,
}

impl BrokerConfig {
    pub fn new(signing_key: SigningKey) -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            port: 8080,
            domain_suffix: "cmd.plus".to_string(),
            signing_key,
            request_timeout: Duration::from_secs(15),
            upstream: DialTarget::Unix("/var/run/docker.sock".to_string()),
        }
    }
}
