//! Agent authentication
//!
//! Bridges inbound tunnel authorization into credential verification plus
//! registry mutation. A failed verification never touches the registry.

use std::sync::Arc;

use dockway_auth::{verify, SigningKey};
use dockway_registry::{Agent, AgentRegistry};
use dockway_transport::{AuthOutcome, Authorizer, TunnelHello};
use tracing::{debug, info, warn};

/// Decides whether an inbound tunnel session may be served and keeps the
/// live-agent registry in sync with session lifecycle.
pub struct Authenticator {
    registry: Arc<AgentRegistry>,
    signing_key: SigningKey,
}

impl Authenticator {
    pub fn new(registry: Arc<AgentRegistry>, signing_key: SigningKey) -> Self {
        Self {
            registry,
            signing_key,
        }
    }
}

impl Authorizer for Authenticator {
    fn authorize(&self, hello: &TunnelHello) -> AuthOutcome {
        // No credential, or a blank identity, is silently rejected; only a
        // presented-but-wrong proof is worth reporting.
        let Some(credential) = &hello.credential else {
            debug!("tunnel attempt without credentials");
            return AuthOutcome::Anonymous;
        };
        if credential.id.is_empty() {
            debug!("tunnel attempt with blank agent id");
            return AuthOutcome::Anonymous;
        }

        if !verify(&credential.id, &credential.proof, &self.signing_key) {
            warn!(agent_id = %credential.id, "agent presented an invalid proof");
            return AuthOutcome::Denied {
                agent_id: credential.id.clone(),
            };
        }

        let remote_address = hello.remote_addr.clone().unwrap_or_default();
        self.registry
            .put(Agent::connected_now(&credential.id, remote_address));
        info!(agent_id = %credential.id, "agent online");

        AuthOutcome::Granted {
            agent_id: credential.id.clone(),
        }
    }

    fn disconnect(&self, agent_id: &str) {
        if self.registry.remove(agent_id) {
            info!(agent_id = %agent_id, "agent offline");
        }
    }
}
