//! Tunnel transport boundary for the dockway broker
//!
//! The broker core does not implement the persistent-connection transport
//! itself (upgrade handling, framing, keepalive, the byte-level
//! dial-and-pipe). It talks to the transport through the
//! [`TunnelTransport`] trait and hands the transport an [`Authorizer`] at
//! construction time to gate inbound agent sessions.
//!
//! [`memory::MemoryTransport`] is an in-process implementation used by
//! tests and single-process deployments.

pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use dockway_auth::Credential;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// Byte stream obtained by dialing through an agent's tunnel.
pub trait TunnelIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> TunnelIo for T {}

pub type TunnelStream = Box<dyn TunnelIo>;

/// Where a tunnel dial should land on the agent side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DialTarget {
    /// Unix domain socket path (e.g. the Docker daemon socket).
    Unix(String),
    /// TCP `host:port` on the agent's network.
    Tcp(String),
}

impl std::fmt::Display for DialTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DialTarget::Unix(path) => write!(f, "unix:{path}"),
            DialTarget::Tcp(addr) => write!(f, "tcp:{addr}"),
        }
    }
}

/// What an agent presented when opening its tunnel.
#[derive(Debug, Clone, Default)]
pub struct TunnelHello {
    pub credential: Option<Credential>,
    /// Best-effort network origin of the agent.
    pub remote_addr: Option<String>,
}

/// Outcome of an authorization attempt.
///
/// `Granted` is only ever produced with a non-empty agent id, so an
/// anonymous session can never be served under a blank identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    /// No credential presented; silently rejected.
    Anonymous,
    /// Credential presented but the proof did not match.
    Denied { agent_id: String },
    /// Credential verified; the agent is registered and may be served.
    Granted { agent_id: String },
}

/// Authorization capability injected into a transport at construction.
pub trait Authorizer: Send + Sync {
    /// Decide whether an inbound tunnel session may be served.
    fn authorize(&self, hello: &TunnelHello) -> AuthOutcome;

    /// Teardown hook invoked after a tunnel session ends.
    ///
    /// Idempotent: it may also run for sessions that never registered.
    fn disconnect(&self, agent_id: &str);
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("not authorized")]
    Unauthorized,

    #[error("agent {0} is not connected")]
    AgentNotConnected(String),

    #[error("dial through agent {agent_id} timed out after {timeout:?}")]
    DialTimeout { agent_id: String, timeout: Duration },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A tunnel transport: serves inbound agent sessions and dials through them.
#[async_trait]
pub trait TunnelTransport: Send + Sync {
    /// Serve one agent tunnel session.
    ///
    /// Authorizes `hello` through the injected [`Authorizer`], then keeps
    /// the session open until the agent disconnects or is replaced by a
    /// newer session under the same id. Returns the agent id the session
    /// was served under.
    async fn serve_tunnel(&self, hello: TunnelHello) -> Result<String, TransportError>;

    /// Open a byte stream to `target` through the tunnel held by `agent_id`.
    ///
    /// Bounded by `timeout`; a missing agent fails immediately rather than
    /// waiting for it to appear.
    async fn dial(
        &self,
        agent_id: &str,
        timeout: Duration,
        target: DialTarget,
    ) -> Result<TunnelStream, TransportError>;
}
