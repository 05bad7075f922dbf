//! Control and routing layer of the dockway reverse-tunnel broker
//!
//! Agents hold outbound tunnels open to the broker; external HTTP clients
//! reach an agent's private resource by addressing
//! `<agent-id>.<domain-suffix>`. This crate authenticates inbound agent
//! tunnels, tracks live agents, derives routing keys from the Host header,
//! and proxies external requests through the right tunnel.

pub mod authenticator;
pub mod config;
pub mod proxy;
pub mod routing;
pub mod server;

pub use authenticator::Authenticator;
pub use config::BrokerConfig;
pub use proxy::{ProxyClients, ProxyError};
pub use routing::resolve_agent_id;
pub use server::{router, serve, AppState, ServerError};
