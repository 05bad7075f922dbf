//! Routing-key derivation
//!
//! An inbound request is routed by its Host header: strip an optional
//! `:port`, then strip the configured domain suffix. Whatever remains is
//! the agent id. The derivation is pure and total; a nonexistent agent is
//! only detected downstream at dial time.

/// Derive the agent id addressed by `host`.
///
/// With suffix `cmd.plus`, `agent1.cmd.plus:443` resolves to `agent1`.
/// With no suffix configured, the full port-stripped host is the agent id.
pub fn resolve_agent_id(host: &str, domain_suffix: &str) -> String {
    let host = host.split(':').next().unwrap_or(host);

    if !domain_suffix.is_empty() {
        if let Some(agent_id) = host.strip_suffix(&format!(".{domain_suffix}")) {
            return agent_id.to_string();
        }
    }

    host.to_string()
}
