//! Dockway CLI - reverse-tunnel broker for private Docker daemons
//!
//! Runs the public broker; agents connect outbound and are addressed by
//! subdomain. Can also host a local agent in-process for one-box setups.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dockway_auth::{sign, Credential, SigningKey};
use dockway_broker::{serve, AppState, Authenticator, BrokerConfig};
use dockway_registry::AgentRegistry;
use dockway_transport::memory::{local_resource, MemoryTransport};
use dockway_transport::{Authorizer, DialTarget, TunnelHello, TunnelTransport};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("GIT_HASH"),
    ", built ",
    env!("BUILD_TIME"),
    ")"
);

/// Dockway - expose private Docker daemons through a public broker
#[derive(Parser, Debug)]
#[command(name = "dockway")]
#[command(about = "Dockway - expose private Docker daemons through a public broker")]
#[command(version, long_version = LONG_VERSION)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the broker
    #[command(long_about = r#"
Run the public broker. Agents authenticate with HTTP Basic credentials
(username = agent id, password = HMAC-SHA256 of the id under the signing
key) and requests reach an agent by subdomain:

  curl http://my-agent.cmd.plus/v1.41/containers/json

ENVIRONMENT VARIABLES:
  DOCKWAY_BIND         Address to bind (default 0.0.0.0)
  DOCKWAY_PORT         Port to listen on (default 8080)
  DOCKWAY_DOMAIN       Domain suffix stripped from Host headers
  DOCKWAY_SIGN_KEY     Shared signing key for agent credentials
  DOCKWAY_TIMEOUT      Proxied request timeout in seconds
  DOCKWAY_SOCKET       Agent-side dial target (path or tcp://host:port)
  DOCKWAY_LOCAL_AGENT  Also serve a local in-process agent under this id
    "#)]
    Serve {
        /// Address to bind
        #[arg(long, env = "DOCKWAY_BIND", default_value = "0.0.0.0")]
        bind: String,

        /// Port to listen on
        #[arg(long, env = "DOCKWAY_PORT", default_value = "8080")]
        port: u16,

        /// Domain suffix stripped from Host headers when resolving agent ids
        #[arg(long, env = "DOCKWAY_DOMAIN", default_value = "cmd.plus")]
        domain: String,

        /// Shared signing key for agent credentials
        #[arg(long, env = "DOCKWAY_SIGN_KEY")]
        sign_key: String,

        /// Proxied request timeout in seconds
        #[arg(long, env = "DOCKWAY_TIMEOUT", default_value = "15")]
        timeout: u64,

        /// Agent-side dial target: a unix socket path, or tcp://host:port
        #[arg(long, env = "DOCKWAY_SOCKET", default_value = "/var/run/docker.sock")]
        socket: String,

        /// Also run an in-process agent under this id, fronting the local
        /// dial target
        #[arg(long, env = "DOCKWAY_LOCAL_AGENT")]
        local_agent: Option<String>,
    },

    /// Print the credential proof for an agent id
    Sign {
        /// Agent id to sign
        agent_id: String,

        /// Shared signing key for agent credentials
        #[arg(long, env = "DOCKWAY_SIGN_KEY")]
        sign_key: String,
    },
}

fn setup_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

fn parse_target(socket: &str) -> DialTarget {
    match socket.strip_prefix("tcp://") {
        Some(addr) => DialTarget::Tcp(addr.to_string()),
        None => DialTarget::Unix(socket.to_string()),
    }
}

/// Serve an in-process agent session fronting the local dial target.
///
/// The session authenticates like any external agent and stays up until
/// broker shutdown.
fn spawn_local_agent(
    transport: Arc<MemoryTransport>,
    authenticator: Arc<Authenticator>,
    agent_id: String,
    key: &SigningKey,
) {
    transport.offer(&agent_id, local_resource());

    let hello = TunnelHello {
        credential: Some(Credential::for_agent(&agent_id, key)),
        remote_addr: Some("local".to_string()),
    };

    tokio::spawn(async move {
        info!(agent_id = %agent_id, "starting local agent");
        match transport.serve_tunnel(hello).await {
            Ok(served_as) => {
                authenticator.disconnect(&served_as);
                info!(agent_id = %served_as, "local agent stopped");
            }
            Err(err) => error!(agent_id = %agent_id, error = %err, "local agent rejected"),
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    match cli.command {
        Commands::Serve {
            bind,
            port,
            domain,
            sign_key,
            timeout,
            socket,
            local_agent,
        } => {
            let key = SigningKey::from(sign_key.as_str());

            let mut config = BrokerConfig::new(key.clone());
            config.bind_addr = bind;
            config.port = port;
            config.domain_suffix = domain;
            config.request_timeout = Duration::from_secs(timeout);
            config.upstream = parse_target(&socket);

            info!(
                suffix = %config.domain_suffix,
                upstream = %config.upstream,
                timeout_secs = timeout,
                "dockway starting"
            );

            let registry = Arc::new(AgentRegistry::new());
            let authenticator = Arc::new(Authenticator::new(Arc::clone(&registry), key.clone()));
            let transport = Arc::new(MemoryTransport::new(authenticator.clone()));

            if let Some(agent_id) = local_agent {
                spawn_local_agent(
                    Arc::clone(&transport),
                    Arc::clone(&authenticator),
                    agent_id,
                    &key,
                );
            }

            let state = AppState::new(config, transport, registry, authenticator);
            serve(state).await.context("broker exited with an error")?;

            info!("dockway stopped");
            Ok(())
        }

        Commands::Sign { agent_id, sign_key } => {
            let key = SigningKey::from(sign_key.as_str());
            println!("{}", sign(&agent_id, &key));
            Ok(())
        }
    }
}
