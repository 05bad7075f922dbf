//! Broker HTTP surface and composition root
//!
//! Four endpoints: `/tunnel` for inbound agent sessions, `/-/agents` and
//! `/-/agent` for introspection, and a catch-all that proxies by Host
//! header. All error bodies are JSON with a `message` field; internals are
//! never exposed beyond the failure reason.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Query, Request, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::{Json, Router};
use dockway_auth::Credential;
use dockway_registry::{Agent, AgentRegistry};
use dockway_transport::{Authorizer, TransportError, TunnelHello, TunnelTransport};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::authenticator::Authenticator;
use crate::config::BrokerConfig;
use crate::proxy::ProxyClients;
use crate::routing::resolve_agent_id;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("server error: {0}")]
    Serve(#[from] std::io::Error),
}

/// Shared broker state, created once at startup and injected into every
/// handler.
pub struct AppState {
    pub config: BrokerConfig,
    pub registry: Arc<AgentRegistry>,
    pub authenticator: Arc<Authenticator>,
    pub transport: Arc<dyn TunnelTransport>,
    pub proxy: ProxyClients,
}

impl AppState {
    pub fn new(
        config: BrokerConfig,
        transport: Arc<dyn TunnelTransport>,
        registry: Arc<AgentRegistry>,
        authenticator: Arc<Authenticator>,
    ) -> Arc<Self> {
        let proxy = ProxyClients::new(
            Arc::clone(&transport),
            config.upstream.clone(),
            config.request_timeout,
        );
        Arc::new(Self {
            config,
            registry,
            authenticator,
            transport,
            proxy,
        })
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    message: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorBody {
            message: message.into(),
        }),
    )
        .into_response()
}

/// Build the broker router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/tunnel", any(tunnel))
        .route("/-/agents", get(list_agents))
        .route("/-/agent", get(get_agent))
        .fallback(forward)
        .with_state(state)
}

/// Run the broker until shutdown. A bind failure is fatal.
pub async fn serve(state: Arc<AppState>) -> Result<(), ServerError> {
    let addr = format!("{}:{}", state.config.bind_addr, state.config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|source| ServerError::Bind {
            addr: addr.clone(),
            source,
        })?;

    info!(addr = %addr, suffix = %state.config.domain_suffix, "broker listening");

    let app = router(state).into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(ServerError::Serve)
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutting down");
}

fn hello_from_request(req: &Request) -> TunnelHello {
    let credential = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(Credential::from_basic);

    // Proxy headers win over the peer address, which under a fronting
    // proxy would only name that proxy.
    let remote_addr = ["x-real-ip", "x-forwarded-for"]
        .iter()
        .find_map(|name| req.headers().get(*name).and_then(|value| value.to_str().ok()))
        .map(str::to_string)
        .or_else(|| {
            req.extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|info| info.0.to_string())
        });

    TunnelHello {
        credential,
        remote_addr,
    }
}

/// Agent tunnel endpoint.
///
/// Serves the session until the agent goes away, then runs disconnect
/// cleanup keyed by whatever credential this request presented. The hook
/// is idempotent and also runs when authorization failed.
async fn tunnel(State(state): State<Arc<AppState>>, req: Request) -> Response {
    let hello = hello_from_request(&req);
    let presented_id = hello.credential.as_ref().map(|c| c.id.clone());

    let served = state.transport.serve_tunnel(hello).await;

    if let Some(id) = presented_id.as_deref().filter(|id| !id.is_empty()) {
        state.authenticator.disconnect(id);
    }

    match served {
        Ok(agent_id) => {
            info!(agent_id = %agent_id, "tunnel session ended");
            StatusCode::OK.into_response()
        }
        Err(TransportError::Unauthorized) => {
            error_response(StatusCode::UNAUTHORIZED, "not authorized")
        }
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

/// List currently connected agents.
async fn list_agents(State(state): State<Arc<AppState>>) -> Json<Vec<Agent>> {
    Json(state.registry.list())
}

#[derive(Debug, Deserialize)]
struct AgentQuery {
    #[serde(default)]
    id: Option<String>,
}

/// Fetch one agent record by id.
async fn get_agent(State(state): State<Arc<AppState>>, Query(query): Query<AgentQuery>) -> Response {
    let Some(id) = query.id.filter(|id| !id.is_empty()) else {
        return error_response(StatusCode::BAD_REQUEST, "missing \"id\" query param");
    };

    match state.registry.get(&id) {
        Some(agent) => Json(agent).into_response(),
        None => error_response(StatusCode::BAD_REQUEST, "agent not online"),
    }
}

/// Catch-all: derive the agent id from the Host header and relay the
/// exchange through that agent's tunnel. Upstream status and body are
/// copied through; failures surface once as 500 with the reason.
async fn forward(State(state): State<Arc<AppState>>, req: Request) -> Response {
    let host = req
        .uri()
        .host()
        .map(str::to_string)
        .or_else(|| {
            req.headers()
                .get(header::HOST)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
        })
        .unwrap_or_default();
    let agent_id = resolve_agent_id(&host, &state.config.domain_suffix);

    match state.proxy.forward(&agent_id, req).await {
        Ok(upstream) => {
            let status = upstream.status();
            (status, upstream.into_body()).into_response()
        }
        Err(err) => {
            warn!(agent_id = %agent_id, error = %err, "proxy exchange failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}
