//! HTTP-to-tunnel forwarding
//!
//! One pooled hyper client per agent id, whose connector dials through
//! that agent's tunnel to the fixed upstream resource. Clients are cached
//! and never proactively evicted: a stale client simply fails its next
//! dial, and works again once the agent reconnects because the tunnel is
//! resolved at dial time.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::Body;
use bytes::Bytes;
use dashmap::DashMap;
use dockway_transport::{DialTarget, TransportError, TunnelStream, TunnelTransport};
use http::uri::Uri;
use http::{header, Request, Response};
use http_body::{Body as HttpBody, Frame, SizeHint};
use hyper::body::Incoming;
use hyper_util::client::legacy::connect::{Connected, Connection};
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use thiserror::Error;
use tokio::time::{sleep_until, Instant, Sleep};
use tracing::debug;

/// Authority planted in rewritten upstream URIs. The connector never
/// resolves it; the agent-side resource sees it as the Host header.
const UPSTREAM_AUTHORITY: &str = "docker";

/// Bound on establishing one tunnel stream, independent of the overall
/// request timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("{0}")]
    Dial(#[from] TransportError),

    #[error("request to agent {agent_id} timed out after {timeout:?}")]
    Timeout {
        agent_id: String,
        timeout: Duration,
    },

    #[error("upstream exchange failed: {0}")]
    Upstream(String),

    #[error("malformed proxied request: {0}")]
    BadRequest(#[from] http::Error),
}

/// Per-agent cache of pooled HTTP clients bound to tunnel dialing.
pub struct ProxyClients {
    transport: Arc<dyn TunnelTransport>,
    target: DialTarget,
    request_timeout: Duration,
    clients: DashMap<String, Client<TunnelConnector, Body>>,
}

impl ProxyClients {
    pub fn new(
        transport: Arc<dyn TunnelTransport>,
        target: DialTarget,
        request_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            target,
            request_timeout,
            clients: DashMap::new(),
        }
    }

    /// Number of cached per-agent clients.
    pub fn cached(&self) -> usize {
        self.clients.len()
    }

    fn client_for(&self, agent_id: &str) -> Client<TunnelConnector, Body> {
        self.clients
            .entry(agent_id.to_string())
            .or_insert_with(|| {
                debug!(agent_id = %agent_id, target = %self.target, "creating tunnel-bound client");
                Client::builder(TokioExecutor::new()).build(TunnelConnector {
                    transport: Arc::clone(&self.transport),
                    agent_id: agent_id.to_string(),
                    target: self.target.clone(),
                })
            })
            .clone()
    }

    /// Replay `req` over the agent's tunnel and return the upstream
    /// response.
    ///
    /// Method, path, query, headers and body are preserved; only the
    /// request target is rewritten to the fixed upstream authority. The
    /// whole exchange shares one deadline derived from the configured
    /// request timeout, response body streaming included, and is never
    /// retried.
    pub async fn forward(
        &self,
        agent_id: &str,
        req: Request<Body>,
    ) -> Result<Response<Body>, ProxyError> {
        let client = self.client_for(agent_id);

        let (parts, body) = req.into_parts();
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let uri: Uri = format!("http://{UPSTREAM_AUTHORITY}{path_and_query}")
            .parse()
            .map_err(http::Error::from)?;

        let mut outbound = Request::builder()
            .method(parts.method)
            .uri(uri)
            .body(body)?;
        *outbound.headers_mut() = parts.headers;
        // The resource behind the agent keys on the rewritten authority,
        // not on the public host the client addressed.
        outbound.headers_mut().remove(header::HOST);

        let deadline = Instant::now() + self.request_timeout;
        match tokio::time::timeout_at(deadline, client.request(outbound)).await {
            Ok(Ok(response)) => {
                let (parts, body) = response.into_parts();
                let body = Body::new(DeadlineBody {
                    inner: Box::pin(body),
                    deadline: Box::pin(sleep_until(deadline)),
                    agent_id: agent_id.to_string(),
                    timeout: self.request_timeout,
                });
                Ok(Response::from_parts(parts, body))
            }
            Ok(Err(err)) => Err(ProxyError::Upstream(error_chain(&err))),
            Err(_) => Err(ProxyError::Timeout {
                agent_id: agent_id.to_string(),
                timeout: self.request_timeout,
            }),
        }
    }
}

/// Upstream body tied to the request deadline.
///
/// The deadline keeps running while the body streams, so a stalled
/// upstream terminates the response with a timeout error instead of
/// holding the client open indefinitely.
struct DeadlineBody {
    inner: Pin<Box<Incoming>>,
    deadline: Pin<Box<Sleep>>,
    agent_id: String,
    timeout: Duration,
}

impl HttpBody for DeadlineBody {
    type Data = Bytes;
    type Error = ProxyError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        if this.deadline.as_mut().poll(cx).is_ready() {
            return Poll::Ready(Some(Err(ProxyError::Timeout {
                agent_id: this.agent_id.clone(),
                timeout: this.timeout,
            })));
        }
        this.inner.as_mut().poll_frame(cx).map(|frame| {
            frame.map(|result| result.map_err(|err| ProxyError::Upstream(error_chain(&err))))
        })
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

/// Flatten an error and its sources into one message, so the surfaced
/// reason names the actual failure (agent offline, refused socket, ...)
/// rather than a generic client wrapper.
fn error_chain(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(err) = source {
        message.push_str(": ");
        message.push_str(&err.to_string());
        source = err.source();
    }
    message
}

type BoxedConnectFuture =
    Pin<Box<dyn Future<Output = Result<TunnelConnection, TransportError>> + Send>>;

/// Connector that ignores the request URI and dials through one agent's
/// tunnel to the fixed target.
#[derive(Clone)]
struct TunnelConnector {
    transport: Arc<dyn TunnelTransport>,
    agent_id: String,
    target: DialTarget,
}

impl tower::Service<Uri> for TunnelConnector {
    type Response = TunnelConnection;
    type Error = TransportError;
    type Future = BoxedConnectFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _dst: Uri) -> Self::Future {
        let connector = self.clone();
        Box::pin(async move {
            debug!(agent_id = %connector.agent_id, "dialing through tunnel");
            let stream = connector
                .transport
                .dial(&connector.agent_id, CONNECT_TIMEOUT, connector.target.clone())
                .await?;
            Ok(TunnelConnection {
                io: TokioIo::new(stream),
            })
        })
    }
}

/// Hyper-facing wrapper so tunnel streams satisfy the pooled client's
/// connection contract.
struct TunnelConnection {
    io: TokioIo<TunnelStream>,
}

impl Connection for TunnelConnection {
    fn connected(&self) -> Connected {
        Connected::new()
    }
}

impl hyper::rt::Read for TunnelConnection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: hyper::rt::ReadBufCursor<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_read(cx, buf)
    }
}

impl hyper::rt::Write for TunnelConnection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.get_mut().io).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_shutdown(cx)
    }
}
