//! In-process tunnel transport
//!
//! Sessions live in the broker's address space: an agent "connects" by
//! staging a resource factory under its id and letting the broker serve
//! the session. Dials invoke the staged factory. Closing a session also
//! tears down every stream dialed through it, so pooled upstream
//! connections fail fast instead of outliving their agent.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tracing::{debug, info};

use crate::{
    AuthOutcome, Authorizer, DialTarget, TransportError, TunnelHello, TunnelStream,
    TunnelTransport,
};

/// Produces a fresh stream to the agent-side resource for every dial.
pub type ResourceFactory = Arc<
    dyn Fn(DialTarget) -> Pin<Box<dyn Future<Output = io::Result<TunnelStream>> + Send>>
        + Send
        + Sync,
>;

struct Session {
    serial: u64,
    factory: ResourceFactory,
    closed: CancellationToken,
}

/// In-process [`TunnelTransport`].
pub struct MemoryTransport {
    authorizer: Arc<dyn Authorizer>,
    sessions: DashMap<String, Session>,
    offers: DashMap<String, ResourceFactory>,
    next_serial: AtomicU64,
}

impl MemoryTransport {
    pub fn new(authorizer: Arc<dyn Authorizer>) -> Self {
        Self {
            authorizer,
            sessions: DashMap::new(),
            offers: DashMap::new(),
            next_serial: AtomicU64::new(0),
        }
    }

    /// Stage the resource an agent will expose once its session is accepted.
    ///
    /// Must happen before the matching [`TunnelTransport::serve_tunnel`]
    /// call; a session served without an offer refuses every dial.
    pub fn offer(&self, agent_id: &str, factory: ResourceFactory) {
        self.offers.insert(agent_id.to_string(), factory);
    }

    /// Tear down the live session for `agent_id`, if any.
    pub fn close_tunnel(&self, agent_id: &str) -> bool {
        match self.sessions.get(agent_id) {
            Some(session) => {
                session.closed.cancel();
                true
            }
            None => false,
        }
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

fn refused(agent_id: &str) -> ResourceFactory {
    let agent_id = agent_id.to_string();
    Arc::new(move |_target| {
        let agent_id = agent_id.clone();
        Box::pin(async move {
            Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("agent {agent_id} offered no resource"),
            ))
        })
    })
}

/// Factory that connects to the dial target on the local machine.
///
/// Lets one process host both the broker and an agent fronting a local
/// resource, the common one-box Docker setup.
pub fn local_resource() -> ResourceFactory {
    Arc::new(|target| {
        Box::pin(async move {
            match target {
                #[cfg(unix)]
                DialTarget::Unix(path) => {
                    let stream = tokio::net::UnixStream::connect(&path).await?;
                    Ok(Box::new(stream) as TunnelStream)
                }
                #[cfg(not(unix))]
                DialTarget::Unix(path) => Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    format!("unix socket {path} is unsupported on this platform"),
                )),
                DialTarget::Tcp(addr) => {
                    let stream = tokio::net::TcpStream::connect(&addr).await?;
                    Ok(Box::new(stream) as TunnelStream)
                }
            }
        })
    })
}

#[async_trait]
impl TunnelTransport for MemoryTransport {
    async fn serve_tunnel(&self, hello: TunnelHello) -> Result<String, TransportError> {
        let agent_id = match self.authorizer.authorize(&hello) {
            AuthOutcome::Granted { agent_id } => agent_id,
            AuthOutcome::Anonymous => {
                debug!("rejected anonymous tunnel attempt");
                return Err(TransportError::Unauthorized);
            }
            AuthOutcome::Denied { agent_id } => {
                info!(agent_id = %agent_id, "rejected tunnel attempt with invalid proof");
                return Err(TransportError::Unauthorized);
            }
        };

        let factory = self
            .offers
            .remove(&agent_id)
            .map(|(_, factory)| factory)
            .unwrap_or_else(|| refused(&agent_id));

        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        let closed = CancellationToken::new();
        let session = Session {
            serial,
            factory,
            closed: closed.clone(),
        };

        if let Some(old) = self.sessions.insert(agent_id.clone(), session) {
            debug!(agent_id = %agent_id, "replacing existing tunnel session");
            old.closed.cancel();
        }

        closed.cancelled().await;

        // Only the session that still owns the map entry removes it; a
        // replaced session must not evict its successor.
        self.sessions
            .remove_if(&agent_id, |_, session| session.serial == serial);

        Ok(agent_id)
    }

    async fn dial(
        &self,
        agent_id: &str,
        timeout: Duration,
        target: DialTarget,
    ) -> Result<TunnelStream, TransportError> {
        let (factory, closed) = match self.sessions.get(agent_id) {
            Some(session) => (session.factory.clone(), session.closed.clone()),
            None => return Err(TransportError::AgentNotConnected(agent_id.to_string())),
        };

        let stream = match tokio::time::timeout(timeout, factory(target)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => return Err(TransportError::Io(err)),
            Err(_) => {
                return Err(TransportError::DialTimeout {
                    agent_id: agent_id.to_string(),
                    timeout,
                })
            }
        };

        Ok(Box::new(SessionStream::new(stream, closed)))
    }
}

/// Stream tied to its owning session: once the session closes, further IO
/// fails with `BrokenPipe`, and blocked reads are woken.
struct SessionStream {
    inner: TunnelStream,
    closed: Pin<Box<WaitForCancellationFutureOwned>>,
    done: bool,
}

impl SessionStream {
    fn new(inner: TunnelStream, token: CancellationToken) -> Self {
        Self {
            inner,
            closed: Box::pin(token.cancelled_owned()),
            done: false,
        }
    }

    fn session_closed(&mut self, cx: &mut Context<'_>) -> bool {
        if !self.done && self.closed.as_mut().poll(cx).is_ready() {
            self.done = true;
        }
        self.done
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "tunnel session closed")
}

impl AsyncRead for SessionStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.session_closed(cx) {
            return Poll::Ready(Err(closed_error()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for SessionStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.session_closed(cx) {
            return Poll::Ready(Err(closed_error()));
        }
        Pin::new(&mut this.inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.session_closed(cx) {
            return Poll::Ready(Err(closed_error()));
        }
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dockway_auth::Credential;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Grants any presented credential; tests drive denial through the
    /// absence of a credential.
    struct AllowPresented;

    impl Authorizer for AllowPresented {
        fn authorize(&self, hello: &TunnelHello) -> AuthOutcome {
            match &hello.credential {
                Some(credential) => AuthOutcome::Granted {
                    agent_id: credential.id.clone(),
                },
                None => AuthOutcome::Anonymous,
            }
        }

        fn disconnect(&self, _agent_id: &str) {}
    }

    fn transport() -> Arc<MemoryTransport> {
        Arc::new(MemoryTransport::new(Arc::new(AllowPresented)))
    }

    fn hello(agent_id: &str) -> TunnelHello {
        TunnelHello {
            credential: Some(Credential::new(agent_id, "proof")),
            remote_addr: None,
        }
    }

    fn echo_resource() -> ResourceFactory {
        Arc::new(|_target| {
            Box::pin(async {
                let (near, far) = tokio::io::duplex(1024);
                tokio::spawn(async move {
                    let (mut reader, mut writer) = tokio::io::split(far);
                    let _ = tokio::io::copy(&mut reader, &mut writer).await;
                });
                Ok(Box::new(near) as TunnelStream)
            })
        })
    }

    async fn wait_for_session(transport: &MemoryTransport, count: usize) {
        for _ in 0..200 {
            if transport.session_count() == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("session count never reached {count}");
    }

    #[tokio::test]
    async fn test_anonymous_hello_is_rejected() {
        let transport = transport();
        let result = transport.serve_tunnel(TunnelHello::default()).await;
        assert!(matches!(result, Err(TransportError::Unauthorized)));
        assert_eq!(transport.session_count(), 0);
    }

    #[tokio::test]
    async fn test_dial_unknown_agent_fails_immediately() {
        let transport = transport();
        let result = transport
            .dial("ghost", Duration::from_secs(1), DialTarget::Tcp("x".into()))
            .await;
        assert!(matches!(result, Err(TransportError::AgentNotConnected(id)) if id == "ghost"));
    }

    #[tokio::test]
    async fn test_dial_round_trip_through_session() {
        let transport = transport();
        transport.offer("agent1", echo_resource());

        let serving = {
            let transport = Arc::clone(&transport);
            tokio::spawn(async move { transport.serve_tunnel(hello("agent1")).await })
        };
        wait_for_session(&transport, 1).await;

        let mut stream = transport
            .dial(
                "agent1",
                Duration::from_secs(1),
                DialTarget::Unix("/var/run/docker.sock".into()),
            )
            .await
            .unwrap();

        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        assert!(transport.close_tunnel("agent1"));
        let served_as = serving.await.unwrap().unwrap();
        assert_eq!(served_as, "agent1");
        assert_eq!(transport.session_count(), 0);
    }

    #[tokio::test]
    async fn test_close_tunnel_poisons_open_streams() {
        let transport = transport();
        transport.offer("agent1", echo_resource());

        let serving = {
            let transport = Arc::clone(&transport);
            tokio::spawn(async move { transport.serve_tunnel(hello("agent1")).await })
        };
        wait_for_session(&transport, 1).await;

        let mut stream = transport
            .dial(
                "agent1",
                Duration::from_secs(1),
                DialTarget::Tcp("ignored".into()),
            )
            .await
            .unwrap();

        transport.close_tunnel("agent1");
        serving.await.unwrap().unwrap();

        let mut buf = [0u8; 1];
        let err = stream.read_exact(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn test_dial_without_offer_is_refused() {
        let transport = transport();

        let serving = {
            let transport = Arc::clone(&transport);
            tokio::spawn(async move { transport.serve_tunnel(hello("agent1")).await })
        };
        wait_for_session(&transport, 1).await;

        let result = transport
            .dial(
                "agent1",
                Duration::from_secs(1),
                DialTarget::Tcp("ignored".into()),
            )
            .await;
        assert!(
            matches!(result, Err(TransportError::Io(ref e)) if e.kind() == io::ErrorKind::ConnectionRefused)
        );

        transport.close_tunnel("agent1");
        serving.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_dial_timeout_is_bounded() {
        let transport = transport();
        let stuck: ResourceFactory = Arc::new(|_target| Box::pin(std::future::pending()));
        transport.offer("agent1", stuck);

        let serving = {
            let transport = Arc::clone(&transport);
            tokio::spawn(async move { transport.serve_tunnel(hello("agent1")).await })
        };
        wait_for_session(&transport, 1).await;

        let timeout = Duration::from_millis(50);
        let result = transport
            .dial("agent1", timeout, DialTarget::Tcp("ignored".into()))
            .await;
        assert!(matches!(result, Err(TransportError::DialTimeout { .. })));

        transport.close_tunnel("agent1");
        serving.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_reconnect_replaces_session() {
        let transport = transport();
        transport.offer("agent1", echo_resource());

        let first = {
            let transport = Arc::clone(&transport);
            tokio::spawn(async move { transport.serve_tunnel(hello("agent1")).await })
        };
        wait_for_session(&transport, 1).await;

        transport.offer("agent1", echo_resource());
        let second = {
            let transport = Arc::clone(&transport);
            tokio::spawn(async move { transport.serve_tunnel(hello("agent1")).await })
        };

        // The first session is displaced and returns; the second stays live.
        first.await.unwrap().unwrap();
        assert_eq!(transport.session_count(), 1);

        transport
            .dial(
                "agent1",
                Duration::from_secs(1),
                DialTarget::Tcp("ignored".into()),
            )
            .await
            .unwrap();

        transport.close_tunnel("agent1");
        second.await.unwrap().unwrap();
    }
}
