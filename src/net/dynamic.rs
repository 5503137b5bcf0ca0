//! The dynamic proxy: accepts raw TCP connections and routes each one
//! through the most appropriate proxy flavor.
//!
//! Every accepted connection is wrapped peekable and classified. HTTP
//! connections go to the L7 proxy; connections opening with a TLS
//! ClientHello go to the L4 passthrough proxy; anything else is closed.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::net::l7::HttpClients;
use crate::net::peek::PeekableStream;
use crate::net::{detect, l4, l7};
use crate::{Error, Result};

/// Resolves where a classified connection should be proxied.
///
/// The activator's implementation wakes the target workload and blocks until
/// a replica is ready, so a single `route_*` call may take up to the
/// activation timeout.
#[async_trait]
pub trait ProxyRouter: Send + Sync + 'static {
    /// Resolve the backend for an HTTP request addressed to `host` (the Host
    /// header or `:authority`, port suffix and all).
    async fn route_http(&self, host: &str) -> Result<(String, u16)>;

    /// Resolve the backend for a TLS connection with the given SNI name.
    async fn route_tls(&self, server_name: &str) -> Result<(String, u16)>;

    /// Called after an HTTP request has been proxied (or failed).
    async fn http_done(&self, _host: &str) {}

    /// Called after a TLS connection has been spliced (or failed).
    async fn tls_done(&self, _server_name: &str) {}
}

/// Accept loop dispatching connections to the L7 or L4 proxy.
pub struct DynamicProxy {
    listener: TcpListener,
    router: Arc<dyn ProxyRouter>,
    clients: HttpClients,
}

impl DynamicProxy {
    /// Bind the proxy listener. Failure to bind is fatal to the caller.
    pub async fn bind(addr: SocketAddr, router: Arc<dyn ProxyRouter>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            router,
            clients: HttpClients::new(),
        })
    }

    /// The bound listen address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept and serve connections until the token is cancelled.
    ///
    /// Each connection gets its own task; a failing connection never stops
    /// the loop.
    pub async fn serve(self, shutdown: CancellationToken) -> Result<()> {
        info!(
            addr = %self.listener.local_addr()?,
            "Proxy is listening, serving all deactivated applications"
        );
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Proxy is shutting down");
                    return Ok(());
                }
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            error!(error = %e, "Error accepting connection");
                            continue;
                        }
                    };
                    let router = self.router.clone();
                    let clients = self.clients.clone();
                    tokio::spawn(async move {
                        if let Err(e) = serve_connection(stream, router, clients).await {
                            warn!(peer = %peer, error = %e, "Error serving connection");
                        }
                    });
                }
            }
        }
    }
}

/// Classify one connection and hand it to the right proxy flavor. The
/// connection is closed when this returns.
async fn serve_connection(
    stream: TcpStream,
    router: Arc<dyn ProxyRouter>,
    clients: HttpClients,
) -> Result<()> {
    let mut conn = PeekableStream::new(stream);
    if let Some(version) = detect::http_version(&mut conn).await {
        return l7::proxy_single_connection(conn, version, router, clients).await;
    }
    match detect::tls_server_name(&mut conn).await {
        Some(server_name) => l4::proxy_connection(conn, &server_name, router).await,
        None => Err(Error::UnrecognizedProtocol),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    struct FixedRouter {
        target: (String, u16),
    }

    #[async_trait]
    impl ProxyRouter for FixedRouter {
        async fn route_http(&self, _host: &str) -> Result<(String, u16)> {
            Ok(self.target.clone())
        }

        async fn route_tls(&self, _server_name: &str) -> Result<(String, u16)> {
            Ok(self.target.clone())
        }
    }

    fn ensure_crypto_provider() {
        static INSTALLED: std::sync::Once = std::sync::Once::new();
        INSTALLED.call_once(|| {
            let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
        });
    }

    async fn spawn_tcp_backend(response: &'static [u8]) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let _ = stream.read(&mut buf).await;
                    let _ = stream.write_all(response).await;
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn unrecognized_connections_are_closed() {
        let backend = spawn_tcp_backend(b"should never be reached").await;
        let router = Arc::new(FixedRouter {
            target: (backend.ip().to_string(), backend.port()),
        });
        let proxy = DynamicProxy::bind("127.0.0.1:0".parse().unwrap(), router)
            .await
            .unwrap();
        let addr = proxy.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        tokio::spawn(proxy.serve(shutdown.clone()));

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"\x00\x01\x02 nonsense").await.unwrap();
        client.shutdown().await.unwrap();
        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        assert!(out.is_empty(), "proxy should close without a response");

        shutdown.cancel();
    }

    #[tokio::test]
    async fn tls_connections_are_spliced_with_the_client_hello_intact() {
        // Backend that records everything it receives and echoes a banner.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = listener.local_addr().unwrap();
        let (seen_tx, seen_rx) = tokio::sync::oneshot::channel::<Vec<u8>>();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut seen = Vec::new();
            let mut buf = [0u8; 4096];
            // The client half-closes after the hello, so read to EOF first.
            loop {
                match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => seen.extend_from_slice(&buf[..n]),
                }
            }
            let _ = stream.write_all(b"backend says hello").await;
            let _ = seen_tx.send(seen);
        });

        let router = Arc::new(FixedRouter {
            target: (backend_addr.ip().to_string(), backend_addr.port()),
        });
        let proxy = DynamicProxy::bind("127.0.0.1:0".parse().unwrap(), router)
            .await
            .unwrap();
        let addr = proxy.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        tokio::spawn(proxy.serve(shutdown.clone()));

        // A genuine ClientHello, produced by a TLS client.
        ensure_crypto_provider();
        let config = rustls::ClientConfig::builder()
            .with_root_certificates(rustls::RootCertStore::empty())
            .with_no_client_auth();
        let server_name = rustls::pki_types::ServerName::try_from("foo.bar").unwrap();
        let mut tls_client =
            rustls::ClientConnection::new(Arc::new(config), server_name).unwrap();
        let mut hello = Vec::new();
        tls_client.write_tls(&mut hello).unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&hello).await.unwrap();
        client.shutdown().await.unwrap();
        let mut banner = Vec::new();
        client.read_to_end(&mut banner).await.unwrap();
        assert_eq!(banner, b"backend says hello");

        // The backend saw the original bytes, un-replayed and unmodified.
        let seen = seen_rx.await.unwrap();
        assert_eq!(seen, hello);

        shutdown.cancel();
    }

    #[tokio::test]
    async fn http_connections_are_proxied_end_to_end() {
        let backend =
            spawn_tcp_backend(b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nok").await;
        let router = Arc::new(FixedRouter {
            target: (backend.ip().to_string(), backend.port()),
        });
        let proxy = DynamicProxy::bind("127.0.0.1:0".parse().unwrap(), router)
            .await
            .unwrap();
        let addr = proxy.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        tokio::spawn(proxy.serve(shutdown.clone()));

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"GET / HTTP/1.1\r\nhost: foo.bar\r\n\r\n")
            .await
            .unwrap();
        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        let text = String::from_utf8_lossy(&out);
        assert!(text.starts_with("HTTP/1.1 200"), "got: {text}");
        assert!(text.ends_with("ok"), "got: {text}");

        shutdown.cancel();
    }
}
