//! L7 reverse proxy for a single classified connection.
//!
//! HTTP/1.x connections are served for exactly one request and then
//! released; h2c connections are served for the life of the HTTP/2 session.
//! Each request is forwarded to the backend chosen by the router, with the
//! original body streamed through un-replayed.

use std::convert::Infallible;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty};
use hyper::body::Incoming;
use hyper::header::{
    HeaderMap, HeaderName, CONNECTION, HOST, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION, TE, TRAILER,
    TRANSFER_ENCODING, UPGRADE,
};
use hyper::server::conn::{http1, http2};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode, Uri, Version};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, error};

use crate::net::detect::HttpVersion;
use crate::net::dynamic::ProxyRouter;
use crate::net::peek::PeekableStream;
use crate::{Error, Result};

type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Shared outbound connection pools: a plain HTTP/1.1 pool and an h2c pool
/// (HTTP/2 over cleartext TCP).
#[derive(Clone)]
pub struct HttpClients {
    http1: Client<HttpConnector, Incoming>,
    h2c: Client<HttpConnector, Incoming>,
}

impl HttpClients {
    /// Build the two outbound pools.
    pub fn new() -> Self {
        Self {
            http1: Client::builder(TokioExecutor::new()).build_http(),
            h2c: Client::builder(TokioExecutor::new())
                .http2_only(true)
                .build_http(),
        }
    }
}

impl Default for HttpClients {
    fn default() -> Self {
        Self::new()
    }
}

/// Serve one classified connection as a reverse proxy.
///
/// HTTP/1.x: exactly one request is handled before the connection is
/// released (keep-alive is disabled, so the server closes after the
/// exchange). h2c: the connection is served until the session ends.
/// Ordinary teardown (EOF mid-connection) is not reported as an error.
pub async fn proxy_single_connection<S>(
    stream: PeekableStream<S>,
    version: HttpVersion,
    router: Arc<dyn ProxyRouter>,
    clients: HttpClients,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    match version {
        HttpVersion::Http10 | HttpVersion::Http11 => {
            let client = clients.http1;
            let service = service_fn(move |req: Request<Incoming>| {
                let router = router.clone();
                let client = client.clone();
                async move { Ok::<_, Infallible>(handle_request(req, router, client, false).await) }
            });
            suppress_teardown(
                http1::Builder::new()
                    .keep_alive(false)
                    .serve_connection(io, service)
                    .await,
            )
        }
        HttpVersion::H2c => {
            let client = clients.h2c;
            let service = service_fn(move |req: Request<Incoming>| {
                let router = router.clone();
                let client = client.clone();
                async move { Ok::<_, Infallible>(handle_request(req, router, client, true).await) }
            });
            suppress_teardown(
                http2::Builder::new(TokioExecutor::new())
                    .serve_connection(io, service)
                    .await,
            )
        }
    }
}

async fn handle_request(
    req: Request<Incoming>,
    router: Arc<dyn ProxyRouter>,
    client: Client<HttpConnector, Incoming>,
    h2c: bool,
) -> Response<ProxyBody> {
    let Some(host) = request_host(&req) else {
        debug!("Request carries no host; refusing");
        return status_response(StatusCode::BAD_REQUEST);
    };
    let (target_host, target_port) = match router.route_http(&host).await {
        Ok(target) => target,
        Err(e) => return routing_error_response(&host, &e),
    };
    let response = match forward(req, &target_host, target_port, &client, h2c).await {
        Ok(response) => response.map(BodyExt::boxed),
        Err(e) => {
            error!(
                host = %host,
                backend = %format_args!("{target_host}:{target_port}"),
                error = %e,
                "Error proxying request"
            );
            status_response(StatusCode::BAD_GATEWAY)
        }
    };
    router.http_done(&host).await;
    response
}

async fn forward(
    req: Request<Incoming>,
    target_host: &str,
    target_port: u16,
    client: &Client<HttpConnector, Incoming>,
    h2c: bool,
) -> Result<Response<Incoming>> {
    let (mut parts, body) = req.into_parts();
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_owned())
        .unwrap_or_else(|| "/".to_owned());
    parts.uri = Uri::builder()
        .scheme("http")
        .authority(format!("{target_host}:{target_port}"))
        .path_and_query(path_and_query)
        .build()
        .map_err(|e| Error::proxy(format!("error building target url: {e}")))?;
    strip_hop_headers(&mut parts.headers);
    if h2c {
        // HTTP/2 carries the target in :authority.
        parts.headers.remove(HOST);
        parts.version = Version::HTTP_2;
    } else {
        parts.version = Version::HTTP_11;
    }
    let mut response = client
        .request(Request::from_parts(parts, body))
        .await
        .map_err(|e| Error::proxy(format!("error forwarding request: {e}")))?;
    strip_hop_headers(response.headers_mut());
    Ok(response)
}

/// The host a request is addressed to: `:authority` for HTTP/2, the Host
/// header for HTTP/1.x. Ports are kept verbatim; the host index carries
/// both bare and `host:port` keys.
fn request_host<B>(req: &Request<B>) -> Option<String> {
    if let Some(authority) = req.uri().authority() {
        return Some(authority.as_str().to_owned());
    }
    req.headers()
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned)
}

fn strip_hop_headers(headers: &mut HeaderMap) {
    const HOP_HEADERS: [HeaderName; 7] = [
        CONNECTION,
        PROXY_AUTHENTICATE,
        PROXY_AUTHORIZATION,
        TE,
        TRAILER,
        TRANSFER_ENCODING,
        UPGRADE,
    ];
    for header in HOP_HEADERS {
        headers.remove(&header);
    }
    headers.remove(HeaderName::from_static("keep-alive"));
    headers.remove(HeaderName::from_static("proxy-connection"));
}

fn routing_error_response(host: &str, err: &Error) -> Response<ProxyBody> {
    let status = match err {
        Error::UnknownHost(_) => StatusCode::NOT_FOUND,
        Error::ActivationTimeout { .. } => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::BAD_GATEWAY,
    };
    error!(host = %host, error = %err, "Error resolving backend for request");
    status_response(status)
}

fn status_response(status: StatusCode) -> Response<ProxyBody> {
    let mut response = Response::new(empty_body());
    *response.status_mut() = status;
    response
}

fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

fn suppress_teardown(result: hyper::Result<()>) -> Result<()> {
    match result {
        Ok(()) => Ok(()),
        // EOF at connection teardown is the normal end of a proxied exchange.
        Err(e) if e.is_incomplete_message() || e.is_canceled() => {
            debug!(error = %e, "Connection torn down mid-exchange");
            Ok(())
        }
        Err(e) => Err(Error::proxy(format!("error serving connection: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use http_body_util::Full;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

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

    struct RejectingRouter;

    #[async_trait]
    impl ProxyRouter for RejectingRouter {
        async fn route_http(&self, host: &str) -> Result<(String, u16)> {
            Err(Error::UnknownHost(host.to_owned()))
        }

        async fn route_tls(&self, server_name: &str) -> Result<(String, u16)> {
            Err(Error::UnknownHost(server_name.to_owned()))
        }
    }

    #[test]
    fn request_host_prefers_the_authority() {
        let req = Request::builder()
            .uri("http://foo.bar:8080/x")
            .header(HOST, "other")
            .body(())
            .unwrap();
        assert_eq!(request_host(&req).as_deref(), Some("foo.bar:8080"));

        let req = Request::builder()
            .uri("/x")
            .header(HOST, "foo.bar")
            .body(())
            .unwrap();
        assert_eq!(request_host(&req).as_deref(), Some("foo.bar"));

        let req = Request::builder().uri("/x").body(()).unwrap();
        assert_eq!(request_host(&req), None);
    }

    #[test]
    fn hop_headers_are_stripped() {
        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, "keep-alive".parse().unwrap());
        headers.insert(TRANSFER_ENCODING, "chunked".parse().unwrap());
        headers.insert("keep-alive", "timeout=5".parse().unwrap());
        headers.insert("x-request-id", "abc".parse().unwrap());
        strip_hop_headers(&mut headers);
        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key("x-request-id"));
    }

    #[test]
    fn routing_errors_map_to_statuses() {
        let resp = routing_error_response("h", &Error::UnknownHost("h".into()));
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = routing_error_response(
            "h",
            &Error::ActivationTimeout {
                kind: "deployment",
                namespace: "ns".into(),
                name: "app".into(),
            },
        );
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

        let resp = routing_error_response("h", &Error::proxy("boom"));
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn http1_serves_exactly_one_request() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                tokio::spawn(async move {
                    let service = service_fn(|req: Request<Incoming>| async move {
                        let body = format!("path={}", req.uri().path());
                        Ok::<_, Infallible>(Response::new(Full::new(Bytes::from(body))))
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        let (mut client_io, server_io) = tokio::io::duplex(16 * 1024);
        let router = Arc::new(FixedRouter {
            target: (addr.ip().to_string(), addr.port()),
        });
        let proxy = tokio::spawn(proxy_single_connection(
            PeekableStream::new(server_io),
            HttpVersion::Http11,
            router,
            HttpClients::new(),
        ));

        client_io
            .write_all(b"GET /widgets HTTP/1.1\r\nhost: foo.bar\r\n\r\n")
            .await
            .unwrap();
        let mut out = Vec::new();
        client_io.read_to_end(&mut out).await.unwrap();
        let text = String::from_utf8_lossy(&out);
        assert!(text.starts_with("HTTP/1.1 200"), "got: {text}");
        assert!(text.contains("path=/widgets"), "got: {text}");

        // keep-alive is off, so the proxy released the connection.
        proxy.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn request_bodies_stream_through_to_the_backend() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                tokio::spawn(async move {
                    let service = service_fn(|req: Request<Incoming>| async move {
                        let body = req.into_body().collect().await?.to_bytes();
                        let reply = format!("got {} bytes: {}", body.len(), String::from_utf8_lossy(&body));
                        Ok::<_, hyper::Error>(Response::new(Full::new(Bytes::from(reply))))
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        let (mut client_io, server_io) = tokio::io::duplex(16 * 1024);
        let router = Arc::new(FixedRouter {
            target: (addr.ip().to_string(), addr.port()),
        });
        tokio::spawn(proxy_single_connection(
            PeekableStream::new(server_io),
            HttpVersion::Http11,
            router,
            HttpClients::new(),
        ));

        client_io
            .write_all(
                b"POST /ingest HTTP/1.1\r\nhost: foo.bar\r\ncontent-length: 11\r\n\r\nhello world",
            )
            .await
            .unwrap();
        let mut out = Vec::new();
        client_io.read_to_end(&mut out).await.unwrap();
        let text = String::from_utf8_lossy(&out);
        assert!(text.contains("got 11 bytes: hello world"), "got: {text}");
    }

    #[tokio::test]
    async fn http1_unknown_host_gets_not_found() {
        let (mut client_io, server_io) = tokio::io::duplex(16 * 1024);
        let proxy = tokio::spawn(proxy_single_connection(
            PeekableStream::new(server_io),
            HttpVersion::Http11,
            Arc::new(RejectingRouter),
            HttpClients::new(),
        ));

        client_io
            .write_all(b"GET / HTTP/1.1\r\nhost: nobody.home\r\n\r\n")
            .await
            .unwrap();
        let mut out = Vec::new();
        client_io.read_to_end(&mut out).await.unwrap();
        assert!(
            String::from_utf8_lossy(&out).starts_with("HTTP/1.1 404"),
            "got: {}",
            String::from_utf8_lossy(&out)
        );
        proxy.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn h2c_requests_are_proxied() {
        // h2c backend echoing the request path.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                tokio::spawn(async move {
                    let service = service_fn(|req: Request<Incoming>| async move {
                        let body = format!("echo {}", req.uri().path());
                        Ok::<_, Infallible>(Response::new(Full::new(Bytes::from(body))))
                    });
                    let _ = http2::Builder::new(TokioExecutor::new())
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let router = Arc::new(FixedRouter {
            target: (addr.ip().to_string(), addr.port()),
        });
        tokio::spawn(proxy_single_connection(
            PeekableStream::new(server_io),
            HttpVersion::H2c,
            router,
            HttpClients::new(),
        ));

        let (mut sender, conn) =
            hyper::client::conn::http2::handshake(TokioExecutor::new(), TokioIo::new(client_io))
                .await
                .unwrap();
        tokio::spawn(conn);

        let req = Request::builder()
            .uri("http://foo.bar/hello")
            .body(Empty::<Bytes>::new())
            .unwrap();
        let resp = sender.send_request(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"echo /hello");
    }
}
