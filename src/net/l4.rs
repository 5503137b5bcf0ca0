//! L4 passthrough proxy for TLS connections.
//!
//! The activator never terminates TLS: once the SNI name has identified the
//! backend, the raw byte stream (ClientHello included, still unconsumed) is
//! spliced to it in both directions.

use std::io::ErrorKind;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

use crate::net::dynamic::ProxyRouter;
use crate::net::peek::PeekableStream;
use crate::{Error, Result};

/// Splice a classified TLS connection to the backend chosen by the router.
///
/// Waits for both directions to finish before returning, and always reports
/// completion to the router, even on error.
pub async fn proxy_connection<S>(
    mut stream: PeekableStream<S>,
    server_name: &str,
    router: Arc<dyn ProxyRouter>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let result = splice_to_backend(&mut stream, server_name, router.as_ref()).await;
    router.tls_done(server_name).await;
    result
}

async fn splice_to_backend<S>(
    stream: &mut PeekableStream<S>,
    server_name: &str,
    router: &dyn ProxyRouter,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (target_host, target_port) = router.route_tls(server_name).await?;
    let mut backend = TcpStream::connect((target_host.as_str(), target_port))
        .await
        .map_err(|e| {
            Error::proxy(format!(
                "error dialing target address {target_host}:{target_port}: {e}"
            ))
        })?;
    match tokio::io::copy_bidirectional(stream, &mut backend).await {
        Ok((to_backend, to_client)) => {
            debug!(
                server_name,
                to_backend, to_client, "Finished splicing connection"
            );
            Ok(())
        }
        // A reset just means the other end hung up already.
        Err(e) if e.kind() == ErrorKind::ConnectionReset => Ok(()),
        Err(e) => Err(e.into()),
    }
}
