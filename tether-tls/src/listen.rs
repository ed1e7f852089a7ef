//! TLS accept loop for gRPC listeners.
//!
//! Wraps accepted TLS streams in a [`TlsConnection`] implementing tonic's
//! `Connected` trait so the peer's leaf certificate reaches gRPC request
//! extensions, where the authentication interceptor consumes it.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use rustls::pki_types::CertificateDer;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tokio_stream::Stream;
use tokio_util::sync::CancellationToken;
use tonic::transport::server::Connected;

/// Connections that stall in the TLS handshake are dropped after this long.
const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection info surfaced to gRPC handlers via request extensions.
#[derive(Debug, Clone)]
pub struct TlsConnectInfo {
    pub remote_addr: Option<SocketAddr>,
    /// The peer's leaf certificate, when one was presented and verified
    /// during the handshake.
    pub peer_leaf: Option<CertificateDer<'static>>,
}

/// Wrapper around an accepted TLS stream that implements tonic's
/// `Connected` trait.
pub struct TlsConnection {
    inner: TlsStream<TcpStream>,
    remote_addr: Option<SocketAddr>,
    peer_leaf: Option<CertificateDer<'static>>,
}

impl TlsConnection {
    pub fn new(tls_stream: TlsStream<TcpStream>, remote_addr: Option<SocketAddr>) -> Self {
        let (_, session) = tls_stream.get_ref();
        let peer_leaf = session
            .peer_certificates()
            .and_then(|certs| certs.first().cloned())
            .map(|cert| cert.into_owned());

        Self {
            inner: tls_stream,
            remote_addr,
            peer_leaf,
        }
    }
}

impl Connected for TlsConnection {
    type ConnectInfo = TlsConnectInfo;

    fn connect_info(&self) -> Self::ConnectInfo {
        TlsConnectInfo {
            remote_addr: self.remote_addr,
            peer_leaf: self.peer_leaf.clone(),
        }
    }
}

impl AsyncRead for TlsConnection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for TlsConnection {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Accepts TCP connections, performs the TLS handshake with a timeout, and
/// yields [`TlsConnection`]s until `cancel` fires.
///
/// Handshake failures are logged and skipped; they are expected from peers
/// that are not yet enrolled or not allowlisted.
pub fn tls_incoming(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    cancel: CancellationToken,
) -> impl Stream<Item = Result<TlsConnection, io::Error>> {
    async_stream::stream! {
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((tcp_stream, peer_addr)) => {
                            let acceptor = acceptor.clone();
                            match tokio::time::timeout(
                                TLS_HANDSHAKE_TIMEOUT,
                                acceptor.accept(tcp_stream),
                            )
                            .await
                            {
                                Ok(Ok(tls_stream)) => {
                                    tracing::debug!(peer = %peer_addr, "TLS handshake complete");
                                    yield Ok(TlsConnection::new(tls_stream, Some(peer_addr)));
                                }
                                Ok(Err(e)) => {
                                    tracing::debug!(peer = %peer_addr, error = %e, "TLS handshake failed");
                                }
                                Err(_) => {
                                    tracing::warn!(peer = %peer_addr, "TLS handshake timed out");
                                }
                            }
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "TCP accept failed");
                        }
                    }
                }
                _ = cancel.cancelled() => {
                    tracing::info!("shutdown signal received, stopping accept loop");
                    break;
                }
            }
        }
    }
}
