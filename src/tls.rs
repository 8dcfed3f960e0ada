//! File-based TLS listener factory.
//!
//! Terminates TLS with a certificate chain and key loaded from PEM
//! files. Certificate acquisition and renewal live outside the core;
//! deployments with an ACME-style issuer plug in their own
//! [`ListenerFactory`](crate::listener::ListenerFactory) instead.

use async_stream::stream;
use openssl::ssl::{Ssl, SslAcceptor, SslFiletype, SslMethod};
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_openssl::SslStream;
use tracing::{debug, error, info};

use crate::listener::{BoxedConn, Conn, ConnStream, ListenerFactory};

impl Conn for SslStream<TcpStream> {
    fn peer_addr(&self) -> Option<SocketAddr> {
        self.get_ref().peer_addr().ok()
    }
}

/// Listener factory terminating TLS on `addr` with the given PEM
/// certificate chain and private key.
pub fn tls_listener_factory(addr: String, cert: PathBuf, key: PathBuf) -> ListenerFactory {
    Box::new(move |_domains: Vec<String>| tls_accept_stream(addr, cert, key))
}

fn build_acceptor(cert: &Path, key: &Path) -> Result<SslAcceptor, openssl::error::ErrorStack> {
    let mut builder = SslAcceptor::mozilla_intermediate(SslMethod::tls())?;
    builder.set_certificate_chain_file(cert)?;
    builder.set_private_key_file(key, SslFiletype::PEM)?;
    Ok(builder.build())
}

/// Accept TCP connections on `addr` and perform the TLS handshake
/// before yielding. Handshake failures drop the connection; setup
/// failures (bad cert, bind error) terminate the stream and with it
/// the dispatch server.
fn tls_accept_stream(addr: String, cert: PathBuf, key: PathBuf) -> ConnStream {
    Box::pin(stream! {
        let acceptor = match build_acceptor(&cert, &key) {
            Ok(acceptor) => Arc::new(acceptor),
            Err(e) => {
                yield Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("TLS acceptor from {}: {}", cert.display(), e),
                ));
                return;
            }
        };
        let listener = match TcpListener::bind(&addr).await {
            Ok(listener) => listener,
            Err(e) => {
                yield Err(io::Error::new(e.kind(), format!("bind {}: {}", addr, e)));
                return;
            }
        };
        info!("TLS listener on {}", addr);

        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    error!("TCP accept error: {}", e);
                    continue;
                }
            };

            let ssl = match Ssl::new(acceptor.context()) {
                Ok(ssl) => ssl,
                Err(e) => {
                    error!("SSL context for {}: {}", peer, e);
                    continue;
                }
            };
            let mut ssl_stream = match SslStream::new(ssl, stream) {
                Ok(ssl_stream) => ssl_stream,
                Err(e) => {
                    error!("SSL stream for {}: {}", peer, e);
                    continue;
                }
            };
            match Pin::new(&mut ssl_stream).accept().await {
                Ok(()) => {
                    debug!("TLS handshake successful with {}", peer);
                    yield Ok(Box::new(ssl_stream) as BoxedConn);
                }
                Err(e) => {
                    error!("TLS handshake failed with {}: {}", peer, e);
                }
            }
        }
    })
}
