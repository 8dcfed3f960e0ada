//! Listener plumbing: the connection abstraction the dispatch server
//! accepts from, and the plain-TCP accept stream used in HTTP/1
//! local-test mode.
//!
//! TLS certificate acquisition is a collaborator, not a concern of
//! the core: anything that can hand over a stream of accepted
//! connections (see [`ListenerFactory`]) can front the dispatcher.

use async_stream::stream;
use futures_util::Stream;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tracing::error;

/// An accepted, ready-to-serve connection.
pub trait Conn: AsyncRead + AsyncWrite + Send + Unpin {
    /// Remote address, when the transport knows it.
    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }
}

impl Conn for TcpStream {
    fn peer_addr(&self) -> Option<SocketAddr> {
        TcpStream::peer_addr(self).ok()
    }
}

pub type BoxedConn = Box<dyn Conn>;

/// Stream of accepted connections feeding the dispatch server.
pub type ConnStream = Pin<Box<dyn Stream<Item = Result<BoxedConn, io::Error>> + Send>>;

/// Factory producing a connection-accepting endpoint for the
/// synthesized domain list. In TLS mode the factory is expected to
/// hand back already-terminated connections.
pub type ListenerFactory = Box<dyn FnOnce(Vec<String>) -> ConnStream + Send>;

/// Accept loop over a bound TCP listener. Transient accept errors
/// are logged and skipped rather than terminating the server.
pub fn tcp_accept_stream(listener: TcpListener) -> ConnStream {
    Box::pin(stream! {
        loop {
            match listener.accept().await {
                Ok((stream, _addr)) => {
                    let _ = stream.set_nodelay(true);
                    yield Ok(Box::new(stream) as BoxedConn);
                }
                Err(e) => {
                    error!("TCP accept error: {}", e);
                    continue;
                }
            }
        }
    })
}
