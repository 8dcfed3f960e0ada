//! edgefront - health-aware HTTPS front-end reverse proxy
//!
//! edgefront terminates TLS for a set of declared domains, redirects
//! plain-HTTP traffic to an HTTPS destination and fans requests out
//! to a pool of backend origin servers:
//! - Longest-prefix route matching with configuration-order tie-breaks
//! - Per-route liveliness probing with bounded parallelism
//! - Round-robin rotation over the currently-live backends, shuffled
//!   each cycle
//! - Pluggable listener factory for TLS termination
//! - Idempotent shutdown with a single multiplexed error channel

pub mod config;
pub mod cycle;
pub mod dispatch;
pub mod error;
pub mod listener;
pub mod peer;
pub mod redirect;
pub mod rotation;
pub mod route_table;
pub mod server;
pub mod tls;

pub use config::{load_route_file, FrontConfig, FrontConfigBuilder, RouteRule};
pub use cycle::CycleFeedback;
pub use error::{Error, Result, TransportErrorKind};
pub use listener::{BoxedConn, Conn, ConnStream, ListenerFactory};
pub use peer::{HttpPingTransport, Liveliness, Peer, Ping, PingTransport};
pub use rotation::LiveAddressCache;
pub use route_table::RouteTable;
pub use server::{listen, listen_with, ListenConfirmation};
pub use tls::tls_listener_factory;
