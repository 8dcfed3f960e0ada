//! Backend peers and the liveliness prober.
//!
//! A route's backends form a peer group: one *primary* coordinates
//! probing, its *secondaries* are the probed origin servers. A probe
//! is a `POST {addr}/ping` carrying the prober's identity; anything
//! that answers at the transport layer counts as live, whatever the
//! HTTP status. Only transport-level failures (unreachable endpoint,
//! elapsed deadline, broken exchange) take a backend out of rotation.

use ahash::AHashMap;
use async_trait::async_trait;
use hyper::client::HttpConnector;
use hyper::header::CONTENT_TYPE;
use hyper::{Body, Client, Request, Response};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, Semaphore};
use uuid::Uuid;

use crate::error::{Error, Result, TransportErrorKind};

const DEFAULT_PROBE_CONCURRENCY: usize = 5;
const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Probe message exchanged between peers.
///
/// Probe requests carry the prober's identity, responses the
/// respondent's. A blank ping (empty id, zero clock) is the sentinel
/// for a reachable backend that does not speak the ping protocol.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {
    #[serde(rename = "id", default)]
    pub peer_id: String,
    #[serde(default)]
    pub clock: i64,
}

impl Ping {
    /// The blank sentinel.
    pub fn blank() -> Self {
        Self::default()
    }

    pub fn is_blank(&self) -> bool {
        self.peer_id.is_empty() && self.clock == 0
    }
}

/// One liveliness record per probed secondary per cycle.
#[derive(Debug, Clone)]
pub struct Liveliness {
    pub peer_id: String,
    pub addr: String,
    pub ping: Ping,
    pub err: Option<Error>,
}

impl Liveliness {
    pub fn is_live(&self) -> bool {
        self.err.is_none()
    }
}

/// Transport seam for probes, injectable in tests.
#[async_trait]
pub trait PingTransport: Send + Sync {
    async fn round_trip(&self, req: Request<Body>) -> Result<Response<Body>>;
}

/// Default probe transport: a pooled hyper client with a per-request
/// deadline.
pub struct HttpPingTransport {
    client: Client<HttpConnector, Body>,
    timeout: Duration,
}

impl HttpPingTransport {
    pub fn new(timeout: Duration) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(30))
            .build(connector);
        Self { client, timeout }
    }

    fn shared() -> Arc<Self> {
        static SHARED: OnceLock<Arc<HttpPingTransport>> = OnceLock::new();
        SHARED
            .get_or_init(|| Arc::new(HttpPingTransport::new(DEFAULT_PROBE_TIMEOUT)))
            .clone()
    }
}

#[async_trait]
impl PingTransport for HttpPingTransport {
    async fn round_trip(&self, req: Request<Body>) -> Result<Response<Body>> {
        match tokio::time::timeout(self.timeout, self.client.request(req)).await {
            Ok(result) => result.map_err(Error::from),
            Err(_) => Err(Error::transport(
                format!("probe exceeded {:?}", self.timeout),
                TransportErrorKind::Timeout,
            )),
        }
    }
}

/// A backend identity, either the probing coordinator (primary) or a
/// probed member (secondary) of a peer group.
pub struct Peer {
    id: String,
    addr: String,
    primary: bool,
    // Forward index only: secondaries hold no reference back.
    members: RwLock<AHashMap<String, Arc<Peer>>>,
    transport: RwLock<Option<Arc<dyn PingTransport>>>,
}

impl Peer {
    /// Allocate a primary with a random identifier.
    pub fn primary() -> Arc<Self> {
        Self::with_id(Uuid::new_v4().to_string(), String::new(), true)
    }

    /// Allocate a secondary for the given origin address.
    pub fn secondary<S: Into<String>>(addr: S) -> Arc<Self> {
        Self::with_id(Uuid::new_v4().to_string(), addr.into(), false)
    }

    pub fn with_id(id: String, addr: String, primary: bool) -> Arc<Self> {
        Arc::new(Self {
            id,
            addr,
            primary,
            members: RwLock::new(AHashMap::new()),
            transport: RwLock::new(None),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn is_primary(&self) -> bool {
        self.primary
    }

    /// Register `other` as a secondary under its trimmed identifier.
    /// Registering an identifier again replaces the prior entry.
    pub fn add_peer(&self, other: Arc<Peer>) -> Result<()> {
        let id = other.id.trim().to_string();
        if id.is_empty() {
            return Err(Error::invalid_peer("peer has a blank ID"));
        }
        self.members.write().insert(id, other);
        Ok(())
    }

    /// Install a custom probe transport. Thread-safe with respect to
    /// in-flight liveliness rounds, which snapshot the transport at
    /// probe time.
    pub fn set_transport(&self, transport: Arc<dyn PingTransport>) {
        *self.transport.write() = Some(transport);
    }

    fn transport(&self) -> Arc<dyn PingTransport> {
        match self.transport.read().clone() {
            Some(transport) => transport,
            None => HttpPingTransport::shared(),
        }
    }

    /// Copy of the membership map, taken under the lock so probing
    /// never iterates shared state.
    pub fn members_snapshot(&self) -> Vec<Arc<Peer>> {
        self.members.read().values().cloned().collect()
    }

    /// Probe a single peer and classify the outcome.
    async fn ping(&self, other: &Peer) -> Result<Ping> {
        let sent = Ping {
            peer_id: self.id.clone(),
            clock: unix_now(),
        };
        let body = serde_json::to_vec(&sent)?;
        let uri = format!("{}/ping", other.addr.trim_end_matches('/'));
        let req = Request::post(uri.as_str())
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(body))?;

        let resp = self.transport().round_trip(req).await?;
        let (parts, body) = resp.into_parts();
        // Drain the body on every path so pooled connections are
        // returned instead of leaked.
        let bytes = hyper::body::to_bytes(body).await.map_err(Error::from)?;

        if !parts.status.is_success() {
            return Ok(Ping::blank());
        }
        match serde_json::from_slice::<Ping>(&bytes) {
            Ok(ping) => Ok(ping),
            Err(_) => Ok(Ping::blank()),
        }
    }

    /// Concurrently probe every secondary through a worker pool of
    /// the given size (default when 0) and partition the records into
    /// live and non-live. Returns once every probe has completed;
    /// result ordering is unspecified.
    pub async fn liveliness(
        self: &Arc<Self>,
        concurrency: usize,
    ) -> (Vec<Liveliness>, Vec<Liveliness>) {
        let members = self.members_snapshot();
        let concurrency = if concurrency == 0 {
            DEFAULT_PROBE_CONCURRENCY
        } else {
            concurrency
        };

        let semaphore = Arc::new(Semaphore::new(concurrency));
        let (tx, mut rx) = mpsc::channel(members.len().max(1));
        for member in members {
            let semaphore = semaphore.clone();
            let tx = tx.clone();
            let prober = Arc::clone(self);
            tokio::spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return;
                };
                let record = match prober.ping(&member).await {
                    Ok(ping) => Liveliness {
                        peer_id: member.id().to_string(),
                        addr: member.addr().to_string(),
                        ping,
                        err: None,
                    },
                    Err(err) => Liveliness {
                        peer_id: member.id().to_string(),
                        addr: member.addr().to_string(),
                        ping: Ping::blank(),
                        err: Some(err),
                    },
                };
                let _ = tx.send(record).await;
            });
        }
        drop(tx);

        let mut live = Vec::new();
        let mut non_live = Vec::new();
        while let Some(record) = rx.recv().await {
            if record.is_live() {
                live.push(record);
            } else {
                non_live.push(record);
            }
        }
        (live, non_live)
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("primary", &self.primary)
            .field("members", &self.members.read().len())
            .finish()
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{stream, StreamExt};
    use hyper::StatusCode;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Respondent-side mock: enforces the wire contract (POST, JSON
    /// body, non-blank ping) and answers with its own identity, or
    /// with 500 for peers listed as blocked.
    struct RespondentTransport {
        id: String,
        blocked: Vec<String>,
    }

    #[async_trait]
    impl PingTransport for RespondentTransport {
        async fn round_trip(&self, req: Request<Body>) -> Result<Response<Body>> {
            if req.method() != hyper::Method::POST {
                return Ok(status_body(StatusCode::BAD_REQUEST, "expecting POST"));
            }
            let bytes = hyper::body::to_bytes(req.into_body())
                .await
                .map_err(Error::from)?;
            let recv: Ping = match serde_json::from_slice(&bytes) {
                Ok(ping) => ping,
                Err(e) => return Ok(status_body(StatusCode::BAD_REQUEST, &e.to_string())),
            };
            if recv.is_blank() {
                return Ok(status_body(
                    StatusCode::BAD_REQUEST,
                    "expecting a non-blank ping",
                ));
            }
            if self.blocked.contains(&recv.peer_id) {
                return Ok(status_body(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "purposefully not responding",
                ));
            }
            let reply = Ping {
                peer_id: self.id.clone(),
                clock: unix_now(),
            };
            let blob = serde_json::to_vec(&reply).expect("encode ping");
            Ok(Response::new(Body::from(blob)))
        }
    }

    /// Transport that answers every probe with a fixed status and
    /// body.
    struct FixedTransport {
        status: StatusCode,
        body: &'static str,
    }

    impl FixedTransport {
        fn new(status: StatusCode, body: &'static str) -> Arc<Self> {
            Arc::new(Self { status, body })
        }
    }

    #[async_trait]
    impl PingTransport for FixedTransport {
        async fn round_trip(&self, _req: Request<Body>) -> Result<Response<Body>> {
            Ok(status_body(self.status, self.body))
        }
    }

    /// Transport that fails at the network layer.
    struct RefusingTransport;

    #[async_trait]
    impl PingTransport for RefusingTransport {
        async fn round_trip(&self, _req: Request<Body>) -> Result<Response<Body>> {
            Err(Error::transport(
                "connection refused",
                TransportErrorKind::Unreachable,
            ))
        }
    }

    fn status_body(status: StatusCode, body: &str) -> Response<Body> {
        let mut resp = Response::new(Body::from(body.to_string()));
        *resp.status_mut() = status;
        resp
    }

    fn group_of(n: usize) -> (Arc<Peer>, Vec<Arc<Peer>>) {
        let primary = Peer::primary();
        let mut secondaries = Vec::new();
        for i in 0..n {
            let secondary = Peer::secondary(format!("http://192.168.1.68:{}", 1000 + i));
            primary.add_peer(secondary.clone()).expect("add peer");
            secondaries.push(secondary);
        }
        (primary, secondaries)
    }

    #[test]
    fn test_add_peer_rejects_blank_id() {
        let primary = Peer::primary();
        let blank = Peer::with_id("   ".to_string(), "http://b".to_string(), false);
        assert!(matches!(
            primary.add_peer(blank),
            Err(Error::InvalidPeer { .. })
        ));
    }

    #[test]
    fn test_add_peer_replaces_existing_id() {
        let primary = Peer::primary();
        let first = Peer::with_id("dup".to_string(), "http://one".to_string(), false);
        let second = Peer::with_id("dup".to_string(), "http://two".to_string(), false);
        primary.add_peer(first).expect("add first");
        primary.add_peer(second).expect("add second");

        let members = primary.members_snapshot();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].addr(), "http://two");
    }

    #[test]
    fn test_blank_ping_sentinel() {
        assert!(Ping::blank().is_blank());
        let ping = Ping {
            peer_id: "p".to_string(),
            clock: 1,
        };
        assert!(!ping.is_blank());
    }

    #[test]
    fn test_ping_wire_format() {
        let ping = Ping {
            peer_id: "abc".to_string(),
            clock: 1700000000,
        };
        let encoded = serde_json::to_string(&ping).expect("encode");
        assert_eq!(encoded, r#"{"id":"abc","clock":1700000000}"#);
        let decoded: Ping = serde_json::from_str(&encoded).expect("decode");
        assert_eq!(decoded, ping);
    }

    #[tokio::test]
    async fn test_liveliness_parses_respondent_pings() {
        let (primary, _) = group_of(8);
        primary.set_transport(Arc::new(RespondentTransport {
            id: "respondent".to_string(),
            blocked: vec![],
        }));
        let (live, non_live) = primary.liveliness(4).await;
        assert_eq!(live.len(), 8);
        assert!(non_live.is_empty());
        for record in &live {
            assert_eq!(record.ping.peer_id, "respondent");
            assert!(!record.ping.is_blank());
        }
    }

    #[tokio::test]
    async fn test_liveliness_blocked_prober_stays_live() {
        // A 500 from the respondent still means the endpoint is
        // reachable: classified live, blank sentinel ping.
        let (primary, _) = group_of(4);
        primary.set_transport(Arc::new(RespondentTransport {
            id: "respondent".to_string(),
            blocked: vec![primary.id().to_string()],
        }));
        let (live, non_live) = primary.liveliness(0).await;
        assert_eq!(live.len(), 4);
        assert!(non_live.is_empty());
        for record in &live {
            assert!(record.ping.is_blank());
        }
    }

    #[tokio::test]
    async fn test_liveliness_tolerates_missing_ping_endpoint() {
        let (primary, _) = group_of(2);
        primary.set_transport(FixedTransport::new(StatusCode::NOT_FOUND, "not found"));
        let (live, non_live) = primary.liveliness(0).await;
        assert_eq!(live.len(), 2);
        assert!(non_live.is_empty());
        assert!(live.iter().all(|r| r.ping.is_blank()));
    }

    #[tokio::test]
    async fn test_liveliness_unparseable_body_is_live_blank() {
        let (primary, _) = group_of(1);
        primary.set_transport(FixedTransport::new(StatusCode::OK, "not json at all"));
        let (live, non_live) = primary.liveliness(0).await;
        assert_eq!(live.len(), 1);
        assert!(non_live.is_empty());
        assert!(live[0].ping.is_blank());
    }

    #[tokio::test]
    async fn test_liveliness_transport_failure_is_non_live() {
        let (primary, secondaries) = group_of(3);
        primary.set_transport(Arc::new(RefusingTransport));
        let (live, non_live) = primary.liveliness(2).await;
        assert!(live.is_empty());
        assert_eq!(non_live.len(), 3);
        let mut addrs: Vec<&str> = non_live.iter().map(|r| r.addr.as_str()).collect();
        addrs.sort_unstable();
        let mut expected: Vec<String> =
            secondaries.iter().map(|p| p.addr().to_string()).collect();
        expected.sort_unstable();
        assert_eq!(addrs, expected);
        for record in &non_live {
            assert!(matches!(
                record.err,
                Some(Error::Transport {
                    kind: TransportErrorKind::Unreachable,
                    ..
                })
            ));
        }
    }

    /// Transport whose response bodies flag when they have been read
    /// to the end, so draining is observable per status code.
    struct TrackedBodyTransport {
        status: StatusCode,
        drained: Arc<AtomicBool>,
    }

    #[async_trait]
    impl PingTransport for TrackedBodyTransport {
        async fn round_trip(&self, _req: Request<Body>) -> Result<Response<Body>> {
            let drained = self.drained.clone();
            let chunks = stream::iter(vec![
                Ok::<_, std::io::Error>(bytes::Bytes::from_static(b"{")),
                Ok(bytes::Bytes::from_static(b"}")),
            ])
            .chain(stream::once(async move {
                drained.store(true, Ordering::SeqCst);
                Ok(bytes::Bytes::new())
            }));
            let mut resp = Response::new(Body::wrap_stream(chunks));
            *resp.status_mut() = self.status;
            Ok(resp)
        }
    }

    #[tokio::test]
    async fn test_liveliness_drains_bodies_on_every_status() {
        let statuses = [
            StatusCode::OK,
            StatusCode::INTERNAL_SERVER_ERROR,
            StatusCode::BAD_REQUEST,
            StatusCode::TEMPORARY_REDIRECT,
        ];
        for status in statuses {
            let (primary, _) = group_of(1);
            let drained = Arc::new(AtomicBool::new(false));
            primary.set_transport(Arc::new(TrackedBodyTransport {
                status,
                drained: drained.clone(),
            }));
            let (live, non_live) = primary.liveliness(0).await;
            assert_eq!(live.len() + non_live.len(), 1);
            assert!(
                drained.load(Ordering::SeqCst),
                "body not drained for {}",
                status
            );
        }
    }

    #[tokio::test]
    async fn test_liveliness_bounded_concurrency() {
        use tokio::time::{sleep, Duration};

        struct GateTransport {
            in_flight: AtomicUsize,
            peak: AtomicUsize,
        }

        #[async_trait]
        impl PingTransport for GateTransport {
            async fn round_trip(&self, _req: Request<Body>) -> Result<Response<Body>> {
                let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                sleep(Duration::from_millis(20)).await;
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok(Response::new(Body::from("{}")))
            }
        }

        let (primary, _) = group_of(12);
        let gate = Arc::new(GateTransport {
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        primary.set_transport(gate.clone());
        let (live, _) = primary.liveliness(3).await;
        assert_eq!(live.len(), 12);
        assert!(gate.peak.load(Ordering::SeqCst) <= 3);
    }
}
