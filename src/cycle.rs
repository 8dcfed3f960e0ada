//! Periodic liveliness cycles, one loop per route prefix.
//!
//! A cycle probes every secondary of the prefix's primary, projects
//! the live records to their addresses, shuffles them and publishes
//! the result into the live-address cache. Shuffling is deliberate:
//! independent front-end replicas would otherwise converge on the
//! same ordering and stampede the first live backend.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::error::Error;
use crate::peer::{Liveliness, Peer};
use crate::rotation::LiveAddressCache;

/// Per-cycle event for the monitoring sink.
#[derive(Debug)]
pub struct CycleFeedback {
    /// Monotonically increasing cycle number, starting at 1.
    pub cycle: u64,
    pub prefix: String,
    pub live: Vec<Liveliness>,
    pub non_live: Vec<Liveliness>,
    pub error: Option<Error>,
}

/// The probe-and-publish loop for a single route prefix.
pub struct CycleLoop {
    prefix: String,
    primary: Arc<Peer>,
    cache: Arc<LiveAddressCache>,
    period: Duration,
    concurrency: usize,
    rng: StdRng,
}

impl CycleLoop {
    pub fn new(
        prefix: String,
        primary: Arc<Peer>,
        cache: Arc<LiveAddressCache>,
        period: Duration,
        concurrency: usize,
        shuffle_seed: Option<u64>,
    ) -> Self {
        let rng = match shuffle_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            prefix,
            primary,
            cache,
            period,
            concurrency,
            rng,
        }
    }

    /// Run cycles until shutdown. Shutdown is observed right after a
    /// probe round completes and at the inter-cycle sleep; a probe
    /// round itself always runs to completion.
    pub async fn run(
        mut self,
        feedback: mpsc::UnboundedSender<CycleFeedback>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut cycle = 0u64;
        loop {
            cycle += 1;
            let fb = self.cycle_once(cycle).await;
            if feedback.send(fb).is_err() {
                break;
            }

            match shutdown.try_recv() {
                Ok(()) | Err(broadcast::error::TryRecvError::Closed) => break,
                Err(broadcast::error::TryRecvError::Empty)
                | Err(broadcast::error::TryRecvError::Lagged(_)) => {}
            }

            tokio::select! {
                _ = tokio::time::sleep(self.period) => {}
                _ = shutdown.recv() => break,
            }
        }
        debug!(prefix = %self.prefix, "cycle loop stopped");
    }

    /// One probe → classify → publish round.
    pub(crate) async fn cycle_once(&mut self, cycle: u64) -> CycleFeedback {
        let (live, non_live) = self.primary.liveliness(self.concurrency).await;

        let mut addrs: Vec<String> = live.iter().map(|record| record.addr.clone()).collect();
        addrs.shuffle(&mut self.rng);
        self.cache.publish(&self.prefix, addrs);

        if live.is_empty() && !non_live.is_empty() {
            warn!(
                prefix = %self.prefix,
                non_live = non_live.len(),
                "no live backends after probe cycle"
            );
        }

        CycleFeedback {
            cycle,
            prefix: self.prefix.clone(),
            live,
            non_live,
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Result, TransportErrorKind};
    use crate::peer::PingTransport;
    use async_trait::async_trait;
    use hyper::{Body, Request, Response};

    /// Refuses connections for the listed addresses, answers 200 for
    /// the rest.
    struct PartialOutageTransport {
        down: Vec<String>,
    }

    #[async_trait]
    impl PingTransport for PartialOutageTransport {
        async fn round_trip(&self, req: Request<Body>) -> Result<Response<Body>> {
            let target = req.uri().to_string();
            if self.down.iter().any(|addr| target.starts_with(addr)) {
                return Err(Error::transport(
                    "connection refused",
                    TransportErrorKind::Unreachable,
                ));
            }
            Ok(Response::new(Body::from("{}")))
        }
    }

    fn group(addrs: &[&str]) -> Arc<Peer> {
        let primary = Peer::primary();
        for addr in addrs {
            primary
                .add_peer(Peer::secondary(addr.to_string()))
                .expect("add peer");
        }
        primary
    }

    fn cycle_loop(primary: Arc<Peer>, cache: Arc<LiveAddressCache>) -> CycleLoop {
        CycleLoop::new(
            "/".to_string(),
            primary,
            cache,
            Duration::from_millis(10),
            2,
            Some(7),
        )
    }

    #[tokio::test]
    async fn test_cycle_publishes_live_addresses() {
        let primary = group(&["http://a", "http://b", "http://c"]);
        primary.set_transport(Arc::new(PartialOutageTransport { down: vec![] }));
        let cache = Arc::new(LiveAddressCache::new());
        let mut looper = cycle_loop(primary, cache.clone());

        let fb = looper.cycle_once(1).await;
        assert_eq!(fb.cycle, 1);
        assert_eq!(fb.live.len(), 3);
        assert!(fb.non_live.is_empty());
        assert!(fb.error.is_none());

        let (addrs, cursor) = cache.snapshot("/").expect("published");
        assert_eq!(cursor, 0);
        let mut sorted = addrs.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, ["http://a", "http://b", "http://c"]);
    }

    #[tokio::test]
    async fn test_cycle_evicts_dead_backend() {
        let primary = group(&["http://a", "http://b"]);
        let cache = Arc::new(LiveAddressCache::new());
        let mut looper = cycle_loop(primary.clone(), cache.clone());

        primary.set_transport(Arc::new(PartialOutageTransport { down: vec![] }));
        looper.cycle_once(1).await;
        let (addrs, _) = cache.snapshot("/").expect("published");
        assert_eq!(addrs.len(), 2);

        // A goes transport-unreachable: the next cycle drops it.
        primary.set_transport(Arc::new(PartialOutageTransport {
            down: vec!["http://a".to_string()],
        }));
        let fb = looper.cycle_once(2).await;
        assert_eq!(fb.live.len(), 1);
        assert_eq!(fb.non_live.len(), 1);
        assert_eq!(fb.non_live[0].addr, "http://a");

        let (addrs, cursor) = cache.snapshot("/").expect("published");
        assert_eq!(addrs, ["http://b"]);
        assert_eq!(cursor, 0);
        assert_eq!(cache.next("/").as_deref(), Some("http://b"));
        assert_eq!(cache.next("/").as_deref(), Some("http://b"));
    }

    #[tokio::test]
    async fn test_cycle_publishes_empty_list_on_total_outage() {
        let primary = group(&["http://a"]);
        primary.set_transport(Arc::new(PartialOutageTransport {
            down: vec!["http://a".to_string()],
        }));
        let cache = Arc::new(LiveAddressCache::new());
        let mut looper = cycle_loop(primary, cache.clone());

        looper.cycle_once(1).await;
        assert_eq!(cache.snapshot("/"), Some((Vec::new(), 0)));
        assert_eq!(cache.next("/"), None);
    }

    #[tokio::test]
    async fn test_run_emits_feedback_and_stops_on_shutdown() {
        let primary = group(&["http://a"]);
        primary.set_transport(Arc::new(PartialOutageTransport { down: vec![] }));
        let cache = Arc::new(LiveAddressCache::new());
        let looper = cycle_loop(primary, cache);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(looper.run(tx, shutdown_rx));

        let first = rx.recv().await.expect("first cycle");
        assert_eq!(first.cycle, 1);
        let second = rx.recv().await.expect("second cycle");
        assert_eq!(second.cycle, 2);

        shutdown_tx.send(()).expect("broadcast shutdown");
        handle.await.expect("loop exits");
        // Sender side is dropped once the loop exits.
        while rx.recv().await.is_some() {}
    }
}
