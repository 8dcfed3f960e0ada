//! Lifecycle: listener startup, cycle-loop supervision, error fan-in
//! and idempotent shutdown.

use hyper::server::accept;
use hyper::service::{make_service_fn, service_fn};
use hyper::Server;
use metrics::gauge;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::config::{normalize_bind_addr, FrontConfig};
use crate::cycle::{CycleFeedback, CycleLoop};
use crate::dispatch::Dispatcher;
use crate::error::{Error, Result};
use crate::listener::{tcp_accept_stream, BoxedConn, ConnStream, ListenerFactory};
use crate::peer::HttpPingTransport;
use crate::redirect::run_redirector;
use crate::rotation::LiveAddressCache;
use crate::route_table::RouteTable;
use crate::tls::tls_listener_factory;

/// Handle returned by [`listen`]: close once, wait for the terminal
/// error.
pub struct ListenConfirmation {
    closed: AtomicBool,
    shutdown: broadcast::Sender<()>,
    errs: Mutex<mpsc::Receiver<Error>>,
    local_addr: Option<SocketAddr>,
}

impl ListenConfirmation {
    /// Stop the dispatch server, the redirector and all cycle loops.
    /// Idempotent: the first call wins, later calls fail with
    /// [`Error::AlreadyClosed`].
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyClosed);
        }
        let _ = self.shutdown.send(());
        Ok(())
    }

    /// Block until the dispatch server exits. Returns the terminal
    /// error, or `Ok(())` on clean shutdown.
    pub async fn wait(&self) -> Result<()> {
        let mut errs = self.errs.lock().await;
        match errs.recv().await {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Bound address of the dispatch listener, when the crate did the
    /// binding itself (HTTP/1 mode).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

/// Start the front-end with the configuration's own listener: a plain
/// TCP bind in HTTP/1 mode, the file-based TLS factory otherwise.
pub async fn listen(cfg: FrontConfig) -> Result<ListenConfirmation> {
    listen_with(cfg, None).await
}

/// Start the front-end, optionally with an explicit listener factory
/// (test injection, or an ACME-backed TLS terminator).
pub async fn listen_with(
    cfg: FrontConfig,
    domains_listener: Option<ListenerFactory>,
) -> Result<ListenConfirmation> {
    cfg.validate()?;

    let domains = cfg.synthesize_domains();
    if cfg.needs_domains() && domains.is_empty() {
        return Err(Error::NoDomains);
    }

    let mut local_addr = None;
    let conns: ConnStream = match domains_listener {
        Some(factory) => factory(domains.clone()),
        None if cfg.http1 => {
            let addr = normalize_bind_addr(&cfg.non_https_addr);
            let listener = TcpListener::bind(&addr)
                .await
                .map_err(|e| Error::listener(format!("bind {}: {}", addr, e)))?;
            local_addr = listener.local_addr().ok();
            info!("HTTP/1 dispatch listener on {}", addr);
            tcp_accept_stream(listener)
        }
        None => match (&cfg.tls_cert, &cfg.tls_key) {
            (Some(cert), Some(key)) => {
                let addr = normalize_bind_addr(&cfg.https_addr);
                tls_listener_factory(addr, cert.clone(), key.clone())(domains.clone())
            }
            _ => {
                return Err(Error::listener(
                    "no domain listener available: supply a listener factory or tls_cert/tls_key",
                ))
            }
        },
    };

    let table = Arc::new(RouteTable::build(&cfg.effective_routes())?);
    let cache = Arc::new(LiveAddressCache::new());

    let (shutdown_tx, _) = broadcast::channel(2);
    let (errs_tx, errs_rx) = mpsc::channel::<Error>(16);
    let (feedback_tx, feedback_rx) = mpsc::unbounded_channel::<CycleFeedback>();

    let probe_transport = Arc::new(HttpPingTransport::new(cfg.probe_timeout));
    for (prefix, primary) in table.entries() {
        primary.set_transport(probe_transport.clone());
        let looper = CycleLoop::new(
            prefix.to_string(),
            primary.clone(),
            cache.clone(),
            cfg.backend_ping_period,
            cfg.probe_concurrency,
            cfg.shuffle_seed,
        );
        tokio::spawn(looper.run(feedback_tx.clone(), shutdown_tx.subscribe()));
    }
    drop(feedback_tx);
    tokio::spawn(consume_feedback(feedback_rx, errs_tx.clone()));

    if !cfg.http1 && !cfg.non_https_redirect_url.trim().is_empty() {
        tokio::spawn(run_redirector(
            normalize_bind_addr(&cfg.non_https_addr),
            cfg.non_https_redirect_url.trim().to_string(),
            shutdown_tx.subscribe(),
        ));
    }

    let scheme = if cfg.http1 { "http" } else { "https" };
    let dispatcher = Arc::new(Dispatcher::new(table, cache, scheme));
    let make_svc = make_service_fn(move |conn: &BoxedConn| {
        let dispatcher = dispatcher.clone();
        let client_addr = conn.peer_addr();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let dispatcher = dispatcher.clone();
                async move { Ok::<_, Infallible>(dispatcher.dispatch(req, client_addr).await) }
            }))
        }
    });

    let mut serve_shutdown = shutdown_tx.subscribe();
    let server = Server::builder(accept::from_stream(conns))
        .serve(make_svc)
        .with_graceful_shutdown(async move {
            let _ = serve_shutdown.recv().await;
        });

    let server_exit = shutdown_tx.clone();
    tokio::spawn(async move {
        if let Err(e) = server.await {
            warn!("dispatch server exited: {}", e);
            let _ = errs_tx
                .send(Error::listener(format!("dispatch server: {}", e)))
                .await;
        }
        // Cycle loops and the redirector never outlive the server.
        let _ = server_exit.send(());
        drop(errs_tx);
    });

    Ok(ListenConfirmation {
        closed: AtomicBool::new(false),
        shutdown: shutdown_tx,
        errs: Mutex::new(errs_rx),
        local_addr,
    })
}

/// Monitoring sink for cycle feedback: logs partitions, exports the
/// per-route live gauge and forwards cycle errors into the process
/// error channel.
async fn consume_feedback(
    mut feedback: mpsc::UnboundedReceiver<CycleFeedback>,
    errs: mpsc::Sender<Error>,
) {
    while let Some(fb) = feedback.recv().await {
        gauge!(
            "edgefront.live_backends",
            fb.live.len() as f64,
            "route" => fb.prefix.clone()
        );
        debug!(
            prefix = %fb.prefix,
            cycle = fb.cycle,
            live = fb.live.len(),
            non_live = fb.non_live.len(),
            "liveliness cycle finished"
        );
        if let Some(err) = fb.error {
            if errs.send(err).await.is_err() {
                break;
            }
        }
    }
}
