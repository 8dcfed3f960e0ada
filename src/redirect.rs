//! Plain-HTTP redirector: permanently redirects every request to the
//! configured HTTPS destination.

use hyper::header::{HeaderValue, LOCATION};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Response, Server, StatusCode};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};

/// Serve permanent redirects on `addr` until shutdown. Failures here
/// are logged, never fatal to the dispatch server.
pub(crate) async fn run_redirector(
    addr: String,
    redirect_url: String,
    mut shutdown: broadcast::Receiver<()>,
) {
    let sock: SocketAddr = match addr.parse() {
        Ok(sock) => sock,
        Err(e) => {
            error!("non-HTTPS redirector address {:?}: {}", addr, e);
            return;
        }
    };
    let target: Arc<str> = redirect_url.into();

    let make_svc = make_service_fn(move |_| {
        let target = target.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |_req| {
                let target = target.clone();
                async move { Ok::<_, Infallible>(permanent_redirect(&target)) }
            }))
        }
    });

    let builder = match Server::try_bind(&sock) {
        Ok(builder) => builder,
        Err(e) => {
            error!("non-HTTPS redirector bind {}: {}", sock, e);
            return;
        }
    };
    info!("non-HTTPS redirector listening on {}", sock);

    let server = builder
        .serve(make_svc)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        });
    if let Err(e) = server.await {
        error!("non-HTTPS redirector: {}", e);
    }
}

fn permanent_redirect(target: &str) -> Response<Body> {
    let mut resp = Response::new(Body::from(format!("redirecting to {}", target)));
    *resp.status_mut() = StatusCode::MOVED_PERMANENTLY;
    match HeaderValue::from_str(target) {
        Ok(location) => {
            resp.headers_mut().insert(LOCATION, location);
        }
        Err(e) => {
            error!("redirect target {:?}: {}", target, e);
            *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
        }
    }
    resp
}
