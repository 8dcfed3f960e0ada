//! Request dispatch: longest-prefix match, round-robin selection,
//! prefix strip and forward.

use hyper::client::HttpConnector;
use hyper::header::{HeaderName, HeaderValue, CONTENT_TYPE, HOST};
use hyper::{Body, Client, Request, Response, StatusCode, Uri, Version};
use metrics::{counter, histogram};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

use crate::error::{Error, Result};
use crate::rotation::LiveAddressCache;
use crate::route_table::RouteTable;

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Handles every request accepted on the domain listener.
pub struct Dispatcher {
    table: Arc<RouteTable>,
    cache: Arc<LiveAddressCache>,
    client: Client<HttpConnector, Body>,
    scheme: &'static str,
}

impl Dispatcher {
    pub fn new(table: Arc<RouteTable>, cache: Arc<LiveAddressCache>, scheme: &'static str) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(30))
            .build(connector);
        Self {
            table,
            cache,
            client,
            scheme,
        }
    }

    /// Route, select and forward one request. Dispatch failures are
    /// reported to the client as status codes and are never fatal.
    pub async fn dispatch(
        &self,
        req: Request<Body>,
        client_addr: Option<SocketAddr>,
    ) -> Response<Body> {
        let start = Instant::now();
        let path = req.uri().path().to_string();

        let Some(prefix) = self.table.match_prefix(&path) else {
            counter!("edgefront.dispatch.no_route", 1);
            let err = Error::NoRoute { path };
            return status_response(StatusCode::BAD_GATEWAY, err.to_string());
        };

        let Some(origin) = self.cache.next(prefix) else {
            counter!("edgefront.dispatch.no_live_backend", 1);
            let err = Error::NoLiveBackends {
                prefix: prefix.to_string(),
            };
            return status_response(StatusCode::SERVICE_UNAVAILABLE, err.to_string());
        };

        match self.forward(req, prefix, &origin, client_addr).await {
            Ok(resp) => {
                counter!("edgefront.dispatch.success", 1);
                histogram!("edgefront.dispatch.duration", start.elapsed().as_secs_f64());
                resp
            }
            Err(err) => {
                counter!("edgefront.dispatch.upstream_error", 1);
                warn!(%origin, %path, "upstream dispatch failed: {}", err);
                status_response(
                    StatusCode::BAD_GATEWAY,
                    format!("upstream {}: {}", origin, err),
                )
            }
        }
    }

    async fn forward(
        &self,
        req: Request<Body>,
        prefix: &str,
        origin: &str,
        client_addr: Option<SocketAddr>,
    ) -> Result<Response<Body>> {
        let origin_uri: Uri = origin
            .parse()
            .map_err(|e| Error::config(format!("origin address {:?}: {}", origin, e)))?;
        let authority = origin_uri
            .authority()
            .ok_or_else(|| Error::config(format!("origin address {:?} has no authority", origin)))?
            .clone();
        let scheme = origin_uri.scheme_str().unwrap_or("http");

        let stripped = strip_route_prefix(req.uri().path(), prefix);
        let origin_path = origin_uri.path().trim_end_matches('/');
        let mut path_and_query = format!("{}{}", origin_path, stripped);
        if let Some(query) = req.uri().query() {
            path_and_query.push('?');
            path_and_query.push_str(query);
        }
        let target: Uri = format!("{}://{}{}", scheme, authority, path_and_query)
            .parse()
            .map_err(|e| Error::internal(format!("rewritten URI: {}", e)))?;

        let (mut parts, body) = req.into_parts();
        parts.uri = target;
        // The upstream pool speaks HTTP/1.1 regardless of what the
        // client negotiated on the front side.
        parts.version = Version::HTTP_11;

        if let Ok(host) = HeaderValue::from_str(authority.as_str()) {
            parts.headers.insert(HOST, host);
        }
        if let Some(addr) = client_addr {
            let ip = addr.ip().to_string();
            let forwarded = match parts
                .headers
                .get(X_FORWARDED_FOR)
                .and_then(|value| value.to_str().ok())
            {
                Some(existing) => format!("{}, {}", existing, ip),
                None => ip,
            };
            if let Ok(value) = HeaderValue::from_str(&forwarded) {
                parts
                    .headers
                    .insert(HeaderName::from_static(X_FORWARDED_FOR), value);
            }
        }
        parts.headers.insert(
            HeaderName::from_static(X_FORWARDED_PROTO),
            HeaderValue::from_static(self.scheme),
        );

        let outbound = Request::from_parts(parts, body);
        self.client.request(outbound).await.map_err(Error::from)
    }
}

/// Strip the matched prefix from a request path, keeping the result
/// rooted at `/`.
pub(crate) fn strip_route_prefix(path: &str, prefix: &str) -> String {
    let stripped = path.strip_prefix(prefix).unwrap_or(path);
    if stripped.starts_with('/') {
        stripped.to_string()
    } else {
        format!("/{}", stripped)
    }
}

fn status_response(status: StatusCode, message: String) -> Response<Body> {
    let mut resp = Response::new(Body::from(message));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    resp
}
