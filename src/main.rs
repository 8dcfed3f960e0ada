use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use edgefront::{listen, load_route_file, FrontConfig};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Comma separated addresses of the backend origin servers
    #[arg(long = "csv-backends", default_value = "")]
    csv_backends: String,

    /// Comma separated domains the front-end will be representing
    #[arg(long, default_value = "")]
    domains: String,

    /// Run as a plain HTTP/1 server on a single local address
    #[arg(long)]
    http1: bool,

    /// Bind address of the plain-HTTP endpoint
    #[arg(long = "non-https-addr", default_value = ":80")]
    non_https_addr: String,

    /// URL to which all plain-HTTP traffic is permanently redirected
    #[arg(long = "non-https-redirect", default_value = "")]
    non_https_redirect: String,

    /// Do not synthesize www. variants of the configured domains
    #[arg(long = "no-auto-www")]
    no_auto_www: bool,

    /// Period between backend liveliness checks, as <DIGITS><UNIT>
    /// with UNIT one of ns, us (or µs), ms, s, m, h
    #[arg(long = "backend-ping-period", default_value = "3m", value_parser = parse_period)]
    backend_ping_period: Duration,

    /// File with comma-delimited route lines: <prefix>,<backend>[,<backend>...]
    #[arg(long = "route-file")]
    route_file: Option<PathBuf>,
}

fn parse_period(raw: &str) -> std::result::Result<Duration, String> {
    humantime::parse_duration(&raw.replace("µs", "us")).map_err(|e| e.to_string())
}

fn split_csv(csv: &str) -> Vec<String> {
    csv.split(',')
        .map(str::trim)
        .filter(|field| !field.is_empty())
        .map(str::to_string)
        .collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();

    metrics_exporter_prometheus::PrometheusBuilder::new()
        .install()
        .context("failed to install metrics recorder")?;

    let mut builder = FrontConfig::builder()
        .http1(args.http1)
        .domains(split_csv(&args.domains))
        .no_auto_www(args.no_auto_www)
        .proxy_addresses(split_csv(&args.csv_backends))
        .non_https_addr(args.non_https_addr)
        .non_https_redirect_url(args.non_https_redirect)
        .backend_ping_period(args.backend_ping_period);
    if let Some(path) = &args.route_file {
        let rules = load_route_file(path)
            .with_context(|| format!("route file {}", path.display()))?;
        builder = builder.routes(rules);
    }
    let cfg = builder.build().context("invalid configuration")?;

    let confirmation = Arc::new(listen(cfg).await.context("startup failed")?);
    info!("edgefront started");

    {
        let confirmation = confirmation.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
                if let Err(e) = confirmation.close() {
                    error!("close: {}", e);
                }
            }
        });
    }

    confirmation.wait().await.context("terminal error")?;
    info!("edgefront stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_period_units() {
        assert_eq!(parse_period("3m"), Ok(Duration::from_secs(180)));
        assert_eq!(parse_period("45s"), Ok(Duration::from_secs(45)));
        assert_eq!(parse_period("250ms"), Ok(Duration::from_millis(250)));
        assert_eq!(parse_period("10µs"), Ok(Duration::from_micros(10)));
        assert_eq!(parse_period("1h"), Ok(Duration::from_secs(3600)));
        assert!(parse_period("nonsense").is_err());
    }

    #[test]
    fn test_split_csv() {
        assert_eq!(
            split_csv(" http://a , http://b ,, "),
            vec!["http://a".to_string(), "http://b".to_string()]
        );
        assert!(split_csv("").is_empty());
    }
}
