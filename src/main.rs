use anyhow::{Context, Result};
use sniproxy::admin::{AdminApi, AdminConfigView, AdminServer};
use sniproxy::config::Config;
use sniproxy::handler::{ConnectionHandler, HandlerConfig};
use sniproxy::policy::AddressPolicy;
use sniproxy::ratelimit::RateLimiter;
use sniproxy::routes::RouteTable;
use sniproxy::server::ProxyListener;
use sniproxy::stats::Stats;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Bound for the connection drain on shutdown. Not environment-configurable.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env().context("failed to load configuration")?;

    init_tracing(&config);

    info!(
        proxy_port = config.proxy_port,
        health_port = config.health_port,
        rate_limit_per_ip = config.rate_limit_per_ip,
        "starting sniproxy"
    );

    let policy = Arc::new(AddressPolicy::new(config.allowed_ips.clone()));
    let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit_per_ip));
    let routes = Arc::new(RouteTable::default_ubiquiti());
    let stats = Arc::new(Stats::new());

    Arc::clone(&rate_limiter).spawn_cleanup_task();

    let handler = Arc::new(ConnectionHandler::new(
        Arc::clone(&policy),
        Arc::clone(&rate_limiter),
        Arc::clone(&routes),
        Arc::clone(&stats),
        HandlerConfig {
            preread_timeout: config.preread_timeout,
            connect_timeout: config.proxy_connect_timeout,
            idle_timeout: config.proxy_timeout,
        },
    ));

    let proxy_addr = format!("0.0.0.0:{}", config.proxy_port);
    let proxy_listener = ProxyListener::bind(&proxy_addr, handler)
        .await
        .with_context(|| format!("failed to bind proxy listener on {proxy_addr}"))?;
    info!(address = %proxy_listener.local_addr()?, "proxy listener bound");

    let admin_api = AdminApi::new(
        Arc::clone(&stats),
        AdminConfigView {
            allowed_domains: routes.domains(),
            ip_filter_rules: config.allowed_ips_raw.clone(),
            port: config.proxy_port,
        },
    );
    let admin_addr = format!("0.0.0.0:{}", config.health_port)
        .parse()
        .context("invalid health port address")?;
    let admin_server = AdminServer::new(admin_api, admin_addr);

    tokio::select! {
        () = proxy_listener.run(SHUTDOWN_GRACE) => {
            info!("proxy listener exited");
        }
        res = admin_server.run() => {
            res.context("admin sidecar exited unexpectedly")?;
        }
    }

    Ok(())
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);

    if config.log_pretty {
        subscriber.pretty().init();
    } else {
        subscriber.json().init();
    }
}
