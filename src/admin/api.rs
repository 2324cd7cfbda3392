//! JSON handlers for the observability sidecar: `/health`, `/`, `/ready`,
//! and `/stats`, plus a 404 fallback.

use crate::stats::Stats;
use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};
use serde::Serialize;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Static, immutable-after-startup facts the `/stats` response's `config`
/// section reports back to the caller.
pub struct AdminConfigView {
    pub allowed_domains: Vec<String>,
    pub ip_filter_rules: String,
    pub port: u16,
}

pub struct AdminApi {
    stats: Arc<Stats>,
    config: AdminConfigView,
}

impl AdminApi {
    pub fn new(stats: Arc<Stats>, config: AdminConfigView) -> Self {
        Self { stats, config }
    }

    pub async fn handle(&self, req: Request<Incoming>) -> Response<BoxBody<Bytes, hyper::Error>> {
        match (req.method().as_str(), req.uri().path()) {
            ("GET", "/health") | ("GET", "/") => self.health(),
            ("GET", "/ready") => self.ready(),
            ("GET", "/stats") => self.stats(),
            _ => self.not_found(),
        }
    }

    fn health(&self) -> Response<BoxBody<Bytes, hyper::Error>> {
        #[derive(Serialize)]
        struct Health {
            status: &'static str,
            timestamp: u64,
            service: &'static str,
            version: &'static str,
        }
        self.json_response(&Health {
            status: "ok",
            timestamp: now_millis(),
            service: "sniproxy",
            version: env!("CARGO_PKG_VERSION"),
        })
    }

    fn ready(&self) -> Response<BoxBody<Bytes, hyper::Error>> {
        #[derive(Serialize)]
        struct Ready {
            ready: bool,
            timestamp: u64,
        }
        self.json_response(&Ready {
            ready: true,
            timestamp: now_millis(),
        })
    }

    fn stats(&self) -> Response<BoxBody<Bytes, hyper::Error>> {
        #[derive(Serialize)]
        struct Uptime {
            ms: u64,
            human: String,
        }
        #[derive(Serialize)]
        struct Connections {
            total: u64,
            active: u64,
            successful: u64,
            failed: u64,
        }
        #[derive(Serialize)]
        struct ConfigView<'a> {
            #[serde(rename = "allowedDomains")]
            allowed_domains: &'a [String],
            #[serde(rename = "ipFilterRules")]
            ip_filter_rules: &'a str,
            port: u16,
        }
        #[derive(Serialize)]
        struct Envelope<'a> {
            status: &'static str,
            timestamp: u64,
            stats: StatsBodyOwned,
            config: ConfigView<'a>,
        }
        #[derive(Serialize)]
        struct StatsBodyOwned {
            uptime: Uptime,
            connections: Connections,
            domains: std::collections::HashMap<String, u64>,
            #[serde(rename = "topIPs")]
            top_ips: Vec<crate::stats::TopSource>,
        }

        let snap = self.stats.snapshot();

        let body = Envelope {
            status: "ok",
            timestamp: now_millis(),
            stats: StatsBodyOwned {
                uptime: Uptime {
                    ms: snap.uptime_ms,
                    human: humanize_ms(snap.uptime_ms),
                },
                connections: Connections {
                    total: snap.total,
                    active: snap.active,
                    successful: snap.successful,
                    failed: snap.failed,
                },
                domains: snap.domains,
                top_ips: snap.top_ips,
            },
            config: ConfigView {
                allowed_domains: &self.config.allowed_domains,
                ip_filter_rules: &self.config.ip_filter_rules,
                port: self.config.port,
            },
        };

        self.json_response(&body)
    }

    fn not_found(&self) -> Response<BoxBody<Bytes, hyper::Error>> {
        #[derive(Serialize)]
        struct NotFound {
            error: &'static str,
            #[serde(rename = "availableEndpoints")]
            available_endpoints: [&'static str; 4],
        }
        let body = NotFound {
            error: "Not found",
            available_endpoints: ["/health", "/", "/ready", "/stats"],
        };
        let json = serde_json::to_string(&body)
            .unwrap_or_else(|_| r#"{"error":"Not found"}"#.to_string());
        Response::builder()
            .status(StatusCode::NOT_FOUND)
            .header("content-type", "application/json")
            .header("access-control-allow-origin", "*")
            .body(Self::full_body(json))
            .unwrap()
    }

    fn json_response<T: Serialize>(&self, data: &T) -> Response<BoxBody<Bytes, hyper::Error>> {
        match serde_json::to_string(data) {
            Ok(json) => Response::builder()
                .status(StatusCode::OK)
                .header("content-type", "application/json")
                .header("access-control-allow-origin", "*")
                .body(Self::full_body(json))
                .unwrap(),
            Err(_) => Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .header("content-type", "application/json")
                .header("access-control-allow-origin", "*")
                .body(Self::full_body(r#"{"error":"serialization failed"}"#))
                .unwrap(),
        }
    }

    #[inline]
    fn full_body<T: Into<Bytes>>(content: T) -> BoxBody<Bytes, hyper::Error> {
        Full::new(content.into()).map_err(|never| match never {}).boxed()
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn humanize_ms(ms: u64) -> String {
    let total_secs = ms / 1000;
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    format!("{hours}h{minutes}m{seconds}s")
}
