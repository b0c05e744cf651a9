//! Prometheus metrics for the server (RED: Rate, Errors, Duration).

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{error, info};

/// Upper bounds of the duration histogram buckets, in seconds. +Inf is the count.
const DURATION_BUCKETS: [f64; 11] = [0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

/// Operations tracked per label. Anything else is counted as "other".
const OPS: [&str; 10] = [
    "bind", "unbind", "search", "add", "modify", "delete", "modify_dn", "compare", "abandon", "extended",
];

#[derive(Debug, Default)]
struct DurationHistogram {
    buckets: [AtomicU64; 11],
    count: AtomicU64,
    sum_micros: AtomicU64,
}

impl DurationHistogram {
    fn observe(&self, duration: Duration) {
        let micros = duration.as_micros().min(u64::MAX as u128) as u64;
        let secs = duration.as_secs_f64();
        // Non-cumulative storage: only the first bucket with secs <= le.
        if let Some(i) = DURATION_BUCKETS.iter().position(|&le| secs <= le) {
            self.buckets[i].fetch_add(1, Ordering::Relaxed);
        }
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_micros.fetch_add(micros, Ordering::Relaxed);
    }
}

#[derive(Debug, Default)]
struct OpCounters {
    requests: AtomicU64,
    errors: AtomicU64,
    duration: DurationHistogram,
}

/// Lock-free counters shared by every connection task.
#[derive(Debug, Default)]
pub struct Metrics {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    /// PDUs that were valid BER but not a valid request, plus malformed BER.
    pub parse_errors: AtomicU64,
    pub binds_failed: AtomicU64,
    ops: [OpCounters; OPS.len()],
    errors_other: AtomicU64,
    ready: AtomicBool,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn op(&self, op: &str) -> Option<&OpCounters> {
        OPS.iter().position(|o| *o == op).map(|i| &self.ops[i])
    }

    #[inline]
    pub fn inc_connections(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn dec_active_connections(&self) {
        self.connections_active.fetch_sub(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_request(&self, op: &str) {
        if let Some(c) = self.op(op) {
            c.requests.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Call once per handled request, whatever its outcome.
    #[inline]
    pub fn observe_duration(&self, op: &str, duration: Duration) {
        if let Some(c) = self.op(op) {
            c.duration.observe(duration);
        }
    }

    #[inline]
    pub fn inc_parse_error(&self) {
        self.parse_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_bind_failure(&self) {
        self.binds_failed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_error(&self, op: &str) {
        match self.op(op) {
            Some(c) => c.errors.fetch_add(1, Ordering::Relaxed),
            None => self.errors_other.fetch_add(1, Ordering::Relaxed),
        };
    }

    /// Flipped by the server once its listener is bound.
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Relaxed);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    /// Prometheus text exposition format.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str("# HELP ldap_connections_total Total number of client connections accepted.\n");
        out.push_str("# TYPE ldap_connections_total counter\n");
        out.push_str(&format!(
            "ldap_connections_total {}\n",
            self.connections_total.load(Ordering::Relaxed)
        ));

        out.push_str("# HELP ldap_connections_active Client connections currently open.\n");
        out.push_str("# TYPE ldap_connections_active gauge\n");
        out.push_str(&format!(
            "ldap_connections_active {}\n",
            self.connections_active.load(Ordering::Relaxed)
        ));

        out.push_str("# HELP ldap_parse_errors_total Total number of LDAP message parse errors (invalid BER / not a request).\n");
        out.push_str("# TYPE ldap_parse_errors_total counter\n");
        out.push_str(&format!("ldap_parse_errors_total {}\n", self.parse_errors.load(Ordering::Relaxed)));

        out.push_str("# HELP ldap_binds_failed_total Bind requests rejected by the authorizer or bind strategy.\n");
        out.push_str("# TYPE ldap_binds_failed_total counter\n");
        out.push_str(&format!("ldap_binds_failed_total {}\n", self.binds_failed.load(Ordering::Relaxed)));

        out.push_str("# HELP ldap_requests_total Total LDAP requests by operation.\n");
        out.push_str("# TYPE ldap_requests_total counter\n");
        for (op, c) in OPS.iter().zip(&self.ops) {
            out.push_str(&format!(
                "ldap_requests_total{{op=\"{}\"}} {}\n",
                op,
                c.requests.load(Ordering::Relaxed)
            ));
        }

        out.push_str("# HELP ldap_errors_total Total errors by operation.\n");
        out.push_str("# TYPE ldap_errors_total counter\n");
        for (op, c) in OPS.iter().zip(&self.ops) {
            out.push_str(&format!(
                "ldap_errors_total{{op=\"{}\"}} {}\n",
                op,
                c.errors.load(Ordering::Relaxed)
            ));
        }
        out.push_str(&format!(
            "ldap_errors_total{{op=\"other\"}} {}\n",
            self.errors_other.load(Ordering::Relaxed)
        ));

        out.push_str("# HELP ldap_request_duration_seconds Request duration in seconds by operation.\n");
        out.push_str("# TYPE ldap_request_duration_seconds histogram\n");
        for (op, c) in OPS.iter().zip(&self.ops) {
            let hist = &c.duration;
            let count = hist.count.load(Ordering::Relaxed);
            let mut cum = 0u64;
            for (i, &le) in DURATION_BUCKETS.iter().enumerate() {
                cum += hist.buckets[i].load(Ordering::Relaxed);
                out.push_str(&format!(
                    "ldap_request_duration_seconds_bucket{{op=\"{}\",le=\"{}\"}} {}\n",
                    op, le, cum
                ));
            }
            out.push_str(&format!(
                "ldap_request_duration_seconds_bucket{{op=\"{}\",le=\"+Inf\"}} {}\n",
                op, count
            ));
            let sum_secs = hist.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0;
            out.push_str(&format!("ldap_request_duration_seconds_sum{{op=\"{}\"}} {}\n", op, sum_secs));
            out.push_str(&format!("ldap_request_duration_seconds_count{{op=\"{}\"}} {}\n", op, count));
        }

        out
    }
}

/// Body of GET /ready.
#[derive(Serialize)]
struct ReadyBody {
    ready: bool,
    connections_active: u64,
}

/// Path from the HTTP request line ("GET /health HTTP/1.1" -> "/health").
fn request_path(first_line: &str) -> &str {
    let mut parts = first_line.trim().split_ascii_whitespace();
    let _method = parts.next();
    let path = parts.next().unwrap_or("");
    if path.starts_with('/') {
        path
    } else {
        ""
    }
}

fn respond(path: &str, metrics: &Metrics) -> (&'static str, String, &'static str) {
    match path {
        "/health" => ("200 OK", "ok".to_string(), "text/plain; charset=utf-8"),
        "/ready" => {
            let ready = metrics.is_ready();
            let body = serde_json::to_string(&ReadyBody {
                ready,
                connections_active: metrics.connections_active.load(Ordering::Relaxed),
            })
            .unwrap_or_else(|_| r#"{"ready":false,"error":"serialize"}"#.to_string());
            let status = if ready { "200 OK" } else { "503 Service Unavailable" };
            (status, body, "application/json")
        }
        "/metrics" => ("200 OK", metrics.render(), "text/plain; charset=utf-8"),
        _ => (
            "404 Not Found",
            "Not found. Supported: GET /metrics, GET /health, GET /ready.\n".to_string(),
            "text/plain; charset=utf-8",
        ),
    }
}

/// HTTP endpoints GET /metrics, GET /health (liveness) and GET /ready
/// (200 once the LDAP listener is bound, 503 before).
pub async fn run_metrics_server(addr: &str, metrics: Arc<Metrics>) -> Result<()> {
    let socket_addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("Invalid metrics listen address: {}", addr))?;

    let listener = TcpListener::bind(&socket_addr)
        .await
        .with_context(|| format!("Failed to bind metrics server to {}", socket_addr))?;

    info!("Metrics server listening on http://{} (GET /metrics, /health, /ready)", socket_addr);

    loop {
        let (mut stream, _peer) = match listener.accept().await {
            Ok(accept) => accept,
            Err(e) => {
                error!("Metrics accept error: {}", e);
                continue;
            }
        };

        let metrics = Arc::clone(&metrics);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            let mut total = 0usize;
            loop {
                match stream.read(&mut buf[total..]).await {
                    Ok(0) => break,
                    Ok(n) => {
                        total += n;
                        if buf[..total].windows(4).any(|w| w == b"\r\n\r\n") || total >= buf.len() {
                            break;
                        }
                    }
                    Err(_) => return,
                }
            }

            let request = String::from_utf8_lossy(&buf[..total]);
            let path = request.lines().next().map(request_path).unwrap_or("");
            let (status, body, content_type) = respond(path, &metrics);
            let response = format!(
                "HTTP/1.1 {}\r\nContent-Type: {}\r\nConnection: close\r\nContent-Length: {}\r\n\r\n{}",
                status,
                content_type,
                body.len(),
                body
            );

            let _ = stream.write_all(response.as_bytes()).await;
            let _ = stream.shutdown().await;
        });
    }
}
