/// Health check HTTP endpoint
/// Exposes poll-loop state on /health, /ready and /metrics for monitoring systems

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::watch::EntityClass;

/// Timeout for reading HTTP request (prevents slow-loris attacks)
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Online/total counts for one entity class from its last successful fetch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClassCounts {
    pub online: u64,
    pub total: u64,
}

/// Point-in-time copy of the poll metrics
#[derive(Debug, Clone)]
pub struct PollStatus {
    pub cycles_ok: u64,
    pub cycles_failed: u64,
    pub notifications_sent: u64,
    pub notifications_failed: u64,
    /// Unix epoch seconds, 0 before the first cycle
    pub last_cycle_time: u64,
    pub last_cycle_ok: bool,
    pub peers: ClassCounts,
    pub providers: ClassCounts,
}

impl Default for PollStatus {
    fn default() -> Self {
        Self {
            cycles_ok: 0,
            cycles_failed: 0,
            notifications_sent: 0,
            notifications_failed: 0,
            last_cycle_time: 0,
            last_cycle_ok: true,
            peers: ClassCounts::default(),
            providers: ClassCounts::default(),
        }
    }
}

#[derive(Debug, Default)]
struct AtomicCounts {
    online: AtomicU64,
    total: AtomicU64,
}

impl AtomicCounts {
    fn load(&self) -> ClassCounts {
        ClassCounts {
            online: self.online.load(Ordering::Relaxed),
            total: self.total.load(Ordering::Relaxed),
        }
    }
}

/// Shared metrics written by the poll loop and read by the health server.
///
/// The poll loop is the only writer; readers may see a cycle half-recorded,
/// which is fine for monitoring.
#[derive(Debug)]
pub struct PollMetrics {
    cycles_ok: AtomicU64,
    cycles_failed: AtomicU64,
    notifications_sent: AtomicU64,
    notifications_failed: AtomicU64,
    last_cycle_time: AtomicU64,
    last_cycle_ok: AtomicBool,
    peers: AtomicCounts,
    providers: AtomicCounts,
}

impl Default for PollMetrics {
    fn default() -> Self {
        Self {
            cycles_ok: AtomicU64::new(0),
            cycles_failed: AtomicU64::new(0),
            notifications_sent: AtomicU64::new(0),
            notifications_failed: AtomicU64::new(0),
            last_cycle_time: AtomicU64::new(0),
            last_cycle_ok: AtomicBool::new(true), // healthy until proven otherwise
            peers: AtomicCounts::default(),
            providers: AtomicCounts::default(),
        }
    }
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

impl PollMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a cycle where every class was fetched
    pub fn record_cycle_ok(&self) {
        self.cycles_ok.fetch_add(1, Ordering::Relaxed);
        self.last_cycle_time.store(unix_now(), Ordering::Relaxed);
        self.last_cycle_ok.store(true, Ordering::Relaxed);
    }

    /// Record a cycle where at least one class fetch failed
    pub fn record_cycle_failed(&self) {
        self.cycles_failed.fetch_add(1, Ordering::Relaxed);
        self.last_cycle_time.store(unix_now(), Ordering::Relaxed);
        self.last_cycle_ok.store(false, Ordering::Relaxed);
    }

    pub fn record_entities(&self, class: EntityClass, online: usize, total: usize) {
        let counts = match class {
            EntityClass::Peer => &self.peers,
            EntityClass::Provider => &self.providers,
        };
        counts.online.store(online as u64, Ordering::Relaxed);
        counts.total.store(total as u64, Ordering::Relaxed);
    }

    pub fn record_notification(&self, delivered: bool) {
        if delivered {
            self.notifications_sent.fetch_add(1, Ordering::Relaxed);
        } else {
            self.notifications_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn status(&self) -> PollStatus {
        PollStatus {
            cycles_ok: self.cycles_ok.load(Ordering::Relaxed),
            cycles_failed: self.cycles_failed.load(Ordering::Relaxed),
            notifications_sent: self.notifications_sent.load(Ordering::Relaxed),
            notifications_failed: self.notifications_failed.load(Ordering::Relaxed),
            last_cycle_time: self.last_cycle_time.load(Ordering::Relaxed),
            last_cycle_ok: self.last_cycle_ok.load(Ordering::Relaxed),
            peers: self.peers.load(),
            providers: self.providers.load(),
        }
    }
}

/// Run the health check HTTP server
pub async fn run_health_server(port: u16, metrics: Arc<PollMetrics>, cancel_token: CancellationToken) {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    let listener = match TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind health check server on port {}: {}", port, e);
            return;
        }
    };

    info!("Health check server listening on http://0.0.0.0:{}/health", port);
    serve(listener, metrics, cancel_token).await;
}

/// Accept loop on an already-bound listener
pub async fn serve(listener: TcpListener, metrics: Arc<PollMetrics>, cancel_token: CancellationToken) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((mut socket, peer_addr)) => {
                        let metrics = metrics.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_request(&mut socket, &metrics).await {
                                debug!("Error handling request from {}: {}", peer_addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        warn!("Failed to accept connection: {}", e);
                    }
                }
            }
            _ = cancel_token.cancelled() => {
                info!("Health check server shutting down");
                break;
            }
        }
    }
}

async fn handle_request(socket: &mut tokio::net::TcpStream, metrics: &PollMetrics) -> std::io::Result<()> {
    let mut buf = [0u8; 1024];

    let n = match timeout(REQUEST_TIMEOUT, socket.read(&mut buf)).await {
        Ok(result) => result?,
        Err(_) => {
            debug!("Request timeout after {:?}", REQUEST_TIMEOUT);
            return Ok(());
        }
    };

    if n == 0 {
        return Ok(());
    }

    let request = String::from_utf8_lossy(&buf[..n]);
    let path = request
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or("/");

    let response = route(path, &metrics.status());

    socket.write_all(response.as_bytes()).await?;
    socket.flush().await?;

    Ok(())
}

fn route(path: &str, status: &PollStatus) -> String {
    match path {
        "/health" | "/healthz" | "/health/" => build_health_response(status),
        // Ready during the startup grace period, then tracks the last cycle
        "/ready" | "/readyz" | "/ready/" => {
            build_ready_response(status.last_cycle_ok || status.last_cycle_time == 0)
        }
        "/metrics" => build_metrics_response(status),
        _ => build_not_found_response(),
    }
}

fn http_response(code: u16, reason: &str, content_type: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        code,
        reason,
        content_type,
        body.len(),
        body
    )
}

fn build_health_response(status: &PollStatus) -> String {
    let body = format!(
        r#"{{"status":"healthy","cycles_ok":{},"cycles_failed":{},"notifications_sent":{},"notifications_failed":{},"last_cycle_time":{},"last_cycle_ok":{},"peers_online":{},"peers_total":{},"providers_online":{},"providers_total":{}}}"#,
        status.cycles_ok,
        status.cycles_failed,
        status.notifications_sent,
        status.notifications_failed,
        status.last_cycle_time,
        status.last_cycle_ok,
        status.peers.online,
        status.peers.total,
        status.providers.online,
        status.providers.total,
    );
    http_response(200, "OK", "application/json", &body)
}

fn build_ready_response(ready: bool) -> String {
    if ready {
        http_response(200, "OK", "application/json", r#"{"ready":true}"#)
    } else {
        http_response(503, "Service Unavailable", "application/json", r#"{"ready":false}"#)
    }
}

fn build_metrics_response(status: &PollStatus) -> String {
    // Prometheus text exposition format
    let body = format!(
        "# HELP pbxwatch_cycles_total Poll cycles by outcome\n\
         # TYPE pbxwatch_cycles_total counter\n\
         pbxwatch_cycles_total{{result=\"success\"}} {}\n\
         pbxwatch_cycles_total{{result=\"failure\"}} {}\n\
         # HELP pbxwatch_notifications_total Change notifications by delivery outcome\n\
         # TYPE pbxwatch_notifications_total counter\n\
         pbxwatch_notifications_total{{result=\"sent\"}} {}\n\
         pbxwatch_notifications_total{{result=\"failed\"}} {}\n\
         # HELP pbxwatch_last_cycle_timestamp Unix timestamp of the last poll cycle\n\
         # TYPE pbxwatch_last_cycle_timestamp gauge\n\
         pbxwatch_last_cycle_timestamp {}\n\
         # HELP pbxwatch_last_cycle_ok Whether the last poll cycle succeeded (1) or failed (0)\n\
         # TYPE pbxwatch_last_cycle_ok gauge\n\
         pbxwatch_last_cycle_ok {}\n\
         # HELP pbxwatch_entities_online Entities currently online\n\
         # TYPE pbxwatch_entities_online gauge\n\
         pbxwatch_entities_online{{class=\"peers\"}} {}\n\
         pbxwatch_entities_online{{class=\"providers\"}} {}\n\
         # HELP pbxwatch_entities_total Entities reported by the PBX\n\
         # TYPE pbxwatch_entities_total gauge\n\
         pbxwatch_entities_total{{class=\"peers\"}} {}\n\
         pbxwatch_entities_total{{class=\"providers\"}} {}\n",
        status.cycles_ok,
        status.cycles_failed,
        status.notifications_sent,
        status.notifications_failed,
        status.last_cycle_time,
        if status.last_cycle_ok { 1 } else { 0 },
        status.peers.online,
        status.providers.online,
        status.peers.total,
        status.providers.total,
    );
    http_response(200, "OK", "text/plain; version=0.0.4", &body)
}

fn build_not_found_response() -> String {
    http_response(404, "Not Found", "application/json", r#"{"error":"Not Found"}"#)
}
