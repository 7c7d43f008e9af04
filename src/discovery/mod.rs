//! HTTP discovery endpoint
//!
//! A small HTTP/1.1 surface that lets clients on the LAN find the
//! WebSocket endpoint: `/discover` returns the advertised URL and
//! capabilities, `/health` a liveness snapshot, `/` an endpoint index.
//! CORS-open, GET-only, pretty-printed JSON.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::netinfo::{websocket_url, NetworkInfo};
use crate::protocol::{now_millis, DISCOVERY_CAPABILITIES, PROTOCOL_VERSION, SERVER_NAME};

const AVAILABLE_ENDPOINTS: [&str; 3] = ["/discover", "/health", "/"];

/// What the endpoint advertises
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// HTTP port to bind on all interfaces
    pub port: u16,
    /// Service name surfaced in /discover
    pub service_name: String,
    /// Advertised WebSocket port
    pub websocket_port: u16,
    /// Network snapshot taken at service start
    pub network: NetworkInfo,
}

/// Discovery endpoint error types
#[derive(Debug)]
pub enum DiscoveryError {
    /// `start()` called while already serving
    AlreadyRunning,
    /// Failed to bind the listener
    Bind(std::io::Error),
}

impl std::fmt::Display for DiscoveryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiscoveryError::AlreadyRunning => write!(f, "discovery endpoint already running"),
            DiscoveryError::Bind(e) => write!(f, "failed to bind discovery listener: {}", e),
        }
    }
}

impl std::error::Error for DiscoveryError {}

struct DiscoveryState {
    config: DiscoveryConfig,
    started_at: Instant,
}

/// The discovery HTTP server
pub struct DiscoveryServer {
    state: Arc<DiscoveryState>,
    listener_task: Mutex<Option<JoinHandle<()>>>,
    running: AtomicBool,
}

impl DiscoveryServer {
    pub fn new(config: DiscoveryConfig) -> Self {
        Self {
            state: Arc::new(DiscoveryState {
                config,
                started_at: Instant::now(),
            }),
            listener_task: Mutex::new(None),
            running: AtomicBool::new(false),
        }
    }

    pub async fn start(&self) -> Result<(), DiscoveryError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(DiscoveryError::AlreadyRunning);
        }
        let listener = match TcpListener::bind(("0.0.0.0", self.state.config.port)).await {
            Ok(l) => l,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(DiscoveryError::Bind(e));
            }
        };
        info!(
            "Discovery endpoint listening on http://0.0.0.0:{}/discover",
            self.state.config.port
        );

        let state = self.state.clone();
        let task = tokio::spawn(async move {
            loop {
                let (stream, addr) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("Failed to accept discovery connection: {}", e);
                        continue;
                    }
                };
                debug!("Discovery request from {}", addr);
                let io = TokioIo::new(stream);
                let state = state.clone();

                tokio::spawn(async move {
                    let service = service_fn(move |req| {
                        let state = state.clone();
                        async move { handle_request(req, state).await }
                    });

                    if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                        debug!("Error serving discovery connection: {:?}", err);
                    }
                });
            }
        });
        *self.listener_task.lock() = Some(task);
        Ok(())
    }

    /// Stop serving. Idempotent.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.listener_task.lock().take() {
            task.abort();
        }
        info!("Discovery endpoint stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn port(&self) -> u16 {
        self.state.config.port
    }
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    state: Arc<DiscoveryState>,
) -> Result<Response<Full<Bytes>>, std::convert::Infallible> {
    if req.method() == Method::OPTIONS {
        return Ok(cors(Response::builder().status(StatusCode::OK))
            .body(Full::new(Bytes::new()))
            .unwrap());
    }

    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/discover") => discover_response(&state),
        (&Method::GET, "/health") => json_response(
            StatusCode::OK,
            &json!({
                "status": "healthy",
                "timestamp": now_millis(),
                "service": state.config.service_name,
                "version": PROTOCOL_VERSION,
                "uptime_seconds": state.started_at.elapsed().as_secs(),
            }),
        ),
        (&Method::GET, "/") => json_response(
            StatusCode::OK,
            &json!({
                "service": state.config.service_name,
                "version": PROTOCOL_VERSION,
                "endpoints": AVAILABLE_ENDPOINTS,
                "websocket_port": state.config.websocket_port,
            }),
        ),
        (_, path) => json_response(
            StatusCode::NOT_FOUND,
            &json!({
                "error": "Not found",
                "path": path,
                "available_endpoints": AVAILABLE_ENDPOINTS,
            }),
        ),
    };
    Ok(response)
}

fn discover_response(state: &DiscoveryState) -> Response<Full<Bytes>> {
    match state.config.network.primary_ip() {
        Some(ip) => json_response(
            StatusCode::OK,
            &json!({
                "name": state.config.service_name,
                "websocket_url": websocket_url(&ip.to_string(), state.config.websocket_port),
                "version": PROTOCOL_VERSION,
                "platform": std::env::consts::OS,
                "app": SERVER_NAME,
                "capabilities": DISCOVERY_CAPABILITIES,
            }),
        ),
        None => json_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            &json!({
                "error": "Network unavailable",
                "message": "Primary IP address could not be determined",
            }),
        ),
    }
}

fn json_response(status: StatusCode, body: &Value) -> Response<Full<Bytes>> {
    let pretty = serde_json::to_string_pretty(body).unwrap_or_else(|_| "{}".to_string());
    cors(Response::builder()
        .status(status)
        .header("Content-Type", "application/json"))
    .body(Full::new(Bytes::from(pretty)))
    .unwrap()
}

fn cors(builder: hyper::http::response::Builder) -> hyper::http::response::Builder {
    builder
        .header("Access-Control-Allow-Origin", "*")
        .header("Access-Control-Allow-Methods", "GET, OPTIONS")
        .header("Access-Control-Allow-Headers", "*")
}
