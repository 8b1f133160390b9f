//! Read-only HTTP/WebSocket console: serves the dashboard and exposes the
//! telemetry snapshot the core publishes. Never touches the clock or the
//! SNTP socket — `Arc<RwLock<Snapshot>>` is the only thing it reads.

use crate::packet::NtpTimestamp;
use crate::telemetry::Snapshot;
use crate::timeval::Timeval;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Html,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::sync::{Arc, RwLock};
use tokio::time::{sleep, Duration};
use tracing::{error, info};

#[derive(Clone)]
struct WebServerState {
    telemetry: Arc<RwLock<Snapshot>>,
}

pub struct WebServer {
    bind_addr: String,
    telemetry: Arc<RwLock<Snapshot>>,
}

impl WebServer {
    pub fn new(bind_addr: String, telemetry: Arc<RwLock<Snapshot>>) -> Self {
        WebServer { bind_addr, telemetry }
    }

    /// Runs the console on its own thread with a dedicated Tokio runtime,
    /// leaving the core's single-threaded event loop untouched.
    pub fn start(self) -> std::thread::JoinHandle<()> {
        info!("starting web console on {}", self.bind_addr);
        std::thread::spawn(move || {
            let runtime = tokio::runtime::Runtime::new().expect("failed to start web console runtime");
            runtime.block_on(async move {
                if let Err(e) = self.run().await {
                    error!("web console error: {:#}", e);
                }
            });
        })
    }

    async fn run(self) -> anyhow::Result<()> {
        let state = WebServerState { telemetry: self.telemetry };

        let app = Router::new()
            .route("/", get(index_handler))
            .route("/api/stats", get(stats_handler))
            .route("/api/time", get(time_handler))
            .route("/ws", get(websocket_handler))
            .with_state(state);

        let listener = tokio::net::TcpListener::bind(&self.bind_addr).await?;
        info!("web console listening on {}", self.bind_addr);
        axum::serve(listener, app).await?;
        Ok(())
    }
}

async fn index_handler() -> Html<&'static str> {
    Html(include_str!("../web/index.html"))
}

async fn stats_handler(State(state): State<WebServerState>) -> Json<Snapshot> {
    Json(read_snapshot(&state))
}

#[derive(Serialize)]
struct TimeResponse {
    unix_secs: i64,
    unix_usec: i32,
    ntp_seconds: u32,
    ntp_fraction: u32,
    stratum: u8,
    synchronized: bool,
}

async fn time_handler(State(state): State<WebServerState>) -> Json<TimeResponse> {
    let snapshot = read_snapshot(&state);
    let now = Timeval::now();
    let ntp = NtpTimestamp::from_timeval(now);
    Json(TimeResponse {
        unix_secs: now.secs,
        unix_usec: now.usec,
        ntp_seconds: ntp.seconds,
        ntp_fraction: ntp.fraction,
        stratum: snapshot.stratum,
        synchronized: snapshot.clock.synchronized,
    })
}

#[axum::debug_handler]
async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<WebServerState>) -> axum::response::Response {
    ws.on_upgrade(|socket| websocket_task(socket, state))
}

/// Pushes the snapshot every 200ms. The console is a low-rate telemetry
/// surface, not a real-time clock display.
async fn websocket_task(mut socket: WebSocket, state: WebServerState) {
    loop {
        let snapshot = read_snapshot(&state);
        let json = match serde_json::to_string(&snapshot) {
            Ok(j) => j,
            Err(_) => break,
        };
        if socket.send(Message::Text(json)).await.is_err() {
            break;
        }
        sleep(Duration::from_millis(200)).await;
    }
}

fn read_snapshot(state: &WebServerState) -> Snapshot {
    state
        .telemetry
        .read()
        .map(|s| s.clone())
        .unwrap_or_default()
}
