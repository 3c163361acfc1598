mod driver;
mod gate;
mod hub;
mod intent;
mod limits;
mod runner;
mod stream;

use axum::{
    extract::{ws::Message, ws::WebSocket, ws::WebSocketUpgrade, ConnectInfo, State},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use clap::Parser;
use fin_core::approval::ApprovalRequest;
use fin_core::envelope::{self, Envelope, Frame};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::{
    fs::OpenOptions,
    io::{self, Write},
    net::SocketAddr,
    path::PathBuf,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};

use driver::ScriptedDriver;
use gate::{ApprovalGate, Resolution};
use hub::{Hub, HubConfig};
use intent::KeywordIntentParser;
use limits::TransactionLimits;
use runner::CommandRunner;
use stream::TaskStreamCoordinator;

type DemoRunner = CommandRunner<KeywordIntentParser, ScriptedDriver>;

#[derive(Clone, Debug)]
struct Config {
    addr: String,
    approval_timeout: Duration,
    ping_interval: Duration,
    stale_after: Duration,
    step_delay: Duration,
    debug: bool,
    log_dir: String,
}

#[derive(Parser, Debug)]
#[command(name = "fin-agentd")]
struct Args {
    #[arg(long, default_value = "")]
    addr: String,
    #[arg(long, default_value_t = 60)]
    approval_timeout: u64,
    #[arg(long, default_value_t = 10)]
    ping_interval: u64,
    #[arg(long, default_value_t = 30)]
    stale_seconds: u64,
    #[arg(long, default_value_t = 50)]
    step_delay_ms: u64,
    #[arg(long, default_value = "")]
    log_dir: String,
    #[arg(long, default_value_t = false)]
    debug: bool,
}

#[derive(Debug, Clone, Serialize)]
struct HistoryEntry {
    command: String,
    timestamp: DateTime<Utc>,
}

struct AppState {
    hub: Arc<Hub>,
    gate: ApprovalGate,
    runner: Arc<DemoRunner>,
    history: Mutex<Vec<HistoryEntry>>,
    started_at: DateTime<Utc>,
}

impl AppState {
    fn record_command(&self, command: &str) {
        let mut history = self
            .history
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        history.push(HistoryEntry {
            command: command.to_string(),
            timestamp: Utc::now(),
        });
    }

    fn history_snapshot(&self, limit: usize) -> (usize, Vec<HistoryEntry>) {
        let history = self
            .history
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let recent = history
            .iter()
            .rev()
            .take(limit)
            .rev()
            .cloned()
            .collect();
        (history.len(), recent)
    }
}

fn build_state(config: &Config) -> Arc<AppState> {
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Envelope>();
    let hub = Arc::new(Hub::new(HubConfig {
        ping_interval: config.ping_interval,
        stale_after: config.stale_after,
    }));

    // Single forwarder between the producers and the transport: the gate,
    // coordinator, runner, and driver only ever enqueue envelopes.
    let forwarder_hub = hub.clone();
    tokio::spawn(async move {
        while let Some(envelope) = outbound_rx.recv().await {
            forwarder_hub.broadcast(&envelope).await;
        }
    });

    let gate = ApprovalGate::new(config.approval_timeout, outbound_tx.clone());
    let coordinator = Arc::new(TaskStreamCoordinator::new(outbound_tx.clone()));
    let driver = ScriptedDriver::new(outbound_tx.clone(), config.step_delay);
    let runner = Arc::new(CommandRunner::new(
        KeywordIntentParser::new(),
        driver,
        gate.clone(),
        coordinator,
        TransactionLimits::new(),
        outbound_tx,
    ));

    Arc::new(AppState {
        hub,
        gate,
        runner,
        history: Mutex::new(Vec::new()),
        started_at: Utc::now(),
    })
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/command", post(command_handler))
        .route("/approve", post(approve_handler))
        .route("/status", get(status_handler))
        .route("/health", get(|| async { "ok" }))
        .with_state(state)
}

#[tokio::main]
async fn main() {
    let config = load_config();
    let _log_guard = init_logging(&config);
    let addr: SocketAddr = match config.addr.parse() {
        Ok(value) => value,
        Err(err) => {
            error!(event = "invalid_addr", error = %err, addr = %config.addr);
            return;
        }
    };
    if !addr.ip().is_loopback() {
        error!(event = "invalid_addr", addr = %config.addr);
        return;
    }

    let state = build_state(&config);
    state.hub.clone().start_stale_reaper();
    let app = build_router(state);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(value) => value,
        Err(err) => {
            error!(event = "bind_error", error = %err);
            return;
        }
    };

    info!(event = "agentd_start", addr = %config.addr);

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    if let Err(err) = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    {
        error!(event = "serve_error", error = %err);
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    if !addr.ip().is_loopback() {
        return axum::http::StatusCode::FORBIDDEN.into_response();
    }
    ws.on_upgrade(move |socket| async move {
        handle_socket(state, socket).await;
    })
}

async fn handle_socket(state: Arc<AppState>, socket: WebSocket) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Message>(256);
    let write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_sender.send(msg).await.is_err() {
                return;
            }
        }
    });

    let subscriber = state.hub.register(tx).await;
    state.hub.clone().start_ping(subscriber.clone());

    // Replay every still-pending approval so a reconnecting dashboard
    // converges without waiting for the polling fallback.
    let snapshot: Vec<Envelope> = state
        .gate
        .pending_requests()
        .iter()
        .map(Envelope::approval_request)
        .collect();
    state.hub.send_snapshot(&subscriber, &snapshot).await;

    while let Some(result) = ws_receiver.next().await {
        let msg = match result {
            Ok(value) => value,
            Err(err) => {
                warn!(event = "read_error", conn_id = %subscriber.conn_id, error = %err);
                break;
            }
        };
        let text = match msg {
            Message::Text(text) => text,
            Message::Binary(bytes) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => {
                    warn!(event = "message_invalid", conn_id = %subscriber.conn_id);
                    continue;
                }
            },
            Message::Close(_) => {
                info!(event = "client_close", conn_id = %subscriber.conn_id);
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {
                subscriber.touch().await;
                continue;
            }
        };
        subscriber.touch().await;
        handle_inbound(&state, &text);
    }

    state.hub.remove(&subscriber, "disconnect").await;
    drop(subscriber);
    let _ = write_task.await;
}

/// Dispatch one inbound frame. Malformed and unknown frames are logged
/// and dropped; the connection keeps going.
fn handle_inbound(state: &Arc<AppState>, text: &str) {
    let envelope = match envelope::decode(text) {
        Ok(value) => value,
        Err(err) => {
            warn!(event = "message_invalid", error = %err);
            return;
        }
    };
    match envelope.classify() {
        Ok(Frame::Approve(decision)) => {
            state.gate.resolve(&decision.request_id, decision.approved);
        }
        Ok(Frame::Command(data)) => {
            state.record_command(&data.command);
            let runner = state.runner.clone();
            tokio::spawn(async move {
                runner.run_command(&data.command).await;
            });
        }
        Ok(Frame::Unknown(kind)) => {
            warn!(event = "unknown_message", r#type = %kind);
        }
        Ok(_) => {
            // Dashboard-bound frame echoed back; nothing to do.
        }
        Err(err) => {
            warn!(event = "payload_invalid", error = %err);
        }
    }
}

#[derive(Debug, Deserialize)]
struct CommandRequest {
    command: String,
}

#[derive(Debug, Serialize)]
struct CommandResponse {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

async fn command_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CommandRequest>,
) -> Json<CommandResponse> {
    if request.command.trim().is_empty() {
        return Json(CommandResponse {
            status: "error",
            message: Some("command must not be empty".to_string()),
        });
    }
    state.record_command(&request.command);
    let runner = state.runner.clone();
    let command = request.command;
    tokio::spawn(async move {
        runner.run_command(&command).await;
    });
    Json(CommandResponse {
        status: "success",
        message: Some("command accepted".to_string()),
    })
}

#[derive(Debug, Deserialize)]
struct ApprovalDecisionRequest {
    request_id: String,
    approved: bool,
}

#[derive(Debug, Serialize)]
struct ApprovalDecisionResponse {
    status: &'static str,
    approved: bool,
}

async fn approve_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ApprovalDecisionRequest>,
) -> Json<ApprovalDecisionResponse> {
    let outcome = state.gate.resolve(&request.request_id, request.approved);
    Json(ApprovalDecisionResponse {
        status: match outcome {
            Resolution::Applied(_) => "processed",
            Resolution::NoOp => "ignored",
        },
        approved: request.approved,
    })
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    running: bool,
    started_at: DateTime<Utc>,
    commands_executed: usize,
    connected_clients: usize,
    pending_approvals: Vec<ApprovalRequest>,
    recent_history: Vec<HistoryEntry>,
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let (commands_executed, recent_history) = state.history_snapshot(5);
    Json(StatusResponse {
        running: true,
        started_at: state.started_at,
        commands_executed,
        connected_clients: state.hub.subscriber_count().await,
        pending_approvals: state.gate.pending_requests(),
        recent_history,
    })
}

fn load_config() -> Config {
    let args = Args::parse();
    Config {
        addr: resolve_addr(&args.addr),
        approval_timeout: Duration::from_secs(args.approval_timeout),
        ping_interval: Duration::from_secs(args.ping_interval),
        stale_after: Duration::from_secs(args.stale_seconds),
        step_delay: Duration::from_millis(args.step_delay_ms),
        debug: args.debug || env_true("FIN_DEBUG"),
        log_dir: resolve_log_dir(&args.log_dir),
    }
}

fn resolve_addr(addr_flag: &str) -> String {
    if !addr_flag.trim().is_empty() {
        return addr_flag.to_string();
    }
    if let Ok(value) = std::env::var("FIN_ADDR") {
        if !value.trim().is_empty() {
            return value;
        }
    }
    "127.0.0.1:8787".to_string()
}

fn resolve_log_dir(log_dir_flag: &str) -> String {
    if !log_dir_flag.trim().is_empty() {
        return log_dir_flag.to_string();
    }
    if let Ok(value) = std::env::var("FIN_LOG_DIR") {
        if !value.trim().is_empty() {
            return value;
        }
    }
    ".fin/logs".to_string()
}

fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

fn init_logging(config: &Config) -> Option<LogGuard> {
    let level = if config.debug {
        "debug".to_string()
    } else if let Ok(level) = std::env::var("FIN_LOG_LEVEL") {
        level
    } else {
        "info".to_string()
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let writer = match open_log_file(&config.log_dir) {
        Ok(log_guard) => log_guard,
        Err(err) => {
            eprintln!("log_file_error: {err}");
            LogGuard { file: None }
        }
    };
    let file = writer.file.clone();
    let make_writer = BoxMakeWriter::new(move || MultiWriter::new(file.clone()));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    Some(writer)
}

struct LogGuard {
    file: Option<Arc<Mutex<std::fs::File>>>,
}

struct MultiWriter {
    stdout: io::Stdout,
    file: Option<Arc<Mutex<std::fs::File>>>,
}

impl MultiWriter {
    fn new(file: Option<Arc<Mutex<std::fs::File>>>) -> Self {
        Self {
            stdout: io::stdout(),
            file,
        }
    }
}

impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = self.stdout.write_all(buf);
        if let Some(file) = &self.file {
            let mut file = file.lock().unwrap_or_else(PoisonError::into_inner);
            let _ = file.write_all(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = self.stdout.flush();
        if let Some(file) = &self.file {
            let mut file = file.lock().unwrap_or_else(PoisonError::into_inner);
            let _ = file.flush();
        }
        Ok(())
    }
}

fn open_log_file(log_dir: &str) -> io::Result<LogGuard> {
    if log_dir.trim().is_empty() {
        return Ok(LogGuard { file: None });
    }
    let dir = PathBuf::from(log_dir);
    if std::fs::create_dir_all(&dir).is_err() {
        return Ok(LogGuard { file: None });
    }
    let path = dir.join("fin-agentd.log");
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(LogGuard {
        file: Some(Arc::new(Mutex::new(file))),
    })
}

#[cfg(test)]
mod server_tests {
    use super::*;
    use fin_core::approval::{ApprovalStatus, RiskLevel};
    use serde_json::json;
    use tokio::net::TcpStream;
    use tokio_tungstenite::{
        connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream,
    };

    type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

    fn test_config(approval_timeout: Duration) -> Config {
        Config {
            addr: "127.0.0.1:0".to_string(),
            approval_timeout,
            ping_interval: Duration::from_secs(10),
            stale_after: Duration::from_secs(30),
            step_delay: Duration::from_millis(1),
            debug: false,
            log_dir: String::new(),
        }
    }

    async fn spawn_server(approval_timeout: Duration) -> (SocketAddr, Arc<AppState>) {
        let state = build_state(&test_config(approval_timeout));
        let app = build_router(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .unwrap();
        });
        (addr, state)
    }

    async fn connect(addr: SocketAddr) -> WsClient {
        let (ws, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
        ws
    }

    async fn next_envelope(ws: &mut WsClient) -> Envelope {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("frame within deadline")
                .expect("stream open")
                .expect("read ok");
            if let WsMessage::Text(text) = msg {
                return envelope::decode(&text).expect("decodable frame");
            }
        }
    }

    async fn next_frame_of_kind(ws: &mut WsClient, kind: &str) -> Envelope {
        loop {
            let envelope = next_envelope(ws).await;
            if envelope.kind == kind {
                return envelope;
            }
        }
    }

    #[tokio::test]
    async fn approval_flow_end_to_end() {
        let (addr, state) = spawn_server(Duration::from_secs(60)).await;
        let mut ws = connect(addr).await;

        let command = Envelope::command("transfer 5000 to Mom");
        ws.send(WsMessage::Text(command.to_text().unwrap()))
            .await
            .unwrap();

        let request = next_frame_of_kind(&mut ws, "approval_request").await;
        let request_id = match request.classify().unwrap() {
            Frame::ApprovalRequest(data) => {
                assert!(data.action.contains("₹5,000.00"));
                assert!(data.action.contains("Mom"));
                assert_eq!(data.risk_level, RiskLevel::High);
                data.id
            }
            other => panic!("expected approval request, got {other:?}"),
        };
        assert_eq!(state.gate.pending_count(), 1);

        let approve = Envelope::approve(&request_id, true);
        ws.send(WsMessage::Text(approve.to_text().unwrap()))
            .await
            .unwrap();

        let resolution = next_frame_of_kind(&mut ws, "success").await;
        match resolution.classify().unwrap() {
            Frame::Success { decision, .. } => {
                let decision = decision.expect("decision rider");
                assert_eq!(decision.id, request_id);
                assert_eq!(decision.status, ApprovalStatus::Approved);
            }
            other => panic!("expected success frame, got {other:?}"),
        }

        // Final task event is terminal.
        loop {
            let update = next_frame_of_kind(&mut ws, "task_update").await;
            if let Frame::TaskUpdate(event) = update.classify().unwrap() {
                if event.status.is_terminal() {
                    assert_eq!(event.status, fin_core::task::TaskState::Completed);
                    break;
                }
            }
        }

        // Redelivered decision is absorbed server-side.
        let duplicate = Envelope::approve(&request_id, false);
        ws.send(WsMessage::Text(duplicate.to_text().unwrap()))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(state.gate.history().len(), 1);
        assert_eq!(state.gate.history()[0].status, ApprovalStatus::Approved);
    }

    #[tokio::test]
    async fn reconnect_receives_pending_snapshot() {
        let (addr, state) = spawn_server(Duration::from_secs(60)).await;
        let ticket = state.gate.propose(
            "Pay ₹1,500.00 to Adani Power",
            RiskLevel::High,
            "pay_bill is a gated action and requires operator approval",
            json!({"amount": 1500.0}),
        );
        let pending_id = ticket.id().to_string();

        // A dashboard connecting after the proposal still sees it.
        let mut ws = connect(addr).await;
        let request = next_frame_of_kind(&mut ws, "approval_request").await;
        match request.classify().unwrap() {
            Frame::ApprovalRequest(data) => assert_eq!(data.id, pending_id),
            other => panic!("expected approval request, got {other:?}"),
        }

        state.gate.resolve(&pending_id, false);
        assert_eq!(ticket.wait().await, ApprovalStatus::Denied);
    }

    #[tokio::test]
    async fn http_surface_accepts_commands_and_absorbs_stale_decisions() {
        let (addr, state) = spawn_server(Duration::from_secs(60)).await;
        let client = reqwest::Client::new();
        let base = format!("http://{addr}");

        let accepted: serde_json::Value = client
            .post(format!("{base}/command"))
            .json(&json!({"command": "check my balance"}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(accepted["status"], "success");

        let rejected: serde_json::Value = client
            .post(format!("{base}/command"))
            .json(&json!({"command": "   "}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(rejected["status"], "error");

        let ignored: serde_json::Value = client
            .post(format!("{base}/approve"))
            .json(&json!({"request_id": "APR-9999", "approved": true}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(ignored["status"], "ignored");

        // The status endpoint reflects recorded commands and the derived
        // pending set.
        let mut commands_executed = 0;
        for _ in 0..50 {
            let status: serde_json::Value = client
                .get(format!("{base}/status"))
                .send()
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
            commands_executed = status["commands_executed"].as_u64().unwrap_or(0);
            if commands_executed >= 1 {
                assert_eq!(
                    status["pending_approvals"].as_array().unwrap().len(),
                    state.gate.pending_count()
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(commands_executed >= 1);
    }
}
