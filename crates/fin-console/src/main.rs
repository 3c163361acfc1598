mod channel;
mod projection;

use std::time::{Duration, Instant};

use channel::{
    ChannelConfig, ChannelEvent, ChannelManager, ConnectionState, Outbound,
    DEFAULT_MAX_RECONNECT_ATTEMPTS, DEFAULT_QUEUE_CAP,
};
use clap::Parser;
use fin_core::envelope::{ApprovalRequestData, Envelope};
use projection::{Applied, Projection};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use url::Url;

#[derive(Parser, Debug)]
#[command(name = "fin-console")]
struct Args {
    #[arg(long, default_value = "")]
    url: String,
    #[arg(long, default_value = "")]
    http: String,
    #[arg(long, default_value_t = 5)]
    poll_interval: u64,
    #[arg(long, default_value_t = DEFAULT_MAX_RECONNECT_ATTEMPTS)]
    max_reconnect_attempts: u32,
    #[arg(long, default_value_t = DEFAULT_QUEUE_CAP)]
    queue_cap: usize,
}

#[derive(Debug, Clone)]
struct Config {
    ws_url: Url,
    http_base: String,
    poll_interval: Duration,
    max_reconnect_attempts: u32,
    queue_cap: usize,
}

fn resolve_ws_url(flag: &str) -> String {
    if !flag.trim().is_empty() {
        return flag.to_string();
    }
    if let Ok(value) = std::env::var("FIN_CONSOLE_URL") {
        if !value.trim().is_empty() {
            return value;
        }
    }
    "ws://127.0.0.1:8787/ws".to_string()
}

fn resolve_http_base(flag: &str) -> String {
    if !flag.trim().is_empty() {
        return flag.trim_end_matches('/').to_string();
    }
    if let Ok(value) = std::env::var("FIN_CONSOLE_HTTP") {
        if !value.trim().is_empty() {
            return value.trim_end_matches('/').to_string();
        }
    }
    "http://127.0.0.1:8787".to_string()
}

fn load_config() -> anyhow::Result<Config> {
    let args = Args::parse();
    let ws_url = Url::parse(&resolve_ws_url(&args.url))?;
    Ok(Config {
        ws_url,
        http_base: resolve_http_base(&args.http),
        poll_interval: Duration::from_secs(args.poll_interval.max(1)),
        max_reconnect_attempts: args.max_reconnect_attempts,
        queue_cap: args.queue_cap,
    })
}

/// Subset of the daemon's `/status` payload the console reconciles from.
#[derive(Debug, Deserialize)]
struct StatusSnapshot {
    #[serde(default)]
    commands_executed: usize,
    #[serde(default)]
    connected_clients: usize,
    #[serde(default)]
    pending_approvals: Vec<ApprovalRequestData>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = std::env::var("FIN_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        EnvFilter::new(level)
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = load_config()?;
    info!(event = "console_start", url = %config.ws_url, http = %config.http_base);

    let mut channel_config = ChannelConfig::new(config.ws_url.clone());
    channel_config.max_reconnect_attempts = config.max_reconnect_attempts;
    channel_config.queue_cap = config.queue_cap;

    let (outbound_tx, outbound_rx) = mpsc::channel::<Outbound>(64);
    let (event_tx, mut event_rx) = mpsc::channel::<ChannelEvent>(256);
    let manager = ChannelManager::new(channel_config);
    let channel_state = manager.state_watch();
    let mut channel_task = tokio::spawn(manager.run(outbound_rx, event_tx));

    let http = reqwest::Client::new();
    let (poll_tx, mut poll_rx) = mpsc::channel::<(StatusSnapshot, Instant)>(8);
    let poller = tokio::spawn(poll_status(
        http.clone(),
        config.http_base.clone(),
        config.poll_interval,
        poll_tx,
    ));

    let mut projection = Projection::new();
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    println!("fin-console ready. Commands: run <text> | approve <id> | deny <id> | pending | status | quit");

    loop {
        tokio::select! {
            event = event_rx.recv() => match event {
                Some(ChannelEvent::Connected) => {
                    println!("* connected to agent");
                }
                Some(ChannelEvent::Frame(envelope)) => {
                    match projection.apply(&envelope) {
                        Applied::NewApproval(request) => print_approval_prompt(&request),
                        Applied::ApprovalResolved { id, status } => {
                            println!("* approval {id} is now {status}");
                        }
                        Applied::Progress => {
                            if let Some(line) = projection.activity().last() {
                                println!("  {line}");
                            }
                        }
                        Applied::Dropped => {}
                    }
                }
                Some(ChannelEvent::Disconnected { reason }) => {
                    println!("* connection lost ({reason}), retrying");
                }
                Some(ChannelEvent::Lost { attempts }) => {
                    eprintln!("* gave up after {attempts} failed connection attempts");
                    break;
                }
                None => break,
            },
            snapshot = poll_rx.recv() => {
                if let Some((snapshot, issued_at)) = snapshot {
                    for missed in projection.reconcile(&snapshot.pending_approvals, issued_at) {
                        print_approval_prompt(&missed);
                    }
                }
            }
            line = stdin.next_line() => match line {
                Ok(Some(line)) => {
                    let link = *channel_state.borrow();
                    if !handle_command(line.trim(), &http, &config.http_base, &outbound_tx, &projection, link).await {
                        break;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    warn!(event = "stdin_error", error = %err);
                    break;
                }
            },
            result = &mut channel_task => {
                if let Ok(Err(err)) = result {
                    eprintln!("* channel failed: {err}");
                }
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                println!();
                break;
            }
        }
    }

    poller.abort();
    info!(event = "console_stop");
    Ok(())
}

async fn poll_status(
    http: reqwest::Client,
    base: String,
    interval: Duration,
    poll_tx: mpsc::Sender<(StatusSnapshot, Instant)>,
) {
    let url = format!("{base}/status");
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        let issued_at = Instant::now();
        let snapshot = match http.get(&url).send().await {
            Ok(response) => response.json::<StatusSnapshot>().await,
            Err(err) => {
                warn!(event = "poll_failed", error = %err);
                continue;
            }
        };
        match snapshot {
            Ok(snapshot) => {
                if poll_tx.send((snapshot, issued_at)).await.is_err() {
                    return;
                }
            }
            Err(err) => warn!(event = "poll_decode_failed", error = %err),
        }
    }
}

fn print_approval_prompt(request: &ApprovalRequestData) {
    println!();
    println!("=== APPROVAL REQUIRED ===");
    println!("  id:     {}", request.id);
    println!("  action: {}", request.action);
    println!("  reason: {}", request.reason);
    println!("  risk:   {}", request.risk_level);
    if let Some(expires_at) = &request.expires_at {
        println!("  expires: {expires_at}");
    }
    println!("type 'approve {0}' or 'deny {0}'", request.id);
}

/// Returns false when the operator asked to quit.
async fn handle_command(
    line: &str,
    http: &reqwest::Client,
    base: &str,
    outbound_tx: &mpsc::Sender<Outbound>,
    projection: &Projection,
    link: ConnectionState,
) -> bool {
    let (verb, rest) = match line.split_once(' ') {
        Some((verb, rest)) => (verb, rest.trim()),
        None => (line, ""),
    };
    match verb {
        "" => {}
        "quit" | "exit" => return false,
        "run" => {
            if rest.is_empty() {
                println!("usage: run <command text>");
            } else {
                submit_command(http, base, outbound_tx, rest).await;
            }
        }
        "approve" | "deny" => {
            if rest.is_empty() {
                println!("usage: {verb} <request id>");
            } else {
                send_decision(http, base, outbound_tx, rest, verb == "approve").await;
            }
        }
        "pending" => {
            let pending = projection.pending();
            if pending.is_empty() {
                println!("no pending approvals");
            }
            for view in pending {
                println!(
                    "  {} {} ({} risk): {}",
                    view.request.id, view.request.action, view.request.risk_level, view.request.reason
                );
            }
        }
        "status" => {
            println!("channel: {}", link.as_str());
            print_status(http, base, projection).await;
        }
        other => println!("unknown command: {other}"),
    }
    true
}

async fn submit_command(
    http: &reqwest::Client,
    base: &str,
    outbound_tx: &mpsc::Sender<Outbound>,
    command: &str,
) {
    let body = serde_json::json!({ "command": command });
    match http
        .post(format!("{base}/command"))
        .json(&body)
        .send()
        .await
    {
        Ok(response) if response.status().is_success() => {
            println!("* command submitted");
        }
        Ok(response) => {
            println!("* daemon rejected command: {}", response.status());
        }
        Err(err) => {
            // HTTP is down but the socket may still be alive (or will
            // replay from the queue once it reconnects).
            warn!(event = "command_http_failed", error = %err);
            let frame = Outbound::Routine(Envelope::command(command));
            if outbound_tx.send(frame).await.is_ok() {
                println!("* command queued over the channel");
            } else {
                println!("* could not reach the agent");
            }
        }
    }
}

async fn send_decision(
    http: &reqwest::Client,
    base: &str,
    outbound_tx: &mpsc::Sender<Outbound>,
    request_id: &str,
    approved: bool,
) {
    let body = serde_json::json!({ "request_id": request_id, "approved": approved });
    match http
        .post(format!("{base}/approve"))
        .json(&body)
        .send()
        .await
    {
        Ok(response) if response.status().is_success() => {
            println!("* decision sent");
        }
        Ok(response) => {
            println!("* daemon rejected decision: {}", response.status());
        }
        Err(err) => {
            warn!(event = "decision_http_failed", error = %err);
            // Decisions are critical: they ride the channel queue and are
            // never evicted, so they survive a reconnect.
            let frame = Outbound::Critical(Envelope::approve(request_id, approved));
            if outbound_tx.send(frame).await.is_ok() {
                println!("* decision queued over the channel");
            } else {
                println!("* could not deliver the decision");
            }
        }
    }
}

async fn print_status(http: &reqwest::Client, base: &str, projection: &Projection) {
    let stats = projection.stats();
    println!(
        "local: {} pending, {} frames, {} screenshots, {} vision calls, {} stale dropped",
        projection.pending_count(),
        stats.frames,
        stats.screenshots,
        stats.vision_calls,
        stats.stale_updates
    );
    match http.get(format!("{base}/status")).send().await {
        Ok(response) => match response.json::<StatusSnapshot>().await {
            Ok(snapshot) => println!(
                "agent: {} commands executed, {} clients, {} pending approvals",
                snapshot.commands_executed,
                snapshot.connected_clients,
                snapshot.pending_approvals.len()
            ),
            Err(err) => println!("agent status unreadable: {err}"),
        },
        Err(err) => println!("agent unreachable: {err}"),
    }
}
