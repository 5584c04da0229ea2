//! Discord bot lifecycle manager.
//!
//! One long-lived task per tenant instance drives the provider gateway
//! connection; bots for different tenants are fully independent. A circuit
//! breaker gates reconnection, invalid tokens are terminal, and a local
//! Unix-socket IPC surface lets the management layer request sends without
//! holding a live gateway connection itself.

use super::discord::DiscordSender;
use super::traits::Channel;
use crate::agent;
use crate::config::{ChannelKind, InstanceConfig};
use crate::router::{InboundMessage, MessageRouter};
use crate::trace::{TraceFields, TraceService, TraceStatus};
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

/// Consecutive failures before the breaker opens.
pub const FAILURE_THRESHOLD: u32 = 3;
/// How long an open breaker blocks connection attempts.
pub const RECOVERY_TIMEOUT: Duration = Duration::from_secs(300);
/// Transient-failure retries per start request; exhaustion is terminal until
/// an explicit restart.
pub const MAX_CONNECT_ATTEMPTS: u32 = 5;

/// GUILDS | GUILD_MESSAGES | DIRECT_MESSAGES | MESSAGE_CONTENT
const GATEWAY_INTENTS: u64 = 37377;

const STATUS_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

// ── Circuit breaker ───────────────────────────────────────────────

/// Per-instance gate over reconnection attempts.
///
/// Opens after `failure_threshold` consecutive failures, blocks until the
/// recovery timeout elapses (then allows a single half-open probe), and
/// closes on the first success. A permanent failure (invalid token) opens it
/// with no retry time at all.
pub struct CircuitBreaker {
    consecutive_failures: u32,
    is_open: bool,
    next_retry_time: Option<Instant>,
    failure_threshold: u32,
    recovery_timeout: Duration,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::with_thresholds(FAILURE_THRESHOLD, RECOVERY_TIMEOUT)
    }
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Custom thresholds, used by tests to avoid five-minute waits.
    pub fn with_thresholds(failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            consecutive_failures: 0,
            is_open: false,
            next_retry_time: None,
            failure_threshold,
            recovery_timeout,
        }
    }

    /// Record one connection failure. Returns true when this failure opened
    /// the breaker.
    pub fn record_failure(&mut self) -> bool {
        self.consecutive_failures += 1;
        if self.consecutive_failures >= self.failure_threshold && !self.is_open {
            self.is_open = true;
            self.next_retry_time = Some(Instant::now() + self.recovery_timeout);
            return true;
        }
        false
    }

    /// A successful connection closes the breaker and clears the counter.
    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.is_open = false;
        self.next_retry_time = None;
    }

    /// Open with no recovery time: only an explicit restart may try again.
    pub fn open_permanently(&mut self) {
        self.is_open = true;
        self.next_retry_time = None;
    }

    /// Whether a connection attempt is allowed right now. An expired
    /// recovery timeout moves the breaker to half-open (one probe allowed).
    pub fn allows_attempt(&mut self) -> bool {
        if !self.is_open {
            return true;
        }
        match self.next_retry_time {
            Some(at) if Instant::now() >= at => {
                // Half-open: let one attempt through.
                self.is_open = false;
                true
            }
            _ => false,
        }
    }

    pub fn is_open(&self) -> bool {
        self.is_open
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn next_retry_in(&self) -> Option<Duration> {
        self.next_retry_time
            .map(|at| at.saturating_duration_since(Instant::now()))
    }
}

/// Jittered exponential backoff for transient reconnects: `2^attempt`
/// seconds capped at 60, plus up to 10% jitter.
pub fn backoff_delay(attempt: u32) -> Duration {
    use rand::RngExt;
    let exponent = i32::try_from(attempt.min(16)).unwrap_or(16);
    let base = 2f64.powi(exponent).min(60.0);
    let jitter = rand::rng().random_range(0.0..=0.1 * base);
    Duration::from_secs_f64(base + jitter)
}

// ── Bot state ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Disconnected,
    Error,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Error => "error",
        }
    }
}

/// Snapshot of one bot's health, as reported over IPC.
#[derive(Debug, Clone, serde::Serialize)]
pub struct BotStatus {
    pub instance_name: String,
    pub status: String,
    pub guild_count: u32,
    pub latency_ms: Option<f64>,
    pub last_heartbeat: DateTime<Utc>,
    pub uptime: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

struct BotState {
    connection: ConnectionState,
    guild_count: u32,
    latency_ms: Option<f64>,
    last_heartbeat: DateTime<Utc>,
    connected_at: Option<DateTime<Utc>>,
    error_message: Option<String>,
}

struct BotShared {
    instance_name: String,
    state: Mutex<BotState>,
}

impl BotShared {
    fn new(instance_name: &str) -> Self {
        Self {
            instance_name: instance_name.to_string(),
            state: Mutex::new(BotState {
                connection: ConnectionState::Idle,
                guild_count: 0,
                latency_ms: None,
                last_heartbeat: Utc::now(),
                connected_at: None,
                error_message: None,
            }),
        }
    }

    fn set_connection(&self, connection: ConnectionState) {
        let mut state = self.state.lock();
        state.connection = connection;
        if connection == ConnectionState::Connected {
            state.connected_at = Some(Utc::now());
            state.error_message = None;
        }
    }

    fn set_error(&self, message: &str) {
        let mut state = self.state.lock();
        state.connection = ConnectionState::Error;
        state.error_message = Some(message.to_string());
    }

    fn heartbeat(&self) {
        self.state.lock().last_heartbeat = Utc::now();
    }

    fn status(&self) -> BotStatus {
        let state = self.state.lock();
        BotStatus {
            instance_name: self.instance_name.clone(),
            status: state.connection.as_str().to_string(),
            guild_count: state.guild_count,
            latency_ms: state.latency_ms,
            last_heartbeat: state.last_heartbeat,
            uptime: state.connected_at,
            error_message: state.error_message.clone(),
        }
    }
}

struct BotHandle {
    shared: Arc<BotShared>,
    sender: Arc<DiscordSender>,
    cancel: CancellationToken,
    run_task: tokio::task::JoinHandle<()>,
    ipc_task: tokio::task::JoinHandle<()>,
    socket_path: PathBuf,
}

// ── Manager ───────────────────────────────────────────────────────

pub struct DiscordBotManager {
    router: Arc<MessageRouter>,
    traces: Arc<TraceService>,
    ipc_dir: PathBuf,
    bots: Mutex<HashMap<String, BotHandle>>,
}

impl DiscordBotManager {
    pub fn new(router: Arc<MessageRouter>, traces: Arc<TraceService>, ipc_dir: PathBuf) -> Self {
        Self {
            router,
            traces,
            ipc_dir,
            bots: Mutex::new(HashMap::new()),
        }
    }

    /// Start a bot for a Discord instance. Returns false when the instance
    /// is already running or has no token.
    pub async fn start_bot(&self, instance: InstanceConfig) -> bool {
        let name = instance.name.clone();
        if self.bots.lock().contains_key(&name) {
            tracing::warn!("bot '{name}' is already running");
            return false;
        }
        let Some(token) = instance.discord_bot_token.clone() else {
            tracing::error!("no Discord token provided for instance '{name}'");
            return false;
        };

        let shared = Arc::new(BotShared::new(&name));
        let sender = Arc::new(DiscordSender::new(token.clone()));
        let cancel = CancellationToken::new();
        let socket_path = self.ipc_dir.join(format!("omnihub-discord-{name}.sock"));

        let run_task = tokio::spawn(run_bot(
            instance.clone(),
            token,
            shared.clone(),
            sender.clone(),
            self.router.clone(),
            self.traces.clone(),
            cancel.clone(),
        ));

        let ipc_task = {
            let state = IpcState {
                instance_name: name.clone(),
                shared: shared.clone(),
                sender: sender.clone(),
                traces: self.traces.clone(),
            };
            let socket_path = socket_path.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if let Err(e) = run_ipc(&socket_path, state, cancel).await {
                    tracing::error!("IPC server failed: {e:#}");
                }
            })
        };

        self.bots.lock().insert(
            name.clone(),
            BotHandle {
                shared,
                sender,
                cancel,
                run_task,
                ipc_task,
                socket_path,
            },
        );

        tracing::info!("started Discord bot '{name}'");
        true
    }

    /// Gracefully stop a bot and release its resources.
    pub async fn stop_bot(&self, instance_name: &str) -> bool {
        let Some(handle) = self.bots.lock().remove(instance_name) else {
            tracing::warn!("bot '{instance_name}' is not running");
            return false;
        };

        handle.cancel.cancel();
        handle.run_task.abort();
        handle.ipc_task.abort();
        let _ = std::fs::remove_file(&handle.socket_path);

        tracing::info!("stopped Discord bot '{instance_name}'");
        true
    }

    /// Send a message through a running bot (management-API path).
    pub async fn send_message(&self, instance_name: &str, channel_id: &str, text: &str) -> bool {
        let sender = {
            let bots = self.bots.lock();
            let Some(handle) = bots.get(instance_name) else {
                tracing::error!("bot '{instance_name}' is not running");
                return false;
            };
            handle.sender.clone()
        };
        sender.send_response(channel_id, text, true).await
    }

    pub fn bot_status(&self, instance_name: &str) -> Option<BotStatus> {
        self.bots
            .lock()
            .get(instance_name)
            .map(|handle| handle.shared.status())
    }

    pub fn all_statuses(&self) -> Vec<BotStatus> {
        self.bots
            .lock()
            .values()
            .map(|handle| handle.shared.status())
            .collect()
    }

    pub async fn shutdown(&self) {
        let names: Vec<String> = self.bots.lock().keys().cloned().collect();
        for name in names {
            self.stop_bot(&name).await;
        }
    }
}

// ── Connection loop ───────────────────────────────────────────────

enum SessionError {
    /// Invalid token. Never retried; resources released immediately.
    AuthFailed(String),
    Transient(String),
}

#[allow(clippy::too_many_arguments)]
async fn run_bot(
    instance: InstanceConfig,
    token: String,
    shared: Arc<BotShared>,
    sender: Arc<DiscordSender>,
    router: Arc<MessageRouter>,
    traces: Arc<TraceService>,
    cancel: CancellationToken,
) {
    let name = instance.name.clone();
    let mut breaker = CircuitBreaker::new();
    let mut attempt: u32 = 0;

    while !cancel.is_cancelled() && attempt < MAX_CONNECT_ATTEMPTS {
        if !breaker.allows_attempt() {
            tracing::warn!(
                "circuit breaker OPEN for bot '{name}' — next retry in {:?}",
                breaker.next_retry_in()
            );
            tokio::select! {
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(Duration::from_secs(30)) => {}
            }
            continue;
        }

        tracing::info!(
            "connecting bot '{name}' (attempt {}/{MAX_CONNECT_ATTEMPTS}, breaker failures: {})",
            attempt + 1,
            breaker.consecutive_failures()
        );
        shared.set_connection(ConnectionState::Connecting);

        match connect_and_listen(&instance, &token, &shared, &sender, &router, &traces, &cancel)
            .await
        {
            Ok(connected) => {
                if cancel.is_cancelled() {
                    return;
                }
                if connected {
                    // The session was healthy and then dropped: reset the
                    // attempt budget and reconnect after a short pause.
                    breaker.record_success();
                    attempt = 0;
                    shared.set_connection(ConnectionState::Disconnected);
                    tracing::warn!("bot '{name}' disconnected, reconnecting");
                    tokio::select! {
                        () = cancel.cancelled() => return,
                        () = tokio::time::sleep(backoff_delay(1)) => {}
                    }
                } else {
                    // Ended before ever reaching READY.
                    attempt += 1;
                    if breaker.record_failure() {
                        tracing::warn!(
                            "circuit breaker OPENED for bot '{name}' after {} consecutive failures",
                            breaker.consecutive_failures()
                        );
                    }
                    shared.set_connection(ConnectionState::Disconnected);
                    if attempt < MAX_CONNECT_ATTEMPTS {
                        let delay = backoff_delay(attempt);
                        tracing::info!("retrying bot '{name}' in {delay:?}");
                        tokio::select! {
                            () = cancel.cancelled() => return,
                            () = tokio::time::sleep(delay) => {}
                        }
                    }
                }
            }
            Err(SessionError::AuthFailed(reason)) => {
                tracing::error!(
                    "AUTHENTICATION FAILURE for bot '{name}': {reason} — not retrying"
                );
                breaker.open_permanently();
                shared.set_error(&reason);
                return;
            }
            Err(SessionError::Transient(reason)) => {
                attempt += 1;
                if breaker.record_failure() {
                    tracing::warn!(
                        "circuit breaker OPENED for bot '{name}' after {} consecutive failures \
                         (recovery in {RECOVERY_TIMEOUT:?})",
                        breaker.consecutive_failures()
                    );
                }
                shared.set_connection(ConnectionState::Disconnected);
                tracing::warn!(
                    "connection failure for bot '{name}' ({attempt}/{MAX_CONNECT_ATTEMPTS}): {reason}"
                );
                if attempt < MAX_CONNECT_ATTEMPTS {
                    let delay = backoff_delay(attempt);
                    tokio::select! {
                        () = cancel.cancelled() => return,
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    if attempt >= MAX_CONNECT_ATTEMPTS {
        tracing::error!(
            "MAX RETRIES EXCEEDED for bot '{name}' — terminal until an explicit restart"
        );
        shared.set_error("max connection retries exceeded");
    }
}

/// Drive one gateway session.
///
/// Returns `Ok(true)` when the session reached READY before ending (a
/// transient drop), `Ok(false)` when it ended before READY, and `Err` for
/// classified failures.
#[allow(clippy::too_many_arguments, clippy::too_many_lines)]
async fn connect_and_listen(
    instance: &InstanceConfig,
    token: &str,
    shared: &Arc<BotShared>,
    sender: &Arc<DiscordSender>,
    router: &Arc<MessageRouter>,
    traces: &Arc<TraceService>,
    cancel: &CancellationToken,
) -> Result<bool, SessionError> {
    let client = reqwest::Client::new();

    // Gateway URL discovery doubles as the token check.
    let gw_response = client
        .get("https://discord.com/api/v10/gateway/bot")
        .header("Authorization", format!("Bot {token}"))
        .timeout(Duration::from_secs(10))
        .send()
        .await
        .map_err(|e| SessionError::Transient(format!("gateway discovery failed: {e}")))?;

    match gw_response.status().as_u16() {
        401 | 403 => {
            return Err(SessionError::AuthFailed("invalid Discord token".into()));
        }
        status if status >= 400 => {
            return Err(SessionError::Transient(format!(
                "gateway discovery returned {status}"
            )));
        }
        _ => {}
    }

    let gw_body: Value = gw_response
        .json()
        .await
        .map_err(|e| SessionError::Transient(format!("gateway discovery body: {e}")))?;
    let gw_url = gw_body
        .get("url")
        .and_then(Value::as_str)
        .unwrap_or("wss://gateway.discord.gg");

    let ws_url = format!("{gw_url}/?v=10&encoding=json");
    let (ws_stream, _) = tokio_tungstenite::connect_async(&ws_url)
        .await
        .map_err(|e| SessionError::Transient(format!("websocket connect failed: {e}")))?;
    let (mut write, mut read) = ws_stream.split();

    // Hello (op 10) carries the heartbeat interval.
    let hello = read
        .next()
        .await
        .ok_or_else(|| SessionError::Transient("gateway closed before hello".into()))?
        .map_err(|e| SessionError::Transient(format!("gateway read failed: {e}")))?;
    let hello: Value = serde_json::from_str(&hello.to_string())
        .map_err(|e| SessionError::Transient(format!("bad hello frame: {e}")))?;
    let heartbeat_interval = hello
        .get("d")
        .and_then(|d| d.get("heartbeat_interval"))
        .and_then(Value::as_u64)
        .unwrap_or(41_250);

    let identify = json!({
        "op": 2,
        "d": {
            "token": token,
            "intents": GATEWAY_INTENTS,
            "properties": { "os": "linux", "browser": "omnihub", "device": "omnihub" }
        }
    });
    write
        .send(Message::Text(identify.to_string().into()))
        .await
        .map_err(|e| SessionError::Transient(format!("identify send failed: {e}")))?;

    let mut heartbeat = tokio::time::interval(Duration::from_millis(heartbeat_interval));
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut status_tick = tokio::time::interval(STATUS_HEARTBEAT_INTERVAL);

    let mut sequence: i64 = -1;
    let mut connected = false;
    let mut bot_user_id = String::new();
    let mut last_heartbeat_sent: Option<Instant> = None;

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                let _ = write.send(Message::Close(None)).await;
                return Ok(connected);
            }
            _ = heartbeat.tick() => {
                let d = if sequence >= 0 { json!(sequence) } else { Value::Null };
                let frame = json!({"op": 1, "d": d});
                if write.send(Message::Text(frame.to_string().into())).await.is_err() {
                    return if connected {
                        Ok(true)
                    } else {
                        Err(SessionError::Transient("heartbeat write failed".into()))
                    };
                }
                last_heartbeat_sent = Some(Instant::now());
            }
            // Keeps the health snapshot fresh during idle periods so a
            // monitor never declares a quiet bot degraded.
            _ = status_tick.tick() => {
                if connected {
                    shared.heartbeat();
                }
            }
            frame = read.next() => {
                let text = match frame {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(close))) => {
                        if let Some(close) = &close {
                            if u16::from(close.code) == 4004 {
                                return Err(SessionError::AuthFailed(
                                    "gateway rejected token (close 4004)".into(),
                                ));
                            }
                        }
                        tracing::warn!("gateway closed: {close:?}");
                        return Ok(connected);
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        return if connected {
                            tracing::warn!("gateway read error: {e}");
                            Ok(true)
                        } else {
                            Err(SessionError::Transient(format!("gateway read error: {e}")))
                        };
                    }
                    None => return Ok(connected),
                };

                let event: Value = match serde_json::from_str(&text) {
                    Ok(event) => event,
                    Err(_) => continue,
                };

                if let Some(s) = event.get("s").and_then(Value::as_i64) {
                    sequence = s;
                }
                shared.heartbeat();

                let op = event.get("op").and_then(Value::as_u64).unwrap_or(0);
                match op {
                    // Immediate heartbeat request.
                    1 => {
                        let d = if sequence >= 0 { json!(sequence) } else { Value::Null };
                        let frame = json!({"op": 1, "d": d});
                        if write.send(Message::Text(frame.to_string().into())).await.is_err() {
                            return Ok(connected);
                        }
                        last_heartbeat_sent = Some(Instant::now());
                        continue;
                    }
                    7 => {
                        tracing::warn!("gateway requested reconnect (op 7)");
                        return Ok(connected);
                    }
                    9 => {
                        tracing::warn!("gateway invalidated session (op 9)");
                        return Ok(connected);
                    }
                    11 => {
                        if let Some(sent) = last_heartbeat_sent {
                            shared.state.lock().latency_ms =
                                Some(sent.elapsed().as_secs_f64() * 1000.0);
                        }
                        continue;
                    }
                    _ => {}
                }

                let event_type = event.get("t").and_then(Value::as_str).unwrap_or("");
                let Some(d) = event.get("d") else { continue };

                match event_type {
                    "READY" => {
                        connected = true;
                        bot_user_id = d
                            .get("user")
                            .and_then(|u| u.get("id"))
                            .and_then(Value::as_str)
                            .unwrap_or("")
                            .to_string();
                        let guilds = d
                            .get("guilds")
                            .and_then(Value::as_array)
                            .map_or(0, Vec::len);
                        shared.state.lock().guild_count =
                            u32::try_from(guilds).unwrap_or(u32::MAX);
                        shared.set_connection(ConnectionState::Connected);
                        tracing::info!(
                            "bot '{}' ready (user {bot_user_id}, {guilds} guilds)",
                            instance.name
                        );
                    }
                    "GUILD_CREATE" => {
                        shared.state.lock().guild_count += 1;
                    }
                    "GUILD_DELETE" => {
                        let mut state = shared.state.lock();
                        state.guild_count = state.guild_count.saturating_sub(1);
                    }
                    "MESSAGE_CREATE" => {
                        let instance = instance.clone();
                        let shared = shared.clone();
                        let sender = sender.clone();
                        let router = router.clone();
                        let traces = traces.clone();
                        let d = d.clone();
                        let bot_user_id = bot_user_id.clone();
                        // Message handling must never block heartbeats.
                        tokio::spawn(async move {
                            handle_message_event(
                                &d, &bot_user_id, &instance, &shared, &sender, &router, &traces,
                            )
                            .await;
                        });
                    }
                    "INTERACTION_CREATE" => {
                        let instance = instance.clone();
                        let sender = sender.clone();
                        let router = router.clone();
                        let traces = traces.clone();
                        let d = d.clone();
                        tokio::spawn(async move {
                            handle_interaction_event(&d, &instance, &sender, &router, &traces)
                                .await;
                        });
                    }
                    _ => {}
                }
            }
        }
    }
}

// ── Inbound dispatch ──────────────────────────────────────────────

/// Route one MESSAGE_CREATE event: only DMs and explicit mentions are
/// processed; self- and bot-authored messages are ignored.
async fn handle_message_event(
    d: &Value,
    bot_user_id: &str,
    instance: &InstanceConfig,
    shared: &Arc<BotShared>,
    sender: &Arc<DiscordSender>,
    router: &Arc<MessageRouter>,
    traces: &Arc<TraceService>,
) {
    shared.heartbeat();

    let author = d.get("author").cloned().unwrap_or_default();
    let author_id = author.get("id").and_then(Value::as_str).unwrap_or("");
    if author_id.is_empty() || author_id == bot_user_id {
        return;
    }
    if author.get("bot").and_then(Value::as_bool).unwrap_or(false) {
        return;
    }

    let guild_id = d.get("guild_id").and_then(Value::as_str);
    let is_dm = guild_id.is_none();
    let content = d.get("content").and_then(Value::as_str).unwrap_or("");

    let mention_token = format!("<@{bot_user_id}>");
    let nick_mention_token = format!("<@!{bot_user_id}>");
    let mentioned = d
        .get("mentions")
        .and_then(Value::as_array)
        .is_some_and(|mentions| {
            mentions
                .iter()
                .any(|m| m.get("id").and_then(Value::as_str) == Some(bot_user_id))
        })
        || content.contains(&mention_token)
        || content.contains(&nick_mention_token);

    if !is_dm && !mentioned {
        return;
    }

    let channel_id = d
        .get("channel_id")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    let text = content
        .replace(&mention_token, "")
        .replace(&nick_mention_token, "")
        .trim()
        .to_string();

    if text.is_empty() {
        let _ = sender
            .send_response(
                &channel_id,
                "Hi! How can I help you? Please include your message after mentioning me.",
                true,
            )
            .await;
        return;
    }

    let display_name = author
        .get("global_name")
        .or_else(|| author.get("username"))
        .and_then(Value::as_str)
        .map(ToString::to_string);

    let session_name = match guild_id {
        Some(guild) => format!("discord_{guild}_{author_id}"),
        None => format!("discord_dm_{author_id}"),
    };

    tracing::info!(
        instance = %instance.name,
        session = %session_name,
        "processing Discord message from {}",
        display_name.as_deref().unwrap_or(author_id)
    );

    let trace_event = json!({
        "channel_type": "discord",
        "session_name": session_name,
        "event": {
            "id": d.get("id"),
            "content": text,
            "author": {
                "id": author_id,
                "username": author.get("username"),
                "display_name": display_name,
            },
            "attachments": d.get("attachments").and_then(Value::as_array).cloned().unwrap_or_default(),
        },
        "metadata": {
            "instance_name": instance.name,
            "guild_id": guild_id,
            "channel_id": channel_id,
        },
    });
    let trace = traces.create_trace(&trace_event, &instance.name);
    if let Some(trace) = &trace {
        trace.update_status(TraceStatus::Processing, TraceFields::default());
    }

    let inbound = InboundMessage {
        channel: Some(ChannelKind::Discord),
        sender_id: author_id.to_string(),
        external_id: author_id.to_string(),
        display_name,
        text,
        message_type: "text".into(),
        media_contents: None,
        quoted_text: None,
        session_name,
    };

    sender.start_typing(&channel_id).await;

    if instance.agent.supports_streaming() {
        stream_reply(&inbound, instance, &channel_id, sender, router, traces, trace.as_ref()).await;
    } else {
        let reply = router.route(&inbound, instance, trace.as_ref()).await;
        if reply.should_deliver() {
            let delivered = sender
                .send_response(&channel_id, &reply.text, instance.enable_auto_split)
                .await;
            if let Some(trace) = &trace {
                trace.log_channel_send(
                    "discord",
                    &json!({"recipient": channel_id, "message_text": reply.text}),
                    if delivered { 200 } else { 500 },
                    delivered,
                );
            }
        } else if let Some(trace) = &trace {
            trace.update_status(TraceStatus::Completed, TraceFields::default());
        }
    }

    sender.stop_typing(&channel_id).await;
}

/// Route a slash-command interaction through the same mediator path as
/// messages, answering via the interaction callback.
async fn handle_interaction_event(
    d: &Value,
    instance: &InstanceConfig,
    sender: &Arc<DiscordSender>,
    router: &Arc<MessageRouter>,
    traces: &Arc<TraceService>,
) {
    let Some(interaction_id) = d.get("id").and_then(Value::as_str) else {
        return;
    };
    let Some(interaction_token) = d.get("token").and_then(Value::as_str) else {
        return;
    };

    let data = d.get("data").cloned().unwrap_or_default();
    let Some(command) = data.get("name").and_then(Value::as_str) else {
        return;
    };

    // Flatten options into a plain text command line for the agent.
    let mut text = format!("/{command}");
    if let Some(options) = data.get("options").and_then(Value::as_array) {
        for option in options {
            if let (Some(name), Some(value)) = (
                option.get("name").and_then(Value::as_str),
                option.get("value"),
            ) {
                let value = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                text.push_str(&format!(" {name}:{value}"));
            }
        }
    }

    // DMs carry `user`; guild interactions nest it under `member.user`.
    let user = d
        .get("member")
        .and_then(|m| m.get("user"))
        .or_else(|| d.get("user"))
        .cloned()
        .unwrap_or_default();
    let Some(author_id) = user.get("id").and_then(Value::as_str) else {
        return;
    };
    let guild_id = d.get("guild_id").and_then(Value::as_str);
    let session_name = match guild_id {
        Some(guild) => format!("discord_{guild}_{author_id}"),
        None => format!("discord_dm_{author_id}"),
    };

    tracing::info!(
        instance = %instance.name,
        session = %session_name,
        "processing Discord interaction '/{command}'"
    );

    let trace_event = json!({
        "channel_type": "discord",
        "session_name": session_name,
        "event": {
            "id": interaction_id,
            "content": text,
            "author": {"id": author_id, "username": user.get("username")},
            "attachments": [],
        },
        "metadata": {
            "instance_name": instance.name,
            "interaction": true,
            "command": command,
        },
    });
    let trace = traces.create_trace(&trace_event, &instance.name);
    if let Some(trace) = &trace {
        trace.update_status(TraceStatus::Processing, TraceFields::default());
    }

    let inbound = InboundMessage {
        channel: Some(ChannelKind::Discord),
        sender_id: author_id.to_string(),
        external_id: author_id.to_string(),
        display_name: user
            .get("global_name")
            .or_else(|| user.get("username"))
            .and_then(Value::as_str)
            .map(ToString::to_string),
        text,
        message_type: "text".into(),
        media_contents: None,
        quoted_text: None,
        session_name,
    };

    let reply = router.route(&inbound, instance, trace.as_ref()).await;
    let content = if reply.should_deliver() {
        reply.text.clone()
    } else {
        "Sorry, an error occurred while processing your command.".to_string()
    };
    let delivered = sender
        .interaction_reply(interaction_id, interaction_token, &content)
        .await;

    if let Some(trace) = &trace {
        trace.log_channel_send(
            "discord",
            &json!({"interaction_id": interaction_id, "message_text": content}),
            if delivered { 200 } else { 500 },
            delivered,
        );
    }
}

/// Progressive delivery for streaming-capable backends: placeholder message,
/// throttled edits, one final edit.
async fn stream_reply(
    inbound: &InboundMessage,
    instance: &InstanceConfig,
    channel_id: &str,
    sender: &Arc<DiscordSender>,
    router: &Arc<MessageRouter>,
    traces: &Arc<TraceService>,
    trace: Option<&crate::trace::TraceContext>,
) {
    let prepared = router.prepare(inbound, instance);
    let client = agent::client_for(&instance.agent);

    if let Some(trace) = trace {
        trace.log_agent_request(&json!({
            "agent_backend": instance.agent.kind(),
            "session_name": prepared.request.session_name,
            "message": prepared.request.message,
            "streaming": true,
        }));
    }

    let started = Instant::now();
    match client.stream(&prepared.request).await {
        Ok(chunks) => {
            let (delivered, full_text) = sender.stream_response(channel_id, chunks).await;
            #[allow(clippy::cast_possible_truncation)]
            let elapsed_ms = started.elapsed().as_millis() as i64;

            if let Some(trace) = trace {
                trace.log_agent_response(
                    &json!({"message": full_text, "success": delivered}),
                    elapsed_ms,
                );
                trace.log_channel_send(
                    "discord",
                    &json!({"recipient": channel_id, "message_text": full_text, "streaming": true}),
                    if delivered { 200 } else { 500 },
                    delivered,
                );
            }
        }
        Err(e) => {
            tracing::error!(instance = %instance.name, "streaming agent call failed: {e}");
            let reply = e.to_reply();
            let _ = sender.send_response(channel_id, &reply.text, true).await;
            if let Some(trace) = trace {
                trace.fail("agent_stream", &e.to_string());
            }
        }
    }
}

// ── IPC ───────────────────────────────────────────────────────────

#[derive(Clone)]
struct IpcState {
    instance_name: String,
    shared: Arc<BotShared>,
    sender: Arc<DiscordSender>,
    traces: Arc<TraceService>,
}

/// Serve the per-bot IPC surface on a local Unix socket: `POST /send`,
/// `GET /health`, `GET /status`. Lets the management API enqueue outbound
/// sends without holding a gateway connection.
#[cfg(unix)]
async fn run_ipc(
    socket_path: &Path,
    state: IpcState,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    use axum::routing::{get, post};

    // A stale socket file from a previous run blocks bind.
    if socket_path.exists() {
        let _ = std::fs::remove_file(socket_path);
    }
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let listener = tokio::net::UnixListener::bind(socket_path)?;
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(socket_path, perms)?;
    }

    let app = axum::Router::new()
        .route("/send", post(ipc_send))
        .route("/health", get(ipc_health))
        .route("/status", get(ipc_status))
        .with_state(state);

    tracing::info!("IPC socket listening at {}", socket_path.display());
    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await?;
    Ok(())
}

#[cfg(not(unix))]
async fn run_ipc(
    _socket_path: &Path,
    _state: IpcState,
    _cancel: CancellationToken,
) -> anyhow::Result<()> {
    tracing::warn!("IPC surface requires Unix domain sockets; skipping");
    Ok(())
}

async fn ipc_send(
    axum::extract::State(state): axum::extract::State<IpcState>,
    axum::Json(body): axum::Json<Value>,
) -> (axum::http::StatusCode, axum::Json<Value>) {
    let channel_id = match body.get("channel_id") {
        Some(Value::String(id)) if !id.is_empty() => id.clone(),
        Some(Value::Number(id)) => id.to_string(),
        _ => {
            return (
                axum::http::StatusCode::BAD_REQUEST,
                axum::Json(json!({"success": false, "error": "Missing channel_id or text"})),
            );
        }
    };
    let Some(text) = body.get("text").and_then(Value::as_str).filter(|t| !t.is_empty()) else {
        return (
            axum::http::StatusCode::BAD_REQUEST,
            axum::Json(json!({"success": false, "error": "Missing channel_id or text"})),
        );
    };

    let success = state.sender.send_response(&channel_id, text, true).await;

    state.traces.record_outbound(
        &state.instance_name,
        "discord",
        &json!({"recipient": channel_id, "message_text": text, "source": "ipc"}),
        Some(&json!({"status_code": if success { 200 } else { 500 }})),
        success,
        None,
        (!success).then_some("ipc send failed"),
    );

    (
        axum::http::StatusCode::OK,
        axum::Json(json!({
            "success": success,
            "instance": state.instance_name,
            "channel_id": channel_id,
        })),
    )
}

async fn ipc_health(
    axum::extract::State(state): axum::extract::State<IpcState>,
) -> axum::Json<Value> {
    let status = state.shared.status();
    axum::Json(json!({
        "status": "ok",
        "instance": state.instance_name,
        "bot_connected": status.status == "connected",
        "latency_ms": status.latency_ms,
    }))
}

async fn ipc_status(
    axum::extract::State(state): axum::extract::State<IpcState>,
) -> axum::Json<Value> {
    let status = state.shared.status();
    axum::Json(json!({
        "status": status.status,
        "instance": status.instance_name,
        "guild_count": status.guild_count,
        "latency_ms": status.latency_ms,
        "uptime": status.uptime,
        "error_message": status.error_message,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn breaker_opens_exactly_at_third_failure() {
        let mut breaker = CircuitBreaker::new();
        assert!(!breaker.record_failure());
        assert!(!breaker.is_open());
        assert!(!breaker.record_failure());
        assert!(!breaker.is_open());
        assert!(breaker.record_failure(), "third failure opens the breaker");
        assert!(breaker.is_open());
        assert_eq!(breaker.consecutive_failures(), 3);
        assert!(breaker.next_retry_in().is_some());
    }

    #[test]
    fn open_breaker_blocks_attempts_until_recovery() {
        let mut breaker = CircuitBreaker::with_thresholds(3, Duration::from_millis(50));
        for _ in 0..3 {
            breaker.record_failure();
        }
        assert!(!breaker.allows_attempt());

        std::thread::sleep(Duration::from_millis(60));
        // Recovery timeout elapsed: half-open, one probe allowed.
        assert!(breaker.allows_attempt());
    }

    #[test]
    fn success_closes_breaker_and_resets_counter() {
        let mut breaker = CircuitBreaker::new();
        for _ in 0..3 {
            breaker.record_failure();
        }
        assert!(breaker.is_open());
        breaker.record_success();
        assert!(!breaker.is_open());
        assert_eq!(breaker.consecutive_failures(), 0);
        assert!(breaker.allows_attempt());
    }

    #[test]
    fn permanent_open_never_allows_attempts() {
        let mut breaker = CircuitBreaker::with_thresholds(3, Duration::from_millis(1));
        breaker.open_permanently();
        std::thread::sleep(Duration::from_millis(10));
        assert!(!breaker.allows_attempt(), "no retry time means no retries");
        assert!(breaker.is_open());
    }

    #[test]
    fn backoff_grows_exponentially_and_caps_at_60s() {
        let d1 = backoff_delay(1);
        assert!(d1 >= Duration::from_secs(2) && d1 <= Duration::from_millis(2300));

        let d3 = backoff_delay(3);
        assert!(d3 >= Duration::from_secs(8) && d3 <= Duration::from_millis(8900));

        let d10 = backoff_delay(10);
        assert!(d10 >= Duration::from_secs(60) && d10 <= Duration::from_secs(67));
    }

    #[test]
    fn connection_state_strings() {
        assert_eq!(ConnectionState::Connecting.as_str(), "connecting");
        assert_eq!(ConnectionState::Connected.as_str(), "connected");
        assert_eq!(ConnectionState::Error.as_str(), "error");
    }

    #[test]
    fn bot_shared_status_snapshot() {
        let shared = BotShared::new("disc-1");
        assert_eq!(shared.status().status, "idle");
        shared.set_connection(ConnectionState::Connected);
        let status = shared.status();
        assert_eq!(status.status, "connected");
        assert!(status.uptime.is_some());
        shared.set_error("boom");
        let status = shared.status();
        assert_eq!(status.status, "error");
        assert_eq!(status.error_message.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn manager_refuses_duplicate_and_tokenless_instances() {
        let tmp = tempfile::TempDir::new().unwrap();
        let router = Arc::new(MessageRouter::new(Arc::new(
            crate::router::UserStore::open(&tmp.path().join("users.db")).unwrap(),
        )));
        let manager = DiscordBotManager::new(
            router,
            Arc::new(TraceService::disabled()),
            tmp.path().to_path_buf(),
        );

        let no_token = InstanceConfig {
            name: "no-token".into(),
            channel_type: ChannelKind::Discord,
            ..InstanceConfig::default()
        };
        assert!(!manager.start_bot(no_token).await);

        let with_token = InstanceConfig {
            name: "bot-a".into(),
            channel_type: ChannelKind::Discord,
            discord_bot_token: Some("fake-token".into()),
            ..InstanceConfig::default()
        };
        assert!(manager.start_bot(with_token.clone()).await);
        assert!(!manager.start_bot(with_token).await, "duplicate start refused");

        assert!(manager.bot_status("bot-a").is_some());
        assert!(manager.stop_bot("bot-a").await);
        assert!(manager.bot_status("bot-a").is_none());
        assert!(!manager.stop_bot("bot-a").await);
    }
}
