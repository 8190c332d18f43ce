// Copyright (C) 2026 Titan
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::{
    collections::{HashMap, VecDeque},
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use titan_common::{
    AUTH_RETRY_BACKOFF_SECS, ArtifactRenderer, BOT_PLAYER_NAME, BOT_REPLY_DELAY_MS, Board,
    CoinFace, Command, FLAT_WIN_REWARD, FLIP_LOSS_PENALTY, FLIP_REVEAL_DELAY_MS,
    FLIP_SETTLE_DELAY_MS, FLIP_WIN_REWARD, IDLE_MATCH_TIMEOUT_SECS, IDLE_REAP_INTERVAL_SECS,
    InboundEvent, KEEPALIVE_INTERVAL_SECS, LOGIN_JOIN_DELAY_MS, LeaderboardEntry, Mark,
    MemoryLedger, NullRenderer, OutboundEvent, RECONNECT_BACKOFF_SECS, ScoreLedger, board_is_full,
    board_text, choose_bot_move, parse_command, winning_line,
};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, info, warn};
use uuid::Uuid;

const DEFAULT_AVATAR_URL: &str = "https://cdn-icons-png.flaticon.com/512/149/149071.png";
const BOT_AVATAR_URL: &str = "https://cdn-icons-png.flaticon.com/512/4712/4712035.png";
const CHAT_HISTORY_CAP: usize = 100;
const DEBUG_LOG_CAP: usize = 300;

const HELP_TEXT: &str = "🎮 **COMMANDS:**\n• `!start` (TicTacToe)\n• `!start pvp bet 100`\n• `!join <host>`\n• `!flip` / `!flip head` (Toss)\n• `!score` • `!reset`";

type WsSink = futures_util::stream::SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
enum SessionStatus {
    Disconnected,
    FetchingCredential,
    Connecting,
    Authenticating,
    Online,
    AuthFailed,
    Retrying,
}

#[derive(Debug, Clone)]
struct SessionConfig {
    username: String,
    password: String,
    room: String,
}

#[derive(Debug, Clone)]
struct Credential {
    token: String,
}

/// Mutable session context: connection status, configured identity, cached
/// login credential, and the canonical room id learned from the join ack.
struct SessionState {
    status: SessionStatus,
    config: Option<SessionConfig>,
    credential: Option<Credential>,
    room_id: Option<serde_json::Value>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            status: SessionStatus::Disconnected,
            config: None,
            credential: None,
            room_id: None,
        }
    }
}

struct SupervisorHandle {
    stop_tx: Option<oneshot::Sender<()>>,
    // Per-generation flag: once cleared it never comes back, so tasks of a
    // stopped generation cannot be revived by a later start.
    run_flag: Arc<AtomicBool>,
    #[allow(dead_code)]
    join: tokio::task::JoinHandle<()>,
}

/// Best-effort outbound chat handle. A sender is attached for the lifetime
/// of one connection; sends while detached are dropped with a warning since
/// chat delivery is not guaranteed anyway.
#[derive(Clone, Default)]
struct ChatSender {
    slot: Arc<Mutex<Option<mpsc::UnboundedSender<OutboundEvent>>>>,
}

impl ChatSender {
    async fn attach(&self, tx: mpsc::UnboundedSender<OutboundEvent>) {
        *self.slot.lock().await = Some(tx);
    }

    async fn detach(&self) {
        *self.slot.lock().await = None;
    }

    async fn send(&self, event: OutboundEvent) -> bool {
        let slot = self.slot.lock().await;
        match slot.as_ref() {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct ChatEntry {
    user: String,
    msg: String,
    avatar: String,
    time: String,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Clone, Serialize)]
struct DebugEntry {
    time: String,
    dir: String,
    data: serde_json::Value,
}

/// Bounded chat and protocol history served to the control surface.
#[derive(Clone, Default)]
struct History {
    chat: Arc<Mutex<VecDeque<ChatEntry>>>,
    debug: Arc<Mutex<VecDeque<DebugEntry>>>,
}

impl History {
    async fn push_chat(&self, user: &str, msg: &str, avatar: &str, kind: &str) {
        let mut chat = self.chat.lock().await;
        chat.push_back(ChatEntry {
            user: user.to_string(),
            msg: msg.to_string(),
            avatar: avatar.to_string(),
            time: Utc::now().format("%H:%M").to_string(),
            kind: kind.to_string(),
        });
        while chat.len() > CHAT_HISTORY_CAP {
            chat.pop_front();
        }
    }

    async fn push_debug(&self, dir: &str, data: serde_json::Value) {
        let mut debug = self.debug.lock().await;
        debug.push_back(DebugEntry {
            time: Utc::now().format("%H:%M:%S").to_string(),
            dir: dir.to_string(),
            data,
        });
        while debug.len() > DEBUG_LOG_CAP {
            debug.pop_front();
        }
    }

    async fn chat_entries(&self) -> Vec<ChatEntry> {
        self.chat.lock().await.iter().cloned().collect()
    }

    async fn debug_entries(&self) -> Vec<DebugEntry> {
        self.debug.lock().await.iter().cloned().collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MatchMode {
    VersusBot,
    VersusPlayer,
}

/// One board-game match, keyed in the match table by its host.
#[derive(Debug, Clone)]
struct Match {
    host: String,
    mode: MatchMode,
    board: Board,
    turn: Mark,
    player_x: String,
    player_o: Option<String>,
    bet: i64,
    last_active: Instant,
}

impl Match {
    fn involves(&self, user: &str) -> bool {
        self.player_x == user || self.player_o.as_deref() == Some(user)
    }

    fn mover_for_turn(&self) -> Option<&str> {
        match self.turn {
            Mark::X => Some(self.player_x.as_str()),
            Mark::O => self.player_o.as_deref(),
        }
    }
}

fn is_human(name: &str) -> bool {
    name != BOT_PLAYER_NAME
}

/// Escrow refunds owed when a match ends without a winner: the host's stake
/// plus the joiner's in player-versus-player matches.
fn refund_list(game: &Match) -> Vec<(String, i64)> {
    let mut refunds = Vec::new();
    if game.bet > 0 {
        refunds.push((game.player_x.clone(), game.bet));
        if let Some(player_o) = game.player_o.as_deref().filter(|name| is_human(name)) {
            refunds.push((player_o.to_string(), game.bet));
        }
    }
    refunds
}

enum TurnOutcome {
    Continue,
    Win {
        board: Board,
        line: [usize; 3],
        mover: String,
        bet: i64,
    },
    Draw {
        board: Board,
        refunds: Vec<(String, i64)>,
    },
}

#[derive(Clone)]
struct AppState {
    session: Arc<Mutex<SessionState>>,
    should_run: Arc<AtomicBool>,
    supervisor: Arc<Mutex<Option<SupervisorHandle>>>,
    chat: ChatSender,
    matches: Arc<Mutex<HashMap<String, Match>>>,
    avatars: Arc<Mutex<HashMap<String, String>>>,
    ledger: Arc<dyn ScoreLedger>,
    renderer: Arc<dyn ArtifactRenderer>,
    history: History,
    client: reqwest::Client,
    login_url: String,
    ws_url: String,
}

impl AppState {
    fn new(
        ledger: Arc<dyn ScoreLedger>,
        renderer: Arc<dyn ArtifactRenderer>,
        login_url: String,
        ws_url: String,
    ) -> Self {
        Self {
            session: Arc::new(Mutex::new(SessionState::default())),
            should_run: Arc::new(AtomicBool::new(false)),
            supervisor: Arc::new(Mutex::new(None)),
            chat: ChatSender::default(),
            matches: Arc::new(Mutex::new(HashMap::new())),
            avatars: Arc::new(Mutex::new(HashMap::new())),
            ledger,
            renderer,
            history: History::default(),
            client: reqwest::Client::new(),
            login_url,
            ws_url,
        }
    }

    fn from_env() -> Self {
        Self::new(
            Arc::new(MemoryLedger::new()),
            Arc::new(NullRenderer),
            std::env::var("CHAT_LOGIN_URL")
                .ok()
                .unwrap_or_else(|| "https://api.howdies.app/api/login".to_string()),
            std::env::var("CHAT_WS_URL")
                .ok()
                .unwrap_or_else(|| "wss://app.howdies.app/howdies".to_string()),
        )
    }

    async fn set_status(&self, status: SessionStatus) {
        let mut session = self.session.lock().await;
        if session.status != status {
            debug!(from = ?session.status, to = ?status, "session status changed");
            session.status = status;
        }
    }

    async fn current_status(&self) -> SessionStatus {
        self.session.lock().await.status
    }

    /// Canonical room id learned from the join ack, or the configured room
    /// name until one is learned.
    async fn room_target(&self) -> serde_json::Value {
        let session = self.session.lock().await;
        session.room_id.clone().unwrap_or_else(|| {
            serde_json::Value::String(
                session
                    .config
                    .as_ref()
                    .map(|config| config.room.clone())
                    .unwrap_or_default(),
            )
        })
    }

    async fn send_text(&self, text: &str) {
        let event = OutboundEvent::Chatroommessage {
            id: Uuid::new_v4().to_string(),
            kind: "text".to_string(),
            roomid: self.room_target().await,
            text: text.to_string(),
            url: String::new(),
            length: "0".to_string(),
        };
        if self.chat.send(event).await {
            self.history
                .push_chat("TitanBot", text, BOT_AVATAR_URL, "bot")
                .await;
        } else {
            warn!("chat connection down; dropping outbound text");
        }
    }

    async fn send_image(&self, url: &str) {
        let event = OutboundEvent::Chatroommessage {
            id: Uuid::new_v4().to_string(),
            kind: "image".to_string(),
            roomid: self.room_target().await,
            text: String::new(),
            url: url.to_string(),
            length: "0".to_string(),
        };
        if self.chat.send(event).await {
            self.history
                .push_chat("TitanBot", "[IMAGE SENT]", BOT_AVATAR_URL, "bot")
                .await;
        } else {
            warn!("chat connection down; dropping outbound image");
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "chat_bot_service=debug,tower_http=info".to_string()),
        )
        .init();

    let state = AppState::from_env();
    let app = build_router(state);
    let bind_addr = parse_bind_addr("CHAT_BOT_BIND", "0.0.0.0:8095")?;
    info!(%bind_addr, "chat-bot-service listening");
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/internal/v1/session",
            post(start_session_handler)
                .get(session_status_handler)
                .delete(stop_session_handler),
        )
        .route("/internal/v1/leaderboard", get(leaderboard_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

fn parse_bind_addr(var_name: &str, default: &str) -> anyhow::Result<SocketAddr> {
    let value = std::env::var(var_name)
        .ok()
        .unwrap_or_else(|| default.to_string());
    value.parse().context(format!("invalid {var_name}"))
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"ok": true, "service": "chat-bot-service"}))
}

#[derive(Debug, Deserialize)]
struct StartSessionRequest {
    username: String,
    password: String,
    room: String,
}

#[derive(Debug, Serialize)]
struct StartSessionResponse {
    started: bool,
    state: SessionStatus,
}

#[derive(Debug, Serialize)]
struct StopSessionResponse {
    stopped: bool,
    state: SessionStatus,
}

#[derive(Debug, Serialize)]
struct SessionStatusResponse {
    state: SessionStatus,
    chat: Vec<ChatEntry>,
    debug: Vec<DebugEntry>,
}

async fn start_session_handler(
    State(state): State<AppState>,
    Json(request): Json<StartSessionRequest>,
) -> Result<Json<StartSessionResponse>, ApiError> {
    if request.username.trim().is_empty()
        || request.password.is_empty()
        || request.room.trim().is_empty()
    {
        return Err(ApiError::bad_request(
            "username, password, and room are required",
        ));
    }

    if state.should_run.swap(true, Ordering::SeqCst) {
        return Err(ApiError::conflict("session is already running"));
    }

    {
        let mut session = state.session.lock().await;
        session.config = Some(SessionConfig {
            username: request.username.trim().to_string(),
            password: request.password.clone(),
            room: request.room.trim().to_string(),
        });
        session.room_id = None;
        session.status = SessionStatus::FetchingCredential;
    }

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let run_flag = Arc::new(AtomicBool::new(true));
    let join = tokio::spawn(run_supervisor(state.clone(), run_flag.clone(), stop_rx));
    tokio::spawn(run_idle_reaper(state.clone(), run_flag.clone()));
    *state.supervisor.lock().await = Some(SupervisorHandle {
        stop_tx: Some(stop_tx),
        run_flag,
        join,
    });

    info!(username = %request.username, room = %request.room, "chat session starting");
    Ok(Json(StartSessionResponse {
        started: true,
        state: state.current_status().await,
    }))
}

async fn stop_session_handler(
    State(state): State<AppState>,
) -> Result<Json<StopSessionResponse>, ApiError> {
    let was_running = state.should_run.swap(false, Ordering::SeqCst);
    if let Some(mut handle) = state.supervisor.lock().await.take() {
        handle.run_flag.store(false, Ordering::SeqCst);
        if let Some(stop_tx) = handle.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        // The supervisor and any in-flight game tasks wind down on their
        // own; they are not aborted.
    }
    if !was_running {
        state.set_status(SessionStatus::Disconnected).await;
    }
    info!(was_running, "chat session stop requested");
    Ok(Json(StopSessionResponse {
        stopped: true,
        state: state.current_status().await,
    }))
}

async fn session_status_handler(
    State(state): State<AppState>,
) -> Result<Json<SessionStatusResponse>, ApiError> {
    Ok(Json(SessionStatusResponse {
        state: state.current_status().await,
        chat: state.history.chat_entries().await,
        debug: state.history.debug_entries().await,
    }))
}

async fn leaderboard_handler(
    State(state): State<AppState>,
) -> Result<Json<Vec<LeaderboardEntry>>, ApiError> {
    Ok(Json(state.ledger.leaderboard(50).await))
}

// ---------------------------------------------------------------------------
// Session supervisor & transport
// ---------------------------------------------------------------------------

async fn run_supervisor(
    state: AppState,
    run_flag: Arc<AtomicBool>,
    mut stop_rx: oneshot::Receiver<()>,
) {
    info!("session supervisor started");
    while run_flag.load(Ordering::SeqCst) {
        let config = { state.session.lock().await.config.clone() };
        let Some(config) = config else {
            warn!("supervisor started without session config");
            break;
        };

        let cached = { state.session.lock().await.credential.clone() };
        let credential = match cached {
            Some(credential) => credential,
            None => {
                state.set_status(SessionStatus::FetchingCredential).await;
                match fetch_credential(&state, &config).await {
                    Ok(credential) => {
                        state.session.lock().await.credential = Some(credential.clone());
                        credential
                    }
                    Err(error) => {
                        warn!(error = %error, "credential fetch failed");
                        state.set_status(SessionStatus::AuthFailed).await;
                        tokio::time::sleep(Duration::from_secs(AUTH_RETRY_BACKOFF_SECS)).await;
                        continue;
                    }
                }
            }
        };

        state.set_status(SessionStatus::Connecting).await;
        match run_connection(&state, &config, &credential, &mut stop_rx).await {
            Ok(()) => info!("chat connection closed"),
            Err(error) => {
                warn!(error = %error, "chat connection failed");
                state
                    .history
                    .push_debug(
                        "SYSTEM",
                        serde_json::json!({"connection_error": error.to_string()}),
                    )
                    .await;
            }
        }
        state.chat.detach().await;

        if run_flag.load(Ordering::SeqCst) {
            state.set_status(SessionStatus::Retrying).await;
            tokio::time::sleep(Duration::from_secs(RECONNECT_BACKOFF_SECS)).await;
        }
    }
    // A fresh generation may already be running; only it owns the status
    // then.
    if !state.should_run.load(Ordering::SeqCst) {
        state.set_status(SessionStatus::Disconnected).await;
    }
    info!("session supervisor stopped");
}

async fn fetch_credential(state: &AppState, config: &SessionConfig) -> anyhow::Result<Credential> {
    let response = state
        .client
        .post(&state.login_url)
        .timeout(Duration::from_secs(15))
        .json(&serde_json::json!({
            "username": config.username,
            "password": config.password,
        }))
        .send()
        .await
        .context("login request failed")?;

    let status = response.status();
    state
        .history
        .push_debug("API_LOGIN", serde_json::json!({"status": status.as_u16()}))
        .await;
    if !status.is_success() {
        anyhow::bail!("login endpoint returned {status}");
    }

    let body: serde_json::Value = response.json().await.context("invalid login response")?;
    // The token sits either at the top level or under `data`.
    let token = body
        .get("token")
        .and_then(|value| value.as_str())
        .or_else(|| {
            body.get("data")
                .and_then(|data| data.get("token"))
                .and_then(|value| value.as_str())
        })
        .ok_or_else(|| anyhow::anyhow!("login response missing token"))?;

    Ok(Credential {
        token: token.to_string(),
    })
}

async fn run_connection(
    state: &AppState,
    config: &SessionConfig,
    credential: &Credential,
    stop_rx: &mut oneshot::Receiver<()>,
) -> anyhow::Result<()> {
    let url = format!("{}?token={}", state.ws_url, credential.token);
    let (ws_stream, _) = connect_async(url.as_str())
        .await
        .context("websocket connect failed")?;
    info!("chat socket connected");
    state.set_status(SessionStatus::Authenticating).await;
    let (mut sink, mut stream) = ws_stream.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<OutboundEvent>();
    state.chat.attach(tx).await;

    send_on_sink(
        &mut sink,
        &state.history,
        OutboundEvent::Login {
            username: config.username.clone(),
            password: config.password.clone(),
        },
    )
    .await?;
    tokio::time::sleep(Duration::from_millis(LOGIN_JOIN_DELAY_MS)).await;
    send_on_sink(
        &mut sink,
        &state.history,
        OutboundEvent::Joinchatroom {
            id: Uuid::new_v4().to_string(),
            name: config.room.clone(),
            room_password: String::new(),
        },
    )
    .await?;
    state.set_status(SessionStatus::Online).await;

    let mut keepalive = tokio::time::interval(Duration::from_secs(KEEPALIVE_INTERVAL_SECS));
    keepalive.tick().await; // consume the immediate first tick

    loop {
        tokio::select! {
            _ = &mut *stop_rx => {
                info!("closing chat socket on stop request");
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
            maybe_event = rx.recv() => {
                let Some(event) = maybe_event else { break };
                send_on_sink(&mut sink, &state.history, event).await?;
            }
            _ = keepalive.tick() => {
                let payload = serde_json::to_string(&OutboundEvent::Ping)
                    .context("failed to encode keep-alive")?;
                if let Err(error) = sink.send(Message::Text(payload)).await {
                    warn!(error = %error, "keep-alive send failed");
                    break;
                }
            }
            maybe_message = stream.next() => {
                match maybe_message {
                    Some(Ok(Message::Text(text))) => route_inbound(state, &text).await,
                    Some(Ok(Message::Close(_))) | None => {
                        info!("chat socket closed by peer");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(error)) => {
                        warn!(error = %error, "chat socket read error");
                        break;
                    }
                }
            }
        }
    }

    Ok(())
}

async fn send_on_sink(
    sink: &mut WsSink,
    history: &History,
    event: OutboundEvent,
) -> anyhow::Result<()> {
    if !matches!(event, OutboundEvent::Ping) {
        history
            .push_debug("OUT", serde_json::to_value(&event)?)
            .await;
    }
    let payload = serde_json::to_string(&event).context("failed to encode outbound event")?;
    sink.send(Message::Text(payload))
        .await
        .context("websocket send failed")
}

// ---------------------------------------------------------------------------
// Message router
// ---------------------------------------------------------------------------

async fn route_inbound(state: &AppState, raw: &str) {
    let value: serde_json::Value = match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(error) => {
            warn!(error = %error, "ignoring malformed inbound event");
            return;
        }
    };
    let event: InboundEvent = match serde_json::from_value(value.clone()) {
        Ok(event) => event,
        Err(error) => {
            warn!(error = %error, "ignoring unreadable inbound event");
            return;
        }
    };

    if !event.is_keepalive_noise() {
        state.history.push_debug("IN", value).await;
    }

    if event.is_join_ack() {
        if let Some(roomid) = event.roomid.clone() {
            state.session.lock().await.room_id = Some(roomid.clone());
            info!(room_id = %roomid, "captured canonical room id");
            state
                .history
                .push_debug("SYSTEM", serde_json::json!({"captured_room_id": roomid}))
                .await;
        }
    }

    if let (Some(sender), Some(avatar)) = (event.sender(), event.avatar_url.as_deref()) {
        if !avatar.is_empty() {
            state
                .avatars
                .lock()
                .await
                .insert(sender.to_string(), avatar.to_string());
        }
    }

    if event.is_chat_message() {
        if let (Some(sender), Some(body)) = (event.sender(), event.message_body()) {
            let avatar = state
                .avatars
                .lock()
                .await
                .get(sender)
                .cloned()
                .unwrap_or_else(|| DEFAULT_AVATAR_URL.to_string());
            state.history.push_chat(sender, body, &avatar, "text").await;

            let own_message = {
                state
                    .session
                    .lock()
                    .await
                    .config
                    .as_ref()
                    .map(|config| config.username == sender)
                    .unwrap_or(false)
            };
            if !own_message {
                handle_command(state, sender, body).await;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Game engine
// ---------------------------------------------------------------------------

async fn handle_command(state: &AppState, user: &str, raw: &str) {
    let Some(command) = parse_command(raw) else {
        return;
    };

    match command {
        Command::Help => state.send_text(HELP_TEXT).await,
        Command::Score => {
            let balance = state.ledger.get(user).await;
            state
                .send_text(&format!("💳 {user}: **{balance}** pts"))
                .await;
        }
        Command::Reset => handle_reset(state, user).await,
        Command::Flip(guess) => {
            let task_state = state.clone();
            let user = user.to_string();
            tokio::spawn(async move {
                run_flip(&task_state, &user, guess).await;
            });
        }
        Command::Start { pvp, bet } => handle_start(state, user, pvp, bet).await,
        Command::Join { host } => handle_join(state, user, &host).await,
        Command::Move(cell) => handle_move(state, user, cell).await,
    }
}

async fn handle_reset(state: &AppState, user: &str) {
    let removed = { state.matches.lock().await.remove(user) };
    match removed {
        Some(game) => {
            for (player, amount) in refund_list(&game) {
                state.ledger.adjust(&player, amount, None).await;
            }
            info!(host = %user, "match reset by host");
            state.send_text(&format!("♻ Game reset for {user}.")).await;
        }
        None => {
            state
                .send_text(&format!("⚠ {user}, no active game found."))
                .await;
        }
    }
}

async fn handle_start(state: &AppState, user: &str, pvp: bool, bet: i64) {
    let mut matches = state.matches.lock().await;
    if matches.values().any(|game| game.involves(user)) {
        drop(matches);
        state
            .send_text(&format!("⚠ {user}, finish your game or `!reset` first."))
            .await;
        return;
    }

    if bet > 0 {
        if state.ledger.get(user).await < bet {
            drop(matches);
            state.send_text("⚠ Low balance!").await;
            return;
        }
        state.ledger.adjust(user, -bet, None).await;
    }

    let mode = if pvp {
        MatchMode::VersusPlayer
    } else {
        MatchMode::VersusBot
    };
    let game = Match {
        host: user.to_string(),
        mode,
        board: [None; 9],
        turn: Mark::X,
        player_x: user.to_string(),
        player_o: (mode == MatchMode::VersusBot).then(|| BOT_PLAYER_NAME.to_string()),
        bet,
        last_active: Instant::now(),
    };
    let board = game.board;
    matches.insert(user.to_string(), game);
    drop(matches);

    info!(host = %user, ?mode, bet, "match created");
    send_rendered_board(state, &board, None).await;
    let bet_note = if bet > 0 {
        format!(" (Bet: {bet})")
    } else {
        String::new()
    };
    if pvp {
        state
            .send_text(&format!(
                "🎮 **PvP LOBBY{bet_note}**\nHost: {user}\nWaiting: `!join {user}`"
            ))
            .await;
    } else {
        state
            .send_text(&format!(
                "🤖 **BOT MATCH{bet_note}**\n{user} (X) vs {BOT_PLAYER_NAME} (O)\nType `1-9` to move."
            ))
            .await;
    }
}

async fn handle_join(state: &AppState, user: &str, host_target: &str) {
    let mut matches = state.matches.lock().await;
    if matches.values().any(|game| game.involves(user)) {
        drop(matches);
        state.send_text("⚠ You are already playing.").await;
        return;
    }

    let Some(host_key) = matches
        .keys()
        .find(|key| key.eq_ignore_ascii_case(host_target))
        .cloned()
    else {
        drop(matches);
        state.send_text("⚠ Game not found.").await;
        return;
    };

    let (bet, full) = match matches.get(&host_key) {
        Some(game) => (
            game.bet,
            game.mode == MatchMode::VersusBot || game.player_o.is_some(),
        ),
        None => return,
    };
    if full {
        drop(matches);
        state.send_text("⚠ Lobby full.").await;
        return;
    }

    if bet > 0 {
        if state.ledger.get(user).await < bet {
            drop(matches);
            state.send_text("⚠ No funds.").await;
            return;
        }
        state.ledger.adjust(user, -bet, None).await;
    }

    let host_name = match matches.get_mut(&host_key) {
        Some(game) => {
            game.player_o = Some(user.to_string());
            game.last_active = Instant::now();
            game.player_x.clone()
        }
        None => return,
    };
    drop(matches);

    info!(host = %host_key, joiner = %user, bet, "match joined");
    let pot_note = if bet > 0 {
        format!("\n💰 POT: {}", bet * 2)
    } else {
        String::new()
    };
    state
        .send_text(&format!(
            "⚔ **MATCH STARTED!**\n{user} (O) joined {host_name}.{pot_note}"
        ))
        .await;
}

async fn handle_move(state: &AppState, user: &str, cell: u8) {
    let mut matches = state.matches.lock().await;
    let Some(host_key) = matches
        .values()
        .find(|game| game.involves(user))
        .map(|game| game.host.clone())
    else {
        return;
    };
    let Some(game) = matches.get_mut(&host_key) else {
        return;
    };

    if game.mode == MatchMode::VersusPlayer && game.player_o.is_none() {
        drop(matches);
        state
            .send_text(&format!("⚠ {user}, waiting for a second player!"))
            .await;
        return;
    }

    match game.mode {
        MatchMode::VersusBot => {
            if user != game.player_x || game.turn == Mark::O {
                return;
            }
        }
        MatchMode::VersusPlayer => {
            if game.mover_for_turn() != Some(user) {
                return;
            }
        }
    }

    let idx = (cell - 1) as usize;
    if game.board[idx].is_some() {
        drop(matches);
        state.send_text("⚠ Taken!").await;
        return;
    }
    game.last_active = Instant::now();
    game.board[idx] = Some(game.turn);

    match resolve_turn(&mut matches, &host_key, user) {
        TurnOutcome::Continue => {
            let Some(game) = matches.get_mut(&host_key) else {
                return;
            };
            if game.mode == MatchMode::VersusBot {
                game.turn = Mark::O;
                drop(matches);
                let task_state = state.clone();
                let host = host_key.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(BOT_REPLY_DELAY_MS)).await;
                    run_bot_reply(&task_state, &host).await;
                });
            } else {
                game.turn = game.turn.other();
                let board = game.board;
                drop(matches);
                send_rendered_board(state, &board, None).await;
            }
        }
        outcome => {
            drop(matches);
            settle_outcome(state, outcome).await;
        }
    }
}

/// Win/draw detection after a placed mark. Lines are checked before board
/// fullness; a finished match is removed from the table while the caller
/// still holds the lock.
fn resolve_turn(matches: &mut HashMap<String, Match>, host_key: &str, mover: &str) -> TurnOutcome {
    let (board, bet) = match matches.get(host_key) {
        Some(game) => (game.board, game.bet),
        None => return TurnOutcome::Continue,
    };

    if let Some(line) = winning_line(&board) {
        matches.remove(host_key);
        return TurnOutcome::Win {
            board,
            line,
            mover: mover.to_string(),
            bet,
        };
    }

    if board_is_full(&board) {
        if let Some(game) = matches.remove(host_key) {
            return TurnOutcome::Draw {
                board,
                refunds: refund_list(&game),
            };
        }
    }

    TurnOutcome::Continue
}

async fn settle_outcome(state: &AppState, outcome: TurnOutcome) {
    match outcome {
        TurnOutcome::Continue => {}
        TurnOutcome::Win {
            board,
            line,
            mover,
            bet,
        } => {
            send_rendered_board(state, &board, Some(line)).await;
            let mut prize_note = String::new();
            if is_human(&mover) {
                let amount = if bet > 0 { bet * 2 } else { FLAT_WIN_REWARD };
                let avatar = state.avatars.lock().await.get(&mover).cloned();
                state.ledger.adjust(&mover, amount, avatar.as_deref()).await;
                prize_note = format!(" (+{amount} pts)");
            }
            info!(winner = %mover, bet, "match won");
            state
                .send_text(&format!("🏆 **{mover} WINS!**{prize_note}"))
                .await;
        }
        TurnOutcome::Draw { board, refunds } => {
            send_rendered_board(state, &board, None).await;
            let refunded = !refunds.is_empty();
            for (player, amount) in refunds {
                state.ledger.adjust(&player, amount, None).await;
            }
            info!(refunded, "match drawn");
            state
                .send_text(if refunded {
                    "🤝 **DRAW!** Wagers refunded."
                } else {
                    "🤝 **DRAW!**"
                })
                .await;
        }
    }
}

/// Delayed opponent reply. Re-checks that the match still exists: it may
/// have been reset or reaped while this task was sleeping.
async fn run_bot_reply(state: &AppState, host: &str) {
    let mut matches = state.matches.lock().await;
    let Some(game) = matches.get_mut(host) else {
        return;
    };
    if game.mode != MatchMode::VersusBot || game.turn != Mark::O {
        return;
    }

    let chosen = {
        let mut rng = rand::rng();
        choose_bot_move(&game.board, &mut rng)
    };
    let Some(mv) = chosen else {
        return;
    };
    game.board[mv] = Some(Mark::O);
    game.last_active = Instant::now();

    match resolve_turn(&mut matches, host, BOT_PLAYER_NAME) {
        TurnOutcome::Continue => {
            let Some(game) = matches.get_mut(host) else {
                return;
            };
            game.turn = Mark::X;
            let board = game.board;
            drop(matches);
            send_rendered_board(state, &board, None).await;
        }
        outcome => {
            drop(matches);
            settle_outcome(state, outcome).await;
        }
    }
}

async fn send_rendered_board(state: &AppState, board: &Board, line: Option<[usize; 3]>) {
    match state.renderer.board(board, line).await {
        Ok(url) => state.send_image(&url).await,
        Err(error) => {
            debug!(error = %error, "board render unavailable; sending text fallback");
            state
                .send_text(&format!("🖼 {}", board_text(board)))
                .await;
        }
    }
}

// ---------------------------------------------------------------------------
// Coin flip
// ---------------------------------------------------------------------------

async fn run_flip(state: &AppState, user: &str, guess: Option<CoinFace>) {
    state
        .send_text(&format!("@{user} tossed the coin! 🌪️"))
        .await;
    match state.renderer.coin_toss().await {
        Ok(url) => state.send_image(&url).await,
        Err(error) => debug!(error = %error, "coin toss artifact unavailable"),
    }

    tokio::time::sleep(Duration::from_millis(FLIP_REVEAL_DELAY_MS)).await;
    let outcome = {
        let mut rng = rand::rng();
        CoinFace::flip(&mut rng)
    };
    match state.renderer.coin_face(outcome).await {
        Ok(url) => state.send_image(&url).await,
        Err(error) => debug!(error = %error, "coin face artifact unavailable"),
    }

    tokio::time::sleep(Duration::from_millis(FLIP_SETTLE_DELAY_MS)).await;
    settle_flip(state, user, guess, outcome).await;
}

/// The single ledger settlement of a flip: one credit or debit when a guess
/// was made, a plain balance read otherwise.
async fn settle_flip(state: &AppState, user: &str, guess: Option<CoinFace>, outcome: CoinFace) {
    let mut text = format!("✨ Result: **{outcome}**");
    let balance = match guess {
        Some(guess) if guess == outcome => {
            let balance = state.ledger.adjust(user, FLIP_WIN_REWARD, None).await;
            text.push_str(&format!("\n🎉 **YOU WON!** (+{FLIP_WIN_REWARD} pts)"));
            balance
        }
        Some(_) => {
            let balance = state.ledger.adjust(user, -FLIP_LOSS_PENALTY, None).await;
            text.push_str(&format!("\n❌ **YOU LOST** (-{FLIP_LOSS_PENALTY} pts)"));
            balance
        }
        None => state.ledger.get(user).await,
    };
    text.push_str(&format!("\n💰 Balance: {balance}"));
    state.send_text(&text).await;
}

// ---------------------------------------------------------------------------
// Idle reaper
// ---------------------------------------------------------------------------

async fn run_idle_reaper(state: AppState, run_flag: Arc<AtomicBool>) {
    info!("idle reaper started");
    while run_flag.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_secs(IDLE_REAP_INTERVAL_SECS)).await;
        reap_idle_once(&state, Duration::from_secs(IDLE_MATCH_TIMEOUT_SECS)).await;
    }
    info!("idle reaper stopped");
}

async fn reap_idle_once(state: &AppState, timeout: Duration) {
    let stale: Vec<String> = {
        let matches = state.matches.lock().await;
        matches
            .iter()
            .filter(|(_, game)| game.last_active.elapsed() > timeout)
            .map(|(host, _)| host.clone())
            .collect()
    };

    for host in stale {
        // Re-check under the lock: a move or match completion may have
        // raced the scan snapshot.
        let removed = {
            let mut matches = state.matches.lock().await;
            if matches
                .get(&host)
                .map(|game| game.last_active.elapsed() > timeout)
                .unwrap_or(false)
            {
                matches.remove(&host)
            } else {
                None
            }
        };
        let Some(game) = removed else { continue };

        for (player, amount) in refund_list(&game) {
            state.ledger.adjust(&player, amount, None).await;
        }
        info!(host = %host, "idle match evicted");
        state
            .send_text(&format!("🛑 **TIMEOUT!** Game hosted by {host} ended."))
            .await;
    }
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn conflict(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        warn!(status = %self.status, message = %self.message, "chat-bot-service request failed");
        (
            self.status,
            Json(serde_json::json!({"error": self.message})),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use titan_common::STARTING_BALANCE;
    use tokio::sync::mpsc::UnboundedReceiver;

    async fn test_state() -> (AppState, UnboundedReceiver<OutboundEvent>) {
        let state = AppState::new(
            Arc::new(MemoryLedger::new()),
            Arc::new(NullRenderer),
            "http://localhost/login".to_string(),
            "ws://localhost/chat".to_string(),
        );
        {
            let mut session = state.session.lock().await;
            session.config = Some(SessionConfig {
                username: "titanbot".to_string(),
                password: "secret".to_string(),
                room: "lobby".to_string(),
            });
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.chat.attach(tx).await;
        (state, rx)
    }

    fn drain_texts(rx: &mut UnboundedReceiver<OutboundEvent>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let OutboundEvent::Chatroommessage { text, .. } = event {
                out.push(text);
            }
        }
        out
    }

    async fn set_board(state: &AppState, host: &str, cells: [char; 9], turn: Mark) {
        let mut matches = state.matches.lock().await;
        let game = matches.get_mut(host).unwrap();
        for (idx, cell) in cells.iter().enumerate() {
            game.board[idx] = match cell {
                'X' => Some(Mark::X),
                'O' => Some(Mark::O),
                _ => None,
            };
        }
        game.turn = turn;
    }

    #[tokio::test]
    async fn score_reports_starting_balance() {
        let (state, mut rx) = test_state().await;
        handle_command(&state, "alice", "!score").await;
        let texts = drain_texts(&mut rx);
        assert!(texts.iter().any(|t| t.contains("1000")));
    }

    #[tokio::test]
    async fn start_with_bet_escrows_stake() {
        let (state, _rx) = test_state().await;
        handle_command(&state, "alice", "!start bet 100").await;
        assert_eq!(state.ledger.get("alice").await, 900);
        let matches = state.matches.lock().await;
        let game = matches.get("alice").unwrap();
        assert_eq!(game.bet, 100);
        assert_eq!(game.mode, MatchMode::VersusBot);
        assert_eq!(game.player_o.as_deref(), Some(BOT_PLAYER_NAME));
    }

    #[tokio::test]
    async fn start_rejects_insufficient_funds() {
        let (state, mut rx) = test_state().await;
        handle_command(&state, "alice", "!start bet 5000").await;
        assert_eq!(state.ledger.get("alice").await, STARTING_BALANCE);
        assert!(state.matches.lock().await.is_empty());
        let texts = drain_texts(&mut rx);
        assert!(texts.iter().any(|t| t.contains("Low balance")));
    }

    #[tokio::test]
    async fn second_start_is_rejected() {
        let (state, mut rx) = test_state().await;
        handle_command(&state, "alice", "!start bet 100").await;
        handle_command(&state, "alice", "!start bet 100").await;
        // Only one escrow, only one match.
        assert_eq!(state.ledger.get("alice").await, 900);
        assert_eq!(state.matches.lock().await.len(), 1);
        let texts = drain_texts(&mut rx);
        assert!(texts.iter().any(|t| t.contains("!reset")));
    }

    #[tokio::test]
    async fn join_escrows_matching_stake() {
        let (state, mut rx) = test_state().await;
        handle_command(&state, "alice", "!start pvp bet 100").await;
        handle_command(&state, "bob", "!join Alice").await;
        assert_eq!(state.ledger.get("alice").await, 900);
        assert_eq!(state.ledger.get("bob").await, 900);
        let matches = state.matches.lock().await;
        assert_eq!(
            matches.get("alice").unwrap().player_o.as_deref(),
            Some("bob")
        );
        drop(matches);
        let texts = drain_texts(&mut rx);
        assert!(texts.iter().any(|t| t.contains("MATCH STARTED")));
    }

    #[tokio::test]
    async fn participant_cannot_enter_second_match() {
        let (state, mut rx) = test_state().await;
        handle_command(&state, "alice", "!start pvp").await;
        handle_command(&state, "bob", "!start").await;
        handle_command(&state, "bob", "!join alice").await;
        let matches = state.matches.lock().await;
        assert_eq!(matches.len(), 2);
        assert!(matches.get("alice").unwrap().player_o.is_none());
        drop(matches);
        let texts = drain_texts(&mut rx);
        assert!(texts.iter().any(|t| t.contains("already playing")));
    }

    #[tokio::test]
    async fn join_rejects_bot_match_and_missing_host() {
        let (state, mut rx) = test_state().await;
        handle_command(&state, "alice", "!start").await;
        handle_command(&state, "bob", "!join alice").await;
        handle_command(&state, "bob", "!join nobody").await;
        let texts = drain_texts(&mut rx);
        assert!(texts.iter().any(|t| t.contains("Lobby full")));
        assert!(texts.iter().any(|t| t.contains("Game not found")));
        assert_eq!(state.ledger.get("bob").await, STARTING_BALANCE);
    }

    #[tokio::test]
    async fn pvp_win_pays_double_stake_and_removes_match() {
        let (state, mut rx) = test_state().await;
        handle_command(&state, "alice", "!start pvp bet 100").await;
        handle_command(&state, "bob", "!join alice").await;

        // alice (X): 5, 2, 8 completes the middle column; bob (O): 1, 4.
        for (user, mv) in [
            ("alice", "5"),
            ("bob", "1"),
            ("alice", "2"),
            ("bob", "4"),
            ("alice", "8"),
        ] {
            handle_command(&state, user, mv).await;
        }

        assert_eq!(state.ledger.get("alice").await, 1100);
        assert_eq!(state.ledger.get("bob").await, 900);
        assert!(state.matches.lock().await.is_empty());
        let texts = drain_texts(&mut rx);
        assert!(texts.iter().any(|t| t.contains("alice WINS")));
    }

    #[tokio::test]
    async fn win_without_stake_pays_flat_reward() {
        let (state, mut rx) = test_state().await;
        handle_command(&state, "alice", "!start pvp").await;
        handle_command(&state, "bob", "!join alice").await;
        for (user, mv) in [
            ("alice", "1"),
            ("bob", "4"),
            ("alice", "2"),
            ("bob", "5"),
            ("alice", "3"),
        ] {
            handle_command(&state, user, mv).await;
        }
        assert_eq!(state.ledger.get("alice").await, 1050);
        assert_eq!(state.ledger.get("bob").await, STARTING_BALANCE);
        let texts = drain_texts(&mut rx);
        assert!(texts.iter().any(|t| t.contains("+50 pts")));
    }

    #[tokio::test]
    async fn draw_refunds_all_human_stakes() {
        let (state, mut rx) = test_state().await;
        handle_command(&state, "alice", "!start pvp bet 100").await;
        handle_command(&state, "bob", "!join alice").await;
        assert_eq!(state.ledger.get("alice").await, 900);
        assert_eq!(state.ledger.get("bob").await, 900);

        // One empty cell left, no line, alice (X) to move into it.
        set_board(
            &state,
            "alice",
            ['X', 'O', 'X', 'X', 'O', 'O', 'O', 'X', ' '],
            Mark::X,
        )
        .await;
        handle_command(&state, "alice", "9").await;

        assert!(state.matches.lock().await.is_empty());
        assert_eq!(state.ledger.get("alice").await, STARTING_BALANCE);
        assert_eq!(state.ledger.get("bob").await, STARTING_BALANCE);
        let texts = drain_texts(&mut rx);
        assert!(texts.iter().any(|t| t.contains("DRAW")));
    }

    #[tokio::test]
    async fn occupied_cell_is_rejected_without_mutation() {
        let (state, mut rx) = test_state().await;
        handle_command(&state, "alice", "!start pvp").await;
        handle_command(&state, "bob", "!join alice").await;
        handle_command(&state, "alice", "5").await;
        drain_texts(&mut rx);

        handle_command(&state, "bob", "5").await;
        let matches = state.matches.lock().await;
        let game = matches.get("alice").unwrap();
        assert_eq!(game.board[4], Some(Mark::X));
        assert_eq!(game.turn, Mark::O);
        drop(matches);
        let texts = drain_texts(&mut rx);
        assert!(texts.iter().any(|t| t.contains("Taken")));
    }

    #[tokio::test]
    async fn out_of_turn_move_is_silently_ignored() {
        let (state, mut rx) = test_state().await;
        handle_command(&state, "alice", "!start pvp").await;
        handle_command(&state, "bob", "!join alice").await;
        drain_texts(&mut rx);

        // Turn is X (alice); bob's move must not mutate anything.
        handle_command(&state, "bob", "5").await;
        let matches = state.matches.lock().await;
        let game = matches.get("alice").unwrap();
        assert!(game.board.iter().all(|cell| cell.is_none()));
        assert_eq!(game.turn, Mark::X);
        drop(matches);
        assert!(drain_texts(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn move_before_second_player_warns() {
        let (state, mut rx) = test_state().await;
        handle_command(&state, "alice", "!start pvp").await;
        drain_texts(&mut rx);
        handle_command(&state, "alice", "5").await;
        let texts = drain_texts(&mut rx);
        assert!(texts.iter().any(|t| t.contains("waiting for a second player")));
    }

    #[tokio::test]
    async fn reset_refunds_host_and_joiner() {
        let (state, mut rx) = test_state().await;
        handle_command(&state, "alice", "!start pvp bet 200").await;
        handle_command(&state, "bob", "!join alice").await;
        handle_command(&state, "alice", "!reset").await;

        assert!(state.matches.lock().await.is_empty());
        assert_eq!(state.ledger.get("alice").await, STARTING_BALANCE);
        assert_eq!(state.ledger.get("bob").await, STARTING_BALANCE);
        let texts = drain_texts(&mut rx);
        assert!(texts.iter().any(|t| t.contains("reset")));
    }

    #[tokio::test]
    async fn reset_without_match_warns() {
        let (state, mut rx) = test_state().await;
        handle_command(&state, "alice", "!reset").await;
        let texts = drain_texts(&mut rx);
        assert!(texts.iter().any(|t| t.contains("no active game")));
    }

    #[tokio::test]
    async fn bot_reply_blocks_immediate_threat() {
        let (state, _rx) = test_state().await;
        handle_command(&state, "alice", "!start").await;
        // X threatens the middle row at cell 6 (index 5).
        set_board(
            &state,
            "alice",
            [' ', ' ', ' ', 'X', 'X', ' ', 'O', ' ', ' '],
            Mark::O,
        )
        .await;
        run_bot_reply(&state, "alice").await;

        let matches = state.matches.lock().await;
        let game = matches.get("alice").unwrap();
        assert_eq!(game.board[5], Some(Mark::O));
        assert_eq!(game.turn, Mark::X);
    }

    #[tokio::test]
    async fn bot_win_is_uncredited_and_removes_match() {
        let (state, mut rx) = test_state().await;
        handle_command(&state, "alice", "!start").await;
        set_board(
            &state,
            "alice",
            ['O', 'O', ' ', 'X', 'X', 'O', 'X', ' ', ' '],
            Mark::O,
        )
        .await;
        run_bot_reply(&state, "alice").await;

        assert!(state.matches.lock().await.is_empty());
        assert_eq!(state.ledger.get("alice").await, STARTING_BALANCE);
        let texts = drain_texts(&mut rx);
        assert!(texts.iter().any(|t| t.contains(BOT_PLAYER_NAME) && t.contains("WINS")));
    }

    #[tokio::test]
    async fn stale_bot_reply_is_dropped() {
        let (state, mut rx) = test_state().await;
        handle_command(&state, "alice", "!start").await;
        handle_command(&state, "alice", "!reset").await;
        drain_texts(&mut rx);
        run_bot_reply(&state, "alice").await;
        assert!(drain_texts(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn reaper_evicts_only_idle_matches() {
        let (state, mut rx) = test_state().await;
        handle_command(&state, "alice", "!start bet 100").await;
        drain_texts(&mut rx);

        // Fresh match survives the normal timeout window.
        reap_idle_once(&state, Duration::from_secs(60)).await;
        assert_eq!(state.matches.lock().await.len(), 1);

        // With a zero-width window the same match is idle and gets evicted
        // with its escrow refunded.
        tokio::time::sleep(Duration::from_millis(5)).await;
        reap_idle_once(&state, Duration::ZERO).await;
        assert!(state.matches.lock().await.is_empty());
        assert_eq!(state.ledger.get("alice").await, STARTING_BALANCE);
        let texts = drain_texts(&mut rx);
        assert!(texts.iter().any(|t| t.contains("TIMEOUT") && t.contains("alice")));
    }

    #[tokio::test]
    async fn rejected_moves_do_not_refresh_activity() {
        let (state, mut rx) = test_state().await;
        handle_command(&state, "alice", "!start pvp").await;
        handle_command(&state, "bob", "!join alice").await;
        let joined_at = state.matches.lock().await.get("alice").unwrap().last_active;
        drain_texts(&mut rx);

        tokio::time::sleep(Duration::from_millis(5)).await;
        // Turn is X (alice); bob's move is rejected and must leave the
        // activity clock alone.
        handle_command(&state, "bob", "5").await;
        assert_eq!(
            state.matches.lock().await.get("alice").unwrap().last_active,
            joined_at
        );

        handle_command(&state, "alice", "5").await;
        let moved_at = state.matches.lock().await.get("alice").unwrap().last_active;
        assert!(moved_at > joined_at);

        tokio::time::sleep(Duration::from_millis(5)).await;
        // Same for a move onto an occupied cell.
        handle_command(&state, "bob", "5").await;
        assert_eq!(
            state.matches.lock().await.get("alice").unwrap().last_active,
            moved_at
        );
    }

    fn unreachable_state() -> AppState {
        // Port 9 has no listener; connects fail immediately.
        AppState::new(
            Arc::new(MemoryLedger::new()),
            Arc::new(NullRenderer),
            "http://127.0.0.1:9/login".to_string(),
            "ws://127.0.0.1:9".to_string(),
        )
    }

    #[tokio::test]
    async fn cached_credential_survives_connection_failure() {
        let state = unreachable_state();
        {
            let mut session = state.session.lock().await;
            session.config = Some(SessionConfig {
                username: "titanbot".to_string(),
                password: "secret".to_string(),
                room: "lobby".to_string(),
            });
            session.credential = Some(Credential {
                token: "cached-token".to_string(),
            });
        }
        state.should_run.store(true, Ordering::SeqCst);
        let run_flag = Arc::new(AtomicBool::new(true));
        let (_stop_tx, stop_rx) = oneshot::channel();
        let supervisor = tokio::spawn(run_supervisor(state.clone(), run_flag.clone(), stop_rx));

        // Let the supervisor fail the connect and enter its retry backoff.
        tokio::time::sleep(Duration::from_millis(300)).await;
        {
            let session = state.session.lock().await;
            assert_eq!(
                session.credential.as_ref().map(|c| c.token.as_str()),
                Some("cached-token")
            );
        }
        assert_eq!(state.current_status().await, SessionStatus::Retrying);
        run_flag.store(false, Ordering::SeqCst);
        supervisor.abort();
    }

    #[tokio::test]
    async fn restart_does_not_revive_previous_generation() {
        let state = unreachable_state();
        let request = || StartSessionRequest {
            username: "titanbot".to_string(),
            password: "secret".to_string(),
            room: "lobby".to_string(),
        };

        start_session_handler(State(state.clone()), Json(request()))
            .await
            .unwrap();
        let first_flag = {
            let guard = state.supervisor.lock().await;
            guard.as_ref().unwrap().run_flag.clone()
        };
        assert!(first_flag.load(Ordering::SeqCst));

        stop_session_handler(State(state.clone())).await.unwrap();
        assert!(!first_flag.load(Ordering::SeqCst));

        // Restarting flips the shared running flag back on, but the old
        // generation's flag stays cleared for good.
        start_session_handler(State(state.clone()), Json(request()))
            .await
            .unwrap();
        assert!(state.should_run.load(Ordering::SeqCst));
        assert!(!first_flag.load(Ordering::SeqCst));
        let second_flag = {
            let guard = state.supervisor.lock().await;
            guard.as_ref().unwrap().run_flag.clone()
        };
        assert!(second_flag.load(Ordering::SeqCst));
        assert!(!Arc::ptr_eq(&first_flag, &second_flag));

        stop_session_handler(State(state.clone())).await.unwrap();
        assert!(!second_flag.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn flip_settlement_credits_and_debits() {
        let (state, mut rx) = test_state().await;
        settle_flip(&state, "alice", Some(CoinFace::Heads), CoinFace::Heads).await;
        assert_eq!(state.ledger.get("alice").await, 1050);

        settle_flip(&state, "bob", Some(CoinFace::Heads), CoinFace::Tails).await;
        assert_eq!(state.ledger.get("bob").await, 980);

        settle_flip(&state, "carol", None, CoinFace::Tails).await;
        assert_eq!(state.ledger.get("carol").await, STARTING_BALANCE);

        let texts = drain_texts(&mut rx);
        assert!(texts.iter().any(|t| t.contains("YOU WON")));
        assert!(texts.iter().any(|t| t.contains("YOU LOST")));
        assert!(texts.iter().any(|t| t.contains("Balance: 1000")));
    }

    #[tokio::test]
    async fn router_captures_room_id_from_join_ack() {
        let (state, _rx) = test_state().await;
        route_inbound(&state, r#"{"handler":"joinchatroom","roomid":4711}"#).await;
        let session = state.session.lock().await;
        assert_eq!(session.room_id, Some(serde_json::json!(4711)));
    }

    #[tokio::test]
    async fn router_dispatches_foreign_chat_and_ignores_own() {
        let (state, mut rx) = test_state().await;
        route_inbound(
            &state,
            r#"{"handler":"chatroommessage","from":"titanbot","text":"!help"}"#,
        )
        .await;
        assert!(drain_texts(&mut rx).is_empty());

        route_inbound(
            &state,
            r#"{"handler":"chatroommessage","from":"alice","text":"!help"}"#,
        )
        .await;
        let texts = drain_texts(&mut rx);
        assert!(texts.iter().any(|t| t.contains("COMMANDS")));
    }

    #[tokio::test]
    async fn router_ignores_malformed_and_unknown_events() {
        let (state, mut rx) = test_state().await;
        route_inbound(&state, "this is not json").await;
        route_inbound(&state, r#"{"handler":"presence","who":"alice"}"#).await;
        assert!(drain_texts(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn router_records_avatars_for_payouts() {
        let (state, _rx) = test_state().await;
        route_inbound(
            &state,
            r#"{"handler":"chatroommessage","from":"alice","text":"hi","avatar_url":"http://a/1.png"}"#,
        )
        .await;
        let avatars = state.avatars.lock().await;
        assert_eq!(avatars.get("alice").map(String::as_str), Some("http://a/1.png"));
    }

    #[tokio::test]
    async fn history_buffers_are_bounded() {
        let history = History::default();
        for i in 0..(CHAT_HISTORY_CAP + 20) {
            history.push_chat("u", &format!("m{i}"), "", "text").await;
        }
        for i in 0..(DEBUG_LOG_CAP + 20) {
            history.push_debug("IN", serde_json::json!({"seq": i})).await;
        }
        assert_eq!(history.chat_entries().await.len(), CHAT_HISTORY_CAP);
        assert_eq!(history.debug_entries().await.len(), DEBUG_LOG_CAP);
        // Oldest entries are the ones dropped.
        assert_eq!(history.chat_entries().await[0].msg, "m20");
    }

    #[tokio::test]
    async fn dead_connection_drops_sends_silently() {
        let (state, rx) = test_state().await;
        drop(rx);
        state.chat.detach().await;
        // Must not panic or error.
        state.send_text("hello").await;
        handle_command(&state, "alice", "!score").await;
    }
}
