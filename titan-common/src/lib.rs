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

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

pub const STARTING_BALANCE: i64 = 1000;
pub const FLAT_WIN_REWARD: i64 = 50;
pub const FLIP_WIN_REWARD: i64 = 50;
pub const FLIP_LOSS_PENALTY: i64 = 20;

/// Synthetic opponent identity used as the second player in bot matches.
pub const BOT_PLAYER_NAME: &str = "🤖 TitanBot";

pub const KEEPALIVE_INTERVAL_SECS: u64 = 20;
pub const LOGIN_JOIN_DELAY_MS: u64 = 500;
pub const AUTH_RETRY_BACKOFF_SECS: u64 = 10;
pub const RECONNECT_BACKOFF_SECS: u64 = 5;
pub const IDLE_MATCH_TIMEOUT_SECS: u64 = 60;
pub const IDLE_REAP_INTERVAL_SECS: u64 = 5;
pub const BOT_REPLY_DELAY_MS: u64 = 1000;
pub const FLIP_REVEAL_DELAY_MS: u64 = 3500;
pub const FLIP_SETTLE_DELAY_MS: u64 = 500;

// ---------------------------------------------------------------------------
// Board primitives
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Mark {
    X,
    O,
}

impl Mark {
    pub fn other(self) -> Self {
        match self {
            Mark::X => Mark::O,
            Mark::O => Mark::X,
        }
    }
}

impl fmt::Display for Mark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mark::X => write!(f, "X"),
            Mark::O => write!(f, "O"),
        }
    }
}

pub type Board = [Option<Mark>; 9];

/// The eight winning lines in detection order: rows, columns, diagonals.
/// Both win detection and the opponent heuristic depend on this exact order.
pub const WIN_LINES: [[usize; 3]; 8] = [
    [0, 1, 2],
    [3, 4, 5],
    [6, 7, 8],
    [0, 3, 6],
    [1, 4, 7],
    [2, 5, 8],
    [0, 4, 8],
    [2, 4, 6],
];

/// First line (in `WIN_LINES` order) holding three equal non-empty marks.
pub fn winning_line(board: &Board) -> Option<[usize; 3]> {
    for &line in &WIN_LINES {
        let [x, y, z] = line;
        if board[x].is_some() && board[x] == board[y] && board[y] == board[z] {
            return Some(line);
        }
    }
    None
}

pub fn board_is_full(board: &Board) -> bool {
    board.iter().all(|cell| cell.is_some())
}

/// Textual fallback used when board rendering is unavailable. Empty cells
/// show their 1-9 move number.
pub fn board_text(board: &Board) -> String {
    (0..3)
        .map(|row| {
            (0..3)
                .map(|col| {
                    let idx = row * 3 + col;
                    match board[idx] {
                        Some(mark) => mark.to_string(),
                        None => (idx + 1).to_string(),
                    }
                })
                .collect::<Vec<_>>()
                .join("|")
        })
        .collect::<Vec<_>>()
        .join(" / ")
}

/// Opponent move selection: complete an own line, else block the human's
/// next win, else pick uniformly among empty cells. Ties break by the
/// `WIN_LINES` enumeration order and, within a line, by checking the
/// (x,y)->z, (x,z)->y, (y,z)->x configurations in that order.
pub fn choose_bot_move<R: Rng>(board: &Board, rng: &mut R) -> Option<usize> {
    let empty: Vec<usize> = (0..9).filter(|&i| board[i].is_none()).collect();
    if empty.is_empty() {
        return None;
    }

    for side in [Mark::O, Mark::X] {
        for &[x, y, z] in &WIN_LINES {
            if board[x] == Some(side) && board[y] == Some(side) && board[z].is_none() {
                return Some(z);
            }
            if board[x] == Some(side) && board[z] == Some(side) && board[y].is_none() {
                return Some(y);
            }
            if board[y] == Some(side) && board[z] == Some(side) && board[x].is_none() {
                return Some(x);
            }
        }
    }

    Some(empty[rng.random_range(0..empty.len())])
}

// ---------------------------------------------------------------------------
// Coin flip
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CoinFace {
    Heads,
    Tails,
}

impl CoinFace {
    pub fn flip<R: Rng>(rng: &mut R) -> Self {
        if rng.random_bool(0.5) {
            CoinFace::Heads
        } else {
            CoinFace::Tails
        }
    }

    pub fn parse_guess(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "h" | "head" | "heads" => Some(CoinFace::Heads),
            "t" | "tail" | "tails" => Some(CoinFace::Tails),
            _ => None,
        }
    }
}

impl fmt::Display for CoinFace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoinFace::Heads => write!(f, "HEADS"),
            CoinFace::Tails => write!(f, "TAILS"),
        }
    }
}

// ---------------------------------------------------------------------------
// Chat commands
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    Score,
    Reset,
    Flip(Option<CoinFace>),
    Start { pvp: bool, bet: i64 },
    Join { host: String },
    Move(u8),
}

/// Interpret a raw chat line as a game command. Text is trimmed and
/// case-folded first; anything unrecognized is `None` and ignored.
pub fn parse_command(raw: &str) -> Option<Command> {
    let msg = raw.trim().to_lowercase();

    match msg.as_str() {
        "!help" => return Some(Command::Help),
        "!score" => return Some(Command::Score),
        "!reset" => return Some(Command::Reset),
        _ => {}
    }

    if msg.starts_with("!flip") {
        let guess = msg
            .split_whitespace()
            .nth(1)
            .and_then(CoinFace::parse_guess);
        return Some(Command::Flip(guess));
    }

    if msg.starts_with("!start") {
        let tokens: Vec<&str> = msg.split_whitespace().collect();
        let pvp = tokens.contains(&"pvp");
        let bet = tokens
            .iter()
            .position(|token| *token == "bet")
            .and_then(|pos| tokens.get(pos + 1))
            .and_then(|token| token.parse::<i64>().ok())
            .unwrap_or(0)
            .max(0);
        return Some(Command::Start { pvp, bet });
    }

    if msg.starts_with("!join") {
        let host = msg.split_whitespace().nth(1)?.to_string();
        return Some(Command::Join { host });
    }

    if let Ok(cell) = msg.parse::<u8>() {
        if (1..=9).contains(&cell) {
            return Some(Command::Move(cell));
        }
    }

    None
}

// ---------------------------------------------------------------------------
// Wire protocol
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "handler", rename_all = "lowercase")]
pub enum OutboundEvent {
    Login {
        username: String,
        password: String,
    },
    Joinchatroom {
        id: String,
        name: String,
        #[serde(rename = "roomPassword")]
        room_password: String,
    },
    Ping,
    Chatroommessage {
        id: String,
        #[serde(rename = "type")]
        kind: String,
        roomid: serde_json::Value,
        text: String,
        url: String,
        length: String,
    },
}

/// Loosely-typed inbound event; the service only models the fields it needs
/// and tolerates everything else. Sender and body each arrive under one of
/// two keys depending on the message path.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InboundEvent {
    #[serde(default)]
    pub handler: Option<String>,
    #[serde(default)]
    pub roomid: Option<serde_json::Value>,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

impl InboundEvent {
    pub fn sender(&self) -> Option<&str> {
        self.from.as_deref().or(self.username.as_deref())
    }

    pub fn message_body(&self) -> Option<&str> {
        self.text.as_deref().or(self.body.as_deref())
    }

    pub fn is_chat_message(&self) -> bool {
        matches!(
            self.handler.as_deref(),
            Some("chatroommessage") | Some("message")
        )
    }

    pub fn is_join_ack(&self) -> bool {
        self.handler.as_deref() == Some("joinchatroom") && self.roomid.is_some()
    }

    /// Keep-alive and receipt traffic is excluded from the protocol debug log.
    pub fn is_keepalive_noise(&self) -> bool {
        matches!(
            self.handler.as_deref(),
            Some("receipt_ack") | Some("ping") | Some("pong")
        )
    }
}

// ---------------------------------------------------------------------------
// Score ledger seam
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct LeaderboardEntry {
    pub username: String,
    pub score: i64,
    pub wins: u64,
    pub avatar_url: String,
}

/// Per-user point balances and win counts. Reads degrade to the starting
/// balance when the backing store is unavailable; the bot never fails a
/// game flow on ledger errors.
#[async_trait]
pub trait ScoreLedger: Send + Sync {
    async fn get(&self, user: &str) -> i64;

    /// Apply `delta` and return the new balance. Unknown users are created
    /// with `STARTING_BALANCE + delta`; the win counter increments iff
    /// `delta` is positive. A non-empty avatar updates the stored one.
    async fn adjust(&self, user: &str, delta: i64, avatar: Option<&str>) -> i64;

    async fn leaderboard(&self, limit: usize) -> Vec<LeaderboardEntry>;
}

#[derive(Debug, Clone, Default)]
struct LedgerRecord {
    score: i64,
    wins: u64,
    avatar_url: String,
}

/// In-memory ledger. Adjustments to one user are atomic under the table
/// lock; the match engine relies on that for escrow conservation.
#[derive(Default)]
pub struct MemoryLedger {
    entries: Mutex<HashMap<String, LedgerRecord>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ScoreLedger for MemoryLedger {
    async fn get(&self, user: &str) -> i64 {
        let entries = self.entries.lock().await;
        entries
            .get(user)
            .map(|record| record.score)
            .unwrap_or(STARTING_BALANCE)
    }

    async fn adjust(&self, user: &str, delta: i64, avatar: Option<&str>) -> i64 {
        let mut entries = self.entries.lock().await;
        let record = entries.entry(user.to_string()).or_insert(LedgerRecord {
            score: STARTING_BALANCE,
            wins: 0,
            avatar_url: String::new(),
        });
        record.score += delta;
        if delta > 0 {
            record.wins += 1;
        }
        if let Some(avatar) = avatar.filter(|value| !value.is_empty()) {
            record.avatar_url = avatar.to_string();
        }
        record.score
    }

    async fn leaderboard(&self, limit: usize) -> Vec<LeaderboardEntry> {
        let entries = self.entries.lock().await;
        let mut rows: Vec<LeaderboardEntry> = entries
            .iter()
            .map(|(username, record)| LeaderboardEntry {
                username: username.clone(),
                score: record.score,
                wins: record.wins,
                avatar_url: record.avatar_url.clone(),
            })
            .collect();
        rows.sort_by(|a, b| b.score.cmp(&a.score));
        rows.truncate(limit);
        rows
    }
}

// ---------------------------------------------------------------------------
// Rendering seam
// ---------------------------------------------------------------------------

/// Produces displayable artifacts (uploaded image URLs). Failures are
/// non-fatal everywhere; callers fall back to text.
#[async_trait]
pub trait ArtifactRenderer: Send + Sync {
    async fn board(&self, board: &Board, winning_line: Option<[usize; 3]>)
    -> anyhow::Result<String>;

    async fn coin_toss(&self) -> anyhow::Result<String>;

    async fn coin_face(&self, face: CoinFace) -> anyhow::Result<String>;
}

/// Renderer stub for deployments without an image pipeline; every request
/// fails so the engine takes its textual fallbacks.
pub struct NullRenderer;

#[async_trait]
impl ArtifactRenderer for NullRenderer {
    async fn board(
        &self,
        _board: &Board,
        _winning_line: Option<[usize; 3]>,
    ) -> anyhow::Result<String> {
        anyhow::bail!("no renderer configured")
    }

    async fn coin_toss(&self) -> anyhow::Result<String> {
        anyhow::bail!("no renderer configured")
    }

    async fn coin_face(&self, _face: CoinFace) -> anyhow::Result<String> {
        anyhow::bail!("no renderer configured")
    }
}
