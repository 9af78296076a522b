//! Constants and shared types for the session and media-routing layer.
//!
//! # Design Goals
//!
//! 1. **Bounded memory usage** — every collection and payload has an explicit
//!    size limit. A client cannot exhaust memory with oversized SDP bodies,
//!    chat blobs, or unbounded history.
//!
//! 2. **DoS resistance** — per-IP admission and per-connection message rate
//!    limits keep a single client from starving the hub.
//!
//! 3. **Ephemerality** — all state is in-memory. Session tokens, invites, and
//!    idle rooms age out on fixed schedules; nothing survives a restart.

use rand::RngCore;
use serde::Serialize;
use thiserror::Error;

// =============================================================================
// IDENTIFIERS
// =============================================================================

/// Server-assigned peer identifier (hex-encoded random bytes).
pub type PeerId = String;

/// Room identifier, shared by main rooms and sub-rooms.
pub type RoomId = String;

/// Random bytes in a peer/room id.
pub const ID_BYTES: usize = 8;

/// Random bytes in a session or invite token.
pub const TOKEN_BYTES: usize = 16;

/// Generate a hex-encoded random identifier of `n` bytes.
pub fn random_hex(n: usize) -> String {
    let mut buf = vec![0u8; n];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

/// Current unix time in seconds.
pub fn now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// =============================================================================
// INPUT BOUNDS
// =============================================================================

/// Maximum display-name length in code points.
pub const MAX_USERNAME_CHARS: usize = 24;

/// Maximum channel-name length in code points.
pub const MAX_CHANNEL_NAME_CHARS: usize = 30;

/// Room password length bounds, in bytes.
pub const MIN_PASSWORD_BYTES: usize = 6;
pub const MAX_PASSWORD_BYTES: usize = 64;

/// Maximum SDP body accepted in an `answer` payload.
/// Real browser answers are ~5–20 KB; 100 KB leaves headroom for many m-lines
/// while bounding per-message allocation.
pub const MAX_SDP_BYTES: usize = 100_000;

/// Maximum ICE candidate string length.
pub const MAX_CANDIDATE_BYTES: usize = 2_000;

/// Maximum chat ciphertext length. Empty or oversized messages are dropped.
pub const MAX_CHAT_BYTES: usize = 10_000;

// =============================================================================
// KEEPALIVE AND RATE LIMITS
// =============================================================================

/// Interval between server pings.
pub const PING_INTERVAL_SECS: u64 = 30;

/// A connection with no inbound frame for this long is considered dead.
pub const READ_DEADLINE_SECS: u64 = 60;

/// Per-connection message budget (messages per second, burst equal to rate).
pub const MESSAGES_PER_SEC: f64 = 30.0;

/// Rate-limit violations before the connection is closed.
pub const MAX_RATE_VIOLATIONS: u32 = 50;

/// New connections admitted per IP per second.
pub const CONNECTIONS_PER_IP_PER_SEC: f64 = 3.0;

/// Admission entries idle longer than this are swept.
pub const ADMISSION_SWEEP_SECS: u64 = 300;

/// Rooms one IP may create within [`CREATE_WINDOW_SECS`].
pub const MAX_CREATES_PER_IP: usize = 3;
pub const CREATE_WINDOW_SECS: u64 = 600;

// =============================================================================
// LIFECYCLE TIMERS
// =============================================================================

/// How long an unanswered offer is waited on before being abandoned.
pub const OFFER_TIMEOUT_SECS: u64 = 10;

/// Delay before an ICE restart after `disconnected` (debounce).
pub const RESTART_DEBOUNCE_SECS: u64 = 3;

/// Pending sub-channel invites expire after this long.
pub const INVITE_TIMEOUT_SECS: u64 = 30;

/// Grace period for a sub-room with exactly one occupant.
pub const SUB_COUNTDOWN_SECS: u64 = 300;

/// Garbage-collection cycle interval.
pub const GC_INTERVAL_SECS: u64 = 60;

/// Session tokens are honored for reconnect this long.
pub const SESSION_MAX_AGE_SECS: u64 = 24 * 3600;

/// Invite tokens stop resolving once the room is this old.
pub const INVITE_MAX_AGE_SECS: u64 = 7 * 24 * 3600;

/// Empty sub-rooms older than this are collected.
pub const EMPTY_SUB_MAX_AGE_SECS: u64 = 300;

/// Empty main rooms older than this are collected.
pub const EMPTY_ROOM_MAX_AGE_SECS: u64 = 30 * 60;

/// Attempts at a collision-free `name#NNNN` suffix before giving up.
pub const FULL_NAME_ATTEMPTS: u32 = 10;

/// Default name for a sub-channel created without one.
pub const DEFAULT_SUB_NAME: &str = "Private";

// =============================================================================
// PROTOCOL ERRORS
// =============================================================================

/// Stable protocol error codes. These strings are a contract with clients;
/// never rename them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    AuthFailed,
    PasswordRequired,
    PasswordWrong,
    ChannelFull,
    ServerFull,
    NameTaken,
    ChannelNotFound,
    AlreadyInSub,
    InviteExpired,
    InvalidMessage,
    InternalError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::AuthFailed => "AUTH_FAILED",
            ErrorCode::PasswordRequired => "PASSWORD_REQUIRED",
            ErrorCode::PasswordWrong => "PASSWORD_WRONG",
            ErrorCode::ChannelFull => "CHANNEL_FULL",
            ErrorCode::ServerFull => "SERVER_FULL",
            ErrorCode::NameTaken => "NAME_TAKEN",
            ErrorCode::ChannelNotFound => "CHANNEL_NOT_FOUND",
            ErrorCode::AlreadyInSub => "ALREADY_IN_SUB",
            ErrorCode::InviteExpired => "INVITE_EXPIRED",
            ErrorCode::InvalidMessage => "INVALID_MESSAGE",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// Structured protocol error returned by hub operations.
///
/// The code/message pair maps directly onto an `error` envelope; the session
/// stays open unless the transport itself failed.
#[derive(Debug, Clone, Error)]
#[error("{}: {message}", .code.as_str())]
pub struct HubError {
    pub code: ErrorCode,
    pub message: String,
}

impl HubError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidMessage, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }
}

impl From<webrtc::Error> for HubError {
    fn from(e: webrtc::Error) -> Self {
        HubError::internal(format!("media failure: {e}"))
    }
}
