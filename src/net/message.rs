//! Wire envelopes with bounded payloads (defense-in-depth)
//!
//! One WebSocket frame carries one JSON envelope `{type, payload}`. The outer
//! envelope is parsed first; the payload stays opaque until the type is known
//! so unknown types and malformed payloads produce distinct protocol errors.

use super::types::{
    ErrorCode, HubError, PeerId, RoomId,
    MAX_CANDIDATE_BYTES, MAX_CHANNEL_NAME_CHARS, MAX_PASSWORD_BYTES, MAX_SDP_BYTES,
    MAX_USERNAME_CHARS, MIN_PASSWORD_BYTES,
};
use serde::{Deserialize, Serialize};

/// Outer frame: the payload is deferred until the type is dispatched.
#[derive(Debug, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

// =============================================================================
// CLIENT → SERVER
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePayload {
    pub username: String,
    pub channel_name: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinPayload {
    pub username: String,
    #[serde(default)]
    pub channel_name: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub invite_token: Option<String>,
    #[serde(default)]
    pub session_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerPayload {
    pub sdp: String,
    pub seq: u64,
    pub epoch: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidatePayload {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    pub seq: u64,
    pub epoch: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatPayload {
    pub ciphertext: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutePayload {
    pub muted: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubInvitePayload {
    pub target_user_id: PeerId,
    #[serde(default)]
    pub channel_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubResponsePayload {
    pub invite_id: String,
    pub accepted: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveToSubPayload {
    pub sub_channel_id: RoomId,
}

/// A fully-parsed client request.
#[derive(Debug, Clone)]
pub enum ClientMessage {
    Create(CreatePayload),
    Join(JoinPayload),
    Answer(AnswerPayload),
    Candidate(CandidatePayload),
    Chat(ChatPayload),
    Mute(MutePayload),
    SubInvite(SubInvitePayload),
    SubResponse(SubResponsePayload),
    MoveToMain,
    MoveToSub(MoveToSubPayload),
    Leave,
}

impl ClientMessage {
    pub fn command(&self) -> &'static str {
        match self {
            ClientMessage::Create(_) => "create",
            ClientMessage::Join(_) => "join",
            ClientMessage::Answer(_) => "answer",
            ClientMessage::Candidate(_) => "candidate",
            ClientMessage::Chat(_) => "chat",
            ClientMessage::Mute(_) => "mute",
            ClientMessage::SubInvite(_) => "sub-invite",
            ClientMessage::SubResponse(_) => "sub-response",
            ClientMessage::MoveToMain => "move-to-main",
            ClientMessage::MoveToSub(_) => "move-to-sub",
            ClientMessage::Leave => "leave",
        }
    }

    /// Parse one frame. `Err` maps to an inline `error` envelope.
    pub fn parse(text: &str) -> Result<Self, HubError> {
        let envelope: Envelope = serde_json::from_str(text)
            .map_err(|_| HubError::invalid("Malformed JSON envelope"))?;

        fn payload<T: serde::de::DeserializeOwned>(
            kind: &str,
            value: serde_json::Value,
        ) -> Result<T, HubError> {
            serde_json::from_value(value)
                .map_err(|_| HubError::invalid(format!("Bad payload for '{kind}'")))
        }

        let kind = envelope.kind.as_str();
        let msg = match kind {
            "create" => ClientMessage::Create(payload(kind, envelope.payload)?),
            "join" => ClientMessage::Join(payload(kind, envelope.payload)?),
            "answer" => ClientMessage::Answer(payload(kind, envelope.payload)?),
            "candidate" => ClientMessage::Candidate(payload(kind, envelope.payload)?),
            "chat" => ClientMessage::Chat(payload(kind, envelope.payload)?),
            "mute" => ClientMessage::Mute(payload(kind, envelope.payload)?),
            "sub-invite" => ClientMessage::SubInvite(payload(kind, envelope.payload)?),
            "sub-response" => ClientMessage::SubResponse(payload(kind, envelope.payload)?),
            "move-to-main" => ClientMessage::MoveToMain,
            "move-to-sub" => ClientMessage::MoveToSub(payload(kind, envelope.payload)?),
            "leave" => ClientMessage::Leave,
            other => {
                return Err(HubError::invalid(format!("Unknown message type '{other}'")));
            }
        };
        Ok(msg)
    }
}

// =============================================================================
// SERVER → CLIENT
// =============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserEntry {
    pub id: PeerId,
    pub name: String,
    pub muted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub in_sub_channel: Option<RoomId>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubChannelEntry {
    pub id: RoomId,
    pub name: String,
    pub users: Vec<UserEntry>,
    /// Unix milliseconds; absent while the sub has two or more occupants.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub countdown_expires_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatEntry {
    pub id: u64,
    pub user_id: PeerId,
    pub user_name: String,
    pub ciphertext: String,
    /// Unix milliseconds, server-assigned; doubles as the history sort key.
    pub timestamp: i64,
    pub channel_id: RoomId,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomStatePayload {
    pub id: RoomId,
    pub name: String,
    pub full_name: String,
    pub current_channel_id: RoomId,
    pub users: Vec<UserEntry>,
    pub sub_channels: Vec<SubChannelEntry>,
    pub chat_history: Vec<ChatEntry>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WelcomePayload {
    pub user_id: PeerId,
    pub session_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invite_token: Option<String>,
    pub room_state: RoomStatePayload,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomUpdatePayload {
    pub users: Vec<UserEntry>,
    pub sub_channels: Vec<SubChannelEntry>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferPayload {
    pub sdp: String,
    /// True on the first offer of a new epoch: the client must discard its
    /// previous peer connection entirely.
    pub reset: bool,
    pub seq: u64,
    pub epoch: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateOutPayload {
    pub candidate: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    pub seq: u64,
    pub epoch: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatHistoryPayload {
    pub channel_id: RoomId,
    pub messages: Vec<ChatEntry>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InviteReqPayload {
    pub invite_id: String,
    pub from_user_id: PeerId,
    pub from_name: String,
    pub channel_name: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InviteExpiredPayload {
    pub invite_id: String,
    /// `timeout` or `declined`.
    pub reason: &'static str,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum ServerMessage {
    Welcome(WelcomePayload),
    Error(ErrorPayload),
    RoomUpdate(RoomUpdatePayload),
    Offer(OfferPayload),
    Candidate(CandidateOutPayload),
    Chat(ChatEntry),
    ChatHistory(ChatHistoryPayload),
    InviteReq(InviteReqPayload),
    InviteExpired(InviteExpiredPayload),
}

impl ServerMessage {
    pub fn error(err: &HubError) -> Self {
        ServerMessage::Error(ErrorPayload {
            code: err.code.as_str(),
            message: err.message.clone(),
        })
    }
}

// =============================================================================
// INPUT VALIDATION
// =============================================================================

/// Trim and bound a display name to 1..=24 code points.
pub fn validate_username(raw: &str) -> Result<String, HubError> {
    let name = raw.trim();
    let chars = name.chars().count();
    if chars == 0 || chars > MAX_USERNAME_CHARS {
        return Err(HubError::invalid("Username must be 1-24 characters"));
    }
    Ok(name.to_string())
}

/// Trim and bound a channel name to 1..=30 chars of `[A-Za-z0-9 -]`.
pub fn validate_channel_name(raw: &str) -> Result<String, HubError> {
    let name = raw.trim();
    let chars = name.chars().count();
    if chars == 0 || chars > MAX_CHANNEL_NAME_CHARS {
        return Err(HubError::invalid("Channel name must be 1-30 characters"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == ' ' || c == '-')
    {
        return Err(HubError::invalid(
            "Channel name may only contain letters, digits, spaces and dashes",
        ));
    }
    Ok(name.to_string())
}

pub fn validate_password(raw: &str) -> Result<(), HubError> {
    let len = raw.len();
    if len < MIN_PASSWORD_BYTES || len > MAX_PASSWORD_BYTES {
        return Err(HubError::invalid("Password must be 6-64 bytes"));
    }
    Ok(())
}

/// Oversized SDP is a protocol violation and a logged security event.
pub fn validate_sdp(sdp: &str) -> Result<(), HubError> {
    if sdp.len() > MAX_SDP_BYTES {
        return Err(HubError::new(ErrorCode::InvalidMessage, "SDP too large"));
    }
    Ok(())
}

pub fn validate_candidate(candidate: &str) -> Result<(), HubError> {
    if candidate.len() > MAX_CANDIDATE_BYTES {
        return Err(HubError::new(
            ErrorCode::InvalidMessage,
            "ICE candidate too large",
        ));
    }
    Ok(())
}
