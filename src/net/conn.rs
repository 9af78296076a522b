//! WebSocket connection handling: upgrade policy, keepalive, dispatch.
//!
//! One task pair per connection: the reader loop parses envelopes and calls
//! into the hub; the writer task owns the sink, serializing every outbound
//! frame and emitting the 30-second keepalive pings. A connection with no
//! inbound frame for 60 seconds is considered dead.

use super::hub::Hub;
use super::message::{
    self, ClientMessage, ServerMessage,
};
use super::peer::{Outbound, Peer};
use super::rate_limit::{ConnectionAdmission, MessageLimiter, MessageVerdict};
use super::signal;
use super::types::{HubError, MAX_CHAT_BYTES, PING_INTERVAL_SECS, READ_DEADLINE_SECS};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

/// WebSocket close code for protocol violations (rate abuse).
const CLOSE_POLICY_VIOLATION: u16 = 1008;

/// Accept an upgrade, enforce admission policy, and run the session to
/// completion. Returns when the transport is gone and the peer removed.
pub async fn handle_connection(
    hub: Arc<Hub>,
    admission: Arc<ConnectionAdmission>,
    stream: TcpStream,
    socket_addr: SocketAddr,
) {
    let ip_slot = Arc::new(std::sync::Mutex::new(socket_addr.ip()));

    let ws = {
        let hub = Arc::clone(&hub);
        let admission = Arc::clone(&admission);
        let ip_slot = Arc::clone(&ip_slot);
        let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            let ip = real_ip(&hub, req, socket_addr.ip());
            *ip_slot.lock().unwrap_or_else(|e| e.into_inner()) = ip;

            if !origin_allowed(&hub, req) {
                warn!(ip = %ip, "Rejected upgrade: origin not allowed");
                return Err(status_response(StatusCode::FORBIDDEN));
            }
            if !admission.admit(ip) {
                warn!(ip = %ip, "Rejected upgrade: connection admission limit");
                return Err(status_response(StatusCode::TOO_MANY_REQUESTS));
            }
            Ok(resp)
        };
        match tokio_tungstenite::accept_hdr_async(stream, callback).await {
            Ok(ws) => ws,
            Err(e) => {
                debug!(addr = %socket_addr, "Upgrade failed: {}", e);
                return;
            }
        }
    };
    let ip = *ip_slot.lock().unwrap_or_else(|e| e.into_inner());

    let (sink, source) = ws.split();
    let (tx, rx) = mpsc::unbounded_channel();
    let peer = Peer::new(tx);
    info!(ip = %ip, "Connection established");

    let writer = tokio::spawn(write_loop(sink, rx));
    read_loop(&hub, &peer, ip, source).await;

    // Cleanup: stop the keepalive/writer, remove the peer, close the socket.
    hub.remove_peer(&peer).await;
    peer.close(1000, "");
    let _ = writer.await;
    info!(ip = %ip, "Connection closed");
}

fn status_response(status: StatusCode) -> ErrorResponse {
    let mut resp = ErrorResponse::new(None);
    *resp.status_mut() = status;
    resp
}

/// The client's address: proxy headers when proxy trust is enabled,
/// otherwise the socket peer.
fn real_ip(hub: &Hub, req: &Request, socket_ip: IpAddr) -> IpAddr {
    if !hub.config.trust_proxy {
        return socket_ip;
    }
    let forwarded = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .and_then(|v| v.parse::<IpAddr>().ok());
    if let Some(ip) = forwarded {
        return ip;
    }
    req.headers()
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<IpAddr>().ok())
        .unwrap_or(socket_ip)
}

/// Allow-list origins when configured; otherwise same-origin against the
/// request's Host header. Requests without an Origin header (non-browser
/// clients) pass.
fn origin_allowed(hub: &Hub, req: &Request) -> bool {
    let Some(origin) = req.headers().get("origin").and_then(|v| v.to_str().ok()) else {
        return true;
    };
    if !hub.config.allowed_origins.is_empty() {
        return hub
            .config
            .allowed_origins
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(origin));
    }
    let Some(host) = req.headers().get("host").and_then(|v| v.to_str().ok()) else {
        return false;
    };
    let origin_host = origin.split("://").nth(1).unwrap_or(origin);
    origin_host.eq_ignore_ascii_case(host)
}

/// Owns the sink: serializes frames from the peer's queue and emits
/// keepalive pings.
async fn write_loop(
    mut sink: SplitSink<WebSocketStream<TcpStream>, Message>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
) {
    let mut ping = tokio::time::interval(Duration::from_secs(PING_INTERVAL_SECS));
    loop {
        tokio::select! {
            outbound = rx.recv() => match outbound {
                Some(Outbound::Frame(msg)) => {
                    let text = match serde_json::to_string(&msg) {
                        Ok(t) => t,
                        Err(e) => {
                            warn!("Failed to encode frame: {}", e);
                            continue;
                        }
                    };
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Some(Outbound::Close { code, reason }) => {
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code: CloseCode::from(code),
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
                None => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            },
            _ = ping.tick() => {
                if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Read one envelope per iteration until the transport dies, the read
/// deadline lapses, or rate abuse crosses the disconnect threshold.
async fn read_loop(
    hub: &Arc<Hub>,
    peer: &Arc<Peer>,
    ip: IpAddr,
    mut source: SplitStream<WebSocketStream<TcpStream>>,
) {
    let mut limiter = MessageLimiter::new();
    loop {
        let frame = match tokio::time::timeout(
            Duration::from_secs(READ_DEADLINE_SECS),
            source.next(),
        )
        .await
        {
            Err(_) => {
                info!(ip = %ip, "Read deadline lapsed; dropping connection");
                return;
            }
            Ok(None) => return,
            Ok(Some(Err(e))) => {
                debug!(ip = %ip, "Transport read error: {}", e);
                return;
            }
            Ok(Some(Ok(frame))) => frame,
        };

        let text = match frame {
            Message::Text(text) => text,
            // Pongs answer our keepalive; pings are answered by the library.
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Close(_) => return,
            Message::Binary(_) => {
                peer.send(ServerMessage::error(&HubError::invalid(
                    "Binary frames are not part of the protocol",
                )));
                continue;
            }
            _ => continue,
        };

        match limiter.admit() {
            MessageVerdict::Allowed => {}
            MessageVerdict::Limited => {
                peer.send(ServerMessage::error(&HubError::invalid(
                    "Rate limit exceeded",
                )));
                continue;
            }
            MessageVerdict::Disconnect => {
                warn!(ip = %ip, violations = limiter.violations(), "Rate abuse; closing connection");
                peer.close(CLOSE_POLICY_VIOLATION, "rate limit exceeded");
                return;
            }
        }

        dispatch(hub, peer, ip, text.as_str()).await;
    }
}

/// Parse, validate, and route one envelope. Protocol failures answer with an
/// inline `error` envelope and leave the session open.
async fn dispatch(hub: &Arc<Hub>, peer: &Arc<Peer>, ip: IpAddr, text: &str) {
    let msg = match ClientMessage::parse(text) {
        Ok(msg) => msg,
        Err(e) => {
            // Malformed traffic on an upgraded socket is worth remembering.
            warn!(ip = %ip, "Unparseable envelope: {}", e);
            peer.send(ServerMessage::error(&e));
            return;
        }
    };

    let result = route(hub, peer, ip, msg).await;
    if let Err(e) = result {
        match e.code {
            super::types::ErrorCode::PasswordWrong | super::types::ErrorCode::ServerFull => {
                warn!(ip = %ip, code = e.code.as_str(), "Security-relevant rejection");
            }
            _ => debug!(ip = %ip, code = e.code.as_str(), "Request rejected"),
        }
        peer.send(ServerMessage::error(&e));
    }
}

async fn route(
    hub: &Arc<Hub>,
    peer: &Arc<Peer>,
    ip: IpAddr,
    msg: ClientMessage,
) -> Result<(), HubError> {
    match msg {
        ClientMessage::Create(p) => {
            let username = message::validate_username(&p.username)?;
            let channel_name = message::validate_channel_name(&p.channel_name)?;
            message::validate_password(&p.password)?;
            hub.create_room(peer, username, channel_name, p.password, ip)
                .await
        }
        ClientMessage::Join(mut p) => {
            p.username = message::validate_username(&p.username)?;
            hub.join_room(peer, p).await
        }
        ClientMessage::Answer(p) => {
            message::validate_sdp(&p.sdp).inspect_err(|_| {
                warn!(ip = %ip, bytes = p.sdp.len(), "Oversized SDP answer");
            })?;
            signal::handle_answer(peer, p).await
        }
        ClientMessage::Candidate(p) => {
            message::validate_candidate(&p.candidate).inspect_err(|_| {
                warn!(ip = %ip, bytes = p.candidate.len(), "Oversized ICE candidate");
            })?;
            signal::handle_candidate(peer, p).await
        }
        ClientMessage::Chat(p) => {
            // Empty and oversized ciphertext are dropped without a reply.
            if p.ciphertext.is_empty() || p.ciphertext.len() > MAX_CHAT_BYTES {
                return Ok(());
            }
            hub.chat(peer, p.ciphertext).await
        }
        ClientMessage::Mute(p) => hub.mute(peer, p.muted).await,
        ClientMessage::SubInvite(p) => {
            let name = match p.channel_name {
                Some(raw) => Some(message::validate_channel_name(&raw)?),
                None => None,
            };
            hub.sub_invite(peer, p.target_user_id, name).await
        }
        ClientMessage::SubResponse(p) => hub.sub_response(peer, p.invite_id, p.accepted).await,
        ClientMessage::MoveToMain => hub.move_to_main(peer).await,
        ClientMessage::MoveToSub(p) => hub.move_to_sub(peer, p.sub_channel_id).await,
        ClientMessage::Leave => {
            hub.leave(peer).await;
            Ok(())
        }
    }
}
