//! The hub: rooms, sessions, invites, and the operations that mutate them.
//!
//! # Lock order
//!
//! Hub -> Room -> Peer identity, never reversed. A parent room's lock is
//! acquired before a child sub-room's. Media-library calls (SDP, candidate,
//! close) and password hashing always happen with none of these locks held;
//! operations are therefore structured as lock-phase / io-phase pairs.

use super::media::{self, MediaApi};
use super::message::{
    ChatHistoryPayload, InviteExpiredPayload, InviteReqPayload, JoinPayload, ServerMessage,
    WelcomePayload,
};
use super::peer::Peer;
use super::room::{
    self, PendingInvite, Room,
};
use super::signal;
use webrtc::track::track_local::TrackLocal;
use super::types::{
    now, random_hex, ErrorCode, HubError, PeerId, RoomId, CREATE_WINDOW_SECS, DEFAULT_SUB_NAME,
    EMPTY_ROOM_MAX_AGE_SECS, EMPTY_SUB_MAX_AGE_SECS, FULL_NAME_ATTEMPTS, INVITE_MAX_AGE_SECS,
    INVITE_TIMEOUT_SECS, MAX_CREATES_PER_IP, SESSION_MAX_AGE_SECS, SUB_COUNTDOWN_SECS,
    TOKEN_BYTES,
};
use crate::config::Config;
use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, SaltString};
use argon2::{Argon2, PasswordHasher, PasswordVerifier};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Weak};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

struct HubState {
    /// Main rooms by id; sub-rooms live inside their parent.
    rooms: HashMap<RoomId, Arc<Room>>,
    rooms_by_name: HashMap<String, RoomId>,
    /// Invite token -> main room id.
    invites: HashMap<String, RoomId>,
    /// Session token -> (peer, issued-at). Entries outlive the transport so
    /// a dropped client can reclaim its identity within 24 hours.
    sessions: HashMap<String, (Arc<Peer>, u64)>,
    pending_invites: HashMap<String, PendingInvite>,
    /// Per-IP room-creation timestamps inside the rate window.
    create_history: HashMap<IpAddr, Vec<u64>>,
}

pub struct Hub {
    pub config: Config,
    pub media: MediaApi,
    /// Handle timer tasks use to call back into the hub after their sleep.
    self_ref: Weak<Hub>,
    state: RwLock<HubState>,
}

impl Hub {
    pub fn new(config: Config, media: MediaApi) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            config,
            media,
            self_ref: self_ref.clone(),
            state: RwLock::new(HubState {
                rooms: HashMap::new(),
                rooms_by_name: HashMap::new(),
                invites: HashMap::new(),
                sessions: HashMap::new(),
                pending_invites: HashMap::new(),
                create_history: HashMap::new(),
            }),
        })
    }

    /// (main rooms, outstanding sessions) for the status ticker.
    pub async fn stats(&self) -> (usize, usize) {
        let state = self.state.read().await;
        (state.rooms.len(), state.sessions.len())
    }

    /// Look up a main room by its `name#NNNN` full name.
    pub async fn room_by_name(&self, full_name: &str) -> Option<Arc<Room>> {
        let state = self.state.read().await;
        state
            .rooms_by_name
            .get(full_name)
            .and_then(|id| state.rooms.get(id))
            .cloned()
    }

    // =========================================================================
    // PASSWORDS
    // =========================================================================

    /// The KDF is CPU-bound and memory-hard; it runs on the blocking pool so
    /// it can never stall the event loop, and always with no hub locks held.
    async fn hash_password(password: String) -> Result<String, HubError> {
        tokio::task::spawn_blocking(move || {
            let salt = SaltString::generate(&mut OsRng);
            Argon2::default()
                .hash_password(password.as_bytes(), &salt)
                .map(|h| h.to_string())
                .map_err(|e| HubError::internal(format!("password hash failed: {e}")))
        })
        .await
        .map_err(|e| HubError::internal(format!("hash task failed: {e}")))?
    }

    async fn verify_password(password: String, hash: String) -> Result<bool, HubError> {
        tokio::task::spawn_blocking(move || {
            let parsed = PasswordHash::new(&hash)
                .map_err(|e| HubError::internal(format!("stored hash unreadable: {e}")))?;
            Ok(Argon2::default()
                .verify_password(password.as_bytes(), &parsed)
                .is_ok())
        })
        .await
        .map_err(|e| HubError::internal(format!("verify task failed: {e}")))?
    }

    // =========================================================================
    // CREATE / JOIN
    // =========================================================================

    pub async fn create_room(
        &self,
        peer: &Arc<Peer>,
        username: String,
        channel_name: String,
        password: String,
        ip: IpAddr,
    ) -> Result<(), HubError> {
        if peer.state.lock().await.room_id.is_some() {
            return Err(HubError::invalid("Already in a room"));
        }
        let password_hash = Self::hash_password(password).await?;

        let main = {
            let mut state = self.state.write().await;

            if state.rooms.len() >= self.config.max_rooms {
                warn!(ip = %ip, "Room creation rejected: server at room capacity");
                return Err(HubError::new(ErrorCode::ServerFull, "Server is full"));
            }

            let cutoff = now().saturating_sub(CREATE_WINDOW_SECS);
            let history = state.create_history.entry(ip).or_default();
            history.retain(|&t| t > cutoff);
            if history.len() >= MAX_CREATES_PER_IP {
                warn!(ip = %ip, "Room creation rejected: per-IP create limit");
                return Err(HubError::new(
                    ErrorCode::ServerFull,
                    "Too many rooms created recently",
                ));
            }
            history.push(now());

            let mut full_name = None;
            for _ in 0..FULL_NAME_ATTEMPTS {
                let candidate = format!("{}#{}", channel_name, room::random_suffix());
                if !state.rooms_by_name.contains_key(&candidate) {
                    full_name = Some(candidate);
                    break;
                }
            }
            let Some(full_name) = full_name else {
                return Err(HubError::internal("Could not allocate a room name"));
            };

            let invite_token = random_hex(TOKEN_BYTES);
            let session_token = random_hex(TOKEN_BYTES);
            let main = Room::new_main(
                channel_name,
                full_name.clone(),
                password_hash,
                invite_token.clone(),
                self.config.chat_history_size,
            );
            state.rooms.insert(main.id.clone(), Arc::clone(&main));
            state.rooms_by_name.insert(full_name, main.id.clone());
            state.invites.insert(invite_token, main.id.clone());

            let peer_id = {
                let mut ps = peer.state.lock().await;
                ps.name = username;
                ps.room_id = Some(main.id.clone());
                ps.main_room_id = Some(main.id.clone());
                ps.session_token = Some(session_token.clone());
                ps.session_created = now();
                ps.id.clone()
            };
            main.state
                .write()
                .await
                .members
                .insert(peer_id, Arc::clone(peer));
            state.sessions.insert(session_token, (Arc::clone(peer), now()));
            main
        };

        info!(room = %main.full_name, "Room created");
        self.finish_join(peer, &main, None).await;
        Ok(())
    }

    /// Resolution order: session token, then invite token, then
    /// channel name + password. The first method present wins; its failure is
    /// final and later methods are not attempted.
    pub async fn join_room(
        &self,
        peer: &Arc<Peer>,
        payload: JoinPayload,
    ) -> Result<(), HubError> {
        if peer.state.lock().await.room_id.is_some() {
            return Err(HubError::invalid("Already in a room"));
        }

        if let Some(token) = payload.session_token {
            return self.resume_session(peer, &token).await;
        }

        let main = if let Some(token) = payload.invite_token {
            let main = {
                let state = self.state.read().await;
                state
                    .invites
                    .get(&token)
                    .and_then(|id| state.rooms.get(id))
                    .cloned()
            };
            let Some(main) = main else {
                return Err(HubError::new(ErrorCode::InviteExpired, "Unknown invite"));
            };
            if now().saturating_sub(main.created_at) > INVITE_MAX_AGE_SECS {
                return Err(HubError::new(ErrorCode::InviteExpired, "Invite expired"));
            }
            main
        } else if let Some(full_name) = payload.channel_name {
            let main = {
                let state = self.state.read().await;
                state
                    .rooms_by_name
                    .get(full_name.trim())
                    .and_then(|id| state.rooms.get(id))
                    .cloned()
            };
            let Some(main) = main else {
                return Err(HubError::new(ErrorCode::ChannelNotFound, "No such channel"));
            };
            let Some(password) = payload.password else {
                return Err(HubError::new(
                    ErrorCode::PasswordRequired,
                    "Password required",
                ));
            };
            // KDF verification is a suspension point; no locks are held here.
            if !Self::verify_password(password, main.password_hash.clone()).await? {
                warn!(room = %main.full_name, "Join rejected: wrong password");
                return Err(HubError::new(ErrorCode::PasswordWrong, "Wrong password"));
            }
            main
        } else {
            return Err(HubError::invalid("No join method provided"));
        };

        self.admit(peer, &main, payload.username).await?;
        self.finish_join(peer, &main, None).await;
        Ok(())
    }

    /// Occupancy, name-uniqueness, and placement checks shared by the invite
    /// and name+password join paths (not by session reconnect).
    async fn admit(
        &self,
        peer: &Arc<Peer>,
        main: &Arc<Room>,
        username: String,
    ) -> Result<(), HubError> {
        let mut state = self.state.write().await;
        // The room may have been collected while the password was verified.
        if !state.rooms.contains_key(&main.id) {
            return Err(HubError::new(ErrorCode::ChannelNotFound, "No such channel"));
        }
        if main.is_sub() {
            return Err(HubError::invalid("Cannot join a sub-channel directly"));
        }
        if room::total_occupancy(main).await >= self.config.max_users_per_room {
            return Err(HubError::new(ErrorCode::ChannelFull, "Channel is full"));
        }
        if room::name_in_use(main, &username).await {
            return Err(HubError::new(ErrorCode::NameTaken, "Name already in use"));
        }

        let session_token = random_hex(TOKEN_BYTES);
        let peer_id = {
            let mut ps = peer.state.lock().await;
            ps.name = username;
            ps.room_id = Some(main.id.clone());
            ps.main_room_id = Some(main.id.clone());
            ps.session_token = Some(session_token.clone());
            ps.session_created = now();
            ps.id.clone()
        };
        {
            let mut rs = main.state.write().await;
            rs.members.insert(peer_id, Arc::clone(peer));
            rs.expired_at = 0;
        }
        state.sessions.insert(session_token, (Arc::clone(peer), now()));
        Ok(())
    }

    /// Re-bind a dropped client's identity onto a new transport.
    ///
    /// Identity, membership, and counters move from the old peer object to
    /// the new one; the old object is left hollow so its own removal path
    /// becomes a no-op. The media connection is not reused: post-join tears
    /// it down and rebuilds at a fresh epoch, superseding any pending offer.
    async fn resume_session(
        &self,
        peer: &Arc<Peer>,
        token: &str,
    ) -> Result<(), HubError> {
        let (old, main, old_track_id) = {
            let mut state = self.state.write().await;
            let Some((old, issued)) = state.sessions.get(token).cloned() else {
                return Err(HubError::new(ErrorCode::AuthFailed, "Unknown session"));
            };
            if now().saturating_sub(issued) > SESSION_MAX_AGE_SECS {
                return Err(HubError::new(ErrorCode::AuthFailed, "Session expired"));
            }
            if Arc::ptr_eq(&old, peer) {
                return Err(HubError::invalid("Session already bound"));
            }

            let (main_id, room_id) = {
                let os = old.state.lock().await;
                (os.main_room_id.clone(), os.room_id.clone())
            };
            let (Some(main_id), Some(room_id)) = (main_id, room_id) else {
                return Err(HubError::new(ErrorCode::AuthFailed, "Session has no room"));
            };
            let Some(main) = state.rooms.get(&main_id).cloned() else {
                return Err(HubError::new(ErrorCode::AuthFailed, "Room no longer exists"));
            };
            let current = if room_id == main.id {
                Some(Arc::clone(&main))
            } else {
                main.state.read().await.sub_rooms.get(&room_id).cloned()
            };
            let Some(current) = current else {
                return Err(HubError::new(ErrorCode::AuthFailed, "Room no longer exists"));
            };

            // Transplant identity old -> new. Old first, then new: this is
            // the only path locking two peers, so the order cannot deadlock.
            let (peer_id, old_track_id) = {
                let mut os = old.state.lock().await;
                let mut ns = peer.state.lock().await;
                ns.id = os.id.clone();
                ns.name = os.name.clone();
                ns.muted = os.muted;
                ns.room_id = os.room_id.take();
                ns.main_room_id = os.main_room_id.take();
                ns.session_token = os.session_token.take();
                ns.session_created = os.session_created;
                ns.media = os.media.take();
                let track_id = ns.media.as_ref().map(|m| m.track.id().to_string());
                (ns.id.clone(), track_id)
            };
            {
                let mut new_sig = peer.signal.lock().unwrap_or_else(|e| e.into_inner());
                let mut old_sig = old.signal.lock().unwrap_or_else(|e| e.into_inner());
                *new_sig = std::mem::take(&mut *old_sig);
            }

            state.sessions.insert(token.to_string(), (Arc::clone(peer), issued));
            {
                let mut rs = current.state.write().await;
                rs.members.insert(peer_id, Arc::clone(peer));
                rs.expired_at = 0;
            }
            (old, main, old_track_id)
        };

        // If the old transport is somehow still alive, retire it.
        old.close(1000, "session resumed elsewhere");
        info!("Session resumed");
        self.finish_join(peer, &main, old_track_id).await;
        Ok(())
    }

    /// Post-join work, run with no hub lock held: welcome snapshot, stale
    /// sender cleanup, media rebuild, initial offer, room-update fan-out.
    async fn finish_join(
        &self,
        peer: &Arc<Peer>,
        main: &Arc<Room>,
        old_track_id: Option<String>,
    ) {
        let (user_id, session_token, room_id) = {
            let ps = peer.state.lock().await;
            (
                ps.id.clone(),
                ps.session_token.clone().unwrap_or_default(),
                ps.room_id.clone().unwrap_or_else(|| main.id.clone()),
            )
        };

        let room_state = room::room_state_payload(main, room_id.clone()).await;
        peer.send(ServerMessage::Welcome(WelcomePayload {
            user_id,
            session_token,
            invite_token: main.invite_token.clone(),
            room_state,
        }));

        if let Some(track_id) = old_track_id {
            self.detach_everywhere(main, &track_id, peer).await;
        }
        media::close_connection(peer).await;

        let current = self.room_in(main, &room_id).await;
        if let Some(current) = current {
            self.wire_media(peer, &current).await;
        }
        self.fan_out(main).await;
    }

    async fn room_in(&self, main: &Arc<Room>, room_id: &RoomId) -> Option<Arc<Room>> {
        if *room_id == main.id {
            return Some(Arc::clone(main));
        }
        main.state.read().await.sub_rooms.get(room_id).cloned()
    }

    // =========================================================================
    // LEAVE / DISCONNECT
    // =========================================================================

    /// Tear down a peer's membership and media. Called on transport close and
    /// on an explicit `leave`. The session entry is retained so the client
    /// can reconnect; garbage collection ages it out.
    pub async fn remove_peer(&self, peer: &Arc<Peer>) {
        let located = {
            let state = self.state.read().await;
            let (peer_id, room_id, main_id) = {
                let ps = peer.state.lock().await;
                (ps.id.clone(), ps.room_id.clone(), ps.main_room_id.clone())
            };
            let (Some(room_id), Some(main_id)) = (room_id, main_id) else {
                drop(state);
                media::close_connection(peer).await;
                return;
            };
            let Some(main) = state.rooms.get(&main_id).cloned() else {
                drop(state);
                media::close_connection(peer).await;
                return;
            };
            let current = self.room_in(&main, &room_id).await;
            Some((peer_id, main, current))
        };
        let Some((peer_id, main, current)) = located else {
            return;
        };

        let mut sub_now = None;
        if let Some(current) = &current {
            let mut rs = current.state.write().await;
            let removed = match rs.members.get(&peer_id) {
                Some(existing) => Arc::ptr_eq(existing, peer),
                None => false,
            };
            if removed {
                rs.members.remove(&peer_id);
            }
            if rs.members.is_empty() {
                rs.expired_at = now();
            }
            if current.is_sub() {
                sub_now = Some((Arc::clone(current), rs.members.len()));
            }
        }

        // Media teardown happens with no hub or room lock held.
        let track_id = peer.media().await.map(|m| m.track.id().to_string());
        if let Some(track_id) = track_id {
            self.detach_everywhere(&main, &track_id, peer).await;
        }
        media::close_connection(peer).await;

        if let Some((sub, count)) = sub_now {
            if count == 0 {
                let mut ms = main.state.write().await;
                ms.sub_rooms.remove(&sub.id);
                // Dropping the last sub may leave the whole room idle.
                if ms.members.is_empty() && ms.sub_rooms.is_empty() {
                    ms.expired_at = now();
                }
                debug!(sub = %sub.channel_name, "Deleted empty sub-channel");
            } else if count == 1 {
                self.arm_sub_countdown(&main, &sub).await;
            }
        }

        self.fan_out(&main).await;
    }

    /// An explicit `leave` envelope: unlike a transport drop, the peer walked
    /// out on purpose, so its session is not kept for reconnect.
    pub async fn leave(&self, peer: &Arc<Peer>) {
        self.remove_peer(peer).await;
        let token = {
            let mut ps = peer.state.lock().await;
            ps.room_id = None;
            ps.main_room_id = None;
            ps.session_token.take()
        };
        if let Some(token) = token {
            self.state.write().await.sessions.remove(&token);
        }
    }

    /// Remove any sender bound to `track_id` from every peer reachable from
    /// `main` (except `owner`), renegotiating each peer actually affected.
    async fn detach_everywhere(&self, main: &Arc<Room>, track_id: &str, owner: &Arc<Peer>) {
        for other in room::reachable_peers(main).await {
            if Arc::ptr_eq(&other, owner) {
                continue;
            }
            match media::detach_track(&other, track_id).await {
                Ok(true) => {
                    let other = Arc::clone(&other);
                    tokio::spawn(async move {
                        if let Err(e) = signal::negotiate(&other, false).await {
                            debug!("Renegotiation after detach failed: {}", e);
                        }
                    });
                }
                Ok(false) => {}
                Err(e) => debug!("Sender detach failed: {}", e),
            }
        }
    }

    /// Build a fresh media connection for `peer` wired against `current`:
    /// every established participant's track is added to the newcomer before
    /// its initial offer, and the newcomer's track to each of them.
    async fn wire_media(&self, peer: &Arc<Peer>, current: &Arc<Room>) {
        let session = match media::create_connection(&self.media, peer).await {
            Ok(s) => s,
            Err(e) => {
                warn!("Media connection failed: {}", e);
                peer.send(ServerMessage::error(&HubError::internal(
                    "Could not establish media",
                )));
                return;
            }
        };

        for other in current.members().await {
            if Arc::ptr_eq(&other, peer) {
                continue;
            }
            if let Some(other_media) = other.media().await {
                if let Err(e) = media::attach_track(peer, &other_media.track).await {
                    debug!("Attach of existing track failed: {}", e);
                }
            }
            match media::attach_track(&other, &session.track).await {
                Ok(true) => {
                    let other = Arc::clone(&other);
                    tokio::spawn(async move {
                        if let Err(e) = signal::negotiate(&other, false).await {
                            debug!("Renegotiation after attach failed: {}", e);
                        }
                    });
                }
                Ok(false) => {}
                Err(e) => debug!("Attach to existing peer failed: {}", e),
            }
        }

        let peer = Arc::clone(peer);
        tokio::spawn(async move {
            if let Err(e) = signal::negotiate(&peer, true).await {
                debug!("Initial negotiation failed: {}", e);
            }
        });
    }

    // =========================================================================
    // CHAT / MUTE
    // =========================================================================

    /// Stamp, ring-append, and broadcast a ciphertext chat message to the
    /// peer's current room only (main and each sub keep separate history).
    pub async fn chat(&self, peer: &Arc<Peer>, ciphertext: String) -> Result<(), HubError> {
        let Some((_, current)) = self.locate(peer).await else {
            return Err(HubError::invalid("Not in a room"));
        };
        let (user_id, user_name) = {
            let ps = peer.state.lock().await;
            (ps.id.clone(), ps.name.clone())
        };
        let entry = current.append_chat(user_id, user_name, ciphertext).await;
        for member in current.members().await {
            member.send(ServerMessage::Chat(entry.clone()));
        }
        Ok(())
    }

    pub async fn mute(&self, peer: &Arc<Peer>, muted: bool) -> Result<(), HubError> {
        let Some((main, _)) = self.locate(peer).await else {
            return Err(HubError::invalid("Not in a room"));
        };
        peer.state.lock().await.muted = muted;
        self.fan_out(&main).await;
        Ok(())
    }

    /// (main room, current room) for a joined peer.
    async fn locate(&self, peer: &Arc<Peer>) -> Option<(Arc<Room>, Arc<Room>)> {
        let (room_id, main_id) = {
            let ps = peer.state.lock().await;
            (ps.room_id.clone()?, ps.main_room_id.clone()?)
        };
        let main = self.state.read().await.rooms.get(&main_id).cloned()?;
        let current = self.room_in(&main, &room_id).await?;
        Some((main, current))
    }

    // =========================================================================
    // SUB-CHANNEL INVITES
    // =========================================================================

    pub async fn sub_invite(
        &self,
        from: &Arc<Peer>,
        target_user_id: PeerId,
        proposed_name: Option<String>,
    ) -> Result<(), HubError> {
        let (main, _) = self
            .locate(from)
            .await
            .ok_or_else(|| HubError::invalid("Not in a room"))?;
        {
            let ps = from.state.lock().await;
            if ps.room_id != ps.main_room_id {
                return Err(HubError::new(
                    ErrorCode::AlreadyInSub,
                    "Leave your sub-channel first",
                ));
            }
        }

        let target = {
            let rs = main.state.read().await;
            if let Some(target) = rs.members.get(&target_user_id) {
                Arc::clone(target)
            } else {
                // In one of the subs means unavailable; absent means unknown.
                let mut in_sub = false;
                for sub in rs.sub_rooms.values() {
                    if sub.state.read().await.members.contains_key(&target_user_id) {
                        in_sub = true;
                        break;
                    }
                }
                return Err(if in_sub {
                    HubError::new(ErrorCode::AlreadyInSub, "User is in a sub-channel")
                } else {
                    HubError::new(ErrorCode::ChannelNotFound, "No such user")
                });
            }
        };

        let channel_name = proposed_name.unwrap_or_else(|| DEFAULT_SUB_NAME.to_string());
        let invite_id = random_hex(TOKEN_BYTES);
        let (from_id, from_name) = {
            let ps = from.state.lock().await;
            (ps.id.clone(), ps.name.clone())
        };

        let timer = {
            let hub = self.self_ref.clone();
            let invite_id = invite_id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_secs(INVITE_TIMEOUT_SECS)).await;
                if let Some(hub) = hub.upgrade() {
                    hub.expire_invite(&invite_id).await;
                }
            })
        };

        let invite = PendingInvite {
            id: invite_id.clone(),
            inviter: Arc::clone(from),
            invitee: Arc::clone(&target),
            main_room_id: main.id.clone(),
            channel_name: channel_name.clone(),
            created_at: now(),
            timer: Some(timer),
        };
        self.state
            .write()
            .await
            .pending_invites
            .insert(invite_id.clone(), invite);

        target.send(ServerMessage::InviteReq(InviteReqPayload {
            invite_id,
            from_user_id: from_id,
            from_name,
            channel_name,
        }));
        Ok(())
    }

    /// Timer path: a pending invite nobody answered within 30 seconds.
    async fn expire_invite(&self, invite_id: &str) {
        let invite = self.state.write().await.pending_invites.remove(invite_id);
        if let Some(invite) = invite {
            let payload = InviteExpiredPayload {
                invite_id: invite.id.clone(),
                reason: "timeout",
            };
            invite.inviter.send(ServerMessage::InviteExpired(payload.clone()));
            invite.invitee.send(ServerMessage::InviteExpired(payload));
        }
    }

    pub async fn sub_response(
        &self,
        peer: &Arc<Peer>,
        invite_id: String,
        accepted: bool,
    ) -> Result<(), HubError> {
        let invite = {
            let mut state = self.state.write().await;
            let Some(invite) = state.pending_invites.remove(&invite_id) else {
                return Err(HubError::new(ErrorCode::InviteExpired, "Invite expired"));
            };
            if !Arc::ptr_eq(&invite.invitee, peer) {
                state.pending_invites.insert(invite_id, invite);
                return Err(HubError::new(ErrorCode::InviteExpired, "Invite expired"));
            }
            invite
        };

        if !accepted {
            invite.inviter.send(ServerMessage::InviteExpired(InviteExpiredPayload {
                invite_id: invite.id.clone(),
                reason: "declined",
            }));
            return Ok(());
        }

        let main = self
            .state
            .read()
            .await
            .rooms
            .get(&invite.main_room_id)
            .cloned()
            .ok_or_else(|| HubError::new(ErrorCode::InviteExpired, "Room gone"))?;

        let inviter = Arc::clone(&invite.inviter);
        let invitee = Arc::clone(&invite.invitee);
        let pair = [Arc::clone(&inviter), Arc::clone(&invitee)];

        // Both parties must still be sitting in the main room.
        {
            let rs = main.state.read().await;
            for p in &pair {
                let id = p.state.lock().await.id.clone();
                match rs.members.get(&id) {
                    Some(existing) if Arc::ptr_eq(existing, p) => {}
                    _ => return Err(HubError::new(ErrorCode::InviteExpired, "Invite expired")),
                }
            }
        }

        // Close media before touching membership: a live connection would
        // otherwise see tracks vanish and fire renegotiation offers at peers
        // that are mid-move.
        let mut moved_track_ids = Vec::new();
        for p in &pair {
            if let Some(m) = p.media().await {
                moved_track_ids.push(m.track.id().to_string());
            }
            media::close_connection(p).await;
        }
        for track_id in &moved_track_ids {
            self.detach_everywhere(&main, track_id, &inviter).await;
        }

        let sub = Room::new_sub(&main, invite.channel_name.clone(), self.config.chat_history_size);
        {
            let mut ms = main.state.write().await;
            let mut ss = sub.state.write().await;
            for p in &pair {
                let mut ps = p.state.lock().await;
                // A party that vanished while media was closing stays out.
                if ms.members.remove(&ps.id).is_none() {
                    continue;
                }
                ss.members.insert(ps.id.clone(), Arc::clone(p));
                ps.room_id = Some(sub.id.clone());
            }
            if ms.members.is_empty() {
                ms.expired_at = now();
            }
            ms.sub_rooms.insert(sub.id.clone(), Arc::clone(&sub));
        }
        info!(sub = %sub.channel_name, "Sub-channel created");

        for p in &pair {
            self.wire_media(p, &sub).await;
        }
        self.fan_out(&main).await;
        Ok(())
    }

    // =========================================================================
    // MOVES BETWEEN MAIN AND SUB
    // =========================================================================

    pub async fn move_to_main(&self, peer: &Arc<Peer>) -> Result<(), HubError> {
        let Some((main, current)) = self.locate(peer).await else {
            return Err(HubError::invalid("Not in a room"));
        };
        if !current.is_sub() {
            return Ok(());
        }
        self.depart_room(peer, &main, &current, &main).await;

        let history = main.state.read().await.chat.snapshot();
        peer.send(ServerMessage::ChatHistory(ChatHistoryPayload {
            channel_id: main.id.clone(),
            messages: history,
        }));
        self.fan_out(&main).await;
        Ok(())
    }

    pub async fn move_to_sub(
        &self,
        peer: &Arc<Peer>,
        sub_id: RoomId,
    ) -> Result<(), HubError> {
        let Some((main, current)) = self.locate(peer).await else {
            return Err(HubError::invalid("Not in a room"));
        };
        if current.is_sub() {
            return Err(HubError::new(
                ErrorCode::AlreadyInSub,
                "Leave your sub-channel first",
            ));
        }
        let Some(sub) = main.state.read().await.sub_rooms.get(&sub_id).cloned() else {
            return Err(HubError::new(ErrorCode::ChannelNotFound, "No such sub-channel"));
        };
        self.depart_room(peer, &main, &current, &sub).await;

        let history = sub.state.read().await.chat.snapshot();
        peer.send(ServerMessage::ChatHistory(ChatHistoryPayload {
            channel_id: sub.id.clone(),
            messages: history,
        }));
        self.fan_out(&main).await;
        Ok(())
    }

    /// Move a peer `from` -> `to` within one main room: detach its senders
    /// from the room it leaves, close its media, swap membership, settle the
    /// departed sub's countdown, and rebuild media against the destination.
    async fn depart_room(
        &self,
        peer: &Arc<Peer>,
        main: &Arc<Room>,
        from: &Arc<Room>,
        to: &Arc<Room>,
    ) {
        let track_id = peer.media().await.map(|m| m.track.id().to_string());
        if let Some(track_id) = &track_id {
            self.detach_everywhere(main, track_id, peer).await;
        }
        media::close_connection(peer).await;

        let peer_id = peer.state.lock().await.id.clone();
        let mut from_sub_count = None;
        {
            // Parent lock before child: main first whichever direction the
            // move goes.
            let mut ms = main.state.write().await;
            if Arc::ptr_eq(from, main) {
                ms.members.remove(&peer_id);
                if ms.members.is_empty() {
                    ms.expired_at = now();
                }
                let mut ts = to.state.write().await;
                ts.members.insert(peer_id.clone(), Arc::clone(peer));
                ts.expired_at = 0;
                from_sub_count = None;
                // Arriving may change the destination sub's occupancy class.
                let count = ts.members.len();
                drop(ts);
                self.settle_sub_countdown(main, to, count).await;
            } else {
                let mut fs = from.state.write().await;
                fs.members.remove(&peer_id);
                let count = fs.members.len();
                if count == 0 {
                    fs.expired_at = now();
                }
                drop(fs);
                if count == 0 {
                    ms.sub_rooms.remove(&from.id);
                    debug!(sub = %from.channel_name, "Deleted empty sub-channel");
                    if ms.members.is_empty() && ms.sub_rooms.is_empty() {
                        ms.expired_at = now();
                    }
                } else {
                    from_sub_count = Some(count);
                }
                if Arc::ptr_eq(to, main) {
                    ms.members.insert(peer_id.clone(), Arc::clone(peer));
                    ms.expired_at = 0;
                } else {
                    let mut ts = to.state.write().await;
                    ts.members.insert(peer_id.clone(), Arc::clone(peer));
                    ts.expired_at = 0;
                }
            }
        }
        peer.state.lock().await.room_id = Some(to.id.clone());

        if let Some(count) = from_sub_count {
            self.settle_sub_countdown(main, from, count).await;
        }

        self.wire_media(peer, to).await;
    }

    // =========================================================================
    // SUB-CHANNEL COUNTDOWN
    // =========================================================================

    /// Arm, refresh, or clear a sub's lone-occupant countdown to match its
    /// occupant count.
    async fn settle_sub_countdown(&self, main: &Arc<Room>, sub: &Arc<Room>, count: usize) {
        if !sub.is_sub() {
            return;
        }
        if count == 1 {
            self.arm_sub_countdown(main, sub).await;
        } else if count >= 2 {
            sub.state.write().await.countdown_expires_at = 0;
        }
    }

    /// Schedule the 5-minute deferred close for a 1-occupant sub. The timer
    /// re-checks occupancy when it fires; a superseded deadline is a no-op.
    async fn arm_sub_countdown(&self, main: &Arc<Room>, sub: &Arc<Room>) {
        let deadline = chrono::Utc::now().timestamp_millis() + (SUB_COUNTDOWN_SECS as i64) * 1000;
        sub.state.write().await.countdown_expires_at = deadline;

        let hub = self.self_ref.clone();
        let main_id = main.id.clone();
        let sub_id = sub.id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_secs(SUB_COUNTDOWN_SECS)).await;
            if let Some(hub) = hub.upgrade() {
                hub.fire_sub_countdown(&main_id, &sub_id, deadline).await;
            }
        });
    }

    fn fire_sub_countdown<'a>(
        &'a self,
        main_id: &'a RoomId,
        sub_id: &'a RoomId,
        deadline: i64,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            let Some(main) = self.state.read().await.rooms.get(main_id).cloned() else {
                return;
            };
            let Some(sub) = main.state.read().await.sub_rooms.get(sub_id).cloned() else {
                return;
            };
            let (count, lone, current_deadline) = {
                let ss = sub.state.read().await;
                (
                    ss.members.len(),
                    ss.members.values().next().cloned(),
                    ss.countdown_expires_at,
                )
            };
            if current_deadline != deadline {
                return;
            }
            match count {
                0 => {
                    {
                        let mut ms = main.state.write().await;
                        ms.sub_rooms.remove(sub_id);
                        if ms.members.is_empty() && ms.sub_rooms.is_empty() {
                            ms.expired_at = now();
                        }
                    }
                    self.fan_out(&main).await;
                }
                1 => {
                    if let Some(peer) = lone {
                        debug!(sub = %sub.channel_name, "Countdown elapsed; returning lone occupant");
                        if let Err(e) = self.move_to_main(&peer).await {
                            warn!("Countdown move failed: {}", e);
                        }
                    }
                }
                _ => {}
            }
        })
    }

    // =========================================================================
    // GARBAGE COLLECTION
    // =========================================================================

    /// One GC cycle: age out sessions, invites, and create history, then
    /// collect abandoned subs and empty main rooms.
    pub async fn run_gc(&self) {
        let mains = {
            let mut state = self.state.write().await;
            let t = now();

            state
                .sessions
                .retain(|_, (_, issued)| t.saturating_sub(*issued) <= SESSION_MAX_AGE_SECS);

            let rooms = &state.rooms;
            let stale_invites: Vec<String> = state
                .invites
                .iter()
                .filter(|(_, room_id)| match rooms.get(*room_id) {
                    Some(room) => t.saturating_sub(room.created_at) > INVITE_MAX_AGE_SECS,
                    None => true,
                })
                .map(|(token, _)| token.clone())
                .collect();
            for token in stale_invites {
                state.invites.remove(&token);
            }

            let cutoff = t.saturating_sub(CREATE_WINDOW_SECS);
            state.create_history.retain(|_, times| {
                times.retain(|&at| at > cutoff);
                !times.is_empty()
            });

            state.rooms.values().cloned().collect::<Vec<_>>()
        };

        let now_ms = chrono::Utc::now().timestamp_millis();
        for main in &mains {
            let subs: Vec<Arc<Room>> =
                main.state.read().await.sub_rooms.values().cloned().collect();
            for sub in subs {
                let (count, lone, expired_at, countdown) = {
                    let ss = sub.state.read().await;
                    (
                        ss.members.len(),
                        ss.members.values().next().cloned(),
                        ss.expired_at,
                        ss.countdown_expires_at,
                    )
                };
                if count == 0
                    && expired_at > 0
                    && now().saturating_sub(expired_at) > EMPTY_SUB_MAX_AGE_SECS
                {
                    {
                        let mut ms = main.state.write().await;
                        ms.sub_rooms.remove(&sub.id);
                        if ms.members.is_empty() && ms.sub_rooms.is_empty() {
                            ms.expired_at = now();
                        }
                    }
                    debug!(sub = %sub.channel_name, "GC collected empty sub-channel");
                    self.fan_out(main).await;
                } else if count == 1 && countdown > 0 && now_ms > countdown {
                    // Backstop for a countdown timer that never fired.
                    if let Some(peer) = lone {
                        if let Err(e) = self.move_to_main(&peer).await {
                            warn!("GC force-move failed: {}", e);
                        }
                    }
                }
            }
        }

        for main in &mains {
            let occupancy = room::total_occupancy(main).await;
            let expired_at = main.state.read().await.expired_at;
            if occupancy == 0
                && expired_at > 0
                && now().saturating_sub(expired_at) > EMPTY_ROOM_MAX_AGE_SECS
            {
                let mut state = self.state.write().await;
                // Re-check under the lock; a join may have raced the sweep.
                if room::total_occupancy(main).await == 0 {
                    state.rooms.remove(&main.id);
                    state.rooms_by_name.remove(&main.full_name);
                    if let Some(token) = &main.invite_token {
                        state.invites.remove(token);
                    }
                    info!(room = %main.full_name, "GC collected idle room");
                }
            }
        }
    }

    // =========================================================================
    // FAN-OUT AND MEDIA REBUILD
    // =========================================================================

    /// Broadcast a room-update snapshot to everyone reachable from `main`.
    /// The snapshot is taken under the room locks; sends happen afterwards.
    async fn fan_out(&self, main: &Arc<Room>) {
        let payload = room::room_update(main).await;
        for peer in room::reachable_peers(main).await {
            peer.send(ServerMessage::RoomUpdate(payload.clone()));
        }
    }

    /// Best-effort rebuild of every live media connection, used after the
    /// public address changed. One peer's failure never affects the rest.
    pub async fn rebuild_all_media(&self) {
        let mains: Vec<Arc<Room>> = self.state.read().await.rooms.values().cloned().collect();
        for main in mains {
            for peer in room::reachable_peers(&main).await {
                let track_id = peer.media().await.map(|m| m.track.id().to_string());
                if let Some(track_id) = &track_id {
                    self.detach_everywhere(&main, track_id, &peer).await;
                }
                media::close_connection(&peer).await;
                if let Some((_, current)) = self.locate(&peer).await {
                    self.wire_media(&peer, &current).await;
                }
            }
        }
        info!("Rebuilt live media connections for new public address");
    }
}
