//! Rooms, sub-rooms, chat history, and pending invites

use super::message::{ChatEntry, RoomStatePayload, RoomUpdatePayload, SubChannelEntry, UserEntry};
use super::peer::Peer;
use super::types::{now, random_hex, PeerId, RoomId, ID_BYTES};
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

/// Bounded chat ring: newest at the tail, oldest evicted first.
pub struct ChatHistory {
    capacity: usize,
    messages: VecDeque<ChatEntry>,
}

impl ChatHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            messages: VecDeque::with_capacity(capacity.min(64)),
        }
    }

    pub fn push(&mut self, entry: ChatEntry) {
        while self.messages.len() >= self.capacity {
            self.messages.pop_front();
        }
        self.messages.push_back(entry);
    }

    pub fn snapshot(&self) -> Vec<ChatEntry> {
        self.messages.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// Mutable room state. Guarded by [`Room::state`]; a parent room's lock is
/// always acquired before a child sub-room's.
pub struct RoomState {
    pub members: HashMap<PeerId, Arc<Peer>>,
    /// Sub-rooms by id. Always empty on sub-rooms themselves (depth <= 1).
    pub sub_rooms: HashMap<RoomId, Arc<Room>>,
    pub chat: ChatHistory,
    next_chat_id: u64,
    /// Unix seconds the room became empty; zero while occupied.
    pub expired_at: u64,
    /// Unix milliseconds the lone-occupant countdown fires; zero while off.
    pub countdown_expires_at: i64,
}

/// A main room or a depth-1 sub-room.
pub struct Room {
    pub id: RoomId,
    pub channel_name: String,
    /// `name#NNNN`. Sub-rooms reuse their plain name here.
    pub full_name: String,
    /// Join token for main rooms; sub-rooms are only reachable by invite flow.
    pub invite_token: Option<String>,
    pub parent_id: Option<RoomId>,
    pub password_hash: String,
    pub created_at: u64,
    pub state: RwLock<RoomState>,
}

impl Room {
    pub fn new_main(
        channel_name: String,
        full_name: String,
        password_hash: String,
        invite_token: String,
        chat_capacity: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: random_hex(ID_BYTES),
            channel_name,
            full_name,
            invite_token: Some(invite_token),
            parent_id: None,
            password_hash,
            created_at: now(),
            state: RwLock::new(RoomState {
                members: HashMap::new(),
                sub_rooms: HashMap::new(),
                chat: ChatHistory::new(chat_capacity),
                next_chat_id: 0,
                expired_at: 0,
                countdown_expires_at: 0,
            }),
        })
    }

    /// Sub-rooms inherit the parent's password hash and have no invite token.
    pub fn new_sub(parent: &Room, name: String, chat_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            id: random_hex(ID_BYTES),
            full_name: name.clone(),
            channel_name: name,
            invite_token: None,
            parent_id: Some(parent.id.clone()),
            password_hash: parent.password_hash.clone(),
            created_at: now(),
            state: RwLock::new(RoomState {
                members: HashMap::new(),
                sub_rooms: HashMap::new(),
                chat: ChatHistory::new(chat_capacity),
                next_chat_id: 0,
                expired_at: 0,
                countdown_expires_at: 0,
            }),
        })
    }

    pub fn is_sub(&self) -> bool {
        self.parent_id.is_some()
    }

    /// Append a chat message, assigning its server id and timestamp.
    pub async fn append_chat(&self, user_id: PeerId, user_name: String, ciphertext: String) -> ChatEntry {
        let mut state = self.state.write().await;
        state.next_chat_id += 1;
        let entry = ChatEntry {
            id: state.next_chat_id,
            user_id,
            user_name,
            ciphertext,
            timestamp: chrono::Utc::now().timestamp_millis(),
            channel_id: self.id.clone(),
        };
        state.chat.push(entry.clone());
        entry
    }

    /// Members of this one room (not descendants).
    pub async fn members(&self) -> Vec<Arc<Peer>> {
        self.state.read().await.members.values().cloned().collect()
    }

    pub async fn member_count(&self) -> usize {
        self.state.read().await.members.len()
    }
}

/// The random `#NNNN` suffix of a full room name.
pub fn random_suffix() -> String {
    format!("{:04}", rand::thread_rng().gen_range(0..10_000))
}

/// Occupancy across a main room and all of its subs.
pub async fn total_occupancy(main: &Arc<Room>) -> usize {
    let (mut count, subs) = {
        let state = main.state.read().await;
        (state.members.len(), state.sub_rooms.values().cloned().collect::<Vec<_>>())
    };
    for sub in subs {
        count += sub.state.read().await.members.len();
    }
    count
}

/// True when any peer in the main room or its subs already uses `name`.
pub async fn name_in_use(main: &Arc<Room>, name: &str) -> bool {
    for peer in reachable_peers(main).await {
        if peer.state.lock().await.name == name {
            return true;
        }
    }
    false
}

/// Everyone reachable from a main room: its members plus every sub's members.
pub async fn reachable_peers(main: &Arc<Room>) -> Vec<Arc<Peer>> {
    let (mut peers, subs) = {
        let state = main.state.read().await;
        (
            state.members.values().cloned().collect::<Vec<_>>(),
            state.sub_rooms.values().cloned().collect::<Vec<_>>(),
        )
    };
    for sub in subs {
        peers.extend(sub.state.read().await.members.values().cloned());
    }
    peers
}

/// Build the users + sub-channels delta broadcast on membership changes.
pub async fn room_update(main: &Arc<Room>) -> RoomUpdatePayload {
    let (main_members, subs) = {
        let state = main.state.read().await;
        (
            state.members.values().cloned().collect::<Vec<_>>(),
            state.sub_rooms.values().cloned().collect::<Vec<_>>(),
        )
    };

    let mut users = Vec::new();
    for peer in &main_members {
        users.push(peer.user_entry(None).await);
    }

    let mut sub_channels = Vec::new();
    for sub in &subs {
        let (sub_members, countdown) = {
            let state = sub.state.read().await;
            (
                state.members.values().cloned().collect::<Vec<_>>(),
                state.countdown_expires_at,
            )
        };
        let mut sub_users = Vec::new();
        for peer in &sub_members {
            let entry = peer.user_entry(Some(sub.id.clone())).await;
            sub_users.push(entry.clone());
            users.push(entry);
        }
        sub_channels.push(SubChannelEntry {
            id: sub.id.clone(),
            name: sub.channel_name.clone(),
            users: sub_users,
            countdown_expires_at: if countdown > 0 { Some(countdown) } else { None },
        });
    }

    RoomUpdatePayload { users, sub_channels }
}

/// Full snapshot for a `welcome`, including the main room's chat history.
pub async fn room_state_payload(main: &Arc<Room>, current_channel_id: RoomId) -> RoomStatePayload {
    let update = room_update(main).await;
    let chat_history = main.state.read().await.chat.snapshot();
    RoomStatePayload {
        id: main.id.clone(),
        name: main.channel_name.clone(),
        full_name: main.full_name.clone(),
        current_channel_id,
        users: update.users,
        sub_channels: update.sub_channels,
        chat_history,
    }
}

/// A sub-channel invite awaiting the target's response.
pub struct PendingInvite {
    pub id: String,
    pub inviter: Arc<Peer>,
    pub invitee: Arc<Peer>,
    pub main_room_id: RoomId,
    pub channel_name: String,
    pub created_at: u64,
    /// 30-second expiry timer; aborted on accept or decline.
    pub timer: Option<JoinHandle<()>>,
}

impl Drop for PendingInvite {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}
