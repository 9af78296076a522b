//! Per-peer state and signaling counters

use super::message::{ServerMessage, UserEntry};
use super::types::{now, random_hex, PeerId, RoomId, ID_BYTES};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;

/// One frame queued for the peer's writer task.
#[derive(Debug)]
pub enum Outbound {
    Frame(ServerMessage),
    /// Close the transport with a WebSocket close code.
    Close { code: u16, reason: &'static str },
}

/// Live media resources owned by a peer. Recreated on every epoch bump.
#[derive(Clone)]
pub struct MediaSession {
    pub pc: Arc<RTCPeerConnection>,
    /// Server-side sink this peer's microphone RTP is written into. Every
    /// other participant holds an outbound sender bound to this track.
    pub track: Arc<TrackLocalStaticRTP>,
}

/// Identity, membership, and media fields. Guarded by [`Peer::state`];
/// acquired only after any Hub or Room lock already held.
pub struct PeerState {
    pub id: PeerId,
    pub name: String,
    /// Room the peer currently sits in (main or sub). `None` until joined.
    pub room_id: Option<RoomId>,
    /// The enclosing main room. Equals `room_id` while in the main room.
    pub main_room_id: Option<RoomId>,
    pub muted: bool,
    pub session_token: Option<String>,
    pub session_created: u64,
    pub media: Option<MediaSession>,
}

/// Offer/answer bookkeeping. A plain mutex: critical sections never await,
/// and the media library's callbacks touch it from its own tasks.
#[derive(Default)]
pub struct SignalState {
    /// Bumped each time the media connection is (re)created.
    pub epoch: u64,
    /// Monotonic per epoch; reset to zero by [`SignalState::begin_epoch`].
    pub offer_seq: u64,
    /// An offer was wanted while signaling was mid-exchange; the waiter
    /// re-runs negotiation once the in-flight answer lands.
    pub pending_renego: bool,
    /// One-shot completion handle for the offer currently awaiting an answer.
    pub answer_tx: Option<oneshot::Sender<()>>,
    /// Candidates that arrived before the remote description was set.
    pub queued_candidates: Vec<RTCIceCandidateInit>,
    pub has_remote: bool,
    /// At most one ICE restart may be queued at a time.
    pub restart_queued: bool,
}

impl SignalState {
    /// Reset counters for a freshly-created media connection.
    pub fn begin_epoch(&mut self) -> u64 {
        self.epoch += 1;
        self.offer_seq = 0;
        self.pending_renego = false;
        self.answer_tx = None;
        self.queued_candidates.clear();
        self.has_remote = false;
        self.restart_queued = false;
        self.epoch
    }
}

/// One connected participant.
///
/// Lock order: Hub -> Room -> `state`. The write path (the mpsc handle) and
/// `negotiation` are independent of that chain and must never be held while
/// acquiring Hub or Room locks.
pub struct Peer {
    tx: mpsc::UnboundedSender<Outbound>,
    pub state: Mutex<PeerState>,
    /// Serializes offer construction; held across SDP calls, never across
    /// Hub/Room acquisition.
    pub negotiation: Mutex<()>,
    pub signal: std::sync::Mutex<SignalState>,
}

impl Peer {
    pub fn new(tx: mpsc::UnboundedSender<Outbound>) -> Arc<Self> {
        Arc::new(Self {
            tx,
            state: Mutex::new(PeerState {
                id: random_hex(ID_BYTES),
                name: String::new(),
                room_id: None,
                main_room_id: None,
                muted: false,
                session_token: None,
                session_created: now(),
                media: None,
            }),
            negotiation: Mutex::new(()),
            signal: std::sync::Mutex::new(SignalState::default()),
        })
    }

    /// Queue a frame for the writer task. Send failures mean the transport
    /// is already gone; the removal path handles the rest.
    pub fn send(&self, msg: ServerMessage) {
        let _ = self.tx.send(Outbound::Frame(msg));
    }

    /// Ask the writer task to close the transport.
    pub fn close(&self, code: u16, reason: &'static str) {
        let _ = self.tx.send(Outbound::Close { code, reason });
    }

    pub async fn id(&self) -> PeerId {
        self.state.lock().await.id.clone()
    }

    pub async fn user_entry(&self, in_sub_channel: Option<RoomId>) -> UserEntry {
        let state = self.state.lock().await;
        UserEntry {
            id: state.id.clone(),
            name: state.name.clone(),
            muted: state.muted,
            in_sub_channel,
        }
    }

    /// Detach and return the media session, leaving the peer media-less.
    pub async fn take_media(&self) -> Option<MediaSession> {
        self.state.lock().await.media.take()
    }

    pub async fn media(&self) -> Option<MediaSession> {
        self.state.lock().await.media.clone()
    }

    /// Current (epoch, offer_seq) tag for outbound candidates.
    pub fn signal_tag(&self) -> (u64, u64) {
        let sig = self.signal.lock().unwrap_or_else(|e| e.into_inner());
        (sig.epoch, sig.offer_seq)
    }
}
