//! Session and media-routing layer

pub mod conn;
pub mod hub;
pub mod media;
pub mod message;
pub mod peer;
pub mod rate_limit;
pub mod room;
pub mod signal;
pub mod types;

// Re-exports
pub use conn::handle_connection;
pub use hub::Hub;
pub use media::MediaApi;
pub use message::{ClientMessage, Envelope, ServerMessage};
pub use peer::{MediaSession, Outbound, Peer, PeerState, SignalState};
pub use rate_limit::{ConnectionAdmission, MessageLimiter, MessageVerdict, TokenBucket};
pub use room::{ChatHistory, PendingInvite, Room, RoomState};
pub use types::{ErrorCode, HubError, PeerId, RoomId};
