pub mod config;
pub mod net;

pub use config::Config;
pub use net::{ConnectionAdmission, ErrorCode, Hub, HubError, MediaApi, Peer};
