//! WebRTC media plumbing: API handle, inbound-track forwarding, sender wiring.
//!
//! The server is a selective-forwarding unit: each participant's RTP is read
//! off its remote track, scrubbed of header extensions, and written into a
//! server-owned local track. Every other participant in the room holds an
//! outbound sender bound to that local track, so a single write fans out to
//! all of them. Nothing is decoded or mixed.

use super::peer::{MediaSession, Peer};
use super::types::HubError;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice::udp_network::{EphemeralUDP, UDPNetwork};
use webrtc::ice_transport::ice_candidate_type::RTCIceCandidateType;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType};
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};
use webrtc::track::track_remote::TrackRemote;

/// Process-wide media configuration: codec registry, UDP port range, and the
/// optional NAT 1-to-1 public address. Rebuilt when the public IP changes.
pub struct MediaApi {
    api: RwLock<Arc<API>>,
    udp_min: u16,
    udp_max: u16,
    public_ip: std::sync::Mutex<Option<IpAddr>>,
}

impl MediaApi {
    pub fn new(udp_min: u16, udp_max: u16, public_ip: Option<IpAddr>) -> Result<Self, HubError> {
        let api = build_api(udp_min, udp_max, public_ip)?;
        Ok(Self {
            api: RwLock::new(Arc::new(api)),
            udp_min,
            udp_max,
            public_ip: std::sync::Mutex::new(public_ip),
        })
    }

    pub async fn api(&self) -> Arc<API> {
        self.api.read().await.clone()
    }

    pub fn public_ip(&self) -> Option<IpAddr> {
        *self.public_ip.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Swap in a rebuilt API for a changed public address. Existing peer
    /// connections keep the old candidates until they are rebuilt.
    pub async fn rebuild(&self, public_ip: Option<IpAddr>) -> Result<(), HubError> {
        let api = build_api(self.udp_min, self.udp_max, public_ip)?;
        *self.api.write().await = Arc::new(api);
        *self.public_ip.lock().unwrap_or_else(|e| e.into_inner()) = public_ip;
        Ok(())
    }
}

/// Opus-only media engine, default interceptors, UDP range and NAT hint.
fn build_api(udp_min: u16, udp_max: u16, public_ip: Option<IpAddr>) -> Result<API, HubError> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_codec(
        RTCRtpCodecParameters {
            capability: RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
                rtcp_feedback: vec![],
            },
            payload_type: 111,
            ..Default::default()
        },
        RTPCodecType::Audio,
    )?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)?;

    let mut setting_engine = SettingEngine::default();
    if udp_min != 0 || udp_max != 0 {
        let ephemeral = EphemeralUDP::new(udp_min, udp_max)
            .map_err(|e| HubError::internal(format!("bad UDP port range: {e}")))?;
        setting_engine.set_udp_network(UDPNetwork::Ephemeral(ephemeral));
    }
    if let Some(ip) = public_ip {
        setting_engine.set_nat_1to1_ips(vec![ip.to_string()], RTCIceCandidateType::Host);
    }

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .with_setting_engine(setting_engine)
        .build())
}

/// Create a fresh media connection for `peer`, bumping its epoch and wiring
/// the inbound-track pump. The caller sends the initial offer afterwards.
pub async fn create_connection(media: &MediaApi, peer: &Arc<Peer>) -> Result<MediaSession, HubError> {
    let api = media.api().await;
    let pc = Arc::new(api.new_peer_connection(RTCConfiguration::default()).await?);

    let peer_id = peer.id().await;
    let track = Arc::new(TrackLocalStaticRTP::new(
        RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48000,
            channels: 2,
            ..Default::default()
        },
        format!("audio-{peer_id}"),
        peer_id.clone(),
    ));

    let epoch = {
        let mut sig = peer.signal.lock().unwrap_or_else(|e| e.into_inner());
        sig.begin_epoch()
    };
    debug!(peer = %peer_id, epoch, "Created media connection");

    // Outbound trickle candidates carry the current (seq, epoch) tag so the
    // client can discard ones from a superseded connection.
    {
        let peer_weak = Arc::downgrade(peer);
        pc.on_ice_candidate(Box::new(move |candidate| {
            let peer_weak = peer_weak.clone();
            Box::pin(async move {
                let (Some(peer), Some(candidate)) = (peer_weak.upgrade(), candidate) else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let (epoch, seq) = peer.signal_tag();
                        peer.send(super::message::ServerMessage::Candidate(
                            super::message::CandidateOutPayload {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_mline_index: init.sdp_mline_index,
                                seq,
                                epoch,
                            },
                        ));
                    }
                    Err(e) => warn!("Failed to serialize ICE candidate: {}", e),
                }
            })
        }));
    }

    // Inbound audio: pump RTP from the remote track into the local sink.
    {
        let sink = Arc::clone(&track);
        let owner = peer_id.clone();
        pc.on_track(Box::new(move |remote, _receiver, _transceiver| {
            let sink = Arc::clone(&sink);
            let owner = owner.clone();
            Box::pin(async move {
                debug!(peer = %owner, track = %remote.id(), "Inbound track started");
                tokio::spawn(forward_rtp(remote, sink));
            })
        }));
    }

    {
        let peer_weak = Arc::downgrade(peer);
        pc.on_peer_connection_state_change(Box::new(move |state| {
            let peer_weak = peer_weak.clone();
            Box::pin(async move {
                if let Some(peer) = peer_weak.upgrade() {
                    super::signal::on_connection_state(&peer, state);
                }
            })
        }));
    }

    let session = MediaSession { pc, track };
    peer.state.lock().await.media = Some(session.clone());
    Ok(session)
}

/// Read RTP off an inbound track and forward it into the server-side sink.
///
/// Header extensions are stripped before the write: extension ids are
/// negotiated per-connection, and forwarding one browser's ids to another
/// browser's decoder can break it.
async fn forward_rtp(remote: Arc<TrackRemote>, sink: Arc<TrackLocalStaticRTP>) {
    loop {
        let (mut packet, _) = match remote.read_rtp().await {
            Ok(v) => v,
            Err(_) => break,
        };
        packet.header.extension = false;
        packet.header.extension_profile = 0;
        packet.header.extensions.clear();
        if let Err(e) = sink.write_rtp(&packet).await {
            if webrtc::Error::ErrClosedPipe == e {
                break;
            }
            debug!("RTP forward dropped a packet: {}", e);
        }
    }
}

/// Bind `track` as an outbound sender on `target`'s connection.
///
/// Returns false when the target has no connection or already carries a
/// sender for this track. Each new sender gets an RTCP drain so feedback
/// packets never back up the write path.
pub async fn attach_track(target: &Arc<Peer>, track: &Arc<TrackLocalStaticRTP>) -> Result<bool, HubError> {
    let Some(session) = target.media().await else {
        return Ok(false);
    };
    for sender in session.pc.get_senders().await {
        if let Some(existing) = sender.track().await {
            if existing.id() == track.id() {
                return Ok(false);
            }
        }
    }
    let sender = session
        .pc
        .add_track(Arc::clone(track) as Arc<dyn TrackLocal + Send + Sync>)
        .await?;
    tokio::spawn(async move {
        let mut rtcp_buf = vec![0u8; 1500];
        while let Ok((_, _)) = sender.read(&mut rtcp_buf).await {}
    });
    Ok(true)
}

/// Remove any outbound sender on `target` bound to `track_id`.
///
/// Works from the track identity alone so it also serves peers whose own
/// connection is already closed (sub-channel transitions).
pub async fn detach_track(target: &Arc<Peer>, track_id: &str) -> Result<bool, HubError> {
    let Some(session) = target.media().await else {
        return Ok(false);
    };
    let mut removed = false;
    for sender in session.pc.get_senders().await {
        let matches = match sender.track().await {
            Some(t) => t.id() == track_id,
            None => false,
        };
        if matches {
            session.pc.remove_track(&sender).await?;
            removed = true;
        }
    }
    Ok(removed)
}

/// Close and drop a peer's media connection, if any.
pub async fn close_connection(peer: &Arc<Peer>) {
    if let Some(session) = peer.take_media().await {
        if let Err(e) = session.pc.close().await {
            debug!("Error closing media connection: {}", e);
        }
    }
}
