//! Per-peer offer/answer state machine.
//!
//! Offers are totally ordered by `(epoch, offer_seq)`. The epoch bumps each
//! time the media connection is rebuilt; answers and candidates tagged for a
//! prior connection are discarded rather than reordered. Offer construction
//! is serialized by the peer's negotiation mutex, and an offer wanted while a
//! previous exchange is mid-flight is deferred: the waiter re-runs the loop
//! when the in-flight answer lands.

use super::message::{AnswerPayload, CandidatePayload, OfferPayload, ServerMessage};
use super::peer::Peer;
use super::types::{HubError, OFFER_TIMEOUT_SECS, RESTART_DEBOUNCE_SECS};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;

fn sig_lock(peer: &Peer) -> std::sync::MutexGuard<'_, super::peer::SignalState> {
    peer.signal.lock().unwrap_or_else(|e| e.into_inner())
}

/// Produce an offer for `peer` and wait for its answer.
///
/// `is_initial` marks the first negotiation of a fresh epoch: a recv-only
/// audio transceiver is added so the server will accept the microphone.
/// When the signaling state is mid-exchange the offer is deferred instead of
/// produced; adjacent renegotiation requests collapse into one extra round.
pub async fn negotiate(peer: &Arc<Peer>, is_initial: bool) -> Result<(), HubError> {
    let mut add_recv = is_initial;
    loop {
        let answer_rx = {
            let _guard = peer.negotiation.lock().await;
            let Some(session) = peer.media().await else {
                return Err(HubError::internal("no media connection to negotiate"));
            };

            if add_recv {
                add_recv = false;
                session
                    .pc
                    .add_transceiver_from_kind(
                        RTPCodecType::Audio,
                        Some(RTCRtpTransceiverInit {
                            direction: RTCRtpTransceiverDirection::Recvonly,
                            send_encodings: vec![],
                        }),
                    )
                    .await?;
            }

            if session.pc.signaling_state() != RTCSignalingState::Stable {
                // An answer is in flight; its waiter re-enters this loop.
                sig_lock(peer).pending_renego = true;
                return Ok(());
            }

            let (tx, rx) = oneshot::channel();
            let (seq, epoch) = {
                let mut sig = sig_lock(peer);
                sig.offer_seq += 1;
                sig.pending_renego = false;
                sig.answer_tx = Some(tx);
                (sig.offer_seq, sig.epoch)
            };

            let offer = session.pc.create_offer(None).await?;
            session.pc.set_local_description(offer.clone()).await?;
            peer.send(ServerMessage::Offer(OfferPayload {
                sdp: offer.sdp,
                reset: seq == 1,
                seq,
                epoch,
            }));
            debug!(seq, epoch, "Sent offer");
            rx
        };

        match tokio::time::timeout(Duration::from_secs(OFFER_TIMEOUT_SECS), answer_rx).await {
            Ok(Ok(())) => {
                let deferred = std::mem::take(&mut sig_lock(peer).pending_renego);
                if deferred {
                    continue;
                }
                return Ok(());
            }
            // Completion handle dropped: the connection was replaced and the
            // new epoch owns signaling now.
            Ok(Err(_)) => return Ok(()),
            Err(_) => {
                warn!("Offer went unanswered for {}s; abandoning it", OFFER_TIMEOUT_SECS);
                return Ok(());
            }
        }
    }
}

/// Apply a client answer if its `(epoch, seq)` tag matches the outstanding
/// offer; otherwise drop it.
pub async fn handle_answer(peer: &Arc<Peer>, payload: AnswerPayload) -> Result<(), HubError> {
    let Some(session) = peer.media().await else {
        return Ok(());
    };
    {
        let sig = sig_lock(peer);
        if payload.epoch != sig.epoch || payload.seq != sig.offer_seq {
            debug!(
                got_epoch = payload.epoch,
                got_seq = payload.seq,
                epoch = sig.epoch,
                seq = sig.offer_seq,
                "Discarding stale answer"
            );
            return Ok(());
        }
    }

    let answer = RTCSessionDescription::answer(payload.sdp)
        .map_err(|e| HubError::invalid(format!("Bad SDP answer: {e}")))?;
    session.pc.set_remote_description(answer).await?;

    let (buffered, ready) = {
        let mut sig = sig_lock(peer);
        sig.has_remote = true;
        (std::mem::take(&mut sig.queued_candidates), sig.answer_tx.take())
    };
    for candidate in buffered {
        if let Err(e) = session.pc.add_ice_candidate(candidate).await {
            warn!("Buffered ICE candidate rejected: {}", e);
        }
    }
    if let Some(tx) = ready {
        let _ = tx.send(());
    }
    Ok(())
}

/// Apply a trickle candidate. Late candidates (seq below the current offer,
/// same epoch) are accepted; future or cross-epoch candidates are dropped.
/// Candidates arriving before the remote description are buffered.
pub async fn handle_candidate(peer: &Arc<Peer>, payload: CandidatePayload) -> Result<(), HubError> {
    let Some(session) = peer.media().await else {
        return Ok(());
    };
    let init = RTCIceCandidateInit {
        candidate: payload.candidate,
        sdp_mid: payload.sdp_mid,
        sdp_mline_index: payload.sdp_mline_index,
        username_fragment: None,
    };
    {
        let mut sig = sig_lock(peer);
        if payload.epoch != sig.epoch {
            debug!(got = payload.epoch, epoch = sig.epoch, "Discarding cross-epoch candidate");
            return Ok(());
        }
        if payload.seq > sig.offer_seq {
            debug!(got = payload.seq, seq = sig.offer_seq, "Discarding future candidate");
            return Ok(());
        }
        if !sig.has_remote {
            sig.queued_candidates.push(init);
            return Ok(());
        }
    }
    if let Err(e) = session.pc.add_ice_candidate(init).await {
        warn!("ICE candidate rejected: {}", e);
    }
    Ok(())
}

/// React to media connection-state transitions.
///
/// `disconnected` queues a debounced restart, `failed` an immediate one, and
/// `connected` clears the queue flag. Teardown (`closed`) is always explicit.
pub fn on_connection_state(peer: &Arc<Peer>, state: RTCPeerConnectionState) {
    debug!(?state, "Media connection state changed");
    match state {
        RTCPeerConnectionState::Connected => {
            sig_lock(peer).restart_queued = false;
        }
        RTCPeerConnectionState::Disconnected => {
            queue_restart(peer, Duration::from_secs(RESTART_DEBOUNCE_SECS));
        }
        RTCPeerConnectionState::Failed => {
            queue_restart(peer, Duration::ZERO);
        }
        _ => {}
    }
}

/// Queue at most one ICE-restart attempt for the peer.
fn queue_restart(peer: &Arc<Peer>, delay: Duration) {
    {
        let mut sig = sig_lock(peer);
        if sig.restart_queued {
            return;
        }
        sig.restart_queued = true;
    }
    let peer = Arc::clone(peer);
    tokio::spawn(async move {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        ice_restart(peer).await;
    });
}

/// Build and send an ICE-restart offer, unless the connection recovered or
/// was torn down while the restart was queued.
async fn ice_restart(peer: Arc<Peer>) {
    let answer_rx = {
        let _guard = peer.negotiation.lock().await;
        sig_lock(&peer).restart_queued = false;

        let Some(session) = peer.media().await else {
            return;
        };
        match session.pc.connection_state() {
            RTCPeerConnectionState::Connected | RTCPeerConnectionState::Closed => return,
            _ => {}
        }

        let (tx, rx) = oneshot::channel();
        let (seq, epoch) = {
            let mut sig = sig_lock(&peer);
            sig.offer_seq += 1;
            sig.pending_renego = false;
            sig.answer_tx = Some(tx);
            (sig.offer_seq, sig.epoch)
        };

        let options = RTCOfferOptions {
            ice_restart: true,
            voice_activity_detection: false,
        };
        let offer = match session.pc.create_offer(Some(options)).await {
            Ok(o) => o,
            Err(e) => {
                warn!("ICE-restart offer failed: {}", e);
                return;
            }
        };
        if let Err(e) = session.pc.set_local_description(offer.clone()).await {
            warn!("ICE-restart local description failed: {}", e);
            return;
        }
        peer.send(ServerMessage::Offer(OfferPayload {
            sdp: offer.sdp,
            reset: false,
            seq,
            epoch,
        }));
        debug!(seq, epoch, "Sent ICE-restart offer");
        rx
    };

    if tokio::time::timeout(Duration::from_secs(OFFER_TIMEOUT_SECS), answer_rx)
        .await
        .is_err()
    {
        warn!("ICE-restart offer went unanswered");
    }
}
