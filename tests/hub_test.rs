//! Hub behavior tests: create/join round trips, sub-channel lifecycle,
//! session reconnect, chat scoping, and garbage collection.
//!
//! Peers here are backed by plain channels; media wiring degrades to a no-op
//! or a connection nobody answers, which is exactly what these tests want.
//!
//! Run with: cargo test --test hub_test

use parlor::config::Config;
use parlor::net::hub::Hub;
use parlor::net::media::MediaApi;
use parlor::net::message::{JoinPayload, ServerMessage, WelcomePayload};
use parlor::net::peer::{Outbound, Peer};
use parlor::net::types::{now, ErrorCode};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

type Rx = mpsc::UnboundedReceiver<Outbound>;

fn test_hub(config: Config) -> Arc<Hub> {
    let media = MediaApi::new(0, 0, None).expect("media api");
    Hub::new(config, media)
}

fn new_peer() -> (Arc<Peer>, Rx) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Peer::new(tx), rx)
}

fn ip(last: u8) -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(203, 0, 113, last))
}

fn join_password(username: &str, channel: &str, password: &str) -> JoinPayload {
    JoinPayload {
        username: username.into(),
        channel_name: Some(channel.into()),
        password: Some(password.into()),
        invite_token: None,
        session_token: None,
    }
}

/// Pull frames until one matches, ignoring the rest (offers, updates, ...).
async fn recv_matching<F>(rx: &mut Rx, mut pred: F) -> ServerMessage
where
    F: FnMut(&ServerMessage) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Some(Outbound::Frame(msg)) if pred(&msg) => return msg,
                Some(_) => continue,
                None => panic!("channel closed while waiting for a frame"),
            }
        }
    })
    .await
    .expect("timed out waiting for a frame")
}

async fn recv_welcome(rx: &mut Rx) -> WelcomePayload {
    match recv_matching(rx, |m| matches!(m, ServerMessage::Welcome(_))).await {
        ServerMessage::Welcome(w) => w,
        _ => unreachable!(),
    }
}

/// Assert that no frame matching the predicate is currently queued.
fn assert_no_queued<F>(rx: &mut Rx, mut pred: F)
where
    F: FnMut(&ServerMessage) -> bool,
{
    while let Ok(out) = rx.try_recv() {
        if let Outbound::Frame(msg) = out {
            assert!(!pred(&msg), "unexpected frame was queued");
        }
    }
}

// =============================================================================
// CREATE + JOIN
// =============================================================================

#[tokio::test]
async fn test_create_then_two_joins() {
    let hub = test_hub(Config::default());
    let (a, mut arx) = new_peer();
    hub.create_room(&a, "a".into(), "Lobby".into(), "secret1".into(), ip(1))
        .await
        .expect("create");

    let wa = recv_welcome(&mut arx).await;
    assert!(wa.room_state.full_name.starts_with("Lobby#"));
    assert_eq!(wa.room_state.full_name.len(), "Lobby#".len() + 4);
    assert!(wa.room_state.chat_history.is_empty());
    assert!(wa.room_state.sub_channels.is_empty());
    assert!(!wa.session_token.is_empty());
    assert!(wa.invite_token.is_some());

    let full_name = wa.room_state.full_name.clone();

    // Wrong password first
    let (b, mut brx) = new_peer();
    let err = hub
        .join_room(&b, join_password("b", &full_name, "wrong-password"))
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::PasswordWrong);

    // Then the real one
    hub.join_room(&b, join_password("b", &full_name, "secret1"))
        .await
        .expect("join");
    let wb = recv_welcome(&mut brx).await;
    assert_eq!(wb.room_state.users.len(), 2);
    assert!(wb.room_state.chat_history.is_empty());

    // A observes the membership change
    let update = recv_matching(&mut arx, |m| {
        matches!(m, ServerMessage::RoomUpdate(u) if u.users.len() == 2)
    })
    .await;
    if let ServerMessage::RoomUpdate(u) = update {
        let mut names: Vec<&str> = u.users.iter().map(|u| u.name.as_str()).collect();
        names.sort_unstable();
        assert_eq!(names, vec!["a", "b"]);
    }
}

#[tokio::test]
async fn test_join_by_invite_token_skips_password() {
    let hub = test_hub(Config::default());
    let (a, mut arx) = new_peer();
    hub.create_room(&a, "a".into(), "Lobby".into(), "secret1".into(), ip(1))
        .await
        .expect("create");
    let invite = recv_welcome(&mut arx).await.invite_token.expect("invite");

    let (b, mut brx) = new_peer();
    hub.join_room(
        &b,
        JoinPayload {
            username: "b".into(),
            channel_name: None,
            password: None,
            invite_token: Some(invite),
            session_token: None,
        },
    )
    .await
    .expect("invite join");
    assert_eq!(recv_welcome(&mut brx).await.room_state.users.len(), 2);
}

#[tokio::test]
async fn test_join_failure_modes() {
    let hub = test_hub(Config::default());
    let (a, mut arx) = new_peer();
    hub.create_room(&a, "a".into(), "Lobby".into(), "secret1".into(), ip(1))
        .await
        .expect("create");
    let full_name = recv_welcome(&mut arx).await.room_state.full_name;

    let (b, _brx) = new_peer();
    let err = hub
        .join_room(&b, join_password("b", "Nowhere#0000", "secret1"))
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::ChannelNotFound);

    let err = hub
        .join_room(
            &b,
            JoinPayload {
                username: "b".into(),
                channel_name: Some(full_name.clone()),
                password: None,
                invite_token: None,
                session_token: None,
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::PasswordRequired);

    // Duplicate display name anywhere under the main room is rejected
    let err = hub
        .join_room(&b, join_password("a", &full_name, "secret1"))
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::NameTaken);

    // No join method at all
    let err = hub
        .join_room(
            &b,
            JoinPayload {
                username: "b".into(),
                channel_name: None,
                password: None,
                invite_token: None,
                session_token: None,
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidMessage);
}

#[tokio::test]
async fn test_room_capacity() {
    let config = Config {
        max_users_per_room: 2,
        ..Config::default()
    };
    let hub = test_hub(config);
    let (a, mut arx) = new_peer();
    hub.create_room(&a, "a".into(), "Lobby".into(), "secret1".into(), ip(1))
        .await
        .expect("create");
    let full_name = recv_welcome(&mut arx).await.room_state.full_name;

    let (b, _brx) = new_peer();
    hub.join_room(&b, join_password("b", &full_name, "secret1"))
        .await
        .expect("join");

    let (c, _crx) = new_peer();
    let err = hub
        .join_room(&c, join_password("c", &full_name, "secret1"))
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::ChannelFull);
}

#[tokio::test]
async fn test_server_room_cap() {
    let config = Config {
        max_rooms: 1,
        ..Config::default()
    };
    let hub = test_hub(config);
    let (a, _arx) = new_peer();
    hub.create_room(&a, "a".into(), "One".into(), "secret1".into(), ip(1))
        .await
        .expect("create");

    let (b, _brx) = new_peer();
    let err = hub
        .create_room(&b, "b".into(), "Two".into(), "secret1".into(), ip(2))
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::ServerFull);
}

#[tokio::test]
async fn test_per_ip_create_cap() {
    let hub = test_hub(Config::default());
    for i in 0..3 {
        let (p, _rx) = new_peer();
        hub.create_room(
            &p,
            format!("user{i}"),
            format!("Room {i}"),
            "secret1".into(),
            ip(9),
        )
        .await
        .expect("create within cap");
    }
    let (p, _rx) = new_peer();
    let err = hub
        .create_room(&p, "late".into(), "Room 3".into(), "secret1".into(), ip(9))
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::ServerFull);

    // A different address is unaffected
    let (q, _rx) = new_peer();
    hub.create_room(&q, "other".into(), "Room 4".into(), "secret1".into(), ip(10))
        .await
        .expect("create from other ip");
}

// =============================================================================
// SESSION RECONNECT
// =============================================================================

#[tokio::test]
async fn test_session_reconnect_restores_identity() {
    let hub = test_hub(Config::default());
    let (a, mut arx) = new_peer();
    hub.create_room(&a, "a".into(), "Lobby".into(), "secret1".into(), ip(1))
        .await
        .expect("create");
    let wa = recv_welcome(&mut arx).await;

    // Transport drops; the session entry stays behind.
    hub.remove_peer(&a).await;

    let (a2, mut a2rx) = new_peer();
    hub.join_room(
        &a2,
        JoinPayload {
            username: "a".into(),
            channel_name: None,
            password: None,
            invite_token: None,
            session_token: Some(wa.session_token.clone()),
        },
    )
    .await
    .expect("resume");

    let w2 = recv_welcome(&mut a2rx).await;
    assert_eq!(w2.user_id, wa.user_id);
    assert_eq!(w2.session_token, wa.session_token);
    assert_eq!(w2.room_state.full_name, wa.room_state.full_name);
    assert_eq!(a2.state.lock().await.name, "a");
}

#[tokio::test]
async fn test_unknown_or_left_session_fails() {
    let hub = test_hub(Config::default());
    let (a, mut arx) = new_peer();
    hub.create_room(&a, "a".into(), "Lobby".into(), "secret1".into(), ip(1))
        .await
        .expect("create");
    let token = recv_welcome(&mut arx).await.session_token;

    // An explicit leave invalidates the session on purpose.
    hub.leave(&a).await;

    let (a2, _a2rx) = new_peer();
    let err = hub
        .join_room(
            &a2,
            JoinPayload {
                username: "a".into(),
                channel_name: None,
                password: None,
                invite_token: None,
                session_token: Some(token),
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::AuthFailed);
}

// =============================================================================
// SUB-CHANNEL LIFECYCLE
// =============================================================================

async fn setup_pair(hub: &Arc<Hub>) -> ((Arc<Peer>, Rx), (Arc<Peer>, Rx), String) {
    let (a, mut arx) = new_peer();
    hub.create_room(&a, "a".into(), "Lobby".into(), "secret1".into(), ip(1))
        .await
        .expect("create");
    let full_name = recv_welcome(&mut arx).await.room_state.full_name;

    let (b, mut brx) = new_peer();
    hub.join_room(&b, join_password("b", &full_name, "secret1"))
        .await
        .expect("join");
    recv_welcome(&mut brx).await;

    ((a, arx), (b, brx), full_name)
}

#[tokio::test]
async fn test_sub_invite_accept_and_moves() {
    let hub = test_hub(Config::default());
    let ((a, mut arx), (b, mut brx), _) = setup_pair(&hub).await;
    let b_id = b.id().await;

    hub.sub_invite(&a, b_id.clone(), Some("war-room".into()))
        .await
        .expect("invite");
    let req = recv_matching(&mut brx, |m| matches!(m, ServerMessage::InviteReq(_))).await;
    let invite_id = match req {
        ServerMessage::InviteReq(p) => {
            assert_eq!(p.from_name, "a");
            assert_eq!(p.channel_name, "war-room");
            p.invite_id
        }
        _ => unreachable!(),
    };

    hub.sub_response(&b, invite_id, true).await.expect("accept");

    // Both land in the new sub, and the update says so.
    let update = recv_matching(&mut arx, |m| {
        matches!(m, ServerMessage::RoomUpdate(u) if !u.sub_channels.is_empty())
    })
    .await;
    let sub_id = match update {
        ServerMessage::RoomUpdate(u) => {
            let sub = &u.sub_channels[0];
            assert_eq!(sub.name, "war-room");
            assert_eq!(sub.users.len(), 2);
            assert!(u.users.iter().all(|u| u.in_sub_channel.as_deref() == Some(sub.id.as_str())));
            sub.id.clone()
        }
        _ => unreachable!(),
    };

    // A returns to the main room; the lone-occupant countdown arms.
    hub.move_to_main(&a).await.expect("move to main");
    recv_matching(&mut arx, |m| matches!(m, ServerMessage::ChatHistory(_))).await;
    let update = recv_matching(&mut arx, |m| {
        matches!(m, ServerMessage::RoomUpdate(u)
            if u.sub_channels.len() == 1 && u.sub_channels[0].users.len() == 1)
    })
    .await;
    if let ServerMessage::RoomUpdate(u) = update {
        let expires = u.sub_channels[0].countdown_expires_at.expect("countdown armed");
        let now_ms = chrono::Utc::now().timestamp_millis();
        assert!(expires > now_ms + 4 * 60 * 1000 && expires < now_ms + 6 * 60 * 1000);
    }

    // A rejoins the sub; the countdown clears.
    hub.move_to_sub(&a, sub_id).await.expect("move to sub");
    recv_matching(&mut arx, |m| matches!(m, ServerMessage::ChatHistory(_))).await;
    let update = recv_matching(&mut arx, |m| {
        matches!(m, ServerMessage::RoomUpdate(u)
            if u.sub_channels.len() == 1 && u.sub_channels[0].users.len() == 2)
    })
    .await;
    if let ServerMessage::RoomUpdate(u) = update {
        assert!(u.sub_channels[0].countdown_expires_at.is_none());
    }

    // Moving to main twice is a no-op the second time.
    hub.move_to_main(&a).await.expect("move");
    hub.move_to_main(&a).await.expect("no-op move");
}

#[tokio::test]
async fn test_sub_invite_decline() {
    let hub = test_hub(Config::default());
    let ((a, mut arx), (b, mut brx), _) = setup_pair(&hub).await;
    let b_id = b.id().await;

    hub.sub_invite(&a, b_id, None).await.expect("invite");
    let invite_id = match recv_matching(&mut brx, |m| matches!(m, ServerMessage::InviteReq(_))).await
    {
        ServerMessage::InviteReq(p) => {
            // No proposed name falls back to the default
            assert_eq!(p.channel_name, "Private");
            p.invite_id
        }
        _ => unreachable!(),
    };

    hub.sub_response(&b, invite_id.clone(), false)
        .await
        .expect("decline");
    let expired = recv_matching(&mut arx, |m| matches!(m, ServerMessage::InviteExpired(_))).await;
    if let ServerMessage::InviteExpired(p) = expired {
        assert_eq!(p.reason, "declined");
        assert_eq!(p.invite_id, invite_id);
    }

    // The invite is spent; answering again fails.
    let err = hub.sub_response(&b, invite_id, true).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::InviteExpired);
}

#[tokio::test]
async fn test_sub_invite_rules() {
    let hub = test_hub(Config::default());
    let ((a, _arx), (b, mut brx), _) = setup_pair(&hub).await;
    let a_id = a.id().await;
    let b_id = b.id().await;

    // Unknown target
    let err = hub
        .sub_invite(&a, "missing-user".into(), None)
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::ChannelNotFound);

    // Put both into a sub, then check the in-sub restrictions
    hub.sub_invite(&a, b_id.clone(), None).await.expect("invite");
    let invite_id = match recv_matching(&mut brx, |m| matches!(m, ServerMessage::InviteReq(_))).await
    {
        ServerMessage::InviteReq(p) => p.invite_id,
        _ => unreachable!(),
    };
    hub.sub_response(&b, invite_id, true).await.expect("accept");

    let err = hub.sub_invite(&a, b_id, None).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::AlreadyInSub);

    // A peer that never joined anything cannot invite at all
    let (c, _crx) = new_peer();
    let err = hub.sub_invite(&c, a_id, None).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidMessage);
}

#[tokio::test(start_paused = true)]
async fn test_sub_invite_timeout() {
    let hub = test_hub(Config::default());
    let ((a, mut arx), (b, mut brx), _) = setup_pair(&hub).await;
    let b_id = b.id().await;

    hub.sub_invite(&a, b_id, None).await.expect("invite");
    let invite_id = match recv_matching(&mut brx, |m| matches!(m, ServerMessage::InviteReq(_))).await
    {
        ServerMessage::InviteReq(p) => p.invite_id,
        _ => unreachable!(),
    };

    // Nobody answers; the 30-second timer fires.
    tokio::time::sleep(Duration::from_secs(31)).await;

    for rx in [&mut arx, &mut brx] {
        let expired =
            recv_matching(rx, |m| matches!(m, ServerMessage::InviteExpired(_))).await;
        if let ServerMessage::InviteExpired(p) = expired {
            assert_eq!(p.reason, "timeout");
        }
    }

    let err = hub.sub_response(&b, invite_id, true).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::InviteExpired);
}

// =============================================================================
// CHAT
// =============================================================================

#[tokio::test]
async fn test_chat_broadcast_and_ring_cap() {
    let config = Config {
        chat_history_size: 10,
        ..Config::default()
    };
    let hub = test_hub(config);
    let ((a, mut arx), (_b, mut brx), full_name) = setup_pair(&hub).await;

    for i in 0..12 {
        hub.chat(&a, format!("cipher-{i}")).await.expect("chat");
    }

    // Both room members observe the messages as they happen.
    let last = recv_matching(&mut brx, |m| {
        matches!(m, ServerMessage::Chat(c) if c.ciphertext == "cipher-11")
    })
    .await;
    if let ServerMessage::Chat(c) = last {
        assert_eq!(c.user_name, "a");
        assert!(c.timestamp > 0);
    }
    recv_matching(&mut arx, |m| {
        matches!(m, ServerMessage::Chat(c) if c.ciphertext == "cipher-11")
    })
    .await;

    // The ring keeps only the newest ten, in order.
    let room = hub.room_by_name(&full_name).await.expect("room");
    let history = room.state.read().await.chat.snapshot();
    assert_eq!(history.len(), 10);
    assert_eq!(history.first().map(|c| c.id), Some(3));
    assert_eq!(history.last().map(|c| c.id), Some(12));
    assert!(history.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
}

#[tokio::test]
async fn test_chat_is_scoped_to_current_room() {
    let hub = test_hub(Config::default());
    let ((a, mut arx), (b, mut brx), full_name) = setup_pair(&hub).await;

    let (c, mut crx) = new_peer();
    hub.join_room(&c, join_password("c", &full_name, "secret1"))
        .await
        .expect("join");
    recv_welcome(&mut crx).await;

    // A and B retreat into a sub
    let b_id = b.id().await;
    hub.sub_invite(&a, b_id, None).await.expect("invite");
    let invite_id = match recv_matching(&mut brx, |m| matches!(m, ServerMessage::InviteReq(_))).await
    {
        ServerMessage::InviteReq(p) => p.invite_id,
        _ => unreachable!(),
    };
    hub.sub_response(&b, invite_id, true).await.expect("accept");

    hub.chat(&a, "sub-secret".into()).await.expect("chat");
    recv_matching(&mut brx, |m| {
        matches!(m, ServerMessage::Chat(c) if c.ciphertext == "sub-secret")
    })
    .await;
    recv_matching(&mut arx, |m| {
        matches!(m, ServerMessage::Chat(c) if c.ciphertext == "sub-secret")
    })
    .await;

    // C, still in the main room, must never see it.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_no_queued(&mut crx, |m| matches!(m, ServerMessage::Chat(_)));
}

// =============================================================================
// MUTE
// =============================================================================

#[tokio::test]
async fn test_mute_flag_propagates() {
    let hub = test_hub(Config::default());
    let ((a, _arx), (_b, mut brx), _) = setup_pair(&hub).await;

    hub.mute(&a, true).await.expect("mute");
    let update = recv_matching(&mut brx, |m| {
        matches!(m, ServerMessage::RoomUpdate(u) if u.users.iter().any(|u| u.muted))
    })
    .await;
    if let ServerMessage::RoomUpdate(u) = update {
        let a_entry = u.users.iter().find(|u| u.name == "a").expect("a listed");
        assert!(a_entry.muted);
    }
}

// =============================================================================
// GARBAGE COLLECTION
// =============================================================================

#[tokio::test]
async fn test_gc_collects_idle_rooms() {
    let hub = test_hub(Config::default());
    let (a, mut arx) = new_peer();
    hub.create_room(&a, "a".into(), "Lobby".into(), "secret1".into(), ip(1))
        .await
        .expect("create");
    let wa = recv_welcome(&mut arx).await;
    let full_name = wa.room_state.full_name.clone();

    hub.leave(&a).await;

    // Backdate the empty-room stamp past the 30-minute horizon.
    let room = hub.room_by_name(&full_name).await.expect("room still there");
    room.state.write().await.expired_at = now() - 31 * 60;

    hub.run_gc().await;
    assert!(hub.room_by_name(&full_name).await.is_none());

    // Its invite died with it.
    let (b, _brx) = new_peer();
    let err = hub
        .join_room(
            &b,
            JoinPayload {
                username: "b".into(),
                channel_name: None,
                password: None,
                invite_token: wa.invite_token.clone(),
                session_token: None,
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::InviteExpired);
}

#[tokio::test]
async fn test_gc_collects_room_abandoned_via_sub() {
    let hub = test_hub(Config::default());
    let ((a, _arx), (b, mut brx), full_name) = setup_pair(&hub).await;

    let b_id = b.id().await;
    hub.sub_invite(&a, b_id, None).await.expect("invite");
    let invite_id = match recv_matching(&mut brx, |m| matches!(m, ServerMessage::InviteReq(_))).await
    {
        ServerMessage::InviteReq(p) => p.invite_id,
        _ => unreachable!(),
    };
    hub.sub_response(&b, invite_id, true).await.expect("accept");

    // The main room emptied when both moved into the sub.
    let main = hub.room_by_name(&full_name).await.expect("room");
    assert!(main.state.read().await.expired_at > 0);

    // Both occupants hang up; the sub dies with them and the idle clock runs
    // from the moment the room became fully empty.
    hub.remove_peer(&a).await;
    hub.remove_peer(&b).await;
    assert!(main.state.read().await.sub_rooms.is_empty());
    assert!(main.state.read().await.expired_at > 0);

    main.state.write().await.expired_at = now() - 31 * 60;
    hub.run_gc().await;
    assert!(hub.room_by_name(&full_name).await.is_none());
}

#[tokio::test]
async fn test_gc_force_moves_lone_sub_occupant() {
    let hub = test_hub(Config::default());
    let ((a, mut arx), (b, mut brx), full_name) = setup_pair(&hub).await;

    let b_id = b.id().await;
    hub.sub_invite(&a, b_id, None).await.expect("invite");
    let invite_id = match recv_matching(&mut brx, |m| matches!(m, ServerMessage::InviteReq(_))).await
    {
        ServerMessage::InviteReq(p) => p.invite_id,
        _ => unreachable!(),
    };
    hub.sub_response(&b, invite_id, true).await.expect("accept");
    hub.move_to_main(&a).await.expect("move");
    recv_matching(&mut arx, |m| matches!(m, ServerMessage::ChatHistory(_))).await;

    // B has been alone in the sub for longer than the grace period.
    let main = hub.room_by_name(&full_name).await.expect("room");
    let sub = main
        .state
        .read()
        .await
        .sub_rooms
        .values()
        .next()
        .cloned()
        .expect("sub");
    sub.state.write().await.countdown_expires_at = chrono::Utc::now().timestamp_millis() - 1000;

    hub.run_gc().await;

    assert!(main.state.read().await.sub_rooms.is_empty());
    assert_eq!(b.state.lock().await.room_id.as_deref(), Some(main.id.as_str()));
    assert_eq!(main.state.read().await.members.len(), 2);
}
