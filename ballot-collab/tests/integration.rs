//! Integration tests for end-to-end planning-poker rooms.
//!
//! These tests start a real server and connect real clients,
//! verifying handshake, room lifecycle, vote secrecy and the
//! disconnect grace window over the network.

use std::sync::Arc;

use ballot_collab::client::{ClientError, RoomClient};
use ballot_collab::protocol::{ProtocolError, ServerEvent, ServerFrame};
use ballot_collab::room::{RoomSnapshot, VoteValue};
use ballot_collab::server::{RoomServer, ServerConfig};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Duration};
use tokio_tungstenite::tungstenite::{self, Message};

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a server on a free port with the given grace window.
async fn start_test_server(grace: Duration) -> (String, Arc<RoomServer>) {
    let port = free_port().await;
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        grace_period: grace,
        outbox_capacity: 64,
        ..ServerConfig::default()
    };
    let server = Arc::new(RoomServer::new(config));
    let running = server.clone();
    tokio::spawn(async move {
        running.run().await.unwrap();
    });
    // Give server time to bind
    sleep(Duration::from_millis(50)).await;
    (format!("ws://127.0.0.1:{port}"), server)
}

async fn connect(url: &str, who: &str) -> (RoomClient, mpsc::Receiver<ServerEvent>) {
    RoomClient::connect(url, who).await.expect("client should connect")
}

/// Skip events until one matches.
async fn expect_event(
    rx: &mut mpsc::Receiver<ServerEvent>,
    matches: impl Fn(&ServerEvent) -> bool,
) -> ServerEvent {
    loop {
        let event = timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event stream closed");
        if matches(&event) {
            return event;
        }
    }
}

async fn next_event(rx: &mut mpsc::Receiver<ServerEvent>) -> ServerEvent {
    expect_event(rx, |_| true).await
}

fn scale() -> Vec<VoteValue> {
    [1u64, 2, 3, 5, 8].into_iter().map(VoteValue::from).collect()
}

fn is_room_update(event: &ServerEvent) -> bool {
    matches!(event, ServerEvent::RoomUpdated(_))
}

fn updated_room(event: ServerEvent) -> RoomSnapshot {
    match event {
        ServerEvent::RoomUpdated(room) => room,
        other => panic!("Expected room:updated, got {other:?}"),
    }
}

#[tokio::test]
async fn test_connect_receives_initial_state() {
    let (url, _server) = start_test_server(Duration::from_secs(5)).await;
    let (_a, mut events) = connect(&url, "alice").await;

    assert_eq!(
        next_event(&mut events).await,
        ServerEvent::UsersUpdate(vec!["alice".into()])
    );
    assert_eq!(next_event(&mut events).await, ServerEvent::RoomsUpdate(vec![]));
}

#[tokio::test]
async fn test_handshake_requires_username() {
    let (url, server) = start_test_server(Duration::from_secs(5)).await;

    match tokio_tungstenite::connect_async(format!("{url}/")).await {
        Err(tungstenite::Error::Http(resp)) => {
            assert_eq!(resp.status(), tungstenite::http::StatusCode::UNAUTHORIZED);
        }
        Err(other) => panic!("Expected HTTP rejection, got {other}"),
        Ok(_) => panic!("Handshake without username must be rejected"),
    }

    let blank = RoomClient::connect(&url, "   ").await;
    assert!(matches!(
        blank,
        Err(ClientError::Protocol(ProtocolError::HandshakeRejected(_)))
    ));

    sleep(Duration::from_millis(50)).await;
    let stats = server.stats().await;
    assert_eq!(stats.rejected_handshakes, 2);
    assert_eq!(stats.total_connections, 0);
}

#[tokio::test]
async fn test_create_room_visible_to_everyone() {
    let (url, _server) = start_test_server(Duration::from_secs(5)).await;
    let (a, _a_events) = connect(&url, "A").await;
    let (_b, mut b_events) = connect(&url, "B").await;

    let room = a.create_room("Sprint1", scale()).await.unwrap();
    assert_eq!(room.name, "Sprint1");
    assert_eq!(room.owner, "A");
    assert_eq!(room.participants, vec!["A"]);
    assert!(room.votes.is_empty());
    assert!(!room.revealed);

    let listed = expect_event(&mut b_events, |e| {
        matches!(e, ServerEvent::RoomsUpdate(rooms) if !rooms.is_empty())
    })
    .await;
    assert_eq!(listed, ServerEvent::RoomsUpdate(vec![room]));
}

#[tokio::test]
async fn test_join_notifies_members() {
    let (url, _server) = start_test_server(Duration::from_secs(5)).await;
    let (a, mut a_events) = connect(&url, "A").await;
    let (b, _b_events) = connect(&url, "B").await;
    let room = a.create_room("Sprint1", scale()).await.unwrap();

    let joined = b.join_room(&room.id).await.unwrap();
    assert_eq!(joined.participants, vec!["A", "B"]);

    let seen = updated_room(expect_event(&mut a_events, is_room_update).await);
    assert_eq!(seen, joined);
}

#[tokio::test]
async fn test_votes_hidden_until_reveal() {
    let (url, _server) = start_test_server(Duration::from_secs(5)).await;
    let (a, _a_events) = connect(&url, "A").await;
    let (b, mut b_events) = connect(&url, "B").await;
    let room = a.create_room("Sprint1", scale()).await.unwrap();
    b.join_room(&room.id).await.unwrap();

    a.submit_vote(&room.id, "3").await.unwrap();
    b.submit_vote(&room.id, "5").await.unwrap();
    a.reveal_votes(&room.id).await.unwrap();

    // Everything B sees before the reveal carries no vote values.
    let mut cast = Vec::new();
    let revealed = loop {
        match next_event(&mut b_events).await {
            ServerEvent::Votes(update) => break update,
            ServerEvent::VoteCast(vote) => {
                assert!(vote.has_voted);
                cast.push(vote.username);
            }
            ServerEvent::RoomsUpdate(rooms) => {
                for snapshot in rooms {
                    assert!(snapshot.votes.iter().all(|(_, value)| value.is_none()));
                }
            }
            ServerEvent::RoomUpdated(snapshot) => {
                assert!(snapshot.votes.iter().all(|(_, value)| value.is_none()));
            }
            ServerEvent::UsersUpdate(_) => {}
        }
    };

    assert_eq!(cast, vec!["A", "B"]);
    assert!(revealed.revealed);
    assert_eq!(
        revealed.votes,
        vec![
            ("A".to_string(), VoteValue::from("3")),
            ("B".to_string(), VoteValue::from("5")),
        ]
    );
}

#[tokio::test]
async fn test_non_owner_reset_rejected() {
    let (url, _server) = start_test_server(Duration::from_secs(5)).await;
    let (a, mut a_events) = connect(&url, "A").await;
    let (b, _b_events) = connect(&url, "B").await;
    let room = a.create_room("Sprint1", scale()).await.unwrap();
    b.join_room(&room.id).await.unwrap();
    b.submit_vote(&room.id, 5u64).await.unwrap();
    expect_event(&mut a_events, |e| matches!(e, ServerEvent::VoteCast(_))).await;

    match b.reset_votes(&room.id).await {
        Err(ClientError::Rejected(message)) => {
            assert_eq!(message, "Only room owner can reset votes")
        }
        other => panic!("Expected rejection, got {other:?}"),
    }
    match b.reveal_votes(&room.id).await {
        Err(ClientError::Rejected(message)) => {
            assert_eq!(message, "Only room owner can reveal votes")
        }
        other => panic!("Expected rejection, got {other:?}"),
    }

    // The next thing A hears is its own vote, not a reset.
    a.submit_vote(&room.id, 8u64).await.unwrap();
    match next_event(&mut a_events).await {
        ServerEvent::VoteCast(vote) => assert_eq!(vote.username, "A"),
        other => panic!("Expected room:vote, got {other:?}"),
    }

    a.reveal_votes(&room.id).await.unwrap();
    match next_event(&mut a_events).await {
        ServerEvent::Votes(update) => assert_eq!(update.votes.len(), 2),
        other => panic!("Expected room:votes, got {other:?}"),
    }
}

#[tokio::test]
async fn test_owner_reset_clears_ballot() {
    let (url, _server) = start_test_server(Duration::from_secs(5)).await;
    let (a, mut a_events) = connect(&url, "A").await;
    let room = a.create_room("Sprint1", scale()).await.unwrap();
    a.submit_vote(&room.id, 3u64).await.unwrap();
    a.reveal_votes(&room.id).await.unwrap();
    a.reset_votes(&room.id).await.unwrap();

    expect_event(&mut a_events, |e| matches!(e, ServerEvent::Votes(u) if u.revealed)).await;
    match next_event(&mut a_events).await {
        ServerEvent::Votes(update) => {
            assert!(update.votes.is_empty());
            assert!(!update.revealed);
        }
        other => panic!("Expected room:votes, got {other:?}"),
    }
}

#[tokio::test]
async fn test_unknown_room_and_non_member_vote() {
    let (url, _server) = start_test_server(Duration::from_secs(5)).await;
    let (a, _a_events) = connect(&url, "A").await;
    let (c, _c_events) = connect(&url, "C").await;

    match c.join_room("missing00").await {
        Err(ClientError::Rejected(message)) => assert_eq!(message, "Room not found"),
        other => panic!("Expected rejection, got {other:?}"),
    }

    let room = a.create_room("Sprint1", scale()).await.unwrap();
    assert!(matches!(
        c.submit_vote(&room.id, 1u64).await,
        Err(ClientError::Rejected(_))
    ));
}

#[tokio::test]
async fn test_last_leave_deletes_room() {
    let (url, server) = start_test_server(Duration::from_secs(5)).await;
    let (a, mut a_events) = connect(&url, "A").await;
    let room = a.create_room("Sprint1", scale()).await.unwrap();
    a.leave_room(&room.id).await.unwrap();

    expect_event(&mut a_events, |e| matches!(e, ServerEvent::RoomsUpdate(r) if !r.is_empty())).await;
    assert_eq!(next_event(&mut a_events).await, ServerEvent::RoomsUpdate(vec![]));
    assert_eq!(server.stats().await.active_rooms, 0);
}

#[tokio::test]
async fn test_reconnect_within_grace_keeps_place() {
    let (url, server) = start_test_server(Duration::from_millis(400)).await;
    let (a, mut a_events) = connect(&url, "A").await;
    let (b, b_events) = connect(&url, "B").await;
    let room = a.create_room("Sprint1", scale()).await.unwrap();
    b.join_room(&room.id).await.unwrap();
    b.submit_vote(&room.id, 5u64).await.unwrap();

    drop(b);
    drop(b_events);
    sleep(Duration::from_millis(100)).await;
    let (_b2, mut b2_events) = connect(&url, "B").await;

    // Well past the original deadline.
    sleep(Duration::from_millis(600)).await;
    let snapshot = server.coordinator().room(&room.id).await.unwrap();
    assert_eq!(snapshot.participants, vec!["A", "B"]);
    assert!(snapshot.has_voted("B"));
    assert_eq!(server.coordinator().presence().await, vec!["A", "B"]);

    // A never saw B evicted.
    while let Ok(event) = a_events.try_recv() {
        if let ServerEvent::RoomUpdated(room) = event {
            assert!(room.participants.contains(&"B".to_string()));
        }
    }

    // The new socket receives room broadcasts without re-joining.
    a.submit_vote(&room.id, 3u64).await.unwrap();
    let event = expect_event(&mut b2_events, |e| matches!(e, ServerEvent::VoteCast(_))).await;
    assert_eq!(
        event,
        ServerEvent::VoteCast(ballot_collab::room::VoteCast {
            username: "A".into(),
            has_voted: true,
        })
    );
}

#[tokio::test]
async fn test_grace_expiry_evicts() {
    let (url, server) = start_test_server(Duration::from_millis(150)).await;
    let (a, mut a_events) = connect(&url, "A").await;
    let (b, b_events) = connect(&url, "B").await;
    let room = a.create_room("Sprint1", scale()).await.unwrap();
    b.join_room(&room.id).await.unwrap();
    b.submit_vote(&room.id, 5u64).await.unwrap();
    expect_event(&mut a_events, |e| matches!(e, ServerEvent::VoteCast(_))).await;

    drop(b);
    drop(b_events);

    let evicted = updated_room(expect_event(&mut a_events, is_room_update).await);
    assert_eq!(evicted.participants, vec!["A"]);
    assert!(!evicted.has_voted("B"));
    assert_eq!(
        expect_event(&mut a_events, |e| matches!(e, ServerEvent::UsersUpdate(_))).await,
        ServerEvent::UsersUpdate(vec!["A".into()])
    );
    assert!(!server.coordinator().is_connected("B").await);
}

#[tokio::test]
async fn test_malformed_frames_get_error_acks() {
    let (url, _server) = start_test_server(Duration::from_secs(5)).await;
    let (ws, _) = tokio_tungstenite::connect_async(format!("{url}/?username=raw"))
        .await
        .unwrap();
    let (mut tx, mut rx) = ws.split();

    tx.send(Message::text(r#"{"event":"room:fly","ack":9,"data":{}}"#.to_string()))
        .await
        .unwrap();
    tx.send(Message::text(r#"{"event":"room:join","ack":10,"data":{"roomId":7}}"#.to_string()))
        .await
        .unwrap();

    let mut acks = Vec::new();
    while acks.len() < 2 {
        let msg = timeout(Duration::from_secs(2), rx.next())
            .await
            .expect("timed out waiting for ack")
            .expect("socket closed")
            .unwrap();
        if let Message::Text(text) = msg {
            if let ServerFrame::Ack(ack) = ServerFrame::decode(text.as_str()).unwrap() {
                acks.push(ack);
            }
        }
    }

    assert_eq!(acks[0].ack, 9);
    assert!(acks[0].data.error.is_some());
    assert_eq!(acks[1].ack, 10);
    assert!(acks[1].data.error.is_some());
}

#[tokio::test]
async fn test_server_stats_track_connections() {
    let (url, server) = start_test_server(Duration::from_secs(5)).await;
    let (a, _a_events) = connect(&url, "A").await;
    let (_b, mut b_events) = connect(&url, "B").await;
    next_event(&mut b_events).await;
    a.create_room("Sprint1", scale()).await.unwrap();

    let stats = server.stats().await;
    assert_eq!(stats.total_connections, 2);
    assert_eq!(stats.active_connections, 2);
    assert_eq!(stats.total_messages, 1);
    assert_eq!(stats.active_rooms, 1);

    let broadcast = server.coordinator().gateway().stats().await;
    assert_eq!(broadcast.active_connections, 2);
    assert_eq!(broadcast.messages_dropped, 0);
}
