//! End-to-end relay tests: a real server on an ephemeral port, talked to
//! through the reconnecting client.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::Router;
use sqlx::sqlite::SqlitePoolOptions;
use staffroom::{
    AppState,
    client::{ChatClient, ConnState, RetryPolicy},
    db, rooms,
    rooms::{
        msg::{ChatMessage, Identity, ServerEvent},
        registry::RoomRegistry,
    },
};
use tokio::{
    io::copy_bidirectional,
    net::{TcpListener, TcpStream},
    sync::Notify,
    time::timeout,
};

async fn spawn_server(history_cap: usize) -> anyhow::Result<SocketAddr> {
    let db_pool = SqlitePoolOptions::new().connect("sqlite::memory:").await?;
    db::setup(&db_pool).await?;

    let app_state = AppState {
        db_pool,
        registry: Arc::new(RoomRegistry::new(history_cap)),
    };
    let app = Router::new()
        .nest("/api/chat", rooms::router())
        .with_state(app_state);

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    Ok(addr)
}

fn ws_url(addr: SocketAddr) -> String {
    format!("ws://{addr}/api/chat/ws")
}

/// Forwards raw TCP to `upstream`. The first proxied connection can be
/// severed on demand to simulate transport loss; later connections are left
/// alone.
async fn spawn_flaky_proxy(upstream: SocketAddr) -> anyhow::Result<(SocketAddr, Arc<Notify>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let sever = Arc::new(Notify::new());

    let signal = sever.clone();
    tokio::spawn(async move {
        let mut first = true;
        loop {
            let Ok((mut inbound, _)) = listener.accept().await else {
                break;
            };
            let Ok(mut outbound) = TcpStream::connect(upstream).await else {
                break;
            };
            let cut = first.then(|| signal.clone());
            first = false;
            tokio::spawn(async move {
                match cut {
                    Some(signal) => {
                        tokio::select! {
                            _ = copy_bidirectional(&mut inbound, &mut outbound) => {}
                            // dropping both halves closes the pipe
                            _ = signal.notified() => {}
                        }
                    }
                    None => {
                        let _ = copy_bidirectional(&mut inbound, &mut outbound).await;
                    }
                }
            });
        }
    });

    Ok((addr, sever))
}

fn ident(id: &str) -> Identity {
    Identity {
        id: id.to_owned(),
        email: format!("{id}@example.com"),
        level: 1,
    }
}

async fn member(url: &str, id: &str) -> anyhow::Result<ChatClient> {
    let mut client = ChatClient::new(url);
    client.connect().await?;
    client.authenticate(ident(id)).await?;
    Ok(client)
}

async fn recv(client: &mut ChatClient) -> ServerEvent {
    timeout(Duration::from_secs(5), client.recv())
        .await
        .expect("timed out waiting for a server event")
        .expect("recv failed")
}

async fn assert_silent(client: &mut ChatClient) {
    assert!(
        timeout(Duration::from_millis(250), client.recv())
            .await
            .is_err(),
        "expected no server event"
    );
}

fn history_contents(event: ServerEvent) -> Vec<String> {
    match event {
        ServerEvent::RoomHistory(history) => {
            history.into_iter().map(|message| message.content).collect()
        }
        other => panic!("expected room_history, got {other:?}"),
    }
}

fn new_message(event: ServerEvent) -> ChatMessage {
    match event {
        ServerEvent::NewMessage(message) => message,
        other => panic!("expected new_message, got {other:?}"),
    }
}

fn message_content(event: ServerEvent) -> String {
    new_message(event).content
}

#[tokio::test]
async fn staff_room_scenario() -> anyhow::Result<()> {
    let url = ws_url(spawn_server(50).await?);

    // a witness makes the server-side ordering observable
    let mut witness = member(&url, "witness").await?;
    witness.join_room("staff-room").await?;
    assert!(history_contents(recv(&mut witness).await).is_empty());

    let mut u1 = member(&url, "u1").await?;
    u1.join_room("staff-room").await?;
    assert!(history_contents(recv(&mut u1).await).is_empty());

    u1.send_message("staff-room", "hello").await?;
    assert_eq!(message_content(recv(&mut witness).await), "hello");

    let mut u2 = member(&url, "u2").await?;
    u2.join_room("staff-room").await?;
    assert_eq!(history_contents(recv(&mut u2).await), ["hello"]);

    u1.send_message("staff-room", "world").await?;
    assert_eq!(message_content(recv(&mut u2).await), "world");
    assert_eq!(message_content(recv(&mut witness).await), "world");

    // the sender never sees its own message echoed back
    assert_silent(&mut u1).await;

    Ok(())
}

#[tokio::test]
async fn history_cap_is_fifo() -> anyhow::Result<()> {
    let url = ws_url(spawn_server(2).await?);

    let mut witness = member(&url, "witness").await?;
    witness.join_room("staff-room").await?;
    recv(&mut witness).await;

    let mut u1 = member(&url, "u1").await?;
    u1.join_room("staff-room").await?;
    recv(&mut u1).await;

    for content in ["a", "b", "c"] {
        u1.send_message("staff-room", content).await?;
        assert_eq!(message_content(recv(&mut witness).await), content);
    }

    let mut u2 = member(&url, "u2").await?;
    u2.join_room("staff-room").await?;
    assert_eq!(history_contents(recv(&mut u2).await), ["b", "c"]);

    Ok(())
}

#[tokio::test]
async fn send_without_join_gets_error_event() -> anyhow::Result<()> {
    let url = ws_url(spawn_server(50).await?);

    let mut u1 = member(&url, "u1").await?;
    u1.send_message("staff-room", "hello?").await?;

    match recv(&mut u1).await {
        ServerEvent::Error { message } => assert!(message.contains("not a member")),
        other => panic!("expected error event, got {other:?}"),
    }

    Ok(())
}

#[tokio::test]
async fn join_before_authenticate_is_dropped_silently() -> anyhow::Result<()> {
    let url = ws_url(spawn_server(50).await?);

    let mut client = ChatClient::new(&url);
    client.connect().await?;
    client.join_room("staff-room").await?;
    assert_silent(&mut client).await;

    // the channel itself stays usable
    client.authenticate(ident("late")).await?;
    client.join_room("staff-room").await?;
    assert!(history_contents(recv(&mut client).await).is_empty());

    Ok(())
}

#[tokio::test]
async fn leaving_stops_delivery() -> anyhow::Result<()> {
    let url = ws_url(spawn_server(50).await?);

    let mut u1 = member(&url, "u1").await?;
    u1.join_room("staff-room").await?;
    recv(&mut u1).await;

    let mut u2 = member(&url, "u2").await?;
    u2.join_room("staff-room").await?;
    recv(&mut u2).await;

    u2.leave_room("staff-room").await?;
    u1.send_message("staff-room", "anyone?").await?;
    assert_silent(&mut u2).await;

    Ok(())
}

#[tokio::test]
async fn transport_drop_replays_identity_and_rooms() -> anyhow::Result<()> {
    let upstream = spawn_server(50).await?;
    let (proxy_addr, sever) = spawn_flaky_proxy(upstream).await?;

    let mut u1 = ChatClient::with_retry(
        ws_url(proxy_addr),
        RetryPolicy {
            attempts: 5,
            initial_delay: Duration::from_millis(20),
        },
    );
    let state = u1.state();
    u1.connect().await?;
    u1.authenticate(ident("u1")).await?;
    u1.join_room("staff-room").await?;
    assert!(history_contents(recv(&mut u1).await).is_empty());

    // the witness talks to the server directly, unaffected by the proxy
    let mut witness = member(&ws_url(upstream), "witness").await?;
    witness.join_room("staff-room").await?;
    recv(&mut witness).await;

    witness.send_message("staff-room", "before").await?;
    assert_eq!(message_content(recv(&mut u1).await), "before");

    sever.notify_one();

    // recv rides through the drop: redial, replay authenticate + join_room,
    // and the first event on the new channel is the replayed join's history
    assert_eq!(history_contents(recv(&mut u1).await), ["before"]);
    assert_eq!(*state.borrow(), ConnState::Connected);

    witness.send_message("staff-room", "after").await?;
    assert_eq!(message_content(recv(&mut u1).await), "after");

    // the replayed authenticate rebound the identity on the new channel
    u1.send_message("staff-room", "still here").await?;
    let relayed = new_message(recv(&mut witness).await);
    assert_eq!(relayed.sender_id, "u1");
    assert_eq!(relayed.content, "still here");

    Ok(())
}

#[tokio::test]
async fn rejoin_after_disconnect_sends_each_join_once() -> anyhow::Result<()> {
    let url = ws_url(spawn_server(50).await?);

    let mut witness = member(&url, "witness").await?;
    witness.join_room("staff-room").await?;
    recv(&mut witness).await;

    let mut u1 = member(&url, "u1").await?;
    u1.join_room("staff-room").await?;
    assert!(history_contents(recv(&mut u1).await).is_empty());

    // seeding through a fan-out makes the append observable
    witness.send_message("staff-room", "seed").await?;
    assert_eq!(message_content(recv(&mut u1).await), "seed");

    // joining with the stream gone forces the reconnect inside the emit:
    // the replay re-sends staff-room, the emit itself sends the new room,
    // and each join must go out exactly once
    u1.disconnect().await;
    u1.join_room("ledger").await?;

    assert_eq!(history_contents(recv(&mut u1).await), ["seed"]);
    assert!(history_contents(recv(&mut u1).await).is_empty());
    assert_silent(&mut u1).await;

    Ok(())
}

#[tokio::test]
async fn backoff_exhaustion_surfaces_error_state() -> anyhow::Result<()> {
    // grab a port, then close it again
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    drop(listener);

    let mut client = ChatClient::with_retry(
        ws_url(addr),
        RetryPolicy {
            attempts: 2,
            initial_delay: Duration::from_millis(10),
        },
    );
    let state = client.state();

    assert!(client.connect().await.is_err());
    assert_eq!(*state.borrow(), ConnState::Error);

    Ok(())
}
