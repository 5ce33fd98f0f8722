//! Reconnecting chat client used by the dashboard side (and the integration
//! tests). One `ChatClient` owns one channel; on transport loss it redials
//! with bounded exponential backoff and replays its identity and joined
//! rooms, since the server keeps no state across a dropped channel.

use std::time::Duration;

use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use time::OffsetDateTime;
use tokio::{net::TcpStream, sync::watch};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{self, Message},
};

use crate::rooms::msg::{ChatMessage, ClientEvent, Identity, ServerEvent};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Connecting,
    Connected,
    Disconnected,
    Error,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            initial_delay: Duration::from_secs(1),
        }
    }
}

pub struct ChatClient {
    url: String,
    retry: RetryPolicy,
    stream: Option<WsStream>,
    identity: Option<Identity>,
    joined: Vec<String>,
    state_tx: watch::Sender<ConnState>,
}

impl ChatClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_retry(url, RetryPolicy::default())
    }

    pub fn with_retry(url: impl Into<String>, retry: RetryPolicy) -> Self {
        Self {
            url: url.into(),
            retry,
            stream: None,
            identity: None,
            joined: vec![],
            state_tx: watch::channel(ConnState::Disconnected).0,
        }
    }

    /// Connection-state transitions, for the UI layer to subscribe to.
    pub fn state(&self) -> watch::Receiver<ConnState> {
        self.state_tx.subscribe()
    }

    /// Dial the server, retrying with exponential backoff. `ConnState::Error`
    /// is only reached after every attempt is exhausted.
    pub async fn connect(&mut self) -> anyhow::Result<()> {
        let _ = self.state_tx.send(ConnState::Connecting);

        let mut delay = self.retry.initial_delay;
        let mut last_err: Option<tungstenite::Error> = None;
        for attempt in 1..=self.retry.attempts {
            match connect_async(self.url.as_str()).await {
                Ok((stream, _)) => {
                    self.stream = Some(stream);
                    let _ = self.state_tx.send(ConnState::Connected);
                    tracing::debug!(url = %self.url, "connected");
                    return Ok(());
                }
                Err(err) => {
                    tracing::debug!(attempt, %err, "connect attempt failed");
                    last_err = Some(err);
                    if attempt < self.retry.attempts {
                        tokio::time::sleep(delay).await;
                        delay = delay.saturating_mul(2);
                    }
                }
            }
        }

        let _ = self.state_tx.send(ConnState::Error);
        match last_err {
            Some(err) => {
                Err(anyhow::Error::from(err).context(format!("connecting to {}", self.url)))
            }
            None => anyhow::bail!("connecting to {}: no attempts configured", self.url),
        }
    }

    /// Must precede any room operation; the server drops room events from
    /// unauthenticated channels.
    pub async fn authenticate(&mut self, identity: Identity) -> anyhow::Result<()> {
        self.identity = Some(identity.clone());
        self.emit(ClientEvent::Authenticate(identity)).await
    }

    /// The server replies with a `room_history` event.
    pub async fn join_room(&mut self, room_id: impl Into<String>) -> anyhow::Result<()> {
        let room_id = room_id.into();
        // recorded only after the emit, so a reconnect inside `emit` replays
        // earlier rooms but not this one (which `emit` is about to send)
        self.emit(ClientEvent::JoinRoom(room_id.clone())).await?;
        if !self.joined.contains(&room_id) {
            self.joined.push(room_id);
        }
        Ok(())
    }

    pub async fn leave_room(&mut self, room_id: &str) -> anyhow::Result<()> {
        self.joined.retain(|joined| joined != room_id);
        self.emit(ClientEvent::LeaveRoom(room_id.to_owned())).await
    }

    /// Fire-and-forget; the optimistic `sender_id`/`created_at` stamps are
    /// replaced by the server.
    pub async fn send_message(
        &mut self,
        room_id: impl Into<String>,
        content: impl Into<String>,
    ) -> anyhow::Result<()> {
        let sender_id = self
            .identity
            .as_ref()
            .map(|identity| identity.id.clone())
            .context("send_message before authenticate")?;

        self.emit(ClientEvent::SendMessage(ChatMessage {
            room_id: room_id.into(),
            sender_id,
            content: content.into(),
            created_at: OffsetDateTime::now_utc(),
        }))
        .await
    }

    /// Next server event; transparently redials and replays on transport
    /// loss. Fails only once reconnection attempts are exhausted.
    pub async fn recv(&mut self) -> anyhow::Result<ServerEvent> {
        loop {
            let Some(stream) = self.stream.as_mut() else {
                self.reconnect().await?;
                continue;
            };

            match stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    return serde_json::from_str(text.as_str())
                        .with_context(|| format!("bad server event: {text}"));
                }
                // ping/pong/binary frames carry nothing for us
                Some(Ok(Message::Close(_))) | None => {
                    self.stream = None;
                    self.reconnect().await?;
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    tracing::debug!(%err, "transport dropped on recv");
                    self.stream = None;
                    self.reconnect().await?;
                }
            }
        }
    }

    pub async fn disconnect(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.send(Message::Close(None)).await;
        }
        let _ = self.state_tx.send(ConnState::Disconnected);
    }

    async fn emit(&mut self, event: ClientEvent) -> anyhow::Result<()> {
        if self.stream.is_none() {
            self.reconnect().await?;
        }
        if let Err(err) = self.send_frame(&event).await {
            tracing::debug!(%err, "transport dropped on send");
            self.stream = None;
            self.reconnect().await?;
            self.send_frame(&event).await?;
        }
        Ok(())
    }

    async fn send_frame(&mut self, event: &ClientEvent) -> anyhow::Result<()> {
        let stream = self.stream.as_mut().context("not connected")?;
        let payload = serde_json::to_string(event)?;
        stream.send(Message::text(payload)).await?;
        Ok(())
    }

    async fn reconnect(&mut self) -> anyhow::Result<()> {
        let _ = self.state_tx.send(ConnState::Disconnected);
        self.connect().await?;

        // the server lost this channel's bindings with the transport
        if let Some(identity) = self.identity.clone() {
            self.send_frame(&ClientEvent::Authenticate(identity))
                .await?;
        }
        for room_id in self.joined.clone() {
            self.send_frame(&ClientEvent::JoinRoom(room_id)).await?;
        }
        Ok(())
    }
}
