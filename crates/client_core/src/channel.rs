use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::{stream::SplitSink, SinkExt, StreamExt};
use shared::{
    domain::{ConversationId, UserId},
    protocol::{ChannelFrame, MessagePayload},
};
use tokio::{
    sync::{broadcast, mpsc, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, http::HeaderValue, Message},
};
use tracing::{debug, info, warn};

use crate::{api::AuthToken, error::ChatError};

const EVENT_BUFFER: usize = 1024;

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Connected,
    Disconnected,
    NewMessage(MessagePayload),
    MessagesRead {
        conversation_id: ConversationId,
        reader_id: UserId,
    },
}

/// Push delivery of confirmed records. At-most-once, no replay: a missed
/// event is only recovered by the HTTP path.
#[async_trait]
pub trait RealtimeChannel: Send + Sync {
    async fn join(&self, conversation_id: &ConversationId) -> Result<()>;
    async fn leave(&self, conversation_id: &ConversationId) -> Result<()>;
    fn subscribe_events(&self) -> broadcast::Receiver<ChannelEvent>;
}

/// Owns the process-wide channel and counts how many open screens hold each
/// conversation room. The room is joined on the first lease and left when
/// the last lease is released.
pub struct ChannelHub {
    channel: Arc<dyn RealtimeChannel>,
    rooms: Mutex<HashMap<ConversationId, usize>>,
}

impl ChannelHub {
    pub fn new(channel: Arc<dyn RealtimeChannel>) -> Arc<Self> {
        Arc::new(Self {
            channel,
            rooms: Mutex::new(HashMap::new()),
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ChannelEvent> {
        self.channel.subscribe_events()
    }

    pub async fn acquire(self: &Arc<Self>, conversation_id: &ConversationId) -> Result<RoomLease> {
        let mut rooms = self.rooms.lock().await;
        let holders = rooms.get(conversation_id).copied().unwrap_or(0);
        if holders == 0 {
            self.channel
                .join(conversation_id)
                .await
                .with_context(|| format!("failed to join conversation room {conversation_id}"))?;
            info!(conversation_id = %conversation_id, "channel: joined conversation room");
        }
        rooms.insert(conversation_id.clone(), holders + 1);

        Ok(RoomLease {
            hub: Arc::clone(self),
            conversation_id: Some(conversation_id.clone()),
        })
    }

    pub async fn holders(&self, conversation_id: &ConversationId) -> usize {
        self.rooms
            .lock()
            .await
            .get(conversation_id)
            .copied()
            .unwrap_or(0)
    }

    async fn release_room(&self, conversation_id: &ConversationId) -> Result<()> {
        let mut rooms = self.rooms.lock().await;
        let Some(holders) = rooms.get_mut(conversation_id) else {
            return Ok(());
        };
        *holders -= 1;
        if *holders > 0 {
            return Ok(());
        }

        rooms.remove(conversation_id);
        self.channel
            .leave(conversation_id)
            .await
            .with_context(|| format!("failed to leave conversation room {conversation_id}"))?;
        info!(conversation_id = %conversation_id, "channel: left conversation room");
        Ok(())
    }
}

/// Membership of one conversation room, held for as long as the
/// conversation is on screen.
pub struct RoomLease {
    hub: Arc<ChannelHub>,
    conversation_id: Option<ConversationId>,
}

impl RoomLease {
    pub fn conversation_id(&self) -> Option<&ConversationId> {
        self.conversation_id.as_ref()
    }

    pub async fn release(mut self) -> Result<()> {
        match self.conversation_id.take() {
            Some(conversation_id) => self.hub.release_room(&conversation_id).await,
            None => Ok(()),
        }
    }
}

impl Drop for RoomLease {
    fn drop(&mut self) {
        let Some(conversation_id) = self.conversation_id.take() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(
                conversation_id = %conversation_id,
                "channel: room lease dropped outside runtime"
            );
            return;
        };
        let hub = Arc::clone(&self.hub);
        runtime.spawn(async move {
            if let Err(err) = hub.release_room(&conversation_id).await {
                warn!(conversation_id = %conversation_id, "channel: release failed: {err:#}");
            }
        });
    }
}

/// WebSocket implementation of [`RealtimeChannel`]. Reconnects forever with a
/// fixed delay and re-joins every room it was asked to join.
pub struct WsChannel {
    outbound: mpsc::UnboundedSender<ChannelFrame>,
    rooms: Arc<Mutex<HashSet<ConversationId>>>,
    events: broadcast::Sender<ChannelEvent>,
    task: JoinHandle<()>,
}

impl WsChannel {
    pub fn connect(url: &str, token: AuthToken, reconnect_delay: Duration) -> Result<Self> {
        let url = url::Url::parse(url).map_err(|err| ChatError::InvalidUrl {
            url: url.to_string(),
            reason: err.to_string(),
        })?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(ChatError::InvalidUrl {
                url: url.to_string(),
                reason: "realtime url must start with ws:// or wss://".into(),
            }
            .into());
        }

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let rooms = Arc::new(Mutex::new(HashSet::new()));
        let task = tokio::spawn(run_connection(
            url,
            token,
            reconnect_delay,
            Arc::clone(&rooms),
            outbound_rx,
            events.clone(),
        ));

        Ok(Self {
            outbound,
            rooms,
            events,
            task,
        })
    }

    fn send_frame(&self, frame: ChannelFrame) -> Result<()> {
        self.outbound
            .send(frame)
            .map_err(|_| anyhow::Error::from(ChatError::NotConnected))
    }
}

impl Drop for WsChannel {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[async_trait]
impl RealtimeChannel for WsChannel {
    async fn join(&self, conversation_id: &ConversationId) -> Result<()> {
        self.rooms.lock().await.insert(conversation_id.clone());
        self.send_frame(ChannelFrame::JoinConversation {
            conversation_id: conversation_id.clone(),
        })
    }

    async fn leave(&self, conversation_id: &ConversationId) -> Result<()> {
        self.rooms.lock().await.remove(conversation_id);
        self.send_frame(ChannelFrame::LeaveConversation {
            conversation_id: conversation_id.clone(),
        })
    }

    fn subscribe_events(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }
}

async fn run_connection(
    url: url::Url,
    token: AuthToken,
    reconnect_delay: Duration,
    rooms: Arc<Mutex<HashSet<ConversationId>>>,
    mut outbound: mpsc::UnboundedReceiver<ChannelFrame>,
    events: broadcast::Sender<ChannelEvent>,
) {
    loop {
        match open_socket(&url, &token).await {
            Ok(socket) => {
                let (mut writer, mut reader) = socket.split();

                // Connected is announced only once every room is re-joined.
                let joined: Vec<ConversationId> = rooms.lock().await.iter().cloned().collect();
                let mut healthy = true;
                for conversation_id in joined {
                    let frame = ChannelFrame::JoinConversation { conversation_id };
                    if let Err(err) = write_frame(&mut writer, &frame).await {
                        warn!("channel: failed to re-join room: {err:#}");
                        healthy = false;
                        break;
                    }
                }
                if healthy {
                    info!(url = %url, "channel: connected");
                    let _ = events.send(ChannelEvent::Connected);
                }

                while healthy {
                    tokio::select! {
                        frame = outbound.recv() => {
                            let Some(frame) = frame else {
                                // Every sender is gone: the channel was dropped.
                                let _ = writer.close().await;
                                return;
                            };
                            if let Err(err) = write_frame(&mut writer, &frame).await {
                                warn!("channel: send failed: {err:#}");
                                healthy = false;
                            }
                        }
                        incoming = reader.next() => match incoming {
                            Some(Ok(Message::Text(text))) => dispatch_frame(&text, &events),
                            Some(Ok(Message::Close(_))) | None => healthy = false,
                            Some(Ok(_)) => {}
                            Some(Err(err)) => {
                                warn!("channel: receive failed: {err}");
                                healthy = false;
                            }
                        },
                    }
                }

                warn!(url = %url, "channel: disconnected");
                let _ = events.send(ChannelEvent::Disconnected);
            }
            Err(err) => warn!(url = %url, "channel: connect failed: {err:#}"),
        }

        tokio::time::sleep(reconnect_delay).await;
    }
}

type Socket =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn open_socket(url: &url::Url, token: &AuthToken) -> Result<Socket> {
    let mut request = url.as_str().into_client_request()?;
    request.headers_mut().insert(
        "authorization",
        HeaderValue::from_str(&format!("Bearer {}", token.expose()))
            .context("auth token is not a valid header value")?,
    );
    let (socket, _) = connect_async(request)
        .await
        .with_context(|| format!("failed to connect websocket: {url}"))?;
    Ok(socket)
}

async fn write_frame(writer: &mut SplitSink<Socket, Message>, frame: &ChannelFrame) -> Result<()> {
    let text = serde_json::to_string(frame)?;
    writer.send(Message::Text(text)).await?;
    Ok(())
}

fn dispatch_frame(text: &str, events: &broadcast::Sender<ChannelEvent>) {
    let frame = match serde_json::from_str::<ChannelFrame>(text) {
        Ok(frame) => frame,
        Err(err) => {
            warn!("channel: ignoring malformed frame: {err}");
            return;
        }
    };

    let event = match frame {
        ChannelFrame::NewMessage(message) => ChannelEvent::NewMessage(message),
        ChannelFrame::MessagesRead {
            conversation_id,
            reader_id,
        } => ChannelEvent::MessagesRead {
            conversation_id,
            reader_id,
        },
        ChannelFrame::JoinConversation { .. } | ChannelFrame::LeaveConversation { .. } => {
            debug!("channel: ignoring client-bound membership frame");
            return;
        }
    };
    let _ = events.send(event);
}

#[cfg(test)]
#[path = "tests/channel_tests.rs"]
mod tests;
