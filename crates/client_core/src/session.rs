use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{Context, Result};
use chrono::TimeZone;
use shared::{
    domain::{ConversationId, ConversationSummary, LocalId, RecordId, UserId},
    protocol::MessagePayload,
};
use tokio::{
    sync::{broadcast, broadcast::error::RecvError, Mutex},
    task::{AbortHandle, JoinHandle},
};
use tracing::{debug, info, warn};

use crate::{
    api::{ImageUpload, MessageApi},
    channel::{ChannelEvent, ChannelHub, RoomLease},
    config::{ClientSettings, DEFAULT_FALLBACK_TIMEOUT_MS, DEFAULT_SEND_TIMEOUT_MS},
    error::{ChatError, SendFailure},
    message::{MessageRecord, OutgoingMessage},
    store::{MessageStore, Reconciled},
    timeline::{build_timeline, TimelineItem},
};

const EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy)]
pub struct SessionOptions {
    /// How long a pending record may outlive a successful send before it is
    /// dropped from the timeline.
    pub fallback_timeout: Duration,
    /// Upper bound on a single send request; past it the send fails and is
    /// rolled back like any other failure.
    pub send_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            fallback_timeout: Duration::from_millis(DEFAULT_FALLBACK_TIMEOUT_MS),
            send_timeout: Duration::from_millis(DEFAULT_SEND_TIMEOUT_MS),
        }
    }
}

impl From<&ClientSettings> for SessionOptions {
    fn from(settings: &ClientSettings) -> Self {
        Self {
            fallback_timeout: settings.fallback_timeout(),
            send_timeout: settings.send_timeout(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The message sequence changed; re-render from `snapshot()`.
    TimelineChanged,
    /// Transient notification. The draft has already been handed back to the
    /// caller of `send`.
    SendFailed {
        draft: OutgoingMessage,
        reason: String,
    },
    PendingExpired {
        local_id: LocalId,
    },
    Error(String),
}

struct SessionState {
    store: MessageStore,
    fallback_timers: HashMap<LocalId, AbortHandle>,
}

struct SessionShared {
    conversation_id: ConversationId,
    local_user: UserId,
    api: Arc<dyn MessageApi>,
    state: Mutex<SessionState>,
    events: broadcast::Sender<SessionEvent>,
    fallback_timeout: Duration,
    send_timeout: Duration,
    channel_lost: AtomicBool,
}

/// One open conversation screen: the message store, its room membership and
/// the task that feeds real-time events into it.
pub struct ConversationSession {
    shared: Arc<SessionShared>,
    listener: JoinHandle<()>,
    lease: Option<RoomLease>,
}

impl ConversationSession {
    pub async fn open(
        api: Arc<dyn MessageApi>,
        hub: &Arc<ChannelHub>,
        conversation_id: ConversationId,
        local_user: UserId,
        options: SessionOptions,
    ) -> Result<Self> {
        // Subscribe before loading history so nothing slips between the two.
        let channel_events = hub.subscribe_events();
        let lease = hub.acquire(&conversation_id).await?;

        let history = api
            .fetch_messages(&conversation_id)
            .await
            .with_context(|| format!("failed to load history for {conversation_id}"))?;
        let mut store = MessageStore::new(conversation_id.clone(), local_user.clone());
        store.replace_history(history);
        info!(
            conversation_id = %conversation_id,
            messages = store.len(),
            "session: opened conversation"
        );

        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let shared = Arc::new(SessionShared {
            conversation_id,
            local_user,
            api,
            state: Mutex::new(SessionState {
                store,
                fallback_timers: HashMap::new(),
            }),
            events,
            fallback_timeout: options.fallback_timeout,
            send_timeout: options.send_timeout,
            channel_lost: AtomicBool::new(false),
        });
        let listener = tokio::spawn(listen(Arc::clone(&shared), channel_events));
        shared.mark_read_in_background();

        Ok(Self {
            shared,
            listener,
            lease: Some(lease),
        })
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.shared.conversation_id
    }

    pub fn local_user(&self) -> &UserId {
        &self.shared.local_user
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    pub async fn conversation(&self) -> Result<ConversationSummary> {
        self.shared
            .api
            .fetch_conversation(&self.shared.conversation_id)
            .await
    }

    pub async fn snapshot(&self) -> Vec<MessageRecord> {
        self.shared.state.lock().await.store.snapshot()
    }

    pub async fn timeline<Tz: TimeZone>(&self, tz: &Tz) -> Vec<TimelineItem> {
        let records = self.snapshot().await;
        build_timeline(&records, tz)
    }

    /// Shows the message immediately as pending, then posts it. On failure
    /// the pending record is rolled back and the draft is returned so the
    /// composer can be restored. Sends are never retried automatically.
    pub async fn send(&self, outgoing: OutgoingMessage) -> Result<RecordId, SendFailure> {
        let shared = &self.shared;
        let local_id = {
            let mut state = shared.state.lock().await;
            state.store.append_pending(&outgoing, &shared.local_user)
        };
        let guard = PendingSend {
            shared: Some(Arc::clone(shared)),
            local_id: local_id.clone(),
        };
        shared.notify(SessionEvent::TimelineChanged);

        let request = outgoing.to_request();
        let sent = tokio::time::timeout(
            shared.send_timeout,
            shared.api.send_message(&shared.conversation_id, &request),
        )
        .await
        .unwrap_or_else(|_| Err(ChatError::SendTimeout(shared.send_timeout).into()));
        let confirmed = match sent {
            Ok(confirmed) => confirmed,
            Err(source) => {
                let removed = shared.state.lock().await.store.remove_pending(&local_id);
                if removed {
                    shared.notify(SessionEvent::TimelineChanged);
                }
                warn!(
                    conversation_id = %shared.conversation_id,
                    local_id = %local_id,
                    "session: send failed: {source:#}"
                );
                shared.notify(SessionEvent::SendFailed {
                    draft: outgoing.clone(),
                    reason: format!("{source:#}"),
                });
                guard.disarm();
                return Err(SendFailure {
                    draft: outgoing,
                    source,
                });
            }
        };

        let server_id = confirmed.id.clone();
        let mut state = shared.state.lock().await;
        let outcome = shared.reconcile_locked(&mut state, confirmed);
        if state.store.is_pending(&local_id) {
            debug!(local_id = %local_id, ?outcome, "session: arming fallback timer");
            shared.arm_fallback(&mut state, local_id);
        }
        guard.disarm();
        Ok(RecordId::Server(server_id))
    }

    pub async fn send_text(&self, text: &str) -> Result<RecordId> {
        let outgoing = OutgoingMessage::text(text)?;
        Ok(self.send(outgoing).await?)
    }

    pub async fn send_image(&self, upload: ImageUpload) -> Result<RecordId> {
        let media = self
            .shared
            .api
            .upload_image(upload)
            .await
            .context("failed to upload image")?;
        Ok(self.send(OutgoingMessage::image(media)).await?)
    }

    /// Pull-to-refresh.
    pub async fn refresh(&self) -> Result<()> {
        self.shared.refresh().await
    }

    pub async fn close(mut self) -> Result<()> {
        self.listener.abort();
        {
            let mut state = self.shared.state.lock().await;
            for (_, timer) in state.fallback_timers.drain() {
                timer.abort();
            }
        }
        if let Some(lease) = self.lease.take() {
            lease.release().await?;
        }
        info!(conversation_id = %self.shared.conversation_id, "session: closed conversation");
        Ok(())
    }
}

impl Drop for ConversationSession {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

impl SessionShared {
    fn notify(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    async fn reconcile(&self, payload: MessagePayload) -> Reconciled {
        let mut state = self.state.lock().await;
        self.reconcile_locked(&mut state, payload)
    }

    fn reconcile_locked(&self, state: &mut SessionState, payload: MessagePayload) -> Reconciled {
        let message_id = payload.id.clone();
        let outcome = state.store.reconcile_incoming(payload);
        if let Reconciled::Superseded { local_id } = &outcome {
            if let Some(timer) = state.fallback_timers.remove(local_id) {
                timer.abort();
            }
        }
        debug!(
            conversation_id = %self.conversation_id,
            message_id = %message_id,
            ?outcome,
            "session: reconciled incoming message"
        );
        if outcome.changed() {
            self.notify(SessionEvent::TimelineChanged);
        }
        outcome
    }

    fn arm_fallback(self: &Arc<Self>, state: &mut SessionState, local_id: LocalId) {
        let shared = Arc::clone(self);
        let expired = local_id.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(shared.fallback_timeout).await;
            shared.expire_pending(&expired).await;
        });
        if let Some(previous) = state
            .fallback_timers
            .insert(local_id, timer.abort_handle())
        {
            previous.abort();
        }
    }

    async fn expire_pending(&self, local_id: &LocalId) {
        let removed = {
            let mut state = self.state.lock().await;
            state.fallback_timers.remove(local_id);
            state.store.remove_pending(local_id)
        };
        if removed {
            warn!(
                conversation_id = %self.conversation_id,
                local_id = %local_id,
                "session: pending message never confirmed, dropping it"
            );
            self.notify(SessionEvent::PendingExpired {
                local_id: local_id.clone(),
            });
            self.notify(SessionEvent::TimelineChanged);
        }
    }

    async fn refresh(&self) -> Result<()> {
        let history = self
            .api
            .fetch_messages(&self.conversation_id)
            .await
            .with_context(|| format!("failed to refresh {}", self.conversation_id))?;
        {
            let mut state = self.state.lock().await;
            for local_id in state.store.replace_history(history) {
                if let Some(timer) = state.fallback_timers.remove(&local_id) {
                    timer.abort();
                }
            }
        }
        self.notify(SessionEvent::TimelineChanged);
        Ok(())
    }

    async fn catch_up(&self) {
        if let Err(err) = self.refresh().await {
            warn!(conversation_id = %self.conversation_id, "session: catch-up failed: {err:#}");
            self.notify(SessionEvent::Error(format!("{err:#}")));
        }
    }

    fn mark_read_in_background(self: &Arc<Self>) {
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = shared.api.mark_read(&shared.conversation_id).await {
                warn!(
                    conversation_id = %shared.conversation_id,
                    "session: mark-read failed: {err:#}"
                );
            }
        });
    }
}

/// Rolls the pending record back if `send` is dropped before it settles.
struct PendingSend {
    shared: Option<Arc<SessionShared>>,
    local_id: LocalId,
}

impl PendingSend {
    fn disarm(mut self) {
        self.shared = None;
    }
}

impl Drop for PendingSend {
    fn drop(&mut self) {
        let Some(shared) = self.shared.take() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let local_id = self.local_id.clone();
        runtime.spawn(async move {
            shared.expire_pending(&local_id).await;
        });
    }
}

async fn listen(shared: Arc<SessionShared>, mut events: broadcast::Receiver<ChannelEvent>) {
    loop {
        match events.recv().await {
            Ok(ChannelEvent::NewMessage(message)) => {
                if message.conversation_id != shared.conversation_id {
                    continue;
                }
                let from_other = message.sender_id != shared.local_user;
                let outcome = shared.reconcile(message).await;
                if from_other && outcome == Reconciled::Appended {
                    shared.mark_read_in_background();
                }
            }
            Ok(ChannelEvent::MessagesRead {
                conversation_id,
                reader_id,
            }) => {
                if conversation_id != shared.conversation_id {
                    continue;
                }
                let changed = shared
                    .state
                    .lock()
                    .await
                    .store
                    .apply_read_receipt(&reader_id);
                if changed {
                    shared.notify(SessionEvent::TimelineChanged);
                }
            }
            Ok(ChannelEvent::Disconnected) => {
                shared.channel_lost.store(true, Ordering::SeqCst);
            }
            Ok(ChannelEvent::Connected) => {
                if shared.channel_lost.swap(false, Ordering::SeqCst) {
                    info!(
                        conversation_id = %shared.conversation_id,
                        "session: channel back, catching up"
                    );
                    shared.catch_up().await;
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(
                    conversation_id = %shared.conversation_id,
                    skipped,
                    "session: channel events lagged, catching up"
                );
                shared.catch_up().await;
            }
            Err(RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
