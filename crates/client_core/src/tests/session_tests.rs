use super::*;
use std::sync::atomic::AtomicUsize;

use async_trait::async_trait;
use chrono::Utc;
use shared::{
    domain::{MessageId, MessageKind},
    protocol::SendMessageRequest,
};
use tokio::{sync::Notify, time::timeout};

use crate::{channel::RealtimeChannel, error::ChatError, message::UploadedMedia};

const CONVERSATION: &str = "conv-1";
const ME: &str = "client-1";
const ARTIST: &str = "artist-9";

fn payload(id: &str, sender: &str, content: &str) -> MessagePayload {
    MessagePayload {
        id: MessageId::from(id),
        conversation_id: ConversationId::from(CONVERSATION),
        sender_id: UserId::from(sender),
        kind: MessageKind::Text,
        content: Some(content.to_string()),
        media_url: None,
        metadata: None,
        created_at: "2024-03-01T10:00:00Z".parse().expect("timestamp"),
        is_read: false,
    }
}

#[derive(Default)]
struct FakeApi {
    history: Mutex<Vec<MessagePayload>>,
    offline: AtomicBool,
    gate: Mutex<Option<Arc<Notify>>>,
    rewrite_content: Mutex<Option<String>>,
    echo: Mutex<Option<broadcast::Sender<ChannelEvent>>>,
    sent: Mutex<Vec<SendMessageRequest>>,
    read_marks: AtomicUsize,
    issued: AtomicUsize,
}

#[async_trait]
impl MessageApi for FakeApi {
    async fn fetch_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<ConversationSummary> {
        Ok(ConversationSummary {
            id: conversation_id.clone(),
            title: None,
            participants: Vec::new(),
        })
    }

    async fn fetch_messages(
        &self,
        _conversation_id: &ConversationId,
    ) -> Result<Vec<MessagePayload>> {
        Ok(self.history.lock().await.clone())
    }

    async fn send_message(
        &self,
        conversation_id: &ConversationId,
        request: &SendMessageRequest,
    ) -> Result<MessagePayload> {
        self.sent.lock().await.push(request.clone());
        let gate = self.gate.lock().await.clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if self.offline.load(Ordering::SeqCst) {
            anyhow::bail!("network unreachable");
        }

        let id = 42 + self.issued.fetch_add(1, Ordering::SeqCst);
        let content = self
            .rewrite_content
            .lock()
            .await
            .clone()
            .or_else(|| request.content.clone());
        let confirmed = MessagePayload {
            id: MessageId::from(id.to_string().as_str()),
            conversation_id: conversation_id.clone(),
            sender_id: UserId::from(ME),
            kind: request.kind,
            content,
            media_url: request.media_url.clone(),
            metadata: request.metadata.clone(),
            created_at: Utc::now(),
            is_read: false,
        };

        let echo = self.echo.lock().await.clone();
        if let Some(echo) = echo {
            let _ = echo.send(ChannelEvent::NewMessage(confirmed.clone()));
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        Ok(confirmed)
    }

    async fn mark_read(&self, _conversation_id: &ConversationId) -> Result<()> {
        self.read_marks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn upload_image(&self, upload: ImageUpload) -> Result<UploadedMedia> {
        Ok(UploadedMedia::new(format!(
            "https://cdn.example/{}",
            upload.filename
        ))?)
    }
}

struct FakeChannel {
    events: broadcast::Sender<ChannelEvent>,
    calls: Mutex<Vec<String>>,
}

impl FakeChannel {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            events: broadcast::channel(64).0,
            calls: Mutex::new(Vec::new()),
        })
    }

    fn push(&self, event: ChannelEvent) {
        self.events.send(event).expect("session is listening");
    }
}

#[async_trait]
impl RealtimeChannel for FakeChannel {
    async fn join(&self, conversation_id: &ConversationId) -> Result<()> {
        self.calls.lock().await.push(format!("join:{conversation_id}"));
        Ok(())
    }

    async fn leave(&self, conversation_id: &ConversationId) -> Result<()> {
        self.calls.lock().await.push(format!("leave:{conversation_id}"));
        Ok(())
    }

    fn subscribe_events(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }
}

async fn open_with_options(
    api: &Arc<FakeApi>,
    hub: &Arc<ChannelHub>,
    options: SessionOptions,
) -> ConversationSession {
    ConversationSession::open(
        api.clone(),
        hub,
        ConversationId::from(CONVERSATION),
        UserId::from(ME),
        options,
    )
    .await
    .expect("open session")
}

async fn open_with(
    api: &Arc<FakeApi>,
    hub: &Arc<ChannelHub>,
    fallback_timeout: Duration,
) -> ConversationSession {
    let options = SessionOptions {
        fallback_timeout,
        ..SessionOptions::default()
    };
    open_with_options(api, hub, options).await
}

async fn open(api: &Arc<FakeApi>, channel: &Arc<FakeChannel>) -> ConversationSession {
    open_with(api, &ChannelHub::new(channel.clone()), Duration::from_secs(5)).await
}

async fn wait_for(
    events: &mut broadcast::Receiver<SessionEvent>,
    wanted: impl Fn(&SessionEvent) -> bool,
) -> SessionEvent {
    timeout(Duration::from_secs(2), async {
        loop {
            let event = events.recv().await.expect("session event");
            if wanted(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event arrived in time")
}

fn timeline_changed(event: &SessionEvent) -> bool {
    matches!(event, SessionEvent::TimelineChanged)
}

fn drain(events: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

fn ids(records: &[MessageRecord]) -> Vec<String> {
    records.iter().map(|record| record.id.to_string()).collect()
}

#[tokio::test]
async fn failed_send_rolls_back_and_returns_draft() {
    let api = Arc::new(FakeApi::default());
    api.offline.store(true, Ordering::SeqCst);
    let gate = Arc::new(Notify::new());
    *api.gate.lock().await = Some(gate.clone());
    let channel = FakeChannel::new();
    let session = Arc::new(open(&api, &channel).await);
    let mut events = session.subscribe_events();

    let sending = tokio::spawn({
        let session = session.clone();
        async move { session.send(OutgoingMessage::text("hello").expect("text")).await }
    });

    wait_for(&mut events, timeline_changed).await;
    let visible = session.snapshot().await;
    assert_eq!(visible.len(), 1);
    assert!(visible[0].is_pending);
    assert_eq!(visible[0].content.as_deref(), Some("hello"));

    gate.notify_one();
    let failure = sending.await.expect("send task").expect_err("offline send");
    assert_eq!(failure.draft.draft_text(), Some("hello"));
    assert!(session.snapshot().await.is_empty());

    match wait_for(&mut events, |event| {
        matches!(event, SessionEvent::SendFailed { .. })
    })
    .await
    {
        SessionEvent::SendFailed { draft, reason } => {
            assert_eq!(draft.draft_text(), Some("hello"));
            assert!(reason.contains("network unreachable"));
        }
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn http_confirmation_replaces_pending_in_place_and_echo_is_ignored() {
    let api = Arc::new(FakeApi::default());
    *api.history.lock().await = vec![payload("1", ARTIST, "earlier")];
    let channel = FakeChannel::new();
    let session = open(&api, &channel).await;

    let sent = session
        .send(OutgoingMessage::text("hi").expect("text"))
        .await
        .expect("send");
    assert_eq!(sent, RecordId::Server(MessageId::from("42")));

    let records = session.snapshot().await;
    assert_eq!(ids(&records), vec!["1", "42"]);
    assert!(!records[1].is_pending);

    let mut events = session.subscribe_events();
    let mut echo = payload("42", ME, "hi");
    echo.created_at = records[1].created_at;
    channel.push(ChannelEvent::NewMessage(echo));
    channel.push(ChannelEvent::NewMessage(payload("50", ARTIST, "thanks")));
    wait_for(&mut events, timeline_changed).await;

    assert_eq!(ids(&session.snapshot().await), vec!["1", "42", "50"]);
    session.close().await.expect("close");
}

#[tokio::test]
async fn echo_arriving_before_response_leaves_one_record() {
    let api = Arc::new(FakeApi::default());
    let channel = FakeChannel::new();
    *api.echo.lock().await = Some(channel.events.clone());
    let hub = ChannelHub::new(channel.clone());
    let session = open_with(&api, &hub, Duration::from_millis(50)).await;
    let mut events = session.subscribe_events();

    session
        .send(OutgoingMessage::text("hi").expect("text"))
        .await
        .expect("send");
    tokio::time::sleep(Duration::from_millis(150)).await;

    let records = session.snapshot().await;
    assert_eq!(ids(&records), vec!["42"]);
    assert!(!records[0].is_pending);
    assert!(!drain(&mut events)
        .iter()
        .any(|event| matches!(event, SessionEvent::PendingExpired { .. })));
}

#[tokio::test]
async fn unmatched_confirmation_expires_pending_after_fallback() {
    let api = Arc::new(FakeApi::default());
    *api.rewrite_content.lock().await = Some("hi (edited)".into());
    let channel = FakeChannel::new();
    let hub = ChannelHub::new(channel.clone());
    let session = open_with(&api, &hub, Duration::from_millis(200)).await;
    let mut events = session.subscribe_events();

    session
        .send(OutgoingMessage::text("hi").expect("text"))
        .await
        .expect("send");
    let records = session.snapshot().await;
    assert_eq!(records.len(), 2);
    assert!(records[0].is_pending);
    assert_eq!(records[1].id, RecordId::Server(MessageId::from("42")));

    let expired = wait_for(&mut events, |event| {
        matches!(event, SessionEvent::PendingExpired { .. })
    })
    .await;
    let SessionEvent::PendingExpired { local_id } = expired else {
        panic!("unexpected event: {expired:?}");
    };
    assert_eq!(records[0].id, RecordId::Local(local_id));
    assert_eq!(ids(&session.snapshot().await), vec!["42"]);
}

#[tokio::test]
async fn realtime_match_cancels_fallback_timer() {
    let api = Arc::new(FakeApi::default());
    *api.rewrite_content.lock().await = Some("hi (edited)".into());
    let channel = FakeChannel::new();
    let hub = ChannelHub::new(channel.clone());
    let session = open_with(&api, &hub, Duration::from_millis(150)).await;

    session
        .send(OutgoingMessage::text("hi").expect("text"))
        .await
        .expect("send");
    let mut events = session.subscribe_events();
    channel.push(ChannelEvent::NewMessage(payload("77", ME, "hi")));
    wait_for(&mut events, timeline_changed).await;

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!drain(&mut events)
        .iter()
        .any(|event| matches!(event, SessionEvent::PendingExpired { .. })));
    let records = session.snapshot().await;
    assert_eq!(ids(&records), vec!["77", "42"]);
    assert!(records.iter().all(|record| !record.is_pending));
}

#[tokio::test]
async fn read_receipt_marks_own_messages() {
    let api = Arc::new(FakeApi::default());
    *api.history.lock().await = vec![
        payload("1", ME, "are you free?"),
        payload("2", ARTIST, "yes"),
    ];
    let channel = FakeChannel::new();
    let session = open(&api, &channel).await;
    let mut events = session.subscribe_events();

    channel.push(ChannelEvent::MessagesRead {
        conversation_id: ConversationId::from("other"),
        reader_id: UserId::from(ARTIST),
    });
    channel.push(ChannelEvent::MessagesRead {
        conversation_id: ConversationId::from(CONVERSATION),
        reader_id: UserId::from(ARTIST),
    });
    wait_for(&mut events, timeline_changed).await;

    let records = session.snapshot().await;
    assert!(records[0].is_read);
    assert!(!records[1].is_read);
}

#[tokio::test]
async fn incoming_message_is_appended_and_marked_read() {
    let api = Arc::new(FakeApi::default());
    let channel = FakeChannel::new();
    let session = open(&api, &channel).await;
    let mut events = session.subscribe_events();

    let mut foreign = payload("8", ARTIST, "wrong room");
    foreign.conversation_id = ConversationId::from("other");
    channel.push(ChannelEvent::NewMessage(foreign));
    channel.push(ChannelEvent::NewMessage(payload("9", ARTIST, "sketch is ready")));
    wait_for(&mut events, timeline_changed).await;

    assert_eq!(ids(&session.snapshot().await), vec!["9"]);
    timeout(Duration::from_secs(2), async {
        while api.read_marks.load(Ordering::SeqCst) < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("opening and the incoming message both mark read");
}

#[tokio::test]
async fn reconnect_triggers_catch_up_refresh() {
    let api = Arc::new(FakeApi::default());
    let channel = FakeChannel::new();
    let session = open(&api, &channel).await;
    let mut events = session.subscribe_events();

    *api.history.lock().await = vec![payload("5", ARTIST, "sent while you were away")];
    channel.push(ChannelEvent::Connected);
    channel.push(ChannelEvent::Disconnected);
    channel.push(ChannelEvent::Connected);
    wait_for(&mut events, timeline_changed).await;

    assert_eq!(ids(&session.snapshot().await), vec!["5"]);
}

#[tokio::test]
async fn sessions_share_room_until_last_close() {
    let api = Arc::new(FakeApi::default());
    let channel = FakeChannel::new();
    let hub = ChannelHub::new(channel.clone());

    let first = open_with(&api, &hub, Duration::from_secs(1)).await;
    let second = open_with(&api, &hub, Duration::from_secs(1)).await;
    assert_eq!(*channel.calls.lock().await, vec![format!("join:{CONVERSATION}")]);

    first.close().await.expect("close first");
    assert_eq!(hub.holders(&ConversationId::from(CONVERSATION)).await, 1);

    second.close().await.expect("close second");
    assert_eq!(
        *channel.calls.lock().await,
        vec![format!("join:{CONVERSATION}"), format!("leave:{CONVERSATION}")]
    );
}

#[tokio::test]
async fn blank_text_is_rejected_before_sending() {
    let api = Arc::new(FakeApi::default());
    let channel = FakeChannel::new();
    let session = open(&api, &channel).await;

    let err = session.send_text("   ").await.expect_err("blank text");
    assert!(matches!(
        err.downcast_ref::<ChatError>(),
        Some(ChatError::EmptyMessage)
    ));
    assert!(api.sent.lock().await.is_empty());
    assert!(session.snapshot().await.is_empty());
}

#[tokio::test]
async fn image_is_uploaded_then_sent() {
    let api = Arc::new(FakeApi::default());
    let channel = FakeChannel::new();
    let session = open(&api, &channel).await;

    session
        .send_image(ImageUpload {
            filename: "ref.png".into(),
            mime_type: Some("image/png".into()),
            bytes: vec![0; 8],
        })
        .await
        .expect("send image");

    let sent = api.sent.lock().await.clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].kind, MessageKind::Image);
    assert_eq!(sent[0].media_url.as_deref(), Some("https://cdn.example/ref.png"));
    let records = session.snapshot().await;
    assert_eq!(records[0].media_url.as_deref(), Some("https://cdn.example/ref.png"));
}

#[tokio::test]
async fn refresh_landing_before_send_response_keeps_one_record() {
    let api = Arc::new(FakeApi::default());
    let gate = Arc::new(Notify::new());
    *api.gate.lock().await = Some(gate.clone());
    let channel = FakeChannel::new();
    let hub = ChannelHub::new(channel.clone());
    let session = Arc::new(open_with(&api, &hub, Duration::from_millis(50)).await);
    let mut events = session.subscribe_events();

    let sending = tokio::spawn({
        let session = session.clone();
        async move { session.send(OutgoingMessage::text("hi").expect("text")).await }
    });
    wait_for(&mut events, timeline_changed).await;

    // The server stored the message; its response is still on the way.
    *api.history.lock().await = vec![payload("42", ME, "hi")];
    session.refresh().await.expect("refresh");
    let records = session.snapshot().await;
    assert_eq!(ids(&records), vec!["42"]);
    assert!(!records[0].is_pending);

    gate.notify_one();
    let sent = sending.await.expect("send task").expect("send");
    assert_eq!(sent, RecordId::Server(MessageId::from("42")));

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(ids(&session.snapshot().await), vec!["42"]);
    assert!(!drain(&mut events)
        .iter()
        .any(|event| matches!(event, SessionEvent::PendingExpired { .. })));
}

#[tokio::test]
async fn stalled_send_times_out_and_rolls_back() {
    let api = Arc::new(FakeApi::default());
    *api.gate.lock().await = Some(Arc::new(Notify::new()));
    let channel = FakeChannel::new();
    let hub = ChannelHub::new(channel.clone());
    let options = SessionOptions {
        send_timeout: Duration::from_millis(100),
        ..SessionOptions::default()
    };
    let session = open_with_options(&api, &hub, options).await;

    let failure = session
        .send(OutgoingMessage::text("anyone there?").expect("text"))
        .await
        .expect_err("stalled send");

    assert!(matches!(
        failure.source.downcast_ref::<ChatError>(),
        Some(ChatError::SendTimeout(_))
    ));
    assert_eq!(failure.draft.draft_text(), Some("anyone there?"));
    assert!(session.snapshot().await.is_empty());
}

#[tokio::test]
async fn abandoned_send_removes_its_pending_record() {
    let api = Arc::new(FakeApi::default());
    *api.gate.lock().await = Some(Arc::new(Notify::new()));
    let channel = FakeChannel::new();
    let session = Arc::new(open(&api, &channel).await);
    let mut events = session.subscribe_events();

    let sending = tokio::spawn({
        let session = session.clone();
        async move { session.send(OutgoingMessage::text("brb").expect("text")).await }
    });
    wait_for(&mut events, timeline_changed).await;
    assert_eq!(session.snapshot().await.len(), 1);

    sending.abort();
    wait_for(&mut events, |event| {
        matches!(event, SessionEvent::PendingExpired { .. })
    })
    .await;
    assert!(session.snapshot().await.is_empty());
}
