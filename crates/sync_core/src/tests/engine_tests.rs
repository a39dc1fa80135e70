use std::sync::Mutex;

use super::*;
use async_trait::async_trait;
use chrono::TimeZone;
use shared::domain::DeliveryState;
use tokio::time::timeout;

use crate::view::MessageView;

const TYPING_TIMEOUT: Duration = Duration::from_millis(3_000);

fn me() -> UserId {
    UserId::from("me")
}

fn bob() -> UserId {
    UserId::from("bob")
}

fn c1() -> ConversationId {
    ConversationId::from("c1")
}

fn at(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + seconds, 0).unwrap()
}

fn payload(id: &str, sender: UserId, text: &str, seconds: i64) -> MessagePayload {
    MessagePayload {
        message_id: MessageId::from(id),
        conversation_id: c1(),
        sender_id: sender,
        text: text.to_string(),
        sent_at: at(seconds),
        seen: false,
    }
}

fn conversation_with(messages: Vec<MessagePayload>) -> ConversationPayload {
    ConversationPayload {
        conversation_id: c1(),
        participants: vec![me(), bob()],
        messages,
    }
}

#[derive(Default)]
struct FakeApiState {
    conversations: Vec<ConversationPayload>,
    fail_current_user: bool,
    fail_fetches: bool,
    fail_sends: bool,
    stall_sends: bool,
    next_ids: VecDeque<String>,
    sent: Vec<(ConversationId, String)>,
    started: Vec<UserId>,
    seen_reports: Vec<(ConversationId, MessageId)>,
    conversation_fetches: u32,
    mark_all_read_calls: u32,
}

#[derive(Default)]
struct FakeApi {
    state: Mutex<FakeApiState>,
}

impl FakeApi {
    fn with_conversations(conversations: Vec<ConversationPayload>) -> Self {
        let api = Self::default();
        api.state.lock().unwrap().conversations = conversations;
        api
    }
}

#[async_trait]
impl SnapshotApi for FakeApi {
    async fn fetch_current_user(&self) -> Result<UserSummary, SyncError> {
        if self.state.lock().unwrap().fail_current_user {
            return Err(SyncError::Transport("connection refused".into()));
        }
        Ok(UserSummary {
            user_id: me(),
            display_name: "Me".into(),
            avatar_url: None,
        })
    }

    async fn fetch_users(&self) -> Result<Vec<UserSummary>, SyncError> {
        Ok(vec![UserSummary {
            user_id: bob(),
            display_name: "Bob".into(),
            avatar_url: None,
        }])
    }

    async fn fetch_conversations(&self) -> Result<Vec<ConversationPayload>, SyncError> {
        let mut state = self.state.lock().unwrap();
        state.conversation_fetches += 1;
        if state.fail_fetches {
            return Err(SyncError::Transport("backend unavailable".into()));
        }
        Ok(state.conversations.clone())
    }

    async fn send_message(
        &self,
        conversation_id: &ConversationId,
        text: &str,
    ) -> Result<MessagePayload, SyncError> {
        let stall = {
            let mut state = self.state.lock().unwrap();
            if state.fail_sends {
                return Err(SyncError::Transport("backend unavailable".into()));
            }
            state.stall_sends
        };
        if stall {
            std::future::pending::<()>().await;
        }
        let mut state = self.state.lock().unwrap();
        state.sent.push((conversation_id.clone(), text.to_string()));
        let id = state
            .next_ids
            .pop_front()
            .unwrap_or_else(|| format!("srv-{}", state.sent.len()));
        Ok(MessagePayload {
            message_id: MessageId::new(id),
            conversation_id: conversation_id.clone(),
            sender_id: me(),
            text: text.to_string(),
            sent_at: Utc::now(),
            seen: false,
        })
    }

    async fn start_conversation(
        &self,
        user_id: &UserId,
        text: &str,
    ) -> Result<ConversationPayload, SyncError> {
        self.state.lock().unwrap().started.push(user_id.clone());
        Ok(ConversationPayload {
            conversation_id: ConversationId::from("c2"),
            participants: vec![me(), user_id.clone()],
            messages: vec![MessagePayload {
                message_id: MessageId::from("m-start"),
                conversation_id: ConversationId::from("c2"),
                sender_id: me(),
                text: text.to_string(),
                sent_at: at(500),
                seen: false,
            }],
        })
    }

    async fn report_seen(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
    ) -> Result<(), SyncError> {
        self.state
            .lock()
            .unwrap()
            .seen_reports
            .push((conversation_id.clone(), message_id.clone()));
        Ok(())
    }

    async fn mark_all_read(&self) -> Result<(), SyncError> {
        self.state.lock().unwrap().mark_all_read_calls += 1;
        Ok(())
    }
}

/// Test-side end of one fake channel session.
struct FakeConnection {
    server_tx: mpsc::Sender<ServerEvent>,
    client_rx: mpsc::Receiver<ClientRequest>,
}

impl FakeConnection {
    async fn push(&self, event: ServerEvent) {
        self.server_tx.send(event).await.expect("engine listening");
    }

    async fn next_request(&mut self) -> ClientRequest {
        timeout(Duration::from_secs(30), self.client_rx.recv())
            .await
            .expect("client request in time")
            .expect("session open")
    }

    fn drain_requests(&mut self) -> Vec<ClientRequest> {
        let mut requests = Vec::new();
        while let Ok(request) = self.client_rx.try_recv() {
            requests.push(request);
        }
        requests
    }
}

struct FakeChannel {
    connections: mpsc::UnboundedSender<FakeConnection>,
}

#[async_trait]
impl EventChannel for FakeChannel {
    async fn connect(&self) -> Result<ChannelSession, SyncError> {
        let (server_tx, inbound) = mpsc::channel(64);
        let (outbound, client_rx) = mpsc::channel(64);
        self.connections
            .send(FakeConnection {
                server_tx,
                client_rx,
            })
            .map_err(|_| SyncError::Transport("test harness gone".into()))?;
        Ok(ChannelSession { inbound, outbound })
    }
}

struct Harness {
    engine: SyncEngine,
    api: Arc<FakeApi>,
    connections: mpsc::UnboundedReceiver<FakeConnection>,
}

impl Harness {
    async fn start(api: FakeApi) -> Self {
        let api = Arc::new(api);
        let (connections_tx, connections) = mpsc::unbounded_channel();
        let channel = Arc::new(FakeChannel {
            connections: connections_tx,
        });
        let engine = SyncEngine::start(&SyncSettings::default(), api.clone(), channel)
            .await
            .expect("engine starts");
        Self {
            engine,
            api,
            connections,
        }
    }

    /// Waits for the next connect and consumes the presence announcement.
    async fn open_connection(&mut self) -> FakeConnection {
        let mut connection = timeout(Duration::from_secs(60), self.connections.recv())
            .await
            .expect("connect in time")
            .expect("engine alive");
        assert_eq!(
            connection.next_request().await,
            ClientRequest::AnnouncePresence { user_id: me() }
        );
        connection
    }

    async fn wait_for(&self, mut predicate: impl FnMut(&SyncView) -> bool) -> Arc<SyncView> {
        let mut rx = self.engine.watch();
        let view = timeout(Duration::from_secs(60), rx.wait_for(|view| predicate(&**view)))
            .await
            .expect("view in time")
            .expect("engine alive");
        let snapshot = Arc::clone(&*view);
        drop(view);
        snapshot
    }
}

fn messages_of(view: &SyncView) -> &[MessageView] {
    &view.conversation(&c1()).expect("c1 in view").messages
}

fn by_correlation<'a>(
    view: &'a SyncView,
    correlation_id: &CorrelationId,
) -> Option<(usize, &'a MessageView)> {
    messages_of(view)
        .iter()
        .enumerate()
        .find(|(_, message)| message.correlation_id.as_ref() == Some(correlation_id))
}

#[tokio::test(start_paused = true)]
async fn startup_loads_snapshot_then_goes_live() {
    let mut harness = Harness::start(FakeApi::with_conversations(vec![conversation_with(vec![
        payload("m1", bob(), "hello", 10),
    ])]))
    .await;

    let initial = harness.engine.view();
    assert_eq!(initial.current_user.user_id, me());
    assert_eq!(messages_of(&initial).len(), 1);
    assert_eq!(initial.conversation(&c1()).unwrap().title, "Bob");
    assert_eq!(initial.users.len(), 1);

    let _connection = harness.open_connection().await;
    harness.wait_for(|view| view.mode == SyncMode::Live).await;
}

#[tokio::test(start_paused = true)]
async fn startup_failure_is_returned_to_caller() {
    let api = FakeApi::default();
    api.state.lock().unwrap().fail_current_user = true;
    let (connections, _rx) = mpsc::unbounded_channel();

    let result = SyncEngine::start(
        &SyncSettings::default(),
        Arc::new(api),
        Arc::new(FakeChannel { connections }),
    )
    .await;
    assert!(matches!(result, Err(SyncError::Transport(_))));
}

#[tokio::test(start_paused = true)]
async fn duplicate_push_after_snapshot_is_absorbed() {
    let mut harness = Harness::start(FakeApi::with_conversations(vec![conversation_with(vec![
        payload("m1", bob(), "hello", 10),
    ])]))
    .await;
    let connection = harness.open_connection().await;

    connection
        .push(ServerEvent::ReceiveMessage {
            message: payload("m1", bob(), "hello", 10),
        })
        .await;
    connection
        .push(ServerEvent::ReceiveMessage {
            message: payload("m2", bob(), "again", 20),
        })
        .await;

    let view = harness
        .wait_for(|view| messages_of(view).iter().any(|m| m.id.as_str() == "m2"))
        .await;
    let ids: Vec<&str> = messages_of(&view).iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, vec!["m1", "m2"]);
    assert_eq!(view.conversation(&c1()).unwrap().unread, 2);
}

#[tokio::test(start_paused = true)]
async fn typing_indicator_never_expires_early() {
    let mut harness = Harness::start(FakeApi::with_conversations(vec![conversation_with(
        Vec::new(),
    )]))
    .await;
    let connection = harness.open_connection().await;

    let armed_at = Instant::now();
    connection
        .push(ServerEvent::Typing {
            conversation_id: c1(),
            user_id: bob(),
        })
        .await;
    harness
        .wait_for(|view| view.conversation(&c1()).unwrap().typing == Some(bob()))
        .await;

    tokio::time::advance(TYPING_TIMEOUT - Duration::from_millis(10)).await;
    for _ in 0..5 {
        tokio::task::yield_now().await;
    }
    assert_eq!(
        harness.engine.view().conversation(&c1()).unwrap().typing,
        Some(bob())
    );

    harness
        .wait_for(|view| view.conversation(&c1()).unwrap().typing.is_none())
        .await;
    assert!(armed_at.elapsed() >= TYPING_TIMEOUT);
}

#[tokio::test(start_paused = true)]
async fn typing_rearm_extends_deadline_and_stop_clears() {
    let mut harness = Harness::start(FakeApi::with_conversations(vec![conversation_with(
        Vec::new(),
    )]))
    .await;
    let connection = harness.open_connection().await;
    let typing = || ServerEvent::Typing {
        conversation_id: c1(),
        user_id: bob(),
    };

    connection.push(typing()).await;
    harness
        .wait_for(|view| view.conversation(&c1()).unwrap().typing.is_some())
        .await;
    tokio::time::advance(Duration::from_secs(2)).await;
    let rearmed_at = Instant::now();
    connection.push(typing()).await;
    for _ in 0..5 {
        tokio::task::yield_now().await;
    }

    harness
        .wait_for(|view| view.conversation(&c1()).unwrap().typing.is_none())
        .await;
    assert!(rearmed_at.elapsed() >= TYPING_TIMEOUT);

    connection.push(typing()).await;
    harness
        .wait_for(|view| view.conversation(&c1()).unwrap().typing.is_some())
        .await;
    connection
        .push(ServerEvent::StopTyping {
            conversation_id: c1(),
            user_id: bob(),
        })
        .await;
    harness
        .wait_for(|view| view.conversation(&c1()).unwrap().typing.is_none())
        .await;
}

#[tokio::test(start_paused = true)]
async fn presence_events_replace_the_online_set() {
    let mut harness = Harness::start(FakeApi::with_conversations(vec![conversation_with(
        Vec::new(),
    )]))
    .await;
    let connection = harness.open_connection().await;

    connection
        .push(ServerEvent::OnlineUsers {
            user_ids: vec![bob(), UserId::from("carol")],
        })
        .await;
    let view = harness.wait_for(|view| view.online.len() == 2).await;
    assert!(view.conversation(&c1()).unwrap().counterpart_online);

    connection
        .push(ServerEvent::OnlineUsers {
            user_ids: vec![UserId::from("carol")],
        })
        .await;
    let view = harness.wait_for(|view| view.online.len() == 1).await;
    assert_eq!(view.online, vec![UserId::from("carol")]);
    assert!(!view.is_online(&bob()));
    assert!(!view.conversation(&c1()).unwrap().counterpart_online);
}

#[tokio::test(start_paused = true)]
async fn live_send_is_confirmed_and_relayed() {
    let mut harness = Harness::start(FakeApi::with_conversations(vec![conversation_with(vec![
        payload("m1", bob(), "hello", 10),
    ])]))
    .await;
    let mut connection = harness.open_connection().await;

    let correlation_id = harness
        .engine
        .send_message(&c1(), "hi bob")
        .await
        .expect("send accepted");

    let view = harness
        .wait_for(|view| {
            by_correlation(view, &correlation_id)
                .is_some_and(|(_, message)| message.delivery == DeliveryState::Sent)
        })
        .await;
    let (index, message) = by_correlation(&view, &correlation_id).unwrap();
    assert_eq!(index, 1);
    assert_eq!(message.id.as_str(), "srv-1");
    assert!(message.from_me);

    match connection.next_request().await {
        ClientRequest::SendMessage { message } => {
            assert_eq!(message.message_id, MessageId::from("srv-1"));
            assert_eq!(message.text, "hi bob");
        }
        other => panic!("unexpected request: {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn send_to_unknown_conversation_is_rejected() {
    let harness = Harness::start(FakeApi::default()).await;
    let err = harness
        .engine
        .send_message(&ConversationId::from("nope"), "hello?")
        .await
        .expect_err("unknown conversation");
    assert!(matches!(err, SyncError::UnknownConversation(_)));
}

#[tokio::test(start_paused = true)]
async fn degraded_send_is_queued_and_confirmed_after_reconnect() {
    let api = FakeApi::with_conversations(vec![conversation_with(vec![payload(
        "m1",
        bob(),
        "hello",
        10,
    )])]);
    api.state
        .lock()
        .unwrap()
        .next_ids
        .push_back("srv-7".to_string());
    let mut harness = Harness::start(api).await;

    let first = harness.open_connection().await;
    harness.wait_for(|view| view.mode == SyncMode::Live).await;
    drop(first);
    let degraded = harness
        .wait_for(|view| view.mode == SyncMode::Degraded)
        .await;
    assert!(degraded.presence_stale);

    let correlation_id = harness
        .engine
        .send_message(&c1(), "sent while offline")
        .await
        .expect("send accepted");
    let queued = harness
        .wait_for(|view| by_correlation(view, &correlation_id).is_some())
        .await;
    let (queued_index, queued_entry) = by_correlation(&queued, &correlation_id).unwrap();
    assert_eq!(queued_entry.delivery, DeliveryState::Pending);
    assert!(harness.api.state.lock().unwrap().sent.is_empty());

    let _second = harness.open_connection().await;
    let view = harness
        .wait_for(|view| {
            view.mode == SyncMode::Live
                && by_correlation(view, &correlation_id)
                    .is_some_and(|(_, message)| message.delivery == DeliveryState::Sent)
        })
        .await;
    let (index, entry) = by_correlation(&view, &correlation_id).unwrap();
    assert_eq!(index, queued_index);
    assert_eq!(entry.id.as_str(), "srv-7");
    assert_eq!(entry.text, "sent while offline");

    let state = harness.api.state.lock().unwrap();
    assert_eq!(state.sent, vec![(c1(), "sent while offline".to_string())]);
    assert_eq!(state.conversation_fetches, 2, "startup plus resync");
}

#[tokio::test(start_paused = true)]
async fn failed_send_can_be_retried() {
    let api = FakeApi::with_conversations(vec![conversation_with(Vec::new())]);
    api.state.lock().unwrap().fail_sends = true;
    let mut harness = Harness::start(api).await;
    let _connection = harness.open_connection().await;
    let mut updates = harness.engine.subscribe();

    let failed = harness
        .engine
        .send_message(&c1(), "hi")
        .await
        .expect("send accepted");
    harness
        .wait_for(|view| {
            by_correlation(view, &failed)
                .is_some_and(|(_, message)| message.delivery == DeliveryState::Failed)
        })
        .await;
    loop {
        let update = timeout(Duration::from_secs(5), updates.recv())
            .await
            .expect("update in time")
            .expect("update");
        if let SyncUpdate::SendFailed { correlation_id, .. } = update {
            assert_eq!(correlation_id, failed);
            break;
        }
    }

    harness.api.state.lock().unwrap().fail_sends = false;
    let retry = harness.engine.retry_send(&failed).await.expect("retry");
    assert_ne!(retry, failed);

    let view = harness
        .wait_for(|view| {
            by_correlation(view, &retry)
                .is_some_and(|(_, message)| message.delivery == DeliveryState::Sent)
        })
        .await;
    assert!(by_correlation(&view, &failed).is_none());
    assert_eq!(messages_of(&view).len(), 1);

    let err = harness
        .engine
        .retry_send(&retry)
        .await
        .expect_err("confirmed sends are not retryable");
    assert!(matches!(err, SyncError::UnknownCorrelation(_)));
}

#[tokio::test(start_paused = true)]
async fn stalled_send_times_out_as_failed() {
    let api = FakeApi::with_conversations(vec![conversation_with(Vec::new())]);
    api.state.lock().unwrap().stall_sends = true;
    let mut harness = Harness::start(api).await;
    let _connection = harness.open_connection().await;
    let mut updates = harness.engine.subscribe();

    let correlation_id = harness
        .engine
        .send_message(&c1(), "hi")
        .await
        .expect("send accepted");
    loop {
        let update = timeout(Duration::from_secs(60), updates.recv())
            .await
            .expect("update in time")
            .expect("update");
        if let SyncUpdate::SendFailed {
            correlation_id: failed,
            reason,
        } = update
        {
            assert_eq!(failed, correlation_id);
            assert!(reason.contains("timed out"), "{reason}");
            break;
        }
    }
}

#[tokio::test(start_paused = true)]
async fn seen_receipt_is_reported_exactly_once() {
    let mut harness = Harness::start(FakeApi::with_conversations(vec![conversation_with(vec![
        payload("m1", bob(), "hello", 10),
    ])]))
    .await;
    let mut connection = harness.open_connection().await;

    for _ in 0..3 {
        harness
            .engine
            .mark_seen(&c1(), &MessageId::from("m1"))
            .expect("engine running");
    }
    harness
        .engine
        .mark_conversation_seen(&c1())
        .expect("engine running");

    let view = harness
        .wait_for(|view| view.conversation(&c1()).unwrap().unread == 0)
        .await;
    assert!(messages_of(&view)[0].seen);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(
        harness.api.state.lock().unwrap().seen_reports,
        vec![(c1(), MessageId::from("m1"))]
    );
    let seen_emissions = connection
        .drain_requests()
        .into_iter()
        .filter(|request| matches!(request, ClientRequest::MessageSeen { .. }))
        .count();
    assert_eq!(seen_emissions, 1);
}

#[tokio::test(start_paused = true)]
async fn counterpart_receipt_marks_own_message_seen() {
    let mut harness = Harness::start(FakeApi::with_conversations(vec![conversation_with(vec![
        payload("m1", me(), "did you get this?", 10),
    ])]))
    .await;
    let connection = harness.open_connection().await;

    connection
        .push(ServerEvent::MessageSeen {
            conversation_id: c1(),
            message_id: MessageId::from("m1"),
        })
        .await;
    harness.wait_for(|view| messages_of(view)[0].seen).await;
}

#[tokio::test(start_paused = true)]
async fn start_conversation_adds_it_to_the_view() {
    let mut harness = Harness::start(FakeApi::default()).await;
    let mut connection = harness.open_connection().await;

    let conversation_id = harness
        .engine
        .start_conversation(&UserId::from("carol"), "hey carol")
        .await
        .expect("start");
    assert_eq!(conversation_id, ConversationId::from("c2"));

    let view = harness
        .wait_for(|view| view.conversation(&conversation_id).is_some())
        .await;
    let started = view.conversation(&conversation_id).unwrap();
    assert_eq!(started.counterpart, Some(UserId::from("carol")));
    assert_eq!(started.messages[0].text, "hey carol");
    assert!(matches!(
        connection.next_request().await,
        ClientRequest::SendMessage { .. }
    ));
}

#[tokio::test(start_paused = true)]
async fn mark_all_read_clears_unread_without_per_message_reports() {
    let mut harness = Harness::start(FakeApi::with_conversations(vec![conversation_with(vec![
        payload("m1", bob(), "one", 10),
        payload("m2", bob(), "two", 20),
    ])]))
    .await;
    let mut connection = harness.open_connection().await;
    assert_eq!(harness.engine.view().unread_total(), 2);

    harness.engine.mark_all_read().expect("engine running");
    harness.wait_for(|view| view.unread_total() == 0).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let state = harness.api.state.lock().unwrap();
    assert_eq!(state.mark_all_read_calls, 1);
    assert!(state.seen_reports.is_empty());
    assert!(connection.drain_requests().is_empty());
}

#[tokio::test(start_paused = true)]
async fn outgoing_typing_is_emitted_on_the_channel() {
    let mut harness = Harness::start(FakeApi::with_conversations(vec![conversation_with(
        Vec::new(),
    )]))
    .await;
    let mut connection = harness.open_connection().await;

    harness.engine.notify_typing(&c1()).expect("engine running");
    harness
        .engine
        .notify_stop_typing(&c1())
        .expect("engine running");

    assert_eq!(
        connection.next_request().await,
        ClientRequest::Typing {
            conversation_id: c1(),
            user_id: me()
        }
    );
    assert_eq!(
        connection.next_request().await,
        ClientRequest::StopTyping {
            conversation_id: c1(),
            user_id: me()
        }
    );
}

#[tokio::test(start_paused = true)]
async fn shutdown_stops_the_actor() {
    let mut harness = Harness::start(FakeApi::default()).await;
    let _connection = harness.open_connection().await;
    harness.wait_for(|view| view.mode == SyncMode::Live).await;
    let mut rx = harness.engine.watch();
    rx.borrow_and_update();

    harness.engine.shutdown().await;
    assert!(rx.changed().await.is_err(), "view sender dropped");
}

#[tokio::test(start_paused = true)]
async fn push_echo_after_send_timeout_replaces_the_failed_entry() {
    let api = FakeApi::with_conversations(vec![conversation_with(Vec::new())]);
    api.state.lock().unwrap().stall_sends = true;
    let mut harness = Harness::start(api).await;
    let connection = harness.open_connection().await;

    let correlation_id = harness
        .engine
        .send_message(&c1(), "hi")
        .await
        .expect("send accepted");
    harness
        .wait_for(|view| {
            by_correlation(view, &correlation_id)
                .is_some_and(|(_, message)| message.delivery == DeliveryState::Failed)
        })
        .await;

    // The backend stored the message even though the response never came.
    connection
        .push(ServerEvent::ReceiveMessage {
            message: payload("srv-9", me(), "hi", 30),
        })
        .await;
    let view = harness
        .wait_for(|view| {
            messages_of(view)
                .iter()
                .any(|message| message.delivery == DeliveryState::Sent)
        })
        .await;
    let messages = messages_of(&view);
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].id.as_str(), "srv-9");

    let err = harness
        .engine
        .retry_send(&correlation_id)
        .await
        .expect_err("delivered sends are not retryable");
    assert!(matches!(err, SyncError::UnknownCorrelation(_)));
}

#[tokio::test(start_paused = true)]
async fn failed_resync_can_be_requested_again() {
    let mut harness = Harness::start(FakeApi::with_conversations(vec![conversation_with(vec![
        payload("m1", bob(), "hello", 10),
    ])]))
    .await;
    let first = harness.open_connection().await;
    harness.wait_for(|view| view.mode == SyncMode::Live).await;

    harness.api.state.lock().unwrap().fail_fetches = true;
    let mut updates = harness.engine.subscribe();
    drop(first);
    let _second = harness.open_connection().await;
    loop {
        let update = timeout(Duration::from_secs(60), updates.recv())
            .await
            .expect("update in time")
            .expect("update");
        if let SyncUpdate::Error(message) = update {
            assert!(message.contains("resync failed"), "{message}");
            break;
        }
    }

    {
        let mut state = harness.api.state.lock().unwrap();
        state.fail_fetches = false;
        state.conversations = vec![conversation_with(vec![
            payload("m1", bob(), "hello", 10),
            payload("m2", bob(), "missed while offline", 20),
        ])];
    }
    harness.engine.resync().expect("engine running");
    let view = harness
        .wait_for(|view| messages_of(view).iter().any(|m| m.id.as_str() == "m2"))
        .await;
    assert_eq!(view.mode, SyncMode::Live);
    assert_eq!(harness.api.state.lock().unwrap().conversation_fetches, 3);
}

#[tokio::test(start_paused = true)]
async fn start_conversation_reuses_existing_counterpart() {
    let mut harness = Harness::start(FakeApi::with_conversations(vec![conversation_with(vec![
        payload("m1", bob(), "hello", 10),
    ])]))
    .await;
    let _connection = harness.open_connection().await;
    harness.wait_for(|view| view.mode == SyncMode::Live).await;

    let conversation_id = harness
        .engine
        .start_conversation(&bob(), "hi again")
        .await
        .expect("start");
    assert_eq!(conversation_id, c1());

    let view = harness
        .wait_for(|view| {
            messages_of(view)
                .iter()
                .any(|m| m.text == "hi again" && m.delivery == DeliveryState::Sent)
        })
        .await;
    assert_eq!(view.conversations.len(), 1);
    let state = harness.api.state.lock().unwrap();
    assert!(state.started.is_empty());
    assert_eq!(state.sent, vec![(c1(), "hi again".to_string())]);
}

#[tokio::test(start_paused = true)]
async fn blank_text_is_rejected_before_any_request() {
    let harness = Harness::start(FakeApi::with_conversations(vec![conversation_with(
        Vec::new(),
    )]))
    .await;

    let err = harness
        .engine
        .send_message(&c1(), "   ")
        .await
        .expect_err("blank send");
    assert!(matches!(err, SyncError::EmptyMessage));
    let err = harness
        .engine
        .start_conversation(&UserId::from("carol"), "")
        .await
        .expect_err("blank start");
    assert!(matches!(err, SyncError::EmptyMessage));

    assert!(messages_of(&harness.engine.view()).is_empty());
    let state = harness.api.state.lock().unwrap();
    assert!(state.sent.is_empty());
    assert!(state.started.is_empty());
}

#[tokio::test(start_paused = true)]
async fn inputs_from_a_superseded_session_are_ignored() {
    let mut harness = Harness::start(FakeApi::with_conversations(vec![conversation_with(vec![
        payload("m1", bob(), "hello", 10),
    ])]))
    .await;
    let first = harness.open_connection().await;
    harness.wait_for(|view| view.mode == SyncMode::Live).await;
    drop(first);
    harness
        .wait_for(|view| view.mode == SyncMode::Degraded)
        .await;
    let second = harness.open_connection().await;
    harness.wait_for(|view| view.mode == SyncMode::Live).await;

    // The first connect attempt ran under epoch 1; the reconnect bumped it.
    let old_epoch = 1;
    let inputs = &harness.engine.inputs;
    inputs
        .send(EngineInput::Server {
            epoch: old_epoch,
            event: ServerEvent::ReceiveMessage {
                message: payload("ghost", bob(), "from the old session", 900),
            },
        })
        .expect("engine running");
    inputs
        .send(EngineInput::SnapshotLoaded {
            epoch: old_epoch,
            result: Ok(vec![conversation_with(vec![
                payload("m1", bob(), "hello", 10),
                payload("stale", bob(), "old snapshot", 950),
            ])]),
        })
        .expect("engine running");
    inputs
        .send(EngineInput::ChannelLost { epoch: old_epoch })
        .expect("engine running");

    second
        .push(ServerEvent::ReceiveMessage {
            message: payload("live", bob(), "current session", 1_000),
        })
        .await;
    let view = harness
        .wait_for(|view| messages_of(view).iter().any(|m| m.id.as_str() == "live"))
        .await;
    let ids: Vec<&str> = messages_of(&view).iter().map(|m| m.id.as_str()).collect();
    assert!(!ids.contains(&"ghost"), "{ids:?}");
    assert!(!ids.contains(&"stale"), "{ids:?}");
    assert_eq!(view.mode, SyncMode::Live);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(harness.connections.try_recv().is_err(), "no reconnect");
    assert_eq!(harness.engine.view().mode, SyncMode::Live);
}
