//! The sync actor and its public handle.
//!
//! One task owns the store and the trackers. UI commands, push events,
//! channel lifecycle changes and I/O completions all arrive on a single
//! queue and are applied strictly in order; network calls run in spawned
//! tasks that post their results back. After every input the actor
//! republishes the derived [`SyncView`] and broadcasts [`SyncUpdate`]s.

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use futures::StreamExt;
use shared::{
    domain::{ConversationId, CorrelationId, MessageId, UserId},
    protocol::{
        ClientRequest, ConversationPayload, EventKind, MessagePayload, ServerEvent, UserSummary,
    },
};
use tokio::{
    sync::{broadcast, mpsc, oneshot, watch},
    task::JoinHandle,
    time::Instant,
};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use crate::{
    config::SyncSettings,
    error::SyncError,
    event_bus::{Dispatch, EventBus},
    message_store::{MergeOutcome, Message, MessageStore, SendResolution, StoreChange},
    presence::PresenceTracker,
    read_receipts::ReadReceiptTracker,
    transport::{ChannelSession, EventChannel, SnapshotApi},
    typing::{TypingTimer, TypingTracker},
    view::{SyncMode, SyncUpdate, SyncView, ViewSources},
};

const UPDATE_BUFFER: usize = 1024;

enum Effect {
    ArmTypingTimer(TypingTimer),
    CancelTypingTimer(ConversationId),
    Update(SyncUpdate),
}

/// Everything routed push events may touch.
struct SyncCore {
    store: MessageStore,
    presence: PresenceTracker,
    typing: TypingTracker,
    receipts: ReadReceiptTracker,
    effects: Vec<Effect>,
}

impl SyncCore {
    fn new(current_user: UserId, typing_timeout: Duration) -> Self {
        Self {
            store: MessageStore::new(current_user),
            presence: PresenceTracker::new(),
            typing: TypingTracker::new(typing_timeout),
            receipts: ReadReceiptTracker::new(),
            effects: Vec::new(),
        }
    }

    fn update(&mut self, update: SyncUpdate) {
        self.effects.push(Effect::Update(update));
    }
}

/// Binds each push event kind to exactly one tracker or store call.
fn routing_table() -> Result<EventBus<SyncCore>, SyncError> {
    let mut bus = EventBus::<SyncCore>::new();

    bus.subscribe(EventKind::OnlineUsers, |core, event| {
        let ServerEvent::OnlineUsers { user_ids } = event else {
            return;
        };
        if core.presence.set_online(user_ids) {
            core.update(SyncUpdate::PresenceChanged);
        }
    })?;

    bus.subscribe(EventKind::Typing, |core, event| {
        let ServerEvent::Typing {
            conversation_id,
            user_id,
        } = event
        else {
            return;
        };
        if &user_id == core.store.current_user() {
            return;
        }
        let timer = core
            .typing
            .typing(conversation_id.clone(), user_id, Instant::now());
        core.effects.push(Effect::ArmTypingTimer(timer));
        core.update(SyncUpdate::TypingChanged(conversation_id));
    })?;

    bus.subscribe(EventKind::StopTyping, |core, event| {
        let ServerEvent::StopTyping {
            conversation_id,
            user_id,
        } = event
        else {
            return;
        };
        if core.typing.stop_typing(&conversation_id, &user_id) {
            core.effects
                .push(Effect::CancelTypingTimer(conversation_id.clone()));
            core.update(SyncUpdate::TypingChanged(conversation_id));
        }
    })?;

    bus.subscribe(EventKind::MessageSeen, |core, event| {
        let ServerEvent::MessageSeen {
            conversation_id,
            message_id,
        } = event
        else {
            return;
        };
        if !core.store.mark_seen(&conversation_id, &message_id) {
            debug!(
                conversation_id = %conversation_id,
                message_id = %message_id,
                "sync: seen receipt did not change state"
            );
        }
    })?;

    bus.subscribe(EventKind::ReceiveMessage, |core, event| {
        let ServerEvent::ReceiveMessage { message } = event else {
            return;
        };
        let conversation_id = message.conversation_id.clone();
        if let MergeOutcome::Adopted { correlation_id, .. } = core
            .store
            .append(conversation_id.clone(), Message::from_payload(message))
        {
            debug!(
                conversation_id = %conversation_id,
                correlation_id = %correlation_id,
                "sync: push echo confirmed pending send"
            );
        }
    })?;

    Ok(bus)
}

enum Command {
    Send {
        conversation_id: ConversationId,
        text: String,
        reply: oneshot::Sender<Result<CorrelationId, SyncError>>,
    },
    Retry {
        failed: CorrelationId,
        reply: oneshot::Sender<Result<CorrelationId, SyncError>>,
    },
    StartConversation {
        user_id: UserId,
        text: String,
        reply: oneshot::Sender<Result<ConversationId, SyncError>>,
    },
    MarkSeen {
        conversation_id: ConversationId,
        message_id: MessageId,
    },
    MarkConversationSeen {
        conversation_id: ConversationId,
    },
    Typing {
        conversation_id: ConversationId,
        active: bool,
    },
    MarkAllRead,
    Resync,
}

enum EngineInput {
    Command(Command),
    Server {
        epoch: u64,
        event: ServerEvent,
    },
    ChannelOpened {
        epoch: u64,
        session: ChannelSession,
    },
    ChannelLost {
        epoch: u64,
    },
    ConnectFailed {
        epoch: u64,
        error: SyncError,
    },
    SnapshotLoaded {
        epoch: u64,
        result: Result<Vec<ConversationPayload>, SyncError>,
    },
    SendCompleted {
        correlation_id: CorrelationId,
        result: Result<MessagePayload, SyncError>,
    },
    ConversationStarted {
        result: Result<ConversationPayload, SyncError>,
        reply: oneshot::Sender<Result<ConversationId, SyncError>>,
    },
    TypingExpired {
        conversation_id: ConversationId,
        generation: u64,
    },
    BackgroundFailed {
        operation: &'static str,
        error: SyncError,
    },
    Shutdown,
}

struct SyncActor {
    core: SyncCore,
    bus: EventBus<SyncCore>,
    api: Arc<dyn SnapshotApi>,
    channel: Arc<dyn EventChannel>,
    current_user: UserSummary,
    send_timeout: Duration,
    reconnect_initial_delay: Duration,
    reconnect_max_delay: Duration,
    inputs_tx: mpsc::UnboundedSender<EngineInput>,
    inputs_rx: mpsc::UnboundedReceiver<EngineInput>,
    mode: SyncMode,
    /// Bumped on every connect attempt; inputs tagged with an older epoch are dropped.
    epoch: u64,
    outbound: Option<mpsc::Sender<ClientRequest>>,
    pump: Option<JoinHandle<()>>,
    connect_attempt: Option<JoinHandle<()>>,
    reconnect_attempts: u32,
    gap_start: Option<DateTime<Utc>>,
    queued_sends: VecDeque<CorrelationId>,
    typing_timers: HashMap<ConversationId, JoinHandle<()>>,
    view_tx: watch::Sender<Arc<SyncView>>,
    updates_tx: broadcast::Sender<SyncUpdate>,
}

impl SyncActor {
    async fn run(mut self) {
        self.schedule_connect(Duration::ZERO);
        while let Some(input) = self.inputs_rx.recv().await {
            if matches!(input, EngineInput::Shutdown) {
                break;
            }
            self.handle(input);
            self.flush();
        }
        self.stop();
        info!(user_id = %self.current_user.user_id, "sync: engine stopped");
    }

    fn handle(&mut self, input: EngineInput) {
        match input {
            EngineInput::Command(command) => self.handle_command(command),
            EngineInput::Server { epoch, event } => {
                if epoch != self.epoch {
                    debug!(epoch, current = self.epoch, "sync: dropping event from old session");
                    return;
                }
                if let Dispatch::Unrouted(kind) = self.bus.publish(&mut self.core, event) {
                    warn!(kind = %kind, "sync: no subscriber for event");
                }
            }
            EngineInput::ChannelOpened { epoch, session } => self.on_channel_opened(epoch, session),
            EngineInput::ChannelLost { epoch } => self.on_channel_lost(epoch),
            EngineInput::ConnectFailed { epoch, error } => self.on_connect_failed(epoch, error),
            EngineInput::SnapshotLoaded { epoch, result } => self.on_snapshot_loaded(epoch, result),
            EngineInput::SendCompleted {
                correlation_id,
                result,
            } => self.on_send_completed(correlation_id, result),
            EngineInput::ConversationStarted { result, reply } => {
                self.on_conversation_started(result, reply)
            }
            EngineInput::TypingExpired {
                conversation_id,
                generation,
            } => {
                if self.core.typing.expire(&conversation_id, generation) {
                    self.typing_timers.remove(&conversation_id);
                    self.core.update(SyncUpdate::TypingChanged(conversation_id));
                }
            }
            EngineInput::BackgroundFailed { operation, error } => {
                warn!(operation, error = %error, "sync: background request failed");
                self.core
                    .update(SyncUpdate::Error(format!("{operation} failed: {error}")));
            }
            EngineInput::Shutdown => {}
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Send {
                conversation_id,
                text,
                reply,
            } => {
                let correlation_id = CorrelationId::generate();
                let result = self
                    .core
                    .store
                    .begin_send_with_id(correlation_id.clone(), &conversation_id, text, Utc::now())
                    .map(|_| correlation_id.clone());
                if result.is_ok() {
                    self.submit_send(correlation_id);
                }
                let _ = reply.send(result);
            }
            Command::Retry { failed, reply } => {
                let retry = CorrelationId::generate();
                let result = self
                    .core
                    .store
                    .retry_send(&failed, retry.clone(), Utc::now())
                    .map(|_| retry.clone());
                if result.is_ok() {
                    info!(failed = %failed, retry = %retry, "sync: retrying failed send");
                    self.submit_send(retry);
                }
                let _ = reply.send(result);
            }
            Command::StartConversation {
                user_id,
                text,
                reply,
            } => {
                if text.trim().is_empty() {
                    let _ = reply.send(Err(SyncError::EmptyMessage));
                    return;
                }
                let existing = self
                    .core
                    .store
                    .conversation_with(&user_id)
                    .map(|conversation| conversation.id.clone());
                if let Some(conversation_id) = existing {
                    debug!(
                        conversation_id = %conversation_id,
                        user_id = %user_id,
                        "sync: reusing existing conversation"
                    );
                    let correlation_id = CorrelationId::generate();
                    let result = self
                        .core
                        .store
                        .begin_send_with_id(correlation_id.clone(), &conversation_id, text, Utc::now())
                        .map(|_| conversation_id);
                    if result.is_ok() {
                        self.submit_send(correlation_id);
                    }
                    let _ = reply.send(result);
                    return;
                }
                let api = Arc::clone(&self.api);
                let inputs = self.inputs_tx.clone();
                tokio::spawn(async move {
                    let result = api.start_conversation(&user_id, &text).await;
                    let _ = inputs.send(EngineInput::ConversationStarted { result, reply });
                });
            }
            Command::MarkSeen {
                conversation_id,
                message_id,
            } => self.report_seen(&conversation_id, &message_id),
            Command::MarkConversationSeen { conversation_id } => {
                let me = &self.current_user.user_id;
                let incoming: Vec<MessageId> = self
                    .core
                    .store
                    .conversation(&conversation_id)
                    .map(|conversation| {
                        conversation
                            .messages()
                            .iter()
                            .filter(|message| !message.is_local() && &message.sender_id != me)
                            .map(|message| message.id.clone())
                            .collect()
                    })
                    .unwrap_or_default();
                for message_id in incoming {
                    self.report_seen(&conversation_id, &message_id);
                }
            }
            Command::Typing {
                conversation_id,
                active,
            } => {
                let user_id = self.current_user.user_id.clone();
                self.emit(if active {
                    ClientRequest::Typing {
                        conversation_id,
                        user_id,
                    }
                } else {
                    ClientRequest::StopTyping {
                        conversation_id,
                        user_id,
                    }
                });
            }
            Command::MarkAllRead => self.mark_all_read(),
            Command::Resync => {
                info!(epoch = self.epoch, "sync: resync requested");
                self.spawn_resync(self.epoch);
            }
        }
    }

    fn submit_send(&mut self, correlation_id: CorrelationId) {
        if self.mode == SyncMode::Live {
            self.dispatch_send(correlation_id);
        } else {
            debug!(
                correlation_id = %correlation_id,
                mode = ?self.mode,
                "sync: queueing send until the channel opens"
            );
            self.queued_sends.push_back(correlation_id);
        }
    }

    fn flush_queued_sends(&mut self) {
        while let Some(correlation_id) = self.queued_sends.pop_front() {
            if self.core.store.pending_send(&correlation_id).is_some() {
                self.dispatch_send(correlation_id);
            }
        }
    }

    fn dispatch_send(&mut self, correlation_id: CorrelationId) {
        let Some(pending) = self.core.store.pending_send(&correlation_id) else {
            return;
        };
        let conversation_id = pending.conversation_id.clone();
        let text = pending.text.clone();
        let api = Arc::clone(&self.api);
        let inputs = self.inputs_tx.clone();
        let send_timeout = self.send_timeout;
        tokio::spawn(async move {
            let result =
                match tokio::time::timeout(send_timeout, api.send_message(&conversation_id, &text))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(SyncError::Timeout(send_timeout)),
                };
            let _ = inputs.send(EngineInput::SendCompleted {
                correlation_id,
                result,
            });
        });
    }

    fn on_send_completed(
        &mut self,
        correlation_id: CorrelationId,
        result: Result<MessagePayload, SyncError>,
    ) {
        match result {
            Ok(message) => match self.core.store.resolve_send(&correlation_id, message.clone()) {
                SendResolution::Confirmed { .. } => {
                    debug!(
                        correlation_id = %correlation_id,
                        message_id = %message.message_id,
                        "sync: send confirmed"
                    );
                    self.emit(ClientRequest::SendMessage { message });
                }
                SendResolution::Absorbed => debug!(
                    correlation_id = %correlation_id,
                    message_id = %message.message_id,
                    "sync: send confirmation absorbed by earlier delivery"
                ),
                SendResolution::Unknown => debug!(
                    correlation_id = %correlation_id,
                    "sync: ignoring confirmation for unknown send"
                ),
            },
            Err(error) => {
                warn!(correlation_id = %correlation_id, error = %error, "sync: send failed");
                if let Err(err) = self.core.store.fail_send(&correlation_id) {
                    debug!(correlation_id = %correlation_id, error = %err, "sync: failed send already gone");
                    return;
                }
                self.core.update(SyncUpdate::SendFailed {
                    correlation_id,
                    reason: error.to_string(),
                });
            }
        }
    }

    fn on_conversation_started(
        &mut self,
        result: Result<ConversationPayload, SyncError>,
        reply: oneshot::Sender<Result<ConversationId, SyncError>>,
    ) {
        match result {
            Ok(conversation) => {
                let conversation_id = conversation.conversation_id.clone();
                let own: Vec<MessagePayload> = conversation
                    .messages
                    .iter()
                    .filter(|message| message.sender_id == self.current_user.user_id)
                    .cloned()
                    .collect();
                let added = self.core.store.upsert_conversation(conversation);
                info!(conversation_id = %conversation_id, added, "sync: conversation started");
                for message in own {
                    self.emit(ClientRequest::SendMessage { message });
                }
                let _ = reply.send(Ok(conversation_id));
            }
            Err(error) => {
                warn!(error = %error, "sync: start conversation failed");
                let _ = reply.send(Err(error));
            }
        }
    }

    fn report_seen(&mut self, conversation_id: &ConversationId, message_id: &MessageId) {
        let Some(sender_id) = self
            .core
            .store
            .message(conversation_id, message_id)
            .map(|message| message.sender_id.clone())
        else {
            debug!(
                conversation_id = %conversation_id,
                message_id = %message_id,
                "sync: mark seen for unknown message ignored"
            );
            return;
        };
        let Some(report) = self.core.receipts.mark_seen_if_needed(
            conversation_id,
            message_id,
            &sender_id,
            &self.current_user.user_id,
        ) else {
            return;
        };

        self.core
            .update(SyncUpdate::ConversationChanged(conversation_id.clone()));
        self.emit(ClientRequest::MessageSeen {
            conversation_id: report.conversation_id.clone(),
            message_id: report.message_id.clone(),
        });
        let api = Arc::clone(&self.api);
        let inputs = self.inputs_tx.clone();
        tokio::spawn(async move {
            if let Err(error) = api
                .report_seen(&report.conversation_id, &report.message_id)
                .await
            {
                let _ = inputs.send(EngineInput::BackgroundFailed {
                    operation: "report_seen",
                    error,
                });
            }
        });
    }

    fn mark_all_read(&mut self) {
        let me = &self.current_user.user_id;
        for conversation in self.core.store.conversations_by_activity() {
            let mut changed = false;
            for message in conversation.messages() {
                if message.is_local() || &message.sender_id == me {
                    continue;
                }
                changed |= self.core.receipts.mark_reported(&conversation.id, &message.id);
            }
            if changed {
                self.core
                    .effects
                    .push(Effect::Update(SyncUpdate::ConversationChanged(
                        conversation.id.clone(),
                    )));
            }
        }

        let api = Arc::clone(&self.api);
        let inputs = self.inputs_tx.clone();
        tokio::spawn(async move {
            if let Err(error) = api.mark_all_read().await {
                let _ = inputs.send(EngineInput::BackgroundFailed {
                    operation: "mark_all_read",
                    error,
                });
            }
        });
    }

    fn emit(&self, request: ClientRequest) {
        let Some(outbound) = &self.outbound else {
            debug!(request = ?request, "sync: channel down; dropping client emission");
            return;
        };
        if let Err(err) = outbound.try_send(request) {
            warn!(error = %err, "sync: dropping client emission");
        }
    }

    fn schedule_connect(&mut self, delay: Duration) {
        if let Some(previous) = self.connect_attempt.take() {
            previous.abort();
        }
        self.epoch += 1;
        let epoch = self.epoch;
        let channel = Arc::clone(&self.channel);
        let inputs = self.inputs_tx.clone();
        self.connect_attempt = Some(tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let input = match channel.connect().await {
                Ok(session) => EngineInput::ChannelOpened { epoch, session },
                Err(error) => EngineInput::ConnectFailed { epoch, error },
            };
            let _ = inputs.send(input);
        }));
    }

    fn schedule_reconnect(&mut self) {
        let factor = 2u32.saturating_pow(self.reconnect_attempts);
        let delay = self
            .reconnect_initial_delay
            .saturating_mul(factor)
            .min(self.reconnect_max_delay);
        self.reconnect_attempts = self.reconnect_attempts.saturating_add(1);
        info!(
            attempt = self.reconnect_attempts,
            delay_ms = delay.as_millis() as u64,
            "sync: scheduling reconnect"
        );
        self.schedule_connect(delay);
    }

    fn on_channel_opened(&mut self, epoch: u64, session: ChannelSession) {
        if epoch != self.epoch {
            debug!(epoch, current = self.epoch, "sync: discarding superseded channel session");
            return;
        }
        self.connect_attempt = None;
        self.reconnect_attempts = 0;

        let ChannelSession { inbound, outbound } = session;
        self.outbound = Some(outbound);
        let pump = tokio::spawn(pump_events(epoch, inbound, self.inputs_tx.clone()));
        if let Some(previous) = self.pump.replace(pump) {
            previous.abort();
        }

        info!(epoch, user_id = %self.current_user.user_id, "sync: channel open");
        self.set_mode(SyncMode::Live);
        self.core.typing.clear_stale();
        self.emit(ClientRequest::AnnouncePresence {
            user_id: self.current_user.user_id.clone(),
        });

        if let Some(gap_start) = self.gap_start {
            let needing = self.core.store.conversations_needing_resync(gap_start);
            if needing.is_empty() {
                self.gap_start = None;
            } else {
                info!(
                    conversations = needing.len(),
                    gap_start = %gap_start,
                    "sync: resyncing after reconnect"
                );
                self.spawn_resync(epoch);
            }
        }
        self.flush_queued_sends();
    }

    fn on_channel_lost(&mut self, epoch: u64) {
        if epoch != self.epoch {
            return;
        }
        self.pump = None;
        self.outbound = None;
        self.enter_degraded(&SyncError::ChannelDisconnected);
        self.schedule_reconnect();
    }

    fn on_connect_failed(&mut self, epoch: u64, error: SyncError) {
        if epoch != self.epoch {
            return;
        }
        self.connect_attempt = None;
        if self.mode == SyncMode::Degraded {
            warn!(epoch, error = %error, "sync: connect attempt failed");
        } else {
            self.enter_degraded(&error);
        }
        self.schedule_reconnect();
    }

    fn enter_degraded(&mut self, reason: &SyncError) {
        let gap_start = *self.gap_start.get_or_insert_with(Utc::now);
        self.core.presence.mark_stale();
        self.core.typing.mark_stale();
        warn!(
            reason = %reason,
            gap_start = %gap_start,
            queued = self.queued_sends.len(),
            "sync: channel unavailable; entering degraded mode"
        );
        self.set_mode(SyncMode::Degraded);
    }

    fn spawn_resync(&self, epoch: u64) {
        let api = Arc::clone(&self.api);
        let inputs = self.inputs_tx.clone();
        tokio::spawn(async move {
            let result = api.fetch_conversations().await;
            let _ = inputs.send(EngineInput::SnapshotLoaded { epoch, result });
        });
    }

    fn on_snapshot_loaded(
        &mut self,
        epoch: u64,
        result: Result<Vec<ConversationPayload>, SyncError>,
    ) {
        if epoch != self.epoch {
            debug!(epoch, current = self.epoch, "sync: dropping snapshot from old session");
            return;
        }
        match result {
            Ok(conversations) => {
                let outcome = self.core.store.load_snapshot(conversations);
                self.gap_start = None;
                info!(
                    conversations = outcome.conversations,
                    pending_restored = outcome.pending_restored,
                    stale = outcome.stale,
                    "sync: resync applied"
                );
                self.core.update(SyncUpdate::Resynced {
                    conversations: outcome.conversations,
                    stale: outcome.stale,
                });
            }
            Err(error) => {
                warn!(error = %error, "sync: resync fetch failed");
                self.core
                    .update(SyncUpdate::Error(format!("resync failed: {error}")));
            }
        }
    }

    fn set_mode(&mut self, mode: SyncMode) {
        if self.mode == mode {
            return;
        }
        info!(from = ?self.mode, to = ?mode, "sync: mode changed");
        self.mode = mode;
        self.core.update(SyncUpdate::ModeChanged(mode));
    }

    fn arm_typing_timer(&mut self, timer: TypingTimer) {
        if let Some(previous) = self.typing_timers.remove(&timer.conversation_id) {
            previous.abort();
        }
        let conversation_id = timer.conversation_id.clone();
        let inputs = self.inputs_tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(timer.deadline).await;
            let _ = inputs.send(EngineInput::TypingExpired {
                conversation_id: timer.conversation_id,
                generation: timer.generation,
            });
        });
        self.typing_timers.insert(conversation_id, handle);
    }

    /// Applies queued effects, republishes the view, then notifies subscribers.
    fn flush(&mut self) {
        let mut updates: Vec<SyncUpdate> = Vec::new();
        for effect in std::mem::take(&mut self.core.effects) {
            match effect {
                Effect::ArmTypingTimer(timer) => self.arm_typing_timer(timer),
                Effect::CancelTypingTimer(conversation_id) => {
                    if let Some(handle) = self.typing_timers.remove(&conversation_id) {
                        handle.abort();
                    }
                }
                Effect::Update(update) => {
                    if !updates.contains(&update) {
                        updates.push(update);
                    }
                }
            }
        }
        for change in self.core.store.take_changes() {
            let update = match change {
                StoreChange::Conversation(conversation_id) => {
                    SyncUpdate::ConversationChanged(conversation_id)
                }
                StoreChange::Users => SyncUpdate::UsersChanged,
                StoreChange::Snapshot => continue,
            };
            if !updates.contains(&update) {
                updates.push(update);
            }
        }

        self.publish_view();
        for update in updates {
            let _ = self.updates_tx.send(update);
        }
    }

    fn publish_view(&self) {
        let view = ViewSources {
            mode: self.mode,
            current_user: &self.current_user,
            store: &self.core.store,
            presence: &self.core.presence,
            typing: &self.core.typing,
            receipts: &self.core.receipts,
            now: Instant::now(),
        }
        .build();
        self.view_tx.send_if_modified(|current| {
            if **current == view {
                return false;
            }
            *current = Arc::new(view);
            true
        });
    }

    fn stop(&mut self) {
        for handle in [self.connect_attempt.take(), self.pump.take()]
            .into_iter()
            .flatten()
        {
            handle.abort();
        }
        for (_, handle) in self.typing_timers.drain() {
            handle.abort();
        }
        self.outbound = None;
    }
}

async fn pump_events(
    epoch: u64,
    inbound: mpsc::Receiver<ServerEvent>,
    inputs: mpsc::UnboundedSender<EngineInput>,
) {
    let mut events = ReceiverStream::new(inbound);
    while let Some(event) = events.next().await {
        if inputs.send(EngineInput::Server { epoch, event }).is_err() {
            return;
        }
    }
    let _ = inputs.send(EngineInput::ChannelLost { epoch });
}

/// Handle to a running sync actor. Dropping it stops the actor.
pub struct SyncEngine {
    inputs: mpsc::UnboundedSender<EngineInput>,
    view: watch::Receiver<Arc<SyncView>>,
    updates: broadcast::Sender<SyncUpdate>,
    task: Option<JoinHandle<()>>,
}

impl SyncEngine {
    /// Loads the initial snapshot, then spawns the actor which opens the channel.
    pub async fn start(
        settings: &SyncSettings,
        api: Arc<dyn SnapshotApi>,
        channel: Arc<dyn EventChannel>,
    ) -> Result<Self, SyncError> {
        let current_user = api.fetch_current_user().await?;
        let users = api.fetch_users().await?;
        let conversations = api.fetch_conversations().await?;

        let mut core = SyncCore::new(current_user.user_id.clone(), settings.typing_timeout());
        core.store.set_users(users);
        let outcome = core.store.load_snapshot(conversations);
        core.store.take_changes();
        info!(
            user_id = %current_user.user_id,
            conversations = outcome.conversations,
            "sync: initial snapshot loaded"
        );

        let bus = routing_table()?;
        let (inputs_tx, inputs_rx) = mpsc::unbounded_channel();
        let (updates_tx, _) = broadcast::channel(UPDATE_BUFFER);
        let initial = ViewSources {
            mode: SyncMode::Connecting,
            current_user: &current_user,
            store: &core.store,
            presence: &core.presence,
            typing: &core.typing,
            receipts: &core.receipts,
            now: Instant::now(),
        }
        .build();
        let (view_tx, view_rx) = watch::channel(Arc::new(initial));

        let actor = SyncActor {
            core,
            bus,
            api,
            channel,
            current_user,
            send_timeout: settings.send_timeout(),
            reconnect_initial_delay: settings.reconnect_initial_delay(),
            reconnect_max_delay: settings.reconnect_max_delay(),
            inputs_tx: inputs_tx.clone(),
            inputs_rx,
            mode: SyncMode::Connecting,
            epoch: 0,
            outbound: None,
            pump: None,
            connect_attempt: None,
            reconnect_attempts: 0,
            gap_start: None,
            queued_sends: VecDeque::new(),
            typing_timers: HashMap::new(),
            view_tx,
            updates_tx: updates_tx.clone(),
        };
        let task = tokio::spawn(actor.run());

        Ok(Self {
            inputs: inputs_tx,
            view: view_rx,
            updates: updates_tx,
            task: Some(task),
        })
    }

    pub fn view(&self) -> Arc<SyncView> {
        Arc::clone(&*self.view.borrow())
    }

    pub fn watch(&self) -> watch::Receiver<Arc<SyncView>> {
        self.view.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncUpdate> {
        self.updates.subscribe()
    }

    /// Echoes a pending entry immediately; delivery continues in the background.
    pub async fn send_message(
        &self,
        conversation_id: &ConversationId,
        text: impl Into<String>,
    ) -> Result<CorrelationId, SyncError> {
        let (reply, response) = oneshot::channel();
        self.command(Command::Send {
            conversation_id: conversation_id.clone(),
            text: text.into(),
            reply,
        })?;
        response.await.map_err(|_| SyncError::EngineStopped)?
    }

    /// Re-sends a failed message under a fresh correlation id, which is returned.
    pub async fn retry_send(&self, failed: &CorrelationId) -> Result<CorrelationId, SyncError> {
        let (reply, response) = oneshot::channel();
        self.command(Command::Retry {
            failed: failed.clone(),
            reply,
        })?;
        response.await.map_err(|_| SyncError::EngineStopped)?
    }

    pub async fn start_conversation(
        &self,
        user_id: &UserId,
        text: impl Into<String>,
    ) -> Result<ConversationId, SyncError> {
        let (reply, response) = oneshot::channel();
        self.command(Command::StartConversation {
            user_id: user_id.clone(),
            text: text.into(),
            reply,
        })?;
        response.await.map_err(|_| SyncError::EngineStopped)?
    }

    pub fn mark_seen(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
    ) -> Result<(), SyncError> {
        self.command(Command::MarkSeen {
            conversation_id: conversation_id.clone(),
            message_id: message_id.clone(),
        })
    }

    pub fn mark_conversation_seen(&self, conversation_id: &ConversationId) -> Result<(), SyncError> {
        self.command(Command::MarkConversationSeen {
            conversation_id: conversation_id.clone(),
        })
    }

    pub fn notify_typing(&self, conversation_id: &ConversationId) -> Result<(), SyncError> {
        self.command(Command::Typing {
            conversation_id: conversation_id.clone(),
            active: true,
        })
    }

    pub fn notify_stop_typing(&self, conversation_id: &ConversationId) -> Result<(), SyncError> {
        self.command(Command::Typing {
            conversation_id: conversation_id.clone(),
            active: false,
        })
    }

    pub fn mark_all_read(&self) -> Result<(), SyncError> {
        self.command(Command::MarkAllRead)
    }

    /// Re-fetches conversations and merges them, e.g. after a failed resync.
    pub fn resync(&self) -> Result<(), SyncError> {
        self.command(Command::Resync)
    }

    pub async fn shutdown(mut self) {
        let _ = self.inputs.send(EngineInput::Shutdown);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    fn command(&self, command: Command) -> Result<(), SyncError> {
        self.inputs
            .send(EngineInput::Command(command))
            .map_err(|_| SyncError::EngineStopped)
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        if self.task.is_some() {
            let _ = self.inputs.send(EngineInput::Shutdown);
        }
    }
}

#[cfg(test)]
#[path = "tests/engine_tests.rs"]
mod tests;
