//! The conversation orchestrator: turns inbound `channel.message`
//! events into LLM turns.
//!
//! One worker task per session key. Workers are spawned lazily when
//! the first message for a session arrives, drain a bounded queue,
//! and exit after an idle TTL. Within a session turns are strictly
//! serialized; across sessions they run in parallel. Overflow drops
//! the message and emits `conversation.error`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use pv_domain::chat::{ChatMessage, Role};
use pv_domain::error::{Error, Result};
use pv_domain::tool::PendingConfirmation;
use pv_events::{EventBus, EventType};
use pv_memory::MemoryService;
use pv_providers::{ChatClient, ChatOptions};
use pv_sessions::SessionStore;
use pv_tools::{ToolContext, ToolService};

use crate::channels::ChannelRegistry;
use crate::config_service::ConfigService;
use crate::metrics::Metrics;

use super::chat_loop::{run_chat_loop, ChatLoopOutcome};
use super::recall_gate::RecallGate;

#[derive(Debug, Clone)]
struct QueueItem {
    session_id: String,
    user_id: String,
    content: String,
    channel: String,
    turn_id: String,
    attempt: u32,
}

struct SessionQueue {
    sender: mpsc::Sender<QueueItem>,
    capacity: usize,
}

pub struct Orchestrator {
    bus: Arc<EventBus>,
    sessions: Arc<SessionStore>,
    memory: Arc<MemoryService>,
    config: Arc<ConfigService>,
    chat: Arc<dyn ChatClient>,
    tools: Arc<ToolService>,
    channels: Arc<ChannelRegistry>,
    metrics: Arc<Metrics>,
    recall: RecallGate,
    queues: Mutex<HashMap<String, SessionQueue>>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bus: Arc<EventBus>,
        sessions: Arc<SessionStore>,
        memory: Arc<MemoryService>,
        config: Arc<ConfigService>,
        chat: Arc<dyn ChatClient>,
        tools: Arc<ToolService>,
        channels: Arc<ChannelRegistry>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let recall = RecallGate::new(chat.clone(), memory.clone());
        Self {
            bus,
            sessions,
            memory,
            config,
            chat,
            tools,
            channels,
            metrics,
            recall,
            queues: Mutex::new(HashMap::new()),
        }
    }

    pub fn recall_gate(&self) -> &RecallGate {
        &self.recall
    }

    /// Register the channel-message listener on the bus.
    pub fn subscribe(self: &Arc<Self>) {
        let this = self.clone();
        self.bus
            .on(EventType::ChannelMessage, "conversation-service", move |record| {
                let this = this.clone();
                async move {
                    this.on_channel_message(record.payload).await;
                }
            });
        tracing::debug!("orchestrator subscribed to event bus");
    }

    async fn on_channel_message(self: Arc<Self>, payload: Value) {
        let content = payload
            .get("content")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let sender = payload
            .get("sender")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let channel = payload
            .get("channel")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if content.is_empty() {
            return;
        }

        let session_id = format!("{channel}_{sender}");
        let user_id = sender;
        let item = QueueItem {
            session_id: session_id.clone(),
            user_id: user_id.clone(),
            content: content.clone(),
            channel: channel.clone(),
            turn_id: uuid::Uuid::new_v4().to_string(),
            attempt: 0,
        };

        if !self.enqueue(item) {
            tracing::warn!(session_id = %session_id, "session queue full, dropping message");
            self.bus
                .emit(
                    EventType::ConversationError,
                    serde_json::json!({
                        "session_id": session_id,
                        "user_id": user_id,
                        "error": "session queue is full",
                    }),
                )
                .await;
            return;
        }

        self.bus
            .emit(
                EventType::ConversationStart,
                serde_json::json!({
                    "session_id": session_id,
                    "user_id": user_id,
                    "channel": channel,
                    "content": content,
                    "queued": true,
                }),
            )
            .await;
    }

    /// Put a message on the session queue, lazily spawning the
    /// worker. Returns false on overflow; the message is dropped.
    fn enqueue(self: &Arc<Self>, item: QueueItem) -> bool {
        let key = item.session_id.clone();
        let policy = self.config.processing_policy(Some(&item.user_id));
        let mut recreated = false;

        loop {
            let sender = {
                let mut queues = self.queues.lock();
                let existing = queues.get(&key).map(|queue| queue.sender.clone());
                match existing {
                    Some(sender) => sender,
                    None => {
                        let (tx, rx) = mpsc::channel(policy.max_queue_size);
                        queues.insert(
                            key.clone(),
                            SessionQueue {
                                sender: tx.clone(),
                                capacity: policy.max_queue_size,
                            },
                        );
                        let this = self.clone();
                        let worker_key = key.clone();
                        let worker_policy = policy.clone();
                        tokio::spawn(async move {
                            this.session_worker(worker_key, rx, worker_policy).await;
                        });
                        tx
                    }
                }
            };

            return match sender.try_send(item.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => false,
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    // The worker just retired; replace the queue once.
                    self.queues.lock().remove(&key);
                    if recreated {
                        false
                    } else {
                        recreated = true;
                        continue;
                    }
                }
            };
        }
    }

    /// One long-running task per session key: drain the queue, exit
    /// after the idle TTL.
    async fn session_worker(
        self: Arc<Self>,
        key: String,
        mut rx: mpsc::Receiver<QueueItem>,
        policy: pv_domain::config::ProcessingConfig,
    ) {
        tracing::debug!(session = %key, "session worker started");
        let idle_ttl = Duration::from_secs_f64(policy.worker_idle_ttl_s);

        loop {
            match tokio::time::timeout(idle_ttl, rx.recv()).await {
                Ok(Some(item)) => {
                    self.process_with_retry(item, &policy).await;
                }
                Ok(None) => break,
                Err(_elapsed) => {
                    // Retire: deregister first so late senders see a
                    // closed queue, then drain any straggler.
                    self.queues.lock().remove(&key);
                    while let Ok(item) = rx.try_recv() {
                        self.process_with_retry(item, &policy).await;
                    }
                    tracing::debug!(session = %key, "session worker idle, exiting");
                    return;
                }
            }
        }
        self.queues.lock().remove(&key);
    }

    /// Retry with exponential backoff; on final failure abort the
    /// turn and emit the terminal error.
    async fn process_with_retry(
        &self,
        mut item: QueueItem,
        policy: &pv_domain::config::ProcessingConfig,
    ) {
        loop {
            match self.process_once(&item).await {
                Ok(()) => return,
                Err(e) => {
                    if item.attempt >= policy.max_retries {
                        tracing::error!(
                            session_id = %item.session_id,
                            error = %e,
                            "conversation failed after retries"
                        );
                        self.bus
                            .emit(
                                EventType::ConversationError,
                                serde_json::json!({
                                    "session_id": item.session_id,
                                    "user_id": item.user_id,
                                    "error": e.to_string(),
                                    "attempt": item.attempt + 1,
                                    "max_retries": policy.max_retries,
                                    "will_retry": false,
                                }),
                            )
                            .await;
                        self.sessions
                            .abort_turn(&item.session_id, &item.turn_id, &item.user_id);
                        Metrics::incr(&self.metrics.turns_failed);
                        return;
                    }

                    let delay = policy.retry_delay_s(item.attempt);
                    self.bus
                        .emit(
                            EventType::ConversationError,
                            serde_json::json!({
                                "session_id": item.session_id,
                                "user_id": item.user_id,
                                "error": e.to_string(),
                                "attempt": item.attempt + 1,
                                "max_retries": policy.max_retries,
                                "will_retry": true,
                                "retry_delay_s": delay,
                            }),
                        )
                        .await;
                    tracing::warn!(
                        session_id = %item.session_id,
                        attempt = item.attempt + 1,
                        delay_s = delay,
                        "retrying conversation"
                    );
                    tokio::time::sleep(Duration::from_secs_f64(delay)).await;
                    item.attempt += 1;
                }
            }
        }
    }

    /// One turn, start to commit.
    async fn process_once(&self, item: &QueueItem) -> Result<()> {
        let QueueItem {
            session_id,
            user_id,
            content,
            channel,
            turn_id,
            ..
        } = item;

        if !self.sessions.session_exists(session_id, user_id) {
            self.sessions.create_session(Some(session_id), user_id);
        }
        if !self
            .sessions
            .begin_turn(session_id, turn_id, Role::User, content, user_id)
        {
            return Err(Error::TurnConflict {
                session_id: session_id.clone(),
                turn_id: turn_id.clone(),
            });
        }

        let merged = self.config.merged_config(Some(user_id));
        let base_prompt = self.config.system_prompt(Some(user_id));
        let system_prompt = self
            .recall
            .build_system_prompt_with_memory(
                content,
                session_id,
                user_id,
                &base_prompt,
                &merged.memory.gating.recall_filter,
            )
            .await;

        let recent = self.sessions.get_recent_messages(session_id, None, user_id);
        let mut messages = Vec::with_capacity(recent.len() + 2);
        if !system_prompt.is_empty() {
            messages.push(ChatMessage::system(system_prompt));
        }
        messages.extend(recent.into_iter().map(|m| ChatMessage {
            role: m.role,
            content: m.content,
        }));
        messages.push(ChatMessage::user(content.clone()));

        let opts = ChatOptions {
            model: if merged.api.model.is_empty() {
                None
            } else {
                Some(merged.api.model.clone())
            },
            temperature: Some(merged.api.temperature),
            max_tokens: Some(merged.api.max_tokens),
            json_mode: false,
        };
        let ctx = ToolContext {
            session_id: Some(session_id.clone()),
            user_id: Some(user_id.clone()),
            source: Some("channel".into()),
            ..Default::default()
        };

        tracing::info!(session_id = %session_id, "processing conversation");
        Metrics::incr(&self.metrics.llm_calls);
        let outcome = run_chat_loop(
            self.chat.as_ref(),
            &self.tools,
            messages,
            &ctx,
            &opts,
            &Default::default(),
        )
        .await?;

        match outcome {
            ChatLoopOutcome::NeedsConfirmation {
                tool_call_id,
                tool_name,
                args,
                all_tool_calls,
                current_messages,
                content: assistant_content,
            } => {
                // The turn stays pending until the human decides.
                self.sessions.set_pending_confirmation(
                    session_id,
                    PendingConfirmation {
                        tool_call_id: tool_call_id.clone(),
                        tool_name: tool_name.clone(),
                        args: args.clone(),
                        current_messages,
                        pending_tool_calls: all_tool_calls,
                        content: assistant_content,
                        approved_call_ids: vec![],
                    },
                    user_id,
                );
                self.bus
                    .emit(
                        EventType::ConversationComplete,
                        serde_json::json!({
                            "session_id": session_id,
                            "user_id": user_id,
                            "channel": channel,
                            "status": "needs_confirmation",
                            "tool_call_id": tool_call_id,
                            "tool_name": tool_name,
                            "args": args,
                        }),
                    )
                    .await;
                Ok(())
            }
            ChatLoopOutcome::Completed { content: reply } => {
                if !self
                    .sessions
                    .commit_turn(session_id, turn_id, &reply, user_id)
                {
                    return Err(Error::TurnConflict {
                        session_id: session_id.clone(),
                        turn_id: turn_id.clone(),
                    });
                }
                Metrics::incr(&self.metrics.turns_completed);

                self.bus
                    .emit(
                        EventType::ConversationComplete,
                        serde_json::json!({
                            "session_id": session_id,
                            "user_id": user_id,
                            "channel": channel,
                            "response": reply,
                            "response_length": reply.chars().count(),
                            "status": "success",
                        }),
                    )
                    .await;
                self.bus
                    .emit(
                        EventType::InteractionCompleted,
                        serde_json::json!({
                            "session_id": session_id,
                            "user_id": user_id,
                            "channel": channel,
                            "user_input": content,
                            "assistant_output": reply,
                        }),
                    )
                    .await;

                self.channels.dispatch_reply(channel, user_id, &reply).await;
                Ok(())
            }
        }
    }

    /// Queue/worker stats for status and doctor surfaces.
    pub fn stats(&self) -> Value {
        let queues = self.queues.lock();
        let mut queue_sizes = serde_json::Map::new();
        let mut queued_total = 0usize;
        for (key, queue) in queues.iter() {
            let queued = queue.capacity.saturating_sub(queue.sender.capacity());
            queued_total += queued;
            queue_sizes.insert(key.clone(), Value::from(queued));
        }
        serde_json::json!({
            "sessions_with_queue": queues.len(),
            "active_workers": queues.len(),
            "queued_messages": queued_total,
            "queue_sizes": queue_sizes,
        })
    }

    /// The memory service, for handlers that run through the
    /// orchestrator's wiring.
    pub fn memory(&self) -> &Arc<MemoryService> {
        &self.memory
    }
}
