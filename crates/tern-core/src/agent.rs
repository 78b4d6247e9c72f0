// Copyright (c) 2024-2026 Tern Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! The `Agent` façade: owns one conversation's state and drives the loop.
//!
//! All mutation of [`AgentState`] happens on the task calling
//! [`Agent::prompt`] / [`Agent::continue_run`] — the single-writer rule of
//! the runtime.  Queues, subscribers, and the cancel slot live behind an
//! [`AgentHandle`] so other tasks can steer, queue follow-ups, subscribe,
//! and abort while a run is in flight.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use tern_model::{Message, Model, ThinkingBudgets, ThinkingLevel};
use tern_tools::Tool;

use crate::agent_loop::{
    agent_loop, agent_loop_continue, error_assistant_message, AgentContext, AgentLoopConfig,
    ApiKeyFn, StreamFn,
};
use crate::events::AgentEvent;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent is already processing; use steer() or follow_up() to queue messages")]
    AlreadyRunning,
    #[error("no model configured")]
    NoModel,
    #[error("no messages to continue from")]
    NoMessages,
    #[error("cannot continue from message role: assistant")]
    CannotContinueFromAssistant,
}

/// How queued messages are dequeued when the loop asks for them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueMode {
    /// Dequeue the head only; remaining messages wait for the next check.
    #[default]
    OneAtATime,
    /// Drain the whole queue at once.
    AllAtOnce,
}

/// Current state of the agent.  Mutated only by the owning run.
#[derive(Default, Clone)]
pub struct AgentState {
    pub system_prompt: String,
    pub model: Option<Model>,
    pub thinking_level: ThinkingLevel,
    pub tools: Vec<Arc<dyn Tool>>,
    pub messages: Vec<Message>,
    pub is_streaming: bool,
    /// The in-flight streaming message, when one exists.
    pub stream_message: Option<Message>,
    /// Tool calls currently executing or awaiting execution.
    pub pending_tool_calls: HashSet<String>,
    pub error: Option<String>,
}

type Subscriber = Box<dyn Fn(&AgentEvent) + Send + Sync>;

struct Shared {
    steering: Mutex<VecDeque<Message>>,
    follow_up: Mutex<VecDeque<Message>>,
    subscribers: Mutex<HashMap<u64, Subscriber>>,
    next_subscriber_id: AtomicU64,
    cancel: Mutex<Option<CancellationToken>>,
    running: AtomicBool,
    idle: Notify,
}

impl Shared {
    fn new() -> Self {
        Self {
            steering: Mutex::new(VecDeque::new()),
            follow_up: Mutex::new(VecDeque::new()),
            subscribers: Mutex::new(HashMap::new()),
            next_subscriber_id: AtomicU64::new(1),
            cancel: Mutex::new(None),
            running: AtomicBool::new(false),
            idle: Notify::new(),
        }
    }

    fn emit(&self, event: &AgentEvent) {
        let subscribers = self.subscribers.lock().unwrap_or_else(|p| p.into_inner());
        // Registration order; callbacks must not block.
        let mut ordered: Vec<(&u64, &Subscriber)> = subscribers.iter().collect();
        ordered.sort_by_key(|(id, _)| **id);
        for (_, subscriber) in ordered {
            subscriber(event);
        }
    }

    fn dequeue(&self, queue: &Mutex<VecDeque<Message>>, mode: QueueMode) -> Vec<Message> {
        let mut q = queue.lock().unwrap_or_else(|p| p.into_inner());
        match mode {
            QueueMode::OneAtATime => q.pop_front().into_iter().collect(),
            QueueMode::AllAtOnce => q.drain(..).collect(),
        }
    }
}

/// Cloneable handle for interacting with a running agent from other tasks.
#[derive(Clone)]
pub struct AgentHandle {
    shared: Arc<Shared>,
}

impl AgentHandle {
    /// Queue a steering message to preempt the in-flight run.
    pub fn steer(&self, message: Message) {
        self.shared
            .steering
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push_back(message);
    }

    /// Queue a follow-up message for after the agent would go idle.
    pub fn follow_up(&self, message: Message) {
        self.shared
            .follow_up
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push_back(message);
    }

    /// Fire the current run's cancel token.  Does not wait for the run to
    /// unwind; use [`AgentHandle::wait_for_idle`] for that.
    pub fn abort(&self) {
        if let Some(token) = self
            .shared
            .cancel
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
        {
            token.cancel();
        }
    }

    /// Wait until no run is active.
    pub async fn wait_for_idle(&self) {
        loop {
            if !self.shared.running.load(Ordering::SeqCst) {
                return;
            }
            self.shared.idle.notified().await;
        }
    }

    /// Subscribe to agent events.  Returns an idempotent unsubscribe handle.
    pub fn subscribe(&self, f: impl Fn(&AgentEvent) + Send + Sync + 'static) -> Subscription {
        let id = self.shared.next_subscriber_id.fetch_add(1, Ordering::SeqCst);
        self.shared
            .subscribers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(id, Box::new(f));
        Subscription {
            shared: Arc::clone(&self.shared),
            id,
        }
    }
}

/// Handle returned by `subscribe`; unsubscribing twice is a no-op.
pub struct Subscription {
    shared: Arc<Shared>,
    id: u64,
}

impl Subscription {
    pub fn unsubscribe(&self) {
        self.shared
            .subscribers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&self.id);
    }
}

/// Stateful agent orchestrating LLM calls and tool execution.
pub struct Agent {
    state: AgentState,
    shared: Arc<Shared>,
    steering_mode: QueueMode,
    follow_up_mode: QueueMode,
    session_id: Option<String>,
    thinking_budgets: Option<ThinkingBudgets>,
    max_retry_delay_ms: Option<u64>,
    get_api_key: Option<ApiKeyFn>,
    stream_fn: Option<StreamFn>,
}

/// Construction options for [`Agent`].
#[derive(Default)]
pub struct AgentOptions {
    pub steering_mode: QueueMode,
    pub follow_up_mode: QueueMode,
    pub session_id: Option<String>,
    pub thinking_budgets: Option<ThinkingBudgets>,
    pub max_retry_delay_ms: Option<u64>,
    pub get_api_key: Option<ApiKeyFn>,
    /// Provider-call override for tests and wrappers.
    pub stream_fn: Option<StreamFn>,
}

impl Agent {
    pub fn new(options: AgentOptions) -> Self {
        Self {
            state: AgentState::default(),
            shared: Arc::new(Shared::new()),
            steering_mode: options.steering_mode,
            follow_up_mode: options.follow_up_mode,
            session_id: options.session_id,
            thinking_budgets: options.thinking_budgets,
            max_retry_delay_ms: options.max_retry_delay_ms,
            get_api_key: options.get_api_key,
            stream_fn: options.stream_fn,
        }
    }

    pub fn state(&self) -> &AgentState {
        &self.state
    }

    pub fn handle(&self) -> AgentHandle {
        AgentHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    // ── State mutators ────────────────────────────────────────────────────────

    pub fn set_system_prompt(&mut self, prompt: impl Into<String>) {
        self.state.system_prompt = prompt.into();
    }

    pub fn set_model(&mut self, model: Model) {
        self.state.model = Some(model);
    }

    pub fn set_thinking_level(&mut self, level: ThinkingLevel) {
        self.state.thinking_level = level;
    }

    pub fn set_tools(&mut self, tools: Vec<Arc<dyn Tool>>) {
        self.state.tools = tools;
    }

    pub fn set_session_id(&mut self, session_id: Option<String>) {
        self.session_id = session_id;
    }

    pub fn replace_messages(&mut self, messages: Vec<Message>) {
        self.state.messages = messages;
    }

    pub fn append_message(&mut self, message: Message) {
        self.state.messages.push(message);
    }

    /// Reset conversation state and both queues.
    pub fn reset(&mut self) {
        self.state.messages.clear();
        self.state.is_streaming = false;
        self.state.stream_message = None;
        self.state.pending_tool_calls.clear();
        self.state.error = None;
        self.clear_all_queues();
    }

    // ── Queues ────────────────────────────────────────────────────────────────

    pub fn steer(&self, message: Message) {
        self.handle().steer(message);
    }

    pub fn follow_up(&self, message: Message) {
        self.handle().follow_up(message);
    }

    pub fn has_queued_messages(&self) -> bool {
        let steering = self
            .shared
            .steering
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        let follow_up = self
            .shared
            .follow_up
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        !steering.is_empty() || !follow_up.is_empty()
    }

    pub fn clear_all_queues(&self) {
        self.shared
            .steering
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clear();
        self.shared
            .follow_up
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clear();
    }

    pub fn subscribe(&self, f: impl Fn(&AgentEvent) + Send + Sync + 'static) -> Subscription {
        self.handle().subscribe(f)
    }

    pub fn abort(&self) {
        self.handle().abort();
    }

    // ── Runs ──────────────────────────────────────────────────────────────────

    /// Send a prompt and drive the run to completion.
    pub async fn prompt(&mut self, text: impl Into<String>) -> Result<(), AgentError> {
        self.prompt_messages(vec![Message::user(text.into())]).await
    }

    /// Send prompt messages and drive the run to completion.
    pub async fn prompt_messages(&mut self, messages: Vec<Message>) -> Result<(), AgentError> {
        if self.shared.running.load(Ordering::SeqCst) {
            return Err(AgentError::AlreadyRunning);
        }
        self.run(Some(messages), false).await
    }

    /// Continue from the current context — used after retries, compaction,
    /// and for consuming queued messages once idle.
    pub async fn continue_run(&mut self) -> Result<(), AgentError> {
        if self.shared.running.load(Ordering::SeqCst) {
            return Err(AgentError::AlreadyRunning);
        }
        if self.state.messages.is_empty() {
            return Err(AgentError::NoMessages);
        }

        if matches!(self.state.messages.last(), Some(Message::Assistant(_))) {
            let steering = self.shared.dequeue(&self.shared.steering, self.steering_mode);
            if !steering.is_empty() {
                return self.run(Some(steering), true).await;
            }
            let follow_up = self
                .shared
                .dequeue(&self.shared.follow_up, self.follow_up_mode);
            if !follow_up.is_empty() {
                return self.run(Some(follow_up), false).await;
            }
            return Err(AgentError::CannotContinueFromAssistant);
        }

        self.run(None, false).await
    }

    async fn run(
        &mut self,
        messages: Option<Vec<Message>>,
        skip_initial_steering: bool,
    ) -> Result<(), AgentError> {
        let model = self.state.model.clone().ok_or(AgentError::NoModel)?;

        let cancel = CancellationToken::new();
        *self
            .shared
            .cancel
            .lock()
            .unwrap_or_else(|p| p.into_inner()) = Some(cancel.clone());
        self.shared.running.store(true, Ordering::SeqCst);
        self.state.is_streaming = true;
        self.state.stream_message = None;
        self.state.error = None;

        let context = AgentContext {
            system_prompt: self.state.system_prompt.clone(),
            messages: self.state.messages.clone(),
            tools: self.state.tools.clone(),
        };

        let shared = Arc::clone(&self.shared);
        let steering_mode = self.steering_mode;
        // The first steering check is suppressed when the run was started
        // *by* a steering message, which would otherwise be double-consumed.
        let skip = Arc::new(AtomicBool::new(skip_initial_steering));
        let get_steering: crate::agent_loop::MessageSupplier = {
            let shared = Arc::clone(&shared);
            let skip = Arc::clone(&skip);
            Arc::new(move || {
                if skip.swap(false, Ordering::SeqCst) {
                    return Vec::new();
                }
                shared.dequeue(&shared.steering, steering_mode)
            })
        };
        let follow_up_mode = self.follow_up_mode;
        let get_follow_up: crate::agent_loop::MessageSupplier = {
            let shared = Arc::clone(&shared);
            Arc::new(move || shared.dequeue(&shared.follow_up, follow_up_mode))
        };

        let config = AgentLoopConfig {
            model: model.clone(),
            reasoning: match self.state.thinking_level {
                ThinkingLevel::Off => None,
                level => Some(level),
            },
            session_id: self.session_id.clone(),
            thinking_budgets: self.thinking_budgets.clone(),
            max_retry_delay_ms: self.max_retry_delay_ms,
            api_key: None,
            get_api_key: self.get_api_key.clone(),
            get_steering_messages: Some(get_steering),
            get_follow_up_messages: Some(get_follow_up),
            stream_fn: self.stream_fn.clone(),
        };

        let event_stream = match messages {
            Some(messages) => agent_loop(messages, context, config, cancel.clone()),
            None => match agent_loop_continue(context, config, cancel.clone()) {
                Ok(stream) => stream,
                Err(e) => {
                    self.finish_run_with_error(&model, &cancel, &e.to_string());
                    return Ok(());
                }
            },
        };

        let mut saw_agent_end = false;
        while let Some(event) = event_stream.next().await {
            match &event {
                AgentEvent::MessageStart { message } | AgentEvent::MessageUpdate { message, .. } => {
                    self.state.stream_message = Some(message.clone());
                }
                AgentEvent::MessageEnd { message } => {
                    self.state.stream_message = None;
                    self.state.messages.push(message.clone());
                }
                AgentEvent::ToolExecutionStart { tool_call_id, .. } => {
                    self.state.pending_tool_calls.insert(tool_call_id.clone());
                }
                AgentEvent::ToolExecutionEnd { tool_call_id, .. } => {
                    self.state.pending_tool_calls.remove(tool_call_id);
                }
                AgentEvent::TurnEnd { message, .. } => {
                    if let Some(assistant) = message.as_assistant() {
                        if let Some(error) = &assistant.error_message {
                            self.state.error = Some(error.clone());
                        }
                    }
                }
                AgentEvent::AgentEnd { .. } => {
                    saw_agent_end = true;
                    self.state.is_streaming = false;
                    self.state.stream_message = None;
                }
                _ => {}
            }
            self.shared.emit(&event);
        }

        if !saw_agent_end {
            // The loop task died without its terminal event — a bug in the
            // loop.  Surface it as an error message and a clean agent_end so
            // subscribers still observe the state transition.
            self.finish_run_with_error(&model, &cancel, "agent loop ended unexpectedly");
            return Ok(());
        }

        self.clear_run();
        Ok(())
    }

    fn finish_run_with_error(&mut self, model: &Model, cancel: &CancellationToken, error: &str) {
        let message = error_assistant_message(model, cancel, error);
        self.state.error = Some(error.to_string());
        self.state.messages.push(Message::Assistant(message.clone()));
        self.shared.emit(&AgentEvent::AgentEnd {
            messages: vec![Message::Assistant(message)],
        });
        self.clear_run();
    }

    fn clear_run(&mut self) {
        self.state.is_streaming = false;
        self.state.stream_message = None;
        self.state.pending_tool_calls.clear();
        *self
            .shared
            .cancel
            .lock()
            .unwrap_or_else(|p| p.into_inner()) = None;
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.idle.notify_waiters();
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
