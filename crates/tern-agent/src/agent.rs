// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Stateful agent handle over the run loop.
//!
//! [`Agent`] owns the conversation history, the tool set, and the steering /
//! follow-up queues, and enforces the single-run-at-a-time rule. Its state is
//! updated by observing the run's own event stream (history grows on
//! `message_end`), so the terminal result and the observed events can never
//! disagree.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tern_model::{
    AbortSignal, Message, Model, ReasoningEffort, StreamFn, UserContent, UserContentBlock,
    UserMessage, now_ms,
};

use crate::agent_loop::{agent_loop, agent_loop_continue, AgentConfig, AgentContext, ApiKeyResolver};
use crate::error::AgentError;
use crate::events::{AgentEvent, AgentStream};
use crate::queue::{MessageQueue, QueueMode};
use crate::tool::AgentTool;

#[derive(Default)]
struct AgentShared {
    messages: Mutex<Vec<Message>>,
    /// The message currently streaming, if any.
    stream_message: Mutex<Option<Message>>,
    error: Mutex<Option<String>>,
    is_streaming: AtomicBool,
}

pub struct Agent {
    shared: Arc<AgentShared>,
    model: Model,
    system_prompt: Option<String>,
    tools: Vec<Arc<dyn AgentTool>>,
    thinking_level: Option<ReasoningEffort>,
    steering: Arc<MessageQueue>,
    follow_up: Arc<MessageQueue>,
    stream_fn: Option<StreamFn>,
    api_key: Option<String>,
    resolve_api_key: Option<ApiKeyResolver>,
    headers: Option<HashMap<String, String>>,
    max_tokens: Option<u32>,
    temperature: Option<f32>,
    thinking_budgets: Option<HashMap<ReasoningEffort, u32>>,
    session_id: Option<String>,
    signal: Mutex<Option<AbortSignal>>,
}

impl Agent {
    pub fn new(model: Model) -> Self {
        Self {
            shared: Arc::new(AgentShared::default()),
            model,
            system_prompt: None,
            tools: Vec::new(),
            thinking_level: None,
            steering: Arc::new(MessageQueue::new(QueueMode::All)),
            follow_up: Arc::new(MessageQueue::new(QueueMode::All)),
            stream_fn: None,
            api_key: None,
            resolve_api_key: None,
            headers: None,
            max_tokens: None,
            temperature: None,
            thinking_budgets: None,
            session_id: None,
            signal: Mutex::new(None),
        }
    }

    // ── Configuration ─────────────────────────────────────────────────────────

    pub fn set_system_prompt(&mut self, prompt: impl Into<String>) {
        self.system_prompt = Some(prompt.into());
    }

    pub fn set_model(&mut self, model: Model) {
        self.model = model;
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn set_tools(&mut self, tools: Vec<Arc<dyn AgentTool>>) {
        self.tools = tools;
    }

    pub fn set_thinking_level(&mut self, level: Option<ReasoningEffort>) {
        self.thinking_level = level;
    }

    pub fn thinking_level(&self) -> Option<ReasoningEffort> {
        self.thinking_level
    }

    pub fn set_session_id(&mut self, session_id: impl Into<String>) {
        self.session_id = Some(session_id.into());
    }

    pub fn set_api_key(&mut self, api_key: impl Into<String>) {
        self.api_key = Some(api_key.into());
    }

    pub fn set_api_key_resolver(&mut self, resolver: ApiKeyResolver) {
        self.resolve_api_key = Some(resolver);
    }

    pub fn set_headers(&mut self, headers: HashMap<String, String>) {
        self.headers = Some(headers);
    }

    pub fn set_max_tokens(&mut self, max_tokens: u32) {
        self.max_tokens = Some(max_tokens);
    }

    pub fn set_temperature(&mut self, temperature: f32) {
        self.temperature = Some(temperature);
    }

    pub fn set_thinking_budgets(&mut self, budgets: HashMap<ReasoningEffort, u32>) {
        self.thinking_budgets = Some(budgets);
    }

    /// Override the provider stream factory (tests, custom transports).
    pub fn set_stream_fn(&mut self, stream_fn: StreamFn) {
        self.stream_fn = Some(stream_fn);
    }

    /// Replace both queues, choosing their delivery modes.
    pub fn set_queue_modes(&mut self, steering: QueueMode, follow_up: QueueMode) {
        self.steering = Arc::new(MessageQueue::new(steering));
        self.follow_up = Arc::new(MessageQueue::new(follow_up));
    }

    // ── State ─────────────────────────────────────────────────────────────────

    pub fn messages(&self) -> Vec<Message> {
        self.shared.messages.lock().unwrap().clone()
    }

    /// Replace the history. Only meaningful between runs; the active run
    /// keeps operating on its own snapshot.
    pub fn replace_messages(&self, messages: Vec<Message>) {
        *self.shared.messages.lock().unwrap() = messages;
    }

    pub fn append_message(&self, message: Message) {
        self.shared.messages.lock().unwrap().push(message);
    }

    pub fn clear_messages(&self) {
        self.shared.messages.lock().unwrap().clear();
    }

    pub fn is_streaming(&self) -> bool {
        self.shared.is_streaming.load(Ordering::Acquire)
    }

    /// Error message of the most recent failed turn, if any.
    pub fn error(&self) -> Option<String> {
        self.shared.error.lock().unwrap().clone()
    }

    /// The message currently being streamed, if a run is active.
    pub fn stream_message(&self) -> Option<Message> {
        self.shared.stream_message.lock().unwrap().clone()
    }

    // ── Steering / follow-up ──────────────────────────────────────────────────

    /// Queue a message for injection into the *current* run at its next safe
    /// point.
    pub fn steer(&self, message: Message) {
        self.steering.push(message);
    }

    /// Queue a message to start the next turn if the current run ends
    /// without tool calls.
    pub fn follow_up(&self, message: Message) {
        self.follow_up.push(message);
    }

    /// Cancel the active run. No-op when idle.
    pub fn abort(&self) {
        if let Some(signal) = &*self.signal.lock().unwrap() {
            signal.set();
        }
    }

    // ── Runs ──────────────────────────────────────────────────────────────────

    /// Start a run from a plain text prompt.
    pub fn send(&self, text: impl Into<String>) -> Result<AgentStream, AgentError> {
        self.send_messages(vec![Message::user(text.into())])
    }

    /// Start a run from a text prompt plus attached images.
    pub fn send_with_images(
        &self,
        text: impl Into<String>,
        images: Vec<UserContentBlock>,
    ) -> Result<AgentStream, AgentError> {
        let mut blocks = vec![UserContentBlock::text(text.into())];
        blocks.extend(images);
        self.send_messages(vec![Message::User(UserMessage {
            content: UserContent::Blocks(blocks),
            timestamp: Some(now_ms()),
        })])
    }

    /// Start a run from pre-built prompt messages.
    pub fn send_messages(&self, prompts: Vec<Message>) -> Result<AgentStream, AgentError> {
        self.run(Some(prompts))
    }

    /// Continue from the existing history without a new prompt.
    pub fn continue_run(&self) -> Result<AgentStream, AgentError> {
        let messages = self.shared.messages.lock().unwrap();
        if messages.is_empty() {
            return Err(AgentError::EmptyContext);
        }
        if matches!(messages.last(), Some(Message::Assistant(_))) {
            return Err(AgentError::ContinueFromAssistant);
        }
        drop(messages);
        self.run(None)
    }

    fn run(&self, prompts: Option<Vec<Message>>) -> Result<AgentStream, AgentError> {
        if self
            .shared
            .is_streaming
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(AgentError::AlreadyStreaming);
        }
        *self.shared.error.lock().unwrap() = None;
        *self.shared.stream_message.lock().unwrap() = None;

        let signal = AbortSignal::new();
        *self.signal.lock().unwrap() = Some(signal.clone());

        let context = AgentContext {
            system_prompt: self.system_prompt.clone(),
            messages: self.shared.messages.lock().unwrap().clone(),
            tools: self.tools.clone(),
        };
        let config = AgentConfig {
            model: self.model.clone(),
            api_key: self.api_key.clone(),
            resolve_api_key: self.resolve_api_key.clone(),
            headers: self.headers.clone(),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            reasoning: self.thinking_level,
            thinking_budgets: self.thinking_budgets.clone(),
            session_id: self.session_id.clone(),
            on_payload: None,
            signal: Some(signal),
            max_retry_delay_ms: None,
            transform_context: None,
            stream_fn: self.stream_fn.clone(),
            steering: Some(Arc::clone(&self.steering)),
            follow_up: Some(Arc::clone(&self.follow_up)),
        };

        let base = match prompts {
            Some(prompts) => agent_loop(prompts, context, config),
            None => match agent_loop_continue(context, config) {
                Ok(stream) => stream,
                Err(err) => {
                    self.shared.is_streaming.store(false, Ordering::Release);
                    return Err(err);
                }
            },
        };

        let (out_tx, out_stream) = tern_model::event_stream();
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            let mut base = base;
            while let Some(event) = base.next().await {
                apply_event(&shared, &event);
                out_tx.push(event);
            }
            shared.is_streaming.store(false, Ordering::Release);
            *shared.stream_message.lock().unwrap() = None;
            let messages = shared.messages.lock().unwrap().clone();
            out_tx.end(Some(messages));
        });
        Ok(out_stream)
    }
}

fn apply_event(shared: &AgentShared, event: &AgentEvent) {
    match event {
        AgentEvent::MessageStart { message } | AgentEvent::MessageUpdate { message, .. } => {
            *shared.stream_message.lock().unwrap() = Some(message.clone());
        }
        AgentEvent::MessageEnd { message } => {
            *shared.stream_message.lock().unwrap() = None;
            shared.messages.lock().unwrap().push(message.clone());
        }
        AgentEvent::TurnEnd { message, .. } => {
            if let Message::Assistant(assistant) = message {
                if let Some(error) = &assistant.error_message {
                    *shared.error.lock().unwrap() = Some(error.clone());
                }
            }
        }
        AgentEvent::AgentEnd { .. } => {
            shared.is_streaming.store(false, Ordering::Release);
        }
        _ => {}
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
