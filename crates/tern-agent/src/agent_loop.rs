// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The turn-scheduling state machine.
//!
//! A run alternates between streaming one assistant response and executing
//! the tool calls it requested, until a turn produces no tool calls and no
//! queued input remains. Steering messages preempt the *remaining* calls of
//! a tool batch (never the one in flight); follow-up messages start a fresh
//! turn only when a turn ends tool-free.
//!
//! Ordering contract: the run's message list is updated *before* the
//! corresponding event is pushed, tool calls execute strictly one at a time,
//! and the stream always terminates through `agent_end` — provider errors
//! and cancellation arrive as an assistant message with a terminal stop
//! reason, not as a failure of the stream itself.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;

use tern_model::provider::PayloadObserver;
use tern_model::{
    stream_simple, validate_tool_arguments, AbortSignal, AssistantMessage, Context, Message, Model,
    ProviderEvent, ReasoningEffort, SimpleStreamOptions, StopReason, StreamFn, StreamOptions, Tool,
    ToolCallBlock, ToolResultMessage, now_ms,
};

use crate::error::AgentError;
use crate::events::{AgentEvent, AgentSender, AgentStream};
use crate::queue::MessageQueue;
use crate::tool::{to_tool, AgentTool, ToolOutput};

/// Synthetic result text for tool calls preempted by steering.
pub const SKIPPED_BY_STEERING: &str = "Skipped due to queued user message.";

/// The conversation a run operates on.
pub struct AgentContext {
    pub system_prompt: Option<String>,
    pub messages: Vec<Message>,
    pub tools: Vec<Arc<dyn AgentTool>>,
}

/// Optional hook that rewrites the message list before each provider call
/// (context compaction, cross-provider cleanup beyond the built-in one, …).
pub type ContextTransform = Arc<dyn Fn(Vec<Message>) -> Vec<Message> + Send + Sync>;

/// Resolves an API key for a provider id at stream time.
pub type ApiKeyResolver = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Everything a run needs besides the conversation itself.
#[derive(Clone)]
pub struct AgentConfig {
    pub model: Model,
    pub api_key: Option<String>,
    pub resolve_api_key: Option<ApiKeyResolver>,
    pub headers: Option<HashMap<String, String>>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub reasoning: Option<ReasoningEffort>,
    pub thinking_budgets: Option<HashMap<ReasoningEffort, u32>>,
    pub session_id: Option<String>,
    pub on_payload: Option<PayloadObserver>,
    pub signal: Option<AbortSignal>,
    pub max_retry_delay_ms: Option<u64>,
    pub transform_context: Option<ContextTransform>,
    /// Override for tests and custom transports; defaults to the built-in
    /// provider dispatch.
    pub stream_fn: Option<StreamFn>,
    pub steering: Option<Arc<MessageQueue>>,
    pub follow_up: Option<Arc<MessageQueue>>,
}

impl AgentConfig {
    pub fn new(model: Model) -> Self {
        Self {
            model,
            api_key: None,
            resolve_api_key: None,
            headers: None,
            max_tokens: None,
            temperature: None,
            reasoning: None,
            thinking_budgets: None,
            session_id: None,
            on_payload: None,
            signal: None,
            max_retry_delay_ms: None,
            transform_context: None,
            stream_fn: None,
            steering: None,
            follow_up: None,
        }
    }
}

/// Start a run with `prompts` as the first turn's user input.
pub fn agent_loop(prompts: Vec<Message>, context: AgentContext, config: AgentConfig) -> AgentStream {
    let (tx, stream) = tern_model::event_stream();
    tokio::spawn(async move {
        let mut ctx = context;
        let mut new_messages: Vec<Message> = Vec::new();

        tx.push(AgentEvent::AgentStart);
        tx.push(AgentEvent::TurnStart);
        for prompt in prompts {
            ctx.messages.push(prompt.clone());
            new_messages.push(prompt.clone());
            tx.push(AgentEvent::MessageStart { message: prompt.clone() });
            tx.push(AgentEvent::MessageEnd { message: prompt });
        }

        run_loop(ctx, new_messages, config, tx).await;
    });
    stream
}

/// Resume a run from the existing context without new prompts. The context
/// must be non-empty and must not end with an assistant message.
pub fn agent_loop_continue(context: AgentContext, config: AgentConfig) -> Result<AgentStream, AgentError> {
    if context.messages.is_empty() {
        return Err(AgentError::EmptyContext);
    }
    if matches!(context.messages.last(), Some(Message::Assistant(_))) {
        return Err(AgentError::ContinueFromAssistant);
    }

    let (tx, stream) = tern_model::event_stream();
    tokio::spawn(async move {
        tx.push(AgentEvent::AgentStart);
        tx.push(AgentEvent::TurnStart);
        run_loop(context, Vec::new(), config, tx).await;
    });
    Ok(stream)
}

fn poll_queue(queue: &Option<Arc<MessageQueue>>) -> Vec<Message> {
    queue.as_ref().map(|q| q.poll()).unwrap_or_default()
}

async fn run_loop(
    mut ctx: AgentContext,
    mut new_messages: Vec<Message>,
    config: AgentConfig,
    tx: AgentSender,
) {
    let mut first_turn = true;
    // Steering queued before the run starts joins the first turn's prompts.
    let mut pending = poll_queue(&config.steering);

    loop {
        let mut has_more_tool_calls = true;

        while has_more_tool_calls || !pending.is_empty() {
            if !first_turn {
                tx.push(AgentEvent::TurnStart);
            } else {
                first_turn = false;
            }

            for message in pending.drain(..) {
                ctx.messages.push(message.clone());
                new_messages.push(message.clone());
                tx.push(AgentEvent::MessageStart { message: message.clone() });
                tx.push(AgentEvent::MessageEnd { message });
            }

            let assistant = stream_assistant(&mut ctx, &config, &tx).await;
            new_messages.push(Message::Assistant(assistant.clone()));

            if assistant.stop_reason.is_terminal_error() {
                tx.push(AgentEvent::TurnEnd {
                    message: Message::Assistant(assistant),
                    tool_results: Vec::new(),
                });
                tx.push(AgentEvent::AgentEnd { messages: new_messages.clone() });
                tx.end(Some(new_messages));
                return;
            }

            let tool_calls: Vec<ToolCallBlock> = assistant.tool_calls().cloned().collect();
            has_more_tool_calls = !tool_calls.is_empty();

            let mut steering_after_tools = None;
            let mut tool_results = Vec::new();
            if has_more_tool_calls {
                let outcome =
                    execute_tool_calls(&mut ctx, &mut new_messages, &tool_calls, &config, &tx).await;
                tool_results = outcome.results;
                steering_after_tools = outcome.steering;
            }

            tx.push(AgentEvent::TurnEnd { message: Message::Assistant(assistant), tool_results });

            pending = match steering_after_tools {
                Some(messages) => messages,
                None => poll_queue(&config.steering),
            };
        }

        // Follow-up only starts a new turn when the run would otherwise end.
        let follow_up = poll_queue(&config.follow_up);
        if !follow_up.is_empty() {
            pending = follow_up;
            continue;
        }
        break;
    }

    tx.push(AgentEvent::AgentEnd { messages: new_messages.clone() });
    tx.end(Some(new_messages));
}

/// Stream one assistant response into the context.
///
/// The provider's partial occupies a slot in the message list while it
/// grows; the finalized message replaces that slot on `done` / `error`.
async fn stream_assistant(
    ctx: &mut AgentContext,
    config: &AgentConfig,
    tx: &AgentSender,
) -> AssistantMessage {
    let api_key = config
        .api_key
        .clone()
        .or_else(|| config.resolve_api_key.as_ref().and_then(|f| f(&config.model.provider)));

    let mut messages = ctx.messages.clone();
    if let Some(transform) = &config.transform_context {
        messages = transform(messages);
    }

    let llm_context = Context {
        system_prompt: ctx.system_prompt.clone(),
        messages,
        tools: if ctx.tools.is_empty() {
            None
        } else {
            Some(ctx.tools.iter().map(|t| to_tool(t.as_ref())).collect())
        },
    };

    let options = SimpleStreamOptions {
        base: StreamOptions {
            api_key,
            headers: config.headers.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            signal: config.signal.clone(),
            session_id: config.session_id.clone(),
            on_payload: config.on_payload.clone(),
            cache_retention: None,
            max_retry_delay_ms: config.max_retry_delay_ms,
        },
        reasoning: config.reasoning,
        thinking_budgets: config.thinking_budgets.clone(),
        tool_choice: None,
    };

    let mut response = match &config.stream_fn {
        Some(factory) => factory(&config.model, llm_context, options),
        None => stream_simple(&config.model, llm_context, options),
    };

    let mut slot: Option<usize> = None;
    while let Some(event) = response.next().await {
        match &event {
            ProviderEvent::Start { partial } => {
                ctx.messages.push(Message::Assistant(partial.clone()));
                slot = Some(ctx.messages.len() - 1);
                tx.push(AgentEvent::MessageStart { message: Message::Assistant(partial.clone()) });
            }
            ProviderEvent::Done { .. } | ProviderEvent::Error { .. } => {
                let final_message = match response.result().await {
                    Ok(message) => message,
                    Err(_) => event.message().clone(),
                };
                match slot {
                    Some(index) => ctx.messages[index] = Message::Assistant(final_message.clone()),
                    None => {
                        ctx.messages.push(Message::Assistant(final_message.clone()));
                        tx.push(AgentEvent::MessageStart {
                            message: Message::Assistant(final_message.clone()),
                        });
                    }
                }
                tx.push(AgentEvent::MessageEnd { message: Message::Assistant(final_message.clone()) });
                return final_message;
            }
            _ => {
                if let Some(index) = slot {
                    let partial = event.message().clone();
                    ctx.messages[index] = Message::Assistant(partial.clone());
                    tx.push(AgentEvent::MessageUpdate {
                        event: event.clone(),
                        message: Message::Assistant(partial),
                    });
                }
            }
        }
    }

    // A well-behaved stream always ends via done/error; tolerate one that
    // closed early by synthesizing an errored assistant message.
    match response.result().await {
        Ok(message) => message,
        Err(err) => {
            warn!(%err, "provider stream closed without a terminal event");
            let mut message = AssistantMessage::partial(&config.model);
            message.stop_reason = StopReason::Error;
            message.error_message = Some("provider stream closed without a result".into());
            ctx.messages.push(Message::Assistant(message.clone()));
            tx.push(AgentEvent::MessageStart { message: Message::Assistant(message.clone()) });
            tx.push(AgentEvent::MessageEnd { message: Message::Assistant(message.clone()) });
            message
        }
    }
}

struct ToolExecutionOutcome {
    results: Vec<ToolResultMessage>,
    steering: Option<Vec<Message>>,
}

/// Run the turn's tool calls strictly in order.
///
/// After each call the steering queue is polled; queued input preempts the
/// remaining calls of the batch with synthetic skip results. The in-flight
/// call is never interrupted by steering (only by the abort signal, which
/// the tool itself observes).
async fn execute_tool_calls(
    ctx: &mut AgentContext,
    new_messages: &mut Vec<Message>,
    tool_calls: &[ToolCallBlock],
    config: &AgentConfig,
    tx: &AgentSender,
) -> ToolExecutionOutcome {
    let tool_schemas: Vec<Tool> = ctx.tools.iter().map(|t| to_tool(t.as_ref())).collect();
    let mut results: Vec<ToolResultMessage> = Vec::new();
    let mut steering: Option<Vec<Message>> = None;

    for (index, call) in tool_calls.iter().enumerate() {
        tx.push(AgentEvent::ToolExecutionStart {
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            args: call.arguments.clone(),
        });

        let tool = ctx.tools.iter().find(|t| t.name() == call.name).cloned();
        let (output, is_error) = match tool {
            None => (ToolOutput::text(format!("Tool {} not found", call.name)), true),
            Some(tool) => match validate_tool_arguments(&tool_schemas, call) {
                Err(err) => (ToolOutput::text(err.to_string()), true),
                Ok(args) => {
                    let update_tx = tx.clone();
                    let (id, name, call_args) =
                        (call.id.clone(), call.name.clone(), call.arguments.clone());
                    let on_update = move |partial: ToolOutput| {
                        update_tx.push(AgentEvent::ToolExecutionUpdate {
                            tool_call_id: id.clone(),
                            tool_name: name.clone(),
                            args: call_args.clone(),
                            partial,
                        });
                    };
                    match tool.execute(&call.id, args, config.signal.clone(), &on_update).await {
                        Ok(output) => (output, false),
                        Err(err) => (ToolOutput::text(err.to_string()), true),
                    }
                }
            },
        };

        tx.push(AgentEvent::ToolExecutionEnd {
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            result: output.clone(),
            is_error,
        });

        let result = ToolResultMessage {
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            content: output.content,
            details: output.details,
            is_error,
            timestamp: now_ms(),
        };
        ctx.messages.push(Message::ToolResult(result.clone()));
        new_messages.push(Message::ToolResult(result.clone()));
        tx.push(AgentEvent::MessageStart { message: Message::ToolResult(result.clone()) });
        tx.push(AgentEvent::MessageEnd { message: Message::ToolResult(result.clone()) });
        results.push(result);

        let queued = poll_queue(&config.steering);
        if !queued.is_empty() {
            steering = Some(queued);
            for skipped in &tool_calls[index + 1..] {
                let result = skip_tool_call(skipped, tx);
                ctx.messages.push(Message::ToolResult(result.clone()));
                new_messages.push(Message::ToolResult(result.clone()));
                tx.push(AgentEvent::MessageStart { message: Message::ToolResult(result.clone()) });
                tx.push(AgentEvent::MessageEnd { message: Message::ToolResult(result.clone()) });
                results.push(result);
            }
            break;
        }
    }

    ToolExecutionOutcome { results, steering }
}

/// Synthetic error result for a call preempted by steering, with a matched
/// start/end event pair so consumers see a complete execution record.
fn skip_tool_call(call: &ToolCallBlock, tx: &AgentSender) -> ToolResultMessage {
    let output = ToolOutput::text(SKIPPED_BY_STEERING);
    tx.push(AgentEvent::ToolExecutionStart {
        tool_call_id: call.id.clone(),
        tool_name: call.name.clone(),
        args: call.arguments.clone(),
    });
    tx.push(AgentEvent::ToolExecutionEnd {
        tool_call_id: call.id.clone(),
        tool_name: call.name.clone(),
        result: output.clone(),
        is_error: true,
    });
    ToolResultMessage {
        tool_call_id: call.id.clone(),
        tool_name: call.name.clone(),
        content: output.content,
        details: None,
        is_error: true,
        timestamp: now_ms(),
    }
}
