// Copyright (c) 2024-2026 Tern Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! The agent loop: turn-structured orchestration of model calls, tool
//! execution, steering, and follow-up messages.
//!
//! Steering messages preempt the run between turns and between tool calls;
//! tools skipped by a preemption receive synthetic error results so the
//! tool_call ↔ tool_result pairing invariant survives.  Follow-up messages
//! are consumed when the loop would otherwise go idle and start another
//! turn.

use std::sync::Arc;

use anyhow::{bail, Result};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use tern_model::{
    now_ms, AssistantMessage, AssistantMessageEvent, AssistantMessageEventStream, Context,
    EventStream, Message, Model, SimpleStreamOptions, StopReason, ThinkingBudgets, ThinkingLevel,
    ToolCallRequest, ToolResultMessage,
};
use tern_tools::{validate_tool_arguments, Tool, ToolResult};

use crate::events::AgentEvent;

/// Stream of agent events; the final result is every message added during
/// the run.
pub type AgentEventStream = EventStream<AgentEvent, Vec<Message>>;

/// Override for the provider call, used by tests and by embedders that wrap
/// providers.
pub type StreamFn = Arc<
    dyn Fn(&Model, Context, SimpleStreamOptions) -> Result<AssistantMessageEventStream>
        + Send
        + Sync,
>;

/// Supplier draining a message queue (steering or follow-up).
pub type MessageSupplier = Arc<dyn Fn() -> Vec<Message> + Send + Sync>;

/// Credential lookup by provider name.
pub type ApiKeyFn = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Context for one run of the loop.
#[derive(Clone, Default)]
pub struct AgentContext {
    pub system_prompt: String,
    pub messages: Vec<Message>,
    pub tools: Vec<Arc<dyn Tool>>,
}

/// Configuration for the agent loop.
#[derive(Clone)]
pub struct AgentLoopConfig {
    pub model: Model,
    pub reasoning: Option<ThinkingLevel>,
    pub session_id: Option<String>,
    pub thinking_budgets: Option<ThinkingBudgets>,
    pub max_retry_delay_ms: Option<u64>,
    pub api_key: Option<String>,
    pub get_api_key: Option<ApiKeyFn>,
    pub get_steering_messages: Option<MessageSupplier>,
    pub get_follow_up_messages: Option<MessageSupplier>,
    pub stream_fn: Option<StreamFn>,
}

impl AgentLoopConfig {
    pub fn new(model: Model) -> Self {
        Self {
            model,
            reasoning: None,
            session_id: None,
            thinking_budgets: None,
            max_retry_delay_ms: None,
            api_key: None,
            get_api_key: None,
            get_steering_messages: None,
            get_follow_up_messages: None,
            stream_fn: None,
        }
    }
}

fn agent_event_stream() -> AgentEventStream {
    EventStream::new(
        |event: &AgentEvent| matches!(event, AgentEvent::AgentEnd { .. }),
        |event: &AgentEvent| match event {
            AgentEvent::AgentEnd { messages } => messages.clone(),
            _ => Vec::new(),
        },
    )
}

/// Start an agent loop with new prompt messages.
pub fn agent_loop(
    prompts: Vec<Message>,
    context: AgentContext,
    config: AgentLoopConfig,
    cancel: CancellationToken,
) -> AgentEventStream {
    let stream = agent_event_stream();
    let out = stream.clone();
    tokio::spawn(async move {
        let mut current = context;
        current.messages.extend(prompts.iter().cloned());

        out.push(AgentEvent::AgentStart);
        out.push(AgentEvent::TurnStart);
        for prompt in &prompts {
            out.push(AgentEvent::MessageStart {
                message: prompt.clone(),
            });
            out.push(AgentEvent::MessageEnd {
                message: prompt.clone(),
            });
        }

        run_loop(current, prompts, config, cancel, out).await;
    });
    stream
}

/// Continue an agent loop from existing context without adding messages.
///
/// Fails when the context is empty or already ends with an assistant
/// message (there is nothing for the model to respond to).
pub fn agent_loop_continue(
    context: AgentContext,
    config: AgentLoopConfig,
    cancel: CancellationToken,
) -> Result<AgentEventStream> {
    if context.messages.is_empty() {
        bail!("cannot continue: no messages in context");
    }
    if matches!(context.messages.last(), Some(Message::Assistant(_))) {
        bail!("cannot continue from message role: assistant");
    }

    let stream = agent_event_stream();
    let out = stream.clone();
    tokio::spawn(async move {
        out.push(AgentEvent::AgentStart);
        out.push(AgentEvent::TurnStart);
        run_loop(context, Vec::new(), config, cancel, out).await;
    });
    Ok(stream)
}

/// Main loop body shared by [`agent_loop`] and [`agent_loop_continue`].
async fn run_loop(
    mut context: AgentContext,
    mut new_messages: Vec<Message>,
    config: AgentLoopConfig,
    cancel: CancellationToken,
    stream: AgentEventStream,
) {
    let mut first_turn = true;
    let mut pending_messages = drain(&config.get_steering_messages);

    'outer: loop {
        let mut has_more_tool_calls = true;

        while has_more_tool_calls || !pending_messages.is_empty() {
            if !first_turn {
                stream.push(AgentEvent::TurnStart);
            } else {
                first_turn = false;
            }

            for message in pending_messages.drain(..) {
                stream.push(AgentEvent::MessageStart {
                    message: message.clone(),
                });
                stream.push(AgentEvent::MessageEnd {
                    message: message.clone(),
                });
                context.messages.push(message.clone());
                new_messages.push(message);
            }

            let message = stream_assistant_response(&mut context, &config, &cancel, &stream).await;
            new_messages.push(Message::Assistant(message.clone()));

            if message.stop_reason.is_failure() {
                stream.push(AgentEvent::TurnEnd {
                    message: Message::Assistant(message),
                    tool_results: Vec::new(),
                });
                stream.push(AgentEvent::AgentEnd {
                    messages: new_messages.clone(),
                });
                stream.end(Some(new_messages));
                return;
            }

            let tool_calls = message.tool_calls();
            has_more_tool_calls = !tool_calls.is_empty();

            let mut tool_results: Vec<ToolResultMessage> = Vec::new();
            let mut steering_after_tools: Vec<Message> = Vec::new();
            if has_more_tool_calls {
                let execution = execute_tool_calls(
                    &context.tools,
                    &tool_calls,
                    &cancel,
                    &stream,
                    &config.get_steering_messages,
                )
                .await;
                for result in &execution.results {
                    context.messages.push(Message::ToolResult(result.clone()));
                    new_messages.push(Message::ToolResult(result.clone()));
                }
                tool_results = execution.results;
                steering_after_tools = execution.steering_messages;
            }

            stream.push(AgentEvent::TurnEnd {
                message: Message::Assistant(message),
                tool_results,
            });

            pending_messages = if steering_after_tools.is_empty() {
                drain(&config.get_steering_messages)
            } else {
                steering_after_tools
            };
        }

        let follow_up = drain(&config.get_follow_up_messages);
        if !follow_up.is_empty() {
            pending_messages = follow_up;
            continue 'outer;
        }
        break;
    }

    stream.push(AgentEvent::AgentEnd {
        messages: new_messages.clone(),
    });
    stream.end(Some(new_messages));
}

fn drain(supplier: &Option<MessageSupplier>) -> Vec<Message> {
    supplier.as_ref().map(|f| f()).unwrap_or_default()
}

/// Call the provider and relay its events, returning the final assistant
/// message.  Every failure — including a missing adapter — comes back as an
/// error-annotated message rather than an error.
async fn stream_assistant_response(
    context: &mut AgentContext,
    config: &AgentLoopConfig,
    cancel: &CancellationToken,
    stream: &AgentEventStream,
) -> AssistantMessage {
    let llm_context = Context {
        system_prompt: if context.system_prompt.is_empty() {
            None
        } else {
            Some(context.system_prompt.clone())
        },
        messages: context.messages.clone(),
        tools: context
            .tools
            .iter()
            .map(|t| tern_model::ToolSchema {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters(),
            })
            .collect(),
    };

    let api_key = config
        .get_api_key
        .as_ref()
        .and_then(|f| f(&config.model.provider))
        .or_else(|| config.api_key.clone());

    let options = SimpleStreamOptions {
        api_key,
        session_id: config.session_id.clone(),
        max_retry_delay_ms: config.max_retry_delay_ms,
        cancel: Some(cancel.clone()),
        reasoning: config.reasoning.filter(|l| *l != ThinkingLevel::Off),
        thinking_budgets: config.thinking_budgets.clone(),
        ..SimpleStreamOptions::default()
    };

    let response = match &config.stream_fn {
        Some(f) => f(&config.model, llm_context, options),
        None => tern_model::stream_simple(&config.model, llm_context, options),
    };
    let response = match response {
        Ok(r) => r,
        Err(e) => {
            // No adapter for the model's api: materialise the failure as an
            // error message so the run still ends with agent_end.
            let message = error_assistant_message(&config.model, cancel, &e.to_string());
            context.messages.push(Message::Assistant(message.clone()));
            stream.push(AgentEvent::MessageStart {
                message: Message::Assistant(message.clone()),
            });
            stream.push(AgentEvent::MessageEnd {
                message: Message::Assistant(message.clone()),
            });
            return message;
        }
    };

    let mut added_partial = false;
    while let Some(event) = response.next().await {
        match &event {
            AssistantMessageEvent::Start { partial } => {
                context.messages.push(Message::Assistant(partial.clone()));
                added_partial = true;
                stream.push(AgentEvent::MessageStart {
                    message: Message::Assistant(partial.clone()),
                });
            }
            AssistantMessageEvent::Done { .. } | AssistantMessageEvent::Error { .. } => break,
            other => {
                if let Some(partial) = event_partial(other) {
                    if added_partial {
                        *context.messages.last_mut().expect("partial was pushed") =
                            Message::Assistant(partial.clone());
                    }
                    stream.push(AgentEvent::MessageUpdate {
                        message: Message::Assistant(partial.clone()),
                        event: other.clone(),
                    });
                }
            }
        }
    }

    let final_message = response.result().await;
    if added_partial {
        *context.messages.last_mut().expect("partial was pushed") =
            Message::Assistant(final_message.clone());
    } else {
        context
            .messages
            .push(Message::Assistant(final_message.clone()));
        stream.push(AgentEvent::MessageStart {
            message: Message::Assistant(final_message.clone()),
        });
    }
    stream.push(AgentEvent::MessageEnd {
        message: Message::Assistant(final_message.clone()),
    });
    final_message
}

fn event_partial(event: &AssistantMessageEvent) -> Option<&AssistantMessage> {
    match event {
        AssistantMessageEvent::Start { partial }
        | AssistantMessageEvent::TextStart { partial, .. }
        | AssistantMessageEvent::TextDelta { partial, .. }
        | AssistantMessageEvent::TextEnd { partial, .. }
        | AssistantMessageEvent::ThinkingStart { partial, .. }
        | AssistantMessageEvent::ThinkingDelta { partial, .. }
        | AssistantMessageEvent::ThinkingEnd { partial, .. }
        | AssistantMessageEvent::ToolcallStart { partial, .. }
        | AssistantMessageEvent::ToolcallDelta { partial, .. }
        | AssistantMessageEvent::ToolcallEnd { partial, .. } => Some(partial),
        AssistantMessageEvent::Done { .. } | AssistantMessageEvent::Error { .. } => None,
    }
}

/// Synthesise an error (or aborted, when the token fired) assistant message
/// stamped with the model's identity.
pub(crate) fn error_assistant_message(
    model: &Model,
    cancel: &CancellationToken,
    error: &str,
) -> AssistantMessage {
    let mut message = AssistantMessage::empty_for(model);
    message.stop_reason = if cancel.is_cancelled() {
        StopReason::Aborted
    } else {
        StopReason::Error
    };
    message.error_message = Some(error.to_string());
    message
}

struct ToolExecution {
    results: Vec<ToolResultMessage>,
    steering_messages: Vec<Message>,
}

/// Execute the assistant's tool calls strictly sequentially.
///
/// The steering queue is checked after every tool; when it is non-empty,
/// all remaining calls are skipped with synthetic error results and the
/// steering messages are handed back for immediate insertion.
async fn execute_tool_calls(
    tools: &[Arc<dyn Tool>],
    tool_calls: &[ToolCallRequest],
    cancel: &CancellationToken,
    stream: &AgentEventStream,
    get_steering: &Option<MessageSupplier>,
) -> ToolExecution {
    let mut results = Vec::with_capacity(tool_calls.len());
    let mut steering_messages = Vec::new();

    for (index, call) in tool_calls.iter().enumerate() {
        stream.push(AgentEvent::ToolExecutionStart {
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            args: call.arguments.clone(),
        });

        let (result, is_error) = run_one_tool(tools, call, cancel, stream).await;

        stream.push(AgentEvent::ToolExecutionEnd {
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            result: result.clone(),
            is_error,
        });

        let message = tool_result_message(call, &result, is_error);
        stream.push(AgentEvent::MessageStart {
            message: Message::ToolResult(message.clone()),
        });
        stream.push(AgentEvent::MessageEnd {
            message: Message::ToolResult(message.clone()),
        });
        results.push(message);

        let steering = drain(get_steering);
        if !steering.is_empty() {
            steering_messages = steering;
            for skipped in &tool_calls[index + 1..] {
                results.push(skip_tool_call(skipped, stream));
            }
            break;
        }
    }

    ToolExecution {
        results,
        steering_messages,
    }
}

async fn run_one_tool(
    tools: &[Arc<dyn Tool>],
    call: &ToolCallRequest,
    cancel: &CancellationToken,
    stream: &AgentEventStream,
) -> (ToolResult, bool) {
    let Some(tool) = tools.iter().find(|t| t.name() == call.name) else {
        return (
            ToolResult::text(format!("Tool {} not found", call.name)),
            true,
        );
    };

    let errors = validate_tool_arguments(&tool.parameters(), &call.arguments);
    if !errors.is_empty() {
        return (
            ToolResult::text(format!("Invalid arguments: {}", errors.join("; "))),
            true,
        );
    }

    let on_partial = |partial: ToolResult| {
        stream.push(AgentEvent::ToolExecutionUpdate {
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            args: call.arguments.clone(),
            partial,
        });
    };

    match tool
        .execute(&call.id, &call.arguments, cancel, &on_partial)
        .await
    {
        Ok(result) => (result, false),
        Err(e) => {
            warn!(tool = %call.name, call_id = %call.id, "tool execution failed: {e:#}");
            (ToolResult::text(e.to_string()), true)
        }
    }
}

fn tool_result_message(
    call: &ToolCallRequest,
    result: &ToolResult,
    is_error: bool,
) -> ToolResultMessage {
    ToolResultMessage {
        tool_call_id: call.id.clone(),
        tool_name: call.name.clone(),
        content: result.content.clone(),
        details: result.details.clone(),
        is_error,
        timestamp: now_ms(),
    }
}

/// Skip a tool call preempted by a steering message, preserving the
/// tool_call ↔ tool_result pairing.
fn skip_tool_call(call: &ToolCallRequest, stream: &AgentEventStream) -> ToolResultMessage {
    let result = ToolResult::text("Skipped due to queued user message.");

    stream.push(AgentEvent::ToolExecutionStart {
        tool_call_id: call.id.clone(),
        tool_name: call.name.clone(),
        args: call.arguments.clone(),
    });
    stream.push(AgentEvent::ToolExecutionEnd {
        tool_call_id: call.id.clone(),
        tool_name: call.name.clone(),
        result: result.clone(),
        is_error: true,
    });

    let message = tool_result_message(call, &result, true);
    stream.push(AgentEvent::MessageStart {
        message: Message::ToolResult(message.clone()),
    });
    stream.push(AgentEvent::MessageEnd {
        message: Message::ToolResult(message.clone()),
    });
    message
}
