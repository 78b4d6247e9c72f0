// Copyright (c) 2024-2026 Tern Contributors
//
// SPDX-License-Identifier: Apache-2.0
use serde_json::Value;

use tern_model::{AssistantMessageEvent, Message, ToolResultMessage};
use tern_tools::ToolResult;

/// Events emitted by the agent loop during a run.
///
/// This is the public event surface UI, web, and chat frontends subscribe
/// to.  Subscribers are invoked synchronously in registration order and
/// must not block.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// A run has started.
    AgentStart,
    /// A turn (one model call plus its tool executions) has started.
    TurnStart,
    /// A message is entering the context (user prompt, streaming assistant
    /// message, or tool result).
    MessageStart { message: Message },
    /// The streaming assistant message grew; `message` is the current
    /// partial snapshot.
    MessageUpdate {
        message: Message,
        event: AssistantMessageEvent,
    },
    /// The message reached its final form.
    MessageEnd { message: Message },
    /// A tool invocation is starting.
    ToolExecutionStart {
        tool_call_id: String,
        tool_name: String,
        args: Value,
    },
    /// The running tool streamed a partial result.
    ToolExecutionUpdate {
        tool_call_id: String,
        tool_name: String,
        args: Value,
        partial: ToolResult,
    },
    /// A tool invocation finished.
    ToolExecutionEnd {
        tool_call_id: String,
        tool_name: String,
        result: ToolResult,
        is_error: bool,
    },
    /// The turn finished with the assistant message and its tool results.
    TurnEnd {
        message: Message,
        tool_results: Vec<ToolResultMessage>,
    },
    /// The run finished; `messages` are all messages added during the run.
    AgentEnd { messages: Vec<Message> },
}

impl AgentEvent {
    /// Wire tag of this event, matching the serialized protocol.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AgentStart => "agent_start",
            Self::TurnStart => "turn_start",
            Self::MessageStart { .. } => "message_start",
            Self::MessageUpdate { .. } => "message_update",
            Self::MessageEnd { .. } => "message_end",
            Self::ToolExecutionStart { .. } => "tool_execution_start",
            Self::ToolExecutionUpdate { .. } => "tool_execution_update",
            Self::ToolExecutionEnd { .. } => "tool_execution_end",
            Self::TurnEnd { .. } => "turn_end",
            Self::AgentEnd { .. } => "agent_end",
        }
    }
}
