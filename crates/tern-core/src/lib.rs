// Copyright (c) 2024-2026 Tern Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Agent core: the turn-structured loop, the stateful `Agent` façade, the
//! branchable JSONL session store, and the retry/compaction supervisor.

pub mod agent;
pub mod agent_loop;
pub mod compact;
pub mod events;
pub mod runtime;
pub mod session;
pub mod supervisor;
pub mod text;

pub use agent::{Agent, AgentError, AgentHandle, AgentOptions, AgentState, QueueMode, Subscription};
pub use agent_loop::{
    agent_loop, agent_loop_continue, AgentContext, AgentEventStream, AgentLoopConfig, ApiKeyFn,
    MessageSupplier, StreamFn,
};
pub use compact::{
    estimate_context_tokens, prepare_compaction, should_compact, CompactionPreparation,
    CompactionResult, CompactionSettings,
};
pub use events::AgentEvent;
pub use runtime::{AgentSession, AgentSessionConfig};
pub use session::{SessionContext, SessionEntry, SessionManager, SessionStats};
pub use supervisor::{
    is_retryable_error, CompactionReason, RetrySettings, SessionEvent,
};
pub use text::{fuzzy_filter, fuzzy_score, truncate_head};
