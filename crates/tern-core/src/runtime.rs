// Copyright (c) 2024-2026 Tern Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! `AgentSession`: binds an [`Agent`], a [`SessionManager`], and the
//! retry/compaction supervisor into one conversation runtime.
//!
//! Every finished message is recorded into the session store; after each
//! run the final assistant message is classified and the supervisor either
//! retries with backoff, compacts and continues, compacts preemptively, or
//! surfaces the failure.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use tern_model::{overflow::is_context_overflow, AssistantMessage, Message, Model};

use crate::agent::Agent;
use crate::agent_loop::ApiKeyFn;
use crate::compact::{
    compact, estimate_context_tokens, prepare_compaction, should_compact, CompactionResult,
    CompactionSettings, SummarizeOptions,
};
use crate::events::AgentEvent;
use crate::session::SessionManager;
use crate::supervisor::{
    is_retryable_error, retry_delay_ms, CompactionReason, RetrySettings, SessionEvent,
};

/// Configuration for the session runtime.
#[derive(Default)]
pub struct AgentSessionConfig {
    pub compaction: CompactionSettings,
    pub retry: RetrySettings,
    /// Credential lookup for the summarisation call.
    pub get_api_key: Option<ApiKeyFn>,
}

type SessionListener = Box<dyn Fn(&SessionEvent) + Send + Sync>;

pub struct AgentSession {
    agent: Agent,
    sessions: Arc<Mutex<SessionManager>>,
    config: AgentSessionConfig,
    listeners: Arc<Mutex<HashMap<u64, SessionListener>>>,
    next_listener_id: AtomicU64,
    retry_attempt: u32,
    supervisor_cancel: CancellationToken,
    /// Keeps the store recorder subscribed for the session's lifetime.
    _recorder: crate::agent::Subscription,
}

impl AgentSession {
    /// Bind an agent to a session store.  A recorder subscription mirrors
    /// every finished message into the store as it happens.
    pub fn new(agent: Agent, sessions: SessionManager, config: AgentSessionConfig) -> Self {
        let sessions = Arc::new(Mutex::new(sessions));
        let recorder_sessions = Arc::clone(&sessions);
        // The subscription stays alive for the session's lifetime; the
        // recorder is how entries get their parent chain without the loop
        // knowing about persistence.
        let recorder = agent.subscribe(move |event| {
            if let AgentEvent::MessageEnd { message } = event {
                let mut store = recorder_sessions.lock().unwrap_or_else(|p| p.into_inner());
                if let Err(e) = store.append_message(message.clone()) {
                    warn!("failed to record message into session: {e:#}");
                }
            }
        });

        Self {
            agent,
            sessions,
            config,
            listeners: Arc::new(Mutex::new(HashMap::new())),
            next_listener_id: AtomicU64::new(1),
            retry_attempt: 0,
            supervisor_cancel: CancellationToken::new(),
            _recorder: recorder,
        }
    }

    pub fn agent(&self) -> &Agent {
        &self.agent
    }

    pub fn agent_mut(&mut self) -> &mut Agent {
        &mut self.agent
    }

    pub fn sessions(&self) -> Arc<Mutex<SessionManager>> {
        Arc::clone(&self.sessions)
    }

    /// Subscribe to supervisor events (retry and compaction lifecycle).
    pub fn on_session_event(
        &self,
        f: impl Fn(&SessionEvent) + Send + Sync + 'static,
    ) -> u64 {
        let id = self.next_listener_id.fetch_add(1, Ordering::SeqCst);
        self.listeners
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(id, Box::new(f));
        id
    }

    pub fn remove_session_listener(&self, id: u64) {
        self.listeners
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&id);
    }

    fn emit(&self, event: &SessionEvent) {
        let listeners = self.listeners.lock().unwrap_or_else(|p| p.into_inner());
        let mut ordered: Vec<(&u64, &SessionListener)> = listeners.iter().collect();
        ordered.sort_by_key(|(id, _)| **id);
        for (_, listener) in ordered {
            listener(event);
        }
    }

    /// Abort the in-flight run, any retry sleep, and any compaction call.
    pub fn abort(&self) {
        self.agent.abort();
        self.supervisor_cancel.cancel();
    }

    /// Send a prompt and supervise the run until it settles.
    pub async fn prompt(&mut self, text: impl Into<String>) -> Result<()> {
        self.supervisor_cancel = CancellationToken::new();
        self.agent.prompt(text).await?;
        self.supervise().await
    }

    /// Continue the current context under supervision (queued messages,
    /// external resumption).
    pub async fn continue_run(&mut self) -> Result<()> {
        self.supervisor_cancel = CancellationToken::new();
        self.agent.continue_run().await?;
        self.supervise().await
    }

    /// Current context usage: (estimated tokens, context window).
    pub fn context_usage(&self) -> (u64, u64) {
        let tokens = {
            let store = self.sessions.lock().unwrap_or_else(|p| p.into_inner());
            estimate_context_tokens(&store.get_branch(None))
        };
        let window = self
            .agent
            .state()
            .model
            .as_ref()
            .map(|m| m.context_window)
            .unwrap_or(0);
        (tokens, window)
    }

    // ── Supervision ───────────────────────────────────────────────────────────

    async fn supervise(&mut self) -> Result<()> {
        loop {
            let Some(model) = self.agent.state().model.clone() else {
                return Ok(());
            };

            match self.failed_final_message() {
                None => {
                    if self.retry_attempt > 0 {
                        self.emit(&SessionEvent::AutoRetryEnd {
                            success: true,
                            attempt: self.retry_attempt,
                            final_error: None,
                        });
                        self.retry_attempt = 0;
                    }
                    self.maybe_compact_on_threshold(&model).await;
                    return Ok(());
                }
                Some(failed) => {
                    if is_context_overflow(
                        &failed,
                        &model,
                        self.config.compaction.silent_overflow_margin,
                    ) {
                        if self
                            .run_auto_compaction(&model, CompactionReason::Overflow, true)
                            .await
                            .is_err()
                        {
                            return Ok(());
                        }
                        self.strip_failed_tail();
                        self.agent.continue_run().await?;
                        continue;
                    }

                    if self.config.retry.enabled && is_retryable_error(&failed) {
                        self.retry_attempt += 1;
                        if self.retry_attempt > self.config.retry.max_retries {
                            self.emit(&SessionEvent::AutoRetryEnd {
                                success: false,
                                attempt: self.retry_attempt - 1,
                                final_error: failed.error_message.clone(),
                            });
                            self.retry_attempt = 0;
                            return Ok(());
                        }
                        let delay_ms = retry_delay_ms(self.retry_attempt, &self.config.retry);
                        self.emit(&SessionEvent::AutoRetryStart {
                            attempt: self.retry_attempt,
                            max_attempts: self.config.retry.max_retries,
                            delay_ms,
                            error_message: failed.error_message.clone().unwrap_or_default(),
                        });
                        self.strip_failed_tail();

                        tokio::select! {
                            _ = self.supervisor_cancel.cancelled() => return Ok(()),
                            _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
                        }

                        self.agent.continue_run().await?;
                        continue;
                    }

                    // Fatal for this turn (auth, bad request, user abort):
                    // surface through state.error and stay idle.
                    return Ok(());
                }
            }
        }
    }

    /// The final assistant message when it ended in `error`.  Aborted runs
    /// are user-initiated and never re-driven.
    fn failed_final_message(&self) -> Option<AssistantMessage> {
        match self.agent.state().messages.last() {
            Some(Message::Assistant(a))
                if a.stop_reason == tern_model::StopReason::Error =>
            {
                Some(a.clone())
            }
            _ => None,
        }
    }

    /// Remove the trailing error-annotated assistant message from the
    /// agent's working context.  The session store keeps it as a historical
    /// entry; provider conversion filters it there.
    fn strip_failed_tail(&mut self) {
        let mut messages = self.agent.state().messages.clone();
        if matches!(
            messages.last(),
            Some(Message::Assistant(a)) if a.error_message.is_some()
        ) {
            messages.pop();
            self.agent.replace_messages(messages);
        }
    }

    async fn maybe_compact_on_threshold(&mut self, model: &Model) {
        let (tokens, window) = self.context_usage();
        if !should_compact(tokens, window, &self.config.compaction) {
            return;
        }
        // Threshold compaction runs after a successful turn; no continue
        // follows, the next prompt simply starts from the compacted context.
        let _ = self
            .run_auto_compaction(model, CompactionReason::Threshold, false)
            .await;
    }

    async fn run_auto_compaction(
        &mut self,
        model: &Model,
        reason: CompactionReason,
        will_retry: bool,
    ) -> Result<CompactionResult> {
        self.emit(&SessionEvent::AutoCompactionStart { reason });
        match self.compact_once(model, None).await {
            Ok(result) => {
                self.emit(&SessionEvent::AutoCompactionEnd {
                    result: Some(result.clone()),
                    aborted: false,
                    error_message: None,
                    will_retry,
                });
                Ok(result)
            }
            Err(e) => {
                let aborted = self.supervisor_cancel.is_cancelled();
                self.emit(&SessionEvent::AutoCompactionEnd {
                    result: None,
                    aborted,
                    error_message: Some(e.to_string()),
                    will_retry: false,
                });
                Err(e)
            }
        }
    }

    /// Switch the active branch to `target_entry_id`.
    ///
    /// Entries unique to the abandoned path are summarised and recorded as
    /// a `branch_summary` entry at the head of the new branch; when the
    /// summarisation fails (or there is nothing unique), the switch still
    /// happens, just without the summary.
    pub async fn switch_branch(&mut self, target_entry_id: &str) -> Result<()> {
        let abandoned = {
            let store = self.sessions.lock().unwrap_or_else(|p| p.into_inner());
            match store.leaf_id().map(str::to_string) {
                Some(old_leaf) if old_leaf != target_entry_id => {
                    crate::compact::collect_entries_for_branch_summary(
                        &old_leaf,
                        target_entry_id,
                        |id| store.get_entry(id).cloned(),
                    )
                }
                _ => Vec::new(),
            }
        };

        let summary = match (&self.agent.state().model, abandoned.is_empty()) {
            (Some(model), false) => {
                let options = SummarizeOptions {
                    api_key: self
                        .config
                        .get_api_key
                        .as_ref()
                        .and_then(|f| f(&model.provider)),
                    cancel: Some(self.supervisor_cancel.clone()),
                    custom_instructions: None,
                    reserve_tokens: self.config.compaction.reserve_tokens,
                };
                match crate::compact::generate_branch_summary(
                    &abandoned,
                    model,
                    &options,
                    self.config.compaction.keep_recent_tokens,
                )
                .await
                {
                    Ok(result) => Some(result),
                    Err(e) => {
                        warn!("branch summarisation failed, switching without summary: {e:#}");
                        None
                    }
                }
            }
            _ => None,
        };

        let context = {
            let mut store = self.sessions.lock().unwrap_or_else(|p| p.into_inner());
            match summary {
                Some(result) => {
                    store.branch_with_summary(
                        target_entry_id,
                        result.summary,
                        result.branch_entry_ids,
                    )?;
                }
                None => store.branch(target_entry_id)?,
            }
            store.build_context()
        };
        self.agent.replace_messages(context.messages);
        Ok(())
    }

    /// Run one compaction: summarise the discard set, persist the entry,
    /// and rebuild the agent's context from the store.
    pub async fn compact_manual(
        &mut self,
        custom_instructions: Option<String>,
    ) -> Result<CompactionResult> {
        let model = self
            .agent
            .state()
            .model
            .clone()
            .ok_or_else(|| anyhow!("no model configured"))?;
        self.compact_once(&model, custom_instructions).await
    }

    async fn compact_once(
        &mut self,
        model: &Model,
        custom_instructions: Option<String>,
    ) -> Result<CompactionResult> {
        let preparation = {
            let store = self.sessions.lock().unwrap_or_else(|p| p.into_inner());
            prepare_compaction(&store.get_branch(None), &self.config.compaction)
        }
        .ok_or_else(|| anyhow!("nothing to compact"))?;

        let api_key = self
            .config
            .get_api_key
            .as_ref()
            .and_then(|f| f(&model.provider));
        let options = SummarizeOptions {
            api_key,
            cancel: Some(self.supervisor_cancel.clone()),
            custom_instructions,
            reserve_tokens: self.config.compaction.reserve_tokens,
        };
        let result = compact(&preparation, model, &options).await?;

        let context = {
            let mut store = self.sessions.lock().unwrap_or_else(|p| p.into_inner());
            store.append_compaction(
                result.summary.clone(),
                result.first_kept_entry_id.clone(),
                result.tokens_before,
                Some(result.details.clone()),
            )?;
            store.build_context()
        };
        self.agent.replace_messages(context.messages);
        Ok(result)
    }
}
