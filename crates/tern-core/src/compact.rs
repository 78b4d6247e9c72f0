// Copyright (c) 2024-2026 Tern Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Context compaction: deterministic token estimation, cut-point selection,
//! transcript serialisation, and the LLM summarisation call.
//!
//! Compaction never mutates history — it appends a `compaction` entry whose
//! `first_kept_entry_id` marks where verbatim history resumes.  Context
//! reconstruction then replaces everything before the cut with a single
//! synthetic `[Summary]` user message.

use anyhow::{anyhow, bail, Result};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use tern_model::{
    ContentBlock, Context, Message, Model, SimpleStreamOptions, ThinkingLevel, UserContent,
};

use crate::session::{CompactionDetails, SessionEntry};

// ─── Prompts ──────────────────────────────────────────────────────────────────

pub const SUMMARIZATION_SYSTEM_PROMPT: &str = "You are a context summarization assistant. \
Your task is to read a conversation between a user and an AI coding assistant, then produce \
a structured summary following the exact format specified. Do NOT continue the conversation.";

pub const SUMMARIZATION_PROMPT: &str = "\
Summarize the following conversation between a user and an AI coding assistant.
Produce a structured summary with EXACTLY these sections:

## Goal
What is the user trying to accomplish?

## Constraints & Preferences
Any requirements, constraints, or preferences mentioned.

## Progress
### Done
- Completed items

### In Progress
- Items being worked on

### Blocked
- Items that are stuck

## Key Decisions
Important decisions made during the conversation.

## Next Steps
What should happen next.

## Critical Context
Any other information essential to continuing the work.
";

pub const BRANCH_SUMMARIZATION_PROMPT: &str = "\
Summarize the following conversation branch that is being abandoned.
The user is switching to a different conversation path, and this summary
will provide context about what was explored in this branch.

Focus on:
1. What was attempted in this branch
2. Key findings or results
3. Any important decisions or changes made
4. Why this path might have been abandoned (if apparent)

Keep the summary concise but informative.
";

// ─── Settings ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct CompactionSettings {
    pub enabled: bool,
    /// Output budget held back from the context window when deciding
    /// whether to compact.
    pub reserve_tokens: u64,
    /// Lower bound on the token size of the history tail kept verbatim.
    pub keep_recent_tokens: u64,
    /// Slack added to the context window before the silent-overflow check
    /// (`usage.input > window`) fires.  Providers that report input tokens
    /// post-cache-hit can undercount; widening the window here avoids
    /// misclassifying those readings.
    pub silent_overflow_margin: u64,
}

impl Default for CompactionSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            reserve_tokens: 16384,
            keep_recent_tokens: 20000,
            silent_overflow_margin: 0,
        }
    }
}

/// Whether the estimated context no longer leaves room for a reply.
pub fn should_compact(tokens: u64, context_window: u64, settings: &CompactionSettings) -> bool {
    settings.enabled && context_window > 0 && tokens + settings.reserve_tokens > context_window
}

// ─── Token estimation ─────────────────────────────────────────────────────────

/// Fixed estimate for an image block (≈ 4800 chars / 4).
const IMAGE_TOKENS: u64 = 1200;

fn estimate_block_tokens(block: &ContentBlock) -> u64 {
    match block {
        ContentBlock::Text { text, .. } => text.len() as u64 / 4,
        ContentBlock::Thinking { thinking, .. } => thinking.len() as u64 / 4,
        ContentBlock::Image { .. } => IMAGE_TOKENS,
        ContentBlock::ToolCall {
            name, arguments, ..
        } => 10 + (name.len() as u64 + arguments.to_string().len() as u64) / 4,
    }
}

/// Deterministic, provider-agnostic token estimate for one message.
pub fn estimate_message_tokens(message: &Message) -> u64 {
    match message {
        Message::User(u) => match &u.content {
            UserContent::Text(t) => t.len() as u64 / 4,
            UserContent::Blocks(blocks) => blocks.iter().map(estimate_block_tokens).sum(),
        },
        Message::Assistant(a) => a.content.iter().map(estimate_block_tokens).sum(),
        Message::ToolResult(tr) => tr.content.iter().map(estimate_block_tokens).sum(),
    }
}

/// Token estimate for one session entry.  Entries that never reach the
/// provider estimate to zero.
pub fn estimate_entry_tokens(entry: &SessionEntry) -> u64 {
    match entry {
        SessionEntry::Message(m) => estimate_message_tokens(&m.message),
        SessionEntry::Compaction(c) => c.summary.len() as u64 / 4,
        SessionEntry::BranchSummary(b) => b.summary.len() as u64 / 4,
        _ => 0,
    }
}

/// Estimate the context tokens of a branch.
///
/// Prefers the total reported by the most recent assistant message carrying
/// usage, then adds estimates only for entries after it — provider counts
/// beat the chars/4 heuristic wherever available.
pub fn estimate_context_tokens(entries: &[SessionEntry]) -> u64 {
    let anchor = entries.iter().enumerate().rev().find_map(|(i, e)| {
        if let SessionEntry::Message(m) = e {
            if let Message::Assistant(a) = &m.message {
                let total = a.usage.total();
                if total > 0 {
                    return Some((i, total));
                }
            }
        }
        None
    });

    match anchor {
        Some((index, total)) => {
            total
                + entries[index + 1..]
                    .iter()
                    .map(estimate_entry_tokens)
                    .sum::<u64>()
        }
        None => entries.iter().map(estimate_entry_tokens).sum(),
    }
}

// ─── Preparation ──────────────────────────────────────────────────────────────

/// Everything needed to run a compaction.
#[derive(Debug, Clone)]
pub struct CompactionPreparation {
    /// Entries to be summarised away, in branch order.
    pub discard: Vec<SessionEntry>,
    /// First entry kept verbatim after the cut.
    pub first_kept_entry_id: Option<String>,
    pub tokens_before: u64,
    pub read_files: Vec<String>,
    pub modified_files: Vec<String>,
}

/// The result persisted as a `compaction` entry.
#[derive(Debug, Clone)]
pub struct CompactionResult {
    pub summary: String,
    pub first_kept_entry_id: Option<String>,
    pub tokens_before: u64,
    pub details: CompactionDetails,
}

/// Select the cut point and collect the discard set.
///
/// The kept tail must hold at least `keep_recent_tokens` and start at a
/// clean boundary — a user message or an assistant message — so no
/// tool-call ↔ tool-result pair is split.  Returns `None` when too little
/// would be discarded for the summary to pay for itself.
pub fn prepare_compaction(
    entries: &[SessionEntry],
    settings: &CompactionSettings,
) -> Option<CompactionPreparation> {
    let message_positions: Vec<usize> = entries
        .iter()
        .enumerate()
        .filter(|(_, e)| matches!(e, SessionEntry::Message(_)))
        .map(|(i, _)| i)
        .collect();
    if message_positions.len() < 4 {
        return None;
    }

    // Walk backwards until the tail holds the keep-recent budget.
    let mut tail_tokens = 0u64;
    let mut cut = entries.len();
    for &pos in message_positions.iter().rev() {
        cut = pos;
        tail_tokens += estimate_entry_tokens(&entries[pos]);
        if tail_tokens >= settings.keep_recent_tokens {
            break;
        }
    }

    // Move the cut earlier until the kept side starts at a user message or
    // an assistant message; starting at a tool result would orphan it from
    // the call that produced it.
    while cut > 0 {
        match &entries[cut] {
            SessionEntry::Message(m) => match &m.message {
                Message::User(_) | Message::Assistant(_) => break,
                Message::ToolResult(_) => cut -= 1,
            },
            _ => cut -= 1,
        }
    }

    let discard: Vec<SessionEntry> = entries[..cut].to_vec();
    let discarded_messages = discard
        .iter()
        .filter(|e| matches!(e, SessionEntry::Message(_)))
        .count();
    if discarded_messages < 2 {
        return None;
    }

    let first_kept_entry_id = entries[cut].id().map(str::to_string);
    let (read_files, modified_files) = collect_file_operations(&discard);

    Some(CompactionPreparation {
        discard,
        first_kept_entry_id,
        tokens_before: estimate_context_tokens(entries),
        read_files,
        modified_files,
    })
}

/// File paths touched by read/write/edit tool calls in the discard set.
/// Written-or-edited files take precedence over merely-read ones.
fn collect_file_operations(entries: &[SessionEntry]) -> (Vec<String>, Vec<String>) {
    let mut read = std::collections::BTreeSet::new();
    let mut modified = std::collections::BTreeSet::new();

    for entry in entries {
        let SessionEntry::Message(m) = entry else {
            continue;
        };
        let Message::Assistant(a) = &m.message else {
            continue;
        };
        for call in a.tool_calls() {
            let path = call.arguments["file_path"]
                .as_str()
                .or_else(|| call.arguments["path"].as_str())
                .unwrap_or("");
            if path.is_empty() {
                continue;
            }
            match call.name.as_str() {
                "read" => {
                    read.insert(path.to_string());
                }
                "write" | "edit" => {
                    modified.insert(path.to_string());
                }
                _ => {}
            }
        }
    }

    let read_only: Vec<String> = read.difference(&modified).cloned().collect();
    (read_only, modified.into_iter().collect())
}

// ─── Serialisation ────────────────────────────────────────────────────────────

const TOOL_ARGS_MAX_CHARS: usize = 500;

fn truncate_args(args: &Value) -> String {
    let mut text = args.to_string();
    if text.len() > TOOL_ARGS_MAX_CHARS {
        let mut end = TOOL_ARGS_MAX_CHARS;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text.truncate(end);
        text.push_str("...");
    }
    text
}

/// Serialise messages into `[role]` text blocks for the summarisation call.
pub fn serialize_conversation(messages: &[Message]) -> String {
    let mut parts: Vec<String> = Vec::new();
    for message in messages {
        let role = message.role();
        let body = match message {
            Message::User(u) => u.content.to_text(),
            Message::Assistant(a) => a
                .content
                .iter()
                .filter_map(|block| match block {
                    ContentBlock::Text { text, .. } => Some(text.clone()),
                    ContentBlock::Thinking { thinking, .. } => {
                        Some(format!("<thinking>{thinking}</thinking>"))
                    }
                    ContentBlock::ToolCall {
                        name, arguments, ..
                    } => Some(format!(
                        "<tool_call name='{name}'>{}</tool_call>",
                        truncate_args(arguments)
                    )),
                    ContentBlock::Image { .. } => Some("[image]".to_string()),
                })
                .collect::<Vec<_>>()
                .join("\n"),
            Message::ToolResult(tr) => tr
                .content
                .iter()
                .filter_map(|block| match block {
                    ContentBlock::Text { text, .. } => Some(text.clone()),
                    ContentBlock::Image { .. } => Some("[image]".to_string()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        };
        if !body.is_empty() {
            parts.push(format!("[{role}]\n{body}"));
        }
    }
    parts.join("\n\n")
}

fn entry_messages(entries: &[SessionEntry]) -> Vec<Message> {
    entries
        .iter()
        .filter_map(|e| match e {
            SessionEntry::Message(m) => Some(m.message.clone()),
            SessionEntry::Compaction(c) => {
                Some(Message::user(format!("[Summary]\n{}", c.summary)))
            }
            SessionEntry::BranchSummary(b) => {
                Some(Message::user(format!("[Branch summary]\n{}", b.summary)))
            }
            _ => None,
        })
        .collect()
}

/// Prepend `<read-files>` / `<modified-files>` tags to the transcript.
fn format_file_operations(read_files: &[String], modified_files: &[String]) -> String {
    let mut parts: Vec<String> = Vec::new();
    if !read_files.is_empty() {
        parts.push("<read-files>".into());
        parts.extend(read_files.iter().cloned());
        parts.push("</read-files>".into());
    }
    if !modified_files.is_empty() {
        parts.push("<modified-files>".into());
        parts.extend(modified_files.iter().cloned());
        parts.push("</modified-files>".into());
    }
    parts.join("\n")
}

// ─── Summarisation calls ──────────────────────────────────────────────────────

/// Options for the summarisation call.
#[derive(Default, Clone)]
pub struct SummarizeOptions {
    pub api_key: Option<String>,
    pub cancel: Option<CancellationToken>,
    pub custom_instructions: Option<String>,
    pub reserve_tokens: u64,
}

/// Run the compaction summarisation against `model` and produce the result
/// to persist.
pub async fn compact(
    preparation: &CompactionPreparation,
    model: &Model,
    options: &SummarizeOptions,
) -> Result<CompactionResult> {
    let transcript = serialize_conversation(&entry_messages(&preparation.discard));
    let file_ops = format_file_operations(&preparation.read_files, &preparation.modified_files);

    let mut prompt = String::from(SUMMARIZATION_PROMPT);
    if let Some(custom) = &options.custom_instructions {
        prompt.push('\n');
        prompt.push_str(custom);
        prompt.push('\n');
    }
    prompt.push('\n');
    if !file_ops.is_empty() {
        prompt.push_str(&file_ops);
        prompt.push('\n');
    }
    prompt.push_str(&format!("<conversation>\n{transcript}\n</conversation>"));

    let summary = summarize(model, options, &prompt).await?;
    Ok(CompactionResult {
        summary,
        first_kept_entry_id: preparation.first_kept_entry_id.clone(),
        tokens_before: preparation.tokens_before,
        details: CompactionDetails {
            read_files: preparation.read_files.clone(),
            modified_files: preparation.modified_files.clone(),
        },
    })
}

async fn summarize(model: &Model, options: &SummarizeOptions, prompt: &str) -> Result<String> {
    let reserve = if options.reserve_tokens > 0 {
        options.reserve_tokens
    } else {
        CompactionSettings::default().reserve_tokens
    };
    let context = Context {
        system_prompt: Some(SUMMARIZATION_SYSTEM_PROMPT.to_string()),
        messages: vec![Message::user(prompt)],
        tools: vec![],
    };
    let stream_options = SimpleStreamOptions {
        api_key: options.api_key.clone(),
        max_tokens: Some((reserve / 2) as u32),
        cancel: options.cancel.clone(),
        reasoning: if model.reasoning {
            Some(ThinkingLevel::Medium)
        } else {
            None
        },
        ..SimpleStreamOptions::default()
    };

    let message = tern_model::complete_simple(model, context, stream_options).await?;
    if message.stop_reason.is_failure() {
        bail!(
            "summarization failed: {}",
            message
                .error_message
                .unwrap_or_else(|| "unknown error".into())
        );
    }
    let summary = message.text();
    if summary.trim().is_empty() {
        bail!("summarization returned an empty summary");
    }
    Ok(summary)
}

// ─── Branch summaries ─────────────────────────────────────────────────────────

/// Result of summarising an abandoned branch.
#[derive(Debug, Clone)]
pub struct BranchSummaryResult {
    pub summary: String,
    pub branch_entry_ids: Vec<String>,
}

/// Entries unique to the branch being abandoned: on the path from
/// `old_leaf_id` to the root but not on the path from `target_id`.
pub fn collect_entries_for_branch_summary(
    old_leaf_id: &str,
    target_id: &str,
    get_entry: impl Fn(&str) -> Option<SessionEntry>,
) -> Vec<SessionEntry> {
    let walk = |leaf: &str| {
        let mut ids = Vec::new();
        let mut current = Some(leaf.to_string());
        while let Some(id) = current {
            let Some(entry) = get_entry(&id) else { break };
            current = entry.parent_id().map(str::to_string);
            ids.push((id, entry));
        }
        ids
    };

    let target_ids: std::collections::HashSet<String> =
        walk(target_id).into_iter().map(|(id, _)| id).collect();

    let mut branch_only: Vec<SessionEntry> = walk(old_leaf_id)
        .into_iter()
        .filter(|(id, _)| !target_ids.contains(id))
        .map(|(_, entry)| entry)
        .collect();
    branch_only.reverse();
    branch_only
}

/// Messages for the branch summarisation, truncated to the token budget by
/// keeping the first two and last two and eliding the middle.
pub fn prepare_branch_messages(entries: &[SessionEntry], token_budget: u64) -> Vec<Message> {
    let messages = entry_messages(entries);
    let total: u64 = entries.iter().map(estimate_entry_tokens).sum();
    if total > token_budget && messages.len() > 4 {
        let mut kept = messages[..2].to_vec();
        kept.push(Message::user("[... middle of branch omitted ...]"));
        kept.extend_from_slice(&messages[messages.len() - 2..]);
        kept
    } else {
        messages
    }
}

/// Summarise an abandoned branch with the branch prompt.
pub async fn generate_branch_summary(
    entries: &[SessionEntry],
    model: &Model,
    options: &SummarizeOptions,
    token_budget: u64,
) -> Result<BranchSummaryResult> {
    if entries.is_empty() {
        return Err(anyhow!("no entries unique to the abandoned branch"));
    }
    let messages = prepare_branch_messages(entries, token_budget);
    let transcript = serialize_conversation(&messages);
    let prompt =
        format!("{BRANCH_SUMMARIZATION_PROMPT}\n\n<branch-conversation>\n{transcript}\n</branch-conversation>");

    let summary = summarize(model, options, &prompt).await?;
    Ok(BranchSummaryResult {
        summary,
        branch_entry_ids: entries.iter().filter_map(|e| e.id().map(str::to_string)).collect(),
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{EntryMeta, MessageEntry};
    use serde_json::json;
    use tern_model::AssistantMessage;

    fn model() -> Model {
        Model {
            id: "m".into(),
            name: "M".into(),
            api: "mock".into(),
            provider: "mock".into(),
            base_url: String::new(),
            reasoning: false,
            input: vec![tern_model::InputModality::Text],
            cost: Default::default(),
            context_window: 100_000,
            max_tokens: 4096,
            headers: None,
            compat: None,
        }
    }

    fn entry(id: &str, message: Message) -> SessionEntry {
        SessionEntry::Message(MessageEntry {
            meta: EntryMeta {
                id: id.into(),
                parent_id: None,
            },
            message,
        })
    }

    fn assistant(blocks: Vec<ContentBlock>) -> Message {
        let mut a = AssistantMessage::empty_for(&model());
        a.content = blocks;
        Message::Assistant(a)
    }

    // ── Estimator ─────────────────────────────────────────────────────────────

    #[test]
    fn empty_branch_estimates_to_zero() {
        assert_eq!(estimate_context_tokens(&[]), 0);
    }

    #[test]
    fn text_estimates_at_four_chars_per_token() {
        let msg = Message::user("a".repeat(40));
        assert_eq!(estimate_message_tokens(&msg), 10);
    }

    #[test]
    fn image_blocks_estimate_at_fixed_cost() {
        let msg = Message::user_blocks(vec![ContentBlock::image("QUJD", "image/png")]);
        assert_eq!(estimate_message_tokens(&msg), 1200);
    }

    #[test]
    fn tool_call_estimate_includes_overhead() {
        let msg = assistant(vec![ContentBlock::tool_call(
            "t1",
            "grep",
            json!({"q": "xx"}),
        )]);
        // 10 + (4 + len("{\"q\":\"xx\"}") = 10) / 4 = 10 + 3
        assert_eq!(estimate_message_tokens(&msg), 13);
    }

    #[test]
    fn non_message_entries_estimate_to_zero() {
        let e = SessionEntry::ModelChange(crate::session::ModelChangeEntry {
            meta: EntryMeta {
                id: "x".into(),
                parent_id: None,
            },
            model_id: "m".into(),
            provider: "p".into(),
        });
        assert_eq!(estimate_entry_tokens(&e), 0);
    }

    #[test]
    fn context_estimate_prefers_reported_usage() {
        let mut a = AssistantMessage::empty_for(&model());
        a.usage.total_tokens = 5000;
        a.content = vec![ContentBlock::text("answer")];
        let entries = vec![
            entry("e1", Message::user("x".repeat(4000))),
            entry("e2", Message::Assistant(a)),
            entry("e3", Message::user("y".repeat(400))),
        ];
        // 5000 from usage + 100 for the entry after the anchor.
        assert_eq!(estimate_context_tokens(&entries), 5100);
    }

    // ── should_compact ────────────────────────────────────────────────────────

    #[test]
    fn compaction_triggers_when_reserve_no_longer_fits() {
        let settings = CompactionSettings::default();
        assert!(should_compact(90_000, 100_000, &settings));
        assert!(!should_compact(50_000, 100_000, &settings));
        assert!(!should_compact(
            90_000,
            0,
            &settings
        ));
    }

    #[test]
    fn disabled_compaction_never_triggers() {
        let settings = CompactionSettings {
            enabled: false,
            ..CompactionSettings::default()
        };
        assert!(!should_compact(999_999, 1000, &settings));
    }

    // ── prepare_compaction ────────────────────────────────────────────────────

    fn long_user(id: &str, chars: usize) -> SessionEntry {
        entry(id, Message::user("x".repeat(chars)))
    }

    #[test]
    fn prepare_keeps_recent_tail_and_discards_prefix() {
        let settings = CompactionSettings {
            keep_recent_tokens: 100,
            ..CompactionSettings::default()
        };
        // Each entry ≈ 250 tokens; the last entry alone covers the tail.
        let entries = vec![
            long_user("e1", 1000),
            long_user("e2", 1000),
            long_user("e3", 1000),
            long_user("e4", 1000),
        ];
        let prep = prepare_compaction(&entries, &settings).expect("should prepare");
        assert_eq!(prep.discard.len(), 3);
        assert_eq!(prep.first_kept_entry_id.as_deref(), Some("e4"));
        assert!(prep.tokens_before > 0);
    }

    #[test]
    fn prepare_refuses_tiny_discard_sets() {
        let settings = CompactionSettings::default();
        let entries = vec![
            long_user("e1", 100),
            long_user("e2", 100),
            long_user("e3", 100),
        ];
        assert!(prepare_compaction(&entries, &settings).is_none());
    }

    #[test]
    fn cut_never_lands_on_a_tool_result() {
        let settings = CompactionSettings {
            keep_recent_tokens: 1,
            ..CompactionSettings::default()
        };
        let entries = vec![
            long_user("e1", 2000),
            long_user("e2", 2000),
            entry(
                "e3",
                assistant(vec![ContentBlock::tool_call("t1", "ls", json!({}))]),
            ),
            entry(
                "e4",
                Message::tool_result(
                    "t1",
                    "ls",
                    vec![ContentBlock::text("a".repeat(400))],
                    false,
                ),
            ),
        ];
        let prep = prepare_compaction(&entries, &settings).expect("should prepare");
        // Keeping only e4 would orphan the result from its call; the cut
        // must move back to the assistant entry.
        assert_eq!(prep.first_kept_entry_id.as_deref(), Some("e3"));
    }

    #[test]
    fn file_operations_collected_with_modified_precedence() {
        let entries = vec![
            entry(
                "e1",
                assistant(vec![
                    ContentBlock::tool_call("t1", "read", json!({"path": "a.rs"})),
                    ContentBlock::tool_call("t2", "read", json!({"path": "b.rs"})),
                    ContentBlock::tool_call("t3", "edit", json!({"path": "a.rs"})),
                    ContentBlock::tool_call("t4", "write", json!({"file_path": "c.rs"})),
                ]),
            ),
        ];
        let (read, modified) = collect_file_operations(&entries);
        assert_eq!(read, vec!["b.rs"]);
        assert_eq!(modified, vec!["a.rs", "c.rs"]);
    }

    // ── Serialisation ─────────────────────────────────────────────────────────

    #[test]
    fn serialization_renders_role_blocks() {
        let messages = vec![
            Message::user("question"),
            assistant(vec![
                ContentBlock::thinking("pondering"),
                ContentBlock::text("answer"),
                ContentBlock::tool_call("t1", "ls", json!({"path": "/"})),
            ]),
            Message::tool_result("t1", "ls", vec![ContentBlock::text("a.txt")], false),
        ];
        let text = serialize_conversation(&messages);
        assert!(text.contains("[user]\nquestion"));
        assert!(text.contains("<thinking>pondering</thinking>"));
        assert!(text.contains("<tool_call name='ls'>"));
        assert!(text.contains("[tool_result]\na.txt"));
    }

    #[test]
    fn tool_arguments_truncate_at_500_chars() {
        let big = json!({"data": "x".repeat(1000)});
        let rendered = truncate_args(&big);
        assert!(rendered.len() <= TOOL_ARGS_MAX_CHARS + 3);
        assert!(rendered.ends_with("..."));
    }

    #[test]
    fn empty_serialization_is_empty() {
        assert_eq!(serialize_conversation(&[]), "");
    }

    // ── Branch summaries ──────────────────────────────────────────────────────

    #[test]
    fn branch_collection_excludes_shared_prefix() {
        use std::collections::HashMap;
        // root ── a ── b  (old branch)
        //         └── c   (target)
        let mut store: HashMap<String, SessionEntry> = HashMap::new();
        let mk = |id: &str, parent: Option<&str>| {
            SessionEntry::Message(MessageEntry {
                meta: EntryMeta {
                    id: id.into(),
                    parent_id: parent.map(str::to_string),
                },
                message: Message::user(id.to_string()),
            })
        };
        store.insert("root".into(), mk("root", None));
        store.insert("a".into(), mk("a", Some("root")));
        store.insert("b".into(), mk("b", Some("a")));
        store.insert("c".into(), mk("c", Some("a")));

        let unique =
            collect_entries_for_branch_summary("b", "c", |id| store.get(id).cloned());
        let ids: Vec<&str> = unique.iter().filter_map(|e| e.id()).collect();
        assert_eq!(ids, vec!["b"]);
    }

    #[test]
    fn branch_truncation_keeps_first_and_last_two() {
        let entries: Vec<SessionEntry> = (0..6)
            .map(|i| long_user(&format!("e{i}"), 4000))
            .collect();
        let messages = prepare_branch_messages(&entries, 100);
        assert_eq!(messages.len(), 5);
        match &messages[2] {
            Message::User(u) => {
                assert!(u.content.to_text().contains("middle of branch omitted"))
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn branch_within_budget_is_not_truncated() {
        let entries: Vec<SessionEntry> =
            (0..6).map(|i| long_user(&format!("e{i}"), 40)).collect();
        let messages = prepare_branch_messages(&entries, 10_000);
        assert_eq!(messages.len(), 6);
    }
}
