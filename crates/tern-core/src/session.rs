// Copyright (c) 2024-2026 Tern Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Append-only JSONL session store with a parent-pointer DAG.
//!
//! The first line of a session file is a `session` header; every other line
//! is an entry with a unique short id and a `parentId` pointing at an
//! earlier entry.  Entries are never rewritten — compaction and branch
//! switches are themselves entries.  The "branch" from the current leaf back
//! to the root, filtered to message and compaction entries, is what a
//! provider sees.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context as _, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use tern_model::{
    now_ms, ContentBlock, Message, ThinkingLevel, ToolResultMessage, UserContent, UserMessage,
};

/// Current session file format version.
pub const SESSION_VERSION: u32 = 3;

// ─── Entry types ──────────────────────────────────────────────────────────────

/// Identity shared by every non-header entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryMeta {
    pub id: String,
    #[serde(rename = "parentId")]
    pub parent_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionHeader {
    pub version: u32,
    pub id: String,
    pub timestamp: String,
    pub cwd: String,
    #[serde(
        default,
        rename = "parentSession",
        skip_serializing_if = "Option::is_none"
    )]
    pub parent_session: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEntry {
    #[serde(flatten)]
    pub meta: EntryMeta,
    pub message: Message,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CompactionDetails {
    #[serde(default, rename = "readFiles")]
    pub read_files: Vec<String>,
    #[serde(default, rename = "modifiedFiles")]
    pub modified_files: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompactionEntry {
    #[serde(flatten)]
    pub meta: EntryMeta,
    pub summary: String,
    /// First entry on the branch kept verbatim after the cut.  `None` keeps
    /// nothing before this entry.
    #[serde(
        default,
        rename = "firstKeptEntryId",
        skip_serializing_if = "Option::is_none"
    )]
    pub first_kept_entry_id: Option<String>,
    #[serde(default, rename = "tokensBefore")]
    pub tokens_before: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<CompactionDetails>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchSummaryEntry {
    #[serde(flatten)]
    pub meta: EntryMeta,
    pub summary: String,
    #[serde(default, rename = "branchEntryIds")]
    pub branch_entry_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelChangeEntry {
    #[serde(flatten)]
    pub meta: EntryMeta,
    #[serde(rename = "modelId")]
    pub model_id: String,
    pub provider: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThinkingLevelChangeEntry {
    #[serde(flatten)]
    pub meta: EntryMeta,
    pub level: ThinkingLevel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelEntry {
    #[serde(flatten)]
    pub meta: EntryMeta,
    pub text: String,
    #[serde(rename = "targetEntryId")]
    pub target_entry_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionNameEntry {
    #[serde(flatten)]
    pub meta: EntryMeta,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomEntry {
    #[serde(flatten)]
    pub meta: EntryMeta,
    #[serde(rename = "sourceId")]
    pub source_id: String,
    pub data: Value,
}

/// One line of a session file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEntry {
    Session(SessionHeader),
    Message(MessageEntry),
    Compaction(CompactionEntry),
    BranchSummary(BranchSummaryEntry),
    ModelChange(ModelChangeEntry),
    ThinkingLevelChange(ThinkingLevelChangeEntry),
    Label(LabelEntry),
    SessionName(SessionNameEntry),
    Custom(CustomEntry),
}

impl SessionEntry {
    pub fn id(&self) -> Option<&str> {
        self.meta().map(|m| m.id.as_str())
    }

    pub fn parent_id(&self) -> Option<&str> {
        self.meta().and_then(|m| m.parent_id.as_deref())
    }

    fn meta(&self) -> Option<&EntryMeta> {
        match self {
            Self::Session(_) => None,
            Self::Message(e) => Some(&e.meta),
            Self::Compaction(e) => Some(&e.meta),
            Self::BranchSummary(e) => Some(&e.meta),
            Self::ModelChange(e) => Some(&e.meta),
            Self::ThinkingLevelChange(e) => Some(&e.meta),
            Self::Label(e) => Some(&e.meta),
            Self::SessionName(e) => Some(&e.meta),
            Self::Custom(e) => Some(&e.meta),
        }
    }
}

/// Context reconstructed from the active branch.
#[derive(Debug, Clone, Default)]
pub struct SessionContext {
    pub messages: Vec<Message>,
    pub model_id: Option<String>,
    pub provider: Option<String>,
    pub thinking_level: Option<ThinkingLevel>,
    pub name: Option<String>,
}

/// A node of the session tree (for branch visualisation).
#[derive(Debug, Clone)]
pub struct SessionTreeNode {
    pub id: String,
    pub children: Vec<SessionTreeNode>,
}

/// Summary row for the session picker.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: String,
    pub path: PathBuf,
    pub modified: std::time::SystemTime,
}

/// Aggregate statistics over the active branch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionStats {
    pub user_messages: usize,
    pub assistant_messages: usize,
    pub tool_result_messages: usize,
    pub tool_calls: usize,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_write_tokens: u64,
    pub total_cost: f64,
}

// ─── Manager ──────────────────────────────────────────────────────────────────

pub struct SessionManager {
    header: SessionHeader,
    entries: Vec<SessionEntry>,
    index: HashMap<String, usize>,
    leaf_id: Option<String>,
    session_file: Option<PathBuf>,
    session_dir: Option<PathBuf>,
}

impl SessionManager {
    /// In-memory session (no file).
    pub fn in_memory(cwd: impl Into<String>) -> Self {
        Self {
            header: new_header(cwd.into(), None),
            entries: Vec::new(),
            index: HashMap::new(),
            leaf_id: None,
            session_file: None,
            session_dir: None,
        }
    }

    /// Create a new session file under `session_dir`.
    pub fn create(cwd: impl Into<String>, session_dir: impl AsRef<Path>) -> Result<Self> {
        let session_dir = session_dir.as_ref().to_path_buf();
        fs::create_dir_all(&session_dir)
            .with_context(|| format!("creating session dir {}", session_dir.display()))?;
        let header = new_header(cwd.into(), None);
        let path = session_dir.join(format!("{}.jsonl", header.id));
        let mut manager = Self {
            header,
            entries: Vec::new(),
            index: HashMap::new(),
            leaf_id: None,
            session_file: Some(path),
            session_dir: Some(session_dir),
        };
        manager.write_line(&SessionEntry::Session(manager.header.clone()))?;
        Ok(manager)
    }

    /// Open an existing session file, migrating older formats in memory.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let content = fs::read_to_string(&path)
            .with_context(|| format!("reading session file {}", path.display()))?;
        let raw = parse_session_entries(&content);
        let (raw, _migrated) = migrate_to_current(raw);

        let mut iter = raw.into_iter();
        let header: SessionHeader = iter
            .next()
            .and_then(|v| {
                serde_json::from_value::<SessionEntry>(v).ok().and_then(|e| {
                    match e {
                        SessionEntry::Session(h) => Some(h),
                        _ => None,
                    }
                })
            })
            .ok_or_else(|| anyhow!("not a session file: {}", path.display()))?;

        let mut manager = Self {
            header,
            entries: Vec::new(),
            index: HashMap::new(),
            leaf_id: None,
            session_file: Some(path.clone()),
            session_dir: path.parent().map(Path::to_path_buf),
        };
        for value in iter {
            match serde_json::from_value::<SessionEntry>(value) {
                Ok(SessionEntry::Session(_)) => {}
                Ok(entry) => manager.insert_loaded(entry),
                Err(e) => warn!("skipping unreadable session entry: {e}"),
            }
        }
        manager.leaf_id = manager.entries.last().and_then(|e| e.id().map(str::to_string));
        Ok(manager)
    }

    /// Open the most recently modified session for `cwd`, or create one.
    pub fn continue_recent(
        cwd: impl Into<String>,
        session_dir: impl AsRef<Path>,
    ) -> Result<Self> {
        let cwd = cwd.into();
        let sessions = Self::list_sessions(&cwd, &session_dir)?;
        match sessions.first() {
            Some(info) => Self::open(&info.path),
            None => Self::create(cwd, session_dir),
        }
    }

    /// Sessions recorded for `cwd`, newest first.
    pub fn list_sessions(
        cwd: &str,
        session_dir: impl AsRef<Path>,
    ) -> Result<Vec<SessionInfo>> {
        let dir = session_dir.as_ref();
        let mut sessions = Vec::new();
        let Ok(read_dir) = fs::read_dir(dir) else {
            return Ok(sessions);
        };
        for entry in read_dir.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            let Some(header) = read_header(&path) else {
                continue;
            };
            if header.cwd != cwd {
                continue;
            }
            let modified = entry
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
            sessions.push(SessionInfo {
                id: header.id,
                path,
                modified,
            });
        }
        sessions.sort_by(|a, b| b.modified.cmp(&a.modified));
        Ok(sessions)
    }

    // ── Accessors ─────────────────────────────────────────────────────────────

    pub fn session_id(&self) -> &str {
        &self.header.id
    }

    pub fn cwd(&self) -> &str {
        &self.header.cwd
    }

    pub fn session_file(&self) -> Option<&Path> {
        self.session_file.as_deref()
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> &[SessionEntry] {
        &self.entries
    }

    pub fn leaf_id(&self) -> Option<&str> {
        self.leaf_id.as_deref()
    }

    pub fn get_entry(&self, id: &str) -> Option<&SessionEntry> {
        self.index.get(id).map(|&i| &self.entries[i])
    }

    // ── Appends ───────────────────────────────────────────────────────────────

    /// Append a message entry.  A user message arriving while tool calls on
    /// the branch are still unanswered first closes them with synthetic
    /// "Interrupted by user message" results so the pairing invariant holds.
    pub fn append_message(&mut self, message: Message) -> Result<String> {
        if matches!(message, Message::User(_)) {
            for (id, name) in self.dangling_tool_calls() {
                self.push_entry(|meta| {
                    SessionEntry::Message(MessageEntry {
                        meta,
                        message: Message::ToolResult(ToolResultMessage {
                            tool_call_id: id,
                            tool_name: name,
                            content: vec![ContentBlock::text("Interrupted by user message")],
                            details: Value::Null,
                            is_error: false,
                            timestamp: now_ms(),
                        }),
                    })
                })?;
            }
        }
        self.push_entry(|meta| SessionEntry::Message(MessageEntry { meta, message }))
    }

    pub fn append_compaction(
        &mut self,
        summary: impl Into<String>,
        first_kept_entry_id: Option<String>,
        tokens_before: u64,
        details: Option<CompactionDetails>,
    ) -> Result<String> {
        let summary = summary.into();
        self.push_entry(|meta| {
            SessionEntry::Compaction(CompactionEntry {
                meta,
                summary,
                first_kept_entry_id,
                tokens_before,
                details,
            })
        })
    }

    pub fn append_model_change(
        &mut self,
        model_id: impl Into<String>,
        provider: impl Into<String>,
    ) -> Result<String> {
        let model_id = model_id.into();
        let provider = provider.into();
        self.push_entry(|meta| {
            SessionEntry::ModelChange(ModelChangeEntry {
                meta,
                model_id,
                provider,
            })
        })
    }

    pub fn append_thinking_level_change(&mut self, level: ThinkingLevel) -> Result<String> {
        self.push_entry(|meta| {
            SessionEntry::ThinkingLevelChange(ThinkingLevelChangeEntry { meta, level })
        })
    }

    pub fn append_label(
        &mut self,
        text: impl Into<String>,
        target_entry_id: impl Into<String>,
    ) -> Result<String> {
        let text = text.into();
        let target_entry_id = target_entry_id.into();
        self.push_entry(|meta| {
            SessionEntry::Label(LabelEntry {
                meta,
                text,
                target_entry_id,
            })
        })
    }

    pub fn append_custom_entry(
        &mut self,
        source_id: impl Into<String>,
        data: Value,
    ) -> Result<String> {
        let source_id = source_id.into();
        self.push_entry(|meta| {
            SessionEntry::Custom(CustomEntry {
                meta,
                source_id,
                data,
            })
        })
    }

    pub fn set_session_name(&mut self, name: impl Into<String>) -> Result<String> {
        let name = name.into();
        self.push_entry(|meta| SessionEntry::SessionName(SessionNameEntry { meta, name }))
    }

    /// The most recently set session name.
    pub fn get_session_name(&self) -> Option<&str> {
        self.entries.iter().rev().find_map(|e| match e {
            SessionEntry::SessionName(n) => Some(n.name.as_str()),
            _ => None,
        })
    }

    /// The most recent label attached to `target_entry_id`.
    pub fn get_label(&self, target_entry_id: &str) -> Option<&str> {
        self.entries.iter().rev().find_map(|e| match e {
            SessionEntry::Label(l) if l.target_entry_id == target_entry_id => {
                Some(l.text.as_str())
            }
            _ => None,
        })
    }

    // ── Branching ─────────────────────────────────────────────────────────────

    /// Move the leaf to `entry_id`; subsequent appends fork a new branch.
    pub fn branch(&mut self, entry_id: &str) -> Result<()> {
        if !self.index.contains_key(entry_id) {
            bail!("unknown entry id: {entry_id}");
        }
        self.leaf_id = Some(entry_id.to_string());
        Ok(())
    }

    /// Detach the leaf entirely; the next append becomes a new root.
    pub fn reset_leaf(&mut self) {
        self.leaf_id = None;
    }

    /// Branch to `entry_id` and record a summary of the abandoned path as
    /// the first entry of the new branch.
    pub fn branch_with_summary(
        &mut self,
        entry_id: &str,
        summary: impl Into<String>,
        branch_entry_ids: Vec<String>,
    ) -> Result<String> {
        self.branch(entry_id)?;
        let summary = summary.into();
        self.push_entry(|meta| {
            SessionEntry::BranchSummary(BranchSummaryEntry {
                meta,
                summary,
                branch_entry_ids,
            })
        })
    }

    /// Copy the current branch into a new session file whose header records
    /// this session as parent.  Returns the new file's path.
    pub fn create_branched_session(&self) -> Result<Option<PathBuf>> {
        let Some(dir) = &self.session_dir else {
            return Ok(None);
        };
        let mut header = new_header(self.header.cwd.clone(), Some(self.header.id.clone()));
        header.timestamp = iso_now();
        let path = dir.join(format!("{}.jsonl", header.id));
        let mut file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("creating branched session {}", path.display()))?;
        writeln!(
            file,
            "{}",
            serde_json::to_string(&SessionEntry::Session(header))?
        )?;
        for entry in self.get_branch(None) {
            writeln!(file, "{}", serde_json::to_string(&entry)?)?;
        }
        Ok(Some(path))
    }

    /// Entries from the root to `leaf_id` (default: the current leaf), in
    /// chronological order.
    pub fn get_branch(&self, leaf_id: Option<&str>) -> Vec<SessionEntry> {
        let mut path = Vec::new();
        let mut current = leaf_id
            .map(str::to_string)
            .or_else(|| self.leaf_id.clone());
        while let Some(id) = current {
            let Some(entry) = self.get_entry(&id) else {
                break;
            };
            path.push(entry.clone());
            current = entry.parent_id().map(str::to_string);
        }
        path.reverse();
        path
    }

    /// Root nodes of the session tree with nested children.
    pub fn get_tree(&self) -> Vec<SessionTreeNode> {
        let mut children: HashMap<Option<String>, Vec<String>> = HashMap::new();
        for entry in &self.entries {
            if let Some(id) = entry.id() {
                children
                    .entry(entry.parent_id().map(str::to_string))
                    .or_default()
                    .push(id.to_string());
            }
        }
        fn build(id: &str, children: &HashMap<Option<String>, Vec<String>>) -> SessionTreeNode {
            SessionTreeNode {
                id: id.to_string(),
                children: children
                    .get(&Some(id.to_string()))
                    .map(|kids| kids.iter().map(|k| build(k, children)).collect())
                    .unwrap_or_default(),
            }
        }
        children
            .get(&None)
            .map(|roots| roots.iter().map(|r| build(r, &children)).collect())
            .unwrap_or_default()
    }

    /// User messages that make sense as fork points, as (entry id, text)
    /// pairs in insertion order.
    pub fn forkable_user_messages(&self) -> Vec<(String, String)> {
        self.entries
            .iter()
            .filter_map(|e| match e {
                SessionEntry::Message(m) => match &m.message {
                    Message::User(u) => {
                        let text = u.content.to_text();
                        if text.is_empty() {
                            None
                        } else {
                            Some((m.meta.id.clone(), text))
                        }
                    }
                    _ => None,
                },
                _ => None,
            })
            .collect()
    }

    /// Aggregate message counts, token usage, and cost over the active
    /// branch.
    pub fn stats(&self) -> SessionStats {
        let mut stats = SessionStats::default();
        for entry in self.get_branch(None) {
            let SessionEntry::Message(m) = entry else {
                continue;
            };
            match &m.message {
                Message::User(_) => stats.user_messages += 1,
                Message::Assistant(a) => {
                    stats.assistant_messages += 1;
                    stats.tool_calls += a.tool_calls().len();
                    stats.input_tokens += a.usage.input;
                    stats.output_tokens += a.usage.output;
                    stats.cache_read_tokens += a.usage.cache_read;
                    stats.cache_write_tokens += a.usage.cache_write;
                    stats.total_cost += a.usage.cost.total;
                }
                Message::ToolResult(_) => stats.tool_result_messages += 1,
            }
        }
        stats
    }

    // ── Context reconstruction ────────────────────────────────────────────────

    /// Rebuild the provider-facing context from the active branch.  The last
    /// compaction entry becomes the cut point: a synthetic `[Summary]` user
    /// message followed by the entries kept after the cut.
    pub fn build_context(&self) -> SessionContext {
        let branch = self.get_branch(None);
        let mut ctx = SessionContext::default();

        // Position of each id on the branch, for resolving the kept range.
        let positions: HashMap<&str, usize> = branch
            .iter()
            .enumerate()
            .filter_map(|(i, e)| e.id().map(|id| (id, i)))
            .collect();

        let last_compaction = branch.iter().enumerate().rev().find_map(|(i, e)| match e {
            SessionEntry::Compaction(c) => Some((i, c)),
            _ => None,
        });

        let kept_start = match &last_compaction {
            Some((ci, compaction)) => {
                ctx.messages.push(Message::User(UserMessage {
                    content: UserContent::Text(format!("[Summary]\n{}", compaction.summary)),
                    timestamp: now_ms(),
                }));
                compaction
                    .first_kept_entry_id
                    .as_deref()
                    .and_then(|id| positions.get(id).copied())
                    .unwrap_or(ci + 1)
            }
            None => 0,
        };

        for (i, entry) in branch.iter().enumerate() {
            match entry {
                SessionEntry::Message(m) if i >= kept_start => {
                    ctx.messages.push(m.message.clone());
                }
                SessionEntry::BranchSummary(b) if i >= kept_start => {
                    ctx.messages.push(Message::User(UserMessage {
                        content: UserContent::Text(format!("[Branch summary]\n{}", b.summary)),
                        timestamp: now_ms(),
                    }));
                }
                SessionEntry::ModelChange(m) => {
                    ctx.model_id = Some(m.model_id.clone());
                    ctx.provider = Some(m.provider.clone());
                }
                SessionEntry::ThinkingLevelChange(t) => {
                    ctx.thinking_level = Some(t.level);
                }
                SessionEntry::SessionName(n) => {
                    ctx.name = Some(n.name.clone());
                }
                _ => {}
            }
        }

        ctx.messages = ensure_tool_result_pairing(ctx.messages);
        ctx
    }

    // ── Internals ─────────────────────────────────────────────────────────────

    fn push_entry(
        &mut self,
        build: impl FnOnce(EntryMeta) -> SessionEntry,
    ) -> Result<String> {
        let id = self.generate_id();
        let meta = EntryMeta {
            id: id.clone(),
            parent_id: self.leaf_id.clone(),
        };
        let entry = build(meta);
        self.write_line(&entry)?;
        self.index.insert(id.clone(), self.entries.len());
        self.entries.push(entry);
        self.leaf_id = Some(id.clone());
        Ok(id)
    }

    fn insert_loaded(&mut self, entry: SessionEntry) {
        if let Some(id) = entry.id() {
            self.index.insert(id.to_string(), self.entries.len());
        }
        self.entries.push(entry);
    }

    fn generate_id(&self) -> String {
        loop {
            let id = short_id();
            if !self.index.contains_key(&id) {
                return id;
            }
        }
    }

    fn write_line(&self, entry: &SessionEntry) -> Result<()> {
        let Some(path) = &self.session_file else {
            return Ok(());
        };
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("opening session file {}", path.display()))?;
        writeln!(file, "{}", serde_json::to_string(entry)?)?;
        Ok(())
    }

    /// Tool calls on the current branch without a matching result.
    fn dangling_tool_calls(&self) -> Vec<(String, String)> {
        let mut pending: Vec<(String, String)> = Vec::new();
        for entry in self.get_branch(None) {
            if let SessionEntry::Message(m) = entry {
                match &m.message {
                    Message::Assistant(a) => {
                        for call in a.tool_calls() {
                            pending.push((call.id, call.name));
                        }
                    }
                    Message::ToolResult(tr) => {
                        pending.retain(|(id, _)| *id != tr.tool_call_id);
                    }
                    Message::User(_) => pending.clear(),
                }
            }
        }
        pending
    }
}

/// Insert synthetic results for tool calls that never got one before the
/// next user message or the end of history.
fn ensure_tool_result_pairing(messages: Vec<Message>) -> Vec<Message> {
    let mut result = Vec::with_capacity(messages.len());
    let mut pending: Vec<(String, String)> = Vec::new();

    for message in messages {
        match &message {
            Message::Assistant(a) => {
                // A new assistant turn means earlier calls must be closed.
                for (id, name) in pending.drain(..) {
                    result.push(interrupted_result(id, name));
                }
                for call in a.tool_calls() {
                    pending.push((call.id, call.name));
                }
                result.push(message);
            }
            Message::ToolResult(tr) => {
                pending.retain(|(id, _)| *id != tr.tool_call_id);
                result.push(message);
            }
            Message::User(_) => {
                for (id, name) in pending.drain(..) {
                    result.push(interrupted_result(id, name));
                }
                result.push(message);
            }
        }
    }
    result
}

fn interrupted_result(id: String, name: String) -> Message {
    Message::ToolResult(ToolResultMessage {
        tool_call_id: id,
        tool_name: name,
        content: vec![ContentBlock::text("Interrupted by user message")],
        details: Value::Null,
        is_error: false,
        timestamp: now_ms(),
    })
}

// ─── Parsing and migrations ──────────────────────────────────────────────────

/// Parse session lines, skipping malformed ones.
pub fn parse_session_entries(content: &str) -> Vec<Value> {
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match serde_json::from_str::<Value>(line) {
            Ok(v) => Some(v),
            Err(_) => {
                warn!("skipping malformed session line");
                None
            }
        })
        .collect()
}

/// Migrate raw entries to the current format version.
///
/// - v1 entries carry no ids: assign fresh ids and chain parents in file
///   order.
/// - v2 used the `hookMessage` type, renamed to `custom`.
pub fn migrate_to_current(mut entries: Vec<Value>) -> (Vec<Value>, bool) {
    let version = entries
        .first()
        .and_then(|h| h["version"].as_u64())
        .unwrap_or(1) as u32;
    if version >= SESSION_VERSION {
        return (entries, false);
    }

    if version < 2 {
        let mut previous: Option<String> = None;
        for entry in entries.iter_mut().skip(1) {
            if entry.get("id").and_then(Value::as_str).is_none() {
                entry["id"] = Value::String(short_id());
            }
            let id = entry["id"].as_str().map(str::to_string);
            entry["parentId"] = match &previous {
                Some(p) => Value::String(p.clone()),
                None => Value::Null,
            };
            previous = id;
        }
    }

    if version < 3 {
        for entry in entries.iter_mut().skip(1) {
            if entry["type"] == "hookMessage" {
                entry["type"] = Value::String("custom".into());
            }
        }
    }

    if let Some(header) = entries.first_mut() {
        header["version"] = Value::from(SESSION_VERSION);
    }
    (entries, true)
}

/// Whether `path` starts with a parseable session header.
pub fn is_valid_session_file(path: impl AsRef<Path>) -> bool {
    read_header(path.as_ref()).is_some()
}

fn read_header(path: &Path) -> Option<SessionHeader> {
    let content = fs::read_to_string(path).ok()?;
    let first = content.lines().find(|l| !l.trim().is_empty())?;
    let value: Value = serde_json::from_str(first).ok()?;
    if value["type"] != "session" {
        return None;
    }
    // Tolerate pre-v3 headers that lack newer fields.
    Some(SessionHeader {
        version: value["version"].as_u64().unwrap_or(1) as u32,
        id: value["id"].as_str().unwrap_or_default().to_string(),
        timestamp: value["timestamp"].as_str().unwrap_or_default().to_string(),
        cwd: value["cwd"].as_str().unwrap_or_default().to_string(),
        parent_session: value["parentSession"].as_str().map(str::to_string),
    })
}

/// Raw entries of a session file after migration.
pub fn load_entries_from_file(path: impl AsRef<Path>) -> Result<Vec<Value>> {
    let content = fs::read_to_string(path.as_ref())?;
    let (entries, _) = migrate_to_current(parse_session_entries(&content));
    Ok(entries)
}

fn new_header(cwd: String, parent_session: Option<String>) -> SessionHeader {
    SessionHeader {
        version: SESSION_VERSION,
        id: uuid::Uuid::new_v4().simple().to_string(),
        timestamp: iso_now(),
        cwd,
        parent_session,
    }
}

fn iso_now() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

/// 8-character base36 id, unique enough for one session's entry count.
fn short_id() -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut n = uuid::Uuid::new_v4().as_u128();
    let mut out = [0u8; 8];
    for slot in &mut out {
        *slot = DIGITS[(n % 36) as usize];
        n /= 36;
    }
    String::from_utf8_lossy(&out).into_owned()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tern_model::AssistantMessage;

    fn assistant_with_tool_call(id: &str, name: &str) -> Message {
        let model = tern_model::Model {
            id: "m".into(),
            name: "M".into(),
            api: "mock".into(),
            provider: "mock".into(),
            base_url: String::new(),
            reasoning: false,
            input: vec![tern_model::InputModality::Text],
            cost: Default::default(),
            context_window: 0,
            max_tokens: 0,
            headers: None,
            compat: None,
        };
        let mut a = AssistantMessage::empty_for(&model);
        a.stop_reason = tern_model::StopReason::ToolUse;
        a.content = vec![ContentBlock::tool_call(id, name, json!({}))];
        Message::Assistant(a)
    }

    fn assistant_text(text: &str) -> Message {
        let model = tern_model::Model {
            id: "m".into(),
            name: "M".into(),
            api: "mock".into(),
            provider: "mock".into(),
            base_url: String::new(),
            reasoning: false,
            input: vec![tern_model::InputModality::Text],
            cost: Default::default(),
            context_window: 0,
            max_tokens: 0,
            headers: None,
            compat: None,
        };
        let mut a = AssistantMessage::empty_for(&model);
        a.content = vec![ContentBlock::text(text)];
        Message::Assistant(a)
    }

    // ── Parsing ───────────────────────────────────────────────────────────────

    #[test]
    fn parse_skips_malformed_lines() {
        let content = "{\"type\":\"session\",\"version\":3}\nnot json\n{\"type\":\"label\"}\n";
        let entries = parse_session_entries(content);
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn parse_empty_content() {
        assert!(parse_session_entries("").is_empty());
        assert!(parse_session_entries("\n\n\n").is_empty());
    }

    // ── Id generation ─────────────────────────────────────────────────────────

    #[test]
    fn short_ids_are_unique_and_base36() {
        let mut seen = std::collections::HashSet::new();
        for _ in 0..200 {
            let id = short_id();
            assert_eq!(id.len(), 8);
            assert!(id.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit()));
            assert!(seen.insert(id));
        }
    }

    // ── Appends and parent chain ──────────────────────────────────────────────

    #[test]
    fn appends_chain_parent_pointers() {
        let mut mgr = SessionManager::in_memory("/tmp/test");
        let id1 = mgr.append_message(Message::user("q1")).unwrap();
        let id2 = mgr.append_message(assistant_text("a1")).unwrap();
        let id3 = mgr.append_message(Message::user("q2")).unwrap();

        assert_eq!(mgr.entry_count(), 3);
        assert_eq!(mgr.leaf_id(), Some(id3.as_str()));
        assert_eq!(mgr.get_entry(&id2).unwrap().parent_id(), Some(id1.as_str()));
        assert_eq!(mgr.get_entry(&id3).unwrap().parent_id(), Some(id2.as_str()));
        // Branch connectivity: every parent id resolves.
        for entry in mgr.entries() {
            if let Some(parent) = entry.parent_id() {
                assert!(mgr.get_entry(parent).is_some());
            }
        }
    }

    #[test]
    fn user_message_closes_dangling_tool_calls() {
        let mut mgr = SessionManager::in_memory("/tmp/test");
        mgr.append_message(Message::user("q")).unwrap();
        mgr.append_message(assistant_with_tool_call("t1", "ls")).unwrap();
        // User interrupts before the tool result is recorded.
        mgr.append_message(Message::user("never mind")).unwrap();

        let branch = mgr.get_branch(None);
        assert_eq!(branch.len(), 4);
        match &branch[2] {
            SessionEntry::Message(m) => match &m.message {
                Message::ToolResult(tr) => {
                    assert_eq!(tr.tool_call_id, "t1");
                    assert_eq!(
                        tr.content[0].as_text(),
                        Some("Interrupted by user message")
                    );
                }
                other => panic!("expected synthetic tool result, got {other:?}"),
            },
            other => panic!("expected message entry, got {other:?}"),
        }
    }

    // ── Branching ─────────────────────────────────────────────────────────────

    #[test]
    fn branch_forks_the_parent_chain() {
        let mut mgr = SessionManager::in_memory("/tmp/test");
        let id1 = mgr.append_message(Message::user("q1")).unwrap();
        mgr.append_message(assistant_text("a1")).unwrap();

        mgr.branch(&id1).unwrap();
        let id3 = mgr.append_message(assistant_text("a1-alt")).unwrap();
        assert_eq!(mgr.get_entry(&id3).unwrap().parent_id(), Some(id1.as_str()));
    }

    #[test]
    fn branch_to_unknown_id_fails() {
        let mut mgr = SessionManager::in_memory("/tmp/test");
        assert!(mgr.branch("nonexistent").is_err());
    }

    #[test]
    fn reset_leaf_starts_a_new_root() {
        let mut mgr = SessionManager::in_memory("/tmp/test");
        mgr.append_message(Message::user("q1")).unwrap();
        mgr.reset_leaf();
        assert_eq!(mgr.leaf_id(), None);
        let id = mgr.append_message(Message::user("q2")).unwrap();
        assert_eq!(mgr.get_entry(&id).unwrap().parent_id(), None);
    }

    #[test]
    fn branch_with_summary_records_abandoned_ids() {
        let mut mgr = SessionManager::in_memory("/tmp/test");
        let id1 = mgr.append_message(Message::user("q1")).unwrap();
        let id2 = mgr.append_message(assistant_text("a1")).unwrap();

        let summary_id = mgr
            .branch_with_summary(&id1, "explored and abandoned", vec![id2.clone()])
            .unwrap();
        match mgr.get_entry(&summary_id).unwrap() {
            SessionEntry::BranchSummary(b) => {
                assert_eq!(b.summary, "explored and abandoned");
                assert_eq!(b.branch_entry_ids, vec![id2]);
                assert_eq!(b.meta.parent_id.as_deref(), Some(id1.as_str()));
            }
            other => panic!("expected branch summary, got {other:?}"),
        }
    }

    #[test]
    fn get_branch_walks_root_to_leaf() {
        let mut mgr = SessionManager::in_memory("/tmp/test");
        let id1 = mgr.append_message(Message::user("q1")).unwrap();
        let id2 = mgr.append_message(assistant_text("a1")).unwrap();
        let id3 = mgr.append_message(Message::user("q2")).unwrap();

        let path = mgr.get_branch(None);
        let ids: Vec<&str> = path.iter().filter_map(|e| e.id()).collect();
        assert_eq!(ids, vec![id1.as_str(), id2.as_str(), id3.as_str()]);

        let partial = mgr.get_branch(Some(&id2));
        assert_eq!(partial.len(), 2);
    }

    #[test]
    fn get_tree_shows_both_children_after_fork() {
        let mut mgr = SessionManager::in_memory("/tmp/test");
        let root = mgr.append_message(Message::user("q1")).unwrap();
        mgr.append_message(assistant_text("a1")).unwrap();
        mgr.branch(&root).unwrap();
        mgr.append_message(assistant_text("a1-alt")).unwrap();

        let tree = mgr.get_tree();
        assert_eq!(tree.len(), 1);
        assert_eq!(tree[0].id, root);
        assert_eq!(tree[0].children.len(), 2);
    }

    // ── Context building ──────────────────────────────────────────────────────

    #[test]
    fn build_context_returns_branch_messages() {
        let mut mgr = SessionManager::in_memory("/tmp/test");
        mgr.append_message(Message::user("hello")).unwrap();
        mgr.append_message(assistant_text("hi")).unwrap();
        let ctx = mgr.build_context();
        assert_eq!(ctx.messages.len(), 2);
        assert_eq!(ctx.messages[0].role(), "user");
        assert_eq!(ctx.messages[1].role(), "assistant");
    }

    #[test]
    fn build_context_tracks_model_and_thinking_changes() {
        let mut mgr = SessionManager::in_memory("/tmp/test");
        mgr.append_model_change("claude-opus-4-6", "anthropic").unwrap();
        mgr.append_thinking_level_change(ThinkingLevel::High).unwrap();
        mgr.append_message(Message::user("test")).unwrap();

        let ctx = mgr.build_context();
        assert_eq!(ctx.model_id.as_deref(), Some("claude-opus-4-6"));
        assert_eq!(ctx.provider.as_deref(), Some("anthropic"));
        assert_eq!(ctx.thinking_level, Some(ThinkingLevel::High));
        assert_eq!(ctx.messages.len(), 1);
    }

    #[test]
    fn build_context_applies_compaction_cut() {
        let mut mgr = SessionManager::in_memory("/tmp/test");
        mgr.append_message(Message::user("old question")).unwrap();
        mgr.append_message(assistant_text("old answer")).unwrap();
        let kept = mgr.append_message(Message::user("recent question")).unwrap();
        let kept_answer = mgr.append_message(assistant_text("recent answer")).unwrap();
        mgr.append_compaction("S", Some(kept.clone()), 1000, None)
            .unwrap();
        mgr.append_message(Message::user("new question")).unwrap();

        let ctx = mgr.build_context();
        // summary + kept user + kept assistant + new user
        assert_eq!(ctx.messages.len(), 4);
        match &ctx.messages[0] {
            Message::User(u) => assert_eq!(u.content.to_text(), "[Summary]\nS"),
            other => panic!("expected summary user message, got {other:?}"),
        }
        match &ctx.messages[1] {
            Message::User(u) => assert_eq!(u.content.to_text(), "recent question"),
            other => panic!("unexpected: {other:?}"),
        }
        let _ = kept_answer;
    }

    #[test]
    fn build_context_without_first_kept_drops_everything_before_cut() {
        let mut mgr = SessionManager::in_memory("/tmp/test");
        mgr.append_message(Message::user("old")).unwrap();
        mgr.append_compaction("S", None, 500, None).unwrap();
        mgr.append_message(Message::user("new")).unwrap();

        let ctx = mgr.build_context();
        assert_eq!(ctx.messages.len(), 2);
        match &ctx.messages[0] {
            Message::User(u) => assert!(u.content.to_text().starts_with("[Summary]")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    // ── File persistence ──────────────────────────────────────────────────────

    #[test]
    fn create_and_reopen_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut mgr = SessionManager::create("/tmp/test", dir.path()).unwrap();
        mgr.append_message(Message::user("hello")).unwrap();
        mgr.append_message(assistant_text("hi")).unwrap();

        let path = mgr.session_file().unwrap().to_path_buf();
        assert!(path.exists());

        let reopened = SessionManager::open(&path).unwrap();
        assert_eq!(reopened.session_id(), mgr.session_id());
        assert_eq!(reopened.entry_count(), 2);
        assert_eq!(reopened.leaf_id(), mgr.leaf_id());
        // Entries round-trip exactly.
        assert_eq!(reopened.entries(), mgr.entries());
    }

    #[test]
    fn continue_recent_finds_existing_session() {
        let dir = tempfile::tempdir().unwrap();
        let mut mgr = SessionManager::create("/tmp/test", dir.path()).unwrap();
        mgr.append_message(Message::user("hello")).unwrap();

        let resumed = SessionManager::continue_recent("/tmp/test", dir.path()).unwrap();
        assert_eq!(resumed.session_id(), mgr.session_id());

        // A different cwd starts fresh.
        let other = SessionManager::continue_recent("/tmp/other", dir.path()).unwrap();
        assert_ne!(other.session_id(), mgr.session_id());
    }

    #[test]
    fn list_sessions_filters_by_cwd() {
        let dir = tempfile::tempdir().unwrap();
        let mut a = SessionManager::create("/tmp/a", dir.path()).unwrap();
        a.append_message(Message::user("1")).unwrap();
        let mut b = SessionManager::create("/tmp/b", dir.path()).unwrap();
        b.append_message(Message::user("2")).unwrap();

        let sessions = SessionManager::list_sessions("/tmp/a", dir.path()).unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].id, a.session_id());
    }

    #[test]
    fn valid_and_invalid_session_files() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.jsonl");
        fs::write(&good, "{\"type\":\"session\",\"version\":3,\"id\":\"x\",\"timestamp\":\"t\",\"cwd\":\"/\"}\n").unwrap();
        assert!(is_valid_session_file(&good));

        let bad = dir.path().join("bad.jsonl");
        fs::write(&bad, "{\"type\":\"message\"}\n").unwrap();
        assert!(!is_valid_session_file(&bad));
        assert!(!is_valid_session_file(dir.path().join("missing.jsonl")));
    }

    #[test]
    fn create_branched_session_records_parent() {
        let dir = tempfile::tempdir().unwrap();
        let mut mgr = SessionManager::create("/tmp/test", dir.path()).unwrap();
        mgr.append_message(Message::user("q1")).unwrap();
        mgr.append_message(assistant_text("a1")).unwrap();

        let new_path = mgr.create_branched_session().unwrap().unwrap();
        assert!(new_path.exists());
        let entries = load_entries_from_file(&new_path).unwrap();
        assert!(entries.len() >= 3);
        assert_eq!(entries[0]["type"], "session");
        assert_eq!(entries[0]["parentSession"], mgr.session_id());
    }

    // ── Migrations ────────────────────────────────────────────────────────────

    #[test]
    fn migrate_v1_assigns_ids_and_parent_chain() {
        let entries = vec![
            json!({"type": "session", "version": 1, "id": "s1", "timestamp": "t", "cwd": "/"}),
            json!({"type": "message", "message": {"role": "user", "content": "hi", "timestamp": 1}}),
            json!({"type": "message", "message": {"role": "user", "content": "again", "timestamp": 2}}),
        ];
        let (migrated, was_migrated) = migrate_to_current(entries);
        assert!(was_migrated);
        assert_eq!(migrated[0]["version"], 3);
        assert!(migrated[1]["id"].is_string());
        assert!(migrated[1]["parentId"].is_null());
        assert_eq!(migrated[2]["parentId"], migrated[1]["id"]);
    }

    #[test]
    fn migrate_v2_renames_hook_message() {
        let entries = vec![
            json!({"type": "session", "version": 2, "id": "s1", "timestamp": "t", "cwd": "/"}),
            json!({"type": "hookMessage", "id": "h1", "parentId": null,
                   "sourceId": "ext", "data": {}}),
        ];
        let (migrated, was_migrated) = migrate_to_current(entries);
        assert!(was_migrated);
        assert_eq!(migrated[1]["type"], "custom");
    }

    #[test]
    fn current_version_needs_no_migration() {
        let entries = vec![
            json!({"type": "session", "version": 3, "id": "s1", "timestamp": "t", "cwd": "/"}),
        ];
        let (_, was_migrated) = migrate_to_current(entries);
        assert!(!was_migrated);
    }

    // ── Labels, names, custom entries ─────────────────────────────────────────

    #[test]
    fn labels_attach_to_entries() {
        let mut mgr = SessionManager::in_memory("/tmp/test");
        let msg_id = mgr.append_message(Message::user("important")).unwrap();
        mgr.append_label("checkpoint", &msg_id).unwrap();
        assert_eq!(mgr.get_label(&msg_id), Some("checkpoint"));
        assert_eq!(mgr.get_label("other"), None);
    }

    #[test]
    fn session_name_uses_latest_entry() {
        let mut mgr = SessionManager::in_memory("/tmp/test");
        assert_eq!(mgr.get_session_name(), None);
        mgr.set_session_name("My Session").unwrap();
        mgr.set_session_name("Updated").unwrap();
        assert_eq!(mgr.get_session_name(), Some("Updated"));
    }

    #[test]
    fn custom_entries_round_trip_payload() {
        let mut mgr = SessionManager::in_memory("/tmp/test");
        let id = mgr
            .append_custom_entry("my_extension", json!({"key": "value"}))
            .unwrap();
        match mgr.get_entry(&id).unwrap() {
            SessionEntry::Custom(c) => {
                assert_eq!(c.source_id, "my_extension");
                assert_eq!(c.data, json!({"key": "value"}));
            }
            other => panic!("expected custom entry, got {other:?}"),
        }
    }

    #[test]
    fn forkable_messages_list_user_entries() {
        let mut mgr = SessionManager::in_memory("/tmp/test");
        let q1 = mgr.append_message(Message::user("first")).unwrap();
        mgr.append_message(assistant_text("a")).unwrap();
        let q2 = mgr.append_message(Message::user("second")).unwrap();

        let forkable = mgr.forkable_user_messages();
        assert_eq!(
            forkable,
            vec![(q1, "first".to_string()), (q2, "second".to_string())]
        );
    }

    // ── Stats ─────────────────────────────────────────────────────────────────

    #[test]
    fn stats_count_messages_and_usage_on_the_branch() {
        let mut mgr = SessionManager::in_memory("/tmp/test");
        mgr.append_message(Message::user("q")).unwrap();

        let model = tern_model::Model {
            id: "m".into(),
            name: "M".into(),
            api: "mock".into(),
            provider: "mock".into(),
            base_url: String::new(),
            reasoning: false,
            input: vec![tern_model::InputModality::Text],
            cost: Default::default(),
            context_window: 0,
            max_tokens: 0,
            headers: None,
            compat: None,
        };
        let mut a = tern_model::AssistantMessage::empty_for(&model);
        a.usage.input = 100;
        a.usage.output = 20;
        a.usage.cost.total = 0.5;
        a.content = vec![ContentBlock::tool_call("t1", "ls", serde_json::json!({}))];
        mgr.append_message(Message::Assistant(a)).unwrap();
        mgr.append_message(Message::tool_result("t1", "ls", vec![], false))
            .unwrap();

        let stats = mgr.stats();
        assert_eq!(stats.user_messages, 1);
        assert_eq!(stats.assistant_messages, 1);
        assert_eq!(stats.tool_result_messages, 1);
        assert_eq!(stats.tool_calls, 1);
        assert_eq!(stats.input_tokens, 100);
        assert_eq!(stats.output_tokens, 20);
        assert!((stats.total_cost - 0.5).abs() < 1e-9);
    }

    // ── Pairing pass ──────────────────────────────────────────────────────────

    #[test]
    fn pairing_pass_closes_calls_before_next_assistant() {
        let messages = vec![
            assistant_with_tool_call("t1", "ls"),
            assistant_text("forgot the result"),
        ];
        let paired = ensure_tool_result_pairing(messages);
        assert_eq!(paired.len(), 3);
        assert_eq!(paired[1].role(), "tool_result");
    }

    // ── Wire format ───────────────────────────────────────────────────────────

    #[test]
    fn entries_serialise_with_camel_case_keys() {
        let entry = SessionEntry::Compaction(CompactionEntry {
            meta: EntryMeta {
                id: "abc12345".into(),
                parent_id: Some("def67890".into()),
            },
            summary: "S".into(),
            first_kept_entry_id: Some("k".into()),
            tokens_before: 9,
            details: Some(CompactionDetails {
                read_files: vec!["a.rs".into()],
                modified_files: vec![],
            }),
        });
        let v = serde_json::to_value(&entry).unwrap();
        assert_eq!(v["type"], "compaction");
        assert_eq!(v["parentId"], "def67890");
        assert_eq!(v["firstKeptEntryId"], "k");
        assert_eq!(v["tokensBefore"], 9);
        assert_eq!(v["details"]["readFiles"][0], "a.rs");
    }
}
