// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The append-only session log.
//!
//! [`SessionManager`] owns one JSONL file (or an in-memory log) holding a
//! parent-linked tree of entries. Appends chain off the leaf cursor;
//! [`SessionManager::branch`] moves the cursor backward to fork the tree.
//! The first append after loading an existing file rewrites it once to heal
//! torn tails; every append after that is a single `O(1)` line write.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use tern_model::Message;

use crate::context::{build_session_context, path_to, SessionContext};
use crate::entries::{
    DisplayMessage, EntryKind, SessionEntry, SessionHeader, StoredMessage, SESSION_VERSION,
};
use crate::migrate::{load_entries_from_file, migrate_session_entries};

/// 8-hex-char entry id, re-rolled until `is_taken` clears it.
pub(crate) fn generate_entry_id(is_taken: impl Fn(&str) -> bool) -> String {
    loop {
        let candidate = Uuid::new_v4().simple().to_string()[..8].to_string();
        if !is_taken(&candidate) {
            return candidate;
        }
    }
}

fn timestamp_now() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// One node of the materialized session tree.
#[derive(Debug, Clone)]
pub struct SessionNode {
    pub entry: SessionEntry,
    pub label: Option<String>,
    pub children: Vec<SessionNode>,
}

/// Summary of a session file, as produced by [`SessionManager::list`].
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub path: PathBuf,
    pub id: String,
    pub cwd: String,
    pub name: Option<String>,
    /// Timestamp of the newest message, falling back to the file mtime.
    pub modified: DateTime<Utc>,
    pub message_count: usize,
}

pub struct SessionManager {
    path: Option<PathBuf>,
    header: SessionHeader,
    entries: Vec<SessionEntry>,
    index: HashMap<String, usize>,
    labels: HashMap<String, String>,
    leaf_id: Option<String>,
    name: Option<String>,
    needs_rewrite: bool,
}

impl SessionManager {
    // ── Construction ──────────────────────────────────────────────────────────

    /// A log that never touches disk. Used by frontends for scratch
    /// conversations and throughout the test suites.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            header: new_header(None),
            entries: Vec::new(),
            index: HashMap::new(),
            labels: HashMap::new(),
            leaf_id: None,
            name: None,
            needs_rewrite: false,
        }
    }

    /// Open a session file, creating or recovering it as needed.
    ///
    /// A missing, empty, or corrupt file is treated as absent: a fresh
    /// header is written immediately. Older format versions are migrated and
    /// the file rewritten atomically before use.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut records = load_entries_from_file(&path);

        if records.is_empty() {
            let mut manager = Self::in_memory();
            manager.path = Some(path);
            manager.write_header_only()?;
            return Ok(manager);
        }

        let migrated = migrate_session_entries(&mut records);
        let header: SessionHeader = serde_json::from_value(records[0].clone())
            .with_context(|| format!("parsing session header in {}", path.display()))?;

        let mut manager = Self {
            path: Some(path),
            header,
            entries: Vec::new(),
            index: HashMap::new(),
            labels: HashMap::new(),
            leaf_id: None,
            name: None,
            needs_rewrite: true,
        };
        for record in records.into_iter().skip(1) {
            match serde_json::from_value::<SessionEntry>(record) {
                Ok(entry) => manager.track(entry),
                Err(err) => warn!(%err, "skipping unreadable session entry"),
            }
        }
        if migrated {
            manager.rewrite_file()?;
            manager.needs_rewrite = false;
        }
        Ok(manager)
    }

    /// Create a fresh session file in `dir`, named by creation time.
    pub fn create(dir: impl AsRef<Path>, cwd: Option<String>) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)
            .with_context(|| format!("creating session directory {}", dir.display()))?;
        set_mode(dir, 0o700);

        let header = new_header(cwd);
        let file_name = format!(
            "{}-{}.jsonl",
            Utc::now().format("%Y%m%d-%H%M%S"),
            &header.id[..8.min(header.id.len())]
        );
        let path = dir.join(file_name);

        let mut manager = Self::in_memory();
        manager.header = header;
        manager.path = Some(path);
        manager.write_header_only()?;
        Ok(manager)
    }

    /// Enumerate the session files in `dir`, newest activity first.
    pub fn list(dir: impl AsRef<Path>) -> Vec<SessionInfo> {
        let Ok(read_dir) = fs::read_dir(dir.as_ref()) else {
            return Vec::new();
        };
        let mut sessions: Vec<SessionInfo> = Vec::new();
        for dir_entry in read_dir.flatten() {
            let path = dir_entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            let records = load_entries_from_file(&path);
            if records.is_empty() {
                continue;
            }
            let Ok(header) = serde_json::from_value::<SessionHeader>(records[0].clone()) else {
                continue;
            };

            let mut name = None;
            let mut message_count = 0usize;
            let mut latest_ms: Option<i64> = None;
            for record in &records[1..] {
                match record["type"].as_str() {
                    Some("message") => {
                        message_count += 1;
                        if let Some(ts) = record["message"]["timestamp"].as_i64() {
                            latest_ms = Some(latest_ms.map_or(ts, |prev: i64| prev.max(ts)));
                        }
                    }
                    Some("session_info") => {
                        name = record["name"].as_str().map(str::to_string);
                    }
                    _ => {}
                }
            }

            let modified = latest_ms
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
                .or_else(|| {
                    dir_entry
                        .metadata()
                        .and_then(|m| m.modified())
                        .ok()
                        .map(DateTime::<Utc>::from)
                })
                .unwrap_or_else(Utc::now);

            sessions.push(SessionInfo {
                path,
                id: header.id,
                cwd: header.cwd,
                name,
                modified,
                message_count,
            });
        }
        sessions.sort_by(|a, b| b.modified.cmp(&a.modified));
        sessions
    }

    // ── Accessors ─────────────────────────────────────────────────────────────

    pub fn get_header(&self) -> &SessionHeader {
        &self.header
    }

    pub fn get_session_file(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn get_entries(&self) -> &[SessionEntry] {
        &self.entries
    }

    pub fn get_entry(&self, id: &str) -> Option<&SessionEntry> {
        self.index.get(id).map(|&i| &self.entries[i])
    }

    pub fn get_children(&self, id: &str) -> Vec<&SessionEntry> {
        self.entries.iter().filter(|e| e.parent_id.as_deref() == Some(id)).collect()
    }

    pub fn get_leaf_id(&self) -> Option<&str> {
        self.leaf_id.as_deref()
    }

    pub fn get_leaf_entry(&self) -> Option<&SessionEntry> {
        self.leaf_id.as_deref().and_then(|id| self.get_entry(id))
    }

    pub fn get_label(&self, id: &str) -> Option<&str> {
        self.labels.get(id).map(String::as_str)
    }

    pub fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Root-to-leaf path for `leaf` (default: the current leaf cursor).
    pub fn get_branch(&self, leaf: Option<&str>) -> Vec<SessionEntry> {
        path_to(&self.entries, leaf.or(self.leaf_id.as_deref()))
    }

    /// Materialize the tree. Forest order follows first appearance; node
    /// labels resolve through the label map (last label entry wins).
    pub fn get_tree(&self) -> Vec<SessionNode> {
        let mut children_of: HashMap<Option<&str>, Vec<&SessionEntry>> = HashMap::new();
        for entry in &self.entries {
            children_of.entry(entry.parent_id.as_deref()).or_default().push(entry);
        }
        let roots = children_of.get(&None).cloned().unwrap_or_default();
        roots.into_iter().map(|root| self.node_for(root, &children_of)).collect()
    }

    fn node_for(
        &self,
        entry: &SessionEntry,
        children_of: &HashMap<Option<&str>, Vec<&SessionEntry>>,
    ) -> SessionNode {
        let children = children_of
            .get(&Some(entry.id.as_str()))
            .map(|kids| kids.iter().map(|k| self.node_for(k, children_of)).collect())
            .unwrap_or_default();
        SessionNode {
            entry: entry.clone(),
            label: self.labels.get(&entry.id).cloned(),
            children,
        }
    }

    pub fn build_session_context(&self) -> SessionContext {
        build_session_context(&self.entries, self.leaf_id.as_deref())
    }

    pub fn build_session_context_from(&self, leaf: &str) -> SessionContext {
        build_session_context(&self.entries, Some(leaf))
    }

    /// The LLM-safe messages along the current leaf's path.
    pub fn load_messages(&self) -> Vec<Message> {
        self.build_session_context().llm_messages()
    }

    // ── Appends ───────────────────────────────────────────────────────────────

    pub fn append_message(&mut self, message: Message) -> Result<String> {
        self.append_entry(EntryKind::Message { message: StoredMessage::Llm(message) })
    }

    pub fn append_display_message(&mut self, role: &str, content: Value) -> Result<String> {
        self.append_entry(EntryKind::Message {
            message: StoredMessage::Display(DisplayMessage {
                role: role.to_string(),
                content,
                timestamp: Some(Utc::now().timestamp_millis()),
            }),
        })
    }

    pub fn append_thinking_level_change(&mut self, level: &str) -> Result<String> {
        self.append_entry(EntryKind::ThinkingLevelChange { thinking_level: level.to_string() })
    }

    pub fn append_model_change(&mut self, provider: &str, model_id: &str) -> Result<String> {
        self.append_entry(EntryKind::ModelChange {
            provider: provider.to_string(),
            model_id: model_id.to_string(),
        })
    }

    pub fn append_compaction(
        &mut self,
        summary: &str,
        first_kept_entry_id: &str,
        tokens_before: u64,
    ) -> Result<String> {
        self.append_entry(EntryKind::Compaction {
            summary: summary.to_string(),
            first_kept_entry_id: first_kept_entry_id.to_string(),
            tokens_before,
        })
    }

    pub fn append_custom_entry(&mut self, custom_type: &str, data: Value) -> Result<String> {
        self.append_entry(EntryKind::Custom { custom_type: custom_type.to_string(), data })
    }

    pub fn append_custom_message(&mut self, content: Value) -> Result<String> {
        self.append_entry(EntryKind::CustomMessage { content })
    }

    pub fn append_label_change(&mut self, target_id: &str, label: Option<&str>) -> Result<String> {
        self.append_entry(EntryKind::Label {
            target_id: target_id.to_string(),
            label: label.map(str::to_string),
        })
    }

    /// Record a session name (the latest `session_info` entry wins).
    pub fn set_name(&mut self, name: Option<&str>) -> Result<String> {
        self.append_entry(EntryKind::SessionInfo { name: name.map(str::to_string) })
    }

    pub fn append_entry(&mut self, kind: EntryKind) -> Result<String> {
        let id = generate_entry_id(|candidate| self.index.contains_key(candidate));
        let entry = SessionEntry {
            id: id.clone(),
            parent_id: self.leaf_id.clone(),
            timestamp: timestamp_now(),
            kind,
        };
        self.persist(&entry)?;
        self.track(entry);
        Ok(id)
    }

    /// Record an entry in memory and replay its side effects.
    fn track(&mut self, entry: SessionEntry) {
        match &entry.kind {
            EntryKind::Label { target_id, label } => match label {
                Some(label) => {
                    self.labels.insert(target_id.clone(), label.clone());
                }
                None => {
                    self.labels.remove(target_id);
                }
            },
            EntryKind::SessionInfo { name } => {
                self.name = name.clone();
            }
            _ => {}
        }
        self.leaf_id = Some(entry.id.clone());
        self.index.insert(entry.id.clone(), self.entries.len());
        self.entries.push(entry);
    }

    // ── Branching ─────────────────────────────────────────────────────────────

    /// Move the leaf cursor to an existing entry; future appends chain there.
    pub fn branch(&mut self, entry_id: &str) -> Result<()> {
        if !self.index.contains_key(entry_id) {
            bail!("cannot branch: unknown entry id {entry_id}");
        }
        self.leaf_id = Some(entry_id.to_string());
        Ok(())
    }

    /// Branch to `entry_id` and record what the abandoned subtree was about.
    /// Returns the id of the branch-summary entry (the new leaf).
    pub fn branch_with_summary(&mut self, entry_id: &str, summary: &str) -> Result<String> {
        if !self.index.contains_key(entry_id) {
            bail!("cannot branch: unknown entry id {entry_id}");
        }
        let from_id = self.leaf_id.clone();
        self.leaf_id = Some(entry_id.to_string());
        self.append_entry(EntryKind::BranchSummary { from_id, summary: summary.to_string() })
    }

    /// Fork the branch ending at `leaf_id` into a fresh session.
    ///
    /// The manager switches to the new session: a new header referencing the
    /// original file, the root-to-leaf path re-emitted as-is, and fresh
    /// label entries for the targets still on the path (labels elsewhere are
    /// dropped). File-backed sessions get a new sibling file.
    pub fn create_branched_session(&mut self, leaf_id: &str) -> Result<()> {
        if !self.index.contains_key(leaf_id) {
            bail!("cannot branch session: unknown entry id {leaf_id}");
        }
        let path_entries = path_to(&self.entries, Some(leaf_id));

        let mut header = new_header(Some(self.header.cwd.clone()));
        header.parent_session =
            self.path.as_ref().map(|p| p.to_string_lossy().into_owned());

        let new_path = match &self.path {
            Some(old) => {
                let dir = old.parent().unwrap_or_else(|| Path::new("."));
                let file_name = format!(
                    "{}-{}.jsonl",
                    Utc::now().format("%Y%m%d-%H%M%S"),
                    &header.id[..8.min(header.id.len())]
                );
                Some(dir.join(file_name))
            }
            None => None,
        };

        let kept_labels: Vec<(String, String)> = path_entries
            .iter()
            .filter_map(|e| self.labels.get(&e.id).map(|l| (e.id.clone(), l.clone())))
            .collect();

        self.header = header;
        self.path = new_path;
        self.entries = Vec::new();
        self.index = HashMap::new();
        self.labels = HashMap::new();
        self.name = None;
        self.leaf_id = None;
        self.needs_rewrite = false;

        if self.path.is_some() {
            self.write_header_only()?;
        }
        for entry in path_entries {
            self.persist(&entry)?;
            self.track(entry);
        }
        for (target_id, label) in kept_labels {
            self.append_label_change(&target_id, Some(&label))?;
        }
        Ok(())
    }

    // ── Persistence ───────────────────────────────────────────────────────────

    fn persist(&mut self, entry: &SessionEntry) -> Result<()> {
        let Some(path) = self.path.clone() else {
            return Ok(());
        };
        if self.needs_rewrite {
            // Heal a possibly-torn tail by rewriting the loaded state once,
            // then append the new entry as a plain line.
            self.rewrite_file()?;
            self.needs_rewrite = false;
        }
        let line = serde_json::to_string(entry).context("serializing session entry")?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening session file {}", path.display()))?;
        writeln!(file, "{line}")
            .with_context(|| format!("appending to session file {}", path.display()))?;
        Ok(())
    }

    /// Atomically rewrite the whole file from in-memory state.
    fn rewrite_file(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let mut body = serde_json::to_string(&self.header).context("serializing session header")?;
        body.push('\n');
        for entry in &self.entries {
            body.push_str(&serde_json::to_string(entry).context("serializing session entry")?);
            body.push('\n');
        }

        let tmp = path.with_extension("jsonl.tmp");
        fs::write(&tmp, body).with_context(|| format!("writing {}", tmp.display()))?;
        set_mode(&tmp, 0o600);
        fs::rename(&tmp, path)
            .with_context(|| format!("replacing session file {}", path.display()))?;
        Ok(())
    }

    fn write_header_only(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating session directory {}", parent.display()))?;
            set_mode(parent, 0o700);
        }
        let mut body =
            serde_json::to_string(&self.header).context("serializing session header")?;
        body.push('\n');
        fs::write(path, body).with_context(|| format!("writing {}", path.display()))?;
        set_mode(path, 0o600);
        Ok(())
    }
}

fn new_header(cwd: Option<String>) -> SessionHeader {
    SessionHeader {
        record_type: "session".into(),
        id: Uuid::new_v4().to_string(),
        version: Some(SESSION_VERSION),
        timestamp: timestamp_now(),
        cwd: cwd.unwrap_or_else(|| {
            std::env::current_dir()
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "/".into())
        }),
        parent_session: None,
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    let _ = fs::set_permissions(path, fs::Permissions::from_mode(mode));
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) {}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tern_model::{Api, AssistantContentBlock, AssistantMessage, StopReason, Usage};

    fn assistant_msg(text: &str) -> Message {
        Message::Assistant(AssistantMessage {
            content: vec![AssistantContentBlock::text(text)],
            api: Api::AnthropicMessages,
            provider: "anthropic".into(),
            model: "claude-test".into(),
            usage: Usage::default(),
            stop_reason: StopReason::Stop,
            error_message: None,
            timestamp: 1,
        })
    }

    // ── Append chain ──────────────────────────────────────────────────────────

    #[test]
    fn appends_chain_parents() {
        let mut session = SessionManager::in_memory();
        let id1 = session.append_message(Message::user("first")).unwrap();
        let id2 = session.append_message(assistant_msg("second")).unwrap();
        let id3 = session.append_message(Message::user("third")).unwrap();

        let entries = session.get_entries();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].id, id1);
        assert_eq!(entries[0].parent_id, None);
        assert_eq!(entries[1].parent_id.as_deref(), Some(id1.as_str()));
        assert_eq!(entries[2].parent_id.as_deref(), Some(id2.as_str()));
        assert_eq!(entries[2].id, id3);
    }

    #[test]
    fn every_entry_kind_chains_off_the_leaf() {
        let mut session = SessionManager::in_memory();
        let msg_id = session.append_message(Message::user("hello")).unwrap();
        let thinking_id = session.append_thinking_level_change("high").unwrap();
        let model_id = session.append_model_change("openai", "gpt-4").unwrap();
        let compaction_id = session.append_compaction("summary", &msg_id, 1000).unwrap();
        let custom_id =
            session.append_custom_entry("my_data", serde_json::json!({"key": "value"})).unwrap();
        session.append_message(assistant_msg("response")).unwrap();

        let parent_of = |id: &str| {
            session.get_entry(id).unwrap().parent_id.clone().unwrap()
        };
        assert_eq!(parent_of(&thinking_id), msg_id);
        assert_eq!(parent_of(&model_id), thinking_id);
        assert_eq!(parent_of(&compaction_id), model_id);
        assert_eq!(parent_of(&custom_id), compaction_id);
    }

    #[test]
    fn leaf_pointer_advances_with_appends() {
        let mut session = SessionManager::in_memory();
        assert!(session.get_leaf_id().is_none());
        assert!(session.get_leaf_entry().is_none());
        let id1 = session.append_message(Message::user("1")).unwrap();
        assert_eq!(session.get_leaf_id(), Some(id1.as_str()));
        let id2 = session.append_message(assistant_msg("2")).unwrap();
        assert_eq!(session.get_leaf_id(), Some(id2.as_str()));
        assert_eq!(session.get_leaf_entry().unwrap().id, id2);
    }

    #[test]
    fn entry_ids_are_eight_hex_chars() {
        let mut session = SessionManager::in_memory();
        let id = session.append_message(Message::user("x")).unwrap();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn get_entry_missing_returns_none() {
        let session = SessionManager::in_memory();
        assert!(session.get_entry("missing").is_none());
    }

    #[test]
    fn get_children_returns_direct_children_only() {
        let mut session = SessionManager::in_memory();
        let id1 = session.append_message(Message::user("root")).unwrap();
        let id2 = session.append_message(assistant_msg("child")).unwrap();
        session.append_message(Message::user("grandchild")).unwrap();
        let children = session.get_children(&id1);
        assert_eq!(children.iter().map(|e| e.id.as_str()).collect::<Vec<_>>(), vec![id2.as_str()]);
    }

    // ── Branching ─────────────────────────────────────────────────────────────

    #[test]
    fn branch_moves_leaf_and_forks_tree() {
        let mut session = SessionManager::in_memory();
        let id1 = session.append_message(Message::user("1")).unwrap();
        let id2 = session.append_message(assistant_msg("2")).unwrap();
        let id3 = session.append_message(Message::user("3")).unwrap();

        session.branch(&id2).unwrap();
        let id4 = session.append_message(Message::user("4-branch")).unwrap();

        let tree = session.get_tree();
        assert_eq!(tree.len(), 1);
        let root = &tree[0];
        assert_eq!(root.entry.id, id1);
        let node2 = &root.children[0];
        assert_eq!(node2.entry.id, id2);
        let grandchildren: Vec<&str> =
            node2.children.iter().map(|n| n.entry.id.as_str()).collect();
        assert!(grandchildren.contains(&id3.as_str()));
        assert!(grandchildren.contains(&id4.as_str()));
    }

    #[test]
    fn branch_unknown_id_fails() {
        let mut session = SessionManager::in_memory();
        assert!(session.branch("missing").is_err());
        assert!(session.branch_with_summary("missing", "s").is_err());
    }

    #[test]
    fn branch_with_summary_inserts_entry_at_target() {
        let mut session = SessionManager::in_memory();
        let id1 = session.append_message(Message::user("1")).unwrap();
        session.append_message(assistant_msg("2")).unwrap();
        let id3 = session.append_message(Message::user("3")).unwrap();

        let summary_id = session.branch_with_summary(&id1, "Summary of abandoned work").unwrap();
        assert_eq!(session.get_leaf_id(), Some(summary_id.as_str()));
        let entry = session.get_entry(&summary_id).unwrap();
        assert_eq!(entry.parent_id.as_deref(), Some(id1.as_str()));
        match &entry.kind {
            EntryKind::BranchSummary { from_id, summary } => {
                assert_eq!(from_id.as_deref(), Some(id3.as_str()));
                assert_eq!(summary, "Summary of abandoned work");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn branch_paths_reach_their_own_leaves() {
        let mut session = SessionManager::in_memory();
        let id1 = session.append_message(Message::user("1")).unwrap();
        let id2 = session.append_message(assistant_msg("2")).unwrap();
        session.append_message(Message::user("3")).unwrap();

        let path = session.get_branch(None);
        assert_eq!(path.len(), 3);
        assert_eq!(path[0].id, id1);

        let path = session.get_branch(Some(&id2));
        assert_eq!(path.iter().map(|e| e.id.as_str()).collect::<Vec<_>>(), vec![
            id1.as_str(),
            id2.as_str()
        ]);
    }

    // ── Labels ────────────────────────────────────────────────────────────────

    #[test]
    fn labels_set_get_and_clear() {
        let mut session = SessionManager::in_memory();
        let msg_id = session.append_message(Message::user("hello")).unwrap();

        assert!(session.get_label(&msg_id).is_none());
        let label_id = session.append_label_change(&msg_id, Some("checkpoint")).unwrap();
        assert_eq!(session.get_label(&msg_id), Some("checkpoint"));

        let entry = session.get_entry(&label_id).unwrap();
        match &entry.kind {
            EntryKind::Label { target_id, label } => {
                assert_eq!(target_id, &msg_id);
                assert_eq!(label.as_deref(), Some("checkpoint"));
            }
            other => panic!("unexpected {other:?}"),
        }

        session.append_label_change(&msg_id, None).unwrap();
        assert!(session.get_label(&msg_id).is_none());
    }

    #[test]
    fn label_last_wins() {
        let mut session = SessionManager::in_memory();
        let msg_id = session.append_message(Message::user("hello")).unwrap();
        session.append_label_change(&msg_id, Some("first")).unwrap();
        session.append_label_change(&msg_id, Some("second")).unwrap();
        session.append_label_change(&msg_id, Some("third")).unwrap();
        assert_eq!(session.get_label(&msg_id), Some("third"));
    }

    #[test]
    fn labels_appear_on_tree_nodes() {
        let mut session = SessionManager::in_memory();
        let msg1 = session.append_message(Message::user("hello")).unwrap();
        let msg2 = session.append_message(assistant_msg("hi")).unwrap();
        session.append_label_change(&msg1, Some("start")).unwrap();
        session.append_label_change(&msg2, Some("response")).unwrap();

        let tree = session.get_tree();
        let root = &tree[0];
        assert_eq!(root.entry.id, msg1);
        assert_eq!(root.label.as_deref(), Some("start"));
        let child = root.children.iter().find(|n| n.entry.id == msg2).unwrap();
        assert_eq!(child.label.as_deref(), Some("response"));
    }

    // ── Branched sessions ─────────────────────────────────────────────────────

    #[test]
    fn branched_session_keeps_path_labels_and_drops_the_rest() {
        let mut session = SessionManager::in_memory();
        let msg1 = session.append_message(Message::user("hello")).unwrap();
        let msg2 = session.append_message(assistant_msg("hi")).unwrap();
        let msg3 = session.append_message(Message::user("followup")).unwrap();

        session.append_label_change(&msg1, Some("first")).unwrap();
        session.append_label_change(&msg2, Some("second")).unwrap();
        session.append_label_change(&msg3, Some("third")).unwrap();

        session.create_branched_session(&msg2).unwrap();

        assert_eq!(session.get_label(&msg1), Some("first"));
        assert_eq!(session.get_label(&msg2), Some("second"));
        assert!(session.get_label(&msg3).is_none());

        let label_entries = session
            .get_entries()
            .iter()
            .filter(|e| matches!(e.kind, EntryKind::Label { .. }))
            .count();
        assert_eq!(label_entries, 2);
    }

    #[test]
    fn branched_session_file_references_the_original() {
        let dir = tempfile::tempdir().unwrap();
        let original = dir.path().join("session.jsonl");
        let mut session = SessionManager::open(&original).unwrap();
        session.append_message(Message::user("hello")).unwrap();
        let keep = session.append_message(assistant_msg("hi")).unwrap();
        session.append_message(Message::user("abandoned")).unwrap();

        session.create_branched_session(&keep).unwrap();

        let new_path = session.get_session_file().unwrap().to_path_buf();
        assert_ne!(new_path, original);
        assert_eq!(
            session.get_header().parent_session.as_deref(),
            Some(original.to_string_lossy().as_ref())
        );

        let reopened = SessionManager::open(&new_path).unwrap();
        assert_eq!(reopened.get_entries().len(), 2);
        assert_eq!(reopened.get_entries()[1].id, keep);
    }

    // ── Persistence ───────────────────────────────────────────────────────────

    #[test]
    fn open_writes_header_for_fresh_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.jsonl");
        let manager = SessionManager::open(&path).unwrap();
        assert_eq!(manager.get_header().record_type, "session");

        let lines: Vec<String> =
            fs::read_to_string(&path).unwrap().lines().map(str::to_string).collect();
        assert_eq!(lines.len(), 1);
        let stored: Value = serde_json::from_str(&lines[0]).unwrap();
        assert_eq!(stored["type"], "session");
        assert_eq!(stored["version"], SESSION_VERSION);
    }

    #[test]
    fn open_recovers_empty_file_with_new_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.jsonl");
        fs::write(&path, "").unwrap();
        let manager = SessionManager::open(&path).unwrap();
        assert_eq!(manager.get_session_file().unwrap(), path);
        let lines = fs::read_to_string(&path).unwrap();
        assert_eq!(lines.trim().lines().count(), 1);
    }

    #[test]
    fn messages_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.jsonl");
        {
            let mut manager = SessionManager::open(&path).unwrap();
            manager.append_message(Message::user("hello")).unwrap();
            manager.append_message(Message::user("world")).unwrap();
        }
        let manager = SessionManager::open(&path).unwrap();
        let texts: Vec<String> = manager
            .load_messages()
            .iter()
            .map(|m| match m {
                Message::User(u) => u.content.as_text(),
                other => panic!("unexpected {}", other.role()),
            })
            .collect();
        assert_eq!(texts, vec!["hello".to_string(), "world".to_string()]);
    }

    #[cfg(unix)]
    #[test]
    fn created_session_files_are_private() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let sessions = dir.path().join("sessions");
        let manager = SessionManager::create(&sessions, Some("/work".into())).unwrap();
        let file_mode = fs::metadata(manager.get_session_file().unwrap())
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        let dir_mode = fs::metadata(&sessions).unwrap().permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o600);
        assert_eq!(dir_mode, 0o700);
    }

    #[test]
    fn list_uses_latest_message_timestamp_as_modified() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.jsonl");
        let mut manager = SessionManager::open(&path).unwrap();

        let mut first = assistant_msg("hi");
        if let Message::Assistant(a) = &mut first {
            a.timestamp = 1_700_000_000_000;
        }
        manager.append_message(first).unwrap();

        let msg_time = 1_700_000_111_000;
        let mut second = assistant_msg("later");
        if let Message::Assistant(a) = &mut second {
            a.timestamp = msg_time;
        }
        manager.append_message(second).unwrap();

        let sessions = SessionManager::list(dir.path());
        let info = sessions.iter().find(|s| s.path == path).unwrap();
        assert_eq!(info.modified.timestamp_millis(), msg_time);
        assert_eq!(info.message_count, 2);
    }

    #[test]
    fn session_name_tracks_latest_session_info() {
        let mut session = SessionManager::in_memory();
        session.append_message(Message::user("x")).unwrap();
        session.set_name(Some("exploration")).unwrap();
        assert_eq!(session.get_name(), Some("exploration"));
        session.set_name(None).unwrap();
        assert!(session.get_name().is_none());
    }

    #[test]
    fn custom_entries_in_path_but_not_in_context() {
        let mut session = SessionManager::in_memory();
        let msg_id = session.append_message(Message::user("hello")).unwrap();
        let custom_id =
            session.append_custom_entry("my_data", serde_json::json!({"foo": "bar"})).unwrap();
        let msg2_id = session.append_message(assistant_msg("hi")).unwrap();

        let branch = session.get_branch(None);
        let path: Vec<&str> = branch.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(path, vec![msg_id.as_str(), custom_id.as_str(), msg2_id.as_str()]);

        let context = session.build_session_context();
        assert_eq!(context.messages.len(), 2);
    }
}
