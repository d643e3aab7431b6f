// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! On-disk session records.
//!
//! A session file is JSONL: the first line is the [`SessionHeader`], every
//! further line a [`SessionEntry`]. Entries share `{id, parentId, timestamp}`
//! and form a parent-linked tree; field names on the wire are camelCase and
//! round-trip byte-stable through serde.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use tern_model::Message;

/// Current file format version. See `migrate` for the history.
pub const SESSION_VERSION: u32 = 3;

fn session_type() -> String {
    "session".to_string()
}

/// First line of every session file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionHeader {
    #[serde(rename = "type", default = "session_type")]
    pub record_type: String,
    pub id: String,
    #[serde(default)]
    pub version: Option<u32>,
    pub timestamp: String,
    pub cwd: String,
    /// Path of the session this one was branched off, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_session: Option<String>,
}

/// A message as stored in the log: either a real conversation message or a
/// display-only record with a role the LLM never sees (`custom`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum StoredMessage {
    Llm(Message),
    Display(DisplayMessage),
}

/// Display-only message (role `custom` since v3; `hookMessage` before).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DisplayMessage {
    pub role: String,
    #[serde(default)]
    pub content: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionEntry {
    pub id: String,
    pub parent_id: Option<String>,
    pub timestamp: String,
    #[serde(flatten)]
    pub kind: EntryKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum EntryKind {
    Message {
        message: StoredMessage,
    },
    ThinkingLevelChange {
        thinking_level: String,
    },
    ModelChange {
        provider: String,
        model_id: String,
    },
    /// Summarizes everything before `first_kept_entry_id`; context
    /// reconstruction substitutes the summary for that prefix.
    Compaction {
        summary: String,
        first_kept_entry_id: String,
        tokens_before: u64,
    },
    /// Records the intent of an abandoned subtree when the leaf moves back.
    BranchSummary {
        from_id: Option<String>,
        summary: String,
    },
    Custom {
        custom_type: String,
        data: Value,
    },
    CustomMessage {
        content: Value,
    },
    /// Later label entries override earlier ones; `label: null` clears.
    Label {
        target_id: String,
        #[serde(default)]
        label: Option<String>,
    },
    SessionInfo {
        #[serde(default)]
        name: Option<String>,
    },
}

impl SessionEntry {
    pub fn kind_name(&self) -> &'static str {
        match &self.kind {
            EntryKind::Message { .. } => "message",
            EntryKind::ThinkingLevelChange { .. } => "thinking_level_change",
            EntryKind::ModelChange { .. } => "model_change",
            EntryKind::Compaction { .. } => "compaction",
            EntryKind::BranchSummary { .. } => "branch_summary",
            EntryKind::Custom { .. } => "custom",
            EntryKind::CustomMessage { .. } => "custom_message",
            EntryKind::Label { .. } => "label",
            EntryKind::SessionInfo { .. } => "session_info",
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
