// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Context reconstruction: a leaf's root-to-leaf path replayed into the
//! message list, thinking level, and model the conversation had at that
//! point. A compaction entry on the path substitutes its summary for the
//! prefix before `first_kept_entry_id`; multiple compactions collapse to the
//! latest one.

use std::collections::{HashMap, HashSet};

use serde_json::Value;

use tern_model::Message;

use crate::entries::{EntryKind, SessionEntry, StoredMessage};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelRef {
    pub provider: String,
    pub model_id: String,
}

/// One reconstructed conversation item. Only [`ContextMessage::Llm`] is ever
/// handed to a provider; the rest are display-only.
#[derive(Debug, Clone, PartialEq)]
pub enum ContextMessage {
    Llm(Message),
    CompactionSummary { summary: String },
    BranchSummary { summary: String },
    Custom { content: Value },
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionContext {
    pub messages: Vec<ContextMessage>,
    /// `"off"` unless a thinking-level change is on the path.
    pub thinking_level: String,
    pub model: Option<ModelRef>,
}

impl Default for SessionContext {
    fn default() -> Self {
        Self { messages: Vec::new(), thinking_level: "off".into(), model: None }
    }
}

impl SessionContext {
    /// The messages safe to send to an LLM, display-only items filtered out.
    pub fn llm_messages(&self) -> Vec<Message> {
        self.messages
            .iter()
            .filter_map(|m| match m {
                ContextMessage::Llm(message) => Some(message.clone()),
                _ => None,
            })
            .collect()
    }
}

/// Root-to-leaf path for `leaf` (default: the last entry). Unknown ids and
/// cycles produce the longest valid prefix rather than an error.
pub fn path_to(entries: &[SessionEntry], leaf: Option<&str>) -> Vec<SessionEntry> {
    let index: HashMap<&str, &SessionEntry> =
        entries.iter().map(|e| (e.id.as_str(), e)).collect();
    let leaf_id = match leaf.or_else(|| entries.last().map(|e| e.id.as_str())) {
        Some(id) => id,
        None => return Vec::new(),
    };

    let mut path: Vec<SessionEntry> = Vec::new();
    let mut seen: HashSet<&str> = HashSet::new();
    let mut cursor = Some(leaf_id);
    while let Some(id) = cursor {
        if !seen.insert(id) {
            break;
        }
        let Some(entry) = index.get(id) else { break };
        path.push((*entry).clone());
        cursor = entry.parent_id.as_deref();
    }
    path.reverse();
    path
}

pub fn build_session_context(entries: &[SessionEntry], leaf: Option<&str>) -> SessionContext {
    let path = path_to(entries, leaf);
    let mut ctx = SessionContext::default();
    if path.is_empty() {
        return ctx;
    }

    // Latest compaction on the path decides which prefix is summarized.
    let compaction = path
        .iter()
        .enumerate()
        .rev()
        .find_map(|(i, e)| match &e.kind {
            EntryKind::Compaction { summary, first_kept_entry_id, .. } => {
                Some((i, summary.clone(), first_kept_entry_id.clone()))
            }
            _ => None,
        });

    let collect_from = match &compaction {
        Some((ci, summary, first_kept)) => {
            ctx.messages.push(ContextMessage::CompactionSummary { summary: summary.clone() });
            path.iter().position(|e| &e.id == first_kept).unwrap_or(ci + 1)
        }
        None => 0,
    };
    let compaction_index = compaction.as_ref().map(|(i, _, _)| *i);

    for (i, entry) in path.iter().enumerate() {
        // State is tracked along the whole path, summarized prefix included.
        match &entry.kind {
            EntryKind::ThinkingLevelChange { thinking_level } => {
                ctx.thinking_level = thinking_level.clone();
            }
            EntryKind::ModelChange { provider, model_id } => {
                ctx.model = Some(ModelRef { provider: provider.clone(), model_id: model_id.clone() });
            }
            EntryKind::Message { message: StoredMessage::Llm(Message::Assistant(assistant)) } => {
                ctx.model = Some(ModelRef {
                    provider: assistant.provider.clone(),
                    model_id: assistant.model.clone(),
                });
            }
            _ => {}
        }

        let summarized = i < collect_from || Some(i) == compaction_index;
        if summarized {
            continue;
        }
        match &entry.kind {
            EntryKind::Message { message: StoredMessage::Llm(message) } => {
                ctx.messages.push(ContextMessage::Llm(message.clone()));
            }
            EntryKind::Message { message: StoredMessage::Display(display) } => {
                ctx.messages.push(ContextMessage::Custom { content: display.content.clone() });
            }
            EntryKind::CustomMessage { content } => {
                ctx.messages.push(ContextMessage::Custom { content: content.clone() });
            }
            EntryKind::BranchSummary { summary, .. } => {
                ctx.messages.push(ContextMessage::BranchSummary { summary: summary.clone() });
            }
            _ => {}
        }
    }

    ctx
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tern_model::{Api, AssistantContentBlock, AssistantMessage, StopReason, Usage};

    fn user_entry(id: &str, parent: Option<&str>, text: &str) -> SessionEntry {
        SessionEntry {
            id: id.into(),
            parent_id: parent.map(Into::into),
            timestamp: "2025-01-01T00:00:00Z".into(),
            kind: EntryKind::Message { message: StoredMessage::Llm(Message::user(text)) },
        }
    }

    fn assistant_entry(id: &str, parent: Option<&str>, text: &str) -> SessionEntry {
        SessionEntry {
            id: id.into(),
            parent_id: parent.map(Into::into),
            timestamp: "2025-01-01T00:00:00Z".into(),
            kind: EntryKind::Message {
                message: StoredMessage::Llm(Message::Assistant(AssistantMessage {
                    content: vec![AssistantContentBlock::text(text)],
                    api: Api::AnthropicMessages,
                    provider: "anthropic".into(),
                    model: "claude-test".into(),
                    usage: Usage::default(),
                    stop_reason: StopReason::Stop,
                    error_message: None,
                    timestamp: 1,
                })),
            },
        }
    }

    fn compaction_entry(id: &str, parent: Option<&str>, summary: &str, first_kept: &str) -> SessionEntry {
        SessionEntry {
            id: id.into(),
            parent_id: parent.map(Into::into),
            timestamp: "2025-01-01T00:00:00Z".into(),
            kind: EntryKind::Compaction {
                summary: summary.into(),
                first_kept_entry_id: first_kept.into(),
                tokens_before: 1000,
            },
        }
    }

    fn llm_text(message: &ContextMessage) -> String {
        match message {
            ContextMessage::Llm(Message::User(u)) => u.content.as_text(),
            ContextMessage::Llm(Message::Assistant(a)) => a.text(),
            other => panic!("expected llm message, got {other:?}"),
        }
    }

    #[test]
    fn empty_entries_build_default_context() {
        let ctx = build_session_context(&[], None);
        assert!(ctx.messages.is_empty());
        assert_eq!(ctx.thinking_level, "off");
        assert!(ctx.model.is_none());
    }

    #[test]
    fn simple_conversation_replays_in_order() {
        let entries = vec![
            user_entry("1", None, "hello"),
            assistant_entry("2", Some("1"), "hi"),
            user_entry("3", Some("2"), "how"),
            assistant_entry("4", Some("3"), "great"),
        ];
        let ctx = build_session_context(&entries, None);
        let roles: Vec<&str> = ctx
            .messages
            .iter()
            .map(|m| match m {
                ContextMessage::Llm(message) => message.role(),
                _ => "other",
            })
            .collect();
        assert_eq!(roles, vec!["user", "assistant", "user", "assistant"]);
    }

    #[test]
    fn thinking_level_and_model_tracked_from_path() {
        let entries = vec![
            user_entry("1", None, "hello"),
            SessionEntry {
                id: "2".into(),
                parent_id: Some("1".into()),
                timestamp: "t".into(),
                kind: EntryKind::ThinkingLevelChange { thinking_level: "high".into() },
            },
            assistant_entry("3", Some("2"), "thinking"),
        ];
        let ctx = build_session_context(&entries, None);
        assert_eq!(ctx.thinking_level, "high");
        assert_eq!(
            ctx.model,
            Some(ModelRef { provider: "anthropic".into(), model_id: "claude-test".into() })
        );
    }

    #[test]
    fn later_assistant_message_overrides_model_change() {
        let entries = vec![
            user_entry("1", None, "hello"),
            SessionEntry {
                id: "2".into(),
                parent_id: Some("1".into()),
                timestamp: "t".into(),
                kind: EntryKind::ModelChange { provider: "openai".into(), model_id: "gpt-4".into() },
            },
            assistant_entry("3", Some("2"), "hi"),
        ];
        let ctx = build_session_context(&entries, None);
        assert_eq!(
            ctx.model,
            Some(ModelRef { provider: "anthropic".into(), model_id: "claude-test".into() })
        );
    }

    #[test]
    fn compaction_substitutes_summary_for_prefix() {
        let entries = vec![
            user_entry("1", None, "first"),
            assistant_entry("2", Some("1"), "response1"),
            user_entry("3", Some("2"), "second"),
            assistant_entry("4", Some("3"), "response2"),
            compaction_entry("5", Some("4"), "Summary of first two turns", "3"),
            user_entry("6", Some("5"), "third"),
            assistant_entry("7", Some("6"), "response3"),
        ];
        let ctx = build_session_context(&entries, None);
        assert!(matches!(
            &ctx.messages[0],
            ContextMessage::CompactionSummary { summary } if summary.contains("Summary")
        ));
        assert_eq!(llm_text(&ctx.messages[1]), "second");
        assert_eq!(llm_text(&ctx.messages[2]), "response2");
        assert_eq!(llm_text(&ctx.messages[3]), "third");
        assert_eq!(llm_text(&ctx.messages[4]), "response3");
    }

    #[test]
    fn multiple_compactions_collapse_to_latest() {
        let entries = vec![
            user_entry("1", None, "a"),
            assistant_entry("2", Some("1"), "b"),
            compaction_entry("3", Some("2"), "First summary", "1"),
            user_entry("4", Some("3"), "c"),
            assistant_entry("5", Some("4"), "d"),
            compaction_entry("6", Some("5"), "Second summary", "4"),
            user_entry("7", Some("6"), "e"),
        ];
        let ctx = build_session_context(&entries, None);
        assert!(matches!(
            &ctx.messages[0],
            ContextMessage::CompactionSummary { summary } if summary == "Second summary"
        ));
        assert_eq!(llm_text(&ctx.messages[1]), "c");
        assert_eq!(llm_text(&ctx.messages[2]), "d");
        assert_eq!(llm_text(&ctx.messages[3]), "e");
    }

    #[test]
    fn branches_reconstruct_along_their_own_path() {
        let entries = vec![
            user_entry("1", None, "start"),
            assistant_entry("2", Some("1"), "response"),
            user_entry("3", Some("2"), "branch A"),
            user_entry("4", Some("2"), "branch B"),
        ];
        let ctx_a = build_session_context(&entries, Some("3"));
        assert_eq!(llm_text(ctx_a.messages.last().unwrap()), "branch A");
        let ctx_b = build_session_context(&entries, Some("4"));
        assert_eq!(llm_text(ctx_b.messages.last().unwrap()), "branch B");
    }

    #[test]
    fn branch_summary_emits_display_message() {
        let entries = vec![
            user_entry("1", None, "start"),
            assistant_entry("2", Some("1"), "response"),
            SessionEntry {
                id: "4".into(),
                parent_id: Some("2".into()),
                timestamp: "t".into(),
                kind: EntryKind::BranchSummary {
                    from_id: Some("3".into()),
                    summary: "Summary of abandoned work".into(),
                },
            },
            user_entry("5", Some("4"), "new path"),
        ];
        let ctx = build_session_context(&entries, None);
        assert!(matches!(
            &ctx.messages[2],
            ContextMessage::BranchSummary { summary } if summary.contains("Summary")
        ));
        // Display-only items never reach the LLM list.
        assert_eq!(ctx.llm_messages().len(), 3);
    }

    #[test]
    fn custom_entries_are_skipped_custom_messages_are_display_only() {
        let entries = vec![
            user_entry("1", None, "hello"),
            SessionEntry {
                id: "2".into(),
                parent_id: Some("1".into()),
                timestamp: "t".into(),
                kind: EntryKind::Custom {
                    custom_type: "my_data".into(),
                    data: serde_json::json!({"foo": "bar"}),
                },
            },
            SessionEntry {
                id: "3".into(),
                parent_id: Some("2".into()),
                timestamp: "t".into(),
                kind: EntryKind::CustomMessage { content: serde_json::json!("note to display") },
            },
            assistant_entry("4", Some("3"), "hi"),
        ];
        let ctx = build_session_context(&entries, None);
        assert_eq!(ctx.messages.len(), 3);
        assert!(matches!(&ctx.messages[1], ContextMessage::Custom { .. }));
        assert_eq!(ctx.llm_messages().len(), 2);
    }
}
