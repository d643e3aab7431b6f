// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Branchable JSONL session log.
//!
//! An append-only file of parent-linked entries forming a tree of the
//! conversation; [`SessionManager`] owns the file, the leaf cursor, labels,
//! and branching, and [`build_session_context`] replays any root-to-leaf
//! path into the message list, thinking level, and model a run needs.

mod context;
mod entries;
mod manager;
mod migrate;

pub use context::{build_session_context, path_to, ContextMessage, ModelRef, SessionContext};
pub use entries::{
    DisplayMessage, EntryKind, SessionEntry, SessionHeader, StoredMessage, SESSION_VERSION,
};
pub use manager::{SessionInfo, SessionManager, SessionNode};
pub use migrate::{find_most_recent_session, load_entries_from_file, migrate_session_entries};
