// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Session file loading and version migration.
//!
//! Migration operates on raw JSON records so files written by any prior
//! version can be upgraded before typed parsing:
//!
//! - v1 → v2: entries gain ids and a flat parent chain (each entry's parent
//!   is its predecessor); `compaction.firstKeptEntryIndex` becomes
//!   `firstKeptEntryId` resolved through the flat chain.
//! - v2 → v3: the display message role `hookMessage` becomes `custom`.
//!
//! After migration the whole file is rewritten atomically by the manager.

use std::path::{Path, PathBuf};

use serde_json::{json, Value};
use tracing::warn;

use crate::entries::SESSION_VERSION;

/// Read all records from a session file.
///
/// Returns an empty list when the file is missing, empty, or does not start
/// with a valid `session` header. Unparseable lines are skipped; valid lines
/// around them survive.
pub fn load_entries_from_file(path: impl AsRef<Path>) -> Vec<Value> {
    let path = path.as_ref();
    let Ok(raw) = std::fs::read_to_string(path) else {
        return Vec::new();
    };

    let mut records: Vec<Value> = Vec::new();
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(line) {
            Ok(value) => records.push(value),
            Err(err) => {
                warn!(path = %path.display(), %err, "skipping unparseable session line");
            }
        }
    }

    let has_header = records
        .first()
        .is_some_and(|r| r["type"] == "session" && r["id"].is_string());
    if !has_header {
        return Vec::new();
    }
    records
}

/// The most recently modified valid session file in `dir`, if any.
pub fn find_most_recent_session(dir: impl AsRef<Path>) -> Option<PathBuf> {
    let dir = dir.as_ref();
    let entries = std::fs::read_dir(dir).ok()?;

    let mut best: Option<(std::time::SystemTime, PathBuf)> = None;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
            continue;
        }
        if load_entries_from_file(&path).is_empty() {
            continue;
        }
        let Ok(modified) = entry.metadata().and_then(|m| m.modified()) else { continue };
        match &best {
            Some((ts, _)) if *ts >= modified => {}
            _ => best = Some((modified, path)),
        }
    }
    best.map(|(_, path)| path)
}

/// Upgrade raw records to the current version in place. Returns `true` when
/// anything changed (the caller then rewrites the file).
pub fn migrate_session_entries(records: &mut [Value]) -> bool {
    if records.is_empty() {
        return false;
    }
    let version = records[0]["version"].as_u64().unwrap_or(1) as u32;
    if version >= SESSION_VERSION {
        return false;
    }

    if version < 2 {
        migrate_v1_to_v2(records);
    }
    if version < 3 {
        migrate_v2_to_v3(records);
    }

    records[0]["version"] = json!(SESSION_VERSION);
    true
}

/// Assign ids and a flat parent chain; resolve compaction indices to ids.
fn migrate_v1_to_v2(records: &mut [Value]) {
    // First pass: ids + parent chain over the non-header entries.
    let mut chain_ids: Vec<String> = Vec::new();
    let mut previous: Option<String> = None;
    for record in records.iter_mut().skip(1) {
        let id = match record["id"].as_str() {
            Some(existing) if !existing.is_empty() => existing.to_string(),
            _ => {
                let id = crate::manager::generate_entry_id(|candidate| {
                    chain_ids.iter().any(|c| c == candidate)
                });
                record["id"] = json!(id);
                id
            }
        };
        record["parentId"] = match &previous {
            Some(parent) => json!(parent),
            None => Value::Null,
        };
        chain_ids.push(id.clone());
        previous = Some(id);
    }

    // Second pass: rewrite compaction index references through the chain.
    for record in records.iter_mut().skip(1) {
        if record["type"] != "compaction" {
            continue;
        }
        if let Some(index) = record["firstKeptEntryIndex"].as_u64() {
            if let Some(id) = chain_ids.get(index as usize) {
                record["firstKeptEntryId"] = json!(id);
            }
            if let Some(fields) = record.as_object_mut() {
                fields.remove("firstKeptEntryIndex");
            }
        }
    }
}

/// Rename the display role `hookMessage` to `custom`.
fn migrate_v2_to_v3(records: &mut [Value]) {
    for record in records.iter_mut().skip(1) {
        if record["type"] == "message" && record["message"]["role"] == "hookMessage" {
            record["message"]["role"] = json!("custom");
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn header(version: Option<u32>) -> Value {
        let mut h = json!({
            "type": "session",
            "id": "sess-1",
            "timestamp": "2025-01-01T00:00:00Z",
            "cwd": "/tmp",
        });
        if let Some(v) = version {
            h["version"] = json!(v);
        }
        h
    }

    #[test]
    fn v1_entries_gain_ids_and_flat_chain() {
        let mut records = vec![
            header(None),
            json!({"type": "message", "timestamp": "2025-01-01T00:00:01Z",
                "message": {"role": "user", "content": "hi", "timestamp": 1}}),
            json!({"type": "message", "timestamp": "2025-01-01T00:00:02Z",
                "message": {"role": "user", "content": "again", "timestamp": 2}}),
        ];
        assert!(migrate_session_entries(&mut records));
        assert_eq!(records[0]["version"], 3);
        let first_id = records[1]["id"].as_str().unwrap().to_string();
        assert_eq!(first_id.len(), 8);
        assert_eq!(records[1]["parentId"], Value::Null);
        assert_eq!(records[2]["parentId"].as_str().unwrap(), first_id);
    }

    #[test]
    fn v1_compaction_index_resolves_to_entry_id() {
        let mut records = vec![
            header(None),
            json!({"type": "message", "timestamp": "t",
                "message": {"role": "user", "content": "a", "timestamp": 1}}),
            json!({"type": "message", "timestamp": "t",
                "message": {"role": "user", "content": "b", "timestamp": 2}}),
            json!({"type": "compaction", "timestamp": "t",
                "summary": "s", "firstKeptEntryIndex": 1, "tokensBefore": 10}),
        ];
        migrate_session_entries(&mut records);
        let second_id = records[2]["id"].as_str().unwrap();
        assert_eq!(records[3]["firstKeptEntryId"].as_str().unwrap(), second_id);
        assert!(records[3].get("firstKeptEntryIndex").is_none());
    }

    #[test]
    fn migration_is_idempotent_on_v2_ids() {
        let mut records = vec![
            header(Some(2)),
            json!({"type": "message", "id": "abc12345", "parentId": null, "timestamp": "t",
                "message": {"role": "user", "content": "hi", "timestamp": 1}}),
            json!({"type": "message", "id": "def67890", "parentId": "abc12345", "timestamp": "t",
                "message": {"role": "custom", "content": "note"}}),
        ];
        assert!(migrate_session_entries(&mut records));
        assert_eq!(records[1]["id"], "abc12345");
        assert_eq!(records[2]["id"], "def67890");
        assert_eq!(records[2]["parentId"], "abc12345");
    }

    #[test]
    fn current_version_is_untouched() {
        let mut records = vec![header(Some(SESSION_VERSION))];
        assert!(!migrate_session_entries(&mut records));
    }

    #[test]
    fn hook_message_role_renamed_to_custom() {
        let mut records = vec![
            header(Some(2)),
            json!({"type": "message", "id": "aaaaaaaa", "parentId": null, "timestamp": "t",
                "message": {"role": "hookMessage", "content": "hook output"}}),
        ];
        migrate_session_entries(&mut records);
        assert_eq!(records[1]["message"]["role"], "custom");
    }

    // ── load_entries_from_file ────────────────────────────────────────────────

    #[test]
    fn missing_empty_and_headerless_files_load_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_entries_from_file(dir.path().join("missing.jsonl")).is_empty());

        let empty = dir.path().join("empty.jsonl");
        std::fs::write(&empty, "").unwrap();
        assert!(load_entries_from_file(&empty).is_empty());

        let no_header = dir.path().join("no-header.jsonl");
        std::fs::write(&no_header, "{\"type\":\"message\",\"id\":\"1\"}\n").unwrap();
        assert!(load_entries_from_file(&no_header).is_empty());

        let malformed = dir.path().join("malformed.jsonl");
        std::fs::write(&malformed, "not json\n").unwrap();
        assert!(load_entries_from_file(&malformed).is_empty());
    }

    #[test]
    fn valid_file_loads_header_and_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("valid.jsonl");
        std::fs::write(
            &path,
            concat!(
                "{\"type\":\"session\",\"id\":\"abc\",\"timestamp\":\"2025-01-01T00:00:00Z\",\"cwd\":\"/tmp\"}\n",
                "{\"type\":\"message\",\"id\":\"1\",\"parentId\":null,\"timestamp\":\"2025-01-01T00:00:01Z\",",
                "\"message\":{\"role\":\"user\",\"content\":\"hi\",\"timestamp\":1}}\n",
            ),
        )
        .unwrap();
        let records = load_entries_from_file(&path);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["type"], "session");
        assert_eq!(records[1]["type"], "message");
    }

    #[test]
    fn unreadable_lines_are_skipped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mixed.jsonl");
        std::fs::write(
            &path,
            concat!(
                "{\"type\":\"session\",\"id\":\"abc\",\"timestamp\":\"2025-01-01T00:00:00Z\",\"cwd\":\"/tmp\"}\n",
                "not valid json\n",
                "{\"type\":\"message\",\"id\":\"1\",\"parentId\":null,\"timestamp\":\"2025-01-01T00:00:01Z\",",
                "\"message\":{\"role\":\"user\",\"content\":\"hi\",\"timestamp\":1}}\n",
            ),
        )
        .unwrap();
        assert_eq!(load_entries_from_file(&path).len(), 2);
    }

    // ── find_most_recent_session ──────────────────────────────────────────────

    #[test]
    fn most_recent_valid_session_wins() {
        let dir = tempfile::tempdir().unwrap();
        assert!(find_most_recent_session(dir.path()).is_none());

        std::fs::write(dir.path().join("file.txt"), "hello").unwrap();
        std::fs::write(dir.path().join("invalid.jsonl"), "{\"type\":\"message\"}\n").unwrap();
        assert!(find_most_recent_session(dir.path()).is_none());

        let older = dir.path().join("older.jsonl");
        std::fs::write(
            &older,
            "{\"type\":\"session\",\"id\":\"old\",\"timestamp\":\"2025-01-01T00:00:00Z\",\"cwd\":\"/tmp\"}\n",
        )
        .unwrap();
        // Ensure distinct mtimes even on coarse filesystems.
        std::thread::sleep(std::time::Duration::from_millis(20));
        let newer = dir.path().join("newer.jsonl");
        std::fs::write(
            &newer,
            "{\"type\":\"session\",\"id\":\"new\",\"timestamp\":\"2025-01-01T00:00:00Z\",\"cwd\":\"/tmp\"}\n",
        )
        .unwrap();

        assert_eq!(find_most_recent_session(dir.path()).unwrap(), newer);
    }
}
