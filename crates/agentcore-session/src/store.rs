// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The session store (C8, §4.8): an append-only JSONL file per session,
//! tree-structured via `id`/`parentId` so a session can fork.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use fs4::FileExt;
use uuid::Uuid;

use crate::types::SessionEntry;

/// Escape path separators so a cwd can live as a single directory-name
/// component under `sessions/`.
pub fn encode_cwd(cwd: &str) -> String {
    cwd.replace('%', "%25").replace('\\', "%5C").replace('/', "%2F")
}

struct Replayed {
    id: String,
    cwd: String,
    /// Raw, still-serialized entry lines (header excluded), with any
    /// trailing partially-written line discarded.
    raw_lines: Vec<String>,
    parent_index: HashMap<String, Option<String>>,
    leaf: Option<String>,
}

fn replay(path: &Path) -> anyhow::Result<Replayed> {
    let file = File::open(path)?;
    let lines: Vec<String> = BufReader::new(file).lines().collect::<std::io::Result<_>>()?;
    if lines.is_empty() {
        anyhow::bail!("session file {} has no header line", path.display());
    }

    let header: SessionEntry = serde_json::from_str(&lines[0])?;
    let (id, cwd) = match header {
        SessionEntry::Session { id, cwd, .. } => (id, cwd),
        _ => anyhow::bail!("first line of {} is not a session header", path.display()),
    };

    let mut parent_index = HashMap::new();
    let mut leaf = None;
    let mut raw_lines = Vec::new();
    let body = &lines[1..];
    for (i, line) in body.iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<SessionEntry>(line) {
            Ok(entry) => {
                if let Some(eid) = entry.entry_id() {
                    parent_index.insert(eid.to_string(), entry.parent_id().map(str::to_string));
                    leaf = Some(eid.to_string());
                }
                raw_lines.push(line.clone());
            }
            Err(e) => {
                if i == body.len() - 1 {
                    tracing::warn!(path = %path.display(), error = %e, "discarding partially written last line");
                } else {
                    return Err(e).map_err(|e| anyhow::anyhow!("corrupt session entry at line {}: {e}", i + 2));
                }
            }
        }
    }

    Ok(Replayed { id, cwd, raw_lines, parent_index, leaf })
}

fn writeln_entry(file: &mut File, entry: &SessionEntry) -> anyhow::Result<()> {
    let line = serde_json::to_string(entry)?;
    writeln!(file, "{line}")?;
    file.flush()?;
    Ok(())
}

/// A session file opened for writing, with its parent/child tree loaded in
/// memory. Dropping the store releases the exclusive file lock.
pub struct SessionStore {
    path: PathBuf,
    file: File,
    parent_index: HashMap<String, Option<String>>,
    leaf: Option<String>,
    cwd: String,
    id: String,
}

impl Drop for SessionStore {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

impl SessionStore {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn cwd(&self) -> &str {
        &self.cwd
    }

    pub fn leaf(&self) -> Option<&str> {
        self.leaf.as_deref()
    }

    /// Create a new session file at `sessions/<encoded-cwd>/<uuid>.jsonl`
    /// under `base_dir`.
    pub fn create(cwd: impl Into<String>, base_dir: &Path) -> anyhow::Result<Self> {
        let cwd = cwd.into();
        let id = Uuid::new_v4().to_string();
        let dir = base_dir.join("sessions").join(encode_cwd(&cwd));
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{id}.jsonl"));

        let mut file = OpenOptions::new().create_new(true).append(true).read(true).open(&path)?;
        file.try_lock_exclusive().map_err(|e| anyhow::anyhow!("session file {} is already locked: {e}", path.display()))?;

        writeln_entry(&mut file, &SessionEntry::Session { id: id.clone(), cwd: cwd.clone(), created_at: Utc::now() })?;

        Ok(Self { path, file, parent_index: HashMap::new(), leaf: None, cwd, id })
    }

    /// Replay `path`, rebuild the parent/child index, and open it for
    /// further appends.
    pub fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let replayed = replay(&path)?;

        let file = OpenOptions::new().append(true).read(true).open(&path)?;
        file.try_lock_exclusive().map_err(|e| anyhow::anyhow!("session file {} is already locked: {e}", path.display()))?;

        Ok(Self { path, file, parent_index: replayed.parent_index, leaf: replayed.leaf, cwd: replayed.cwd, id: replayed.id })
    }

    /// Open the lexicographically most-recent session file for `cwd`.
    pub fn continue_recent(cwd: &str, base_dir: &Path) -> anyhow::Result<Self> {
        let dir = base_dir.join("sessions").join(encode_cwd(cwd));
        let mut files: Vec<PathBuf> = std::fs::read_dir(&dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().map(|ext| ext == "jsonl").unwrap_or(false))
            .collect();
        files.sort();
        let path = files.pop().ok_or_else(|| anyhow::anyhow!("no sessions found for cwd {cwd} under {}", dir.display()))?;
        Self::open(path)
    }

    /// Create a new session whose root copies `other_path`'s entries up to
    /// its leaf, followed by a `label` entry marking the fork point.
    pub fn fork_from(other_path: impl AsRef<Path>, cwd: impl Into<String>, base_dir: &Path) -> anyhow::Result<Self> {
        let cwd = cwd.into();
        let source = replay(other_path.as_ref())?;

        let id = Uuid::new_v4().to_string();
        let dir = base_dir.join("sessions").join(encode_cwd(&cwd));
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{id}.jsonl"));

        let mut file = OpenOptions::new().create_new(true).append(true).read(true).open(&path)?;
        file.try_lock_exclusive().map_err(|e| anyhow::anyhow!("session file {} is already locked: {e}", path.display()))?;

        writeln_entry(&mut file, &SessionEntry::Session { id: id.clone(), cwd: cwd.clone(), created_at: Utc::now() })?;
        for line in &source.raw_lines {
            writeln!(file, "{line}")?;
        }
        file.flush()?;

        let mut store = Self { path, file, parent_index: source.parent_index, leaf: source.leaf, cwd, id };
        store.append(SessionEntry::Label {
            id: Uuid::new_v4().to_string(),
            parent_id: None,
            text: format!("forked from {}", other_path.as_ref().display()),
            timestamp: Utc::now(),
        })?;
        Ok(store)
    }

    /// Write one entry. `parentId` defaults to the current leaf when the
    /// caller left it unset.
    pub fn append(&mut self, mut entry: SessionEntry) -> anyhow::Result<String> {
        if matches!(entry, SessionEntry::Session { .. }) {
            anyhow::bail!("cannot append a second session header");
        }
        entry.default_parent_to(&self.leaf);

        writeln_entry(&mut self.file, &entry)?;

        let id = entry.entry_id().expect("non-header entries always carry an id").to_string();
        self.parent_index.insert(id.clone(), entry.parent_id().map(str::to_string));
        self.leaf = Some(id.clone());
        Ok(id)
    }

    /// Walk parent links from the root down to `leaf_id`, inclusive.
    pub fn get_branch(&self, leaf_id: &str) -> Vec<String> {
        let mut chain = vec![leaf_id.to_string()];
        let mut current = leaf_id.to_string();
        while let Some(parent) = self.parent_index.get(&current).cloned().flatten() {
            chain.push(parent.clone());
            current = parent;
        }
        chain.reverse();
        chain
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use agentcore_model::AgentMessage;

    use super::*;
    use crate::types::BranchDetails;

    fn message_entry(text: &str) -> SessionEntry {
        SessionEntry::Message { id: Uuid::new_v4().to_string(), parent_id: None, timestamp: Utc::now(), message: AgentMessage::user(text) }
    }

    #[test]
    fn create_writes_a_session_header_as_the_first_line() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::create("/home/user/project", dir.path()).unwrap();
        let text = std::fs::read_to_string(store.path()).unwrap();
        let first_line: SessionEntry = serde_json::from_str(text.lines().next().unwrap()).unwrap();
        assert!(matches!(first_line, SessionEntry::Session { .. }));
    }

    #[test]
    fn append_defaults_parent_to_the_current_leaf() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = SessionStore::create("/proj", dir.path()).unwrap();
        let first = store.append(message_entry("hello")).unwrap();
        let second = store.append(message_entry("world")).unwrap();

        assert_eq!(store.get_branch(&second), vec![first, second]);
    }

    #[test]
    fn open_rebuilds_the_leaf_and_tree_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = {
            let mut store = SessionStore::create("/proj", dir.path()).unwrap();
            store.append(message_entry("one")).unwrap();
            store.append(message_entry("two")).unwrap();
            store.path().to_path_buf()
        };

        let reopened = SessionStore::open(&path).unwrap();
        assert!(reopened.leaf().is_some());
        assert_eq!(reopened.get_branch(reopened.leaf().unwrap()).len(), 2);
    }

    #[test]
    fn open_discards_a_trailing_partial_line() {
        let dir = tempfile::tempdir().unwrap();
        let (path, expected_leaf) = {
            let mut store = SessionStore::create("/proj", dir.path()).unwrap();
            let leaf = store.append(message_entry("one")).unwrap();
            (store.path().to_path_buf(), leaf)
        };
        // append a partially written line directly, bypassing the store
        let mut raw = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        write!(raw, "{{\"type\":\"message\",\"id\":\"broken").unwrap();
        drop(raw);

        let reopened = SessionStore::open(&path).unwrap();
        assert_eq!(reopened.leaf(), Some(expected_leaf.as_str()));
    }

    #[test]
    fn continue_recent_opens_the_lexicographically_last_file() {
        let dir = tempfile::tempdir().unwrap();
        let session_dir = dir.path().join("sessions").join(encode_cwd("/proj"));
        std::fs::create_dir_all(&session_dir).unwrap();

        // Bypass SessionStore::create so the filenames (and thus the
        // lexicographic order under test) are controlled directly, rather
        // than depending on UUID randomness.
        for name in ["aaaa0000.jsonl", "zzzz9999.jsonl", "mmmm5555.jsonl"] {
            let path = session_dir.join(name);
            let mut f = std::fs::File::create(&path).unwrap();
            writeln!(f, "{{\"type\":\"session\",\"id\":\"{name}\",\"cwd\":\"/proj\",\"createdAt\":\"2026-01-01T00:00:00Z\"}}").unwrap();
        }

        let recent = SessionStore::continue_recent("/proj", dir.path()).unwrap();
        assert_eq!(recent.id(), "zzzz9999.jsonl");
    }

    #[test]
    fn fork_from_copies_entries_and_adds_a_label() {
        let dir = tempfile::tempdir().unwrap();
        let (source_path, source_leaf) = {
            let mut store = SessionStore::create("/proj", dir.path()).unwrap();
            store.append(message_entry("one")).unwrap();
            let leaf = store.append(message_entry("two")).unwrap();
            (store.path().to_path_buf(), leaf)
        };

        let forked = SessionStore::fork_from(&source_path, "/proj", dir.path()).unwrap();
        assert_ne!(forked.id(), source_leaf);
        // root copies source's two messages, then the label entry makes three.
        assert_eq!(forked.get_branch(forked.leaf().unwrap()).len(), 3);
    }

    #[test]
    fn encode_cwd_escapes_path_separators() {
        assert_eq!(encode_cwd("/home/user/proj"), "%2Fhome%2Fuser%2Fproj");
    }

    #[test]
    fn branch_details_round_trips_camel_case_fields() {
        let details = BranchDetails { read_files: vec!["a.rs".into()], modified_files: vec!["b.rs".into()] };
        let json = serde_json::to_value(&details).unwrap();
        assert_eq!(json["readFiles"][0], "a.rs");
        assert_eq!(json["modifiedFiles"][0], "b.rs");
    }

    #[test]
    fn thinking_level_change_round_trips_and_joins_the_tree() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = SessionStore::create("/proj", dir.path()).unwrap();
        let first = store.append(message_entry("hello")).unwrap();
        let second = store
            .append(SessionEntry::ThinkingLevelChange {
                id: Uuid::new_v4().to_string(),
                parent_id: None,
                level: agentcore_model::ReasoningLevel::High,
                timestamp: Utc::now(),
            })
            .unwrap();

        assert_eq!(store.get_branch(&second), vec![first, second.clone()]);

        let reopened = SessionStore::open(store.path()).unwrap();
        assert_eq!(reopened.leaf(), Some(second.as_str()));
    }

    #[test]
    fn model_change_serializes_with_tagged_type() {
        let entry = SessionEntry::ModelChange {
            id: Uuid::new_v4().to_string(),
            parent_id: None,
            provider: "anthropic".into(),
            model: "claude".into(),
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["type"], "model_change");
        assert_eq!(json["provider"], "anthropic");
    }

    #[test]
    fn custom_message_round_trips_an_opaque_payload() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = SessionStore::create("/proj", dir.path()).unwrap();
        let id = store
            .append(SessionEntry::CustomMessage {
                id: Uuid::new_v4().to_string(),
                parent_id: None,
                payload: serde_json::json!({"kind": "note", "text": "hi"}),
                timestamp: Utc::now(),
            })
            .unwrap();

        let reopened = SessionStore::open(store.path()).unwrap();
        assert_eq!(reopened.leaf(), Some(id.as_str()));
    }
}
