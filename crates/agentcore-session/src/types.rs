// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use agentcore_model::{AgentMessage, ReasoningLevel};

/// Cumulative file-touch bookkeeping carried by a `branch_summary` entry so
/// file tracking survives across summarization (§4.9 second bullet).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BranchDetails {
    #[serde(rename = "readFiles", default)]
    pub read_files: Vec<String>,
    #[serde(rename = "modifiedFiles", default)]
    pub modified_files: Vec<String>,
}

/// One line of a session's JSONL file (§4.8, §6). The first line of a
/// session file is always a `Session` header; every later line carries an
/// `id`/`parentId` pair placing it in the session's entry tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEntry {
    Session {
        id: String,
        cwd: String,
        #[serde(rename = "createdAt")]
        created_at: DateTime<Utc>,
    },
    Message {
        id: String,
        #[serde(rename = "parentId")]
        parent_id: Option<String>,
        timestamp: DateTime<Utc>,
        message: AgentMessage,
    },
    BranchSummary {
        id: String,
        #[serde(rename = "parentId")]
        parent_id: Option<String>,
        summary: String,
        #[serde(rename = "fromId")]
        from_id: String,
        details: BranchDetails,
        timestamp: DateTime<Utc>,
    },
    Compaction {
        id: String,
        #[serde(rename = "parentId")]
        parent_id: Option<String>,
        summary: String,
        #[serde(rename = "tokensBefore")]
        tokens_before: usize,
        timestamp: DateTime<Utc>,
    },
    /// Marks a fork point (§4.8 `forkFrom`) or any other annotation a caller
    /// wants attached to the tree at a point in time. Not part of the wire
    /// examples in §6, which lists the common cases with "etc.".
    Label {
        id: String,
        #[serde(rename = "parentId")]
        parent_id: Option<String>,
        text: String,
        timestamp: DateTime<Utc>,
    },
    /// Records a change to the active reasoning level (§3) so replay can
    /// reconstruct what level was in effect at any point in the branch.
    ThinkingLevelChange {
        id: String,
        #[serde(rename = "parentId")]
        parent_id: Option<String>,
        level: ReasoningLevel,
        timestamp: DateTime<Utc>,
    },
    /// Records a change to the active model (§3).
    ModelChange {
        id: String,
        #[serde(rename = "parentId")]
        parent_id: Option<String>,
        provider: String,
        model: String,
        timestamp: DateTime<Utc>,
    },
    /// Extension-owned entry (§3 `custom`), opaque to this store beyond its
    /// place in the tree; the caller's `convertToLlm`-equivalent interprets it.
    CustomMessage {
        id: String,
        #[serde(rename = "parentId")]
        parent_id: Option<String>,
        payload: serde_json::Value,
        timestamp: DateTime<Utc>,
    },
}

impl SessionEntry {
    /// `None` for the session header, which sits outside the entry tree.
    pub fn entry_id(&self) -> Option<&str> {
        match self {
            SessionEntry::Session { .. } => None,
            SessionEntry::Message { id, .. }
            | SessionEntry::BranchSummary { id, .. }
            | SessionEntry::Compaction { id, .. }
            | SessionEntry::Label { id, .. }
            | SessionEntry::ThinkingLevelChange { id, .. }
            | SessionEntry::ModelChange { id, .. }
            | SessionEntry::CustomMessage { id, .. } => Some(id),
        }
    }

    pub fn parent_id(&self) -> Option<&str> {
        match self {
            SessionEntry::Session { .. } => None,
            SessionEntry::Message { parent_id, .. }
            | SessionEntry::BranchSummary { parent_id, .. }
            | SessionEntry::Compaction { parent_id, .. }
            | SessionEntry::Label { parent_id, .. }
            | SessionEntry::ThinkingLevelChange { parent_id, .. }
            | SessionEntry::ModelChange { parent_id, .. }
            | SessionEntry::CustomMessage { parent_id, .. } => parent_id.as_deref(),
        }
    }

    fn set_parent_id(&mut self, value: Option<String>) {
        match self {
            SessionEntry::Session { .. } => {}
            SessionEntry::Message { parent_id, .. }
            | SessionEntry::BranchSummary { parent_id, .. }
            | SessionEntry::Compaction { parent_id, .. }
            | SessionEntry::Label { parent_id, .. }
            | SessionEntry::ThinkingLevelChange { parent_id, .. }
            | SessionEntry::ModelChange { parent_id, .. }
            | SessionEntry::CustomMessage { parent_id, .. } => *parent_id = value,
        }
    }

    pub(crate) fn default_parent_to(&mut self, leaf: &Option<String>) {
        if self.parent_id().is_none() {
            self.set_parent_id(leaf.clone());
        }
    }
}
