//! Conversation normalizers.
//!
//! Three variants, one contract: a raw record goes in, a
//! [`NormalizedConversation`] holding exactly one linear message sequence comes
//! out. Normalization is pure; nothing touches the filesystem or network.

use std::collections::{BTreeMap, HashMap};

use thiserror::Error;

use crate::importer::{ClaudeMemory, ClaudeProject};
use crate::model::{AssetRef, AssetSource, AssetState, ContentBlock, Role, placeholder_for};
use crate::model::{NormalizedConversation, Provider};
use crate::source::{RawExport, RawRecord};

pub mod flat;
pub mod markup;
pub mod tree;

/// Corruption that makes a record impossible to linearize.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StructuralError {
    #[error("cycle in conversation tree at node {node}")]
    Cycle { node: String },
    #[error("malformed record: {0}")]
    Malformed(String),
    #[error("{record} record handed to the {normalizer} normalizer")]
    WrongRecord {
        record: &'static str,
        normalizer: &'static str,
    },
}

impl From<serde_json::Error> for StructuralError {
    fn from(err: serde_json::Error) -> Self {
        StructuralError::Malformed(err.to_string())
    }
}

/// Map a source role name onto the closed role set. The flag is set when the
/// name was not recognised and the role is a best guess.
pub fn map_role(raw: &str) -> (Role, bool) {
    let lower = raw.trim().to_ascii_lowercase();
    let known = match lower.as_str() {
        "user" | "human" => Some(Role::User),
        "assistant" | "model" => Some(Role::Assistant),
        "system" => Some(Role::System),
        "tool" | "tool_result" => Some(Role::ToolResult),
        "tool_use" => Some(Role::ToolUse),
        "thinking" => Some(Role::Thinking),
        _ => None,
    };
    if let Some(role) = known {
        return (role, false);
    }

    let guess = if lower.contains("tool") || lower.contains("function") {
        Role::ToolResult
    } else if lower.contains("think") || lower.contains("reason") {
        Role::Thinking
    } else if lower.contains("system") || lower.contains("developer") {
        Role::System
    } else if lower.contains("user") || lower.contains("human") {
        Role::User
    } else {
        Role::Assistant
    };
    (guess, true)
}

/// Hands out placeholders for asset references in first-seen order, one per
/// distinct source.
#[derive(Debug, Default)]
pub struct AssetCollector {
    by_identity: HashMap<String, usize>,
}

impl AssetCollector {
    pub fn block(&mut self, source: AssetSource, alt: Option<String>) -> ContentBlock {
        let next = self.by_identity.len() + 1;
        let ordinal = *self
            .by_identity
            .entry(source.identity().to_string())
            .or_insert(next);
        ContentBlock::Asset(AssetRef {
            placeholder: placeholder_for(ordinal),
            ordinal,
            source,
            alt: alt.filter(|a| !a.trim().is_empty()),
            state: AssetState::Pending,
        })
    }
}

/// Unit-wide lookups the flat normalizer needs for memories and projects.
#[derive(Debug, Clone, Default)]
pub struct FlatContext {
    /// Project uuid → display name.
    pub project_names: BTreeMap<String, String>,
    /// Project uuid → memory text.
    pub project_memories: BTreeMap<String, String>,
}

impl FlatContext {
    pub fn from_export(raw: &RawExport) -> Self {
        let mut ctx = FlatContext::default();
        let items = |name: &str| -> Vec<serde_json::Value> {
            match raw.json.get(name) {
                Some(serde_json::Value::Array(items)) => items.clone(),
                Some(other) if other.is_object() => vec![other.clone()],
                _ => Vec::new(),
            }
        };

        for value in items("projects.json") {
            if let Ok(project) = serde_json::from_value::<ClaudeProject>(value)
                && let (Some(uuid), Some(name)) = (project.uuid, project.name)
            {
                ctx.project_names.insert(uuid, name);
            }
        }
        for value in items("memories.json") {
            if let Ok(memory) = serde_json::from_value::<ClaudeMemory>(value) {
                ctx.project_memories.extend(memory.project_memories);
            }
        }
        ctx
    }

    /// Display name for a project, falling back to a shortened uuid.
    pub fn project_name(&self, uuid: &str) -> String {
        match (self.project_names.get(uuid), uuid.get(..12)) {
            (Some(name), _) => name.clone(),
            (None, Some(short)) if uuid.len() > 12 => format!("{short}..."),
            (None, _) => uuid.to_string(),
        }
    }
}

/// The closed set of normalizers, one per export shape.
#[derive(Debug, Clone)]
pub enum Normalizer {
    /// Branching message tree (ChatGPT).
    Tree,
    /// Flat message arrays plus memories and projects (Claude).
    Flat(FlatContext),
    /// Saved chat pages (Gemini).
    Markup,
}

impl Normalizer {
    pub fn for_export(provider: Provider, raw: &RawExport) -> Self {
        match provider {
            Provider::ChatGpt => Normalizer::Tree,
            Provider::Claude => Normalizer::Flat(FlatContext::from_export(raw)),
            Provider::Gemini => Normalizer::Markup,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Normalizer::Tree => "tree",
            Normalizer::Flat(_) => "flat",
            Normalizer::Markup => "markup",
        }
    }

    pub fn normalize(&self, record: RawRecord) -> Result<NormalizedConversation, StructuralError> {
        match (self, record) {
            (Normalizer::Tree, RawRecord::ChatGpt(value)) => tree::normalize(value),
            (Normalizer::Flat(_), RawRecord::ClaudeConversation(value)) => {
                flat::conversation(value)
            }
            (Normalizer::Flat(ctx), RawRecord::ClaudeMemory(value)) => flat::memory(value, ctx),
            (Normalizer::Flat(ctx), RawRecord::ClaudeProject(value)) => flat::project(value, ctx),
            (Normalizer::Markup, RawRecord::Gemini(doc)) => Ok(markup::normalize(&doc)),
            (normalizer, record) => Err(StructuralError::WrongRecord {
                record: record_kind(&record),
                normalizer: normalizer.name(),
            }),
        }
    }
}

fn record_kind(record: &RawRecord) -> &'static str {
    match record {
        RawRecord::ChatGpt(_) => "chatgpt",
        RawRecord::ClaudeConversation(_) => "claude conversation",
        RawRecord::ClaudeMemory(_) => "claude memory",
        RawRecord::ClaudeProject(_) => "claude project",
        RawRecord::Gemini(_) => "gemini",
    }
}

/// Append `text` to the last block when it is text, otherwise push a new block.
pub(crate) fn push_text(blocks: &mut Vec<ContentBlock>, text: &str) {
    if text.trim().is_empty() {
        return;
    }
    if let Some(ContentBlock::Text(last)) = blocks.last_mut() {
        last.push_str("\n\n");
        last.push_str(text.trim_end());
    } else {
        blocks.push(ContentBlock::text(text.trim_end()));
    }
}
