//! Typed shapes of the JSON export formats.
//!
//! Every field is optional or defaulted and scalars are read leniently:
//! exports drift between versions, and a missing or retyped field must
//! degrade to a fingerprint warning, not a parse failure.
//!
//! ChatGPT (`conversations.json`): array of conversations, each holding a
//! `mapping` of node id → node. Nodes form a tree through `parent` / `children`;
//! `current_node` names the leaf of the branch shown in the UI.
//!
//! Claude (`conversations.json`, `memories.json`, `projects.json`): flat
//! `chat_messages` arrays, a memory document, and projects with embedded docs.
use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::utils::parse_rfc3339;

// ---------------------------------------------------------------------------
// ChatGPT
// ---------------------------------------------------------------------------

/// One conversation in `conversations.json`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ChatGptConversation {
    #[serde(deserialize_with = "lenient_string")]
    pub id: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub conversation_id: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub title: Option<String>,
    /// Seconds since the Unix epoch, fractional.
    #[serde(deserialize_with = "lenient_seconds")]
    pub create_time: Option<f64>,
    #[serde(deserialize_with = "lenient_seconds")]
    pub update_time: Option<f64>,
    /// Leaf of the active branch.
    #[serde(deserialize_with = "lenient_string")]
    pub current_node: Option<String>,
    pub mapping: BTreeMap<String, ChatGptNode>,
}

impl ChatGptConversation {
    pub fn identity(&self) -> Option<&str> {
        self.conversation_id
            .as_deref()
            .or(self.id.as_deref())
            .filter(|s| !s.is_empty())
    }
}

/// A node of the conversation tree. Structural nodes (the root, mostly) carry
/// no message.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ChatGptNode {
    #[serde(deserialize_with = "lenient_string")]
    pub id: Option<String>,
    pub parent: Option<String>,
    pub children: Vec<String>,
    pub message: Option<ChatGptMessage>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ChatGptMessage {
    #[serde(deserialize_with = "lenient_string")]
    pub id: Option<String>,
    #[serde(deserialize_with = "lenient_struct")]
    pub author: ChatGptAuthor,
    #[serde(deserialize_with = "lenient_seconds")]
    pub create_time: Option<f64>,
    #[serde(deserialize_with = "lenient_struct")]
    pub content: ChatGptContent,
    /// `"all"` for normal turns; a tool name when the assistant calls a tool.
    #[serde(deserialize_with = "lenient_string")]
    pub recipient: Option<String>,
    pub metadata: Value,
}

impl ChatGptMessage {
    pub fn is_hidden(&self) -> bool {
        self.metadata
            .get("is_visually_hidden_from_conversation")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// A tool call is an assistant message addressed to someone other than the user.
    pub fn tool_recipient(&self) -> Option<&str> {
        self.recipient
            .as_deref()
            .filter(|r| !r.is_empty() && *r != "all")
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ChatGptAuthor {
    #[serde(deserialize_with = "lenient_text")]
    pub role: String,
    #[serde(deserialize_with = "lenient_string")]
    pub name: Option<String>,
}

/// Message body. `content_type` selects which of the remaining fields is set.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ChatGptContent {
    #[serde(deserialize_with = "lenient_text")]
    pub content_type: String,
    /// Strings or typed objects (`image_asset_pointer`, `audio_transcription`, …).
    #[serde(deserialize_with = "lenient_seq")]
    pub parts: Vec<Value>,
    #[serde(deserialize_with = "lenient_string")]
    pub text: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub language: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub result: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub summary: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub title: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub url: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub content: Option<String>,
    #[serde(deserialize_with = "lenient_seq")]
    pub thoughts: Vec<ChatGptThought>,
    #[serde(deserialize_with = "lenient_string")]
    pub user_profile: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub user_instructions: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ChatGptThought {
    #[serde(deserialize_with = "lenient_string")]
    pub summary: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub content: Option<String>,
}

// ---------------------------------------------------------------------------
// Lenient field readers
//
// Scalars change type between export versions. A value of the wrong type
// reads as absent; the fingerprint report is where the drift shows up.
// Only the fields the tree and flat walks depend on (`mapping`, `parent`,
// `children`, `chat_messages`) stay strict.
// ---------------------------------------------------------------------------

/// Keeps the value only when it is a string.
fn lenient_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => Some(s),
        _ => None,
    })
}

/// Like [`lenient_string`], with the empty string standing in for absence.
fn lenient_text<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(lenient_string(deserializer)?.unwrap_or_default())
}

/// Epoch seconds from a number, a numeric string or an RFC 3339 timestamp.
fn lenient_seconds<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<f64>, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().or_else(|| {
            parse_rfc3339(&s).map(|dt| dt.timestamp_millis() as f64 / 1000.0)
        }),
        _ => None,
    })
}

/// Byte counts from a non-negative number or a numeric string.
fn lenient_size<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u64>, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    })
}

fn lenient_flag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    Ok(matches!(Value::deserialize(deserializer)?, Value::Bool(true)))
}

/// A nested object; anything that does not parse reads as the default.
fn lenient_struct<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned + Default,
{
    Ok(serde_json::from_value(Value::deserialize(deserializer)?).unwrap_or_default())
}

/// An array whose unreadable items are dropped. A non-array reads as empty.
fn lenient_seq<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Array(items) => items
            .into_iter()
            .filter_map(|item| serde_json::from_value(item).ok())
            .collect(),
        _ => Vec::new(),
    })
}

/// String-valued entries of an object.
fn lenient_string_map<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<BTreeMap<String, String>, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::Object(map) => map
            .into_iter()
            .filter_map(|(k, v)| match v {
                Value::String(s) => Some((k, s)),
                _ => None,
            })
            .collect(),
        _ => BTreeMap::new(),
    })
}

// ---------------------------------------------------------------------------
// Claude
// ---------------------------------------------------------------------------

/// One conversation in Claude's `conversations.json`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ClaudeConversation {
    #[serde(deserialize_with = "lenient_string")]
    pub uuid: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub name: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub summary: Option<String>,
    /// RFC 3339.
    #[serde(deserialize_with = "lenient_string")]
    pub created_at: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub updated_at: Option<String>,
    pub chat_messages: Vec<ClaudeChatMessage>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ClaudeChatMessage {
    #[serde(deserialize_with = "lenient_string")]
    pub uuid: Option<String>,
    /// `"human"` or `"assistant"`.
    #[serde(deserialize_with = "lenient_text")]
    pub sender: String,
    /// Flattened text; older exports only carry this.
    #[serde(deserialize_with = "lenient_string")]
    pub text: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub created_at: Option<String>,
    #[serde(deserialize_with = "lenient_seq")]
    pub content: Vec<ClaudeContent>,
    #[serde(deserialize_with = "lenient_seq")]
    pub attachments: Vec<ClaudeAttachment>,
    #[serde(deserialize_with = "lenient_seq")]
    pub files: Vec<ClaudeFile>,
}

/// A typed content item in a Claude message.
///
/// Custom deserializer: unknown `type` values are preserved as [`ClaudeContent::Other`]
/// so a new content kind never fails the whole file.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaudeContent {
    Text {
        text: String,
    },
    Thinking {
        thinking: String,
    },
    ToolUse {
        name: String,
        input: Value,
    },
    ToolResult {
        name: Option<String>,
        content: String,
        is_error: bool,
    },
    /// Usage bookkeeping; carries nothing to render.
    TokenBudget,
    Other {
        kind: String,
        text: Option<String>,
    },
}

impl<'de> Deserialize<'de> for ClaudeContent {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        let str_field = |key: &str| value.get(key).and_then(Value::as_str).map(str::to_owned);

        let kind = str_field("type").unwrap_or_default();
        Ok(match kind.as_str() {
            "text" => ClaudeContent::Text {
                text: str_field("text").unwrap_or_default(),
            },
            "thinking" => ClaudeContent::Thinking {
                thinking: str_field("thinking").unwrap_or_default(),
            },
            "tool_use" => ClaudeContent::ToolUse {
                name: str_field("name").unwrap_or_default(),
                input: value.get("input").cloned().unwrap_or(Value::Null),
            },
            "tool_result" => ClaudeContent::ToolResult {
                name: str_field("name"),
                content: flatten_tool_result(value.get("content")),
                is_error: value
                    .get("is_error")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            },
            "token_budget" => ClaudeContent::TokenBudget,
            _ => ClaudeContent::Other {
                text: str_field("text"),
                kind,
            },
        })
    }
}

/// Tool results arrive as a plain string or as an array of `{type, text}` items.
fn flatten_tool_result(content: Option<&Value>) -> String {
    match content {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s.as_str()),
                other => other.get("text").and_then(Value::as_str),
            })
            .collect::<Vec<_>>()
            .join("\n"),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

/// A file pasted into a message; text files come with their extracted content.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ClaudeAttachment {
    #[serde(deserialize_with = "lenient_text")]
    pub file_name: String,
    #[serde(deserialize_with = "lenient_string")]
    pub file_type: Option<String>,
    #[serde(deserialize_with = "lenient_size")]
    pub file_size: Option<u64>,
    #[serde(deserialize_with = "lenient_string")]
    pub extracted_content: Option<String>,
}

/// An uploaded file (usually an image). The export lists it but rarely ships it.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ClaudeFile {
    #[serde(deserialize_with = "lenient_text")]
    pub file_name: String,
    #[serde(deserialize_with = "lenient_string")]
    pub file_uuid: Option<String>,
}

/// An entry of `memories.json`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ClaudeMemory {
    #[serde(deserialize_with = "lenient_string")]
    pub conversations_memory: Option<String>,
    /// Project uuid → memory text.
    #[serde(deserialize_with = "lenient_string_map")]
    pub project_memories: BTreeMap<String, String>,
    #[serde(deserialize_with = "lenient_string")]
    pub account_uuid: Option<String>,
}

/// An entry of `projects.json`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ClaudeProject {
    #[serde(deserialize_with = "lenient_string")]
    pub uuid: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub name: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub description: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub prompt_template: Option<String>,
    #[serde(deserialize_with = "lenient_seq")]
    pub docs: Vec<ClaudeProjectDoc>,
    #[serde(deserialize_with = "lenient_string")]
    pub created_at: Option<String>,
    #[serde(deserialize_with = "lenient_flag")]
    pub is_starter_project: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ClaudeProjectDoc {
    #[serde(deserialize_with = "lenient_string")]
    pub uuid: Option<String>,
    #[serde(deserialize_with = "lenient_text")]
    pub filename: String,
    #[serde(deserialize_with = "lenient_text")]
    pub content: String,
    #[serde(deserialize_with = "lenient_string")]
    pub created_at: Option<String>,
}
