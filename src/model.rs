//! Provider-agnostic intermediate form shared by every normalizer, the asset
//! resolver and the renderer.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Provider / kind tags
// ---------------------------------------------------------------------------

/// Export source. Parsed from the provider directory name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    ChatGpt,
    Claude,
    Gemini,
}

impl Provider {
    pub const ALL: [Provider; 3] = [Provider::ChatGpt, Provider::Claude, Provider::Gemini];

    pub fn tag(self) -> &'static str {
        match self {
            Provider::ChatGpt => "chatgpt",
            Provider::Claude => "claude",
            Provider::Gemini => "gemini",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "chatgpt" | "openai" => Ok(Provider::ChatGpt),
            "claude" | "anthropic" => Ok(Provider::Claude),
            "gemini" | "bard" => Ok(Provider::Gemini),
            other => Err(format!("unknown provider: {other:?}")),
        }
    }
}

/// What a normalized document represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationKind {
    Conversation,
    Memory,
    Project,
}

impl ConversationKind {
    pub fn tag(self) -> &'static str {
        match self {
            ConversationKind::Conversation => "conversation",
            ConversationKind::Memory => "memory",
            ConversationKind::Project => "project",
        }
    }
}

// ---------------------------------------------------------------------------
// Roles
// ---------------------------------------------------------------------------

/// Closed set of message roles. Source roles outside this set are mapped to the
/// nearest member and flagged on the conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    ToolUse,
    ToolResult,
    Thinking,
    System,
}

impl Role {
    pub const ALL: [Role; 6] = [
        Role::User,
        Role::Assistant,
        Role::ToolUse,
        Role::ToolResult,
        Role::Thinking,
        Role::System,
    ];

    /// Heading used by the renderer. One label per role.
    pub fn label(self) -> &'static str {
        match self {
            Role::User => "User",
            Role::Assistant => "Assistant",
            Role::ToolUse => "Tool Call",
            Role::ToolResult => "Tool Result",
            Role::Thinking => "Thinking",
            Role::System => "System",
        }
    }
}

// ---------------------------------------------------------------------------
// Assets
// ---------------------------------------------------------------------------

/// Where an asset's bytes come from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AssetSource {
    /// Opaque export-internal reference (`sediment://file_…`,
    /// `file-service://file-…`, or a bare file name shipped in the bundle).
    Internal(String),
    /// Self-contained `data:` URI.
    Inline(String),
    /// Remote URL that has to be fetched.
    Remote(String),
}

impl AssetSource {
    /// Identity used to deduplicate references within one conversation.
    pub fn identity(&self) -> &str {
        match self {
            AssetSource::Internal(s) | AssetSource::Inline(s) | AssetSource::Remote(s) => s,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            AssetSource::Internal(_) => "internal",
            AssetSource::Inline(_) => "inline",
            AssetSource::Remote(_) => "remote",
        }
    }
}

/// An asset written to the attachments directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAsset {
    pub filename: String,
    pub path: PathBuf,
    /// Markdown snippet that embeds the file.
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AssetState {
    #[default]
    Pending,
    Resolved(ResolvedAsset),
    Unresolved {
        reason: String,
    },
}

impl AssetState {
    pub fn is_resolved(&self) -> bool {
        matches!(self, AssetState::Resolved(_))
    }
}

/// An asset reference inside a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetRef {
    /// Stable token, `asset-NNN`, unique per distinct reference.
    pub placeholder: String,
    /// 1-based position in first-seen order.
    pub ordinal: usize,
    pub source: AssetSource,
    pub alt: Option<String>,
    pub state: AssetState,
}

pub fn placeholder_for(ordinal: usize) -> String {
    format!("asset-{ordinal:03}")
}

// ---------------------------------------------------------------------------
// Content
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentBlock {
    Text(String),
    Code {
        language: Option<String>,
        code: String,
        /// Label shown above the fence (attachment or document name).
        caption: Option<String>,
    },
    Asset(AssetRef),
    ToolInvocation {
        name: String,
        input: String,
    },
    ToolOutput {
        name: Option<String>,
        content: String,
        is_error: bool,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text(text.into())
    }

    /// Whether the block carries nothing worth rendering.
    pub fn is_blank(&self) -> bool {
        match self {
            ContentBlock::Text(t) => t.trim().is_empty(),
            ContentBlock::Code { code, .. } => code.trim().is_empty(),
            ContentBlock::Asset(_) => false,
            ContentBlock::ToolInvocation { name, input } => {
                name.trim().is_empty() && input.trim().is_empty()
            }
            ContentBlock::ToolOutput { content, .. } => content.trim().is_empty(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedMessage {
    pub role: Role,
    pub blocks: Vec<ContentBlock>,
    /// Position in the emitted sequence. Rendering follows this order.
    pub index: usize,
    /// Section heading overriding the role label (memories, projects).
    pub title: Option<String>,
    /// Synthetic reference material rather than a conversational turn.
    pub reference: bool,
}

impl NormalizedMessage {
    pub fn new(role: Role, blocks: Vec<ContentBlock>) -> Self {
        Self {
            role,
            blocks,
            index: 0,
            title: None,
            reference: false,
        }
    }

    pub fn titled(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn as_reference(mut self) -> Self {
        self.reference = true;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.iter().all(ContentBlock::is_blank)
    }
}

/// Something the normalizer had to guess at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NormalizationFlag {
    UnknownRole { raw: String, mapped: Role },
    UnknownContent { kind: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedConversation {
    pub id: String,
    pub title: String,
    pub provider: Provider,
    pub kind: ConversationKind,
    pub created_at: Option<DateTime<Utc>>,
    pub messages: Vec<NormalizedMessage>,
    /// Placeholder → resolution outcome, filled in by the asset resolver.
    pub assets: BTreeMap<String, AssetState>,
    pub flags: Vec<NormalizationFlag>,
}

impl NormalizedConversation {
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        provider: Provider,
        kind: ConversationKind,
    ) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            provider,
            kind,
            created_at: None,
            messages: Vec::new(),
            assets: BTreeMap::new(),
            flags: Vec::new(),
        }
    }

    /// Append a message, dropping blank blocks and empty messages, and assign
    /// its source-order index.
    pub fn push_message(&mut self, mut message: NormalizedMessage) {
        message.blocks.retain(|b| !b.is_blank());
        if message.blocks.is_empty() {
            return;
        }
        message.index = self.messages.len();
        self.messages.push(message);
    }

    pub fn asset_refs(&self) -> impl Iterator<Item = &AssetRef> {
        self.messages
            .iter()
            .flat_map(|m| m.blocks.iter())
            .filter_map(|b| match b {
                ContentBlock::Asset(a) => Some(a),
                _ => None,
            })
    }

    pub fn asset_refs_mut(&mut self) -> impl Iterator<Item = &mut AssetRef> {
        self.messages
            .iter_mut()
            .flat_map(|m| m.blocks.iter_mut())
            .filter_map(|b| match b {
                ContentBlock::Asset(a) => Some(a),
                _ => None,
            })
    }

    pub fn flagged_roles(&self) -> usize {
        self.flags
            .iter()
            .filter(|f| matches!(f, NormalizationFlag::UnknownRole { .. }))
            .count()
    }

    pub fn flagged_content(&self) -> usize {
        self.flags
            .iter()
            .filter(|f| matches!(f, NormalizationFlag::UnknownContent { .. }))
            .count()
    }

    pub fn unresolved_assets(&self) -> usize {
        self.assets
            .values()
            .filter(|s| !s.is_resolved())
            .count()
    }
}
