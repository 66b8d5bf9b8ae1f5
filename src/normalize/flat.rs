//! Claude exports: flat `chat_messages` arrays, the memory document and
//! projects. Input order is kept exactly.

use serde_json::Value;

use super::{AssetCollector, FlatContext, StructuralError, map_role, push_text};
use crate::importer::{
    ClaudeAttachment, ClaudeChatMessage, ClaudeContent, ClaudeConversation, ClaudeMemory,
    ClaudeProject,
};
use crate::model::{
    AssetSource, ContentBlock, ConversationKind, NormalizationFlag, NormalizedConversation,
    NormalizedMessage, Provider, Role,
};
use crate::utils::{language_for_filename, parse_rfc3339, short_hash};

pub fn conversation(value: Value) -> Result<NormalizedConversation, StructuralError> {
    let raw: ClaudeConversation = serde_json::from_value(value)?;

    let title = [&raw.name, &raw.summary]
        .into_iter()
        .flatten()
        .find(|t| !t.trim().is_empty())
        .cloned()
        .unwrap_or_else(|| "Untitled".to_string());
    let id = raw
        .uuid
        .clone()
        .filter(|u| !u.is_empty())
        .unwrap_or_else(|| short_hash(format!("{title}{:?}", raw.created_at).as_bytes()));
    let mut conv =
        NormalizedConversation::new(id, title, Provider::Claude, ConversationKind::Conversation);
    conv.created_at = raw.created_at.as_deref().and_then(parse_rfc3339);

    let mut assets = AssetCollector::default();
    for message in &raw.chat_messages {
        for normalized in convert_message(message, &mut assets, &mut conv.flags) {
            conv.push_message(normalized);
        }
    }
    Ok(conv)
}

/// Split one chat message into role runs: consecutive items that map to the
/// same role share a message, adjacent text fragments share a block.
fn convert_message(
    message: &ClaudeChatMessage,
    assets: &mut AssetCollector,
    flags: &mut Vec<NormalizationFlag>,
) -> Vec<NormalizedMessage> {
    let (base, flagged) = map_role(&message.sender);
    if flagged {
        flags.push(NormalizationFlag::UnknownRole {
            raw: message.sender.clone(),
            mapped: base,
        });
    }

    let mut items: Vec<(Role, ContentBlock)> = Vec::new();
    for item in &message.content {
        match item {
            ClaudeContent::Text { text } => items.push((base, ContentBlock::text(text))),
            ClaudeContent::Thinking { thinking } => {
                items.push((Role::Thinking, ContentBlock::text(thinking)))
            }
            ClaudeContent::ToolUse { name, input } => items.push((
                Role::ToolUse,
                ContentBlock::ToolInvocation {
                    name: name.clone(),
                    input: render_input(input),
                },
            )),
            ClaudeContent::ToolResult {
                name,
                content,
                is_error,
            } => items.push((
                Role::ToolResult,
                ContentBlock::ToolOutput {
                    name: name.clone(),
                    content: content.clone(),
                    is_error: *is_error,
                },
            )),
            ClaudeContent::TokenBudget => {}
            ClaudeContent::Other { kind, text } => {
                flags.push(NormalizationFlag::UnknownContent { kind: kind.clone() });
                if let Some(text) = text {
                    items.push((base, ContentBlock::text(text)));
                }
            }
        }
    }
    if message.content.is_empty()
        && let Some(text) = &message.text
    {
        items.push((base, ContentBlock::text(text)));
    }

    for attachment in &message.attachments {
        items.push((base, attachment_block(attachment)));
    }
    for file in message.files.iter().filter(|f| !f.file_name.is_empty()) {
        items.push((
            base,
            assets.block(
                AssetSource::Internal(file.file_name.clone()),
                Some(file.file_name.clone()),
            ),
        ));
    }

    let mut runs: Vec<NormalizedMessage> = Vec::new();
    for (role, block) in items {
        match runs.last_mut() {
            Some(run) if run.role == role => append_block(&mut run.blocks, block),
            _ => {
                let mut blocks = Vec::new();
                append_block(&mut blocks, block);
                runs.push(NormalizedMessage::new(role, blocks));
            }
        }
    }
    runs
}

fn append_block(blocks: &mut Vec<ContentBlock>, block: ContentBlock) {
    match block {
        ContentBlock::Text(text) => push_text(blocks, &text),
        other => blocks.push(other),
    }
}

fn render_input(input: &Value) -> String {
    match input {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    }
}

fn attachment_block(attachment: &ClaudeAttachment) -> ContentBlock {
    let name = if attachment.file_name.is_empty() {
        "unknown"
    } else {
        attachment.file_name.as_str()
    };
    match attachment
        .extracted_content
        .as_deref()
        .filter(|c| !c.trim().is_empty())
    {
        Some(content) => ContentBlock::Code {
            language: language_for_filename(name).map(str::to_owned),
            code: content.to_string(),
            caption: Some(format!("Attached: {name}")),
        },
        None => ContentBlock::text(format!(
            "**Attached: {name}** ({} bytes)",
            attachment.file_size.unwrap_or(0)
        )),
    }
}

/// The memory document: general context plus one section per project.
pub fn memory(value: Value, ctx: &FlatContext) -> Result<NormalizedConversation, StructuralError> {
    let raw: ClaudeMemory = serde_json::from_value(value)?;
    let id = match raw.account_uuid.as_deref() {
        Some(account) if !account.is_empty() => format!("memories-{account}"),
        _ => "memories".to_string(),
    };
    let mut conv =
        NormalizedConversation::new(id, "Claude Memories", Provider::Claude, ConversationKind::Memory);

    if let Some(general) = &raw.conversations_memory {
        conv.push_message(
            NormalizedMessage::new(Role::System, vec![ContentBlock::text(general)])
                .titled("General Context")
                .as_reference(),
        );
    }

    let mut projects: Vec<(String, &String)> = raw
        .project_memories
        .iter()
        .map(|(uuid, text)| (ctx.project_name(uuid), text))
        .collect();
    projects.sort_by(|a, b| a.0.cmp(&b.0));
    for (name, text) in projects {
        conv.push_message(
            NormalizedMessage::new(Role::System, vec![ContentBlock::text(text)])
                .titled(format!("Project Memory: {name}"))
                .as_reference(),
        );
    }
    Ok(conv)
}

/// A project: description, instructions, memory and embedded documents, all
/// as reference material. Starter projects yield an empty conversation.
pub fn project(value: Value, ctx: &FlatContext) -> Result<NormalizedConversation, StructuralError> {
    let raw: ClaudeProject = serde_json::from_value(value)?;
    let title = raw
        .name
        .clone()
        .filter(|n| !n.trim().is_empty())
        .unwrap_or_else(|| "Untitled Project".to_string());
    let id = raw
        .uuid
        .clone()
        .filter(|u| !u.is_empty())
        .unwrap_or_else(|| short_hash(title.as_bytes()));
    let mut conv =
        NormalizedConversation::new(id.clone(), title, Provider::Claude, ConversationKind::Project);
    conv.created_at = raw.created_at.as_deref().and_then(parse_rfc3339);
    if raw.is_starter_project {
        return Ok(conv);
    }

    let section = |title: &str, text: &str| {
        NormalizedMessage::new(Role::System, vec![ContentBlock::text(text)])
            .titled(title)
            .as_reference()
    };
    if let Some(description) = &raw.description {
        conv.push_message(section("Description", description));
    }
    if let Some(template) = &raw.prompt_template {
        conv.push_message(section("Instructions", template));
    }
    if let Some(memory) = ctx.project_memories.get(&id) {
        conv.push_message(section("Project Memory", memory));
    }

    let docs: Vec<ContentBlock> = raw
        .docs
        .iter()
        .map(|doc| ContentBlock::Code {
            language: language_for_filename(&doc.filename).map(str::to_owned),
            code: doc.content.clone(),
            caption: Some(doc.filename.clone()),
        })
        .collect();
    conv.push_message(
        NormalizedMessage::new(Role::System, docs)
            .titled("Project Documents")
            .as_reference(),
    );
    Ok(conv)
}
