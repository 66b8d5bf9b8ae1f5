//! ChatGPT conversation trees.
//!
//! The `mapping` is loaded into an index arena; [`active_path`] then walks it
//! from the root, following the branch the export marks as current and
//! otherwise the most recently created child.

use std::cmp::Ordering;
use std::collections::HashMap;

use serde_json::Value;

use super::{AssetCollector, StructuralError, map_role, push_text};
use crate::importer::{ChatGptContent, ChatGptConversation, ChatGptMessage};
use crate::model::{
    AssetSource, ContentBlock, ConversationKind, NormalizationFlag, NormalizedConversation,
    NormalizedMessage, Provider, Role,
};
use crate::utils::{short_hash, timestamp_from_secs};

/// Nodes of one conversation, addressed by index.
#[derive(Debug, Default)]
pub struct Arena {
    pub ids: Vec<String>,
    pub parent: Vec<Option<usize>>,
    pub children: Vec<Vec<usize>>,
    /// Creation marker used to order sibling branches.
    pub created: Vec<Option<f64>>,
    /// Parent index → child index on the current branch.
    pub selected: HashMap<usize, usize>,
}

impl Arena {
    pub fn build(conv: &ChatGptConversation) -> Result<Self, StructuralError> {
        let mut arena = Arena::default();
        let index: HashMap<&str, usize> = conv
            .mapping
            .keys()
            .enumerate()
            .map(|(i, id)| (id.as_str(), i))
            .collect();

        for (id, node) in &conv.mapping {
            arena.ids.push(id.clone());
            arena
                .parent
                .push(node.parent.as_deref().and_then(|p| index.get(p).copied()));
            arena.children.push(
                node.children
                    .iter()
                    .filter_map(|c| index.get(c.as_str()).copied())
                    .collect(),
            );
            arena
                .created
                .push(node.message.as_ref().and_then(|m| m.create_time));
        }

        // The current leaf's ancestor chain becomes per-node branch hints.
        if let Some(&leaf) = conv.current_node.as_deref().and_then(|c| index.get(c)) {
            let mut visited = vec![false; arena.ids.len()];
            let mut node = leaf;
            visited[node] = true;
            while let Some(parent) = arena.parent[node] {
                if visited[parent] {
                    return Err(StructuralError::Cycle {
                        node: arena.ids[parent].clone(),
                    });
                }
                visited[parent] = true;
                arena.selected.insert(parent, node);
                node = parent;
            }
        }
        Ok(arena)
    }

    /// The root the current branch hangs from, else the first parentless node.
    pub fn root(&self) -> Option<usize> {
        let roots: Vec<usize> = (0..self.ids.len())
            .filter(|&i| self.parent[i].is_none())
            .collect();
        roots
            .iter()
            .copied()
            .find(|r| self.selected.contains_key(r))
            .or_else(|| roots.first().copied())
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Ordered node indices of the active branch, root first.
pub fn active_path(arena: &Arena) -> Result<Vec<usize>, StructuralError> {
    if arena.is_empty() {
        return Ok(Vec::new());
    }
    let Some(mut node) = arena.root() else {
        // Every node has a parent inside the mapping: the parents form a loop.
        return Err(StructuralError::Cycle {
            node: arena.ids[0].clone(),
        });
    };

    let mut visited = vec![false; arena.len()];
    let mut path = Vec::new();
    loop {
        if visited[node] {
            return Err(StructuralError::Cycle {
                node: arena.ids[node].clone(),
            });
        }
        visited[node] = true;
        path.push(node);

        let children = &arena.children[node];
        let hinted = arena
            .selected
            .get(&node)
            .copied()
            .filter(|c| children.contains(c));
        let next = hinted.or_else(|| latest_child(arena, children));
        match next {
            Some(child) => node = child,
            None => return Ok(path),
        }
    }
}

/// Child with the highest creation marker. Missing markers sort lowest and
/// ties go to the later child in the list.
fn latest_child(arena: &Arena, children: &[usize]) -> Option<usize> {
    children.iter().copied().max_by(|&a, &b| {
        match (arena.created[a], arena.created[b]) {
            (Some(x), Some(y)) => x.total_cmp(&y),
            (Some(_), None) => Ordering::Greater,
            (None, Some(_)) => Ordering::Less,
            (None, None) => Ordering::Equal,
        }
    })
}

pub fn normalize(value: Value) -> Result<NormalizedConversation, StructuralError> {
    let raw: ChatGptConversation = serde_json::from_value(value)?;
    let arena = Arena::build(&raw)?;
    let path = active_path(&arena)?;

    let title = raw
        .title
        .clone()
        .filter(|t| !t.trim().is_empty())
        .unwrap_or_else(|| "Untitled".to_string());
    let id = raw.identity().map(str::to_owned).unwrap_or_else(|| {
        short_hash(format!("{title}{:?}", raw.create_time).as_bytes())
    });
    let mut conv =
        NormalizedConversation::new(id, title, Provider::ChatGpt, ConversationKind::Conversation);
    conv.created_at = raw.create_time.and_then(timestamp_from_secs);

    let mut assets = AssetCollector::default();
    for idx in path {
        let Some(message) = raw
            .mapping
            .get(&arena.ids[idx])
            .and_then(|n| n.message.as_ref())
        else {
            continue;
        };
        if message.is_hidden() {
            continue;
        }
        if let Some(normalized) = convert_message(message, &mut assets, &mut conv.flags) {
            conv.push_message(normalized);
        }
    }
    Ok(conv)
}

fn convert_message(
    message: &ChatGptMessage,
    assets: &mut AssetCollector,
    flags: &mut Vec<NormalizationFlag>,
) -> Option<NormalizedMessage> {
    let (mut role, flagged) = map_role(&message.author.role);
    if flagged {
        flags.push(NormalizationFlag::UnknownRole {
            raw: message.author.role.clone(),
            mapped: role,
        });
    }
    let content = &message.content;
    let author_name = message.author.name.clone();
    let mut blocks = Vec::new();

    match content.content_type.as_str() {
        "text" => push_text(&mut blocks, &string_parts(content)),
        "multimodal_text" => multimodal_parts(content, assets, &mut blocks),
        "code" => {
            let code = content.text.clone().unwrap_or_else(|| string_parts(content));
            match message.tool_recipient() {
                Some(recipient) => blocks.push(ContentBlock::ToolInvocation {
                    name: recipient.to_string(),
                    input: code,
                }),
                None => blocks.push(ContentBlock::Code {
                    language: content
                        .language
                        .clone()
                        .filter(|l| !l.is_empty() && l != "unknown"),
                    code,
                    caption: None,
                }),
            }
        }
        "execution_output" => {
            role = Role::ToolResult;
            blocks.push(ContentBlock::ToolOutput {
                name: author_name.clone(),
                content: content.text.clone().unwrap_or_default(),
                is_error: false,
            });
        }
        "thoughts" => {
            role = Role::Thinking;
            for thought in &content.thoughts {
                let body = match (&thought.summary, &thought.content) {
                    (Some(s), Some(c)) if !s.trim().is_empty() => format!("**{}**\n\n{}", s.trim(), c),
                    (_, Some(c)) => c.clone(),
                    (Some(s), None) => s.clone(),
                    (None, None) => continue,
                };
                push_text(&mut blocks, &body);
            }
        }
        "reasoning_recap" => {
            role = Role::Thinking;
            push_text(&mut blocks, content.content.as_deref().unwrap_or_default());
        }
        "tether_browsing_display" => {
            role = Role::ToolResult;
            let body = content
                .result
                .clone()
                .filter(|r| !r.trim().is_empty())
                .or_else(|| content.summary.clone())
                .unwrap_or_default();
            blocks.push(ContentBlock::ToolOutput {
                name: author_name.clone(),
                content: body,
                is_error: false,
            });
        }
        "tether_quote" => {
            role = Role::ToolResult;
            let mut body = content
                .text
                .as_deref()
                .unwrap_or_default()
                .lines()
                .map(|l| format!("> {l}"))
                .collect::<Vec<_>>()
                .join("\n");
            if let Some(url) = &content.url {
                let title = content.title.as_deref().unwrap_or(url);
                body.push_str(&format!("\n\nSource: [{title}]({url})"));
            }
            push_text(&mut blocks, &body);
        }
        "user_editable_context" => {
            role = Role::System;
            if let Some(profile) = &content.user_profile {
                push_text(&mut blocks, profile);
            }
            if let Some(instructions) = &content.user_instructions {
                push_text(&mut blocks, instructions);
            }
        }
        "system_error" => {
            blocks.push(ContentBlock::ToolOutput {
                name: author_name.clone(),
                content: content.text.clone().unwrap_or_default(),
                is_error: true,
            });
        }
        other => {
            flags.push(NormalizationFlag::UnknownContent {
                kind: other.to_string(),
            });
            let mut text = string_parts(content);
            if text.trim().is_empty() {
                text = content.text.clone().unwrap_or_default();
            }
            push_text(&mut blocks, &text);
        }
    }

    if role == Role::Assistant && message.tool_recipient().is_some() {
        role = Role::ToolUse;
    }
    if role == Role::ToolResult {
        // Plain text from a tool is its output.
        for block in &mut blocks {
            if let ContentBlock::Text(text) = block {
                *block = ContentBlock::ToolOutput {
                    name: author_name.clone(),
                    content: std::mem::take(text),
                    is_error: false,
                };
            }
        }
    }

    let message = NormalizedMessage::new(role, blocks);
    (!message.is_empty()).then_some(message)
}

fn string_parts(content: &ChatGptContent) -> String {
    content
        .parts
        .iter()
        .filter_map(Value::as_str)
        .collect::<Vec<_>>()
        .join("\n")
}

fn multimodal_parts(
    content: &ChatGptContent,
    assets: &mut AssetCollector,
    blocks: &mut Vec<ContentBlock>,
) {
    for part in &content.parts {
        match part {
            Value::String(text) => push_text(blocks, text),
            Value::Object(obj) => {
                let kind = obj.get("content_type").and_then(Value::as_str).unwrap_or_default();
                let pointer = obj.get("asset_pointer").and_then(Value::as_str);
                match (kind, pointer) {
                    ("image_asset_pointer", Some(pointer)) => {
                        let alt = obj
                            .get("metadata")
                            .and_then(|m| m.get("dalle"))
                            .and_then(|d| d.get("prompt"))
                            .and_then(Value::as_str)
                            .map(str::to_owned);
                        blocks.push(assets.block(AssetSource::Internal(pointer.to_string()), alt));
                    }
                    _ => {
                        if let Some(text) = obj.get("text").and_then(Value::as_str) {
                            push_text(blocks, text);
                        }
                    }
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn node(id: &str, parent: Option<&str>, children: &[&str], msg: Value) -> (String, Value) {
        (
            id.to_string(),
            json!({"id": id, "parent": parent, "children": children, "message": msg}),
        )
    }

    fn msg(role: &str, text: &str, time: Option<f64>) -> Value {
        json!({
            "id": text,
            "author": {"role": role},
            "create_time": time,
            "content": {"content_type": "text", "parts": [text]}
        })
    }

    fn conversation(nodes: Vec<(String, Value)>, current: Option<&str>) -> Value {
        let mapping: serde_json::Map<String, Value> = nodes.into_iter().collect();
        json!({
            "id": "conv-1",
            "title": "Branches",
            "create_time": 1_700_000_000.0,
            "current_node": current,
            "mapping": mapping
        })
    }

    fn texts(conv: &NormalizedConversation) -> Vec<String> {
        conv.messages
            .iter()
            .flat_map(|m| m.blocks.iter())
            .map(|b| match b {
                ContentBlock::Text(t) => t.clone(),
                other => format!("{other:?}"),
            })
            .collect()
    }

    fn branching(current: Option<&str>) -> Value {
        conversation(
            vec![
                node("root", None, &["q"], Value::Null),
                node("q", Some("root"), &["a1", "a2"], msg("user", "question", Some(1.0))),
                node("a1", Some("q"), &["f1"], msg("assistant", "old answer", Some(2.0))),
                node("a2", Some("q"), &[], msg("assistant", "new answer", Some(3.0))),
                node("f1", Some("a1"), &[], msg("user", "follow up", Some(4.0))),
            ],
            current,
        )
    }

    #[test]
    fn current_node_selects_the_branch() {
        let conv = normalize(branching(Some("f1"))).unwrap();
        assert_eq!(texts(&conv), vec!["question", "old answer", "follow up"]);
    }

    #[test]
    fn without_hint_latest_child_wins() {
        let conv = normalize(branching(None)).unwrap();
        assert_eq!(texts(&conv), vec!["question", "new answer"]);
    }

    #[test]
    fn ties_and_missing_markers_prefer_later_child() {
        let conv = normalize(conversation(
            vec![
                node("root", None, &["x", "y", "z"], Value::Null),
                node("x", Some("root"), &[], msg("user", "x", Some(5.0))),
                node("y", Some("root"), &[], msg("user", "y", Some(5.0))),
                node("z", Some("root"), &[], msg("user", "z", None)),
            ],
            None,
        ))
        .unwrap();
        assert_eq!(texts(&conv), vec!["y"]);
    }

    #[test]
    fn cycle_is_a_structural_error() {
        let value = conversation(
            vec![
                node("a", Some("b"), &["b"], msg("user", "a", Some(1.0))),
                node("b", Some("a"), &["a"], msg("assistant", "b", Some(2.0))),
            ],
            None,
        );
        assert!(matches!(normalize(value), Err(StructuralError::Cycle { .. })));

        let value = conversation(
            vec![
                node("root", None, &["a"], Value::Null),
                node("a", Some("root"), &["b"], msg("user", "a", Some(1.0))),
                node("b", Some("a"), &["a"], msg("assistant", "b", Some(2.0))),
            ],
            None,
        );
        assert!(matches!(normalize(value), Err(StructuralError::Cycle { .. })));
    }

    #[test]
    fn empty_and_hidden_nodes_are_skipped() {
        let mut hidden = msg("system", "secret", Some(1.5));
        hidden["metadata"] = json!({"is_visually_hidden_from_conversation": true});
        let conv = normalize(conversation(
            vec![
                node("root", None, &["s"], Value::Null),
                node("s", Some("root"), &["e"], hidden),
                node("e", Some("s"), &["u"], msg("assistant", "", Some(2.0))),
                node("u", Some("e"), &[], msg("user", "hello", Some(3.0))),
            ],
            Some("u"),
        ))
        .unwrap();
        assert_eq!(texts(&conv), vec!["hello"]);
        assert_eq!(conv.messages[0].index, 0);
    }

    #[test]
    fn unknown_role_is_mapped_and_flagged() {
        let conv = normalize(conversation(
            vec![
                node("root", None, &["c"], Value::Null),
                node("c", Some("root"), &[], msg("critic", "looks fine", Some(1.0))),
            ],
            None,
        ))
        .unwrap();
        assert_eq!(conv.messages[0].role, Role::Assistant);
        assert_eq!(conv.flagged_roles(), 1);
    }

    #[test]
    fn image_pointers_become_deduplicated_assets() {
        let image = json!({
            "id": "img",
            "author": {"role": "user"},
            "create_time": 1.0,
            "content": {"content_type": "multimodal_text", "parts": [
                {"content_type": "image_asset_pointer", "asset_pointer": "sediment://file_aa"},
                "what is this?",
                {"content_type": "image_asset_pointer", "asset_pointer": "sediment://file_aa"}
            ]}
        });
        let conv = normalize(conversation(
            vec![
                node("root", None, &["i"], Value::Null),
                node("i", Some("root"), &[], image),
            ],
            None,
        ))
        .unwrap();
        let ordinals: Vec<_> = conv.asset_refs().map(|a| a.placeholder.clone()).collect();
        assert_eq!(ordinals, vec!["asset-001", "asset-001"]);
    }

    #[test]
    fn tool_calls_and_outputs_get_tool_roles() {
        let call = json!({
            "id": "call",
            "author": {"role": "assistant"},
            "recipient": "python",
            "content": {"content_type": "code", "language": "unknown", "text": "print(1)"}
        });
        let output = json!({
            "id": "out",
            "author": {"role": "tool", "name": "python"},
            "content": {"content_type": "execution_output", "text": "1"}
        });
        let conv = normalize(conversation(
            vec![
                node("root", None, &["c"], Value::Null),
                node("c", Some("root"), &["o"], call),
                node("o", Some("c"), &[], output),
            ],
            None,
        ))
        .unwrap();
        let roles: Vec<_> = conv.messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::ToolUse, Role::ToolResult]);
        assert_eq!(
            conv.messages[0].blocks[0],
            ContentBlock::ToolInvocation {
                name: "python".into(),
                input: "print(1)".into()
            }
        );
    }

    #[test]
    fn unknown_content_type_falls_back_to_text() {
        let odd = json!({
            "id": "odd",
            "author": {"role": "assistant"},
            "content": {"content_type": "hologram", "parts": ["still readable"]}
        });
        let conv = normalize(conversation(
            vec![node("root", None, &["o"], Value::Null), node("o", Some("root"), &[], odd)],
            None,
        ))
        .unwrap();
        assert_eq!(texts(&conv), vec!["still readable"]);
        assert_eq!(conv.flagged_content(), 1);
    }
}
