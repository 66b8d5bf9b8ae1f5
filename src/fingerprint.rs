//! Schema fingerprints: the structural signature each provider's export is
//! expected to have, and the drift report produced by comparing a loaded
//! export against it.
//!
//! Fingerprints are plain static data. Record paths use a small syntax:
//! `name` descends into a key, `[]` iterates an array (a non-array value is
//! treated as one item) and `{}` iterates the values of an object, so
//! `[].mapping{}.message` visits every message of every ChatGPT conversation.
//!
//! Drift never fails a conversion. The report is logged and carried in the
//! unit statistics.

use std::collections::{BTreeMap, HashMap};

use log::debug;
use scraper::{Html, Selector};
use serde::Serialize;
use serde_json::Value;

use crate::model::Provider;
use crate::source::RawExport;

// ---------------------------------------------------------------------------
// Declarative fingerprint data
// ---------------------------------------------------------------------------

/// Keys expected on every record found at `at` inside `file`.
#[derive(Debug, Clone, Serialize)]
pub struct FieldRule {
    pub file: &'static str,
    pub at: &'static str,
    pub required: &'static [&'static str],
    /// Optional keys that are recognised and do not count as drift.
    pub known: &'static [&'static str],
}

/// Allowed string values at a path.
#[derive(Debug, Clone, Serialize)]
pub struct DiscriminatorRule {
    pub file: &'static str,
    pub at: &'static str,
    pub allowed: &'static [&'static str],
}

/// JSON value kinds, for type expectations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JsonKind {
    Null,
    Bool,
    Number,
    String,
    Array,
    Object,
}

impl JsonKind {
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Null => JsonKind::Null,
            Value::Bool(_) => JsonKind::Bool,
            Value::Number(_) => JsonKind::Number,
            Value::String(_) => JsonKind::String,
            Value::Array(_) => JsonKind::Array,
            Value::Object(_) => JsonKind::Object,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            JsonKind::Null => "null",
            JsonKind::Bool => "bool",
            JsonKind::Number => "number",
            JsonKind::String => "string",
            JsonKind::Array => "array",
            JsonKind::Object => "object",
        }
    }
}

/// Kinds a key may hold on the records at `at`, when present.
#[derive(Debug, Clone, Serialize)]
pub struct TypeRule {
    pub file: &'static str,
    pub at: &'static str,
    pub field: &'static str,
    pub allowed: &'static [JsonKind],
}

#[derive(Debug, Clone, Serialize)]
pub struct SchemaFingerprint {
    pub provider: Provider,
    pub version: &'static str,
    pub required_files: &'static [&'static str],
    pub known_files: &'static [&'static str],
    pub fields: &'static [FieldRule],
    pub discriminators: &'static [DiscriminatorRule],
    pub types: &'static [TypeRule],
    /// CSS selectors that must match in every markup document.
    pub selectors: &'static [&'static str],
}

impl SchemaFingerprint {
    pub fn label(&self) -> String {
        format!("{} {}", self.provider, self.version)
    }

    fn is_known_file(&self, name: &str) -> bool {
        self.required_files.contains(&name)
            || self.known_files.contains(&name)
            || self.fields.iter().any(|r| r.file == name)
    }
}

pub const CHATGPT_V1: SchemaFingerprint = SchemaFingerprint {
    provider: Provider::ChatGpt,
    version: "1.0",
    required_files: &["conversations.json"],
    known_files: &[
        "user.json",
        "message_feedback.json",
        "model_comparisons.json",
        "shared_conversations.json",
        "shopping.json",
        "sora.json",
    ],
    fields: &[
        FieldRule {
            file: "conversations.json",
            at: "[]",
            required: &["title", "create_time", "update_time", "mapping"],
            known: &[
                "id",
                "conversation_id",
                "current_node",
                "moderation_results",
                "plugin_ids",
                "conversation_template_id",
                "gizmo_id",
                "gizmo_type",
                "is_archived",
                "is_starred",
                "safe_urls",
                "blocked_urls",
                "default_model_slug",
                "conversation_origin",
                "voice",
                "async_status",
                "disabled_tool_ids",
                "is_do_not_remember",
                "memory_scope",
                "sugar_item_id",
                "sugar_item_visible",
                "is_study_mode",
                "owner",
                "context_scopes",
                "pinned_time",
            ],
        },
        FieldRule {
            file: "conversations.json",
            at: "[].mapping{}",
            required: &["id", "parent", "children"],
            known: &["message"],
        },
        FieldRule {
            file: "conversations.json",
            at: "[].mapping{}.message",
            required: &["id", "author", "content"],
            known: &[
                "create_time",
                "update_time",
                "status",
                "end_turn",
                "weight",
                "metadata",
                "recipient",
                "channel",
            ],
        },
    ],
    discriminators: &[
        DiscriminatorRule {
            file: "conversations.json",
            at: "[].mapping{}.message.author.role",
            allowed: &["user", "assistant", "system", "tool"],
        },
        DiscriminatorRule {
            file: "conversations.json",
            at: "[].mapping{}.message.content.content_type",
            allowed: &[
                "text",
                "multimodal_text",
                "code",
                "execution_output",
                "thoughts",
                "reasoning_recap",
                "tether_browsing_display",
                "tether_quote",
                "user_editable_context",
                "system_error",
            ],
        },
    ],
    types: &[
        TypeRule {
            file: "conversations.json",
            at: "[]",
            field: "title",
            allowed: &[JsonKind::String, JsonKind::Null],
        },
        TypeRule {
            file: "conversations.json",
            at: "[]",
            field: "create_time",
            allowed: &[JsonKind::Number, JsonKind::Null],
        },
        TypeRule {
            file: "conversations.json",
            at: "[]",
            field: "update_time",
            allowed: &[JsonKind::Number, JsonKind::Null],
        },
        TypeRule {
            file: "conversations.json",
            at: "[]",
            field: "current_node",
            allowed: &[JsonKind::String, JsonKind::Null],
        },
        TypeRule {
            file: "conversations.json",
            at: "[].mapping{}.message",
            field: "create_time",
            allowed: &[JsonKind::Number, JsonKind::Null],
        },
        TypeRule {
            file: "conversations.json",
            at: "[].mapping{}.message",
            field: "author",
            allowed: &[JsonKind::Object],
        },
        TypeRule {
            file: "conversations.json",
            at: "[].mapping{}.message",
            field: "content",
            allowed: &[JsonKind::Object],
        },
        TypeRule {
            file: "conversations.json",
            at: "[].mapping{}.message.author",
            field: "role",
            allowed: &[JsonKind::String],
        },
        TypeRule {
            file: "conversations.json",
            at: "[].mapping{}.message.content",
            field: "parts",
            allowed: &[JsonKind::Array],
        },
    ],
    selectors: &[],
};

pub const CLAUDE_V1: SchemaFingerprint = SchemaFingerprint {
    provider: Provider::Claude,
    version: "1.0",
    required_files: &["conversations.json"],
    known_files: &["users.json", "memories.json", "projects.json"],
    fields: &[
        FieldRule {
            file: "conversations.json",
            at: "[]",
            required: &["uuid", "name", "created_at", "updated_at", "chat_messages"],
            known: &["summary", "account"],
        },
        FieldRule {
            file: "conversations.json",
            at: "[].chat_messages[]",
            required: &["uuid", "text", "sender", "created_at", "content"],
            known: &["updated_at", "attachments", "files", "parent_message_uuid"],
        },
        FieldRule {
            file: "memories.json",
            at: "[]",
            required: &["conversations_memory", "project_memories"],
            known: &["account_uuid"],
        },
        FieldRule {
            file: "projects.json",
            at: "[]",
            required: &["uuid", "name", "description", "docs", "created_at"],
            known: &[
                "updated_at",
                "is_private",
                "is_starter_project",
                "prompt_template",
                "creator",
            ],
        },
        FieldRule {
            file: "users.json",
            at: "[]",
            required: &["uuid", "full_name", "email_address"],
            known: &["verified_phone_number"],
        },
    ],
    discriminators: &[
        DiscriminatorRule {
            file: "conversations.json",
            at: "[].chat_messages[].sender",
            allowed: &["human", "assistant"],
        },
        DiscriminatorRule {
            file: "conversations.json",
            at: "[].chat_messages[].content[].type",
            allowed: &["text", "tool_use", "tool_result", "thinking", "token_budget"],
        },
    ],
    types: &[
        TypeRule {
            file: "conversations.json",
            at: "[]",
            field: "name",
            allowed: &[JsonKind::String, JsonKind::Null],
        },
        TypeRule {
            file: "conversations.json",
            at: "[]",
            field: "created_at",
            allowed: &[JsonKind::String],
        },
        TypeRule {
            file: "conversations.json",
            at: "[].chat_messages[]",
            field: "sender",
            allowed: &[JsonKind::String],
        },
        TypeRule {
            file: "conversations.json",
            at: "[].chat_messages[]",
            field: "content",
            allowed: &[JsonKind::Array],
        },
        TypeRule {
            file: "conversations.json",
            at: "[].chat_messages[]",
            field: "attachments",
            allowed: &[JsonKind::Array],
        },
        TypeRule {
            file: "conversations.json",
            at: "[].chat_messages[].attachments[]",
            field: "file_size",
            allowed: &[JsonKind::Number, JsonKind::Null],
        },
        TypeRule {
            file: "memories.json",
            at: "[]",
            field: "conversations_memory",
            allowed: &[JsonKind::String, JsonKind::Null],
        },
        TypeRule {
            file: "memories.json",
            at: "[]",
            field: "project_memories",
            allowed: &[JsonKind::Object],
        },
        TypeRule {
            file: "projects.json",
            at: "[]",
            field: "docs",
            allowed: &[JsonKind::Array],
        },
        TypeRule {
            file: "projects.json",
            at: "[]",
            field: "is_starter_project",
            allowed: &[JsonKind::Bool],
        },
    ],
    selectors: &[],
};

pub const GEMINI_V1: SchemaFingerprint = SchemaFingerprint {
    provider: Provider::Gemini,
    version: "1.0",
    required_files: &[],
    known_files: &[],
    fields: &[],
    discriminators: &[],
    types: &[],
    selectors: &[".user-query-container", "message-content", ".markdown-main-panel"],
};

// ---------------------------------------------------------------------------
// Mismatch report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct FieldDrift {
    pub file: String,
    pub at: String,
    pub field: String,
    /// Number of records showing the drift.
    pub occurrences: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct ValueDrift {
    pub file: String,
    pub at: String,
    pub value: String,
    pub occurrences: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct TypeDrift {
    pub file: String,
    pub at: String,
    pub field: String,
    /// Kind actually found, e.g. `"null"`.
    pub found: String,
    pub occurrences: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct SelectorDrift {
    pub document: String,
    pub selector: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MismatchReport {
    /// `"<provider> <version>"` of the fingerprint compared against.
    pub fingerprint: Option<String>,
    pub missing_files: Vec<String>,
    pub unexpected_files: Vec<String>,
    pub unreadable_files: Vec<String>,
    pub missing_fields: Vec<FieldDrift>,
    pub unexpected_fields: Vec<FieldDrift>,
    pub mistyped_fields: Vec<TypeDrift>,
    pub unexpected_values: Vec<ValueDrift>,
    pub missing_selectors: Vec<SelectorDrift>,
}

impl MismatchReport {
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn len(&self) -> usize {
        self.missing_files.len()
            + self.unexpected_files.len()
            + self.unreadable_files.len()
            + self.missing_fields.len()
            + self.unexpected_fields.len()
            + self.mistyped_fields.len()
            + self.unexpected_values.len()
            + self.missing_selectors.len()
    }

    /// One human-readable line per drift item, in report order.
    pub fn warnings(&self) -> Vec<String> {
        let mut out = Vec::with_capacity(self.len());
        for f in &self.missing_files {
            out.push(format!("missing file {f}"));
        }
        for f in &self.unexpected_files {
            out.push(format!("unexpected file {f}"));
        }
        for f in &self.unreadable_files {
            out.push(format!("unreadable file {f}"));
        }
        for d in &self.missing_fields {
            out.push(format!(
                "{} {}: missing key {:?} in {} record(s)",
                d.file, d.at, d.field, d.occurrences
            ));
        }
        for d in &self.unexpected_fields {
            out.push(format!(
                "{} {}: new key {:?} in {} record(s)",
                d.file, d.at, d.field, d.occurrences
            ));
        }
        for d in &self.mistyped_fields {
            out.push(format!(
                "{} {}: key {:?} holds {} in {} record(s)",
                d.file, d.at, d.field, d.found, d.occurrences
            ));
        }
        for d in &self.unexpected_values {
            out.push(format!(
                "{} {}: unexpected value {:?} ({}x)",
                d.file, d.at, d.value, d.occurrences
            ));
        }
        for d in &self.missing_selectors {
            out.push(format!("{}: selector {:?} matched nothing", d.document, d.selector));
        }
        out
    }

    fn sort(&mut self) {
        self.missing_files.sort();
        self.unexpected_files.sort();
        self.unreadable_files.sort();
        self.missing_fields.sort();
        self.unexpected_fields.sort();
        self.mistyped_fields.sort();
        self.unexpected_values.sort();
        self.missing_selectors.sort();
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct FingerprintRegistry {
    fingerprints: HashMap<Provider, SchemaFingerprint>,
}

impl FingerprintRegistry {
    /// Registry with no fingerprints; every check passes.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register(CHATGPT_V1);
        registry.register(CLAUDE_V1);
        registry.register(GEMINI_V1);
        registry
    }

    /// Register a fingerprint, replacing any previous one for the provider.
    pub fn register(&mut self, fingerprint: SchemaFingerprint) {
        self.fingerprints.insert(fingerprint.provider, fingerprint);
    }

    pub fn get(&self, provider: Provider) -> Option<&SchemaFingerprint> {
        self.fingerprints.get(&provider)
    }

    /// Registered fingerprints in provider order.
    pub fn all(&self) -> Vec<&SchemaFingerprint> {
        let mut all: Vec<_> = self.fingerprints.values().collect();
        all.sort_by_key(|f| f.provider);
        all
    }

    pub fn check(&self, provider: Provider, raw: &RawExport) -> MismatchReport {
        match self.get(provider) {
            Some(fingerprint) => compare(fingerprint, raw),
            None => {
                debug!("no fingerprint registered for {provider}");
                MismatchReport::default()
            }
        }
    }
}

fn compare(fp: &SchemaFingerprint, raw: &RawExport) -> MismatchReport {
    let mut report = MismatchReport {
        fingerprint: Some(fp.label()),
        ..Default::default()
    };

    for &file in fp.required_files {
        if !raw.json.contains_key(file) && !raw.unreadable.iter().any(|u| u == file) {
            report.missing_files.push(file.to_string());
        }
    }
    report.unreadable_files = raw.unreadable.clone();
    if !fp.required_files.is_empty() || !fp.known_files.is_empty() {
        report.unexpected_files = raw
            .json
            .keys()
            .filter(|name| !fp.is_known_file(name))
            .cloned()
            .collect();
    }

    for rule in fp.fields {
        let Some(root) = raw.json.get(rule.file) else {
            continue;
        };
        check_fields(rule, root, &mut report);
    }

    for rule in fp.types {
        let Some(root) = raw.json.get(rule.file) else {
            continue;
        };
        check_type(rule, root, &mut report);
    }

    for rule in fp.discriminators {
        let Some(root) = raw.json.get(rule.file) else {
            continue;
        };
        let mut unexpected: BTreeMap<String, usize> = BTreeMap::new();
        for value in select(root, rule.at) {
            if let Some(s) = value.as_str()
                && !rule.allowed.contains(&s)
            {
                *unexpected.entry(s.to_string()).or_default() += 1;
            }
        }
        report
            .unexpected_values
            .extend(unexpected.into_iter().map(|(value, occurrences)| ValueDrift {
                file: rule.file.to_string(),
                at: rule.at.to_string(),
                value,
                occurrences,
            }));
    }

    if !fp.selectors.is_empty() {
        for doc in &raw.documents {
            let html = Html::parse_document(&doc.html);
            for &css in fp.selectors {
                let Ok(selector) = Selector::parse(css) else {
                    debug!("skipping unparseable selector {css:?}");
                    continue;
                };
                if html.select(&selector).next().is_none() {
                    report.missing_selectors.push(SelectorDrift {
                        document: doc.name.clone(),
                        selector: css.to_string(),
                    });
                }
            }
        }
    }

    report.sort();
    report
}

fn check_fields(rule: &FieldRule, root: &Value, report: &mut MismatchReport) {
    let mut missing: BTreeMap<&str, usize> = BTreeMap::new();
    let mut unexpected: BTreeMap<String, usize> = BTreeMap::new();

    for record in select(root, rule.at) {
        let Some(obj) = record.as_object() else {
            continue;
        };
        for &key in rule.required {
            if !obj.contains_key(key) {
                *missing.entry(key).or_default() += 1;
            }
        }
        for key in obj.keys() {
            let key = key.as_str();
            if !rule.required.contains(&key) && !rule.known.contains(&key) {
                *unexpected.entry(key.to_string()).or_default() += 1;
            }
        }
    }

    let drift = |field: String, occurrences: usize| FieldDrift {
        file: rule.file.to_string(),
        at: rule.at.to_string(),
        field,
        occurrences,
    };
    report
        .missing_fields
        .extend(missing.into_iter().map(|(k, n)| drift(k.to_string(), n)));
    report
        .unexpected_fields
        .extend(unexpected.into_iter().map(|(k, n)| drift(k, n)));
}

fn check_type(rule: &TypeRule, root: &Value, report: &mut MismatchReport) {
    let mut found: BTreeMap<&'static str, usize> = BTreeMap::new();
    for record in select(root, rule.at) {
        if let Some(value) = record.get(rule.field) {
            let kind = JsonKind::of(value);
            if !rule.allowed.contains(&kind) {
                *found.entry(kind.name()).or_default() += 1;
            }
        }
    }
    report
        .mistyped_fields
        .extend(found.into_iter().map(|(kind, occurrences)| TypeDrift {
            file: rule.file.to_string(),
            at: rule.at.to_string(),
            field: rule.field.to_string(),
            found: kind.to_string(),
            occurrences,
        }));
}

/// Evaluate a record path against `root`. Missing keys and `null` values
/// drop out of the selection.
pub fn select<'a>(root: &'a Value, path: &str) -> Vec<&'a Value> {
    let mut current = vec![root];
    for segment in path.split('.').filter(|s| !s.is_empty()) {
        let (name, iterate) = if let Some(name) = segment.strip_suffix("[]") {
            (name, Some('['))
        } else if let Some(name) = segment.strip_suffix("{}") {
            (name, Some('{'))
        } else {
            (segment, None)
        };

        let mut next = Vec::new();
        for value in current {
            let value = if name.is_empty() {
                value
            } else {
                match value.get(name) {
                    Some(Value::Null) | None => continue,
                    Some(v) => v,
                }
            };
            match (iterate, value) {
                (Some('['), Value::Array(items)) => next.extend(items.iter()),
                (Some('{'), Value::Object(map)) => next.extend(map.values()),
                (Some('{'), _) => {}
                (_, v) => next.push(v),
            }
        }
        current = next;
    }
    current
}
