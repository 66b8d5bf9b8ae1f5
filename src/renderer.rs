//! Markdown rendering: YAML frontmatter followed by one section per message.
//!
//! Text blocks pass through an optional [`TextTransform`] chain before
//! whitespace is normalized. Code, tool and asset blocks are emitted as-is.

use std::io::{self, Write};
use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde::Serialize;

use crate::model::{
    AssetRef, AssetState, ContentBlock, ConversationKind, NormalizedConversation,
    NormalizedMessage, Provider, Role,
};

#[derive(Serialize)]
struct Frontmatter<'a> {
    title: &'a str,
    id: &'a str,
    provider: Provider,
    kind: ConversationKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    created: Option<String>,
    messages: usize,
    #[serde(skip_serializing_if = "is_zero")]
    unresolved_assets: usize,
    tags: Vec<String>,
}

fn is_zero(n: &usize) -> bool {
    *n == 0
}

/// A pure rewrite applied to prose before it is written.
pub trait TextTransform: Send + Sync {
    fn apply(&self, text: &str) -> String;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoTransform;

impl TextTransform for NoTransform {
    fn apply(&self, text: &str) -> String {
        text.to_string()
    }
}

/// Removes pictographic emoji and the joiners that glue them together.
#[derive(Debug, Clone, Copy, Default)]
pub struct StripEmoji;

fn is_emoji(c: char) -> bool {
    matches!(c as u32,
        0x1F600..=0x1F64F
        | 0x1F300..=0x1F5FF
        | 0x1F680..=0x1F6FF
        | 0x1F1E0..=0x1F1FF
        | 0x1F900..=0x1F9FF
        | 0x1FA00..=0x1FAFF
        | 0x1F004..=0x1F0CF
        | 0x2600..=0x26FF
        | 0x2700..=0x27BF
        | 0xFE0F
        | 0x200D)
}

impl TextTransform for StripEmoji {
    fn apply(&self, text: &str) -> String {
        text.chars().filter(|c| !is_emoji(*c)).collect()
    }
}

/// Rewrites common Unicode math symbols as inline LaTeX.
#[derive(Debug, Clone, Copy, Default)]
pub struct LatexSymbols;

const LATEX_SYMBOLS: &[(char, &str)] = &[
    ('∑', r"\sum"),
    ('∏', r"\prod"),
    ('∫', r"\int"),
    ('∮', r"\oint"),
    ('α', r"\alpha"),
    ('β', r"\beta"),
    ('γ', r"\gamma"),
    ('δ', r"\delta"),
    ('ε', r"\epsilon"),
    ('θ', r"\theta"),
    ('λ', r"\lambda"),
    ('μ', r"\mu"),
    ('π', r"\pi"),
    ('σ', r"\sigma"),
    ('τ', r"\tau"),
    ('φ', r"\phi"),
    ('ω', r"\omega"),
    ('Δ', r"\Delta"),
    ('Σ', r"\Sigma"),
    ('Ω', r"\Omega"),
    ('±', r"\pm"),
    ('×', r"\times"),
    ('÷', r"\div"),
    ('√', r"\sqrt{}"),
    ('∞', r"\infty"),
    ('∂', r"\partial"),
    ('∇', r"\nabla"),
    ('≈', r"\approx"),
    ('≠', r"\neq"),
    ('≤', r"\leq"),
    ('≥', r"\geq"),
    ('≡', r"\equiv"),
    ('∈', r"\in"),
    ('∉', r"\notin"),
    ('⊂', r"\subset"),
    ('⊆', r"\subseteq"),
    ('∪', r"\cup"),
    ('∩', r"\cap"),
    ('∅', r"\emptyset"),
    ('∀', r"\forall"),
    ('∃', r"\exists"),
    ('→', r"\rightarrow"),
    ('←', r"\leftarrow"),
    ('⇒', r"\Rightarrow"),
    ('⇔', r"\Leftrightarrow"),
    ('ℝ', r"\mathbb{R}"),
    ('ℕ', r"\mathbb{N}"),
    ('ℤ', r"\mathbb{Z}"),
];

impl TextTransform for LatexSymbols {
    fn apply(&self, text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        for c in text.chars() {
            match LATEX_SYMBOLS.iter().find(|(symbol, _)| *symbol == c) {
                Some((_, latex)) => {
                    out.push('$');
                    out.push_str(latex);
                    out.push('$');
                }
                None => out.push(c),
            }
        }
        out
    }
}

/// Rewrites `<sub>`/`<sup>` markup and Unicode sub/superscript runs as inline
/// LaTeX, so `x²` becomes `$x^{2}$`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Scripts;

const SUBSCRIPTS: &[(char, char)] = &[
    ('₀', '0'),
    ('₁', '1'),
    ('₂', '2'),
    ('₃', '3'),
    ('₄', '4'),
    ('₅', '5'),
    ('₆', '6'),
    ('₇', '7'),
    ('₈', '8'),
    ('₉', '9'),
    ('ₐ', 'a'),
    ('ₑ', 'e'),
    ('ₕ', 'h'),
    ('ᵢ', 'i'),
    ('ⱼ', 'j'),
    ('ₖ', 'k'),
    ('ₗ', 'l'),
    ('ₘ', 'm'),
    ('ₙ', 'n'),
    ('ₒ', 'o'),
    ('ₚ', 'p'),
    ('ᵣ', 'r'),
    ('ₛ', 's'),
    ('ₜ', 't'),
    ('ᵤ', 'u'),
    ('ᵥ', 'v'),
    ('ₓ', 'x'),
];

const SUPERSCRIPTS: &[(char, char)] = &[
    ('⁰', '0'),
    ('¹', '1'),
    ('²', '2'),
    ('³', '3'),
    ('⁴', '4'),
    ('⁵', '5'),
    ('⁶', '6'),
    ('⁷', '7'),
    ('⁸', '8'),
    ('⁹', '9'),
    ('ⁿ', 'n'),
    ('ⁱ', 'i'),
];

fn sub_tag_re() -> &'static Regex {
    static SUB_TAG_RE: OnceLock<Regex> = OnceLock::new();
    SUB_TAG_RE.get_or_init(|| Regex::new(r"(?i)<sub>([^<]+)</sub>").expect("valid sub tag regex"))
}

fn sup_tag_re() -> &'static Regex {
    static SUP_TAG_RE: OnceLock<Regex> = OnceLock::new();
    SUP_TAG_RE.get_or_init(|| Regex::new(r"(?i)<sup>([^<]+)</sup>").expect("valid sup tag regex"))
}

/// Replace each run of script characters, together with one alphanumeric
/// base right before it, by `$base<marker>{run}$`.
fn script_runs(text: &str, table: &[(char, char)], marker: char) -> String {
    let plain = |c: char| table.iter().find(|(script, _)| *script == c).map(|(_, p)| *p);
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        let Some(first) = plain(c) else {
            out.push(c);
            continue;
        };
        let mut run = String::from(first);
        while let Some(next) = chars.peek().copied().and_then(plain) {
            run.push(next);
            chars.next();
        }
        let base = match out.chars().last() {
            Some(b) if b.is_ascii_alphanumeric() => {
                out.pop();
                b.to_string()
            }
            _ => String::new(),
        };
        out.push_str(&format!("${base}{marker}{{{run}}}$"));
    }
    out
}

impl TextTransform for Scripts {
    fn apply(&self, text: &str) -> String {
        let text = sub_tag_re().replace_all(text, |caps: &Captures| format!("$_{{{}}}$", &caps[1]));
        let text = sup_tag_re().replace_all(&text, |caps: &Captures| format!("$^{{{}}}$", &caps[1]));
        let text = script_runs(&text, SUBSCRIPTS, '_');
        script_runs(&text, SUPERSCRIPTS, '^')
    }
}

/// Turns fenced blocks that hold nothing but `a → b` mappings into inline
/// code on either side of a LaTeX arrow.
#[derive(Debug, Clone, Copy, Default)]
pub struct CodeArrows;

fn arrow_block_re() -> &'static Regex {
    static ARROW_BLOCK_RE: OnceLock<Regex> = OnceLock::new();
    ARROW_BLOCK_RE.get_or_init(|| {
        Regex::new(r"```\w*\n((?:[^\n`]+?[ \t]*(?:\$\\rightarrow\$|→)[ \t]*[^\n`]+?\n)+)```")
            .expect("valid arrow block regex")
    })
}

fn arrow_line_re() -> &'static Regex {
    static ARROW_LINE_RE: OnceLock<Regex> = OnceLock::new();
    ARROW_LINE_RE.get_or_init(|| {
        Regex::new(r"^(.+?)\s*(?:\$\\rightarrow\$|→)\s*(.+)$").expect("valid arrow line regex")
    })
}

impl TextTransform for CodeArrows {
    fn apply(&self, text: &str) -> String {
        arrow_block_re()
            .replace_all(text, |caps: &Captures| {
                caps[1]
                    .trim()
                    .lines()
                    .map(|line| match arrow_line_re().captures(line) {
                        Some(m) => format!("`{}` $\\rightarrow$ `{}`", m[1].trim(), m[2].trim()),
                        None => line.to_string(),
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .into_owned()
    }
}

/// Drops horizontal rules (`---` alone on a line).
#[derive(Debug, Clone, Copy, Default)]
pub struct DropRules;

impl TextTransform for DropRules {
    fn apply(&self, text: &str) -> String {
        text.split('\n')
            .filter(|line| line.trim() != "---")
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Applies transforms in order.
#[derive(Default)]
pub struct TransformChain(pub Vec<Box<dyn TextTransform>>);

impl TextTransform for TransformChain {
    fn apply(&self, text: &str) -> String {
        self.0
            .iter()
            .fold(text.to_string(), |acc, t| t.apply(&acc))
    }
}

/// Collapse runs of three or more newlines to a single blank line and drop
/// trailing spaces.
pub fn normalize_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut newlines = 0;
    for line in text.split('\n') {
        let line = line.trim_end();
        if !out.is_empty() || newlines > 0 {
            if line.is_empty() {
                newlines += 1;
                continue;
            }
            out.push_str(if newlines > 0 { "\n\n" } else { "\n" });
        }
        newlines = 0;
        out.push_str(line);
    }
    out
}

#[derive(Debug, Clone, Default)]
pub struct RenderOptions {
    /// Extra tags appended after the provider and kind tags.
    pub tags: Vec<String>,
    /// Render user prose as a blockquote.
    pub quote_user: bool,
}

fn kind_tag(kind: ConversationKind) -> Option<&'static str> {
    match kind {
        ConversationKind::Conversation => None,
        ConversationKind::Memory => Some("chat_memory"),
        ConversationKind::Project => Some("chat_project"),
    }
}

pub fn render_conversation<W: Write>(
    writer: &mut W,
    conv: &NormalizedConversation,
    options: &RenderOptions,
    transform: &dyn TextTransform,
) -> io::Result<()> {
    let mut tags = vec![conv.provider.tag().to_string()];
    tags.extend(kind_tag(conv.kind).map(str::to_owned));
    for tag in &options.tags {
        if !tags.contains(tag) {
            tags.push(tag.clone());
        }
    }

    let fm = Frontmatter {
        title: &conv.title,
        id: &conv.id,
        provider: conv.provider,
        kind: conv.kind,
        created: conv
            .created_at
            .map(|t| t.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)),
        messages: conv.messages.len(),
        unresolved_assets: unresolved_count(conv),
        tags,
    };

    writeln!(writer, "---")?;
    let yaml = serde_yaml::to_string(&fm).map_err(io::Error::other)?;
    write!(writer, "{}", yaml)?;
    writeln!(writer, "---")?;

    for message in &conv.messages {
        writeln!(writer)?;
        write_message(writer, conv, message, options, transform)?;
    }
    Ok(())
}

pub fn render_to_string(
    conv: &NormalizedConversation,
    options: &RenderOptions,
    transform: &dyn TextTransform,
) -> io::Result<String> {
    let mut buf = Vec::new();
    render_conversation(&mut buf, conv, options, transform)?;
    String::from_utf8(buf).map_err(io::Error::other)
}

/// Asset references not resolved by render time, pending ones included.
fn unresolved_count(conv: &NormalizedConversation) -> usize {
    let mut placeholders: Vec<&str> = conv
        .asset_refs()
        .filter(|a| !asset_state(conv, a).is_resolved())
        .map(|a| a.placeholder.as_str())
        .collect();
    placeholders.sort_unstable();
    placeholders.dedup();
    placeholders.len()
}

fn asset_state<'a>(conv: &'a NormalizedConversation, asset: &'a AssetRef) -> &'a AssetState {
    conv.assets.get(&asset.placeholder).unwrap_or(&asset.state)
}

fn write_message<W: Write>(
    writer: &mut W,
    conv: &NormalizedConversation,
    message: &NormalizedMessage,
    options: &RenderOptions,
    transform: &dyn TextTransform,
) -> io::Result<()> {
    let heading = message.title.as_deref().unwrap_or(message.role.label());
    writeln!(writer, "## {}", heading)?;
    writeln!(writer)?;

    let quote = options.quote_user && message.role == Role::User;
    let parts: Vec<String> = message
        .blocks
        .iter()
        .map(|block| render_block(conv, block, quote, transform))
        .filter(|s| !s.is_empty())
        .collect();
    let body = parts.join("\n\n");

    if message.role == Role::Thinking && message.title.is_none() {
        writeln!(writer, "<details>")?;
        writeln!(writer, "<summary>Thinking</summary>")?;
        writeln!(writer)?;
        writeln!(writer, "{}", body)?;
        writeln!(writer)?;
        writeln!(writer, "</details>")?;
    } else {
        writeln!(writer, "{}", body)?;
    }
    Ok(())
}

fn render_block(
    conv: &NormalizedConversation,
    block: &ContentBlock,
    quote: bool,
    transform: &dyn TextTransform,
) -> String {
    match block {
        ContentBlock::Text(text) => {
            let text = normalize_whitespace(&transform.apply(text));
            if quote { blockquote(&text) } else { text }
        }
        ContentBlock::Code {
            language,
            code,
            caption,
        } => {
            let fenced = fence(language.as_deref().unwrap_or_default(), code);
            match caption {
                Some(caption) => format!("**{}**\n{}", caption, fenced),
                None => fenced,
            }
        }
        ContentBlock::Asset(asset) => match asset_state(conv, asset) {
            AssetState::Resolved(resolved) => resolved.token.clone(),
            AssetState::Unresolved { reason } => {
                format!("*[unresolved image {}: {}]*", asset.placeholder, reason)
            }
            AssetState::Pending => {
                format!("*[unresolved image {}: not resolved]*", asset.placeholder)
            }
        },
        ContentBlock::ToolInvocation { name, input } => {
            if input.trim().is_empty() {
                format!("`{}`", name)
            } else {
                format!("`{}`\n{}", name, fence(guess_input_language(input), input))
            }
        }
        ContentBlock::ToolOutput {
            name,
            content,
            is_error,
        } => {
            let label = match (name, is_error) {
                (Some(name), true) => format!("`{}` (error)\n", name),
                (Some(name), false) => format!("`{}`\n", name),
                (None, true) => "(error)\n".to_string(),
                (None, false) => String::new(),
            };
            format!("{}{}", label, fence("", content))
        }
    }
}

fn guess_input_language(input: &str) -> &'static str {
    let trimmed = input.trim_start();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        "json"
    } else {
        ""
    }
}

/// Fence `code`, lengthening the fence past any backtick run inside it.
fn fence(language: &str, code: &str) -> String {
    let longest = code
        .split(|c: char| c != '`')
        .map(str::len)
        .max()
        .unwrap_or(0);
    let ticks = "`".repeat(longest.max(2) + 1);
    format!("{ticks}{language}\n{}\n{ticks}", code.trim_end_matches('\n'))
}

fn blockquote(text: &str) -> String {
    text.lines()
        .map(|line| {
            if line.trim().is_empty() {
                ">".to_string()
            } else {
                format!("> {}", line)
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ResolvedAsset, placeholder_for};
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;

    fn asset(ordinal: usize, state: AssetState) -> ContentBlock {
        ContentBlock::Asset(AssetRef {
            placeholder: placeholder_for(ordinal),
            ordinal,
            source: crate::model::AssetSource::Remote(format!("https://x/{ordinal}")),
            alt: None,
            state,
        })
    }

    fn sample() -> NormalizedConversation {
        let mut conv =
            NormalizedConversation::new("c-1", "Sample", Provider::Claude, ConversationKind::Conversation);
        conv.created_at = chrono::Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).single();
        conv.push_message(NormalizedMessage::new(
            Role::User,
            vec![ContentBlock::text("Hello\n\n\n\nthere")],
        ));
        conv.push_message(NormalizedMessage::new(
            Role::Thinking,
            vec![ContentBlock::text("pondering")],
        ));
        conv.push_message(NormalizedMessage::new(
            Role::Assistant,
            vec![
                ContentBlock::text("Look:"),
                asset(
                    1,
                    AssetState::Resolved(ResolvedAsset {
                        filename: "c_img01.png".into(),
                        path: PathBuf::from("c_img01.png"),
                        token: "![[c_img01.png]]".into(),
                    }),
                ),
                asset(
                    2,
                    AssetState::Unresolved {
                        reason: "http status 404: 404 Not Found".into(),
                    },
                ),
                ContentBlock::Code {
                    language: Some("rust".into()),
                    code: "fn main() {}\n".into(),
                    caption: None,
                },
            ],
        ));
        conv
    }

    #[test]
    fn renders_frontmatter_and_body() {
        let options = RenderOptions {
            tags: vec!["ai".into(), "claude".into()],
            quote_user: true,
        };
        let out = render_to_string(&sample(), &options, &NoTransform).unwrap();
        let (frontmatter, body) = out
            .strip_prefix("---\n")
            .and_then(|rest| rest.split_once("---\n"))
            .unwrap();

        assert!(frontmatter.starts_with("title: Sample\nid: c-1\nprovider: claude\nkind: conversation\n"));
        assert!(frontmatter.contains("2025-01-02T03:04:05Z"));
        assert!(frontmatter.contains("messages: 3\n"));
        assert!(frontmatter.contains("unresolved_assets: 1\n"));
        assert!(frontmatter.ends_with("tags:\n- claude\n- ai\n"));

        let expected = "
## User

> Hello
>
> there

## Thinking

<details>
<summary>Thinking</summary>

pondering

</details>

## Assistant

Look:

![[c_img01.png]]

*[unresolved image asset-002: http status 404: 404 Not Found]*

```rust
fn main() {}
```
";
        assert_eq!(body, expected);
    }

    #[test]
    fn every_role_has_a_distinct_heading() {
        let mut labels: Vec<_> = Role::ALL.iter().map(|r| r.label()).collect();
        labels.sort_unstable();
        labels.dedup();
        assert_eq!(labels.len(), Role::ALL.len());
    }

    #[test]
    fn pending_assets_render_as_unresolved() {
        let mut conv =
            NormalizedConversation::new("p", "P", Provider::Gemini, ConversationKind::Conversation);
        conv.push_message(NormalizedMessage::new(
            Role::Assistant,
            vec![asset(1, AssetState::Pending)],
        ));
        let out = render_to_string(&conv, &RenderOptions::default(), &NoTransform).unwrap();
        assert!(out.contains("unresolved_assets: 1"));
        assert!(out.contains("*[unresolved image asset-001: not resolved]*"));
    }

    #[test]
    fn fences_grow_past_inner_backticks() {
        assert_eq!(fence("md", "```\nx\n```"), "````md\n```\nx\n```\n````");
    }

    #[test]
    fn transforms() {
        assert_eq!(StripEmoji.apply("ok 👍 done ✅"), "ok  done ");
        assert_eq!(LatexSymbols.apply("x ≤ π"), "x $\\leq$ $\\pi$");
        let chain = TransformChain(vec![Box::new(StripEmoji), Box::new(LatexSymbols)]);
        assert_eq!(chain.apply("α🙂"), "$\\alpha$");
        assert_eq!(normalize_whitespace("a  \n\n\n\nb\n"), "a\n\nb");
    }

    #[test]
    fn scripts_become_latex() {
        assert_eq!(
            Scripts.apply("H₂O and x² plus <sub>i</sub> and <SUP>n</SUP>, alone ³"),
            "$H_{2}$O and $x^{2}$ plus $_{i}$ and $^{n}$, alone $^{3}$"
        );
        assert_eq!(Scripts.apply("aᵢⱼ"), "$a_{ij}$");
    }

    #[test]
    fn arrow_only_code_blocks_are_inlined() {
        let text = "Types:\n```swift\n__CLPK_integer → Int32\nFloat $\\rightarrow$ f32\n```\nDone.";
        assert_eq!(
            CodeArrows.apply(text),
            "Types:\n`__CLPK_integer` $\\rightarrow$ `Int32`\n`Float` $\\rightarrow$ `f32`\nDone."
        );
        let code = "```rust\nlet x = 1;\n```";
        assert_eq!(CodeArrows.apply(code), code);
    }

    #[test]
    fn horizontal_rules_are_dropped() {
        assert_eq!(DropRules.apply("a\n---\nb\n - - -\n  ---  "), "a\nb\n - - -");
    }

    #[test]
    fn rendering_is_deterministic() {
        let options = RenderOptions::default();
        let a = render_to_string(&sample(), &options, &NoTransform).unwrap();
        let b = render_to_string(&sample(), &options, &NoTransform).unwrap();
        assert_eq!(a, b);
    }
}
