//! Gemini chat pages saved from the browser.
//!
//! Turns are `.user-query-container` and `message-content` elements in
//! document order. Responses are walked into Markdown text, code blocks and
//! image references. Pages carry no usable title, so the file stem is used.

use std::path::Path;

use ego_tree::NodeRef;
use scraper::node::Node;
use scraper::{ElementRef, Html, Selector};

use super::{AssetCollector, push_text};
use crate::assets::is_cdn_image;
use crate::model::{
    AssetSource, ContentBlock, ConversationKind, NormalizedConversation, NormalizedMessage,
    Provider, Role,
};
use crate::source::MarkupDocument;
use crate::utils::short_hash;

struct Selectors {
    turns: Option<Selector>,
    query_line: Option<Selector>,
    query_text: Option<Selector>,
    panel: Option<Selector>,
    code: Option<Selector>,
    decoration: Option<Selector>,
    row: Option<Selector>,
    cell: Option<Selector>,
}

impl Selectors {
    fn new() -> Self {
        Self {
            turns: Selector::parse(".user-query-container, message-content").ok(),
            query_line: Selector::parse(".query-text-line").ok(),
            query_text: Selector::parse(".query-text").ok(),
            panel: Selector::parse(".markdown-main-panel").ok(),
            code: Selector::parse("code").ok(),
            decoration: Selector::parse(".code-block-decoration").ok(),
            row: Selector::parse("tr").ok(),
            cell: Selector::parse("th, td").ok(),
        }
    }
}

fn is_user_turn(element: &ElementRef) -> bool {
    element
        .value()
        .classes()
        .any(|c| c == "user-query-container")
}

fn is_turn(element: &ElementRef) -> bool {
    is_user_turn(element) || element.value().name() == "message-content"
}

pub fn normalize(doc: &MarkupDocument) -> NormalizedConversation {
    let title = Path::new(&doc.name)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| "Untitled".to_string());
    let mut conv = NormalizedConversation::new(
        short_hash(doc.name.as_bytes()),
        title,
        Provider::Gemini,
        ConversationKind::Conversation,
    );

    let html = Html::parse_document(&doc.html);
    let selectors = Selectors::new();
    let Some(turns) = selectors.turns.as_ref() else {
        return conv;
    };

    let mut assets = AssetCollector::default();
    for turn in html.select(turns) {
        if turn.ancestors().filter_map(ElementRef::wrap).any(|a| is_turn(&a)) {
            continue;
        }
        let message = if is_user_turn(&turn) {
            NormalizedMessage::new(Role::User, vec![ContentBlock::text(user_text(turn, &selectors))])
        } else {
            let panel = selectors
                .panel
                .as_ref()
                .and_then(|sel| turn.select(sel).next())
                .unwrap_or(turn);
            let mut walker = Walker::new(&selectors, &mut assets);
            walker.visit_children(panel);
            NormalizedMessage::new(Role::Assistant, walker.finish())
        };
        conv.push_message(message);
    }
    conv
}

fn user_text(turn: ElementRef, selectors: &Selectors) -> String {
    if let Some(sel) = &selectors.query_line {
        let lines: Vec<String> = turn
            .select(sel)
            .map(|line| collapse(&line.text().collect::<String>()))
            .collect();
        if !lines.is_empty() {
            return lines.join("\n");
        }
    }
    let container = selectors
        .query_text
        .as_ref()
        .and_then(|sel| turn.select(sel).next())
        .unwrap_or(turn);
    collapse(&container.text().collect::<String>())
}

/// Collapse whitespace runs to single spaces and trim.
fn collapse(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Walks a response subtree, accumulating Markdown text and splitting out
/// code blocks and image references as separate blocks.
struct Walker<'a> {
    selectors: &'a Selectors,
    assets: &'a mut AssetCollector,
    blocks: Vec<ContentBlock>,
    buf: String,
    /// One entry per open list: `None` for bullets, `Some(n)` for the next number.
    lists: Vec<Option<usize>>,
}

impl<'a> Walker<'a> {
    fn new(selectors: &'a Selectors, assets: &'a mut AssetCollector) -> Self {
        Self {
            selectors,
            assets,
            blocks: Vec::new(),
            buf: String::new(),
            lists: Vec::new(),
        }
    }

    fn finish(mut self) -> Vec<ContentBlock> {
        self.flush();
        self.blocks
    }

    fn flush(&mut self) {
        let text: Vec<&str> = self.buf.lines().map(str::trim_end).collect();
        push_text(&mut self.blocks, text.join("\n").trim());
        self.buf.clear();
    }

    fn append_text(&mut self, text: &str) {
        let mut last_space = self.buf.is_empty() || self.buf.ends_with(char::is_whitespace);
        for c in text.chars() {
            if c.is_whitespace() {
                if !last_space {
                    self.buf.push(' ');
                    last_space = true;
                }
            } else {
                self.buf.push(c);
                last_space = false;
            }
        }
    }

    fn ensure_newline(&mut self) {
        while self.buf.ends_with(' ') {
            self.buf.pop();
        }
        if !self.buf.is_empty() && !self.buf.ends_with('\n') {
            self.buf.push('\n');
        }
    }

    fn ensure_blank_line(&mut self) {
        self.ensure_newline();
        if !self.buf.is_empty() && !self.buf.ends_with("\n\n") {
            self.buf.push('\n');
        }
    }

    fn visit_node(&mut self, node: NodeRef<'_, Node>) {
        match node.value() {
            Node::Text(text) => self.append_text(text),
            Node::Element(_) => {
                if let Some(element) = ElementRef::wrap(node) {
                    self.visit_element(element);
                }
            }
            _ => {
                for child in node.children() {
                    self.visit_node(child);
                }
            }
        }
    }

    fn visit_children(&mut self, element: ElementRef) {
        for child in element.children() {
            self.visit_node(child);
        }
    }

    fn visit_element(&mut self, element: ElementRef) {
        let tag = element.value().name().to_ascii_lowercase();
        match tag.as_str() {
            "script" | "style" | "noscript" | "template" | "svg" | "button" | "mat-icon" => {}
            "br" => self.ensure_newline(),
            "hr" => {
                self.ensure_blank_line();
                self.buf.push_str("---");
                self.ensure_blank_line();
            }
            "p" | "blockquote" => {
                self.ensure_blank_line();
                self.visit_children(element);
                self.ensure_blank_line();
            }
            "div" | "section" | "article" => {
                self.ensure_newline();
                self.visit_children(element);
                self.ensure_newline();
            }
            "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => {
                let level = tag[1..].parse::<usize>().unwrap_or(1);
                self.ensure_blank_line();
                self.buf.push_str(&"#".repeat(level));
                self.buf.push(' ');
                self.visit_children(element);
                self.ensure_blank_line();
            }
            "ul" | "ol" => {
                self.ensure_newline();
                self.lists.push((tag == "ol").then_some(1));
                self.visit_children(element);
                self.lists.pop();
                if self.lists.is_empty() {
                    self.ensure_blank_line();
                }
            }
            "li" => {
                self.ensure_newline();
                let depth = self.lists.len().saturating_sub(1);
                let marker = match self.lists.last_mut() {
                    Some(Some(n)) => {
                        let marker = format!("{n}. ");
                        *n += 1;
                        marker
                    }
                    _ => "- ".to_string(),
                };
                self.buf.push_str(&"  ".repeat(depth));
                self.buf.push_str(&marker);
                self.visit_children(element);
                self.ensure_newline();
            }
            "strong" | "b" => self.wrap_inline(element, "**"),
            "em" | "i" => self.wrap_inline(element, "*"),
            "code" => {
                let code: String = element.text().collect();
                if !code.is_empty() {
                    self.buf.push('`');
                    self.buf.push_str(&code);
                    self.buf.push('`');
                }
            }
            "a" => {
                let text = collapse(&element.text().collect::<String>());
                match element.value().attr("href").map(str::trim) {
                    Some(href) if href.starts_with("http://") || href.starts_with("https://") => {
                        let label = if text.is_empty() { href } else { text.as_str() };
                        self.buf.push_str(&format!("[{label}]({href})"));
                    }
                    _ => self.append_text(&text),
                }
            }
            "img" => self.image(element),
            "pre" => {
                let language = self
                    .selectors
                    .code
                    .as_ref()
                    .and_then(|sel| element.select(sel).next())
                    .and_then(|code| {
                        code.value()
                            .classes()
                            .find_map(|c| c.strip_prefix("language-"))
                            .map(str::to_owned)
                    });
                let code: String = element.text().collect();
                self.code_block(language, code);
            }
            "code-block" => self.gemini_code_block(element),
            "table" => self.table(element),
            _ => self.visit_children(element),
        }
    }

    fn wrap_inline(&mut self, element: ElementRef, marker: &str) {
        let inner = collapse(&element.text().collect::<String>());
        if inner.is_empty() {
            return;
        }
        self.buf.push_str(marker);
        self.buf.push_str(&inner);
        self.buf.push_str(marker);
    }

    fn code_block(&mut self, language: Option<String>, code: String) {
        let code = code.trim_end_matches('\n').to_string();
        if code.trim().is_empty() {
            return;
        }
        self.flush();
        self.blocks.push(ContentBlock::Code {
            language: language.filter(|l| !l.is_empty()),
            code,
            caption: None,
        });
    }

    /// `<code-block>`: language from its attribute or the decoration label,
    /// code from the inner `<code>`.
    fn gemini_code_block(&mut self, element: ElementRef) {
        let language = element
            .value()
            .attr("language")
            .map(str::to_owned)
            .or_else(|| {
                self.selectors
                    .decoration
                    .as_ref()
                    .and_then(|sel| element.select(sel).next())
                    .map(|d| collapse(&d.text().collect::<String>()).to_ascii_lowercase())
            })
            .map(|l| l.trim().to_ascii_lowercase());
        let code = self
            .selectors
            .code
            .as_ref()
            .and_then(|sel| element.select(sel).next())
            .map(|c| c.text().collect::<String>())
            .unwrap_or_default();
        self.code_block(language, code);
    }

    fn image(&mut self, element: ElementRef) {
        let Some(src) = element.value().attr("src").map(str::trim) else {
            return;
        };
        let alt = element
            .value()
            .attr("alt")
            .map(str::to_owned)
            .filter(|a| !a.trim().is_empty());
        let source = if src.starts_with("data:") {
            AssetSource::Inline(src.to_string())
        } else if is_cdn_image(src) {
            AssetSource::Remote(src.to_string())
        } else {
            self.buf
                .push_str(&format!("![{}]({src})", alt.as_deref().unwrap_or_default()));
            return;
        };
        self.flush();
        self.blocks.push(self.assets.block(source, alt));
    }

    fn table(&mut self, element: ElementRef) {
        let (Some(row_sel), Some(cell_sel)) = (&self.selectors.row, &self.selectors.cell) else {
            return;
        };
        let rows: Vec<Vec<String>> = element
            .select(row_sel)
            .map(|tr| {
                tr.select(cell_sel)
                    .map(|cell| collapse(&cell.text().collect::<String>()).replace('|', "\\|"))
                    .collect::<Vec<_>>()
            })
            .filter(|cells| !cells.is_empty())
            .collect();
        if rows.is_empty() {
            return;
        }

        self.ensure_blank_line();
        for (i, row) in rows.iter().enumerate() {
            self.buf.push_str(&format!("| {} |\n", row.join(" | ")));
            if i == 0 {
                self.buf.push_str(&format!("|{}\n", " --- |".repeat(row.len())));
            }
        }
        self.ensure_blank_line();
    }
}
