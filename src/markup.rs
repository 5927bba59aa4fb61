//! Rich markup to markdown normalization
//!
//! The primary path parses the markup into a small fragment tree and renders
//! markdown from it. Malformed input (stray `<`, mismatched or unclosed tags,
//! runaway nesting) makes the primary path fail, in which case the degraded
//! path strips presentation and framework attributes and keeps the rest.

use crate::tree::is_void_tag;
use crate::{ClimbError, Result};
use regex::{Captures, Regex};
use tracing::debug;

const MAX_DEPTH: usize = 256;

/// Elements dropped together with their content
const DROP_TAGS: &[&str] = &[
    "script", "style", "template", "noscript", "svg", "button", "mat-icon", "iframe",
];

/// Classes marking visually hidden helper nodes
const HIDDEN_CLASSES: &[&str] = &["sr-only", "cdk-visually-hidden", "visually-hidden"];

/// Class of the content container that is unwrapped as a block
const PASS_THROUGH_CLASS: &str = "markdown";

/// Invisible characters some renderers inject between nodes
const NOISE_CHARS: &[char] = &['\u{200B}', '\u{200C}', '\u{200D}', '\u{FEFF}'];

#[derive(Debug, Clone, PartialEq)]
enum Fragment {
    Element {
        tag: String,
        attrs: Vec<(String, String)>,
        children: Vec<Fragment>,
    },
    Text(String),
}

struct Open {
    tag: String,
    attrs: Vec<(String, String)>,
    children: Vec<Fragment>,
}

impl Open {
    fn close(self) -> Fragment {
        Fragment::Element {
            tag: self.tag,
            attrs: self.attrs,
            children: self.children,
        }
    }
}

/// Converts rich markup into normalized markdown. `normalize` never fails.
pub struct MarkupNormalizer {
    token_re: Regex,
    attr_re: Regex,
    stray_tag_re: Regex,
    entity_re: Regex,
    open_tag_re: Regex,
    stripped_attr_re: Regex,
    comment_re: Regex,
    blank_lines_re: Regex,
}

impl Default for MarkupNormalizer {
    fn default() -> Self {
        Self::new()
    }
}

impl MarkupNormalizer {
    pub fn new() -> Self {
        Self {
            token_re: Regex::new(
                r#"(?s)<!--.*?-->|<![^>]*>|<(/?)([A-Za-z][A-Za-z0-9:-]*)((?:\s+[^\s"'>/=]+(?:\s*=\s*(?:"[^"]*"|'[^']*'|[^\s"'>]+))?)*)\s*(/?)>"#,
            )
            .unwrap(),
            attr_re: Regex::new(
                r#"([^\s"'>/=]+)(?:\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'>]+)))?"#,
            )
            .unwrap(),
            stray_tag_re: Regex::new(r"<[A-Za-z/!]").unwrap(),
            entity_re: Regex::new(r"&(#[xX][0-9a-fA-F]+|#[0-9]+|[A-Za-z]+);").unwrap(),
            open_tag_re: Regex::new(r#"<([A-Za-z][A-Za-z0-9:-]*)((?:"[^"]*"|'[^']*'|[^"'>])*)>"#)
                .unwrap(),
            stripped_attr_re: Regex::new(
                r"(?i)^(?:style|class|id|data-.*|aria-.*|_ng.*|ng-.*|jsaction|jscontroller|jsname|jslog)$",
            )
            .unwrap(),
            comment_re: Regex::new(r"(?s)<!--.*?-->").unwrap(),
            blank_lines_re: Regex::new(r"\n{3,}").unwrap(),
        }
    }

    /// Convert markup to markdown, degrading to attribute stripping when the
    /// markup cannot be converted.
    pub fn normalize(&self, raw: &str) -> String {
        match self.convert(raw) {
            Ok(markdown) => markdown,
            Err(e) => {
                debug!("Markup conversion failed, using degraded transform: {}", e);
                self.degrade(raw)
            }
        }
    }

    /// The primary conversion path.
    pub fn convert(&self, raw: &str) -> Result<String> {
        let fragments = self.parse(raw)?;
        let rendered = render_nodes(&fragments);
        Ok(self.tidy(&rendered))
    }

    /// The safety net: strip presentation and framework attributes and
    /// comments, keep the remaining markup as is.
    pub fn degrade(&self, raw: &str) -> String {
        let without_comments = self.comment_re.replace_all(raw, "");
        let stripped = self
            .open_tag_re
            .replace_all(&without_comments, |caps: &Captures| {
                self.rebuild_open_tag(&caps[1], &caps[2])
            });
        stripped.trim().to_string()
    }

    /// Open tag `name` with only the attributes the degraded path keeps.
    /// Attribute values are copied verbatim.
    fn rebuild_open_tag(&self, name: &str, attrs: &str) -> String {
        let mut tag = format!("<{}", name);
        for caps in self.attr_re.captures_iter(attrs) {
            if self.stripped_attr_re.is_match(&caps[1]) {
                continue;
            }
            tag.push(' ');
            tag.push_str(&caps[0]);
        }
        if attrs.trim_end().ends_with('/') {
            tag.push_str(" /");
        }
        tag.push('>');
        tag
    }

    fn parse(&self, raw: &str) -> Result<Vec<Fragment>> {
        let mut stack = vec![Open {
            tag: String::new(),
            attrs: Vec::new(),
            children: Vec::new(),
        }];
        let mut last = 0;

        for caps in self.token_re.captures_iter(raw) {
            let Some(token) = caps.get(0) else {
                continue;
            };
            self.push_text(&mut stack, &raw[last..token.start()])?;
            last = token.end();

            // Comments and doctype-like declarations carry no content
            let Some(tag) = caps.get(2) else {
                continue;
            };
            let tag = tag.as_str().to_ascii_lowercase();
            let closing = caps.get(1).is_some_and(|m| !m.as_str().is_empty());
            let self_closing = caps.get(4).is_some_and(|m| !m.as_str().is_empty());

            if closing {
                if is_void_tag(&tag) {
                    continue;
                }
                let position = stack
                    .iter()
                    .rposition(|open| open.tag == tag)
                    .filter(|p| *p > 0)
                    .ok_or_else(|| ClimbError::Markup(format!("unexpected </{}>", tag)))?;
                while stack.len() > position {
                    let Some(open) = stack.pop() else { break };
                    if let Some(parent) = stack.last_mut() {
                        parent.children.push(open.close());
                    }
                }
                continue;
            }

            let attrs = self.parse_attrs(caps.get(3).map(|m| m.as_str()).unwrap_or(""));
            if is_void_tag(&tag) || self_closing {
                if let Some(parent) = stack.last_mut() {
                    parent.children.push(Fragment::Element {
                        tag,
                        attrs,
                        children: Vec::new(),
                    });
                }
                continue;
            }
            if stack.len() > MAX_DEPTH {
                return Err(ClimbError::Markup("nesting too deep".to_string()));
            }
            stack.push(Open {
                tag,
                attrs,
                children: Vec::new(),
            });
        }
        self.push_text(&mut stack, &raw[last..])?;

        if stack.len() > 1 {
            let unclosed = stack.last().map(|o| o.tag.clone()).unwrap_or_default();
            return Err(ClimbError::Markup(format!("unclosed <{}>", unclosed)));
        }
        Ok(stack.pop().map(|root| root.children).unwrap_or_default())
    }

    fn push_text(&self, stack: &mut [Open], text: &str) -> Result<()> {
        if text.is_empty() {
            return Ok(());
        }
        if self.stray_tag_re.is_match(text) {
            return Err(ClimbError::Markup("stray '<' in text".to_string()));
        }
        let decoded: String = self
            .decode_entities(text)
            .chars()
            .filter(|c| !NOISE_CHARS.contains(c))
            .collect();
        if let Some(parent) = stack.last_mut() {
            parent.children.push(Fragment::Text(decoded));
        }
        Ok(())
    }

    fn parse_attrs(&self, source: &str) -> Vec<(String, String)> {
        self.attr_re
            .captures_iter(source)
            .filter_map(|caps| {
                let name = caps.get(1)?.as_str().to_ascii_lowercase();
                let value = caps
                    .get(2)
                    .or_else(|| caps.get(3))
                    .or_else(|| caps.get(4))
                    .map(|m| self.decode_entities(m.as_str()))
                    .unwrap_or_default();
                Some((name, value))
            })
            .collect()
    }

    fn decode_entities(&self, text: &str) -> String {
        self.entity_re
            .replace_all(text, |caps: &Captures| {
                let entity = &caps[1];
                let decoded = match entity {
                    "amp" => Some('&'),
                    "lt" => Some('<'),
                    "gt" => Some('>'),
                    "quot" => Some('"'),
                    "apos" => Some('\''),
                    "nbsp" => Some(' '),
                    _ => entity
                        .strip_prefix("#x")
                        .or_else(|| entity.strip_prefix("#X"))
                        .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                        .or_else(|| entity.strip_prefix('#').and_then(|d| d.parse().ok()))
                        .and_then(char::from_u32),
                };
                decoded
                    .map(String::from)
                    .unwrap_or_else(|| caps[0].to_string())
            })
            .into_owned()
    }

    fn tidy(&self, markdown: &str) -> String {
        let mut lines = Vec::new();
        let mut in_fence = false;
        for line in markdown.lines() {
            if line.trim_start().starts_with("```") {
                in_fence = !in_fence;
                lines.push(line.trim_end());
            } else if in_fence {
                lines.push(line);
            } else {
                let line = line.trim_end();
                // Single leading spaces come from collapsed inter-block whitespace
                let line = match line.strip_prefix(' ') {
                    Some(rest) if !rest.starts_with(' ') => rest,
                    _ => line,
                };
                lines.push(line);
            }
        }
        let joined = lines.join("\n");
        self.blank_lines_re
            .replace_all(&joined, "\n\n")
            .trim()
            .to_string()
    }
}

fn attr<'a>(attrs: &'a [(String, String)], name: &str) -> Option<&'a str> {
    attrs
        .iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.as_str())
}

fn has_class(attrs: &[(String, String)], class: &str) -> bool {
    attr(attrs, "class").is_some_and(|c| c.split_whitespace().any(|x| x == class))
}

fn is_hidden(attrs: &[(String, String)]) -> bool {
    attr(attrs, "aria-hidden") == Some("true")
        || HIDDEN_CLASSES.iter().any(|c| has_class(attrs, c))
}

fn render_nodes(nodes: &[Fragment]) -> String {
    nodes.iter().map(render_node).collect()
}

fn render_node(node: &Fragment) -> String {
    match node {
        Fragment::Text(text) => collapse_whitespace(text),
        Fragment::Element {
            tag,
            attrs,
            children,
        } => render_element(tag, attrs, children),
    }
}

fn render_element(tag: &str, attrs: &[(String, String)], children: &[Fragment]) -> String {
    if DROP_TAGS.contains(&tag) || is_hidden(attrs) {
        return String::new();
    }
    match tag {
        "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => {
            let level = tag[1..].parse::<usize>().unwrap_or(1);
            let text = render_nodes(children);
            format!("\n\n{} {}\n\n", "#".repeat(level), text.trim())
        }
        "p" => format!("\n\n{}\n\n", render_nodes(children).trim()),
        "br" => "\n".to_string(),
        "hr" => "\n\n---\n\n".to_string(),
        "strong" | "b" => wrap_inline(&render_nodes(children), "**"),
        "em" | "i" => wrap_inline(&render_nodes(children), "*"),
        "del" | "s" | "strike" => wrap_inline(&render_nodes(children), "~~"),
        "code" => wrap_inline(&raw_text(children), "`"),
        "pre" => render_code_block(attrs, children),
        "a" => {
            let text = render_nodes(children);
            match attr(attrs, "href").filter(|h| !h.is_empty()) {
                Some(href) if !text.trim().is_empty() => format!("[{}]({})", text.trim(), href),
                _ => text,
            }
        }
        "img" => match attr(attrs, "src") {
            Some(src) => format!("![{}]({})", attr(attrs, "alt").unwrap_or(""), src),
            None => String::new(),
        },
        "ul" => render_list(children, false),
        "ol" => render_list(children, true),
        "li" => format!("\n- {}\n", render_nodes(children).trim()),
        "blockquote" => {
            let body = render_nodes(children);
            let quoted: Vec<String> = body
                .trim()
                .lines()
                .map(|l| {
                    if l.trim().is_empty() {
                        ">".to_string()
                    } else {
                        format!("> {}", l.trim_end())
                    }
                })
                .collect();
            format!("\n\n{}\n\n", quoted.join("\n"))
        }
        "table" => render_table(children),
        _ if is_block_wrapper(tag, attrs) => format!("\n{}\n", render_nodes(children)),
        // Inline noise wrappers (span, font, ...) keep only their content
        _ => render_nodes(children),
    }
}

fn is_block_wrapper(tag: &str, attrs: &[(String, String)]) -> bool {
    matches!(
        tag,
        "div" | "section" | "article" | "main" | "header" | "footer" | "aside" | "figure" | "nav"
    ) || tag.contains('-')
        || has_class(attrs, PASS_THROUGH_CLASS)
}

fn wrap_inline(inner: &str, marker: &str) -> String {
    let trimmed = inner.trim();
    if trimmed.is_empty() {
        return inner.to_string();
    }
    let leading = if inner.starts_with(char::is_whitespace) { " " } else { "" };
    let trailing = if inner.ends_with(char::is_whitespace) { " " } else { "" };
    format!("{}{}{}{}{}", leading, marker, trimmed, marker, trailing)
}

fn render_code_block(attrs: &[(String, String)], children: &[Fragment]) -> String {
    let language = code_language(attrs)
        .or_else(|| {
            children.iter().find_map(|c| match c {
                Fragment::Element { tag, attrs, .. } if tag == "code" => code_language(attrs),
                _ => None,
            })
        })
        .unwrap_or_default();
    let code = raw_text(children);
    let code = code.trim_matches('\n');
    format!("\n\n```{}\n{}\n```\n\n", language, code)
}

fn code_language(attrs: &[(String, String)]) -> Option<String> {
    if let Some(lang) = attr(attrs, "data-language").filter(|l| !l.is_empty()) {
        return Some(lang.to_string());
    }
    attr(attrs, "class")?
        .split_whitespace()
        .find_map(|c| c.strip_prefix("language-").or_else(|| c.strip_prefix("lang-")))
        .map(str::to_string)
}

/// Text of a subtree without whitespace collapsing (code content).
fn raw_text(nodes: &[Fragment]) -> String {
    let mut out = String::new();
    for node in nodes {
        match node {
            Fragment::Text(text) => out.push_str(text),
            Fragment::Element { tag, .. } if tag == "br" => out.push('\n'),
            Fragment::Element { tag, attrs, .. }
                if DROP_TAGS.contains(&tag.as_str()) || is_hidden(attrs) => {}
            Fragment::Element { children, .. } => out.push_str(&raw_text(children)),
        }
    }
    out
}

fn render_list(children: &[Fragment], ordered: bool) -> String {
    let mut out = String::from("\n\n");
    let mut number = 1;
    for child in children {
        let Fragment::Element {
            tag,
            children: item,
            ..
        } = child
        else {
            continue;
        };
        if tag != "li" {
            continue;
        }
        let marker = if ordered {
            format!("{}. ", number)
        } else {
            "- ".to_string()
        };
        number += 1;
        let indent = " ".repeat(marker.len());
        let body = render_nodes(item);
        let mut lines = body.trim().lines().filter(|l| !l.trim().is_empty());
        out.push_str(&marker);
        out.push_str(lines.next().unwrap_or("").trim());
        out.push('\n');
        for line in lines {
            out.push_str(&indent);
            out.push_str(line.trim_end());
            out.push('\n');
        }
    }
    out.push('\n');
    out
}

fn render_table(children: &[Fragment]) -> String {
    let mut rows: Vec<Vec<String>> = Vec::new();
    collect_rows(children, &mut rows);
    if rows.is_empty() {
        return String::new();
    }
    let width = rows.iter().map(Vec::len).max().unwrap_or(0);
    let mut out = String::from("\n\n");
    for (i, row) in rows.iter().enumerate() {
        let mut cells = row.clone();
        cells.resize(width, String::new());
        out.push_str(&format!("| {} |\n", cells.join(" | ")));
        if i == 0 {
            out.push_str(&format!("|{}\n", " --- |".repeat(width)));
        }
    }
    out.push('\n');
    out
}

fn collect_rows(nodes: &[Fragment], rows: &mut Vec<Vec<String>>) {
    for node in nodes {
        let Fragment::Element { tag, children, .. } = node else {
            continue;
        };
        if tag == "tr" {
            let cells = children
                .iter()
                .filter_map(|cell| match cell {
                    Fragment::Element { tag, children, .. } if tag == "td" || tag == "th" => {
                        Some(render_nodes(children).trim().replace('\n', " ").replace('|', "\\|"))
                    }
                    _ => None,
                })
                .collect();
            rows.push(cells);
        } else {
            collect_rows(children, rows);
        }
    }
}

fn collapse_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_space = false;
    for c in text.chars() {
        if c.is_whitespace() {
            if !in_space {
                out.push(' ');
            }
            in_space = true;
        } else {
            out.push(c);
            in_space = false;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headings_lists_and_emphasis() {
        let n = MarkupNormalizer::new();
        let md = n.normalize(
            "<h2>Plan</h2><p>Do <strong>this</strong> and <em>that</em>.</p>\
             <ul><li>one</li><li>two</li></ul><ol><li>first</li><li>second</li></ol>",
        );
        assert_eq!(
            md,
            "## Plan\n\nDo **this** and *that*.\n\n- one\n- two\n\n1. first\n2. second"
        );
    }

    #[test]
    fn test_code_fence_keeps_language_and_whitespace() {
        let n = MarkupNormalizer::new();
        let md = n.normalize(
            "<pre><code class=\"language-rust\">fn main() {\n    println!(\"&lt;hi&gt;\");\n}</code></pre>",
        );
        assert_eq!(md, "```rust\nfn main() {\n    println!(\"<hi>\");\n}\n```");
    }

    #[test]
    fn test_noise_wrappers_are_unwrapped_and_comments_stripped() {
        let n = MarkupNormalizer::new();
        let md = n.normalize(
            "<message-content _ngcontent-abc=\"\"><!----><div class=\"markdown\">\
             <span class=\"x\">kept</span><button>Copy</button>\
             <span aria-hidden=\"true\">hidden</span></div></message-content>",
        );
        assert_eq!(md, "kept");
    }

    #[test]
    fn test_blank_lines_collapse() {
        let n = MarkupNormalizer::new();
        let md = n.normalize("<p>a</p><br><br><br><br><p>b</p>");
        assert_eq!(md, "a\n\nb");
    }

    #[test]
    fn test_malformed_markup_degrades() {
        let n = MarkupNormalizer::new();
        let raw = "<div class=\"c\" data-x=\"1\" aria-label=\"l\" _ngcontent-a1=\"\"><p id=\"p\" title=\"t\">text</span>";
        assert!(n.convert(raw).is_err());
        assert_eq!(n.normalize(raw), "<div><p title=\"t\">text</span>");
    }

    #[test]
    fn test_degrade_keeps_attribute_values_intact() {
        let n = MarkupNormalizer::new();
        assert_eq!(
            n.degrade(r#"<a title="the id is here" href="x">t</a>"#),
            r#"<a title="the id is here" href="x">t</a>"#
        );
        assert_eq!(
            n.degrade(r#"<img class="icon" alt='style > substance' data-src=x/>"#),
            r#"<img alt='style > substance' />"#
        );
        assert_eq!(n.degrade("<hr/><br>"), "<hr /><br>");
    }

    #[test]
    fn test_unclosed_element_degrades() {
        let n = MarkupNormalizer::new();
        assert!(n.convert("<div><b>open").is_err());
        assert_eq!(n.normalize("<div style=\"x\"><b>open"), "<div><b>open");
    }

    #[test]
    fn test_links_tables_and_quotes() {
        let n = MarkupNormalizer::new();
        let md = n.normalize(
            "<p><a href=\"https://x.test\">site</a></p><blockquote><p>quoted</p></blockquote>\
             <table><tr><th>k</th><th>v</th></tr><tr><td>a</td><td>1</td></tr></table>",
        );
        assert_eq!(
            md,
            "[site](https://x.test)\n\n> quoted\n\n| k | v |\n| --- | --- |\n| a | 1 |"
        );
    }

    #[test]
    fn test_plain_text_passes_through() {
        let n = MarkupNormalizer::new();
        assert_eq!(n.normalize("  just   text  "), "just text");
        assert_eq!(n.normalize(""), "");
    }
}
