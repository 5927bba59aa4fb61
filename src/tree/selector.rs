//! Compound selectors over [`Node`]s
//!
//! Supported grammar, comma-separated alternatives of:
//! `tag` or `*`, `#id`, `.class`, `[attr]`, `[attr=value]`,
//! `[attr*=value]`, `[attr^=value]`. Values may be quoted.

use super::Node;
use crate::{ClimbError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
enum AttrPredicate {
    Exists(String),
    Equals(String, String),
    Contains(String, String),
    Prefix(String, String),
}

impl AttrPredicate {
    fn matches(&self, node: &Node) -> bool {
        match self {
            AttrPredicate::Exists(name) => node.attr(name).is_some(),
            AttrPredicate::Equals(name, value) => node.attr(name) == Some(value.as_str()),
            AttrPredicate::Contains(name, value) => {
                node.attr(name).is_some_and(|v| v.contains(value.as_str()))
            }
            AttrPredicate::Prefix(name, value) => {
                node.attr(name).is_some_and(|v| v.starts_with(value.as_str()))
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Compound {
    tag: Option<String>,
    id: Option<String>,
    classes: Vec<String>,
    attrs: Vec<AttrPredicate>,
}

impl Compound {
    fn matches(&self, node: &Node) -> bool {
        if node.is_text() {
            return false;
        }
        if let Some(tag) = &self.tag {
            if *tag != node.tag {
                return false;
            }
        }
        if let Some(id) = &self.id {
            if node.id() != Some(id.as_str()) {
                return false;
            }
        }
        self.classes.iter().all(|c| node.has_class(c)) && self.attrs.iter().all(|a| a.matches(node))
    }
}

/// A parsed selector: one or more comma-separated compounds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selector {
    source: String,
    alternatives: Vec<Compound>,
}

impl Selector {
    pub fn parse(source: &str) -> Result<Self> {
        let mut alternatives = Vec::new();
        for part in source.split(',') {
            let part = part.trim();
            if part.is_empty() {
                return Err(invalid(source, "empty alternative"));
            }
            alternatives.push(parse_compound(source, part)?);
        }
        Ok(Self {
            source: source.to_string(),
            alternatives,
        })
    }

    pub fn matches(&self, node: &Node) -> bool {
        self.alternatives.iter().any(|c| c.matches(node))
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.alternatives.is_empty()
    }
}

fn invalid(selector: &str, reason: &str) -> ClimbError {
    ClimbError::Selector {
        selector: selector.to_string(),
        reason: reason.to_string(),
    }
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '-' || c == '_' || c == ':'
}

fn take_ident(chars: &[char], pos: &mut usize) -> String {
    let start = *pos;
    while *pos < chars.len() && is_ident_char(chars[*pos]) {
        *pos += 1;
    }
    chars[start..*pos].iter().collect()
}

fn parse_compound(source: &str, part: &str) -> Result<Compound> {
    let chars: Vec<char> = part.chars().collect();
    let mut pos = 0;
    let mut compound = Compound::default();

    if chars[0] == '*' {
        pos = 1;
    } else if is_ident_char(chars[0]) {
        compound.tag = Some(take_ident(&chars, &mut pos).to_ascii_lowercase());
    }

    while pos < chars.len() {
        match chars[pos] {
            '.' => {
                pos += 1;
                let class = take_ident(&chars, &mut pos);
                if class.is_empty() {
                    return Err(invalid(source, "expected class name after '.'"));
                }
                compound.classes.push(class);
            }
            '#' => {
                pos += 1;
                let id = take_ident(&chars, &mut pos);
                if id.is_empty() {
                    return Err(invalid(source, "expected id after '#'"));
                }
                compound.id = Some(id);
            }
            '[' => {
                pos += 1;
                let close = chars[pos..]
                    .iter()
                    .position(|c| *c == ']')
                    .ok_or_else(|| invalid(source, "unterminated attribute predicate"))?;
                let body: String = chars[pos..pos + close].iter().collect();
                pos += close + 1;
                compound.attrs.push(parse_attr(source, &body)?);
            }
            c if c.is_whitespace() => {
                return Err(invalid(source, "descendant combinators are not supported"));
            }
            c => {
                return Err(invalid(source, &format!("unexpected character '{}'", c)));
            }
        }
    }

    Ok(compound)
}

fn parse_attr(source: &str, body: &str) -> Result<AttrPredicate> {
    let unquote = |v: &str| {
        let v = v.trim();
        v.strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .or_else(|| v.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
            .unwrap_or(v)
            .to_string()
    };

    let predicate = if let Some((name, value)) = body.split_once("*=") {
        AttrPredicate::Contains(name.trim().to_string(), unquote(value))
    } else if let Some((name, value)) = body.split_once("^=") {
        AttrPredicate::Prefix(name.trim().to_string(), unquote(value))
    } else if let Some((name, value)) = body.split_once('=') {
        AttrPredicate::Equals(name.trim().to_string(), unquote(value))
    } else {
        AttrPredicate::Exists(body.trim().to_string())
    };

    let name = match &predicate {
        AttrPredicate::Exists(n)
        | AttrPredicate::Equals(n, _)
        | AttrPredicate::Contains(n, _)
        | AttrPredicate::Prefix(n, _) => n,
    };
    if name.is_empty() || !name.chars().all(is_ident_char) {
        return Err(invalid(source, "invalid attribute name"));
    }
    Ok(predicate)
}
