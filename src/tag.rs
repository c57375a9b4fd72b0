//! Tag/value codec for structured message bodies.
//!
//! Message bodies are trees of named tags, rendered as
//! `<name>value</name>` with nesting. The codec is symmetric: a
//! rendered tree re-parses to an identical tree, which the
//! pack-instruction round-trip tests rely on.

use crate::error::{IrodsError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagValue {
    /// Leaf text; integers travel as their decimal rendering
    Text(String),
    /// Nested child tags
    Children(Vec<Tag>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub name: String,
    pub value: TagValue,
}

impl Tag {
    pub fn leaf(name: impl Into<String>, value: impl Into<String>) -> Tag {
        Tag {
            name: name.into(),
            value: TagValue::Text(value.into()),
        }
    }

    pub fn int(name: impl Into<String>, value: i64) -> Tag {
        Tag::leaf(name, value.to_string())
    }

    pub fn node(name: impl Into<String>, children: Vec<Tag>) -> Tag {
        Tag {
            name: name.into(),
            value: TagValue::Children(children),
        }
    }

    pub fn children(&self) -> &[Tag] {
        match &self.value {
            TagValue::Children(c) => c.as_slice(),
            TagValue::Text(_) => &[],
        }
    }

    /// First child with the given name
    pub fn child(&self, name: &str) -> Option<&Tag> {
        self.children().iter().find(|t| t.name == name)
    }

    /// All children with the given name, in document order
    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Tag> + 'a {
        self.children().iter().filter(move |t| t.name == name)
    }

    pub fn text(&self) -> Option<&str> {
        match &self.value {
            TagValue::Text(s) => Some(s),
            TagValue::Children(_) => None,
        }
    }

    /// Text of a required leaf child; `WireFormat` if missing
    pub fn str_child(&self, name: &str) -> Result<&str> {
        self.child(name)
            .and_then(|t| t.text())
            .ok_or_else(|| IrodsError::WireFormat(format!("<{}> missing tag <{}>", self.name, name)))
    }

    /// Integer value of a required leaf child
    pub fn int_child(&self, name: &str) -> Result<i64> {
        let raw = self.str_child(name)?;
        raw.trim().parse::<i64>().map_err(|_| {
            IrodsError::WireFormat(format!("<{}>: tag <{}> is not an integer: {:?}", self.name, name, raw))
        })
    }

    /// Render the tree to its wire form
    pub fn render(&self) -> String {
        let mut out = String::new();
        self.render_into(&mut out);
        out
    }

    fn render_into(&self, out: &mut String) {
        out.push('<');
        out.push_str(&self.name);
        out.push('>');
        match &self.value {
            TagValue::Text(s) => out.push_str(&escape(s)),
            TagValue::Children(kids) => {
                out.push('\n');
                for kid in kids {
                    kid.render_into(out);
                }
            }
        }
        out.push_str("</");
        out.push_str(&self.name);
        out.push_str(">\n");
    }

    /// Parse one tag tree from its wire form
    pub fn parse(input: &str) -> Result<Tag> {
        let mut cur = Cursor { s: input, pos: 0 };
        let tag = cur.parse_tag()?;
        cur.skip_ws();
        if cur.pos != cur.s.len() {
            return Err(IrodsError::WireFormat(format!(
                "trailing bytes after </{}>",
                tag.name
            )));
        }
        Ok(tag)
    }
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            // Raw newlines would collide with the renderer's own
            // leaf/node framing, so control characters travel as
            // numeric references
            '\n' => out.push_str("&#10;"),
            '\r' => out.push_str("&#13;"),
            _ => out.push(c),
        }
    }
    out
}

fn unescape(s: &str) -> Result<String> {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(idx) = rest.find('&') {
        out.push_str(&rest[..idx]);
        rest = &rest[idx..];
        let (entity, advance) = if rest.starts_with("&amp;") {
            ('&', 5)
        } else if rest.starts_with("&lt;") {
            ('<', 4)
        } else if rest.starts_with("&gt;") {
            ('>', 4)
        } else if rest.starts_with("&quot;") {
            ('"', 6)
        } else if rest.starts_with("&apos;") {
            ('\'', 6)
        } else if rest.starts_with("&#10;") {
            ('\n', 5)
        } else if rest.starts_with("&#13;") {
            ('\r', 5)
        } else {
            return Err(IrodsError::WireFormat(format!(
                "unknown entity at {:?}",
                &rest[..rest.len().min(8)]
            )));
        };
        out.push(entity);
        rest = &rest[advance..];
    }
    out.push_str(rest);
    Ok(out)
}

struct Cursor<'a> {
    s: &'a str,
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn rest(&self) -> &'a str {
        &self.s[self.pos..]
    }

    fn skip_ws(&mut self) {
        let trimmed = self
            .rest()
            .trim_start_matches(|c: char| c.is_ascii_whitespace());
        self.pos = self.s.len() - trimmed.len();
    }

    fn parse_tag(&mut self) -> Result<Tag> {
        self.skip_ws();
        let name = self.open_tag()?;
        // A node renders a newline (or another open tag) right after
        // its own open tag; a leaf is followed by escaped text or by
        // its immediate close.
        if self.rest().starts_with('\n') || self.looks_like_child_open(&name) {
            let mut kids = Vec::new();
            loop {
                self.skip_ws();
                if self.rest().starts_with("</") {
                    break;
                }
                if self.rest().is_empty() {
                    return Err(IrodsError::WireFormat(format!("<{}> never closed", name)));
                }
                kids.push(self.parse_tag()?);
            }
            self.close_tag(&name)?;
            Ok(Tag::node(name, kids))
        } else {
            let end = self.rest().find('<').ok_or_else(|| {
                IrodsError::WireFormat(format!("<{}> has unterminated text", name))
            })?;
            let raw = &self.rest()[..end];
            self.pos += end;
            let text = unescape(raw)?;
            self.close_tag(&name)?;
            Ok(Tag::leaf(name, text))
        }
    }

    fn looks_like_child_open(&self, _parent: &str) -> bool {
        let r = self.rest();
        r.starts_with('<') && !r.starts_with("</")
    }

    fn open_tag(&mut self) -> Result<String> {
        if !self.rest().starts_with('<') {
            return Err(IrodsError::WireFormat(format!(
                "expected tag open at {:?}",
                &self.rest()[..self.rest().len().min(16)]
            )));
        }
        let end = self
            .rest()
            .find('>')
            .ok_or_else(|| IrodsError::WireFormat("unterminated tag open".into()))?;
        let name = &self.rest()[1..end];
        if name.is_empty() || name.starts_with('/') || name.contains(['<', ' ', '\n']) {
            return Err(IrodsError::WireFormat(format!("bad tag name {:?}", name)));
        }
        let name = name.to_string();
        self.pos += end + 1;
        Ok(name)
    }

    fn close_tag(&mut self, name: &str) -> Result<()> {
        let want = format!("</{}>", name);
        if !self.rest().starts_with(&want) {
            return Err(IrodsError::WireFormat(format!(
                "expected {} at {:?}",
                want,
                &self.rest()[..self.rest().len().min(24)]
            )));
        }
        self.pos += want.len();
        // Optional newline emitted by the renderer
        if self.rest().starts_with('\n') {
            self.pos += 1;
        }
        Ok(())
    }
}
