//! Format-preserving reader for bracketed scene/resource text
//!
//! Every piece of source text is kept next to its parsed form. Serializing
//! concatenates the raw pieces, so a document that was never edited comes
//! back byte-for-byte. An edit drops the raw text of the piece it touched and
//! only that piece is re-rendered.

use crate::error::{SceneError, SceneResult};
use crate::variant::{parse_variant, ValueParser, Variant};
use std::fmt;

/// A `key = value` line (possibly spanning several lines)
#[derive(Debug, Clone, PartialEq)]
pub struct Property {
    pub key: String,
    pub value: Variant,
    /// 1-based source line, 0 for properties added by an edit
    pub line: usize,
    raw: Option<String>,
}

impl Property {
    pub fn new(key: impl Into<String>, value: Variant) -> Self {
        Self {
            key: key.into(),
            value,
            line: 0,
            raw: None,
        }
    }

    fn render(&self) -> String {
        format!("{} = {}\n", self.key, self.value)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum BodyItem {
    Property(Property),
    /// Blank or `;` comment line
    Trivia(String),
}

impl BodyItem {
    fn raw_text(&self) -> Option<&str> {
        match self {
            BodyItem::Property(p) => p.raw.as_deref(),
            BodyItem::Trivia(t) => Some(t),
        }
    }
}

/// A `[tag key=value ...]` header and the lines that follow it
#[derive(Debug, Clone, PartialEq)]
pub struct Section {
    pub tag: String,
    pub line: usize,
    attributes: Vec<(String, Variant)>,
    header_raw: Option<String>,
    pub(crate) body: Vec<BodyItem>,
}

impl Section {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            line: 0,
            attributes: Vec::new(),
            header_raw: None,
            body: Vec::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: Variant) -> Self {
        self.attributes.push((key.into(), value));
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: Variant) -> Self {
        self.set_property(key, value);
        self
    }

    pub fn attributes(&self) -> &[(String, Variant)] {
        &self.attributes
    }

    pub fn attribute(&self, key: &str) -> Option<&Variant> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    pub fn attribute_str(&self, key: &str) -> Option<&str> {
        self.attribute(key).and_then(Variant::as_str)
    }

    /// Replace or append a header attribute; the header is re-rendered
    pub fn set_attribute(&mut self, key: impl Into<String>, value: Variant) {
        let key = key.into();
        match self.attributes.iter_mut().find(|(k, _)| *k == key) {
            Some((_, v)) => *v = value,
            None => self.attributes.push((key, value)),
        }
        self.header_raw = None;
    }

    pub fn properties(&self) -> impl Iterator<Item = &Property> {
        self.body.iter().filter_map(|item| match item {
            BodyItem::Property(p) => Some(p),
            BodyItem::Trivia(_) => None,
        })
    }

    pub fn property(&self, key: &str) -> Option<&Variant> {
        self.properties().find(|p| p.key == key).map(|p| &p.value)
    }

    /// Replace a property value in place, or add it after the last property
    pub fn set_property(&mut self, key: impl Into<String>, value: Variant) {
        let key = key.into();
        for item in &mut self.body {
            if let BodyItem::Property(p) = item {
                if p.key == key {
                    if p.value != value {
                        p.value = value;
                        p.raw = None;
                    }
                    return;
                }
            }
        }

        let at = self
            .body
            .iter()
            .rposition(|item| matches!(item, BodyItem::Property(_)))
            .map_or(0, |i| i + 1);
        self.body.insert(at, BodyItem::Property(Property::new(key, value)));
    }

    pub fn remove_property(&mut self, key: &str) -> Option<Variant> {
        let index = self
            .body
            .iter()
            .position(|item| matches!(item, BodyItem::Property(p) if p.key == key))?;
        match self.body.remove(index) {
            BodyItem::Property(p) => Some(p.value),
            BodyItem::Trivia(_) => None,
        }
    }

    fn render_header(&self) -> String {
        let mut out = format!("[{}", self.tag);
        for (key, value) in &self.attributes {
            out.push_str(&format!(" {}={}", key, value));
        }
        out.push_str("]\n");
        out
    }

    fn ends_with_blank_line(&self) -> bool {
        matches!(self.body.last(), Some(BodyItem::Trivia(t)) if t.trim().is_empty())
    }

    fn ends_with_newline(&self) -> bool {
        let last = match self.body.last() {
            Some(item) => item.raw_text(),
            None => self.header_raw.as_deref(),
        };
        last.map_or(true, |text| text.ends_with('\n'))
    }

    fn write_to(&self, out: &mut String) {
        match &self.header_raw {
            Some(raw) => out.push_str(raw),
            None => {
                ensure_newline(out);
                out.push_str(&self.render_header());
            }
        }
        for item in &self.body {
            match item.raw_text() {
                Some(raw) => out.push_str(raw),
                None => {
                    if let BodyItem::Property(p) = item {
                        ensure_newline(out);
                        out.push_str(&p.render());
                    }
                }
            }
        }
    }
}

fn ensure_newline(out: &mut String) {
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
}

/// Parsed file: leading lines before the first header plus the sections
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SceneDocument {
    preamble: Vec<String>,
    sections: Vec<Section>,
}

impl SceneDocument {
    pub fn parse(text: &str) -> SceneResult<Self> {
        let mut doc = SceneDocument::default();
        let mut lines = text.split_inclusive('\n').enumerate();

        while let Some((index, line)) = lines.next() {
            let line_no = index + 1;
            let trimmed = line.trim();

            if trimmed.is_empty() || trimmed.starts_with(';') {
                match doc.sections.last_mut() {
                    Some(section) => section.body.push(BodyItem::Trivia(line.to_string())),
                    None => doc.preamble.push(line.to_string()),
                }
                continue;
            }

            let mut raw = line.to_string();
            while !is_balanced(&raw) {
                match lines.next() {
                    Some((_, next)) => raw.push_str(next),
                    None => return Err(SceneError::parse(line_no, "unterminated value")),
                }
            }

            if trimmed.starts_with('[') {
                let (tag, attributes) =
                    parse_header(raw.trim()).map_err(|m| SceneError::parse(line_no, m))?;
                doc.sections.push(Section {
                    tag,
                    line: line_no,
                    attributes,
                    header_raw: Some(raw),
                    body: Vec::new(),
                });
                continue;
            }

            let section = doc
                .sections
                .last_mut()
                .ok_or_else(|| SceneError::parse(line_no, "property outside of a section"))?;
            let (key, value) = {
                let (key, value_text) = raw.split_once('=').ok_or_else(|| {
                    SceneError::parse(line_no, format!("expected 'key = value', found {:?}", trimmed))
                })?;
                let value =
                    parse_variant(value_text.trim()).map_err(|m| SceneError::parse(line_no, m))?;
                (key.trim().to_string(), value)
            };
            if key.is_empty() {
                return Err(SceneError::parse(line_no, "empty property name"));
            }
            section.body.push(BodyItem::Property(Property {
                key,
                value,
                line: line_no,
                raw: Some(raw),
            }));
        }

        Ok(doc)
    }

    pub fn serialize(&self) -> String {
        let mut out: String = self.preamble.concat();
        for section in &self.sections {
            section.write_to(&mut out);
        }
        out
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    pub fn section(&self, index: usize) -> Option<&Section> {
        self.sections.get(index)
    }

    pub fn section_mut(&mut self, index: usize) -> Option<&mut Section> {
        self.sections.get_mut(index)
    }

    /// First section with the given tag
    pub fn find(&self, tag: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.tag == tag)
    }

    pub fn push_section(&mut self, section: Section) {
        self.insert_section(self.sections.len(), section);
    }

    /// Insert a section keeping one blank line between neighbours
    pub fn insert_section(&mut self, index: usize, mut section: Section) {
        let index = index.min(self.sections.len());

        if index > 0 {
            let prev = &mut self.sections[index - 1];
            if !prev.ends_with_blank_line() {
                let blank = if prev.ends_with_newline() { "\n" } else { "\n\n" };
                prev.body.push(BodyItem::Trivia(blank.to_string()));
            }
        }
        if index < self.sections.len() && !section.ends_with_blank_line() {
            section.body.push(BodyItem::Trivia("\n".to_string()));
        }

        self.sections.insert(index, section);
    }

    pub fn remove_section(&mut self, index: usize) -> Option<Section> {
        if index < self.sections.len() {
            Some(self.sections.remove(index))
        } else {
            None
        }
    }
}

impl fmt::Display for SceneDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.serialize())
    }
}

fn parse_header(text: &str) -> Result<(String, Vec<(String, Variant)>), String> {
    let inner = text
        .strip_prefix('[')
        .and_then(|t| t.strip_suffix(']'))
        .ok_or_else(|| format!("malformed section header {:?}", text))?;

    let mut parser = ValueParser::new(inner);
    parser.skip_ws();
    let tag = parser.take_while(|c| !c.is_whitespace()).to_string();
    if tag.is_empty() {
        return Err("empty section tag".into());
    }

    let mut attributes = Vec::new();
    loop {
        parser.skip_ws();
        if parser.at_end() {
            break;
        }
        let key = parser
            .take_while(|c| !c.is_whitespace() && c != '=')
            .to_string();
        if key.is_empty() {
            return Err(format!("expected attribute name at {:?}", parser.snippet()));
        }
        parser.expect('=')?;
        let value = parser.parse_value()?;
        attributes.push((key, value));
    }

    Ok((tag, attributes))
}

/// Whether every quote and bracket opened in `text` is closed
fn is_balanced(text: &str) -> bool {
    let mut depth: i32 = 0;
    let mut in_string = false;
    let mut escaped = false;

    for c in text.chars() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '[' | '{' | '(' => depth += 1,
            ']' | '}' | ')' => depth -= 1,
            _ => {}
        }
    }

    !in_string && depth <= 0
}
