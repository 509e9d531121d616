//! Structured markup: element trees for remote documents and builders for
//! allocate payloads.
//!
//! Remote `info` and `pool.info` calls answer with a markup document. It is
//! read into a plain [`Element`] tree and every resource kind projects the
//! fields it cares about explicitly.

use std::collections::BTreeMap;

use quick_xml::escape::escape;
use quick_xml::events::Event;
use quick_xml::Reader;

use crate::error::{RemoteError, Result};

/// A parsed markup element: its name, concatenated text and child elements.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Element {
    /// Element name.
    pub name: String,
    /// Text content (character data and CDATA sections, unescaped).
    pub text: String,
    /// Child elements in document order.
    pub children: Vec<Self>,
}

impl Element {
    /// Creates an empty element with the given name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            text: String::new(),
            children: Vec::new(),
        }
    }

    /// Parses a markup document and returns its root element.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is malformed or has no root element.
    pub fn parse(input: &str) -> Result<Self> {
        let mut reader = Reader::from_str(input);
        reader.config_mut().trim_text(true);

        let mut stack: Vec<Self> = Vec::new();
        let mut root = None;

        loop {
            match reader.read_event() {
                Ok(Event::Start(start)) => {
                    stack.push(Self::new(element_name(start.name().as_ref())?));
                }
                Ok(Event::Empty(start)) => {
                    let element = Self::new(element_name(start.name().as_ref())?);
                    attach(&mut stack, &mut root, element);
                }
                Ok(Event::Text(text)) => {
                    let text = text
                        .unescape()
                        .map_err(|e| RemoteError::invalid(format!("bad character data: {e}")))?;
                    if let Some(current) = stack.last_mut() {
                        current.text.push_str(&text);
                    }
                }
                Ok(Event::CData(data)) => {
                    let bytes = data.into_inner();
                    let text = std::str::from_utf8(&bytes)
                        .map_err(|e| RemoteError::invalid(format!("bad CDATA section: {e}")))?;
                    if let Some(current) = stack.last_mut() {
                        current.text.push_str(text);
                    }
                }
                Ok(Event::End(_)) => {
                    let element = stack
                        .pop()
                        .ok_or_else(|| RemoteError::invalid("unbalanced closing tag"))?;
                    attach(&mut stack, &mut root, element);
                }
                Ok(Event::Eof) => break,
                Ok(_) => {}
                Err(e) => {
                    return Err(RemoteError::invalid(format!(
                        "malformed document at byte {}: {e}",
                        reader.buffer_position()
                    ))
                    .into());
                }
            }
        }

        if !stack.is_empty() {
            return Err(RemoteError::invalid("document ended inside an open element").into());
        }

        root.ok_or_else(|| RemoteError::invalid("document has no root element").into())
    }

    /// Returns the first child with the given name.
    #[must_use]
    pub fn child(&self, name: &str) -> Option<&Self> {
        self.children.iter().find(|c| c.name == name)
    }

    /// Returns every child with the given name.
    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Self> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }

    /// Follows a path of child names.
    #[must_use]
    pub fn path(&self, names: &[&str]) -> Option<&Self> {
        names
            .iter()
            .try_fold(self, |element, name| element.child(name))
    }

    /// Returns the text of the named child, if present.
    #[must_use]
    pub fn child_text(&self, name: &str) -> Option<&str> {
        self.child(name).map(|c| c.text.as_str())
    }

    /// Returns the text of the named child, or an empty string.
    #[must_use]
    pub fn text_or_empty(&self, name: &str) -> String {
        self.child_text(name).unwrap_or_default().to_string()
    }

    /// Returns the text of the named child parsed as an integer.
    ///
    /// Absent or empty children yield `Ok(None)`.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is present but not an integer.
    pub fn child_i64(&self, name: &str) -> Result<Option<i64>> {
        match self.child_text(name).map(str::trim) {
            None | Some("") => Ok(None),
            Some(text) => text.parse().map(Some).map_err(|_| {
                RemoteError::invalid(format!("{}/{name} is not an integer: '{text}'", self.name))
                    .into()
            }),
        }
    }

    /// Returns the named integer child, failing if it is missing.
    ///
    /// # Errors
    ///
    /// Returns an error if the child is missing or not an integer.
    pub fn require_i64(&self, name: &str) -> Result<i64> {
        self.child_i64(name)?.ok_or_else(|| {
            RemoteError::invalid(format!("{} has no {name} element", self.name)).into()
        })
    }
}

fn element_name(raw: &[u8]) -> Result<String> {
    std::str::from_utf8(raw)
        .map(ToString::to_string)
        .map_err(|e| RemoteError::invalid(format!("element name is not UTF-8: {e}")).into())
}

fn attach(stack: &mut [Element], root: &mut Option<Element>, element: Element) {
    match stack.last_mut() {
        Some(parent) => parent.children.push(element),
        None => {
            if root.is_none() {
                *root = Some(element);
            }
        }
    }
}

/// Incremental writer for structured allocate payloads.
///
/// Only present values are emitted; `None` leaves are skipped entirely.
#[derive(Debug, Default)]
pub struct MarkupBuilder {
    out: String,
}

impl MarkupBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub const fn new() -> Self {
        Self { out: String::new() }
    }

    /// Opens an element.
    pub fn open(&mut self, name: &str) -> &mut Self {
        self.out.push('<');
        self.out.push_str(name);
        self.out.push('>');
        self
    }

    /// Closes an element.
    pub fn close(&mut self, name: &str) -> &mut Self {
        self.out.push_str("</");
        self.out.push_str(name);
        self.out.push('>');
        self
    }

    /// Writes a leaf element with escaped text.
    pub fn leaf(&mut self, name: &str, value: impl std::fmt::Display) -> &mut Self {
        let value = value.to_string();
        self.open(name);
        self.out.push_str(&escape(value.as_str()));
        self.close(name)
    }

    /// Writes a leaf element only when a value is present.
    pub fn leaf_opt<T: std::fmt::Display>(&mut self, name: &str, value: Option<T>) -> &mut Self {
        if let Some(value) = value {
            self.leaf(name, value);
        }
        self
    }

    /// Writes a leaf element only when the string is non-empty.
    pub fn leaf_non_empty(&mut self, name: &str, value: Option<&str>) -> &mut Self {
        self.leaf_opt(name, value.filter(|v| !v.is_empty()))
    }

    /// Appends pre-rendered markup verbatim.
    pub fn raw(&mut self, markup: &str) -> &mut Self {
        self.out.push_str(markup);
        self
    }

    /// Returns the rendered markup.
    #[must_use]
    pub fn finish(self) -> String {
        self.out
    }
}

/// Encodes a string map as one child element per key under `name`.
///
/// An empty map renders nothing, so the parent element is omitted.
#[must_use]
pub fn encode_string_map(name: &str, map: &BTreeMap<String, String>) -> String {
    if map.is_empty() {
        return String::new();
    }

    let mut builder = MarkupBuilder::new();
    builder.open(name);
    for (key, value) in map {
        builder.leaf(key, value);
    }
    builder.close(name);
    builder.finish()
}

/// Decodes an element's children back into a string map keyed by child name.
///
/// When a key repeats, the last occurrence wins.
#[must_use]
pub fn decode_string_map(element: &Element) -> BTreeMap<String, String> {
    element
        .children
        .iter()
        .map(|c| (c.name.clone(), c.text.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_nested_document() {
        let doc = Element::parse(
            "<?xml version=\"1.0\"?><IMAGE><ID>12</ID><NAME>base &amp; more</NAME>\
             <TEMPLATE><DEV_PREFIX><![CDATA[vd]]></DEV_PREFIX></TEMPLATE></IMAGE>",
        )
        .expect("parse failed");

        assert_eq!(doc.name, "IMAGE");
        assert_eq!(doc.child_i64("ID").expect("id"), Some(12));
        assert_eq!(doc.child_text("NAME"), Some("base & more"));
        assert_eq!(
            doc.path(&["TEMPLATE", "DEV_PREFIX"]).map(|e| e.text.as_str()),
            Some("vd")
        );
    }

    #[test]
    fn test_parse_rejects_truncated_document() {
        assert!(Element::parse("<VM><ID>1</ID>").is_err());
        assert!(Element::parse("").is_err());
    }

    #[test]
    fn test_empty_elements_are_kept() {
        let doc = Element::parse("<POOL><IMAGE/><IMAGE></IMAGE></POOL>").expect("parse failed");
        assert_eq!(doc.children_named("IMAGE").count(), 2);
    }

    #[test]
    fn test_child_i64_rejects_garbage() {
        let doc = Element::parse("<VM><STATE>x</STATE><LCM_STATE></LCM_STATE></VM>")
            .expect("parse failed");
        assert!(doc.child_i64("STATE").is_err());
        assert_eq!(doc.child_i64("LCM_STATE").expect("empty"), None);
        assert!(doc.require_i64("ID").is_err());
    }

    #[test]
    fn test_builder_skips_absent_fields() {
        let mut builder = MarkupBuilder::new();
        builder
            .open("IMAGE")
            .leaf("NAME", "a<b")
            .leaf_opt::<i64>("SIZE", None)
            .leaf_non_empty("PATH", Some(""))
            .close("IMAGE");

        assert_eq!(builder.finish(), "<IMAGE><NAME>a&lt;b</NAME></IMAGE>");
    }

    #[test]
    fn test_string_map_encodes_one_child_per_key() {
        let mut map = BTreeMap::new();
        map.insert(String::from("SSH_KEY"), String::from("ssh-rsa AAA"));
        map.insert(String::from("NETWORK"), String::from("YES"));

        let encoded = encode_string_map("CONTEXT", &map);
        assert_eq!(
            encoded,
            "<CONTEXT><NETWORK>YES</NETWORK><SSH_KEY>ssh-rsa AAA</SSH_KEY></CONTEXT>"
        );

        let decoded = decode_string_map(&Element::parse(&encoded).expect("parse failed"));
        assert_eq!(decoded, map);
    }

    #[test]
    fn test_empty_string_map_renders_nothing() {
        assert_eq!(encode_string_map("CONTEXT", &BTreeMap::new()), "");
    }
}
