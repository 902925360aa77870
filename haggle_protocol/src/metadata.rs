// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! The metadata tree and its wire codec.
//!
//! Metadata is the canonical wire form of a data object header: a rooted tree
//! of named nodes, each with optional text content, an insertion-ordered
//! parameter map and an insertion-ordered child list. The wire form is the
//! small XML subset described by the protocol: elements, attributes, text
//! content and the five named entities. The codec is strict; anything else is
//! a parse error, never a guess.

use crate::error::{Error, Result};
use std::fmt::Write as _;

/// Root element name of every data object header.
pub const HAGGLE_ROOT_NAME: &str = "Haggle";

/// The closing root tag, matched case-insensitively byte-for-byte when
/// scanning an incoming stream for the end of the header.
const HEADER_TERMINATOR: &[u8] = b"</haggle>";

/// Finds the end of a metadata header in `buf`, returning the index one past
/// the closing root tag. Comparison is byte-wise ASCII case folding; no
/// locale-dependent case rules are involved.
pub fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(HEADER_TERMINATOR.len())
        .position(|w| w.eq_ignore_ascii_case(HEADER_TERMINATOR))
        .map(|pos| pos + HEADER_TERMINATOR.len())
}

/// A node in the metadata tree.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Metadata {
    name: String,
    content: Option<String>,
    parameters: Vec<(String, String)>,
    children: Vec<Metadata>,
}

impl Metadata {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_content(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content: Some(content.into()),
            ..Default::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn content(&self) -> Option<&str> {
        self.content.as_deref()
    }

    pub fn set_content(&mut self, content: impl Into<String>) {
        self.content = Some(content.into());
    }

    /// Sets a parameter, replacing in place so insertion order is kept.
    pub fn set_parameter(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.parameters.iter_mut().find(|(n, _)| *n == name) {
            Some((_, v)) => *v = value,
            None => self.parameters.push((name, value)),
        }
    }

    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn parameters(&self) -> impl Iterator<Item = (&str, &str)> {
        self.parameters.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Appends a child and returns a handle to it for further population.
    pub fn add_child(&mut self, child: Metadata) -> &mut Metadata {
        self.children.push(child);
        self.children.last_mut().expect("just pushed")
    }

    /// First child with the given name, in insertion order.
    pub fn child(&self, name: &str) -> Option<&Metadata> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn child_mut(&mut self, name: &str) -> Option<&mut Metadata> {
        self.children.iter_mut().find(|c| c.name == name)
    }

    /// All children with the given name, in insertion order.
    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Metadata> {
        self.children.iter().filter(move |c| c.name == name)
    }

    pub fn children(&self) -> impl Iterator<Item = &Metadata> {
        self.children.iter()
    }

    /// Removes the first child with the given name.
    pub fn remove_first_child(&mut self, name: &str) -> bool {
        match self.children.iter().position(|c| c.name == name) {
            Some(idx) => {
                let _ = self.children.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Removes every child with the given name, returning how many went.
    pub fn remove_children(&mut self, name: &str) -> usize {
        let before = self.children.len();
        self.children.retain(|c| c.name != name);
        before - self.children.len()
    }

    /// Serializes the tree to its wire form. Deterministic for a fixed tree:
    /// parameters and children are rendered in insertion order.
    pub fn to_wire(&self) -> Vec<u8> {
        let mut out = String::from("<?xml version=\"1.0\"?>\n");
        self.write_element(&mut out);
        out.push('\n');
        out.into_bytes()
    }

    fn write_element(&self, out: &mut String) {
        let _ = write!(out, "<{}", self.name);
        for (name, value) in &self.parameters {
            let _ = write!(out, " {}=\"{}\"", name, escape(value));
        }
        if self.content.is_none() && self.children.is_empty() {
            out.push_str("/>");
            return;
        }
        out.push('>');
        if let Some(content) = &self.content {
            out.push_str(&escape(content));
        }
        for child in &self.children {
            child.write_element(out);
        }
        let _ = write!(out, "</{}>", self.name);
    }

    /// Parses a metadata tree from its wire form.
    pub fn parse(raw: &[u8]) -> Result<Self> {
        let mut parser = Parser { buf: raw, pos: 0 };
        parser.skip_prolog()?;
        let root = parser.parse_element()?;
        parser.skip_whitespace();
        if parser.pos != parser.buf.len() {
            return Err(Error::MetadataParse(format!(
                "trailing bytes after root element at offset {}",
                parser.pos
            )));
        }
        Ok(root)
    }

    /// Parses a data object header: like [`Metadata::parse`] but the root
    /// element must be named `Haggle`.
    pub fn parse_header(raw: &[u8]) -> Result<Self> {
        let root = Self::parse(raw)?;
        if root.name != HAGGLE_ROOT_NAME {
            return Err(Error::UnexpectedRoot {
                expected: HAGGLE_ROOT_NAME.to_string(),
                got: root.name,
            });
        }
        Ok(root)
    }
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

struct Parser<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn err(&self, msg: impl Into<String>) -> Error {
        Error::MetadataParse(format!("{} at offset {}", msg.into(), self.pos))
    }

    fn peek(&self) -> Option<u8> {
        self.buf.get(self.pos).copied()
    }

    fn bump(&mut self) -> Result<u8> {
        let b = self.peek().ok_or_else(|| self.err("unexpected end of input"))?;
        self.pos += 1;
        Ok(b)
    }

    fn expect(&mut self, b: u8) -> Result<()> {
        match self.bump()? {
            got if got == b => Ok(()),
            got => Err(self.err(format!("expected {:?}, found {:?}", b as char, got as char))),
        }
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.peek(), Some(b) if b.is_ascii_whitespace()) {
            self.pos += 1;
        }
    }

    /// Skips an optional `<?xml ...?>` declaration and surrounding space.
    fn skip_prolog(&mut self) -> Result<()> {
        self.skip_whitespace();
        if self.buf[self.pos..].starts_with(b"<?") {
            match self.buf[self.pos..].windows(2).position(|w| w == b"?>") {
                Some(end) => self.pos += end + 2,
                None => return Err(self.err("unterminated xml declaration")),
            }
        }
        self.skip_whitespace();
        Ok(())
    }

    fn parse_name(&mut self) -> Result<String> {
        let start = self.pos;
        while matches!(self.peek(), Some(b) if b.is_ascii_alphanumeric() || b == b'_' || b == b'-' || b == b':')
        {
            self.pos += 1;
        }
        if self.pos == start {
            return Err(self.err("expected a name"));
        }
        Ok(String::from_utf8_lossy(&self.buf[start..self.pos]).into_owned())
    }

    fn parse_element(&mut self) -> Result<Metadata> {
        self.expect(b'<')?;
        let name = self.parse_name()?;
        let mut element = Metadata::new(&name);

        // Parameters up to `>` or `/>`.
        loop {
            self.skip_whitespace();
            match self.peek() {
                Some(b'/') => {
                    self.pos += 1;
                    self.expect(b'>')?;
                    return Ok(element);
                }
                Some(b'>') => {
                    self.pos += 1;
                    break;
                }
                Some(_) => {
                    let pname = self.parse_name()?;
                    self.skip_whitespace();
                    self.expect(b'=')?;
                    self.skip_whitespace();
                    let quote = self.bump()?;
                    if quote != b'"' && quote != b'\'' {
                        return Err(self.err("parameter value must be quoted"));
                    }
                    let start = self.pos;
                    while self.peek() != Some(quote) {
                        if self.peek().is_none() {
                            return Err(self.err("unterminated parameter value"));
                        }
                        self.pos += 1;
                    }
                    let value = unescape(&self.buf[start..self.pos])
                        .map_err(|msg| self.err(msg))?;
                    self.pos += 1; // closing quote
                    element.set_parameter(pname, value);
                }
                None => return Err(self.err("unexpected end of input in tag")),
            }
        }

        // Content: interleaved text and child elements up to the close tag.
        let mut text = Vec::new();
        loop {
            match self.peek() {
                Some(b'<') => {
                    if self.buf[self.pos..].starts_with(b"</") {
                        self.pos += 2;
                        let close = self.parse_name()?;
                        if close != name {
                            return Err(self.err(format!(
                                "close tag {close:?} does not match open tag {name:?}"
                            )));
                        }
                        self.skip_whitespace();
                        self.expect(b'>')?;
                        break;
                    }
                    let child = self.parse_element()?;
                    let _ = element.add_child(child);
                }
                Some(b) => {
                    text.push(b);
                    self.pos += 1;
                }
                None => return Err(self.err(format!("element {name:?} never closed"))),
            }
        }

        let text = unescape(&text).map_err(|msg| self.err(msg))?;
        let trimmed = text.trim();
        if !trimmed.is_empty() {
            element.set_content(trimmed);
        }
        Ok(element)
    }
}

fn unescape(raw: &[u8]) -> Result<String, String> {
    let raw = String::from_utf8_lossy(raw);
    if !raw.contains('&') {
        return Ok(raw.into_owned());
    }
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw.as_ref();
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        rest = &rest[amp..];
        let semi = rest
            .find(';')
            .ok_or_else(|| "unterminated entity".to_string())?;
        match &rest[..=semi] {
            "&amp;" => out.push('&'),
            "&lt;" => out.push('<'),
            "&gt;" => out.push('>'),
            "&quot;" => out.push('"'),
            "&apos;" => out.push('\''),
            other => return Err(format!("unknown entity {other:?}")),
        }
        rest = &rest[semi + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::Result;

    #[test]
    fn round_trip_preserves_structure_and_order() -> Result<()> {
        let mut md = Metadata::new(HAGGLE_ROOT_NAME);
        md.set_parameter("persistent", "no");
        md.set_parameter("create_time", "1700000000.000000");
        let attr = md.add_child(Metadata::with_content("Attr", "Cat"));
        attr.set_parameter("name", "Animal");
        let data = md.add_child(Metadata::new("Data"));
        data.set_parameter("data_len", "42");
        let _ = data.add_child(Metadata::with_content("FileName", "cat.jpg"));

        let wire = md.to_wire();
        let parsed = Metadata::parse_header(&wire)?;
        assert_eq!(parsed, md);

        // Serialization is deterministic.
        assert_eq!(parsed.to_wire(), wire);
        Ok(())
    }

    #[test]
    fn strict_on_root_name() {
        let wire = Metadata::new("NotHaggle").to_wire();
        assert!(matches!(
            Metadata::parse_header(&wire),
            Err(Error::UnexpectedRoot { .. })
        ));
    }

    #[test]
    fn rejects_malformed_input() {
        for bad in [
            &b"<Haggle>"[..],
            b"<Haggle></Wrong>",
            b"<Haggle a=unquoted></Haggle>",
            b"<Haggle>&bogus;</Haggle>",
            b"<Haggle/><Haggle/>",
        ] {
            assert!(Metadata::parse(bad).is_err(), "{bad:?} should not parse");
        }
    }

    #[test]
    fn escaping_round_trips() -> Result<()> {
        let mut md = Metadata::new(HAGGLE_ROOT_NAME);
        md.set_content("a < b && \"c\"");
        md.set_parameter("p", "x'y<z>");
        let parsed = Metadata::parse(&md.to_wire())?;
        assert_eq!(parsed.content(), Some("a < b && \"c\""));
        assert_eq!(parsed.parameter("p"), Some("x'y<z>"));
        Ok(())
    }

    #[test]
    fn header_end_is_case_insensitive() {
        let buf = b"<Haggle><Attr name=\"x\">y</Attr></hAgGlE>payload bytes";
        let end = find_header_end(buf).expect("terminator present");
        assert_eq!(&buf[end..], b"payload bytes");

        assert!(find_header_end(b"<Haggle><Attr/>").is_none());
    }

    #[test]
    fn children_iterate_in_insertion_order() {
        let mut md = Metadata::new("root");
        let _ = md.add_child(Metadata::with_content("Attr", "first"));
        let _ = md.add_child(Metadata::with_content("Other", "x"));
        let _ = md.add_child(Metadata::with_content("Attr", "second"));

        let contents: Vec<_> = md
            .children_named("Attr")
            .filter_map(|c| c.content())
            .collect();
        assert_eq!(contents, ["first", "second"]);

        assert_eq!(md.remove_children("Attr"), 2);
        assert!(md.child("Attr").is_none());
    }
}
