//! Streaming XML decoder for XMPP.
//!
//! Turns an incoming byte stream into a sequence of [`StreamEvent`]s: the
//! opening `<stream:stream>` header, each fully materialized top-level child
//! element, and the stream close. The decoder never buffers the whole
//! stream; a stanza is held only until its end tag arrives.
//!
//! Namespace prefixes are resolved against a scoped stack, so emitted
//! elements carry fully qualified names and never raw prefixes. After
//! STARTTLS or SASL success the session requests a [`StreamDecoder::restart`];
//! any bytes already buffered past the restart boundary survive the reset.

mod tokenizer;

use std::collections::HashMap;

use thiserror::Error;

pub use tokenizer::{SaxToken, Tokenizer};

use crate::stanza::{ns, Node, QName, XmlElement};

/// Decoder failure modes.
///
/// Well-formedness failures are fatal for the stream. Unsupported XML is
/// valid XML that the XMPP profile forbids (RFC 6120 Section 11).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// The byte stream is not well-formed XML
    #[error("not well-formed: {0}")]
    WellFormedness(String),

    /// Well-formed XML that the XMPP profile rejects
    #[error("unsupported XML: {0}")]
    UnsupportedXml(String),
}

/// A decoded stream-level event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// The outer stream header start tag closed
    StreamOpen(StreamHeader),
    /// A direct child of the stream root, fully materialized
    TopLevelElement(XmlElement),
    /// The stream root's end tag arrived
    StreamClose,
}

/// Parsed attributes of a `<stream:stream>` header.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StreamHeader {
    /// The 'to' attribute (target domain)
    pub to: Option<String>,
    /// The 'from' attribute (source domain)
    pub from: Option<String>,
    /// The 'id' attribute (stream id, assigned by the receiving side)
    pub id: Option<String>,
    /// The 'version' attribute
    pub version: Option<String>,
    /// The 'xml:lang' attribute
    pub lang: Option<String>,
    /// The default content namespace declared on the header
    pub content_namespace: Option<String>,
    /// The resolved namespace of the root element itself
    pub stream_namespace: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeMode {
    /// XMPP stream framing: root is the stream header, children are stanzas
    XmppStream,
    /// Standalone document: the root element itself is the product
    Document,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Encoding {
    Utf8,
    Utf16Le,
    Utf16Be,
}

#[derive(Debug, Clone)]
struct NsScope {
    default: Option<String>,
    prefixes: HashMap<String, String>,
}

impl NsScope {
    fn empty() -> Self {
        Self {
            default: None,
            prefixes: HashMap::new(),
        }
    }
}

struct PartialElement {
    raw_name: String,
    name: QName,
    attributes: Vec<(QName, String)>,
    children: Vec<Node>,
}

struct OpenTag {
    raw_name: String,
    attributes: Vec<(String, String)>,
}

/// Streaming decoder producing [`StreamEvent`]s from fed bytes.
pub struct StreamDecoder {
    tokenizer: Tokenizer,
    mode: DecodeMode,
    input: Vec<u8>,
    consumed: usize,
    encoding: Option<Encoding>,
    pending_utf16: Option<u16>,
    carry: Vec<u8>,
    carry_pos: usize,
    scopes: Vec<NsScope>,
    stack: Vec<PartialElement>,
    open_tag: Option<OpenTag>,
    root_open: bool,
    root_raw_name: String,
    tokens: Vec<SaxToken>,
}

impl StreamDecoder {
    /// Create a decoder for an XMPP stream.
    pub fn new() -> Self {
        Self::with_mode(DecodeMode::XmppStream)
    }

    /// Create a decoder that materializes one standalone document.
    fn document() -> Self {
        Self::with_mode(DecodeMode::Document)
    }

    fn with_mode(mode: DecodeMode) -> Self {
        Self {
            tokenizer: Tokenizer::new(),
            mode,
            input: Vec::new(),
            consumed: 0,
            encoding: None,
            pending_utf16: None,
            carry: Vec::new(),
            carry_pos: 0,
            scopes: Vec::new(),
            stack: Vec::new(),
            open_tag: None,
            root_open: false,
            root_raw_name: String::new(),
            tokens: Vec::new(),
        }
    }

    /// Append raw transport bytes to the decode buffer.
    pub fn feed(&mut self, bytes: &[u8]) {
        // Reclaim consumed prefix so the buffer does not grow with the
        // lifetime of the stream.
        if self.consumed == self.input.len() {
            self.input.clear();
            self.consumed = 0;
        } else if self.consumed > 4096 {
            self.input.drain(..self.consumed);
            self.consumed = 0;
        }
        self.input.extend_from_slice(bytes);
    }

    /// Reinitialize for a fresh stream after STARTTLS or SASL success.
    ///
    /// Unconsumed buffered input survives the reset; the next bytes must
    /// begin a new prolog or stream header.
    pub fn restart(&mut self) {
        self.tokenizer.reset();
        self.scopes.clear();
        self.stack.clear();
        self.open_tag = None;
        self.root_open = false;
        self.root_raw_name.clear();
        self.encoding = None;
        self.pending_utf16 = None;
        self.carry.clear();
        self.carry_pos = 0;
        self.tokens.clear();
    }

    /// Decode the next event, consuming buffered input as needed.
    ///
    /// Returns `Ok(None)` when more bytes are required.
    pub fn next_event(&mut self) -> Result<Option<StreamEvent>, DecodeError> {
        loop {
            // Drain tokens already produced before touching more input.
            while !self.tokens.is_empty() {
                let token = self.tokens.remove(0);
                if let Some(event) = self.assemble(token)? {
                    return Ok(Some(event));
                }
            }

            if self.encoding.is_none() && !self.detect_encoding() {
                return Ok(None);
            }

            let Some(c) = self.next_utf8_byte()? else {
                return Ok(None);
            };

            self.tokenizer.feed_byte(c, &mut self.tokens)?;
        }
    }

    /// Sniff the encoding from the first buffered bytes. Returns false when
    /// more input is needed to decide.
    fn detect_encoding(&mut self) -> bool {
        let available = &self.input[self.consumed..];
        if available.len() < 2 {
            return false;
        }
        let encoding = match (available[0], available[1]) {
            (0xfe, 0xff) => {
                self.consumed += 2;
                Encoding::Utf16Be
            }
            (0xff, 0xfe) => {
                self.consumed += 2;
                Encoding::Utf16Le
            }
            (0xef, 0xbb) => {
                // The UTF-8 BOM is three bytes.
                if available.len() < 3 {
                    return false;
                }
                if available[2] == 0xbf {
                    self.consumed += 3;
                }
                Encoding::Utf8
            }
            (0x00, _) => Encoding::Utf16Be,
            (_, 0x00) => Encoding::Utf16Le,
            _ => Encoding::Utf8,
        };
        self.encoding = Some(encoding);
        true
    }

    /// Pull the next byte to feed the tokenizer, transcoding UTF-16 input.
    fn next_utf8_byte(&mut self) -> Result<Option<u8>, DecodeError> {
        match self.encoding {
            Some(Encoding::Utf8) | None => {
                if self.consumed >= self.input.len() {
                    return Ok(None);
                }
                let c = self.input[self.consumed];
                self.consumed += 1;
                Ok(Some(c))
            }
            Some(Encoding::Utf16Le) | Some(Encoding::Utf16Be) => {
                if let Some(byte) = self.pop_carry() {
                    return Ok(Some(byte));
                }
                let Some(unit) = self.next_utf16_unit() else {
                    return Ok(None);
                };
                let c = if (0xd800..0xdc00).contains(&unit) {
                    let Some(low) = self.peek_utf16_unit() else {
                        // High surrogate with its pair not yet buffered.
                        self.pending_utf16 = Some(unit);
                        return Ok(None);
                    };
                    self.advance_utf16_unit();
                    if !(0xdc00..0xe000).contains(&low) {
                        return Err(DecodeError::WellFormedness(
                            "unpaired UTF-16 surrogate".into(),
                        ));
                    }
                    let value =
                        0x10000 + ((u32::from(unit) - 0xd800) << 10) + (u32::from(low) - 0xdc00);
                    char::from_u32(value).ok_or_else(|| {
                        DecodeError::WellFormedness("invalid UTF-16 sequence".into())
                    })?
                } else if (0xdc00..0xe000).contains(&unit) {
                    return Err(DecodeError::WellFormedness(
                        "unpaired UTF-16 surrogate".into(),
                    ));
                } else {
                    char::from_u32(u32::from(unit)).ok_or_else(|| {
                        DecodeError::WellFormedness("invalid UTF-16 sequence".into())
                    })?
                };
                let mut buf = [0u8; 4];
                let encoded = c.encode_utf8(&mut buf);
                self.carry.clear();
                self.carry.extend_from_slice(encoded.as_bytes());
                self.carry_pos = 0;
                Ok(self.pop_carry())
            }
        }
    }

    fn next_utf16_unit(&mut self) -> Option<u16> {
        if let Some(unit) = self.pending_utf16.take() {
            return Some(unit);
        }
        let unit = self.peek_utf16_unit()?;
        self.advance_utf16_unit();
        Some(unit)
    }

    fn peek_utf16_unit(&self) -> Option<u16> {
        let available = &self.input[self.consumed..];
        if available.len() < 2 {
            return None;
        }
        Some(match self.encoding {
            Some(Encoding::Utf16Be) => u16::from_be_bytes([available[0], available[1]]),
            _ => u16::from_le_bytes([available[0], available[1]]),
        })
    }

    fn advance_utf16_unit(&mut self) {
        self.consumed += 2;
    }

    fn pop_carry(&mut self) -> Option<u8> {
        if self.carry_pos < self.carry.len() {
            let byte = self.carry[self.carry_pos];
            self.carry_pos += 1;
            Some(byte)
        } else {
            None
        }
    }

    /// Process one tokenizer token through the namespace-scoped assembler.
    fn assemble(&mut self, token: SaxToken) -> Result<Option<StreamEvent>, DecodeError> {
        match token {
            SaxToken::Declaration { encoding } => {
                if let Some(declared) = encoding {
                    let lowered = declared.to_ascii_lowercase();
                    if lowered != "utf-8" && lowered != "utf-16" {
                        return Err(DecodeError::UnsupportedXml(format!(
                            "unsupported encoding '{}'",
                            declared
                        )));
                    }
                }
                Ok(None)
            }

            SaxToken::StartTagName(raw_name) => {
                self.open_tag = Some(OpenTag {
                    raw_name,
                    attributes: Vec::new(),
                });
                Ok(None)
            }

            SaxToken::Attribute(name, value) => {
                let open = self.open_tag.as_mut().ok_or_else(|| {
                    DecodeError::WellFormedness("attribute outside start tag".into())
                })?;
                if open.attributes.iter().any(|(n, _)| n == &name) {
                    return Err(DecodeError::WellFormedness(format!(
                        "duplicate attribute '{}'",
                        name
                    )));
                }
                open.attributes.push((name, value));
                Ok(None)
            }

            SaxToken::StartTagClose { empty } => {
                let open = self.open_tag.take().ok_or_else(|| {
                    DecodeError::WellFormedness("start tag close without start tag".into())
                })?;
                self.handle_element_open(open, empty)
            }

            SaxToken::EndTag(raw_name) => self.handle_element_close(&raw_name),

            SaxToken::Text(text) => {
                match self.stack.last_mut() {
                    Some(parent) => match parent.children.last_mut() {
                        Some(Node::Text(prev)) => prev.push_str(&text),
                        _ => parent.children.push(Node::Text(text)),
                    },
                    None => {
                        // Whitespace between top-level children is dropped.
                        if !text.trim().is_empty() {
                            return Err(DecodeError::WellFormedness(
                                "character data between stanzas".into(),
                            ));
                        }
                    }
                }
                Ok(None)
            }
        }
    }

    fn handle_element_open(
        &mut self,
        open: OpenTag,
        empty: bool,
    ) -> Result<Option<StreamEvent>, DecodeError> {
        // Derive this element's namespace scope from the enclosing scope plus
        // its own xmlns declarations.
        let mut scope = self.scopes.last().cloned().unwrap_or_else(NsScope::empty);
        for (name, value) in &open.attributes {
            if name == "xmlns" {
                scope.default = if value.is_empty() {
                    None
                } else {
                    Some(value.clone())
                };
            } else if let Some(prefix) = name.strip_prefix("xmlns:") {
                if prefix.is_empty() {
                    return Err(DecodeError::WellFormedness(
                        "empty namespace prefix declaration".into(),
                    ));
                }
                scope.prefixes.insert(prefix.to_string(), value.clone());
            }
        }

        let name = resolve_name(&open.raw_name, &scope, true)?;

        let mut attributes = Vec::with_capacity(open.attributes.len());
        for (attr_name, value) in open.attributes {
            if attr_name == "xmlns" || attr_name.starts_with("xmlns:") {
                continue;
            }
            let qname = resolve_name(&attr_name, &scope, false)?;
            attributes.push((qname, value));
        }

        let is_stream_root =
            self.mode == DecodeMode::XmppStream && !self.root_open && self.stack.is_empty();

        if is_stream_root {
            self.root_open = true;
            self.root_raw_name = open.raw_name.clone();
            let header = build_stream_header(&name, &attributes, &scope);
            self.scopes.push(scope);
            if empty {
                // A degenerate `<stream:stream/>`: open, then close on the
                // next poll.
                self.tokens.insert(0, SaxToken::EndTag(open.raw_name));
            }
            return Ok(Some(StreamEvent::StreamOpen(header)));
        }

        let partial = PartialElement {
            raw_name: open.raw_name,
            name,
            attributes,
            children: Vec::new(),
        };

        if empty {
            let element = XmlElement::from_parts(partial.name, partial.attributes, Vec::new());
            return Ok(self.attach_or_emit(element));
        }

        self.scopes.push(scope);
        self.stack.push(partial);
        Ok(None)
    }

    fn handle_element_close(&mut self, raw_name: &str) -> Result<Option<StreamEvent>, DecodeError> {
        match self.stack.pop() {
            Some(partial) => {
                if partial.raw_name != raw_name {
                    return Err(DecodeError::WellFormedness(format!(
                        "end tag '{}' does not match open tag '{}'",
                        raw_name, partial.raw_name
                    )));
                }
                self.scopes.pop();
                let element =
                    XmlElement::from_parts(partial.name, partial.attributes, partial.children);
                Ok(self.attach_or_emit(element))
            }
            None => {
                // Only the stream root can close at depth zero.
                if self.mode == DecodeMode::XmppStream && self.root_open {
                    if raw_name != self.root_raw_name {
                        return Err(DecodeError::WellFormedness(format!(
                            "end tag '{}' does not match stream root '{}'",
                            raw_name, self.root_raw_name
                        )));
                    }
                    self.root_open = false;
                    self.scopes.pop();
                    return Ok(Some(StreamEvent::StreamClose));
                }
                Err(DecodeError::WellFormedness(
                    "end tag without matching start tag".into(),
                ))
            }
        }
    }

    fn attach_or_emit(&mut self, element: XmlElement) -> Option<StreamEvent> {
        match self.stack.last_mut() {
            Some(parent) => {
                parent.children.push(Node::Element(element));
                None
            }
            None => Some(StreamEvent::TopLevelElement(element)),
        }
    }
}

impl Default for StreamDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolve a possibly prefixed name against the namespace scope.
///
/// For elements, the default namespace applies to unprefixed names; for
/// attributes, unprefixed names are in no namespace.
fn resolve_name(raw: &str, scope: &NsScope, is_element: bool) -> Result<QName, DecodeError> {
    match raw.split_once(':') {
        Some((prefix, local)) => {
            if prefix.is_empty() || local.is_empty() || local.contains(':') {
                return Err(DecodeError::WellFormedness(format!(
                    "invalid qualified name '{}'",
                    raw
                )));
            }
            if prefix == "xml" {
                return Ok(QName::new(local, Some(ns::XML)));
            }
            match scope.prefixes.get(prefix) {
                Some(uri) => Ok(QName::new(local, Some(uri.as_str()))),
                None => Err(DecodeError::WellFormedness(format!(
                    "unbound namespace prefix '{}'",
                    prefix
                ))),
            }
        }
        None => {
            let namespace = if is_element {
                scope.default.clone()
            } else {
                None
            };
            Ok(QName::new(raw, namespace.as_deref()))
        }
    }
}

fn build_stream_header(
    name: &QName,
    attributes: &[(QName, String)],
    scope: &NsScope,
) -> StreamHeader {
    let attr = |local: &str| {
        attributes
            .iter()
            .find(|(qname, _)| qname.local() == local && qname.namespace().is_none())
            .map(|(_, value)| value.clone())
    };
    let lang = attributes
        .iter()
        .find(|(qname, _)| qname.local() == "lang" && qname.namespace() == Some(ns::XML))
        .map(|(_, value)| value.clone());

    StreamHeader {
        to: attr("to"),
        from: attr("from"),
        id: attr("id"),
        version: attr("version"),
        lang,
        content_namespace: scope.default.clone(),
        stream_namespace: name.namespace().map(str::to_owned),
    }
}

/// Parse a complete standalone XML document into an element.
///
/// Used for BOSH `<body/>` envelopes and by tests; the stream decoder itself
/// never materializes the stream root.
pub fn parse_element_str(input: &str) -> Result<XmlElement, DecodeError> {
    let mut decoder = StreamDecoder::document();
    decoder.feed(input.as_bytes());
    match decoder.next_event()? {
        Some(StreamEvent::TopLevelElement(element)) => Ok(element),
        _ => Err(DecodeError::WellFormedness(
            "input is not a complete document".into(),
        )),
    }
}
