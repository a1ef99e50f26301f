//! Byte-driven XML tokenizer for XMPP streams.
//!
//! A push tokenizer: bytes go in one at a time, SAX-style tokens come out.
//! The tokenizer never buffers more than the current name, attribute value,
//! or text run, so it can process an unbounded stream.
//!
//! The XMPP profile of XML (RFC 6120 Section 11) narrows what is accepted:
//! processing instructions (other than the initial XML declaration), DOCTYPE
//! declarations, comments, CDATA sections, and non-predefined entity
//! references are reported as [`DecodeError::UnsupportedXml`] rather than
//! being parsed.

use super::DecodeError;

/// A low-level token produced by the tokenizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaxToken {
    /// The `<?xml ...?>` declaration, with its encoding pseudo-attribute.
    Declaration {
        /// Value of the `encoding` pseudo-attribute, if present
        encoding: Option<String>,
    },
    /// A start tag name as written, possibly prefixed (`stream:stream`).
    StartTagName(String),
    /// One attribute of the currently open start tag.
    Attribute(String, String),
    /// End of the start tag. `empty` marks `<name/>` forms.
    StartTagClose {
        /// True for self-closing tags
        empty: bool,
    },
    /// An end tag name as written.
    EndTag(String),
    /// A run of character data with references already resolved.
    Text(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Prolog,
    TagStart,
    Declaration,
    DeclarationQ,
    TagName,
    EndTagWhitespace,
    AttrWhitespace,
    AttrName,
    AttrEq,
    AttrValueStart,
    AttrValue,
    EmptyTagEnd,
    Text,
    Reference,
    Entity,
    CharRefStart,
    CharRefDec,
    CharRefHex,
    Epilog,
}

const MAX_ENTITY_NAME: usize = 8;
const MAX_CODEPOINT: u32 = 0x10_FFFF;

fn is_whitespace(c: u8) -> bool {
    matches!(c, b' ' | b'\t' | b'\r' | b'\n')
}

fn is_valid_xml_char(c: u32) -> bool {
    matches!(c, 0x09 | 0x0a | 0x0d | 0x20..=0xd7ff | 0xe000..=0xfffd | 0x1_0000..=0x10_ffff)
}

/// Incremental XML tokenizer.
pub struct Tokenizer {
    state: State,
    depth: usize,
    seen_root: bool,
    seen_declaration: bool,
    is_end_tag: bool,
    quote: u8,
    buffer: Vec<u8>,
    text: Vec<u8>,
    attr_name: String,
    ref_buffer: Vec<u8>,
    char_ref_value: u32,
    char_ref_digits: u32,
    is_value_ref: bool,
}

impl Tokenizer {
    /// Create a tokenizer positioned before the document prolog.
    pub fn new() -> Self {
        Self {
            state: State::Prolog,
            depth: 0,
            seen_root: false,
            seen_declaration: false,
            is_end_tag: false,
            quote: 0,
            buffer: Vec::with_capacity(64),
            text: Vec::with_capacity(256),
            attr_name: String::new(),
            ref_buffer: Vec::with_capacity(MAX_ENTITY_NAME),
            char_ref_value: 0,
            char_ref_digits: 0,
            is_value_ref: false,
        }
    }

    /// Reset to the pre-prolog state, dropping any partial construct.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Current element nesting depth.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Feed one byte, appending any completed tokens to `out`.
    pub fn feed_byte(&mut self, c: u8, out: &mut Vec<SaxToken>) -> Result<(), DecodeError> {
        if c < 0x20 && !matches!(c, 0x09 | 0x0a | 0x0d) {
            return Err(DecodeError::WellFormedness(format!(
                "control character 0x{:02x} in stream",
                c
            )));
        }

        match self.state {
            State::Prolog => match c {
                b'<' => self.state = State::TagStart,
                c if is_whitespace(c) => {}
                _ => {
                    return Err(DecodeError::WellFormedness(
                        "character data before root element".into(),
                    ));
                }
            },

            State::TagStart => match c {
                b'!' => {
                    return Err(DecodeError::UnsupportedXml(
                        "markup declarations (DOCTYPE, comments, CDATA) are not allowed".into(),
                    ));
                }
                b'?' => {
                    if self.seen_declaration || self.seen_root {
                        return Err(DecodeError::UnsupportedXml(
                            "processing instructions are not allowed".into(),
                        ));
                    }
                    self.buffer.clear();
                    self.state = State::Declaration;
                }
                b'/' => {
                    if self.depth == 0 {
                        return Err(DecodeError::WellFormedness(
                            "end tag without matching start tag".into(),
                        ));
                    }
                    self.is_end_tag = true;
                    self.buffer.clear();
                    self.state = State::TagName;
                }
                b'>' => {
                    return Err(DecodeError::WellFormedness("empty tag name".into()));
                }
                c if is_whitespace(c) => {
                    return Err(DecodeError::WellFormedness(
                        "whitespace at tag start".into(),
                    ));
                }
                _ => {
                    if self.depth == 0 && self.seen_root {
                        return Err(DecodeError::WellFormedness(
                            "element after root element closed".into(),
                        ));
                    }
                    self.is_end_tag = false;
                    self.seen_root = true;
                    self.buffer.clear();
                    self.buffer.push(c);
                    self.state = State::TagName;
                }
            },

            State::Declaration => match c {
                b'?' => self.state = State::DeclarationQ,
                _ => self.buffer.push(c),
            },

            State::DeclarationQ => match c {
                b'>' => {
                    let token = self.finish_declaration()?;
                    out.push(token);
                    self.seen_declaration = true;
                    self.state = State::Prolog;
                }
                _ => {
                    self.buffer.push(b'?');
                    self.buffer.push(c);
                    self.state = State::Declaration;
                }
            },

            State::TagName => match c {
                b'/' | b'>' | b' ' | b'\t' | b'\r' | b'\n' => {
                    if self.buffer.is_empty() {
                        return Err(DecodeError::WellFormedness("empty tag name".into()));
                    }
                    let name = self.take_buffer_string()?;
                    if self.is_end_tag {
                        if c == b'/' {
                            return Err(DecodeError::WellFormedness(
                                "'/' inside end tag".into(),
                            ));
                        }
                        if c == b'>' {
                            self.emit_end_tag(name, out)?;
                        } else {
                            self.attr_name = name;
                            self.state = State::EndTagWhitespace;
                        }
                    } else {
                        self.flush_text(out)?;
                        out.push(SaxToken::StartTagName(name));
                        match c {
                            b'/' => self.state = State::EmptyTagEnd,
                            b'>' => self.emit_start_tag_close(false, out),
                            _ => self.state = State::AttrWhitespace,
                        }
                    }
                }
                _ => self.buffer.push(c),
            },

            State::EndTagWhitespace => match c {
                b'>' => {
                    let name = std::mem::take(&mut self.attr_name);
                    self.emit_end_tag(name, out)?;
                }
                c if is_whitespace(c) => {}
                _ => {
                    return Err(DecodeError::WellFormedness(
                        "attributes are not allowed in an end tag".into(),
                    ));
                }
            },

            State::AttrWhitespace => match c {
                c if is_whitespace(c) => {}
                b'/' => self.state = State::EmptyTagEnd,
                b'>' => self.emit_start_tag_close(false, out),
                b'=' | b'\'' | b'"' | b'<' => {
                    return Err(DecodeError::WellFormedness(
                        "invalid character in attribute name".into(),
                    ));
                }
                _ => {
                    self.buffer.clear();
                    self.buffer.push(c);
                    self.state = State::AttrName;
                }
            },

            State::AttrName => match c {
                b'=' => {
                    self.attr_name = self.take_buffer_string()?;
                    self.state = State::AttrValueStart;
                }
                c if is_whitespace(c) => {
                    self.attr_name = self.take_buffer_string()?;
                    self.state = State::AttrEq;
                }
                b'/' | b'>' | b'<' | b'\'' | b'"' => {
                    return Err(DecodeError::WellFormedness(
                        "invalid character in attribute name".into(),
                    ));
                }
                _ => self.buffer.push(c),
            },

            State::AttrEq => match c {
                b'=' => self.state = State::AttrValueStart,
                c if is_whitespace(c) => {}
                _ => {
                    return Err(DecodeError::WellFormedness(
                        "attribute without '='".into(),
                    ));
                }
            },

            State::AttrValueStart => match c {
                b'\'' | b'"' => {
                    self.quote = c;
                    self.buffer.clear();
                    self.state = State::AttrValue;
                }
                c if is_whitespace(c) => {}
                _ => {
                    return Err(DecodeError::WellFormedness(
                        "attribute value must be quoted".into(),
                    ));
                }
            },

            State::AttrValue => {
                if c == self.quote {
                    let value = self.take_buffer_string()?;
                    let name = std::mem::take(&mut self.attr_name);
                    out.push(SaxToken::Attribute(name, value));
                    self.state = State::AttrWhitespace;
                } else if c == b'&' {
                    self.ref_buffer.clear();
                    self.is_value_ref = true;
                    self.state = State::Reference;
                } else if c == b'<' {
                    return Err(DecodeError::WellFormedness(
                        "'<' in attribute value".into(),
                    ));
                } else {
                    self.buffer.push(c);
                }
            }

            State::EmptyTagEnd => match c {
                b'>' => self.emit_start_tag_close(true, out),
                _ => {
                    return Err(DecodeError::WellFormedness(
                        "expected '>' after '/'".into(),
                    ));
                }
            },

            State::Text => match c {
                b'<' => self.state = State::TagStart,
                b'&' => {
                    self.ref_buffer.clear();
                    self.is_value_ref = false;
                    self.state = State::Reference;
                }
                _ => self.text.push(c),
            },

            State::Reference => match c {
                b'#' => {
                    self.char_ref_value = 0;
                    self.char_ref_digits = 0;
                    self.state = State::CharRefStart;
                }
                _ => {
                    self.ref_buffer.push(c);
                    self.state = State::Entity;
                }
            },

            State::Entity => match c {
                b';' => {
                    let resolved = match self.ref_buffer.as_slice() {
                        b"amp" => '&',
                        b"lt" => '<',
                        b"gt" => '>',
                        b"quot" => '"',
                        b"apos" => '\'',
                        _ => {
                            return Err(DecodeError::UnsupportedXml(
                                "entity references beyond the predefined five are not allowed"
                                    .into(),
                            ));
                        }
                    };
                    self.push_resolved_char(resolved);
                    self.leave_reference();
                }
                _ => {
                    if self.ref_buffer.len() >= MAX_ENTITY_NAME {
                        return Err(DecodeError::UnsupportedXml(
                            "entity references beyond the predefined five are not allowed".into(),
                        ));
                    }
                    self.ref_buffer.push(c);
                }
            },

            State::CharRefStart => match c {
                b'x' => self.state = State::CharRefHex,
                b'0'..=b'9' => {
                    self.char_ref_value = u32::from(c - b'0');
                    self.char_ref_digits = 1;
                    self.state = State::CharRefDec;
                }
                _ => {
                    return Err(DecodeError::WellFormedness(
                        "invalid character reference".into(),
                    ));
                }
            },

            State::CharRefDec => match c {
                b';' => self.finish_char_ref()?,
                b'0'..=b'9' => self.push_char_ref_digit(u32::from(c - b'0'), 10)?,
                _ => {
                    return Err(DecodeError::WellFormedness(
                        "invalid decimal character reference".into(),
                    ));
                }
            },

            State::CharRefHex => match c {
                b';' => self.finish_char_ref()?,
                b'0'..=b'9' => self.push_char_ref_digit(u32::from(c - b'0'), 16)?,
                b'a'..=b'f' => self.push_char_ref_digit(u32::from(c - b'a') + 10, 16)?,
                b'A'..=b'F' => self.push_char_ref_digit(u32::from(c - b'A') + 10, 16)?,
                _ => {
                    return Err(DecodeError::WellFormedness(
                        "invalid hexadecimal character reference".into(),
                    ));
                }
            },

            State::Epilog => match c {
                b'<' => self.state = State::TagStart,
                c if is_whitespace(c) => {}
                _ => {
                    return Err(DecodeError::WellFormedness(
                        "character data after root element".into(),
                    ));
                }
            },
        }

        Ok(())
    }

    fn emit_start_tag_close(&mut self, empty: bool, out: &mut Vec<SaxToken>) {
        out.push(SaxToken::StartTagClose { empty });
        if empty {
            self.state = if self.depth == 0 {
                State::Epilog
            } else {
                State::Text
            };
        } else {
            self.depth += 1;
            self.state = State::Text;
        }
    }

    fn emit_end_tag(
        &mut self,
        name: String,
        out: &mut Vec<SaxToken>,
    ) -> Result<(), DecodeError> {
        if self.depth == 0 {
            return Err(DecodeError::WellFormedness(
                "end tag without matching start tag".into(),
            ));
        }
        self.flush_text(out)?;
        out.push(SaxToken::EndTag(name));
        self.depth -= 1;
        self.state = if self.depth == 0 {
            State::Epilog
        } else {
            State::Text
        };
        Ok(())
    }

    fn flush_text(&mut self, out: &mut Vec<SaxToken>) -> Result<(), DecodeError> {
        if self.text.is_empty() {
            return Ok(());
        }
        let bytes = std::mem::take(&mut self.text);
        let text = String::from_utf8(bytes)
            .map_err(|_| DecodeError::WellFormedness("invalid UTF-8 in character data".into()))?;
        out.push(SaxToken::Text(text));
        Ok(())
    }

    fn take_buffer_string(&mut self) -> Result<String, DecodeError> {
        let bytes = std::mem::take(&mut self.buffer);
        String::from_utf8(bytes)
            .map_err(|_| DecodeError::WellFormedness("invalid UTF-8 in markup".into()))
    }

    fn push_resolved_char(&mut self, c: char) {
        let mut encoded = [0u8; 4];
        let encoded = c.encode_utf8(&mut encoded);
        if self.is_value_ref {
            self.buffer.extend_from_slice(encoded.as_bytes());
        } else {
            self.text.extend_from_slice(encoded.as_bytes());
        }
    }

    fn leave_reference(&mut self) {
        self.state = if self.is_value_ref {
            State::AttrValue
        } else {
            State::Text
        };
    }

    fn push_char_ref_digit(&mut self, digit: u32, radix: u32) -> Result<(), DecodeError> {
        self.char_ref_value = self
            .char_ref_value
            .saturating_mul(radix)
            .saturating_add(digit);
        self.char_ref_digits += 1;
        if self.char_ref_value > MAX_CODEPOINT {
            return Err(DecodeError::WellFormedness(
                "character reference out of range".into(),
            ));
        }
        Ok(())
    }

    fn finish_char_ref(&mut self) -> Result<(), DecodeError> {
        if self.char_ref_digits == 0 {
            return Err(DecodeError::WellFormedness(
                "empty character reference".into(),
            ));
        }
        if !is_valid_xml_char(self.char_ref_value) {
            return Err(DecodeError::WellFormedness(
                "character reference to invalid XML character".into(),
            ));
        }
        let c = char::from_u32(self.char_ref_value).ok_or_else(|| {
            DecodeError::WellFormedness("character reference to invalid XML character".into())
        })?;
        self.push_resolved_char(c);
        self.leave_reference();
        Ok(())
    }

    fn finish_declaration(&mut self) -> Result<SaxToken, DecodeError> {
        let content = self.take_buffer_string()?;
        let trimmed = content.trim_start();
        let is_xml_decl = trimmed
            .strip_prefix("xml")
            .map(|rest| rest.is_empty() || rest.starts_with(|c: char| c.is_ascii_whitespace()))
            .unwrap_or(false);
        if !is_xml_decl {
            return Err(DecodeError::UnsupportedXml(
                "processing instructions are not allowed".into(),
            ));
        }
        Ok(SaxToken::Declaration {
            encoding: extract_pseudo_attr(trimmed, "encoding"),
        })
    }
}

impl Default for Tokenizer {
    fn default() -> Self {
        Self::new()
    }
}

/// Extract a pseudo-attribute value from XML declaration content.
fn extract_pseudo_attr(content: &str, name: &str) -> Option<String> {
    for quote in ['\'', '"'] {
        let pattern = format!("{}={}", name, quote);
        if let Some(start) = content.find(&pattern) {
            let value_start = start + pattern.len();
            if let Some(len) = content[value_start..].find(quote) {
                return Some(content[value_start..value_start + len].to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokenize(input: &str) -> Result<Vec<SaxToken>, DecodeError> {
        let mut tokenizer = Tokenizer::new();
        let mut out = Vec::new();
        for &b in input.as_bytes() {
            tokenizer.feed_byte(b, &mut out)?;
        }
        Ok(out)
    }

    #[test]
    fn simple_element() {
        let tokens = tokenize("<message to='a@b' type='chat'><body>hi</body></message>").unwrap();
        assert_eq!(
            tokens,
            vec![
                SaxToken::StartTagName("message".into()),
                SaxToken::Attribute("to".into(), "a@b".into()),
                SaxToken::Attribute("type".into(), "chat".into()),
                SaxToken::StartTagClose { empty: false },
                SaxToken::StartTagName("body".into()),
                SaxToken::StartTagClose { empty: false },
                SaxToken::Text("hi".into()),
                SaxToken::EndTag("body".into()),
                SaxToken::EndTag("message".into()),
            ]
        );
    }

    #[test]
    fn self_closing_tag() {
        let tokens = tokenize("<stream:features><starttls/></stream:features>").unwrap();
        assert!(tokens.contains(&SaxToken::StartTagName("starttls".into())));
        assert!(tokens.contains(&SaxToken::StartTagClose { empty: true }));
    }

    #[test]
    fn declaration_with_encoding() {
        let tokens = tokenize("<?xml version='1.0' encoding='UTF-8'?><a/>").unwrap();
        assert_eq!(
            tokens[0],
            SaxToken::Declaration {
                encoding: Some("UTF-8".into())
            }
        );
    }

    #[test]
    fn predefined_entities_resolve() {
        let tokens = tokenize("<a>&amp;&lt;&gt;&quot;&apos;</a>").unwrap();
        assert!(tokens.contains(&SaxToken::Text("&<>\"'".into())));
    }

    #[test]
    fn char_references_resolve() {
        let tokens = tokenize("<a>&#65;&#x42;</a>").unwrap();
        assert!(tokens.contains(&SaxToken::Text("AB".into())));
    }

    #[test]
    fn entity_in_attribute_value() {
        let tokens = tokenize("<a v='x&amp;y'/>").unwrap();
        assert!(tokens.contains(&SaxToken::Attribute("v".into(), "x&y".into())));
    }

    #[test]
    fn doctype_is_unsupported() {
        let err = tokenize("<!DOCTYPE html><a/>").unwrap_err();
        assert!(matches!(err, DecodeError::UnsupportedXml(_)));
    }

    #[test]
    fn comment_is_unsupported() {
        let err = tokenize("<a><!-- hidden --></a>").unwrap_err();
        assert!(matches!(err, DecodeError::UnsupportedXml(_)));
    }

    #[test]
    fn processing_instruction_inside_document_is_unsupported() {
        let err = tokenize("<a><?php evil(); ?></a>").unwrap_err();
        assert!(matches!(err, DecodeError::UnsupportedXml(_)));
    }

    #[test]
    fn custom_entity_is_unsupported() {
        let err = tokenize("<a>&external;</a>").unwrap_err();
        assert!(matches!(err, DecodeError::UnsupportedXml(_)));
    }

    #[test]
    fn mismatched_end_without_open_is_error() {
        let err = tokenize("</a>").unwrap_err();
        assert!(matches!(err, DecodeError::WellFormedness(_)));
    }

    #[test]
    fn unquoted_attribute_is_error() {
        let err = tokenize("<a v=1/>").unwrap_err();
        assert!(matches!(err, DecodeError::WellFormedness(_)));
    }

    #[test]
    fn text_before_root_is_error() {
        let err = tokenize("hello<a/>").unwrap_err();
        assert!(matches!(err, DecodeError::WellFormedness(_)));
    }

    #[test]
    fn split_feeding_produces_same_tokens() {
        let input = "<message to='a@b'><body>hello world</body></message>";
        let whole = tokenize(input).unwrap();

        let mut tokenizer = Tokenizer::new();
        let mut split = Vec::new();
        let (head, tail) = input.as_bytes().split_at(17);
        for &b in head {
            tokenizer.feed_byte(b, &mut split).unwrap();
        }
        for &b in tail {
            tokenizer.feed_byte(b, &mut split).unwrap();
        }

        // Text runs may fragment differently; compare after merging.
        assert_eq!(merge_text(whole), merge_text(split));
    }

    fn merge_text(tokens: Vec<SaxToken>) -> Vec<SaxToken> {
        let mut merged: Vec<SaxToken> = Vec::new();
        for token in tokens {
            match (merged.last_mut(), token) {
                (Some(SaxToken::Text(prev)), SaxToken::Text(next)) => prev.push_str(&next),
                (_, token) => merged.push(token),
            }
        }
        merged
    }

    #[test]
    fn control_character_rejected() {
        let mut tokenizer = Tokenizer::new();
        let mut out = Vec::new();
        let err = tokenizer.feed_byte(0x01, &mut out).unwrap_err();
        assert!(matches!(err, DecodeError::WellFormedness(_)));
    }

    #[test]
    fn whitespace_inside_tags_tolerated() {
        let tokens = tokenize("<a  v = 'x' ></a >").unwrap();
        assert!(tokens.contains(&SaxToken::Attribute("v".into(), "x".into())));
        assert!(tokens.contains(&SaxToken::EndTag("a".into())));
    }
}
