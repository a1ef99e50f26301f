//! Stanza model: an immutable XML element tree with a canonical renderer.
//!
//! Stanzas are trees of [`XmlElement`] nodes. Attribute order is the
//! insertion order, children keep document order, and the renderer is
//! deterministic for a given tree, so `render(parse(render(x))) == render(x)`.

use std::fmt;

use crate::jid::Jid;

/// Well-known namespace URIs used across the server.
pub mod ns {
    /// XMPP client content namespace
    pub const JABBER_CLIENT: &str = "jabber:client";
    /// XMPP server content namespace
    pub const JABBER_SERVER: &str = "jabber:server";
    /// XMPP streams namespace
    pub const STREAM: &str = "http://etherx.jabber.org/streams";
    /// STARTTLS namespace
    pub const TLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";
    /// SASL namespace
    pub const SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
    /// Resource binding namespace
    pub const BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";
    /// Legacy session establishment namespace
    pub const SESSION: &str = "urn:ietf:params:xml:ns:xmpp-session";
    /// Server dialback namespace
    pub const DIALBACK: &str = "jabber:server:dialback";
    /// BOSH body namespace (XEP-0124)
    pub const HTTPBIND: &str = "http://jabber.org/protocol/httpbind";
    /// The reserved `xml:` attribute namespace
    pub const XML: &str = "http://www.w3.org/XML/1998/namespace";
}

/// A qualified name: optional namespace URI plus local name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QName {
    namespace: Option<String>,
    local: String,
}

impl QName {
    /// Create a qualified name.
    pub fn new(local: impl Into<String>, namespace: Option<&str>) -> Self {
        Self {
            namespace: namespace.map(str::to_owned),
            local: local.into(),
        }
    }

    /// The namespace URI, if any.
    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    /// The local name.
    pub fn local(&self) -> &str {
        &self.local
    }
}

impl fmt::Display for QName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{{{}}}{}", ns, self.local),
            None => write!(f, "{}", self.local),
        }
    }
}

/// A child node: nested element or character data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    /// A nested element
    Element(XmlElement),
    /// Text content (unescaped)
    Text(String),
}

/// An immutable XML element.
///
/// Build instances with [`XmlElement::builder`]; once built, the tree is not
/// mutated in place. Attribute keys are qualified names, though in practice
/// only `xml:lang` carries a namespace on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XmlElement {
    name: QName,
    attributes: Vec<(QName, String)>,
    children: Vec<Node>,
}

impl XmlElement {
    /// Start building an element with the given local name and namespace.
    pub fn builder(local: impl Into<String>, namespace: Option<&str>) -> XmlElementBuilder {
        XmlElementBuilder {
            element: XmlElement {
                name: QName::new(local, namespace),
                attributes: Vec::new(),
                children: Vec::new(),
            },
        }
    }

    /// Assemble an element from already-resolved parts.
    pub(crate) fn from_parts(
        name: QName,
        attributes: Vec<(QName, String)>,
        children: Vec<Node>,
    ) -> Self {
        Self {
            name,
            attributes,
            children,
        }
    }

    /// The element's qualified name.
    pub fn name(&self) -> &QName {
        &self.name
    }

    /// All attributes in insertion order.
    pub fn attributes(&self) -> &[(QName, String)] {
        &self.attributes
    }

    /// Look up an attribute by plain (un-namespaced) name.
    ///
    /// `xml:lang` is addressable by its prefixed spelling for convenience.
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes.iter().find_map(|(qname, value)| {
            let matches = if let Some(rest) = name.strip_prefix("xml:") {
                qname.namespace() == Some(ns::XML) && qname.local() == rest
            } else {
                qname.namespace().is_none() && qname.local() == name
            };
            matches.then_some(value.as_str())
        })
    }

    /// All child nodes in document order.
    pub fn children(&self) -> &[Node] {
        &self.children
    }

    /// Iterate over child elements only.
    pub fn child_elements(&self) -> impl Iterator<Item = &XmlElement> {
        self.children.iter().filter_map(|node| match node {
            Node::Element(e) => Some(e),
            Node::Text(_) => None,
        })
    }

    /// Find the first child element with the given local name and namespace.
    pub fn find_child(&self, local: &str, namespace: Option<&str>) -> Option<&XmlElement> {
        self.child_elements()
            .find(|e| e.name.local() == local && e.name.namespace() == namespace)
    }

    /// Find the first child element with the given local name, any namespace.
    pub fn find_child_any_ns(&self, local: &str) -> Option<&XmlElement> {
        self.child_elements().find(|e| e.name.local() == local)
    }

    /// Concatenated text content of the direct children.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for node in &self.children {
            if let Node::Text(t) = node {
                out.push_str(t);
            }
        }
        out
    }

    /// Copy of this element with one attribute set, replacing any existing
    /// value while keeping its position.
    pub fn with_attr(&self, name: &str, value: impl Into<String>) -> XmlElement {
        let mut copy = self.clone();
        let value = value.into();
        match copy
            .attributes
            .iter_mut()
            .find(|(qname, _)| qname.namespace().is_none() && qname.local() == name)
        {
            Some((_, existing)) => *existing = value,
            None => copy.attributes.push((QName::new(name, None), value)),
        }
        copy
    }

    /// The stanza kind, if this is a stanza-level element.
    pub fn kind(&self) -> StanzaKind {
        match self.name.local() {
            "message" => StanzaKind::Message,
            "presence" => StanzaKind::Presence,
            "iq" => StanzaKind::Iq,
            _ => StanzaKind::Other,
        }
    }

    /// Parse the 'to' attribute as a JID, if present.
    pub fn to_jid(&self) -> Option<Result<Jid, crate::jid::JidError>> {
        self.attr("to").map(Jid::parse)
    }

    /// Parse the 'from' attribute as a JID, if present.
    pub fn from_jid(&self) -> Option<Result<Jid, crate::jid::JidError>> {
        self.attr("from").map(Jid::parse)
    }

    /// Render the canonical textual form of the element.
    pub fn render(&self) -> String {
        let mut out = String::new();
        self.render_into(&mut out, None);
        out
    }

    fn render_into(&self, out: &mut String, parent_ns: Option<&str>) {
        out.push('<');
        out.push_str(self.name.local());

        // A namespace differing from the parent's becomes a default xmlns
        // declaration; inherited namespaces are not repeated.
        if self.name.namespace() != parent_ns {
            if let Some(ns) = self.name.namespace() {
                out.push_str(" xmlns='");
                out.push_str(&escape_attr(ns));
                out.push('\'');
            }
        }

        for (qname, value) in &self.attributes {
            out.push(' ');
            if qname.namespace() == Some(ns::XML) {
                out.push_str("xml:");
            }
            out.push_str(qname.local());
            out.push_str("='");
            out.push_str(&escape_attr(value));
            out.push('\'');
        }

        if self.children.is_empty() {
            out.push_str("/>");
            return;
        }

        out.push('>');
        for node in &self.children {
            match node {
                Node::Element(e) => e.render_into(out, self.name.namespace()),
                Node::Text(t) => out.push_str(&escape_text(t)),
            }
        }
        out.push_str("</");
        out.push_str(self.name.local());
        out.push('>');
    }
}

/// Stanza classification for routing and dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaKind {
    /// `<message/>`
    Message,
    /// `<presence/>`
    Presence,
    /// `<iq/>`
    Iq,
    /// Stream-level control element or extension element
    Other,
}

impl fmt::Display for StanzaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StanzaKind::Message => write!(f, "message"),
            StanzaKind::Presence => write!(f, "presence"),
            StanzaKind::Iq => write!(f, "iq"),
            StanzaKind::Other => write!(f, "other"),
        }
    }
}

/// Builder for [`XmlElement`].
pub struct XmlElementBuilder {
    element: XmlElement,
}

impl XmlElementBuilder {
    /// Append a plain attribute.
    pub fn attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let name = name.into();
        let qname = match name.strip_prefix("xml:") {
            Some(rest) => QName::new(rest, Some(ns::XML)),
            None => QName::new(name, None),
        };
        self.element.attributes.push((qname, value.into()));
        self
    }

    /// Append an attribute only when the value is present.
    pub fn attr_opt(self, name: impl Into<String>, value: Option<impl Into<String>>) -> Self {
        match value {
            Some(value) => self.attr(name, value),
            None => self,
        }
    }

    /// Append a child element.
    pub fn child(mut self, child: XmlElement) -> Self {
        self.element.children.push(Node::Element(child));
        self
    }

    /// Append a text node.
    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.element.children.push(Node::Text(text.into()));
        self
    }

    /// Finish the element.
    pub fn build(self) -> XmlElement {
        self.element
    }
}

/// Validate the stanza invariants that hold for any accepted stanza.
///
/// `id`, when set, is any string; `from`/`to` must parse as JIDs; an iq of
/// type get/set carries exactly one payload child (plus at most one error).
pub fn validate_stanza(element: &XmlElement) -> Result<(), crate::error::XmppError> {
    if let Some(Err(e)) = element.to_jid() {
        return Err(e.into());
    }
    if let Some(Err(e)) = element.from_jid() {
        return Err(e.into());
    }

    if element.kind() == StanzaKind::Iq {
        let iq_type = element.attr("type").unwrap_or("");
        if matches!(iq_type, "get" | "set") {
            let payloads = element
                .child_elements()
                .filter(|e| e.name().local() != "error")
                .count();
            if payloads != 1 {
                return Err(crate::error::XmppError::bad_request(Some(format!(
                    "iq of type '{}' requires exactly one payload child, got {}",
                    iq_type, payloads
                ))));
            }
        }
        let errors = element
            .child_elements()
            .filter(|e| e.name().local() == "error")
            .count();
        if errors > 1 {
            return Err(crate::error::XmppError::bad_request(Some(
                "iq carries more than one error child".to_string(),
            )));
        }
    }

    Ok(())
}

/// Build an iq result reply for a request, swapping addresses.
pub fn iq_result(request: &XmlElement, payload: Option<XmlElement>) -> XmlElement {
    let mut reply = XmlElement::builder("iq", request.name().namespace())
        .attr_opt("id", request.attr("id"))
        .attr_opt("from", request.attr("to"))
        .attr_opt("to", request.attr("from"))
        .attr("type", "result");
    if let Some(payload) = payload {
        reply = reply.child(payload);
    }
    reply.build()
}

/// Escape character data for element content.
pub fn escape_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
    out
}

/// Escape character data for a single-quoted attribute value.
pub fn escape_attr(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\'' => out.push_str("&apos;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}
