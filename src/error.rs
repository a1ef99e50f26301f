//! Error types for the XMPP server core.

use thiserror::Error;

use crate::stanza::XmlElement;

/// Namespace for stream-level error conditions.
pub const NS_STREAMS_ERRORS: &str = "urn:ietf:params:xml:ns:xmpp-streams";

/// Namespace for stanza-level error conditions.
pub const NS_STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";

/// XMPP server errors.
#[derive(Debug, Error)]
pub enum XmppError {
    /// IO error (network, file)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS error
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// Stream-level error, fatal for the session
    #[error("stream error: {condition}")]
    Stream {
        /// Defined condition element
        condition: StreamErrorCondition,
        /// Optional human-readable text
        text: Option<String>,
    },

    /// Stanza-level error, recoverable; the sender is notified
    #[error("stanza error: {condition}")]
    Stanza {
        /// Defined condition element
        condition: StanzaErrorCondition,
        /// Error type attribute
        error_type: StanzaErrorType,
        /// Optional human-readable text
        text: Option<String>,
    },

    /// Malformed JID
    #[error("invalid JID: {0}")]
    Jid(#[from] crate::jid::JidError),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal server error
    #[error("internal error: {0}")]
    Internal(String),
}

impl XmppError {
    /// Create a stream error with the given condition.
    pub fn stream(condition: StreamErrorCondition) -> Self {
        Self::Stream {
            condition,
            text: None,
        }
    }

    /// Create a stream error with descriptive text.
    pub fn stream_with_text(condition: StreamErrorCondition, text: impl Into<String>) -> Self {
        Self::Stream {
            condition,
            text: Some(text.into()),
        }
    }

    /// Create a new configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a stanza error for 'bad-request'.
    pub fn bad_request(text: Option<String>) -> Self {
        Self::Stanza {
            condition: StanzaErrorCondition::BadRequest,
            error_type: StanzaErrorType::Modify,
            text,
        }
    }

    /// Create a stanza error for 'forbidden'.
    pub fn forbidden(text: Option<String>) -> Self {
        Self::Stanza {
            condition: StanzaErrorCondition::Forbidden,
            error_type: StanzaErrorType::Auth,
            text,
        }
    }

    /// Create a stanza error for 'item-not-found'.
    pub fn item_not_found(text: Option<String>) -> Self {
        Self::Stanza {
            condition: StanzaErrorCondition::ItemNotFound,
            error_type: StanzaErrorType::Cancel,
            text,
        }
    }

    /// Create a stanza error for 'not-authorized'.
    pub fn not_authorized(text: Option<String>) -> Self {
        Self::Stanza {
            condition: StanzaErrorCondition::NotAuthorized,
            error_type: StanzaErrorType::Auth,
            text,
        }
    }

    /// Create a stanza error for 'recipient-unavailable'.
    pub fn recipient_unavailable(text: Option<String>) -> Self {
        Self::Stanza {
            condition: StanzaErrorCondition::RecipientUnavailable,
            error_type: StanzaErrorType::Wait,
            text,
        }
    }

    /// Create a stanza error for 'service-unavailable'.
    pub fn service_unavailable(text: Option<String>) -> Self {
        Self::Stanza {
            condition: StanzaErrorCondition::ServiceUnavailable,
            error_type: StanzaErrorType::Cancel,
            text,
        }
    }
}

/// Stream error conditions (RFC 6120 Section 4.9.3).
///
/// Stream errors are terminal: the condition is sent inside
/// `<stream:error/>` and the stream is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamErrorCondition {
    /// Entity sent XML that cannot be processed
    BadFormat,
    /// Connection idled past the allowed window
    ConnectionTimeout,
    /// The 'to' domain is not serviced by this server
    HostUnknown,
    /// Stream or content namespace is wrong
    InvalidNamespace,
    /// Entity sent XML that is not well-formed
    NotWellFormed,
    /// Entity violated a local service policy
    PolicyViolation,
    /// Valid XML the XMPP profile forbids (comments, PIs, DTDs, ...)
    RestrictedXml,
    /// Server is being shut down
    SystemShutdown,
    /// Error not covered by a defined condition
    UndefinedCondition,
}

impl StreamErrorCondition {
    /// Get the element name for this condition.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BadFormat => "bad-format",
            Self::ConnectionTimeout => "connection-timeout",
            Self::HostUnknown => "host-unknown",
            Self::InvalidNamespace => "invalid-namespace",
            Self::NotWellFormed => "not-well-formed",
            Self::PolicyViolation => "policy-violation",
            Self::RestrictedXml => "restricted-xml",
            Self::SystemShutdown => "system-shutdown",
            Self::UndefinedCondition => "undefined-condition",
        }
    }
}

impl std::fmt::Display for StreamErrorCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Stanza error conditions (RFC 6120 Section 8.3.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaErrorCondition {
    /// Malformed request
    BadRequest,
    /// Resource or identifier already in use
    Conflict,
    /// Feature not implemented
    FeatureNotImplemented,
    /// Sender lacks permission
    Forbidden,
    /// Internal server error
    InternalServerError,
    /// Addressed item does not exist
    ItemNotFound,
    /// JID could not be parsed
    JidMalformed,
    /// Sender must authenticate first
    NotAuthorized,
    /// Intended recipient is temporarily unavailable
    RecipientUnavailable,
    /// Service is not provided for this address
    ServiceUnavailable,
}

impl StanzaErrorCondition {
    /// Get the element name for this condition.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BadRequest => "bad-request",
            Self::Conflict => "conflict",
            Self::FeatureNotImplemented => "feature-not-implemented",
            Self::Forbidden => "forbidden",
            Self::InternalServerError => "internal-server-error",
            Self::ItemNotFound => "item-not-found",
            Self::JidMalformed => "jid-malformed",
            Self::NotAuthorized => "not-authorized",
            Self::RecipientUnavailable => "recipient-unavailable",
            Self::ServiceUnavailable => "service-unavailable",
        }
    }
}

impl std::fmt::Display for StanzaErrorCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Stanza error types (RFC 6120 Section 8.3.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaErrorType {
    /// Retry after providing credentials
    Auth,
    /// Do not retry
    Cancel,
    /// Retry after changing the data sent
    Modify,
    /// Retry after waiting
    Wait,
}

impl StanzaErrorType {
    /// Get the type attribute value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Cancel => "cancel",
            Self::Modify => "modify",
            Self::Wait => "wait",
        }
    }
}

impl std::fmt::Display for StanzaErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Build an error reply for a received stanza.
///
/// The reply keeps the stanza kind and id, swaps 'from' and 'to', sets
/// `type='error'`, and appends the `<error/>` element. The original payload
/// children are not echoed back.
pub fn stanza_error_reply(
    original: &XmlElement,
    condition: StanzaErrorCondition,
    error_type: StanzaErrorType,
    text: Option<&str>,
) -> XmlElement {
    let mut reply = XmlElement::builder(original.name().local(), original.name().namespace());
    if let Some(id) = original.attr("id") {
        reply = reply.attr("id", id);
    }
    if let Some(to) = original.attr("to") {
        reply = reply.attr("from", to);
    }
    if let Some(from) = original.attr("from") {
        reply = reply.attr("to", from);
    }
    reply = reply.attr("type", "error");

    let mut error = XmlElement::builder("error", original.name().namespace())
        .attr("type", error_type.as_str())
        .child(XmlElement::builder(condition.as_str(), Some(NS_STANZAS)).build());
    if let Some(text) = text {
        error = error.child(
            XmlElement::builder("text", Some(NS_STANZAS))
                .attr("xml:lang", "en")
                .text(text)
                .build(),
        );
    }

    reply.child(error.build()).build()
}

/// Render a `<stream:error/>` element followed by the stream close tag.
///
/// Stream errors are fatal and must be followed by closing the stream.
pub fn stream_error_xml(condition: StreamErrorCondition, text: Option<&str>) -> String {
    let mut error = format!(
        "<stream:error><{} xmlns='{}'/>",
        condition.as_str(),
        NS_STREAMS_ERRORS
    );
    if let Some(t) = text {
        error.push_str(&format!(
            "<text xmlns='{}' xml:lang='en'>{}</text>",
            NS_STREAMS_ERRORS,
            crate::stanza::escape_text(t)
        ));
    }
    error.push_str("</stream:error></stream:stream>");
    error
}

/// Map an `XmppError` to the stanza error triple used in a reply, if the
/// error is recoverable at the stanza level.
///
/// Internal failures while processing a stanza surface as
/// 'service-unavailable' per the recovery policy; stream, IO, and TLS errors
/// return `None` because they terminate the session instead.
pub fn as_stanza_error(
    error: &XmppError,
) -> Option<(StanzaErrorCondition, StanzaErrorType, Option<String>)> {
    match error {
        XmppError::Stanza {
            condition,
            error_type,
            text,
        } => Some((*condition, *error_type, text.clone())),
        XmppError::Jid(e) => Some((
            StanzaErrorCondition::JidMalformed,
            StanzaErrorType::Modify,
            Some(e.to_string()),
        )),
        XmppError::Internal(_) | XmppError::Config(_) => Some((
            StanzaErrorCondition::ServiceUnavailable,
            StanzaErrorType::Cancel,
            None,
        )),
        XmppError::Stream { .. } | XmppError::Io(_) | XmppError::Tls(_) => None,
    }
}
