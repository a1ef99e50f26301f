//! Per-connection session state and the serialized writer handle.
//!
//! A session is exclusively owned by its connection task. Other components
//! hold a [`SessionWriter`], a cheap clonable handle that posts rendered
//! stanzas onto the session's bounded outbound lane; the connection task
//! drains that lane and performs the actual transport writes, so bytes never
//! interleave even when handlers run on other tasks.

use std::fmt;

use tokio::sync::mpsc;
use tracing::debug;

use crate::error::XmppError;
use crate::jid::Jid;
use crate::stanza::XmlElement;

/// Bound of the outbound stanza lane. Overflow closes the session with
/// `<stream:error><policy-violation/></stream:error>`.
pub const OUTBOUND_QUEUE_DEPTH: usize = 256;

/// Opaque session identifier, unique within the running process.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    /// Mint a fresh identifier.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// The identifier string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stream lifecycle states (RFC 6120 negotiation).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Transport accepted, no stream header seen yet
    Initiated,
    /// Stream header exchanged, features offered
    Opened,
    /// `<proceed/>` sent, TLS handshake in progress
    EncryptionStarted,
    /// TLS active, stream restarted
    Encrypted,
    /// SASL completed, stream restarted
    Authenticated,
    /// Resource bound; stanzas route normally
    Bound,
    /// Stream torn down (terminal)
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Initiated => "initiated",
            Self::Opened => "opened",
            Self::EncryptionStarted => "encryption-started",
            Self::Encrypted => "encrypted",
            Self::Authenticated => "authenticated",
            Self::Bound => "bound",
            Self::Closed => "closed",
        };
        write!(f, "{}", s)
    }
}

/// Commands the connection task executes on behalf of writer handles.
#[derive(Debug)]
pub enum WriterCommand {
    /// Render and write a stanza
    Stanza(XmlElement),
    /// Write pre-rendered XML (stream headers, features, errors)
    Raw(String),
    /// Flush pending writes, emit `</stream:stream>`, tear down transport
    Close,
}

/// Handle for enqueueing writes to one session.
///
/// Stanzas leave the transport in the order of `write` calls on the handle;
/// the bounded queue applies backpressure instead of buffering without limit.
#[derive(Clone)]
pub struct SessionWriter {
    tx: mpsc::Sender<WriterCommand>,
}

/// Why an enqueue failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteError {
    /// The outbound queue is at capacity
    QueueFull,
    /// The session is gone
    Closed,
}

impl fmt::Display for WriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::QueueFull => write!(f, "outbound queue full"),
            Self::Closed => write!(f, "session closed"),
        }
    }
}

impl SessionWriter {
    /// Create a writer and the receiving end for the connection task.
    pub fn channel() -> (Self, mpsc::Receiver<WriterCommand>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
        (Self { tx }, rx)
    }

    /// Enqueue a stanza for writing.
    pub fn write(&self, stanza: XmlElement) -> Result<(), WriteError> {
        self.send(WriterCommand::Stanza(stanza))
    }

    /// Enqueue pre-rendered XML.
    pub fn write_raw(&self, xml: impl Into<String>) -> Result<(), WriteError> {
        self.send(WriterCommand::Raw(xml.into()))
    }

    /// Request an orderly close: pending writes flush, then the stream close
    /// tag goes out and the transport shuts down.
    pub fn close(&self) -> Result<(), WriteError> {
        self.send(WriterCommand::Close)
    }

    /// Whether the receiving session is still alive.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn send(&self, command: WriterCommand) -> Result<(), WriteError> {
        self.tx.try_send(command).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => WriteError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => WriteError::Closed,
        })
    }
}

/// Per-connection state owned by the connection task.
pub struct SessionContext {
    id: SessionId,
    state: SessionState,
    bound_jid: Option<Jid>,
    is_server_session: bool,
    encrypted: bool,
    authenticated: bool,
    writer: SessionWriter,
    stream_id: String,
}

impl SessionContext {
    /// Create a session in `Initiated` with the given writer handle.
    pub fn new(writer: SessionWriter, is_server_session: bool) -> Self {
        Self {
            id: SessionId::generate(),
            state: SessionState::Initiated,
            bound_jid: None,
            is_server_session,
            encrypted: false,
            authenticated: false,
            writer,
            stream_id: uuid::Uuid::new_v4().simple().to_string(),
        }
    }

    /// The process-unique session id.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// The current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Move to a new lifecycle state.
    pub fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            debug!(session = %self.id, from = %self.state, to = %state, "session state transition");
            self.state = state;
        }
    }

    /// The stream id sent in our stream header.
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Assign a fresh stream id for a restarted stream.
    pub fn new_stream_id(&mut self) {
        self.stream_id = uuid::Uuid::new_v4().simple().to_string();
    }

    /// The bound full JID, set once resource binding completes.
    pub fn bound_jid(&self) -> Option<&Jid> {
        self.bound_jid.as_ref()
    }

    /// Record the bound full JID.
    pub fn set_bound_jid(&mut self, jid: Jid) {
        self.bound_jid = Some(jid);
    }

    /// Whether this is a peer-server session rather than a client session.
    pub fn is_server_session(&self) -> bool {
        self.is_server_session
    }

    /// Whether the transport is encrypted.
    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    /// Whether SASL completed.
    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// Record SASL completion.
    pub fn set_authenticated(&mut self) {
        self.authenticated = true;
    }

    /// Mark the transport encrypted, out of the TLS handshake.
    ///
    /// Valid only while negotiation is still in its plaintext phase.
    pub fn switch_to_tls(&mut self) -> Result<(), XmppError> {
        match self.state {
            SessionState::Initiated | SessionState::Opened | SessionState::EncryptionStarted => {
                self.encrypted = true;
                Ok(())
            }
            state => Err(XmppError::internal(format!(
                "switch_to_tls in state {}",
                state
            ))),
        }
    }

    /// Mark a session that arrives already encrypted (BOSH over HTTPS).
    pub fn assume_encrypted(&mut self) {
        self.encrypted = true;
    }

    /// The writer handle for this session.
    pub fn writer(&self) -> &SessionWriter {
        &self.writer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stanza::{ns, XmlElement};

    fn context() -> (SessionContext, mpsc::Receiver<WriterCommand>) {
        let (writer, rx) = SessionWriter::channel();
        (SessionContext::new(writer, false), rx)
    }

    #[test]
    fn session_ids_are_unique() {
        let (a, _rxa) = context();
        let (b, _rxb) = context();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn writes_preserve_order() {
        let (ctx, mut rx) = context();
        for i in 0..3 {
            let stanza = XmlElement::builder("message", Some(ns::JABBER_CLIENT))
                .attr("id", format!("m{}", i))
                .build();
            ctx.writer().write(stanza).unwrap();
        }
        for i in 0..3 {
            match rx.try_recv().unwrap() {
                WriterCommand::Stanza(el) => {
                    assert_eq!(el.attr("id"), Some(format!("m{}", i).as_str()));
                }
                other => panic!("unexpected command {:?}", other),
            }
        }
    }

    #[test]
    fn queue_overflow_reports_backpressure() {
        let (ctx, _rx) = context();
        let stanza = XmlElement::builder("presence", Some(ns::JABBER_CLIENT)).build();
        for _ in 0..OUTBOUND_QUEUE_DEPTH {
            ctx.writer().write(stanza.clone()).unwrap();
        }
        assert_eq!(
            ctx.writer().write(stanza),
            Err(WriteError::QueueFull)
        );
    }

    #[test]
    fn write_after_close_fails() {
        let (ctx, rx) = context();
        drop(rx);
        let stanza = XmlElement::builder("presence", Some(ns::JABBER_CLIENT)).build();
        assert_eq!(ctx.writer().write(stanza), Err(WriteError::Closed));
        assert!(ctx.writer().is_closed());
    }

    #[test]
    fn switch_to_tls_only_during_negotiation() {
        let (mut ctx, _rx) = context();
        assert!(ctx.switch_to_tls().is_ok());
        assert!(ctx.is_encrypted());

        let (mut bound, _rx2) = context();
        bound.set_state(SessionState::Bound);
        assert!(bound.switch_to_tls().is_err());
    }

    #[test]
    fn restart_changes_stream_id() {
        let (mut ctx, _rx) = context();
        let first = ctx.stream_id().to_string();
        ctx.new_stream_id();
        assert_ne!(first, ctx.stream_id());
    }
}
