//! Process-wide routing table of bound sessions.
//!
//! Maps full JIDs to session handles for stanza delivery. Lookups are
//! read-mostly and lock-free; bind and unbind mutate individual shards.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI8, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::error::XmppError;
use crate::jid::Jid;
use crate::session::{SessionId, SessionWriter, WriteError};
use crate::stanza::XmlElement;

/// Monotonic counter for bind order; the tie-break for resource selection.
static BIND_SEQ: AtomicU64 = AtomicU64::new(0);

/// A routable session entry.
pub struct SessionHandle {
    /// The owning session's id
    pub session_id: SessionId,
    writer: SessionWriter,
    available: AtomicBool,
    priority: AtomicI8,
    bound_seq: u64,
}

impl SessionHandle {
    fn new(session_id: SessionId, writer: SessionWriter) -> Self {
        Self {
            session_id,
            writer,
            available: AtomicBool::new(false),
            priority: AtomicI8::new(0),
            bound_seq: BIND_SEQ.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Whether the resource announced available presence.
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Relaxed)
    }

    /// The last announced presence priority.
    pub fn priority(&self) -> i8 {
        self.priority.load(Ordering::Relaxed)
    }
}

/// Result of a delivery attempt to one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendResult {
    /// Queued on the session's outbound lane
    Sent,
    /// No session is bound at that address
    NotConnected,
    /// The session's outbound lane is full
    QueueFull,
    /// The session is gone; the stale entry was dropped
    SessionClosed,
}

/// Registry of bound sessions, keyed by full JID.
pub struct SessionRegistry {
    sessions: DashMap<Jid, Arc<SessionHandle>>,
}

impl SessionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    /// Bind a session under its full JID.
    ///
    /// No two concurrently bound sessions may share a full JID; a second
    /// bind for the same address is refused with a conflict.
    pub fn bind(
        &self,
        jid: Jid,
        session_id: SessionId,
        writer: SessionWriter,
    ) -> Result<Arc<SessionHandle>, XmppError> {
        debug_assert!(jid.is_full(), "registry keys are full JIDs");

        // A dead entry under the same address is reclaimable.
        if let Some(existing) = self.sessions.get(&jid) {
            if !existing.writer.is_closed() {
                return Err(XmppError::Stanza {
                    condition: crate::error::StanzaErrorCondition::Conflict,
                    error_type: crate::error::StanzaErrorType::Cancel,
                    text: Some(format!("resource already bound: {}", jid)),
                });
            }
        }

        let handle = Arc::new(SessionHandle::new(session_id, writer));
        self.sessions.insert(jid.clone(), Arc::clone(&handle));
        debug!(jid = %jid, "session bound");
        Ok(handle)
    }

    /// Remove a binding on session close.
    ///
    /// The session id guards against a later session that reclaimed the
    /// address being unbound by the defunct one.
    pub fn unbind(&self, jid: &Jid, session_id: &SessionId) {
        let removed = self
            .sessions
            .remove_if(jid, |_, handle| handle.session_id == *session_id);
        if removed.is_some() {
            debug!(jid = %jid, "session unbound");
        }
    }

    /// Whether any session is bound at this full JID.
    pub fn is_bound(&self, jid: &Jid) -> bool {
        self.sessions.contains_key(jid)
    }

    /// Number of bound sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Look up the handle bound at a full JID.
    pub fn get(&self, jid: &Jid) -> Option<Arc<SessionHandle>> {
        self.sessions.get(jid).map(|entry| Arc::clone(entry.value()))
    }

    /// All full JIDs sharing the given bare JID.
    pub fn resources_for(&self, bare: &Jid) -> Vec<Jid> {
        let bare = bare.to_bare();
        self.sessions
            .iter()
            .filter(|entry| entry.key().to_bare() == bare)
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// The delivery target for a bare-JID chat message: the available
    /// resource with the highest priority, most recently bound on ties.
    pub fn best_resource_for(&self, bare: &Jid) -> Option<Jid> {
        let bare = bare.to_bare();
        self.sessions
            .iter()
            .filter(|entry| entry.key().to_bare() == bare && entry.value().is_available())
            .max_by(|a, b| {
                a.value()
                    .priority()
                    .cmp(&b.value().priority())
                    .then(a.value().bound_seq.cmp(&b.value().bound_seq))
            })
            .map(|entry| entry.key().clone())
    }

    /// Update availability and priority from a presence broadcast.
    pub fn update_presence(&self, jid: &Jid, available: bool, priority: i8) -> bool {
        match self.sessions.get(jid) {
            Some(entry) => {
                entry.value().available.store(available, Ordering::Relaxed);
                entry.value().priority.store(priority, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Deliver a stanza to the session bound at a full JID.
    pub fn send_to(&self, jid: &Jid, stanza: XmlElement) -> SendResult {
        let handle = match self.sessions.get(jid) {
            Some(entry) => Arc::clone(entry.value()),
            None => return SendResult::NotConnected,
        };

        match handle.writer.write(stanza) {
            Ok(()) => SendResult::Sent,
            Err(WriteError::QueueFull) => {
                warn!(jid = %jid, "outbound lane full, applying backpressure");
                SendResult::QueueFull
            }
            Err(WriteError::Closed) => {
                self.sessions
                    .remove_if(jid, |_, h| h.session_id == handle.session_id);
                debug!(jid = %jid, "dropped stale binding");
                SendResult::SessionClosed
            }
        }
    }

    /// Drop bindings whose sessions have gone away.
    pub fn cleanup_stale(&self) -> usize {
        let stale: Vec<Jid> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().writer.is_closed())
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = 0;
        for jid in stale {
            if self
                .sessions
                .remove_if(&jid, |_, h| h.writer.is_closed())
                .is_some()
            {
                removed += 1;
            }
        }
        removed
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("session_count", &self.sessions.len())
            .finish()
    }
}
