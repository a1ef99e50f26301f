//! Storage provider interfaces.
//!
//! Persistence is delegated: the core consumes these traits and ships only
//! in-memory implementations, which the test suites use as well.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::XmppError;
use crate::jid::Jid;
use crate::stanza::XmlElement;

/// Account storage and credential verification.
#[async_trait]
pub trait AccountManagement: Send + Sync {
    /// Whether an account exists for the bare JID.
    async fn exists(&self, jid: &Jid) -> bool;

    /// Create an account with the given password.
    async fn add(&self, jid: &Jid, password: &str) -> Result<(), XmppError>;

    /// Verify a mechanism proof (a plaintext password for PLAIN).
    async fn verify(&self, jid: &Jid, proof: &str) -> bool;

    /// Look up the stored password for challenge-response mechanisms
    /// (DIGEST-MD5, SCRAM) that derive verification material from it.
    ///
    /// A backend that stores only hashed credentials returns `None` and the
    /// mechanism fails with a temporary auth failure.
    async fn password(&self, jid: &Jid) -> Option<String>;
}

/// Roster subscription state (RFC 6121 Section 2.1.2.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubscriptionState {
    /// No subscription in either direction
    #[default]
    None,
    /// We subscribed to the contact's presence
    To,
    /// The contact subscribed to our presence
    From,
    /// Mutual subscription
    Both,
}

impl SubscriptionState {
    /// The wire value of the 'subscription' attribute.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::To => "to",
            Self::From => "from",
            Self::Both => "both",
        }
    }
}

/// One roster entry.
#[derive(Debug, Clone)]
pub struct RosterItem {
    /// The contact's bare JID
    pub jid: Jid,
    /// Optional display name
    pub name: Option<String>,
    /// Subscription state
    pub subscription: SubscriptionState,
    /// Whether an outbound subscription request is pending
    pub pending_out: bool,
    /// Whether an inbound subscription request awaits the user's decision
    pub pending_in: bool,
}

impl RosterItem {
    /// A fresh entry with no subscription.
    pub fn new(jid: Jid) -> Self {
        Self {
            jid,
            name: None,
            subscription: SubscriptionState::None,
            pending_out: false,
            pending_in: false,
        }
    }
}

/// A user's roster.
#[derive(Debug, Clone, Default)]
pub struct Roster {
    /// Entries keyed by contact bare JID
    pub items: Vec<RosterItem>,
}

impl Roster {
    /// Find an entry by contact JID.
    pub fn get(&self, contact: &Jid) -> Option<&RosterItem> {
        self.items.iter().find(|item| item.jid == *contact)
    }
}

/// A mutation applied to one roster entry.
#[derive(Debug, Clone)]
pub enum RosterChange {
    /// Create or update an entry
    Upsert(RosterItem),
    /// Remove the entry for this contact
    Remove(Jid),
}

/// Roster storage.
#[async_trait]
pub trait RosterManager: Send + Sync {
    /// Fetch the roster of a bare JID.
    async fn get(&self, jid: &Jid) -> Result<Roster, XmppError>;

    /// Apply a change to the roster of a bare JID.
    async fn mutate(&self, jid: &Jid, change: RosterChange) -> Result<(), XmppError>;
}

/// Offline message storage.
#[async_trait]
pub trait OfflineStore: Send + Sync {
    /// Keep a message for a recipient with no available resources.
    async fn store(&self, recipient: &Jid, message: XmlElement) -> Result<(), XmppError>;

    /// Remove and return all stored messages for a bare JID, oldest first.
    async fn drain(&self, recipient: &Jid) -> Result<Vec<XmlElement>, XmppError>;
}

/// In-memory account store.
#[derive(Default)]
pub struct MemoryAccounts {
    accounts: Mutex<HashMap<Jid, String>>,
}

impl MemoryAccounts {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated from `(jid, password)` pairs.
    pub fn with_users(users: &[(&str, &str)]) -> Self {
        let mut accounts = HashMap::new();
        for (jid, password) in users {
            let jid = Jid::parse(jid).expect("test account JID must parse");
            accounts.insert(jid.to_bare(), (*password).to_string());
        }
        Self {
            accounts: Mutex::new(accounts),
        }
    }
}

#[async_trait]
impl AccountManagement for MemoryAccounts {
    async fn exists(&self, jid: &Jid) -> bool {
        self.accounts.lock().unwrap().contains_key(&jid.to_bare())
    }

    async fn add(&self, jid: &Jid, password: &str) -> Result<(), XmppError> {
        let mut accounts = self.accounts.lock().unwrap();
        accounts.insert(jid.to_bare(), password.to_string());
        Ok(())
    }

    async fn verify(&self, jid: &Jid, proof: &str) -> bool {
        self.accounts
            .lock()
            .unwrap()
            .get(&jid.to_bare())
            .is_some_and(|stored| stored == proof)
    }

    async fn password(&self, jid: &Jid) -> Option<String> {
        self.accounts.lock().unwrap().get(&jid.to_bare()).cloned()
    }
}

/// In-memory roster store.
#[derive(Default)]
pub struct MemoryRoster {
    rosters: Mutex<HashMap<Jid, Roster>>,
}

impl MemoryRoster {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RosterManager for MemoryRoster {
    async fn get(&self, jid: &Jid) -> Result<Roster, XmppError> {
        Ok(self
            .rosters
            .lock()
            .unwrap()
            .get(&jid.to_bare())
            .cloned()
            .unwrap_or_default())
    }

    async fn mutate(&self, jid: &Jid, change: RosterChange) -> Result<(), XmppError> {
        let mut rosters = self.rosters.lock().unwrap();
        let roster = rosters.entry(jid.to_bare()).or_default();
        match change {
            RosterChange::Upsert(item) => {
                match roster.items.iter_mut().find(|i| i.jid == item.jid) {
                    Some(existing) => *existing = item,
                    None => roster.items.push(item),
                }
            }
            RosterChange::Remove(contact) => {
                roster.items.retain(|i| i.jid != contact);
            }
        }
        Ok(())
    }
}

/// In-memory offline message store.
#[derive(Default)]
pub struct MemoryOfflineStore {
    messages: Mutex<HashMap<Jid, Vec<XmlElement>>>,
}

impl MemoryOfflineStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of messages currently held for a recipient.
    pub fn pending_count(&self, recipient: &Jid) -> usize {
        self.messages
            .lock()
            .unwrap()
            .get(&recipient.to_bare())
            .map(Vec::len)
            .unwrap_or(0)
    }
}

#[async_trait]
impl OfflineStore for MemoryOfflineStore {
    async fn store(&self, recipient: &Jid, message: XmlElement) -> Result<(), XmppError> {
        self.messages
            .lock()
            .unwrap()
            .entry(recipient.to_bare())
            .or_default()
            .push(message);
        Ok(())
    }

    async fn drain(&self, recipient: &Jid) -> Result<Vec<XmlElement>, XmppError> {
        Ok(self
            .messages
            .lock()
            .unwrap()
            .remove(&recipient.to_bare())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stanza::{ns, XmlElement};

    #[tokio::test]
    async fn memory_accounts_verify() {
        let accounts = MemoryAccounts::with_users(&[("user1@skein.im", "password1")]);
        let jid = Jid::parse("user1@skein.im").unwrap();

        assert!(accounts.exists(&jid).await);
        assert!(accounts.verify(&jid, "password1").await);
        assert!(!accounts.verify(&jid, "wrong").await);

        let stranger = Jid::parse("nobody@skein.im").unwrap();
        assert!(!accounts.exists(&stranger).await);
        assert!(!accounts.verify(&stranger, "password1").await);
    }

    #[tokio::test]
    async fn full_jid_resolves_to_bare_account() {
        let accounts = MemoryAccounts::with_users(&[("user1@skein.im", "password1")]);
        let full = Jid::parse("user1@skein.im/tablet").unwrap();
        assert!(accounts.verify(&full, "password1").await);
    }

    #[tokio::test]
    async fn roster_upsert_and_remove() {
        let roster = MemoryRoster::new();
        let user = Jid::parse("user1@skein.im").unwrap();
        let contact = Jid::parse("user2@skein.im").unwrap();

        roster
            .mutate(&user, RosterChange::Upsert(RosterItem::new(contact.clone())))
            .await
            .unwrap();
        assert!(roster.get(&user).await.unwrap().get(&contact).is_some());

        roster
            .mutate(&user, RosterChange::Remove(contact.clone()))
            .await
            .unwrap();
        assert!(roster.get(&user).await.unwrap().get(&contact).is_none());
    }

    #[tokio::test]
    async fn offline_store_drains_in_order() {
        let store = MemoryOfflineStore::new();
        let jid = Jid::parse("user1@skein.im").unwrap();

        for i in 0..3 {
            let msg = XmlElement::builder("message", Some(ns::JABBER_CLIENT))
                .attr("id", format!("m{}", i))
                .build();
            store.store(&jid, msg).await.unwrap();
        }

        let drained = store.drain(&jid).await.unwrap();
        assert_eq!(drained.len(), 3);
        assert_eq!(drained[0].attr("id"), Some("m0"));
        assert_eq!(drained[2].attr("id"), Some("m2"));
        assert!(store.drain(&jid).await.unwrap().is_empty());
    }
}
