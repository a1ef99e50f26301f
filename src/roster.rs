//! Roster and presence subscription handling (RFC 6121).
//!
//! The roster itself lives behind the external
//! [`RosterManager`](crate::storage::RosterManager); this service applies the
//! subscription state transitions and answers `jabber:iq:roster` queries.
//! Inbound `presence type='subscribe'` for an offline contact is
//! materialized into the contact's roster so the request survives until
//! they next connect.

use std::sync::Arc;

use tracing::debug;

use crate::error::XmppError;
use crate::jid::Jid;
use crate::stanza::{iq_result, XmlElement};
use crate::storage::{RosterChange, RosterItem, RosterManager, SubscriptionState};

/// Namespace for roster queries.
pub const NS_ROSTER: &str = "jabber:iq:roster";

/// Subscription-related presence types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionPresence {
    /// Request to subscribe to the recipient's presence
    Subscribe,
    /// Approval of a subscription request
    Subscribed,
    /// Cancel our subscription to the recipient
    Unsubscribe,
    /// Revoke the recipient's subscription to us
    Unsubscribed,
}

impl SubscriptionPresence {
    /// Parse the presence 'type' attribute.
    pub fn parse(presence_type: &str) -> Option<Self> {
        match presence_type {
            "subscribe" => Some(Self::Subscribe),
            "subscribed" => Some(Self::Subscribed),
            "unsubscribe" => Some(Self::Unsubscribe),
            "unsubscribed" => Some(Self::Unsubscribed),
            _ => None,
        }
    }
}

/// Applies subscription transitions and serves roster queries.
pub struct RosterService {
    roster: Arc<dyn RosterManager>,
}

impl RosterService {
    /// Create a service over the given storage.
    pub fn new(roster: Arc<dyn RosterManager>) -> Self {
        Self { roster }
    }

    /// Answer a `jabber:iq:roster` get with the user's full roster.
    pub async fn handle_roster_get(
        &self,
        iq: &XmlElement,
        user: &Jid,
    ) -> Result<XmlElement, XmppError> {
        let roster = self.roster.get(&user.to_bare()).await?;

        let mut query = XmlElement::builder("query", Some(NS_ROSTER));
        for item in &roster.items {
            let mut entry = XmlElement::builder("item", Some(NS_ROSTER))
                .attr("jid", item.jid.to_string())
                .attr("subscription", item.subscription.as_str());
            if let Some(name) = &item.name {
                entry = entry.attr("name", name.clone());
            }
            if item.pending_out {
                entry = entry.attr("ask", "subscribe");
            }
            query = query.child(entry.build());
        }

        Ok(iq_result(iq, Some(query.build())))
    }

    /// Apply a `jabber:iq:roster` set (add, rename, or remove an item).
    pub async fn handle_roster_set(
        &self,
        iq: &XmlElement,
        user: &Jid,
    ) -> Result<XmlElement, XmppError> {
        let query = iq
            .find_child("query", Some(NS_ROSTER))
            .ok_or_else(|| XmppError::bad_request(Some("missing roster query".into())))?;
        let item = query
            .find_child("item", Some(NS_ROSTER))
            .ok_or_else(|| XmppError::bad_request(Some("roster set without item".into())))?;
        let contact = item
            .attr("jid")
            .ok_or_else(|| XmppError::bad_request(Some("roster item without jid".into())))
            .and_then(|jid| Jid::parse(jid).map_err(XmppError::from))?
            .to_bare();

        let user = user.to_bare();
        if item.attr("subscription") == Some("remove") {
            self.roster
                .mutate(&user, RosterChange::Remove(contact))
                .await?;
        } else {
            let existing = self.roster.get(&user).await?;
            let mut entry = existing
                .get(&contact)
                .cloned()
                .unwrap_or_else(|| RosterItem::new(contact));
            entry.name = item.attr("name").map(str::to_owned);
            self.roster.mutate(&user, RosterChange::Upsert(entry)).await?;
        }

        Ok(iq_result(iq, None))
    }

    /// Apply an outbound subscription request from `user` to `contact`.
    ///
    /// The sender's entry is flagged pending-out; the contact's roster gains
    /// a pending-in entry, which is the materialized form delivered when the
    /// contact has no available resources.
    pub async fn subscribe(&self, user: &Jid, contact: &Jid) -> Result<(), XmppError> {
        let user = user.to_bare();
        let contact = contact.to_bare();

        let mut sender_entry = self.entry_for(&user, &contact).await?;
        sender_entry.pending_out = true;
        self.roster
            .mutate(&user, RosterChange::Upsert(sender_entry))
            .await?;

        let mut contact_entry = self.entry_for(&contact, &user).await?;
        contact_entry.pending_in = true;
        self.roster
            .mutate(&contact, RosterChange::Upsert(contact_entry))
            .await?;

        debug!(user = %user, contact = %contact, "subscription request recorded");
        Ok(())
    }

    /// Apply an approval sent by `user` for `contact`'s pending request.
    pub async fn subscribed(&self, user: &Jid, contact: &Jid) -> Result<(), XmppError> {
        let user = user.to_bare();
        let contact = contact.to_bare();

        // The approver now has the contact subscribed to them.
        let mut user_entry = self.entry_for(&user, &contact).await?;
        user_entry.pending_in = false;
        user_entry.subscription = match user_entry.subscription {
            SubscriptionState::None | SubscriptionState::From => SubscriptionState::From,
            SubscriptionState::To | SubscriptionState::Both => SubscriptionState::Both,
        };
        self.roster
            .mutate(&user, RosterChange::Upsert(user_entry))
            .await?;

        // The requester's subscription is now live.
        let mut contact_entry = self.entry_for(&contact, &user).await?;
        contact_entry.pending_out = false;
        contact_entry.subscription = match contact_entry.subscription {
            SubscriptionState::None | SubscriptionState::To => SubscriptionState::To,
            SubscriptionState::From | SubscriptionState::Both => SubscriptionState::Both,
        };
        self.roster
            .mutate(&contact, RosterChange::Upsert(contact_entry))
            .await?;

        Ok(())
    }

    /// Apply `user` cancelling their subscription to `contact`.
    pub async fn unsubscribe(&self, user: &Jid, contact: &Jid) -> Result<(), XmppError> {
        let user = user.to_bare();
        let contact = contact.to_bare();

        let mut user_entry = self.entry_for(&user, &contact).await?;
        user_entry.pending_out = false;
        user_entry.subscription = match user_entry.subscription {
            SubscriptionState::Both | SubscriptionState::From => SubscriptionState::From,
            _ => SubscriptionState::None,
        };
        self.roster
            .mutate(&user, RosterChange::Upsert(user_entry))
            .await?;

        let mut contact_entry = self.entry_for(&contact, &user).await?;
        contact_entry.subscription = match contact_entry.subscription {
            SubscriptionState::Both | SubscriptionState::To => SubscriptionState::To,
            _ => SubscriptionState::None,
        };
        self.roster
            .mutate(&contact, RosterChange::Upsert(contact_entry))
            .await?;

        Ok(())
    }

    /// Apply `user` revoking `contact`'s subscription to them.
    pub async fn unsubscribed(&self, user: &Jid, contact: &Jid) -> Result<(), XmppError> {
        let user = user.to_bare();
        let contact = contact.to_bare();

        let mut user_entry = self.entry_for(&user, &contact).await?;
        user_entry.pending_in = false;
        user_entry.subscription = match user_entry.subscription {
            SubscriptionState::Both | SubscriptionState::To => SubscriptionState::To,
            _ => SubscriptionState::None,
        };
        self.roster
            .mutate(&user, RosterChange::Upsert(user_entry))
            .await?;

        let mut contact_entry = self.entry_for(&contact, &user).await?;
        contact_entry.pending_out = false;
        contact_entry.subscription = match contact_entry.subscription {
            SubscriptionState::Both | SubscriptionState::From => SubscriptionState::From,
            _ => SubscriptionState::None,
        };
        self.roster
            .mutate(&contact, RosterChange::Upsert(contact_entry))
            .await?;

        Ok(())
    }

    async fn entry_for(&self, owner: &Jid, contact: &Jid) -> Result<RosterItem, XmppError> {
        Ok(self
            .roster
            .get(owner)
            .await?
            .get(contact)
            .cloned()
            .unwrap_or_else(|| RosterItem::new(contact.clone())))
    }
}
