//! Stanza routing.
//!
//! Given an accepted stanza, the router picks one of: delivery to local
//! sessions through the registry, module dispatch by payload namespace,
//! hand-off to the offline store, or forwarding over an S2S link. Replies
//! the sender must receive (module results, stanza errors) are returned to
//! the caller, which owns the sender's writer.
//!
//! Stanzas from one sender to one recipient keep their send order: each
//! session's inbound lane is processed sequentially and delivery enqueues
//! onto the recipient's ordered outbound lane.

use std::sync::Arc;

use tracing::{debug, instrument, warn};

use crate::error::{
    stanza_error_reply, StanzaErrorCondition, StanzaErrorType, XmppError,
};
use crate::jid::Jid;
use crate::modules::ModuleRegistry;
use crate::registry::{SendResult, SessionRegistry};
use crate::roster::{RosterService, SubscriptionPresence, NS_ROSTER};
use crate::s2s::S2sManager;
use crate::stanza::{validate_stanza, StanzaKind, XmlElement};
use crate::storage::OfflineStore;

/// What the router did with a stanza.
#[derive(Debug)]
pub enum RoutingOutcome {
    /// Delivered to this many local sessions
    DeliveredLocal(usize),
    /// Kept in the offline store for later delivery
    StoredOffline,
    /// Queued on (or sent over) the link to a remote domain
    SentToRemote(String),
    /// A module or the roster service produced this reply for the sender
    Reply(XmlElement),
    /// This error reply must go back to the sender
    ErrorReply(XmlElement),
    /// Dropped without any response, per protocol rules
    Dropped,
}

/// Routes stanzas between sessions, modules, storage, and federation.
pub struct StanzaRouter {
    domain: String,
    registry: Arc<SessionRegistry>,
    modules: Arc<ModuleRegistry>,
    roster: Arc<RosterService>,
    offline: Arc<dyn OfflineStore>,
    s2s: Option<Arc<S2sManager>>,
}

impl StanzaRouter {
    /// Create a router for the local domain.
    pub fn new(
        domain: impl Into<String>,
        registry: Arc<SessionRegistry>,
        modules: Arc<ModuleRegistry>,
        roster: Arc<RosterService>,
        offline: Arc<dyn OfflineStore>,
        s2s: Option<Arc<S2sManager>>,
    ) -> Self {
        Self {
            domain: domain.into(),
            registry,
            modules,
            roster,
            offline,
            s2s,
        }
    }

    /// The local domain.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Whether a domain is served locally.
    pub fn is_local_domain(&self, domain: &str) -> bool {
        domain == self.domain || domain.ends_with(&format!(".{}", self.domain))
    }

    /// Route one stanza from an authenticated sender.
    #[instrument(skip(self, stanza), fields(kind = %stanza.kind(), from = %sender))]
    pub async fn route(
        &self,
        stanza: XmlElement,
        sender: &Jid,
    ) -> Result<RoutingOutcome, XmppError> {
        if let Err(e) = validate_stanza(&stanza) {
            return Ok(self.error_outcome(&stanza, sender, &e));
        }

        let to = match stanza.to_jid() {
            Some(Ok(jid)) => Some(jid),
            Some(Err(_)) => {
                let reply = stanza_error_reply(
                    &stanza,
                    StanzaErrorCondition::JidMalformed,
                    StanzaErrorType::Modify,
                    None,
                );
                return Ok(RoutingOutcome::ErrorReply(reply));
            }
            None => None,
        };

        // Remote domains go over federation.
        if let Some(to) = &to {
            if !self.is_local_domain(to.domain()) {
                return self.route_remote(stanza, to.domain());
            }
        }

        match stanza.kind() {
            StanzaKind::Iq => self.route_iq(stanza, sender, to.as_ref()).await,
            StanzaKind::Message => Ok(self.route_message(stanza, to.as_ref()).await?),
            StanzaKind::Presence => self.route_presence(stanza, sender, to.as_ref()).await,
            StanzaKind::Other => {
                debug!("dropping non-stanza top-level element");
                Ok(RoutingOutcome::Dropped)
            }
        }
    }

    fn route_remote(
        &self,
        stanza: XmlElement,
        domain: &str,
    ) -> Result<RoutingOutcome, XmppError> {
        match &self.s2s {
            Some(s2s) => {
                s2s.send(domain, stanza)?;
                Ok(RoutingOutcome::SentToRemote(domain.to_string()))
            }
            None => {
                debug!(domain, "federation disabled, refusing remote stanza");
                let reply = stanza_error_reply(
                    &stanza,
                    StanzaErrorCondition::ServiceUnavailable,
                    StanzaErrorType::Cancel,
                    Some("federation is not enabled"),
                );
                Ok(RoutingOutcome::ErrorReply(reply))
            }
        }
    }

    async fn route_iq(
        &self,
        stanza: XmlElement,
        sender: &Jid,
        to: Option<&Jid>,
    ) -> Result<RoutingOutcome, XmppError> {
        let addressed_to_session = to.is_some_and(Jid::is_full);

        // Modules intercept iq addressed to the server or to a bare JID,
        // before local delivery. Full-JID iq flows between sessions.
        if !addressed_to_session {
            if stanza.find_child("query", Some(NS_ROSTER)).is_some() {
                let reply = match stanza.attr("type") {
                    Some("get") => self.roster.handle_roster_get(&stanza, sender).await?,
                    Some("set") => self.roster.handle_roster_set(&stanza, sender).await?,
                    _ => {
                        return Ok(RoutingOutcome::Dropped);
                    }
                };
                return Ok(RoutingOutcome::Reply(reply));
            }

            if let Some(module) = self.modules.module_for(&stanza) {
                debug!(module = module.name(), "module intercepted iq");
                return Ok(match module.handle(&stanza) {
                    Some(reply) => RoutingOutcome::Reply(reply),
                    None => RoutingOutcome::Dropped,
                });
            }
        }

        if let Some(to) = to {
            if to.is_full() {
                if self.registry.send_to(to, stanza.clone()) == SendResult::Sent {
                    return Ok(RoutingOutcome::DeliveredLocal(1));
                }
            }
        }

        // Results and errors addressed to nobody reachable just vanish;
        // answering them would loop errors back and forth.
        if matches!(stanza.attr("type"), Some("result") | Some("error")) {
            return Ok(RoutingOutcome::Dropped);
        }

        let reply = stanza_error_reply(
            &stanza,
            StanzaErrorCondition::ServiceUnavailable,
            StanzaErrorType::Cancel,
            None,
        );
        Ok(RoutingOutcome::ErrorReply(reply))
    }

    async fn route_message(
        &self,
        stanza: XmlElement,
        to: Option<&Jid>,
    ) -> Result<RoutingOutcome, XmppError> {
        let Some(to) = to else {
            debug!("message without 'to' dropped");
            return Ok(RoutingOutcome::Dropped);
        };

        if to.is_full() {
            if self.registry.send_to(to, stanza.clone()) == SendResult::Sent {
                return Ok(RoutingOutcome::DeliveredLocal(1));
            }
        } else if let Some(best) = self.registry.best_resource_for(to) {
            // Bare-JID chat goes to the best available resource.
            if self.registry.send_to(&best, stanza.clone()) == SendResult::Sent {
                return Ok(RoutingOutcome::DeliveredLocal(1));
            }
        }

        // Nobody reachable: chat and normal messages wait in the offline
        // store, everything else drops.
        match stanza.attr("type").unwrap_or("normal") {
            "chat" | "normal" => {
                self.offline.store(&to.to_bare(), stanza).await?;
                debug!(to = %to, "message stored offline");
                Ok(RoutingOutcome::StoredOffline)
            }
            _ => Ok(RoutingOutcome::Dropped),
        }
    }

    async fn route_presence(
        &self,
        stanza: XmlElement,
        sender: &Jid,
        to: Option<&Jid>,
    ) -> Result<RoutingOutcome, XmppError> {
        let Some(to) = to else {
            // Broadcast presence is the session's business, not the router's.
            return Ok(RoutingOutcome::Dropped);
        };

        // Subscription presence drives roster state transitions first.
        let subscription = stanza
            .attr("type")
            .and_then(SubscriptionPresence::parse);
        if let Some(subscription) = subscription {
            match subscription {
                SubscriptionPresence::Subscribe => self.roster.subscribe(sender, to).await?,
                SubscriptionPresence::Subscribed => self.roster.subscribed(sender, to).await?,
                SubscriptionPresence::Unsubscribe => self.roster.unsubscribe(sender, to).await?,
                SubscriptionPresence::Unsubscribed => {
                    self.roster.unsubscribed(sender, to).await?
                }
            }
        }

        // Presence to a bare JID fans out to every resource.
        let targets: Vec<Jid> = if to.is_full() {
            vec![to.clone()]
        } else {
            self.registry.resources_for(to)
        };

        let mut delivered = 0;
        for target in &targets {
            match self.registry.send_to(target, stanza.clone()) {
                SendResult::Sent => delivered += 1,
                SendResult::QueueFull => {
                    warn!(to = %target, "presence dropped: outbound lane full");
                }
                _ => {}
            }
        }

        if delivered > 0 {
            Ok(RoutingOutcome::DeliveredLocal(delivered))
        } else if subscription == Some(SubscriptionPresence::Subscribe) {
            // Materialized into the contact's roster for their next login.
            Ok(RoutingOutcome::StoredOffline)
        } else {
            // Undeliverable presence vanishes silently.
            Ok(RoutingOutcome::Dropped)
        }
    }

    fn error_outcome(
        &self,
        stanza: &XmlElement,
        _sender: &Jid,
        error: &XmppError,
    ) -> RoutingOutcome {
        match crate::error::as_stanza_error(error) {
            Some((condition, error_type, text)) => RoutingOutcome::ErrorReply(
                stanza_error_reply(stanza, condition, error_type, text.as_deref()),
            ),
            None => RoutingOutcome::Dropped,
        }
    }
}
