//! XEP-0199: XMPP Ping.

use crate::stanza::{iq_result, XmlElement};

use super::Module;

/// Namespace for XEP-0199 Ping.
pub const NS_PING: &str = "urn:xmpp:ping";

/// Answers `<ping/>` probes with an empty result.
pub struct PingModule;

impl Module for PingModule {
    fn name(&self) -> &'static str {
        "ping"
    }

    fn namespaces(&self) -> &'static [&'static str] {
        &[NS_PING]
    }

    fn handle(&self, iq: &XmlElement) -> Option<XmlElement> {
        if iq.attr("type") != Some("get") {
            return None;
        }
        Some(iq_result(iq, None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stanza::ns;

    #[test]
    fn ping_get_is_answered() {
        let iq = XmlElement::builder("iq", Some(ns::JABBER_CLIENT))
            .attr("id", "ping-1")
            .attr("from", "user1@skein.im/tablet")
            .attr("to", "skein.im")
            .attr("type", "get")
            .child(XmlElement::builder("ping", Some(NS_PING)).build())
            .build();

        let reply = PingModule.handle(&iq).unwrap();
        assert_eq!(reply.attr("id"), Some("ping-1"));
        assert_eq!(reply.attr("type"), Some("result"));
        assert_eq!(reply.attr("to"), Some("user1@skein.im/tablet"));
        assert_eq!(reply.attr("from"), Some("skein.im"));
        assert!(reply.children().is_empty());
    }

    #[test]
    fn ping_result_is_ignored() {
        let iq = XmlElement::builder("iq", Some(ns::JABBER_CLIENT))
            .attr("type", "result")
            .child(XmlElement::builder("ping", Some(NS_PING)).build())
            .build();
        assert!(PingModule.handle(&iq).is_none());
    }
}
