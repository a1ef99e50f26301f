//! XEP-0202: Entity Time.

use chrono::{SecondsFormat, Utc};

use crate::stanza::{iq_result, XmlElement};

use super::Module;

/// Namespace for XEP-0202 Entity Time.
pub const NS_TIME: &str = "urn:xmpp:time";

/// Reports the server's current time, always in UTC.
pub struct EntityTimeModule;

impl Module for EntityTimeModule {
    fn name(&self) -> &'static str {
        "entity-time"
    }

    fn namespaces(&self) -> &'static [&'static str] {
        &[NS_TIME]
    }

    fn handle(&self, iq: &XmlElement) -> Option<XmlElement> {
        if iq.attr("type") != Some("get") {
            return None;
        }
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        let payload = XmlElement::builder("time", Some(NS_TIME))
            .child(XmlElement::builder("tzo", Some(NS_TIME)).text("+00:00").build())
            .child(XmlElement::builder("utc", Some(NS_TIME)).text(now).build())
            .build();
        Some(iq_result(iq, Some(payload)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stanza::ns;

    #[test]
    fn time_get_carries_tzo_and_utc() {
        let iq = XmlElement::builder("iq", Some(ns::JABBER_CLIENT))
            .attr("id", "t1")
            .attr("type", "get")
            .child(XmlElement::builder("time", Some(NS_TIME)).build())
            .build();

        let reply = EntityTimeModule.handle(&iq).unwrap();
        let time = reply.find_child("time", Some(NS_TIME)).unwrap();
        assert_eq!(
            time.find_child("tzo", Some(NS_TIME)).unwrap().text(),
            "+00:00"
        );
        let utc = time.find_child("utc", Some(NS_TIME)).unwrap().text();
        assert!(utc.ends_with('Z'));
    }
}
