//! XEP-0092: Software Version.

use crate::stanza::{iq_result, XmlElement};

use super::Module;

/// Namespace for XEP-0092 Software Version.
pub const NS_VERSION: &str = "jabber:iq:version";

/// Reports the server software name and version.
pub struct SoftwareVersionModule {
    name: String,
    version: String,
}

impl SoftwareVersionModule {
    /// Report a custom name and version.
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

impl Default for SoftwareVersionModule {
    fn default() -> Self {
        Self::new(env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
    }
}

impl Module for SoftwareVersionModule {
    fn name(&self) -> &'static str {
        "software-version"
    }

    fn namespaces(&self) -> &'static [&'static str] {
        &[NS_VERSION]
    }

    fn handle(&self, iq: &XmlElement) -> Option<XmlElement> {
        if iq.attr("type") != Some("get") {
            return None;
        }
        let payload = XmlElement::builder("query", Some(NS_VERSION))
            .child(
                XmlElement::builder("name", Some(NS_VERSION))
                    .text(self.name.clone())
                    .build(),
            )
            .child(
                XmlElement::builder("version", Some(NS_VERSION))
                    .text(self.version.clone())
                    .build(),
            )
            .child(
                XmlElement::builder("os", Some(NS_VERSION))
                    .text(std::env::consts::OS)
                    .build(),
            )
            .build();
        Some(iq_result(iq, Some(payload)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stanza::ns;

    #[test]
    fn version_get_reports_name_and_version() {
        let iq = XmlElement::builder("iq", Some(ns::JABBER_CLIENT))
            .attr("id", "v1")
            .attr("type", "get")
            .child(XmlElement::builder("query", Some(NS_VERSION)).build())
            .build();

        let module = SoftwareVersionModule::new("skein", "0.3.0");
        let reply = module.handle(&iq).unwrap();
        let query = reply.find_child("query", Some(NS_VERSION)).unwrap();
        assert_eq!(
            query.find_child("name", Some(NS_VERSION)).unwrap().text(),
            "skein"
        );
        assert_eq!(
            query
                .find_child("version", Some(NS_VERSION))
                .unwrap()
                .text(),
            "0.3.0"
        );
    }

    #[test]
    fn version_set_is_ignored() {
        let iq = XmlElement::builder("iq", Some(ns::JABBER_CLIENT))
            .attr("type", "set")
            .child(XmlElement::builder("query", Some(NS_VERSION)).build())
            .build();
        assert!(SoftwareVersionModule::default().handle(&iq).is_none());
    }
}
