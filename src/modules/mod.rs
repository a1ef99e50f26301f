//! Server feature modules.
//!
//! A module declares the payload namespaces it owns and gets first claim on
//! any `<iq/>` whose payload child lives in one of them, before local
//! delivery. Registration is an explicit startup step into a dispatch map;
//! there is no scanning or reflection.

pub mod ping;
pub mod time;
pub mod version;

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::stanza::XmlElement;

pub use ping::PingModule;
pub use time::EntityTimeModule;
pub use version::SoftwareVersionModule;

/// A server-side feature handler.
pub trait Module: Send + Sync {
    /// Human-readable module name for logs.
    fn name(&self) -> &'static str;

    /// The payload namespaces this module claims.
    fn namespaces(&self) -> &'static [&'static str];

    /// Handle an iq whose payload namespace matched.
    ///
    /// Returns the synchronous reply stanza, or `None` when the module
    /// replies asynchronously through the sender's writer (or not at all).
    fn handle(&self, iq: &XmlElement) -> Option<XmlElement>;
}

/// Dispatch map from payload namespace to module.
pub struct ModuleRegistry {
    by_namespace: HashMap<&'static str, Arc<dyn Module>>,
}

impl ModuleRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            by_namespace: HashMap::new(),
        }
    }

    /// The default module set: Ping (XEP-0199), Entity Time (XEP-0202),
    /// Software Version (XEP-0092).
    pub fn with_default_modules() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(PingModule));
        registry.register(Arc::new(EntityTimeModule));
        registry.register(Arc::new(SoftwareVersionModule::default()));
        registry
    }

    /// Register a module for all namespaces it declares.
    ///
    /// A later registration for the same namespace replaces the earlier one.
    pub fn register(&mut self, module: Arc<dyn Module>) {
        for namespace in module.namespaces() {
            debug!(module = module.name(), namespace, "module registered");
            self.by_namespace.insert(namespace, Arc::clone(&module));
        }
    }

    /// Find the module claiming the iq's payload namespace, if any.
    pub fn module_for(&self, iq: &XmlElement) -> Option<&Arc<dyn Module>> {
        let payload = iq
            .child_elements()
            .find(|child| child.name().local() != "error")?;
        let namespace = payload.name().namespace()?;
        self.by_namespace.get(namespace)
    }

    /// Number of registered namespaces.
    pub fn namespace_count(&self) -> usize {
        self.by_namespace.len()
    }
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::with_default_modules()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stanza::ns;

    fn ping_iq() -> XmlElement {
        XmlElement::builder("iq", Some(ns::JABBER_CLIENT))
            .attr("id", "p1")
            .attr("type", "get")
            .child(XmlElement::builder("ping", Some(ping::NS_PING)).build())
            .build()
    }

    #[test]
    fn default_modules_cover_three_namespaces() {
        let registry = ModuleRegistry::with_default_modules();
        assert_eq!(registry.namespace_count(), 3);
    }

    #[test]
    fn dispatch_by_payload_namespace() {
        let registry = ModuleRegistry::with_default_modules();
        let module = registry.module_for(&ping_iq()).unwrap();
        assert_eq!(module.name(), "ping");
    }

    #[test]
    fn unknown_namespace_matches_nothing() {
        let registry = ModuleRegistry::with_default_modules();
        let iq = XmlElement::builder("iq", Some(ns::JABBER_CLIENT))
            .attr("type", "get")
            .child(XmlElement::builder("query", Some("jabber:iq:private")).build())
            .build();
        assert!(registry.module_for(&iq).is_none());
    }

    #[test]
    fn iq_without_payload_matches_nothing() {
        let registry = ModuleRegistry::with_default_modules();
        let iq = XmlElement::builder("iq", Some(ns::JABBER_CLIENT))
            .attr("type", "result")
            .build();
        assert!(registry.module_for(&iq).is_none());
    }
}
