//! # skein-xmpp
//!
//! An embeddable XMPP server core following RFC 6120/6121, with a BOSH
//! bridge (XEP-0124/0206) and server dialback federation (XEP-0220).
//!
//! ## Architecture
//!
//! - **Decoder**: streaming XML over a namespace-scoped assembler; stanzas
//!   materialize one at a time, with restart support for STARTTLS and SASL
//! - **Connection actors**: one task per transport, owning the socket; all
//!   other components talk to a session through its writer handle
//! - **Protocol state machine**: `INITIATED → OPENED → ENCRYPTED →
//!   AUTHENTICATED → BOUND → CLOSED`, with feature lists derived from where
//!   negotiation stands
//! - **Router**: local delivery via the session registry, module dispatch by
//!   payload namespace, offline hand-off, and S2S forwarding
//!
//! Storage (accounts, rosters, offline messages) is delegated through the
//! traits in [`storage`]; the crate ships in-memory implementations used by
//! the test suites.

pub mod bosh;
pub mod config;
pub mod connection;
pub mod decoder;
pub mod jid;
pub mod modules;
pub mod protocol;
pub mod registry;
pub mod roster;
pub mod router;
pub mod s2s;
pub mod sasl;
pub mod server;
pub mod session;
pub mod stanza;
pub mod storage;

mod error;

pub use config::ServerConfig;
pub use error::{
    as_stanza_error, stanza_error_reply, stream_error_xml, StanzaErrorCondition,
    StanzaErrorType, StreamErrorCondition, XmppError,
};
pub use jid::{Jid, JidError};
pub use protocol::{ProtocolAction, SessionStateMachine};
pub use registry::{SendResult, SessionRegistry};
pub use router::{RoutingOutcome, StanzaRouter};
pub use server::{ListenConfig, XmppServer};
pub use session::{SessionState, SessionWriter};
pub use stanza::{StanzaKind, XmlElement};

use std::sync::Arc;

use modules::ModuleRegistry;
use roster::RosterService;
use s2s::S2sManager;
use sasl::MechanismRegistry;
use storage::{AccountManagement, OfflineStore, RosterManager};

/// Everything handlers need, passed explicitly instead of living in
/// process-wide singletons.
pub struct ServerRuntimeContext {
    /// The domain this server is authoritative for
    pub domain: String,
    /// Validated server configuration
    pub config: ServerConfig,
    /// Routing table of bound sessions
    pub registry: Arc<SessionRegistry>,
    /// Feature modules keyed by payload namespace
    pub modules: Arc<ModuleRegistry>,
    /// Account storage and credential checks
    pub accounts: Arc<dyn AccountManagement>,
    /// Roster and subscription service
    pub roster: Arc<RosterService>,
    /// Offline message storage
    pub offline: Arc<dyn OfflineStore>,
    /// The stanza router
    pub router: Arc<StanzaRouter>,
    /// SASL mechanism factory
    pub sasl: MechanismRegistry,
    /// Outbound federation, when enabled
    pub s2s: Option<Arc<S2sManager>>,
}

impl ServerRuntimeContext {
    /// Assemble the runtime from configuration and storage providers.
    pub fn new(
        config: ServerConfig,
        accounts: Arc<dyn AccountManagement>,
        roster_manager: Arc<dyn RosterManager>,
        offline: Arc<dyn OfflineStore>,
    ) -> Result<Arc<Self>, XmppError> {
        config.validate()?;
        let domain = config.server_domain.clone();

        let registry = Arc::new(SessionRegistry::new());
        let modules = Arc::new(ModuleRegistry::with_default_modules());
        let roster = Arc::new(RosterService::new(roster_manager));

        let s2s = if config.s2s.enabled {
            Some(Arc::new(S2sManager::new(
                domain.clone(),
                config.s2s.effective_secret(),
            )))
        } else {
            None
        };

        let router = Arc::new(StanzaRouter::new(
            domain.clone(),
            Arc::clone(&registry),
            Arc::clone(&modules),
            Arc::clone(&roster),
            Arc::clone(&offline),
            s2s.clone(),
        ));

        let sasl = MechanismRegistry::new(
            config.sasl.mechanisms.clone(),
            Arc::clone(&accounts),
            domain.clone(),
        );

        Ok(Arc::new(Self {
            domain,
            config,
            registry,
            modules,
            accounts,
            roster,
            offline,
            router,
            sasl,
            s2s,
        }))
    }
}
