//! SASL authentication (RFC 4422) for XMPP streams.
//!
//! Each mechanism is a state object driven by [`Mechanism::step`]: the raw
//! (already base64-decoded) client payload goes in, and the outcome is a
//! challenge to continue, a success with the authenticated identity, or a
//! failure kind. Credential checks go through the external
//! [`AccountManagement`](crate::storage::AccountManagement) interface;
//! passwords never reach the logs.

mod digest_md5;
mod plain;
mod scram;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

pub use digest_md5::DigestMd5Mechanism;
pub use plain::PlainMechanism;
pub use scram::{ScramSha1Mechanism, ScramState};

use crate::jid::Jid;
use crate::storage::AccountManagement;

/// Consecutive SASL failures tolerated before the transport is closed.
pub const MAX_FAILURES: u8 = 5;

/// The supported mechanisms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum MechanismKind {
    /// PLAIN (RFC 4616); only offered over TLS
    Plain,
    /// DIGEST-MD5 (RFC 2831)
    DigestMd5,
    /// SCRAM-SHA-1 (RFC 5802)
    ScramSha1,
}

impl MechanismKind {
    /// The IANA mechanism name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plain => "PLAIN",
            Self::DigestMd5 => "DIGEST-MD5",
            Self::ScramSha1 => "SCRAM-SHA-1",
        }
    }

    /// Parse an IANA mechanism name.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "PLAIN" => Some(Self::Plain),
            "DIGEST-MD5" => Some(Self::DigestMd5),
            "SCRAM-SHA-1" => Some(Self::ScramSha1),
            _ => None,
        }
    }

    /// Whether the mechanism exposes the password and therefore requires an
    /// encrypted transport.
    pub fn requires_tls(&self) -> bool {
        matches!(self, Self::Plain)
    }
}

impl std::fmt::Display for MechanismKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<String> for MechanismKind {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value).ok_or_else(|| format!("unknown SASL mechanism '{}'", value))
    }
}

/// Failure kinds, mirroring the defined conditions of RFC 6120 Section 6.5.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaslFailure {
    /// The requested authorization identity is not permitted
    InvalidAuthzid,
    /// The account's credentials have expired
    CredentialsExpired,
    /// Credentials did not verify
    NotAuthorized,
    /// A transient backend problem prevented verification
    TemporaryAuthFailure,
    /// The payload could not be parsed
    MalformedRequest,
    /// The mechanism is not offered in this context
    InvalidMechanism,
}

impl SaslFailure {
    /// The defined-condition element name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidAuthzid => "invalid-authzid",
            Self::CredentialsExpired => "credentials-expired",
            Self::NotAuthorized => "not-authorized",
            Self::TemporaryAuthFailure => "temporary-auth-failure",
            Self::MalformedRequest => "malformed-request",
            Self::InvalidMechanism => "invalid-mechanism",
        }
    }
}

impl std::fmt::Display for SaslFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome of one mechanism step.
#[derive(Debug)]
pub enum StepOutcome {
    /// Send this challenge and wait for the next client response
    Continue(Vec<u8>),
    /// Authentication finished
    Success {
        /// The authenticated bare JID
        jid: Jid,
        /// Additional data to ride along in `<success/>` (SCRAM's `v=...`)
        data: Option<Vec<u8>>,
    },
    /// Authentication failed
    Failure(SaslFailure),
}

/// One SASL mechanism exchange.
///
/// A fresh instance handles exactly one authentication attempt; the protocol
/// state machine discards it after a success or failure.
#[async_trait]
pub trait Mechanism: Send {
    /// The IANA mechanism name.
    fn name(&self) -> &'static str;

    /// Process one client payload.
    async fn step(&mut self, input: &[u8]) -> StepOutcome;
}

/// Creates mechanism instances for incoming `<auth/>` requests.
pub struct MechanismRegistry {
    enabled: Vec<MechanismKind>,
    accounts: Arc<dyn AccountManagement>,
    domain: String,
}

impl MechanismRegistry {
    /// Create a registry for the configured mechanisms.
    pub fn new(
        enabled: Vec<MechanismKind>,
        accounts: Arc<dyn AccountManagement>,
        domain: impl Into<String>,
    ) -> Self {
        Self {
            enabled,
            accounts,
            domain: domain.into(),
        }
    }

    /// The mechanism names to advertise in stream features.
    ///
    /// PLAIN is withheld until the transport is encrypted.
    pub fn advertised(&self, encrypted: bool) -> Vec<&'static str> {
        self.enabled
            .iter()
            .filter(|kind| encrypted || !kind.requires_tls())
            .map(MechanismKind::as_str)
            .collect()
    }

    /// Instantiate a mechanism by name, honoring the TLS gate.
    pub fn start(&self, name: &str, encrypted: bool) -> Option<Box<dyn Mechanism>> {
        let kind = MechanismKind::parse(name)?;
        if !self.enabled.contains(&kind) {
            return None;
        }
        if kind.requires_tls() && !encrypted {
            return None;
        }
        let accounts = Arc::clone(&self.accounts);
        let domain = self.domain.clone();
        Some(match kind {
            MechanismKind::Plain => Box::new(PlainMechanism::new(accounts, domain)),
            MechanismKind::DigestMd5 => Box::new(DigestMd5Mechanism::new(accounts, domain)),
            MechanismKind::ScramSha1 => Box::new(ScramSha1Mechanism::new(accounts, domain)),
        })
    }
}

/// Resolve the authentication identity to a bare JID.
///
/// Clients send either a bare JID or just the localpart; the localpart form
/// is completed with the server domain.
pub(crate) fn authcid_to_jid(authcid: &str, domain: &str) -> Option<Jid> {
    let jid = if authcid.contains('@') {
        Jid::parse(authcid).ok()?
    } else {
        Jid::new(Some(authcid), domain, None).ok()?
    };
    (jid.domain() == domain).then(|| jid.to_bare())
}
