//! SASL PLAIN (RFC 4616).
//!
//! The payload is `authzid NUL authcid NUL password`. PLAIN is only offered
//! over an encrypted transport; the registry enforces that gate.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::{authcid_to_jid, Mechanism, SaslFailure, StepOutcome};
use crate::storage::AccountManagement;

/// Server side of the PLAIN exchange; single-step.
pub struct PlainMechanism {
    accounts: Arc<dyn AccountManagement>,
    domain: String,
    used: bool,
}

impl PlainMechanism {
    /// Create a fresh exchange.
    pub fn new(accounts: Arc<dyn AccountManagement>, domain: String) -> Self {
        Self {
            accounts,
            domain,
            used: false,
        }
    }
}

#[async_trait]
impl Mechanism for PlainMechanism {
    fn name(&self) -> &'static str {
        "PLAIN"
    }

    async fn step(&mut self, input: &[u8]) -> StepOutcome {
        if self.used {
            return StepOutcome::Failure(SaslFailure::MalformedRequest);
        }
        self.used = true;

        let mut parts = input.split(|&b| b == 0);
        let (Some(authzid), Some(authcid), Some(password)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return StepOutcome::Failure(SaslFailure::MalformedRequest);
        };
        if parts.next().is_some() {
            return StepOutcome::Failure(SaslFailure::MalformedRequest);
        }

        let (Ok(authzid), Ok(authcid), Ok(password)) = (
            std::str::from_utf8(authzid),
            std::str::from_utf8(authcid),
            std::str::from_utf8(password),
        ) else {
            return StepOutcome::Failure(SaslFailure::MalformedRequest);
        };

        let Some(jid) = authcid_to_jid(authcid, &self.domain) else {
            return StepOutcome::Failure(SaslFailure::NotAuthorized);
        };

        // An authorization identity, when present, must denote the
        // authentication identity itself; acting on behalf of other
        // entities is not supported.
        if !authzid.is_empty() {
            let authorized = authcid_to_jid(authzid, &self.domain);
            if authorized.as_ref() != Some(&jid) {
                return StepOutcome::Failure(SaslFailure::InvalidAuthzid);
            }
        }

        if self.accounts.verify(&jid, password).await {
            debug!(jid = %jid, "PLAIN authentication succeeded");
            StepOutcome::Success { jid, data: None }
        } else {
            debug!(jid = %jid, "PLAIN authentication failed");
            StepOutcome::Failure(SaslFailure::NotAuthorized)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryAccounts;

    fn mechanism() -> PlainMechanism {
        let accounts = Arc::new(MemoryAccounts::with_users(&[(
            "user1@skein.im",
            "password1",
        )]));
        PlainMechanism::new(accounts, "skein.im".to_string())
    }

    #[tokio::test]
    async fn valid_credentials_succeed() {
        let mut mech = mechanism();
        let outcome = mech.step(b"\0user1\0password1").await;
        match outcome {
            StepOutcome::Success { jid, data } => {
                assert_eq!(jid.to_string(), "user1@skein.im");
                assert!(data.is_none());
            }
            other => panic!("expected success, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn full_jid_authcid_succeeds() {
        let mut mech = mechanism();
        let outcome = mech.step(b"\0user1@skein.im\0password1").await;
        assert!(matches!(outcome, StepOutcome::Success { .. }));
    }

    #[tokio::test]
    async fn wrong_password_is_not_authorized() {
        let mut mech = mechanism();
        let outcome = mech.step(b"\0user1\0wrong").await;
        assert!(matches!(
            outcome,
            StepOutcome::Failure(SaslFailure::NotAuthorized)
        ));
    }

    #[tokio::test]
    async fn unknown_user_is_not_authorized() {
        let mut mech = mechanism();
        let outcome = mech.step(b"\0ghost\0password1").await;
        assert!(matches!(
            outcome,
            StepOutcome::Failure(SaslFailure::NotAuthorized)
        ));
    }

    #[tokio::test]
    async fn foreign_authzid_rejected() {
        let mut mech = mechanism();
        let outcome = mech.step(b"user2@skein.im\0user1\0password1").await;
        assert!(matches!(
            outcome,
            StepOutcome::Failure(SaslFailure::InvalidAuthzid)
        ));
    }

    #[tokio::test]
    async fn matching_authzid_accepted() {
        let mut mech = mechanism();
        let outcome = mech.step(b"user1@skein.im\0user1\0password1").await;
        assert!(matches!(outcome, StepOutcome::Success { .. }));
    }

    #[tokio::test]
    async fn missing_separator_is_malformed() {
        let mut mech = mechanism();
        let outcome = mech.step(b"user1password1").await;
        assert!(matches!(
            outcome,
            StepOutcome::Failure(SaslFailure::MalformedRequest)
        ));
    }
}
