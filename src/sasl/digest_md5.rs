//! DIGEST-MD5 SASL mechanism (RFC 2831).
//!
//! Three-step server side: an initial challenge with a fresh nonce, proof
//! verification against the digest response, then `rspauth` mutual
//! authentication before the final success.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use base64::prelude::*;
use md5::{Digest, Md5};
use rand::Rng;
use tracing::debug;

use super::{authcid_to_jid, Mechanism, SaslFailure, StepOutcome};
use crate::jid::Jid;
use crate::storage::AccountManagement;

enum DigestState {
    Initial,
    Challenged { nonce: String },
    Verified { jid: Jid },
    Complete,
}

/// Server side of one DIGEST-MD5 exchange.
pub struct DigestMd5Mechanism {
    accounts: Arc<dyn AccountManagement>,
    domain: String,
    state: DigestState,
}

impl DigestMd5Mechanism {
    /// Create a fresh exchange.
    pub fn new(accounts: Arc<dyn AccountManagement>, domain: String) -> Self {
        Self {
            accounts,
            domain,
            state: DigestState::Initial,
        }
    }

    fn initial_challenge(&mut self) -> StepOutcome {
        let mut nonce_bytes = [0u8; 24];
        rand::rng().fill(&mut nonce_bytes[..]);
        let nonce = BASE64_STANDARD.encode(nonce_bytes);

        let challenge = format!(
            "realm=\"{}\",nonce=\"{}\",qop=\"auth\",charset=utf-8,algorithm=md5-sess",
            self.domain, nonce
        );
        self.state = DigestState::Challenged { nonce };
        StepOutcome::Continue(challenge.into_bytes())
    }

    async fn verify_response(&mut self, nonce: String, input: &[u8]) -> StepOutcome {
        let Ok(response) = std::str::from_utf8(input) else {
            return StepOutcome::Failure(SaslFailure::MalformedRequest);
        };
        let directives = parse_directives(response);

        let required = |key: &str| -> Result<&str, SaslFailure> {
            directives
                .get(key)
                .map(String::as_str)
                .ok_or(SaslFailure::MalformedRequest)
        };
        let (username, client_nonce_echo, cnonce, nc, digest_uri, client_response) = match (
            required("username"),
            required("nonce"),
            required("cnonce"),
            required("nc"),
            required("digest-uri"),
            required("response"),
        ) {
            (Ok(a), Ok(b), Ok(c), Ok(d), Ok(e), Ok(f)) => (a, b, c, d, e, f),
            _ => return StepOutcome::Failure(SaslFailure::MalformedRequest),
        };

        if client_nonce_echo != nonce {
            return StepOutcome::Failure(SaslFailure::MalformedRequest);
        }
        if let Some(realm) = directives.get("realm") {
            if realm != &self.domain {
                return StepOutcome::Failure(SaslFailure::NotAuthorized);
            }
        }

        let Some(jid) = authcid_to_jid(username, &self.domain) else {
            return StepOutcome::Failure(SaslFailure::NotAuthorized);
        };
        let Some(password) = self.accounts.password(&jid).await else {
            return if self.accounts.exists(&jid).await {
                StepOutcome::Failure(SaslFailure::TemporaryAuthFailure)
            } else {
                StepOutcome::Failure(SaslFailure::NotAuthorized)
            };
        };

        let authzid = directives.get("authzid").map(String::as_str);
        if let Some(authzid) = authzid {
            if authcid_to_jid(authzid, &self.domain).as_ref() != Some(&jid) {
                return StepOutcome::Failure(SaslFailure::InvalidAuthzid);
            }
        }

        let ha1 = compute_ha1(username, &self.domain, &password, &nonce, cnonce, authzid);
        let expected = digest_response(&ha1, &nonce, nc, cnonce, "AUTHENTICATE", digest_uri);
        if !constant_time_eq(expected.as_bytes(), client_response.as_bytes()) {
            debug!(jid = %jid, "DIGEST-MD5 response did not verify");
            return StepOutcome::Failure(SaslFailure::NotAuthorized);
        }

        // Mutual authentication: rspauth uses an empty method in A2.
        let rspauth = digest_response(&ha1, &nonce, nc, cnonce, "", digest_uri);
        self.state = DigestState::Verified { jid };
        StepOutcome::Continue(format!("rspauth={}", rspauth).into_bytes())
    }
}

#[async_trait]
impl Mechanism for DigestMd5Mechanism {
    fn name(&self) -> &'static str {
        "DIGEST-MD5"
    }

    async fn step(&mut self, input: &[u8]) -> StepOutcome {
        match std::mem::replace(&mut self.state, DigestState::Complete) {
            DigestState::Initial => {
                if !input.is_empty() {
                    return StepOutcome::Failure(SaslFailure::MalformedRequest);
                }
                self.initial_challenge()
            }
            DigestState::Challenged { nonce } => self.verify_response(nonce, input).await,
            DigestState::Verified { jid } => {
                // The client acknowledges rspauth with an empty response.
                if !input.is_empty() {
                    return StepOutcome::Failure(SaslFailure::MalformedRequest);
                }
                debug!(jid = %jid, "DIGEST-MD5 authentication succeeded");
                StepOutcome::Success { jid, data: None }
            }
            DigestState::Complete => StepOutcome::Failure(SaslFailure::MalformedRequest),
        }
    }
}

/// Parse comma-separated `key=value` directives, unquoting values.
fn parse_directives(input: &str) -> HashMap<String, String> {
    let mut directives = HashMap::new();
    let mut rest = input;
    while !rest.is_empty() {
        let Some(eq) = rest.find('=') else { break };
        let key = rest[..eq].trim().to_string();
        rest = &rest[eq + 1..];

        let value;
        if let Some(stripped) = rest.strip_prefix('"') {
            let Some(close) = stripped.find('"') else { break };
            value = stripped[..close].to_string();
            rest = stripped[close + 1..].trim_start_matches(',');
        } else {
            match rest.find(',') {
                Some(comma) => {
                    value = rest[..comma].to_string();
                    rest = &rest[comma + 1..];
                }
                None => {
                    value = rest.to_string();
                    rest = "";
                }
            }
        }
        directives.insert(key, value);
    }
    directives
}

/// A1 for md5-sess: `MD5(MD5(user:realm:pass):nonce:cnonce[:authzid])`, hex.
fn compute_ha1(
    username: &str,
    realm: &str,
    password: &str,
    nonce: &str,
    cnonce: &str,
    authzid: Option<&str>,
) -> String {
    let inner = md5_raw(format!("{}:{}:{}", username, realm, password).as_bytes());

    let mut hasher = Md5::new();
    hasher.update(inner);
    hasher.update(format!(":{}:{}", nonce, cnonce));
    if let Some(authzid) = authzid {
        hasher.update(format!(":{}", authzid));
    }
    hex::encode(hasher.finalize())
}

/// The response/rspauth value; `method` is "AUTHENTICATE" for the client
/// proof and empty for rspauth.
fn digest_response(
    ha1_hex: &str,
    nonce: &str,
    nc: &str,
    cnonce: &str,
    method: &str,
    digest_uri: &str,
) -> String {
    let ha2 = hex::encode(md5_raw(format!("{}:{}", method, digest_uri).as_bytes()));
    hex::encode(md5_raw(
        format!("{}:{}:{}:{}:auth:{}", ha1_hex, nonce, nc, cnonce, ha2).as_bytes(),
    ))
}

fn md5_raw(data: &[u8]) -> Vec<u8> {
    let mut hasher = Md5::new();
    hasher.update(data);
    hasher.finalize().to_vec()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryAccounts;

    fn mechanism() -> DigestMd5Mechanism {
        let accounts = Arc::new(MemoryAccounts::with_users(&[(
            "user1@skein.im",
            "password1",
        )]));
        DigestMd5Mechanism::new(accounts, "skein.im".to_string())
    }

    fn extract_nonce(challenge: &str) -> String {
        let directives = parse_directives(challenge);
        directives.get("nonce").unwrap().clone()
    }

    async fn run_exchange(password: &str) -> StepOutcome {
        let mut mech = mechanism();

        let challenge = match mech.step(b"").await {
            StepOutcome::Continue(data) => String::from_utf8(data).unwrap(),
            other => panic!("expected challenge, got {:?}", other),
        };
        assert!(challenge.contains("qop=\"auth\""));
        assert!(challenge.contains("algorithm=md5-sess"));
        let nonce = extract_nonce(&challenge);

        let cnonce = "OA6MHXh6VqTrRk";
        let nc = "00000001";
        let digest_uri = "xmpp/skein.im";

        let ha1 = compute_ha1("user1", "skein.im", password, &nonce, cnonce, None);
        let response = digest_response(&ha1, &nonce, nc, cnonce, "AUTHENTICATE", digest_uri);

        let client_response = format!(
            "username=\"user1\",realm=\"skein.im\",nonce=\"{}\",cnonce=\"{}\",\
             nc={},qop=auth,digest-uri=\"{}\",response={},charset=utf-8",
            nonce, cnonce, nc, digest_uri, response
        );

        let rspauth = match mech.step(client_response.as_bytes()).await {
            StepOutcome::Continue(data) => String::from_utf8(data).unwrap(),
            other => return other,
        };
        assert!(rspauth.starts_with("rspauth="));

        mech.step(b"").await
    }

    #[tokio::test]
    async fn full_exchange_succeeds() {
        match run_exchange("password1").await {
            StepOutcome::Success { jid, .. } => {
                assert_eq!(jid.to_string(), "user1@skein.im");
            }
            other => panic!("expected success, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn wrong_password_fails() {
        let outcome = run_exchange("wrong").await;
        assert!(matches!(
            outcome,
            StepOutcome::Failure(SaslFailure::NotAuthorized)
        ));
    }

    #[tokio::test]
    async fn missing_directives_are_malformed() {
        let mut mech = mechanism();
        let StepOutcome::Continue(_) = mech.step(b"").await else {
            panic!("expected challenge");
        };
        let outcome = mech.step(b"username=\"user1\"").await;
        assert!(matches!(
            outcome,
            StepOutcome::Failure(SaslFailure::MalformedRequest)
        ));
    }

    #[tokio::test]
    async fn stale_nonce_rejected() {
        let mut mech = mechanism();
        let StepOutcome::Continue(_) = mech.step(b"").await else {
            panic!("expected challenge");
        };
        let outcome = mech
            .step(
                b"username=\"user1\",nonce=\"forged\",cnonce=\"x\",nc=00000001,\
                  digest-uri=\"xmpp/skein.im\",response=0000",
            )
            .await;
        assert!(matches!(
            outcome,
            StepOutcome::Failure(SaslFailure::MalformedRequest)
        ));
    }

    #[test]
    fn directive_parsing_handles_quotes() {
        let parsed = parse_directives("a=\"x,y\",b=plain,c=\"z\"");
        assert_eq!(parsed.get("a").map(String::as_str), Some("x,y"));
        assert_eq!(parsed.get("b").map(String::as_str), Some("plain"));
        assert_eq!(parsed.get("c").map(String::as_str), Some("z"));
    }
}
