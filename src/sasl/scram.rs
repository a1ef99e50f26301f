//! SCRAM-SHA-1 SASL mechanism (RFC 5802).
//!
//! Server side of the salted challenge-response exchange:
//!
//! 1. Client sends client-first-message: `n,,n=user,r=clientnonce`
//! 2. Server sends server-first-message: `r=nonce,s=salt,i=iterations`
//! 3. Client sends client-final-message: `c=channel,r=nonce,p=clientproof`
//! 4. Server verifies the proof; the server signature `v=...` rides back in
//!    the success payload.
//!
//! Channel binding is not supported: the `n` (and downgraded `y`) GS2 flags
//! are accepted, `p` is refused.

use std::sync::Arc;

use async_trait::async_trait;
use base64::prelude::*;
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use rand::Rng;
use sha1::{Digest, Sha1};
use tracing::debug;

use super::{authcid_to_jid, Mechanism, SaslFailure, StepOutcome};
use crate::jid::Jid;
use crate::storage::AccountManagement;

/// PBKDF2 iteration count announced in server-first-message.
pub const ITERATIONS: u32 = 4096;

const NONCE_LENGTH: usize = 24;
const SALT_LENGTH: usize = 16;
const SHA1_LEN: usize = 20;

/// Exchange state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScramState {
    /// Waiting for client-first-message
    Initial,
    /// Waiting for client-final-message
    WaitingForClientFinal,
    /// Exchange finished, successfully or not
    Complete,
}

/// Server side of one SCRAM-SHA-1 exchange.
pub struct ScramSha1Mechanism {
    accounts: Arc<dyn AccountManagement>,
    domain: String,
    state: ScramState,
    jid: Option<Jid>,
    client_first_bare: String,
    server_first: String,
    combined_nonce: String,
    stored_key: Vec<u8>,
    server_key: Vec<u8>,
}

impl ScramSha1Mechanism {
    /// Create a fresh exchange.
    pub fn new(accounts: Arc<dyn AccountManagement>, domain: String) -> Self {
        Self {
            accounts,
            domain,
            state: ScramState::Initial,
            jid: None,
            client_first_bare: String::new(),
            server_first: String::new(),
            combined_nonce: String::new(),
            stored_key: Vec::new(),
            server_key: Vec::new(),
        }
    }

    /// Current exchange state.
    pub fn state(&self) -> ScramState {
        self.state
    }

    async fn client_first(&mut self, input: &[u8]) -> StepOutcome {
        let Ok(message) = std::str::from_utf8(input) else {
            return StepOutcome::Failure(SaslFailure::MalformedRequest);
        };
        let parsed = match parse_client_first(message) {
            Ok(parsed) => parsed,
            Err(failure) => return StepOutcome::Failure(failure),
        };

        let Some(jid) = authcid_to_jid(&parsed.username, &self.domain) else {
            return StepOutcome::Failure(SaslFailure::NotAuthorized);
        };

        // Verification material is derived from the stored password; a
        // backend without password access cannot serve SCRAM.
        let Some(password) = self.accounts.password(&jid).await else {
            self.state = ScramState::Complete;
            return if self.accounts.exists(&jid).await {
                StepOutcome::Failure(SaslFailure::TemporaryAuthFailure)
            } else {
                StepOutcome::Failure(SaslFailure::NotAuthorized)
            };
        };

        let salt = random_bytes(SALT_LENGTH);
        let (stored_key, server_key) = derive_keys(&password, &salt, ITERATIONS);
        self.stored_key = stored_key;
        self.server_key = server_key;
        self.jid = Some(jid);

        let server_nonce = BASE64_STANDARD.encode(random_bytes(NONCE_LENGTH));
        self.combined_nonce = format!("{}{}", parsed.client_nonce, server_nonce);
        self.client_first_bare = parsed.bare;
        self.server_first = format!(
            "r={},s={},i={}",
            self.combined_nonce,
            BASE64_STANDARD.encode(&salt),
            ITERATIONS
        );

        self.state = ScramState::WaitingForClientFinal;
        StepOutcome::Continue(self.server_first.clone().into_bytes())
    }

    async fn client_final(&mut self, input: &[u8]) -> StepOutcome {
        self.state = ScramState::Complete;

        let Ok(message) = std::str::from_utf8(input) else {
            return StepOutcome::Failure(SaslFailure::MalformedRequest);
        };
        let parsed = match parse_client_final(message) {
            Ok(parsed) => parsed,
            Err(failure) => return StepOutcome::Failure(failure),
        };

        if parsed.nonce != self.combined_nonce {
            debug!("SCRAM nonce mismatch");
            return StepOutcome::Failure(SaslFailure::NotAuthorized);
        }

        let auth_message = format!(
            "{},{},{}",
            self.client_first_bare, self.server_first, parsed.without_proof
        );

        let Ok(client_proof) = BASE64_STANDARD.decode(&parsed.proof) else {
            return StepOutcome::Failure(SaslFailure::MalformedRequest);
        };
        if client_proof.len() != SHA1_LEN {
            return StepOutcome::Failure(SaslFailure::MalformedRequest);
        }

        let client_signature = hmac_sha1(&self.stored_key, auth_message.as_bytes());
        let client_key: Vec<u8> = client_proof
            .iter()
            .zip(client_signature.iter())
            .map(|(a, b)| a ^ b)
            .collect();

        if sha1(&client_key) != self.stored_key {
            debug!("SCRAM client proof did not verify");
            return StepOutcome::Failure(SaslFailure::NotAuthorized);
        }

        let server_signature = hmac_sha1(&self.server_key, auth_message.as_bytes());
        let server_final = format!("v={}", BASE64_STANDARD.encode(server_signature));

        let jid = self.jid.clone().expect("jid set in client-first step");
        debug!(jid = %jid, "SCRAM-SHA-1 authentication succeeded");
        StepOutcome::Success {
            jid,
            data: Some(server_final.into_bytes()),
        }
    }
}

#[async_trait]
impl Mechanism for ScramSha1Mechanism {
    fn name(&self) -> &'static str {
        "SCRAM-SHA-1"
    }

    async fn step(&mut self, input: &[u8]) -> StepOutcome {
        match self.state {
            ScramState::Initial => self.client_first(input).await,
            ScramState::WaitingForClientFinal => self.client_final(input).await,
            ScramState::Complete => StepOutcome::Failure(SaslFailure::MalformedRequest),
        }
    }
}

struct ClientFirst {
    username: String,
    client_nonce: String,
    bare: String,
}

struct ClientFinal {
    nonce: String,
    proof: String,
    without_proof: String,
}

fn parse_client_first(message: &str) -> Result<ClientFirst, SaslFailure> {
    let mut parts = message.splitn(3, ',');
    let (Some(gs2_flag), Some(authzid), Some(bare)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(SaslFailure::MalformedRequest);
    };

    // 'p' requests channel binding, which is not supported here.
    if gs2_flag != "n" && gs2_flag != "y" {
        return Err(SaslFailure::MalformedRequest);
    }
    if !authzid.is_empty() && !authzid.starts_with("a=") {
        return Err(SaslFailure::MalformedRequest);
    }

    let mut username = None;
    let mut client_nonce = None;
    for attr in bare.split(',') {
        if let Some(value) = attr.strip_prefix("n=") {
            username = Some(decode_sasl_name(value)?);
        } else if let Some(value) = attr.strip_prefix("r=") {
            client_nonce = Some(value.to_string());
        }
    }

    Ok(ClientFirst {
        username: username.ok_or(SaslFailure::MalformedRequest)?,
        client_nonce: client_nonce.ok_or(SaslFailure::MalformedRequest)?,
        bare: bare.to_string(),
    })
}

fn parse_client_final(message: &str) -> Result<ClientFinal, SaslFailure> {
    let proof_idx = message
        .rfind(",p=")
        .ok_or(SaslFailure::MalformedRequest)?;
    let without_proof = &message[..proof_idx];
    let proof = &message[proof_idx + 3..];

    let mut nonce = None;
    for attr in without_proof.split(',') {
        if let Some(value) = attr.strip_prefix("r=") {
            nonce = Some(value.to_string());
        }
    }

    Ok(ClientFinal {
        nonce: nonce.ok_or(SaslFailure::MalformedRequest)?,
        proof: proof.to_string(),
        without_proof: without_proof.to_string(),
    })
}

/// Decode RFC 5802 name escaping (`=2C` for `,`, `=3D` for `=`).
fn decode_sasl_name(name: &str) -> Result<String, SaslFailure> {
    let mut result = String::with_capacity(name.len());
    let mut chars = name.chars();
    while let Some(c) = chars.next() {
        if c == '=' {
            let escape: String = chars.by_ref().take(2).collect();
            match escape.as_str() {
                "2C" => result.push(','),
                "3D" => result.push('='),
                _ => return Err(SaslFailure::MalformedRequest),
            }
        } else {
            result.push(c);
        }
    }
    Ok(result)
}

/// Derive `(StoredKey, ServerKey)` from a password and salt.
pub fn derive_keys(password: &str, salt: &[u8], iterations: u32) -> (Vec<u8>, Vec<u8>) {
    let mut salted = [0u8; SHA1_LEN];
    pbkdf2_hmac::<Sha1>(password.as_bytes(), salt, iterations, &mut salted);

    let client_key = hmac_sha1(&salted, b"Client Key");
    let stored_key = sha1(&client_key);
    let server_key = hmac_sha1(&salted, b"Server Key");
    (stored_key, server_key)
}

fn random_bytes(len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    rand::rng().fill(&mut bytes[..]);
    bytes
}

fn hmac_sha1(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac =
        Hmac::<Sha1>::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn sha1(data: &[u8]) -> Vec<u8> {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryAccounts;

    fn mechanism() -> ScramSha1Mechanism {
        let accounts = Arc::new(MemoryAccounts::with_users(&[(
            "user1@skein.im",
            "password1",
        )]));
        ScramSha1Mechanism::new(accounts, "skein.im".to_string())
    }

    /// Drive the client side of the exchange with the given password.
    async fn run_exchange(mut mech: ScramSha1Mechanism, password: &str) -> StepOutcome {
        let client_nonce = "fyko+d2lbbFgONRv9qkxdawL";
        let client_first = format!("n,,n=user1,r={}", client_nonce);

        let server_first = match mech.step(client_first.as_bytes()).await {
            StepOutcome::Continue(data) => String::from_utf8(data).unwrap(),
            other => panic!("expected continue, got {:?}", other),
        };

        // Parse salt and iteration count from the server-first-message.
        let mut salt = None;
        let mut iterations = None;
        let mut combined_nonce = None;
        for attr in server_first.split(',') {
            if let Some(v) = attr.strip_prefix("s=") {
                salt = Some(BASE64_STANDARD.decode(v).unwrap());
            } else if let Some(v) = attr.strip_prefix("i=") {
                iterations = Some(v.parse::<u32>().unwrap());
            } else if let Some(v) = attr.strip_prefix("r=") {
                combined_nonce = Some(v.to_string());
            }
        }
        let (salt, iterations, combined_nonce) =
            (salt.unwrap(), iterations.unwrap(), combined_nonce.unwrap());
        assert!(combined_nonce.starts_with(client_nonce));

        // Client-side proof computation.
        let mut salted = [0u8; SHA1_LEN];
        pbkdf2_hmac::<Sha1>(password.as_bytes(), &salt, iterations, &mut salted);
        let client_key = hmac_sha1(&salted, b"Client Key");
        let stored_key = sha1(&client_key);

        let channel_binding = BASE64_STANDARD.encode("n,,");
        let without_proof = format!("c={},r={}", channel_binding, combined_nonce);
        let auth_message = format!(
            "n=user1,r={},{},{}",
            client_nonce, server_first, without_proof
        );
        let client_signature = hmac_sha1(&stored_key, auth_message.as_bytes());
        let proof: Vec<u8> = client_key
            .iter()
            .zip(client_signature.iter())
            .map(|(a, b)| a ^ b)
            .collect();

        let client_final = format!("{},p={}", without_proof, BASE64_STANDARD.encode(proof));
        mech.step(client_final.as_bytes()).await
    }

    #[tokio::test]
    async fn full_exchange_succeeds() {
        let outcome = run_exchange(mechanism(), "password1").await;
        match outcome {
            StepOutcome::Success { jid, data } => {
                assert_eq!(jid.to_string(), "user1@skein.im");
                let server_final = String::from_utf8(data.unwrap()).unwrap();
                assert!(server_final.starts_with("v="));
            }
            other => panic!("expected success, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn wrong_password_fails() {
        let outcome = run_exchange(mechanism(), "wrong-password").await;
        assert!(matches!(
            outcome,
            StepOutcome::Failure(SaslFailure::NotAuthorized)
        ));
    }

    #[tokio::test]
    async fn unknown_user_fails_at_first_step() {
        let mut mech = mechanism();
        let outcome = mech.step(b"n,,n=ghost,r=abcdef").await;
        assert!(matches!(
            outcome,
            StepOutcome::Failure(SaslFailure::NotAuthorized)
        ));
    }

    #[tokio::test]
    async fn channel_binding_refused() {
        let mut mech = mechanism();
        let outcome = mech.step(b"p=tls-unique,,n=user1,r=abcdef").await;
        assert!(matches!(
            outcome,
            StepOutcome::Failure(SaslFailure::MalformedRequest)
        ));
    }

    #[tokio::test]
    async fn final_before_first_is_malformed() {
        let mut mech = mechanism();
        mech.state = ScramState::Complete;
        let outcome = mech.step(b"c=biws,r=x,p=proof").await;
        assert!(matches!(
            outcome,
            StepOutcome::Failure(SaslFailure::MalformedRequest)
        ));
    }

    #[test]
    fn derive_keys_is_deterministic() {
        let (stored1, server1) = derive_keys("pencil", b"salt0123456789ab", 4096);
        let (stored2, server2) = derive_keys("pencil", b"salt0123456789ab", 4096);
        assert_eq!(stored1, stored2);
        assert_eq!(server1, server2);
        assert_eq!(stored1.len(), SHA1_LEN);
        assert_eq!(server1.len(), SHA1_LEN);
    }

    #[test]
    fn sasl_name_decoding() {
        assert_eq!(decode_sasl_name("user").unwrap(), "user");
        assert_eq!(decode_sasl_name("a=2Cb").unwrap(), "a,b");
        assert_eq!(decode_sasl_name("a=3Db").unwrap(), "a=b");
        assert!(decode_sasl_name("a=4Fb").is_err());
    }
}
