//! Server configuration.

use serde::Deserialize;

use crate::error::XmppError;
use crate::sasl::MechanismKind;

/// Default BOSH 'wait' ceiling in seconds.
pub const DEFAULT_BOSH_WAIT_MAX: u64 = 60;
/// Default BOSH 'hold' parameter.
pub const DEFAULT_BOSH_HOLD: usize = 1;
/// Default BOSH 'polling' parameter in seconds.
pub const DEFAULT_BOSH_POLLING: u64 = 15;
/// Default BOSH 'inactivity' parameter in seconds.
pub const DEFAULT_BOSH_INACTIVITY: u64 = 60;

/// Top-level server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// The domain this server is authoritative for (required)
    #[serde(rename = "server-domain")]
    pub server_domain: String,

    /// TLS settings
    #[serde(default)]
    pub tls: TlsConfig,

    /// SASL settings
    #[serde(default)]
    pub sasl: SaslConfig,

    /// BOSH settings
    #[serde(default)]
    pub bosh: BoshConfig,

    /// Server-to-server settings
    #[serde(default)]
    pub s2s: S2sConfig,
}

impl ServerConfig {
    /// Create a configuration with defaults for the given domain.
    pub fn new(server_domain: impl Into<String>) -> Self {
        Self {
            server_domain: server_domain.into(),
            tls: TlsConfig::default(),
            sasl: SaslConfig::default(),
            bosh: BoshConfig::default(),
            s2s: S2sConfig::default(),
        }
    }

    /// Validate invariants that serde cannot express.
    pub fn validate(&self) -> Result<(), XmppError> {
        if self.server_domain.is_empty() {
            return Err(XmppError::config("server-domain is required"));
        }
        crate::jid::Jid::parse(&self.server_domain)
            .map_err(|e| XmppError::config(format!("server-domain is not a valid domain: {}", e)))?;
        if self.sasl.mechanisms.is_empty() {
            return Err(XmppError::config("at least one SASL mechanism is required"));
        }
        if self.tls.required && self.tls.certificate_file.is_none() {
            return Err(XmppError::config(
                "tls.required is set but tls.certificate-file is missing",
            ));
        }
        Ok(())
    }
}

/// TLS settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TlsConfig {
    /// Path to the PEM certificate chain
    #[serde(rename = "certificate-file", default)]
    pub certificate_file: Option<String>,
    /// Path to the PEM private key
    #[serde(rename = "key-file", default)]
    pub key_file: Option<String>,
    /// When set, only `<starttls required/>` is offered until TLS is active
    #[serde(default)]
    pub required: bool,
}

/// SASL settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SaslConfig {
    /// Enabled mechanisms, strongest first
    #[serde(default = "default_mechanisms")]
    pub mechanisms: Vec<MechanismKind>,
}

impl Default for SaslConfig {
    fn default() -> Self {
        Self {
            mechanisms: default_mechanisms(),
        }
    }
}

fn default_mechanisms() -> Vec<MechanismKind> {
    vec![
        MechanismKind::ScramSha1,
        MechanismKind::DigestMd5,
        MechanismKind::Plain,
    ]
}

/// BOSH (XEP-0124) settings.
#[derive(Debug, Clone, Deserialize)]
pub struct BoshConfig {
    /// The longest 'wait' the connection manager will grant, in seconds
    #[serde(rename = "wait-max", default = "default_wait_max")]
    pub wait_max: u64,
    /// Default 'hold' parameter
    #[serde(default = "default_hold")]
    pub hold: usize,
    /// Shortest allowable polling interval, in seconds
    #[serde(default = "default_polling")]
    pub polling: u64,
    /// Longest allowable inactivity period, in seconds
    #[serde(default = "default_inactivity")]
    pub inactivity: u64,
}

impl Default for BoshConfig {
    fn default() -> Self {
        Self {
            wait_max: DEFAULT_BOSH_WAIT_MAX,
            hold: DEFAULT_BOSH_HOLD,
            polling: DEFAULT_BOSH_POLLING,
            inactivity: DEFAULT_BOSH_INACTIVITY,
        }
    }
}

fn default_wait_max() -> u64 {
    DEFAULT_BOSH_WAIT_MAX
}

fn default_hold() -> usize {
    DEFAULT_BOSH_HOLD
}

fn default_polling() -> u64 {
    DEFAULT_BOSH_POLLING
}

fn default_inactivity() -> u64 {
    DEFAULT_BOSH_INACTIVITY
}

/// Server-to-server settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct S2sConfig {
    /// Whether outbound and inbound federation is enabled
    #[serde(default)]
    pub enabled: bool,
    /// Dialback secret; generated fresh on each start when absent
    #[serde(default)]
    pub secret: Option<String>,
}

impl S2sConfig {
    /// The dialback secret to use, generating a random one when unset.
    ///
    /// The generated secret is process-wide for the lifetime of this config
    /// value; keys minted with it cannot be verified by other processes.
    pub fn effective_secret(&self) -> Vec<u8> {
        match &self.secret {
            Some(secret) => secret.as_bytes().to_vec(),
            None => {
                use rand::RngCore;
                let mut secret = vec![0u8; 32];
                rand::rng().fill_bytes(&mut secret);
                secret
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_negotiation_parameters() {
        let config = ServerConfig::new("skein.im");
        assert_eq!(config.bosh.wait_max, 60);
        assert_eq!(config.bosh.hold, 1);
        assert_eq!(config.bosh.polling, 15);
        assert_eq!(config.bosh.inactivity, 60);
        assert!(!config.s2s.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn empty_domain_rejected() {
        let config = ServerConfig::new("");
        assert!(config.validate().is_err());
    }

    #[test]
    fn tls_required_needs_certificate() {
        let mut config = ServerConfig::new("skein.im");
        config.tls.required = true;
        assert!(config.validate().is_err());
        config.tls.certificate_file = Some("certs/server.crt".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn generated_secret_is_random() {
        let config = S2sConfig::default();
        assert_ne!(config.effective_secret(), config.effective_secret());
    }

    #[test]
    fn configured_secret_is_stable() {
        let config = S2sConfig {
            enabled: true,
            secret: Some("fixed".to_string()),
        };
        assert_eq!(config.effective_secret(), b"fixed");
    }
}
