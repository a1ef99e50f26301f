//! TCP acceptor for C2S (5222) and S2S (5269) connections.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use crate::connection::ConnectionActor;
use crate::error::XmppError;
use crate::ServerRuntimeContext;

/// Default client-to-server port.
pub const DEFAULT_C2S_PORT: u16 = 5222;
/// Default server-to-server port.
pub const DEFAULT_S2S_PORT: u16 = 5269;
/// Default BOSH HTTP port, for the embedding HTTP server.
pub const DEFAULT_BOSH_PORT: u16 = 5280;

/// Listener addresses for the server.
#[derive(Debug, Clone)]
pub struct ListenConfig {
    /// C2S bind address
    pub c2s_addr: SocketAddr,
    /// S2S bind address; only used when federation is enabled
    pub s2s_addr: SocketAddr,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            c2s_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_C2S_PORT)),
            s2s_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_S2S_PORT)),
        }
    }
}

/// The XMPP server: accept loops feeding connection actors.
pub struct XmppServer {
    runtime: Arc<ServerRuntimeContext>,
    tls_acceptor: Option<TlsAcceptor>,
    c2s_listener: TcpListener,
    s2s_listener: Option<TcpListener>,
    shutdown: CancellationToken,
}

impl XmppServer {
    /// Bind listeners and prepare the server.
    pub async fn bind(
        runtime: Arc<ServerRuntimeContext>,
        listen: ListenConfig,
        shutdown: CancellationToken,
    ) -> Result<Self, XmppError> {
        let tls_acceptor = match &runtime.config.tls.certificate_file {
            Some(_) => Some(load_tls_acceptor(&runtime.config)?),
            None => None,
        };

        let c2s_listener = TcpListener::bind(listen.c2s_addr).await?;
        info!(addr = %listen.c2s_addr, "C2S listener bound");

        let s2s_listener = if runtime.config.s2s.enabled {
            let listener = TcpListener::bind(listen.s2s_addr).await?;
            info!(addr = %listen.s2s_addr, "S2S listener bound");
            Some(listener)
        } else {
            info!("S2S federation disabled");
            None
        };

        Ok(Self {
            runtime,
            tls_acceptor,
            c2s_listener,
            s2s_listener,
            shutdown,
        })
    }

    /// Run the accept loops until the shutdown token fires.
    pub async fn run(self) -> Result<(), XmppError> {
        let c2s = Self::accept_loop(
            self.c2s_listener,
            Arc::clone(&self.runtime),
            self.tls_acceptor.clone(),
            self.shutdown.clone(),
            "c2s",
        );

        match self.s2s_listener {
            Some(s2s_listener) => {
                let s2s = Self::accept_loop(
                    s2s_listener,
                    self.runtime,
                    self.tls_acceptor,
                    self.shutdown,
                    "s2s",
                );
                tokio::join!(c2s, s2s);
            }
            None => c2s.await,
        }

        Ok(())
    }

    async fn accept_loop(
        listener: TcpListener,
        runtime: Arc<ServerRuntimeContext>,
        tls_acceptor: Option<TlsAcceptor>,
        shutdown: CancellationToken,
        kind: &'static str,
    ) {
        loop {
            let (stream, peer_addr) = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(connection) => connection,
                    Err(e) => {
                        warn!(error = %e, kind, "accept failed");
                        continue;
                    }
                },
                _ = shutdown.cancelled() => {
                    info!(kind, "accept loop stopped");
                    break;
                }
            };

            let runtime = Arc::clone(&runtime);
            let tls_acceptor = tls_acceptor.clone();
            tokio::spawn(
                async move {
                    if let Err(e) =
                        ConnectionActor::handle_connection(stream, peer_addr, tls_acceptor, runtime)
                            .await
                    {
                        warn!(error = %e, "connection error");
                    }
                }
                .instrument(info_span!(
                    "xmpp.connection.lifecycle",
                    peer = %peer_addr,
                    kind,
                )),
            );
        }
    }
}

/// Build the TLS acceptor from the configured PEM files.
fn load_tls_acceptor(config: &crate::config::ServerConfig) -> Result<TlsAcceptor, XmppError> {
    use rustls_pemfile::{certs, pkcs8_private_keys};
    use std::fs::File;
    use std::io::BufReader;
    use tokio_rustls::rustls::{pki_types::PrivateKeyDer, ServerConfig as RustlsConfig};

    let cert_path = config
        .tls
        .certificate_file
        .as_ref()
        .ok_or_else(|| XmppError::config("tls.certificate-file is not set"))?;
    let key_path = config
        .tls
        .key_file
        .as_ref()
        .ok_or_else(|| XmppError::config("tls.key-file is not set"))?;

    let cert_file = File::open(cert_path)
        .map_err(|e| XmppError::config(format!("cannot open {}: {}", cert_path, e)))?;
    let key_file = File::open(key_path)
        .map_err(|e| XmppError::config(format!("cannot open {}: {}", key_path, e)))?;

    let certs: Vec<_> = certs(&mut BufReader::new(cert_file))
        .filter_map(|entry| entry.ok())
        .collect();
    let key = pkcs8_private_keys(&mut BufReader::new(key_file))
        .filter_map(|entry| entry.ok())
        .next()
        .ok_or_else(|| XmppError::config("no private key found"))?;

    let tls_config = RustlsConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, PrivateKeyDer::Pkcs8(key))
        .map_err(|e| XmppError::config(format!("TLS configuration rejected: {}", e)))?;

    Ok(TlsAcceptor::from(Arc::new(tls_config)))
}
