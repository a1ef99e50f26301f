//! Connection actor: owns one transport and drives its session.
//!
//! Each accepted TCP connection gets its own task running this actor. The
//! actor is the only place that touches the socket: inbound bytes feed the
//! session state machine in receive order, and the writer lane drains here,
//! so rendered stanzas never interleave on the wire.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, instrument, warn};

use crate::error::XmppError;
use crate::protocol::{ProtocolAction, SessionStateMachine};
use crate::session::{SessionState, SessionWriter, WriterCommand};
use crate::ServerRuntimeContext;

/// Read budget for each negotiation step (stream open, SASL step, bind).
pub const NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(30);

enum Transport {
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
    Gone,
}

impl Transport {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, XmppError> {
        match self {
            Transport::Tcp(stream) => Ok(stream.read(buf).await?),
            Transport::Tls(stream) => Ok(stream.read(buf).await?),
            Transport::Gone => Err(XmppError::internal("transport is gone")),
        }
    }

    async fn write_all(&mut self, data: &[u8]) -> Result<(), XmppError> {
        match self {
            Transport::Tcp(stream) => Ok(stream.write_all(data).await?),
            Transport::Tls(stream) => Ok(stream.write_all(data).await?),
            Transport::Gone => Err(XmppError::internal("transport is gone")),
        }
    }

    async fn flush(&mut self) -> Result<(), XmppError> {
        match self {
            Transport::Tcp(stream) => Ok(stream.flush().await?),
            Transport::Tls(stream) => Ok(stream.flush().await?),
            Transport::Gone => Ok(()),
        }
    }

    async fn shutdown(&mut self) {
        match self {
            Transport::Tcp(stream) => {
                let _ = stream.shutdown().await;
            }
            Transport::Tls(stream) => {
                let _ = stream.shutdown().await;
            }
            Transport::Gone => {}
        }
    }
}

/// Actor for one client or peer-server connection.
pub struct ConnectionActor {
    transport: Transport,
    machine: SessionStateMachine,
    writer_rx: mpsc::Receiver<WriterCommand>,
    tls_acceptor: Option<TlsAcceptor>,
}

impl ConnectionActor {
    /// Handle one accepted connection to completion.
    #[instrument(
        name = "xmpp.connection",
        skip(stream, tls_acceptor, runtime),
        fields(peer = %peer_addr)
    )]
    pub async fn handle_connection(
        stream: TcpStream,
        peer_addr: SocketAddr,
        tls_acceptor: Option<TlsAcceptor>,
        runtime: Arc<ServerRuntimeContext>,
    ) -> Result<(), XmppError> {
        info!("connection accepted");

        let (writer, writer_rx) = SessionWriter::channel();
        let machine = SessionStateMachine::new(runtime, writer);

        let mut actor = Self {
            transport: Transport::Tcp(stream),
            machine,
            writer_rx,
            tls_acceptor,
        };
        let result = actor.run().await;

        actor.transport.shutdown().await;
        info!("connection closed");
        result
    }

    async fn run(&mut self) -> Result<(), XmppError> {
        let mut buf = [0u8; 8192];

        loop {
            // Sessions still negotiating get a per-step read deadline;
            // established sessions wait indefinitely for traffic.
            let negotiating = self.machine.context().state() != SessionState::Bound;

            tokio::select! {
                read = self.transport.read(&mut buf) => {
                    let n = match read {
                        Ok(0) => {
                            debug!("peer hung up");
                            break;
                        }
                        Ok(n) => n,
                        Err(e) => {
                            debug!(error = %e, "transport read failed");
                            break;
                        }
                    };

                    let actions = self.machine.on_bytes(&buf[..n]).await;
                    if self.perform(actions).await? {
                        break;
                    }
                }

                command = self.writer_rx.recv() => {
                    match command {
                        Some(command) => {
                            if self.execute_write(command).await? {
                                break;
                            }
                        }
                        None => break,
                    }
                }

                _ = tokio::time::sleep(NEGOTIATION_TIMEOUT), if negotiating => {
                    warn!("negotiation step timed out");
                    let _ = self
                        .transport
                        .write_all(crate::error::stream_error_xml(
                            crate::error::StreamErrorCondition::ConnectionTimeout,
                            None,
                        ).as_bytes())
                        .await;
                    break;
                }
            }
        }

        self.flush_pending_writes().await;
        Ok(())
    }

    /// Apply protocol actions. Returns true when the connection is done.
    async fn perform(&mut self, actions: Vec<ProtocolAction>) -> Result<bool, XmppError> {
        for action in actions {
            match action {
                ProtocolAction::StartTlsHandshake => {
                    // The <proceed/> reply must hit the wire before the
                    // handshake starts.
                    self.flush_pending_writes().await;
                    self.start_tls().await?;
                }
                ProtocolAction::CloseTransport => {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    async fn start_tls(&mut self) -> Result<(), XmppError> {
        let Some(acceptor) = self.tls_acceptor.clone() else {
            return Err(XmppError::config("STARTTLS accepted without TLS config"));
        };

        let tcp = match std::mem::replace(&mut self.transport, Transport::Gone) {
            Transport::Tcp(stream) => stream,
            other => {
                self.transport = other;
                return Err(XmppError::internal("STARTTLS on a non-TCP transport"));
            }
        };

        match acceptor.accept(tcp).await {
            Ok(tls_stream) => {
                self.transport = Transport::Tls(Box::new(tls_stream));
                self.machine.on_tls_established();
                debug!("TLS handshake complete");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "TLS handshake failed");
                Err(XmppError::Io(e))
            }
        }
    }

    /// Execute one writer command. Returns true on close.
    async fn execute_write(&mut self, command: WriterCommand) -> Result<bool, XmppError> {
        match command {
            WriterCommand::Stanza(stanza) => {
                self.transport
                    .write_all(stanza.render().as_bytes())
                    .await?;
                self.transport.flush().await?;
                Ok(false)
            }
            WriterCommand::Raw(xml) => {
                self.transport.write_all(xml.as_bytes()).await?;
                self.transport.flush().await?;
                Ok(false)
            }
            WriterCommand::Close => {
                let _ = self.transport.write_all(b"</stream:stream>").await;
                let _ = self.transport.flush().await;
                Ok(true)
            }
        }
    }

    /// Drain whatever the writer lane still holds, best effort.
    async fn flush_pending_writes(&mut self) {
        while let Ok(command) = self.writer_rx.try_recv() {
            if let WriterCommand::Close = command {
                let _ = self.transport.write_all(b"</stream:stream>").await;
                let _ = self.transport.flush().await;
                break;
            }
            if self.execute_write(command).await.unwrap_or(true) {
                break;
            }
        }
    }
}
