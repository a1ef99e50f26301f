//! Server-to-server federation (RFC 6120 Section 4, XEP-0220).
//!
//! One outbound link exists per `(local-domain, remote-domain)` pair.
//! Establishing a link dials the peer found via DNS SRV, exchanges stream
//! headers, and runs dialback; stanzas submitted meanwhile queue on the link
//! and flush once the peer answers `type='valid'`.

pub mod dialback;
pub mod dns;

use std::time::Duration;

use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

use crate::decoder::{StreamDecoder, StreamEvent};
use crate::error::XmppError;
use crate::stanza::{ns, Node, QName, XmlElement};

pub use dialback::{DialbackKey, DialbackVerdict};
pub use dns::{ResolvedTarget, SrvResolver, DEFAULT_S2S_PORT};

/// End-to-end budget for establishing and verifying an outbound link.
pub const DIALBACK_TIMEOUT: Duration = Duration::from_secs(60);

/// Depth of the per-link pending stanza queue.
const LINK_QUEUE_DEPTH: usize = 256;

/// Lifecycle of an outbound link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Dialing and negotiating dialback
    Connecting,
    /// Dialback succeeded; stanzas flow
    Verified,
    /// Establishment failed; the entry is removed shortly after
    Failed,
}

struct OutboundLink {
    tx: mpsc::Sender<XmlElement>,
    state: LinkState,
}

/// Manages outbound links and answers dialback verification requests.
///
/// Cheap to clone; all clones share the link table, so the link driver
/// tasks can update state without holding the manager alive by reference.
#[derive(Clone)]
pub struct S2sManager {
    local_domain: String,
    key: DialbackKey,
    resolver: SrvResolver,
    links: std::sync::Arc<DashMap<String, OutboundLink>>,
}

impl S2sManager {
    /// Create a manager for the local domain with the process dialback secret.
    pub fn new(local_domain: impl Into<String>, secret: impl AsRef<[u8]>) -> Self {
        Self {
            local_domain: local_domain.into(),
            key: DialbackKey::new(secret),
            resolver: SrvResolver::new(),
            links: std::sync::Arc::new(DashMap::new()),
        }
    }

    /// Use a custom resolver (tests, split-horizon setups).
    pub fn with_resolver(mut self, resolver: SrvResolver) -> Self {
        self.resolver = resolver;
        self
    }

    /// The local domain this manager federates for.
    pub fn local_domain(&self) -> &str {
        &self.local_domain
    }

    /// The dialback key generator.
    pub fn dialback_key(&self) -> &DialbackKey {
        &self.key
    }

    /// The state of the link to a remote domain, if one exists.
    pub fn link_state(&self, domain: &str) -> Option<LinkState> {
        self.links.get(domain).map(|entry| entry.state)
    }

    /// Submit a stanza for delivery to a remote domain.
    ///
    /// When no link exists one is initiated; the stanza waits on the link
    /// queue until dialback completes.
    pub fn send(&self, domain: &str, stanza: XmlElement) -> Result<(), XmppError> {
        let tx = match self.links.get(domain) {
            Some(entry) if !entry.tx.is_closed() => entry.tx.clone(),
            _ => {
                let (tx, rx) = mpsc::channel(LINK_QUEUE_DEPTH);
                self.links.insert(
                    domain.to_string(),
                    OutboundLink {
                        tx: tx.clone(),
                        state: LinkState::Connecting,
                    },
                );
                let manager = self.clone();
                let domain = domain.to_string();
                tokio::spawn(async move {
                    manager.run_outbound_link(domain, rx).await;
                });
                tx
            }
        };

        tx.try_send(rewrite_content_namespace(stanza, ns::JABBER_SERVER))
            .map_err(|_| {
                XmppError::recipient_unavailable(Some(format!(
                    "link to {} is saturated or closed",
                    domain
                )))
            })
    }

    /// Authoritative-side answer to an inbound `<db:verify/>`.
    ///
    /// Recomputes the key for the stream id we allegedly initiated and
    /// returns the verdict element to send back.
    pub fn answer_verify(&self, verify: &XmlElement) -> Result<XmlElement, XmppError> {
        let from = verify
            .attr("from")
            .ok_or_else(|| XmppError::bad_request(Some("verify without from".into())))?;
        let to = verify
            .attr("to")
            .ok_or_else(|| XmppError::bad_request(Some("verify without to".into())))?;
        let stream_id = verify
            .attr("id")
            .ok_or_else(|| XmppError::bad_request(Some("verify without id".into())))?;
        let key = verify.text();

        // We are the originating server here: `from` names the receiving
        // side that is checking up on us.
        let verdict = if self.key.verify(key.trim(), from, to, stream_id) {
            DialbackVerdict::Valid
        } else {
            DialbackVerdict::Invalid
        };
        debug!(receiving = from, stream_id, verdict = verdict.as_str(), "answered db:verify");
        Ok(dialback::db_verify_verdict(to, from, stream_id, verdict))
    }

    /// Receiving-side check of an inbound `<db:result/>` key: dial the
    /// authoritative server for the claimed domain and ask it to verify.
    #[instrument(skip(self, key), fields(originating = %originating))]
    pub async fn verify_back(
        &self,
        originating: &str,
        inbound_stream_id: &str,
        key: &str,
    ) -> Result<DialbackVerdict, XmppError> {
        let result = timeout(
            DIALBACK_TIMEOUT,
            self.verify_back_inner(originating, inbound_stream_id, key),
        )
        .await;
        match result {
            Ok(verdict) => verdict,
            Err(_) => Err(XmppError::internal(format!(
                "dialback verify to {} timed out",
                originating
            ))),
        }
    }

    async fn verify_back_inner(
        &self,
        originating: &str,
        inbound_stream_id: &str,
        key: &str,
    ) -> Result<DialbackVerdict, XmppError> {
        let mut connection = self.dial(originating).await?;
        connection.open_stream(&self.local_domain, originating).await?;

        let verify = dialback::db_verify(&self.local_domain, originating, inbound_stream_id, key);
        connection.write_element(&verify).await?;

        loop {
            let element = connection.read_element().await?;
            if element.name().namespace() == Some(ns::DIALBACK)
                && element.name().local() == "verify"
            {
                let verdict = element
                    .attr("type")
                    .and_then(DialbackVerdict::parse)
                    .ok_or_else(|| {
                        XmppError::bad_request(Some("verify answer without verdict".into()))
                    })?;
                connection.close().await;
                return Ok(verdict);
            }
        }
    }

    /// Drive one outbound link: dial, dialback, then pump queued stanzas.
    async fn run_outbound_link(&self, domain: String, mut rx: mpsc::Receiver<XmlElement>) {
        let established = timeout(DIALBACK_TIMEOUT, self.establish(&domain)).await;

        let mut connection = match established {
            Ok(Ok(connection)) => connection,
            Ok(Err(e)) => {
                warn!(domain = %domain, error = %e, "outbound link failed");
                self.fail_link(&domain);
                return;
            }
            Err(_) => {
                warn!(domain = %domain, "outbound dialback timed out");
                self.fail_link(&domain);
                return;
            }
        };

        if let Some(mut entry) = self.links.get_mut(&domain) {
            entry.state = LinkState::Verified;
        }
        info!(domain = %domain, "outbound link verified");

        while let Some(stanza) = rx.recv().await {
            if let Err(e) = connection.write_element(&stanza).await {
                warn!(domain = %domain, error = %e, "outbound link write failed");
                break;
            }
        }

        connection.close().await;
        self.links.remove(&domain);
        debug!(domain = %domain, "outbound link closed");
    }

    fn fail_link(&self, domain: &str) {
        if let Some(mut entry) = self.links.get_mut(domain) {
            entry.state = LinkState::Failed;
        }
        self.links.remove(domain);
    }

    /// Dial the peer, exchange headers, run dialback as originating server.
    async fn establish(&self, domain: &str) -> Result<S2sConnection, XmppError> {
        let mut connection = self.dial(domain).await?;
        let header = connection.open_stream(&self.local_domain, domain).await?;

        let stream_id = header.id.ok_or_else(|| {
            XmppError::internal("peer stream header carries no stream id".to_string())
        })?;

        // receiving = the peer we dialed, originating = us.
        let key = self.key.generate(domain, &self.local_domain, &stream_id);
        let result = dialback::db_result(&self.local_domain, domain, &key);
        connection.write_element(&result).await?;

        loop {
            let element = connection.read_element().await?;
            if element.name().namespace() == Some(ns::DIALBACK)
                && element.name().local() == "result"
            {
                match element.attr("type").and_then(DialbackVerdict::parse) {
                    Some(DialbackVerdict::Valid) => return Ok(connection),
                    _ => {
                        return Err(XmppError::internal(format!(
                            "dialback to {} rejected",
                            domain
                        )));
                    }
                }
            }
        }
    }

    async fn dial(&self, domain: &str) -> Result<S2sConnection, XmppError> {
        let targets = self
            .resolver
            .resolve_xmpp_server(domain)
            .await
            .map_err(|e| XmppError::internal(e.to_string()))?;

        for target in targets {
            let addrs = match self
                .resolver
                .resolve_host_to_addrs(&target.host, target.port)
                .await
            {
                Ok(addrs) => addrs,
                Err(_) => continue,
            };
            for addr in addrs {
                match TcpStream::connect(addr).await {
                    Ok(stream) => {
                        debug!(domain = %domain, addr = %addr, "S2S TCP connected");
                        return Ok(S2sConnection::new(stream));
                    }
                    Err(e) => {
                        debug!(domain = %domain, addr = %addr, error = %e, "S2S connect failed");
                    }
                }
            }
        }

        Err(XmppError::internal(format!(
            "no reachable S2S endpoint for {}",
            domain
        )))
    }
}

/// One raw outbound S2S connection with its stream decoder.
struct S2sConnection {
    stream: TcpStream,
    decoder: StreamDecoder,
}

impl S2sConnection {
    fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            decoder: StreamDecoder::new(),
        }
    }

    /// Send our stream header and read the peer's.
    async fn open_stream(
        &mut self,
        from: &str,
        to: &str,
    ) -> Result<crate::decoder::StreamHeader, XmppError> {
        let header = format!(
            "<?xml version='1.0'?>\
             <stream:stream xmlns='{}' xmlns:db='{}' \
             xmlns:stream='{}' from='{}' to='{}' version='1.0'>",
            ns::JABBER_SERVER,
            ns::DIALBACK,
            ns::STREAM,
            from,
            to
        );
        self.stream.write_all(header.as_bytes()).await?;
        self.stream.flush().await?;

        loop {
            match self.decoder.next_event() {
                Ok(Some(StreamEvent::StreamOpen(header))) => return Ok(header),
                Ok(Some(StreamEvent::StreamClose)) => {
                    return Err(XmppError::internal("peer closed stream during open"));
                }
                Ok(Some(StreamEvent::TopLevelElement(_))) => continue,
                Ok(None) => self.fill().await?,
                Err(e) => {
                    return Err(XmppError::stream_with_text(
                        crate::error::StreamErrorCondition::NotWellFormed,
                        e.to_string(),
                    ));
                }
            }
        }
    }

    async fn read_element(&mut self) -> Result<XmlElement, XmppError> {
        loop {
            match self.decoder.next_event() {
                Ok(Some(StreamEvent::TopLevelElement(element))) => return Ok(element),
                Ok(Some(StreamEvent::StreamClose)) => {
                    return Err(XmppError::internal("peer closed S2S stream"));
                }
                Ok(Some(StreamEvent::StreamOpen(_))) => continue,
                Ok(None) => self.fill().await?,
                Err(e) => {
                    return Err(XmppError::stream_with_text(
                        crate::error::StreamErrorCondition::NotWellFormed,
                        e.to_string(),
                    ));
                }
            }
        }
    }

    async fn fill(&mut self) -> Result<(), XmppError> {
        let mut buf = [0u8; 8192];
        let n = self.stream.read(&mut buf).await?;
        if n == 0 {
            return Err(XmppError::internal("S2S peer hung up"));
        }
        self.decoder.feed(&buf[..n]);
        Ok(())
    }

    async fn write_element(&mut self, element: &XmlElement) -> Result<(), XmppError> {
        self.stream.write_all(element.render().as_bytes()).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn close(mut self) {
        let _ = self.stream.write_all(b"</stream:stream>").await;
        let _ = self.stream.shutdown().await;
    }
}

/// Re-root a stanza's content namespace for the server-to-server stream.
///
/// Children declared in their own namespaces (bind, dialback, extensions)
/// are untouched; only the stanza-level `jabber:client` content moves to
/// the target namespace.
pub fn rewrite_content_namespace(element: XmlElement, target: &str) -> XmlElement {
    fn rewrite(element: &XmlElement, target: &str) -> XmlElement {
        let name = if element.name().namespace() == Some(ns::JABBER_CLIENT) {
            QName::new(element.name().local(), Some(target))
        } else {
            element.name().clone()
        };
        let children = element
            .children()
            .iter()
            .map(|node| match node {
                Node::Element(child) => Node::Element(rewrite(child, target)),
                Node::Text(text) => Node::Text(text.clone()),
            })
            .collect();
        XmlElement::from_parts(name, element.attributes().to_vec(), children)
    }
    rewrite(&element, target)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_namespace_rewrite() {
        let message = XmlElement::builder("message", Some(ns::JABBER_CLIENT))
            .attr("to", "user@example.org")
            .child(
                XmlElement::builder("body", Some(ns::JABBER_CLIENT))
                    .text("hi")
                    .build(),
            )
            .child(XmlElement::builder("x", Some("jabber:x:oob")).build())
            .build();

        let rewritten = rewrite_content_namespace(message, ns::JABBER_SERVER);
        assert_eq!(rewritten.name().namespace(), Some(ns::JABBER_SERVER));
        assert!(rewritten
            .find_child("body", Some(ns::JABBER_SERVER))
            .is_some());
        assert!(rewritten.find_child("x", Some("jabber:x:oob")).is_some());
    }

    #[tokio::test]
    async fn answer_verify_round_trip() {
        let manager = S2sManager::new("example.org", b"secret");
        // Key minted by us for an earlier outbound stream to xmpp.example.com.
        let key = manager
            .dialback_key()
            .generate("xmpp.example.com", "example.org", "D60000229F");

        let verify = dialback::db_verify("xmpp.example.com", "example.org", "D60000229F", &key);
        let answer = manager.answer_verify(&verify).unwrap();
        assert_eq!(answer.attr("type"), Some("valid"));
        assert_eq!(answer.attr("id"), Some("D60000229F"));
        assert_eq!(answer.attr("from"), Some("example.org"));
        assert_eq!(answer.attr("to"), Some("xmpp.example.com"));
    }

    #[tokio::test]
    async fn answer_verify_rejects_forged_key() {
        let manager = S2sManager::new("example.org", b"secret");
        let verify =
            dialback::db_verify("xmpp.example.com", "example.org", "D60000229F", "1234567890");
        let answer = manager.answer_verify(&verify).unwrap();
        assert_eq!(answer.attr("type"), Some("invalid"));
    }

    #[test]
    fn link_state_starts_absent() {
        let manager = S2sManager::new("example.org", b"secret");
        assert!(manager.link_state("remote.example").is_none());
    }
}
