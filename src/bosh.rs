//! BOSH long-polling bridge (XEP-0124/0206).
//!
//! Adapts the stanza pipeline to HTTP request/response. Each session keeps
//! two queues: suspended HTTP requests waiting for something to carry, and
//! delayed outbound stanzas waiting for a request to attach to. At most one
//! of the two is non-empty outside a write's critical section.
//!
//! The embedding HTTP server is an external collaborator: it hands each
//! POST to [`BoshSession::add_request`] and awaits the returned
//! [`BoshResponse`] future for the body to send back. Suspension timeouts
//! and the `hold` overflow drain happen in here.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::config::BoshConfig;
use crate::session::{SessionState, SessionWriter, WriterCommand};
use crate::stanza::{ns, XmlElement};

/// Highest BOSH protocol version this bridge speaks.
pub const BOSH_VERSION: &str = "1.9";

/// Negotiated session parameters (XEP-0124 Section 7.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoshParams {
    /// Longest time we may wait before answering a request, seconds
    pub wait: u64,
    /// Number of requests we keep suspended
    pub hold: usize,
    /// Shortest allowed polling interval, seconds
    pub polling: u64,
    /// Longest allowed client inactivity, seconds
    pub inactivity: u64,
    /// Simultaneous requests the client may have in flight
    pub requests: usize,
    /// Negotiated protocol version
    pub version: String,
}

impl BoshParams {
    /// Negotiate parameters from the client's session creation request.
    ///
    /// The client can only lower `wait` below the configured ceiling, and
    /// `hold >= 2` raises the `requests` limit to `hold + 1`. The version is
    /// the lower of ours and the client's.
    pub fn negotiate(
        config: &BoshConfig,
        client_wait: Option<u64>,
        client_hold: Option<usize>,
        client_version: Option<&str>,
    ) -> Self {
        let wait = client_wait
            .map(|w| w.min(config.wait_max))
            .unwrap_or(config.wait_max);
        let hold = client_hold.unwrap_or(config.hold);
        let requests = if hold >= 2 { hold + 1 } else { 2 };
        let version = match client_version {
            Some(client) if version_lt(client, BOSH_VERSION) => client.to_string(),
            _ => BOSH_VERSION.to_string(),
        };
        Self {
            wait,
            hold,
            polling: config.polling,
            inactivity: config.inactivity,
            requests,
            version,
        }
    }
}

/// `true` when version string `a` is lower than `b` (major.minor).
fn version_lt(a: &str, b: &str) -> bool {
    fn parts(v: &str) -> Option<(u32, u32)> {
        let (major, minor) = v.split_once('.')?;
        Some((major.parse().ok()?, minor.parse().ok()?))
    }
    match (parts(a), parts(b)) {
        (Some(a), Some(b)) => a < b,
        _ => false,
    }
}

/// The future side of a suspended HTTP request.
///
/// Resolves to the rendered `<body/>` to send as the HTTP response.
pub struct BoshResponse {
    rx: oneshot::Receiver<String>,
}

impl BoshResponse {
    /// Wait for the response body.
    pub async fn body(self) -> Option<String> {
        self.rx.await.ok()
    }
}

struct SuspendedRequest {
    rid: u64,
    responder: oneshot::Sender<String>,
    timer: AbortHandle,
}

struct Queues {
    request_queue: VecDeque<SuspendedRequest>,
    delayed_response_queue: VecDeque<XmlElement>,
    terminated: bool,
}

/// One BOSH session: the stanza pipeline's view of a long-polling client.
pub struct BoshSession {
    sid: String,
    params: BoshParams,
    queues: Mutex<Queues>,
    state: Mutex<SessionState>,
    // Handed to timer and pump tasks so they never keep the session alive.
    weak: Weak<BoshSession>,
}

impl BoshSession {
    /// Create a session with negotiated parameters.
    ///
    /// BOSH cannot run STARTTLS; HTTPS is the surrounding HTTP layer's
    /// business, so the session skips `EncryptionStarted` and begins in
    /// `Encrypted`.
    pub fn new(sid: impl Into<String>, params: BoshParams) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            sid: sid.into(),
            params,
            queues: Mutex::new(Queues {
                request_queue: VecDeque::new(),
                delayed_response_queue: VecDeque::new(),
                terminated: false,
            }),
            state: Mutex::new(SessionState::Encrypted),
            weak: weak.clone(),
        })
    }

    /// The session id.
    pub fn sid(&self) -> &str {
        &self.sid
    }

    /// The negotiated parameters.
    pub fn params(&self) -> &BoshParams {
        &self.params
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap()
    }

    /// Move to a new lifecycle state.
    pub fn set_state(&self, state: SessionState) {
        *self.state.lock().unwrap() = state;
    }

    /// TLS is terminated by the HTTP layer; nothing to switch.
    pub fn switch_to_tls(&self) {}

    /// Stream restarts are a BOSH `xmpp:restart` attribute, not an XML
    /// stream event; nothing to re-arm.
    pub fn set_reopening_xml_stream(&self) {}

    /// Suspend an incoming HTTP request on this session.
    ///
    /// The request waits up to `wait` seconds for traffic. Delayed stanzas
    /// are merged into one `<body/>` and flushed immediately; beyond `hold`
    /// suspended requests, the oldest is released with an empty body.
    pub fn add_request(&self, rid: u64) -> BoshResponse {
        let (tx, rx) = oneshot::channel();

        let timer = {
            let session = self.weak.clone();
            let wait = Duration::from_secs(self.params.wait);
            tokio::spawn(async move {
                tokio::time::sleep(wait).await;
                if let Some(session) = Weak::upgrade(&session) {
                    session.request_expired(rid);
                }
            })
            .abort_handle()
        };

        let mut queues = self.queues.lock().unwrap();
        if queues.terminated {
            timer.abort();
            let _ = tx.send(render_terminate_body());
            return BoshResponse { rx };
        }

        queues.request_queue.push_back(SuspendedRequest {
            rid,
            responder: tx,
            timer,
        });
        debug!(sid = %self.sid, rid, suspended = queues.request_queue.len(), "BOSH request suspended");

        // Everything delayed rides out on the oldest suspended request.
        if !queues.delayed_response_queue.is_empty() {
            let merged: Vec<XmlElement> = queues.delayed_response_queue.drain(..).collect();
            Self::respond_next(&mut queues, &merged);
            return BoshResponse { rx };
        }

        // More suspended requests than 'hold' allows: release the oldest.
        if queues.request_queue.len() > self.params.hold {
            Self::respond_next(&mut queues, &[]);
        }

        BoshResponse { rx }
    }

    /// Queue or deliver one outbound stanza.
    ///
    /// All writes on a session are mutually exclusive, which keeps the
    /// response order equal to the write order.
    pub fn write(&self, stanza: XmlElement) {
        let mut queues = self.queues.lock().unwrap();
        if queues.terminated {
            debug!(sid = %self.sid, "dropping stanza for terminated BOSH session");
            return;
        }
        if queues.request_queue.is_empty() {
            queues.delayed_response_queue.push_back(stanza);
        } else {
            Self::respond_next(&mut queues, &[stanza]);
        }
    }

    /// Handle a suspended request reaching its `wait` deadline.
    ///
    /// The expired request is answered with an empty `<body/>`, and every
    /// request suspended before it cascades out the same way (XEP-0124
    /// Section 10).
    fn request_expired(&self, rid: u64) {
        let mut queues = self.queues.lock().unwrap();
        if !queues.request_queue.iter().any(|r| r.rid == rid) {
            // Already answered by a write or an earlier drain.
            return;
        }
        debug!(sid = %self.sid, rid, "BOSH request expired, draining");
        while let Some(request) = queues.request_queue.pop_front() {
            let last = request.rid == rid;
            Self::respond(request, render_body(&[]));
            if last {
                break;
            }
        }
    }

    /// Terminate the session, answering every suspended request.
    pub fn terminate(&self) {
        let mut queues = self.queues.lock().unwrap();
        if queues.terminated {
            return;
        }
        queues.terminated = true;
        queues.delayed_response_queue.clear();
        while let Some(request) = queues.request_queue.pop_front() {
            Self::respond(request, render_terminate_body());
        }
        *self.state.lock().unwrap() = SessionState::Closed;
        debug!(sid = %self.sid, "BOSH session terminated");
    }

    /// Queue depths `(suspended requests, delayed stanzas)`.
    pub fn queue_depths(&self) -> (usize, usize) {
        let queues = self.queues.lock().unwrap();
        (
            queues.request_queue.len(),
            queues.delayed_response_queue.len(),
        )
    }

    /// A [`SessionWriter`] whose stanzas feed this session.
    ///
    /// Lets the router and registry treat BOSH sessions exactly like socket
    /// sessions; a pump task drains the lane into [`BoshSession::write`].
    pub fn attach_writer(&self) -> SessionWriter {
        let (writer, mut rx) = SessionWriter::channel();
        let session = self.weak.clone();
        tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                let Some(session) = Weak::upgrade(&session) else {
                    break;
                };
                match command {
                    WriterCommand::Stanza(stanza) => session.write(stanza),
                    WriterCommand::Raw(_) => {
                        // Stream-level framing has no BOSH equivalent.
                    }
                    WriterCommand::Close => {
                        session.terminate();
                        break;
                    }
                }
            }
        });
        writer
    }

    fn respond_next(queues: &mut Queues, stanzas: &[XmlElement]) {
        if let Some(request) = queues.request_queue.pop_front() {
            Self::respond(request, render_body(stanzas));
        }
    }

    fn respond(request: SuspendedRequest, body: String) {
        request.timer.abort();
        if request.responder.send(body).is_err() {
            warn!(rid = request.rid, "BOSH requester went away before response");
        }
    }
}

/// Render a `<body/>` wrapping the given stanzas.
pub fn render_body(stanzas: &[XmlElement]) -> String {
    let mut builder = XmlElement::builder("body", Some(ns::HTTPBIND));
    for stanza in stanzas {
        builder = builder.child(stanza.clone());
    }
    builder.build().render()
}

/// Render the terminating `<body/>`.
pub fn render_terminate_body() -> String {
    XmlElement::builder("body", Some(ns::HTTPBIND))
        .attr("type", "terminate")
        .build()
        .render()
}

/// Render the session creation response advertising negotiated parameters.
pub fn render_session_creation_response(
    sid: &str,
    from_domain: &str,
    params: &BoshParams,
) -> String {
    XmlElement::builder("body", Some(ns::HTTPBIND))
        .attr("sid", sid)
        .attr("from", from_domain)
        .attr("wait", params.wait.to_string())
        .attr("hold", params.hold.to_string())
        .attr("requests", params.requests.to_string())
        .attr("polling", params.polling.to_string())
        .attr("inactivity", params.inactivity.to_string())
        .attr("ver", params.version.clone())
        .build()
        .render()
}

/// A parsed client `<body/>` envelope.
#[derive(Debug, Clone, Default)]
pub struct BodyRequest {
    /// Request id
    pub rid: Option<u64>,
    /// Session id; absent on session creation
    pub sid: Option<String>,
    /// Requested 'wait' (session creation)
    pub wait: Option<u64>,
    /// Requested 'hold' (session creation)
    pub hold: Option<usize>,
    /// Target domain (session creation)
    pub to: Option<String>,
    /// Client protocol version (session creation)
    pub version: Option<String>,
    /// XEP-0206 stream restart flag
    pub restart: bool,
    /// The wrapped stanzas
    pub stanzas: Vec<XmlElement>,
}

/// Parse an HTTP POST payload into a [`BodyRequest`].
pub fn parse_body_request(payload: &str) -> Result<BodyRequest, crate::decoder::DecodeError> {
    let body = crate::decoder::parse_element_str(payload)?;
    if body.name().local() != "body" || body.name().namespace() != Some(ns::HTTPBIND) {
        return Err(crate::decoder::DecodeError::WellFormedness(
            "payload root is not a httpbind body".into(),
        ));
    }

    Ok(BodyRequest {
        rid: body.attr("rid").and_then(|v| v.parse().ok()),
        sid: body.attr("sid").map(str::to_owned),
        wait: body.attr("wait").and_then(|v| v.parse().ok()),
        hold: body.attr("hold").and_then(|v| v.parse().ok()),
        to: body.attr("to").map(str::to_owned),
        version: body.attr("ver").map(str::to_owned),
        // XEP-0206 prefixes the attribute (xmpp:restart); accept both.
        restart: body
            .attributes()
            .iter()
            .any(|(qname, value)| qname.local() == "restart" && value == "true"),
        stanzas: body.child_elements().cloned().collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BoshConfig;

    fn params(wait: u64, hold: usize) -> BoshParams {
        BoshParams {
            wait,
            hold,
            polling: 15,
            inactivity: 60,
            requests: if hold >= 2 { hold + 1 } else { 2 },
            version: BOSH_VERSION.to_string(),
        }
    }

    fn chat(id: &str) -> XmlElement {
        XmlElement::builder("message", Some(ns::JABBER_CLIENT))
            .attr("id", id)
            .attr("type", "chat")
            .build()
    }

    #[test]
    fn negotiate_clamps_wait() {
        let config = BoshConfig::default();
        let negotiated = BoshParams::negotiate(&config, Some(300), None, None);
        assert_eq!(negotiated.wait, config.wait_max);

        let negotiated = BoshParams::negotiate(&config, Some(5), None, None);
        assert_eq!(negotiated.wait, 5);
    }

    #[test]
    fn negotiate_hold_raises_requests() {
        let config = BoshConfig::default();
        let negotiated = BoshParams::negotiate(&config, None, Some(3), None);
        assert_eq!(negotiated.requests, 4);

        let negotiated = BoshParams::negotiate(&config, None, Some(1), None);
        assert_eq!(negotiated.requests, 2);
    }

    #[test]
    fn negotiate_version_picks_lower() {
        let config = BoshConfig::default();
        let negotiated = BoshParams::negotiate(&config, None, None, Some("1.6"));
        assert_eq!(negotiated.version, "1.6");

        let negotiated = BoshParams::negotiate(&config, None, None, Some("2.0"));
        assert_eq!(negotiated.version, BOSH_VERSION);
    }

    #[tokio::test]
    async fn bosh_session_starts_encrypted() {
        let session = BoshSession::new("sid-1", params(60, 1));
        assert_eq!(session.state(), SessionState::Encrypted);
    }

    #[tokio::test]
    async fn write_attaches_to_suspended_request() {
        let session = BoshSession::new("sid-1", params(60, 1));
        let response = session.add_request(1);

        session.write(chat("m1"));
        let body = response.body().await.unwrap();
        assert!(body.contains("id='m1'"));

        let (requests, delayed) = session.queue_depths();
        assert_eq!((requests, delayed), (0, 0));
    }

    #[tokio::test]
    async fn write_without_request_is_delayed() {
        let session = BoshSession::new("sid-1", params(60, 1));
        session.write(chat("m1"));

        let (requests, delayed) = session.queue_depths();
        assert_eq!((requests, delayed), (0, 1));
    }

    #[tokio::test]
    async fn delayed_stanzas_merge_into_one_body() {
        let session = BoshSession::new("sid-1", params(60, 1));
        for i in 1..=3 {
            session.write(chat(&format!("m{}", i)));
        }

        let response = session.add_request(1);
        let body = response.body().await.unwrap();
        let m1 = body.find("id='m1'").unwrap();
        let m2 = body.find("id='m2'").unwrap();
        let m3 = body.find("id='m3'").unwrap();
        assert!(m1 < m2 && m2 < m3, "stanzas must keep write order");

        assert_eq!(session.queue_depths(), (0, 0));
    }

    #[tokio::test]
    async fn hold_overflow_releases_oldest() {
        let session = BoshSession::new("sid-1", params(60, 1));
        let first = session.add_request(1);
        let _second = session.add_request(2);

        // hold=1 means the second suspension releases the first, empty.
        let body = first.body().await.unwrap();
        assert_eq!(body, "<body xmlns='http://jabber.org/protocol/httpbind'/>");
        assert_eq!(session.queue_depths().0, 1);
    }

    #[tokio::test]
    async fn never_more_than_hold_plus_one_suspended() {
        let session = BoshSession::new("sid-1", params(60, 3));
        for rid in 1..=6 {
            let _response = session.add_request(rid);
            assert!(session.queue_depths().0 <= session.params().hold + 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn request_expires_with_empty_body() {
        let session = BoshSession::new("sid-1", params(5, 1));
        let response = session.add_request(1);

        tokio::time::advance(Duration::from_secs(6)).await;

        let body = response.body().await.unwrap();
        assert_eq!(body, "<body xmlns='http://jabber.org/protocol/httpbind'/>");
        assert_eq!(session.queue_depths(), (0, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_cascades_older_requests() {
        // hold=3 keeps several requests suspended at once.
        let session = BoshSession::new("sid-1", params(5, 3));
        let r1 = session.add_request(1);
        tokio::time::advance(Duration::from_secs(2)).await;
        let r2 = session.add_request(2);
        let r3 = session.add_request(3);

        // r1's timer fires first; r1 expires and nothing newer survives
        // before it, so only r1 drains at that instant. Let all timers of
        // the first request fire.
        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(r1.body().await.is_some());

        // The remaining timers fire 2 s later and drain the rest.
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(r2.body().await.is_some());
        assert!(r3.body().await.is_some());
        assert_eq!(session.queue_depths(), (0, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_of_newest_drains_older_first() {
        let session = BoshSession::new("sid-1", params(5, 3));
        let r1 = session.add_request(1);
        let r2 = session.add_request(2);
        let r3 = session.add_request(3);

        // Answer r3's expiry by hand: every older request drains too.
        session.request_expired(3);

        for response in [r1, r2, r3] {
            let body = response.body().await.unwrap();
            assert_eq!(body, "<body xmlns='http://jabber.org/protocol/httpbind'/>");
        }
        assert_eq!(session.queue_depths(), (0, 0));
    }

    #[tokio::test]
    async fn terminate_answers_all_requests() {
        let session = BoshSession::new("sid-1", params(60, 3));
        let r1 = session.add_request(1);
        let r2 = session.add_request(2);

        session.terminate();
        assert!(r1.body().await.unwrap().contains("type='terminate'"));
        assert!(r2.body().await.unwrap().contains("type='terminate'"));
        assert_eq!(session.state(), SessionState::Closed);

        // Writes after termination are dropped.
        session.write(chat("late"));
        assert_eq!(session.queue_depths(), (0, 0));
    }

    #[tokio::test]
    async fn queues_are_mutually_exclusive() {
        let session = BoshSession::new("sid-1", params(60, 1));

        session.write(chat("m1"));
        let (requests, delayed) = session.queue_depths();
        assert!(requests == 0 || delayed == 0);

        let _response = session.add_request(1);
        let (requests, delayed) = session.queue_depths();
        assert!(requests == 0 || delayed == 0);
    }

    #[tokio::test]
    async fn attached_writer_feeds_session() {
        let session = BoshSession::new("sid-1", params(60, 1));
        let writer = session.attach_writer();
        let response = session.add_request(1);

        writer.write(chat("m9")).unwrap();
        let body = response.body().await.unwrap();
        assert!(body.contains("id='m9'"));
    }

    #[test]
    fn parse_session_creation_body() {
        let request = parse_body_request(
            "<body xmlns='http://jabber.org/protocol/httpbind' rid='1573741820' \
             to='skein.im' wait='60' hold='1' ver='1.6' xml:lang='en'/>",
        )
        .unwrap();
        assert_eq!(request.rid, Some(1573741820));
        assert_eq!(request.to.as_deref(), Some("skein.im"));
        assert_eq!(request.wait, Some(60));
        assert_eq!(request.hold, Some(1));
        assert_eq!(request.version.as_deref(), Some("1.6"));
        assert!(!request.restart);
    }

    #[test]
    fn parse_body_with_stanzas() {
        let request = parse_body_request(
            "<body xmlns='http://jabber.org/protocol/httpbind' rid='2' sid='abc'>\
             <message xmlns='jabber:client' to='user1@skein.im'><body>hi</body></message>\
             </body>",
        )
        .unwrap();
        assert_eq!(request.sid.as_deref(), Some("abc"));
        assert_eq!(request.stanzas.len(), 1);
        assert_eq!(request.stanzas[0].name().local(), "message");
    }

    #[test]
    fn session_creation_response_advertises_parameters() {
        let params = params(60, 2);
        let body = render_session_creation_response("sid-9", "skein.im", &params);
        assert!(body.contains("sid='sid-9'"));
        assert!(body.contains("wait='60'"));
        assert!(body.contains("hold='2'"));
        assert!(body.contains("requests='3'"));
        assert!(body.contains("ver='1.9'"));
    }
}
