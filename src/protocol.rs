//! The per-session protocol state machine.
//!
//! Drives a session through stream negotiation, STARTTLS, SASL, resource
//! binding, and established stanza exchange. Transport bytes go in through
//! [`SessionStateMachine::on_bytes`]; replies leave through the session
//! writer; the few effects only the transport owner can perform (the TLS
//! handshake, tearing the socket down) come back as [`ProtocolAction`]s.
//!
//! ```text
//! INITIATED → OPENED → ENCRYPTED → AUTHENTICATED → BOUND → CLOSED
//!                ↘ ENCRYPTION_STARTED ↗
//! ```

use std::sync::Arc;

use base64::prelude::*;
use tracing::{debug, info, instrument, warn};

use crate::decoder::{DecodeError, StreamDecoder, StreamEvent, StreamHeader};
use crate::error::{
    as_stanza_error, stanza_error_reply, stream_error_xml, StanzaErrorCondition,
    StanzaErrorType, StreamErrorCondition,
};
use crate::jid::Jid;
use crate::router::RoutingOutcome;
use crate::sasl::{Mechanism, SaslFailure, StepOutcome, MAX_FAILURES};
use crate::session::{SessionContext, SessionState, SessionWriter, WriteError};
use crate::stanza::{iq_result, ns, StanzaKind, XmlElement};
use crate::ServerRuntimeContext;

/// Effects the transport owner must perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolAction {
    /// `<proceed/>` was written; run the TLS handshake, then call
    /// [`SessionStateMachine::on_tls_established`]
    StartTlsHandshake,
    /// The stream is finished; flush and drop the transport
    CloseTransport,
}

/// State machine for one session.
pub struct SessionStateMachine {
    runtime: Arc<ServerRuntimeContext>,
    ctx: SessionContext,
    decoder: StreamDecoder,
    sasl: Option<Box<dyn Mechanism>>,
    sasl_failures: u8,
    authenticated_jid: Option<Jid>,
    initial_presence_seen: bool,
    server_session: bool,
}

impl SessionStateMachine {
    /// Create a state machine for a fresh inbound connection.
    pub fn new(runtime: Arc<ServerRuntimeContext>, writer: SessionWriter) -> Self {
        Self {
            runtime,
            ctx: SessionContext::new(writer, false),
            decoder: StreamDecoder::new(),
            sasl: None,
            sasl_failures: 0,
            authenticated_jid: None,
            initial_presence_seen: false,
            server_session: false,
        }
    }

    /// The session context.
    pub fn context(&self) -> &SessionContext {
        &self.ctx
    }

    /// Whether this negotiated into a server-to-server session.
    pub fn is_server_session(&self) -> bool {
        self.server_session
    }

    /// The transport finished its TLS handshake.
    pub fn on_tls_established(&mut self) {
        if self.ctx.switch_to_tls().is_ok() {
            self.ctx.set_state(SessionState::Encrypted);
            self.decoder.restart();
            debug!(session = %self.ctx.id(), "TLS established, stream restarted");
        }
    }

    /// Feed transport bytes and run the state machine over the decoded
    /// events. Stops early when the transport must act (TLS handshake,
    /// close).
    #[instrument(skip(self, bytes), fields(session = %self.ctx.id(), state = %self.ctx.state()))]
    pub async fn on_bytes(&mut self, bytes: &[u8]) -> Vec<ProtocolAction> {
        self.decoder.feed(bytes);
        let mut actions = Vec::new();

        loop {
            if self.ctx.state() == SessionState::Closed {
                break;
            }
            match self.decoder.next_event() {
                Ok(Some(event)) => {
                    if let Some(action) = self.handle_event(event).await {
                        actions.push(action);
                        // Buffered bytes after a STARTTLS trigger belong to
                        // the TLS handshake, not the XML stream.
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    let condition = match e {
                        DecodeError::WellFormedness(_) => StreamErrorCondition::NotWellFormed,
                        DecodeError::UnsupportedXml(_) => StreamErrorCondition::RestrictedXml,
                    };
                    warn!(session = %self.ctx.id(), error = %e, "decode failure, closing stream");
                    self.fail_stream(condition, Some(&e.to_string()));
                    actions.push(ProtocolAction::CloseTransport);
                    break;
                }
            }
        }

        actions
    }

    async fn handle_event(&mut self, event: StreamEvent) -> Option<ProtocolAction> {
        match event {
            StreamEvent::StreamOpen(header) => self.handle_stream_open(header),
            StreamEvent::TopLevelElement(element) => self.handle_element(element).await,
            StreamEvent::StreamClose => {
                debug!(session = %self.ctx.id(), "peer closed the stream");
                self.close_session();
                Some(ProtocolAction::CloseTransport)
            }
        }
    }

    fn handle_stream_open(&mut self, header: StreamHeader) -> Option<ProtocolAction> {
        if header.stream_namespace.as_deref() != Some(ns::STREAM) {
            self.fail_stream(StreamErrorCondition::InvalidNamespace, None);
            return Some(ProtocolAction::CloseTransport);
        }
        if header.content_namespace.as_deref() == Some(ns::JABBER_SERVER) {
            self.server_session = true;
        }
        if let Some(to) = &header.to {
            if !self.runtime.router.is_local_domain(to) {
                self.fail_stream(StreamErrorCondition::HostUnknown, None);
                return Some(ProtocolAction::CloseTransport);
            }
        }

        match self.ctx.state() {
            SessionState::Initiated => self.ctx.set_state(SessionState::Opened),
            // Restarts arrive in Encrypted (after STARTTLS) and
            // Authenticated (after SASL); the state itself stays.
            SessionState::Encrypted | SessionState::Authenticated => {}
            state => {
                debug!(session = %self.ctx.id(), %state, "unexpected stream header");
                self.fail_stream(StreamErrorCondition::BadFormat, None);
                return Some(ProtocolAction::CloseTransport);
            }
        }

        self.ctx.new_stream_id();
        let reply = format!("{}{}", self.stream_header_xml(), self.features_xml());
        self.send_raw(reply)
    }

    fn stream_header_xml(&self) -> String {
        let content_ns = if self.server_session {
            ns::JABBER_SERVER
        } else {
            ns::JABBER_CLIENT
        };
        format!(
            "<?xml version='1.0'?>\
             <stream:stream xmlns='{}' xmlns:stream='{}' id='{}' from='{}' version='1.0'>",
            content_ns,
            ns::STREAM,
            self.ctx.stream_id(),
            self.runtime.domain
        )
    }

    /// The feature list depends on where negotiation stands: TLS first when
    /// required, then SASL mechanisms, then bind and session.
    fn features_xml(&self) -> String {
        let tls = &self.runtime.config.tls;
        let encrypted = self.ctx.is_encrypted();

        if self.server_session {
            return "<stream:features>\
                    <dialback xmlns='urn:xmpp:features:dialback'/>\
                    </stream:features>"
                .to_string();
        }

        if tls.required && !encrypted {
            return format!(
                "<stream:features><starttls xmlns='{}'><required/></starttls></stream:features>",
                ns::TLS
            );
        }

        if !self.ctx.is_authenticated() {
            let mut features = String::from("<stream:features>");
            if !encrypted && self.tls_available() {
                features.push_str(&format!("<starttls xmlns='{}'/>", ns::TLS));
            }
            features.push_str(&format!("<mechanisms xmlns='{}'>", ns::SASL));
            for mechanism in self.runtime.sasl.advertised(encrypted) {
                features.push_str(&format!("<mechanism>{}</mechanism>", mechanism));
            }
            features.push_str("</mechanisms></stream:features>");
            return features;
        }

        format!(
            "<stream:features>\
             <bind xmlns='{}'/>\
             <session xmlns='{}'><optional/></session>\
             </stream:features>",
            ns::BIND,
            ns::SESSION
        )
    }

    fn tls_available(&self) -> bool {
        self.runtime.config.tls.certificate_file.is_some()
    }

    async fn handle_element(&mut self, element: XmlElement) -> Option<ProtocolAction> {
        match self.ctx.state() {
            SessionState::Opened | SessionState::Encrypted => {
                self.handle_negotiation_element(element).await
            }
            SessionState::Authenticated => self.handle_pre_bind_element(element).await,
            SessionState::Bound => self.handle_bound_element(element).await,
            state => {
                debug!(session = %self.ctx.id(), %state, "element in unexpected state");
                self.fail_stream(StreamErrorCondition::BadFormat, None);
                Some(ProtocolAction::CloseTransport)
            }
        }
    }

    async fn handle_negotiation_element(&mut self, element: XmlElement) -> Option<ProtocolAction> {
        let namespace = element.name().namespace();

        if namespace == Some(ns::TLS) && element.name().local() == "starttls" {
            return self.handle_starttls();
        }

        if namespace == Some(ns::SASL) {
            return self.handle_sasl_element(element).await;
        }

        if self.server_session && namespace == Some(ns::DIALBACK) {
            return self.handle_dialback_element(element).await;
        }

        // Anything else before authentication is refused.
        let reply = stanza_error_reply(
            &element,
            StanzaErrorCondition::NotAuthorized,
            StanzaErrorType::Auth,
            None,
        );
        self.send(reply)
    }

    fn handle_starttls(&mut self) -> Option<ProtocolAction> {
        if self.ctx.is_encrypted() || !self.tls_available() {
            debug!(session = %self.ctx.id(), "refusing STARTTLS");
            let _ = self
                .ctx
                .writer()
                .write_raw(format!("<failure xmlns='{}'/>", ns::TLS));
            self.close_session();
            return Some(ProtocolAction::CloseTransport);
        }

        if let Some(action) = self.send_raw(format!("<proceed xmlns='{}'/>", ns::TLS)) {
            return Some(action);
        }
        self.ctx.set_state(SessionState::EncryptionStarted);
        Some(ProtocolAction::StartTlsHandshake)
    }

    async fn handle_sasl_element(&mut self, element: XmlElement) -> Option<ProtocolAction> {
        match element.name().local() {
            "auth" => {
                // TLS-required deployments accept no SASL on plaintext.
                if self.runtime.config.tls.required && !self.ctx.is_encrypted() {
                    debug!(session = %self.ctx.id(), "SASL before mandatory STARTTLS");
                    return self.sasl_failure(SaslFailure::InvalidMechanism);
                }
                let mechanism_name = element.attr("mechanism").unwrap_or("").to_string();
                let Some(mechanism) = self
                    .runtime
                    .sasl
                    .start(&mechanism_name, self.ctx.is_encrypted())
                else {
                    debug!(session = %self.ctx.id(), mechanism = %mechanism_name, "mechanism not offered");
                    return self.sasl_failure(SaslFailure::InvalidMechanism);
                };
                info!(session = %self.ctx.id(), mechanism = %mechanism_name, "SASL exchange started");
                self.sasl = Some(mechanism);
                let Some(payload) = decode_sasl_payload(&element.text()) else {
                    return self.sasl_failure(SaslFailure::MalformedRequest);
                };
                self.sasl_step(&payload).await
            }
            "response" => {
                if self.sasl.is_none() {
                    return self.sasl_failure(SaslFailure::MalformedRequest);
                }
                let Some(payload) = decode_sasl_payload(&element.text()) else {
                    return self.sasl_failure(SaslFailure::MalformedRequest);
                };
                self.sasl_step(&payload).await
            }
            "abort" => {
                debug!(session = %self.ctx.id(), "SASL aborted by client");
                self.sasl = None;
                self.sasl_failures += 1;
                let failure = format!("<failure xmlns='{}'><aborted/></failure>", ns::SASL);
                if let Some(action) = self.send_raw(failure) {
                    return Some(action);
                }
                self.check_failure_budget()
            }
            other => {
                debug!(session = %self.ctx.id(), element = other, "unexpected SASL element");
                self.sasl_failure(SaslFailure::MalformedRequest)
            }
        }
    }

    async fn sasl_step(&mut self, payload: &[u8]) -> Option<ProtocolAction> {
        let Some(mechanism) = self.sasl.as_mut() else {
            return self.sasl_failure(SaslFailure::MalformedRequest);
        };

        match mechanism.step(payload).await {
            StepOutcome::Continue(challenge) => {
                let encoded = BASE64_STANDARD.encode(challenge);
                self.send_raw(format!(
                    "<challenge xmlns='{}'>{}</challenge>",
                    ns::SASL,
                    encoded
                ))
            }
            StepOutcome::Success { jid, data } => {
                self.sasl = None;
                self.sasl_failures = 0;

                let success = match data {
                    Some(data) => format!(
                        "<success xmlns='{}'>{}</success>",
                        ns::SASL,
                        BASE64_STANDARD.encode(data)
                    ),
                    None => format!("<success xmlns='{}'/>", ns::SASL),
                };
                if let Some(action) = self.send_raw(success) {
                    return Some(action);
                }

                info!(session = %self.ctx.id(), jid = %jid, "authenticated");
                self.authenticated_jid = Some(jid);
                self.ctx.set_authenticated();
                self.ctx.set_state(SessionState::Authenticated);
                // SASL success restarts the stream.
                self.decoder.restart();
                None
            }
            StepOutcome::Failure(kind) => {
                self.sasl = None;
                self.sasl_failure(kind)
            }
        }
    }

    fn sasl_failure(&mut self, kind: SaslFailure) -> Option<ProtocolAction> {
        self.sasl_failures += 1;
        debug!(
            session = %self.ctx.id(),
            kind = kind.as_str(),
            consecutive = self.sasl_failures,
            "SASL failure"
        );
        let failure = format!(
            "<failure xmlns='{}'><{}/></failure>",
            ns::SASL,
            kind.as_str()
        );
        if let Some(action) = self.send_raw(failure) {
            return Some(action);
        }
        self.check_failure_budget()
    }

    fn check_failure_budget(&mut self) -> Option<ProtocolAction> {
        if self.sasl_failures >= MAX_FAILURES {
            warn!(session = %self.ctx.id(), "too many SASL failures, closing transport");
            self.fail_stream(StreamErrorCondition::PolicyViolation, None);
            return Some(ProtocolAction::CloseTransport);
        }
        None
    }

    async fn handle_pre_bind_element(&mut self, element: XmlElement) -> Option<ProtocolAction> {
        if element.kind() == StanzaKind::Iq {
            if element.find_child("bind", Some(ns::BIND)).is_some() {
                return self.handle_bind(element);
            }
            if element.find_child("session", Some(ns::SESSION)).is_some() {
                // Legacy session establishment (RFC 3921) is a no-op.
                return self.send(iq_result(&element, None));
            }
        }

        let reply = stanza_error_reply(
            &element,
            StanzaErrorCondition::NotAuthorized,
            StanzaErrorType::Auth,
            Some("bind a resource first"),
        );
        self.send(reply)
    }

    fn handle_bind(&mut self, iq: XmlElement) -> Option<ProtocolAction> {
        if iq.attr("type") != Some("set") {
            let reply = stanza_error_reply(
                &iq,
                StanzaErrorCondition::BadRequest,
                StanzaErrorType::Modify,
                Some("bind must be an iq set"),
            );
            return self.send(reply);
        }

        let Some(auth_jid) = self.authenticated_jid.clone() else {
            self.fail_stream(StreamErrorCondition::BadFormat, None);
            return Some(ProtocolAction::CloseTransport);
        };

        let requested = iq
            .find_child("bind", Some(ns::BIND))
            .and_then(|bind| bind.find_child("resource", Some(ns::BIND)))
            .map(|resource| resource.text());
        let resource = match requested {
            Some(resource) if !resource.trim().is_empty() => resource.trim().to_string(),
            _ => generated_resource(),
        };

        let full_jid = match auth_jid.with_resource(&resource) {
            Ok(jid) => jid,
            Err(e) => {
                let reply = stanza_error_reply(
                    &iq,
                    StanzaErrorCondition::JidMalformed,
                    StanzaErrorType::Modify,
                    Some(&e.to_string()),
                );
                return self.send(reply);
            }
        };

        match self.runtime.registry.bind(
            full_jid.clone(),
            self.ctx.id().clone(),
            self.ctx.writer().clone(),
        ) {
            Ok(_) => {}
            Err(e) => {
                debug!(session = %self.ctx.id(), jid = %full_jid, "bind conflict");
                let (condition, error_type, text) = as_stanza_error(&e).unwrap_or((
                    StanzaErrorCondition::Conflict,
                    StanzaErrorType::Cancel,
                    None,
                ));
                let reply = stanza_error_reply(&iq, condition, error_type, text.as_deref());
                return self.send(reply);
            }
        }

        let payload = XmlElement::builder("bind", Some(ns::BIND))
            .child(
                XmlElement::builder("jid", Some(ns::BIND))
                    .text(full_jid.to_string())
                    .build(),
            )
            .build();
        if let Some(action) = self.send(iq_result(&iq, Some(payload))) {
            return Some(action);
        }

        info!(session = %self.ctx.id(), jid = %full_jid, "resource bound");
        self.ctx.set_bound_jid(full_jid);
        self.ctx.set_state(SessionState::Bound);
        None
    }

    async fn handle_bound_element(&mut self, element: XmlElement) -> Option<ProtocolAction> {
        let bound = self
            .ctx
            .bound_jid()
            .cloned()
            .expect("bound state implies a bound JID");

        // A verified inbound link can still receive dialback traffic.
        if self.server_session && element.name().namespace() == Some(ns::DIALBACK) {
            return self.handle_dialback_element(element).await;
        }

        // Broadcast presence manages this session's availability.
        if element.kind() == StanzaKind::Presence && element.attr("to").is_none() {
            return self.handle_broadcast_presence(&element, &bound).await;
        }

        // The sender address of a client stanza is always the bound JID,
        // whatever the client claims. Peer servers speak for their own
        // users and keep their 'from'.
        let stanza = if self.server_session {
            element
        } else {
            element.with_attr("from", bound.to_string())
        };
        let original = stanza.clone();

        match self.runtime.router.route(stanza, &bound).await {
            Ok(RoutingOutcome::Reply(reply)) | Ok(RoutingOutcome::ErrorReply(reply)) => {
                self.send(reply)
            }
            Ok(outcome) => {
                debug!(session = %self.ctx.id(), ?outcome, "stanza routed");
                None
            }
            Err(e) => {
                warn!(session = %self.ctx.id(), error = %e, "routing failed");
                match as_stanza_error(&e) {
                    Some((condition, error_type, text)) => {
                        let reply =
                            stanza_error_reply(&original, condition, error_type, text.as_deref());
                        self.send(reply)
                    }
                    None => {
                        self.fail_stream(StreamErrorCondition::UndefinedCondition, None);
                        Some(ProtocolAction::CloseTransport)
                    }
                }
            }
        }
    }

    async fn handle_broadcast_presence(
        &mut self,
        presence: &XmlElement,
        bound: &Jid,
    ) -> Option<ProtocolAction> {
        let available = match presence.attr("type") {
            None => true,
            Some("unavailable") => false,
            Some(other) => {
                debug!(session = %self.ctx.id(), presence_type = other, "ignoring broadcast presence");
                return None;
            }
        };
        let priority = presence
            .find_child_any_ns("priority")
            .and_then(|p| p.text().trim().parse::<i8>().ok())
            .unwrap_or(0);

        self.runtime
            .registry
            .update_presence(bound, available, priority);
        debug!(session = %self.ctx.id(), available, priority, "presence updated");

        // The first available presence flushes the offline store.
        if available && !self.initial_presence_seen {
            self.initial_presence_seen = true;
            match self.runtime.offline.drain(&bound.to_bare()).await {
                Ok(stored) => {
                    for message in stored {
                        if let Some(action) = self.send(message) {
                            return Some(action);
                        }
                    }
                }
                Err(e) => warn!(session = %self.ctx.id(), error = %e, "offline drain failed"),
            }
        }
        None
    }

    async fn handle_dialback_element(&mut self, element: XmlElement) -> Option<ProtocolAction> {
        let Some(s2s) = self.runtime.s2s.clone() else {
            self.fail_stream(StreamErrorCondition::PolicyViolation, None);
            return Some(ProtocolAction::CloseTransport);
        };

        match element.name().local() {
            "verify" => match s2s.answer_verify(&element) {
                Ok(answer) => self.send(answer),
                Err(e) => {
                    debug!(session = %self.ctx.id(), error = %e, "malformed db:verify");
                    self.fail_stream(StreamErrorCondition::BadFormat, None);
                    Some(ProtocolAction::CloseTransport)
                }
            },
            "result" if element.attr("type").is_none() => {
                let (Some(from), Some(to)) = (element.attr("from"), element.attr("to")) else {
                    self.fail_stream(StreamErrorCondition::BadFormat, None);
                    return Some(ProtocolAction::CloseTransport);
                };
                let (from, to) = (from.to_string(), to.to_string());
                let key = element.text();

                let verdict = match s2s
                    .verify_back(&from, self.ctx.stream_id(), key.trim())
                    .await
                {
                    Ok(verdict) => verdict,
                    Err(e) => {
                        warn!(session = %self.ctx.id(), error = %e, "dialback verify-back failed");
                        crate::s2s::DialbackVerdict::Invalid
                    }
                };

                let answer = crate::s2s::dialback::db_result_verdict(&to, &from, verdict);
                if let Some(action) = self.send(answer) {
                    return Some(action);
                }

                if verdict == crate::s2s::DialbackVerdict::Valid {
                    match Jid::parse(&from) {
                        Ok(peer) => {
                            info!(session = %self.ctx.id(), peer = %from, "inbound S2S link verified");
                            self.ctx.set_authenticated();
                            self.ctx.set_bound_jid(peer);
                            self.ctx.set_state(SessionState::Bound);
                        }
                        Err(_) => {
                            self.fail_stream(StreamErrorCondition::BadFormat, None);
                            return Some(ProtocolAction::CloseTransport);
                        }
                    }
                }
                None
            }
            _ => {
                debug!(session = %self.ctx.id(), "ignoring dialback element");
                None
            }
        }
    }

    /// Emit a fatal stream error and mark the session closed.
    fn fail_stream(&mut self, condition: StreamErrorCondition, text: Option<&str>) {
        let _ = self.ctx.writer().write_raw(stream_error_xml(condition, text));
        let _ = self.ctx.writer().close();
        self.close_session();
    }

    fn close_session(&mut self) {
        if let (Some(jid), id) = (self.ctx.bound_jid().cloned(), self.ctx.id().clone()) {
            self.runtime.registry.unbind(&jid, &id);
        }
        let _ = self.ctx.writer().close();
        self.ctx.set_state(SessionState::Closed);
    }

    /// Write a stanza, converting backpressure overflow into the mandated
    /// policy-violation close.
    fn send(&mut self, stanza: XmlElement) -> Option<ProtocolAction> {
        match self.ctx.writer().write(stanza) {
            Ok(()) => None,
            Err(WriteError::QueueFull) => {
                self.fail_stream(StreamErrorCondition::PolicyViolation, Some("outbound queue overflow"));
                Some(ProtocolAction::CloseTransport)
            }
            Err(WriteError::Closed) => {
                self.close_session();
                Some(ProtocolAction::CloseTransport)
            }
        }
    }

    fn send_raw(&mut self, xml: String) -> Option<ProtocolAction> {
        match self.ctx.writer().write_raw(xml) {
            Ok(()) => None,
            Err(WriteError::QueueFull) => {
                self.fail_stream(StreamErrorCondition::PolicyViolation, Some("outbound queue overflow"));
                Some(ProtocolAction::CloseTransport)
            }
            Err(WriteError::Closed) => {
                self.close_session();
                Some(ProtocolAction::CloseTransport)
            }
        }
    }
}

/// Decode a SASL payload: base64 text, with a bare `=` meaning empty.
fn decode_sasl_payload(text: &str) -> Option<Vec<u8>> {
    let trimmed = text.trim();
    if trimmed.is_empty() || trimmed == "=" {
        return Some(Vec::new());
    }
    BASE64_STANDARD.decode(trimmed).ok()
}

/// Server-generated resource identifiers.
fn generated_resource() -> String {
    format!("skein-{}", &uuid::Uuid::new_v4().simple().to_string()[..12])
}

