//! BOSH (XEP-0124) scenarios: timeout drain, merge on attach, queue
//! invariants, and parameter negotiation.

use std::time::Duration;

use skein_xmpp::bosh::{
    parse_body_request, render_session_creation_response, BoshParams, BoshSession,
};
use skein_xmpp::config::BoshConfig;
use skein_xmpp::session::SessionState;
use skein_xmpp::stanza::{ns, XmlElement};

fn params(wait: u64, hold: usize) -> BoshParams {
    BoshParams::negotiate(
        &BoshConfig {
            wait_max: 60,
            hold,
            polling: 15,
            inactivity: 60,
        },
        Some(wait),
        Some(hold),
        None,
    )
}

fn chat(id: &str) -> XmlElement {
    XmlElement::builder("message", Some(ns::JABBER_CLIENT))
        .attr("id", id)
        .attr("type", "chat")
        .child(
            XmlElement::builder("body", Some(ns::JABBER_CLIENT))
                .text("payload")
                .build(),
        )
        .build()
}

/// Scenario: one POST, no pending stanzas, wait=5. After five seconds the
/// server answers with an empty body and both queues are empty.
#[tokio::test(start_paused = true)]
async fn drain_on_timeout() {
    let session = BoshSession::new("sid-timeout", params(5, 1));
    let response = session.add_request(1);
    assert_eq!(session.queue_depths(), (1, 0));

    tokio::time::advance(Duration::from_secs(5)).await;

    let body = response.body().await.unwrap();
    assert_eq!(body, "<body xmlns='http://jabber.org/protocol/httpbind'/>");
    assert_eq!(session.queue_depths(), (0, 0));
}

/// Scenario: three delayed stanzas, then one POST. The response carries all
/// three in order and both queues end empty.
#[tokio::test]
async fn merge_on_new_request() {
    let session = BoshSession::new("sid-merge", params(60, 1));
    for i in 1..=3 {
        session.write(chat(&format!("d{}", i)));
    }
    assert_eq!(session.queue_depths(), (0, 3));

    let response = session.add_request(1);
    let body = response.body().await.unwrap();

    let p1 = body.find("id='d1'").expect("first stanza present");
    let p2 = body.find("id='d2'").expect("second stanza present");
    let p3 = body.find("id='d3'").expect("third stanza present");
    assert!(p1 < p2 && p2 < p3);
    assert_eq!(session.queue_depths(), (0, 0));
}

/// At no point may both queues be non-empty, and the suspended request
/// count never exceeds hold + 1.
#[tokio::test]
async fn queue_invariants_under_mixed_load() {
    let session = BoshSession::new("sid-mixed", params(60, 2));

    let check = |session: &std::sync::Arc<BoshSession>| {
        let (requests, delayed) = session.queue_depths();
        assert!(
            requests == 0 || delayed == 0,
            "both queues non-empty: {} requests, {} delayed",
            requests,
            delayed
        );
        assert!(requests <= session.params().hold + 1);
    };

    session.write(chat("a"));
    check(&session);
    let _r1 = session.add_request(1);
    check(&session);
    let _r2 = session.add_request(2);
    check(&session);
    session.write(chat("b"));
    check(&session);
    let _r3 = session.add_request(3);
    check(&session);
    let _r4 = session.add_request(4);
    check(&session);
    session.write(chat("c"));
    check(&session);
}

#[tokio::test(start_paused = true)]
async fn expiry_cascade_drains_older_requests() {
    let session = BoshSession::new("sid-cascade", params(5, 3));
    let r1 = session.add_request(1);
    let r2 = session.add_request(2);
    let r3 = session.add_request(3);
    assert_eq!(session.queue_depths(), (3, 0));

    tokio::time::advance(Duration::from_secs(5)).await;

    for response in [r1, r2, r3] {
        let body = response.body().await.unwrap();
        assert_eq!(body, "<body xmlns='http://jabber.org/protocol/httpbind'/>");
    }
    assert_eq!(session.queue_depths(), (0, 0));
}

#[tokio::test]
async fn session_starts_in_encrypted_state() {
    let session = BoshSession::new("sid-state", params(60, 1));
    assert_eq!(session.state(), SessionState::Encrypted);
    // STARTTLS has no BOSH equivalent; the call simply does nothing.
    session.switch_to_tls();
    assert_eq!(session.state(), SessionState::Encrypted);
}

#[tokio::test]
async fn terminate_answers_every_open_request() {
    let session = BoshSession::new("sid-term", params(60, 2));
    let r1 = session.add_request(1);
    let r2 = session.add_request(2);

    session.terminate();

    assert!(r1.body().await.unwrap().contains("type='terminate'"));
    assert!(r2.body().await.unwrap().contains("type='terminate'"));
    assert_eq!(session.state(), SessionState::Closed);
}

#[test]
fn wait_negotiates_downward_only() {
    let config = BoshConfig::default();
    assert_eq!(BoshParams::negotiate(&config, Some(600), None, None).wait, 60);
    assert_eq!(BoshParams::negotiate(&config, Some(10), None, None).wait, 10);
    assert_eq!(BoshParams::negotiate(&config, None, None, None).wait, 60);
}

#[test]
fn hold_of_two_or_more_raises_requests() {
    let config = BoshConfig::default();
    assert_eq!(BoshParams::negotiate(&config, None, Some(2), None).requests, 3);
    assert_eq!(BoshParams::negotiate(&config, None, Some(5), None).requests, 6);
    assert_eq!(BoshParams::negotiate(&config, None, Some(1), None).requests, 2);
}

#[test]
fn session_creation_round_trip() {
    let request = parse_body_request(
        "<body xmlns='http://jabber.org/protocol/httpbind' rid='1573741820' \
         to='skein.im' wait='45' hold='2' ver='1.6'/>",
    )
    .unwrap();

    let config = BoshConfig::default();
    let negotiated = BoshParams::negotiate(
        &config,
        request.wait,
        request.hold,
        request.version.as_deref(),
    );
    assert_eq!(negotiated.wait, 45);
    assert_eq!(negotiated.hold, 2);
    assert_eq!(negotiated.requests, 3);
    assert_eq!(negotiated.version, "1.6");

    let response = render_session_creation_response("sid-new", "skein.im", &negotiated);
    let parsed = parse_body_request(&response).unwrap();
    assert_eq!(parsed.sid.as_deref(), Some("sid-new"));
}

#[tokio::test]
async fn restart_flag_is_parsed() {
    let request = parse_body_request(
        "<body xmlns='http://jabber.org/protocol/httpbind' rid='2' sid='abc' \
         xmlns:xmpp='urn:xmpp:xbosh' xmpp:restart='true'/>",
    )
    .unwrap();
    assert!(request.restart);
}

#[tokio::test]
async fn wrapped_stanzas_flow_into_the_session() {
    let request = parse_body_request(
        "<body xmlns='http://jabber.org/protocol/httpbind' rid='3' sid='abc'>\
         <message xmlns='jabber:client' to='user1@skein.im' type='chat'>\
         <body>over http</body></message></body>",
    )
    .unwrap();
    assert_eq!(request.stanzas.len(), 1);
    let message = &request.stanzas[0];
    assert_eq!(message.name().local(), "message");
    assert_eq!(message.attr("to"), Some("user1@skein.im"));
}
