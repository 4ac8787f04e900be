// Copyright (c) 2024 Jonas Schäfer <jonas@zombofant.net>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use core::time::Duration;
use std::sync::Arc;

use jid::Jid;

use super::*;
use crate::auth::SaslAuthenticator;
use crate::config::SessionConfig;
use crate::error::AuthError;
use crate::ns;
use crate::stanza::Stanza;
use crate::stream_management::{QueueEntry, SmState};
use crate::testutil::{MockConnector, Peer, FEATURES_AUTH, FEATURES_BIND_SM};

fn features(starttls: bool, required: bool, mechanisms: &[&str], bind: bool) -> Features {
    Features {
        starttls,
        starttls_required: required,
        mechanisms: mechanisms.iter().map(|m| m.to_string()).collect(),
        bind,
        ..Features::default()
    }
}

fn config() -> SessionConfig {
    SessionConfig::new(Jid::new("juliet@example.org").unwrap())
        .with_tls(TlsPolicy::Disabled)
        .with_negotiation_timeout(Duration::from_secs(5))
}

#[test]
fn transition_table() {
    use NegotiationState::*;
    assert!(Connecting.can_transition_to(EnvelopeOpened));
    assert!(FeaturesReceived.can_transition_to(Encrypting));
    assert!(Encrypting.can_transition_to(EnvelopeOpened));
    assert!(Resuming.can_transition_to(Binding));
    assert!(Binding.can_transition_to(Failed));
    assert!(Failed.can_transition_to(Connecting));

    assert!(!Connecting.can_transition_to(Established));
    assert!(!EnvelopeOpened.can_transition_to(Established));
    assert!(!Encrypting.can_transition_to(Established));
    assert!(!Failed.can_transition_to(Established));
    assert!(!Established.can_transition_to(Binding));
}

#[test]
fn mandatory_tls_cannot_be_skipped() {
    // The server marks STARTTLS as required, the connector cannot upgrade.
    let mut negotiator = Negotiator::new(TlsPolicy::IfAvailable, false, false, true, false);
    let adv = features(true, true, &["PLAIN"], false);
    assert!(matches!(
        negotiator.next_step(&adv),
        Err(Error::PolicyViolation(PolicyViolation::EncryptionRequired))
    ));

    // Pretending authentication and binding happened does not help either.
    negotiator.transition(NegotiationState::EnvelopeOpened).unwrap();
    negotiator
        .transition(NegotiationState::FeaturesReceived)
        .unwrap();
    negotiator.authenticated();
    negotiator.bound();
    assert!(matches!(
        negotiator.transition(NegotiationState::Established),
        Err(Error::PolicyViolation(PolicyViolation::EncryptionRequired))
    ));
    assert_eq!(negotiator.state(), NegotiationState::FeaturesReceived);
}

#[test]
fn disabled_tls_against_required_server() {
    let mut negotiator = Negotiator::new(TlsPolicy::Disabled, true, false, true, false);
    let adv = features(true, true, &["PLAIN"], false);
    assert!(matches!(
        negotiator.next_step(&adv),
        Err(Error::PolicyViolation(PolicyViolation::EncryptionDisabled))
    ));
}

#[test]
fn required_tls_without_offer() {
    let mut negotiator = Negotiator::new(TlsPolicy::Required, true, false, true, false);
    let adv = features(false, false, &["PLAIN"], false);
    assert!(matches!(
        negotiator.next_step(&adv),
        Err(Error::PolicyViolation(PolicyViolation::EncryptionRequired))
    ));
}

#[test]
fn step_order() {
    let mut negotiator = Negotiator::new(TlsPolicy::Required, true, false, true, false);
    assert_eq!(
        negotiator
            .next_step(&features(true, false, &["PLAIN"], false))
            .unwrap(),
        Step::StartTls
    );
    negotiator.encrypted();
    assert_eq!(
        negotiator
            .next_step(&features(false, false, &["PLAIN"], false))
            .unwrap(),
        Step::Authenticate
    );
    negotiator.authenticated();

    let mut adv = features(false, false, &[], true);
    adv.session_required = true;
    adv.stream_management = true;
    assert_eq!(negotiator.next_step(&adv).unwrap(), Step::Bind);
    negotiator.bound();
    assert_eq!(negotiator.next_step(&adv).unwrap(), Step::StartSession);
    negotiator.session_started();
    assert_eq!(negotiator.next_step(&adv).unwrap(), Step::EnableSm);
    negotiator.sm_negotiated(true);
    assert_eq!(negotiator.next_step(&adv).unwrap(), Step::Establish);
    assert!(negotiator.flags().resumable);
}

#[test]
fn unauthenticated_bind_is_refused() {
    let mut negotiator = Negotiator::new(TlsPolicy::Disabled, false, false, true, false);
    assert!(matches!(
        negotiator.next_step(&features(false, false, &[], true)),
        Err(Error::PolicyViolation(
            PolicyViolation::AuthenticationRequired
        ))
    ));
}

#[test]
fn resume_before_bind() {
    let mut negotiator = Negotiator::new(TlsPolicy::Disabled, false, false, true, true);
    negotiator.authenticated();
    let mut adv = features(false, false, &[], true);
    adv.stream_management = true;
    assert_eq!(negotiator.next_step(&adv).unwrap(), Step::Resume);
    // resumption failed: bind afresh
    assert_eq!(negotiator.next_step(&adv).unwrap(), Step::Bind);
}

#[tokio::test]
async fn full_handshake() {
    let (connector, mut servers) = MockConnector::new();
    let server = tokio::spawn(async move {
        let mut peer = Peer::new(servers.recv().await.unwrap());
        peer.handshake(true).await;
        peer.send("<message from='romeo@example.net/orchard'><body>hi</body></message>")
            .await;
        peer
    });

    let mut states = Vec::new();
    let mut prior = None;
    let negotiated = negotiate(
        &connector,
        &SaslAuthenticator::new("juliet", "r0m30"),
        &config(),
        &mut prior,
        |state, _, _| states.push(state),
    )
    .await
    .unwrap();
    let _peer = server.await.unwrap();

    use NegotiationState::*;
    assert_eq!(
        states,
        vec![
            EnvelopeOpened,
            FeaturesReceived,
            Authenticating,
            EnvelopeOpened,
            FeaturesReceived,
            Binding,
            Established
        ]
    );
    assert_eq!(
        negotiated.bound_jid,
        Some(Jid::new("juliet@example.org/balcony").unwrap())
    );
    assert!(!negotiated.resumed);
    assert!(negotiated.flags.authenticated && negotiated.flags.bound);
    assert!(negotiated.flags.resumable);
    assert!(negotiated.sm.unwrap().is_resumable());
}

#[tokio::test]
async fn starttls_restarts_stream() {
    let (mut connector, mut servers) = MockConnector::new();
    connector.upgrade = true;
    let server = tokio::spawn(async move {
        let mut peer = Peer::new(servers.recv().await.unwrap());
        peer.accept_stream().await;
        peer.send(
            "<stream:features><starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'><required/></starttls></stream:features>",
        )
        .await;
        peer.expect("starttls", ns::TLS).await;
        peer.send("<proceed xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>")
            .await;
        peer.handshake(false).await;
    });

    let mut prior = None;
    let negotiated = negotiate(
        &connector,
        &SaslAuthenticator::new("juliet", "r0m30"),
        &config().with_tls(TlsPolicy::Required),
        &mut prior,
        |_, _, _| (),
    )
    .await
    .unwrap();
    server.await.unwrap();
    assert!(negotiated.flags.encrypted);
    assert!(negotiated.sm.is_none());
}

#[tokio::test]
async fn auth_failure_is_reported() {
    let (connector, mut servers) = MockConnector::new();
    tokio::spawn(async move {
        let mut peer = Peer::new(servers.recv().await.unwrap());
        peer.accept_stream().await;
        peer.send(FEATURES_AUTH).await;
        peer.expect("auth", ns::SASL).await;
        peer.send("<failure xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><not-authorized/></failure>")
            .await;
        peer
    });

    let mut prior = None;
    let err = negotiate(
        &connector,
        &SaslAuthenticator::new("juliet", "wrong"),
        &config(),
        &mut prior,
        |_, _, _| (),
    )
    .await
    .err()
    .unwrap();
    assert!(matches!(
        err,
        Error::Collaborator(crate::error::CollaboratorFailure::Auth(AuthError::Fail(ref c))) if c == "not-authorized"
    ));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn stream_error_during_negotiation() {
    let (connector, mut servers) = MockConnector::new();
    tokio::spawn(async move {
        let mut peer = Peer::new(servers.recv().await.unwrap());
        peer.accept_stream().await;
        peer.send(
            "<stream:error><host-unknown xmlns='urn:ietf:params:xml:ns:xmpp-streams'/></stream:error>",
        )
        .await;
        peer
    });

    let mut prior = None;
    let err = negotiate(
        &connector,
        &SaslAuthenticator::new("juliet", "r0m30"),
        &config(),
        &mut prior,
        |_, _, _| (),
    )
    .await
    .err()
    .unwrap();
    assert!(matches!(err, Error::Stream(ref info) if info.condition == "host-unknown"));
}

fn resumable_state() -> SmState {
    let enabled = "<enabled xmlns='urn:xmpp:sm:3' id='sm-1' resume='true'/>"
        .parse()
        .unwrap();
    let mut state = SmState::from_enabled(&enabled);
    for id in ["m1", "m2"] {
        let stanza = Stanza::chat(Jid::new("romeo@example.net").unwrap(), "hi").with_id(id);
        state.enqueue(QueueEntry::new(Arc::new(stanza)));
    }
    state.count_inbound();
    state
}

#[tokio::test]
async fn resumption_retransmits_unacked() {
    let (connector, mut servers) = MockConnector::new();
    let server = tokio::spawn(async move {
        let mut peer = Peer::new(servers.recv().await.unwrap());
        peer.accept_stream().await;
        peer.send(FEATURES_AUTH).await;
        peer.expect("auth", ns::SASL).await;
        peer.send("<success xmlns='urn:ietf:params:xml:ns:xmpp-sasl'/>")
            .await;
        peer.accept_stream().await;
        peer.send(FEATURES_BIND_SM).await;
        let resume = peer.expect("resume", ns::SM).await;
        assert_eq!(resume.attr("previd"), Some("sm-1"));
        assert_eq!(resume.attr("h"), Some("1"));
        peer.send("<resumed xmlns='urn:xmpp:sm:3' previd='sm-1' h='1'/>")
            .await;
        let retransmitted = peer.expect("message", ns::JABBER_CLIENT).await;
        assert_eq!(retransmitted.attr("id"), Some("m2"));
    });

    let mut prior = Some(resumable_state());
    let negotiated = negotiate(
        &connector,
        &SaslAuthenticator::new("juliet", "r0m30"),
        &config(),
        &mut prior,
        |_, _, _| (),
    )
    .await
    .unwrap();
    server.await.unwrap();
    assert!(negotiated.resumed);
    assert!(prior.is_none());
    let acked: Vec<_> = negotiated.acked.iter().map(|s| s.id.as_deref()).collect();
    assert_eq!(acked, [Some("m1")]);
    assert_eq!(negotiated.bound_jid, None);
    let sm = negotiated.sm.unwrap();
    assert_eq!(sm.unacked(), 1);
    assert_eq!(sm.inbound_ctr(), 1);
}

#[tokio::test]
async fn failed_resumption_binds_afresh() {
    let (connector, mut servers) = MockConnector::new();
    tokio::spawn(async move {
        let mut peer = Peer::new(servers.recv().await.unwrap());
        peer.accept_stream().await;
        peer.send(FEATURES_AUTH).await;
        peer.expect("auth", ns::SASL).await;
        peer.send("<success xmlns='urn:ietf:params:xml:ns:xmpp-sasl'/>")
            .await;
        peer.accept_stream().await;
        peer.send(FEATURES_BIND_SM).await;
        peer.expect("resume", ns::SM).await;
        peer.send(
            "<failed xmlns='urn:xmpp:sm:3'><item-not-found xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/></failed>",
        )
        .await;
        peer.bind().await;
        peer.expect("enable", ns::SM).await;
        peer.send("<enabled xmlns='urn:xmpp:sm:3' id='sm-2' resume='true'/>")
            .await;
        peer
    });

    let mut states = Vec::new();
    let mut prior = Some(resumable_state());
    let negotiated = negotiate(
        &connector,
        &SaslAuthenticator::new("juliet", "r0m30"),
        &config(),
        &mut prior,
        |state, _, _| states.push(state),
    )
    .await
    .unwrap();
    assert!(!negotiated.resumed);
    assert!(prior.is_none());
    assert!(negotiated.bound_jid.is_some());
    assert_eq!(negotiated.sm.unwrap().resume_info(), Some(("sm-2", 0)));
    assert_eq!(
        &states[states.len() - 3..],
        &[
            NegotiationState::Resuming,
            NegotiationState::Binding,
            NegotiationState::Established
        ]
    );
}
