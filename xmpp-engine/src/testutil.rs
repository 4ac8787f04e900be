// Copyright (c) 2024 Jonas Schäfer <jonas@zombofant.net>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! In-memory transport and a scripted server for tests.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use minidom::Element;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;

use crate::connect::Connector;
use crate::element::{StreamItem, XmlFrames};
use crate::error::{CollaboratorFailure, Error};

/// Connector handing out one end of a duplex pipe per connection; the
/// other ends arrive on the receiver returned by [`MockConnector::new`].
#[derive(Clone)]
pub(crate) struct MockConnector {
    servers: mpsc::UnboundedSender<DuplexStream>,
    refuse: Arc<AtomicUsize>,
    pub(crate) upgrade: bool,
}

impl MockConnector {
    pub(crate) fn new() -> (Self, mpsc::UnboundedReceiver<DuplexStream>) {
        let (servers, rx) = mpsc::unbounded_channel();
        (
            Self {
                servers,
                refuse: Arc::new(AtomicUsize::new(0)),
                upgrade: false,
            },
            rx,
        )
    }

    /// Refuse the next `n` connection attempts.
    pub(crate) fn refuse(&self, n: usize) {
        self.refuse.store(n, Ordering::SeqCst);
    }
}

impl Connector for MockConnector {
    type Stream = DuplexStream;

    async fn connect(&self, _domain: &str) -> Result<DuplexStream, Error> {
        let refused = self
            .refuse
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(CollaboratorFailure::Connect(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "refused",
            ))
            .into());
        }
        let (client, server) = tokio::io::duplex(65536);
        self.servers
            .send(server)
            .map_err(|_| CollaboratorFailure::Connect(io::ErrorKind::NotConnected.into()))?;
        Ok(client)
    }

    fn can_upgrade_security(&self) -> bool {
        self.upgrade
    }

    async fn upgrade_security(&self, stream: DuplexStream, _domain: &str) -> Result<DuplexStream, Error> {
        Ok(stream)
    }
}

pub(crate) const FEATURES_AUTH: &str = "<stream:features>\
    <mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><mechanism>PLAIN</mechanism></mechanisms>\
    </stream:features>";

pub(crate) const FEATURES_BIND_SM: &str = "<stream:features>\
    <bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/><sm xmlns='urn:xmpp:sm:3'/>\
    </stream:features>";

pub(crate) const FEATURES_BIND: &str = "<stream:features>\
    <bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/>\
    </stream:features>";

/// Server side of a mock connection.
pub(crate) struct Peer {
    stream: DuplexStream,
    frames: XmlFrames,
}

impl Peer {
    pub(crate) fn new(stream: DuplexStream) -> Self {
        Self {
            stream,
            frames: XmlFrames::default(),
        }
    }

    pub(crate) async fn send(&mut self, data: &str) {
        self.stream.write_all(data.as_bytes()).await.unwrap();
    }

    /// Wait for the client's stream header and answer with ours.
    pub(crate) async fn accept_stream(&mut self) {
        self.frames.reset();
        match self.frames.read_item(&mut self.stream).await.unwrap() {
            StreamItem::Opened(header) => assert_eq!(header.to.as_deref(), Some("example.org")),
            other => panic!("expected stream header, got {:?}", other),
        }
        self.send(
            "<?xml version='1.0'?><stream:stream xmlns='jabber:client' \
             xmlns:stream='http://etherx.jabber.org/streams' \
             id='s1' from='example.org' version='1.0'>",
        )
        .await;
    }

    /// Next element sent by the client.
    pub(crate) async fn recv(&mut self) -> Element {
        loop {
            match self.frames.read_item(&mut self.stream).await.unwrap() {
                StreamItem::Element(elem) => return elem,
                StreamItem::Whitespace => (),
                other => panic!("expected element, got {:?}", other),
            }
        }
    }

    /// Next item sent by the client, which may be the stream footer.
    pub(crate) async fn recv_item(&mut self) -> Result<StreamItem, Error> {
        self.frames.read_item(&mut self.stream).await
    }

    /// Next element, which must have the given name and namespace.
    pub(crate) async fn expect(&mut self, name: &str, ns: &str) -> Element {
        let elem = self.recv().await;
        assert!(
            elem.is(name, ns),
            "expected {{{}}}{}, got {:?}",
            ns,
            name,
            elem
        );
        elem
    }

    /// Run SASL PLAIN and bind, optionally enabling stream management.
    pub(crate) async fn handshake(&mut self, sm: bool) {
        self.accept_stream().await;
        self.send(FEATURES_AUTH).await;
        self.expect("auth", crate::ns::SASL).await;
        self.send("<success xmlns='urn:ietf:params:xml:ns:xmpp-sasl'/>")
            .await;
        self.accept_stream().await;
        self.send(if sm { FEATURES_BIND_SM } else { FEATURES_BIND })
            .await;
        self.bind().await;
        if sm {
            self.expect("enable", crate::ns::SM).await;
            self.send("<enabled xmlns='urn:xmpp:sm:3' id='sm-1' resume='true'/>")
                .await;
        }
    }

    /// Answer a bind request.
    pub(crate) async fn bind(&mut self) {
        let iq = self.expect("iq", crate::ns::JABBER_CLIENT).await;
        let id = iq.attr("id").unwrap().to_owned();
        self.send(&format!(
            "<iq type='result' id='{}'><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'>\
             <jid>juliet@example.org/balcony</jid></bind></iq>",
            id
        ))
        .await;
    }

    /// Drop the connection without a stream footer.
    pub(crate) fn drop_connection(self) {
        drop(self);
    }
}
