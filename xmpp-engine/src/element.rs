// Copyright (c) 2024 Jonas Schäfer <jonas@zombofant.net>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Stream framing on top of the [`Tokenizer`].
//!
//! The tokenizer hands out flat tokens. This module folds everything below
//! depth 1 into [`minidom::Element`] subtrees, so that negotiation and the
//! router only ever see complete top-level elements.

use std::io;

use minidom::Element;
use rxml::writer::{Encoder, Item, TrackNamespace};
use rxml::{Namespace, NcNameStr, XmlVersion};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Error, ProtocolError};
use crate::ns;
use crate::tokenizer::{StartTag, Token, TokenKind, Tokenizer};

const READ_BUFFER_SIZE: usize = 4096;

/// Attributes of a `<stream:stream>` header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamHeader {
    /// Stream id assigned by the server.
    pub id: Option<String>,
    /// Sending entity.
    pub from: Option<String>,
    /// Receiving entity.
    pub to: Option<String>,
    /// Protocol version (`1.0` for XMPP).
    pub version: Option<String>,
    /// Default language of the stream.
    pub lang: Option<String>,
}

impl StreamHeader {
    fn from_tag(tag: &StartTag) -> Self {
        let get = |name| tag.attr(name).map(ToOwned::to_owned);
        Self {
            id: get("id"),
            from: get("from"),
            to: get("to"),
            version: get("version"),
            lang: get("xml:lang"),
        }
    }

    /// Serialize the opening of a client-to-server stream.
    pub(crate) fn to_bytes(&self) -> io::Result<Vec<u8>> {
        let mut enc = Encoder::new();
        let tracker = enc.ns_tracker_mut();
        tracker.declare_fixed(None, Namespace::from(ns::JABBER_CLIENT));
        tracker.declare_fixed(
            Some(NcNameStr::from_str("stream").map_err(invalid_input)?),
            Namespace::from(ns::STREAM),
        );

        let mut out = Vec::new();
        enc.encode(Item::XmlDeclaration(XmlVersion::V1_0), &mut out)
            .map_err(invalid_input)?;
        enc.encode(
            Item::ElementHeadStart(
                &Namespace::from(ns::STREAM),
                NcNameStr::from_str("stream").map_err(invalid_input)?,
            ),
            &mut out,
        )
        .map_err(invalid_input)?;
        let none = Namespace::none();
        let xml = Namespace::xml();
        for (namespace, name, value) in [
            (none, "to", &self.to),
            (none, "from", &self.from),
            (none, "id", &self.id),
            (none, "version", &self.version),
            (xml, "lang", &self.lang),
        ] {
            if let Some(value) = value {
                let name = NcNameStr::from_str(name).map_err(invalid_input)?;
                enc.encode(Item::Attribute(namespace, name, value), &mut out)
                    .map_err(invalid_input)?;
            }
        }
        enc.encode(Item::ElementHeadEnd, &mut out).map_err(invalid_input)?;
        Ok(out)
    }
}

fn invalid_input<E: std::error::Error + Send + Sync + 'static>(e: E) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, e)
}

/// The stream footer.
pub(crate) const STREAM_FOOTER: &[u8] = b"</stream:stream>";

/// One framing-level event on the stream.
#[derive(Debug)]
pub enum StreamItem {
    /// The peer opened (or re-opened) the stream envelope.
    Opened(StreamHeader),

    /// A complete top-level element (stanza or nonza).
    Element(Element),

    /// Whitespace between top-level elements, used as keepalive by some
    /// peers.
    Whitespace,

    /// The peer closed the stream envelope.
    Closed,
}

/// Assembles depth-1 subtrees from tokens.
#[derive(Debug, Default)]
pub(crate) struct ElementAssembler {
    stack: Vec<Element>,
}

impl ElementAssembler {
    pub(crate) fn reset(&mut self) {
        self.stack.clear();
    }

    /// Feed one token, returning a stream item when one becomes complete.
    pub(crate) fn process(&mut self, token: Token) -> Result<Option<StreamItem>, Error> {
        match token.kind {
            TokenKind::DocumentStart | TokenKind::DocumentEnd => Ok(None),
            TokenKind::ElementStart(tag) if token.depth == 0 => {
                if !tag.is("stream", ns::STREAM) {
                    return Err(ProtocolError::InvalidStreamStart.into());
                }
                Ok(Some(StreamItem::Opened(StreamHeader::from_tag(&tag))))
            }
            TokenKind::ElementStart(tag) => {
                let mut builder =
                    Element::builder(tag.name.clone(), tag.namespace.unwrap_or_default());
                for (name, value) in tag.attributes {
                    if name.starts_with('{') {
                        log::debug!("dropping namespaced attribute {} on <{}>", name, tag.name);
                        continue;
                    }
                    builder = builder.attr(name, value);
                }
                self.stack.push(builder.build());
                Ok(None)
            }
            TokenKind::ElementEnd { .. } if token.depth == 0 => Ok(Some(StreamItem::Closed)),
            TokenKind::ElementEnd { .. } => {
                // The tokenizer guarantees balanced start and end tokens.
                let Some(elem) = self.stack.pop() else {
                    return Ok(None);
                };
                match self.stack.last_mut() {
                    Some(parent) => {
                        parent.append_child(elem);
                        Ok(None)
                    }
                    None => Ok(Some(StreamItem::Element(elem))),
                }
            }
            TokenKind::Text(text) => match self.stack.last_mut() {
                Some(parent) => {
                    parent.append_text_node(text);
                    Ok(None)
                }
                None if text.trim().is_empty() => Ok(Some(StreamItem::Whitespace)),
                None => Err(ProtocolError::TextAtStreamLevel.into()),
            },
        }
    }
}

/// Tokenizer plus assembler: turns raw bytes into [`StreamItem`]s.
#[derive(Debug, Default)]
pub(crate) struct XmlFrames {
    tokenizer: Tokenizer,
    assembler: ElementAssembler,
}

impl XmlFrames {
    pub(crate) fn new(max_unit_size: usize) -> Self {
        Self {
            tokenizer: Tokenizer::with_max_unit_size(max_unit_size),
            assembler: ElementAssembler::default(),
        }
    }

    /// Drop all framing state, for a stream restart.
    pub(crate) fn reset(&mut self) {
        self.tokenizer.reset();
        self.assembler.reset();
    }

    pub(crate) fn push(&mut self, chunk: &[u8]) {
        self.tokenizer.push(chunk);
    }

    /// Return the next complete item from already buffered input.
    pub(crate) fn next_item(&mut self) -> Result<Option<StreamItem>, Error> {
        while let Some(token) = self.tokenizer.next_token()? {
            if let Some(item) = self.assembler.process(token)? {
                return Ok(Some(item));
            }
        }
        Ok(None)
    }

    /// Read from `io` until a complete item is available.
    ///
    /// This is cancellation safe: bytes which have been read are kept in the
    /// tokenizer buffer.
    pub(crate) async fn read_item<R: AsyncRead + Unpin + ?Sized>(
        &mut self,
        io: &mut R,
    ) -> Result<StreamItem, Error> {
        let mut buf = [0u8; READ_BUFFER_SIZE];
        loop {
            if let Some(item) = self.next_item()? {
                log::trace!("RECV {:?}", item);
                return Ok(item);
            }
            let n = io.read(&mut buf).await?;
            if n == 0 {
                return Err(Error::Disconnected);
            }
            self.push(&buf[..n]);
        }
    }
}

/// Serialize an element for the wire.
pub(crate) fn element_to_bytes(elem: &Element) -> Vec<u8> {
    let mut out = Vec::new();
    if let Err(e) = elem.write_to(&mut out) {
        // only I/O errors are possible, and writing to a Vec does not fail
        log::error!("failed to serialize element: {}", e);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn items(input: &[u8]) -> Vec<StreamItem> {
        let mut frames = XmlFrames::default();
        frames.push(input);
        let mut result = Vec::new();
        while let Some(item) = frames.next_item().unwrap() {
            result.push(item);
        }
        result
    }

    #[test]
    fn assembles_top_level_elements() {
        let got = items(
            b"<?xml version='1.0'?><stream:stream xmlns='jabber:client' \
              xmlns:stream='http://etherx.jabber.org/streams' id='s1' version='1.0' xml:lang='en'>\
              <message from='a@b/c'><body>hi <b>there</b></body></message> \
              <stream:features><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/></stream:features>\
              </stream:stream>",
        );
        assert_eq!(got.len(), 5);
        match &got[0] {
            StreamItem::Opened(header) => {
                assert_eq!(header.id.as_deref(), Some("s1"));
                assert_eq!(header.version.as_deref(), Some("1.0"));
                assert_eq!(header.lang.as_deref(), Some("en"));
            }
            other => panic!("unexpected item {:?}", other),
        }
        match &got[1] {
            StreamItem::Element(message) => {
                assert!(message.is("message", ns::JABBER_CLIENT));
                assert_eq!(message.attr("from"), Some("a@b/c"));
                let body = message.get_child("body", ns::JABBER_CLIENT).unwrap();
                assert_eq!(body.text(), "hi ");
                assert_eq!(body.children().count(), 1);
            }
            other => panic!("unexpected item {:?}", other),
        }
        assert!(matches!(got[2], StreamItem::Whitespace));
        match &got[3] {
            StreamItem::Element(features) => {
                assert!(features.is("features", ns::STREAM));
                assert!(features.has_child("bind", ns::BIND));
            }
            other => panic!("unexpected item {:?}", other),
        }
        assert!(matches!(got[4], StreamItem::Closed));
    }

    #[test]
    fn wrong_root_is_rejected() {
        let mut frames = XmlFrames::default();
        frames.push(b"<html>");
        assert!(matches!(
            frames.next_item(),
            Err(Error::Protocol(ProtocolError::InvalidStreamStart))
        ));
    }

    #[test]
    fn header_serialization_escapes() {
        let header = StreamHeader {
            to: Some("exa\"m<ple&.org".to_owned()),
            version: Some("1.0".to_owned()),
            lang: Some("en".to_owned()),
            ..StreamHeader::default()
        };
        let bytes = header.to_bytes().unwrap();

        // whatever we send must come back identically from our own parser
        let mut frames = XmlFrames::default();
        frames.push(&bytes);
        match frames.next_item().unwrap() {
            Some(StreamItem::Opened(parsed)) => assert_eq!(parsed, header),
            other => panic!("unexpected item {:?}", other),
        }
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("<?xml version='1.0'"));
        assert!(text.contains("<stream:stream "));
        assert!(text.contains("xmlns=\"jabber:client\""));
        assert!(text.contains("xmlns:stream=\"http://etherx.jabber.org/streams\""));
        assert!(!text.contains("exa\"m<ple&"));
        assert!(text.ends_with('>'));
    }

    #[test]
    fn foreign_namespaced_attributes_are_dropped() {
        let got = items(
            b"<stream:stream xmlns='jabber:client' \
              xmlns:stream='http://etherx.jabber.org/streams' xmlns:e='urn:example'>\
              <message e:hint='x' id='m1'/>",
        );
        match &got[1] {
            StreamItem::Element(message) => {
                assert_eq!(message.attr("id"), Some("m1"));
                assert_eq!(message.attrs().count(), 1);
            }
            other => panic!("unexpected item {:?}", other),
        }
    }

    #[tokio::test]
    async fn reads_across_chunks() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let writer = tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            for chunk in [
                &b"<stream:stream xmlns:stream='http://etherx.jabber.org/str"[..],
                b"eams' xmlns='jabber:client'><iq ty",
                b"pe='get' id='1'><ping xmlns='urn:xmpp:ping'/></iq>",
            ] {
                server.write_all(chunk).await.unwrap();
            }
            server
        });
        let mut frames = XmlFrames::default();
        assert!(matches!(
            frames.read_item(&mut client).await.unwrap(),
            StreamItem::Opened(_)
        ));
        match frames.read_item(&mut client).await.unwrap() {
            StreamItem::Element(iq) => assert!(iq.has_child("ping", ns::PING)),
            other => panic!("unexpected item {:?}", other),
        }
        drop(writer.await.unwrap());
        assert!(matches!(
            frames.read_item(&mut client).await,
            Err(Error::Disconnected)
        ));
    }
}
