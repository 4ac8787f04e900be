// Copyright (c) 2017 Emmanuel Gil Peyrot <linkmauve@linkmauve.fr>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Structured representation of top-level stanzas.
//!
//! Payloads are kept as opaque [`Element`] subtrees; the engine only looks
//! at the routing attributes and, for errors, the defined condition.

use core::fmt;
use core::str::FromStr;
use std::error::Error as StdError;

use jid::Jid;
use minidom::Element;

use crate::element::element_to_bytes;
use crate::ns;

/// The three stanza element names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StanzaKind {
    /// `<iq/>`, request/response
    Iq,
    /// `<message/>`
    Message,
    /// `<presence/>`
    Presence,
}

impl StanzaKind {
    /// Element name of this kind.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Iq => "iq",
            Self::Message => "message",
            Self::Presence => "presence",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "iq" => Some(Self::Iq),
            "message" => Some(Self::Message),
            "presence" => Some(Self::Presence),
            _ => None,
        }
    }
}

/// `type` attribute of a stanza `<error/>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorType {
    /// Retry after providing credentials
    Auth,
    /// Do not retry
    Cancel,
    /// Proceed, the condition was only a warning
    Continue,
    /// Retry after changing the data sent
    Modify,
    /// Retry after waiting
    Wait,
}

impl ErrorType {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Cancel => "cancel",
            Self::Continue => "continue",
            Self::Modify => "modify",
            Self::Wait => "wait",
        }
    }
}

impl FromStr for ErrorType {
    type Err = StanzaParseError;

    fn from_str(s: &str) -> Result<Self, StanzaParseError> {
        Ok(match s {
            "auth" => Self::Auth,
            "cancel" => Self::Cancel,
            "continue" => Self::Continue,
            "modify" => Self::Modify,
            "wait" => Self::Wait,
            _ => return Err(StanzaParseError::InvalidErrorType(s.to_owned())),
        })
    }
}

/// An error descriptor embedded in a stanza of type `error`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StanzaError {
    /// How the error should be handled
    pub error_type: ErrorType,
    /// Defined condition, e.g. `item-not-found`
    pub condition: String,
    /// Optional human readable description
    pub text: Option<String>,
    /// Entity which generated the error
    pub by: Option<String>,
}

impl StanzaError {
    /// Create a new error descriptor without text.
    pub fn new(error_type: ErrorType, condition: impl Into<String>) -> Self {
        Self {
            error_type,
            condition: condition.into(),
            text: None,
            by: None,
        }
    }

    fn from_element(elem: &Element) -> Result<Self, StanzaParseError> {
        let error_type = elem
            .attr("type")
            .ok_or(StanzaParseError::MissingErrorType)?
            .parse()?;
        let mut condition = None;
        let mut text = None;
        for child in elem.children() {
            if child.ns() != ns::XMPP_STANZAS {
                continue;
            }
            if child.name() == "text" {
                text = Some(child.text());
            } else if condition.is_none() {
                condition = Some(child.name().to_owned());
            }
        }
        Ok(Self {
            error_type,
            condition: condition.ok_or(StanzaParseError::MissingErrorCondition)?,
            text,
            by: elem.attr("by").map(ToOwned::to_owned),
        })
    }

    fn to_element(&self) -> Element {
        let mut builder = Element::builder("error", ns::JABBER_CLIENT)
            .attr("type", self.error_type.as_str())
            .attr("by", self.by.clone())
            .append(Element::builder(self.condition.as_str(), ns::XMPP_STANZAS).build());
        if let Some(ref text) = self.text {
            builder = builder.append(
                Element::builder("text", ns::XMPP_STANZAS)
                    .append(text.clone())
                    .build(),
            );
        }
        builder.build()
    }
}

/// A stanza could not be interpreted.
///
/// Only this one stanza is affected; the stream itself stays intact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StanzaParseError {
    /// Not `iq`, `message` or `presence` in the client namespace.
    NotAStanza(String),
    /// A `from` or `to` attribute is not a valid JID.
    InvalidJid(String),
    /// IQs must carry an id.
    MissingId,
    /// IQs must carry a type.
    MissingType,
    /// The IQ type is not one of get, set, result or error.
    InvalidIqType(String),
    /// Requests must carry exactly one payload.
    InvalidPayloadCount(usize),
    /// Type `error` without a usable `<error/>` child.
    MissingError,
    /// `<error/>` without type attribute.
    MissingErrorType,
    /// `<error/>` with an unknown type attribute.
    InvalidErrorType(String),
    /// `<error/>` without a defined condition.
    MissingErrorCondition,
}

impl fmt::Display for StanzaParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::NotAStanza(name) => write!(f, "<{}/> is not a stanza", name),
            Self::InvalidJid(jid) => write!(f, "invalid JID '{}'", jid),
            Self::MissingId => f.write_str("iq without id"),
            Self::MissingType => f.write_str("iq without type"),
            Self::InvalidIqType(t) => write!(f, "invalid iq type '{}'", t),
            Self::InvalidPayloadCount(n) => {
                write!(f, "iq request must have exactly one payload, found {}", n)
            }
            Self::MissingError => f.write_str("error stanza without <error/>"),
            Self::MissingErrorType => f.write_str("<error/> without type"),
            Self::InvalidErrorType(t) => write!(f, "invalid error type '{}'", t),
            Self::MissingErrorCondition => f.write_str("<error/> without defined condition"),
        }
    }
}

impl StdError for StanzaParseError {}

/// A complete top-level stanza.
#[derive(Debug, Clone, PartialEq)]
pub struct Stanza {
    /// Element name
    pub kind: StanzaKind,
    /// Correlation identifier
    pub id: Option<String>,
    /// Sender
    pub from: Option<Jid>,
    /// Recipient
    pub to: Option<Jid>,
    /// Raw `type` attribute
    pub type_: Option<String>,
    /// `xml:lang` attribute
    pub lang: Option<String>,
    /// Child elements, except for the error descriptor
    pub payloads: Vec<Element>,
    /// Error descriptor for stanzas of type `error`
    pub error: Option<StanzaError>,
}

fn parse_jid(value: Option<&str>) -> Result<Option<Jid>, StanzaParseError> {
    value
        .map(|v| Jid::new(v).map_err(|_| StanzaParseError::InvalidJid(v.to_owned())))
        .transpose()
}

impl Stanza {
    fn new(kind: StanzaKind, type_: Option<&str>) -> Self {
        Self {
            kind,
            id: None,
            from: None,
            to: None,
            type_: type_.map(ToOwned::to_owned),
            lang: None,
            payloads: Vec::new(),
            error: None,
        }
    }

    /// An `<iq type='get'/>` request with a single payload.
    pub fn iq_get(payload: Element) -> Self {
        Self::new(StanzaKind::Iq, Some("get")).with_payload(payload)
    }

    /// An `<iq type='set'/>` request with a single payload.
    pub fn iq_set(payload: Element) -> Self {
        Self::new(StanzaKind::Iq, Some("set")).with_payload(payload)
    }

    /// An empty `<message/>`.
    pub fn message(type_: Option<&str>) -> Self {
        Self::new(StanzaKind::Message, type_)
    }

    /// A `<message type='chat'/>` with a body.
    pub fn chat(to: Jid, body: &str) -> Self {
        Self::message(Some("chat"))
            .with_to(to)
            .with_payload(Element::builder("body", ns::JABBER_CLIENT)
                .append(body.to_owned())
                .build())
    }

    /// An empty `<presence/>`.
    pub fn presence(type_: Option<&str>) -> Self {
        Self::new(StanzaKind::Presence, type_)
    }

    /// A `result` IQ answering `request`.
    pub fn result_for(request: &Stanza) -> Self {
        let mut result = Self::new(StanzaKind::Iq, Some("result"));
        result.id = request.id.clone();
        result.to = request.from.clone();
        result
    }

    /// An `error` reply to `request`, echoing nothing but the routing
    /// attributes.
    pub fn error_for(request: &Stanza, error: StanzaError) -> Self {
        let mut reply = Self::new(request.kind, Some("error"));
        reply.id = request.id.clone();
        reply.to = request.from.clone();
        reply.error = Some(error);
        reply
    }

    /// Set the id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set the recipient.
    pub fn with_to(mut self, to: Jid) -> Self {
        self.to = Some(to);
        self
    }

    /// Append a payload.
    pub fn with_payload(mut self, payload: Element) -> Self {
        self.payloads.push(payload);
        self
    }

    /// Whether this is an IQ of type `get` or `set`.
    pub fn is_iq_request(&self) -> bool {
        self.kind == StanzaKind::Iq && matches!(self.type_.as_deref(), Some("get" | "set"))
    }

    /// Whether this is an IQ of type `result` or `error`.
    pub fn is_iq_response(&self) -> bool {
        self.kind == StanzaKind::Iq && matches!(self.type_.as_deref(), Some("result" | "error"))
    }

    /// First payload with the given name and namespace.
    pub fn payload(&self, name: &str, namespace: &str) -> Option<&Element> {
        self.payloads.iter().find(|p| p.is(name, namespace))
    }

    /// Serialize for the wire.
    pub fn to_bytes(&self) -> Vec<u8> {
        element_to_bytes(&Element::from(self))
    }
}

impl TryFrom<Element> for Stanza {
    type Error = StanzaParseError;

    fn try_from(elem: Element) -> Result<Self, StanzaParseError> {
        let kind = match StanzaKind::from_name(elem.name()) {
            Some(kind) if elem.ns() == ns::JABBER_CLIENT => kind,
            _ => return Err(StanzaParseError::NotAStanza(elem.name().to_owned())),
        };
        let id = elem.attr("id").map(ToOwned::to_owned);
        let type_ = elem.attr("type").map(ToOwned::to_owned);
        let from = parse_jid(elem.attr("from"))?;
        let to = parse_jid(elem.attr("to"))?;
        let lang = elem.attr("xml:lang").map(ToOwned::to_owned);

        let mut error = None;
        let mut payloads = Vec::new();
        let is_error = type_.as_deref() == Some("error");
        for child in elem.children() {
            if is_error && error.is_none() && child.is("error", ns::JABBER_CLIENT) {
                error = Some(StanzaError::from_element(child)?);
            } else {
                payloads.push(child.clone());
            }
        }

        if kind == StanzaKind::Iq {
            if id.is_none() {
                return Err(StanzaParseError::MissingId);
            }
            match type_.as_deref() {
                None => return Err(StanzaParseError::MissingType),
                Some("get" | "set") if payloads.len() != 1 => {
                    return Err(StanzaParseError::InvalidPayloadCount(payloads.len()))
                }
                Some("get" | "set" | "result" | "error") => (),
                Some(other) => return Err(StanzaParseError::InvalidIqType(other.to_owned())),
            }
            if is_error && error.is_none() {
                return Err(StanzaParseError::MissingError);
            }
        }

        Ok(Self {
            kind,
            id,
            from,
            to,
            type_,
            lang,
            payloads,
            error,
        })
    }
}

impl From<&Stanza> for Element {
    fn from(stanza: &Stanza) -> Element {
        let mut builder = Element::builder(stanza.kind.name(), ns::JABBER_CLIENT)
            .attr("id", stanza.id.clone())
            .attr("from", stanza.from.as_ref().map(|j| j.to_string()))
            .attr("to", stanza.to.as_ref().map(|j| j.to_string()))
            .attr("type", stanza.type_.clone())
            .attr("xml:lang", stanza.lang.clone())
            .append_all(stanza.payloads.iter().cloned());
        if let Some(ref error) = stanza.error {
            builder = builder.append(error.to_element());
        }
        builder.build()
    }
}

impl From<Stanza> for Element {
    fn from(stanza: Stanza) -> Element {
        Element::from(&stanza)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(xml: &str) -> Result<Stanza, StanzaParseError> {
        let elem: Element = xml.parse().unwrap();
        Stanza::try_from(elem)
    }

    #[test]
    fn parses_iq_request() {
        let stanza = parse(
            "<iq xmlns='jabber:client' type='get' id='p1' from='juliet@capulet.lit/balcony' to='capulet.lit'>\
             <ping xmlns='urn:xmpp:ping'/></iq>",
        )
        .unwrap();
        assert_eq!(stanza.kind, StanzaKind::Iq);
        assert_eq!(stanza.id.as_deref(), Some("p1"));
        assert_eq!(
            stanza.from,
            Some(Jid::new("juliet@capulet.lit/balcony").unwrap())
        );
        assert!(stanza.is_iq_request());
        assert!(stanza.payload("ping", ns::PING).is_some());
    }

    #[test]
    fn parses_error_descriptor() {
        let stanza = parse(
            "<iq xmlns='jabber:client' type='error' id='x'>\
             <error type='cancel'><item-not-found xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/>\
             <text xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'>gone</text></error></iq>",
        )
        .unwrap();
        let error = stanza.error.unwrap();
        assert_eq!(error.error_type, ErrorType::Cancel);
        assert_eq!(error.condition, "item-not-found");
        assert_eq!(error.text.as_deref(), Some("gone"));
        assert!(stanza.payloads.is_empty());
    }

    #[test]
    fn rejects_invalid_stanzas() {
        assert_eq!(
            parse("<iq xmlns='jabber:client' type='get'><q xmlns='x'/></iq>"),
            Err(StanzaParseError::MissingId)
        );
        assert_eq!(
            parse("<iq xmlns='jabber:client' type='fetch' id='1'/>"),
            Err(StanzaParseError::InvalidIqType("fetch".to_owned()))
        );
        assert_eq!(
            parse("<iq xmlns='jabber:client' type='set' id='1'/>"),
            Err(StanzaParseError::InvalidPayloadCount(0))
        );
        assert_eq!(
            parse("<message xmlns='jabber:client' to='@@'/>"),
            Err(StanzaParseError::InvalidJid("@@".to_owned()))
        );
        assert_eq!(
            parse("<enabled xmlns='urn:xmpp:sm:3'/>"),
            Err(StanzaParseError::NotAStanza("enabled".to_owned()))
        );
    }

    #[test]
    fn message_without_id_is_fine() {
        let stanza = parse("<message xmlns='jabber:client' type='chat'><body>hi</body></message>")
            .unwrap();
        assert_eq!(stanza.kind, StanzaKind::Message);
        assert_eq!(stanza.id, None);
        assert_eq!(stanza.payloads.len(), 1);
    }

    #[test]
    fn error_reply_serializes() {
        let request = parse(
            "<iq xmlns='jabber:client' type='set' id='q1' from='a@b/c'><q xmlns='urn:example'/></iq>",
        )
        .unwrap();
        let reply = Stanza::error_for(
            &request,
            StanzaError::new(ErrorType::Cancel, "service-unavailable"),
        );
        let elem = Element::from(&reply);
        let reparsed = Stanza::try_from(elem).unwrap();
        assert_eq!(reparsed.id.as_deref(), Some("q1"));
        assert_eq!(reparsed.to, Some(Jid::new("a@b/c").unwrap()));
        assert_eq!(reparsed.error.unwrap().condition, "service-unavailable");
    }
}
