// Copyright (c) 2025 Jonas Schäfer <jonas@zombofant.net>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Predicates selecting which stanzas a collector or listener receives.
//!
//! Any `Fn(&Stanza) -> bool` is a filter. The types in this module cover the
//! common cases and can be combined with [`StanzaFilter::and`],
//! [`StanzaFilter::or`] and [`StanzaFilter::not`].
//!
//! Filters are evaluated on the inbound path and must not block.

use jid::Jid;

use crate::stanza::{Stanza, StanzaKind};

/// A predicate over stanzas.
pub trait StanzaFilter: Send + Sync + 'static {
    /// Whether `stanza` is accepted.
    fn matches(&self, stanza: &Stanza) -> bool;

    /// Accept stanzas matched by both filters.
    fn and<F: StanzaFilter>(self, other: F) -> And<Self, F>
    where
        Self: Sized,
    {
        And(self, other)
    }

    /// Accept stanzas matched by either filter.
    fn or<F: StanzaFilter>(self, other: F) -> Or<Self, F>
    where
        Self: Sized,
    {
        Or(self, other)
    }

    /// Accept stanzas rejected by this filter.
    fn not(self) -> Not<Self>
    where
        Self: Sized,
    {
        Not(self)
    }
}

impl<F> StanzaFilter for F
where
    F: Fn(&Stanza) -> bool + Send + Sync + 'static,
{
    fn matches(&self, stanza: &Stanza) -> bool {
        self(stanza)
    }
}

/// Accepts every stanza.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnyStanza;

impl StanzaFilter for AnyStanza {
    fn matches(&self, _: &Stanza) -> bool {
        true
    }
}

/// Matches the `id` attribute.
#[derive(Debug, Clone)]
pub struct IdFilter(pub String);

impl IdFilter {
    /// Match stanzas with the given id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl StanzaFilter for IdFilter {
    fn matches(&self, stanza: &Stanza) -> bool {
        stanza.id.as_deref() == Some(self.0.as_str())
    }
}

/// Matches the element name.
#[derive(Debug, Clone, Copy)]
pub struct KindFilter(pub StanzaKind);

impl StanzaFilter for KindFilter {
    fn matches(&self, stanza: &Stanza) -> bool {
        stanza.kind == self.0
    }
}

/// Matches the element name and `type` attribute.
#[derive(Debug, Clone)]
pub struct TypeFilter {
    kind: StanzaKind,
    type_: Option<String>,
}

impl TypeFilter {
    /// Match stanzas of `kind` with the given type (`None` matches a missing
    /// type attribute).
    pub fn new(kind: StanzaKind, type_: Option<&str>) -> Self {
        Self {
            kind,
            type_: type_.map(ToOwned::to_owned),
        }
    }
}

impl StanzaFilter for TypeFilter {
    fn matches(&self, stanza: &Stanza) -> bool {
        stanza.kind == self.kind && stanza.type_ == self.type_
    }
}

/// Matches the sender.
///
/// A bare JID also matches all full JIDs of the same account.
#[derive(Debug, Clone)]
pub struct FromFilter(pub Jid);

impl StanzaFilter for FromFilter {
    fn matches(&self, stanza: &Stanza) -> bool {
        let Some(ref from) = stanza.from else {
            return false;
        };
        if self.0.resource().is_some() {
            from == &self.0
        } else {
            from.node() == self.0.node() && from.domain() == self.0.domain()
        }
    }
}

/// Matches the reply to an IQ request.
///
/// The reply must carry the request id, be of type `result` or `error`, and
/// come from the entity the request was addressed to.
///
/// Requests without `to` are answered by our server on behalf of our
/// account. Once the account is known through
/// [`ReplyFilter::with_account`], such replies are accepted from the bound
/// JID, its bare JID, the server domain, or without `from`; anyone else is
/// a third party. Replies to requests addressed to the server may omit
/// `from` as well.
#[derive(Debug, Clone)]
pub struct ReplyFilter {
    id: String,
    to: Option<Jid>,
    bound: Option<Jid>,
    server: Option<Jid>,
}

impl ReplyFilter {
    /// Match replies with `id`, sent by `to`.
    ///
    /// If `to` is `None`, only replies without `from` match until
    /// [`ReplyFilter::with_account`] is used.
    pub fn new(id: impl Into<String>, to: Option<Jid>) -> Self {
        Self {
            id: id.into(),
            to,
            bound: None,
            server: None,
        }
    }

    /// Build a filter for replies to `request`.
    ///
    /// Returns `None` if the request has no id.
    pub fn for_request(request: &Stanza) -> Option<Self> {
        Some(Self::new(request.id.clone()?, request.to.clone()))
    }

    /// Also accept the senders which answer on behalf of our own account.
    pub fn with_account(mut self, bound: Option<Jid>, server: Jid) -> Self {
        self.bound = bound;
        self.server = Some(server);
        self
    }

    fn is_own_side(&self, from: &Jid) -> bool {
        if self.server.as_ref() == Some(from) {
            return true;
        }
        self.bound
            .as_ref()
            .is_some_and(|bound| bound == from || Jid::from(bound.to_bare()) == *from)
    }
}

impl StanzaFilter for ReplyFilter {
    fn matches(&self, stanza: &Stanza) -> bool {
        if !stanza.is_iq_response() || stanza.id.as_deref() != Some(self.id.as_str()) {
            return false;
        }
        match (&self.to, &stanza.from) {
            (None, None) => true,
            (None, Some(from)) => self.is_own_side(from),
            (Some(to), None) => self.server.as_ref() == Some(to),
            (Some(to), Some(from)) => to == from,
        }
    }
}

/// Both filters must match.
#[derive(Debug, Clone)]
pub struct And<A, B>(pub A, pub B);

impl<A: StanzaFilter, B: StanzaFilter> StanzaFilter for And<A, B> {
    fn matches(&self, stanza: &Stanza) -> bool {
        self.0.matches(stanza) && self.1.matches(stanza)
    }
}

/// At least one filter must match.
#[derive(Debug, Clone)]
pub struct Or<A, B>(pub A, pub B);

impl<A: StanzaFilter, B: StanzaFilter> StanzaFilter for Or<A, B> {
    fn matches(&self, stanza: &Stanza) -> bool {
        self.0.matches(stanza) || self.1.matches(stanza)
    }
}

/// Inverts a filter.
#[derive(Debug, Clone)]
pub struct Not<A>(pub A);

impl<A: StanzaFilter> StanzaFilter for Not<A> {
    fn matches(&self, stanza: &Stanza) -> bool {
        !self.0.matches(stanza)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use minidom::Element;

    fn stanza(xml: &str) -> Stanza {
        Stanza::try_from(xml.parse::<Element>().unwrap()).unwrap()
    }

    #[test]
    fn reply_filter() {
        let request = Stanza::iq_get(Element::builder("query", "urn:example").build())
            .with_id("r1")
            .with_to(Jid::new("pubsub.example.org").unwrap());
        let filter = ReplyFilter::for_request(&request).unwrap();

        assert!(filter.matches(&stanza(
            "<iq xmlns='jabber:client' type='result' id='r1' from='pubsub.example.org'/>"
        )));
        // spoofed sender
        assert!(!filter.matches(&stanza(
            "<iq xmlns='jabber:client' type='result' id='r1' from='evil.example.org'/>"
        )));
        // a request with the same id is not a reply
        assert!(!filter.matches(&stanza(
            "<iq xmlns='jabber:client' type='get' id='r1' from='pubsub.example.org'><q xmlns='x'/></iq>"
        )));
    }

    fn account_filter(to: Option<&str>) -> ReplyFilter {
        ReplyFilter::new("r1", to.map(|to| Jid::new(to).unwrap())).with_account(
            Some(Jid::new("juliet@example.org/balcony").unwrap()),
            Jid::new("example.org").unwrap(),
        )
    }

    fn reply_from(from: Option<&str>) -> Stanza {
        match from {
            Some(from) => stanza(&format!(
                "<iq xmlns='jabber:client' type='result' id='r1' from='{}'/>",
                from
            )),
            None => stanza("<iq xmlns='jabber:client' type='result' id='r1'/>"),
        }
    }

    #[test]
    fn reply_without_to_comes_from_our_side() {
        let filter = account_filter(None);
        assert!(filter.matches(&reply_from(None)));
        assert!(filter.matches(&reply_from(Some("example.org"))));
        assert!(filter.matches(&reply_from(Some("juliet@example.org"))));
        assert!(filter.matches(&reply_from(Some("juliet@example.org/balcony"))));
        // third parties cannot answer requests to our own account
        assert!(!filter.matches(&reply_from(Some("mallory@example.org/x"))));
        assert!(!filter.matches(&reply_from(Some("juliet@example.org/other"))));
        assert!(!filter.matches(&reply_from(Some("evil.example.net"))));

        // without knowing the account, only a missing sender is trusted
        let unbound = ReplyFilter::new("r1", None);
        assert!(unbound.matches(&reply_from(None)));
        assert!(!unbound.matches(&reply_from(Some("example.org"))));
    }

    #[test]
    fn server_reply_may_omit_from() {
        let filter = account_filter(Some("example.org"));
        assert!(filter.matches(&reply_from(None)));
        assert!(filter.matches(&reply_from(Some("example.org"))));
        assert!(!filter.matches(&reply_from(Some("juliet@example.org/balcony"))));

        // other addressees must answer themselves
        let filter = account_filter(Some("pubsub.example.org"));
        assert!(!filter.matches(&reply_from(None)));
        assert!(filter.matches(&reply_from(Some("pubsub.example.org"))));
    }

    #[test]
    fn from_filter_bare_matches_full() {
        let filter = FromFilter(Jid::new("romeo@montague.lit").unwrap());
        assert!(filter.matches(&stanza(
            "<message xmlns='jabber:client' from='romeo@montague.lit/orchard'/>"
        )));
        assert!(!filter.matches(&stanza(
            "<message xmlns='jabber:client' from='juliet@capulet.lit/balcony'/>"
        )));
        assert!(!filter.matches(&stanza("<message xmlns='jabber:client'/>")));
    }

    #[test]
    fn combinators() {
        let chat = TypeFilter::new(StanzaKind::Message, Some("chat"));
        let filter = chat.clone().and(IdFilter::new("m1")).or(KindFilter(StanzaKind::Presence));
        assert!(filter.matches(&stanza(
            "<message xmlns='jabber:client' type='chat' id='m1'/>"
        )));
        assert!(!filter.matches(&stanza(
            "<message xmlns='jabber:client' type='chat' id='m2'/>"
        )));
        assert!(filter.matches(&stanza("<presence xmlns='jabber:client'/>")));
        assert!(chat.not().matches(&stanza("<message xmlns='jabber:client'/>")));

        let closure = |s: &Stanza| s.payloads.is_empty();
        assert!(closure.matches(&stanza("<message xmlns='jabber:client'/>")));
    }
}
