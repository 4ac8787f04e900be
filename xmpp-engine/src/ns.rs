// Copyright (c) 2017-2018 Emmanuel Gil Peyrot <linkmauve@linkmauve.fr>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! XML namespaces the engine itself needs to know about.

/// RFC 6120: stanzas on a client-to-server stream
pub const JABBER_CLIENT: &str = "jabber:client";
/// RFC 6120: the stream envelope
pub const STREAM: &str = "http://etherx.jabber.org/streams";
/// RFC 6120: stream error conditions
pub const XMPP_STREAMS: &str = "urn:ietf:params:xml:ns:xmpp-streams";
/// RFC 6120: STARTTLS
pub const TLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";
/// RFC 6120: SASL
pub const SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
/// RFC 6120: resource binding
pub const BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";
/// RFC 3921: legacy session establishment
pub const SESSION: &str = "urn:ietf:params:xml:ns:xmpp-session";
/// RFC 6120: stanza error conditions
pub const XMPP_STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";
/// XEP-0198: Stream Management
pub const SM: &str = "urn:xmpp:sm:3";
/// XEP-0199: XMPP Ping
pub const PING: &str = "urn:xmpp:ping";
/// The implicitly bound `xml:` prefix
pub const XML: &str = "http://www.w3.org/XML/1998/namespace";
