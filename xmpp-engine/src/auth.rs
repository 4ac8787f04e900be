// Copyright (c) 2019 Emmanuel Gil Peyrot <linkmauve@linkmauve.fr>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Authentication boundary.
//!
//! The negotiation only sequences the SASL exchange: it picks a mechanism
//! through an [`Authenticator`] and relays challenges and responses. The
//! mechanisms themselves come from the `sasl` crate.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use minidom::Element;
use sasl::client::mechanisms::{Anonymous, Plain, Scram};
use sasl::client::Mechanism;
use sasl::common::scram::{Sha1, Sha256};
use sasl::common::{ChannelBinding, Credentials};

use crate::error::{AuthError, ProtocolError};
use crate::ns;

/// One running SASL exchange.
pub trait AuthExchange: Send {
    /// Mechanism name as advertised by the server, e.g. `SCRAM-SHA-1`.
    fn mechanism(&self) -> &str;

    /// Initial response sent along with `<auth/>`.
    fn initial(&mut self) -> Vec<u8>;

    /// Answer a server challenge.
    fn respond(&mut self, challenge: &[u8]) -> Result<Vec<u8>, AuthError>;

    /// Verify the additional data sent with `<success/>`.
    fn success(&mut self, data: &[u8]) -> Result<(), AuthError>;
}

/// Chooses a mechanism from those the server offers.
pub trait Authenticator: Send + Sync + 'static {
    /// Start an exchange with one of `offered`.
    ///
    /// Fails with [`AuthError::NoMechanism`] if none is acceptable.
    fn select(&self, offered: &[String]) -> Result<Box<dyn AuthExchange>, AuthError>;
}

struct SaslExchange(Box<dyn Mechanism + Send + Sync>);

impl AuthExchange for SaslExchange {
    fn mechanism(&self) -> &str {
        self.0.name()
    }

    fn initial(&mut self) -> Vec<u8> {
        self.0.initial()
    }

    fn respond(&mut self, challenge: &[u8]) -> Result<Vec<u8>, AuthError> {
        Ok(self.0.response(challenge)?)
    }

    fn success(&mut self, data: &[u8]) -> Result<(), AuthError> {
        Ok(self.0.success(data)?)
    }
}

type MechanismCtor = fn(&Credentials) -> Result<Box<dyn Mechanism + Send + Sync>, AuthError>;

fn scram_sha256(creds: &Credentials) -> Result<Box<dyn Mechanism + Send + Sync>, AuthError> {
    Ok(Box::new(Scram::<Sha256>::from_credentials(creds.clone())?))
}

fn scram_sha1(creds: &Credentials) -> Result<Box<dyn Mechanism + Send + Sync>, AuthError> {
    Ok(Box::new(Scram::<Sha1>::from_credentials(creds.clone())?))
}

fn plain(creds: &Credentials) -> Result<Box<dyn Mechanism + Send + Sync>, AuthError> {
    Ok(Box::new(Plain::from_credentials(creds.clone())?))
}

/// Password or anonymous authentication using the `sasl` crate.
///
/// With credentials, mechanisms are tried in the order SCRAM-SHA-256,
/// SCRAM-SHA-1, PLAIN.
#[derive(Clone)]
pub struct SaslAuthenticator {
    credentials: Option<Credentials>,
}

impl core::fmt::Debug for SaslAuthenticator {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("SaslAuthenticator")
            .field("anonymous", &self.credentials.is_none())
            .finish_non_exhaustive()
    }
}

impl SaslAuthenticator {
    const MECHANISMS: [(&'static str, MechanismCtor); 3] = [
        ("SCRAM-SHA-256", scram_sha256),
        ("SCRAM-SHA-1", scram_sha1),
        ("PLAIN", plain),
    ];

    /// Authenticate with a username (the node part of the JID) and a
    /// password.
    pub fn new<U: Into<String>, P: Into<String>>(username: U, password: P) -> Self {
        let credentials = Credentials::default()
            .with_username(username)
            .with_password(password)
            .with_channel_binding(ChannelBinding::None);
        Self {
            credentials: Some(credentials),
        }
    }

    /// Authenticate anonymously.
    pub fn anonymous() -> Self {
        Self { credentials: None }
    }
}

impl Authenticator for SaslAuthenticator {
    fn select(&self, offered: &[String]) -> Result<Box<dyn AuthExchange>, AuthError> {
        let Some(ref creds) = self.credentials else {
            if offered.iter().any(|m| m == "ANONYMOUS") {
                return Ok(Box::new(SaslExchange(Box::new(Anonymous::new()))));
            }
            return Err(AuthError::NoMechanism);
        };
        for (name, ctor) in Self::MECHANISMS {
            if offered.iter().any(|m| m == name) {
                log::debug!("selected SASL mechanism {}", name);
                return Ok(Box::new(SaslExchange(ctor(creds)?)));
            }
        }
        Err(AuthError::NoMechanism)
    }
}

/// Encode a SASL payload. Empty payloads are sent as `=`.
pub(crate) fn encode_payload(data: &[u8]) -> String {
    if data.is_empty() {
        String::from("=")
    } else {
        BASE64.encode(data)
    }
}

/// Decode the text content of `<challenge/>` or `<success/>`.
pub(crate) fn decode_payload(text: &str) -> Result<Vec<u8>, ProtocolError> {
    let text = text.trim();
    if text.is_empty() || text == "=" {
        return Ok(Vec::new());
    }
    BASE64
        .decode(text)
        .map_err(|_| ProtocolError::InvalidBase64)
}

pub(crate) fn auth_element(mechanism: &str, initial: &[u8]) -> Element {
    Element::builder("auth", ns::SASL)
        .attr("mechanism", mechanism)
        .append(encode_payload(initial))
        .build()
}

pub(crate) fn response_element(data: &[u8]) -> Element {
    Element::builder("response", ns::SASL)
        .append(encode_payload(data))
        .build()
}

/// Name of the defined condition inside `<failure/>`.
pub(crate) fn failure_condition(failure: &Element) -> String {
    failure
        .children()
        .find(|c| c.ns() == ns::SASL && c.name() != "text")
        .map(|c| c.name().to_owned())
        .unwrap_or_else(|| String::from("not-authorized"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offered(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn prefers_strongest_mechanism() {
        let auth = SaslAuthenticator::new("juliet", "r0m30");
        let exchange = auth
            .select(&offered(&["PLAIN", "SCRAM-SHA-1", "SCRAM-SHA-256"]))
            .unwrap();
        assert_eq!(exchange.mechanism(), "SCRAM-SHA-256");

        let exchange = auth.select(&offered(&["PLAIN", "SCRAM-SHA-1"])).unwrap();
        assert_eq!(exchange.mechanism(), "SCRAM-SHA-1");
    }

    #[test]
    fn plain_initial_response() {
        let auth = SaslAuthenticator::new("juliet", "r0m30");
        let mut exchange = auth.select(&offered(&["PLAIN"])).unwrap();
        assert_eq!(exchange.initial(), b"\0juliet\0r0m30");
    }

    #[test]
    fn no_common_mechanism() {
        let auth = SaslAuthenticator::new("juliet", "r0m30");
        assert!(matches!(
            auth.select(&offered(&["EXTERNAL"])),
            Err(AuthError::NoMechanism)
        ));
        assert!(matches!(
            SaslAuthenticator::anonymous().select(&offered(&["PLAIN"])),
            Err(AuthError::NoMechanism)
        ));
        let exchange = SaslAuthenticator::anonymous()
            .select(&offered(&["PLAIN", "ANONYMOUS"]))
            .unwrap();
        assert_eq!(exchange.mechanism(), "ANONYMOUS");
    }

    #[test]
    fn payload_transfer_encoding() {
        assert_eq!(encode_payload(b""), "=");
        assert_eq!(encode_payload(b"abc"), "YWJj");
        assert_eq!(decode_payload("=").unwrap(), b"");
        assert_eq!(decode_payload(" YWJj\n").unwrap(), b"abc");
        assert!(decode_payload("!!").is_err());
    }

    #[test]
    fn failure_condition_name() {
        let failure: Element = "<failure xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><text>nope</text><not-authorized/></failure>"
            .parse()
            .unwrap();
        assert_eq!(failure_condition(&failure), "not-authorized");
    }
}
