// Copyright (c) 2019 Emmanuel Gil Peyrot <linkmauve@linkmauve.fr>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use sasl::client::MechanismError as SaslMechanismError;
use std::error::Error as StdError;
use std::fmt;
use std::io::Error as IoError;

use crate::negotiation::NegotiationState;
use crate::router::CollectorError;
use crate::stanza::StanzaParseError;
use crate::stream_management::SmError;
pub use crate::tokenizer::{TokenizeError, TokenizeErrorKind};

/// Top-level error type
#[derive(Debug)]
pub enum Error {
    /// I/O error on an established transport
    Io(IoError),
    /// Error parsing Jabber-Id
    JidParse(jid::Error),
    /// Malformed markup on the wire. The byte framing is lost.
    Tokenize(TokenizeError),
    /// Protocol-level error
    Protocol(ProtocolError),
    /// A mandatory negotiation step would have been skipped
    PolicyViolation(PolicyViolation),
    /// The transport, TLS or authentication collaborator failed
    Collaborator(CollaboratorFailure),
    /// The peer closed the stream with a `<stream:error/>`
    Stream(StreamErrorInfo),
    /// A single stanza could not be parsed and the session is configured to
    /// treat that as fatal
    UnparsableStanza(StanzaParseError),
    /// Stream management bookkeeping went out of sync with the peer
    StreamManagement(SmError),
    /// A collector did not complete successfully
    Collector(CollectorError),
    /// The session is currently not connected
    NotConnected,
    /// Connection closed
    Disconnected,
    /// The session has been closed and will not reconnect
    SessionClosed,
}

impl Error {
    /// Whether this error tears down the current stream.
    ///
    /// Only unparsable stanzas (when skipped) and collector failures are
    /// local to a single caller.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Error::Collector(_) | Error::NotConnected | Error::JidParse(_)
        )
    }

    /// Whether the reconnection supervisor may try again after this error.
    ///
    /// A `conflict` stream error means that another session took over our
    /// resource; reconnecting would just kick that one out again.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Stream(info) => info.condition != "conflict",
            Error::SessionClosed => false,
            Error::Collaborator(CollaboratorFailure::Auth(AuthError::Fail(_))) => false,
            Error::Collaborator(CollaboratorFailure::Auth(AuthError::NoMechanism)) => false,
            Error::PolicyViolation(_) => false,
            _ => true,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Io(e) => write!(fmt, "IO error: {}", e),
            Error::JidParse(e) => write!(fmt, "jid parse error: {}", e),
            Error::Tokenize(e) => write!(fmt, "tokenizer error: {}", e),
            Error::Protocol(e) => write!(fmt, "protocol error: {}", e),
            Error::PolicyViolation(e) => write!(fmt, "policy violation: {}", e),
            Error::Collaborator(e) => write!(fmt, "{}", e),
            Error::Stream(e) => write!(fmt, "stream error: {}", e),
            Error::UnparsableStanza(e) => write!(fmt, "unparsable stanza: {}", e),
            Error::StreamManagement(e) => write!(fmt, "stream management error: {}", e),
            Error::Collector(e) => write!(fmt, "{}", e),
            Error::NotConnected => write!(fmt, "not connected"),
            Error::Disconnected => write!(fmt, "disconnected"),
            Error::SessionClosed => write!(fmt, "session closed"),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::JidParse(e) => Some(e),
            Error::Tokenize(e) => Some(e),
            Error::Protocol(e) => Some(e),
            Error::Collaborator(e) => Some(e),
            Error::UnparsableStanza(e) => Some(e),
            Error::StreamManagement(e) => Some(e),
            Error::Collector(e) => Some(e),
            _ => None,
        }
    }
}

impl From<IoError> for Error {
    fn from(e: IoError) -> Self {
        Error::Io(e)
    }
}

impl From<jid::Error> for Error {
    fn from(e: jid::Error) -> Self {
        Error::JidParse(e)
    }
}

impl From<TokenizeError> for Error {
    fn from(e: TokenizeError) -> Self {
        Error::Tokenize(e)
    }
}

impl From<ProtocolError> for Error {
    fn from(e: ProtocolError) -> Self {
        Error::Protocol(e)
    }
}

impl From<PolicyViolation> for Error {
    fn from(e: PolicyViolation) -> Self {
        Error::PolicyViolation(e)
    }
}

impl From<CollaboratorFailure> for Error {
    fn from(e: CollaboratorFailure) -> Self {
        Error::Collaborator(e)
    }
}

impl From<AuthError> for Error {
    fn from(e: AuthError) -> Self {
        Error::Collaborator(CollaboratorFailure::Auth(e))
    }
}

impl From<StreamErrorInfo> for Error {
    fn from(e: StreamErrorInfo) -> Self {
        Error::Stream(e)
    }
}

impl From<SmError> for Error {
    fn from(e: SmError) -> Self {
        Error::StreamManagement(e)
    }
}

impl From<CollectorError> for Error {
    fn from(e: CollectorError) -> Self {
        Error::Collector(e)
    }
}

/// XMPP protocol-level error
#[derive(Debug)]
pub enum ProtocolError {
    /// The root element is not `<stream:stream/>`
    InvalidStreamStart,
    /// No id attribute in <stream:stream>
    NoStreamId,
    /// The peer does not speak XMPP 1.0
    UnsupportedVersion(Option<String>),
    /// Non-whitespace text directly inside the stream envelope
    TextAtStreamLevel,
    /// An element that is not valid at this point of the negotiation
    UnexpectedElement {
        /// Local name of the element
        name: String,
        /// Namespace of the element
        ns: String,
    },
    /// The peer closed the stream during negotiation
    UnexpectedStreamEnd,
    /// No resource binding advertised after authentication
    NoBind,
    /// Invalid response to resource binding
    InvalidBindResponse,
    /// The server rejected resource binding
    BindFailed(String),
    /// The server rejected the legacy session establishment
    SessionFailed(String),
    /// Malformed SASL payload encoding
    InvalidBase64,
    /// The server refused STARTTLS with `<failure/>`
    StartTlsFailed,
    /// The server did not answer within the negotiation timeout
    Timeout,
    /// The negotiation state machine was asked for an illegal transition
    InvalidTransition {
        /// State before the transition
        from: NegotiationState,
        /// Requested state
        to: NegotiationState,
    },
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ProtocolError::InvalidStreamStart => write!(fmt, "unexpected root element"),
            ProtocolError::NoStreamId => write!(fmt, "no id attribute in <stream:stream>"),
            ProtocolError::UnsupportedVersion(v) => {
                write!(fmt, "unsupported stream version: {:?}", v)
            }
            ProtocolError::TextAtStreamLevel => write!(fmt, "text at stream level"),
            ProtocolError::UnexpectedElement { name, ns } => {
                write!(fmt, "unexpected element {{{}}}{}", ns, name)
            }
            ProtocolError::UnexpectedStreamEnd => {
                write!(fmt, "stream closed during negotiation")
            }
            ProtocolError::NoBind => write!(fmt, "server does not offer resource binding"),
            ProtocolError::InvalidBindResponse => {
                write!(fmt, "invalid response to resource binding")
            }
            ProtocolError::BindFailed(c) => write!(fmt, "resource binding failed: {}", c),
            ProtocolError::SessionFailed(c) => write!(fmt, "session establishment failed: {}", c),
            ProtocolError::InvalidBase64 => write!(fmt, "invalid base64 in SASL payload"),
            ProtocolError::StartTlsFailed => write!(fmt, "server refused STARTTLS"),
            ProtocolError::Timeout => write!(fmt, "timed out waiting for the server"),
            ProtocolError::InvalidTransition { from, to } => {
                write!(fmt, "invalid negotiation transition {:?} -> {:?}", from, to)
            }
        }
    }
}

impl StdError for ProtocolError {}

/// A mandatory negotiation step was about to be skipped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyViolation {
    /// Encryption is mandatory (by the peer or by configuration) but cannot
    /// be performed
    EncryptionRequired,
    /// Encryption was offered as mandatory but is disabled by configuration
    EncryptionDisabled,
    /// No authentication took place before establishing
    AuthenticationRequired,
}

impl fmt::Display for PolicyViolation {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PolicyViolation::EncryptionRequired => {
                write!(fmt, "encryption is mandatory but was not negotiated")
            }
            PolicyViolation::EncryptionDisabled => {
                write!(fmt, "peer requires encryption but it is disabled locally")
            }
            PolicyViolation::AuthenticationRequired => {
                write!(fmt, "authentication is mandatory but was not performed")
            }
        }
    }
}

impl StdError for PolicyViolation {}

/// Failure of one of the engine's collaborators
#[derive(Debug)]
pub enum CollaboratorFailure {
    /// The transport could not be connected
    Connect(IoError),
    /// The security upgrade was refused or failed
    Tls(IoError),
    /// Authentication failed
    Auth(AuthError),
}

impl fmt::Display for CollaboratorFailure {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CollaboratorFailure::Connect(e) => write!(fmt, "connection error: {}", e),
            CollaboratorFailure::Tls(e) => write!(fmt, "TLS error: {}", e),
            CollaboratorFailure::Auth(e) => write!(fmt, "authentication error: {}", e),
        }
    }
}

impl StdError for CollaboratorFailure {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            CollaboratorFailure::Connect(e) | CollaboratorFailure::Tls(e) => Some(e),
            CollaboratorFailure::Auth(e) => Some(e),
        }
    }
}

/// Authentication error
#[derive(Debug)]
pub enum AuthError {
    /// No matching SASL mechanism available
    NoMechanism,
    /// Local SASL implementation error
    Sasl(SaslMechanismError),
    /// Failure from server, with the defined condition name
    Fail(String),
    /// The server sent an authentication element we did not expect
    Unexpected(String),
}

impl StdError for AuthError {}

impl fmt::Display for AuthError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AuthError::NoMechanism => write!(fmt, "no matching SASL mechanism available"),
            AuthError::Sasl(s) => write!(fmt, "local SASL implementation error: {}", s),
            AuthError::Fail(c) => write!(fmt, "failure from the server: {}", c),
            AuthError::Unexpected(name) => write!(fmt, "unexpected <{}/> from the server", name),
        }
    }
}

impl From<SaslMechanismError> for AuthError {
    fn from(e: SaslMechanismError) -> Self {
        AuthError::Sasl(e)
    }
}

/// Contents of a received `<stream:error/>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamErrorInfo {
    /// Defined condition, e.g. `conflict` or `see-other-host`
    pub condition: String,
    /// Optional human-readable text
    pub text: Option<String>,
}

impl StreamErrorInfo {
    /// Extract the condition and text from a `<stream:error/>` element.
    pub fn from_element(elem: &minidom::Element) -> Self {
        let mut condition = String::from("undefined-condition");
        let mut text = None;
        for child in elem.children() {
            if child.ns() != crate::ns::XMPP_STREAMS {
                continue;
            }
            if child.name() == "text" {
                text = Some(child.text());
            } else {
                condition = child.name().to_owned();
            }
        }
        Self { condition, text }
    }
}

impl fmt::Display for StreamErrorInfo {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self.text {
            Some(ref text) => write!(fmt, "{} ({})", self.condition, text),
            None => write!(fmt, "{}", self.condition),
        }
    }
}
