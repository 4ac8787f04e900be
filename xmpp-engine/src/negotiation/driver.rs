// Copyright (c) 2019 Emmanuel Gil Peyrot <linkmauve@linkmauve.fr>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use core::time::Duration;
use std::sync::Arc;

use jid::Jid;
use minidom::Element;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::auth::{self, Authenticator};
use crate::config::SessionConfig;
use crate::connect::Connector;
use crate::element::{element_to_bytes, StreamHeader, StreamItem, XmlFrames};
use crate::error::{AuthError, Error, ProtocolError, StreamErrorInfo};
use crate::ns;
use crate::stanza::Stanza;
use crate::stream_management::{self, QueueEntry, SmState};

use super::{Features, NegotiationState, Negotiator, SessionFlags, Step};

const BIND_REQ_ID: &str = "resource-bind";
const SESSION_REQ_ID: &str = "session-start";

/// Outcome of a successful negotiation.
pub(crate) struct Negotiated<S> {
    pub(crate) stream: S,

    /// Framing state, possibly holding bytes which arrived right after the
    /// last negotiation element.
    pub(crate) frames: XmlFrames,
    pub(crate) flags: SessionFlags,

    /// Freshly bound JID; `None` if the stream was resumed.
    pub(crate) bound_jid: Option<Jid>,
    pub(crate) sm: Option<SmState>,
    pub(crate) resumed: bool,

    /// Stanzas the peer acknowledged in `<resumed/>`.
    pub(crate) acked: Vec<Arc<Stanza>>,

    /// Stanzas which arrived while binding or enabling stream management.
    /// They are not counted by stream management.
    pub(crate) early: Vec<Element>,
}

struct Io<S> {
    stream: S,
    frames: XmlFrames,
    timeout: Duration,
}

fn unexpected(elem: &Element) -> Error {
    ProtocolError::UnexpectedElement {
        name: elem.name().to_owned(),
        ns: elem.ns(),
    }
    .into()
}

fn is_stanza(elem: &Element) -> bool {
    elem.ns() == ns::JABBER_CLIENT && matches!(elem.name(), "iq" | "message" | "presence")
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> Io<S> {
    async fn send_bytes(&mut self, bytes: &[u8]) -> Result<(), Error> {
        log::trace!("SEND {}", String::from_utf8_lossy(bytes));
        self.stream.write_all(bytes).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn send_element(&mut self, elem: &Element) -> Result<(), Error> {
        self.send_bytes(&element_to_bytes(elem)).await
    }

    async fn read_item(&mut self) -> Result<StreamItem, Error> {
        match tokio::time::timeout(self.timeout, self.frames.read_item(&mut self.stream)).await {
            Ok(result) => result,
            Err(_) => Err(ProtocolError::Timeout.into()),
        }
    }

    /// Send our stream header and wait for the peer's.
    async fn open(&mut self, domain: &str) -> Result<(), Error> {
        self.frames.reset();
        let ours = StreamHeader {
            to: Some(domain.to_owned()),
            version: Some(String::from("1.0")),
            ..StreamHeader::default()
        };
        self.send_bytes(&ours.to_bytes()?).await?;
        loop {
            match self.read_item().await? {
                StreamItem::Opened(header) => {
                    if header.version.as_deref() != Some("1.0") {
                        return Err(ProtocolError::UnsupportedVersion(header.version).into());
                    }
                    let Some(id) = header.id else {
                        return Err(ProtocolError::NoStreamId.into());
                    };
                    log::debug!("Peer opened stream {}", id);
                    return Ok(());
                }
                StreamItem::Whitespace => (),
                StreamItem::Element(elem) => return Err(unexpected(&elem)),
                StreamItem::Closed => return Err(ProtocolError::UnexpectedStreamEnd.into()),
            }
        }
    }

    /// Next top-level element. A `<stream:error/>` fails the negotiation.
    async fn next_element(&mut self) -> Result<Element, Error> {
        loop {
            match self.read_item().await? {
                StreamItem::Element(elem) if elem.is("error", ns::STREAM) => {
                    let info = StreamErrorInfo::from_element(&elem);
                    log::debug!("Received stream:error during negotiation: {}", info);
                    return Err(info.into());
                }
                StreamItem::Element(elem) => return Ok(elem),
                StreamItem::Whitespace => (),
                StreamItem::Opened(_) => return Err(ProtocolError::InvalidStreamStart.into()),
                StreamItem::Closed => return Err(ProtocolError::UnexpectedStreamEnd.into()),
            }
        }
    }

    /// Wait for the IQ with `id`, setting aside other stanzas.
    async fn iq_reply(&mut self, id: &str, early: &mut Vec<Element>) -> Result<Element, Error> {
        loop {
            let elem = self.next_element().await?;
            if elem.is("iq", ns::JABBER_CLIENT) && elem.attr("id") == Some(id) {
                return Ok(elem);
            }
            if !is_stanza(&elem) {
                return Err(unexpected(&elem));
            }
            log::debug!("Received stanza before response to {}, keeping it for later.", id);
            early.push(elem);
        }
    }
}

fn error_condition(reply: &Element) -> String {
    Stanza::try_from(reply.clone())
        .ok()
        .and_then(|stanza| stanza.error)
        .map(|error| error.condition)
        .unwrap_or_else(|| String::from("undefined-condition"))
}

async fn authenticate<S: AsyncRead + AsyncWrite + Unpin + Send>(
    io: &mut Io<S>,
    authenticator: &dyn Authenticator,
    mechanisms: &[String],
) -> Result<(), Error> {
    let mut exchange = authenticator.select(mechanisms)?;
    let initial = exchange.initial();
    io.send_element(&auth::auth_element(exchange.mechanism(), &initial))
        .await?;

    loop {
        let elem = io.next_element().await?;
        if elem.is("challenge", ns::SASL) {
            let challenge = auth::decode_payload(&elem.text())?;
            let response = exchange.respond(&challenge)?;
            io.send_element(&auth::response_element(&response)).await?;
        } else if elem.is("success", ns::SASL) {
            let data = auth::decode_payload(&elem.text())?;
            exchange.success(&data)?;
            log::debug!("authenticated with {}", exchange.mechanism());
            return Ok(());
        } else if elem.is("failure", ns::SASL) {
            return Err(AuthError::Fail(auth::failure_condition(&elem)).into());
        } else {
            return Err(AuthError::Unexpected(elem.name().to_owned()).into());
        }
    }
}

async fn bind<S: AsyncRead + AsyncWrite + Unpin + Send>(
    io: &mut Io<S>,
    jid: &Jid,
    early: &mut Vec<Element>,
) -> Result<Jid, Error> {
    let mut query = Element::builder("bind", ns::BIND);
    if let Some(resource) = jid.resource() {
        query = query.append(
            Element::builder("resource", ns::BIND)
                .append(resource.as_str().to_owned())
                .build(),
        );
    }
    let request = Stanza::iq_set(query.build()).with_id(BIND_REQ_ID);
    io.send_bytes(&request.to_bytes()).await?;

    let reply = io.iq_reply(BIND_REQ_ID, early).await?;
    match reply.attr("type") {
        Some("result") => {
            let bound = reply
                .get_child("bind", ns::BIND)
                .and_then(|bind| bind.get_child("jid", ns::BIND))
                .map(|jid| jid.text())
                .ok_or(ProtocolError::InvalidBindResponse)?;
            Jid::new(bound.trim()).map_err(|_| ProtocolError::InvalidBindResponse.into())
        }
        Some("error") => Err(ProtocolError::BindFailed(error_condition(&reply)).into()),
        _ => Err(ProtocolError::InvalidBindResponse.into()),
    }
}

async fn start_session<S: AsyncRead + AsyncWrite + Unpin + Send>(
    io: &mut Io<S>,
    early: &mut Vec<Element>,
) -> Result<(), Error> {
    let request =
        Stanza::iq_set(Element::builder("session", ns::SESSION).build()).with_id(SESSION_REQ_ID);
    io.send_bytes(&request.to_bytes()).await?;

    let reply = io.iq_reply(SESSION_REQ_ID, early).await?;
    match reply.attr("type") {
        Some("result") => Ok(()),
        _ => Err(ProtocolError::SessionFailed(error_condition(&reply)).into()),
    }
}

async fn enable_sm<S: AsyncRead + AsyncWrite + Unpin + Send>(
    io: &mut Io<S>,
    early: &mut Vec<Element>,
) -> Result<Option<SmState>, Error> {
    io.send_element(&stream_management::enable_element())
        .await?;
    loop {
        let elem = io.next_element().await?;
        if elem.is("enabled", ns::SM) {
            return Ok(Some(SmState::from_enabled(&elem)));
        } else if elem.is("failed", ns::SM) {
            log::warn!("Received <sm:failed/> in response to enable request. Proceeding without stream management.");
            return Ok(None);
        } else if is_stanza(&elem) {
            // Pre-SM data. Counting it would be wrong: the counters only
            // start with <enabled/>.
            early.push(elem);
        } else {
            return Err(unexpected(&elem));
        }
    }
}

/// Try to resume the stream described by `prior`.
///
/// On success, unacknowledged stanzas have been retransmitted and the state
/// is taken out of `prior`, along with the stanzas `<resumed/>` acknowledged.
/// On `<failed/>`, `prior` is discarded and `None` returned. On I/O errors,
/// `prior` stays untouched for a later attempt.
async fn resume<S: AsyncRead + AsyncWrite + Unpin + Send>(
    io: &mut Io<S>,
    prior: &mut Option<SmState>,
    early: &mut Vec<Element>,
) -> Result<Option<(SmState, Vec<Arc<Stanza>>)>, Error> {
    let Some((previd, h)) = prior
        .as_ref()
        .and_then(|state| state.resume_info())
        .map(|(id, h)| (id.to_owned(), h))
    else {
        return Ok(None);
    };
    io.send_element(&stream_management::resume_element(&previd, h))
        .await?;

    loop {
        let elem = io.next_element().await?;
        if elem.is("resumed", ns::SM) {
            let h = stream_management::parse_h(&elem).ok_or_else(|| unexpected(&elem))?;
            let Some(state) = prior.as_mut() else {
                return Ok(None);
            };
            let (acked, retransmit) = state.resume(h)?;
            let retransmit: Vec<QueueEntry> = retransmit.collect();
            log::debug!(
                "Resumed stream {}, retransmitting {} stanzas.",
                previd,
                retransmit.len()
            );
            for entry in retransmit.iter() {
                state.enqueue(entry.clone());
            }
            for entry in retransmit.iter() {
                io.send_bytes(&entry.bytes).await?;
            }
            return Ok(prior.take().map(|state| (state, acked)));
        } else if elem.is("failed", ns::SM) {
            log::debug!("Received <sm:failed/> in response to resumption request. Discarding SM data and attempting to renegotiate.");
            *prior = None;
            return Ok(None);
        } else if is_stanza(&elem) {
            early.push(elem);
        } else {
            return Err(unexpected(&elem));
        }
    }
}

/// Connect and run the handshake up to `Established`.
///
/// `on_state` observes every state transition along with the flags reached
/// so far, and the advertisement on `FeaturesReceived`. If `prior` holds a
/// resumable stream management state, resumption is attempted instead of
/// binding.
pub(crate) async fn negotiate<C, F>(
    connector: &C,
    authenticator: &dyn Authenticator,
    config: &SessionConfig,
    prior: &mut Option<SmState>,
    mut on_state: F,
) -> Result<Negotiated<C::Stream>, Error>
where
    C: Connector,
    F: FnMut(NegotiationState, SessionFlags, Option<&Features>) + Send,
{
    let domain = config.jid.domain().as_str().to_owned();
    let mut negotiator = Negotiator::new(
        config.tls,
        connector.can_upgrade_security(),
        connector.is_secure(),
        config.stream_management,
        prior.as_ref().is_some_and(SmState::is_resumable),
    );

    let stream = connector.connect(&domain).await?;
    let mut io = Io {
        stream,
        frames: XmlFrames::new(config.max_unit_size),
        timeout: config.negotiation_timeout,
    };

    let mut advance = |negotiator: &mut Negotiator,
                       state: NegotiationState,
                       features: Option<&Features>|
     -> Result<(), Error> {
        negotiator.transition(state)?;
        on_state(state, negotiator.flags(), features);
        Ok(())
    };

    let mut bound_jid = None;
    let mut sm = None;
    let mut early = Vec::new();

    'stream: loop {
        io.open(&domain).await?;
        advance(&mut negotiator, NegotiationState::EnvelopeOpened, None)?;
        let features = Features::try_from(&io.next_element().await?)?;
        log::debug!("Received stream features: {:?}", features);
        advance(
            &mut negotiator,
            NegotiationState::FeaturesReceived,
            Some(&features),
        )?;

        loop {
            match negotiator.next_step(&features)? {
                Step::StartTls => {
                    advance(&mut negotiator, NegotiationState::Encrypting, None)?;
                    io.send_element(&Element::builder("starttls", ns::TLS).build())
                        .await?;
                    let reply = io.next_element().await?;
                    if reply.is("failure", ns::TLS) {
                        return Err(ProtocolError::StartTlsFailed.into());
                    } else if !reply.is("proceed", ns::TLS) {
                        return Err(unexpected(&reply));
                    }
                    let Io {
                        stream,
                        frames,
                        timeout,
                    } = io;
                    let stream = connector.upgrade_security(stream, &domain).await?;
                    io = Io {
                        stream,
                        frames,
                        timeout,
                    };
                    negotiator.encrypted();
                    continue 'stream;
                }
                Step::Authenticate => {
                    advance(&mut negotiator, NegotiationState::Authenticating, None)?;
                    authenticate(&mut io, authenticator, &features.mechanisms).await?;
                    negotiator.authenticated();
                    continue 'stream;
                }
                Step::Resume => {
                    advance(&mut negotiator, NegotiationState::Resuming, None)?;
                    if let Some((state, acked)) = resume(&mut io, prior, &mut early).await? {
                        negotiator.resumed();
                        advance(&mut negotiator, NegotiationState::Established, None)?;
                        return Ok(Negotiated {
                            stream: io.stream,
                            frames: io.frames,
                            flags: negotiator.flags(),
                            bound_jid: None,
                            sm: Some(state),
                            resumed: true,
                            acked,
                            early,
                        });
                    }
                }
                Step::Bind => {
                    if negotiator.state() != NegotiationState::Binding {
                        advance(&mut negotiator, NegotiationState::Binding, None)?;
                    }
                    let jid = bind(&mut io, &config.jid, &mut early).await?;
                    log::debug!("Bound to {}", jid);
                    bound_jid = Some(jid);
                    negotiator.bound();
                }
                Step::StartSession => {
                    start_session(&mut io, &mut early).await?;
                    negotiator.session_started();
                }
                Step::EnableSm => {
                    sm = enable_sm(&mut io, &mut early).await?;
                    negotiator.sm_negotiated(sm.as_ref().is_some_and(SmState::is_resumable));
                }
                Step::Establish => {
                    advance(&mut negotiator, NegotiationState::Established, None)?;
                    return Ok(Negotiated {
                        stream: io.stream,
                        frames: io.frames,
                        flags: negotiator.flags(),
                        bound_jid,
                        sm,
                        resumed: false,
                        acked: Vec::new(),
                        early,
                    });
                }
            }
        }
    }
}
