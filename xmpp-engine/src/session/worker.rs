// Copyright (c) 2024 Jonas Schäfer <jonas@zombofant.net>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The task owning the inbound path of a session.

use std::sync::Arc;

use minidom::Element;
use tokio::io::AsyncRead;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{self, Instant};

use crate::auth::Authenticator;
use crate::config::UnparsablePolicy;
use crate::connect::Connector;
use crate::element::{element_to_bytes, StreamItem, XmlFrames, STREAM_FOOTER};
use crate::error::{Error, ProtocolError, StreamErrorInfo};
use crate::keepalive;
use crate::negotiation::{negotiate, Features, NegotiationState, Negotiated};
use crate::ns;
use crate::reconnect::{Decision, Supervisor, SupervisorState};
use crate::router::{CollectorError, ListenerHandle};
use crate::stanza::{ErrorType, Stanza, StanzaError};
use crate::stream_management::{self, SmState};

use super::{CloseReason, LifecycleEvent, Shared};

pub(super) enum Command {
    Close(oneshot::Sender<()>),
}

enum Input {
    Command(Option<Command>),
    Broken,
    Item(Result<StreamItem, Error>),
}

/// How serving an established stream ended.
enum Served {
    /// Closed on request.
    Closed,
    /// The stream broke.
    Broken(Error),
}

pub(super) struct Worker<C: Connector> {
    shared: Arc<Shared>,
    connector: C,
    authenticator: Arc<dyn Authenticator>,
    commands: mpsc::UnboundedReceiver<Command>,
    supervisor: Supervisor,

    /// Stream management state of the last stream, for resumption.
    sm: Option<SmState>,

    /// A stream was established before; collectors registered then belong
    /// to it.
    was_established: bool,

    close_waiters: Vec<oneshot::Sender<()>>,

    // Unregistered when the worker ends.
    _ping_responder: ListenerHandle,
}

fn is_stanza(elem: &Element) -> bool {
    elem.ns() == ns::JABBER_CLIENT && matches!(elem.name(), "iq" | "message" | "presence")
}

impl<C: Connector> Worker<C> {
    pub(super) fn new(
        shared: Arc<Shared>,
        connector: C,
        authenticator: Arc<dyn Authenticator>,
        commands: mpsc::UnboundedReceiver<Command>,
        ping_responder: ListenerHandle,
    ) -> Self {
        let supervisor = Supervisor::new(shared.config.reconnect);
        Self {
            shared,
            connector,
            authenticator,
            commands,
            supervisor,
            sm: None,
            was_established: false,
            close_waiters: Vec::new(),
            _ping_responder: ping_responder,
        }
    }

    fn publish_supervisor(&self) {
        self.shared.supervisor.send_replace(self.supervisor.state());
    }

    fn on_close(&mut self, command: Option<Command>) {
        match command {
            Some(Command::Close(waiter)) => self.close_waiters.push(waiter),
            None => log::debug!("All session handles dropped, closing."),
        }
    }

    pub(super) async fn run(mut self) {
        let reason = loop {
            let error = match self.connect().await {
                None => break CloseReason::Requested,
                Some(Ok(negotiated)) => match self.serve(negotiated).await {
                    Served::Closed => break CloseReason::Requested,
                    Served::Broken(error) => {
                        let error = Arc::new(error);
                        log::warn!("Stream broke: {}", error);
                        self.shared.set_state(NegotiationState::Failed);
                        self.shared.emit(LifecycleEvent::Disconnected {
                            error: error.clone(),
                        });
                        error
                    }
                },
                Some(Err(error)) => {
                    let error = Arc::new(error);
                    let attempt = match self.supervisor.state() {
                        SupervisorState::Negotiating { attempt } => attempt,
                        _ => 0,
                    };
                    self.shared.set_state(NegotiationState::Failed);
                    self.shared.emit(LifecycleEvent::ReconnectFailed {
                        attempt,
                        error: error.clone(),
                    });
                    error
                }
            };

            let decision = self.supervisor.on_failure(&error);
            self.publish_supervisor();
            match decision {
                Decision::Abandon => {
                    log::error!("Giving up on the connection: {}", error);
                    break CloseReason::Failed(error);
                }
                Decision::Retry { attempt, delay } => {
                    log::error!("Failed to connect: {}. Retrying in {:?}.", error, delay);
                    self.shared
                        .emit(LifecycleEvent::Reconnecting { attempt, delay });
                    let interrupted = tokio::select! {
                        _ = time::sleep(delay) => None,
                        command = self.commands.recv() => Some(command),
                    };
                    if let Some(command) = interrupted {
                        self.on_close(command);
                        break CloseReason::Requested;
                    }
                }
            }
        };
        self.finish(reason);
    }

    /// Connect and negotiate. `None` if the session was closed meanwhile.
    async fn connect(&mut self) -> Option<Result<Negotiated<C::Stream>, Error>> {
        self.supervisor.on_attempt();
        self.publish_supervisor();
        self.shared.set_state(NegotiationState::Connecting);

        let shared = &self.shared;
        let on_state = |state, flags, features: Option<&Features>| {
            shared.flags.send_replace(flags);
            if let Some(features) = features {
                shared.features.send_replace(Some(Arc::new(features.clone())));
            }
            shared.set_state(state);
        };
        let attempt = negotiate(
            &self.connector,
            &*self.authenticator,
            &shared.config,
            &mut self.sm,
            on_state,
        );
        let outcome = tokio::select! {
            result = attempt => Ok(result),
            command = self.commands.recv() => Err(command),
        };
        match outcome {
            Ok(result) => Some(result),
            Err(command) => {
                self.on_close(command);
                None
            }
        }
    }

    async fn serve(&mut self, negotiated: Negotiated<C::Stream>) -> Served {
        let Negotiated {
            stream,
            mut frames,
            flags,
            bound_jid,
            sm,
            resumed,
            acked,
            early,
            ..
        } = negotiated;
        let shared = self.shared.clone();
        let router = &shared.router;

        let (mut reader, writer) = tokio::io::split(stream);
        let broken = router.outbound().attach(Box::new(writer), sm).await;
        // Whatever was left over from a failed resumption is stale now.
        self.sm = None;
        router.notify_acked(acked);

        if !resumed && self.was_established {
            let failed = router.fail_collectors(CollectorError::SessionReplaced);
            if failed > 0 {
                log::debug!("Stream was not resumed, failed {} collectors.", failed);
            }
        }
        self.was_established = true;
        self.supervisor.on_established();
        self.publish_supervisor();

        if let Some(ref jid) = bound_jid {
            shared.bound_jid.send_replace(Some(jid.clone()));
        }
        shared.flags.send_replace(flags);
        let bound = shared.bound_jid.borrow().clone();
        if let Some(bound_jid) = bound {
            log::info!("Session established as {} (resumed: {})", bound_jid, resumed);
            shared.emit(LifecycleEvent::Established { bound_jid, resumed });
        }

        let (activity, activity_rx) = watch::channel(Instant::now());
        if let Some(config) = shared.config.keepalive {
            let events = shared.clone();
            tokio::spawn(keepalive::run(
                router.clone(),
                shared.server(),
                config,
                activity_rx,
                move || events.emit(LifecycleEvent::LivenessFailed),
            ));
        }

        for elem in early {
            if let Err(error) = self.handle_stanza(elem, false).await {
                return self.teardown(Served::Broken(error)).await;
            }
        }

        let served = loop {
            let input = tokio::select! {
                command = self.commands.recv() => Input::Command(command),
                _ = broken.notified() => Input::Broken,
                item = frames.read_item(&mut reader) => Input::Item(item),
            };
            let item = match input {
                Input::Command(command) => {
                    self.on_close(command);
                    break self.shutdown(&mut frames, &mut reader).await;
                }
                Input::Broken => break Served::Broken(Error::Disconnected),
                Input::Item(item) => item,
            };
            activity.send_replace(Instant::now());
            let result = match item {
                Ok(StreamItem::Element(elem)) => self.handle_element(elem).await,
                Ok(StreamItem::Whitespace) => Ok(()),
                Ok(StreamItem::Opened(_)) => Err(ProtocolError::InvalidStreamStart.into()),
                Ok(StreamItem::Closed) => {
                    log::debug!("Peer closed the stream.");
                    let _ = router.outbound().send_raw(STREAM_FOOTER).await;
                    Err(Error::Disconnected)
                }
                Err(error) => Err(error),
            };
            if let Err(error) = result {
                break Served::Broken(error);
            }
        };
        self.teardown(served).await
    }

    /// Detach the writer, keeping stream management state if the stream
    /// broke and can be resumed.
    async fn teardown(&mut self, served: Served) -> Served {
        let sm = self.shared.router.outbound().detach().await;
        if let Served::Broken(_) = served {
            self.sm = sm.filter(SmState::is_resumable);
        }
        served
    }

    /// Send our footer and wait for the peer's.
    async fn shutdown<R: AsyncRead + Unpin>(
        &self,
        frames: &mut XmlFrames,
        reader: &mut R,
    ) -> Served {
        self.shared.set_state(NegotiationState::Closing);
        let outbound = self.shared.router.outbound();
        if let Err(e) = outbound.send_raw(STREAM_FOOTER).await {
            log::debug!("Failed to send stream footer: {}", e);
            return Served::Closed;
        }
        let drain = async {
            loop {
                match frames.read_item(reader).await {
                    Ok(StreamItem::Closed) | Err(_) => break,
                    Ok(_) => (),
                }
            }
        };
        if time::timeout(self.shared.config.shutdown_timeout, drain)
            .await
            .is_err()
        {
            log::debug!("Peer did not close the stream in time.");
        }
        Served::Closed
    }

    async fn handle_element(&self, elem: Element) -> Result<(), Error> {
        if elem.is("error", ns::STREAM) {
            let info = StreamErrorInfo::from_element(&elem);
            return Err(info.into());
        }
        if elem.ns() == ns::SM {
            return self.handle_sm(&elem).await;
        }
        if is_stanza(&elem) {
            return self.handle_stanza(elem, true).await;
        }
        log::warn!("Ignoring unknown nonza {{{}}}{}", elem.ns(), elem.name());
        Ok(())
    }

    async fn handle_sm(&self, elem: &Element) -> Result<(), Error> {
        let outbound = self.shared.router.outbound();
        match elem.name() {
            "r" => {
                let Some(h) = outbound.with_sm(|sm| sm.inbound_ctr()).await else {
                    log::warn!("Ignoring <r/> without stream management.");
                    return Ok(());
                };
                outbound
                    .send_raw(&element_to_bytes(&stream_management::ack_element(h)))
                    .await
            }
            "a" => {
                let Some(h) = stream_management::parse_h(elem) else {
                    return Err(ProtocolError::UnexpectedElement {
                        name: elem.name().to_owned(),
                        ns: elem.ns(),
                    }
                    .into());
                };
                if let Some(result) = outbound.with_sm(|sm| sm.remote_acked(h)).await {
                    self.shared.router.notify_acked(result?);
                }
                Ok(())
            }
            other => {
                log::warn!("Ignoring stream management element <{}/>", other);
                Ok(())
            }
        }
    }

    async fn handle_stanza(&self, elem: Element, counted: bool) -> Result<(), Error> {
        let router = &self.shared.router;
        if counted {
            router.outbound().with_sm(SmState::count_inbound).await;
        }
        let stanza = match Stanza::try_from(elem.clone()) {
            Ok(stanza) => Arc::new(stanza),
            Err(error) => {
                router.report_unparsable(element_to_bytes(&elem), error.clone());
                return match self.shared.config.unparsable {
                    UnparsablePolicy::Skip => Ok(()),
                    UnparsablePolicy::Close => Err(Error::UnparsableStanza(error)),
                };
            }
        };

        let outcome = router.dispatch(stanza.clone());
        if !outcome.is_handled() && stanza.is_iq_request() && self.shared.config.reply_to_unhandled_iq
        {
            log::debug!("Nobody handled iq {:?}, replying service-unavailable.", stanza.id);
            let reply = Stanza::error_for(
                &stanza,
                StanzaError::new(ErrorType::Cancel, "service-unavailable"),
            );
            // A broken stream is noticed by the read side.
            if let Err(e) = router.send(&reply).await {
                log::debug!("Failed to reply to unhandled iq: {}", e);
            }
        }
        Ok(())
    }

    /// Fail everything still waiting and announce the end.
    fn finish(mut self, reason: CloseReason) {
        let failed = self
            .shared
            .router
            .fail_collectors(CollectorError::SessionClosed);
        log::debug!(
            "Session ended ({}), failed {} collectors.",
            reason,
            failed
        );
        if let CloseReason::Requested = reason {
            self.supervisor.abandon();
        }
        self.publish_supervisor();
        self.shared.set_state(NegotiationState::Closed);
        self.shared.emit(LifecycleEvent::Closed { reason });
        for waiter in self.close_waiters.drain(..) {
            let _ = waiter.send(());
        }
        // Late close requests are answered by dropping their sender.
        self.commands.close();
    }
}
