// Copyright (c) 2019 Emmanuel Gil Peyrot <linkmauve@linkmauve.fr>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! # Client session
//!
//! A [`Session`] owns one logical connection to a server, which may span
//! several transport connections. Creating a session spawns its worker
//! task, which connects, negotiates, reads the stream, dispatches stanzas
//! through the [`Router`], and reconnects according to the configured
//! [`ReconnectPolicy`][`crate::ReconnectPolicy`].
//!
//! Collectors and listeners belong to the session, not to a transport
//! connection: listeners survive reconnects, and collectors survive a
//! resumed reconnect. If the new stream could not resume the old one,
//! outstanding collectors fail with
//! [`CollectorError::SessionReplaced`][`crate::CollectorError::SessionReplaced`].
//!
//! Negotiation state is owned by the worker and published as snapshots,
//! see [`Session::state`], [`Session::flags`] and [`Session::features`].
//! Lifecycle changes are broadcast as [`LifecycleEvent`]s.

use core::fmt;
use core::time::Duration;
use std::sync::Arc;

use futures::Stream;
use jid::Jid;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};

use crate::auth::Authenticator;
use crate::config::SessionConfig;
use crate::connect::Connector;
use crate::error::Error;
use crate::filter::{ReplyFilter, StanzaFilter};
use crate::keepalive;
use crate::negotiation::{Features, NegotiationState, SessionFlags};
use crate::reconnect::SupervisorState;
use crate::router::{Collector, ListenerHandle, Router, Subscription};
use crate::stanza::{Stanza, StanzaParseError};

mod event;
mod worker;

pub use event::{CloseReason, LifecycleEvent, LifecycleListener};
use worker::{Command, Worker};


/// State shared between the worker and the handles.
struct Shared {
    config: SessionConfig,
    router: Router,
    state: watch::Sender<NegotiationState>,
    flags: watch::Sender<SessionFlags>,
    features: watch::Sender<Option<Arc<Features>>>,
    bound_jid: watch::Sender<Option<Jid>>,
    supervisor: watch::Sender<SupervisorState>,
    events: broadcast::Sender<LifecycleEvent>,
}

impl Shared {
    fn emit(&self, event: LifecycleEvent) {
        log::trace!("lifecycle event: {:?}", event);
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    fn set_state(&self, state: NegotiationState) {
        if self.state.send_replace(state) != state {
            self.emit(LifecycleEvent::StateChanged(state));
        }
    }

    /// Our server's address, target of keepalive pings.
    fn server(&self) -> Option<Jid> {
        Jid::new(self.config.jid.domain().as_str()).ok()
    }
}

/// Handle to a client session.
///
/// Handles are cheap to clone. When the last handle is dropped, the
/// session closes the stream and stops reconnecting.
#[derive(Clone)]
pub struct Session {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Session")
            .field("jid", &self.shared.config.jid)
            .field("state", &self.state())
            .field("router", &self.shared.router)
            .finish()
    }
}

impl Session {
    /// Start a session.
    ///
    /// Returns immediately; the connection is established in the
    /// background. Use [`Session::wait_established`] or [`Session::events`]
    /// to follow its progress. Must be called from within a tokio runtime.
    pub fn new<C, A>(config: SessionConfig, connector: C, authenticator: A) -> Self
    where
        C: Connector,
        A: Authenticator,
    {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let router = Router::new();
        let ping_responder = keepalive::register_ping_responder(&router);
        let shared = Arc::new(Shared {
            router,
            state: watch::channel(NegotiationState::Connecting).0,
            flags: watch::channel(SessionFlags::default()).0,
            features: watch::channel(None).0,
            bound_jid: watch::channel(None).0,
            supervisor: watch::channel(SupervisorState::Idle).0,
            events,
            config,
        });
        let (commands, commands_rx) = mpsc::unbounded_channel();

        let worker = Worker::new(
            shared.clone(),
            connector,
            Arc::new(authenticator),
            commands_rx,
            ping_responder,
        );
        tokio::spawn(worker.run());

        Session { shared, commands }
    }

    /// The configuration this session was created with.
    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    /// The router carrying this session's collectors and listeners.
    pub fn router(&self) -> &Router {
        &self.shared.router
    }

    /// Current negotiation state.
    pub fn state(&self) -> NegotiationState {
        *self.shared.state.borrow()
    }

    /// What negotiation achieved on the current stream.
    pub fn flags(&self) -> SessionFlags {
        *self.shared.flags.borrow()
    }

    /// The most recent feature advertisement.
    pub fn features(&self) -> Option<Arc<Features>> {
        self.shared.features.borrow().clone()
    }

    /// The address bound by the most recent full negotiation. Kept across
    /// resumptions.
    pub fn bound_jid(&self) -> Option<Jid> {
        self.shared.bound_jid.borrow().clone()
    }

    /// What the reconnection supervisor is doing.
    pub fn supervisor_state(&self) -> SupervisorState {
        *self.shared.supervisor.borrow()
    }

    /// Mint a new correlation identifier.
    pub fn next_id(&self) -> String {
        self.shared.router.next_id()
    }

    /// Send a stanza.
    ///
    /// Fails with [`Error::NotConnected`] while the session is not
    /// established.
    pub async fn send(&self, stanza: &Stanza) -> Result<(), Error> {
        self.shared.router.send(stanza).await
    }

    /// Send an IQ request and wait for its reply, for at most the
    /// configured reply timeout.
    ///
    /// An id is minted if the request has none. Error replies are returned
    /// as `Ok`; inspect [`Stanza::error`].
    pub async fn send_request(&self, request: Stanza) -> Result<Arc<Stanza>, Error> {
        self.send_request_timeout(request, self.shared.config.reply_timeout)
            .await
    }

    /// Like [`Session::send_request`], with an explicit timeout.
    pub async fn send_request_timeout(
        &self,
        mut request: Stanza,
        timeout: Duration,
    ) -> Result<Arc<Stanza>, Error> {
        let id = match request.id {
            Some(ref id) => id.clone(),
            None => {
                let id = self.next_id();
                request.id = Some(id.clone());
                id
            }
        };
        let mut filter = ReplyFilter::new(id, request.to.clone());
        if let Some(server) = self.shared.server() {
            filter = filter.with_account(self.bound_jid(), server);
        }
        // Registered before sending, so that a fast reply finds it.
        let reply = self.shared.router.register_collector(filter, timeout);
        self.send(&request).await?;
        Ok(reply.await?)
    }

    /// Ping our server and return the round-trip time.
    ///
    /// An error reply counts as an answer.
    pub async fn ping(&self) -> Result<Duration, Error> {
        let (ping, filter) = keepalive::ping_request(&self.shared.router, self.shared.server());
        let reply = self
            .shared
            .router
            .register_collector(filter, self.shared.config.reply_timeout);
        let start = Instant::now();
        self.send(&ping).await?;
        reply.await?;
        Ok(start.elapsed())
    }

    /// Wait for the next stanza matching `filter`, for at most `timeout`.
    ///
    /// See [`Router::register_collector`].
    pub fn register_collector<F: StanzaFilter>(&self, filter: F, timeout: Duration) -> Collector {
        self.shared.router.register_collector(filter, timeout)
    }

    /// Invoke `callback` for every stanza matching `filter`, across
    /// reconnects.
    pub fn register_listener<F, C>(&self, filter: F, callback: C) -> ListenerHandle
    where
        F: StanzaFilter,
        C: FnMut(Arc<Stanza>) + Send + 'static,
    {
        self.shared.router.register_listener(filter, callback)
    }

    /// Receive every stanza matching `filter` through a stream.
    pub fn subscribe<F: StanzaFilter>(&self, filter: F) -> Subscription {
        self.shared.router.subscribe(filter)
    }

    /// See [`Router::register_sending_listener`].
    pub fn register_sending_listener<F, C>(&self, filter: F, callback: C) -> ListenerHandle
    where
        F: StanzaFilter,
        C: FnMut(Arc<Stanza>) + Send + 'static,
    {
        self.shared.router.register_sending_listener(filter, callback)
    }

    /// Invoke `callback` for every sent stanza matching `filter` which the
    /// server acknowledged. Needs stream management.
    pub fn register_ack_listener<F, C>(&self, filter: F, callback: C) -> ListenerHandle
    where
        F: StanzaFilter,
        C: FnMut(Arc<Stanza>) + Send + 'static,
    {
        self.shared.router.register_ack_listener(filter, callback)
    }

    /// Modify outgoing stanzas matching `filter` before they are sent.
    pub fn add_interceptor<F, I>(&self, filter: F, interceptor: I) -> ListenerHandle
    where
        F: StanzaFilter,
        I: Fn(&mut Stanza) + Send + Sync + 'static,
    {
        self.shared.router.add_interceptor(filter, interceptor)
    }

    /// Remove a listener or interceptor. Returns false if it was not
    /// registered.
    pub fn unregister(&self, handle: &ListenerHandle) -> bool {
        self.shared.router.unregister(handle)
    }

    /// Install the callback for stanzas which could not be parsed.
    pub fn on_unparsable<H>(&self, handler: H)
    where
        H: Fn(&[u8], &StanzaParseError) + Send + Sync + 'static,
    {
        self.shared.router.set_unparsable_handler(handler)
    }

    /// Subscribe to lifecycle events from now on.
    ///
    /// Events are buffered up to the configured capacity; a subscriber
    /// which falls further behind skips the oldest ones.
    pub fn events(&self) -> impl Stream<Item = LifecycleEvent> + Send + Unpin + 'static {
        let events = BroadcastStream::new(self.shared.events.subscribe());
        tokio_stream::StreamExt::filter_map(events, |item| match item {
            Ok(event) => Some(event),
            Err(BroadcastStreamRecvError::Lagged(n)) => {
                log::warn!("Lifecycle subscriber lagging, {} events lost.", n);
                None
            }
        })
    }

    /// Invoke `listener` for every lifecycle event from now on.
    ///
    /// The listener runs on its own task until the session is closed.
    pub fn add_lifecycle_listener(&self, listener: Arc<dyn LifecycleListener>) {
        let mut events = self.shared.events.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        event.deliver_to(&*listener);
                        if event.is_closed() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("Lifecycle listener lagging, {} events lost.", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    /// Wait until the stream is established.
    ///
    /// Fails with [`Error::SessionClosed`] if the session ends first.
    pub async fn wait_established(&self) -> Result<(), Error> {
        let mut state = self.shared.state.subscribe();
        let reached = state
            .wait_for(|s| matches!(s, NegotiationState::Established | NegotiationState::Closed))
            .await
            .map_err(|_| Error::SessionClosed)?;
        if reached.is_established() {
            Ok(())
        } else {
            Err(Error::SessionClosed)
        }
    }

    /// Close the session.
    ///
    /// Sends the stream footer, waits for the peer's up to the configured
    /// shutdown timeout, and fails all outstanding collectors with
    /// [`CollectorError::SessionClosed`][`crate::CollectorError::SessionClosed`].
    /// Returns once the session has ended.
    pub async fn close(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Close(tx)).is_err() {
            // worker already gone
            return;
        }
        let _ = rx.await;
    }
}
