// Copyright (c) 2025 Jonas Schäfer <jonas@zombofant.net>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! # Stanza routing
//!
//! The [`Router`] hands every complete inbound stanza to two kinds of
//! consumers:
//!
//! - **Collectors** ([`Router::register_collector`]) are one-shot waiters
//!   with a deadline, typically waiting for the reply to a request. Every
//!   collector whose filter matches a stanza is fulfilled with it, each
//!   exactly once. Fulfilling one collector does not hide the stanza from
//!   other collectors or listeners.
//! - **Listeners** ([`Router::register_listener`], [`Router::subscribe`])
//!   receive every matching stanza until they are unregistered.
//!
//! Dispatch happens on the inbound path in wire order. Each listener owns a
//! queue and a task which runs its callback, so slow callbacks only delay
//! their own listener. Callbacks of one listener are invoked in dispatch
//! order; different listeners run concurrently. Queues are unbounded: a
//! listener which cannot keep up grows its queue without limit, and a
//! warning is logged every [`LISTENER_BACKLOG_WARNING`] queued stanzas.
//!
//! The outbound side has three more hooks:
//!
//! - **Interceptors** ([`Router::add_interceptor`]) may modify a stanza
//!   before it is serialized. They run synchronously in [`Router::send`],
//!   in registration order.
//! - **Sending listeners** ([`Router::register_sending_listener`]) see every
//!   matching stanza after it was written to the transport.
//! - **Ack listeners** ([`Router::register_ack_listener`]) see every
//!   matching stanza once the peer acknowledged it through stream
//!   management, either by `<a/>` or on resumption.
//!
//! When sending a request, register the collector *before* sending, or the
//! reply may be dispatched before anyone waits for it.
//! [`Session::send_request`][`crate::Session::send_request`] does this for
//! you.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::error::Error;
use crate::filter::StanzaFilter;
use crate::stanza::{Stanza, StanzaParseError};

mod collector;
mod listener;
pub(crate) mod outbound;

pub use collector::{Collector, CollectorError, CollectorHandle};
use collector::CollectorResult;
pub use listener::{ListenerHandle, Subscription};
use outbound::Outbound;


/// Callback for stanzas which could not be parsed.
pub type UnparsableHandler = Arc<dyn Fn(&[u8], &StanzaParseError) + Send + Sync>;

struct CollectorEntry {
    filter: Box<dyn StanzaFilter>,
    deadline: Instant,
    tx: oneshot::Sender<CollectorResult>,
}

/// Queue length at which a listener is reported as lagging, and every
/// multiple of it.
pub const LISTENER_BACKLOG_WARNING: usize = 1000;

/// Modifies outbound stanzas.
type Interceptor = Arc<dyn Fn(&mut Stanza) + Send + Sync>;

struct ListenerEntry {
    filter: Box<dyn StanzaFilter>,
    tx: mpsc::UnboundedSender<Arc<Stanza>>,

    /// Stanzas queued but not yet taken by the consumer.
    backlog: Arc<AtomicUsize>,
}

impl ListenerEntry {
    /// Queue `stanza`. Returns false if the receiver went away.
    fn push(&self, key: u64, stanza: &Arc<Stanza>) -> bool {
        // Counted before sending, so the consumer never decrements first.
        let backlog = self.backlog.fetch_add(1, Ordering::Relaxed) + 1;
        if self.tx.send(stanza.clone()).is_err() {
            return false;
        }
        if backlog % LISTENER_BACKLOG_WARNING == 0 {
            log::warn!(
                "listener {} has {} stanzas queued, its consumer is not keeping up",
                key,
                backlog
            );
        }
        true
    }
}

struct InterceptorEntry {
    filter: Box<dyn StanzaFilter>,
    interceptor: Interceptor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListenerKind {
    Inbound,
    Sending,
    Acked,
}

#[derive(Default)]
pub(crate) struct Registry {
    next_key: u64,
    collectors: BTreeMap<u64, CollectorEntry>,
    listeners: BTreeMap<u64, ListenerEntry>,
    sending: BTreeMap<u64, ListenerEntry>,
    acked: BTreeMap<u64, ListenerEntry>,
    interceptors: BTreeMap<u64, InterceptorEntry>,
}

impl Registry {
    fn allocate_key(&mut self) -> u64 {
        let key = self.next_key;
        self.next_key += 1;
        key
    }

    fn listeners_mut(&mut self, kind: ListenerKind) -> &mut BTreeMap<u64, ListenerEntry> {
        match kind {
            ListenerKind::Inbound => &mut self.listeners,
            ListenerKind::Sending => &mut self.sending,
            ListenerKind::Acked => &mut self.acked,
        }
    }

    /// Remove a listener or interceptor, whichever kind it is.
    pub(crate) fn remove_listener(&mut self, key: u64) -> bool {
        self.listeners.remove(&key).is_some()
            || self.sending.remove(&key).is_some()
            || self.acked.remove(&key).is_some()
            || self.interceptors.remove(&key).is_some()
    }

    fn durable_registrations(&self) -> usize {
        self.listeners.len() + self.sending.len() + self.acked.len() + self.interceptors.len()
    }

    /// Queue `stanza` for every matching listener of `kind`, dropping those
    /// whose receiver went away. Returns the number reached.
    fn deliver(&mut self, kind: ListenerKind, stanza: &Arc<Stanza>) -> usize {
        let listeners = self.listeners_mut(kind);
        let mut reached = 0;
        let mut closed = Vec::new();
        for (key, entry) in listeners.iter() {
            if !entry.filter.matches(stanza) {
                continue;
            }
            if entry.push(*key, stanza) {
                reached += 1;
            } else {
                closed.push(*key);
            }
        }
        for key in closed {
            log::debug!("removing {:?} listener {} whose receiver went away", kind, key);
            listeners.remove(&key);
        }
        reached
    }

    /// Time out every collector whose deadline has passed.
    ///
    /// Runs on every registry operation which looks at collectors, so an
    /// expired collector can neither be fulfilled nor cancelled, whether or
    /// not its future is being polled.
    fn expire_collectors(&mut self, now: Instant) {
        let expired: Vec<u64> = self
            .collectors
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(key, _)| *key)
            .collect();
        for key in expired {
            if let Some(entry) = self.collectors.remove(&key) {
                log::trace!("collector {} timed out", key);
                let _ = entry.tx.send(Err(CollectorError::Timeout));
            }
        }
    }
}

/// How many consumers a dispatched stanza reached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    /// Collectors fulfilled by the stanza.
    pub collectors: usize,
    /// Listeners the stanza was queued for.
    pub listeners: usize,
}

impl DispatchOutcome {
    /// Whether anyone consumed the stanza.
    pub fn is_handled(&self) -> bool {
        self.collectors > 0 || self.listeners > 0
    }
}

/// Mints correlation identifiers.
struct IdSource {
    prefix: String,
    counter: AtomicU64,
}

impl IdSource {
    fn new() -> Self {
        Self {
            prefix: format!("{:08x}", rand::random::<u32>()),
            counter: AtomicU64::new(1),
        }
    }

    fn next(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}", self.prefix, n)
    }
}

struct RouterInner {
    registry: Arc<Mutex<Registry>>,
    outbound: Outbound,
    ids: IdSource,
    unparsable: Mutex<Option<UnparsableHandler>>,
}

/// Registry of collectors and listeners plus the serialized send path.
///
/// Cloning a router is cheap; all clones share the same registry.
#[derive(Clone)]
pub struct Router {
    inner: Arc<RouterInner>,
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let registry = self.lock();
        f.debug_struct("Router")
            .field("collectors", &registry.collectors.len())
            .field("listeners", &registry.listeners.len())
            .field("sending", &registry.sending.len())
            .field("acked", &registry.acked.len())
            .field("interceptors", &registry.interceptors.len())
            .finish()
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    /// Create an empty router which is not attached to any transport.
    pub fn new() -> Self {
        Self::with_outbound(Outbound::default())
    }

    pub(crate) fn with_outbound(outbound: Outbound) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                registry: Arc::new(Mutex::new(Registry::default())),
                outbound,
                ids: IdSource::new(),
                unparsable: Mutex::new(None),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        // Nothing panics while holding the lock, except for user-supplied
        // filters. Their registrations are still consistent.
        self.inner
            .registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn outbound(&self) -> &Outbound {
        &self.inner.outbound
    }

    /// Mint a new correlation identifier.
    ///
    /// Identifiers are unique for the lifetime of the router: a random
    /// prefix followed by a monotonically increasing counter.
    pub fn next_id(&self) -> String {
        self.inner.ids.next()
    }

    /// Wait for the next stanza matching `filter`, for at most `timeout`.
    pub fn register_collector<F: StanzaFilter>(&self, filter: F, timeout: Duration) -> Collector {
        let (tx, rx) = oneshot::channel();
        let now = Instant::now();
        let deadline = now + timeout;
        let mut registry = self.lock();
        registry.expire_collectors(now);
        let key = registry.allocate_key();
        registry.collectors.insert(
            key,
            CollectorEntry {
                filter: Box::new(filter),
                deadline,
                tx,
            },
        );
        Collector::new(key, Arc::downgrade(&self.inner.registry), deadline, rx)
    }

    /// Invoke `callback` for every inbound stanza matching `filter`.
    ///
    /// The callback runs on its own task, in dispatch order. Long-running
    /// work should be spawned from it. Stanzas wait for the callback in an
    /// unbounded queue, so a callback which falls behind the inbound
    /// traffic makes the queue grow without limit. Must be called from
    /// within a tokio runtime.
    pub fn register_listener<F, C>(&self, filter: F, callback: C) -> ListenerHandle
    where
        F: StanzaFilter,
        C: FnMut(Arc<Stanza>) + Send + 'static,
    {
        self.spawn_listener(ListenerKind::Inbound, Box::new(filter), callback)
    }

    /// Invoke `callback` for every stanza matching `filter` after it was
    /// written to the transport.
    ///
    /// The callback sees the stanza as modified by interceptors. It runs
    /// like a [`register_listener`][`Self::register_listener`] callback.
    pub fn register_sending_listener<F, C>(&self, filter: F, callback: C) -> ListenerHandle
    where
        F: StanzaFilter,
        C: FnMut(Arc<Stanza>) + Send + 'static,
    {
        self.spawn_listener(ListenerKind::Sending, Box::new(filter), callback)
    }

    /// Invoke `callback` for every sent stanza matching `filter` once the
    /// peer acknowledged it.
    ///
    /// Only streams with stream management acknowledge stanzas. Stanzas
    /// are reported in the order they were sent.
    pub fn register_ack_listener<F, C>(&self, filter: F, callback: C) -> ListenerHandle
    where
        F: StanzaFilter,
        C: FnMut(Arc<Stanza>) + Send + 'static,
    {
        self.spawn_listener(ListenerKind::Acked, Box::new(filter), callback)
    }

    /// Run `interceptor` on every outbound stanza matching `filter` before
    /// it is serialized.
    ///
    /// Filters are evaluated against the stanza as passed to
    /// [`send`][`Self::send`]. Matching interceptors then run in
    /// registration order, on the sending task, without the registry
    /// locked.
    pub fn add_interceptor<F, I>(&self, filter: F, interceptor: I) -> ListenerHandle
    where
        F: StanzaFilter,
        I: Fn(&mut Stanza) + Send + Sync + 'static,
    {
        let mut registry = self.lock();
        let key = registry.allocate_key();
        registry.interceptors.insert(
            key,
            InterceptorEntry {
                filter: Box::new(filter),
                interceptor: Arc::new(interceptor),
            },
        );
        self.handle(key)
    }

    /// Receive every inbound stanza matching `filter` through a stream.
    ///
    /// Like listener callbacks, the stream is fed through an unbounded
    /// queue. Poll it steadily or drop it.
    pub fn subscribe<F: StanzaFilter>(&self, filter: F) -> Subscription {
        let (handle, rx, backlog) = self.add_listener(ListenerKind::Inbound, Box::new(filter));
        Subscription {
            handle,
            inner: UnboundedReceiverStream::new(rx),
            backlog,
        }
    }

    fn spawn_listener<C>(
        &self,
        kind: ListenerKind,
        filter: Box<dyn StanzaFilter>,
        mut callback: C,
    ) -> ListenerHandle
    where
        C: FnMut(Arc<Stanza>) + Send + 'static,
    {
        let (handle, mut rx, backlog) = self.add_listener(kind, filter);
        tokio::spawn(async move {
            while let Some(stanza) = rx.recv().await {
                backlog.fetch_sub(1, Ordering::Relaxed);
                callback(stanza);
            }
        });
        handle
    }

    fn add_listener(
        &self,
        kind: ListenerKind,
        filter: Box<dyn StanzaFilter>,
    ) -> (
        ListenerHandle,
        mpsc::UnboundedReceiver<Arc<Stanza>>,
        Arc<AtomicUsize>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let backlog = Arc::new(AtomicUsize::new(0));
        let mut registry = self.lock();
        let key = registry.allocate_key();
        registry.listeners_mut(kind).insert(
            key,
            ListenerEntry {
                filter,
                tx,
                backlog: backlog.clone(),
            },
        );
        (self.handle(key), rx, backlog)
    }

    fn handle(&self, key: u64) -> ListenerHandle {
        ListenerHandle {
            key,
            registry: Arc::downgrade(&self.inner.registry),
        }
    }

    /// Remove a listener or interceptor. Returns false if it was not
    /// registered.
    pub fn unregister(&self, handle: &ListenerHandle) -> bool {
        self.lock().remove_listener(handle.key)
    }

    /// Number of registered (collectors, listeners). The second count
    /// includes sending listeners, ack listeners and interceptors.
    pub fn registrations(&self) -> (usize, usize) {
        let mut registry = self.lock();
        registry.expire_collectors(Instant::now());
        (registry.collectors.len(), registry.durable_registrations())
    }

    /// Hand a complete stanza to all matching collectors and listeners.
    ///
    /// Must be called in arrival order. Filters are evaluated with the
    /// registry locked and must not call back into the router.
    pub fn dispatch(&self, stanza: Arc<Stanza>) -> DispatchOutcome {
        let mut outcome = DispatchOutcome::default();
        let mut registry = self.lock();
        registry.expire_collectors(Instant::now());

        let fulfilled: Vec<u64> = registry
            .collectors
            .iter()
            .filter(|(_, entry)| entry.filter.matches(&stanza))
            .map(|(key, _)| *key)
            .collect();
        for key in fulfilled {
            if let Some(entry) = registry.collectors.remove(&key) {
                // The waiter may have been dropped in the meantime; that is
                // fine, the entry is gone either way.
                let _ = entry.tx.send(Ok(stanza.clone()));
                outcome.collectors += 1;
            }
        }

        outcome.listeners = registry.deliver(ListenerKind::Inbound, &stanza);

        log::trace!(
            "dispatched {:?} id={:?} to {} collectors and {} listeners",
            stanza.kind,
            stanza.id,
            outcome.collectors,
            outcome.listeners
        );
        outcome
    }

    /// Fail every outstanding collector with `error`.
    ///
    /// Listeners are not affected.
    pub fn fail_collectors(&self, error: CollectorError) -> usize {
        let collectors = {
            let mut registry = self.lock();
            registry.expire_collectors(Instant::now());
            core::mem::take(&mut registry.collectors)
        };
        let n = collectors.len();
        for (_, entry) in collectors {
            let _ = entry.tx.send(Err(error));
        }
        if n > 0 {
            log::debug!("failed {} outstanding collectors with {:?}", n, error);
        }
        n
    }

    /// Install the callback for stanzas which could not be parsed.
    pub fn set_unparsable_handler<H>(&self, handler: H)
    where
        H: Fn(&[u8], &StanzaParseError) + Send + Sync + 'static,
    {
        *self
            .inner
            .unparsable
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Arc::new(handler));
    }

    /// Report an unparsable stanza to the installed handler.
    ///
    /// The handler runs on a separate task.
    pub(crate) fn report_unparsable(&self, raw: Vec<u8>, error: StanzaParseError) {
        let handler = self
            .inner
            .unparsable
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        match handler {
            Some(handler) => {
                tokio::spawn(async move { handler(&raw, &error) });
            }
            None => log::warn!(
                "skipping unparsable stanza ({}): {}",
                error,
                String::from_utf8_lossy(&raw)
            ),
        }
    }

    /// Hand stanzas the peer acknowledged to the ack listeners.
    pub(crate) fn notify_acked(&self, acked: Vec<Arc<Stanza>>) {
        if acked.is_empty() {
            return;
        }
        let mut registry = self.lock();
        if registry.acked.is_empty() {
            return;
        }
        for stanza in acked.iter() {
            registry.deliver(ListenerKind::Acked, stanza);
        }
        log::trace!("notified ack listeners about {} stanzas", acked.len());
    }

    /// Apply the matching interceptors to a copy of `stanza`.
    fn intercept(&self, stanza: &Stanza) -> Stanza {
        let interceptors: Vec<Interceptor> = self
            .lock()
            .interceptors
            .values()
            .filter(|entry| entry.filter.matches(stanza))
            .map(|entry| entry.interceptor.clone())
            .collect();
        let mut stanza = stanza.clone();
        for interceptor in interceptors {
            interceptor(&mut stanza);
        }
        stanza
    }

    /// Send a stanza.
    ///
    /// Interceptors run first; sending listeners are notified once the
    /// stanza was written. Fails with [`Error::NotConnected`] while the
    /// session is not established.
    pub async fn send(&self, stanza: &Stanza) -> Result<(), Error> {
        let stanza = Arc::new(self.intercept(stanza));
        self.inner.outbound.send_stanza(stanza.clone()).await?;
        let reached = self.lock().deliver(ListenerKind::Sending, &stanza);
        if reached > 0 {
            log::trace!(
                "sent {:?} id={:?} to {} sending listeners",
                stanza.kind,
                stanza.id,
                reached
            );
        }
        Ok(())
    }
}
