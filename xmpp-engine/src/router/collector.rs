// Copyright (c) 2025 Jonas Schäfer <jonas@zombofant.net>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use core::fmt;
use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll};
use std::error::Error as StdError;
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::oneshot;
use tokio::time::{Instant, Sleep};

use super::Registry;
use crate::stanza::Stanza;

/// Result delivered to a [`Collector`].
pub(crate) type CollectorResult = Result<Arc<Stanza>, CollectorError>;

/// Why a collector completed without a stanza.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectorError {
    /// No matching stanza arrived before the deadline.
    Timeout,

    /// The collector was cancelled through a [`CollectorHandle`].
    Cancelled,

    /// The session was re-established without resumption, so the reply
    /// can never arrive.
    SessionReplaced,

    /// The session was closed for good.
    SessionClosed,
}

impl fmt::Display for CollectorError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Timeout => f.write_str("no matching stanza received before the deadline"),
            Self::Cancelled => f.write_str("collector was cancelled"),
            Self::SessionReplaced => {
                f.write_str("session was replaced by a new one without resumption")
            }
            Self::SessionClosed => f.write_str("session was closed"),
        }
    }
}

impl StdError for CollectorError {}

/// Removes the registry entry when the collector goes away.
struct CollectorEntryHandle {
    key: u64,
    registry: Weak<Mutex<Registry>>,
}

impl CollectorEntryHandle {
    /// Remove the entry, returning whether it was still registered.
    fn remove(&self) -> bool {
        remove_collector(&self.registry, self.key)
    }
}

impl Drop for CollectorEntryHandle {
    fn drop(&mut self) {
        self.remove();
    }
}

fn remove_collector(registry: &Weak<Mutex<Registry>>, key: u64) -> bool {
    let Some(registry) = registry.upgrade() else {
        return false;
    };
    let mut registry = registry
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    registry.expire_collectors(Instant::now());
    registry.collectors.remove(&key).is_some()
}

pin_project_lite::pin_project! {
    /// A one-shot waiter for the next stanza matching a filter.
    ///
    /// Awaiting the collector yields the first matching stanza, or a
    /// [`CollectorError`] once the deadline passes, the collector is
    /// cancelled, or the session is replaced or closed. Exactly one of
    /// these outcomes happens.
    ///
    /// The deadline is fixed at registration time and keeps running while
    /// the session reconnects.
    ///
    /// Dropping the collector unregisters it.
    #[must_use = "collectors do nothing unless awaited"]
    pub struct Collector {
        entry: Option<CollectorEntryHandle>,
        #[pin]
        deadline: Sleep,
        rx: oneshot::Receiver<CollectorResult>,
    }
}

impl fmt::Debug for Collector {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Collector")
            .field("key", &self.entry.as_ref().map(|e| e.key))
            .field("deadline", &self.deadline.deadline())
            .finish()
    }
}

impl Collector {
    pub(super) fn new(
        key: u64,
        registry: Weak<Mutex<Registry>>,
        deadline: Instant,
        rx: oneshot::Receiver<CollectorResult>,
    ) -> Self {
        Self {
            entry: Some(CollectorEntryHandle { key, registry }),
            deadline: tokio::time::sleep_until(deadline),
            rx,
        }
    }

    /// Instant at which the collector times out.
    pub fn deadline(&self) -> Instant {
        self.deadline.deadline()
    }

    /// Get a handle which can cancel this collector from elsewhere.
    pub fn handle(&self) -> CollectorHandle {
        match self.entry {
            Some(ref entry) => CollectorHandle {
                key: entry.key,
                registry: entry.registry.clone(),
            },
            None => CollectorHandle {
                key: u64::MAX,
                registry: Weak::new(),
            },
        }
    }

    /// Cancel the collector.
    ///
    /// Returns false if it already completed, in which case this is a
    /// no-op.
    pub fn cancel(&self) -> bool {
        self.entry.as_ref().is_some_and(|entry| entry.remove())
    }
}

impl Future for Collector {
    type Output = Result<Arc<Stanza>, CollectorError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        match Pin::new(&mut *this.rx).poll(cx) {
            Poll::Ready(result) => {
                this.entry.take();
                // A dropped sender means the entry was removed without
                // fulfillment, which only cancel() does.
                return Poll::Ready(result.unwrap_or(Err(CollectorError::Cancelled)));
            }
            Poll::Pending => (),
        }

        if this.deadline.poll(cx).is_pending() {
            return Poll::Pending;
        }

        // Timeout, fulfillment and cancellation all remove the entry under
        // the registry lock. Whoever removes it decides the outcome. The
        // removal itself expires the entry if the deadline has passed.
        if let Some(entry) = this.entry.take() {
            if entry.remove() {
                log::trace!("collector {} timed out", entry.key);
                return Poll::Ready(Err(CollectorError::Timeout));
            }
        }
        // Someone else removed it: the outcome is already in the channel.
        match Pin::new(&mut *this.rx).poll(cx) {
            Poll::Ready(result) => Poll::Ready(result.unwrap_or(Err(CollectorError::Cancelled))),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Cancels a [`Collector`] without owning it.
///
/// Only refers to the registration; it does not keep it alive.
#[derive(Debug, Clone)]
pub struct CollectorHandle {
    key: u64,
    registry: Weak<Mutex<Registry>>,
}

impl CollectorHandle {
    /// Cancel the collector.
    ///
    /// Returns false (and does nothing) if the collector already completed
    /// through fulfillment, timeout or a previous cancellation.
    pub fn cancel(&self) -> bool {
        remove_collector(&self.registry, self.key)
    }
}
