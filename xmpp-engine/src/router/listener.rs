// Copyright (c) 2025 Jonas Schäfer <jonas@zombofant.net>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use core::pin::Pin;
use core::task::{Context, Poll};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use futures::Stream;
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::Registry;
use crate::stanza::Stanza;

/// Registration of a durable listener or interceptor.
///
/// The handle only refers to the registration: dropping it does not
/// unregister the listener. Use [`ListenerHandle::unregister`] or
/// [`Router::unregister`][`super::Router::unregister`] for that.
#[derive(Debug, Clone)]
pub struct ListenerHandle {
    pub(super) key: u64,
    pub(super) registry: Weak<Mutex<Registry>>,
}

impl ListenerHandle {
    /// Remove the listener or interceptor.
    ///
    /// Stanzas which were already dispatched to it are still delivered.
    /// Returns false if it was not registered anymore.
    pub fn unregister(&self) -> bool {
        let Some(registry) = self.registry.upgrade() else {
            return false;
        };
        let mut registry = registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        registry.remove_listener(self.key)
    }
}

/// A listener consumed as a [`Stream`] of stanzas.
///
/// Dropping the subscription unregisters it.
#[derive(Debug)]
pub struct Subscription {
    pub(super) handle: ListenerHandle,
    pub(super) inner: UnboundedReceiverStream<Arc<Stanza>>,
    pub(super) backlog: Arc<AtomicUsize>,
}

impl Subscription {
    /// The underlying listener registration.
    pub fn handle(&self) -> &ListenerHandle {
        &self.handle
    }
}

impl Stream for Subscription {
    type Item = Arc<Stanza>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let item = Pin::new(&mut self.inner).poll_next(cx);
        if let Poll::Ready(Some(_)) = item {
            self.backlog.fetch_sub(1, Ordering::Relaxed);
        }
        item
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.handle.unregister();
    }
}
