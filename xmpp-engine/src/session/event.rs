// Copyright (c) 2019 Emmanuel Gil Peyrot <linkmauve@linkmauve.fr>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use core::fmt;
use core::time::Duration;
use std::sync::Arc;

use jid::Jid;

use crate::error::Error;
use crate::negotiation::NegotiationState;

/// Why a session ended for good.
#[derive(Debug, Clone)]
pub enum CloseReason {
    /// [`Session::close`][`crate::Session::close`] was called, or all
    /// handles to the session were dropped.
    Requested,

    /// The last error, after which the supervisor gave up.
    Failed(Arc<Error>),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CloseReason::Requested => f.write_str("closed locally"),
            CloseReason::Failed(e) => write!(f, "gave up after: {}", e),
        }
    }
}

/// Connection lifecycle notifications.
#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    /// The stream moved to another negotiation state.
    StateChanged(NegotiationState),

    /// Ordinary traffic can flow.
    Established {
        /// Our full address on this stream.
        bound_jid: Jid,
        /// The previous stream was resumed, including its outstanding
        /// collectors.
        resumed: bool,
    },

    /// An established stream broke.
    Disconnected {
        /// What broke it.
        error: Arc<Error>,
    },

    /// A connection attempt failed. Attempt 0 is the initial connection.
    ReconnectFailed {
        /// Number of the failed attempt.
        attempt: u32,
        /// Why it failed.
        error: Arc<Error>,
    },

    /// The next attempt is scheduled.
    Reconnecting {
        /// Number of the upcoming attempt, starting at 1.
        attempt: u32,
        /// Wait before the attempt.
        delay: Duration,
    },

    /// A keepalive ping went unanswered. The stream is left alone.
    LivenessFailed,

    /// The session ended. No further events follow.
    Closed {
        /// Why.
        reason: CloseReason,
    },
}

/// Callback interface for lifecycle events.
///
/// Every method defaults to doing nothing. Methods are called from a
/// dedicated task, in event order.
pub trait LifecycleListener: Send + Sync + 'static {
    /// See [`LifecycleEvent::StateChanged`].
    fn on_state_changed(&self, _state: NegotiationState) {}

    /// See [`LifecycleEvent::Established`].
    fn on_established(&self, _bound_jid: &Jid, _resumed: bool) {}

    /// See [`LifecycleEvent::Disconnected`].
    fn on_disconnected(&self, _error: &Error) {}

    /// See [`LifecycleEvent::ReconnectFailed`].
    fn on_reconnect_failed(&self, _attempt: u32, _error: &Error) {}

    /// See [`LifecycleEvent::Reconnecting`].
    fn on_reconnecting(&self, _attempt: u32, _delay: Duration) {}

    /// See [`LifecycleEvent::LivenessFailed`].
    fn on_liveness_failed(&self) {}

    /// See [`LifecycleEvent::Closed`].
    fn on_closed(&self, _reason: &CloseReason) {}
}

impl LifecycleEvent {
    /// Invoke the matching method of `listener`.
    pub fn deliver_to(&self, listener: &dyn LifecycleListener) {
        match self {
            LifecycleEvent::StateChanged(state) => listener.on_state_changed(*state),
            LifecycleEvent::Established { bound_jid, resumed } => {
                listener.on_established(bound_jid, *resumed)
            }
            LifecycleEvent::Disconnected { error } => listener.on_disconnected(error),
            LifecycleEvent::ReconnectFailed { attempt, error } => {
                listener.on_reconnect_failed(*attempt, error)
            }
            LifecycleEvent::Reconnecting { attempt, delay } => {
                listener.on_reconnecting(*attempt, *delay)
            }
            LifecycleEvent::LivenessFailed => listener.on_liveness_failed(),
            LifecycleEvent::Closed { reason } => listener.on_closed(reason),
        }
    }

    /// Whether this is the final event.
    pub fn is_closed(&self) -> bool {
        matches!(self, LifecycleEvent::Closed { .. })
    }
}
