// Copyright (c) 2024 Jonas Schäfer <jonas@zombofant.net>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Session configuration.

use core::time::Duration;

use jid::Jid;

use crate::reconnect::ReconnectPolicy;
use crate::tokenizer::DEFAULT_MAX_UNIT_SIZE;

/// When to encrypt the transport with STARTTLS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsPolicy {
    /// Refuse to authenticate over an unencrypted transport.
    #[default]
    Required,

    /// Encrypt if the server offers it and the connector supports it.
    ///
    /// If the server marks STARTTLS as mandatory and the connector cannot
    /// upgrade, negotiation fails.
    IfAvailable,

    /// Never upgrade. Negotiation fails if the server requires encryption.
    Disabled,
}

/// Liveness watchdog timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepaliveConfig {
    /// Idle time after which a ping is sent.
    pub interval: Duration,

    /// How long to wait for any inbound traffic after the ping.
    pub reply_timeout: Duration,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            reply_timeout: Duration::from_secs(30),
        }
    }
}

/// What to do with a well-formed element which is not a valid stanza.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnparsablePolicy {
    /// Report it to the unparsable handler and carry on.
    #[default]
    Skip,

    /// Report it, then fail the stream.
    Close,
}

/// Configuration of a [`Session`][`crate::Session`].
///
/// All fields are public; the `with_*` methods are shorthands for
/// building a configuration in one expression.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Account to log into. A resource in the JID is requested at bind
    /// time; otherwise the server assigns one.
    pub jid: Jid,

    /// STARTTLS policy.
    pub tls: TlsPolicy,

    /// Enable XEP-0198 stream management and resumption if the server
    /// offers it.
    pub stream_management: bool,

    /// Liveness watchdog, or `None` to disable it.
    pub keepalive: Option<KeepaliveConfig>,

    /// Reconnection behaviour after the stream breaks.
    pub reconnect: ReconnectPolicy,

    /// Default timeout for [`Session::send_request`][`crate::Session::send_request`].
    pub reply_timeout: Duration,

    /// Upper bound for each read while negotiating.
    pub negotiation_timeout: Duration,

    /// Largest lexical unit the tokenizer buffers, in bytes.
    pub max_unit_size: usize,

    /// Handling of elements which are not valid stanzas.
    pub unparsable: UnparsablePolicy,

    /// Answer get/set IQs nobody handled with `service-unavailable`.
    pub reply_to_unhandled_iq: bool,

    /// How long [`Session::close`][`crate::Session::close`] waits for the
    /// peer's stream footer.
    pub shutdown_timeout: Duration,

    /// Capacity of the lifecycle event broadcast. Subscribers which fall
    /// further behind lose events.
    pub event_capacity: usize,
}

impl SessionConfig {
    /// Configuration with default settings for `jid`.
    pub fn new(jid: Jid) -> Self {
        Self {
            jid,
            tls: TlsPolicy::default(),
            stream_management: true,
            keepalive: Some(KeepaliveConfig::default()),
            reconnect: ReconnectPolicy::default(),
            reply_timeout: Duration::from_secs(5),
            negotiation_timeout: Duration::from_secs(30),
            max_unit_size: DEFAULT_MAX_UNIT_SIZE,
            unparsable: UnparsablePolicy::default(),
            reply_to_unhandled_iq: true,
            shutdown_timeout: Duration::from_secs(2),
            event_capacity: 64,
        }
    }

    /// Set the STARTTLS policy.
    pub fn with_tls(mut self, tls: TlsPolicy) -> Self {
        self.tls = tls;
        self
    }

    /// Enable or disable stream management.
    pub fn with_stream_management(mut self, enabled: bool) -> Self {
        self.stream_management = enabled;
        self
    }

    /// Configure or disable the liveness watchdog.
    pub fn with_keepalive(mut self, keepalive: Option<KeepaliveConfig>) -> Self {
        self.keepalive = keepalive;
        self
    }

    /// Set the reconnection policy.
    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Set the default request timeout.
    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    /// Set the per-read negotiation timeout.
    pub fn with_negotiation_timeout(mut self, timeout: Duration) -> Self {
        self.negotiation_timeout = timeout;
        self
    }

    /// Set the tokenizer unit size limit.
    pub fn with_max_unit_size(mut self, size: usize) -> Self {
        self.max_unit_size = size;
        self
    }

    /// Set the unparsable stanza policy.
    pub fn with_unparsable(mut self, policy: UnparsablePolicy) -> Self {
        self.unparsable = policy;
        self
    }

    /// Enable or disable automatic error replies to unhandled IQs.
    pub fn with_reply_to_unhandled_iq(mut self, enabled: bool) -> Self {
        self.reply_to_unhandled_iq = enabled;
        self
    }

    /// Set how long closing waits for the peer.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Set the lifecycle event buffer size.
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }
}
