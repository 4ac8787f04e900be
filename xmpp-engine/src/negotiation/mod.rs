// Copyright (c) 2019 Emmanuel Gil Peyrot <linkmauve@linkmauve.fr>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! # Stream negotiation
//!
//! Negotiation is split in two halves:
//!
//! - [`Negotiator`] is a pure state machine. Given the current feature
//!   advertisement and what has been achieved so far, it decides the next
//!   [`Step`] and refuses to skip mandatory ones.
//! - The async driver (`negotiate`) performs those steps on a transport:
//!   it writes the requests, reads the replies, and restarts the stream
//!   after STARTTLS and SASL.
//!
//! The states follow the handshake:
//!
//! ```text
//! Connecting -> EnvelopeOpened -> FeaturesReceived -> Encrypting -----+
//!                    ^                  |         \-> Authenticating -+
//!                    +------------------+-------------(stream restart)+
//!                                       |-> Resuming -> Established
//!                                       |        \-> Binding
//!                                       \-> Binding -> Established -> Closing -> Closed
//! ```
//!
//! `Failed` is reachable from every state.

use core::fmt;

use crate::config::TlsPolicy;
use crate::error::{Error, PolicyViolation, ProtocolError};

mod driver;
mod features;

pub(crate) use driver::{negotiate, Negotiated};
pub use features::Features;

#[cfg(test)]
mod tests;

/// Lifecycle state of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NegotiationState {
    /// Opening the transport.
    Connecting,
    /// Our stream header is out and the peer's has been received.
    EnvelopeOpened,
    /// The peer advertised its features.
    FeaturesReceived,
    /// STARTTLS in progress.
    Encrypting,
    /// SASL in progress.
    Authenticating,
    /// Resource binding (plus legacy session and enabling stream
    /// management) in progress.
    Binding,
    /// Attempting to resume a previous stream.
    Resuming,
    /// Ordinary traffic flows.
    Established,
    /// Our stream footer is out.
    Closing,
    /// The stream ended.
    Closed,
    /// The stream failed.
    Failed,
}

impl NegotiationState {
    /// Whether the transition `self -> next` is part of the handshake.
    pub fn can_transition_to(self, next: NegotiationState) -> bool {
        use NegotiationState::*;
        match (self, next) {
            (_, Failed) => true,
            (Failed | Closed, Connecting) => true,
            (Failed, _) => false,
            (_, Closed) => true,
            (Connecting, EnvelopeOpened) => true,
            (EnvelopeOpened, FeaturesReceived) => true,
            (
                FeaturesReceived,
                Encrypting | Authenticating | Binding | Resuming | Established,
            ) => true,
            (Encrypting | Authenticating, EnvelopeOpened) => true,
            (Resuming, Binding | Established) => true,
            (Binding, Established) => true,
            (Established, Closing) => true,
            _ => false,
        }
    }

    /// Whether ordinary traffic can flow.
    pub fn is_established(self) -> bool {
        self == NegotiationState::Established
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// What negotiation has achieved on the current stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionFlags {
    /// The transport is encrypted.
    pub encrypted: bool,
    /// SASL succeeded.
    pub authenticated: bool,
    /// A resource is bound (or was bound on the resumed stream).
    pub bound: bool,
    /// The stream can be resumed after a disconnect.
    pub resumable: bool,
}

/// The next action the driver has to take.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Step {
    StartTls,
    Authenticate,
    Resume,
    Bind,
    StartSession,
    EnableSm,
    Establish,
}

/// Decides the order of negotiation steps.
#[derive(Debug)]
pub(crate) struct Negotiator {
    state: NegotiationState,
    flags: SessionFlags,
    tls: TlsPolicy,
    can_upgrade: bool,
    want_sm: bool,

    /// A previous stream can be resumed and we did not try yet.
    resume_pending: bool,
    session_done: bool,
    sm_done: bool,

    /// The peer demanded encryption in some advertisement.
    encryption_demanded: bool,
}

impl Negotiator {
    pub(crate) fn new(
        tls: TlsPolicy,
        can_upgrade: bool,
        transport_secure: bool,
        want_sm: bool,
        resumable: bool,
    ) -> Self {
        Self {
            state: NegotiationState::Connecting,
            flags: SessionFlags {
                encrypted: transport_secure,
                ..SessionFlags::default()
            },
            tls,
            can_upgrade,
            want_sm,
            resume_pending: resumable,
            session_done: false,
            sm_done: false,
            encryption_demanded: false,
        }
    }

    pub(crate) fn state(&self) -> NegotiationState {
        self.state
    }

    pub(crate) fn flags(&self) -> SessionFlags {
        self.flags
    }

    /// Move to `next`, rejecting transitions outside the handshake and
    /// establishing a stream which skipped a mandatory step.
    pub(crate) fn transition(&mut self, next: NegotiationState) -> Result<(), Error> {
        if !self.state.can_transition_to(next) {
            return Err(ProtocolError::InvalidTransition {
                from: self.state,
                to: next,
            }
            .into());
        }
        if next == NegotiationState::Established {
            self.check_mandatory()?;
        }
        log::debug!("negotiation: {:?} -> {:?}", self.state, next);
        self.state = next;
        Ok(())
    }

    fn check_mandatory(&self) -> Result<(), PolicyViolation> {
        let encryption_mandatory =
            self.encryption_demanded || self.tls == TlsPolicy::Required;
        if encryption_mandatory && !self.flags.encrypted {
            return Err(PolicyViolation::EncryptionRequired);
        }
        if !self.flags.authenticated {
            return Err(PolicyViolation::AuthenticationRequired);
        }
        Ok(())
    }

    /// Decide what to do next with the current advertisement.
    pub(crate) fn next_step(&mut self, features: &super::Features) -> Result<Step, Error> {
        if features.starttls_required {
            self.encryption_demanded = true;
        }

        if !self.flags.encrypted {
            let upgrade = features.starttls && self.can_upgrade;
            match self.tls {
                TlsPolicy::Disabled if self.encryption_demanded => {
                    return Err(PolicyViolation::EncryptionDisabled.into())
                }
                TlsPolicy::Disabled => (),
                TlsPolicy::Required | TlsPolicy::IfAvailable if upgrade => {
                    return Ok(Step::StartTls)
                }
                TlsPolicy::Required => return Err(PolicyViolation::EncryptionRequired.into()),
                TlsPolicy::IfAvailable if self.encryption_demanded => {
                    return Err(PolicyViolation::EncryptionRequired.into())
                }
                TlsPolicy::IfAvailable => (),
            }
        }

        if !self.flags.authenticated {
            if features.can_authenticate() {
                return Ok(Step::Authenticate);
            }
            return Err(PolicyViolation::AuthenticationRequired.into());
        }

        if self.resume_pending {
            self.resume_pending = false;
            if features.stream_management {
                return Ok(Step::Resume);
            }
            log::warn!("Peer is not offering stream management anymore. Dropping state.");
        }

        if !self.flags.bound {
            if features.can_bind() {
                return Ok(Step::Bind);
            }
            return Err(ProtocolError::NoBind.into());
        }

        if features.session_required && !self.session_done {
            return Ok(Step::StartSession);
        }

        if self.want_sm && features.stream_management && !self.sm_done {
            return Ok(Step::EnableSm);
        }

        Ok(Step::Establish)
    }

    pub(crate) fn encrypted(&mut self) {
        self.flags.encrypted = true;
    }

    pub(crate) fn authenticated(&mut self) {
        self.flags.authenticated = true;
    }

    pub(crate) fn bound(&mut self) {
        self.flags.bound = true;
    }

    pub(crate) fn session_started(&mut self) {
        self.session_done = true;
    }

    /// Enabling stream management was attempted, with the given outcome.
    pub(crate) fn sm_negotiated(&mut self, resumable: bool) {
        self.sm_done = true;
        self.flags.resumable = resumable;
    }

    /// The previous stream was resumed: binding and enabling carried over.
    pub(crate) fn resumed(&mut self) {
        self.flags.bound = true;
        self.flags.resumable = true;
        self.session_done = true;
        self.sm_done = true;
    }
}
