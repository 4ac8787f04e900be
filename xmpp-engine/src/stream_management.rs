// Copyright (c) 2019 Emmanuel Gil Peyrot <linkmauve@linkmauve.fr>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! XEP-0198 bookkeeping: stanza counters and the retransmission queue.

use core::fmt;
use std::collections::{vec_deque, VecDeque};
use std::error::Error as StdError;
use std::sync::Arc;

use bytes::Bytes;
use minidom::Element;

use crate::ns;
use crate::stanza::Stanza;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SmResumeInfo {
    NotResumable,
    Resumable {
        /// XEP-0198 stream ID
        id: String,

        /// Preferred IP and port for resumption as indicated by the peer.
        location: Option<String>,
    },
}

/// A sent stanza awaiting acknowledgement.
#[derive(Debug, Clone)]
pub(crate) struct QueueEntry {
    /// The stanza as it was handed to ack listeners.
    pub stanza: Arc<Stanza>,

    /// Its serialized form, retransmitted on resumption.
    pub bytes: Bytes,
}

impl QueueEntry {
    pub fn new(stanza: Arc<Stanza>) -> Self {
        Self {
            bytes: Bytes::from(stanza.to_bytes()),
            stanza,
        }
    }
}

/// State for stream management
pub(crate) struct SmState {
    /// Last value seen from the remote stanza counter.
    outbound_base: u32,

    /// Counter for received stanzas
    inbound_ctr: u32,

    /// Flag indicating that a `<sm:r/>` is in flight.
    pub(crate) pending_req: bool,

    /// Information about resumability of the stream
    resumption: SmResumeInfo,

    /// Unacked stanzas in the order they were sent
    unacked_stanzas: VecDeque<QueueEntry>,
}

impl fmt::Debug for SmState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SmState")
            .field("outbound_base", &self.outbound_base)
            .field("inbound_ctr", &self.inbound_ctr)
            .field("resumption", &self.resumption)
            .field("len(unacked_stanzas)", &self.unacked_stanzas.len())
            .finish()
    }
}

/// The peer's acknowledgement counter does not fit our queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmError {
    /// The peer claims to have handled stanzas we never sent.
    RemoteAckedMoreStanzas {
        /// Counter value of the first queued stanza.
        local_base: u32,
        /// Number of queued stanzas.
        queue_len: u32,
        /// Counter sent by the peer.
        remote_ctr: u32,
    },
    /// The peer's counter is lower than in a previous acknowledgement.
    RemoteAckWentBackwards {
        /// Counter value of the first queued stanza.
        local_base: u32,
        /// Number of queued stanzas.
        queue_len: u32,
        /// Counter sent by the peer.
        remote_ctr: u32,
    },
}

impl fmt::Display for SmError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::RemoteAckedMoreStanzas {
                local_base,
                queue_len,
                remote_ctr,
            } => {
                let local_tip = local_base.wrapping_add(*queue_len);
                write!(f, "remote acked more stanzas than we sent: remote counter = {}. queue covers range {}..<{}", remote_ctr, local_base, local_tip)
            }
            Self::RemoteAckWentBackwards {
                local_base,
                remote_ctr,
                ..
            } => {
                write!(f, "remote acked less stanzas than before: remote counter = {}, local queue starts at {}", remote_ctr, local_base)
            }
        }
    }
}

impl StdError for SmError {}

impl SmState {
    /// Initialize stream management state from an `<enabled/>` nonza.
    pub fn from_enabled(enabled: &Element) -> Self {
        let resume = matches!(enabled.attr("resume"), Some("true" | "1"));
        let resumption = if resume {
            match enabled.attr("id") {
                Some(id) => SmResumeInfo::Resumable {
                    location: enabled.attr("location").map(ToOwned::to_owned),
                    id: id.to_owned(),
                },
                None => {
                    log::warn!("peer replied with <enable resume='true'/>, but without an ID! cannot make this stream resumable.");
                    SmResumeInfo::NotResumable
                }
            }
        } else {
            SmResumeInfo::NotResumable
        };

        Self {
            outbound_base: 0,
            inbound_ctr: 0,
            pending_req: false,
            resumption,
            unacked_stanzas: VecDeque::new(),
        }
    }

    /// Mark a stanza as sent and keep it in the stream management queue.
    pub fn enqueue(&mut self, entry: QueueEntry) {
        // The counters wrap at 2^32 and are compared using RFC 1982 serial
        // number arithmetic, so anything beyond half of that number space
        // would be ambiguous on resumption.
        const MAX_QUEUE_SIZE: usize = (u32::MAX / 2 - 1) as usize;
        if self.unacked_stanzas.len() >= MAX_QUEUE_SIZE {
            log::warn!("stream management queue is full, dropping the oldest stanza");
            self.unacked_stanzas.pop_front();
            self.outbound_base = self.outbound_base.wrapping_add(1);
        }

        self.unacked_stanzas.push_back(entry);
        log::trace!(
            "Stored stanza in SmState. We are now at {} unacked stanzas.",
            self.unacked_stanzas.len()
        );
    }

    /// Number of stanzas not yet acknowledged by the peer.
    #[cfg(test)]
    pub fn unacked(&self) -> usize {
        self.unacked_stanzas.len()
    }

    /// Process resumption.
    ///
    /// Updates the internal state according to the received remote counter.
    /// Returns the stanzas the peer acknowledged with `h` and an iterator
    /// which yields the stanzas which need to be retransmitted.
    #[allow(clippy::type_complexity)]
    pub fn resume(
        &mut self,
        h: u32,
    ) -> Result<(Vec<Arc<Stanza>>, vec_deque::Drain<'_, QueueEntry>), SmError> {
        let acked = self.remote_acked(h)?;
        self.pending_req = false;
        // The peer has not seen any of the leftover stanzas. They are
        // retransmitted, which counts them again from the current base.
        Ok((acked, self.unacked_stanzas.drain(..)))
    }

    /// Process remote `<a/>`
    ///
    /// Returns the stanzas which left the queue, oldest first.
    pub fn remote_acked(&mut self, h: u32) -> Result<Vec<Arc<Stanza>>, SmError> {
        log::debug!("remote_acked: {self:?}::remote_acked({h})");
        self.pending_req = false;
        // XEP-0198 specifies that counters are mod 2^32, which is handy when
        // you use u32 data types :-).
        let to_drop = h.wrapping_sub(self.outbound_base) as usize;
        if to_drop == 0 {
            log::trace!("remote_acked: no stanzas to drop");
            return Ok(Vec::new());
        }
        if to_drop > self.unacked_stanzas.len() {
            let err = if to_drop as u32 > u32::MAX / 2 {
                // A wrapping difference greater than half the number space
                // is a negative difference, i.e. h went backwards.
                SmError::RemoteAckWentBackwards {
                    local_base: self.outbound_base,
                    queue_len: self.unacked_stanzas.len() as u32,
                    remote_ctr: h,
                }
            } else {
                SmError::RemoteAckedMoreStanzas {
                    local_base: self.outbound_base,
                    queue_len: self.unacked_stanzas.len() as u32,
                    remote_ctr: h,
                }
            };
            return Err(err);
        }
        let acked = self
            .unacked_stanzas
            .drain(..to_drop)
            .map(|entry| entry.stanza)
            .collect();
        self.outbound_base = h;
        log::debug!("remote_acked: remote acked {to_drop} stanzas");
        Ok(acked)
    }

    /// Count one handled inbound stanza.
    pub fn count_inbound(&mut self) {
        self.inbound_ctr = self.inbound_ctr.wrapping_add(1);
    }

    /// Get the current inbound counter.
    #[inline(always)]
    pub fn inbound_ctr(&self) -> u32 {
        self.inbound_ctr
    }

    /// Whether an `<r/>` should be sent now.
    pub fn wants_ack_request(&self, threshold: usize) -> bool {
        !self.pending_req && self.unacked_stanzas.len() >= threshold
    }

    /// Get the info necessary for resumption.
    ///
    /// Returns the stream ID and the current inbound counter if resumption is
    /// available and None otherwise.
    pub fn resume_info(&self) -> Option<(&str, u32)> {
        match self.resumption {
            SmResumeInfo::Resumable { ref id, .. } => Some((id, self.inbound_ctr)),
            SmResumeInfo::NotResumable => None,
        }
    }

    /// Whether the peer allowed resumption of this stream.
    pub fn is_resumable(&self) -> bool {
        self.resume_info().is_some()
    }
}

/// `<enable resume='true'/>`
pub(crate) fn enable_element() -> Element {
    Element::builder("enable", ns::SM).attr("resume", "true").build()
}

/// `<resume previd='…' h='…'/>`
pub(crate) fn resume_element(previd: &str, h: u32) -> Element {
    Element::builder("resume", ns::SM)
        .attr("previd", previd)
        .attr("h", h.to_string())
        .build()
}

/// `<a h='…'/>`
pub(crate) fn ack_element(h: u32) -> Element {
    Element::builder("a", ns::SM).attr("h", h.to_string()).build()
}

/// `<r/>`
pub(crate) fn request_element() -> Element {
    Element::builder("r", ns::SM).build()
}

/// Read the `h` attribute of `<a/>`, `<resumed/>` or `<failed/>`.
pub(crate) fn parse_h(elem: &Element) -> Option<u32> {
    elem.attr("h")?.parse().ok()
}
