// Copyright (c) 2024 Jonas Schäfer <jonas@zombofant.net>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Single-writer send path.
//!
//! All writes to the transport go through one async mutex, so every element
//! hits the wire in one piece. Stream management accounting happens under
//! the same lock, which keeps the outbound counter in step with the bytes
//! actually written.

use std::io;
use std::sync::Arc;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, Notify};

use crate::element::element_to_bytes;
use crate::error::Error;
use crate::stanza::Stanza;
use crate::stream_management::{self, QueueEntry, SmState};

pub(crate) type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Default number of unacknowledged stanzas after which `<r/>` is sent.
pub(crate) const DEFAULT_ACK_THRESHOLD: usize = 5;

#[derive(Default)]
struct OutboundState {
    writer: Option<BoxedWriter>,
    sm: Option<SmState>,

    /// Signalled when a write fails, so that the inbound worker can tear
    /// down this connection.
    broken: Option<Arc<Notify>>,
}

pub(crate) struct Outbound {
    state: Mutex<OutboundState>,
    ack_threshold: usize,
}

impl Default for Outbound {
    fn default() -> Self {
        Self::new(DEFAULT_ACK_THRESHOLD)
    }
}

async fn write_flush(writer: &mut BoxedWriter, bytes: &[u8]) -> io::Result<()> {
    writer.write_all(bytes).await?;
    writer.flush().await
}

impl Outbound {
    pub(crate) fn new(ack_threshold: usize) -> Self {
        Self {
            state: Mutex::new(OutboundState::default()),
            ack_threshold,
        }
    }

    /// Install the write half of a freshly established stream.
    ///
    /// Returns a notifier which fires if a write on this stream fails.
    pub(crate) async fn attach(&self, writer: BoxedWriter, sm: Option<SmState>) -> Arc<Notify> {
        let broken = Arc::new(Notify::new());
        let mut state = self.state.lock().await;
        state.writer = Some(writer);
        state.sm = sm;
        state.broken = Some(broken.clone());
        broken
    }

    /// Remove the writer, returning the stream management state for a later
    /// resumption attempt.
    pub(crate) async fn detach(&self) -> Option<SmState> {
        let mut state = self.state.lock().await;
        if let Some(mut writer) = state.writer.take() {
            // best effort, the stream is going away anyway
            let _ = writer.shutdown().await;
        }
        state.broken = None;
        state.sm.take()
    }

    /// Serialize and write a stanza.
    ///
    /// With stream management, the stanza stays queued until the peer
    /// acknowledges it.
    pub(crate) async fn send_stanza(&self, stanza: Arc<Stanza>) -> Result<(), Error> {
        let entry = QueueEntry::new(stanza);
        let mut state = self.state.lock().await;
        write_locked(&mut state, &entry.bytes).await?;
        let wants_ack = match state.sm.as_mut() {
            Some(sm) => {
                sm.enqueue(entry);
                let wants_ack = sm.wants_ack_request(self.ack_threshold);
                if wants_ack {
                    sm.pending_req = true;
                }
                wants_ack
            }
            None => false,
        };
        if wants_ack {
            let request = element_to_bytes(&stream_management::request_element());
            if let Err(e) = write_locked(&mut state, &request).await {
                // The stanza itself went out and is queued for resumption.
                log::debug!("failed to request ack: {}", e);
            }
        }
        Ok(())
    }

    /// Write pre-serialized bytes which are not counted by stream management
    /// (nonzas, the stream footer).
    pub(crate) async fn send_raw(&self, bytes: &[u8]) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        write_locked(&mut state, bytes).await
    }

    /// Run `f` on the stream management state, if enabled.
    pub(crate) async fn with_sm<R>(&self, f: impl FnOnce(&mut SmState) -> R) -> Option<R> {
        self.state.lock().await.sm.as_mut().map(f)
    }
}

async fn write_locked(state: &mut OutboundState, bytes: &[u8]) -> Result<(), Error> {
    let Some(writer) = state.writer.as_mut() else {
        return Err(Error::NotConnected);
    };
    log::trace!("SEND {}", String::from_utf8_lossy(bytes));
    if let Err(e) = write_flush(writer, bytes).await {
        state.writer = None;
        if let Some(ref broken) = state.broken {
            broken.notify_one();
        }
        return Err(e.into());
    }
    Ok(())
}
