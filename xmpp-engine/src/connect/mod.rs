// Copyright (c) 2024 Jonas Schäfer <jonas@zombofant.net>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! `Connector` provides byte streams for sessions

use core::future::Future;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::Error;

mod tcp;
pub use tcp::TcpConnector;

/// Byte stream a [`Connector`] produces
pub trait AsyncReadAndWrite: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncReadAndWrite for T {}

/// Opens transports, perhaps called multiple times for one session.
///
/// The session runs the XML stream on top of whatever this returns; the
/// connector only deals with bytes.
pub trait Connector: Clone + Send + Sync + 'static {
    /// The type of stream this connector produces
    type Stream: AsyncReadAndWrite + 'static;

    /// Open a new transport to the server of `domain`.
    fn connect(&self, domain: &str) -> impl Future<Output = Result<Self::Stream, Error>> + Send;

    /// Whether [`Connector::upgrade_security`] is supported at all.
    fn can_upgrade_security(&self) -> bool {
        false
    }

    /// Upgrade the transport in place after `<proceed/>`.
    ///
    /// No bytes have been read beyond `<proceed/>` when this is called.
    fn upgrade_security(
        &self,
        stream: Self::Stream,
        domain: &str,
    ) -> impl Future<Output = Result<Self::Stream, Error>> + Send;

    /// Whether transports are already confidential without STARTTLS, e.g.
    /// because they use direct TLS or a local socket.
    fn is_secure(&self) -> bool {
        false
    }
}
