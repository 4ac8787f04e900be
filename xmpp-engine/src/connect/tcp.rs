// Copyright (c) 2024 Jonas Schäfer <jonas@zombofant.net>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! `TcpConnector` provides plain TCP transports, with STARTTLS through
//! rustls when the `tls-rust` feature is enabled.

use std::io;

use tokio::net::TcpStream;

#[cfg(feature = "tls-rust")]
use {
    std::sync::Arc,
    tokio_rustls::{
        rustls::pki_types::ServerName,
        rustls::{ClientConfig, RootCertStore},
        TlsConnector,
    },
};

use crate::connect::{AsyncReadAndWrite, Connector};
use crate::error::{CollaboratorFailure, Error};

/// Default port for client-to-server connections
pub const DEFAULT_PORT: u16 = 5222;

/// Connect via TCP to a fixed host and port
///
/// Without the `tls-rust` feature this connector cannot encrypt, so it
/// should only be used over localhost or together with
/// [`TlsPolicy::Disabled`][`crate::config::TlsPolicy::Disabled`].
#[derive(Debug, Clone)]
pub struct TcpConnector {
    host: Option<String>,
    port: u16,
}

impl TcpConnector {
    /// Connect to `host:port` regardless of the JID's domain.
    pub fn new<H: Into<String>>(host: H, port: u16) -> Self {
        Self {
            host: Some(host.into()),
            port,
        }
    }

    /// Connect to the JID's domain on the default port.
    pub fn for_domain() -> Self {
        Self {
            host: None,
            port: DEFAULT_PORT,
        }
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::for_domain()
    }
}

impl Connector for TcpConnector {
    type Stream = Box<dyn AsyncReadAndWrite>;

    async fn connect(&self, domain: &str) -> Result<Self::Stream, Error> {
        let host = self.host.as_deref().unwrap_or(domain);
        log::debug!("connecting to {}:{}", host, self.port);
        let stream = TcpStream::connect((host, self.port))
            .await
            .map_err(CollaboratorFailure::Connect)?;
        stream
            .set_nodelay(true)
            .map_err(CollaboratorFailure::Connect)?;
        Ok(Box::new(stream))
    }

    fn can_upgrade_security(&self) -> bool {
        cfg!(feature = "tls-rust")
    }

    #[cfg(feature = "tls-rust")]
    async fn upgrade_security(
        &self,
        stream: Self::Stream,
        domain: &str,
    ) -> Result<Self::Stream, Error> {
        let domain = ServerName::try_from(domain.to_owned())
            .map_err(|e| CollaboratorFailure::Tls(io::Error::new(io::ErrorKind::InvalidInput, e)))?;
        let mut root_store = RootCertStore::empty();
        root_store.add_parsable_certificates(
            rustls_native_certs::load_native_certs().map_err(CollaboratorFailure::Tls)?,
        );
        let config = ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();
        let tls_stream = TlsConnector::from(Arc::new(config))
            .connect(domain, stream)
            .await
            .map_err(CollaboratorFailure::Tls)?;
        Ok(Box::new(tls_stream))
    }

    #[cfg(not(feature = "tls-rust"))]
    async fn upgrade_security(
        &self,
        _stream: Self::Stream,
        _domain: &str,
    ) -> Result<Self::Stream, Error> {
        Err(CollaboratorFailure::Tls(io::Error::new(
            io::ErrorKind::Unsupported,
            "built without TLS support",
        ))
        .into())
    }
}
