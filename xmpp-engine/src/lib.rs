//! Client-side [XMPP](https://xmpp.org/) stream engine with asynchronous I/O using [tokio](https://tokio.rs/).
//!
//! The engine turns a byte transport into a long-lived, self-healing
//! session: it tokenizes the stream incrementally, negotiates it
//! (STARTTLS, SASL, resource binding, stream management), routes inbound
//! stanzas to collectors and listeners, watches the connection for
//! liveness, and reconnects with backoff, resuming the previous stream
//! where the server allows it.
//!
//! # Getting started
//!
//! Create a [`Session`] with a [`SessionConfig`], a [`Connector`] for the
//! transport and an [`Authenticator`]. The session connects in the
//! background:
//!
//! ```no_run
//! use xmpp_engine::{jid::Jid, SaslAuthenticator, Session, SessionConfig, TcpConnector};
//!
//! # async fn run() -> Result<(), xmpp_engine::Error> {
//! let jid = Jid::new("juliet@example.org")?;
//! let session = Session::new(
//!     SessionConfig::new(jid),
//!     TcpConnector::for_domain(),
//!     SaslAuthenticator::new("juliet", "r0m30"),
//! );
//! session.wait_established().await?;
//! let rtt = session.ping().await?;
//! println!("server answered in {:?}", rtt);
//! session.close().await;
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! - `tls-rust`: STARTTLS for [`TcpConnector`] using rustls with the
//!   platform's root certificates. Without it, only
//!   [`TlsPolicy::Disabled`] and [`TlsPolicy::IfAvailable`] can connect
//!   through the bundled connector.

#![deny(unsafe_code, missing_docs, bare_trait_objects)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub mod auth;
mod config;
pub mod connect;
mod element;
/// Detailed error types
pub mod error;
pub mod filter;
mod keepalive;
pub mod negotiation;
pub mod ns;
pub mod reconnect;
pub mod router;
mod session;
pub mod stanza;
mod stream_management;
pub mod tokenizer;

#[cfg(test)]
mod testutil;

pub use auth::{Authenticator, SaslAuthenticator};
pub use config::{KeepaliveConfig, SessionConfig, TlsPolicy, UnparsablePolicy};
pub use connect::{Connector, TcpConnector};
#[doc(inline)]
/// Generic xmpp_engine Error
pub use error::Error;
pub use filter::StanzaFilter;
pub use negotiation::{Features, NegotiationState, SessionFlags};
pub use reconnect::{ReconnectPolicy, ReconnectStrategy, SupervisorState};
pub use router::{
    Collector, CollectorError, CollectorHandle, ListenerHandle, Router, Subscription,
    LISTENER_BACKLOG_WARNING,
};
pub use session::{CloseReason, LifecycleEvent, LifecycleListener, Session};
pub use stanza::{Stanza, StanzaError, StanzaKind, StanzaParseError};
pub use stream_management::SmError;

// Re-exports
pub use jid;
pub use minidom;
