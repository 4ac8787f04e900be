// Copyright (c) 2025 Jonas Schäfer <jonas@zombofant.net>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! # Liveness watchdog
//!
//! The watchdog tracks when the peer last sent anything. After
//! [`KeepaliveConfig::interval`] of silence it sends an XEP-0199 ping as an
//! ordinary request, through the [`Router`]. Any inbound traffic, not only
//! the ping reply, counts as proof of life.
//!
//! If neither the reply nor any other traffic arrives within
//! [`KeepaliveConfig::reply_timeout`], the failure callback runs once. The
//! watchdog does not tear the stream down; it stays quiet until traffic
//! flows again.

use std::sync::Arc;

use jid::Jid;
use minidom::Element;
use tokio::sync::watch;
use tokio::time::{self, Instant};

use crate::config::KeepaliveConfig;
use crate::filter::ReplyFilter;
use crate::ns;
use crate::router::{CollectorError, ListenerHandle, Router};
use crate::stanza::{Stanza, StanzaKind};

/// Build a ping to our server with a fresh id, along with the filter
/// matching its reply.
///
/// The server may answer without `from`.
pub(crate) fn ping_request(router: &Router, server: Option<Jid>) -> (Stanza, ReplyFilter) {
    let id = router.next_id();
    let mut ping = Stanza::iq_get(Element::builder("ping", ns::PING).build()).with_id(id.clone());
    ping.to = server.clone();
    let filter = match server {
        Some(server) => ReplyFilter::new(id, Some(server.clone())).with_account(None, server),
        None => ReplyFilter::new(id, None),
    };
    (ping, filter)
}

fn is_ping(stanza: &Stanza) -> bool {
    stanza.kind == StanzaKind::Iq
        && stanza.type_.as_deref() == Some("get")
        && stanza.payload("ping", ns::PING).is_some()
}

/// Answer inbound pings with an empty result.
pub(crate) fn register_ping_responder(router: &Router) -> ListenerHandle {
    let sender = router.clone();
    router.register_listener(is_ping, move |ping: Arc<Stanza>| {
        let sender = sender.clone();
        tokio::spawn(async move {
            if let Err(e) = sender.send(&Stanza::result_for(&ping)).await {
                log::debug!("Failed to answer ping: {}", e);
            }
        });
    })
}

enum PingOutcome {
    /// The ping was answered.
    Answered,
    /// Something else arrived while waiting.
    Traffic,
    /// Nothing arrived in time.
    TimedOut,
    /// The stream or the session went away.
    Gone,
}

async fn send_ping(
    router: &Router,
    server: &Option<Jid>,
    config: &KeepaliveConfig,
    activity: &mut watch::Receiver<Instant>,
) -> PingOutcome {
    let (ping, filter) = ping_request(router, server.clone());
    let reply = router.register_collector(filter, config.reply_timeout);
    if let Err(e) = router.send(&ping).await {
        log::debug!("Could not send keepalive ping: {}", e);
        return PingOutcome::Gone;
    }
    log::trace!("Sent keepalive ping {:?}", ping.id);
    // Traffic counted before the ping went out must not cancel it.
    activity.mark_unchanged();

    tokio::select! {
        result = reply => match result {
            Ok(_) => PingOutcome::Answered,
            Err(CollectorError::Timeout) => PingOutcome::TimedOut,
            Err(_) => PingOutcome::Gone,
        },
        changed = activity.changed() => match changed {
            Ok(()) => PingOutcome::Traffic,
            Err(_) => PingOutcome::Gone,
        },
    }
}

/// Run the watchdog until the `activity` sender goes away or the stream
/// stops accepting writes.
///
/// `activity` carries the instant of the most recent inbound traffic.
/// `on_failure` is invoked when a ping went unanswered.
pub(crate) async fn run<F>(
    router: Router,
    server: Option<Jid>,
    config: KeepaliveConfig,
    mut activity: watch::Receiver<Instant>,
    on_failure: F,
) where
    F: Fn() + Send,
{
    let mut last_seen = *activity.borrow_and_update();
    loop {
        let deadline = last_seen + config.interval;
        tokio::select! {
            _ = time::sleep_until(deadline) => (),
            changed = activity.changed() => {
                if changed.is_err() {
                    return;
                }
                last_seen = last_seen.max(*activity.borrow_and_update());
                continue;
            }
        }

        match send_ping(&router, &server, &config, &mut activity).await {
            PingOutcome::Answered => last_seen = Instant::now(),
            PingOutcome::Traffic => last_seen = last_seen.max(*activity.borrow_and_update()),
            PingOutcome::Gone => return,
            PingOutcome::TimedOut => {
                log::warn!(
                    "No reply to keepalive ping within {:?}.",
                    config.reply_timeout
                );
                on_failure();
                // Report once, then wait for the peer to come back.
                if activity.changed().await.is_err() {
                    return;
                }
                last_seen = *activity.borrow_and_update();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use core::time::Duration;

    use tokio::io::{AsyncReadExt, DuplexStream};
    use tokio::sync::mpsc;

    use super::*;
    use crate::element::{StreamItem, XmlFrames};
    use crate::router::outbound::Outbound;

    const HEADER: &[u8] = b"<stream:stream xmlns='jabber:client' \
        xmlns:stream='http://etherx.jabber.org/streams'>";

    struct Wire {
        server: DuplexStream,
        frames: XmlFrames,
    }

    impl Wire {
        async fn recv(&mut self) -> Stanza {
            let mut buf = [0u8; 4096];
            loop {
                while let Some(item) = self.frames.next_item().unwrap() {
                    if let StreamItem::Element(elem) = item {
                        return Stanza::try_from(elem).unwrap();
                    }
                }
                let n = self.server.read(&mut buf).await.unwrap();
                assert!(n > 0, "client closed the stream");
                self.frames.push(&buf[..n]);
            }
        }
    }

    async fn attached_router() -> (Router, Wire) {
        let router = Router::with_outbound(Outbound::default());
        let (client, server) = tokio::io::duplex(65536);
        router.outbound().attach(Box::new(client), None).await;
        let mut frames = XmlFrames::default();
        frames.push(HEADER);
        (router, Wire { server, frames })
    }

    fn config() -> KeepaliveConfig {
        KeepaliveConfig {
            interval: Duration::from_secs(60),
            reply_timeout: Duration::from_secs(30),
        }
    }

    fn server() -> Option<Jid> {
        Some(Jid::new("example.org").unwrap())
    }

    fn answer(ping: &Stanza) -> Arc<Stanza> {
        let mut reply = Stanza::result_for(ping);
        reply.from = server();
        Arc::new(reply)
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_ping_fails_once() {
        let (router, mut wire) = attached_router().await;
        let (activity_tx, activity) = watch::channel(Instant::now());
        let (failed_tx, mut failed) = mpsc::unbounded_channel();
        let start = Instant::now();
        tokio::spawn(run(router, server(), config(), activity, move || {
            failed_tx.send(()).unwrap();
        }));

        let ping = wire.recv().await;
        assert!(is_ping(&ping));
        assert_eq!(ping.to, server());
        assert_eq!(start.elapsed(), Duration::from_secs(60));

        failed.recv().await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_secs(90));

        // no second report while the peer stays silent
        assert!(time::timeout(Duration::from_secs(600), failed.recv())
            .await
            .is_err());
        drop(activity_tx);
    }

    #[tokio::test(start_paused = true)]
    async fn answered_ping_resets_interval() {
        let (router, mut wire) = attached_router().await;
        let (_activity_tx, activity) = watch::channel(Instant::now());
        let (failed_tx, mut failed) = mpsc::unbounded_channel();
        let start = Instant::now();
        tokio::spawn(run(router.clone(), server(), config(), activity, move || {
            failed_tx.send(()).unwrap();
        }));

        let ping = wire.recv().await;
        time::sleep(Duration::from_secs(10)).await;
        assert_eq!(router.dispatch(answer(&ping)).collectors, 1);

        let second = wire.recv().await;
        assert_ne!(second.id, ping.id);
        assert_eq!(start.elapsed(), Duration::from_secs(130));
        assert!(failed.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn server_reply_without_from_counts() {
        let (router, mut wire) = attached_router().await;
        let (_activity_tx, activity) = watch::channel(Instant::now());
        let (failed_tx, mut failed) = mpsc::unbounded_channel();
        tokio::spawn(run(router.clone(), server(), config(), activity, move || {
            failed_tx.send(()).unwrap();
        }));

        let ping = wire.recv().await;
        let reply = Stanza::result_for(&ping);
        assert_eq!(reply.from, None);
        assert_eq!(router.dispatch(Arc::new(reply)).collectors, 1);

        // a third party cannot answer in the server's name
        let next = wire.recv().await;
        let mut spoofed = Stanza::result_for(&next);
        spoofed.from = Some(Jid::new("mallory@example.org/x").unwrap());
        assert_eq!(router.dispatch(Arc::new(spoofed)).collectors, 0);
        failed.recv().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn traffic_cancels_pending_ping() {
        let (router, mut wire) = attached_router().await;
        let (activity_tx, activity) = watch::channel(Instant::now());
        let (failed_tx, mut failed) = mpsc::unbounded_channel();
        tokio::spawn(run(router.clone(), server(), config(), activity, move || {
            failed_tx.send(()).unwrap();
        }));

        let ping = wire.recv().await;
        time::sleep(Duration::from_secs(20)).await;
        activity_tx.send(Instant::now()).unwrap();

        // the late reply finds no collector anymore
        time::sleep(Duration::from_secs(20)).await;
        assert_eq!(router.dispatch(answer(&ping)).collectors, 0);
        assert!(failed.try_recv().is_err());

        let next = wire.recv().await;
        assert!(is_ping(&next));
    }

    #[tokio::test(start_paused = true)]
    async fn traffic_defers_ping() {
        let (router, mut wire) = attached_router().await;
        let (activity_tx, activity) = watch::channel(Instant::now());
        let start = Instant::now();
        tokio::spawn(run(router, server(), config(), activity, || ()));

        time::sleep(Duration::from_secs(45)).await;
        activity_tx.send(Instant::now()).unwrap();

        wire.recv().await;
        assert_eq!(start.elapsed(), Duration::from_secs(105));
    }

    #[tokio::test]
    async fn responder_answers_pings() {
        let (router, mut wire) = attached_router().await;
        let _responder = register_ping_responder(&router);

        let mut ping = Stanza::iq_get(Element::builder("ping", ns::PING).build()).with_id("p1");
        ping.from = server();
        assert_eq!(router.dispatch(Arc::new(ping)).listeners, 1);

        let reply = wire.recv().await;
        assert_eq!(reply.type_.as_deref(), Some("result"));
        assert_eq!(reply.id.as_deref(), Some("p1"));
        assert_eq!(reply.to, server());
        assert!(reply.payloads.is_empty());
    }
}
