// Copyright (c) 2024 Jonas Schäfer <jonas@zombofant.net>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Keep a connection alive
//!
//! This example demonstrates that xmpp_engine will keep a session alive as
//! good as it can, transparently reconnecting on interruptions of the TCP
//! stream and resuming it if the server supports stream management.
//!
//! Pull the network cable (or kill the TCP connection) while it runs and
//! watch the lifecycle events.

use std::env::args;
use std::process::exit;
use std::time::Duration;

use futures::StreamExt;

use xmpp_engine::{
    jid::Jid, KeepaliveConfig, LifecycleEvent, SaslAuthenticator, Session, SessionConfig,
    TcpConnector,
};

#[tokio::main]
async fn main() {
    env_logger::init();

    let args: Vec<String> = args().collect();
    if args.len() != 3 {
        println!("Usage: {} <jid> <password>", args[0]);
        exit(1);
    }
    let jid = Jid::new(&args[1]).expect(&format!("Invalid JID: {}", &args[1]));
    let Some(username) = jid.node().map(|node| node.as_str().to_owned()) else {
        println!("JID must have a local part");
        exit(1);
    };
    let password = &args[2];

    let config = SessionConfig::new(jid).with_keepalive(Some(KeepaliveConfig {
        interval: Duration::new(15, 0),
        reply_timeout: Duration::new(5, 0),
    }));
    let session = Session::new(
        config,
        TcpConnector::for_domain(),
        SaslAuthenticator::new(username, password.clone()),
    );
    let mut events = session.events();
    let mut ping_timer = tokio::time::interval(Duration::new(30, 0));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                log::info!("Interrupted, closing session.");
                break;
            }
            _ = ping_timer.tick() => {
                if !session.state().is_established() {
                    continue;
                }
                match session.ping().await {
                    Ok(rtt) => log::info!("Server answered ping in {:?}", rtt),
                    Err(e) => log::warn!("Ping failed: {}", e),
                }
            }
            event = events.next() => match event {
                Some(LifecycleEvent::Established { bound_jid, resumed }) => {
                    println!("Online at {} (resumed: {})", bound_jid, resumed);
                }
                Some(LifecycleEvent::Closed { reason }) => {
                    println!("Session ended: {}", reason);
                    return;
                }
                Some(event) => println!("event: {:?}", event),
                None => return,
            },
        }
    }

    session.close().await;
}
