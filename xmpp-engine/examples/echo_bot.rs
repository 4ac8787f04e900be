use std::env::args;
use std::process::exit;

use xmpp_engine::{
    filter::TypeFilter, jid::Jid, minidom::Element, ns, LifecycleEvent, SaslAuthenticator,
    Session, SessionConfig, Stanza, StanzaKind, TcpConnector,
};

use futures::StreamExt;

#[tokio::main]
async fn main() {
    env_logger::init();

    let args: Vec<String> = args().collect();
    if args.len() != 3 {
        println!("Usage: {} <jid> <password>", args[0]);
        exit(1);
    }
    let jid = Jid::new(&args[1]).expect(&format!("Invalid JID: {}", &args[1]));
    let username = jid
        .node()
        .map(|node| node.as_str().to_owned())
        .unwrap_or_default();
    let password = &args[2];

    // Session instance
    let session = Session::new(
        SessionConfig::new(jid),
        TcpConnector::for_domain(),
        SaslAuthenticator::new(username, password.clone()),
    );
    let mut events = session.events();
    let mut messages = session.subscribe(TypeFilter::new(StanzaKind::Message, Some("chat")));

    loop {
        tokio::select! {
            event = events.next() => match event {
                Some(LifecycleEvent::Established { bound_jid, resumed }) => {
                    println!("Online at {}", bound_jid);
                    if !resumed {
                        session.send(&make_presence()).await.unwrap();
                    }
                }
                Some(LifecycleEvent::Closed { .. }) | None => break,
                Some(_) => (),
            },
            Some(message) = messages.next() => {
                let body = message
                    .payload("body", ns::JABBER_CLIENT)
                    .map(Element::text);
                match (message.from.clone(), body) {
                    (Some(ref from), Some(ref body)) if body == "die" => {
                        println!("Secret die command triggered by {}", from);
                        break;
                    }
                    (Some(from), Some(body)) => {
                        // This is a message we'll echo
                        session.send(&Stanza::chat(from, &body)).await.unwrap();
                    }
                    _ => {}
                }
            }
        }
    }

    session.close().await;
}

// Construct a <presence/>
fn make_presence() -> Stanza {
    Stanza::presence(None)
        .with_payload(
            Element::builder("show", ns::JABBER_CLIENT)
                .append(String::from("chat"))
                .build(),
        )
        .with_payload(
            Element::builder("status", ns::JABBER_CLIENT)
                .append(String::from("Echoing messages."))
                .build(),
        )
}
