//! Stock middleware stages.

pub mod crypt;
pub mod headers;
pub mod log;
pub mod routes;

pub use crypt::{Crypt, CryptError, PUBLIC_KEY_METADATA};
pub use headers::{HeaderError, Headers};
pub use log::Log;
pub use routes::{routed_message, RouteHandler, Routes, RoutingTable, ROUTE_ANNOTATION};

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::mpsc;
    use tokio::time::timeout;

    use super::*;
    use crate::message::Message;
    use crate::middleware::StageList;
    use crate::peer::{Peer, PeerEvent, PeerOptions};
    use crate::transport::Connection;
    use crate::wire::{self, DEFAULT_MAX_FRAME_LEN};

    #[tokio::test]
    async fn routed_message_reaches_handler_and_subscribers() {
        let (handled_tx, mut handled_rx) = mpsc::unbounded_channel();
        let table = RoutingTable::new().route("chat", move |_peer, msg: Message| {
            let _ = handled_tx.send(msg.payload_string());
        });
        let stages = StageList::builder()
            .stage("routes", Routes::new(table))
            .stage("headers", Headers)
            .stage("log", Log)
            .build();

        let (local, mut remote) = tokio::io::duplex(4096);
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let peer = Peer::spawn(
            Connection::from_stream(local, "local", "remote"),
            Arc::new(stages),
            events_tx,
            PeerOptions::default(),
        );

        let outgoing = routed_message("chat", "over the wire");
        let framed = headers::wrap(outgoing.annotations(), outgoing.payload()).unwrap();
        wire::write_frame(&mut remote, &framed, DEFAULT_MAX_FRAME_LEN)
            .await
            .unwrap();

        let handled = timeout(Duration::from_secs(5), handled_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(handled, "over the wire");
        match timeout(Duration::from_secs(5), events.recv()).await.unwrap().unwrap() {
            PeerEvent::Delivered { message, .. } => {
                assert_eq!(message.payload(), b"over the wire");
                assert_eq!(
                    message.annotations().get(ROUTE_ANNOTATION).map(String::as_str),
                    Some("chat")
                );
            }
            other => panic!("unexpected event {other:?}"),
        }

        peer.send(routed_message("chat", "back")).await.unwrap();
        let frame = timeout(
            Duration::from_secs(5),
            wire::read_frame(&mut remote, DEFAULT_MAX_FRAME_LEN),
        )
        .await
        .unwrap()
        .unwrap();
        let (annotations, body) = headers::unwrap(&frame).unwrap();
        assert_eq!(body, b"back");
        assert_eq!(annotations.get(ROUTE_ANNOTATION).map(String::as_str), Some("chat"));
        peer.stop().await;
    }
}
