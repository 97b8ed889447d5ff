#![cfg(all(feature = "codec", feature = "sync"))]

mod common;

use std::time::Duration;

use bytes::Bytes;
use deadline::deadline;
use portal_dht::{
    message::{ContentPayload, FindContent, Message},
    traits::{ContentStore, PeerMessenger},
    Id,
};
use rand::{thread_rng, Rng};

use crate::common::Network;

fn random_content(len: usize) -> Bytes {
    let mut rng = thread_rng();
    Bytes::from((0..len).map(|_| rng.gen()).collect::<Vec<u8>>())
}

#[tokio::test]
async fn find_content_streams_large_content() {
    // common::enable_tracing();

    let network = Network::new();
    let requester = network.add_node(Id::rand());
    let holder = network.add_node(Id::rand());

    let content_key = Bytes::from_static(b"large");
    let content = random_content(20_000);
    holder.store.put(content_key.clone(), content.clone());

    let response = requester
        .messenger
        .send_request(
            &holder.enr,
            Message::FindContent(FindContent {
                nonce: 1,
                content_key,
            }),
        )
        .await
        .unwrap();

    let connection_id = match response {
        Message::Content(content) => match content.payload {
            ContentPayload::ConnectionId(connection_id) => connection_id,
            payload => panic!("unexpected payload: {:?}", payload),
        },
        response => panic!("unexpected response: {:?}", response),
    };

    let streamed = requester
        .utp
        .connect_read(holder.enr, connection_id)
        .await
        .unwrap();
    assert_eq!(streamed, content);

    // Both sides release their sockets, the reader once it stopped lingering.
    let requester_utp = requester.utp.clone();
    let holder_utp = holder.utp.clone();
    deadline!(Duration::from_secs(5), move || {
        requester_utp.active_connections() == 0 && holder_utp.active_connections() == 0
    });
}

#[tokio::test]
async fn offer_streams_accepted_items() {
    let network = Network::new();
    let offerer = network.add_node(Id::rand());
    let receiver = network.add_node(Id::rand());

    let held_key = Bytes::from_static(b"held");
    receiver.store.put(held_key.clone(), Bytes::from_static(b"old"));

    let items = vec![
        (Bytes::from_static(b"a"), random_content(3000)),
        (held_key.clone(), Bytes::from_static(b"new")),
        (Bytes::from_static(b"b"), random_content(10)),
    ];

    let transferred = offerer
        .lookup
        .offer(&receiver.enr, items.clone())
        .await
        .unwrap();
    assert_eq!(transferred, 2);

    let store = receiver.store.clone();
    let expected = items.clone();
    deadline!(Duration::from_secs(3), move || {
        store.get(&expected[0].0) == Some(expected[0].1.clone())
            && store.get(&expected[2].0) == Some(expected[2].1.clone())
    });

    // Keys the receiver already held are refused.
    assert_eq!(receiver.store.get(&held_key), Some(Bytes::from_static(b"old")));
    assert!(receiver
        .routing_table
        .content_known_to_peer(&offerer.enr.node_id(), b"a"));

    // A second offer of the same content transfers nothing.
    assert_eq!(
        offerer.lookup.offer(&receiver.enr, items).await.unwrap(),
        0
    );
}

#[tokio::test]
async fn offer_survives_lost_final_ack() {
    let network = Network::new();
    let offerer = network.add_node(Id::rand());
    let receiver = network.add_node(Id::rand());

    // The SYN-ACK, the ack of the only DATA packet, then the ack of the FIN.
    receiver.messenger.drop_utp_packet(3);

    let content = random_content(10);
    let items = vec![(Bytes::from_static(b"key"), content.clone())];
    let transferred = tokio::time::timeout(
        Duration::from_secs(10),
        offerer.lookup.offer(&receiver.enr, items),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(transferred, 1);

    let store = receiver.store.clone();
    deadline!(Duration::from_secs(3), move || store.get(b"key")
        == Some(content.clone()));

    // The receiver releases the connection after lingering.
    let utp = receiver.utp.clone();
    deadline!(Duration::from_secs(5), move || utp.active_connections() == 0);
}

#[tokio::test]
async fn lost_packet_is_retransmitted() {
    let network = Network::new();
    let requester = network.add_node(Id::rand());
    let holder = network.add_node(Id::rand());

    let content_key = Bytes::from_static(b"lossy");
    let content = random_content(4000);
    holder.store.put(content_key.clone(), content.clone());

    // The SYN-ACK is the holder's first packet, the second is the first DATA packet.
    holder.messenger.drop_utp_packet(2);

    let response = requester
        .messenger
        .send_request(
            &holder.enr,
            Message::FindContent(FindContent {
                nonce: 2,
                content_key,
            }),
        )
        .await
        .unwrap();

    let connection_id = match response {
        Message::Content(content) => match content.payload {
            ContentPayload::ConnectionId(connection_id) => connection_id,
            payload => panic!("unexpected payload: {:?}", payload),
        },
        response => panic!("unexpected response: {:?}", response),
    };

    let streamed = tokio::time::timeout(
        Duration::from_secs(10),
        requester.utp.connect_read(holder.enr, connection_id),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(streamed, content);
}

#[tokio::test]
async fn malformed_packets_are_rejected() {
    let network = Network::new();
    let node = network.add_node(Id::rand());
    let peer = network.add_node(Id::rand());

    assert!(node
        .utp
        .on_packet(&peer.enr, Bytes::from_static(&[0x41; 10]))
        .is_err());
    // Well formed, but for no known connection.
    let mut packet = vec![0u8; 20];
    packet[0] = 0x21;
    assert!(node.utp.on_packet(&peer.enr, Bytes::from(packet)).is_ok());
}
