#![cfg(all(feature = "codec", feature = "sync"))]

mod common;

use std::time::Duration;

use bytes::Bytes;
use deadline::deadline;
use portal_dht::{
    content::LookupResult,
    kbucket::NodeStatus,
    traits::ContentStore,
    ContentId, Distance, Id,
};

use crate::common::{Network, TestNode};

// An identifier differing from the target in one byte, the lower the index the farther it is.
fn id_at(target: &ContentId, byte: usize) -> Id {
    let mut bytes = target.bytes();
    bytes[byte] ^= 0xff;

    Id::new(bytes)
}

struct Chain {
    requester: TestNode,
    far: TestNode,
    near: TestNode,
}

// The requester only knows the far peer, which only knows the near one.
fn chain(content_key: &[u8]) -> Chain {
    let target = ContentId::from_content_key(content_key);
    let network = Network::new();

    let requester = network.add_node(id_at(&target, 0));
    let far = network.add_node(id_at(&target, 8));
    let near = network.add_node(id_at(&target, 31));

    requester.knows(&far);
    far.knows(&near);

    Chain {
        requester,
        far,
        near,
    }
}

#[tokio::test]
async fn inline_content_found_through_closer_peer() {
    // common::enable_tracing();

    let content_key = Bytes::from_static(b"inline");
    let content = Bytes::from(vec![7u8; 100]);
    let Chain {
        requester,
        far,
        near,
    } = chain(&content_key);
    near.store.put(content_key.clone(), content.clone());

    assert_eq!(
        requester.lookup.lookup(content_key.clone()).await,
        LookupResult::Found {
            content: content.clone(),
            utp: false
        }
    );

    // The near peer was learned and then reached.
    let entry = requester
        .routing_table
        .get_with_pending(&near.enr.node_id())
        .unwrap();
    assert_eq!(entry.node.status, NodeStatus::Connected);

    // The far peer answered without the content, it gets offered it.
    let store = far.store.clone();
    deadline!(Duration::from_secs(3), move || store.contains(&content_key));
    assert_eq!(far.store.get(b"inline"), Some(content));
}

#[tokio::test]
async fn content_outside_radius_not_offered() {
    let content_key = Bytes::from_static(b"narrow");
    let Chain {
        requester,
        far,
        near,
    } = chain(&content_key);
    near.store.put(content_key.clone(), Bytes::from_static(b"value"));

    // The far peer only stores content at distance zero.
    requester
        .routing_table
        .update_radius(far.enr.node_id(), Distance::new([0; Id::BYTES]));

    assert!(matches!(
        requester.lookup.lookup(content_key.clone()).await,
        LookupResult::Found { utp: false, .. }
    ));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!far.store.contains(&content_key));
    assert!(!requester
        .routing_table
        .content_known_to_peer(&far.enr.node_id(), &content_key));
}

#[tokio::test]
async fn large_content_streamed() {
    let content_key = Bytes::from_static(b"large");
    let content = Bytes::from((0..10_000u32).map(|i| i as u8).collect::<Vec<_>>());
    let Chain {
        requester, near, ..
    } = chain(&content_key);
    near.store.put(content_key.clone(), content.clone());

    assert_eq!(
        requester.lookup.lookup(content_key).await,
        LookupResult::Found { content, utp: true }
    );
}

#[tokio::test]
async fn not_found_returns_closest_peers() {
    let content_key = Bytes::from_static(b"missing");
    let Chain {
        requester,
        far,
        near,
    } = chain(&content_key);

    assert_eq!(
        requester.lookup.lookup(content_key).await,
        LookupResult::NotFound {
            closest: vec![near.enr, far.enr]
        }
    );
}

#[tokio::test]
async fn unreachable_peers_are_skipped() {
    let content_key = Bytes::from_static(b"unreachable");
    let target = ContentId::from_content_key(&content_key);
    let network = Network::new();

    let requester = network.add_node(id_at(&target, 0));
    let holder = network.add_node(id_at(&target, 16));
    holder.store.put(content_key.clone(), Bytes::from_static(b"value"));

    // Closer than the holder but not part of the network.
    let ghost = {
        let other = Network::new();
        other.add_node(id_at(&target, 31))
    };

    requester.knows(&holder);
    requester.knows(&ghost);

    assert_eq!(
        requester.lookup.lookup(content_key).await,
        LookupResult::Found {
            content: Bytes::from_static(b"value"),
            utp: false
        }
    );
}

#[tokio::test]
async fn empty_table_not_found() {
    let network = Network::new();
    let requester = network.add_node(Id::rand());

    assert_eq!(
        requester.lookup.lookup(Bytes::from_static(b"key")).await,
        LookupResult::NotFound { closest: vec![] }
    );
}
