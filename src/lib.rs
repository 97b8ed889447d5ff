//! The core of a [Portal](https://github.com/ethereum/portal-network-specs)-style content
//! network built on a Kademlia DHT.
//!
//! The crate is made of three layers:
//!
//! 1. [`kbucket`]: the routing table, 256 buckets of peers indexed by log2 XOR distance from the
//!    local identifier, with pending-eviction candidates for full buckets.
//! 2. [`utp`]: a micro transport protocol streaming payloads of any size over an unreliable
//!    message channel, with delay-based congestion control, selective acks and retransmission.
//! 3. `content` (feature `sync`): the handler answering FINDCONTENT and OFFER requests and the
//!    iterative content lookup.
//!
//! The discovery/session layer is abstracted behind the
//! [`PeerMessenger`](crate::traits::PeerMessenger) trait and storage behind
//! [`ContentStore`](crate::traits::ContentStore).

#![cfg_attr(doc_cfg, feature(doc_cfg))]

#[cfg(feature = "codec")]
#[cfg_attr(doc_cfg, doc(cfg(feature = "codec")))]
pub mod codec;
#[cfg(feature = "sync")]
#[cfg_attr(doc_cfg, doc(cfg(feature = "sync")))]
pub mod content;
pub mod kbucket;
pub mod utp;

mod core;

pub use crate::core::{
    enr::Enr,
    id::{ContentId, Distance, Id, NodeId},
    message, traits,
};
