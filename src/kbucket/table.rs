use std::{
    collections::{HashMap, HashSet},
    time::Instant,
};

use bytes::Bytes;
use rand::{
    seq::{IteratorRandom, SliceRandom},
    thread_rng,
};
use tracing::*;

use crate::{
    core::{
        enr::Enr,
        id::{Distance, Id, NodeId},
    },
    kbucket::{
        bucket::Bucket, Entry, FailureReason, InsertResult, NodeStatus, TableConfig, TableEvent,
        UpdateError, UpdateResult, NUM_BUCKETS,
    },
};

/// The core routing table data structure.
#[derive(Debug, Clone)]
pub struct RoutingTable {
    // The node's local identifier.
    local_id: NodeId,
    config: TableConfig,
    // Bucket `i` holds the peers at log2 distance `i + 1`.
    buckets: Vec<Bucket>,
    // Bucket events not yet collected by the owner.
    events: Vec<TableEvent>,
    // Failed requests per peer.
    strikes: HashMap<NodeId, u8>,
    // Evicted peers and the instant they may return.
    ignored: HashMap<NodeId, Instant>,
    // Storage radius advertised by each peer.
    radius: HashMap<NodeId, Distance>,
    // Content keys each peer is known to hold (offered or served).
    known_content: HashMap<NodeId, HashSet<Bytes>>,
}

impl RoutingTable {
    /// Creates a new routing table.
    pub fn new(local_id: NodeId, config: TableConfig) -> Self {
        Self {
            local_id,
            config,
            buckets: (0..NUM_BUCKETS)
                .map(|_| Bucket::new(config.bucket_size, config.pending_timeout))
                .collect(),
            events: Vec::new(),
            strikes: HashMap::new(),
            ignored: HashMap::new(),
            radius: HashMap::new(),
            known_content: HashMap::new(),
        }
    }

    /// Returns this table's local identifier.
    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    /// Returns the configuration the table was created with.
    pub fn config(&self) -> &TableConfig {
        &self.config
    }

    /// Returns the index of the bucket the identifier belongs in, `None` for the local identifier.
    pub fn bucket_index(&self, id: &NodeId) -> Option<usize> {
        match self.local_id.log2_distance(id) {
            0 => None,
            d => Some(d as usize - 1),
        }
    }

    /// Returns the number of peers stored (pending entries excluded).
    pub fn len(&self) -> usize {
        self.buckets.iter().map(|bucket| bucket.len()).sum()
    }

    /// Returns `true` if no peers are stored.
    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|bucket| bucket.is_empty())
    }

    /// Returns the number of peers stored in a bucket.
    pub fn bucket_len(&self, index: usize) -> usize {
        self.buckets.get(index).map_or(0, |bucket| bucket.len())
    }

    /// Inserts a peer or updates its stored value and status.
    pub fn insert_or_update(&mut self, value: Enr, status: NodeStatus) -> InsertResult {
        self.insert_or_update_at(value, status, Instant::now())
    }

    pub(crate) fn insert_or_update_at(
        &mut self,
        value: Enr,
        status: NodeStatus,
        now: Instant,
    ) -> InsertResult {
        let id = value.node_id();
        let i = match self.bucket_index(&id) {
            Some(i) => i,
            None => return InsertResult::Failed(FailureReason::InvalidSelfUpdate),
        };

        if self.is_ignored_at(&id, now) {
            return InsertResult::Failed(FailureReason::Ignored);
        }

        let res = self.buckets[i].insert_or_update(value, status, now, &mut self.events);
        trace!(peer = %id, bucket = i, result = ?res, "insert or update");

        res
    }

    /// Updates the status of a stored (or pending) peer.
    pub fn update_status(
        &mut self,
        id: &NodeId,
        status: NodeStatus,
    ) -> Result<UpdateResult, UpdateError> {
        let i = self
            .bucket_index(id)
            .ok_or(UpdateError::InvalidSelfUpdate)?;

        self.buckets[i].update_status(id, status)
    }

    /// Replaces the stored value of a peer if the new record has a higher sequence number.
    pub fn update_value(&mut self, value: Enr) -> Result<UpdateResult, UpdateError> {
        let i = self
            .bucket_index(&value.node_id())
            .ok_or(UpdateError::InvalidSelfUpdate)?;

        self.buckets[i].update_value(value)
    }

    /// Removes a peer (stored or pending), returning its value if it was present.
    pub fn remove(&mut self, id: &NodeId) -> Option<Enr> {
        let i = self.bucket_index(id)?;
        let removed = self.buckets[i].remove(id, &mut self.events);

        if removed.is_some() {
            debug!(peer = %id, bucket = i, "removed peer");
        }

        removed.map(|node| node.value)
    }

    /// Removes a peer only if its stored value matches the supplied record.
    pub fn remove_by_value(&mut self, value: &Enr) -> Option<Enr> {
        match self.get_with_pending(&value.node_id()) {
            Some(entry) if &entry.node.value == value => self.remove(&value.node_id()),
            _ => None,
        }
    }

    /// Returns the stored value for a peer, pending entries excluded.
    pub fn get_value(&self, id: &NodeId) -> Option<Enr> {
        let i = self.bucket_index(id)?;
        self.buckets[i].get(id).map(|node| node.value)
    }

    /// Returns the stored or pending entry for a peer.
    pub fn get_with_pending(&self, id: &NodeId) -> Option<Entry> {
        let i = self.bucket_index(id)?;
        self.buckets[i].get_with_pending(id)
    }

    /// Returns all the stored peers, ordered by bucket.
    pub fn values(&self) -> Vec<Enr> {
        self.buckets
            .iter()
            .flat_map(|bucket| bucket.nodes().iter().map(|node| node.value))
            .collect()
    }

    /// Returns at most `limit` peers sorted by ascending log2 distance to the target. Peers at the
    /// same log2 distance keep their stored order.
    pub fn nearest(&self, target: &Id, limit: usize) -> Vec<Enr> {
        let mut peers: Vec<_> = self
            .buckets
            .iter()
            .flat_map(|bucket| bucket.nodes().iter())
            .map(|node| (target.log2_distance(&node.value.node_id()), node.value))
            .collect();

        // Stable.
        peers.sort_by_key(|(distance, _)| *distance);
        peers.truncate(limit);

        peers.into_iter().map(|(_, value)| value).collect()
    }

    /// Picks a random non-empty bucket and returns a random peer from it.
    pub fn random(&self) -> Option<Enr> {
        let mut rng = thread_rng();

        self.buckets
            .iter()
            .filter(|bucket| !bucket.is_empty())
            .choose(&mut rng)
            .and_then(|bucket| bucket.nodes().choose(&mut rng))
            .map(|node| node.value)
    }

    /// Resolves the pending entries whose timeout has elapsed.
    pub fn apply_pending(&mut self) {
        self.apply_pending_at(Instant::now())
    }

    /// Resolves the pending entries whose deadline is at or before `now`, and forgets expired
    /// ignores and the strikes of peers no longer in the table.
    pub fn apply_pending_at(&mut self, now: Instant) {
        for bucket in self.buckets.iter_mut() {
            bucket.apply_pending(now, &mut self.events);
        }

        self.ignored.retain(|_, until| *until > now);

        let stale: Vec<NodeId> = self
            .strikes
            .keys()
            .filter(|id| self.get_with_pending(id).is_none())
            .copied()
            .collect();
        for id in stale {
            self.strikes.remove(&id);
        }
    }

    /// Drains the bucket events collected since the last call.
    pub fn take_events(&mut self) -> Vec<TableEvent> {
        std::mem::take(&mut self.events)
    }

    /// Records a failed request. Returns `true` if the peer reached the strike limit and was
    /// evicted.
    pub fn strike(&mut self, id: &NodeId) -> bool {
        let strikes = self.strikes.entry(*id).or_default();
        *strikes = strikes.saturating_add(1);

        if *strikes < self.config.max_strikes {
            return false;
        }

        debug!(peer = %id, "strike limit reached, evicting");
        self.evict(id);

        true
    }

    /// Forgets the recorded failures of a peer.
    pub fn clear_strikes(&mut self, id: &NodeId) {
        self.strikes.remove(id);
    }

    /// Removes a peer and refuses to store it again for the configured ignore duration.
    pub fn evict(&mut self, id: &NodeId) {
        self.remove(id);
        self.strikes.remove(id);
        self.radius.remove(id);
        self.known_content.remove(id);
        self.ignore(id);
    }

    /// Ignores a peer for the configured duration.
    pub fn ignore(&mut self, id: &NodeId) {
        self.ignored
            .insert(*id, Instant::now() + self.config.ignore_duration);
    }

    /// Returns `true` if the peer is currently ignored.
    pub fn is_ignored(&self, id: &NodeId) -> bool {
        self.is_ignored_at(id, Instant::now())
    }

    fn is_ignored_at(&self, id: &NodeId, now: Instant) -> bool {
        self.ignored.get(id).is_some_and(|until| *until > now)
    }

    /// Records the storage radius a peer advertised.
    pub fn update_radius(&mut self, id: NodeId, radius: Distance) {
        self.radius.insert(id, radius);
    }

    /// Returns the storage radius of a peer, if known.
    pub fn radius(&self, id: &NodeId) -> Option<Distance> {
        self.radius.get(id).copied()
    }

    /// Records that a peer holds (or was offered) a piece of content.
    pub fn mark_content_known(&mut self, id: NodeId, content_key: Bytes) {
        self.known_content.entry(id).or_default().insert(content_key);
    }

    /// Returns `true` if the peer is known to hold (or was offered) the content.
    pub fn content_known_to_peer(&self, id: &NodeId, content_key: &[u8]) -> bool {
        self.known_content
            .get(id)
            .is_some_and(|keys| keys.contains(content_key))
    }
}

#[cfg(test)]
mod tests {
    use std::{
        net::{IpAddr, Ipv4Addr, SocketAddr},
        time::Duration,
    };

    use super::*;

    fn localhost_with_port(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    fn enr(id: Id) -> Enr {
        Enr::new(id, 1, localhost_with_port(0))
    }

    fn zero() -> Id {
        Id::new([0; Id::BYTES])
    }

    // Identifier with only bit `d - 1` set, i.e. at log2 distance `d` from zero.
    fn id_at_distance(d: u32) -> Id {
        let bit = (d - 1) as usize;
        let mut bytes = [0u8; Id::BYTES];
        bytes[Id::BYTES - 1 - bit / 8] = 1 << (bit % 8);

        Id::new(bytes)
    }

    #[test]
    fn insert_self() {
        let local_id = Id::rand();
        let mut rt = RoutingTable::new(local_id, TableConfig::default());

        assert_eq!(
            rt.insert_or_update(enr(local_id), NodeStatus::Connected),
            InsertResult::Failed(FailureReason::InvalidSelfUpdate)
        );
        assert_eq!(
            rt.insert_or_update(enr(local_id), NodeStatus::Disconnected),
            InsertResult::Failed(FailureReason::InvalidSelfUpdate)
        );
        assert_eq!(rt.len(), 0);
        assert_eq!(
            rt.update_status(&local_id, NodeStatus::Connected),
            Err(UpdateError::InvalidSelfUpdate)
        );
    }

    #[test]
    fn insert() {
        let mut rt = RoutingTable::new(zero(), TableConfig::default());
        let peer = enr(Id::from_u16(1));

        assert_eq!(
            rt.insert_or_update(peer, NodeStatus::Disconnected),
            InsertResult::Inserted
        );
        assert_eq!(
            rt.insert_or_update(peer, NodeStatus::Disconnected),
            InsertResult::NotModified
        );
        assert_eq!(
            rt.insert_or_update(peer, NodeStatus::Connected),
            InsertResult::UpdatedAndPromoted
        );
        assert_eq!(rt.get_value(&peer.node_id()), Some(peer));
        assert_eq!(rt.bucket_len(0), 1);
        assert_eq!(rt.len(), 1);
    }

    #[test]
    fn update_missing() {
        let mut rt = RoutingTable::new(zero(), TableConfig::default());

        assert_eq!(
            rt.update_status(&Id::from_u16(1), NodeStatus::Connected),
            Err(UpdateError::KeyNonExistent)
        );
        assert_eq!(
            rt.update_value(enr(Id::from_u16(1))),
            Err(UpdateError::KeyNonExistent)
        );
    }

    #[test]
    fn full_bucket_pending_then_timeout() {
        let config = TableConfig::default();
        let mut rt = RoutingTable::new(zero(), config);
        let now = Instant::now();

        // 0x80..=0xff are all at log2 distance 8 from zero.
        for i in 0..config.bucket_size as u16 {
            assert_eq!(
                rt.insert_or_update_at(enr(Id::from_u16(0x80 + i)), NodeStatus::Connected, now),
                InsertResult::Inserted
            );
        }

        let candidate = enr(Id::from_u16(0xff));
        assert_eq!(
            rt.insert_or_update_at(candidate, NodeStatus::Connected, now),
            InsertResult::Pending
        );
        assert_eq!(rt.bucket_len(7), config.bucket_size);
        assert!(rt.get_value(&candidate.node_id()).is_none());
        assert!(rt.get_with_pending(&candidate.node_id()).unwrap().pending);
        assert!(matches!(
            rt.take_events().as_slice(),
            [TableEvent::PendingEviction(_)]
        ));

        // Every incumbent is connected, the candidate is dropped.
        rt.apply_pending_at(now + config.pending_timeout);
        assert_eq!(rt.bucket_len(7), config.bucket_size);
        assert!(rt.get_with_pending(&candidate.node_id()).is_none());
        assert!(rt.take_events().is_empty());
    }

    #[test]
    fn full_bucket_evicts_disconnected() {
        let config = TableConfig {
            bucket_size: 2,
            ..Default::default()
        };
        let mut rt = RoutingTable::new(zero(), config);
        let now = Instant::now();

        let stale = enr(Id::from_u16(0x80));
        let live = enr(Id::from_u16(0x81));
        let candidate = enr(Id::from_u16(0x82));

        rt.insert_or_update_at(stale, NodeStatus::Connected, now);
        rt.insert_or_update_at(live, NodeStatus::Connected, now);
        assert_eq!(
            rt.insert_or_update_at(candidate, NodeStatus::Connected, now),
            InsertResult::Pending
        );

        // The oldest peer goes away while the candidate waits.
        assert_eq!(
            rt.update_status(&stale.node_id(), NodeStatus::Disconnected),
            Ok(UpdateResult::Updated)
        );

        rt.apply_pending_at(now + config.pending_timeout);
        assert_eq!(rt.get_value(&candidate.node_id()), Some(candidate));
        assert!(rt.get_value(&stale.node_id()).is_none());
        assert_eq!(
            rt.take_events().last(),
            Some(&TableEvent::AppliedEviction {
                inserted: candidate,
                evicted: Some(stale)
            })
        );
    }

    #[test]
    fn nearest_sorted_and_limited() {
        let mut rt = RoutingTable::new(Id::rand(), TableConfig::default());
        for _ in 0..200 {
            rt.insert_or_update(enr(Id::rand()), NodeStatus::Disconnected);
        }

        let target = Id::rand();
        for limit in [0, 1, 16, 500] {
            let nearest = rt.nearest(&target, limit);
            assert_eq!(nearest.len(), limit.min(rt.len()));

            let distances: Vec<_> = nearest
                .iter()
                .map(|peer| target.log2_distance(&peer.node_id()))
                .collect();
            assert!(distances.windows(2).all(|w| w[0] <= w[1]));
        }
    }

    #[test]
    fn nearest_one_per_bucket() {
        let mut rt = RoutingTable::new(zero(), TableConfig::default());

        // Insert in reverse to make sure ordering comes from the distance.
        for d in (1..=256).rev() {
            assert_eq!(
                rt.insert_or_update(enr(id_at_distance(d)), NodeStatus::Connected),
                InsertResult::Inserted
            );
        }
        assert_eq!(rt.len(), 256);
        for i in 0..NUM_BUCKETS {
            assert_eq!(rt.bucket_len(i), 1);
        }

        let nearest = rt.nearest(&zero(), 256);
        let expected: Vec<_> = (1..=256).map(id_at_distance).collect();
        assert_eq!(
            nearest.iter().map(|peer| peer.node_id()).collect::<Vec<_>>(),
            expected
        );
    }

    #[test]
    fn remove_by_value() {
        let mut rt = RoutingTable::new(zero(), TableConfig::default());
        let peer = enr(Id::from_u16(3));
        rt.insert_or_update(peer, NodeStatus::Connected);

        let newer = peer.with_addr(localhost_with_port(1));
        assert!(rt.remove_by_value(&newer).is_none());
        assert_eq!(rt.remove_by_value(&peer), Some(peer));
        assert!(rt.is_empty());
        assert!(rt.remove(&peer.node_id()).is_none());
    }

    #[test]
    fn random() {
        let mut rt = RoutingTable::new(zero(), TableConfig::default());
        assert!(rt.random().is_none());

        let peers: Vec<_> = (1..=20).map(|i| enr(Id::from_u16(i))).collect();
        for peer in &peers {
            rt.insert_or_update(*peer, NodeStatus::Connected);
        }

        for _ in 0..50 {
            assert!(peers.contains(&rt.random().unwrap()));
        }
    }

    #[test]
    fn strikes_evict_and_ignore() {
        let mut rt = RoutingTable::new(zero(), TableConfig::default());
        let peer = enr(Id::from_u16(5));
        rt.insert_or_update(peer, NodeStatus::Connected);

        assert!(!rt.strike(&peer.node_id()));
        rt.clear_strikes(&peer.node_id());
        assert!(!rt.strike(&peer.node_id()));
        assert!(!rt.strike(&peer.node_id()));
        assert!(rt.strike(&peer.node_id()));

        assert!(rt.get_value(&peer.node_id()).is_none());
        assert!(rt.is_ignored(&peer.node_id()));
        assert_eq!(
            rt.insert_or_update(peer, NodeStatus::Connected),
            InsertResult::Failed(FailureReason::Ignored)
        );

        // Ignoring expires.
        assert_eq!(
            rt.insert_or_update_at(
                peer,
                NodeStatus::Connected,
                Instant::now() + Duration::from_secs(121)
            ),
            InsertResult::Inserted
        );
    }

    #[test]
    fn side_tables() {
        let mut rt = RoutingTable::new(zero(), TableConfig::default());
        let id = Id::from_u16(9);

        assert!(rt.radius(&id).is_none());
        rt.update_radius(id, Distance::MAX);
        assert_eq!(rt.radius(&id), Some(Distance::MAX));

        assert!(!rt.content_known_to_peer(&id, b"key"));
        rt.mark_content_known(id, Bytes::from_static(b"key"));
        assert!(rt.content_known_to_peer(&id, b"key"));
    }

    #[test]
    fn expired_side_entries_pruned() {
        let mut rt = RoutingTable::new(zero(), TableConfig::default());
        let known = enr(Id::from_u16(5));
        let gone = Id::from_u16(6);
        let evicted = enr(Id::from_u16(7));
        rt.insert_or_update(known, NodeStatus::Connected);
        rt.insert_or_update(evicted, NodeStatus::Connected);

        rt.strike(&known.node_id());
        rt.strike(&gone);
        rt.evict(&evicted.node_id());

        rt.apply_pending_at(Instant::now());
        assert!(rt.strikes.contains_key(&known.node_id()));
        assert!(!rt.strikes.contains_key(&gone));
        assert!(rt.is_ignored(&evicted.node_id()));

        rt.apply_pending_at(Instant::now() + Duration::from_secs(121));
        assert!(rt.ignored.is_empty());
        assert!(rt.strikes.contains_key(&known.node_id()));
    }
}
