use std::time::{Duration, Instant};

use time::OffsetDateTime;
use tracing::*;

use crate::{
    core::{enr::Enr, id::NodeId},
    kbucket::{
        Entry, FailureReason, InsertResult, Node, NodeStatus, TableEvent, UpdateError,
        UpdateResult,
    },
};

#[derive(Debug, Clone)]
struct PendingNode {
    node: Node,
    deadline: Instant,
}

/// A fixed-capacity list of peers at one distance range.
///
/// Disconnected peers come first (oldest first), connected peers follow (least recently
/// connected first). The eviction target is therefore always at index 0.
#[derive(Debug, Clone)]
pub(crate) struct Bucket {
    nodes: Vec<Node>,
    pending: Option<PendingNode>,
    max_size: usize,
    pending_timeout: Duration,
}

impl Bucket {
    pub(crate) fn new(max_size: usize, pending_timeout: Duration) -> Self {
        Self {
            nodes: Vec::with_capacity(max_size),
            pending: None,
            max_size,
            pending_timeout,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub(crate) fn is_full(&self) -> bool {
        self.nodes.len() >= self.max_size
    }

    pub(crate) fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub(crate) fn get(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.iter().find(|node| &node.value.node_id() == id)
    }

    pub(crate) fn get_with_pending(&self, id: &NodeId) -> Option<Entry> {
        if let Some(node) = self.get(id) {
            return Some(Entry {
                node: *node,
                pending: false,
            });
        }

        self.pending
            .as_ref()
            .filter(|pending| &pending.node.value.node_id() == id)
            .map(|pending| Entry {
                node: pending.node,
                pending: true,
            })
    }

    fn position(&self, id: &NodeId) -> Option<usize> {
        self.nodes
            .iter()
            .position(|node| &node.value.node_id() == id)
    }

    fn first_connected(&self) -> Option<usize> {
        self.nodes
            .iter()
            .position(|node| node.status == NodeStatus::Connected)
    }

    // Places the node according to its status, returns `false` if the bucket is full.
    fn add(&mut self, node: Node) -> bool {
        if self.is_full() {
            return false;
        }

        match node.status {
            NodeStatus::Connected => self.nodes.push(node),
            NodeStatus::Disconnected => {
                let i = self.first_connected().unwrap_or(self.nodes.len());
                self.nodes.insert(i, node);
            }
        }

        true
    }

    pub(crate) fn insert_or_update(
        &mut self,
        value: Enr,
        status: NodeStatus,
        now: Instant,
        events: &mut Vec<TableEvent>,
    ) -> InsertResult {
        let id = value.node_id();

        if let Some(i) = self.position(&id) {
            let value_changed = self.nodes[i].value.seq() < value.seq();
            if value_changed {
                self.nodes[i].value = value;
            }

            return match self.set_status(i, status) {
                Some(NodeStatus::Connected) => InsertResult::UpdatedAndPromoted,
                Some(NodeStatus::Disconnected) if !value_changed => InsertResult::StatusUpdated,
                _ if value_changed => InsertResult::Updated,
                _ => InsertResult::NotModified,
            };
        }

        if let Some(pending) = self
            .pending
            .as_mut()
            .filter(|pending| pending.node.value.node_id() == id)
        {
            let value_changed = pending.node.value.seq() < value.seq();
            if value_changed {
                pending.node.value = value;
            }
            let status_changed = pending.node.status != status;
            pending.node.status = status;
            pending.node.last_seen = OffsetDateTime::now_utc();

            return if value_changed || status_changed {
                InsertResult::UpdatedPending
            } else {
                InsertResult::NotModified
            };
        }

        if self.add(Node::new(value, status)) {
            return InsertResult::Inserted;
        }

        if self.pending.is_some() {
            return InsertResult::Failed(FailureReason::BucketFull);
        }

        self.pending = Some(PendingNode {
            node: Node::new(value, status),
            deadline: now + self.pending_timeout,
        });

        if let Some(target) = self.nodes.first().map(|node| node.value) {
            debug!(candidate = %id, target = %target.node_id(), "bucket full, holding pending entry");
            events.push(TableEvent::PendingEviction(target));
        }

        InsertResult::Pending
    }

    pub(crate) fn update_status(
        &mut self,
        id: &NodeId,
        status: NodeStatus,
    ) -> Result<UpdateResult, UpdateError> {
        if let Some(i) = self.position(id) {
            return Ok(match self.set_status(i, status) {
                Some(NodeStatus::Connected) => UpdateResult::UpdatedAndPromoted,
                Some(NodeStatus::Disconnected) => UpdateResult::Updated,
                None => UpdateResult::NotModified,
            });
        }

        match self
            .pending
            .as_mut()
            .filter(|pending| &pending.node.value.node_id() == id)
        {
            Some(pending) if pending.node.status == status => Ok(UpdateResult::NotModified),
            Some(pending) => {
                pending.node.status = status;
                pending.node.last_seen = OffsetDateTime::now_utc();
                Ok(UpdateResult::UpdatedPending)
            }
            None => Err(UpdateError::KeyNonExistent),
        }
    }

    pub(crate) fn update_value(&mut self, value: Enr) -> Result<UpdateResult, UpdateError> {
        let id = value.node_id();

        if let Some(node) = self.nodes.iter_mut().find(|node| node.value.node_id() == id) {
            if node.value.seq() >= value.seq() {
                return Ok(UpdateResult::NotModified);
            }
            node.value = value;
            return Ok(UpdateResult::Updated);
        }

        match self
            .pending
            .as_mut()
            .filter(|pending| pending.node.value.node_id() == id)
        {
            Some(pending) if pending.node.value.seq() >= value.seq() => {
                Ok(UpdateResult::NotModified)
            }
            Some(pending) => {
                pending.node.value = value;
                Ok(UpdateResult::UpdatedPending)
            }
            None => Err(UpdateError::KeyNonExistent),
        }
    }

    // Refreshes `last_seen` and moves the node if its status changes. Returns the new status if
    // it changed.
    fn set_status(&mut self, i: usize, status: NodeStatus) -> Option<NodeStatus> {
        self.nodes[i].last_seen = OffsetDateTime::now_utc();

        if self.nodes[i].status == status {
            return None;
        }

        let mut node = self.nodes.remove(i);
        node.status = status;
        // Can't fail, a slot was just freed.
        let _res = self.add(node);
        debug_assert!(_res);

        Some(status)
    }

    pub(crate) fn remove(&mut self, id: &NodeId, events: &mut Vec<TableEvent>) -> Option<Node> {
        if let Some(i) = self.position(id) {
            let removed = self.nodes.remove(i);

            // A slot was freed, the pending entry doesn't need to wait for an eviction.
            if let Some(pending) = self.pending.take() {
                let inserted = pending.node.value;
                let _res = self.add(pending.node);
                debug_assert!(_res);
                events.push(TableEvent::AppliedEviction {
                    inserted,
                    evicted: None,
                });
            }

            return Some(removed);
        }

        if self
            .pending
            .as_ref()
            .is_some_and(|pending| &pending.node.value.node_id() == id)
        {
            return self.pending.take().map(|pending| pending.node);
        }

        None
    }

    /// Resolves the pending entry if its deadline has passed.
    pub(crate) fn apply_pending(&mut self, now: Instant, events: &mut Vec<TableEvent>) {
        let pending = match self.pending.take() {
            Some(pending) if pending.deadline <= now => pending,
            pending => {
                self.pending = pending;
                return;
            }
        };

        let inserted = pending.node.value;

        if !self.is_full() {
            let _res = self.add(pending.node);
            debug_assert!(_res);
            events.push(TableEvent::AppliedEviction {
                inserted,
                evicted: None,
            });
            return;
        }

        match self.nodes.first() {
            Some(node) if node.status == NodeStatus::Disconnected => {
                let evicted = self.nodes.remove(0).value;
                let _res = self.add(pending.node);
                debug_assert!(_res);

                debug!(inserted = %inserted.node_id(), evicted = %evicted.node_id(), "applied pending entry");
                events.push(TableEvent::AppliedEviction {
                    inserted,
                    evicted: Some(evicted),
                });
            }
            _ => {
                debug!(candidate = %inserted.node_id(), "no disconnected incumbent, dropping pending entry");
            }
        }
    }
}
