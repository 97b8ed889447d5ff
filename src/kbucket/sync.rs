use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::{sync::mpsc, task::JoinHandle};

use crate::{
    core::{
        enr::Enr,
        id::{Distance, Id, NodeId},
    },
    kbucket::{
        Entry, InsertResult, NodeStatus, RoutingTable, TableConfig, TableEvent, UpdateError,
        UpdateResult,
    },
};

/// A routing table implementation suitable for use in async contexts.
///
/// It wraps [`RoutingTable`], resolves expired pending entries before every mutation and forwards
/// bucket events to subscribers.
#[derive(Debug, Clone)]
pub struct SyncRoutingTable {
    routing_table: Arc<RwLock<RoutingTable>>,
    subscribers: Arc<RwLock<Vec<mpsc::UnboundedSender<TableEvent>>>>,
}

impl SyncRoutingTable {
    pub fn new(local_id: NodeId, config: TableConfig) -> Self {
        Self {
            routing_table: Arc::new(RwLock::new(RoutingTable::new(local_id, config))),
            subscribers: Default::default(),
        }
    }

    pub fn local_id(&self) -> NodeId {
        self.routing_table.read().local_id()
    }

    /// Returns a receiver for the bucket events emitted from now on.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<TableEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.write().push(tx);

        rx
    }

    // Runs a mutation with the lock held, then forwards the events it produced.
    fn mutate<R>(&self, f: impl FnOnce(&mut RoutingTable) -> R) -> R {
        let (res, events) = {
            let mut rt_g = self.routing_table.write();
            rt_g.apply_pending();
            let res = f(&mut rt_g);

            (res, rt_g.take_events())
        };

        if !events.is_empty() {
            self.subscribers.write().retain(|tx| {
                events
                    .iter()
                    .all(|event| tx.send(*event).is_ok())
            });
        }

        res
    }

    pub fn insert_or_update(&self, value: Enr, status: NodeStatus) -> InsertResult {
        self.mutate(|rt| rt.insert_or_update(value, status))
    }

    pub fn update_status(
        &self,
        id: &NodeId,
        status: NodeStatus,
    ) -> Result<UpdateResult, UpdateError> {
        self.mutate(|rt| rt.update_status(id, status))
    }

    pub fn update_value(&self, value: Enr) -> Result<UpdateResult, UpdateError> {
        self.mutate(|rt| rt.update_value(value))
    }

    pub fn remove(&self, id: &NodeId) -> Option<Enr> {
        self.mutate(|rt| rt.remove(id))
    }

    pub fn remove_by_value(&self, value: &Enr) -> Option<Enr> {
        self.mutate(|rt| rt.remove_by_value(value))
    }

    pub fn apply_pending(&self) {
        self.mutate(|_| ())
    }

    /// Spawns a task resolving expired pending entries every `period`.
    pub fn spawn_pending_timer(&self, period: Duration) -> JoinHandle<()> {
        let table = self.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                table.apply_pending();
            }
        })
    }

    pub fn strike(&self, id: &NodeId) -> bool {
        self.mutate(|rt| rt.strike(id))
    }

    pub fn clear_strikes(&self, id: &NodeId) {
        self.routing_table.write().clear_strikes(id)
    }

    pub fn is_ignored(&self, id: &NodeId) -> bool {
        self.routing_table.read().is_ignored(id)
    }

    pub fn update_radius(&self, id: NodeId, radius: Distance) {
        self.routing_table.write().update_radius(id, radius)
    }

    pub fn radius(&self, id: &NodeId) -> Option<Distance> {
        self.routing_table.read().radius(id)
    }

    pub fn mark_content_known(&self, id: NodeId, content_key: Bytes) {
        self.routing_table
            .write()
            .mark_content_known(id, content_key)
    }

    pub fn content_known_to_peer(&self, id: &NodeId, content_key: &[u8]) -> bool {
        self.routing_table
            .read()
            .content_known_to_peer(id, content_key)
    }

    pub fn get_value(&self, id: &NodeId) -> Option<Enr> {
        self.routing_table.read().get_value(id)
    }

    pub fn get_with_pending(&self, id: &NodeId) -> Option<Entry> {
        self.routing_table.read().get_with_pending(id)
    }

    pub fn nearest(&self, target: &Id, limit: usize) -> Vec<Enr> {
        self.routing_table.read().nearest(target, limit)
    }

    pub fn random(&self) -> Option<Enr> {
        self.routing_table.read().random()
    }

    pub fn values(&self) -> Vec<Enr> {
        self.routing_table.read().values()
    }

    pub fn len(&self) -> usize {
        self.routing_table.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.routing_table.read().is_empty()
    }
}
