use std::sync::Arc;

use bytes::Bytes;
use tracing::*;

use crate::{
    content::{INLINE_CONTENT_LIMIT, MAX_ENRS},
    core::{enr::Enr, id::ContentId},
    kbucket::{NodeStatus, SyncRoutingTable},
    message::{Accept, Content, ContentPayload, FindContent, Message, Offer},
    traits::{ContentStore, PeerMessenger},
    utp::{ContentReader, UtpManager},
};

/// Answers inbound content requests from the local store.
pub struct ContentHandler<M, S> {
    routing_table: SyncRoutingTable,
    store: Arc<S>,
    utp: UtpManager<M>,
}

impl<M, S> Clone for ContentHandler<M, S> {
    fn clone(&self) -> Self {
        Self {
            routing_table: self.routing_table.clone(),
            store: Arc::clone(&self.store),
            utp: self.utp.clone(),
        }
    }
}

impl<M: PeerMessenger, S: ContentStore + 'static> ContentHandler<M, S> {
    pub fn new(routing_table: SyncRoutingTable, store: Arc<S>, utp: UtpManager<M>) -> Self {
        Self {
            routing_table,
            store,
            utp,
        }
    }

    /// Handles a request from `source`, returning the response to send back.
    ///
    /// Responses are ignored, they are matched to their requests by the messenger.
    pub fn handle_request(&self, source: &Enr, message: Message) -> Option<Message> {
        trace!(peer = %source.node_id(), kind = message.variant_as_str(), "request received");

        // The peer just reached us.
        self.routing_table.insert_or_update(*source, NodeStatus::Connected);

        match message {
            Message::FindContent(find_content) => Some(self.find_content(source, find_content)),
            Message::Offer(offer) => Some(self.offer(source, offer)),
            Message::Content(_) | Message::Accept(_) => {
                debug!(
                    peer = %source.node_id(),
                    kind = message.variant_as_str(),
                    "unsolicited response"
                );
                None
            }
        }
    }

    fn find_content(&self, source: &Enr, request: FindContent) -> Message {
        let payload = match self.store.get(&request.content_key) {
            Some(content) if content.len() < INLINE_CONTENT_LIMIT => {
                ContentPayload::Content { content }
            }
            Some(content) => {
                let (connection_id, handle) = self.utp.accept_write(*source, content);
                let peer = source.node_id();
                tokio::spawn(async move {
                    match handle.await {
                        Ok(Ok(())) => trace!(%peer, connection_id, "content served"),
                        Ok(Err(e)) => debug!(%peer, connection_id, "serving content failed: {}", e),
                        Err(e) => warn!(%peer, connection_id, "uTP task failed: {}", e),
                    }
                });

                ContentPayload::ConnectionId(connection_id)
            }
            None => {
                let content_id = ContentId::from_content_key(&request.content_key);
                let enrs = self
                    .routing_table
                    .nearest(&content_id, MAX_ENRS + 1)
                    .into_iter()
                    .filter(|enr| enr.node_id() != source.node_id())
                    .take(MAX_ENRS)
                    .collect();

                ContentPayload::Enrs(enrs)
            }
        };

        Message::Content(Content {
            nonce: request.nonce,
            payload,
        })
    }

    fn offer(&self, source: &Enr, request: Offer) -> Message {
        let mut accept = Accept {
            nonce: request.nonce,
            connection_id: 0,
            accepted: request
                .content_keys
                .iter()
                .map(|content_key| !self.store.contains(content_key))
                .collect(),
        };

        for content_key in &request.content_keys {
            self.routing_table.mark_content_known(source.node_id(), content_key.clone());
        }

        if !accept.any_accepted() {
            return Message::Accept(accept);
        }

        let keys: Vec<Bytes> = request
            .content_keys
            .into_iter()
            .zip(&accept.accepted)
            .filter_map(|(content_key, accepted)| accepted.then_some(content_key))
            .collect();

        let (connection_id, handle) = self.utp.accept_read(*source);
        accept.connection_id = connection_id;
        let store = Arc::clone(&self.store);
        let peer = source.node_id();
        tokio::spawn(async move {
            let stream = match handle.await {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    debug!(%peer, connection_id, "receiving offered content failed: {}", e);
                    return;
                }
                Err(e) => {
                    warn!(%peer, connection_id, "uTP task failed: {}", e);
                    return;
                }
            };

            match ContentReader::split_items(stream) {
                Ok(items) if items.len() == keys.len() => {
                    debug!(%peer, items = items.len(), "storing offered content");
                    for (content_key, content) in keys.into_iter().zip(items) {
                        store.put(content_key, content);
                    }
                }
                Ok(items) => {
                    debug!(
                        %peer,
                        expected = keys.len(),
                        received = items.len(),
                        "offered item count mismatch"
                    );
                }
                Err(e) => debug!(%peer, "malformed offer stream: {}", e),
            }
        });

        Message::Accept(accept)
    }
}
