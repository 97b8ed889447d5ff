use std::{collections::HashSet, sync::Arc, time::Duration};

use bytes::Bytes;
use tokio::task::JoinSet;
use tracing::*;

use crate::{
    content::{ContentError, MAX_ENRS},
    core::{
        enr::Enr,
        id::{ContentId, Distance},
    },
    kbucket::{NodeStatus, SyncRoutingTable},
    message::{ContentPayload, FindContent, Message, Offer},
    traits::{ContentStore, MessengerError, PeerMessenger},
    utp::{ContentWriter, UtpManager},
};

/// Content lookup parameters.
#[derive(Debug, Clone, Copy)]
pub struct LookupConfig {
    /// The number of peers taken from the routing table to start the lookup.
    pub initial_peers: usize,
    /// The number of peers queried concurrently in a round.
    pub concurrency: usize,
    /// The number of closest peers tracked, and returned when the content isn't found.
    pub num_results: usize,
    /// The time allowed for a single request.
    pub query_timeout: Duration,
}

impl Default for LookupConfig {
    fn default() -> Self {
        Self {
            initial_peers: 5,
            concurrency: 3,
            num_results: MAX_ENRS,
            query_timeout: Duration::from_secs(3),
        }
    }
}

/// The outcome of a content lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupResult {
    Found {
        content: Bytes,
        /// `true` if the content was streamed over uTP.
        utp: bool,
    },
    /// No peer returned the content, these are the closest peers that answered.
    NotFound { closest: Vec<Enr> },
}

/// Finds content in the network and offers content to peers.
pub struct ContentLookup<M, S> {
    messenger: Arc<M>,
    routing_table: SyncRoutingTable,
    store: Arc<S>,
    utp: UtpManager<M>,
    config: LookupConfig,
}

impl<M, S> Clone for ContentLookup<M, S> {
    fn clone(&self) -> Self {
        Self {
            messenger: Arc::clone(&self.messenger),
            routing_table: self.routing_table.clone(),
            store: Arc::clone(&self.store),
            utp: self.utp.clone(),
            config: self.config,
        }
    }
}

type QueryResult = (Enr, Result<ContentPayload, ContentError>);

impl<M: PeerMessenger, S: ContentStore + 'static> ContentLookup<M, S> {
    pub fn new(
        messenger: Arc<M>,
        routing_table: SyncRoutingTable,
        store: Arc<S>,
        utp: UtpManager<M>,
        config: LookupConfig,
    ) -> Self {
        Self {
            messenger,
            routing_table,
            store,
            utp,
            config,
        }
    }

    /// Looks up the content stored under `content_key`.
    ///
    /// Peers are queried iteratively starting from the closest ones in the routing table, each at
    /// most once. The lookup ends with the first peer serving the content, or after a round that
    /// didn't reveal a peer closer than the closest one queried so far.
    pub async fn lookup(&self, content_key: Bytes) -> LookupResult {
        if let Some(content) = self.store.get(&content_key) {
            trace!("content found locally");
            return LookupResult::Found {
                content,
                utp: false,
            };
        }

        let target = ContentId::from_content_key(&content_key);
        let local_id = self.routing_table.local_id();

        let mut candidates: Vec<Enr> = self
            .routing_table
            .nearest(&target, self.config.initial_peers)
            .into_iter()
            .filter(|enr| !self.routing_table.is_ignored(&enr.node_id()))
            .collect();
        candidates.sort_by_key(|enr| target.distance(&enr.node_id()));

        let mut seen: HashSet<_> = candidates.iter().map(Enr::node_id).collect();
        let mut queried = HashSet::new();
        // Peers that answered without the content, in the order they answered.
        let mut contacted: Vec<Enr> = vec![];
        let mut closest_queried = Distance::MAX;
        let mut round = 0;

        loop {
            let batch: Vec<Enr> = candidates
                .iter()
                .filter(|enr| !queried.contains(&enr.node_id()))
                .take(self.config.concurrency.max(1))
                .copied()
                .collect();

            if batch.is_empty() {
                debug!(round, "candidates exhausted");
                break;
            }

            round += 1;
            trace!(round, peers = batch.len(), "querying");

            let mut queries = JoinSet::new();
            for peer in batch {
                queried.insert(peer.node_id());
                closest_queried = closest_queried.min(target.distance(&peer.node_id()));

                let lookup = self.clone();
                let content_key = content_key.clone();
                queries.spawn(async move {
                    let res = lookup.find_content(&peer, content_key).await;
                    (peer, res)
                });
            }

            let mut closest_learned = Distance::MAX;
            while let Some(joined) = queries.join_next().await {
                let (peer, res): QueryResult = match joined {
                    Ok(query) => query,
                    Err(e) => {
                        warn!("lookup query task failed: {}", e);
                        continue;
                    }
                };

                let enrs = match res {
                    Ok(payload) => {
                        self.routing_table
                            .insert_or_update(peer, NodeStatus::Connected);
                        self.routing_table.clear_strikes(&peer.node_id());

                        match payload {
                            ContentPayload::Content { content } => {
                                debug!(peer = %peer.node_id(), round, "content found");
                                self.poke(&contacted, &content_key, &content);
                                return LookupResult::Found {
                                    content,
                                    utp: false,
                                };
                            }
                            ContentPayload::ConnectionId(connection_id) => {
                                match self.utp.connect_read(peer, connection_id).await {
                                    Ok(content) => {
                                        debug!(peer = %peer.node_id(), round, "content streamed");
                                        self.poke(&contacted, &content_key, &content);
                                        return LookupResult::Found {
                                            content,
                                            utp: true,
                                        };
                                    }
                                    Err(e) => {
                                        debug!(peer = %peer.node_id(), "content stream failed: {}", e);
                                        continue;
                                    }
                                }
                            }
                            ContentPayload::Enrs(enrs) => enrs,
                        }
                    }
                    Err(e) => {
                        debug!(peer = %peer.node_id(), "find content failed: {}", e);
                        self.routing_table.strike(&peer.node_id());
                        continue;
                    }
                };

                contacted.push(peer);

                for enr in enrs.into_iter().take(MAX_ENRS) {
                    let node_id = enr.node_id();
                    if node_id == local_id
                        || self.routing_table.is_ignored(&node_id)
                        || !seen.insert(node_id)
                    {
                        continue;
                    }

                    self.routing_table
                        .insert_or_update(enr, NodeStatus::Disconnected);
                    closest_learned = closest_learned.min(target.distance(&node_id));
                    candidates.push(enr);
                }
            }

            candidates.sort_by_key(|enr| target.distance(&enr.node_id()));
            candidates.truncate(self.config.num_results.max(self.config.concurrency));

            if closest_learned >= closest_queried {
                debug!(round, "no closer peers, ending lookup");
                break;
            }
        }

        contacted.sort_by_key(|enr| target.distance(&enr.node_id()));
        contacted.truncate(self.config.num_results);

        LookupResult::NotFound { closest: contacted }
    }

    /// Offers content to a peer and streams the items it accepts. Returns the number of items
    /// transferred.
    pub async fn offer(&self, peer: &Enr, items: Vec<(Bytes, Bytes)>) -> Result<usize, ContentError> {
        let request = Message::Offer(Offer {
            nonce: rand::random(),
            content_keys: items.iter().map(|(key, _)| key.clone()).collect(),
        });

        let accept = match self.request(peer, request).await? {
            Message::Accept(accept) => accept,
            response => {
                return Err(ContentError::UnexpectedResponse(
                    response.variant_as_str().to_string(),
                ))
            }
        };

        if accept.accepted.len() != items.len() {
            return Err(ContentError::UnexpectedResponse(format!(
                "{} flags for {} offered keys",
                accept.accepted.len(),
                items.len()
            )));
        }

        for (content_key, _) in &items {
            self.routing_table
                .mark_content_known(peer.node_id(), content_key.clone());
        }

        if !accept.any_accepted() {
            return Ok(0);
        }

        let accepted: Vec<Bytes> = items
            .into_iter()
            .zip(&accept.accepted)
            .filter_map(|((_, content), accepted)| accepted.then_some(content))
            .collect();

        let stream = ContentWriter::frame_items(&accepted);
        self.utp
            .connect_write(*peer, accept.connection_id, stream)
            .await?;

        debug!(peer = %peer.node_id(), items = accepted.len(), "offer delivered");

        Ok(accepted.len())
    }

    async fn find_content(
        &self,
        peer: &Enr,
        content_key: Bytes,
    ) -> Result<ContentPayload, ContentError> {
        let request = Message::FindContent(FindContent {
            nonce: rand::random(),
            content_key,
        });

        match self.request(peer, request).await? {
            Message::Content(content) => Ok(content.payload),
            response => Err(ContentError::UnexpectedResponse(
                response.variant_as_str().to_string(),
            )),
        }
    }

    // Sends a request, only a response carrying the request's nonce is returned.
    async fn request(&self, peer: &Enr, request: Message) -> Result<Message, ContentError> {
        let nonce = request.nonce();
        let response = match tokio::time::timeout(
            self.config.query_timeout,
            self.messenger.send_request(peer, request),
        )
        .await
        {
            Ok(res) => res?,
            Err(_) => return Err(MessengerError::Timeout.into()),
        };

        if !response.is_response() || response.nonce() != nonce {
            return Err(ContentError::UnexpectedResponse(format!(
                "{} with nonce {}",
                response.variant_as_str(),
                response.nonce()
            )));
        }

        Ok(response)
    }

    // Offers found content to the peers that answered without it, skipping those whose known
    // radius excludes it.
    fn poke(&self, contacted: &[Enr], content_key: &Bytes, content: &Bytes) {
        let content_id = ContentId::from_content_key(content_key);

        for peer in contacted {
            let node_id = peer.node_id();
            if self.routing_table.content_known_to_peer(&node_id, content_key) {
                continue;
            }
            if let Some(radius) = self.routing_table.radius(&node_id) {
                if content_id.distance(&node_id) > radius {
                    trace!(peer = %node_id, "content outside the peer's radius");
                    continue;
                }
            }

            let lookup = self.clone();
            let peer = *peer;
            let items = vec![(content_key.clone(), content.clone())];
            tokio::spawn(async move {
                if let Err(e) = lookup.offer(&peer, items).await {
                    debug!(peer = %peer.node_id(), "poke failed: {}", e);
                }
            });
        }
    }
}
