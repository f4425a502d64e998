// Copyright (c) 2026 Confluence
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![forbid(unsafe_code)]

//! Gossip protocol: wire types, the server side of a pull, and the client
//! that integrates pulled events into the local store.
//!
//! Two exchanges exist. `notify` pushes an "I have new events" signal with
//! no payload. `pull` returns an ordered batch of merge events the remote
//! believes the local side is missing, the regular events those merges
//! reference, and an updated cursor carrying the remote's commit horizon.

use crate::core::event::{Event, EventEnvelope, Payload};
use crate::core::store::{EventOrigin, EventStore, InsertOutcome, StoreError};
use crate::core::types::{CanonicalMap, CreatorId, Hash256};
use crate::core::validator::OperationValidator;
use crate::monitoring::metrics::Metrics;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Cap on an encoded pull request.
pub const MAX_REQUEST_BYTES: usize = 1 << 20;
/// Cap on an encoded pull response.
pub const MAX_RESPONSE_BYTES: usize = 64 << 20;
/// Cap on hashes in one targeted fetch.
pub const MAX_WANT_HASHES: usize = 4_096;

/// Pagination/position token exchanged between peers.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    /// The remote's committed block height at response time.
    pub required_block_height: u64,
    /// Per-creator merge heights already delivered.
    pub watermarks: CanonicalMap<CreatorId, u64>,
}

/// Pull request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    /// Requesting peer.
    pub peer: CreatorId,
    /// Position token from the previous pull, if any.
    pub cursor: Option<Cursor>,
    /// Targeted fetch of specific events; overrides cursor paging.
    pub want_hashes: Vec<Hash256>,
}

/// Pull response.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullResponse {
    /// Event envelopes, parents before children.
    pub events: Vec<EventEnvelope>,
    /// Updated position token.
    pub cursor: Cursor,
}

/// Notify signal; fire-and-forget, no payload beyond the sender.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notify {
    /// Notifying peer.
    pub peer: CreatorId,
}

/// Transport-level failure details.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkDetails {
    /// Remote address.
    pub address: String,
    /// Transport error code, if any.
    pub code: Option<String>,
    /// OS errno, if any.
    pub errno: Option<i32>,
    /// Remote port, if any.
    pub port: Option<u16>,
    /// HTTP status, when the transport is HTTP-shaped.
    pub http_status_code: Option<u16>,
}

/// Gossip errors.
#[derive(Debug, Error)]
pub enum GossipError {
    /// Transport failure; non-fatal, drives backoff.
    #[error("network error: {0:?}")]
    Network(NetworkDetails),
    /// The remote does not know this ledger; session-fatal.
    #[error("unknown ledger")]
    UnknownLedger,
    /// Malformed payload from the remote; fatal, the peer is deleted.
    #[error("invalid gossip payload: {0}")]
    Validation(String),
    /// The session ended before integration completed; non-fatal.
    #[error("gossip session incomplete: {0}")]
    Incomplete(String),
    /// The pull hit its deadline; non-fatal.
    #[error("pull timed out")]
    Timeout,
    /// The cycle was cancelled.
    #[error("cancelled")]
    Cancelled,
}

impl GossipError {
    /// Whether the failure must delete the peer.
    pub fn is_fatal(&self) -> bool {
        matches!(self, GossipError::Validation(_))
    }
}

/// The transport seam: how requests reach a remote peer. Production
/// transports marshal these over HTTP; the loopback network implements the
/// same contract in-process.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Request/response pull.
    async fn pull(&self, remote: &CreatorId, request: PullRequest)
        -> Result<PullResponse, GossipError>;
    /// Fire-and-forget notify.
    async fn notify(&self, remote: &CreatorId, notice: Notify) -> Result<(), GossipError>;
}

/// Server side of the protocol, answering pulls from the local store.
#[derive(Clone)]
pub struct GossipServer {
    store: Arc<RwLock<EventStore>>,
    local_block_height: Arc<RwLock<u64>>,
    batch_limit: usize,
}

impl GossipServer {
    /// Build a server over the shared store. `local_block_height` is the
    /// committed chain head, advanced by the worker.
    pub fn new(
        store: Arc<RwLock<EventStore>>,
        local_block_height: Arc<RwLock<u64>>,
        batch_limit: usize,
    ) -> Self {
        Self {
            store,
            local_block_height,
            batch_limit,
        }
    }

    /// Answer one pull request.
    pub fn handle_pull(&self, request: &PullRequest) -> Result<PullResponse, GossipError> {
        let store = self.store.read().map_err(|_| {
            GossipError::Network(NetworkDetails {
                address: "local".into(),
                ..NetworkDetails::default()
            })
        })?;
        if store.genesis().is_none() {
            return Err(GossipError::UnknownLedger);
        }

        if !request.want_hashes.is_empty() {
            if request.want_hashes.len() > MAX_WANT_HASHES {
                return Err(GossipError::Validation("too many want hashes".into()));
            }
            let events = store
                .get_events(&request.want_hashes)
                .map_err(|e| GossipError::Validation(e.to_string()))?;
            let cursor = self.cursor_from()?;
            return Ok(PullResponse {
                events: events.iter().map(Event::envelope).collect(),
                cursor,
            });
        }

        let watermarks = request
            .cursor
            .as_ref()
            .map(|c| c.watermarks.clone())
            .unwrap_or_default();
        let merges = store
            .merge_events_after(&watermarks, self.batch_limit)
            .map_err(|e| GossipError::Validation(e.to_string()))?;

        // Parents before children: each merge is preceded by its non-merge
        // parents (operations and, for the genesis merge, the configuration
        // event). Merges themselves arrive in (merge_height, hash) order,
        // which already respects merge-to-merge ancestry.
        let mut seen: BTreeSet<Hash256> = BTreeSet::new();
        let mut envelopes: Vec<EventEnvelope> = Vec::new();
        for merge in &merges {
            let mut referenced: Vec<Event> = Vec::new();
            for parent_hash in &merge.body.parent_hash {
                if seen.contains(parent_hash) {
                    continue;
                }
                if let Ok(Some(parent)) = store.get(parent_hash) {
                    if !parent.is_merge() {
                        referenced.push(parent);
                    }
                }
            }
            referenced.sort_by(|a, b| {
                (a.body.merge_height, a.hash).cmp(&(b.body.merge_height, b.hash))
            });
            for parent in referenced {
                if seen.insert(parent.hash) {
                    envelopes.push(parent.envelope());
                }
            }
            if seen.insert(merge.hash) {
                envelopes.push(merge.envelope());
            }
        }

        let mut cursor = self.cursor_from()?;
        // Echo forward the requester's watermarks merged with what was sent.
        let mut merged_wm = watermarks;
        for merge in &merges {
            let entry = merged_wm.entry(merge.creator().clone()).or_insert(0);
            if *entry < merge.body.merge_height {
                *entry = merge.body.merge_height;
            }
        }
        cursor.watermarks = merged_wm;

        Ok(PullResponse {
            events: envelopes,
            cursor,
        })
    }

    fn cursor_from(&self) -> Result<Cursor, GossipError> {
        let height = self.local_block_height.read().map_err(|_| {
            GossipError::Network(NetworkDetails {
                address: "local".into(),
                ..NetworkDetails::default()
            })
        })?;
        Ok(Cursor {
            required_block_height: *height,
            watermarks: CanonicalMap::new(),
        })
    }
}

/// Outcome of one integrated pull.
#[derive(Clone, Debug, Default)]
pub struct PullOutcome {
    /// Merge events newly inserted.
    pub merge_events_received: u64,
    /// All events newly inserted.
    pub events_received: u64,
    /// Duplicates skipped.
    pub duplicates: u64,
    /// Updated cursor to persist for this peer.
    pub cursor: Cursor,
}

/// Client side: pulls from a remote and integrates into the local store.
pub struct GossipClient {
    local: CreatorId,
    transport: Arc<dyn Transport>,
    pull_timeout: Duration,
    max_missing_depth: usize,
    validator: Arc<dyn OperationValidator>,
    metrics: Arc<Metrics>,
}

impl GossipClient {
    /// Build a client for `local`.
    pub fn new(
        local: CreatorId,
        transport: Arc<dyn Transport>,
        pull_timeout: Duration,
        max_missing_depth: usize,
        validator: Arc<dyn OperationValidator>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            local,
            transport,
            pull_timeout,
            max_missing_depth,
            validator,
            metrics,
        }
    }

    /// Fire-and-forget notify; errors are logged, never propagated.
    pub async fn notify(&self, remote: &CreatorId) {
        let notice = Notify {
            peer: self.local.clone(),
        };
        if let Err(e) = self.transport.notify(remote, notice).await {
            debug!(peer = %remote, err = %e, "notify failed");
        }
    }

    async fn pull_raw(
        &self,
        remote: &CreatorId,
        request: PullRequest,
    ) -> Result<PullResponse, GossipError> {
        match tokio::time::timeout(self.pull_timeout, self.transport.pull(remote, request)).await {
            Ok(result) => result,
            Err(_) => Err(GossipError::Timeout),
        }
    }

    /// Pull from `remote` and insert everything received.
    ///
    /// Missing parents trigger targeted `want_hashes` fetches, bounded by
    /// the configured recursion depth. Any validation or protocol failure
    /// from the store is fatal for the session.
    pub async fn pull_and_integrate(
        &self,
        store: &Arc<RwLock<EventStore>>,
        remote: &CreatorId,
        cursor: Option<Cursor>,
    ) -> Result<PullOutcome, GossipError> {
        let request = PullRequest {
            peer: self.local.clone(),
            cursor,
            want_hashes: Vec::new(),
        };
        let response = self.pull_raw(remote, request).await?;
        self.metrics.gossip_pulls_total.inc();

        let mut outcome = PullOutcome {
            cursor: response.cursor.clone(),
            ..PullOutcome::default()
        };
        self.integrate(store, remote, response.events, &mut outcome)
            .await?;
        Ok(outcome)
    }

    fn insert_once(
        &self,
        store: &Arc<RwLock<EventStore>>,
        event: &Event,
    ) -> Result<InsertOutcome, StoreError> {
        let mut guard = store.write().map_err(|_| StoreError::Db)?;
        guard.insert(event, EventOrigin::Peer)
    }

    /// Insert a batch, fetching missing parents with bounded targeted
    /// pulls. Iterative on purpose: the retry queue replaces recursion.
    async fn integrate(
        &self,
        store: &Arc<RwLock<EventStore>>,
        remote: &CreatorId,
        envelopes: Vec<EventEnvelope>,
        outcome: &mut PullOutcome,
    ) -> Result<(), GossipError> {
        let mut pending: VecDeque<Event> = VecDeque::with_capacity(envelopes.len());
        for envelope in envelopes {
            pending.push_back(
                envelope
                    .into_event()
                    .map_err(|e| GossipError::Validation(e.to_string()))?,
            );
        }

        let mut fetch_rounds = 0usize;
        while let Some(event) = pending.pop_front() {
            if let Payload::Operation(op) = &event.body.payload {
                self.validator
                    .validate(op)
                    .map_err(|e| GossipError::Validation(e.to_string()))?;
            }
            match self.insert_once(store, &event) {
                Ok(InsertOutcome::Inserted) => {
                    outcome.events_received += 1;
                    if event.is_merge() {
                        outcome.merge_events_received += 1;
                    }
                    self.metrics.events_inserted_total.inc();
                }
                Ok(InsertOutcome::Duplicate) => {
                    outcome.duplicates += 1;
                    self.metrics.events_duplicate_total.inc();
                }
                Err(StoreError::MissingParents { hashes }) => {
                    if fetch_rounds >= self.max_missing_depth {
                        return Err(GossipError::Incomplete(
                            "missing-parent fetch rounds exhausted".into(),
                        ));
                    }
                    fetch_rounds += 1;
                    let request = PullRequest {
                        peer: self.local.clone(),
                        cursor: None,
                        want_hashes: hashes,
                    };
                    let response = self.pull_raw(remote, request).await?;
                    if response.events.is_empty() {
                        return Err(GossipError::Incomplete(
                            "remote could not supply missing parents".into(),
                        ));
                    }
                    // Retry the blocked event after its fetched parents.
                    pending.push_front(event);
                    for envelope in response.events.into_iter().rev() {
                        pending.push_front(
                            envelope
                                .into_event()
                                .map_err(|e| GossipError::Validation(e.to_string()))?,
                        );
                    }
                }
                Err(StoreError::Validation(msg)) => {
                    warn!(peer = %remote, %msg, "invalid event from peer");
                    return Err(GossipError::Validation(msg));
                }
                Err(StoreError::ProtocolViolation(msg)) => {
                    warn!(peer = %remote, %msg, "protocol violation from peer");
                    return Err(GossipError::Validation(msg.to_string()));
                }
                Err(StoreError::LedgerMismatch) => return Err(GossipError::UnknownLedger),
                Err(e) => return Err(GossipError::Validation(e.to_string())),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::event::{genesis_pair, LedgerConfiguration};
    use crate::core::security::signer::NodeSigner;
    use crate::core::types::encode_canonical;

    #[test]
    fn wire_types_round_trip() {
        let cursor = Cursor {
            required_block_height: 3,
            watermarks: [(CreatorId(vec![1u8; 32]), 7u64)].into_iter().collect(),
        };
        let req = PullRequest {
            peer: CreatorId(vec![2u8; 32]),
            cursor: Some(cursor.clone()),
            want_hashes: vec![crate::core::types::content_hash(b"x")],
        };
        let bytes = encode_canonical(&req).unwrap();
        let back: PullRequest =
            crate::core::types::decode_canonical_limited(&bytes, MAX_REQUEST_BYTES).unwrap();
        assert_eq!(req, back);
    }

    #[test]
    fn server_serves_genesis_to_empty_cursor() {
        let signer = NodeSigner::ephemeral().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let db = sled::open(dir.path()).unwrap();
        let mut store = EventStore::open(&db).unwrap();
        let (config, merge) = genesis_pair(
            &signer,
            LedgerConfiguration {
                ledger_name: "t".into(),
                witness_pool: vec![signer.creator_id()],
                procedure: "continuity-v1".into(),
            },
        )
        .unwrap();
        store.pin_ledger(config.hash).unwrap();
        store.insert(&config, EventOrigin::Local).unwrap();
        store.insert(&merge, EventOrigin::Local).unwrap();

        let store = Arc::new(RwLock::new(store));
        let height = Arc::new(RwLock::new(0u64));
        let server = GossipServer::new(store, height, 128);

        let response = server
            .handle_pull(&PullRequest {
                peer: CreatorId(vec![9u8; 32]),
                cursor: None,
                want_hashes: Vec::new(),
            })
            .unwrap();

        // Config event precedes the genesis merge that references it.
        assert_eq!(response.events.len(), 2);
        let first = response.events[0].clone().into_event().unwrap();
        let second = response.events[1].clone().into_event().unwrap();
        assert_eq!(first.hash, config.hash);
        assert_eq!(second.hash, merge.hash);
        assert_eq!(
            response.cursor.watermarks.get(&signer.creator_id()),
            Some(&0u64)
        );
    }
}
