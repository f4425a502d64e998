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

//! The per-ledger worker: sequences gossip, merge, consensus, and commit.
//!
//! One worker owns all writes to its ledger's stores and registry. Each
//! cycle drains the local operation queue, pulls from eligible peers,
//! emits at most one merge event, and evaluates consensus until the
//! engine stops deciding. Between cycles the worker sleeps until the
//! earliest peer backoff expires or a notify wakes it; concurrent
//! notifies coalesce on one wake channel.

use crate::core::block::{Block, BlockBody, BlockError, BlockStore};
use crate::core::config::EngineConfig;
use crate::core::consensus::continuity::{ConsensusInput, ContinuityEngine};
use crate::core::consensus::witness::select_witnesses;
use crate::core::event::{new_regular, EventError};
use crate::core::merge::{create_merge, MergeError, NodeContext};
use crate::core::security::signer::NodeSigner;
use crate::core::store::{EventOrigin, EventStore, StoreError};
use crate::core::types::{now_ms, CreatorId, Hash256};
use crate::core::validator::OperationValidator;
use crate::monitoring::metrics::Metrics;
use crate::networking::gossip::GossipClient;
use crate::networking::peer_registry::{
    GossipFailure, GossipSuccess, PeerRegistry, RegistryError,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, info, warn};

/// Consensus commits per cycle, bounding catch-up bursts.
const MAX_BLOCKS_PER_CYCLE: usize = 64;

/// Worker errors.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("lock poisoned")]
    Lock,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Block(#[from] BlockError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Merge(#[from] MergeError),
    #[error(transparent)]
    Event(#[from] EventError),
}

/// What one cycle accomplished.
#[derive(Clone, Debug, Default)]
pub struct CycleOutcome {
    /// Events newly inserted from gossip.
    pub events_pulled: u64,
    /// The merge event emitted this cycle, if any.
    pub merge_event: Option<Hash256>,
    /// Blocks committed this cycle.
    pub blocks_committed: u64,
}

/// Everything a worker needs at construction.
pub struct WorkerParams {
    /// Local identity.
    pub creator: CreatorId,
    /// Node signer.
    pub signer: Arc<NodeSigner>,
    /// Engine configuration.
    pub cfg: EngineConfig,
    /// Shared event store.
    pub store: Arc<RwLock<EventStore>>,
    /// Block chain store.
    pub blocks: BlockStore,
    /// Peer registry (exclusively owned by the worker).
    pub registry: PeerRegistry,
    /// Gossip client.
    pub client: GossipClient,
    /// Operation validator.
    pub validator: Arc<dyn OperationValidator>,
    /// Local operation intake.
    pub ops_rx: mpsc::Receiver<Vec<u8>>,
    /// Coalesced wake channel fed by notifies.
    pub wake: Arc<Notify>,
    /// Cooperative shutdown flag.
    pub shutdown: watch::Receiver<bool>,
    /// Shared committed-height cell (read by the gossip server).
    pub local_block_height: Arc<RwLock<u64>>,
    /// Metrics.
    pub metrics: Arc<Metrics>,
    /// Fixed RNG seed for deterministic tests; `None` seeds from entropy.
    pub rng_seed: Option<u64>,
}

/// The per-ledger driver.
pub struct Worker {
    creator: CreatorId,
    signer: Arc<NodeSigner>,
    cfg: EngineConfig,
    store: Arc<RwLock<EventStore>>,
    blocks: BlockStore,
    registry: PeerRegistry,
    client: GossipClient,
    engine: ContinuityEngine,
    validator: Arc<dyn OperationValidator>,
    ops_rx: mpsc::Receiver<Vec<u8>>,
    wake: Arc<Notify>,
    shutdown: watch::Receiver<bool>,
    local_block_height: Arc<RwLock<u64>>,
    witnesses: BTreeSet<CreatorId>,
    recommended: BTreeSet<CreatorId>,
    rng: StdRng,
    metrics: Arc<Metrics>,
}

impl Worker {
    /// Build a worker. Witnesses are derived on the first cycle.
    pub fn new(params: WorkerParams) -> Self {
        let rng = match params.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            creator: params.creator,
            signer: params.signer,
            cfg: params.cfg,
            store: params.store,
            blocks: params.blocks,
            registry: params.registry,
            client: params.client,
            engine: ContinuityEngine::new(),
            validator: params.validator,
            ops_rx: params.ops_rx,
            wake: params.wake,
            shutdown: params.shutdown,
            local_block_height: params.local_block_height,
            witnesses: BTreeSet::new(),
            recommended: BTreeSet::new(),
            rng,
            metrics: params.metrics,
        }
    }

    /// Register a discovered peer. Recommended peers are re-seeded after
    /// deletion; others must be re-discovered.
    pub fn add_peer(&mut self, id: CreatorId, recommended: bool) -> Result<bool, WorkerError> {
        if recommended {
            self.recommended.insert(id.clone());
        }
        let added = self.registry.add_peer(id, recommended, now_ms())?;
        self.metrics.peers.set(self.registry.len() as i64);
        Ok(added)
    }

    fn reseed_recommended(&mut self) -> Result<(), WorkerError> {
        let now = now_ms();
        let missing: Vec<CreatorId> = self
            .recommended
            .iter()
            .filter(|id| !self.registry.contains(id))
            .cloned()
            .collect();
        for id in missing {
            self.registry.add_peer(id, true, now)?;
        }
        Ok(())
    }

    /// Registry introspection (candidate lists, reputations).
    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    /// Current witness set.
    pub fn witnesses(&self) -> &BTreeSet<CreatorId> {
        &self.witnesses
    }

    fn committed_height(&self) -> Result<u64, WorkerError> {
        Ok(*self.local_block_height.read().map_err(|_| WorkerError::Lock)?)
    }

    fn refresh_witnesses(&mut self, chain_head: &Block) -> Result<(), WorkerError> {
        let pool: BTreeSet<CreatorId> = {
            let store = self.store.read().map_err(|_| WorkerError::Lock)?;
            store
                .configuration()
                .map(|c| c.witness_pool.iter().cloned().collect())
                .unwrap_or_default()
        };
        self.witnesses = select_witnesses(&chain_head.hash, &pool);
        self.registry.set_witnesses(self.witnesses.clone());
        Ok(())
    }

    /// Commit block 0 once both genesis events are present.
    fn finalize_genesis_if_ready(&mut self) -> Result<bool, WorkerError> {
        if self.blocks.latest_height()?.is_some() {
            if self.witnesses.is_empty() {
                // Reopened ledger: re-derive witnesses from the chain head.
                if let Some(head) = self.blocks.latest()? {
                    self.refresh_witnesses(&head)?;
                }
            }
            return Ok(false);
        }
        let pin = {
            let store = self.store.read().map_err(|_| WorkerError::Lock)?;
            store.genesis()
        };
        let Some(pin) = pin else {
            return Ok(false);
        };
        let block = self.blocks.append_genesis(pin.config_event, pin.genesis_merge)?;
        {
            let mut store = self.store.write().map_err(|_| WorkerError::Lock)?;
            store.mark_consensus(&[pin.config_event, pin.genesis_merge], 0, now_ms())?;
        }
        *self.local_block_height.write().map_err(|_| WorkerError::Lock)? = 0;
        self.metrics.block_height.set(0);
        self.refresh_witnesses(&block)?;
        info!(block = %block.hash, "genesis block committed");
        Ok(true)
    }

    /// Drain the local operation queue into regular events.
    fn drain_operations(&mut self) -> Result<u64, WorkerError> {
        let mut accepted = 0u64;
        loop {
            let op = match self.ops_rx.try_recv() {
                Ok(op) => op,
                Err(_) => break,
            };
            if let Err(e) = self.validator.validate(&op) {
                warn!(err = %e, "operation rejected by validator");
                continue;
            }
            match self.append_local_operation(op) {
                Ok(hash) => {
                    debug!(event = %hash, "operation event created");
                    accepted += 1;
                }
                Err(e) => warn!(err = %e, "operation event rejected"),
            }
        }
        Ok(accepted)
    }

    fn append_local_operation(&mut self, op: Vec<u8>) -> Result<Hash256, WorkerError> {
        let basis = self.committed_height()?;
        let mut store = self.store.write().map_err(|_| WorkerError::Lock)?;
        let (tail, tail_height) = match store.latest_regular(&self.creator)? {
            Some(tail) => tail,
            None => store.local_branch_head(&self.creator)?,
        };
        let event = new_regular(&self.signer, op, tail, tail_height, basis)?;
        store.insert(&event, EventOrigin::Local)?;
        Ok(event.hash)
    }

    /// Pull from up to `gossip_fanout` eligible peers.
    async fn gossip(&mut self) -> Result<u64, WorkerError> {
        let now = now_ms();
        let peers: Vec<CreatorId> = self
            .registry
            .candidates(now)
            .into_iter()
            .take(self.cfg.gossip_fanout)
            .map(|p| p.id)
            .collect();

        let mut pulled = 0u64;
        for peer in peers {
            if *self.shutdown.borrow() {
                break;
            }
            // Refresh the session cursor with what the store actually
            // holds, so a lost cursor never re-downloads the full DAG.
            let mut cursor = self
                .registry
                .get(&peer)
                .and_then(|p| p.status.cursor.clone())
                .unwrap_or_default();
            cursor.watermarks = {
                let store = self.store.read().map_err(|_| WorkerError::Lock)?;
                store.merge_watermarks()
            };
            match self
                .client
                .pull_and_integrate(&self.store, &peer, Some(cursor))
                .await
            {
                Ok(outcome) => {
                    pulled += outcome.events_received;
                    let local_block_height = self.committed_height()?;
                    self.registry.record_success(
                        &peer,
                        GossipSuccess {
                            merge_events_received: outcome.merge_events_received,
                            required_block_height: outcome.cursor.required_block_height,
                            cursor: Some(outcome.cursor),
                            local_block_height,
                        },
                        now_ms(),
                    )?;
                }
                Err(e) => {
                    self.metrics.gossip_failures_total.inc();
                    let fatal = e.is_fatal();
                    warn!(peer = %peer, err = %e, fatal, "gossip pull failed");
                    self.registry.record_failure(
                        &peer,
                        GossipFailure {
                            error: e.to_string(),
                            cursor: None,
                            fatal,
                        },
                        now_ms(),
                    )?;
                }
            }
        }
        self.metrics.peers.set(self.registry.len() as i64);
        Ok(pulled)
    }

    /// Emit at most one merge event and notify peers about it.
    async fn maybe_merge(&mut self) -> Result<Option<Hash256>, WorkerError> {
        let draw: f64 = self.rng.gen();
        let basis = self.committed_height()?;
        let created = {
            let store = self.store.read().map_err(|_| WorkerError::Lock)?;
            if !store.genesis_ready() {
                return Ok(None);
            }
            let slice = store.recent_history()?;
            let ctx = NodeContext {
                creator: self.creator.clone(),
                basis_block_height: basis,
            };
            create_merge(
                &ctx,
                &self.signer,
                &store,
                &slice,
                &self.witnesses,
                &self.cfg,
                draw,
            )?
        };
        let Some(event) = created else {
            return Ok(None);
        };
        {
            let mut store = self.store.write().map_err(|_| WorkerError::Lock)?;
            store.insert(&event, EventOrigin::Local)?;
        }
        self.metrics.merge_events_created_total.inc();
        debug!(event = %event.hash, "merge event created");

        let now = now_ms();
        let targets: Vec<CreatorId> = self
            .registry
            .candidates(now)
            .into_iter()
            .take(self.cfg.gossip_fanout)
            .map(|p| p.id)
            .collect();
        futures::future::join_all(targets.iter().map(|t| self.client.notify(t))).await;
        for target in &targets {
            let _ = self.registry.record_push(target, now);
        }
        Ok(Some(event.hash))
    }

    /// Evaluate consensus repeatedly; each decision commits one block.
    fn evaluate_consensus(&mut self) -> Result<u64, WorkerError> {
        let mut committed = 0u64;
        for _ in 0..MAX_BLOCKS_PER_CYCLE {
            let Some(prev) = self.blocks.latest()? else {
                break;
            };
            let result = {
                let store = self.store.read().map_err(|_| WorkerError::Lock)?;
                let slice = store.recent_history()?;
                let forked = store.forked_creators().clone();
                self.engine.evaluate(&ConsensusInput {
                    slice: &slice,
                    witnesses: &self.witnesses,
                    forked: &forked,
                    previous_block_hash: prev.hash,
                    block_height: prev.height() + 1,
                })
            };
            if !result.consensus {
                break;
            }
            let block = Block::from_body(BlockBody {
                height: result.block_height,
                previous_hash: prev.hash,
                event_hashes: result.block_events.clone(),
                consensus_proof: result.consensus_proof.clone(),
            })?;
            {
                let mut store = self.store.write().map_err(|_| WorkerError::Lock)?;
                store.mark_consensus(&result.block_events, result.block_height, now_ms())?;
            }
            self.blocks.append(&block)?;
            *self
                .local_block_height
                .write()
                .map_err(|_| WorkerError::Lock)? = block.height();
            self.metrics.blocks_committed_total.inc();
            self.metrics.block_height.set(block.height() as i64);
            info!(
                height = block.height(),
                events = block.body.event_hashes.len(),
                block = %block.hash,
                "block committed"
            );
            self.refresh_witnesses(&block)?;
            committed += 1;
        }
        Ok(committed)
    }

    /// One gossip → merge → consensus → commit cycle.
    pub async fn run_cycle(&mut self) -> Result<CycleOutcome, WorkerError> {
        if *self.shutdown.borrow() {
            return Ok(CycleOutcome::default());
        }
        self.finalize_genesis_if_ready()?;
        self.reseed_recommended()?;
        self.drain_operations()?;
        let events_pulled = self.gossip().await?;
        let merge_event = self.maybe_merge().await?;
        let blocks_committed = self.evaluate_consensus()?;
        Ok(CycleOutcome {
            events_pulled,
            merge_event,
            blocks_committed,
        })
    }

    /// Drive cycles until shutdown. A failed cycle is logged and retried;
    /// it never takes the other ledgers' runtime down.
    pub async fn run(mut self) {
        info!(creator = %self.creator, "worker started");
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            if let Err(e) = self.run_cycle().await {
                warn!(err = %e, "worker cycle failed");
            }

            let now = now_ms();
            let idle_ms = match self.registry.next_ready_at(now) {
                None => 50,
                Some(ready_at) => ready_at.saturating_sub(now).clamp(10, 1_000),
            };
            let mut shutdown = self.shutdown.clone();
            tokio::select! {
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(Duration::from_millis(idle_ms)) => {}
                _ = shutdown.changed() => {}
            }
        }
        info!(creator = %self.creator, "worker stopped");
    }
}
