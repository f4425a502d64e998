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

//! Node-local assembly: one ledger's stores, gossip server, and worker.
//!
//! [`LedgerNode::create`] performs genesis and commits block 0;
//! [`LedgerNode::join`] pins an existing ledger id and starts empty,
//! catching up through gossip. Both return the worker to be driven by the
//! caller (spawned, or stepped cycle-by-cycle in tests).

use crate::core::block::{Block, BlockError, BlockStore};
use crate::core::config::EngineConfig;
use crate::core::event::{genesis_pair, EventError, LedgerConfiguration};
use crate::core::security::signer::{NodeSigner, SignerError};
use crate::core::store::{EventOrigin, EventStore, StoreError};
use crate::core::types::{now_ms, CreatorId, Hash256};
use crate::core::validator::{OperationInvalid, OperationValidator};
use crate::core::worker::{Worker, WorkerParams};
use crate::monitoring::metrics::Metrics;
use crate::networking::gossip::{GossipClient, GossipServer, Transport};
use crate::networking::peer_registry::{PeerRegistry, RegistryError, RegistryTuning};
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Notify};
use tracing::info;

const PROCEDURE: &str = "continuity-v1";

/// Node assembly errors.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("db open")]
    Db,
    #[error("lock poisoned")]
    Lock,
    #[error("invalid ledger id")]
    BadLedgerId,
    #[error(transparent)]
    Signer(#[from] SignerError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Block(#[from] BlockError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Event(#[from] EventError),
}

/// Backpressure surface of the local operation API.
#[derive(Debug, Error)]
pub enum SubmitError {
    /// The bounded operation queue is full; retry later.
    #[error("operation queue full")]
    QueueFull,
    /// The node is shutting down.
    #[error("node halted")]
    Halted,
    /// The operation failed validation.
    #[error(transparent)]
    Invalid(#[from] OperationInvalid),
}

/// Handle to one ledger's node-local state.
pub struct LedgerNode {
    creator: CreatorId,
    ledger_id: String,
    store: Arc<RwLock<EventStore>>,
    blocks: BlockStore,
    local_block_height: Arc<RwLock<u64>>,
    server: GossipServer,
    wake: Arc<Notify>,
    ops_tx: mpsc::Sender<Vec<u8>>,
    validator: Arc<dyn OperationValidator>,
    shutdown_tx: watch::Sender<bool>,
}

enum Bootstrap {
    Create {
        ledger_name: String,
        witness_pool: Vec<CreatorId>,
    },
    Join {
        ledger_id: String,
    },
}

impl LedgerNode {
    /// Create a new ledger: genesis pair signed by this node, block 0
    /// committed. The local creator always joins the witness pool.
    pub fn create(
        data_dir: &Path,
        ledger_name: &str,
        witness_pool: Vec<CreatorId>,
        cfg: EngineConfig,
        transport: Arc<dyn Transport>,
        validator: Arc<dyn OperationValidator>,
        metrics: Arc<Metrics>,
    ) -> Result<(Self, Worker), NodeError> {
        Self::build(
            data_dir,
            cfg,
            transport,
            validator,
            metrics,
            Bootstrap::Create {
                ledger_name: ledger_name.to_string(),
                witness_pool,
            },
        )
    }

    /// Join an existing ledger by id; genesis arrives through gossip.
    pub fn join(
        data_dir: &Path,
        ledger_id: &str,
        cfg: EngineConfig,
        transport: Arc<dyn Transport>,
        validator: Arc<dyn OperationValidator>,
        metrics: Arc<Metrics>,
    ) -> Result<(Self, Worker), NodeError> {
        Self::build(
            data_dir,
            cfg,
            transport,
            validator,
            metrics,
            Bootstrap::Join {
                ledger_id: ledger_id.to_string(),
            },
        )
    }

    fn build(
        data_dir: &Path,
        cfg: EngineConfig,
        transport: Arc<dyn Transport>,
        validator: Arc<dyn OperationValidator>,
        metrics: Arc<Metrics>,
        bootstrap: Bootstrap,
    ) -> Result<(Self, Worker), NodeError> {
        std::fs::create_dir_all(data_dir).map_err(|_| NodeError::Db)?;
        let signer = Arc::new(NodeSigner::load_or_create(data_dir)?);
        let creator = signer.creator_id();

        let db = sled::open(data_dir.join("db")).map_err(|_| NodeError::Db)?;
        let mut store = EventStore::open(&db)?;
        let blocks = BlockStore::open(&db)?;
        let registry = PeerRegistry::open(&db, RegistryTuning::from(&cfg))?;

        match bootstrap {
            Bootstrap::Create {
                ledger_name,
                witness_pool,
            } => {
                if store.genesis().is_none() {
                    let mut pool = witness_pool;
                    if !pool.contains(&creator) {
                        pool.push(creator.clone());
                    }
                    let config = LedgerConfiguration {
                        ledger_name,
                        witness_pool: pool,
                        procedure: PROCEDURE.into(),
                    };
                    let (config_event, genesis_merge) = genesis_pair(&signer, config)?;
                    store.pin_ledger(config_event.hash)?;
                    store.insert(&config_event, EventOrigin::Local)?;
                    store.insert(&genesis_merge, EventOrigin::Local)?;
                    info!(ledger = %config_event.hash, "ledger created");
                }
            }
            Bootstrap::Join { ledger_id } => {
                let pin =
                    Hash256::from_multibase(&ledger_id).ok_or(NodeError::BadLedgerId)?;
                if store.ledger_id().is_none() {
                    store.pin_ledger(pin)?;
                    info!(ledger = %pin, "joining ledger");
                }
            }
        }
        let ledger_id = store.ledger_id().ok_or(NodeError::BadLedgerId)?;

        let local_block_height =
            Arc::new(RwLock::new(blocks.latest_height()?.unwrap_or(0)));
        let store = Arc::new(RwLock::new(store));
        let server = GossipServer::new(
            store.clone(),
            local_block_height.clone(),
            cfg.gossip_batch_limit,
        );
        let wake = Arc::new(Notify::new());
        let (ops_tx, ops_rx) = mpsc::channel(cfg.operation_queue_capacity);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let client = GossipClient::new(
            creator.clone(),
            transport,
            Duration::from_millis(cfg.pull_timeout_ms),
            cfg.max_missing_depth,
            validator.clone(),
            metrics.clone(),
        );

        let worker = Worker::new(WorkerParams {
            creator: creator.clone(),
            signer,
            cfg,
            store: store.clone(),
            blocks: blocks.clone(),
            registry,
            client,
            validator: validator.clone(),
            ops_rx,
            wake: wake.clone(),
            shutdown: shutdown_rx,
            local_block_height: local_block_height.clone(),
            metrics,
            rng_seed: None,
        });

        let node = Self {
            creator,
            ledger_id,
            store,
            blocks,
            local_block_height,
            server,
            wake,
            ops_tx,
            validator,
            shutdown_tx,
        };
        Ok((node, worker))
    }

    /// The local creator identity.
    pub fn creator(&self) -> &CreatorId {
        &self.creator
    }

    /// The ledger id (multibase hash of the configuration event).
    pub fn ledger_id(&self) -> &str {
        &self.ledger_id
    }

    /// The gossip server, for registering with a transport.
    pub fn gossip_server(&self) -> GossipServer {
        self.server.clone()
    }

    /// The wake channel fed by peer notifies.
    pub fn wake_handle(&self) -> Arc<Notify> {
        self.wake.clone()
    }

    /// Submit one opaque operation; validated, then queued for the worker.
    /// A full queue is backpressure, not an error in the operation.
    pub fn submit_operation(&self, operation: Vec<u8>) -> Result<(), SubmitError> {
        self.validator.validate(&operation)?;
        self.ops_tx.try_send(operation).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SubmitError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => SubmitError::Halted,
        })?;
        self.wake.notify_one();
        Ok(())
    }

    /// Committed chain head.
    pub fn latest_block(&self) -> Result<Option<Block>, BlockError> {
        self.blocks.latest()
    }

    /// Block by height.
    pub fn block(&self, height: u64) -> Result<Option<Block>, BlockError> {
        self.blocks.get(height)
    }

    /// Total stored events (committed and not).
    pub fn event_count(&self) -> Result<usize, NodeError> {
        Ok(self
            .store
            .read()
            .map_err(|_| NodeError::Lock)?
            .event_count())
    }

    /// Ask the worker to stop after the current cycle.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        self.wake.notify_one();
        info!(ledger = %self.ledger_id, at = now_ms(), "shutdown requested");
    }
}
