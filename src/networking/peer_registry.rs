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

//! Peer registry: reputation, backoff, and idle accounting.
//!
//! Deterministic, integer-only, with `now` injected by the caller. A
//! peer's reputation lives in [0, 100]. Failures cost reputation on a
//! grace-period schedule, idleness while the rest of the network advances
//! costs reputation proportionally, and productive gossip earns it back.
//! Witnesses are clamped at 0 instead of being deleted.

use crate::core::config::EngineConfig;
use crate::core::types::{decode_canonical_limited, encode_canonical, CreatorId};
use crate::networking::gossip::Cursor;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use tracing::{debug, info, warn};

const TREE_PEERS: &str = "peers";
const MAX_PEER_RECORD_BYTES: usize = 1 << 20;

/// Registry errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("db io")]
    Db,
    #[error("codec")]
    Codec,
    #[error("unknown peer")]
    UnknownPeer,
}

/// Result of the last pull from a peer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PullResult {
    /// Last pull succeeded.
    Success,
    /// Last pull failed with the recorded error.
    Failed(String),
}

/// Snapshot taken at the first failure of a streak.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureMark {
    /// When the streak began (ms).
    pub time: u64,
    /// Reputation when the streak began.
    pub reputation: i64,
}

/// Marker set when a peer gossips successfully without new events.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdleMark {
    /// When idleness was last accounted (ms).
    pub time: u64,
    /// The local block height at that time.
    pub local_block_height: u64,
}

/// Mutable gossip status of a peer.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerStatus {
    /// Do not gossip with this peer before this time (ms).
    pub backoff_until: u64,
    /// Last pull attempt (ms).
    pub last_pull_at: u64,
    /// Last notify sent (ms).
    pub last_push_at: u64,
    /// Outcome of the last pull.
    pub last_pull_result: Option<PullResult>,
    /// Cursor from the last successful pull.
    pub cursor: Option<Cursor>,
    /// The peer's committed block height from its last cursor.
    pub required_block_height: u64,
    /// Consecutive failed pulls.
    pub consecutive_failures: u32,
    /// First failure of the current streak.
    pub first_failure: Option<FailureMark>,
    /// Idle marker, see [`IdleMark`].
    pub idle: Option<IdleMark>,
}

/// One known remote peer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    /// Peer identity.
    pub id: CreatorId,
    /// Reputation in [0, 100].
    pub reputation: i64,
    /// Operator-recommended peers sort first.
    pub recommended: bool,
    /// Gossip status.
    pub status: PeerStatus,
    /// Update sequence number.
    pub sequence: u64,
}

/// Outcome of a successful gossip session, as reported by the worker.
#[derive(Clone, Debug, Default)]
pub struct GossipSuccess {
    /// Merge events newly received from the peer.
    pub merge_events_received: u64,
    /// Cursor returned by the peer.
    pub cursor: Option<Cursor>,
    /// The peer's committed block height.
    pub required_block_height: u64,
    /// Our committed block height at record time.
    pub local_block_height: u64,
}

/// Outcome of a failed gossip session.
#[derive(Clone, Debug, Default)]
pub struct GossipFailure {
    /// Error description.
    pub error: String,
    /// Replacement cursor, if the failure produced one. `None` preserves
    /// the stored cursor.
    pub cursor: Option<Cursor>,
    /// Protocol violations delete the peer immediately.
    pub fatal: bool,
}

/// Reputation/backoff tuning, derived from the engine config.
#[derive(Clone, Debug)]
pub struct RegistryTuning {
    /// Maximum failure backoff (ms).
    pub max_failure_ms: u64,
    /// Per-failure backoff step (ms).
    pub min_failure_ms: u64,
    /// Failure grace period (ms) over which a streak costs 100 points.
    pub max_failure_grace_period_ms: u64,
    /// Maximum idle backoff (ms).
    pub max_idle_ms: u64,
    /// Per-point idle backoff step (ms).
    pub min_idle_ms: u64,
    /// Idle grace period (ms) over which idleness costs 100 points.
    pub max_idle_grace_period_ms: u64,
    /// Untrusted peers retained (reputation 0).
    pub untrusted_capacity: usize,
    /// Total peer table capacity.
    pub capacity: usize,
}

impl From<&EngineConfig> for RegistryTuning {
    fn from(cfg: &EngineConfig) -> Self {
        Self {
            max_failure_ms: cfg.max_failure_ms,
            min_failure_ms: cfg.min_failure_ms,
            max_failure_grace_period_ms: cfg.max_failure_grace_period_ms,
            max_idle_ms: cfg.max_idle_ms,
            min_idle_ms: cfg.min_idle_ms,
            max_idle_grace_period_ms: cfg.max_idle_grace_period_ms,
            untrusted_capacity: 100,
            capacity: cfg.peer_capacity,
        }
    }
}

/// The peer registry for one ledger, persisted to the sled `peers` tree.
pub struct PeerRegistry {
    tree: sled::Tree,
    tuning: RegistryTuning,
    peers: BTreeMap<CreatorId, PeerRecord>,
    witnesses: BTreeSet<CreatorId>,
}

impl PeerRegistry {
    /// Open the peers tree and load all records.
    pub fn open(db: &sled::Db, tuning: RegistryTuning) -> Result<Self, RegistryError> {
        let tree = db.open_tree(TREE_PEERS).map_err(|_| RegistryError::Db)?;
        let mut peers = BTreeMap::new();
        for item in tree.iter() {
            let (_, value) = item.map_err(|_| RegistryError::Db)?;
            let record: PeerRecord = decode_canonical_limited(&value, MAX_PEER_RECORD_BYTES)
                .map_err(|_| RegistryError::Codec)?;
            peers.insert(record.id.clone(), record);
        }
        Ok(Self {
            tree,
            tuning,
            peers,
            witnesses: BTreeSet::new(),
        })
    }

    /// Replace the current witness set. Witnesses are never pruned.
    pub fn set_witnesses(&mut self, witnesses: BTreeSet<CreatorId>) {
        self.witnesses = witnesses;
    }

    /// Whether the peer is a current witness.
    pub fn is_witness(&self, id: &CreatorId) -> bool {
        self.witnesses.contains(id)
    }

    /// Number of known peers.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Whether the peer is known.
    pub fn contains(&self, id: &CreatorId) -> bool {
        self.peers.contains_key(id)
    }

    /// Peer lookup.
    pub fn get(&self, id: &CreatorId) -> Option<&PeerRecord> {
        self.peers.get(id)
    }

    /// Peers with reputation at most `max`.
    pub fn count_with_reputation_at_most(&self, max: i64) -> usize {
        self.peers.values().filter(|p| p.reputation <= max).count()
    }

    /// Register a discovered peer. Returns false when the table is full and
    /// no one could be displaced.
    pub fn add_peer(
        &mut self,
        id: CreatorId,
        recommended: bool,
        now: u64,
    ) -> Result<bool, RegistryError> {
        if self.peers.contains_key(&id) {
            return Ok(true);
        }
        if self.peers.len() >= self.tuning.capacity && !self.displace_one()? {
            return Ok(false);
        }
        let record = PeerRecord {
            id: id.clone(),
            reputation: 0,
            recommended,
            status: PeerStatus {
                backoff_until: now,
                ..PeerStatus::default()
            },
            sequence: 0,
        };
        self.save(&record)?;
        self.peers.insert(id, record);
        Ok(true)
    }

    fn displace_one(&mut self) -> Result<bool, RegistryError> {
        let victim = self
            .peers
            .values()
            .filter(|p| !p.recommended && !self.witnesses.contains(&p.id))
            .min_by_key(|p| (p.reputation, p.status.last_pull_at))
            .map(|p| p.id.clone());
        match victim {
            Some(id) => {
                self.delete(&id)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Peers eligible for gossip at `now`, sorted by
    /// `(recommended desc, reputation desc, last_pull_at asc)`.
    pub fn candidates(&self, now: u64) -> Vec<PeerRecord> {
        let mut out: Vec<PeerRecord> = self
            .peers
            .values()
            .filter(|p| p.status.backoff_until <= now)
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            (b.recommended, b.reputation, std::cmp::Reverse(b.status.last_pull_at)).cmp(&(
                a.recommended,
                a.reputation,
                std::cmp::Reverse(a.status.last_pull_at),
            ))
        });
        out
    }

    /// Earliest time any peer leaves backoff; `None` when a peer is ready.
    pub fn next_ready_at(&self, now: u64) -> Option<u64> {
        let mut earliest: Option<u64> = None;
        for p in self.peers.values() {
            if p.status.backoff_until <= now {
                return None;
            }
            earliest = Some(match earliest {
                Some(t) => t.min(p.status.backoff_until),
                None => p.status.backoff_until,
            });
        }
        earliest
    }

    /// Record a successful gossip session.
    pub fn record_success(
        &mut self,
        id: &CreatorId,
        outcome: GossipSuccess,
        now: u64,
    ) -> Result<(), RegistryError> {
        let is_witness = self.witnesses.contains(id);
        let tuning = self.tuning.clone();
        let record = self.peers.get_mut(id).ok_or(RegistryError::UnknownPeer)?;

        record.status.consecutive_failures = 0;
        record.status.first_failure = None;
        record.status.backoff_until = now;
        record.status.last_pull_at = now;
        record.status.last_pull_result = Some(PullResult::Success);
        record.status.required_block_height = outcome.required_block_height;
        if let Some(cursor) = outcome.cursor {
            record.status.cursor = Some(cursor);
        }

        if outcome.merge_events_received > 0 {
            record.reputation = (record.reputation + 1).min(100);
            record.status.idle = None;
        } else {
            match record.status.idle {
                None => {
                    record.status.idle = Some(IdleMark {
                        time: now,
                        local_block_height: outcome.local_block_height,
                    });
                }
                Some(mark) if mark.local_block_height == outcome.local_block_height => {
                    // Everyone is idle; no penalty, keep the clock current.
                    record.status.idle = Some(IdleMark {
                        time: now,
                        local_block_height: mark.local_block_height,
                    });
                }
                Some(mark) => {
                    // Others advanced while this peer produced nothing.
                    let time_per_point = tuning.max_idle_grace_period_ms.div_ceil(100).max(1);
                    let points = (now.saturating_sub(mark.time) / time_per_point) as i64;
                    if points > 0 {
                        record.reputation -= points;
                        record.status.idle = Some(IdleMark {
                            time: mark.time + points as u64 * time_per_point,
                            local_block_height: outcome.local_block_height,
                        });
                        record.status.backoff_until = now
                            + tuning
                                .max_idle_ms
                                .min(tuning.min_idle_ms.saturating_mul(points.max(1) as u64));
                        debug!(peer = %id, points, "idle penalty applied");
                    } else {
                        record.status.idle = Some(IdleMark {
                            time: mark.time,
                            local_block_height: outcome.local_block_height,
                        });
                    }
                }
            }
        }

        if record.reputation < 0 {
            if is_witness {
                record.reputation = 0;
            } else {
                let id = id.clone();
                info!(peer = %id, "peer exhausted reputation; deleting");
                self.delete(&id)?;
                return Ok(());
            }
        }
        let reputation_now = record.reputation;

        // Capacity: an unproductive stranger does not displace the
        // untrusted pool once it is full.
        if !is_witness
            && reputation_now == 0
            && self.count_with_reputation_at_most(0) > tuning.untrusted_capacity
        {
            debug!(peer = %id, "untrusted pool full; dropping peer");
            self.delete(id)?;
            return Ok(());
        }

        self.bump_and_save(id)
    }

    /// Record an outbound notify.
    pub fn record_push(&mut self, id: &CreatorId, now: u64) -> Result<(), RegistryError> {
        let record = self.peers.get_mut(id).ok_or(RegistryError::UnknownPeer)?;
        record.status.last_push_at = now;
        self.bump_and_save(id)
    }

    /// Record a failed gossip session.
    pub fn record_failure(
        &mut self,
        id: &CreatorId,
        failure: GossipFailure,
        now: u64,
    ) -> Result<(), RegistryError> {
        if failure.fatal {
            warn!(peer = %id, error = %failure.error, "fatal gossip failure; deleting peer");
            return self.delete(id);
        }

        let is_witness = self.witnesses.contains(id);
        let tuning = self.tuning.clone();
        let record = self.peers.get_mut(id).ok_or(RegistryError::UnknownPeer)?;

        record.status.consecutive_failures =
            record.status.consecutive_failures.saturating_add(1);
        record.status.last_pull_at = now;
        record.status.last_pull_result = Some(PullResult::Failed(failure.error));
        if let Some(cursor) = failure.cursor {
            // A replacement cursor was supplied; otherwise the stored one
            // stands.
            record.status.cursor = Some(cursor);
        }

        match record.status.first_failure {
            None => {
                record.status.first_failure = Some(FailureMark {
                    time: now,
                    reputation: record.reputation,
                });
                record.reputation -= 1;
            }
            Some(mark) => {
                let elapsed = now.saturating_sub(mark.time);
                let points = if tuning.max_failure_grace_period_ms == 0 {
                    100
                } else {
                    (elapsed / tuning.max_failure_grace_period_ms) as i64 * 100
                };
                record.reputation = (mark.reputation - 1).min(mark.reputation - points);
            }
        }

        record.status.backoff_until = now
            + tuning.max_failure_ms.min(
                tuning
                    .min_failure_ms
                    .saturating_mul(record.status.consecutive_failures as u64),
            );

        if record.reputation < 0 {
            if is_witness {
                record.reputation = 0;
            } else {
                let id = id.clone();
                info!(peer = %id, "peer exhausted reputation; deleting");
                return self.delete(&id);
            }
        }

        self.bump_and_save(id)
    }

    fn bump_and_save(&mut self, id: &CreatorId) -> Result<(), RegistryError> {
        let record = self.peers.get_mut(id).ok_or(RegistryError::UnknownPeer)?;
        record.sequence = record.sequence.saturating_add(1);
        let snapshot = record.clone();
        self.save(&snapshot)
    }

    fn save(&self, record: &PeerRecord) -> Result<(), RegistryError> {
        let bytes = encode_canonical(record).map_err(|_| RegistryError::Codec)?;
        self.tree
            .insert(record.id.0.clone(), bytes)
            .map_err(|_| RegistryError::Db)?;
        Ok(())
    }

    fn delete(&mut self, id: &CreatorId) -> Result<(), RegistryError> {
        self.peers.remove(id);
        self.tree
            .remove(id.0.clone())
            .map_err(|_| RegistryError::Db)?;
        Ok(())
    }
}
