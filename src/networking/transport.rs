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

//! In-process loopback transport.
//!
//! Implements the [`Transport`] seam by routing requests directly to
//! registered gossip servers. Used by the test suite and multi-node
//! simulations; a production deployment supplies an HTTP-backed transport
//! with the same contract.

use crate::core::types::CreatorId;
use crate::networking::gossip::{
    GossipError, GossipServer, NetworkDetails, Notify, PullRequest, PullResponse, Transport,
};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify as WakeSignal;

#[derive(Clone)]
struct Endpoint {
    server: GossipServer,
    wake: Arc<WakeSignal>,
}

/// Routes pulls and notifies between in-process nodes, with per-peer
/// offline fault injection.
#[derive(Default)]
pub struct LoopbackNetwork {
    endpoints: Mutex<HashMap<CreatorId, Endpoint>>,
    offline: Mutex<BTreeSet<CreatorId>>,
}

impl LoopbackNetwork {
    /// Empty network.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a node's server and wake handle under its identity.
    pub fn register(&self, id: CreatorId, server: GossipServer, wake: Arc<WakeSignal>) {
        let mut endpoints = self.endpoints.lock().unwrap_or_else(|e| e.into_inner());
        endpoints.insert(id, Endpoint { server, wake });
    }

    /// Simulate a peer going offline (pulls fail with a network error).
    pub fn set_offline(&self, id: &CreatorId, offline: bool) {
        let mut set = self.offline.lock().unwrap_or_else(|e| e.into_inner());
        if offline {
            set.insert(id.clone());
        } else {
            set.remove(id);
        }
    }

    fn endpoint(&self, id: &CreatorId) -> Result<Endpoint, GossipError> {
        {
            let offline = self.offline.lock().unwrap_or_else(|e| e.into_inner());
            if offline.contains(id) {
                return Err(GossipError::Network(NetworkDetails {
                    address: id.to_multibase(),
                    code: Some("ECONNREFUSED".into()),
                    errno: Some(111),
                    ..NetworkDetails::default()
                }));
            }
        }
        let endpoints = self.endpoints.lock().unwrap_or_else(|e| e.into_inner());
        endpoints.get(id).cloned().ok_or_else(|| {
            GossipError::Network(NetworkDetails {
                address: id.to_multibase(),
                code: Some("EHOSTUNREACH".into()),
                errno: Some(113),
                ..NetworkDetails::default()
            })
        })
    }
}

#[async_trait::async_trait]
impl Transport for LoopbackNetwork {
    async fn pull(
        &self,
        remote: &CreatorId,
        request: PullRequest,
    ) -> Result<PullResponse, GossipError> {
        let endpoint = self.endpoint(remote)?;
        endpoint.server.handle_pull(&request)
    }

    async fn notify(&self, remote: &CreatorId, _notice: Notify) -> Result<(), GossipError> {
        let endpoint = self.endpoint(remote)?;
        endpoint.wake.notify_one();
        Ok(())
    }
}
