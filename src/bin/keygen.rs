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

//! Create (or load) a node key and print its creator id.

use anyhow::Result;
use confluence::core::security::signer::NodeSigner;

fn main() -> Result<()> {
    let out_dir = std::env::args().nth(1).unwrap_or_else(|| "data".to_string());
    std::fs::create_dir_all(&out_dir)?;

    let signer =
        NodeSigner::load_or_create(&out_dir).map_err(|e| anyhow::anyhow!("keygen: {e}"))?;
    println!("{}", signer.creator_id());
    println!("hex: {}", hex::encode(signer.public_key()));
    Ok(())
}
