// Copyright (c) 2026 Confluence
// Licensed under the Apache-2.0 License.

#![no_main]
#![forbid(unsafe_code)]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = confluence::core::types::decode_canonical_limited::<
        confluence::networking::gossip::PullRequest,
    >(data, confluence::networking::gossip::MAX_REQUEST_BYTES);
});
