// Copyright (c) 2026 Confluence
// Licensed under the Apache-2.0 License.

#![no_main]
#![forbid(unsafe_code)]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Wire envelopes come from untrusted peers; decoding must never panic
    // and hashing a decoded body must stay total.
    if let Ok(envelope) = confluence::core::types::decode_canonical_limited::<
        confluence::core::event::EventEnvelope,
    >(data, confluence::core::event::MAX_EVENT_BYTES)
    {
        let _ = envelope.into_event();
    }
});
