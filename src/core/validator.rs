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

//! Pluggable operation validation.
//!
//! The engine totally orders opaque operations; whether an operation's
//! content is acceptable belongs to the embedding application. The
//! validator runs before a regular event is accepted from the local API
//! and before gossiped operations are integrated.

use thiserror::Error;

/// An operation failed validation.
#[derive(Debug, Error)]
#[error("invalid operation: {0}")]
pub struct OperationInvalid(pub String);

/// Validates opaque operation payloads.
pub trait OperationValidator: Send + Sync {
    /// Accept or reject one operation.
    fn validate(&self, operation: &[u8]) -> Result<(), OperationInvalid>;
}

/// Accepts everything; the default for ledgers whose operations are fully
/// opaque.
#[derive(Clone, Copy, Debug, Default)]
pub struct AcceptAllValidator;

impl OperationValidator for AcceptAllValidator {
    fn validate(&self, _operation: &[u8]) -> Result<(), OperationInvalid> {
        Ok(())
    }
}
