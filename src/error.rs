//! Error types shared by the batching layer, the cache and the resolver
//!
//! Only configuration/caller mistakes surface as `PricingError`. Per-item call
//! failures are reported through `CallError` on the completion handle; fetcher
//! failures stay `anyhow::Error` and are absorbed by the resolver.

use ethers::types::Address;
use thiserror::Error;

/// Caller or deployment mistakes. These fail loudly and immediately.
#[derive(Debug, Error)]
pub enum PricingError {
    #[error("unsupported chain id {0}")]
    UnsupportedChain(u64),

    #[error("no batched reader registered for chain {0}")]
    NoReader(u64),

    #[error("invalid token address {0:?}")]
    InvalidAddress(String),

    #[error("failed to encode {function} call to {target:#x}: {message}")]
    Encoding {
        target: Address,
        function: String,
        message: String,
    },

    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Outcome of a single queued contract read that did not produce a value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    /// The call itself reverted inside the batch. Siblings are unaffected.
    #[error("call to {target:#x} reverted (0x{data})")]
    Reverted { target: Address, data: String },

    /// The call succeeded but its return data did not match the descriptor.
    #[error("failed to decode return data from {target:#x}: {message}")]
    Decode { target: Address, message: String },

    /// The whole batch failed at the transport level on every attempt.
    #[error("batch transport failed after {attempts} attempts: {message}")]
    Transport { attempts: u32, message: String },

    /// The batcher went away before the request was processed.
    #[error("request dropped before completion")]
    Dropped,
}

impl CallError {
    /// True when the failure came from the batch as a whole rather than this item.
    pub fn is_transport(&self) -> bool {
        matches!(self, CallError::Transport { .. } | CallError::Dropped)
    }
}

pub type PricingResult<T> = std::result::Result<T, PricingError>;
