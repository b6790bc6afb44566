//! Batched-read capability consumed by the batcher
//!
//! One `aggregate` call is one underlying RPC round trip. Result order matches
//! input order and one item's failure never aborts the others.

use anyhow::Result;
use async_trait::async_trait;
use ethers::abi::{Function, Token};
use ethers::types::{Address, Bytes};
use std::sync::Arc;

use crate::error::{PricingError, PricingResult};

/// A single read against a contract, before encoding
#[derive(Debug, Clone)]
pub struct ContractCall {
    pub target: Address,
    /// Call descriptor, also used to decode the return data
    pub function: Arc<Function>,
    pub args: Vec<Token>,
}

impl ContractCall {
    pub fn new(target: Address, function: &Arc<Function>, args: Vec<Token>) -> Self {
        Self {
            target,
            function: Arc::clone(function),
            args,
        }
    }

    pub(crate) fn encode(&self) -> PricingResult<EncodedCall> {
        let data = self
            .function
            .encode_input(&self.args)
            .map_err(|e| PricingError::Encoding {
                target: self.target,
                function: self.function.name.clone(),
                message: e.to_string(),
            })?;
        Ok(EncodedCall {
            target: self.target,
            call_data: Bytes::from(data),
        })
    }
}

/// Target plus ABI-encoded calldata, as submitted in a batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedCall {
    pub target: Address,
    pub call_data: Bytes,
}

/// Per-item result of a batched read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallOutcome {
    pub success: bool,
    pub return_data: Bytes,
}

impl CallOutcome {
    pub fn ok(return_data: impl Into<Bytes>) -> Self {
        Self {
            success: true,
            return_data: return_data.into(),
        }
    }

    pub fn failed(return_data: impl Into<Bytes>) -> Self {
        Self {
            success: false,
            return_data: return_data.into(),
        }
    }
}

/// Per-chain transport that executes many reads in one round trip.
///
/// An `Err` means the round trip itself failed (transport level); the batcher
/// retries the whole batch in that case.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BatchReader: Send + Sync {
    async fn aggregate(&self, calls: &[EncodedCall]) -> Result<Vec<CallOutcome>>;
}
