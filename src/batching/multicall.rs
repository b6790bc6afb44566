//! Multicall3 transport
//!
//! Encodes a batch as `tryAggregate(false, calls)` against the Multicall3
//! deployment and issues it as a single `eth_call`.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use ethers::abi::{self, ParamType, Token};
use ethers::providers::{Http, Middleware, Provider};
use ethers::types::{Address, Bytes, TransactionRequest};
use std::sync::Arc;

use super::reader::{BatchReader, CallOutcome, EncodedCall};
use crate::types::parse_address;

/// Canonical Multicall3 deployment (same address on every supported chain)
pub const MULTICALL3_ADDRESS: &str = "0xcA11bde05977b3631167028862bE2a173976CA11";

const TRY_AGGREGATE_SIGNATURE: &str = "tryAggregate(bool,(address,bytes)[])";

/// `BatchReader` backed by an ethers provider
pub struct Multicall3Reader<M> {
    provider: Arc<M>,
    multicall: Address,
}

impl Multicall3Reader<Provider<Http>> {
    /// HTTP provider for `rpc_url`; no request is made until the first batch.
    pub fn connect(rpc_url: &str, multicall: Option<&str>) -> Result<Self> {
        let provider = Provider::<Http>::try_from(rpc_url)
            .with_context(|| format!("Invalid RPC URL {}", rpc_url))?;
        let multicall = parse_address(multicall.unwrap_or(MULTICALL3_ADDRESS))?;
        Ok(Self::new(Arc::new(provider), multicall))
    }
}

impl<M: Middleware> Multicall3Reader<M> {
    pub fn new(provider: Arc<M>, multicall: Address) -> Self {
        Self {
            provider,
            multicall,
        }
    }

    pub fn multicall_address(&self) -> Address {
        self.multicall
    }
}

/// Calldata for `tryAggregate(false, calls)`
pub fn encode_try_aggregate(calls: &[EncodedCall]) -> Vec<u8> {
    let calls = Token::Array(
        calls
            .iter()
            .map(|call| {
                Token::Tuple(vec![
                    Token::Address(call.target),
                    Token::Bytes(call.call_data.to_vec()),
                ])
            })
            .collect(),
    );
    let selector = &ethers::utils::id(TRY_AGGREGATE_SIGNATURE)[0..4];
    let mut data = selector.to_vec();
    data.extend_from_slice(&abi::encode(&[Token::Bool(false), calls]));
    data
}

/// Decode the `(bool success, bytes returnData)[]` result of `tryAggregate`
pub fn decode_try_aggregate(data: &[u8]) -> Result<Vec<CallOutcome>> {
    let decoded = abi::decode(
        &[ParamType::Array(Box::new(ParamType::Tuple(vec![
            ParamType::Bool,
            ParamType::Bytes,
        ])))],
        data,
    )
    .context("Failed to decode multicall result")?;

    let Some(Token::Array(items)) = decoded.into_iter().next() else {
        bail!("Multicall result is not an array");
    };

    items
        .into_iter()
        .map(|item| match item {
            Token::Tuple(mut fields) if fields.len() == 2 => {
                let data = fields.pop();
                let success = fields.pop();
                match (success, data) {
                    (Some(Token::Bool(success)), Some(Token::Bytes(bytes))) => Ok(CallOutcome {
                        success,
                        return_data: Bytes::from(bytes),
                    }),
                    _ => Err(anyhow!("Invalid tuple types in multicall result")),
                }
            }
            other => Err(anyhow!("Unexpected multicall item {:?}", other)),
        })
        .collect()
}

#[async_trait]
impl<M> BatchReader for Multicall3Reader<M>
where
    M: Middleware + 'static,
{
    async fn aggregate(&self, calls: &[EncodedCall]) -> Result<Vec<CallOutcome>> {
        if calls.is_empty() {
            return Ok(Vec::new());
        }

        let tx = TransactionRequest::new()
            .to(self.multicall)
            .data(Bytes::from(encode_try_aggregate(calls)));

        let raw = self
            .provider
            .call(&tx.into(), None)
            .await
            .map_err(|e| anyhow!("Multicall eth_call failed: {}", e))?;

        let outcomes = decode_try_aggregate(&raw)?;
        if outcomes.len() != calls.len() {
            bail!(
                "Multicall returned {} results for {} calls",
                outcomes.len(),
                calls.len()
            );
        }
        Ok(outcomes)
    }
}
