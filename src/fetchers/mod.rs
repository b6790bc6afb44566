//! Price fetcher implementations (DefiLlama, Chainlink, ERC4626, Uniswap V2 LP)
//!
//! Independent fetchers are self-contained: a REST API or an on-chain read
//! that needs nothing else. Dependent fetchers derive a token's price from
//! prices already resolved in the same call (the oracle).

mod chainlink;
mod defillama;
mod erc4626;
mod uniswap_v2_lp;

pub use chainlink::{ChainlinkFeed, ChainlinkFetcher};
pub use defillama::DefiLlamaFetcher;
pub use erc4626::Erc4626Fetcher;
pub use uniswap_v2_lp::UniswapV2LpFetcher;

use anyhow::Result;
use async_trait::async_trait;
use ethers::abi::Token as AbiToken;
use ethers::types::{Address, U256};
use futures_util::future::join_all;
use std::collections::HashMap;
use std::fmt;

use crate::batching::abi::ReadFunctions;
use crate::batching::{CallBatcher, CallResult, ContractCall};
use crate::error::PricingResult;
use crate::types::{Chain, ResolvedMap, Token};

/// When a fetcher runs relative to the others
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FetcherKind {
    /// Runs first, never looks at other fetchers' output
    Independent,
    /// Runs second, reads the prices resolved so far
    Dependent,
}

impl fmt::Display for FetcherKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetcherKind::Independent => write!(f, "independent"),
            FetcherKind::Dependent => write!(f, "dependent"),
        }
    }
}

/// Trait for price sources
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PriceFetcher: Send + Sync {
    /// Source tag stamped on every price this fetcher produces
    fn name(&self) -> &'static str;

    fn kind(&self) -> FetcherKind;

    /// Chains this fetcher can price at all
    fn supports_chain(&self, _chain: Chain) -> bool {
        true
    }

    /// Price as many of `tokens` as possible. `oracle` holds the prices
    /// resolved so far; independent fetchers ignore it. Tokens that cannot be
    /// priced are simply left out; `Err` means the whole source is unusable.
    async fn fetch_prices(
        &self,
        chain: Chain,
        tokens: &[Token],
        oracle: &ResolvedMap,
    ) -> Result<ResolvedMap>;
}

/// `10^exp` when it fits in a U256
pub(crate) fn pow10(exp: u32) -> Option<U256> {
    (exp <= 77).then(|| U256::exp10(exp as usize))
}

/// Micro-dollar value of `amount` base units of a token with `decimals`
/// decimals, priced at `unit_price` micro-dollars per whole token
pub(crate) fn value_of(amount: U256, decimals: u8, unit_price: u64) -> Option<U256> {
    amount
        .checked_mul(U256::from(unit_price))?
        .checked_div(pow10(u32::from(decimals))?)
}

/// Narrow a computed micro-dollar amount to a `Price::value`
pub(crate) fn to_price_value(value: U256) -> Option<u64> {
    if value.is_zero() || value > U256::from(u64::MAX) {
        return None;
    }
    Some(value.as_u64())
}

pub(crate) fn first_address(result: &CallResult) -> Option<Address> {
    match result.as_ref().ok()?.first()? {
        AbiToken::Address(address) if !address.is_zero() => Some(*address),
        _ => None,
    }
}

pub(crate) fn uint_at(result: &CallResult, index: usize) -> Option<U256> {
    match result.as_ref().ok()?.get(index)? {
        AbiToken::Uint(value) => Some(*value),
        _ => None,
    }
}

/// ERC20 `decimals()` result, rejecting values no real token uses
pub(crate) fn decimals_of(result: &CallResult) -> Option<u8> {
    let raw = uint_at(result, 0)?;
    (raw <= U256::from(36u8)).then(|| raw.as_u32() as u8)
}

/// Batched `decimals()` for each address; tokens that fail to answer are absent
pub(crate) async fn read_decimals(
    batcher: &CallBatcher,
    fns: &ReadFunctions,
    chain: Chain,
    addresses: &[Address],
) -> PricingResult<HashMap<Address, u8>> {
    let handles = batcher.enqueue_many(
        chain.id(),
        addresses
            .iter()
            .map(|address| ContractCall::new(*address, &fns.decimals, vec![])),
    )?;
    let results = join_all(handles).await;
    Ok(addresses
        .iter()
        .zip(results.iter())
        .filter_map(|(address, result)| Some((*address, decimals_of(result)?)))
        .collect())
}
