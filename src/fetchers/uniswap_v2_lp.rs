//! Uniswap V2 style LP token pricing
//!
//! LP price = pool TVL * 10^lpDecimals / totalSupply. When only one leg has a
//! known price the pool is assumed balanced and that leg is counted twice.

use anyhow::Result;
use async_trait::async_trait;
use ethers::types::{Address, U256};
use futures_util::future::join_all;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crate::batching::abi::ReadFunctions;
use crate::batching::{CallBatcher, ContractCall};
use crate::fetchers::{
    first_address, pow10, read_decimals, to_price_value, uint_at, value_of, FetcherKind,
    PriceFetcher,
};
use crate::types::{Chain, Price, ResolvedMap, Token};

const SOURCE: &str = "uniswap-v2-lp";

struct PairReading<'a> {
    token: &'a Token,
    legs: [(Address, U256); 2],
    total_supply: U256,
}

impl PairReading<'_> {
    fn tvl(&self, oracle: &ResolvedMap, decimals: &HashMap<Address, u8>) -> Option<U256> {
        let leg_value = |(address, reserve): &(Address, U256)| {
            value_of(*reserve, *decimals.get(address)?, oracle.get(address)?.value)
        };
        match (leg_value(&self.legs[0]), leg_value(&self.legs[1])) {
            (Some(a), Some(b)) => a.checked_add(b),
            (Some(single), None) | (None, Some(single)) => single.checked_mul(U256::from(2u8)),
            (None, None) => None,
        }
    }
}

pub struct UniswapV2LpFetcher {
    batcher: Arc<CallBatcher>,
    fns: ReadFunctions,
}

impl UniswapV2LpFetcher {
    pub fn new(batcher: Arc<CallBatcher>, fns: ReadFunctions) -> Self {
        Self { batcher, fns }
    }

    fn pair_calls(&self, token: &Token) -> [ContractCall; 4] {
        [
            ContractCall::new(token.address, &self.fns.token0, vec![]),
            ContractCall::new(token.address, &self.fns.token1, vec![]),
            ContractCall::new(token.address, &self.fns.get_reserves, vec![]),
            ContractCall::new(token.address, &self.fns.total_supply, vec![]),
        ]
    }
}

#[async_trait]
impl PriceFetcher for UniswapV2LpFetcher {
    fn name(&self) -> &'static str {
        SOURCE
    }

    fn kind(&self) -> FetcherKind {
        FetcherKind::Dependent
    }

    fn supports_chain(&self, chain: Chain) -> bool {
        self.batcher.supports_chain(chain.id())
    }

    async fn fetch_prices(
        &self,
        chain: Chain,
        tokens: &[Token],
        oracle: &ResolvedMap,
    ) -> Result<ResolvedMap> {
        if oracle.is_empty() || tokens.is_empty() {
            return Ok(ResolvedMap::new());
        }

        let calls = tokens.iter().flat_map(|t| self.pair_calls(t));
        let results = join_all(self.batcher.enqueue_many(chain.id(), calls)?).await;

        let readings: Vec<PairReading<'_>> = tokens
            .iter()
            .zip(results.chunks(4))
            .filter_map(|(token, r)| {
                let total_supply = uint_at(&r[3], 0).filter(|s| !s.is_zero())?;
                let legs = [
                    (first_address(&r[0])?, uint_at(&r[2], 0)?),
                    (first_address(&r[1])?, uint_at(&r[2], 1)?),
                ];
                legs.iter()
                    .any(|(leg, _)| oracle.contains_key(leg))
                    .then_some(PairReading {
                        token,
                        legs,
                        total_supply,
                    })
            })
            .collect();
        if readings.is_empty() {
            return Ok(ResolvedMap::new());
        }

        let priced_legs: Vec<Address> = readings
            .iter()
            .flat_map(|p| p.legs.iter().map(|(leg, _)| *leg))
            .filter(|leg| oracle.contains_key(leg))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let leg_decimals = read_decimals(&self.batcher, &self.fns, chain, &priced_legs).await?;

        let mut prices = ResolvedMap::new();
        for reading in &readings {
            let value = reading.tvl(oracle, &leg_decimals).and_then(|tvl| {
                let scaled = tvl.checked_mul(pow10(u32::from(reading.token.decimals))?)?;
                to_price_value(scaled / reading.total_supply)
            });
            if let Some(value) = value {
                let address = reading.token.address;
                prices.insert(address, Price::new(address, value, SOURCE));
            }
        }

        tracing::debug!(chain = %chain, priced = prices.len(), "LP tokens priced");
        Ok(prices)
    }
}
