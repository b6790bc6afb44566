//! ERC4626 vault share pricing
//!
//! share price = convertToAssets(10^shareDecimals) / 10^assetDecimals * assetPrice

use anyhow::Result;
use async_trait::async_trait;
use ethers::abi::Token as AbiToken;
use ethers::types::{Address, U256};
use futures_util::future::join_all;
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::batching::abi::ReadFunctions;
use crate::batching::{CallBatcher, ContractCall};
use crate::fetchers::{
    first_address, pow10, read_decimals, to_price_value, uint_at, value_of, FetcherKind,
    PriceFetcher,
};
use crate::types::{Chain, Price, ResolvedMap, Token};

const SOURCE: &str = "erc4626";

struct VaultReading<'a> {
    token: &'a Token,
    asset: Address,
    assets_per_share: U256,
}

pub struct Erc4626Fetcher {
    batcher: Arc<CallBatcher>,
    fns: ReadFunctions,
}

impl Erc4626Fetcher {
    pub fn new(batcher: Arc<CallBatcher>, fns: ReadFunctions) -> Self {
        Self { batcher, fns }
    }
}

#[async_trait]
impl PriceFetcher for Erc4626Fetcher {
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
        if oracle.is_empty() {
            return Ok(ResolvedMap::new());
        }

        let candidates: Vec<(&Token, U256)> = tokens
            .iter()
            .filter_map(|t| Some((t, pow10(u32::from(t.decimals))?)))
            .collect();
        let calls = candidates.iter().flat_map(|(token, one_share)| {
            [
                ContractCall::new(token.address, &self.fns.asset, vec![]),
                ContractCall::new(
                    token.address,
                    &self.fns.convert_to_assets,
                    vec![AbiToken::Uint(*one_share)],
                ),
            ]
        });
        let results = join_all(self.batcher.enqueue_many(chain.id(), calls)?).await;

        // Non-vaults revert on asset(); vaults over unpriced assets are skipped.
        let readings: Vec<VaultReading<'_>> = candidates
            .iter()
            .zip(results.chunks(2))
            .filter_map(|((token, _), pair)| {
                let asset = first_address(&pair[0])?;
                let assets_per_share = uint_at(&pair[1], 0)?;
                oracle.contains_key(&asset).then_some(VaultReading {
                    token: *token,
                    asset,
                    assets_per_share,
                })
            })
            .collect();
        if readings.is_empty() {
            return Ok(ResolvedMap::new());
        }

        let assets: Vec<Address> = readings
            .iter()
            .map(|p| p.asset)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let asset_decimals = read_decimals(&self.batcher, &self.fns, chain, &assets).await?;

        let mut prices = ResolvedMap::new();
        for reading in readings {
            let value = asset_decimals.get(&reading.asset).and_then(|decimals| {
                let asset_price = oracle.get(&reading.asset)?;
                to_price_value(value_of(reading.assets_per_share, *decimals, asset_price.value)?)
            });
            if let Some(value) = value {
                let address = reading.token.address;
                prices.insert(address, Price::new(address, value, SOURCE));
            }
        }

        tracing::debug!(chain = %chain, priced = prices.len(), "ERC4626 vaults priced");
        Ok(prices)
    }
}
