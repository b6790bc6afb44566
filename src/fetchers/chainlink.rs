//! Chainlink aggregator feeds
//!
//! Reads `latestRoundData()` and `decimals()` from the configured USD feeds
//! through the call batcher. Stale or non-positive answers are discarded.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use ethers::abi::Token as AbiToken;
use ethers::types::{Address, I256, U256};
use futures_util::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::batching::abi::ReadFunctions;
use crate::batching::{CallBatcher, CallResult, ContractCall};
use crate::config::ChainlinkConfig;
use crate::error::PricingResult;
use crate::fetchers::{decimals_of, to_price_value, uint_at, value_of, FetcherKind, PriceFetcher};
use crate::types::{parse_address, Chain, Price, ResolvedMap, Token, PRICE_SCALE};

const SOURCE: &str = "chainlink";

/// A token priced directly by a USD-denominated aggregator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainlinkFeed {
    pub chain: Chain,
    pub token: Address,
    pub feed: Address,
}

pub struct ChainlinkFetcher {
    batcher: Arc<CallBatcher>,
    fns: ReadFunctions,
    feeds: HashMap<(Chain, Address), Address>,
    max_feed_age: Duration,
}

impl ChainlinkFetcher {
    pub fn new(
        batcher: Arc<CallBatcher>,
        fns: ReadFunctions,
        feeds: impl IntoIterator<Item = ChainlinkFeed>,
        max_feed_age: Duration,
    ) -> Self {
        Self {
            batcher,
            fns,
            feeds: feeds
                .into_iter()
                .map(|f| ((f.chain, f.token), f.feed))
                .collect(),
            max_feed_age,
        }
    }

    pub fn from_config(
        batcher: Arc<CallBatcher>,
        fns: ReadFunctions,
        cfg: &ChainlinkConfig,
    ) -> PricingResult<Self> {
        let feeds = cfg
            .feeds
            .iter()
            .map(|f| {
                Ok(ChainlinkFeed {
                    chain: Chain::require(f.chain_id)?,
                    token: parse_address(&f.token)?,
                    feed: parse_address(&f.feed)?,
                })
            })
            .collect::<PricingResult<Vec<_>>>()?;

        Ok(Self::new(
            batcher,
            fns,
            feeds,
            Duration::from_secs(cfg.max_feed_age_secs),
        ))
    }

    pub fn feed_count(&self) -> usize {
        self.feeds.len()
    }

    /// Price from one `latestRoundData` answer, `None` if unusable
    fn answer_price(&self, round: &CallResult, feed_decimals: u8, now: i64) -> Option<u64> {
        let answer = match round.as_ref().ok()?.get(1)? {
            AbiToken::Int(raw) => I256::from_raw(*raw),
            _ => return None,
        };
        if !answer.is_positive() {
            return None;
        }

        let updated_at = uint_at(round, 3)?;
        if updated_at.is_zero() || updated_at > U256::from(i64::MAX as u64) {
            return None;
        }
        let age_secs = now.saturating_sub(updated_at.as_u64() as i64).max(0) as u64;
        if !self.max_feed_age.is_zero() && age_secs > self.max_feed_age.as_secs() {
            return None;
        }

        to_price_value(value_of(answer.into_raw(), feed_decimals, PRICE_SCALE)?)
    }
}

#[async_trait]
impl PriceFetcher for ChainlinkFetcher {
    fn name(&self) -> &'static str {
        SOURCE
    }

    fn kind(&self) -> FetcherKind {
        FetcherKind::Independent
    }

    fn supports_chain(&self, chain: Chain) -> bool {
        self.batcher.supports_chain(chain.id()) && self.feeds.keys().any(|(c, _)| *c == chain)
    }

    async fn fetch_prices(
        &self,
        chain: Chain,
        tokens: &[Token],
        _oracle: &ResolvedMap,
    ) -> Result<ResolvedMap> {
        let targets: Vec<(Address, Address)> = tokens
            .iter()
            .filter_map(|t| Some((t.address, *self.feeds.get(&(chain, t.address))?)))
            .collect();
        if targets.is_empty() {
            return Ok(ResolvedMap::new());
        }

        let calls = targets.iter().flat_map(|(_, feed)| {
            [
                ContractCall::new(*feed, &self.fns.latest_round_data, vec![]),
                ContractCall::new(*feed, &self.fns.decimals, vec![]),
            ]
        });
        let results = join_all(self.batcher.enqueue_many(chain.id(), calls)?).await;

        let now = Utc::now().timestamp();
        let mut prices = ResolvedMap::new();
        for ((token, feed), pair) in targets.iter().zip(results.chunks(2)) {
            let price = decimals_of(&pair[1]).and_then(|d| self.answer_price(&pair[0], d, now));
            match price {
                Some(value) => {
                    prices.insert(*token, Price::new(*token, value, SOURCE));
                }
                None => tracing::debug!(
                    chain = %chain,
                    feed = %format!("{:#x}", feed),
                    "Chainlink feed unusable (stale, non-positive or unreadable)"
                ),
            }
        }
        Ok(prices)
    }
}
