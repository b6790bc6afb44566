//! DefiLlama coins API client
//!
//! Independent REST source covering most listed tokens on every supported
//! chain: `GET /prices/current/{chain}:{address},...`.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

use crate::config::DefiLlamaConfig;
use crate::fetchers::{FetcherKind, PriceFetcher};
use crate::types::{normalized, parse_address, Chain, Price, ResolvedMap, Token};

const SOURCE: &str = "defillama";

#[derive(Debug, Deserialize)]
struct CoinsResponse {
    #[serde(default)]
    coins: HashMap<String, CoinPrice>,
}

#[derive(Debug, Deserialize)]
struct CoinPrice {
    price: f64,
    #[serde(default)]
    symbol: Option<String>,
    #[serde(default)]
    confidence: Option<f64>,
}

pub struct DefiLlamaFetcher {
    client: reqwest::Client,
    base_url: String,
    min_confidence: f64,
    chunk_size: usize,
}

impl DefiLlamaFetcher {
    pub fn new(cfg: &DefiLlamaConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(cfg.request_timeout_ms))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            min_confidence: cfg.min_confidence,
            chunk_size: cfg.chunk_size.max(1),
        })
    }

    fn coin_key(chain: Chain, token: &Token) -> String {
        format!("{}:{}", chain.llama_slug(), normalized(&token.address))
    }

    async fn fetch_chunk(&self, chain: Chain, chunk: &[Token]) -> Result<ResolvedMap> {
        let keys: Vec<String> = chunk.iter().map(|t| Self::coin_key(chain, t)).collect();
        let url = format!("{}/prices/current/{}", self.base_url, keys.join(","));

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context("Failed to fetch prices from DefiLlama")?;

        if !response.status().is_success() {
            bail!("DefiLlama API returned error: {}", response.status());
        }

        let body: CoinsResponse = response
            .json()
            .await
            .context("Failed to parse DefiLlama prices response")?;

        Ok(parse_coins(chain, body, self.min_confidence))
    }
}

fn parse_coins(chain: Chain, body: CoinsResponse, min_confidence: f64) -> ResolvedMap {
    let prefix = format!("{}:", chain.llama_slug());
    body.coins
        .into_iter()
        .filter_map(|(key, coin)| {
            let raw_address = key.strip_prefix(&prefix)?;
            let address = parse_address(raw_address).ok()?;
            if coin.confidence.unwrap_or(1.0) < min_confidence {
                tracing::debug!(
                    address = %raw_address,
                    symbol = ?coin.symbol,
                    confidence = ?coin.confidence,
                    "Skipping low-confidence DefiLlama price"
                );
                return None;
            }
            let price = Price::from_f64(address, coin.price, SOURCE)?;
            Some((address, price))
        })
        .collect()
}

#[async_trait]
impl PriceFetcher for DefiLlamaFetcher {
    fn name(&self) -> &'static str {
        SOURCE
    }

    fn kind(&self) -> FetcherKind {
        FetcherKind::Independent
    }

    async fn fetch_prices(
        &self,
        chain: Chain,
        tokens: &[Token],
        _oracle: &ResolvedMap,
    ) -> Result<ResolvedMap> {
        let mut prices = ResolvedMap::new();
        let mut failed_chunks = 0usize;
        let mut last_error = None;
        let chunks: Vec<&[Token]> = tokens.chunks(self.chunk_size).collect();

        for chunk in &chunks {
            match self.fetch_chunk(chain, chunk).await {
                Ok(chunk_prices) => prices.extend(chunk_prices),
                Err(e) => {
                    tracing::warn!(
                        chain = %chain,
                        chunk_size = chunk.len(),
                        error = %e,
                        "DefiLlama chunk failed"
                    );
                    failed_chunks += 1;
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) if failed_chunks == chunks.len() => Err(e),
            _ => Ok(prices),
        }
    }
}
