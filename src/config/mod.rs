//! Configuration management for ChainPrice
//!
//! Loads defaults, optional TOML/YAML files and `CHAINPRICE__*` environment
//! variables (after `.env`) into one typed `AppConfig`.

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;
use std::collections::HashSet;

use crate::error::{PricingError, PricingResult};
use crate::types::{parse_address, Chain};

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub batching: BatchingConfig,
    pub cache: CacheConfig,
    pub resolver: ResolverConfig,
    pub defillama: DefiLlamaConfig,
    pub chainlink: ChainlinkConfig,
    pub logging: LoggingConfig,
    /// RPC endpoints, one per chain that should get on-chain reads
    #[serde(default)]
    pub chains: Vec<ChainRpcConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchingConfig {
    /// Maximum calls per multicall submission
    pub max_batch_size: usize,
    /// Debounce window before a partial batch is flushed
    pub debounce_ms: u64,
    /// Concurrent multicall submissions per chain
    pub max_concurrent_batches: usize,
    /// Total submission attempts for a batch whose transport fails
    pub max_attempts: u32,
    /// Backoff before the first retry, doubled after each failure
    pub retry_base_delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    pub ttl_stablecoin_secs: u64,
    pub ttl_major_secs: u64,
    pub ttl_derived_secs: u64,
    pub ttl_other_secs: u64,
    /// Active sweep interval
    pub cleanup_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResolverConfig {
    /// Outer timeout applied to every fetcher invocation
    pub fetcher_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DefiLlamaConfig {
    pub enabled: bool,
    pub base_url: String,
    /// Entries below this confidence are ignored
    pub min_confidence: f64,
    /// Addresses per request
    pub chunk_size: usize,
    pub request_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainlinkConfig {
    pub enabled: bool,
    /// Rounds older than this are treated as missing data
    pub max_feed_age_secs: u64,
    #[serde(default)]
    pub feeds: Vec<ChainlinkFeedConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainlinkFeedConfig {
    pub chain_id: u64,
    pub token: String,
    pub feed: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    pub filter: String,
    /// Emit JSON lines instead of human readable output
    pub json: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainRpcConfig {
    pub chain_id: u64,
    pub rpc_url: String,
    /// Overrides the canonical Multicall3 deployment
    #[serde(default)]
    pub multicall_address: Option<String>,
}

impl AppConfig {
    /// Load configuration from file and environment
    pub fn load() -> Result<Self> {
        // Load .env file first
        dotenvy::dotenv().ok();

        let config = Self::with_defaults(Config::builder())?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            // Override with environment variables (CHAINPRICE__*)
            .add_source(Environment::with_prefix("CHAINPRICE").separator("__"))
            .build()
            .context("Failed to build configuration")?;

        let app_config: AppConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;
        app_config.validate()?;

        Ok(app_config)
    }

    /// Built-in defaults only, no files or environment
    pub fn defaults() -> Result<Self> {
        let config = Self::with_defaults(Config::builder())?
            .build()
            .context("Failed to build default configuration")?;
        config
            .try_deserialize()
            .context("Failed to deserialize default configuration")
    }

    fn with_defaults(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<config::ConfigBuilder<config::builder::DefaultState>> {
        Ok(builder
            // Batching defaults
            .set_default("batching.max_batch_size", 500)?
            .set_default("batching.debounce_ms", 10)?
            .set_default("batching.max_concurrent_batches", 10)?
            .set_default("batching.max_attempts", 3)?
            .set_default("batching.retry_base_delay_ms", 100)?
            // Cache defaults
            .set_default("cache.ttl_stablecoin_secs", 300)?
            .set_default("cache.ttl_major_secs", 60)?
            .set_default("cache.ttl_derived_secs", 30)?
            .set_default("cache.ttl_other_secs", 120)?
            .set_default("cache.cleanup_interval_secs", 60)?
            // Resolver defaults
            .set_default("resolver.fetcher_timeout_ms", 15_000)?
            // DefiLlama defaults
            .set_default("defillama.enabled", true)?
            .set_default("defillama.base_url", "https://coins.llama.fi")?
            .set_default("defillama.min_confidence", 0.8)?
            .set_default("defillama.chunk_size", 100)?
            .set_default("defillama.request_timeout_ms", 10_000)?
            // Chainlink defaults
            .set_default("chainlink.enabled", true)?
            .set_default("chainlink.max_feed_age_secs", 86_400)?
            // Logging defaults
            .set_default("logging.filter", "info")?
            .set_default("logging.json", false)?)
    }

    /// Reject values that would break an invariant at runtime
    pub fn validate(&self) -> PricingResult<()> {
        let b = &self.batching;
        if b.max_batch_size == 0 {
            return Err(PricingError::Config("batching.max_batch_size must be > 0".into()));
        }
        if b.max_concurrent_batches == 0 {
            return Err(PricingError::Config(
                "batching.max_concurrent_batches must be > 0".into(),
            ));
        }
        if b.max_attempts == 0 {
            return Err(PricingError::Config("batching.max_attempts must be > 0".into()));
        }

        let c = &self.cache;
        for (name, secs) in [
            ("ttl_stablecoin_secs", c.ttl_stablecoin_secs),
            ("ttl_major_secs", c.ttl_major_secs),
            ("ttl_derived_secs", c.ttl_derived_secs),
            ("ttl_other_secs", c.ttl_other_secs),
            ("cleanup_interval_secs", c.cleanup_interval_secs),
        ] {
            if secs == 0 {
                return Err(PricingError::Config(format!("cache.{} must be > 0", name)));
            }
        }

        if self.defillama.enabled && self.defillama.chunk_size == 0 {
            return Err(PricingError::Config("defillama.chunk_size must be > 0".into()));
        }

        let mut seen = HashSet::new();
        for chain in &self.chains {
            Chain::require(chain.chain_id)?;
            if !seen.insert(chain.chain_id) {
                return Err(PricingError::Config(format!(
                    "chain {} configured twice",
                    chain.chain_id
                )));
            }
            if let Some(multicall) = &chain.multicall_address {
                parse_address(multicall)?;
            }
        }

        for feed in &self.chainlink.feeds {
            Chain::require(feed.chain_id)?;
            parse_address(&feed.token)?;
            parse_address(&feed.feed)?;
        }

        Ok(())
    }

    /// Generate a digest of the config (without RPC URLs) for logging
    pub fn digest(&self) -> String {
        let chains: Vec<u64> = self.chains.iter().map(|c| c.chain_id).collect();
        format!(
            "chains={:?} batch={}x{} debounce={}ms ttl(s/m/d/o)={}/{}/{}/{}s defillama={} chainlink_feeds={}",
            chains,
            self.batching.max_batch_size,
            self.batching.max_concurrent_batches,
            self.batching.debounce_ms,
            self.cache.ttl_stablecoin_secs,
            self.cache.ttl_major_secs,
            self.cache.ttl_derived_secs,
            self.cache.ttl_other_secs,
            self.defillama.enabled,
            self.chainlink.feeds.len(),
        )
    }
}

impl std::fmt::Display for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.digest())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_policy() {
        let cfg = AppConfig::defaults().expect("defaults should deserialize");
        assert_eq!(cfg.batching.max_batch_size, 500);
        assert_eq!(cfg.batching.debounce_ms, 10);
        assert_eq!(cfg.batching.max_concurrent_batches, 10);
        assert_eq!(cfg.batching.max_attempts, 3);
        assert_eq!(cfg.batching.retry_base_delay_ms, 100);
        assert_eq!(cfg.cache.ttl_stablecoin_secs, 300);
        assert_eq!(cfg.cache.ttl_major_secs, 60);
        assert_eq!(cfg.cache.ttl_derived_secs, 30);
        assert_eq!(cfg.cache.ttl_other_secs, 120);
        assert!(cfg.chains.is_empty());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_batch_size() {
        let mut cfg = AppConfig::defaults().unwrap();
        cfg.batching.max_batch_size = 0;
        assert!(matches!(cfg.validate(), Err(PricingError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_unknown_chain() {
        let mut cfg = AppConfig::defaults().unwrap();
        cfg.chains.push(ChainRpcConfig {
            chain_id: 31337,
            rpc_url: "http://localhost:8545".into(),
            multicall_address: None,
        });
        assert!(matches!(
            cfg.validate(),
            Err(PricingError::UnsupportedChain(31337))
        ));
    }

    #[test]
    fn test_validate_rejects_duplicate_chain() {
        let mut cfg = AppConfig::defaults().unwrap();
        for _ in 0..2 {
            cfg.chains.push(ChainRpcConfig {
                chain_id: 1,
                rpc_url: "http://localhost:8545".into(),
                multicall_address: None,
            });
        }
        assert!(matches!(cfg.validate(), Err(PricingError::Config(_))));
    }

    #[test]
    fn test_digest_mentions_batching() {
        let cfg = AppConfig::defaults().unwrap();
        let digest = cfg.to_string();
        assert!(digest.contains("batch=500x10"));
        assert!(!digest.contains("http"));
    }
}
