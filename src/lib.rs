//! ChainPrice Library
//!
//! Multi-chain token pricing: batched on-chain reads, layered price sources
//! and an adaptive TTL cache.

pub mod batching;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod fetchers;
pub mod orchestrator;
pub mod telemetry;
pub mod types;

pub use engine::PricingEngine;
pub use error::{CallError, PricingError, PricingResult};
pub use orchestrator::PriceResolver;
pub use types::{Chain, Price, PriceView, ResolvedMap, Token};
