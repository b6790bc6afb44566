//! Core types used throughout ChainPrice
//!
//! Defines supported chains, discovered tokens, fixed-point prices and the
//! wire shape handed to the HTTP layer.

use ethers::types::Address;
use ethers::utils::to_checksum;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{PricingError, PricingResult};

/// Number of decimal places carried by every `Price::value`.
pub const PRICE_DECIMALS: u32 = 6;

/// `10^PRICE_DECIMALS`, i.e. the fixed-point value of one US dollar.
pub const PRICE_SCALE: u64 = 1_000_000;

/// Supported chains
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Chain {
    Ethereum,
    Optimism,
    Bsc,
    Gnosis,
    Polygon,
    Fantom,
    Base,
    Arbitrum,
    Avalanche,
    Linea,
}

impl Chain {
    pub const ALL: [Chain; 10] = [
        Chain::Ethereum,
        Chain::Optimism,
        Chain::Bsc,
        Chain::Gnosis,
        Chain::Polygon,
        Chain::Fantom,
        Chain::Base,
        Chain::Arbitrum,
        Chain::Avalanche,
        Chain::Linea,
    ];

    /// EIP-155 chain id
    pub fn id(&self) -> u64 {
        match self {
            Chain::Ethereum => 1,
            Chain::Optimism => 10,
            Chain::Bsc => 56,
            Chain::Gnosis => 100,
            Chain::Polygon => 137,
            Chain::Fantom => 250,
            Chain::Base => 8453,
            Chain::Arbitrum => 42161,
            Chain::Avalanche => 43114,
            Chain::Linea => 59144,
        }
    }

    pub fn from_id(id: u64) -> Option<Self> {
        Self::ALL.iter().copied().find(|chain| chain.id() == id)
    }

    /// Like `from_id`, but an unknown id is a configuration error.
    pub fn require(id: u64) -> PricingResult<Self> {
        Self::from_id(id).ok_or(PricingError::UnsupportedChain(id))
    }

    /// Chain prefix used by the DefiLlama coins API (e.g. "ethereum:0x...")
    pub fn llama_slug(&self) -> &'static str {
        match self {
            Chain::Ethereum => "ethereum",
            Chain::Optimism => "optimism",
            Chain::Bsc => "bsc",
            Chain::Gnosis => "xdai",
            Chain::Polygon => "polygon",
            Chain::Fantom => "fantom",
            Chain::Base => "base",
            Chain::Arbitrum => "arbitrum",
            Chain::Avalanche => "avax",
            Chain::Linea => "linea",
        }
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.llama_slug(), self.id())
    }
}

/// Parse a hex address string. Case is irrelevant; the result is normalized.
pub fn parse_address(raw: &str) -> PricingResult<Address> {
    let trimmed = raw.trim();
    let hex_part = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .ok_or_else(|| PricingError::InvalidAddress(raw.to_string()))?;
    if hex_part.len() != 40 {
        return Err(PricingError::InvalidAddress(raw.to_string()));
    }
    Address::from_str(hex_part).map_err(|_| PricingError::InvalidAddress(raw.to_string()))
}

/// Lowercase `0x`-prefixed form used for keys and logs
pub fn normalized(address: &Address) -> String {
    format!("{:#x}", address)
}

/// Token as supplied by the discovery subsystem
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Token {
    pub address: Address,
    pub chain_id: u64,
    pub symbol: String,
    #[serde(default)]
    pub name: String,
    pub decimals: u8,
}

impl Token {
    pub fn new(chain_id: u64, address: Address, symbol: &str, decimals: u8) -> Self {
        Self {
            address,
            chain_id,
            symbol: symbol.to_string(),
            name: symbol.to_string(),
            decimals,
        }
    }
}

/// USD price of one whole token, as a fixed-point integer at `PRICE_DECIMALS`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Price {
    pub address: Address,
    /// Micro-dollars per whole token
    pub value: u64,
    /// Origin tag of the fetcher that produced this price
    pub source: String,
}

impl Price {
    pub fn new(address: Address, value: u64, source: impl Into<String>) -> Self {
        Self {
            address,
            value,
            source: source.into(),
        }
    }

    /// Build from a decimal USD amount. Non-positive or sub-micro-dollar
    /// amounts and values that overflow the fixed-point range yield `None`.
    pub fn from_usd(address: Address, usd: Decimal, source: impl Into<String>) -> Option<Self> {
        if usd <= Decimal::ZERO {
            return None;
        }
        let value = usd
            .checked_mul(Decimal::from(PRICE_SCALE))?
            .round()
            .to_u64()?;
        if value == 0 {
            return None;
        }
        Some(Self::new(address, value, source))
    }

    /// Build from a floating point USD amount as returned by JSON price APIs
    pub fn from_f64(address: Address, usd: f64, source: impl Into<String>) -> Option<Self> {
        if !usd.is_finite() {
            return None;
        }
        Self::from_usd(address, Decimal::from_f64(usd)?, source)
    }

    /// Price as a decimal USD amount (scale fixed at `PRICE_DECIMALS`)
    pub fn usd(&self) -> Decimal {
        Decimal::from_i128_with_scale(i128::from(self.value), PRICE_DECIMALS)
    }

    pub fn to_view(&self) -> PriceView {
        PriceView {
            address: to_checksum(&self.address, None),
            price: self.usd().to_string(),
            source: self.source.clone(),
        }
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ${} ({})", normalized(&self.address), self.usd(), self.source)
    }
}

/// Prices resolved for one chain, keyed by token address
pub type ResolvedMap = HashMap<Address, Price>;

/// Wire shape handed to the HTTP layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceView {
    /// EIP-55 checksum-cased address
    pub address: String,
    /// Decimal string at 6-decimal scale, e.g. "1.000000"
    pub price: String,
    pub source: String,
}
