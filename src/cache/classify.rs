//! Token volatility classification used to pick a cache TTL
//!
//! Pure symbol/address/source heuristics. A wrong answer only changes how long
//! a price stays fresh, never the price itself.

use ethers::types::Address;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::normalized;

/// Coarse volatility bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TokenClass {
    Stablecoin,
    Major,
    /// LP shares and vault shares: two legs or a drifting share price
    Derived,
    Other,
}

impl fmt::Display for TokenClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenClass::Stablecoin => write!(f, "stablecoin"),
            TokenClass::Major => write!(f, "major"),
            TokenClass::Derived => write!(f, "derived"),
            TokenClass::Other => write!(f, "other"),
        }
    }
}

/// What the classifier gets to look at
#[derive(Debug, Clone, Copy)]
pub struct ClassifyInput<'a> {
    pub address: &'a Address,
    pub symbol: Option<&'a str>,
    /// Source tag of the price being stored
    pub source: &'a str,
}

/// Swappable classification policy
pub type Classifier = fn(&ClassifyInput<'_>) -> TokenClass;

const STABLE_SYMBOLS: &[&str] = &[
    "USDC", "USDT", "DAI", "BUSD", "TUSD", "USDP", "GUSD", "FRAX", "LUSD", "SUSD", "USDE",
    "PYUSD", "CRVUSD", "GHO", "USDBC", "USDC.E", "USDT.E", "DAI.E", "MIM", "DOLA", "USDD",
    "FDUSD", "EURC", "EURS", "USD+", "XDAI", "WXDAI",
];

const MAJOR_SYMBOLS: &[&str] = &[
    "ETH", "WETH", "BTC", "WBTC", "CBBTC", "TBTC", "BTCB", "BNB", "WBNB", "MATIC", "WMATIC",
    "POL", "AVAX", "WAVAX", "FTM", "WFTM", "ARB", "OP", "STETH", "WSTETH", "RETH", "CBETH",
    "WEETH", "SOL", "LINK",
];

/// Substrings (uppercased) that mark LP or vault share tokens
const DERIVED_MARKERS: &[&str] = &[
    "-LP", "LP-", "_LP", " LP", "UNI-V2", "SLP", "CAKE-LP", "BPT", "VLP", "VAULT", "CRV-",
];

/// Symbol prefixes used by common vault wrappers (Yearn, Beefy, Morpho, Euler...)
const DERIVED_PREFIXES: &[&str] = &["yv", "moo", "mv", "bb-", "st-", "ev"];

/// Source tags whose prices are always share-derived
const DERIVED_SOURCES: &[&str] = &["erc4626", "uniswap-v2-lp", "vault", "lp"];

// Ethereum mainnet addresses recognizable without a symbol
const MAINNET_STABLES: &[&str] = &[
    "0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48", // USDC
    "0xdac17f958d2ee523a2206206994597c13d831ec7", // USDT
    "0x6b175474e89094c44da98b954eedeac495271d0f", // DAI
];

const MAINNET_MAJORS: &[&str] = &[
    "0xc02aaa39b223fe8d0a0e5c4f27ead9083c756cc2", // WETH
    "0x2260fac5e5542a773aa44fbcfedf7c193bc2c599", // WBTC
];

/// Default policy: derived markers first, then stablecoins, then majors.
pub fn classify_token(input: &ClassifyInput<'_>) -> TokenClass {
    let source = input.source.to_ascii_lowercase();
    if DERIVED_SOURCES.iter().any(|tag| source == *tag) {
        return TokenClass::Derived;
    }

    if let Some(symbol) = input.symbol.map(str::trim).filter(|s| !s.is_empty()) {
        let upper = symbol.to_ascii_uppercase();

        if DERIVED_MARKERS.iter().any(|m| upper.contains(m))
            || DERIVED_PREFIXES
                .iter()
                .any(|p| symbol.starts_with(p) && symbol.len() > p.len())
        {
            return TokenClass::Derived;
        }
        if STABLE_SYMBOLS.contains(&upper.as_str()) {
            return TokenClass::Stablecoin;
        }
        if MAJOR_SYMBOLS.contains(&upper.as_str()) {
            return TokenClass::Major;
        }
    }

    let address = normalized(input.address);
    if MAINNET_STABLES.contains(&address.as_str()) {
        return TokenClass::Stablecoin;
    }
    if MAINNET_MAJORS.contains(&address.as_str()) {
        return TokenClass::Major;
    }

    TokenClass::Other
}
