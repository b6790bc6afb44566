//! Read-only function descriptors used by the on-chain fetchers

use anyhow::{Context, Result};
use ethers::abi::{parse_abi, Abi, Function};
use std::sync::Arc;

const READ_ABI: &[&str] = &[
    // ERC20
    "function decimals() external view returns (uint8)",
    "function totalSupply() external view returns (uint256)",
    // ERC4626
    "function asset() external view returns (address)",
    "function convertToAssets(uint256 shares) external view returns (uint256)",
    // Uniswap V2 pair
    "function token0() external view returns (address)",
    "function token1() external view returns (address)",
    "function getReserves() external view returns (uint112 reserve0, uint112 reserve1, uint32 blockTimestampLast)",
    // Chainlink aggregator
    "function latestRoundData() external view returns (uint80 roundId, int256 answer, uint256 startedAt, uint256 updatedAt, uint80 answeredInRound)",
];

/// Parsed descriptors, built once and shared by the fetchers
#[derive(Debug, Clone)]
pub struct ReadFunctions {
    pub decimals: Arc<Function>,
    pub total_supply: Arc<Function>,
    pub asset: Arc<Function>,
    pub convert_to_assets: Arc<Function>,
    pub token0: Arc<Function>,
    pub token1: Arc<Function>,
    pub get_reserves: Arc<Function>,
    pub latest_round_data: Arc<Function>,
}

impl ReadFunctions {
    pub fn load() -> Result<Self> {
        let abi = parse_abi(READ_ABI).context("Failed to parse read ABI")?;
        Ok(Self {
            decimals: function(&abi, "decimals")?,
            total_supply: function(&abi, "totalSupply")?,
            asset: function(&abi, "asset")?,
            convert_to_assets: function(&abi, "convertToAssets")?,
            token0: function(&abi, "token0")?,
            token1: function(&abi, "token1")?,
            get_reserves: function(&abi, "getReserves")?,
            latest_round_data: function(&abi, "latestRoundData")?,
        })
    }
}

fn function(abi: &Abi, name: &str) -> Result<Arc<Function>> {
    abi.function(name)
        .map(|f| Arc::new(f.clone()))
        .with_context(|| format!("ABI is missing {}", name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::abi::Token;
    use ethers::types::U256;

    #[test]
    fn test_descriptors_encode_expected_selectors() {
        let fns = ReadFunctions::load().unwrap();
        assert_eq!(fns.decimals.short_signature(), [0x31, 0x3c, 0xe5, 0x67]);
        assert_eq!(fns.total_supply.short_signature(), [0x18, 0x16, 0x0d, 0xdd]);
        assert_eq!(fns.get_reserves.short_signature(), [0x09, 0x02, 0xf1, 0xac]);
        assert_eq!(fns.latest_round_data.short_signature(), [0xfe, 0xaf, 0x96, 0x8c]);

        let data = fns
            .convert_to_assets
            .encode_input(&[Token::Uint(U256::exp10(18))])
            .unwrap();
        assert_eq!(data.len(), 4 + 32);
    }
}
