//! Read-only network overview

use crate::chain::{ChainManager, PlatformClient, Subnet, Validator};
use crate::error::TransferResult;
use crate::types::{amount_serde, Amount, ChainId};

use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Aliases every network resolves
pub const PRIMARY_ALIASES: [&str; 3] = ["X", "P", "C"];

#[derive(Debug, Clone, Serialize)]
pub struct NetworkOverview {
    pub network_id: u32,
    pub chain_ids: BTreeMap<String, ChainId>,
    pub subnet_count: usize,
    pub subnet_example: Option<Subnet>,
    pub validator_count: usize,
    pub validator_example: Option<Validator>,
    /// Balance of the example validator's first reward owner
    #[serde(with = "crate::types::option_amount_serde")]
    pub reward_owner_balance: Option<Amount>,
    pub height: u64,
    #[serde(with = "amount_serde")]
    pub min_validator_stake: Amount,
    #[serde(with = "amount_serde")]
    pub current_supply: Amount,
    /// Default transaction fee per registered chain
    #[serde(serialize_with = "serialize_fees")]
    pub tx_fees: BTreeMap<String, Amount>,
}

fn serialize_fees<S>(fees: &BTreeMap<String, Amount>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    use serde::ser::SerializeMap;
    let mut map = serializer.serialize_map(Some(fees.len()))?;
    for (alias, fee) in fees {
        map.serialize_entry(alias, &fee.to_string())?;
    }
    map.end()
}

/// Collect chain IDs, platform statistics and per-chain fees
pub async fn network_overview(
    chains: &ChainManager,
    platform: &dyn PlatformClient,
) -> TransferResult<NetworkOverview> {
    let network_id = chains.network_id().await?;

    let mut chain_ids = BTreeMap::new();
    for alias in PRIMARY_ALIASES {
        chain_ids.insert(alias.to_string(), chains.blockchain_id(alias).await?);
    }

    let subnets = platform.subnets().await?;
    debug!("Found {} subnets", subnets.len());
    let validators = platform.current_validators().await?;
    debug!("Found {} validators", validators.len());

    let reward_owner_balance = match validators.first().and_then(Validator::reward_address) {
        Some(address) => Some(platform.balance(address).await?),
        None => None,
    };

    let mut tx_fees = BTreeMap::new();
    for alias in chains.aliases() {
        let client = chains.client(&alias)?;
        match client.tx_fee().await {
            Ok(fee) => {
                tx_fees.insert(alias, fee);
            }
            Err(e) => warn!("Could not fetch fee for chain {}: {}", alias, e),
        }
    }

    Ok(NetworkOverview {
        network_id,
        chain_ids,
        subnet_count: subnets.len(),
        subnet_example: subnets.into_iter().next(),
        validator_count: validators.len(),
        validator_example: validators.into_iter().next(),
        reward_owner_balance,
        height: platform.height().await?,
        min_validator_stake: platform.min_validator_stake().await?,
        current_supply: platform.current_supply().await?,
        tx_fees,
    })
}
