//! Read-only platform chain queries

use super::rpc::{u32_string, RpcEndpoint};
use crate::error::{TransferError, TransferResult};
use crate::types::{amount_serde, Amount};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subnet {
    pub id: String,
    #[serde(default)]
    pub control_keys: Vec<String>,
    #[serde(default, with = "u32_string")]
    pub threshold: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardOwner {
    pub addresses: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Validator {
    #[serde(rename = "nodeID")]
    pub node_id: String,
    #[serde(default)]
    pub start_time: String,
    #[serde(default)]
    pub end_time: String,
    #[serde(default, with = "crate::types::option_amount_serde")]
    pub stake_amount: Option<Amount>,
    pub reward_owner: Option<RewardOwner>,
}

impl Validator {
    /// First reward-owner address, if any
    pub fn reward_address(&self) -> Option<&str> {
        self.reward_owner
            .as_ref()
            .and_then(|owner| owner.addresses.first())
            .map(String::as_str)
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PlatformClient: Send + Sync {
    async fn subnets(&self) -> TransferResult<Vec<Subnet>>;

    async fn current_validators(&self) -> TransferResult<Vec<Validator>>;

    /// Unlocked balance of a platform address
    async fn balance(&self, address: &str) -> TransferResult<Amount>;

    async fn height(&self) -> TransferResult<u64>;

    async fn min_validator_stake(&self) -> TransferResult<Amount>;

    async fn current_supply(&self) -> TransferResult<Amount>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SubnetsReply {
    subnets: Vec<Subnet>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ValidatorsReply {
    validators: Vec<Validator>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BalanceReply {
    #[serde(with = "amount_serde")]
    balance: Amount,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct HeightReply {
    height: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MinStakeReply {
    #[serde(with = "amount_serde")]
    min_validator_stake: Amount,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SupplyReply {
    #[serde(with = "amount_serde")]
    supply: Amount,
}

/// `platform.*` JSON-RPC client
pub struct RpcPlatformClient {
    endpoint: RpcEndpoint,
}

impl RpcPlatformClient {
    pub fn new(urls: &[String]) -> TransferResult<Self> {
        Ok(Self {
            endpoint: RpcEndpoint::new("P", urls)?,
        })
    }
}

#[async_trait]
impl PlatformClient for RpcPlatformClient {
    async fn subnets(&self) -> TransferResult<Vec<Subnet>> {
        let reply: SubnetsReply = self.endpoint.call("platform.getSubnets", json!({})).await?;
        Ok(reply.subnets)
    }

    async fn current_validators(&self) -> TransferResult<Vec<Validator>> {
        let reply: ValidatorsReply = self
            .endpoint
            .call("platform.getCurrentValidators", json!({}))
            .await?;
        Ok(reply.validators)
    }

    async fn balance(&self, address: &str) -> TransferResult<Amount> {
        let reply: BalanceReply = self
            .endpoint
            .call("platform.getBalance", json!({ "address": address }))
            .await?;
        Ok(reply.balance)
    }

    async fn height(&self) -> TransferResult<u64> {
        let reply: HeightReply = self.endpoint.call("platform.getHeight", json!({})).await?;
        reply
            .height
            .parse()
            .map_err(|e| TransferError::MalformedReply {
                chain: "P".to_string(),
                message: format!("invalid height {:?}: {}", reply.height, e),
            })
    }

    async fn min_validator_stake(&self) -> TransferResult<Amount> {
        let reply: MinStakeReply = self.endpoint.call("platform.getMinStake", json!({})).await?;
        Ok(reply.min_validator_stake)
    }

    async fn current_supply(&self) -> TransferResult<Amount> {
        let reply: SupplyReply = self
            .endpoint
            .call("platform.getCurrentSupply", json!({}))
            .await?;
        Ok(reply.supply)
    }
}
