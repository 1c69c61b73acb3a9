//! Same-chain value transfer

use super::orchestrator::TransferOrchestrator;
use crate::cancel::CancelSignal;
use crate::error::{TransferError, TransferResult};
use crate::keychain::KeyChain;
use crate::tx::{sign, SpendParams, TxBuilder};
use crate::types::{Address, Amount, TxId, TxStatus};

use tracing::info;

#[derive(Debug, Clone)]
pub struct SendRequest {
    pub chain: String,
    pub asset_symbol: String,
    pub amount: Amount,
    pub to: Address,
    pub memo: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SendReceipt {
    pub tx_id: TxId,
    pub status: TxStatus,
    pub fee: Amount,
    /// Sender balance of the sent asset, before and after
    pub balance_before: Amount,
    pub balance_after: Amount,
}

impl TransferOrchestrator {
    /// Build, sign and submit a base transfer, then track it to acceptance
    pub async fn send(
        &self,
        request: &SendRequest,
        keys: &KeyChain,
        cancel: &mut CancelSignal,
    ) -> TransferResult<SendReceipt> {
        if keys.alias() != request.chain {
            return Err(TransferError::InvalidRequest(format!(
                "keychain for chain {} used on chain {}",
                keys.alias(),
                request.chain
            )));
        }
        if request.amount.is_zero() {
            return Err(TransferError::InvalidRequest("amount must be positive".to_string()));
        }

        let (client, ctx) = self.build_context(&request.chain).await?;
        let asset_id = self
            .resolver
            .resolve(&request.chain, client.as_ref(), &request.asset_symbol)
            .await?;

        let from = keys.addresses();
        let sender = from.first().cloned().ok_or_else(|| {
            TransferError::InvalidRequest(format!("keychain for chain {} has no keys", keys.alias()))
        })?;
        let balance_before = client.balance(&sender, &asset_id).await?;
        let fee = ctx.fee;

        let _guard = self.locks.acquire(&request.chain, &from).await;
        let utxos = self.fetcher.fetch(&request.chain, client.as_ref(), &from, None).await?;
        let params = SpendParams {
            amount: request.amount,
            asset_id: asset_id.clone(),
            to: vec![request.to.clone()],
            from: from.clone(),
            change: vec![sender.clone()],
            memo: request
                .memo
                .as_deref()
                .map(|m| m.as_bytes().to_vec())
                .unwrap_or_default(),
        };
        let unsigned = TxBuilder::new(ctx).build_transfer(&utxos, &params)?;
        let signed = sign(&unsigned, keys)?;

        let tx_id = self
            .submitter
            .submit(client.as_ref(), &request.chain, &signed)
            .await?;
        info!(
            "Sent {} {} on chain {} to {} in {}",
            request.amount, request.asset_symbol, request.chain, request.to, tx_id
        );

        let status = self
            .submitter
            .await_final(client.as_ref(), &request.chain, &tx_id, cancel)
            .await?;
        let balance_after = client.balance(&sender, &asset_id).await?;

        Ok(SendReceipt {
            tx_id,
            status,
            fee,
            balance_before,
            balance_after,
        })
    }
}
