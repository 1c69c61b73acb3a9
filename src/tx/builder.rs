//! Transaction builder: coin selection and output layout
//!
//! Building is a pure function of its inputs. Candidate UTXOs are ordered by
//! id before selection, so the same UTXO set in any order yields the same
//! unsigned bytes.

use super::transaction::{TransferableInput, TransferableOutput, TxKind, UnsignedTx};
use crate::error::{TransferError, TransferResult};
use crate::types::{Address, Amount, AssetId, ChainId, OutputOwners, Utxo};

use std::collections::BTreeMap;
use tracing::debug;

/// Chain parameters every build needs
#[derive(Debug, Clone, PartialEq)]
pub struct BuildContext {
    pub network_id: u32,
    pub blockchain_id: ChainId,
    pub fee: Amount,
    pub fee_asset_id: AssetId,
    /// Unix seconds used to evaluate output locktimes
    pub as_of: u64,
}

/// Common shape of every build request
#[derive(Debug, Clone, PartialEq)]
pub struct SpendParams {
    pub amount: Amount,
    pub asset_id: AssetId,
    /// Receivers of `amount`
    pub to: Vec<Address>,
    /// Addresses allowed to sign for inputs (fee payers)
    pub from: Vec<Address>,
    /// Receivers of any excess value
    pub change: Vec<Address>,
    pub memo: Vec<u8>,
}

/// Inputs chosen to cover per-asset targets
#[derive(Debug, Default)]
struct Selection {
    inputs: Vec<TransferableInput>,
    totals: BTreeMap<AssetId, Amount>,
}

impl Selection {
    fn total(&self, asset_id: &AssetId) -> Amount {
        self.totals.get(asset_id).copied().unwrap_or_default()
    }

    fn push(&mut self, utxo: &Utxo, signers: Vec<Address>) {
        let total = self.totals.entry(utxo.asset_id.clone()).or_default();
        *total = total.saturating_add(utxo.amount);
        self.inputs.push(TransferableInput {
            utxo_id: utxo.id.clone(),
            asset_id: utxo.asset_id.clone(),
            amount: utxo.amount,
            signers,
        });
    }
}

/// Builds unsigned transfer, export and import transactions
#[derive(Debug, Clone)]
pub struct TxBuilder {
    ctx: BuildContext,
}

impl TxBuilder {
    pub fn new(ctx: BuildContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &BuildContext {
        &self.ctx
    }

    /// Same-chain transfer of `amount` to `to`, change back to `change`
    pub fn build_transfer(&self, utxos: &[Utxo], params: &SpendParams) -> TransferResult<UnsignedTx> {
        self.validate(params)?;
        let (inputs, mut outputs) = self.spend(utxos, params)?;
        outputs.insert(0, self.output(&params.asset_id, params.amount, &params.to));

        Ok(UnsignedTx {
            network_id: self.ctx.network_id,
            blockchain_id: self.ctx.blockchain_id.clone(),
            inputs,
            outputs,
            kind: TxKind::Base,
            memo: params.memo.clone(),
        })
    }

    /// Export of `amount` to `to` on `destination_chain`
    pub fn build_export(
        &self,
        utxos: &[Utxo],
        params: &SpendParams,
        destination_chain: &ChainId,
    ) -> TransferResult<UnsignedTx> {
        self.validate(params)?;
        if destination_chain == &self.ctx.blockchain_id {
            return Err(TransferError::InvalidRequest(
                "export destination must differ from the source chain".to_string(),
            ));
        }

        let (inputs, outputs) = self.spend(utxos, params)?;
        let exported_outputs = vec![self.output(&params.asset_id, params.amount, &params.to)];

        debug!(
            "Built export of {} {} to chain {} from {} inputs",
            params.amount,
            params.asset_id,
            destination_chain,
            inputs.len()
        );

        Ok(UnsignedTx {
            network_id: self.ctx.network_id,
            blockchain_id: self.ctx.blockchain_id.clone(),
            inputs,
            outputs,
            kind: TxKind::Export {
                destination_chain: destination_chain.clone(),
                exported_outputs,
            },
            memo: params.memo.clone(),
        })
    }

    /// Import of every spendable atomic UTXO of `asset_id` exported by `source_chain`.
    ///
    /// The fee is taken from the imported value. At least `amount` must arrive
    /// in the receivers' output. When the asset differs from the fee asset,
    /// imported fee-asset leftovers go to `change`.
    pub fn build_import(
        &self,
        atomic_utxos: &[Utxo],
        params: &SpendParams,
        source_chain: &ChainId,
    ) -> TransferResult<UnsignedTx> {
        if params.to.is_empty() {
            return Err(TransferError::InvalidRequest("no receiver addresses".to_string()));
        }
        if source_chain == &self.ctx.blockchain_id {
            return Err(TransferError::InvalidRequest(
                "import source must differ from the destination chain".to_string(),
            ));
        }

        let fee_asset = &self.ctx.fee_asset_id;
        let mut selection = Selection::default();
        for utxo in self.candidates(atomic_utxos) {
            if utxo.asset_id != params.asset_id && &utxo.asset_id != fee_asset {
                continue;
            }
            if let Some(signers) = utxo.owners.signers_among(&params.from, self.ctx.as_of) {
                selection.push(utxo, signers);
            }
        }

        let imported = selection.total(&params.asset_id);
        let same_asset = &params.asset_id == fee_asset;
        let need = if same_asset {
            params.amount.saturating_add(self.ctx.fee)
        } else {
            params.amount
        };
        if imported < need || imported.is_zero() {
            return Err(TransferError::InsufficientFunds {
                asset_id: params.asset_id.clone(),
                have: imported,
                need,
            });
        }

        let mut outputs = Vec::new();
        if same_asset {
            outputs.push(self.output(&params.asset_id, imported - self.ctx.fee, &params.to));
        } else {
            let fee_total = selection.total(fee_asset);
            if fee_total < self.ctx.fee {
                return Err(TransferError::InsufficientFunds {
                    asset_id: fee_asset.clone(),
                    have: fee_total,
                    need: self.ctx.fee,
                });
            }
            outputs.push(self.output(&params.asset_id, imported, &params.to));
            let leftover = fee_total - self.ctx.fee;
            if !leftover.is_zero() {
                outputs.push(self.output(fee_asset, leftover, &params.change));
            }
        }

        let mut imported_inputs = selection.inputs;
        imported_inputs.sort_by(|a, b| a.utxo_id.cmp(&b.utxo_id));

        Ok(UnsignedTx {
            network_id: self.ctx.network_id,
            blockchain_id: self.ctx.blockchain_id.clone(),
            inputs: Vec::new(),
            outputs,
            kind: TxKind::Import {
                source_chain: source_chain.clone(),
                imported_inputs,
            },
            memo: params.memo.clone(),
        })
    }

    fn validate(&self, params: &SpendParams) -> TransferResult<()> {
        if params.amount.is_zero() {
            return Err(TransferError::InvalidRequest("amount must be positive".to_string()));
        }
        if params.to.is_empty() {
            return Err(TransferError::InvalidRequest("no receiver addresses".to_string()));
        }
        if params.change.is_empty() {
            return Err(TransferError::InvalidRequest("no change addresses".to_string()));
        }
        Ok(())
    }

    /// Select inputs covering `amount` plus fee, returning inputs and change outputs
    fn spend(
        &self,
        utxos: &[Utxo],
        params: &SpendParams,
    ) -> TransferResult<(Vec<TransferableInput>, Vec<TransferableOutput>)> {
        let mut targets = BTreeMap::new();
        targets.insert(params.asset_id.clone(), params.amount);
        if !self.ctx.fee.is_zero() {
            let fee_target = targets
                .entry(self.ctx.fee_asset_id.clone())
                .or_insert_with(Amount::zero);
            *fee_target = fee_target.saturating_add(self.ctx.fee);
        }

        let selection = self.select(utxos, &params.from, &targets)?;

        let change = targets
            .iter()
            .filter_map(|(asset_id, target)| {
                let excess = selection.total(asset_id) - *target;
                (!excess.is_zero()).then(|| self.output(asset_id, excess, &params.change))
            })
            .collect();

        let mut inputs = selection.inputs;
        inputs.sort_by(|a, b| a.utxo_id.cmp(&b.utxo_id));
        Ok((inputs, change))
    }

    /// Greedy selection per asset over id-ordered candidates
    fn select(
        &self,
        utxos: &[Utxo],
        spenders: &[Address],
        targets: &BTreeMap<AssetId, Amount>,
    ) -> TransferResult<Selection> {
        let candidates = self.candidates(utxos);
        let mut selection = Selection::default();

        for (asset_id, target) in targets {
            for utxo in candidates.iter().filter(|u| &u.asset_id == asset_id) {
                if selection.total(asset_id) >= *target {
                    break;
                }
                if let Some(signers) = utxo.owners.signers_among(spenders, self.ctx.as_of) {
                    selection.push(utxo, signers);
                }
            }

            if selection.total(asset_id) < *target {
                // Report everything spendable, not just what was visited
                let have = candidates
                    .iter()
                    .filter(|u| &u.asset_id == asset_id)
                    .filter(|u| u.owners.signers_among(spenders, self.ctx.as_of).is_some())
                    .fold(Amount::zero(), |acc, u| acc.saturating_add(u.amount));
                return Err(TransferError::InsufficientFunds {
                    asset_id: asset_id.clone(),
                    have,
                    need: *target,
                });
            }
        }

        Ok(selection)
    }

    fn candidates<'a>(&self, utxos: &'a [Utxo]) -> Vec<&'a Utxo> {
        let mut candidates: Vec<&Utxo> = utxos.iter().collect();
        candidates.sort_by(|a, b| a.id.cmp(&b.id));
        candidates.dedup_by(|a, b| a.id == b.id);
        candidates
    }

    fn output(&self, asset_id: &AssetId, amount: Amount, owners: &[Address]) -> TransferableOutput {
        TransferableOutput {
            asset_id: asset_id.clone(),
            amount,
            owners: OutputOwners::new(owners),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{TxId, UtxoId};

    const FEE: u64 = 1_000_000;

    fn avax() -> AssetId {
        AssetId::from("avax-asset")
    }

    fn ctx() -> BuildContext {
        BuildContext {
            network_id: 5,
            blockchain_id: ChainId::from("x-chain"),
            fee: Amount::from(FEE),
            fee_asset_id: avax(),
            as_of: 1_700_000_000,
        }
    }

    fn sender() -> Address {
        Address::from("X-0xsender")
    }

    fn receiver() -> Address {
        Address::from("X-0xreceiver")
    }

    fn utxo(tx: &str, index: u32, asset: AssetId, amount: u64, owner: Address) -> Utxo {
        Utxo {
            id: UtxoId::new(TxId::from(tx), index),
            asset_id: asset,
            amount: Amount::from(amount),
            owners: OutputOwners::new(&[owner]),
        }
    }

    fn params(amount: u64) -> SpendParams {
        SpendParams {
            amount: Amount::from(amount),
            asset_id: avax(),
            to: vec![receiver()],
            from: vec![sender()],
            change: vec![sender()],
            memo: b"Figment Pathway".to_vec(),
        }
    }

    #[test]
    fn test_transfer_returns_exact_change() {
        let utxos = vec![utxo("t1", 0, avax(), 100_000_000, sender())];
        let tx = TxBuilder::new(ctx())
            .build_transfer(&utxos, &params(50_000_000))
            .unwrap();

        assert_eq!(tx.inputs.len(), 1);
        assert_eq!(tx.outputs.len(), 2);
        assert_eq!(tx.outputs[0].amount, Amount::from(50_000_000u64));
        assert_eq!(tx.outputs[0].owners.addresses, vec![receiver()]);
        assert_eq!(tx.outputs[1].amount, Amount::from(100_000_000 - 50_000_000 - FEE));
        assert_eq!(tx.outputs[1].owners.addresses, vec![sender()]);

        // Nothing created or destroyed beyond the fee
        assert_eq!(tx.consumed(&avax()), tx.produced(&avax()) + Amount::from(FEE));
        assert_eq!(tx.burned(&avax()), Amount::from(FEE));
    }

    #[test]
    fn test_exact_amount_produces_no_change() {
        let utxos = vec![utxo("t1", 0, avax(), 50_000_000 + FEE, sender())];
        let tx = TxBuilder::new(ctx())
            .build_transfer(&utxos, &params(50_000_000))
            .unwrap();
        assert_eq!(tx.outputs.len(), 1);
    }

    #[test]
    fn test_selection_stops_once_covered() {
        let utxos = vec![
            utxo("a", 0, avax(), 30_000_000, sender()),
            utxo("b", 0, avax(), 30_000_000, sender()),
            utxo("c", 0, avax(), 30_000_000, sender()),
        ];
        let tx = TxBuilder::new(ctx())
            .build_transfer(&utxos, &params(40_000_000))
            .unwrap();

        assert_eq!(tx.inputs.len(), 2);
        assert_eq!(tx.consumed(&avax()), Amount::from(60_000_000u64));
        assert_eq!(tx.outputs[1].amount, Amount::from(60_000_000 - 40_000_000 - FEE));
    }

    #[test]
    fn test_insufficient_funds_leaves_input_untouched() {
        let utxos = vec![
            utxo("a", 0, avax(), 30_000_000, sender()),
            utxo("b", 0, avax(), 20_000_000, sender()),
        ];
        let snapshot = utxos.clone();

        let err = TxBuilder::new(ctx())
            .build_transfer(&utxos, &params(50_000_000))
            .unwrap_err();

        match err {
            TransferError::InsufficientFunds { have, need, .. } => {
                assert_eq!(have, Amount::from(50_000_000u64));
                assert_eq!(need, Amount::from(50_000_000 + FEE));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(utxos, snapshot);
    }

    #[test]
    fn test_foreign_utxos_are_not_spent() {
        let utxos = vec![
            utxo("a", 0, avax(), 500_000_000, Address::from("X-0xstranger")),
            utxo("b", 0, avax(), 10_000_000, sender()),
        ];
        let err = TxBuilder::new(ctx())
            .build_transfer(&utxos, &params(50_000_000))
            .unwrap_err();
        assert!(matches!(err, TransferError::InsufficientFunds { .. }));
    }

    #[test]
    fn test_builds_are_deterministic() {
        let utxos = vec![
            utxo("c", 1, avax(), 30_000_000, sender()),
            utxo("a", 0, avax(), 30_000_000, sender()),
            utxo("b", 2, avax(), 30_000_000, sender()),
        ];
        let mut reordered = utxos.clone();
        reordered.reverse();

        let builder = TxBuilder::new(ctx());
        let first = builder.build_transfer(&utxos, &params(45_000_000)).unwrap();
        let second = builder.build_transfer(&utxos, &params(45_000_000)).unwrap();
        let third = builder.build_transfer(&reordered, &params(45_000_000)).unwrap();

        assert_eq!(first.encode().unwrap(), second.encode().unwrap());
        assert_eq!(first.encode().unwrap(), third.encode().unwrap());
        assert_eq!(first.inputs[0].utxo_id.tx_id, TxId::from("a"));
    }

    #[test]
    fn test_non_fee_asset_pays_fee_separately() {
        let token = AssetId::from("token");
        let utxos = vec![
            utxo("a", 0, token.clone(), 500, sender()),
            utxo("b", 0, avax(), 3_000_000, sender()),
        ];
        let mut p = params(200);
        p.asset_id = token.clone();

        let tx = TxBuilder::new(ctx()).build_transfer(&utxos, &p).unwrap();

        assert_eq!(tx.burned(&token), Amount::zero());
        assert_eq!(tx.burned(&avax()), Amount::from(FEE));
        assert_eq!(tx.produced(&token), Amount::from(500u64));
        assert_eq!(tx.produced(&avax()), Amount::from(2_000_000u64));
    }

    #[test]
    fn test_export_moves_amount_to_destination() {
        let utxos = vec![utxo("t1", 0, avax(), 100_000_000, sender())];
        let c_chain = ChainId::from("c-chain");
        let mut p = params(50_000_000);
        p.to = vec![Address::from("C-0xreceiver")];

        let tx = TxBuilder::new(ctx()).build_export(&utxos, &p, &c_chain).unwrap();

        match &tx.kind {
            TxKind::Export {
                destination_chain,
                exported_outputs,
            } => {
                assert_eq!(destination_chain, &c_chain);
                assert_eq!(exported_outputs.len(), 1);
                assert_eq!(exported_outputs[0].amount, Amount::from(50_000_000u64));
                assert_eq!(
                    exported_outputs[0].owners.addresses,
                    vec![Address::from("C-0xreceiver")]
                );
            }
            other => panic!("unexpected kind: {other:?}"),
        }
        assert_eq!(tx.outputs.len(), 1);
        assert_eq!(tx.outputs[0].amount, Amount::from(100_000_000 - 50_000_000 - FEE));
        assert_eq!(tx.burned(&avax()), Amount::from(FEE));
    }

    #[test]
    fn test_export_to_self_rejected() {
        let utxos = vec![utxo("t1", 0, avax(), 100_000_000, sender())];
        let err = TxBuilder::new(ctx())
            .build_export(&utxos, &params(1), &ChainId::from("x-chain"))
            .unwrap_err();
        assert!(matches!(err, TransferError::InvalidRequest(_)));
    }

    #[test]
    fn test_import_sweeps_atomic_utxos_minus_fee() {
        let c_receiver = Address::from("C-0xreceiver");
        let mut c_ctx = ctx();
        c_ctx.blockchain_id = ChainId::from("c-chain");
        let atomic = vec![utxo("export", 0, avax(), 50_000_000, c_receiver.clone())];
        let p = SpendParams {
            amount: Amount::from(50_000_000u64) - Amount::from(FEE),
            asset_id: avax(),
            to: vec![c_receiver.clone()],
            from: vec![c_receiver.clone()],
            change: vec![c_receiver.clone()],
            memo: Vec::new(),
        };

        let tx = TxBuilder::new(c_ctx)
            .build_import(&atomic, &p, &ChainId::from("x-chain"))
            .unwrap();

        assert!(tx.inputs.is_empty());
        assert_eq!(tx.outputs.len(), 1);
        assert_eq!(tx.outputs[0].amount, Amount::from(50_000_000 - FEE));
        assert_eq!(tx.required_signers().into_iter().collect::<Vec<_>>(), vec![c_receiver]);
    }

    #[test]
    fn test_import_without_enough_value() {
        let c_receiver = Address::from("C-0xreceiver");
        let mut c_ctx = ctx();
        c_ctx.blockchain_id = ChainId::from("c-chain");
        let atomic = vec![utxo("export", 0, avax(), FEE / 2, c_receiver.clone())];
        let p = SpendParams {
            amount: Amount::zero(),
            asset_id: avax(),
            to: vec![c_receiver.clone()],
            from: vec![c_receiver.clone()],
            change: vec![c_receiver],
            memo: Vec::new(),
        };

        let err = TxBuilder::new(c_ctx)
            .build_import(&atomic, &p, &ChainId::from("x-chain"))
            .unwrap_err();
        assert!(matches!(err, TransferError::InsufficientFunds { .. }));
    }

    #[test]
    fn test_zero_amount_rejected() {
        let utxos = vec![utxo("t1", 0, avax(), 100, sender())];
        assert!(matches!(
            TxBuilder::new(ctx()).build_transfer(&utxos, &params(0)),
            Err(TransferError::InvalidRequest(_))
        ));
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn token() -> AssetId {
            AssetId::from("token-asset")
        }

        /// Up to eight UTXOs, each AVAX or token, owned by the sender or a stranger
        fn utxo_set() -> impl Strategy<Value = Vec<Utxo>> {
            prop::collection::vec((any::<bool>(), 1u64..60_000_000, any::<bool>()), 0..8).prop_map(
                |specs| {
                    specs
                        .into_iter()
                        .enumerate()
                        .map(|(i, (is_token, amount, owned))| {
                            let asset = if is_token { token() } else { avax() };
                            let owner = if owned {
                                sender()
                            } else {
                                Address::from("X-0xstranger")
                            };
                            utxo(&format!("t{}", i), i as u32 % 3, asset, amount, owner)
                        })
                        .collect()
                },
            )
        }

        fn spendable(utxos: &[Utxo], asset_id: &AssetId) -> u64 {
            utxos
                .iter()
                .filter(|u| &u.asset_id == asset_id && u.owners.addresses == vec![sender()])
                .map(|u| u.amount.as_u64())
                .sum()
        }

        fn request(amount: u64, is_token: bool) -> SpendParams {
            let mut p = params(amount);
            if is_token {
                p.asset_id = token();
            }
            p
        }

        proptest! {
            /// Every asset balances: consumed equals produced plus the fee burned.
            #[test]
            fn transfer_conserves_value(
                utxos in utxo_set(),
                amount in 1u64..100_000_000,
                is_token in any::<bool>(),
            ) {
                if let Ok(tx) = TxBuilder::new(ctx()).build_transfer(&utxos, &request(amount, is_token)) {
                    for asset_id in tx.assets() {
                        let fee = if asset_id == avax() { Amount::from(FEE) } else { Amount::zero() };
                        prop_assert_eq!(tx.consumed(&asset_id), tx.produced(&asset_id) + fee);
                    }
                    prop_assert_eq!(tx.outputs[0].amount, Amount::from(amount));
                }
            }

            /// The build fails with `InsufficientFunds` exactly when the sender
            /// cannot cover the amount plus the fee.
            #[test]
            fn insufficient_funds_iff_short(
                utxos in utxo_set(),
                amount in 1u64..100_000_000,
                is_token in any::<bool>(),
            ) {
                let avax_total = spendable(&utxos, &avax());
                let covered = if is_token {
                    spendable(&utxos, &token()) >= amount && avax_total >= FEE
                } else {
                    avax_total >= amount + FEE
                };

                match TxBuilder::new(ctx()).build_transfer(&utxos, &request(amount, is_token)) {
                    Ok(_) => prop_assert!(covered),
                    Err(TransferError::InsufficientFunds { .. }) => prop_assert!(!covered),
                    Err(other) => prop_assert!(false, "unexpected error: {}", other),
                }
            }

            /// UTXO order never changes the unsigned bytes.
            #[test]
            fn encoding_ignores_utxo_order(
                (utxos, shuffled) in utxo_set().prop_flat_map(|v| (Just(v.clone()), Just(v).prop_shuffle())),
                amount in 1u64..100_000_000,
                is_token in any::<bool>(),
            ) {
                let builder = TxBuilder::new(ctx());
                let p = request(amount, is_token);
                match (builder.build_transfer(&utxos, &p), builder.build_transfer(&shuffled, &p)) {
                    (Ok(a), Ok(b)) => prop_assert_eq!(a.encode().unwrap(), b.encode().unwrap()),
                    (Err(_), Err(_)) => {}
                    _ => prop_assert!(false, "order changed the build outcome"),
                }
            }
        }
    }
}
