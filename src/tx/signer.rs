//! Signing unsigned transactions with a chain keychain

use super::transaction::{Credential, SignedTx, UnsignedTx};
use crate::error::{TransferError, TransferResult};
use crate::keychain::KeyChain;

use tracing::debug;

/// Produce one credential per input, in input order.
///
/// Fails with `MissingKey` before any signature is produced if the keychain
/// cannot satisfy every input.
pub fn sign(unsigned: &UnsignedTx, keychain: &KeyChain) -> TransferResult<SignedTx> {
    if let Some(missing) = unsigned
        .required_signers()
        .into_iter()
        .find(|address| !keychain.contains(address))
    {
        return Err(TransferError::MissingKey { address: missing });
    }

    let digest = unsigned.digest()?;
    let credentials = unsigned
        .all_inputs()
        .map(|input| {
            let signatures = input
                .signers
                .iter()
                .map(|signer| keychain.sign_digest(signer, digest))
                .collect::<TransferResult<Vec<_>>>()?;
            Ok(Credential::from_raw(signatures))
        })
        .collect::<TransferResult<Vec<_>>>()?;

    debug!(
        "Signed {} tx with {} credentials",
        unsigned.kind.name(),
        credentials.len()
    );

    Ok(SignedTx {
        unsigned: unsigned.clone(),
        credentials,
    })
}
