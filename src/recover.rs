//! ECDSA public-key recovery for transaction senders, EIP-7702
//! authorities and the ecrecover precompile.

use alloy_primitives::{keccak256, Address, B256, U256};
use k256::ecdsa::{RecoveryId, Signature, VerifyingKey};

use crate::primitives::{SignedAuthorization, Transaction};

/// secp256k1 group order / 2; signatures with a higher `s` are malleable
/// and rejected for transactions (EIP-2).
const SECP256K1N_HALF: U256 = U256::from_limbs([
    0xdfe92f46681b20a0,
    0x5d576e7357a4501d,
    0xffffffffffffffff,
    0x7fffffffffffffff,
]);

/// Raw recovery over a 32-byte prehash. Returns `None` for any malformed
/// or unrecoverable signature.
pub(crate) fn recover_address(
    prehash: &B256,
    odd_y_parity: bool,
    r: U256,
    s: U256,
) -> Option<Address> {
    let mut bytes = [0u8; 64];
    bytes[..32].copy_from_slice(&r.to_be_bytes::<32>());
    bytes[32..].copy_from_slice(&s.to_be_bytes::<32>());
    let signature = Signature::from_slice(&bytes).ok()?;
    let recovery_id = RecoveryId::try_from(u8::from(odd_y_parity)).ok()?;
    let key = VerifyingKey::recover_from_prehash(prehash.as_slice(), &signature, recovery_id)
        .ok()?;
    let encoded = key.to_encoded_point(false);
    let hash = keccak256(&encoded.as_bytes()[1..]);
    Some(Address::from_slice(&hash[12..]))
}

/// Recover the sender of a signed transaction.
pub fn recover_sender(tx: &Transaction) -> Option<Address> {
    let sig = tx.signature;
    if sig.s > SECP256K1N_HALF {
        return None;
    }
    recover_address(&tx.signing_hash(), sig.odd_y_parity, sig.r, sig.s)
}

/// Recover the authority of an EIP-7702 authorization tuple.
pub fn recover_authority(authorization: &SignedAuthorization) -> Option<Address> {
    let sig = authorization.signature;
    if sig.s > SECP256K1N_HALF {
        return None;
    }
    recover_address(&authorization.signing_hash(), sig.odd_y_parity, sig.r, sig.s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::{Signature, TxType};
    use alloy_primitives::{Bytes, U256};
    use k256::ecdsa::SigningKey;

    fn sign(prehash: &B256, key: &SigningKey) -> Signature {
        let (signature, recovery_id) = key
            .sign_prehash_recoverable(prehash.as_slice())
            .expect("signing succeeds");
        let normalized = signature.normalize_s();
        // Normalizing s flips the recovery parity.
        let odd = recovery_id.is_y_odd() ^ normalized.is_some();
        let signature = normalized.unwrap_or(signature);
        let r = U256::from_be_slice(&signature.to_bytes()[..32]);
        let s = U256::from_be_slice(&signature.to_bytes()[32..]);
        Signature {
            odd_y_parity: odd,
            r,
            s,
        }
    }

    fn key_address(key: &SigningKey) -> Address {
        let encoded = key.verifying_key().to_encoded_point(false);
        Address::from_slice(&keccak256(&encoded.as_bytes()[1..])[12..])
    }

    #[test]
    fn sender_recovery_roundtrip() {
        let key = SigningKey::from_slice(&[7u8; 32]).unwrap();
        let mut tx = Transaction {
            tx_type: TxType::Eip1559,
            chain_id: Some(143),
            nonce: 3,
            max_fee_per_gas: Some(U256::from(1_000)),
            max_priority_fee_per_gas: Some(U256::from(10)),
            gas_limit: 21_000,
            input: Bytes::new(),
            ..Transaction::default()
        };
        tx.signature = sign(&tx.signing_hash(), &key);
        assert_eq!(recover_sender(&tx), Some(key_address(&key)));
    }

    #[test]
    fn authority_recovery_roundtrip() {
        let key = SigningKey::from_slice(&[9u8; 32]).unwrap();
        let mut authorization = SignedAuthorization {
            chain_id: 143,
            address: Address::ZERO,
            nonce: 0,
            signature: Signature::default(),
        };
        authorization.signature = sign(&authorization.signing_hash(), &key);
        assert_eq!(recover_authority(&authorization), Some(key_address(&key)));
    }

    #[test]
    fn high_s_is_rejected() {
        let key = SigningKey::from_slice(&[7u8; 32]).unwrap();
        let mut tx = Transaction::default();
        tx.signature = sign(&tx.signing_hash(), &key);
        tx.signature.s = SECP256K1N_HALF.saturating_add(U256::from(1));
        assert_eq!(recover_sender(&tx), None);
    }
}
