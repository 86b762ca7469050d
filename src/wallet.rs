//! Wallet store glue
//! Mission: per-trade key handling. Key material is read from the store for
//! one trade, its public key is re-derived and checked against the stored
//! address, and the transaction is signed in place. A mismatch means the
//! stored material was tampered with or misbound: fail closed, tell the
//! user, trade nothing.

use anyhow::Result;
use base64::Engine;
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use rand::RngCore;

use crate::db::WalletRecord;
use crate::errors::{ErrorCode, TradeError};

/// Generate a fresh keypair. Returns (pubkey_b58, secret_b58) where the
/// secret is the 64-byte seed+pubkey form wallets conventionally use.
pub fn generate_keypair() -> Result<(String, String)> {
    let mut seed = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut seed);
    let signing = SigningKey::from_bytes(&seed);
    let verifying = signing.verifying_key();

    let mut full = [0u8; 64];
    full[..32].copy_from_slice(&seed);
    full[32..].copy_from_slice(verifying.as_bytes());

    Ok((
        bs58::encode(verifying.as_bytes()).into_string(),
        bs58::encode(full).into_string(),
    ))
}

fn signing_key_from_secret(secret_b58: &str) -> Result<SigningKey, TradeError> {
    let bytes = bs58::decode(secret_b58).into_vec().map_err(|_| {
        TradeError::new(ErrorCode::WalletMismatch, "secret is not valid base58")
    })?;
    let seed: [u8; 32] = match bytes.len() {
        64 => bytes[..32].try_into().map_err(|_| {
            TradeError::new(ErrorCode::WalletMismatch, "secret seed malformed")
        })?,
        32 => bytes.as_slice().try_into().map_err(|_| {
            TradeError::new(ErrorCode::WalletMismatch, "secret seed malformed")
        })?,
        n => {
            return Err(TradeError::new(
                ErrorCode::WalletMismatch,
                format!("secret has unexpected length {}", n),
            ))
        }
    };
    Ok(SigningKey::from_bytes(&seed))
}

/// Re-derive the public key from the stored secret and require it to match
/// the stored address byte for byte.
pub fn validate_wallet(wallet: &WalletRecord) -> Result<SigningKey, TradeError> {
    let signing = signing_key_from_secret(&wallet.secret_b58)?;
    let derived = bs58::encode(signing.verifying_key().as_bytes()).into_string();
    if derived != wallet.pubkey {
        return Err(TradeError::new(
            ErrorCode::WalletMismatch,
            format!(
                "stored address {} does not match derived {}",
                wallet.pubkey, derived
            ),
        ));
    }
    Ok(signing)
}

/// Sign a base64-serialized transaction envelope in place (fee-payer slot).
/// Envelope layout: shortvec signature count, 64 bytes per signature, then
/// the message bytes that get signed.
pub fn sign_transaction_b64(tx_b64: &str, signing: &SigningKey) -> Result<String, TradeError> {
    let engine = base64::engine::general_purpose::STANDARD;
    let bytes = engine
        .decode(tx_b64)
        .map_err(|_| TradeError::new(ErrorCode::SimulationFailed, "transaction is not base64"))?;

    let (sig_count, header_len) = decode_shortvec_len(&bytes)
        .ok_or_else(|| TradeError::new(ErrorCode::SimulationFailed, "malformed signature table"))?;
    let sigs_end = header_len + sig_count * 64;
    if sig_count == 0 || bytes.len() <= sigs_end {
        return Err(TradeError::new(
            ErrorCode::SimulationFailed,
            "transaction has no signature slots",
        ));
    }

    let message = &bytes[sigs_end..];
    let signature = signing.sign(message);

    let mut signed = bytes.clone();
    signed[header_len..header_len + 64].copy_from_slice(&signature.to_bytes());
    Ok(engine.encode(signed))
}

/// Shortvec (compact-u16) length prefix: 7 bits per byte, high bit continues.
fn decode_shortvec_len(bytes: &[u8]) -> Option<(usize, usize)> {
    let mut value = 0usize;
    for (i, b) in bytes.iter().take(3).enumerate() {
        value |= ((b & 0x7f) as usize) << (7 * i);
        if b & 0x80 == 0 {
            return Some((value, i + 1));
        }
    }
    None
}

/// Verify an envelope's fee-payer signature; used by tests and the dry-run
/// path to check what we produced.
pub fn verify_transaction_b64(tx_b64: &str, pubkey_b58: &str) -> Result<bool, TradeError> {
    let engine = base64::engine::general_purpose::STANDARD;
    let bytes = engine
        .decode(tx_b64)
        .map_err(|_| TradeError::new(ErrorCode::SimulationFailed, "transaction is not base64"))?;
    let (sig_count, header_len) = decode_shortvec_len(&bytes)
        .ok_or_else(|| TradeError::new(ErrorCode::SimulationFailed, "malformed signature table"))?;
    if sig_count == 0 {
        return Ok(false);
    }
    let sigs_end = header_len + sig_count * 64;
    if bytes.len() <= sigs_end {
        return Ok(false);
    }

    let key_bytes = bs58::decode(pubkey_b58)
        .into_vec()
        .ok()
        .and_then(|v| <[u8; 32]>::try_from(v).ok())
        .ok_or_else(|| TradeError::new(ErrorCode::WalletMismatch, "pubkey is not 32 bytes"))?;
    let verifying = VerifyingKey::from_bytes(&key_bytes)
        .map_err(|_| TradeError::new(ErrorCode::WalletMismatch, "pubkey is not on the curve"))?;

    let sig_bytes: [u8; 64] = bytes[header_len..header_len + 64]
        .try_into()
        .map_err(|_| TradeError::new(ErrorCode::SimulationFailed, "signature slot malformed"))?;
    let signature = ed25519_dalek::Signature::from_bytes(&sig_bytes);
    Ok(verifying
        .verify_strict(&bytes[sigs_end..], &signature)
        .is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Chain;

    fn record(pubkey: String, secret: String) -> WalletRecord {
        WalletRecord {
            id: 1,
            user_id: 1,
            chain: Chain::Solana,
            pubkey,
            secret_b58: secret,
        }
    }

    /// An unsigned envelope: one empty signature slot plus a message.
    fn unsigned_tx(message: &[u8]) -> String {
        let mut bytes = vec![1u8];
        bytes.extend_from_slice(&[0u8; 64]);
        bytes.extend_from_slice(message);
        base64::engine::general_purpose::STANDARD.encode(bytes)
    }

    #[test]
    fn test_generated_wallet_validates() {
        let (pubkey, secret) = generate_keypair().unwrap();
        assert!(validate_wallet(&record(pubkey, secret)).is_ok());
    }

    #[test]
    fn test_tampered_pubkey_fails_closed() {
        let (_, secret) = generate_keypair().unwrap();
        let (other_pubkey, _) = generate_keypair().unwrap();
        let err = validate_wallet(&record(other_pubkey, secret)).unwrap_err();
        assert_eq!(err.code, ErrorCode::WalletMismatch);
    }

    #[test]
    fn test_garbage_secret_fails_closed() {
        let (pubkey, _) = generate_keypair().unwrap();
        let err = validate_wallet(&record(pubkey, "not-base58-0OIl".to_string())).unwrap_err();
        assert_eq!(err.code, ErrorCode::WalletMismatch);
    }

    #[test]
    fn test_sign_and_verify_envelope() {
        let (pubkey, secret) = generate_keypair().unwrap();
        let signing = validate_wallet(&record(pubkey.clone(), secret)).unwrap();

        let tx = unsigned_tx(b"swap 0.5 SOL for tokens");
        let signed = sign_transaction_b64(&tx, &signing).unwrap();

        assert!(verify_transaction_b64(&signed, &pubkey).unwrap());
        // Unsigned envelope does not verify
        assert!(!verify_transaction_b64(&tx, &pubkey).unwrap());
    }

    #[test]
    fn test_signature_binds_message() {
        let (pubkey, secret) = generate_keypair().unwrap();
        let signing = validate_wallet(&record(pubkey.clone(), secret)).unwrap();
        let signed = sign_transaction_b64(&unsigned_tx(b"original"), &signing).unwrap();

        // Swap the message behind the signature
        let engine = base64::engine::general_purpose::STANDARD;
        let mut bytes = engine.decode(&signed).unwrap();
        let len = bytes.len();
        bytes[len - 1] ^= 0xff;
        let tampered = engine.encode(bytes);
        assert!(!verify_transaction_b64(&tampered, &pubkey).unwrap());
    }

    #[test]
    fn test_rejects_envelope_without_slots() {
        let (_, secret) = generate_keypair().unwrap();
        let signing = signing_key_from_secret(&secret).unwrap();
        let empty = base64::engine::general_purpose::STANDARD.encode([0u8]);
        assert!(sign_transaction_b64(&empty, &signing).is_err());
    }
}
