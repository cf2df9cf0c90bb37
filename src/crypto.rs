//! ECDSA P-256 signatures over signed manifest messages.

use p256::ecdsa::signature::hazmat::{PrehashSigner, PrehashVerifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::pkcs8::{DecodePrivateKey, DecodePublicKey};
use p256::{PublicKey, SecretKey};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::CryptoError;

/// Parse a PEM `PUBLIC KEY` (SPKI) holding a P-256 key.
pub fn parse_public_key(pem: &str) -> Result<VerifyingKey, CryptoError> {
    let key = PublicKey::from_public_key_pem(pem.trim())
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    Ok(VerifyingKey::from(key))
}

/// Verify `signature` (ASN.1 DER, or fixed 64-byte r||s) over `message`.
///
/// `Ok(false)` for a signature that does not validate; `Err` only when the
/// key itself is unusable.
pub fn verify(message: &[u8], signature: &[u8], public_key_pem: &str) -> Result<bool, CryptoError> {
    let key = parse_public_key(public_key_pem)?;
    Ok(verify_with_key(&key, message, signature))
}

pub fn verify_with_key(key: &VerifyingKey, message: &[u8], signature: &[u8]) -> bool {
    let Some(signature) = decode_signature(signature) else {
        debug!(len = signature.len(), "signature bytes are not an ECDSA signature");
        return false;
    };
    key.verify_prehash(&message_digest(message), &signature).is_ok()
}

fn decode_signature(bytes: &[u8]) -> Option<Signature> {
    let signature = Signature::from_der(bytes)
        .or_else(|_| Signature::from_slice(bytes))
        .ok()?;
    // Signers are not required to produce low-S signatures.
    Some(signature.normalize_s().unwrap_or(signature))
}

/// SHA-256 digest of the signed message.
pub fn message_digest(message: &[u8]) -> [u8; 32] {
    Sha256::digest(message).into()
}

/// `sha256:<hex>` over the key's uncompressed SEC1 point. Logged in place
/// of the key itself.
pub fn key_fingerprint(key: &VerifyingKey) -> String {
    let point = key.to_encoded_point(false);
    format!("sha256:{}", hex::encode(Sha256::digest(point.as_bytes())))
}

/// Sign `message` with a PKCS#8 or SEC1 PEM private key. Returns the DER
/// signature.
pub fn sign_message(message: &[u8], private_key_pem: &str) -> Result<Vec<u8>, CryptoError> {
    let pem = private_key_pem.trim();
    let secret = SecretKey::from_pkcs8_pem(pem)
        .or_else(|_| SecretKey::from_sec1_pem(pem))
        .map_err(|e| CryptoError::Signing(format!("unreadable private key: {e}")))?;
    let signing_key = SigningKey::from(secret);
    let signature: Signature = signing_key
        .sign_prehash(&message_digest(message))
        .map_err(|e| CryptoError::Signing(e.to_string()))?;
    Ok(signature.to_der().as_bytes().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use p256::ecdsa::signature::Signer;
    use p256::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};

    fn keypair(seed: u8) -> (SigningKey, String) {
        let signing = SigningKey::from_slice(&[seed; 32]).unwrap();
        let pem = PublicKey::from(signing.verifying_key())
            .to_public_key_pem(LineEnding::LF)
            .unwrap();
        (signing, pem)
    }

    fn sign(key: &SigningKey, message: &[u8]) -> Vec<u8> {
        let signature: Signature = key.sign(message);
        signature.to_der().as_bytes().to_vec()
    }

    #[test]
    fn valid_signature_verifies() {
        let (key, pem) = keypair(7);
        let sig = sign(&key, b"signed blob");
        assert_eq!(verify(b"signed blob", &sig, &pem), Ok(true));
    }

    #[test]
    fn fixed_width_signature_verifies() {
        let (key, pem) = keypair(7);
        let signature: Signature = key.sign(b"blob");
        assert_eq!(verify(b"blob", &signature.to_bytes(), &pem), Ok(true));
    }

    #[test]
    fn wrong_key_is_false_not_error() {
        let (key, _) = keypair(7);
        let (_, other_pem) = keypair(9);
        let sig = sign(&key, b"signed blob");
        assert_eq!(verify(b"signed blob", &sig, &other_pem), Ok(false));
    }

    #[test]
    fn tampered_message_fails() {
        let (key, pem) = keypair(7);
        let sig = sign(&key, b"signed blob");
        assert_eq!(verify(b"signed blOb", &sig, &pem), Ok(false));
    }

    #[test]
    fn garbage_signature_fails() {
        let (_, pem) = keypair(7);
        assert_eq!(verify(b"x", b"", &pem), Ok(false));
        assert_eq!(verify(b"x", b"not a signature", &pem), Ok(false));
    }

    #[test]
    fn malformed_key_is_an_error() {
        assert!(matches!(verify(b"x", b"y", ""), Err(CryptoError::InvalidKey(_))));
        assert!(matches!(
            verify(b"x", b"y", "-----BEGIN PUBLIC KEY-----\nAAAA\n-----END PUBLIC KEY-----"),
            Err(CryptoError::InvalidKey(_))
        ));
    }

    #[test]
    fn sign_message_round_trip() {
        let (key, pem) = keypair(3);
        let private_pem = SecretKey::from_bytes(&key.to_bytes())
            .unwrap()
            .to_pkcs8_pem(LineEnding::LF)
            .unwrap();
        let sig = sign_message(b"payload", &private_pem).unwrap();
        assert_eq!(verify(b"payload", &sig, &pem), Ok(true));
        assert!(matches!(
            sign_message(b"payload", "nope"),
            Err(CryptoError::Signing(_))
        ));
    }

    #[test]
    fn fingerprint_is_stable_and_distinct() {
        let (a, _) = keypair(1);
        let (b, _) = keypair(2);
        let fa = key_fingerprint(a.verifying_key());
        assert_eq!(fa, key_fingerprint(a.verifying_key()));
        assert_ne!(fa, key_fingerprint(b.verifying_key()));
        assert!(fa.starts_with("sha256:"));
        assert_eq!(fa.len(), "sha256:".len() + 64);
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(32))]

            /// Same inputs, same answer.
            #[test]
            fn verification_is_deterministic(
                message in prop::collection::vec(any::<u8>(), 0..512),
                tamper in any::<bool>(),
            ) {
                let (key, pem) = keypair(5);
                let sig = sign(&key, &message);
                let mut checked = message.clone();
                if tamper {
                    checked.push(0xff);
                }
                let first = verify(&checked, &sig, &pem);
                prop_assert_eq!(first.clone(), verify(&checked, &sig, &pem));
                prop_assert_eq!(first, Ok(!tamper));
            }
        }
    }
}
