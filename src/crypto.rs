// LibertAI gateway — signed key-bundle payloads
//
// Key bundles pushed to replicas are signed with the gateway's RSA key:
// RSASSA-PSS, MGF1-SHA256, maximum salt length, SHA-256 digest. The key is
// supplied as a base64-encoded PEM (PKCS#8 or PKCS#1).

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand_core::OsRng;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::traits::PublicKeyParts;
use rsa::{Pss, RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("invalid private key: {0}")]
    InvalidKey(String),

    #[error("signing failed: {0}")]
    Signing(#[from] rsa::Error),

    #[error("payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Wire format for signed payloads: both fields are base64, `data` holds
/// the JSON bytes that were signed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedPayload {
    pub data: String,
    pub signature: String,
}

fn load_private_key(private_key_b64: &str) -> Result<RsaPrivateKey, CryptoError> {
    let pem_bytes = BASE64
        .decode(private_key_b64.trim())
        .map_err(|e| CryptoError::InvalidKey(format!("not valid base64: {e}")))?;
    let pem = String::from_utf8(pem_bytes)
        .map_err(|e| CryptoError::InvalidKey(format!("decoded key is not UTF-8: {e}")))?;

    RsaPrivateKey::from_pkcs8_pem(&pem)
        .or_else(|_| RsaPrivateKey::from_pkcs1_pem(&pem))
        .map_err(|e| CryptoError::InvalidKey(format!("not a PEM RSA private key: {e}")))
}

// PSS with the maximum salt the modulus allows, matching the verifiers
// deployed on replicas.
fn pss_max_salt(key_bytes: usize) -> Pss {
    let salt_len = key_bytes - Sha256::output_size() - 2;
    Pss::new_with_salt::<Sha256>(salt_len)
}

/// Sign `value` and wrap it in the wire format replicas expect.
pub fn create_signed_payload(value: &Value, private_key_b64: &str) -> Result<SignedPayload, CryptoError> {
    let private_key = load_private_key(private_key_b64)?;
    let json_bytes = serde_json::to_vec(value)?;

    let digest = Sha256::digest(&json_bytes);
    let signature = private_key.sign_with_rng(&mut OsRng, pss_max_salt(private_key.size()), &digest)?;

    Ok(SignedPayload {
        data: BASE64.encode(&json_bytes),
        signature: BASE64.encode(&signature),
    })
}

/// Verification counterpart (replicas run the same check on their side).
pub fn verify_signed_payload(payload: &SignedPayload, public_key: &RsaPublicKey) -> bool {
    let Ok(json_bytes) = BASE64.decode(&payload.data) else {
        return false;
    };
    let Ok(signature) = BASE64.decode(&payload.signature) else {
        return false;
    };

    let digest = Sha256::digest(&json_bytes);
    public_key
        .verify(pss_max_salt(public_key.size()), &digest, &signature)
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::pkcs8::EncodePrivateKey;
    use serde_json::json;

    fn test_key_b64() -> (String, RsaPublicKey) {
        let private_key = RsaPrivateKey::new(&mut OsRng, 2048).expect("keygen");
        let public_key = RsaPublicKey::from(&private_key);
        let pem = private_key
            .to_pkcs8_pem(rsa::pkcs8::LineEnding::LF)
            .expect("pem encode");
        (BASE64.encode(pem.as_bytes()), public_key)
    }

    #[test]
    fn sign_verify_round_trip() {
        let (key_b64, public_key) = test_key_b64();
        let value = json!({"keys": ["a", "b", "c"]});

        let payload = create_signed_payload(&value, &key_b64).unwrap();
        assert!(verify_signed_payload(&payload, &public_key));

        let decoded: Value = serde_json::from_slice(&BASE64.decode(&payload.data).unwrap()).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn tampered_data_fails_verification() {
        let (key_b64, public_key) = test_key_b64();
        let mut payload = create_signed_payload(&json!({"keys": ["a"]}), &key_b64).unwrap();
        payload.data = BASE64.encode(br#"{"keys":["evil"]}"#);
        assert!(!verify_signed_payload(&payload, &public_key));
    }

    #[test]
    fn rejects_garbage_key() {
        let err = create_signed_payload(&json!({}), "bm90IGEga2V5").unwrap_err();
        assert!(matches!(err, CryptoError::InvalidKey(_)));
    }
}
