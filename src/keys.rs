//! Key generation, import/export, and event signing primitives.

use k256::schnorr::signature::{Signer, Verifier};
use k256::schnorr::{Signature, SigningKey, VerifyingKey};
use k256::elliptic_curve::rand_core::OsRng;
use sha2::{Digest, Sha256};

use crate::error::KeyError;

/// A 32-byte public key, stored as its x-only Schnorr point.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey(pub [u8; 32]);

impl PublicKey {
    pub fn from_hex(s: &str) -> Result<Self, KeyError> {
        let bytes = decode_hex32(s)?;
        Ok(Self(bytes))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({})", self.to_hex())
    }
}

/// A 32-byte secret scalar. `Debug` never prints the value.
#[derive(Clone)]
pub struct SecretKey([u8; 32]);

impl SecretKey {
    pub fn from_hex(s: &str) -> Result<Self, KeyError> {
        Ok(Self(decode_hex32(s)?))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn public_key(&self) -> Result<PublicKey, KeyError> {
        let signing_key = SigningKey::from_bytes(&self.0)
            .map_err(|_| KeyError::InvalidFormat("invalid secret scalar".into()))?;
        Ok(PublicKey(signing_key.verifying_key().to_bytes().into()))
    }
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretKey(<redacted>)")
    }
}

/// A generated or imported keypair.
#[derive(Clone, Debug)]
pub struct Keypair {
    pub secret_key: SecretKey,
    pub public_key: PublicKey,
}

/// Generate a fresh keypair from the system RNG.
pub fn generate() -> Keypair {
    let signing_key = SigningKey::random(&mut OsRng);
    let secret_bytes: [u8; 32] = signing_key.to_bytes().into();
    let secret_key = SecretKey(secret_bytes);
    let public_key = secret_key
        .public_key()
        .expect("freshly generated scalar is always a valid key");
    Keypair {
        secret_key,
        public_key,
    }
}

/// Import a keypair from a hex-encoded secret key.
pub fn import_hex(hex_secret: &str) -> Result<Keypair, KeyError> {
    let secret_key = SecretKey::from_hex(hex_secret)?;
    let public_key = secret_key.public_key()?;
    Ok(Keypair {
        secret_key,
        public_key,
    })
}

/// Export a keypair's secret key as lowercase hex.
pub fn export_hex(keypair: &Keypair) -> String {
    keypair.secret_key.to_hex()
}

fn decode_hex32(s: &str) -> Result<[u8; 32], KeyError> {
    let trimmed = s.trim();
    let trimmed = trimmed.strip_prefix("0x").unwrap_or(trimmed);
    if trimmed.len() != 64 || !trimmed.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(KeyError::InvalidFormat(format!(
            "expected 64 hex characters, got {}",
            trimmed.len()
        )));
    }
    let bytes = hex::decode(trimmed.to_ascii_lowercase())
        .map_err(|e| KeyError::InvalidFormat(e.to_string()))?;
    let mut arr = [0u8; 32];
    arr.copy_from_slice(&bytes);
    Ok(arr)
}

/// Compute the id of a kind-24133 event per the canonical serialization
/// `[0,"<pubkey>",<created_at>,<kind>,<tags>,"<content>"]`.
pub fn compute_event_id(
    pubkey: &PublicKey,
    created_at: u64,
    kind: u16,
    tags: &[Vec<String>],
    content: &str,
) -> [u8; 32] {
    let tags_json = format_tags_json(tags);
    let serialized = format!(
        "[0,\"{}\",{},{},{},\"{}\"]",
        pubkey.to_hex(),
        created_at,
        kind,
        tags_json,
        escape_string(content)
    );
    let mut hasher = Sha256::new();
    hasher.update(serialized.as_bytes());
    hasher.finalize().into()
}

/// Sign a precomputed event id with the given secret key.
pub fn sign_event_id(secret_key: &SecretKey, event_id: &[u8; 32]) -> Result<String, KeyError> {
    let signing_key = SigningKey::from_bytes(secret_key.as_bytes())
        .map_err(|_| KeyError::InvalidFormat("invalid secret scalar".into()))?;
    let signature = signing_key.sign(event_id);
    Ok(hex::encode(signature.to_bytes()))
}

/// Verify an event id/signature pair against a public key.
pub fn verify_event_signature(
    public_key: &PublicKey,
    event_id: &[u8; 32],
    sig_hex: &str,
) -> Result<(), KeyError> {
    let verifying_key = VerifyingKey::from_bytes(&public_key.0)
        .map_err(|_| KeyError::InvalidFormat("invalid public key".into()))?;
    let sig_bytes =
        hex::decode(sig_hex).map_err(|_| KeyError::InvalidFormat("invalid signature hex".into()))?;
    let signature = Signature::try_from(sig_bytes.as_slice())
        .map_err(|_| KeyError::InvalidFormat("invalid signature format".into()))?;
    verifying_key
        .verify(event_id, &signature)
        .map_err(|_| KeyError::InvalidFormat("signature verification failed".into()))
}

fn format_tags_json(tags: &[Vec<String>]) -> String {
    let mut result = String::from("[");
    for (i, tag) in tags.iter().enumerate() {
        if i > 0 {
            result.push(',');
        }
        result.push('[');
        for (j, part) in tag.iter().enumerate() {
            if j > 0 {
                result.push(',');
            }
            result.push('"');
            result.push_str(&escape_string(part));
            result.push('"');
        }
        result.push(']');
    }
    result.push(']');
    result
}

fn escape_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_round_trips_through_hex() {
        let kp = generate();
        let hex = export_hex(&kp);
        let reimported = import_hex(&hex).unwrap();
        assert_eq!(reimported.public_key.to_hex(), kp.public_key.to_hex());
    }

    #[test]
    fn import_rejects_short_and_long_hex() {
        assert!(import_hex(&"a".repeat(63)).is_err());
        assert!(import_hex(&"a".repeat(65)).is_err());
        assert!(import_hex(&"a".repeat(64)).is_ok());
    }

    #[test]
    fn import_strips_0x_prefix_and_whitespace() {
        let kp = generate();
        let hex = export_hex(&kp);
        let prefixed = format!("  0x{}  ", hex);
        let reimported = import_hex(&prefixed).unwrap();
        assert_eq!(reimported.public_key.to_hex(), kp.public_key.to_hex());
    }

    #[test]
    fn sign_and_verify_round_trip() {
        let kp = generate();
        let id = compute_event_id(&kp.public_key, 1700000000, 24133, &[], "hello");
        let sig = sign_event_id(&kp.secret_key, &id).unwrap();
        verify_event_signature(&kp.public_key, &id, &sig).unwrap();
    }
}
