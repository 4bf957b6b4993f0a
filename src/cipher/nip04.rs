//! Legacy NIP-04 encryption: ECDH shared secret, SHA-256 as KDF, AES-256-CBC.
//!
//! Kept for interoperability with remote signers that have not migrated to
//! NIP-44; new pairings default to algo-44 and only use this path when a
//! session's stored `algorithm` is `Algo04`.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use getrandom::getrandom;
use sha2::{Digest, Sha256};

use crate::error::CodecError;
use crate::keys::{PublicKey, SecretKey};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

fn shared_key(secret_key: &SecretKey, public_key: &PublicKey) -> Result<[u8; 32], CodecError> {
    use k256::{ecdh::diffie_hellman, PublicKey as K256PublicKey, SecretKey as K256SecretKey};

    let k256_secret = K256SecretKey::from_slice(secret_key.as_bytes())
        .map_err(|e| CodecError::Encode(format!("invalid secret key: {e}")))?;

    let k256_public = {
        let mut compressed = vec![0x02];
        compressed.extend_from_slice(&public_key.0);
        K256PublicKey::from_sec1_bytes(&compressed)
            .or_else(|_| {
                compressed[0] = 0x03;
                K256PublicKey::from_sec1_bytes(&compressed)
            })
            .map_err(|e| CodecError::Encode(format!("invalid public key: {e}")))?
    };

    let shared_secret = diffie_hellman(k256_secret.to_nonzero_scalar(), k256_public.as_affine());
    let x = shared_secret.raw_secret_bytes();

    let mut hasher = Sha256::new();
    hasher.update(x.as_slice());
    Ok(hasher.finalize().into())
}

/// Encrypt plaintext, producing `base64(ciphertext)?iv=base64(iv)`.
pub fn encrypt(
    secret_key: &SecretKey,
    public_key: &PublicKey,
    plaintext: &str,
) -> Result<String, CodecError> {
    let key = shared_key(secret_key, public_key)?;

    let mut iv = [0u8; 16];
    getrandom(&mut iv).map_err(|e| CodecError::Encode(format!("failed to generate iv: {e}")))?;

    let ciphertext = Aes256CbcEnc::new(&key.into(), &iv.into())
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());

    Ok(format!(
        "{}?iv={}",
        BASE64.encode(ciphertext),
        BASE64.encode(iv)
    ))
}

/// Decrypt a `base64(ciphertext)?iv=base64(iv)` envelope.
pub fn decrypt(
    secret_key: &SecretKey,
    public_key: &PublicKey,
    payload: &str,
) -> Result<String, CodecError> {
    let (ciphertext_b64, iv_part) = payload
        .split_once("?iv=")
        .ok_or_else(|| CodecError::Decode("missing iv marker".into()))?;

    let ciphertext = BASE64
        .decode(ciphertext_b64)
        .map_err(|e| CodecError::Decode(format!("invalid ciphertext base64: {e}")))?;
    let iv = BASE64
        .decode(iv_part)
        .map_err(|e| CodecError::Decode(format!("invalid iv base64: {e}")))?;
    if iv.len() != 16 {
        return Err(CodecError::Decode("invalid iv length".into()));
    }

    let key = shared_key(secret_key, public_key)?;
    let mut iv_arr = [0u8; 16];
    iv_arr.copy_from_slice(&iv);

    let plaintext = Aes256CbcDec::new(&key.into(), &iv_arr.into())
        .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
        .map_err(|e| CodecError::Decode(format!("padding/decrypt error: {e}")))?;

    String::from_utf8(plaintext).map_err(|e| CodecError::Decode(format!("invalid utf8: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_round_trip() {
        let a = crate::keys::generate();
        let b = crate::keys::generate();

        let ciphertext = encrypt(&a.secret_key, &b.public_key, "hello nip04").unwrap();
        let plaintext = decrypt(&b.secret_key, &a.public_key, &ciphertext).unwrap();
        assert_eq!(plaintext, "hello nip04");
    }

    #[test]
    fn decrypt_rejects_missing_iv_marker() {
        let a = crate::keys::generate();
        let b = crate::keys::generate();
        assert!(decrypt(&a.secret_key, &b.public_key, "not-a-valid-envelope").is_err());
    }
}
