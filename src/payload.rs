//! Request/response payload construction, validation, and the JSON+cipher
//! wrapping around them.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cipher::{self, EncryptionContext};
use crate::error::PayloadError;

/// The closed set of RPC methods this protocol carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    Connect,
    SignEvent,
    Ping,
    GetPublicKey,
    Nip04Encrypt,
    Nip04Decrypt,
    Nip44Encrypt,
    Nip44Decrypt,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestPayload {
    pub id: String,
    pub method: Method,
    pub params: Vec<String>,
}

impl RequestPayload {
    /// Build a request, generating an id if the caller doesn't supply one.
    pub fn new(id: Option<String>, method: Method, params: Vec<String>) -> Self {
        Self {
            id: id.unwrap_or_else(generate_id),
            method,
            params,
        }
    }

    fn validate(&self) -> Result<(), PayloadError> {
        if self.id.is_empty() {
            return Err(PayloadError::UnexpectedPayload("empty request id".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponsePayload {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResponsePayload {
    pub fn ok(id: impl Into<String>, result: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            result: Some(result.into()),
            error: None,
        }
    }

    pub fn err(id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            result: None,
            error: Some(error.into()),
        }
    }

    /// Shape used to signal an out-of-band approval step is required.
    pub fn auth_challenge(id: impl Into<String>, challenge_url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            result: Some("auth_url".to_string()),
            error: Some(challenge_url.into()),
        }
    }

    pub fn is_auth_challenge(&self) -> bool {
        self.result.as_deref() == Some("auth_url") && self.error.is_some()
    }

    fn validate(&self) -> Result<(), PayloadError> {
        if self.id.is_empty() {
            return Err(PayloadError::UnexpectedPayload("empty response id".into()));
        }
        Ok(())
    }
}

fn generate_id() -> String {
    Uuid::new_v4().to_string()
}

/// The `<millis>-<randomHex>` format spec.md falls back to when a random
/// UUID generator isn't available. Rust's `uuid::Uuid::new_v4` always is, so
/// `generate_id` never needs it in practice; kept for callers that want the
/// alternate shape (e.g. replaying a legacy id format) and covered directly
/// by a test below.
#[allow(dead_code)]
pub(crate) fn timestamp_hex_id() -> String {
    let millis = crate::time::now_millis();
    let mut bytes = [0u8; 8];
    getrandom::getrandom(&mut bytes).expect("system RNG must be available");
    format!("{millis}-{}", hex::encode(bytes))
}

pub fn encode_request(
    payload: &RequestPayload,
    ctx: &EncryptionContext<'_>,
) -> Result<String, PayloadError> {
    payload.validate()?;
    let json = serde_json::to_string(payload)?;
    Ok(cipher::encrypt(&json, ctx)?)
}

pub fn decode_request(
    ciphertext: &str,
    ctx: &EncryptionContext<'_>,
) -> Result<RequestPayload, PayloadError> {
    let json = cipher::decrypt(ciphertext, ctx)?;
    let payload: RequestPayload = serde_json::from_str(&json)
        .map_err(|e| PayloadError::UnexpectedPayload(e.to_string()))?;
    payload.validate()?;
    Ok(payload)
}

pub fn encode_response(
    payload: &ResponsePayload,
    ctx: &EncryptionContext<'_>,
) -> Result<String, PayloadError> {
    payload.validate()?;
    let json = serde_json::to_string(payload)?;
    Ok(cipher::encrypt(&json, ctx)?)
}

pub fn decode_response(
    ciphertext: &str,
    ctx: &EncryptionContext<'_>,
) -> Result<ResponsePayload, PayloadError> {
    let json = cipher::decrypt(ciphertext, ctx)?;
    let payload: ResponsePayload = serde_json::from_str(&json)
        .map_err(|e| PayloadError::UnexpectedPayload(e.to_string()))?;
    payload.validate()?;
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::Algorithm;

    #[test]
    fn request_round_trips_through_encode_decode() {
        let a = crate::keys::generate();
        let b = crate::keys::generate();

        let ctx_a = EncryptionContext {
            local_private_key: &a.secret_key,
            remote_public_key: &b.public_key,
            algorithm: Algorithm::Algo44,
        };
        let ctx_b = EncryptionContext {
            local_private_key: &b.secret_key,
            remote_public_key: &a.public_key,
            algorithm: Algorithm::Algo44,
        };

        let req = RequestPayload::new(Some("Q1".into()), Method::Connect, vec!["secret".into()]);
        let ciphertext = encode_request(&req, &ctx_a).unwrap();
        let decoded = decode_request(&ciphertext, &ctx_b).unwrap();

        assert_eq!(decoded.id, "Q1");
        assert_eq!(decoded.params, vec!["secret".to_string()]);
    }

    #[test]
    fn response_without_id_fails_validation() {
        let resp = ResponsePayload {
            id: String::new(),
            result: Some("ack".into()),
            error: None,
        };
        assert!(resp.validate().is_err());
    }

    #[test]
    fn auth_challenge_shape_is_recognized() {
        let resp = ResponsePayload::auth_challenge("R1", "https://signer/approve/X");
        assert!(resp.is_auth_challenge());
    }

    #[test]
    fn id_defaults_to_generated_uuid_when_absent() {
        let req = RequestPayload::new(None, Method::Ping, vec![]);
        assert!(!req.id.is_empty());
    }

    #[test]
    fn timestamp_hex_id_matches_millis_dash_hex_shape() {
        let id = timestamp_hex_id();
        let (millis, hex_part) = id.split_once('-').unwrap();
        assert!(millis.chars().all(|c| c.is_ascii_digit()));
        assert_eq!(hex_part.len(), 16);
        assert!(hex_part.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
