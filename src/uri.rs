//! Pairing URI parser/builder for the two supported schemes:
//! `nostrconnect://<clientPubkey>?...` (client-initiated) and
//! `bunker://<remoteSignerPubkey>?...` (signer-initiated).

use crate::error::UriError;
use crate::keys::PublicKey;
use crate::session::SessionMetadata;

#[derive(Debug, Clone)]
pub struct ClientInitiatedToken {
    pub client_pubkey: PublicKey,
    pub relays: Vec<String>,
    pub secret: Option<String>,
    pub perms: Vec<String>,
    pub metadata: SessionMetadata,
    pub raw_params: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct SignerInitiatedToken {
    pub remote_signer_pubkey: PublicKey,
    pub relays: Vec<String>,
    pub secret: Option<String>,
    pub perms: Vec<String>,
    pub metadata: SessionMetadata,
    pub raw_params: Vec<(String, String)>,
}

/// Parse either scheme. `url::Url` can't parse non-`http(s)` authorities
/// directly, so the primary key and query string are split manually and
/// the query is then handed to `url::form_urlencoded` for percent-decoding.
fn split_scheme_and_rest(uri: &str) -> Result<(&str, &str), UriError> {
    let (scheme, rest) = uri
        .split_once("://")
        .ok_or_else(|| UriError::Invalid("missing scheme separator".into()))?;
    Ok((scheme, rest))
}

fn parse_authority_and_query(rest: &str) -> (String, Vec<(String, String)>) {
    let (authority, query) = rest.split_once('?').unwrap_or((rest, ""));
    let pairs: Vec<(String, String)> = url::form_urlencoded::parse(query.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    (authority.to_string(), pairs)
}

fn collect_relays(pairs: &[(String, String)]) -> Vec<String> {
    pairs
        .iter()
        .filter(|(k, _)| k == "relay")
        .map(|(_, v)| v.clone())
        .collect()
}

fn first_value(pairs: &[(String, String)], key: &str) -> Option<String> {
    pairs.iter().find(|(k, _)| k == key).map(|(_, v)| v.clone())
}

fn parse_perms(pairs: &[(String, String)]) -> Vec<String> {
    first_value(pairs, "perms")
        .map(|v| v.split(',').filter(|s| !s.is_empty()).map(str::to_string).collect())
        .unwrap_or_default()
}

fn parse_metadata(pairs: &[(String, String)]) -> SessionMetadata {
    first_value(pairs, "metadata")
        .and_then(|raw| serde_json::from_str::<serde_json::Value>(&raw).ok())
        .map(|value| SessionMetadata {
            name: value.get("name").and_then(|v| v.as_str()).map(str::to_string),
            url: value.get("url").and_then(|v| v.as_str()).map(str::to_string),
            image: value.get("image").and_then(|v| v.as_str()).map(str::to_string),
            description: value
                .get("description")
                .and_then(|v| v.as_str())
                .map(str::to_string),
        })
        .unwrap_or_default()
}

pub fn parse_client_initiated(uri: &str) -> Result<ClientInitiatedToken, UriError> {
    let (scheme, rest) = split_scheme_and_rest(uri)?;
    if scheme != "nostrconnect" {
        return Err(UriError::UnknownScheme(scheme.to_string()));
    }
    let (authority, pairs) = parse_authority_and_query(rest);
    if authority.is_empty() {
        return Err(UriError::MissingPrimaryKey);
    }

    Ok(ClientInitiatedToken {
        client_pubkey: PublicKey::from_hex(&authority)?,
        relays: collect_relays(&pairs),
        secret: first_value(&pairs, "secret"),
        perms: parse_perms(&pairs),
        metadata: parse_metadata(&pairs),
        raw_params: pairs,
    })
}

pub fn parse_signer_initiated(uri: &str) -> Result<SignerInitiatedToken, UriError> {
    let (scheme, rest) = split_scheme_and_rest(uri)?;
    if scheme != "bunker" {
        return Err(UriError::UnknownScheme(scheme.to_string()));
    }
    let (authority, pairs) = parse_authority_and_query(rest);
    if authority.is_empty() {
        return Err(UriError::MissingPrimaryKey);
    }

    Ok(SignerInitiatedToken {
        remote_signer_pubkey: PublicKey::from_hex(&authority)?,
        relays: collect_relays(&pairs),
        secret: first_value(&pairs, "secret"),
        perms: parse_perms(&pairs),
        metadata: parse_metadata(&pairs),
        raw_params: pairs,
    })
}

/// Either scheme, dispatching on the prefix.
pub enum PairingToken {
    ClientInitiated(ClientInitiatedToken),
    SignerInitiated(SignerInitiatedToken),
}

pub fn parse(uri: &str) -> Result<PairingToken, UriError> {
    let (scheme, _) = split_scheme_and_rest(uri)?;
    match scheme {
        "nostrconnect" => parse_client_initiated(uri).map(PairingToken::ClientInitiated),
        "bunker" => parse_signer_initiated(uri).map(PairingToken::SignerInitiated),
        other => Err(UriError::UnknownScheme(other.to_string())),
    }
}

/// Build a `nostrconnect://` URI. The client pubkey is percent-encoded
/// (it never contains reserved characters in practice, but building is
/// expected to be tolerant of future non-hex identifiers).
pub fn build_client_initiated(
    client_pubkey: &PublicKey,
    relays: &[String],
    secret: Option<&str>,
    perms: &[String],
    metadata: Option<&SessionMetadata>,
) -> String {
    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for relay in relays {
        serializer.append_pair("relay", relay);
    }
    if let Some(secret) = secret {
        serializer.append_pair("secret", secret);
    }
    if !perms.is_empty() {
        serializer.append_pair("perms", &perms.join(","));
    }
    if let Some(metadata) = metadata {
        if let Ok(json) = serde_json::to_string(metadata) {
            serializer.append_pair("metadata", &json);
        }
    }
    let query = serializer.finish();

    let encoded_pubkey: String = url::form_urlencoded::byte_serialize(client_pubkey.to_hex().as_bytes())
        .collect();

    if query.is_empty() {
        format!("nostrconnect://{encoded_pubkey}")
    } else {
        format!("nostrconnect://{encoded_pubkey}?{query}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_signer_initiated_collects_multiple_relays_and_secret() {
        let pk = crate::keys::generate().public_key.to_hex();
        let uri = format!("bunker://{pk}?relay=wss://r1&relay=wss://r2&secret=S");
        let token = parse_signer_initiated(&uri).unwrap();
        assert_eq!(token.relays, vec!["wss://r1", "wss://r2"]);
        assert_eq!(token.secret.as_deref(), Some("S"));
    }

    #[test]
    fn parse_rejects_unknown_scheme() {
        assert!(matches!(
            parse("other://abc"),
            Err(UriError::UnknownScheme(_))
        ));
    }

    #[test]
    fn build_then_parse_client_initiated_round_trips() {
        let kp = crate::keys::generate();
        let relays = vec!["wss://r1".to_string(), "wss://r2".to_string()];
        let perms = vec!["sign_event".to_string(), "nip44_encrypt".to_string()];
        let uri = build_client_initiated(&kp.public_key, &relays, Some("S"), &perms, None);

        let token = parse_client_initiated(&uri).unwrap();
        assert_eq!(token.client_pubkey.to_hex(), kp.public_key.to_hex());
        assert_eq!(token.relays, relays);
        assert_eq!(token.secret.as_deref(), Some("S"));
        assert_eq!(token.perms, perms);
    }

    #[test]
    fn metadata_json_parses_into_known_fields_dropping_unknown_keys() {
        let pk = crate::keys::generate().public_key.to_hex();
        let metadata = r#"{"name":"App","unknown_key":"ignored"}"#;
        let encoded: String = url::form_urlencoded::byte_serialize(metadata.as_bytes()).collect();
        let uri = format!("bunker://{pk}?metadata={encoded}");
        let token = parse_signer_initiated(&uri).unwrap();
        assert_eq!(token.metadata.name.as_deref(), Some("App"));
    }
}
