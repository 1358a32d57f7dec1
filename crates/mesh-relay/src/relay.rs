// Numan Thabit 2025
//! Relay wire types and the hashes derived from them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::RelayError;

/// Length in bytes of an ed25519 public key.
pub const PUBLIC_KEY_LEN: usize = 32;

/// Non-native chain call the client wants executed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Payload {
    #[serde(default)]
    pub data: String,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl Payload {
    pub fn is_empty(&self) -> bool {
        self.data.is_empty() && self.path.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RelayMeta {
    #[serde(default)]
    pub block_height: u64,
}

/// Application authentication token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Aat {
    #[serde(default)]
    pub version: String,
    pub app_pub_key: String,
    pub client_pub_key: String,
    #[serde(default)]
    pub signature: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayProof {
    pub entropy: u64,
    pub session_block_height: u64,
    pub servicer_pub_key: String,
    pub blockchain: String,
    pub aat: Aat,
    #[serde(default)]
    pub signature: String,
    pub request_hash: String,
}

/// A signed client request to execute a chain call through one servicer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relay {
    pub payload: Payload,
    #[serde(default)]
    pub meta: RelayMeta,
    pub proof: RelayProof,
}

#[derive(Serialize)]
struct RequestHashInput<'a> {
    payload: &'a Payload,
    meta: &'a RelayMeta,
}

impl Relay {
    /// Recompute the request hash from payload and meta.
    pub fn request_hash(&self) -> String {
        request_hash(&self.payload, &self.meta)
    }

    pub fn session_header(&self) -> SessionHeader {
        SessionHeader {
            app_public_key: self.proof.aat.app_pub_key.clone(),
            chain: self.proof.blockchain.clone(),
            session_height: self.proof.session_block_height,
        }
    }

    /// Structural checks run before any lookup, in order.
    pub fn validate_shape(&self) -> Result<(), RelayError> {
        if self.payload.is_empty() {
            return Err(RelayError::malformed("relay payload is empty"));
        }
        if !is_public_key(&self.proof.aat.app_pub_key) {
            return Err(RelayError::malformed("application public key is malformed"));
        }
        if !is_chain_id(&self.proof.blockchain) {
            return Err(RelayError::malformed(format!(
                "blockchain id {:?} is malformed",
                self.proof.blockchain
            )));
        }
        let recomputed = self.request_hash();
        if !recomputed.eq_ignore_ascii_case(&self.proof.request_hash) {
            return Err(RelayError::malformed(
                "proof request hash does not match payload",
            ));
        }
        Ok(())
    }

    /// Key under which the relay is stored durably. Identical payloads at the
    /// same height share a key; `RelayCache::delete_relay` keeps the newest.
    pub fn cache_key(&self) -> String {
        self.proof.request_hash.to_ascii_lowercase()
    }
}

pub fn request_hash(payload: &Payload, meta: &RelayMeta) -> String {
    let input = RequestHashInput { payload, meta };
    // Serializing plain structs with string maps cannot fail.
    let bytes = serde_json::to_vec(&input).unwrap_or_default();
    sha256_hex(&bytes)
}

/// `{application, chain, session height}`; its hash is the session fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionHeader {
    pub app_public_key: String,
    pub chain: String,
    pub session_height: u64,
}

impl SessionHeader {
    pub fn fingerprint(&self) -> String {
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        sha256_hex(&bytes)
    }
}

/// Response handed back to the client after signing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayResponse {
    pub signature: String,
    pub response: String,
    #[serde(skip_serializing, default)]
    pub proof: Option<RelayProof>,
}

#[derive(Serialize)]
struct ResponseHashInput<'a> {
    proof: &'a RelayProof,
    response: &'a str,
}

/// Bytes that the servicer key signs for a response.
pub fn response_hash(proof: &RelayProof, response: &str) -> Result<[u8; 32], serde_json::Error> {
    let bytes = serde_json::to_vec(&ResponseHashInput { proof, response })?;
    Ok(Sha256::digest(bytes).into())
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

pub fn is_public_key(candidate: &str) -> bool {
    candidate.len() == PUBLIC_KEY_LEN * 2 && hex::decode(candidate).is_ok()
}

/// Chain ids are four hex characters, e.g. `0021`.
pub fn is_chain_id(candidate: &str) -> bool {
    candidate.len() == 4 && candidate.chars().all(|c| c.is_ascii_hexdigit())
}

/// Height at which the session containing `height` starts.
pub fn session_height(height: u64, blocks_per_session: u64) -> u64 {
    if height == 0 || blocks_per_session == 0 {
        return height;
    }
    height - ((height - 1) % blocks_per_session)
}

pub fn is_session_start(height: u64, blocks_per_session: u64) -> bool {
    height > 0 && session_height(height, blocks_per_session) == height
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn well_formed_relay_passes_shape_checks() {
        let relay = relay(CLIENT_PUB_KEY, "0001", 100, r#"{"method":"eth_blockNumber"}"#);
        relay.validate_shape().expect("relay is well formed");
    }

    #[test]
    fn shape_checks_fail_in_order() {
        let mut empty = relay(CLIENT_PUB_KEY, "0001", 100, "x");
        empty.payload.data.clear();
        let err = empty.validate_shape().expect_err("empty payload");
        assert!(err.to_string().contains("payload is empty"));

        let mut bad_app = relay(CLIENT_PUB_KEY, "0001", 100, "x");
        bad_app.proof.aat.app_pub_key = "zz".into();
        let err = bad_app.validate_shape().expect_err("bad app key");
        assert!(err.to_string().contains("application public key"));

        let bad_chain = relay(CLIENT_PUB_KEY, "01", 100, "x");
        let err = bad_chain.validate_shape().expect_err("bad chain");
        assert!(err.to_string().contains("blockchain id"));
    }

    #[test]
    fn tampered_payload_breaks_request_hash() {
        let mut relay = relay(CLIENT_PUB_KEY, "0001", 100, "original");
        relay.payload.data = "tampered".into();
        let err = relay.validate_shape().expect_err("hash mismatch");
        assert!(err.to_string().contains("request hash"));
    }

    #[test]
    fn stored_relay_survives_serialization_byte_for_byte() {
        let relay = relay(CLIENT_PUB_KEY, "0001", 100, r#"{"id":1}"#);
        let bytes = serde_json::to_vec(&relay).unwrap();
        let decoded: Relay = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded, relay);
        assert_eq!(serde_json::to_vec(&decoded).unwrap(), bytes);
    }

    #[test]
    fn session_height_aligns_to_session_start() {
        assert_eq!(session_height(5, 4), 5);
        assert_eq!(session_height(6, 4), 5);
        assert_eq!(session_height(8, 4), 5);
        assert_eq!(session_height(9, 4), 9);
        assert_eq!(session_height(1, 4), 1);
        assert!(is_session_start(13, 4));
        assert!(!is_session_start(10, 4));
    }

    #[test]
    fn fingerprint_differs_per_session() {
        let a = SessionHeader {
            app_public_key: APP_PUB_KEY.into(),
            chain: "0001".into(),
            session_height: 5,
        };
        let mut b = a.clone();
        b.session_height = 9;
        assert_ne!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint(), a.clone().fingerprint());
    }

    proptest! {
        #[test]
        fn any_payload_change_is_detected(data in ".{1,64}", other in ".{1,64}") {
            prop_assume!(data != other);
            let mut relay = relay(CLIENT_PUB_KEY, "0001", 9, &data);
            prop_assert!(relay.validate_shape().is_ok());
            relay.payload.data = other;
            prop_assert!(relay.validate_shape().is_err());
        }
    }
}
