// Numan Thabit 2025
use std::fmt;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};

const ADDRESS_LEN: usize = 20;

#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("private key is not valid hex: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("private key has {0} bytes; expected 32 or 64")]
    Length(usize),
    #[error("private key public half does not match its seed")]
    Mismatch,
    #[error("public key is invalid: {0}")]
    PublicKey(String),
    #[error("signing failed: {0}")]
    Sign(#[from] ed25519_dalek::SignatureError),
}

/// Servicer signing key held in memory.
#[derive(Clone)]
pub struct ServicerKey {
    signing: SigningKey,
    public_hex: String,
    address: String,
}

impl fmt::Debug for ServicerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServicerKey")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

impl ServicerKey {
    /// Accepts a 32-byte seed or a 64-byte `seed || public key`.
    pub fn from_hex(raw: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(raw.trim())?;
        let signing = match bytes.len() {
            32 => {
                let mut seed = [0u8; 32];
                seed.copy_from_slice(&bytes);
                SigningKey::from_bytes(&seed)
            }
            64 => {
                let mut pair = [0u8; 64];
                pair.copy_from_slice(&bytes);
                SigningKey::from_keypair_bytes(&pair).map_err(|_| KeyError::Mismatch)?
            }
            other => return Err(KeyError::Length(other)),
        };
        Ok(Self::from_signing_key(signing))
    }

    pub fn from_signing_key(signing: SigningKey) -> Self {
        let public = signing.verifying_key().to_bytes();
        Self {
            public_hex: hex::encode(public),
            address: address_of(&public),
            signing,
        }
    }

    pub fn public_key_hex(&self) -> &str {
        &self.public_hex
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn sign_hex(&self, message: &[u8]) -> Result<String, KeyError> {
        let signature = self.signing.try_sign(message)?;
        Ok(hex::encode(signature.to_bytes()))
    }
}

/// Hex of the first 20 bytes of SHA-256 over the public key.
pub fn address_of(public_key: &[u8]) -> String {
    let digest = Sha256::digest(public_key);
    hex::encode(&digest[..ADDRESS_LEN])
}

pub fn address_from_public_hex(public_hex: &str) -> Result<String, KeyError> {
    let bytes = hex::decode(public_hex)?;
    if bytes.len() != 32 {
        return Err(KeyError::PublicKey(format!("{} bytes", bytes.len())));
    }
    Ok(address_of(&bytes))
}

pub fn verify_hex(public_hex: &str, message: &[u8], signature_hex: &str) -> Result<bool, KeyError> {
    let public: [u8; 32] = hex::decode(public_hex)?
        .try_into()
        .map_err(|v: Vec<u8>| KeyError::PublicKey(format!("{} bytes", v.len())))?;
    let key = VerifyingKey::from_bytes(&public).map_err(|e| KeyError::PublicKey(e.to_string()))?;
    let signature: [u8; 64] = hex::decode(signature_hex)?
        .try_into()
        .map_err(|v: Vec<u8>| KeyError::Length(v.len()))?;
    Ok(key
        .verify(message, &Signature::from_bytes(&signature))
        .is_ok())
}

#[cfg(test)]
pub(crate) fn test_key(seed: u8) -> ServicerKey {
    ServicerKey::from_signing_key(SigningKey::from_bytes(&[seed; 32]))
}
