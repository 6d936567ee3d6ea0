use rand::rngs::OsRng;
use secp256k1::ecdsa::Signature;
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use utoipa::ToSchema;

use std::fmt;
use std::str::FromStr;

/// Number of hex characters kept from the public key digest to form an address
pub const ADDRESS_LENGTH: usize = 40;

/// Errors that can occur during cryptographic operations
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("Invalid private key: {0}")]
    InvalidPrivateKey(String),

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Decoding error: {0}")]
    DecodingError(String),
}

/// SHA-256 of `data` as a lowercase hex string
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Represents a wallet address
///
/// Addresses are the first 40 hex characters of SHA-256 over the
/// compressed (33 byte) SEC1 encoding of the owner's public key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema)]
pub struct Address(pub String);

impl Address {
    /// Derives the address of a public key
    pub fn from_public_key(public_key: &PublicKey) -> Self {
        let mut encoded = sha256_hex(&public_key.serialize());
        encoded.truncate(ADDRESS_LENGTH);
        Address(encoded)
    }

    /// Derives the address of a hex encoded public key
    pub fn from_public_key_hex(public_key: &str) -> Result<Self, CryptoError> {
        parse_public_key(public_key).map(|key| Address::from_public_key(&key))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Address {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let valid = s.len() == ADDRESS_LENGTH && s.chars().all(|c| c.is_ascii_hexdigit());
        if !valid {
            return Err(CryptoError::InvalidAddress(s.to_string()));
        }

        Ok(Address(s.to_ascii_lowercase()))
    }
}

/// Parses a hex encoded secp256k1 public key
///
/// Accepts compressed (33 bytes), uncompressed (65 bytes) and raw
/// `x || y` (64 bytes, no SEC1 prefix) encodings.
pub fn parse_public_key(public_key: &str) -> Result<PublicKey, CryptoError> {
    let mut bytes = hex::decode(public_key.trim())
        .map_err(|e| CryptoError::DecodingError(e.to_string()))?;

    if bytes.len() == 64 {
        bytes.insert(0, 0x04);
    }

    PublicKey::from_slice(&bytes).map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))
}

/// Represents a hex encoded ECDSA signature
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct DigitalSignature(pub String);

impl DigitalSignature {
    /// Creates a new digital signature from a signature (compact encoding)
    pub fn from_signature(signature: &Signature) -> Self {
        DigitalSignature(hex::encode(signature.serialize_compact()))
    }

    /// Converts the digital signature to a normalized (low-S) signature
    ///
    /// Both the 64 byte compact form and DER are understood.
    pub fn to_signature(&self) -> Result<Signature, CryptoError> {
        let bytes = hex::decode(self.0.trim())
            .map_err(|e| CryptoError::DecodingError(e.to_string()))?;

        let mut signature = if bytes.len() == 64 {
            Signature::from_compact(&bytes)
        } else {
            Signature::from_der(&bytes)
        }
        .map_err(|e| CryptoError::InvalidSignature(e.to_string()))?;

        signature.normalize_s();
        Ok(signature)
    }
}

fn message_digest(message: &[u8]) -> Result<Message, CryptoError> {
    let digest = Sha256::digest(message);
    Message::from_digest_slice(digest.as_slice())
        .map_err(|e| CryptoError::InvalidSignature(e.to_string()))
}

/// Represents a wallet with a keypair
#[derive(Debug, Clone)]
pub struct Wallet {
    secret_key: SecretKey,
    public_key: PublicKey,
    address: Address,
}

impl Wallet {
    /// Creates a new wallet with a random keypair
    pub fn new() -> Result<Self, CryptoError> {
        let secret_key = SecretKey::new(&mut OsRng);
        Ok(Self::from_key(secret_key))
    }

    /// Creates a wallet from an existing secret key
    pub fn from_secret_key(secret_key_bytes: &[u8]) -> Result<Self, CryptoError> {
        let secret_key = SecretKey::from_slice(secret_key_bytes)
            .map_err(|e| CryptoError::InvalidPrivateKey(e.to_string()))?;

        Ok(Self::from_key(secret_key))
    }

    fn from_key(secret_key: SecretKey) -> Self {
        let secp = Secp256k1::signing_only();
        let public_key = PublicKey::from_secret_key(&secp, &secret_key);
        let address = Address::from_public_key(&public_key);

        Wallet {
            secret_key,
            public_key,
            address,
        }
    }

    /// Gets the wallet's address
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Gets the wallet's public key
    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    /// Gets the wallet's compressed public key as hex
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key.serialize())
    }

    /// Signs SHA-256(message) with the wallet's private key
    pub fn sign(&self, message: &[u8]) -> Result<DigitalSignature, CryptoError> {
        let secp = Secp256k1::signing_only();
        let digest = message_digest(message)?;
        let signature = secp.sign_ecdsa(&digest, &self.secret_key);
        Ok(DigitalSignature::from_signature(&signature))
    }

    /// Exports the wallet's secret key as bytes
    pub fn export_secret_key(&self) -> Vec<u8> {
        self.secret_key.secret_bytes().to_vec()
    }
}

/// Verifies a signature over SHA-256(message) against a public key
pub fn verify_signature(
    message: &[u8],
    signature: &DigitalSignature,
    public_key: &PublicKey,
) -> Result<bool, CryptoError> {
    let signature = signature.to_signature()?;
    let digest = message_digest(message)?;
    let secp = Secp256k1::verification_only();

    Ok(secp.verify_ecdsa(&digest, &signature, public_key).is_ok())
}
