use dashmap::DashMap;
use log::debug;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

use super::amount::TokenAmount;
use super::crypto::{verify_signature, Address, CryptoError, DigitalSignature, Wallet};

/// Errors that can occur while resolving who is calling
#[derive(Debug, Error)]
pub enum CallerError {
    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Invalid nonce: expected {expected}, got {got}")]
    InvalidNonce { expected: u64, got: u64 },

    #[error("Crypto error: {0}")]
    CryptoError(#[from] CryptoError),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

/// The authenticated account on whose behalf an operation runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller(Address);

impl Caller {
    pub fn address(&self) -> &Address {
        &self.0
    }
}

/// A transfer as submitted by a client, signed by the sender's key
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TransferRequest {
    /// The sender's address; must match the signing key
    pub from: Address,

    /// The recipient's address
    pub to: Address,

    /// The amount to transfer, in the smallest unit
    #[schema(value_type = String, example = "50")]
    pub amount: TokenAmount,

    /// The sender's next nonce
    pub nonce: u64,

    /// Signature over the other fields
    pub signature: Option<DigitalSignature>,
}

impl TransferRequest {
    /// Creates an unsigned request
    pub fn new(from: Address, to: Address, amount: TokenAmount, nonce: u64) -> Self {
        TransferRequest {
            from,
            to,
            amount,
            nonce,
            signature: None,
        }
    }

    /// Signs the request with the sender's wallet
    pub fn sign(mut self, wallet: &Wallet) -> Result<Self, CallerError> {
        let message = self.signing_bytes()?;
        self.signature = Some(wallet.sign(&message));
        Ok(self)
    }

    /// Canonical bytes covered by the signature
    pub fn signing_bytes(&self) -> Result<Vec<u8>, CallerError> {
        let data = serde_json::json!({
            "from": self.from.0,
            "to": self.to.0,
            "amount": self.amount,
            "nonce": self.nonce,
        });

        serde_json::to_vec(&data).map_err(|e| CallerError::SerializationError(e.to_string()))
    }
}

/// Resolves the identity of the account issuing a transfer
pub trait CallerResolver {
    fn resolve(&self, request: &TransferRequest) -> Result<Caller, CallerError>;
}

/// Authenticates callers by ed25519 signature and a per-account nonce
///
/// A nonce is consumed as soon as the caller is resolved, whether or not the
/// ledger then accepts the transfer, so a signed request can never be replayed.
#[derive(Debug, Default)]
pub struct SignatureResolver {
    nonces: DashMap<Address, u64>,
}

impl SignatureResolver {
    pub fn new() -> Self {
        SignatureResolver::default()
    }

    /// The nonce the next request from `account` must carry
    pub fn next_nonce(&self, account: &Address) -> u64 {
        self.nonces.get(account).map(|n| *n).unwrap_or(0)
    }
}

impl CallerResolver for SignatureResolver {
    fn resolve(&self, request: &TransferRequest) -> Result<Caller, CallerError> {
        let signature = request.signature.as_ref().ok_or(CallerError::InvalidSignature)?;
        let public_key = request.from.to_public_key()?;
        let message = request.signing_bytes()?;

        if !verify_signature(&message, signature, &public_key)? {
            return Err(CallerError::InvalidSignature);
        }

        // The entry guard keeps check-and-increment atomic per account
        let mut nonce = self.nonces.entry(request.from.clone()).or_insert(0);
        if *nonce != request.nonce {
            return Err(CallerError::InvalidNonce {
                expected: *nonce,
                got: request.nonce,
            });
        }
        *nonce += 1;

        debug!("Resolved caller {} at nonce {}", request.from, request.nonce);

        Ok(Caller(request.from.clone()))
    }
}
