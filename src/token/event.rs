use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use utoipa::ToSchema;
use uuid::Uuid;

use super::amount::TokenAmount;
use super::crypto::Address;

/// Audit record of a balance movement, emitted once per successful transfer
///
/// The genesis credit is recorded as a transfer from the null address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct TransferEvent {
    /// Position in the ledger's event log, starting at 0 for genesis
    pub sequence: u64,

    /// Unique identifier for the event
    pub id: String,

    /// Whose balance was debited
    pub from: Address,

    /// Whose balance was credited
    pub to: Address,

    /// Amount moved, as a decimal string
    #[schema(value_type = String, example = "50")]
    pub amount: TokenAmount,

    /// When the transfer was applied
    #[schema(value_type = String, example = "2023-01-01T12:00:00Z")]
    pub timestamp: DateTime<Utc>,

    /// SHA-256 over the event fields, hex encoded
    pub hash: String,
}

/// Fields covered by the event hash
#[derive(Serialize)]
struct HashedFields<'a> {
    sequence: u64,
    id: &'a str,
    from: &'a str,
    to: &'a str,
    amount: u128,
    timestamp: i64,
}

impl TransferEvent {
    pub fn new(sequence: u64, from: Address, to: Address, amount: TokenAmount) -> Self {
        let event = TransferEvent {
            sequence,
            id: Uuid::new_v4().to_string(),
            from,
            to,
            amount,
            timestamp: Utc::now(),
            hash: String::new(),
        };

        let hash = event.calculate_hash();

        TransferEvent { hash, ..event }
    }

    /// Genesis credit of the whole supply to the creator
    pub fn genesis(creator: Address, supply: TokenAmount) -> Self {
        TransferEvent::new(0, Address::zero(), creator, supply)
    }

    pub fn is_genesis(&self) -> bool {
        self.sequence == 0 && self.from.is_zero()
    }

    /// Whether `account` sent or received in this event
    pub fn involves(&self, account: &Address) -> bool {
        self.from == *account || self.to == *account
    }

    /// Calculates the SHA-256 hash of the event
    pub fn calculate_hash(&self) -> String {
        let fields = HashedFields {
            sequence: self.sequence,
            id: &self.id,
            from: &self.from.0,
            to: &self.to.0,
            amount: self.amount.units(),
            timestamp: self.timestamp.timestamp_nanos_opt().unwrap_or_default(),
        };

        let mut hasher = Sha256::new();
        // bincode over plain integers and strings cannot fail
        if let Ok(bytes) = bincode::serialize(&fields) {
            hasher.update(bytes);
        }
        hex::encode(hasher.finalize())
    }

    /// Checks that the stored hash still matches the event fields
    pub fn verify_hash(&self) -> bool {
        self.hash == self.calculate_hash()
    }
}
