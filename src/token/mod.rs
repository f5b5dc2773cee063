// Token module
//
// This module contains the fungible token implementation including:
// - Token amounts
// - Addresses, wallets and signatures
// - Transfer events
// - The ledger itself
// - Caller resolution for signed requests

pub mod amount;
pub mod caller;
pub mod crypto;
pub mod event;
pub mod ledger;

// Re-export main components for easier access
pub use amount::TokenAmount;
pub use caller::{CallerError, CallerResolver, SignatureResolver, TransferRequest};
pub use crypto::{Address, DigitalSignature, Wallet};
pub use event::TransferEvent;
pub use ledger::{Ledger, LedgerError};
