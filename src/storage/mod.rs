//! Durable token accounting.

pub mod ledger;

pub use ledger::{LedgerSummary, TokenLedger, TokenStats};
