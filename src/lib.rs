//! Token ledger and custodial exchange.
//!
//! * [`ledger`]: a single fungible token with balances, allowances and delegated
//!   transfer.
//! * [`exchange`]: custodial ether/token balances, deposits, withdrawals and
//!   a fee-bearing order book, built on top of [`ledger::TokenLedger`].
//! * [`chain`]: the coordinating service that owns ledger instances,
//!   serializes calls and keeps the receipt log.
//! * [`store`] / [`config`]: JSON persistence and deployment parameters for
//!   the `nirx` binary.
//!
//! Every mutating operation returns a record (the analogue of an emitted
//! event) or a [`LedgerError`], and never leaves partial state behind.

pub mod address;
pub mod chain;
pub mod config;
pub mod exchange;
pub mod ledger;
pub mod store;
pub mod units;

mod error;

pub use address::Address;
pub use error::LedgerError;
pub use ledger::Amount;
