use thiserror::Error;

use crate::{address::Address, exchange::OrderId, ledger::Amount};

/// Every way a ledger operation can be rejected.
///
/// All variants are raised before any state is written, so a failed call
/// leaves both ledgers exactly as they were.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("insufficient balance for {account}: need {needed}, have {available}")]
    InsufficientBalance {
        account: Address,
        needed: Amount,
        available: Amount,
    },

    #[error("insufficient allowance for {spender} on {owner}: need {needed}, have {available}")]
    InsufficientAllowance {
        owner: Address,
        spender: Address,
        needed: Amount,
        available: Amount,
    },

    #[error("invalid recipient")]
    InvalidRecipient,

    #[error("invalid spender")]
    InvalidSpender,

    #[error("unsupported asset {asset} for this operation")]
    UnsupportedAsset { asset: Address },

    #[error("direct transfer of {value} from {from} rejected; use depositEther")]
    DirectTransferRejected { from: Address, value: Amount },

    #[error("balance overflow")]
    BalanceOverflow,

    #[error("contract account {0} cannot act as a caller")]
    ContractCaller(Address),

    #[error("unknown contract {0}")]
    UnknownContract(Address),

    #[error("unknown order {0}")]
    UnknownOrder(OrderId),

    #[error("order {0} is already filled or cancelled")]
    OrderClosed(OrderId),

    #[error("order {id} does not belong to {caller}")]
    NotOrderOwner { id: OrderId, caller: Address },
}
