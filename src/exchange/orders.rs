use serde::{Deserialize, Serialize};

use crate::{address::Address, error::LedgerError, ledger::Amount};

use super::ExchangeEvent;

pub type OrderId = u64;

/// A standing offer: `user` gives `amount_give` of `token_give` in exchange
/// for `amount_get` of `token_get`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: OrderId,
    pub user: Address,
    pub token_get: Address,
    #[serde(with = "crate::units::decimal")]
    pub amount_get: Amount,
    pub token_give: Address,
    #[serde(with = "crate::units::decimal")]
    pub amount_give: Amount,
    pub timestamp: u64,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Open,
    Filled,
    Cancelled,
}

impl Order {
    pub(crate) fn placed(&self) -> ExchangeEvent {
        ExchangeEvent::Order {
            id: self.id,
            user: self.user,
            token_get: self.token_get,
            amount_get: self.amount_get,
            token_give: self.token_give,
            amount_give: self.amount_give,
            timestamp: self.timestamp,
        }
    }

    pub(crate) fn cancelled(&self, timestamp: u64) -> ExchangeEvent {
        ExchangeEvent::Cancel {
            id: self.id,
            user: self.user,
            token_get: self.token_get,
            amount_get: self.amount_get,
            token_give: self.token_give,
            amount_give: self.amount_give,
            timestamp,
        }
    }

    pub(crate) fn traded(&self, user_fill: Address, timestamp: u64) -> ExchangeEvent {
        ExchangeEvent::Trade {
            id: self.id,
            user: self.user,
            token_get: self.token_get,
            amount_get: self.amount_get,
            token_give: self.token_give,
            amount_give: self.amount_give,
            user_fill,
            timestamp,
        }
    }
}

/// `amount · percent / 100`, rounded down.
pub fn fee_for(amount: Amount, percent: u32) -> Result<Amount, LedgerError> {
    amount
        .checked_mul(Amount::from(percent))
        .map(|scaled| scaled / 100)
        .ok_or(LedgerError::BalanceOverflow)
}
