//! Custodial exchange: per-user ether and token balances held on the
//! exchange's behalf, plus a fee-bearing order book.
//!
//! The exchange never moves token value on its own ledger. Token deposits pull
//! from the user's [`TokenLedger`] balance into the exchange's custody account
//! (the exchange's own [`Address`]) through the allowance the user granted;
//! withdrawals push back out of custody.

mod orders;

use std::{
    collections::{BTreeMap, BTreeSet},
    convert::Infallible,
};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    address::Address,
    error::LedgerError,
    ledger::{build_merkle, Amount, TokenLedger},
};

pub use orders::{fee_for, Order, OrderId, OrderStatus};

/// Asset identifier for ether inside the exchange.
pub const ETHER: Address = Address::ZERO;

/// Record produced by a successful exchange mutation.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum ExchangeEvent {
    Deposit {
        token: Address,
        user: Address,
        #[serde(with = "crate::units::decimal")]
        amount: Amount,
        #[serde(with = "crate::units::decimal")]
        balance: Amount,
    },
    Withdraw {
        token: Address,
        user: Address,
        #[serde(with = "crate::units::decimal")]
        amount: Amount,
        #[serde(with = "crate::units::decimal")]
        balance: Amount,
    },
    #[serde(rename_all = "camelCase")]
    Order {
        id: OrderId,
        user: Address,
        token_get: Address,
        #[serde(with = "crate::units::decimal")]
        amount_get: Amount,
        token_give: Address,
        #[serde(with = "crate::units::decimal")]
        amount_give: Amount,
        timestamp: u64,
    },
    #[serde(rename_all = "camelCase")]
    Cancel {
        id: OrderId,
        user: Address,
        token_get: Address,
        #[serde(with = "crate::units::decimal")]
        amount_get: Amount,
        token_give: Address,
        #[serde(with = "crate::units::decimal")]
        amount_give: Amount,
        timestamp: u64,
    },
    #[serde(rename_all = "camelCase")]
    Trade {
        id: OrderId,
        user: Address,
        token_get: Address,
        #[serde(with = "crate::units::decimal")]
        amount_get: Amount,
        token_give: Address,
        #[serde(with = "crate::units::decimal")]
        amount_give: Amount,
        user_fill: Address,
        timestamp: u64,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExchangeLedger {
    address: Address,
    fee_account: Address,
    fee_percent: u32,
    #[serde(with = "crate::units::nested_decimal_map")]
    tokens: BTreeMap<Address, BTreeMap<Address, Amount>>,
    #[serde(with = "crate::units::decimal")]
    ether_custody: Amount,
    orders: BTreeMap<OrderId, Order>,
    order_count: OrderId,
    cancelled: BTreeSet<OrderId>,
    filled: BTreeSet<OrderId>,
}

/// Staged custodial balance changes, applied together or not at all.
#[derive(Default)]
struct Writes(BTreeMap<(Address, Address), Amount>);

impl Writes {
    fn balance(&self, ledger: &ExchangeLedger, asset: Address, user: Address) -> Amount {
        self.0
            .get(&(asset, user))
            .copied()
            .unwrap_or_else(|| ledger.balance_of(&asset, &user))
    }

    fn credit(
        &mut self,
        ledger: &ExchangeLedger,
        asset: Address,
        user: Address,
        amount: Amount,
    ) -> Result<Amount, LedgerError> {
        let next = self
            .balance(ledger, asset, user)
            .checked_add(amount)
            .ok_or(LedgerError::BalanceOverflow)?;
        self.0.insert((asset, user), next);
        Ok(next)
    }

    fn debit(
        &mut self,
        ledger: &ExchangeLedger,
        asset: Address,
        user: Address,
        amount: Amount,
    ) -> Result<Amount, LedgerError> {
        let available = self.balance(ledger, asset, user);
        let next = available
            .checked_sub(amount)
            .ok_or(LedgerError::InsufficientBalance {
                account: user,
                needed: amount,
                available,
            })?;
        self.0.insert((asset, user), next);
        Ok(next)
    }
}

impl ExchangeLedger {
    /// `fee_percent` is recorded as given; no range is enforced.
    pub fn new(address: Address, fee_account: Address, fee_percent: u32) -> Self {
        Self {
            address,
            fee_account,
            fee_percent,
            tokens: BTreeMap::new(),
            ether_custody: 0,
            orders: BTreeMap::new(),
            order_count: 0,
            cancelled: BTreeSet::new(),
            filled: BTreeSet::new(),
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn fee_account(&self) -> Address {
        self.fee_account
    }

    pub fn fee_percent(&self) -> u32 {
        self.fee_percent
    }

    /// Custodial balance of `asset` held for `user`.
    pub fn balance_of(&self, asset: &Address, user: &Address) -> Amount {
        self.tokens
            .get(asset)
            .and_then(|holders| holders.get(user))
            .copied()
            .unwrap_or(0)
    }

    /// Sum of all custodial balances of `asset`.
    pub fn total_held(&self, asset: &Address) -> Amount {
        self.tokens
            .get(asset)
            .map(|holders| holders.values().sum())
            .unwrap_or(0)
    }

    /// Ether received through `deposit_ether` and not yet withdrawn.
    pub fn ether_custody(&self) -> Amount {
        self.ether_custody
    }

    pub fn deposit_ether(
        &mut self,
        user: Address,
        amount: Amount,
    ) -> Result<ExchangeEvent, LedgerError> {
        let custody = self
            .ether_custody
            .checked_add(amount)
            .ok_or(LedgerError::BalanceOverflow)?;
        let mut writes = Writes::default();
        let balance = writes.credit(self, ETHER, user, amount)?;
        self.apply(writes);
        self.ether_custody = custody;
        Ok(ExchangeEvent::Deposit {
            token: ETHER,
            user,
            amount,
            balance,
        })
    }

    /// Pulls `amount` of `token` from `user` into custody. The user must have
    /// approved the exchange's address for at least `amount` beforehand.
    pub fn deposit_token(
        &mut self,
        token: &mut TokenLedger,
        user: Address,
        amount: Amount,
    ) -> Result<ExchangeEvent, LedgerError> {
        let asset = token.address();
        if asset == ETHER {
            return Err(LedgerError::UnsupportedAsset { asset });
        }
        if user == self.address {
            return Err(LedgerError::ContractCaller(user));
        }
        let mut writes = Writes::default();
        let balance = writes.credit(self, asset, user, amount)?;
        token.transfer_from(self.address, user, self.address, amount)?;
        self.apply(writes);
        Ok(ExchangeEvent::Deposit {
            token: asset,
            user,
            amount,
            balance,
        })
    }

    pub fn withdraw_ether(
        &mut self,
        user: Address,
        amount: Amount,
    ) -> Result<ExchangeEvent, LedgerError> {
        let mut writes = Writes::default();
        let balance = writes.debit(self, ETHER, user, amount)?;
        self.apply(writes);
        // ether_custody >= Σ ether balances >= amount
        self.ether_custody -= amount;
        Ok(ExchangeEvent::Withdraw {
            token: ETHER,
            user,
            amount,
            balance,
        })
    }

    /// Pushes `amount` of `token` out of custody back to `user`.
    pub fn withdraw_token(
        &mut self,
        token: &mut TokenLedger,
        user: Address,
        amount: Amount,
    ) -> Result<ExchangeEvent, LedgerError> {
        let asset = token.address();
        if asset == ETHER {
            return Err(LedgerError::UnsupportedAsset { asset });
        }
        if user == self.address {
            return Err(LedgerError::ContractCaller(user));
        }
        let mut writes = Writes::default();
        let balance = writes.debit(self, asset, user, amount)?;
        token.transfer(self.address, user, amount)?;
        self.apply(writes);
        Ok(ExchangeEvent::Withdraw {
            token: asset,
            user,
            amount,
            balance,
        })
    }

    /// Fallback for value sent straight to the exchange. Always rejected:
    /// ether is accepted only through [`ExchangeLedger::deposit_ether`].
    pub fn receive(&self, from: Address, value: Amount) -> Result<Infallible, LedgerError> {
        Err(LedgerError::DirectTransferRejected { from, value })
    }

    pub fn make_order(
        &mut self,
        user: Address,
        token_get: Address,
        amount_get: Amount,
        token_give: Address,
        amount_give: Amount,
        timestamp: u64,
    ) -> Result<ExchangeEvent, LedgerError> {
        let id = self
            .order_count
            .checked_add(1)
            .ok_or(LedgerError::BalanceOverflow)?;
        let order = Order {
            id,
            user,
            token_get,
            amount_get,
            token_give,
            amount_give,
            timestamp,
        };
        let event = order.placed();
        self.orders.insert(id, order);
        self.order_count = id;
        Ok(event)
    }

    pub fn cancel_order(
        &mut self,
        caller: Address,
        id: OrderId,
        timestamp: u64,
    ) -> Result<ExchangeEvent, LedgerError> {
        let order = self.open_order(id)?;
        if order.user != caller {
            return Err(LedgerError::NotOrderOwner { id, caller });
        }
        let event = order.cancelled(timestamp);
        self.cancelled.insert(id);
        Ok(event)
    }

    /// Settles order `id` against `filler`.
    ///
    /// The filler pays `amount_get` plus the fee in `token_get`; the fee goes
    /// to the fee account. The maker's `amount_give` of `token_give` goes to
    /// the filler.
    pub fn fill_order(
        &mut self,
        filler: Address,
        id: OrderId,
        timestamp: u64,
    ) -> Result<ExchangeEvent, LedgerError> {
        let order = self.open_order(id)?.clone();
        let fee = fee_for(order.amount_get, self.fee_percent)?;
        let cost = order
            .amount_get
            .checked_add(fee)
            .ok_or(LedgerError::BalanceOverflow)?;

        let mut writes = Writes::default();
        writes.debit(self, order.token_get, filler, cost)?;
        writes.credit(self, order.token_get, order.user, order.amount_get)?;
        writes.credit(self, order.token_get, self.fee_account, fee)?;
        writes.debit(self, order.token_give, order.user, order.amount_give)?;
        writes.credit(self, order.token_give, filler, order.amount_give)?;
        self.apply(writes);
        self.filled.insert(id);

        tracing::debug!(id, %filler, fee = %fee, "order filled");
        Ok(order.traded(filler, timestamp))
    }

    pub fn order(&self, id: OrderId) -> Option<&Order> {
        self.orders.get(&id)
    }

    pub fn order_status(&self, id: OrderId) -> Option<OrderStatus> {
        if !self.orders.contains_key(&id) {
            None
        } else if self.filled.contains(&id) {
            Some(OrderStatus::Filled)
        } else if self.cancelled.contains(&id) {
            Some(OrderStatus::Cancelled)
        } else {
            Some(OrderStatus::Open)
        }
    }

    pub fn open_orders(&self) -> impl Iterator<Item = &Order> + '_ {
        self.orders
            .values()
            .filter(|order| !self.filled.contains(&order.id) && !self.cancelled.contains(&order.id))
    }

    pub fn order_count(&self) -> OrderId {
        self.order_count
    }

    /// Merkle root over custodial balances and order statuses.
    pub fn state_root(&self) -> [u8; 32] {
        let mut leaves: Vec<[u8; 32]> = Vec::new();
        for (asset, holders) in &self.tokens {
            for (user, amount) in holders {
                let mut hasher = Sha256::new();
                hasher.update(b"held");
                hasher.update(asset.as_bytes());
                hasher.update(user.as_bytes());
                hasher.update(amount.to_le_bytes());
                leaves.push(hasher.finalize().into());
            }
        }
        for order in self.orders.values() {
            let status = match self.order_status(order.id) {
                Some(OrderStatus::Filled) => 1u8,
                Some(OrderStatus::Cancelled) => 2u8,
                _ => 0u8,
            };
            let mut hasher = Sha256::new();
            hasher.update(b"order");
            hasher.update(order.id.to_le_bytes());
            hasher.update(order.user.as_bytes());
            hasher.update(order.token_get.as_bytes());
            hasher.update(order.amount_get.to_le_bytes());
            hasher.update(order.token_give.as_bytes());
            hasher.update(order.amount_give.to_le_bytes());
            hasher.update([status]);
            leaves.push(hasher.finalize().into());
        }
        build_merkle(leaves)
    }

    fn open_order(&self, id: OrderId) -> Result<&Order, LedgerError> {
        let order = self.orders.get(&id).ok_or(LedgerError::UnknownOrder(id))?;
        if self.filled.contains(&id) || self.cancelled.contains(&id) {
            return Err(LedgerError::OrderClosed(id));
        }
        Ok(order)
    }

    fn apply(&mut self, writes: Writes) {
        for ((asset, user), amount) in writes.0 {
            if amount == 0 {
                if let Some(holders) = self.tokens.get_mut(&asset) {
                    holders.remove(&user);
                    if holders.is_empty() {
                        self.tokens.remove(&asset);
                    }
                }
            } else {
                self.tokens.entry(asset).or_default().insert(user, amount);
            }
        }
    }
}
