//! Coordinating service that owns every ledger instance.
//!
//! All mutations go through [`Chain::submit`] while holding the write lock,
//! so an exchange call and the token call it makes commit as one unit.
//! Readers share the read lock and only ever see committed state.

use std::collections::BTreeMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    address::Address,
    error::LedgerError,
    exchange::{ExchangeEvent, ExchangeLedger, OrderId, ETHER},
    ledger::{build_merkle, hex_root, Amount, TokenEvent, TokenLedger},
};

/// One mutating operation, as submitted by an external caller.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Call {
    Transfer {
        token: Address,
        from: Address,
        to: Address,
        #[serde(with = "crate::units::decimal")]
        amount: Amount,
    },
    Approve {
        token: Address,
        owner: Address,
        spender: Address,
        #[serde(with = "crate::units::decimal")]
        amount: Amount,
    },
    TransferFrom {
        token: Address,
        spender: Address,
        owner: Address,
        to: Address,
        #[serde(with = "crate::units::decimal")]
        amount: Amount,
    },
    DepositEther {
        exchange: Address,
        user: Address,
        #[serde(with = "crate::units::decimal")]
        amount: Amount,
    },
    DepositToken {
        exchange: Address,
        token: Address,
        user: Address,
        #[serde(with = "crate::units::decimal")]
        amount: Amount,
    },
    WithdrawEther {
        exchange: Address,
        user: Address,
        #[serde(with = "crate::units::decimal")]
        amount: Amount,
    },
    WithdrawToken {
        exchange: Address,
        token: Address,
        user: Address,
        #[serde(with = "crate::units::decimal")]
        amount: Amount,
    },
    /// Plain value transfer to a contract address, outside any deposit.
    SendEther {
        to: Address,
        from: Address,
        #[serde(with = "crate::units::decimal")]
        value: Amount,
    },
    MakeOrder {
        exchange: Address,
        user: Address,
        token_get: Address,
        #[serde(with = "crate::units::decimal")]
        amount_get: Amount,
        token_give: Address,
        #[serde(with = "crate::units::decimal")]
        amount_give: Amount,
    },
    CancelOrder {
        exchange: Address,
        user: Address,
        id: OrderId,
    },
    FillOrder {
        exchange: Address,
        user: Address,
        id: OrderId,
    },
}

impl Call {
    pub fn name(&self) -> &'static str {
        match self {
            Call::Transfer { .. } => "transfer",
            Call::Approve { .. } => "approve",
            Call::TransferFrom { .. } => "transfer_from",
            Call::DepositEther { .. } => "deposit_ether",
            Call::DepositToken { .. } => "deposit_token",
            Call::WithdrawEther { .. } => "withdraw_ether",
            Call::WithdrawToken { .. } => "withdraw_token",
            Call::SendEther { .. } => "send_ether",
            Call::MakeOrder { .. } => "make_order",
            Call::CancelOrder { .. } => "cancel_order",
            Call::FillOrder { .. } => "fill_order",
        }
    }

    /// The account the call is made on behalf of.
    pub fn caller(&self) -> Address {
        match self {
            Call::Transfer { from, .. } => *from,
            Call::Approve { owner, .. } => *owner,
            Call::TransferFrom { spender, .. } => *spender,
            Call::SendEther { from, .. } => *from,
            Call::DepositEther { user, .. }
            | Call::DepositToken { user, .. }
            | Call::WithdrawEther { user, .. }
            | Call::WithdrawToken { user, .. }
            | Call::MakeOrder { user, .. }
            | Call::CancelOrder { user, .. }
            | Call::FillOrder { user, .. } => *user,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum Record {
    Token(TokenEvent),
    Exchange(ExchangeEvent),
}

impl From<TokenEvent> for Record {
    fn from(event: TokenEvent) -> Self {
        Record::Token(event)
    }
}

impl From<ExchangeEvent> for Record {
    fn from(event: ExchangeEvent) -> Self {
        Record::Exchange(event)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Receipt {
    pub height: u64,
    pub timestamp: u64,
    pub call: Call,
    pub record: Record,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ChainState {
    pub height: u64,
    pub timestamp: u64,
    /// Contracts deployed so far, per deployer.
    pub nonces: BTreeMap<Address, u64>,
    pub tokens: BTreeMap<Address, TokenLedger>,
    pub exchanges: BTreeMap<Address, ExchangeLedger>,
    pub receipts: Vec<Receipt>,
}

impl ChainState {
    fn next_contract_address(&mut self, deployer: Address) -> Address {
        let nonce = self.nonces.entry(deployer).or_insert(0);
        let address = Address::contract(&deployer, *nonce);
        *nonce += 1;
        address
    }

    fn token_mut(&mut self, address: &Address) -> Result<&mut TokenLedger, LedgerError> {
        self.tokens
            .get_mut(address)
            .ok_or(LedgerError::UnknownContract(*address))
    }

    fn is_contract(&self, address: &Address) -> bool {
        self.tokens.contains_key(address) || self.exchanges.contains_key(address)
    }

    fn execute(&mut self, call: &Call, timestamp: u64) -> Result<Record, LedgerError> {
        // contract accounts only move funds through their own code paths
        let caller = call.caller();
        if self.is_contract(&caller) {
            return Err(LedgerError::ContractCaller(caller));
        }
        let record = match *call {
            Call::Transfer {
                token,
                from,
                to,
                amount,
            } => self.token_mut(&token)?.transfer(from, to, amount)?.into(),
            Call::Approve {
                token,
                owner,
                spender,
                amount,
            } => self.token_mut(&token)?.approve(owner, spender, amount)?.into(),
            Call::TransferFrom {
                token,
                spender,
                owner,
                to,
                amount,
            } => self
                .token_mut(&token)?
                .transfer_from(spender, owner, to, amount)?
                .into(),
            Call::DepositEther {
                exchange,
                user,
                amount,
            } => exchange_mut(&mut self.exchanges, &exchange)?
                .deposit_ether(user, amount)?
                .into(),
            Call::DepositToken {
                exchange,
                token,
                user,
                amount,
            } => {
                if token == ETHER {
                    return Err(LedgerError::UnsupportedAsset { asset: token });
                }
                let exchange = exchange_mut(&mut self.exchanges, &exchange)?;
                let token = self
                    .tokens
                    .get_mut(&token)
                    .ok_or(LedgerError::UnknownContract(token))?;
                exchange.deposit_token(token, user, amount)?.into()
            }
            Call::WithdrawEther {
                exchange,
                user,
                amount,
            } => exchange_mut(&mut self.exchanges, &exchange)?
                .withdraw_ether(user, amount)?
                .into(),
            Call::WithdrawToken {
                exchange,
                token,
                user,
                amount,
            } => {
                if token == ETHER {
                    return Err(LedgerError::UnsupportedAsset { asset: token });
                }
                let exchange = exchange_mut(&mut self.exchanges, &exchange)?;
                let token = self
                    .tokens
                    .get_mut(&token)
                    .ok_or(LedgerError::UnknownContract(token))?;
                exchange.withdraw_token(token, user, amount)?.into()
            }
            Call::SendEther { to, from, value } => {
                let exchange = self
                    .exchanges
                    .get(&to)
                    .ok_or(LedgerError::UnknownContract(to))?;
                match exchange.receive(from, value)? {}
            }
            Call::MakeOrder {
                exchange,
                user,
                token_get,
                amount_get,
                token_give,
                amount_give,
            } => exchange_mut(&mut self.exchanges, &exchange)?
                .make_order(user, token_get, amount_get, token_give, amount_give, timestamp)?
                .into(),
            Call::CancelOrder { exchange, user, id } => {
                exchange_mut(&mut self.exchanges, &exchange)?
                    .cancel_order(user, id, timestamp)?
                    .into()
            }
            Call::FillOrder { exchange, user, id } => {
                exchange_mut(&mut self.exchanges, &exchange)?
                    .fill_order(user, id, timestamp)?
                    .into()
            }
        };
        Ok(record)
    }
}

fn exchange_mut<'a>(
    exchanges: &'a mut BTreeMap<Address, ExchangeLedger>,
    address: &Address,
) -> Result<&'a mut ExchangeLedger, LedgerError> {
    exchanges
        .get_mut(address)
        .ok_or(LedgerError::UnknownContract(*address))
}

/// Summary of the whole chain, suitable for printing.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChainSummary {
    pub height: u64,
    pub timestamp: u64,
    pub tokens: Vec<Address>,
    pub exchanges: Vec<Address>,
    #[serde(with = "hex_root")]
    pub state_root: [u8; 32],
}

#[derive(Default)]
pub struct Chain {
    state: RwLock<ChainState>,
}

impl Chain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_state(state: ChainState) -> Self {
        Self {
            state: RwLock::new(state),
        }
    }

    /// Clone of the committed state, for persistence.
    pub fn state(&self) -> ChainState {
        self.state.read().clone()
    }

    pub fn deploy_token(
        &self,
        deployer: Address,
        name: &str,
        symbol: &str,
        decimals: u8,
        total_supply: Amount,
    ) -> Address {
        let mut state = self.state.write();
        let address = state.next_contract_address(deployer);
        let token = TokenLedger::new(address, name, symbol, decimals, total_supply, deployer);
        state.tokens.insert(address, token);
        tracing::info!(%address, %deployer, symbol, "token deployed");
        address
    }

    pub fn deploy_exchange(
        &self,
        deployer: Address,
        fee_account: Address,
        fee_percent: u32,
    ) -> Address {
        let mut state = self.state.write();
        let address = state.next_contract_address(deployer);
        state
            .exchanges
            .insert(address, ExchangeLedger::new(address, fee_account, fee_percent));
        if fee_percent > 100 {
            tracing::warn!(%address, fee_percent, "exchange fee exceeds 100%");
        }
        tracing::info!(%address, %fee_account, fee_percent, "exchange deployed");
        address
    }

    /// Applies `call` atomically and returns its receipt.
    pub fn submit(&self, call: Call, timestamp: u64) -> Result<Receipt, LedgerError> {
        let mut state = self.state.write();
        match state.execute(&call, timestamp) {
            Ok(record) => {
                state.height += 1;
                state.timestamp = timestamp;
                let receipt = Receipt {
                    height: state.height,
                    timestamp,
                    call,
                    record,
                };
                tracing::info!(
                    height = receipt.height,
                    op = receipt.call.name(),
                    caller = %receipt.call.caller(),
                    "call applied"
                );
                state.receipts.push(receipt.clone());
                Ok(receipt)
            }
            Err(err) => {
                tracing::warn!(
                    op = call.name(),
                    caller = %call.caller(),
                    error = %err,
                    "call rejected"
                );
                Err(err)
            }
        }
    }

    pub fn token<R>(
        &self,
        address: &Address,
        f: impl FnOnce(&TokenLedger) -> R,
    ) -> Result<R, LedgerError> {
        let state = self.state.read();
        let token = state
            .tokens
            .get(address)
            .ok_or(LedgerError::UnknownContract(*address))?;
        Ok(f(token))
    }

    pub fn exchange<R>(
        &self,
        address: &Address,
        f: impl FnOnce(&ExchangeLedger) -> R,
    ) -> Result<R, LedgerError> {
        let state = self.state.read();
        let exchange = state
            .exchanges
            .get(address)
            .ok_or(LedgerError::UnknownContract(*address))?;
        Ok(f(exchange))
    }

    pub fn receipts(&self) -> Vec<Receipt> {
        self.state.read().receipts.clone()
    }

    pub fn summary(&self) -> ChainSummary {
        let state = self.state.read();
        let mut leaves: Vec<[u8; 32]> = Vec::new();
        for (address, token) in &state.tokens {
            leaves.push(contract_leaf(address, token.state_root()));
        }
        for (address, exchange) in &state.exchanges {
            leaves.push(contract_leaf(address, exchange.state_root()));
        }
        ChainSummary {
            height: state.height,
            timestamp: state.timestamp,
            tokens: state.tokens.keys().copied().collect(),
            exchanges: state.exchanges.keys().copied().collect(),
            state_root: build_merkle(leaves),
        }
    }
}

fn contract_leaf(address: &Address, root: [u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"contract");
    hasher.update(address.as_bytes());
    hasher.update(root);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::units::{ether, tokens};
    use std::sync::Arc;

    struct Deployment {
        chain: Chain,
        deployer: Address,
        fee_account: Address,
        user1: Address,
        token: Address,
        exchange: Address,
    }

    fn deploy() -> Deployment {
        let chain = Chain::new();
        let deployer = Address::derive("deployer");
        let fee_account = Address::derive("feeAccount");
        let user1 = Address::derive("user1");
        let token = chain.deploy_token(deployer, "Nir Coin", "NIR", 18, tokens(1_000_000));
        let exchange = chain.deploy_exchange(deployer, fee_account, 10);
        chain
            .submit(
                Call::Transfer {
                    token,
                    from: deployer,
                    to: user1,
                    amount: tokens(100),
                },
                1,
            )
            .unwrap();
        Deployment {
            chain,
            deployer,
            fee_account,
            user1,
            token,
            exchange,
        }
    }

    #[test]
    fn deployments_get_distinct_addresses() {
        let d = deploy();
        assert_ne!(d.token, d.exchange);
        assert_eq!(d.token, Address::contract(&d.deployer, 0));
        assert_eq!(d.exchange, Address::contract(&d.deployer, 1));
        let fee = d.chain.exchange(&d.exchange, |x| (x.fee_account(), x.fee_percent())).unwrap();
        assert_eq!(fee, (d.fee_account, 10));
    }

    #[test]
    fn transfer_receipt_carries_record() {
        let d = deploy();
        let receipts = d.chain.receipts();
        assert_eq!(receipts.len(), 1);
        assert_eq!(receipts[0].height, 1);
        assert_eq!(
            receipts[0].record,
            Record::Token(TokenEvent::Transfer {
                from: d.deployer,
                to: d.user1,
                value: tokens(100),
            })
        );
        let balances = d
            .chain
            .token(&d.token, |t| (t.balance_of(&d.deployer), t.balance_of(&d.user1)))
            .unwrap();
        assert_eq!(balances, (tokens(999_900), tokens(100)));
    }

    #[test]
    fn token_deposit_through_chain_is_atomic() {
        let d = deploy();
        let before = d.chain.state();
        let err = d
            .chain
            .submit(
                Call::DepositToken {
                    exchange: d.exchange,
                    token: d.token,
                    user: d.user1,
                    amount: tokens(10),
                },
                2,
            )
            .unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientAllowance { .. }));
        assert_eq!(d.chain.state(), before);

        d.chain
            .submit(
                Call::Approve {
                    token: d.token,
                    owner: d.user1,
                    spender: d.exchange,
                    amount: tokens(10),
                },
                3,
            )
            .unwrap();
        let receipt = d
            .chain
            .submit(
                Call::DepositToken {
                    exchange: d.exchange,
                    token: d.token,
                    user: d.user1,
                    amount: tokens(10),
                },
                4,
            )
            .unwrap();
        assert_eq!(receipt.height, 3);
        let held = d.chain.token(&d.token, |t| t.balance_of(&d.exchange)).unwrap();
        assert_eq!(held, tokens(10));
        let custodial = d
            .chain
            .exchange(&d.exchange, |x| x.balance_of(&d.token, &d.user1))
            .unwrap();
        assert_eq!(custodial, tokens(10));
    }

    #[test]
    fn ether_sentinel_and_unknown_contracts_are_rejected() {
        let d = deploy();
        let err = d
            .chain
            .submit(
                Call::DepositToken {
                    exchange: d.exchange,
                    token: ETHER,
                    user: d.user1,
                    amount: tokens(10),
                },
                2,
            )
            .unwrap_err();
        assert_eq!(err, LedgerError::UnsupportedAsset { asset: ETHER });

        let stranger = Address::derive("nobody");
        let err = d
            .chain
            .submit(
                Call::DepositEther {
                    exchange: stranger,
                    user: d.user1,
                    amount: 1,
                },
                2,
            )
            .unwrap_err();
        assert_eq!(err, LedgerError::UnknownContract(stranger));
        assert_eq!(d.chain.receipts().len(), 1);
    }

    #[test]
    fn direct_ether_to_exchange_is_rejected() {
        let d = deploy();
        let before = d.chain.state();
        let err = d
            .chain
            .submit(
                Call::SendEther {
                    to: d.exchange,
                    from: d.user1,
                    value: 1,
                },
                2,
            )
            .unwrap_err();
        assert_eq!(
            err,
            LedgerError::DirectTransferRejected {
                from: d.user1,
                value: 1
            }
        );
        assert_eq!(d.chain.state(), before);
    }

    #[test]
    fn contract_accounts_cannot_be_callers() {
        let d = deploy();
        let thief = Address::derive("thief");
        let calls = [
            Call::Approve {
                token: d.token,
                owner: d.user1,
                spender: d.exchange,
                amount: tokens(10),
            },
            Call::DepositToken {
                exchange: d.exchange,
                token: d.token,
                user: d.user1,
                amount: tokens(10),
            },
        ];
        for (i, call) in calls.into_iter().enumerate() {
            d.chain.submit(call, 2 + i as u64).unwrap();
        }
        let before = d.chain.state();

        let spoofed = [
            Call::Transfer {
                token: d.token,
                from: d.exchange,
                to: thief,
                amount: tokens(10),
            },
            Call::Approve {
                token: d.token,
                owner: d.exchange,
                spender: d.exchange,
                amount: tokens(10),
            },
            Call::DepositToken {
                exchange: d.exchange,
                token: d.token,
                user: d.exchange,
                amount: tokens(10),
            },
            Call::DepositEther {
                exchange: d.exchange,
                user: d.token,
                amount: 1,
            },
        ];
        for call in spoofed {
            let caller = call.caller();
            let err = d.chain.submit(call, 10).unwrap_err();
            assert_eq!(err, LedgerError::ContractCaller(caller));
        }
        assert_eq!(d.chain.state(), before);

        let held = d.chain.exchange(&d.exchange, |x| x.total_held(&d.token)).unwrap();
        let custody = d.chain.token(&d.token, |t| t.balance_of(&d.exchange)).unwrap();
        assert_eq!(held, tokens(10));
        assert_eq!(custody, held);
        let stolen = d.chain.token(&d.token, |t| t.balance_of(&thief)).unwrap();
        assert_eq!(stolen, 0);
    }

    #[test]
    fn receipts_round_trip_through_json() {
        let d = deploy();
        d.chain
            .submit(
                Call::DepositEther {
                    exchange: d.exchange,
                    user: d.user1,
                    amount: ether(1),
                },
                2,
            )
            .unwrap();
        let state = d.chain.state();
        let json = serde_json::to_string(&state).unwrap();
        let back: ChainState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
        let value = serde_json::to_value(&state).unwrap();
        assert_eq!(serde_json::from_value::<ChainState>(value).unwrap(), state);
        assert_eq!(Chain::from_state(back).summary(), d.chain.summary());
    }

    #[test]
    fn concurrent_deposits_are_serialized() {
        let d = deploy();
        let chain = Arc::new(d.chain);
        let exchange = d.exchange;
        let handles: Vec<_> = (0..8u64)
            .map(|i| {
                let chain = Arc::clone(&chain);
                std::thread::spawn(move || {
                    let user = Address::derive(&format!("user-{}", i % 2));
                    for _ in 0..25 {
                        chain
                            .submit(
                                Call::DepositEther {
                                    exchange,
                                    user,
                                    amount: 3,
                                },
                                10 + i,
                            )
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let totals = chain
            .exchange(&exchange, |x| {
                (
                    x.balance_of(&ETHER, &Address::derive("user-0")),
                    x.balance_of(&ETHER, &Address::derive("user-1")),
                    x.ether_custody(),
                )
            })
            .unwrap();
        assert_eq!(totals, (300, 300, 600));
        assert_eq!(chain.summary().height, 1 + 200);
    }
}
