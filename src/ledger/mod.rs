//! Single-asset fungible token ledger: balances, allowances and delegated
//! transfer.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{address::Address, error::LedgerError};

pub type Amount = u128;

/// Record produced by a successful token mutation.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum TokenEvent {
    Transfer {
        from: Address,
        to: Address,
        #[serde(with = "crate::units::decimal")]
        value: Amount,
    },
    Approval {
        owner: Address,
        spender: Address,
        #[serde(with = "crate::units::decimal")]
        value: Amount,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenMetadata {
    pub name: String,
    pub symbol: String,
    pub decimals: u8,
    #[serde(with = "crate::units::decimal")]
    pub total_supply: Amount,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenSnapshot {
    pub address: Address,
    pub meta: TokenMetadata,
    #[serde(with = "crate::units::decimal_map")]
    pub balances: BTreeMap<Address, Amount>,
    #[serde(with = "crate::units::nested_decimal_map")]
    pub allowances: BTreeMap<Address, BTreeMap<Address, Amount>>,
    #[serde(with = "hex_root")]
    pub state_root: [u8; 32],
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenLedger {
    address: Address,
    meta: TokenMetadata,
    #[serde(with = "crate::units::decimal_map")]
    balances: BTreeMap<Address, Amount>,
    #[serde(with = "crate::units::nested_decimal_map")]
    allowances: BTreeMap<Address, BTreeMap<Address, Amount>>,
}

impl TokenLedger {
    /// Deploys a token at `address`, minting the whole supply to `deployer`.
    pub fn new(
        address: Address,
        name: impl Into<String>,
        symbol: impl Into<String>,
        decimals: u8,
        total_supply: Amount,
        deployer: Address,
    ) -> Self {
        let mut balances = BTreeMap::new();
        if total_supply > 0 {
            balances.insert(deployer, total_supply);
        }
        Self {
            address,
            meta: TokenMetadata {
                name: name.into(),
                symbol: symbol.into(),
                decimals,
                total_supply,
            },
            balances,
            allowances: BTreeMap::new(),
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn name(&self) -> &str {
        &self.meta.name
    }

    pub fn symbol(&self) -> &str {
        &self.meta.symbol
    }

    pub fn decimals(&self) -> u8 {
        self.meta.decimals
    }

    pub fn total_supply(&self) -> Amount {
        self.meta.total_supply
    }

    pub fn metadata(&self) -> &TokenMetadata {
        &self.meta
    }

    pub fn balance_of(&self, account: &Address) -> Amount {
        self.balances.get(account).copied().unwrap_or(0)
    }

    pub fn allowance(&self, owner: &Address, spender: &Address) -> Amount {
        self.allowances
            .get(owner)
            .and_then(|grants| grants.get(spender))
            .copied()
            .unwrap_or(0)
    }

    /// Sum of every balance; equals `total_supply` at all times.
    pub fn circulating(&self) -> Amount {
        self.balances.values().sum()
    }

    pub fn transfer(
        &mut self,
        from: Address,
        to: Address,
        amount: Amount,
    ) -> Result<TokenEvent, LedgerError> {
        self.check_transfer(&from, &to, amount)?;
        self.move_balance(from, to, amount);
        Ok(TokenEvent::Transfer {
            from,
            to,
            value: amount,
        })
    }

    /// Overwrites the allowance `spender` holds over `owner`'s balance.
    pub fn approve(
        &mut self,
        owner: Address,
        spender: Address,
        amount: Amount,
    ) -> Result<TokenEvent, LedgerError> {
        if spender.is_zero() {
            return Err(LedgerError::InvalidSpender);
        }
        self.set_allowance(owner, spender, amount);
        Ok(TokenEvent::Approval {
            owner,
            spender,
            value: amount,
        })
    }

    /// Moves `amount` from `owner` to `to` on behalf of `spender`, consuming
    /// that much of the allowance.
    pub fn transfer_from(
        &mut self,
        spender: Address,
        owner: Address,
        to: Address,
        amount: Amount,
    ) -> Result<TokenEvent, LedgerError> {
        if to.is_zero() {
            return Err(LedgerError::InvalidRecipient);
        }
        let allowed = self.allowance(&owner, &spender);
        if allowed < amount {
            return Err(LedgerError::InsufficientAllowance {
                owner,
                spender,
                needed: amount,
                available: allowed,
            });
        }
        self.check_transfer(&owner, &to, amount)?;

        self.set_allowance(owner, spender, allowed - amount);
        self.move_balance(owner, to, amount);
        Ok(TokenEvent::Transfer {
            from: owner,
            to,
            value: amount,
        })
    }

    pub fn snapshot(&self) -> TokenSnapshot {
        TokenSnapshot {
            address: self.address,
            meta: self.meta.clone(),
            balances: self.balances.clone(),
            allowances: self.allowances.clone(),
            state_root: self.state_root(),
        }
    }

    pub fn state_root(&self) -> [u8; 32] {
        let mut leaves: Vec<[u8; 32]> = Vec::new();
        for (account, balance) in &self.balances {
            let mut hasher = Sha256::new();
            hasher.update(b"bal");
            hasher.update(account.as_bytes());
            hasher.update(balance.to_le_bytes());
            leaves.push(hasher.finalize().into());
        }
        for (owner, grants) in &self.allowances {
            for (spender, amount) in grants {
                let mut hasher = Sha256::new();
                hasher.update(b"allow");
                hasher.update(owner.as_bytes());
                hasher.update(spender.as_bytes());
                hasher.update(amount.to_le_bytes());
                leaves.push(hasher.finalize().into());
            }
        }
        build_merkle(leaves)
    }

    fn check_transfer(
        &self,
        from: &Address,
        to: &Address,
        amount: Amount,
    ) -> Result<(), LedgerError> {
        if to.is_zero() {
            return Err(LedgerError::InvalidRecipient);
        }
        let available = self.balance_of(from);
        if available < amount {
            return Err(LedgerError::InsufficientBalance {
                account: *from,
                needed: amount,
                available,
            });
        }
        Ok(())
    }

    // Caller has already run `check_transfer`.
    fn move_balance(&mut self, from: Address, to: Address, amount: Amount) {
        if amount == 0 {
            return;
        }
        let remaining = self.balance_of(&from) - amount;
        if remaining == 0 {
            self.balances.remove(&from);
        } else {
            self.balances.insert(from, remaining);
        }
        // Σ balances == total_supply, so the credit cannot overflow.
        *self.balances.entry(to).or_insert(0) += amount;
    }

    fn set_allowance(&mut self, owner: Address, spender: Address, amount: Amount) {
        if amount == 0 {
            if let Some(grants) = self.allowances.get_mut(&owner) {
                grants.remove(&spender);
                if grants.is_empty() {
                    self.allowances.remove(&owner);
                }
            }
            return;
        }
        self.allowances
            .entry(owner)
            .or_default()
            .insert(spender, amount);
    }
}

pub(crate) fn build_merkle(mut leaves: Vec<[u8; 32]>) -> [u8; 32] {
    if leaves.is_empty() {
        return Sha256::digest(b"nir-ledger-empty").into();
    }
    while leaves.len() > 1 {
        let mut next = Vec::with_capacity((leaves.len() + 1) / 2);
        for chunk in leaves.chunks(2) {
            let mut hasher = Sha256::new();
            hasher.update(b"node");
            hasher.update(chunk[0]);
            hasher.update(chunk.get(1).unwrap_or(&chunk[0]));
            next.push(hasher.finalize().into());
        }
        leaves = next;
    }
    leaves[0]
}

pub(crate) mod hex_root {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(root: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(root))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<[u8; 32], D::Error> {
        let s = String::deserialize(deserializer)?;
        let raw = hex::decode(&s).map_err(de::Error::custom)?;
        raw.as_slice()
            .try_into()
            .map_err(|_| de::Error::custom("state root must be 32 bytes"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::units::tokens;
    use proptest::prelude::*;

    fn deployer() -> Address {
        Address::derive("deployer")
    }

    fn receiver() -> Address {
        Address::derive("receiver")
    }

    fn exchange() -> Address {
        Address::derive("exchange")
    }

    fn nir() -> TokenLedger {
        TokenLedger::new(
            Address::derive("token"),
            "Nir Coin",
            "NIR",
            18,
            tokens(1_000_000),
            deployer(),
        )
    }

    #[test]
    fn deployment_tracks_metadata_and_mints_to_deployer() {
        let token = nir();
        assert_eq!(token.name(), "Nir Coin");
        assert_eq!(token.symbol(), "NIR");
        assert_eq!(token.decimals(), 18);
        assert_eq!(token.total_supply().to_string(), "1000000000000000000000000");
        assert_eq!(token.balance_of(&deployer()), tokens(1_000_000));
        assert_eq!(token.balance_of(&receiver()), 0);
    }

    #[test]
    fn transfer_moves_balances_and_emits_transfer() {
        let mut token = nir();
        let event = token.transfer(deployer(), receiver(), tokens(100)).unwrap();
        assert_eq!(token.balance_of(&deployer()), tokens(999_900));
        assert_eq!(token.balance_of(&receiver()), tokens(100));
        assert_eq!(
            event,
            TokenEvent::Transfer {
                from: deployer(),
                to: receiver(),
                value: tokens(100),
            }
        );
    }

    #[test]
    fn transfer_rejects_insufficient_balances() {
        let mut token = nir();
        let before = token.clone();
        let err = token
            .transfer(deployer(), receiver(), tokens(1_000_000_000))
            .unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientBalance { .. }));

        // receiver doesn't have any tokens yet
        let err = token.transfer(receiver(), deployer(), tokens(10)).unwrap_err();
        assert_eq!(
            err,
            LedgerError::InsufficientBalance {
                account: receiver(),
                needed: tokens(10),
                available: 0,
            }
        );
        assert_eq!(token, before);
    }

    #[test]
    fn transfer_rejects_invalid_recipient() {
        let mut token = nir();
        let err = token.transfer(deployer(), Address::ZERO, tokens(100)).unwrap_err();
        assert_eq!(err, LedgerError::InvalidRecipient);
        assert_eq!(token.balance_of(&deployer()), tokens(1_000_000));
    }

    #[test]
    fn approve_overwrites_allowance() {
        let mut token = nir();
        let event = token.approve(deployer(), exchange(), tokens(100)).unwrap();
        assert_eq!(token.allowance(&deployer(), &exchange()), tokens(100));
        assert_eq!(
            event,
            TokenEvent::Approval {
                owner: deployer(),
                spender: exchange(),
                value: tokens(100),
            }
        );

        token.approve(deployer(), exchange(), tokens(40)).unwrap();
        assert_eq!(token.allowance(&deployer(), &exchange()), tokens(40));
    }

    #[test]
    fn approve_rejects_invalid_spender() {
        let mut token = nir();
        let err = token.approve(deployer(), Address::ZERO, tokens(100)).unwrap_err();
        assert_eq!(err, LedgerError::InvalidSpender);
        assert_eq!(token.allowance(&deployer(), &Address::ZERO), 0);
    }

    #[test]
    fn delegated_transfer_consumes_allowance() {
        let mut token = nir();
        token.approve(deployer(), exchange(), tokens(100)).unwrap();
        let event = token
            .transfer_from(exchange(), deployer(), receiver(), tokens(100))
            .unwrap();
        assert_eq!(token.balance_of(&deployer()), tokens(999_900));
        assert_eq!(token.balance_of(&receiver()), tokens(100));
        assert_eq!(token.allowance(&deployer(), &exchange()), 0);
        assert_eq!(
            event,
            TokenEvent::Transfer {
                from: deployer(),
                to: receiver(),
                value: tokens(100),
            }
        );
    }

    #[test]
    fn delegated_transfer_partial_spend_leaves_remainder() {
        let mut token = nir();
        token.approve(deployer(), exchange(), tokens(100)).unwrap();
        token
            .transfer_from(exchange(), deployer(), receiver(), tokens(30))
            .unwrap();
        assert_eq!(token.allowance(&deployer(), &exchange()), tokens(70));
    }

    #[test]
    fn delegated_transfer_rejects_insufficient_balance_and_allowance() {
        let mut token = nir();
        token.approve(deployer(), exchange(), tokens(100)).unwrap();
        let before = token.clone();

        let err = token
            .transfer_from(exchange(), deployer(), receiver(), tokens(1_000_000_000))
            .unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientAllowance { .. }));

        token.approve(deployer(), exchange(), tokens(2_000_000)).unwrap();
        let err = token
            .transfer_from(exchange(), deployer(), receiver(), tokens(1_500_000))
            .unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientBalance { .. }));
        assert_eq!(token.allowance(&deployer(), &exchange()), tokens(2_000_000));
        assert_eq!(token.balances, before.balances);
    }

    #[test]
    fn delegated_transfer_rejects_invalid_recipient() {
        let mut token = nir();
        token.approve(deployer(), exchange(), tokens(100)).unwrap();
        let err = token
            .transfer_from(exchange(), deployer(), Address::ZERO, tokens(10))
            .unwrap_err();
        assert_eq!(err, LedgerError::InvalidRecipient);
        assert_eq!(token.allowance(&deployer(), &exchange()), tokens(100));
    }

    #[test]
    fn state_root_is_deterministic_and_tracks_changes() {
        let mut token = nir();
        let root1 = token.snapshot().state_root;
        assert_eq!(root1, token.state_root());
        token.transfer(deployer(), receiver(), 1).unwrap();
        assert_ne!(root1, token.state_root());
    }

    #[test]
    fn snapshot_serializes_root_as_hex() {
        let token = nir();
        let json = serde_json::to_value(token.snapshot()).unwrap();
        assert_eq!(json["state_root"], hex::encode(token.state_root()));
        assert_eq!(json["meta"]["total_supply"], tokens(1_000_000).to_string());
        assert_eq!(json["balances"][deployer().to_string()], tokens(1_000_000).to_string());
        let back: TokenSnapshot = serde_json::from_value(json).unwrap();
        assert_eq!(back, token.snapshot());
    }

    #[derive(Clone, Debug)]
    enum Op {
        Transfer(usize, usize, u128),
        Approve(usize, usize, u128),
        TransferFrom(usize, usize, usize, u128),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0..4usize, 0..5usize, 0..2_000u128).prop_map(|(a, b, v)| Op::Transfer(a, b, v)),
            (0..4usize, 0..5usize, 0..2_000u128).prop_map(|(a, b, v)| Op::Approve(a, b, v)),
            (0..4usize, 0..4usize, 0..5usize, 0..2_000u128)
                .prop_map(|(s, o, t, v)| Op::TransferFrom(s, o, t, v)),
        ]
    }

    proptest! {
        #[test]
        fn supply_is_conserved(ops in proptest::collection::vec(op(), 0..64)) {
            // index 4 is the reserved zero address
            let accounts = [
                Address::derive("a"),
                Address::derive("b"),
                Address::derive("c"),
                Address::derive("d"),
                Address::ZERO,
            ];
            let mut token = TokenLedger::new(Address::derive("t"), "T", "T", 0, 5_000, accounts[0]);
            for op in ops {
                let before = token.clone();
                let result = match op {
                    Op::Transfer(a, b, v) => token.transfer(accounts[a], accounts[b], v),
                    Op::Approve(a, b, v) => token.approve(accounts[a], accounts[b], v),
                    Op::TransferFrom(s, o, t, v) => {
                        token.transfer_from(accounts[s], accounts[o], accounts[t], v)
                    }
                };
                if result.is_err() {
                    prop_assert_eq!(&token, &before);
                }
                prop_assert_eq!(token.circulating(), token.total_supply());
            }
        }
    }
}
