//! World State View: the materialised entity state derived from the chain —
//! domains, accounts, signatories, assets, holdings and the peer set.
//!
//! The state at height H is a pure function of the genesis commands and
//! blocks 1..H. Everything is BTreeMap/BTreeSet backed so iteration order,
//! and therefore the state root, is deterministic.

use crate::crypto::PublicKey;
use crate::merkle;
use crate::types::{Block, BlockHeader, Command, Hash32, Peer, Transaction, TxPayload};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("domain {0} already exists")]
    DomainExists(String),
    #[error("unknown domain {0}")]
    UnknownDomain(String),
    #[error("account {0} already exists")]
    AccountExists(String),
    #[error("unknown account {0}")]
    UnknownAccount(String),
    #[error("signatory already attached to {0}")]
    SignatoryExists(String),
    #[error("signatory not attached to {0}")]
    UnknownSignatory(String),
    #[error("cannot remove the last signatory of {0}")]
    LastSignatory(String),
    #[error("asset {0} already exists")]
    AssetExists(String),
    #[error("unknown asset {0}")]
    UnknownAsset(String),
    #[error("insufficient balance of {asset} on {account}")]
    InsufficientBalance { account: String, asset: String },
    #[error("balance overflow of {asset} on {account}")]
    BalanceOverflow { account: String, asset: String },
    #[error("peer {0} already registered")]
    PeerExists(String),
    #[error("malformed id {0}")]
    MalformedId(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub signatories: BTreeSet<PublicKey>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorldState {
    pub domains: BTreeSet<String>,
    pub accounts: BTreeMap<String, Account>,
    pub assets: BTreeSet<String>,
    /// account id -> asset id -> amount
    pub holdings: BTreeMap<String, BTreeMap<String, u64>>,
    pub peers: Vec<Peer>,
}

fn id_domain<'a>(id: &'a str, sep: char) -> Result<&'a str, CommandError> {
    id.split_once(sep)
        .map(|(_, d)| d)
        .filter(|d| !d.is_empty())
        .ok_or_else(|| CommandError::MalformedId(id.to_string()))
}

impl WorldState {
    pub fn peer_set(&self) -> Vec<Peer> {
        self.peers.clone()
    }

    pub fn balance(&self, account: &str, asset: &str) -> u64 {
        self.holdings
            .get(account)
            .and_then(|h| h.get(asset))
            .copied()
            .unwrap_or(0)
    }

    pub fn apply_command(&mut self, cmd: &Command) -> Result<(), CommandError> {
        match cmd {
            Command::CreateDomain { domain } => {
                if !self.domains.insert(domain.clone()) {
                    return Err(CommandError::DomainExists(domain.clone()));
                }
                Ok(())
            }
            Command::CreateAccount { account, pubkey } => {
                let domain = id_domain(account, '@')?;
                if !self.domains.contains(domain) {
                    return Err(CommandError::UnknownDomain(domain.to_string()));
                }
                if self.accounts.contains_key(account) {
                    return Err(CommandError::AccountExists(account.clone()));
                }
                let mut signatories = BTreeSet::new();
                signatories.insert(pubkey.clone());
                self.accounts.insert(account.clone(), Account { id: account.clone(), signatories });
                Ok(())
            }
            Command::AddSignatory { account, pubkey } => {
                let acc = self
                    .accounts
                    .get_mut(account)
                    .ok_or_else(|| CommandError::UnknownAccount(account.clone()))?;
                if !acc.signatories.insert(pubkey.clone()) {
                    return Err(CommandError::SignatoryExists(account.clone()));
                }
                Ok(())
            }
            Command::RemoveSignatory { account, pubkey } => {
                let acc = self
                    .accounts
                    .get_mut(account)
                    .ok_or_else(|| CommandError::UnknownAccount(account.clone()))?;
                if !acc.signatories.contains(pubkey) {
                    return Err(CommandError::UnknownSignatory(account.clone()));
                }
                if acc.signatories.len() == 1 {
                    return Err(CommandError::LastSignatory(account.clone()));
                }
                acc.signatories.remove(pubkey);
                Ok(())
            }
            Command::CreateAsset { asset } => {
                let domain = id_domain(asset, '#')?;
                if !self.domains.contains(domain) {
                    return Err(CommandError::UnknownDomain(domain.to_string()));
                }
                if !self.assets.insert(asset.clone()) {
                    return Err(CommandError::AssetExists(asset.clone()));
                }
                Ok(())
            }
            Command::AddAssetQuantity { account, asset, amount } => {
                if !self.accounts.contains_key(account) {
                    return Err(CommandError::UnknownAccount(account.clone()));
                }
                if !self.assets.contains(asset) {
                    return Err(CommandError::UnknownAsset(asset.clone()));
                }
                let bal = self.holdings.entry(account.clone()).or_default().entry(asset.clone()).or_insert(0);
                *bal = bal.checked_add(*amount).ok_or_else(|| CommandError::BalanceOverflow {
                    account: account.clone(),
                    asset: asset.clone(),
                })?;
                Ok(())
            }
            Command::TransferAsset { src, dest, asset, amount } => {
                if !self.accounts.contains_key(src) {
                    return Err(CommandError::UnknownAccount(src.clone()));
                }
                if !self.accounts.contains_key(dest) {
                    return Err(CommandError::UnknownAccount(dest.clone()));
                }
                if !self.assets.contains(asset) {
                    return Err(CommandError::UnknownAsset(asset.clone()));
                }
                let src_bal = self.balance(src, asset);
                if src_bal < *amount {
                    return Err(CommandError::InsufficientBalance {
                        account: src.clone(),
                        asset: asset.clone(),
                    });
                }
                // Debit first so a self-transfer nets to zero.
                self.holdings.entry(src.clone()).or_default().insert(asset.clone(), src_bal - amount);
                let dest_bal = self.balance(dest, asset);
                let new_dest = dest_bal.checked_add(*amount).ok_or_else(|| CommandError::BalanceOverflow {
                    account: dest.clone(),
                    asset: asset.clone(),
                })?;
                self.holdings.entry(dest.clone()).or_default().insert(asset.clone(), new_dest);
                Ok(())
            }
            Command::AddPeer { peer } => {
                if self.peers.iter().any(|p| p.pubkey == peer.pubkey) {
                    return Err(CommandError::PeerExists(peer.pubkey.short_hex()));
                }
                self.peers.push(peer.clone());
                Ok(())
            }
        }
    }

    /// Apply a whole transaction inside a savepoint: either every command
    /// lands, or the state is left untouched and the first error returned.
    pub fn apply_transaction(&mut self, tx: &Transaction) -> Result<(), CommandError> {
        let mut next = self.clone();
        for cmd in &tx.payload.commands {
            next.apply_command(cmd)?;
        }
        *self = next;
        Ok(())
    }

    /// Replay a committed block. Every transaction must apply cleanly;
    /// stateful validation guaranteed that before the block was voted on.
    pub fn apply_block(&mut self, block: &Block) -> Result<(), CommandError> {
        for tx in &block.transactions {
            self.apply_transaction(tx)?;
        }
        Ok(())
    }

    /// Deterministic merkle state root over the flattened entity map.
    pub fn root(&self) -> Hash32 {
        let mut flat: BTreeMap<String, String> = BTreeMap::new();
        for d in &self.domains {
            flat.insert(format!("domain:{d}"), String::new());
        }
        for (id, acc) in &self.accounts {
            let sigs: Vec<String> = acc.signatories.iter().map(|s| hex::encode(&s.0)).collect();
            flat.insert(format!("account:{id}"), sigs.join(","));
        }
        for a in &self.assets {
            flat.insert(format!("asset:{a}"), String::new());
        }
        for (acc, per_asset) in &self.holdings {
            for (asset, amount) in per_asset {
                flat.insert(format!("holding:{acc}:{asset}"), amount.to_string());
            }
        }
        for p in &self.peers {
            flat.insert(format!("peer:{}", hex::encode(&p.pubkey.0)), p.address.clone());
        }
        Hash32(merkle::map_root(&flat))
    }
}

/// The deterministic genesis block: height 0, zero prev-hash, a single
/// unsigned transaction carrying the bootstrap commands. Timestamps are
/// fixed at zero so every node derives the identical block.
pub fn genesis_block(commands: Vec<Command>) -> Block {
    let tx = Transaction {
        payload: TxPayload {
            creator: "genesis".into(),
            created_ms: 0,
            commands,
        },
        signatures: vec![],
    };
    let transactions = vec![tx];
    Block {
        header: BlockHeader {
            height: 0,
            prev_hash: Hash32::zero(),
            merkle_root: crate::types::tx_merkle_root(&transactions),
            txs_number: transactions.len() as u32,
            created_ms: 0,
        },
        transactions,
        signatures: vec![],
    }
}
