//! Canonical storage: the block store and the world state behind a single
//! single-writer / multi-reader lock, plus the snapshot views handed out to
//! the pipeline.
//!
//! `TemporaryWsv` and `MutableStorage` own their snapshot outright, so
//! dropping one discards every buffered mutation. Only `Storage::commit`
//! touches canonical state, and it holds the writer lease for its whole
//! duration; queries take a reader lease and therefore observe either the
//! pre- or post-commit state, never a mix.

pub mod block_store;

use crate::types::{Block, Hash32, Height, Peer};
use crate::wsv::{Account, CommandError, WorldState};
use self::block_store::BlockStore;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("storage commit failed: {0}")]
    Failed(String),
    #[error("block {height} does not extend the chain (expected prev {expected})")]
    ChainMismatch { height: Height, expected: String },
    #[error("command replay failed: {0}")]
    Replay(#[from] CommandError),
}

/// World-state file written next to the block store after each commit.
/// Carries the height it corresponds to; a stale or missing file is
/// recovered by replaying the chain.
#[derive(Serialize, Deserialize)]
struct PersistedState {
    top_height: Height,
    state: WorldState,
}

pub struct Storage {
    blocks: Arc<dyn BlockStore>,
    canon: RwLock<WorldState>,
    state_path: Option<PathBuf>,
}

impl Storage {
    /// Open storage over a block store, bootstrapping from `genesis` when
    /// the store is empty and replaying the chain when the persisted state
    /// file is missing or stale.
    pub fn open(
        blocks: Arc<dyn BlockStore>,
        state_path: Option<PathBuf>,
        genesis: Block,
    ) -> Result<Arc<Self>, StorageError> {
        let top = blocks.top_height();

        let state = match top {
            None => {
                let mut ws = WorldState::default();
                ws.apply_block(&genesis)?;
                blocks
                    .append_batch(&[genesis])
                    .map_err(|e| StorageError::Unavailable(e.to_string()))?;
                info!("storage bootstrapped from genesis");
                ws
            }
            Some(top) => {
                let stored = blocks
                    .read(0)
                    .ok_or_else(|| StorageError::Unavailable("missing genesis block".into()))?;
                if stored.hash() != genesis.hash() {
                    return Err(StorageError::Unavailable("genesis mismatch".into()));
                }
                match Self::load_state_file(&state_path, top) {
                    Some(ws) => ws,
                    None => Self::replay(blocks.as_ref(), top)?,
                }
            }
        };

        let storage = Arc::new(Self { blocks, canon: RwLock::new(state), state_path });
        storage.persist_state();
        Ok(storage)
    }

    fn load_state_file(path: &Option<PathBuf>, top: Height) -> Option<WorldState> {
        let path = path.as_ref()?;
        let s = std::fs::read_to_string(path).ok()?;
        let persisted: PersistedState = serde_json::from_str(&s).ok()?;
        if persisted.top_height != top {
            warn!(
                file = persisted.top_height,
                store = top,
                "state file height does not match block store; replaying chain"
            );
            return None;
        }
        Some(persisted.state)
    }

    fn replay(blocks: &dyn BlockStore, top: Height) -> Result<WorldState, StorageError> {
        let mut ws = WorldState::default();
        for h in 0..=top {
            let b = blocks
                .read(h)
                .ok_or_else(|| StorageError::Unavailable(format!("missing block {h}")))?;
            ws.apply_block(&b)?;
        }
        info!(top, "world state replayed from block store");
        Ok(ws)
    }

    /// Best-effort durability; canonical state lives in memory and is
    /// always derivable from the block store.
    fn persist_state(&self) {
        let Some(path) = &self.state_path else { return };
        let Some(top) = self.blocks.top_height() else { return };
        let persisted = PersistedState { top_height: top, state: self.canon.read().clone() };
        let tmp = path.with_extension("tmp");
        match serde_json::to_string(&persisted) {
            Ok(s) => {
                if std::fs::write(&tmp, &s)
                    .and_then(|_| std::fs::rename(&tmp, path))
                    .is_err()
                {
                    warn!("state file write failed");
                }
            }
            Err(e) => warn!("state file encode failed: {e}"),
        }
    }

    /// Snapshot of the committed state taken at call time; later commits do
    /// not affect the issued view.
    pub fn create_temporary_wsv(&self) -> TemporaryWsv {
        TemporaryWsv { state: self.canon.read().clone() }
    }

    pub fn create_mutable_storage(&self) -> MutableStorage {
        let canon = self.canon.read();
        let top_height = self.blocks.top_height();
        let top_hash = top_height
            .and_then(|h| self.blocks.read(h))
            .map(|b| b.hash())
            .unwrap_or_else(Hash32::zero);
        MutableStorage {
            state: canon.clone(),
            top_height,
            top_hash,
            pending: Vec::new(),
        }
    }

    /// Atomically promote a mutable snapshot: append its buffered blocks
    /// and publish its world state, or change nothing. A failed commit
    /// consumes (poisons) the snapshot and leaves canonical state intact.
    ///
    /// Returns the committed blocks in ascending height order.
    pub fn commit(&self, storage: MutableStorage) -> Result<Vec<Block>, StorageError> {
        let mut canon = self.canon.write();

        if let Some(first) = storage.pending.first() {
            let expected = self.blocks.top_height().map_or(0, |t| t + 1);
            if first.header.height != expected {
                return Err(StorageError::Failed(format!(
                    "pending blocks start at {} but chain top is {expected}",
                    first.header.height
                )));
            }
        }

        self.blocks
            .append_batch(&storage.pending)
            .map_err(|e| StorageError::Failed(e.to_string()))?;
        *canon = storage.state;
        drop(canon);

        self.persist_state();
        Ok(storage.pending)
    }

    pub fn wsv_query(self: &Arc<Self>) -> WsvQuery {
        WsvQuery { storage: Arc::clone(self) }
    }

    pub fn block_query(self: &Arc<Self>) -> BlockQuery {
        BlockQuery { storage: Arc::clone(self) }
    }

    pub fn peer_query(self: &Arc<Self>) -> PeerQuery {
        PeerQuery { wsv: self.wsv_query() }
    }
}

// ── Snapshot views ────────────────────────────────────────────────────────

/// Discardable read-write snapshot used by stateful validation. Never
/// promoted to the canonical store; drop = rollback.
pub struct TemporaryWsv {
    state: WorldState,
}

impl TemporaryWsv {
    pub fn state(&self) -> &WorldState {
        &self.state
    }

    /// Apply a transaction inside a savepoint: on error the view is left
    /// exactly as before.
    pub fn apply_transaction(&mut self, tx: &crate::types::Transaction) -> Result<(), CommandError> {
        self.state.apply_transaction(tx)
    }
}

/// Committable read-write snapshot buffering world-state mutations and a
/// pending block list. Promoted atomically by `Storage::commit`; dropping
/// it discards everything.
pub struct MutableStorage {
    state: WorldState,
    top_height: Option<Height>,
    top_hash: Hash32,
    pending: Vec<Block>,
}

impl MutableStorage {
    pub fn state(&self) -> &WorldState {
        &self.state
    }

    pub fn top_height(&self) -> Option<Height> {
        self.pending.last().map(|b| b.header.height).or(self.top_height)
    }

    pub fn top_hash(&self) -> Hash32 {
        self.pending.last().map(|b| b.hash()).unwrap_or_else(|| self.top_hash.clone())
    }

    /// Apply a block on top of the buffered chain: verifies linkage,
    /// replays its transactions into the buffered state, and queues the
    /// block for commit.
    pub fn apply_block(&mut self, block: Block) -> Result<(), StorageError> {
        let expected_height = self.top_height().map_or(0, |t| t + 1);
        if block.header.height != expected_height || block.header.prev_hash != self.top_hash() {
            return Err(StorageError::ChainMismatch {
                height: block.header.height,
                expected: self.top_hash().short_hex(),
            });
        }
        self.state.apply_block(&block)?;
        self.pending.push(block);
        Ok(())
    }
}

// ── Read-only queries ─────────────────────────────────────────────────────

#[derive(Clone)]
pub struct WsvQuery {
    storage: Arc<Storage>,
}

impl WsvQuery {
    pub fn state(&self) -> WorldState {
        self.storage.canon.read().clone()
    }

    pub fn account(&self, id: &str) -> Option<Account> {
        self.storage.canon.read().accounts.get(id).cloned()
    }

    pub fn balance(&self, account: &str, asset: &str) -> u64 {
        self.storage.canon.read().balance(account, asset)
    }

    pub fn peers(&self) -> Vec<Peer> {
        self.storage.canon.read().peer_set()
    }
}

#[derive(Clone)]
pub struct BlockQuery {
    storage: Arc<Storage>,
}

impl BlockQuery {
    pub fn get(&self, height: Height) -> Option<Block> {
        let _lease = self.storage.canon.read();
        self.storage.blocks.read(height)
    }

    pub fn top_height(&self) -> Option<Height> {
        let _lease = self.storage.canon.read();
        self.storage.blocks.top_height()
    }

    pub fn top_block(&self) -> Option<Block> {
        let _lease = self.storage.canon.read();
        self.storage.blocks.top_height().and_then(|h| self.storage.blocks.read(h))
    }

    /// Blocks in `[from, to]` from the committed snapshot at call time.
    pub fn range(&self, from: Height, to: Height) -> Vec<Block> {
        let _lease = self.storage.canon.read();
        self.storage.blocks.range(from, to)
    }
}

/// Read-only view over the world state returning the current peer set.
#[derive(Clone)]
pub struct PeerQuery {
    wsv: WsvQuery,
}

impl PeerQuery {
    pub fn peers(&self) -> Vec<Peer> {
        self.wsv.peers()
    }
}
