//! Append-only block stores addressed by height.
//!
//! `FsBlockStore` keeps one bincode file per height with fsync, a JSON
//! height index rewritten atomically (write to `.tmp` then rename), and an
//! LRU read cache for recent blocks.

use crate::types::{Block, Height};
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Read, Write};
use std::num::NonZeroUsize;
use std::path::PathBuf;
use tracing::warn;

const CACHE_SIZE: usize = 256;

pub trait BlockStore: Send + Sync {
    /// Append a batch of blocks at consecutive heights. Either every block
    /// in the batch is durably appended, or none is.
    fn append_batch(&self, blocks: &[Block]) -> io::Result<()>;

    fn read(&self, height: Height) -> Option<Block>;

    /// Height of the newest stored block; `None` for an empty store.
    fn top_height(&self) -> Option<Height>;

    /// Blocks in `[from, to]` ascending, stopping at the first gap.
    fn range(&self, from: Height, to: Height) -> Vec<Block> {
        let mut out = Vec::new();
        for h in from..=to {
            match self.read(h) {
                Some(b) => out.push(b),
                None => break,
            }
        }
        out
    }
}

// ── In-memory store ───────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemBlockStore {
    blocks: Mutex<BTreeMap<Height, Block>>,
}

impl BlockStore for MemBlockStore {
    fn append_batch(&self, blocks: &[Block]) -> io::Result<()> {
        let mut m = self.blocks.lock();
        for b in blocks {
            m.insert(b.header.height, b.clone());
        }
        Ok(())
    }

    fn read(&self, height: Height) -> Option<Block> {
        self.blocks.lock().get(&height).cloned()
    }

    fn top_height(&self) -> Option<Height> {
        self.blocks.lock().keys().next_back().copied()
    }
}

// ── On-disk store ─────────────────────────────────────────────────────────

#[derive(Default, Serialize, Deserialize)]
struct IndexFile {
    by_height: BTreeMap<Height, String>,
    top_height: Option<Height>,
}

pub struct FsBlockStore {
    dir: PathBuf,
    idx_path: PathBuf,
    idx: Mutex<IndexFile>,
    cache: Mutex<LruCache<Height, Block>>,
}

impl FsBlockStore {
    pub fn open(root: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = root.into();
        fs::create_dir_all(&dir)?;

        let idx_path = dir.join("index.json");
        let idx = if idx_path.exists() {
            serde_json::from_str(&fs::read_to_string(&idx_path)?).unwrap_or_default()
        } else {
            IndexFile::default()
        };

        Ok(Self {
            dir,
            idx_path,
            idx: Mutex::new(idx),
            cache: Mutex::new({
                let cap = NonZeroUsize::new(CACHE_SIZE).unwrap_or(NonZeroUsize::MIN);
                LruCache::new(cap)
            }),
        })
    }

    fn path_for(&self, height: Height) -> PathBuf {
        self.dir.join(format!("{height:010}.blk"))
    }

    fn persist_index(&self, idx: &IndexFile) -> io::Result<()> {
        let tmp = self.idx_path.with_extension("tmp");
        let s = serde_json::to_string_pretty(idx)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        fs::write(&tmp, &s)?;
        fs::rename(&tmp, &self.idx_path)
    }

    fn write_block_file(&self, block: &Block) -> io::Result<()> {
        let bytes = bincode::serialize(block)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        let mut f = fs::File::create(self.path_for(block.header.height))?;
        f.write_all(&bytes)?;
        f.sync_all()
    }
}

impl BlockStore for FsBlockStore {
    fn append_batch(&self, blocks: &[Block]) -> io::Result<()> {
        if blocks.is_empty() {
            return Ok(());
        }
        let mut idx = self.idx.lock();

        // Stage every block file before touching the index; undo staged
        // files if anything fails so the store never reflects a partial
        // batch.
        let mut written: Vec<Height> = Vec::with_capacity(blocks.len());
        for b in blocks {
            if let Err(e) = self.write_block_file(b) {
                for h in written {
                    let _ = fs::remove_file(self.path_for(h));
                }
                return Err(e);
            }
            written.push(b.header.height);
        }

        let mut next = IndexFile {
            by_height: idx.by_height.clone(),
            top_height: idx.top_height,
        };
        for b in blocks {
            next.by_height.insert(b.header.height, b.hash().short_hex());
            if next.top_height.map_or(true, |t| b.header.height > t) {
                next.top_height = Some(b.header.height);
            }
        }
        if let Err(e) = self.persist_index(&next) {
            for h in written {
                let _ = fs::remove_file(self.path_for(h));
            }
            return Err(e);
        }
        *idx = next;

        let mut cache = self.cache.lock();
        for b in blocks {
            cache.put(b.header.height, b.clone());
        }
        Ok(())
    }

    fn read(&self, height: Height) -> Option<Block> {
        if !self.idx.lock().by_height.contains_key(&height) {
            return None;
        }
        {
            let mut cache = self.cache.lock();
            if let Some(b) = cache.get(&height) {
                return Some(b.clone());
            }
        }

        let mut f = fs::File::open(self.path_for(height)).ok()?;
        let mut buf = Vec::new();
        f.read_to_end(&mut buf).ok()?;
        let block: Block = match bincode::deserialize(&buf) {
            Ok(b) => b,
            Err(e) => {
                warn!(height, "block file corrupt: {e}");
                return None;
            }
        };

        self.cache.lock().put(height, block.clone());
        Some(block)
    }

    fn top_height(&self) -> Option<Height> {
        self.idx.lock().top_height
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BlockHeader, Hash32};

    fn block(height: Height, prev: Hash32) -> Block {
        Block {
            header: BlockHeader {
                height,
                prev_hash: prev,
                merkle_root: crate::types::tx_merkle_root(&[]),
                txs_number: 0,
                created_ms: height,
            },
            transactions: vec![],
            signatures: vec![],
        }
    }

    #[test]
    fn fs_store_roundtrip_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let b0 = block(0, Hash32::zero());
        let b1 = block(1, b0.hash());
        {
            let store = FsBlockStore::open(dir.path()).unwrap();
            store.append_batch(&[b0.clone(), b1.clone()]).unwrap();
            assert_eq!(store.top_height(), Some(1));
            assert_eq!(store.read(1).unwrap().hash(), b1.hash());
        }
        // Reopen from disk.
        let store = FsBlockStore::open(dir.path()).unwrap();
        assert_eq!(store.top_height(), Some(1));
        assert_eq!(store.read(0).unwrap().hash(), b0.hash());
        assert_eq!(store.range(0, 5).len(), 2);
    }

    #[test]
    fn mem_store_range_stops_at_gap() {
        let store = MemBlockStore::default();
        let b0 = block(0, Hash32::zero());
        let b2 = block(2, Hash32::zero());
        store.append_batch(&[b0, b2]).unwrap();
        assert_eq!(store.range(0, 2).len(), 1);
    }
}
