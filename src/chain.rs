//! Read-only block access
//!
//! The consensus core never owns blocks; it walks the journal's store
//! backward through [`BlockSource`]. Only the fields consensus needs are
//! exposed.

use crate::types::{BlockId, Hash, ValidatorId, NULL_BLOCK_ID};
use sha3::{Digest, Sha3_256};
use std::collections::HashMap;
use std::sync::RwLock;

/// The slice of a block the consensus core reads.
#[derive(Debug, Clone)]
pub struct BlockRef {
    /// Header signature digest; doubles as the block's identifier
    pub block_id: BlockId,
    pub previous_block_id: BlockId,
    pub block_num: u64,
    /// Signing public key of the validator that claimed the block
    pub signer_id: ValidatorId,
    /// Digest of the block content a wait certificate commits to; derived
    /// before the header is signed, see [`block_content_hash`]
    pub content_hash: Hash,
    /// Opaque consensus field (serialized wait certificate payload);
    /// empty for blocks claimed under a different consensus
    pub consensus: Vec<u8>,
}

/// The block content digest a wait certificate commits to: previous block
/// id plus the batch digests, in order. Computable before the header is
/// signed, so the certificate can be embedded in the header itself.
pub fn block_content_hash(previous_block_id: &BlockId, batch_ids: &[Hash]) -> Hash {
    let mut hasher = Sha3_256::new();
    hasher.update(previous_block_id);
    for batch_id in batch_ids {
        hasher.update(batch_id);
    }
    hasher.finalize().into()
}

/// Read-only parent-chain traversal by block id.
pub trait BlockSource: Send + Sync {
    fn block(&self, block_id: &BlockId) -> Option<BlockRef>;
}

/// Iterate a block and its ancestors, newest first, stopping at genesis or
/// at the first unknown block.
pub fn ancestors<'a>(
    source: &'a dyn BlockSource,
    head: &BlockId,
) -> impl Iterator<Item = BlockRef> + 'a {
    let mut next = *head;
    std::iter::from_fn(move || {
        if next == NULL_BLOCK_ID {
            return None;
        }
        let block = source.block(&next)?;
        next = block.previous_block_id;
        Some(block)
    })
}

/// Map-backed block store for embedding simulations and tests.
#[derive(Default)]
pub struct InMemoryBlockStore {
    blocks: RwLock<HashMap<BlockId, BlockRef>>,
}

impl InMemoryBlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, block: BlockRef) {
        self.blocks
            .write()
            .expect("block store lock")
            .insert(block.block_id, block);
    }

    pub fn len(&self) -> usize {
        self.blocks.read().expect("block store lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BlockSource for InMemoryBlockStore {
    fn block(&self, block_id: &BlockId) -> Option<BlockRef> {
        self.blocks
            .read()
            .expect("block store lock")
            .get(block_id)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(n: u64, prev: BlockId) -> BlockRef {
        BlockRef {
            block_id: [n as u8; 32],
            previous_block_id: prev,
            block_num: n,
            signer_id: [0u8; 32],
            content_hash: [n as u8; 32],
            consensus: Vec::new(),
        }
    }

    #[test]
    fn test_content_hash_depends_on_parts() {
        let a = block_content_hash(&[1u8; 32], &[[2u8; 32]]);
        let b = block_content_hash(&[1u8; 32], &[[3u8; 32]]);
        let c = block_content_hash(&[9u8; 32], &[[2u8; 32]]);
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, block_content_hash(&[1u8; 32], &[[2u8; 32]]));
    }

    #[test]
    fn test_ancestor_walk_to_genesis() {
        let store = InMemoryBlockStore::new();
        store.insert(block(1, NULL_BLOCK_ID));
        store.insert(block(2, [1u8; 32]));
        store.insert(block(3, [2u8; 32]));

        let nums: Vec<u64> = ancestors(&store, &[3u8; 32]).map(|b| b.block_num).collect();
        assert_eq!(nums, vec![3, 2, 1]);
    }

    #[test]
    fn test_ancestor_walk_stops_at_unknown() {
        let store = InMemoryBlockStore::new();
        store.insert(block(3, [2u8; 32]));

        let nums: Vec<u64> = ancestors(&store, &[3u8; 32]).map(|b| b.block_num).collect();
        assert_eq!(nums, vec![3]);
    }

    #[test]
    fn test_missing_head() {
        let store = InMemoryBlockStore::new();
        assert_eq!(ancestors(&store, &[9u8; 32]).count(), 0);
    }
}
