//! Tiger Tree Hash: 1024-byte leaves, `0x00` leaf prefix, `0x01` node prefix,
//! odd nodes promoted unchanged to the next level.

use std::fmt;
use std::io::{self, Read};

use data_encoding::BASE32_NOPAD;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tiger::{Digest, Tiger};

/// Tiger digest size in bytes.
pub const HASH_SIZE: usize = 24;

/// Leaf size of the base tree.
pub const BASE_BLOCK_SIZE: u64 = 1024;

/// Smallest block size stored for a tree.
pub const MIN_BLOCK_SIZE: u64 = 64 * 1024;

/// Levels kept when choosing a stored block size.
pub const MAX_LEVELS: u32 = 10;

/// A 24-byte Tiger digest. Base32 (no padding) in text form.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TthValue([u8; HASH_SIZE]);

impl TthValue {
    pub fn from_bytes(bytes: [u8; HASH_SIZE]) -> Self {
        TthValue(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }

    pub fn to_base32(&self) -> String {
        BASE32_NOPAD.encode(&self.0)
    }

    /// Parse a 39-character base32 string (case-insensitive).
    pub fn from_base32(s: &str) -> Result<Self, TthParseError> {
        let upper = s.trim().to_ascii_uppercase();
        let decoded = BASE32_NOPAD
            .decode(upper.as_bytes())
            .map_err(|_| TthParseError::Encoding)?;
        let bytes: [u8; HASH_SIZE] = decoded.try_into().map_err(|_| TthParseError::Length)?;
        Ok(TthValue(bytes))
    }
}

impl fmt::Display for TthValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base32())
    }
}

impl fmt::Debug for TthValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TthValue({})", self.to_base32())
    }
}

impl Serialize for TthValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_base32())
        } else {
            self.0.serialize(serializer)
        }
    }
}

impl<'de> Deserialize<'de> for TthValue {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        if d.is_human_readable() {
            let s = String::deserialize(d)?;
            TthValue::from_base32(&s).map_err(serde::de::Error::custom)
        } else {
            <[u8; HASH_SIZE]>::deserialize(d).map(TthValue)
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TthParseError {
    #[error("invalid base32 encoding")]
    Encoding,
    #[error("expected 24 bytes")]
    Length,
}

#[derive(Debug, thiserror::Error)]
pub enum TreeError {
    #[error("leaf data is not a multiple of 24 bytes")]
    Misaligned,
    #[error("{0} leaves do not fit a file of {1} bytes")]
    LeafCount(usize, u64),
    #[error("tree root does not match")]
    RootMismatch,
}

/// Hash of one leaf: `tiger(0x00 || data)`.
pub fn leaf_hash(data: &[u8]) -> TthValue {
    let mut hasher = Tiger::new();
    hasher.update([0u8]);
    hasher.update(data);
    TthValue(hasher.finalize().into())
}

/// Hash of an internal node: `tiger(0x01 || left || right)`.
pub fn node_hash(left: &TthValue, right: &TthValue) -> TthValue {
    let mut hasher = Tiger::new();
    hasher.update([1u8]);
    hasher.update(left.0);
    hasher.update(right.0);
    TthValue(hasher.finalize().into())
}

/// Reduce one tree level to its root, pairing left to right.
pub fn combine(level: &[TthValue]) -> TthValue {
    if level.is_empty() {
        return leaf_hash(&[]);
    }
    let mut current = level.to_vec();
    while current.len() > 1 {
        current = current
            .chunks(2)
            .map(|pair| {
                if pair.len() == 2 {
                    node_hash(&pair[0], &pair[1])
                } else {
                    pair[0]
                }
            })
            .collect();
    }
    current[0]
}

/// Smallest power-of-two block size (>= 1024) keeping at most `2^(max_levels-1)` blocks.
pub fn calc_block_size(file_size: u64, max_levels: u32) -> u64 {
    let max_hashes = 1u64 << max_levels.saturating_sub(1).min(62);
    let mut block_size = BASE_BLOCK_SIZE;
    while max_hashes.saturating_mul(block_size) < file_size {
        block_size *= 2;
    }
    block_size
}

/// Block size used for stored trees and download segmentation.
pub fn block_size_for(file_size: u64) -> u64 {
    calc_block_size(file_size, MAX_LEVELS).max(MIN_BLOCK_SIZE)
}

/// Number of blocks of `block_size` covering `file_size` (an empty file has one).
pub fn block_count(file_size: u64, block_size: u64) -> u64 {
    if file_size == 0 {
        1
    } else {
        file_size.div_ceil(block_size.max(1))
    }
}

/// Block size implied by `leaf_count` leaves for a file of `file_size` bytes.
pub fn block_size_from_leaf_count(file_size: u64, leaf_count: usize) -> Option<u64> {
    if leaf_count == 0 {
        return None;
    }
    let mut block_size = BASE_BLOCK_SIZE;
    while block_count(file_size, block_size) > leaf_count as u64 {
        block_size *= 2;
    }
    (block_count(file_size, block_size) == leaf_count as u64).then_some(block_size)
}

/// Incremental tree hasher. Feed bytes in order, then `finish`.
pub struct TigerTreeBuilder {
    block_size: u64,
    leaf_buf: Vec<u8>,
    /// Binary-counter stack of (node, level) inside the current block.
    block_stack: Vec<(TthValue, u32)>,
    block_fill: u64,
    blocks: Vec<TthValue>,
    total: u64,
}

impl TigerTreeBuilder {
    /// `block_size` is rounded up to a power of two no smaller than 1024.
    pub fn new(block_size: u64) -> Self {
        Self {
            block_size: block_size.max(BASE_BLOCK_SIZE).next_power_of_two(),
            leaf_buf: Vec::with_capacity(BASE_BLOCK_SIZE as usize),
            block_stack: Vec::new(),
            block_fill: 0,
            blocks: Vec::new(),
            total: 0,
        }
    }

    pub fn update(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            let want = BASE_BLOCK_SIZE as usize - self.leaf_buf.len();
            let take = want.min(data.len());
            self.leaf_buf.extend_from_slice(&data[..take]);
            data = &data[take..];
            self.total += take as u64;
            if self.leaf_buf.len() == BASE_BLOCK_SIZE as usize {
                let leaf = leaf_hash(&self.leaf_buf);
                self.leaf_buf.clear();
                self.push_leaf(leaf);
            }
        }
    }

    pub fn bytes_hashed(&self) -> u64 {
        self.total
    }

    fn push_leaf(&mut self, leaf: TthValue) {
        let mut node = leaf;
        let mut level = 0u32;
        while let Some(&(top, top_level)) = self.block_stack.last() {
            if top_level != level {
                break;
            }
            self.block_stack.pop();
            node = node_hash(&top, &node);
            level += 1;
        }
        self.block_stack.push((node, level));
        self.block_fill += BASE_BLOCK_SIZE;
        if self.block_fill >= self.block_size {
            self.close_block();
        }
    }

    fn close_block(&mut self) {
        // Right-to-left merge of the counter stack equals pairwise promotion.
        let mut acc: Option<TthValue> = None;
        while let Some((node, _)) = self.block_stack.pop() {
            acc = Some(match acc {
                None => node,
                Some(right) => node_hash(&node, &right),
            });
        }
        if let Some(hash) = acc {
            self.blocks.push(hash);
        }
        self.block_fill = 0;
    }

    pub fn finish(mut self) -> TigerTree {
        if !self.leaf_buf.is_empty() || self.total == 0 {
            let leaf = leaf_hash(&self.leaf_buf);
            self.leaf_buf.clear();
            self.push_leaf(leaf);
        }
        if !self.block_stack.is_empty() {
            self.close_block();
        }
        let root = combine(&self.blocks);
        TigerTree {
            file_size: self.total,
            block_size: self.block_size,
            root,
            leaves: self.blocks,
        }
    }
}

/// A computed tree: root plus the block-level leaves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TigerTree {
    pub file_size: u64,
    pub block_size: u64,
    pub root: TthValue,
    pub leaves: Vec<TthValue>,
}

impl TigerTree {
    pub fn hash_bytes(data: &[u8], block_size: u64) -> Self {
        let mut builder = TigerTreeBuilder::new(block_size);
        builder.update(data);
        builder.finish()
    }

    /// Hash everything from `reader`. `on_progress` gets the running byte count after
    /// each read; returning `false` cancels and yields `Ok(None)`.
    pub fn hash_reader<R: Read>(
        mut reader: R,
        block_size: u64,
        mut on_progress: impl FnMut(u64) -> bool,
    ) -> io::Result<Option<Self>> {
        let mut builder = TigerTreeBuilder::new(block_size);
        let mut buf = vec![0u8; 256 * 1024];
        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            builder.update(&buf[..n]);
            if !on_progress(builder.bytes_hashed()) {
                return Ok(None);
            }
        }
        Ok(Some(builder.finish()))
    }

    /// Build from known leaves, checking the leaf count against the file size.
    pub fn from_leaves(
        file_size: u64,
        block_size: u64,
        leaves: Vec<TthValue>,
    ) -> Result<Self, TreeError> {
        if block_count(file_size, block_size) != leaves.len() as u64 {
            return Err(TreeError::LeafCount(leaves.len(), file_size));
        }
        let root = combine(&leaves);
        Ok(Self {
            file_size,
            block_size,
            root,
            leaves,
        })
    }

    /// Parse leaf data received from a peer and check it reproduces `root`.
    pub fn from_tthl(file_size: u64, root: TthValue, bytes: &[u8]) -> Result<Self, TreeError> {
        if bytes.is_empty() || bytes.len() % HASH_SIZE != 0 {
            return Err(TreeError::Misaligned);
        }
        let leaves: Vec<TthValue> = bytes
            .chunks_exact(HASH_SIZE)
            .map(|c| {
                let mut b = [0u8; HASH_SIZE];
                b.copy_from_slice(c);
                TthValue(b)
            })
            .collect();
        let block_size = block_size_from_leaf_count(file_size, leaves.len())
            .ok_or(TreeError::LeafCount(leaves.len(), file_size))?;
        let tree = Self::from_leaves(file_size, block_size, leaves)?;
        if tree.root != root {
            return Err(TreeError::RootMismatch);
        }
        Ok(tree)
    }

    pub fn tthl_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.leaves.len() * HASH_SIZE);
        for leaf in &self.leaves {
            out.extend_from_slice(leaf.as_bytes());
        }
        out
    }

    pub fn block_count(&self) -> usize {
        self.leaves.len()
    }

    /// Byte range `[start, end)` of block `index`.
    pub fn block_range(&self, index: usize) -> (u64, u64) {
        let start = index as u64 * self.block_size;
        let end = (start + self.block_size).min(self.file_size);
        (start, end)
    }

    pub fn verify_block(&self, index: usize, data: &[u8]) -> bool {
        let Some(expected) = self.leaves.get(index) else {
            return false;
        };
        let (start, end) = self.block_range(index);
        if (end - start) as usize != data.len() {
            return false;
        }
        let sub = TigerTree::hash_bytes(data, self.block_size);
        sub.leaves.len() == 1 && sub.leaves[0] == *expected
    }
}
