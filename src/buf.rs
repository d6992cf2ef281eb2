//! Linked-block byte buffer shared between continuations and connections.
//!
//! [`ChainBuffer`] is a bounded chain of fixed-size blocks with two
//! capabilities:
//!
//! - **writer**: the append region. [`ChainBuffer::write_avail`] reports
//!   remaining capacity, [`ChainBuffer::writable_chunks`] exposes spare
//!   block regions for a vectored read syscall, and
//!   [`ChainBuffer::fill`] commits bytes the kernel wrote.
//! - **reader**: the consume region. [`ChainBuffer::read_avail`] reports
//!   buffered bytes, [`ChainBuffer::readable_chunks`] exposes filled
//!   regions (honoring a start offset) for a vectored write syscall, and
//!   [`ChainBuffer::consume`] releases bytes the kernel accepted.
//!
//! Fully consumed full blocks are released eagerly, so a long-lived
//! connection does not accumulate storage proportional to bytes moved.
//!
//! The shared form is [`BufHandle`]: the producer continuation, the
//! consumer continuation, and the connection's I/O paths each hold a
//! clone. Access ordering is governed by the VIO mutex discipline; the
//! inner mutex is what makes the sharing sound. It is a leaf lock: do
//! not call handler or connection APIs while holding it.

use parking_lot::Mutex;
use smallvec::SmallVec;
use std::collections::VecDeque;
use std::sync::Arc;

use crate::config::DEFAULT_BLOCK_SIZE;

/// Upper bound on iovec entries per scatter/gather syscall.
pub const NET_MAX_IOV: usize = 16;

/// A chain buffer behind a mutex, cloneable across threads.
pub type BufHandle = Arc<Mutex<ChainBuffer>>;

/// Creates a shared chain buffer holding at most `limit` unconsumed bytes.
#[must_use]
pub fn chain_buffer(limit: usize) -> BufHandle {
    Arc::new(Mutex::new(ChainBuffer::new(limit)))
}

/// Creates a shared chain buffer with an explicit block size.
#[must_use]
pub fn chain_buffer_with_block_size(limit: usize, block_size: usize) -> BufHandle {
    Arc::new(Mutex::new(ChainBuffer::with_block_size(limit, block_size)))
}

/// One fixed-size block. `start..fill` is readable, `fill..len` is spare.
#[derive(Debug)]
struct Block {
    data: Vec<u8>,
    start: usize,
    fill: usize,
}

impl Block {
    fn new(size: usize) -> Self {
        Self {
            data: vec![0; size],
            start: 0,
            fill: 0,
        }
    }

    fn readable(&self) -> usize {
        self.fill - self.start
    }

    fn spare(&self) -> usize {
        self.data.len() - self.fill
    }
}

/// Bounded linked-block byte buffer.
///
/// The chain grows a block at a time as the writer needs room and never
/// holds more than `limit` unconsumed bytes. Blocks keep insertion order,
/// so bytes come out in the order they went in.
#[derive(Debug)]
pub struct ChainBuffer {
    blocks: VecDeque<Block>,
    block_size: usize,
    limit: usize,
}

impl ChainBuffer {
    /// Creates a buffer bounded to `limit` unconsumed bytes, using the
    /// default block size.
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self::with_block_size(limit, DEFAULT_BLOCK_SIZE)
    }

    /// Creates a buffer with an explicit block size.
    ///
    /// # Panics
    ///
    /// Panics if `block_size` is zero.
    #[must_use]
    pub fn with_block_size(limit: usize, block_size: usize) -> Self {
        assert!(block_size > 0, "block size must be non-zero");
        Self {
            blocks: VecDeque::new(),
            block_size,
            limit,
        }
    }

    /// Bytes buffered and not yet consumed.
    #[must_use]
    pub fn read_avail(&self) -> usize {
        self.blocks.iter().map(Block::readable).sum()
    }

    /// Returns true if no bytes are buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read_avail() == 0
    }

    /// Remaining capacity for the writer.
    #[must_use]
    pub fn write_avail(&self) -> usize {
        self.limit - self.read_avail().min(self.limit)
    }

    /// Spare bytes already allocated in the chain.
    fn allocated_spare(&self) -> usize {
        self.blocks.iter().map(Block::spare).sum()
    }

    /// Extends the chain until at least `budget` spare bytes exist.
    fn ensure_writable(&mut self, budget: usize) {
        let mut spare = self.allocated_spare();
        while spare < budget {
            self.blocks.push_back(Block::new(self.block_size));
            spare += self.block_size;
        }
    }

    /// Exposes spare regions for a vectored read, bounded by `budget`
    /// bytes and `max_chunks` entries.
    ///
    /// The regions come back in fill order; committing `n` bytes with
    /// [`fill`](Self::fill) afterward marks exactly the first `n` bytes of
    /// the returned regions as readable. Blocks with no spare room are
    /// skipped.
    pub fn writable_chunks(&mut self, budget: usize, max_chunks: usize) -> SmallVec<[&mut [u8]; NET_MAX_IOV]> {
        let mut budget = budget.min(self.write_avail());
        let mut chunks: SmallVec<[&mut [u8]; NET_MAX_IOV]> = SmallVec::new();
        if budget == 0 {
            return chunks;
        }
        self.ensure_writable(budget);
        for block in self.blocks.iter_mut() {
            if budget == 0 || chunks.len() == max_chunks {
                break;
            }
            if block.spare() == 0 {
                continue;
            }
            let take = block.spare().min(budget);
            let fill = block.fill;
            chunks.push(&mut block.data[fill..fill + take]);
            budget -= take;
        }
        chunks
    }

    /// Commits `n` bytes written into regions previously returned by
    /// [`writable_chunks`](Self::writable_chunks).
    pub fn fill(&mut self, mut n: usize) {
        for block in self.blocks.iter_mut() {
            if n == 0 {
                break;
            }
            let adv = block.spare().min(n);
            block.fill += adv;
            n -= adv;
        }
        debug_assert_eq!(n, 0, "fill past the exposed spare region");
    }

    /// Exposes readable regions for a vectored write, skipping the first
    /// `skip` readable bytes, bounded by `budget` bytes and `max_chunks`
    /// entries.
    pub fn readable_chunks(&self, mut skip: usize, budget: usize, max_chunks: usize) -> SmallVec<[&[u8]; NET_MAX_IOV]> {
        let mut budget = budget;
        let mut chunks: SmallVec<[&[u8]; NET_MAX_IOV]> = SmallVec::new();
        for block in &self.blocks {
            if budget == 0 || chunks.len() == max_chunks {
                break;
            }
            let avail = block.readable();
            if skip >= avail {
                skip -= avail;
                continue;
            }
            let offset = block.start + skip;
            let take = (block.fill - offset).min(budget);
            if take == 0 {
                continue;
            }
            chunks.push(&block.data[offset..offset + take]);
            budget -= take;
            skip = 0;
        }
        chunks
    }

    /// Releases `n` consumed bytes from the front of the chain.
    pub fn consume(&mut self, mut n: usize) {
        debug_assert!(n <= self.read_avail(), "consume past read_avail");
        while n > 0 {
            let Some(block) = self.blocks.front_mut() else { break };
            let adv = block.readable().min(n);
            block.start += adv;
            n -= adv;
            if block.start == block.data.len() {
                self.blocks.pop_front();
            } else if adv == 0 {
                break;
            }
        }
        debug_assert_eq!(n, 0, "consume past read_avail");
    }

    /// Copies bytes into the buffer, returning how many fit.
    pub fn append(&mut self, src: &[u8]) -> usize {
        let n = src.len().min(self.write_avail());
        if n == 0 {
            return 0;
        }
        self.ensure_writable(n);
        let mut copied = 0;
        for block in self.blocks.iter_mut() {
            if copied == n {
                break;
            }
            let take = block.spare().min(n - copied);
            if take == 0 {
                continue;
            }
            block.data[block.fill..block.fill + take].copy_from_slice(&src[copied..copied + take]);
            block.fill += take;
            copied += take;
        }
        n
    }

    /// Copies and consumes up to `max` readable bytes into `out`.
    pub fn read_into(&mut self, out: &mut Vec<u8>, max: usize) -> usize {
        let mut remaining = max.min(self.read_avail());
        let total = remaining;
        while remaining > 0 {
            let Some(block) = self.blocks.front_mut() else { break };
            let take = block.readable().min(remaining);
            out.extend_from_slice(&block.data[block.start..block.start + take]);
            block.start += take;
            remaining -= take;
            if block.start == block.data.len() {
                self.blocks.pop_front();
            }
        }
        total
    }
}
