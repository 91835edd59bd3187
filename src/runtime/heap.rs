//! Word arena with an explicit free list.
//!
//! Freed blocks go into a max-heap ordered by length. Allocation looks at a
//! bounded number of the largest free blocks, takes the smallest of those that
//! fits and returns the unused tail to the free list; when none fits the arena
//! grows at its end. Blocks are never coalesced.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use thiserror::Error;
use tracing::trace;

/// Set on every heap address; a clear top bit means a value-stack index.
pub const HEAP_BIT: u32 = 1 << 31;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HeapError {
    #[error("heap exhausted: {requested} words requested, limit is {limit} words")]
    Exhausted { requested: u32, limit: usize },
    #[error("heap access out of bounds: {length} words at {index}")]
    OutOfBounds { index: u32, length: u32 },
    #[error("double free: {length} words at {index} are already free")]
    DoubleFree { index: u32, length: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FreeChunk {
    index: u32,
    length: u32,
}

impl Ord for FreeChunk {
    fn cmp(&self, other: &Self) -> Ordering {
        self.length
            .cmp(&other.length)
            .then_with(|| other.index.cmp(&self.index))
    }
}

impl PartialOrd for FreeChunk {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone)]
pub struct Heap {
    words: Vec<u32>,
    free: BinaryHeap<FreeChunk>,
    max_words: usize,
    scan_limit: usize,
}

impl Heap {
    pub fn new(initial_words: usize, max_words: usize, scan_limit: usize) -> Self {
        Heap {
            words: Vec::with_capacity(initial_words.min(max_words)),
            free: BinaryHeap::new(),
            max_words,
            scan_limit: scan_limit.max(1),
        }
    }

    /// Words handed out so far, free or not.
    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn free_chunks(&self) -> usize {
        self.free.len()
    }

    pub fn free_words(&self) -> usize {
        self.free.iter().map(|c| c.length as usize).sum()
    }

    /// Returns the index of a zeroed block of `length` words. Zero-length
    /// requests get a one-word block so every allocation has its own index.
    pub fn allocate(&mut self, length: u32) -> Result<u32, HeapError> {
        let length = length.max(1);
        let index = match self.take_free(length) {
            Some(index) => index,
            None => self.grow(length)?,
        };
        self.words[index as usize..(index + length) as usize].fill(0);
        Ok(index)
    }

    /// Returns a block to the free list. `length` must be the length it was
    /// allocated with. Fails if any part of the range is already free.
    pub fn deallocate(&mut self, index: u32, length: u32) -> Result<(), HeapError> {
        let length = length.max(1);
        self.check(index, length)?;
        let end = index + length;
        if self
            .free
            .iter()
            .any(|chunk| chunk.index < end && index < chunk.index + chunk.length)
        {
            return Err(HeapError::DoubleFree { index, length });
        }
        self.free.push(FreeChunk { index, length });
        Ok(())
    }

    fn take_free(&mut self, length: u32) -> Option<u32> {
        if self.free.peek().is_none_or(|top| top.length < length) {
            return None;
        }

        // largest first: keep popping while chunks still fit
        let mut scanned = Vec::with_capacity(self.scan_limit);
        while scanned.len() < self.scan_limit {
            match self.free.peek() {
                Some(top) if top.length >= length => {
                    if let Some(chunk) = self.free.pop() {
                        scanned.push(chunk);
                    }
                }
                _ => break,
            }
        }
        let chosen = scanned.pop()?;
        self.free.extend(scanned);

        if chosen.length > length {
            self.free.push(FreeChunk {
                index: chosen.index + length,
                length: chosen.length - length,
            });
        }
        Some(chosen.index)
    }

    fn grow(&mut self, length: u32) -> Result<u32, HeapError> {
        let index = self.words.len();
        let end = index + length as usize;
        if end > self.max_words {
            return Err(HeapError::Exhausted {
                requested: length,
                limit: self.max_words,
            });
        }
        self.words.resize(end, 0);
        trace!(words = end, "heap grew");
        Ok(index as u32)
    }

    fn check(&self, index: u32, length: u32) -> Result<(), HeapError> {
        let end = index as usize + length as usize;
        if end > self.words.len() {
            return Err(HeapError::OutOfBounds { index, length });
        }
        Ok(())
    }

    pub fn read(&self, index: u32) -> Result<u32, HeapError> {
        self.words
            .get(index as usize)
            .copied()
            .ok_or(HeapError::OutOfBounds { index, length: 1 })
    }

    pub fn write(&mut self, index: u32, value: u32) -> Result<(), HeapError> {
        match self.words.get_mut(index as usize) {
            Some(word) => {
                *word = value;
                Ok(())
            }
            None => Err(HeapError::OutOfBounds { index, length: 1 }),
        }
    }

    pub fn slice(&self, index: u32, length: u32) -> Result<&[u32], HeapError> {
        self.check(index, length)?;
        Ok(&self.words[index as usize..index as usize + length as usize])
    }

    pub fn slice_mut(&mut self, index: u32, length: u32) -> Result<&mut [u32], HeapError> {
        self.check(index, length)?;
        Ok(&mut self.words[index as usize..index as usize + length as usize])
    }

    /// Copies `length` words inside the arena; the ranges may overlap.
    pub fn copy_within(&mut self, from: u32, to: u32, length: u32) -> Result<(), HeapError> {
        self.check(from, length)?;
        self.check(to, length)?;
        let from = from as usize;
        self.words
            .copy_within(from..from + length as usize, to as usize);
        Ok(())
    }

    /// Drops every block and releases the buffer.
    pub fn clear(&mut self) {
        self.words = Vec::new();
        self.free.clear();
    }
}
