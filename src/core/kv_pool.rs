//! Paged KV pool.
//!
//! Reference [`CachePool`] that hands out fixed-size pages from a free list,
//! the way an operating system hands out physical memory pages. Each slot
//! keeps a page table; a slot grows by one page whenever its length crosses a
//! page boundary.
//!
//! ## Example
//!
//! ```
//! use multi_lora::core::cache::CachePool;
//! use multi_lora::core::kv_pool::PagedKvPool;
//!
//! let mut pool = PagedKvPool::new(8, 16).unwrap();
//!
//! let slot = pool.acquire(20).unwrap(); // 2 pages
//! assert_eq!(pool.num_free_pages(), 6);
//!
//! pool.release(slot).unwrap();
//! assert_eq!(pool.num_free_pages(), 8);
//! ```

use std::collections::{HashMap, VecDeque};

use super::cache::{CachePool, SlotId};
use crate::config::CacheConfig;
use crate::error::{Error, Result};

/// Compute the number of pages needed to hold `num_tokens` positions.
pub fn compute_num_pages(num_tokens: usize, page_len: usize) -> usize {
    num_tokens.div_ceil(page_len)
}

#[derive(Debug)]
struct SlotEntry {
    pages: Vec<usize>,
    len: usize,
}

/// In-memory paged pool.
#[derive(Debug)]
pub struct PagedKvPool {
    /// Free page ids (FIFO).
    free_list: VecDeque<usize>,
    /// Live slots by id.
    slots: HashMap<SlotId, SlotEntry>,
    /// Tokens per page.
    page_len: usize,
    /// Total pages.
    num_pages: usize,
    next_slot_id: SlotId,
}

impl PagedKvPool {
    /// Create a pool of `num_pages` pages holding `page_len` tokens each.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when `page_len` is zero.
    pub fn new(num_pages: usize, page_len: usize) -> Result<Self> {
        if page_len == 0 {
            return Err(Error::Config("cache.page_len must be > 0".into()));
        }
        Ok(Self {
            free_list: (0..num_pages).collect(),
            slots: HashMap::new(),
            page_len,
            num_pages,
            next_slot_id: 0,
        })
    }

    /// Create a pool from configuration.
    pub fn from_config(config: &CacheConfig) -> Result<Self> {
        Self::new(config.num_pages, config.page_len)
    }

    /// Tokens per page.
    pub fn page_len(&self) -> usize {
        self.page_len
    }

    /// Total number of pages.
    pub fn num_pages(&self) -> usize {
        self.num_pages
    }

    /// Number of free pages.
    pub fn num_free_pages(&self) -> usize {
        self.free_list.len()
    }

    /// Number of live slots.
    pub fn num_slots(&self) -> usize {
        self.slots.len()
    }

    /// Page table of a live slot.
    pub fn page_table(&self, slot: SlotId) -> Option<&[usize]> {
        self.slots.get(&slot).map(|entry| entry.pages.as_slice())
    }

    fn exhausted(&self, pages: usize) -> Error {
        Error::CacheExhausted(format!(
            "{pages} pages requested, {} of {} free",
            self.free_list.len(),
            self.num_pages
        ))
    }

    fn needs_new_page(&self, entry: &SlotEntry) -> bool {
        entry.len + 1 > entry.pages.len() * self.page_len
    }
}

impl CachePool for PagedKvPool {
    fn acquire(&mut self, len: usize) -> Result<SlotId> {
        let pages_needed = compute_num_pages(len, self.page_len);
        if pages_needed > self.free_list.len() {
            return Err(self.exhausted(pages_needed));
        }

        let pages: Vec<usize> = self.free_list.drain(..pages_needed).collect();
        let id = self.next_slot_id;
        self.next_slot_id += 1;
        self.slots.insert(id, SlotEntry { pages, len });
        Ok(id)
    }

    fn extend(&mut self, slot: SlotId) -> Result<()> {
        let entry = self.slots.get(&slot).ok_or(Error::SlotReleased(slot))?;
        let new_page = if self.needs_new_page(entry) {
            Some(self.free_list.pop_front().ok_or_else(|| self.exhausted(1))?)
        } else {
            None
        };

        let entry = self.slots.get_mut(&slot).ok_or(Error::SlotReleased(slot))?;
        entry.pages.extend(new_page);
        entry.len += 1;
        Ok(())
    }

    fn release(&mut self, slot: SlotId) -> Result<()> {
        let entry = self.slots.remove(&slot).ok_or(Error::DoubleRelease(slot))?;
        self.free_list.extend(entry.pages);
        Ok(())
    }

    fn slot_len(&self, slot: SlotId) -> Option<usize> {
        self.slots.get(&slot).map(|entry| entry.len)
    }

    fn can_extend(&self, slots: &[SlotId]) -> bool {
        let pages_needed = slots
            .iter()
            .filter_map(|id| self.slots.get(id))
            .filter(|entry| self.needs_new_page(entry))
            .count();
        pages_needed <= self.free_list.len()
    }
}
