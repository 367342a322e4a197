//! Cache slot management.
//!
//! A [`CachePool`] owns the physical KV storage. The scheduler never talks to
//! the pool directly; it goes through [`CacheSlotManager`], which hands out
//! [`SlotHandle`]s carrying a released flag so that a slot cannot be freed
//! twice or touched after it was freed.
//!
//! ## Slot lifecycle
//!
//! ```text
//!   acquire(prompt_len) ──► extend_by_one() × N ──► release()
//!          │                                            │
//!          └──── owned by exactly one session ──────────┘
//! ```

use std::fmt;

use tracing::trace;

use crate::error::{Error, Result};

/// Opaque identifier of a slot inside a pool.
pub type SlotId = u64;

/// External KV cache pool contract.
pub trait CachePool {
    /// Reserve a slot holding `len` positions.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CacheExhausted`] when the pool cannot satisfy the request.
    fn acquire(&mut self, len: usize) -> Result<SlotId>;

    /// Grow a slot by one position.
    fn extend(&mut self, slot: SlotId) -> Result<()>;

    /// Return a slot to the pool.
    fn release(&mut self, slot: SlotId) -> Result<()>;

    /// Reserved length of a live slot.
    fn slot_len(&self, slot: SlotId) -> Option<usize>;

    /// Whether every slot in `slots` can grow by one position at once.
    ///
    /// Must be exact: after `true`, one [`extend`](Self::extend) per slot
    /// succeeds. The scheduler checks this before the forward pass and does
    /// not roll back slots extended before a failing `extend`.
    fn can_extend(&self, slots: &[SlotId]) -> bool;
}

/// Exclusively owned handle to a cache slot.
///
/// Not `Clone`: each slot belongs to exactly one session.
pub struct SlotHandle {
    id: SlotId,
    len: usize,
    released: bool,
}

impl SlotHandle {
    /// Pool-side identifier.
    pub fn id(&self) -> SlotId {
        self.id
    }

    /// Logical length (reserved positions).
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the slot holds no positions.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether the slot has been returned to the pool.
    pub fn is_released(&self) -> bool {
        self.released
    }
}

impl fmt::Debug for SlotHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotHandle")
            .field("id", &self.id)
            .field("len", &self.len)
            .field("released", &self.released)
            .finish()
    }
}

/// Thin façade over a [`CachePool`].
#[derive(Debug)]
pub struct CacheSlotManager<P> {
    pool: P,
    live_slots: usize,
}

impl<P: CachePool> CacheSlotManager<P> {
    /// Wrap a pool.
    pub fn new(pool: P) -> Self {
        Self {
            pool,
            live_slots: 0,
        }
    }

    /// Acquire a slot sized for `initial_length` positions.
    ///
    /// Failures are propagated, never retried here.
    pub fn acquire(&mut self, initial_length: usize) -> Result<SlotHandle> {
        let id = self.pool.acquire(initial_length)?;
        self.live_slots += 1;
        trace!(slot = id, len = initial_length, "acquired cache slot");
        Ok(SlotHandle {
            id,
            len: initial_length,
            released: false,
        })
    }

    /// Grow a slot's reserved length by exactly one position.
    pub fn extend_by_one(&mut self, slot: &mut SlotHandle) -> Result<()> {
        if slot.released {
            return Err(Error::SlotReleased(slot.id));
        }
        self.pool.extend(slot.id)?;
        slot.len += 1;
        Ok(())
    }

    /// Whether all given slots can grow by one position.
    pub fn can_extend_all<'a>(&self, slots: impl IntoIterator<Item = &'a SlotHandle>) -> bool {
        let ids: Vec<SlotId> = slots.into_iter().map(SlotHandle::id).collect();
        self.pool.can_extend(&ids)
    }

    /// Return a slot to the pool.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DoubleRelease`] if the handle was already released.
    pub fn release(&mut self, slot: &mut SlotHandle) -> Result<()> {
        if slot.released {
            return Err(Error::DoubleRelease(slot.id));
        }
        self.pool.release(slot.id)?;
        slot.released = true;
        self.live_slots -= 1;
        trace!(slot = slot.id, len = slot.len, "released cache slot");
        Ok(())
    }

    /// Number of slots acquired and not yet released.
    pub fn live_slots(&self) -> usize {
        self.live_slots
    }

    /// Underlying pool.
    pub fn pool(&self) -> &P {
        &self.pool
    }
}
