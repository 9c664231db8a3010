//! # Handles
//!
//! Opaque public handles backed by a generation-checked slot arena.
//!
//! A handle packs a slot index and the slot's generation into one `u64`.
//! Removing an object bumps the generation of its slot, so a stale handle
//! that outlives its object resolves to nothing instead of to whatever
//! object reuses the slot.

use core::fmt;
use core::hash::{Hash, Hasher};
use core::marker::PhantomData;
use std::vec::Vec;

use spin::RwLock;

// =============================================================================
// HANDLE
// =============================================================================

/// Opaque handle naming an object of kind `M`
///
/// The raw value 0 is never issued and is used as the null handle.
#[repr(transparent)]
pub struct Handle<M> {
    raw: u64,
    _marker: PhantomData<fn() -> M>,
}

impl<M> Handle<M> {
    /// Rebuild a handle from its raw value
    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Self {
            raw,
            _marker: PhantomData,
        }
    }

    /// Null handle
    #[inline]
    pub const fn null() -> Self {
        Self::from_raw(0)
    }

    /// Raw value, as stored in hardware-visible structures
    #[inline]
    pub const fn raw(self) -> u64 {
        self.raw
    }

    /// Check if null
    #[inline]
    pub const fn is_null(self) -> bool {
        self.raw == 0
    }

    const fn pack(index: u32, generation: u32) -> Self {
        Self::from_raw(((generation as u64) << 32) | (index as u64 + 1))
    }

    const fn index(self) -> Option<usize> {
        let low = self.raw & 0xFFFF_FFFF;
        if low == 0 {
            None
        } else {
            Some((low - 1) as usize)
        }
    }

    const fn generation(self) -> u32 {
        (self.raw >> 32) as u32
    }
}

impl<M> Clone for Handle<M> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<M> Copy for Handle<M> {}

impl<M> PartialEq for Handle<M> {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl<M> Eq for Handle<M> {}

impl<M> Hash for Handle<M> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.raw.hash(state);
    }
}

impl<M> Default for Handle<M> {
    fn default() -> Self {
        Self::null()
    }
}

impl<M> fmt::Debug for Handle<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = core::any::type_name::<M>();
        let short = name.rsplit("::").next().unwrap_or(name);
        write!(f, "Handle<{}>(0x{:x})", short, self.raw)
    }
}

// =============================================================================
// HANDLE TABLE
// =============================================================================

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

#[derive(Debug)]
struct Slots<T> {
    entries: Vec<Slot<T>>,
    free: Vec<u32>,
    live: usize,
}

/// Generation-checked arena mapping handles to shared objects
///
/// Lookups clone the stored value (normally an `Arc`), so the caller keeps
/// the object alive independently of later removal from the table.
pub struct HandleTable<M, T> {
    slots: RwLock<Slots<T>>,
    _marker: PhantomData<fn() -> M>,
}

impl<M, T: Clone> HandleTable<M, T> {
    /// Create an empty table
    pub const fn new() -> Self {
        Self {
            slots: RwLock::new(Slots {
                entries: Vec::new(),
                free: Vec::new(),
                live: 0,
            }),
            _marker: PhantomData,
        }
    }

    /// Store `value`, returning its handle
    pub fn insert(&self, value: T) -> Handle<M> {
        let mut slots = self.slots.write();
        slots.live += 1;
        if let Some(index) = slots.free.pop() {
            let slot = &mut slots.entries[index as usize];
            debug_assert!(slot.value.is_none());
            slot.value = Some(value);
            return Handle::pack(index, slot.generation);
        }
        let index = slots.entries.len() as u32;
        slots.entries.push(Slot {
            generation: 0,
            value: Some(value),
        });
        Handle::pack(index, 0)
    }

    /// Resolve a handle
    pub fn get(&self, handle: Handle<M>) -> Option<T> {
        let index = handle.index()?;
        let slots = self.slots.read();
        let slot = slots.entries.get(index)?;
        if slot.generation != handle.generation() {
            return None;
        }
        slot.value.clone()
    }

    /// Check whether a handle names a live object
    pub fn contains(&self, handle: Handle<M>) -> bool {
        self.get(handle).is_some()
    }

    /// Remove the object named by `handle`
    pub fn remove(&self, handle: Handle<M>) -> Option<T> {
        let index = handle.index()?;
        let mut slots = self.slots.write();
        let slot = slots.entries.get_mut(index)?;
        if slot.generation != handle.generation() {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        slots.free.push(index as u32);
        slots.live -= 1;
        Some(value)
    }

    /// Remove every object, returning them with their handles
    pub fn drain(&self) -> Vec<(Handle<M>, T)> {
        let mut slots = self.slots.write();
        let mut drained = Vec::with_capacity(slots.live);
        let mut freed = Vec::new();
        for (index, slot) in slots.entries.iter_mut().enumerate() {
            if let Some(value) = slot.value.take() {
                drained.push((Handle::pack(index as u32, slot.generation), value));
                slot.generation = slot.generation.wrapping_add(1);
                freed.push(index as u32);
            }
        }
        slots.free.extend(freed);
        slots.live = 0;
        drained
    }

    /// Snapshot of all live objects
    pub fn values(&self) -> Vec<T> {
        self.slots
            .read()
            .entries
            .iter()
            .filter_map(|slot| slot.value.clone())
            .collect()
    }

    /// Number of live objects
    pub fn len(&self) -> usize {
        self.slots.read().live
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<M, T> fmt::Debug for HandleTable<M, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slots = self.slots.read();
        f.debug_struct("HandleTable")
            .field("live", &slots.live)
            .field("capacity", &slots.entries.len())
            .finish()
    }
}

impl<M, T: Clone> Default for HandleTable<M, T> {
    fn default() -> Self {
        Self::new()
    }
}
