//! Fixed-size kernel object tables.
//!
//! Slots are addressed by a [`Handle`] carrying the slot generation. Freeing
//! a slot bumps its generation, so handles to a deleted object keep failing
//! even after the slot has been reused.
use crate::Error;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) struct Handle {
    index: u8,
    generation: u16,
}

struct Slot<T> {
    generation: u16,
    item: Option<T>,
}

pub(crate) struct Pool<T, const N: usize> {
    slots: [Slot<T>; N],
}

impl<T, const N: usize> Pool<T, N> {
    const INDEX_FITS: () = assert!(N <= u8::MAX as usize, "too many pool slots");

    pub const fn new() -> Self {
        let () = Self::INDEX_FITS;
        Self {
            slots: [const {
                Slot {
                    generation: 0,
                    item: None,
                }
            }; N],
        }
    }

    pub fn insert(&mut self, item: T) -> Result<Handle, Error> {
        let (index, slot) = self
            .slots
            .iter_mut()
            .enumerate()
            .find(|(_, slot)| slot.item.is_none())
            .ok_or(Error::NoMemorySlots)?;
        slot.item = Some(item);
        Ok(Handle {
            index: index as u8,
            generation: slot.generation,
        })
    }

    pub fn get(&self, handle: Handle) -> Option<&T> {
        let slot = self.slots.get(usize::from(handle.index))?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.item.as_ref()
    }

    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut T> {
        let slot = self.slots.get_mut(usize::from(handle.index))?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.item.as_mut()
    }

    /// Frees the slot and invalidates every handle to it.
    pub fn remove(&mut self, handle: Handle) -> Option<T> {
        let slot = self.slots.get_mut(usize::from(handle.index))?;
        if slot.generation != handle.generation {
            return None;
        }
        let item = slot.item.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        Some(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhaustion_reports_no_memory_slots() {
        let mut pool: Pool<u32, 2> = Pool::new();
        pool.insert(1).unwrap();
        pool.insert(2).unwrap();
        assert_eq!(pool.insert(3), Err(Error::NoMemorySlots));
    }

    #[test]
    fn stale_handle_does_not_reach_reused_slot() {
        let mut pool: Pool<u32, 1> = Pool::new();
        let old = pool.insert(1).unwrap();
        assert_eq!(pool.remove(old), Some(1));
        assert_eq!(pool.remove(old), None);

        let new = pool.insert(2).unwrap();
        assert_ne!(old, new);
        assert_eq!(pool.get(old), None);
        assert_eq!(pool.get_mut(old), None);
        assert_eq!(pool.get(new), Some(&2));
    }
}
