//! Fixed pools of open-file and open-directory state.
//!
//! A slot is free while its identifier is 0. Releasing a slot resets the
//! whole slot, so a later `acquire` never sees leftovers of the previous
//! owner, and a handle kept past its release no longer matches the slot.

use crate::error::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct Handle {
    index: u16,
    id: u32,
}

#[derive(Default)]
struct Slot<T> {
    id: u32,
    state: T,
}

pub(crate) struct HandleTable<T, const N: usize> {
    slots: [Slot<T>; N],
    last_id: u32,
}

impl<T: Default, const N: usize> HandleTable<T, N> {
    pub fn new() -> Self {
        Self {
            slots: core::array::from_fn(|_| Slot::default()),
            last_id: 0,
        }
    }

    pub fn acquire(&mut self) -> Result<Handle> {
        let index = self
            .slots
            .iter()
            .position(|slot| slot.id == 0)
            .ok_or(Error::NoHandles)?;
        self.last_id = match self.last_id.wrapping_add(1) {
            0 => 1,
            id => id,
        };
        self.slots[index].id = self.last_id;
        Ok(Handle {
            index: index as u16,
            id: self.last_id,
        })
    }

    fn position(&self, handle: Handle) -> Result<usize> {
        match self.slots.get(handle.index as usize) {
            Some(slot) if slot.id != 0 && slot.id == handle.id => Ok(handle.index as usize),
            _ => Err(Error::BadHandle),
        }
    }

    pub fn get(&self, handle: Handle) -> Result<&T> {
        let index = self.position(handle)?;
        Ok(&self.slots[index].state)
    }

    pub fn get_mut(&mut self, handle: Handle) -> Result<&mut T> {
        let index = self.position(handle)?;
        Ok(&mut self.slots[index].state)
    }

    pub fn release(&mut self, handle: Handle) -> Result<()> {
        let index = self.position(handle)?;
        self.slots[index] = Slot::default();
        Ok(())
    }

    pub fn in_use(&self) -> usize {
        self.slots.iter().filter(|slot| slot.id != 0).count()
    }

    /// Applies `f` to every slot in use, free slots yield `U::default()`.
    pub fn map<U: Default>(&self, f: impl Fn(&T) -> U) -> [U; N] {
        core::array::from_fn(|i| {
            let slot = &self.slots[i];
            if slot.id != 0 {
                f(&slot.state)
            } else {
                U::default()
            }
        })
    }

    pub fn for_each_mut(&mut self, mut f: impl FnMut(&mut T)) {
        for slot in self.slots.iter_mut().filter(|slot| slot.id != 0) {
            f(&mut slot.state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhaustion_and_reuse() {
        let mut table = HandleTable::<u32, 3>::new();
        let a = table.acquire().unwrap();
        let b = table.acquire().unwrap();
        let c = table.acquire().unwrap();
        assert_eq!(table.acquire(), Err(Error::NoHandles));
        assert_eq!(table.in_use(), 3);

        *table.get_mut(b).unwrap() = 42;
        table.release(b).unwrap();
        let d = table.acquire().unwrap();
        assert_eq!(table.get(d), Ok(&0));
        assert_ne!(b, d);

        assert!(table.get(a).is_ok());
        assert!(table.get(c).is_ok());
    }

    #[test]
    fn stale_handles_are_rejected() {
        let mut table = HandleTable::<u32, 1>::new();
        let a = table.acquire().unwrap();
        table.release(a).unwrap();
        assert_eq!(table.release(a), Err(Error::BadHandle));
        assert_eq!(table.get(a), Err(Error::BadHandle));

        let b = table.acquire().unwrap();
        assert_eq!(table.get(a), Err(Error::BadHandle));
        assert!(table.get(b).is_ok());
    }
}
