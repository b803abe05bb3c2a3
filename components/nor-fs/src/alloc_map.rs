//! Lookahead bitmap of the block allocator.
//!
//! The bitmap covers a window of blocks starting at `start`. A set bit means
//! the block is in use, either reachable at the last refill or handed out
//! since. `ack` counts how many more blocks may be examined before the
//! allocator has seen the whole device without any commit in between.

use generic_array::{ArrayLength, GenericArray};

pub(crate) struct Lookahead<N: ArrayLength<u8>> {
    bits: GenericArray<u8, N>,
    start: u32,
    size: u32,
    next: u32,
    ack: u32,
    filled: bool,
}

pub(crate) enum Step {
    Found(u32),
    /// The window is used up or was never filled.
    Refill,
    Exhausted,
}

impl<N: ArrayLength<u8>> Lookahead<N> {
    pub fn new(cursor: u32, block_count: u32) -> Self {
        let window = (N::USIZE as u32 * 8).min(block_count);
        Self {
            bits: GenericArray::default(),
            start: cursor % block_count,
            size: window,
            next: 0,
            ack: block_count,
            filled: false,
        }
    }

    /// Position the next scan starts from, persisted across mounts.
    pub fn cursor(&self, block_count: u32) -> u32 {
        (self.start + self.next) % block_count
    }

    pub fn ack(&mut self, block_count: u32) {
        self.ack = block_count;
    }

    pub fn step(&mut self, block_count: u32) -> Step {
        if self.filled {
            while self.next < self.size {
                if self.ack == 0 {
                    return Step::Exhausted;
                }
                let i = self.next;
                self.next += 1;
                self.ack -= 1;
                if self.bits[(i / 8) as usize] & (1 << (i % 8)) == 0 {
                    self.bits[(i / 8) as usize] |= 1 << (i % 8);
                    return Step::Found((self.start + i) % block_count);
                }
            }
            self.start = (self.start + self.size) % block_count;
            self.filled = false;
        }
        if self.ack == 0 {
            Step::Exhausted
        } else {
            Step::Refill
        }
    }

    /// Clears the window at the current start, ready for [`Self::mark`].
    pub fn begin_refill(&mut self) {
        self.bits.iter_mut().for_each(|b| *b = 0);
        self.next = 0;
        self.filled = true;
    }

    pub fn mark(&mut self, block: u32, block_count: u32) {
        let rel = (block + block_count - self.start) % block_count;
        if rel < self.size {
            self.bits[(rel / 8) as usize] |= 1 << (rel % 8);
        }
    }

    /// Forgets the window, the next allocation rescans.
    pub fn invalidate(&mut self) {
        self.filled = false;
        self.next = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use generic_array::typenum::U1;

    fn fill(map: &mut Lookahead<U1>, used: &[u32], count: u32) {
        map.begin_refill();
        for &b in used {
            map.mark(b, count);
        }
    }

    #[test]
    fn hands_out_free_blocks_in_window_order() {
        let mut map = Lookahead::<U1>::new(4, 20);
        assert!(matches!(map.step(20), Step::Refill));
        fill(&mut map, &[4, 6], 20);
        assert!(matches!(map.step(20), Step::Found(5)));
        assert!(matches!(map.step(20), Step::Found(7)));
        assert_eq!(map.cursor(20), 8);
    }

    #[test]
    fn window_wraps_around_the_device() {
        let mut map = Lookahead::<U1>::new(16, 20);
        assert!(matches!(map.step(20), Step::Refill));
        fill(&mut map, &[16, 17, 18, 19, 0, 1], 20);
        assert!(matches!(map.step(20), Step::Found(2)));
    }

    #[test]
    fn exhausts_after_one_pass() {
        let mut map = Lookahead::<U1>::new(0, 8);
        assert!(matches!(map.step(8), Step::Refill));
        fill(&mut map, &[0, 1, 2, 3, 4, 5, 6, 7], 8);
        assert!(matches!(map.step(8), Step::Exhausted));

        map.ack(8);
        assert!(matches!(map.step(8), Step::Refill));
    }
}
