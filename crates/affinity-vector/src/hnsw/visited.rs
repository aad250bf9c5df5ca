//! Generation-stamped visited set for graph traversal.

/// Visited set backed by a `u16` stamp per node.
///
/// `clear()` bumps the current generation instead of zeroing the array; the
/// array is only wiped when the generation wraps.
#[derive(Debug)]
pub struct VisitedSet {
    stamps: Vec<u16>,
    generation: u16,
}

impl VisitedSet {
    pub fn new(capacity: usize) -> Self {
        Self {
            stamps: vec![0u16; capacity],
            generation: 1,
        }
    }

    pub fn clear(&mut self) {
        if self.generation == u16::MAX {
            self.stamps.fill(0);
            self.generation = 1;
        } else {
            self.generation += 1;
        }
    }

    pub fn capacity(&self) -> usize {
        self.stamps.len()
    }

    /// Grow to cover at least `capacity` nodes.
    pub fn ensure_capacity(&mut self, capacity: usize) {
        if capacity > self.stamps.len() {
            self.stamps.resize(capacity, 0);
        }
    }

    /// Mark `id` visited. Returns `true` the first time per generation.
    #[inline]
    pub fn insert(&mut self, id: u32) -> bool {
        let slot = &mut self.stamps[id as usize];
        if *slot == self.generation {
            false
        } else {
            *slot = self.generation;
            true
        }
    }
}

impl Default for VisitedSet {
    fn default() -> Self {
        Self::new(0)
    }
}
