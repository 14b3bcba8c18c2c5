/// Fixed-capacity ring keyed by a wrapping sequence number.
///
/// Slots are preallocated and reused, so entries holding buffers keep their
/// allocations when the ring wraps. The capacity must be a power of two so
/// that both 16 and 32 bit sequence spaces map onto the ring consistently
/// across wraparound.
#[derive(Debug)]
pub struct SequenceBuffer<T> {
    tags: Vec<Option<u32>>,
    slots: Vec<T>,
}

impl<T: Default> SequenceBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(
            capacity.is_power_of_two() && capacity <= 1 << 16,
            "sequence buffer capacity {capacity} must be a power of two no larger than 65536"
        );
        Self {
            tags: vec![None; capacity],
            slots: (0..capacity).map(|_| T::default()).collect(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    fn index(&self, sequence: u32) -> usize {
        sequence as usize & (self.slots.len() - 1)
    }

    pub fn contains(&self, sequence: u32) -> bool {
        self.tags[self.index(sequence)] == Some(sequence)
    }

    /// Sequence currently stored in the slot `sequence` maps to.
    pub fn occupant(&self, sequence: u32) -> Option<u32> {
        self.tags[self.index(sequence)]
    }

    pub fn get(&self, sequence: u32) -> Option<&T> {
        let index = self.index(sequence);
        (self.tags[index] == Some(sequence)).then(|| &self.slots[index])
    }

    pub fn get_mut(&mut self, sequence: u32) -> Option<&mut T> {
        let index = self.index(sequence);
        if self.tags[index] == Some(sequence) {
            Some(&mut self.slots[index])
        } else {
            None
        }
    }

    /// Claims the slot for `sequence` and hands back its storage untouched.
    ///
    /// Whatever the slot held before is overwritten in place; callers reset
    /// the contents they care about.
    pub fn acquire(&mut self, sequence: u32) -> &mut T {
        let index = self.index(sequence);
        self.tags[index] = Some(sequence);
        &mut self.slots[index]
    }

    pub fn insert(&mut self, sequence: u32, value: T) {
        *self.acquire(sequence) = value;
    }

    pub fn remove(&mut self, sequence: u32) -> Option<T> {
        let index = self.index(sequence);
        if self.tags[index] == Some(sequence) {
            self.tags[index] = None;
            Some(std::mem::take(&mut self.slots[index]))
        } else {
            None
        }
    }

    /// Removes whatever entry occupies the slot `sequence` maps to.
    pub fn evict(&mut self, sequence: u32) -> Option<(u32, T)> {
        let index = self.index(sequence);
        let tag = self.tags[index].take()?;
        Some((tag, std::mem::take(&mut self.slots[index])))
    }

    pub fn sequences(&self) -> impl Iterator<Item = u32> + '_ {
        self.tags.iter().filter_map(|tag| *tag)
    }

    pub fn clear(&mut self) {
        for tag in &mut self.tags {
            *tag = None;
        }
    }

    pub fn len(&self) -> usize {
        self.tags.iter().filter(|t| t.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
