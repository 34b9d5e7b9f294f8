use thiserror::Error;

pub const APERTURE_ALIGN: u64 = 4096;

/// Round `value` up to the nearest multiple of `alignment`.
///
/// `alignment` must be > 0. Saturates instead of overflowing.
pub(crate) fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment > 0);
    match value.checked_add(alignment - 1) {
        Some(v) => v / alignment * alignment,
        None => u64::MAX / alignment * alignment,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ApertureError {
    #[error("zero-sized allocation")]
    ZeroSize,

    #[error("aperture exhausted (requested {size} bytes, {free} free)")]
    OutOfMemory { size: u64, free: u64 },
}

/// First-fit allocator over a fixed GPU address range.
///
/// Tracks addresses only; nothing is backed by real memory.
#[derive(Clone)]
pub struct Aperture {
    base: u64,
    size: u64,
    // Sorted by address, never adjacent (neighbours are merged on free).
    free: Vec<(u64, u64)>,
}

impl Aperture {
    pub fn new(base: u64, size: u64) -> Self {
        let free = if size == 0 { Vec::new() } else { vec![(base, size)] };
        Self { base, size, free }
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn free_bytes(&self) -> u64 {
        self.free.iter().map(|&(_, len)| len).sum()
    }

    pub fn used(&self) -> u64 {
        self.size - self.free_bytes()
    }

    /// Bytes actually reserved for a request of `size`.
    pub fn reserved_size(size: u64) -> u64 {
        align_up(size, APERTURE_ALIGN)
    }

    pub fn alloc(&mut self, size: u64) -> Result<u64, ApertureError> {
        if size == 0 {
            return Err(ApertureError::ZeroSize);
        }
        let size = Self::reserved_size(size);
        let index = self
            .free
            .iter()
            .position(|&(_, len)| len >= size)
            .ok_or(ApertureError::OutOfMemory {
                size,
                free: self.free_bytes(),
            })?;

        let (addr, len) = self.free[index];
        if len == size {
            self.free.remove(index);
        } else {
            self.free[index] = (addr + size, len - size);
        }
        Ok(addr)
    }

    /// Return a range handed out by [`Aperture::alloc`] with the same `size`.
    pub fn free(&mut self, addr: u64, size: u64) {
        let size = Self::reserved_size(size);
        if size == 0 {
            return;
        }
        let index = self.free.partition_point(|&(start, _)| start < addr);
        self.free.insert(index, (addr, size));

        // Merge with the following range, then with the preceding one.
        if index + 1 < self.free.len() {
            let (start, len) = self.free[index];
            let (next_start, next_len) = self.free[index + 1];
            if start + len == next_start {
                self.free[index] = (start, len + next_len);
                self.free.remove(index + 1);
            }
        }
        if index > 0 {
            let (prev_start, prev_len) = self.free[index - 1];
            let (start, len) = self.free[index];
            if prev_start + prev_len == start {
                self.free[index - 1] = (prev_start, prev_len + len);
                self.free.remove(index);
            }
        }
    }
}

impl std::fmt::Debug for Aperture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Aperture")
            .field("base", &format_args!("{:#x}", self.base))
            .field("size", &self.size)
            .field("free_ranges", &self.free.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_rounds_to_multiple() {
        assert_eq!(align_up(0, 4096), 0);
        assert_eq!(align_up(1, 4096), 4096);
        assert_eq!(align_up(4096, 4096), 4096);
        assert_eq!(align_up(u64::MAX, 4096), u64::MAX / 4096 * 4096);
    }

    #[test]
    fn allocations_are_page_aligned_and_first_fit() {
        let mut ap = Aperture::new(0x1_0000_0000, 64 * 1024);
        let a = ap.alloc(1).unwrap();
        let b = ap.alloc(5000).unwrap();
        assert_eq!(a, 0x1_0000_0000);
        assert_eq!(b, 0x1_0000_1000);
        assert_eq!(ap.used(), 3 * 4096);

        ap.free(a, 1);
        // The hole at the front is reused first.
        assert_eq!(ap.alloc(4096).unwrap(), a);
    }

    #[test]
    fn exhaustion_is_reported() {
        let mut ap = Aperture::new(0, 8192);
        ap.alloc(8192).unwrap();
        assert_eq!(
            ap.alloc(1),
            Err(ApertureError::OutOfMemory { size: 4096, free: 0 })
        );
        assert_eq!(ap.alloc(0), Err(ApertureError::ZeroSize));
    }

    #[test]
    fn freed_neighbours_coalesce() {
        let mut ap = Aperture::new(0, 4 * 4096);
        let blocks: Vec<u64> = (0..4).map(|_| ap.alloc(4096).unwrap()).collect();
        ap.free(blocks[1], 4096);
        ap.free(blocks[3], 4096);
        ap.free(blocks[2], 4096);
        ap.free(blocks[0], 4096);
        assert_eq!(ap.used(), 0);
        assert_eq!(ap.alloc(4 * 4096).unwrap(), 0);
    }
}
