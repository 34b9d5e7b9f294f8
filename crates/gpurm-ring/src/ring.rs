use thiserror::Error;

/// Smallest ring accepted by [`Ring::with_size_kib`].
pub const MIN_RING_KIB: u32 = 64;
/// Largest ring accepted by [`Ring::with_size_kib`].
pub const MAX_RING_KIB: u32 = 4096;

const WORD_BYTES: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RingError {
    #[error("ring capacity must be non-zero")]
    ZeroCapacity,

    #[error("invalid ring size {kib}KiB ({}-{}KiB allowed)", MIN_RING_KIB, MAX_RING_KIB)]
    InvalidSize { kib: u32 },

    #[error("empty command stream")]
    Empty,

    #[error("command stream too large ({len} > {capacity} words)")]
    TooLarge { len: usize, capacity: usize },

    #[error("offset {offset} out of range for ring of {capacity} words")]
    OffsetOutOfRange { offset: usize, capacity: usize },
}

/// Contiguous range of words placed by one [`Ring::write`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub len: usize,
}

impl Span {
    /// One past the last word written. May equal the ring capacity.
    pub fn end(&self) -> usize {
        self.start + self.len
    }
}

/// Fixed-capacity circular buffer of 32-bit command words.
///
/// Wrap policy: when fewer than `len` words remain before the physical end of the buffer, a
/// write restarts at offset 0. It does not look at the read offset first, so a slow consumer
/// can have unread words overwritten. Producers that care must check [`Ring::free_space`]
/// themselves.
///
/// Free space keeps one word in reserve: equal offsets always mean "empty", and the ring
/// reports at most `capacity - 1` free words.
pub struct Ring {
    words: Box<[u32]>,
    write: usize,
    read: usize,
    fence: u64,
}

impl Ring {
    /// Allocate a zeroed ring holding `capacity` words.
    pub fn new(capacity: usize) -> Result<Self, RingError> {
        if capacity == 0 {
            return Err(RingError::ZeroCapacity);
        }
        Ok(Self {
            words: vec![0u32; capacity].into_boxed_slice(),
            write: 0,
            read: 0,
            fence: 0,
        })
    }

    /// Allocate a ring sized in KiB, as hardware rings are usually configured.
    pub fn with_size_kib(kib: u32) -> Result<Self, RingError> {
        if !(MIN_RING_KIB..=MAX_RING_KIB).contains(&kib) {
            return Err(RingError::InvalidSize { kib });
        }
        Self::new(kib as usize * 1024 / WORD_BYTES)
    }

    pub fn capacity(&self) -> usize {
        self.words.len()
    }

    pub fn write_offset(&self) -> usize {
        self.write
    }

    pub fn read_offset(&self) -> usize {
        self.read
    }

    /// Last fence value handed out by [`Ring::alloc_fence`].
    pub fn fence(&self) -> u64 {
        self.fence
    }

    pub fn is_empty(&self) -> bool {
        self.write == self.read
    }

    /// Words between the read and write offsets.
    pub fn used(&self) -> usize {
        if self.write >= self.read {
            self.write - self.read
        } else {
            self.capacity() - (self.read - self.write)
        }
    }

    /// Words that can be written without overtaking the reader.
    pub fn free_space(&self) -> usize {
        self.capacity() - 1 - self.used()
    }

    /// Whether a write of `len` words would be accepted.
    pub fn check_write(&self, len: usize) -> Result<(), RingError> {
        let capacity = self.capacity();
        if len == 0 {
            return Err(RingError::Empty);
        }
        if len > capacity {
            return Err(RingError::TooLarge { len, capacity });
        }
        Ok(())
    }

    /// Copy `commands` into the ring and advance the write offset.
    pub fn write(&mut self, commands: &[u32]) -> Result<Span, RingError> {
        self.check_write(commands.len())?;
        let capacity = self.capacity();
        let len = commands.len();

        let mut start = self.write;
        if capacity - start < len {
            tracing::warn!(
                write = start,
                read = self.read,
                len,
                "ring full at end of buffer, wrapping to start"
            );
            start = 0;
        }

        self.words[start..start + len].copy_from_slice(commands);
        self.write = (start + len) % capacity;

        tracing::trace!(start, len, write = self.write, "ring write");
        Ok(Span { start, len })
    }

    /// Reserve the next fence value.
    ///
    /// The counter is advanced before any write is attempted, so a returned value is reserved
    /// even if the matching submission never lands.
    pub fn alloc_fence(&mut self) -> u64 {
        self.fence += 1;
        self.fence
    }

    /// Record consumer progress.
    pub fn set_read_offset(&mut self, offset: usize) -> Result<(), RingError> {
        let capacity = self.capacity();
        if offset >= capacity {
            return Err(RingError::OffsetOutOfRange { offset, capacity });
        }
        self.read = offset;
        Ok(())
    }

    /// Words covered by a span previously returned from [`Ring::write`].
    pub fn words(&self, span: Span) -> Option<&[u32]> {
        self.words.get(span.start..span.end())
    }

    /// Zero the buffer, both offsets and the fence counter.
    ///
    /// Only valid when the owning engine has no work in flight.
    pub fn reset(&mut self) {
        self.words.fill(0);
        self.write = 0;
        self.read = 0;
        self.fence = 0;
    }
}

impl std::fmt::Debug for Ring {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ring")
            .field("capacity", &self.capacity())
            .field("write", &self.write)
            .field("read", &self.read)
            .field("fence", &self.fence)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_space_branches_agree() {
        let mut ring = Ring::new(8).unwrap();
        assert_eq!(ring.free_space(), 7);

        ring.write(&[1, 2, 3, 4, 5]).unwrap();
        assert_eq!(ring.used(), 5);
        assert_eq!(ring.free_space(), 2);

        // write (5) < read (6): the reader is ahead of the producer on the lap.
        ring.set_read_offset(6).unwrap();
        assert_eq!(ring.used(), 7);
        assert_eq!(ring.free_space(), 0);

        ring.set_read_offset(5).unwrap();
        assert!(ring.is_empty());
        assert_eq!(ring.free_space(), 7);
    }

    #[test]
    fn size_kib_is_validated() {
        assert_eq!(
            Ring::with_size_kib(32).unwrap_err(),
            RingError::InvalidSize { kib: 32 }
        );
        assert_eq!(
            Ring::with_size_kib(8192).unwrap_err(),
            RingError::InvalidSize { kib: 8192 }
        );
        assert_eq!(Ring::with_size_kib(256).unwrap().capacity(), 65536);
        assert_eq!(Ring::with_size_kib(64).unwrap().capacity(), 16384);
    }

    #[test]
    fn zero_capacity_is_rejected() {
        assert_eq!(Ring::new(0).unwrap_err(), RingError::ZeroCapacity);
    }

    #[test]
    fn read_offset_must_be_in_range() {
        let mut ring = Ring::new(16).unwrap();
        assert_eq!(
            ring.set_read_offset(16),
            Err(RingError::OffsetOutOfRange {
                offset: 16,
                capacity: 16
            })
        );
    }

    #[test]
    fn words_returns_written_span() {
        let mut ring = Ring::new(16).unwrap();
        ring.write(&[9; 14]).unwrap();
        let span = ring.write(&[1, 2, 3]).unwrap();
        assert_eq!(span, Span { start: 0, len: 3 });
        assert_eq!(ring.words(span).unwrap(), &[1, 2, 3]);
    }
}
