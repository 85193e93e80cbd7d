use weft_utils::{ObjectCache, Reuse};

/// A fixed-capacity staging buffer with independent read and write
/// positions. Kernel reads land in the free tail; protocol layers consume
/// from the head.
pub struct FixedBuffer {
    data: Box<[u8]>,
    read_pos: usize,
    write_pos: usize,
}

impl FixedBuffer {
    pub fn new(capacity: usize) -> Self {
        Self { data: vec![0; capacity].into_boxed_slice(), read_pos: 0, write_pos: 0 }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Unread bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.write_pos - self.read_pos
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    #[inline]
    pub fn free_size(&self) -> usize {
        self.capacity() - self.write_pos
    }

    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data[self.read_pos..self.write_pos]
    }

    #[inline]
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.read_pos..self.write_pos]
    }

    /// The writable tail.
    #[inline]
    pub fn free_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.write_pos..]
    }

    #[inline]
    pub fn advance_read(&mut self, n: usize) {
        assert!(self.read_pos + n <= self.write_pos, "read past written data");
        self.read_pos += n;
        if self.read_pos == self.write_pos {
            self.clear();
        }
    }

    #[inline]
    pub fn advance_write(&mut self, n: usize) {
        assert!(self.write_pos + n <= self.capacity(), "write past capacity");
        self.write_pos += n;
    }

    /// Appends as much of `bytes` as fits, returning the count taken.
    #[inline]
    pub fn write(&mut self, bytes: &[u8]) -> usize {
        let n = bytes.len().min(self.free_size());
        self.data[self.write_pos..self.write_pos + n].copy_from_slice(&bytes[..n]);
        self.write_pos += n;
        n
    }

    #[inline]
    pub fn clear(&mut self) {
        self.read_pos = 0;
        self.write_pos = 0;
    }
}

impl Reuse for FixedBuffer {
    fn reset(&mut self) {
        self.clear();
    }
}

/// The reactor's pool of staging buffers. Buffers keep their allocation
/// while parked; at most `CAP` are retained.
pub struct BufferPool {
    cache: ObjectCache<FixedBuffer>,
    buf_size: usize,
}

impl BufferPool {
    const CAP: usize = 256;

    pub fn new(buf_size: usize) -> Self {
        Self { cache: ObjectCache::new(Self::CAP), buf_size }
    }

    #[inline]
    pub fn get(&mut self) -> Box<FixedBuffer> {
        let size = self.buf_size;
        self.cache.get_with(|| FixedBuffer::new(size))
    }

    #[inline]
    pub fn put(&mut self, buf: Box<FixedBuffer>) {
        self.cache.put(buf);
    }

    #[inline]
    pub fn parked(&self) -> usize {
        self.cache.parked()
    }
}
