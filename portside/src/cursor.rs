//! Fixed-capacity read buffer with position/limit semantics.
//!
//! One `ByteCursor` per connection holds bytes between a socket read and
//! the parser. The invariant is that `[position, limit)` is unconsumed
//! input; after a partial parse, [`ByteCursor::compact`] shifts that
//! window back to offset zero so the spare tail can take the next read.

pub struct ByteCursor {
    buf: Box<[u8]>,
    position: usize,
    limit: usize,
}

impl ByteCursor {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity].into_boxed_slice(),
            position: 0,
            limit: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Unconsumed bytes.
    pub fn unread(&self) -> &[u8] {
        &self.buf[self.position..self.limit]
    }

    pub fn is_empty(&self) -> bool {
        self.position == self.limit
    }

    /// No spare room remains even after compacting.
    pub fn is_full(&self) -> bool {
        self.limit - self.position == self.buf.len()
    }

    /// Mark `n` unread bytes as consumed.
    pub fn consume(&mut self, n: usize) {
        debug_assert!(self.position + n <= self.limit);
        self.position += n;
        if self.position == self.limit {
            self.position = 0;
            self.limit = 0;
        }
    }

    /// Writable tail for the next socket read. Call [`Self::advance`]
    /// with the byte count actually read.
    pub fn spare_mut(&mut self) -> &mut [u8] {
        if self.limit == self.buf.len() && self.position > 0 {
            self.compact();
        }
        &mut self.buf[self.limit..]
    }

    /// Extend the unread window after a read into [`Self::spare_mut`].
    pub fn advance(&mut self, n: usize) {
        debug_assert!(self.limit + n <= self.buf.len());
        self.limit += n;
    }

    /// Move `[position, limit)` to offset zero.
    pub fn compact(&mut self) {
        if self.position == 0 {
            return;
        }
        self.buf.copy_within(self.position..self.limit, 0);
        self.limit -= self.position;
        self.position = 0;
    }

    pub fn clear(&mut self) {
        self.position = 0;
        self.limit = 0;
    }
}

impl std::fmt::Debug for ByteCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteCursor")
            .field("position", &self.position)
            .field("limit", &self.limit)
            .field("capacity", &self.buf.len())
            .finish()
    }
}
