//! Byte pipe backing memory-engine stream sessions.

/// Fixed-capacity FIFO of bytes.
///
/// Writes are partial when the pipe is nearly full, which is how the
/// memory engine models a bounded receive window.
#[derive(Debug)]
pub(crate) struct RingBuffer<const N: usize> {
    buffer: [u8; N],

    /// Read position.
    head: usize,

    /// Write position.
    tail: usize,

    len: usize,
}

impl<const N: usize> RingBuffer<N> {
    pub(crate) const fn new() -> Self {
        Self {
            buffer: [0u8; N],
            head: 0,
            tail: 0,
            len: 0,
        }
    }

    #[inline]
    pub(crate) const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Free space in bytes.
    #[inline]
    pub(crate) const fn remaining(&self) -> usize {
        N - self.len
    }

    /// Appends as much of `data` as fits, returning the count.
    pub(crate) fn write(&mut self, data: &[u8]) -> usize {
        let count = data.len().min(self.remaining());
        if count == 0 {
            return 0;
        }

        let first = count.min(N - self.tail);
        self.buffer[self.tail..self.tail + first].copy_from_slice(&data[..first]);
        if count > first {
            self.buffer[..count - first].copy_from_slice(&data[first..count]);
        }

        self.tail = (self.tail + count) % N;
        self.len += count;
        count
    }

    /// Moves up to `out.len()` bytes out of the pipe, returning the count.
    pub(crate) fn read(&mut self, out: &mut [u8]) -> usize {
        let count = out.len().min(self.len);
        if count == 0 {
            return 0;
        }

        let first = count.min(N - self.head);
        out[..first].copy_from_slice(&self.buffer[self.head..self.head + first]);
        if count > first {
            out[first..count].copy_from_slice(&self.buffer[..count - first]);
        }

        self.head = (self.head + count) % N;
        self.len -= count;
        count
    }
}
