//! Fixed-capacity ring buffer for capturing the tail of an output stream.

/// Circular byte buffer that retains only the most recent `capacity` bytes.
/// Writes of any length succeed; once full, the oldest bytes are overwritten.
#[derive(Debug)]
pub struct RingBuffer {
    buf: Vec<u8>,
    capacity: usize,
    pos: usize,
    full: bool,
}

impl RingBuffer {
    /// Create a ring buffer with the given capacity in bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0; capacity],
            capacity,
            pos: 0,
            full: false,
        }
    }

    /// Append bytes, overwriting the oldest data when capacity is exceeded.
    pub fn write(&mut self, data: &[u8]) {
        if self.capacity == 0 {
            return;
        }
        let n = data.len();
        if n >= self.capacity {
            // Larger than the whole buffer: keep only the tail.
            self.buf.copy_from_slice(&data[n - self.capacity..]);
            self.pos = 0;
            self.full = true;
            return;
        }

        let first = self.capacity - self.pos;
        if first >= n {
            self.buf[self.pos..self.pos + n].copy_from_slice(data);
        } else {
            self.buf[self.pos..].copy_from_slice(&data[..first]);
            self.buf[..n - first].copy_from_slice(&data[first..]);
        }

        let old_pos = self.pos;
        self.pos = (self.pos + n) % self.capacity;
        if !self.full && self.pos <= old_pos {
            self.full = true;
        }
    }

    /// Buffered contents in chronological order.
    pub fn to_bytes(&self) -> Vec<u8> {
        if !self.full {
            return self.buf[..self.pos].to_vec();
        }
        let mut out = Vec::with_capacity(self.capacity);
        out.extend_from_slice(&self.buf[self.pos..]);
        out.extend_from_slice(&self.buf[..self.pos]);
        out
    }

    /// Buffered contents as a string, with invalid UTF-8 replaced. A tail cut
    /// mid-codepoint yields replacement characters at the boundary only.
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.to_bytes()).into_owned()
    }
}

impl std::io::Write for RingBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        RingBuffer::write(self, buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
