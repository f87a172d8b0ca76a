#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stream {
    Stdout,
    Stderr,
}

/// Captured stdout/stderr of one process, delivered in chunks.
///
/// Appending flushes first when the target buffer would grow past its
/// capacity, and again once it reaches the flush threshold. A flush hands
/// both buffers to the caller (empty ones as `None`) and empties them.
#[derive(Debug)]
pub struct OutputBuffers {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    capacity: usize,
    flush_threshold: usize,
}

impl OutputBuffers {
    pub fn new(capacity: usize, flush_threshold: usize) -> Self {
        let capacity = capacity.max(1);
        OutputBuffers {
            stdout: Vec::new(),
            stderr: Vec::new(),
            capacity,
            flush_threshold: flush_threshold.clamp(1, capacity),
        }
    }

    pub fn flush_threshold(&self) -> usize {
        self.flush_threshold
    }

    pub fn len(&self, stream: Stream) -> usize {
        self.buffer(stream).len()
    }

    pub fn is_empty(&self) -> bool {
        self.stdout.is_empty() && self.stderr.is_empty()
    }

    fn buffer(&self, stream: Stream) -> &Vec<u8> {
        match stream {
            Stream::Stdout => &self.stdout,
            Stream::Stderr => &self.stderr,
        }
    }

    pub fn push<F>(&mut self, stream: Stream, data: &[u8], mut deliver: F)
    where
        F: FnMut(Option<&[u8]>, Option<&[u8]>),
    {
        if self.len(stream) + data.len() > self.capacity {
            self.flush(&mut deliver);
        }

        match stream {
            Stream::Stdout => self.stdout.extend_from_slice(data),
            Stream::Stderr => self.stderr.extend_from_slice(data),
        }

        if self.len(stream) >= self.flush_threshold {
            self.flush(&mut deliver);
        }
    }

    pub fn flush<F>(&mut self, mut deliver: F)
    where
        F: FnMut(Option<&[u8]>, Option<&[u8]>),
    {
        let stdout = (!self.stdout.is_empty()).then_some(self.stdout.as_slice());
        let stderr = (!self.stderr.is_empty()).then_some(self.stderr.as_slice());
        deliver(stdout, stderr);
        self.stdout.clear();
        self.stderr.clear();
    }

    /// Drops the buffered bytes and their allocations.
    pub fn release(&mut self) {
        self.stdout = Vec::new();
        self.stderr = Vec::new();
    }
}
