use std::sync::Arc;

use parking_lot::Mutex;

/// Bounded in-memory output stream owned by one execution
///
/// Clones share the same buffer, so the execution thread can write while the
/// sandbox snapshots what was produced so far.
#[derive(Clone, Debug)]
pub struct Capture {
    inner: Arc<Mutex<Buffer>>,
}

#[derive(Debug, Default)]
struct Buffer {
    text: String,
    limit: usize,
    dropped: usize,
}

/// Text captured from one stream, plus the number of bytes that did not fit
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Captured {
    pub text: String,
    pub dropped: usize,
}

impl Capture {
    pub fn new(limit: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Buffer {
                text: String::new(),
                limit,
                dropped: 0,
            })),
        }
    }

    /// Bytes kept before output starts being dropped
    pub fn limit(&self) -> usize {
        self.inner.lock().limit
    }

    pub fn write(&self, s: &str) {
        let mut buffer = self.inner.lock();
        let room = buffer.limit.saturating_sub(buffer.text.len());
        if s.len() <= room {
            buffer.text.push_str(s);
            return;
        }
        let mut cut = room;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        buffer.text.push_str(&s[..cut]);
        buffer.dropped += s.len() - cut;
    }

    /// Copy of the output so far; the buffer stays usable
    pub fn snapshot(&self) -> Captured {
        let buffer = self.inner.lock();
        Captured {
            text: buffer.text.clone(),
            dropped: buffer.dropped,
        }
    }

    /// Moves the output out, leaving the buffer empty
    pub fn take(&self) -> Captured {
        let mut buffer = self.inner.lock();
        Captured {
            text: std::mem::take(&mut buffer.text),
            dropped: std::mem::take(&mut buffer.dropped),
        }
    }
}
