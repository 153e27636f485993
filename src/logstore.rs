use std::{
    num::NonZero,
    sync::{Arc, Mutex},
};

use crate::ringbuffer::RingBuffer;

/// In-memory sink for the most recent log lines, exposed by the stats endpoint.
/// Plugged into `simplelog` as a `WriteLogger` target.
#[derive(Debug)]
struct LogStoreImpl {
    entries: RingBuffer<String>,
    partial: Vec<u8>,
}

impl LogStoreImpl {
    fn new(capacity: NonZero<usize>) -> Self {
        Self {
            entries: RingBuffer::new(capacity),
            partial: Vec::with_capacity(256),
        }
    }
}

impl std::io::Write for LogStoreImpl {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.partial.extend_from_slice(buf);

        while let Some(pos) = self.partial.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.partial.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim();
            if !line.is_empty() {
                self.entries.push(line.to_string());
            }
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub(crate) struct LogStore {
    inner: Arc<Mutex<LogStoreImpl>>,
}

impl LogStore {
    #[must_use]
    pub(crate) fn new(capacity: NonZero<usize>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(LogStoreImpl::new(capacity))),
        }
    }

    /// Snapshot of the stored lines, oldest first.
    #[must_use]
    pub(crate) fn lines(&self) -> Vec<String> {
        let inner = self.inner.lock().expect("other users should not panic");
        inner.entries.iter().cloned().collect()
    }
}

impl std::io::Write for LogStore {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut inner = self.inner.lock().expect("other users should not panic");
        inner.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use super::LogStore;
    use crate::nonzero;
    use std::num::NonZero;

    #[test]
    fn splits_lines_and_caps_entries() {
        let mut store = LogStore::new(nonzero!(2));

        store.write_all(b"first line\nsecond ").unwrap();
        assert_eq!(store.lines(), ["first line"]);

        store.write_all(b"half\nthird line\n").unwrap();
        assert_eq!(store.lines(), ["second half", "third line"]);
    }
}
