//! Read-side queue of a data chain.
//!
//! The chain's processor thread pushes entries, reader threads consume them
//! in order. `End` is terminal: it stays at the head so every later read
//! reports end of stream, and nothing is queued behind it. An error entry is
//! reported to exactly one read.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::chain::ReadStatus;
use crate::{MuxError, Result};

enum Entry {
    Data { bytes: Vec<u8>, offset: usize },
    End,
    Error(MuxError),
}

#[derive(Default)]
struct QueueState {
    entries: VecDeque<Entry>,
    ended: bool,
    closed: bool,
}

#[derive(Default)]
pub(crate) struct InputQueue {
    state: Mutex<QueueState>,
    available: Condvar,
}

impl InputQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn push(&self, entry: Entry) {
        let mut state = self.state.lock();
        if state.ended || state.closed {
            return;
        }
        if let Entry::End = entry {
            state.ended = true;
        }
        state.entries.push_back(entry);
        drop(state);
        self.available.notify_all();
    }

    pub(crate) fn push_data(&self, bytes: Vec<u8>) {
        if !bytes.is_empty() {
            self.push(Entry::Data { bytes, offset: 0 });
        }
    }

    pub(crate) fn push_error(&self, error: MuxError) {
        self.push(Entry::Error(error));
    }

    pub(crate) fn push_end(&self) {
        self.push(Entry::End);
    }

    /// Copy queued data into `buf`, waiting up to `timeout` (forever if
    /// `None`) for an entry.
    pub(crate) fn read(&self, buf: &mut [u8], timeout: Option<Duration>) -> Result<ReadStatus> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Err(MuxError::ChannelClosed);
            }
            match state.entries.front_mut() {
                Some(Entry::Data { bytes, offset }) => {
                    let n = buf.len().min(bytes.len() - *offset);
                    buf[..n].copy_from_slice(&bytes[*offset..*offset + n]);
                    *offset += n;
                    if *offset == bytes.len() {
                        state.entries.pop_front();
                    }
                    return Ok(ReadStatus::Data(n));
                }
                Some(Entry::End) => return Ok(ReadStatus::End),
                Some(Entry::Error(_)) => {
                    if let Some(Entry::Error(error)) = state.entries.pop_front() {
                        return Err(error);
                    }
                }
                None => match deadline {
                    Some(deadline) => {
                        if self.available.wait_until(&mut state, deadline).timed_out() && state.entries.is_empty() {
                            return Ok(ReadStatus::Retry);
                        }
                    }
                    None => self.available.wait(&mut state),
                },
            }
        }
    }

    /// Bytes readable without blocking.
    pub(crate) fn available(&self) -> usize {
        let state = self.state.lock();
        state
            .entries
            .iter()
            .map_while(|entry| match entry {
                Entry::Data { bytes, offset } => Some(bytes.len() - offset),
                _ => None,
            })
            .sum()
    }

    /// Drop everything; later reads fail with `ChannelClosed`.
    pub(crate) fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.entries.clear();
        drop(state);
        self.available.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::thread;

    proptest! {
        #[test]
        fn test_chunked_reads_see_bytes_in_write_order(
            chunks in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..64), 0..16),
            read_size in 1usize..40,
        ) {
            let queue = InputQueue::new();
            for chunk in &chunks {
                queue.push_data(chunk.clone());
            }
            queue.push_end();

            let mut out = Vec::new();
            let mut buf = vec![0u8; read_size];
            while let ReadStatus::Data(n) = queue.read(&mut buf, None).expect("read") {
                out.extend_from_slice(&buf[..n]);
            }
            prop_assert_eq!(out, chunks.concat());
        }
    }

    #[test]
    fn test_partial_reads_preserve_order() {
        let queue = InputQueue::new();
        queue.push_data(b"hello ".to_vec());
        queue.push_data(b"world".to_vec());
        queue.push_end();

        let mut out = Vec::new();
        let mut buf = [0u8; 4];
        loop {
            match queue.read(&mut buf, None).expect("read") {
                ReadStatus::Data(n) => out.extend_from_slice(&buf[..n]),
                ReadStatus::End => break,
                ReadStatus::Retry => panic!("blocking read returned Retry"),
            }
        }
        assert_eq!(out, b"hello world");
        assert_eq!(queue.read(&mut buf, None).expect("read"), ReadStatus::End);
    }

    #[test]
    fn test_nothing_after_end() {
        let queue = InputQueue::new();
        queue.push_end();
        queue.push_data(b"late".to_vec());
        queue.push_error(MuxError::ConnectionError);
        assert_eq!(queue.available(), 0);
        assert_eq!(queue.read(&mut [0u8; 8], None).expect("read"), ReadStatus::End);
    }

    #[test]
    fn test_error_is_reported_once() {
        let queue = InputQueue::new();
        queue.push_data(vec![1, 2]);
        queue.push_error(MuxError::ConnectionError);
        queue.push_end();

        let mut buf = [0u8; 8];
        assert_eq!(queue.read(&mut buf, None).expect("data"), ReadStatus::Data(2));
        assert!(matches!(queue.read(&mut buf, None), Err(MuxError::ConnectionError)));
        assert_eq!(queue.read(&mut buf, None).expect("end"), ReadStatus::End);
    }

    #[test]
    fn test_timeout_returns_retry() {
        let queue = InputQueue::new();
        let status = queue.read(&mut [0u8; 4], Some(Duration::from_millis(20))).expect("read");
        assert_eq!(status, ReadStatus::Retry);
    }

    #[test]
    fn test_close_wakes_blocked_reader() {
        let queue = Arc::new(InputQueue::new());
        let reader = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.read(&mut [0u8; 4], None))
        };
        thread::sleep(Duration::from_millis(50));
        queue.close();
        assert!(matches!(reader.join().expect("join"), Err(MuxError::ChannelClosed)));
    }

    #[test]
    fn test_available_counts_leading_data() {
        let queue = InputQueue::new();
        queue.push_data(vec![0; 10]);
        queue.push_data(vec![0; 5]);
        let mut buf = [0u8; 3];
        queue.read(&mut buf, None).expect("read");
        assert_eq!(queue.available(), 12);
    }
}
