//! Cross-task primitives: the cancel token every blocking loop honours, the
//! signalled queue behind the ACK inbox/outbox, and the staging queue that
//! hands datagram payloads from the client receive task to the main thread.

use crate::logging;
use crate::net::buffer::Buffer;
use byteorder::{LittleEndian, ReadBytesExt};
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// Shared cancellation flag. Closing an endpoint flips it; every task's
/// blocking wait is bounded (socket timeout or condvar timeout), so all
/// tasks observe the flip within one timeout.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken {
            inner: Arc::new((Mutex::new(false), Condvar::new())),
        }
    }

    pub fn cancel(&self) {
        let (flag, cv) = &*self.inner;
        *flag.lock().expect("cancel token poisoned") = true;
        cv.notify_all();
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        *self.inner.0.lock().expect("cancel token poisoned")
    }

    /// Sleeps up to `timeout`, returning early (true) if cancelled.
    pub fn wait(&self, timeout: Duration) -> bool {
        let (flag, cv) = &*self.inner;
        let mut cancelled = flag.lock().expect("cancel token poisoned");

        if *cancelled {
            return true;
        }

        let (guard, _) = cv
            .wait_timeout(cancelled, timeout)
            .expect("cancel token poisoned");
        cancelled = guard;

        *cancelled
    }
}

impl Default for CancelToken {
    fn default() -> CancelToken {
        CancelToken::new()
    }
}

/// Mutex + condvar FIFO. Producers push and signal; the consumer drains
/// everything at once. Waking without data is fine: consumers re-check their
/// cancel token and loop.
pub struct SignalQueue<T> {
    items: Mutex<VecDeque<T>>,
    cv: Condvar,
}

impl<T> SignalQueue<T> {
    pub fn new() -> SignalQueue<T> {
        SignalQueue {
            items: Mutex::new(VecDeque::new()),
            cv: Condvar::new(),
        }
    }

    pub fn push(&self, item: T) {
        self.items.lock().expect("queue poisoned").push_back(item);
        self.cv.notify_all();
    }

    pub fn extend<I: IntoIterator<Item = T>>(&self, iter: I) {
        self.items.lock().expect("queue poisoned").extend(iter);
        self.cv.notify_all();
    }

    pub fn drain(&self) -> Vec<T> {
        self.items
            .lock()
            .expect("queue poisoned")
            .drain(..)
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().expect("queue poisoned").is_empty()
    }

    /// Waits until the queue is (probably) non-empty or the timeout passes.
    /// Returns true when items are available.
    pub fn wait(&self, timeout: Duration) -> bool {
        let items = self.items.lock().expect("queue poisoned");

        if !items.is_empty() {
            return true;
        }

        let (items, _) = self
            .cv
            .wait_timeout(items, timeout)
            .expect("queue poisoned");

        !items.is_empty()
    }

    /// Wakes all waiters without pushing; used at shutdown.
    pub fn notify_all(&self) {
        self.cv.notify_all();
    }
}

impl<T> Default for SignalQueue<T> {
    fn default() -> SignalQueue<T> {
        SignalQueue::new()
    }
}

/// Byte queue between the client's datagram receive task and the main
/// thread. The writer appends one record per accepted datagram; the reader
/// drains everything and resets. A record that would overfill the queue is
/// dropped with a warning and the queue is reset, on the theory that the
/// reader has stopped consuming and the backlog is already stale.
///
/// Record layout (process-internal): `[packet_gen: u64][size: u32][payload]`.
pub struct StagingQueue {
    inner: Mutex<Buffer>,
    log: logging::Logger,
}

/// Byte overhead of one staging record.
pub const STAGING_RECORD_HEADER: usize = 12;

impl StagingQueue {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(capacity: usize, log: L) -> StagingQueue {
        let log = match log.into() {
            Some(log) => log.new(logging::o!("component" => "staging-queue")),
            None => logging::discard(),
        };

        StagingQueue {
            inner: Mutex::new(Buffer::new(capacity)),
            log,
        }
    }

    /// Appends one datagram payload under its generation. Returns false when
    /// the record was dropped because the queue was full.
    pub fn append(&self, packet_gen: u64, payload: &[u8]) -> bool {
        let mut buffer = self.inner.lock().expect("staging queue poisoned");

        let record_len = STAGING_RECORD_HEADER + payload.len();
        if record_len > buffer.free_capacity() {
            logging::warn!(self.log, "staging queue overflow, dropping backlog";
                           "used" => buffer.len(),
                           "record_len" => record_len);
            buffer.clear();
            return false;
        }

        buffer.append(&packet_gen.to_le_bytes());
        buffer.append(&(payload.len() as u32).to_le_bytes());
        buffer.append(payload);
        true
    }

    /// Copies all buffered records into `dst` (cleared first) and resets the
    /// queue. Returns the number of bytes handed over.
    pub fn drain_into(&self, dst: &mut Vec<u8>) -> usize {
        let mut buffer = self.inner.lock().expect("staging queue poisoned");

        dst.clear();
        buffer.egress(dst).expect("vec writes are infallible")
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("staging queue poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One staged record: the datagram generation and its chunk payload.
pub struct StagingRecord<'a> {
    pub packet_gen: u64,
    pub payload: &'a [u8],
}

/// Walks the records in a drained staging buffer in arrival order.
pub fn staging_records(mut bytes: &[u8]) -> impl Iterator<Item = StagingRecord<'_>> {
    std::iter::from_fn(move || {
        if bytes.len() < STAGING_RECORD_HEADER {
            return None;
        }

        let packet_gen = bytes.read_u64::<LittleEndian>().ok()?;
        let size = bytes.read_u32::<LittleEndian>().ok()? as usize;
        if bytes.len() < size {
            return None;
        }

        let (payload, rest) = bytes.split_at(size);
        bytes = rest;

        Some(StagingRecord { packet_gen, payload })
    })
}
