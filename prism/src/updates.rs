//! Server-side update queues. Updates carry just enough to rebuild their
//! datagram chunk at send time; payloads are read from the store or scene
//! while packing.
//!
//! Transitory updates are sent at most once, in insertion order. Persistent
//! updates (geometry only) are keyed by the serial id of their targeted
//! range and resent every cycle until the client ACKs them; enqueueing the
//! same range again supersedes the older entry.

use crate::hashing::StringId;
use crate::wire::udp::GeomUpdateHeader;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum QueuedUpdate {
    Geom(GeomUpdateHeader),
    PointLight(StringId),
    Transform(StringId),
}

struct Queues {
    transitory: VecDeque<QueuedUpdate>,
    persistent: BTreeMap<u32, GeomUpdateHeader>,
}

pub struct UpdateQueues {
    inner: Mutex<Queues>,
    cv: Condvar,
}

impl UpdateQueues {
    pub fn new() -> UpdateQueues {
        UpdateQueues {
            inner: Mutex::new(Queues {
                transitory: VecDeque::new(),
                persistent: BTreeMap::new(),
            }),
            cv: Condvar::new(),
        }
    }

    /// Queues an update to be sent once.
    pub fn push_transitory(&self, update: QueuedUpdate) {
        let mut queues = self.inner.lock().expect("update queues poisoned");
        queues.transitory.push_back(update);
        self.cv.notify_all();
    }

    /// Queues a geometry update for retransmission until ACKed. An update
    /// with the same serial id replaces the older one.
    pub fn push_persistent(&self, header: GeomUpdateHeader) {
        let mut queues = self.inner.lock().expect("update queues poisoned");
        queues.persistent.insert(header.serial_id(), header);
        self.cv.notify_all();
    }

    /// Takes the whole transitory queue, clearing it.
    pub fn take_transitory(&self) -> Vec<QueuedUpdate> {
        let mut queues = self.inner.lock().expect("update queues poisoned");
        queues.transitory.drain(..).collect()
    }

    /// The persistent entries in serial-id order, so retransmissions are
    /// reproducible cycle to cycle.
    pub fn persistent_snapshot(&self) -> Vec<GeomUpdateHeader> {
        let queues = self.inner.lock().expect("update queues poisoned");
        queues.persistent.values().cloned().collect()
    }

    /// Removes the entries the client acknowledged. Returns how many were
    /// retired.
    pub fn retire(&self, acks: &[u32]) -> usize {
        let mut queues = self.inner.lock().expect("update queues poisoned");

        let mut retired = 0;
        for serial in acks {
            if queues.persistent.remove(serial).is_some() {
                retired += 1;
            }
        }

        retired
    }

    pub fn is_empty(&self) -> bool {
        let queues = self.inner.lock().expect("update queues poisoned");
        queues.transitory.is_empty() && queues.persistent.is_empty()
    }

    pub fn transitory_len(&self) -> usize {
        self.inner
            .lock()
            .expect("update queues poisoned")
            .transitory
            .len()
    }

    pub fn persistent_len(&self) -> usize {
        self.inner
            .lock()
            .expect("update queues poisoned")
            .persistent
            .len()
    }

    /// Blocks until some update is pending or the timeout passes. Returns
    /// true when work is available.
    pub fn wait_pending(&self, timeout: Duration) -> bool {
        let queues = self.inner.lock().expect("update queues poisoned");

        if !queues.transitory.is_empty() || !queues.persistent.is_empty() {
            return true;
        }

        let (queues, _) = self
            .cv
            .wait_timeout(queues, timeout)
            .expect("update queues poisoned");

        !queues.transitory.is_empty() || !queues.persistent.is_empty()
    }

    /// Wakes all waiters without queueing; used at shutdown.
    pub fn notify_all(&self) {
        self.cv.notify_all();
    }

    /// Drops everything; a new connection starts from a clean slate.
    pub fn clear(&self) {
        let mut queues = self.inner.lock().expect("update queues poisoned");
        queues.transitory.clear();
        queues.persistent.clear();
    }
}

impl Default for UpdateQueues {
    fn default() -> UpdateQueues {
        UpdateQueues::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::geometry::GeomKind;

    fn geom(start: u32, len: u32) -> GeomUpdateHeader {
        GeomUpdateHeader {
            model_id: 100,
            kind: GeomKind::Vertex,
            start,
            len,
        }
    }

    #[test]
    fn test_transitory_insertion_order() {
        let queues = UpdateQueues::new();

        queues.push_transitory(QueuedUpdate::Transform(1));
        queues.push_transitory(QueuedUpdate::PointLight(2));
        queues.push_transitory(QueuedUpdate::Transform(3));

        let taken = queues.take_transitory();
        assert_eq!(
            taken,
            vec![
                QueuedUpdate::Transform(1),
                QueuedUpdate::PointLight(2),
                QueuedUpdate::Transform(3),
            ]
        );

        // Taking clears the queue.
        assert!(queues.take_transitory().is_empty());
    }

    #[test]
    fn test_persistent_same_serial_supersedes() {
        let queues = UpdateQueues::new();

        queues.push_persistent(geom(0, 10));
        queues.push_persistent(geom(0, 10));

        assert_eq!(queues.persistent_len(), 1);

        // A different range is a different serial.
        queues.push_persistent(geom(10, 10));
        assert_eq!(queues.persistent_len(), 2);
    }

    #[test]
    fn test_persistent_snapshot_is_serial_ordered() {
        let queues = UpdateQueues::new();

        let a = geom(0, 4);
        let b = geom(4, 4);
        let c = geom(8, 4);
        queues.push_persistent(c);
        queues.push_persistent(a);
        queues.push_persistent(b);

        let snapshot = queues.persistent_snapshot();
        let serials: Vec<u32> = snapshot.iter().map(|header| header.serial_id()).collect();
        let mut sorted = serials.clone();
        sorted.sort();

        assert_eq!(serials, sorted);
        assert_eq!(snapshot.len(), 3);
    }

    #[test]
    fn test_retire_removes_acked() {
        let queues = UpdateQueues::new();

        let update = geom(0, 16);
        queues.push_persistent(update);
        queues.push_persistent(geom(16, 16));

        assert_eq!(queues.retire(&[update.serial_id()]), 1);
        assert_eq!(queues.persistent_len(), 1);

        // Unknown serials are ignored.
        assert_eq!(queues.retire(&[0xdead]), 0);
    }

    #[test]
    fn test_wait_pending_sees_pushes() {
        let queues = UpdateQueues::new();

        assert!(!queues.wait_pending(Duration::from_millis(1)));

        queues.push_transitory(QueuedUpdate::Transform(9));
        assert!(queues.wait_pending(Duration::from_millis(1)));
    }
}
