//! Wait queues.
//!
//! Both variants keep two FIFO sequences: "pending" holds threads that
//! are asleep, "ready" holds threads a notify has selected but nobody has
//! popped yet. Queues store global thread ids only; the thread structures
//! stay in their process tables.

use super::thread::Gtid;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use spin::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyMode {
    /// Move only the oldest pending thread to ready.
    Next,
    /// Move every pending thread to ready.
    All,
}

pub struct BasicWaitQueue {
    pending: VecDeque<Gtid>,
    ready: VecDeque<Gtid>,
}

impl BasicWaitQueue {
    pub fn new() -> Self {
        BasicWaitQueue {
            pending: VecDeque::new(),
            ready: VecDeque::new(),
        }
    }

    pub fn new_shared() -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(Self::new()))
    }

    pub fn enqueue(&mut self, gtid: Gtid) {
        self.pending.push_back(gtid);
    }

    pub fn notify(&mut self, mode: NotifyMode) {
        match mode {
            NotifyMode::Next => {
                if let Some(gtid) = self.pending.pop_front() {
                    self.ready.push_back(gtid);
                }
            }
            NotifyMode::All => {
                while let Some(gtid) = self.pending.pop_front() {
                    self.ready.push_back(gtid);
                }
            }
        }
    }

    /// Oldest ready thread, if any.
    pub fn pop(&mut self) -> Option<Gtid> {
        self.ready.pop_front()
    }

    /// Drop a thread from whichever sequence holds it (forced detach).
    pub fn remove(&mut self, gtid: Gtid) {
        self.pending.retain(|&g| g != gtid);
        self.ready.retain(|&g| g != gtid);
    }

    /// The oldest enqueued thread satisfying `pred`, ready entries first.
    /// Selective wakeups (signal masks, join vectors) use this to skip
    /// waiters the event does not concern.
    pub fn first_matching(&self, pred: impl Fn(Gtid) -> bool) -> Option<Gtid> {
        self.ready
            .iter()
            .chain(self.pending.iter())
            .copied()
            .find(|&g| pred(g))
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.ready.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len() + self.ready.len()
    }
}

/// Wait queue whose entries carry a numeric wakeup key. `notify_leq(now)`
/// readies every thread whose key is due. The key is a tick deadline for
/// the sleep queue; nothing in here cares what it means.
pub struct TimedWaitQueue {
    pending: VecDeque<(u32, Gtid)>,
    ready: VecDeque<Gtid>,
}

impl TimedWaitQueue {
    pub fn new() -> Self {
        TimedWaitQueue {
            pending: VecDeque::new(),
            ready: VecDeque::new(),
        }
    }

    pub fn new_shared() -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(Self::new()))
    }

    pub fn enqueue(&mut self, key: u32, gtid: Gtid) {
        self.pending.push_back((key, gtid));
    }

    /// Ready every thread with `key <= now`, preserving FIFO order among
    /// those released together.
    pub fn notify_leq(&mut self, now: u32) {
        let mut keep = VecDeque::new();
        while let Some((key, gtid)) = self.pending.pop_front() {
            if key <= now {
                self.ready.push_back(gtid);
            } else {
                keep.push_back((key, gtid));
            }
        }
        self.pending = keep;
    }

    pub fn pop(&mut self) -> Option<Gtid> {
        self.ready.pop_front()
    }

    pub fn remove(&mut self, gtid: Gtid) {
        self.pending.retain(|&(_, g)| g != gtid);
        self.ready.retain(|&g| g != gtid);
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.ready.is_empty()
    }
}

/// The queue a waiting thread is linked into. Threads keep a clone of
/// this so a forced detach can reach back into the right queue.
#[derive(Clone)]
pub enum WaitRef {
    Basic(Arc<Mutex<BasicWaitQueue>>),
    Timed(Arc<Mutex<TimedWaitQueue>>),
}

impl WaitRef {
    pub fn remove(&self, gtid: Gtid) {
        match self {
            WaitRef::Basic(q) => q.lock().remove(gtid),
            WaitRef::Timed(q) => q.lock().remove(gtid),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn g(v: u32) -> Gtid {
        Gtid(v)
    }

    #[test]
    fn basic_fifo_next() {
        let mut q = BasicWaitQueue::new();
        q.enqueue(g(1));
        q.enqueue(g(2));
        q.enqueue(g(3));

        assert_eq!(q.pop(), None); // nothing notified yet

        q.notify(NotifyMode::Next);
        assert_eq!(q.pop(), Some(g(1)));
        assert_eq!(q.pop(), None);

        q.notify(NotifyMode::All);
        assert_eq!(q.pop(), Some(g(2)));
        assert_eq!(q.pop(), Some(g(3)));
        assert!(q.is_empty());
    }

    #[test]
    fn basic_remove_hits_both_sequences() {
        let mut q = BasicWaitQueue::new();
        q.enqueue(g(1));
        q.enqueue(g(2));
        q.notify(NotifyMode::Next); // 1 is ready, 2 pending

        q.remove(g(1));
        q.remove(g(2));
        assert!(q.is_empty());
    }

    #[test]
    fn timed_releases_due_keys_in_order() {
        let mut q = TimedWaitQueue::new();
        q.enqueue(10, g(1));
        q.enqueue(5, g(2));
        q.enqueue(10, g(3));
        q.enqueue(20, g(4));

        q.notify_leq(10);
        assert_eq!(q.pop(), Some(g(1)));
        assert_eq!(q.pop(), Some(g(2)));
        assert_eq!(q.pop(), Some(g(3)));
        assert_eq!(q.pop(), None);

        q.notify_leq(19);
        assert_eq!(q.pop(), None);
        q.notify_leq(20);
        assert_eq!(q.pop(), Some(g(4)));
        assert!(q.is_empty());
    }

    #[test]
    fn timed_remove() {
        let mut q = TimedWaitQueue::new();
        q.enqueue(1, g(7));
        q.remove(g(7));
        q.notify_leq(100);
        assert_eq!(q.pop(), None);
    }
}
