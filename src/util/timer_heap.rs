use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use tokio::time::Instant;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct TimerId(u64);

struct TimerEntry<K> {
    deadline: Instant,
    id: TimerId,
    key: K,
}
impl<K> Eq for TimerEntry<K> {}
impl<K> PartialEq for TimerEntry<K> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl<K> PartialOrd for TimerEntry<K> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl<K> Ord for TimerEntry<K> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.deadline.cmp(&other.deadline)
            .then(self.id.0.cmp(&other.id.0))
    }
}

/// Min-heap of deadlines. Timers are never removed eagerly: the owner remembers the [TimerId] it
///  currently expects for a key and ignores anything else [TimerHeap::pop_due] hands out. Stale
///  timers leave the heap once their deadline has passed.
pub struct TimerHeap<K> {
    heap: BinaryHeap<Reverse<TimerEntry<K>>>,
    next_id: u64,
}
impl<K> Default for TimerHeap<K> {
    fn default() -> Self {
        TimerHeap {
            heap: BinaryHeap::new(),
            next_id: 0,
        }
    }
}

impl<K> TimerHeap<K> {
    pub fn schedule(&mut self, deadline: Instant, key: K) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        self.heap.push(Reverse(TimerEntry { deadline, id, key }));
        id
    }

    /// NB: this may be the deadline of a timer that was superseded in the meantime, which causes
    ///      a spurious wakeup but no harm
    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek()
            .map(|Reverse(e)| e.deadline)
    }

    pub fn pop_due(&mut self, now: Instant) -> Option<(TimerId, K)> {
        match self.heap.peek() {
            Some(Reverse(e)) if e.deadline <= now => {}
            _ => return None,
        }
        self.heap.pop()
            .map(|Reverse(e)| (e.id, e.key))
    }

    pub fn clear(&mut self) {
        self.heap.clear();
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
