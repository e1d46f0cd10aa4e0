//! Artificial one-way latency for local testing
//!
//! Every message is wrapped with the instant it may be released. Release is
//! strictly FIFO: a message never overtakes one enqueued before it, even if
//! the delay was shortened in between.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

#[derive(Debug)]
struct Envelope<T> {
    message: T,
    release_at: Instant,
}

#[derive(Debug)]
pub struct LatencyQueue<T> {
    one_way_delay: Duration,
    queue: VecDeque<Envelope<T>>,
}

impl<T> LatencyQueue<T> {
    pub fn new(one_way_delay: Duration) -> Self {
        Self {
            one_way_delay,
            queue: VecDeque::new(),
        }
    }

    pub fn enqueue(&mut self, message: T, now: Instant) {
        self.queue.push_back(Envelope {
            message,
            release_at: now + self.one_way_delay,
        });
    }

    /// Removes and returns every message whose release time has passed, in
    /// enqueue order.
    pub fn drain_ready(&mut self, now: Instant) -> Vec<T> {
        let mut ready = Vec::new();
        while self
            .queue
            .front()
            .is_some_and(|envelope| envelope.release_at <= now)
        {
            if let Some(envelope) = self.queue.pop_front() {
                ready.push(envelope.message);
            }
        }
        ready
    }

    pub fn next_release(&self) -> Option<Instant> {
        self.queue.front().map(|envelope| envelope.release_at)
    }

    pub fn delay(&self) -> Duration {
        self.one_way_delay
    }

    /// Applies to messages enqueued from now on.
    pub fn set_delay(&mut self, one_way_delay: Duration) {
        self.one_way_delay = one_way_delay;
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nothing_is_released_early() {
        let start = Instant::now();
        let mut queue = LatencyQueue::new(Duration::from_millis(50));
        queue.enqueue("a", start);

        assert!(queue.drain_ready(start + Duration::from_millis(49)).is_empty());
        assert_eq!(queue.drain_ready(start + Duration::from_millis(50)), vec!["a"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_release_preserves_enqueue_order() {
        let start = Instant::now();
        let mut queue = LatencyQueue::new(Duration::from_millis(20));
        for (i, message) in ["a", "b", "c", "d"].into_iter().enumerate() {
            queue.enqueue(message, start + Duration::from_millis(i as u64 * 5));
        }

        let first = queue.drain_ready(start + Duration::from_millis(30));
        let rest = queue.drain_ready(start + Duration::from_secs(1));
        assert_eq!(first, vec!["a", "b", "c"]);
        assert_eq!(rest, vec!["d"]);
    }

    #[test]
    fn test_shorter_delay_does_not_overtake() {
        let start = Instant::now();
        let mut queue = LatencyQueue::new(Duration::from_millis(100));
        queue.enqueue(1, start);
        queue.set_delay(Duration::from_millis(10));
        queue.enqueue(2, start);

        assert!(queue.drain_ready(start + Duration::from_millis(50)).is_empty());
        assert_eq!(queue.drain_ready(start + Duration::from_millis(100)), vec![1, 2]);
    }

    #[test]
    fn test_zero_delay_is_immediate() {
        let now = Instant::now();
        let mut queue = LatencyQueue::new(Duration::ZERO);
        queue.enqueue(7, now);
        assert_eq!(queue.next_release(), Some(now));
        assert_eq!(queue.drain_ready(now), vec![7]);
    }
}
