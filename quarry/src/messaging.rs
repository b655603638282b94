use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::clock::{Clock, NEVER_NS};

/// A message that can travel through a [`MessageQueue`].
///
/// `lane` maps the message to a priority lane; lane 0 is delivered first.
pub trait QueueMessage: Send + 'static {
    fn lane(&self) -> usize;
}

/// The single reader of a [`MessageQueue`].
#[async_trait]
pub trait MessageConsumer<M>: Send {
    async fn on_message(&mut self, message: M);

    /// Called once each time the queue drains, before the reader blocks.
    async fn on_idle(&mut self);
}

struct Delayed<M> {
    ready_at_ns: u64,
    seq: u64,
    message: M,
}

impl<M> PartialEq for Delayed<M> {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at_ns == other.ready_at_ns && self.seq == other.seq
    }
}

impl<M> Eq for Delayed<M> {}

impl<M> Ord for Delayed<M> {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // BinaryHeap is a max-heap; invert so the earliest deadline wins.
        (other.ready_at_ns, other.seq).cmp(&(self.ready_at_ns, self.seq))
    }
}

impl<M> PartialOrd for Delayed<M> {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

struct Inner<M> {
    lanes: Vec<VecDeque<M>>,
    delayed: BinaryHeap<Delayed<M>>,
    seq: u64,
    /// Bumped on every post so the reader can tell "woke with new work"
    /// from a spurious wake-up.
    generation: u64,
}

impl<M: QueueMessage> Inner<M> {
    /// Move every due delayed message into its priority lane.
    fn flush_due(&mut self, now_ns: u64) {
        while let Some(head) = self.delayed.peek() {
            if head.ready_at_ns > now_ns {
                break;
            }
            let entry = self.delayed.pop().expect("peeked entry vanished");
            self.lanes[entry.message.lane()].push_back(entry.message);
            self.generation += 1;
        }
    }

    fn pop(&mut self) -> Option<M> {
        self.lanes.iter_mut().find_map(VecDeque::pop_front)
    }

    fn next_deadline_ns(&self) -> u64 {
        self.delayed.peek().map(|d| d.ready_at_ns).unwrap_or(NEVER_NS)
    }
}

/// Priority message transport between the control loop and its producers.
///
/// Delivery order is strictly by lane, FIFO within a lane; a message posted
/// with [`MessageQueue::post_at`] is held back until its ready time elapses
/// on the injected [`Clock`]. Exactly one reader may consume the queue at a
/// time; attaching a second reader is a programming error and panics.
pub struct MessageQueue<M> {
    inner: Mutex<Inner<M>>,
    notify: Notify,
    clock: Arc<dyn Clock>,
    running: AtomicBool,
    attached: AtomicBool,
}

impl<M: QueueMessage> MessageQueue<M> {
    pub fn new(lanes: usize, clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                lanes: (0..lanes).map(|_| VecDeque::new()).collect(),
                delayed: BinaryHeap::new(),
                seq: 0,
                generation: 0,
            }),
            notify: Notify::new(),
            clock,
            running: AtomicBool::new(true),
            attached: AtomicBool::new(false),
        })
    }

    /// Enqueue a message at the tail of its priority lane.
    pub fn post(&self, message: M) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        {
            let mut inner = self.inner.lock();
            let lane = message.lane();
            debug_assert!(lane < inner.lanes.len(), "message lane out of range");
            inner.lanes[lane].push_back(message);
            inner.generation += 1;
        }
        self.notify.notify_one();
    }

    /// Enqueue a message that becomes deliverable at `ready_at_ns`.
    pub fn post_at(&self, message: M, ready_at_ns: u64) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        {
            let mut inner = self.inner.lock();
            let seq = inner.seq;
            inner.seq += 1;
            inner.delayed.push(Delayed {
                ready_at_ns,
                seq,
                message,
            });
            inner.generation += 1;
        }
        // Wake the reader so it can shorten its sleep to the new deadline.
        self.notify.notify_one();
    }

    /// Remove and drop every pending or delayed message matching `predicate`.
    ///
    /// Returns the number of messages removed.
    pub fn cancel_messages(&self, predicate: impl Fn(&M) -> bool) -> usize {
        let mut inner = self.inner.lock();
        let mut removed = 0;
        for lane in &mut inner.lanes {
            let before = lane.len();
            lane.retain(|m| !predicate(m));
            removed += before - lane.len();
        }
        let before = inner.delayed.len();
        let kept: Vec<Delayed<M>> = inner
            .delayed
            .drain()
            .filter(|d| !predicate(&d.message))
            .collect();
        removed += before - kept.len();
        inner.delayed = kept.into_iter().collect();
        removed
    }

    /// Drop every pending and delayed message.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        for lane in &mut inner.lanes {
            lane.clear();
        }
        inner.delayed.clear();
    }

    /// Total pending messages, delayed ones included.
    pub fn len(&self) -> usize {
        let inner = self.inner.lock();
        inner.lanes.iter().map(VecDeque::len).sum::<usize>() + inner.delayed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Unblock the reader and make it return from [`MessageQueue::consume`].
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn take(&self) -> (Option<M>, u64, u64) {
        let mut inner = self.inner.lock();
        inner.flush_due(self.clock.now_ns());
        let message = inner.pop();
        (message, inner.next_deadline_ns(), inner.generation)
    }

    /// Run the reader loop until [`MessageQueue::stop`] is called.
    ///
    /// Panics if another reader is already attached.
    pub async fn consume<C: MessageConsumer<M>>(&self, consumer: &mut C) {
        if self.attached.swap(true, Ordering::SeqCst) {
            panic!("a reader is already attached to this message queue");
        }

        let mut last_idle_generation = u64::MAX;
        while self.running.load(Ordering::SeqCst) {
            let notified = self.notify.notified();
            let (message, deadline_ns, generation) = self.take();
            match message {
                Some(message) => {
                    consumer.on_message(message).await;
                }
                None if generation != last_idle_generation => {
                    last_idle_generation = generation;
                    consumer.on_idle().await;
                }
                None => {
                    tokio::select! {
                        _ = notified => {}
                        _ = self.clock.sleep_until(deadline_ns) => {}
                    }
                }
            }
        }

        self.attached.store(false, Ordering::SeqCst);
    }

    /// Pop the next deliverable message, waiting up to `deadline_ns`.
    ///
    /// Used by consumer inboxes, which want a bounded wait instead of the
    /// callback loop. Returns `None` on timeout or once the queue stops.
    pub async fn poll(&self, deadline_ns: u64) -> Option<M> {
        loop {
            if !self.running.load(Ordering::SeqCst) {
                return None;
            }
            let notified = self.notify.notified();
            let (message, next_delayed_ns, _) = self.take();
            if message.is_some() {
                return message;
            }
            if self.clock.now_ns() >= deadline_ns {
                return None;
            }
            let wake_at = deadline_ns.min(next_delayed_ns);
            tokio::select! {
                _ = notified => {}
                _ = self.clock.sleep_until(wake_at) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::time::Duration;
    use tokio::time::timeout;

    #[derive(Debug, PartialEq)]
    enum TestMessage {
        High(u32),
        Low(u32),
    }

    impl QueueMessage for TestMessage {
        fn lane(&self) -> usize {
            match self {
                TestMessage::High(_) => 0,
                TestMessage::Low(_) => 1,
            }
        }
    }

    struct Recorder {
        seen: Vec<TestMessage>,
        idle_count: usize,
        stop_after: usize,
        queue: Arc<MessageQueue<TestMessage>>,
    }

    #[async_trait]
    impl MessageConsumer<TestMessage> for Recorder {
        async fn on_message(&mut self, message: TestMessage) {
            self.seen.push(message);
            if self.seen.len() >= self.stop_after {
                self.queue.stop();
            }
        }

        async fn on_idle(&mut self) {
            self.idle_count += 1;
        }
    }

    fn queue(clock: Arc<ManualClock>) -> Arc<MessageQueue<TestMessage>> {
        MessageQueue::new(2, clock)
    }

    #[tokio::test]
    async fn test_priority_before_fifo() {
        let clock = ManualClock::new();
        let q = queue(clock);
        q.post(TestMessage::Low(1));
        q.post(TestMessage::High(2));
        q.post(TestMessage::Low(3));

        let mut recorder = Recorder {
            seen: Vec::new(),
            idle_count: 0,
            stop_after: 3,
            queue: Arc::clone(&q),
        };
        timeout(Duration::from_secs(5), q.consume(&mut recorder))
            .await
            .expect("consume did not stop");

        assert_eq!(
            recorder.seen,
            vec![TestMessage::High(2), TestMessage::Low(1), TestMessage::Low(3)]
        );
    }

    #[tokio::test]
    async fn test_delayed_message_held_until_ready() {
        let clock = ManualClock::new();
        let q = queue(Arc::clone(&clock));
        q.post_at(TestMessage::High(1), 10_000);

        assert_eq!(q.poll(0).await, None, "not due yet");

        clock.set_ns(10_000);
        let got = timeout(Duration::from_secs(1), q.poll(NEVER_NS))
            .await
            .expect("poll hung");
        assert_eq!(got, Some(TestMessage::High(1)));
    }

    #[tokio::test]
    async fn test_delayed_messages_flush_in_ready_order() {
        let clock = ManualClock::new();
        let q = queue(Arc::clone(&clock));
        q.post_at(TestMessage::Low(2), 2_000);
        q.post_at(TestMessage::Low(1), 1_000);
        clock.set_ns(5_000);

        assert_eq!(q.poll(0).await, Some(TestMessage::Low(1)));
        assert_eq!(q.poll(0).await, Some(TestMessage::Low(2)));
    }

    #[tokio::test]
    async fn test_cancel_messages_drops_pending_and_delayed() {
        let clock = ManualClock::new();
        let q = queue(Arc::clone(&clock));
        q.post(TestMessage::Low(1));
        q.post(TestMessage::High(2));
        q.post_at(TestMessage::Low(3), 1_000);

        let removed = q.cancel_messages(|m| matches!(m, TestMessage::Low(_)));
        assert_eq!(removed, 2);
        assert_eq!(q.len(), 1);

        clock.set_ns(2_000);
        assert_eq!(q.poll(0).await, Some(TestMessage::High(2)));
        assert_eq!(q.poll(0).await, None);
    }

    #[tokio::test]
    async fn test_drained_queue_holds_nothing_back() {
        let clock = ManualClock::new();
        let q = queue(Arc::clone(&clock));
        q.post(TestMessage::High(1));
        q.post(TestMessage::Low(2));
        q.post_at(TestMessage::High(3), 1_000);
        clock.set_ns(1_000);

        while q.poll(0).await.is_some() {}
        assert_eq!(q.len(), 0);

        q.post(TestMessage::Low(4));
        q.post_at(TestMessage::High(5), 9_000);
        q.clear();
        assert!(q.is_empty());
        assert!(q.is_running(), "clear leaves the queue usable");
    }

    #[tokio::test]
    async fn test_poll_times_out_on_virtual_deadline() {
        let clock = ManualClock::new();
        let q = queue(Arc::clone(&clock));

        let waiter = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.poll(5_000).await })
        };
        tokio::task::yield_now().await;
        clock.set_ns(5_000);

        let got = timeout(Duration::from_secs(1), waiter)
            .await
            .expect("poll did not observe deadline")
            .unwrap();
        assert_eq!(got, None);
    }

    #[tokio::test]
    async fn test_idle_called_once_per_drain() {
        let clock = ManualClock::new();
        let q = queue(Arc::clone(&clock));
        q.post(TestMessage::High(1));

        let stopper = {
            let q = Arc::clone(&q);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                q.stop();
            })
        };

        let mut recorder = Recorder {
            seen: Vec::new(),
            idle_count: 0,
            stop_after: usize::MAX,
            queue: Arc::clone(&q),
        };
        timeout(Duration::from_secs(5), q.consume(&mut recorder))
            .await
            .expect("consume did not stop");
        stopper.await.unwrap();

        assert_eq!(recorder.seen.len(), 1);
        assert_eq!(recorder.idle_count, 1, "idle fires once, then blocks");
    }

    #[tokio::test]
    #[should_panic(expected = "already attached")]
    async fn test_second_reader_panics() {
        struct Noop;
        #[async_trait]
        impl MessageConsumer<TestMessage> for Noop {
            async fn on_message(&mut self, _message: TestMessage) {}
            async fn on_idle(&mut self) {}
        }

        let clock = ManualClock::new();
        let q = queue(clock);
        let background = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.consume(&mut Noop).await })
        };
        tokio::task::yield_now().await;

        q.consume(&mut Noop).await;
        drop(background);
    }

    #[tokio::test]
    async fn test_stop_unblocks_reader() {
        let clock = ManualClock::new();
        let q = queue(clock);
        let mut recorder = Recorder {
            seen: Vec::new(),
            idle_count: 0,
            stop_after: usize::MAX,
            queue: Arc::clone(&q),
        };

        let handle = {
            let q = Arc::clone(&q);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                q.stop();
            })
        };
        timeout(Duration::from_secs(5), q.consume(&mut recorder))
            .await
            .expect("stop did not unblock consume");
        handle.await.unwrap();
        assert!(q.is_empty());
    }
}
