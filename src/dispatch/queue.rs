//! Shared FIFO work queue.
//!
//! The queue is the only shared mutable structure between workers. Pops are
//! blocking (async); pushes never block, since the run size is known up front.
//! Ordering guarantee: two workers pulling simultaneously receive distinct
//! items in queue order.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Notify;

use crate::test::{Test, WorkItem};

/// Bounded FIFO of [`WorkItem`]s with blocking pop.
pub struct WorkQueue<T> {
    inner: Mutex<Inner<T>>,
    notify: Notify,
}

struct Inner<T> {
    items: VecDeque<WorkItem<T>>,
    closed: bool,
}

impl<T: Test> WorkQueue<T> {
    /// Creates a queue seeded with the given items in order. The caller's
    /// order is the scheduling order; the queue never re-sorts.
    pub fn new(items: Vec<WorkItem<T>>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: items.into(),
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Pops the next item, waiting until one is available. Returns `None`
    /// once the queue is closed and empty.
    pub async fn pop(&self) -> Option<WorkItem<T>> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking, so a close() between the check and
            // the await cannot be missed.
            notified.as_mut().enable();
            {
                let mut inner = self.inner.lock().unwrap();
                if let Some(item) = inner.items.pop_front() {
                    return Some(item);
                }
                if inner.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Appends an item at the back.
    pub fn push_back(&self, item: WorkItem<T>) {
        let mut inner = self.inner.lock().unwrap();
        inner.items.push_back(item);
        drop(inner);
        self.notify.notify_one();
    }

    /// Re-enqueues an item for another attempt.
    ///
    /// The first requeue goes to the front so a just-failed test gets the
    /// next free supervisor; each item gets exactly one front slot, and
    /// further retries go to the back so a hot-looping retry cannot starve
    /// never-attempted items.
    pub fn requeue(&self, mut item: WorkItem<T>) {
        let mut inner = self.inner.lock().unwrap();
        if item.front_requeued {
            inner.items.push_back(item);
        } else {
            item.front_requeued = true;
            inner.items.push_front(item);
        }
        drop(inner);
        self.notify.notify_one();
    }

    /// Closes the queue: pending and future pops on an empty queue return
    /// `None`. Items already queued are still handed out.
    pub fn close(&self) {
        self.inner.lock().unwrap().closed = true;
        self.notify.notify_waiters();
    }

    /// Removes and returns everything still queued (cancellation path).
    pub fn drain_remaining(&self) -> Vec<WorkItem<T>> {
        let mut inner = self.inner.lock().unwrap();
        inner.items.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::TestId;

    #[derive(Debug, Clone)]
    struct Stub {
        id: TestId,
    }

    impl Test for Stub {
        fn id(&self) -> &TestId {
            &self.id
        }
        fn iteration(&self) -> u32 {
            1
        }
    }

    fn item(name: &str) -> WorkItem<Stub> {
        WorkItem::new(Stub {
            id: format!("generic/{name}").parse().unwrap(),
        })
    }

    async fn pop_name(queue: &WorkQueue<Stub>) -> String {
        queue.pop().await.unwrap().test.id.name().to_string()
    }

    #[tokio::test]
    async fn pops_in_fifo_order() {
        let queue = WorkQueue::new(vec![item("001"), item("002"), item("003")]);
        assert_eq!(pop_name(&queue).await, "001");
        assert_eq!(pop_name(&queue).await, "002");
        assert_eq!(pop_name(&queue).await, "003");
    }

    #[tokio::test]
    async fn first_requeue_goes_to_front_then_back() {
        let queue = WorkQueue::new(vec![item("001"), item("002")]);

        let retry = queue.pop().await.unwrap();
        queue.requeue(retry);
        // Front requeue beats the never-attempted 002.
        assert_eq!(pop_name(&queue).await, "001");

        let retry = queue.pop().await.unwrap();
        assert_eq!(retry.test.id.name(), "002");
        let mut spent = retry;
        spent.front_requeued = true;
        queue.push_back(item("003"));
        queue.requeue(spent);
        // Second requeue of 002 goes behind 003.
        assert_eq!(pop_name(&queue).await, "003");
        assert_eq!(pop_name(&queue).await, "002");
    }

    #[tokio::test]
    async fn close_wakes_blocked_poppers() {
        let queue = std::sync::Arc::new(WorkQueue::<Stub>::new(Vec::new()));
        let popper = tokio::spawn({
            let queue = queue.clone();
            async move { queue.pop().await }
        });
        tokio::task::yield_now().await;
        queue.close();
        assert!(popper.await.unwrap().is_none());
    }

    #[tokio::test]
    async fn push_wakes_blocked_popper() {
        let queue = std::sync::Arc::new(WorkQueue::<Stub>::new(Vec::new()));
        let popper = tokio::spawn({
            let queue = queue.clone();
            async move { queue.pop().await }
        });
        tokio::task::yield_now().await;
        queue.push_back(item("004"));
        let popped = popper.await.unwrap().unwrap();
        assert_eq!(popped.test.id.name(), "004");
    }

    #[tokio::test]
    async fn drain_remaining_empties_queue() {
        let queue = WorkQueue::new(vec![item("001"), item("002")]);
        let drained = queue.drain_remaining();
        assert_eq!(drained.len(), 2);
        assert!(queue.is_empty());
    }
}
