use crate::resource::ObjectId;

use backoff::{backoff::Backoff, ExponentialBackoff};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug)]
pub(crate) struct CappedBackoff(ExponentialBackoff);

impl Backoff for CappedBackoff {
    fn next_backoff(&mut self) -> Option<Duration> {
        let CappedBackoff(exp) = self;
        exp.next_backoff()
    }

    fn reset(&mut self) {
        let CappedBackoff(exp) = self;
        exp.reset()
    }
}

impl CappedBackoff {
    pub(crate) fn new(initial: Duration, max: Duration) -> CappedBackoff {
        let mut exp = ExponentialBackoff {
            initial_interval: initial,
            max_interval: max,
            max_elapsed_time: None,
            ..Default::default()
        };
        exp.reset();
        CappedBackoff(exp)
    }
}

/// What happened to a key that was handed out by the queue
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Outcome {
    Done,
    /// Try again later, with exponential backoff per key
    Retry,
}

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<ObjectId>,
    queued: HashSet<ObjectId>,
    in_flight: HashSet<ObjectId>,
    // keys that changed while a pass for them was running
    dirty: HashSet<ObjectId>,
    backoffs: HashMap<ObjectId, CappedBackoff>,
    retries_scheduled: usize,
}

/// A work queue keyed by virtual object id. A key is either pending, or in flight, never both:
/// keys added while in flight are marked dirty and queued once more when the pass finishes.
#[derive(Debug)]
pub(crate) struct WorkQueue {
    name: String,
    state: Mutex<QueueState>,
    notify: Notify,
    initial_delay: Duration,
    max_delay: Duration,
    shutdown: CancellationToken,
}

impl WorkQueue {
    pub(crate) fn new(
        name: impl Into<String>,
        initial_delay: Duration,
        max_delay: Duration,
        shutdown: CancellationToken,
    ) -> WorkQueue {
        WorkQueue {
            name: name.into(),
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            initial_delay,
            max_delay,
            shutdown,
        }
    }

    pub(crate) fn add(&self, key: ObjectId) {
        let mut state = self.state.lock();
        if state.in_flight.contains(&key) {
            log::trace!("queue '{}' marking in flight key {} as dirty", self.name, key);
            state.dirty.insert(key);
        } else if state.queued.insert(key.clone()) {
            state.pending.push_back(key);
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Waits for the next key, and marks it in flight. Returns `None` once shut down.
    pub(crate) async fn next(&self) -> Option<ObjectId> {
        loop {
            if self.shutdown.is_cancelled() {
                return None;
            }
            {
                let mut state = self.state.lock();
                if let Some(key) = state.pending.pop_front() {
                    state.queued.remove(&key);
                    state.in_flight.insert(key.clone());
                    return Some(key);
                }
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = self.shutdown.cancelled() => return None,
            }
        }
    }

    pub(crate) fn done(self: &Arc<Self>, key: ObjectId, outcome: Outcome) {
        let mut state = self.state.lock();
        state.in_flight.remove(&key);
        let dirty = state.dirty.remove(&key);

        let retry_delay = match outcome {
            Outcome::Done => {
                state.backoffs.remove(&key);
                None
            }
            Outcome::Retry => {
                let (initial, max) = (self.initial_delay, self.max_delay);
                let delay = state
                    .backoffs
                    .entry(key.clone())
                    .or_insert_with(|| CappedBackoff::new(initial, max))
                    .next_backoff()
                    .unwrap_or(max);
                Some(delay)
            }
        };

        if dirty {
            // something changed during the pass, so run it again right away
            drop(state);
            self.add(key);
        } else if let Some(delay) = retry_delay {
            state.retries_scheduled += 1;
            drop(state);
            log::debug!(
                "queue '{}' will retry {} in {}ms",
                self.name,
                key,
                super::duration_to_millis(delay)
            );
            self.schedule_retry(key, delay);
        }
    }

    fn schedule_retry(self: &Arc<Self>, key: ObjectId, delay: Duration) {
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    queue.state.lock().retries_scheduled -= 1;
                    queue.add(key);
                }
                _ = queue.shutdown.cancelled() => {
                    queue.state.lock().retries_scheduled -= 1;
                }
            }
        });
    }

    pub(crate) fn len(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Nothing pending, in flight or waiting for a retry
    pub(crate) fn is_idle(&self) -> bool {
        let state = self.state.lock();
        state.pending.is_empty() && state.in_flight.is_empty() && state.retries_scheduled == 0
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn queue() -> Arc<WorkQueue> {
        Arc::new(WorkQueue::new(
            "test",
            Duration::from_millis(5),
            Duration::from_millis(20),
            CancellationToken::new(),
        ))
    }

    #[tokio::test]
    async fn keys_are_coalesced_while_pending() {
        let queue = queue();
        queue.add(ObjectId::new("ns", "a"));
        queue.add(ObjectId::new("ns", "a"));
        queue.add(ObjectId::new("ns", "b"));
        assert_eq!(2, queue.len());
        assert_eq!(Some(ObjectId::new("ns", "a")), queue.next().await);
        assert_eq!(Some(ObjectId::new("ns", "b")), queue.next().await);
    }

    #[tokio::test]
    async fn keys_added_while_in_flight_run_once_more() {
        let queue = queue();
        let key = ObjectId::new("ns", "a");
        queue.add(key.clone());
        let in_flight = queue.next().await.unwrap();
        queue.add(key.clone());
        queue.add(key.clone());
        assert_eq!(0, queue.len());
        assert!(!queue.is_idle());

        queue.done(in_flight, Outcome::Done);
        assert_eq!(1, queue.len());
        let again = queue.next().await.unwrap();
        queue.done(again, Outcome::Done);
        assert!(queue.is_idle());
    }

    #[tokio::test]
    async fn failed_keys_are_retried_after_a_delay() {
        let queue = queue();
        let key = ObjectId::new("ns", "a");
        queue.add(key.clone());
        let in_flight = queue.next().await.unwrap();
        queue.done(in_flight, Outcome::Retry);
        assert_eq!(0, queue.len());
        assert!(!queue.is_idle());

        let retried = tokio::time::timeout(Duration::from_secs(1), queue.next())
            .await
            .unwrap();
        assert_eq!(Some(key), retried);
    }

    #[tokio::test]
    async fn shutdown_stops_handing_out_keys() {
        let token = CancellationToken::new();
        let queue = Arc::new(WorkQueue::new(
            "test",
            Duration::from_millis(5),
            Duration::from_millis(20),
            token.clone(),
        ));
        queue.add(ObjectId::new("ns", "a"));
        token.cancel();
        assert_eq!(None, queue.next().await);
    }

    #[test]
    fn backoff_is_capped() {
        let mut backoff = CappedBackoff::new(Duration::from_millis(100), Duration::from_millis(400));
        for _ in 0..20 {
            let next = backoff.next_backoff().unwrap();
            // the randomization factor may push a single interval above the cap by up to 50%
            assert!(next <= Duration::from_millis(600));
        }
    }
}
