//! Bounded pool of reusable batches shared between loader threads and the
//! training loop.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use log::{debug, warn};

/// One batch of flattened inputs and class-index labels.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Batch {
    pub inputs: Vec<f32>,
    pub labels: Vec<f32>,
}

impl Batch {
    pub fn with_capacity(inputs: usize, labels: usize) -> Self {
        Self {
            inputs: vec![0.0; inputs],
            labels: vec![0.0; labels],
        }
    }
}

/// Fills batches in place. Returning `Ok(false)` ends the stream.
pub trait BatchSource: Send {
    fn fill(&mut self, batch: &mut Batch) -> anyhow::Result<bool>;
}

#[derive(Default)]
struct State {
    empty: VecDeque<Batch>,
    full: VecDeque<Batch>,
    closed: bool,
}

pub struct BatchQueue {
    state: Mutex<State>,
    changed: Condvar,
}

impl BatchQueue {
    /// Pre-allocates `capacity` empty batches of the given sizes.
    pub fn new(capacity: usize, inputs: usize, labels: usize) -> Self {
        let empty = (0..capacity.max(1)).map(|_| Batch::with_capacity(inputs, labels)).collect();
        Self {
            state: Mutex::new(State { empty, ..State::default() }),
            changed: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait_for(&self, drain: bool, pick: impl Fn(&mut State) -> &mut VecDeque<Batch>) -> Option<Batch> {
        let mut state = self.lock();
        loop {
            if state.closed && !drain {
                return None;
            }
            if let Some(batch) = pick(&mut *state).pop_front() {
                return Some(batch);
            }
            if state.closed {
                return None;
            }
            state = self.changed.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn give(&self, batch: Batch, pick: impl Fn(&mut State) -> &mut VecDeque<Batch>) {
        let mut state = self.lock();
        if !state.closed {
            pick(&mut *state).push_back(batch);
        }
        drop(state);
        self.changed.notify_all();
    }

    /// Blocks until a batch is free to fill; `None` once closed.
    pub fn take_empty(&self) -> Option<Batch> {
        self.wait_for(false, |s| &mut s.empty)
    }

    pub fn put_full(&self, batch: Batch) {
        self.give(batch, |s| &mut s.full)
    }

    /// Blocks until a filled batch is ready; `None` once closed and drained.
    pub fn take_full(&self) -> Option<Batch> {
        self.wait_for(true, |s| &mut s.full)
    }

    /// Hands a consumed batch back for refilling.
    pub fn put_empty(&self, batch: Batch) {
        self.give(batch, |s| &mut s.empty)
    }

    /// Wakes every waiter. Filled batches can still be taken, nothing else.
    pub fn close(&self) {
        self.lock().closed = true;
        self.changed.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Runs `source` on its own thread until it is exhausted, fails, or the
    /// queue closes. An exhausted or failed source closes the queue.
    pub fn spawn_producer<S>(self: &Arc<Self>, mut source: S) -> JoinHandle<anyhow::Result<()>>
    where
        S: BatchSource + 'static,
    {
        let queue = Arc::clone(self);
        thread::spawn(move || {
            while let Some(mut batch) = queue.take_empty() {
                match source.fill(&mut batch) {
                    Ok(true) => queue.put_full(batch),
                    Ok(false) => {
                        debug!("batch source exhausted");
                        queue.close();
                        break;
                    }
                    Err(e) => {
                        warn!("batch source failed: {e:#}");
                        queue.close();
                        return Err(e);
                    }
                }
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counter {
        next: usize,
        end: usize,
    }

    impl BatchSource for Counter {
        fn fill(&mut self, batch: &mut Batch) -> anyhow::Result<bool> {
            if self.next == self.end {
                return Ok(false);
            }
            batch.inputs.fill(self.next as f32);
            batch.labels.fill(self.next as f32);
            self.next += 1;
            Ok(true)
        }
    }

    #[test]
    fn producer_fills_batches_in_order() {
        let queue = Arc::new(BatchQueue::new(2, 3, 1));
        let producer = queue.spawn_producer(Counter { next: 0, end: 5 });

        let mut seen = Vec::new();
        while let Some(batch) = queue.take_full() {
            assert_eq!(batch.inputs, vec![batch.labels[0]; 3]);
            seen.push(batch.labels[0] as usize);
            queue.put_empty(batch);
            if seen.len() == 5 {
                break;
            }
        }
        producer.join().unwrap().unwrap();
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn close_unblocks_consumers() {
        let queue = Arc::new(BatchQueue::new(1, 1, 1));
        let waiter = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.take_full())
        };
        queue.close();
        assert!(waiter.join().unwrap().is_none());
        assert!(queue.take_empty().is_none());
    }

    #[test]
    fn failing_source_closes_queue() {
        struct Broken;
        impl BatchSource for Broken {
            fn fill(&mut self, _batch: &mut Batch) -> anyhow::Result<bool> {
                anyhow::bail!("disk gone")
            }
        }
        let queue = Arc::new(BatchQueue::new(1, 1, 1));
        let producer = queue.spawn_producer(Broken);
        assert!(producer.join().unwrap().is_err());
        assert!(queue.is_closed());
    }
}
