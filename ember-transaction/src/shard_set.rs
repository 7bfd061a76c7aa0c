//! Shard-thread pool dispatching closures into shard-owned event loops.
//!
//! Each shard owner is one OS thread draining an unbounded task channel, so shard state is
//! strictly single-threaded and tasks never contend on it. Coordinators communicate with
//! shards only by posting closures here; posting crosses the channel's memory barrier, which
//! makes coordinator-side writes visible to the receiving shard thread.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use ember_common::event_count::EventCount;
use ember_common::ids::{ShardCount, ShardId};
use tokio::sync::mpsc;

use crate::shard::EngineShard;

/// Unit of work executed on one shard thread.
pub type ShardTask = Box<dyn FnOnce(&mut EngineShard) + Send>;

/// Pool of shard-owner threads addressed by shard id.
pub struct ShardSet {
    senders: Vec<mpsc::UnboundedSender<ShardTask>>,
    workers: Vec<thread::JoinHandle<()>>,
    shard_count: ShardCount,
}

impl std::fmt::Debug for ShardSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardSet")
            .field("shard_count", &self.shard_count)
            .field("workers", &self.workers.len())
            .finish()
    }
}

impl ShardSet {
    /// Spawns one owner thread per shard.
    #[must_use]
    pub fn new(shard_count: ShardCount) -> Self {
        let len = shard_count.as_usize();
        let mut senders = Vec::with_capacity(len);
        let mut workers = Vec::with_capacity(len);
        for sid in 0..shard_count.get() {
            let (sender, receiver) = mpsc::unbounded_channel::<ShardTask>();
            senders.push(sender);
            workers.push(thread::spawn(move || shard_thread_main(sid, receiver)));
        }
        Self {
            senders,
            workers,
            shard_count,
        }
    }

    /// Number of shards served by this pool.
    #[must_use]
    pub fn size(&self) -> usize {
        self.shard_count.as_usize()
    }

    /// Shard count as the validated newtype.
    #[must_use]
    pub fn shard_count(&self) -> ShardCount {
        self.shard_count
    }

    /// Posts one task to a shard's event loop without waiting for it.
    ///
    /// # Panics
    ///
    /// Panics when `sid` is out of range or the pool is shutting down; both are invariant
    /// breaches on the coordinator side.
    pub fn add<F>(&self, sid: ShardId, task: F)
    where
        F: FnOnce(&mut EngineShard) + Send + 'static,
    {
        let sender = self
            .senders
            .get(usize::from(sid))
            .expect("shard id out of range");
        sender
            .send(Box::new(task))
            .expect("shard worker channel closed");
    }

    /// Runs `f` on every shard accepted by `filter` and waits for all invocations to finish.
    ///
    /// `f` must not block; shard threads run it inline between queued tasks.
    pub fn run_brief_in_parallel<F, P>(&self, f: F, filter: P)
    where
        F: Fn(&mut EngineShard) + Send + Sync + 'static,
        P: Fn(ShardId) -> bool,
    {
        let targets = (0..self.shard_count.get())
            .filter(|sid| filter(*sid))
            .collect::<Vec<_>>();
        if targets.is_empty() {
            return;
        }

        let f = Arc::new(f);
        let pending = Arc::new(AtomicUsize::new(targets.len()));
        let done = Arc::new(EventCount::new());
        for sid in targets {
            let f = Arc::clone(&f);
            let pending = Arc::clone(&pending);
            let done = Arc::clone(&done);
            self.add(sid, move |shard| {
                f(shard);
                if pending.fetch_sub(1, Ordering::Release) == 1 {
                    done.notify();
                }
            });
        }
        done.wait(|| pending.load(Ordering::Acquire) == 0);
    }
}

impl Drop for ShardSet {
    fn drop(&mut self) {
        self.senders.clear();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn shard_thread_main(shard_id: ShardId, mut receiver: mpsc::UnboundedReceiver<ShardTask>) {
    let mut shard = EngineShard::new(shard_id);
    while let Some(task) = receiver.blocking_recv() {
        task(&mut shard);
    }
}

#[cfg(test)]
mod tests {
    use super::ShardSet;
    use ember_common::ids::ShardCount;
    use googletest::prelude::*;
    use rstest::rstest;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn pool(count: u16) -> ShardSet {
        ShardSet::new(ShardCount::new(count).expect("literal is valid"))
    }

    #[rstest]
    fn add_runs_task_on_owning_shard_thread() {
        let shard_set = pool(2);
        let (sender, receiver) = std::sync::mpsc::channel();
        shard_set.add(1, move |shard| {
            let _ = sender.send(shard.shard_id());
        });
        assert_that!(receiver.recv().expect("task must run"), eq(1_u16));
    }

    #[rstest]
    fn run_brief_in_parallel_visits_every_selected_shard() {
        let shard_set = pool(4);
        let visits = Arc::new(AtomicUsize::new(0));
        {
            let visits = Arc::clone(&visits);
            shard_set.run_brief_in_parallel(
                move |_shard| {
                    let _ = visits.fetch_add(1, Ordering::Relaxed);
                },
                |_| true,
            );
        }
        assert_that!(visits.load(Ordering::Relaxed), eq(4_usize));
    }

    #[rstest]
    fn run_brief_in_parallel_honors_filter() {
        let shard_set = pool(4);
        let visits = Arc::new(AtomicUsize::new(0));
        {
            let visits = Arc::clone(&visits);
            shard_set.run_brief_in_parallel(
                move |shard| {
                    let _ = visits.fetch_add(usize::from(shard.shard_id()) + 1, Ordering::Relaxed);
                },
                |sid| sid % 2 == 0,
            );
        }
        // Shards 0 and 2 contribute 1 + 3.
        assert_that!(visits.load(Ordering::Relaxed), eq(4_usize));
    }
}
