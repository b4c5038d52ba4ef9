// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Background Job Scheduler
//!
//! A single task owning a deadline-ordered queue of jobs. Due jobs run one at a time, in
//! deadline order, and may schedule follow-up jobs (retries) through the handle they are
//! given. Shutting the scheduler down drops every pending job.

use async_trait::async_trait;
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    sync::mpsc,
    time::{self, Instant},
};
use tracing::debug;

enum Command<J> {
    Schedule(J, Instant),
    Shutdown,
}

/// Runs the jobs of a [`Scheduler`].
#[async_trait]
pub(crate) trait JobHandler<J>: Send + Sync + 'static {
    async fn run(&self, job: J, scheduler: &Scheduler<J>);
}

/// Handle to a running scheduler task. Clones share the same task.
pub(crate) struct Scheduler<J> {
    tx: mpsc::UnboundedSender<Command<J>>,
    stopped: Arc<AtomicBool>,
}

impl<J> Clone for Scheduler<J> {
    fn clone(&self) -> Self {
        Scheduler {
            tx: self.tx.clone(),
            stopped: self.stopped.clone(),
        }
    }
}

impl<J> Scheduler<J>
where
    J: Send + 'static,
{
    /// Spawns the scheduler task. Must be called from within a tokio runtime.
    pub(crate) fn start<H>(handler: H) -> Scheduler<J>
    where
        H: JobHandler<J>,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let scheduler = Scheduler {
            tx,
            stopped: Arc::new(AtomicBool::new(false)),
        };

        tokio::spawn(run_loop(handler, rx, scheduler.clone()));
        scheduler
    }

    /// Runs `job` once `delay` has elapsed. Ignored after shutdown.
    pub(crate) fn schedule(&self, job: J, delay: Duration) {
        if self.is_shutdown() {
            return;
        }
        let _ = self.tx.send(Command::Schedule(job, Instant::now() + delay));
    }

    /// Stops the task and drops pending jobs. A job that is already running finishes.
    pub(crate) fn shutdown(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            let _ = self.tx.send(Command::Shutdown);
        }
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

async fn run_loop<J, H>(
    handler: H,
    mut rx: mpsc::UnboundedReceiver<Command<J>>,
    scheduler: Scheduler<J>,
) where
    J: Send + 'static,
    H: JobHandler<J>,
{
    let mut queue: BTreeMap<(Instant, u64), J> = BTreeMap::new();
    let mut seq = 0u64;

    loop {
        let next_deadline = queue.keys().next().map(|(at, _)| *at);
        let command = match next_deadline {
            Some(deadline) => tokio::select! {
                command = rx.recv() => command,
                _ = time::sleep_until(deadline) => {
                    while let Some(entry) = queue.first_entry() {
                        if entry.key().0 > Instant::now() || scheduler.is_shutdown() {
                            break;
                        }
                        let job = entry.remove();
                        handler.run(job, &scheduler).await;
                    }
                    continue;
                }
            },
            None => rx.recv().await,
        };

        match command {
            Some(Command::Schedule(job, at)) => {
                seq += 1;
                queue.insert((at, seq), job);
            }
            Some(Command::Shutdown) | None => break,
        }
    }

    debug!(dropped = queue.len(), "scheduler stopped");
}
