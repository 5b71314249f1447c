//! Engine — queue plus the processor that drains it.
//!
//! The processor is the single, process-lifetime scheduler. Ingress calls
//! [`Processor::trigger`] after every admission for an immediate dispatch
//! attempt; a one-second fallback tick covers any missed wakeup. Worker
//! errors and panics are absorbed at the dispatch boundary and become task
//! failures — the processor itself never dies.

pub mod queue;
pub mod runner;

use crate::state::StateStore;
use queue::TaskQueue;
use runner::AgentRunner;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

pub struct Processor {
    queue: Arc<TaskQueue>,
    state: Arc<StateStore>,
    runner: Arc<AgentRunner>,
    started: AtomicBool,
    /// Serializes dispatch passes so concurrent triggers cannot double-claim
    /// the queue head or overshoot the concurrency limit.
    dispatch_lock: Mutex<()>,
}

impl Processor {
    pub fn new(
        queue: Arc<TaskQueue>,
        state: Arc<StateStore>,
        runner: Arc<AgentRunner>,
    ) -> Arc<Self> {
        Arc::new(Self {
            queue,
            state,
            runner,
            started: AtomicBool::new(false),
            dispatch_lock: Mutex::new(()),
        })
    }

    /// Start the fallback tick loop. Idempotent; repeat calls warn and no-op.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            tracing::warn!("processor already started");
            return;
        }
        tracing::info!("processor started");
        let processor = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                processor.dispatch().await;
            }
        });
    }

    /// Request an immediate dispatch attempt. Called by ingress after every
    /// admission and by workers when they finish.
    pub fn trigger(self: &Arc<Self>) {
        let processor = self.clone();
        tokio::spawn(async move {
            processor.dispatch().await;
        });
    }

    /// Claim and launch pending tasks while capacity remains.
    async fn dispatch(self: &Arc<Self>) {
        let _guard = self.dispatch_lock.lock().await;
        while self.queue.can_start_new() {
            let Some(mut task) = self.queue.next() else {
                break;
            };
            self.queue.mark_running(&mut task);
            self.persist();

            tracing::info!(
                issue = %task.identifier,
                repo = %task.repo,
                "dispatching task"
            );
            let processor = self.clone();
            tokio::spawn(async move {
                let issue_id = task.issue_id.clone();
                let identifier = task.identifier.clone();

                // Run the worker in its own task so a panic surfaces as a
                // JoinError here instead of silently leaking the slot.
                let runner = processor.runner.clone();
                let worker = tokio::spawn(async move { runner.run(&task).await });

                match worker.await {
                    Ok(Ok(outcome)) => {
                        tracing::info!(
                            issue = %identifier,
                            has_changes = outcome.has_changes,
                            pr_url = outcome.pr_url.as_deref().unwrap_or(""),
                            "task completed"
                        );
                        processor.queue.mark_complete(&issue_id);
                    }
                    Ok(Err(e)) => {
                        processor.queue.mark_failed(&issue_id, Some(&e.to_string()));
                    }
                    Err(join_err) => {
                        tracing::error!(issue = %identifier, ?join_err, "worker panicked");
                        processor
                            .queue
                            .mark_failed(&issue_id, Some("worker panicked"));
                    }
                }
                processor.persist();
                // Self-re-arm: a slot just freed, try the next pending task.
                processor.trigger();
            });
        }
    }

    /// Persist the running snapshot. A failed write is logged, never fatal.
    fn persist(&self) {
        if let Err(e) = self.state.save(self.queue.running_tasks()) {
            tracing::warn!(?e, "failed to persist running snapshot");
        }
    }
}
