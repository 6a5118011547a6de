//! The "SCHEDULER" - Cooperative Priority-Laned Work Queue
//!
//! Every reaction to an inbound event runs through here, one task at a
//! time, so a task never observes another one half-done. Three lanes are
//! drained in strict order (high, normal, low), FIFO within a lane.
//!
//! A run-loop turn ends once the yield budget is spent; the remaining work
//! waits for the next turn. This bounds how long a burst of simultaneous
//! reports can hold the host's run-loop.
//!
//! Ordering is priority-then-FIFO, not arrival order across lanes. Callers
//! that need strict sequencing (all reports of one identity) must submit at
//! a single priority.

use crate::config::SchedulerConfig;
use std::collections::hash_map::DefaultHasher;
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{trace, warn};
use trackview_env::TrackViewContext;

/// Scheduler lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Priority {
    High,
    Normal,
    Low,
}

impl Priority {
    const ALL: [Priority; 3] = [Priority::High, Priority::Normal, Priority::Low];

    fn lane(self) -> usize {
        match self {
            Priority::High => 0,
            Priority::Normal => 1,
            Priority::Low => 2,
        }
    }
}

/// A queued unit of work operating on the scheduler's target.
pub type Task<T> = Box<dyn FnOnce(&mut T) -> Result<(), TaskError> + Send>;

struct QueuedTask<T> {
    seq: u64,
    name: &'static str,
    task: Task<T>,
}

/// Result of one run-loop turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    /// Every lane is empty
    Idle,

    /// Budget spent with work remaining
    Yielded,
}

/// Counters for observability and tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub submitted: u64,
    pub collapsed: u64,
    pub completed: u64,
    pub failed: u64,
    pub panicked: u64,
    pub yields: u64,
}

pub struct TaskScheduler<Ctx: TrackViewContext, T> {
    context: Arc<Ctx>,
    config: SchedulerConfig,
    lanes: [VecDeque<QueuedTask<T>>; 3],
    next_seq: u64,

    /// Fingerprint and sequence number of the last submission, if it came
    /// through `submit_if_distinct` and has not run yet
    last_distinct: Option<(u64, u64)>,

    stats: SchedulerStats,
}

impl<Ctx: TrackViewContext, T> TaskScheduler<Ctx, T> {
    pub fn new(context: Arc<Ctx>, config: SchedulerConfig) -> Self {
        Self {
            context,
            config,
            lanes: [VecDeque::new(), VecDeque::new(), VecDeque::new()],
            next_seq: 0,
            last_distinct: None,
            stats: SchedulerStats::default(),
        }
    }

    pub fn with_defaults(context: Arc<Ctx>) -> Self {
        Self::new(context, SchedulerConfig::default())
    }

    /// Enqueues `task` at the back of its lane.
    pub fn submit<F>(&mut self, priority: Priority, name: &'static str, task: F)
    where
        F: FnOnce(&mut T) -> Result<(), TaskError> + Send + 'static,
    {
        self.last_distinct = None;
        self.enqueue(priority, name, Box::new(task));
    }

    /// Enqueues `task` unless the immediately previous submission was the
    /// same call (same `name` and an equal `key`) and is still pending.
    ///
    /// Returns false when the call was collapsed.
    pub fn submit_if_distinct<K, F>(
        &mut self,
        priority: Priority,
        name: &'static str,
        key: &K,
        task: F,
    ) -> bool
    where
        K: Hash + ?Sized,
        F: FnOnce(&mut T) -> Result<(), TaskError> + Send + 'static,
    {
        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        key.hash(&mut hasher);
        let fingerprint = hasher.finish();

        if let Some((last, _)) = self.last_distinct {
            if last == fingerprint {
                self.stats.collapsed += 1;
                trace!(task = name, "collapsed repeated submission");
                return false;
            }
        }

        let seq = self.enqueue(priority, name, Box::new(task));
        self.last_distinct = Some((fingerprint, seq));
        true
    }

    fn enqueue(&mut self, priority: Priority, name: &'static str, task: Task<T>) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.stats.submitted += 1;
        self.lanes[priority.lane()].push_back(QueuedTask { seq, name, task });
        seq
    }

    fn dequeue(&mut self) -> Option<QueuedTask<T>> {
        for priority in Priority::ALL {
            if let Some(queued) = self.lanes[priority.lane()].pop_front() {
                if matches!(self.last_distinct, Some((_, seq)) if seq == queued.seq) {
                    self.last_distinct = None;
                }
                return Some(queued);
            }
        }
        None
    }

    /// Drains tasks until every lane is empty or the yield budget for this
    /// turn is spent.
    ///
    /// A failing or panicking task is logged and counted; draining goes on.
    pub fn run_turn(&mut self, target: &mut T) -> TurnOutcome {
        let turn_started = self.context.now();
        let budget = self.config.yield_budget();

        loop {
            if self.is_empty() {
                return TurnOutcome::Idle;
            }
            if self.context.now().saturating_sub(turn_started) > budget {
                self.stats.yields += 1;
                trace!(pending = self.len(), "yield budget spent");
                return TurnOutcome::Yielded;
            }

            let Some(queued) = self.dequeue() else {
                return TurnOutcome::Idle;
            };
            let name = queued.name;
            let task = queued.task;

            match panic::catch_unwind(AssertUnwindSafe(|| task(target))) {
                Ok(Ok(())) => self.stats.completed += 1,
                Ok(Err(e)) => {
                    self.stats.failed += 1;
                    warn!(task = name, error = %e, "scheduled task failed");
                }
                Err(_) => {
                    self.stats.panicked += 1;
                    warn!(task = name, "scheduled task panicked");
                }
            }
        }
    }

    /// Runs turns until idle, handing control back to the host run-loop
    /// between turns. Returns the number of turns taken.
    pub async fn run(&mut self, target: &mut T) -> usize {
        let mut turns = 0;
        loop {
            turns += 1;
            match self.run_turn(target) {
                TurnOutcome::Idle => return turns,
                TurnOutcome::Yielded => self.context.yield_now().await,
            }
        }
    }

    /// Number of pending tasks across all lanes.
    pub fn len(&self) -> usize {
        self.lanes.iter().map(|lane| lane.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.lanes.iter().all(|lane| lane.is_empty())
    }

    /// Pending tasks in one lane.
    pub fn lane_len(&self, priority: Priority) -> usize {
        self.lanes[priority.lane()].len()
    }

    pub fn stats(&self) -> &SchedulerStats {
        &self.stats
    }
}

/// Errors a scheduled task may report.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Task failed: {0}")]
    Failed(String),
}

impl TaskError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ManualContext;
    use std::time::Duration;

    fn scheduler(ctx: &Arc<ManualContext>) -> TaskScheduler<ManualContext, Vec<&'static str>> {
        TaskScheduler::with_defaults(ctx.clone())
    }

    #[test]
    fn test_lanes_drain_in_priority_order() {
        let ctx = ManualContext::shared();
        let mut scheduler = scheduler(&ctx);
        let mut log = Vec::new();

        scheduler.submit(Priority::Low, "low", |log: &mut Vec<&str>| {
            log.push("low");
            Ok(())
        });
        scheduler.submit(Priority::Normal, "n1", |log: &mut Vec<&str>| {
            log.push("n1");
            Ok(())
        });
        scheduler.submit(Priority::High, "high", |log: &mut Vec<&str>| {
            log.push("high");
            Ok(())
        });
        scheduler.submit(Priority::Normal, "n2", |log: &mut Vec<&str>| {
            log.push("n2");
            Ok(())
        });

        assert_eq!(scheduler.run_turn(&mut log), TurnOutcome::Idle);
        assert_eq!(log, vec!["high", "n1", "n2", "low"]);
        assert_eq!(scheduler.stats().completed, 4);
    }

    #[test]
    fn test_identical_consecutive_call_collapsed() {
        let ctx = ManualContext::shared();
        let mut scheduler = scheduler(&ctx);

        let push = |log: &mut Vec<&str>| -> Result<(), TaskError> {
            log.push("resize");
            Ok(())
        };
        assert!(scheduler.submit_if_distinct(Priority::Low, "resize", &(800u32, 600u32), push));
        assert!(!scheduler.submit_if_distinct(Priority::Low, "resize", &(800u32, 600u32), push));
        assert!(scheduler.submit_if_distinct(Priority::Low, "resize", &(1024u32, 768u32), push));
        assert_eq!(scheduler.len(), 2);
        assert_eq!(scheduler.stats().collapsed, 1);
    }

    #[test]
    fn test_intervening_submit_breaks_collapse() {
        let ctx = ManualContext::shared();
        let mut scheduler = scheduler(&ctx);

        let push = |log: &mut Vec<&str>| -> Result<(), TaskError> {
            log.push("resize");
            Ok(())
        };
        scheduler.submit_if_distinct(Priority::Low, "resize", &1u8, push);
        scheduler.submit(Priority::Normal, "other", |_: &mut Vec<&str>| Ok(()));
        assert!(scheduler.submit_if_distinct(Priority::Low, "resize", &1u8, push));
        assert_eq!(scheduler.len(), 3);
    }

    #[test]
    fn test_executed_call_no_longer_collapses() {
        let ctx = ManualContext::shared();
        let mut scheduler = scheduler(&ctx);
        let mut log = Vec::new();

        let push = |log: &mut Vec<&str>| -> Result<(), TaskError> {
            log.push("resize");
            Ok(())
        };
        scheduler.submit_if_distinct(Priority::Low, "resize", &1u8, push);
        scheduler.run_turn(&mut log);
        assert!(scheduler.submit_if_distinct(Priority::Low, "resize", &1u8, push));
        scheduler.run_turn(&mut log);
        assert_eq!(log, vec!["resize", "resize"]);
    }

    #[test]
    fn test_failing_and_panicking_tasks_are_isolated() {
        let ctx = ManualContext::shared();
        let mut scheduler = scheduler(&ctx);
        let mut log = Vec::new();

        scheduler.submit(Priority::Normal, "bad", |_: &mut Vec<&str>| {
            Err(TaskError::failed("boom"))
        });
        scheduler.submit(Priority::Normal, "worse", |_: &mut Vec<&str>| panic!("kaboom"));
        scheduler.submit(Priority::Normal, "good", |log: &mut Vec<&str>| {
            log.push("good");
            Ok(())
        });

        assert_eq!(scheduler.run_turn(&mut log), TurnOutcome::Idle);
        assert_eq!(log, vec!["good"]);
        assert_eq!(scheduler.stats().failed, 1);
        assert_eq!(scheduler.stats().panicked, 1);
        assert_eq!(scheduler.stats().completed, 1);
    }

    #[test]
    fn test_budget_defers_remaining_work_to_next_turn() {
        let ctx = ManualContext::shared();
        let mut scheduler: TaskScheduler<ManualContext, Vec<&'static str>> =
            TaskScheduler::new(ctx.clone(), SchedulerConfig { yield_budget_ms: 30 });
        let mut log = Vec::new();

        for _ in 0..5 {
            let clock = ctx.clone();
            scheduler.submit(Priority::Normal, "slow", move |log: &mut Vec<&str>| {
                clock.advance(Duration::from_millis(20));
                log.push("slow");
                Ok(())
            });
        }

        // 20 ms, then 40 ms > 30 ms budget: two tasks per turn
        assert_eq!(scheduler.run_turn(&mut log), TurnOutcome::Yielded);
        assert_eq!(log.len(), 2);
        assert_eq!(scheduler.run_turn(&mut log), TurnOutcome::Yielded);
        assert_eq!(log.len(), 4);
        assert_eq!(scheduler.run_turn(&mut log), TurnOutcome::Idle);
        assert_eq!(log.len(), 5);
        assert_eq!(scheduler.stats().yields, 2);
    }

    #[tokio::test]
    async fn test_run_yields_to_host_between_turns() {
        let ctx = ManualContext::shared();
        let mut scheduler = scheduler(&ctx);
        let mut log = Vec::new();

        for _ in 0..3 {
            let clock = ctx.clone();
            scheduler.submit(Priority::Normal, "slow", move |log: &mut Vec<&str>| {
                clock.advance(Duration::from_millis(31));
                log.push("slow");
                Ok(())
            });
        }

        let turns = scheduler.run(&mut log).await;
        assert_eq!(turns, 3);
        assert_eq!(ctx.yields(), 2);
        assert!(scheduler.is_empty());
    }
}
