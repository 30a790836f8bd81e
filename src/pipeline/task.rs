//! Sequential task runner
//!
//! An import is a fixed sequence of weighted tasks. Each one moves
//! `Pending → Running → Completed | Failed | Skipped`; a failure stops the
//! sequence unless the task is best-effort.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::ImportContext;
use crate::error::{ImportError, Result};
use crate::progress::{ProgressAggregator, TaskProgress};

/// Lifecycle of one task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskState::Pending => "pending",
            TaskState::Running => "running",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Skipped => "skipped",
        };
        f.write_str(name)
    }
}

/// One stage of an import
#[async_trait]
pub trait ImportTask: Send + Sync {
    fn id(&self) -> &'static str;

    /// Share of the overall progress bar
    fn weight(&self) -> f64;

    /// Failures are logged and the sequence continues
    fn best_effort(&self) -> bool {
        false
    }

    /// Whether the task runs at all for this import
    fn enabled(&self, _ctx: &ImportContext) -> bool {
        true
    }

    async fn run(
        &self,
        ctx: Arc<ImportContext>,
        progress: TaskProgress,
        cancel: CancellationToken,
    ) -> Result<()>;
}

/// Runs tasks in order and records their states
pub struct TaskRunner {
    tasks: Vec<Box<dyn ImportTask>>,
    states: Mutex<Vec<TaskState>>,
}

impl TaskRunner {
    pub fn new(tasks: Vec<Box<dyn ImportTask>>) -> Self {
        let states = Mutex::new(vec![TaskState::Pending; tasks.len()]);
        Self { tasks, states }
    }

    /// `(task id, state)` in run order
    pub fn states(&self) -> Vec<(&'static str, TaskState)> {
        let states = self.states.lock();
        self.tasks.iter().map(|t| t.id()).zip(states.iter().copied()).collect()
    }

    fn set_state(&self, index: usize, state: TaskState) {
        self.states.lock()[index] = state;
    }

    /// Run every task; the first non-best-effort failure is returned wrapped
    /// with the task id
    pub async fn run(
        &self,
        ctx: Arc<ImportContext>,
        aggregator: Arc<ProgressAggregator>,
        cancel: CancellationToken,
    ) -> Result<()> {
        for task in &self.tasks {
            aggregator.register(task.id(), task.weight());
        }

        for (index, task) in self.tasks.iter().enumerate() {
            let id = task.id();
            if cancel.is_cancelled() {
                return Err(ImportError::Cancelled.in_task(id));
            }
            if !task.enabled(&ctx) {
                info!("Skipping {}", id);
                self.set_state(index, TaskState::Skipped);
                aggregator.complete(id);
                continue;
            }

            self.set_state(index, TaskState::Running);
            aggregator.start(id);
            let result = task
                .run(ctx.clone(), aggregator.task(id), cancel.clone())
                .await;

            match result {
                Ok(()) => {
                    self.set_state(index, TaskState::Completed);
                    aggregator.complete(id);
                }
                Err(e) if task.best_effort() && !e.is_cancelled() => {
                    warn!("{} failed, continuing: {}", id, e);
                    self.set_state(index, TaskState::Failed);
                    aggregator.complete(id);
                }
                Err(e) => {
                    self.set_state(index, TaskState::Failed);
                    return Err(e.in_task(id));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::pipeline::ImportStats;
    use crate::retry::RetryPolicy;
    use crate::sink::{SinkOptions, SqliteSink};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Step {
        id: &'static str,
        fail: bool,
        best_effort: bool,
        enabled: bool,
        runs: Arc<AtomicUsize>,
    }

    impl Step {
        fn ok(id: &'static str, runs: &Arc<AtomicUsize>) -> Self {
            Self {
                id,
                fail: false,
                best_effort: false,
                enabled: true,
                runs: runs.clone(),
            }
        }
    }

    #[async_trait]
    impl ImportTask for Step {
        fn id(&self) -> &'static str {
            self.id
        }

        fn weight(&self) -> f64 {
            1.0
        }

        fn best_effort(&self) -> bool {
            self.best_effort
        }

        fn enabled(&self, _ctx: &ImportContext) -> bool {
            self.enabled
        }

        async fn run(
            &self,
            _ctx: Arc<ImportContext>,
            progress: TaskProgress,
            _cancel: CancellationToken,
        ) -> Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ImportError::storage(format!("{} broke", self.id)));
            }
            progress.done("ok");
            Ok(())
        }
    }

    fn context(dir: &tempfile::TempDir) -> Arc<ImportContext> {
        Arc::new(ImportContext {
            config: Config::default(),
            sink: Arc::new(SqliteSink::new(dir.path().join("t.db"), SinkOptions::default())),
            members: Vec::new(),
            retry: RetryPolicy::default(),
            stats: Arc::new(ImportStats::default()),
        })
    }

    #[tokio::test]
    async fn test_failure_stops_sequence_and_names_task() {
        let dir = tempfile::tempdir().unwrap();
        let runs = Arc::new(AtomicUsize::new(0));
        let runner = TaskRunner::new(vec![
            Box::new(Step::ok("first", &runs)),
            Box::new(Step {
                fail: true,
                ..Step::ok("second", &runs)
            }),
            Box::new(Step::ok("third", &runs)),
        ]);

        let err = runner
            .run(context(&dir), Arc::new(ProgressAggregator::default()), CancellationToken::new())
            .await
            .unwrap_err();

        assert!(err.to_string().contains("Task 'second' failed"));
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert_eq!(
            runner.states(),
            vec![
                ("first", TaskState::Completed),
                ("second", TaskState::Failed),
                ("third", TaskState::Pending),
            ]
        );
    }

    #[tokio::test]
    async fn test_best_effort_and_skipped_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let runs = Arc::new(AtomicUsize::new(0));
        let aggregator = Arc::new(ProgressAggregator::default());
        let runner = TaskRunner::new(vec![
            Box::new(Step {
                enabled: false,
                ..Step::ok("skipped", &runs)
            }),
            Box::new(Step {
                fail: true,
                best_effort: true,
                ..Step::ok("flaky", &runs)
            }),
            Box::new(Step::ok("last", &runs)),
        ]);

        runner
            .run(context(&dir), aggregator.clone(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(runs.load(Ordering::SeqCst), 2);
        let states: Vec<TaskState> = runner.states().into_iter().map(|(_, s)| s).collect();
        assert_eq!(
            states,
            vec![TaskState::Skipped, TaskState::Failed, TaskState::Completed]
        );
        assert!((aggregator.fraction() - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let dir = tempfile::tempdir().unwrap();
        let runs = Arc::new(AtomicUsize::new(0));
        let runner = TaskRunner::new(vec![Box::new(Step::ok("only", &runs))]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = runner
            .run(context(&dir), Arc::new(ProgressAggregator::default()), cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }
}
