//! Weighted progress across import tasks
//!
//! Every task declares a relative weight. Tasks report samples as
//! `(delta, current_max)` pairs where `current_max` may grow as better size
//! estimates arrive. The aggregator folds those into one value in
//! `[0, total_weight]` that never moves backward: a task whose estimate grows
//! mid-run makes the display hold until real progress catches up.

mod reporter;

pub use reporter::{BarReporter, LogReporter, ProgressReporter};

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

/// One progress report from a running task
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSample {
    pub task_id: String,
    pub message: String,
    pub delta: f64,
    pub current_max: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Pending,
    Running,
    Done,
}

#[derive(Debug)]
struct TaskEntry {
    id: String,
    weight: f64,
    ticks: f64,
    max: f64,
    status: Status,
}

impl TaskEntry {
    fn fraction(&self) -> f64 {
        match self.status {
            Status::Done => 1.0,
            Status::Pending => 0.0,
            Status::Running if self.max > 0.0 => (self.ticks / self.max).clamp(0.0, 1.0),
            Status::Running => 0.0,
        }
    }
}

#[derive(Debug, Default)]
struct State {
    tasks: Vec<TaskEntry>,
    displayed: f64,
}

impl State {
    fn total_weight(&self) -> f64 {
        self.tasks.iter().map(|t| t.weight).sum()
    }

    fn raw(&self) -> f64 {
        self.tasks.iter().map(|t| t.weight * t.fraction()).sum()
    }

    /// Weight of every task declared before `index`
    fn checkpoint(&self, index: usize) -> f64 {
        self.tasks[..index].iter().map(|t| t.weight).sum()
    }

    fn position(&self, task_id: &str) -> Option<usize> {
        self.tasks.iter().position(|t| t.id == task_id)
    }

    fn raise(&mut self, candidate: f64) -> f64 {
        let total = self.total_weight();
        self.displayed = self.displayed.max(candidate.min(total));
        self.displayed
    }
}

/// Combines per-task progress into one monotonic indicator
pub struct ProgressAggregator {
    state: Mutex<State>,
    reporters: Vec<Arc<dyn ProgressReporter>>,
}

impl Default for ProgressAggregator {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl ProgressAggregator {
    pub fn new(reporters: Vec<Arc<dyn ProgressReporter>>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            reporters,
        }
    }

    /// Declare a task. Tasks are displayed in registration order.
    pub fn register(&self, task_id: &str, weight: f64) {
        let mut state = self.state.lock();
        if state.position(task_id).is_some() {
            return;
        }
        state.tasks.push(TaskEntry {
            id: task_id.to_string(),
            weight: weight.max(0.0),
            ticks: 0.0,
            max: 0.0,
            status: Status::Pending,
        });
    }

    /// Mark a task as running; the display jumps to at least its checkpoint
    pub fn start(&self, task_id: &str) {
        let mut state = self.state.lock();
        let Some(index) = state.position(task_id) else {
            return;
        };
        state.tasks[index].status = Status::Running;
        let checkpoint = state.checkpoint(index);
        let shown = state.raise(checkpoint);
        let fraction = fraction_of(shown, state.total_weight());
        for reporter in &self.reporters {
            reporter.task_started(task_id, fraction);
        }
    }

    /// Fold a sample into the running totals and notify reporters.
    ///
    /// Reporters run under the state lock so they see displayed values in order.
    pub fn report(&self, sample: ProgressSample) {
        let mut state = self.state.lock();
        let Some(index) = state.position(&sample.task_id) else {
            debug!("Progress sample for unknown task '{}'", sample.task_id);
            return;
        };
        let task = &mut state.tasks[index];
        if task.status == Status::Pending {
            task.status = Status::Running;
        }
        task.ticks += sample.delta.max(0.0);
        // Estimates may grow or shrink; never below what was already done
        task.max = sample.current_max.max(task.ticks);

        let raw = state.raw();
        let shown = state.raise(raw);
        let fraction = fraction_of(shown, state.total_weight());
        for reporter in &self.reporters {
            reporter.sample(&sample, fraction);
        }
    }

    /// Mark a task finished (completed or skipped); its full weight counts
    pub fn complete(&self, task_id: &str) {
        let mut state = self.state.lock();
        let Some(index) = state.position(task_id) else {
            return;
        };
        state.tasks[index].status = Status::Done;
        let checkpoint = state.checkpoint(index + 1);
        let raw = state.raw();
        let shown = state.raise(raw.max(checkpoint));
        let fraction = fraction_of(shown, state.total_weight());
        for reporter in &self.reporters {
            reporter.task_finished(task_id, fraction);
        }
    }

    /// Current displayed value in weight units
    pub fn display(&self) -> f64 {
        self.state.lock().displayed
    }

    /// Current displayed value as a fraction of the total weight
    pub fn fraction(&self) -> f64 {
        let state = self.state.lock();
        fraction_of(state.displayed, state.total_weight())
    }

    pub fn total_weight(&self) -> f64 {
        self.state.lock().total_weight()
    }

    /// Close out every reporter
    pub fn finish(&self, message: &str) {
        for reporter in &self.reporters {
            reporter.finish(message);
        }
    }

    /// Progress handle for one task
    pub fn task(self: &Arc<Self>, task_id: &str) -> TaskProgress {
        TaskProgress {
            task_id: task_id.to_string(),
            aggregator: self.clone(),
        }
    }
}

fn fraction_of(displayed: f64, total: f64) -> f64 {
    if total > 0.0 {
        (displayed / total).clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Cloneable per-task reporting handle
#[derive(Clone)]
pub struct TaskProgress {
    task_id: String,
    aggregator: Arc<ProgressAggregator>,
}

impl TaskProgress {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn report(&self, message: impl Into<String>, delta: f64, current_max: f64) {
        self.aggregator.report(ProgressSample {
            task_id: self.task_id.clone(),
            message: message.into(),
            delta,
            current_max,
        });
    }

    /// Report a single-step task as fully done
    pub fn done(&self, message: impl Into<String>) {
        self.report(message, 1.0, 1.0);
    }
}
