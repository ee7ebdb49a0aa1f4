//! Build progress tracking and reporting, for the purpose of display to the
//! user.

use crate::master::{StateCounts, TaskState};
use crate::message::ResultsMessage;
use crate::tree::{Task, TaskId};
use std::io::Write;

/// Trait for build progress notifications.
pub trait Progress {
    /// Called as individual build tasks progress through build states.
    fn update(&mut self, counts: &StateCounts);

    /// Called when a task is sent to a worker.
    fn task_started(&mut self, id: TaskId, task: &Task);

    /// Called when a task's result arrives.
    fn task_finished(&mut self, id: TaskId, task: &Task, result: &ResultsMessage);

    /// Log a line of output.  Used for failures, which must stay visible
    /// while later tasks keep printing.
    fn log(&mut self, msg: &str);
}

/// Progress for a plain console: one line per started task, output of
/// finished tasks printed as it arrives.
#[derive(Default)]
pub struct ConsoleProgress {
    /// Whether to print full command lines rather than descriptions.
    verbose: bool,
    counts: StateCounts,
    /// The id of the last command printed, used to avoid printing it twice
    /// when it finishes right after starting.
    last_started: Option<TaskId>,
}

impl ConsoleProgress {
    pub fn new(verbose: bool) -> Self {
        ConsoleProgress {
            verbose,
            ..Default::default()
        }
    }

    fn describe(&self, task: &Task) -> String {
        match (&task.entry.data, self.verbose) {
            (Some(data), true) => data.describe(),
            _ => task.message(),
        }
    }
}

impl Progress for ConsoleProgress {
    fn update(&mut self, counts: &StateCounts) {
        self.counts = counts.clone();
    }

    fn task_started(&mut self, id: TaskId, task: &Task) {
        let finished = self.counts.get(TaskState::Done) + self.counts.get(TaskState::Failed);
        let msg = format!(
            "[{}/{}] {}",
            finished + self.counts.get(TaskState::Running),
            self.counts.total(),
            self.describe(task)
        );
        self.log(&msg);
        self.last_started = Some(id);
    }

    fn task_finished(&mut self, id: TaskId, task: &Task, result: &ResultsMessage) {
        let has_output = !result.stdout.is_empty() || !result.stderr.is_empty();
        if !result.ok {
            self.log(&format!("failed: {}", task.message()));
        } else if has_output && self.last_started != Some(id) {
            self.log(&task.message());
        }
        let mut stdout = std::io::stdout().lock();
        let _ = stdout.write_all(result.stdout.as_bytes());
        let _ = stdout.write_all(result.stderr.as_bytes());
        let _ = stdout.flush();
    }

    fn log(&mut self, msg: &str) {
        println!("{}", msg);
    }
}
