//! Status summary over a run's tasks.

use serde::Serialize;
use taskloom_types::task::{TaskInstance, TaskStatus};

/// Per-status counts and total duration of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub total: usize,
    pub success: usize,
    /// Running or blocked.
    pub running: usize,
    pub failed: usize,
    pub canceled: usize,
    pub skipped: usize,
    /// Not started yet.
    pub pending: usize,
    /// Sum of trace durations.
    pub total_duration: i64,
}

impl RunSummary {
    /// Percentage of finished tasks that succeeded or were skipped.
    pub fn success_rate(&self) -> f64 {
        let finished = self.success + self.skipped + self.failed + self.canceled;
        if finished == 0 {
            return 0.0;
        }
        (self.success + self.skipped) as f64 * 100.0 / finished as f64
    }
}

pub fn summarize(tasks: &[TaskInstance]) -> RunSummary {
    let mut summary = RunSummary {
        total: tasks.len(),
        ..RunSummary::default()
    };
    for task in tasks {
        match task.status {
            TaskStatus::Init => summary.pending += 1,
            TaskStatus::Running | TaskStatus::Blocked => summary.running += 1,
            TaskStatus::Success => summary.success += 1,
            TaskStatus::Failed => summary.failed += 1,
            TaskStatus::Canceled => summary.canceled += 1,
            TaskStatus::Skipped => summary.skipped += 1,
        }
        summary.total_duration += task.meta.map_or(0, |m| m.duration);
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskloom_types::dag::Operator;
    use taskloom_types::task::TaskMeta;

    fn task(id: &str, status: TaskStatus, duration: i64) -> TaskInstance {
        let mut t = TaskInstance::new("run-1", id, Operator::action("op")).with_status(status);
        t.meta = Some(TaskMeta {
            duration,
            ..TaskMeta::default()
        });
        t
    }

    #[test]
    fn counts_every_status() {
        let tasks = vec![
            task("a", TaskStatus::Success, 10),
            task("b", TaskStatus::Blocked, 5),
            task("c", TaskStatus::Failed, 1),
            task("d", TaskStatus::Init, 0),
            task("e", TaskStatus::Skipped, 0),
        ];
        let s = summarize(&tasks);
        assert_eq!(s.total, 5);
        assert_eq!(s.success, 1);
        assert_eq!(s.running, 1);
        assert_eq!(s.failed, 1);
        assert_eq!(s.pending, 1);
        assert_eq!(s.skipped, 1);
        assert_eq!(s.total_duration, 16);
    }

    #[test]
    fn success_rate_ignores_unfinished() {
        let tasks = vec![
            task("a", TaskStatus::Success, 0),
            task("b", TaskStatus::Failed, 0),
            task("c", TaskStatus::Running, 0),
        ];
        assert!((summarize(&tasks).success_rate() - 50.0).abs() < f64::EPSILON);
        assert_eq!(summarize(&[]).success_rate(), 0.0);
    }
}
