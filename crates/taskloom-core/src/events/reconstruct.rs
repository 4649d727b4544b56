//! Rebuild task instances from a run's event log.
//!
//! Events for different tasks interleave arbitrarily when branches run in
//! parallel. The fold keys everything by TaskID, merges status, results and
//! trace metadata into one instance per task, and orders the output by the
//! first appearance of each TaskID in the log (not by timestamp).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use taskloom_types::dag::{DagDefinition, DagInstance, Operator, Step};
use taskloom_types::event::{DagEvent, DagInstanceEvent};
use taskloom_types::key::TaskKey;
use taskloom_types::task::{TaskInstance, TaskStatus};

/// Fold `events` into one task instance per TaskID.
///
/// When `dag` is given, titles and operators come from its steps and events
/// whose TaskID cannot be resolved to a step are skipped. Malformed events
/// are skipped with a warning; reconstruction never fails as a whole.
pub fn reconstruct(
    events: &[DagInstanceEvent],
    dag_ins: &DagInstance,
    dag: Option<&DagDefinition>,
) -> Vec<TaskInstance> {
    let mut fold = Fold {
        dag_ins_id: &dag_ins.id,
        dag,
        tasks: HashMap::new(),
        order: Vec::new(),
    };

    for (position, raw) in events.iter().enumerate() {
        let event = match DagEvent::try_from(raw) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(
                    dag_ins_id = %dag_ins.id,
                    position,
                    error = %e,
                    "skipping malformed event"
                );
                continue;
            }
        };
        fold.apply(event, position);
    }

    let Fold { mut tasks, order, .. } = fold;
    order.iter().filter_map(|id| tasks.remove(id)).collect()
}

struct Fold<'a> {
    dag_ins_id: &'a str,
    dag: Option<&'a DagDefinition>,
    tasks: HashMap<String, TaskInstance>,
    order: Vec<String>,
}

impl Fold<'_> {
    fn apply(&mut self, event: DagEvent, position: usize) {
        let task_id = event.task_id().to_string();
        let Some(task) = self.entry(&task_id, position) else {
            return;
        };

        match event {
            DagEvent::TaskStatus(ev) => {
                task.status = ev.status;
                if !ev.operator.is_empty() {
                    task.action_name = Operator::from(ev.operator);
                }
                touch(task, ev.timestamp);
            }
            DagEvent::Variable(ev) => {
                merge_results(task, ev.data);
                touch(task, ev.timestamp);
            }
            DagEvent::Trace(ev) => {
                let meta = task.meta.get_or_insert_with(Default::default);
                meta.duration = ev.meta.duration;
                meta.attempts = ev.meta.attempts;
                meta.max_retry = ev.meta.max_retry;
                touch(task, ev.timestamp);
            }
        }
    }

    /// The in-progress instance for `task_id`, creating a placeholder on
    /// first sight. `None` when the TaskID is unresolvable.
    fn entry(&mut self, task_id: &str, position: usize) -> Option<&mut TaskInstance> {
        if !self.tasks.contains_key(task_id) {
            let step = match self.dag {
                Some(dag) => match resolve_step(dag, task_id) {
                    Some(step) => Some(step),
                    None => {
                        tracing::warn!(
                            dag_ins_id = %self.dag_ins_id,
                            task_id,
                            position,
                            "skipping event for task unknown to the DAG definition"
                        );
                        return None;
                    }
                },
                None => None,
            };
            let mut task = TaskInstance::new(
                self.dag_ins_id,
                task_id,
                step.map_or_else(|| Operator::action(""), |s| s.operator.clone()),
            )
            .with_status(TaskStatus::Init);
            task.id = task_id.to_string();
            if let Some(step) = step {
                task.name = step.title.clone();
            }
            self.tasks.insert(task_id.to_string(), task);
            self.order.push(task_id.to_string());
        }
        self.tasks.get_mut(task_id)
    }
}

/// Find the step a TaskID was derived from.
fn resolve_step<'a>(dag: &'a DagDefinition, task_id: &str) -> Option<&'a Step> {
    if let Some(step) = dag.find_step(task_id) {
        return Some(step);
    }
    let key: TaskKey = task_id.parse().ok()?;
    match key.innermost_step() {
        Some(step_id) => dag.find_step(step_id),
        None => dag.find_step(key.base()),
    }
}

fn merge_results(task: &mut TaskInstance, data: serde_json::Map<String, serde_json::Value>) {
    match &mut task.results {
        Some(serde_json::Value::Object(existing)) => existing.extend(data),
        _ => task.results = Some(serde_json::Value::Object(data)),
    }
}

fn touch(task: &mut TaskInstance, timestamp_micros: i64) {
    let Some(at) = DateTime::<Utc>::from_timestamp_micros(timestamp_micros) else {
        return;
    };
    if task.created_at > at {
        task.created_at = at;
    }
    task.updated_at = at;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use taskloom_types::dag::Branch;
    use taskloom_types::event::DagEventType;
    use taskloom_types::task::TaskMeta;

    fn status(task_id: &str, op: &str, s: TaskStatus, ts: i64) -> DagInstanceEvent {
        DagInstanceEvent::task_status(task_id, op, s, ts)
    }

    fn trace(task_id: &str, duration: i64, ts: i64) -> DagInstanceEvent {
        DagInstanceEvent::trace(
            task_id,
            TaskMeta {
                duration,
                attempts: 0,
                max_retry: 3,
            },
            ts,
        )
    }

    fn sample_dag() -> DagDefinition {
        DagDefinition {
            id: "dag-1".into(),
            name: "docs".into(),
            steps: vec![
                Step::action("0", "@trigger/dataflow-doc").with_title("trigger"),
                Step::action("1006", "@internal/text/split").with_title("split"),
                Step::new("p", Operator::Parallel).with_branches(vec![
                    Branch::new(vec![Step::action("1010", "@internal/tool/py3").with_title("left")]),
                    Branch::new(vec![Step::action("1009", "@internal/tool/py3").with_title("right")]),
                ]),
                Step::action("1008", "@internal/text/join").with_title("join"),
            ],
        }
    }

    fn interleaved_events() -> Vec<DagInstanceEvent> {
        vec![
            status("0", "@trigger/dataflow-doc", TaskStatus::Running, 1769762005630182),
            DagInstanceEvent::variable("0", json!({ "name": "report.pdf" }), 1769762005688897),
            status("0", "@trigger/dataflow-doc", TaskStatus::Success, 1769762005694425),
            trace("0", 71, 1769762005696705),
            status("1006", "@internal/text/split", TaskStatus::Running, 1769762005703635),
            DagInstanceEvent::variable("1006", json!({ "slices": "{\"0\":\"123\"}" }), 1769762005705726),
            status("1006", "@internal/text/split", TaskStatus::Success, 1769762005709578),
            trace("1006", 7, 1769762005711287),
            status("1010", "@internal/tool/py3", TaskStatus::Blocked, 1769762005719755),
            status("1009", "@internal/tool/py3", TaskStatus::Blocked, 1769762005720916),
            trace("1010", 12, 1769762005730100),
            trace("1009", 17, 1769762005737922),
            DagInstanceEvent::variable("1010", json!({ "b": 1 }), 1769762205875170),
            status("1010", "@internal/tool/py3", TaskStatus::Success, 1769762205876861),
            DagInstanceEvent::variable("1009", json!({ "a": 1 }), 1769762205881930),
            status("1009", "@internal/tool/py3", TaskStatus::Success, 1769762205883099),
            status("1008", "@internal/text/join", TaskStatus::Running, 1769762207604973),
            DagInstanceEvent::variable("1008", json!({ "text": "11" }), 1769762207606522),
            status("1008", "@internal/text/join", TaskStatus::Success, 1769762207609781),
            trace("1008", 6, 1769762207611207),
        ]
    }

    #[test]
    fn interleaved_parallel_events_converge_in_first_appearance_order() {
        let dag = sample_dag();
        let run = DagInstance::new("run-1", "dag-1");
        let tasks = reconstruct(&interleaved_events(), &run, Some(&dag));

        let ids: Vec<_> = tasks.iter().map(|t| t.task_id.as_str()).collect();
        assert_eq!(ids, vec!["0", "1006", "1010", "1009", "1008"]);
        assert!(tasks.iter().all(|t| t.status == TaskStatus::Success));

        let t1010 = &tasks[2];
        let t1009 = &tasks[3];
        assert_eq!(t1010.results, Some(json!({ "b": 1 })));
        assert_eq!(t1009.results, Some(json!({ "a": 1 })));
        assert_eq!(t1010.meta.unwrap().duration, 12);
        assert_eq!(t1009.meta.unwrap().duration, 17);
        assert_eq!(t1010.name, "left");
        assert_eq!(t1009.action_name, Operator::action("@internal/tool/py3"));
        assert_eq!(t1010.dag_ins_id, "run-1");
    }

    #[test]
    fn sequential_two_task_stream() {
        let run = DagInstance::new("run-1", "dag-1");
        let events = vec![
            status("1", "op1", TaskStatus::Running, 1000),
            DagInstanceEvent::variable("1", json!({ "result": "a" }), 2000),
            status("1", "op1", TaskStatus::Success, 3000),
            status("2", "op2", TaskStatus::Running, 4000),
            DagInstanceEvent::variable("2", json!({ "result": "b" }), 5000),
            status("2", "op2", TaskStatus::Success, 6000),
        ];
        let tasks = reconstruct(&events, &run, None);
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].task_id, "1");
        assert_eq!(tasks[1].task_id, "2");
        assert!(tasks.iter().all(|t| t.status == TaskStatus::Success));
        assert_eq!(tasks[1].results, Some(json!({ "result": "b" })));
        assert_eq!(tasks[0].action_name, Operator::action("op1"));
    }

    #[test]
    fn variable_and_trace_before_status_create_placeholder() {
        let run = DagInstance::new("run-1", "dag-1");
        let events = vec![
            DagInstanceEvent::variable("7", json!({ "x": 1 }), 10),
            trace("7", 3, 11),
            status("8", "op", TaskStatus::Running, 12),
            status("7", "op", TaskStatus::Success, 13),
        ];
        let tasks = reconstruct(&events, &run, None);
        let ids: Vec<_> = tasks.iter().map(|t| t.task_id.as_str()).collect();
        assert_eq!(ids, vec!["7", "8"]);
        assert_eq!(tasks[0].status, TaskStatus::Success);
        assert_eq!(tasks[0].results, Some(json!({ "x": 1 })));
        assert_eq!(tasks[0].meta.unwrap().duration, 3);
    }

    #[test]
    fn placeholder_without_status_stays_init() {
        let run = DagInstance::new("run-1", "dag-1");
        let events = vec![DagInstanceEvent::variable("7", json!({ "x": 1 }), 10)];
        let tasks = reconstruct(&events, &run, None);
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].status, TaskStatus::Init);
    }

    #[test]
    fn repeated_variables_merge_keys() {
        let run = DagInstance::new("run-1", "dag-1");
        let events = vec![
            DagInstanceEvent::variable("7", json!({ "x": 1, "y": 1 }), 10),
            DagInstanceEvent::variable("7", json!({ "y": 2 }), 11),
        ];
        let tasks = reconstruct(&events, &run, None);
        assert_eq!(tasks[0].results, Some(json!({ "x": 1, "y": 2 })));
    }

    #[test]
    fn malformed_events_are_skipped() {
        let run = DagInstance::new("run-1", "dag-1");
        let mut bad_variable = DagInstanceEvent::variable("7", json!({}), 1);
        bad_variable.name = "result".into();
        let mut bad_type = status("9", "op", TaskStatus::Running, 2);
        bad_type.event_type = DagEventType::Unknown;
        let mut bad_status = status("10", "op", TaskStatus::Running, 3);
        bad_status.status = "exploded".into();
        let events = vec![
            bad_variable,
            bad_type,
            bad_status,
            status("1", "op", TaskStatus::Success, 4),
        ];
        let tasks = reconstruct(&events, &run, None);
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].task_id, "1");
    }

    #[test]
    fn unknown_task_is_skipped_when_definition_given() {
        let dag = sample_dag();
        let run = DagInstance::new("run-1", "dag-1");
        let events = vec![
            status("ghost", "op", TaskStatus::Running, 1),
            status("1008", "@internal/text/join", TaskStatus::Running, 2),
        ];
        let tasks = reconstruct(&events, &run, Some(&dag));
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].task_id, "1008");
        assert_eq!(tasks[0].name, "join");
    }

    #[test]
    fn synthesized_loop_ids_resolve_through_their_step() {
        let dag = DagDefinition {
            id: "dag-1".into(),
            name: "loop".into(),
            steps: vec![
                Step::new("1010", Operator::Loop)
                    .with_title("repeat")
                    .with_body(vec![Step::action("2", "@internal/noop").with_title("body")]),
            ],
        };
        let run = DagInstance::new("run-1", "dag-1");
        let events = vec![
            status("1010_i1", "@control/flow/loop", TaskStatus::Success, 1),
            status("1010_i0_s2", "@internal/noop", TaskStatus::Success, 2),
        ];
        let tasks = reconstruct(&events, &run, Some(&dag));
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].name, "repeat");
        assert_eq!(tasks[0].action_name, Operator::Loop);
        assert_eq!(tasks[1].name, "body");
    }

    #[test]
    fn timestamps_track_first_and_last_event() {
        let run = DagInstance::new("run-1", "dag-1");
        let events = vec![
            status("1", "op", TaskStatus::Running, 1_000_000),
            status("1", "op", TaskStatus::Success, 3_000_000),
        ];
        let tasks = reconstruct(&events, &run, None);
        assert_eq!(tasks[0].created_at.timestamp(), 1);
        assert_eq!(tasks[0].updated_at.timestamp(), 3);
    }
}
