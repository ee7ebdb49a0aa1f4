//! The messages exchanged between the scheduler and its workers.
//!
//! Both directions are JSON objects tagged by an `id` field, one object per
//! line when a worker runs as a separate process.

use crate::entry::CommandData;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMessage {
    pub task_id: usize,
    pub task_type: String,
    pub task_data: CommandData,
    /// Working directory, relative to the build root.
    pub task_folder: Option<String>,
    /// Files the task must produce, relative to the build root.
    pub task_outputs: Vec<String>,
    /// Environment for the task's subprocesses, replacing the worker's own.
    #[serde(default)]
    pub tools_env: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultsMessage {
    pub task_id: usize,
    pub ok: bool,
    pub stdout: String,
    pub stderr: String,
    /// New stamps of the task's outputs.
    pub updates: Vec<(String, f64)>,
    /// Files the task read that it was not told about.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deps: Option<Vec<String>>,
}

impl ResultsMessage {
    /// A failed result carrying only an error description.
    pub fn failure(task_id: usize, err: impl std::fmt::Display) -> Self {
        ResultsMessage {
            task_id,
            ok: false,
            stdout: String::new(),
            stderr: format!("{}\n", err),
            updates: Vec::new(),
            deps: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "id", rename_all = "snake_case")]
pub enum ToWorker {
    Task(TaskMessage),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "id", rename_all = "snake_case")]
pub enum FromWorker {
    Spawned,
    Results(ResultsMessage),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wire_shape() {
        let msg = ToWorker::Task(TaskMessage {
            task_id: 3,
            task_type: "cmd".into(),
            task_data: CommandData::Command {
                argv: vec!["true".into()],
            },
            task_folder: None,
            task_outputs: vec!["out/a".into()],
            tools_env: None,
        });
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["id"], "task");
        assert_eq!(value["task_id"], 3);
        assert_eq!(value["task_data"]["kind"], "command");
        assert_eq!(value["task_outputs"], json!(["out/a"]));

        assert_eq!(
            serde_json::to_value(&FromWorker::Spawned).unwrap(),
            json!({"id": "spawned"})
        );
    }

    #[test]
    fn results_without_deps() {
        let parsed: FromWorker = serde_json::from_value(json!({
            "id": "results",
            "task_id": 1,
            "ok": true,
            "stdout": "",
            "stderr": "warning\n",
            "updates": [["main.o", 12.5]],
        }))
        .unwrap();
        match parsed {
            FromWorker::Results(r) => {
                assert!(r.ok);
                assert_eq!(r.updates, vec![("main.o".to_string(), 12.5)]);
                assert_eq!(r.deps, None);
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
