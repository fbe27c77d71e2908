use std::{collections::HashMap, fs, path::Path};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
    error::EvalError,
    types::{CompletionResponse, ToolCall},
};

/// Name of the terminal "talk to the user" action. A completion with
/// no function calls becomes this action, carrying the reply text.
pub const RESPOND_ACTION_NAME: &str = "respond";

/// A named tool invocation with keyword arguments, the unit compared
/// between expected and actual traces. Equality covers name and
/// kwargs only; the raw function-call payloads ride along for the
/// environment but never participate in comparison.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub name: String,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
    #[serde(skip)]
    pub tool_calls: Vec<ToolCall>,
}

impl Action {
    pub fn new(name: impl Into<String>, kwargs: Map<String, Value>) -> Self {
        Self {
            name: name.into(),
            kwargs,
            tool_calls: Vec::new(),
        }
    }

    pub fn respond(content: impl Into<String>) -> Self {
        let mut kwargs = Map::new();
        kwargs.insert("content".to_string(), Value::String(content.into()));
        Self::new(RESPOND_ACTION_NAME, kwargs)
    }

    /// Converts a completion into an action. The action's name and
    /// kwargs come from the first function call; every call is
    /// attached for downstream execution. No calls means a terminal
    /// respond action with the completion text.
    pub fn from_completion(completion: &CompletionResponse) -> Self {
        let calls = &completion.message.tool_calls;
        let Some(first) = calls.first() else {
            return Self::respond(completion.message.text().unwrap_or_default());
        };

        let kwargs = match &first.function.arguments {
            Value::Object(map) => map.clone(),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other.clone());
                map
            }
        };

        Self {
            name: first.function.name.clone(),
            kwargs,
            tool_calls: calls.clone(),
        }
    }

    pub fn is_respond(&self) -> bool {
        self.name == RESPOND_ACTION_NAME
    }
}

impl PartialEq for Action {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.kwargs == other.kwargs
    }
}

/// One scripted benchmark task: the ground-truth action list plus the
/// scripted-environment material (user replies, tool fixtures) needed
/// to replay it offline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub expected_actions: Vec<Action>,
    /// Per-task turn budget; falls back to the injected budget table
    /// and then the driver default when unset.
    #[serde(default)]
    pub max_turns: Option<usize>,
    /// Scripted user-simulator utterances. The first entry is the
    /// opening observation returned by `reset`.
    #[serde(default)]
    pub user_replies: Vec<String>,
    #[serde(default)]
    pub tools: Vec<ToolSpec>,
    /// Reward the scripted environment reports on completion.
    #[serde(default = "default_reward")]
    pub reward: f64,
}

fn default_reward() -> f64 {
    1.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub fixtures: Vec<ToolFixture>,
    #[serde(default)]
    pub default: Option<ToolResultSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolFixture {
    pub when: Value,
    pub then: ToolResultSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToolResultSpec {
    Ok { value: Value },
    Err { message: String },
}

/// Explicit per-task turn budgets keyed by task index, injected into
/// the driver instead of living as module state. A missing entry
/// falls back to the driver's default.
#[derive(Debug, Clone, Default)]
pub struct TaskBudgets {
    budgets: HashMap<usize, usize>,
}

impl TaskBudgets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, task_index: usize, max_turns: usize) {
        self.budgets.insert(task_index, max_turns);
    }

    pub fn with(mut self, task_index: usize, max_turns: usize) -> Self {
        self.set(task_index, max_turns);
        self
    }

    pub fn get(&self, task_index: usize) -> Option<usize> {
        self.budgets.get(&task_index).copied()
    }
}

impl FromIterator<(usize, usize)> for TaskBudgets {
    fn from_iter<I: IntoIterator<Item = (usize, usize)>>(iter: I) -> Self {
        Self {
            budgets: iter.into_iter().collect(),
        }
    }
}

/// Loads tasks from a YAML/JSON file or a directory of such files.
/// A file may hold a single task or a list; directory entries are
/// read in path order.
pub fn load_tasks(path: impl AsRef<Path>) -> Result<Vec<Task>, EvalError> {
    let path = path.as_ref();
    if path.is_dir() {
        let mut paths = Vec::new();
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            let p = entry.path();
            let ext = p.extension().and_then(|s| s.to_str()).unwrap_or("");
            if matches!(ext, "yaml" | "yml" | "json") {
                paths.push(p);
            }
        }
        paths.sort();

        let mut tasks = Vec::new();
        for p in paths {
            tasks.extend(load_task_file(&p)?);
        }
        Ok(tasks)
    } else {
        load_task_file(path)
    }
}

fn load_task_file(path: &Path) -> Result<Vec<Task>, EvalError> {
    let bytes = fs::read(path)?;
    let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("");

    if ext == "json" {
        if let Ok(tasks) = serde_json::from_slice::<Vec<Task>>(&bytes) {
            return Ok(tasks);
        }
        let task: Task = serde_json::from_slice(&bytes)?;
        Ok(vec![task])
    } else {
        if let Ok(tasks) = serde_yaml::from_slice::<Vec<Task>>(&bytes) {
            return Ok(tasks);
        }
        let task: Task = serde_yaml::from_slice(&bytes)
            .map_err(|e| EvalError::Environment(format!("failed to parse {}: {e}", path.display())))?;
        Ok(vec![task])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChatMessage, FunctionCall};
    use serde_json::json;

    fn kwargs(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn actions_compare_structurally() {
        let a = Action::new("book_reservation", kwargs(json!({"pnr": "X"})));
        let mut b = Action::new("book_reservation", kwargs(json!({"pnr": "X"})));
        b.tool_calls = vec![ToolCall::new(FunctionCall::new(
            "book_reservation",
            json!({"pnr": "X"}),
        ))];
        assert_eq!(a, b);

        let c = Action::new("book_reservation", kwargs(json!({"pnr": "Y"})));
        assert_ne!(a, c);
    }

    #[test]
    fn completion_with_calls_uses_first_call() {
        let completion = CompletionResponse {
            message: ChatMessage::assistant("").with_tool_calls(vec![
                ToolCall::new(FunctionCall::new("get_user", json!({"id": 1}))),
                ToolCall::new(FunctionCall::new("get_flight", json!({"no": "A1"}))),
            ]),
            usage: None,
        };
        let action = Action::from_completion(&completion);
        assert_eq!(action.name, "get_user");
        assert_eq!(action.kwargs, kwargs(json!({"id": 1})));
        assert_eq!(action.tool_calls.len(), 2);
    }

    #[test]
    fn completion_without_calls_becomes_respond() {
        let completion = CompletionResponse {
            message: ChatMessage::assistant("Here is your booking."),
            usage: None,
        };
        let action = Action::from_completion(&completion);
        assert!(action.is_respond());
        assert_eq!(
            action.kwargs.get("content"),
            Some(&json!("Here is your booking."))
        );
    }

    #[test]
    fn budgets_fall_back_when_missing() {
        let budgets: TaskBudgets = [(0usize, 100usize), (7, 50)].into_iter().collect();
        assert_eq!(budgets.get(7), Some(50));
        assert_eq!(budgets.get(3), None);
    }

    #[test]
    fn loads_directory_in_path_order() {
        let dir = std::env::temp_dir().join(format!("task-loader-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("b.yaml"), "- id: second\n").unwrap();
        fs::write(dir.join("a.json"), r#"{"id": "first"}"#).unwrap();
        fs::write(dir.join("notes.txt"), "ignored").unwrap();

        let tasks = load_tasks(&dir).unwrap();
        fs::remove_dir_all(&dir).unwrap();

        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].id, "first");
        assert_eq!(tasks[1].id, "second");
    }

    #[test]
    fn parses_task_list_yaml() {
        let yaml = r#"
- id: airline_0
  expected_actions:
    - name: book_reservation
      kwargs: { pnr: X }
  user_replies:
    - "I want to book a flight."
    - "Yes, go ahead."
  tools:
    - name: book_reservation
      default: { kind: ok, value: { status: booked } }
"#;
        let tasks: Vec<Task> = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].expected_actions[0].name, "book_reservation");
        assert_eq!(tasks[0].reward, 1.0);
        assert_eq!(tasks[0].user_replies.len(), 2);
    }
}
