use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::{
    error::EvalError,
    task::{Action, Task, ToolFixture, ToolResultSpec, ToolSpec, RESPOND_ACTION_NAME},
    trace::TaskTrace,
};

pub type ToolRegistry = BTreeMap<String, Arc<dyn EnvTool>>;

/// A single environment tool: a name and an invocation that receives
/// the call kwargs plus the environment's current data context.
#[async_trait]
pub trait EnvTool: Send + Sync {
    fn name(&self) -> &str;

    async fn invoke(&self, kwargs: &Map<String, Value>, data: &Value) -> Result<Value, EvalError>;
}

#[derive(Debug, Clone)]
pub struct ResetResponse {
    pub observation: String,
    pub info: Map<String, Value>,
}

#[derive(Debug, Clone)]
pub struct StepResponse {
    pub observation: String,
    pub reward: f64,
    pub done: bool,
    pub info: Map<String, Value>,
}

/// The stateful transactional environment a task runs against. All
/// domain effects happen through `step`; the driver never touches
/// environment internals beyond installing the wrapped tool registry.
#[async_trait]
pub trait Environment: Send {
    /// The live tool registry for the active task. Called after
    /// `reset`, before the recording wrapper is installed.
    fn tool_registry(&self) -> ToolRegistry;

    fn install_tool_registry(&mut self, registry: ToolRegistry);

    /// Hands the environment the task's telemetry trace so a
    /// user-simulator backed by a model can record its own completion
    /// spans. Defaults to ignoring it.
    fn attach_trace(&mut self, _trace: TaskTrace) {}

    async fn reset(&mut self, task_index: usize) -> Result<ResetResponse, EvalError>;

    async fn step(
        &mut self,
        action: Action,
        can_do_user_step: bool,
        can_do_tool_execution: bool,
    ) -> Result<StepResponse, EvalError>;

    /// Environment-specific validation hook, triggered by the driver
    /// after steps that do not hand control to the user.
    async fn post_step_check(&mut self) -> Result<(), EvalError> {
        Ok(())
    }
}

/// Offline environment that replays a task file: fixture-stub tools,
/// a queue of canned user replies, and a configurable final reward.
/// The task is done once the agent responds after the reply queue has
/// drained.
pub struct ScriptedEnvironment {
    tasks: Vec<Task>,
    data: Value,
    registry: ToolRegistry,
    replies: VecDeque<String>,
    task_reward: f64,
    active_task_id: Option<String>,
}

impl ScriptedEnvironment {
    pub fn new(tasks: Vec<Task>) -> Self {
        Self {
            tasks,
            data: json!({}),
            registry: BTreeMap::new(),
            replies: VecDeque::new(),
            task_reward: 0.0,
            active_task_id: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    fn build_registry(task: &Task) -> ToolRegistry {
        task.tools
            .iter()
            .map(|spec| {
                (
                    spec.name.clone(),
                    Arc::new(FixtureTool::new(spec.clone())) as Arc<dyn EnvTool>,
                )
            })
            .collect()
    }
}

#[async_trait]
impl Environment for ScriptedEnvironment {
    fn tool_registry(&self) -> ToolRegistry {
        self.registry.clone()
    }

    fn install_tool_registry(&mut self, registry: ToolRegistry) {
        self.registry = registry;
    }

    async fn reset(&mut self, task_index: usize) -> Result<ResetResponse, EvalError> {
        let task = self
            .tasks
            .get(task_index)
            .ok_or_else(|| EvalError::Environment(format!("no task at index {task_index}")))?
            .clone();

        let mut replies: VecDeque<String> = task.user_replies.iter().cloned().collect();
        let observation = replies.pop_front().ok_or_else(|| {
            EvalError::Environment(format!("task '{}' has no opening user reply", task.id))
        })?;

        self.registry = Self::build_registry(&task);
        self.replies = replies;
        self.task_reward = task.reward;
        self.active_task_id = Some(task.id.clone());

        let mut info = Map::new();
        info.insert("task_id".to_string(), Value::String(task.id));
        Ok(ResetResponse { observation, info })
    }

    async fn step(
        &mut self,
        action: Action,
        can_do_user_step: bool,
        _can_do_tool_execution: bool,
    ) -> Result<StepResponse, EvalError> {
        if action.name == RESPOND_ACTION_NAME {
            if can_do_user_step {
                if let Some(reply) = self.replies.pop_front() {
                    return Ok(StepResponse {
                        observation: reply,
                        reward: 0.0,
                        done: false,
                        info: Map::new(),
                    });
                }
            }

            let mut info = Map::new();
            info.insert(
                "terminated".to_string(),
                Value::String("user_replies_exhausted".to_string()),
            );
            return Ok(StepResponse {
                observation: String::new(),
                reward: self.task_reward,
                done: true,
                info,
            });
        }

        let tool = self
            .registry
            .get(&action.name)
            .cloned()
            .ok_or_else(|| EvalError::UnknownTool(action.name.clone()))?;

        // Tool-level failures become observations the agent can react
        // to; anything else is an environment fault and propagates.
        let observation = match tool.invoke(&action.kwargs, &self.data).await {
            Ok(value) => value.to_string(),
            Err(EvalError::ToolExecution { message, .. }) => {
                json!({ "error": message }).to_string()
            }
            Err(other) => return Err(other),
        };

        Ok(StepResponse {
            observation,
            reward: 0.0,
            done: false,
            info: Map::new(),
        })
    }
}

/// Stub tool backed by fixtures: the first fixture whose `when`
/// object is a subset of the call kwargs decides the result.
pub struct FixtureTool {
    spec: ToolSpec,
}

impl FixtureTool {
    pub fn new(spec: ToolSpec) -> Self {
        Self { spec }
    }

    fn match_fixture(&self, kwargs: &Map<String, Value>) -> Option<&ToolResultSpec> {
        let args = Value::Object(kwargs.clone());
        self.spec
            .fixtures
            .iter()
            .find(|fixture: &&ToolFixture| value_is_subset(&fixture.when, &args))
            .map(|fixture| &fixture.then)
            .or(self.spec.default.as_ref())
    }
}

#[async_trait]
impl EnvTool for FixtureTool {
    fn name(&self) -> &str {
        &self.spec.name
    }

    async fn invoke(&self, kwargs: &Map<String, Value>, _data: &Value) -> Result<Value, EvalError> {
        let Some(result) = self.match_fixture(kwargs) else {
            return Err(EvalError::ToolExecution {
                tool: self.spec.name.clone(),
                message: "no matching fixture and no default specified".to_string(),
            });
        };

        match result {
            ToolResultSpec::Ok { value } => Ok(value.clone()),
            ToolResultSpec::Err { message } => Err(EvalError::ToolExecution {
                tool: self.spec.name.clone(),
                message: message.clone(),
            }),
        }
    }
}

pub fn value_is_subset(expected: &Value, actual: &Value) -> bool {
    let (Value::Object(expected), Value::Object(actual)) = (expected, actual) else {
        return expected == actual;
    };
    expected
        .iter()
        .all(|(k, v)| actual.get(k).is_some_and(|av| value_is_subset(v, av)))
}
