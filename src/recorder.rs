use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::{
    env::{EnvTool, ToolRegistry},
    error::EvalError,
    task::Action,
};

/// Intercepts environment tool invocations and records them as
/// structured actions. Wrapping is side-effect-transparent: every
/// call delegates to the real tool with the original arguments and
/// data context; only the recording side channel is added.
///
/// Recording is intentionally over-inclusive: a mutating tool call is
/// captured even when it is not part of the ground truth, so
/// erroneous or extra mutations stay visible in the diff.
#[derive(Clone, Default)]
pub struct ActionRecorder {
    all: Arc<Mutex<Vec<Action>>>,
    mutating: Arc<Mutex<Vec<Action>>>,
}

impl ActionRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Produces a wrapped registry. Blacklisted tools are removed
    /// entirely and can never be invoked; every surviving tool is
    /// decorated with the recording interceptor.
    pub fn wrap_registry(
        &self,
        tools: ToolRegistry,
        expected_names: &HashSet<String>,
        mutating_names: &HashSet<String>,
        blacklist: &HashSet<String>,
    ) -> ToolRegistry {
        tools
            .into_iter()
            .filter(|(name, _)| !blacklist.contains(name))
            .map(|(name, tool)| {
                let wrapped = RecordingTool {
                    inner: tool,
                    record_all: expected_names.contains(&name) || mutating_names.contains(&name),
                    record_mutating: mutating_names.contains(&name),
                    all: Arc::clone(&self.all),
                    mutating: Arc::clone(&self.mutating),
                };
                (name, Arc::new(wrapped) as Arc<dyn EnvTool>)
            })
            .collect()
    }

    /// Snapshot of every recorded action, in invocation order.
    pub fn all_actions(&self) -> Vec<Action> {
        self.all.lock().unwrap().clone()
    }

    /// Snapshot of the mutating-action subset, in invocation order.
    pub fn mutating_actions(&self) -> Vec<Action> {
        self.mutating.lock().unwrap().clone()
    }
}

struct RecordingTool {
    inner: Arc<dyn EnvTool>,
    record_all: bool,
    record_mutating: bool,
    all: Arc<Mutex<Vec<Action>>>,
    mutating: Arc<Mutex<Vec<Action>>>,
}

#[async_trait]
impl EnvTool for RecordingTool {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn invoke(&self, kwargs: &Map<String, Value>, data: &Value) -> Result<Value, EvalError> {
        if self.record_all {
            let action = Action::new(self.inner.name(), kwargs.clone());
            self.all.lock().unwrap().push(action.clone());
            if self.record_mutating {
                self.mutating.lock().unwrap().push(action);
            }
        }
        self.inner.invoke(kwargs, data).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    struct EchoTool {
        name: String,
    }

    #[async_trait]
    impl EnvTool for EchoTool {
        fn name(&self) -> &str {
            &self.name
        }

        async fn invoke(
            &self,
            kwargs: &Map<String, Value>,
            _data: &Value,
        ) -> Result<Value, EvalError> {
            Ok(Value::Object(kwargs.clone()))
        }
    }

    fn registry(names: &[&str]) -> ToolRegistry {
        names
            .iter()
            .map(|n| {
                (
                    n.to_string(),
                    Arc::new(EchoTool { name: n.to_string() }) as Arc<dyn EnvTool>,
                )
            })
            .collect::<BTreeMap<_, _>>()
    }

    fn names(values: &[&str]) -> HashSet<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    fn kwargs(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[tokio::test]
    async fn expected_tool_lands_in_all_trace_only() {
        let recorder = ActionRecorder::new();
        let wrapped = recorder.wrap_registry(
            registry(&["get_user", "book_reservation"]),
            &names(&["get_user"]),
            &names(&["book_reservation"]),
            &HashSet::new(),
        );

        let args = kwargs(json!({"id": 3}));
        wrapped["get_user"].invoke(&args, &json!({})).await.unwrap();

        assert_eq!(recorder.all_actions().len(), 1);
        assert!(recorder.mutating_actions().is_empty());
    }

    #[tokio::test]
    async fn unexpected_mutating_tool_lands_in_both_traces() {
        let recorder = ActionRecorder::new();
        let wrapped = recorder.wrap_registry(
            registry(&["book_reservation"]),
            &HashSet::new(),
            &names(&["book_reservation"]),
            &HashSet::new(),
        );

        let args = kwargs(json!({"pnr": "X"}));
        wrapped["book_reservation"]
            .invoke(&args, &json!({}))
            .await
            .unwrap();

        assert_eq!(recorder.all_actions().len(), 1);
        assert_eq!(recorder.mutating_actions().len(), 1);
        assert_eq!(recorder.mutating_actions()[0].name, "book_reservation");
    }

    #[tokio::test]
    async fn unlisted_readonly_tool_is_not_recorded_but_still_works() {
        let recorder = ActionRecorder::new();
        let wrapped = recorder.wrap_registry(
            registry(&["list_flights"]),
            &names(&["get_user"]),
            &HashSet::new(),
            &HashSet::new(),
        );

        let args = kwargs(json!({"origin": "SFO"}));
        let result = wrapped["list_flights"].invoke(&args, &json!({})).await.unwrap();
        assert_eq!(result, json!({"origin": "SFO"}));
        assert!(recorder.all_actions().is_empty());
    }

    #[tokio::test]
    async fn blacklisted_tool_is_absent_from_registry() {
        let recorder = ActionRecorder::new();
        let wrapped = recorder.wrap_registry(
            registry(&["get_user", "debug_dump"]),
            &names(&["get_user", "debug_dump"]),
            &HashSet::new(),
            &names(&["debug_dump"]),
        );

        assert!(wrapped.contains_key("get_user"));
        assert!(!wrapped.contains_key("debug_dump"));
        assert!(recorder.all_actions().is_empty());
    }

    #[tokio::test]
    async fn traces_are_append_only_and_ordered() {
        let recorder = ActionRecorder::new();
        let wrapped = recorder.wrap_registry(
            registry(&["book_reservation", "cancel_reservation"]),
            &HashSet::new(),
            &names(&["book_reservation", "cancel_reservation"]),
            &HashSet::new(),
        );

        wrapped["book_reservation"]
            .invoke(&kwargs(json!({"pnr": "A"})), &json!({}))
            .await
            .unwrap();
        wrapped["cancel_reservation"]
            .invoke(&kwargs(json!({"pnr": "A"})), &json!({}))
            .await
            .unwrap();

        let all = recorder.all_actions();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].name, "book_reservation");
        assert_eq!(all[1].name, "cancel_reservation");

        // Mutating trace is a subset of the all-actions trace.
        for action in recorder.mutating_actions() {
            assert!(all.contains(&action));
        }
    }
}
