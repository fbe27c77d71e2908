use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{error, info, warn};

use crate::{
    cost::{aggregate_usage, PricingTable, UsageSummary, DEFAULT_PRICING},
    diff::{diff_actions, ActionDiff},
    env::Environment,
    error::EvalError,
    providers::LLMProvider,
    recorder::ActionRecorder,
    retry::CompletionRetryPolicy,
    store::ConversationStore,
    task::{Action, Task, TaskBudgets},
    trace::{TaskTrace, TracedProvider, AGENT_LLM_TAG},
    types::{ChatMessage, CompletionRequest, Originator, TurnRecord},
};

const DEFAULT_MAX_TURNS: usize = 30;

/// Everything a finished (or budget-exhausted) task run produces:
/// the environment's reward, the three action diffs, the merged step
/// info, the recorded traces, the transcript, and per-side usage.
#[derive(Debug, Clone, Serialize)]
pub struct TaskResult {
    pub reward: f64,
    pub actions_diff: ActionDiff,
    pub write_actions_diff: ActionDiff,
    pub write_actions_diff_no_order: ActionDiff,
    pub info: Map<String, Value>,
    pub actions: Vec<Action>,
    pub write_actions: Vec<Action>,
    pub messages: Vec<ChatMessage>,
    pub turns: Vec<TurnRecord>,
    pub agent_usage: UsageSummary,
    pub user_usage: UsageSummary,
}

impl TaskResult {
    pub fn is_successful(&self) -> bool {
        self.reward >= 1.0
    }
}

/// Drives one task to completion against an environment: requests a
/// completion per turn through the retry policy, converts it to an
/// action, steps the environment, and routes the observation back as
/// either a user turn or a tool result. Scoring attributes land on
/// the task trace even when the run aborts mid-conversation.
pub struct TurnDriver {
    provider: Arc<dyn LLMProvider>,
    model: String,
    temperature: Option<f32>,
    retry: CompletionRetryPolicy,
    budgets: TaskBudgets,
    default_max_turns: usize,
    mutating_tools: HashSet<String>,
    blacklisted_tools: HashSet<String>,
    pricing: Arc<PricingTable>,
    store: Option<Arc<dyn ConversationStore>>,
}

impl TurnDriver {
    pub fn new(provider: Arc<dyn LLMProvider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            temperature: None,
            retry: CompletionRetryPolicy::new(),
            budgets: TaskBudgets::new(),
            default_max_turns: DEFAULT_MAX_TURNS,
            mutating_tools: HashSet::new(),
            blacklisted_tools: HashSet::new(),
            pricing: Arc::new(DEFAULT_PRICING.clone()),
            store: None,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_retry_policy(mut self, retry: CompletionRetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_budgets(mut self, budgets: TaskBudgets) -> Self {
        self.budgets = budgets;
        self
    }

    pub fn with_default_max_turns(mut self, max_turns: usize) -> Self {
        self.default_max_turns = max_turns.max(1);
        self
    }

    pub fn with_mutating_tools<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.mutating_tools = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_blacklisted_tools<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.blacklisted_tools = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_pricing(mut self, pricing: PricingTable) -> Self {
        self.pricing = Arc::new(pricing);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn ConversationStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn store(&self) -> Option<Arc<dyn ConversationStore>> {
        self.store.clone()
    }

    /// Runs one task. The environment is reset first, so its tool
    /// registry reflects the active task before the recording wrapper
    /// goes in.
    pub async fn solve(
        &self,
        env: &mut dyn Environment,
        task: &Task,
        task_index: usize,
    ) -> Result<TaskResult, EvalError> {
        let trace = TaskTrace::new(format!("task:{}", task.id));
        env.attach_trace(trace.clone());

        let reset = env.reset(task_index).await?;
        let mut info = reset.info;

        let mut messages = Vec::new();
        let mut turns = Vec::new();
        if let Some(description) = &task.description {
            messages.push(ChatMessage::system(description.clone()));
        }
        let opening = ChatMessage::user(reset.observation);
        messages.push(opening.clone());
        let turn = TurnRecord::new(Originator::UserSim, opening);
        self.record_turn(&task.id, &turn).await;
        turns.push(turn);

        let expected_names: HashSet<String> = task
            .expected_actions
            .iter()
            .filter(|a| !a.is_respond())
            .map(|a| a.name.clone())
            .collect();
        let recorder = ActionRecorder::new();
        let wrapped = recorder.wrap_registry(
            env.tool_registry(),
            &expected_names,
            &self.mutating_tools,
            &self.blacklisted_tools,
        );
        env.install_tool_registry(wrapped);

        let agent_provider =
            TracedProvider::new(Arc::clone(&self.provider), trace.clone(), AGENT_LLM_TAG);

        let budget = task
            .max_turns
            .or_else(|| self.budgets.get(task_index))
            .unwrap_or(self.default_max_turns);

        let mut reward = 0.0;
        let outcome = self
            .run_loop(
                env,
                &agent_provider,
                &task.id,
                budget,
                &mut messages,
                &mut turns,
                &mut info,
                &mut reward,
            )
            .await;

        if let Err(error) = &outcome {
            error!(task_id = %task.id, %error, "task run aborted");
        }

        // Scoring happens regardless of how the loop ended, so an
        // aborted run still leaves its diffs on the trace.
        let expected: Vec<Action> = task
            .expected_actions
            .iter()
            .filter(|a| !a.is_respond())
            .cloned()
            .collect();
        let expected_writes: Vec<Action> = expected
            .iter()
            .filter(|a| self.mutating_tools.contains(&a.name))
            .cloned()
            .collect();

        let actions = recorder.all_actions();
        let write_actions = recorder.mutating_actions();
        let actions_diff = diff_actions(&expected, &actions, true);
        let write_actions_diff = diff_actions(&expected_writes, &write_actions, true);
        let write_actions_diff_no_order = diff_actions(&expected_writes, &write_actions, false);

        trace.set_attribute("reward", json!(reward));
        trace.set_attribute("num_messages", json!(messages.len()));
        trace.set_attribute("info", Value::Object(info.clone()));
        trace.set_attribute(
            "actions_diff",
            serde_json::to_value(&actions_diff).unwrap_or(Value::Null),
        );
        trace.set_attribute(
            "write_actions_diff",
            serde_json::to_value(&write_actions_diff).unwrap_or(Value::Null),
        );
        trace.set_attribute(
            "write_actions_diff_no_order",
            serde_json::to_value(&write_actions_diff_no_order).unwrap_or(Value::Null),
        );

        outcome?;

        let (agent_usage, user_usage) = aggregate_usage(&trace, &self.pricing)?;
        trace.set_attribute(
            "agent_usage",
            serde_json::to_value(agent_usage).unwrap_or(Value::Null),
        );
        trace.set_attribute(
            "user_usage",
            serde_json::to_value(user_usage).unwrap_or(Value::Null),
        );

        Ok(TaskResult {
            reward,
            actions_diff,
            write_actions_diff,
            write_actions_diff_no_order,
            info,
            actions,
            write_actions,
            messages,
            turns,
            agent_usage,
            user_usage,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_loop(
        &self,
        env: &mut dyn Environment,
        provider: &TracedProvider,
        task_id: &str,
        budget: usize,
        messages: &mut Vec<ChatMessage>,
        turns: &mut Vec<TurnRecord>,
        info: &mut Map<String, Value>,
        reward: &mut f64,
    ) -> Result<(), EvalError> {
        for turn_index in 0..budget {
            let request = self.request(messages.clone());
            let completion = self.retry.get_completion(provider, &request).await?;
            let action = Action::from_completion(&completion);

            messages.push(completion.message.clone());
            let turn = TurnRecord::new(Originator::Agent, completion.message);
            self.record_turn(task_id, &turn).await;
            turns.push(turn);

            let need_user = action.is_respond();
            let step = env
                .step(action.clone(), need_user, false)
                .await?;
            *reward = step.reward;
            for (key, value) in step.info {
                info.insert(key, value);
            }

            if need_user {
                if !step.observation.is_empty() {
                    let reply = ChatMessage::user(step.observation);
                    messages.push(reply.clone());
                    let turn = TurnRecord::new(Originator::UserSim, reply);
                    self.record_turn(task_id, &turn).await;
                    turns.push(turn);
                }
            } else {
                let call_id = action
                    .tool_calls
                    .first()
                    .and_then(|call| call.id.clone())
                    .unwrap_or_else(|| format!("call_{turn_index}"));
                let result = ChatMessage::tool(call_id, step.observation);
                messages.push(result.clone());
                let turn = TurnRecord::new(Originator::Environment, result);
                self.record_turn(task_id, &turn).await;
                turns.push(turn);

                env.post_step_check().await?;
            }

            if step.done {
                info!(task_id, turns = turn_index + 1, reward = *reward, "task completed");
                return Ok(());
            }
        }

        // Running out of turns is a scored outcome, not a failure.
        error!(task_id, budget, "turn budget exhausted before completion");
        Ok(())
    }

    fn request(&self, messages: Vec<ChatMessage>) -> CompletionRequest {
        let mut request = CompletionRequest::new(self.model.clone(), messages);
        if let Some(temperature) = self.temperature {
            request = request.with_temperature(temperature);
        }
        request
    }

    async fn record_turn(&self, task_id: &str, turn: &TurnRecord) {
        if let Some(store) = &self.store {
            if let Err(error) = store.append(task_id, turn.clone()).await {
                warn!(task_id, %error, "failed to persist conversation turn");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::ScriptedEnvironment;
    use crate::providers::scripted::ScriptedProvider;

    fn booking_task() -> Task {
        serde_yaml::from_str(
            r#"
id: t0
expected_actions:
  - name: book_reservation
    kwargs: { flight: HAT014 }
user_replies:
  - "Book me on HAT014."
tools:
  - name: book_reservation
    default: { kind: ok, value: { status: booked } }
"#,
        )
        .unwrap()
    }

    fn scripted_agent() -> ScriptedProvider {
        let provider = ScriptedProvider::new();
        provider.push_tool_call("book_reservation", serde_json::json!({"flight": "HAT014"}));
        provider.push_text("You are booked on HAT014.");
        provider
    }

    #[tokio::test]
    async fn perfect_run_scores_clean_diffs() {
        let driver = TurnDriver::new(Arc::new(scripted_agent()), "test-model")
            .with_mutating_tools(["book_reservation"]);
        let mut env = ScriptedEnvironment::new(vec![booking_task()]);

        let result = driver.solve(&mut env, &booking_task(), 0).await.unwrap();
        assert!(result.is_successful());
        assert!(result.actions_diff.is_empty());
        assert!(result.write_actions_diff.is_empty());
        assert!(result.write_actions_diff_no_order.is_empty());
        assert_eq!(result.actions.len(), 1);
        assert_eq!(result.write_actions.len(), 1);
    }

    #[tokio::test]
    async fn transcript_alternates_roles_and_records_originators() {
        let driver = TurnDriver::new(Arc::new(scripted_agent()), "test-model");
        let mut env = ScriptedEnvironment::new(vec![booking_task()]);
        let result = driver.solve(&mut env, &booking_task(), 0).await.unwrap();

        // user, assistant (call), tool result, assistant (respond)
        assert_eq!(result.messages.len(), 4);
        assert_eq!(result.turns[0].originator, Originator::UserSim);
        assert_eq!(result.turns[1].originator, Originator::Agent);
        assert_eq!(result.turns[2].originator, Originator::Environment);
        assert_eq!(result.turns[3].originator, Originator::Agent);
    }

    #[tokio::test]
    async fn budget_exhaustion_returns_partial_result() {
        let provider = ScriptedProvider::new();
        provider.push_tool_call("book_reservation", serde_json::json!({"flight": "HAT014"}));
        let driver = TurnDriver::new(Arc::new(provider), "test-model")
            .with_budgets(TaskBudgets::new().with(0, 1));
        let mut env = ScriptedEnvironment::new(vec![booking_task()]);

        let result = driver.solve(&mut env, &booking_task(), 0).await.unwrap();
        assert_eq!(result.reward, 0.0);
        assert_eq!(result.actions.len(), 1);
    }

    #[tokio::test]
    async fn per_task_budget_overrides_injected_table() {
        let provider = ScriptedProvider::new();
        provider.push_tool_call("book_reservation", serde_json::json!({"flight": "HAT014"}));
        provider.push_text("Done.");

        let mut task = booking_task();
        task.max_turns = Some(2);
        let driver = TurnDriver::new(Arc::new(provider), "test-model")
            .with_budgets(TaskBudgets::new().with(0, 1));

        let mut env = ScriptedEnvironment::new(vec![task.clone()]);
        let result = driver.solve(&mut env, &task, 0).await.unwrap();
        assert!(result.is_successful());
    }
}
