//! Turn-based benchmark harness for tool-using conversational agents.
//!
//! A [`TurnDriver`] plays one task against an [`Environment`]: each
//! turn it asks the model for a completion (through a retry policy
//! that repairs empty outputs), converts it into an [`Action`], steps
//! the environment, and feeds the observation back as either a user
//! message or a tool result. Tool invocations are recorded through an
//! [`ActionRecorder`] and scored against the task's expected actions
//! with structural diffs; token usage and dollar cost are aggregated
//! from the telemetry trace. A [`TaskRunner`] fans batches out over a
//! bounded number of concurrent runs.

pub mod cost;
pub mod diff;
pub mod driver;
pub mod env;
pub mod error;
pub mod providers;
pub mod recorder;
pub mod retry;
pub mod runner;
pub mod store;
pub mod task;
pub mod trace;
pub mod types;

pub use cost::{aggregate_usage, ModelPrice, PricingTable, UsageSummary, DEFAULT_PRICING};
pub use diff::{diff_actions, ActionDiff, DiffEntry, ValueChange};
pub use driver::{TaskResult, TurnDriver};
pub use env::{EnvTool, Environment, ResetResponse, ScriptedEnvironment, StepResponse, ToolRegistry};
pub use error::{EvalError, RetryExhausted};
pub use providers::{openai::OpenAI, scripted::ScriptedProvider, LLMProvider};
pub use recorder::ActionRecorder;
pub use retry::CompletionRetryPolicy;
pub use runner::{RunReport, TaskOutcome, TaskRunner};
pub use store::{ConversationStore, InMemoryConversationStore};
pub use task::{load_tasks, Action, Task, TaskBudgets, RESPOND_ACTION_NAME};
pub use trace::{Span, TaskTrace, TracedProvider, AGENT_LLM_TAG, USER_LLM_TAG};
pub use types::{
    ChatMessage, CompletionRequest, CompletionResponse, FunctionCall, MessageRole, Originator,
    TokenUsage, ToolCall, TurnRecord,
};
