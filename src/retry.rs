use tracing::warn;

use crate::{
    error::{EvalError, RetryExhausted},
    providers::LLMProvider,
    types::{ChatMessage, CompletionRequest, CompletionResponse, MessageRole},
};

pub const EMPTY_RESPONSE_REPAIR_PROMPT: &str =
    "You returned an empty response, which is disallowed. Please try again.";

const DEFAULT_MAX_ATTEMPTS: usize = 3;

/// Requests one completion per turn, repairing degenerate (empty)
/// model outputs. A completion is usable when it carries non-empty
/// text or at least one function call; anything else triggers a
/// corrective retry against a repaired context. Exhausting the
/// attempt bound is fatal for the task.
#[derive(Debug, Clone)]
pub struct CompletionRetryPolicy {
    max_attempts: usize,
}

impl Default for CompletionRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl CompletionRetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub async fn get_completion(
        &self,
        provider: &dyn LLMProvider,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, EvalError> {
        // A conversation stage may end with a trailing system
        // directive; it must come last again after the correction.
        let trailing_system = request
            .messages
            .last()
            .filter(|m| m.role == MessageRole::System)
            .cloned();

        let mut repaired: Option<Vec<ChatMessage>> = None;
        let mut attempts = 0usize;

        loop {
            attempts += 1;
            let mut attempt_request = request.clone();
            if let Some(messages) = &repaired {
                attempt_request.messages = messages.clone();
            }

            let completion = provider.complete(attempt_request).await?;
            if completion.is_usable() {
                return Ok(completion);
            }

            if attempts >= self.max_attempts {
                return Err(RetryExhausted { attempts }.into());
            }

            warn!(attempt = attempts, "empty completion, retrying with repaired context");

            let mut context = match repaired.take() {
                None => request.messages.clone(),
                Some(mut previous) => {
                    previous.pop();
                    previous
                }
            };
            context.push(ChatMessage::assistant(""));
            context.push(ChatMessage::user(EMPTY_RESPONSE_REPAIR_PROMPT));
            if let Some(system) = &trailing_system {
                context.push(system.clone());
            }
            repaired = Some(context);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::scripted::ScriptedProvider;
    use crate::types::{FunctionCall, ToolCall};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    struct CountingProvider {
        inner: ScriptedProvider,
        requests: Mutex<Vec<CompletionRequest>>,
    }

    impl CountingProvider {
        fn new(inner: ScriptedProvider) -> Self {
            Self {
                inner,
                requests: Mutex::new(Vec::new()),
            }
        }

        fn request_count(&self) -> usize {
            self.requests.lock().unwrap().len()
        }

        fn last_request(&self) -> CompletionRequest {
            self.requests.lock().unwrap().last().unwrap().clone()
        }
    }

    #[async_trait]
    impl LLMProvider for CountingProvider {
        async fn complete(
            &self,
            request: CompletionRequest,
        ) -> Result<CompletionResponse, EvalError> {
            self.requests.lock().unwrap().push(request.clone());
            self.inner.complete(request).await
        }

        fn name(&self) -> &'static str {
            "counting"
        }
    }

    fn base_request() -> CompletionRequest {
        CompletionRequest::new("test-model", vec![ChatMessage::user("book my flight")])
    }

    #[tokio::test]
    async fn usable_first_attempt_issues_single_request() {
        let scripted = ScriptedProvider::new();
        scripted.push_text("On it.");
        let provider = CountingProvider::new(scripted);

        let policy = CompletionRetryPolicy::new();
        let completion = policy
            .get_completion(&provider, &base_request())
            .await
            .unwrap();

        assert_eq!(completion.message.text(), Some("On it."));
        assert_eq!(provider.request_count(), 1);
    }

    #[tokio::test]
    async fn recovers_on_third_attempt() {
        let scripted = ScriptedProvider::new();
        scripted.push_empty();
        scripted.push_empty();
        scripted.push_response(CompletionResponse {
            message: ChatMessage::assistant("").with_tool_calls(vec![ToolCall::new(
                FunctionCall::new("book_reservation", json!({"pnr": "X"})),
            )]),
            usage: None,
        });
        let provider = CountingProvider::new(scripted);

        let policy = CompletionRetryPolicy::new();
        let completion = policy
            .get_completion(&provider, &base_request())
            .await
            .unwrap();

        assert_eq!(completion.message.tool_calls.len(), 1);
        assert_eq!(provider.request_count(), 3);

        // The final attempt went out against the repaired context.
        let last = provider.last_request();
        let texts: Vec<_> = last.messages.iter().filter_map(|m| m.text()).collect();
        assert!(texts.contains(&EMPTY_RESPONSE_REPAIR_PROMPT));
    }

    #[tokio::test]
    async fn exhaustion_is_terminal_after_three_requests() {
        let scripted = ScriptedProvider::new();
        scripted.push_empty();
        scripted.push_empty();
        scripted.push_empty();
        let provider = CountingProvider::new(scripted);

        let policy = CompletionRetryPolicy::new();
        let err = policy
            .get_completion(&provider, &base_request())
            .await
            .unwrap_err();

        assert!(matches!(err, EvalError::RetryExhausted(ref e) if e.attempts == 3));
        assert_eq!(provider.request_count(), 3);
    }

    #[tokio::test]
    async fn trailing_system_directive_is_reappended() {
        let scripted = ScriptedProvider::new();
        scripted.push_empty();
        scripted.push_text("ok");
        let provider = CountingProvider::new(scripted);

        let request = CompletionRequest::new(
            "test-model",
            vec![
                ChatMessage::user("hello"),
                ChatMessage::system("Stay in the booking stage."),
            ],
        );

        let policy = CompletionRetryPolicy::new();
        policy.get_completion(&provider, &request).await.unwrap();

        let last = provider.last_request();
        let tail = last.messages.last().unwrap();
        assert_eq!(tail.role, MessageRole::System);
        assert_eq!(tail.text(), Some("Stay in the booking stage."));
    }

    #[tokio::test]
    async fn provider_errors_pass_through_untouched() {
        let provider = CountingProvider::new(ScriptedProvider::new());
        let policy = CompletionRetryPolicy::new();
        let err = policy
            .get_completion(&provider, &base_request())
            .await
            .unwrap_err();
        assert!(matches!(err, EvalError::Provider(_)));
        assert_eq!(provider.request_count(), 1);
    }
}
