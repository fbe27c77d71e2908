use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use crate::{
    error::EvalError,
    providers::LLMProvider,
    types::{ChatMessage, CompletionRequest, CompletionResponse, FunctionCall, ToolCall},
};

/// Replays a fixed queue of completions, one per request. Used for
/// offline runs and tests where the agent's behaviour is known in
/// advance.
#[derive(Default)]
pub struct ScriptedProvider {
    responses: Mutex<VecDeque<CompletionResponse>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_responses(responses: Vec<CompletionResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
        }
    }

    pub fn push_response(&self, response: CompletionResponse) {
        self.responses.lock().unwrap().push_back(response);
    }

    pub fn push_text(&self, text: impl Into<String>) {
        self.push_response(CompletionResponse {
            message: ChatMessage::assistant(text),
            usage: None,
        });
    }

    pub fn push_tool_call(&self, name: impl Into<String>, arguments: Value) {
        let call = ToolCall::new(FunctionCall::new(name, arguments));
        self.push_response(CompletionResponse {
            message: ChatMessage::assistant("").with_tool_calls(vec![call]),
            usage: None,
        });
    }

    /// Queues a degenerate completion: no text, no function calls.
    pub fn push_empty(&self) {
        self.push_response(CompletionResponse {
            message: ChatMessage::assistant(""),
            usage: None,
        });
    }
}

#[async_trait]
impl LLMProvider for ScriptedProvider {
    async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, EvalError> {
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| EvalError::Provider("no more scripted responses".to_string()))
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn replays_in_order_then_errors() {
        let provider = ScriptedProvider::new();
        provider.push_text("first");
        provider.push_tool_call("get_user", json!({"id": 7}));

        let request = CompletionRequest::new("scripted", vec![ChatMessage::user("hi")]);

        let first = provider.complete(request.clone()).await.unwrap();
        assert_eq!(first.message.text(), Some("first"));

        let second = provider.complete(request.clone()).await.unwrap();
        assert_eq!(second.message.tool_calls[0].function.name, "get_user");

        assert!(provider.complete(request).await.is_err());
    }
}
