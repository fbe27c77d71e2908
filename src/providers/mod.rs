use async_trait::async_trait;

use crate::error::EvalError;
use crate::types::{CompletionRequest, CompletionResponse};

pub mod openai;
pub mod scripted;

#[async_trait]
pub trait LLMProvider: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, EvalError>;

    fn name(&self) -> &'static str;
}
