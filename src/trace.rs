use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};

use crate::{
    error::EvalError,
    providers::LLMProvider,
    types::{CompletionRequest, CompletionResponse},
};

/// Tag carried by completion spans issued on behalf of the agent.
pub const AGENT_LLM_TAG: &str = "llm.agent";
/// Tag carried by completion spans issued by a model-backed user
/// simulator inside the environment.
pub const USER_LLM_TAG: &str = "llm.user";

/// One recorded unit of work with free-form attributes.
#[derive(Debug, Clone, Serialize)]
pub struct Span {
    pub name: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    pub attributes: BTreeMap<String, Value>,
}

impl Span {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tags: Vec::new(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn set_attribute(&mut self, key: impl Into<String>, value: Value) {
        self.attributes.insert(key.into(), value);
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

/// Per-task telemetry: a root span for scoring attributes plus the
/// flat list of child spans recorded during the run. Cloning is
/// shallow, so the driver, the traced providers, and the environment
/// all append to the same tree.
#[derive(Clone, Default)]
pub struct TaskTrace {
    inner: Arc<Mutex<TraceInner>>,
}

#[derive(Default)]
struct TraceInner {
    root: Option<Span>,
    spans: Vec<Span>,
}

impl TaskTrace {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(TraceInner {
                root: Some(Span::new(name)),
                spans: Vec::new(),
            })),
        }
    }

    pub fn record_span(&self, span: Span) {
        self.inner.lock().unwrap().spans.push(span);
    }

    /// Sets an attribute on the root span.
    pub fn set_attribute(&self, key: impl Into<String>, value: Value) {
        let mut inner = self.inner.lock().unwrap();
        let root = inner.root.get_or_insert_with(|| Span::new("task"));
        root.set_attribute(key, value);
    }

    pub fn find_tagged(&self, tag: &str) -> Vec<Span> {
        self.inner
            .lock()
            .unwrap()
            .spans
            .iter()
            .filter(|span| span.has_tag(tag))
            .cloned()
            .collect()
    }

    /// Snapshot of the root span and its scoring attributes.
    pub fn root(&self) -> Span {
        let mut inner = self.inner.lock().unwrap();
        inner.root.get_or_insert_with(|| Span::new("task")).clone()
    }

    pub fn spans(&self) -> Vec<Span> {
        self.inner.lock().unwrap().spans.clone()
    }
}

/// Provider decorator that records a tagged completion span per call.
/// Usage is always written, with zeros when the backend reports none,
/// so cost aggregation treats a silent backend as free instead of
/// malformed.
pub struct TracedProvider {
    inner: Arc<dyn LLMProvider>,
    trace: TaskTrace,
    tag: &'static str,
}

impl TracedProvider {
    pub fn new(inner: Arc<dyn LLMProvider>, trace: TaskTrace, tag: &'static str) -> Self {
        Self { inner, trace, tag }
    }
}

#[async_trait]
impl LLMProvider for TracedProvider {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, EvalError> {
        let model = request.model.clone();
        let completion = self.inner.complete(request).await?;

        let mut span = Span::new("completion").with_tag(self.tag);
        span.set_attribute("model", Value::String(model));
        let usage = match &completion.usage {
            Some(usage) => serde_json::to_value(usage)?,
            None => json!({
                "prompt_tokens": 0,
                "completion_tokens": 0,
                "total_tokens": 0,
            }),
        };
        span.set_attribute("usage", usage);
        self.trace.record_span(span);

        Ok(completion)
    }

    fn name(&self) -> &'static str {
        "traced"
    }
}
