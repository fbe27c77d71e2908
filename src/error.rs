use thiserror::Error;

#[derive(Debug, Error)]
pub enum EvalError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("missing API key: set the {0} environment variable")]
    MissingApiKey(&'static str),

    #[error("invalid response from provider: {0}")]
    InvalidResponse(&'static str),

    #[error("environment error: {0}")]
    Environment(String),

    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("tool execution failed ({tool}): {message}")]
    ToolExecution { tool: String, message: String },

    #[error("malformed usage payload in span '{span}': {message}")]
    MalformedUsage { span: String, message: String },

    #[error(transparent)]
    RetryExhausted(#[from] RetryExhausted),
}

/// Terminal outcome of the completion retry loop. Kept as its own type
/// so batch callers can tell "this task is unsalvageable" apart from
/// generic upstream failures.
#[derive(Debug, Error)]
#[error("no usable completion after {attempts} attempt(s)")]
pub struct RetryExhausted {
    pub attempts: usize,
}
