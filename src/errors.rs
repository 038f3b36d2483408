use thiserror::Error;

/// Errors surfaced by the TCP bridge to the remote modeling host.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    #[error("not connected to the remote host")]
    NotConnected,
    #[error("connection reset while the request was in flight")]
    ConnectionReset,
    #[error("request timed out waiting for the remote host")]
    Timeout,
    #[error("request queue is full")]
    QueueFull,
    #[error("remote host error: {0}")]
    Remote(String),
}

/// Uniform failure the scheduler sees from any tool execution.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error(transparent)]
    Bridge(#[from] BridgeError),
    #[error("unknown tool `{0}`")]
    UnknownTool(String),
    #[error("invalid parameters: {0}")]
    Schema(String),
    #[error("model returned invalid JSON: {0}")]
    JsonParse(String),
    #[error("circuit breaker open for `{0}`")]
    CircuitOpen(&'static str),
    #[error("no matching asset found")]
    NoAssetFound,
    #[error("asset import failed: {0}")]
    ImportFailed(String),
    #[error("model call failed: {0}")]
    Llm(String),
}

impl ToolError {
    /// Whether the generic retry harness may try this failure again.
    /// Connection loss and open breakers are final; timeouts and
    /// 5xx-shaped upstream failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            ToolError::Bridge(BridgeError::Timeout) => true,
            ToolError::Bridge(BridgeError::Remote(msg)) => looks_transient(msg),
            ToolError::Llm(msg) => looks_transient(msg) || msg.contains("timed out"),
            ToolError::Bridge(_)
            | ToolError::CircuitOpen(_)
            | ToolError::UnknownTool(_)
            | ToolError::Schema(_)
            | ToolError::JsonParse(_)
            | ToolError::NoAssetFound
            | ToolError::ImportFailed(_) => false,
        }
    }
}

fn looks_transient(msg: &str) -> bool {
    ["500", "502", "503", "504", "overloaded", "temporarily unavailable", "rate limit"]
        .iter()
        .any(|needle| msg.contains(needle))
}

/// Plan production / validation failures.
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("plan is invalid: {0}")]
    Invalid(String),
    #[error("planner model call failed: {0}")]
    Llm(String),
    #[error("planner output was not valid JSON: {0}")]
    Json(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_retry_but_disconnects_do_not() {
        assert!(ToolError::Bridge(BridgeError::Timeout).is_retryable());
        assert!(!ToolError::Bridge(BridgeError::NotConnected).is_retryable());
        assert!(!ToolError::Bridge(BridgeError::ConnectionReset).is_retryable());
        assert!(!ToolError::CircuitOpen("generator").is_retryable());
    }

    #[test]
    fn five_xx_shaped_remote_errors_retry() {
        assert!(ToolError::Bridge(BridgeError::Remote("HTTP 503 from upstream".into())).is_retryable());
        assert!(!ToolError::Bridge(BridgeError::Remote("object not found".into())).is_retryable());
    }
}
