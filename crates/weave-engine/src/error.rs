use weave_core::errors::ProviderError;
use weave_core::tools::ToolError;
use weave_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("thread not found: {0}")]
    ThreadNotFound(String),

    #[error("run cancelled")]
    Cancelled,

    #[error("{0}")]
    Internal(String),
}
