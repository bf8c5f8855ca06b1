use std::time::Duration;
use thiserror::Error;

/// 工作流错误分类
///
/// - `InvalidInput` / `InvalidState`: 同步拒绝，绝不会进入历史记录。
/// - `Superseded`: 结果到达时素材已经换了，不影响当前判决和历史。
/// - `BackendUnavailable` / `AnalysisTimeout` / `MalformedReport`: 来自检测后端，
///   控制器收到后回退到 `Staged`，素材保留以便重试。
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WorkflowError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("analysis backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("analysis timed out after {}s", .after.as_secs_f64())]
    AnalysisTimeout { after: Duration },

    #[error("invalid state: {0}")]
    InvalidState(String),

    // 等待期间素材被替换或清除，结果已丢弃
    #[error("analysis request {request} superseded by a newer selection")]
    Superseded { request: u64 },

    // 后端违反了契约 (例如 score 超出 0..=100)
    #[error("malformed analysis report: {0}")]
    MalformedReport(String),
}

impl WorkflowError {
    /// 稳定的错误代码，HTTP 层和快照里都用它
    pub fn kind(&self) -> &'static str {
        match self {
            WorkflowError::InvalidInput(_) => "INVALID_INPUT",
            WorkflowError::BackendUnavailable(_) => "BACKEND_UNAVAILABLE",
            WorkflowError::AnalysisTimeout { .. } => "ANALYSIS_TIMEOUT",
            WorkflowError::InvalidState(_) => "INVALID_STATE",
            WorkflowError::Superseded { .. } => "SUPERSEDED",
            WorkflowError::MalformedReport(_) => "MALFORMED_REPORT",
        }
    }

    /// 是否来自后端 (需要回退状态机，而不是同步拒绝)
    pub fn is_backend_failure(&self) -> bool {
        matches!(
            self,
            WorkflowError::BackendUnavailable(_)
                | WorkflowError::AnalysisTimeout { .. }
                | WorkflowError::MalformedReport(_)
        )
    }
}

pub type WorkflowResult<T> = Result<T, WorkflowError>;
