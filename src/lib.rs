//! 媒体鉴真工作流核心
//!
//! 素材接收 -> 分析调度 -> 判决 -> 历史记录，由 [`workflow::WorkflowController`] 串联。
//! 检测算法本身通过 [`backend::AnalysisBackend`] 接入。

pub mod api;
pub mod backend;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod history;
pub mod invoker;
pub mod media;
pub mod verdict;
pub mod workflow;

pub use backend::{AnalysisBackend, AnalysisReport, FixtureBackend, FixtureStep, SimulatedBackend};
pub use error::{WorkflowError, WorkflowResult};
pub use history::{HistoryStore, HISTORY_CAPACITY};
pub use invoker::{AnalysisInvoker, AnalysisRequest, RequestId};
pub use media::{AssetId, FileSelection, FileUpload, MediaAsset, MediaIntake, MimeCategory, PreviewHandle};
pub use verdict::{Classification, VerdictModel};
pub use workflow::{Phase, WorkflowController, WorkflowSnapshot};

use std::sync::{Mutex, MutexGuard};

// 锁内状态每次都是整体替换，中毒后直接取回
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
