use crate::backend::AnalysisBackend;
use crate::error::{WorkflowError, WorkflowResult};
use crate::media::MediaAsset;
use crate::verdict::VerdictModel;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// 默认分析截止时间
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(30);

/// 请求号，单调递增，每次调用唯一
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestId(pub u64);

/// 一次分析尝试
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub id: RequestId,
    pub asset: MediaAsset,
}

/// 模块：分析调度 (Analysis Invoker)
///
/// **职责**: 保证同一时刻最多一个在途请求，给后端调用加截止时间，
/// 并把后端返回的字段原样装配成 [`VerdictModel`]。
///
/// 调用分两步：[`begin`](Self::begin) 同步占用在途槽位并分配请求号，
/// [`PendingAnalysis::execute`] 才真正挂起等待后端。控制器借此在不持锁的情况下
/// 提前拿到请求号，用来识别过期结果。
pub struct AnalysisInvoker {
    backend: Arc<dyn AnalysisBackend>,
    deadline: Duration,
    next_id: AtomicU64,
    in_flight: Arc<AtomicBool>,
}

impl AnalysisInvoker {
    pub fn new(backend: Arc<dyn AnalysisBackend>, deadline: Duration) -> Self {
        Self {
            backend,
            deadline,
            next_id: AtomicU64::new(1),
            in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// 是否有请求在途
    pub fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// 占用在途槽位；已有请求在途时返回 `InvalidState`，不排队
    pub fn begin(&self, asset: MediaAsset) -> WorkflowResult<PendingAnalysis> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(WorkflowError::InvalidState(
                "an analysis is already in flight".to_string(),
            ));
        }

        let id = RequestId(self.next_id.fetch_add(1, Ordering::SeqCst));
        Ok(PendingAnalysis {
            request: AnalysisRequest { id, asset },
            backend: Arc::clone(&self.backend),
            deadline: self.deadline,
            slot: SlotGuard(Arc::clone(&self.in_flight)),
        })
    }

    /// 一步完成：占槽 + 等待后端
    pub async fn run(&self, asset: MediaAsset) -> WorkflowResult<VerdictModel> {
        self.begin(asset)?.execute().await
    }
}

/// 已占槽、尚未完成的请求
///
/// 无论正常完成、出错、超时还是被丢弃 (future 被取消)，槽位都会在它析构时释放。
pub struct PendingAnalysis {
    request: AnalysisRequest,
    backend: Arc<dyn AnalysisBackend>,
    deadline: Duration,
    slot: SlotGuard,
}

impl std::fmt::Debug for PendingAnalysis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingAnalysis")
            .field("request", &self.request)
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

impl PendingAnalysis {
    pub fn request(&self) -> &AnalysisRequest {
        &self.request
    }

    /// 调用后端，恰好产出一个判决或一个错误
    pub async fn execute(self) -> WorkflowResult<VerdictModel> {
        let PendingAnalysis {
            request,
            backend,
            deadline,
            slot,
        } = self;

        info!(
            request = request.id.0,
            asset = request.asset.id.0,
            backend = backend.name(),
            "analysis started"
        );
        let started = Instant::now();

        let outcome = tokio::time::timeout(deadline, backend.analyze(&request.asset)).await;
        drop(slot);

        let report = match outcome {
            Ok(Ok(report)) => report,
            Ok(Err(err)) => {
                warn!(request = request.id.0, error = %err, "analysis failed");
                return Err(err);
            }
            Err(_) => {
                warn!(
                    request = request.id.0,
                    deadline_ms = deadline.as_millis() as u64,
                    "analysis timed out"
                );
                return Err(WorkflowError::AnalysisTimeout { after: deadline });
            }
        };

        let verdict = VerdictModel::from_report(&request, report, chrono::Utc::now())?;
        info!(
            request = request.id.0,
            score = verdict.score(),
            classification = ?verdict.classification(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "analysis completed"
        );
        Ok(verdict)
    }
}

struct SlotGuard(Arc<AtomicBool>);

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{AnalysisReport, FixtureBackend, FixtureStep};
    use crate::media::{FileUpload, MediaIntake};
    use crate::verdict::Classification;

    fn asset() -> MediaAsset {
        MediaIntake::new(8)
            .select_file(FileUpload::new("face.jpg", "image/jpeg", vec![0; 16]).into())
            .unwrap()
    }

    fn invoker(backend: FixtureBackend, deadline: Duration) -> (AnalysisInvoker, Arc<FixtureBackend>) {
        let backend = Arc::new(backend);
        (AnalysisInvoker::new(backend.clone(), deadline), backend)
    }

    #[tokio::test]
    async fn run_builds_verdict_from_report() {
        let (inv, backend) = invoker(
            FixtureBackend::new().then(FixtureStep::Respond(AnalysisReport::with_score(85))),
            DEFAULT_DEADLINE,
        );
        let v = inv.run(asset()).await.unwrap();
        assert_eq!(v.score(), 85);
        assert_eq!(v.classification(), Classification::Genuine);
        assert_eq!(backend.calls(), 1);
        assert!(!inv.is_busy());
    }

    #[tokio::test]
    async fn second_begin_is_rejected_while_first_in_flight() {
        let (inv, backend) = invoker(FixtureBackend::always(AnalysisReport::with_score(60)), DEFAULT_DEADLINE);
        let first = inv.begin(asset()).unwrap();
        assert!(inv.is_busy());

        let err = inv.begin(asset()).unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidState(_)));

        first.execute().await.unwrap();
        assert!(!inv.is_busy());
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test]
    async fn request_ids_increase_per_invocation() {
        let (inv, _) = invoker(FixtureBackend::always(AnalysisReport::with_score(60)), DEFAULT_DEADLINE);
        let a = inv.run(asset()).await.unwrap();
        let b = inv.run(asset()).await.unwrap();
        assert!(b.request_id() > a.request_id());
    }

    #[tokio::test]
    async fn timeout_releases_slot() {
        let (inv, backend) = invoker(
            FixtureBackend::always(AnalysisReport::with_score(90)).then(FixtureStep::Hang),
            Duration::from_millis(20),
        );

        let err = inv.run(asset()).await.unwrap_err();
        assert_eq!(err, WorkflowError::AnalysisTimeout { after: Duration::from_millis(20) });
        assert!(!inv.is_busy());

        assert_eq!(inv.run(asset()).await.unwrap().score(), 90);
        assert_eq!(backend.calls(), 2);
    }

    #[tokio::test]
    async fn backend_errors_propagate_unchanged() {
        let (inv, _) = invoker(
            FixtureBackend::new().then(FixtureStep::Fail(WorkflowError::BackendUnavailable(
                "connection refused".into(),
            ))),
            DEFAULT_DEADLINE,
        );
        let err = inv.run(asset()).await.unwrap_err();
        assert_eq!(err, WorkflowError::BackendUnavailable("connection refused".into()));
        assert!(!inv.is_busy());
    }

    #[tokio::test]
    async fn dropping_pending_request_releases_slot() {
        let (inv, backend) = invoker(FixtureBackend::new(), DEFAULT_DEADLINE);
        let pending = inv.begin(asset()).unwrap();
        drop(pending);
        assert!(!inv.is_busy());
        assert_eq!(backend.calls(), 0);
    }
}
