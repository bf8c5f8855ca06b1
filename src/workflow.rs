use crate::backend::AnalysisBackend;
use crate::error::{WorkflowError, WorkflowResult};
use crate::history::HistoryStore;
use crate::invoker::{AnalysisInvoker, RequestId};
use crate::lock;
use crate::media::{FileSelection, MediaAsset, MediaIntake, PreviewHandle, PreviewInfo};
use crate::verdict::VerdictModel;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// 预览缩略图默认最长边
pub const DEFAULT_PREVIEW_MAX_DIM: u32 = 256;

/// 工作流阶段
///
/// 视图只看这一个枚举决定渲染什么，不再另外维护 loading / tab 之类的布尔状态。
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub enum Phase {
    /// 没有素材
    Idle,
    /// 有素材，没有结果
    Staged,
    /// 请求在途
    Analyzing,
    /// 已有判决
    Completed,
}

impl Phase {
    pub fn is_busy(&self) -> bool {
        *self == Phase::Analyzing
    }

    /// 这个阶段本身允许发起分析；是否真能发起还要看上一个请求是否已经回来，
    /// 见 [`WorkflowController::can_analyze`]
    pub fn can_analyze(&self) -> bool {
        matches!(self, Phase::Staged | Phase::Completed)
    }
}

/// 状态机允许的边；其余一律拒绝
fn valid_transition(from: Phase, to: Phase) -> bool {
    use Phase::*;
    match (from, to) {
        (_, Idle) => true,
        (_, Staged) => true,
        (Staged, Analyzing) | (Completed, Analyzing) => true,
        (Analyzing, Completed) => true,
        _ => false,
    }
}

/// 最近一次后端失败，下一条命令时清除
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FailureInfo {
    pub kind: &'static str,
    pub message: String,
}

impl From<&WorkflowError> for FailureInfo {
    fn from(err: &WorkflowError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// 给视图层的只读快照
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSnapshot {
    pub phase: Phase,
    /// 视图据此启用/禁用“开始分析”按钮
    pub analysis_available: bool,
    pub current_asset: Option<MediaAsset>,
    #[serde(skip)]
    pub preview_handle: Option<PreviewHandle>,
    pub preview: Option<PreviewInfo>,
    pub current_verdict: Option<VerdictModel>,
    pub history_snapshot: Vec<VerdictModel>,
    pub last_error: Option<FailureInfo>,
}

struct ControllerState {
    phase: Phase,
    intake: MediaIntake,
    verdict: Option<VerdictModel>,
    // 结果仍然被需要的那个请求；重新选择或清除后置空，迟到的结果据此丢弃
    awaiting: Option<RequestId>,
    history: HistoryStore,
    last_error: Option<FailureInfo>,
}

impl ControllerState {
    fn discard_current(&mut self) {
        if let Some(request) = self.awaiting.take() {
            info!(request = request.0, "in-flight analysis superseded, its result will be discarded");
        }
        self.verdict = None;
        self.last_error = None;
    }
}

/// 模块：工作流控制器 (Workflow Controller)
///
/// **职责**: 把素材接收、分析调度、判决和历史记录串成一个状态机。
///
/// ```text
/// Idle/Staged/Completed --select_file--> Staged
/// Staged/Completed      --invoke------> Analyzing
/// Analyzing             --成功--------> Completed (写入历史)
/// Analyzing             --失败--------> Staged    (素材保留，可重试)
/// 任意阶段              --clear-------> Idle
/// ```
///
/// 所有状态都在一把同步锁里，锁从不跨越 `.await`；唯一的挂起点是后端调用。
pub struct WorkflowController {
    state: Mutex<ControllerState>,
    invoker: AnalysisInvoker,
}

impl WorkflowController {
    pub fn new(invoker: AnalysisInvoker, intake: MediaIntake) -> Self {
        Self {
            state: Mutex::new(ControllerState {
                phase: Phase::Idle,
                intake,
                verdict: None,
                awaiting: None,
                history: HistoryStore::new(),
                last_error: None,
            }),
            invoker,
        }
    }

    /// 用默认预览尺寸组装
    pub fn with_backend(backend: Arc<dyn AnalysisBackend>, deadline: Duration) -> Self {
        Self::new(
            AnalysisInvoker::new(backend, deadline),
            MediaIntake::new(DEFAULT_PREVIEW_MAX_DIM),
        )
    }

    /// 选择/拖放新文件
    ///
    /// 成功后进入 `Staged`，旧素材、旧判决一并丢弃；在途请求不会被中止，但它的结果不再生效。
    /// 输入无效时同步拒绝，状态不变。
    pub fn select_file(&self, selection: FileSelection) -> WorkflowResult<MediaAsset> {
        let mut st = lock(&self.state);
        let asset = st.intake.select_file(selection)?;
        st.discard_current();
        self.transition(&mut st, Phase::Staged, "file selected")?;
        Ok(asset)
    }

    /// 移除素材，回到 `Idle`；重复调用无副作用
    pub fn clear(&self) {
        let mut st = lock(&self.state);
        st.intake.clear();
        st.discard_current();
        self.enter_idle(&mut st, "asset cleared");
    }

    /// 回到初始状态，历史一并清空
    pub fn reset(&self) {
        let mut st = lock(&self.state);
        st.intake.clear();
        st.discard_current();
        st.history.clear();
        self.enter_idle(&mut st, "workflow reset");
    }

    pub fn clear_history(&self) {
        lock(&self.state).history.clear();
        debug!("history cleared");
    }

    /// 对当前素材发起分析
    ///
    /// - 没有素材或已有请求在途时返回 `InvalidState`，后端不会被调用。
    /// - 后端失败时回到 `Staged` 并返回错误，不写历史。
    /// - 等待期间素材被替换或清除时返回 `Superseded`，判决和历史都不受影响。
    pub async fn invoke_analysis(&self) -> WorkflowResult<VerdictModel> {
        let pending = {
            let mut st = lock(&self.state);
            match st.phase {
                Phase::Idle => {
                    return Err(WorkflowError::InvalidState("no asset staged".to_string()))
                }
                Phase::Analyzing => {
                    return Err(WorkflowError::InvalidState(
                        "analysis already in progress".to_string(),
                    ))
                }
                Phase::Staged | Phase::Completed => {}
            }
            let asset = st
                .intake
                .current()
                .cloned()
                .ok_or_else(|| WorkflowError::InvalidState("no asset staged".to_string()))?;

            // 上一个素材的请求可能还没回来，槽位被占时同样拒绝
            let pending = self.invoker.begin(asset)?;
            self.transition(&mut st, Phase::Analyzing, "analysis requested")?;
            st.awaiting = Some(pending.request().id);
            st.verdict = None;
            st.last_error = None;
            info!(
                request = pending.request().id.0,
                asset = pending.request().asset.id.0,
                deadline_ms = self.invoker.deadline().as_millis() as u64,
                "analysis dispatched"
            );
            pending
        };

        let request = pending.request().id;
        let mut guard = AbandonGuard {
            state: &self.state,
            request,
            armed: true,
        };
        let outcome = pending.execute().await;
        guard.armed = false;

        let mut st = lock(&self.state);
        if st.awaiting != Some(request) {
            info!(request = request.0, "stale analysis result discarded");
            return Err(WorkflowError::Superseded { request: request.0 });
        }
        st.awaiting = None;

        match outcome {
            Ok(verdict) => {
                self.transition(&mut st, Phase::Completed, "analysis completed")?;
                st.verdict = Some(verdict.clone());
                st.history.record(verdict.clone());
                Ok(verdict)
            }
            Err(err) => {
                if err.is_backend_failure() {
                    st.last_error = Some(FailureInfo::from(&err));
                }
                self.transition(&mut st, Phase::Staged, "analysis failed")?;
                Err(err)
            }
        }
    }

    pub fn phase(&self) -> Phase {
        lock(&self.state).phase
    }

    /// 现在调用 `invoke_analysis` 是否会被受理
    ///
    /// 分析途中重新选择文件会回到 `Staged`，但旧请求在返回或超时之前仍占着槽位。
    pub fn can_analyze(&self) -> bool {
        let st = lock(&self.state);
        st.phase.can_analyze() && !self.invoker.is_busy()
    }

    pub fn current_asset(&self) -> Option<MediaAsset> {
        lock(&self.state).intake.current().cloned()
    }

    pub fn current_verdict(&self) -> Option<VerdictModel> {
        lock(&self.state).verdict.clone()
    }

    pub fn history(&self) -> Vec<VerdictModel> {
        lock(&self.state).history.all()
    }

    pub fn preview(&self) -> Option<PreviewHandle> {
        lock(&self.state).intake.preview()
    }

    /// 等到当前素材的预览解码完成；期间素材被替换或清除则返回 `None`
    pub async fn preview_ready(&self) -> Option<PreviewHandle> {
        let (asset, mut rx) = {
            let st = lock(&self.state);
            (st.intake.current()?.id, st.intake.subscribe_preview())
        };
        let slot = rx
            .wait_for(|s| s.asset != Some(asset) || s.handle.is_some())
            .await
            .ok()?;
        if slot.asset == Some(asset) {
            slot.handle.clone()
        } else {
            None
        }
    }

    pub fn snapshot(&self) -> WorkflowSnapshot {
        let st = lock(&self.state);
        let preview_handle = st.intake.preview();
        WorkflowSnapshot {
            phase: st.phase,
            analysis_available: st.phase.can_analyze() && !self.invoker.is_busy(),
            current_asset: st.intake.current().cloned(),
            preview: preview_handle.as_ref().map(PreviewHandle::info),
            preview_handle,
            current_verdict: st.verdict.clone(),
            history_snapshot: st.history.all(),
            last_error: st.last_error.clone(),
        }
    }

    fn transition(&self, st: &mut ControllerState, to: Phase, reason: &str) -> WorkflowResult<()> {
        if !valid_transition(st.phase, to) {
            warn!(from = ?st.phase, to = ?to, reason, "invalid phase transition");
            return Err(WorkflowError::InvalidState(format!(
                "invalid phase transition {:?} -> {:?}",
                st.phase, to
            )));
        }
        if st.phase != to {
            info!(from = ?st.phase, to = ?to, reason, "phase changed");
        }
        st.phase = to;
        Ok(())
    }

    // 任何阶段都能回到 Idle
    fn enter_idle(&self, st: &mut ControllerState, reason: &str) {
        if st.phase != Phase::Idle {
            info!(from = ?st.phase, reason, "phase changed");
        }
        st.phase = Phase::Idle;
    }
}

/// `invoke_analysis` 的 future 在等待后端时被丢弃 (例如 HTTP 连接断开)，
/// 把状态机从 `Analyzing` 拉回 `Staged`
struct AbandonGuard<'a> {
    state: &'a Mutex<ControllerState>,
    request: RequestId,
    armed: bool,
}

impl Drop for AbandonGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut st = lock(self.state);
        if st.awaiting == Some(self.request) {
            warn!(request = self.request.0, "analysis abandoned before completion");
            st.awaiting = None;
            st.phase = Phase::Staged;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{AnalysisReport, FixtureBackend, FixtureStep};
    use crate::media::FileUpload;
    use crate::verdict::Classification;
    use tokio::sync::Notify;

    fn controller(backend: FixtureBackend) -> (WorkflowController, Arc<FixtureBackend>) {
        let backend = Arc::new(backend);
        let ctrl = WorkflowController::with_backend(backend.clone(), Duration::from_secs(5));
        (ctrl, backend)
    }

    fn jpeg(name: &str) -> FileSelection {
        FileUpload::new(name, "image/jpeg", vec![0xff, 0xd8, 0xff]).into()
    }

    #[tokio::test]
    async fn starts_idle_and_rejects_analysis() {
        let (ctrl, backend) = controller(FixtureBackend::always(AnalysisReport::with_score(90)));
        assert_eq!(ctrl.phase(), Phase::Idle);

        let err = ctrl.invoke_analysis().await.unwrap_err();
        assert_eq!(err.kind(), "INVALID_STATE");
        assert_eq!(backend.calls(), 0);
        assert_eq!(ctrl.phase(), Phase::Idle);
    }

    #[tokio::test]
    async fn invalid_selection_keeps_previous_state() {
        let (ctrl, _) = controller(FixtureBackend::always(AnalysisReport::with_score(90)));
        ctrl.select_file(jpeg("a.jpg")).unwrap();
        ctrl.invoke_analysis().await.unwrap();

        assert!(ctrl.select_file(FileSelection::empty()).is_err());
        assert_eq!(ctrl.phase(), Phase::Completed);
        assert!(ctrl.current_verdict().is_some());
    }

    #[tokio::test]
    async fn completed_can_be_reanalyzed() {
        let (ctrl, backend) = controller(
            FixtureBackend::new()
                .then(FixtureStep::Respond(AnalysisReport::with_score(20)))
                .then(FixtureStep::Respond(AnalysisReport::with_score(85))),
        );
        ctrl.select_file(jpeg("a.jpg")).unwrap();
        assert_eq!(ctrl.invoke_analysis().await.unwrap().classification(), Classification::Fake);
        assert_eq!(ctrl.invoke_analysis().await.unwrap().classification(), Classification::Genuine);

        assert_eq!(backend.calls(), 2);
        assert_eq!(ctrl.history().len(), 2);
        assert_eq!(ctrl.current_verdict().unwrap().score(), 85);
    }

    #[tokio::test]
    async fn clear_while_analyzing_discards_result() {
        let gate = Arc::new(Notify::new());
        let (ctrl, _) = controller(FixtureBackend::new().then(FixtureStep::Gated(
            gate.clone(),
            Ok(AnalysisReport::with_score(90)),
        )));
        ctrl.select_file(jpeg("a.jpg")).unwrap();

        let (outcome, _) = tokio::join!(ctrl.invoke_analysis(), async {
            assert_eq!(ctrl.phase(), Phase::Analyzing);
            ctrl.clear();
            gate.notify_one();
        });

        assert!(matches!(outcome, Err(WorkflowError::Superseded { .. })));
        assert_eq!(ctrl.phase(), Phase::Idle);
        assert!(ctrl.history().is_empty());
    }

    #[tokio::test]
    async fn abandoned_invocation_returns_to_staged() {
        let (ctrl, _) = controller(
            FixtureBackend::always(AnalysisReport::with_score(70)).then(FixtureStep::Hang),
        );
        ctrl.select_file(jpeg("a.jpg")).unwrap();

        let abandoned =
            tokio::time::timeout(Duration::from_millis(20), ctrl.invoke_analysis()).await;
        assert!(abandoned.is_err());
        assert_eq!(ctrl.phase(), Phase::Staged);

        // 槽位也已释放，可以直接重试
        assert_eq!(ctrl.invoke_analysis().await.unwrap().score(), 70);
    }

    #[tokio::test]
    async fn reset_clears_history_too() {
        let (ctrl, _) = controller(FixtureBackend::always(AnalysisReport::with_score(90)));
        ctrl.select_file(jpeg("a.jpg")).unwrap();
        ctrl.invoke_analysis().await.unwrap();

        ctrl.reset();
        let snap = ctrl.snapshot();
        assert_eq!(snap.phase, Phase::Idle);
        assert!(snap.current_asset.is_none());
        assert!(snap.current_verdict.is_none());
        assert!(snap.history_snapshot.is_empty());
    }

    #[test]
    fn state_machine_blocks_invalid_edges() {
        assert!(valid_transition(Phase::Staged, Phase::Analyzing));
        assert!(valid_transition(Phase::Analyzing, Phase::Staged));
        assert!(valid_transition(Phase::Completed, Phase::Idle));
        assert!(!valid_transition(Phase::Idle, Phase::Analyzing));
        assert!(!valid_transition(Phase::Idle, Phase::Completed));
        assert!(!valid_transition(Phase::Staged, Phase::Completed));
        assert!(!valid_transition(Phase::Analyzing, Phase::Analyzing));
    }

    #[test]
    fn phase_helpers() {
        assert!(Phase::Analyzing.is_busy());
        assert!(!Phase::Analyzing.can_analyze());
        assert!(Phase::Staged.can_analyze());
        assert!(Phase::Completed.can_analyze());
        assert!(!Phase::Idle.can_analyze());
    }
}
