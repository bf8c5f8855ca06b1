//! 检测后端 (Analysis Backend)
//!
//! 工作流只依赖 [`AnalysisBackend`] 这个能力接口，真正的鉴伪算法不在本仓库范围内。
//! 这里提供两个实现：
//! - [`FixtureBackend`]: 按脚本返回固定结果，测试用。
//! - [`SimulatedBackend`]: 复现演示版的随机生成器，可指定种子，服务二进制默认用它。

use crate::error::{WorkflowError, WorkflowResult};
use crate::media::{AssetId, MediaAsset, MimeCategory};
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use crate::lock;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

/// 后端返回的原始字段
///
/// 不含分类：分类由工作流按分数阈值推导，后端不参与。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisReport {
    pub score: i32,
    #[serde(default)]
    pub anomalies: Vec<String>,
    #[serde(default)]
    pub metadata_flags: BTreeMap<String, bool>,
    #[serde(default)]
    pub details: BTreeMap<String, Value>,
}

impl AnalysisReport {
    pub fn with_score(score: i32) -> Self {
        Self {
            score,
            anomalies: Vec::new(),
            metadata_flags: BTreeMap::new(),
            details: BTreeMap::new(),
        }
    }

    pub fn anomaly(mut self, finding: impl Into<String>) -> Self {
        self.anomalies.push(finding.into());
        self
    }

    pub fn flag(mut self, name: impl Into<String>, value: bool) -> Self {
        self.metadata_flags.insert(name.into(), value);
        self
    }

    pub fn detail(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.details.insert(name.into(), value.into());
        self
    }
}

/// 检测后端能力接口
///
/// 唯一的挂起点。实现方负责把传输层失败映射为
/// `WorkflowError::BackendUnavailable`；截止时间由调用方统一施加。
#[async_trait]
pub trait AnalysisBackend: Send + Sync {
    /// 后端名称，用于日志
    fn name(&self) -> &'static str;

    async fn analyze(&self, asset: &MediaAsset) -> WorkflowResult<AnalysisReport>;
}

// ==========================================
// Fixture 后端
// ==========================================

/// 脚本中的一步
#[derive(Debug, Clone)]
pub enum FixtureStep {
    /// 立即返回
    Respond(AnalysisReport),
    /// 立即失败
    Fail(WorkflowError),
    /// 等待 `Notify` 放行后再给出结果
    Gated(Arc<Notify>, WorkflowResult<AnalysisReport>),
    /// 永不返回，用来触发超时
    Hang,
}

/// 确定性的脚本后端
///
/// 每次调用消费脚本中的一步；脚本用完后返回默认结果，没有默认结果则报不可用。
#[derive(Default)]
pub struct FixtureBackend {
    script: Mutex<VecDeque<FixtureStep>>,
    fallback: Option<AnalysisReport>,
    calls: AtomicUsize,
    seen: Mutex<Vec<AssetId>>,
}

impl FixtureBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// 脚本耗尽后一直返回这个结果
    pub fn always(report: AnalysisReport) -> Self {
        Self {
            fallback: Some(report),
            ..Self::default()
        }
    }

    pub fn then(self, step: FixtureStep) -> Self {
        self.push(step);
        self
    }

    pub fn push(&self, step: FixtureStep) {
        lock(&self.script).push_back(step);
    }

    /// 到目前为止被调用的次数
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// 按调用顺序记录的素材
    pub fn seen_assets(&self) -> Vec<AssetId> {
        lock(&self.seen).clone()
    }
}

#[async_trait]
impl AnalysisBackend for FixtureBackend {
    fn name(&self) -> &'static str {
        "fixture"
    }

    async fn analyze(&self, asset: &MediaAsset) -> WorkflowResult<AnalysisReport> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.seen).push(asset.id);

        let step = lock(&self.script).pop_front();
        match step {
            Some(FixtureStep::Respond(report)) => Ok(report),
            Some(FixtureStep::Fail(err)) => Err(err),
            Some(FixtureStep::Gated(gate, outcome)) => {
                gate.notified().await;
                outcome
            }
            Some(FixtureStep::Hang) => std::future::pending().await,
            None => self.fallback.clone().ok_or_else(|| {
                WorkflowError::BackendUnavailable("fixture script exhausted".to_string())
            }),
        }
    }
}

// ==========================================
// 模拟后端
// ==========================================

const FAKE_ANOMALIES: [&str; 4] = [
    "Facial boundary artifacts detected",
    "Inconsistent lighting across frames",
    "Audio-visual synchronization mismatch",
    "Unnatural eye blinking pattern",
];

const SUSPICIOUS_ANOMALIES: [&str; 3] = [
    "Minor facial blending artifacts",
    "Slight audio delay detected",
    "Compression artifacts present",
];

const NO_ANOMALIES: [&str; 0] = [];

/// 随机模拟后端
///
/// 先抽取分支 (伪造 30% / 可疑 30% /真实 40%)，再在该分支的分数段里取分：
/// 伪造 10..=49，可疑 50..=79，真实 80..=99。分数段互不相交，
/// 所以按阈值推导出的分类和抽中的分支总是一致。
pub struct SimulatedBackend {
    rng: Mutex<StdRng>,
    latency: Duration,
}

impl SimulatedBackend {
    pub fn new(seed: Option<u64>, latency: Duration) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            rng: Mutex::new(rng),
            latency,
        }
    }

    fn generate(&self, category: MimeCategory) -> AnalysisReport {
        let mut rng = lock(&self.rng);
        let is_video = category == MimeCategory::Video;
        let draw: f64 = rng.gen();

        let (score, anomalies, flags): (i32, &[&str], [bool; 3]) = if draw > 0.7 {
            (rng.gen_range(10..50), &FAKE_ANOMALIES[..], [true, true, true])
        } else if draw > 0.4 {
            (rng.gen_range(50..80), &SUSPICIOUS_ANOMALIES[..], [true, false, false])
        } else {
            (rng.gen_range(80..100), &NO_ANOMALIES[..], [false, false, false])
        };

        let frames = if is_video { rng.gen_range(100..600) } else { 1 };
        let processing = rng.gen::<f64>() * 3.0 + 1.0;
        let sync = match (is_video, draw > 0.7) {
            (false, _) => "N/A",
            (true, true) => "Misaligned",
            (true, false) => "Synchronized",
        };
        let consistency = if score > 70 {
            "High"
        } else if score > 40 {
            "Medium"
        } else {
            "Low"
        };

        let mut report = AnalysisReport::with_score(score)
            .flag("reencoded", flags[0])
            .flag("compressionMismatch", flags[1])
            .flag("exifTampered", flags[2])
            .detail("framesAnalyzed", frames)
            .detail("processingTime", format!("{:.2}s", processing))
            .detail("audioVideoSync", sync)
            .detail("facialConsistency", consistency);
        report.anomalies = anomalies.iter().map(|s| s.to_string()).collect();
        report
    }
}

#[async_trait]
impl AnalysisBackend for SimulatedBackend {
    fn name(&self) -> &'static str {
        "simulated"
    }

    async fn analyze(&self, asset: &MediaAsset) -> WorkflowResult<AnalysisReport> {
        let report = self.generate(asset.mime_category);
        debug!(asset = asset.id.0, score = report.score, "simulated report drawn");
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        Ok(report)
    }
}
