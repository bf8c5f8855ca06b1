use crate::backend::AnalysisReport;
use crate::error::{WorkflowError, WorkflowResult};
use crate::invoker::{AnalysisRequest, RequestId};
use crate::media::{AssetId, MimeCategory};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

/// 不适用于当前媒体类别的诊断项填这个值
pub const NOT_APPLICABLE: &str = "N/A";

/// 只对视频有意义的诊断项
pub const VIDEO_ONLY_DETAILS: [&str; 1] = ["audioVideoSync"];

/// 判决分类，完全由分数决定
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Classification {
    Genuine,
    Suspicious,
    Fake,
}

impl Classification {
    pub const GENUINE_MIN: u8 = 80;
    pub const SUSPICIOUS_MIN: u8 = 50;

    /// `score ≥ 80 → Genuine`，`50 ≤ score < 80 → Suspicious`，其余 `Fake`
    pub fn from_score(score: u8) -> Self {
        if score >= Self::GENUINE_MIN {
            Classification::Genuine
        } else if score >= Self::SUSPICIOUS_MIN {
            Classification::Suspicious
        } else {
            Classification::Fake
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Classification::Genuine => "Likely Genuine",
            Classification::Suspicious => "Possibly DeepFake",
            Classification::Fake => "Likely Fake",
        }
    }

    pub fn summary(&self) -> &'static str {
        match self {
            Classification::Genuine => "No significant manipulation detected",
            Classification::Suspicious => "Some anomalies detected - verify source",
            Classification::Fake => "Strong indicators of manipulation detected",
        }
    }
}

/// 一次分析的最终判决
///
/// **不可变**: 字段私有，只能通过 [`VerdictModel::from_report`] 构造。
/// 控制器持有“当前判决”，历史记录里存的是它的克隆。
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VerdictModel {
    request_id: RequestId,
    asset_id: AssetId,
    score: u8,
    classification: Classification,
    // 结果页的标题和说明，随分类一起下发给视图
    label: &'static str,
    summary: &'static str,
    anomalies: Vec<String>,
    metadata_flags: BTreeMap<String, bool>,
    details: BTreeMap<String, Value>,
    file_name: String,
    file_type: &'static str,
    sha256: String,
    completed_at: DateTime<Utc>,
}

impl VerdictModel {
    /// 由后端报告构造判决
    ///
    /// 除了按阈值推导分类、给图片补齐不适用的视频诊断项之外，不做任何加工。
    /// 分数超出 `0..=100` 视为后端违约。
    pub fn from_report(
        request: &AnalysisRequest,
        report: AnalysisReport,
        completed_at: DateTime<Utc>,
    ) -> WorkflowResult<Self> {
        let score = u8::try_from(report.score)
            .ok()
            .filter(|s| *s <= 100)
            .ok_or_else(|| {
                WorkflowError::MalformedReport(format!("score {} outside 0..=100", report.score))
            })?;

        let asset = &request.asset;
        let mut details = report.details;
        if asset.mime_category == MimeCategory::Image {
            for key in VIDEO_ONLY_DETAILS {
                details.insert(key.to_string(), Value::from(NOT_APPLICABLE));
            }
        }

        let classification = Classification::from_score(score);
        Ok(Self {
            request_id: request.id,
            asset_id: asset.id,
            score,
            classification,
            label: classification.label(),
            summary: classification.summary(),
            anomalies: report.anomalies,
            metadata_flags: report.metadata_flags,
            details,
            file_name: asset.name.clone(),
            file_type: asset.mime_category.label(),
            sha256: asset.sha256.clone(),
            completed_at,
        })
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn asset_id(&self) -> AssetId {
        self.asset_id
    }

    pub fn score(&self) -> u8 {
        self.score
    }

    pub fn classification(&self) -> Classification {
        self.classification
    }

    pub fn label(&self) -> &str {
        self.label
    }

    pub fn summary(&self) -> &str {
        self.summary
    }

    pub fn anomalies(&self) -> &[String] {
        &self.anomalies
    }

    /// 没有任何异常发现
    pub fn is_clean(&self) -> bool {
        self.anomalies.is_empty()
    }

    pub fn metadata_flags(&self) -> &BTreeMap<String, bool> {
        &self.metadata_flags
    }

    pub fn metadata_flag(&self, name: &str) -> Option<bool> {
        self.metadata_flags.get(name).copied()
    }

    pub fn details(&self) -> &BTreeMap<String, Value> {
        &self.details
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn file_type(&self) -> &str {
        self.file_type
    }

    pub fn sha256(&self) -> &str {
        &self.sha256
    }

    pub fn completed_at(&self) -> DateTime<Utc> {
        self.completed_at
    }
}
