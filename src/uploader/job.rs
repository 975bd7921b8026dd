// 上传任务定义
//
// 一个任务 = 一个设施的一批文件 + 元数据
// 状态只能前进：queued -> normalizing -> transferring -> completed
// 任意非终止状态都可以进入 failed，终止状态不可复活

use crate::error::JobFailure;
use crate::uploader::asset::{Asset, AssetDescriptor, UploadMetadata};
use crate::uploader::normalizer::NormalizationReport;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 压缩阶段开始时的进度
pub const NORMALIZE_PHASE_START: u8 = 10;
/// 压缩阶段结束 / 传输阶段开始时的进度
pub const TRANSFER_PHASE_START: u8 = 30;
/// 传输阶段在完成前的进度上限
pub const TRANSFER_PHASE_CAP: u8 = 99;

/// 上传任务状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum UploadJobStatus {
    /// 等待调度
    Queued,
    /// 压缩中
    Normalizing,
    /// 传输中
    Transferring,
    /// 已完成（可能包含部分失败的文件）
    Completed,
    /// 任务级失败（取消或流水线故障）
    Failed,
}

impl UploadJobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, UploadJobStatus::Completed | UploadJobStatus::Failed)
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self,
            UploadJobStatus::Normalizing | UploadJobStatus::Transferring
        )
    }

    /// 是否允许迁移到 next
    pub fn can_transition_to(&self, next: UploadJobStatus) -> bool {
        use UploadJobStatus::*;
        match (self, next) {
            (Queued, Normalizing) => true,
            (Normalizing, Transferring) => true,
            (Transferring, Completed) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UploadJobStatus::Queued => "queued",
            UploadJobStatus::Normalizing => "normalizing",
            UploadJobStatus::Transferring => "transferring",
            UploadJobStatus::Completed => "completed",
            UploadJobStatus::Failed => "failed",
        }
    }
}

/// 单个文件的上传结果
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileResult {
    /// 在任务文件列表中的下标
    pub index: usize,
    /// 文件名
    pub file_name: String,
    /// 是否上传成功
    pub success: bool,
    /// 远程位置（成功时）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_location: Option<String>,
    /// 错误信息（失败时）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// 传输尝试次数
    pub attempts: u32,
    /// 压缩报告
    #[serde(skip_serializing_if = "Option::is_none")]
    pub normalization: Option<NormalizationReport>,
}

/// 上传任务
#[derive(Debug, Clone)]
pub struct UploadJob {
    /// 任务ID
    pub id: String,
    /// 所属实体（设施）ID
    pub entity_id: String,
    /// 所属实体名称
    pub entity_label: String,
    /// 文件列表（入队后不可变）
    pub files: Vec<Asset>,
    /// 元数据
    pub metadata: UploadMetadata,
    /// 状态
    pub status: UploadJobStatus,
    /// 进度 0-100
    pub progress: u8,
    /// 入队时间
    pub created_at: DateTime<Utc>,
    /// 开始处理时间
    pub started_at: Option<DateTime<Utc>>,
    /// 结束时间
    pub finished_at: Option<DateTime<Utc>>,
    /// 每个文件的结果（传输结束后填充）
    pub results: Option<Vec<FileResult>>,
    /// 任务级错误
    pub error: Option<JobFailure>,
}

impl UploadJob {
    /// 创建新的上传任务
    pub fn new(
        entity_id: impl Into<String>,
        entity_label: impl Into<String>,
        files: Vec<Asset>,
        metadata: UploadMetadata,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            entity_id: entity_id.into(),
            entity_label: entity_label.into(),
            files,
            metadata,
            status: UploadJobStatus::Queued,
            progress: 0,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            results: None,
            error: None,
        }
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    /// 更新进度（只增不减，限制在 [0, 100]）
    ///
    /// 返回进度是否发生变化
    pub fn advance_progress(&mut self, progress: u8) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        let progress = progress.min(100);
        if progress > self.progress {
            self.progress = progress;
            true
        } else {
            false
        }
    }

    /// 标记为压缩中
    pub fn mark_normalizing(&mut self) -> bool {
        if !self.status.can_transition_to(UploadJobStatus::Normalizing) {
            return false;
        }
        self.status = UploadJobStatus::Normalizing;
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        self.advance_progress(NORMALIZE_PHASE_START);
        true
    }

    /// 标记为传输中
    pub fn mark_transferring(&mut self) -> bool {
        if !self.status.can_transition_to(UploadJobStatus::Transferring) {
            return false;
        }
        self.status = UploadJobStatus::Transferring;
        self.advance_progress(TRANSFER_PHASE_START);
        true
    }

    /// 标记为已完成
    pub fn mark_completed(&mut self, results: Vec<FileResult>) -> bool {
        if !self.status.can_transition_to(UploadJobStatus::Completed) {
            return false;
        }
        self.progress = 100;
        self.status = UploadJobStatus::Completed;
        self.results = Some(results);
        self.finished_at = Some(Utc::now());
        true
    }

    /// 标记为失败
    pub fn mark_failed(&mut self, failure: JobFailure) -> bool {
        if !self.status.can_transition_to(UploadJobStatus::Failed) {
            return false;
        }
        self.status = UploadJobStatus::Failed;
        self.error = Some(failure);
        self.finished_at = Some(Utc::now());
        true
    }

    /// 处理耗时（毫秒），只有开始且结束的任务才有
    pub fn elapsed_ms(&self) -> Option<i64> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }

    /// 成功上传的文件数
    pub fn transferred_files(&self) -> usize {
        self.results
            .as_ref()
            .map(|r| r.iter().filter(|f| f.success).count())
            .unwrap_or(0)
    }

    /// 生成不可变快照
    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            id: self.id.clone(),
            entity_id: self.entity_id.clone(),
            entity_label: self.entity_label.clone(),
            files: self.files.iter().map(|f| f.descriptor()).collect(),
            metadata: self.metadata.clone(),
            status: self.status,
            progress: self.progress,
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            results: self.results.clone(),
            error: self.error.clone(),
        }
    }
}

/// 任务快照（推送给监听者 / 调用方）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobSnapshot {
    pub id: String,
    pub entity_id: String,
    pub entity_label: String,
    pub files: Vec<AssetDescriptor>,
    pub metadata: UploadMetadata,
    pub status: UploadJobStatus,
    pub progress: u8,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<Vec<FileResult>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobFailure>,
}

impl JobSnapshot {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn success_count(&self) -> usize {
        self.results
            .as_ref()
            .map(|r| r.iter().filter(|f| f.success).count())
            .unwrap_or(0)
    }

    pub fn failure_count(&self) -> usize {
        self.results
            .as_ref()
            .map(|r| r.iter().filter(|f| !f.success).count())
            .unwrap_or(0)
    }
}
