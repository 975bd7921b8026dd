//! 事件类型定义
//!
//! 任务监听者收到 `JobSnapshot`，全局监听者收到 `QueueStats`

use crate::uploader::job::{UploadJob, UploadJobStatus};
use serde::{Deserialize, Serialize};
use std::ops::Deref;

/// 通知类型
///
/// 进度通知会被节流，状态变更总是送达
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum NotifyKind {
    /// 低优先级：传输进度
    Progress = 0,
    /// 高优先级：状态变更（含完成、失败）
    StateChanged = 1,
}

impl NotifyKind {
    pub fn is_throttled(&self) -> bool {
        matches!(self, NotifyKind::Progress)
    }
}

/// 队列统计
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub total_jobs: usize,
    pub queued_jobs: usize,
    pub active_jobs: usize,
    pub completed_jobs: usize,
    pub failed_jobs: usize,
    pub total_files: usize,
    /// 已成功上传的文件数
    pub transferred_files: usize,
    /// 平均完成耗时（毫秒），只统计已完成的任务
    pub average_completion_ms: Option<u64>,
}

impl QueueStats {
    /// 汇总任务列表（逐个读取，可以直接传入锁守卫）
    pub fn collect<J: Deref<Target = UploadJob>>(jobs: impl IntoIterator<Item = J>) -> Self {
        let mut stats = QueueStats::default();
        let mut latency_sum: i64 = 0;
        let mut latency_count: i64 = 0;

        for job in jobs {
            stats.total_jobs += 1;
            stats.total_files += job.file_count();
            stats.transferred_files += job.transferred_files();

            match job.status {
                UploadJobStatus::Queued => stats.queued_jobs += 1,
                UploadJobStatus::Normalizing | UploadJobStatus::Transferring => {
                    stats.active_jobs += 1
                }
                UploadJobStatus::Completed => stats.completed_jobs += 1,
                UploadJobStatus::Failed => stats.failed_jobs += 1,
            }

            if job.status == UploadJobStatus::Completed {
                if let Some(ms) = job.elapsed_ms() {
                    latency_sum += ms.max(0);
                    latency_count += 1;
                }
            }
        }

        if latency_count > 0 {
            stats.average_completion_ms = Some((latency_sum / latency_count) as u64);
        }
        stats
    }

    /// 是否所有任务都已结束
    pub fn is_idle(&self) -> bool {
        self.queued_jobs == 0 && self.active_jobs == 0
    }
}
