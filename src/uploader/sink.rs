// 完成回调（持久化协作方）
//
// 任务完成后在后台任务中把快照交给 CompletionSink（UploadScheduler::shutdown 会等待其结束），
// sink 的失败只记日志，不影响任务状态

use crate::uploader::job::JobSnapshot;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tracing::info;

#[async_trait]
pub trait CompletionSink: Send + Sync {
    async fn on_job_completed(&self, snapshot: JobSnapshot) -> Result<()>;
}

/// 只打印日志的 sink
#[derive(Debug, Default, Clone)]
pub struct LogSink;

#[async_trait]
impl CompletionSink for LogSink {
    async fn on_job_completed(&self, snapshot: JobSnapshot) -> Result<()> {
        info!(
            "任务结果已记录: job={}, entity={}, 成功 {}/{}",
            snapshot.id,
            snapshot.entity_label,
            snapshot.success_count(),
            snapshot.files.len()
        );
        Ok(())
    }
}

/// 追加写入 JSON Lines 文件的 sink（每个完成的任务一行）
#[derive(Debug, Clone)]
pub struct JsonLinesSink {
    path: PathBuf,
}

impl JsonLinesSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl CompletionSink for JsonLinesSink {
    async fn on_job_completed(&self, snapshot: JobSnapshot) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .context("创建结果目录失败")?;
            }
        }

        let mut line = serde_json::to_string(&snapshot).context("序列化任务快照失败")?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("打开结果文件失败: {:?}", self.path))?;
        file.write_all(line.as_bytes())
            .await
            .context("写入结果文件失败")?;
        file.flush().await.context("写入结果文件失败")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uploader::asset::{Asset, UploadMetadata};
    use crate::uploader::job::{FileResult, UploadJob};

    fn completed_snapshot() -> JobSnapshot {
        let mut job = UploadJob::new(
            "fac-9",
            "9번 시설",
            vec![Asset::new("a.pdf", "application/pdf", vec![0u8; 4])],
            UploadMetadata::new().with("businessName", "본사"),
        );
        job.mark_normalizing();
        job.mark_transferring();
        job.mark_completed(vec![FileResult {
            index: 0,
            file_name: "a.pdf".into(),
            success: true,
            remote_location: Some("x/a.pdf".into()),
            error: None,
            attempts: 1,
            normalization: None,
        }]);
        job.snapshot()
    }

    #[tokio::test]
    async fn test_json_lines_sink_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("results.jsonl");
        let sink = JsonLinesSink::new(&path);

        sink.on_job_completed(completed_snapshot()).await.unwrap();
        sink.on_job_completed(completed_snapshot()).await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let parsed: JobSnapshot = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed.entity_id, "fac-9");
        assert_eq!(parsed.success_count(), 1);
        assert_eq!(parsed.metadata.get("businessName"), Some("본사"));
    }

    #[tokio::test]
    async fn test_log_sink() {
        assert!(LogSink.on_job_completed(completed_snapshot()).await.is_ok());
    }
}
