use anyhow::Context;
use facility_upload_pipeline::{
    config::{AppConfig, LogConfig, TransferBackend},
    events::QueueStats,
    logging,
    uploader::{
        format_bytes, CompletionSink, FolderScanner, HttpTransfer, JsonLinesSink,
        LocalDirTransfer, LogSink, ScanOptions, TransferPrimitive, UploadMetadata,
        UploadScheduler,
    },
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

const CONFIG_PATH_ENV: &str = "FACILITY_UPLOAD_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "config/app.toml";
const DEFAULT_SOURCE_DIR: &str = "uploads";

fn config_path() -> PathBuf {
    std::env::var_os(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

/// 加载日志配置
///
/// 日志初始化早于完整配置加载，这里只读取 [log] 段，失败时使用默认值
async fn load_log_config(path: &PathBuf) -> LogConfig {
    if let Ok(content) = tokio::fs::read_to_string(path).await {
        if let Ok(config) = toml::from_str::<toml::Value>(&content) {
            if let Some(log_table) = config.get("log") {
                if let Ok(log_config) = log_table.clone().try_into::<LogConfig>() {
                    return log_config;
                }
            }
        }
    }
    LogConfig::default()
}

fn build_primitive(config: &AppConfig) -> anyhow::Result<Arc<dyn TransferPrimitive>> {
    let transfer = &config.transfer;
    let primitive: Arc<dyn TransferPrimitive> = match transfer.backend {
        TransferBackend::Local => {
            info!("存储端: 本地目录 {:?}", transfer.local_root);
            Arc::new(LocalDirTransfer::new(transfer.local_root.clone()))
        }
        TransferBackend::Http => {
            info!("存储端: HTTP {}", transfer.endpoint);
            Arc::new(
                HttpTransfer::new(
                    transfer.endpoint.clone(),
                    Duration::from_secs(transfer.timeout_secs),
                )
                .context("创建 HTTP 上传客户端失败")?,
            )
        }
    };
    Ok(primitive)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = config_path();
    let log_config = load_log_config(&config_path).await;
    let _log_guard = logging::init_logging(&log_config);

    info!("Facility Upload v{} 启动中...", env!("CARGO_PKG_VERSION"));

    let config = AppConfig::load_or_default(&config_path).await;
    let source_dir = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SOURCE_DIR));

    let primitive = build_primitive(&config)?;
    let sink: Arc<dyn CompletionSink> = match &config.transfer.results_file {
        Some(path) => Arc::new(JsonLinesSink::new(path.clone())),
        None => Arc::new(LogSink),
    };

    let scheduler = UploadScheduler::builder(primitive)
        .config(&config.upload)
        .normalize(config.normalize.clone())
        .sink(sink)
        .build();

    let _stats_sub = scheduler.subscribe_global(Arc::new(|stats: &QueueStats| {
        tracing::debug!(
            "队列: 排队 {}, 处理中 {}, 完成 {}, 失败 {}, 文件 {}/{}",
            stats.queued_jobs,
            stats.active_jobs,
            stats.completed_jobs,
            stats.failed_jobs,
            stats.transferred_files,
            stats.total_files
        );
    }));

    let scanner = FolderScanner::with_options(ScanOptions {
        skip_hidden: config.upload.skip_hidden_files,
        ..Default::default()
    });
    let mut batches = scanner
        .scan_batches(&source_dir)
        .with_context(|| format!("扫描源目录失败: {:?}", source_dir))?;

    if batches.is_empty() {
        warn!("源目录下没有可上传的设施目录: {:?}", source_dir);
        scheduler.shutdown().await;
        return Ok(());
    }

    let mut job_ids = Vec::with_capacity(batches.len());
    for batch in &mut batches {
        if let Err(e) = batch.dedup_by_content().await {
            warn!("设施文件去重失败，按原列表上传: {}, 错误: {:#}", batch.entity_id, e);
        }

        let assets = match batch.load_assets().await {
            Ok(assets) => assets,
            Err(e) => {
                error!("读取设施文件失败，跳过: {}, 错误: {:#}", batch.entity_id, e);
                continue;
            }
        };

        let metadata = UploadMetadata::new()
            .with("facilityId", batch.entity_id.clone())
            .with("facilityName", batch.label.clone());

        match scheduler.enqueue(&batch.entity_id, &batch.label, assets, metadata) {
            Ok(id) => {
                info!(
                    "已提交设施 {} ({} 个文件, {})",
                    batch.label,
                    batch.files.len(),
                    format_bytes(batch.total_size)
                );
                job_ids.push(id);
            }
            Err(e) => error!("提交设施 {} 失败: {}", batch.label, e),
        }
    }

    let wait_all = futures::future::join_all(job_ids.iter().map(|id| scheduler.wait_for(id)));

    tokio::select! {
        snapshots = wait_all => {
            let snapshots: Vec<_> = snapshots.into_iter().flatten().collect();
            for snap in &snapshots {
                match &snap.error {
                    Some(failure) => warn!("❌ {} 失败: {}", snap.entity_label, failure),
                    None => info!(
                        "✅ {} 完成: 成功 {}/{}",
                        snap.entity_label,
                        snap.success_count(),
                        snap.files.len()
                    ),
                }
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("收到 Ctrl+C，中止剩余任务...");
        }
    }

    let stats = scheduler.stats();
    // 等待任务驱动和完成回调全部结束
    scheduler.shutdown().await;

    info!(
        "全部结束: 任务 {} (完成 {}, 失败 {}), 文件 {}/{}, 平均耗时 {}",
        stats.total_jobs,
        stats.completed_jobs,
        stats.failed_jobs,
        stats.transferred_files,
        stats.total_files,
        stats
            .average_completion_ms
            .map(|ms| format!("{}ms", ms))
            .unwrap_or_else(|| "-".to_string())
    );

    Ok(())
}
