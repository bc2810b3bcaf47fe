use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use obs_multipart_rust::{
    config::{AppConfig, LogConfig, DEFAULT_CONFIG_PATH},
    format::FormatValue,
    logging,
    multipart::{logging_progress, plan, resolve_part_size, UploadError},
    transport::Transport,
    HttpTransport, MemoryTransport, ObjectTarget, SchemaFormatter, SourceSpec, UploadCoordinator,
    UploadOptions,
};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "obs-multipart", version, about = "OBS / S3 并发分段上传工具")]
struct Cli {
    /// 配置文件路径
    #[arg(long, short, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    /// 分段大小（MB），覆盖配置文件
    #[arg(long, global = true)]
    part_size_mb: Option<u64>,

    /// 最大并发分段数，覆盖配置文件
    #[arg(long, global = true)]
    concurrency: Option<usize>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 分段上传本地文件
    Upload {
        file: PathBuf,
        bucket: String,
        key: String,
    },
    /// 服务端分段拷贝已有对象
    Copy {
        source_bucket: String,
        source_key: String,
        bucket: String,
        key: String,
    },
    /// 只输出分段规划
    Plan {
        /// 对象大小（字节）
        size: u64,
    },
    /// 按格式名格式化字段
    Format { kind: String, value: String },
    /// 在内存存储上演示一次分段拷贝
    Demo {
        /// 源对象大小（MB）
        #[arg(long, default_value_t = 12)]
        size_mb: u64,
    },
}

/// 结果输出
#[derive(Serialize)]
struct Report<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ErrorReport>,
}

#[derive(Serialize)]
struct ErrorReport {
    phase: String,
    message: String,
    part_numbers: Vec<u32>,
    request_id: Option<String>,
}

impl From<&UploadError> for ErrorReport {
    fn from(e: &UploadError) -> Self {
        Self {
            phase: e.phase().to_string(),
            message: e.to_string(),
            part_numbers: e.part_numbers(),
            request_id: e.request_id().map(str::to_string),
        }
    }
}

/// 先单独读取日志配置，日志初始化前不能输出
async fn load_log_config(path: &str) -> LogConfig {
    let Ok(content) = tokio::fs::read_to_string(path).await else {
        return LogConfig::default();
    };
    toml::from_str::<toml::Table>(&content)
        .ok()
        .and_then(|table| table.get("log").cloned())
        .and_then(|log| log.try_into::<LogConfig>().ok())
        .unwrap_or_default()
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("序列化输出失败")?
    );
    Ok(())
}

fn build_options(config: &AppConfig, cli: &Cli) -> UploadOptions {
    let mut options = UploadOptions::from(&config.upload);
    if let Some(mb) = cli.part_size_mb {
        options.part_size = mb.saturating_mul(1024 * 1024);
    }
    if let Some(concurrency) = cli.concurrency {
        options.max_concurrent_parts = concurrency;
    }
    options
}

/// 执行上传，Ctrl-C 取消
async fn run_upload(
    coordinator: UploadCoordinator,
    target: ObjectTarget,
    source: SourceSpec,
) -> Result<bool> {
    let cancel = coordinator.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("收到中断信号，正在取消上传...");
            cancel.cancel();
        }
    });

    match coordinator.upload_multipart(&target, source, None).await {
        Ok(completed) => {
            info!(
                "✓ 上传完成: {} ({} 个分段, etag={})",
                completed.target,
                completed.manifest.len(),
                completed.etag
            );
            print_json(&Report {
                success: true,
                data: Some(completed),
                error: None,
            })?;
            Ok(true)
        }
        Err(e) => {
            error!("上传失败 [{}]: {}", e.phase(), e);
            print_json(&Report::<()> {
                success: false,
                data: None,
                error: Some(ErrorReport::from(&e)),
            })?;
            Ok(false)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_config = load_log_config(&cli.config).await;
    let _log_guard = logging::init_logging(&log_config);

    info!("obs-multipart v{} 启动", env!("CARGO_PKG_VERSION"));

    let config = AppConfig::load_or_default(&cli.config).await;
    let formatter = Arc::new(SchemaFormatter::new(&config.format)?);
    let options = build_options(&config, &cli);

    let ok = match &cli.command {
        Command::Upload { file, bucket, key } => {
            let transport: Arc<dyn Transport> =
                Arc::new(HttpTransport::new(&config.endpoint, formatter)?);
            let source = SourceSpec::from_file(file).await?;
            let coordinator =
                UploadCoordinator::new(transport, options).with_progress(logging_progress());
            run_upload(coordinator, ObjectTarget::new(bucket, key), source).await?
        }
        Command::Copy {
            source_bucket,
            source_key,
            bucket,
            key,
        } => {
            let transport: Arc<dyn Transport> =
                Arc::new(HttpTransport::new(&config.endpoint, formatter)?);
            let source = SourceSpec::remote_copy(ObjectTarget::new(source_bucket, source_key));
            let coordinator =
                UploadCoordinator::new(transport, options).with_progress(logging_progress());
            run_upload(coordinator, ObjectTarget::new(bucket, key), source).await?
        }
        Command::Plan { size } => {
            let part_size = resolve_part_size(
                options.part_size,
                options.min_part_size,
                options.max_part_size,
            );
            let parts = plan(*size, part_size, options.max_parts)?;
            print_json(&parts)?;
            true
        }
        Command::Format { kind, value } => {
            let value = match value.parse::<i64>() {
                Ok(ts) => FormatValue::Timestamp(ts),
                Err(_) => FormatValue::from(value.as_str()),
            };
            match formatter.format(kind, &value) {
                Some(formatted) => println!("{}", formatted),
                None => anyhow::bail!("无法按 {} 格式化该值", kind),
            }
            true
        }
        Command::Demo { size_mb } => {
            let memory = MemoryTransport::new();
            memory.create_bucket("source-bucket");
            memory.create_bucket("target-bucket");

            let source = ObjectTarget::new("source-bucket", "demo/source.bin");
            let data: Vec<u8> = (0..size_mb * 1024 * 1024).map(|i| (i % 251) as u8).collect();
            let etag = memory.put_object(&source, data);
            info!("演示源对象已写入: {} ({} MB, etag={})", source, size_mb, etag);

            let coordinator = UploadCoordinator::new(Arc::new(memory.clone()), options)
                .with_progress(logging_progress());
            let target = ObjectTarget::new("target-bucket", "demo/copy.bin");
            let ok = run_upload(coordinator, target.clone(), SourceSpec::remote_copy(source)).await?;

            if let Some(copied) = memory.get_object(&target) {
                info!("目标对象大小: {} 字节", copied.len());
            }
            ok
        }
    };

    if !ok {
        std::process::exit(1);
    }
    Ok(())
}
