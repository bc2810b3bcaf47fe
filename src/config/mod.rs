// 配置管理模块

use crate::format::FormatConfig;
use crate::multipart::FailurePolicy;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::fs;

/// 默认配置文件路径
pub const DEFAULT_CONFIG_PATH: &str = "config/app.toml";

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 服务端配置
    #[serde(default)]
    pub endpoint: EndpointConfig,
    /// 分段上传配置
    #[serde(default)]
    pub upload: UploadConfig,
    /// 字段格式化配置
    #[serde(default)]
    pub format: FormatConfig,
    /// 🔥 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 单个日志文件最大大小（字节，默认 50MB）
    #[serde(default = "default_log_max_file_size")]
    pub max_file_size: u64,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_max_file_size() -> u64 {
    50 * 1024 * 1024 // 50MB
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
            max_file_size: default_log_max_file_size(),
        }
    }
}

/// 服务端配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// 服务地址，如 `https://obs.cn-north-4.myhuaweicloud.com`
    #[serde(default = "default_endpoint_url")]
    pub url: String,
    /// 连接超时（秒）
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// 单次请求超时（秒），0 表示不限制
    #[serde(default = "default_socket_timeout_secs")]
    pub socket_timeout_secs: u64,
    /// 每个主机保留的空闲连接数
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,
    /// 厂商请求头前缀
    #[serde(default = "default_header_prefix")]
    pub header_prefix: String,
}

fn default_endpoint_url() -> String {
    "http://127.0.0.1:9000".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_socket_timeout_secs() -> u64 {
    30
}

fn default_pool_max_idle_per_host() -> usize {
    16
}

fn default_header_prefix() -> String {
    "x-obs-".to_string()
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            url: default_endpoint_url(),
            connect_timeout_secs: default_connect_timeout_secs(),
            socket_timeout_secs: default_socket_timeout_secs(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            header_prefix: default_header_prefix(),
        }
    }
}

/// 分段上传配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// 分段大小 (MB)，超出服务端允许范围时自动调整
    #[serde(default = "default_part_size_mb")]
    pub part_size_mb: u64,
    /// 单次上传最多分段数
    #[serde(default = "default_max_parts")]
    pub max_parts: u32,
    /// 同时传输的分段数，0 表示不限制
    #[serde(default = "default_max_concurrent_parts")]
    pub max_concurrent_parts: usize,
    /// 单个分段最大重试次数
    #[serde(default = "default_max_part_retries")]
    pub max_part_retries: u32,
    /// 单次分段请求超时（秒），0 表示不限制
    #[serde(default)]
    pub part_timeout_secs: u64,
    /// 等待全部分段完成的超时（秒），0 表示不限制
    #[serde(default)]
    pub wait_timeout_secs: u64,
    /// 分段失败时的处理策略
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    /// 合并前列举服务端分段并与清单核对
    #[serde(default = "default_verify_committed_parts")]
    pub verify_committed_parts: bool,
}

fn default_part_size_mb() -> u64 {
    5
}

fn default_max_parts() -> u32 {
    10_000
}

fn default_max_concurrent_parts() -> usize {
    8
}

fn default_max_part_retries() -> u32 {
    3
}

fn default_verify_committed_parts() -> bool {
    true
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            part_size_mb: default_part_size_mb(),
            max_parts: default_max_parts(),
            max_concurrent_parts: default_max_concurrent_parts(),
            max_part_retries: default_max_part_retries(),
            part_timeout_secs: 0,
            wait_timeout_secs: 0,
            failure_policy: FailurePolicy::default(),
            verify_committed_parts: default_verify_committed_parts(),
        }
    }
}

impl UploadConfig {
    /// 分段大小（字节）
    pub fn part_size_bytes(&self) -> u64 {
        self.part_size_mb.saturating_mul(1024 * 1024)
    }
}

impl AppConfig {
    /// 检查配置取值
    pub fn validate(&self) -> Result<()> {
        if self.endpoint.url.trim().is_empty() {
            anyhow::bail!("endpoint.url 不能为空");
        }
        if !self.endpoint.url.starts_with("http://") && !self.endpoint.url.starts_with("https://")
        {
            anyhow::bail!("endpoint.url 必须以 http:// 或 https:// 开头: {}", self.endpoint.url);
        }
        if self.upload.part_size_mb == 0 {
            anyhow::bail!("upload.part_size_mb 必须大于 0");
        }
        if self.upload.max_parts == 0 || self.upload.max_parts > crate::multipart::MAX_PART_COUNT {
            anyhow::bail!(
                "upload.max_parts 必须在 1-{} 之间: {}",
                crate::multipart::MAX_PART_COUNT,
                self.upload.max_parts
            );
        }
        if self.format.naive_offset_minutes.abs() >= 24 * 60 {
            anyhow::bail!(
                "format.naive_offset_minutes 超出范围: {}",
                self.format.naive_offset_minutes
            );
        }
        Ok(())
    }

    /// 从文件加载配置
    pub async fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;

        let config: AppConfig = toml::from_str(&content).context("Failed to parse config file")?;

        config.validate().context("配置文件校验失败")?;

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: &str) -> Result<()> {
        self.validate().context("保存配置失败")?;

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        // 确保父目录存在
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .context("Failed to create config directory")?;
            }
        }

        fs::write(path, content)
            .await
            .context("Failed to write config file")?;

        tracing::info!("✓ 配置已保存: {}", path);

        Ok(())
    }

    /// 加载或创建默认配置
    pub async fn load_or_default(path: &str) -> Self {
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {:#}", e);
                let default_config = Self::default();

                // 文件不存在时写出一份默认配置，已存在但无效时保留原文件
                if !std::path::Path::new(path).exists() {
                    if let Err(e) = default_config.save_to_file(path).await {
                        tracing::error!("保存默认配置失败: {}", e);
                    }
                }

                default_config
            }
        }
    }
}
