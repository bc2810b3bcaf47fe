// 对象存储传输层
//
// 分段上传核心只通过 Transport trait 与对象存储服务交互：
// - 初始化 / 合并 / 取消分段上传
// - 上传分段、按范围拷贝分段
// - 列举已上传分段、查询对象元数据
//
// 提供两种实现：
// - HttpTransport：基于 reqwest 的 OBS REST 接口
// - MemoryTransport：内存对象服务（测试与离线演示）

pub mod http;
pub mod memory;
mod xml;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub use http::{HttpTransport, RequestSigner, UnsignedRequests};
pub use memory::{MemoryTransport, PartFault};

/// 对象标识（桶 + 对象键）
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectTarget {
    pub bucket: String,
    pub key: String,
}

impl ObjectTarget {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for ObjectTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}

// =====================================================
// 请求 / 响应
// =====================================================

/// 初始化分段上传响应
#[derive(Debug, Clone)]
pub struct InitiateOutput {
    /// 服务端分配的上传ID
    pub upload_id: String,
    pub request_id: Option<String>,
}

/// 上传分段请求
#[derive(Debug, Clone)]
pub struct UploadPartRequest {
    pub target: ObjectTarget,
    pub upload_id: String,
    pub part_number: u32,
    pub body: Bytes,
}

/// 拷贝分段请求
#[derive(Debug, Clone)]
pub struct CopyPartRequest {
    pub target: ObjectTarget,
    pub upload_id: String,
    pub part_number: u32,
    /// 拷贝源对象
    pub source: ObjectTarget,
    /// 拷贝范围（`bytes=a-b`），None 表示整个源对象
    pub range: Option<String>,
}

/// 分段传输响应
#[derive(Debug, Clone)]
pub struct PartOutput {
    /// 服务端为该分段计算的 ETag
    pub etag: String,
    pub request_id: Option<String>,
}

/// 列举分段请求
#[derive(Debug, Clone)]
pub struct ListPartsRequest {
    pub target: ObjectTarget,
    pub upload_id: String,
    pub max_parts: Option<u32>,
    /// 从该分段号之后开始列举
    pub part_number_marker: Option<u32>,
}

/// 已上传分段摘要
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartSummary {
    pub part_number: u32,
    pub etag: String,
    pub size: u64,
    pub last_modified: Option<String>,
}

/// 列举分段响应
#[derive(Debug, Clone, Default)]
pub struct ListPartsOutput {
    pub parts: Vec<PartSummary>,
    pub is_truncated: bool,
    pub next_part_number_marker: Option<u32>,
}

/// 合并分段请求
#[derive(Debug, Clone)]
pub struct CompleteRequest {
    pub target: ObjectTarget,
    pub upload_id: String,
    /// (分段号, ETag)，必须按分段号升序
    pub parts: Vec<(u32, String)>,
}

/// 合并分段响应
#[derive(Debug, Clone)]
pub struct CompleteOutput {
    pub target: ObjectTarget,
    /// 整个对象的 ETag
    pub etag: String,
    pub location: Option<String>,
    pub request_id: Option<String>,
}

/// 对象元数据
#[derive(Debug, Clone)]
pub struct ObjectMeta {
    pub content_length: u64,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

// =====================================================
// 错误
// =====================================================

/// 服务端返回的错误
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceError {
    /// HTTP 状态码
    pub status: u16,
    /// 服务端错误码（如 NoSuchUpload）
    pub code: String,
    pub message: String,
    /// 请求ID（排查问题用）
    pub request_id: Option<String>,
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "status={}, code={}, message={}, request_id={}",
            self.status,
            self.code,
            self.message,
            self.request_id.as_deref().unwrap_or("-")
        )
    }
}

/// 传输层错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// 网络错误（连接失败、连接中断等）
    #[error("网络错误: {0}")]
    Network(String),
    /// 请求超时
    #[error("请求超时: {0}")]
    Timeout(String),
    /// 服务端返回错误状态
    #[error("服务端错误: {0}")]
    Service(ServiceError),
    /// 请求构造或签名失败
    #[error("请求构造失败: {0}")]
    Request(String),
    /// 响应无法解析
    #[error("响应解析失败: {0}")]
    InvalidResponse(String),
}

impl TransportError {
    /// 错误分类
    pub fn kind(&self) -> TransportErrorKind {
        match self {
            TransportError::Network(_) => TransportErrorKind::Network,
            TransportError::Timeout(_) => TransportErrorKind::Timeout,
            TransportError::Service(e) => TransportErrorKind::from_status(e.status, &e.code),
            TransportError::Request(_) | TransportError::InvalidResponse(_) => {
                TransportErrorKind::Unknown
            }
        }
    }

    /// 服务端请求ID
    pub fn request_id(&self) -> Option<&str> {
        match self {
            TransportError::Service(e) => e.request_id.as_deref(),
            _ => None,
        }
    }

    /// HTTP 状态码
    pub fn status(&self) -> Option<u16> {
        match self {
            TransportError::Service(e) => Some(e.status),
            _ => None,
        }
    }
}

/// 传输错误类型（决定是否重试）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// 网络错误（可重试）
    Network,
    /// 超时（可重试）
    Timeout,
    /// 服务器错误（可重试）
    ServerError,
    /// 限流（可重试，需要更长等待时间）
    RateLimited,
    /// 资源不存在（不可重试）
    NotFound,
    /// 权限不足（不可重试）
    Forbidden,
    /// 参数错误（不可重试）
    BadRequest,
    /// 未知错误
    Unknown,
}

impl TransportErrorKind {
    /// 是否可重试
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            TransportErrorKind::Network
                | TransportErrorKind::Timeout
                | TransportErrorKind::ServerError
                | TransportErrorKind::RateLimited
        )
    }

    /// 从 HTTP 状态码和服务端错误码转换
    pub fn from_status(status: u16, code: &str) -> Self {
        if status == 429 || code == "SlowDown" {
            return TransportErrorKind::RateLimited;
        }
        match status {
            500..=599 => TransportErrorKind::ServerError,
            404 => TransportErrorKind::NotFound,
            401 | 403 => TransportErrorKind::Forbidden,
            400 | 411 | 416 => TransportErrorKind::BadRequest,
            408 => TransportErrorKind::Timeout,
            _ => TransportErrorKind::Unknown,
        }
    }
}

// =====================================================
// Transport trait
// =====================================================

/// 对象存储服务接口
///
/// 每个方法对应一次网络请求，实现方不做重试
#[async_trait]
pub trait Transport: Send + Sync {
    /// 初始化分段上传，获取上传ID
    async fn initiate_multipart_upload(
        &self,
        target: &ObjectTarget,
    ) -> Result<InitiateOutput, TransportError>;

    /// 上传分段数据
    async fn upload_part(&self, request: UploadPartRequest) -> Result<PartOutput, TransportError>;

    /// 从已有对象按范围拷贝分段（服务端读取）
    async fn copy_part(&self, request: CopyPartRequest) -> Result<PartOutput, TransportError>;

    /// 列举已上传的分段（单页）
    async fn list_parts(&self, request: ListPartsRequest)
        -> Result<ListPartsOutput, TransportError>;

    /// 合并分段
    async fn complete_multipart_upload(
        &self,
        request: CompleteRequest,
    ) -> Result<CompleteOutput, TransportError>;

    /// 取消分段上传
    async fn abort_multipart_upload(
        &self,
        target: &ObjectTarget,
        upload_id: &str,
    ) -> Result<(), TransportError>;

    /// 查询对象元数据
    async fn head_object(&self, target: &ObjectTarget) -> Result<ObjectMeta, TransportError>;
}

/// 去掉 ETag 两侧的引号，便于比较
pub fn normalize_etag(etag: &str) -> &str {
    etag.trim().trim_matches('"')
}
