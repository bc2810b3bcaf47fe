// 分段上传错误类型
//
// 按阶段划分：规划 / 会话 / 分段传输 / 汇总 / 合并，
// 由 UploadError 统一对外，调用方据此判断失败阶段、失败分段和请求ID

use crate::transport::{ServiceError, TransportError, TransportErrorKind};
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// 规划阶段错误（尚未发起任何网络请求）
#[derive(Debug, Error)]
pub enum PlanningError {
    #[error("分段大小无效: {part_size}")]
    InvalidPartSize { part_size: u64 },

    #[error("分段数 {part_count} 超过上限 {max_parts}")]
    TooManyParts { part_count: u64, max_parts: u32 },

    #[error("无法获取源对象信息: {reason}")]
    SourceUnavailable {
        reason: String,
        request_id: Option<String>,
    },
}

/// 会话阶段错误（初始化分段上传失败）
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("初始化分段上传被拒绝: {error}")]
    ServiceRejected {
        #[source]
        error: TransportError,
    },
}

impl SessionError {
    pub fn request_id(&self) -> Option<&str> {
        match self {
            SessionError::ServiceRejected { error } => error.request_id(),
        }
    }
}

/// 单个分段传输失败原因
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PartTransferError {
    /// 网络层失败
    #[error("传输失败: {message}")]
    Transport { message: String },

    /// 服务端返回错误状态
    #[error("服务端错误: status={status}, code={code}, message={message}")]
    ServiceStatus {
        status: u16,
        code: String,
        message: String,
        request_id: Option<String>,
    },

    /// 请求超时
    #[error("请求超时: {message}")]
    Timeout { message: String },

    /// 读取源数据失败
    #[error("读取源数据失败: {message}")]
    Source { message: String },

    /// 任务被中止（取消或异常退出）
    #[error("分段任务中止: {message}")]
    Aborted { message: String },
}

impl PartTransferError {
    /// 用于重试判断的错误分类
    pub fn kind(&self) -> TransportErrorKind {
        match self {
            PartTransferError::Transport { .. } => TransportErrorKind::Network,
            PartTransferError::Timeout { .. } => TransportErrorKind::Timeout,
            PartTransferError::ServiceStatus { status, code, .. } => {
                TransportErrorKind::from_status(*status, code)
            }
            PartTransferError::Source { .. } | PartTransferError::Aborted { .. } => {
                TransportErrorKind::Unknown
            }
        }
    }

    pub fn is_retriable(&self) -> bool {
        self.kind().is_retriable()
    }

    pub fn request_id(&self) -> Option<&str> {
        match self {
            PartTransferError::ServiceStatus { request_id, .. } => request_id.as_deref(),
            _ => None,
        }
    }
}

impl From<TransportError> for PartTransferError {
    fn from(error: TransportError) -> Self {
        match error {
            TransportError::Network(message) => PartTransferError::Transport { message },
            TransportError::Timeout(message) => PartTransferError::Timeout { message },
            TransportError::Service(ServiceError {
                status,
                code,
                message,
                request_id,
            }) => PartTransferError::ServiceStatus {
                status,
                code,
                message,
                request_id,
            },
            TransportError::Request(message) | TransportError::InvalidResponse(message) => {
                PartTransferError::Transport { message }
            }
        }
    }
}

/// 失败的分段
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedPart {
    pub part_number: u32,
    pub error: PartTransferError,
}

impl fmt::Display for FailedPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}: {}", self.part_number, self.error)
    }
}

/// 汇总阶段错误
#[derive(Debug, Error)]
pub enum AggregationError {
    /// 同一分段号收到两个不同的 ETag
    #[error("分段 {part_number} 结果不一致: {existing} != {conflicting}")]
    InconsistentPart {
        part_number: u32,
        existing: String,
        conflicting: String,
    },

    /// 成功分段数与规划数不一致
    #[error(
        "分段上传不完整: 期望 {expected}, 成功 {succeeded}, 收到 {received}, 失败 {}, 缺失 {missing:?}, 等待超时 {timed_out}",
        .failed.len()
    )]
    IncompleteUpload {
        expected: usize,
        succeeded: usize,
        received: usize,
        failed: Vec<FailedPart>,
        missing: Vec<u32>,
        timed_out: bool,
    },

    /// 调用方取消
    #[error("分段上传已取消: 期望 {expected}, 已收到 {received}")]
    Cancelled { expected: usize, received: usize },
}

/// 合并阶段错误
#[derive(Debug, Error)]
pub enum FinalizeError {
    /// 清单与服务端记录的分段不一致
    #[error("分段校验不一致: {reason}")]
    DigestMismatch {
        reason: String,
        part_numbers: Vec<u32>,
        request_id: Option<String>,
    },

    /// 合并请求被服务端拒绝
    #[error("合并分段被拒绝: {error}")]
    ServiceRejected {
        #[source]
        error: TransportError,
    },
}

/// 出错时所处的阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailedPhase {
    Planning,
    Session,
    Aggregation,
    Finalize,
}

impl fmt::Display for FailedPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailedPhase::Planning => "planning",
            FailedPhase::Session => "session",
            FailedPhase::Aggregation => "aggregation",
            FailedPhase::Finalize => "finalize",
        };
        f.write_str(name)
    }
}

/// 分段上传错误
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("规划失败: {0}")]
    Planning(#[from] PlanningError),

    #[error("会话失败: {0}")]
    Session(#[from] SessionError),

    #[error("分段汇总失败: {0}")]
    Aggregation(#[from] AggregationError),

    #[error("合并失败: {0}")]
    Finalize(#[from] FinalizeError),
}

impl UploadError {
    pub fn phase(&self) -> FailedPhase {
        match self {
            UploadError::Planning(_) => FailedPhase::Planning,
            UploadError::Session(_) => FailedPhase::Session,
            UploadError::Aggregation(_) => FailedPhase::Aggregation,
            UploadError::Finalize(_) => FailedPhase::Finalize,
        }
    }

    /// 失败或缺失的分段号（升序）
    pub fn part_numbers(&self) -> Vec<u32> {
        let mut numbers = match self {
            UploadError::Aggregation(AggregationError::IncompleteUpload {
                failed, missing, ..
            }) => failed
                .iter()
                .map(|f| f.part_number)
                .chain(missing.iter().copied())
                .collect(),
            UploadError::Aggregation(AggregationError::InconsistentPart { part_number, .. }) => {
                vec![*part_number]
            }
            UploadError::Finalize(FinalizeError::DigestMismatch { part_numbers, .. }) => {
                part_numbers.clone()
            }
            _ => Vec::new(),
        };
        numbers.sort_unstable();
        numbers.dedup();
        numbers
    }

    /// 服务端请求ID（若有）
    pub fn request_id(&self) -> Option<&str> {
        match self {
            UploadError::Planning(PlanningError::SourceUnavailable { request_id, .. }) => {
                request_id.as_deref()
            }
            UploadError::Session(e) => e.request_id(),
            UploadError::Aggregation(AggregationError::IncompleteUpload { failed, .. }) => {
                failed.iter().find_map(|f| f.error.request_id())
            }
            UploadError::Finalize(FinalizeError::DigestMismatch { request_id, .. }) => {
                request_id.as_deref()
            }
            UploadError::Finalize(FinalizeError::ServiceRejected { error }) => error.request_id(),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, UploadError::Aggregation(AggregationError::Cancelled { .. }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(status: u16, code: &str) -> TransportError {
        TransportError::Service(ServiceError {
            status,
            code: code.to_string(),
            message: "boom".to_string(),
            request_id: Some("REQ-9".to_string()),
        })
    }

    #[test]
    fn test_part_error_from_transport() {
        let error = PartTransferError::from(service(503, "ServiceUnavailable"));
        assert!(error.is_retriable());
        assert_eq!(error.request_id(), Some("REQ-9"));

        let error = PartTransferError::from(service(403, "AccessDenied"));
        assert!(!error.is_retriable());

        let error = PartTransferError::from(TransportError::Timeout("30s".into()));
        assert!(matches!(error, PartTransferError::Timeout { .. }));
        assert!(error.is_retriable());

        let error = PartTransferError::Source {
            message: "eof".into(),
        };
        assert!(!error.is_retriable());
    }

    #[test]
    fn test_upload_error_part_numbers() {
        let error = UploadError::from(AggregationError::IncompleteUpload {
            expected: 5,
            succeeded: 2,
            received: 4,
            failed: vec![
                FailedPart {
                    part_number: 4,
                    error: PartTransferError::from(service(500, "InternalError")),
                },
                FailedPart {
                    part_number: 2,
                    error: PartTransferError::Transport {
                        message: "reset".into(),
                    },
                },
            ],
            missing: vec![5],
            timed_out: true,
        });

        assert_eq!(error.phase(), FailedPhase::Aggregation);
        assert_eq!(error.part_numbers(), vec![2, 4, 5]);
        assert_eq!(error.request_id(), Some("REQ-9"));
        assert!(!error.is_cancelled());
        assert!(error.to_string().contains("等待超时 true"));
    }

    #[test]
    fn test_finalize_error_request_id() {
        let error = UploadError::from(FinalizeError::ServiceRejected {
            error: service(400, "InvalidPart"),
        });
        assert_eq!(error.phase(), FailedPhase::Finalize);
        assert_eq!(error.request_id(), Some("REQ-9"));
        assert!(error.part_numbers().is_empty());
    }

    #[test]
    fn test_cancelled() {
        let error = UploadError::from(AggregationError::Cancelled {
            expected: 3,
            received: 1,
        });
        assert!(error.is_cancelled());
        assert_eq!(error.phase().to_string(), "aggregation");
    }
}
