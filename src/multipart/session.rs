// 分段上传会话
//
// 一次分段上传对应一个会话：
// - open 时初始化分段上传，获取上传ID
// - dispatch_all 为每个分段启动一个任务，立即返回，不等待完成
// - Semaphore 限制同时传输的分段数，JoinSet 持有所有任务
// - 每个任务在会话层包装超时和指数退避重试
// - complete / abort / close 结束会话

use super::aggregator::CompletionManifest;
use super::error::{PartTransferError, SessionError};
use super::planner::PartDescriptor;
use super::task::{PartResult, PartTransferTask, SourceSpec};
use crate::transport::{
    CompleteOutput, CompleteRequest, ListPartsRequest, ObjectTarget, PartSummary, Transport,
    TransportError, TransportErrorKind,
};
use futures::FutureExt;
use serde::Serialize;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 列举分段时每页数量
const LIST_PAGE_SIZE: u32 = 1000;

// =====================================================
// 重试配置
// =====================================================

/// 默认最大重试次数
const DEFAULT_MAX_RETRIES: u32 = 3;

/// 初始退避延迟（毫秒）
const INITIAL_BACKOFF_MS: u64 = 100;

/// 最大退避延迟（毫秒）
const MAX_BACKOFF_MS: u64 = 5000;

/// 限流时的额外等待时间（毫秒）
const RATE_LIMIT_BACKOFF_MS: u64 = 10000;

/// 分段重试策略
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// 首次请求之外最多重试次数
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// 限流时至少等待
    pub rate_limit_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            initial_backoff: Duration::from_millis(INITIAL_BACKOFF_MS),
            max_backoff: Duration::from_millis(MAX_BACKOFF_MS),
            rate_limit_backoff: Duration::from_millis(RATE_LIMIT_BACKOFF_MS),
        }
    }
}

impl RetryPolicy {
    /// 不重试
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// 计算指数退避延迟
    ///
    /// # 延迟序列（默认配置）
    /// - retry=0: 100ms
    /// - retry=1: 200ms
    /// - retry=2: 400ms
    /// - 最大: 5000ms，限流时不少于 10000ms
    pub fn backoff_delay(&self, retry: u32, kind: TransportErrorKind) -> Duration {
        let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
        let delay = self
            .initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff);

        if kind == TransportErrorKind::RateLimited {
            delay.max(self.rate_limit_backoff)
        } else {
            delay
        }
    }
}

/// 会话选项
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// 同时传输的分段数，0 表示不限制
    pub max_concurrent_parts: usize,
    /// 单次分段请求超时
    pub part_timeout: Option<Duration>,
    pub retry: RetryPolicy,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            max_concurrent_parts: 8,
            part_timeout: None,
            retry: RetryPolicy::default(),
        }
    }
}

// =====================================================
// 会话
// =====================================================

/// 会话标识，分段任务只读共享
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSessionHandle {
    pub upload_id: String,
    pub target: ObjectTarget,
}

/// 服务端已记录的分段
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommittedPart {
    pub part_number: u32,
    pub integrity_token: String,
    pub size: u64,
    pub last_modified: Option<String>,
}

impl From<PartSummary> for CommittedPart {
    fn from(part: PartSummary) -> Self {
        Self {
            part_number: part.part_number,
            integrity_token: part.etag,
            size: part.size,
            last_modified: part.last_modified,
        }
    }
}

/// 分段上传会话
pub struct UploadSession {
    transport: Arc<dyn Transport>,
    handle: Arc<UploadSessionHandle>,
    /// 分段并发控制
    limiter: Arc<Semaphore>,
    options: SessionOptions,
    /// 会话级取消令牌，所有分段任务使用其子令牌
    cancel: CancellationToken,
    /// 已成功合并
    completed: bool,
}

impl UploadSession {
    /// 初始化分段上传
    pub async fn open(
        transport: Arc<dyn Transport>,
        target: ObjectTarget,
        options: SessionOptions,
    ) -> Result<Self, SessionError> {
        let output = transport
            .initiate_multipart_upload(&target)
            .await
            .map_err(|error| {
                error!("初始化分段上传失败: target={}, 错误: {}", target, error);
                SessionError::ServiceRejected { error }
            })?;

        info!(
            "分段上传会话已创建: target={}, upload_id={}",
            target, output.upload_id
        );

        let permits = match options.max_concurrent_parts {
            0 => Semaphore::MAX_PERMITS,
            n => n,
        };

        Ok(Self {
            transport,
            handle: Arc::new(UploadSessionHandle {
                upload_id: output.upload_id,
                target,
            }),
            limiter: Arc::new(Semaphore::new(permits)),
            options,
            cancel: CancellationToken::new(),
            completed: false,
        })
    }

    pub fn handle(&self) -> &Arc<UploadSessionHandle> {
        &self.handle
    }

    pub fn upload_id(&self) -> &str {
        &self.handle.upload_id
    }

    pub fn target(&self) -> &ObjectTarget {
        &self.handle.target
    }

    /// 为每个分段启动传输任务
    ///
    /// 按分段号升序启动，立即返回；同时运行的任务数受并发上限约束
    pub fn dispatch_all(&self, descriptors: &[PartDescriptor], source: &SourceSpec) -> PendingParts {
        let cancel = self.cancel.child_token();
        let mut pending = PendingParts::new(cancel);

        if self.completed {
            warn!(
                "会话已合并，忽略分段调度: upload_id={}",
                self.handle.upload_id
            );
            return pending;
        }

        let mut sorted: Vec<&PartDescriptor> = descriptors.iter().collect();
        sorted.sort_by_key(|d| d.part_number);

        for descriptor in sorted {
            self.spawn_part(&mut pending, *descriptor, source.clone());
        }

        debug!(
            "已调度 {} 个分段 ({}), upload_id={}",
            pending.len(),
            source.mode(),
            self.handle.upload_id
        );

        pending
    }

    /// 重新调度单个分段（覆盖服务端已有的同号分段）
    pub fn dispatch_one(&self, descriptor: PartDescriptor, source: &SourceSpec) -> PendingParts {
        self.dispatch_all(std::slice::from_ref(&descriptor), source)
    }

    fn spawn_part(&self, pending: &mut PendingParts, descriptor: PartDescriptor, source: SourceSpec) {
        let task = PartTransferTask::new(descriptor, self.handle.clone(), source);
        let transport = self.transport.clone();
        let limiter = self.limiter.clone();
        let retry = self.options.retry.clone();
        let part_timeout = self.options.part_timeout;
        let cancel = pending.cancel.clone();

        pending.part_numbers.push(descriptor.part_number);
        pending.join_set.spawn(run_part(
            task,
            transport,
            limiter,
            retry,
            part_timeout,
            cancel,
        ));
    }

    /// 列举服务端已记录的全部分段（按分段号升序）
    pub async fn list_committed(&self) -> Result<Vec<CommittedPart>, TransportError> {
        let mut parts = Vec::new();
        let mut marker = None;

        loop {
            let page = self
                .transport
                .list_parts(ListPartsRequest {
                    target: self.handle.target.clone(),
                    upload_id: self.handle.upload_id.clone(),
                    max_parts: Some(LIST_PAGE_SIZE),
                    part_number_marker: marker,
                })
                .await?;

            parts.extend(page.parts.into_iter().map(CommittedPart::from));

            if !page.is_truncated {
                break;
            }
            match page.next_part_number_marker {
                Some(next) if Some(next) != marker => marker = Some(next),
                _ => {
                    warn!(
                        "列举分段分页标记无效，停止列举: upload_id={}, marker={:?}",
                        self.handle.upload_id, marker
                    );
                    break;
                }
            }
        }

        parts.sort_by_key(|p| p.part_number);
        Ok(parts)
    }

    /// 合并分段
    ///
    /// 成功后会话失效，不能再调度分段
    pub async fn complete(
        &mut self,
        manifest: &CompletionManifest,
    ) -> Result<CompleteOutput, TransportError> {
        info!(
            "合并分段: target={}, upload_id={}, 分段数={}",
            self.handle.target,
            self.handle.upload_id,
            manifest.len()
        );

        let output = self
            .transport
            .complete_multipart_upload(CompleteRequest {
                target: self.handle.target.clone(),
                upload_id: self.handle.upload_id.clone(),
                parts: manifest.to_pairs(),
            })
            .await?;

        self.completed = true;
        self.cancel.cancel();
        info!("✓ 合并完成: target={}, etag={}", output.target, output.etag);
        Ok(output)
    }

    /// 取消分段上传（服务端丢弃已上传的分段）
    pub async fn abort(self) -> Result<(), TransportError> {
        self.cancel.cancel();
        if self.completed {
            return Ok(());
        }

        warn!(
            "取消分段上传: target={}, upload_id={}",
            self.handle.target, self.handle.upload_id
        );
        self.transport
            .abort_multipart_upload(&self.handle.target, &self.handle.upload_id)
            .await
    }

    /// 释放本地资源，不通知服务端
    pub fn close(self) {
        self.cancel.cancel();
        if !self.completed {
            warn!(
                "会话关闭时分段上传既未合并也未取消，服务端将保留已上传分段: upload_id={}",
                self.handle.upload_id
            );
        }
    }
}

// =====================================================
// 在途分段
// =====================================================

/// 已调度、尚未汇总的分段任务
pub struct PendingParts {
    join_set: JoinSet<PartResult>,
    part_numbers: Vec<u32>,
    cancel: CancellationToken,
}

impl PendingParts {
    fn new(cancel: CancellationToken) -> Self {
        Self {
            join_set: JoinSet::new(),
            part_numbers: Vec::new(),
            cancel,
        }
    }

    /// 调度的分段数
    pub fn len(&self) -> usize {
        self.part_numbers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.part_numbers.is_empty()
    }

    /// 调度的分段号（升序）
    pub fn part_numbers(&self) -> &[u32] {
        &self.part_numbers
    }

    /// 等待下一个完成的分段
    pub async fn join_next(&mut self) -> Option<Result<PartResult, JoinError>> {
        self.join_set.join_next().await
    }

    /// 取消所有未完成的分段
    pub fn cancel(&mut self) {
        self.cancel.cancel();
        self.join_set.abort_all();
    }

    /// 等待全部分段完成（按完成顺序）
    pub async fn join_all(mut self) -> Vec<PartResult> {
        let mut results = Vec::with_capacity(self.len());
        while let Some(joined) = self.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => warn!("分段任务异常退出: {}", e),
            }
        }
        results
    }
}

// =====================================================
// 分段任务执行
// =====================================================

fn aborted(part_number: u32, message: impl Into<String>) -> PartResult {
    PartResult::failure(
        part_number,
        PartTransferError::Aborted {
            message: message.into(),
        },
    )
}

/// 单个分段任务：获取许可 → 带超时和重试执行
///
/// 任务内 panic 会转换为该分段的失败结果
async fn run_part(
    task: PartTransferTask,
    transport: Arc<dyn Transport>,
    limiter: Arc<Semaphore>,
    retry: RetryPolicy,
    part_timeout: Option<Duration>,
    cancel: CancellationToken,
) -> PartResult {
    let part_number = task.part_number();

    let work = async move {
        let _permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return aborted(part_number, "上传已取消"),
            permit = limiter.acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return aborted(part_number, "并发控制已关闭"),
            },
        };

        execute_with_retry(&task, transport.as_ref(), &retry, part_timeout, &cancel).await
    };

    match AssertUnwindSafe(work).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!("[分段#{}] 任务异常退出: {}", part_number, message);
            aborted(part_number, format!("任务异常退出: {}", message))
        }
    }
}

async fn execute_with_retry(
    task: &PartTransferTask,
    transport: &dyn Transport,
    retry: &RetryPolicy,
    part_timeout: Option<Duration>,
    cancel: &CancellationToken,
) -> PartResult {
    let part_number = task.part_number();
    let mut attempts = 0u32;

    loop {
        attempts += 1;

        let result = match part_timeout {
            Some(limit) => match tokio::time::timeout(limit, task.execute(transport)).await {
                Ok(result) => result,
                Err(_) => PartResult::failure(
                    part_number,
                    PartTransferError::Timeout {
                        message: format!("分段请求超过 {:?}", limit),
                    },
                ),
            },
            None => task.execute(transport).await,
        };

        let Some(error) = result.error() else {
            return result.with_attempts(attempts);
        };

        // 不可重试的错误立即失败
        if !error.is_retriable() {
            error!(
                "[分段#{}] 传输失败（不可重试）: {:?}, 错误: {}",
                part_number,
                error.kind(),
                error
            );
            return result.with_attempts(attempts);
        }

        let retries_done = attempts - 1;
        if retries_done >= retry.max_retries {
            error!(
                "[分段#{}] 传输失败，已达最大重试次数 ({}): {}",
                part_number, retry.max_retries, error
            );
            return result.with_attempts(attempts);
        }

        let delay = retry.backoff_delay(retries_done, error.kind());
        warn!(
            "[分段#{}] 传输失败，等待 {}ms 后重试 ({}/{}): {}",
            part_number,
            delay.as_millis(),
            retries_done + 1,
            retry.max_retries,
            error
        );

        tokio::select! {
            _ = cancel.cancelled() => return result.with_attempts(attempts),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::multipart::planner::plan;
    use crate::transport::{MemoryTransport, PartFault};
    use bytes::Bytes;

    fn fast_retry(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            rate_limit_backoff: Duration::from_millis(5),
        }
    }

    async fn open(transport: &MemoryTransport, options: SessionOptions) -> UploadSession {
        transport.create_bucket("bucket");
        UploadSession::open(
            Arc::new(transport.clone()),
            ObjectTarget::new("bucket", "object"),
            options,
        )
        .await
        .unwrap()
    }

    #[test]
    fn test_backoff_delay() {
        let policy = RetryPolicy::default();
        let ms = |retry, kind| policy.backoff_delay(retry, kind).as_millis();
        assert_eq!(ms(0, TransportErrorKind::Network), 100);
        assert_eq!(ms(1, TransportErrorKind::Network), 200);
        assert_eq!(ms(2, TransportErrorKind::Network), 400);
        assert_eq!(ms(3, TransportErrorKind::Network), 800);
        assert_eq!(ms(10, TransportErrorKind::Network), 5000); // 超过最大值
        assert_eq!(ms(40, TransportErrorKind::Network), 5000);
        assert_eq!(ms(0, TransportErrorKind::RateLimited), 10000);
    }

    #[tokio::test]
    async fn test_open_failure() {
        let transport = MemoryTransport::new();
        transport.fail_initiate(403, "AccessDenied");

        let result = UploadSession::open(
            Arc::new(transport.clone()),
            ObjectTarget::new("bucket", "object"),
            SessionOptions::default(),
        )
        .await;
        let err = result.err().unwrap();
        assert!(matches!(err, SessionError::ServiceRejected { .. }));
        assert!(err.request_id().is_some());
    }

    #[tokio::test]
    async fn test_dispatch_all_runs_every_part() {
        let transport = MemoryTransport::new();
        let session = open(&transport, SessionOptions::default()).await;
        let descriptors = plan(10, 3, 100).unwrap();
        let source = SourceSpec::from_bytes(Bytes::from_static(b"0123456789"));

        let pending = session.dispatch_all(&descriptors, &source);
        assert_eq!(pending.part_numbers(), &[1, 2, 3, 4]);

        let mut results = pending.join_all().await;
        results.sort_by_key(|r| r.part_number);
        assert_eq!(results.len(), 4);
        assert!(results.iter().all(|r| r.is_success() && r.attempts == 1));
        assert_eq!(
            transport.uploaded_parts(session.upload_id()),
            vec![1, 2, 3, 4]
        );
        session.close();
    }

    #[tokio::test]
    async fn test_dispatch_one_overwrites_single_part() {
        let transport = MemoryTransport::new();
        let session = open(&transport, SessionOptions::default()).await;
        let descriptors = plan(9, 3, 100).unwrap();

        let original = SourceSpec::from_bytes(Bytes::from_static(b"abcdefghi"));
        let results = session.dispatch_all(&descriptors, &original).join_all().await;
        assert!(results.iter().all(|r| r.is_success()));
        let before = session.list_committed().await.unwrap();

        // 只重传分段 2，内容不同
        let changed = SourceSpec::from_bytes(Bytes::from_static(b"abcXYZghi"));
        let results = session.dispatch_one(descriptors[1], &changed).join_all().await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].part_number, 2);
        assert!(results[0].is_success());

        let after = session.list_committed().await.unwrap();
        assert_eq!(after.len(), 3);
        assert_eq!(after[0].integrity_token, before[0].integrity_token);
        assert_ne!(after[1].integrity_token, before[1].integrity_token);
        assert_eq!(after[1].integrity_token, results[0].integrity_token().unwrap());
        assert_eq!(after[1].size, 3);
        assert_eq!(after[2].integrity_token, before[2].integrity_token);
        session.close();
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let transport = MemoryTransport::new();
        for n in 1..=6 {
            transport.delay_part(n, Duration::from_millis(20));
        }
        let options = SessionOptions {
            max_concurrent_parts: 2,
            ..SessionOptions::default()
        };
        let session = open(&transport, options).await;
        let descriptors = plan(6, 1, 100).unwrap();
        let source = SourceSpec::from_bytes(Bytes::from_static(b"abcdef"));

        let results = session.dispatch_all(&descriptors, &source).join_all().await;
        assert_eq!(results.len(), 6);
        assert!(transport.peak_in_flight() <= 2);
        assert!(transport.peak_in_flight() >= 1);
    }

    #[tokio::test]
    async fn test_retriable_error_is_retried() {
        let transport = MemoryTransport::new();
        transport.fail_part(
            2,
            PartFault::Status {
                status: 503,
                code: "ServiceUnavailable".into(),
            },
            2,
        );
        let options = SessionOptions {
            retry: fast_retry(3),
            ..SessionOptions::default()
        };
        let session = open(&transport, options).await;
        let descriptors = plan(4, 2, 100).unwrap();
        let source = SourceSpec::from_bytes(Bytes::from_static(b"abcd"));

        let results = session.dispatch_all(&descriptors, &source).join_all().await;
        let part2 = results.iter().find(|r| r.part_number == 2).unwrap();
        assert!(part2.is_success());
        assert_eq!(part2.attempts, 3);
    }

    #[tokio::test]
    async fn test_non_retriable_error_fails_once() {
        let transport = MemoryTransport::new();
        transport.fail_part_always(
            1,
            PartFault::Status {
                status: 403,
                code: "AccessDenied".into(),
            },
        );
        let options = SessionOptions {
            retry: fast_retry(3),
            ..SessionOptions::default()
        };
        let session = open(&transport, options).await;
        let descriptors = plan(2, 2, 100).unwrap();
        let source = SourceSpec::from_bytes(Bytes::from_static(b"ab"));

        let results = session.dispatch_all(&descriptors, &source).join_all().await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].attempts, 1);
        assert!(matches!(
            results[0].error(),
            Some(PartTransferError::ServiceStatus { status: 403, .. })
        ));
        assert_eq!(transport.upload_part_calls(), 1);
    }

    #[tokio::test]
    async fn test_part_timeout() {
        let transport = MemoryTransport::new();
        transport.delay_part(1, Duration::from_secs(5));
        let options = SessionOptions {
            part_timeout: Some(Duration::from_millis(20)),
            retry: RetryPolicy::none(),
            ..SessionOptions::default()
        };
        let session = open(&transport, options).await;
        let descriptors = plan(1, 1, 100).unwrap();
        let source = SourceSpec::from_bytes(Bytes::from_static(b"a"));

        let results = session.dispatch_all(&descriptors, &source).join_all().await;
        assert!(matches!(
            results[0].error(),
            Some(PartTransferError::Timeout { .. })
        ));
    }

    #[tokio::test]
    async fn test_list_committed_pages() {
        let transport = MemoryTransport::new();
        let session = open(&transport, SessionOptions::default()).await;
        let data = Bytes::from(vec![7u8; 2500]);
        let descriptors = plan(2500, 1, 10_000).unwrap();
        let results = session
            .dispatch_all(&descriptors, &SourceSpec::from_bytes(data))
            .join_all()
            .await;
        assert_eq!(results.len(), 2500);

        let committed = session.list_committed().await.unwrap();
        assert_eq!(committed.len(), 2500);
        assert_eq!(committed[0].part_number, 1);
        assert_eq!(committed[2499].part_number, 2500);
        assert_eq!(transport.list_parts_calls(), 3);
    }

    #[tokio::test]
    async fn test_abort_discards_upload() {
        let transport = MemoryTransport::new();
        let session = open(&transport, SessionOptions::default()).await;
        let upload_id = session.upload_id().to_string();
        assert_eq!(transport.pending_uploads(), vec![upload_id]);

        session.abort().await.unwrap();
        assert!(transport.pending_uploads().is_empty());
        assert_eq!(transport.abort_calls(), 1);
    }

    #[tokio::test]
    async fn test_cancel_pending_parts() {
        let transport = MemoryTransport::new();
        transport.delay_part(1, Duration::from_secs(10));
        let session = open(&transport, SessionOptions::default()).await;
        let descriptors = plan(1, 1, 100).unwrap();

        let mut pending =
            session.dispatch_all(&descriptors, &SourceSpec::from_bytes(Bytes::from_static(b"a")));
        pending.cancel();
        let results = pending.join_all().await;
        assert!(results.iter().all(|r| !r.is_success()));
    }
}
