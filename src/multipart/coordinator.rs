// 分段上传协调器
//
// 单次分段上传 / 拷贝的完整流程：
// 1. 规划：确定源大小和分段大小，切分分段
// 2. 初始化分段上传，获取上传ID
// 3. 一次性调度所有分段（并发数受限）
// 4. 在唯一的等待点汇总全部结果
// 5. （可选）列举服务端分段核对清单
// 6. 合并分段；任何一步失败都取消服务端的分段上传
//
// 阶段：
// Planning → SessionOpen → Dispatching → Awaiting → Finalizing → Done
//                                          └──────────┴→ Aborting → Aborted
// Planning / SessionOpen 失败直接进入 Failed

use super::aggregator::{CompletionAggregator, CompletionManifest, FailurePolicy, WaitOptions};
use super::error::{AggregationError, FinalizeError, PlanningError, UploadError};
use super::planner::{
    plan, resolve_part_size, DEFAULT_PART_SIZE, MAX_PART_COUNT, MAX_PART_SIZE, MIN_PART_SIZE,
};
use super::progress::ProgressCallback;
use super::session::{RetryPolicy, SessionOptions, UploadSession};
use super::task::SourceSpec;
use crate::config::UploadConfig;
use crate::transport::{normalize_etag, ObjectTarget, Transport, TransportError};
use anyhow::Context;
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 合并时表示分段与 ETag 对不上的服务端错误码
const DIGEST_ERROR_CODES: &[&str] = &["InvalidPart", "InvalidPartOrder", "BadDigest", "InvalidDigest"];

// =====================================================
// 阶段
// =====================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadPhase {
    Planning,
    SessionOpen,
    Dispatching,
    Awaiting,
    Finalizing,
    Done,
    Aborting,
    Aborted,
    /// 规划或初始化失败（服务端没有需要清理的分段上传）
    Failed,
}

impl UploadPhase {
    pub fn can_transition_to(&self, next: UploadPhase) -> bool {
        use UploadPhase::*;
        matches!(
            (self, next),
            (Planning, SessionOpen)
                | (Planning, Failed)
                | (SessionOpen, Dispatching)
                | (SessionOpen, Failed)
                | (Dispatching, Awaiting)
                | (Awaiting, Finalizing)
                | (Awaiting, Aborting)
                | (Finalizing, Done)
                | (Finalizing, Aborting)
                | (Aborting, Aborted)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UploadPhase::Done | UploadPhase::Aborted | UploadPhase::Failed
        )
    }
}

impl fmt::Display for UploadPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UploadPhase::Planning => "planning",
            UploadPhase::SessionOpen => "session_open",
            UploadPhase::Dispatching => "dispatching",
            UploadPhase::Awaiting => "awaiting",
            UploadPhase::Finalizing => "finalizing",
            UploadPhase::Done => "done",
            UploadPhase::Aborting => "aborting",
            UploadPhase::Aborted => "aborted",
            UploadPhase::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// 记录阶段转换，同时写入协调器的阶段历史
struct PhaseTracker<'a> {
    target: String,
    current: UploadPhase,
    history: &'a Mutex<Vec<UploadPhase>>,
}

impl<'a> PhaseTracker<'a> {
    fn start(target: &ObjectTarget, history: &'a Mutex<Vec<UploadPhase>>) -> Self {
        {
            let mut history = history.lock();
            history.clear();
            history.push(UploadPhase::Planning);
        }
        debug!("[{}] 阶段: {}", target, UploadPhase::Planning);
        Self {
            target: target.to_string(),
            current: UploadPhase::Planning,
            history,
        }
    }

    fn advance(&mut self, next: UploadPhase) {
        debug_assert!(
            self.current.can_transition_to(next),
            "illegal phase transition {} -> {}",
            self.current,
            next
        );
        if !self.current.can_transition_to(next) {
            error!(
                "[{}] 非法阶段转换: {} -> {}",
                self.target, self.current, next
            );
        }
        info!("[{}] 阶段: {} -> {}", self.target, self.current, next);
        self.current = next;
        self.history.lock().push(next);
    }
}

// =====================================================
// 选项与结果
// =====================================================

/// 协调器选项
#[derive(Debug, Clone)]
pub struct UploadOptions {
    /// 未指定时使用的分段大小
    pub part_size: u64,
    /// 分段大小下限
    pub min_part_size: u64,
    /// 分段大小上限
    pub max_part_size: u64,
    pub max_parts: u32,
    /// 同时传输的分段数，0 表示不限制
    pub max_concurrent_parts: usize,
    pub part_timeout: Option<Duration>,
    /// 等待全部分段的总超时
    pub wait_timeout: Option<Duration>,
    pub retry: RetryPolicy,
    pub failure_policy: FailurePolicy,
    /// 合并前列举服务端分段核对清单
    pub verify_committed_parts: bool,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            part_size: DEFAULT_PART_SIZE,
            min_part_size: MIN_PART_SIZE,
            max_part_size: MAX_PART_SIZE,
            max_parts: MAX_PART_COUNT,
            max_concurrent_parts: 8,
            part_timeout: None,
            wait_timeout: None,
            retry: RetryPolicy::default(),
            failure_policy: FailurePolicy::CollectAll,
            verify_committed_parts: true,
        }
    }
}

impl From<&UploadConfig> for UploadOptions {
    fn from(config: &UploadConfig) -> Self {
        let secs = |s: u64| (s > 0).then(|| Duration::from_secs(s));
        Self {
            part_size: config.part_size_bytes(),
            max_parts: config.max_parts.min(MAX_PART_COUNT),
            max_concurrent_parts: config.max_concurrent_parts,
            part_timeout: secs(config.part_timeout_secs),
            wait_timeout: secs(config.wait_timeout_secs),
            retry: RetryPolicy {
                max_retries: config.max_part_retries,
                ..RetryPolicy::default()
            },
            failure_policy: config.failure_policy,
            verify_committed_parts: config.verify_committed_parts,
            ..Self::default()
        }
    }
}

impl UploadOptions {
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            max_concurrent_parts: self.max_concurrent_parts,
            part_timeout: self.part_timeout,
            retry: self.retry.clone(),
        }
    }
}

/// 分段上传成功的结果
#[derive(Debug, Clone, Serialize)]
pub struct CompletedUpload {
    pub target: ObjectTarget,
    pub upload_id: String,
    /// 服务端返回的整个对象的 ETag
    pub etag: String,
    pub object_size: u64,
    pub part_size: u64,
    pub manifest: CompletionManifest,
}

// =====================================================
// 协调器
// =====================================================

pub struct UploadCoordinator {
    transport: Arc<dyn Transport>,
    options: UploadOptions,
    progress: Option<ProgressCallback>,
    cancel: CancellationToken,
    last_phases: Mutex<Vec<UploadPhase>>,
}

impl UploadCoordinator {
    pub fn new(transport: Arc<dyn Transport>, options: UploadOptions) -> Self {
        Self {
            transport,
            options,
            progress: None,
            cancel: CancellationToken::new(),
            last_phases: Mutex::new(Vec::new()),
        }
    }

    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn options(&self) -> &UploadOptions {
        &self.options
    }

    /// 取消令牌，取消后正在等待的上传会中止并取消服务端分段上传
    ///
    /// 令牌不会重置，取消后的协调器不再发起新的上传
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// 最近一次上传经历的阶段
    pub fn phase_history(&self) -> Vec<UploadPhase> {
        self.last_phases.lock().clone()
    }

    /// 分段上传（或拷贝）一个对象
    ///
    /// # 参数
    /// * `target` - 目标对象
    /// * `source` - 本地字节或服务端已有对象
    /// * `part_size_hint` - 分段大小，None 使用选项中的默认值，超出允许范围时自动调整
    pub async fn upload_multipart(
        &self,
        target: &ObjectTarget,
        source: SourceSpec,
        part_size_hint: Option<u64>,
    ) -> Result<CompletedUpload, UploadError> {
        let mut phases = PhaseTracker::start(target, &self.last_phases);

        // 已取消时不发起任何请求
        if self.cancel.is_cancelled() {
            warn!("[{}] 协调器已取消，跳过上传", target);
            phases.advance(UploadPhase::Failed);
            return Err(AggregationError::Cancelled {
                expected: 0,
                received: 0,
            }
            .into());
        }

        // 1. 规划
        let (object_size, part_size, descriptors) =
            match self.plan_parts(&source, part_size_hint).await {
                Ok(planned) => planned,
                Err(e) => {
                    error!("[{}] 规划失败: {}", target, e);
                    phases.advance(UploadPhase::Failed);
                    return Err(e.into());
                }
            };

        info!(
            "开始分段{}: target={}, size={}, part_size={}, parts={}",
            source.mode(),
            target,
            object_size,
            part_size,
            descriptors.len()
        );

        // 2. 初始化分段上传
        phases.advance(UploadPhase::SessionOpen);
        let mut session = match UploadSession::open(
            self.transport.clone(),
            target.clone(),
            self.options.session_options(),
        )
        .await
        {
            Ok(session) => session,
            Err(e) => {
                phases.advance(UploadPhase::Failed);
                return Err(e.into());
            }
        };

        // 3. 调度全部分段
        phases.advance(UploadPhase::Dispatching);
        let pending = session.dispatch_all(&descriptors, &source);

        // 4. 汇总
        phases.advance(UploadPhase::Awaiting);
        let mut aggregator = CompletionAggregator::new(descriptors.iter().map(|d| d.part_number));
        if let Some(progress) = &self.progress {
            aggregator = aggregator.with_progress(progress.clone());
        }
        let wait_options = WaitOptions {
            timeout: self.options.wait_timeout,
            cancel: Some(self.cancel.clone()),
            failure_policy: self.options.failure_policy,
        };

        let manifest = match aggregator.collect(pending, &wait_options).await {
            Ok(manifest) => manifest,
            Err(e) => {
                error!("[{}] 分段汇总失败: {}", target, e);
                Self::abort_session(session, &mut phases).await;
                return Err(e.into());
            }
        };

        // 5. 核对服务端分段
        if self.options.verify_committed_parts {
            if let Err(e) = Self::verify_committed(&session, &manifest).await {
                error!("[{}] 分段核对失败: {}", target, e);
                Self::abort_session(session, &mut phases).await;
                return Err(e.into());
            }
        }

        // 6. 合并
        phases.advance(UploadPhase::Finalizing);
        let output = match session.complete(&manifest).await {
            Ok(output) => output,
            Err(error) => {
                let e = classify_finalize_error(error);
                error!("[{}] 合并失败: {}", target, e);
                Self::abort_session(session, &mut phases).await;
                return Err(e.into());
            }
        };

        let upload_id = session.upload_id().to_string();
        session.close();
        phases.advance(UploadPhase::Done);

        Ok(CompletedUpload {
            target: output.target,
            upload_id,
            etag: output.etag,
            object_size,
            part_size,
            manifest,
        })
    }

    /// 阻塞版本，内部创建独立的多线程运行时
    ///
    /// 不能在 tokio 运行时内调用
    pub fn upload_multipart_blocking(
        &self,
        target: &ObjectTarget,
        source: SourceSpec,
        part_size_hint: Option<u64>,
    ) -> anyhow::Result<CompletedUpload> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .context("创建运行时失败")?;

        let completed = runtime.block_on(self.upload_multipart(target, source, part_size_hint))?;
        Ok(completed)
    }

    async fn plan_parts(
        &self,
        source: &SourceSpec,
        part_size_hint: Option<u64>,
    ) -> Result<(u64, u64, Vec<super::planner::PartDescriptor>), PlanningError> {
        let object_size = match source {
            SourceSpec::Bytes(bytes) => bytes.len(),
            SourceSpec::RemoteCopy(source_object) => self
                .transport
                .head_object(source_object)
                .await
                .map(|meta| meta.content_length)
                .map_err(|e| PlanningError::SourceUnavailable {
                    reason: format!("{}: {}", source_object, e),
                    request_id: e.request_id().map(str::to_string),
                })?,
        };

        let part_size = resolve_part_size(
            part_size_hint.unwrap_or(self.options.part_size),
            self.options.min_part_size,
            self.options.max_part_size,
        );
        let descriptors = plan(object_size, part_size, self.options.max_parts)?;

        Ok((object_size, part_size, descriptors))
    }

    /// 列举服务端分段，与清单逐一比对 ETag
    async fn verify_committed(
        session: &UploadSession,
        manifest: &CompletionManifest,
    ) -> Result<(), FinalizeError> {
        let committed = session
            .list_committed()
            .await
            .map_err(|error| FinalizeError::ServiceRejected { error })?;

        let mismatched: Vec<u32> = manifest
            .parts()
            .iter()
            .filter(|part| {
                committed
                    .binary_search_by_key(&part.part_number, |c| c.part_number)
                    .map(|i| {
                        normalize_etag(&committed[i].integrity_token)
                            != normalize_etag(&part.integrity_token)
                    })
                    .unwrap_or(true)
            })
            .map(|part| part.part_number)
            .collect();

        if !mismatched.is_empty() {
            return Err(FinalizeError::DigestMismatch {
                reason: format!("{} 个分段与服务端记录不一致", mismatched.len()),
                part_numbers: mismatched,
                request_id: None,
            });
        }

        if committed.len() > manifest.len() {
            debug!(
                "服务端记录了清单之外的分段 {} 个，合并时将被忽略",
                committed.len() - manifest.len()
            );
        }
        Ok(())
    }

    /// 尽力取消服务端分段上传
    async fn abort_session(session: UploadSession, phases: &mut PhaseTracker<'_>) {
        phases.advance(UploadPhase::Aborting);
        let upload_id = session.upload_id().to_string();
        if let Err(e) = session.abort().await {
            warn!("取消分段上传失败（忽略）: upload_id={}, 错误: {}", upload_id, e);
        }
        phases.advance(UploadPhase::Aborted);
    }
}

fn classify_finalize_error(error: TransportError) -> FinalizeError {
    match &error {
        TransportError::Service(e) if DIGEST_ERROR_CODES.contains(&e.code.as_str()) => {
            FinalizeError::DigestMismatch {
                reason: format!("{}: {}", e.code, e.message),
                part_numbers: Vec::new(),
                request_id: e.request_id.clone(),
            }
        }
        _ => FinalizeError::ServiceRejected { error },
    }
}
