// 分段结果汇总
//
// 所有分段任务的结果在这里汇合：
// - record 写入并发 Map，同一分段号互斥插入
// - wait 是唯一的等待点，直到全部完成、超时或取消
// - finish 校验成功数等于规划数，按分段号数值升序生成合并清单

use super::error::{AggregationError, FailedPart, PartTransferError};
use super::progress::{PartProgress, ProgressCallback};
use super::session::PendingParts;
use super::task::{PartOutcome, PartResult};
use crate::transport::normalize_etag;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// =====================================================
// 合并清单
// =====================================================

/// 已完成的分段
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedPart {
    pub part_number: u32,
    /// 服务端返回的 ETag
    pub integrity_token: String,
}

/// 合并清单（按分段号数值升序，每个分段恰好一条）
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionManifest {
    parts: Vec<CompletedPart>,
}

impl CompletionManifest {
    pub fn from_parts(mut parts: Vec<CompletedPart>) -> Self {
        parts.sort_by_key(|p| p.part_number);
        parts.dedup_by_key(|p| p.part_number);
        Self { parts }
    }

    pub fn parts(&self) -> &[CompletedPart] {
        &self.parts
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    pub fn part_numbers(&self) -> Vec<u32> {
        self.parts.iter().map(|p| p.part_number).collect()
    }

    /// 合并请求使用的 (分段号, ETag) 列表
    pub fn to_pairs(&self) -> Vec<(u32, String)> {
        self.parts
            .iter()
            .map(|p| (p.part_number, p.integrity_token.clone()))
            .collect()
    }

    pub fn token(&self, part_number: u32) -> Option<&str> {
        self.parts
            .binary_search_by_key(&part_number, |p| p.part_number)
            .ok()
            .map(|i| self.parts[i].integrity_token.as_str())
    }
}

// =====================================================
// 等待选项
// =====================================================

/// 分段失败时的处理策略
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// 等待所有分段结束后统一报告
    #[default]
    CollectAll,
    /// 第一个分段失败即停止等待并取消其余分段
    AbortOnFirstFailure,
}

#[derive(Debug, Clone, Default)]
pub struct WaitOptions {
    /// 等待全部分段的总超时
    pub timeout: Option<Duration>,
    /// 调用方取消
    pub cancel: Option<CancellationToken>,
    pub failure_policy: FailurePolicy,
}

/// 等待结束的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// 所有分段都已返回结果
    Completed,
    TimedOut,
    /// 按 AbortOnFirstFailure 提前结束
    FailedFast,
}

// =====================================================
// 汇总器
// =====================================================

pub struct CompletionAggregator {
    /// 规划的分段号（升序）
    expected: Vec<u32>,
    tokens: DashMap<u32, String>,
    failures: DashMap<u32, PartTransferError>,
    /// 已记录的结果数（含重复）
    recorded: AtomicUsize,
    timed_out: AtomicBool,
    progress: Option<ProgressCallback>,
}

impl CompletionAggregator {
    pub fn new(expected: impl IntoIterator<Item = u32>) -> Self {
        let mut expected: Vec<u32> = expected.into_iter().collect();
        expected.sort_unstable();
        expected.dedup();
        Self {
            expected,
            tokens: DashMap::new(),
            failures: DashMap::new(),
            recorded: AtomicUsize::new(0),
            timed_out: AtomicBool::new(false),
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn expected(&self) -> usize {
        self.expected.len()
    }

    pub fn succeeded(&self) -> usize {
        self.tokens.len()
    }

    /// 收到结果的分段数（按分段号去重）
    pub fn received(&self) -> usize {
        self.tokens.len() + self.failures.len()
    }

    /// 记录一个分段结果
    ///
    /// - 同一分段号两次成功但 ETag 不同：InconsistentPart
    /// - 成功会覆盖之前记录的失败，已成功的分段忽略之后的失败
    pub fn record(&self, result: PartResult) -> Result<(), AggregationError> {
        let part_number = result.part_number;
        if self.expected.binary_search(&part_number).is_err() {
            warn!("收到未规划的分段结果，忽略: part={}", part_number);
            return Ok(());
        }

        let notify = self.progress.as_ref().map(|progress| (progress, result.clone()));

        match result.outcome {
            PartOutcome::Success { integrity_token } => {
                match self.tokens.entry(part_number) {
                    Entry::Occupied(existing) => {
                        if normalize_etag(existing.get()) != normalize_etag(&integrity_token) {
                            error!(
                                "[分段#{}] 结果不一致: {} != {}",
                                part_number,
                                existing.get(),
                                integrity_token
                            );
                            return Err(AggregationError::InconsistentPart {
                                part_number,
                                existing: existing.get().clone(),
                                conflicting: integrity_token,
                            });
                        }
                        debug!("[分段#{}] 重复的成功结果，忽略", part_number);
                    }
                    Entry::Vacant(slot) => {
                        slot.insert(integrity_token);
                        self.failures.remove(&part_number);
                    }
                }
            }
            PartOutcome::Failure(error) => {
                if self.tokens.contains_key(&part_number) {
                    debug!("[分段#{}] 已成功，忽略之后的失败: {}", part_number, error);
                } else {
                    self.failures.insert(part_number, error);
                }
            }
        }

        // 只上报已被接受的结果
        let recorded = self.recorded.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((progress, result)) = notify {
            progress(&PartProgress::new(&result, recorded, self.expected.len()));
        }

        Ok(())
    }

    /// 等待所有已调度分段返回结果
    ///
    /// 超时、取消或按策略提前结束时，中止其余在途分段
    pub async fn wait(
        &self,
        mut pending: PendingParts,
        options: &WaitOptions,
    ) -> Result<WaitOutcome, AggregationError> {
        let deadline = options.timeout.map(|timeout| Instant::now() + timeout);
        let cancel = options.cancel.clone().unwrap_or_default();

        info!(
            "等待 {} 个分段完成 (超时: {:?}, 策略: {:?})",
            pending.len(),
            options.timeout,
            options.failure_policy
        );

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    pending.cancel();
                    warn!("等待分段时收到取消请求: 已收到 {}/{}", self.received(), self.expected());
                    return Err(AggregationError::Cancelled {
                        expected: self.expected(),
                        received: self.received(),
                    });
                }
                _ = sleep_until_deadline(deadline) => {
                    pending.cancel();
                    self.timed_out.store(true, Ordering::SeqCst);
                    warn!("等待分段超时: 已收到 {}/{}", self.received(), self.expected());
                    return Ok(WaitOutcome::TimedOut);
                }
                joined = pending.join_next() => match joined {
                    None => return Ok(WaitOutcome::Completed),
                    Some(Ok(result)) => {
                        let failed = !result.is_success();
                        if let Err(e) = self.record(result) {
                            pending.cancel();
                            return Err(e);
                        }
                        if failed && options.failure_policy == FailurePolicy::AbortOnFirstFailure {
                            pending.cancel();
                            warn!("分段失败，按策略停止等待其余分段");
                            return Ok(WaitOutcome::FailedFast);
                        }
                    }
                    Some(Err(e)) => {
                        if e.is_panic() {
                            error!("分段任务异常退出: {}", e);
                        } else {
                            debug!("分段任务已中止: {}", e);
                        }
                    }
                },
            }
        }
    }

    /// 生成合并清单
    ///
    /// 成功分段数必须等于规划数，否则返回 IncompleteUpload，
    /// 列出失败和缺失的分段
    pub fn finish(&self) -> Result<CompletionManifest, AggregationError> {
        let missing: Vec<u32> = self
            .expected
            .iter()
            .copied()
            .filter(|n| !self.tokens.contains_key(n) && !self.failures.contains_key(n))
            .collect();

        if self.tokens.len() == self.expected.len() {
            let parts = self
                .tokens
                .iter()
                .map(|entry| CompletedPart {
                    part_number: *entry.key(),
                    integrity_token: entry.value().clone(),
                })
                .collect();
            return Ok(CompletionManifest::from_parts(parts));
        }

        let mut failed: Vec<FailedPart> = self
            .failures
            .iter()
            .map(|entry| FailedPart {
                part_number: *entry.key(),
                error: entry.value().clone(),
            })
            .collect();
        failed.sort_by_key(|f| f.part_number);

        Err(AggregationError::IncompleteUpload {
            expected: self.expected.len(),
            succeeded: self.tokens.len(),
            received: self.received(),
            failed,
            missing,
            timed_out: self.timed_out.load(Ordering::SeqCst),
        })
    }

    /// wait + finish
    pub async fn collect(
        &self,
        pending: PendingParts,
        options: &WaitOptions,
    ) -> Result<CompletionManifest, AggregationError> {
        self.wait(pending, options).await?;
        self.finish()
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}
