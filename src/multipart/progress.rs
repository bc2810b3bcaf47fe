// 分段进度通知

use super::task::{PartOutcome, PartResult};
use std::sync::Arc;
use tracing::{info, warn};

/// 单个分段完成时的通知
#[derive(Debug, Clone)]
pub struct PartProgress {
    pub part_number: u32,
    pub outcome: PartOutcome,
    /// 已收到的分段结果数（含本次）
    pub received: usize,
    /// 规划的分段总数
    pub expected: usize,
}

impl PartProgress {
    pub(crate) fn new(result: &PartResult, received: usize, expected: usize) -> Self {
        Self {
            part_number: result.part_number,
            outcome: result.outcome.clone(),
            received,
            expected,
        }
    }

    pub fn integrity_token(&self) -> Option<&str> {
        match &self.outcome {
            PartOutcome::Success { integrity_token } => Some(integrity_token),
            PartOutcome::Failure(_) => None,
        }
    }

    /// 进度百分比
    pub fn percent(&self) -> f64 {
        if self.expected == 0 {
            return 100.0;
        }
        (self.received as f64 / self.expected as f64) * 100.0
    }
}

/// 进度回调，在汇总任务上调用
pub type ProgressCallback = Arc<dyn Fn(&PartProgress) + Send + Sync>;

/// 输出到日志的进度回调
pub fn logging_progress() -> ProgressCallback {
    Arc::new(|progress: &PartProgress| match &progress.outcome {
        PartOutcome::Success { integrity_token } => info!(
            "[分段#{}] ✓ 完成 ({}/{}, {:.1}%) etag={}",
            progress.part_number,
            progress.received,
            progress.expected,
            progress.percent(),
            integrity_token
        ),
        PartOutcome::Failure(error) => warn!(
            "[分段#{}] 失败 ({}/{}): {}",
            progress.part_number, progress.received, progress.expected, error
        ),
    })
}
