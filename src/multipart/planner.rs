// 分段规划
//
// OBS 分段规则：
// - 分段号从 1 开始连续编号，单次上传最多 10000 段
// - 除最后一段外，每段大小相同
// - 分段大小 100KB - 5GB，超出范围时按边界调整

use super::error::PlanningError;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// 单次上传最多分段数
pub const MAX_PART_COUNT: u32 = 10_000;

/// 最小分段大小: 100KB
pub const MIN_PART_SIZE: u64 = 100 * 1024;

/// 最大分段大小: 5GB
pub const MAX_PART_SIZE: u64 = 5 * 1024 * 1024 * 1024;

/// 默认分段大小: 5MB
pub const DEFAULT_PART_SIZE: u64 = 5 * 1024 * 1024;

/// 分段描述
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartDescriptor {
    /// 分段号（从 1 开始）
    pub part_number: u32,
    /// 在源对象中的起始偏移
    pub offset: u64,
    /// 分段大小
    pub size: u64,
}

impl PartDescriptor {
    pub fn range_start(&self) -> u64 {
        self.offset
    }

    /// 结束偏移（闭区间），空对象的唯一分段返回 None
    pub fn range_end(&self) -> Option<u64> {
        if self.size == 0 {
            None
        } else {
            Some(self.offset + self.size - 1)
        }
    }

    /// 拷贝范围请求头，如 `bytes=0-5242879`
    pub fn copy_range(&self) -> Option<String> {
        self.range_end()
            .map(|end| format!("bytes={}-{}", self.offset, end))
    }
}

/// 分段数量
pub fn part_count(total_size: u64, part_size: u64) -> u64 {
    if total_size == 0 || part_size == 0 {
        return 1;
    }
    total_size.div_ceil(part_size)
}

/// 按分段大小切分源对象
///
/// # 参数
/// * `total_size` - 源对象大小
/// * `part_size` - 分段大小（最后一段可能更小）
/// * `max_parts` - 允许的最多分段数
///
/// # 返回
/// 按分段号升序排列的分段列表；空对象返回一个大小为 0 的分段
pub fn plan(
    total_size: u64,
    part_size: u64,
    max_parts: u32,
) -> Result<Vec<PartDescriptor>, PlanningError> {
    if part_size == 0 {
        return Err(PlanningError::InvalidPartSize { part_size });
    }

    let count = part_count(total_size, part_size);
    if count > u64::from(max_parts) {
        return Err(PlanningError::TooManyParts {
            part_count: count,
            max_parts,
        });
    }

    if total_size == 0 {
        return Ok(vec![PartDescriptor {
            part_number: 1,
            offset: 0,
            size: 0,
        }]);
    }

    let parts: Vec<PartDescriptor> = (0..count)
        .map(|index| {
            let offset = index * part_size;
            PartDescriptor {
                part_number: (index + 1) as u32,
                offset,
                size: part_size.min(total_size - offset),
            }
        })
        .collect();

    debug!(
        "分段规划完成: 总大小={}, 分段大小={}, 分段数={}",
        total_size,
        part_size,
        parts.len()
    );

    Ok(parts)
}

/// 将调用方给出的分段大小调整到允许范围内
///
/// hint 为 0 时使用默认分段大小
pub fn resolve_part_size(hint: u64, min: u64, max: u64) -> u64 {
    if hint == 0 {
        return DEFAULT_PART_SIZE.max(min).min(max);
    }
    hint.max(min).min(max)
}
