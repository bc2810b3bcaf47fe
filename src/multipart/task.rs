// 分段传输任务
//
// 一个任务负责一个分段的一次传输：
// - 本地数据源：读取分段字节后调用 upload_part
// - 远端拷贝：调用 copy_part，由服务端按范围读取源对象
//
// 任务本身不重试，重试由会话层包装

use super::error::PartTransferError;
use super::planner::PartDescriptor;
use super::session::UploadSessionHandle;
use crate::transport::{CopyPartRequest, ObjectTarget, Transport, UploadPartRequest};
use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

// =====================================================
// 数据源
// =====================================================

/// 可按范围读取的字节源
#[async_trait]
pub trait ByteSource: Send + Sync {
    /// 总字节数
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 读取 `[offset, offset + size)`
    async fn read_range(&self, offset: u64, size: u64) -> Result<Bytes>;
}

/// 内存数据源
#[derive(Debug, Clone)]
pub struct MemorySource {
    data: Bytes,
}

impl MemorySource {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }
}

#[async_trait]
impl ByteSource for MemorySource {
    fn len(&self) -> u64 {
        self.data.len() as u64
    }

    async fn read_range(&self, offset: u64, size: u64) -> Result<Bytes> {
        let end = offset
            .checked_add(size)
            .filter(|end| *end <= self.len())
            .with_context(|| {
                format!(
                    "读取范围越界: offset={}, size={}, len={}",
                    offset,
                    size,
                    self.len()
                )
            })?;
        Ok(self.data.slice(offset as usize..end as usize))
    }
}

/// 本地文件数据源
///
/// 大小在打开时确定，每次读取在阻塞线程池中按偏移读取
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
    size: u64,
}

impl FileSource {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let metadata = tokio::fs::metadata(&path)
            .await
            .with_context(|| format!("无法读取文件信息: {:?}", path))?;
        if !metadata.is_file() {
            anyhow::bail!("不是普通文件: {:?}", path);
        }
        Ok(Self {
            path,
            size: metadata.len(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ByteSource for FileSource {
    fn len(&self) -> u64 {
        self.size
    }

    async fn read_range(&self, offset: u64, size: u64) -> Result<Bytes> {
        let path = self.path.clone();
        let size = usize::try_from(size).context("分段过大")?;

        tokio::task::spawn_blocking(move || {
            let mut file =
                std::fs::File::open(&path).with_context(|| format!("无法打开文件: {:?}", path))?;
            file.seek(SeekFrom::Start(offset))?;

            let mut buffer = vec![0u8; size];
            file.read_exact(&mut buffer)
                .with_context(|| format!("读取文件失败: offset={}, size={}", offset, size))?;

            Ok(Bytes::from(buffer))
        })
        .await
        .context("读取任务异常退出")?
    }
}

/// 分段数据来源
#[derive(Clone)]
pub enum SourceSpec {
    /// 本地字节，逐段上传
    Bytes(Arc<dyn ByteSource>),
    /// 服务端已有对象，逐段拷贝
    RemoteCopy(ObjectTarget),
}

impl SourceSpec {
    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        SourceSpec::Bytes(Arc::new(MemorySource::new(data)))
    }

    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Ok(SourceSpec::Bytes(Arc::new(FileSource::open(path).await?)))
    }

    pub fn remote_copy(source: ObjectTarget) -> Self {
        SourceSpec::RemoteCopy(source)
    }

    /// 传输方式名称（日志用）
    pub fn mode(&self) -> &'static str {
        match self {
            SourceSpec::Bytes(_) => "upload",
            SourceSpec::RemoteCopy(_) => "copy",
        }
    }
}

impl fmt::Debug for SourceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceSpec::Bytes(source) => f
                .debug_struct("Bytes")
                .field("len", &source.len())
                .finish(),
            SourceSpec::RemoteCopy(target) => f.debug_tuple("RemoteCopy").field(target).finish(),
        }
    }
}

// =====================================================
// 分段结果
// =====================================================

/// 分段传输结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartOutcome {
    /// 服务端为该分段返回的 ETag
    Success { integrity_token: String },
    Failure(PartTransferError),
}

/// 单个分段的最终结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartResult {
    pub part_number: u32,
    pub outcome: PartOutcome,
    /// 实际请求次数
    pub attempts: u32,
}

impl PartResult {
    pub fn success(part_number: u32, integrity_token: impl Into<String>) -> Self {
        Self {
            part_number,
            outcome: PartOutcome::Success {
                integrity_token: integrity_token.into(),
            },
            attempts: 1,
        }
    }

    pub fn failure(part_number: u32, error: PartTransferError) -> Self {
        Self {
            part_number,
            outcome: PartOutcome::Failure(error),
            attempts: 1,
        }
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, PartOutcome::Success { .. })
    }

    pub fn integrity_token(&self) -> Option<&str> {
        match &self.outcome {
            PartOutcome::Success { integrity_token } => Some(integrity_token),
            PartOutcome::Failure(_) => None,
        }
    }

    pub fn error(&self) -> Option<&PartTransferError> {
        match &self.outcome {
            PartOutcome::Failure(error) => Some(error),
            PartOutcome::Success { .. } => None,
        }
    }
}

// =====================================================
// 分段任务
// =====================================================

/// 分段传输任务
#[derive(Debug, Clone)]
pub struct PartTransferTask {
    pub descriptor: PartDescriptor,
    pub session: Arc<UploadSessionHandle>,
    pub source: SourceSpec,
}

impl PartTransferTask {
    pub fn new(
        descriptor: PartDescriptor,
        session: Arc<UploadSessionHandle>,
        source: SourceSpec,
    ) -> Self {
        Self {
            descriptor,
            session,
            source,
        }
    }

    pub fn part_number(&self) -> u32 {
        self.descriptor.part_number
    }

    /// 执行一次分段传输
    ///
    /// 只发起一次请求；同一分段号重复执行会覆盖服务端已有的分段
    pub async fn execute(&self, transport: &dyn Transport) -> PartResult {
        let part_number = self.descriptor.part_number;

        debug!(
            "[分段#{}] 开始 {} (offset={}, size={})",
            part_number,
            self.source.mode(),
            self.descriptor.offset,
            self.descriptor.size
        );

        let result = match &self.source {
            SourceSpec::Bytes(source) => {
                let body = match source
                    .read_range(self.descriptor.offset, self.descriptor.size)
                    .await
                {
                    Ok(body) => body,
                    Err(e) => {
                        return PartResult::failure(
                            part_number,
                            PartTransferError::Source {
                                message: format!("{:#}", e),
                            },
                        );
                    }
                };
                transport
                    .upload_part(UploadPartRequest {
                        target: self.session.target.clone(),
                        upload_id: self.session.upload_id.clone(),
                        part_number,
                        body,
                    })
                    .await
            }
            SourceSpec::RemoteCopy(source) => {
                transport
                    .copy_part(CopyPartRequest {
                        target: self.session.target.clone(),
                        upload_id: self.session.upload_id.clone(),
                        part_number,
                        source: source.clone(),
                        range: self.descriptor.copy_range(),
                    })
                    .await
            }
        };

        match result {
            Ok(output) => {
                debug!("[分段#{}] ✓ 完成 etag={}", part_number, output.etag);
                PartResult::success(part_number, output.etag)
            }
            Err(e) => PartResult::failure(part_number, e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MemoryTransport, PartFault};
    use std::io::Write;
    use tempfile::NamedTempFile;

    async fn session(transport: &MemoryTransport) -> Arc<UploadSessionHandle> {
        let target = ObjectTarget::new("bucket", "object");
        transport.create_bucket("bucket");
        let upload_id = transport
            .initiate_multipart_upload(&target)
            .await
            .unwrap()
            .upload_id;
        Arc::new(UploadSessionHandle { upload_id, target })
    }

    fn descriptor(part_number: u32, offset: u64, size: u64) -> PartDescriptor {
        PartDescriptor {
            part_number,
            offset,
            size,
        }
    }

    #[tokio::test]
    async fn test_memory_source_range() {
        let source = MemorySource::new(Bytes::from_static(b"0123456789"));
        assert_eq!(source.len(), 10);
        assert_eq!(source.read_range(3, 4).await.unwrap(), Bytes::from_static(b"3456"));
        assert!(source.read_range(8, 4).await.is_err());
    }

    #[tokio::test]
    async fn test_file_source_range() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"hello multipart world").unwrap();
        file.flush().unwrap();

        let source = FileSource::open(file.path()).await.unwrap();
        assert_eq!(source.len(), 21);
        assert_eq!(
            source.read_range(6, 9).await.unwrap(),
            Bytes::from_static(b"multipart")
        );
        assert!(source.read_range(20, 5).await.is_err());
    }

    #[tokio::test]
    async fn test_execute_upload() {
        let transport = MemoryTransport::new();
        let session = session(&transport).await;
        let task = PartTransferTask::new(
            descriptor(2, 4, 4),
            session.clone(),
            SourceSpec::from_bytes(Bytes::from_static(b"aaaabbbbcc")),
        );

        let result = task.execute(&transport).await;
        assert!(result.is_success());
        assert_eq!(
            result.integrity_token(),
            Some(format!("\"{:x}\"", md5::compute(b"bbbb")).as_str())
        );
        assert_eq!(transport.uploaded_parts(&session.upload_id), vec![2]);
    }

    #[tokio::test]
    async fn test_execute_copy_uses_range() {
        let transport = MemoryTransport::new();
        let source = ObjectTarget::new("src", "big.bin");
        transport.put_object(&source, Bytes::from_static(b"0123456789"));
        let session = session(&transport).await;

        let task = PartTransferTask::new(
            descriptor(1, 5, 5),
            session,
            SourceSpec::remote_copy(source),
        );
        let result = task.execute(&transport).await;
        assert_eq!(
            result.integrity_token(),
            Some(format!("\"{:x}\"", md5::compute(b"56789")).as_str())
        );
        assert_eq!(transport.copy_part_calls(), 1);
    }

    #[tokio::test]
    async fn test_execute_reports_failure_without_retry() {
        let transport = MemoryTransport::new();
        let session = session(&transport).await;
        transport.fail_part(1, PartFault::Network, 1);

        let task = PartTransferTask::new(
            descriptor(1, 0, 3),
            session,
            SourceSpec::from_bytes(Bytes::from_static(b"abc")),
        );
        let result = task.execute(&transport).await;
        assert!(matches!(
            result.error(),
            Some(PartTransferError::Transport { .. })
        ));
        assert_eq!(transport.upload_part_calls(), 1);
    }

    #[tokio::test]
    async fn test_execute_source_error() {
        let transport = MemoryTransport::new();
        let session = session(&transport).await;

        let task = PartTransferTask::new(
            descriptor(1, 0, 100),
            session,
            SourceSpec::from_bytes(Bytes::from_static(b"short")),
        );
        let result = task.execute(&transport).await;
        assert!(matches!(
            result.error(),
            Some(PartTransferError::Source { .. })
        ));
        assert_eq!(transport.upload_part_calls(), 0);
    }

    #[tokio::test]
    async fn test_execute_twice_overwrites() {
        let transport = MemoryTransport::new();
        let session = session(&transport).await;
        let task = PartTransferTask::new(
            descriptor(1, 0, 3),
            session.clone(),
            SourceSpec::from_bytes(Bytes::from_static(b"abc")),
        );

        let first = task.execute(&transport).await;
        let second = task.execute(&transport).await;
        assert_eq!(first.integrity_token(), second.integrity_token());
        assert_eq!(transport.uploaded_parts(&session.upload_id), vec![1]);
    }
}
