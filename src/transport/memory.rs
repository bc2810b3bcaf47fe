// 内存对象服务
//
// 按 OBS 分段上传语义实现的进程内服务端，用于测试和 demo 子命令：
// - 分段上传在合并前对外不可见
// - 合并时校验分段顺序和 ETag
// - 支持按分段注入故障、延迟，并统计请求次数和并发峰值

use super::{
    CompleteOutput, CompleteRequest, CopyPartRequest, InitiateOutput, ListPartsOutput,
    ListPartsRequest, ObjectMeta, ObjectTarget, PartOutput, PartSummary, ServiceError, Transport,
    TransportError, UploadPartRequest,
};
use crate::format::{FormatKind, SchemaFormatter};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// 单页最多返回的分段数
const DEFAULT_LIST_PAGE: u32 = 1000;

/// 注入的分段故障
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartFault {
    /// 连接中断
    Network,
    /// 请求超时
    Timeout,
    /// 服务端返回错误状态
    Status { status: u16, code: String },
}

#[derive(Debug)]
struct FaultRule {
    part_number: u32,
    /// 剩余触发次数，None 表示一直触发
    remaining: Option<u32>,
    fault: PartFault,
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    etag: String,
    last_modified: i64,
}

#[derive(Debug, Clone)]
struct StoredPart {
    data: Bytes,
    etag: String,
    last_modified: i64,
}

#[derive(Debug)]
struct PendingUpload {
    target: ObjectTarget,
    parts: BTreeMap<u32, StoredPart>,
}

#[derive(Debug, Default)]
struct Counters {
    initiate: AtomicUsize,
    upload_part: AtomicUsize,
    copy_part: AtomicUsize,
    list_parts: AtomicUsize,
    complete: AtomicUsize,
    abort: AtomicUsize,
}

#[derive(Debug, Default)]
struct MemoryStore {
    buckets: DashSet<String>,
    objects: DashMap<ObjectTarget, StoredObject>,
    uploads: DashMap<String, PendingUpload>,
    faults: Mutex<Vec<FaultRule>>,
    fail_initiate: Mutex<Option<ServiceError>>,
    fail_complete: Mutex<Option<ServiceError>>,
    part_delays: DashMap<u32, Duration>,
    counters: Counters,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    request_seq: AtomicU64,
    formatter: SchemaFormatter,
}

/// 内存对象服务（克隆后共享同一份数据）
#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    store: Arc<MemoryStore>,
}

/// 在途请求计数，析构时归还
struct InFlightGuard<'a> {
    store: &'a MemoryStore,
}

impl<'a> InFlightGuard<'a> {
    fn enter(store: &'a MemoryStore) -> Self {
        let current = store.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        store.peak_in_flight.fetch_max(current, Ordering::SeqCst);
        Self { store }
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.store.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    // =====================================================
    // 数据准备
    // =====================================================

    pub fn create_bucket(&self, bucket: &str) {
        self.store.buckets.insert(bucket.to_string());
    }

    /// 直接写入对象（自动创建桶），返回 ETag
    pub fn put_object(&self, target: &ObjectTarget, data: impl Into<Bytes>) -> String {
        let data = data.into();
        self.create_bucket(&target.bucket);
        let etag = quoted_md5(&data);
        self.store.objects.insert(
            target.clone(),
            StoredObject {
                data,
                etag: etag.clone(),
                last_modified: chrono::Utc::now().timestamp(),
            },
        );
        etag
    }

    /// 读取已合并的对象
    pub fn get_object(&self, target: &ObjectTarget) -> Option<Bytes> {
        self.store.objects.get(target).map(|o| o.data.clone())
    }

    /// 尚未合并或取消的分段上传ID
    pub fn pending_uploads(&self) -> Vec<String> {
        self.store.uploads.iter().map(|u| u.key().clone()).collect()
    }

    /// 某次分段上传中已存储的分段号
    pub fn uploaded_parts(&self, upload_id: &str) -> Vec<u32> {
        self.store
            .uploads
            .get(upload_id)
            .map(|u| u.parts.keys().copied().collect())
            .unwrap_or_default()
    }

    // =====================================================
    // 故障注入
    // =====================================================

    /// 指定分段的前 `times` 次请求失败
    pub fn fail_part(&self, part_number: u32, fault: PartFault, times: u32) {
        self.store.faults.lock().push(FaultRule {
            part_number,
            remaining: Some(times),
            fault,
        });
    }

    /// 指定分段的请求一直失败
    pub fn fail_part_always(&self, part_number: u32, fault: PartFault) {
        self.store.faults.lock().push(FaultRule {
            part_number,
            remaining: None,
            fault,
        });
    }

    pub fn fail_initiate(&self, status: u16, code: &str) {
        *self.store.fail_initiate.lock() = Some(self.service_error(status, code, "injected"));
    }

    pub fn fail_complete(&self, status: u16, code: &str) {
        *self.store.fail_complete.lock() = Some(self.service_error(status, code, "injected"));
    }

    /// 指定分段的请求延迟返回
    pub fn delay_part(&self, part_number: u32, delay: Duration) {
        self.store.part_delays.insert(part_number, delay);
    }

    // =====================================================
    // 统计
    // =====================================================

    pub fn initiate_calls(&self) -> usize {
        self.store.counters.initiate.load(Ordering::SeqCst)
    }

    pub fn upload_part_calls(&self) -> usize {
        self.store.counters.upload_part.load(Ordering::SeqCst)
    }

    pub fn copy_part_calls(&self) -> usize {
        self.store.counters.copy_part.load(Ordering::SeqCst)
    }

    pub fn list_parts_calls(&self) -> usize {
        self.store.counters.list_parts.load(Ordering::SeqCst)
    }

    pub fn complete_calls(&self) -> usize {
        self.store.counters.complete.load(Ordering::SeqCst)
    }

    pub fn abort_calls(&self) -> usize {
        self.store.counters.abort.load(Ordering::SeqCst)
    }

    /// 分段请求的最大并发数
    pub fn peak_in_flight(&self) -> usize {
        self.store.peak_in_flight.load(Ordering::SeqCst)
    }

    // =====================================================
    // 内部实现
    // =====================================================

    fn next_request_id(&self) -> String {
        let seq = self.store.request_seq.fetch_add(1, Ordering::SeqCst) + 1;
        format!("MEM{:012X}", seq)
    }

    fn service_error(&self, status: u16, code: &str, message: &str) -> ServiceError {
        ServiceError {
            status,
            code: code.to_string(),
            message: message.to_string(),
            request_id: Some(self.next_request_id()),
        }
    }

    fn reject(&self, status: u16, code: &str, message: &str) -> TransportError {
        TransportError::Service(self.service_error(status, code, message))
    }

    fn check_bucket(&self, bucket: &str) -> Result<(), TransportError> {
        if self.store.buckets.contains(bucket) {
            Ok(())
        } else {
            Err(self.reject(404, "NoSuchBucket", "The specified bucket does not exist."))
        }
    }

    /// 命中故障规则时返回对应错误
    fn take_fault(&self, part_number: u32) -> Option<TransportError> {
        let mut faults = self.store.faults.lock();
        let index = faults.iter().position(|rule| {
            rule.part_number == part_number && rule.remaining.map_or(true, |n| n > 0)
        })?;

        let fault = faults[index].fault.clone();
        if let Some(remaining) = faults[index].remaining.as_mut() {
            *remaining -= 1;
            if *remaining == 0 {
                faults.remove(index);
            }
        }
        drop(faults);

        Some(match fault {
            PartFault::Network => TransportError::Network("connection reset by peer".into()),
            PartFault::Timeout => TransportError::Timeout("operation timed out".into()),
            PartFault::Status { status, code } => self.reject(status, &code, "injected"),
        })
    }

    async fn part_delay(&self, part_number: u32) {
        let delay = self.store.part_delays.get(&part_number).map(|d| *d);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn store_part(
        &self,
        target: &ObjectTarget,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> Result<PartOutput, TransportError> {
        if !(1..=10_000).contains(&part_number) {
            return Err(self.reject(400, "InvalidArgument", "Part number must be between 1 and 10000."));
        }
        let mut upload = self
            .store
            .uploads
            .get_mut(upload_id)
            .filter(|u| &u.target == target)
            .ok_or_else(|| self.reject(404, "NoSuchUpload", "The specified upload does not exist."))?;

        let etag = quoted_md5(&data);
        // 同一分段号重复上传时覆盖
        upload.parts.insert(
            part_number,
            StoredPart {
                data,
                etag: etag.clone(),
                last_modified: chrono::Utc::now().timestamp(),
            },
        );
        drop(upload);

        Ok(PartOutput {
            etag,
            request_id: Some(self.next_request_id()),
        })
    }
}

fn quoted_md5(data: &[u8]) -> String {
    format!("\"{:x}\"", md5::compute(data))
}

/// 解析 `bytes=a-b`（闭区间）
fn parse_range(range: &str, len: u64) -> Option<(u64, u64)> {
    let spec = range.trim().strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    let start: u64 = start.trim().parse().ok()?;
    let end: u64 = end.trim().parse().ok()?;
    if start > end || end >= len {
        return None;
    }
    Some((start, end))
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn initiate_multipart_upload(
        &self,
        target: &ObjectTarget,
    ) -> Result<InitiateOutput, TransportError> {
        self.store.counters.initiate.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.store.fail_initiate.lock().clone() {
            return Err(TransportError::Service(error));
        }
        self.check_bucket(&target.bucket)?;

        let upload_id = uuid::Uuid::new_v4().simple().to_string().to_uppercase();
        self.store.uploads.insert(
            upload_id.clone(),
            PendingUpload {
                target: target.clone(),
                parts: BTreeMap::new(),
            },
        );
        debug!("内存服务: 初始化分段上传 {} -> {}", target, upload_id);

        Ok(InitiateOutput {
            upload_id,
            request_id: Some(self.next_request_id()),
        })
    }

    async fn upload_part(&self, request: UploadPartRequest) -> Result<PartOutput, TransportError> {
        self.store.counters.upload_part.fetch_add(1, Ordering::SeqCst);
        let _guard = InFlightGuard::enter(&self.store);
        self.part_delay(request.part_number).await;

        if let Some(error) = self.take_fault(request.part_number) {
            return Err(error);
        }
        self.store_part(
            &request.target,
            &request.upload_id,
            request.part_number,
            request.body,
        )
    }

    async fn copy_part(&self, request: CopyPartRequest) -> Result<PartOutput, TransportError> {
        self.store.counters.copy_part.fetch_add(1, Ordering::SeqCst);
        let _guard = InFlightGuard::enter(&self.store);
        self.part_delay(request.part_number).await;

        if let Some(error) = self.take_fault(request.part_number) {
            return Err(error);
        }

        let source = self
            .store
            .objects
            .get(&request.source)
            .map(|o| o.data.clone())
            .ok_or_else(|| self.reject(404, "NoSuchKey", "The specified key does not exist."))?;

        let data = match request.range.as_deref() {
            None => source,
            Some(range) => {
                let (start, end) = parse_range(range, source.len() as u64).ok_or_else(|| {
                    self.reject(416, "InvalidRange", "The requested range is not satisfiable.")
                })?;
                source.slice(start as usize..=end as usize)
            }
        };

        self.store_part(
            &request.target,
            &request.upload_id,
            request.part_number,
            data,
        )
    }

    async fn list_parts(
        &self,
        request: ListPartsRequest,
    ) -> Result<ListPartsOutput, TransportError> {
        self.store.counters.list_parts.fetch_add(1, Ordering::SeqCst);
        let upload = self
            .store
            .uploads
            .get(&request.upload_id)
            .filter(|u| u.target == request.target)
            .ok_or_else(|| self.reject(404, "NoSuchUpload", "The specified upload does not exist."))?;

        let max_parts = request.max_parts.unwrap_or(DEFAULT_LIST_PAGE).max(1) as usize;
        let marker = request.part_number_marker.unwrap_or(0);

        let mut remaining = upload.parts.range(marker + 1..);
        let parts: Vec<PartSummary> = remaining
            .by_ref()
            .take(max_parts)
            .map(|(number, part)| PartSummary {
                part_number: *number,
                etag: part.etag.clone(),
                size: part.data.len() as u64,
                last_modified: self
                    .store
                    .formatter
                    .format_kind(FormatKind::DateTime, &part.last_modified.into()),
            })
            .collect();
        let is_truncated = remaining.next().is_some();
        let next_part_number_marker = parts.last().map(|p| p.part_number);

        Ok(ListPartsOutput {
            parts,
            is_truncated,
            next_part_number_marker,
        })
    }

    async fn complete_multipart_upload(
        &self,
        request: CompleteRequest,
    ) -> Result<CompleteOutput, TransportError> {
        self.store.counters.complete.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.store.fail_complete.lock().clone() {
            return Err(TransportError::Service(error));
        }

        if request.parts.is_empty() {
            return Err(self.reject(
                400,
                "MalformedXML",
                "The XML you provided was not well-formed.",
            ));
        }
        if request.parts.windows(2).any(|w| w[0].0 >= w[1].0) {
            return Err(self.reject(
                400,
                "InvalidPartOrder",
                "The list of parts was not in ascending order.",
            ));
        }

        let data = {
            let upload = self
                .store
                .uploads
                .get(&request.upload_id)
                .filter(|u| u.target == request.target)
                .ok_or_else(|| {
                    self.reject(404, "NoSuchUpload", "The specified upload does not exist.")
                })?;

            let mut data = BytesMut::new();
            let mut digests = Vec::with_capacity(request.parts.len() * 16);
            for (part_number, etag) in &request.parts {
                let stored = upload
                    .parts
                    .get(part_number)
                    .filter(|p| super::normalize_etag(&p.etag) == super::normalize_etag(etag))
                    .ok_or_else(|| {
                        self.reject(
                            400,
                            "InvalidPart",
                            "One or more of the specified parts could not be found.",
                        )
                    })?;
                data.extend_from_slice(&stored.data);
                digests.extend_from_slice(&md5::compute(&stored.data).0);
            }
            let etag = format!(
                "\"{}-{}\"",
                hex::encode(md5::compute(&digests).0),
                request.parts.len()
            );
            (data.freeze(), etag)
        };

        self.store.uploads.remove(&request.upload_id);
        let (data, etag) = data;
        self.store.objects.insert(
            request.target.clone(),
            StoredObject {
                data,
                etag: etag.clone(),
                last_modified: chrono::Utc::now().timestamp(),
            },
        );
        debug!("内存服务: 合并完成 {} etag={}", request.target, etag);

        Ok(CompleteOutput {
            location: Some(format!("/{}", request.target)),
            target: request.target,
            etag,
            request_id: Some(self.next_request_id()),
        })
    }

    async fn abort_multipart_upload(
        &self,
        target: &ObjectTarget,
        upload_id: &str,
    ) -> Result<(), TransportError> {
        self.store.counters.abort.fetch_add(1, Ordering::SeqCst);
        match self.store.uploads.remove_if(upload_id, |_, u| &u.target == target) {
            Some(_) => Ok(()),
            None => Err(self.reject(404, "NoSuchUpload", "The specified upload does not exist.")),
        }
    }

    async fn head_object(&self, target: &ObjectTarget) -> Result<ObjectMeta, TransportError> {
        let object = self
            .store
            .objects
            .get(target)
            .map(|o| o.value().clone())
            .ok_or_else(|| self.reject(404, "NoSuchKey", "The specified key does not exist."))?;

        Ok(ObjectMeta {
            content_length: object.data.len() as u64,
            etag: Some(object.etag),
            last_modified: self
                .store
                .formatter
                .format_kind(FormatKind::HttpDate, &object.last_modified.into()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> ObjectTarget {
        ObjectTarget::new("bucket", "object")
    }

    async fn initiate(transport: &MemoryTransport) -> String {
        transport.create_bucket("bucket");
        transport
            .initiate_multipart_upload(&target())
            .await
            .unwrap()
            .upload_id
    }

    async fn upload(
        transport: &MemoryTransport,
        upload_id: &str,
        part_number: u32,
        data: &'static [u8],
    ) -> String {
        transport
            .upload_part(UploadPartRequest {
                target: target(),
                upload_id: upload_id.to_string(),
                part_number,
                body: Bytes::from_static(data),
            })
            .await
            .unwrap()
            .etag
    }

    #[tokio::test]
    async fn test_object_visible_only_after_complete() {
        let transport = MemoryTransport::new();
        let upload_id = initiate(&transport).await;
        let etag1 = upload(&transport, &upload_id, 1, b"hello ").await;
        let etag2 = upload(&transport, &upload_id, 2, b"world").await;

        assert!(transport.get_object(&target()).is_none());

        let output = transport
            .complete_multipart_upload(CompleteRequest {
                target: target(),
                upload_id: upload_id.clone(),
                parts: vec![(1, etag1), (2, etag2)],
            })
            .await
            .unwrap();

        assert!(output.etag.ends_with("-2\""));
        assert_eq!(
            transport.get_object(&target()).unwrap(),
            Bytes::from_static(b"hello world")
        );
        assert!(transport.pending_uploads().is_empty());
    }

    #[tokio::test]
    async fn test_complete_rejects_wrong_order_and_etag() {
        let transport = MemoryTransport::new();
        let upload_id = initiate(&transport).await;
        let etag1 = upload(&transport, &upload_id, 1, b"a").await;
        let etag2 = upload(&transport, &upload_id, 2, b"b").await;

        let err = transport
            .complete_multipart_upload(CompleteRequest {
                target: target(),
                upload_id: upload_id.clone(),
                parts: vec![(2, etag2), (1, etag1.clone())],
            })
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Service(ref e) if e.code == "InvalidPartOrder"));

        let err = transport
            .complete_multipart_upload(CompleteRequest {
                target: target(),
                upload_id: upload_id.clone(),
                parts: vec![(1, etag1), (2, "\"deadbeef\"".to_string())],
            })
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Service(ref e) if e.code == "InvalidPart"));

        // 失败的合并不影响已上传分段
        assert_eq!(transport.uploaded_parts(&upload_id), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_copy_part_range() {
        let transport = MemoryTransport::new();
        let source = ObjectTarget::new("src", "source.bin");
        transport.put_object(&source, Bytes::from_static(b"0123456789"));
        let upload_id = initiate(&transport).await;

        let copy = |range: Option<&str>| CopyPartRequest {
            target: target(),
            upload_id: upload_id.clone(),
            part_number: 1,
            source: source.clone(),
            range: range.map(str::to_string),
        };

        let output = transport.copy_part(copy(Some("bytes=2-5"))).await.unwrap();
        assert_eq!(output.etag, quoted_md5(b"2345"));

        let err = transport.copy_part(copy(Some("bytes=5-10"))).await.unwrap_err();
        assert_eq!(err.status(), Some(416));

        let output = transport.copy_part(copy(None)).await.unwrap();
        assert_eq!(output.etag, quoted_md5(b"0123456789"));
    }

    #[tokio::test]
    async fn test_list_parts_pagination() {
        let transport = MemoryTransport::new();
        let upload_id = initiate(&transport).await;
        for n in 1..=5 {
            upload(&transport, &upload_id, n, b"x").await;
        }

        let page = transport
            .list_parts(ListPartsRequest {
                target: target(),
                upload_id: upload_id.clone(),
                max_parts: Some(2),
                part_number_marker: Some(2),
            })
            .await
            .unwrap();
        let numbers: Vec<u32> = page.parts.iter().map(|p| p.part_number).collect();
        assert_eq!(numbers, vec![3, 4]);
        assert!(page.is_truncated);
        assert_eq!(page.next_part_number_marker, Some(4));
    }

    #[tokio::test]
    async fn test_fault_injection_counts_down() {
        let transport = MemoryTransport::new();
        let upload_id = initiate(&transport).await;
        transport.fail_part(1, PartFault::Network, 1);

        let request = UploadPartRequest {
            target: target(),
            upload_id,
            part_number: 1,
            body: Bytes::from_static(b"x"),
        };
        let err = transport.upload_part(request.clone()).await.unwrap_err();
        assert!(matches!(err, TransportError::Network(_)));
        assert!(transport.upload_part(request).await.is_ok());
        assert_eq!(transport.upload_part_calls(), 2);
    }

    #[tokio::test]
    async fn test_unknown_upload_and_bucket() {
        let transport = MemoryTransport::new();
        let err = transport
            .initiate_multipart_upload(&target())
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(404));

        let err = transport
            .abort_multipart_upload(&target(), "missing")
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Service(ref e) if e.code == "NoSuchUpload"));
    }

    #[test]
    fn test_parse_range() {
        assert_eq!(parse_range("bytes=0-9", 10), Some((0, 9)));
        assert_eq!(parse_range("bytes=0-10", 10), None);
        assert_eq!(parse_range("bytes=5-4", 10), None);
        assert_eq!(parse_range("0-4", 10), None);
    }
}
