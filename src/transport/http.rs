// OBS REST 接口实现
//
// 路径风格寻址：`{endpoint}/{bucket}/{key}`，对象键按段 URL 编码。
// 签名由外部的 RequestSigner 完成，这里只负责请求构造和响应解析。

use super::xml::{complete_multipart_body, XmlDocument};
use super::{
    CompleteOutput, CompleteRequest, CopyPartRequest, InitiateOutput, ListPartsOutput,
    ListPartsRequest, ObjectMeta, ObjectTarget, PartOutput, PartSummary, ServiceError, Transport,
    TransportError, UploadPartRequest,
};
use crate::config::EndpointConfig;
use crate::format::{FormatKind, SchemaFormatter};
use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine;
use reqwest::header::{HeaderMap, CONTENT_LENGTH, CONTENT_TYPE, DATE, ETAG};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// 请求签名
///
/// 在请求发出前调用，可修改请求头（如添加 Authorization）
pub trait RequestSigner: Send + Sync {
    fn sign(&self, request: &mut reqwest::Request) -> Result<()>;
}

/// 不签名（匿名访问或由网关代签）
#[derive(Debug, Clone, Copy, Default)]
pub struct UnsignedRequests;

impl RequestSigner for UnsignedRequests {
    fn sign(&self, _request: &mut reqwest::Request) -> Result<()> {
        Ok(())
    }
}

/// 基于 HTTP 的 OBS 传输
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    /// 服务地址（不含结尾 `/`）
    endpoint: String,
    /// 厂商请求头前缀（如 `x-obs-`）
    header_prefix: String,
    formatter: Arc<SchemaFormatter>,
    signer: Arc<dyn RequestSigner>,
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("endpoint", &self.endpoint)
            .field("header_prefix", &self.header_prefix)
            .finish()
    }
}

impl HttpTransport {
    /// 创建 HTTP 传输
    ///
    /// # 参数
    /// * `config` - 服务地址和超时配置
    /// * `formatter` - 用于生成 Date 请求头
    pub fn new(config: &EndpointConfig, formatter: Arc<SchemaFormatter>) -> Result<Self> {
        let mut builder = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs.max(1)))
            .pool_max_idle_per_host(config.pool_max_idle_per_host);
        if config.socket_timeout_secs > 0 {
            builder = builder.timeout(Duration::from_secs(config.socket_timeout_secs));
        }
        let client = builder.build().context("创建 HTTP 客户端失败")?;

        Ok(Self {
            client,
            endpoint: config.url.trim_end_matches('/').to_string(),
            header_prefix: config.header_prefix.clone(),
            formatter,
            signer: Arc::new(UnsignedRequests),
        })
    }

    /// 设置签名器
    pub fn with_signer(mut self, signer: Arc<dyn RequestSigner>) -> Self {
        self.signer = signer;
        self
    }

    fn object_url(&self, target: &ObjectTarget) -> String {
        format!(
            "{}/{}/{}",
            self.endpoint,
            urlencoding::encode(&target.bucket),
            encode_key(&target.key)
        )
    }

    fn header_name(&self, suffix: &str) -> String {
        format!("{}{}", self.header_prefix, suffix)
    }

    fn request_id(&self, headers: &HeaderMap) -> Option<String> {
        headers
            .get(self.header_name("request-id"))
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }

    /// 发送请求，非 2xx 响应转换为服务端错误
    async fn execute(&self, builder: RequestBuilder) -> Result<Response, TransportError> {
        let date = self.formatter.now(FormatKind::HttpDate);
        let mut request = builder
            .header(DATE, date)
            .build()
            .map_err(|e| TransportError::Request(e.to_string()))?;
        self.signer
            .sign(&mut request)
            .map_err(|e| TransportError::Request(format!("{:#}", e)))?;

        debug!("OBS 请求: {} {}", request.method(), request.url());

        let response = self.client.execute(request).await.map_err(map_reqwest_error)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let request_id = self.request_id(response.headers());
        let body = response.bytes().await.unwrap_or_default();
        Err(TransportError::Service(service_error(status, &body, request_id)))
    }

    async fn read_xml(
        &self,
        response: Response,
    ) -> Result<(XmlDocument, Option<String>), TransportError> {
        let request_id = self.request_id(response.headers());
        let body = response.bytes().await.map_err(map_reqwest_error)?;
        let doc = XmlDocument::parse(&body)
            .map_err(|e| TransportError::InvalidResponse(format!("XML 解析失败: {}", e)))?;
        Ok((doc, request_id))
    }
}

/// 对象键按 `/` 分段编码，保留路径分隔符
fn encode_key(key: &str) -> String {
    key.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

fn map_reqwest_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout(e.to_string())
    } else {
        TransportError::Network(e.to_string())
    }
}

/// 从错误响应体中提取错误码和消息
fn service_error(status: StatusCode, body: &[u8], request_id: Option<String>) -> ServiceError {
    let doc = XmlDocument::parse(body).ok();
    let field = |name: &str| {
        doc.as_ref()
            .and_then(|d| d.text(name))
            .map(str::to_string)
    };

    ServiceError {
        status: status.as_u16(),
        code: field("Code").unwrap_or_else(|| {
            status
                .canonical_reason()
                .unwrap_or("Unknown")
                .replace(' ', "")
        }),
        message: field("Message").unwrap_or_default(),
        request_id: field("RequestId").or(request_id),
    }
}

/// 200 响应体中的 Error 文档
fn embedded_error(doc: &XmlDocument, request_id: Option<String>) -> TransportError {
    let code = doc.text("Code").unwrap_or("InternalError").to_string();
    warn!("服务端在成功响应中返回错误: code={}", code);
    TransportError::Service(ServiceError {
        status: StatusCode::OK.as_u16(),
        code,
        message: doc.text("Message").unwrap_or_default().to_string(),
        request_id: doc.text("RequestId").map(str::to_string).or(request_id),
    })
}

fn required<'a>(doc: &'a XmlDocument, path: &str) -> Result<&'a str, TransportError> {
    doc.text(path)
        .ok_or_else(|| TransportError::InvalidResponse(format!("响应缺少 {} 字段", path)))
}

#[async_trait]
impl Transport for HttpTransport {
    async fn initiate_multipart_upload(
        &self,
        target: &ObjectTarget,
    ) -> Result<InitiateOutput, TransportError> {
        let url = format!("{}?uploads", self.object_url(target));
        let response = self.execute(self.client.post(&url)).await?;
        let (doc, request_id) = self.read_xml(response).await?;

        Ok(InitiateOutput {
            upload_id: required(&doc, "UploadId")?.to_string(),
            request_id,
        })
    }

    async fn upload_part(&self, request: UploadPartRequest) -> Result<PartOutput, TransportError> {
        let url = format!(
            "{}?partNumber={}&uploadId={}",
            self.object_url(&request.target),
            request.part_number,
            urlencoding::encode(&request.upload_id)
        );
        let content_md5 =
            base64::engine::general_purpose::STANDARD.encode(md5::compute(&request.body).0);

        let builder = self
            .client
            .put(&url)
            .header("Content-MD5", content_md5)
            .header(CONTENT_LENGTH, request.body.len())
            .body(request.body);
        let response = self.execute(builder).await?;

        let request_id = self.request_id(response.headers());
        let etag = response
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| TransportError::InvalidResponse("响应缺少 ETag 头".to_string()))?;

        Ok(PartOutput { etag, request_id })
    }

    async fn copy_part(&self, request: CopyPartRequest) -> Result<PartOutput, TransportError> {
        let url = format!(
            "{}?partNumber={}&uploadId={}",
            self.object_url(&request.target),
            request.part_number,
            urlencoding::encode(&request.upload_id)
        );
        let copy_source = format!(
            "/{}/{}",
            urlencoding::encode(&request.source.bucket),
            encode_key(&request.source.key)
        );

        let mut builder = self
            .client
            .put(&url)
            .header(self.header_name("copy-source"), copy_source);
        if let Some(range) = &request.range {
            builder = builder.header(self.header_name("copy-source-range"), range);
        }
        let response = self.execute(builder).await?;
        let (doc, request_id) = self.read_xml(response).await?;

        // 拷贝请求可能在 200 响应体中返回错误
        if doc.root() == Some("Error") {
            return Err(embedded_error(&doc, request_id));
        }

        Ok(PartOutput {
            etag: required(&doc, "ETag")?.to_string(),
            request_id,
        })
    }

    async fn list_parts(
        &self,
        request: ListPartsRequest,
    ) -> Result<ListPartsOutput, TransportError> {
        let mut url = format!(
            "{}?uploadId={}",
            self.object_url(&request.target),
            urlencoding::encode(&request.upload_id)
        );
        if let Some(max_parts) = request.max_parts {
            url.push_str(&format!("&max-parts={}", max_parts));
        }
        if let Some(marker) = request.part_number_marker {
            url.push_str(&format!("&part-number-marker={}", marker));
        }

        let response = self.execute(self.client.get(&url)).await?;
        let (doc, _) = self.read_xml(response).await?;

        let mut parts = Vec::new();
        for group in doc.groups("Part") {
            let field = |name: &str| group.iter().find(|(k, _)| *k == name).map(|(_, v)| *v);
            let part_number = field("PartNumber")
                .and_then(|v| v.parse::<u32>().ok())
                .ok_or_else(|| TransportError::InvalidResponse("分段缺少 PartNumber".into()))?;
            parts.push(PartSummary {
                part_number,
                etag: field("ETag").unwrap_or_default().to_string(),
                size: field("Size").and_then(|v| v.parse().ok()).unwrap_or(0),
                last_modified: field("LastModified").map(str::to_string),
            });
        }

        Ok(ListPartsOutput {
            parts,
            is_truncated: doc.text("IsTruncated") == Some("true"),
            next_part_number_marker: doc
                .text("NextPartNumberMarker")
                .and_then(|v| v.parse().ok()),
        })
    }

    async fn complete_multipart_upload(
        &self,
        request: CompleteRequest,
    ) -> Result<CompleteOutput, TransportError> {
        let url = format!(
            "{}?uploadId={}",
            self.object_url(&request.target),
            urlencoding::encode(&request.upload_id)
        );
        let body = complete_multipart_body(&request.parts);

        let builder = self
            .client
            .request(Method::POST, &url)
            .header(CONTENT_TYPE, "application/xml")
            .body(body);
        let response = self.execute(builder).await?;
        let (doc, request_id) = self.read_xml(response).await?;

        // 合并失败时服务端同样可能返回 200 + Error 响应体
        if doc.root() == Some("Error") {
            return Err(embedded_error(&doc, request_id));
        }

        Ok(CompleteOutput {
            target: request.target,
            etag: required(&doc, "ETag")?.to_string(),
            location: doc.text("Location").map(str::to_string),
            request_id,
        })
    }

    async fn abort_multipart_upload(
        &self,
        target: &ObjectTarget,
        upload_id: &str,
    ) -> Result<(), TransportError> {
        let url = format!(
            "{}?uploadId={}",
            self.object_url(target),
            urlencoding::encode(upload_id)
        );
        self.execute(self.client.delete(&url)).await?;
        Ok(())
    }

    async fn head_object(&self, target: &ObjectTarget) -> Result<ObjectMeta, TransportError> {
        let response = self
            .execute(self.client.head(self.object_url(target)))
            .await?;
        let headers = response.headers();
        let header = |name: reqwest::header::HeaderName| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };

        let content_length = header(CONTENT_LENGTH)
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or_else(|| TransportError::InvalidResponse("响应缺少 Content-Length".into()))?;

        Ok(ObjectMeta {
            content_length,
            etag: header(ETAG),
            last_modified: header(reqwest::header::LAST_MODIFIED),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport() -> HttpTransport {
        let config = EndpointConfig {
            url: "https://obs.example.com/".to_string(),
            ..Default::default()
        };
        HttpTransport::new(&config, Arc::new(SchemaFormatter::utc())).unwrap()
    }

    #[test]
    fn test_object_url_encodes_key_segments() {
        let transport = transport();
        let url = transport.object_url(&ObjectTarget::new("bucket", "dir one/a+b.bin"));
        assert_eq!(url, "https://obs.example.com/bucket/dir%20one/a%2Bb.bin");
    }

    #[test]
    fn test_header_prefix() {
        let transport = transport();
        assert_eq!(transport.header_name("copy-source"), "x-obs-copy-source");
    }

    #[test]
    fn test_service_error_from_body() {
        let body = b"<Error><Code>NoSuchUpload</Code><Message>gone</Message><RequestId>R1</RequestId></Error>";
        let error = service_error(StatusCode::NOT_FOUND, body, Some("H1".to_string()));
        assert_eq!(error.status, 404);
        assert_eq!(error.code, "NoSuchUpload");
        assert_eq!(error.message, "gone");
        assert_eq!(error.request_id.as_deref(), Some("R1"));
    }

    #[test]
    fn test_service_error_without_body() {
        let error = service_error(
            StatusCode::SERVICE_UNAVAILABLE,
            b"",
            Some("H1".to_string()),
        );
        assert_eq!(error.code, "ServiceUnavailable");
        assert_eq!(error.request_id.as_deref(), Some("H1"));
    }
}
