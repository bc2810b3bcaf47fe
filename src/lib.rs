// OBS 分段上传 Rust 库
// 并发分段上传 / 服务端分段拷贝，统一汇总后合并

// 配置管理模块
pub mod config;

// 日期 / 布尔格式化模块
pub mod format;

// 日志模块
pub mod logging;

// 分段上传模块
pub mod multipart;

// 对象存储传输模块
pub mod transport;

// 导出常用类型
pub use config::{AppConfig, EndpointConfig, UploadConfig};
pub use format::{FormatKind, FormatValue, SchemaFormatter};
pub use multipart::{
    CompletedUpload, CompletionManifest, FailurePolicy, PartDescriptor, SourceSpec,
    UploadCoordinator, UploadError, UploadOptions, UploadPhase,
};
pub use transport::{
    HttpTransport, MemoryTransport, ObjectTarget, Transport, TransportError, TransportErrorKind,
};
