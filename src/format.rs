//! 请求字段格式化
//!
//! 把时间、布尔值等结构化字段转换为服务端报文需要的字符串形式。
//! 所有时间输出统一为 UTC；不带时区的输入按 [`FormatConfig`] 中配置的偏移解释，
//! 该配置在启动时构造一次，之后以引用（`Arc<SchemaFormatter>`）传递。

use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, Offset, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// 字段格式类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatKind {
    /// `2024-01-01T08:00:00Z`
    DateTime,
    /// `Mon, 01 Jan 2024 08:00:00 GMT`
    HttpDate,
    /// `2024-01-01T00:00:00Z`（只保留日期）
    DateTimeMiddle,
    /// `2024-01-01`
    Date,
    /// `08:00:00`
    Time,
    /// Unix 秒
    Timestamp,
    /// `true` / `false`
    BooleanString,
}

impl FormatKind {
    /// 从报文定义中的格式名解析，未知格式返回 None
    pub fn parse(kind: &str) -> Option<Self> {
        match kind {
            "date-time" => Some(FormatKind::DateTime),
            "data-time-http" => Some(FormatKind::HttpDate),
            "data-time-middle" => Some(FormatKind::DateTimeMiddle),
            "date" => Some(FormatKind::Date),
            "time" => Some(FormatKind::Time),
            "timestamp" => Some(FormatKind::Timestamp),
            "boolean-string" => Some(FormatKind::BooleanString),
            _ => None,
        }
    }

    fn pattern(&self) -> Option<&'static str> {
        match self {
            FormatKind::DateTime => Some("%Y-%m-%dT%H:%M:%SZ"),
            FormatKind::HttpDate => Some("%a, %d %b %Y %H:%M:%S GMT"),
            FormatKind::DateTimeMiddle => Some("%Y-%m-%dT00:00:00Z"),
            FormatKind::Date => Some("%Y-%m-%d"),
            FormatKind::Time => Some("%H:%M:%S"),
            FormatKind::Timestamp | FormatKind::BooleanString => None,
        }
    }
}

/// 待格式化的值
#[derive(Debug, Clone, PartialEq)]
pub enum FormatValue {
    /// Unix 秒
    Timestamp(i64),
    DateTime(DateTime<FixedOffset>),
    /// 文本（日期字符串或布尔字符串）
    Text(String),
    Bool(bool),
}

impl From<i64> for FormatValue {
    fn from(value: i64) -> Self {
        FormatValue::Timestamp(value)
    }
}

impl From<bool> for FormatValue {
    fn from(value: bool) -> Self {
        FormatValue::Bool(value)
    }
}

impl From<&str> for FormatValue {
    fn from(value: &str) -> Self {
        FormatValue::Text(value.to_string())
    }
}

impl From<String> for FormatValue {
    fn from(value: String) -> Self {
        FormatValue::Text(value)
    }
}

impl From<DateTime<Utc>> for FormatValue {
    fn from(value: DateTime<Utc>) -> Self {
        FormatValue::DateTime(value.fixed_offset())
    }
}

impl From<DateTime<FixedOffset>> for FormatValue {
    fn from(value: DateTime<FixedOffset>) -> Self {
        FormatValue::DateTime(value)
    }
}

/// 格式化配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FormatConfig {
    /// 不带时区的时间字符串按此偏移（分钟，东正西负）解释，默认 0（UTC）
    #[serde(default)]
    pub naive_offset_minutes: i32,
}

/// 字段格式化器
#[derive(Debug, Clone)]
pub struct SchemaFormatter {
    naive_offset: FixedOffset,
}

impl Default for SchemaFormatter {
    fn default() -> Self {
        Self::utc()
    }
}

impl SchemaFormatter {
    /// 根据配置创建
    pub fn new(config: &FormatConfig) -> Result<Self> {
        let naive_offset = FixedOffset::east_opt(config.naive_offset_minutes * 60)
            .with_context(|| format!("无效的时区偏移: {} 分钟", config.naive_offset_minutes))?;
        Ok(Self { naive_offset })
    }

    /// 无时区输入也按 UTC 解释
    pub fn utc() -> Self {
        Self {
            naive_offset: Utc.fix(),
        }
    }

    /// 按格式名格式化
    ///
    /// 未知格式或无法解析的值返回 None
    pub fn format(&self, kind: &str, value: &FormatValue) -> Option<String> {
        let kind = FormatKind::parse(kind)?;
        self.format_kind(kind, value)
    }

    /// 按格式类型格式化
    pub fn format_kind(&self, kind: FormatKind, value: &FormatValue) -> Option<String> {
        match kind {
            FormatKind::BooleanString => {
                Some(if Self::is_truthy(value) { "true" } else { "false" }.to_string())
            }
            FormatKind::Timestamp => self.to_utc(value).map(|dt| dt.timestamp().to_string()),
            other => {
                let pattern = other.pattern()?;
                self.to_utc(value).map(|dt| dt.format(pattern).to_string())
            }
        }
    }

    /// 当前时间
    pub fn now(&self, kind: FormatKind) -> String {
        self.format_kind(kind, &FormatValue::from(Utc::now()))
            .unwrap_or_default()
    }

    fn to_utc(&self, value: &FormatValue) -> Option<DateTime<Utc>> {
        match value {
            FormatValue::Timestamp(secs) => Utc.timestamp_opt(*secs, 0).single(),
            FormatValue::DateTime(dt) => Some(dt.with_timezone(&Utc)),
            FormatValue::Text(text) => self.parse_text(text),
            FormatValue::Bool(_) => None,
        }
    }

    fn parse_text(&self, raw: &str) -> Option<DateTime<Utc>> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }

        // 纯数字视为 Unix 秒
        if let Ok(secs) = raw.parse::<i64>() {
            return Utc.timestamp_opt(secs, 0).single();
        }
        if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
            return Some(dt.with_timezone(&Utc));
        }
        if let Ok(dt) = DateTime::parse_from_rfc2822(raw) {
            return Some(dt.with_timezone(&Utc));
        }
        for pattern in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
            if let Ok(naive) = NaiveDateTime::parse_from_str(raw, pattern) {
                return self.localize(naive);
            }
        }
        if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
            return self.localize(date.and_hms_opt(0, 0, 0)?);
        }
        None
    }

    fn localize(&self, naive: NaiveDateTime) -> Option<DateTime<Utc>> {
        self.naive_offset
            .from_local_datetime(&naive)
            .single()
            .map(|dt| dt.with_timezone(&Utc))
    }

    fn is_truthy(value: &FormatValue) -> bool {
        match value {
            FormatValue::Bool(b) => *b,
            FormatValue::Timestamp(n) => *n == 1,
            FormatValue::Text(text) => matches!(
                text.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "on" | "yes"
            ),
            FormatValue::DateTime(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc() -> SchemaFormatter {
        SchemaFormatter::utc()
    }

    #[test]
    fn test_unknown_kind() {
        assert_eq!(utc().format("rfc-whatever", &FormatValue::from(0)), None);
    }

    #[test]
    fn test_date_time_from_timestamp() {
        assert_eq!(
            utc().format("date-time", &FormatValue::from(0)),
            Some("1970-01-01T00:00:00Z".to_string())
        );
        assert_eq!(
            utc().format("date", &FormatValue::from(86_400)),
            Some("1970-01-02".to_string())
        );
    }

    #[test]
    fn test_http_date() {
        let value = FormatValue::from("1994-11-06T08:49:37Z");
        assert_eq!(
            utc().format("data-time-http", &value),
            Some("Sun, 06 Nov 1994 08:49:37 GMT".to_string())
        );
    }

    #[test]
    fn test_offset_input_normalized_to_utc() {
        let value = FormatValue::from("2024-01-01T08:00:00+08:00");
        assert_eq!(
            utc().format("date-time", &value),
            Some("2024-01-01T00:00:00Z".to_string())
        );
        assert_eq!(
            utc().format("time", &value),
            Some("00:00:00".to_string())
        );
    }

    #[test]
    fn test_naive_input_uses_configured_offset() {
        let formatter = SchemaFormatter::new(&FormatConfig {
            naive_offset_minutes: 8 * 60,
        })
        .unwrap();
        let value = FormatValue::from("2024-01-01 08:00:00");
        assert_eq!(
            formatter.format("date-time", &value),
            Some("2024-01-01T00:00:00Z".to_string())
        );

        // 同一输入在 UTC 配置下不做偏移
        assert_eq!(
            utc().format("date-time", &value),
            Some("2024-01-01T08:00:00Z".to_string())
        );
    }

    #[test]
    fn test_date_time_middle_drops_time() {
        let value = FormatValue::from("2024-03-05T23:59:59Z");
        assert_eq!(
            utc().format("data-time-middle", &value),
            Some("2024-03-05T00:00:00Z".to_string())
        );
    }

    #[test]
    fn test_timestamp() {
        let value = FormatValue::from("1970-01-01T00:01:40Z");
        assert_eq!(utc().format("timestamp", &value), Some("100".to_string()));
    }

    #[test]
    fn test_boolean_string() {
        let f = utc();
        assert_eq!(f.format("boolean-string", &true.into()), Some("true".into()));
        assert_eq!(f.format("boolean-string", &false.into()), Some("false".into()));
        assert_eq!(f.format("boolean-string", &"Yes".into()), Some("true".into()));
        assert_eq!(f.format("boolean-string", &"on".into()), Some("true".into()));
        assert_eq!(f.format("boolean-string", &"no".into()), Some("false".into()));
        assert_eq!(f.format("boolean-string", &FormatValue::from(1)), Some("true".into()));
        assert_eq!(f.format("boolean-string", &FormatValue::from(2)), Some("false".into()));
    }

    #[test]
    fn test_unparseable_value() {
        assert_eq!(utc().format("date-time", &"not a date".into()), None);
        assert_eq!(utc().format("date-time", &true.into()), None);
    }

    #[test]
    fn test_invalid_offset_rejected() {
        let config = FormatConfig {
            naive_offset_minutes: 24 * 60,
        };
        assert!(SchemaFormatter::new(&config).is_err());
    }
}
