//! 时间与反序列化辅助工具
//!
//! 后端返回的时间戳格式不统一：快照接口吐 SQLite 的
//! `YYYY-MM-DD HH:MM:SS`，推送事件里偶尔直接是 RFC 3339。
//! 这里统一做宽松解析，解析失败按 None 处理而不是报错。

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer};
use std::time::{SystemTime, UNIX_EPOCH};

/// 当前 UNIX 时间戳（秒）
pub fn now_ts() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// 宽松解析服务端时间戳
///
/// 依次尝试：RFC 3339 → `YYYY-MM-DD HH:MM:SS`（按 UTC 处理）。
pub fn parse_server_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return Some(DateTime::from_naive_utc_and_offset(naive, Utc));
    }
    None
}

/// serde 辅助：宽松反序列化可选时间戳字段
pub fn de_opt_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.as_deref().and_then(parse_server_timestamp))
}

/// 宽松提取 u64（ID 可能是数字也可能是字符串，老接口两种都出现过）
pub fn value_to_u64(value: &serde_json::Value) -> Option<u64> {
    match value {
        serde_json::Value::Number(n) => n.as_u64(),
        serde_json::Value::String(s) => s.parse::<u64>().ok(),
        _ => None,
    }
}

/// serde 辅助：宽松反序列化 u64 ID 字段
pub fn de_u64_lenient<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    value_to_u64(&value)
        .ok_or_else(|| serde::de::Error::custom(format!("无效的 ID: {}", value)))
}
