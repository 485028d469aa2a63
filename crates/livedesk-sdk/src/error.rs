use std::fmt;

/// SDK 统一错误类型
///
/// 错误分类：
/// - 网络类（Network / Timeout）：可由下一个兜底轮询周期自愈，不立即重试
/// - 鉴权类（Auth）：会话失效，必须停止同步并回到未登录状态
/// - 业务拒绝类（ServerRejected）：服务端明确拒绝（如认领冲突），需回滚本地乐观状态
/// - 数据类（InvalidData）：响应 JSON 形状不符合预期
#[derive(Debug)]
pub enum LiveDeskSDKError {
    Network(String),
    Timeout(String),
    Auth(String),
    ServerRejected(String),
    InvalidData(String),
    Config(String),
    NotConnected,
    NotInitialized(String),
    ShuttingDown(String),
    InvalidOperation(String),
    Other(String),
}

impl fmt::Display for LiveDeskSDKError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LiveDeskSDKError::Network(e) => write!(f, "Network error: {}", e),
            LiveDeskSDKError::Timeout(e) => write!(f, "Timeout: {}", e),
            LiveDeskSDKError::Auth(e) => write!(f, "Authentication error: {}", e),
            LiveDeskSDKError::ServerRejected(e) => write!(f, "Server rejected: {}", e),
            LiveDeskSDKError::InvalidData(e) => write!(f, "Invalid data: {}", e),
            LiveDeskSDKError::Config(e) => write!(f, "Config error: {}", e),
            LiveDeskSDKError::NotConnected => write!(f, "Not connected"),
            LiveDeskSDKError::NotInitialized(e) => write!(f, "Not initialized: {}", e),
            LiveDeskSDKError::ShuttingDown(e) => write!(f, "Shutting down: {}", e),
            LiveDeskSDKError::InvalidOperation(e) => write!(f, "Invalid operation: {}", e),
            LiveDeskSDKError::Other(e) => write!(f, "Other error: {}", e),
        }
    }
}

impl std::error::Error for LiveDeskSDKError {}

impl From<reqwest::Error> for LiveDeskSDKError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            LiveDeskSDKError::Timeout(error.to_string())
        } else if error.is_decode() {
            LiveDeskSDKError::InvalidData(error.to_string())
        } else {
            LiveDeskSDKError::Network(error.to_string())
        }
    }
}

impl From<serde_json::Error> for LiveDeskSDKError {
    fn from(error: serde_json::Error) -> Self {
        LiveDeskSDKError::InvalidData(error.to_string())
    }
}

impl LiveDeskSDKError {
    /// 是否是鉴权错误（需要回到未登录状态并停止同步）
    pub fn is_auth(&self) -> bool {
        matches!(self, LiveDeskSDKError::Auth(_))
    }

    /// 是否可由下一个轮询周期自愈（网络抖动 / 超时 / 脏数据）
    ///
    /// 注意：ServerRejected 不算可重试 —— 那是业务层面的明确拒绝，
    /// 盲目重试只会重复触发冲突。
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LiveDeskSDKError::Network(_)
                | LiveDeskSDKError::Timeout(_)
                | LiveDeskSDKError::InvalidData(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, LiveDeskSDKError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = LiveDeskSDKError::Auth("session expired".to_string());
        assert_eq!(e.to_string(), "Authentication error: session expired");

        let e = LiveDeskSDKError::NotConnected;
        assert_eq!(e.to_string(), "Not connected");
    }

    #[test]
    fn test_error_classification() {
        assert!(LiveDeskSDKError::Auth("401".into()).is_auth());
        assert!(!LiveDeskSDKError::Network("down".into()).is_auth());

        assert!(LiveDeskSDKError::Network("down".into()).is_retryable());
        assert!(LiveDeskSDKError::Timeout("10s".into()).is_retryable());
        assert!(LiveDeskSDKError::InvalidData("bad json".into()).is_retryable());
        assert!(!LiveDeskSDKError::ServerRejected("conflict".into()).is_retryable());
        assert!(!LiveDeskSDKError::Auth("401".into()).is_retryable());
    }

    #[test]
    fn test_from_serde_json() {
        let err = serde_json::from_str::<serde_json::Value>("{bad").unwrap_err();
        let e: LiveDeskSDKError = err.into();
        assert!(matches!(e, LiveDeskSDKError::InvalidData(_)));
    }
}
