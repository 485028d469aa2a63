//! HTTP 网关模块
//!
//! 功能包括：
//! - 工作台后端的 HTTP 接口封装（登录、会话快照、消息、认领等）
//! - 基于 Cookie 的会话保持
//! - 超时配置和错误分类（401/403 → 认证错误）
//!
//! `DeskGateway` trait 是同步引擎与网络之间的接缝，测试用 Mock 替换。

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use crate::entities::{AgentSession, Conversation, DashboardSettings, Message};
use crate::error::{LiveDeskSDKError, Result};
use crate::utils::now_ts;

/// HTTP 客户端配置
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// 连接超时（秒）
    pub connect_timeout_secs: Option<u64>,
    /// 请求超时（秒）
    pub request_timeout_secs: Option<u64>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: Some(10),
            request_timeout_secs: Some(10),
        }
    }
}

/// 工作台后端网关抽象
#[async_trait]
pub trait DeskGateway: Send + Sync {
    /// 坐席登录，返回服务端确认的会话信息
    async fn login(&self, username: &str, password: &str) -> Result<AgentSession>;

    /// 坐席登出
    async fn logout(&self) -> Result<()>;

    /// 拉取会话快照（当前坐席可见的全量列表）
    async fn fetch_conversations(&self) -> Result<Vec<Conversation>>;

    /// 拉取指定会话的消息历史
    async fn fetch_messages(&self, conversation_id: u64) -> Result<Vec<Message>>;

    /// 发送坐席消息，返回服务端回显的消息文本（如有）
    async fn send_chat(&self, conversation_id: u64, message: &str) -> Result<Option<String>>;

    /// 认领会话
    async fn handoff(&self, conversation_id: u64) -> Result<()>;

    /// 把会话交还给 AI
    async fn handback_to_ai(&self, conversation_id: u64) -> Result<()>;

    /// 探测会话对当前坐席是否可见
    async fn check_visibility(&self, conversation_id: u64) -> Result<bool>;

    /// 获取工作台设置
    async fn fetch_settings(&self) -> Result<DashboardSettings>;

    /// 更新工作台设置
    async fn update_settings(&self, settings: &DashboardSettings) -> Result<()>;
}

/// 基于 reqwest 的网关实现
pub struct DeskHttpClient {
    base_url: String,
    client: reqwest::Client,
}

impl DeskHttpClient {
    pub fn new(server_url: &str, config: &HttpClientConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder().cookie_store(true);
        if let Some(secs) = config.connect_timeout_secs {
            builder = builder.connect_timeout(Duration::from_secs(secs));
        }
        if let Some(secs) = config.request_timeout_secs {
            builder = builder.timeout(Duration::from_secs(secs));
        }
        let client = builder
            .build()
            .map_err(|e| LiveDeskSDKError::Config(format!("HTTP 客户端构建失败: {}", e)))?;

        Ok(Self {
            base_url: server_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// 统一的状态码分类
    async fn classify_status(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED
            || status == reqwest::StatusCode::FORBIDDEN
        {
            return Err(LiveDeskSDKError::Auth(format!(
                "服务端返回 {}",
                status
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LiveDeskSDKError::ServerRejected(format!(
                "{}: {}",
                status, body
            )));
        }
        Ok(response)
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    response: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VisibilityResponse {
    #[serde(default)]
    visible: bool,
}

#[async_trait]
impl DeskGateway for DeskHttpClient {
    async fn login(&self, username: &str, password: &str) -> Result<AgentSession> {
        debug!("登录: {}", username);
        let response = self
            .client
            .post(self.url("/login"))
            .json(&json!({ "username": username, "password": password }))
            .send()
            .await?;
        let response = Self::classify_status(response).await.map_err(|e| {
            // 登录接口的 401 是凭据错误而不是会话过期
            match e {
                LiveDeskSDKError::Auth(_) => {
                    LiveDeskSDKError::Auth("用户名或密码错误".to_string())
                }
                other => other,
            }
        })?;

        #[derive(Deserialize)]
        struct LoginResponse {
            username: String,
        }
        let body: LoginResponse = response.json().await?;
        info!("✅ 登录成功: {}", body.username);
        Ok(AgentSession {
            username: body.username,
            logged_in_at: now_ts(),
        })
    }

    async fn logout(&self) -> Result<()> {
        let response = self.client.post(self.url("/logout")).send().await?;
        Self::classify_status(response).await?;
        Ok(())
    }

    async fn fetch_conversations(&self) -> Result<Vec<Conversation>> {
        let response = self.client.get(self.url("/conversations")).send().await?;
        let response = Self::classify_status(response).await?;
        let conversations: Vec<Conversation> = response.json().await?;
        debug!("📥 快照: {} 个会话", conversations.len());
        Ok(conversations)
    }

    async fn fetch_messages(&self, conversation_id: u64) -> Result<Vec<Message>> {
        let response = self
            .client
            .get(self.url("/messages"))
            .query(&[("conversation_id", conversation_id)])
            .send()
            .await?;
        let response = Self::classify_status(response).await?;
        Ok(response.json().await?)
    }

    async fn send_chat(&self, conversation_id: u64, message: &str) -> Result<Option<String>> {
        let response = self
            .client
            .post(self.url("/chat"))
            .json(&json!({
                "conversation_id": conversation_id,
                "message": message,
            }))
            .send()
            .await?;
        let response = Self::classify_status(response).await?;
        let body: ChatResponse = response.json().await?;
        Ok(body.response)
    }

    async fn handoff(&self, conversation_id: u64) -> Result<()> {
        let response = self
            .client
            .post(self.url("/handoff"))
            .json(&json!({ "conversation_id": conversation_id }))
            .send()
            .await?;
        Self::classify_status(response).await?;
        Ok(())
    }

    async fn handback_to_ai(&self, conversation_id: u64) -> Result<()> {
        let response = self
            .client
            .post(self.url("/handback-to-ai"))
            .json(&json!({ "conversation_id": conversation_id }))
            .send()
            .await?;
        Self::classify_status(response).await?;
        Ok(())
    }

    async fn check_visibility(&self, conversation_id: u64) -> Result<bool> {
        let response = self
            .client
            .get(self.url("/check-visibility"))
            .query(&[("conversation_id", conversation_id)])
            .send()
            .await?;
        let response = Self::classify_status(response).await?;
        let body: VisibilityResponse = response.json().await?;
        Ok(body.visible)
    }

    async fn fetch_settings(&self) -> Result<DashboardSettings> {
        let response = self.client.get(self.url("/settings")).send().await?;
        let response = Self::classify_status(response).await?;
        Ok(response.json().await?)
    }

    async fn update_settings(&self, settings: &DashboardSettings) -> Result<()> {
        let response = self
            .client
            .post(self.url("/settings"))
            .json(settings)
            .send()
            .await?;
        Self::classify_status(response).await?;
        Ok(())
    }
}
