//! WebSocket 推送通道实现
//!
//! 功能包括：
//! - 建立 WebSocket 连接并持续读取推送帧
//! - 上行帧发送（如坐席输入状态）
//! - 断线后按退避策略自动重连
//! - 通道生命周期事件（Connected/Disconnected/Reconnected）

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{LiveDeskSDKError, Result};
use crate::push::backoff::ReconnectBackoff;
use crate::push::{parse_frame, OutboundFrame, PushChannel, PushEvent};

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// WebSocket 推送通道
pub struct WsPushChannel {
    url: Url,
    sender: broadcast::Sender<PushEvent>,
    /// 每次 start 时新建，stop 时丢弃
    outbound_tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
    backoff: Arc<ReconnectBackoff>,
    running: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl WsPushChannel {
    pub fn new(url: Url, buffer_size: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer_size);
        Self {
            url,
            sender,
            outbound_tx: Mutex::new(None),
            backoff: Arc::new(ReconnectBackoff::default()),
            running: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
        }
    }

    /// 收发循环，直到连接断开
    async fn pump_until_closed(
        ws_stream: WsStream,
        sender: &broadcast::Sender<PushEvent>,
        outbound_rx: &mut mpsc::UnboundedReceiver<String>,
        running: &AtomicBool,
    ) {
        let (mut write, mut read) = ws_stream.split();

        while running.load(Ordering::SeqCst) {
            tokio::select! {
                frame = read.next() => match frame {
                    Some(Ok(Message::Text(text))) => match parse_frame(&text) {
                        Ok(Some(event)) => {
                            let _ = sender.send(event);
                        }
                        Ok(None) => {}
                        Err(e) => {
                            debug!("丢弃无法解析的推送帧: {}", e);
                        }
                    },
                    Some(Ok(Message::Ping(payload))) => {
                        if write.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("🔄 WebSocket 连接已关闭");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("⚠️ WebSocket 读取错误: {}", e);
                        break;
                    }
                },
                Some(text) = outbound_rx.recv() => {
                    if write.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    async fn run_loop(
        url: Url,
        sender: broadcast::Sender<PushEvent>,
        mut outbound_rx: mpsc::UnboundedReceiver<String>,
        backoff: Arc<ReconnectBackoff>,
        running: Arc<AtomicBool>,
    ) {
        let mut ever_connected = false;

        while running.load(Ordering::SeqCst) {
            if let Err(throttled) = backoff.check_reconnect() {
                tokio::time::sleep(throttled.wait).await;
                continue;
            }
            backoff.record_attempt();

            let ws_stream = match connect_async(url.as_str()).await {
                Ok((stream, _)) => stream,
                Err(e) => {
                    warn!("❌ WebSocket 连接失败: {}", e);
                    continue;
                }
            };
            info!("✅ WebSocket 推送通道已建立: {}", url);
            backoff.record_success();

            if ever_connected {
                let _ = sender.send(PushEvent::Reconnected);
            } else {
                ever_connected = true;
                let _ = sender.send(PushEvent::Connected);
            }

            // 断线期间积压的上行帧（输入状态）早已过时，直接清掉
            while outbound_rx.try_recv().is_ok() {}

            Self::pump_until_closed(ws_stream, &sender, &mut outbound_rx, &running).await;

            if running.load(Ordering::SeqCst) {
                let _ = sender.send(PushEvent::Disconnected);
            }
        }
    }
}

#[async_trait]
impl PushChannel for WsPushChannel {
    async fn start(&self) -> Result<broadcast::Receiver<PushEvent>> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(LiveDeskSDKError::InvalidOperation(
                "推送通道已在运行".to_string(),
            ));
        }
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        *self.outbound_tx.lock().await = Some(outbound_tx);

        let receiver = self.sender.subscribe();
        let handle = tokio::spawn(Self::run_loop(
            self.url.clone(),
            self.sender.clone(),
            outbound_rx,
            self.backoff.clone(),
            self.running.clone(),
        ));
        *self.task.lock().await = Some(handle);
        info!("推送通道已启动: {}", self.url);
        Ok(receiver)
    }

    async fn send(&self, frame: OutboundFrame) -> Result<()> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(LiveDeskSDKError::NotConnected);
        }
        match self.outbound_tx.lock().await.as_ref() {
            Some(tx) => tx
                .send(frame.encode())
                .map_err(|_| LiveDeskSDKError::NotConnected),
            None => Err(LiveDeskSDKError::NotConnected),
        }
    }

    async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.outbound_tx.lock().await.take();
        if let Some(handle) = self.task.lock().await.take() {
            handle.abort();
        }
        info!("推送通道已停止");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_double_start_rejected() {
        let url = Url::parse("ws://127.0.0.1:1/socket").unwrap();
        let channel = WsPushChannel::new(url, 16);

        assert!(channel.start().await.is_ok());
        let err = channel.start().await.unwrap_err();
        assert!(matches!(err, LiveDeskSDKError::InvalidOperation(_)));
        channel.stop().await;
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let url = Url::parse("ws://127.0.0.1:1/socket").unwrap();
        let channel = WsPushChannel::new(url, 16);

        // 登出再登录会经历 start → stop → start，通道必须可重启
        assert!(channel.start().await.is_ok());
        channel.stop().await;
        assert!(channel.start().await.is_ok());
        assert!(channel
            .send(OutboundFrame::Typing { conversation_id: 1 })
            .await
            .is_ok());
        channel.stop().await;
    }

    #[tokio::test]
    async fn test_send_before_start_rejected() {
        let url = Url::parse("ws://127.0.0.1:1/socket").unwrap();
        let channel = WsPushChannel::new(url, 16);

        let err = channel
            .send(OutboundFrame::Typing { conversation_id: 1 })
            .await
            .unwrap_err();
        assert!(matches!(err, LiveDeskSDKError::NotConnected));
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let url = Url::parse("ws://127.0.0.1:1/socket").unwrap();
        let channel = WsPushChannel::new(url, 16);
        channel.stop().await;
        channel.stop().await;
    }
}
