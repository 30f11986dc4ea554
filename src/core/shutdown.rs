//! 取消信号处理
//!
//! Ctrl+C / SIGTERM 触发取消令牌；Run Manager 只在两次尝试之间检查令牌，
//! 不会打断正在进行的模型调用或工具调用。

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// 取消原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl+C
    UserInitiated,
    /// SIGTERM
    Signal,
}

/// 取消信号管理器：持有运行共享的取消令牌
#[derive(Clone)]
pub struct ShutdownManager {
    token: CancellationToken,
    reason_tx: broadcast::Sender<ShutdownReason>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (reason_tx, _) = broadcast::channel(1);
        Self {
            token: CancellationToken::new(),
            reason_tx,
        }
    }

    /// 交给 Run Manager 的取消令牌
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn shutdown(&self, reason: ShutdownReason) {
        let _ = self.reason_tx.send(reason);
        self.token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownReason> {
        self.reason_tx.subscribe()
    }

    /// 安装系统信号处理器 (Ctrl+C, SIGTERM)
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                tracing::warn!("Received Ctrl+C, cancelling run after the current attempt");
                manager.shutdown(ShutdownReason::UserInitiated);
            }
        });

        #[cfg(unix)]
        {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    tracing::warn!("Received SIGTERM, cancelling run after the current attempt");
                    manager.shutdown(ShutdownReason::Signal);
                }
            });
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_manager_new() {
        let manager = ShutdownManager::new();
        assert!(!manager.is_shutdown());
    }

    #[test]
    fn test_shutdown_cancels_token() {
        let manager = ShutdownManager::new();
        let token = manager.token();
        assert!(!token.is_cancelled());
        manager.shutdown(ShutdownReason::UserInitiated);
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_shutdown_reason_broadcast() {
        let manager = ShutdownManager::new();
        let mut rx = manager.subscribe();
        manager.shutdown(ShutdownReason::Signal);
        assert_eq!(rx.recv().await.unwrap(), ShutdownReason::Signal);
    }
}
