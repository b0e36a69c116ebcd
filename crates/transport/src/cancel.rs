//! # キャンセル通知
//!
//! ジョブのキャンセルをチャネル上の待機中操作に伝える一方向の通知。
//! `watch` チャネルで実装し、キャンセル後に開始された操作も即座に失敗する。

use std::sync::Arc;

use tokio::sync::watch;

/// キャンセルを発行する側。
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

/// キャンセルを待つ側。
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

/// 新しいキャンセルハンドルとトークンの組を作成する。
pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx: Arc::new(tx) }, CancelToken { rx })
}

impl CancelHandle {
    /// キャンセルを発行する。複数回呼んでも同じ。
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// キャンセル済みかどうか。
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

impl CancelToken {
    /// キャンセルされることのないトークン。
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        // 送信側を手放すと changed() がエラーを返し続けるため、値は false のまま固定される
        drop(tx);
        Self { rx }
    }

    /// キャンセル済みかどうか。
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// キャンセルされるまで待機する。
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancel_wakes_waiter() {
        let (handle, token) = cancel_pair();
        let waiter = tokio::spawn({
            let token = token.clone();
            async move { token.cancelled().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("キャンセルが伝わらない")
            .unwrap();
        assert!(token.is_cancelled());
        assert!(handle.is_cancelled());
    }

    #[tokio::test]
    async fn test_never_token() {
        let token = CancelToken::never();
        assert!(!token.is_cancelled());
        let r = tokio::time::timeout(Duration::from_millis(50), token.cancelled()).await;
        assert!(r.is_err());
    }
}
