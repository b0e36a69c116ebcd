//! # 進捗レポーター
//!
//! ジョブの粗い進捗（割合 + メッセージ）を外部の観測者に通知する。
//!
//! - 通知はfire-and-forget。シンクがジョブをブロック・失敗させることはない
//! - 同一試行内で割合は単調非減少。新しい試行の開始でリセットされる

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;

use sealrun_types::{JobId, Progress};

/// 進捗通知イベント。
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressEvent {
    pub job_id: JobId,
    #[serde(flatten)]
    pub progress: Progress,
}

/// 進捗の通知先。
///
/// 実装は呼び出し元をブロックしてはならない（ネットワーク送信は別タスクに逃がす）。
pub trait ProgressSink: Send + Sync {
    fn report(&self, event: &ProgressEvent);
}

/// tracingに出力するシンク。
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl ProgressSink for TracingSink {
    fn report(&self, event: &ProgressEvent) {
        tracing::info!(
            job_id = %event.job_id,
            attempt = event.progress.attempt,
            percent = event.progress.percent,
            "{}",
            event.progress.message
        );
    }
}

/// 外部の状態受信エンドポイントにJSONをPOSTするシンク。
///
/// 送信は `tokio::spawn` で切り離し、失敗は警告ログのみ。
#[derive(Debug, Clone)]
pub struct HttpStatusSink {
    client: reqwest::Client,
    url: String,
}

impl HttpStatusSink {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

impl ProgressSink for HttpStatusSink {
    fn report(&self, event: &ProgressEvent) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(url = %self.url, "tokioランタイム外のため進捗送信をスキップ");
            return;
        };
        let client = self.client.clone();
        let url = self.url.clone();
        let event = event.clone();
        handle.spawn(async move {
            match client.post(&url).json(&event).send().await {
                Ok(resp) if resp.status().is_success() => {}
                Ok(resp) => {
                    tracing::warn!(url = %url, status = %resp.status(), "進捗送信が拒否されました");
                }
                Err(e) => tracing::warn!(url = %url, error = %e, "進捗送信に失敗"),
            }
        });
    }
}

/// 有界mpscチャネルに流すシンク。満杯の場合は破棄する。
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<ProgressEvent>,
}

impl ChannelSink {
    /// 容量 `capacity` のシンクと受信側を作成する。
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<ProgressEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

impl ProgressSink for ChannelSink {
    fn report(&self, event: &ProgressEvent) {
        if let Err(e) = self.tx.try_send(event.clone()) {
            tracing::debug!(job_id = %event.job_id, error = %e, "進捗イベントを破棄");
        }
    }
}

// ---------------------------------------------------------------------------
// Reporter
// ---------------------------------------------------------------------------

/// 1ジョブ分の進捗を管理し、登録済みシンクに配信する。
pub struct Reporter {
    job_id: JobId,
    sinks: Vec<Arc<dyn ProgressSink>>,
    attempt: u32,
    last_percent: u8,
}

impl Reporter {
    pub fn new(job_id: JobId, sinks: Vec<Arc<dyn ProgressSink>>) -> Self {
        Self {
            job_id,
            sinks,
            attempt: 0,
            last_percent: 0,
        }
    }

    /// 新しい試行を開始する。割合の下限がリセットされる。
    pub fn begin_attempt(&mut self, attempt: u32) {
        self.attempt = attempt;
        self.last_percent = 0;
    }

    /// 進捗を通知し、実際に通知した値を返す。
    ///
    /// 直前より小さい割合は直前の値に切り上げる。
    pub fn report(&mut self, percent: u8, message: impl Into<String>) -> Progress {
        let percent = percent.min(100).max(self.last_percent);
        self.last_percent = percent;
        let progress = Progress {
            attempt: self.attempt,
            percent,
            message: message.into(),
        };
        let event = ProgressEvent {
            job_id: self.job_id,
            progress: progress.clone(),
        };
        for sink in &self.sinks {
            sink.report(&event);
        }
        progress
    }

    /// 現在の割合を維持したまま通知する（失敗時など）。
    pub fn report_current(&mut self, message: impl Into<String>) -> Progress {
        self.report(self.last_percent, message)
    }
}
