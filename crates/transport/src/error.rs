//! # Transport エラー型

use std::time::Duration;

/// Transportエラー型。
///
/// Transportは自身でリトライしない。分類とリトライ方針はオーケストレータが持つ。
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// 接続先に到達できない
    #[error("{addr} への接続に失敗: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    /// 接続済みストリームでのIOエラー
    #[error("IOエラー: {0}")]
    Io(#[from] std::io::Error),
    /// 指定バイト数を読み切る前に接続が閉じた
    #[error("読み取りが途中で終了しました: {got}/{expected} バイト", got = .partial.len())]
    ShortRead {
        expected: usize,
        /// 途中まで読めたバイト列
        partial: Vec<u8>,
    },
    /// ワイヤ交換が不正（パース失敗、予期しない応答）
    #[error("プロトコルエラー: {0}")]
    Protocol(String),
    /// フレーム・バルクの宣言サイズが上限を超えている
    #[error("宣言サイズが上限を超えています: {size} bytes (上限: {limit} bytes)")]
    TooLarge { size: u64, limit: u64 },
    /// 操作がタイムアウトした
    #[error("{op} がタイムアウトしました（{timeout:?}）")]
    Timeout { op: &'static str, timeout: Duration },
    /// ジョブのキャンセルによりチャネルが閉じられた
    #[error("チャネルはキャンセルされました")]
    Cancelled,
    /// クローズ済みチャネルへの操作
    #[error("チャネルはクローズ済みです")]
    Closed,
    /// このビルドで未対応のアドレス種別
    #[error("未対応のアドレス種別: {0}")]
    Unsupported(String),
}

impl TransportError {
    /// 接続自体が使えなくなったエラーか（再利用不可）。
    pub fn breaks_channel(&self) -> bool {
        !matches!(self, TransportError::TooLarge { .. })
    }
}
