//! # オーケストレータ エラー型
//!
//! 全コンポーネントのエラーはこの型に変換され、ワーカーの境界で
//! 1つの [`JobError`](sealrun_types::JobError) として記録される。

use sealrun_crypto::CryptoError;
use sealrun_transport::TransportError;
use sealrun_types::{FaultKind, JobErrorKind};

/// オーケストレータのエラー型。
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// 実行環境に到達できない、または接続が失われた
    #[error("接続エラー: {0}")]
    Connect(String),
    /// 読み取りが途中で終了した
    #[error("読み取りが途中で終了しました: {got}/{expected} バイト")]
    ShortRead { expected: usize, got: usize },
    /// ワイヤ交換が不正
    #[error("プロトコルエラー: {0}")]
    Protocol(String),
    /// 復号・認証の失敗（親側またはエンクレーブ側）
    #[error("認証エラー: {0}")]
    Authentication(String),
    /// Attestation Documentが検証者に拒否された
    #[error("Attestationが拒否されました: {0}")]
    AttestationRejected(String),
    /// イメージの取得に失敗
    #[error("イメージ取得に失敗: {0}")]
    ImagePull(String),
    /// 実行環境の起動・接続待機が上限を超えた
    #[error("実行環境の起動に失敗: {0}")]
    EnvironmentStart(String),
    /// エンクレーブがワークロードを起動できなかった
    #[error("ワークロードの起動に失敗: {0}")]
    Compute(String),
    /// ジョブがキャンセルされた
    #[error("ジョブはキャンセルされました: {0}")]
    Cancelled(String),
    /// モジュール記述子または環境指定が不正
    #[error("不正なモジュール: {0}")]
    InvalidModule(String),
    /// 設定が不正
    #[error("設定エラー: {0}")]
    Config(String),
    /// 外部サービス（ジョブサービス、バンドル取得）の失敗
    #[error("外部サービスとの通信に失敗: {0}")]
    Upstream(String),
    /// 分類不能なエラー
    #[error("予期しないエラー: {0}")]
    Unexpected(String),
}

impl OrchestratorError {
    /// ジョブに記録するエラー分類。
    pub fn kind(&self) -> JobErrorKind {
        match self {
            OrchestratorError::Connect(_) => JobErrorKind::Connect,
            OrchestratorError::ShortRead { .. } => JobErrorKind::ShortRead,
            OrchestratorError::Protocol(_) => JobErrorKind::Protocol,
            OrchestratorError::Authentication(_) | OrchestratorError::AttestationRejected(_) => {
                JobErrorKind::Authentication
            }
            OrchestratorError::ImagePull(_) => JobErrorKind::ImagePull,
            OrchestratorError::EnvironmentStart(_) => JobErrorKind::EnvironmentStart,
            OrchestratorError::Compute(_) => JobErrorKind::Compute,
            OrchestratorError::Cancelled(_) => JobErrorKind::Cancelled,
            OrchestratorError::InvalidModule(_) => JobErrorKind::InvalidModule,
            OrchestratorError::Config(_)
            | OrchestratorError::Upstream(_)
            | OrchestratorError::Unexpected(_) => JobErrorKind::Unexpected,
        }
    }

    /// トップレベルのリトライ対象か。
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            OrchestratorError::AttestationRejected(_)
                | OrchestratorError::Compute(_)
                | OrchestratorError::Cancelled(_)
                | OrchestratorError::InvalidModule(_)
                | OrchestratorError::Config(_)
        )
    }

    /// 接続を再利用できなくなるエラーか。
    ///
    /// エンクレーブが明示的に拒否した認証エラーなどでは、フレーム境界は保たれている。
    pub fn breaks_channel(&self) -> bool {
        matches!(
            self,
            OrchestratorError::Connect(_)
                | OrchestratorError::ShortRead { .. }
                | OrchestratorError::Protocol(_)
                | OrchestratorError::Cancelled(_)
                | OrchestratorError::Unexpected(_)
        )
    }

    /// エンクレーブの拒否応答（nack）から変換する。
    pub fn from_fault(op: &str, kind: FaultKind, detail: String) -> Self {
        let detail = format!("{op}: {detail}");
        match kind {
            FaultKind::Authentication => OrchestratorError::Authentication(detail),
            FaultKind::Protocol => OrchestratorError::Protocol(detail),
            FaultKind::Compute => OrchestratorError::Compute(detail),
            FaultKind::Internal => OrchestratorError::Unexpected(detail),
        }
    }
}

impl From<TransportError> for OrchestratorError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Connect { .. } => OrchestratorError::Connect(e.to_string()),
            TransportError::Io(_) | TransportError::Closed | TransportError::Timeout { .. } => {
                OrchestratorError::Connect(e.to_string())
            }
            TransportError::ShortRead { expected, partial } => OrchestratorError::ShortRead {
                expected,
                got: partial.len(),
            },
            TransportError::Protocol(_) | TransportError::TooLarge { .. } => {
                OrchestratorError::Protocol(e.to_string())
            }
            TransportError::Cancelled => OrchestratorError::Cancelled(e.to_string()),
            TransportError::Unsupported(_) => OrchestratorError::Config(e.to_string()),
        }
    }
}

impl From<CryptoError> for OrchestratorError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::AuthenticationError => OrchestratorError::Authentication(e.to_string()),
            CryptoError::InvalidKeyMaterial(_) | CryptoError::EcdhError => {
                OrchestratorError::Protocol(e.to_string())
            }
            CryptoError::HkdfError(_) | CryptoError::EncryptError => {
                OrchestratorError::Unexpected(e.to_string())
            }
        }
    }
}
