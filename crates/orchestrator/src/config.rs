//! # オーケストレータ設定
//!
//! 構築時に明示的に渡す設定。環境変数はCLIバイナリのみが読む。
//! 時間は全てミリ秒で保持し、アクセサで [`Duration`] に変換する。

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::OrchestratorError;

/// 実行モード。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// 隔離実行環境（vsock）。イメージはバイト列として転送する。
    #[default]
    Enclave,
    /// 非隔離の直接実行（TCP）。イメージはローカルエンジンに残し参照のみ渡す。
    Direct,
}

/// トップレベルのリトライ方針。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// 初回試行後のリトライ上限。`None` は無制限。
    pub max_retries: Option<u32>,
    /// リトライ前の待機時間（ミリ秒）
    pub backoff_ms: u64,
}

impl RetryPolicy {
    /// `attempt` 回目（1始まり）の失敗後にリトライを続けるか。
    pub fn allows_retry_after(&self, attempt: u32) -> bool {
        match self.max_retries {
            None => true,
            Some(max) => attempt <= max,
        }
    }

    /// リトライ前の待機時間。
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

/// エグゼキュータイメージの置き換え規則。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorSubstitution {
    /// 置き換え対象のイメージ参照
    pub identity: String,
    /// 置き換え後のイメージ参照
    pub substitute: String,
}

/// レジストリ設定。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrySettings {
    /// ログイン先レジストリ。`None` の場合はイメージ参照から推定する。
    pub host: Option<String>,
}

/// 隔離実行環境のリソース指定。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnclaveResources {
    /// エンクレーブイメージファイル（EIF）のパス
    pub eif_path: String,
    /// vCPU数
    pub cpu_count: u32,
    /// メモリ（MiB）
    pub memory_mib: u64,
    /// 固定CID（`None` はコントロールプレーンが割り当てる）
    pub cid: Option<u32>,
    /// エンクレーブ側の制御ポート
    pub port: u32,
}

impl Default for EnclaveResources {
    fn default() -> Self {
        Self {
            eif_path: "/opt/sealrun/enclave.eif".to_string(),
            cpu_count: 2,
            memory_mib: 4096,
            cid: None,
            port: 5000,
        }
    }
}

/// オーケストレータ設定。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// 実行モード
    pub mode: ExecutionMode,
    /// リトライ方針
    pub retry: RetryPolicy,
    /// チャンク単位の送受信タイムアウト（ミリ秒）
    pub io_timeout_ms: u64,
    /// ワークロード実行完了を待つ上限（ミリ秒）
    pub compute_timeout_ms: u64,
    /// 接続待機の試行回数
    pub connect_attempts: u32,
    /// 接続待機の間隔（ミリ秒）
    pub connect_interval_ms: u64,
    /// アドレス待機のポーリング回数
    pub poll_attempts: u32,
    /// アドレス待機のポーリング間隔（ミリ秒）
    pub poll_interval_ms: u64,
    /// コントロールプレーン呼び出し1回あたりの上限（ミリ秒）
    pub control_plane_timeout_ms: u64,
    /// 外部HTTP呼び出しのタイムアウト（ミリ秒）
    pub http_timeout_ms: u64,
    /// 受信を許可するバルクの最大サイズ
    pub max_bulk_size: u64,
    /// エグゼキュータイメージの置き換え
    pub executor: Option<ExecutorSubstitution>,
    /// レジストリ設定
    pub registry: RegistrySettings,
    /// 隔離実行環境のリソース
    pub enclave: EnclaveResources,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::Enclave,
            retry: RetryPolicy {
                max_retries: None,
                backoff_ms: 1_000,
            },
            io_timeout_ms: 30_000,
            compute_timeout_ms: 3_600_000,
            connect_attempts: 30,
            connect_interval_ms: 1_000,
            poll_attempts: 60,
            poll_interval_ms: 1_000,
            control_plane_timeout_ms: 120_000,
            http_timeout_ms: 120_000,
            max_bulk_size: 16 * 1024 * 1024 * 1024,
            executor: None,
            registry: RegistrySettings::default(),
            enclave: EnclaveResources::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    pub fn compute_timeout(&self) -> Duration {
        Duration::from_millis(self.compute_timeout_ms)
    }

    pub fn connect_interval(&self) -> Duration {
        Duration::from_millis(self.connect_interval_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn control_plane_timeout(&self) -> Duration {
        Duration::from_millis(self.control_plane_timeout_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }

    /// 外部サービス共通のHTTPクライアントを構築する。
    ///
    /// 全ての要求に [`Self::http_timeout`] が適用される。
    pub fn http_client(&self) -> Result<reqwest::Client, OrchestratorError> {
        reqwest::Client::builder()
            .timeout(self.http_timeout())
            .build()
            .map_err(|e| OrchestratorError::Config(format!("HTTPクライアントの構築に失敗: {e}")))
    }
}
