//! # 隔離実行環境のライフサイクル管理
//!
//! 実行環境を起動し、アドレスが報告されるまでポーリングし、
//! 接続可能になるまで接続を繰り返す。いずれのループも回数で有界化され、
//! 上限を超えると [`OrchestratorError::EnvironmentStart`] になる。
//!
//! ## コントロールプレーン実装
//! - [`NitroCliControlPlane`] — `nitro-cli run-enclave` / `describe-enclaves`
//! - [`HttpControlPlane`] — HTTP API
//! - [`StaticControlPlane`] — 固定アドレス（開発・直接モード用）

use std::future::Future;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use sealrun_transport::{CancelToken, Channel, ChannelOptions, EnvironmentAddress, TransportError};

use crate::config::EnclaveResources;
use crate::error::OrchestratorError;

/// 実行環境の起動要求。
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnvironmentSpec {
    /// 実行するイメージの正規URI
    pub image_uri: String,
    /// リソース指定
    pub resources: EnclaveResources,
}

/// コントロールプレーン上の実行環境ハンドル。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentHandle {
    pub id: String,
}

/// 実行環境の状態。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvironmentStatus {
    /// まだアドレスが報告されていない
    Pending,
    /// アドレスが確定した
    Ready(EnvironmentAddress),
}

/// クラウドのコントロールプレーン。
#[async_trait::async_trait]
pub trait ControlPlane: Send + Sync {
    async fn create_environment(
        &self,
        spec: &EnvironmentSpec,
    ) -> Result<EnvironmentHandle, OrchestratorError>;

    async fn describe_environment(
        &self,
        handle: &EnvironmentHandle,
    ) -> Result<EnvironmentStatus, OrchestratorError>;
}

// ---------------------------------------------------------------------------
// StaticControlPlane
// ---------------------------------------------------------------------------

/// 既に起動済みの実行環境を指す固定アドレス。
#[derive(Debug, Clone)]
pub struct StaticControlPlane {
    address: EnvironmentAddress,
}

impl StaticControlPlane {
    pub fn new(address: EnvironmentAddress) -> Self {
        Self { address }
    }
}

#[async_trait::async_trait]
impl ControlPlane for StaticControlPlane {
    async fn create_environment(
        &self,
        _spec: &EnvironmentSpec,
    ) -> Result<EnvironmentHandle, OrchestratorError> {
        Ok(EnvironmentHandle {
            id: self.address.to_string(),
        })
    }

    async fn describe_environment(
        &self,
        _handle: &EnvironmentHandle,
    ) -> Result<EnvironmentStatus, OrchestratorError> {
        Ok(EnvironmentStatus::Ready(self.address.clone()))
    }
}

// ---------------------------------------------------------------------------
// NitroCliControlPlane
// ---------------------------------------------------------------------------

/// `nitro-cli run-enclave` の出力。
#[derive(Debug, Deserialize)]
struct RunEnclaveOutput {
    #[serde(rename = "EnclaveID")]
    enclave_id: String,
}

/// `nitro-cli describe-enclaves` の出力要素。
#[derive(Debug, Deserialize)]
struct DescribedEnclave {
    #[serde(rename = "EnclaveID")]
    enclave_id: String,
    #[serde(rename = "EnclaveCID", default)]
    enclave_cid: Option<u32>,
    #[serde(rename = "State", default)]
    state: String,
}

/// `nitro-cli` によるコントロールプレーン。
#[derive(Debug, Clone)]
pub struct NitroCliControlPlane {
    program: String,
    port: u32,
}

impl NitroCliControlPlane {
    /// エンクレーブ側の制御ポートを指定して作成する。
    pub fn new(port: u32) -> Self {
        Self {
            program: "nitro-cli".to_string(),
            port,
        }
    }

    async fn run(&self, args: &[String]) -> Result<Vec<u8>, OrchestratorError> {
        let output = tokio::process::Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                OrchestratorError::EnvironmentStart(format!("{} の実行に失敗: {e}", self.program))
            })?;
        if !output.status.success() {
            return Err(OrchestratorError::EnvironmentStart(format!(
                "{} {} が失敗しました ({}): {}",
                self.program,
                args.first().map(String::as_str).unwrap_or_default(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(output.stdout)
    }
}

/// `run-enclave` の引数を組み立てる。
fn run_enclave_args(resources: &EnclaveResources) -> Vec<String> {
    let mut args = vec![
        "run-enclave".to_string(),
        "--eif-path".to_string(),
        resources.eif_path.clone(),
        "--cpu-count".to_string(),
        resources.cpu_count.to_string(),
        "--memory".to_string(),
        resources.memory_mib.to_string(),
    ];
    if let Some(cid) = resources.cid {
        args.push("--enclave-cid".to_string());
        args.push(cid.to_string());
    }
    args
}

/// `describe-enclaves` の出力から対象エンクレーブの状態を判定する。
fn parse_described(
    stdout: &[u8],
    enclave_id: &str,
    port: u32,
) -> Result<EnvironmentStatus, OrchestratorError> {
    let enclaves: Vec<DescribedEnclave> = serde_json::from_slice(stdout).map_err(|e| {
        OrchestratorError::EnvironmentStart(format!("describe-enclavesの出力をパースできません: {e}"))
    })?;
    let Some(enclave) = enclaves.into_iter().find(|e| e.enclave_id == enclave_id) else {
        return Ok(EnvironmentStatus::Pending);
    };
    match (enclave.state.as_str(), enclave.enclave_cid) {
        ("RUNNING", Some(cid)) => Ok(EnvironmentStatus::Ready(EnvironmentAddress::Vsock { cid, port })),
        ("TERMINATING" | "TERMINATED", _) => Err(OrchestratorError::EnvironmentStart(format!(
            "エンクレーブが終了しています: {enclave_id} ({})",
            enclave.state
        ))),
        _ => Ok(EnvironmentStatus::Pending),
    }
}

#[async_trait::async_trait]
impl ControlPlane for NitroCliControlPlane {
    async fn create_environment(
        &self,
        spec: &EnvironmentSpec,
    ) -> Result<EnvironmentHandle, OrchestratorError> {
        let stdout = self.run(&run_enclave_args(&spec.resources)).await?;
        let out: RunEnclaveOutput = serde_json::from_slice(&stdout).map_err(|e| {
            OrchestratorError::EnvironmentStart(format!("run-enclaveの出力をパースできません: {e}"))
        })?;
        tracing::info!(enclave_id = %out.enclave_id, image = %spec.image_uri, "エンクレーブを起動");
        Ok(EnvironmentHandle { id: out.enclave_id })
    }

    async fn describe_environment(
        &self,
        handle: &EnvironmentHandle,
    ) -> Result<EnvironmentStatus, OrchestratorError> {
        let stdout = self.run(&["describe-enclaves".to_string()]).await?;
        parse_described(&stdout, &handle.id, self.port)
    }
}

// ---------------------------------------------------------------------------
// HttpControlPlane
// ---------------------------------------------------------------------------

/// `GET /environments/{id}` のレスポンス。
#[derive(Debug, Deserialize)]
struct DescribeResponse {
    #[serde(default)]
    address: Option<String>,
}

/// HTTP APIのコントロールプレーン。
///
/// - `POST {base}/environments` (`EnvironmentSpec`) → `{"id": "..."}`
/// - `GET {base}/environments/{id}` → `{"address": "vsock:16:5000" | null}`
#[derive(Debug, Clone)]
pub struct HttpControlPlane {
    client: reqwest::Client,
    base_url: String,
}

impl HttpControlPlane {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

fn http_err(e: reqwest::Error) -> OrchestratorError {
    OrchestratorError::EnvironmentStart(format!("コントロールプレーンとの通信に失敗: {e}"))
}

#[async_trait::async_trait]
impl ControlPlane for HttpControlPlane {
    async fn create_environment(
        &self,
        spec: &EnvironmentSpec,
    ) -> Result<EnvironmentHandle, OrchestratorError> {
        let resp = self
            .client
            .post(format!("{}/environments", self.base_url))
            .json(spec)
            .send()
            .await
            .map_err(http_err)?
            .error_for_status()
            .map_err(http_err)?;
        resp.json().await.map_err(http_err)
    }

    async fn describe_environment(
        &self,
        handle: &EnvironmentHandle,
    ) -> Result<EnvironmentStatus, OrchestratorError> {
        let resp: DescribeResponse = self
            .client
            .get(format!("{}/environments/{}", self.base_url, handle.id))
            .send()
            .await
            .map_err(http_err)?
            .error_for_status()
            .map_err(http_err)?
            .json()
            .await
            .map_err(http_err)?;
        match resp.address {
            None => Ok(EnvironmentStatus::Pending),
            Some(addr) => addr
                .parse()
                .map(EnvironmentStatus::Ready)
                .map_err(OrchestratorError::EnvironmentStart),
        }
    }
}

// ---------------------------------------------------------------------------
// 接続
// ---------------------------------------------------------------------------

/// 実行環境への接続を確立する。
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        addr: &EnvironmentAddress,
        options: ChannelOptions,
    ) -> Result<Channel, TransportError>;
}

/// ソケット（TCP / vsock）で接続する。
#[derive(Debug, Default, Clone, Copy)]
pub struct SocketConnector;

#[async_trait::async_trait]
impl Connector for SocketConnector {
    async fn connect(
        &self,
        addr: &EnvironmentAddress,
        options: ChannelOptions,
    ) -> Result<Channel, TransportError> {
        Channel::connect(addr, options).await
    }
}

/// ポーリング・接続ループの上限。
#[derive(Debug, Clone, Copy)]
pub struct LifecycleLimits {
    pub poll_attempts: u32,
    pub poll_interval: Duration,
    pub connect_attempts: u32,
    pub connect_interval: Duration,
    /// コントロールプレーン呼び出し1回あたりの上限
    pub call_timeout: Duration,
}

/// キャンセル可能な待機。
async fn pause(interval: Duration, cancel: &CancelToken) -> Result<(), OrchestratorError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(OrchestratorError::Cancelled("実行環境の待機中".to_string())),
        _ = tokio::time::sleep(interval) => Ok(()),
    }
}

/// 隔離実行環境のライフサイクルマネージャ。
pub struct EnclaveManager {
    control_plane: Arc<dyn ControlPlane>,
    connector: Arc<dyn Connector>,
    limits: LifecycleLimits,
}

impl EnclaveManager {
    pub fn new(
        control_plane: Arc<dyn ControlPlane>,
        connector: Arc<dyn Connector>,
        limits: LifecycleLimits,
    ) -> Self {
        Self {
            control_plane,
            connector,
            limits,
        }
    }

    /// コントロールプレーン呼び出しをキャンセルと呼び出し上限に対して待つ。
    ///
    /// 中断された呼び出しの future は破棄される（`nitro-cli` の子プロセスも終了する）。
    async fn control_call<T, F>(
        &self,
        op: &str,
        cancel: &CancelToken,
        call: F,
    ) -> Result<T, OrchestratorError>
    where
        F: Future<Output = Result<T, OrchestratorError>>,
    {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(OrchestratorError::Cancelled(format!("{op} の待機中"))),
            result = tokio::time::timeout(self.limits.call_timeout, call) => match result {
                Ok(result) => result,
                Err(_) => Err(OrchestratorError::EnvironmentStart(format!(
                    "{op} が {:?} 以内に応答しませんでした",
                    self.limits.call_timeout
                ))),
            },
        }
    }

    /// 実行環境を起動し、アドレスが報告されるまで一定間隔でポーリングする。
    pub async fn start(
        &self,
        spec: &EnvironmentSpec,
        cancel: &CancelToken,
    ) -> Result<EnvironmentAddress, OrchestratorError> {
        let handle = self
            .control_call(
                "create_environment",
                cancel,
                self.control_plane.create_environment(spec),
            )
            .await?;
        for poll in 1..=self.limits.poll_attempts {
            let status = self
                .control_call(
                    "describe_environment",
                    cancel,
                    self.control_plane.describe_environment(&handle),
                )
                .await?;
            match status {
                EnvironmentStatus::Ready(addr) => {
                    tracing::info!(environment = %handle.id, address = %addr, poll, "実行環境のアドレスを取得");
                    return Ok(addr);
                }
                EnvironmentStatus::Pending => {
                    tracing::debug!(environment = %handle.id, poll, "アドレス未確定");
                }
            }
            if poll < self.limits.poll_attempts {
                pause(self.limits.poll_interval, cancel).await?;
            }
        }
        Err(OrchestratorError::EnvironmentStart(format!(
            "{} 回のポーリングでアドレスが報告されませんでした: {}",
            self.limits.poll_attempts, handle.id
        )))
    }

    /// 接続できるまで一定間隔で接続を繰り返す。
    pub async fn connect_until_ready(
        &self,
        addr: &EnvironmentAddress,
        options: ChannelOptions,
    ) -> Result<Channel, OrchestratorError> {
        let cancel = options.cancel.clone();
        let mut last_error = String::new();
        for attempt in 1..=self.limits.connect_attempts {
            match self.connector.connect(addr, options.clone()).await {
                Ok(channel) => {
                    tracing::info!(address = %addr, attempt, "実行環境に接続");
                    return Ok(channel);
                }
                Err(TransportError::Cancelled) => {
                    return Err(TransportError::Cancelled.into());
                }
                Err(e @ TransportError::Unsupported(_)) => return Err(e.into()),
                Err(e) => {
                    tracing::debug!(address = %addr, attempt, error = %e, "接続待機中");
                    last_error = e.to_string();
                }
            }
            if attempt < self.limits.connect_attempts {
                pause(self.limits.connect_interval, &cancel).await?;
            }
        }
        Err(OrchestratorError::EnvironmentStart(format!(
            "{} 回の接続試行で実行環境が応答しませんでした ({addr}): {last_error}",
            self.limits.connect_attempts
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{HangingControlPlane, ScriptedConnector};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn limits(poll_attempts: u32, connect_attempts: u32) -> LifecycleLimits {
        LifecycleLimits {
            poll_attempts,
            poll_interval: Duration::from_millis(5),
            connect_attempts,
            connect_interval: Duration::from_millis(5),
            call_timeout: Duration::from_secs(5),
        }
    }

    fn spec() -> EnvironmentSpec {
        EnvironmentSpec {
            image_uri: "alpine@sha256:00".to_string(),
            resources: EnclaveResources::default(),
        }
    }

    /// 指定回数Pendingを返した後にReadyになるコントロールプレーン
    struct SlowControlPlane {
        pending: u32,
        polls: AtomicU32,
    }

    #[async_trait::async_trait]
    impl ControlPlane for SlowControlPlane {
        async fn create_environment(
            &self,
            _spec: &EnvironmentSpec,
        ) -> Result<EnvironmentHandle, OrchestratorError> {
            Ok(EnvironmentHandle { id: "i-1".to_string() })
        }

        async fn describe_environment(
            &self,
            _handle: &EnvironmentHandle,
        ) -> Result<EnvironmentStatus, OrchestratorError> {
            let n = self.polls.fetch_add(1, Ordering::SeqCst);
            if n < self.pending {
                Ok(EnvironmentStatus::Pending)
            } else {
                Ok(EnvironmentStatus::Ready(EnvironmentAddress::Vsock { cid: 16, port: 5000 }))
            }
        }
    }

    /// アドレス未確定の期間をポーリングで待つ
    #[tokio::test]
    async fn test_start_polls_until_ready() {
        let plane = Arc::new(SlowControlPlane {
            pending: 3,
            polls: AtomicU32::new(0),
        });
        let manager = EnclaveManager::new(plane.clone(), Arc::new(SocketConnector), limits(5, 1));
        let addr = manager.start(&spec(), &CancelToken::never()).await.unwrap();
        assert_eq!(addr, EnvironmentAddress::Vsock { cid: 16, port: 5000 });
        assert_eq!(plane.polls.load(Ordering::SeqCst), 4);
    }

    /// ポーリング上限を超えるとEnvironmentStart
    #[tokio::test]
    async fn test_start_poll_bound() {
        let plane = Arc::new(SlowControlPlane {
            pending: 10,
            polls: AtomicU32::new(0),
        });
        let manager = EnclaveManager::new(plane.clone(), Arc::new(SocketConnector), limits(3, 1));
        let err = manager.start(&spec(), &CancelToken::never()).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::EnvironmentStart(_)));
        assert_eq!(plane.polls.load(Ordering::SeqCst), 3);
    }

    /// 応答しない照会中でもキャンセルで速やかに終了する
    #[tokio::test]
    async fn test_start_cancelled_during_hung_describe() {
        let plane = Arc::new(HangingControlPlane::default());
        let limits = LifecycleLimits {
            call_timeout: Duration::from_secs(60),
            ..limits(5, 1)
        };
        let manager = EnclaveManager::new(plane.clone(), Arc::new(SocketConnector), limits);
        let (handle, cancel) = sealrun_transport::cancel_pair();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            handle.cancel();
        });

        let err = tokio::time::timeout(Duration::from_secs(2), manager.start(&spec(), &cancel))
            .await
            .expect("キャンセル後も照会を待ち続けている")
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Cancelled(_)), "{err:?}");
        assert_eq!(plane.describes(), 1);
    }

    /// 応答しない照会は呼び出し上限でEnvironmentStartになる
    #[tokio::test]
    async fn test_start_hung_describe_times_out() {
        let plane = Arc::new(HangingControlPlane::default());
        let limits = LifecycleLimits {
            call_timeout: Duration::from_millis(100),
            ..limits(5, 1)
        };
        let manager = EnclaveManager::new(plane, Arc::new(SocketConnector), limits);

        let err = tokio::time::timeout(
            Duration::from_secs(2),
            manager.start(&spec(), &CancelToken::never()),
        )
        .await
        .expect("呼び出し上限が効いていない")
        .unwrap_err();
        assert!(matches!(err, OrchestratorError::EnvironmentStart(_)), "{err:?}");
        assert!(err.is_retryable());
    }

    /// 接続失敗を上限まで繰り返す
    #[tokio::test]
    async fn test_connect_until_ready_bound() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = EnvironmentAddress::Tcp(listener.local_addr().unwrap().to_string());
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        let connector = Arc::new(ScriptedConnector::failing_first(3));
        let plane = Arc::new(StaticControlPlane::new(addr.clone()));

        let manager = EnclaveManager::new(plane.clone(), connector.clone(), limits(1, 5));
        assert!(manager
            .connect_until_ready(&addr, ChannelOptions::default())
            .await
            .is_ok());
        assert_eq!(connector.attempts(), 4);

        let connector = Arc::new(ScriptedConnector::failing_first(3));
        let manager = EnclaveManager::new(plane, connector.clone(), limits(1, 2));
        let err = manager
            .connect_until_ready(&addr, ChannelOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::EnvironmentStart(_)), "{err:?}");
        assert_eq!(connector.attempts(), 2);
    }

    #[test]
    fn test_run_enclave_args() {
        let resources = EnclaveResources {
            cid: Some(16),
            ..EnclaveResources::default()
        };
        let args = run_enclave_args(&resources);
        assert_eq!(args[0], "run-enclave");
        assert!(args.windows(2).any(|w| w == ["--enclave-cid", "16"]));
        assert!(args.windows(2).any(|w| w == ["--memory", "4096"]));
    }

    #[test]
    fn test_parse_described() {
        let json = br#"[
            {"EnclaveID": "i-other", "EnclaveCID": 20, "State": "RUNNING"},
            {"EnclaveID": "i-abc", "EnclaveCID": 16, "State": "RUNNING"}
        ]"#;
        assert_eq!(
            parse_described(json, "i-abc", 5000).unwrap(),
            EnvironmentStatus::Ready(EnvironmentAddress::Vsock { cid: 16, port: 5000 })
        );
        assert_eq!(
            parse_described(b"[]", "i-abc", 5000).unwrap(),
            EnvironmentStatus::Pending
        );
        let terminated = br#"[{"EnclaveID": "i-abc", "State": "TERMINATED"}]"#;
        assert!(parse_described(terminated, "i-abc", 5000).is_err());
    }

    /// HTTPコントロールプレーン: 作成 → 未確定 → 確定
    #[tokio::test]
    async fn test_http_control_plane() {
        let polls = Arc::new(AtomicU32::new(0));
        let app = axum::Router::new()
            .route(
                "/environments",
                axum::routing::post(|axum::Json(body): axum::Json<serde_json::Value>| async move {
                    assert_eq!(body["image_uri"], "alpine@sha256:00");
                    axum::Json(serde_json::json!({ "id": "env-7" }))
                }),
            )
            .route(
                "/environments/{id}",
                axum::routing::get({
                    let polls = polls.clone();
                    move |axum::extract::Path(id): axum::extract::Path<String>| {
                        let polls = polls.clone();
                        async move {
                            assert_eq!(id, "env-7");
                            if polls.fetch_add(1, Ordering::SeqCst) == 0 {
                                axum::Json(serde_json::json!({ "address": null }))
                            } else {
                                axum::Json(serde_json::json!({ "address": "tcp:127.0.0.1:5000" }))
                            }
                        }
                    }
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let plane = Arc::new(HttpControlPlane::new(
            reqwest::Client::new(),
            format!("http://127.0.0.1:{port}/"),
        ));
        let manager = EnclaveManager::new(plane, Arc::new(SocketConnector), limits(5, 1));
        let addr = manager.start(&spec(), &CancelToken::never()).await.unwrap();
        assert_eq!(addr, EnvironmentAddress::Tcp("127.0.0.1:5000".to_string()));
        assert_eq!(polls.load(Ordering::SeqCst), 2);
    }
}
