//! # イメージ取得
//!
//! コンテナイメージをレジストリから取得し、エンクレーブモードでは
//! 転送用のバイト列にシリアライズする。
//!
//! ## 認証情報
//! - エンクレーブモード: レジストリのトークン交換（[`HttpTokenExchange`]）
//! - 直接モード: ベアラートークンをそのまま使用（[`StaticRegistryAuth`]）
//!
//! ## エグゼキュータ置き換え
//! イメージ参照が設定されたエグゼキュータと一致する場合、代替イメージに
//! 一度だけ置き換える。置き換え後の参照を再度照合することはない。

use std::process::Stdio;

use serde::Deserialize;
use tokio::io::AsyncWriteExt;

use crate::config::{ExecutionMode, ExecutorSubstitution};
use crate::error::OrchestratorError;

// ---------------------------------------------------------------------------
// 外部コラボレータ
// ---------------------------------------------------------------------------

/// レジストリ認証情報。`Debug` 出力ではシークレットを表示しない。
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct RegistryCredentials {
    /// ユーザー名
    pub username: String,
    /// パスワードまたはトークン
    pub secret: String,
}

impl std::fmt::Debug for RegistryCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryCredentials")
            .field("username", &self.username)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// レジストリ認証情報の提供元。
#[async_trait::async_trait]
pub trait RegistryAuth: Send + Sync {
    async fn get_registry_token(&self) -> Result<RegistryCredentials, OrchestratorError>;
}

/// ローカルのコンテナエンジン。
#[async_trait::async_trait]
pub trait ContainerEngine: Send + Sync {
    /// レジストリにログインする。
    async fn login(
        &self,
        registry: &str,
        credentials: &RegistryCredentials,
    ) -> Result<(), OrchestratorError>;

    /// イメージを取得し、ローカルでの識別子を返す。
    async fn pull(&self, image: &str) -> Result<String, OrchestratorError>;

    /// イメージをバイト列にシリアライズする（エンクレーブモード用）。
    async fn export(&self, image: &str) -> Result<Vec<u8>, OrchestratorError>;
}

/// 固定のベアラートークン。
#[derive(Clone)]
pub struct StaticRegistryAuth {
    credentials: RegistryCredentials,
}

impl StaticRegistryAuth {
    pub fn new(username: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            credentials: RegistryCredentials {
                username: username.into(),
                secret: token.into(),
            },
        }
    }
}

#[async_trait::async_trait]
impl RegistryAuth for StaticRegistryAuth {
    async fn get_registry_token(&self) -> Result<RegistryCredentials, OrchestratorError> {
        Ok(self.credentials.clone())
    }
}

/// トークン交換エンドポイントのレスポンス。
#[derive(Deserialize)]
struct TokenResponse {
    token: String,
    #[serde(default)]
    username: Option<String>,
}

/// HTTPのトークン交換エンドポイントから短命トークンを取得する。
///
/// `GET {url}` に `Authorization: Bearer {api_token}` を付けて呼び出し、
/// `{"token": "...", "username": "..."}` を受け取る。
pub struct HttpTokenExchange {
    client: reqwest::Client,
    url: String,
    api_token: String,
    default_username: String,
}

impl HttpTokenExchange {
    pub fn new(
        client: reqwest::Client,
        url: impl Into<String>,
        api_token: impl Into<String>,
        default_username: impl Into<String>,
    ) -> Self {
        Self {
            client,
            url: url.into(),
            api_token: api_token.into(),
            default_username: default_username.into(),
        }
    }
}

#[async_trait::async_trait]
impl RegistryAuth for HttpTokenExchange {
    async fn get_registry_token(&self) -> Result<RegistryCredentials, OrchestratorError> {
        let resp = self
            .client
            .get(&self.url)
            .bearer_auth(&self.api_token)
            .send()
            .await
            .map_err(|e| OrchestratorError::ImagePull(format!("トークン交換に失敗: {e}")))?;
        if !resp.status().is_success() {
            return Err(OrchestratorError::ImagePull(format!(
                "トークン交換がエラーを返しました: {}",
                resp.status()
            )));
        }
        let body: TokenResponse = resp
            .json()
            .await
            .map_err(|e| OrchestratorError::ImagePull(format!("トークンのパースに失敗: {e}")))?;
        Ok(RegistryCredentials {
            username: body.username.unwrap_or_else(|| self.default_username.clone()),
            secret: body.token,
        })
    }
}

// ---------------------------------------------------------------------------
// Docker CLI
// ---------------------------------------------------------------------------

/// `docker` コマンドによるエンジン実装。
#[derive(Debug, Clone)]
pub struct DockerCli {
    program: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self {
            program: "docker".to_string(),
        }
    }
}

impl DockerCli {
    /// 実行ファイルを指定して作成する（`podman` 等）。
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    async fn run(&self, args: &[&str], stdin: Option<&[u8]>) -> Result<Vec<u8>, OrchestratorError> {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(args)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = cmd.spawn().map_err(|e| {
            OrchestratorError::ImagePull(format!("{} の起動に失敗: {e}", self.program))
        })?;
        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input)
                .await
                .map_err(|e| OrchestratorError::ImagePull(format!("標準入力への書き込みに失敗: {e}")))?;
        }
        let output = child
            .wait_with_output()
            .await
            .map_err(|e| OrchestratorError::ImagePull(format!("{} の実行に失敗: {e}", self.program)))?;
        if !output.status.success() {
            return Err(OrchestratorError::ImagePull(format!(
                "{} {} が失敗しました ({}): {}",
                self.program,
                args.first().copied().unwrap_or_default(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(output.stdout)
    }
}

#[async_trait::async_trait]
impl ContainerEngine for DockerCli {
    async fn login(
        &self,
        registry: &str,
        credentials: &RegistryCredentials,
    ) -> Result<(), OrchestratorError> {
        self.run(
            &["login", registry, "-u", &credentials.username, "--password-stdin"],
            Some(credentials.secret.as_bytes()),
        )
        .await?;
        Ok(())
    }

    async fn pull(&self, image: &str) -> Result<String, OrchestratorError> {
        self.run(&["pull", "--quiet", image], None).await?;
        let id = self
            .run(&["image", "inspect", "--format", "{{.Id}}", image], None)
            .await?;
        Ok(String::from_utf8_lossy(&id).trim().to_string())
    }

    async fn export(&self, image: &str) -> Result<Vec<u8>, OrchestratorError> {
        self.run(&["save", image], None).await
    }
}

// ---------------------------------------------------------------------------
// 取得処理
// ---------------------------------------------------------------------------

/// 取得済みイメージ。
#[derive(Clone)]
pub struct AcquiredImage {
    /// 置き換え後のイメージ参照
    pub reference: String,
    /// 正規URI。エンクレーブモードでは `{reference}@sha256:{digest}`。
    pub canonical_uri: String,
    /// ローカルエンジン上の識別子
    pub local_handle: String,
    /// 転送用バイト列（エンクレーブモードのみ）
    pub bytes: Option<Vec<u8>>,
}

impl std::fmt::Debug for AcquiredImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcquiredImage")
            .field("reference", &self.reference)
            .field("canonical_uri", &self.canonical_uri)
            .field("local_handle", &self.local_handle)
            .field("bytes", &self.bytes.as_ref().map(Vec::len))
            .finish()
    }
}

/// イメージ参照からレジストリのホスト名を推定する。
///
/// 先頭要素に `.` か `:` を含むか `localhost` の場合のみホスト名とみなす。
pub fn registry_host(reference: &str) -> Option<&str> {
    let (first, _) = reference.split_once('/')?;
    if first.contains('.') || first.contains(':') || first == "localhost" {
        Some(first)
    } else {
        None
    }
}

/// イメージ取得の実行者。
pub struct ImageAcquirer {
    engine: std::sync::Arc<dyn ContainerEngine>,
    auth: std::sync::Arc<dyn RegistryAuth>,
    mode: ExecutionMode,
    executor: Option<ExecutorSubstitution>,
    registry: Option<String>,
}

impl ImageAcquirer {
    pub fn new(
        engine: std::sync::Arc<dyn ContainerEngine>,
        auth: std::sync::Arc<dyn RegistryAuth>,
        mode: ExecutionMode,
    ) -> Self {
        Self {
            engine,
            auth,
            mode,
            executor: None,
            registry: None,
        }
    }

    pub fn with_executor(mut self, executor: Option<ExecutorSubstitution>) -> Self {
        self.executor = executor;
        self
    }

    pub fn with_registry(mut self, registry: Option<String>) -> Self {
        self.registry = registry;
        self
    }

    /// エグゼキュータ置き換えを適用する（一度だけ）。
    pub fn substitute<'a>(&'a self, reference: &'a str) -> &'a str {
        match &self.executor {
            Some(rule) if rule.identity == reference => &rule.substitute,
            _ => reference,
        }
    }

    /// イメージを取得する。
    pub async fn pull(&self, image_reference: &str) -> Result<AcquiredImage, OrchestratorError> {
        let reference = self.substitute(image_reference).to_string();
        if reference != image_reference {
            tracing::info!(from = image_reference, to = %reference, "エグゼキュータイメージを置き換え");
        }

        let registry = self
            .registry
            .as_deref()
            .or_else(|| registry_host(&reference));
        if let Some(registry) = registry {
            let credentials = self.auth.get_registry_token().await?;
            self.engine.login(registry, &credentials).await?;
            tracing::debug!(registry, "レジストリにログイン");
        }

        let local_handle = self.engine.pull(&reference).await?;
        tracing::info!(image = %reference, local_handle = %local_handle, "イメージ取得完了");

        match self.mode {
            ExecutionMode::Direct => Ok(AcquiredImage {
                canonical_uri: reference.clone(),
                reference,
                local_handle,
                bytes: None,
            }),
            ExecutionMode::Enclave => {
                let bytes = self.engine.export(&reference).await?;
                if bytes.is_empty() {
                    return Err(OrchestratorError::ImagePull(format!(
                        "シリアライズされたイメージが空です: {reference}"
                    )));
                }
                let digest = hex::encode(sealrun_crypto::sha256(&bytes));
                tracing::info!(image = %reference, size = bytes.len(), "イメージをシリアライズ");
                Ok(AcquiredImage {
                    canonical_uri: format!("{reference}@sha256:{digest}"),
                    reference,
                    local_handle,
                    bytes: Some(bytes),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockEngine;
    use std::sync::Arc;

    fn acquirer(engine: Arc<MockEngine>, mode: ExecutionMode) -> ImageAcquirer {
        ImageAcquirer::new(engine, Arc::new(StaticRegistryAuth::new("robot", "t0ken")), mode)
    }

    #[test]
    fn test_registry_host() {
        assert_eq!(registry_host("registry.example.com/tools/runner:1"), Some("registry.example.com"));
        assert_eq!(registry_host("localhost:5000/runner"), Some("localhost:5000"));
        assert_eq!(registry_host("library/alpine"), None);
        assert_eq!(registry_host("alpine"), None);
    }

    /// エンクレーブモードはバイト列と正規URIを返す
    #[tokio::test]
    async fn test_pull_enclave_mode() {
        let engine = Arc::new(MockEngine::new(b"image-tarball".to_vec()));
        let image = acquirer(engine.clone(), ExecutionMode::Enclave)
            .pull("registry.example.com/runner:1")
            .await
            .unwrap();
        let digest = hex::encode(sealrun_crypto::sha256(b"image-tarball"));
        assert_eq!(image.bytes.as_deref(), Some(&b"image-tarball"[..]));
        assert_eq!(
            image.canonical_uri,
            format!("registry.example.com/runner:1@sha256:{digest}")
        );
        assert_eq!(engine.logins(), vec!["registry.example.com:robot".to_string()]);
        assert_eq!(engine.pulls(), vec!["registry.example.com/runner:1".to_string()]);
    }

    /// 直接モードはイメージをローカルに残す
    #[tokio::test]
    async fn test_pull_direct_mode() {
        let engine = Arc::new(MockEngine::new(b"unused".to_vec()));
        let image = acquirer(engine.clone(), ExecutionMode::Direct)
            .pull("alpine:3")
            .await
            .unwrap();
        assert!(image.bytes.is_none());
        assert_eq!(image.canonical_uri, "alpine:3");
        // レジストリを推定できない参照ではログインしない
        assert!(engine.logins().is_empty());
        assert_eq!(engine.exports(), 0);
    }

    /// 置き換えは一度だけ適用される
    #[tokio::test]
    async fn test_executor_substitution_once() {
        let engine = Arc::new(MockEngine::new(b"x".to_vec()));
        let acquirer = acquirer(engine.clone(), ExecutionMode::Direct).with_executor(Some(
            ExecutorSubstitution {
                identity: "sealrun/executor".to_string(),
                substitute: "sealrun/executor-local".to_string(),
            },
        ));
        assert_eq!(acquirer.substitute("sealrun/executor"), "sealrun/executor-local");
        assert_eq!(acquirer.substitute("sealrun/executor-local"), "sealrun/executor-local");
        assert_eq!(acquirer.substitute("other"), "other");

        let image = acquirer.pull("sealrun/executor").await.unwrap();
        assert_eq!(image.reference, "sealrun/executor-local");
        assert_eq!(engine.pulls(), vec!["sealrun/executor-local".to_string()]);
    }

    #[tokio::test]
    async fn test_pull_failure_is_image_pull_error() {
        let engine = Arc::new(MockEngine::failing());
        let err = acquirer(engine, ExecutionMode::Enclave)
            .pull("alpine")
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::ImagePull(_)));
    }

    /// トークン交換エンドポイントから認証情報を取得する
    #[tokio::test]
    async fn test_http_token_exchange() {
        let app = axum::Router::new().route(
            "/token",
            axum::routing::get(|headers: axum::http::HeaderMap| async move {
                let auth = headers
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                if auth != "Bearer api-key" {
                    return Err(axum::http::StatusCode::UNAUTHORIZED);
                }
                Ok(axum::Json(serde_json::json!({ "token": "short-lived" })))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let url = format!("http://127.0.0.1:{port}/token");
        let exchange = HttpTokenExchange::new(reqwest::Client::new(), &url, "api-key", "AWS");
        let creds = exchange.get_registry_token().await.unwrap();
        assert_eq!(creds.username, "AWS");
        assert_eq!(creds.secret, "short-lived");
        assert!(!format!("{creds:?}").contains("short-lived"));

        let denied = HttpTokenExchange::new(reqwest::Client::new(), &url, "wrong", "AWS");
        assert!(matches!(
            denied.get_registry_token().await,
            Err(OrchestratorError::ImagePull(_))
        ));
    }
}
