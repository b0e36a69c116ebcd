//! # セカンダリジョブサービス
//!
//! 委譲ジョブ（[`Environment::Delegated`](sealrun_types::Environment::Delegated)）の
//! モジュール参照を、実行可能なモジュール記述子に解決する。
//!
//! 返される [`DelegatedJob`] は環境種別を持たないため、委譲は型の上で一段に限られる。

use serde::{Deserialize, Serialize};

use sealrun_types::ModuleDescriptor;

use crate::error::OrchestratorError;

/// ジョブサービスが返す委譲先ジョブ。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegatedJob {
    /// 実行するモジュール
    pub module: ModuleDescriptor,
    /// ランタイムバンドルの取得元
    #[serde(default)]
    pub runtime_bundle_uri: Option<String>,
}

/// セカンダリジョブサービス。
#[async_trait::async_trait]
pub trait JobService: Send + Sync {
    async fn create_job(&self, module_reference: &str) -> Result<DelegatedJob, OrchestratorError>;
}

/// HTTPのジョブサービス。
///
/// `POST {base}/jobs` (`{"module_reference": "..."}`) → [`DelegatedJob`]
#[derive(Debug, Clone)]
pub struct HttpJobService {
    client: reqwest::Client,
    base_url: String,
}

impl HttpJobService {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait::async_trait]
impl JobService for HttpJobService {
    async fn create_job(&self, module_reference: &str) -> Result<DelegatedJob, OrchestratorError> {
        let resp = self
            .client
            .post(format!("{}/jobs", self.base_url))
            .json(&serde_json::json!({ "module_reference": module_reference }))
            .send()
            .await
            .map_err(|e| OrchestratorError::Upstream(format!("ジョブサービスへの接続に失敗: {e}")))?;
        let status = resp.status();
        if status.is_client_error() {
            // 参照そのものが不正。リトライしても解決しない
            return Err(OrchestratorError::InvalidModule(format!(
                "ジョブサービスがモジュール参照を拒否しました ({status}): {module_reference}"
            )));
        }
        if !status.is_success() {
            return Err(OrchestratorError::Upstream(format!(
                "ジョブサービスがエラーを返しました: {status}"
            )));
        }
        resp.json()
            .await
            .map_err(|e| OrchestratorError::Upstream(format!("ジョブサービスの応答をパースできません: {e}")))
    }
}

/// URIからランタイムバンドルを取得する。
pub async fn fetch_bundle(client: &reqwest::Client, uri: &str) -> Result<Vec<u8>, OrchestratorError> {
    let resp = client
        .get(uri)
        .send()
        .await
        .map_err(|e| OrchestratorError::Upstream(format!("バンドル取得に失敗 ({uri}): {e}")))?;
    if !resp.status().is_success() {
        return Err(OrchestratorError::Upstream(format!(
            "バンドル取得でHTTPエラー: ステータス {} ({uri})",
            resp.status()
        )));
    }
    let bytes = resp
        .bytes()
        .await
        .map_err(|e| OrchestratorError::Upstream(format!("バンドル本体の受信に失敗 ({uri}): {e}")))?;
    Ok(bytes.to_vec())
}
