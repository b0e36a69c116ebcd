//! # ジョブオーケストレータ
//!
//! 1ジョブを1つのtokioタスクで実行する状態機械。
//!
//! ```text
//! Pending → AcquiringImage → StartingEnvironment → ShippingImage → Attesting
//!         → ShippingInput → Computing → FetchingResult → Done
//! （任意の状態 → Failed）
//! ```
//!
//! ## 呼び出し側とのやり取り（全て `oneshot`）
//! - 入力の受け渡し: [`JobHandle::provide_input`]
//! - Attestationの公開: [`JobHandle::attestation`]
//! - 結果の公開: [`JobHandle::wait`]
//!
//! ## リトライ
//! 終端でないエラーは記録した上で `Pending` から再開する。接続を壊さない
//! エラーの場合は既存のチャネルを再利用し、イメージ転送とAttestationは繰り返さない。
//! データ鍵は試行ごとに必ず作り直す。

use std::future::Future;
use std::sync::Arc;

use base64::Engine;
use rand::RngCore;
use tokio::sync::oneshot;
use tracing::Instrument;

use sealrun_crypto::{
    self as crypto, AeadKey, EncryptedPayload, KeyEnvelope, X25519PublicKey, CONTEXT_INPUT,
    CONTEXT_RESULT, CONTEXT_RUNTIME_BUNDLE,
};
use sealrun_transport::{cancel_pair, Ack, CancelHandle, CancelToken, Channel, ChannelOptions};
use sealrun_types::{
    BulkHeader, ComputeRequest, Environment, Job, JobError, JobErrorKind, JobId, JobState,
    ModuleDescriptor, Progress, Reply, Request, RuntimeBundle, WireKeyEnvelope, WorkloadOutput,
};

use crate::config::OrchestratorConfig;
use crate::enclave::{
    ControlPlane, Connector, EnclaveManager, EnvironmentSpec, LifecycleLimits, SocketConnector,
};
use crate::error::OrchestratorError;
use crate::image::{AcquiredImage, ContainerEngine, ImageAcquirer, RegistryAuth};
use crate::job_service::{fetch_bundle, JobService};
use crate::status::{ProgressSink, Reporter};

/// Attestation Document本体の受信上限。
const MAX_ATTESTATION_SIZE: u64 = 64 * 1024;

fn b64() -> base64::engine::GeneralPurpose {
    base64::engine::general_purpose::STANDARD
}

// ---------------------------------------------------------------------------
// Attestation
// ---------------------------------------------------------------------------

/// エンクレーブの署名付きAttestation Document。
///
/// 中身の検証は呼び出し側（[`AttestationVerifier`]）に委ねる。
#[derive(Clone)]
pub struct AttestationDocument {
    /// 不透明なドキュメント本体
    pub document: Vec<u8>,
    /// エンクレーブが報告したX25519公開鍵。データ鍵はこの鍵宛てにラップされる
    pub enclave_public_key: X25519PublicKey,
    /// 要求時に送ったフレッシュネス用ノンス
    pub nonce: [u8; 32],
}

impl AttestationDocument {
    /// 表示用のBase64表現。
    pub fn to_base64(&self) -> String {
        b64().encode(&self.document)
    }

    /// エンクレーブ公開鍵のBase64表現。
    pub fn public_key_b64(&self) -> String {
        crypto::encode_public_key(&self.enclave_public_key)
    }
}

impl std::fmt::Debug for AttestationDocument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttestationDocument")
            .field("size", &self.document.len())
            .field("enclave_public_key", &self.public_key_b64())
            .finish()
    }
}

/// Attestation Documentの検証者。拒否はジョブの終端エラーになる。
pub trait AttestationVerifier: Send + Sync {
    fn verify(&self, document: &AttestationDocument) -> Result<(), String>;
}

// ---------------------------------------------------------------------------
// 結果
// ---------------------------------------------------------------------------

/// 暗号化されたままの計算結果と、それを開く鍵。
pub struct ComputeResult {
    /// ワークロードの終了コード
    pub exit_code: i32,
    /// 暗号化結果
    pub encrypted: EncryptedPayload,
    /// 結果用の鍵（`Debug` 出力では表示しない）
    pub result_key: AeadKey,
    /// 実行環境のAttestation
    pub attestation: AttestationDocument,
    /// 実行したイメージの正規URI
    pub image_uri: String,
}

impl std::fmt::Debug for ComputeResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputeResult")
            .field("exit_code", &self.exit_code)
            .field("encrypted_len", &self.encrypted.len())
            .field("result_key", &self.result_key)
            .field("image_uri", &self.image_uri)
            .finish()
    }
}

impl ComputeResult {
    /// 結果を復号する。
    pub fn decrypt(&self) -> Result<WorkloadOutput, OrchestratorError> {
        let plaintext = crypto::open(&self.encrypted, &self.result_key)?;
        serde_json::from_slice(&plaintext)
            .map_err(|e| OrchestratorError::Protocol(format!("結果ペイロードをパースできません: {e}")))
    }
}

/// ジョブの最終結果。
#[derive(Debug)]
pub enum JobOutcome {
    Done(Box<ComputeResult>),
    Failed(JobError),
}

/// 呼び出し側に返す最終レポート。進捗履歴はジョブに残る。
#[derive(Debug)]
pub struct JobReport {
    pub job: Job,
    pub outcome: JobOutcome,
}

impl JobReport {
    pub fn is_done(&self) -> bool {
        matches!(self.outcome, JobOutcome::Done(_))
    }

    pub fn result(&self) -> Option<&ComputeResult> {
        match &self.outcome {
            JobOutcome::Done(result) => Some(result),
            JobOutcome::Failed(_) => None,
        }
    }

    /// 失敗時はその分類、成功時はワークロード失敗の記録（あれば）。
    pub fn error(&self) -> Option<&JobError> {
        match &self.outcome {
            JobOutcome::Failed(error) => Some(error),
            JobOutcome::Done(_) => self.job.error.as_ref(),
        }
    }
}

// ---------------------------------------------------------------------------
// JobHandle
// ---------------------------------------------------------------------------

/// 実行中ジョブへのハンドル。
pub struct JobHandle {
    job_id: JobId,
    input: Option<oneshot::Sender<Vec<u8>>>,
    attestation: Option<oneshot::Receiver<AttestationDocument>>,
    result: oneshot::Receiver<JobReport>,
    cancel: CancelHandle,
}

impl JobHandle {
    pub fn id(&self) -> JobId {
        self.job_id
    }

    /// 平文の入力を渡す。1ジョブにつき1回だけ。
    pub fn provide_input(&mut self, input: Vec<u8>) -> Result<(), OrchestratorError> {
        let tx = self
            .input
            .take()
            .ok_or_else(|| OrchestratorError::Unexpected("入力は既に渡されています".to_string()))?;
        tx.send(input)
            .map_err(|_| OrchestratorError::Unexpected("ジョブは既に終了しています".to_string()))
    }

    /// Attestation Documentを待つ。取得前にジョブが終了した場合は `None`。
    pub async fn attestation(&mut self) -> Option<AttestationDocument> {
        self.attestation.take()?.await.ok()
    }

    /// ジョブをキャンセルする。ブロック中の送受信は即座に失敗する。
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// 別タスクからキャンセルするためのハンドル。
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// ジョブの終了を待つ。
    ///
    /// 入力を渡していない場合、入力待ちのジョブはキャンセル扱いで終了する。
    pub async fn wait(self) -> Result<JobReport, OrchestratorError> {
        let JobHandle { input, result, .. } = self;
        drop(input);
        result.await.map_err(|_| {
            OrchestratorError::Unexpected("ワーカータスクが結果を返さずに終了しました".to_string())
        })
    }
}

// ---------------------------------------------------------------------------
// 試行間で保持する状態
// ---------------------------------------------------------------------------

/// 解決済みモジュール（委譲は一度だけ解決する）。
struct ResolvedModule {
    module: ModuleDescriptor,
    bundle: Option<Vec<u8>>,
}

/// 1つの実行環境へのセキュアチャネル。ジョブ間で共有しない。
struct SecureChannel {
    channel: Channel,
    image_loaded: bool,
    attestation: Option<AttestationDocument>,
}

struct Session {
    resolved: Option<ResolvedModule>,
    image: Option<AcquiredImage>,
    secure: Option<SecureChannel>,
    input: Option<Vec<u8>>,
    input_rx: Option<oneshot::Receiver<Vec<u8>>>,
    attestation_tx: Option<oneshot::Sender<AttestationDocument>>,
}

impl Session {
    async fn drop_channel(&mut self) {
        if let Some(mut secure) = self.secure.take() {
            secure.channel.close().await;
        }
    }
}

/// キャンセルで中断できる待機。
async fn cancellable<T, F>(cancel: &CancelToken, what: &str, fut: F) -> Result<T, OrchestratorError>
where
    F: Future<Output = Result<T, OrchestratorError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(OrchestratorError::Cancelled(what.to_string())),
        result = fut => result,
    }
}

/// 確認応答を検査する。
async fn expect_ack(channel: &mut Channel, op: &str) -> Result<(), OrchestratorError> {
    match channel.recv_ack().await? {
        Ack::Accepted => Ok(()),
        Ack::Rejected { kind, detail } => Err(OrchestratorError::from_fault(op, kind, detail)),
    }
}

fn unexpected_reply(op: &str, reply: &Reply) -> OrchestratorError {
    OrchestratorError::Protocol(format!("{op} に対する予期しない応答: {reply:?}"))
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// ジョブオーケストレータ。ジョブ間で共有するのはエンジンと認証情報のみ。
pub struct Orchestrator {
    config: OrchestratorConfig,
    images: ImageAcquirer,
    enclaves: EnclaveManager,
    job_service: Option<Arc<dyn JobService>>,
    verifier: Option<Arc<dyn AttestationVerifier>>,
    sinks: Vec<Arc<dyn ProgressSink>>,
    http: reqwest::Client,
    control_plane: Arc<dyn ControlPlane>,
}

impl Orchestrator {
    /// オーケストレータを構築する。HTTPクライアントは設定のタイムアウトで作成される。
    pub fn new(
        config: OrchestratorConfig,
        engine: Arc<dyn ContainerEngine>,
        auth: Arc<dyn RegistryAuth>,
        control_plane: Arc<dyn ControlPlane>,
    ) -> Result<Self, OrchestratorError> {
        let http = config.http_client()?;
        let images = ImageAcquirer::new(engine, auth, config.mode)
            .with_executor(config.executor.clone())
            .with_registry(config.registry.host.clone());
        let enclaves = EnclaveManager::new(
            control_plane.clone(),
            Arc::new(SocketConnector),
            Self::limits(&config),
        );
        Ok(Self {
            config,
            images,
            enclaves,
            job_service: None,
            verifier: None,
            sinks: Vec::new(),
            http,
            control_plane,
        })
    }

    fn limits(config: &OrchestratorConfig) -> LifecycleLimits {
        LifecycleLimits {
            poll_attempts: config.poll_attempts,
            poll_interval: config.poll_interval(),
            connect_attempts: config.connect_attempts,
            connect_interval: config.connect_interval(),
            call_timeout: config.control_plane_timeout(),
        }
    }

    /// 接続方法を差し替える。
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.enclaves = EnclaveManager::new(
            self.control_plane.clone(),
            connector,
            Self::limits(&self.config),
        );
        self
    }

    pub fn with_job_service(mut self, job_service: Arc<dyn JobService>) -> Self {
        self.job_service = Some(job_service);
        self
    }

    pub fn with_verifier(mut self, verifier: Arc<dyn AttestationVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.http = client;
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// ジョブを専用タスクで開始する。
    pub fn spawn(self: &Arc<Self>, job: Job) -> JobHandle {
        let (input_tx, input_rx) = oneshot::channel();
        let (attestation_tx, attestation_rx) = oneshot::channel();
        let (result_tx, result_rx) = oneshot::channel();
        let (cancel_handle, cancel) = cancel_pair();
        let job_id = job.id;

        let this = Arc::clone(self);
        let span = tracing::info_span!("job", job_id = %job_id);
        tokio::spawn(
            async move {
                let report = this.run_job(job, input_rx, attestation_tx, cancel).await;
                if result_tx.send(report).is_err() {
                    tracing::debug!("ジョブハンドルは既に破棄されています");
                }
            }
            .instrument(span),
        );

        JobHandle {
            job_id,
            input: Some(input_tx),
            attestation: Some(attestation_rx),
            result: result_rx,
            cancel: cancel_handle,
        }
    }

    /// ジョブを開始し、入力を渡して終了まで待つ。
    pub async fn run(self: &Arc<Self>, job: Job, input: Vec<u8>) -> Result<JobReport, OrchestratorError> {
        let mut handle = self.spawn(job);
        handle.provide_input(input)?;
        handle.wait().await
    }

    /// リトライループ。全てのエラーはここで捕捉され、ジョブに記録される。
    async fn run_job(
        &self,
        mut job: Job,
        input_rx: oneshot::Receiver<Vec<u8>>,
        attestation_tx: oneshot::Sender<AttestationDocument>,
        cancel: CancelToken,
    ) -> JobReport {
        let mut reporter = Reporter::new(job.id, self.sinks.clone());
        let mut session = Session {
            resolved: None,
            image: None,
            secure: None,
            input: None,
            input_rx: Some(input_rx),
            attestation_tx: Some(attestation_tx),
        };

        loop {
            job.attempts += 1;
            let attempt = job.attempts;
            reporter.begin_attempt(attempt);
            job.state = JobState::Pending;
            record(&mut job, reporter.report(0, JobState::Pending.message()));
            tracing::info!(attempt, "試行を開始");

            let err = match self.attempt(&mut job, &mut reporter, &mut session, &cancel).await {
                Ok(result) => {
                    session.drop_channel().await;
                    return Self::finish_done(job, &mut reporter, result);
                }
                Err(err) => err,
            };

            let error = JobError {
                kind: err.kind(),
                detail: err.to_string(),
                attempt,
            };
            tracing::warn!(
                attempt,
                state = %job.state,
                kind = %error.kind,
                error = %error.detail,
                "試行が失敗"
            );
            job.error = Some(error.clone());
            if err.breaks_channel() {
                session.drop_channel().await;
            }

            let retry = err.is_retryable()
                && !cancel.is_cancelled()
                && self.config.retry.allows_retry_after(attempt);
            if !retry {
                session.drop_channel().await;
                return Self::finish_failed(job, &mut reporter, error);
            }

            let backoff = self.config.retry.backoff();
            if let Err(cancelled) = cancellable(&cancel, "リトライ待機中", async {
                tokio::time::sleep(backoff).await;
                Ok(())
            })
            .await
            {
                session.drop_channel().await;
                let error = JobError {
                    kind: cancelled.kind(),
                    detail: cancelled.to_string(),
                    attempt,
                };
                job.error = Some(error.clone());
                return Self::finish_failed(job, &mut reporter, error);
            }
        }
    }

    fn finish_done(mut job: Job, reporter: &mut Reporter, result: ComputeResult) -> JobReport {
        job.error = if result.exit_code == 0 {
            None
        } else {
            Some(JobError {
                kind: JobErrorKind::Compute,
                detail: format!("ワークロードが終了コード {} で終了しました", result.exit_code),
                attempt: job.attempts,
            })
        };
        job.state = JobState::Done;
        record(&mut job, reporter.report(100, JobState::Done.message()));
        tracing::info!(
            attempts = job.attempts,
            exit_code = result.exit_code,
            image = %result.image_uri,
            "ジョブ完了"
        );
        JobReport {
            job,
            outcome: JobOutcome::Done(Box::new(result)),
        }
    }

    fn finish_failed(mut job: Job, reporter: &mut Reporter, error: JobError) -> JobReport {
        job.state = JobState::Failed;
        record(
            &mut job,
            reporter.report_current(format!("{}: {}", JobState::Failed.message(), error.detail)),
        );
        tracing::error!(attempts = job.attempts, kind = %error.kind, "ジョブ失敗");
        JobReport {
            job,
            outcome: JobOutcome::Failed(error),
        }
    }

    /// 状態を1つ進め、進捗を通知する。
    fn advance(
        &self,
        job: &mut Job,
        reporter: &mut Reporter,
        cancel: &CancelToken,
        next: JobState,
    ) -> Result<(), OrchestratorError> {
        if cancel.is_cancelled() {
            return Err(OrchestratorError::Cancelled(format!("{next} の開始前")));
        }
        if !job.state.can_advance_to(next) {
            return Err(OrchestratorError::Unexpected(format!(
                "不正な状態遷移: {} → {next}",
                job.state
            )));
        }
        job.state = next;
        let percent = next.percent().unwrap_or_default();
        record(job, reporter.report(percent, next.message()));
        tracing::debug!(state = %next, percent, "状態遷移");
        Ok(())
    }

    fn channel_options(&self, cancel: &CancelToken) -> ChannelOptions {
        ChannelOptions {
            io_timeout: self.config.io_timeout(),
            max_bulk_size: self.config.max_bulk_size,
            cancel: cancel.clone(),
        }
    }

    /// 1回の試行。
    async fn attempt(
        &self,
        job: &mut Job,
        reporter: &mut Reporter,
        session: &mut Session,
        cancel: &CancelToken,
    ) -> Result<ComputeResult, OrchestratorError> {
        // --- AcquiringImage ---
        self.advance(job, reporter, cancel, JobState::AcquiringImage)?;
        if session.resolved.is_none() {
            let resolved = self.resolve_module(job, cancel).await?;
            job.module = resolved.module.clone();
            session.resolved = Some(resolved);
        }
        let Some(resolved) = session.resolved.as_ref() else {
            return Err(OrchestratorError::Unexpected("モジュールが未解決です".to_string()));
        };
        if session.image.is_none() {
            let image = cancellable(cancel, "イメージ取得中", self.images.pull(&resolved.module.image)).await?;
            session.image = Some(image);
        }
        let Some(image) = session.image.as_ref() else {
            return Err(OrchestratorError::Unexpected("イメージが未取得です".to_string()));
        };

        // --- StartingEnvironment ---
        self.advance(job, reporter, cancel, JobState::StartingEnvironment)?;
        if session.secure.is_none() {
            let spec = EnvironmentSpec {
                image_uri: image.canonical_uri.clone(),
                resources: self.config.enclave.clone(),
            };
            let addr = self.enclaves.start(&spec, cancel).await?;
            let channel = self
                .enclaves
                .connect_until_ready(&addr, self.channel_options(cancel))
                .await?;
            session.secure = Some(SecureChannel {
                channel,
                image_loaded: false,
                attestation: None,
            });
        } else {
            tracing::debug!("既存のチャネルを再利用");
        }
        let Some(secure) = session.secure.as_mut() else {
            return Err(OrchestratorError::Unexpected("チャネルが未確立です".to_string()));
        };

        // --- ShippingImage ---
        self.advance(job, reporter, cancel, JobState::ShippingImage)?;
        if !secure.image_loaded {
            ship_image(&mut secure.channel, image).await?;
            secure.image_loaded = true;
        }

        // --- Attesting ---
        self.advance(job, reporter, cancel, JobState::Attesting)?;
        let attestation = match &secure.attestation {
            Some(doc) => doc.clone(),
            None => {
                let doc = request_attestation(&mut secure.channel).await?;
                if let Some(verifier) = &self.verifier {
                    verifier
                        .verify(&doc)
                        .map_err(OrchestratorError::AttestationRejected)?;
                }
                if let Some(tx) = session.attestation_tx.take() {
                    let _ = tx.send(doc.clone());
                }
                secure.attestation = Some(doc.clone());
                doc
            }
        };

        // --- ShippingInput ---
        self.advance(job, reporter, cancel, JobState::ShippingInput)?;
        if session.input.is_none() {
            let rx = session
                .input_rx
                .take()
                .ok_or_else(|| OrchestratorError::Cancelled("入力ハンドルが破棄されました".to_string()))?;
            let input = cancellable(cancel, "入力待機中", async {
                rx.await
                    .map_err(|_| OrchestratorError::Cancelled("入力ハンドルが破棄されました".to_string()))
            })
            .await?;
            session.input = Some(input);
        }
        let input = session.input.as_deref().unwrap_or_default();
        let envelope = KeyEnvelope::generate();
        ship_input(&mut secure.channel, &envelope, &attestation.enclave_public_key, input).await?;

        // --- Computing ---
        self.advance(job, reporter, cancel, JobState::Computing)?;
        let (size, nonce, exit_code) = start_compute(
            &mut secure.channel,
            &envelope,
            &resolved.module,
            resolved.bundle.as_deref(),
            self.config.compute_timeout(),
        )
        .await?;

        // --- FetchingResult ---
        self.advance(job, reporter, cancel, JobState::FetchingResult)?;
        let ciphertext = secure.channel.recv_bulk(size).await?;
        let encrypted = EncryptedPayload::from_wire(CONTEXT_RESULT, &nonce, ciphertext)?;
        let result_key = envelope.payload_key(CONTEXT_RESULT)?;
        // 呼び出し側に渡す前に真正性だけ確認する
        crypto::open(&encrypted, &result_key)?;

        Ok(ComputeResult {
            exit_code,
            encrypted,
            result_key,
            attestation,
            image_uri: image.canonical_uri.clone(),
        })
    }

    /// 環境種別を検査し、実行するモジュールとバンドルを確定する。
    async fn resolve_module(
        &self,
        job: &Job,
        cancel: &CancelToken,
    ) -> Result<ResolvedModule, OrchestratorError> {
        let (module, bundle) = match &job.environment {
            Environment::Container => (job.module.clone(), job.runtime_bundle.clone()),
            Environment::Delegated { module_reference } => {
                let service = self.job_service.as_ref().ok_or_else(|| {
                    OrchestratorError::InvalidModule(
                        "委譲ジョブの実行にはジョブサービスが必要です".to_string(),
                    )
                })?;
                let delegated =
                    cancellable(cancel, "ジョブサービス待機中", service.create_job(module_reference))
                        .await?;
                tracing::info!(
                    module_reference = %module_reference,
                    module = %delegated.module.name,
                    "委譲先モジュールに置き換え"
                );
                let bundle = delegated
                    .runtime_bundle_uri
                    .map(|uri| RuntimeBundle::Remote { uri })
                    .or_else(|| job.runtime_bundle.clone());
                (delegated.module, bundle)
            }
            Environment::Unsupported { name } => {
                return Err(OrchestratorError::InvalidModule(format!(
                    "未対応の実行環境です: {name}"
                )));
            }
        };
        module.validate().map_err(OrchestratorError::InvalidModule)?;

        let bundle = match bundle {
            None => None,
            Some(RuntimeBundle::Inline { data, .. }) => Some(data),
            Some(RuntimeBundle::Remote { uri }) => {
                let data = cancellable(cancel, "バンドル取得中", fetch_bundle(&self.http, &uri)).await?;
                tracing::info!(uri = %uri, size = data.len(), "ランタイムバンドルを取得");
                Some(data)
            }
        };
        Ok(ResolvedModule { module, bundle })
    }
}

/// 進捗をジョブに記録する。
fn record(job: &mut Job, progress: Progress) {
    job.progress = progress.clone();
    job.progress_history.push(progress);
}

// ---------------------------------------------------------------------------
// ワイヤ手順
// ---------------------------------------------------------------------------

/// `load_image` → (イメージ本体) → ack
async fn ship_image(channel: &mut Channel, image: &AcquiredImage) -> Result<(), OrchestratorError> {
    match &image.bytes {
        Some(bytes) => {
            channel
                .send_request(&Request::LoadImage {
                    size: bytes.len() as u64,
                    reference: Some(image.canonical_uri.clone()),
                })
                .await?;
            channel.send_bytes(bytes).await?;
            tracing::info!(size = bytes.len(), image = %image.canonical_uri, "イメージを転送");
        }
        None => {
            channel
                .send_request(&Request::LoadImage {
                    size: 0,
                    reference: Some(image.reference.clone()),
                })
                .await?;
        }
    }
    expect_ack(channel, "load_image").await
}

/// `do_attestation` → attestationヘッダ → (ドキュメント本体)
async fn request_attestation(channel: &mut Channel) -> Result<AttestationDocument, OrchestratorError> {
    let mut nonce = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    channel
        .send_request(&Request::DoAttestation {
            nonce: Some(b64().encode(nonce)),
        })
        .await?;
    match channel.recv_reply().await? {
        Reply::Attestation { size, public_key } => {
            let document = channel.recv_bulk_limited(size, MAX_ATTESTATION_SIZE).await?;
            let enclave_public_key = crypto::decode_public_key(&public_key)?;
            tracing::info!(size = document.len(), "Attestation Documentを受信");
            Ok(AttestationDocument {
                document,
                enclave_public_key,
                nonce,
            })
        }
        Reply::Nack { kind, detail } => Err(OrchestratorError::from_fault("do_attestation", kind, detail)),
        other => Err(unexpected_reply("do_attestation", &other)),
    }
}

/// `load_data` → (暗号化入力) → ack
async fn ship_input(
    channel: &mut Channel,
    envelope: &KeyEnvelope,
    enclave_public_key: &X25519PublicKey,
    input: &[u8],
) -> Result<(), OrchestratorError> {
    let payload = envelope.seal(input, CONTEXT_INPUT)?;
    let (ephemeral_public_key, nonce, wrapped_key) = envelope.wrap_for(enclave_public_key)?.to_b64_parts();
    channel
        .send_request(&Request::LoadData {
            size: payload.len() as u64,
            nonce: payload.nonce_b64(),
            key_envelope: WireKeyEnvelope {
                ephemeral_public_key,
                nonce,
                wrapped_key,
            },
        })
        .await?;
    channel.send_bytes(&payload.ciphertext).await?;
    expect_ack(channel, "load_data").await?;
    tracing::info!(size = payload.len(), "暗号化入力を転送");
    Ok(())
}

/// `start_compute` → (暗号化バンドル) → ack → 結果ヘッダ
///
/// 結果ヘッダのサイズ・ノンス・終了コードを返す。
async fn start_compute(
    channel: &mut Channel,
    envelope: &KeyEnvelope,
    module: &ModuleDescriptor,
    bundle: Option<&[u8]>,
    compute_timeout: std::time::Duration,
) -> Result<(u64, String, i32), OrchestratorError> {
    let bundle = bundle
        .map(|data| envelope.seal(data, CONTEXT_RUNTIME_BUNDLE))
        .transpose()?;
    let header = bundle.as_ref().map(|payload| BulkHeader {
        size: payload.len() as u64,
        nonce: payload.nonce_b64(),
    });
    channel
        .send_request(&Request::StartCompute(ComputeRequest::from_module(module, header)))
        .await?;
    if let Some(payload) = &bundle {
        channel.send_bytes(&payload.ciphertext).await?;
    }
    expect_ack(channel, "start_compute").await?;
    tracing::info!(module = %module.name, "ワークロードを開始");

    match channel.recv_reply_within(compute_timeout).await? {
        Reply::Result {
            size,
            nonce,
            exit_code,
        } => Ok((size, nonce, exit_code)),
        Reply::Nack { kind, detail } => Err(OrchestratorError::from_fault("start_compute", kind, detail)),
        other => Err(unexpected_reply("start_compute", &other)),
    }
}
