//! # テスト支援
//!
//! - [`MockEnclave`]: TCP上でワイヤプロトコルを話すモックエンクレーブ。
//!   ワークロードは `sh -c` で実際に実行する
//! - [`MockEngine`]: メモリ上のコンテナエンジン
//! - [`ScriptedConnector`]: 最初のN回の接続を失敗させるコネクタ

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::AsyncWriteExt;

use sealrun_crypto::{
    self as crypto, EncryptedPayload, KeyEnvelope, WrappedKey, X25519PublicKey, X25519StaticSecret,
    CONTEXT_INPUT, CONTEXT_RESULT, CONTEXT_RUNTIME_BUNDLE,
};
use sealrun_transport::{Channel, ChannelOptions, EnvironmentAddress, TransportError};
use sealrun_types::{
    FaultKind, ModuleDescriptor, PathMapping, Reply, Request, WireKeyEnvelope, WorkloadOutput,
};

use crate::config::{OrchestratorConfig, RetryPolicy};
use crate::enclave::{
    ControlPlane, Connector, EnvironmentHandle, EnvironmentSpec, EnvironmentStatus,
    StaticControlPlane,
};
use crate::error::OrchestratorError;
use crate::image::{ContainerEngine, RegistryCredentials, StaticRegistryAuth};
use crate::orchestrator::Orchestrator;

/// `command` を実行するテスト用モジュール記述子。
pub fn echo_module(command: &str) -> ModuleDescriptor {
    ModuleDescriptor {
        name: "echo".to_string(),
        image: "registry.example.com/tools/runner:1".to_string(),
        working_dir: "/".to_string(),
        command: command.to_string(),
        input: vec![PathMapping::new("input.bin", "/work/input.bin")],
        output: vec![PathMapping::new("result.json", "/work/result.json")],
        source: vec![],
    }
}

/// 短い間隔・有限リトライのテスト用設定。
pub fn test_config() -> OrchestratorConfig {
    OrchestratorConfig {
        retry: RetryPolicy {
            max_retries: Some(0),
            backoff_ms: 0,
        },
        io_timeout_ms: 5_000,
        compute_timeout_ms: 10_000,
        connect_attempts: 5,
        connect_interval_ms: 10,
        poll_attempts: 5,
        poll_interval_ms: 10,
        ..OrchestratorConfig::default()
    }
}

/// モックエンクレーブに接続するオーケストレータ。
pub fn orchestrator(config: OrchestratorConfig, enclave: &MockEnclave) -> Orchestrator {
    Orchestrator::new(
        config,
        Arc::new(MockEngine::new(b"mock-image-tarball".to_vec())),
        Arc::new(StaticRegistryAuth::new("robot", "t0ken")),
        Arc::new(StaticControlPlane::new(enclave.address.clone())),
    )
    .unwrap()
}

// ---------------------------------------------------------------------------
// HangingControlPlane
// ---------------------------------------------------------------------------

/// 作成には応答するが、アドレス照会には永久に応答しないコントロールプレーン。
#[derive(Default)]
pub struct HangingControlPlane {
    describes: AtomicU32,
}

impl HangingControlPlane {
    pub fn describes(&self) -> u32 {
        self.describes.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl ControlPlane for HangingControlPlane {
    async fn create_environment(
        &self,
        _spec: &EnvironmentSpec,
    ) -> Result<EnvironmentHandle, OrchestratorError> {
        Ok(EnvironmentHandle {
            id: "i-hang".to_string(),
        })
    }

    async fn describe_environment(
        &self,
        _handle: &EnvironmentHandle,
    ) -> Result<EnvironmentStatus, OrchestratorError> {
        self.describes.fetch_add(1, Ordering::SeqCst);
        std::future::pending().await
    }
}

// ---------------------------------------------------------------------------
// MockEngine
// ---------------------------------------------------------------------------

/// メモリ上のコンテナエンジン。
pub struct MockEngine {
    image: Vec<u8>,
    fail: bool,
    logins: Mutex<Vec<String>>,
    pulls: Mutex<Vec<String>>,
    exports: AtomicUsize,
}

impl MockEngine {
    pub fn new(image: Vec<u8>) -> Self {
        Self {
            image,
            fail: false,
            logins: Mutex::new(Vec::new()),
            pulls: Mutex::new(Vec::new()),
            exports: AtomicUsize::new(0),
        }
    }

    /// 常にpullが失敗するエンジン。
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new(Vec::new())
        }
    }

    pub fn logins(&self) -> Vec<String> {
        self.logins.lock().unwrap().clone()
    }

    pub fn pulls(&self) -> Vec<String> {
        self.pulls.lock().unwrap().clone()
    }

    pub fn exports(&self) -> usize {
        self.exports.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl ContainerEngine for MockEngine {
    async fn login(
        &self,
        registry: &str,
        credentials: &RegistryCredentials,
    ) -> Result<(), OrchestratorError> {
        self.logins
            .lock()
            .unwrap()
            .push(format!("{registry}:{}", credentials.username));
        Ok(())
    }

    async fn pull(&self, image: &str) -> Result<String, OrchestratorError> {
        if self.fail {
            return Err(OrchestratorError::ImagePull(format!("manifest unknown: {image}")));
        }
        self.pulls.lock().unwrap().push(image.to_string());
        Ok(format!("sha256:{}", hex::encode(crypto::sha256(image.as_bytes()))))
    }

    async fn export(&self, _image: &str) -> Result<Vec<u8>, OrchestratorError> {
        self.exports.fetch_add(1, Ordering::SeqCst);
        Ok(self.image.clone())
    }
}

// ---------------------------------------------------------------------------
// ScriptedConnector
// ---------------------------------------------------------------------------

/// 最初の `n` 回の接続を拒否し、その後は実際に接続する。
pub struct ScriptedConnector {
    failures: AtomicU32,
    attempts: AtomicU32,
}

impl ScriptedConnector {
    pub fn failing_first(n: u32) -> Self {
        Self {
            failures: AtomicU32::new(n),
            attempts: AtomicU32::new(0),
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Connector for ScriptedConnector {
    async fn connect(
        &self,
        addr: &EnvironmentAddress,
        options: ChannelOptions,
    ) -> Result<Channel, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let refuse = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refuse {
            return Err(TransportError::Connect {
                addr: addr.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "scripted"),
            });
        }
        Channel::connect(addr, options).await
    }
}

// ---------------------------------------------------------------------------
// MockEnclave
// ---------------------------------------------------------------------------

/// モックエンクレーブの振る舞い。
#[derive(Debug, Clone, Default)]
pub struct MockEnclaveOptions {
    /// 自身の秘密鍵と対にならない公開鍵を報告する
    pub advertise_wrong_key: bool,
    /// `load_data` を受けたら以降一切読まない
    pub stall_on_load_data: bool,
    /// 最初の `load_data` を認証エラーで拒否する
    pub reject_first_load_data: bool,
    /// 結果の暗号文を1バイト書き換えて返す
    pub tamper_result: bool,
    /// Attestation Documentのサイズとして巨大な値を宣言する
    pub oversized_attestation: bool,
}

/// モックエンクレーブの観測値。
#[derive(Debug, Default)]
pub struct MockEnclaveStats {
    pub connections: AtomicUsize,
    pub images_loaded: AtomicUsize,
    pub attestations: AtomicUsize,
    pub load_data_rejections: AtomicUsize,
    pub computes: AtomicUsize,
    pub image_sizes: Mutex<Vec<u64>>,
    pub image_references: Mutex<Vec<String>>,
    pub ephemeral_keys: Mutex<Vec<String>>,
}

impl MockEnclaveStats {
    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

/// TCP上のモックエンクレーブ。
pub struct MockEnclave {
    pub address: EnvironmentAddress,
    pub stats: Arc<MockEnclaveStats>,
}

struct EnclaveKeys {
    secret: X25519StaticSecret,
    advertised: X25519PublicKey,
}

impl MockEnclave {
    pub async fn start(options: MockEnclaveOptions) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = EnvironmentAddress::Tcp(listener.local_addr().unwrap().to_string());
        let stats = Arc::new(MockEnclaveStats::default());

        let secret = X25519StaticSecret::random_from_rng(rand::rngs::OsRng);
        let advertised = if options.advertise_wrong_key {
            X25519PublicKey::from(&X25519StaticSecret::random_from_rng(rand::rngs::OsRng))
        } else {
            X25519PublicKey::from(&secret)
        };
        let keys = Arc::new(EnclaveKeys { secret, advertised });

        let server_stats = stats.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let keys = keys.clone();
                let options = options.clone();
                let stats = server_stats.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve(stream, &keys, &options, &stats).await {
                        tracing::debug!(error = %e, "モックエンクレーブの接続が終了");
                    }
                });
            }
        });

        Self { address, stats }
    }
}

fn open_input(
    keys: &EnclaveKeys,
    envelope: &WireKeyEnvelope,
    nonce: &str,
    ciphertext: Vec<u8>,
) -> Result<(KeyEnvelope, Vec<u8>), crypto::CryptoError> {
    let wrapped = WrappedKey::from_b64_parts(
        &envelope.ephemeral_public_key,
        &envelope.nonce,
        &envelope.wrapped_key,
    )?;
    let data_key = KeyEnvelope::unwrap_with(&wrapped, &keys.secret)?;
    let payload = EncryptedPayload::from_wire(CONTEXT_INPUT, nonce, ciphertext)?;
    let input = data_key.open(&payload)?;
    Ok((data_key, input))
}

async fn serve(
    stream: tokio::net::TcpStream,
    keys: &EnclaveKeys,
    options: &MockEnclaveOptions,
    stats: &MockEnclaveStats,
) -> Result<(), TransportError> {
    stats.connections.fetch_add(1, Ordering::SeqCst);
    let mut channel = Channel::from_stream(Box::new(stream), "parent", ChannelOptions::default());
    let mut loaded: Option<(KeyEnvelope, Vec<u8>)> = None;
    let mut load_data_count = 0usize;

    while let Some(request) = channel.recv_request().await? {
        match request {
            Request::LoadImage { size, reference } => {
                channel.recv_bulk(size).await?;
                stats.images_loaded.fetch_add(1, Ordering::SeqCst);
                stats.image_sizes.lock().unwrap().push(size);
                if let Some(reference) = reference {
                    stats.image_references.lock().unwrap().push(reference);
                }
                channel.send_reply(&Reply::Ack).await?;
            }
            Request::DoAttestation { nonce } => {
                stats.attestations.fetch_add(1, Ordering::SeqCst);
                let document = serde_json::to_vec(&serde_json::json!({
                    "module_id": "mock-enclave",
                    "nonce": nonce,
                    "public_key": crypto::encode_public_key(&keys.advertised),
                }))
                .unwrap();
                if options.oversized_attestation {
                    channel
                        .send_reply(&Reply::Attestation {
                            size: 16 * 1024 * 1024 * 1024,
                            public_key: crypto::encode_public_key(&keys.advertised),
                        })
                        .await?;
                    continue;
                }
                channel
                    .send_reply(&Reply::Attestation {
                        size: document.len() as u64,
                        public_key: crypto::encode_public_key(&keys.advertised),
                    })
                    .await?;
                channel.send_bytes(&document).await?;
            }
            Request::LoadData {
                size,
                nonce,
                key_envelope,
            } => {
                if options.stall_on_load_data {
                    std::future::pending::<()>().await;
                }
                let ciphertext = channel.recv_bulk(size).await?;
                load_data_count += 1;
                stats
                    .ephemeral_keys
                    .lock()
                    .unwrap()
                    .push(key_envelope.ephemeral_public_key.clone());
                if options.reject_first_load_data && load_data_count == 1 {
                    stats.load_data_rejections.fetch_add(1, Ordering::SeqCst);
                    channel
                        .send_reply(&Reply::Nack {
                            kind: FaultKind::Authentication,
                            detail: "scripted rejection".to_string(),
                        })
                        .await?;
                    continue;
                }
                match open_input(keys, &key_envelope, &nonce, ciphertext) {
                    Ok(opened) => {
                        loaded = Some(opened);
                        channel.send_reply(&Reply::Ack).await?;
                    }
                    Err(e) => {
                        stats.load_data_rejections.fetch_add(1, Ordering::SeqCst);
                        loaded = None;
                        channel
                            .send_reply(&Reply::Nack {
                                kind: FaultKind::Authentication,
                                detail: e.to_string(),
                            })
                            .await?;
                    }
                }
            }
            Request::StartCompute(req) => {
                let bundle_ciphertext = match &req.runtime_bundle {
                    Some(header) => Some((header.nonce.clone(), channel.recv_bulk(header.size).await?)),
                    None => None,
                };
                let Some((data_key, input)) = &loaded else {
                    channel
                        .send_reply(&Reply::Nack {
                            kind: FaultKind::Protocol,
                            detail: "入力がロードされていません".to_string(),
                        })
                        .await?;
                    continue;
                };
                let bundle_len = match bundle_ciphertext {
                    None => None,
                    Some((nonce, ciphertext)) => {
                        let opened = EncryptedPayload::from_wire(CONTEXT_RUNTIME_BUNDLE, &nonce, ciphertext)
                            .and_then(|payload| data_key.open(&payload));
                        match opened {
                            Ok(bundle) => Some(bundle.len()),
                            Err(e) => {
                                channel
                                    .send_reply(&Reply::Nack {
                                        kind: FaultKind::Authentication,
                                        detail: e.to_string(),
                                    })
                                    .await?;
                                continue;
                            }
                        }
                    }
                };
                channel.send_reply(&Reply::Ack).await?;

                stats.computes.fetch_add(1, Ordering::SeqCst);
                let output = run_workload(&req.command, input, bundle_len).await;
                let mut result = data_key
                    .seal(&serde_json::to_vec(&output).unwrap(), CONTEXT_RESULT)
                    .unwrap();
                if options.tamper_result {
                    result.ciphertext[0] ^= 0x01;
                }
                channel
                    .send_reply(&Reply::Result {
                        size: result.len() as u64,
                        nonce: result.nonce_b64(),
                        exit_code: output.exit_code,
                    })
                    .await?;
                channel.send_bytes(&result.ciphertext).await?;
            }
        }
    }
    Ok(())
}

/// `sh -c` でワークロードを実行する。入力は標準入力に渡す。
async fn run_workload(command: &str, input: &[u8], bundle_len: Option<usize>) -> WorkloadOutput {
    let mut cmd = tokio::process::Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped());
    if let Some(len) = bundle_len {
        cmd.env("SEALRUN_BUNDLE_LEN", len.to_string());
    }
    let mut child = cmd.spawn().unwrap();
    if let Some(mut stdin) = child.stdin.take() {
        let _ = stdin.write_all(input).await;
    }
    let output = child.wait_with_output().await.unwrap();
    WorkloadOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    }
}
