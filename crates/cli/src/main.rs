//! # sealrun CLI
//!
//! 1つのジョブを隔離実行環境で実行し、結果を復号して表示する。
//!
//! ## サブコマンド
//! - `run` — モジュールを実行する。終了コードはワークロードの終了コードになる
//! - `keygen` — X25519鍵ペアを生成する（エンクレーブ側の開発用）
//!
//! 設定は環境変数（[`settings`] 参照）とフラグから組み立てる。
//! レジストリ認証は `REGISTRY_TOKEN_URL` があればトークン交換、
//! なければ `REGISTRY_USERNAME` / `REGISTRY_TOKEN` を直接使う。

mod settings;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use base64::Engine;
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use sealrun_crypto::{encode_public_key, X25519PublicKey, X25519StaticSecret};
use sealrun_orchestrator::enclave::{
    ControlPlane, HttpControlPlane, NitroCliControlPlane, StaticControlPlane,
};
use sealrun_orchestrator::image::{DockerCli, HttpTokenExchange, RegistryAuth, StaticRegistryAuth};
use sealrun_orchestrator::job_service::HttpJobService;
use sealrun_orchestrator::status::{HttpStatusSink, TracingSink};
use sealrun_orchestrator::{AttestationDocument, AttestationVerifier, Orchestrator};
use sealrun_transport::EnvironmentAddress;
use sealrun_types::{Environment, Job, ModuleDescriptor, RuntimeBundle};

#[derive(Parser, Debug)]
#[command(name = "sealrun", version, about = "隔離実行環境でコンテナワークロードを実行する")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// モジュールを実行する
    Run(RunArgs),
    /// X25519鍵ペアを生成してBase64で出力する
    Keygen,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum ControlPlaneKind {
    /// `--address` の既存環境に接続する
    Static,
    /// `nitro-cli` でエンクレーブを起動する
    Nitro,
    /// HTTPのコントロールプレーン（`SEALRUN_CONTROL_PLANE_URL`）
    Http,
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// モジュール記述子（JSON）。指定時は --image / --command より優先
    #[arg(long)]
    module: Option<PathBuf>,
    /// コンテナイメージ参照
    #[arg(long)]
    image: Option<String>,
    /// 実行するコマンドライン
    #[arg(long)]
    command: Option<String>,
    /// コンテナ内の作業ディレクトリ
    #[arg(long, default_value = "/work")]
    working_dir: String,
    /// モジュール名
    #[arg(long, default_value = "cli")]
    name: String,
    /// 入力ファイル（省略時は空入力）
    #[arg(long)]
    input: Option<PathBuf>,
    /// ジョブサービスに委譲するモジュール参照
    #[arg(long)]
    delegate: Option<String>,
    /// ジョブに添付するランタイムバンドル
    #[arg(long)]
    bundle: Option<PathBuf>,
    /// 実行環境の起動方法
    #[arg(long, value_enum, default_value_t = ControlPlaneKind::Nitro)]
    control_plane: ControlPlaneKind,
    /// 既存の実行環境のアドレス（`tcp:host:port` または `vsock:cid:port`）
    #[arg(long)]
    address: Option<EnvironmentAddress>,
    /// 期待するエンクレーブ公開鍵（Base64）。一致しなければ中止する
    #[arg(long)]
    expect_public_key: Option<String>,
    /// Attestation Document（Base64）の書き出し先
    #[arg(long)]
    attestation_out: Option<PathBuf>,
}

/// エンクレーブ公開鍵を固定値と照合する検証者。
struct PinnedKeyVerifier {
    expected: X25519PublicKey,
}

impl AttestationVerifier for PinnedKeyVerifier {
    fn verify(&self, document: &AttestationDocument) -> Result<(), String> {
        if document.enclave_public_key != self.expected {
            return Err(format!(
                "エンクレーブ公開鍵が一致しません: {}",
                document.public_key_b64()
            ));
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Keygen => {
            keygen();
            Ok(())
        }
        Command::Run(args) => {
            let code = run(args).await?;
            std::process::exit(code);
        }
    }
}

fn keygen() {
    let secret = X25519StaticSecret::random_from_rng(rand::rngs::OsRng);
    let public = X25519PublicKey::from(&secret);
    let b64 = base64::engine::general_purpose::STANDARD;
    println!("secret_key={}", b64.encode(secret.to_bytes()));
    println!("public_key={}", encode_public_key(&public));
}

fn load_module(args: &RunArgs) -> anyhow::Result<ModuleDescriptor> {
    if let Some(path) = &args.module {
        let raw = std::fs::read(path)
            .with_context(|| format!("モジュール記述子を読めません: {}", path.display()))?;
        return serde_json::from_slice(&raw)
            .with_context(|| format!("モジュール記述子をパースできません: {}", path.display()));
    }
    let (Some(image), Some(command)) = (&args.image, &args.command) else {
        bail!("--module か、--image と --command を指定してください");
    };
    Ok(ModuleDescriptor {
        name: args.name.clone(),
        image: image.clone(),
        working_dir: args.working_dir.clone(),
        command: command.clone(),
        input: Vec::new(),
        output: Vec::new(),
        source: Vec::new(),
    })
}

fn registry_auth(client: &reqwest::Client) -> Arc<dyn RegistryAuth> {
    let username = std::env::var("REGISTRY_USERNAME").unwrap_or_else(|_| "sealrun".to_string());
    match settings::process_env("REGISTRY_TOKEN_URL") {
        Some(url) => {
            tracing::info!(url = %url, "レジストリのトークン交換を使用します");
            let api_token = std::env::var("REGISTRY_API_TOKEN").unwrap_or_default();
            Arc::new(HttpTokenExchange::new(client.clone(), url, api_token, username))
        }
        None => {
            let token = std::env::var("REGISTRY_TOKEN").unwrap_or_default();
            Arc::new(StaticRegistryAuth::new(username, token))
        }
    }
}

fn control_plane(
    args: &RunArgs,
    client: &reqwest::Client,
    enclave_port: u32,
) -> anyhow::Result<Arc<dyn ControlPlane>> {
    Ok(match args.control_plane {
        ControlPlaneKind::Static => {
            let Some(address) = args.address.clone() else {
                bail!("--control-plane static には --address が必要です");
            };
            Arc::new(StaticControlPlane::new(address))
        }
        ControlPlaneKind::Nitro => Arc::new(NitroCliControlPlane::new(enclave_port)),
        ControlPlaneKind::Http => {
            let url = settings::process_env("SEALRUN_CONTROL_PLANE_URL")
                .context("--control-plane http には SEALRUN_CONTROL_PLANE_URL が必要です")?;
            Arc::new(HttpControlPlane::new(client.clone(), url))
        }
    })
}

async fn run(args: RunArgs) -> anyhow::Result<i32> {
    let config = settings::orchestrator_config(&settings::process_env)?;
    let client = config.http_client()?;

    let module = load_module(&args)?;
    let environment = match &args.delegate {
        Some(reference) => Environment::Delegated {
            module_reference: reference.clone(),
        },
        None => Environment::Container,
    };
    let mut job = Job::new(module, environment);
    if let Some(path) = &args.bundle {
        let data = std::fs::read(path)
            .with_context(|| format!("バンドルを読めません: {}", path.display()))?;
        job = job.with_runtime_bundle(RuntimeBundle::Inline {
            name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "bundle".to_string()),
            data,
        });
    }
    let input = match &args.input {
        Some(path) => std::fs::read(path)
            .with_context(|| format!("入力ファイルを読めません: {}", path.display()))?,
        None => Vec::new(),
    };

    let control_plane = control_plane(&args, &client, config.enclave.port)?;
    let mut orchestrator = Orchestrator::new(
        config,
        Arc::new(DockerCli::default()),
        registry_auth(&client),
        control_plane,
    )?
    .with_http_client(client.clone())
    .with_sink(Arc::new(TracingSink));

    if let Some(url) = settings::process_env("SEALRUN_STATUS_URL") {
        orchestrator = orchestrator.with_sink(Arc::new(HttpStatusSink::new(client.clone(), url)));
    }
    if let Some(url) = settings::process_env("SEALRUN_JOB_SERVICE_URL") {
        orchestrator = orchestrator.with_job_service(Arc::new(HttpJobService::new(client.clone(), url)));
    }
    if let Some(key) = &args.expect_public_key {
        let expected = sealrun_crypto::decode_public_key(key).context("--expect-public-key が不正です")?;
        orchestrator = orchestrator.with_verifier(Arc::new(PinnedKeyVerifier { expected }));
    }
    let orchestrator = Arc::new(orchestrator);

    let mut handle = orchestrator.spawn(job);
    tracing::info!(job_id = %handle.id(), "ジョブを開始しました");

    // Ctrl-Cでジョブをキャンセルする
    let cancel = handle.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("中断を受け付けました。ジョブをキャンセルします");
            cancel.cancel();
        }
    });

    if let Some(path) = &args.attestation_out {
        if let Some(document) = handle.attestation().await {
            std::fs::write(path, document.to_base64())
                .with_context(|| format!("Attestationを書き出せません: {}", path.display()))?;
            tracing::info!(path = %path.display(), "Attestation Documentを書き出しました");
        }
    }

    handle.provide_input(input)?;
    let report = handle.wait().await?;

    if let Some(result) = report.result() {
        let output = result.decrypt()?;
        print!("{}", output.stdout);
        eprint!("{}", output.stderr);
        if let Some(error) = report.error() {
            tracing::warn!(kind = %error.kind, "{}", error.detail);
        }
        return Ok(output.exit_code);
    }
    match report.error() {
        Some(error) => bail!(
            "ジョブが失敗しました ({}, 試行 {}): {}",
            error.kind,
            error.attempt,
            error.detail
        ),
        None => bail!("ジョブが結果なしで終了しました"),
    }
}
