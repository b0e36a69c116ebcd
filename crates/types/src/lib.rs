//! # sealrun 共有型定義
//!
//! 親インスタンス側オーケストレータとエンクレーブ側ランタイムが共有する
//! データ構造をRust構造体として提供する。
//!
//! ## 構成
//! - ジョブモデル: [`Job`], [`ModuleDescriptor`], [`Environment`], [`JobState`]
//! - ワイヤメッセージ: [`Request`], [`Reply`]（JSON、length-prefixedフレームで送受信）
//! - 実行結果: [`WorkloadOutput`]（結果ペイロードの平文）
//!
//! ## エンコーディング規則
//! - Base64: バイナリデータ（公開鍵、ノンス、ラップ済み鍵、インラインバンドル）

use serde::{Deserialize, Serialize};

pub use uuid::Uuid;

/// ジョブ識別子
pub type JobId = Uuid;

// ---------------------------------------------------------------------------
// モジュール記述子
// ---------------------------------------------------------------------------

/// ホスト側パスとコンテナ内パスの対応規則。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathMapping {
    /// ペイロード内（またはホスト側）のパス
    pub source: String,
    /// コンテナ内の配置先パス（絶対パス）
    pub target: String,
}

impl PathMapping {
    /// 新しいPathMappingを作成する。
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
        }
    }
}

/// コンテナワークロードの宣言的記述。
/// エンクレーブに送信され、そのまま実行される。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleDescriptor {
    /// モジュール名（ログ・結果の識別用）
    pub name: String,
    /// コンテナイメージ参照（例: `registry.example.com/tools/runner:1.2`）
    pub image: String,
    /// コンテナ内の作業ディレクトリ
    pub working_dir: String,
    /// 実行するコマンドライン
    pub command: String,
    /// 入力ファイルのマッピング（順序を保持）
    #[serde(default)]
    pub input: Vec<PathMapping>,
    /// 出力ファイルのマッピング（順序を保持）
    #[serde(default)]
    pub output: Vec<PathMapping>,
    /// ソースファイルのマッピング（順序を保持）
    #[serde(default)]
    pub source: Vec<PathMapping>,
}

impl ModuleDescriptor {
    /// 必須フィールドの形式を検証する。
    ///
    /// 失敗はジョブにとって終端エラー（リトライしても結果は変わらない）。
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("モジュール名が空です".to_string());
        }
        if self.image.trim().is_empty() {
            return Err("イメージ参照が空です".to_string());
        }
        if self.command.trim().is_empty() {
            return Err("コマンドが空です".to_string());
        }
        if !self.working_dir.starts_with('/') {
            return Err(format!(
                "作業ディレクトリは絶対パスである必要があります: {}",
                self.working_dir
            ));
        }
        let mappings = self
            .input
            .iter()
            .chain(self.output.iter())
            .chain(self.source.iter());
        for mapping in mappings {
            if mapping.source.is_empty() {
                return Err("マッピングのsourceが空です".to_string());
            }
            if !mapping.target.starts_with('/') {
                return Err(format!(
                    "マッピングのtargetは絶対パスである必要があります: {}",
                    mapping.target
                ));
            }
        }
        Ok(())
    }
}

/// ジョブの実行環境種別。
///
/// 文字列タグではなく閉じた列挙型で表現し、分岐は網羅的に検査される。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Environment {
    /// モジュールをそのままコンテナとして実行する
    Container,
    /// 別の登録済みジョブに委譲する。ジョブサービスから取得した
    /// モジュール記述子で一度だけ置き換えてから続行する。
    Delegated {
        /// ジョブサービスに渡すモジュール参照
        module_reference: String,
    },
    /// 未対応の環境
    Unsupported {
        /// 呼び出し側が指定した環境名
        name: String,
    },
}

/// ジョブに追加で注入するファイル群（例: 呼び出し側のソースアーカイブ）。
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuntimeBundle {
    /// バイト列をジョブに直接保持する
    Inline {
        /// バンドル名
        name: String,
        /// バンドル本体
        #[serde(with = "b64")]
        data: Vec<u8>,
    },
    /// URIから取得する（委譲ジョブのジョブサービスが返す形式）
    Remote {
        /// 取得元URI
        uri: String,
    },
}

impl std::fmt::Debug for RuntimeBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuntimeBundle::Inline { name, data } => f
                .debug_struct("Inline")
                .field("name", name)
                .field("len", &data.len())
                .finish(),
            RuntimeBundle::Remote { uri } => f.debug_struct("Remote").field("uri", uri).finish(),
        }
    }
}

// ---------------------------------------------------------------------------
// ジョブ状態機械
// ---------------------------------------------------------------------------

/// ジョブの状態。
///
/// `Pending → AcquiringImage → StartingEnvironment → ShippingImage → Attesting →
/// ShippingInput → Computing → FetchingResult → Done` の順に遷移し、
/// 任意の状態から `Failed` に遷移できる。`Done` と `Failed` は終端状態。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    AcquiringImage,
    StartingEnvironment,
    ShippingImage,
    Attesting,
    ShippingInput,
    Computing,
    FetchingResult,
    Done,
    Failed,
}

impl JobState {
    /// 正常系の遷移順序。
    pub const SEQUENCE: [JobState; 9] = [
        JobState::Pending,
        JobState::AcquiringImage,
        JobState::StartingEnvironment,
        JobState::ShippingImage,
        JobState::Attesting,
        JobState::ShippingInput,
        JobState::Computing,
        JobState::FetchingResult,
        JobState::Done,
    ];

    /// 状態に対応する進捗率（0〜100）。`Failed` は `None`。
    pub fn percent(&self) -> Option<u8> {
        match self {
            JobState::Pending => Some(0),
            JobState::AcquiringImage => Some(5),
            JobState::StartingEnvironment => Some(20),
            JobState::ShippingImage => Some(35),
            JobState::Attesting => Some(50),
            JobState::ShippingInput => Some(60),
            JobState::Computing => Some(70),
            JobState::FetchingResult => Some(90),
            JobState::Done => Some(100),
            JobState::Failed => None,
        }
    }

    /// 正常系の遷移順序における位置。`Failed` は `None`。
    pub fn ordinal(&self) -> Option<usize> {
        Self::SEQUENCE.iter().position(|s| s == self)
    }

    /// 状態遷移時に報告する人間向けメッセージ。
    pub fn message(&self) -> &'static str {
        match self {
            JobState::Pending => "待機中",
            JobState::AcquiringImage => "コンテナイメージを取得中",
            JobState::StartingEnvironment => "隔離実行環境を起動中",
            JobState::ShippingImage => "イメージを転送中",
            JobState::Attesting => "Attestationを取得中",
            JobState::ShippingInput => "暗号化入力を転送中",
            JobState::Computing => "ワークロードを実行中",
            JobState::FetchingResult => "暗号化結果を取得中",
            JobState::Done => "完了",
            JobState::Failed => "失敗",
        }
    }

    /// 終端状態かどうか。
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Done | JobState::Failed)
    }

    /// 同一試行内で `self` から `next` への遷移が許可されるか。
    pub fn can_advance_to(&self, next: JobState) -> bool {
        if self.is_terminal() {
            return false;
        }
        if next == JobState::Failed {
            return true;
        }
        match (self.ordinal(), next.ordinal()) {
            (Some(cur), Some(nxt)) => nxt == cur + 1,
            _ => false,
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobState::Pending => "pending",
            JobState::AcquiringImage => "acquiring_image",
            JobState::StartingEnvironment => "starting_environment",
            JobState::ShippingImage => "shipping_image",
            JobState::Attesting => "attesting",
            JobState::ShippingInput => "shipping_input",
            JobState::Computing => "computing",
            JobState::FetchingResult => "fetching_result",
            JobState::Done => "done",
            JobState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// 進捗（0〜100の割合と人間向けメッセージ）。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    /// 何回目の試行か（1始まり）
    pub attempt: u32,
    /// 進捗率
    pub percent: u8,
    /// メッセージ
    pub message: String,
}

// ---------------------------------------------------------------------------
// エラー分類
// ---------------------------------------------------------------------------

/// ジョブ失敗の分類。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobErrorKind {
    /// 実行環境に到達できない
    Connect,
    /// 読み取りが途中で終了した
    ShortRead,
    /// ワイヤ交換が不正
    Protocol,
    /// AEAD認証タグ不一致（改ざんまたは鍵不一致）
    Authentication,
    /// イメージ取得失敗
    ImagePull,
    /// 実行環境の起動失敗
    EnvironmentStart,
    /// ワークロード自体が失敗した（エンクレーブは正常）
    Compute,
    /// ジョブがキャンセルされた
    Cancelled,
    /// モジュール記述子または環境指定が不正
    InvalidModule,
    /// 分類不能なエラー
    Unexpected,
}

impl std::fmt::Display for JobErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobErrorKind::Connect => "connect",
            JobErrorKind::ShortRead => "short_read",
            JobErrorKind::Protocol => "protocol",
            JobErrorKind::Authentication => "authentication",
            JobErrorKind::ImagePull => "image_pull",
            JobErrorKind::EnvironmentStart => "environment_start",
            JobErrorKind::Compute => "compute",
            JobErrorKind::Cancelled => "cancelled",
            JobErrorKind::InvalidModule => "invalid_module",
            JobErrorKind::Unexpected => "unexpected",
        };
        f.write_str(s)
    }
}

/// ジョブに記録される構造化エラー。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    /// 分類
    pub kind: JobErrorKind,
    /// 人間向けの詳細
    pub detail: String,
    /// 失敗した試行番号（1始まり）
    pub attempt: u32,
}

// ---------------------------------------------------------------------------
// ジョブ
// ---------------------------------------------------------------------------

/// 作業単位。1回の実行の間、オーケストレータのワーカーが排他的に所有する。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// 一意なジョブID
    pub id: JobId,
    /// 実行するモジュール
    pub module: ModuleDescriptor,
    /// 追加注入ファイル
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_bundle: Option<RuntimeBundle>,
    /// 実行環境種別
    pub environment: Environment,
    /// 現在の状態
    pub state: JobState,
    /// 最新の進捗
    pub progress: Progress,
    /// 進捗履歴（失敗後の診断用）
    #[serde(default)]
    pub progress_history: Vec<Progress>,
    /// 直近のエラー
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    /// 実行した試行回数
    #[serde(default)]
    pub attempts: u32,
}

impl Job {
    /// `Pending` 状態の新しいジョブを作成する。
    pub fn new(module: ModuleDescriptor, environment: Environment) -> Self {
        Self {
            id: Uuid::new_v4(),
            module,
            runtime_bundle: None,
            environment,
            state: JobState::Pending,
            progress: Progress {
                attempt: 0,
                percent: 0,
                message: JobState::Pending.message().to_string(),
            },
            progress_history: Vec::new(),
            error: None,
            attempts: 0,
        }
    }

    /// ランタイムバンドルを付与する。
    pub fn with_runtime_bundle(mut self, bundle: RuntimeBundle) -> Self {
        self.runtime_bundle = Some(bundle);
        self
    }

    /// 終端状態に達したかどうか。
    pub fn is_finished(&self) -> bool {
        self.state.is_terminal()
    }
}

// ---------------------------------------------------------------------------
// ワイヤメッセージ（親 → エンクレーブ）
// ---------------------------------------------------------------------------

/// ラップ済み鍵エンベロープのワイヤ表現。
/// 対称鍵そのものは含まず、エンクレーブの公開鍵宛てにラップされた鍵のみを含む。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireKeyEnvelope {
    /// Base64エンコードされたエフェメラルX25519公開鍵（32バイト）
    pub ephemeral_public_key: String,
    /// Base64エンコードされたラップ用AES-GCMノンス（12バイト）
    pub nonce: String,
    /// Base64エンコードされたラップ済みデータ鍵（暗号文 + タグ）
    pub wrapped_key: String,
}

/// バルク転送のヘッダ（サイズとペイロードのノンス）。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkHeader {
    /// 後続するバイト数
    pub size: u64,
    /// Base64エンコードされたAES-GCMノンス（12バイト）
    pub nonce: String,
}

/// start_compute リクエスト本体。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputeRequest {
    /// モジュール名
    pub module_name: String,
    /// 作業ディレクトリ
    pub working_dir: String,
    /// コマンドライン
    pub command: String,
    /// 入力マッピング
    pub input: Vec<PathMapping>,
    /// ソースマッピング
    pub source: Vec<PathMapping>,
    /// 出力マッピング
    pub output: Vec<PathMapping>,
    /// 暗号化ランタイムバンドル（存在する場合、直後にバルク送信される）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_bundle: Option<BulkHeader>,
}

impl ComputeRequest {
    /// モジュール記述子から構築する。
    pub fn from_module(module: &ModuleDescriptor, runtime_bundle: Option<BulkHeader>) -> Self {
        Self {
            module_name: module.name.clone(),
            working_dir: module.working_dir.clone(),
            command: module.command.clone(),
            input: module.input.clone(),
            source: module.source.clone(),
            output: module.output.clone(),
            runtime_bundle,
        }
    }
}

/// 親インスタンスからエンクレーブへの制御メッセージ。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// イメージをロードする。`size` バイトのイメージが後続する。
    /// Directモードでは `size = 0` で `reference` のみを伝える。
    LoadImage {
        size: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reference: Option<String>,
    },
    /// 暗号化入力をロードする。`size` バイトの暗号文が後続する。
    LoadData {
        size: u64,
        nonce: String,
        key_envelope: WireKeyEnvelope,
    },
    /// Attestation Documentを要求する。
    DoAttestation {
        /// Base64エンコードされたフレッシュネス用ノンス
        #[serde(default, skip_serializing_if = "Option::is_none")]
        nonce: Option<String>,
    },
    /// ワークロードを実行する。
    StartCompute(ComputeRequest),
}

impl Request {
    /// ログ用のコマンド名。
    pub fn name(&self) -> &'static str {
        match self {
            Request::LoadImage { .. } => "load_image",
            Request::LoadData { .. } => "load_data",
            Request::DoAttestation { .. } => "do_attestation",
            Request::StartCompute(_) => "start_compute",
        }
    }
}

// ---------------------------------------------------------------------------
// ワイヤメッセージ（エンクレーブ → 親）
// ---------------------------------------------------------------------------

/// エンクレーブが報告する失敗の種別。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    /// ペイロードの復号・認証に失敗
    Authentication,
    /// リクエストが不正
    Protocol,
    /// ワークロードの起動に失敗
    Compute,
    /// エンクレーブ内部エラー
    Internal,
}

/// エンクレーブから親インスタンスへの応答。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Reply {
    /// 受理
    Ack,
    /// 拒否
    Nack { kind: FaultKind, detail: String },
    /// Attestationヘッダ。`size` バイトのAttestation Documentが後続する。
    Attestation {
        size: u64,
        /// Base64エンコードされたエンクレーブのX25519公開鍵（32バイト）
        public_key: String,
    },
    /// 結果記述子。`size` バイトの暗号文が後続する。
    Result {
        size: u64,
        nonce: String,
        exit_code: i32,
    },
}

/// 結果ペイロードの平文（エンクレーブ側が生成し、呼び出し側が復号して読む）。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadOutput {
    /// 終了コード
    pub exit_code: i32,
    /// 標準出力
    pub stdout: String,
    /// 標準エラー出力
    pub stderr: String,
}

// ---------------------------------------------------------------------------
// Base64 serde ヘルパー
// ---------------------------------------------------------------------------

mod b64 {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&base64::engine::general_purpose::STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        base64::engine::general_purpose::STANDARD
            .decode(s)
            .map_err(serde::de::Error::custom)
    }
}
