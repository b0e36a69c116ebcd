//! # sealrun 暗号エンベロープ
//!
//! 信頼境界を越える全てのペイロードを保護するハイブリッド暗号化を実装する。
//!
//! ## 暗号アルゴリズム
//! | 用途 | アルゴリズム |
//! |------|------------|
//! | 鍵ラップ用鍵交換 | X25519 ECDH |
//! | 鍵導出 | HKDF-SHA256 |
//! | 対称暗号 | AES-256-GCM |
//! | ダイジェスト | SHA-256 |
//!
//! ## 鍵の流れ
//! 1. 親インスタンスは試行ごとに新しいデータ鍵（[`KeyEnvelope`]）を生成する
//! 2. データ鍵はエンクレーブのX25519公開鍵宛てにラップされ（[`KeyEnvelope::wrap_for`]）、
//!    平文の対称鍵が制御メッセージに載ることはない
//! 3. ペイロードごとの鍵は `derive_key(データ鍵, コンテキスト)` で導出する
//! 4. ノンスは [`seal`] の内部で毎回生成され、呼び出し側から渡されることはない

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use hkdf::Hkdf;
use rand::RngCore;
use sha2::{Digest, Sha256};

pub use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret as X25519StaticSecret};

/// 暗号処理のエラー型
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// ECDH鍵交換エラー（低位数点など、共有秘密が寄与的でない）
    #[error("ECDH鍵交換に失敗しました")]
    EcdhError,
    /// HKDF鍵導出エラー
    #[error("HKDF鍵導出に失敗しました: {0}")]
    HkdfError(String),
    /// AES-GCM暗号化エラー
    #[error("AES-GCM暗号化に失敗しました")]
    EncryptError,
    /// AES-GCM認証失敗（改ざん・切り詰め・鍵不一致）
    #[error("AES-GCM認証に失敗しました（改ざんまたは鍵不一致）")]
    AuthenticationError,
    /// 鍵・ノンスの長さやエンコーディングが不正
    #[error("不正な鍵素材: {0}")]
    InvalidKeyMaterial(String),
}

/// 対称鍵（AES-256用、32バイト）
pub type SymmetricKey = [u8; 32];

/// AES-GCMノンス長（バイト）
pub const NONCE_LEN: usize = 12;

/// AES-GCM認証タグ長（バイト）
pub const TAG_LEN: usize = 16;

/// 鍵ラップ用HKDFのinfo
const WRAP_INFO: &[u8] = b"sealrun-key-wrap";

/// 入力ペイロード用の鍵導出コンテキスト
pub const CONTEXT_INPUT: &str = "input";
/// ランタイムバンドル用の鍵導出コンテキスト
pub const CONTEXT_RUNTIME_BUNDLE: &str = "runtime-bundle";
/// 結果ペイロード用の鍵導出コンテキスト
pub const CONTEXT_RESULT: &str = "result";

/// Base64エンジン（Standard）
fn b64() -> base64::engine::GeneralPurpose {
    base64::engine::general_purpose::STANDARD
}

// ---------------------------------------------------------------------------
// AEAD鍵
// ---------------------------------------------------------------------------

/// AEAD鍵。`Debug` 出力では鍵バイトを表示しない。
#[derive(Clone, PartialEq, Eq)]
pub struct AeadKey(SymmetricKey);

impl AeadKey {
    /// OSの乱数源から新しい鍵を生成する。
    pub fn generate() -> Self {
        let mut key = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut key);
        Self(key)
    }

    /// 既存の鍵バイトから構築する。
    pub fn from_bytes(bytes: SymmetricKey) -> Self {
        Self(bytes)
    }

    /// 鍵バイトへの参照を返す。ログやディスクに書き出してはならない。
    pub fn as_bytes(&self) -> &SymmetricKey {
        &self.0
    }
}

impl std::fmt::Debug for AeadKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AeadKey(<redacted>)")
    }
}

// ---------------------------------------------------------------------------
// 低レベルプリミティブ
// ---------------------------------------------------------------------------

/// X25519 ECDHによる共有秘密の導出。
///
/// 親側: `ECDH(eph_sk, enclave_pk)`
/// エンクレーブ側: `ECDH(enclave_sk, eph_pk)`
pub fn ecdh_derive_shared_secret(
    secret_key: &X25519StaticSecret,
    public_key: &X25519PublicKey,
) -> Result<[u8; 32], CryptoError> {
    let shared = secret_key.diffie_hellman(public_key);
    if !shared.was_contributory() {
        return Err(CryptoError::EcdhError);
    }
    Ok(*shared.as_bytes())
}

/// HKDF-SHA256による対称鍵の導出。
pub fn hkdf_derive_key(ikm: &[u8; 32], info: &[u8]) -> Result<SymmetricKey, CryptoError> {
    let hkdf = Hkdf::<Sha256>::new(None, ikm);
    let mut key = [0u8; 32];
    hkdf.expand(info, &mut key)
        .map_err(|e| CryptoError::HkdfError(e.to_string()))?;
    Ok(key)
}

/// AES-256-GCMによる暗号化。
fn aes_gcm_encrypt(
    key: &SymmetricKey,
    nonce: &[u8; NONCE_LEN],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::EncryptError)?;
    let nonce = Nonce::from_slice(nonce);
    cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| CryptoError::EncryptError)
}

/// AES-256-GCMによる復号。
fn aes_gcm_decrypt(
    key: &SymmetricKey,
    nonce: &[u8; NONCE_LEN],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher =
        Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::AuthenticationError)?;
    let nonce = Nonce::from_slice(nonce);
    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| CryptoError::AuthenticationError)
}

/// 新しいランダムノンスを生成する。
fn fresh_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}

/// SHA-256ハッシュ計算。
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let result = hasher.finalize();
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&result);
    hash
}

// ---------------------------------------------------------------------------
// 暗号化ペイロード
// ---------------------------------------------------------------------------

/// 暗号化ペイロード（暗号文 + ノンス + 認証タグ + 鍵コンテキスト）。
///
/// `ciphertext` の末尾16バイトがAES-GCMの認証タグ。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedPayload {
    /// 受信側が鍵を導出するためのコンテキスト（例: `"input"`）
    pub context: String,
    /// この暗号化専用のノンス
    pub nonce: [u8; NONCE_LEN],
    /// 暗号文（認証タグを含む）
    pub ciphertext: Vec<u8>,
}

impl EncryptedPayload {
    /// ワイヤ上の表現（Base64ノンス + 生の暗号文）から復元する。
    pub fn from_wire(
        context: &str,
        nonce_b64: &str,
        ciphertext: Vec<u8>,
    ) -> Result<Self, CryptoError> {
        let nonce = decode_fixed::<NONCE_LEN>(nonce_b64, "nonce")?;
        Ok(Self {
            context: context.to_string(),
            nonce,
            ciphertext,
        })
    }

    /// Base64エンコードされたノンス。
    pub fn nonce_b64(&self) -> String {
        b64().encode(self.nonce)
    }

    /// 暗号文のバイト数（バルク転送サイズ）。
    pub fn len(&self) -> usize {
        self.ciphertext.len()
    }

    /// 暗号文が空かどうか（正常な暗号文は最低でもタグ長を持つ）。
    pub fn is_empty(&self) -> bool {
        self.ciphertext.is_empty()
    }
}

/// 平文を暗号化する。ノンスは内部で毎回新しく生成される。
pub fn seal(plaintext: &[u8], key: &AeadKey, context: &str) -> Result<EncryptedPayload, CryptoError> {
    let nonce = fresh_nonce();
    let ciphertext = aes_gcm_encrypt(key.as_bytes(), &nonce, plaintext)?;
    Ok(EncryptedPayload {
        context: context.to_string(),
        nonce,
        ciphertext,
    })
}

/// 暗号化ペイロードを復号する。改ざん・切り詰め・鍵不一致は
/// [`CryptoError::AuthenticationError`] になる。
pub fn open(payload: &EncryptedPayload, key: &AeadKey) -> Result<Vec<u8>, CryptoError> {
    if payload.ciphertext.len() < TAG_LEN {
        return Err(CryptoError::AuthenticationError);
    }
    aes_gcm_decrypt(key.as_bytes(), &payload.nonce, &payload.ciphertext)
}

/// 既存ペイロードを同じ鍵で復号 → 内容を変更 → 新しいノンスで再暗号化する。
///
/// 受信側（エンクレーブや結果を扱う呼び出し側）向けのAPI。オーケストレータは
/// バンドルを独立したペイロードとして送るため、自身では使わない。
/// 復号に失敗した場合、`mutate` は呼ばれない。
pub fn reseal<F>(
    payload: &EncryptedPayload,
    key: &AeadKey,
    mutate: F,
) -> Result<EncryptedPayload, CryptoError>
where
    F: FnOnce(&mut Vec<u8>),
{
    let mut plaintext = open(payload, key)?;
    mutate(&mut plaintext);
    seal(&plaintext, key, &payload.context)
}

/// 鍵素材とコンテキストからペイロード用AEAD鍵を導出する。
pub fn derive_key(key_material: &AeadKey, context: &str) -> Result<AeadKey, CryptoError> {
    let mut info = Vec::with_capacity(8 + context.len());
    info.extend_from_slice(b"sealrun/");
    info.extend_from_slice(context.as_bytes());
    hkdf_derive_key(key_material.as_bytes(), &info).map(AeadKey)
}

// ---------------------------------------------------------------------------
// 鍵エンベロープ
// ---------------------------------------------------------------------------

/// 1回の試行で使うデータ鍵。
///
/// 試行ごとに [`KeyEnvelope::generate`] で作り直す。認証エラー後に同じ鍵素材を
/// 再利用してはならない。
#[derive(Debug, Clone)]
pub struct KeyEnvelope {
    data_key: AeadKey,
}

/// エンクレーブ公開鍵宛てにラップされたデータ鍵。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrappedKey {
    /// エフェメラルX25519公開鍵
    pub ephemeral_public_key: [u8; 32],
    /// ラップ用ノンス
    pub nonce: [u8; NONCE_LEN],
    /// ラップ済みデータ鍵（暗号文 + タグ）
    pub wrapped_key: Vec<u8>,
}

impl WrappedKey {
    /// Base64文字列の3つ組（公開鍵、ノンス、ラップ済み鍵）に変換する。
    pub fn to_b64_parts(&self) -> (String, String, String) {
        (
            b64().encode(self.ephemeral_public_key),
            b64().encode(self.nonce),
            b64().encode(&self.wrapped_key),
        )
    }

    /// Base64文字列の3つ組から復元する。
    pub fn from_b64_parts(
        ephemeral_public_key: &str,
        nonce: &str,
        wrapped_key: &str,
    ) -> Result<Self, CryptoError> {
        Ok(Self {
            ephemeral_public_key: decode_fixed::<32>(ephemeral_public_key, "ephemeral_public_key")?,
            nonce: decode_fixed::<NONCE_LEN>(nonce, "nonce")?,
            wrapped_key: b64()
                .decode(wrapped_key)
                .map_err(|e| CryptoError::InvalidKeyMaterial(format!("wrapped_key: {e}")))?,
        })
    }
}

impl KeyEnvelope {
    /// 新しいデータ鍵を生成する。
    pub fn generate() -> Self {
        Self {
            data_key: AeadKey::generate(),
        }
    }

    /// コンテキストに対応するペイロード用鍵を導出する。
    pub fn payload_key(&self, context: &str) -> Result<AeadKey, CryptoError> {
        derive_key(&self.data_key, context)
    }

    /// コンテキスト用の鍵でペイロードを暗号化する。
    pub fn seal(&self, plaintext: &[u8], context: &str) -> Result<EncryptedPayload, CryptoError> {
        let key = self.payload_key(context)?;
        seal(plaintext, &key, context)
    }

    /// ペイロードのコンテキストに対応する鍵で復号する。
    pub fn open(&self, payload: &EncryptedPayload) -> Result<Vec<u8>, CryptoError> {
        let key = self.payload_key(&payload.context)?;
        open(payload, &key)
    }

    /// データ鍵をエンクレーブのX25519公開鍵宛てにラップする。
    ///
    /// 1. エフェメラルX25519鍵ペアを生成
    /// 2. `ECDH(eph_sk, enclave_pk)` → HKDF-SHA256 でラップ鍵を導出
    /// 3. AES-256-GCMでデータ鍵を暗号化
    pub fn wrap_for(&self, enclave_public_key: &X25519PublicKey) -> Result<WrappedKey, CryptoError> {
        let ephemeral = X25519StaticSecret::random_from_rng(rand::rngs::OsRng);
        let ephemeral_public = X25519PublicKey::from(&ephemeral);
        let shared = ecdh_derive_shared_secret(&ephemeral, enclave_public_key)?;
        let wrap_key = hkdf_derive_key(&shared, WRAP_INFO)?;
        let nonce = fresh_nonce();
        let wrapped_key = aes_gcm_encrypt(&wrap_key, &nonce, self.data_key.as_bytes())?;
        Ok(WrappedKey {
            ephemeral_public_key: ephemeral_public.to_bytes(),
            nonce,
            wrapped_key,
        })
    }

    /// エンクレーブ側: 自身のX25519秘密鍵でラップ済みデータ鍵を復元する。
    pub fn unwrap_with(
        wrapped: &WrappedKey,
        enclave_secret: &X25519StaticSecret,
    ) -> Result<Self, CryptoError> {
        let ephemeral_public = X25519PublicKey::from(wrapped.ephemeral_public_key);
        let shared = ecdh_derive_shared_secret(enclave_secret, &ephemeral_public)?;
        let wrap_key = hkdf_derive_key(&shared, WRAP_INFO)?;
        let raw = aes_gcm_decrypt(&wrap_key, &wrapped.nonce, &wrapped.wrapped_key)?;
        let data_key: SymmetricKey = raw
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyMaterial("データ鍵は32バイトである必要があります".into()))?;
        Ok(Self {
            data_key: AeadKey(data_key),
        })
    }
}

/// Base64文字列をX25519公開鍵としてデコードする。
pub fn decode_public_key(b64_key: &str) -> Result<X25519PublicKey, CryptoError> {
    decode_fixed::<32>(b64_key, "public_key").map(X25519PublicKey::from)
}

/// X25519公開鍵をBase64文字列にエンコードする。
pub fn encode_public_key(key: &X25519PublicKey) -> String {
    b64().encode(key.as_bytes())
}

/// Base64文字列を固定長配列にデコードする。
fn decode_fixed<const N: usize>(s: &str, field: &str) -> Result<[u8; N], CryptoError> {
    let bytes = b64()
        .decode(s)
        .map_err(|e| CryptoError::InvalidKeyMaterial(format!("{field}: {e}")))?;
    bytes.try_into().map_err(|v: Vec<u8>| {
        CryptoError::InvalidKeyMaterial(format!("{field}: {}バイト（期待値 {N}バイト）", v.len()))
    })
}
