//! # Length-prefixed フレームプロトコル
//!
//! 親インスタンス ↔ エンクレーブ間の制御メッセージの符号化。
//!
//! ## 制御フレーム
//! ```text
//! [4B: json_len (big-endian)][json]
//! ```
//!
//! ## バルク転送
//! 制御フレームで `size` を宣言した後、生のバイト列を `size` バイト送る。
//! ```text
//! request{size=N} → (N bytes) → ack
//! ```

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::TransportError;

/// 制御フレームの最大サイズ（1MB）。
pub const MAX_FRAME_LEN: u32 = 1024 * 1024;

/// バルク送受信のチャンクサイズ（64KB）。
/// タイムアウトはチャンク単位で適用される。
pub const CHUNK_SIZE: usize = 64 * 1024;

/// メッセージをlength-prefixedフレームに符号化する。
pub fn encode_frame<T: Serialize>(message: &T) -> Result<Vec<u8>, TransportError> {
    let json = serde_json::to_vec(message)
        .map_err(|e| TransportError::Protocol(format!("メッセージのシリアライズに失敗: {e}")))?;
    let len = u32::try_from(json.len())
        .ok()
        .filter(|len| *len <= MAX_FRAME_LEN)
        .ok_or(TransportError::TooLarge {
            size: json.len() as u64,
            limit: MAX_FRAME_LEN as u64,
        })?;
    let mut frame = Vec::with_capacity(4 + json.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&json);
    Ok(frame)
}

/// フレーム長ヘッダを検証する。
pub fn check_frame_len(header: [u8; 4]) -> Result<usize, TransportError> {
    let len = u32::from_be_bytes(header);
    if len > MAX_FRAME_LEN {
        return Err(TransportError::TooLarge {
            size: len as u64,
            limit: MAX_FRAME_LEN as u64,
        });
    }
    Ok(len as usize)
}

/// フレーム本体（JSON）をメッセージに復号する。
pub fn decode_message<T: DeserializeOwned>(body: &[u8]) -> Result<T, TransportError> {
    serde_json::from_slice(body)
        .map_err(|e| TransportError::Protocol(format!("メッセージのパースに失敗: {e}")))
}
