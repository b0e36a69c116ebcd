//! # sealrun Transport
//!
//! 親インスタンスと隔離実行環境（エンクレーブ）間の通信チャネル。
//!
//! ## 責務
//! - TCP / vsock への接続
//! - length-prefixed JSON 制御フレームの送受信
//! - 宣言サイズ付きバルク転送（イメージ、暗号化データ、結果）
//! - タイムアウトとキャンセルによる全待機点の有界化
//!
//! リトライとエラー分類はオーケストレータの責務であり、ここでは行わない。

mod address;
mod cancel;
mod channel;
mod error;
pub mod protocol;
#[cfg(all(target_os = "linux", feature = "vendor-aws"))]
mod vsock_bridge;

pub use address::EnvironmentAddress;
pub use cancel::{cancel_pair, CancelHandle, CancelToken};
pub use channel::{Ack, ByteStream, Channel, ChannelOptions};
pub use error::TransportError;
