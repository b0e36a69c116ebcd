//! # 実行環境アドレス
//!
//! 文字列表現:
//! - `tcp:127.0.0.1:5000` — ローカル・開発モード
//! - `vsock:16:5000` — 隔離実行環境（CID, ポート）

use std::fmt;
use std::str::FromStr;

/// 隔離実行環境の制御アドレス。
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EnvironmentAddress {
    /// TCPソケット（`host:port`）
    Tcp(String),
    /// VMソケット
    Vsock { cid: u32, port: u32 },
}

impl fmt::Display for EnvironmentAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnvironmentAddress::Tcp(addr) => write!(f, "tcp:{addr}"),
            EnvironmentAddress::Vsock { cid, port } => write!(f, "vsock:{cid}:{port}"),
        }
    }
}

impl FromStr for EnvironmentAddress {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(rest) = s.strip_prefix("tcp:") {
            if !rest.contains(':') {
                return Err(format!("TCPアドレスにポートがありません: {s}"));
            }
            return Ok(EnvironmentAddress::Tcp(rest.to_string()));
        }
        if let Some(rest) = s.strip_prefix("vsock:") {
            let (cid, port) = rest
                .split_once(':')
                .ok_or_else(|| format!("vsockアドレスは vsock:<cid>:<port> 形式です: {s}"))?;
            let cid = cid
                .parse()
                .map_err(|e| format!("不正なCID ({cid}): {e}"))?;
            let port = port
                .parse()
                .map_err(|e| format!("不正なポート ({port}): {e}"))?;
            return Ok(EnvironmentAddress::Vsock { cid, port });
        }
        Err(format!("未知のアドレス形式: {s}"))
    }
}
