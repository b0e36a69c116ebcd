//! # vsockブリッジ（Linux専用）
//!
//! `vsock::VsockStream` はブロッキングI/Oのため、専用スレッドでポンプして
//! tokioの `DuplexStream` として公開する。

use std::io::{Read, Write};

use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

/// ブリッジの内部バッファサイズ。
const BRIDGE_BUFFER: usize = 256 * 1024;

/// vsockに接続し、非同期ストリームとして返す。
pub async fn connect(cid: u32, port: u32) -> std::io::Result<DuplexStream> {
    let stream = tokio::task::spawn_blocking(move || {
        vsock::VsockStream::connect_with_cid_port(cid, port)
    })
    .await
    .map_err(std::io::Error::other)??;

    let (local, remote) = tokio::io::duplex(BRIDGE_BUFFER);
    let (mut remote_rx, mut remote_tx) = tokio::io::split(remote);
    let handle = tokio::runtime::Handle::current();

    // vsock → tokio
    let mut reader = stream.try_clone()?;
    let h = handle.clone();
    std::thread::spawn(move || {
        let mut buf = vec![0u8; crate::protocol::CHUNK_SIZE];
        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    tracing::debug!(cid, port, error = %e, "vsock読み取り終了");
                    break;
                }
            };
            if h.block_on(remote_tx.write_all(&buf[..n])).is_err() {
                break;
            }
        }
        let _ = h.block_on(remote_tx.shutdown());
    });

    // tokio → vsock
    let mut writer = stream;
    std::thread::spawn(move || {
        let mut buf = vec![0u8; crate::protocol::CHUNK_SIZE];
        loop {
            let n = match handle.block_on(remote_rx.read(&mut buf)) {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            if let Err(e) = writer.write_all(&buf[..n]) {
                tracing::debug!(cid, port, error = %e, "vsock書き込み終了");
                break;
            }
        }
        let _ = writer.shutdown(std::net::Shutdown::Both);
    });

    Ok(local)
}
