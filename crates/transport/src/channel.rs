//! # 接続チャネル
//!
//! 1つの隔離実行環境への接続。制御フレームの送受信とバルク転送を提供する。
//!
//! 全ての待機点（接続、送信、受信）は以下で有界化される:
//! - チャンク単位のタイムアウト（`io_timeout`）
//! - ジョブのキャンセル通知（[`CancelToken`]）。キャンセル時はストリームを閉じる

use std::future::Future;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use sealrun_types::{FaultKind, Reply, Request};

use crate::cancel::CancelToken;
use crate::protocol::{self, CHUNK_SIZE};
use crate::{EnvironmentAddress, TransportError};

/// チャネルが扱えるバイトストリーム。
pub trait ByteStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ByteStream for T {}

/// チャネルのオプション。
#[derive(Debug, Clone)]
pub struct ChannelOptions {
    /// 接続およびチャンク単位の送受信タイムアウト
    pub io_timeout: Duration,
    /// 受信を許可するバルクの最大サイズ
    pub max_bulk_size: u64,
    /// キャンセル通知
    pub cancel: CancelToken,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            io_timeout: Duration::from_secs(30),
            max_bulk_size: 16 * 1024 * 1024 * 1024,
            cancel: CancelToken::never(),
        }
    }
}

/// エンクレーブからの確認応答。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ack {
    /// 受理された
    Accepted,
    /// エンクレーブが拒否した
    Rejected { kind: FaultKind, detail: String },
}

impl Ack {
    /// 受理されたかどうか。
    pub fn is_accepted(&self) -> bool {
        matches!(self, Ack::Accepted)
    }
}

/// 1つの実行環境への接続チャネル。ジョブ間で共有しない。
pub struct Channel {
    stream: Option<Box<dyn ByteStream>>,
    peer: String,
    options: ChannelOptions,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("peer", &self.peer)
            .field("open", &self.stream.is_some())
            .finish()
    }
}

/// タイムアウトとキャンセルで操作を有界化する。
async fn guard<T, F>(
    options: &ChannelOptions,
    op: &'static str,
    fut: F,
) -> Result<T, TransportError>
where
    F: Future<Output = std::io::Result<T>>,
{
    tokio::select! {
        biased;
        _ = options.cancel.cancelled() => Err(TransportError::Cancelled),
        result = tokio::time::timeout(options.io_timeout, fut) => match result {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(e)) => Err(TransportError::Io(e)),
            Err(_) => Err(TransportError::Timeout {
                op,
                timeout: options.io_timeout,
            }),
        },
    }
}

impl Channel {
    /// アドレスに接続する。
    ///
    /// 失敗時は [`TransportError::Connect`] を返す。リトライは行わない。
    pub async fn connect(
        addr: &EnvironmentAddress,
        options: ChannelOptions,
    ) -> Result<Self, TransportError> {
        let peer = addr.to_string();
        let connect_err = |source: std::io::Error| TransportError::Connect {
            addr: peer.clone(),
            source,
        };

        let stream: Box<dyn ByteStream> = match addr {
            EnvironmentAddress::Tcp(host) => {
                let fut = tokio::net::TcpStream::connect(host.as_str());
                let stream = match guard(&options, "connect", fut).await {
                    Ok(s) => s,
                    Err(TransportError::Io(e)) => return Err(connect_err(e)),
                    Err(e) => return Err(e),
                };
                stream.set_nodelay(true).map_err(connect_err)?;
                Box::new(stream)
            }
            #[cfg(all(target_os = "linux", feature = "vendor-aws"))]
            EnvironmentAddress::Vsock { cid, port } => {
                let fut = crate::vsock_bridge::connect(*cid, *port);
                match guard(&options, "connect", fut).await {
                    Ok(s) => Box::new(s) as Box<dyn ByteStream>,
                    Err(TransportError::Io(e)) => return Err(connect_err(e)),
                    Err(e) => return Err(e),
                }
            }
            #[cfg(not(all(target_os = "linux", feature = "vendor-aws")))]
            EnvironmentAddress::Vsock { .. } => {
                return Err(TransportError::Unsupported(format!(
                    "このビルドはvsockに対応していません: {peer}"
                )));
            }
        };

        tracing::debug!(peer = %peer, "チャネル接続完了");
        Ok(Self::from_stream(stream, peer, options))
    }

    /// 既存のストリームからチャネルを構築する（エンクレーブ側・テスト用）。
    pub fn from_stream(
        stream: Box<dyn ByteStream>,
        peer: impl Into<String>,
        options: ChannelOptions,
    ) -> Self {
        Self {
            stream: Some(stream),
            peer: peer.into(),
            options,
        }
    }

    /// 接続先の表示名。
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// チャネルが開いているか。
    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    /// ストリームを閉じる。以降の操作は [`TransportError::Closed`] になる。
    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = tokio::time::timeout(Duration::from_secs(1), stream.shutdown()).await;
            tracing::debug!(peer = %self.peer, "チャネルをクローズ");
        }
    }

    /// 操作結果を検査し、キャンセル・IO失敗ならストリームを破棄する。
    fn settle<T>(&mut self, result: Result<T, TransportError>) -> Result<T, TransportError> {
        if let Err(e) = &result {
            if e.breaks_channel() && self.stream.is_some() {
                tracing::debug!(peer = %self.peer, error = %e, "チャネルを破棄");
                self.stream = None;
            }
        }
        result
    }

    async fn write_all_chunked(&mut self, bytes: &[u8], op: &'static str) -> Result<(), TransportError> {
        let options = self.options.clone();
        let result = match self.stream.as_mut() {
            None => Err(TransportError::Closed),
            Some(stream) => {
                let mut outcome = Ok(());
                for chunk in bytes.chunks(CHUNK_SIZE) {
                    if let Err(e) = guard(&options, op, stream.write_all(chunk)).await {
                        outcome = Err(e);
                        break;
                    }
                }
                match outcome {
                    Ok(()) => guard(&options, op, stream.flush()).await,
                    Err(e) => Err(e),
                }
            }
        };
        self.settle(result)
    }

    /// 制御メッセージを送信する。
    pub async fn send_request(&mut self, request: &Request) -> Result<(), TransportError> {
        let frame = protocol::encode_frame(request)?;
        tracing::trace!(peer = %self.peer, request = request.name(), "制御メッセージ送信");
        self.write_all_chunked(&frame, "send_request").await
    }

    /// 応答メッセージを送信する（エンクレーブ側）。
    pub async fn send_reply(&mut self, reply: &Reply) -> Result<(), TransportError> {
        let frame = protocol::encode_frame(reply)?;
        self.write_all_chunked(&frame, "send_reply").await
    }

    /// 生のバイト列を送信する（バルク転送）。
    pub async fn send_bytes(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.write_all_chunked(bytes, "send_bytes").await
    }

    /// ちょうど `n` バイト受信する。
    ///
    /// 接続が途中で閉じた場合は、読めた分を保持した
    /// [`TransportError::ShortRead`] を返す。短いバッファを黙って返すことはない。
    /// バッファは宣言サイズではなく受信した分だけ伸びる。
    pub async fn recv_exact(&mut self, n: usize) -> Result<Vec<u8>, TransportError> {
        let options = self.options.clone();
        let result = match self.stream.as_mut() {
            None => Err(TransportError::Closed),
            Some(stream) => {
                let mut buf = Vec::with_capacity(n.min(CHUNK_SIZE));
                let mut chunk = vec![0u8; n.min(CHUNK_SIZE)];
                let mut outcome = Ok(());
                while buf.len() < n {
                    let want = (n - buf.len()).min(chunk.len());
                    match guard(&options, "recv_exact", stream.read(&mut chunk[..want])).await {
                        Ok(0) => {
                            outcome = Err(TransportError::ShortRead {
                                expected: n,
                                partial: std::mem::take(&mut buf),
                            });
                            break;
                        }
                        Ok(got) => buf.extend_from_slice(&chunk[..got]),
                        Err(e) => {
                            outcome = Err(e);
                            break;
                        }
                    }
                }
                outcome.map(|()| buf)
            }
        };
        self.settle(result)
    }

    /// 宣言サイズを検証してからバルクを受信する。
    pub async fn recv_bulk(&mut self, size: u64) -> Result<Vec<u8>, TransportError> {
        let limit = self.options.max_bulk_size;
        self.recv_bulk_limited(size, limit).await
    }

    /// チャネル全体より厳しい上限でバルクを受信する（Attestation Documentなど）。
    pub async fn recv_bulk_limited(
        &mut self,
        size: u64,
        limit: u64,
    ) -> Result<Vec<u8>, TransportError> {
        let limit = limit.min(self.options.max_bulk_size);
        if size > limit {
            return Err(TransportError::TooLarge { size, limit });
        }
        let n = usize::try_from(size).map_err(|_| TransportError::TooLarge {
            size,
            limit: usize::MAX as u64,
        })?;
        self.recv_exact(n).await
    }

    async fn recv_frame(&mut self) -> Result<Vec<u8>, TransportError> {
        let header = self.recv_exact(4).await?;
        let mut len = [0u8; 4];
        len.copy_from_slice(&header);
        let len = protocol::check_frame_len(len)?;
        self.recv_exact(len).await
    }

    /// 応答メッセージを受信する。
    pub async fn recv_reply(&mut self) -> Result<Reply, TransportError> {
        let body = self.recv_frame().await?;
        protocol::decode_message(&body)
    }

    /// タイムアウトを一時的に差し替えて応答を受信する（長時間の処理完了待ち）。
    pub async fn recv_reply_within(&mut self, timeout: Duration) -> Result<Reply, TransportError> {
        let saved = std::mem::replace(&mut self.options.io_timeout, timeout);
        let result = self.recv_reply().await;
        self.options.io_timeout = saved;
        result
    }

    /// 制御メッセージを受信する（エンクレーブ側）。
    ///
    /// 相手が正常に切断した場合は `Ok(None)` を返す。
    pub async fn recv_request(&mut self) -> Result<Option<Request>, TransportError> {
        match self.recv_frame().await {
            Ok(body) => protocol::decode_message(&body).map(Some),
            Err(TransportError::ShortRead { partial, .. }) if partial.is_empty() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// 確認応答を受信する。
    ///
    /// `ack`/`nack` 以外の応答は [`TransportError::Protocol`] になる。
    pub async fn recv_ack(&mut self) -> Result<Ack, TransportError> {
        match self.recv_reply().await? {
            Reply::Ack => Ok(Ack::Accepted),
            Reply::Nack { kind, detail } => Ok(Ack::Rejected { kind, detail }),
            other => Err(TransportError::Protocol(format!(
                "確認応答を期待しましたが異なる応答を受信: {other:?}"
            ))),
        }
    }
}
