//! # sealrun Orchestrator
//!
//! 親インスタンス側のジョブオーケストレータ。
//!
//! ## 構成
//! - [`image`]: コンテナイメージの取得とシリアライズ
//! - [`enclave`]: 隔離実行環境の起動・アドレス待機・接続待機
//! - [`job_service`]: 委譲ジョブの解決とランタイムバンドル取得
//! - [`status`]: 進捗の通知
//! - [`orchestrator`]: 状態機械とトップレベルのリトライ
//!
//! 外部コラボレータ（レジストリ、コンテナエンジン、コントロールプレーン、
//! ジョブサービス）は全て `async_trait` のトレイトとして注入する。

pub mod config;
pub mod enclave;
pub mod error;
pub mod image;
pub mod job_service;
pub mod orchestrator;
pub mod status;

#[cfg(test)]
mod test_support;

pub use config::{ExecutionMode, OrchestratorConfig, RetryPolicy};
pub use error::OrchestratorError;
pub use orchestrator::{
    AttestationDocument, AttestationVerifier, ComputeResult, JobHandle, JobOutcome, JobReport,
    Orchestrator,
};
