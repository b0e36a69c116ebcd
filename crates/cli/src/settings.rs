//! # 環境変数からの設定
//!
//! | 変数 | 既定値 |
//! |------|--------|
//! | `SEALRUN_MODE` | `enclave`（`direct` も可） |
//! | `SEALRUN_MAX_RETRIES` | 無制限 |
//! | `SEALRUN_RETRY_BACKOFF_MS` | `1000` |
//! | `SEALRUN_IO_TIMEOUT_MS` | `30000` |
//! | `SEALRUN_COMPUTE_TIMEOUT_MS` | `3600000` |
//! | `SEALRUN_CONNECT_ATTEMPTS` | `30` |
//! | `SEALRUN_POLL_ATTEMPTS` | `60` |
//! | `SEALRUN_CONTROL_PLANE_TIMEOUT_MS` | `120000` |
//! | `SEALRUN_HTTP_TIMEOUT_MS` | `120000` |
//! | `SEALRUN_EIF_PATH` | `/opt/sealrun/enclave.eif` |
//! | `SEALRUN_ENCLAVE_CPUS` | `2` |
//! | `SEALRUN_ENCLAVE_MEMORY_MIB` | `4096` |
//! | `SEALRUN_ENCLAVE_PORT` | `5000` |
//! | `SEALRUN_REGISTRY` | イメージ参照から推定 |
//! | `SEALRUN_EXECUTOR_IMAGE` / `SEALRUN_EXECUTOR_SUBSTITUTE` | なし |

use std::str::FromStr;

use anyhow::{bail, Context};

use sealrun_orchestrator::config::{ExecutorSubstitution, RegistrySettings};
use sealrun_orchestrator::{ExecutionMode, OrchestratorConfig};

/// 環境変数を読む関数。テストでは固定のテーブルを渡す。
pub type Lookup<'a> = &'a dyn Fn(&str) -> Option<String>;

/// プロセス環境変数。空文字列は未設定として扱う。
pub fn process_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn parsed<T>(env: Lookup<'_>, name: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env(name) {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("{name} の値が不正です ({raw}): {e}")),
    }
}

/// 環境変数から [`OrchestratorConfig`] を組み立てる。
pub fn orchestrator_config(env: Lookup<'_>) -> anyhow::Result<OrchestratorConfig> {
    let mut config = OrchestratorConfig::default();

    config.mode = match env("SEALRUN_MODE").as_deref() {
        None | Some("enclave") => ExecutionMode::Enclave,
        Some("direct") => ExecutionMode::Direct,
        Some(other) => bail!("SEALRUN_MODE は enclave または direct です: {other}"),
    };

    config.retry.max_retries = env("SEALRUN_MAX_RETRIES")
        .map(|raw| raw.parse::<u32>())
        .transpose()
        .context("SEALRUN_MAX_RETRIES の値が不正です")?;
    config.retry.backoff_ms = parsed(env, "SEALRUN_RETRY_BACKOFF_MS", config.retry.backoff_ms)?;
    config.io_timeout_ms = parsed(env, "SEALRUN_IO_TIMEOUT_MS", config.io_timeout_ms)?;
    config.compute_timeout_ms =
        parsed(env, "SEALRUN_COMPUTE_TIMEOUT_MS", config.compute_timeout_ms)?;
    config.connect_attempts = parsed(env, "SEALRUN_CONNECT_ATTEMPTS", config.connect_attempts)?;
    config.poll_attempts = parsed(env, "SEALRUN_POLL_ATTEMPTS", config.poll_attempts)?;
    config.control_plane_timeout_ms = parsed(
        env,
        "SEALRUN_CONTROL_PLANE_TIMEOUT_MS",
        config.control_plane_timeout_ms,
    )?;
    config.http_timeout_ms = parsed(env, "SEALRUN_HTTP_TIMEOUT_MS", config.http_timeout_ms)?;

    if let Some(path) = env("SEALRUN_EIF_PATH") {
        config.enclave.eif_path = path;
    }
    config.enclave.cpu_count = parsed(env, "SEALRUN_ENCLAVE_CPUS", config.enclave.cpu_count)?;
    config.enclave.memory_mib =
        parsed(env, "SEALRUN_ENCLAVE_MEMORY_MIB", config.enclave.memory_mib)?;
    config.enclave.port = parsed(env, "SEALRUN_ENCLAVE_PORT", config.enclave.port)?;

    config.registry = RegistrySettings {
        host: env("SEALRUN_REGISTRY"),
    };

    config.executor = match (env("SEALRUN_EXECUTOR_IMAGE"), env("SEALRUN_EXECUTOR_SUBSTITUTE")) {
        (Some(identity), Some(substitute)) => Some(ExecutorSubstitution {
            identity,
            substitute,
        }),
        (None, None) => None,
        _ => bail!("SEALRUN_EXECUTOR_IMAGE と SEALRUN_EXECUTOR_SUBSTITUTE は両方指定してください"),
    };

    Ok(config)
}
