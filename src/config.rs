//! Startup configuration. Every knob is read from the environment exactly
//! once, validated, and frozen into an immutable [`Config`]; nothing in the
//! daemon re-reads the environment after [`Config::from_env`] returns. A
//! value that fails to parse is a fatal startup error, never a silent
//! fallback — see the Fatal family in [`crate::error::EmbedError`].

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{EmbedError, Result};
use crate::scheduler::SchedulerMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KysMode {
    Kill,
    Unload,
    Standby,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub project_root: PathBuf,
    pub socket_path: PathBuf,

    pub thread_min: usize,
    pub thread_max: usize,

    pub idle_unload: Duration,
    pub max_workers: usize,

    pub model_reload_retries: u32,
    pub model_reload_delay: Duration,

    pub kys_timeout: Duration,
    pub kys_mode: KysMode,
    pub kys_startup_grace: Duration,
    pub kys_activity_grace: Duration,

    pub database_url: Option<String>,
    pub overflow_enabled: bool,

    pub cache_dir: PathBuf,
    pub cache_max_bytes: u64,

    pub scheduler_mode: SchedulerMode,
    pub fifo_workers: usize,
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match env_str(key) {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|_| EmbedError::Configuration(format!("{key} is not a valid value: {raw:?}"))),
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let project_root = env_str("SPECMEM_PROJECT_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));

        let default_socket = project_root.join("specmem").join("sockets").join("embeddings.sock");
        let socket_path = env_str("SPECMEM_EMBEDDING_SOCKET")
            .or_else(|| env_str("SOCKET_PATH"))
            .map(PathBuf::from)
            .unwrap_or(default_socket);

        let thread_max = env_parsed("SPECMEM_CPU_THREADS", 1usize)?;
        let thread_min = env_parsed("SPECMEM_CPU_THREADS_MIN", 1usize)?;
        if thread_min == 0 || thread_min > thread_max {
            return Err(EmbedError::Configuration(format!(
                "SPECMEM_CPU_THREADS_MIN ({thread_min}) must be >= 1 and <= SPECMEM_CPU_THREADS ({thread_max})"
            )));
        }

        let idle_unload_secs = env_parsed("SPECMEM_EMBEDDING_IDLE_TIMEOUT", 120u64)?;
        let max_workers = env_parsed("SPECMEM_EMBEDDING_MAX_WORKERS", 4usize)?;
        if max_workers == 0 {
            return Err(EmbedError::Configuration(
                "SPECMEM_EMBEDDING_MAX_WORKERS must be >= 1".into(),
            ));
        }

        let model_reload_retries = env_parsed("SPECMEM_MODEL_RELOAD_RETRIES", 3u32)?;
        let model_reload_delay_ms = env_parsed("SPECMEM_MODEL_RELOAD_DELAY_MS", 500u64)?;

        let kys_timeout_secs = env_parsed("SPECMEM_KYS_TIMEOUT_SECONDS", 600u64)?;
        let kys_mode = match env_str("SPECMEM_KYS_MODE").as_deref() {
            None => KysMode::Standby,
            Some("kill") => KysMode::Kill,
            Some("unload") => KysMode::Unload,
            Some("standby") => KysMode::Standby,
            Some(other) => {
                return Err(EmbedError::Configuration(format!(
                    "SPECMEM_KYS_MODE must be one of kill|unload|standby, got {other:?}"
                )));
            }
        };

        let database_url = env_str("SPECMEM_DB_URL").or_else(|| build_db_url_from_parts());
        let overflow_enabled = env_parsed("SPECMEM_OVERFLOW_ENABLED", true)?;
        if overflow_enabled && database_url.is_none() {
            return Err(EmbedError::Configuration(
                "SPECMEM_OVERFLOW_ENABLED is true but no database connection is configured \
                 (set SPECMEM_DB_URL or the individual SPECMEM_DB_* parameters)"
                    .into(),
            ));
        }

        let cache_dir = env_str("SPECMEM_CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| project_root.join("specmem").join("cache"));
        let cache_max_bytes = env_parsed("SPECMEM_CACHE_MAX_BYTES", 10u64 * 1024 * 1024 * 1024)?;

        let scheduler_mode = match env_str("SPECMEM_SCHEDULER_MODE").as_deref() {
            None => SchedulerMode::Throttle,
            Some("throttle") => SchedulerMode::Throttle,
            Some("fifo_ack") => SchedulerMode::FifoAck,
            Some(other) => {
                return Err(EmbedError::Configuration(format!(
                    "SPECMEM_SCHEDULER_MODE must be one of throttle|fifo_ack, got {other:?}"
                )));
            }
        };
        let fifo_workers = env_parsed("SPECMEM_FIFO_WORKERS", 4usize)?;
        if fifo_workers == 0 {
            return Err(EmbedError::Configuration("SPECMEM_FIFO_WORKERS must be >= 1".into()));
        }

        Ok(Config {
            project_root,
            socket_path,
            thread_min,
            thread_max,
            idle_unload: Duration::from_secs(idle_unload_secs),
            max_workers,
            model_reload_retries,
            model_reload_delay: Duration::from_millis(model_reload_delay_ms),
            kys_timeout: Duration::from_secs(kys_timeout_secs),
            kys_mode,
            kys_startup_grace: Duration::from_secs(60),
            kys_activity_grace: Duration::from_secs(300),
            database_url,
            overflow_enabled,
            cache_dir,
            cache_max_bytes,
            scheduler_mode,
            fifo_workers,
        })
    }
}

fn build_db_url_from_parts() -> Option<String> {
    let host = env_str("SPECMEM_DB_HOST")?;
    let port = env_str("SPECMEM_DB_PORT").unwrap_or_else(|| "5432".to_string());
    let user = env_str("SPECMEM_DB_USER").unwrap_or_else(|| "postgres".to_string());
    let password = env_str("SPECMEM_DB_PASSWORD").unwrap_or_default();
    let name = env_str("SPECMEM_DB_NAME")?;
    Some(format!("postgres://{user}:{password}@{host}:{port}/{name}"))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn env_parsed_falls_back_to_default_when_unset() {
        let v: usize = env_parsed("SPECMEM_EMBED_CONFIG_TEST_UNSET_KEY", 7).unwrap();
        assert_eq!(v, 7);
    }

    #[test]
    fn env_parsed_rejects_garbage() {
        // SAFETY-free: env var mutation is confined to this single-threaded test.
        unsafe { env::set_var("SPECMEM_EMBED_CONFIG_TEST_BAD_KEY", "not-a-number") };
        let result: Result<usize> = env_parsed("SPECMEM_EMBED_CONFIG_TEST_BAD_KEY", 1);
        unsafe { env::remove_var("SPECMEM_EMBED_CONFIG_TEST_BAD_KEY") };
        assert!(result.is_err());
    }
}
