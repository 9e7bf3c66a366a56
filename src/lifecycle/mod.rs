//! Lifecycle Manager (C8): lazy load / idle unload of the encoder, a KYS
//! watchdog against a parent process, and the PID / status files that let a
//! supervising process decide whether to respawn.

mod liveness;
mod pidfile;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::sleep;
use tracing::{error, info, warn};

pub use liveness::ParentHandle;
pub use pidfile::PidFile;

use crate::config::{Config, KysMode};
use crate::encoder::{Encoder, EncoderConfig};
use crate::error::{EmbedError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Unloaded,
    Loading,
    Healthy,
    Unhealthy,
}

#[derive(Debug, Serialize)]
struct StatusFile<'a> {
    reason: &'a str,
    at_epoch_ms: i64,
    pid: u32,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub struct LifecycleManager {
    encoder_config: EncoderConfig,
    slot: AsyncMutex<Option<Arc<Encoder>>>,
    state: std::sync::RwLock<LifecycleState>,

    last_activity_ms: AtomicI64,
    last_kys_ms: AtomicI64,
    started_at: Instant,

    idle_unload: Duration,
    model_reload_retries: u32,
    model_reload_delay: Duration,

    kys_timeout: Duration,
    kys_mode: KysMode,
    kys_startup_grace: Duration,
    kys_activity_grace: Duration,
    parent: Option<ParentHandle>,

    status_path: PathBuf,
    shutting_down: AtomicBool,
}

impl LifecycleManager {
    pub fn new(config: &Config, encoder_config: EncoderConfig, parent_pid: Option<u32>) -> Self {
        let now = now_ms();
        let status_path = config
            .socket_path
            .parent()
            .map(|p| p.join("status.json"))
            .unwrap_or_else(|| PathBuf::from("status.json"));

        LifecycleManager {
            encoder_config,
            slot: AsyncMutex::new(None),
            state: std::sync::RwLock::new(LifecycleState::Unloaded),
            last_activity_ms: AtomicI64::new(now),
            last_kys_ms: AtomicI64::new(now),
            started_at: Instant::now(),
            idle_unload: config.idle_unload,
            model_reload_retries: config.model_reload_retries,
            model_reload_delay: config.model_reload_delay,
            kys_timeout: config.kys_timeout,
            kys_mode: config.kys_mode,
            kys_startup_grace: config.kys_startup_grace,
            kys_activity_grace: config.kys_activity_grace,
            parent: parent_pid.map(ParentHandle::capture),
            status_path,
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Best-effort, non-blocking peek at the currently loaded encoder, for
    /// status reporting that must never itself trigger a load. Returns
    /// `None` both when unloaded and when the slot happens to be locked by
    /// a concurrent load/unload.
    pub fn peek_loaded(&self) -> Option<Arc<Encoder>> {
        self.slot.try_lock().ok().and_then(|guard| guard.clone())
    }

    /// Any request, successful or not, counts as liveness.
    pub fn record_activity(&self) {
        let now = now_ms();
        self.last_activity_ms.store(now, Ordering::Relaxed);
        self.last_kys_ms.store(now, Ordering::Relaxed);
    }

    /// A dedicated `kys` heartbeat from the parent, distinct from ordinary
    /// request traffic.
    pub fn record_kys_heartbeat(&self) {
        self.last_kys_ms.store(now_ms(), Ordering::Relaxed);
    }

    /// Double-checked lazy load: returns the live encoder, loading it first
    /// if necessary, retrying up to `model_reload_retries` times with
    /// exponential backoff. A freshly loaded encoder must pass a trivial
    /// non-empty-vector probe or the load counts as a failure.
    pub async fn get_or_load(&self) -> Result<Arc<Encoder>> {
        {
            let guard = self.slot.lock().await;
            if let Some(encoder) = guard.as_ref() {
                return Ok(encoder.clone());
            }
        }

        let mut guard = self.slot.lock().await;
        if let Some(encoder) = guard.as_ref() {
            return Ok(encoder.clone());
        }

        *self.state.write().unwrap_or_else(|e| e.into_inner()) = LifecycleState::Loading;
        let encoder = self.load_with_retries().await;
        match encoder {
            Ok(encoder) => {
                *guard = Some(encoder.clone());
                *self.state.write().unwrap_or_else(|e| e.into_inner()) = LifecycleState::Healthy;
                Ok(encoder)
            }
            Err(e) => {
                *self.state.write().unwrap_or_else(|e| e.into_inner()) = LifecycleState::Unhealthy;
                Err(e)
            }
        }
    }

    async fn load_with_retries(&self) -> Result<Arc<Encoder>> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let config = self.encoder_config.clone();
            let loaded = tokio::task::spawn_blocking(move || Encoder::load(&config))
                .await
                .map_err(|e| EmbedError::EncoderLoad(format!("load task panicked: {e}")))?;

            match loaded.and_then(|encoder| health_probe(&encoder).map(|()| encoder)) {
                Ok(encoder) => return Ok(Arc::new(encoder)),
                Err(e) if attempt <= self.model_reload_retries => {
                    let backoff = self.model_reload_delay * 2u32.pow(attempt.saturating_sub(1));
                    warn!(attempt, error = %e, "encoder load failed, retrying");
                    sleep(backoff).await;
                }
                Err(e) => {
                    error!(error = %e, "encoder load failed after all retries");
                    return Err(e);
                }
            }
        }
    }

    /// Drops the loaded encoder if idle beyond `idle_unload` (0 disables).
    pub async fn maybe_idle_unload(&self) {
        if self.idle_unload.is_zero() {
            return;
        }
        let last_activity = self.last_activity_ms.load(Ordering::Relaxed);
        let idle_for = now_ms().saturating_sub(last_activity);
        if idle_for < self.idle_unload.as_millis() as i64 {
            return;
        }
        let mut guard = self.slot.lock().await;
        if guard.take().is_some() {
            *self.state.write().unwrap_or_else(|e| e.into_inner()) = LifecycleState::Unloaded;
            info!(idle_for_ms = idle_for, "encoder idle-unloaded");
        }
    }

    /// Runs the periodic idle-unload + KYS watchdog loop until shutdown is
    /// requested. Intended to be spawned as its own task.
    pub async fn run_watchdog(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(5));
        loop {
            ticker.tick().await;
            if self.shutting_down.load(Ordering::Relaxed) {
                return;
            }
            self.maybe_idle_unload().await;
            self.check_kys().await;
        }
    }

    async fn check_kys(&self) {
        if self.started_at.elapsed() < self.kys_startup_grace {
            return;
        }
        let now = now_ms();
        let since_kys = now.saturating_sub(self.last_kys_ms.load(Ordering::Relaxed));
        if since_kys < self.kys_timeout.as_millis() as i64 {
            return;
        }
        let since_activity = now.saturating_sub(self.last_activity_ms.load(Ordering::Relaxed));
        if since_activity < self.kys_activity_grace.as_millis() as i64 {
            return;
        }
        if let Some(parent) = &self.parent {
            if parent.is_alive() {
                return;
            }
        }

        warn!(mode = ?self.kys_mode, "KYS watchdog triggered: no heartbeat, idle, and parent unreachable");
        match self.kys_mode {
            KysMode::Standby => {
                self.write_status("standby");
            }
            KysMode::Unload => {
                let mut guard = self.slot.lock().await;
                *guard = None;
                *self.state.write().unwrap_or_else(|e| e.into_inner()) = LifecycleState::Unloaded;
                self.write_status("unload");
            }
            KysMode::Kill => {
                self.write_status("kill");
                self.shutting_down.store(true, Ordering::Relaxed);
                std::process::exit(0);
            }
        }
    }

    fn write_status(&self, reason: &str) {
        let status = StatusFile {
            reason,
            at_epoch_ms: now_ms(),
            pid: std::process::id(),
        };
        if let Ok(json) = serde_json::to_vec(&status) {
            if let Some(parent) = self.status_path.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            let _ = std::fs::write(&self.status_path, json);
        }
    }

    pub fn request_shutdown(&self) {
        self.shutting_down.store(true, Ordering::Relaxed);
    }
}

fn health_probe(encoder: &Encoder) -> Result<()> {
    let probe = encoder.encode("health probe")?;
    if probe.is_empty() {
        return Err(EmbedError::EncoderLoad(
            "trivial health-check encode returned an empty vector".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn record_activity_updates_both_timestamps() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = Config {
            project_root: dir.path().to_path_buf(),
            socket_path: dir.path().join("sockets").join("embeddings.sock"),
            thread_min: 1,
            thread_max: 1,
            idle_unload: Duration::from_secs(0),
            max_workers: 1,
            model_reload_retries: 1,
            model_reload_delay: Duration::from_millis(1),
            kys_timeout: Duration::from_secs(600),
            kys_mode: KysMode::Standby,
            kys_startup_grace: Duration::from_secs(60),
            kys_activity_grace: Duration::from_secs(300),
            database_url: None,
            overflow_enabled: false,
            cache_dir: dir.path().join("cache"),
            cache_max_bytes: 1024,
        };
        let encoder_config = EncoderConfig {
            model_id: "test/model".to_string(),
            model_cache_dir: dir.path().join("models"),
            tokenizer_cache_dir: dir.path().join("tokenizers"),
            max_length: 32,
            batch_size: 8,
            thread_min: 1,
            thread_max: 1,
        };
        let manager = LifecycleManager::new(&config, encoder_config, None);
        assert_eq!(manager.state(), LifecycleState::Unloaded);
        manager.record_activity();
        assert!(manager.last_activity_ms.load(Ordering::Relaxed) > 0);
        assert_eq!(
            manager.last_activity_ms.load(Ordering::Relaxed),
            manager.last_kys_ms.load(Ordering::Relaxed)
        );
    }
}
