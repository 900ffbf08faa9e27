use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

mod api;
mod auth;
mod commands;
mod database;
mod engine;
mod models;
mod network;
mod sync;

pub use crate::api::{ApiClient, ApiError};
pub use crate::auth::AuthManager;
pub use crate::commands::CommandError;
pub use crate::database::Database;
pub use crate::engine::{
    active_minutes, manual_entry_minutes, TimerPhaseForApi, TimerTracker, TrackerSnapshot,
};
pub use crate::models::{
    ApprovalStatus, EntryFilters, Task, TaskStatus, TimeEntry, TokenRefreshResult,
    TrackerStatusResponse,
};
pub use crate::network::check_online_status;
pub use crate::sync::{SyncConfig, SyncError, SyncManager};


/// Инициализация логирования: по умолчанию info (если RUST_LOG не задан),
/// чтобы [POLL]/[CMD]/[TIMER] были видны
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

/// Сессия трекера: локальное зеркало авторитетного таймера + команды +
/// фоновая реконсиляция. Живёт от логина до логаута; teardown останавливает
/// poll и tick - осиротевших таймеров после владельца не остаётся
pub struct TrackerSession {
    pub(crate) tracker: Arc<TimerTracker>,
    pub(crate) api: Arc<ApiClient>,
    pub(crate) auth: Arc<AuthManager>,
    pub(crate) sync: Arc<SyncManager>,
    pub(crate) command_in_flight: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
    state_tx: watch::Sender<TrackerSnapshot>,
    poll_interval_ms: u64,
    background_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TrackerSession {
    /// Сессия без локального кэша (состояние живёт только в памяти)
    pub fn new(config: SyncConfig) -> Self {
        Self::build(config, None)
    }

    /// Сессия с локальным кэшем: после рестарта UI показывает последний
    /// известный снимок (stale) до первого успешного poll
    /// Auto-recovery from corrupted DB: on integrity failure, backup and retry once
    pub fn with_db(config: SyncConfig, db_path: &str) -> Result<Self, String> {
        let db = match Database::new(db_path) {
            Ok(d) => Arc::new(d),
            Err(e) => {
                let err_str = e.to_string();
                let is_corruption =
                    err_str.contains("corruption") || err_str.contains("integrity");
                if !is_corruption || !Path::new(db_path).exists() {
                    return Err(format!("Failed to initialize database: {}", e));
                }
                let backup_path =
                    format!("{}.corrupted.{}", db_path, chrono::Utc::now().timestamp());
                std::fs::rename(db_path, &backup_path).map_err(|rename_e| {
                    format!(
                        "Database corrupted and could not backup: {} ({})",
                        e, rename_e
                    )
                })?;
                info!(
                    "[DB] Corrupted DB backed up to {}, starting fresh",
                    backup_path
                );
                Arc::new(
                    Database::new(db_path)
                        .map_err(|e2| format!("Failed to create fresh database: {}", e2))?,
                )
            }
        };
        Ok(Self::build(config, Some(db)))
    }

    fn build(config: SyncConfig, db: Option<Arc<Database>>) -> Self {
        let tracker = Arc::new(match &db {
            Some(db) => TimerTracker::with_db(db.clone()),
            None => TimerTracker::new(),
        });
        let auth = Arc::new(AuthManager::new(config.api_base_url.clone()));
        let api = Arc::new(ApiClient::new(&config, auth.clone()));
        let sync = Arc::new(SyncManager::new(tracker.clone(), api.clone(), db));

        let initial = tracker
            .snapshot()
            .unwrap_or_else(|_| TrackerSnapshot::idle());
        let (state_tx, _) = watch::channel(initial);

        Self {
            tracker,
            api,
            auth,
            sync,
            command_in_flight: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(AtomicBool::new(false)),
            state_tx,
            poll_interval_ms: config.poll_interval_ms.max(100),
            background_tasks: Mutex::new(Vec::new()),
        }
    }

    /// Подписка на снимки состояния (headless-аналог timer-state-update события)
    pub fn subscribe(&self) -> watch::Receiver<TrackerSnapshot> {
        self.state_tx.subscribe()
    }

    /// Установить токены (вызывается хост-приложением после логина)
    pub async fn set_auth_tokens(
        &self,
        access_token: Option<String>,
        refresh_token: Option<String>,
    ) {
        self.auth.set_tokens(access_token, refresh_token).await;
    }

    /// Запустить фоновые задачи: poll-цикл и tick-цикл
    /// Повторный вызов - no-op (задачи уже идут)
    pub fn spawn_background_tasks(&self) {
        let mut tasks = match self.background_tasks.lock() {
            Ok(t) => t,
            Err(e) => {
                error!("[SETUP] Background task registry poisoned: {}", e);
                return;
            }
        };
        if !tasks.is_empty() {
            warn!("[SETUP] Background tasks already running, skipping spawn");
            return;
        }

        // Poll-цикл: реконсиляция с сервером на фиксированном интервале
        let sync = self.sync.clone();
        let shutdown = self.shutdown.clone();
        let state_tx = self.state_tx.clone();
        let poll_interval_ms = self.poll_interval_ms;
        let poll_task = tokio::spawn(async move {
            use tokio::time::MissedTickBehavior;

            // Jitter перед первым poll - клиенты, стартовавшие одновременно
            // (релиз, wake), не бьют в API в одну миллисекунду
            let jitter_ms = u64::from(rand::random::<u16>()) % 300;
            if jitter_ms > 0 {
                tokio::time::sleep(Duration::from_millis(jitter_ms)).await;
            }

            info!("[POLL] Starting poll loop ({} ms interval)", poll_interval_ms);
            let mut interval =
                tokio::time::interval(Duration::from_millis(poll_interval_ms));
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
                match sync.poll_once().await {
                    Ok(Some(snapshot)) => {
                        let _ = state_tx.send(snapshot);
                    }
                    // None: другой poll в полёте; Err: stale-состояние остаётся,
                    // sync уже залогировал - тихий retry на следующем тике
                    Ok(None) | Err(_) => {}
                }
            }
            info!("[POLL] Poll loop stopped");
        });

        // Tick-цикл: presentation smoothing раз в секунду (poll всегда выигрывает)
        let tracker = self.tracker.clone();
        let shutdown = self.shutdown.clone();
        let state_tx = self.state_tx.clone();
        let tick_task = tokio::spawn(async move {
            use std::time::UNIX_EPOCH;
            use tokio::time::MissedTickBehavior;

            // Микро-синхронизация: первый тик - на границе системной секунды
            // (12:00:00.000, не .500)
            if let Ok(now) = std::time::SystemTime::now().duration_since(UNIX_EPOCH) {
                let now_ms = now.as_millis();
                let next_sec_ms = (now_ms / 1000 + 1) * 1000;
                let delay_ms = (next_sec_ms - now_ms).min(999);
                if delay_ms > 0 {
                    tokio::time::sleep(Duration::from_millis(delay_ms as u64)).await;
                }
            }

            let mut interval = tokio::time::interval(Duration::from_secs(1));
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
                match tracker.tick() {
                    Ok(snapshot) => {
                        // Idle не транслируем каждую секунду
                        let should_emit = !matches!(snapshot.state, TimerPhaseForApi::Idle);
                        if should_emit {
                            let _ = state_tx.send(snapshot);
                        }
                    }
                    Err(e) => warn!("[TIMER] Tick failed: {}", e),
                }
            }
        });

        tasks.push(poll_task);
        tasks.push(tick_task);
        info!("[SETUP] Background poll and tick tasks started");
    }

    /// Teardown: остановить фоновые задачи и сохранить снимок
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Ok(mut tasks) = self.background_tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
        if let Err(e) = self.tracker.persist() {
            error!("[SHUTDOWN] Failed to save timer snapshot on exit: {}", e);
        } else {
            info!("[SHUTDOWN] Timer snapshot saved on exit");
        }
    }

    /// Полный сброс при логауте/смене пользователя: токены, состояние, кэш
    pub async fn reset(&self) -> Result<(), String> {
        self.auth.clear_tokens().await;
        self.tracker.reset_state()?;
        let _ = self.state_tx.send(TrackerSnapshot::idle());
        info!("[RESET] Session state cleared");
        Ok(())
    }
}

impl Drop for TrackerSession {
    fn drop(&mut self) {
        // Осиротевшие poll/tick после владельца не живут
        self.shutdown.store(true, Ordering::Relaxed);
        if let Ok(mut tasks) = self.background_tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }
}
