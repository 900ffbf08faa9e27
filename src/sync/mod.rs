use crate::api::{ApiClient, ApiError};
use crate::engine::{TimerTracker, TrackerSnapshot};
use crate::Database;
use scopeguard::guard;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Ошибки цикла синхронизации (для разбора и логирования)
#[derive(Debug)]
pub enum SyncError {
    Api(ApiError),
    Engine(String),
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncError::Api(e) => write!(f, "{}", e),
            SyncError::Engine(s) => write!(f, "Engine: {}", s),
        }
    }
}

/// Конфигурация ядра (api_base_url, таймауты, интервалы, app_version)
#[derive(Clone)]
pub struct SyncConfig {
    pub api_base_url: String,
    pub http_timeout_secs: u64,
    /// Интервал poll авторитетного таймера (порядка секунды для foreground)
    pub poll_interval_ms: u64,
    /// App version sent in X-App-Version header for debugging version skew
    pub app_version: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_base_url: "https://app.taskpulse.io/api".to_string(),
            http_timeout_secs: 30,
            poll_interval_ms: 1000,
            app_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Менеджер синхронизации: poll-реконсиляция локального зеркала с сервером
/// Single-flight via AtomicBool - перекрывающиеся poll невозможны, поэтому
/// poll и tick не гоняются разрушительно (poll всегда выигрывает)
#[derive(Clone)]
pub struct SyncManager {
    pub(crate) tracker: Arc<TimerTracker>,
    pub(crate) api: Arc<ApiClient>,
    pub(crate) db: Option<Arc<Database>>,
    /// Single-flight: prevents concurrent poll runs
    pub(crate) is_polling: Arc<AtomicBool>,
    pub(crate) consecutive_failures: Arc<AtomicU32>,
}

impl SyncManager {
    pub fn new(
        tracker: Arc<TimerTracker>,
        api: Arc<ApiClient>,
        db: Option<Arc<Database>>,
    ) -> Self {
        Self {
            tracker,
            api,
            db,
            is_polling: Arc::new(AtomicBool::new(false)),
            consecutive_failures: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Один цикл реконсиляции: GetActiveTimer → apply_remote
    /// Возвращает Ok(None), если poll пропущен (другой уже в полёте).
    /// Команды вызывают это напрямую сразу после успеха - UI отражает
    /// пост-командное состояние без ожидания следующего тика
    pub async fn poll_once(&self) -> Result<Option<TrackerSnapshot>, SyncError> {
        if self
            .is_polling
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            debug!("[POLL] Another poll already in progress, skipping");
            return Ok(None);
        }

        let _guard = guard((), |_| {
            self.is_polling.store(false, Ordering::Release);
        });

        self.run_poll_internal().await.map(Some)
    }

    /// Внутренний метод реконсиляции (под single-flight guard)
    async fn run_poll_internal(&self) -> Result<TrackerSnapshot, SyncError> {
        match self.api.get_active_timer().await {
            Ok(remote) => {
                self.consecutive_failures.store(0, Ordering::Relaxed);
                let snapshot = self
                    .tracker
                    .apply_remote(remote)
                    .map_err(SyncError::Engine)?;

                // Пользователь видит актуальность данных через last_poll_at
                if let Some(db) = &self.db {
                    if let Err(e) = db.set_app_meta(
                        "last_poll_at",
                        &chrono::Utc::now().timestamp().to_string(),
                    ) {
                        warn!("[POLL] Failed to update last_poll_at: {}", e);
                    }
                }

                Ok(snapshot)
            }
            Err(e) => {
                // Неудачный poll НЕ сбрасывает состояние: последнее известное
                // остаётся на экране, чистит его только явный «нет таймера»
                let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                if failures == 5 {
                    warn!(
                        "[POLL] {} consecutive poll failures, keeping last known state: {}",
                        failures, e
                    );
                } else {
                    debug!(
                        "[POLL] Poll failed ({} in a row), keeping last known state: {}",
                        failures, e
                    );
                }
                Err(SyncError::Api(e))
            }
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    /// Unix timestamp последнего успешного poll (из app_meta)
    pub fn last_poll_at(&self) -> Option<i64> {
        let db = self.db.as_ref()?;
        db.get_app_meta("last_poll_at")
            .ok()
            .flatten()
            .and_then(|v| v.parse::<i64>().ok())
    }
}
