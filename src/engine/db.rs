use crate::engine::{TimerState, TimerTracker};
use crate::models::TimeEntry;
use crate::Database;
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};

impl TimerTracker {
    /// Сохранить текущий снимок в локальный кэш
    /// Публичный метод для явного сохранения (например, при shutdown)
    pub fn persist(&self) -> Result<(), String> {
        let db = match &self.db {
            Some(db) => db,
            None => return Ok(()), // Нет БД - пропускаем
        };

        let state = self
            .state
            .lock()
            .map_err(|e| format!("Mutex poisoned: {}", e))?;
        let display_seconds = *self
            .display_seconds
            .lock()
            .map_err(|e| format!("Mutex poisoned: {}", e))?;

        let (state_str, entry_json) = match &*state {
            TimerState::Idle => ("idle", None),
            TimerState::Running { entry } => ("running", Some(entry)),
            TimerState::Paused { entry } => ("paused", Some(entry)),
        };
        let entry_json = match entry_json {
            Some(entry) => Some(
                serde_json::to_string(entry)
                    .map_err(|e| format!("Failed to serialize cached entry: {}", e))?,
            ),
            None => None,
        };

        db.save_timer_cache(state_str, entry_json.as_deref(), display_seconds)
            .map_err(|e| format!("Failed to save snapshot to DB: {}", e))?;

        Ok(())
    }

    /// Инициализация с базой данных
    pub fn with_db(db: Arc<Database>) -> Self {
        let tracker = Self {
            state: Arc::new(Mutex::new(TimerState::Idle)),
            display_seconds: Arc::new(Mutex::new(0)),
            stale: Arc::new(Mutex::new(false)),
            db: Some(db),
        };

        // Восстанавливаем последний снимок из кэша
        if let Err(e) = tracker.restore_state() {
            error!("[RECOVERY] Failed to restore snapshot from DB: {}", e);
        }

        tracker
    }

    /// Восстановить последний известный снимок из кэша
    /// Снимок помечается stale: показывается как stale-but-available и не тикает,
    /// пока первый успешный poll его не подтвердит (или не перезапишет)
    /// GUARD: НИКОГДА не крашиться на ошибке восстановления
    fn restore_state(&self) -> Result<(), String> {
        let db = match &self.db {
            Some(db) => db,
            None => return Ok(()),
        };

        let (state_str, entry_json, display_seconds) = match db.load_timer_cache() {
            Ok(Some(row)) => row,
            Ok(None) => {
                // Первый запуск - кэша ещё нет
                info!("[RECOVERY] No cached snapshot found, starting fresh");
                return Ok(());
            }
            Err(e) => {
                error!(
                    "[RECOVERY] Failed to load snapshot from DB: {}. Starting with default state.",
                    e
                );
                return Ok(());
            }
        };

        let entry: Option<TimeEntry> = match entry_json {
            Some(json) => match serde_json::from_str(&json) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!(
                        "[RECOVERY] Cached entry payload is unreadable: {}. Dropping cache.",
                        e
                    );
                    None
                }
            },
            None => None,
        };

        let restored = match (state_str.as_str(), entry) {
            ("running", Some(entry)) => TimerState::Running { entry },
            ("paused", Some(entry)) => TimerState::Paused { entry },
            ("idle", _) => TimerState::Idle,
            // Payload потерян - восстанавливать нечего
            ("running", None) | ("paused", None) => TimerState::Idle,
            (other, _) => {
                warn!(
                    "[RECOVERY] Unknown cached state '{}', defaulting to Idle",
                    other
                );
                TimerState::Idle
            }
        };
        let is_idle = matches!(restored, TimerState::Idle);

        match self.state.lock() {
            Ok(mut state) => *state = restored,
            Err(e) => {
                error!("[RECOVERY] Mutex poisoned for state: {}. Using default (Idle).", e);
                return Ok(());
            }
        }
        if let Ok(mut display) = self.display_seconds.lock() {
            *display = if is_idle { 0 } else { display_seconds };
        }
        if let Ok(mut stale) = self.stale.lock() {
            // Idle из кэша не «устаревает» - нечего подтверждать
            *stale = !is_idle;
        }

        info!(
            "[RECOVERY] Restored snapshot: state={}, display={}s (stale until first poll)",
            state_str, display_seconds
        );
        Ok(())
    }

    /// Сбросить состояние таймера (логаут / смена пользователя)
    pub fn reset_state(&self) -> Result<(), String> {
        {
            let mut state = self
                .state
                .lock()
                .map_err(|e| format!("Mutex poisoned: {}", e))?;
            *state = TimerState::Idle;
        }
        {
            let mut display = self
                .display_seconds
                .lock()
                .map_err(|e| format!("Mutex poisoned: {}", e))?;
            *display = 0;
        }
        {
            let mut stale = self
                .stale
                .lock()
                .map_err(|e| format!("Mutex poisoned: {}", e))?;
            *stale = false;
        }
        if let Some(db) = &self.db {
            db.clear_timer_cache()
                .map_err(|e| format!("Failed to clear timer cache: {}", e))?;
        }
        Ok(())
    }
}
