use crate::models::TimeEntry;
use crate::Database;
use std::sync::{Arc, Mutex};
mod core;
mod db;
use serde::{Deserialize, Serialize};

pub use self::core::{active_minutes, manual_entry_minutes};

/// Timer Tracker - локальное зеркало авторитетного таймера сервера
/// Единственный писатель состояния - apply_remote (результат poll);
/// команды состояние НЕ мутируют (optimistic UI запрещён)
pub struct TimerTracker {
    /// Состояние FSM - единственный источник истины на клиенте
    pub(crate) state: Arc<Mutex<TimerState>>,
    /// Отображаемые секунды (локальный tick сглаживает между poll,
    /// каждый poll перезаписывает значение серверным)
    pub(crate) display_seconds: Arc<Mutex<u64>>,
    /// true после восстановления из кэша и до первого успешного poll:
    /// stale-снимок показывается, но tick его не наращивает
    pub(crate) stale: Arc<Mutex<bool>>,
    /// База данных для персистентности снимка
    pub(crate) db: Option<Arc<Database>>,
}

/// Состояние таймера - строгая FSM
/// Открытая запись существует только внутри Running/Paused
#[derive(Debug, Clone)]
pub enum TimerState {
    /// Нет активного таймера у пользователя
    Idle,
    /// Таймер идёт - хранит последний payload сервера
    Running { entry: TimeEntry },
    /// Таймер на паузе - запись всё ещё открыта
    Paused { entry: TimeEntry },
}

/// Упрощенная версия TimerState для UI (без полного payload)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", rename_all_fields = "camelCase")]
#[serde(tag = "state")]
pub enum TimerPhaseForApi {
    Idle,
    Running { task_id: i64, started_at: u64 },
    Paused { task_id: i64 },
}

/// Снимок состояния для UI
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackerSnapshot {
    #[serde(flatten)]
    pub state: TimerPhaseForApi,
    pub display_seconds: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry_id: Option<String>,
    /// true = снимок из кэша, ещё не подтверждён сервером
    pub stale: bool,
}

impl TrackerSnapshot {
    pub fn idle() -> Self {
        Self {
            state: TimerPhaseForApi::Idle,
            display_seconds: 0,
            entry_id: None,
            stale: false,
        }
    }
}

impl TimerTracker {
    /// Создать новый TimerTracker без БД (сессия без локального кэша)
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(TimerState::Idle)),
            display_seconds: Arc::new(Mutex::new(0)),
            stale: Arc::new(Mutex::new(false)),
            db: None,
        }
    }
}

impl Default for TimerTracker {
    fn default() -> Self {
        Self::new()
    }
}
