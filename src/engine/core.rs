use crate::engine::{TimerPhaseForApi, TimerState, TimerTracker, TrackerSnapshot};
use crate::models::TimeEntry;
use chrono::NaiveTime;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

/// Активные минуты открытой записи в момент now_secs:
/// floor((now - start) - накопленные паузы - (на паузе ? now - paused_at : 0))
/// Отрицательные значения от clock skew прижимаются к нулю
pub fn active_minutes(
    now_secs: u64,
    start_secs: u64,
    paused_minutes: u64,
    paused_at: Option<u64>,
) -> u64 {
    let gross = now_secs.saturating_sub(start_secs);
    let live_pause = paused_at
        .map(|p| now_secs.saturating_sub(p))
        .unwrap_or(0);
    let paused_total = paused_minutes
        .saturating_mul(60)
        .saturating_add(live_pause);
    gross.saturating_sub(paused_total) / 60
}

/// Длительность ручной записи в минутах в пределах одной даты
/// None если end <= start - команда отклонит такую запись до отправки
pub fn manual_entry_minutes(start: NaiveTime, end: NaiveTime) -> Option<u64> {
    let delta = (end - start).num_minutes();
    if delta <= 0 {
        None
    } else {
        Some(delta as u64)
    }
}

fn now_unix_secs() -> Result<u64, String> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .map_err(|e| format!("Failed to get timestamp: {}", e))
}

impl TimerTracker {
    /// Применить результат poll - единственная точка записи состояния
    /// Правило приоритета: серверное значение всегда перезаписывает локальный tick
    pub fn apply_remote(&self, remote: Option<TimeEntry>) -> Result<TrackerSnapshot, String> {
        let new_state = match remote {
            None => TimerState::Idle,
            Some(entry) if !entry.is_open() => {
                // Закрытая запись в роли «активного таймера» - эквивалент пустого ответа
                info!(
                    "[TIMER] Active-timer payload is already closed (entry {}), going idle",
                    entry.id
                );
                TimerState::Idle
            }
            Some(entry) => {
                if entry.is_paused != entry.paused_at.is_some() {
                    // Инвариант paused_at ⇔ Paused нарушен; флаг is_paused сервера приоритетен
                    warn!(
                        "[TIMER] Inconsistent pause fields for entry {}: is_paused={}, paused_at={:?}",
                        entry.id, entry.is_paused, entry.paused_at
                    );
                }
                if entry.is_paused {
                    TimerState::Paused { entry }
                } else {
                    TimerState::Running { entry }
                }
            }
        };

        let display_seconds = match &new_state {
            TimerState::Idle => 0,
            TimerState::Running { entry } | TimerState::Paused { entry } => {
                let minutes = match entry.duration_minutes {
                    Some(m) => m,
                    // Fallback для payload без durationMinutes
                    None => active_minutes(
                        now_unix_secs()?,
                        entry.start_time,
                        entry.paused_minutes,
                        entry.paused_at,
                    ),
                };
                minutes.saturating_mul(60)
            }
        };

        {
            let mut state = self
                .state
                .lock()
                .map_err(|e| format!("Mutex poisoned: {}", e))?;
            *state = new_state;
        }
        {
            let mut display = self
                .display_seconds
                .lock()
                .map_err(|e| format!("Mutex poisoned: {}", e))?;
            *display = display_seconds;
        }
        {
            let mut stale = self
                .stale
                .lock()
                .map_err(|e| format!("Mutex poisoned: {}", e))?;
            *stale = false;
        }

        // Persist после освобождения всех locks
        if let Err(e) = self.persist() {
            warn!("[TIMER] Failed to persist snapshot after poll: {}", e);
        }

        self.snapshot()
    }

    /// Локальный тик раз в секунду: наращивает display только в Running
    /// Presentation smoothing между poll; следующий poll значение перезапишет.
    /// Stale-снимок (восстановлен из кэша, сервером не подтверждён) не тикает
    pub fn tick(&self) -> Result<TrackerSnapshot, String> {
        let is_running = {
            let state = self
                .state
                .lock()
                .map_err(|e| format!("Mutex poisoned: {}", e))?;
            matches!(&*state, TimerState::Running { .. })
        };
        let is_stale = {
            let stale = self
                .stale
                .lock()
                .map_err(|e| format!("Mutex poisoned: {}", e))?;
            *stale
        };

        if is_running && !is_stale {
            let mut display = self
                .display_seconds
                .lock()
                .map_err(|e| format!("Mutex poisoned: {}", e))?;
            *display = display.saturating_add(1);
        }

        self.snapshot()
    }

    /// Текущий снимок состояния для UI
    pub fn snapshot(&self) -> Result<TrackerSnapshot, String> {
        let state = self
            .state
            .lock()
            .map_err(|e| format!("Mutex poisoned: {}", e))?;
        let display_seconds = *self
            .display_seconds
            .lock()
            .map_err(|e| format!("Mutex poisoned: {}", e))?;
        let stale = *self
            .stale
            .lock()
            .map_err(|e| format!("Mutex poisoned: {}", e))?;

        let (phase, entry_id) = match &*state {
            TimerState::Idle => (TimerPhaseForApi::Idle, None),
            TimerState::Running { entry } => (
                TimerPhaseForApi::Running {
                    task_id: entry.task_id,
                    started_at: entry.start_time,
                },
                Some(entry.id.clone()),
            ),
            TimerState::Paused { entry } => (
                TimerPhaseForApi::Paused {
                    task_id: entry.task_id,
                },
                Some(entry.id.clone()),
            ),
        };

        Ok(TrackerSnapshot {
            state: phase,
            display_seconds,
            entry_id,
            stale,
        })
    }

    /// Копия открытой записи для precondition-проверок команд
    pub fn active_entry(&self) -> Result<Option<TimeEntry>, String> {
        let state = self
            .state
            .lock()
            .map_err(|e| format!("Mutex poisoned: {}", e))?;
        Ok(match &*state {
            TimerState::Idle => None,
            TimerState::Running { entry } | TimerState::Paused { entry } => Some(entry.clone()),
        })
    }
}
