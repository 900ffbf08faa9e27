use crate::api::ApiError;
use crate::engine::{manual_entry_minutes, TrackerSnapshot};
use crate::models::{ApprovalStatus, EntryFilters, Task, TimeEntry, TrackerStatusResponse};
use crate::network::check_online_status;
use crate::TrackerSession;
use chrono::{NaiveDate, NaiveTime};
use scopeguard::guard;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Типизированные отказы команд - то, что видит UI
/// Conflict/InvalidTaskState/InvalidState/Validation не ретраятся: повтор без
/// смены входа воспроизведёт тот же отказ. Network - retryable
#[derive(Debug)]
pub enum CommandError {
    /// У пользователя уже есть активный таймер по другой задаче
    Conflict(String),
    /// Задача не в статусе, разрешающем трекинг
    InvalidTaskState(String),
    /// Команда невозможна из текущего состояния
    InvalidState(String),
    /// Некорректный ввод (например, ручная запись с end <= start)
    Validation(String),
    /// Сервис недоступен - команду можно повторить
    Network(String),
    Auth(String),
    Internal(String),
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandError::Conflict(s) => write!(f, "{}", s),
            CommandError::InvalidTaskState(s) => write!(f, "{}", s),
            CommandError::InvalidState(s) => write!(f, "{}", s),
            CommandError::Validation(s) => write!(f, "{}", s),
            CommandError::Network(s) => write!(f, "Network: {}", s),
            CommandError::Auth(s) => write!(f, "Auth: {}", s),
            CommandError::Internal(s) => write!(f, "Internal: {}", s),
        }
    }
}

impl CommandError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, CommandError::Network(_))
    }
}

impl From<ApiError> for CommandError {
    fn from(e: ApiError) -> Self {
        match e {
            ApiError::Network(s) => CommandError::Network(s),
            ApiError::Auth(s) => CommandError::Auth(s),
            // Нечитаемый ответ = неудавшийся обмен, трактуем как transient
            ApiError::Parse(s) => CommandError::Network(format!("Invalid server response: {}", s)),
            ApiError::Http {
                status,
                message,
                code,
            } => classify_http(status, message, code),
        }
    }
}

/// Классификация серверного отказа: по code, затем по тексту message
/// (серверы без code отдают только текст), затем по HTTP-статусу
fn classify_http(status: u16, message: String, code: Option<String>) -> CommandError {
    if let Some(code) = code.as_deref() {
        match code {
            "CONFLICT" => return CommandError::Conflict(message),
            "INVALID_TASK_STATE" => return CommandError::InvalidTaskState(message),
            "INVALID_STATE" => return CommandError::InvalidState(message),
            "VALIDATION_ERROR" => return CommandError::Validation(message),
            _ => {}
        }
    }

    let lower = message.to_lowercase();
    if lower.contains("active time entry") || lower.contains("another timer") {
        return CommandError::Conflict(message);
    }
    if lower.contains("in progress") || lower.contains("task status") {
        return CommandError::InvalidTaskState(message);
    }

    match status {
        409 => CommandError::Conflict(message),
        422 => CommandError::Validation(message),
        400 => CommandError::InvalidState(message),
        401 | 403 => CommandError::Auth(message),
        // 5xx и прочее - проблема сервиса, повтор осмыслен
        _ => CommandError::Network(format!("HTTP {}: {}", status, message)),
    }
}

// ============================================
// КОМАНДЫ (user-facing API ядра)
// ============================================

impl TrackerSession {
    /// Guard: одна команда в полёте
    /// Запрет перекрытия защищает от out-of-order применения (поздний ответ
    /// Pause поверх более нового Resume)
    fn command_guard(
        &self,
    ) -> Result<scopeguard::ScopeGuard<Arc<AtomicBool>, impl FnOnce(Arc<AtomicBool>)>, CommandError>
    {
        if self
            .command_in_flight
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return Err(CommandError::InvalidState(
                "Another command is still in flight".to_string(),
            ));
        }
        Ok(guard(self.command_in_flight.clone(), |flag| {
            flag.store(false, Ordering::Release);
        }))
    }

    /// Принудительный re-poll сразу после успешной команды - UI отражает
    /// пост-командное состояние без ожидания планового тика.
    /// Если re-poll пропущен или упал, применяем ответ самой команды:
    /// он тоже авторитетное пост-командное состояние
    async fn reconcile_after_command(
        &self,
        command: &str,
        response: TimeEntry,
    ) -> Result<TrackerSnapshot, CommandError> {
        match self.sync.poll_once().await {
            Ok(Some(snapshot)) => Ok(snapshot),
            Ok(None) => self.apply_command_response(command, response),
            Err(e) => {
                warn!(
                    "[CMD] Forced re-poll after {} failed ({}), applying command response",
                    command, e
                );
                self.apply_command_response(command, response)
            }
        }
    }

    fn apply_command_response(
        &self,
        command: &str,
        response: TimeEntry,
    ) -> Result<TrackerSnapshot, CommandError> {
        debug!("[CMD] Applying {} response for entry {}", command, response.id);
        self.tracker
            .apply_remote(Some(response))
            .map_err(CommandError::Internal)
    }

    /// Re-poll после команд, не меняющих активный таймер (manual/approve/reject):
    /// ошибки глотаем, следующий плановый тик всё догонит
    async fn fire_repoll(&self, command: &str) {
        if let Err(e) = self.sync.poll_once().await {
            debug!(
                "[CMD] Post-{} re-poll failed (next tick will catch up): {}",
                command, e
            );
        }
    }

    /// Start: Idle → Running по задаче в статусе in_progress
    /// Локальные проверки - быстрый отказ; сервер перепроверяет авторитетно
    /// (локальный снимок может быть устаревшим). Никакого optimistic UI:
    /// состояние меняет только подтверждение
    pub async fn start(
        &self,
        task: &Task,
        note: Option<&str>,
    ) -> Result<TrackerSnapshot, CommandError> {
        let _guard = self.command_guard()?;

        if !task.is_trackable() {
            return Err(CommandError::InvalidTaskState(format!(
                "Task '{}' must be in progress to start a timer",
                task.name
            )));
        }
        if let Some(active) = self.tracker.active_entry().map_err(CommandError::Internal)? {
            if active.task_id == task.id {
                return Err(CommandError::InvalidState(
                    "Timer is already running for this task".to_string(),
                ));
            }
            // Не стартуем второй таймер поверх чужого: сначала stop
            return Err(CommandError::Conflict(format!(
                "Another timer is active (task {}). Stop it before starting a new one.",
                active.task_id
            )));
        }

        let entry = self.api.start_timer(task.id, note).await?;
        info!("[CMD] Timer started: entry {} task {}", entry.id, entry.task_id);
        self.reconcile_after_command("start", entry).await
    }

    /// Pause: Running → Paused
    pub async fn pause(&self) -> Result<TrackerSnapshot, CommandError> {
        let _guard = self.command_guard()?;

        let entry = match self.tracker.active_entry().map_err(CommandError::Internal)? {
            None => {
                return Err(CommandError::InvalidState(
                    "No active timer to pause".to_string(),
                ))
            }
            Some(e) if e.is_paused => {
                return Err(CommandError::InvalidState(
                    "Timer is already paused".to_string(),
                ))
            }
            Some(e) => e,
        };

        let updated = self.api.pause_timer(&entry.id).await?;
        info!("[CMD] Timer paused: entry {}", updated.id);
        self.reconcile_after_command("pause", updated).await
    }

    /// Resume: Paused → Running
    pub async fn resume(&self) -> Result<TrackerSnapshot, CommandError> {
        let _guard = self.command_guard()?;

        let entry = match self.tracker.active_entry().map_err(CommandError::Internal)? {
            None => {
                return Err(CommandError::InvalidState(
                    "No active timer to resume".to_string(),
                ))
            }
            Some(e) if !e.is_paused => {
                return Err(CommandError::InvalidState(
                    "Timer is already running".to_string(),
                ))
            }
            Some(e) => e,
        };

        let updated = self.api.resume_timer(&entry.id).await?;
        info!("[CMD] Timer resumed: entry {}", updated.id);
        self.reconcile_after_command("resume", updated).await
    }

    /// Stop: Running|Paused → Idle
    /// Сервер фиксирует end_time и финальную длительность (settlement)
    /// и создаёт approval-запись в статусе pending
    pub async fn stop(&self) -> Result<TrackerSnapshot, CommandError> {
        let _guard = self.command_guard()?;

        let entry = match self.tracker.active_entry().map_err(CommandError::Internal)? {
            None => {
                return Err(CommandError::InvalidState(
                    "No active timer to stop".to_string(),
                ))
            }
            Some(e) => e,
        };

        let updated = self.api.stop_timer(&entry.id).await?;
        info!(
            "[CMD] Timer stopped: entry {} ({:?} min)",
            updated.id, updated.duration_minutes
        );
        self.reconcile_after_command("stop", updated).await
    }

    /// Ручная запись: создаётся сразу закрытой (approval pending), активный
    /// таймер не затрагивает. end <= start отклоняется до отправки
    pub async fn create_manual_entry(
        &self,
        task_id: i64,
        date: NaiveDate,
        start_time: NaiveTime,
        end_time: NaiveTime,
        note: Option<&str>,
    ) -> Result<TimeEntry, CommandError> {
        let _guard = self.command_guard()?;

        let minutes = match manual_entry_minutes(start_time, end_time) {
            Some(m) => m,
            None => {
                return Err(CommandError::Validation(
                    "Manual entry must end after it starts".to_string(),
                ))
            }
        };

        let entry = self
            .api
            .create_manual_entry(
                task_id,
                &date.format("%Y-%m-%d").to_string(),
                &start_time.format("%H:%M").to_string(),
                &end_time.format("%H:%M").to_string(),
                note,
            )
            .await?;
        info!("[CMD] Manual entry created: {} ({} min)", entry.id, minutes);
        self.fire_repoll("manual-entry").await;
        Ok(entry)
    }

    /// Approve: pending → approved (только закрытые записи, решение финально)
    pub async fn approve(&self, entry: &TimeEntry) -> Result<TimeEntry, CommandError> {
        let _guard = self.command_guard()?;
        check_decidable(entry)?;

        let updated = self.api.approve_entry(&entry.id).await?;
        info!("[CMD] Entry {} approved", updated.id);
        self.fire_repoll("approve").await;
        Ok(updated)
    }

    /// Reject: pending → rejected, причина обязательна
    pub async fn reject(&self, entry: &TimeEntry, reason: &str) -> Result<TimeEntry, CommandError> {
        let _guard = self.command_guard()?;
        check_decidable(entry)?;
        if reason.trim().is_empty() {
            return Err(CommandError::Validation(
                "Rejection reason is required".to_string(),
            ));
        }

        let updated = self.api.reject_entry(&entry.id, reason).await?;
        info!("[CMD] Entry {} rejected", updated.id);
        self.fire_repoll("reject").await;
        Ok(updated)
    }

    /// Список записей для timesheet/timeline (read-only, без guard)
    pub async fn list_entries(
        &self,
        filters: &EntryFilters,
    ) -> Result<Vec<TimeEntry>, CommandError> {
        Ok(self.api.list_entries(filters).await?)
    }

    /// Текущий снимок таймера
    pub fn get_timer_state(&self) -> Result<TrackerSnapshot, String> {
        self.tracker.snapshot()
    }

    /// Статус ядра: online, здоровье poll-цикла, момент последнего poll
    pub async fn status(&self) -> TrackerStatusResponse {
        let is_online = check_online_status().await;
        TrackerStatusResponse {
            is_online,
            consecutive_poll_failures: self.sync.consecutive_failures(),
            last_poll_at: self.sync.last_poll_at(),
        }
    }
}

/// Проверка права на approve/reject: запись закрыта и ещё pending
fn check_decidable(entry: &TimeEntry) -> Result<(), CommandError> {
    if entry.is_open() {
        return Err(CommandError::InvalidState(
            "Only stopped entries can be approved or rejected".to_string(),
        ));
    }
    match entry.approval_status {
        Some(ApprovalStatus::Pending) => Ok(()),
        Some(ApprovalStatus::Approved) => Err(CommandError::InvalidState(
            "Entry is already approved".to_string(),
        )),
        Some(ApprovalStatus::Rejected) => Err(CommandError::InvalidState(
            "Entry is already rejected".to_string(),
        )),
        None => Err(CommandError::InvalidState(
            "Entry has no approval record".to_string(),
        )),
    }
}
