use serde::{Deserialize, Serialize};

/// Статус согласования закрытой записи времени
/// Назначается сервером при stop (pending) и меняется ровно один раз
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

impl ApprovalStatus {
    /// Решение финально: approved/rejected не пересматриваются
    pub fn is_decided(&self) -> bool {
        matches!(self, ApprovalStatus::Approved | ApprovalStatus::Rejected)
    }
}

/// Статус задачи в Taskpulse
/// Трекинг времени разрешён только для InProgress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Todo,
    InProgress,
    Review,
    Done,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: i64,
    pub project_id: i64,
    pub name: String,
    pub status: TaskStatus,
}

impl Task {
    pub fn is_trackable(&self) -> bool {
        self.status == TaskStatus::InProgress
    }
}

/// Запись времени (wire-формат сервера, camelCase)
/// Инварианты сервера: end_time == NULL ⇔ запись открыта;
/// paused_at != NULL ⇔ запись сейчас на паузе
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeEntry {
    pub id: String,
    pub user_id: i64,
    pub task_id: i64,
    pub project_id: i64,
    /// Unix timestamp (секунды) начала записи
    pub start_time: u64,
    /// None пока запись открыта (running или paused)
    #[serde(default)]
    pub end_time: Option<u64>,
    /// Unix timestamp начала текущей паузы (только в состоянии Paused)
    #[serde(default)]
    pub paused_at: Option<u64>,
    /// Накопленные минуты завершённых пауз
    #[serde(default)]
    pub paused_minutes: u64,
    /// Server-computed длительность в минутах (текущая для открытой записи,
    /// финальная для закрытой). Старые серверы поле не отдают - тогда клиент
    /// считает её сам из timestamps (см. engine::active_minutes)
    #[serde(default)]
    pub duration_minutes: Option<u64>,
    #[serde(default)]
    pub is_paused: bool,
    /// Присутствует только у закрытых записей
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_status: Option<ApprovalStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl TimeEntry {
    /// end_time == None ⇔ запись открыта (running или paused)
    pub fn is_open(&self) -> bool {
        self.end_time.is_none()
    }

    pub fn is_running(&self) -> bool {
        self.is_open() && !self.is_paused
    }

    pub fn is_paused_now(&self) -> bool {
        self.is_open() && self.is_paused
    }

    /// Финальная длительность закрытой записи. Фиксируется сервером при stop
    /// и никогда не пересчитывается из timestamps (settlement)
    pub fn final_duration_minutes(&self) -> Option<u64> {
        if self.is_open() {
            None
        } else {
            self.duration_minutes
        }
    }
}

/// Фильтры списка записей для timesheet/timeline (read-only)
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryFilters {
    /// Даты в формате YYYY-MM-DD
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<ApprovalStatus>,
}

/// Результат обновления токена
#[derive(Debug)]
pub struct TokenRefreshResult {
    pub access_token: String,
    pub refresh_token: Option<String>,
}

/// Статус ядра для UI (online-статус и здоровье poll-цикла)
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackerStatusResponse {
    pub is_online: bool,
    pub consecutive_poll_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_poll_at: Option<i64>,
}
