use crate::auth::AuthManager;
use crate::models::{EntryFilters, TimeEntry};
use crate::sync::SyncConfig;
use reqwest::Method;
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Ошибки транспортного слоя (для разбора и логирования)
#[derive(Debug)]
pub enum ApiError {
    Auth(String),
    Network(String),
    Http {
        status: u16,
        message: String,
        code: Option<String>,
    },
    Parse(String),
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiError::Auth(s) => write!(f, "Auth: {}", s),
            ApiError::Network(s) => write!(f, "Network: {}", s),
            ApiError::Http { status, message, .. } => write!(f, "HTTP {}: {}", status, message),
            ApiError::Parse(s) => write!(f, "Parse response: {}", s),
        }
    }
}

/// Тело ошибки сервера: { "code": "CONFLICT", "message": "..." }
/// code может отсутствовать у старых серверов - тогда разбор по message
#[derive(Debug, Deserialize)]
struct ServerErrorBody {
    #[serde(default)]
    code: Option<String>,
    message: String,
}

/// Клиент REST API Taskpulse
/// Все мутации - request/response; сервер единственный арбитр инварианта
/// «один активный таймер на пользователя»
pub struct ApiClient {
    client: reqwest::Client,
    api_base_url: String,
    auth: Arc<AuthManager>,
    /// App version sent in X-App-Version header for debugging version skew
    app_version: String,
}

impl ApiClient {
    pub fn new(config: &SyncConfig, auth: Arc<AuthManager>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            api_base_url: config.api_base_url.clone(),
            auth,
            app_version: config.app_version.clone(),
        }
    }

    /// Выполнить авторизованный запрос
    /// При 401 один раз обновляет токен через AuthManager и повторяет запрос
    async fn send_authorized(
        &self,
        method: Method,
        url: String,
        body: Option<serde_json::Value>,
        query: Option<&EntryFilters>,
    ) -> Result<reqwest::Response, ApiError> {
        let mut access_token = self
            .auth
            .get_access_token()
            .await
            .map_err(ApiError::Auth)?;
        let mut retry_with_refresh = true;

        loop {
            let mut request = self
                .client
                .request(method.clone(), &url)
                .header("Content-Type", "application/json")
                .header("Authorization", format!("Bearer {}", access_token))
                .header("X-App-Version", &self.app_version);
            if let Some(filters) = query {
                request = request.query(filters);
            }
            if let Some(body) = &body {
                request = request.json(body);
            }

            let response = request
                .send()
                .await
                .map_err(|e| ApiError::Network(e.to_string()))?;
            let status = response.status();

            // Если 401 и есть refresh_token, обновляем токен (одна попытка)
            if status.as_u16() == 401 && retry_with_refresh {
                let refresh = self
                    .auth
                    .get_refresh_token()
                    .await
                    .map_err(ApiError::Auth)?;
                let refresh = match refresh {
                    Some(r) => r,
                    None => {
                        return Err(ApiError::Auth(
                            "Token expired (401) but no refresh token available".into(),
                        ))
                    }
                };
                info!("[API] Token expired (401), refreshing token");
                let result = self
                    .auth
                    .refresh_token(&refresh)
                    .await
                    .map_err(ApiError::Auth)?;
                access_token = result.access_token.clone();
                self.auth
                    .set_tokens(
                        Some(result.access_token),
                        result.refresh_token.or(Some(refresh)),
                    )
                    .await;
                retry_with_refresh = false;
                continue;
            }

            if status.is_success() {
                return Ok(response);
            }

            let status_code = status.as_u16();
            let body_text = response.text().await.unwrap_or_default();
            let (code, message) = match serde_json::from_str::<ServerErrorBody>(&body_text) {
                Ok(parsed) => (parsed.code, parsed.message),
                Err(_) => (
                    None,
                    if body_text.is_empty() {
                        status.canonical_reason().unwrap_or("Unknown").to_string()
                    } else {
                        body_text
                    },
                ),
            };
            if status_code == 400 {
                warn!("[API] HTTP 400 response body: {}", message);
            }
            return Err(ApiError::Http {
                status: status_code,
                message,
                code,
            });
        }
    }

    async fn parse_entry(response: reqwest::Response) -> Result<TimeEntry, ApiError> {
        response
            .json::<TimeEntry>()
            .await
            .map_err(|e| ApiError::Parse(e.to_string()))
    }

    /// GET /time-entries/active - единственный авторитетный таймер пользователя
    /// 204 (или null в теле) = активного таймера нет
    pub async fn get_active_timer(&self) -> Result<Option<TimeEntry>, ApiError> {
        let url = format!("{}/time-entries/active", self.api_base_url);
        let response = self.send_authorized(Method::GET, url, None, None).await?;
        if response.status().as_u16() == 204 {
            return Ok(None);
        }
        response
            .json::<Option<TimeEntry>>()
            .await
            .map_err(|e| ApiError::Parse(e.to_string()))
    }

    /// POST /time-entries - старт таймера по задаче
    /// Сервер отклоняет, если задача не in_progress или уже есть активный таймер
    pub async fn start_timer(
        &self,
        task_id: i64,
        note: Option<&str>,
    ) -> Result<TimeEntry, ApiError> {
        let url = format!("{}/time-entries", self.api_base_url);
        let body = serde_json::json!({ "taskId": task_id, "note": note });
        let response = self
            .send_authorized(Method::POST, url, Some(body), None)
            .await?;
        Self::parse_entry(response).await
    }

    /// PUT /time-entries/{id}/{op} - pause/resume/stop: id в URL, тело пустое
    async fn transition(&self, timer_id: &str, op: &str) -> Result<TimeEntry, ApiError> {
        let url = format!("{}/time-entries/{}/{}", self.api_base_url, timer_id, op);
        let response = self
            .send_authorized(Method::PUT, url, Some(serde_json::json!({})), None)
            .await?;
        Self::parse_entry(response).await
    }

    pub async fn pause_timer(&self, timer_id: &str) -> Result<TimeEntry, ApiError> {
        self.transition(timer_id, "pause").await
    }

    pub async fn resume_timer(&self, timer_id: &str) -> Result<TimeEntry, ApiError> {
        self.transition(timer_id, "resume").await
    }

    pub async fn stop_timer(&self, timer_id: &str) -> Result<TimeEntry, ApiError> {
        self.transition(timer_id, "stop").await
    }

    /// POST /time-entries/manual - ручная запись, создаётся сразу закрытой
    /// (end_time установлен, approval pending). Сервер зеркалит проверку end > start
    pub async fn create_manual_entry(
        &self,
        task_id: i64,
        date: &str,
        start_time: &str,
        end_time: &str,
        note: Option<&str>,
    ) -> Result<TimeEntry, ApiError> {
        let url = format!("{}/time-entries/manual", self.api_base_url);
        let body = serde_json::json!({
            "taskId": task_id,
            "date": date,
            "startTime": start_time,
            "endTime": end_time,
            "note": note,
        });
        let response = self
            .send_authorized(Method::POST, url, Some(body), None)
            .await?;
        Self::parse_entry(response).await
    }

    /// PUT /time-entries/{id}/approve - только для pending записей
    pub async fn approve_entry(&self, entry_id: &str) -> Result<TimeEntry, ApiError> {
        self.transition(entry_id, "approve").await
    }

    /// PUT /time-entries/{id}/reject - причина обязательна
    pub async fn reject_entry(&self, entry_id: &str, reason: &str) -> Result<TimeEntry, ApiError> {
        let url = format!("{}/time-entries/{}/reject", self.api_base_url, entry_id);
        let body = serde_json::json!({ "reason": reason });
        let response = self
            .send_authorized(Method::PUT, url, Some(body), None)
            .await?;
        Self::parse_entry(response).await
    }

    /// GET /time-entries - timesheet/timeline (read-only)
    pub async fn list_entries(&self, filters: &EntryFilters) -> Result<Vec<TimeEntry>, ApiError> {
        let url = format!("{}/time-entries", self.api_base_url);
        let response = self
            .send_authorized(Method::GET, url, None, Some(filters))
            .await?;
        response
            .json::<Vec<TimeEntry>>()
            .await
            .map_err(|e| ApiError::Parse(e.to_string()))
    }
}
