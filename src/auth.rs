use crate::models::TokenRefreshResult;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Менеджер аутентификации: хранит токены сессии в памяти
/// Токены приходят от внешнего auth-слоя через set_tokens (re-init при логине,
/// clear_tokens при логауте); ядро само логин не выполняет
pub struct AuthManager {
    api_base_url: String,
    client: reqwest::Client,
    pub access_token: Arc<tokio::sync::RwLock<Option<String>>>,
    pub refresh_token: Arc<tokio::sync::RwLock<Option<String>>>,
}

#[derive(Deserialize)]
struct RefreshResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
}

impl AuthManager {
    pub fn new(api_base_url: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            api_base_url,
            client,
            access_token: Arc::new(tokio::sync::RwLock::new(None)),
            refresh_token: Arc::new(tokio::sync::RwLock::new(None)),
        }
    }

    /// Установить токены (вызывается хост-приложением после логина)
    pub async fn set_tokens(&self, access_token: Option<String>, refresh_token: Option<String>) {
        let has_access = access_token.as_ref().map(|t| !t.is_empty()).unwrap_or(false);
        info!("[AUTH] set_tokens: access token present={}", has_access);
        *self.access_token.write().await = access_token;
        *self.refresh_token.write().await = refresh_token;
    }

    /// Сбросить токены (логаут)
    pub async fn clear_tokens(&self) {
        *self.access_token.write().await = None;
        *self.refresh_token.write().await = None;
    }

    pub async fn get_access_token(&self) -> Result<String, String> {
        self.access_token
            .read()
            .await
            .clone()
            .ok_or_else(|| "Access token not set. Call set_tokens first.".to_string())
    }

    pub async fn get_refresh_token(&self) -> Result<Option<String>, String> {
        Ok(self.refresh_token.read().await.clone())
    }

    /// Обновить токен через refresh token
    /// Новые токены сохраняет вызывающий код через set_tokens
    pub async fn refresh_token(&self, refresh_token: &str) -> Result<TokenRefreshResult, String> {
        let url = format!("{}/auth/refresh", self.api_base_url);
        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&serde_json::json!({ "refresh_token": refresh_token }))
            .send()
            .await
            .map_err(|e| format!("Network error during token refresh: {}", e))?;

        if !response.status().is_success() {
            return Err(format!(
                "Token refresh failed with status: {}",
                response.status()
            ));
        }

        let body: RefreshResponse = response
            .json()
            .await
            .map_err(|e| format!("Failed to parse refresh response: {}", e))?;

        Ok(TokenRefreshResult {
            access_token: body.access_token,
            refresh_token: body.refresh_token,
        })
    }
}
