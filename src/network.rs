use reqwest::Client;
use std::time::Duration;

// Легковесные probe-URL для проверки связи (без авторизации, без тела)
const PROBE_URLS: [&str; 2] = [
    "https://www.cloudflare.com/cdn-cgi/trace",
    "https://www.google.com/generate_204",
];

// Проверка online статуса через легковесный HTTP запрос
// Используется в status(): offline объясняет, почему poll отдаёт stale данные
pub async fn check_online_status() -> bool {
    let client = match Client::builder().timeout(Duration::from_secs(2)).build() {
        Ok(client) => client,
        Err(_) => return false,
    };

    for url in PROBE_URLS {
        match client.get(url).timeout(Duration::from_secs(2)).send().await {
            Ok(response) => {
                if response.status().is_success() || response.status().as_u16() == 204 {
                    return true;
                }
            }
            Err(_) => continue,
        }
    }

    false
}
