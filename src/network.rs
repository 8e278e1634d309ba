use reqwest::Client;
use std::time::Duration;
use tracing::debug;

const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

// Проверка online статуса через легковесный HTTP запрос: первый ответивший URL решает
pub async fn check_online_status(probe_urls: &[String]) -> bool {
    if probe_urls.is_empty() {
        return false;
    }
    let client = match Client::builder().timeout(PROBE_TIMEOUT).build() {
        Ok(client) => client,
        Err(_) => return false,
    };

    for url in probe_urls {
        match client.get(url).timeout(PROBE_TIMEOUT).send().await {
            Ok(response) if response.status().is_success() => return true,
            Ok(response) => debug!("[NET] Probe {} answered {}", url, response.status()),
            Err(e) => debug!("[NET] Probe {} failed: {}", url, e),
        }
    }
    false
}

/// Домен из URL (без схемы и пути); None для не-http(s)
pub fn extract_domain(url: &str) -> Option<String> {
    let without_protocol = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))?;
    let host = without_protocol
        .split(|c: char| c == '/' || c == '?' || c == '#')
        .next()
        .unwrap_or(without_protocol);
    if host.is_empty() {
        None
    } else {
        Some(host.to_string())
    }
}
