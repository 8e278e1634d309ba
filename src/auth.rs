use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose, Engine as _};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::models::TokenRefreshResult;

/// Файл с ключом шифрования очереди (рядом с БД)
const KEY_FILE_NAME: &str = ".queue_key";

/// Снимок учётных данных сессии.
/// Сохраняется вместе с каждой операцией в очереди, чтобы её можно было
/// доставить после перезапуска, до того как UI снова передаст токены.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Credentials {
    pub user_id: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user_id", &self.user_id)
            .field("access_token", &"<redacted>")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Менеджер аутентификации: текущий пользователь и токены
pub struct AuthManager {
    api_base_url: String,
    client: reqwest::Client,
    credentials: Arc<tokio::sync::RwLock<Option<Credentials>>>,
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
            credentials: Arc::new(tokio::sync::RwLock::new(None)),
        }
    }

    /// Установить учётные данные (login / refresh из UI)
    pub async fn set_credentials(&self, credentials: Option<Credentials>) {
        let has_access = credentials
            .as_ref()
            .map(|c| !c.access_token.is_empty())
            .unwrap_or(false);
        info!("[AUTH] set_credentials: access_token present={}", has_access);
        *self.credentials.write().await = credentials;
    }

    /// Обновить только токены (после refresh), user_id не меняется
    pub async fn update_tokens(&self, access_token: String, refresh_token: Option<String>) {
        let mut guard = self.credentials.write().await;
        if let Some(creds) = guard.as_mut() {
            creds.access_token = access_token;
            if refresh_token.is_some() {
                creds.refresh_token = refresh_token;
            }
        }
    }

    pub async fn credentials(&self) -> Option<Credentials> {
        self.credentials.read().await.clone()
    }

    pub async fn current_user_id(&self) -> Option<String> {
        self.credentials
            .read()
            .await
            .as_ref()
            .map(|c| c.user_id.clone())
    }

    pub async fn clear(&self) {
        *self.credentials.write().await = None;
    }

    /// Обновить токен через refresh token
    pub async fn refresh_token(&self, refresh_token: &str) -> Result<TokenRefreshResult, String> {
        let url = format!("{}/auth/refresh", self.api_base_url);
        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&serde_json::json!({
                "refresh_token": refresh_token
            }))
            .send()
            .await
            .map_err(|e| format!("Network error during token refresh: {}", e))?;

        if !response.status().is_success() {
            return Err(format!(
                "Token refresh failed with status: {}",
                response.status()
            ));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| format!("Failed to parse refresh response: {}", e))?;

        let access_token = json["access_token"]
            .as_str()
            .ok_or_else(|| "Missing access_token in refresh response".to_string())?
            .to_string();

        let refresh_token = json["refresh_token"].as_str().map(|s| s.to_string());

        Ok(TokenRefreshResult {
            access_token,
            refresh_token,
        })
    }
}

// ============================================
// CREDENTIAL ENCRYPTION
// ============================================

/// Шифрование снимков учётных данных перед сохранением в SQLite (AES-256-GCM)
pub struct TokenEncryption {
    cipher: Aes256Gcm,
}

impl TokenEncryption {
    /// Ключ: HUBNITY_ENCRYPTION_KEY (hex, 32 байта) → файл ключа в `key_dir` →
    /// эфемерный ключ (только для БД без каталога, например in-memory).
    pub fn new(key_dir: Option<&Path>) -> Result<Self, String> {
        let key = match std::env::var("HUBNITY_ENCRYPTION_KEY")
            .ok()
            .and_then(|k| hex::decode(k.trim()).ok())
        {
            Some(k) => k,
            None => match key_dir {
                Some(dir) => Self::load_or_create_key_file(dir)?,
                None => {
                    warn!("[AUTH] No key directory, using ephemeral encryption key");
                    Self::random_key().to_vec()
                }
            },
        };

        if key.len() != 32 {
            return Err("Encryption key must be 32 bytes".to_string());
        }

        let key_array: [u8; 32] = key
            .try_into()
            .map_err(|_| "Failed to convert key to array".to_string())?;

        Ok(Self {
            cipher: Aes256Gcm::new(&key_array.into()),
        })
    }

    fn random_key() -> [u8; 32] {
        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        key
    }

    fn load_or_create_key_file(dir: &Path) -> Result<Vec<u8>, String> {
        let path = dir.join(KEY_FILE_NAME);
        if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .map_err(|e| format!("Failed to read key file {}: {}", path.display(), e))?;
            return hex::decode(raw.trim())
                .map_err(|e| format!("Corrupted key file {}: {}", path.display(), e));
        }
        let key = Self::random_key();
        std::fs::write(&path, hex::encode(key))
            .map_err(|e| format!("Failed to write key file {}: {}", path.display(), e))?;
        info!("[AUTH] Generated new queue encryption key at {}", path.display());
        Ok(key.to_vec())
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, String> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| format!("Encryption failed: {}", e))?;

        // nonce + ciphertext, base64 для хранения в SQLite
        let mut result = nonce.to_vec();
        result.extend_from_slice(&ciphertext);
        Ok(general_purpose::STANDARD.encode(&result))
    }

    pub fn decrypt(&self, encrypted: &str) -> Result<String, String> {
        let data = general_purpose::STANDARD
            .decode(encrypted)
            .map_err(|e| format!("Base64 decode failed: {}", e))?;

        if data.len() < 12 {
            return Err("Invalid encrypted data length".to_string());
        }

        let nonce = Nonce::from_slice(&data[..12]);
        let plaintext = self
            .cipher
            .decrypt(nonce, &data[12..])
            .map_err(|e| format!("Decryption failed: {}", e))?;

        String::from_utf8(plaintext).map_err(|e| format!("UTF-8 decode failed: {}", e))
    }

    pub fn encrypt_credentials(&self, credentials: &Credentials) -> Result<String, String> {
        let json = serde_json::to_string(credentials)
            .map_err(|e| format!("Failed to serialize credentials: {}", e))?;
        self.encrypt(&json)
    }

    pub fn decrypt_credentials(&self, encrypted: &str) -> Result<Credentials, String> {
        let json = self.decrypt(encrypted)?;
        serde_json::from_str(&json).map_err(|e| format!("Invalid credentials snapshot: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn creds() -> Credentials {
        Credentials {
            user_id: "u1".into(),
            access_token: "access-123".into(),
            refresh_token: Some("refresh-456".into()),
        }
    }

    #[test]
    fn test_encrypt_decrypt_credentials() {
        let temp_dir = TempDir::new().unwrap();
        let encryption = TokenEncryption::new(Some(temp_dir.path())).unwrap();

        let encrypted = encryption.encrypt_credentials(&creds()).unwrap();
        assert!(!encrypted.contains("access-123"));

        let decrypted = encryption.decrypt_credentials(&encrypted).unwrap();
        assert_eq!(decrypted, creds());
    }

    #[test]
    fn test_key_file_is_reused_across_instances() {
        let temp_dir = TempDir::new().unwrap();
        let first = TokenEncryption::new(Some(temp_dir.path())).unwrap();
        let encrypted = first.encrypt("payload").unwrap();

        let second = TokenEncryption::new(Some(temp_dir.path())).unwrap();
        assert_eq!(second.decrypt(&encrypted).unwrap(), "payload");
    }

    #[test]
    fn test_decrypt_invalid_data() {
        let encryption = TokenEncryption::new(None).unwrap();
        assert!(encryption.decrypt("invalid_encrypted_data").is_err());
        assert!(encryption.decrypt("AAAA").is_err());
    }

    #[test]
    fn test_credentials_debug_redacts_tokens() {
        let printed = format!("{:?}", creds());
        assert!(printed.contains("u1"));
        assert!(!printed.contains("access-123"));
        assert!(!printed.contains("refresh-456"));
    }

    #[tokio::test]
    async fn test_update_tokens_keeps_user() {
        let auth = AuthManager::new("http://localhost".into());
        auth.set_credentials(Some(creds())).await;
        auth.update_tokens("new-access".into(), None).await;

        let current = auth.credentials().await.unwrap();
        assert_eq!(current.user_id, "u1");
        assert_eq!(current.access_token, "new-access");
        assert_eq!(current.refresh_token.as_deref(), Some("refresh-456"));
    }
}
