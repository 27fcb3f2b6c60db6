//! REST client for the courier backend.
//!
//! Every request carries the stored access token as a bearer header. A 401
//! triggers one re-authentication through the refresh-token endpoint and a
//! single retry of the original request.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use log::{debug, info, warn};
use reqwest::{Client, Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::auth::{CredentialStore, RefreshMode, TokenPair, TokenRefresher};
use crate::{NavError, Result};

/// Access tokens closer than this to expiry are refreshed opportunistically.
const EXPIRY_MARGIN_SECS: i64 = 60;

/// Backend REST settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// REST root including the version segment, e.g. `https://host/v1/`
    pub api_base: String,
    /// Default: 30 seconds
    pub timeout_secs: u64,
    /// Client id sent on sign-in. Default: courier
    pub client_id: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            api_base: "http://localhost:8000/v1/".to_string(),
            timeout_secs: 30,
            client_id: "courier".to_string(),
        }
    }
}

/// Status and decoded body of a backend call. Non-JSON bodies come back as
/// a JSON string.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub data: Value,
}

impl ApiResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Insert a `/` at the end of the path part of `url` if it lacks one,
/// keeping any query string intact.
pub fn validate_url(url: &str) -> String {
    match url.find('?') {
        None if url.ends_with('/') => url.to_string(),
        None => format!("{}/", url),
        Some(idx) if url[..idx].ends_with('/') => url.to_string(),
        Some(idx) => format!("{}/{}", &url[..idx], &url[idx..]),
    }
}

/// The `exp` claim (seconds since epoch) of a JWT, if it is one.
pub fn jwt_expiry(token: &str) -> Option<i64> {
    let payload = token.split('.').nth(1)?;
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .ok()?;
    let claims: Value = serde_json::from_slice(&bytes).ok()?;
    claims.get("exp")?.as_i64()
}

fn expires_soon(token: &str, now: i64) -> bool {
    match jwt_expiry(token) {
        Some(exp) => exp - now <= EXPIRY_MARGIN_SECS,
        // Opaque token: no way to tell, so refresh
        None => true,
    }
}

/// HTTP client for the courier backend.
#[derive(Clone)]
pub struct BackendClient {
    client: Client,
    config: BackendConfig,
    credentials: CredentialStore,
}

impl BackendClient {
    pub fn new(config: BackendConfig, credentials: CredentialStore) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| NavError::Config {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            config,
            credentials,
        })
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    fn api_url(&self, path: &str) -> String {
        validate_url(&format!("{}{}", self.config.api_base, path))
    }

    async fn send(&self, method: Method, path: &str, body: Option<&Value>) -> Result<ApiResponse> {
        let url = self.api_url(path);
        let mut retried = false;

        loop {
            let mut request = self.client.request(method.clone(), &url);
            if let Some(token) = self.credentials.access_token()? {
                request = request.bearer_auth(token);
            }
            if let Some(body) = body {
                request = request.json(body);
            }

            let response = request.send().await?;
            let status = response.status();

            if status == StatusCode::UNAUTHORIZED && !retried {
                retried = true;
                debug!("[BackendClient] 401 on {} {}, re-authenticating", method, path);
                self.reauthenticate().await?;
                continue;
            }

            let text = response.text().await?;
            let data = serde_json::from_str(&text).unwrap_or(Value::String(text));
            return Ok(ApiResponse {
                status: status.as_u16(),
                data,
            });
        }
    }

    pub async fn get(&self, path: &str) -> Result<ApiResponse> {
        self.send(Method::GET, path, None).await
    }

    pub async fn post(&self, path: &str, body: &Value) -> Result<ApiResponse> {
        self.send(Method::POST, path, Some(body)).await
    }

    pub async fn put(&self, path: &str, body: &Value) -> Result<ApiResponse> {
        self.send(Method::PUT, path, Some(body)).await
    }

    pub async fn patch(&self, path: &str, body: &Value) -> Result<ApiResponse> {
        self.send(Method::PATCH, path, Some(body)).await
    }

    pub async fn delete(&self, path: &str) -> Result<ApiResponse> {
        self.send(Method::DELETE, path, None).await
    }

    /// Sign in and store the issued token pair.
    pub async fn sign_in(&self, email: &str, password: &str) -> Result<TokenPair> {
        let url = self.api_url(&format!("auth/sign-in/?client_id={}", self.config.client_id));
        let response = self
            .client
            .post(&url)
            .json(&json!({ "email": email, "password": password }))
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(NavError::auth(format!("sign-in rejected ({})", status)));
        }
        if !status.is_success() {
            return Err(NavError::Http {
                message: format!("sign-in failed: HTTP {}", status),
                status_code: Some(status.as_u16()),
            });
        }

        let tokens: TokenPair = response.json().await?;
        self.credentials.save(&tokens)?;
        info!("[BackendClient] Signed in");
        Ok(tokens)
    }

    /// Force a token refresh and persist the new pair.
    pub async fn reauthenticate(&self) -> Result<TokenPair> {
        self.credentials
            .refresh_with(self, RefreshMode::Forced)
            .await?
            .ok_or_else(|| NavError::auth("refresh returned no tokens"))
    }

    async fn exchange_refresh_token(&self, refresh_token: &str) -> Result<TokenPair> {
        let response = self
            .client
            .post(self.api_url("auth/refresh-token/"))
            .bearer_auth(refresh_token)
            .json(&json!({}))
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            warn!("[BackendClient] Refresh token rejected, clearing credentials");
            self.credentials.clear()?;
            return Err(NavError::auth("refresh token rejected"));
        }
        if !status.is_success() {
            return Err(NavError::Http {
                message: format!("refresh failed: HTTP {}", status),
                status_code: Some(status.as_u16()),
            });
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl TokenRefresher for BackendClient {
    async fn refresh(&self, tokens: &TokenPair, mode: RefreshMode) -> Result<Option<TokenPair>> {
        if mode == RefreshMode::Opportunistic
            && !expires_soon(&tokens.access, chrono::Utc::now().timestamp())
        {
            return Ok(None);
        }
        self.exchange_refresh_token(&tokens.refresh).await.map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Answers one request per connection with the next scripted reply and
    /// records each request line with its bearer token.
    async fn scripted_backend(
        replies: Vec<(u16, &'static str)>,
    ) -> (String, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}/v1/", listener.local_addr().unwrap());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let requests = seen.clone();

        tokio::spawn(async move {
            for (status, body) in replies {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut request = Vec::new();
                let mut chunk = [0u8; 1024];
                let head_end = loop {
                    let n = socket.read(&mut chunk).await.unwrap();
                    request.extend_from_slice(&chunk[..n]);
                    if let Some(pos) = request.windows(4).position(|w| w == b"\r\n\r\n") {
                        break pos + 4;
                    }
                    assert!(n > 0, "connection closed mid-request");
                };
                let head = String::from_utf8_lossy(&request[..head_end]).to_string();
                let header = |name: &str| {
                    head.lines().find_map(|line| {
                        let (key, value) = line.split_once(':')?;
                        key.eq_ignore_ascii_case(name).then(|| value.trim().to_string())
                    })
                };
                let content_length = header("content-length")
                    .and_then(|v| v.parse::<usize>().ok())
                    .unwrap_or(0);
                while request.len() < head_end + content_length {
                    let n = socket.read(&mut chunk).await.unwrap();
                    assert!(n > 0, "connection closed mid-body");
                    request.extend_from_slice(&chunk[..n]);
                }

                let request_line = head.lines().next().unwrap_or_default().to_string();
                let bearer = header("authorization").unwrap_or_else(|| "-".to_string());
                requests.lock().unwrap().push(format!("{} | {}", request_line, bearer));

                let response = format!(
                    "HTTP/1.1 {} Scripted\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                socket.write_all(response.as_bytes()).await.unwrap();
                socket.shutdown().await.ok();
            }
        });

        (base, seen)
    }

    fn jwt_with_exp(exp: i64) -> String {
        let engine = base64::engine::general_purpose::URL_SAFE_NO_PAD;
        format!(
            "{}.{}.sig",
            engine.encode(r#"{"alg":"HS256","typ":"JWT"}"#),
            engine.encode(format!(r#"{{"sub":"42","exp":{}}}"#, exp))
        )
    }

    #[test]
    fn test_validate_url() {
        assert_eq!(validate_url("https://h/v1/orders"), "https://h/v1/orders/");
        assert_eq!(validate_url("https://h/v1/orders/"), "https://h/v1/orders/");
        assert_eq!(
            validate_url("https://h/v1/auth/sign-in?client_id=courier"),
            "https://h/v1/auth/sign-in/?client_id=courier"
        );
        assert_eq!(
            validate_url("https://h/v1/auth/sign-in/?client_id=courier"),
            "https://h/v1/auth/sign-in/?client_id=courier"
        );
    }

    #[test]
    fn test_jwt_expiry() {
        assert_eq!(jwt_expiry(&jwt_with_exp(1_900_000_000)), Some(1_900_000_000));
        assert_eq!(jwt_expiry("opaque-token"), None);
        assert_eq!(jwt_expiry("a.!!!.c"), None);
    }

    #[test]
    fn test_expires_soon() {
        let now = 1_800_000_000;
        assert!(!expires_soon(&jwt_with_exp(now + 3600), now));
        assert!(expires_soon(&jwt_with_exp(now + 30), now));
        assert!(expires_soon(&jwt_with_exp(now - 10), now));
        assert!(expires_soon("opaque-token", now));
    }

    #[tokio::test]
    async fn test_opportunistic_refresh_skips_fresh_token() {
        let credentials = CredentialStore::new(Arc::new(MemoryStore::new()));
        let client = BackendClient::new(BackendConfig::default(), credentials).unwrap();
        let fresh = TokenPair::new(
            jwt_with_exp(chrono::Utc::now().timestamp() + 3600),
            "refresh",
        );

        // No network involved: the token is nowhere near expiry
        let result = client
            .refresh(&fresh, RefreshMode::Opportunistic)
            .await
            .unwrap();
        assert_eq!(result, None);
    }

    #[test]
    fn test_api_url() {
        let credentials = CredentialStore::new(Arc::new(MemoryStore::new()));
        let client = BackendClient::new(
            BackendConfig {
                api_base: "https://backend.example/v1/".to_string(),
                ..BackendConfig::default()
            },
            credentials,
        )
        .unwrap();
        assert_eq!(
            client.api_url("deliveries/current"),
            "https://backend.example/v1/deliveries/current/"
        );
    }

    #[tokio::test]
    async fn test_put_retries_once_after_reauthentication() {
        let (api_base, seen) = scripted_backend(vec![
            (401, r#"{"detail":"token expired"}"#),
            (200, r#"{"access":"access-2","refresh":"refresh-2"}"#),
            (200, r#"{"id":7,"status":"delivered"}"#),
        ])
        .await;

        let credentials = CredentialStore::new(Arc::new(MemoryStore::new()));
        credentials.save(&TokenPair::new("access-1", "refresh-1")).unwrap();
        let client = BackendClient::new(
            BackendConfig {
                api_base,
                ..BackendConfig::default()
            },
            credentials.clone(),
        )
        .unwrap();

        let response = client
            .put("deliveries/7", &json!({"status": "delivered"}))
            .await
            .unwrap();

        assert!(response.is_success());
        assert_eq!(response.data, json!({"id": 7, "status": "delivered"}));
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                "PUT /v1/deliveries/7/ HTTP/1.1 | Bearer access-1".to_string(),
                "POST /v1/auth/refresh-token/ HTTP/1.1 | Bearer refresh-1".to_string(),
                "PUT /v1/deliveries/7/ HTTP/1.1 | Bearer access-2".to_string(),
            ]
        );
        assert_eq!(
            credentials.load().unwrap(),
            Some(TokenPair::new("access-2", "refresh-2"))
        );
    }
}
