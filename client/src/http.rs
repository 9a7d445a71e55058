use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::Method;
use serde_json::{Value, json};
use tokio::sync::Mutex;
use uuid::Uuid;

use magicapi_core::error::codes;
use magicapi_core::settings::MagicApiSettings;

/// Session token header issued by the login endpoint and echoed on every
/// authenticated request.
pub const TOKEN_HEADER: &str = "magic-token";
/// Caller-identification header; correlates API calls with console sessions.
pub const CLIENT_ID_HEADER: &str = "X-MAGIC-CLIENT-ID";

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("authentication failed: {message}")]
    Auth { message: String },
    #[error("failed to reach Magic-API at {url}: {message}")]
    Network { url: String, message: String },
    #[error("invalid URL or path: {0}")]
    InvalidUrl(String),
    #[error("failed to read response body: {0}")]
    Response(String),
    #[error("service returned code {code}: {message}")]
    Upstream { code: i64, message: String },
}

impl ClientError {
    /// Error-envelope code for this failure; tools pass it through verbatim.
    pub fn code(&self) -> &'static str {
        match self {
            ClientError::Auth { .. } => codes::AUTH_ERROR,
            ClientError::Network { .. } => codes::NETWORK_ERROR,
            ClientError::InvalidUrl(_) => codes::VALIDATION_ERROR,
            ClientError::Response(_) | ClientError::Upstream { .. } => codes::INTERNAL_ERROR,
        }
    }
}

/// Short-lived authenticated state for the service. Rebuilt on expiry,
/// never patched in place.
#[derive(Clone, Debug)]
pub struct Session {
    pub token: String,
}

/// One HTTP round trip, body parsed as JSON with a string fallback.
#[derive(Clone, Debug)]
pub struct ApiResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Value,
}

impl ApiResponse {
    pub fn is_success(&self) -> bool {
        (200..=299).contains(&self.status)
    }

    pub fn to_value(&self) -> Value {
        json!({
            "status": self.status,
            "headers": self.headers,
            "body": self.body,
        })
    }

    /// Unwrap the service envelope `{code, message, data}`; `code == 1`
    /// is success.
    pub fn envelope_data(&self) -> Result<Value, ClientError> {
        let code = self.body.get("code").and_then(Value::as_i64).unwrap_or(-1);
        if self.is_success() && code == 1 {
            return Ok(self.body.get("data").cloned().unwrap_or(Value::Null));
        }
        let message = self
            .body
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unexpected service response")
            .to_string();
        Err(ClientError::Upstream { code, message })
    }
}

/// Authenticated HTTP client for one Magic-API service. Owns the session
/// exclusively; callers never see tokens or re-login handling.
pub struct HttpClient {
    settings: MagicApiSettings,
    http: reqwest::Client,
    session: Mutex<Option<Session>>,
    client_id: String,
}

impl HttpClient {
    pub fn new(settings: MagicApiSettings) -> Self {
        Self {
            http: reqwest::Client::new(),
            session: Mutex::new(None),
            client_id: format!("magicapi-mcp-{}", Uuid::now_v7()),
            settings,
        }
    }

    pub fn settings(&self) -> &MagicApiSettings {
        &self.settings
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub async fn session_token(&self) -> Option<String> {
        self.session
            .lock()
            .await
            .as_ref()
            .map(|session| session.token.clone())
    }

    /// Log in and store a fresh session. No-op when auth is disabled.
    pub async fn authenticate(&self) -> Result<(), ClientError> {
        if !self.settings.auth_enabled {
            return Ok(());
        }
        let session = self.login().await?;
        tracing::debug!(client_id = %self.client_id, "session established");
        *self.session.lock().await = Some(session);
        Ok(())
    }

    async fn login(&self) -> Result<Session, ClientError> {
        let url = self.build_url("/login", &[])?;
        let response = self
            .http
            .post(url.clone())
            .timeout(self.timeout())
            .form(&[
                ("username", self.settings.username.as_str()),
                ("password", self.settings.password.as_str()),
            ])
            .send()
            .await
            .map_err(|e| ClientError::Network {
                url: url.to_string(),
                message: e.to_string(),
            })?;

        let status = response.status();
        // The token rides on a response header, not in the body.
        let token = response
            .headers()
            .get(TOKEN_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let body: Value = response.json().await.unwrap_or(Value::Null);
        let code = body.get("code").and_then(Value::as_i64);

        if !status.is_success() || code != Some(1) {
            let message = body
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("credentials rejected")
                .to_string();
            return Err(ClientError::Auth {
                message: format!("login returned status {status}: {message}"),
            });
        }
        let Some(token) = token else {
            return Err(ClientError::Auth {
                message: format!("login response missing {TOKEN_HEADER} header"),
            });
        };
        Ok(Session { token })
    }

    /// Issue one request with auth injection. On a 401 the session is
    /// discarded and rebuilt exactly once; a second 401 fails with an
    /// auth error. Transient network retries are the caller's concern.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        query: &[(String, String)],
        body: Option<&Value>,
        extra_headers: &[(String, String)],
    ) -> Result<ApiResponse, ClientError> {
        if self.settings.auth_enabled && self.session.lock().await.is_none() {
            self.authenticate().await?;
        }

        let first = self
            .send_once(method.clone(), path, query, body, extra_headers)
            .await?;
        if first.status != 401 || !self.settings.auth_enabled {
            return Ok(first);
        }

        tracing::debug!(%path, "session rejected, re-authenticating once");
        *self.session.lock().await = None;
        self.authenticate().await?;

        let second = self.send_once(method, path, query, body, extra_headers).await?;
        if second.status == 401 {
            return Err(ClientError::Auth {
                message: format!("session rejected twice for {path}"),
            });
        }
        Ok(second)
    }

    async fn send_once(
        &self,
        method: Method,
        path: &str,
        query: &[(String, String)],
        body: Option<&Value>,
        extra_headers: &[(String, String)],
    ) -> Result<ApiResponse, ClientError> {
        let url = self.build_url(path, query)?;

        let mut request = self
            .http
            .request(method, url.clone())
            .timeout(self.timeout())
            .header(CLIENT_ID_HEADER, self.client_id.as_str());
        if let Some(token) = self.session_token().await {
            request = request.header(TOKEN_HEADER, token);
        }
        for (key, value) in extra_headers {
            request = request.header(key.as_str(), value.as_str());
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|e| ClientError::Network {
            url: url.to_string(),
            message: e.to_string(),
        })?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(key, value)| {
                (
                    key.to_string(),
                    value.to_str().unwrap_or("<binary>").to_string(),
                )
            })
            .collect::<BTreeMap<_, _>>();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ClientError::Response(e.to_string()))?;

        Ok(ApiResponse {
            status,
            headers,
            body: parse_response_body(&bytes),
        })
    }

    fn build_url(&self, path: &str, query: &[(String, String)]) -> Result<url::Url, ClientError> {
        let path = normalize_path(path)?;
        let mut url = url::Url::parse(&format!(
            "{}{}",
            self.settings.base_url.trim_end_matches('/'),
            path
        ))
        .map_err(|e| ClientError::InvalidUrl(format!("{path}: {e}")))?;
        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in query {
                pairs.append_pair(key, value);
            }
        }
        Ok(url)
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.settings.timeout_seconds)
    }
}

pub(crate) fn normalize_path(path: &str) -> Result<String, ClientError> {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return Err(ClientError::InvalidUrl("path must not be empty".to_string()));
    }
    if trimmed.contains(char::is_whitespace) {
        return Err(ClientError::InvalidUrl(format!(
            "path must not contain whitespace: {trimmed}"
        )));
    }
    if trimmed.starts_with('/') {
        Ok(trimmed.to_string())
    } else {
        Ok(format!("/{trimmed}"))
    }
}

fn parse_response_body(bytes: &[u8]) -> Value {
    if bytes.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn settings_for(server_uri: String, auth_enabled: bool) -> MagicApiSettings {
        MagicApiSettings {
            base_url: server_uri,
            auth_enabled,
            username: "admin".to_string(),
            password: "123456".to_string(),
            ..MagicApiSettings::default()
        }
    }

    async fn mount_login(server: &MockServer, token: &str) {
        Mock::given(method("POST"))
            .and(path("/login"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header(TOKEN_HEADER, token)
                    .set_body_json(serde_json::json!({"code": 1, "message": "success"})),
            )
            .mount(server)
            .await;
    }

    async fn login_request_count(server: &MockServer) -> usize {
        server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .filter(|request| request.url.path() == "/login")
            .count()
    }

    #[test]
    fn normalize_path_adds_leading_slash() {
        assert_eq!(normalize_path("resource").unwrap(), "/resource");
        assert_eq!(normalize_path("/resource").unwrap(), "/resource");
        assert!(normalize_path("  ").is_err());
        assert!(normalize_path("/a b").is_err());
    }

    #[test]
    fn response_body_falls_back_to_text() {
        assert_eq!(parse_response_body(b""), Value::Null);
        assert_eq!(
            parse_response_body(b"{\"ok\":true}"),
            serde_json::json!({"ok": true})
        );
        assert_eq!(
            parse_response_body(b"plain text"),
            Value::String("plain text".to_string())
        );
    }

    #[test]
    fn envelope_data_requires_code_one() {
        let ok = ApiResponse {
            status: 200,
            headers: BTreeMap::new(),
            body: serde_json::json!({"code": 1, "message": "success", "data": [1, 2]}),
        };
        assert_eq!(ok.envelope_data().unwrap(), serde_json::json!([1, 2]));

        let rejected = ApiResponse {
            status: 200,
            headers: BTreeMap::new(),
            body: serde_json::json!({"code": 0, "message": "permission denied"}),
        };
        let err = rejected.envelope_data().expect_err("code 0 must fail");
        assert_eq!(err.code(), codes::INTERNAL_ERROR);
    }

    #[tokio::test]
    async fn login_extracts_token_from_response_header() {
        let server = MockServer::start().await;
        mount_login(&server, "test-token-123").await;

        let client = HttpClient::new(settings_for(server.uri(), true));
        client.authenticate().await.expect("login should succeed");
        assert_eq!(
            client.session_token().await.as_deref(),
            Some("test-token-123")
        );
    }

    #[tokio::test]
    async fn login_rejection_is_auth_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/login"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"code": 0, "message": "bad credentials"})),
            )
            .mount(&server)
            .await;

        let client = HttpClient::new(settings_for(server.uri(), true));
        let err = client.authenticate().await.expect_err("login must fail");
        assert_eq!(err.code(), codes::AUTH_ERROR);
    }

    #[tokio::test]
    async fn request_reauthenticates_once_on_401() {
        let server = MockServer::start().await;
        mount_login(&server, "token-a").await;
        // First hit is rejected, the retry after re-login succeeds.
        Mock::given(method("GET"))
            .and(path("/resource"))
            .respond_with(ResponseTemplate::new(401))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/resource"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"code": 1, "data": {}})),
            )
            .mount(&server)
            .await;

        let client = HttpClient::new(settings_for(server.uri(), true));
        let response = client
            .request(Method::GET, "/resource", &[], None, &[])
            .await
            .expect("retried request should succeed");
        assert_eq!(response.status, 200);
        // One login for the initial session, one for the 401 recovery.
        assert_eq!(login_request_count(&server).await, 2);
    }

    #[tokio::test]
    async fn second_401_fails_with_auth_error_and_no_further_retries() {
        let server = MockServer::start().await;
        mount_login(&server, "token-a").await;
        Mock::given(method("GET"))
            .and(path("/resource"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let client = HttpClient::new(settings_for(server.uri(), true));
        let err = client
            .request(Method::GET, "/resource", &[], None, &[])
            .await
            .expect_err("persistent 401 must fail");
        assert_eq!(err.code(), codes::AUTH_ERROR);
        assert_eq!(login_request_count(&server).await, 2);
    }

    #[tokio::test]
    async fn call_passthrough_returns_status_headers_body_verbatim() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/order/create"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
            .mount(&server)
            .await;

        let client = HttpClient::new(settings_for(server.uri(), false));
        let response = client
            .request(
                Method::POST,
                "/order/create",
                &[],
                Some(&serde_json::json!({"id": 1})),
                &[],
            )
            .await
            .expect("request should succeed");
        assert_eq!(response.status, 200);
        assert_eq!(response.body, serde_json::json!({"ok": true}));
        assert!(response.headers.contains_key("content-type"));
    }

    #[tokio::test]
    async fn unreachable_service_is_network_error() {
        let client = HttpClient::new(settings_for("http://127.0.0.1:9".to_string(), false));
        let err = client
            .request(Method::GET, "/resource", &[], None, &[])
            .await
            .expect_err("nothing listens on port 9");
        assert_eq!(err.code(), codes::NETWORK_ERROR);
    }
}
