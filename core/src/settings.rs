use serde::Serialize;

pub const BASE_URL_ENV: &str = "MAGIC_API_BASE_URL";
pub const WS_URL_ENV: &str = "MAGIC_API_WS_URL";
pub const AUTH_ENABLED_ENV: &str = "MAGIC_API_AUTH_ENABLED";
pub const USERNAME_ENV: &str = "MAGIC_API_USERNAME";
pub const PASSWORD_ENV: &str = "MAGIC_API_PASSWORD";
pub const TIMEOUT_SECONDS_ENV: &str = "MAGIC_API_TIMEOUT_SECONDS";
pub const LOG_LEVEL_ENV: &str = "MAGIC_API_LOG_LEVEL";
pub const TRANSPORT_ENV: &str = "MAGIC_API_TRANSPORT";
pub const HTTP_HOST_ENV: &str = "MAGIC_API_HTTP_HOST";
pub const HTTP_PORT_ENV: &str = "MAGIC_API_HTTP_PORT";

const DEFAULT_BASE_URL: &str = "http://127.0.0.1:10712";
const DEFAULT_WS_URL: &str = "ws://127.0.0.1:10712/console";
const DEFAULT_USERNAME: &str = "admin";
const DEFAULT_PASSWORD: &str = "123456";
const DEFAULT_TIMEOUT_SECONDS: u64 = 30;
const TIMEOUT_SECONDS_MIN: u64 = 1;
const TIMEOUT_SECONDS_MAX: u64 = 300;
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_HTTP_HOST: &str = "127.0.0.1";
const DEFAULT_HTTP_PORT: u16 = 8000;

/// How the MCP surface itself is carried. Pass-through choice with no
/// bearing on tool semantics.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Stdio,
    Http,
}

impl Transport {
    pub fn as_str(self) -> &'static str {
        match self {
            Transport::Stdio => "stdio",
            Transport::Http => "http",
        }
    }
}

/// Connection profile for one Magic-API service. Constructed once at
/// startup from the environment and immutable thereafter. No component
/// reads environment variables at call sites.
#[derive(Clone, Debug)]
pub struct MagicApiSettings {
    pub base_url: String,
    pub ws_url: String,
    pub auth_enabled: bool,
    pub username: String,
    pub password: String,
    pub timeout_seconds: u64,
    pub log_level: String,
    pub transport: Transport,
    pub http_host: String,
    pub http_port: u16,
}

impl Default for MagicApiSettings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            ws_url: DEFAULT_WS_URL.to_string(),
            auth_enabled: false,
            username: DEFAULT_USERNAME.to_string(),
            password: DEFAULT_PASSWORD.to_string(),
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            transport: Transport::Stdio,
            http_host: DEFAULT_HTTP_HOST.to_string(),
            http_port: DEFAULT_HTTP_PORT,
        }
    }
}

impl MagicApiSettings {
    pub fn from_env() -> Self {
        Self::from_raw(RawSettings {
            base_url: std::env::var(BASE_URL_ENV).ok(),
            ws_url: std::env::var(WS_URL_ENV).ok(),
            auth_enabled: std::env::var(AUTH_ENABLED_ENV).ok(),
            username: std::env::var(USERNAME_ENV).ok(),
            password: std::env::var(PASSWORD_ENV).ok(),
            timeout_seconds: std::env::var(TIMEOUT_SECONDS_ENV).ok(),
            log_level: std::env::var(LOG_LEVEL_ENV).ok(),
            transport: std::env::var(TRANSPORT_ENV).ok(),
            http_host: std::env::var(HTTP_HOST_ENV).ok(),
            http_port: std::env::var(HTTP_PORT_ENV).ok(),
        })
    }

    fn from_raw(raw: RawSettings) -> Self {
        let defaults = Self::default();
        let base_url = raw
            .base_url
            .map(|value| value.trim().trim_end_matches('/').to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or(defaults.base_url);
        // Console endpoint follows the base URL unless set explicitly.
        let ws_url = raw
            .ws_url
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| derive_ws_url(&base_url));
        Self {
            ws_url,
            auth_enabled: parse_bool_flag(raw.auth_enabled, false),
            username: raw.username.unwrap_or(defaults.username),
            password: raw.password.unwrap_or(defaults.password),
            timeout_seconds: parse_u64_with_bounds(
                raw.timeout_seconds,
                TIMEOUT_SECONDS_MIN,
                TIMEOUT_SECONDS_MAX,
                defaults.timeout_seconds,
            ),
            log_level: raw.log_level.unwrap_or(defaults.log_level),
            transport: parse_transport(raw.transport),
            http_host: raw.http_host.unwrap_or(defaults.http_host),
            http_port: raw
                .http_port
                .and_then(|value| value.trim().parse::<u16>().ok())
                .unwrap_or(defaults.http_port),
            base_url,
        }
    }
}

struct RawSettings {
    base_url: Option<String>,
    ws_url: Option<String>,
    auth_enabled: Option<String>,
    username: Option<String>,
    password: Option<String>,
    timeout_seconds: Option<String>,
    log_level: Option<String>,
    transport: Option<String>,
    http_host: Option<String>,
    http_port: Option<String>,
}

fn parse_bool_flag(raw: Option<String>, default: bool) -> bool {
    match raw {
        Some(value) => matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        None => default,
    }
}

fn parse_u64_with_bounds(raw: Option<String>, min: u64, max: u64, default: u64) -> u64 {
    match raw.and_then(|value| value.trim().parse::<u64>().ok()) {
        Some(parsed) => parsed.clamp(min, max),
        None => default,
    }
}

fn parse_transport(raw: Option<String>) -> Transport {
    match raw.as_deref().map(str::trim) {
        Some(value) if value.eq_ignore_ascii_case("http") => Transport::Http,
        _ => Transport::Stdio,
    }
}

fn derive_ws_url(base_url: &str) -> String {
    let ws_base = if let Some(rest) = base_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        format!("ws://{base_url}")
    };
    format!("{}/console", ws_base.trim_end_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_defaults() -> RawSettings {
        RawSettings {
            base_url: None,
            ws_url: None,
            auth_enabled: None,
            username: None,
            password: None,
            timeout_seconds: None,
            log_level: None,
            transport: None,
            http_host: None,
            http_port: None,
        }
    }

    #[test]
    fn defaults_match_local_service() {
        let settings = MagicApiSettings::from_raw(raw_defaults());
        assert_eq!(settings.base_url, "http://127.0.0.1:10712");
        assert_eq!(settings.ws_url, "ws://127.0.0.1:10712/console");
        assert!(!settings.auth_enabled);
        assert_eq!(settings.timeout_seconds, 30);
        assert_eq!(settings.transport, Transport::Stdio);
    }

    #[test]
    fn ws_url_follows_overridden_base_url() {
        let settings = MagicApiSettings::from_raw(RawSettings {
            base_url: Some("https://magic.example.com/".to_string()),
            ..raw_defaults()
        });
        assert_eq!(settings.base_url, "https://magic.example.com");
        assert_eq!(settings.ws_url, "wss://magic.example.com/console");
    }

    #[test]
    fn explicit_ws_url_wins_over_derivation() {
        let settings = MagicApiSettings::from_raw(RawSettings {
            base_url: Some("http://10.0.0.5:10712".to_string()),
            ws_url: Some("ws://10.0.0.6:10712/console".to_string()),
            ..raw_defaults()
        });
        assert_eq!(settings.ws_url, "ws://10.0.0.6:10712/console");
    }

    #[test]
    fn auth_flag_accepts_common_truthy_spellings() {
        for value in ["1", "true", "Yes", "ON"] {
            assert!(parse_bool_flag(Some(value.to_string()), false), "{value}");
        }
        assert!(!parse_bool_flag(Some("0".to_string()), true));
        assert!(parse_bool_flag(None, true));
    }

    #[test]
    fn timeout_is_clamped_to_bounds() {
        let settings = MagicApiSettings::from_raw(RawSettings {
            timeout_seconds: Some("0".to_string()),
            ..raw_defaults()
        });
        assert_eq!(settings.timeout_seconds, 1);

        let settings = MagicApiSettings::from_raw(RawSettings {
            timeout_seconds: Some("9000".to_string()),
            ..raw_defaults()
        });
        assert_eq!(settings.timeout_seconds, 300);

        let settings = MagicApiSettings::from_raw(RawSettings {
            timeout_seconds: Some("not-a-number".to_string()),
            ..raw_defaults()
        });
        assert_eq!(settings.timeout_seconds, 30);
    }

    #[test]
    fn transport_parses_http_and_falls_back_to_stdio() {
        assert_eq!(parse_transport(Some("http".to_string())), Transport::Http);
        assert_eq!(parse_transport(Some("HTTP".to_string())), Transport::Http);
        assert_eq!(parse_transport(Some("sse".to_string())), Transport::Stdio);
        assert_eq!(parse_transport(None), Transport::Stdio);
    }
}
