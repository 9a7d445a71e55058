//! Console client for the service's WebSocket log channel.
//!
//! The console speaks a line protocol of `TYPE[,content]` messages. The
//! connection answers `PING` heartbeats inline and surfaces everything else
//! as [`ConsoleEvent`]s. There is no automatic reconnect loop: a closed
//! connection yields [`ConsoleEvent::Closed`] and callers reconnect
//! explicitly; [`ConsoleClient::connect_with_retry`] is the bounded helper
//! for callers that want one.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use magicapi_core::settings::MagicApiSettings;

use crate::http::ClientError;

/// Placeholder login name when the service runs without authentication.
const ANONYMOUS_USER: &str = "unauthorization";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConsoleEvent {
    /// Single log line streamed from the service.
    Log(String),
    /// Batched log lines (JSON array payload).
    Logs(Vec<String>),
    LoginResponse(String),
    OnlineUsers(String),
    /// Message type this client does not interpret.
    Other { kind: String, content: String },
    /// The server closed the channel; reconnect is the caller's decision.
    Closed,
}

pub struct ConsoleClient {
    ws_url: String,
    username: Option<String>,
    client_id: String,
}

impl ConsoleClient {
    pub fn new(settings: &MagicApiSettings, client_id: impl Into<String>) -> Self {
        Self {
            ws_url: settings.ws_url.clone(),
            username: settings
                .auth_enabled
                .then(|| settings.username.clone()),
            client_id: client_id.into(),
        }
    }

    pub async fn connect(&self) -> Result<ConsoleConnection, ClientError> {
        let (stream, _) = connect_async(self.ws_url.as_str())
            .await
            .map_err(|e| ClientError::Network {
                url: self.ws_url.clone(),
                message: e.to_string(),
            })?;
        let mut connection = ConsoleConnection {
            stream,
            ws_url: self.ws_url.clone(),
        };
        connection
            .send_text(login_message(self.username.as_deref(), &self.client_id))
            .await?;
        tracing::debug!(url = %self.ws_url, client_id = %self.client_id, "console attached");
        Ok(connection)
    }

    /// Bounded reconnect for callers that opt in: up to `attempts` tries
    /// with linear backoff (`delay × attempt`) between them.
    pub async fn connect_with_retry(
        &self,
        attempts: u32,
        delay: Duration,
    ) -> Result<ConsoleConnection, ClientError> {
        let attempts = attempts.max(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            match self.connect().await {
                Ok(connection) => return Ok(connection),
                Err(error) => {
                    tracing::debug!(attempt, %error, "console connect failed");
                    last_error = Some(error);
                    if attempt < attempts {
                        tokio::time::sleep(delay * attempt).await;
                    }
                }
            }
        }
        Err(last_error.unwrap_or_else(|| ClientError::Network {
            url: self.ws_url.clone(),
            message: "console connect failed".to_string(),
        }))
    }
}

pub struct ConsoleConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    ws_url: String,
}

impl ConsoleConnection {
    /// Next console event. Heartbeats are answered here and never surfaced.
    pub async fn next_event(&mut self) -> Result<ConsoleEvent, ClientError> {
        loop {
            let Some(message) = self.stream.next().await else {
                return Ok(ConsoleEvent::Closed);
            };
            match message {
                Ok(Message::Text(text)) => match parse_console_message(&text) {
                    ParsedMessage::Ping => self.send_text("pong".to_string()).await?,
                    ParsedMessage::Event(event) => return Ok(event),
                },
                Ok(Message::Close(_)) => return Ok(ConsoleEvent::Closed),
                Ok(_) => {}
                Err(error) => {
                    return Err(ClientError::Network {
                        url: self.ws_url.clone(),
                        message: error.to_string(),
                    });
                }
            }
        }
    }

    pub async fn close(mut self) {
        let _ = self.stream.close(None).await;
    }

    async fn send_text(&mut self, text: String) -> Result<(), ClientError> {
        self.stream
            .send(Message::Text(text))
            .await
            .map_err(|e| ClientError::Network {
                url: self.ws_url.clone(),
                message: e.to_string(),
            })
    }
}

fn login_message(username: Option<&str>, client_id: &str) -> String {
    format!(
        "login,{},{}",
        username.unwrap_or(ANONYMOUS_USER),
        client_id
    )
}

enum ParsedMessage {
    Ping,
    Event(ConsoleEvent),
}

fn parse_console_message(raw: &str) -> ParsedMessage {
    let (kind, content) = raw.split_once(',').unwrap_or((raw, ""));
    match kind.to_ascii_uppercase().as_str() {
        "PING" => ParsedMessage::Ping,
        "LOG" => ParsedMessage::Event(ConsoleEvent::Log(content.to_string())),
        "LOGS" => {
            // Batched form carries a JSON array; fall back to one raw line.
            let lines = serde_json::from_str::<Vec<String>>(content)
                .unwrap_or_else(|_| vec![content.to_string()]);
            ParsedMessage::Event(ConsoleEvent::Logs(lines))
        }
        "LOGIN_RESPONSE" => ParsedMessage::Event(ConsoleEvent::LoginResponse(content.to_string())),
        "ONLINE_USERS" => ParsedMessage::Event(ConsoleEvent::OnlineUsers(content.to_string())),
        other => ParsedMessage::Event(ConsoleEvent::Other {
            kind: other.to_string(),
            content: content.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parsed_event(raw: &str) -> ConsoleEvent {
        match parse_console_message(raw) {
            ParsedMessage::Event(event) => event,
            ParsedMessage::Ping => panic!("unexpected ping for {raw}"),
        }
    }

    #[test]
    fn login_message_uses_anonymous_placeholder_without_auth() {
        assert_eq!(
            login_message(None, "client-1"),
            "login,unauthorization,client-1"
        );
        assert_eq!(login_message(Some("admin"), "client-1"), "login,admin,client-1");
    }

    #[test]
    fn log_messages_split_on_first_comma_only() {
        assert_eq!(
            parsed_event("LOG,select took 3ms, 2 rows"),
            ConsoleEvent::Log("select took 3ms, 2 rows".to_string())
        );
    }

    #[test]
    fn batched_logs_parse_json_array_with_fallback() {
        assert_eq!(
            parsed_event("LOGS,[\"a\",\"b\"]"),
            ConsoleEvent::Logs(vec!["a".to_string(), "b".to_string()])
        );
        assert_eq!(
            parsed_event("LOGS,not-json"),
            ConsoleEvent::Logs(vec!["not-json".to_string()])
        );
    }

    #[test]
    fn ping_is_answered_not_surfaced() {
        assert!(matches!(parse_console_message("PING"), ParsedMessage::Ping));
    }

    #[test]
    fn unknown_types_are_preserved() {
        assert_eq!(
            parsed_event("BREAKPOINT,file-1"),
            ConsoleEvent::Other {
                kind: "BREAKPOINT".to_string(),
                content: "file-1".to_string()
            }
        );
    }
}
