/// Configuration management
use crate::error::{ChatError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_API_URL: &str = "http://localhost:5000/api";
const DEFAULT_PAGE_SIZE: u32 = 50;

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Base URL of the persistence API (e.g. `http://localhost:5000/api`)
    pub api_base_url: String,

    /// Push channel URL; derived from `api_base_url` when unset
    pub socket_url: Option<String>,

    /// History page size sent as `limit`
    pub page_size: u32,

    /// How long a typing indicator stays on without a refresh
    pub typing_timeout: Duration,

    /// Per-request timeout for persistence calls
    pub request_timeout: Duration,

    /// Timeout for opening the push channel
    pub connect_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_URL.to_string(),
            socket_url: None,
            page_size: DEFAULT_PAGE_SIZE,
            typing_timeout: Duration::from_secs(3),
            request_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl ClientConfig {
    /// Create config from command line arguments
    pub fn from_args(args: &[String]) -> Result<Self> {
        let mut config = Self::default();

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--socket-url" => {
                    let url = args.get(i + 1).ok_or_else(|| {
                        ChatError::Config("--socket-url requires a URL argument".to_string())
                    })?;
                    config.socket_url = Some(url.clone());
                    i += 2;
                }
                "--page-size" => {
                    let n = args.get(i + 1).ok_or_else(|| {
                        ChatError::Config("--page-size requires a number".to_string())
                    })?;
                    config.page_size = parse_page_size(n)?;
                    i += 2;
                }
                "--typing-timeout-ms" => {
                    config.typing_timeout = parse_millis(args.get(i + 1), "--typing-timeout-ms")?;
                    i += 2;
                }
                "--request-timeout-ms" => {
                    config.request_timeout =
                        parse_millis(args.get(i + 1), "--request-timeout-ms")?;
                    i += 2;
                }
                flag if flag.starts_with("--") => {
                    return Err(ChatError::Config(format!("Unknown flag: {}", flag)));
                }
                url => {
                    config.api_base_url = url.trim_end_matches('/').to_string();
                    i += 1;
                }
            }
        }

        // Env overrides (nice for scripts)
        if let Ok(url) = std::env::var("CHATSYNC_API_URL") {
            config.api_base_url = url.trim_end_matches('/').to_string();
        }
        if let Ok(url) = std::env::var("CHATSYNC_SOCKET_URL") {
            config.socket_url = Some(url);
        }
        if let Ok(n) = std::env::var("CHATSYNC_PAGE_SIZE") {
            config.page_size = parse_page_size(&n)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject URLs the HTTP and WebSocket clients cannot use
    pub fn validate(&self) -> Result<()> {
        if !(self.api_base_url.starts_with("http://") || self.api_base_url.starts_with("https://"))
        {
            return Err(ChatError::Config(format!(
                "API URL must be http(s): {}",
                self.api_base_url
            )));
        }
        let socket = self.socket_url();
        if !(socket.starts_with("ws://") || socket.starts_with("wss://")) {
            return Err(ChatError::Config(format!(
                "Socket URL must be ws(s): {}",
                socket
            )));
        }
        if self.page_size == 0 {
            return Err(ChatError::Config("Page size must be positive".to_string()));
        }
        Ok(())
    }

    /// Push channel URL. Defaults to the API origin with a ws(s) scheme.
    pub fn socket_url(&self) -> String {
        if let Some(url) = &self.socket_url {
            return url.clone();
        }
        let origin = self
            .api_base_url
            .trim_end_matches('/')
            .trim_end_matches("/api");
        if let Some(rest) = origin.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = origin.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            origin.to_string()
        }
    }
}

fn parse_page_size(s: &str) -> Result<u32> {
    s.parse::<u32>()
        .map_err(|_| ChatError::Config("Page size must be a valid number".to_string()))
}

fn parse_millis(arg: Option<&String>, flag: &str) -> Result<Duration> {
    let s = arg.ok_or_else(|| ChatError::Config(format!("{} requires a number", flag)))?;
    let ms = s
        .parse::<u64>()
        .map_err(|_| ChatError::Config(format!("{} must be a valid number", flag)))?;
    Ok(Duration::from_millis(ms))
}
