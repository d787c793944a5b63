use std::{collections::HashMap, fs};

use anyhow::{bail, Context};
use serde::Deserialize;
use url::Url;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub api_url: String,
    pub socket_url: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_url: "http://127.0.0.1:8443".into(),
            socket_url: None,
        }
    }
}

impl Settings {
    /// Explicit socket URL when configured, otherwise derived from the API
    /// URL by scheme mapping.
    pub fn socket_url(&self) -> anyhow::Result<Url> {
        match &self.socket_url {
            Some(raw) => Url::parse(raw).with_context(|| format!("invalid socket url '{raw}'")),
            None => derive_socket_url(&self.api_url),
        }
    }
}

pub fn load_settings() -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string("client.toml") {
        if let Ok(file_cfg) = toml::from_str::<HashMap<String, String>>(&raw) {
            if let Some(v) = file_cfg.get("api_url") {
                settings.api_url = v.clone();
            }
            if let Some(v) = file_cfg.get("socket_url") {
                settings.socket_url = Some(v.clone());
            }
        }
    }

    if let Ok(v) = std::env::var("MARKET_API_URL") {
        settings.api_url = v;
    }
    if let Ok(v) = std::env::var("APP__API_URL") {
        settings.api_url = v;
    }

    if let Ok(v) = std::env::var("MARKET_SOCKET_URL") {
        settings.socket_url = Some(v);
    }
    if let Ok(v) = std::env::var("APP__SOCKET_URL") {
        settings.socket_url = Some(v);
    }

    settings
}

/// Maps `http(s)` to `ws(s)` on the API origin and appends the notification
/// endpoint path.
pub fn derive_socket_url(api_url: &str) -> anyhow::Result<Url> {
    let mapped = if let Some(rest) = api_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = api_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        bail!("api_url must start with http:// or https://, got '{api_url}'");
    };

    let endpoint = format!("{}/ws", mapped.trim_end_matches('/'));
    Url::parse(&endpoint).with_context(|| format!("derived socket url '{endpoint}' is invalid"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_ws_url_from_http_api_url() {
        let url = derive_socket_url("http://127.0.0.1:8443").expect("derive");
        assert_eq!(url.as_str(), "ws://127.0.0.1:8443/ws");
    }

    #[test]
    fn derives_wss_url_from_https_api_url_with_trailing_slash() {
        let url = derive_socket_url("https://market.example.com/").expect("derive");
        assert_eq!(url.as_str(), "wss://market.example.com/ws");
    }

    #[test]
    fn rejects_api_url_without_http_scheme() {
        assert!(derive_socket_url("ftp://market.example.com").is_err());
    }

    #[test]
    fn explicit_socket_url_wins_over_derivation() {
        let settings = Settings {
            api_url: "http://127.0.0.1:8443".into(),
            socket_url: Some("ws://push.example.com/notifications".into()),
        };
        assert_eq!(
            settings.socket_url().expect("socket url").as_str(),
            "ws://push.example.com/notifications"
        );
    }
}
