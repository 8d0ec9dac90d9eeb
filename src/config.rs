//! Session configuration: the options recognized when creating a stream session. This is the shape a REST control
//! plane collaborator deserializes a `create` request body into.

use std::collections::HashMap;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::manifest::normalize_kid;

fn default_mp4decrypt_path() -> String {
    "mp4decrypt".to_string()
}

fn default_poll_interval() -> f64 {
    4.0
}

fn default_window_size() -> usize {
    6
}

fn default_history_size() -> usize {
    128
}

fn default_http_timeout_seconds() -> f64 {
    15.0
}

/// Options recognized when creating a stream session.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    pub mpd_url: String,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub kid: Option<String>,
    #[serde(default)]
    pub key_map: HashMap<String, String>,
    #[serde(default = "default_mp4decrypt_path")]
    pub mp4decrypt_path: String,
    #[serde(default)]
    pub representation_id: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default = "default_poll_interval")]
    pub poll_interval: f64,
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    #[serde(default = "default_history_size")]
    pub history_size: usize,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub output_dir: Option<std::path::PathBuf>,
    /// Per-request HTTP timeout in seconds, configurable per stream.
    #[serde(default = "default_http_timeout_seconds")]
    pub http_timeout_seconds: f64,
}

impl SessionConfig {
    /// Validates hex lengths and folds `key`/`kid` into `key_map`, producing the single map the
    /// rest of the pipeline consumes. `key_map` may have one entry (the common case, from
    /// `key`+`kid`) or several (from `key_map` directly).
    pub fn resolved_key_map(&self) -> Result<HashMap<String, String>, ConfigError> {
        let mut map = HashMap::new();
        for (kid, key) in &self.key_map {
            validate_hex32("key_map key", kid)?;
            validate_hex32("key_map value", key)?;
            map.insert(normalize_kid(kid), key.to_lowercase());
        }
        if let Some(key) = &self.key {
            validate_hex32("key", key)?;
            let kid = match &self.kid {
                Some(kid) => {
                    validate_hex32("kid", kid)?;
                    normalize_kid(kid)
                }
                None => String::new(), // filled in from manifest ContentProtection once parsed
            };
            map.insert(kid, key.to_lowercase());
        }
        Ok(map)
    }
}

fn validate_hex32(field: &'static str, s: &str) -> Result<(), ConfigError> {
    let hex_len = s.chars().filter(|c| c.is_ascii_hexdigit()).count();
    if hex_len != 32 {
        return Err(ConfigError::InvalidKeyLength {
            field,
            len: hex_len,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> SessionConfig {
        SessionConfig {
            mpd_url: "https://example.com/manifest.mpd".to_string(),
            key: None,
            kid: None,
            key_map: HashMap::new(),
            mp4decrypt_path: default_mp4decrypt_path(),
            representation_id: None,
            label: None,
            poll_interval: default_poll_interval(),
            window_size: default_window_size(),
            history_size: default_history_size(),
            headers: HashMap::new(),
            output_dir: None,
            http_timeout_seconds: default_http_timeout_seconds(),
        }
    }

    #[test]
    fn single_key_and_kid() {
        let mut cfg = base_config();
        cfg.key = Some("00112233445566778899aabbccddeeff".to_string());
        cfg.kid = Some("11223344-5566-7788-99aa-bbccddeeff00".to_string());
        let map = cfg.resolved_key_map().unwrap();
        assert_eq!(map.len(), 1);
        assert!(map.contains_key("112233445566778899aabbccddeeff00"));
    }

    #[test]
    fn rejects_short_hex() {
        let mut cfg = base_config();
        cfg.key = Some("deadbeef".to_string());
        cfg.kid = Some("112233445566778899aabbccddeeff00".to_string());
        let err = cfg.resolved_key_map().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidKeyLength { .. }));
    }
}
