use instantly_core::profile::BudgetOverrides;
use serde::{Deserialize, Serialize};

use crate::DEFAULT_API_URL;

pub const API_KEY_ENV: &str = "INSTANTLY_API_KEY";
pub const MAX_PAGES_ENV: &str = "INSTANTLY_MCP_MAX_PAGES";
pub const SOFT_TIMEOUT_MS_ENV: &str = "INSTANTLY_MCP_SOFT_TIMEOUT_MS";

const MAX_PAGES_OVERRIDE_MIN: u64 = 1;
const MAX_PAGES_OVERRIDE_MAX: u64 = 500;
const SOFT_TIMEOUT_OVERRIDE_MIN_MS: u64 = 1_000;
const SOFT_TIMEOUT_OVERRIDE_MAX_MS: u64 = 600_000;

#[derive(Debug, Serialize, Deserialize)]
pub struct StoredCredentials {
    pub api_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,
}

pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .user_agent(concat!("instantly-mcp/", env!("CARGO_PKG_VERSION")))
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

pub fn config_path() -> std::path::PathBuf {
    let config_dir = dirs::config_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join("instantly-mcp");
    config_dir.join("config.json")
}

pub fn load_credentials() -> Option<StoredCredentials> {
    let path = config_path();
    let data = std::fs::read_to_string(&path).ok()?;
    serde_json::from_str(&data).ok()
}

/// Explicit key (flag or `INSTANTLY_API_KEY`) first, then the config file.
pub fn resolve_api_key(explicit: Option<&str>) -> Option<String> {
    explicit
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .map(str::to_string)
        .or_else(|| {
            load_credentials()
                .map(|creds| creds.api_key.trim().to_string())
                .filter(|key| !key.is_empty())
        })
}

/// Explicit URL (flag or `INSTANTLY_API_URL`), then the config file, then
/// the public API.
pub fn resolve_api_url(explicit: Option<&str>) -> String {
    api_url_from(explicit, load_credentials())
}

fn api_url_from(explicit: Option<&str>, stored: Option<StoredCredentials>) -> String {
    let non_empty = |url: &str| {
        let url = url.trim().trim_end_matches('/');
        (!url.is_empty()).then(|| url.to_string())
    };
    explicit
        .and_then(non_empty)
        .or_else(|| stored.and_then(|creds| creds.api_url.as_deref().and_then(non_empty)))
        .unwrap_or_else(|| DEFAULT_API_URL.to_string())
}

/// Parses and clamps a numeric env value. Unparseable values are ignored.
pub fn parse_env_u64_with_bounds(raw: Option<String>, min: u64, max: u64) -> Option<u64> {
    raw.and_then(|value| value.trim().parse::<u64>().ok())
        .map(|parsed| parsed.clamp(min, max))
}

pub fn budget_overrides_from_raw(
    max_pages: Option<String>,
    soft_timeout_ms: Option<String>,
) -> BudgetOverrides {
    BudgetOverrides {
        max_pages: parse_env_u64_with_bounds(
            max_pages,
            MAX_PAGES_OVERRIDE_MIN,
            MAX_PAGES_OVERRIDE_MAX,
        )
        .map(|pages| pages as u32),
        soft_timeout_ms: parse_env_u64_with_bounds(
            soft_timeout_ms,
            SOFT_TIMEOUT_OVERRIDE_MIN_MS,
            SOFT_TIMEOUT_OVERRIDE_MAX_MS,
        ),
    }
}

pub fn budget_overrides_from_env() -> BudgetOverrides {
    budget_overrides_from_raw(
        std::env::var(MAX_PAGES_ENV).ok(),
        std::env::var(SOFT_TIMEOUT_MS_ENV).ok(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounded_env_values_are_clamped() {
        assert_eq!(parse_env_u64_with_bounds(Some("0".into()), 1, 500), Some(1));
        assert_eq!(parse_env_u64_with_bounds(Some(" 42 ".into()), 1, 500), Some(42));
        assert_eq!(parse_env_u64_with_bounds(Some("9999".into()), 1, 500), Some(500));
        assert_eq!(parse_env_u64_with_bounds(Some("many".into()), 1, 500), None);
        assert_eq!(parse_env_u64_with_bounds(None, 1, 500), None);
    }

    #[test]
    fn budget_overrides_use_their_own_bounds() {
        let overrides = budget_overrides_from_raw(Some("10".into()), Some("50".into()));
        assert_eq!(overrides.max_pages, Some(10));
        assert_eq!(overrides.soft_timeout_ms, Some(SOFT_TIMEOUT_OVERRIDE_MIN_MS));
        assert!(budget_overrides_from_raw(None, Some("x".into())).is_empty());
    }

    #[test]
    fn explicit_api_key_wins() {
        assert_eq!(resolve_api_key(Some("  key-1 ")), Some("key-1".to_string()));
    }

    #[test]
    fn api_url_falls_back_to_stored_then_default() {
        let stored = || {
            Some(StoredCredentials {
                api_key: "abc".to_string(),
                api_url: Some("https://proxy.example.com/api/v2/".to_string()),
            })
        };
        assert_eq!(
            api_url_from(Some("http://localhost:9000/api/v2"), stored()),
            "http://localhost:9000/api/v2"
        );
        assert_eq!(api_url_from(None, stored()), "https://proxy.example.com/api/v2");
        assert_eq!(api_url_from(Some("  "), stored()), "https://proxy.example.com/api/v2");
        assert_eq!(api_url_from(None, None), DEFAULT_API_URL);
    }

    #[test]
    fn stored_credentials_tolerate_missing_url() {
        let creds: StoredCredentials = serde_json::from_str(r#"{"api_key":"abc"}"#).unwrap();
        assert_eq!(creds.api_key, "abc");
        assert!(creds.api_url.is_none());
    }
}
