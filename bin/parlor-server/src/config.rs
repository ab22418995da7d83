//! Server configuration, loaded from environment variables at startup.

use std::time::Duration;

use parlor_core::OrchestratorSettings;
use parlor_core::upstream::openai::OpenAiConfig;

const DEFAULT_SYSTEM_PROMPT: &str =
    "You are a helpful assistant taking part in a group chat. Keep answers concise.";

/// Runtime configuration for parlor-server.
///
/// Every field has a default so the server starts without any environment
/// variables set (it will fail upstream calls until a provider key is given).
#[derive(Debug, Clone)]
pub struct Config {
    /// TCP address to bind (default: `"0.0.0.0:3000"`).
    pub bind_address: String,

    /// sqlx SQLite URL (default: `"sqlite://parlor.db"`).
    pub database_url: String,
    pub db_max_connections: u32,

    /// `tracing` filter string, e.g. `"info"` or `"debug,tower_http=warn"`.
    pub log_level: String,
    /// When `true`, emit log records as newline-delimited JSON.
    pub log_json: bool,
    /// Directory for daily-rotated log files; stdout only when unset.
    pub log_dir: Option<String>,

    /// Comma-separated allowed CORS origins; wildcard when unset.
    pub cors_allowed_origins: Option<String>,

    pub provider_url: String,
    pub provider_api_key: Option<String>,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub system_prompt: String,
    pub default_assistant_name: String,
    pub max_prompt_bytes: usize,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,

    /// How long shutdown waits for cancelled operations to finalize.
    pub shutdown_grace: Duration,
}

impl Config {
    /// Build [`Config`] from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build [`Config`] from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let env_or = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_owned());
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        Self {
            bind_address: env_or("PARLOR_BIND", "0.0.0.0:3000"),
            database_url: env_or("PARLOR_DATABASE_URL", "sqlite://parlor.db"),
            db_max_connections: parse_or(&lookup, "PARLOR_DB_MAX_CONNECTIONS", 5),
            log_level: env_or("PARLOR_LOG", "info"),
            log_json: lookup("PARLOR_LOG_JSON")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            log_dir: non_empty("PARLOR_LOG_DIR"),
            cors_allowed_origins: non_empty("PARLOR_CORS_ORIGINS"),
            provider_url: env_or("PARLOR_PROVIDER_URL", "https://api.openai.com/v1"),
            provider_api_key: non_empty("PARLOR_PROVIDER_API_KEY"),
            model: env_or("PARLOR_MODEL", "gpt-4o-mini"),
            temperature: parse_or(&lookup, "PARLOR_TEMPERATURE", 0.7),
            max_tokens: parse_or(&lookup, "PARLOR_MAX_TOKENS", 1024),
            system_prompt: env_or("PARLOR_SYSTEM_PROMPT", DEFAULT_SYSTEM_PROMPT),
            default_assistant_name: env_or("PARLOR_DEFAULT_ASSISTANT_NAME", "Assistant"),
            max_prompt_bytes: parse_or(&lookup, "PARLOR_MAX_PROMPT_BYTES", 128 * 1024),
            connect_timeout: Duration::from_secs(parse_or(
                &lookup,
                "PARLOR_CONNECT_TIMEOUT_SECS",
                10,
            )),
            read_timeout: Duration::from_secs(parse_or(&lookup, "PARLOR_READ_TIMEOUT_SECS", 120)),
            shutdown_grace: Duration::from_secs(parse_or(
                &lookup,
                "PARLOR_SHUTDOWN_GRACE_SECS",
                10,
            )),
        }
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            model_id: self.model.clone(),
            system_prompt: self.system_prompt.clone(),
            default_assistant_name: self.default_assistant_name.clone(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            max_prompt_bytes: self.max_prompt_bytes,
        }
    }

    pub fn provider_config(&self) -> OpenAiConfig {
        OpenAiConfig {
            base_url: self.provider_url.clone(),
            api_key: self.provider_api_key.clone(),
            connect_timeout: self.connect_timeout,
            read_timeout: self.read_timeout,
        }
    }
}

// ── private helpers ──────────────────────────────────────────────────────────

fn parse_or<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> T {
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;

    use super::*;

    fn config(pairs: &[(&str, &str)]) -> Config {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_apply_without_environment() {
        let cfg = config(&[]);
        assert_eq!(cfg.bind_address, "0.0.0.0:3000");
        assert_eq!(cfg.database_url, "sqlite://parlor.db");
        assert_eq!(cfg.model, "gpt-4o-mini");
        assert_eq!(cfg.max_prompt_bytes, 131072);
        assert_eq!(cfg.shutdown_grace, Duration::from_secs(10));
        assert!(cfg.provider_api_key.is_none());
        assert!(!cfg.log_json);
    }

    #[test]
    fn values_are_read_and_parsed() {
        let cfg = config(&[
            ("PARLOR_MODEL", "local-7b"),
            ("PARLOR_TEMPERATURE", "0.2"),
            ("PARLOR_MAX_TOKENS", " 256 "),
            ("PARLOR_LOG_JSON", "TRUE"),
            ("PARLOR_PROVIDER_API_KEY", "sk-test"),
        ]);
        assert_eq!(cfg.model, "local-7b");
        assert!((cfg.temperature - 0.2).abs() < f32::EPSILON);
        assert_eq!(cfg.max_tokens, 256);
        assert!(cfg.log_json);
        assert_eq!(cfg.provider_config().api_key.as_deref(), Some("sk-test"));
        assert_eq!(cfg.orchestrator_settings().model_id, "local-7b");
    }

    #[test]
    fn unparsable_and_blank_values_fall_back() {
        let cfg = config(&[
            ("PARLOR_MAX_TOKENS", "lots"),
            ("PARLOR_PROVIDER_API_KEY", "  "),
            ("PARLOR_CORS_ORIGINS", ""),
        ]);
        assert_eq!(cfg.max_tokens, 1024);
        assert!(cfg.provider_api_key.is_none());
        assert!(cfg.cors_allowed_origins.is_none());
    }
}
