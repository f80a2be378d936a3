// Metis backend: runtime configuration
//
// Everything is read from the environment once at startup (after `.env` is
// loaded by `dotenvy`) and frozen into an `AppConfig` that handlers share.

use std::time::Duration;

use crate::model_registry::ModelRoster;

pub const DEFAULT_DASHBOARD: &str = "accurate-sales";
pub const DEFAULT_OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api/v1";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionBackend {
    Postgres,
    Memory,
}

/// Limits shared by the gateway and the query guard.
#[derive(Debug, Clone)]
pub struct AssistantLimits {
    /// Model turns allowed per attempt (tool calls + final answer).
    pub step_budget: usize,
    /// Hard cap on rows handed back to the model per query.
    pub row_cap: usize,
    pub query_timeout: Duration,
    /// How long a candidate may take to produce its first event.
    pub first_output_timeout: Duration,
    /// Max silence between chunks once a stream is committed.
    pub stream_idle_timeout: Duration,
}

impl Default for AssistantLimits {
    fn default() -> Self {
        Self {
            step_budget: 5,
            row_cap: 200,
            query_timeout: Duration::from_secs(30),
            first_output_timeout: Duration::from_secs(30),
            stream_idle_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub analytics_database_url: String,
    pub openrouter_api_key: Option<String>,
    pub openrouter_base_url: String,
    pub roster: ModelRoster,
    pub limits: AssistantLimits,
    pub session_backend: SessionBackend,
    pub port: u16,
    pub allowed_origins: Vec<String>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup so tests don't have to touch the
    /// process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let database_url = get("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?;
        let analytics_database_url =
            get("ANALYTICS_DATABASE_URL").unwrap_or_else(|| database_url.clone());

        let roster = match get("METIS_MODELS") {
            Some(list) => ModelRoster::from_ids(list.split(',')).map_err(|_| ConfigError::Invalid {
                key: "METIS_MODELS",
                value: list.clone(),
            })?,
            None => ModelRoster::default(),
        };

        let defaults = AssistantLimits::default();
        let limits = AssistantLimits {
            step_budget: parse_or(&get, "METIS_STEP_BUDGET", defaults.step_budget)?.max(1),
            row_cap: parse_or(&get, "METIS_QUERY_ROW_CAP", defaults.row_cap)?.max(1),
            query_timeout: secs_or(&get, "METIS_QUERY_TIMEOUT_SECS", defaults.query_timeout)?,
            first_output_timeout: secs_or(
                &get,
                "METIS_FIRST_OUTPUT_TIMEOUT_SECS",
                defaults.first_output_timeout,
            )?,
            stream_idle_timeout: secs_or(
                &get,
                "METIS_STREAM_IDLE_TIMEOUT_SECS",
                defaults.stream_idle_timeout,
            )?,
        };

        let session_backend = match get("METIS_SESSION_STORE").as_deref() {
            None | Some("postgres") => SessionBackend::Postgres,
            Some("memory") => SessionBackend::Memory,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    key: "METIS_SESSION_STORE",
                    value: other.to_string(),
                });
            }
        };

        let allowed_origins = get("ALLOWED_ORIGINS")
            .map(|s| {
                s.split(',')
                    .map(|o| o.trim().to_string())
                    .filter(|o| !o.is_empty())
                    .collect()
            })
            .unwrap_or_else(|| {
                vec![
                    "http://localhost:3000".to_string(),
                    "http://127.0.0.1:3000".to_string(),
                ]
            });

        Ok(Self {
            database_url,
            analytics_database_url,
            openrouter_api_key: get("OPENROUTER_API_KEY"),
            openrouter_base_url: get("OPENROUTER_BASE_URL")
                .unwrap_or_else(|| DEFAULT_OPENROUTER_BASE_URL.to_string()),
            roster,
            limits,
            session_backend,
            port: parse_or(&get, "PORT", 8081u16)?,
            allowed_origins,
        })
    }
}

fn parse_or<G, T>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    G: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value: raw }),
        None => Ok(default),
    }
}

fn secs_or<G>(get: &G, key: &'static str, default: Duration) -> Result<Duration, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    parse_or(get, key, default.as_secs()).map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn database_url_is_required() {
        let err = AppConfig::from_lookup(lookup(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("DATABASE_URL")));
    }

    #[test]
    fn defaults_apply() {
        let cfg = AppConfig::from_lookup(lookup(&[("DATABASE_URL", "postgres://x/db")])).unwrap();
        assert_eq!(cfg.analytics_database_url, "postgres://x/db");
        assert_eq!(cfg.limits.step_budget, 5);
        assert_eq!(cfg.limits.row_cap, 200);
        assert_eq!(cfg.port, 8081);
        assert_eq!(cfg.session_backend, SessionBackend::Postgres);
        assert_eq!(cfg.roster.len(), 4);
        assert_eq!(cfg.openrouter_base_url, DEFAULT_OPENROUTER_BASE_URL);
        assert!(cfg.openrouter_api_key.is_none());
    }

    #[test]
    fn overrides_are_parsed() {
        let cfg = AppConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://x/db"),
            ("ANALYTICS_DATABASE_URL", "postgres://ro/dw"),
            ("METIS_MODELS", "acme/alpha:free, acme/beta"),
            ("METIS_STEP_BUDGET", "3"),
            ("METIS_SESSION_STORE", "memory"),
            ("ALLOWED_ORIGINS", "https://dash.example.com, "),
        ]))
        .unwrap();
        assert_eq!(cfg.analytics_database_url, "postgres://ro/dw");
        assert_eq!(cfg.roster.len(), 2);
        assert_eq!(cfg.roster.primary().id, "acme/alpha:free");
        assert_eq!(cfg.limits.step_budget, 3);
        assert_eq!(cfg.session_backend, SessionBackend::Memory);
        assert_eq!(cfg.allowed_origins, vec!["https://dash.example.com".to_string()]);
    }

    #[test]
    fn bad_numbers_are_rejected() {
        let err = AppConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://x/db"),
            ("PORT", "eighty"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "PORT", .. }));
    }
}
