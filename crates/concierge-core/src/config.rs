use std::{env, fs, path::Path, time::Duration};

use crate::{
    admission::{AdmissionConfig, BucketConfig, StoreFailurePolicy, WindowConfig},
    errors::Error,
    Result,
};

/// Deployment flavour; controls log formatting.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    fn parse(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "prod" | "production" => Environment::Production,
            _ => Environment::Development,
        }
    }
}

/// Typed configuration, read from the process environment (and `.env`).
#[derive(Clone, Debug)]
pub struct Config {
    pub telegram_bot_token: String,
    pub environment: Environment,
    pub log_level: String,

    // Admission control
    pub admission: AdmissionConfig,
    /// When set, the window counter is shared through Valkey at this URL;
    /// otherwise it lives in process memory.
    pub valkey_url: Option<String>,
    pub valkey_timeout: Duration,
    /// Upper bound for a single outbound call including admission wait.
    pub send_timeout: Duration,

    // Lifecycle
    pub shutdown_timeout: Duration,
}

impl Config {
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));
        Self::from_lookup(env_str)
    }

    /// Build a config from an arbitrary key lookup (the environment in production).
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let str_of = |key: &str| get(key).and_then(non_empty);
        let u64_of = |key: &str| str_of(key).and_then(|s| s.trim().parse::<u64>().ok());
        let u32_of = |key: &str| str_of(key).and_then(|s| s.trim().parse::<u32>().ok());
        let f64_of = |key: &str| {
            str_of(key)
                .and_then(|s| s.trim().parse::<f64>().ok())
                .filter(|v| *v > 0.0)
        };
        let bool_of = |key: &str| {
            str_of(key).map(|s| {
                matches!(
                    s.trim().to_lowercase().as_str(),
                    "1" | "true" | "yes" | "on"
                )
            })
        };

        let telegram_bot_token = str_of("BOT_TOKEN").ok_or_else(|| {
            Error::Config("BOT_TOKEN environment variable is required".to_string())
        })?;

        let environment = str_of("ENVIRONMENT")
            .map(|s| Environment::parse(&s))
            .unwrap_or(Environment::Development);
        let log_level = str_of("LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        let defaults = AdmissionConfig::default();
        let global = BucketConfig {
            rate_per_sec: f64_of("RATE_GLOBAL_PER_SEC").unwrap_or(defaults.global.rate_per_sec),
            burst: u32_of("RATE_GLOBAL_BURST").unwrap_or(defaults.global.burst),
        };
        let per_key = BucketConfig {
            rate_per_sec: f64_of("RATE_CHAT_PER_SEC").unwrap_or(defaults.per_key.rate_per_sec),
            burst: u32_of("RATE_CHAT_BURST").unwrap_or(defaults.per_key.burst),
        };
        let window_defaults = WindowConfig::default();
        let window = WindowConfig {
            limit: u64_of("RATE_WINDOW_LIMIT").unwrap_or(window_defaults.limit),
            window: u64_of("RATE_WINDOW_SECS")
                .map(Duration::from_secs)
                .unwrap_or(window_defaults.window),
        };
        let store_failure = if bool_of("RATE_STORE_FAIL_OPEN").unwrap_or(false) {
            StoreFailurePolicy::FailOpen
        } else {
            StoreFailurePolicy::Propagate
        };

        if global.burst == 0 || per_key.burst == 0 {
            return Err(Error::Config(
                "rate limiter bursts must be at least 1".to_string(),
            ));
        }
        if window.limit == 0 || window.window.is_zero() {
            return Err(Error::Config(
                "RATE_WINDOW_LIMIT and RATE_WINDOW_SECS must be positive".to_string(),
            ));
        }

        let valkey_url = str_of("VALKEY_URL");
        let valkey_timeout = Duration::from_millis(u64_of("VALKEY_TIMEOUT_MS").unwrap_or(500));
        let send_timeout = Duration::from_millis(u64_of("SEND_TIMEOUT_MS").unwrap_or(10_000));
        let shutdown_timeout = Duration::from_secs(u64_of("SHUTDOWN_TIMEOUT_SECS").unwrap_or(30));

        Ok(Self {
            telegram_bot_token,
            environment,
            log_level,
            admission: AdmissionConfig {
                global,
                per_key,
                window,
                store_failure,
            },
            valkey_url,
            valkey_timeout,
            send_timeout,
            shutdown_timeout,
        })
    }
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }
        if env::var_os(key).is_some() {
            continue; // do not override existing env
        }

        env::set_var(key, unquote(v.trim()));
    }
}

fn unquote(val: &str) -> &str {
    if val.len() >= 2
        && ((val.starts_with('"') && val.ends_with('"'))
            || (val.starts_with('\'') && val.ends_with('\'')))
    {
        &val[1..val.len() - 1]
    } else {
        val
    }
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}
