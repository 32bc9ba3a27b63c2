use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::pipeline::PipelineOptions;
use crate::retry::RetryPolicy;
use crate::screening::RuleSet;

/// Microsoft 365 group inbox settings. Present only when the lane is enabled.
#[derive(Debug, Clone)]
pub struct MicrosoftConfig {
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: Option<String>,
    pub group_id: String,
    /// Refresh token obtained by the out-of-band consent flow. Seeds the
    /// credential store when it holds nothing for Microsoft yet.
    pub seed_refresh_token: Option<String>,
}

/// Google Drive folder settings. Present only when the lane is enabled.
#[derive(Debug, Clone)]
pub struct GoogleConfig {
    pub client_email: String,
    pub private_key_pem: String,
    pub folder_id: String,
}

#[derive(Debug, Clone)]
pub enum StateBackend {
    Postgres { database_url: String },
    Files { dir: String },
}

#[derive(Debug, Clone)]
pub struct S3Config {
    pub bucket: String,
    pub endpoint: String,
    pub access_key_id: String,
    pub secret_access_key: String,
}

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub rust_log: String,
    pub state: StateBackend,
    pub s3: S3Config,
    pub microsoft: Option<MicrosoftConfig>,
    pub google: Option<GoogleConfig>,
    pub rule_set: RuleSet,
    pub overlap_window_seconds: i64,
    pub worker_pool_size: usize,
    pub refresh_skew_seconds: i64,
    pub retry_max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub call_timeout_secs: u64,
    /// Periodic runs are off when unset.
    pub run_interval_secs: Option<u64>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // load .env if present; ignore if missing
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let env = Env { lookup };

        let state = match (env.optional("DATABASE_URL"), env.optional("STATE_DIR")) {
            (Some(database_url), _) => StateBackend::Postgres { database_url },
            (None, Some(dir)) => StateBackend::Files { dir },
            (None, None) => bail!("Set DATABASE_URL or STATE_DIR to choose a state backend"),
        };

        let microsoft = match env.optional("MS_GROUP_ID") {
            Some(group_id) => Some(MicrosoftConfig {
                tenant_id: env.require("MS_TENANT_ID")?,
                client_id: env.require("MS_CLIENT_ID")?,
                client_secret: env.optional("MS_CLIENT_SECRET"),
                group_id,
                seed_refresh_token: env.optional("MS_REFRESH_TOKEN"),
            }),
            None => None,
        };

        let google = match env.optional("GOOGLE_DRIVE_FOLDER_ID") {
            Some(folder_id) => Some(GoogleConfig {
                client_email: env.require("GOOGLE_SA_EMAIL")?,
                // Keys pasted into .env files usually carry literal "\n".
                private_key_pem: env.require("GOOGLE_SA_PRIVATE_KEY")?.replace("\\n", "\n"),
                folder_id,
            }),
            None => None,
        };
        if microsoft.is_none() && google.is_none() {
            bail!("No provider configured: set MS_GROUP_ID or GOOGLE_DRIVE_FOLDER_ID");
        }

        let score_threshold: f64 = env.parse_or("SCORE_THRESHOLD", 0.5)?;
        let rule_set = match env.optional("RULE_SET_PATH") {
            Some(path) => {
                let json = std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read rule set at '{path}'"))?;
                RuleSet::from_json(&json, score_threshold)
                    .with_context(|| format!("Invalid rule set at '{path}'"))?
            }
            None => RuleSet {
                threshold: score_threshold,
                ..RuleSet::default()
            },
        };
        rule_set.validate()?;

        let config = Config {
            port: env.parse_or("PORT", 8080)?,
            rust_log: env.optional("RUST_LOG").unwrap_or_else(|| "info".to_string()),
            state,
            s3: S3Config {
                bucket: env.require("S3_BUCKET")?,
                endpoint: env.require("S3_ENDPOINT")?,
                access_key_id: env.require("AWS_ACCESS_KEY_ID")?,
                secret_access_key: env.require("AWS_SECRET_ACCESS_KEY")?,
            },
            microsoft,
            google,
            rule_set,
            overlap_window_seconds: env.parse_or("OVERLAP_WINDOW_SECONDS", 300)?,
            worker_pool_size: env.parse_or("WORKER_POOL_SIZE", 4)?,
            refresh_skew_seconds: env.parse_or("REFRESH_SKEW_SECONDS", 120)?,
            retry_max_attempts: env.parse_or("RETRY_MAX_ATTEMPTS", 3)?,
            retry_base_delay_ms: env.parse_or("RETRY_BASE_DELAY_MS", 500)?,
            call_timeout_secs: env.parse_or("CALL_TIMEOUT_SECS", 30)?,
            run_interval_secs: env
                .optional("RUN_INTERVAL_SECS")
                .map(|v| v.parse::<u64>())
                .transpose()
                .context("RUN_INTERVAL_SECS must be a whole number of seconds")?,
        };

        if config.overlap_window_seconds < 0 {
            bail!("OVERLAP_WINDOW_SECONDS must not be negative");
        }
        if config.worker_pool_size == 0 || config.retry_max_attempts == 0 {
            bail!("WORKER_POOL_SIZE and RETRY_MAX_ATTEMPTS must be at least 1");
        }
        Ok(config)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_max_attempts,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            call_timeout: Duration::from_secs(self.call_timeout_secs),
        }
    }

    pub fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            overlap: chrono::Duration::seconds(self.overlap_window_seconds),
            worker_pool_size: self.worker_pool_size,
            retry: self.retry_policy(),
        }
    }

    pub fn refresh_skew(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.refresh_skew_seconds)
    }
}

struct Env<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn optional(&self, key: &str) -> Option<String> {
        (self.lookup)(key).filter(|v| !v.trim().is_empty())
    }

    fn require(&self, key: &str) -> Result<String> {
        self.optional(key)
            .with_context(|| format!("Required environment variable '{key}' is not set"))
    }

    fn parse_or<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: std::error::Error + Send + Sync + 'static,
    {
        match self.optional(key) {
            Some(raw) => raw
                .trim()
                .parse()
                .with_context(|| format!("'{key}' has an invalid value '{raw}'")),
            None => Ok(default),
        }
    }
}
