//! Configuration module
//!
//! Settings are read from the environment (optionally seeded from a `.env`
//! file) with defaults for everything except the database URL.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::models::{DeliveryOptions, Priority};

const SERVER_PORT: u16 = 8080;
const MAX_CONNECTIONS: u32 = 20;
const CONNECTION_TIMEOUT_SECS: u64 = 30;
const TASK_QUEUE_MAX_WORKERS: usize = 10;
const TASK_QUEUE_POLL_INTERVAL_MS: u64 = 1000;
const STALE_TASK_REAP_INTERVAL_SECS: u64 = 60;
const STALE_TASK_GRACE_PERIOD_SECS: i64 = 300;
const VERIFY_EMAIL_MAX_RETRY: i32 = 10;
const VERIFY_EMAIL_TIMEOUT_SECS: u64 = 10;
const VERIFY_EMAIL_DELAY_SECS: u64 = 10;
const VERIFY_EMAIL_TTL_SECS: i64 = 900;
const MAX_VERIFY_EMAIL_TTL_SECS: i64 = 30 * 24 * 3600;
const OUTBOX_RELAY_INTERVAL_MS: u64 = 500;
const OUTBOX_RELAY_BATCH_SIZE: i64 = 50;
const SMTP_PORT: u16 = 587;

/// How the registration flow couples the user insert to the task enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EnqueuePolicy {
    /// Commit the user, then enqueue. A crash between the two drops the task.
    #[default]
    AfterCommit,
    /// Write an outbox row in the user's transaction; a relay enqueues it later.
    Outbox,
}

impl FromStr for EnqueuePolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "after_commit" => Ok(EnqueuePolicy::AfterCommit),
            "outbox" => Ok(EnqueuePolicy::Outbox),
            other => Err(anyhow::anyhow!(
                "Invalid ENQUEUE_POLICY '{}', expected after_commit or outbox",
                other
            )),
        }
    }
}

/// What registration does when the queue cannot be reached after commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EnqueueFailureMode {
    /// Report the registration as failed.
    #[default]
    Fail,
    /// Log and return the created user without a verification email.
    Degrade,
}

impl FromStr for EnqueueFailureMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "fail" => Ok(EnqueueFailureMode::Fail),
            "degrade" => Ok(EnqueueFailureMode::Degrade),
            other => Err(anyhow::anyhow!(
                "Invalid ENQUEUE_FAILURE_MODE '{}', expected fail or degrade",
                other
            )),
        }
    }
}

#[derive(Clone, Debug)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
    pub from: String,
    pub tls: bool,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub server_port: u16,
    pub environment: String,
    pub log_format: String,
    pub database_url: String,
    pub db_max_connections: u32,
    pub db_timeout_seconds: u64,
    // Task queue
    pub task_queue_max_workers: usize,
    pub task_queue_poll_interval_ms: u64,
    pub task_queue_stale_task_reap_interval_secs: u64,
    pub task_queue_stale_task_grace_period_secs: i64,
    // Verification email task
    pub verify_email_max_retry: i32,
    pub verify_email_timeout_secs: u64,
    pub verify_email_delay_secs: u64,
    pub verify_email_priority: Priority,
    pub verify_email_ttl_secs: i64,
    pub verify_email_base_url: String,
    // Registration coupling
    pub enqueue_policy: EnqueuePolicy,
    pub enqueue_failure_mode: EnqueueFailureMode,
    pub outbox_relay_interval_ms: u64,
    pub outbox_relay_batch_size: i64,
    pub smtp: Option<SmtpConfig>,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim().to_lowercase().as_str(), "true" | "1" | "yes"))
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Result<Self, anyhow::Error> {
        dotenvy::dotenv().ok();

        let database_url = env::var("DATABASE_URL")
            .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;

        let environment = env::var("ENVIRONMENT")
            .or_else(|_| env::var("APP_ENV"))
            .unwrap_or_else(|_| "development".to_string());

        let verify_email_priority = match env::var("VERIFY_EMAIL_PRIORITY") {
            Ok(value) => value.parse::<Priority>()?,
            Err(_) => Priority::Critical,
        };
        let enqueue_policy = match env::var("ENQUEUE_POLICY") {
            Ok(value) => value.parse::<EnqueuePolicy>()?,
            Err(_) => EnqueuePolicy::default(),
        };
        let enqueue_failure_mode = match env::var("ENQUEUE_FAILURE_MODE") {
            Ok(value) => value.parse::<EnqueueFailureMode>()?,
            Err(_) => EnqueueFailureMode::default(),
        };

        let smtp = match (env::var("SMTP_HOST").ok(), env::var("SMTP_FROM").ok()) {
            (Some(host), Some(from)) => Some(SmtpConfig {
                host,
                port: env_or("SMTP_PORT", SMTP_PORT),
                user: env::var("SMTP_USER").ok(),
                password: env::var("SMTP_PASSWORD").ok(),
                from,
                tls: env_bool("SMTP_TLS", true),
            }),
            _ => None,
        };

        let config = Config {
            server_port: env_or("SERVER_PORT", SERVER_PORT),
            environment,
            log_format: env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string()),
            database_url,
            db_max_connections: env_or("DB_MAX_CONNECTIONS", MAX_CONNECTIONS),
            db_timeout_seconds: env_or("DB_TIMEOUT_SECONDS", CONNECTION_TIMEOUT_SECS),
            task_queue_max_workers: env_or("TASK_QUEUE_MAX_WORKERS", TASK_QUEUE_MAX_WORKERS),
            task_queue_poll_interval_ms: env_or(
                "TASK_QUEUE_POLL_INTERVAL_MS",
                TASK_QUEUE_POLL_INTERVAL_MS,
            ),
            task_queue_stale_task_reap_interval_secs: env_or(
                "TASK_QUEUE_STALE_TASK_REAP_INTERVAL_SECS",
                STALE_TASK_REAP_INTERVAL_SECS,
            ),
            task_queue_stale_task_grace_period_secs: env_or(
                "TASK_QUEUE_STALE_TASK_GRACE_PERIOD_SECS",
                STALE_TASK_GRACE_PERIOD_SECS,
            ),
            verify_email_max_retry: env_or("VERIFY_EMAIL_MAX_RETRY", VERIFY_EMAIL_MAX_RETRY),
            verify_email_timeout_secs: env_or(
                "VERIFY_EMAIL_TIMEOUT_SECS",
                VERIFY_EMAIL_TIMEOUT_SECS,
            ),
            verify_email_delay_secs: env_or("VERIFY_EMAIL_DELAY_SECS", VERIFY_EMAIL_DELAY_SECS),
            verify_email_priority,
            verify_email_ttl_secs: env_or("VERIFY_EMAIL_TTL_SECS", VERIFY_EMAIL_TTL_SECS),
            verify_email_base_url: env::var("VERIFY_EMAIL_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:8080/v1".to_string()),
            enqueue_policy,
            enqueue_failure_mode,
            outbox_relay_interval_ms: env_or("OUTBOX_RELAY_INTERVAL_MS", OUTBOX_RELAY_INTERVAL_MS),
            outbox_relay_batch_size: env_or("OUTBOX_RELAY_BATCH_SIZE", OUTBOX_RELAY_BATCH_SIZE),
            smtp,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.task_queue_max_workers == 0 {
            return Err(anyhow::anyhow!("TASK_QUEUE_MAX_WORKERS must be at least 1"));
        }
        if self.task_queue_poll_interval_ms == 0 {
            return Err(anyhow::anyhow!("TASK_QUEUE_POLL_INTERVAL_MS must be > 0"));
        }
        if !(1..=MAX_VERIFY_EMAIL_TTL_SECS).contains(&self.verify_email_ttl_secs) {
            return Err(anyhow::anyhow!(
                "VERIFY_EMAIL_TTL_SECS must be between 1 and {}",
                MAX_VERIFY_EMAIL_TTL_SECS
            ));
        }
        if self.outbox_relay_batch_size <= 0 {
            return Err(anyhow::anyhow!("OUTBOX_RELAY_BATCH_SIZE must be > 0"));
        }
        self.verify_email_options()
            .validate()
            .map_err(|e| anyhow::anyhow!("Invalid verification email delivery options: {}", e))?;
        if self.is_production() && self.smtp.is_none() {
            return Err(anyhow::anyhow!(
                "SMTP_HOST and SMTP_FROM must be set in production"
            ));
        }
        Ok(())
    }

    pub fn is_production(&self) -> bool {
        matches!(
            self.environment.to_lowercase().as_str(),
            "production" | "prod"
        )
    }

    /// Delivery options for the verification email envelope.
    pub fn verify_email_options(&self) -> DeliveryOptions {
        let mut options = DeliveryOptions::new(
            self.verify_email_max_retry,
            Duration::from_secs(self.verify_email_timeout_secs),
        )
        .with_priority(self.verify_email_priority);
        if self.verify_email_delay_secs > 0 {
            options = options.with_process_in(Duration::from_secs(self.verify_email_delay_secs));
        }
        options
    }

    /// Lifetime of a verification record; out-of-range values (rejected by
    /// `validate`) fall back to the default.
    pub fn verify_email_ttl(&self) -> chrono::TimeDelta {
        chrono::TimeDelta::try_seconds(self.verify_email_ttl_secs)
            .filter(|_| (1..=MAX_VERIFY_EMAIL_TTL_SECS).contains(&self.verify_email_ttl_secs))
            .unwrap_or_else(|| chrono::TimeDelta::seconds(VERIFY_EMAIL_TTL_SECS))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Config {
        Config {
            server_port: SERVER_PORT,
            environment: "development".to_string(),
            log_format: "text".to_string(),
            database_url: "postgresql://localhost/enroll".to_string(),
            db_max_connections: MAX_CONNECTIONS,
            db_timeout_seconds: CONNECTION_TIMEOUT_SECS,
            task_queue_max_workers: TASK_QUEUE_MAX_WORKERS,
            task_queue_poll_interval_ms: TASK_QUEUE_POLL_INTERVAL_MS,
            task_queue_stale_task_reap_interval_secs: STALE_TASK_REAP_INTERVAL_SECS,
            task_queue_stale_task_grace_period_secs: STALE_TASK_GRACE_PERIOD_SECS,
            verify_email_max_retry: VERIFY_EMAIL_MAX_RETRY,
            verify_email_timeout_secs: VERIFY_EMAIL_TIMEOUT_SECS,
            verify_email_delay_secs: VERIFY_EMAIL_DELAY_SECS,
            verify_email_priority: Priority::Critical,
            verify_email_ttl_secs: VERIFY_EMAIL_TTL_SECS,
            verify_email_base_url: "http://localhost:8080/v1".to_string(),
            enqueue_policy: EnqueuePolicy::AfterCommit,
            enqueue_failure_mode: EnqueueFailureMode::Fail,
            outbox_relay_interval_ms: OUTBOX_RELAY_INTERVAL_MS,
            outbox_relay_batch_size: OUTBOX_RELAY_BATCH_SIZE,
            smtp: None,
        }
    }

    #[test]
    fn default_config_is_valid() {
        assert!(base().validate().is_ok());
    }

    #[test]
    fn verify_email_options_follow_settings() {
        let options = base().verify_email_options();
        assert_eq!(options.max_retry, 10);
        assert_eq!(options.timeout, Duration::from_secs(10));
        assert_eq!(options.priority, Priority::Critical);
        assert_eq!(options.process_in, Some(Duration::from_secs(10)));

        let mut config = base();
        config.verify_email_delay_secs = 0;
        assert_eq!(config.verify_email_options().process_in, None);
    }

    #[test]
    fn rejects_invalid_delivery_settings() {
        let mut config = base();
        config.verify_email_max_retry = -1;
        assert!(config.validate().is_err());

        let mut config = base();
        config.verify_email_timeout_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn out_of_range_ttl_is_rejected_without_panicking() {
        let mut config = base();
        config.verify_email_ttl_secs = i64::MAX;
        assert!(config.validate().is_err());
        assert_eq!(config.verify_email_ttl(), chrono::TimeDelta::seconds(VERIFY_EMAIL_TTL_SECS));

        config.verify_email_ttl_secs = 0;
        assert!(config.validate().is_err());

        config.verify_email_ttl_secs = 3600;
        assert!(config.validate().is_ok());
        assert_eq!(config.verify_email_ttl(), chrono::TimeDelta::hours(1));
    }

    #[test]
    fn production_requires_smtp() {
        let mut config = base();
        config.environment = "production".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn parses_policies() {
        assert_eq!("outbox".parse::<EnqueuePolicy>().unwrap(), EnqueuePolicy::Outbox);
        assert_eq!(
            "AFTER_COMMIT".parse::<EnqueuePolicy>().unwrap(),
            EnqueuePolicy::AfterCommit
        );
        assert!("two_phase".parse::<EnqueuePolicy>().is_err());
        assert_eq!(
            "degrade".parse::<EnqueueFailureMode>().unwrap(),
            EnqueueFailureMode::Degrade
        );
    }
}
