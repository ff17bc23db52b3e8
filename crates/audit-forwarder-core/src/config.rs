// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Process configuration: a JSON file overlaid by `LOG_FORWARDER_*`
//! environment variables. Loaded once at start-up and read-only afterwards.

use crate::errors::ConfigError;
use crate::sanitizer::{EventKinds, Policy};
use crate::scheduler::Schedule;
use crate::siem::{BatchSinkConfig, SiemDialect, DEFAULT_LEVEL};
use crate::zendesk::ZendeskConfig;
use serde_json::{Map, Value};
use std::env;
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "./config/config.json";
const CONFIG_FILE_ENV: &str = "LOG_FORWARDER_CONFIG_FILE";

const DEFAULT_MAX_ATTEMPTS: u64 = 5;
const DEFAULT_RETRY_DELAY_MS: u64 = 500;
const DEFAULT_BATCH_SIZE: u64 = 100;
const DEFAULT_BATCH_INTERVAL_MS: u64 = 1000;
const DEFAULT_AUDIT_OFFSET: u64 = 60;
const DEFAULT_TICKET_OFFSET: u64 = 30;
const DEFAULT_POLL_TIMEOUT_SECS: u64 = 300;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

#[derive(Debug, Clone)]
pub struct Config {
    pub username: String,
    pub token: String,
    /// Scheme and host of the upstream account, e.g. `https://acme.zendesk.com`
    pub hostname: String,
    /// Attempts per upstream request, including the first
    pub max_attempts: u32,
    pub retry_delay: Duration,

    pub siem: SiemDialect,
    pub siem_url: String,
    pub siem_token: Option<String>,
    pub siem_batch_size: usize,
    pub siem_batch_interval: Duration,
    pub siem_default_level: String,
    /// Queue bound; `None` lets the queue grow without limit
    pub siem_max_queue: Option<usize>,
    pub strict_ssl: bool,

    /// Whether the ticket audit track runs at all
    pub tickets: bool,
    pub ticket_policy: Policy,
    pub audit_policy: Policy,
    pub audit_schedule: Schedule,
    pub ticket_schedule: Schedule,
    /// Upper bound on one poll chain before its guard is forcibly released
    pub poll_timeout: Duration,

    /// Backfill from the beginning of time and poll immediately
    pub debug: bool,
    pub log_level: String,
}

/// File values with environment overrides. Empty, unparsable and zero
/// numbers fall through to the next source.
struct Sources {
    file: Map<String, Value>,
}

impl Sources {
    fn env(name: &str) -> Option<String> {
        env::var(name).ok().filter(|v| !v.trim().is_empty())
    }

    fn string(&self, key: &str, env_name: &str) -> Option<String> {
        Self::env(env_name).or_else(|| match self.file.get(key) {
            Some(Value::String(s)) if !s.trim().is_empty() => Some(s.clone()),
            _ => None,
        })
    }

    fn number(&self, key: &str, env_name: &str) -> Option<u64> {
        Self::env(env_name)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .filter(|n| *n > 0)
            .or_else(|| match self.file.get(key) {
                Some(Value::Number(n)) => n.as_u64(),
                Some(Value::String(s)) => s.trim().parse().ok(),
                _ => None,
            })
            .filter(|n| *n > 0)
    }

    fn flag(&self, key: &'static str, env_name: &str) -> Result<Option<bool>, ConfigError> {
        if let Some(value) = Self::env(env_name) {
            return parse_flag(&value)
                .map(Some)
                .ok_or_else(|| ConfigError::InvalidValue {
                    key,
                    reason: format!("'{value}' is not a boolean"),
                });
        }
        Ok(match self.file.get(key) {
            Some(Value::Bool(b)) => Some(*b),
            Some(Value::String(s)) => parse_flag(s),
            _ => None,
        })
    }

    fn kinds(&self, key: &str, env_name: &str, default: EventKinds) -> EventKinds {
        if let Some(value) = Self::env(env_name) {
            return EventKinds::parse(&value);
        }
        match self.file.get(key) {
            Some(Value::String(s)) => EventKinds::parse(s),
            Some(Value::Array(items)) => {
                EventKinds::from_tokens(items.iter().filter_map(Value::as_str))
            }
            _ => default,
        }
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

/// Interval settings below 1000 are taken to be seconds.
fn interval_ms(value: Option<u64>) -> Duration {
    match value {
        Some(v) if v < 1000 => Duration::from_millis(v * 1000),
        Some(v) => Duration::from_millis(v),
        None => Duration::ZERO,
    }
}

fn read_config_file(path: &str) -> Result<Map<String, Value>, ConfigError> {
    let Ok(contents) = std::fs::read_to_string(path) else {
        return Ok(Map::new());
    };
    match serde_json::from_str::<Value>(&contents) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(ConfigError::File {
            path: path.to_string(),
            reason: "expected a JSON object".to_string(),
        }),
        Err(e) => Err(ConfigError::File {
            path: path.to_string(),
            reason: e.to_string(),
        }),
    }
}

impl Config {
    /// Loads the config file named by `LOG_FORWARDER_CONFIG_FILE` (or the
    /// default path) and applies environment overrides.
    pub fn from_env() -> Result<Config, ConfigError> {
        let path = env::var(CONFIG_FILE_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());
        Self::from_file_map(read_config_file(&path)?)
    }

    pub fn from_file_map(file: Map<String, Value>) -> Result<Config, ConfigError> {
        let sources = Sources { file };

        let username = sources
            .string("username", "LOG_FORWARDER_USERNAME")
            .ok_or(ConfigError::Missing("username"))?;
        let token = sources
            .string("token", "LOG_FORWARDER_TOKEN")
            .ok_or(ConfigError::Missing("token"))?;
        let hostname = sources
            .string("hostname", "LOG_FORWARDER_HOSTNAME")
            .ok_or(ConfigError::Missing("hostname"))?;
        let siem: SiemDialect = sources
            .string("siem", "LOG_FORWARDER_SIEM")
            .ok_or(ConfigError::Missing("siem"))?
            .parse()?;
        let siem_url = sources
            .string("siemUrl", "LOG_FORWARDER_SIEM_URL")
            .ok_or(ConfigError::Missing("siemUrl"))?;
        let siem_token = sources.string("siemToken", "LOG_FORWARDER_SIEM_TOKEN");
        if siem == SiemDialect::Splunk && siem_token.is_none() {
            return Err(ConfigError::MissingSiemToken);
        }

        let max_attempts = sources
            .number("maxAttempts", "LOG_FORWARDER_MAX_ATTEMPTS")
            .unwrap_or(DEFAULT_MAX_ATTEMPTS);
        let max_attempts = u32::try_from(max_attempts).map_err(|_| ConfigError::InvalidValue {
            key: "maxAttempts",
            reason: format!("{max_attempts} is too large"),
        })?;
        let siem_batch_size = sources
            .number("siemBatchSize", "LOG_FORWARDER_SIEM_BATCH_SIZE")
            .unwrap_or(DEFAULT_BATCH_SIZE);

        let audit_interval =
            interval_ms(sources.number("auditInterval", "LOG_FORWARDER_AUDIT_INTERVAL"));
        let ticket_interval =
            interval_ms(sources.number("ticketInterval", "LOG_FORWARDER_TICKET_INTERVAL"));
        let audit_offset = sources
            .number("auditOffset", "LOG_FORWARDER_AUDIT_OFFSET")
            .unwrap_or(DEFAULT_AUDIT_OFFSET);
        let ticket_offset = sources
            .number("ticketOffset", "LOG_FORWARDER_TICKET_OFFSET")
            .unwrap_or(DEFAULT_TICKET_OFFSET);

        let log_level = sources
            .string("logLevel", "LOG_FORWARDER_LOG_LEVEL")
            .map(|level| level.to_lowercase())
            .unwrap_or_else(|| "info".to_string());

        #[allow(clippy::cast_possible_truncation)]
        let config = Config {
            username,
            token,
            hostname,
            max_attempts,
            retry_delay: Duration::from_millis(
                sources
                    .number("retryDelay", "LOG_FORWARDER_RETRY_DELAY")
                    .unwrap_or(DEFAULT_RETRY_DELAY_MS),
            ),
            siem,
            siem_url,
            siem_token,
            siem_batch_size: siem_batch_size as usize,
            siem_batch_interval: Duration::from_millis(
                sources
                    .number("siemBatchInterval", "LOG_FORWARDER_SIEM_BATCH_INTERVAL")
                    .unwrap_or(DEFAULT_BATCH_INTERVAL_MS),
            ),
            siem_default_level: sources
                .string("siemDefaultLevel", "LOG_FORWARDER_SIEM_DEFAULT_LEVEL")
                .unwrap_or_else(|| DEFAULT_LEVEL.to_string()),
            siem_max_queue: sources
                .number("siemMaxQueue", "LOG_FORWARDER_SIEM_MAX_QUEUE")
                .map(|n| n as usize),
            strict_ssl: sources
                .flag("strictSSL", "LOG_FORWARDER_STRICT_SSL")?
                .unwrap_or(true),
            tickets: sources
                .flag("tickets", "LOG_FORWARDER_TICKETS")?
                .unwrap_or(false),
            ticket_policy: Policy::new(
                sources.kinds("allowedEvents", "LOG_FORWARDER_ALLOWED_EVENTS", EventKinds::All),
                sources.kinds(
                    "sanitizedEvents",
                    "LOG_FORWARDER_SANITIZED_EVENTS",
                    EventKinds::All,
                ),
            ),
            audit_policy: Policy::new(
                sources.kinds(
                    "auditAllowedEvents",
                    "LOG_FORWARDER_AUDIT_ALLOWED_EVENTS",
                    EventKinds::All,
                ),
                sources.kinds(
                    "auditSanitizedEvents",
                    "LOG_FORWARDER_AUDIT_SANITIZED_EVENTS",
                    EventKinds::None,
                ),
            ),
            audit_schedule: Schedule::new(audit_interval, audit_offset),
            ticket_schedule: Schedule::new(ticket_interval, ticket_offset),
            poll_timeout: Duration::from_secs(
                sources
                    .number("pollTimeout", "LOG_FORWARDER_POLL_TIMEOUT")
                    .unwrap_or(DEFAULT_POLL_TIMEOUT_SECS),
            ),
            debug: sources.flag("debug", "LOG_FORWARDER_DEBUG")?.unwrap_or(false),
            log_level,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !VALID_LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(ConfigError::InvalidValue {
                key: "logLevel",
                reason: format!(
                    "'{}' must be one of: trace, debug, info, warn, error",
                    self.log_level
                ),
            });
        }
        if !self.hostname.starts_with("http://") && !self.hostname.starts_with("https://") {
            return Err(ConfigError::InvalidValue {
                key: "hostname",
                reason: format!("'{}' must include the scheme", self.hostname),
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn zendesk(&self) -> ZendeskConfig {
        ZendeskConfig {
            hostname: self.hostname.clone(),
            username: self.username.clone(),
            token: self.token.clone(),
            max_attempts: self.max_attempts,
            retry_delay: self.retry_delay,
            timeout: REQUEST_TIMEOUT,
        }
    }

    #[must_use]
    pub fn sink(&self) -> BatchSinkConfig {
        BatchSinkConfig {
            dialect: self.siem,
            url: self.siem_url.clone(),
            token: self.siem_token.clone(),
            batch_size: self.siem_batch_size,
            batch_interval: self.siem_batch_interval,
            max_queue: self.siem_max_queue,
            strict_ssl: self.strict_ssl,
            default_level: self.siem_default_level.clone(),
            timeout: REQUEST_TIMEOUT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use serial_test::serial;
    use std::io::Write;

    const ENV_VARS: [&str; 12] = [
        "LOG_FORWARDER_USERNAME",
        "LOG_FORWARDER_TOKEN",
        "LOG_FORWARDER_HOSTNAME",
        "LOG_FORWARDER_SIEM",
        "LOG_FORWARDER_SIEM_URL",
        "LOG_FORWARDER_SIEM_TOKEN",
        "LOG_FORWARDER_SIEM_BATCH_SIZE",
        "LOG_FORWARDER_TICKETS",
        "LOG_FORWARDER_SANITIZED_EVENTS",
        "LOG_FORWARDER_AUDIT_INTERVAL",
        "LOG_FORWARDER_TICKET_OFFSET",
        CONFIG_FILE_ENV,
    ];

    fn clear_env() {
        for var in ENV_VARS {
            env::remove_var(var);
        }
    }

    fn required() -> Map<String, Value> {
        match json!({
            "username": "agent@example.com",
            "token": "api-token",
            "hostname": "https://example.zendesk.com",
            "siem": "http",
            "siemUrl": "https://siem.example.com/collector"
        }) {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    #[serial]
    fn test_defaults() {
        clear_env();
        let config = Config::from_file_map(required()).unwrap();
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.retry_delay, Duration::from_millis(500));
        assert_eq!(config.siem, SiemDialect::Http);
        assert_eq!(config.siem_batch_size, 100);
        assert_eq!(config.siem_batch_interval, Duration::from_millis(1000));
        assert_eq!(config.siem_default_level, "INFO");
        assert_eq!(config.siem_max_queue, None);
        assert!(config.strict_ssl);
        assert!(!config.tickets);
        assert!(!config.debug);
        assert_eq!(
            config.ticket_policy,
            Policy::new(EventKinds::All, EventKinds::All)
        );
        assert_eq!(config.audit_policy, Policy::pass_through());
        assert_eq!(config.audit_schedule, Schedule::AtSecond(0));
        assert_eq!(config.ticket_schedule, Schedule::AtSecond(30));
        assert_eq!(config.poll_timeout, Duration::from_secs(300));
    }

    #[test]
    #[serial]
    fn test_missing_required_values() {
        clear_env();
        let mut file = required();
        file.remove("siemUrl");
        let err = Config::from_file_map(file).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("siemUrl")));

        let err = Config::from_file_map(Map::new()).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("username")));
    }

    #[test]
    #[serial]
    fn test_unsupported_siem_and_splunk_token() {
        clear_env();
        let mut file = required();
        file.insert("siem".to_string(), json!("graylog"));
        assert!(matches!(
            Config::from_file_map(file).unwrap_err(),
            ConfigError::UnsupportedSiem(_)
        ));

        let mut file = required();
        file.insert("siem".to_string(), json!("splunk"));
        assert!(matches!(
            Config::from_file_map(file.clone()).unwrap_err(),
            ConfigError::MissingSiemToken
        ));
        file.insert("siemToken".to_string(), json!("hec"));
        assert_eq!(
            Config::from_file_map(file).unwrap().siem,
            SiemDialect::Splunk
        );
    }

    #[test]
    #[serial]
    fn test_env_overrides_file() {
        clear_env();
        env::set_var("LOG_FORWARDER_HOSTNAME", "https://other.zendesk.com");
        env::set_var("LOG_FORWARDER_SIEM_BATCH_SIZE", "25");
        env::set_var("LOG_FORWARDER_TICKETS", "true");
        env::set_var("LOG_FORWARDER_SANITIZED_EVENTS", "Create,Notification");
        env::set_var("LOG_FORWARDER_TICKET_OFFSET", "75");

        let config = Config::from_file_map(required()).unwrap();
        assert_eq!(config.hostname, "https://other.zendesk.com");
        assert_eq!(config.siem_batch_size, 25);
        assert!(config.tickets);
        assert_eq!(
            config.ticket_policy.redacted,
            EventKinds::parse("Create,Notification")
        );
        assert_eq!(config.ticket_schedule, Schedule::AtSecond(15));
        clear_env();
    }

    #[test]
    #[serial]
    fn test_unparsable_numbers_fall_back() {
        clear_env();
        env::set_var("LOG_FORWARDER_SIEM_BATCH_SIZE", "lots");
        let mut file = required();
        file.insert("siemBatchSize".to_string(), json!(40));
        assert_eq!(Config::from_file_map(file).unwrap().siem_batch_size, 40);

        env::set_var("LOG_FORWARDER_SIEM_BATCH_SIZE", "0");
        assert_eq!(Config::from_file_map(required()).unwrap().siem_batch_size, 100);
        clear_env();
    }

    #[test]
    #[serial]
    fn test_intervals_in_seconds_are_scaled() {
        clear_env();
        env::set_var("LOG_FORWARDER_AUDIT_INTERVAL", "15");
        let mut file = required();
        file.insert("ticketInterval".to_string(), json!(45000));
        let config = Config::from_file_map(file).unwrap();
        assert_eq!(
            config.audit_schedule,
            Schedule::Every(Duration::from_secs(15))
        );
        assert_eq!(
            config.ticket_schedule,
            Schedule::Every(Duration::from_secs(45))
        );
        clear_env();
    }

    #[test]
    #[serial]
    fn test_kind_lists_from_file_arrays() {
        clear_env();
        let mut file = required();
        file.insert("allowedEvents".to_string(), json!(["Cc", "Notification"]));
        file.insert("sanitizedEvents".to_string(), json!(["None"]));
        let config = Config::from_file_map(file).unwrap();
        assert_eq!(
            config.ticket_policy,
            Policy::new(EventKinds::parse("Cc,Notification"), EventKinds::None)
        );
    }

    #[test]
    #[serial]
    fn test_invalid_flag_is_rejected() {
        clear_env();
        env::set_var("LOG_FORWARDER_TICKETS", "sometimes");
        let err = Config::from_file_map(required()).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key: "tickets", .. }));
        clear_env();
    }

    #[test]
    #[serial]
    fn test_from_env_reads_config_file() {
        clear_env();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}", Value::Object(required())).unwrap();
        env::set_var(CONFIG_FILE_ENV, file.path());

        let config = Config::from_env().unwrap();
        assert_eq!(config.username, "agent@example.com");
        assert_eq!(config.zendesk().hostname, "https://example.zendesk.com");
        assert_eq!(config.sink().url, "https://siem.example.com/collector");
        clear_env();
    }

    #[test]
    #[serial]
    fn test_from_env_rejects_invalid_file() {
        clear_env();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "[1, 2]").unwrap();
        env::set_var(CONFIG_FILE_ENV, file.path());
        assert!(matches!(
            Config::from_env().unwrap_err(),
            ConfigError::File { .. }
        ));
        clear_env();
    }

    #[test]
    #[serial]
    fn test_missing_file_is_empty() {
        clear_env();
        env::set_var(CONFIG_FILE_ENV, "/nonexistent/config.json");
        assert!(matches!(
            Config::from_env().unwrap_err(),
            ConfigError::Missing("username")
        ));
        clear_env();
    }
}
