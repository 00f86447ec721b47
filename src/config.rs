use std::time::Duration;

use crate::error::{Error, Result};
use crate::openhumans::DEFAULT_BASE_URL;
use crate::storage::repository;
use crate::storage::Database;
use crate::vendor::fitbit::DEFAULT_API_BASE;

/// Client secrets and service endpoints, read from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub fitbit_client_id: String,
    pub fitbit_client_secret: String,
    pub oh_client_id: String,
    pub oh_client_secret: String,
    pub oh_base_url: String,
    pub fitbit_api_base: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let required = |key: &str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| Error::Config(format!("{key} is not set")))
        };
        Ok(Self {
            fitbit_client_id: required("FITBIT_CLIENT_ID")?,
            fitbit_client_secret: required("FITBIT_CLIENT_SECRET")?,
            oh_client_id: required("OH_CLIENT_ID")?,
            oh_client_secret: required("OH_CLIENT_SECRET")?,
            oh_base_url: lookup("OH_BASE_URL").unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            fitbit_api_base: lookup("FITBIT_API_BASE").unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
        })
    }
}

/// Keys of the tunables kept in `app_config`, with their defaults.
pub const SETTING_KEYS: &[(&str, &str)] = &[
    ("realm_max_requests", "150"),
    ("realm_timespan_secs", "3600"),
    ("global_max_requests", "3600"),
    ("global_timespan_secs", "3600"),
    ("retry_delay_secs", "3600"),
    ("store_error_responses", "true"),
];

/// Sync tunables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub realm_max_requests: u32,
    pub realm_timespan: Duration,
    pub global_max_requests: u32,
    pub global_timespan: Duration,
    pub retry_delay: Duration,
    /// Keep non-200 vendor bodies as bucket data.
    pub store_error_responses: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            realm_max_requests: 150,
            realm_timespan: Duration::from_secs(3600),
            global_max_requests: 3600,
            global_timespan: Duration::from_secs(3600),
            retry_delay: Duration::from_secs(3600),
            store_error_responses: true,
        }
    }
}

fn parse_or<T: std::str::FromStr>(key: &str, value: &str, default: T) -> T {
    match value.trim().parse() {
        Ok(v) => v,
        Err(_) => {
            log::warn!("Ignoring malformed setting {key}={value:?}, using default");
            default
        }
    }
}

fn parse_bool(key: &str, value: &str, default: bool) -> bool {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => {
            log::warn!("Ignoring malformed setting {key}={value:?}, using default");
            default
        }
    }
}

impl Settings {
    /// Build from stored `(key, value)` pairs. Unknown keys are ignored.
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let mut s = Self::default();
        for (key, value) in pairs {
            match key {
                "realm_max_requests" => s.realm_max_requests = parse_or(key, value, s.realm_max_requests),
                "realm_timespan_secs" => {
                    s.realm_timespan = Duration::from_secs(parse_or(key, value, s.realm_timespan.as_secs()))
                }
                "global_max_requests" => s.global_max_requests = parse_or(key, value, s.global_max_requests),
                "global_timespan_secs" => {
                    s.global_timespan = Duration::from_secs(parse_or(key, value, s.global_timespan.as_secs()))
                }
                "retry_delay_secs" => match parse_or(key, value, s.retry_delay.as_secs()) {
                    0 => log::warn!("retry_delay_secs must be at least 1, using default"),
                    secs => s.retry_delay = Duration::from_secs(secs),
                },
                "store_error_responses" => {
                    s.store_error_responses = parse_bool(key, value, s.store_error_responses)
                }
                _ => {}
            }
        }
        s
    }

    pub async fn load(db: &Database) -> Result<Self> {
        let pairs = db.reader().call(|conn| repository::list_config(conn)).await?;
        Ok(Self::from_pairs(pairs.iter().map(|(k, v)| (k.as_str(), v.as_str()))))
    }
}

pub fn is_setting_key(key: &str) -> bool {
    SETTING_KEYS.iter().any(|(k, _)| *k == key)
}
