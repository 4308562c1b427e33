// Runtime configuration, read once from the environment at startup

use chrono_tz::Tz;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

use crate::feed_client::AccessPath;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub feed_base: String,
    pub access_paths: Vec<AccessPath>,
    pub poll_interval: Duration,
    pub request_timeout: Duration,
    pub timezone: Tz,
    /// None keeps destination memory for the whole session
    pub destination_evict_after: Option<u32>,
    pub proxy_allowed_prefix: String,
}

impl Config {
    const BIND_ADDR: &'static str = "0.0.0.0:8080";
    const FEED_BASE: &'static str = "https://webservices.umoiq.com/service/publicXMLFeed?a=ttc";
    const ACCESS_PATHS: &'static str = "https://api.allorigins.win/raw?url=,https://corsproxy.io/?,direct";
    const POLL_SECS: u64 = 5;
    const REQUEST_TIMEOUT_SECS: u64 = 15;
    const TIMEZONE: Tz = chrono_tz::America::Toronto;
    const PROXY_ALLOWED_PREFIX: &'static str = "https://webservices.umoiq.com/";

    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let access_paths = lookup("TTC_ACCESS_PATHS")
            .unwrap_or_else(|| Self::ACCESS_PATHS.to_string());

        Config {
            bind_addr: lookup("TTC_BIND_ADDR").unwrap_or_else(|| Self::BIND_ADDR.to_string()),
            feed_base: lookup("TTC_FEED_BASE").unwrap_or_else(|| Self::FEED_BASE.to_string()),
            access_paths: AccessPath::parse_list(&access_paths),
            poll_interval: Duration::from_secs(
                parse_or("TTC_POLL_SECS", lookup("TTC_POLL_SECS"), Self::POLL_SECS).max(1),
            ),
            request_timeout: Duration::from_secs(parse_or(
                "TTC_REQUEST_TIMEOUT_SECS",
                lookup("TTC_REQUEST_TIMEOUT_SECS"),
                Self::REQUEST_TIMEOUT_SECS,
            )),
            timezone: parse_or("TTC_TIMEZONE", lookup("TTC_TIMEZONE"), Self::TIMEZONE),
            destination_evict_after: match parse_or(
                "TTC_DESTINATION_EVICT_AFTER",
                lookup("TTC_DESTINATION_EVICT_AFTER"),
                0u32,
            ) {
                0 => None,
                n => Some(n),
            },
            proxy_allowed_prefix: lookup("TTC_PROXY_ALLOWED_PREFIX")
                .unwrap_or_else(|| Self::PROXY_ALLOWED_PREFIX.to_string()),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

fn parse_or<T: FromStr>(key: &str, raw: Option<String>, default: T) -> T {
    match raw {
        None => default,
        Some(value) => value.trim().parse().unwrap_or_else(|_| {
            warn!("⚠️  Ignoring invalid {}={:?}, using default", key, value);
            default
        }),
    }
}
