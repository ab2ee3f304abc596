//! Environment-driven configuration. Every knob has a default except
//! the upstream auth URL and the gateway secret, which have no safe
//! fallback.

use std::str::FromStr;

use crate::constants::app_constants::*;
use crate::models::{Result, TickwatchError};

#[derive(Debug, Clone)]
pub struct Config {
    pub mongo_url: String,
    pub mongo_db: String,
    pub redis_url: String,
    pub feed_auth_url: String,
    pub session_bind: String,
    pub gateway_secret: String,
    pub email_webhook_url: Option<String>,
    pub chat_webhook_url: Option<String>,
    pub push_webhook_url: Option<String>,
    pub engine_workers: usize,
    pub email_rate_per_sec: u32,
    pub chat_rate_per_sec: u32,
}

fn env_or(key: &str, fallback: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| fallback.to_owned())
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn require(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| TickwatchError::config(format!("{} must be set", key)))
}

fn parse_or<T: FromStr + Copy>(key: &str, fallback: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(fallback)
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Config {
            mongo_url: env_or("TICKWATCH_MONGO_URL", "mongodb://127.0.0.1:27017"),
            mongo_db: env_or("TICKWATCH_MONGO_DB", "tickwatch"),
            redis_url: env_or("TICKWATCH_REDIS_URL", "redis://127.0.0.1:6379"),
            feed_auth_url: require("TICKWATCH_FEED_AUTH_URL")?,
            session_bind: env_or("TICKWATCH_SESSION_BIND", "0.0.0.0:4001"),
            gateway_secret: require("TICKWATCH_GATEWAY_SECRET")?,
            email_webhook_url: env_opt("TICKWATCH_EMAIL_WEBHOOK_URL"),
            chat_webhook_url: env_opt("TICKWATCH_CHAT_WEBHOOK_URL"),
            push_webhook_url: env_opt("TICKWATCH_PUSH_WEBHOOK_URL"),
            engine_workers: parse_or("TICKWATCH_ENGINE_WORKERS", DEFAULT_ENGINE_WORKERS),
            email_rate_per_sec: parse_or("TICKWATCH_EMAIL_RATE", DEFAULT_EMAIL_RATE_PER_SEC),
            chat_rate_per_sec: parse_or("TICKWATCH_CHAT_RATE", DEFAULT_CHAT_RATE_PER_SEC),
        })
    }
}
